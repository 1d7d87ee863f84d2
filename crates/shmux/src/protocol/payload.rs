//! Payloads carried after the frame header by handshake and restart events.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use binrw::{BinRead, BinWrite};

/// Paths of the shared memory a client created for a session.
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(big)]
pub struct ShareMemoryPaths {
    /// Length of the queue file path
    pub queue_path_len: u16,
    /// Queue file path
    #[br(count = queue_path_len)]
    pub queue_path: Vec<u8>,
    /// Length of the segment path prefix
    pub segment_prefix_len: u16,
    /// Segment path prefix; segment `n` lives at `<prefix>_seg<n>`
    #[br(count = segment_prefix_len)]
    pub segment_prefix: Vec<u8>,
}

impl ShareMemoryPaths {
    /// Build the payload from two paths, carrying their raw bytes.
    ///
    /// Paths longer than `u16::MAX` bytes are truncated; the receiver then
    /// fails to open them and rejects the session.
    pub fn new(queue_path: &Path, segment_prefix: &Path) -> Self {
        let queue_path = truncated(queue_path.as_os_str().as_bytes());
        let segment_prefix = truncated(segment_prefix.as_os_str().as_bytes());
        Self {
            queue_path_len: u16::try_from(queue_path.len()).unwrap_or(u16::MAX),
            queue_path,
            segment_prefix_len: u16::try_from(segment_prefix.len()).unwrap_or(u16::MAX),
            segment_prefix,
        }
    }

    /// Queue file path.
    pub fn queue_path(&self) -> &Path {
        Path::new(OsStr::from_bytes(&self.queue_path))
    }

    /// Segment path prefix.
    pub fn segment_prefix(&self) -> &Path {
        Path::new(OsStr::from_bytes(&self.segment_prefix))
    }
}

fn truncated(bytes: &[u8]) -> Vec<u8> {
    bytes[..bytes.len().min(usize::from(u16::MAX))].to_vec()
}

/// Restart epoch shared by `HotRestart`, `HotRestartAck` and `HotRestartDone`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(big)]
pub struct RestartEvent {
    /// Identifies one restart attempt
    pub epoch: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_share_memory_paths_round_trip() {
        let paths = ShareMemoryPaths::new(Path::new("/dev/shm/a_queue"), Path::new("/dev/shm/a"));
        let mut cursor = Cursor::new(Vec::new());
        paths.write(&mut cursor).unwrap();
        let bytes = cursor.into_inner();
        assert_eq!(bytes.len(), 2 + 16 + 2 + 10);

        let parsed = ShareMemoryPaths::read(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(parsed.queue_path(), Path::new("/dev/shm/a_queue"));
        assert_eq!(parsed.segment_prefix(), Path::new("/dev/shm/a"));
    }

    #[test]
    fn test_non_utf8_paths_kept_verbatim() {
        let prefix = Path::new(OsStr::from_bytes(b"/tmp/caf\xe9"));
        let queue = Path::new(OsStr::from_bytes(b"/tmp/caf\xe9_queue"));
        let mut cursor = Cursor::new(Vec::new());
        ShareMemoryPaths::new(queue, prefix).write(&mut cursor).unwrap();

        let parsed = ShareMemoryPaths::read(&mut Cursor::new(cursor.into_inner())).unwrap();
        assert_eq!(parsed.queue_path(), queue);
        assert_eq!(parsed.segment_prefix().as_os_str().as_bytes(), b"/tmp/caf\xe9");
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let bytes = [0x00, 0x10, b'/', b'd'];
        assert!(ShareMemoryPaths::read(&mut Cursor::new(&bytes[..])).is_err());
    }
}
