//! File-backed shared memory mappings.
//!
//! Segments and queue files are regular files (normally under `/dev/shm`)
//! mapped `MAP_SHARED` with memmap2. A file is created under a temporary name,
//! initialized, and renamed into place, so an attaching process never sees a
//! partially initialized layout.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use memmap2::{MmapOptions, MmapRaw};
use tracing::{debug, warn};

use crate::{Error, Result};

/// A mapped shared memory file.
///
/// The process that created the file unlinks it on drop unless
/// [`ShmFile::retain`] was called.
pub struct ShmFile {
    map: MmapRaw,
    path: PathBuf,
    unlink_on_drop: AtomicBool,
}

impl ShmFile {
    /// Create a new file of `len` bytes, let `init` lay out its contents, and
    /// publish it at `path`.
    ///
    /// Fails if `path` already exists.
    pub fn create<F>(path: &Path, len: usize, init: F) -> Result<Self>
    where
        F: FnOnce(*mut u8, usize) -> Result<()>,
    {
        if path.exists() {
            return Err(Error::SharedMemory(format!(
                "{} already exists",
                path.display()
            )));
        }

        let staging = staging_path(path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&staging)
            .map_err(|e| {
                Error::SharedMemory(format!("failed to create {}: {e}", staging.display()))
            })?;

        let result = Self::init_staged(&file, len, init).and_then(|map| {
            fs::rename(&staging, path).map_err(|e| {
                Error::SharedMemory(format!("failed to publish {}: {e}", path.display()))
            })?;
            Ok(map)
        });

        match result {
            Ok(map) => {
                debug!(path = %path.display(), len, "created shared memory file");
                Ok(Self {
                    map,
                    path: path.to_path_buf(),
                    unlink_on_drop: AtomicBool::new(true),
                })
            }
            Err(e) => {
                let _ = fs::remove_file(&staging);
                Err(e)
            }
        }
    }

    fn init_staged<F>(file: &File, len: usize, init: F) -> Result<MmapRaw>
    where
        F: FnOnce(*mut u8, usize) -> Result<()>,
    {
        file.set_len(len as u64)?;
        let map = MmapOptions::new().len(len).map_raw(file)?;
        init(map.as_mut_ptr(), map.len())?;
        Ok(map)
    }

    /// Map an existing file created by another manager or process.
    ///
    /// `min_len` guards against truncated files.
    pub fn open(path: &Path, min_len: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::SharedMemory(format!("failed to open {}: {e}", path.display())))?;

        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| Error::SharedMemory(format!("{} is too large", path.display())))?;
        if len < min_len {
            return Err(Error::SharedMemory(format!(
                "{} is {len} bytes, expected at least {min_len}",
                path.display()
            )));
        }

        let map = MmapOptions::new().len(len).map_raw(&file)?;
        debug!(path = %path.display(), len, "mapped shared memory file");

        Ok(Self {
            map,
            path: path.to_path_buf(),
            unlink_on_drop: AtomicBool::new(false),
        })
    }

    /// Base address of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    /// Mapping length in bytes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this mapping removes its file when dropped.
    pub fn is_owner(&self) -> bool {
        self.unlink_on_drop.load(Ordering::Acquire)
    }

    /// Keep the backing file after this mapping is dropped.
    pub fn retain(&self) {
        self.unlink_on_drop.store(false, Ordering::Release);
    }

    /// Take over unlinking of a file inherited from a previous owner.
    pub fn adopt(&self) {
        self.unlink_on_drop.store(true, Ordering::Release);
    }
}

impl Drop for ShmFile {
    fn drop(&mut self) {
        if self.unlink_on_drop.load(Ordering::Acquire) {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "failed to unlink shared memory file");
            } else {
                debug!(path = %self.path.display(), "unlinked shared memory file");
            }
        }
    }
}

impl std::fmt::Debug for ShmFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmFile")
            .field("path", &self.path)
            .field("len", &self.len())
            .field("owner", &self.is_owner())
            .finish()
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}.tmp", std::process::id()));
    PathBuf::from(name)
}
