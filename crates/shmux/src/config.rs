//! Session and dispatcher configuration.
//!
//! Both structs deserialize from JSON with serde, so a host can keep them in
//! its own configuration files. Every field has a default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::buffer::SegmentLayout;
use crate::poller::PollerKind;
use crate::{Error, Result};

/// Share of each segment given to one slab size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizePercent {
    /// Slab size in bytes
    pub size: u32,
    /// Percentage of the segment
    pub percent: u32,
}

impl SizePercent {
    /// Create a size class.
    pub const fn new(size: u32, percent: u32) -> Self {
        Self { size, percent }
    }
}

/// Configuration of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Directory for segment and queue files
    pub shm_dir: PathBuf,
    /// File name prefix; a process id and random suffix are appended
    pub path_prefix: String,
    /// Slots per queue direction (power of two)
    pub queue_capacity: u32,
    /// Size of each segment file in bytes
    pub segment_size: usize,
    /// Most segments a session may map
    pub max_segments: u32,
    /// Slab sizes and their share of each segment
    pub size_classes: Vec<SizePercent>,
    /// Bound on the connection handshake
    pub handshake_timeout: Duration,
    /// Bound on writing one control frame once started
    pub write_timeout: Duration,
    /// Bound on waiting for the peer during a hot restart
    pub hot_restart_timeout: Duration,
    /// Interval between metric snapshots
    pub metrics_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shm_dir: default_shm_dir(),
            path_prefix: "shmux".to_string(),
            queue_capacity: 8192,
            segment_size: 32 * 1024 * 1024, // 32 MB
            max_segments: 4,
            size_classes: vec![
                SizePercent::new(4096, 70),
                SizePercent::new(16 * 1024, 20),
                SizePercent::new(64 * 1024, 10),
            ],
            handshake_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            hot_restart_timeout: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(30),
        }
    }
}

fn default_shm_dir() -> PathBuf {
    let dev_shm = Path::new("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

impl SessionConfig {
    /// Create a configuration placing shared memory files in `shm_dir`.
    pub fn new<P: AsRef<Path>>(shm_dir: P) -> Self {
        Self {
            shm_dir: shm_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Load from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid session config: {e}")))?;
        config.validate().map_err(Error::Config)?;
        Ok(config)
    }

    /// Set the shared memory directory
    #[must_use]
    pub fn with_shm_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.shm_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the file name prefix
    #[must_use]
    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = prefix.into();
        self
    }

    /// Set the queue capacity
    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: u32) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the segment size
    #[must_use]
    pub const fn with_segment_size(mut self, size: usize) -> Self {
        self.segment_size = size;
        self
    }

    /// Set the segment ceiling
    #[must_use]
    pub const fn with_max_segments(mut self, max: u32) -> Self {
        self.max_segments = max;
        self
    }

    /// Set the size classes
    #[must_use]
    pub fn with_size_classes(mut self, classes: Vec<SizePercent>) -> Self {
        self.size_classes = classes;
        self
    }

    /// Set the handshake timeout
    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the control frame write timeout
    #[must_use]
    pub const fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the hot restart timeout
    #[must_use]
    pub const fn with_hot_restart_timeout(mut self, timeout: Duration) -> Self {
        self.hot_restart_timeout = timeout;
        self
    }

    /// Set the metrics interval
    #[must_use]
    pub const fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.queue_capacity == 0 || !self.queue_capacity.is_power_of_two() {
            return Err(format!(
                "queue_capacity must be a power of two, got {}",
                self.queue_capacity
            ));
        }

        if self.max_segments == 0 {
            return Err("max_segments must be greater than 0".to_string());
        }

        if self.path_prefix.is_empty() || self.path_prefix.contains('/') {
            return Err(format!(
                "path_prefix must be a non-empty file name, got {:?}",
                self.path_prefix
            ));
        }

        for timeout in [
            ("handshake_timeout", self.handshake_timeout),
            ("write_timeout", self.write_timeout),
            ("hot_restart_timeout", self.hot_restart_timeout),
            ("metrics_interval", self.metrics_interval),
        ] {
            if timeout.1.is_zero() {
                return Err(format!("{} must be greater than 0", timeout.0));
            }
        }

        self.segment_layout().map(|_| ()).map_err(|e| e.to_string())
    }

    /// Segment geometry derived from the size classes.
    pub fn segment_layout(&self) -> Result<SegmentLayout> {
        let classes: Vec<(u32, u32)> = self
            .size_classes
            .iter()
            .map(|c| (c.size, c.percent))
            .collect();
        SegmentLayout::from_percentages(self.segment_size, &classes, self.max_segments)
    }
}

/// Configuration of a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Readiness backend
    pub poller: PollerKind,
    /// Interval for timer work (metrics, restart deadlines)
    pub tick_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poller: PollerKind::Auto,
            tick_interval: Duration::from_millis(100),
        }
    }
}

impl DispatcherConfig {
    /// Load from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid dispatcher config: {e}")))?;
        config.validate().map_err(Error::Config)?;
        Ok(config)
    }

    /// Set the poller backend
    #[must_use]
    pub const fn with_poller(mut self, poller: PollerKind) -> Self {
        self.poller = poller;
        self
    }

    /// Set the tick interval
    #[must_use]
    pub const fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.tick_interval.is_zero() {
            return Err("tick_interval must be greater than 0".to_string());
        }
        Ok(())
    }
}
