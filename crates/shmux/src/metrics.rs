//! Session metrics and the monitor capability.
//!
//! Counters are cumulative for the life of a session. Snapshots are handed to
//! a [`Monitor`] on every metrics interval and once more when the session
//! closes; exporting them anywhere is the monitor's business.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

/// Data-path counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerformanceMetrics {
    /// Sync events received over the control connection
    pub receive_sync_event_count: u64,
    /// Sync events sent over the control connection
    pub send_sync_event_count: u64,
    /// Payload bytes written by local streams
    pub out_flow_bytes: u64,
    /// Payload bytes delivered to local streams
    pub in_flow_bytes: u64,
    /// Entries currently queued in the send direction
    pub send_queue_count: u64,
    /// Entries currently queued in the receive direction
    pub receive_queue_count: u64,
}

/// Failure and fallback counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StabilityMetrics {
    /// Allocations that found no free slab
    pub alloc_shm_error_count: u64,
    /// Chunks written through the control connection
    pub fallback_write_count: u64,
    /// Chunks received through the control connection
    pub fallback_read_count: u64,
    /// Control connection failures
    pub event_conn_error_count: u64,
    /// Enqueues rejected by a full queue
    pub queue_full_error_count: u64,
    /// Streams currently open
    pub active_stream_count: u64,
    /// Completed hot restarts
    pub hot_restart_success_count: u64,
    /// Failed hot restarts
    pub hot_restart_error_count: u64,
}

/// Shared memory gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShareMemoryMetrics {
    /// Slab bytes across all mapped segments
    pub capacity_bytes: u64,
    /// Slab bytes currently allocated by either process
    pub in_use_bytes: u64,
    /// Mapped segments
    pub segment_count: u32,
}

/// Receiver of metric snapshots.
///
/// Implementations are called from the dispatcher thread and must not block.
pub trait Monitor: Send + Sync {
    /// Called with a consistent snapshot of one session.
    fn on_emit(
        &self,
        performance: &PerformanceMetrics,
        stability: &StabilityMetrics,
        share_memory: &ShareMemoryMetrics,
    );

    /// Called after the final snapshot of a session.
    fn flush(&self) {}
}

/// Monitor that logs every snapshot at `info` level.
#[derive(Debug, Default, Clone)]
pub struct TracingMonitor {
    label: String,
}

impl TracingMonitor {
    /// Create a monitor tagging its output with `label`.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl Monitor for TracingMonitor {
    fn on_emit(
        &self,
        performance: &PerformanceMetrics,
        stability: &StabilityMetrics,
        share_memory: &ShareMemoryMetrics,
    ) {
        info!(
            label = %self.label,
            receive_sync_event_count = performance.receive_sync_event_count,
            send_sync_event_count = performance.send_sync_event_count,
            out_flow_bytes = performance.out_flow_bytes,
            in_flow_bytes = performance.in_flow_bytes,
            send_queue_count = performance.send_queue_count,
            receive_queue_count = performance.receive_queue_count,
            "session performance"
        );
        info!(
            label = %self.label,
            alloc_shm_error_count = stability.alloc_shm_error_count,
            fallback_write_count = stability.fallback_write_count,
            fallback_read_count = stability.fallback_read_count,
            event_conn_error_count = stability.event_conn_error_count,
            queue_full_error_count = stability.queue_full_error_count,
            active_stream_count = stability.active_stream_count,
            hot_restart_success_count = stability.hot_restart_success_count,
            hot_restart_error_count = stability.hot_restart_error_count,
            "session stability"
        );
        info!(
            label = %self.label,
            capacity_of_share_memory_in_bytes = share_memory.capacity_bytes,
            all_in_used_share_memory_in_bytes = share_memory.in_use_bytes,
            segment_count = share_memory.segment_count,
            "session share memory"
        );
    }
}

/// Live counters of one session.
#[derive(Default)]
pub(crate) struct SessionCounters {
    pub receive_sync_event: AtomicU64,
    pub send_sync_event: AtomicU64,
    pub out_flow_bytes: AtomicU64,
    pub in_flow_bytes: AtomicU64,
    pub alloc_shm_error: AtomicU64,
    pub fallback_write: AtomicU64,
    pub fallback_read: AtomicU64,
    pub event_conn_error: AtomicU64,
    pub queue_full_error: AtomicU64,
    pub active_streams: AtomicU64,
    pub hot_restart_success: AtomicU64,
    pub hot_restart_error: AtomicU64,
}

impl SessionCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn decr(counter: &AtomicU64) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn performance(&self, send_queue_count: u64, receive_queue_count: u64) -> PerformanceMetrics {
        PerformanceMetrics {
            receive_sync_event_count: self.receive_sync_event.load(Ordering::Relaxed),
            send_sync_event_count: self.send_sync_event.load(Ordering::Relaxed),
            out_flow_bytes: self.out_flow_bytes.load(Ordering::Relaxed),
            in_flow_bytes: self.in_flow_bytes.load(Ordering::Relaxed),
            send_queue_count,
            receive_queue_count,
        }
    }

    pub fn stability(&self) -> StabilityMetrics {
        StabilityMetrics {
            alloc_shm_error_count: self.alloc_shm_error.load(Ordering::Relaxed),
            fallback_write_count: self.fallback_write.load(Ordering::Relaxed),
            fallback_read_count: self.fallback_read.load(Ordering::Relaxed),
            event_conn_error_count: self.event_conn_error.load(Ordering::Relaxed),
            queue_full_error_count: self.queue_full_error.load(Ordering::Relaxed),
            active_stream_count: self.active_streams.load(Ordering::Relaxed),
            hot_restart_success_count: self.hot_restart_success.load(Ordering::Relaxed),
            hot_restart_error_count: self.hot_restart_error.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for SessionCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCounters")
            .field("stability", &self.stability())
            .finish_non_exhaustive()
    }
}

/// Complete snapshot of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionMetrics {
    /// Data-path counters
    pub performance: PerformanceMetrics,
    /// Failure counters
    pub stability: StabilityMetrics,
    /// Shared memory gauges
    pub share_memory: ShareMemoryMetrics,
}
