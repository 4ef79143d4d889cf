//! Read-only statistics snapshots.
//!
//! Every record here is a copy taken under the owner's lock. Diagnostics can
//! poll them at any rate without affecting the frame loop.

use framesync_rhi::command::PoolStatistics;

use crate::pool_manager::PoolCategory;

/// Sum of the counters of every live pool a manager knows about.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AggregatePoolStatistics {
    /// Number of pools included in the sums.
    pub pool_count: usize,
    pub total_allocated: usize,
    pub primary_count: usize,
    pub secondary_count: usize,
    pub allocation_requests: u64,
    pub free_requests: u64,
    pub reset_count: u64,
    pub trim_count: u64,
    pub estimated_memory_bytes: u64,
}

impl AggregatePoolStatistics {
    pub(crate) fn add(&mut self, stats: &PoolStatistics) {
        self.pool_count += 1;
        self.total_allocated += stats.total_allocated;
        self.primary_count += stats.primary_count;
        self.secondary_count += stats.secondary_count;
        self.allocation_requests += stats.allocation_requests;
        self.free_requests += stats.free_requests;
        self.reset_count += stats.reset_count;
        self.trim_count += stats.trim_count;
        self.estimated_memory_bytes += stats.estimated_memory_bytes;
    }
}

/// Statistics of one pool, labelled with its category.
///
/// `category` is `None` for pools made with
/// [`CommandPoolManager::create_custom`](crate::CommandPoolManager::create_custom).
#[derive(Clone, Debug)]
pub struct PerPoolStatistics {
    pub category: Option<PoolCategory>,
    pub statistics: PoolStatistics,
}

/// Result of a bulk operation that keeps going past per-pool failures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchOutcome {
    /// True when no pool failed.
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

/// Snapshot of [`SyncManager`](crate::SyncManager) counters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncStatistics {
    pub max_frames_in_flight: usize,
    pub total_fence_waits: u64,
    /// Waits that returned because a finite timeout elapsed.
    pub fence_wait_timeouts: u64,
    pub total_fence_resets: u64,
    pub total_fence_wait_time_ms: f64,
    pub average_fence_wait_time_ms: f64,
    pub device_wait_idle_calls: u64,
    pub queue_wait_idle_calls: u64,
    pub current_frame_index: usize,
    pub total_frames_rendered: u64,
    /// Frame acquire semaphores plus cached image semaphores.
    pub active_semaphore_count: usize,
    pub active_fence_count: usize,
}
