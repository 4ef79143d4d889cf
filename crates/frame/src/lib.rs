//! Frames-in-flight synchronization and command pool management.
//!
//! This crate sits between the device seam and whatever records frames:
//! - [`SyncManager`]: per-frame and per-image semaphores and fences
//! - [`CommandPoolManager`]: one lazily created pool per usage category
//! - [`FrameLoop`]: the wait / acquire / reset / record / submit / present
//!   protocol over a [`PresentTarget`]

pub mod frame_loop;
pub mod pool_manager;
pub mod present;
pub mod stats;
pub mod sync_manager;

pub use frame_loop::{ActiveFrame, FrameBegin, FrameLoop};
pub use pool_manager::{CommandPoolManager, PoolCategory};
pub use present::{Acquire, OffscreenTarget, PresentTarget};
pub use stats::{AggregatePoolStatistics, BatchOutcome, PerPoolStatistics, SyncStatistics};
pub use sync_manager::{FrameSlot, ImageSlot, SyncManager};
