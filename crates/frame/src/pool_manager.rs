//! Registry of command pools keyed by usage category.
//!
//! # Overview
//!
//! The [`CommandPoolManager`] lazily creates one [`CommandPool`] per
//! [`PoolCategory`] and hands out shared references to it. Pools for
//! multi-threaded recording are created with
//! [`create_custom`](CommandPoolManager::create_custom); those are not
//! cached and belong to the caller, but the manager still sees them for bulk
//! maintenance and statistics while they are alive.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use framesync_frame::{CommandPoolManager, PoolCategory};
//! use framesync_rhi::headless::HeadlessDevice;
//!
//! # fn example() -> Result<(), framesync_rhi::RhiError> {
//! let manager = CommandPoolManager::new(Arc::new(HeadlessDevice::new()));
//!
//! let graphics = manager.graphics_pool()?;
//! let again = manager.get_or_create(PoolCategory::Graphics)?;
//! assert!(Arc::ptr_eq(&graphics, &again));
//!
//! // No dedicated transfer queue on this device.
//! assert!(manager.transfer_pool()?.is_none());
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info};

use framesync_rhi::command::CommandPool;
use framesync_rhi::physical_device::QueueFamilyIndices;
use framesync_rhi::{DeviceRef, RhiError, RhiResult};

use crate::stats::{AggregatePoolStatistics, BatchOutcome, PerPoolStatistics};

/// Usage category of a managed pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PoolCategory {
    /// Per-frame rendering commands.
    Graphics,
    /// Copies on the transfer family.
    Transfer,
    /// Dispatches on the compute family.
    Compute,
    /// Short-lived one-shot buffers on the graphics family, e.g. uploads.
    TransientGraphics,
}

impl PoolCategory {
    pub const ALL: [PoolCategory; 4] = [
        PoolCategory::Graphics,
        PoolCategory::Transfer,
        PoolCategory::Compute,
        PoolCategory::TransientGraphics,
    ];

    /// Queue family the category's pool is created for.
    ///
    /// Transfer and compute fall back to the graphics family when the device
    /// has no dedicated family; [`QueueFamilyIndices`] already encodes that.
    pub fn queue_family(self, families: &QueueFamilyIndices) -> u32 {
        match self {
            PoolCategory::Graphics | PoolCategory::TransientGraphics => families.graphics_family,
            PoolCategory::Transfer => families.transfer_family,
            PoolCategory::Compute => families.compute_family,
        }
    }

    /// Whether the pool carries the transient hint.
    pub fn is_transient(self) -> bool {
        matches!(self, PoolCategory::Transfer | PoolCategory::TransientGraphics)
    }

    /// Whether buffers can be reset one at a time. Every category resets
    /// its pool as a whole.
    pub fn allows_individual_reset(self) -> bool {
        false
    }

    pub fn name(self) -> &'static str {
        match self {
            PoolCategory::Graphics => "graphics",
            PoolCategory::Transfer => "transfer",
            PoolCategory::Compute => "compute",
            PoolCategory::TransientGraphics => "transient-graphics",
        }
    }
}

impl fmt::Display for PoolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Default)]
struct Registry {
    pools: BTreeMap<PoolCategory, Arc<CommandPool>>,
    disposed: bool,
}

/// Lazily populated command pool registry.
///
/// # Thread Safety
///
/// [`get_or_create`](Self::get_or_create) is safe to call concurrently; two
/// racing callers receive the same pool. Recording into buffers of one pool
/// from several threads at once is still not allowed.
pub struct CommandPoolManager {
    device: DeviceRef,
    registry: Mutex<Registry>,
    custom_pools: Mutex<Vec<Weak<CommandPool>>>,
}

impl CommandPoolManager {
    pub fn new(device: DeviceRef) -> Self {
        Self {
            device,
            registry: Mutex::new(Registry::default()),
            custom_pools: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    /// Returns the pool for `category`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if native pool creation fails or the manager has
    /// been disposed.
    pub fn get_or_create(&self, category: PoolCategory) -> RhiResult<Arc<CommandPool>> {
        let mut registry = self.registry.lock();
        if registry.disposed {
            return Err(RhiError::InvalidHandle(
                "command pool manager has been disposed".to_string(),
            ));
        }

        if let Some(pool) = registry.pools.get(&category) {
            return Ok(pool.clone());
        }

        let family = category.queue_family(&self.device.queue_families());
        let pool = Arc::new(CommandPool::new(
            self.device.clone(),
            family,
            category.allows_individual_reset(),
            category.is_transient(),
        )?);

        info!(
            "Created {} command pool on queue family {}",
            category, family
        );

        registry.pools.insert(category, pool.clone());
        Ok(pool)
    }

    /// Creates an uncached pool, e.g. one per recording thread.
    ///
    /// The caller owns the pool. While it is alive it takes part in
    /// [`reset_all`](Self::reset_all), [`trim_all`](Self::trim_all) and the
    /// statistics, but [`dispose`](Self::dispose) leaves it alone.
    pub fn create_custom(
        &self,
        queue_family_index: u32,
        allow_individual_reset: bool,
        transient: bool,
    ) -> RhiResult<Arc<CommandPool>> {
        let pool = Arc::new(CommandPool::new(
            self.device.clone(),
            queue_family_index,
            allow_individual_reset,
            transient,
        )?);

        let mut custom = self.custom_pools.lock();
        custom.retain(|weak| weak.strong_count() > 0);
        custom.push(Arc::downgrade(&pool));

        debug!(
            "Created custom command pool {:?} ({} live custom pool(s))",
            pool.handle(),
            custom.len()
        );

        Ok(pool)
    }

    pub fn graphics_pool(&self) -> RhiResult<Arc<CommandPool>> {
        self.get_or_create(PoolCategory::Graphics)
    }

    /// The transfer pool, or `None` without a dedicated transfer family.
    pub fn transfer_pool(&self) -> RhiResult<Option<Arc<CommandPool>>> {
        if !self.device.queue_families().has_dedicated_transfer() {
            return Ok(None);
        }
        self.get_or_create(PoolCategory::Transfer).map(Some)
    }

    /// The compute pool, or `None` without a dedicated compute family.
    pub fn compute_pool(&self) -> RhiResult<Option<Arc<CommandPool>>> {
        if !self.device.queue_families().has_dedicated_compute() {
            return Ok(None);
        }
        self.get_or_create(PoolCategory::Compute).map(Some)
    }

    /// Every live pool, categories first in category order, then custom
    /// pools in creation order.
    fn live_pools(&self) -> Vec<(Option<PoolCategory>, Arc<CommandPool>)> {
        let mut pools: Vec<_> = self
            .registry
            .lock()
            .pools
            .iter()
            .map(|(&category, pool)| (Some(category), pool.clone()))
            .collect();

        let mut custom = self.custom_pools.lock();
        custom.retain(|weak| weak.strong_count() > 0);
        pools.extend(custom.iter().filter_map(Weak::upgrade).map(|pool| (None, pool)));
        pools
    }

    /// Resets every live pool. A failing pool is logged and skipped.
    ///
    /// Nothing allocated from any of the pools may be executing.
    pub fn reset_all(&self, release_resources: bool) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for (category, pool) in self.live_pools() {
            match pool.reset(release_resources) {
                Ok(()) => outcome.succeeded += 1,
                Err(e) => {
                    error!("Failed to reset {} pool {:?}: {}", label(category), pool.handle(), e);
                    outcome.failed += 1;
                }
            }
        }
        debug!(
            "Reset {} pool(s), {} failure(s)",
            outcome.succeeded, outcome.failed
        );
        outcome
    }

    /// Trims every live pool. A failing pool is logged and skipped.
    pub fn trim_all(&self) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for (category, pool) in self.live_pools() {
            match pool.trim() {
                Ok(()) => outcome.succeeded += 1,
                Err(e) => {
                    error!("Failed to trim {} pool {:?}: {}", label(category), pool.handle(), e);
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }

    pub fn aggregate_statistics(&self) -> AggregatePoolStatistics {
        let mut aggregate = AggregatePoolStatistics::default();
        for (_, pool) in self.live_pools() {
            aggregate.add(&pool.statistics());
        }
        aggregate
    }

    pub fn per_pool_statistics(&self) -> Vec<PerPoolStatistics> {
        self.live_pools()
            .into_iter()
            .map(|(category, pool)| PerPoolStatistics {
                category,
                statistics: pool.statistics(),
            })
            .collect()
    }

    /// Number of cached category pools.
    pub fn pool_count(&self) -> usize {
        self.registry.lock().pools.len()
    }

    /// Releases every category pool.
    ///
    /// Failures are logged per pool and do not stop the others. Later calls
    /// do nothing. Handles still held elsewhere become unusable.
    pub fn dispose(&self) -> BatchOutcome {
        let pools = {
            let mut registry = self.registry.lock();
            if registry.disposed {
                return BatchOutcome::default();
            }
            registry.disposed = true;
            std::mem::take(&mut registry.pools)
        };

        let mut outcome = BatchOutcome::default();
        for (category, pool) in pools {
            match pool.release() {
                Ok(()) => outcome.succeeded += 1,
                Err(e) => {
                    error!("Failed to dispose {} pool {:?}: {}", category, pool.handle(), e);
                    outcome.failed += 1;
                }
            }
        }

        info!(
            "Command pool manager disposed ({} pool(s), {} failure(s))",
            outcome.succeeded, outcome.failed
        );
        outcome
    }

    pub fn is_disposed(&self) -> bool {
        self.registry.lock().disposed
    }
}

fn label(category: Option<PoolCategory>) -> &'static str {
    category.map_or("custom", PoolCategory::name)
}

impl Drop for CommandPoolManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for CommandPoolManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("CommandPoolManager")
            .field("categories", &registry.pools.keys().collect::<Vec<_>>())
            .field("disposed", &registry.disposed)
            .finish()
    }
}
