//! Simulated GPU for tests and CI.
//!
//! [`HeadlessDevice`] implements [`GpuDevice`] without a driver. It keeps
//! every object in plain host memory and models the parts of Vulkan the
//! frame-sync subsystem depends on:
//!
//! - Queue submissions are kept in per-queue FIFOs and only execute when the
//!   CPU waits for them (a fence wait on pending work, queue idle, device
//!   idle). Execution applies recorded barriers and copies to simulated image
//!   memory, then signals semaphores and the fence.
//! - Usage that Vulkan leaves undefined is detected, logged, recorded in
//!   [`validation_errors`](HeadlessDevice::validation_errors) and, where the
//!   call can fail, returned as [`RhiError::Validation`].
//! - [`stall`](HeadlessDevice::stall) freezes the queues to imitate a hung
//!   GPU; [`inject_fault`](HeadlessDevice::inject_fault) makes one future call
//!   fail.
//!
//! Waits never sleep. A finite wait that cannot be satisfied returns `false`
//! immediately; an infinite one is reported instead of hanging the test.

use std::collections::{HashMap, HashSet, VecDeque};

use ash::vk::{self, Handle};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::buffer::BufferUsage;
use crate::command::ImageBarrier;
use crate::device::{GpuDevice, SubmitDesc};
use crate::error::{RhiError, RhiResult};
use crate::image::{ImageDesc, texel_size};
use crate::physical_device::QueueFamilyIndices;
use crate::sampler::SamplerDesc;

/// A one-shot failure armed with [`HeadlessDevice::inject_fault`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    FenceCreation,
    SemaphoreCreation,
    PoolCreation,
    CommandBufferAllocation,
    ImageViewCreation,
    PoolReset(vk::CommandPool),
    PoolTrim(vk::CommandPool),
    PoolDestroy(vk::CommandPool),
}

/// A command captured while recording.
#[derive(Clone, Debug)]
pub enum RecordedCommand {
    ImageBarrier(ImageBarrier),
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    },
}

impl RecordedCommand {
    fn references_buffer(&self, buffer: vk::Buffer) -> bool {
        matches!(self, Self::CopyBufferToImage { src, .. } if *src == buffer)
    }

    fn references_image(&self, image: vk::Image) -> bool {
        match self {
            Self::ImageBarrier(barrier) => barrier.image == image,
            Self::CopyBufferToImage { dst, .. } => *dst == image,
        }
    }
}

/// Lifecycle state of a simulated command buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    Pending,
    /// A one-time-submit buffer after execution.
    Invalid,
}

struct FenceState {
    signaled: bool,
    pending: bool,
}

struct SemaphoreState {
    /// Execution state.
    signaled: bool,
    /// Submission-order state: the last submitted operation was a signal.
    will_be_signaled: bool,
}

struct PoolRecord {
    family: u32,
    flags: vk::CommandPoolCreateFlags,
}

struct CommandBufferRecord {
    pool: vk::CommandPool,
    state: CommandBufferState,
    one_time: bool,
    commands: Vec<RecordedCommand>,
}

struct BufferRecord {
    usage: BufferUsage,
    data: Vec<u8>,
}

struct ImageRecord {
    desc: ImageDesc,
    layout: vk::ImageLayout,
    data: Vec<u8>,
}

struct Submission {
    waits: Vec<vk::Semaphore>,
    command_buffers: Vec<vk::CommandBuffer>,
    signals: Vec<vk::Semaphore>,
    fence: vk::Fence,
}

struct QueueRecord {
    queue: vk::Queue,
    family: u32,
    pending: VecDeque<Submission>,
}

struct State {
    next_handle: u64,
    stalled: bool,
    faults: Vec<Fault>,
    validation_errors: Vec<String>,
    queue_families: QueueFamilyIndices,
    queues: Vec<QueueRecord>,
    fences: HashMap<vk::Fence, FenceState>,
    semaphores: HashMap<vk::Semaphore, SemaphoreState>,
    pools: HashMap<vk::CommandPool, PoolRecord>,
    command_buffers: HashMap<vk::CommandBuffer, CommandBufferRecord>,
    buffers: HashMap<vk::Buffer, BufferRecord>,
    images: HashMap<vk::Image, ImageRecord>,
    image_views: HashMap<vk::ImageView, vk::Image>,
    samplers: HashSet<vk::Sampler>,
    submission_count: u64,
}

fn oom() -> RhiError {
    RhiError::VulkanError(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
}

fn device_lost() -> RhiError {
    RhiError::VulkanError(vk::Result::ERROR_DEVICE_LOST)
}

impl State {
    fn new(queue_families: QueueFamilyIndices) -> Self {
        let mut state = Self {
            next_handle: 0,
            stalled: false,
            faults: Vec::new(),
            validation_errors: Vec::new(),
            queue_families,
            queues: Vec::new(),
            fences: HashMap::new(),
            semaphores: HashMap::new(),
            pools: HashMap::new(),
            command_buffers: HashMap::new(),
            buffers: HashMap::new(),
            images: HashMap::new(),
            image_views: HashMap::new(),
            samplers: HashSet::new(),
            submission_count: 0,
        };

        for family in queue_families.unique_families() {
            let queue = vk::Queue::from_raw(state.alloc_handle());
            state.queues.push(QueueRecord {
                queue,
                family,
                pending: VecDeque::new(),
            });
        }

        state
    }

    fn alloc_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn violation(&mut self, message: String) -> RhiError {
        warn!("Headless validation: {}", message);
        self.validation_errors.push(message.clone());
        RhiError::Validation(message)
    }

    fn take_fault(&mut self, fault: Fault) -> bool {
        match self.faults.iter().position(|&f| f == fault) {
            Some(index) => {
                self.faults.remove(index);
                debug!("Injected fault triggered: {:?}", fault);
                true
            }
            None => false,
        }
    }

    fn queue_index(&self, queue: vk::Queue) -> Option<usize> {
        self.queues.iter().position(|q| q.queue == queue)
    }

    fn queue_for_family(&self, family: u32) -> Option<vk::Queue> {
        self.queues
            .iter()
            .find(|q| q.family == family)
            .map(|q| q.queue)
    }

    fn has_pending_work(&self) -> bool {
        self.queues.iter().any(|q| !q.pending.is_empty())
    }

    fn pending_commands(&self) -> impl Iterator<Item = &RecordedCommand> {
        self.command_buffers
            .values()
            .filter(|cb| cb.state == CommandBufferState::Pending)
            .flat_map(|cb| cb.commands.iter())
    }

    fn semaphore_in_use(&self, semaphore: vk::Semaphore) -> bool {
        self.queues.iter().flat_map(|q| q.pending.iter()).any(|s| {
            s.waits.contains(&semaphore) || s.signals.contains(&semaphore)
        })
    }

    // =========================================================================
    // Execution
    // =========================================================================

    fn is_ready(&self, submission: &Submission) -> bool {
        submission
            .waits
            .iter()
            .all(|s| self.semaphores.get(s).is_some_and(|st| st.signaled))
    }

    /// Executes the first ready submission at the front of any queue.
    fn step(&mut self) -> bool {
        if self.stalled {
            return false;
        }

        let ready = self
            .queues
            .iter()
            .position(|q| q.pending.front().is_some_and(|s| self.is_ready(s)));

        let Some(index) = ready else {
            return false;
        };
        let Some(submission) = self.queues[index].pending.pop_front() else {
            return false;
        };

        self.execute(submission);
        true
    }

    fn drain_until(&mut self, done: impl Fn(&State) -> bool) -> bool {
        loop {
            if done(self) {
                return true;
            }
            if !self.step() {
                return done(self);
            }
        }
    }

    fn execute(&mut self, submission: Submission) {
        for cb in &submission.command_buffers {
            let commands = match self.command_buffers.get(cb) {
                Some(record) => record.commands.clone(),
                None => continue,
            };

            for command in &commands {
                if let Err(message) = self.apply(command) {
                    self.violation(message);
                }
            }

            if let Some(record) = self.command_buffers.get_mut(cb) {
                record.state = if record.one_time {
                    CommandBufferState::Invalid
                } else {
                    CommandBufferState::Executable
                };
            }
        }

        for semaphore in &submission.waits {
            if let Some(state) = self.semaphores.get_mut(semaphore) {
                state.signaled = false;
            }
        }
        for semaphore in &submission.signals {
            if let Some(state) = self.semaphores.get_mut(semaphore) {
                state.signaled = true;
            }
        }
        if let Some(fence) = self.fences.get_mut(&submission.fence) {
            fence.signaled = true;
            fence.pending = false;
        }
    }

    fn apply(&mut self, command: &RecordedCommand) -> Result<(), String> {
        match command {
            RecordedCommand::ImageBarrier(barrier) => {
                let Some(image) = self.images.get_mut(&barrier.image) else {
                    return Err(format!("barrier on unknown image {:?}", barrier.image));
                };
                let expected = barrier.old_layout;
                let actual = image.layout;
                image.layout = barrier.new_layout;
                if expected != vk::ImageLayout::UNDEFINED && expected != actual {
                    return Err(format!(
                        "barrier on image {:?} expects layout {:?} but the image is in {:?}",
                        barrier.image, expected, actual
                    ));
                }
                Ok(())
            }
            RecordedCommand::CopyBufferToImage {
                src,
                dst,
                dst_layout,
                regions,
            } => {
                let Some(image) = self.images.get_mut(dst) else {
                    return Err(format!("copy into unknown image {:?}", dst));
                };
                if image.layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL
                    && image.layout != vk::ImageLayout::GENERAL
                {
                    return Err(format!(
                        "copy into image {:?} in layout {:?}, expected TRANSFER_DST_OPTIMAL",
                        dst, image.layout
                    ));
                }
                if *dst_layout != image.layout {
                    return Err(format!(
                        "copy into image {:?} declares layout {:?} but the image is in {:?}",
                        dst, dst_layout, image.layout
                    ));
                }
                let Some(buffer) = self.buffers.get(src) else {
                    return Err(format!("copy from unknown buffer {:?}", src));
                };

                let texel = texel_size(image.desc.format).unwrap_or(1) as usize;
                let image_width = image.desc.extent.width as usize;
                let image_height = image.desc.extent.height as usize;

                for region in regions {
                    let width = region.image_extent.width as usize;
                    let height = region.image_extent.height as usize;
                    let x = region.image_offset.x.max(0) as usize;
                    let y = region.image_offset.y.max(0) as usize;
                    if x + width > image_width || y + height > image_height {
                        return Err(format!(
                            "copy region {}x{} at ({}, {}) exceeds image {:?}",
                            width, height, x, y, dst
                        ));
                    }

                    let row_texels = if region.buffer_row_length == 0 {
                        width
                    } else {
                        region.buffer_row_length as usize
                    };

                    for row in 0..height {
                        let src_start = region.buffer_offset as usize + row * row_texels * texel;
                        let src_end = src_start + width * texel;
                        if src_end > buffer.data.len() {
                            return Err(format!("copy reads past the end of buffer {:?}", src));
                        }
                        let dst_start = ((y + row) * image_width + x) * texel;
                        image.data[dst_start..dst_start + width * texel]
                            .copy_from_slice(&buffer.data[src_start..src_end]);
                    }
                }
                Ok(())
            }
        }
    }

    // =========================================================================
    // Validation helpers
    // =========================================================================

    fn check_submit(
        &self,
        family: u32,
        submit: &SubmitDesc<'_>,
        fence: vk::Fence,
    ) -> Result<(), String> {
        for cb in submit.command_buffers {
            let Some(record) = self.command_buffers.get(cb) else {
                return Err(format!("submit of unknown command buffer {:?}", cb));
            };
            if record.state != CommandBufferState::Executable {
                return Err(format!(
                    "command buffer {:?} submitted in state {:?}",
                    cb, record.state
                ));
            }
            let pool_family = self.pools.get(&record.pool).map(|p| p.family);
            if pool_family != Some(family) {
                return Err(format!(
                    "command buffer {:?} from family {:?} submitted to a family {} queue",
                    cb, pool_family, family
                ));
            }
        }

        for wait in submit.wait_semaphores {
            match self.semaphores.get(&wait.semaphore) {
                None => return Err(format!("wait on unknown semaphore {:?}", wait.semaphore)),
                Some(state) if !state.will_be_signaled => {
                    return Err(format!(
                        "wait on semaphore {:?} with no pending signal",
                        wait.semaphore
                    ));
                }
                Some(_) => {}
            }
        }

        for semaphore in submit.signal_semaphores {
            let waited_here = submit
                .wait_semaphores
                .iter()
                .any(|w| w.semaphore == *semaphore);
            match self.semaphores.get(semaphore) {
                None => return Err(format!("signal of unknown semaphore {:?}", semaphore)),
                Some(state) if state.will_be_signaled && !waited_here => {
                    return Err(format!(
                        "signal of semaphore {:?} that is already signaled",
                        semaphore
                    ));
                }
                Some(_) => {}
            }
        }

        if fence != vk::Fence::null() {
            match self.fences.get(&fence) {
                None => return Err(format!("submit with unknown fence {:?}", fence)),
                Some(state) if state.signaled => {
                    return Err(format!("submit with fence {:?} that is still signaled", fence));
                }
                Some(state) if state.pending => {
                    return Err(format!(
                        "submit with fence {:?} that already guards pending work",
                        fence
                    ));
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    fn check_pool_idle(&self, pool: vk::CommandPool, action: &str) -> Result<(), String> {
        let executing = self
            .command_buffers
            .iter()
            .filter(|(_, cb)| cb.pool == pool && cb.state == CommandBufferState::Pending)
            .count();
        if executing > 0 {
            return Err(format!(
                "{} of pool {:?} while {} command buffer(s) are executing",
                action, pool, executing
            ));
        }
        Ok(())
    }
}

/// Deterministic in-memory GPU.
///
/// # Example
///
/// ```
/// use framesync_rhi::device::GpuDevice;
/// use framesync_rhi::headless::HeadlessDevice;
///
/// let device = HeadlessDevice::new();
/// let fence = device.create_fence(false).unwrap();
/// // Nothing will ever signal the fence, so a finite wait times out.
/// assert!(!device.wait_for_fences(&[fence], true, 1_000).unwrap());
/// ```
pub struct HeadlessDevice {
    state: Mutex<State>,
}

impl HeadlessDevice {
    /// A device with a single graphics family (family 0).
    pub fn new() -> Self {
        Self::with_queue_families(QueueFamilyIndices::graphics_only(0))
    }

    /// A device with dedicated transfer (family 1) and compute (family 2)
    /// families.
    pub fn with_dedicated_queues() -> Self {
        Self::with_queue_families(QueueFamilyIndices {
            graphics_family: 0,
            compute_family: 2,
            transfer_family: 1,
        })
    }

    pub fn with_queue_families(queue_families: QueueFamilyIndices) -> Self {
        Self {
            state: Mutex::new(State::new(queue_families)),
        }
    }

    /// Freezes (or thaws) all queues.
    ///
    /// While stalled, pending work never completes: finite waits time out and
    /// infinite or idle waits fail with `ERROR_DEVICE_LOST`.
    pub fn stall(&self, stalled: bool) {
        self.state.lock().stalled = stalled;
    }

    /// Arms a one-shot failure.
    pub fn inject_fault(&self, fault: Fault) {
        self.state.lock().faults.push(fault);
    }

    /// Every precondition violation observed so far.
    pub fn validation_errors(&self) -> Vec<String> {
        self.state.lock().validation_errors.clone()
    }

    pub fn clear_validation_errors(&self) {
        self.state.lock().validation_errors.clear();
    }

    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn live_semaphores(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    pub fn live_command_pools(&self) -> usize {
        self.state.lock().pools.len()
    }

    pub fn live_command_buffers(&self) -> usize {
        self.state.lock().command_buffers.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_images(&self) -> usize {
        self.state.lock().images.len()
    }

    pub fn live_image_views(&self) -> usize {
        self.state.lock().image_views.len()
    }

    pub fn live_samplers(&self) -> usize {
        self.state.lock().samplers.len()
    }

    /// Current layout of `image`, as of the last executed submission.
    pub fn image_layout(&self, image: vk::Image) -> Option<vk::ImageLayout> {
        self.state.lock().images.get(&image).map(|i| i.layout)
    }

    /// Tightly packed texel data of `image`.
    pub fn image_contents(&self, image: vk::Image) -> Option<Vec<u8>> {
        self.state.lock().images.get(&image).map(|i| i.data.clone())
    }

    /// Commands recorded into `buffer` since its last begin.
    pub fn recorded_commands(&self, buffer: vk::CommandBuffer) -> Vec<RecordedCommand> {
        self.state
            .lock()
            .command_buffers
            .get(&buffer)
            .map(|cb| cb.commands.clone())
            .unwrap_or_default()
    }

    pub fn command_buffer_state(&self, buffer: vk::CommandBuffer) -> Option<CommandBufferState> {
        self.state
            .lock()
            .command_buffers
            .get(&buffer)
            .map(|cb| cb.state)
    }

    /// Whether `fence` guards work that has not executed yet.
    pub fn fence_pending(&self, fence: vk::Fence) -> bool {
        self.state
            .lock()
            .fences
            .get(&fence)
            .is_some_and(|f| f.pending)
    }

    /// Total number of accepted submissions.
    pub fn submission_count(&self) -> u64 {
        self.state.lock().submission_count
    }

    /// Submissions queued but not yet executed.
    pub fn pending_submissions(&self) -> usize {
        self.state
            .lock()
            .queues
            .iter()
            .map(|q| q.pending.len())
            .sum()
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HeadlessDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("HeadlessDevice")
            .field("queue_families", &state.queue_families)
            .field("submissions", &state.submission_count)
            .field("stalled", &state.stalled)
            .finish()
    }
}

impl GpuDevice for HeadlessDevice {
    fn backend_name(&self) -> &'static str {
        "headless"
    }

    fn queue_families(&self) -> QueueFamilyIndices {
        self.state.lock().queue_families
    }

    fn graphics_queue(&self) -> vk::Queue {
        let state = self.state.lock();
        state
            .queue_for_family(state.queue_families.graphics_family)
            .unwrap_or_else(vk::Queue::null)
    }

    fn transfer_queue(&self) -> Option<vk::Queue> {
        let state = self.state.lock();
        let families = state.queue_families;
        families
            .has_dedicated_transfer()
            .then(|| state.queue_for_family(families.transfer_family))
            .flatten()
    }

    fn compute_queue(&self) -> Option<vk::Queue> {
        let state = self.state.lock();
        let families = state.queue_families;
        families
            .has_dedicated_compute()
            .then(|| state.queue_for_family(families.compute_family))
            .flatten()
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submit: &SubmitDesc<'_>,
        fence: vk::Fence,
    ) -> RhiResult<()> {
        let mut state = self.state.lock();

        let Some(index) = state.queue_index(queue) else {
            return Err(state.violation(format!("submit to unknown queue {:?}", queue)));
        };
        let family = state.queues[index].family;

        if let Err(message) = state.check_submit(family, submit, fence) {
            return Err(state.violation(message));
        }

        for cb in submit.command_buffers {
            if let Some(record) = state.command_buffers.get_mut(cb) {
                record.state = CommandBufferState::Pending;
            }
        }
        for wait in submit.wait_semaphores {
            if let Some(semaphore) = state.semaphores.get_mut(&wait.semaphore) {
                semaphore.will_be_signaled = false;
            }
        }
        for signal in submit.signal_semaphores {
            if let Some(semaphore) = state.semaphores.get_mut(signal) {
                semaphore.will_be_signaled = true;
            }
        }
        if let Some(f) = state.fences.get_mut(&fence) {
            f.pending = true;
        }

        state.queues[index].pending.push_back(Submission {
            waits: submit.wait_semaphores.iter().map(|w| w.semaphore).collect(),
            command_buffers: submit.command_buffers.to_vec(),
            signals: submit.signal_semaphores.to_vec(),
            fence,
        });
        state.submission_count += 1;

        debug!(
            "Queued submission #{} on {:?} ({} command buffer(s))",
            state.submission_count,
            queue,
            submit.command_buffers.len()
        );

        Ok(())
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let mut state = self.state.lock();
        if state.stalled && state.has_pending_work() {
            return Err(device_lost());
        }
        if !state.drain_until(|s| !s.has_pending_work()) {
            return Err(state.violation("device idle wait can never complete".to_string()));
        }
        Ok(())
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> RhiResult<()> {
        let mut state = self.state.lock();
        let Some(index) = state.queue_index(queue) else {
            return Err(state.violation(format!("idle wait on unknown queue {:?}", queue)));
        };
        if state.stalled && !state.queues[index].pending.is_empty() {
            return Err(device_lost());
        }
        if !state.drain_until(|s| s.queues[index].pending.is_empty()) {
            return Err(state.violation(format!("idle wait on queue {:?} can never complete", queue)));
        }
        Ok(())
    }

    // =========================================================================
    // Fences and semaphores
    // =========================================================================

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let mut state = self.state.lock();
        if state.take_fault(Fault::FenceCreation) {
            return Err(oom());
        }
        let fence = vk::Fence::from_raw(state.alloc_handle());
        state.fences.insert(
            fence,
            FenceState {
                signaled,
                pending: false,
            },
        );
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        if fence == vk::Fence::null() {
            return;
        }
        let mut state = self.state.lock();
        match state.fences.remove(&fence) {
            Some(f) if f.pending => {
                state.violation(format!("destroy of fence {:?} guarding pending work", fence));
            }
            Some(_) => {}
            None => {
                state.violation(format!("destroy of unknown fence {:?}", fence));
            }
        }
    }

    fn wait_for_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> RhiResult<bool> {
        let mut state = self.state.lock();

        if let Some(unknown) = fences.iter().find(|f| !state.fences.contains_key(*f)) {
            return Err(state.violation(format!("wait on unknown fence {:?}", unknown)));
        }
        if fences.is_empty() {
            return Ok(true);
        }

        let satisfied = |s: &State| {
            let mut signaled = fences
                .iter()
                .map(|f| s.fences.get(f).is_some_and(|st| st.signaled));
            if wait_all {
                signaled.all(|x| x)
            } else {
                signaled.any(|x| x)
            }
        };

        if satisfied(&*state) {
            return Ok(true);
        }

        let reachable = {
            let mut reachable = fences
                .iter()
                .map(|f| state.fences.get(f).is_some_and(|st| st.signaled || st.pending));
            if wait_all {
                reachable.all(|x| x)
            } else {
                reachable.any(|x| x)
            }
        };

        if reachable {
            if state.stalled {
                return if timeout_ns == u64::MAX {
                    Err(device_lost())
                } else {
                    Ok(false)
                };
            }
            if state.drain_until(satisfied) {
                return Ok(true);
            }
        }

        if timeout_ns == u64::MAX {
            return Err(state.violation(format!(
                "infinite wait on fence(s) {:?} that no pending work will signal",
                fences
            )));
        }
        Ok(false)
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> RhiResult<()> {
        let mut state = self.state.lock();

        for fence in fences {
            let message = match state.fences.get(fence) {
                None => Some(format!("reset of unknown fence {:?}", fence)),
                Some(f) if f.pending => {
                    Some(format!("reset of fence {:?} guarding pending work", fence))
                }
                Some(_) => None,
            };
            if let Some(message) = message {
                return Err(state.violation(message));
            }
        }

        for fence in fences {
            if let Some(f) = state.fences.get_mut(fence) {
                f.signaled = false;
            }
        }
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> RhiResult<bool> {
        self.state
            .lock()
            .fences
            .get(&fence)
            .map(|f| f.signaled)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown fence {:?}", fence)))
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let mut state = self.state.lock();
        if state.take_fault(Fault::SemaphoreCreation) {
            return Err(oom());
        }
        let semaphore = vk::Semaphore::from_raw(state.alloc_handle());
        state.semaphores.insert(
            semaphore,
            SemaphoreState {
                signaled: false,
                will_be_signaled: false,
            },
        );
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        if semaphore == vk::Semaphore::null() {
            return;
        }
        let mut state = self.state.lock();
        if state.semaphore_in_use(semaphore) {
            state.violation(format!(
                "destroy of semaphore {:?} referenced by pending work",
                semaphore
            ));
        }
        if state.semaphores.remove(&semaphore).is_none() {
            state.violation(format!("destroy of unknown semaphore {:?}", semaphore));
        }
    }

    // =========================================================================
    // Command pools and buffers
    // =========================================================================

    fn create_command_pool(
        &self,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> RhiResult<vk::CommandPool> {
        let mut state = self.state.lock();
        if state.take_fault(Fault::PoolCreation) {
            return Err(oom());
        }
        if state.queue_for_family(queue_family_index).is_none() {
            return Err(state.violation(format!(
                "command pool for nonexistent queue family {}",
                queue_family_index
            )));
        }
        let pool = vk::CommandPool::from_raw(state.alloc_handle());
        state.pools.insert(
            pool,
            PoolRecord {
                family: queue_family_index,
                flags,
            },
        );
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()> {
        if pool == vk::CommandPool::null() {
            return Ok(());
        }
        let mut state = self.state.lock();
        if !state.pools.contains_key(&pool) {
            return Err(state.violation(format!("destroy of unknown command pool {:?}", pool)));
        }
        if state.take_fault(Fault::PoolDestroy(pool)) {
            return Err(RhiError::VulkanError(vk::Result::ERROR_UNKNOWN));
        }
        if let Err(message) = state.check_pool_idle(pool, "destroy") {
            return Err(state.violation(message));
        }

        state.pools.remove(&pool);
        state.command_buffers.retain(|_, cb| cb.pool != pool);
        Ok(())
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
        count: u32,
    ) -> RhiResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        if count == 0 {
            return Err(state.violation("commandBufferCount must be greater than 0".to_string()));
        }
        if !state.pools.contains_key(&pool) {
            return Err(state.violation(format!("allocate from unknown command pool {:?}", pool)));
        }
        if state.take_fault(Fault::CommandBufferAllocation) {
            return Err(oom());
        }

        let mut buffers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let buffer = vk::CommandBuffer::from_raw(state.alloc_handle());
            state.command_buffers.insert(
                buffer,
                CommandBufferRecord {
                    pool,
                    state: CommandBufferState::Initial,
                    one_time: false,
                    commands: Vec::new(),
                },
            );
            buffers.push(buffer);
        }
        Ok(buffers)
    }

    fn free_command_buffers(
        &self,
        pool: vk::CommandPool,
        buffers: &[vk::CommandBuffer],
    ) -> RhiResult<()> {
        let mut state = self.state.lock();

        for buffer in buffers {
            let message = match state.command_buffers.get(buffer) {
                None => Some(format!("free of unknown command buffer {:?}", buffer)),
                Some(cb) if cb.pool != pool => Some(format!(
                    "free of command buffer {:?} through pool {:?}, allocated from {:?}",
                    buffer, pool, cb.pool
                )),
                Some(cb) if cb.state == CommandBufferState::Pending => Some(format!(
                    "free of command buffer {:?} while it is executing",
                    buffer
                )),
                Some(_) => None,
            };
            if let Some(message) = message {
                return Err(state.violation(message));
            }
        }

        for buffer in buffers {
            state.command_buffers.remove(buffer);
        }
        Ok(())
    }

    fn reset_command_pool(
        &self,
        pool: vk::CommandPool,
        _flags: vk::CommandPoolResetFlags,
    ) -> RhiResult<()> {
        let mut state = self.state.lock();
        if !state.pools.contains_key(&pool) {
            return Err(state.violation(format!("reset of unknown command pool {:?}", pool)));
        }
        if state.take_fault(Fault::PoolReset(pool)) {
            return Err(oom());
        }
        if let Err(message) = state.check_pool_idle(pool, "reset") {
            return Err(state.violation(message));
        }

        for cb in state.command_buffers.values_mut().filter(|cb| cb.pool == pool) {
            cb.state = CommandBufferState::Initial;
            cb.commands.clear();
        }
        Ok(())
    }

    fn trim_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()> {
        let mut state = self.state.lock();
        if !state.pools.contains_key(&pool) {
            return Err(state.violation(format!("trim of unknown command pool {:?}", pool)));
        }
        if state.take_fault(Fault::PoolTrim(pool)) {
            return Err(RhiError::VulkanError(vk::Result::ERROR_UNKNOWN));
        }
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> RhiResult<()> {
        let mut state = self.state.lock();

        let message = match state.command_buffers.get(&buffer) {
            None => Some(format!("begin of unknown command buffer {:?}", buffer)),
            Some(cb) => {
                let individual_reset = state.pools.get(&cb.pool).is_some_and(|p| {
                    p.flags
                        .contains(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                });
                match cb.state {
                    CommandBufferState::Pending | CommandBufferState::Recording => Some(format!(
                        "begin of command buffer {:?} in state {:?}",
                        buffer, cb.state
                    )),
                    CommandBufferState::Initial => None,
                    _ if !individual_reset => Some(format!(
                        "implicit reset of command buffer {:?} from a pool without RESET_COMMAND_BUFFER",
                        buffer
                    )),
                    _ => None,
                }
            }
        };
        if let Some(message) = message {
            return Err(state.violation(message));
        }

        if let Some(cb) = state.command_buffers.get_mut(&buffer) {
            cb.state = CommandBufferState::Recording;
            cb.one_time = flags.contains(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            cb.commands.clear();
        }
        Ok(())
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> RhiResult<()> {
        let mut state = self.state.lock();
        let recording = state
            .command_buffers
            .get(&buffer)
            .map(|cb| cb.state == CommandBufferState::Recording);
        match recording {
            Some(true) => {
                if let Some(cb) = state.command_buffers.get_mut(&buffer) {
                    cb.state = CommandBufferState::Executable;
                }
                Ok(())
            }
            Some(false) => Err(state.violation(format!(
                "end of command buffer {:?} that is not recording",
                buffer
            ))),
            None => Err(state.violation(format!("end of unknown command buffer {:?}", buffer))),
        }
    }

    fn cmd_image_barrier(&self, buffer: vk::CommandBuffer, barrier: &ImageBarrier) {
        record(&mut self.state.lock(), buffer, RecordedCommand::ImageBarrier(*barrier));
    }

    fn cmd_copy_buffer_to_image(
        &self,
        buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        record(
            &mut self.state.lock(),
            buffer,
            RecordedCommand::CopyBufferToImage {
                src,
                dst,
                dst_layout,
                regions: regions.to_vec(),
            },
        );
    }

    // =========================================================================
    // Memory-backed resources
    // =========================================================================

    fn create_buffer(&self, size: vk::DeviceSize, usage: BufferUsage) -> RhiResult<vk::Buffer> {
        if size == 0 {
            return Err(RhiError::InvalidArgument(
                "Buffer size must be greater than 0".to_string(),
            ));
        }
        let mut state = self.state.lock();
        let buffer = vk::Buffer::from_raw(state.alloc_handle());
        state.buffers.insert(
            buffer,
            BufferRecord {
                usage,
                data: vec![0; size as usize],
            },
        );
        Ok(buffer)
    }

    fn write_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> RhiResult<()> {
        let mut state = self.state.lock();
        let message = match state.buffers.get(&buffer) {
            None => Some(format!("write to unknown buffer {:?}", buffer)),
            Some(b) if !b.usage.is_host_visible() => Some(format!(
                "host write to {} buffer {:?}",
                b.usage.name(),
                buffer
            )),
            Some(b) if offset as usize + data.len() > b.data.len() => {
                return Err(RhiError::InvalidArgument(format!(
                    "Write exceeds buffer size: offset {} + data {} > buffer {}",
                    offset,
                    data.len(),
                    b.data.len()
                )));
            }
            Some(_) => None,
        };
        if let Some(message) = message {
            return Err(state.violation(message));
        }

        if let Some(b) = state.buffers.get_mut(&buffer) {
            let start = offset as usize;
            b.data[start..start + data.len()].copy_from_slice(data);
        }
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        if buffer == vk::Buffer::null() {
            return;
        }
        let mut state = self.state.lock();
        if state.pending_commands().any(|c| c.references_buffer(buffer)) {
            state.violation(format!(
                "destroy of buffer {:?} referenced by pending work",
                buffer
            ));
        }
        if state.buffers.remove(&buffer).is_none() {
            state.violation(format!("destroy of unknown buffer {:?}", buffer));
        }
    }

    fn create_image(&self, desc: &ImageDesc) -> RhiResult<vk::Image> {
        desc.validate()?;
        let size = desc.byte_size()? as usize;

        let mut state = self.state.lock();
        let image = vk::Image::from_raw(state.alloc_handle());
        state.images.insert(
            image,
            ImageRecord {
                desc: *desc,
                layout: vk::ImageLayout::UNDEFINED,
                data: vec![0; size],
            },
        );
        Ok(image)
    }

    fn destroy_image(&self, image: vk::Image) {
        if image == vk::Image::null() {
            return;
        }
        let mut state = self.state.lock();
        if state.pending_commands().any(|c| c.references_image(image)) {
            state.violation(format!(
                "destroy of image {:?} referenced by pending work",
                image
            ));
        }
        if state.images.remove(&image).is_none() {
            state.violation(format!("destroy of unknown image {:?}", image));
        }
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        _format: vk::Format,
        _aspect: vk::ImageAspectFlags,
    ) -> RhiResult<vk::ImageView> {
        let mut state = self.state.lock();
        if state.take_fault(Fault::ImageViewCreation) {
            return Err(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_HOST_MEMORY));
        }
        if !state.images.contains_key(&image) {
            return Err(state.violation(format!("view of unknown image {:?}", image)));
        }
        let view = vk::ImageView::from_raw(state.alloc_handle());
        state.image_views.insert(view, image);
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        if view == vk::ImageView::null() {
            return;
        }
        let mut state = self.state.lock();
        if state.image_views.remove(&view).is_none() {
            state.violation(format!("destroy of unknown image view {:?}", view));
        }
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> RhiResult<vk::Sampler> {
        let mut state = self.state.lock();
        let sampler = vk::Sampler::from_raw(state.alloc_handle());
        state.samplers.insert(sampler);
        Ok(sampler)
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        if sampler == vk::Sampler::null() {
            return;
        }
        let mut state = self.state.lock();
        if !state.samplers.remove(&sampler) {
            state.violation(format!("destroy of unknown sampler {:?}", sampler));
        }
    }
}

fn record(state: &mut State, buffer: vk::CommandBuffer, command: RecordedCommand) {
    match state.command_buffers.get_mut(&buffer) {
        Some(cb) if cb.state == CommandBufferState::Recording => cb.commands.push(command),
        Some(cb) => {
            let message = format!(
                "command recorded into {:?} in state {:?}",
                buffer, cb.state
            );
            state.violation(message);
        }
        None => {
            state.violation(format!("command recorded into unknown buffer {:?}", buffer));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SemaphoreWait;

    fn recorded_buffer(device: &HeadlessDevice, pool: vk::CommandPool) -> vk::CommandBuffer {
        let cb = device
            .allocate_command_buffers(pool, vk::CommandBufferLevel::PRIMARY, 1)
            .unwrap()[0];
        device
            .begin_command_buffer(cb, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .unwrap();
        device.end_command_buffer(cb).unwrap();
        cb
    }

    fn submit(device: &HeadlessDevice, cb: vk::CommandBuffer, fence: vk::Fence) {
        let cbs = [cb];
        let desc = SubmitDesc {
            command_buffers: &cbs,
            ..Default::default()
        };
        device
            .queue_submit(device.graphics_queue(), &desc, fence)
            .unwrap();
    }

    #[test]
    fn test_work_completes_on_fence_wait() {
        let device = HeadlessDevice::new();
        let pool = device
            .create_command_pool(0, vk::CommandPoolCreateFlags::empty())
            .unwrap();
        let fence = device.create_fence(false).unwrap();
        let cb = recorded_buffer(&device, pool);

        submit(&device, cb, fence);
        assert!(device.fence_pending(fence));
        assert_eq!(device.command_buffer_state(cb), Some(CommandBufferState::Pending));

        assert!(device.wait_for_fences(&[fence], true, u64::MAX).unwrap());
        assert!(!device.fence_pending(fence));
        assert_eq!(device.command_buffer_state(cb), Some(CommandBufferState::Invalid));
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn test_reset_of_pending_fence_is_reported() {
        let device = HeadlessDevice::new();
        let pool = device
            .create_command_pool(0, vk::CommandPoolCreateFlags::empty())
            .unwrap();
        let fence = device.create_fence(false).unwrap();
        let cb = recorded_buffer(&device, pool);
        submit(&device, cb, fence);

        assert!(matches!(
            device.reset_fences(&[fence]),
            Err(RhiError::Validation(_))
        ));
        assert_eq!(device.validation_errors().len(), 1);
    }

    #[test]
    fn test_submit_with_signaled_fence_is_reported() {
        let device = HeadlessDevice::new();
        let pool = device
            .create_command_pool(0, vk::CommandPoolCreateFlags::empty())
            .unwrap();
        let fence = device.create_fence(true).unwrap();
        let cb = recorded_buffer(&device, pool);

        let cbs = [cb];
        let desc = SubmitDesc {
            command_buffers: &cbs,
            ..Default::default()
        };
        assert!(device.queue_submit(device.graphics_queue(), &desc, fence).is_err());
        assert_eq!(device.pending_submissions(), 0);
    }

    #[test]
    fn test_wait_on_unsignaled_semaphore_is_reported() {
        let device = HeadlessDevice::new();
        let semaphore = device.create_semaphore().unwrap();
        let waits = [SemaphoreWait {
            semaphore,
            stage: vk::PipelineStageFlags::TOP_OF_PIPE,
        }];
        let desc = SubmitDesc {
            wait_semaphores: &waits,
            ..Default::default()
        };
        assert!(
            device
                .queue_submit(device.graphics_queue(), &desc, vk::Fence::null())
                .is_err()
        );
    }

    #[test]
    fn test_semaphore_chain_across_submissions() {
        let device = HeadlessDevice::new();
        let semaphore = device.create_semaphore().unwrap();
        let fence = device.create_fence(false).unwrap();
        let queue = device.graphics_queue();

        let signals = [semaphore];
        device
            .queue_submit(
                queue,
                &SubmitDesc {
                    signal_semaphores: &signals,
                    ..Default::default()
                },
                vk::Fence::null(),
            )
            .unwrap();

        let waits = [SemaphoreWait {
            semaphore,
            stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        }];
        device
            .queue_submit(
                queue,
                &SubmitDesc {
                    wait_semaphores: &waits,
                    ..Default::default()
                },
                fence,
            )
            .unwrap();

        assert!(device.wait_for_fences(&[fence], true, u64::MAX).unwrap());
        assert_eq!(device.pending_submissions(), 0);
        device.destroy_semaphore(semaphore);
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn test_stalled_device() {
        let device = HeadlessDevice::new();
        let pool = device
            .create_command_pool(0, vk::CommandPoolCreateFlags::empty())
            .unwrap();
        let fence = device.create_fence(false).unwrap();
        let cb = recorded_buffer(&device, pool);
        submit(&device, cb, fence);

        device.stall(true);
        assert!(!device.wait_for_fences(&[fence], true, 1_000_000).unwrap());
        let err = device.wait_for_fences(&[fence], true, u64::MAX).unwrap_err();
        assert!(err.is_device_lost());
        assert!(device.wait_idle().unwrap_err().is_device_lost());

        device.stall(false);
        device.wait_idle().unwrap();
        assert!(device.fence_status(fence).unwrap());
    }

    #[test]
    fn test_infinite_wait_without_work_is_reported() {
        let device = HeadlessDevice::new();
        let fence = device.create_fence(false).unwrap();
        assert!(matches!(
            device.wait_for_fences(&[fence], true, u64::MAX),
            Err(RhiError::Validation(_))
        ));
    }

    #[test]
    fn test_free_of_executing_buffer_is_reported() {
        let device = HeadlessDevice::new();
        let pool = device
            .create_command_pool(0, vk::CommandPoolCreateFlags::empty())
            .unwrap();
        let cb = recorded_buffer(&device, pool);
        submit(&device, cb, vk::Fence::null());

        assert!(device.free_command_buffers(pool, &[cb]).is_err());
        assert!(device.reset_command_pool(pool, vk::CommandPoolResetFlags::empty()).is_err());

        device.queue_wait_idle(device.graphics_queue()).unwrap();
        device.free_command_buffers(pool, &[cb]).unwrap();
        assert_eq!(device.live_command_buffers(), 0);
    }

    #[test]
    fn test_rerecord_requires_individual_reset() {
        let device = HeadlessDevice::new();
        let pool = device
            .create_command_pool(0, vk::CommandPoolCreateFlags::empty())
            .unwrap();
        let cb = recorded_buffer(&device, pool);
        assert!(
            device
                .begin_command_buffer(cb, vk::CommandBufferUsageFlags::empty())
                .is_err()
        );

        device
            .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())
            .unwrap();
        device
            .begin_command_buffer(cb, vk::CommandBufferUsageFlags::empty())
            .unwrap();
    }

    #[test]
    fn test_zero_count_allocation_is_reported() {
        let device = HeadlessDevice::new();
        let pool = device
            .create_command_pool(0, vk::CommandPoolCreateFlags::empty())
            .unwrap();
        assert!(
            device
                .allocate_command_buffers(pool, vk::CommandBufferLevel::PRIMARY, 0)
                .is_err()
        );
    }

    #[test]
    fn test_faults_are_one_shot() {
        let device = HeadlessDevice::new();
        device.inject_fault(Fault::FenceCreation);
        assert!(device.create_fence(true).is_err());
        assert!(device.create_fence(true).is_ok());
    }

    #[test]
    fn test_dedicated_queues() {
        let device = HeadlessDevice::with_dedicated_queues();
        assert!(device.transfer_queue().is_some());
        assert!(device.compute_queue().is_some());
        assert_ne!(device.transfer_queue(), Some(device.graphics_queue()));

        let plain = HeadlessDevice::new();
        assert!(plain.transfer_queue().is_none());
        assert!(plain.compute_queue().is_none());
    }

    #[test]
    fn test_copy_requires_transfer_dst_layout() {
        let device = HeadlessDevice::new();
        let pool = device
            .create_command_pool(0, vk::CommandPoolCreateFlags::empty())
            .unwrap();
        let image = device
            .create_image(&ImageDesc::texture(
                vk::Extent2D {
                    width: 1,
                    height: 1,
                },
                vk::Format::R8_UNORM,
            ))
            .unwrap();
        let buffer = device.create_buffer(1, BufferUsage::Staging).unwrap();

        let cb = device
            .allocate_command_buffers(pool, vk::CommandBufferLevel::PRIMARY, 1)
            .unwrap()[0];
        device
            .begin_command_buffer(cb, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .unwrap();
        let region = vk::BufferImageCopy::default().image_extent(vk::Extent3D {
            width: 1,
            height: 1,
            depth: 1,
        });
        device.cmd_copy_buffer_to_image(
            cb,
            buffer,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
        device.end_command_buffer(cb).unwrap();
        submit(&device, cb, vk::Fence::null());
        device.wait_idle().unwrap();

        let errors = device.validation_errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("TRANSFER_DST_OPTIMAL"));
    }
}
