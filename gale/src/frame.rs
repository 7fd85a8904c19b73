// Per-frame data and submission
//
// The queue round-robins over MAX_INFLIGHT_FRAMES of these slots.
// Each slot owns its command pools, fence, deleter lists and push
// buffers; cross-thread handoff points (fence readiness, sync
// completion) live in the slot's FrameSync.

use ash::vk;

use crate::device::Device;
use crate::memory::{PushBuffer, PushBufferKind};
use crate::profile::ProfileContext;
use crate::resource::ResourceId;
use crate::step::Step;
use crate::{GaleError, Result};
use utils::log;

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};

/// What the render thread should do with a popped task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RunType {
    /// Run steps, then finalize and submit the frame.
    Submit,
    /// Run steps, then wait for the GPU and signal sync_done.
    Sync,
    /// Present the frame's swapchain image.
    Present,
    /// Rebuild the swapchain (frame boundary only).
    RecreateSwapchain,
    /// Leave the thread loop.
    Exit,
}

pub struct RenderThreadTask {
    pub run_type: RunType,
    pub frame: usize,
    pub steps: Vec<Step>,
    /// Resource materialization recorded by the emu thread for this
    /// frame.
    pub init_steps: Vec<crate::queue::InitStep>,
    /// Framebuffers whose deletion was queued this frame; the runner
    /// drops its layout knowledge of them once the steps have run.
    pub forget_fbs: Vec<ResourceId>,
}

/// Emu-thread <-> render-thread handoff points for one slot.
pub struct FrameSync {
    /// Set by the render thread once the frame's work is queued and
    /// its fence may be waited on from the recording thread.
    pub ready_for_fence: Mutex<bool>,
    pub fence_cond: Condvar,

    /// Set when a Sync task has fully drained the GPU.
    pub sync_done: Mutex<bool>,
    pub sync_cond: Condvar,
}

impl FrameSync {
    pub fn new() -> Self {
        Self {
            ready_for_fence: Mutex::new(true),
            fence_cond: Condvar::new(),
            sync_done: Mutex::new(false),
            sync_cond: Condvar::new(),
        }
    }
}

/// Deferred destruction entry: runs with the device after the slot's
/// fence has cleared.
pub type Deleter = Box<dyn FnOnce(&Device) + Send>;

/// A host-visible buffer a readback landed in, kept for reuse.
pub struct CachedReadback {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    pub is_coherent: bool,
}

impl CachedReadback {
    pub fn empty() -> Self {
        Self {
            buffer: vk::Buffer::null(),
            memory: vk::DeviceMemory::null(),
            size: 0,
            is_coherent: true,
        }
    }

    pub fn destroy(&mut self, dev: &Device) {
        if self.buffer != vk::Buffer::null() && !dev.skip_destroys() {
            unsafe {
                dev.dev.destroy_buffer(self.buffer, None);
                dev.dev.free_memory(self.memory, None);
            }
        }
        self.buffer = vk::Buffer::null();
        self.memory = vk::DeviceMemory::null();
        self.size = 0;
    }
}

/// Delayed readbacks cache buffers by source and size.
pub type ReadbackKey = (ResourceId, u32, u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameSubmitType {
    /// Flush whatever is recorded so far, no synchronization.
    Pending,
    /// Final submission of the frame: signals the fence and the
    /// rendering-complete semaphore.
    FinishFrame,
    /// Submission for a mid-frame sync: signals the readback fence.
    Sync,
}

/// Semaphores shared by all frame slots.
pub struct FrameDataShared {
    pub acquire_semaphore: vk::Semaphore,
    pub rendering_complete_semaphore: vk::Semaphore,
    /// Two vkQueueSubmits per frame (main, then present) instead of
    /// one when set.
    pub split_submit: bool,
}

impl FrameDataShared {
    pub fn new(dev: &Device, split_submit: bool) -> Self {
        let info = vk::SemaphoreCreateInfo::builder();
        unsafe {
            Self {
                acquire_semaphore: dev.dev.create_semaphore(&info, None).unwrap(),
                rendering_complete_semaphore: dev.dev.create_semaphore(&info, None).unwrap(),
                split_submit,
            }
        }
    }

    pub fn destroy(&self, dev: &Device) {
        unsafe {
            dev.dev.destroy_semaphore(self.acquire_semaphore, None);
            dev.dev
                .destroy_semaphore(self.rendering_complete_semaphore, None);
        }
    }
}

pub struct FrameData {
    pub fence: vk::Fence,
    pub readback_fence: vk::Fence,
    pub readback_fence_used: bool,

    /// Init commands run on a separate pool because they are
    /// recorded from the other thread.
    pub cmd_pool_init: vk::CommandPool,
    pub cmd_pool_main: vk::CommandPool,
    pub init_cmd: vk::CommandBuffer,
    pub main_cmd: vk::CommandBuffer,
    pub present_cmd: vk::CommandBuffer,
    pub has_init_commands: bool,
    pub has_main_commands: bool,
    pub has_present_commands: bool,

    // Swapchain state for this frame.
    pub has_acquired: bool,
    pub cur_swapchain_image: u32,
    pub skip_swap: bool,

    pub deleters: Vec<Deleter>,
    pub prev_deleters: Vec<Deleter>,

    pub push_vertex: PushBuffer,
    pub push_index: PushBuffer,
    pub push_uniform: PushBuffer,
    pub push_staging: PushBuffer,

    pub readbacks: HashMap<ReadbackKey, CachedReadback>,
    pub profile: ProfileContext,
    pub frame_id: u64,
}

impl FrameData {
    pub fn new(dev: &std::sync::Arc<Device>, queue_family: u32) -> Result<Self> {
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        let unsignaled = vk::FenceCreateInfo::builder();
        let fence = unsafe { dev.dev.create_fence(&fence_info, None).unwrap() };
        let readback_fence = unsafe { dev.dev.create_fence(&unsignaled, None).unwrap() };

        let cmd_pool_init = dev.create_command_pool(queue_family);
        let cmd_pool_main = dev.create_command_pool(queue_family);
        let init_cmd = dev.create_command_buffers(cmd_pool_init, 1)[0];
        let bufs = dev.create_command_buffers(cmd_pool_main, 2);

        Ok(Self {
            fence,
            readback_fence,
            readback_fence_used: false,
            cmd_pool_init,
            cmd_pool_main,
            init_cmd,
            main_cmd: bufs[0],
            present_cmd: bufs[1],
            has_init_commands: false,
            has_main_commands: false,
            has_present_commands: false,
            has_acquired: false,
            cur_swapchain_image: 0,
            skip_swap: false,
            deleters: Vec::new(),
            prev_deleters: Vec::new(),
            push_vertex: PushBuffer::new(
                dev.clone(),
                "vertex",
                512 * 1024,
                vk::BufferUsageFlags::VERTEX_BUFFER,
                PushBufferKind::CpuToGpu,
            )?,
            push_index: PushBuffer::new(
                dev.clone(),
                "index",
                128 * 1024,
                vk::BufferUsageFlags::INDEX_BUFFER,
                PushBufferKind::CpuToGpu,
            )?,
            push_uniform: PushBuffer::new(
                dev.clone(),
                "uniform",
                256 * 1024,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                PushBufferKind::CpuToGpu,
            )?,
            push_staging: PushBuffer::new(
                dev.clone(),
                "staging",
                1024 * 1024,
                vk::BufferUsageFlags::TRANSFER_SRC,
                PushBufferKind::CpuToGpu,
            )?,
            readbacks: HashMap::new(),
            profile: ProfileContext::new(),
            frame_id: 0,
        })
    }

    /// The init cbuf, beginning it on first use this frame.
    pub fn get_init_cmd(&mut self, dev: &Device) -> vk::CommandBuffer {
        if !self.has_init_commands {
            unsafe {
                dev.dev
                    .reset_command_pool(self.cmd_pool_init, vk::CommandPoolResetFlags::empty())
                    .unwrap();
                let begin = vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
                dev.dev.begin_command_buffer(self.init_cmd, &begin).unwrap();
            }
            self.has_init_commands = true;
        }
        self.init_cmd
    }

    /// Begin the main cbuf for this frame if it hasn't been.
    /// Resetting the main pool also resets the present cbuf.
    pub fn begin_main_cmd(&mut self, dev: &Device) {
        if !self.has_main_commands {
            unsafe {
                dev.dev
                    .reset_command_pool(self.cmd_pool_main, vk::CommandPoolResetFlags::empty())
                    .unwrap();
                let begin = vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
                dev.dev.begin_command_buffer(self.main_cmd, &begin).unwrap();
            }
            self.has_main_commands = true;
        }
    }

    pub fn begin_present_cmd(&mut self, dev: &Device) {
        if !self.has_present_commands {
            unsafe {
                let begin = vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
                dev.dev
                    .begin_command_buffer(self.present_cmd, &begin)
                    .unwrap();
            }
            self.has_present_commands = true;
        }
    }

    /// Close out recorded cbufs and hand them to the queue.
    ///
    /// Pending submissions flush early work so the GPU isn't idle
    /// while we wait on the swapchain; the finish/sync variants hang
    /// the frame's synchronization on the last submission.
    pub fn submit(
        &mut self,
        dev: &Device,
        shared: &FrameDataShared,
        sub_type: FrameSubmitType,
    ) -> Result<()> {
        let mut cbufs: Vec<vk::CommandBuffer> = Vec::new();

        unsafe {
            if self.has_init_commands {
                dev.dev
                    .end_command_buffer(self.init_cmd)
                    .or(Err(GaleError::INVALID))?;
                cbufs.push(self.init_cmd);
                self.has_init_commands = false;
            }
            if self.has_main_commands {
                dev.dev
                    .end_command_buffer(self.main_cmd)
                    .or(Err(GaleError::INVALID))?;
                cbufs.push(self.main_cmd);
                self.has_main_commands = false;
            }

            if sub_type == FrameSubmitType::Pending {
                if !cbufs.is_empty() {
                    let submit = vk::SubmitInfo::builder()
                        .command_buffers(cbufs.as_slice())
                        .build();
                    dev.dev
                        .queue_submit(dev.graphics_queue, &[submit], vk::Fence::null())
                        .or(Err(GaleError::INVALID))?;
                }
                return Ok(());
            }

            if self.has_present_commands {
                dev.dev
                    .end_command_buffer(self.present_cmd)
                    .or(Err(GaleError::INVALID))?;

                if shared.split_submit && !cbufs.is_empty() {
                    // Kick the main work off on its own first.
                    let submit = vk::SubmitInfo::builder()
                        .command_buffers(cbufs.as_slice())
                        .build();
                    dev.dev
                        .queue_submit(dev.graphics_queue, &[submit], vk::Fence::null())
                        .or(Err(GaleError::INVALID))?;
                    cbufs.clear();
                }
                cbufs.push(self.present_cmd);
                self.has_present_commands = false;
            }

            let fence = match sub_type {
                FrameSubmitType::FinishFrame => self.fence,
                FrameSubmitType::Sync => {
                    self.readback_fence_used = true;
                    self.readback_fence
                }
                FrameSubmitType::Pending => unreachable!(),
            };

            let wait_semas;
            let wait_stages;
            let signal_semas;
            if sub_type == FrameSubmitType::FinishFrame && self.has_acquired {
                wait_semas = vec![shared.acquire_semaphore];
                wait_stages = vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
                signal_semas = vec![shared.rendering_complete_semaphore];
            } else {
                wait_semas = Vec::new();
                wait_stages = Vec::new();
                signal_semas = Vec::new();
            }

            let submit = vk::SubmitInfo::builder()
                .command_buffers(cbufs.as_slice())
                .wait_semaphores(wait_semas.as_slice())
                .wait_dst_stage_mask(wait_stages.as_slice())
                .signal_semaphores(signal_semas.as_slice())
                .build();
            dev.dev
                .queue_submit(dev.graphics_queue, &[submit], fence)
                .or(Err(GaleError::INVALID))?;

            if sub_type == FrameSubmitType::Sync {
                // Stall until the GPU has drained this frame's work.
                // Device loss is only ever detected here.
                match dev.dev.wait_for_fences(&[self.readback_fence], true, u64::MAX) {
                    Ok(_) => {}
                    Err(vk::Result::ERROR_DEVICE_LOST) => {
                        panic!("Device lost in wait_for_fences");
                    }
                    Err(_) => return Err(GaleError::TIMEOUT),
                }
                dev.dev
                    .reset_fences(&[self.readback_fence])
                    .or(Err(GaleError::INVALID))?;
                self.readback_fence_used = false;
            }
        }

        Ok(())
    }

    /// Run and clear the previous frame's deleters. BeginFrame, after
    /// this slot's fence has been waited on.
    pub fn run_prev_deleters(&mut self, dev: &Device) {
        let deleters = std::mem::take(&mut self.prev_deleters);
        if !deleters.is_empty() {
            log::verbose!("running {} deferred deleters", deleters.len());
        }
        for d in deleters {
            d(dev);
        }
        self.prev_deleters = std::mem::take(&mut self.deleters);
    }

    /// Run everything that is still queued, regardless of fences.
    /// Teardown only; the device's skip flag governs whether the
    /// driver is actually called.
    pub fn drain_deleters(&mut self, dev: &Device) {
        for d in std::mem::take(&mut self.prev_deleters) {
            d(dev);
        }
        for d in std::mem::take(&mut self.deleters) {
            d(dev);
        }
    }

    pub fn destroy(&mut self, dev: &Device) {
        self.drain_deleters(dev);
        for (_, mut cached) in self.readbacks.drain() {
            cached.destroy(dev);
        }
        self.profile.destroy(dev);
        unsafe {
            dev.dev.destroy_fence(self.fence, None);
            dev.dev.destroy_fence(self.readback_fence, None);
            dev.dev.destroy_command_pool(self.cmd_pool_init, None);
            dev.dev.destroy_command_pool(self.cmd_pool_main, None);
        }
    }
}
