// The render queue
//
// This takes the role a GL driver plays of sequencing and optimizing
// render passes. The emulator records state changes and draws here on
// its own thread; full frames of steps are handed to the render
// thread, which preprocesses and executes them. Resource creation is
// recorded as init work and materialized by the render thread before
// the frame's steps run.
//
// After starting a new render step, viewport, scissor, stencil and
// blend state do not carry over and must be set again before drawing.

use ash::vk;

use crate::descriptor::{BindingType, PackedDescriptor, PipelineLayout};
use crate::device::Device;
use crate::display::Display;
use crate::format::DataFormat;
use crate::frame::{
    FrameData, FrameDataShared, FrameSubmitType, FrameSync, RenderThreadTask, RunType,
};
use crate::optimize::preprocess_steps;
pub use crate::optimize::QueueHacks;
use crate::pipeline::{
    CompileQueueEntry, GraphicsPipeline, PipelineDesc, RenderPassType, StoredPipelineKey,
};
use crate::resource::{
    Buffer, BufferUsage, Framebuffer, ResourceId, SamplerDesc, SamplerState, ShaderModule,
    ShaderStage,
};
use crate::runner::{
    copy_readback_buffer, QueueRunner, RenderPassCache, RenderPassFormats, RpKey,
};
use crate::step::{
    BoundingRect, CopyStep, LoadAction, PipelineFlags, ReadbackImageStep, ReadbackStep,
    RenderCommand, RenderStep, Step, StepKind, StoreAction, TransitionRequest,
};
use crate::step::{
    bump_num_reads_backwards, cleanup_render_commands, remove_draw_commands,
    stamp_final_layout_backwards, BlitStep,
};
use crate::{CreateInfo, GaleError, GpuVendor, Result, MAX_INFLIGHT_FRAMES};
use crate::frame::CachedReadback;
use utils::log;

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReadbackMode {
    /// Stall until the data is on the CPU.
    Block,
    /// Return whatever a previous frame's readback produced; kicks
    /// off a new one for later.
    OldDataOk,
}

/// Data upload work recorded by the emu thread, executed by the
/// render thread into the frame's init command buffer before any step
/// runs. Handle creation itself is immediate (vulkan resource
/// creation is free-threaded); what defers is everything that needs
/// the staging buffer or a command buffer.
pub enum InitStep {
    UploadTexture {
        tex: Arc<Texture>,
        /// One entry per mip level, tightly packed.
        levels: Vec<Vec<u8>>,
    },
    TextureSubImage {
        tex: Arc<Texture>,
        mip: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        data: Vec<u8>,
    },
    BufferSubdata {
        buf: Arc<Buffer>,
        offset: u64,
        data: Vec<u8>,
    },
    GenerateMips {
        tex: Arc<Texture>,
    },
}

use crate::resource::Texture;

struct CompileState {
    queue: Vec<CompileQueueEntry>,
    run: bool,
}

/// State shared between the recording, render and compile threads.
struct QueueShared {
    tasks: Mutex<VecDeque<RenderThreadTask>>,
    push_cond: Condvar,

    compile: Mutex<CompileState>,
    compile_cond: Condvar,

    /// Registered pipeline layouts, for descriptor flush/reset.
    layouts: Mutex<Vec<Arc<PipelineLayout>>>,

    /// Swapchain OUT_OF_DATE events since the last good present.
    out_of_date_frames: AtomicU32,

    /// Recent present timings, newest last.
    frame_times: Mutex<VecDeque<FrameTimeEntry>>,
}

/// When a frame actually reached the presentation engine, stamped on
/// the render thread right after vkQueuePresentKHR.
#[derive(Debug, Copy, Clone)]
pub struct FrameTimeEntry {
    pub frame_id: u64,
    pub queue_present_ms: u64,
}

const FRAME_TIME_HISTORY_LENGTH: usize = 32;

/// One frame slot: cross-thread sync points plus the data only one
/// side touches at a time.
pub(crate) struct FrameSlot {
    pub sync: FrameSync,
    pub data: Mutex<FrameData>,
}

pub struct RenderQueue {
    rq_dev: Arc<Device>,
    rq_shared: Arc<QueueShared>,
    rq_frames: Arc<Vec<FrameSlot>>,
    rq_rp_cache: Arc<RenderPassCache>,
    rq_sync_readback: Arc<Mutex<CachedReadback>>,
    rq_frame_shared: Arc<FrameDataShared>,
    /// Pipeline cache handed to the compile thread; also the one we
    /// serialize.
    rq_pipeline_cache: vk::PipelineCache,
    rq_pipelines: Mutex<Vec<Arc<GraphicsPipeline>>>,

    rq_render_thread: Option<thread::JoinHandle<()>>,
    rq_compile_thread: Option<thread::JoinHandle<()>>,

    // ---- recording state, emu thread only ----
    rq_steps: Vec<Step>,
    /// Index into rq_steps of the open render step, if any.
    rq_cur_step: Option<usize>,
    rq_cur_step_has_viewport: bool,
    rq_cur_step_has_scissor: bool,
    rq_cur_pipeline_flags: PipelineFlags,
    rq_cur_render_area: BoundingRect,
    rq_cur_width: u32,
    rq_cur_height: u32,
    rq_inside_frame: bool,
    rq_cur_frame: usize,
    rq_frame_id: u64,
    rq_init_steps: Vec<InitStep>,
    /// Framebuffers deleted this frame; forwarded to the runner so it
    /// can drop their layout state.
    rq_pending_forget: Vec<ResourceId>,
    /// Pipelines bound during the current step; checked for a variant
    /// of the step's final type when the step closes.
    rq_pipelines_to_check: Vec<Arc<GraphicsPipeline>>,
}

impl RenderQueue {
    /// Bring the queue up over a display. Spawns the render and
    /// compile threads; the queue is ready for begin_frame when this
    /// returns.
    pub fn new(dev: Arc<Device>, display: Display, info: &CreateInfo) -> Result<Self> {
        let formats = RenderPassFormats {
            color: vk::Format::R8G8B8A8_UNORM,
            depth: Device::vk_format(dev.d_caps.preferred_depth_format),
            backbuffer: display.d_surface_format.format,
            backbuffer_depth: display.d_depth_format,
        };
        let rp_cache = RenderPassCache::new(formats);
        let sync_readback = Arc::new(Mutex::new(CachedReadback::empty()));
        let frame_shared = Arc::new(FrameDataShared::new(&dev, info.split_submit));

        let mut slots = Vec::new();
        for _ in 0..MAX_INFLIGHT_FRAMES {
            slots.push(FrameSlot {
                sync: FrameSync::new(),
                data: Mutex::new(FrameData::new(&dev, dev.graphics_queue_family)?),
            });
        }
        let frames = Arc::new(slots);

        let shared = Arc::new(QueueShared {
            tasks: Mutex::new(VecDeque::new()),
            push_cond: Condvar::new(),
            compile: Mutex::new(CompileState {
                queue: Vec::new(),
                run: true,
            }),
            compile_cond: Condvar::new(),
            layouts: Mutex::new(Vec::new()),
            out_of_date_frames: AtomicU32::new(0),
            frame_times: Mutex::new(VecDeque::new()),
        });

        let cache_info = vk::PipelineCacheCreateInfo::builder();
        let pipeline_cache = unsafe {
            dev.dev
                .create_pipeline_cache(&cache_info, None)
                .or(Err(GaleError::OUT_OF_MEMORY))?
        };

        let render_thread = {
            let dev = dev.clone();
            let shared = shared.clone();
            let frames = frames.clone();
            let rp_cache = rp_cache.clone();
            let sync_readback = sync_readback.clone();
            let frame_shared = frame_shared.clone();
            let hacks = info.hacks;
            thread::Builder::new()
                .name("GaleRenderThread".to_string())
                .spawn(move || {
                    render_thread_func(
                        dev,
                        shared,
                        frames,
                        rp_cache,
                        sync_readback,
                        frame_shared,
                        display,
                        hacks,
                    );
                })
                .unwrap()
        };

        let compile_thread = {
            let dev = dev.clone();
            let shared = shared.clone();
            thread::Builder::new()
                .name("GaleShaderCompile".to_string())
                .spawn(move || {
                    compile_thread_func(dev, shared, pipeline_cache);
                })
                .unwrap()
        };

        Ok(Self {
            rq_dev: dev,
            rq_shared: shared,
            rq_frames: frames,
            rq_rp_cache: rp_cache,
            rq_sync_readback: sync_readback,
            rq_frame_shared: frame_shared,
            rq_pipeline_cache: pipeline_cache,
            rq_pipelines: Mutex::new(Vec::new()),
            rq_render_thread: Some(render_thread),
            rq_compile_thread: Some(compile_thread),
            rq_steps: Vec::new(),
            rq_cur_step: None,
            rq_cur_step_has_viewport: false,
            rq_cur_step_has_scissor: false,
            rq_cur_pipeline_flags: PipelineFlags::empty(),
            rq_cur_render_area: BoundingRect::new(),
            rq_cur_width: 0,
            rq_cur_height: 0,
            rq_inside_frame: false,
            rq_cur_frame: 0,
            rq_frame_id: 0,
            rq_init_steps: Vec::new(),
            rq_pending_forget: Vec::new(),
            rq_pipelines_to_check: Vec::new(),
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.rq_dev
    }

    pub fn current_frame(&self) -> usize {
        self.rq_cur_frame
    }

    /// Frame-unique id of the step being recorded; callers watch this
    /// to know when to re-send dynamic state.
    pub fn current_step_id(&self) -> usize {
        self.rq_steps.len()
    }

    /// Recent present timings, oldest first.
    pub fn frame_time_history(&self) -> Vec<FrameTimeEntry> {
        self.rq_shared
            .frame_times
            .lock()
            .unwrap()
            .iter()
            .copied()
            .collect()
    }

    /// Accepting a few out-of-date presents makes shutdown simpler,
    /// so only report after the whole pipeline's worth piled up.
    pub fn needs_swapchain_recreate(&self) -> bool {
        self.rq_shared.out_of_date_frames.load(Ordering::Relaxed) > MAX_INFLIGHT_FRAMES as u32
    }

    // ------------------------------------------------------------------
    // Frame lifecycle

    /// Makes sure that the GPU has caught up enough that we can start
    /// writing buffers of this frame again.
    pub fn begin_frame(&mut self, enable_profiling: bool) -> Result<()> {
        debug_assert!(!self.rq_inside_frame);
        let slot = &self.rq_frames[self.rq_cur_frame];

        // The previous submission of this slot has to have been
        // handed to the queue before we may wait on its fence from
        // this thread.
        {
            let mut ready = slot.sync.ready_for_fence.lock().unwrap();
            while !*ready {
                ready = slot.sync.fence_cond.wait(ready).unwrap();
            }
            *ready = false;
        }

        let mut frame = slot.data.lock().unwrap();

        // The very first Vulkan call of the frame: make sure the last
        // command buffer this slot submitted has fully executed.
        unsafe {
            match self
                .rq_dev
                .dev
                .wait_for_fences(&[frame.fence], true, u64::MAX)
            {
                Ok(_) => {}
                Err(vk::Result::ERROR_DEVICE_LOST) => {
                    panic!("Device lost in wait_for_fences");
                }
                Err(_) => return Err(GaleError::TIMEOUT),
            }
            self.rq_dev
                .dev
                .reset_fences(&[frame.fence])
                .or(Err(GaleError::INVALID))?;
        }

        frame.frame_id = self.rq_frame_id;
        self.rq_frame_id += 1;

        frame.run_prev_deleters(&self.rq_dev);

        for layout in self.rq_shared.layouts.lock().unwrap().iter() {
            layout.reset_frame(self.rq_cur_frame);
        }

        let init_cmd = frame.get_init_cmd(&self.rq_dev);
        let (valid_bits, period) = self.rq_dev.timestamp_info();
        let frame = &mut *frame;
        frame
            .profile
            .begin_frame(&self.rq_dev, enable_profiling, valid_bits, period, init_cmd);

        frame.push_vertex.begin()?;
        frame.push_index.begin()?;
        frame.push_uniform.begin()?;

        self.rq_inside_frame = true;
        Ok(())
    }

    /// The profiling summary collected for the frame before this slot
    /// last rotated.
    pub fn gpu_profile_string(&self) -> String {
        let frame = self.rq_frames[self.rq_cur_frame].data.lock().unwrap();
        frame.profile.summary.clone()
    }

    /// Close the step list and hand it to the render thread.
    /// Can run on a different thread than present()!
    pub fn finish_frame(&mut self) {
        debug_assert!(self.rq_inside_frame);
        self.end_cur_render_step();

        // A bit of cleanup on render commands now so the runner
        // doesn't chew on dead state.
        for step in self.rq_steps.iter_mut() {
            if let StepKind::Render(r) = &mut step.kind {
                cleanup_render_commands(&mut r.commands);
            }
        }

        {
            let mut frame = self.rq_frames[self.rq_cur_frame].data.lock().unwrap();
            frame.push_vertex.end();
            frame.push_index.end();
            frame.push_uniform.end();
        }

        let task = RenderThreadTask {
            run_type: RunType::Submit,
            frame: self.rq_cur_frame,
            steps: std::mem::take(&mut self.rq_steps),
            init_steps: std::mem::take(&mut self.rq_init_steps),
            forget_fbs: std::mem::take(&mut self.rq_pending_forget),
        };
        self.push_task(task);
    }

    /// Queue the present and move to the next frame slot.
    pub fn present(&mut self) {
        let task = RenderThreadTask {
            run_type: RunType::Present,
            frame: self.rq_cur_frame,
            steps: Vec::new(),
            init_steps: Vec::new(),
            forget_fbs: Vec::new(),
        };
        self.push_task(task);

        self.rq_cur_frame = (self.rq_cur_frame + 1) % MAX_INFLIGHT_FRAMES;
        self.rq_inside_frame = false;
    }

    /// Ask the render thread to rebuild the swapchain. Only valid
    /// between frames.
    pub fn recreate_swapchain(&mut self) {
        debug_assert!(!self.rq_inside_frame);
        self.rq_shared.out_of_date_frames.store(0, Ordering::Relaxed);
        self.push_task(RenderThreadTask {
            run_type: RunType::RecreateSwapchain,
            frame: self.rq_cur_frame,
            steps: Vec::new(),
            init_steps: Vec::new(),
            forget_fbs: Vec::new(),
        });
    }

    fn push_task(&self, task: RenderThreadTask) {
        let mut tasks = self.rq_shared.tasks.lock().unwrap();
        tasks.push_back(task);
        self.rq_shared.push_cond.notify_one();
    }

    /// Bad for performance but sometimes necessary for synchronous
    /// CPU readbacks (screenshots and whatnot).
    fn flush_sync(&mut self) {
        debug_assert!(self.rq_cur_step.is_none());
        let cur = self.rq_cur_frame;

        let task = RenderThreadTask {
            run_type: RunType::Sync,
            frame: cur,
            steps: std::mem::take(&mut self.rq_steps),
            init_steps: std::mem::take(&mut self.rq_init_steps),
            forget_fbs: std::mem::take(&mut self.rq_pending_forget),
        };
        self.push_task(task);

        let slot = &self.rq_frames[cur];
        let mut done = slot.sync.sync_done.lock().unwrap();
        while !*done {
            done = slot.sync.sync_cond.wait(done).unwrap();
        }
        *done = false;
    }

    // ------------------------------------------------------------------
    // Step recording

    fn cur_render_step(&mut self) -> &mut RenderStep {
        let idx = self
            .rq_cur_step
            .expect("recording requires an open render step");
        match &mut self.rq_steps[idx].kind {
            StepKind::Render(r) => r,
            _ => unreachable!(),
        }
    }

    /// Close the current render step: derive its render-pass-type,
    /// fix up its render area and pre-register pipeline compiles.
    fn end_cur_render_step(&mut self) {
        let idx = match self.rq_cur_step {
            Some(idx) => idx,
            None => return,
        };

        let key;
        let rp_type;
        let sample_count;
        {
            let step = match &mut self.rq_steps[idx].kind {
                StepKind::Render(r) => r,
                _ => unreachable!(),
            };

            key = RpKey {
                color_load: step.color_load,
                depth_load: step.depth_load,
                stencil_load: step.stencil_load,
                color_store: step.color_store,
                depth_store: step.depth_store,
                stencil_store: step.stencil_store,
            };

            // The accumulated pipeline flags tell us whether the pass
            // needs its depth attachment at all.
            step.pipeline_flags = self.rq_cur_pipeline_flags;
            let uses_depth = self
                .rq_cur_pipeline_flags
                .contains(PipelineFlags::USES_DEPTH_STENCIL);
            let mut ty = if uses_depth {
                RenderPassType::HAS_DEPTH
            } else {
                RenderPassType::DEFAULT
            };

            match &step.framebuffer {
                None => ty = RenderPassType::BACKBUFFER | RenderPassType::HAS_DEPTH,
                Some(fb) => {
                    if ty.has_depth() && !fb.has_depth() {
                        log::error!(
                            "depth-writing pipeline on a framebuffer without depth: {}",
                            fb.tag()
                        );
                        ty = RenderPassType::DEFAULT;
                    }
                    // Layered framebuffers control the pass type; we
                    // don't support rendering to a single layer of a
                    // multilayer framebuffer.
                    if fb.fb_layers > 1 {
                        ty |= RenderPassType::MULTIVIEW;
                    }
                    if fb.fb_samples != vk::SampleCountFlags::TYPE_1 {
                        ty |= RenderPassType::MULTISAMPLE;
                    }
                }
            }

            step.render_pass_type = ty;
            rp_type = ty;
            sample_count = step
                .framebuffer
                .as_ref()
                .map(|fb| fb.fb_samples)
                .unwrap_or(vk::SampleCountFlags::TYPE_1);

            // We don't do the tight render area optimization for very
            // small targets, not worth it.
            if !self.rq_cur_render_area.is_empty()
                && self.rq_cur_width > 32
                && self.rq_cur_height > 32
            {
                step.render_area = self.rq_cur_render_area.to_rect2d();
            } else {
                step.render_area = vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: vk::Extent2D {
                        width: self.rq_cur_width,
                        height: self.rq_cur_height,
                    },
                };
            }
        }
        self.rq_cur_render_area.reset();

        // Kick off compiles for any bound pipeline that has no
        // variant for this step's type yet.
        let mut needs_compile = false;
        {
            let rp_obj = self.rq_rp_cache.get(key);
            let formats = *self.rq_rp_cache.formats();
            for pipeline in self.rq_pipelines_to_check.drain(..) {
                if let Some(promise) = pipeline.claim_variant(rp_type) {
                    let compatible =
                        rp_obj.get(&self.rq_dev, &formats, rp_type, sample_count);
                    let mut compile = self.rq_shared.compile.lock().unwrap();
                    compile.queue.push(CompileQueueEntry {
                        pipeline,
                        promise,
                        compatible_render_pass: compatible,
                        rp_type,
                        sample_count,
                    });
                    needs_compile = true;
                }
            }
        }
        if needs_compile {
            self.rq_shared.compile_cond.notify_one();
        }

        self.rq_cur_step = None;
        self.rq_cur_pipeline_flags = PipelineFlags::empty();
    }

    /// This starts a new step containing a render pass.
    ///
    /// Redundant binds to the framebuffer already being rendered to
    /// are folded away, converting their clears into in-pass clear
    /// commands where that is cheaper than a new pass.
    pub fn bind_framebuffer_as_render_target(
        &mut self,
        fb: Option<&Arc<Framebuffer>>,
        color_load: LoadAction,
        depth_load: LoadAction,
        stencil_load: LoadAction,
        clear_color: u32,
        clear_depth: f32,
        clear_stencil: u8,
        tag: &'static str,
    ) {
        debug_assert!(self.rq_inside_frame);
        let mut depth_load = depth_load;
        let mut stencil_load = stencil_load;

        if fb.is_none() {
            // Backbuffer contents are undefined between frames.
            debug_assert!(color_load != LoadAction::Keep);
            debug_assert!(depth_load != LoadAction::Keep);
            debug_assert!(stencil_load != LoadAction::Keep);
        }

        // Eliminate dupes (bind of the framebuffer we already are
        // rendering to), instantly convert to a clear if possible.
        if let Some(last_idx) = self.rq_cur_step {
            let same_target = match (&self.rq_steps[last_idx].kind, fb) {
                (StepKind::Render(r), Some(fb)) => {
                    r.framebuffer.as_ref().map(|f| f.fb_id) == Some(fb.fb_id)
                }
                (StepKind::Render(r), None) => r.framebuffer.is_none(),
                _ => false,
            };

            if same_target && last_idx == self.rq_steps.len() - 1 {
                let mut clear_mask = vk::ImageAspectFlags::empty();
                if color_load == LoadAction::Clear {
                    clear_mask |= vk::ImageAspectFlags::COLOR;
                }
                if depth_load == LoadAction::Clear {
                    clear_mask |= vk::ImageAspectFlags::DEPTH;
                    self.rq_cur_pipeline_flags |= PipelineFlags::USES_DEPTH_STENCIL;
                }
                if stencil_load == LoadAction::Clear {
                    clear_mask |= vk::ImageAspectFlags::STENCIL;
                    self.rq_cur_pipeline_flags |= PipelineFlags::USES_DEPTH_STENCIL;
                }

                // If there's no clear needed, just keep rendering.
                // If we do need one and the step already has
                // commands, add an in-pass clear. Only when the step
                // is still empty do we open a fresh pass, so the
                // optimizer gets a chance to merge it.
                let has_commands = match &self.rq_steps[last_idx].kind {
                    StepKind::Render(r) => !r.commands.is_empty(),
                    _ => false,
                };
                if clear_mask.is_empty() || has_commands {
                    self.rq_cur_step_has_viewport = false;
                    self.rq_cur_step_has_scissor = false;
                    if let StepKind::Render(r) = &self.rq_steps[last_idx].kind {
                        for c in r.commands.iter() {
                            match c {
                                RenderCommand::Viewport { .. } => {
                                    self.rq_cur_step_has_viewport = true
                                }
                                RenderCommand::Scissor { .. } => {
                                    self.rq_cur_step_has_scissor = true
                                }
                                _ => {}
                            }
                        }
                    }
                    if !clear_mask.is_empty() {
                        let (w, h) = (self.rq_cur_width as i32, self.rq_cur_height as i32);
                        if let StepKind::Render(r) = &mut self.rq_steps[last_idx].kind {
                            r.commands.push(RenderCommand::Clear {
                                color: clear_color,
                                depth: clear_depth,
                                stencil: clear_stencil,
                                mask: clear_mask,
                            });
                        }
                        self.rq_cur_render_area.set_rect(0, 0, w, h);
                    }
                    return;
                }
            }
        }

        // More redundant bind elimination: a still-empty current step
        // that doesn't clear anything can be dropped entirely.
        if let Some(idx) = self.rq_cur_step {
            let kill = match &self.rq_steps[idx].kind {
                StepKind::Render(r) => {
                    r.commands.is_empty()
                        && r.color_load != LoadAction::Clear
                        && r.depth_load != LoadAction::Clear
                        && r.stencil_load != LoadAction::Clear
                }
                _ => false,
            };
            if kill && idx == self.rq_steps.len() - 1 {
                log::verbose!("dropping empty render step, happens after uploading pixels");
                self.rq_steps.pop();
                self.rq_cur_step = None;
            }
            self.end_cur_render_step();
        }

        // The backbuffer must always be bound last in a frame.
        debug_assert!(!(fb.is_some()
            && matches!(
                self.rq_steps.last().map(|s| &s.kind),
                Some(StepKind::Render(r)) if r.framebuffer.is_none()
            )));

        // Older Mali drivers have issues when depth and stencil
        // load actions don't match; reconcile them and issue the
        // missing clear in-pass.
        let mut late_clear_mask = vk::ImageAspectFlags::empty();
        if depth_load != stencil_load && self.rq_dev.d_caps.vendor == GpuVendor::Arm {
            if stencil_load == LoadAction::DontCare {
                stencil_load = depth_load;
            } else if depth_load == LoadAction::DontCare {
                depth_load = stencil_load;
            } else if stencil_load == LoadAction::Clear {
                depth_load = stencil_load;
                late_clear_mask |= vk::ImageAspectFlags::STENCIL;
            } else if depth_load == LoadAction::Clear {
                stencil_load = depth_load;
                late_clear_mask |= vk::ImageAspectFlags::DEPTH;
            }
        }

        let mut render = RenderStep {
            framebuffer: fb.cloned(),
            color_load,
            depth_load,
            stencil_load,
            color_store: StoreAction::Store,
            depth_store: StoreAction::Store,
            stencil_store: StoreAction::Store,
            clear_color,
            clear_depth,
            clear_stencil,
            num_draws: 0,
            num_reads: 0,
            final_color_layout: if fb.is_none() {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            } else {
                vk::ImageLayout::UNDEFINED
            },
            final_depth_layout: if fb.is_none() {
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            } else {
                vk::ImageLayout::UNDEFINED
            },
            pipeline_flags: PipelineFlags::empty(),
            render_area: vk::Rect2D::default(),
            render_pass_type: RenderPassType::DEFAULT,
            pre_transitions: Vec::new(),
            commands: Vec::new(),
        };

        if !late_clear_mask.is_empty() {
            render.commands.push(RenderCommand::Clear {
                color: clear_color,
                depth: clear_depth,
                stencil: clear_stencil,
                mask: late_clear_mask,
            });
        }

        let mut step = Step::new_render(tag, render);

        if let Some(fb) = fb {
            // A KEEP naturally reads from the framebuffer.
            if color_load == LoadAction::Keep
                || depth_load == LoadAction::Keep
                || stencil_load == LoadAction::Keep
            {
                step.add_dependency(fb.fb_id);
            }
            self.rq_cur_width = fb.fb_width;
            self.rq_cur_height = fb.fb_height;
        }

        self.rq_steps.push(step);
        self.rq_cur_step = Some(self.rq_steps.len() - 1);
        self.rq_cur_step_has_viewport = false;
        self.rq_cur_step_has_scissor = false;

        if color_load == LoadAction::Clear
            || depth_load == LoadAction::Clear
            || stencil_load == LoadAction::Clear
        {
            self.rq_cur_render_area
                .set_rect(0, 0, self.rq_cur_width as i32, self.rq_cur_height as i32);
        }
    }

    /// Set the dimensions used for backbuffer render steps; the
    /// windowing glue keeps this current.
    pub fn set_backbuffer_size(&mut self, width: u32, height: u32) {
        self.rq_cur_width = width;
        self.rq_cur_height = height;
    }

    /// Mark `fb` as sampled by the current step and return the view
    /// to put in the descriptor. The framebuffer gets a
    /// pre-transition to SHADER_READ; if an earlier step wrote it and
    /// hasn't decided its final layout yet, stamp that step so the
    /// image comes out of the pass already in SHADER_READ.
    pub fn bind_framebuffer_as_texture(
        &mut self,
        fb: &Arc<Framebuffer>,
        aspect: vk::ImageAspectFlags,
        layer: i32,
    ) -> vk::ImageView {
        debug_assert!(self.rq_cur_step.is_some());
        // We don't support texturing from stencil, nor from
        // depth|stencil together.
        debug_assert!(
            aspect == vk::ImageAspectFlags::COLOR || aspect == vk::ImageAspectFlags::DEPTH
        );

        // If an earlier pass wrote this framebuffer and hasn't
        // decided its final layout, have it exit straight into
        // SHADER_READ.
        stamp_final_layout_backwards(
            &mut self.rq_steps,
            fb.fb_id,
            aspect,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            true,
        );

        let idx = self.rq_cur_step.unwrap();
        self.rq_steps[idx].add_dependency(fb.fb_id);
        if let StepKind::Render(r) = &mut self.rq_steps[idx].kind {
            r.add_pre_transition(TransitionRequest {
                fb: fb.clone(),
                aspect,
                target_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            });
        }

        let record = if aspect == vk::ImageAspectFlags::COLOR {
            &fb.fb_color
        } else {
            fb.fb_depth.as_ref().expect("sampling depth without depth")
        };
        if layer < 0 {
            record.native().sample_view
        } else {
            record.native().layer_views[layer as usize]
        }
    }

    pub fn copy_framebuffer(
        &mut self,
        src: &Arc<Framebuffer>,
        src_rect: vk::Rect2D,
        dst: &Arc<Framebuffer>,
        dst_pos: vk::Offset2D,
        aspect: vk::ImageAspectFlags,
        tag: &'static str,
    ) {
        debug_assert!(src_rect.offset.x >= 0 && src_rect.offset.y >= 0);
        debug_assert!(src_rect.offset.x as u32 + src_rect.extent.width <= src.fb_width);
        debug_assert!(src_rect.offset.y as u32 + src_rect.extent.height <= src.fb_height);
        debug_assert!(src_rect.extent.width > 0 && src_rect.extent.height > 0);
        debug_assert!(dst_pos.x as u32 + src_rect.extent.width <= dst.fb_width);
        debug_assert!(dst_pos.y as u32 + src_rect.extent.height <= dst.fb_height);

        // An intra-buffer copy has to go through GENERAL layout.
        let final_src_layout = if src.fb_id == dst.fb_id {
            vk::ImageLayout::GENERAL
        } else {
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        };

        stamp_final_layout_backwards(&mut self.rq_steps, src.fb_id, aspect, final_src_layout, true);
        if src.fb_id != dst.fb_id {
            stamp_final_layout_backwards(
                &mut self.rq_steps,
                dst.fb_id,
                aspect,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                false,
            );
        }

        self.end_cur_render_step();

        let mut step = Step {
            tag,
            dependencies: Vec::new(),
            kind: StepKind::Copy(CopyStep {
                src: src.clone(),
                dst: dst.clone(),
                src_rect,
                dst_pos,
                aspect,
            }),
        };
        step.add_dependency(src.fb_id);
        let fills_dst = dst_pos.x == 0
            && dst_pos.y == 0
            && src_rect.extent.width == dst.fb_width
            && src_rect.extent.height == dst.fb_height;
        if !fills_dst {
            step.add_dependency(dst.fb_id);
        }
        self.rq_steps.push(step);
    }

    pub fn blit_framebuffer(
        &mut self,
        src: &Arc<Framebuffer>,
        src_rect: vk::Rect2D,
        dst: &Arc<Framebuffer>,
        dst_rect: vk::Rect2D,
        aspect: vk::ImageAspectFlags,
        filter: vk::Filter,
        tag: &'static str,
    ) {
        debug_assert!(src_rect.extent.width > 0 && src_rect.extent.height > 0);
        debug_assert!(dst_rect.extent.width > 0 && dst_rect.extent.height > 0);

        // Depth blits require depth images on both ends. Rare enough
        // that we stumble along when a game gets it wrong.
        if aspect.intersects(vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL) {
            debug_assert!(src.has_depth() && dst.has_depth());
            if !src.has_depth() || !dst.has_depth() {
                return;
            }
        }

        bump_num_reads_backwards(&mut self.rq_steps, src.fb_id);

        self.end_cur_render_step();

        let mut step = Step {
            tag,
            dependencies: Vec::new(),
            kind: StepKind::Blit(BlitStep {
                src: src.clone(),
                dst: dst.clone(),
                src_rect,
                dst_rect,
                filter,
                aspect,
            }),
        };
        step.add_dependency(src.fb_id);
        let fills_dst = dst_rect.offset.x == 0
            && dst_rect.offset.y == 0
            && dst_rect.extent.width == dst.fb_width
            && dst_rect.extent.height == dst.fb_height;
        if !fills_dst {
            step.add_dependency(dst.fb_id);
        }
        self.rq_steps.push(step);
    }

    /// Copy a framebuffer region into caller memory.
    ///
    /// Block mode stalls the whole pipeline; OldDataOk returns the
    /// previous frame's result for this (fb, w, h) and schedules a
    /// fresh readback in its place.
    pub fn copy_framebuffer_to_memory(
        &mut self,
        src: Option<&Arc<Framebuffer>>,
        aspect: vk::ImageAspectFlags,
        x: i32,
        y: i32,
        w: u32,
        h: u32,
        dest_format: DataFormat,
        pixels: &mut [u8],
        pixel_stride: u32,
        mode: ReadbackMode,
        tag: &'static str,
    ) -> bool {
        debug_assert!(self.rq_inside_frame);

        if let Some(fb) = src {
            bump_num_reads_backwards(&mut self.rq_steps, fb.fb_id);
        }

        self.end_cur_render_step();

        let mut step = Step {
            tag,
            dependencies: Vec::new(),
            kind: StepKind::Readback(ReadbackStep {
                src: src.cloned(),
                src_rect: vk::Rect2D {
                    offset: vk::Offset2D { x, y },
                    extent: vk::Extent2D {
                        width: w,
                        height: h,
                    },
                },
                aspect,
                delayed: mode == ReadbackMode::OldDataOk,
            }),
        };
        if let Some(fb) = src {
            step.add_dependency(fb.fb_id);
        }
        self.rq_steps.push(step);

        if mode == ReadbackMode::Block {
            self.flush_sync();
        }

        // Work out what landed in the buffer.
        let src_format = if aspect.contains(vk::ImageAspectFlags::COLOR) {
            match src {
                Some(fb) => match fb.fb_color.format {
                    vk::Format::R8G8B8A8_UNORM => DataFormat::R8G8B8A8Unorm,
                    vk::Format::B8G8R8A8_UNORM => DataFormat::B8G8R8A8Unorm,
                    _ => {
                        log::error!("readback: unsupported color format");
                        return false;
                    }
                },
                None => {
                    // Backbuffer.
                    match self.rq_rp_cache.formats().backbuffer {
                        vk::Format::B8G8R8A8_UNORM => DataFormat::B8G8R8A8Unorm,
                        vk::Format::R8G8B8A8_UNORM => DataFormat::R8G8B8A8Unorm,
                        _ => {
                            log::error!("readback: unsupported backbuffer format");
                            return false;
                        }
                    }
                }
            }
        } else if aspect.contains(vk::ImageAspectFlags::STENCIL)
            && !aspect.contains(vk::ImageAspectFlags::DEPTH)
        {
            // Copies from stencil are always S8.
            DataFormat::S8
        } else if aspect.contains(vk::ImageAspectFlags::DEPTH) {
            match src.map(|fb| fb.fb_depth.as_ref().unwrap().format) {
                Some(vk::Format::D24_UNORM_S8_UINT) => DataFormat::D24S8,
                Some(vk::Format::D32_SFLOAT) | Some(vk::Format::D32_SFLOAT_S8_UINT) => {
                    DataFormat::D32F
                }
                Some(vk::Format::D16_UNORM) | Some(vk::Format::D16_UNORM_S8_UINT) => {
                    DataFormat::D16
                }
                _ => {
                    log::error!("readback: unsupported depth format");
                    return false;
                }
            }
        } else {
            debug_assert!(false);
            return false;
        };

        let delayed_key = match mode {
            ReadbackMode::OldDataOk => Some((src.map(|fb| fb.fb_id).unwrap_or(0), w, h)),
            ReadbackMode::Block => None,
        };

        // The pixels are guaranteed to be in CPU-accessible memory
        // after the sync above (or a previous frame's, for delayed
        // mode).
        let mut frame = self.rq_frames[self.rq_cur_frame].data.lock().unwrap();
        copy_readback_buffer(
            &self.rq_dev,
            &mut frame,
            &self.rq_sync_readback,
            delayed_key,
            w,
            h,
            src_format,
            dest_format,
            pixel_stride,
            pixels,
        )
    }

    /// Synchronously read a texture mip back into caller memory.
    pub fn copy_image_to_memory(
        &mut self,
        tex: &Arc<Texture>,
        mip_level: u32,
        x: i32,
        y: i32,
        w: u32,
        h: u32,
        dest_format: DataFormat,
        pixels: &mut [u8],
        pixel_stride: u32,
        tag: &'static str,
    ) -> bool {
        debug_assert!(self.rq_inside_frame);
        self.end_cur_render_step();

        self.rq_steps.push(Step {
            tag,
            dependencies: Vec::new(),
            kind: StepKind::ReadbackImage(ReadbackImageStep {
                texture: tex.clone(),
                mip_level,
                src_rect: vk::Rect2D {
                    offset: vk::Offset2D { x, y },
                    extent: vk::Extent2D {
                        width: w,
                        height: h,
                    },
                },
            }),
        });

        self.flush_sync();
        debug_assert!(self.rq_steps.is_empty());

        let mut frame = self.rq_frames[self.rq_cur_frame].data.lock().unwrap();
        copy_readback_buffer(
            &self.rq_dev,
            &mut frame,
            &self.rq_sync_readback,
            None,
            w,
            h,
            dest_format,
            dest_format,
            pixel_stride,
            pixels,
        )
    }

    /// Clear the current render target.
    ///
    /// A clear issued before any draw, or one clearing every aspect,
    /// folds into the pass's load actions; later partial clears are
    /// recorded as in-pass clear-attachment commands.
    pub fn clear(&mut self, clear_color: u32, clear_depth: f32, clear_stencil: u8, clear_mask: vk::ImageAspectFlags) {
        debug_assert!(self.rq_cur_step.is_some());
        if clear_mask.is_empty() {
            return;
        }

        let (w, h) = (self.rq_cur_width as i32, self.rq_cur_height as i32);
        let mut uses_depth_stencil = false;
        {
            let step = self.cur_render_step();
            let all_aspects = vk::ImageAspectFlags::COLOR
                | vk::ImageAspectFlags::DEPTH
                | vk::ImageAspectFlags::STENCIL;

            if step.num_draws == 0 || clear_mask == all_aspects {
                step.clear_color = clear_color;
                step.clear_depth = clear_depth;
                step.clear_stencil = clear_stencil;
                step.color_load = if clear_mask.contains(vk::ImageAspectFlags::COLOR) {
                    LoadAction::Clear
                } else {
                    LoadAction::Keep
                };
                step.depth_load = if clear_mask.contains(vk::ImageAspectFlags::DEPTH) {
                    LoadAction::Clear
                } else {
                    LoadAction::Keep
                };
                step.stencil_load = if clear_mask.contains(vk::ImageAspectFlags::STENCIL) {
                    LoadAction::Clear
                } else {
                    LoadAction::Keep
                };

                if clear_mask
                    .intersects(vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL)
                {
                    match &step.framebuffer {
                        Some(fb) if !fb.has_depth() => {
                            log::error!(
                                "clearing depth/stencil on a non-depth framebuffer: {}",
                                fb.tag()
                            );
                        }
                        _ => uses_depth_stencil = true,
                    }
                }

                // In case there were commands already.
                step.num_draws = 0;
                remove_draw_commands(&mut step.commands);
            } else {
                step.commands.push(RenderCommand::Clear {
                    color: clear_color,
                    depth: clear_depth,
                    stencil: clear_stencil,
                    mask: clear_mask,
                });
            }
        }
        if uses_depth_stencil {
            self.rq_cur_pipeline_flags |= PipelineFlags::USES_DEPTH_STENCIL;
        }
        self.rq_cur_render_area.set_rect(0, 0, w, h);
    }

    // ------------------------------------------------------------------
    // State and draw recording

    pub fn bind_pipeline(
        &mut self,
        pipeline: &Arc<GraphicsPipeline>,
        layout: &Arc<PipelineLayout>,
        flags: PipelineFlags,
    ) {
        debug_assert!(self.rq_cur_step.is_some());
        self.rq_cur_pipeline_flags |= flags;
        self.rq_pipelines_to_check.push(pipeline.clone());
        let step = self.cur_render_step();
        step.commands.push(RenderCommand::BindPipeline {
            pipeline: pipeline.clone(),
            layout: layout.clone(),
        });
    }

    pub fn set_viewport(&mut self, vp: vk::Viewport) {
        debug_assert!(vp.width >= 0.0 && vp.height >= 0.0);
        // We can't allow depth values outside 0..1 without
        // VK_EXT_depth_range_unrestricted; state mapping sometimes
        // produces values slightly outside.
        let vp = vk::Viewport {
            min_depth: vp.min_depth.max(0.0).min(1.0),
            max_depth: vp.max_depth.max(0.0).min(1.0),
            ..vp
        };
        let step = self.cur_render_step();
        step.commands.push(RenderCommand::Viewport { vp });
        self.rq_cur_step_has_viewport = true;
    }

    pub fn set_scissor(&mut self, mut rc: vk::Rect2D) {
        // Clamp to the current target; out of range scissors are an
        // error on some drivers.
        if rc.offset.x + rc.extent.width as i32 > self.rq_cur_width as i32 {
            rc.extent.width = (self.rq_cur_width as i32 - rc.offset.x).max(0) as u32;
        }
        if rc.offset.y + rc.extent.height as i32 > self.rq_cur_height as i32 {
            rc.extent.height = (self.rq_cur_height as i32 - rc.offset.y).max(0) as u32;
        }
        self.rq_cur_render_area.apply(&rc);
        let step = self.cur_render_step();
        step.commands.push(RenderCommand::Scissor { rc });
        self.rq_cur_step_has_scissor = true;
    }

    pub fn set_stencil_params(&mut self, write_mask: u8, compare_mask: u8, ref_value: u8) {
        let step = self.cur_render_step();
        step.commands.push(RenderCommand::StencilParams {
            write_mask,
            compare_mask,
            ref_value,
        });
    }

    pub fn set_blend_factor(&mut self, color: u32) {
        let step = self.cur_render_step();
        step.commands.push(RenderCommand::BlendFactor { color });
    }

    pub fn push_constants(&mut self, stages: vk::ShaderStageFlags, offset: u32, data: &[u8]) {
        debug_assert!(offset as usize + data.len() <= 64);
        let mut buf = [0u8; 64];
        buf[..data.len()].copy_from_slice(data);
        let step = self.cur_render_step();
        step.commands.push(RenderCommand::PushConstants {
            stages,
            offset: offset as u8,
            size: data.len() as u8,
            data: buf,
        });
    }

    pub fn debug_annotation(&mut self, annotation: &'static str) {
        let step = self.cur_render_step();
        step.commands
            .push(RenderCommand::DebugAnnotation { annotation });
    }

    pub fn draw(
        &mut self,
        desc_set_index: u32,
        ubo_offsets: &[u32],
        vbuffer: vk::Buffer,
        voffset: u64,
        count: u32,
        offset: u32,
    ) {
        debug_assert!(self.rq_cur_step_has_viewport && self.rq_cur_step_has_scissor);
        debug_assert!(ubo_offsets.len() <= 3);
        let mut offsets = [0u32; 3];
        offsets[..ubo_offsets.len()].copy_from_slice(ubo_offsets);
        let step = self.cur_render_step();
        step.commands.push(RenderCommand::Draw {
            desc_set_index,
            ubo_offsets: offsets,
            num_ubo_offsets: ubo_offsets.len() as u8,
            vbuffer,
            voffset,
            count,
            offset,
        });
        step.num_draws += 1;
    }

    pub fn draw_indexed(
        &mut self,
        desc_set_index: u32,
        ubo_offsets: &[u32],
        vbuffer: vk::Buffer,
        voffset: u64,
        ibuffer: vk::Buffer,
        ioffset: u64,
        index_type: vk::IndexType,
        count: u32,
        instances: u32,
    ) {
        debug_assert!(self.rq_cur_step_has_viewport && self.rq_cur_step_has_scissor);
        debug_assert!(ubo_offsets.len() <= 3);
        let mut offsets = [0u32; 3];
        offsets[..ubo_offsets.len()].copy_from_slice(ubo_offsets);
        let step = self.cur_render_step();
        step.commands.push(RenderCommand::DrawIndexed {
            desc_set_index,
            ubo_offsets: offsets,
            num_ubo_offsets: ubo_offsets.len() as u8,
            vbuffer,
            voffset,
            ibuffer,
            ioffset,
            index_type,
            count,
            instances,
        });
        step.num_draws += 1;
    }

    // ------------------------------------------------------------------
    // Resource creation. Handles materialize immediately; data
    // uploads are recorded as init work for the render thread.

    pub fn create_framebuffer(
        &mut self,
        width: u32,
        height: u32,
        layers: u32,
        samples: vk::SampleCountFlags,
        with_depth: bool,
        tag: &str,
    ) -> Arc<Framebuffer> {
        let fb = Framebuffer::new(
            width,
            height,
            layers,
            samples,
            with_depth,
            self.rq_rp_cache.formats().color,
            self.rq_rp_cache.formats().depth,
            tag,
        );
        if let Err(e) = fb.materialize(&self.rq_dev) {
            self.rq_dev
                .report_error("framebuffer", &format!("{}: {:?}", tag, e));
        }
        fb
    }

    pub fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        depth: u32,
        mip_levels: u32,
        format: DataFormat,
        levels: Vec<Vec<u8>>,
        tag: &str,
    ) -> Arc<Texture> {
        let tex = Texture::new(
            self.rq_dev.d_caps.texture_npot_fully_supported,
            width,
            height,
            depth,
            mip_levels,
            format,
            tag,
        );
        match tex.materialize(&self.rq_dev) {
            Ok(()) => {
                if !levels.is_empty() {
                    self.rq_init_steps.push(InitStep::UploadTexture {
                        tex: tex.clone(),
                        levels,
                    });
                }
            }
            Err(e) => {
                // The sticky out-of-memory flag is already set; the
                // frame continues with the texture data missing.
                self.rq_dev
                    .report_error("texture", &format!("{}: {:?}", tag, e));
            }
        }
        tex
    }

    /// Partial update of one texture mip. Takes effect in the frame's
    /// init pass, before any step of this frame runs.
    pub fn texture_subimage(
        &mut self,
        tex: &Arc<Texture>,
        mip: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        data: Vec<u8>,
    ) {
        self.rq_init_steps.push(InitStep::TextureSubImage {
            tex: tex.clone(),
            mip,
            x,
            y,
            width,
            height,
            data,
        });
    }

    pub fn create_buffer(
        &mut self,
        size: usize,
        usage: BufferUsage,
        dynamic: bool,
        data: Option<Vec<u8>>,
    ) -> Arc<Buffer> {
        let buf = Buffer::new(size, usage, dynamic);
        if let Err(e) = buf.materialize(&self.rq_dev) {
            self.rq_dev.report_error("buffer", &format!("{:?}", e));
        } else if let Some(data) = data {
            self.rq_init_steps.push(InitStep::BufferSubdata {
                buf: buf.clone(),
                offset: 0,
                data,
            });
        }
        buf
    }

    /// Regenerate mips 1..n of a texture from mip 0 by blitting down
    /// the chain. Runs in the frame's init pass.
    pub fn generate_mipmaps(&mut self, tex: &Arc<Texture>) {
        debug_assert!(tex.t_mip_levels > 1);
        self.rq_init_steps
            .push(InitStep::GenerateMips { tex: tex.clone() });
    }

    pub fn buffer_subdata(&mut self, buf: &Arc<Buffer>, offset: u64, data: Vec<u8>) {
        self.rq_init_steps.push(InitStep::BufferSubdata {
            buf: buf.clone(),
            offset,
            data,
        });
    }

    pub fn create_shader_module(
        &mut self,
        stage: ShaderStage,
        spirv: Vec<u32>,
        source: String,
        tag: &str,
    ) -> Arc<ShaderModule> {
        let shader = ShaderModule::new(stage, spirv, source, tag);
        shader.materialize(&self.rq_dev);
        shader
    }

    pub fn create_pipeline_layout(
        &mut self,
        binding_types: &[BindingType],
        geo_shaders: bool,
        tag: &str,
    ) -> Arc<PipelineLayout> {
        let layout = PipelineLayout::new(&self.rq_dev, binding_types, geo_shaders, tag);
        self.rq_shared.layouts.lock().unwrap().push(layout.clone());
        layout
    }

    pub fn create_graphics_pipeline(
        &mut self,
        desc: PipelineDesc,
        sample_count: vk::SampleCountFlags,
        tag: &str,
    ) -> Arc<GraphicsPipeline> {
        let pipeline = GraphicsPipeline::new(desc, sample_count, tag);
        self.rq_pipelines.lock().unwrap().push(pipeline.clone());
        pipeline
    }

    pub fn create_sampler_state(&self, desc: SamplerDesc) -> Arc<SamplerState> {
        SamplerState::new(&self.rq_dev, desc)
    }

    /// Record a descriptor set for the next draw on `layout`.
    pub fn push_desc_set(
        &self,
        layout: &Arc<PipelineLayout>,
        descriptors: &[PackedDescriptor],
    ) -> u32 {
        layout.push_desc_set(self.rq_cur_frame, descriptors)
    }

    /// Push transient data for the current frame. Returns the buffer
    /// to bind and the offset of the data.
    pub fn push_vertex_data(&self, data: &[u8]) -> Result<(vk::Buffer, u32)> {
        let mut frame = self.rq_frames[self.rq_cur_frame].data.lock().unwrap();
        frame.push_vertex.push(data)
    }

    pub fn push_index_data(&self, data: &[u8]) -> Result<(vk::Buffer, u32)> {
        let mut frame = self.rq_frames[self.rq_cur_frame].data.lock().unwrap();
        frame.push_index.push(data)
    }

    /// Uniform data lands at the device's required alignment and is
    /// bound through a dynamic offset.
    pub fn push_uniform_data(&self, data: &[u8]) -> Result<(vk::Buffer, u32)> {
        let align = self.rq_dev.min_uniform_offset_align() as usize;
        let mut frame = self.rq_frames[self.rq_cur_frame].data.lock().unwrap();
        frame.push_uniform.push_aligned(data, align.max(4))
    }

    // ------------------------------------------------------------------
    // Deferred deletion

    fn queue_deleter(&self, deleter: crate::frame::Deleter) {
        let mut frame = self.rq_frames[self.rq_cur_frame].data.lock().unwrap();
        frame.deleters.push(deleter);
    }

    pub fn delete_framebuffer(&mut self, fb: Arc<Framebuffer>) {
        self.rq_pending_forget.push(fb.fb_id);
        self.queue_deleter(Box::new(move |dev| fb.destroy(dev)));
    }

    pub fn delete_texture(&self, tex: Arc<Texture>) {
        self.queue_deleter(Box::new(move |dev| tex.destroy(dev)));
    }

    pub fn delete_buffer(&self, buf: Arc<Buffer>) {
        self.queue_deleter(Box::new(move |dev| buf.destroy(dev)));
    }

    pub fn delete_shader_module(&self, shader: Arc<ShaderModule>) {
        self.queue_deleter(Box::new(move |dev| shader.destroy(dev)));
    }

    pub fn delete_sampler_state(&self, sampler: Arc<SamplerState>) {
        self.queue_deleter(Box::new(move |dev| sampler.destroy(dev)));
    }

    pub fn delete_pipeline(&self, pipeline: Arc<GraphicsPipeline>) {
        let mut pipelines = self.rq_pipelines.lock().unwrap();
        pipelines.retain(|p| !Arc::ptr_eq(p, &pipeline));
        drop(pipelines);
        self.queue_deleter(Box::new(move |dev| pipeline.destroy(dev)));
    }

    pub fn delete_pipeline_layout(&self, layout: Arc<PipelineLayout>) {
        let mut layouts = self.rq_shared.layouts.lock().unwrap();
        layouts.retain(|l| !Arc::ptr_eq(l, &layout));
        drop(layouts);
        self.queue_deleter(Box::new(move |dev| layout.destroy(dev)));
    }

    // ------------------------------------------------------------------
    // Pipeline cache serialization

    /// Write the pipeline key list (and optionally the raw driver
    /// blob) to `w`. Since the keys don't include everything, there
    /// can be duplicates; the set written is unique.
    pub fn save_pipeline_cache<W: Write>(&self, w: &mut W, save_raw: bool) -> bool {
        let mut keys: Vec<StoredPipelineKey> = Vec::new();
        {
            let pipelines = self.rq_pipelines.lock().unwrap();
            for p in pipelines.iter() {
                let key = StoredPipelineKey {
                    raster: p.p_desc.raster,
                    vertex_shader_id: p.p_desc.vertex_shader_id,
                    fragment_shader_id: p.p_desc.fragment_shader_id,
                    vtx_fmt_id: if p.p_desc.use_hw_transform {
                        p.p_desc.vtx_fmt_id
                    } else {
                        0
                    },
                    variants: p.variants_bitmask(),
                    use_hw_transform: p.p_desc.use_hw_transform as u8,
                };
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }

        let raw;
        let raw_slice = if save_raw {
            raw = unsafe {
                self.rq_dev
                    .dev
                    .get_pipeline_cache_data(self.rq_pipeline_cache)
                    .unwrap_or_default()
            };
            Some(raw.as_slice())
        } else {
            None
        };

        let ok = crate::pipeline::save_cache(w, &keys, raw_slice);
        if ok {
            log::info!("saved pipeline cache ({} unique pipelines)", keys.len());
        } else {
            log::error!("failed to write pipeline cache, disk full?");
        }
        ok
    }

    /// Load cache contents. Returns the stored keys so the caller can
    /// recreate its pipelines from its shader ids; a valid raw blob
    /// is merged into our pipeline cache.
    pub fn load_pipeline_cache<R: Read>(&self, r: &mut R, expect_raw: bool) -> Vec<StoredPipelineKey> {
        let uuid = self.rq_dev.pipeline_cache_uuid();
        let (keys, blob) = crate::pipeline::load_cache(r, expect_raw, &uuid);

        if let Some(blob) = blob {
            let info = vk::PipelineCacheCreateInfo::builder().initial_data(blob.as_slice());
            unsafe {
                if let Ok(loaded) = self.rq_dev.dev.create_pipeline_cache(&info, None) {
                    let _ = self
                        .rq_dev
                        .dev
                        .merge_pipeline_caches(self.rq_pipeline_cache, &[loaded]);
                    self.rq_dev.dev.destroy_pipeline_cache(loaded, None);
                    log::info!("merged raw pipeline cache blob");
                }
            }
        }

        log::info!("loaded pipeline cache ({} pipelines)", keys.len());
        keys
    }

    // ------------------------------------------------------------------
    // Shutdown

    /// Stop both threads and drain whatever is still queued. With
    /// `skip_driver_calls` the deleters run without touching the
    /// device (used when the device is already gone).
    pub fn stop_threads(&mut self, skip_driver_calls: bool) {
        if skip_driver_calls {
            self.rq_dev.set_skip_destroys();
        }

        if let Some(thread) = self.rq_render_thread.take() {
            self.push_task(RenderThreadTask {
                run_type: RunType::Exit,
                frame: 0,
                steps: Vec::new(),
                init_steps: Vec::new(),
                forget_fbs: Vec::new(),
            });
            thread.join().unwrap();
        }

        if let Some(thread) = self.rq_compile_thread.take() {
            {
                let mut compile = self.rq_shared.compile.lock().unwrap();
                compile.run = false;
                self.rq_shared.compile_cond.notify_one();
            }
            thread.join().unwrap();
        }

        // Whatever deleters are still queued will never see a fence;
        // run them now.
        for slot in self.rq_frames.iter() {
            let mut frame = slot.data.lock().unwrap();
            frame.drain_deleters(&self.rq_dev);
        }
    }
}

impl Drop for RenderQueue {
    fn drop(&mut self) {
        if self.rq_render_thread.is_some() || self.rq_compile_thread.is_some() {
            self.stop_threads(false);
        }

        unsafe {
            self.rq_dev.dev.device_wait_idle().unwrap();
        }
        for slot in self.rq_frames.iter() {
            slot.data.lock().unwrap().destroy(&self.rq_dev);
        }
        self.rq_frame_shared.destroy(&self.rq_dev);
        if !self.rq_dev.skip_destroys() {
            unsafe {
                self.rq_dev
                    .dev
                    .destroy_pipeline_cache(self.rq_pipeline_cache, None);
            }
        }
        self.rq_sync_readback
            .lock()
            .unwrap()
            .destroy(&self.rq_dev);
    }
}

// ----------------------------------------------------------------------
// Threads

/// Execute the frame's queued resource work into the init cbuf.
fn run_init_steps(
    dev: &Device,
    init_steps: Vec<InitStep>,
    frame: &mut FrameData,
) {
    if init_steps.is_empty() {
        return;
    }
    let init_cmd = frame.get_init_cmd(dev);
    let staging = &mut frame.push_staging;
    let _ = staging.begin();

    for step in init_steps {
        match step {
            InitStep::BufferSubdata { buf, offset, data } => {
                let _ = buf.update(dev, offset, &data);
            }
            InitStep::UploadTexture { tex, levels } => {
                let native = match tex.try_native() {
                    Some(n) => n,
                    None => continue,
                };

                // All mips transition to TRANSFER_DST in one barrier,
                // get their data copied from staging, then move to
                // SHADER_READ for the rest of their lives.
                unsafe {
                    let barrier = vk::ImageMemoryBarrier::builder()
                        .image(native.image)
                        .old_layout(vk::ImageLayout::UNDEFINED)
                        .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                        .src_access_mask(vk::AccessFlags::empty())
                        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                        .subresource_range(
                            vk::ImageSubresourceRange::builder()
                                .aspect_mask(vk::ImageAspectFlags::COLOR)
                                .level_count(tex.t_mip_levels)
                                .layer_count(1)
                                .build(),
                        )
                        .build();
                    dev.dev.cmd_pipeline_barrier(
                        init_cmd,
                        vk::PipelineStageFlags::TOP_OF_PIPE,
                        vk::PipelineStageFlags::TRANSFER,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[barrier],
                    );
                }

                for (mip, data) in levels.iter().enumerate() {
                    if data.is_empty() {
                        continue;
                    }
                    let (buffer, offset) = match staging.push(data) {
                        Ok(r) => r,
                        Err(_) => {
                            dev.report_error("texture", &format!("{}: upload failed", tex.t_tag));
                            break;
                        }
                    };
                    let mip_w = (tex.t_width >> mip).max(1);
                    let mip_h = (tex.t_height >> mip).max(1);
                    let region = vk::BufferImageCopy {
                        buffer_offset: offset as u64,
                        buffer_row_length: 0, // tightly packed
                        buffer_image_height: 0,
                        image_subresource: vk::ImageSubresourceLayers {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            mip_level: mip as u32,
                            base_array_layer: 0,
                            layer_count: 1,
                        },
                        image_offset: vk::Offset3D::default(),
                        image_extent: vk::Extent3D {
                            width: mip_w,
                            height: mip_h,
                            depth: tex.t_depth,
                        },
                    };
                    unsafe {
                        dev.dev.cmd_copy_buffer_to_image(
                            init_cmd,
                            buffer,
                            native.image,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            &[region],
                        );
                    }
                }

                unsafe {
                    let barrier = vk::ImageMemoryBarrier::builder()
                        .image(native.image)
                        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                        .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                        .dst_access_mask(vk::AccessFlags::SHADER_READ)
                        .subresource_range(
                            vk::ImageSubresourceRange::builder()
                                .aspect_mask(vk::ImageAspectFlags::COLOR)
                                .level_count(tex.t_mip_levels)
                                .layer_count(1)
                                .build(),
                        )
                        .build();
                    dev.dev.cmd_pipeline_barrier(
                        init_cmd,
                        vk::PipelineStageFlags::TRANSFER,
                        vk::PipelineStageFlags::FRAGMENT_SHADER,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[barrier],
                    );
                }
            }
            InitStep::TextureSubImage {
                tex,
                mip,
                x,
                y,
                width,
                height,
                data,
            } => {
                let native = match tex.try_native() {
                    Some(n) => n,
                    None => {
                        log::error!("subimage on unmaterialized texture {}", tex.t_tag);
                        continue;
                    }
                };
                let (buffer, offset) = match staging.push(&data) {
                    Ok(r) => r,
                    Err(_) => continue,
                };

                unsafe {
                    let to_dst = vk::ImageMemoryBarrier::builder()
                        .image(native.image)
                        .old_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                        .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                        .src_access_mask(vk::AccessFlags::SHADER_READ)
                        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                        .subresource_range(
                            vk::ImageSubresourceRange::builder()
                                .aspect_mask(vk::ImageAspectFlags::COLOR)
                                .base_mip_level(mip)
                                .level_count(1)
                                .layer_count(1)
                                .build(),
                        )
                        .build();
                    dev.dev.cmd_pipeline_barrier(
                        init_cmd,
                        vk::PipelineStageFlags::FRAGMENT_SHADER,
                        vk::PipelineStageFlags::TRANSFER,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[to_dst],
                    );

                    let region = vk::BufferImageCopy {
                        buffer_offset: offset as u64,
                        buffer_row_length: 0,
                        buffer_image_height: 0,
                        image_subresource: vk::ImageSubresourceLayers {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            mip_level: mip,
                            base_array_layer: 0,
                            layer_count: 1,
                        },
                        image_offset: vk::Offset3D {
                            x: x as i32,
                            y: y as i32,
                            z: 0,
                        },
                        image_extent: vk::Extent3D {
                            width,
                            height,
                            depth: 1,
                        },
                    };
                    dev.dev.cmd_copy_buffer_to_image(
                        init_cmd,
                        buffer,
                        native.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );

                    let to_read = vk::ImageMemoryBarrier::builder()
                        .image(native.image)
                        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                        .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                        .dst_access_mask(vk::AccessFlags::SHADER_READ)
                        .subresource_range(
                            vk::ImageSubresourceRange::builder()
                                .aspect_mask(vk::ImageAspectFlags::COLOR)
                                .base_mip_level(mip)
                                .level_count(1)
                                .layer_count(1)
                                .build(),
                        )
                        .build();
                    dev.dev.cmd_pipeline_barrier(
                        init_cmd,
                        vk::PipelineStageFlags::TRANSFER,
                        vk::PipelineStageFlags::FRAGMENT_SHADER,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[to_read],
                    );
                }
            }
            InitStep::GenerateMips { tex } => {
                let native = match tex.try_native() {
                    Some(n) => n,
                    None => continue,
                };
                generate_mips(dev, init_cmd, native.image, tex.t_width, tex.t_height, tex.t_mip_levels);
            }
        }
    }

    staging.end();
}

/// Blit mip 0 down the chain, halving each level. The image arrives
/// and leaves in SHADER_READ across all mips.
fn generate_mips(
    dev: &Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    width: u32,
    height: u32,
    mip_levels: u32,
) {
    let mip_barrier = |mip: u32,
                       old: vk::ImageLayout,
                       new: vk::ImageLayout,
                       src_access: vk::AccessFlags,
                       dst_access: vk::AccessFlags| {
        vk::ImageMemoryBarrier::builder()
            .image(image)
            .old_layout(old)
            .new_layout(new)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(mip)
                    .level_count(1)
                    .layer_count(1)
                    .build(),
            )
            .build()
    };

    unsafe {
        // Mip 0 becomes the first blit source.
        dev.dev.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[mip_barrier(
                0,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::AccessFlags::SHADER_READ,
                vk::AccessFlags::TRANSFER_READ,
            )],
        );

        for mip in 1..mip_levels {
            let src_w = (width >> (mip - 1)).max(1) as i32;
            let src_h = (height >> (mip - 1)).max(1) as i32;
            let dst_w = (width >> mip).max(1) as i32;
            let dst_h = (height >> mip).max(1) as i32;

            dev.dev.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[mip_barrier(
                    mip,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::AccessFlags::SHADER_READ,
                    vk::AccessFlags::TRANSFER_WRITE,
                )],
            );

            let mut blit = vk::ImageBlit::default();
            blit.src_offsets[1] = vk::Offset3D {
                x: src_w,
                y: src_h,
                z: 1,
            };
            blit.dst_offsets[1] = vk::Offset3D {
                x: dst_w,
                y: dst_h,
                z: 1,
            };
            blit.src_subresource = vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: mip - 1,
                base_array_layer: 0,
                layer_count: 1,
            };
            blit.dst_subresource = vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: mip,
                base_array_layer: 0,
                layer_count: 1,
            };
            dev.dev.cmd_blit_image(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            );

            // This level feeds the next one.
            dev.dev.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[mip_barrier(
                    mip,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::TRANSFER_READ,
                )],
            );
        }

        // Everything back to sampling.
        let barriers: Vec<vk::ImageMemoryBarrier> = (0..mip_levels)
            .map(|mip| {
                mip_barrier(
                    mip,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    vk::AccessFlags::TRANSFER_READ,
                    vk::AccessFlags::SHADER_READ,
                )
            })
            .collect();
        dev.dev.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            barriers.as_slice(),
        );
    }
}

fn render_thread_func(
    dev: Arc<Device>,
    shared: Arc<QueueShared>,
    frames: Arc<Vec<FrameSlot>>,
    rp_cache: Arc<RenderPassCache>,
    sync_readback: Arc<Mutex<CachedReadback>>,
    frame_shared: Arc<FrameDataShared>,
    mut display: Display,
    hacks: QueueHacks,
) {
    let mut runner = QueueRunner::new(dev.clone(), rp_cache.clone(), sync_readback);

    // The swapchain needs the backbuffer render pass to build its
    // framebuffers, which in turn comes from the pass cache.
    let backbuffer_rp = rp_cache.backbuffer_render_pass(&dev);
    if display.d_swapchain == vk::SwapchainKHR::null() {
        if display.create_swapchain().is_err() || display.create_backbuffers(backbuffer_rp).is_err()
        {
            log::error!("could not create initial swapchain");
        }
    }

    loop {
        // Pop a task off the queue and execute it.
        let task = {
            let mut tasks = shared.tasks.lock().unwrap();
            loop {
                if let Some(task) = tasks.pop_front() {
                    break task;
                }
                tasks = shared.push_cond.wait(tasks).unwrap();
            }
        };

        match task.run_type {
            RunType::Exit => break,
            RunType::RecreateSwapchain => {
                if let Err(e) = display.recreate_swapchain(backbuffer_rp) {
                    log::error!("swapchain recreate failed: {:?}", e);
                }
                continue;
            }
            _ => {}
        }

        run_task(
            &dev, &shared, &frames, &frame_shared, &mut runner, &mut display, hacks, task,
        );
    }

    // Wait for the device to be done with everything before tearing
    // stuff down.
    unsafe {
        let _ = dev.dev.device_wait_idle();
    }
    runner.destroy();
    log::info!("render thread: quitting");
}

/// Execute one Submit/Sync/Present task. Runs on the render thread.
fn run_task(
    dev: &Arc<Device>,
    shared: &Arc<QueueShared>,
    frames: &Arc<Vec<FrameSlot>>,
    frame_shared: &Arc<FrameDataShared>,
    runner: &mut QueueRunner,
    display: &mut Display,
    hacks: QueueHacks,
    mut task: RenderThreadTask,
) {
    let slot = &frames[task.frame];
    let mut frame = slot.data.lock().unwrap();

    if task.run_type == RunType::Present {
        if !frame.skip_swap {
            let res = display.present(
                frame_shared.rendering_complete_semaphore,
                frame.cur_swapchain_image,
            );
            match res {
                Ok(()) => {
                    shared.out_of_date_frames.store(0, Ordering::Relaxed);
                    let mut times = shared.frame_times.lock().unwrap();
                    if times.len() >= FRAME_TIME_HISTORY_LENGTH {
                        times.pop_front();
                    }
                    times.push_back(FrameTimeEntry {
                        frame_id: frame.frame_id,
                        queue_present_ms: utils::timing::get_current_millis(),
                    });
                }
                Err(GaleError::OUT_OF_DATE) => {
                    shared.out_of_date_frames.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    panic!("vkQueuePresentKHR failed! result={:?}", e);
                }
            }
        } else {
            // We only get here if acquire returned OUT_OF_DATE.
            shared.out_of_date_frames.fetch_add(1, Ordering::Relaxed);
            frame.skip_swap = false;
        }
        frame.has_acquired = false;

        // This slot's fence may now be waited on from the recording
        // thread.
        let mut ready = slot.sync.ready_for_fence.lock().unwrap();
        *ready = true;
        slot.sync.fence_cond.notify_one();
        return;
    }

    debug_assert!(!frame.has_present_commands);

    // Resource init work must land before any step consumes it.
    let init_steps = std::mem::take(&mut task.init_steps);
    run_init_steps(dev, init_steps, &mut frame);

    let _ = frame.submit(dev, frame_shared, FrameSubmitType::Pending);

    // Write out this frame's descriptor sets.
    {
        let layouts = shared.layouts.lock().unwrap();
        let mut written = 0;
        let mut deduped = 0;
        for layout in layouts.iter() {
            let stats = layout.flush_desc_sets(dev, task.frame);
            written += stats.written;
            deduped += stats.deduped;
        }
        frame.profile.descriptors_written += written;
        frame.profile.descriptors_deduped += deduped;
    }

    frame.begin_main_cmd(dev);

    preprocess_steps(&mut task.steps, hacks);
    if task.steps.is_empty() && !frame.has_acquired {
        // Likely during shutdown, happens in headless use.
        frame.skip_swap = true;
    }
    if let Err(e) = runner.run_steps(task.steps, task.frame, &mut frame, frame_shared, display) {
        log::error!("run_steps failed: {:?}", e);
    }

    // Any framebuffer deleted this frame is done being referenced by
    // steps; the runner can drop its layout knowledge.
    for fb_id in task.forget_fbs.iter() {
        runner.forget_framebuffer(*fb_id);
    }

    match task.run_type {
        RunType::Submit => {
            let _ = frame.submit(dev, frame_shared, FrameSubmitType::FinishFrame);
        }
        RunType::Sync => {
            // The submit triggers the readback fence and waits on it.
            let _ = frame.submit(dev, frame_shared, FrameSubmitType::Sync);

            let mut done = slot.sync.sync_done.lock().unwrap();
            *done = true;
            slot.sync.sync_cond.notify_one();

            // The GPU is idle now; recording can continue into the
            // same frame, so no fence signaling here.
        }
        _ => unreachable!(),
    }
}

fn compile_thread_func(dev: Arc<Device>, shared: Arc<QueueShared>, pipeline_cache: vk::PipelineCache) {
    loop {
        let (to_compile, exit_after) = {
            let mut state = shared.compile.lock().unwrap();
            while state.queue.is_empty() && state.run {
                state = shared.compile_cond.wait(state).unwrap();
            }
            (std::mem::take(&mut state.queue), !state.run)
        };

        if !to_compile.is_empty() {
            crate::pipeline::compile_entries(&dev, pipeline_cache, to_compile);
        }

        if exit_after {
            break;
        }

        // Hold off a moment so bunches of pipelines can collect.
        thread::sleep(std::time::Duration::from_millis(1));
    }

    debug_assert!(shared.compile.lock().unwrap().queue.is_empty());
    log::info!("compile thread: quitting");
}
