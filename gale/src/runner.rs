// The queue runner
//
// Walks an optimized step list on the render thread and turns it into
// native commands: resolving image layouts, batching barriers,
// beginning render passes, binding pipeline variants and issuing
// draws. All layout knowledge lives here, keyed by resource id; the
// handles themselves stay immutable.

use ash::vk;

use crate::barrier::BarrierBatch;
use crate::descriptor::PipelineLayout;
use crate::device::Device;
use crate::display::Display;
use crate::format::{self, DataFormat};
use crate::frame::{CachedReadback, FrameData, FrameDataShared, FrameSubmitType, ReadbackKey};
use crate::pipeline::RenderPassType;
use crate::resource::{Framebuffer, ImageRecord, ResourceId};
use crate::step::{
    LoadAction, RenderCommand, RenderStep, Step, StepKind, StoreAction,
};
use crate::{GaleError, Result};
use utils::log;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Render pass selection key: the load/store actions of a step.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RpKey {
    pub color_load: LoadAction,
    pub depth_load: LoadAction,
    pub stencil_load: LoadAction,
    pub color_store: StoreAction,
    pub depth_store: StoreAction,
    pub stencil_store: StoreAction,
}

pub const BACKBUFFER_RP_KEY: RpKey = RpKey {
    color_load: LoadAction::Clear,
    depth_load: LoadAction::Clear,
    stencil_load: LoadAction::Clear,
    color_store: StoreAction::Store,
    depth_store: StoreAction::DontCare,
    stencil_store: StoreAction::DontCare,
};

/// The formats render passes are built against.
#[derive(Debug, Copy, Clone)]
pub struct RenderPassFormats {
    pub color: vk::Format,
    pub depth: vk::Format,
    pub backbuffer: vk::Format,
    pub backbuffer_depth: vk::Format,
}

fn vk_load_op(action: LoadAction) -> vk::AttachmentLoadOp {
    match action {
        LoadAction::Keep => vk::AttachmentLoadOp::LOAD,
        LoadAction::Clear => vk::AttachmentLoadOp::CLEAR,
        LoadAction::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

fn vk_store_op(action: StoreAction) -> vk::AttachmentStoreOp {
    match action {
        StoreAction::Store => vk::AttachmentStoreOp::STORE,
        StoreAction::DontCare => vk::AttachmentStoreOp::DONT_CARE,
    }
}

/// One load/store key's worth of render passes, natively created per
/// (render-pass-type, sample-count) on first use.
pub struct RenderPassObj {
    rp_key: RpKey,
    rp_variants: Mutex<HashMap<(RenderPassType, u32), vk::RenderPass>>,
}

impl RenderPassObj {
    fn new(key: RpKey) -> Self {
        Self {
            rp_key: key,
            rp_variants: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(
        &self,
        dev: &Device,
        formats: &RenderPassFormats,
        rp_type: RenderPassType,
        sample_count: vk::SampleCountFlags,
    ) -> vk::RenderPass {
        let mut variants = self.rp_variants.lock().unwrap();
        let key = (rp_type, sample_count.as_raw());
        if let Some(rp) = variants.get(&key) {
            return *rp;
        }

        let rp = create_render_pass(dev, formats, &self.rp_key, rp_type, sample_count);
        variants.insert(key, rp);
        rp
    }

    fn destroy(&self, dev: &Device) {
        for (_, rp) in self.rp_variants.lock().unwrap().drain() {
            unsafe { dev.dev.destroy_render_pass(rp, None) };
        }
    }
}

fn create_render_pass(
    dev: &Device,
    formats: &RenderPassFormats,
    key: &RpKey,
    rp_type: RenderPassType,
    sample_count: vk::SampleCountFlags,
) -> vk::RenderPass {
    let backbuffer = rp_type.is_backbuffer();
    let has_depth = rp_type.has_depth() || backbuffer;
    let multisample = rp_type.contains(RenderPassType::MULTISAMPLE);

    let mut attachments = Vec::new();
    let mut color_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let mut depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let mut resolve_ref = None;

    if backbuffer {
        // Backbuffer images arrive UNDEFINED and leave ready to
        // present.
        attachments.push(vk::AttachmentDescription {
            format: formats.backbuffer,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk_load_op(key.color_load),
            store_op: vk::AttachmentStoreOp::STORE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            ..Default::default()
        });
        attachments.push(vk::AttachmentDescription {
            format: formats.backbuffer_depth,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            stencil_load_op: vk::AttachmentLoadOp::CLEAR,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ..Default::default()
        });
    } else {
        let samples = if multisample {
            sample_count
        } else {
            vk::SampleCountFlags::TYPE_1
        };

        // Offscreen attachments are pre-transitioned to the optimal
        // layout before the pass; any final transition happens after
        // it ends.
        attachments.push(vk::AttachmentDescription {
            format: formats.color,
            samples,
            load_op: vk_load_op(key.color_load),
            store_op: vk_store_op(key.color_store),
            initial_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ..Default::default()
        });
        if has_depth {
            attachments.push(vk::AttachmentDescription {
                format: formats.depth,
                samples,
                load_op: vk_load_op(key.depth_load),
                store_op: vk_store_op(key.depth_store),
                stencil_load_op: vk_load_op(key.stencil_load),
                stencil_store_op: vk_store_op(key.stencil_store),
                initial_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                ..Default::default()
            });
        }

        if multisample {
            // The single-sampled base image is the resolve target.
            let resolve_index = attachments.len() as u32;
            attachments.push(vk::AttachmentDescription {
                format: formats.color,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: vk::AttachmentLoadOp::DONT_CARE,
                store_op: vk::AttachmentStoreOp::STORE,
                initial_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                ..Default::default()
            });
            resolve_ref = Some(vk::AttachmentReference {
                attachment: resolve_index,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            });
        }
    }

    color_ref.attachment = 0;
    depth_ref.attachment = 1;

    let color_refs = [color_ref];
    let mut subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if has_depth {
        subpass = subpass.depth_stencil_attachment(&depth_ref);
    }
    let resolve_refs;
    if let Some(r) = resolve_ref {
        resolve_refs = [r];
        subpass = subpass.resolve_attachments(&resolve_refs);
    }
    let subpasses = [subpass.build()];

    let dependencies = [vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_READ
            | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ..Default::default()
    }];

    let mut create_info = vk::RenderPassCreateInfo::builder()
        .attachments(attachments.as_slice())
        .subpasses(&subpasses)
        .dependencies(&dependencies)
        .build();

    // Layered rendering replicates draws into both views.
    let view_masks = [0b11u32];
    let correlation_masks = [0b11u32];
    let mut multiview_info = vk::RenderPassMultiviewCreateInfo::builder()
        .view_masks(&view_masks)
        .correlation_masks(&correlation_masks)
        .build();
    if rp_type.contains(RenderPassType::MULTIVIEW) {
        create_info.p_next = &mut multiview_info as *mut _ as *const std::ffi::c_void;
    }

    unsafe { dev.dev.create_render_pass(&create_info, None).unwrap() }
}

/// Shared cache of render pass objects, keyed by load/store actions.
/// The recording thread also reads this when it pre-registers
/// pipeline compiles.
pub struct RenderPassCache {
    rc_formats: RenderPassFormats,
    rc_passes: Mutex<HashMap<RpKey, Arc<RenderPassObj>>>,
}

impl RenderPassCache {
    pub fn new(formats: RenderPassFormats) -> Arc<Self> {
        Arc::new(Self {
            rc_formats: formats,
            rc_passes: Mutex::new(HashMap::new()),
        })
    }

    pub fn formats(&self) -> &RenderPassFormats {
        &self.rc_formats
    }

    pub fn get(&self, key: RpKey) -> Arc<RenderPassObj> {
        let mut passes = self.rc_passes.lock().unwrap();
        passes
            .entry(key)
            .or_insert_with(|| Arc::new(RenderPassObj::new(key)))
            .clone()
    }

    /// The render pass every backbuffer framebuffer is created from.
    pub fn backbuffer_render_pass(&self, dev: &Device) -> vk::RenderPass {
        self.get(BACKBUFFER_RP_KEY).get(
            dev,
            &self.rc_formats,
            RenderPassType::BACKBUFFER | RenderPassType::HAS_DEPTH,
            vk::SampleCountFlags::TYPE_1,
        )
    }

    pub fn destroy(&self, dev: &Device) {
        for (_, rp) in self.rc_passes.lock().unwrap().drain() {
            rp.destroy(dev);
        }
    }
}

/// Which image of a framebuffer a layout entry refers to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
enum ImageSlot {
    Color,
    Depth,
    MsaaColor,
    MsaaDepth,
}

fn unpack_color(color: u32) -> [f32; 4] {
    [
        (color & 0xFF) as f32 / 255.0,
        ((color >> 8) & 0xFF) as f32 / 255.0,
        ((color >> 16) & 0xFF) as f32 / 255.0,
        ((color >> 24) & 0xFF) as f32 / 255.0,
    ]
}

pub struct QueueRunner {
    r_dev: Arc<Device>,
    r_rp_cache: Arc<RenderPassCache>,
    r_barrier: BarrierBatch,
    /// Logical current layout of every framebuffer image we've seen.
    /// Only the runner reads or writes this.
    r_layouts: HashMap<(ResourceId, ImageSlot), vk::ImageLayout>,
    /// The shared buffer blocking readbacks land in. Shared with the
    /// recording thread, which maps it after a sync.
    r_sync_readback: Arc<Mutex<CachedReadback>>,
    /// Pipeline cache for late, synchronous compiles (a merge changed
    /// a step's render-pass-type after recording).
    r_pipeline_cache: vk::PipelineCache,
}

impl QueueRunner {
    pub fn new(
        dev: Arc<Device>,
        rp_cache: Arc<RenderPassCache>,
        sync_readback: Arc<Mutex<CachedReadback>>,
    ) -> Self {
        let info = vk::PipelineCacheCreateInfo::builder();
        let pipeline_cache = unsafe { dev.dev.create_pipeline_cache(&info, None).unwrap() };
        Self {
            r_dev: dev,
            r_rp_cache: rp_cache,
            r_barrier: BarrierBatch::new(),
            r_layouts: HashMap::new(),
            r_sync_readback: sync_readback,
            r_pipeline_cache: pipeline_cache,
        }
    }

    fn layout(&self, fb: ResourceId, slot: ImageSlot) -> vk::ImageLayout {
        *self
            .r_layouts
            .get(&(fb, slot))
            .unwrap_or(&vk::ImageLayout::UNDEFINED)
    }

    fn set_layout(&mut self, fb: ResourceId, slot: ImageSlot, layout: vk::ImageLayout) {
        self.r_layouts.insert((fb, slot), layout);
    }

    /// A framebuffer is going away; drop what we know about it.
    pub fn forget_framebuffer(&mut self, fb: ResourceId) {
        self.r_layouts.retain(|(id, _), _| *id != fb);
    }

    /// Walk the (already preprocessed) steps for one frame.
    pub fn run_steps(
        &mut self,
        steps: Vec<Step>,
        cur_frame: usize,
        frame: &mut FrameData,
        shared: &FrameDataShared,
        display: &mut Display,
    ) -> Result<()> {
        let emit_labels = self.r_dev.inst.debug_utils_enabled;
        let mut cmd = if frame.has_present_commands {
            frame.present_cmd
        } else {
            frame.main_cmd
        };

        for step in steps.iter() {
            if emit_labels {
                self.r_dev.inst.cmd_begin_label(cmd, step.tag);
            }

            match &step.kind {
                StepKind::Render(render) => {
                    if render.framebuffer.is_none() {
                        // Everything recorded so far can start
                        // executing while we wait on the swapchain.
                        frame.submit(&self.r_dev, shared, FrameSubmitType::Pending)?;

                        if !frame.has_acquired {
                            match display.acquire_next_image(shared.acquire_semaphore) {
                                Ok(index) => {
                                    frame.has_acquired = true;
                                    frame.cur_swapchain_image = index;
                                }
                                Err(GaleError::OUT_OF_DATE) => {
                                    frame.skip_swap = true;
                                    if emit_labels {
                                        self.r_dev.inst.cmd_end_label(cmd);
                                    }
                                    continue;
                                }
                                Err(e) => return Err(e),
                            }
                        }

                        // A backbuffer render is normally the last
                        // thing in a frame; it goes on the present
                        // cbuf so split submission can delay it.
                        frame.begin_present_cmd(&self.r_dev);
                        cmd = frame.present_cmd;
                    }

                    self.perform_render_pass(render, cmd, cur_frame, frame, display)?;
                }
                StepKind::Copy(_) => self.perform_copy(step, cmd),
                StepKind::Blit(_) => self.perform_blit(step, cmd),
                StepKind::Readback(_) => self.perform_readback(step, cmd, frame, display),
                StepKind::ReadbackImage(_) => self.perform_readback_image(step, cmd),
                StepKind::RenderSkip => {}
            }

            if frame.profile.timestamps_enabled {
                frame
                    .profile
                    .write_timestamp(&self.r_dev, cmd, step_to_string(step));
            }

            if emit_labels {
                self.r_dev.inst.cmd_end_label(cmd);
            }
        }

        Ok(())
    }

    /// Queue a transition of one framebuffer image, deriving masks
    /// from its tracked layout.
    fn transition_slot(
        &mut self,
        fb: &Framebuffer,
        record: &ImageRecord,
        slot: ImageSlot,
        target: vk::ImageLayout,
    ) {
        let cur = self.layout(fb.fb_id, slot);
        if cur == target {
            return;
        }
        debug_assert!(crate::barrier::layout_transition_allowed(cur, target));

        // Combined depth/stencil formats must transition both aspects.
        let aspect = record.aspect;
        self.r_barrier.transition_image_auto(
            record.native().image,
            0,
            1,
            record.layers,
            aspect,
            cur,
            target,
        );
        self.set_layout(fb.fb_id, slot, target);
    }

    fn perform_render_pass(
        &mut self,
        render: &RenderStep,
        cmd: vk::CommandBuffer,
        cur_frame: usize,
        frame: &mut FrameData,
        display: &Display,
    ) -> Result<()> {
        let dev = self.r_dev.clone();

        // Pre-transitions (bind-as-texture requests recorded with the
        // step).
        for rq in render.pre_transitions.iter() {
            if rq.aspect == vk::ImageAspectFlags::COLOR {
                self.transition_slot(&rq.fb, &rq.fb.fb_color, ImageSlot::Color, rq.target_layout);
            } else if let Some(depth) = &rq.fb.fb_depth {
                self.transition_slot(&rq.fb, depth, ImageSlot::Depth, rq.target_layout);
            }
        }

        // Don't execute empty renderpasses that keep the contents.
        if render.commands.is_empty()
            && render.color_load == LoadAction::Keep
            && render.depth_load == LoadAction::Keep
            && render.stencil_load == LoadAction::Keep
        {
            self.r_barrier.flush(&dev.dev, cmd);
            return Ok(());
        }

        // Write-after-write hazards between passes targeting the same
        // attachment back to back.
        if let Some(fb) = &render.framebuffer {
            if self.layout(fb.fb_id, ImageSlot::Color) == vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            {
                let native = fb.fb_color.native();
                self.r_barrier.transition_image(
                    native.image,
                    0,
                    1,
                    fb.fb_layers,
                    vk::ImageAspectFlags::COLOR,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                    vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::COLOR_ATTACHMENT_READ,
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                );
            }
            if let Some(depth) = &fb.fb_depth {
                if self.layout(fb.fb_id, ImageSlot::Depth)
                    == vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
                {
                    let native = depth.native();
                    self.r_barrier.transition_image(
                        native.image,
                        0,
                        1,
                        fb.fb_layers,
                        depth.aspect,
                        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                        vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                        vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
                            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
                        vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                        vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                    );
                }
            }
        }

        let rp_type = render.render_pass_type;
        let formats = *self.r_rp_cache.formats();

        let render_pass;
        let framebuf;
        let fb_width;
        let fb_height;
        let sample_count;
        let mut clear_values: Vec<vk::ClearValue> = Vec::new();

        match &render.framebuffer {
            Some(fb) => {
                debug_assert!(render.final_color_layout != vk::ImageLayout::UNDEFINED);
                debug_assert!(render.final_depth_layout != vk::ImageLayout::UNDEFINED);

                let key = RpKey {
                    color_load: render.color_load,
                    depth_load: render.depth_load,
                    stencil_load: render.stencil_load,
                    color_store: render.color_store,
                    depth_store: render.depth_store,
                    stencil_store: render.stencil_store,
                };
                let rp_obj = self.r_rp_cache.get(key);
                sample_count = fb.fb_samples;
                render_pass = rp_obj.get(&dev, &formats, rp_type, sample_count);
                framebuf = fb.framebuf_for(&dev, render_pass, rp_type)?;
                fb_width = fb.fb_width;
                fb_height = fb.fb_height;

                // Mali driver on S8 (Android O) and S9 mishandles
                // renderpasses that do just a clear and then no draw
                // calls; transition to GENERAL and back to dodge it.
                let mali_bug_workaround = render.num_draws == 0
                    && render.color_load == LoadAction::Clear
                    && dev.d_caps.driver_version == 0xaa9c_4b29;
                if mali_bug_workaround {
                    let cur = self.layout(fb.fb_id, ImageSlot::Color);
                    if cur != vk::ImageLayout::UNDEFINED {
                        self.r_barrier.transition_image_auto(
                            fb.fb_color.native().image,
                            0,
                            1,
                            fb.fb_layers,
                            vk::ImageAspectFlags::COLOR,
                            cur,
                            vk::ImageLayout::GENERAL,
                        );
                        self.set_layout(fb.fb_id, ImageSlot::Color, vk::ImageLayout::GENERAL);
                    }
                }

                // Get the attachments into the layouts the pass was
                // built against.
                self.transition_slot(
                    fb,
                    &fb.fb_color,
                    ImageSlot::Color,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                );
                if rp_type.has_depth() {
                    let depth = fb.fb_depth.as_ref().unwrap();
                    self.transition_slot(
                        fb,
                        depth,
                        ImageSlot::Depth,
                        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                    );
                }
                if let Some(msaa) = &fb.fb_msaa_color {
                    self.transition_slot(
                        fb,
                        msaa,
                        ImageSlot::MsaaColor,
                        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    );
                }
                if rp_type.has_depth() {
                    if let Some(msaa) = &fb.fb_msaa_depth {
                        self.transition_slot(
                            fb,
                            msaa,
                            ImageSlot::MsaaDepth,
                            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                        );
                    }
                }

                // Clear values line up with the attachment order;
                // resolve targets don't get cleared.
                if render.color_load == LoadAction::Clear {
                    clear_values.push(vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: unpack_color(render.clear_color),
                        },
                    });
                } else {
                    clear_values.push(vk::ClearValue::default());
                }
                if rp_type.has_depth() {
                    clear_values.push(vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue {
                            depth: render.clear_depth,
                            stencil: render.clear_stencil as u32,
                        },
                    });
                }
                if fb.fb_msaa_color.is_some() {
                    clear_values.push(vk::ClearValue::default());
                }
            }
            None => {
                let rp_obj = self.r_rp_cache.get(BACKBUFFER_RP_KEY);
                sample_count = vk::SampleCountFlags::TYPE_1;
                render_pass = rp_obj.get(&dev, &formats, rp_type, sample_count);
                framebuf = display.d_framebuffers[frame.cur_swapchain_image as usize];
                fb_width = display.d_resolution.width;
                fb_height = display.d_resolution.height;

                clear_values.push(vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: unpack_color(render.clear_color),
                    },
                });
                clear_values.push(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 0.0,
                        stencil: 0,
                    },
                });
            }
        }

        self.r_barrier.flush(&dev.dev, cmd);

        let mut render_area = render.render_area;
        if render_area.extent.width == 0 || render_area.extent.height == 0 {
            render_area = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: fb_width,
                    height: fb_height,
                },
            };
        }

        let rp_begin = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass)
            .framebuffer(framebuf)
            .render_area(render_area)
            .clear_values(clear_values.as_slice());
        unsafe {
            dev.dev
                .cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);
        }

        // Execute the commands, tracking a bit of state to skip
        // redundant driver calls. The stencil ones are very commonly
        // redundant.
        let mut cur_layout: Option<&Arc<PipelineLayout>> = None;
        let mut last_pipeline = vk::Pipeline::null();
        let mut pipeline_ok = false;
        let mut last_stencil_write_mask: i32 = -1;
        let mut last_stencil_compare_mask: i32 = -1;
        let mut last_stencil_reference: i32 = -1;

        for c in render.commands.iter() {
            match c {
                RenderCommand::Removed => {}

                RenderCommand::BindPipeline { pipeline, layout } => {
                    let promise = match pipeline.variant(rp_type) {
                        Some(p) => p,
                        None => {
                            // If render steps got merged, the step's
                            // final render pass type may not have
                            // existed when recording ended. Block and
                            // compile here; it doesn't happen much.
                            let promise = pipeline.claim_variant(rp_type).unwrap();
                            let native = pipeline.create_variant(
                                &dev,
                                self.r_pipeline_cache,
                                render_pass,
                                rp_type,
                                sample_count,
                            );
                            promise.resolve(native);
                            promise
                        }
                    };

                    let native = promise.block_until_ready();
                    if native != vk::Pipeline::null() {
                        if native != last_pipeline {
                            unsafe {
                                dev.dev.cmd_bind_pipeline(
                                    cmd,
                                    vk::PipelineBindPoint::GRAPHICS,
                                    native,
                                );
                            }
                            last_pipeline = native;
                            // Dynamic state must be refreshed under
                            // the new pipeline.
                            last_stencil_write_mask = -1;
                            last_stencil_compare_mask = -1;
                            last_stencil_reference = -1;
                        }
                        cur_layout = Some(layout);
                        pipeline_ok = true;
                    } else {
                        pipeline_ok = false;
                    }
                }

                RenderCommand::Viewport { vp } => unsafe {
                    dev.dev.cmd_set_viewport(cmd, 0, &[*vp]);
                },

                RenderCommand::Scissor { rc } => unsafe {
                    dev.dev.cmd_set_scissor(cmd, 0, &[*rc]);
                },

                RenderCommand::BlendFactor { color } => unsafe {
                    dev.dev.cmd_set_blend_constants(cmd, &unpack_color(*color));
                },

                RenderCommand::StencilParams {
                    write_mask,
                    compare_mask,
                    ref_value,
                } => unsafe {
                    if last_stencil_write_mask != *write_mask as i32 {
                        last_stencil_write_mask = *write_mask as i32;
                        dev.dev.cmd_set_stencil_write_mask(
                            cmd,
                            vk::StencilFaceFlags::FRONT_AND_BACK,
                            *write_mask as u32,
                        );
                    }
                    if last_stencil_compare_mask != *compare_mask as i32 {
                        last_stencil_compare_mask = *compare_mask as i32;
                        dev.dev.cmd_set_stencil_compare_mask(
                            cmd,
                            vk::StencilFaceFlags::FRONT_AND_BACK,
                            *compare_mask as u32,
                        );
                    }
                    if last_stencil_reference != *ref_value as i32 {
                        last_stencil_reference = *ref_value as i32;
                        dev.dev.cmd_set_stencil_reference(
                            cmd,
                            vk::StencilFaceFlags::FRONT_AND_BACK,
                            *ref_value as u32,
                        );
                    }
                },

                RenderCommand::PushConstants {
                    stages,
                    offset,
                    size,
                    data,
                } => {
                    if pipeline_ok {
                        let layout = cur_layout.unwrap();
                        unsafe {
                            dev.dev.cmd_push_constants(
                                cmd,
                                layout.pl_pipeline_layout,
                                *stages,
                                *offset as u32,
                                &data[..*size as usize],
                            );
                        }
                    }
                }

                RenderCommand::Clear {
                    color,
                    depth,
                    stencil,
                    mask,
                } => {
                    // If we get here, we failed to merge a clear into
                    // a render pass load op. Bad for perf but correct.
                    let mut attachments = Vec::new();
                    if mask.contains(vk::ImageAspectFlags::COLOR) {
                        attachments.push(vk::ClearAttachment {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            color_attachment: 0,
                            clear_value: vk::ClearValue {
                                color: vk::ClearColorValue {
                                    float32: unpack_color(*color),
                                },
                            },
                        });
                    }
                    if mask.intersects(vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL)
                    {
                        attachments.push(vk::ClearAttachment {
                            aspect_mask: *mask
                                & (vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL),
                            color_attachment: 0,
                            clear_value: vk::ClearValue {
                                depth_stencil: vk::ClearDepthStencilValue {
                                    depth: *depth,
                                    stencil: *stencil as u32,
                                },
                            },
                        });
                    }
                    if !attachments.is_empty() {
                        let rect = vk::ClearRect {
                            base_array_layer: 0,
                            // In multiview mode, 1 replicates to all
                            // active layers.
                            layer_count: 1,
                            rect: vk::Rect2D {
                                offset: vk::Offset2D { x: 0, y: 0 },
                                extent: vk::Extent2D {
                                    width: fb_width,
                                    height: fb_height,
                                },
                            },
                        };
                        unsafe {
                            dev.dev
                                .cmd_clear_attachments(cmd, attachments.as_slice(), &[rect]);
                        }
                    }
                }

                RenderCommand::Draw {
                    desc_set_index,
                    ubo_offsets,
                    num_ubo_offsets,
                    vbuffer,
                    voffset,
                    count,
                    offset,
                } => {
                    if pipeline_ok {
                        let layout = cur_layout.unwrap();
                        let set = layout.set_for(cur_frame, *desc_set_index);
                        debug_assert!(set != vk::DescriptorSet::null());
                        unsafe {
                            dev.dev.cmd_bind_descriptor_sets(
                                cmd,
                                vk::PipelineBindPoint::GRAPHICS,
                                layout.pl_pipeline_layout,
                                0,
                                &[set],
                                &ubo_offsets[..*num_ubo_offsets as usize],
                            );
                            if *vbuffer != vk::Buffer::null() {
                                dev.dev.cmd_bind_vertex_buffers(cmd, 0, &[*vbuffer], &[*voffset]);
                            }
                            dev.dev.cmd_draw(cmd, *count, 1, *offset, 0);
                        }
                    }
                }

                RenderCommand::DrawIndexed {
                    desc_set_index,
                    ubo_offsets,
                    num_ubo_offsets,
                    vbuffer,
                    voffset,
                    ibuffer,
                    ioffset,
                    index_type,
                    count,
                    instances,
                } => {
                    if pipeline_ok {
                        let layout = cur_layout.unwrap();
                        let set = layout.set_for(cur_frame, *desc_set_index);
                        debug_assert!(set != vk::DescriptorSet::null());
                        unsafe {
                            dev.dev.cmd_bind_descriptor_sets(
                                cmd,
                                vk::PipelineBindPoint::GRAPHICS,
                                layout.pl_pipeline_layout,
                                0,
                                &[set],
                                &ubo_offsets[..*num_ubo_offsets as usize],
                            );
                            dev.dev
                                .cmd_bind_index_buffer(cmd, *ibuffer, *ioffset, *index_type);
                            dev.dev.cmd_bind_vertex_buffers(cmd, 0, &[*vbuffer], &[*voffset]);
                            dev.dev.cmd_draw_indexed(cmd, *count, *instances, 0, 0, 0);
                        }
                    }
                }

                RenderCommand::DebugAnnotation { annotation } => {
                    if self.r_dev.inst.debug_utils_enabled {
                        self.r_dev.inst.cmd_insert_label(cmd, annotation);
                    }
                }
            }
        }

        unsafe { dev.dev.cmd_end_render_pass(cmd) };

        if let Some(fb) = &render.framebuffer {
            // The pass left the attachments in the optimal layouts;
            // transition out if a later step wants something else.
            if render.final_color_layout != vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL {
                self.transition_slot(fb, &fb.fb_color, ImageSlot::Color, render.final_color_layout);
            } else {
                self.set_layout(fb.fb_id, ImageSlot::Color, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
            }
            if rp_type.has_depth() {
                let depth = fb.fb_depth.as_ref().unwrap();
                if render.final_depth_layout != vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL {
                    self.transition_slot(fb, depth, ImageSlot::Depth, render.final_depth_layout);
                } else {
                    self.set_layout(
                        fb.fb_id,
                        ImageSlot::Depth,
                        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                    );
                }
            }
            self.r_barrier.flush(&dev.dev, cmd);
        }

        Ok(())
    }

    fn perform_copy(&mut self, step: &Step, cmd: vk::CommandBuffer) {
        let copy = match &step.kind {
            StepKind::Copy(c) => c,
            _ => unreachable!(),
        };
        let dev = self.r_dev.clone();
        let src = &copy.src;
        let dst = &copy.dst;

        // The barrier code doesn't handle intra-image copies; those
        // would need a transition to GENERAL.
        debug_assert!(src.fb_id != dst.fb_id);

        let layer_count = std::cmp::min(src.fb_layers, dst.fb_layers);
        debug_assert!(src.fb_layers >= dst.fb_layers);

        let depth_aspects = vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL;

        if copy.aspect.contains(vk::ImageAspectFlags::COLOR) {
            self.transition_slot(src, &src.fb_color, ImageSlot::Color, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
            self.transition_to_transfer_dst(dst, ImageSlot::Color);
        }
        if copy.aspect.intersects(depth_aspects) {
            debug_assert!(src.fb_depth.is_some() && dst.fb_depth.is_some());
            let src_depth = src.fb_depth.as_ref().unwrap();
            self.transition_slot(src, src_depth, ImageSlot::Depth, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
            self.transition_to_transfer_dst(dst, ImageSlot::Depth);
        }
        self.r_barrier.flush(&dev.dev, cmd);

        let multisampled = src.fb_samples != vk::SampleCountFlags::TYPE_1
            && dst.fb_samples != vk::SampleCountFlags::TYPE_1;
        if multisampled {
            // If both targets are multisampled, copy the msaa images
            // too; they live in attachment layouts normally.
            if copy.aspect.contains(vk::ImageAspectFlags::COLOR) {
                self.transition_slot(
                    src,
                    src.fb_msaa_color.as_ref().unwrap(),
                    ImageSlot::MsaaColor,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                );
                self.transition_slot(
                    dst,
                    dst.fb_msaa_color.as_ref().unwrap(),
                    ImageSlot::MsaaColor,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                );
            }
            if copy.aspect.intersects(depth_aspects) {
                self.transition_slot(
                    src,
                    src.fb_msaa_depth.as_ref().unwrap(),
                    ImageSlot::MsaaDepth,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                );
                self.transition_slot(
                    dst,
                    dst.fb_msaa_depth.as_ref().unwrap(),
                    ImageSlot::MsaaDepth,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                );
            }
            self.r_barrier.flush(&dev.dev, cmd);
        }

        let mut region = vk::ImageCopy::default();
        region.src_offset = vk::Offset3D {
            x: copy.src_rect.offset.x,
            y: copy.src_rect.offset.y,
            z: 0,
        };
        region.dst_offset = vk::Offset3D {
            x: copy.dst_pos.x,
            y: copy.dst_pos.y,
            z: 0,
        };
        region.src_subresource.layer_count = layer_count;
        region.dst_subresource.layer_count = layer_count;
        region.extent = vk::Extent3D {
            width: copy.src_rect.extent.width,
            height: copy.src_rect.extent.height,
            depth: 1,
        };

        unsafe {
            if copy.aspect.contains(vk::ImageAspectFlags::COLOR) {
                region.src_subresource.aspect_mask = vk::ImageAspectFlags::COLOR;
                region.dst_subresource.aspect_mask = vk::ImageAspectFlags::COLOR;
                dev.dev.cmd_copy_image(
                    cmd,
                    src.fb_color.native().image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    dst.fb_color.native().image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
                if multisampled {
                    dev.dev.cmd_copy_image(
                        cmd,
                        src.fb_msaa_color.as_ref().unwrap().native().image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst.fb_msaa_color.as_ref().unwrap().native().image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
            }
            if copy.aspect.intersects(depth_aspects) {
                let aspects = copy.aspect & depth_aspects;
                region.src_subresource.aspect_mask = aspects;
                region.dst_subresource.aspect_mask = aspects;
                dev.dev.cmd_copy_image(
                    cmd,
                    src.fb_depth.as_ref().unwrap().native().image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    dst.fb_depth.as_ref().unwrap().native().image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
                if multisampled {
                    dev.dev.cmd_copy_image(
                        cmd,
                        src.fb_msaa_depth.as_ref().unwrap().native().image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst.fb_msaa_depth.as_ref().unwrap().native().image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
            }
        }

        if multisampled {
            // The MSAA images live their lives in attachment layouts;
            // restore them.
            if copy.aspect.contains(vk::ImageAspectFlags::COLOR) {
                self.transition_slot(
                    src,
                    src.fb_msaa_color.as_ref().unwrap(),
                    ImageSlot::MsaaColor,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                );
                self.transition_slot(
                    dst,
                    dst.fb_msaa_color.as_ref().unwrap(),
                    ImageSlot::MsaaColor,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                );
            }
            if copy.aspect.intersects(depth_aspects) {
                self.transition_slot(
                    src,
                    src.fb_msaa_depth.as_ref().unwrap(),
                    ImageSlot::MsaaDepth,
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                );
                self.transition_slot(
                    dst,
                    dst.fb_msaa_depth.as_ref().unwrap(),
                    ImageSlot::MsaaDepth,
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                );
            }
            self.r_barrier.flush(&dev.dev, cmd);
        }
    }

    /// Transfer-dst transitions need the write-after-write special
    /// case: copying twice into the same image with no use in
    /// between needs a barrier to pass sync validation.
    fn transition_to_transfer_dst(&mut self, fb: &Framebuffer, slot: ImageSlot) {
        let record = match slot {
            ImageSlot::Color => &fb.fb_color,
            ImageSlot::Depth => fb.fb_depth.as_ref().unwrap(),
            ImageSlot::MsaaColor => fb.fb_msaa_color.as_ref().unwrap(),
            ImageSlot::MsaaDepth => fb.fb_msaa_depth.as_ref().unwrap(),
        };
        if self.layout(fb.fb_id, slot) == vk::ImageLayout::TRANSFER_DST_OPTIMAL {
            self.r_barrier.transition_image(
                record.native().image,
                0,
                1,
                record.layers,
                record.aspect,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
            );
        } else {
            self.transition_slot(fb, record, slot, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        }
    }

    fn perform_blit(&mut self, step: &Step, cmd: vk::CommandBuffer) {
        let blit = match &step.kind {
            StepKind::Blit(b) => b,
            _ => unreachable!(),
        };
        let dev = self.r_dev.clone();
        let src = &blit.src;
        let dst = &blit.dst;

        debug_assert!(src.fb_id != dst.fb_id);
        let layer_count = std::cmp::min(src.fb_layers, dst.fb_layers);

        let depth_aspects = vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL;

        if blit.aspect.contains(vk::ImageAspectFlags::COLOR) {
            self.transition_slot(src, &src.fb_color, ImageSlot::Color, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
            self.transition_to_transfer_dst(dst, ImageSlot::Color);
        }
        if blit.aspect.intersects(depth_aspects) {
            // Depth blits require both images to have depth; the
            // recording side validated that.
            let src_depth = src.fb_depth.as_ref().unwrap();
            self.transition_slot(src, src_depth, ImageSlot::Depth, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
            self.transition_to_transfer_dst(dst, ImageSlot::Depth);
        }
        self.r_barrier.flush(&dev.dev, cmd);

        let mut region = vk::ImageBlit::default();
        region.src_offsets[0] = vk::Offset3D {
            x: blit.src_rect.offset.x,
            y: blit.src_rect.offset.y,
            z: 0,
        };
        region.src_offsets[1] = vk::Offset3D {
            x: blit.src_rect.offset.x + blit.src_rect.extent.width as i32,
            y: blit.src_rect.offset.y + blit.src_rect.extent.height as i32,
            z: 1,
        };
        region.dst_offsets[0] = vk::Offset3D {
            x: blit.dst_rect.offset.x,
            y: blit.dst_rect.offset.y,
            z: 0,
        };
        region.dst_offsets[1] = vk::Offset3D {
            x: blit.dst_rect.offset.x + blit.dst_rect.extent.width as i32,
            y: blit.dst_rect.offset.y + blit.dst_rect.extent.height as i32,
            z: 1,
        };
        region.src_subresource.layer_count = layer_count;
        region.dst_subresource.layer_count = layer_count;

        unsafe {
            if blit.aspect.contains(vk::ImageAspectFlags::COLOR) {
                region.src_subresource.aspect_mask = vk::ImageAspectFlags::COLOR;
                region.dst_subresource.aspect_mask = vk::ImageAspectFlags::COLOR;
                dev.dev.cmd_blit_image(
                    cmd,
                    src.fb_color.native().image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    dst.fb_color.native().image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                    blit.filter,
                );
            }
            if blit.aspect.intersects(depth_aspects) {
                let aspects = blit.aspect & depth_aspects;
                region.src_subresource.aspect_mask = aspects;
                region.dst_subresource.aspect_mask = aspects;
                dev.dev.cmd_blit_image(
                    cmd,
                    src.fb_depth.as_ref().unwrap().native().image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    dst.fb_depth.as_ref().unwrap().native().image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                    blit.filter,
                );
            }
        }
    }

    /// Bytes per pixel a readback of `aspect` from `fb` produces.
    fn readback_pixel_size(src: Option<&Arc<Framebuffer>>, aspect: vk::ImageAspectFlags) -> usize {
        if aspect.contains(vk::ImageAspectFlags::STENCIL)
            && !aspect.contains(vk::ImageAspectFlags::DEPTH)
        {
            return 1;
        }
        if aspect.contains(vk::ImageAspectFlags::DEPTH) {
            let format = src.map(|fb| fb.fb_depth.as_ref().unwrap().format);
            return match format {
                Some(vk::Format::D16_UNORM) | Some(vk::Format::D16_UNORM_S8_UINT) => 2,
                _ => 4,
            };
        }
        4
    }

    fn resize_readback_buffer(dev: &Device, cached: &mut CachedReadback, required: vk::DeviceSize) {
        if cached.buffer != vk::Buffer::null() && required <= cached.size {
            return;
        }
        cached.destroy(dev);

        match dev.create_buffer_with_size(
            vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
            required,
        ) {
            Ok((buffer, memory, mem_type)) => {
                cached.buffer = buffer;
                cached.memory = memory;
                cached.size = required;
                cached.is_coherent = dev.memory_type_is_coherent(mem_type);
            }
            Err(_) => {
                // Fall back to plain host-visible memory.
                if let Ok((buffer, memory, mem_type)) = dev.create_buffer_with_size(
                    vk::BufferUsageFlags::TRANSFER_DST,
                    vk::MemoryPropertyFlags::HOST_VISIBLE,
                    required,
                ) {
                    cached.buffer = buffer;
                    cached.memory = memory;
                    cached.size = required;
                    cached.is_coherent = dev.memory_type_is_coherent(mem_type);
                }
            }
        }
    }

    fn perform_readback(
        &mut self,
        step: &Step,
        cmd: vk::CommandBuffer,
        frame: &mut FrameData,
        display: &Display,
    ) {
        let readback = match &step.kind {
            StepKind::Readback(r) => r,
            _ => unreachable!(),
        };
        let dev = self.r_dev.clone();

        let image;
        match &readback.src {
            None => {
                // Backbuffer readback: we only take screenshots after
                // the main render pass, so transition out of PRESENT
                // and back afterwards.
                image = display.d_images[frame.cur_swapchain_image as usize];
                self.r_barrier.transition_image(
                    image,
                    0,
                    1,
                    1,
                    vk::ImageAspectFlags::COLOR,
                    vk::ImageLayout::PRESENT_SRC_KHR,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::AccessFlags::empty(),
                    vk::AccessFlags::TRANSFER_READ,
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                    vk::PipelineStageFlags::TRANSFER,
                );
            }
            Some(fb) => {
                if readback.aspect.contains(vk::ImageAspectFlags::COLOR) {
                    image = fb.fb_color.native().image;
                    self.transition_slot(
                        fb,
                        &fb.fb_color,
                        ImageSlot::Color,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    );
                } else {
                    let depth = fb.fb_depth.as_ref().expect("depth readback without depth");
                    image = depth.native().image;
                    self.transition_slot(
                        fb,
                        depth,
                        ImageSlot::Depth,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    );
                }
            }
        }
        self.r_barrier.flush(&dev.dev, cmd);

        let pixel_size = Self::readback_pixel_size(readback.src.as_ref(), readback.aspect);
        let required = (pixel_size as u32
            * readback.src_rect.extent.width
            * readback.src_rect.extent.height) as vk::DeviceSize;

        let record_copy = |dev: &Device, cached: &mut CachedReadback| {
            Self::resize_readback_buffer(dev, cached, required);
            if cached.buffer == vk::Buffer::null() {
                log::error!("readback: could not allocate {} bytes", required);
                return;
            }

            let region = vk::BufferImageCopy {
                image_offset: vk::Offset3D {
                    x: readback.src_rect.offset.x,
                    y: readback.src_rect.offset.y,
                    z: 0,
                },
                image_extent: vk::Extent3D {
                    width: readback.src_rect.extent.width,
                    height: readback.src_rect.extent.height,
                    depth: 1,
                },
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: readback.aspect,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                buffer_offset: 0,
                buffer_row_length: readback.src_rect.extent.width,
                buffer_image_height: readback.src_rect.extent.height,
            };

            unsafe {
                dev.dev.cmd_copy_image_to_buffer(
                    cmd,
                    image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    cached.buffer,
                    &[region],
                );
            }
        };

        // Delayed readbacks keep a buffer per (fb, w, h) in the frame
        // slot; blocking ones share the sync buffer.
        if readback.delayed {
            let key: ReadbackKey = (
                readback.src.as_ref().map(|fb| fb.fb_id).unwrap_or(0),
                readback.src_rect.extent.width,
                readback.src_rect.extent.height,
            );
            let cached = frame
                .readbacks
                .entry(key)
                .or_insert_with(CachedReadback::empty);
            record_copy(&dev, cached);
        } else {
            let sync_readback = self.r_sync_readback.clone();
            let mut cached = sync_readback.lock().unwrap();
            record_copy(&dev, &mut cached);
        }

        // Can't read the buffer from the CPU here; the caller syncs
        // first.

        if readback.src.is_none() {
            // Transition the backbuffer back for presentation.
            self.r_barrier.transition_image(
                image,
                0,
                1,
                1,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::AccessFlags::TRANSFER_READ,
                vk::AccessFlags::empty(),
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::ALL_COMMANDS,
            );
            self.r_barrier.flush(&dev.dev, cmd);
        }
    }

    fn perform_readback_image(&mut self, step: &Step, cmd: vk::CommandBuffer) {
        let readback = match &step.kind {
            StepKind::ReadbackImage(r) => r,
            _ => unreachable!(),
        };
        let dev = self.r_dev.clone();
        let native = readback.texture.native();

        // Textures sit in SHADER_READ between uses.
        self.r_barrier.transition_image_auto(
            native.image,
            readback.mip_level,
            1,
            1,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        self.r_barrier.flush(&dev.dev, cmd);

        let required = (4 * readback.src_rect.extent.width * readback.src_rect.extent.height)
            as vk::DeviceSize;
        let sync_readback = self.r_sync_readback.clone();
        let mut cached = sync_readback.lock().unwrap();
        Self::resize_readback_buffer(&dev, &mut cached, required);
        if cached.buffer == vk::Buffer::null() {
            return;
        }

        let region = vk::BufferImageCopy {
            image_offset: vk::Offset3D {
                x: readback.src_rect.offset.x,
                y: readback.src_rect.offset.y,
                z: 0,
            },
            image_extent: vk::Extent3D {
                width: readback.src_rect.extent.width,
                height: readback.src_rect.extent.height,
                depth: 1,
            },
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: readback.mip_level,
                base_array_layer: 0,
                layer_count: 1,
            },
            buffer_offset: 0,
            buffer_row_length: readback.src_rect.extent.width,
            buffer_image_height: readback.src_rect.extent.height,
        };
        unsafe {
            dev.dev.cmd_copy_image_to_buffer(
                cmd,
                native.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                cached.buffer,
                &[region],
            );
        }

        // Hand it back to the samplers.
        self.r_barrier.transition_image_auto(
            native.image,
            readback.mip_level,
            1,
            1,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        self.r_barrier.flush(&dev.dev, cmd);
    }

    pub fn pipeline_cache(&self) -> vk::PipelineCache {
        self.r_pipeline_cache
    }

    pub fn destroy(&mut self) {
        let dev = self.r_dev.clone();
        self.r_sync_readback.lock().unwrap().destroy(&dev);
        self.r_rp_cache.destroy(&dev);
        if !dev.skip_destroys() {
            unsafe { dev.dev.destroy_pipeline_cache(self.r_pipeline_cache, None) };
        }
    }
}

/// Human-readable step description for profiling.
pub fn step_to_string(step: &Step) -> String {
    match &step.kind {
        StepKind::Render(r) => {
            let target = r
                .framebuffer
                .as_ref()
                .map(|fb| fb.fb_tag.clone())
                .unwrap_or_else(|| "(backbuffer)".to_string());
            format!(
                "{} {} {} (draws: {}, {}x{})",
                r.render_pass_type.name(),
                step.tag,
                target,
                r.num_draws,
                r.render_area.extent.width,
                r.render_area.extent.height
            )
        }
        StepKind::Copy(c) => format!(
            "COPY '{}' {} -> {} ({}x{})",
            step.tag,
            c.src.fb_tag,
            c.dst.fb_tag,
            c.src_rect.extent.width,
            c.src_rect.extent.height
        ),
        StepKind::Blit(b) => format!(
            "BLIT '{}' {} -> {} ({}x{} -> {}x{})",
            step.tag,
            b.src.fb_tag,
            b.dst.fb_tag,
            b.src_rect.extent.width,
            b.src_rect.extent.height,
            b.dst_rect.extent.width,
            b.dst_rect.extent.height
        ),
        StepKind::Readback(r) => format!(
            "READBACK '{}' {} ({}x{})",
            step.tag,
            r.src
                .as_ref()
                .map(|fb| fb.fb_tag.as_str())
                .unwrap_or("(backbuffer)"),
            r.src_rect.extent.width,
            r.src_rect.extent.height
        ),
        StepKind::ReadbackImage(r) => format!(
            "READBACK_IMAGE '{}' ({}x{})",
            step.tag, r.src_rect.extent.width, r.src_rect.extent.height
        ),
        StepKind::RenderSkip => format!("(RENDER_SKIP) {}", step.tag),
    }
}

/// Copy a completed readback into caller memory, converting to the
/// destination format. Called from the recording thread after the
/// sync (or, for delayed readbacks, on a later frame).
///
/// Returns false when no buffer exists yet for a delayed readback.
pub fn copy_readback_buffer(
    dev: &Device,
    frame: &mut FrameData,
    sync_readback: &Arc<Mutex<CachedReadback>>,
    delayed_key: Option<ReadbackKey>,
    width: u32,
    height: u32,
    src_format: DataFormat,
    dest_format: DataFormat,
    pixel_stride: u32,
    pixels: &mut [u8],
) -> bool {
    let sync_guard;
    let cached: &CachedReadback = match delayed_key {
        Some(key) => match frame.readbacks.get(&key) {
            Some(c) => c,
            // Didn't have a cached image ready yet.
            None => return false,
        },
        None => {
            sync_guard = sync_readback.lock().unwrap();
            &*sync_guard
        }
    };

    if cached.buffer == vk::Buffer::null() {
        return false;
    }

    let src_pixel_size = src_format.size_in_bytes();
    let mapped = unsafe {
        match dev.dev.map_memory(
            cached.memory,
            0,
            vk::WHOLE_SIZE,
            vk::MemoryMapFlags::empty(),
        ) {
            Ok(ptr) => ptr,
            Err(e) => {
                log::error!("copy_readback_buffer: map failed ({:?})", e);
                return false;
            }
        }
    };

    if !cached.is_coherent {
        let range = vk::MappedMemoryRange::builder()
            .memory(cached.memory)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();
        unsafe {
            let _ = dev.dev.invalidate_mapped_memory_ranges(&[range]);
        }
    }

    let src =
        unsafe { std::slice::from_raw_parts(mapped as *const u8, (width * height) as usize * src_pixel_size) };

    let ok = if src_format == DataFormat::R8G8B8A8Unorm {
        format::convert_from_rgba8888(pixels, src, pixel_stride, width, width, height, dest_format)
            .is_ok()
    } else if src_format == DataFormat::B8G8R8A8Unorm {
        format::convert_from_bgra8888(pixels, src, pixel_stride, width, width, height, dest_format)
            .is_ok()
    } else if src_format == dest_format {
        // Can just copy rows when it matches, no matter the format.
        let row = width as usize * src_pixel_size;
        for y in 0..height as usize {
            let dst_off = y * pixel_stride as usize * src_pixel_size;
            pixels[dst_off..dst_off + row].copy_from_slice(&src[y * row..(y + 1) * row]);
        }
        true
    } else if dest_format == DataFormat::D32F {
        format::convert_to_d32f(pixels, src, pixel_stride, width, width, height, src_format).is_ok()
    } else if dest_format == DataFormat::D16 {
        format::convert_to_d16(pixels, src, pixel_stride, width, width, height, src_format).is_ok()
    } else {
        log::error!(
            "copy_readback_buffer: unsupported conversion {} -> {}",
            src_format.name(),
            dest_format.name()
        );
        false
    };

    unsafe { dev.dev.unmap_memory(cached.memory) };
    ok
}
