// The step and command data model
//
// A step is a coarse unit of GPU work: one render pass or one
// non-pass operation. The recording thread builds a list of these per
// frame; the optimizer rewrites the list; the queue runner executes
// it. Steps reference framebuffers through shared handles and track
// dependencies by stable resource id only.

use ash::vk;

use crate::pipeline::{GraphicsPipeline, RenderPassType};
use crate::descriptor::PipelineLayout;
use crate::resource::{Framebuffer, ResourceId, Texture};

use std::sync::Arc;

bitflags::bitflags! {
    /// Accumulated over the pipelines bound in a step; used to derive
    /// the render-pass-type when the step closes.
    pub struct PipelineFlags: u32 {
        const USES_BLEND_CONSTANT = 1 << 1;
        const USES_DEPTH_STENCIL = 1 << 2;
        const USES_GEOMETRY_SHADER = 1 << 3;
        const USES_MULTIVIEW = 1 << 4;
        const USES_DISCARD = 1 << 5;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LoadAction {
    Keep,
    Clear,
    DontCare,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StoreAction {
    Store,
    DontCare,
}

/// An image-layout change recorded alongside a step, executed before
/// the step begins.
#[derive(Clone)]
pub struct TransitionRequest {
    pub fb: Arc<Framebuffer>,
    pub aspect: vk::ImageAspectFlags,
    pub target_layout: vk::ImageLayout,
}

impl PartialEq for TransitionRequest {
    fn eq(&self, other: &Self) -> bool {
        self.fb.fb_id == other.fb.fb_id
            && self.aspect == other.aspect
            && self.target_layout == other.target_layout
    }
}

/// Commands recorded inside a RENDER step, in execution order.
#[derive(Clone)]
pub enum RenderCommand {
    /// Left behind by clear folding and duplicate-state cleanup.
    Removed,
    BindPipeline {
        pipeline: Arc<GraphicsPipeline>,
        layout: Arc<PipelineLayout>,
    },
    Viewport {
        vp: vk::Viewport,
    },
    Scissor {
        rc: vk::Rect2D,
    },
    BlendFactor {
        color: u32,
    },
    StencilParams {
        write_mask: u8,
        compare_mask: u8,
        ref_value: u8,
    },
    PushConstants {
        stages: vk::ShaderStageFlags,
        offset: u8,
        size: u8,
        data: [u8; 64],
    },
    Clear {
        color: u32,
        depth: f32,
        stencil: u8,
        mask: vk::ImageAspectFlags,
    },
    Draw {
        desc_set_index: u32,
        ubo_offsets: [u32; 3],
        num_ubo_offsets: u8,
        vbuffer: vk::Buffer,
        voffset: u64,
        count: u32,
        offset: u32,
    },
    DrawIndexed {
        desc_set_index: u32,
        ubo_offsets: [u32; 3],
        num_ubo_offsets: u8,
        vbuffer: vk::Buffer,
        voffset: u64,
        ibuffer: vk::Buffer,
        ioffset: u64,
        index_type: vk::IndexType,
        count: u32,
        instances: u32,
    },
    DebugAnnotation {
        annotation: &'static str,
    },
}

impl RenderCommand {
    pub fn is_draw(&self) -> bool {
        matches!(self, RenderCommand::Draw { .. } | RenderCommand::DrawIndexed { .. })
    }
}

pub struct RenderStep {
    /// None renders to the backbuffer.
    pub framebuffer: Option<Arc<Framebuffer>>,

    pub color_load: LoadAction,
    pub depth_load: LoadAction,
    pub stencil_load: LoadAction,
    pub color_store: StoreAction,
    pub depth_store: StoreAction,
    pub stencil_store: StoreAction,

    pub clear_color: u32,
    pub clear_depth: f32,
    pub clear_stencil: u8,

    pub num_draws: u32,
    pub num_reads: u32,

    /// Layout each attachment should be left in when the pass ends.
    /// UNDEFINED means "not decided yet"; the optimizer fills in the
    /// attachment-optimal default.
    pub final_color_layout: vk::ImageLayout,
    pub final_depth_layout: vk::ImageLayout,

    pub pipeline_flags: PipelineFlags,
    pub render_area: vk::Rect2D,
    /// Assigned at step close; do not read before that.
    pub render_pass_type: RenderPassType,

    pub pre_transitions: Vec<TransitionRequest>,
    pub commands: Vec<RenderCommand>,
}

impl RenderStep {
    pub fn has_clear_load(&self) -> bool {
        self.color_load == LoadAction::Clear
            || self.depth_load == LoadAction::Clear
            || self.stencil_load == LoadAction::Clear
    }

    /// Add a pre-transition unless an identical one is queued.
    pub fn add_pre_transition(&mut self, rq: TransitionRequest) {
        if !self.pre_transitions.iter().any(|t| *t == rq) {
            self.pre_transitions.push(rq);
        }
    }
}

pub struct CopyStep {
    pub src: Arc<Framebuffer>,
    pub dst: Arc<Framebuffer>,
    pub src_rect: vk::Rect2D,
    pub dst_pos: vk::Offset2D,
    pub aspect: vk::ImageAspectFlags,
}

pub struct BlitStep {
    pub src: Arc<Framebuffer>,
    pub dst: Arc<Framebuffer>,
    pub src_rect: vk::Rect2D,
    pub dst_rect: vk::Rect2D,
    pub filter: vk::Filter,
    pub aspect: vk::ImageAspectFlags,
}

pub struct ReadbackStep {
    /// None reads the backbuffer.
    pub src: Option<Arc<Framebuffer>>,
    pub src_rect: vk::Rect2D,
    pub aspect: vk::ImageAspectFlags,
    /// Delayed readbacks reuse a cached buffer and tolerate data
    /// that is a frame old.
    pub delayed: bool,
}

pub struct ReadbackImageStep {
    pub texture: Arc<Texture>,
    pub mip_level: u32,
    pub src_rect: vk::Rect2D,
}

pub enum StepKind {
    Render(RenderStep),
    Copy(CopyStep),
    Blit(BlitStep),
    Readback(ReadbackStep),
    ReadbackImage(ReadbackImageStep),
    /// A step neutralized by the optimizer. Kept in place so step
    /// indices stay stable.
    RenderSkip,
}

pub struct Step {
    pub tag: &'static str,
    /// Framebuffers this step reads, as stable ids, sorted.
    pub dependencies: Vec<ResourceId>,
    pub kind: StepKind,
}

impl Step {
    pub fn new_render(tag: &'static str, render: RenderStep) -> Self {
        Self {
            tag,
            dependencies: Vec::new(),
            kind: StepKind::Render(render),
        }
    }

    pub fn add_dependency(&mut self, id: ResourceId) {
        if let Err(pos) = self.dependencies.binary_search(&id) {
            self.dependencies.insert(pos, id);
        }
    }

    pub fn depends_on(&self, id: ResourceId) -> bool {
        self.dependencies.binary_search(&id).is_ok()
    }

    pub fn depends_on_any(&self, ids: &[ResourceId]) -> bool {
        ids.iter().any(|id| self.depends_on(*id))
    }

    pub fn render(&self) -> Option<&RenderStep> {
        match &self.kind {
            StepKind::Render(r) => Some(r),
            _ => None,
        }
    }

    pub fn render_mut(&mut self) -> Option<&mut RenderStep> {
        match &mut self.kind {
            StepKind::Render(r) => Some(r),
            _ => None,
        }
    }
}

/// Rectangle accumulator for the render area of the current step.
#[derive(Debug, Copy, Clone)]
pub struct BoundingRect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingRect {
    pub fn new() -> Self {
        let mut ret = Self {
            x1: 0,
            y1: 0,
            x2: 0,
            y2: 0,
        };
        ret.reset();
        ret
    }

    pub fn reset(&mut self) {
        self.x1 = 65535;
        self.y1 = 65535;
        self.x2 = -65535;
        self.y2 = -65535;
    }

    pub fn is_empty(&self) -> bool {
        self.x2 < 0
    }

    pub fn set_rect(&mut self, x: i32, y: i32, width: i32, height: i32) {
        self.x1 = x;
        self.y1 = y;
        self.x2 = width;
        self.y2 = height;
    }

    pub fn apply(&mut self, rect: &vk::Rect2D) {
        if rect.offset.x < self.x1 {
            self.x1 = rect.offset.x;
        }
        if rect.offset.y < self.y1 {
            self.y1 = rect.offset.y;
        }
        let rect_x2 = rect.offset.x + rect.extent.width as i32;
        let rect_y2 = rect.offset.y + rect.extent.height as i32;
        if rect_x2 > self.x2 {
            self.x2 = rect_x2;
        }
        if rect_y2 > self.y2 {
            self.y2 = rect_y2;
        }
    }

    pub fn to_rect2d(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D {
                x: self.x1,
                y: self.y1,
            },
            extent: vk::Extent2D {
                width: (self.x2 - self.x1) as u32,
                height: (self.y2 - self.y1) as u32,
            },
        }
    }
}

/// Walk backwards to the step that last wrote `fb_id` and stamp its
/// final layout(s), so the transition happens on the way out of that
/// pass instead of as a separate barrier later. Layouts that were
/// already decided stay; we just lose a tiny optimization then.
pub fn stamp_final_layout_backwards(
    steps: &mut [Step],
    fb_id: ResourceId,
    aspect: vk::ImageAspectFlags,
    layout: vk::ImageLayout,
    count_read: bool,
) {
    for step in steps.iter_mut().rev() {
        if let StepKind::Render(r) = &mut step.kind {
            if r.framebuffer.as_ref().map(|f| f.fb_id) == Some(fb_id) {
                if aspect.contains(vk::ImageAspectFlags::COLOR)
                    && r.final_color_layout == vk::ImageLayout::UNDEFINED
                {
                    r.final_color_layout = layout;
                }
                if aspect.intersects(vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL)
                    && r.final_depth_layout == vk::ImageLayout::UNDEFINED
                {
                    r.final_depth_layout = layout;
                }
                if count_read {
                    r.num_reads += 1;
                }
                return;
            }
        }
    }
}

/// Count a read against the most recent pass that wrote `fb_id`.
pub fn bump_num_reads_backwards(steps: &mut [Step], fb_id: ResourceId) {
    for step in steps.iter_mut().rev() {
        if let StepKind::Render(r) = &mut step.kind {
            if r.framebuffer.as_ref().map(|f| f.fb_id) == Some(fb_id) {
                r.num_reads += 1;
                return;
            }
        }
    }
}

/// Grow `dest` so it covers `src` as well.
pub fn merge_render_area_rect(dest: &mut vk::Rect2D, src: &vk::Rect2D) {
    if dest.offset.x > src.offset.x {
        dest.extent.width += (dest.offset.x - src.offset.x) as u32;
        dest.offset.x = src.offset.x;
    }
    if dest.offset.y > src.offset.y {
        dest.extent.height += (dest.offset.y - src.offset.y) as u32;
        dest.offset.y = src.offset.y;
    }
    if dest.extent.width < src.extent.width {
        dest.extent.width = src.extent.width;
    }
    if dest.extent.height < src.extent.height {
        dest.extent.height = src.extent.height;
    }
}

/// Neutralize draw commands in a command vector. Used when a clear
/// folds into the pass's load actions after draws were queued.
pub fn remove_draw_commands(cmds: &mut Vec<RenderCommand>) {
    for c in cmds.iter_mut() {
        if c.is_draw() {
            *c = RenderCommand::Removed;
        }
    }
}

/// Drop state commands that are superseded before any draw consumes
/// them (mostly left behind by remove_draw_commands).
pub fn cleanup_render_commands(cmds: &mut Vec<RenderCommand>) {
    const NUM_SLOTS: usize = 4;
    fn slot(c: &RenderCommand) -> Option<usize> {
        match c {
            RenderCommand::Viewport { .. } => Some(0),
            RenderCommand::Scissor { .. } => Some(1),
            RenderCommand::BlendFactor { .. } => Some(2),
            RenderCommand::StencilParams { .. } => Some(3),
            _ => None,
        }
    }

    let mut last_of: [Option<usize>; NUM_SLOTS] = [None; NUM_SLOTS];

    for i in 0..cmds.len() {
        let skip = matches!(
            cmds[i],
            RenderCommand::Removed
                | RenderCommand::Clear { .. }
                // Push constant offsets accumulate, so those have to
                // stay even when no draw follows.
                | RenderCommand::PushConstants { .. }
        );
        if skip {
            continue;
        }

        match slot(&cmds[i]) {
            Some(s) => {
                if let Some(prev) = last_of[s] {
                    cmds[prev] = RenderCommand::Removed;
                }
                last_of[s] = Some(i);
            }
            None => {
                // Draw or bind: a boundary, everything before it is
                // consumed.
                last_of = [None; NUM_SLOTS];
            }
        }
    }

    // Anything still tracked was never consumed by a draw.
    for s in last_of.iter() {
        if let Some(i) = *s {
            cmds[i] = RenderCommand::Removed;
        }
    }
}
