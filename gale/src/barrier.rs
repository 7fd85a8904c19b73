// Image barrier batching
//
// Layout transitions get collected here during step processing and
// are flushed as a single vkCmdPipelineBarrier before the work that
// needs them. Access and stage masks are derived from the source and
// destination layouts.

use ash::vk;

/// Accumulates image memory barriers plus the union of their stage
/// masks. Empty after every flush.
pub struct BarrierBatch {
    b_image_barriers: Vec<vk::ImageMemoryBarrier>,
    b_src_stage_mask: vk::PipelineStageFlags,
    b_dst_stage_mask: vk::PipelineStageFlags,
}

// Safe since the barriers only reference vulkan handles, we never
// chain p_next structs here.
unsafe impl Send for BarrierBatch {}

impl BarrierBatch {
    pub fn new() -> Self {
        Self {
            b_image_barriers: Vec::new(),
            b_src_stage_mask: vk::PipelineStageFlags::empty(),
            b_dst_stage_mask: vk::PipelineStageFlags::empty(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.b_image_barriers.is_empty()
    }

    /// Queue a fully specified transition.
    pub fn transition_image(
        &mut self,
        image: vk::Image,
        base_mip: u32,
        mip_count: u32,
        layer_count: u32,
        aspect: vk::ImageAspectFlags,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        let barrier = vk::ImageMemoryBarrier::builder()
            .image(image)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(aspect)
                    .base_mip_level(base_mip)
                    .level_count(mip_count)
                    .layer_count(layer_count)
                    .build(),
            )
            .build();

        self.b_image_barriers.push(barrier);
        self.b_src_stage_mask |= src_stage;
        self.b_dst_stage_mask |= dst_stage;
    }

    /// Queue a transition, deriving access and stage masks from the
    /// two layouts.
    pub fn transition_image_auto(
        &mut self,
        image: vk::Image,
        base_mip: u32,
        mip_count: u32,
        layer_count: u32,
        aspect: vk::ImageAspectFlags,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        let (src_access, src_stage) = src_access_and_stage(old_layout);
        let (dst_access, dst_stage) = dst_access_and_stage(new_layout);

        self.transition_image(
            image,
            base_mip,
            mip_count,
            layer_count,
            aspect,
            old_layout,
            new_layout,
            src_access,
            dst_access,
            src_stage,
            dst_stage,
        );
    }

    /// Record all queued barriers as one pipeline barrier and clear
    /// the batch.
    pub fn flush(&mut self, dev: &ash::Device, cbuf: vk::CommandBuffer) {
        if self.b_image_barriers.is_empty() {
            return;
        }

        unsafe {
            dev.cmd_pipeline_barrier(
                cbuf,
                self.b_src_stage_mask,
                self.b_dst_stage_mask,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                self.b_image_barriers.as_slice(),
            );
        }

        self.b_image_barriers.clear();
        self.b_src_stage_mask = vk::PipelineStageFlags::empty();
        self.b_dst_stage_mask = vk::PipelineStageFlags::empty();
    }
}

/// What must have finished before we leave `layout`.
pub fn src_access_and_stage(layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        vk::ImageLayout::UNDEFINED => {
            (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE)
        }
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::COLOR_ATTACHMENT_READ,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        vk::ImageLayout::PRESENT_SRC_KHR => (
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::GENERAL => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}

/// What waits for us in `layout`.
pub fn dst_access_and_stage(layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::COLOR_ATTACHMENT_READ,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        vk::ImageLayout::PRESENT_SRC_KHR => (
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
        vk::ImageLayout::GENERAL => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}

/// The transitions the queue runner is allowed to emit. Everything
/// else is a bug in step processing.
pub fn layout_transition_allowed(from: vk::ImageLayout, to: vk::ImageLayout) -> bool {
    use vk::ImageLayout as L;

    if from == to {
        // Write-after-write self barriers.
        return from == L::COLOR_ATTACHMENT_OPTIMAL
            || from == L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            || from == L::TRANSFER_DST_OPTIMAL;
    }

    match from {
        L::UNDEFINED => matches!(
            to,
            L::COLOR_ATTACHMENT_OPTIMAL
                | L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
                | L::TRANSFER_SRC_OPTIMAL
                | L::TRANSFER_DST_OPTIMAL
                | L::SHADER_READ_ONLY_OPTIMAL
                | L::GENERAL
        ),
        L::COLOR_ATTACHMENT_OPTIMAL
        | L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        | L::TRANSFER_SRC_OPTIMAL
        | L::TRANSFER_DST_OPTIMAL
        | L::SHADER_READ_ONLY_OPTIMAL
        | L::GENERAL => matches!(
            to,
            L::COLOR_ATTACHMENT_OPTIMAL
                | L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
                | L::TRANSFER_SRC_OPTIMAL
                | L::TRANSFER_DST_OPTIMAL
                | L::SHADER_READ_ONLY_OPTIMAL
                | L::GENERAL
                | L::PRESENT_SRC_KHR
        ),
        L::PRESENT_SRC_KHR => matches!(to, L::TRANSFER_SRC_OPTIMAL | L::COLOR_ATTACHMENT_OPTIMAL),
        _ => false,
    }
}
