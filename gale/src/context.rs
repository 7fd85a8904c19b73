// The draw context
//
// The caller-facing surface over the render queue: it owns the
// "current state" block (bound pipeline, textures, samplers, dynamic
// uniforms, vertex/index buffers) and assembles descriptor sets at
// draw time. Everything here runs on the emu thread and only records;
// nothing touches the driver until the frame is handed over.

use ash::vk;

use crate::descriptor::{BindingType, PackedDescriptor, PipelineLayout};
use crate::device::Device;
use crate::display::Display;
use crate::format::DataFormat;
use crate::pipeline::{GraphicsPipeline, PipelineDesc, RasterStateKey, ShaderId};
use crate::queue::{ReadbackMode, RenderQueue};
use crate::resource::{
    Buffer, BufferUsage, Framebuffer, InputLayout, SamplerDesc, SamplerState, ShaderModule,
    ShaderStage, VertexAttribute,
};
use crate::step::{LoadAction, PipelineFlags};
use crate::{CreateInfo, Result};
use utils::log;

use std::sync::Arc;

/// Texture binding slots available to fragment shaders.
pub const MAX_BOUND_TEXTURES: usize = 3;

/// What a texture slot is currently bound to.
#[derive(Clone)]
enum BoundTexture {
    Texture(Arc<Texture>),
    /// A framebuffer bound as a texture resolves to a raw view.
    FbView(vk::ImageView),
}

use crate::resource::Texture;

/// A compiled pipeline as the caller sees it: the variant set plus
/// the layout and flags the queue needs at bind time.
pub struct Pipeline {
    pub p_pipeline: Arc<GraphicsPipeline>,
    pub p_layout: Arc<PipelineLayout>,
    pub p_flags: PipelineFlags,
}

/// Everything needed to create a pipeline, minus the things the
/// context already knows (layout, sample count defaults).
pub struct PipelineCreateDesc {
    pub vertex: Arc<ShaderModule>,
    pub fragment: Arc<ShaderModule>,
    pub input_layout: Option<Arc<InputLayout>>,
    pub raster: RasterStateKey,
    pub sample_count: vk::SampleCountFlags,
    pub vertex_shader_id: ShaderId,
    pub fragment_shader_id: ShaderId,
    pub vtx_fmt_id: u32,
    pub use_hw_transform: bool,
}

/// One draw of a clipped batch: its own scissor, optionally its own
/// texture, and an index range.
pub struct ClippedDraw {
    pub scissor: vk::Rect2D,
    pub texture: Option<Arc<Texture>>,
    pub index_count: u32,
    pub first_index: u32,
}

pub struct DrawContext {
    dc_queue: RenderQueue,
    dc_layout: Arc<PipelineLayout>,
    dc_default_sampler: Arc<SamplerState>,

    dc_cur_pipeline: Option<Arc<Pipeline>>,
    dc_bound_textures: [Option<BoundTexture>; MAX_BOUND_TEXTURES],
    dc_bound_samplers: [Option<Arc<SamplerState>>; MAX_BOUND_TEXTURES],

    /// Latest dynamic uniform upload: buffer, dynamic offset, size.
    dc_cur_ubo: Option<(vk::Buffer, u32, u32)>,
    dc_cur_vertex: Option<(vk::Buffer, u64)>,
    dc_cur_index: Option<(vk::Buffer, u64, vk::IndexType)>,
}

impl DrawContext {
    /// Stand the whole stack up over a display surface.
    pub fn new(dev: Arc<Device>, display: Display, info: &CreateInfo) -> Result<Self> {
        let mut queue = RenderQueue::new(dev.clone(), display, info)?;

        // One layout covers the common case: a dynamic uniform block
        // plus the fragment texture slots.
        let mut bindings = vec![BindingType::UniformBufferDynamicAll];
        for _ in 0..MAX_BOUND_TEXTURES {
            bindings.push(BindingType::CombinedImageSampler);
        }
        let layout = queue.create_pipeline_layout(&bindings, false, "context");
        let default_sampler = queue.create_sampler_state(SamplerDesc::default());

        const NO_TEX: Option<BoundTexture> = None;
        const NO_SAMP: Option<Arc<SamplerState>> = None;
        Ok(Self {
            dc_queue: queue,
            dc_layout: layout,
            dc_default_sampler: default_sampler,
            dc_cur_pipeline: None,
            dc_bound_textures: [NO_TEX; MAX_BOUND_TEXTURES],
            dc_bound_samplers: [NO_SAMP; MAX_BOUND_TEXTURES],
            dc_cur_ubo: None,
            dc_cur_vertex: None,
            dc_cur_index: None,
        })
    }

    pub fn queue(&mut self) -> &mut RenderQueue {
        &mut self.dc_queue
    }

    pub fn caps(&self) -> &crate::DeviceCaps {
        &self.dc_queue.device().d_caps
    }

    // ------------------------------------------------------------------
    // Resource creation

    pub fn create_framebuffer(
        &mut self,
        width: u32,
        height: u32,
        with_depth: bool,
        tag: &str,
    ) -> Arc<Framebuffer> {
        self.dc_queue.create_framebuffer(
            width,
            height,
            1,
            vk::SampleCountFlags::TYPE_1,
            with_depth,
            tag,
        )
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
        self.dc_queue
            .create_texture(width, height, depth, mip_levels, format, levels, tag)
    }

    pub fn create_buffer(
        &mut self,
        size: usize,
        usage: BufferUsage,
        dynamic: bool,
        data: Option<Vec<u8>>,
    ) -> Option<Arc<Buffer>> {
        if size == 0 {
            debug_assert!(false, "zero-size buffer");
            log::error!("rejecting zero-size buffer");
            return None;
        }
        Some(self.dc_queue.create_buffer(size, usage, dynamic, data))
    }

    pub fn create_input_layout(
        &mut self,
        attributes: Vec<VertexAttribute>,
        stride: u32,
    ) -> Arc<InputLayout> {
        InputLayout::new(attributes, stride)
    }

    pub fn create_shader_module(
        &mut self,
        stage: ShaderStage,
        spirv: Vec<u32>,
        source: String,
        tag: &str,
    ) -> Arc<ShaderModule> {
        self.dc_queue.create_shader_module(stage, spirv, source, tag)
    }

    pub fn create_sampler_state(&mut self, desc: SamplerDesc) -> Arc<SamplerState> {
        self.dc_queue.create_sampler_state(desc)
    }

    /// Returns None only for configuration errors; compile failures
    /// surface later as dropped draws plus an error callback.
    pub fn create_pipeline(&mut self, desc: PipelineCreateDesc, tag: &str) -> Option<Arc<Pipeline>> {
        if desc.vertex.sm_stage != ShaderStage::Vertex
            || desc.fragment.sm_stage != ShaderStage::Fragment
        {
            debug_assert!(false, "pipeline created with wrong shader stages");
            log::error!("pipeline {}: wrong shader stages", tag);
            return None;
        }

        let mut flags = PipelineFlags::empty();
        if desc.raster.depth_test_enable != 0
            || desc.raster.depth_write_enable != 0
            || desc.raster.stencil_test_enable != 0
        {
            flags |= PipelineFlags::USES_DEPTH_STENCIL;
        }
        if desc.raster.blend_enable != 0 {
            flags |= PipelineFlags::USES_BLEND_CONSTANT;
        }

        let pipeline_desc = PipelineDesc {
            raster: desc.raster,
            vertex: desc.vertex,
            fragment: desc.fragment,
            input_layout: desc.input_layout,
            layout: self.dc_layout.clone(),
            vertex_shader_id: desc.vertex_shader_id,
            fragment_shader_id: desc.fragment_shader_id,
            vtx_fmt_id: desc.vtx_fmt_id,
            use_hw_transform: desc.use_hw_transform,
        };
        let pipeline = self
            .dc_queue
            .create_graphics_pipeline(pipeline_desc, desc.sample_count, tag);

        Some(Arc::new(Pipeline {
            p_pipeline: pipeline,
            p_layout: self.dc_layout.clone(),
            p_flags: flags,
        }))
    }

    // ------------------------------------------------------------------
    // Frame API

    pub fn begin_frame(&mut self, enable_profiling: bool) -> Result<()> {
        self.dc_queue.begin_frame(enable_profiling)
    }

    pub fn end_frame(&mut self) {
        self.dc_queue.finish_frame();
        self.invalidate_cached_state();
    }

    pub fn present(&mut self) {
        self.dc_queue.present();
    }

    fn invalidate_cached_state(&mut self) {
        self.dc_cur_pipeline = None;
        self.dc_cur_ubo = None;
        self.dc_cur_vertex = None;
        self.dc_cur_index = None;
        for t in self.dc_bound_textures.iter_mut() {
            *t = None;
        }
    }

    // ------------------------------------------------------------------
    // Pass API

    pub fn bind_framebuffer_as_render_target(
        &mut self,
        fb: Option<&Arc<Framebuffer>>,
        color: LoadAction,
        depth: LoadAction,
        stencil: LoadAction,
        clear_color: u32,
        clear_depth: f32,
        clear_stencil: u8,
        tag: &'static str,
    ) {
        self.dc_queue.bind_framebuffer_as_render_target(
            fb,
            color,
            depth,
            stencil,
            clear_color,
            clear_depth,
            clear_stencil,
            tag,
        );
    }

    /// Bind a framebuffer aspect into a texture slot.
    pub fn bind_framebuffer_as_texture(
        &mut self,
        fb: &Arc<Framebuffer>,
        binding: usize,
        aspect: vk::ImageAspectFlags,
        layer: i32,
    ) {
        debug_assert!(binding < MAX_BOUND_TEXTURES);
        let view = self.dc_queue.bind_framebuffer_as_texture(fb, aspect, layer);
        self.dc_bound_textures[binding] = Some(BoundTexture::FbView(view));
    }

    pub fn copy_framebuffer_image(
        &mut self,
        src: &Arc<Framebuffer>,
        src_rect: vk::Rect2D,
        dst: &Arc<Framebuffer>,
        dst_pos: vk::Offset2D,
        aspect: vk::ImageAspectFlags,
        tag: &'static str,
    ) {
        self.dc_queue
            .copy_framebuffer(src, src_rect, dst, dst_pos, aspect, tag);
    }

    pub fn blit_framebuffer(
        &mut self,
        src: &Arc<Framebuffer>,
        src_rect: vk::Rect2D,
        dst: &Arc<Framebuffer>,
        dst_rect: vk::Rect2D,
        aspect: vk::ImageAspectFlags,
        linear: bool,
        tag: &'static str,
    ) {
        self.dc_queue.blit_framebuffer(
            src,
            src_rect,
            dst,
            dst_rect,
            aspect,
            if linear {
                vk::Filter::LINEAR
            } else {
                vk::Filter::NEAREST
            },
            tag,
        );
    }

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
        self.dc_queue.copy_framebuffer_to_memory(
            src,
            aspect,
            x,
            y,
            w,
            h,
            dest_format,
            pixels,
            pixel_stride,
            mode,
            tag,
        )
    }

    // ------------------------------------------------------------------
    // State API

    pub fn set_viewport(&mut self, vp: vk::Viewport) {
        self.dc_queue.set_viewport(vp);
    }

    pub fn set_scissor(&mut self, rc: vk::Rect2D) {
        self.dc_queue.set_scissor(rc);
    }

    pub fn set_blend_factor(&mut self, color: u32) {
        self.dc_queue.set_blend_factor(color);
    }

    pub fn set_stencil_params(&mut self, write_mask: u8, compare_mask: u8, ref_value: u8) {
        self.dc_queue
            .set_stencil_params(write_mask, compare_mask, ref_value);
    }

    pub fn bind_pipeline(&mut self, pipeline: &Arc<Pipeline>) {
        self.dc_queue
            .bind_pipeline(&pipeline.p_pipeline, &pipeline.p_layout, pipeline.p_flags);
        self.dc_cur_pipeline = Some(pipeline.clone());
    }

    pub fn bind_vertex_buffer(&mut self, buffer: &Arc<Buffer>, offset: u64) {
        self.dc_cur_vertex = Some((buffer.native().buffer, offset));
    }

    pub fn bind_index_buffer(&mut self, buffer: &Arc<Buffer>, offset: u64) {
        self.dc_cur_index = Some((buffer.native().buffer, offset, vk::IndexType::UINT16));
    }

    /// Push fresh uniform data; subsequent draws bind it through the
    /// dynamic offset.
    pub fn update_dynamic_uniform_buffer(&mut self, data: &[u8]) -> Result<()> {
        let (buffer, offset) = self.dc_queue.push_uniform_data(data)?;
        self.dc_cur_ubo = Some((buffer, offset, data.len() as u32));
        Ok(())
    }

    pub fn bind_textures(&mut self, start: usize, textures: &[&Arc<Texture>]) {
        for (i, tex) in textures.iter().enumerate() {
            debug_assert!(start + i < MAX_BOUND_TEXTURES);
            self.dc_bound_textures[start + i] = Some(BoundTexture::Texture((*tex).clone()));
        }
    }

    pub fn bind_sampler_states(&mut self, start: usize, samplers: &[&Arc<SamplerState>]) {
        for (i, s) in samplers.iter().enumerate() {
            debug_assert!(start + i < MAX_BOUND_TEXTURES);
            self.dc_bound_samplers[start + i] = Some((*s).clone());
        }
    }

    // ------------------------------------------------------------------
    // Draw API

    /// Pack the bound state into a pending descriptor set.
    fn flush_descriptors(&mut self) -> u32 {
        let mut descs = [PackedDescriptor::Empty; 1 + MAX_BOUND_TEXTURES];

        if let Some((buffer, _offset, range)) = self.dc_cur_ubo {
            // Dynamic UBO binds at offset zero; the true offset rides
            // along with the draw.
            descs[0] = PackedDescriptor::Buffer {
                buffer,
                offset: 0,
                range,
            };
        }

        for i in 0..MAX_BOUND_TEXTURES {
            let view = match &self.dc_bound_textures[i] {
                Some(BoundTexture::Texture(tex)) => tex.native().view,
                Some(BoundTexture::FbView(view)) => *view,
                None => continue,
            };
            let sampler = self.dc_bound_samplers[i]
                .as_ref()
                .unwrap_or(&self.dc_default_sampler)
                .s_sampler;
            descs[1 + i] = PackedDescriptor::Image { view, sampler };
        }

        self.dc_queue.push_desc_set(&self.dc_layout, &descs)
    }

    fn ubo_offsets(&self) -> [u32; 1] {
        [self.dc_cur_ubo.map(|(_, offset, _)| offset).unwrap_or(0)]
    }

    pub fn draw(&mut self, count: u32, offset: u32) {
        debug_assert!(self.dc_cur_pipeline.is_some());
        let desc_set = self.flush_descriptors();
        let (vbuf, voffset) = self.dc_cur_vertex.unwrap_or((vk::Buffer::null(), 0));
        let ubo = self.ubo_offsets();
        self.dc_queue.draw(desc_set, &ubo, vbuf, voffset, count, offset);
    }

    pub fn draw_indexed(&mut self, count: u32, offset: u32) {
        debug_assert!(self.dc_cur_pipeline.is_some());
        let desc_set = self.flush_descriptors();
        let (vbuf, voffset) = self.dc_cur_vertex.expect("indexed draw without vertex buffer");
        let (ibuf, ioffset, index_type) =
            self.dc_cur_index.expect("indexed draw without index buffer");
        let ubo = self.ubo_offsets();
        self.dc_queue.draw_indexed(
            desc_set,
            &ubo,
            vbuf,
            voffset,
            ibuf,
            ioffset + offset as u64 * 2,
            index_type,
            count,
            1,
        );
    }

    /// Draw raw vertex data without a buffer object: the data goes
    /// through this frame's vertex push buffer.
    pub fn draw_up(&mut self, vertex_data: &[u8], count: u32) {
        debug_assert!(self.dc_cur_pipeline.is_some());
        let (vbuf, voffset) = match self.dc_queue.push_vertex_data(vertex_data) {
            Ok(r) => r,
            Err(_) => return,
        };
        let desc_set = self.flush_descriptors();
        let ubo = self.ubo_offsets();
        self.dc_queue
            .draw(desc_set, &ubo, vbuf, voffset as u64, count, 0);
    }

    /// Indexed variant of draw_up; indices are u16.
    pub fn draw_indexed_up(&mut self, vertex_data: &[u8], index_data: &[u16], count: u32) {
        debug_assert!(self.dc_cur_pipeline.is_some());
        let index_bytes = unsafe {
            std::slice::from_raw_parts(index_data.as_ptr() as *const u8, index_data.len() * 2)
        };
        let (vbuf, voffset) = match self.dc_queue.push_vertex_data(vertex_data) {
            Ok(r) => r,
            Err(_) => return,
        };
        let (ibuf, ioffset) = match self.dc_queue.push_index_data(index_bytes) {
            Ok(r) => r,
            Err(_) => return,
        };
        let desc_set = self.flush_descriptors();
        let ubo = self.ubo_offsets();
        self.dc_queue.draw_indexed(
            desc_set,
            &ubo,
            vbuf,
            voffset as u64,
            ibuf,
            ioffset as u64,
            vk::IndexType::UINT16,
            count,
            1,
        );
    }

    /// A batch of small indexed draws over shared vertex/index data,
    /// each with its own scissor and optionally its own texture.
    /// Used for clipped UI/effect rendering where state churn would
    /// otherwise dominate.
    pub fn draw_indexed_clipped_batch_up(
        &mut self,
        vertex_data: &[u8],
        index_data: &[u16],
        draws: &[ClippedDraw],
    ) {
        debug_assert!(self.dc_cur_pipeline.is_some());
        let index_bytes = unsafe {
            std::slice::from_raw_parts(index_data.as_ptr() as *const u8, index_data.len() * 2)
        };
        let (vbuf, voffset) = match self.dc_queue.push_vertex_data(vertex_data) {
            Ok(r) => r,
            Err(_) => return,
        };
        let (ibuf, ioffset) = match self.dc_queue.push_index_data(index_bytes) {
            Ok(r) => r,
            Err(_) => return,
        };

        for d in draws {
            self.dc_queue.set_scissor(d.scissor);
            if let Some(tex) = &d.texture {
                self.dc_bound_textures[0] = Some(BoundTexture::Texture(tex.clone()));
            }
            let desc_set = self.flush_descriptors();
            let ubo = self.ubo_offsets();
            self.dc_queue.draw_indexed(
                desc_set,
                &ubo,
                vbuf,
                voffset as u64,
                ibuf,
                ioffset as u64 + d.first_index as u64 * 2,
                vk::IndexType::UINT16,
                d.index_count,
                1,
            );
        }
    }
}
