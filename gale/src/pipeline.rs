// Pipeline variants, the compile queue and the on-disk cache
//
// A pipeline object is immutable description plus one native pipeline
// per render-pass-type variant it has been used with. Variants are
// compiled asynchronously on the compile thread; consumers await the
// promise in the variant slot.

use ash::vk;
use serde::{Deserialize, Serialize};

use crate::descriptor::PipelineLayout;
use crate::device::Device;
use crate::resource::{InputLayout, ShaderModule};
use utils::log;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Condvar, Mutex};

bitflags::bitflags! {
    /// Bitset used to index pipeline variants compatible with a step.
    ///
    /// A pipeline compiled for type T1 is usable for a step of type
    /// T2 iff T1 == T2 and the sample counts match.
    pub struct RenderPassType: u32 {
        const DEFAULT = 0;
        const HAS_DEPTH = 1;
        const MULTIVIEW = 2;
        const MULTISAMPLE = 4;
        const BACKBUFFER = 8;
    }
}

pub const RENDER_PASS_TYPE_COUNT: usize = 16;

impl RenderPassType {
    pub fn index(&self) -> usize {
        self.bits() as usize
    }

    pub fn has_depth(&self) -> bool {
        self.contains(RenderPassType::HAS_DEPTH)
    }

    pub fn is_backbuffer(&self) -> bool {
        self.contains(RenderPassType::BACKBUFFER)
    }

    pub fn name(&self) -> &'static str {
        match self.bits() {
            0 => "DEFAULT",
            1 => "HAS_DEPTH",
            2 => "MULTIVIEW",
            3 => "MULTIVIEW_DEPTH",
            4 => "MULTISAMPLE",
            5 => "MULTISAMPLE_DEPTH",
            _ if self.is_backbuffer() => "BACKBUFFER",
            _ => "COMBINED",
        }
    }
}

/// We need to take the "max" of the features used in two render
/// passes when merging steps.
pub fn merge_rp_types(a: RenderPassType, b: RenderPassType) -> RenderPassType {
    // Either both are backbuffer type, or neither are. Backbuffer
    // passes can't merge with anything else.
    if a.is_backbuffer() || b.is_backbuffer() {
        debug_assert_eq!(a, b);
        return a;
    }

    debug_assert_eq!(
        a & RenderPassType::MULTIVIEW,
        b & RenderPassType::MULTIVIEW
    );

    // The rest we can just OR together to get the maximum feature set.
    a | b
}

enum PromiseState<T> {
    Pending,
    Ready(T),
}

/// An awaitable slot. Pending blocks the caller; resolved returns the
/// stored value (which for pipelines may be null on failure).
pub struct Promise<T: Copy> {
    p_state: Mutex<PromiseState<T>>,
    p_cond: Condvar,
}

impl<T: Copy> Promise<T> {
    pub fn new_empty() -> Arc<Self> {
        Arc::new(Self {
            p_state: Mutex::new(PromiseState::Pending),
            p_cond: Condvar::new(),
        })
    }

    pub fn new_ready(value: T) -> Arc<Self> {
        Arc::new(Self {
            p_state: Mutex::new(PromiseState::Ready(value)),
            p_cond: Condvar::new(),
        })
    }

    pub fn resolve(&self, value: T) {
        let mut state = self.p_state.lock().unwrap();
        *state = PromiseState::Ready(value);
        self.p_cond.notify_all();
    }

    pub fn try_get(&self) -> Option<T> {
        match &*self.p_state.lock().unwrap() {
            PromiseState::Ready(v) => Some(*v),
            PromiseState::Pending => None,
        }
    }

    pub fn block_until_ready(&self) -> T {
        let mut state = self.p_state.lock().unwrap();
        loop {
            if let PromiseState::Ready(v) = &*state {
                return *v;
            }
            state = self.p_cond.wait(state).unwrap();
        }
    }
}

/// The serializable half of the pipeline key: fixed-function state
/// that the emulator derives from guest GPU registers.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct RasterStateKey {
    pub topology: u8,
    pub cull_mode: u8,
    pub front_face_ccw: u8,

    pub blend_enable: u8,
    pub src_color: u8,
    pub dst_color: u8,
    pub color_blend_op: u8,
    pub src_alpha: u8,
    pub dst_alpha: u8,
    pub alpha_blend_op: u8,
    pub color_write_mask: u8,
    pub logic_op_enable: u8,
    pub logic_op: u8,

    pub depth_test_enable: u8,
    pub depth_write_enable: u8,
    pub depth_compare_op: u8,
    pub depth_clamp_enable: u8,

    pub stencil_test_enable: u8,
    pub stencil_compare_op: u8,
    pub stencil_pass_op: u8,
    pub stencil_fail_op: u8,
    pub stencil_depth_fail_op: u8,
}

impl RasterStateKey {
    pub(crate) fn vk_topology(&self) -> vk::PrimitiveTopology {
        vk::PrimitiveTopology::from_raw(self.topology as i32)
    }

    pub(crate) fn vk_cull_mode(&self) -> vk::CullModeFlags {
        vk::CullModeFlags::from_raw(self.cull_mode as u32)
    }
}

fn blend_factor(raw: u8) -> vk::BlendFactor {
    vk::BlendFactor::from_raw(raw as i32)
}

fn blend_op(raw: u8) -> vk::BlendOp {
    vk::BlendOp::from_raw(raw as i32)
}

fn compare_op(raw: u8) -> vk::CompareOp {
    vk::CompareOp::from_raw(raw as i32)
}

fn stencil_op(raw: u8) -> vk::StencilOp {
    vk::StencilOp::from_raw(raw as i32)
}

/// Identity of a shader as stored in the disk cache.
pub type ShaderId = [u32; 4];

/// Everything needed to compile any variant of one pipeline.
pub struct PipelineDesc {
    pub raster: RasterStateKey,
    pub vertex: Arc<ShaderModule>,
    pub fragment: Arc<ShaderModule>,
    pub input_layout: Option<Arc<InputLayout>>,
    pub layout: Arc<PipelineLayout>,

    pub vertex_shader_id: ShaderId,
    pub fragment_shader_id: ShaderId,
    pub vtx_fmt_id: u32,
    pub use_hw_transform: bool,
}

/// A pipeline handle: one immutable descriptor, one native pipeline
/// per (render-pass-type, sample-count) variant.
pub struct GraphicsPipeline {
    pub p_desc: PipelineDesc,
    /// The sample count all variants of this pipeline target.
    pub p_sample_count: vk::SampleCountFlags,
    pub p_tag: String,
    p_variants: Mutex<[Option<Arc<Promise<vk::Pipeline>>>; RENDER_PASS_TYPE_COUNT]>,
}

impl GraphicsPipeline {
    pub fn new(desc: PipelineDesc, sample_count: vk::SampleCountFlags, tag: &str) -> Arc<Self> {
        const NONE: Option<Arc<Promise<vk::Pipeline>>> = None;
        Arc::new(Self {
            p_desc: desc,
            p_sample_count: sample_count,
            p_tag: tag.to_string(),
            p_variants: Mutex::new([NONE; RENDER_PASS_TYPE_COUNT]),
        })
    }

    pub fn variant(&self, rp_type: RenderPassType) -> Option<Arc<Promise<vk::Pipeline>>> {
        self.p_variants.lock().unwrap()[rp_type.index()].clone()
    }

    /// Install an empty promise for `rp_type` if none exists yet.
    /// Returns Some(promise) when the caller is responsible for
    /// getting it compiled.
    pub fn claim_variant(&self, rp_type: RenderPassType) -> Option<Arc<Promise<vk::Pipeline>>> {
        let mut variants = self.p_variants.lock().unwrap();
        if variants[rp_type.index()].is_some() {
            return None;
        }
        let promise = Promise::new_empty();
        variants[rp_type.index()] = Some(promise.clone());
        Some(promise)
    }

    /// Bitmask over the render-pass-types this pipeline has variants
    /// for, as stored in the disk cache.
    pub fn variants_bitmask(&self) -> u32 {
        let variants = self.p_variants.lock().unwrap();
        let mut mask = 0u32;
        for (i, v) in variants.iter().enumerate() {
            if v.is_some() {
                mask |= 1 << i;
            }
        }
        mask
    }

    /// Create the native pipeline for one variant. Called on the
    /// compile thread (or synchronously by the runner when a merge
    /// changed a step's type late).
    ///
    /// Returns a null handle on failure, after reporting; draws with
    /// a null pipeline are dropped.
    pub fn create_variant(
        &self,
        dev: &Device,
        pipeline_cache: vk::PipelineCache,
        compatible_render_pass: vk::RenderPass,
        rp_type: RenderPassType,
        sample_count: vk::SampleCountFlags,
    ) -> vk::Pipeline {
        let desc = &self.p_desc;

        let vs = match desc.vertex.native() {
            Some(m) => m,
            None => {
                dev.report_error(
                    "pipeline",
                    &format!("{}: vertex shader failed\n{}", self.p_tag, desc.vertex.sm_source),
                );
                return vk::Pipeline::null();
            }
        };
        let fs = match desc.fragment.native() {
            Some(m) => m,
            None => {
                // Attach both sources, link-style failures need them.
                dev.report_error(
                    "pipeline",
                    &format!(
                        "{}: fragment shader failed\n{}\n{}",
                        self.p_tag, desc.vertex.sm_source, desc.fragment.sm_source
                    ),
                );
                return vk::Pipeline::null();
            }
        };

        let entry = std::ffi::CString::new("main").unwrap();
        let stages = [
            vk::PipelineShaderStageCreateInfo {
                module: vs,
                p_name: entry.as_ptr(),
                stage: vk::ShaderStageFlags::VERTEX,
                ..Default::default()
            },
            vk::PipelineShaderStageCreateInfo {
                module: fs,
                p_name: entry.as_ptr(),
                stage: vk::ShaderStageFlags::FRAGMENT,
                ..Default::default()
            },
        ];

        let mut vertex_bindings = Vec::new();
        let mut vertex_attributes = Vec::new();
        if let Some(il) = &desc.input_layout {
            vertex_bindings.push(vk::VertexInputBindingDescription {
                binding: 0,
                stride: il.il_stride,
                input_rate: vk::VertexInputRate::VERTEX,
            });
            for attr in il.il_attributes.iter() {
                vertex_attributes.push(vk::VertexInputAttributeDescription {
                    binding: 0,
                    location: attr.location,
                    format: Device::vk_format(attr.format),
                    offset: attr.offset,
                });
            }
        }
        let vertex_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(vertex_bindings.as_slice())
            .vertex_attribute_descriptions(vertex_attributes.as_slice());

        let assembly = vk::PipelineInputAssemblyStateCreateInfo {
            topology: desc.raster.vk_topology(),
            ..Default::default()
        };

        // Viewport and scissor are always dynamic, the counts still
        // have to be declared.
        let viewport_info = vk::PipelineViewportStateCreateInfo {
            viewport_count: 1,
            scissor_count: 1,
            ..Default::default()
        };

        let raster_info = vk::PipelineRasterizationStateCreateInfo {
            cull_mode: desc.raster.vk_cull_mode(),
            front_face: if desc.raster.front_face_ccw != 0 {
                vk::FrontFace::COUNTER_CLOCKWISE
            } else {
                vk::FrontFace::CLOCKWISE
            },
            depth_clamp_enable: desc.raster.depth_clamp_enable as u32,
            line_width: 1.0,
            polygon_mode: vk::PolygonMode::FILL,
            ..Default::default()
        };

        let samples = if rp_type.contains(RenderPassType::MULTISAMPLE) {
            sample_count
        } else {
            vk::SampleCountFlags::TYPE_1
        };
        let multisample_info = vk::PipelineMultisampleStateCreateInfo {
            rasterization_samples: samples,
            ..Default::default()
        };

        let stencil_state = vk::StencilOpState {
            fail_op: stencil_op(desc.raster.stencil_fail_op),
            pass_op: stencil_op(desc.raster.stencil_pass_op),
            depth_fail_op: stencil_op(desc.raster.stencil_depth_fail_op),
            compare_op: compare_op(desc.raster.stencil_compare_op),
            // Masks and reference are dynamic state.
            ..Default::default()
        };
        let depth_info = vk::PipelineDepthStencilStateCreateInfo {
            depth_test_enable: desc.raster.depth_test_enable as u32,
            depth_write_enable: desc.raster.depth_write_enable as u32,
            depth_compare_op: compare_op(desc.raster.depth_compare_op),
            stencil_test_enable: desc.raster.stencil_test_enable as u32,
            front: stencil_state,
            back: stencil_state,
            ..Default::default()
        };

        let blend_attachment_states = [vk::PipelineColorBlendAttachmentState {
            blend_enable: desc.raster.blend_enable as u32,
            src_color_blend_factor: blend_factor(desc.raster.src_color),
            dst_color_blend_factor: blend_factor(desc.raster.dst_color),
            color_blend_op: blend_op(desc.raster.color_blend_op),
            src_alpha_blend_factor: blend_factor(desc.raster.src_alpha),
            dst_alpha_blend_factor: blend_factor(desc.raster.dst_alpha),
            alpha_blend_op: blend_op(desc.raster.alpha_blend_op),
            color_write_mask: vk::ColorComponentFlags::from_raw(desc.raster.color_write_mask as u32),
        }];
        let blend_info = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(desc.raster.logic_op_enable != 0)
            .logic_op(vk::LogicOp::from_raw(desc.raster.logic_op as i32))
            .attachments(&blend_attachment_states)
            .build();

        let dynamic_states = [
            vk::DynamicState::VIEWPORT,
            vk::DynamicState::SCISSOR,
            vk::DynamicState::BLEND_CONSTANTS,
            vk::DynamicState::STENCIL_WRITE_MASK,
            vk::DynamicState::STENCIL_COMPARE_MASK,
            vk::DynamicState::STENCIL_REFERENCE,
        ];
        let dynamic_info =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_info)
            .input_assembly_state(&assembly)
            .viewport_state(&viewport_info)
            .rasterization_state(&raster_info)
            .multisample_state(&multisample_info)
            .depth_stencil_state(&depth_info)
            .color_blend_state(&blend_info)
            .dynamic_state(&dynamic_info)
            .layout(desc.layout.pl_pipeline_layout)
            .render_pass(compatible_render_pass)
            .build();

        let result = unsafe {
            dev.dev
                .create_graphics_pipelines(pipeline_cache, &[pipeline_info], None)
        };

        match result {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                dev.report_error(
                    "pipeline",
                    &format!("{}: creation failed ({:?})", self.p_tag, e),
                );
                vk::Pipeline::null()
            }
        }
    }

    /// Destroy all compiled variants. Deleter-list path.
    pub(crate) fn destroy(&self, dev: &Device) {
        if dev.skip_destroys() {
            return;
        }
        let variants = self.p_variants.lock().unwrap();
        for v in variants.iter() {
            if let Some(promise) = v {
                if let Some(pipeline) = promise.try_get() {
                    if pipeline != vk::Pipeline::null() {
                        unsafe { dev.dev.destroy_pipeline(pipeline, None) };
                    }
                }
            }
        }
    }
}

/// One variant waiting to be compiled.
pub struct CompileQueueEntry {
    pub pipeline: Arc<GraphicsPipeline>,
    pub promise: Arc<Promise<vk::Pipeline>>,
    pub compatible_render_pass: vk::RenderPass,
    pub rp_type: RenderPassType,
    pub sample_count: vk::SampleCountFlags,
}

/// Compile a batch of entries.
///
/// We group pending pipelines by their (vertex, fragment) shader
/// pair; drivers that cache shader compilation between variants
/// (NVIDIA) benefit from seeing them back to back.
pub fn compile_entries(dev: &Device, pipeline_cache: vk::PipelineCache, entries: Vec<CompileQueueEntry>) {
    let count = entries.len();
    let mut by_shader_pair: HashMap<(u64, u64), Vec<CompileQueueEntry>> = HashMap::new();
    for entry in entries {
        let key = (
            entry.pipeline.p_desc.vertex.sm_id,
            entry.pipeline.p_desc.fragment.sm_id,
        );
        by_shader_pair.entry(key).or_default().push(entry);
    }

    log::debug!(
        "compiling {} pipeline variants across {} shader pairs",
        count,
        by_shader_pair.len()
    );

    for (_, group) in by_shader_pair {
        for entry in group {
            let pipeline = entry.pipeline.create_variant(
                dev,
                pipeline_cache,
                entry.compatible_render_pass,
                entry.rp_type,
                entry.sample_count,
            );
            entry.promise.resolve(pipeline);
        }
    }
}

// ---------------------------------------------------------------------
// On-disk cache

/// Bump on any change to the stored record layout.
pub const CACHE_VERSION: u8 = 1;

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StoredPipelineKey {
    pub raster: RasterStateKey,
    pub vertex_shader_id: ShaderId,
    pub fragment_shader_id: ShaderId,
    pub vtx_fmt_id: u32,
    pub variants: u32,
    pub use_hw_transform: u8,
}

/// The header vulkan prescribes for raw pipeline cache blobs.
const RAW_HEADER_SIZE: usize = 16 + vk::UUID_SIZE;
const RAW_HEADER_VERSION_ONE: u32 = 1;

/// A raw driver blob is only usable on the exact device that wrote
/// it. Checks the embedded header version and cache UUID.
pub fn validate_raw_blob(blob: &[u8], device_uuid: &[u8; vk::UUID_SIZE]) -> bool {
    if blob.len() < RAW_HEADER_SIZE {
        return false;
    }
    let version = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]);
    if version != RAW_HEADER_VERSION_ONE {
        return false;
    }
    &blob[16..16 + vk::UUID_SIZE] == &device_uuid[..]
}

/// Write the cache: version byte, optional raw driver blob, then the
/// key records.
pub fn save_cache<W: Write>(
    w: &mut W,
    keys: &[StoredPipelineKey],
    raw_blob: Option<&[u8]>,
) -> bool {
    let write = |w: &mut W, bytes: &[u8]| w.write_all(bytes).is_ok();

    if !write(w, &[CACHE_VERSION]) {
        return false;
    }

    if let Some(blob) = raw_blob {
        if !write(w, &(blob.len() as u32).to_le_bytes()) || !write(w, blob) {
            return false;
        }
    }

    if !write(w, &(keys.len() as u32).to_le_bytes()) {
        return false;
    }
    for key in keys {
        let bytes = match bincode::serialize(key) {
            Ok(b) => b,
            Err(_) => return false,
        };
        if !write(w, &bytes) {
            return false;
        }
    }
    true
}

/// Read the cache back. Any mismatch or short read yields a clean
/// empty result; the raw blob is separately discarded when the device
/// check fails.
pub fn load_cache<R: Read>(
    r: &mut R,
    expect_raw_blob: bool,
    device_uuid: &[u8; vk::UUID_SIZE],
) -> (Vec<StoredPipelineKey>, Option<Vec<u8>>) {
    let empty = (Vec::new(), None);

    let mut version = [0u8; 1];
    if r.read_exact(&mut version).is_err() || version[0] != CACHE_VERSION {
        return empty;
    }

    let mut raw_blob = None;
    if expect_raw_blob {
        let mut len_bytes = [0u8; 4];
        if r.read_exact(&mut len_bytes).is_err() {
            return empty;
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > 0 {
            let mut blob = vec![0u8; len];
            if r.read_exact(&mut blob).is_err() {
                return empty;
            }
            if validate_raw_blob(&blob, device_uuid) {
                raw_blob = Some(blob);
            } else {
                log::debug!("pipeline cache: raw blob rejected (wrong device or header)");
            }
        }
    }

    let mut count_bytes = [0u8; 4];
    if r.read_exact(&mut count_bytes).is_err() {
        return empty;
    }
    let count = u32::from_le_bytes(count_bytes) as usize;

    let record_size = match bincode::serialized_size(&StoredPipelineKey::default()) {
        Ok(s) => s as usize,
        Err(_) => return empty,
    };

    let mut keys = Vec::with_capacity(count.min(4096));
    let mut buf = vec![0u8; record_size];
    for _ in 0..count {
        if r.read_exact(&mut buf).is_err() {
            log::error!("pipeline cache: truncated file, dropping remainder");
            return (Vec::new(), raw_blob);
        }
        match bincode::deserialize(&buf) {
            Ok(key) => keys.push(key),
            Err(_) => return (Vec::new(), raw_blob),
        }
    }

    (keys, raw_blob)
}
