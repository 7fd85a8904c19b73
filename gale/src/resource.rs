// Resource handles owned by the render queue
//
// Handles are created on the recording thread. Native object creation
// is free-threaded in vulkan, so it happens right away; everything
// that needs a command buffer or the staging path (pixel uploads,
// buffer data, initial layout transitions) is deferred to the render
// thread's init pass. A handle whose materialize failed keeps an
// empty native slot, and using it is a programmer error.
//
// Handles do not destroy themselves. Deletion goes through the frame
// deleter lists, which call destroy() with the device once the fence
// of the frame that last referenced the handle has cleared. During
// teardown the device's skip flag turns those calls into no-ops.

use ash::vk;

use crate::device::Device;
use crate::format::DataFormat;
use crate::pipeline::RenderPassType;
use crate::{GaleError, Result};
use utils::log;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Stable identity for every queue-owned resource. Step dependency
/// sets and the runner's layout map are keyed by these.
pub type ResourceId = u64;

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_resource_id() -> ResourceId {
    NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A single image belonging to a framebuffer attachment or texture.
pub struct ImageNative {
    pub image: vk::Image,
    pub view: vk::ImageView,
    /// View for sampling; differs from `view` for layered images and
    /// depth attachments (those sample depth-only).
    pub sample_view: vk::ImageView,
    /// One view per layer when the image is layered.
    pub layer_views: Vec<vk::ImageView>,
    pub memory: vk::DeviceMemory,
}

pub struct ImageRecord {
    pub format: vk::Format,
    pub aspect: vk::ImageAspectFlags,
    pub layers: u32,
    native: OnceLock<ImageNative>,
}

impl ImageRecord {
    fn new(format: vk::Format, aspect: vk::ImageAspectFlags, layers: u32) -> Self {
        Self {
            format,
            aspect,
            layers,
            native: OnceLock::new(),
        }
    }

    pub fn native(&self) -> &ImageNative {
        self.native
            .get()
            .expect("image used before the init pass materialized it")
    }

    pub fn try_native(&self) -> Option<&ImageNative> {
        self.native.get()
    }

    fn set_native(&self, native: ImageNative) {
        if self.native.set(native).is_err() {
            panic!("image materialized twice");
        }
    }

    fn destroy(&self, dev: &Device) {
        if let Some(n) = self.native.get() {
            unsafe {
                for v in n.layer_views.iter() {
                    dev.dev.destroy_image_view(*v, None);
                }
                if n.sample_view != n.view {
                    dev.dev.destroy_image_view(n.sample_view, None);
                }
                dev.dev.destroy_image_view(n.view, None);
                dev.dev.destroy_image(n.image, None);
                dev.dev.free_memory(n.memory, None);
            }
        }
    }
}

/// A render target. Color attachment plus optional depth/stencil,
/// with MSAA siblings when the sample count is above one. (With MSAA
/// the siblings are the rendering attachments and the base images the
/// resolve targets.)
pub struct Framebuffer {
    pub fb_id: ResourceId,
    pub fb_width: u32,
    pub fb_height: u32,
    pub fb_layers: u32,
    pub fb_samples: vk::SampleCountFlags,
    pub fb_tag: String,

    pub fb_color: ImageRecord,
    pub fb_depth: Option<ImageRecord>,
    pub fb_msaa_color: Option<ImageRecord>,
    pub fb_msaa_depth: Option<ImageRecord>,

    /// One native framebuffer per render-pass-type actually used.
    fb_framebufs: Mutex<HashMap<RenderPassType, vk::Framebuffer>>,
}

impl Framebuffer {
    pub fn new(
        width: u32,
        height: u32,
        layers: u32,
        samples: vk::SampleCountFlags,
        with_depth: bool,
        color_format: vk::Format,
        depth_format: vk::Format,
        tag: &str,
    ) -> Arc<Self> {
        debug_assert!(width > 0 && height > 0);
        let msaa = samples != vk::SampleCountFlags::TYPE_1;
        let depth_aspect = vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL;

        Arc::new(Self {
            fb_id: next_resource_id(),
            fb_width: width,
            fb_height: height,
            fb_layers: layers,
            fb_samples: samples,
            fb_tag: tag.to_string(),
            fb_color: ImageRecord::new(color_format, vk::ImageAspectFlags::COLOR, layers),
            fb_depth: if with_depth {
                Some(ImageRecord::new(depth_format, depth_aspect, layers))
            } else {
                None
            },
            fb_msaa_color: if msaa {
                Some(ImageRecord::new(color_format, vk::ImageAspectFlags::COLOR, layers))
            } else {
                None
            },
            fb_msaa_depth: if msaa && with_depth {
                Some(ImageRecord::new(depth_format, depth_aspect, layers))
            } else {
                None
            },
            fb_framebufs: Mutex::new(HashMap::new()),
        })
    }

    pub fn has_depth(&self) -> bool {
        self.fb_depth.is_some()
    }

    pub fn tag(&self) -> &str {
        &self.fb_tag
    }

    /// Create image backing for every attachment. Called once, right
    /// after construction.
    pub(crate) fn materialize(&self, dev: &Device) -> Result<()> {
        let color_usage = vk::ImageUsageFlags::COLOR_ATTACHMENT
            | vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST;
        let depth_usage = vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
            | vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST;

        self.materialize_record(dev, &self.fb_color, vk::SampleCountFlags::TYPE_1, color_usage)?;
        if let Some(depth) = &self.fb_depth {
            self.materialize_record(dev, depth, vk::SampleCountFlags::TYPE_1, depth_usage)?;
        }
        if let Some(msaa) = &self.fb_msaa_color {
            self.materialize_record(dev, msaa, self.fb_samples, color_usage)?;
        }
        if let Some(msaa) = &self.fb_msaa_depth {
            self.materialize_record(dev, msaa, self.fb_samples, depth_usage)?;
        }
        Ok(())
    }

    fn materialize_record(
        &self,
        dev: &Device,
        record: &ImageRecord,
        samples: vk::SampleCountFlags,
        usage: vk::ImageUsageFlags,
    ) -> Result<()> {
        let (image, memory) = dev.create_image(
            self.fb_width,
            self.fb_height,
            1,
            1,
            self.fb_layers,
            samples,
            record.format,
            usage,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        // Depth attachments sample through a depth-only view.
        let sample_aspect = if record.aspect.contains(vk::ImageAspectFlags::DEPTH) {
            vk::ImageAspectFlags::DEPTH
        } else {
            record.aspect
        };

        let layered = self.fb_layers > 1;
        let view = create_view(dev, image, record.format, record.aspect, 0, self.fb_layers, 0, 1, layered)?;
        let sample_view = if sample_aspect != record.aspect || layered {
            create_view(dev, image, record.format, sample_aspect, 0, self.fb_layers, 0, 1, layered)?
        } else {
            view
        };

        let mut layer_views = Vec::new();
        if layered {
            for layer in 0..self.fb_layers {
                layer_views.push(create_view(
                    dev,
                    image,
                    record.format,
                    sample_aspect,
                    layer,
                    1,
                    0,
                    1,
                    false,
                )?);
            }
        }

        record.set_native(ImageNative {
            image,
            view,
            sample_view,
            layer_views,
            memory,
        });
        Ok(())
    }

    /// Fetch or create the native framebuffer for a render-pass-type.
    pub(crate) fn framebuf_for(
        &self,
        dev: &Device,
        render_pass: vk::RenderPass,
        rp_type: RenderPassType,
    ) -> Result<vk::Framebuffer> {
        let mut map = self.fb_framebufs.lock().unwrap();
        if let Some(fb) = map.get(&rp_type) {
            return Ok(*fb);
        }

        // Attachment order must match the render pass: with MSAA the
        // multisampled images come first and the base images act as
        // resolve targets.
        let mut attachments = Vec::new();
        let has_depth = rp_type.contains(RenderPassType::HAS_DEPTH);
        match &self.fb_msaa_color {
            Some(msaa) => {
                attachments.push(msaa.native().view);
                if has_depth {
                    attachments.push(self.fb_msaa_depth.as_ref().unwrap().native().view);
                }
                attachments.push(self.fb_color.native().view);
                if has_depth {
                    attachments.push(self.fb_depth.as_ref().unwrap().native().view);
                }
            }
            None => {
                attachments.push(self.fb_color.native().view);
                if has_depth {
                    attachments.push(self.fb_depth.as_ref().unwrap().native().view);
                }
            }
        }

        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(attachments.as_slice())
            .width(self.fb_width)
            .height(self.fb_height)
            .layers(1);

        let fb = unsafe {
            dev.dev
                .create_framebuffer(&info, None)
                .or(Err(GaleError::COULD_NOT_CREATE_IMAGE))?
        };
        map.insert(rp_type, fb);
        Ok(fb)
    }

    pub(crate) fn destroy(&self, dev: &Device) {
        if dev.skip_destroys() {
            return;
        }
        for (_, fb) in self.fb_framebufs.lock().unwrap().drain() {
            unsafe { dev.dev.destroy_framebuffer(fb, None) };
        }
        self.fb_color.destroy(dev);
        if let Some(d) = &self.fb_depth {
            d.destroy(dev);
        }
        if let Some(m) = &self.fb_msaa_color {
            m.destroy(dev);
        }
        if let Some(m) = &self.fb_msaa_depth {
            m.destroy(dev);
        }
    }
}

fn create_view(
    dev: &Device,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    base_layer: u32,
    layer_count: u32,
    base_mip: u32,
    mip_count: u32,
    array: bool,
) -> Result<vk::ImageView> {
    let info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .format(format)
        .view_type(if array {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        })
        .subresource_range(
            vk::ImageSubresourceRange::builder()
                .aspect_mask(aspect)
                .base_array_layer(base_layer)
                .layer_count(layer_count)
                .base_mip_level(base_mip)
                .level_count(mip_count)
                .build(),
        );

    unsafe {
        dev.dev
            .create_image_view(&info, None)
            .or(Err(GaleError::COULD_NOT_CREATE_IMAGE))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BufferUsage {
    Vertex,
    Index,
    Uniform,
    Storage,
}

impl BufferUsage {
    pub(crate) fn vk_flags(&self) -> vk::BufferUsageFlags {
        match self {
            BufferUsage::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            BufferUsage::Index => vk::BufferUsageFlags::INDEX_BUFFER,
            BufferUsage::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            BufferUsage::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
        }
    }
}

pub struct BufferNative {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
}

/// A long-lived GPU buffer (as opposed to per-frame push data).
pub struct Buffer {
    pub b_id: ResourceId,
    pub b_size: usize,
    pub b_usage: BufferUsage,
    /// Dynamic buffers get host-visible memory so subdata is a map.
    pub b_dynamic: bool,
    native: OnceLock<BufferNative>,
}

impl Buffer {
    pub fn new(size: usize, usage: BufferUsage, dynamic: bool) -> Arc<Self> {
        debug_assert!(size > 0);
        Arc::new(Self {
            b_id: next_resource_id(),
            b_size: size,
            b_usage: usage,
            b_dynamic: dynamic,
            native: OnceLock::new(),
        })
    }

    pub fn native(&self) -> &BufferNative {
        self.native
            .get()
            .expect("buffer used before the init pass materialized it")
    }

    pub(crate) fn materialize(&self, dev: &Device) -> Result<()> {
        // Host visibility keeps the subdata path a simple map; static
        // buffers still prefer device local when a type offers both.
        let flags = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let (buffer, memory, _) = dev.create_buffer_with_size(
            self.b_usage.vk_flags() | vk::BufferUsageFlags::TRANSFER_DST,
            flags,
            self.b_size as u64,
        )?;
        if self.native.set(BufferNative { buffer, memory }).is_err() {
            panic!("buffer materialized twice");
        }
        Ok(())
    }

    /// Host-side update, executed on the render thread as an init
    /// step.
    pub(crate) fn update(&self, dev: &Device, offset: u64, data: &[u8]) -> Result<()> {
        debug_assert!(offset as usize + data.len() <= self.b_size);
        dev.update_memory(self.native().memory, offset, data)
    }

    pub(crate) fn destroy(&self, dev: &Device) {
        if dev.skip_destroys() {
            return;
        }
        if let Some(n) = self.native.get() {
            unsafe {
                dev.dev.destroy_buffer(n.buffer, None);
                dev.dev.free_memory(n.memory, None);
            }
        }
    }
}

/// Texture wrap/filter/LOD description. Samplers are created from
/// these and cached by value.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SamplerDesc {
    pub clamp_u: bool,
    pub clamp_v: bool,
    pub clamp_w: bool,
    pub mag_linear: bool,
    pub min_linear: bool,
    pub mip_linear: bool,
    pub max_anisotropy: f32,
    pub lod_bias: f32,
    pub min_lod: f32,
    pub max_lod: f32,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            clamp_u: true,
            clamp_v: true,
            clamp_w: true,
            mag_linear: true,
            min_linear: true,
            mip_linear: false,
            max_anisotropy: 0.0,
            lod_bias: 0.0,
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
        }
    }
}

pub struct SamplerState {
    pub s_id: ResourceId,
    pub s_desc: SamplerDesc,
    pub s_sampler: vk::Sampler,
}

impl SamplerState {
    /// Samplers are small and thread-safe to create, so unlike the
    /// other handles they materialize immediately.
    pub fn new(dev: &Device, desc: SamplerDesc) -> Arc<Self> {
        let address = |clamp| {
            if clamp {
                vk::SamplerAddressMode::CLAMP_TO_EDGE
            } else {
                vk::SamplerAddressMode::REPEAT
            }
        };
        let filter = |linear| {
            if linear {
                vk::Filter::LINEAR
            } else {
                vk::Filter::NEAREST
            }
        };

        let aniso = desc.max_anisotropy > 1.0 && dev.d_caps.anisotropy_supported;
        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(filter(desc.mag_linear))
            .min_filter(filter(desc.min_linear))
            .mipmap_mode(if desc.mip_linear {
                vk::SamplerMipmapMode::LINEAR
            } else {
                vk::SamplerMipmapMode::NEAREST
            })
            .address_mode_u(address(desc.clamp_u))
            .address_mode_v(address(desc.clamp_v))
            .address_mode_w(address(desc.clamp_w))
            .anisotropy_enable(aniso)
            .max_anisotropy(if aniso { desc.max_anisotropy } else { 1.0 })
            .mip_lod_bias(desc.lod_bias)
            .min_lod(desc.min_lod)
            .max_lod(desc.max_lod)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS);

        let sampler = unsafe { dev.dev.create_sampler(&info, None).unwrap() };

        Arc::new(Self {
            s_id: next_resource_id(),
            s_desc: desc,
            s_sampler: sampler,
        })
    }

    pub(crate) fn destroy(&self, dev: &Device) {
        if dev.skip_destroys() {
            return;
        }
        unsafe { dev.dev.destroy_sampler(self.s_sampler, None) };
    }
}

pub struct TextureNative {
    pub image: vk::Image,
    pub view: vk::ImageView,
    /// One view per mip for partial updates and readbacks.
    pub mip_views: Vec<vk::ImageView>,
    pub memory: vk::DeviceMemory,
}

pub struct Texture {
    pub t_id: ResourceId,
    pub t_width: u32,
    pub t_height: u32,
    pub t_depth: u32,
    pub t_mip_levels: u32,
    pub t_format: DataFormat,
    /// NPOT textures can only wrap when the device fully supports it.
    pub t_can_wrap: bool,
    pub t_tag: String,
    native: OnceLock<TextureNative>,
}

impl Texture {
    pub fn new(
        caps_npot: bool,
        width: u32,
        height: u32,
        depth: u32,
        mip_levels: u32,
        format: DataFormat,
        tag: &str,
    ) -> Arc<Self> {
        debug_assert!(width > 0 && height > 0 && depth > 0 && mip_levels > 0);
        let npot = !width.is_power_of_two() || !height.is_power_of_two();
        let can_wrap = !npot || caps_npot;

        Arc::new(Self {
            t_id: next_resource_id(),
            t_width: width,
            t_height: height,
            t_depth: depth,
            t_mip_levels: mip_levels,
            t_format: format,
            t_can_wrap: can_wrap,
            t_tag: tag.to_string(),
            native: OnceLock::new(),
        })
    }

    pub fn native(&self) -> &TextureNative {
        self.native
            .get()
            .expect("texture used before the init pass materialized it")
    }

    pub fn try_native(&self) -> Option<&TextureNative> {
        self.native.get()
    }

    pub(crate) fn materialize(&self, dev: &Device) -> Result<()> {
        let format = Device::vk_format(self.t_format);
        if format == vk::Format::UNDEFINED {
            dev.report_error("texture", &format!("{}: unsupported format", self.t_tag));
            return Err(GaleError::INVALID_FORMAT);
        }

        let (image, memory) = dev.create_image(
            self.t_width,
            self.t_height,
            self.t_depth,
            self.t_mip_levels,
            1,
            vk::SampleCountFlags::TYPE_1,
            format,
            vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        let make_view = |base_mip: u32, mips: u32| -> Result<vk::ImageView> {
            let info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .format(format)
                .view_type(if self.t_depth > 1 {
                    vk::ImageViewType::TYPE_3D
                } else {
                    vk::ImageViewType::TYPE_2D
                })
                .subresource_range(
                    vk::ImageSubresourceRange::builder()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_mip_level(base_mip)
                        .level_count(mips)
                        .layer_count(1)
                        .build(),
                );
            unsafe {
                dev.dev
                    .create_image_view(&info, None)
                    .or(Err(GaleError::COULD_NOT_CREATE_IMAGE))
            }
        };

        let view = make_view(0, self.t_mip_levels)?;
        let mut mip_views = Vec::new();
        if self.t_mip_levels > 1 {
            for mip in 0..self.t_mip_levels {
                mip_views.push(make_view(mip, 1)?);
            }
        }

        if self
            .native
            .set(TextureNative {
                image,
                view,
                mip_views,
                memory,
            })
            .is_err()
        {
            panic!("texture materialized twice");
        }
        Ok(())
    }

    pub(crate) fn destroy(&self, dev: &Device) {
        if dev.skip_destroys() {
            return;
        }
        if let Some(n) = self.native.get() {
            unsafe {
                for v in n.mip_views.iter() {
                    dev.dev.destroy_image_view(*v, None);
                }
                dev.dev.destroy_image_view(n.view, None);
                dev.dev.destroy_image(n.image, None);
                dev.dev.free_memory(n.memory, None);
            }
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Geometry,
    Compute,
}

impl ShaderStage {
    pub(crate) fn vk_flags(&self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Geometry => vk::ShaderStageFlags::GEOMETRY,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

/// A shader module. Source is kept so link failures can log both
/// sides of the program.
pub struct ShaderModule {
    pub sm_id: ResourceId,
    pub sm_stage: ShaderStage,
    pub sm_spirv: Vec<u32>,
    pub sm_source: String,
    pub sm_tag: String,
    sm_failed: AtomicBool,
    native: OnceLock<vk::ShaderModule>,
}

impl ShaderModule {
    pub fn new(stage: ShaderStage, spirv: Vec<u32>, source: String, tag: &str) -> Arc<Self> {
        Arc::new(Self {
            sm_id: next_resource_id(),
            sm_stage: stage,
            sm_spirv: spirv,
            sm_source: source,
            sm_tag: tag.to_string(),
            sm_failed: AtomicBool::new(false),
            native: OnceLock::new(),
        })
    }

    pub fn failed(&self) -> bool {
        self.sm_failed.load(Ordering::Acquire)
    }

    /// None on compile failure; draws using this module get dropped.
    pub fn native(&self) -> Option<vk::ShaderModule> {
        self.native.get().copied().filter(|_| !self.failed())
    }

    pub(crate) fn materialize(&self, dev: &Device) {
        let info = vk::ShaderModuleCreateInfo::builder().code(self.sm_spirv.as_slice());
        match unsafe { dev.dev.create_shader_module(&info, None) } {
            Ok(module) => {
                if self.native.set(module).is_err() {
                    panic!("shader materialized twice");
                }
            }
            Err(e) => {
                self.sm_failed.store(true, Ordering::Release);
                dev.report_error(
                    "shader",
                    &format!(
                        "{}: module creation failed ({:?})\n{}",
                        self.sm_tag, e, self.sm_source
                    ),
                );
                log::error!("shader module {} failed", self.sm_tag);
            }
        }
    }

    pub(crate) fn destroy(&self, dev: &Device) {
        if dev.skip_destroys() {
            return;
        }
        if let Some(m) = self.native.get() {
            unsafe { dev.dev.destroy_shader_module(*m, None) };
        }
    }
}

/// One vertex attribute: shader location, format and byte offset.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: DataFormat,
    pub offset: u32,
}

/// Describes how a vertex buffer is laid out. Pure data; it gets
/// baked into pipelines at compile time.
pub struct InputLayout {
    pub il_id: ResourceId,
    pub il_attributes: Vec<VertexAttribute>,
    pub il_stride: u32,
    /// Bit per location used, accumulated at creation.
    pub il_attr_mask: u32,
}

impl InputLayout {
    pub fn new(attributes: Vec<VertexAttribute>, stride: u32) -> Arc<Self> {
        let mut mask = 0u32;
        for a in attributes.iter() {
            mask |= 1 << a.location;
        }
        Arc::new(Self {
            il_id: next_resource_id(),
            il_attributes: attributes,
            il_stride: stride,
            il_attr_mask: mask,
        })
    }
}
