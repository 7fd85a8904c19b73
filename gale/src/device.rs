// Vulkan device representation
//
// This stores per-GPU state: the logical device, the capability
// record built by the probe, and helpers for allocating buffers,
// images and command pools. Everything above this layer goes through
// these helpers instead of calling the allocator directly.

use ash::extensions::khr;
use ash::vk;

use crate::caps::{vulkan_bug_pass, DeviceCaps, GpuVendor};
use crate::format::DataFormat;
use crate::instance::Instance;
use crate::{ErrorCallback, GaleError, Result};
use utils::log;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Gale Device
///
/// This holds all of the Vulkan logic for one GPU. It is shared by
/// the recording thread, the render thread and the pipeline compiler,
/// so everything on it is either immutable after creation or
/// internally synchronized.
pub struct Device {
    pub(crate) inst: Arc<Instance>,
    /// the logical device we are using
    pub(crate) dev: ash::Device,
    /// the physical device selected at startup
    pub(crate) pdev: vk::PhysicalDevice,
    pub(crate) mem_props: vk::PhysicalDeviceMemoryProperties,
    /// What this device supports, plus the driver bug mask
    pub d_caps: DeviceCaps,

    pub(crate) graphics_queue_family: u32,
    pub(crate) graphics_queue: vk::Queue,

    d_limits: vk::PhysicalDeviceLimits,
    d_pipeline_cache_uuid: [u8; vk::UUID_SIZE],
    /// Timestamp query support of the graphics queue family.
    d_timestamp_valid_bits: u32,

    /// Set during teardown. Resource destructors check this and skip
    /// their driver calls once the device is going away.
    d_skip_destroys: AtomicBool,
    /// Sticky out-of-memory flag, observable by the caller so it can
    /// downgrade texture resolution.
    d_saw_out_of_memory: AtomicBool,

    pub(crate) d_error_callback: Option<ErrorCallback>,
}

impl Device {
    /// Choose a vkPhysicalDevice.
    ///
    /// For now we just take the first one; a config hook can replace
    /// this later.
    fn select_pdev(inst: &ash::Instance) -> vk::PhysicalDevice {
        let pdevices = unsafe {
            inst.enumerate_physical_devices()
                .expect("Physical device error")
        };

        *pdevices.iter().nth(0).expect("Couldn't find suitable device.")
    }

    /// Choose a queue family supporting `flags`.
    ///
    /// Returns an index into the array of queue families.
    fn select_queue_family(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        flags: vk::QueueFlags,
    ) -> u32 {
        unsafe { inst.get_physical_device_queue_family_properties(pdev) }
            .iter()
            .enumerate()
            .filter_map(|(index, info)| match info.queue_flags.contains(flags) {
                true => Some(index as u32),
                false => None,
            })
            .nth(0)
            .expect("Could not find a suitable queue family")
    }

    /// Build the capability record for a physical device.
    ///
    /// Invoked once; the result is immutable. The bug mask rules live
    /// in caps.rs so they can be unit tested against fixed ids.
    fn probe_caps(inst: &ash::Instance, pdev: vk::PhysicalDevice) -> DeviceCaps {
        let props = unsafe { inst.get_physical_device_properties(pdev) };
        let features = unsafe { inst.get_physical_device_features(pdev) };

        let vendor = GpuVendor::from_vulkan_id(props.vendor_id);
        let model = unsafe {
            std::ffi::CStr::from_ptr(props.device_name.as_ptr())
                .to_string_lossy()
                .into_owned()
        };

        let mut caps = DeviceCaps::default();
        caps.vendor = vendor;
        caps.model = model;
        caps.api_version = (
            vk::api_version_major(props.api_version),
            vk::api_version_minor(props.api_version),
            vk::api_version_patch(props.api_version),
        );
        caps.device_id = props.device_id;
        caps.driver_version = props.driver_version;

        caps.anisotropy_supported = features.sampler_anisotropy != 0;
        caps.dual_source_blend = features.dual_src_blend != 0;
        caps.depth_clamp_supported = features.depth_clamp != 0;
        caps.clip_distance_supported = features.shader_clip_distance != 0;
        caps.cull_distance_supported = features.shader_cull_distance != 0;
        caps.logic_op_supported = features.logic_op != 0;
        caps.texture_3d_supported = true;
        caps.texture_npot_fully_supported = true;
        caps.fragment_shader_depth_write_supported = true;
        caps.framebuffer_blit_supported = true;
        caps.framebuffer_copy_supported = true;
        caps.framebuffer_depth_copy_supported = true;
        caps.multiview_supported = features.multi_viewport != 0;

        caps.supports_bc123 = features.texture_compression_bc != 0;
        caps.supports_bc45 = features.texture_compression_bc != 0;
        caps.supports_bc7 = features.texture_compression_bc != 0;
        caps.supports_etc2 = features.texture_compression_etc2 != 0;
        caps.supports_astc = features.texture_compression_astc_ldr != 0;

        caps.multisample_levels = props.limits.framebuffer_color_sample_counts.as_raw();
        caps.preferred_depth_format = DataFormat::D24S8;

        caps.bugs = vulkan_bug_pass(vendor, props.device_id, props.driver_version);

        log::info!(
            "Vulkan device: {} (vendor {:?}, driver {:#x}), bugs {:?}",
            caps.model,
            caps.vendor,
            caps.driver_version,
            caps.bugs
        );

        caps
    }

    /// Create a vkDevice from a vkPhysicalDevice
    ///
    /// The features we enable are the subset the probe found; the
    /// swapchain extension is the only one we require.
    fn create_device(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        caps: &DeviceCaps,
        queues: &[u32],
    ) -> ash::Device {
        let dev_extension_names = vec![khr::Swapchain::name().as_ptr()];

        let features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(caps.anisotropy_supported)
            .dual_src_blend(caps.dual_source_blend)
            .depth_clamp(caps.depth_clamp_supported)
            .shader_clip_distance(caps.clip_distance_supported)
            .shader_cull_distance(caps.cull_distance_supported)
            .logic_op(caps.logic_op_supported)
            .build();

        // for now we only have one graphics queue, so one priority
        let priorities = [1.0];
        let mut queue_infos = Vec::new();
        for i in queues {
            queue_infos.push(
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(*i)
                    .queue_priorities(&priorities)
                    .build(),
            );
        }

        let dev_create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(queue_infos.as_ref())
            .enabled_extension_names(dev_extension_names.as_slice())
            .enabled_features(&features)
            .build();

        unsafe { inst.create_device(pdev, &dev_create_info, None).unwrap() }
    }

    /// Create a new default Device for the first physical device.
    pub fn new(instance: Arc<Instance>, error_callback: Option<ErrorCallback>) -> Result<Self> {
        let pdev = Self::select_pdev(&instance.inst);
        let graphics_queue_family =
            Self::select_queue_family(&instance.inst, pdev, vk::QueueFlags::GRAPHICS);
        let mem_props = unsafe { instance.inst.get_physical_device_memory_properties(pdev) };

        let caps = Self::probe_caps(&instance.inst, pdev);
        let props = unsafe { instance.inst.get_physical_device_properties(pdev) };
        let queue_props =
            unsafe { instance.inst.get_physical_device_queue_family_properties(pdev) };
        let timestamp_valid_bits =
            queue_props[graphics_queue_family as usize].timestamp_valid_bits;

        let dev = Self::create_device(&instance.inst, pdev, &caps, &[graphics_queue_family]);
        let graphics_queue = unsafe { dev.get_device_queue(graphics_queue_family, 0) };

        Ok(Self {
            inst: instance,
            dev,
            pdev,
            mem_props,
            d_caps: caps,
            graphics_queue_family,
            graphics_queue,
            d_limits: props.limits,
            d_pipeline_cache_uuid: props.pipeline_cache_uuid,
            d_timestamp_valid_bits: timestamp_valid_bits,
            d_skip_destroys: AtomicBool::new(false),
            d_saw_out_of_memory: AtomicBool::new(false),
            d_error_callback: error_callback,
        })
    }

    /// (valid bits, nanoseconds per tick) for timestamp queries on
    /// the graphics queue.
    pub(crate) fn timestamp_info(&self) -> (u32, f32) {
        (self.d_timestamp_valid_bits, self.d_limits.timestamp_period)
    }

    pub(crate) fn min_uniform_offset_align(&self) -> u64 {
        self.d_limits.min_uniform_buffer_offset_alignment
    }

    pub(crate) fn pipeline_cache_uuid(&self) -> [u8; vk::UUID_SIZE] {
        self.d_pipeline_cache_uuid
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.d_caps
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.inst
    }

    /// Teardown mode: destructors of queued resources become no-ops.
    pub fn set_skip_destroys(&self) {
        self.d_skip_destroys.store(true, Ordering::Release);
    }

    pub fn skip_destroys(&self) -> bool {
        self.d_skip_destroys.load(Ordering::Acquire)
    }

    pub(crate) fn note_out_of_memory(&self) {
        self.d_saw_out_of_memory.store(true, Ordering::Release);
    }

    /// Poll-and-clear the sticky out-of-memory flag.
    pub fn take_out_of_memory(&self) -> bool {
        self.d_saw_out_of_memory.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn report_error(&self, stage: &str, detail: &str) {
        log::error!("{}: {}", stage, detail);
        if let Some(cb) = &self.d_error_callback {
            cb(stage, detail);
        }
    }

    /// returns a new vkCommandPool for `queue_family`
    pub(crate) fn create_command_pool(&self, queue_family: u32) -> vk::CommandPool {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);

        unsafe {
            self.dev
                .create_command_pool(&pool_create_info, None)
                .unwrap()
        }
    }

    /// Allocate a vec of vkCommandBuffers from `pool`.
    ///
    /// Command buffer is shortened to `cbuf` in many areas of the
    /// code.
    pub(crate) fn create_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Vec<vk::CommandBuffer> {
        let cbuf_allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_buffer_count(count)
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY);

        unsafe {
            self.dev
                .allocate_command_buffers(&cbuf_allocate_info)
                .unwrap()
        }
    }

    /// Returns an index into the array of memory types for the memory
    /// properties
    ///
    /// Memory types specify the location and accessibility of memory.
    /// Device local memory is resident on the GPU, while host visible
    /// memory can be read from the system side.
    pub(crate) fn find_memory_type_index(
        &self,
        reqs: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        for (i, mem_type) in self.mem_props.memory_types.iter().enumerate() {
            // Bit i of memory_type_bits is set if the resource
            // supports the ith memory type in mem_props.
            if (reqs.memory_type_bits >> i) & 1 == 1 && mem_type.property_flags.contains(flags) {
                return Some(i as u32);
            }
        }
        None
    }

    /// Whether the memory type index refers to host-coherent memory.
    /// Readbacks use this to decide if they need an invalidate.
    pub(crate) fn memory_type_is_coherent(&self, index: u32) -> bool {
        self.mem_props.memory_types[index as usize]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    /// Allocates a buffer/memory pair of size `size`.
    ///
    /// Does not fill the buffer with anything. Also returns the
    /// memory type index used so the caller can check coherency.
    pub(crate) fn create_buffer_with_size(
        &self,
        usage: vk::BufferUsageFlags,
        flags: vk::MemoryPropertyFlags,
        size: u64,
    ) -> Result<(vk::Buffer, vk::DeviceMemory, u32)> {
        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();

        unsafe {
            let buffer = self
                .dev
                .create_buffer(&create_info, None)
                .or(Err(GaleError::COULD_NOT_CREATE_BUFFER))?;
            let req = self.dev.get_buffer_memory_requirements(buffer);
            let index = match self.find_memory_type_index(&req, flags) {
                Some(i) => i,
                None => {
                    self.dev.destroy_buffer(buffer, None);
                    return Err(GaleError::OUT_OF_MEMORY);
                }
            };

            let alloc_info = vk::MemoryAllocateInfo {
                allocation_size: req.size,
                memory_type_index: index,
                ..Default::default()
            };

            let memory = match self.dev.allocate_memory(&alloc_info, None) {
                Ok(m) => m,
                Err(_) => {
                    self.dev.destroy_buffer(buffer, None);
                    self.note_out_of_memory();
                    return Err(GaleError::OUT_OF_MEMORY);
                }
            };
            self.dev
                .bind_buffer_memory(buffer, memory, 0)
                .or(Err(GaleError::COULD_NOT_CREATE_BUFFER))?;

            Ok((buffer, memory, index))
        }
    }

    /// Writes `data` to `memory` at `offset`.
    ///
    /// Memory needs to be host visible and coherent. This does not
    /// flush after writing.
    pub(crate) fn update_memory<T: Copy>(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        data: &[T],
    ) -> Result<()> {
        if data.len() == 0 {
            return Ok(());
        }

        let data_size = std::mem::size_of_val(data) as u64;
        unsafe {
            let ptr = self
                .dev
                .map_memory(memory, offset, data_size, vk::MemoryMapFlags::empty())
                .or(Err(GaleError::OUT_OF_MEMORY))?;

            // rust doesn't have a raw memcpy, so we need to transform
            // the void ptr to a slice
            let dst = std::slice::from_raw_parts_mut(ptr as *mut T, data.len());
            dst.copy_from_slice(data);

            self.dev.unmap_memory(memory);
        }
        Ok(())
    }

    /// Create a vkImage and the memory backing it.
    ///
    /// Images are accessed through image views; those are created by
    /// the resource layer since framebuffers and textures want
    /// different view shapes.
    pub(crate) fn create_image(
        &self,
        width: u32,
        height: u32,
        depth: u32,
        mip_levels: u32,
        array_layers: u32,
        samples: vk::SampleCountFlags,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<(vk::Image, vk::DeviceMemory)> {
        let create_info = vk::ImageCreateInfo::builder()
            .image_type(if depth > 1 {
                vk::ImageType::TYPE_3D
            } else {
                vk::ImageType::TYPE_2D
            })
            .format(format)
            .extent(vk::Extent3D {
                width,
                height,
                depth,
            })
            .mip_levels(mip_levels)
            .array_layers(array_layers)
            .samples(samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        unsafe {
            let image = self
                .dev
                .create_image(&create_info, None)
                .or(Err(GaleError::COULD_NOT_CREATE_IMAGE))?;

            let mem_reqs = self.dev.get_image_memory_requirements(image);
            let memtype_index = match self.find_memory_type_index(&mem_reqs, flags) {
                Some(i) => i,
                None => {
                    self.dev.destroy_image(image, None);
                    return Err(GaleError::OUT_OF_MEMORY);
                }
            };

            let alloc_info = vk::MemoryAllocateInfo::builder()
                .allocation_size(mem_reqs.size)
                .memory_type_index(memtype_index);

            let image_memory = match self.dev.allocate_memory(&alloc_info, None) {
                Ok(m) => m,
                Err(_) => {
                    self.dev.destroy_image(image, None);
                    self.note_out_of_memory();
                    return Err(GaleError::OUT_OF_MEMORY);
                }
            };
            self.dev
                .bind_image_memory(image, image_memory, 0)
                .or(Err(GaleError::COULD_NOT_CREATE_IMAGE))?;

            Ok((image, image_memory))
        }
    }

    /// Map DataFormat onto the vulkan format we use for it.
    pub(crate) fn vk_format(format: DataFormat) -> vk::Format {
        match format {
            DataFormat::R8Unorm => vk::Format::R8_UNORM,
            DataFormat::R8G8Unorm => vk::Format::R8G8_UNORM,
            DataFormat::R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
            DataFormat::R8G8B8A8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
            DataFormat::B8G8R8A8Unorm => vk::Format::B8G8R8A8_UNORM,
            DataFormat::B8G8R8A8UnormSrgb => vk::Format::B8G8R8A8_SRGB,
            DataFormat::R4G4B4A4UnormPack16 => vk::Format::R4G4B4A4_UNORM_PACK16,
            DataFormat::B4G4R4A4UnormPack16 => vk::Format::B4G4R4A4_UNORM_PACK16,
            DataFormat::R5G6B5UnormPack16 => vk::Format::R5G6B5_UNORM_PACK16,
            DataFormat::B5G6R5UnormPack16 => vk::Format::B5G6R5_UNORM_PACK16,
            DataFormat::R5G5B5A1UnormPack16 => vk::Format::R5G5B5A1_UNORM_PACK16,
            DataFormat::A1R5G5B5UnormPack16 => vk::Format::A1R5G5B5_UNORM_PACK16,
            DataFormat::R16Unorm => vk::Format::R16_UNORM,
            DataFormat::R16Float => vk::Format::R16_SFLOAT,
            DataFormat::R16G16Float => vk::Format::R16G16_SFLOAT,
            DataFormat::R16G16B16A16Float => vk::Format::R16G16B16A16_SFLOAT,
            DataFormat::R32Float => vk::Format::R32_SFLOAT,
            DataFormat::Bc1RgbaUnormBlock => vk::Format::BC1_RGBA_UNORM_BLOCK,
            DataFormat::Bc2UnormBlock => vk::Format::BC2_UNORM_BLOCK,
            DataFormat::Bc3UnormBlock => vk::Format::BC3_UNORM_BLOCK,
            DataFormat::Bc4UnormBlock => vk::Format::BC4_UNORM_BLOCK,
            DataFormat::Bc5UnormBlock => vk::Format::BC5_UNORM_BLOCK,
            DataFormat::Bc7UnormBlock => vk::Format::BC7_UNORM_BLOCK,
            DataFormat::Etc2R8G8B8UnormBlock => vk::Format::ETC2_R8G8B8_UNORM_BLOCK,
            DataFormat::Etc2R8G8B8A1UnormBlock => vk::Format::ETC2_R8G8B8A1_UNORM_BLOCK,
            DataFormat::Etc2R8G8B8A8UnormBlock => vk::Format::ETC2_R8G8B8A8_UNORM_BLOCK,
            DataFormat::Astc4x4UnormBlock => vk::Format::ASTC_4X4_UNORM_BLOCK,
            DataFormat::S8 => vk::Format::S8_UINT,
            DataFormat::D16 => vk::Format::D16_UNORM,
            DataFormat::D16S8 => vk::Format::D16_UNORM_S8_UINT,
            DataFormat::D24S8 => vk::Format::D24_UNORM_S8_UINT,
            DataFormat::D32F => vk::Format::D32_SFLOAT,
            DataFormat::D32FS8 => vk::Format::D32_SFLOAT_S8_UINT,
            _ => vk::Format::UNDEFINED,
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            // first wait for the device to finish working
            self.dev.device_wait_idle().unwrap();
            self.dev.destroy_device(None);
        }
    }
}
