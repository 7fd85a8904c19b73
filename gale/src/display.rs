// Swapchain display
//
// Owns the VkSurfaceKHR handed in by the windowing glue, the
// swapchain built on it, and the backbuffer framebuffers the queue
// runner renders into. Recreation on OUT_OF_DATE happens at frame
// boundaries, driven by the render queue.

use ash::extensions::khr;
use ash::vk;

use crate::device::Device;
use crate::{GaleError, Result};
use utils::log;

use std::sync::Arc;

pub struct Display {
    d_dev: Arc<Device>,
    /// loads surface extension fns
    d_surface_loader: khr::Surface,
    /// the actual surface (KHR extension)
    pub d_surface: vk::SurfaceKHR,
    /// loads swapchain extension fns
    d_swapchain_loader: khr::Swapchain,
    /// the actual swapchain
    pub d_swapchain: vk::SwapchainKHR,
    /// Cache the present mode here so we don't re-request it
    pub d_present_mode: vk::PresentModeKHR,

    pub d_surface_caps: vk::SurfaceCapabilitiesKHR,
    pub d_surface_format: vk::SurfaceFormatKHR,
    pub d_resolution: vk::Extent2D,

    /// a set of images belonging to the swapchain
    pub d_images: Vec<vk::Image>,
    /// views describing how to access the images
    pub d_views: Vec<vk::ImageView>,
    /// one framebuffer per swapchain image, bound to the backbuffer
    /// render pass
    pub d_framebuffers: Vec<vk::Framebuffer>,

    /// Shared depth buffer for backbuffer rendering.
    d_depth_image: vk::Image,
    d_depth_view: vk::ImageView,
    d_depth_mem: vk::DeviceMemory,
    pub d_depth_format: vk::Format,
}

impl Display {
    /// Wrap a surface the platform glue created for us.
    pub fn new(dev: Arc<Device>, surface: vk::SurfaceKHR, vsync: bool) -> Result<Self> {
        let surface_loader = khr::Surface::new(&dev.inst.loader, &dev.inst.inst);
        let swapchain_loader = khr::Swapchain::new(&dev.inst.inst, &dev.dev);

        // Make sure the graphics queue family can present here.
        let supported = unsafe {
            surface_loader
                .get_physical_device_surface_support(dev.pdev, dev.graphics_queue_family, surface)
                .or(Err(GaleError::VK_SURF_NOT_SUPPORTED))?
        };
        if !supported {
            return Err(GaleError::VK_SURF_NOT_SUPPORTED);
        }

        let present_modes = unsafe {
            surface_loader
                .get_physical_device_surface_present_modes(dev.pdev, surface)
                .or(Err(GaleError::VK_SURF_NOT_SUPPORTED))?
        };
        // FIFO is always available and what vsync means; otherwise
        // prefer MAILBOX for lowest latency without tearing.
        let mode = if vsync {
            vk::PresentModeKHR::FIFO
        } else {
            present_modes
                .iter()
                .cloned()
                .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
                .unwrap_or(vk::PresentModeKHR::FIFO)
        };

        let mut ret = Self {
            d_dev: dev,
            d_surface_loader: surface_loader,
            d_surface: surface,
            d_swapchain_loader: swapchain_loader,
            d_swapchain: vk::SwapchainKHR::null(),
            d_present_mode: mode,
            d_surface_caps: Default::default(),
            d_surface_format: Default::default(),
            d_resolution: Default::default(),
            d_images: Vec::new(),
            d_views: Vec::new(),
            d_framebuffers: Vec::new(),
            d_depth_image: vk::Image::null(),
            d_depth_view: vk::ImageView::null(),
            d_depth_mem: vk::DeviceMemory::null(),
            d_depth_format: vk::Format::D24_UNORM_S8_UINT,
        };

        ret.refresh_surface_info()?;
        Ok(ret)
    }

    fn refresh_surface_info(&mut self) -> Result<()> {
        self.d_surface_caps = unsafe {
            self.d_surface_loader
                .get_physical_device_surface_capabilities(self.d_dev.pdev, self.d_surface)
                .or(Err(GaleError::VK_SURF_NOT_SUPPORTED))?
        };
        self.d_surface_format = self.select_surface_format()?;
        self.d_resolution = self.d_surface_caps.current_extent;
        Ok(())
    }

    /// choose a vkSurfaceFormatKHR for the vkSurfaceKHR
    ///
    /// We force a UNORM format since all our color math assumes
    /// non-sRGB behavior in the shader.
    fn select_surface_format(&self) -> Result<vk::SurfaceFormatKHR> {
        let formats = unsafe {
            self.d_surface_loader
                .get_physical_device_surface_formats(self.d_dev.pdev, self.d_surface)
                .or(Err(GaleError::INVALID))?
        };

        formats
            .iter()
            .find(|fmt| {
                fmt.format == vk::Format::B8G8R8A8_UNORM
                    || fmt.format == vk::Format::R8G8B8A8_UNORM
            })
            .copied()
            .ok_or(GaleError::INVALID_FORMAT)
    }

    pub fn image_count(&self) -> usize {
        self.d_images.len()
    }

    /// Populates this display with a new vkSwapchain.
    ///
    /// The old swapchain, if any, is passed as old_swapchain and then
    /// destroyed.
    pub fn create_swapchain(&mut self) -> Result<()> {
        // how many images we want the swapchain to contain.
        // Default to double buffering for minimal input lag.
        let mut desired_image_count = 2;
        if desired_image_count < self.d_surface_caps.min_image_count {
            desired_image_count = self.d_surface_caps.min_image_count;
        }
        if self.d_surface_caps.max_image_count > 0
            && desired_image_count > self.d_surface_caps.max_image_count
        {
            desired_image_count = self.d_surface_caps.max_image_count;
        }

        let transform = if self
            .d_surface_caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            self.d_surface_caps.current_transform
        };

        // Readbacks from the backbuffer want TRANSFER_SRC when the
        // surface allows it.
        let mut usage = vk::ImageUsageFlags::COLOR_ATTACHMENT;
        if self
            .d_surface_caps
            .supported_usage_flags
            .contains(vk::ImageUsageFlags::TRANSFER_SRC)
        {
            usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        }

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.d_surface)
            .min_image_count(desired_image_count)
            .image_color_space(self.d_surface_format.color_space)
            .image_format(self.d_surface_format.format)
            .image_extent(self.d_resolution)
            .image_usage(usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.d_present_mode)
            .clipped(true)
            .image_array_layers(1)
            .old_swapchain(self.d_swapchain)
            .build();

        let new_swapchain = unsafe {
            self.d_swapchain_loader
                .create_swapchain(&create_info, None)
                .or(Err(GaleError::COULD_NOT_CREATE_SWAPCHAIN))?
        };

        // Now that we recreated the swapchain destroy the old one
        self.destroy_swapchain();
        self.d_swapchain = new_swapchain;
        log::info!(
            "created swapchain {}x{} ({:?})",
            self.d_resolution.width,
            self.d_resolution.height,
            self.d_surface_format.format
        );
        Ok(())
    }

    /// Create views, the shared depth buffer, and one framebuffer per
    /// swapchain image against the backbuffer render pass.
    pub fn create_backbuffers(&mut self, backbuffer_render_pass: vk::RenderPass) -> Result<()> {
        let images = unsafe {
            self.d_swapchain_loader
                .get_swapchain_images(self.d_swapchain)
                .or(Err(GaleError::COULD_NOT_CREATE_IMAGE))?
        };

        let mut views = Vec::new();
        for image in images.iter() {
            let create_info = vk::ImageViewCreateInfo::builder()
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.d_surface_format.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image(*image)
                .build();

            unsafe {
                views.push(
                    self.d_dev
                        .dev
                        .create_image_view(&create_info, None)
                        .or(Err(GaleError::COULD_NOT_CREATE_IMAGE))?,
                );
            }
        }

        // One depth buffer serves every backbuffer image; passes
        // never keep backbuffer depth across frames.
        let (depth_image, depth_mem) = self.d_dev.create_image(
            self.d_resolution.width,
            self.d_resolution.height,
            1,
            1,
            1,
            vk::SampleCountFlags::TYPE_1,
            self.d_depth_format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        let depth_view_info = vk::ImageViewCreateInfo::builder()
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.d_depth_format)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL)
                    .level_count(1)
                    .layer_count(1)
                    .build(),
            )
            .image(depth_image);
        let depth_view = unsafe {
            self.d_dev
                .dev
                .create_image_view(&depth_view_info, None)
                .or(Err(GaleError::COULD_NOT_CREATE_IMAGE))?
        };

        let mut framebuffers = Vec::new();
        for view in views.iter() {
            let attachments = [*view, depth_view];
            let info = vk::FramebufferCreateInfo::builder()
                .render_pass(backbuffer_render_pass)
                .attachments(&attachments)
                .width(self.d_resolution.width)
                .height(self.d_resolution.height)
                .layers(1);
            unsafe {
                framebuffers.push(
                    self.d_dev
                        .dev
                        .create_framebuffer(&info, None)
                        .or(Err(GaleError::COULD_NOT_CREATE_IMAGE))?,
                );
            }
        }

        self.d_images = images;
        self.d_views = views;
        self.d_framebuffers = framebuffers;
        self.d_depth_image = depth_image;
        self.d_depth_view = depth_view;
        self.d_depth_mem = depth_mem;
        Ok(())
    }

    pub fn destroy_backbuffers(&mut self) {
        unsafe {
            for fb in self.d_framebuffers.drain(..) {
                self.d_dev.dev.destroy_framebuffer(fb, None);
            }
            for view in self.d_views.drain(..) {
                self.d_dev.dev.destroy_image_view(view, None);
            }
            self.d_images.clear();

            if self.d_depth_view != vk::ImageView::null() {
                self.d_dev.dev.destroy_image_view(self.d_depth_view, None);
                self.d_dev.dev.destroy_image(self.d_depth_image, None);
                self.d_dev.dev.free_memory(self.d_depth_mem, None);
                self.d_depth_view = vk::ImageView::null();
                self.d_depth_image = vk::Image::null();
                self.d_depth_mem = vk::DeviceMemory::null();
            }
        }
    }

    fn destroy_swapchain(&mut self) {
        if self.d_swapchain != vk::SwapchainKHR::null() {
            unsafe {
                self.d_swapchain_loader
                    .destroy_swapchain(self.d_swapchain, None);
            }
            self.d_swapchain = vk::SwapchainKHR::null();
        }
    }

    /// Tear down and rebuild everything swapchain-sized. Called on
    /// OUT_OF_DATE at a frame boundary.
    pub fn recreate_swapchain(&mut self, backbuffer_render_pass: vk::RenderPass) -> Result<()> {
        // first wait for the device to finish working
        unsafe { self.d_dev.dev.device_wait_idle().unwrap() };

        self.destroy_backbuffers();
        self.refresh_surface_info()?;
        self.create_swapchain()?;
        self.create_backbuffers(backbuffer_render_pass)
    }

    /// Get the next swapchain image to render to.
    ///
    /// If the next image is not ready (NOT_READY or TIMEOUT), loop on
    /// vkAcquireNextImageKHR until we get a valid image. This has to
    /// be done on AMD hw or else the TIMEOUT error will get passed up
    /// the callstack and fail.
    pub fn acquire_next_image(&mut self, signal_sema: vk::Semaphore) -> Result<u32> {
        loop {
            match unsafe {
                self.d_swapchain_loader.acquire_next_image(
                    self.d_swapchain,
                    0, // zero timeout to immediately get the state
                    signal_sema,
                    vk::Fence::null(),
                )
            } {
                Ok((index, suboptimal)) => {
                    if suboptimal {
                        return Err(GaleError::OUT_OF_DATE);
                    }
                    return Ok(index);
                }
                Err(vk::Result::NOT_READY) => continue,
                Err(vk::Result::TIMEOUT) => continue,
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return Err(GaleError::OUT_OF_DATE),
                Err(vk::Result::SUBOPTIMAL_KHR) => return Err(GaleError::OUT_OF_DATE),
                Err(_) => return Err(GaleError::COULD_NOT_ACQUIRE_NEXT_IMAGE),
            }
        }
    }

    /// Flip the buffers and present `image_index`.
    pub fn present(&mut self, wait_sema: vk::Semaphore, image_index: u32) -> Result<()> {
        let wait_semas = [wait_sema];
        let swapchains = [self.d_swapchain];
        let indices = [image_index];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semas)
            .swapchains(&swapchains)
            .image_indices(&indices);

        unsafe {
            match self
                .d_swapchain_loader
                .queue_present(self.d_dev.graphics_queue, &info)
            {
                Ok(false) => Ok(()),
                Ok(true) => Err(GaleError::OUT_OF_DATE),
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GaleError::OUT_OF_DATE),
                Err(vk::Result::SUBOPTIMAL_KHR) => Err(GaleError::OUT_OF_DATE),
                Err(_) => Err(GaleError::PRESENT_FAILED),
            }
        }
    }
}

impl Drop for Display {
    fn drop(&mut self) {
        if self.d_dev.skip_destroys() {
            return;
        }
        unsafe {
            self.d_dev.dev.device_wait_idle().unwrap();
            self.destroy_backbuffers();
            self.destroy_swapchain();
            self.d_surface_loader.destroy_surface(self.d_surface, None);
        }
    }
}
