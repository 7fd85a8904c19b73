// The Gale render queue
//
// A threaded, deferred render queue for driving a GPU from an
// emulator. Draw operations are recorded on the caller's thread into
// coarse steps, optimized as a list, and replayed on a dedicated
// render thread that talks to Vulkan through ash.

pub mod barrier;
pub mod caps;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod display;
pub mod format;
pub mod frame;
pub mod glcaps;
pub mod instance;
pub mod memory;
pub mod optimize;
pub mod pipeline;
pub mod profile;
pub mod queue;
pub mod resource;
pub mod runner;
pub mod step;

#[cfg(test)]
mod tests;

pub use caps::{DeviceBugs, DeviceCaps, GpuVendor};
pub use context::{ClippedDraw, DrawContext, Pipeline, PipelineCreateDesc};
pub use device::Device;
pub use display::Display;
pub use format::DataFormat;
pub use instance::Instance;
pub use memory::PushBuffer;
pub use pipeline::{GraphicsPipeline, RenderPassType};
pub use queue::{QueueHacks, ReadbackMode, RenderQueue};
pub use resource::{Buffer, Framebuffer, InputLayout, SamplerState, ShaderModule, Texture};
pub use step::{LoadAction, PipelineFlags, StoreAction};

extern crate utils;
pub use crate::utils::{region::Rect, MemImage};

use std::sync::Arc;

/// Number of frames that may be in flight at once. Frame slots are
/// round-robin assigned from the frame counter.
pub const MAX_INFLIGHT_FRAMES: usize = 3;

#[allow(non_camel_case_types)]
#[derive(thiserror::Error, Debug, PartialEq, Eq, Copy, Clone)]
pub enum GaleError {
    #[error("Operation timed out")]
    TIMEOUT,
    #[error("Allocation failure")]
    OUT_OF_MEMORY,
    #[error("Invalid operation")]
    INVALID,
    #[error("Invalid or unsupported format")]
    INVALID_FORMAT,
    #[error("Invalid image stride")]
    INVALID_STRIDE,
    #[error("Could not create the vulkan swapchain")]
    COULD_NOT_CREATE_SWAPCHAIN,
    #[error("Could not create a vulkan image")]
    COULD_NOT_CREATE_IMAGE,
    #[error("Could not create a vulkan buffer")]
    COULD_NOT_CREATE_BUFFER,
    #[error("Could not get the next swapchain image")]
    COULD_NOT_ACQUIRE_NEXT_IMAGE,
    #[error("vkQueuePresent failed")]
    PRESENT_FAILED,
    #[error("The swapchain is out of date and needs to be recreated")]
    OUT_OF_DATE,
    #[error("The vulkan surface is not supported on this device")]
    VK_SURF_NOT_SUPPORTED,
    #[error("Vulkan device does not have all required extensions")]
    VK_NOT_ALL_EXTENSIONS_AVAILABLE,
    #[error("The device was lost")]
    DEVICE_LOST,
    #[error("Recording contract violated")]
    RECORDING_ERROR,
}

pub type Result<T> = std::result::Result<T, GaleError>;

/// Invoked for failures that are reported rather than returned:
/// failed pipeline links, shader compiles, resource creation.
/// The first argument is a short stage label, the second the detail
/// (usually including the offending source).
pub type ErrorCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Parameters for bringing up the runtime.
///
/// The windowing glue supplies the surface extension names and later
/// the VkSurfaceKHR itself; everything else has workable defaults.
pub struct CreateInfo {
    /// Extra instance extensions required by the caller's surface.
    pub surface_extensions: Vec<&'static std::ffi::CStr>,
    /// Which game-specific queue reorderings to enable.
    pub hacks: QueueHacks,
    /// Submit main and present command buffers separately.
    pub split_submit: bool,
    /// Error callback, fired once per reported failure.
    pub error_callback: Option<ErrorCallback>,
    pub application_name: String,
}

impl Default for CreateInfo {
    fn default() -> Self {
        Self {
            surface_extensions: Vec::new(),
            hacks: QueueHacks::empty(),
            split_submit: false,
            error_callback: None,
            application_name: "gale".to_string(),
        }
    }
}
