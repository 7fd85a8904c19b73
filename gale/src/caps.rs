// Device capability records
//
// The rest of the engine branches on the bug mask and feature
// booleans collected here, never on vendor strings directly.

use crate::format::DataFormat;

/// PCI vendor ids as reported by Vulkan.
pub const VENDOR_ID_AMD: u32 = 0x1002;
pub const VENDOR_ID_IMGTEC: u32 = 0x1010;
pub const VENDOR_ID_NVIDIA: u32 = 0x10DE;
pub const VENDOR_ID_ARM: u32 = 0x13B5;
pub const VENDOR_ID_QUALCOMM: u32 = 0x5143;
pub const VENDOR_ID_INTEL: u32 = 0x8086;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Arm,     // Mali
    Imgtec,  // PowerVR
    Qualcomm, // Adreno
    Broadcom, // Raspberry PI etc
    Vivante,
    Apple,
    Mesa,
    Unknown,
}

impl GpuVendor {
    pub fn from_vulkan_id(id: u32) -> Self {
        match id {
            VENDOR_ID_AMD => GpuVendor::Amd,
            VENDOR_ID_IMGTEC => GpuVendor::Imgtec,
            VENDOR_ID_NVIDIA => GpuVendor::Nvidia,
            VENDOR_ID_ARM => GpuVendor::Arm,
            VENDOR_ID_QUALCOMM => GpuVendor::Qualcomm,
            VENDOR_ID_INTEL => GpuVendor::Intel,
            _ => GpuVendor::Unknown,
        }
    }
}

bitflags::bitflags! {
    /// Known driver defects. Detection rules are fixed per
    /// (vendor, model range, driver version range, OS version) and
    /// must not be loosened: several are visible fixes for specific
    /// games.
    pub struct DeviceBugs: u32 {
        /// Adreno 5xx fails to discard stencil when depth write is off.
        const NO_DEPTH_CANNOT_DISCARD_STENCIL = 1 << 0;
        /// Dual-source blending produces garbage.
        const DUAL_SOURCE_BLENDING_BROKEN = 1 << 1;
        /// Color write mask ignored under an active depth test.
        const COLORWRITEMASK_BROKEN_WITH_DEPTHTEST = 1 << 2;
        /// Mali: gl_Position.w == z draws corrupt the depth buffer.
        const EQUAL_WZ_CORRUPTS_DEPTH = 1 << 3;
        /// Mali: stencil discard interacts badly with tile memory.
        const MALI_STENCIL_DISCARD_BUG = 1 << 4;
        /// PowerVR fragment precision is too low for depth rounding.
        const PVR_SHADER_PRECISION_BAD = 1 << 5;
        /// Old PowerVR SGX precision is unusable.
        const PVR_SHADER_PRECISION_TERRIBLE = 1 << 6;
        /// NaN in a conditional takes the wrong branch (pre-GL3 tier).
        const BROKEN_NAN_IN_CONDITIONAL = 1 << 7;
        /// glMapBufferRange is slower than BufferSubData.
        const ANY_MAP_BUFFER_RANGE_SLOW = 1 << 8;
        /// PowerVR glGenerateMipmap fails when height > width.
        const PVR_GENMIPMAP_HEIGHT_GREATER = 1 << 9;
        /// Adreno deadlocks when deleting resources mid-frame.
        const ADRENO_RESOURCE_DEADLOCK = 1 << 10;
        /// Shader compiler hangs on some Raspberry Pi drivers.
        const RASPBERRY_SHADER_COMP_HANG = 1 << 11;
        /// flat interpolation qualifier miscompiles.
        const BROKEN_FLAT_IN_SHADER = 1 << 12;
    }
}

/// Immutable once the probe has run.
#[derive(Debug, Clone)]
pub struct DeviceCaps {
    pub vendor: GpuVendor,
    pub model: String,
    /// (major, minor, patch) of the driver-reported API version.
    pub api_version: (u32, u32, u32),
    pub device_id: u32,
    pub driver_version: u32,

    pub anisotropy_supported: bool,
    pub dual_source_blend: bool,
    pub depth_clamp_supported: bool,
    pub clip_distance_supported: bool,
    pub cull_distance_supported: bool,
    pub logic_op_supported: bool,
    pub blend_minmax_supported: bool,
    pub framebuffer_blit_supported: bool,
    pub framebuffer_copy_supported: bool,
    pub framebuffer_depth_blit_supported: bool,
    pub framebuffer_depth_copy_supported: bool,
    pub texture_3d_supported: bool,
    pub texture_npot_fully_supported: bool,
    pub fragment_shader_depth_write_supported: bool,
    pub fragment_shader_stencil_write_supported: bool,
    pub multiview_supported: bool,

    pub supports_bc123: bool,
    pub supports_bc45: bool,
    pub supports_bc7: bool,
    pub supports_etc2: bool,
    pub supports_astc: bool,

    /// Bitmask of supported color sample counts.
    pub multisample_levels: u32,
    pub preferred_depth_format: DataFormat,

    pub bugs: DeviceBugs,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            vendor: GpuVendor::Unknown,
            model: String::new(),
            api_version: (1, 0, 0),
            device_id: 0,
            driver_version: 0,
            anisotropy_supported: false,
            dual_source_blend: false,
            depth_clamp_supported: false,
            clip_distance_supported: false,
            cull_distance_supported: false,
            logic_op_supported: false,
            blend_minmax_supported: true,
            framebuffer_blit_supported: true,
            framebuffer_copy_supported: true,
            framebuffer_depth_blit_supported: false,
            framebuffer_depth_copy_supported: true,
            texture_3d_supported: true,
            texture_npot_fully_supported: true,
            fragment_shader_depth_write_supported: true,
            fragment_shader_stencil_write_supported: false,
            multiview_supported: false,
            supports_bc123: false,
            supports_bc45: false,
            supports_bc7: false,
            supports_etc2: false,
            supports_astc: false,
            multisample_levels: 1,
            preferred_depth_format: DataFormat::D24S8,
            bugs: DeviceBugs::empty(),
        }
    }
}

/// The fixed bug-mask rules for Vulkan devices.
///
/// deviceID and driverVersion ranges are as the drivers report them;
/// the Adreno 5xx window is deviceID 0x05000000..0x06000000 with
/// drivers older than 0x80180000.
pub fn vulkan_bug_pass(vendor: GpuVendor, device_id: u32, driver_version: u32) -> DeviceBugs {
    let mut bugs = DeviceBugs::empty();

    match vendor {
        GpuVendor::Qualcomm => {
            if device_id >= 0x0500_0000 && device_id < 0x0600_0000 && driver_version < 0x8018_0000 {
                bugs |= DeviceBugs::NO_DEPTH_CANNOT_DISCARD_STENCIL;
            }
            // Known still present on driver 0x80180000 and Adreno 5xx.
            bugs |= DeviceBugs::COLORWRITEMASK_BROKEN_WITH_DEPTHTEST;
        }
        GpuVendor::Amd => {
            if driver_version < 0x0040_7000 {
                bugs |= DeviceBugs::DUAL_SOURCE_BLENDING_BROKEN;
            }
        }
        GpuVendor::Intel => {
            bugs |= DeviceBugs::DUAL_SOURCE_BLENDING_BROKEN;
        }
        GpuVendor::Arm => {
            bugs |= DeviceBugs::EQUAL_WZ_CORRUPTS_DEPTH;
            bugs |= DeviceBugs::MALI_STENCIL_DISCARD_BUG;
        }
        _ => {}
    }

    bugs
}
