// OpenGL capability probe
//
// The GL path hands us strings (version, vendor, renderer, extension
// list) and a few integer limits; everything we derive from them is
// plain parsing, so it all lives here without any GL dependency. The
// same DeviceBugs mask drives both backends.

use crate::caps::{DeviceBugs, GpuVendor};
use crate::format::DataFormat;

use std::collections::HashSet;

/// Strategy used to move push-buffer data to the device on GL.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BufferStrategy {
    /// One BufferSubData per chunk at End.
    Subdata,
    /// Map at frame begin, plain unmap at end.
    FrameUnmap,
    /// Map with invalidate, unmap at end.
    InvalidateUnmap,
    /// Map with explicit flush ranges, unmap at end.
    FlushUnmap,
    /// Map with flush and invalidate, unmap at end.
    FlushInvalidateUnmap,
}

impl BufferStrategy {
    pub fn wants_mapping(&self) -> bool {
        *self != BufferStrategy::Subdata
    }

    pub fn wants_explicit_flush(&self) -> bool {
        match self {
            BufferStrategy::FlushUnmap | BufferStrategy::FlushInvalidateUnmap => true,
            _ => false,
        }
    }

    pub fn wants_invalidate(&self) -> bool {
        match self {
            BufferStrategy::InvalidateUnmap | BufferStrategy::FlushInvalidateUnmap => true,
            _ => false,
        }
    }
}

/// What we learned from a GL context's strings and limits.
///
/// This mirrors the feature surface the renderer actually branches on,
/// not the full registry.
#[derive(Debug, Clone)]
pub struct GlExtensions {
    pub ver: (u32, u32, u32),
    pub vendor: GpuVendor,
    pub model: String,
    /// Parsed Adreno model number, 300 if unparseable.
    pub model_number: i32,
    pub is_gles: bool,
    pub is_core_context: bool,
    /// true if the full OpenGL ES 3.0 is supported
    pub gles3: bool,

    pub exts: HashSet<String>,

    pub bugs: DeviceBugs,
}

impl GlExtensions {
    /// greater-or-equal than
    pub fn version_ge(&self, major: u32, minor: u32, sub: u32) -> bool {
        if self.ver.0 != major {
            return self.ver.0 > major;
        }
        if self.ver.1 != minor {
            return self.ver.1 > minor;
        }
        self.ver.2 >= sub
    }

    pub fn has(&self, ext: &str) -> bool {
        self.exts.contains(ext)
    }

    /// The GLSL version to emit for this context.
    pub fn glsl_version(&self) -> u32 {
        if self.is_gles {
            if self.gles3 {
                // GLSL version matches ES version.
                self.ver.0 * 100 + self.ver.1 * 10
            } else {
                100
            }
        } else {
            // Apple drivers fail without an exact match on core contexts.
            if self.version_ge(3, 3, 0) {
                self.ver.0 * 100 + self.ver.1 * 10
            } else if self.version_ge(3, 2, 0) {
                150
            } else if self.version_ge(3, 1, 0) {
                140
            } else if self.version_ge(3, 0, 0) {
                130
            } else if self.version_ge(2, 1, 0) {
                120
            } else {
                110
            }
        }
    }

    /// NPOT wrapping requires full NPOT support.
    pub fn can_wrap_npot(&self) -> bool {
        !self.is_gles
            || self.gles3
            || self.has("GL_OES_texture_npot")
            || self.has("GL_ARB_texture_non_power_of_two")
    }

    pub fn preferred_depth_format(&self) -> DataFormat {
        if self.is_gles
            && !self.has("GL_OES_packed_depth_stencil")
            && !self.has("GL_OES_depth24")
        {
            DataFormat::D16
        } else {
            DataFormat::D24S8
        }
    }
}

/// Parse a GL_VERSION style string into (major, minor).
///
/// Takes the first digit before a dot and the first digit after it,
/// which copes with strings like "OpenGL ES 3.2 v1.r26p0" and
/// "4.6.0 NVIDIA 535.54". Defaults to 2.0 when nothing parses.
pub fn parse_gl_version(version_str: &str) -> (u32, u32) {
    let mut parsed = (2u32, 0u32);
    let mut before_dot = true;
    let mut last_digit = 0u32;

    for c in version_str.chars() {
        if let Some(d) = c.to_digit(10) {
            last_digit = d;
            if !before_dot {
                parsed.1 = d;
                break;
            }
        }
        if before_dot && c == '.' && last_digit != 0 {
            parsed.0 = last_digit;
            before_dot = false;
        }
    }
    if before_dot && last_digit != 0 {
        parsed.0 = last_digit;
        parsed.1 = 0;
    }
    parsed
}

pub fn is_gles_version_string(version_str: &str) -> bool {
    version_str.starts_with("OpenGL ES")
}

/// Map a GL_VENDOR string onto our vendor enum. The renderer string is
/// needed too, to pull the model number out of Adreno reports.
pub fn parse_gl_vendor(vendor: &str, renderer: &str) -> (GpuVendor, i32) {
    let vendor = vendor.trim();
    let gpu_vendor = match vendor {
        "NVIDIA Corporation" | "Nouveau" | "nouveau" => GpuVendor::Nvidia,
        "Advanced Micro Devices, Inc." | "ATI Technologies Inc." | "AMD" => GpuVendor::Amd,
        // We'll assume Tungsten means Intel
        "Intel" | "Intel Inc." | "Intel Corporation" | "Tungsten Graphics, Inc" => {
            GpuVendor::Intel
        }
        "ARM" => GpuVendor::Arm,
        "Imagination Technologies" => GpuVendor::Imgtec,
        "Qualcomm" => GpuVendor::Qualcomm,
        "Broadcom" => GpuVendor::Broadcom,
        "Vivante Corporation" => GpuVendor::Vivante,
        "Apple Inc." | "Apple" => GpuVendor::Apple,
        _ => GpuVendor::Unknown,
    };

    let mut model_number = 0;
    if gpu_vendor == GpuVendor::Qualcomm {
        // Renderer looks like "Adreno (TM) 640"
        model_number = renderer
            .rsplit(' ')
            .next()
            .and_then(|n| n.parse::<i32>().ok())
            .unwrap_or(300);
    }

    (gpu_vendor, model_number)
}

/// Split a space-separated extension string into a set.
pub fn parse_extension_string(exts: &str) -> HashSet<String> {
    exts.split_whitespace().map(|s| s.to_string()).collect()
}

/// Build the probe record from a context's strings.
pub fn probe_from_strings(
    version_str: &str,
    vendor_str: &str,
    renderer_str: &str,
    extension_str: &str,
    is_core_context: bool,
) -> GlExtensions {
    let is_gles = is_gles_version_string(version_str) && !is_core_context;
    let (major, minor) = parse_gl_version(version_str);
    let (vendor, model_number) = parse_gl_vendor(vendor_str, renderer_str);

    let mut ret = GlExtensions {
        ver: (major, minor, 0),
        vendor,
        model: renderer_str.to_string(),
        model_number,
        is_gles,
        is_core_context,
        gles3: is_gles && major >= 3,
        exts: parse_extension_string(extension_str),
        bugs: DeviceBugs::empty(),
    };

    ret.bugs = process_gpu_features(&ret);
    ret
}

/// PowerVR SGX models whose fragment precision is unusable.
const PVR_TERRIBLE_MODELS: &[&str] = &[
    "PowerVR SGX 545",
    "PowerVR SGX 544",
    "PowerVR SGX 544MP2",
    "PowerVR SGX 543",
    "PowerVR SGX 540",
    "PowerVR SGX 530",
    "PowerVR SGX 520",
];

/// The fixed PVR precision rules. Runs right after the vendor has
/// been identified.
pub fn process_gpu_features(gl: &GlExtensions) -> DeviceBugs {
    let mut bugs = DeviceBugs::empty();

    if gl.vendor == GpuVendor::Imgtec {
        if PVR_TERRIBLE_MODELS.iter().any(|m| *m == gl.model) {
            bugs |= DeviceBugs::PVR_SHADER_PRECISION_TERRIBLE | DeviceBugs::PVR_SHADER_PRECISION_BAD;
        } else {
            bugs |= DeviceBugs::PVR_SHADER_PRECISION_BAD;
        }
    }

    bugs
}

fn make_intel_simple_ver(v1: i32, v2: i32, v3: i32) -> i32 {
    (v1 << 16) | (v2 << 8) | v3
}

/// Intel uses a confusing set of at least 3 version numbering schemes.
/// This is the one given to OpenGL, "Build 10.18.10.4061" style.
fn has_intel_dual_src_bug(versions: [i32; 4]) -> bool {
    match make_intel_simple_ver(versions[0], versions[1], versions[2]) {
        v if v == make_intel_simple_ver(9, 17, 10) => false,
        v if v == make_intel_simple_ver(9, 18, 10) => false,
        v if v == make_intel_simple_ver(10, 18, 10) => versions[3] < 4061,
        v if v == make_intel_simple_ver(10, 18, 14) => versions[3] < 4080,
        // Older than above didn't support dual src anyway, newer
        // should have the fix.
        _ => false,
    }
}

fn parse_intel_build_version(api_version_str: &str) -> Option<[i32; 4]> {
    let rest = api_version_str.strip_prefix("Build ")?;
    let mut out = [0i32; 4];
    let mut parts = rest.split('.');
    for v in out.iter_mut() {
        *v = parts.next()?.trim().parse().ok()?;
    }
    Some(out)
}

/// The full GL bug pass, run once after probing.
///
/// `api_version_str` is the driver's API version report (used for the
/// Intel build-number check), `android_api_level` the OS version on
/// Android, None elsewhere. `is_armv7` gates the Raspberry Pi check.
pub fn gl_bug_pass(
    gl: &GlExtensions,
    api_version_str: &str,
    android_api_level: Option<i32>,
    is_armv7: bool,
    is_ios: bool,
) -> DeviceBugs {
    let mut bugs = gl.bugs;

    if !gl.version_ge(3, 0, 0) {
        // Don't use dual source blending on sub 3.0 OpenGL versions,
        // it does not seem reliable.
        bugs |= DeviceBugs::DUAL_SOURCE_BLENDING_BROKEN;
    } else if gl.vendor == GpuVendor::Intel {
        if let Some(versions) = parse_intel_build_version(api_version_str) {
            if has_intel_dual_src_bug(versions) {
                bugs |= DeviceBugs::DUAL_SOURCE_BLENDING_BROKEN;
            }
        }
    }

    if is_armv7 && gl.vendor == GpuVendor::Broadcom {
        bugs |= DeviceBugs::RASPBERRY_SHADER_COMP_HANG;
    }

    // Old Tegra chips show up as sub 3.0 NVIDIA. Like Vivante and
    // Broadcom, those can't handle NaN values in conditionals.
    if gl.vendor == GpuVendor::Vivante
        || gl.vendor == GpuVendor::Broadcom
        || (gl.vendor == GpuVendor::Nvidia && !gl.version_ge(3, 0, 0))
    {
        bugs |= DeviceBugs::BROKEN_NAN_IN_CONDITIONAL;
    }

    // Mapping murders performance on Mali. NVIDIA is the only vendor
    // we currently trust with it.
    if gl.vendor != GpuVendor::Nvidia {
        bugs |= DeviceBugs::ANY_MAP_BUFFER_RANGE_SLOW;
    }

    if gl.vendor == GpuVendor::Imgtec {
        bugs |= DeviceBugs::PVR_GENMIPMAP_HEIGHT_GREATER;
    }

    if gl.vendor == GpuVendor::Qualcomm {
        // Affects Adreno 3xx and 5xx, appeared in Android 8.0 Oreo.
        if let Some(api) = android_api_level {
            if gl.model_number < 600 && api >= 26 {
                bugs |= DeviceBugs::ADRENO_RESOURCE_DEADLOCK;
            }
        }
    }

    // For some reason, this bug does not appear on M1.
    if is_ios && gl.vendor == GpuVendor::Apple {
        bugs |= DeviceBugs::BROKEN_FLAT_IN_SHADER;
    }

    bugs
}

/// Decide how push buffers reach the device for this context.
pub fn select_buffer_strategy(gl: &GlExtensions, bugs: DeviceBugs) -> BufferStrategy {
    let mut map_buffers = !bugs.contains(DeviceBugs::ANY_MAP_BUFFER_RANGE_SLOW);
    let has_buffer_storage =
        gl.has("GL_ARB_buffer_storage") || gl.has("GL_EXT_buffer_storage");

    if !gl.version_ge(3, 0, 0) && gl.is_gles && !has_buffer_storage {
        // Force disable, it wouldn't work anyway.
        map_buffers = false;
    }

    // Notes on buffer mapping:
    // NVIDIA GTX 9xx - mapping improves speed, basic unmap seems best.
    // PowerVR GX6xxx - mapping has little improvement, explicit flush
    // is slower.
    if map_buffers {
        match gl.vendor {
            GpuVendor::Nvidia => BufferStrategy::FrameUnmap,
            _ => BufferStrategy::Subdata,
        }
    } else {
        BufferStrategy::Subdata
    }
}
