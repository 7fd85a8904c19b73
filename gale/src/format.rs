// Pixel format queries and CPU-side conversions
//
// These are pure functions, shared by the readback path and by
// texture uploads. Nothing here touches the driver.

use crate::{GaleError, Result};

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DataFormat {
    Undefined,

    R8Unorm,
    R8G8Unorm,
    R8G8B8Unorm,

    R8G8B8A8Unorm,
    R8G8B8A8UnormSrgb,
    B8G8R8A8Unorm, // D3D style
    B8G8R8A8UnormSrgb,

    R8G8B8A8Snorm,
    R8G8B8A8Uint,
    R8G8B8A8Sint,

    R4G4UnormPack8,
    A4R4G4B4UnormPack16, // A4 in the UPPER bits
    B4G4R4A4UnormPack16,
    R4G4B4A4UnormPack16,
    R5G6B5UnormPack16,
    B5G6R5UnormPack16,
    R5G5B5A1UnormPack16, // A1 in the LOWER bit
    B5G5R5A1UnormPack16, // A1 in the LOWER bit
    A1R5G5B5UnormPack16, // A1 in the UPPER bit
    A1B5G5R5UnormPack16, // A1 in the UPPER bit. GL only.

    R16Unorm,

    R16Float,
    R16G16Float,
    R16G16B16A16Float,

    R32Float,
    R32G32Float,
    R32G32B32Float,
    R32G32B32A32Float,

    // Block compression formats. Modern names for DXT and friends.
    Bc1RgbaUnormBlock, // 64 bits per 4x4 block
    Bc2UnormBlock,     // 4-bit alpha + DXT1 color, 128 bits per block
    Bc3UnormBlock,     // interpolated alpha + DXT1 color, 128 bits per block
    Bc4UnormBlock,     // 1 channel, 64 bits per block
    Bc5UnormBlock,     // 2 channel RG, 128 bits per block
    Bc7UnormBlock,     // high quality RGBA, 128 bits per block

    // Ericsson texture compression.
    Etc2R8G8B8UnormBlock,   // color only, 64 bits per 4x4 block
    Etc2R8G8B8A1UnormBlock, // color + punchthrough alpha, 64 bits
    Etc2R8G8B8A8UnormBlock, // color + alpha, 128 bits per 4x4 block

    // The one ASTC format used by UASTC / basis universal.
    Astc4x4UnormBlock,

    S8,
    D16,
    D16S8,
    D24S8,
    D32F,
    D32FS8,
}

/// Which aspects of an image a format describes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AspectClass {
    Color,
    Depth,
    DepthStencil,
    Stencil,
}

impl DataFormat {
    /// Bytes per pixel, or per block for compressed formats.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataFormat::Undefined => 0,

            DataFormat::R8Unorm => 1,
            DataFormat::R8G8Unorm => 2,
            DataFormat::R8G8B8Unorm => 3,

            DataFormat::R8G8B8A8Unorm
            | DataFormat::R8G8B8A8UnormSrgb
            | DataFormat::B8G8R8A8Unorm
            | DataFormat::B8G8R8A8UnormSrgb
            | DataFormat::R8G8B8A8Snorm
            | DataFormat::R8G8B8A8Uint
            | DataFormat::R8G8B8A8Sint => 4,

            DataFormat::R4G4UnormPack8 => 1,
            DataFormat::A4R4G4B4UnormPack16
            | DataFormat::B4G4R4A4UnormPack16
            | DataFormat::R4G4B4A4UnormPack16
            | DataFormat::R5G6B5UnormPack16
            | DataFormat::B5G6R5UnormPack16
            | DataFormat::R5G5B5A1UnormPack16
            | DataFormat::B5G5R5A1UnormPack16
            | DataFormat::A1R5G5B5UnormPack16
            | DataFormat::A1B5G5R5UnormPack16 => 2,

            DataFormat::R16Unorm | DataFormat::R16Float => 2,
            DataFormat::R16G16Float => 4,
            DataFormat::R16G16B16A16Float => 8,

            DataFormat::R32Float => 4,
            DataFormat::R32G32Float => 8,
            DataFormat::R32G32B32Float => 12,
            DataFormat::R32G32B32A32Float => 16,

            DataFormat::Bc1RgbaUnormBlock | DataFormat::Bc4UnormBlock => 8,
            DataFormat::Bc2UnormBlock
            | DataFormat::Bc3UnormBlock
            | DataFormat::Bc5UnormBlock
            | DataFormat::Bc7UnormBlock => 16,
            DataFormat::Etc2R8G8B8UnormBlock | DataFormat::Etc2R8G8B8A1UnormBlock => 8,
            DataFormat::Etc2R8G8B8A8UnormBlock | DataFormat::Astc4x4UnormBlock => 16,

            DataFormat::S8 => 1,
            DataFormat::D16 => 2,
            DataFormat::D16S8 => 3,
            DataFormat::D24S8 => 4,
            DataFormat::D32F => 4,
            DataFormat::D32FS8 => 5,
        }
    }

    pub fn is_depth_stencil(&self) -> bool {
        match self {
            DataFormat::S8
            | DataFormat::D16
            | DataFormat::D16S8
            | DataFormat::D24S8
            | DataFormat::D32F
            | DataFormat::D32FS8 => true,
            _ => false,
        }
    }

    pub fn is_color(&self) -> bool {
        !self.is_depth_stencil()
    }

    pub fn aspect_class(&self) -> AspectClass {
        match self {
            DataFormat::S8 => AspectClass::Stencil,
            DataFormat::D16 | DataFormat::D32F => AspectClass::Depth,
            DataFormat::D16S8 | DataFormat::D24S8 | DataFormat::D32FS8 => AspectClass::DepthStencil,
            _ => AspectClass::Color,
        }
    }

    /// Returns Some(bytes per block) for block-compressed formats.
    pub fn block_size_in_bytes(&self) -> Option<usize> {
        match self {
            DataFormat::Bc1RgbaUnormBlock
            | DataFormat::Bc4UnormBlock
            | DataFormat::Etc2R8G8B8UnormBlock
            | DataFormat::Etc2R8G8B8A1UnormBlock => Some(8),
            DataFormat::Bc2UnormBlock
            | DataFormat::Bc3UnormBlock
            | DataFormat::Bc5UnormBlock
            | DataFormat::Bc7UnormBlock
            | DataFormat::Etc2R8G8B8A8UnormBlock
            | DataFormat::Astc4x4UnormBlock => Some(16),
            _ => None,
        }
    }

    pub fn is_block_compressed(&self) -> bool {
        self.block_size_in_bytes().is_some()
    }

    /// Block dimensions. (1, 1) for uncompressed formats.
    pub fn block_dimensions(&self) -> (u32, u32) {
        if self.is_block_compressed() {
            (4, 4)
        } else {
            (1, 1)
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataFormat::R8G8B8A8Unorm => "R8G8B8A8_UNORM",
            DataFormat::B8G8R8A8Unorm => "B8G8R8A8_UNORM",
            DataFormat::R4G4B4A4UnormPack16 => "R4G4B4A4_UNORM_PACK16",
            DataFormat::B4G4R4A4UnormPack16 => "B4G4R4A4_UNORM_PACK16",
            DataFormat::A4R4G4B4UnormPack16 => "A4R4G4B4_UNORM_PACK16",
            DataFormat::R5G6B5UnormPack16 => "R5G6B5_UNORM_PACK16",
            DataFormat::B5G6R5UnormPack16 => "B5G6R5_UNORM_PACK16",
            DataFormat::R5G5B5A1UnormPack16 => "R5G5B5A1_UNORM_PACK16",
            DataFormat::R8Unorm => "R8_UNORM",
            DataFormat::S8 => "S8",
            DataFormat::D16 => "D16",
            DataFormat::D16S8 => "D16_S8",
            DataFormat::D24S8 => "D24_S8",
            DataFormat::D32F => "D32F",
            DataFormat::D32FS8 => "D32F_S8",
            _ => "(unknown)",
        }
    }
}

#[inline]
fn pack_565(r: u32, g: u32, b: u32) -> u16 {
    ((r >> 3) << 11 | (g >> 2) << 5 | (b >> 3)) as u16
}

#[inline]
fn pack_5551(r: u32, g: u32, b: u32, a: u32) -> u16 {
    ((r >> 3) << 11 | (g >> 3) << 6 | (b >> 3) << 1 | (a >> 7)) as u16
}

#[inline]
fn pack_4444(r: u32, g: u32, b: u32, a: u32) -> u16 {
    ((r >> 4) << 12 | (g >> 4) << 8 | (b >> 4) << 4 | (a >> 4)) as u16
}

/// Convert a tightly-described RGBA8888 source to `format`.
///
/// Strides are in pixels, independently for src and dst, so a
/// sub-rectangle of a larger surface can be converted in place.
pub fn convert_from_rgba8888(
    dst: &mut [u8],
    src: &[u8],
    dst_stride: u32,
    src_stride: u32,
    width: u32,
    height: u32,
    format: DataFormat,
) -> Result<()> {
    convert_8888(dst, src, dst_stride, src_stride, width, height, format, false)
}

/// Same as `convert_from_rgba8888` with the R and B channels swapped
/// on read.
pub fn convert_from_bgra8888(
    dst: &mut [u8],
    src: &[u8],
    dst_stride: u32,
    src_stride: u32,
    width: u32,
    height: u32,
    format: DataFormat,
) -> Result<()> {
    convert_8888(dst, src, dst_stride, src_stride, width, height, format, true)
}

fn convert_8888(
    dst: &mut [u8],
    src: &[u8],
    dst_stride: u32,
    src_stride: u32,
    width: u32,
    height: u32,
    format: DataFormat,
    swap_rb: bool,
) -> Result<()> {
    let dst_px = format.size_in_bytes();

    for y in 0..height as usize {
        let src_row = &src[y * src_stride as usize * 4..];
        let dst_row = &mut dst[y * dst_stride as usize * dst_px..];

        for x in 0..width as usize {
            let p = &src_row[x * 4..x * 4 + 4];
            let (r, g, b, a) = if swap_rb {
                (p[2] as u32, p[1] as u32, p[0] as u32, p[3] as u32)
            } else {
                (p[0] as u32, p[1] as u32, p[2] as u32, p[3] as u32)
            };

            match format {
                DataFormat::R8G8B8A8Unorm => {
                    let out = &mut dst_row[x * 4..x * 4 + 4];
                    out[0] = r as u8;
                    out[1] = g as u8;
                    out[2] = b as u8;
                    out[3] = a as u8;
                }
                DataFormat::B8G8R8A8Unorm => {
                    let out = &mut dst_row[x * 4..x * 4 + 4];
                    out[0] = b as u8;
                    out[1] = g as u8;
                    out[2] = r as u8;
                    out[3] = a as u8;
                }
                DataFormat::R8Unorm => {
                    dst_row[x] = r as u8;
                }
                DataFormat::R5G6B5UnormPack16 => {
                    dst_row[x * 2..x * 2 + 2].copy_from_slice(&pack_565(r, g, b).to_le_bytes());
                }
                DataFormat::B5G6R5UnormPack16 => {
                    dst_row[x * 2..x * 2 + 2].copy_from_slice(&pack_565(b, g, r).to_le_bytes());
                }
                DataFormat::R5G5B5A1UnormPack16 => {
                    // A1 lives in the LOWER bit
                    dst_row[x * 2..x * 2 + 2].copy_from_slice(&pack_5551(r, g, b, a).to_le_bytes());
                }
                DataFormat::B5G5R5A1UnormPack16 => {
                    dst_row[x * 2..x * 2 + 2].copy_from_slice(&pack_5551(b, g, r, a).to_le_bytes());
                }
                DataFormat::R4G4B4A4UnormPack16 => {
                    dst_row[x * 2..x * 2 + 2].copy_from_slice(&pack_4444(r, g, b, a).to_le_bytes());
                }
                DataFormat::B4G4R4A4UnormPack16 => {
                    dst_row[x * 2..x * 2 + 2].copy_from_slice(&pack_4444(b, g, r, a).to_le_bytes());
                }
                DataFormat::A4R4G4B4UnormPack16 => {
                    // A4 in the UPPER bits
                    dst_row[x * 2..x * 2 + 2].copy_from_slice(&pack_4444(a, r, g, b).to_le_bytes());
                }
                _ => return Err(GaleError::INVALID_FORMAT),
            }
        }
    }

    Ok(())
}

/// Expand or truncate any of the native depth layouts into 32-bit
/// float depth. Strides in pixels.
pub fn convert_to_d32f(
    dst: &mut [u8],
    src: &[u8],
    dst_stride: u32,
    src_stride: u32,
    width: u32,
    height: u32,
    src_format: DataFormat,
) -> Result<()> {
    for y in 0..height as usize {
        let dst_row = &mut dst[y * dst_stride as usize * 4..];
        match src_format {
            DataFormat::D32F | DataFormat::D32FS8 => {
                // Copy-through. D32FS8 readbacks of the depth aspect
                // arrive tightly packed as 32-bit floats.
                let src_row = &src[y * src_stride as usize * 4..];
                dst_row[..width as usize * 4].copy_from_slice(&src_row[..width as usize * 4]);
            }
            DataFormat::D16 => {
                let src_row = &src[y * src_stride as usize * 2..];
                for x in 0..width as usize {
                    let d = u16::from_le_bytes([src_row[x * 2], src_row[x * 2 + 1]]);
                    let f = d as f32 * (1.0 / 65535.0);
                    dst_row[x * 4..x * 4 + 4].copy_from_slice(&f.to_le_bytes());
                }
            }
            DataFormat::D24S8 => {
                let src_row = &src[y * src_stride as usize * 4..];
                for x in 0..width as usize {
                    let w = u32::from_le_bytes([
                        src_row[x * 4],
                        src_row[x * 4 + 1],
                        src_row[x * 4 + 2],
                        src_row[x * 4 + 3],
                    ]);
                    let f = (w & 0x00FF_FFFF) as f32 * (1.0 / 16777215.0);
                    dst_row[x * 4..x * 4 + 4].copy_from_slice(&f.to_le_bytes());
                }
            }
            _ => return Err(GaleError::INVALID_FORMAT),
        }
    }
    Ok(())
}

/// Truncate any of the native depth layouts into 16-bit depth.
/// Strides in pixels.
pub fn convert_to_d16(
    dst: &mut [u8],
    src: &[u8],
    dst_stride: u32,
    src_stride: u32,
    width: u32,
    height: u32,
    src_format: DataFormat,
) -> Result<()> {
    for y in 0..height as usize {
        let dst_row = &mut dst[y * dst_stride as usize * 2..];
        match src_format {
            DataFormat::D16 => {
                let src_row = &src[y * src_stride as usize * 2..];
                dst_row[..width as usize * 2].copy_from_slice(&src_row[..width as usize * 2]);
            }
            DataFormat::D24S8 => {
                let src_row = &src[y * src_stride as usize * 4..];
                for x in 0..width as usize {
                    let w = u32::from_le_bytes([
                        src_row[x * 4],
                        src_row[x * 4 + 1],
                        src_row[x * 4 + 2],
                        src_row[x * 4 + 3],
                    ]);
                    let d = ((w & 0x00FF_FFFF) >> 8) as u16;
                    dst_row[x * 2..x * 2 + 2].copy_from_slice(&d.to_le_bytes());
                }
            }
            DataFormat::D32F | DataFormat::D32FS8 => {
                let src_row = &src[y * src_stride as usize * 4..];
                for x in 0..width as usize {
                    let f = f32::from_le_bytes([
                        src_row[x * 4],
                        src_row[x * 4 + 1],
                        src_row[x * 4 + 2],
                        src_row[x * 4 + 3],
                    ]);
                    let d = (f.max(0.0).min(1.0) * 65535.0) as u16;
                    dst_row[x * 2..x * 2 + 2].copy_from_slice(&d.to_le_bytes());
                }
            }
            _ => return Err(GaleError::INVALID_FORMAT),
        }
    }
    Ok(())
}
