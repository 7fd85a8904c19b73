// A set of helper structs for common operations
pub mod timing;
#[macro_use]
pub mod logging;
pub mod log;
pub mod region;

use std::slice;

extern crate anyhow;
pub use anyhow::{anyhow, Context, Error, Result};

/// Represents a raw pointer to a region of memory
/// containing an image buffer
///
/// *Does Not* free the memory when it is dropped. This is
/// used to hand pixel data across the API boundary without
/// copying it.
#[derive(Debug)]
pub struct MemImage {
    ptr: *const u8,
    /// size of the pixel elements, in bytes
    pub element_size: usize,
    pub width: usize,
    pub height: usize,
    /// The number of pixels between the start of one row and the
    /// next. If no stride was specified, this will default to 0,
    /// meaning the pixels are tightly packed.
    pub stride: u32,
}

#[allow(dead_code)]
impl MemImage {
    pub fn as_slice(&self) -> &[u8] {
        if !self.ptr.is_null() {
            unsafe {
                return slice::from_raw_parts(
                    self.ptr,
                    self.width * self.height * self.element_size,
                );
            }
        } else {
            panic!("Trying to dereference null pointer");
        }
    }

    pub fn new(ptr: *const u8, element_size: usize, width: usize, height: usize) -> MemImage {
        MemImage {
            ptr: ptr,
            element_size: element_size,
            width: width,
            height: height,
            stride: 0,
        }
    }
}

// While the MemImage is valid we can treat it like a slice
unsafe impl Send for MemImage {}
unsafe impl Sync for MemImage {}
