// Per-frame linear allocators
//
// Push buffers hold transient vertex/index/uniform/staging data for
// one frame. Reset happens at frame begin, once the frame's fence has
// cleared, so nothing here ever aliases across frames.

use ash::vk;

use crate::device::Device;
use crate::{GaleError, Result};
use utils::log;

use std::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PushBufferKind {
    /// Host visible, mapped while recording.
    CpuToGpu,
    /// Device local. Only `allocate` works, there is no pointer to
    /// write through.
    GpuOnly,
}

fn round_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

/// Where a push landed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct ChunkAlloc {
    pub chunk: usize,
    pub offset: usize,
    /// Set when a chunk of this size must be created at `chunk`.
    pub new_chunk: Option<usize>,
}

/// The pure cursor arithmetic of a push buffer, kept free of any
/// driver types so the offset contracts can be tested directly.
#[derive(Debug, Clone)]
pub(crate) struct ChunkCursor {
    /// Nominal chunk size; big allocations may create larger chunks.
    pub chunk_size: usize,
    /// Actual size of every chunk, in order.
    pub chunks: Vec<usize>,
    pub cur: usize,
    pub offset: usize,
}

impl ChunkCursor {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            chunks: vec![chunk_size],
            cur: 0,
            offset: 0,
        }
    }

    pub fn begin(&mut self) {
        self.cur = 0;
        self.offset = 0;
    }

    pub fn total_size(&self) -> usize {
        self.chunks.iter().sum()
    }

    /// Collapse to a single chunk sized to the sum of the previous
    /// ones. Returns the new size, or None if there was only one
    /// chunk and nothing needs to change.
    pub fn defragment(&mut self) -> Option<usize> {
        if self.chunks.len() <= 1 {
            return None;
        }
        let total = self.total_size();
        self.chunks = vec![total];
        self.cur = 0;
        self.offset = 0;
        Some(total)
    }

    /// Reserve `size` bytes at `align` (1 for the plain push path;
    /// the cursor always rounds the tail up to 4 bytes).
    pub fn allocate(&mut self, size: usize, align: usize) -> ChunkAlloc {
        if align > 1 {
            self.offset = round_up(self.offset, align);
        }

        let mut new_chunk = None;
        if self.offset + size > self.chunks[self.cur] {
            // Transition to the next chunk, growing one if the next
            // chunk doesn't exist or can't hold this allocation.
            self.cur += 1;
            if self.cur >= self.chunks.len() || self.chunks[self.cur] < size {
                let sz = std::cmp::max(self.chunk_size, round_up(size, 4));
                self.chunks.insert(self.cur, sz);
                new_chunk = Some(sz);
            }
            self.offset = 0;
        }

        let out = self.offset;
        self.offset += round_up(size, 4);

        ChunkAlloc {
            chunk: self.cur,
            offset: out,
            new_chunk,
        }
    }
}

struct PushChunk {
    c_buffer: vk::Buffer,
    c_memory: vk::DeviceMemory,
}

/// Simple incrementing allocator over one or more native buffers.
///
/// Use these to push vertex, index and uniform data. There is one per
/// usage kind per in-flight frame; make sure not to reset until the
/// fence from the frame that used it has completed.
pub struct PushBuffer {
    pb_dev: Arc<Device>,
    pb_name: &'static str,
    pb_usage: vk::BufferUsageFlags,
    pb_kind: PushBufferKind,
    pb_chunks: Vec<PushChunk>,
    pb_cursor: ChunkCursor,
    /// Mapped pointer of the current chunk, null outside
    /// begin/end or for GpuOnly buffers.
    pb_write_ptr: *mut u8,
}

// The write pointer is only dereferenced by the recording thread
// between begin and end; the struct itself moves between threads with
// the frame slot.
unsafe impl Send for PushBuffer {}

impl PushBuffer {
    pub fn new(
        dev: Arc<Device>,
        name: &'static str,
        chunk_size: usize,
        usage: vk::BufferUsageFlags,
        kind: PushBufferKind,
    ) -> Result<Self> {
        let mut ret = Self {
            pb_dev: dev,
            pb_name: name,
            pb_usage: usage,
            pb_kind: kind,
            pb_chunks: Vec::new(),
            pb_cursor: ChunkCursor::new(chunk_size),
            pb_write_ptr: std::ptr::null_mut(),
        };
        let chunk = ret.create_chunk(chunk_size)?;
        ret.pb_chunks.push(chunk);
        Ok(ret)
    }

    fn memory_flags(&self) -> vk::MemoryPropertyFlags {
        match self.pb_kind {
            PushBufferKind::CpuToGpu => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
            PushBufferKind::GpuOnly => vk::MemoryPropertyFlags::DEVICE_LOCAL,
        }
    }

    fn create_chunk(&self, size: usize) -> Result<PushChunk> {
        let (buffer, memory, _) = self
            .pb_dev
            .create_buffer_with_size(self.pb_usage, self.memory_flags(), size as u64)
            .map_err(|e| {
                // Allocation failure here is not recoverable for the
                // frame, report it loudly.
                self.pb_dev
                    .report_error("pushbuffer", &format!("{}: chunk alloc failed", self.pb_name));
                e
            })?;
        Ok(PushChunk {
            c_buffer: buffer,
            c_memory: memory,
        })
    }

    fn map_current(&mut self) -> Result<()> {
        if self.pb_kind != PushBufferKind::CpuToGpu {
            return Ok(());
        }
        let chunk = &self.pb_chunks[self.pb_cursor.cur];
        unsafe {
            self.pb_write_ptr = self
                .pb_dev
                .dev
                .map_memory(chunk.c_memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .or(Err(GaleError::OUT_OF_MEMORY))? as *mut u8;
        }
        Ok(())
    }

    fn unmap_current(&mut self) {
        if self.pb_write_ptr.is_null() {
            return;
        }
        let chunk = &self.pb_chunks[self.pb_cursor.cur];
        unsafe {
            self.pb_dev.dev.unmap_memory(chunk.c_memory);
        }
        self.pb_write_ptr = std::ptr::null_mut();
    }

    /// Begin a frame: reset the cursor, defragment if the last frame
    /// spilled into extra chunks, and map the first chunk.
    ///
    /// Render thread only, and only after the frame's fence cleared.
    pub fn begin(&mut self) -> Result<()> {
        debug_assert!(self.pb_write_ptr.is_null());

        if let Some(total) = self.pb_cursor.defragment() {
            log::debug!(
                "pushbuffer {}: defragmenting {} chunks into {} bytes",
                self.pb_name,
                self.pb_chunks.len(),
                total
            );
            for chunk in self.pb_chunks.drain(..) {
                unsafe {
                    self.pb_dev.dev.destroy_buffer(chunk.c_buffer, None);
                    self.pb_dev.dev.free_memory(chunk.c_memory, None);
                }
            }
            let chunk = self.create_chunk(total)?;
            self.pb_chunks.push(chunk);
        } else {
            self.pb_cursor.begin();
        }

        self.map_current()
    }

    /// End a frame: unmap whatever chunk is current.
    pub fn end(&mut self) {
        self.unmap_current();
    }

    /// Reserve space without writing. This is the only path usable on
    /// GpuOnly buffers. Returns the buffer to bind and the offset
    /// into it.
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<(vk::Buffer, u32)> {
        let prev_chunk = self.pb_cursor.cur;
        let alloc = self.pb_cursor.allocate(size, align);

        if let Some(new_size) = alloc.new_chunk {
            let chunk = self.create_chunk(new_size)?;
            self.pb_chunks.insert(alloc.chunk, chunk);
        }
        if alloc.chunk != prev_chunk && !self.pb_write_ptr.is_null() {
            // We moved to a different chunk mid-frame; shift the
            // mapping over. The cursor already points at the new
            // chunk so the previous one is unmapped by hand.
            let prev = &self.pb_chunks[prev_chunk];
            unsafe { self.pb_dev.dev.unmap_memory(prev.c_memory) };
            self.pb_write_ptr = std::ptr::null_mut();
            self.map_current()?;
        }

        Ok((self.pb_chunks[alloc.chunk].c_buffer, alloc.offset as u32))
    }

    /// Copy `data` into the buffer, 4-byte aligned.
    pub fn push(&mut self, data: &[u8]) -> Result<(vk::Buffer, u32)> {
        self.push_aligned(data, 4)
    }

    /// Copy `data` into the buffer at the given alignment.
    pub fn push_aligned(&mut self, data: &[u8], align: usize) -> Result<(vk::Buffer, u32)> {
        debug_assert!(self.pb_kind == PushBufferKind::CpuToGpu);
        let (buf, offset) = self.allocate(data.len(), align)?;
        debug_assert!(!self.pb_write_ptr.is_null());
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.pb_write_ptr.add(offset as usize),
                data.len(),
            );
        }
        Ok((buf, offset))
    }

    /// Number of chunks currently backing this buffer.
    pub fn chunk_count(&self) -> usize {
        self.pb_chunks.len()
    }

    /// Bytes consumed in the current chunk.
    pub fn offset(&self) -> usize {
        self.pb_cursor.offset
    }

    pub fn total_size(&self) -> usize {
        self.pb_cursor.total_size()
    }
}

impl Drop for PushBuffer {
    fn drop(&mut self) {
        if self.pb_dev.skip_destroys() {
            return;
        }
        self.unmap_current();
        for chunk in self.pb_chunks.drain(..) {
            unsafe {
                self.pb_dev.dev.destroy_buffer(chunk.c_buffer, None);
                self.pb_dev.dev.free_memory(chunk.c_memory, None);
            }
        }
    }
}
