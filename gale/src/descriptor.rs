// Descriptor-set batching
//
// Draws record packed descriptors into per-layout, per-frame arrays.
// Nothing touches the driver until flush, which runs once per frame
// on the render thread: it walks the pending sets, reuses the
// previous set when the packed bytes match, and allocates the rest in
// small batches.

use ash::vk;

use crate::device::Device;
use crate::resource::next_resource_id;
use crate::resource::ResourceId;
use crate::MAX_INFLIGHT_FRAMES;
use utils::log;

use std::sync::{Arc, Mutex};

/// What lives at each binding of a layout.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BindingType {
    CombinedImageSampler,
    UniformBufferDynamicVertex,
    UniformBufferDynamicAll,
    StorageBufferVertex,
    StorageBufferCompute,
    StorageImageCompute,
}

impl BindingType {
    fn vk_type(&self) -> vk::DescriptorType {
        match self {
            BindingType::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            BindingType::UniformBufferDynamicVertex | BindingType::UniformBufferDynamicAll => {
                vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
            }
            BindingType::StorageBufferVertex | BindingType::StorageBufferCompute => {
                vk::DescriptorType::STORAGE_BUFFER
            }
            BindingType::StorageImageCompute => vk::DescriptorType::STORAGE_IMAGE,
        }
    }

    fn vk_stages(&self, geo_shaders: bool) -> vk::ShaderStageFlags {
        match self {
            BindingType::CombinedImageSampler => vk::ShaderStageFlags::FRAGMENT,
            BindingType::UniformBufferDynamicVertex => vk::ShaderStageFlags::VERTEX,
            BindingType::UniformBufferDynamicAll => {
                let mut stages = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
                if geo_shaders {
                    stages |= vk::ShaderStageFlags::GEOMETRY;
                }
                stages
            }
            BindingType::StorageBufferVertex => vk::ShaderStageFlags::VERTEX,
            BindingType::StorageBufferCompute | BindingType::StorageImageCompute => {
                vk::ShaderStageFlags::COMPUTE
            }
        }
    }
}

/// One packed descriptor. Dedup compares these by value.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PackedDescriptor {
    /// Binding intentionally left empty; skipped at write time.
    Empty,
    Image {
        view: vk::ImageView,
        sampler: vk::Sampler,
    },
    Buffer {
        buffer: vk::Buffer,
        offset: u32,
        range: u32,
    },
}

#[derive(Debug, Copy, Clone)]
pub struct PendingDescSet {
    /// Offset into the frame's packed descriptor array.
    pub offset: u32,
    pub count: u8,
    pub set: vk::DescriptorSet,
}

/// Sets are allocated in groups of this many identical layouts.
const ALLOC_BATCH: usize = 8;

/// Whether pending set `index` packs the exact same descriptors as
/// the one before it (within the batch starting at `start`), so its
/// native set can be reused.
pub(crate) fn dedups_against_previous(
    desc_data: &[PackedDescriptor],
    desc_sets: &[PendingDescSet],
    start: usize,
    index: usize,
) -> bool {
    if index <= start {
        return false;
    }
    let prev = desc_sets[index - 1];
    let cur = desc_sets[index];
    if prev.count != cur.count {
        return false;
    }
    let a = &desc_data[cur.offset as usize..cur.offset as usize + cur.count as usize];
    let b = &desc_data[prev.offset as usize..prev.offset as usize + prev.count as usize];
    a == b
}

/// A growable pool of descriptor pools, reset wholesale each frame.
struct DescSetPool {
    pools: Vec<vk::DescriptorPool>,
    /// Index of the pool we're currently allocating from.
    cur: usize,
    sets_per_pool: u32,
}

impl DescSetPool {
    fn new() -> Self {
        Self {
            pools: Vec::new(),
            cur: 0,
            sets_per_pool: 1024,
        }
    }

    fn add_pool(&mut self, dev: &Device, binding_types: &[BindingType]) {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for bt in binding_types {
            let ty = bt.vk_type();
            match sizes.iter_mut().find(|s| s.ty == ty) {
                Some(s) => s.descriptor_count += self.sets_per_pool,
                None => sizes.push(vk::DescriptorPoolSize {
                    ty,
                    descriptor_count: self.sets_per_pool,
                }),
            }
        }

        let info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(sizes.as_slice())
            .max_sets(self.sets_per_pool);

        let pool = unsafe { dev.dev.create_descriptor_pool(&info, None).unwrap() };
        self.pools.push(pool);
    }

    fn reset(&mut self, dev: &Device) {
        for pool in self.pools.iter() {
            unsafe {
                dev.dev
                    .reset_descriptor_pool(*pool, vk::DescriptorPoolResetFlags::empty())
                    .unwrap();
            }
        }
        self.cur = 0;
    }

    /// Allocate `count` sets of `layout`, moving to a fresh pool when
    /// the current one runs dry.
    fn allocate(
        &mut self,
        dev: &Device,
        binding_types: &[BindingType],
        layout: vk::DescriptorSetLayout,
        count: usize,
    ) -> Vec<vk::DescriptorSet> {
        if self.pools.is_empty() {
            self.add_pool(dev, binding_types);
        }

        let layouts = vec![layout; count];
        loop {
            let info = vk::DescriptorSetAllocateInfo::builder()
                .descriptor_pool(self.pools[self.cur])
                .set_layouts(layouts.as_slice())
                .build();

            match unsafe { dev.dev.allocate_descriptor_sets(&info) } {
                Ok(sets) => return sets,
                Err(_) => {
                    // Pool exhausted; grab the next one, creating it
                    // if we've never spilled this far before.
                    self.cur += 1;
                    if self.cur >= self.pools.len() {
                        log::debug!("descriptor pool exhausted, adding pool");
                        self.add_pool(dev, binding_types);
                    }
                }
            }
        }
    }

    fn destroy(&mut self, dev: &Device) {
        for pool in self.pools.drain(..) {
            unsafe { dev.dev.destroy_descriptor_pool(pool, None) };
        }
    }
}

/// Descriptor bookkeeping for one frame slot of one layout.
pub struct LayoutFrameData {
    pool: DescSetPool,
    desc_data: Vec<PackedDescriptor>,
    desc_sets: Vec<PendingDescSet>,
    /// How many pending sets previous flushes in this frame already
    /// handled (mid-frame syncs flush more than once).
    flushed: usize,
}

impl LayoutFrameData {
    fn new() -> Self {
        Self {
            pool: DescSetPool::new(),
            desc_data: Vec::new(),
            desc_sets: Vec::new(),
            flushed: 0,
        }
    }
}

/// Running totals surfaced to the profiler.
#[derive(Debug, Default, Copy, Clone)]
pub struct DescriptorStats {
    pub written: usize,
    pub deduped: usize,
}

/// A pipeline layout plus the per-frame descriptor machinery for it.
pub struct PipelineLayout {
    pub pl_id: ResourceId,
    pub pl_tag: String,
    pub pl_binding_types: Vec<BindingType>,
    pub pl_desc_set_layout: vk::DescriptorSetLayout,
    pub pl_pipeline_layout: vk::PipelineLayout,
    pl_frame_data: Vec<Mutex<LayoutFrameData>>,
}

impl PipelineLayout {
    pub fn new(
        dev: &Device,
        binding_types: &[BindingType],
        geo_shaders: bool,
        tag: &str,
    ) -> Arc<Self> {
        let mut bindings = Vec::new();
        for (i, bt) in binding_types.iter().enumerate() {
            bindings.push(
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(i as u32)
                    .descriptor_type(bt.vk_type())
                    .stage_flags(bt.vk_stages(geo_shaders))
                    .descriptor_count(1)
                    .build(),
            );
        }

        let dsl_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings.as_slice());
        let desc_set_layout = unsafe {
            dev.dev
                .create_descriptor_set_layout(&dsl_info, None)
                .unwrap()
        };

        // Small push constant block shared by all pipelines on this
        // layout.
        let push_ranges = [vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            offset: 0,
            size: 64,
        }];
        let set_layouts = [desc_set_layout];
        let pl_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_ranges);
        let pipeline_layout = unsafe { dev.dev.create_pipeline_layout(&pl_info, None).unwrap() };

        let mut frame_data = Vec::new();
        for _ in 0..MAX_INFLIGHT_FRAMES {
            frame_data.push(Mutex::new(LayoutFrameData::new()));
        }

        Arc::new(Self {
            pl_id: next_resource_id(),
            pl_tag: tag.to_string(),
            pl_binding_types: binding_types.to_vec(),
            pl_desc_set_layout: desc_set_layout,
            pl_pipeline_layout: pipeline_layout,
            pl_frame_data: frame_data,
        })
    }

    /// Record a pending set for a draw. Returns the index the draw
    /// command uses to find its native set after flush.
    ///
    /// Recording thread only.
    pub fn push_desc_set(&self, frame: usize, descriptors: &[PackedDescriptor]) -> u32 {
        debug_assert!(descriptors.len() <= self.pl_binding_types.len());
        let mut data = self.pl_frame_data[frame].lock().unwrap();

        let offset = data.desc_data.len() as u32;
        data.desc_data.extend_from_slice(descriptors);
        data.desc_sets.push(PendingDescSet {
            offset,
            count: descriptors.len() as u8,
            set: vk::DescriptorSet::null(),
        });
        (data.desc_sets.len() - 1) as u32
    }

    /// The native set for a flushed pending-set index.
    pub fn set_for(&self, frame: usize, index: u32) -> vk::DescriptorSet {
        let data = self.pl_frame_data[frame].lock().unwrap();
        data.desc_sets[index as usize].set
    }

    /// Write all pending sets for `frame`. Render thread, before the
    /// frame's draws are recorded.
    pub fn flush_desc_sets(&self, dev: &Device, frame: usize) -> DescriptorStats {
        let mut data = self.pl_frame_data[frame].lock().unwrap();
        let data = &mut *data;
        let start = data.flushed;

        if start == 0 {
            data.pool.reset(dev);
        }

        let mut stats = DescriptorStats::default();
        let mut set_cache: Vec<vk::DescriptorSet> = Vec::new();

        let mut image_infos = [vk::DescriptorImageInfo::default(); 16];
        let mut buffer_infos = [vk::DescriptorBufferInfo::default(); 16];

        for index in start..data.desc_sets.len() {
            // Look back one set: adjacent identical descriptors reuse
            // the previous native set.
            if dedups_against_previous(&data.desc_data, &data.desc_sets, start, index) {
                data.desc_sets[index].set = data.desc_sets[index - 1].set;
                stats.deduped += 1;
                continue;
            }

            if set_cache.is_empty() {
                set_cache = data.pool.allocate(
                    dev,
                    &self.pl_binding_types,
                    self.pl_desc_set_layout,
                    ALLOC_BATCH,
                );
            }
            let set = set_cache.pop().unwrap();
            data.desc_sets[index].set = set;

            // Write only the non-null bindings.
            let d = data.desc_sets[index];
            let descs =
                &data.desc_data[d.offset as usize..d.offset as usize + d.count as usize];

            let mut writes = Vec::new();
            let mut num_images = 0;
            let mut num_buffers = 0;
            for (binding, desc) in descs.iter().enumerate() {
                match desc {
                    PackedDescriptor::Empty => continue,
                    PackedDescriptor::Image { view, sampler } => {
                        debug_assert!(*view != vk::ImageView::null());
                        image_infos[num_images] = vk::DescriptorImageInfo {
                            image_layout: match self.pl_binding_types[binding] {
                                BindingType::StorageImageCompute => vk::ImageLayout::GENERAL,
                                _ => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                            },
                            image_view: *view,
                            sampler: *sampler,
                        };
                        writes.push(
                            vk::WriteDescriptorSet::builder()
                                .dst_set(set)
                                .dst_binding(binding as u32)
                                .descriptor_type(self.pl_binding_types[binding].vk_type())
                                .image_info(std::slice::from_ref(&image_infos[num_images]))
                                .build(),
                        );
                        num_images += 1;
                    }
                    PackedDescriptor::Buffer {
                        buffer,
                        offset,
                        range,
                    } => {
                        debug_assert!(*buffer != vk::Buffer::null());
                        // Dynamic uniform bindings bind at offset
                        // zero, the true offset arrives at draw time.
                        let static_offset = match self.pl_binding_types[binding] {
                            BindingType::UniformBufferDynamicVertex
                            | BindingType::UniformBufferDynamicAll => 0,
                            _ => *offset,
                        };
                        buffer_infos[num_buffers] = vk::DescriptorBufferInfo {
                            buffer: *buffer,
                            offset: static_offset as u64,
                            range: *range as u64,
                        };
                        writes.push(
                            vk::WriteDescriptorSet::builder()
                                .dst_set(set)
                                .dst_binding(binding as u32)
                                .descriptor_type(self.pl_binding_types[binding].vk_type())
                                .buffer_info(std::slice::from_ref(&buffer_infos[num_buffers]))
                                .build(),
                        );
                        num_buffers += 1;
                    }
                }
            }

            unsafe { dev.dev.update_descriptor_sets(writes.as_slice(), &[]) };
            stats.written += 1;
        }

        data.flushed = data.desc_sets.len();
        stats
    }

    /// Throw away a frame slot's recordings. BeginFrame, after the
    /// slot's fence cleared.
    pub fn reset_frame(&self, frame: usize) {
        let mut data = self.pl_frame_data[frame].lock().unwrap();
        data.desc_data.clear();
        data.desc_sets.clear();
        data.flushed = 0;
    }

    pub(crate) fn destroy(&self, dev: &Device) {
        if dev.skip_destroys() {
            return;
        }
        for fd in self.pl_frame_data.iter() {
            fd.lock().unwrap().pool.destroy(dev);
        }
        unsafe {
            dev.dev.destroy_pipeline_layout(self.pl_pipeline_layout, None);
            dev.dev
                .destroy_descriptor_set_layout(self.pl_desc_set_layout, None);
        }
    }
}
