// GPU timestamp profiling
//
// Each frame slot carries a query pool; the runner drops a timestamp
// after every step. Results are pulled when the slot comes around
// again, after its fence has cleared, and formatted into a summary
// the caller can display.

use ash::vk;

use crate::device::Device;

pub const MAX_TIMESTAMP_QUERIES: u32 = 128;

pub struct ProfileContext {
    pub enabled: bool,
    pub timestamps_enabled: bool,
    query_pool: vk::QueryPool,
    /// One description per written timestamp, in order.
    pub timestamp_descriptions: Vec<String>,
    pub summary: String,
    /// Counts surfaced by the descriptor batcher.
    pub descriptors_written: usize,
    pub descriptors_deduped: usize,
}

impl ProfileContext {
    pub fn new() -> Self {
        Self {
            enabled: false,
            timestamps_enabled: false,
            query_pool: vk::QueryPool::null(),
            timestamp_descriptions: Vec::new(),
            summary: String::new(),
            descriptors_written: 0,
            descriptors_deduped: 0,
        }
    }

    /// Called at BeginFrame, after the fence wait. Pulls the previous
    /// go-around's queries, formats the summary, and resets for this
    /// frame. `valid_bits`/`period` come from the queue family.
    pub fn begin_frame(
        &mut self,
        dev: &Device,
        enabled: bool,
        valid_bits: u32,
        period: f32,
        init_cmd: vk::CommandBuffer,
    ) {
        self.enabled = enabled;
        self.timestamps_enabled = enabled && valid_bits > 0;

        if !self.timestamps_enabled {
            self.timestamp_descriptions.clear();
            self.summary.clear();
            return;
        }

        if self.query_pool == vk::QueryPool::null() {
            let info = vk::QueryPoolCreateInfo::builder()
                .query_type(vk::QueryType::TIMESTAMP)
                .query_count(MAX_TIMESTAMP_QUERIES);
            self.query_pool = unsafe { dev.dev.create_query_pool(&info, None).unwrap() };
        } else if self.timestamp_descriptions.len() >= 2 {
            // Pull the results of the previous use of this slot.
            let count = self.timestamp_descriptions.len() as u32;
            let mut results = vec![0u64; count as usize];
            let res = unsafe {
                dev.dev.get_query_pool_results(
                    self.query_pool,
                    0,
                    count,
                    results.as_mut_slice(),
                    vk::QueryResultFlags::TYPE_64,
                )
            };

            self.summary.clear();
            if res.is_ok() {
                let mask: u64 = if valid_bits == 64 {
                    !0
                } else {
                    (1u64 << valid_bits) - 1
                };
                let to_ms = |begin: u64, end: u64| -> f64 {
                    (((end & mask).wrapping_sub(begin & mask)) as f64) * period as f64 / 1_000_000.0
                };

                let total = to_ms(results[0], results[count as usize - 1]);
                self.summary
                    .push_str(&format!("Total GPU time: {:.3} ms\n", total));
                for i in 1..count as usize {
                    self.summary.push_str(&format!(
                        "{:.3} ms - {}\n",
                        to_ms(results[i - 1], results[i]),
                        self.timestamp_descriptions[i]
                    ));
                }
                self.summary.push_str(&format!(
                    "descriptors written: {}, deduped: {}\n",
                    self.descriptors_written, self.descriptors_deduped
                ));
            }
        }

        self.timestamp_descriptions.clear();
        self.descriptors_written = 0;
        self.descriptors_deduped = 0;

        unsafe {
            dev.dev
                .cmd_reset_query_pool(init_cmd, self.query_pool, 0, MAX_TIMESTAMP_QUERIES);
        }
        // The first timestamp anchors the frame.
        self.write_timestamp(dev, init_cmd, "initial".to_string());
    }

    /// Drop a timestamp at the bottom of the pipe with a description
    /// for the summary.
    pub fn write_timestamp(&mut self, dev: &Device, cbuf: vk::CommandBuffer, desc: String) {
        if !self.timestamps_enabled {
            return;
        }
        if self.timestamp_descriptions.len() as u32 + 1 >= MAX_TIMESTAMP_QUERIES {
            return;
        }
        unsafe {
            dev.dev.cmd_write_timestamp(
                cbuf,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                self.query_pool,
                self.timestamp_descriptions.len() as u32,
            );
        }
        self.timestamp_descriptions.push(desc);
    }

    pub fn destroy(&mut self, dev: &Device) {
        if self.query_pool != vk::QueryPool::null() && !dev.skip_destroys() {
            unsafe { dev.dev.destroy_query_pool(self.query_pool, None) };
        }
        self.query_pool = vk::QueryPool::null();
    }
}
