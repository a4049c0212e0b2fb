//! Client tuning knobs.

use std::time::Duration;

/// Default maximum message size offered in `TVersion`
pub const DEFAULT_MSIZE: u32 = 8192;

#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum message size; also bounds the frames the reader accepts
    pub msize: u32,
    /// Interval after which an idle read is re-armed
    pub read_timeout: Duration,
    /// Write deadline for requests whose context has none
    pub write_timeout: Duration,
    /// Capacity of the handoff between callers and the dispatcher
    pub queue_depth: usize,
    /// Number of tags in the pool, i.e. the most requests in flight at once
    pub max_tags: u16,
    /// Send `TFlush` for requests whose caller gave up waiting
    pub flush_on_cancel: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            msize: DEFAULT_MSIZE,
            read_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
            queue_depth: 64,
            max_tags: u16::MAX,
            flush_on_cancel: true,
        }
    }
}

impl Config {
    pub fn msize(mut self, msize: u32) -> Self {
        self.msize = msize;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    pub fn max_tags(mut self, max_tags: u16) -> Self {
        self.max_tags = max_tags;
        self
    }

    pub fn flush_on_cancel(mut self, flush: bool) -> Self {
        self.flush_on_cancel = flush;
        self
    }

    /// Largest frame the reader accepts before treating the stream as corrupt
    pub(crate) fn max_frame_length(&self) -> usize {
        (self.msize as usize).max(DEFAULT_MSIZE as usize)
    }
}
