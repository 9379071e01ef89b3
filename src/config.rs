use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;

use crate::sink::{LogSink, RecordFormat, RingSink, Sink, TracingSink};

pub const DEFAULT_COPY_RANGE: u16 = 128;
pub const DEFAULT_QUEUE_MAX_LEN: u32 = 10000;
pub const DEFAULT_RING_CAPACITY: usize = 64 * 1024;
pub const DEFAULT_LOG_CHANNEL_CAPACITY: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct NfqConfig {
    /// Queue numbers the `OUTPUT` rule balances over; one worker per queue.
    pub queues: Range<u16>,
    pub copy_range: u16,
    pub max_queue_len: u32,
    pub fail_open: bool,
}

impl Default for NfqConfig {
    fn default() -> Self {
        Self {
            queues: 0..1,
            copy_range: DEFAULT_COPY_RANGE,
            max_queue_len: DEFAULT_QUEUE_MAX_LEN,
            fail_open: true,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SinkConfig {
    Ring { capacity: usize },
    Log { path: PathBuf, format: RecordFormat, channel_capacity: usize },
    Tracing { channel_capacity: usize },
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig::Ring {
            capacity: DEFAULT_RING_CAPACITY,
        }
    }
}

impl SinkConfig {
    pub fn build(&self) -> Box<dyn Sink> {
        match self {
            SinkConfig::Ring { capacity } => Box::new(RingSink::new(*capacity)),
            SinkConfig::Log {
                path,
                format,
                channel_capacity,
            } => Box::new(LogSink::new(path.clone(), *format, *channel_capacity)),
            SinkConfig::Tracing { channel_capacity } => Box::new(TracingSink::new(*channel_capacity)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TapConfig {
    pub nfq: NfqConfig,
    pub sink: SinkConfig,
    /// Interval of the statistics report; `None` disables the reporter.
    pub report_interval: Option<Duration>,
}
