//! Telemetry sinks.
//!
//! A sink receives [`MetricsRecord`]s from every execution context at once.
//! `append` must never block: a sink that cannot take a record right now says
//! so with [`AppendOutcome::Dropped`] and the caller moves on.

use crate::emitter::MetricsRecord;

mod log_sink;
mod ring_sink;
mod tracing_sink;

pub use log_sink::{LogSink, RecordFormat, format_line};
pub use ring_sink::RingSink;
pub use tracing_sink::TracingSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    Dropped,
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("sink writer thread panicked")]
    WriterPanicked,
}

pub trait Sink: Send + Sync {
    /// Prepares the sink before the first append. Called once by the tap.
    fn open(&self) -> Result<(), SinkError> {
        Ok(())
    }

    fn append(&self, record: MetricsRecord) -> AppendOutcome;

    /// Flushes what was accepted and refuses further appends. Returns the
    /// number of records the sink holds or wrote.
    fn drain_and_close(&self) -> Result<u64, SinkError>;
}

/// Lets the lifecycle pick a sink at runtime from configuration.
impl Sink for Box<dyn Sink> {
    fn open(&self) -> Result<(), SinkError> {
        (**self).open()
    }

    fn append(&self, record: MetricsRecord) -> AppendOutcome {
        (**self).append(record)
    }

    fn drain_and_close(&self) -> Result<u64, SinkError> {
        (**self).drain_and_close()
    }
}
