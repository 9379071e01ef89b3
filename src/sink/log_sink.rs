use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread::{self, JoinHandle};

use chrono::SecondsFormat;
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use tracing::{debug, info, warn};

use crate::emitter::MetricsRecord;
use crate::sink::{AppendOutcome, Sink, SinkError};

/// Line layout written by [`LogSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum RecordFormat {
    /// `TCP_MONITOR: sock=... cwnd=... rtt=... bytes_in_flight=... retrans=... ts=...`
    #[default]
    Kernel,
    /// One JSON object per line.
    Json,
}

/// `None` when the record cannot be rendered; callers skip it rather than
/// write a blank line.
pub fn format_line(record: &MetricsRecord, format: RecordFormat) -> Option<String> {
    match format {
        RecordFormat::Kernel => Some(format!(
            "TCP_MONITOR: sock={} cwnd={} rtt={} bytes_in_flight={} retrans={} ts={}",
            record.id,
            record.snapshot.cwnd,
            record.snapshot.smoothed_rtt,
            record.snapshot.bytes_in_flight,
            record.snapshot.retransmissions,
            record.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
        )),
        RecordFormat::Json => match serde_json::to_string(record) {
            Ok(line) => Some(line),
            Err(err) => {
                warn!(conn = %record.id, %err, "record not serialisable");
                None
            }
        },
    }
}

enum LogCommand {
    Record(MetricsRecord),
    Close,
}

// ==========================================
// Append-only log file, one record per line
// ==========================================
/// Hands records to a dedicated writer thread through a bounded channel;
/// the packet path only ever does a `try_send`.
pub struct LogSink {
    path: PathBuf,
    format: RecordFormat,
    capacity: usize,
    tx: OnceLock<Sender<LogCommand>>,
    writer: Mutex<Option<JoinHandle<std::io::Result<u64>>>>,
    closed: AtomicBool,
}

impl LogSink {
    pub fn new(path: impl Into<PathBuf>, format: RecordFormat, capacity: usize) -> Self {
        Self {
            path: path.into(),
            format,
            capacity: capacity.max(1),
            tx: OnceLock::new(),
            writer: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }
}

impl Sink for LogSink {
    fn open(&self) -> Result<(), SinkError> {
        let mut writer = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.tx.get().is_some() {
            return Ok(());
        }

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let (tx, rx) = channel::bounded(self.capacity);
        let format = self.format;
        let handle = thread::Builder::new()
            .name("tap-log-writer".into())
            .spawn(move || write_loop(BufWriter::new(file), rx, format))?;

        *writer = Some(handle);
        let _ = self.tx.set(tx);
        info!(path = %self.path.display(), format = ?self.format, "log sink opened");
        Ok(())
    }

    fn append(&self, record: MetricsRecord) -> AppendOutcome {
        if self.closed.load(Ordering::Acquire) {
            return AppendOutcome::Dropped;
        }
        let Some(tx) = self.tx.get() else {
            return AppendOutcome::Dropped;
        };
        match tx.try_send(LogCommand::Record(record)) {
            Ok(()) => AppendOutcome::Appended,
            Err(_) => AppendOutcome::Dropped,
        }
    }

    fn drain_and_close(&self) -> Result<u64, SinkError> {
        self.closed.store(true, Ordering::Release);
        let handle = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        let Some(handle) = handle else {
            return Ok(0);
        };

        // Close queues behind every accepted record, so the writer drains first
        if let Some(tx) = self.tx.get() {
            let _ = tx.send(LogCommand::Close);
        }
        let written = handle.join().map_err(|_| SinkError::WriterPanicked)??;
        info!(path = %self.path.display(), written, "log sink closed");
        Ok(written)
    }
}

fn write_loop(mut out: BufWriter<File>, rx: Receiver<LogCommand>, format: RecordFormat) -> std::io::Result<u64> {
    let mut written = 0u64;
    let mut skipped = 0u64;
    loop {
        // Flush only when the channel runs dry
        let cmd = match rx.try_recv() {
            Ok(cmd) => cmd,
            Err(TryRecvError::Empty) => {
                out.flush()?;
                match rx.recv() {
                    Ok(cmd) => cmd,
                    Err(_) => break,
                }
            }
            Err(TryRecvError::Disconnected) => break,
        };
        match cmd {
            LogCommand::Record(record) => match format_line(&record, format) {
                Some(line) => {
                    writeln!(out, "{line}")?;
                    written += 1;
                }
                None => skipped += 1,
            },
            LogCommand::Close => break,
        }
    }
    out.flush()?;
    if skipped > 0 {
        warn!(skipped, "records skipped by the log writer");
    }
    debug!(written, "log writer finished");
    Ok(written)
}
