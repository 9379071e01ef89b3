use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, info};

use crate::emitter::MetricsRecord;
use crate::sink::{AppendOutcome, Sink, SinkError};

enum TraceCommand {
    Record(MetricsRecord),
    Close,
}

/// Emits each record as a `tracing` event under the `tcp_monitor` target.
///
/// Subscribers may write to stderr or a file, so events are produced on a
/// dedicated thread; the packet path only does a `try_send` and a full
/// channel drops the record.
pub struct TracingSink {
    capacity: usize,
    tx: OnceLock<Sender<TraceCommand>>,
    emitter: Mutex<Option<JoinHandle<u64>>>,
    closed: AtomicBool,
}

impl TracingSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tx: OnceLock::new(),
            emitter: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }
}

impl Sink for TracingSink {
    fn open(&self) -> Result<(), SinkError> {
        let mut emitter = self.emitter.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.tx.get().is_some() {
            return Ok(());
        }

        let (tx, rx) = channel::bounded(self.capacity);
        let handle = thread::Builder::new()
            .name("tap-trace-emitter".into())
            .spawn(move || emit_loop(rx))?;

        *emitter = Some(handle);
        let _ = self.tx.set(tx);
        info!(capacity = self.capacity, "tracing sink opened");
        Ok(())
    }

    fn append(&self, record: MetricsRecord) -> AppendOutcome {
        if self.closed.load(Ordering::Acquire) {
            return AppendOutcome::Dropped;
        }
        let Some(tx) = self.tx.get() else {
            return AppendOutcome::Dropped;
        };
        match tx.try_send(TraceCommand::Record(record)) {
            Ok(()) => AppendOutcome::Appended,
            Err(_) => AppendOutcome::Dropped,
        }
    }

    fn drain_and_close(&self) -> Result<u64, SinkError> {
        self.closed.store(true, Ordering::Release);
        let handle = self.emitter.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        let Some(handle) = handle else {
            return Ok(0);
        };

        if let Some(tx) = self.tx.get() {
            let _ = tx.send(TraceCommand::Close);
        }
        let emitted = handle.join().map_err(|_| SinkError::WriterPanicked)?;
        info!(emitted, "tracing sink closed");
        Ok(emitted)
    }
}

fn emit_loop(rx: Receiver<TraceCommand>) -> u64 {
    let mut emitted = 0u64;
    while let Ok(TraceCommand::Record(record)) = rx.recv() {
        info!(
            target: "tcp_monitor",
            sock = %record.id,
            cwnd = record.snapshot.cwnd,
            rtt = record.snapshot.smoothed_rtt,
            bytes_in_flight = record.snapshot.bytes_in_flight,
            retrans = record.snapshot.retransmissions,
            ts = %record.timestamp,
            "TCP_MONITOR"
        );
        emitted += 1;
    }
    debug!(emitted, "trace emitter finished");
    emitted
}
