use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::queue::ArrayQueue;

use crate::emitter::MetricsRecord;
use crate::sink::{AppendOutcome, Sink, SinkError};

struct Ring {
    records: ArrayQueue<MetricsRecord>,
    closed: AtomicBool,
}

// ==========================================
// Bounded in-memory ring
// ==========================================
/// Lock-free bounded MPMC buffer. When full, new records are dropped; the
/// records already held are never overwritten. Clones share the same ring,
/// so a consumer can keep a clone while the tap owns another.
#[derive(Clone)]
pub struct RingSink {
    inner: Arc<Ring>,
}

impl RingSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Ring {
                records: ArrayQueue::new(capacity.max(1)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.records.is_empty()
    }

    /// Removes and returns every buffered record, oldest first.
    pub fn take_all(&self) -> Vec<MetricsRecord> {
        let mut out = Vec::with_capacity(self.inner.records.len());
        while let Some(record) = self.inner.records.pop() {
            out.push(record);
        }
        out
    }
}

impl Sink for RingSink {
    fn append(&self, record: MetricsRecord) -> AppendOutcome {
        if self.inner.closed.load(Ordering::Acquire) {
            return AppendOutcome::Dropped;
        }
        match self.inner.records.push(record) {
            Ok(()) => AppendOutcome::Appended,
            Err(_) => AppendOutcome::Dropped,
        }
    }

    fn drain_and_close(&self) -> Result<u64, SinkError> {
        self.inner.closed.store(true, Ordering::Release);
        Ok(self.inner.records.len() as u64)
    }
}
