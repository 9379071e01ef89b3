use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::connection_id::ConnectionId;
use crate::extractor::CongestionSnapshot;
use crate::sink::{AppendOutcome, Sink};
use crate::stats::TapStats;

/// One observation of one connection, tied to the packet that triggered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsRecord {
    #[serde(flatten)]
    pub id: ConnectionId,
    #[serde(flatten)]
    pub snapshot: CongestionSnapshot,
    pub timestamp: DateTime<Utc>,
}

impl MetricsRecord {
    pub fn new(id: ConnectionId, snapshot: CongestionSnapshot, timestamp: DateTime<Utc>) -> Self {
        Self { id, snapshot, timestamp }
    }
}

// ==========================================
// Emitter: record -> sink, best effort
// ==========================================
pub struct MetricsEmitter<S> {
    sink: Arc<S>,
    stats: Arc<TapStats>,
}

impl<S: Sink> MetricsEmitter<S> {
    pub fn new(sink: Arc<S>, stats: Arc<TapStats>) -> Self {
        Self { sink, stats }
    }

    /// Never retries: a record the sink refuses is counted and forgotten.
    pub fn emit(&self, id: ConnectionId, snapshot: CongestionSnapshot, captured_at: DateTime<Utc>) -> AppendOutcome {
        let outcome = self.sink.append(MetricsRecord::new(id, snapshot, captured_at));
        match outcome {
            AppendOutcome::Appended => self.stats.record_emitted(),
            AppendOutcome::Dropped => self.stats.record_dropped(),
        }
        outcome
    }
}
