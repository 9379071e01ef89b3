use std::sync::Arc;

use chrono::Utc;
use tracing::trace;

use crate::emitter::MetricsEmitter;
use crate::extractor::{self, ExtractError};
use crate::intercept::{PacketCallback, Verdict};
use crate::packet_view::PacketView;
use crate::resolver::FlowResolver;
use crate::sink::Sink;
use crate::stats::TapStats;
use crate::table::ConnectionTable;

// ==========================================
// resolve -> extract -> emit, then always accept
// ==========================================
/// The callback registered on the interception point. It holds no
/// per-packet state, so any number of contexts may run it at once.
pub struct TapPipeline<T, S> {
    resolver: FlowResolver<T>,
    emitter: MetricsEmitter<S>,
    stats: Arc<TapStats>,
}

impl<T: ConnectionTable, S: Sink> TapPipeline<T, S> {
    pub fn new(table: T, sink: Arc<S>, stats: Arc<TapStats>) -> Self {
        Self {
            resolver: FlowResolver::new(table),
            emitter: MetricsEmitter::new(sink, stats.clone()),
            stats,
        }
    }

    fn observe(&self, packet: &PacketView<'_>) {
        // 1. Packet -> connection
        let Some(resolved) = self.resolver.resolve(packet) else {
            self.stats.record_not_applicable();
            return;
        };

        // 2. One consistent read of the live state
        let captured_at = Utc::now();
        let snapshot = match extractor::extract(&resolved.state) {
            Ok(snapshot) => snapshot,
            Err(ExtractError::ConnectionClosed) => {
                trace!(conn = %resolved.id, context = packet.context, "connection closed before read");
                self.stats.record_resolution_race();
                return;
            }
        };

        // 3. Best-effort hand-off
        self.emitter.emit(resolved.id, snapshot, captured_at);
    }
}

impl<T: ConnectionTable, S: Sink> PacketCallback for TapPipeline<T, S> {
    fn on_packet(&self, packet: &PacketView<'_>) -> Verdict {
        self.stats.record_seen();
        self.observe(packet);
        Verdict::Accept
    }
}
