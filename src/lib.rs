//! Flow telemetry tap for outbound TCP traffic.
//!
//! Every outbound packet is intercepted, matched to the TCP connection that
//! sent it, and the connection's congestion state (cwnd, smoothed RTT, bytes
//! in flight, retransmissions) is written to a sink as one [`MetricsRecord`].
//! The packet itself is always accepted unmodified, and telemetry is
//! best-effort: a busy sink drops records instead of slowing forwarding.
//!
//! ```text
//! InterceptionPoint -> FlowResolver -> extractor -> MetricsEmitter -> Sink
//!        ^                                                             |
//!        +------------------------ Tap (start/stop) -------------------+
//! ```

pub mod config;
pub mod connection_id;
pub mod emitter;
pub mod error;
pub mod extractor;
pub mod intercept;
pub mod lifecycle;
pub mod logging;
pub mod packet_view;
pub mod pipeline;
pub mod resolver;
pub mod sink;
pub mod stats;
pub mod table;

pub use config::{NfqConfig, SinkConfig, TapConfig};
pub use connection_id::ConnectionId;
pub use emitter::{MetricsEmitter, MetricsRecord};
pub use error::TapError;
pub use extractor::{CongestionSnapshot, ExtractError};
pub use intercept::{HookError, InterceptionPoint, LocalInterceptor, NfqInterceptor, PacketCallback, Verdict};
pub use lifecycle::{StartStatus, StopReport, StopStatus, Tap, TapState};
pub use packet_view::PacketView;
pub use resolver::FlowResolver;
pub use sink::{AppendOutcome, LogSink, RecordFormat, RingSink, Sink, SinkError, TracingSink};
pub use stats::{StatsSnapshot, TapStats};
pub use table::{ConnectionTable, MemoryTable, SockDiagTable, TcpStateView};
