use serde::Serialize;

use crate::table::{ProtocolState, TcpStateView};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error("connection closed before its state could be read")]
    ConnectionClosed,
}

/// The four congestion metrics of one connection at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CongestionSnapshot {
    /// Congestion window in segments.
    pub cwnd: u32,
    /// Smoothed RTT in microseconds; 0 until the first RTT sample.
    #[serde(rename = "smoothed_rtt_us")]
    pub smoothed_rtt: u32,
    pub bytes_in_flight: u64,
    /// Retransmitted segments over the connection's lifetime.
    pub retransmissions: u32,
}

impl From<TcpStateView> for CongestionSnapshot {
    fn from(view: TcpStateView) -> Self {
        Self {
            cwnd: view.snd_cwnd,
            smoothed_rtt: view.srtt_us,
            bytes_in_flight: u64::from(view.packets_in_flight()) * u64::from(view.mss),
            retransmissions: view.total_retrans,
        }
    }
}

/// Takes one consistent read of `state`. Nothing is cached between calls.
pub fn extract<S: ProtocolState>(state: &S) -> Result<CongestionSnapshot, ExtractError> {
    state.read().map(CongestionSnapshot::from)
}
