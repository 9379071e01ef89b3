//! Host connection tables the flow resolver looks packets up in.

use crate::connection_id::ConnectionId;
use crate::extractor::ExtractError;

mod memory;
mod sock_diag;

pub use memory::{ConnectionHandle, MemoryState, MemoryTable};
pub use sock_diag::{DiagError, SockDiagTable, TcpInfo};

/// Raw congestion-control fields of one TCP connection, copied out in a single
/// consistent read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpStateView {
    pub snd_cwnd: u32,
    /// Smoothed RTT in microseconds, 0 before the first sample.
    pub srtt_us: u32,
    pub mss: u32,
    pub packets_out: u32,
    pub sacked_out: u32,
    pub lost_out: u32,
    pub retrans_out: u32,
    pub total_retrans: u32,
}

impl TcpStateView {
    /// Segments sent but neither acknowledged, SACKed nor marked lost,
    /// plus the ones currently being retransmitted.
    pub fn packets_in_flight(&self) -> u32 {
        self.packets_out
            .saturating_sub(self.sacked_out.saturating_add(self.lost_out))
            .saturating_add(self.retrans_out)
    }
}

/// Reference to the protocol state of a resolved connection.
pub trait ProtocolState {
    /// Reads the whole state at once. Fails when the connection went away
    /// after it was resolved.
    fn read(&self) -> Result<TcpStateView, ExtractError>;
}

pub trait ConnectionTable: Send + Sync {
    type State: ProtocolState;

    /// Finds the open connection owning `id`; `None` when there is none.
    fn lookup(&self, id: &ConnectionId) -> Option<Self::State>;
}
