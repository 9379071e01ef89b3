use crate::connection_id::ConnectionId;
use crate::packet_view::PacketView;
use crate::table::ConnectionTable;

/// A packet that belongs to an open TCP connection on this host.
pub struct Resolved<S> {
    pub id: ConnectionId,
    pub state: S,
}

// ==========================================
// Flow resolver: packet -> (identity, state reference)
// ==========================================
/// Stateless per-packet resolution against a host connection table.
pub struct FlowResolver<T> {
    table: T,
}

impl<T: ConnectionTable> FlowResolver<T> {
    pub fn new(table: T) -> Self {
        Self { table }
    }

    /// `None` is "not applicable": non-TCP, unparsable, or no open
    /// connection owns the packet.
    pub fn resolve(&self, packet: &PacketView<'_>) -> Option<Resolved<T::State>> {
        // 1. Only TCP with readable ports
        let id = ConnectionId::parse(packet.payload)?;
        if !id.is_tcp() {
            return None;
        }

        // 2. Must map to a live connection of this host
        let state = self.table.lookup(&id)?;
        Some(Resolved { id, state })
    }
}
