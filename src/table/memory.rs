use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::atomic::AtomicCell;
use crossbeam::sync::ShardedLock;

use crate::connection_id::ConnectionId;
use crate::extractor::ExtractError;
use crate::table::{ConnectionTable, ProtocolState, TcpStateView};

struct Connection {
    state: AtomicCell<TcpStateView>,
    open: AtomicBool,
}

// ==========================================
// In-memory connection table (simulated host stack)
// ==========================================
/// Connection table kept in process memory. The owner of a
/// [`ConnectionHandle`] plays the host stack: it updates the congestion state
/// and eventually closes the connection, while the tap only ever reads.
#[derive(Clone, Default)]
pub struct MemoryTable {
    connections: Arc<ShardedLock<HashMap<ConnectionId, Arc<Connection>>>>,
}

pub struct ConnectionHandle {
    id: ConnectionId,
    conn: Arc<Connection>,
    table: MemoryTable,
}

/// Weak reference handed out by lookups; it does not keep the connection alive.
pub struct MemoryState(Weak<Connection>);

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a connection, replacing any previous one with the same identity.
    pub fn open(&self, id: ConnectionId, initial: TcpStateView) -> ConnectionHandle {
        let conn = Arc::new(Connection {
            state: AtomicCell::new(initial),
            open: AtomicBool::new(true),
        });
        let mut map = match self.connections.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(old) = map.insert(id, conn.clone()) {
            old.open.store(false, Ordering::Release);
        }
        ConnectionHandle {
            id,
            conn,
            table: self.clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self.connections.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: &ConnectionId, conn: &Arc<Connection>) {
        let mut map = match self.connections.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Only drop the entry if it still belongs to this connection
        if map.get(id).is_some_and(|current| Arc::ptr_eq(current, conn)) {
            map.remove(id);
        }
    }
}

impl ConnectionTable for MemoryTable {
    type State = MemoryState;

    fn lookup(&self, id: &ConnectionId) -> Option<MemoryState> {
        let map = match self.connections.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(id).map(|conn| MemoryState(Arc::downgrade(conn)))
    }
}

impl ProtocolState for MemoryState {
    fn read(&self) -> Result<TcpStateView, ExtractError> {
        let conn = self.0.upgrade().ok_or(ExtractError::ConnectionClosed)?;
        if !conn.open.load(Ordering::Acquire) {
            return Err(ExtractError::ConnectionClosed);
        }
        Ok(conn.state.load())
    }
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> TcpStateView {
        self.conn.state.load()
    }

    pub fn set(&self, state: TcpStateView) {
        self.conn.state.store(state);
    }

    /// Applies `f` as one atomic update of the whole state.
    pub fn update(&self, mut f: impl FnMut(&mut TcpStateView)) {
        let _ = self.conn.state.fetch_update(|mut state| {
            f(&mut state);
            Some(state)
        });
    }

    pub fn close(self) {
        self.conn.open.store(false, Ordering::Release);
        self.table.remove(&self.id, &self.conn);
    }
}
