//! Packet interception points.
//!
//! An interception point calls a registered [`PacketCallback`] once for every
//! outbound packet and forwards the packet with the verdict the callback
//! returns. Registration yields a handle that is consumed by `unregister`;
//! once `unregister` returns no callback is running and none will start.

use std::sync::Arc;

use crate::packet_view::PacketView;

mod local_hook;
mod nfq_hook;

pub use local_hook::{LocalHandle, LocalInterceptor};
pub use nfq_hook::{NfqHandle, NfqInterceptor};

/// Forwarding decision for an intercepted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Verdict {
    /// Let the packet continue unmodified.
    Accept,
}

impl From<Verdict> for nfq::Verdict {
    fn from(value: Verdict) -> Self {
        match value {
            Verdict::Accept => nfq::Verdict::Accept,
        }
    }
}

pub trait PacketCallback: Send + Sync {
    fn on_packet(&self, packet: &PacketView<'_>) -> Verdict;
}

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("failed to acquire queue {queue}: {source}")]
    Queue {
        queue: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn worker for queue {queue}: {source}")]
    Spawn {
        queue: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("worker for queue {0} exited before reporting readiness")]
    WorkerLost(u16),
    #[error("a callback is already registered on this interception point")]
    AlreadyRegistered,
    #[error("no queues configured")]
    NoQueues,
}

pub trait InterceptionPoint: Send + Sync {
    type Handle: Send;

    fn register(&self, callback: Arc<dyn PacketCallback>) -> Result<Self::Handle, HookError>;

    /// Blocks until every in-flight callback has returned.
    fn unregister(&self, handle: Self::Handle);
}
