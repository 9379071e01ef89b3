use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::sync::ShardedLock;

use crate::intercept::{HookError, InterceptionPoint, PacketCallback, Verdict};
use crate::packet_view::PacketView;

struct Registration {
    id: u64,
    callback: Arc<dyn PacketCallback>,
}

struct Inner {
    slot: ShardedLock<Option<Registration>>,
    next_id: AtomicU64,
}

// ==========================================
// In-process interception point
// ==========================================
/// Interception point driven by the caller: every thread that forwards a
/// packet calls [`LocalInterceptor::dispatch`]. Used by simulations and tests.
///
/// Dispatching threads only take a per-shard read lock, so they never wait on
/// each other. `unregister` takes the write lock and therefore returns only
/// after every callback that was already running has finished.
#[derive(Clone)]
pub struct LocalInterceptor {
    inner: Arc<Inner>,
}

pub struct LocalHandle {
    id: u64,
}

impl LocalInterceptor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: ShardedLock::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn dispatch(&self, packet: &PacketView<'_>) -> Verdict {
        // A poisoned slot still holds a valid registration; keep forwarding.
        let slot = match self.inner.slot.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match slot.as_ref() {
            Some(reg) => reg.callback.on_packet(packet),
            None => Verdict::Accept,
        }
    }

    pub fn is_registered(&self) -> bool {
        match self.inner.slot.read() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }
}

impl Default for LocalInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl InterceptionPoint for LocalInterceptor {
    type Handle = LocalHandle;

    fn register(&self, callback: Arc<dyn PacketCallback>) -> Result<LocalHandle, HookError> {
        let mut slot = match self.inner.slot.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_some() {
            return Err(HookError::AlreadyRegistered);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        *slot = Some(Registration { id, callback });
        Ok(LocalHandle { id })
    }

    fn unregister(&self, handle: LocalHandle) {
        let mut slot = match self.inner.slot.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.as_ref().is_some_and(|reg| reg.id == handle.id) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    struct Counting(AtomicUsize);

    impl PacketCallback for Counting {
        fn on_packet(&self, _packet: &PacketView<'_>) -> Verdict {
            self.0.fetch_add(1, Ordering::SeqCst);
            Verdict::Accept
        }
    }

    #[test]
    fn dispatch_without_registration_accepts() {
        let hook = LocalInterceptor::new();
        assert_eq!(hook.dispatch(&PacketView::new(&[], 0)), Verdict::Accept);
    }

    #[test]
    fn callback_stops_after_unregister() {
        let hook = LocalInterceptor::new();
        let counter = Arc::new(Counting(AtomicUsize::new(0)));
        let handle = hook.register(counter.clone()).unwrap();

        hook.dispatch(&PacketView::new(&[], 0));
        assert!(hook.is_registered());
        hook.unregister(handle);
        hook.dispatch(&PacketView::new(&[], 0));

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(!hook.is_registered());
    }

    #[test]
    fn second_registration_is_refused() {
        let hook = LocalInterceptor::new();
        let counter = Arc::new(Counting(AtomicUsize::new(0)));
        let _handle = hook.register(counter.clone()).unwrap();
        assert!(matches!(hook.register(counter), Err(HookError::AlreadyRegistered)));
    }

    struct Slow {
        entered: mpsc::SyncSender<()>,
        finished: AtomicUsize,
    }

    impl PacketCallback for Slow {
        fn on_packet(&self, _packet: &PacketView<'_>) -> Verdict {
            let _ = self.entered.send(());
            thread::sleep(Duration::from_millis(50));
            self.finished.fetch_add(1, Ordering::SeqCst);
            Verdict::Accept
        }
    }

    #[test]
    fn unregister_waits_for_in_flight_callback() {
        let hook = LocalInterceptor::new();
        let (tx, rx) = mpsc::sync_channel(1);
        let slow = Arc::new(Slow {
            entered: tx,
            finished: AtomicUsize::new(0),
        });
        let handle = hook.register(slow.clone()).unwrap();

        let worker = {
            let hook = hook.clone();
            thread::spawn(move || hook.dispatch(&PacketView::new(&[], 1)))
        };
        rx.recv().unwrap();
        hook.unregister(handle);

        // the callback was already running, so it must have completed
        assert_eq!(slow.finished.load(Ordering::SeqCst), 1);
        assert_eq!(worker.join().unwrap(), Verdict::Accept);
    }
}
