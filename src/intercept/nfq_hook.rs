use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel;
use nfq::{Queue, Verdict as NfqVerdict};
use tracing::{debug, error, info, warn};

use crate::config::NfqConfig;
use crate::intercept::{HookError, InterceptionPoint, PacketCallback};
use crate::packet_view::PacketView;

const IDLE_SLEEP: Duration = Duration::from_micros(100);

fn make_queue(queue_num: u16, config: &NfqConfig) -> Result<Queue, std::io::Error> {
    let mut q = Queue::open()?;
    q.bind(queue_num)?;
    // Only headers are needed to identify the flow
    q.set_copy_range(queue_num, config.copy_range)?;
    q.set_queue_max_len(queue_num, config.max_queue_len)?;
    // Overflow must never turn into packet loss
    q.set_fail_open(queue_num, config.fail_open)?;
    q.set_nonblocking(true);
    Ok(q)
}

// ==========================================
// NFQUEUE interception point
// ==========================================
/// Netfilter queue hook. Each configured queue number gets its own worker
/// thread which owns its queue, so workers never share a socket. Feed it with
/// an `OUTPUT` rule such as
/// `iptables -A OUTPUT -p tcp -j NFQUEUE --queue-balance 0:3 --queue-bypass`.
pub struct NfqInterceptor {
    config: NfqConfig,
}

pub struct NfqHandle {
    stop: Arc<AtomicBool>,
    workers: Vec<(u16, JoinHandle<()>)>,
}

impl NfqInterceptor {
    pub fn new(config: NfqConfig) -> Self {
        Self { config }
    }
}

impl InterceptionPoint for NfqInterceptor {
    type Handle = NfqHandle;

    fn register(&self, callback: Arc<dyn PacketCallback>) -> Result<NfqHandle, HookError> {
        if self.config.queues.is_empty() {
            return Err(HookError::NoQueues);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let mut handle = NfqHandle {
            stop: stop.clone(),
            workers: Vec::new(),
        };
        let (ready_tx, ready_rx) = channel::bounded(self.config.queues.len());

        for queue_num in self.config.queues.clone() {
            let config = self.config.clone();
            let callback = callback.clone();
            let stop = stop.clone();
            let ready_tx = ready_tx.clone();

            let spawned = thread::Builder::new()
                .name(format!("nfq-tap-{queue_num}"))
                .spawn(move || run_worker(queue_num, &config, callback.as_ref(), &stop, ready_tx));
            match spawned {
                Ok(worker) => handle.workers.push((queue_num, worker)),
                Err(source) => {
                    shutdown(handle);
                    return Err(HookError::Spawn { queue: queue_num, source });
                }
            }
        }
        drop(ready_tx);

        // Every worker reports whether it could bind its queue before we
        // hand out the handle, so permission problems surface here.
        for _ in 0..handle.workers.len() {
            match ready_rx.recv() {
                Ok(Ok(queue_num)) => debug!(queue_num, "nfqueue worker ready"),
                Ok(Err(err)) => {
                    shutdown(handle);
                    return Err(err);
                }
                Err(_) => {
                    let queue = handle.workers.first().map(|(q, _)| *q).unwrap_or_default();
                    shutdown(handle);
                    return Err(HookError::WorkerLost(queue));
                }
            }
        }

        info!(queues = ?self.config.queues, "nfqueue hook registered");
        Ok(handle)
    }

    fn unregister(&self, handle: NfqHandle) {
        shutdown(handle);
        info!("nfqueue hook unregistered");
    }
}

fn shutdown(handle: NfqHandle) {
    handle.stop.store(true, Ordering::Release);
    for (queue_num, worker) in handle.workers {
        if worker.join().is_err() {
            error!(queue_num, "nfqueue worker panicked");
        }
    }
}

fn run_worker(
    queue_num: u16,
    config: &NfqConfig,
    callback: &dyn PacketCallback,
    stop: &AtomicBool,
    ready: channel::Sender<Result<u16, HookError>>,
) {
    let mut queue = match make_queue(queue_num, config) {
        Ok(q) => {
            let _ = ready.send(Ok(queue_num));
            q
        }
        Err(source) => {
            let _ = ready.send(Err(HookError::Queue { queue: queue_num, source }));
            return;
        }
    };
    drop(ready);

    let context = queue_num as usize;
    while !stop.load(Ordering::Acquire) {
        match queue.recv() {
            Ok(mut msg) => {
                let verdict = {
                    let view = PacketView::new(msg.get_payload(), context);
                    callback.on_packet(&view)
                };
                msg.set_verdict(verdict.into());
                if let Err(err) = queue.verdict(msg) {
                    warn!(queue_num, %err, "failed to issue verdict");
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => thread::sleep(IDLE_SLEEP),
            Err(err) => {
                warn!(queue_num, %err, "nfqueue receive failed");
                thread::sleep(IDLE_SLEEP);
            }
        }
    }

    // Release whatever is still parked in the queue without observing it
    let mut released = 0u64;
    while let Ok(mut msg) = queue.recv() {
        msg.set_verdict(NfqVerdict::Accept);
        if queue.verdict(msg).is_ok() {
            released += 1;
        }
    }
    debug!(queue_num, released, "nfqueue worker stopped");
}
