//! Tap lifecycle: `uninitialized -> active -> stopped`.
//!
//! A [`Tap`] owns its registration handle, so several taps can live side by
//! side (one per test, one per namespace) without shared global state. A
//! stopped tap never becomes active again; build a new one instead.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::TapError;
use crate::intercept::InterceptionPoint;
use crate::pipeline::TapPipeline;
use crate::sink::Sink;
use crate::stats::{self, ReporterHandle, StatsSnapshot, TapStats};
use crate::table::ConnectionTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapState {
    Uninitialized,
    Active,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStatus {
    Started,
    AlreadyActive,
    /// Stopped taps stay stopped.
    AlreadyStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopReport {
    pub stats: StatsSnapshot,
    /// Records the sink reported as held or written when it closed.
    pub flushed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStatus {
    Stopped(StopReport),
    AlreadyStopped,
    NotStarted,
}

enum Phase<H> {
    Uninitialized,
    Active {
        handle: H,
        reporter: Option<ReporterHandle>,
    },
    Stopped,
}

pub struct Tap<I: InterceptionPoint, T, S> {
    name: String,
    hook: I,
    sink: Arc<S>,
    stats: Arc<TapStats>,
    pipeline: Arc<TapPipeline<T, S>>,
    report_interval: Option<Duration>,
    // Control plane only; the packet path never touches this lock
    phase: Mutex<Phase<I::Handle>>,
}

impl<I, T, S> Tap<I, T, S>
where
    I: InterceptionPoint,
    T: ConnectionTable + 'static,
    S: Sink + 'static,
{
    pub fn new(hook: I, table: T, sink: S) -> Self {
        let sink = Arc::new(sink);
        let stats = Arc::new(TapStats::default());
        let pipeline = Arc::new(TapPipeline::new(table, sink.clone(), stats.clone()));
        Self {
            name: "tcp-tap".to_string(),
            hook,
            sink,
            stats,
            pipeline,
            report_interval: None,
            phase: Mutex::new(Phase::Uninitialized),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_report_interval(mut self, interval: Option<Duration>) -> Self {
        self.report_interval = interval;
        self
    }

    pub fn hook(&self) -> &I {
        &self.hook
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn state(&self) -> TapState {
        match *self.lock_phase() {
            Phase::Uninitialized => TapState::Uninitialized,
            Phase::Active { .. } => TapState::Active,
            Phase::Stopped => TapState::Stopped,
        }
    }

    /// Opens the sink, then registers the pipeline on the interception point.
    /// Only failing to acquire either of them is an error.
    pub fn start(&self) -> Result<StartStatus, TapError> {
        let mut phase = self.lock_phase();
        match *phase {
            Phase::Active { .. } => return Ok(StartStatus::AlreadyActive),
            Phase::Stopped => return Ok(StartStatus::AlreadyStopped),
            Phase::Uninitialized => {}
        }

        // 1. Sink first, so the first callback already has somewhere to write
        self.sink.open()?;

        // 2. Hook. On failure the sink stays open: `open` is idempotent and a
        // retried start must find it accepting records. `stop`/drop closes it.
        let handle = self.hook.register(self.pipeline.clone())?;

        // 3. Optional reporter; a tap without it still works
        let reporter = self.report_interval.and_then(|interval| {
            match stats::spawn_reporter(&self.name, self.stats.clone(), interval) {
                Ok(reporter) => Some(reporter),
                Err(err) => {
                    warn!(tap = %self.name, %err, "stats reporter not started");
                    None
                }
            }
        });

        *phase = Phase::Active { handle, reporter };
        info!(tap = %self.name, "tap started");
        Ok(StartStatus::Started)
    }

    /// Unregisters first, so no callback is running once the sink closes.
    pub fn stop(&self) -> StopStatus {
        let mut phase = self.lock_phase();
        let (handle, reporter) = match std::mem::replace(&mut *phase, Phase::Stopped) {
            Phase::Active { handle, reporter } => (handle, reporter),
            Phase::Uninitialized => {
                *phase = Phase::Uninitialized;
                return StopStatus::NotStarted;
            }
            Phase::Stopped => return StopStatus::AlreadyStopped,
        };

        // 1. Quiesce: returns only after in-flight callbacks finished
        self.hook.unregister(handle);

        if let Some(reporter) = reporter {
            reporter.stop();
        }

        // 2. Drain
        let flushed = match self.sink.drain_and_close() {
            Ok(flushed) => flushed,
            Err(err) => {
                warn!(tap = %self.name, %err, "sink did not close cleanly");
                0
            }
        };

        let report = StopReport {
            stats: self.stats.snapshot(),
            flushed,
        };
        info!(
            tap = %self.name,
            seen = report.stats.seen,
            emitted = report.stats.emitted,
            dropped = report.stats.dropped,
            flushed,
            "tap stopped"
        );
        StopStatus::Stopped(report)
    }

    fn lock_phase(&self) -> std::sync::MutexGuard<'_, Phase<I::Handle>> {
        self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<I: InterceptionPoint, T, S> Drop for Tap<I, T, S> {
    fn drop(&mut self) {
        let phase = match self.phase.get_mut() {
            Ok(phase) => phase,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Phase::Active { handle, reporter } = std::mem::replace(phase, Phase::Stopped) {
            self.hook.unregister(handle);
            if let Some(reporter) = reporter {
                reporter.stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intercept::{HookError, LocalInterceptor, PacketCallback};
    use crate::sink::RingSink;
    use crate::table::MemoryTable;

    fn tap() -> Tap<LocalInterceptor, MemoryTable, RingSink> {
        Tap::new(LocalInterceptor::new(), MemoryTable::new(), RingSink::new(16))
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let tap = tap();
        assert_eq!(tap.state(), TapState::Uninitialized);
        assert_eq!(tap.start().unwrap(), StartStatus::Started);
        assert_eq!(tap.start().unwrap(), StartStatus::AlreadyActive);
        assert!(tap.hook().is_registered());

        assert!(matches!(tap.stop(), StopStatus::Stopped(_)));
        assert_eq!(tap.stop(), StopStatus::AlreadyStopped);
        assert_eq!(tap.state(), TapState::Stopped);
        assert!(!tap.hook().is_registered());
    }

    #[test]
    fn stop_before_start_is_a_no_op() {
        let tap = tap();
        assert_eq!(tap.stop(), StopStatus::NotStarted);
        assert_eq!(tap.state(), TapState::Uninitialized);
        assert_eq!(tap.start().unwrap(), StartStatus::Started);
    }

    #[test]
    fn stopped_tap_cannot_restart() {
        let tap = tap();
        tap.start().unwrap();
        tap.stop();
        assert_eq!(tap.start().unwrap(), StartStatus::AlreadyStopped);
        assert!(!tap.hook().is_registered());
    }

    struct Denied;

    impl InterceptionPoint for Denied {
        type Handle = ();

        fn register(&self, _callback: Arc<dyn PacketCallback>) -> Result<(), HookError> {
            Err(HookError::Queue {
                queue: 0,
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            })
        }

        fn unregister(&self, _handle: ()) {}
    }

    #[test]
    fn hook_failure_surfaces_from_start() {
        let ring = RingSink::new(4);
        let tap = Tap::new(Denied, MemoryTable::new(), ring.clone());

        assert!(matches!(tap.start(), Err(TapError::Hook(HookError::Queue { .. }))));
        assert_eq!(tap.state(), TapState::Uninitialized);
    }

    /// Refuses the first registration, then behaves like a local hook.
    struct FailsOnce {
        refused: std::sync::atomic::AtomicBool,
        inner: LocalInterceptor,
    }

    impl InterceptionPoint for FailsOnce {
        type Handle = crate::intercept::LocalHandle;

        fn register(&self, callback: Arc<dyn PacketCallback>) -> Result<Self::Handle, HookError> {
            if !self.refused.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Err(HookError::Queue {
                    queue: 0,
                    source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                });
            }
            self.inner.register(callback)
        }

        fn unregister(&self, handle: Self::Handle) {
            self.inner.unregister(handle)
        }
    }

    fn retried_start_emits<S: Sink + 'static>(sink: S) -> StatsSnapshot {
        use crate::connection_id::ConnectionId;
        use crate::packet_view::PacketView;
        use crate::table::TcpStateView;
        use std::net::Ipv4Addr;

        let hook = LocalInterceptor::new();
        let table = MemoryTable::new();
        let id = ConnectionId::tcp(Ipv4Addr::new(10, 0, 0, 1), 40000, Ipv4Addr::new(10, 0, 0, 2), 5201);
        let _conn = table.open(id, TcpStateView { snd_cwnd: 10, mss: 1448, ..Default::default() });
        let tap = Tap::new(
            FailsOnce {
                refused: std::sync::atomic::AtomicBool::new(false),
                inner: hook.clone(),
            },
            table,
            sink,
        );

        assert!(tap.start().is_err());
        assert_eq!(tap.state(), TapState::Uninitialized);
        assert_eq!(tap.start().unwrap(), StartStatus::Started);

        let mut raw = vec![0u8; 40];
        raw[0] = 0x45;
        raw[9] = 6;
        raw[12..16].copy_from_slice(&[10, 0, 0, 1]);
        raw[16..20].copy_from_slice(&[10, 0, 0, 2]);
        raw[20..22].copy_from_slice(&40000u16.to_be_bytes());
        raw[22..24].copy_from_slice(&5201u16.to_be_bytes());
        hook.dispatch(&PacketView::new(&raw, 0));

        let StopStatus::Stopped(report) = tap.stop() else {
            panic!("tap was active");
        };
        assert_eq!(report.flushed, 1);
        report.stats
    }

    #[test]
    fn ring_sink_accepts_records_after_failed_start() {
        let ring = RingSink::new(4);
        let stats = retried_start_emits(ring.clone());
        assert_eq!((stats.emitted, stats.dropped), (1, 0));
        assert_eq!(ring.take_all().len(), 1);
    }

    #[test]
    fn log_sink_accepts_records_after_failed_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tap.log");
        let sink = crate::sink::LogSink::new(&path, crate::sink::RecordFormat::Kernel, 16);

        let stats = retried_start_emits(sink);
        assert_eq!((stats.emitted, stats.dropped), (1, 0));
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);
    }

    #[test]
    fn dropping_an_active_tap_unregisters() {
        let hook = LocalInterceptor::new();
        {
            let tap = Tap::new(hook.clone(), MemoryTable::new(), RingSink::new(4));
            tap.start().unwrap();
            assert!(hook.is_registered());
        }
        assert!(!hook.is_registered());
    }

    #[test]
    fn reporter_runs_while_active() {
        let tap = tap().with_report_interval(Some(Duration::from_millis(5)));
        tap.start().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(tap.stop(), StopStatus::Stopped(_)));
    }
}
