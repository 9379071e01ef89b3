use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Local;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use crossbeam::utils::CachePadded;
use tracing::{info, warn};

// ==========================================
// 1. Pipeline counters (shared by every context)
// ==========================================
/// Each counter sits on its own cache line so contexts bumping different
/// counters do not bounce lines between cores.
#[derive(Default)]
pub struct TapStats {
    seen: CachePadded<AtomicU64>,
    not_applicable: CachePadded<AtomicU64>,
    resolution_races: CachePadded<AtomicU64>,
    emitted: CachePadded<AtomicU64>,
    dropped: CachePadded<AtomicU64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub seen: u64,
    pub not_applicable: u64,
    pub resolution_races: u64,
    pub emitted: u64,
    /// Records refused by the sink.
    pub dropped: u64,
}

impl TapStats {
    pub fn record_seen(&self) {
        self.seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_not_applicable(&self) {
        self.not_applicable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resolution_race(&self) {
        self.resolution_races.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emitted(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            seen: self.seen.load(Ordering::Relaxed),
            not_applicable: self.not_applicable.load(Ordering::Relaxed),
            resolution_races: self.resolution_races.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    pub fn since(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            seen: self.seen.saturating_sub(earlier.seen),
            not_applicable: self.not_applicable.saturating_sub(earlier.not_applicable),
            resolution_races: self.resolution_races.saturating_sub(earlier.resolution_races),
            emitted: self.emitted.saturating_sub(earlier.emitted),
            dropped: self.dropped.saturating_sub(earlier.dropped),
        }
    }
}

// ==========================================
// 2. Periodic report (rates + running totals)
// ==========================================
pub struct StatsReporter {
    name: String,
    last: StatsSnapshot,
    last_report: Instant,
}

impl StatsReporter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            last: StatsSnapshot::default(),
            last_report: Instant::now(),
        }
    }

    /// Logs per-second rates since the previous report and the totals, and
    /// returns the interval delta.
    pub fn report(&mut self, stats: &TapStats) -> StatsSnapshot {
        let (delta, elapsed) = self.snapshot_and_reset(stats);
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let totals = self.last;
        let rate = |n: u64| (n as f64 / secs * 10.0).round() / 10.0;

        info!(
            tap = %self.name,
            at = %Local::now().format("%H:%M:%S"),
            seen_per_s = rate(delta.seen),
            emitted_per_s = rate(delta.emitted),
            dropped_per_s = rate(delta.dropped),
            skipped = delta.not_applicable,
            races = delta.resolution_races,
            total_emitted = totals.emitted,
            total_dropped = totals.dropped,
            "tap report"
        );
        delta
    }

    fn snapshot_and_reset(&mut self, stats: &TapStats) -> (StatsSnapshot, Duration) {
        let current = stats.snapshot();
        let delta = current.since(&self.last);
        let elapsed = self.last_report.elapsed();
        self.last = current;
        self.last_report = Instant::now();
        (delta, elapsed)
    }
}

// ==========================================
// 3. Reporter thread
// ==========================================
pub struct ReporterHandle {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

pub fn spawn_reporter(name: &str, stats: Arc<TapStats>, interval: Duration) -> std::io::Result<ReporterHandle> {
    let (stop, stop_rx) = channel::bounded::<()>(1);
    let mut reporter = StatsReporter::new(name);
    let thread = thread::Builder::new()
        .name("tap-stats".into())
        .spawn(move || {
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        reporter.report(&stats);
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            // final partial interval
            reporter.report(&stats);
        })?;
    Ok(ReporterHandle { stop, thread })
}

impl ReporterHandle {
    pub fn stop(self) {
        let _ = self.stop.send(());
        if self.thread.join().is_err() {
            warn!("stats reporter panicked");
        }
    }
}
