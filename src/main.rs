use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};

use tcp_metrics_tap::config::{DEFAULT_COPY_RANGE, DEFAULT_LOG_CHANNEL_CAPACITY, DEFAULT_QUEUE_MAX_LEN};
use tcp_metrics_tap::{
    NfqConfig, NfqInterceptor, RecordFormat, SinkConfig, SockDiagTable, StopStatus, Tap, TapConfig, logging,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SinkKind {
    Log,
    Tracing,
}

/// Runs the TCP metrics tap on NFQUEUE until interrupted.
///
/// Expects an OUTPUT rule steering TCP into the queues, e.g.
/// `iptables -A OUTPUT -p tcp -j NFQUEUE --queue-balance 0:3 --queue-bypass`.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// First NFQUEUE number.
    #[arg(long, env = "TAP_QUEUE_START", default_value_t = 0)]
    queue_start: u16,
    /// Number of queues (one worker thread each).
    #[arg(long, env = "TAP_QUEUES", default_value_t = 1)]
    queues: u16,
    #[arg(long, default_value_t = DEFAULT_COPY_RANGE)]
    copy_range: u16,
    #[arg(long, default_value_t = DEFAULT_QUEUE_MAX_LEN)]
    max_queue_len: u32,
    /// Let the kernel drop instead of accept when a queue overflows.
    #[arg(long)]
    no_fail_open: bool,

    #[arg(long, value_enum, default_value_t = SinkKind::Log)]
    sink: SinkKind,
    /// Output file; defaults to `results/tcp_metrics_<cc>_<scenario>.log`.
    #[arg(long, env = "TAP_OUTPUT")]
    output: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = RecordFormat::Kernel)]
    format: RecordFormat,
    #[arg(long, default_value_t = DEFAULT_LOG_CHANNEL_CAPACITY)]
    channel_capacity: usize,
    /// Seconds between statistics reports, 0 disables them.
    #[arg(long, default_value_t = 1)]
    report_secs: u64,

    /// Congestion control algorithm of this run (label only).
    #[arg(long, env = "TAP_CC", default_value = "cubic")]
    cc: String,
    /// Scenario label of this run.
    #[arg(long, env = "TAP_SCENARIO", default_value = "sc0")]
    scenario: String,
    /// Target RTT of this run in milliseconds (label only).
    #[arg(long)]
    rtt_ms: Option<u32>,
    /// Interference level of this run (label only).
    #[arg(long)]
    interference: Option<String>,

    #[arg(long, env = "TAP_LOG_LEVEL")]
    log_level: Option<LevelFilter>,
}

impl Args {
    fn tap_config(&self) -> TapConfig {
        let sink = match self.sink {
            SinkKind::Log => SinkConfig::Log {
                path: self
                    .output
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(format!("results/tcp_metrics_{}_{}.log", self.cc, self.scenario))),
                format: self.format,
                channel_capacity: self.channel_capacity,
            },
            SinkKind::Tracing => SinkConfig::Tracing {
                channel_capacity: self.channel_capacity,
            },
        };
        TapConfig {
            nfq: NfqConfig {
                queues: self.queue_start..self.queue_start.saturating_add(self.queues),
                copy_range: self.copy_range,
                max_queue_len: self.max_queue_len,
                fail_open: !self.no_fail_open,
            },
            sink,
            report_interval: (self.report_secs > 0).then(|| Duration::from_secs(self.report_secs)),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init_tracing(args.log_level).context("installing tracing subscriber")?;

    let config = args.tap_config();
    if let SinkConfig::Log { path, .. } = &config.sink {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
    }

    let table = SockDiagTable::new();
    if let Err(err) = table.probe() {
        warn!(%err, "sock_diag unavailable, no connection will resolve");
    }

    let (stop_tx, stop_rx) = crossbeam::channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("installing signal handler")?;

    let tap = Tap::new(NfqInterceptor::new(config.nfq.clone()), table, config.sink.build())
        .with_name(&format!("{}/{}", args.cc, args.scenario))
        .with_report_interval(config.report_interval);

    info!(
        cc = %args.cc,
        scenario = %args.scenario,
        rtt_ms = ?args.rtt_ms,
        interference = ?args.interference,
        queues = ?config.nfq.queues,
        "starting tap"
    );
    tap.start().context("starting tap")?;

    let _ = stop_rx.recv();

    match tap.stop() {
        StopStatus::Stopped(report) => info!(
            seen = report.stats.seen,
            emitted = report.stats.emitted,
            dropped = report.stats.dropped,
            skipped = report.stats.not_applicable,
            races = report.stats.resolution_races,
            flushed = report.flushed,
            "run finished"
        ),
        other => warn!(?other, "tap was not active at shutdown"),
    }
    Ok(())
}
