use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use comfy_table::Table;
use comfy_table::presets::UTF8_FULL;
use tracing_subscriber::EnvFilter;

use hoptrace::{
    AddressFamily, ControllerConfig, HistoryBatcher, IcmpProbeEngine, PollOutcome, ProbeOptions,
    Snapshot, TraceSessionController, TraceState, export,
};

#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about = "Continuously probe a network path and record per-hop statistics."
)]
struct CliArgs {
    /// Host name or address to trace
    target: String,

    /// Maximum number of hops (TTL)
    #[clap(short, long, default_value_t = 30)]
    max_hops: u8,

    /// Timeout for each probe in milliseconds
    #[clap(short = 't', long, default_value_t = 1000)]
    timeout_ms: u64,

    /// Resolve hop addresses to hostnames
    #[clap(short, long)]
    resolve: bool,

    /// Pause between probe rounds in milliseconds
    #[clap(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Address family preference for target resolution
    #[clap(long, value_enum, default_value_t = FamilyArg::Any)]
    family: FamilyArg,

    /// Seconds between history flushes
    #[clap(long, default_value_t = 60)]
    flush_secs: u64,

    /// Directory for history files (defaults to hoptrace-data next to the executable)
    #[clap(long)]
    data_dir: Option<PathBuf>,

    /// Milliseconds between display/sample heartbeats
    #[clap(long, default_value_t = 600)]
    sample_ms: u64,

    /// Warn when a stop request is not honored within this many seconds
    #[clap(long)]
    stop_grace_secs: Option<u64>,

    /// Stop the session automatically after this many seconds
    #[clap(long)]
    duration_secs: Option<u64>,

    /// Write the final snapshot as a plain-text table on exit
    #[clap(long)]
    export_txt: Option<PathBuf>,

    /// Write the final snapshot as an HTML table on exit
    #[clap(long)]
    export_html: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FamilyArg {
    V4,
    V6,
    Any,
}

impl From<FamilyArg> for AddressFamily {
    fn from(arg: FamilyArg) -> Self {
        match arg {
            FamilyArg::V4 => AddressFamily::V4Only,
            FamilyArg::V6 => AddressFamily::V6Only,
            FamilyArg::Any => AddressFamily::Any,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();

    let engine = Arc::new(IcmpProbeEngine::new(ProbeOptions {
        max_hops: args.max_hops,
        timeout: Duration::from_millis(args.timeout_ms),
        round_pause: Duration::from_millis(args.interval_ms),
        resolve_names: args.resolve,
    }));

    let data_dir = match args.data_dir.clone() {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    let history = HistoryBatcher::new(data_dir, Duration::from_secs(args.flush_secs));

    let config = ControllerConfig {
        sample_interval: Duration::from_millis(args.sample_ms),
        stop_grace: args.stop_grace_secs.map(Duration::from_secs),
        family: args.family.into(),
        ..ControllerConfig::default()
    };
    let mut controller = TraceSessionController::new(engine, history, config);

    // First Ctrl-C stops the session cleanly, a second one exits.
    let (sig_tx, sig_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = sig_tx.send(());
    })
    .context("failed to install Ctrl-C handler")?;

    controller
        .request_start(&args.target)
        .with_context(|| format!("cannot start trace to {}", args.target))?;
    println!("Tracing {} (Ctrl-C to stop)...", args.target);

    let started = Instant::now();
    let mut last_render = Instant::now();
    loop {
        match controller.poll() {
            PollOutcome::ShutdownComplete | PollOutcome::BecameIdle => break,
            PollOutcome::Running | PollOutcome::Idle => {}
        }

        while sig_rx.try_recv().is_ok() {
            if controller.state() == TraceState::Stopping {
                controller.request_exit();
            } else {
                controller.request_stop();
            }
        }

        if let Some(limit) = args.duration_secs {
            if controller.state() == TraceState::Tracing
                && started.elapsed() >= Duration::from_secs(limit)
            {
                controller.request_stop();
            }
        }

        if last_render.elapsed() >= Duration::from_millis(args.sample_ms) {
            last_render = Instant::now();
            if let Some(snapshot) = controller.latest_snapshot() {
                println!("{}", live_table(snapshot));
            }
        }

        thread::sleep(controller.poll_interval());
    }

    controller
        .drain_history()
        .context("final history flush failed")?;

    if let Some(snapshot) = controller.latest_snapshot() {
        println!("{}", live_table(snapshot));
        if let Some(path) = &args.export_txt {
            std::fs::write(path, export::render_text(snapshot))
                .with_context(|| format!("cannot write {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
        if let Some(path) = &args.export_html {
            std::fs::write(path, export::render_html(snapshot))
                .with_context(|| format!("cannot write {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
    }

    Ok(())
}

fn default_data_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot locate the running executable")?;
    let dir = exe
        .parent()
        .context("executable has no parent directory")?
        .to_path_buf();
    Ok(dir.join("hoptrace-data"))
}

fn live_table(snapshot: &Snapshot) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec![
        "Hop", "Host", "%", "Sent", "Recv", "Best", "Avrg", "Wrst", "Last",
    ]);
    for rec in snapshot.live_records() {
        table.add_row(vec![
            rec.index.to_string(),
            rec.host.clone(),
            rec.loss_percent.to_string(),
            rec.sent.to_string(),
            rec.received.to_string(),
            rec.best.to_string(),
            rec.avg.to_string(),
            rec.worst.to_string(),
            rec.last.to_string(),
        ]);
    }
    table
}
