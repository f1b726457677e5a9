//! Auto-instrumentation agent
//!
//! Attaches the net/http server probe to a running Go process, exports a
//! span for every request it serves and releases every kernel resource on
//! exit.
//!
//! ## Usage
//!
//! ```bash
//! # Instrument a process for 60 seconds, events to stdout
//! sudo ./autoinstr-agent --target target.json --offsets offsets.json \
//!     --ebpf-object go_nethttp.bpf.o --duration 60
//!
//! # Run until Ctrl-C, pretty-printed events to a file
//! sudo ./autoinstr-agent --target target.json --offsets offsets.json \
//!     --ebpf-object go_nethttp.bpf.o --format pretty --output events.json
//! ```

use anyhow::{bail, Result};
use autoinstr::{
    bpffs,
    event::Event,
    exporter::{EventExporter, ExportFormat, JsonExporter},
    instrumentation::nethttp_server,
    manager::Manager,
    process::{Executable, TargetDetails},
    structfield::Index,
};
use clap::Parser;
use log::{info, warn};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{signal, sync::mpsc, time::sleep};

/// Events buffered between the probes and the exporter
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// eBPF auto-instrumentation agent for Go processes
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Target details file (JSON): pid, module versions, function offsets
    #[clap(short, long)]
    target: PathBuf,

    /// Struct field offset index (JSON)
    #[clap(long)]
    offsets: PathBuf,

    /// Path to the eBPF object file
    #[clap(long)]
    ebpf_object: PathBuf,

    /// Executable to attach to (defaults to the one in the target details)
    #[clap(long)]
    exe: Option<PathBuf>,

    /// Output file for events (stdout if not set)
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// Output format (json, pretty)
    #[clap(short, long, default_value = "json")]
    format: String,

    /// Duration to run the agent (in seconds, 0 = until interrupted)
    #[clap(short, long, default_value_t = 0)]
    duration: u64,

    /// Capacity of the event channel between the probes and the exporter
    #[clap(long, default_value_t = DEFAULT_CHANNEL_CAPACITY)]
    channel_capacity: usize,

    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let format: ExportFormat = args.format.parse()?;
    if args.channel_capacity == 0 {
        bail!("Channel capacity must be >= 1");
    }

    let td = TargetDetails::from_file(&args.target)?;
    let offsets = Arc::new(Index::from_file(&args.offsets)?);
    let exec = Executable::new(args.exe.clone().unwrap_or_else(|| td.exe_path.clone()));

    info!("Starting auto-instrumentation agent...");
    info!("   Target: pid {} ({:?})", td.pid, exec.path);
    info!("   Libraries: {}", td.libraries.len());
    info!("   Offsets: {} struct fields", offsets.len());
    info!(
        "   Duration: {}",
        if args.duration == 0 {
            "until interrupted".to_string()
        } else {
            format!("{} seconds", args.duration)
        }
    );

    let mut manager = Manager::new();
    manager.register(Arc::new(nethttp_server::new(
        args.ebpf_object.clone(),
        offsets,
    )));

    if let Err(e) = manager.load(&exec, &td) {
        cleanup_pins(&td);
        return Err(e);
    }

    let mut exporter = match &args.output {
        Some(path) => JsonExporter::to_file(path, format)?,
        None => JsonExporter::stdout(format),
    };

    let (tx, mut rx) = mpsc::channel(args.channel_capacity);
    manager.run(tx);

    info!("Exporting events...");

    let shutdown = async {
        if args.duration > 0 {
            tokio::select! {
                _ = sleep(Duration::from_secs(args.duration)) => {
                    info!("Duration reached, shutting down...");
                }
                _ = signal::ctrl_c() => {
                    info!("Interrupted, shutting down...");
                }
            }
        } else {
            let _ = signal::ctrl_c().await;
            info!("Interrupted, shutting down...");
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = rx.recv() => match event {
                Some(event) => export(&mut exporter, &event),
                None => break,
            },
        }
    }

    // Keep exporting while the probes stop so none of them stays blocked
    // on a full channel
    let close = manager.close();
    tokio::pin!(close);
    loop {
        tokio::select! {
            _ = &mut close => break,
            Some(event) = rx.recv() => export(&mut exporter, &event),
        }
    }

    // Events already queued when the probes stopped
    while let Some(event) = rx.recv().await {
        export(&mut exporter, &event);
    }
    exporter.flush()?;

    cleanup_pins(&td);

    info!("Exported {} events", exporter.exported());
    Ok(())
}

fn export(exporter: &mut JsonExporter, event: &Event) {
    if let Err(e) = exporter.export(event) {
        warn!("Failed to export event: {:#}", e);
    }
}

fn cleanup_pins(td: &TargetDetails) {
    if let Err(e) = bpffs::cleanup(td) {
        warn!("Failed to remove pinned maps of process {}: {}", td.pid, e);
    }
}
