use axum::{response::IntoResponse, routing::get, Router};
use clap::Parser;
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use rdtflow::config::parse_cpu_list;
use rdtflow::{
    Engine, EngineConfig, EventSet, MonEvent, MonitorConfig, RdtError, ResetConfig, Result,
    SessionCollector, SessionExporter, SncMode, Target,
};

#[derive(Parser, Debug)]
#[command(name = "rdtflow")]
#[command(about = "Cache and memory bandwidth monitoring for Intel RDT platforms")]
struct Args {
    #[arg(
        long = "core",
        help = "Cores to monitor (supports ranges and comma-separated lists: --core 0-3,5-8 or --core 0-3 --core 5-8)",
        action = clap::ArgAction::Append
    )]
    cores: Vec<String>,

    #[arg(
        long = "socket",
        help = "Sockets to monitor with uncore PCIe events when no cores are given",
        action = clap::ArgAction::Append
    )]
    sockets: Vec<String>,

    #[arg(
        long = "event",
        help = "Events to monitor, e.g. --event LocalMemoryBandwidth,IPC (default: all RDT events)",
        action = clap::ArgAction::Append
    )]
    events: Vec<String>,

    #[arg(long, default_value_t = 1000, help = "Polling interval in milliseconds")]
    interval_ms: u64,

    #[arg(long, default_value = "0.0.0.0:8080", help = "Address serving /metrics")]
    listen: SocketAddr,

    #[arg(long, help = "Reset every core to RMID 0 before monitoring")]
    reset: bool,

    #[arg(long, value_parser = parse_snc_mode, help = "Switch SNC RMID sharing (local or total); implies --reset")]
    snc_mode: Option<SncMode>,

    #[arg(long, help = "Print discovered capabilities and exit")]
    show_caps: bool,

    #[arg(
        short,
        long,
        help = "Enable verbose logging (shows all MSR read/write operations)"
    )]
    verbose: bool,
}

fn parse_snc_mode(s: &str) -> std::result::Result<SncMode, String> {
    s.parse::<SncMode>().map_err(|e| e.to_string())
}

struct AppState {
    exporter: Arc<SessionExporter>,
}

async fn metrics_handler(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    rdtflow::gather_metrics!(buffer, encoder, state.exporter, "session");

    let content_type = encoder.format_type().to_string();
    (
        [("Content-Type", content_type)],
        String::from_utf8(buffer).unwrap_or_default(),
    )
}

fn check_permissions() {
    let msr_path = "/dev/cpu/0/msr";
    if std::fs::metadata(msr_path).is_err() {
        eprintln!("\nERROR: Cannot access {msr_path}\n\nThe MSR kernel module may not be loaded.\nRun: sudo modprobe msr\n");
        std::process::exit(1);
    }

    if let Err(e) = std::fs::File::open(msr_path) {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            eprintln!("\nERROR: Permission denied accessing {msr_path}\n\nRun as root or grant CAP_SYS_RAWIO\n");
            std::process::exit(1);
        }
    }
}

/// Parse a list of range strings like ["0-3", "5", "8-11"]
fn parse_range_list(inputs: &[String]) -> Result<Vec<u32>> {
    let mut result = Vec::new();
    for input in inputs {
        let ids = parse_cpu_list(input)
            .ok_or_else(|| RdtError::ConfigError(format!("Invalid id list '{input}'")))?;
        result.extend(ids);
    }

    result.sort_unstable();
    result.dedup();
    Ok(result)
}

fn parse_events(inputs: &[String], engine: &Engine) -> Result<EventSet> {
    if inputs.is_empty() {
        let supported = engine.monitoring_capability()?.event_set();
        return Ok(supported.filter(|e| e.is_rdt() || *e == MonEvent::RemoteMemBandwidth));
    }

    let mut events = EventSet::empty();
    for name in inputs.iter().flat_map(|s| s.split(',')) {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let event = MonEvent::from_name(name)
            .ok_or_else(|| RdtError::ConfigError(format!("Unknown event '{name}'")))?;
        events.insert(event);
    }
    Ok(events)
}

fn build_target(args: &Args, engine: &Engine) -> Result<(Target, String)> {
    if args.cores.is_empty() && !args.sockets.is_empty() {
        let sockets = parse_range_list(&args.sockets)?;
        tracing::info!("Using sockets: {:?}", sockets);
        let label = format!("sockets_{}", sockets.len());
        return Ok((Target::Sockets(sockets), label));
    }

    let config = if args.cores.is_empty() {
        tracing::info!("Auto-detecting CPUs...");
        MonitorConfig::from_topology(engine.topology())
    } else {
        MonitorConfig::for_cores(engine.topology(), parse_range_list(&args.cores)?)?
    };

    tracing::info!(
        "Monitoring {} cores on sockets {:?}",
        config.cores.len(),
        config.sockets
    );

    let label = match config.cores.as_slice() {
        [core] => config.label(*core).to_string(),
        cores => format!("cores_{}", cores.len()),
    };
    Ok((Target::Cores(config.cores), label))
}

async fn shutdown_signal(cancel_token: CancellationToken) {
    tracing::info!("Installing signal handlers...");

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Ctrl+C received!");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                tracing::info!("SIGTERM received!");
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::warn!("Shutdown triggered by Ctrl+C");
        },
        _ = terminate => {
            tracing::warn!("Shutdown triggered by SIGTERM");
        },
    }

    cancel_token.cancel();
    tracing::warn!("Cancellation token activated");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    check_permissions();

    let mut engine = Engine::host(EngineConfig::from_env())?;

    if args.reset || args.snc_mode.is_some() {
        engine.reset_all(Some(ResetConfig {
            io_monitoring: None,
            snc_mode: args.snc_mode,
        }))?;
    }

    if args.show_caps {
        for line in engine.capabilities().summary() {
            println!("{line}");
        }
        return engine.fini();
    }

    let (target, label) = build_target(&args, &engine)?;
    let events = parse_events(&args.events, &engine)?;
    let session = engine.start_session(target, events)?;

    let exporter = match SessionExporter::new(&session, &label) {
        Ok(exporter) => Arc::new(exporter),
        Err(e) => {
            if let Err(stop) = engine.stop_session(session) {
                tracing::error!("Failed to stop session: {}", stop);
            }
            return Err(e);
        }
    };

    let cancel_token = CancellationToken::new();
    let collector = SessionCollector::new(
        engine,
        session,
        Arc::clone(&exporter),
        Duration::from_millis(args.interval_ms.max(1)),
    );
    let collection_handle = collector.start(cancel_token.clone());

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(Arc::new(AppState { exporter }));

    tracing::warn!("Starting HTTP server on {}", args.listen);
    let listener = tokio::net::TcpListener::bind(args.listen).await?;

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel_token.clone()))
        .await;

    // The session must be stopped even if the server failed
    cancel_token.cancel();
    tracing::info!("Server shutdown complete, waiting for collection loop to finish...");

    match collection_handle.await {
        Ok(result) => result?,
        Err(e) => tracing::error!("Collection task failed: {}", e),
    }
    served?;

    tracing::info!("All tasks completed, exiting");
    Ok(())
}
