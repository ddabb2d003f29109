//! Retrace command-line replayer.
//!
//! # Usage
//!
//! ```bash
//! # Replay every endpoint, servers first
//! retrace traces/handshake.json
//!
//! # Replay selected endpoints only, without a log file
//! retrace traces/handshake.json --endpoint 1 --endpoint 2 --no-log-file
//! ```

use std::{path::PathBuf, process::ExitCode, time::Duration};

use clap::Parser;
use retrace_engine::{
    AppConfig, EndpointId, EndpointStatus, Engine, EngineConfig, LogSubscriber, Trace,
};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// How long to wait for server listeners before starting clients.
const LISTENER_WAIT: Duration = Duration::from_secs(1);

/// Poll interval while waiting for listeners.
const LISTENER_POLL: Duration = Duration::from_millis(10);

/// Retrace network trace replayer
#[derive(Parser, Debug)]
#[command(name = "retrace")]
#[command(about = "Replay captured network traces against real sockets")]
#[command(version)]
struct Args {
    /// Trace file (JSON)
    trace: PathBuf,

    /// Endpoint to start (repeatable; default: all)
    #[arg(short, long = "endpoint")]
    endpoints: Vec<EndpointId>,

    /// Config file (default: retrace.json, .retrace.json, ~/.config/retrace/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log file (default: <logs_dir>/<trace name>.log)
    #[arg(long, conflicts_with = "no_log_file")]
    log_file: Option<PathBuf>,

    /// Disable the log file
    #[arg(long)]
    no_log_file: bool,

    /// In-memory log history size (overrides config and trace)
    #[arg(long)]
    log_lines: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    // stdout carries the replay log
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let app = AppConfig::load(args.config.as_deref())?;
    let trace = Trace::load(&args.trace)?;
    tracing::info!("Loaded trace {}", args.trace.display());

    let config = engine_config(&args, &app, &trace);
    let engine = Engine::new(trace, config).await?;

    let printer = engine.log().subscribe().map(|subscriber| tokio::spawn(print_lines(subscriber)));

    let selected = selected_endpoints(&args, &engine);
    let (servers, clients): (Vec<_>, Vec<_>) = selected
        .iter()
        .copied()
        .partition(|id| engine.trace().endpoint(*id).is_some_and(|ep| ep.is_server()));

    for &id in &servers {
        engine.start_endpoint(id);
    }
    wait_for_listeners(&engine, &servers).await;
    for &id in &clients {
        engine.start_endpoint(id);
    }

    tokio::select! {
        () = engine.wait_until_idle(), if !clients.is_empty() => {},
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
            tracing::info!("Interrupted, stopping");
        },
    }

    for (id, status) in engine.statuses() {
        tracing::info!("Endpoint {} {}", id, status);
    }
    let failed: Vec<_> = selected
        .iter()
        .copied()
        .filter(|id| engine.status(*id) == EndpointStatus::Error)
        .collect();

    engine.shutdown().await;
    if let Some(printer) = printer {
        printer.await?;
    }

    if failed.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        tracing::warn!("Endpoints with errors: {:?}", failed);
        Ok(ExitCode::FAILURE)
    }
}

/// Merge trace globals, the config file and CLI flags.
fn engine_config(args: &Args, app: &AppConfig, trace: &Trace) -> EngineConfig {
    let mut config = EngineConfig::from_globals(&trace.globals);
    if trace.globals.log_lines.is_none() {
        config.log_capacity = app.log_lines;
    }
    if let Some(lines) = args.log_lines {
        config.log_capacity = lines;
    }
    config.log_file = if args.no_log_file {
        None
    } else {
        Some(args.log_file.clone().unwrap_or_else(|| app.log_path_for(&args.trace)))
    };
    config.normalized()
}

fn selected_endpoints(args: &Args, engine: &Engine) -> Vec<EndpointId> {
    if args.endpoints.is_empty() {
        engine.trace().endpoints.iter().map(|endpoint| endpoint.id).collect()
    } else {
        args.endpoints.clone()
    }
}

/// Give servers a moment to bind so clients do not dial too early.
async fn wait_for_listeners(engine: &Engine, servers: &[EndpointId]) {
    let deadline = tokio::time::Instant::now() + LISTENER_WAIT;
    while tokio::time::Instant::now() < deadline {
        let pending = servers
            .iter()
            .any(|id| engine.is_running(*id) && engine.listener_addr(*id).is_none());
        if !pending {
            return;
        }
        tokio::time::sleep(LISTENER_POLL).await;
    }
    tracing::warn!("Some listeners were not ready after {}ms", LISTENER_WAIT.as_millis());
}

async fn print_lines(mut subscriber: LogSubscriber) {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = subscriber.recv().await {
        let mut bytes = line.into_bytes();
        bytes.push(b'\n');
        if stdout.write_all(&bytes).await.is_err() {
            break;
        }
    }
    if let Err(e) = stdout.flush().await {
        tracing::debug!("stdout flush failed: {}", e);
    }
}
