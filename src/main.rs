// core-service: reads length-prefixed records off a loopback socket, runs
// them through the Handler/Writer/Sender pipeline, and mirrors them to an
// append-only transaction log.
//
// Startup order: load config, init tracing, bind the IPC listener, then
// hand off to the accept loop.

use clap::Parser;
use core_service::config::{self, ServiceConfig};
use core_service::error::{CrashReporter, LoggingCrashReporter, NoopCrashReporter};
use core_service::ipc::{self, RunSupervisor};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "core-service", version, about = "Run-tracking pipeline daemon")]
struct Cli {
    /// Where to publish the bound IPC port (`sock=host:port\nEOF\n`).
    #[arg(long)]
    port_filename: PathBuf,

    /// PID of the parent process; the daemon exits if it disappears.
    #[arg(long)]
    pid: Option<u32>,

    #[arg(long)]
    debug: bool,

    /// Disable the crash reporter (tests, air-gapped environments).
    #[arg(long)]
    no_observability: bool,

    /// Force-enable tracing regardless of `log_level` in the config file.
    #[arg(long)]
    trace: bool,

    #[arg(long, default_value = "core-service.toml")]
    config: PathBuf,

    /// Base URL of the remote backend.
    #[arg(long, default_value = "https://api.example.com")]
    base_url: String,

    /// Directory under which each run gets its own subdirectory.
    #[arg(long, default_value = ".core-service-runs")]
    runs_root: PathBuf,

    #[arg(long)]
    offline: bool,
}

fn main() {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    runtime.block_on(run(cli));
}

async fn run(cli: Cli) {
    let config = match config::load_config_from_path(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load service config: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&config, cli.debug, cli.trace);

    let crash_reporter: Arc<dyn CrashReporter> = if cli.no_observability {
        Arc::new(NoopCrashReporter)
    } else {
        Arc::new(LoggingCrashReporter)
    };

    info!(version = env!("CARGO_PKG_VERSION"), "core-service starting");

    if let Some(pid) = cli.pid {
        spawn_parent_watchdog(pid);
    }

    let listener = match ipc::bind_and_publish_port(&cli.port_filename).await {
        Ok(listener) => listener,
        Err(e) => {
            crash_reporter.report_fatal(&e);
            error!(error = %e, "failed to bind ipc listener");
            std::process::exit(1);
        }
    };
    info!(addr = ?listener.local_addr().ok(), "ipc listener bound");

    let metrics_probe_path = sibling_metrics_probe_path();
    let http = reqwest::Client::new();
    let supervisor = Arc::new(RunSupervisor::new(
        config,
        http,
        cli.runs_root,
        cli.base_url,
        cli.offline,
        metrics_probe_path,
    ));
    ipc::accept_loop(listener, supervisor).await;
}

/// `metrics-probe` ships as a sibling binary of `core-service`; absent in
/// `cargo test` sandboxes, in which case GPU sampling is simply skipped.
fn sibling_metrics_probe_path() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let candidate = exe.parent()?.join("metrics-probe");
    candidate.is_file().then_some(candidate)
}

fn init_tracing(config: &ServiceConfig, debug: bool, trace: bool) {
    let default_level = if trace {
        "trace"
    } else if debug {
        "debug"
    } else {
        config.log_level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();
}

/// Poll for the parent process's liveness and exit once it's gone, so an
/// orphaned daemon never outlives the client that spawned it.
fn spawn_parent_watchdog(pid: u32) {
    tokio::spawn(async move {
        let path = format!("/proc/{pid}");
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            if !std::path::Path::new(&path).exists() {
                error!(pid, "parent process no longer exists, shutting down");
                std::process::exit(1);
            }
        }
    });
}
