//! metrics-probe: standalone subprocess that samples GPU utilization and
//! prints one JSON object per line to stdout.
//!
//! Kept out of the main daemon process because vendor GPU tooling
//! (`nvidia-smi` here) has its own crash modes and startup latency that
//! shouldn't be allowed to affect the run pipeline. `METRICS_PROBE_FAKE_GPU`
//! bypasses the `nvidia-smi` call entirely so tests get deterministic
//! samples without real GPU hardware.

use clap::Parser;
use serde::Serialize;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "metrics-probe")]
struct Cli {
    /// PID of the process to monitor; the probe exits once it disappears.
    #[arg(long)]
    pid: Option<u32>,

    #[arg(long, default_value_t = 2000)]
    interval_ms: u64,
}

#[derive(Debug, Serialize)]
struct ProbeSample {
    gpu_percent: Option<f64>,
    gpu_memory_percent: Option<f64>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let interval = Duration::from_millis(cli.interval_ms);
    let fake = std::env::var("METRICS_PROBE_FAKE_GPU").is_ok();

    loop {
        if let Some(pid) = cli.pid {
            if !std::path::Path::new(&format!("/proc/{pid}")).exists() {
                tracing::info!(pid, "monitored process is gone, exiting");
                break;
            }
        }

        let sample = if fake {
            fake_sample()
        } else {
            sample_via_nvidia_smi().unwrap_or(ProbeSample { gpu_percent: None, gpu_memory_percent: None })
        };

        match serde_json::to_string(&sample) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "failed to serialize sample"),
        }

        std::thread::sleep(interval);
    }
}

/// A fixed, deterministic sample for tests: 50% utilization, 25% memory.
fn fake_sample() -> ProbeSample {
    ProbeSample { gpu_percent: Some(50.0), gpu_memory_percent: Some(25.0) }
}

fn sample_via_nvidia_smi() -> Option<ProbeSample> {
    let output = std::process::Command::new("nvidia-smi")
        .args(["--query-gpu=utilization.gpu,memory.used,memory.total", "--format=csv,noheader,nounits"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let first_line = text.lines().next()?;
    let mut fields = first_line.split(',').map(str::trim);
    let utilization: f64 = fields.next()?.parse().ok()?;
    let used: f64 = fields.next()?.parse().ok()?;
    let total: f64 = fields.next()?.parse().ok()?;
    if total <= 0.0 {
        return None;
    }
    Some(ProbeSample { gpu_percent: Some(utilization), gpu_memory_percent: Some(used / total * 100.0) })
}
