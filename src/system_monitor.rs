//! System resource sampling.
//!
//! CPU and memory are read directly from `/proc` on a fixed interval. GPU
//! figures are not: vendor tooling is a separate concern with its own
//! crash modes, so it lives in a standalone `metrics-probe` subprocess and
//! this module only parses its JSON-per-line stdout. If the probe exits or
//! was never found, GPU fields are simply absent from samples.

use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub timestamp_ms: i64,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub gpu_percent: Option<f64>,
    pub gpu_memory_percent: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ProbeSample {
    gpu_percent: Option<f64>,
    gpu_memory_percent: Option<f64>,
}

pub trait SystemMonitor: Send + Sync {
    /// Start sampling at `interval`, sending each [`Sample`] on `tx` until
    /// the monitor is dropped or told to stop.
    fn start(&self, interval: std::time::Duration, tx: mpsc::Sender<Sample>);
    fn stop(&self);
}

/// Spawns `metrics_probe_path` as a child process for GPU figures and reads
/// `/proc/stat` / `/proc/meminfo` directly for CPU and memory.
pub struct DefaultSystemMonitor {
    metrics_probe_path: Option<std::path::PathBuf>,
    running: Arc<AtomicBool>,
}

impl DefaultSystemMonitor {
    pub fn new(metrics_probe_path: Option<std::path::PathBuf>) -> Self {
        DefaultSystemMonitor {
            metrics_probe_path,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn spawn_probe(path: &std::path::Path) -> Option<Child> {
        Command::new(path)
            .arg("--pid")
            .arg(std::process::id().to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .ok()
    }

    fn read_cpu_percent() -> Option<f64> {
        let contents = std::fs::read_to_string("/proc/loadavg").ok()?;
        let load1: f64 = contents.split_whitespace().next()?.parse().ok()?;
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1) as f64;
        Some((load1 / cpus * 100.0).min(100.0))
    }

    fn read_memory_percent() -> Option<f64> {
        let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
        let mut total_kb = None;
        let mut available_kb = None;
        for line in contents.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                total_kb = rest.trim().split_whitespace().next()?.parse::<f64>().ok();
            } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
                available_kb = rest.trim().split_whitespace().next()?.parse::<f64>().ok();
            }
        }
        let (total, available) = (total_kb?, available_kb?);
        if total <= 0.0 {
            return None;
        }
        Some((1.0 - available / total) * 100.0)
    }
}

impl SystemMonitor for DefaultSystemMonitor {
    fn start(&self, interval: std::time::Duration, tx: mpsc::Sender<Sample>) {
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let probe_path = self.metrics_probe_path.clone();

        tokio::spawn(async move {
            let mut probe_lines = match &probe_path {
                Some(path) => Self::spawn_probe(path).await.and_then(|mut child| {
                    child.stdout.take().map(|stdout| BufReader::new(stdout).lines())
                }),
                None => None,
            };
            let mut latest_gpu: Option<ProbeSample> = None;
            let mut ticker = tokio::time::interval(interval);

            while running.load(Ordering::SeqCst) {
                ticker.tick().await;

                if let Some(lines) = probe_lines.as_mut() {
                    while let Ok(Some(line)) = tokio::time::timeout(
                        std::time::Duration::from_millis(1),
                        lines.next_line(),
                    )
                    .await
                    .unwrap_or(Ok(None))
                    {
                        if let Ok(sample) = serde_json::from_str::<ProbeSample>(&line) {
                            latest_gpu = Some(sample);
                        }
                    }
                }

                let sample = Sample {
                    timestamp_ms: chrono::Utc::now().timestamp_millis(),
                    cpu_percent: Self::read_cpu_percent(),
                    memory_percent: Self::read_memory_percent(),
                    gpu_percent: latest_gpu.as_ref().and_then(|s| s.gpu_percent),
                    gpu_memory_percent: latest_gpu.as_ref().and_then(|s| s.gpu_memory_percent),
                };
                if tx.send(sample).await.is_err() {
                    break;
                }
            }
        });
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
