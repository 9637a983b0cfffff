//! File transfer backends and the manager that dispatches tasks to them.
//!
//! Mirrors the shape of a concrete per-backend struct rather than a trait
//! object: each backend is a known, finite set (default HTTP PUT, S3, GCS,
//! Azure) and each gets its own concurrency cap, so a `match` on
//! [`Backend`] plus one [`tokio::sync::Semaphore`] per arm is simpler than a
//! dyn trait and just as extensible for the backends this system actually
//! has.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::config::TransferConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Default,
    S3,
    Gcs,
    Azure,
}

impl Backend {
    fn from_url(url: &str) -> Self {
        if url.starts_with("s3://") || url.contains(".s3.") || url.contains(".s3-") {
            Backend::S3
        } else if url.starts_with("gs://") || url.contains(".storage.googleapis.com") {
            Backend::Gcs
        } else if url.contains(".blob.core.windows.net") {
            Backend::Azure
        } else {
            Backend::Default
        }
    }
}

#[derive(Debug, Clone)]
pub enum Task {
    DefaultUpload { local_path: String, upload_url: String },
    DefaultDownload { download_url: String, local_path: String },
    ReferenceArtifactUpload { local_path: String, reference_url: String },
    ReferenceArtifactDownload { reference_url: String, local_path: String },
}

impl Task {
    fn backend(&self) -> Backend {
        match self {
            Task::DefaultUpload { upload_url, .. } => Backend::from_url(upload_url),
            Task::DefaultDownload { download_url, .. } => Backend::from_url(download_url),
            Task::ReferenceArtifactUpload { reference_url, .. }
            | Task::ReferenceArtifactDownload { reference_url, .. } => Backend::from_url(reference_url),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("transfer request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server returned status {0}")]
    BadStatus(reqwest::StatusCode),
}

/// Running byte/request counters, exposed for the system monitor and for
/// shutdown-time logging. All fields are independently atomic; there is no
/// consistent "snapshot" beyond approximate agreement.
#[derive(Default)]
pub struct FileTransferStats {
    uploaded_bytes: AtomicU64,
    downloaded_bytes: AtomicU64,
    completed_tasks: AtomicU64,
    failed_tasks: AtomicU64,
}

impl FileTransferStats {
    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes.load(Ordering::Relaxed)
    }
    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes.load(Ordering::Relaxed)
    }
    pub fn completed_tasks(&self) -> u64 {
        self.completed_tasks.load(Ordering::Relaxed)
    }
    pub fn failed_tasks(&self) -> u64 {
        self.failed_tasks.load(Ordering::Relaxed)
    }
}

struct BackendSlot {
    semaphore: Arc<Semaphore>,
}

/// Owns one semaphore per backend and a shared `reqwest::Client`. Cloning
/// is cheap; every clone shares the same semaphores and stats.
#[derive(Clone)]
pub struct FileTransferManager {
    client: reqwest::Client,
    stats: Arc<FileTransferStats>,
    in_flight: Arc<AtomicU64>,
    default_slot: Arc<BackendSlot>,
    s3_slot: Arc<BackendSlot>,
    gcs_slot: Arc<BackendSlot>,
    azure_slot: Arc<BackendSlot>,
}

impl FileTransferManager {
    pub fn new(client: reqwest::Client, config: &TransferConfig) -> Self {
        FileTransferManager {
            client,
            stats: Arc::new(FileTransferStats::default()),
            in_flight: Arc::new(AtomicU64::new(0)),
            default_slot: Arc::new(BackendSlot {
                semaphore: Arc::new(Semaphore::new(config.default_concurrency)),
            }),
            s3_slot: Arc::new(BackendSlot {
                semaphore: Arc::new(Semaphore::new(config.s3_concurrency)),
            }),
            gcs_slot: Arc::new(BackendSlot {
                semaphore: Arc::new(Semaphore::new(config.gcs_concurrency)),
            }),
            azure_slot: Arc::new(BackendSlot {
                semaphore: Arc::new(Semaphore::new(config.azure_concurrency)),
            }),
        }
    }

    pub fn stats(&self) -> Arc<FileTransferStats> {
        self.stats.clone()
    }

    fn slot_for(&self, backend: Backend) -> Arc<BackendSlot> {
        match backend {
            Backend::Default => self.default_slot.clone(),
            Backend::S3 => self.s3_slot.clone(),
            Backend::Gcs => self.gcs_slot.clone(),
            Backend::Azure => self.azure_slot.clone(),
        }
    }

    /// Execute `task`, acquiring the appropriate backend's concurrency
    /// permit first. The permit is held for the lifetime of the transfer,
    /// so a slow backend can't starve the others.
    pub async fn execute(&self, task: Task) -> Result<(), TransferError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = self.execute_inner(task).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn execute_inner(&self, task: Task) -> Result<(), TransferError> {
        let slot = self.slot_for(task.backend());
        let _permit = slot.semaphore.acquire().await.expect("semaphore never closed");
        let result = self.run(&task).await;
        match &result {
            Ok(()) => {
                self.stats.completed_tasks.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.failed_tasks.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    /// Number of tasks currently between `execute` entry and return, across
    /// every clone of this manager (submitters and the manager share the
    /// same counter via the underlying `Arc`).
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Block until no task submitted through any clone of this manager is
    /// still running. Used at `Exit` to guarantee an upload or download
    /// submitted just before shutdown isn't silently dropped.
    pub async fn wait_idle(&self) {
        while self.in_flight_count() > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    async fn run(&self, task: &Task) -> Result<(), TransferError> {
        match task {
            Task::DefaultUpload { local_path, upload_url } => {
                let bytes = tokio::fs::read(local_path).await?;
                let len = bytes.len() as u64;
                let response = self.client.put(upload_url).body(bytes).send().await?;
                if !response.status().is_success() {
                    return Err(TransferError::BadStatus(response.status()));
                }
                self.stats.uploaded_bytes.fetch_add(len, Ordering::Relaxed);
                Ok(())
            }
            Task::DefaultDownload { download_url, local_path } => {
                let response = self.client.get(download_url).send().await?;
                if !response.status().is_success() {
                    return Err(TransferError::BadStatus(response.status()));
                }
                let bytes = response.bytes().await?;
                let len = bytes.len() as u64;
                if let Some(parent) = std::path::Path::new(local_path).parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(local_path, &bytes).await?;
                self.stats.downloaded_bytes.fetch_add(len, Ordering::Relaxed);
                Ok(())
            }
            Task::ReferenceArtifactUpload { local_path, reference_url } => {
                let bytes = tokio::fs::read(local_path).await?;
                let len = bytes.len() as u64;
                let response = self.client.put(reference_url).body(bytes).send().await?;
                if !response.status().is_success() {
                    return Err(TransferError::BadStatus(response.status()));
                }
                self.stats.uploaded_bytes.fetch_add(len, Ordering::Relaxed);
                Ok(())
            }
            Task::ReferenceArtifactDownload { reference_url, local_path } => {
                let response = self.client.get(reference_url).send().await?;
                if !response.status().is_success() {
                    return Err(TransferError::BadStatus(response.status()));
                }
                let bytes = response.bytes().await?;
                let len = bytes.len() as u64;
                if let Some(parent) = std::path::Path::new(local_path).parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(local_path, &bytes).await?;
                self.stats.downloaded_bytes.fetch_add(len, Ordering::Relaxed);
                Ok(())
            }
        }
    }
}
