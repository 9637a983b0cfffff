//! ArtifactDownloader: fetches an artifact's files according to its
//! manifest, batching requests to the control plane and bounding how far
//! ahead of actual disk writes the scheduler is allowed to run.
//!
//! The batch size, backlog cap, and stale-URL heuristic below are chosen so
//! a single artifact with hundreds of thousands of files doesn't either
//! stall on one giant manifest request or flood the transfer manager with
//! more in-flight work than it can usefully schedule.

use crate::filecache::FileCache;
use crate::filetransfer::{FileTransferManager, Task as TransferTask};
use crate::mailbox::Mailbox;
use crate::remote::RemoteClient;
use proto::{ArtifactAction, ManifestEntry, Record, RecordData, RecordResult, ResultPayload};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;

/// Maximum manifest entries resolved to download URLs in one control-plane
/// round trip.
pub const BATCH_SIZE: usize = 10_000;
/// Maximum entries scheduled onto the transfer manager before the
/// downloader pauses to let the backlog drain.
pub const MAX_BACKLOG: usize = 10_000;
/// A signed download URL is treated as possibly-expired once it is this
/// old, and refreshed before being retried.
pub const STALE_URL_AGE: Duration = Duration::from_secs(60 * 60);

pub struct ArtifactDownloader {
    remote: RemoteClient,
    transfers: FileTransferManager,
    cache: Arc<dyn FileCache>,
    mailbox: Arc<Mailbox>,
}

/// What a scheduled entry's transfer task reported back on the results
/// channel, matched back up against the working set by logical path.
enum DownloadOutcome {
    Done { logical_path: String },
    Failed { logical_path: String, entry: ManifestEntry, message: String },
}

impl ArtifactDownloader {
    pub fn new(
        remote: RemoteClient,
        transfers: FileTransferManager,
        cache: Arc<dyn FileCache>,
        mailbox: Arc<Mailbox>,
    ) -> Self {
        ArtifactDownloader { remote, transfers, cache, mailbox }
    }

    pub async fn run(&self, mut in_rx: mpsc::Receiver<Record>) {
        while let Some(record) = in_rx.recv().await {
            let responder_key = record.mailbox_slot().map(str::to_owned);
            let payload = match &record.data {
                RecordData::Artifact(artifact) => match &artifact.action {
                    ArtifactAction::Download { artifact_id, download_root, skip_cache } => {
                        self.download(artifact_id, download_root, *skip_cache).await
                    }
                    ArtifactAction::Upload { .. } => ResultPayload::Error {
                        message: "artifact upload is not implemented by this downloader".to_owned(),
                    },
                },
                _ => ResultPayload::Error { message: "non-artifact record reached the downloader".to_owned() },
            };
            if let Some(key) = responder_key {
                self.mailbox.deliver(&key, RecordResult::new(Some(key.clone()), payload));
            }
        }
    }

    /// Drives the manifest to completion: batches regular entries through
    /// `resolve_file_urls`, schedules each resolved entry onto the transfer
    /// manager in parallel, and applies backpressure and stale-URL retry
    /// off a shared results channel. Returns once every entry is either
    /// counted done or has produced a fatal error.
    async fn download(&self, artifact_id: &str, download_root: &str, skip_cache: bool) -> ResultPayload {
        let manifest = match self.remote.fetch_manifest(artifact_id).await {
            Ok(m) => m,
            Err(e) => return ResultPayload::Error { message: e.to_string() },
        };

        let total = manifest.contents.len();
        let mut pending: VecDeque<(String, ManifestEntry)> = VecDeque::new();
        let mut num_done = 0usize;
        for (logical_path, entry) in manifest.contents {
            if entry.is_reference() {
                // A reference entry's URI is the answer; never fetched.
                num_done += 1;
            } else {
                pending.push_back((logical_path, entry));
            }
        }

        let (results_tx, mut results_rx) = mpsc::channel::<DownloadOutcome>(BATCH_SIZE.min(4096).max(1));
        let mut scheduled_at: HashMap<String, SystemTime> = HashMap::new();
        let mut in_progress = 0usize;

        while num_done < total {
            if in_progress < MAX_BACKLOG && !pending.is_empty() {
                let mut batch = Vec::with_capacity(pending.len().min(BATCH_SIZE));
                while batch.len() < BATCH_SIZE {
                    let Some(item) = pending.pop_front() else { break };
                    batch.push(item);
                }

                let logical_paths: Vec<String> = batch.iter().map(|(path, _)| path.clone()).collect();
                let resolved = match self.remote.resolve_file_urls(artifact_id, &logical_paths).await {
                    Ok(map) => map,
                    Err(e) => return ResultPayload::Error { message: e.to_string() },
                };

                let now = SystemTime::now();
                for (logical_path, mut entry) in batch {
                    let Some(download_url) = resolved.get(&logical_path).cloned() else {
                        return ResultPayload::Error {
                            message: format!("no signed url returned for '{logical_path}'"),
                        };
                    };
                    entry.download_url = Some(download_url);
                    entry.local_path = Some(logical_path.clone());
                    scheduled_at.insert(logical_path.clone(), now);
                    self.schedule(download_root, skip_cache, logical_path, entry, results_tx.clone());
                    in_progress += 1;
                }
                continue;
            }

            // Nothing left to batch right now, or the backlog is full:
            // block on progress. The invariant num_done + pending.len() +
            // in_progress == total guarantees there is always something to
            // wait for here once the batching branch above is skipped.
            let Some(outcome) = results_rx.recv().await else { break };
            in_progress -= 1;
            match outcome {
                DownloadOutcome::Done { logical_path } => {
                    scheduled_at.remove(&logical_path);
                    num_done += 1;
                }
                DownloadOutcome::Failed { logical_path, entry, message } => {
                    let stale = scheduled_at.remove(&logical_path).map(is_stale).unwrap_or(false);
                    if stale {
                        pending.push_back((logical_path, entry));
                    } else {
                        return ResultPayload::Error { message };
                    }
                }
            }
        }

        ResultPayload::Ack
    }

    /// Spawns the cache-probe-then-transfer for one resolved entry as its
    /// own task so entries download in parallel; reports back on
    /// `results_tx` instead of returning, since the caller has already
    /// moved on to scheduling or awaiting other work by the time this
    /// finishes.
    fn schedule(
        &self,
        download_root: &str,
        skip_cache: bool,
        logical_path: String,
        entry: ManifestEntry,
        results_tx: mpsc::Sender<DownloadOutcome>,
    ) {
        let local_path = format!("{download_root}/{logical_path}");
        let cache = self.cache.clone();
        let transfers = self.transfers.clone();

        tokio::spawn(async move {
            let dest = std::path::Path::new(&local_path);
            if !skip_cache {
                match cache.restore_to(&entry.digest, dest) {
                    Ok(true) => {
                        let _ = results_tx.send(DownloadOutcome::Done { logical_path }).await;
                        return;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        let _ = results_tx
                            .send(DownloadOutcome::Failed { logical_path, entry, message: e.to_string() })
                            .await;
                        return;
                    }
                }
            }

            let Some(download_url) = entry.download_url.clone() else {
                let _ = results_tx
                    .send(DownloadOutcome::Failed {
                        logical_path: logical_path.clone(),
                        entry,
                        message: format!("manifest entry '{logical_path}' has no resolved download url"),
                    })
                    .await;
                return;
            };
            let task = TransferTask::DefaultDownload { download_url, local_path: local_path.clone() };
            if let Err(e) = transfers.execute(task).await {
                let _ = results_tx
                    .send(DownloadOutcome::Failed { logical_path, entry, message: e.to_string() })
                    .await;
                return;
            }

            if !skip_cache {
                if let Err(e) = cache.add_file_and_check_digest(dest, &entry.digest) {
                    tracing::warn!(error = %e, path = %local_path, "cache insert failed after successful download");
                }
            }
            let _ = results_tx.send(DownloadOutcome::Done { logical_path }).await;
        });
    }
}

/// True if `stamped_at` is old enough that a previously-fetched download
/// URL should be treated as possibly expired.
pub fn is_stale(stamped_at: SystemTime) -> bool {
    SystemTime::now().duration_since(stamped_at).map(|age| age >= STALE_URL_AGE).unwrap_or(false)
}
