//! Sender: the third pipeline stage. Turns records into remote calls (or,
//! for offline runs, lets them fall through untouched — the Writer has
//! already filtered out everything that shouldn't reach here) and emits a
//! [`RecordResult`] for anything a caller might be waiting on.
//!
//! Artifact records are not handled inline: they are routed to the
//! [`crate::artifacts::ArtifactDownloader`] task, which owns the batching
//! and backpressure logic and replies through the mailbox itself.

use crate::filetransfer::{FileTransferManager, Task as TransferTask};
use crate::remote::RemoteClient;
use proto::{ArtifactAction, FilePolicy, Record, RecordData, RecordResult, ResultPayload};
use tokio::sync::mpsc;

pub struct Sender {
    remote: RemoteClient,
    transfers: FileTransferManager,
    run_id: std::sync::Mutex<Option<String>>,
    artifact_tx: mpsc::Sender<Record>,
    results_tx: mpsc::Sender<RecordResult>,
    offline: bool,
}

impl Sender {
    pub fn new(
        remote: RemoteClient,
        transfers: FileTransferManager,
        artifact_tx: mpsc::Sender<Record>,
        results_tx: mpsc::Sender<RecordResult>,
        offline: bool,
    ) -> Self {
        Sender {
            remote,
            transfers,
            run_id: std::sync::Mutex::new(None),
            artifact_tx,
            results_tx,
            offline,
        }
    }

    pub async fn run(&self, mut in_rx: mpsc::Receiver<Record>) {
        while let Some(record) = in_rx.recv().await {
            let responder_key = record.mailbox_slot().map(str::to_owned);
            let result = self.handle(record).await;
            if let Some(payload) = result {
                let _ = self.results_tx.send(RecordResult::new(responder_key, payload)).await;
            }
        }
    }

    /// Returns `None` when the record was routed elsewhere (artifacts) and
    /// therefore has no immediate result to report here.
    async fn handle(&self, record: Record) -> Option<ResultPayload> {
        match &record.data {
            RecordData::RunStart(run_start) => {
                if self.offline {
                    *self.run_id.lock().unwrap() = Some(run_start.run_id.clone());
                    return Some(ResultPayload::RunStartAck { run_id: run_start.run_id.clone() });
                }
                match self.remote.run_start(run_start).await {
                    Ok(run_id) => {
                        *self.run_id.lock().unwrap() = Some(run_id.clone());
                        Some(ResultPayload::RunStartAck { run_id })
                    }
                    Err(e) => Some(ResultPayload::Error { message: e.to_string() }),
                }
            }
            RecordData::History(history) => {
                if self.offline {
                    return None;
                }
                let run_id = self.current_run_id()?;
                let payload = serde_json::to_value(&history.data).ok()?;
                match self.remote.push_history(&run_id, &payload).await {
                    Ok(()) => record.req_resp().then_some(ResultPayload::Ack),
                    Err(e) => Some(ResultPayload::Error { message: e.to_string() }),
                }
            }
            RecordData::Summary(summary) => {
                if self.offline {
                    return None;
                }
                let run_id = self.current_run_id()?;
                let payload = serde_json::to_value(&summary.data).ok()?;
                match self.remote.push_summary(&run_id, &payload).await {
                    Ok(()) => record.req_resp().then_some(ResultPayload::Ack),
                    Err(e) => Some(ResultPayload::Error { message: e.to_string() }),
                }
            }
            RecordData::Files(files) => {
                if self.offline {
                    return None;
                }
                let run_id = self.current_run_id()?;
                for entry in &files.files {
                    if entry.policy == FilePolicy::End {
                        continue;
                    }
                    let upload_url = format!("{}/runs/{run_id}/files/upload", self.remote_base_url());
                    let task = TransferTask::DefaultUpload {
                        local_path: entry.path.clone(),
                        upload_url,
                    };
                    if let Err(e) = self.transfers.execute(task).await {
                        tracing::warn!(error = %e, path = %entry.path, "file upload failed");
                    }
                }
                record.req_resp().then_some(ResultPayload::Ack)
            }
            RecordData::Artifact(_) => {
                self.route_artifact(record.clone()).await;
                None
            }
            RecordData::Exit(exit) => {
                let exit_code = exit.exit_code;
                if !self.offline {
                    if let Some(run_id) = self.current_run_id() {
                        if let Err(e) = self.remote.mark_exit(&run_id, exit_code).await {
                            tracing::warn!(error = %e, "failed to mark run exit on the remote");
                        }
                    }
                }
                // An upload or artifact download submitted just before Exit
                // may still be running on the shared FileTransferManager
                // (the ArtifactDownloader task submits to the same one).
                // Drain it before acking the exit.
                self.transfers.wait_idle().await;
                Some(ResultPayload::Exit { exit_code })
            }
            RecordData::Request(_) => Some(ResultPayload::Ack),
            RecordData::Config(_) | RecordData::RunUpdate(_) | RecordData::TbRecord(_) => {
                record.req_resp().then_some(ResultPayload::Ack)
            }
        }
    }

    async fn route_artifact(&self, record: Record) {
        if self.artifact_tx.send(record).await.is_err() {
            tracing::warn!("artifact downloader channel closed, dropping artifact record");
        }
    }

    fn current_run_id(&self) -> Option<String> {
        self.run_id.lock().unwrap().clone()
    }

    fn remote_base_url(&self) -> String {
        // Exposed for the files-upload URL above; keeps `RemoteClient`'s
        // base URL private everywhere else.
        self.remote.base_url_for_uploads()
    }
}
