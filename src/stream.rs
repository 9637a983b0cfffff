//! Stream: owns and wires together one run's full pipeline —
//! Handler, Writer, Sender, ArtifactDownloader, and Dispatcher — and gives
//! the IPC layer a single handle to push records in and await replies on.

use crate::config::ServiceConfig;
use crate::filecache::{FileCache, FullFileCache, HashOnlyFileCache};
use crate::filetransfer::FileTransferManager;
use crate::handler::Handler;
use crate::mailbox::{Mailbox, MailboxOutcome};
use crate::remote::RemoteClient;
use crate::sender::Sender;
use crate::settings::Settings;
use crate::store::Journal;
use crate::system_monitor::{DefaultSystemMonitor, SystemMonitor};
use crate::writer::Writer;
use crate::{artifacts::ArtifactDownloader, dispatcher::Dispatcher};
use proto::{Record, RecordResult};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Bounded channel capacity between pipeline stages. A small number is
/// deliberate: it is what turns a slow Sender into backpressure the
/// Handler (and ultimately the IPC caller) actually feels.
pub const CHANNEL_CAPACITY: usize = 32;

pub struct Stream {
    mailbox: Arc<Mailbox>,
    in_tx: mpsc::Sender<Record>,
    handler_task: JoinHandle<()>,
    writer_task: JoinHandle<u64>,
    sender_task: JoinHandle<()>,
    artifacts_task: JoinHandle<()>,
    dispatcher_task: JoinHandle<()>,
}

impl Stream {
    /// Build and start every stage. `journal` is `None` in sync mode, where
    /// persistence is skipped because the journal being replayed is the
    /// input, not the output.
    pub fn start(
        settings: &Settings,
        config: &ServiceConfig,
        journal: Option<Journal>,
        http: reqwest::Client,
        metrics_probe_path: Option<std::path::PathBuf>,
    ) -> Self {
        let mailbox = Arc::new(Mailbox::new());

        let (handler_out_tx, handler_out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (writer_out_tx, writer_out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (artifact_tx, artifact_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (sender_results_tx, sender_results_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (handler_results_tx, handler_results_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let monitor: Arc<dyn SystemMonitor> = Arc::new(DefaultSystemMonitor::new(metrics_probe_path));
        let mut handler = Handler::new(handler_out_tx, handler_results_tx, monitor);
        let handler_task = tokio::spawn(async move {
            handler.run(in_rx).await;
        });

        let mut writer = Writer::new(journal, settings.offline, writer_out_tx);
        let writer_task = tokio::spawn(async move { writer.run(handler_out_rx).await });

        let remote = RemoteClient::new(http.clone(), settings.base_url.clone(), config.backoff.clone());
        let transfers = FileTransferManager::new(http.clone(), &config.transfer);
        let sender = Sender::new(remote.clone(), transfers.clone(), artifact_tx, sender_results_tx, settings.offline);
        let sender_task = tokio::spawn(async move {
            sender.run(writer_out_rx).await;
        });

        let cache: Arc<dyn FileCache> = if settings.cache_hash_only {
            Arc::new(HashOnlyFileCache::new())
        } else {
            Arc::new(FullFileCache::new(settings.cache_dir.clone()))
        };
        let downloader = ArtifactDownloader::new(remote, transfers, cache, mailbox.clone());
        let artifacts_task = tokio::spawn(async move {
            downloader.run(artifact_rx).await;
        });

        let dispatcher = Dispatcher::new(mailbox.clone());
        let dispatcher_task = tokio::spawn(async move {
            dispatcher.run(vec![sender_results_rx, handler_results_rx]).await;
        });

        Stream {
            mailbox,
            in_tx,
            handler_task,
            writer_task,
            sender_task,
            artifacts_task,
            dispatcher_task,
        }
    }

    /// Push one record into the pipeline. Backpressure from a full channel
    /// is visible to the caller as this future not resolving.
    pub async fn push(&self, record: Record) {
        let _ = self.in_tx.send(record).await;
    }

    /// Reserve a mailbox slot without pushing anything, for callers that
    /// need to push the record and await the reply as two separate steps.
    pub fn reserve_slot(&self, slot: impl Into<String>) -> crate::mailbox::MailboxReader {
        self.mailbox.reserve(slot)
    }

    /// Push a record and wait for its reply. The caller is responsible for
    /// stamping `control.mailbox_slot` and `req_resp` beforehand.
    pub async fn push_and_wait(&self, mut record: Record, slot: String) -> RecordResult {
        let control = record.control.get_or_insert_with(Default::default);
        control.mailbox_slot = Some(slot.clone());
        control.req_resp = true;
        let reader = self.mailbox.reserve(slot);
        self.push(record).await;
        match reader.recv().await {
            MailboxOutcome::Delivered(result) => result,
            MailboxOutcome::Cancelled => RecordResult::new(None, proto::ResultPayload::Cancelled),
        }
    }

    /// Push an `Exit` record, wait for its reply, then close. The
    /// combination callers reach for on a normal (non-crash) shutdown.
    ///
    /// The record is marked `AlwaysSend`: an offline run still needs its
    /// Exit to reach the Sender so the drain-and-reply round trip this
    /// method blocks on actually completes.
    pub async fn finish_and_close(self, exit_code: i32) -> (RecordResult, Result<(), crate::error::FatalError>) {
        let exit_record = Record::with_control(
            proto::RecordData::Exit(proto::ExitRecord { exit_code }),
            proto::Control::always_send(),
        );
        let result = self.push_and_wait(exit_record, "exit".to_owned()).await;
        let closed = self.close().await;
        (result, closed)
    }

    /// Close the inbound channel and wait for every stage to drain and
    /// exit, in pipeline order. Fails with `JournalDegraded` if any journal
    /// append was lost along the way; every stage has still fully drained
    /// by the time this returns either way.
    pub async fn close(self) -> Result<(), crate::error::FatalError> {
        drop(self.in_tx);
        let _ = self.handler_task.await;
        let failed_appends = self.writer_task.await.unwrap_or(0);
        let _ = self.sender_task.await;
        self.mailbox.close();
        let _ = self.artifacts_task.await;
        let _ = self.dispatcher_task.await;

        if failed_appends > 0 {
            Err(crate::error::FatalError::JournalDegraded(failed_appends))
        } else {
            Ok(())
        }
    }
}
