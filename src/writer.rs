//! Writer: the second pipeline stage. Persists records to the transaction
//! log and forwards them toward the [`crate::sender::Sender`].
//!
//! `Request` records are control-plane only and skip the journal entirely.
//! In sync mode (replaying an existing journal against the remote) the
//! journal is the *source*, not a destination, so persistence is skipped
//! for every record regardless of type.

use crate::store::Journal;
use proto::Record;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::mpsc;

pub struct Writer {
    journal: Option<Journal>,
    offline: bool,
    out_tx: mpsc::Sender<Record>,
    next_num: AtomicI64,
}

impl Writer {
    pub fn new(journal: Option<Journal>, offline: bool, out_tx: mpsc::Sender<Record>) -> Self {
        Writer {
            journal,
            offline,
            out_tx,
            next_num: AtomicI64::new(1),
        }
    }

    /// Number of journal appends that failed during this run. Checked at
    /// shutdown: see [`crate::error::FatalError::JournalDegraded`].
    pub fn failed_append_count(&self) -> u64 {
        self.journal.as_ref().map_or(0, Journal::failed_append_count)
    }

    /// Drain `in_rx` until it closes, persisting and forwarding along the
    /// way, and return the final failed-append count for the shutdown
    /// durability check.
    pub async fn run(&mut self, mut in_rx: mpsc::Receiver<Record>) -> u64 {
        while let Some(mut record) = in_rx.recv().await {
            if !record.is_request() {
                record.num = self.next_num.fetch_add(1, Ordering::SeqCst);
                if let Some(journal) = self.journal.as_mut() {
                    // A single failed append does not stop the run; it is
                    // counted and the record still proceeds toward the
                    // Sender so the remote copy isn't also lost.
                    if let Err(e) = journal.append(&record).await {
                        tracing::warn!(error = %e, "journal append failed, continuing");
                    }
                }
            }

            let should_forward = !self.offline || record.always_send() || record.is_request();
            if should_forward && self.out_tx.send(record).await.is_err() {
                break;
            }
        }
        if let Some(journal) = self.journal.as_mut() {
            let _ = journal.flush().await;
        }
        self.failed_append_count()
    }
}
