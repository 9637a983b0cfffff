//! Dispatcher: the last pipeline stage. Collects [`RecordResult`]s from
//! wherever they originate (the Handler's local answers, the Sender's
//! remote-call outcomes, the ArtifactDownloader's completions) and routes
//! each one to the mailbox slot that is waiting for it.
//!
//! A result with no `responder_key` is a fire-and-forget acknowledgment;
//! it is logged at debug level and otherwise dropped.

use crate::mailbox::Mailbox;
use proto::RecordResult;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct Dispatcher {
    mailbox: Arc<Mailbox>,
}

impl Dispatcher {
    pub fn new(mailbox: Arc<Mailbox>) -> Self {
        Dispatcher { mailbox }
    }

    /// Merge `sources` into one stream and route every result until all of
    /// them close.
    pub async fn run(&self, mut sources: Vec<mpsc::Receiver<RecordResult>>) {
        loop {
            if sources.is_empty() {
                break;
            }
            let mut received = None;
            let mut closed_index = None;
            {
                let futures: Vec<_> = sources.iter_mut().map(|rx| Box::pin(rx.recv())).collect();
                let (result, index, _rest) = futures_util::future::select_all(futures).await;
                match result {
                    Some(record_result) => received = Some(record_result),
                    None => closed_index = Some(index),
                }
            }
            if let Some(record_result) = received {
                self.route(record_result);
            }
            if let Some(index) = closed_index {
                sources.remove(index);
            }
        }
    }

    fn route(&self, result: RecordResult) {
        match result.responder_key.clone() {
            Some(key) => self.mailbox.deliver(&key, result),
            None => tracing::debug!("dropping fire-and-forget result with no responder key"),
        }
    }
}
