//! Mailbox: correlates asynchronous server replies with client requests.
//!
//! A concrete, single-purpose primitive — not a general futures library.
//! Slot keys originate in the client; reserving a key before its record
//! enters the pipeline is the caller's responsibility.
//!
//! Contract: exactly one of delivery or cancellation occurs for each
//! reserved slot.

use proto::RecordResult;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// What a reserved slot's reader ultimately observes.
#[derive(Debug)]
pub enum MailboxOutcome {
    Delivered(RecordResult),
    Cancelled,
}

/// A reader handed back by [`Mailbox::reserve`]. Awaiting it yields the
/// outcome; dropping it without awaiting simply drops the slot.
pub struct MailboxReader {
    rx: oneshot::Receiver<MailboxOutcome>,
}

impl MailboxReader {
    pub async fn recv(self) -> MailboxOutcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            // The Mailbox itself was dropped without closing cleanly; treat
            // it the same as an explicit cancellation.
            Err(_) => MailboxOutcome::Cancelled,
        }
    }
}

#[derive(Default)]
pub struct Mailbox {
    slots: Mutex<HashMap<String, oneshot::Sender<MailboxOutcome>>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Mailbox::default()
    }

    /// Create a slot and return a reader for it. Reserving the same key
    /// twice replaces the previous reader, which immediately observes
    /// cancellation (its sender is dropped).
    pub fn reserve(&self, slot: impl Into<String>) -> MailboxReader {
        let (tx, rx) = oneshot::channel();
        self.slots.lock().unwrap().insert(slot.into(), tx);
        MailboxReader { rx }
    }

    /// Deliver `result` to `slot` and remove it. A result for an unknown
    /// slot (already delivered, already cancelled, or never reserved) is
    /// dropped silently — this is expected when a reply races teardown.
    pub fn deliver(&self, slot: &str, result: RecordResult) {
        let sender = self.slots.lock().unwrap().remove(slot);
        if let Some(sender) = sender {
            let _ = sender.send(MailboxOutcome::Delivered(result));
        }
    }

    /// Tear down the mailbox: every outstanding reader observes
    /// cancellation. Dropping each sender is sufficient since
    /// `MailboxReader::recv` maps a closed channel to `Cancelled`, but we
    /// send explicitly so the intent is unambiguous in the type.
    pub fn close(&self) {
        let mut slots = self.slots.lock().unwrap();
        for (_, sender) in slots.drain() {
            let _ = sender.send(MailboxOutcome::Cancelled);
        }
    }

    pub fn outstanding_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}
