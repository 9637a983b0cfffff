//! proto: wire and in-memory record model for the run-tracking pipeline.
//!
//! Records flow client -> Handler -> Writer -> Sender -> remote. Every
//! variant carries an optional [`Control`] envelope governing persistence,
//! delivery, and reply correlation. The same JSON shape is used for the IPC
//! framing, the on-disk journal, and (indirectly, via the typed remote
//! client) the wire format sent to the server.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A metric value. Numbers, strings and bools are all legal history/summary
/// values upstream; we keep the same latitude here rather than forcing f64.
pub type MetricValue = serde_json::Value;

// ---------------------------------------------------------------------------
// Record envelope
// ---------------------------------------------------------------------------

/// The fundamental unit flowing through the pipeline.
///
/// `num` is zero until the Writer stamps a dense, monotonic sequence number;
/// it is not meaningful before that point and is never set by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    #[serde(flatten)]
    pub data: RecordData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control: Option<Control>,
    #[serde(default)]
    pub num: i64,
}

impl Record {
    pub fn new(data: RecordData) -> Self {
        Record { data, control: None, num: 0 }
    }

    pub fn with_control(data: RecordData, control: Control) -> Self {
        Record { data, control: Some(control), num: 0 }
    }

    pub fn is_local(&self) -> bool {
        self.control.as_ref().is_some_and(|c| c.local)
    }

    pub fn always_send(&self) -> bool {
        self.control.as_ref().is_some_and(|c| c.always_send)
    }

    pub fn mailbox_slot(&self) -> Option<&str> {
        self.control.as_ref().and_then(|c| c.mailbox_slot.as_deref())
    }

    pub fn req_resp(&self) -> bool {
        self.control.as_ref().is_some_and(|c| c.req_resp)
    }

    /// `Request` records are control-plane only: never persisted, always
    /// forwarded straight to the Sender.
    pub fn is_request(&self) -> bool {
        matches!(self.data, RecordData::Request(_))
    }
}

/// Per-record control flags governing persistence, delivery, and reply
/// correlation for a single record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Control {
    /// Do not persist to the journal.
    #[serde(default)]
    pub local: bool,
    /// Send even when the run is offline.
    #[serde(default)]
    pub always_send: bool,
    /// Reply address: the Mailbox slot a `Result` for this record routes to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mailbox_slot: Option<String>,
    /// Caller expects a reply (as opposed to fire-and-forget).
    #[serde(default)]
    pub req_resp: bool,
    /// Journal offset after this record was written. Stamped by the Store,
    /// not set by callers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_offset: Option<u64>,
}

impl Control {
    pub fn local() -> Self {
        Control { local: true, ..Default::default() }
    }

    pub fn always_send() -> Self {
        Control { always_send: true, ..Default::default() }
    }

    pub fn with_mailbox_slot(slot: impl Into<String>) -> Self {
        Control {
            mailbox_slot: Some(slot.into()),
            req_resp: true,
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Record variants
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordData {
    RunStart(RunStartRecord),
    RunUpdate(RunUpdateRecord),
    History(HistoryRecord),
    Summary(SummaryRecord),
    Config(ConfigRecord),
    Files(FilesRecord),
    Stats(StatsRecord),
    Artifact(ArtifactRecord),
    TbRecord(TbRecord),
    Exit(ExitRecord),
    Request(RequestRecord),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartRecord {
    pub run_id: String,
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunUpdateRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Set by the Handler from the live step counter; absent on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u64>,
    pub data: BTreeMap<String, MetricValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub data: BTreeMap<String, MetricValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigRecord {
    pub data: BTreeMap<String, MetricValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesRecord {
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    #[serde(default)]
    pub policy: FilePolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilePolicy {
    /// Upload as soon as the Sender sees the record.
    #[default]
    Now,
    /// Upload once at run exit.
    End,
    /// Keep streaming updates for the lifetime of the run.
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsRecord {
    pub timestamp_ms: i64,
    pub data: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub action: ArtifactAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ArtifactAction {
    Download {
        artifact_id: String,
        download_root: String,
        #[serde(default)]
        skip_cache: bool,
    },
    Upload {
        name: String,
        #[serde(rename = "type")]
        artifact_type: String,
        entries: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TbRecord {
    pub log_dir: String,
    #[serde(default = "default_true")]
    pub save: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitRecord {
    pub exit_code: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Results (Handler.out / Sender.out -> Dispatcher)
// ---------------------------------------------------------------------------

/// The reply a stage emits for a record, optionally addressed to a
/// `responder_key` the Dispatcher uses to route it back to the IPC caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder_key: Option<String>,
    pub payload: ResultPayload,
}

impl RecordResult {
    pub fn new(responder_key: Option<String>, payload: ResultPayload) -> Self {
        RecordResult { responder_key, payload }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultPayload {
    RunStartAck { run_id: String },
    Ack,
    Error { message: String },
    Exit { exit_code: i32 },
    Cancelled,
}

// ---------------------------------------------------------------------------
// Artifact manifest
// ---------------------------------------------------------------------------

/// An artifact's declarative contents. Immutable once fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub storage_policy: StoragePolicy,
    pub contents: BTreeMap<String, ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePolicy {
    pub storage_layout: String,
}

/// One entry in a manifest: logical path -> content descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub digest: String,
    pub size: u64,
    /// External URI. When present this is a "reference" entry: it is never
    /// fetched from the control plane, it is already done.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
    /// Signed download URL, stamped by `ArtifactFileUrlsByManifestEntries`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    /// Stamped alongside `download_url`; equals the manifest key but kept as
    /// a field so resolved entries carry their own identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
}

impl ManifestEntry {
    pub fn is_reference(&self) -> bool {
        self.reference.is_some()
    }
}
