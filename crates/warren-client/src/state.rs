//! Per-request lifecycle state and the immutable snapshots handed to
//! callers. Typed detail projections live here too: one projection
//! function per operation kind, parsing lazily from the field map a
//! request has accumulated.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use warren_proto::fields::{Persistence, Priority, ReturnType, UploadFrom, Verbosity};
use warren_proto::{keys, Message, RequestId};

/// Lifecycle phase of a tracked request.
///
/// `Submitted → Queued → InProgress → {Succeeded | Failed}`; `Cancelled`
/// is reachable from any non-terminal phase, and only through an explicit
/// removal acknowledgment from the node. Terminal phases are never
/// exited.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Submitted,
    Queued,
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Ordering rank used to keep transitions monotonic.
    pub(crate) fn rank(self) -> u8 {
        match self {
            Self::Submitted => 0,
            Self::Queued => 1,
            Self::InProgress => 2,
            Self::Succeeded | Self::Failed | Self::Cancelled => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of operation a request performs on the node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Put,
    Get,
    PutDir,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Put => "put",
            Self::Get => "get",
            Self::PutDir => "put_dir",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transfer counters reported by the node. Counts may be revised in
/// either direction mid-flight; only a terminal message ends a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total: u64,
    pub required: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub fatally_failed: u64,
    /// True once the node stops revising `total`.
    pub finalized: bool,
}

impl Progress {
    pub(crate) fn update_from(&mut self, message: &Message) {
        if let Some(total) = message.u64_field(keys::TOTAL) {
            self.total = total;
        }
        if let Some(required) = message.u64_field(keys::REQUIRED) {
            self.required = required;
        }
        if let Some(succeeded) = message.u64_field(keys::SUCCEEDED) {
            self.succeeded = succeeded;
        }
        if let Some(failed) = message.u64_field(keys::FAILED) {
            self.failed = failed;
        }
        if let Some(fatally_failed) = message.u64_field(keys::FATALLY_FAILED) {
            self.fatally_failed = fatally_failed;
        }
        if let Some(finalized) = message.bool_field(keys::FINALIZED) {
            self.finalized = finalized;
        }
    }
}

/// Node-reported terminal failure details.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestError {
    pub code: Option<u32>,
    pub description: String,
}

impl RequestError {
    pub(crate) fn from_message(message: &Message) -> Self {
        let description = message
            .field(keys::CODE_DESCRIPTION)
            .or_else(|| message.field(keys::EXTRA_DESCRIPTION))
            .unwrap_or("node reported failure")
            .to_owned();
        Self {
            code: message.u32_field(keys::CODE),
            description,
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {code})", self.description),
            None => f.write_str(&self.description),
        }
    }
}

/// Mutable per-request record. Owned by the registry; mutated only on
/// receipt of a correlated message.
#[derive(Clone, Debug)]
pub(crate) struct RequestState {
    pub id: RequestId,
    pub kind: OperationKind,
    pub phase: Phase,
    pub progress: Progress,
    /// Parameter echo merged from every correlated message.
    pub fields: Vec<(String, String)>,
    pub data: Option<Bytes>,
    pub error: Option<RequestError>,
    /// True for jobs the node reported that this client never submitted.
    pub discovered: bool,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RequestState {
    pub(crate) fn new(id: RequestId, kind: OperationKind) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            phase: Phase::Submitted,
            progress: Progress::default(),
            fields: Vec::new(),
            data: None,
            error: None,
            discovered: false,
            submitted_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn discovered(id: RequestId, kind: OperationKind) -> Self {
        let mut state = Self::new(id, kind);
        state.phase = Phase::Queued;
        state.discovered = true;
        state
    }

    pub(crate) fn merge_fields(&mut self, message: &Message) {
        for (key, value) in message.fields() {
            if key == keys::IDENTIFIER {
                continue;
            }
            match self.fields.iter_mut().find(|(k, _)| k == key) {
                Some(slot) => slot.1 = value.to_owned(),
                None => self.fields.push((key.to_owned(), value.to_owned())),
            }
        }
    }

    /// Move forward in the lifecycle; earlier phases never overwrite
    /// later ones.
    pub(crate) fn advance(&mut self, phase: Phase) {
        if phase.rank() >= self.phase.rank() {
            self.phase = phase;
        }
    }

    pub(crate) fn snapshot(&self) -> RequestSnapshot {
        RequestSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            phase: self.phase,
            progress: self.progress,
            error: self.error.clone(),
            discovered: self.discovered,
            fields: self.fields.clone(),
            data: self.data.clone(),
            submitted_at: self.submitted_at,
            updated_at: self.updated_at,
        }
    }
}

/// Immutable view of a request, as delivered to listeners and returned by
/// the snapshot accessors.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub id: RequestId,
    pub kind: OperationKind,
    pub phase: Phase,
    pub progress: Progress,
    pub error: Option<RequestError>,
    pub discovered: bool,
    pub fields: Vec<(String, String)>,
    #[serde(skip)]
    pub data: Option<Bytes>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RequestSnapshot {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.field(key)?.trim().parse().ok()
    }

    pub fn u32_field(&self, key: &str) -> Option<u32> {
        self.field(key)?.trim().parse().ok()
    }

    pub fn bool_field(&self, key: &str) -> Option<bool> {
        match self.field(key)?.trim() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    pub fn uri(&self) -> Option<&str> {
        self.field(keys::URI)
    }

    /// Whether the job sits on the node's global queue rather than this
    /// client's local one.
    pub fn is_global(&self) -> bool {
        self.bool_field(keys::GLOBAL).unwrap_or(false)
    }

    /// Typed view of a single-file upload. `None` for other kinds.
    pub fn put_details(&self) -> Option<PutDetails> {
        (self.kind == OperationKind::Put).then(|| PutDetails {
            uri: self.uri().map(str::to_owned),
            priority: self.field(keys::PRIORITY).and_then(Priority::from_field),
            verbosity: self.field(keys::VERBOSITY).and_then(Verbosity::from_field),
            max_retries: self.u32_field(keys::MAX_RETRIES),
            persistence: self
                .field(keys::PERSISTENCE)
                .and_then(Persistence::from_field),
            upload_from: self
                .field(keys::UPLOAD_FROM)
                .and_then(UploadFrom::from_field),
            content_type: self.field(keys::CONTENT_TYPE).map(str::to_owned),
        })
    }

    /// Typed view of a retrieval. `None` for other kinds.
    pub fn get_details(&self) -> Option<GetDetails> {
        (self.kind == OperationKind::Get).then(|| GetDetails {
            uri: self.uri().map(str::to_owned),
            priority: self.field(keys::PRIORITY).and_then(Priority::from_field),
            verbosity: self.field(keys::VERBOSITY).and_then(Verbosity::from_field),
            max_retries: self.u32_field(keys::MAX_RETRIES),
            return_type: self
                .field(keys::RETURN_TYPE)
                .and_then(ReturnType::from_field),
            data_length: self.u64_field(keys::DATA_LENGTH),
            content_type: self.field(keys::CONTENT_TYPE).map(str::to_owned),
        })
    }

    /// Typed view of a directory upload. `None` for other kinds.
    pub fn put_dir_details(&self) -> Option<PutDirDetails> {
        if self.kind != OperationKind::PutDir {
            return None;
        }
        let mut files = Vec::new();
        let mut index = 0;
        while let Some(entry) = self.file_entry(index) {
            files.push(entry);
            index += 1;
        }
        Some(PutDirDetails {
            uri: self.uri().map(str::to_owned),
            priority: self.field(keys::PRIORITY).and_then(Priority::from_field),
            verbosity: self.field(keys::VERBOSITY).and_then(Verbosity::from_field),
            max_retries: self.u32_field(keys::MAX_RETRIES),
            persistence: self
                .field(keys::PERSISTENCE)
                .and_then(Persistence::from_field),
            file_count: self.u32_field(keys::FILE_COUNT),
            files,
        })
    }

    fn file_entry(&self, index: u32) -> Option<FileEntry> {
        let field = |suffix: &str| self.field(&format!("Files.{index}.{suffix}"));
        let name = field("Name");
        let filename = field("Filename");
        let data_length = field("DataLength").and_then(|v| v.trim().parse().ok());
        let content_type = field("Metadata.ContentType");
        let upload_from = field("UploadFrom").and_then(UploadFrom::from_field);
        if name.is_none()
            && filename.is_none()
            && data_length.is_none()
            && content_type.is_none()
            && upload_from.is_none()
        {
            return None;
        }
        Some(FileEntry {
            name: name.map(str::to_owned),
            filename: filename.map(str::to_owned),
            data_length,
            content_type: content_type.map(str::to_owned),
            upload_from,
        })
    }
}

/// Parameters of a single-file upload as echoed by the node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutDetails {
    pub uri: Option<String>,
    pub priority: Option<Priority>,
    pub verbosity: Option<Verbosity>,
    pub max_retries: Option<u32>,
    pub persistence: Option<Persistence>,
    pub upload_from: Option<UploadFrom>,
    pub content_type: Option<String>,
}

/// Parameters and result metadata of a retrieval.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDetails {
    pub uri: Option<String>,
    pub priority: Option<Priority>,
    pub verbosity: Option<Verbosity>,
    pub max_retries: Option<u32>,
    pub return_type: Option<ReturnType>,
    pub data_length: Option<u64>,
    pub content_type: Option<String>,
}

/// Parameters of a directory upload, including per-file metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutDirDetails {
    pub uri: Option<String>,
    pub priority: Option<Priority>,
    pub verbosity: Option<Verbosity>,
    pub max_retries: Option<u32>,
    pub persistence: Option<Persistence>,
    /// Node-declared count; may disagree with `files` while the node is
    /// still enumerating.
    pub file_count: Option<u32>,
    pub files: Vec<FileEntry>,
}

/// One file of a directory upload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: Option<String>,
    pub filename: Option<String>,
    pub data_length: Option<u64>,
    pub content_type: Option<String>,
    pub upload_from: Option<UploadFrom>,
}
