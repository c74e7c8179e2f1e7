use bytes::Bytes;

/// Message type tags used by this client. The node is free to send tags
/// outside this set; they are routed to the unsolicited handler, never
/// dropped.
pub mod tags {
    pub const HELLO: &str = "Hello";
    pub const NODE_HELLO: &str = "NodeHello";

    pub const CLIENT_PUT: &str = "ClientPut";
    pub const CLIENT_GET: &str = "ClientGet";
    pub const CLIENT_PUT_DIR: &str = "ClientPutDir";
    pub const LIST_PERSISTENT_REQUESTS: &str = "ListPersistentRequests";
    pub const REMOVE_REQUEST: &str = "RemoveRequest";
    pub const WATCH_GLOBAL: &str = "WatchGlobal";

    pub const PERSISTENT_PUT: &str = "PersistentPut";
    pub const PERSISTENT_GET: &str = "PersistentGet";
    pub const PERSISTENT_PUT_DIR: &str = "PersistentPutDir";
    pub const PROGRESS: &str = "Progress";
    pub const PUT_SUCCESSFUL: &str = "PutSuccessful";
    pub const PUT_FAILED: &str = "PutFailed";
    pub const DATA_FOUND: &str = "DataFound";
    pub const ALL_DATA: &str = "AllData";
    pub const GET_FAILED: &str = "GetFailed";
    pub const REQUEST_REMOVED: &str = "RequestRemoved";
    pub const RESTARTED: &str = "Restarted";
    pub const IDENTIFIER_COLLISION: &str = "IdentifierCollision";
    pub const END_LIST_PERSISTENT_REQUESTS: &str = "EndListPersistentRequests";
    pub const PROTOCOL_ERROR: &str = "ProtocolError";
}

/// Well-known field keys.
pub mod keys {
    pub const IDENTIFIER: &str = "Identifier";
    pub const URI: &str = "URI";
    pub const DATA_LENGTH: &str = "DataLength";
    pub const PRIORITY: &str = "Priority";
    pub const VERBOSITY: &str = "Verbosity";
    pub const MAX_RETRIES: &str = "MaxRetries";
    pub const GLOBAL: &str = "Global";
    pub const PERSISTENCE: &str = "Persistence";
    pub const UPLOAD_FROM: &str = "UploadFrom";
    pub const RETURN_TYPE: &str = "ReturnType";
    pub const FILENAME: &str = "Filename";
    pub const DIRECTORY: &str = "Directory";
    pub const TARGET_URI: &str = "TargetURI";
    pub const CONTENT_TYPE: &str = "Metadata.ContentType";
    pub const FILE_COUNT: &str = "FileCount";
    pub const NAME: &str = "Name";
    pub const EXPECTED_VERSION: &str = "ExpectedVersion";
    pub const VERSION: &str = "Version";
    pub const CODE: &str = "Code";
    pub const CODE_DESCRIPTION: &str = "CodeDescription";
    pub const EXTRA_DESCRIPTION: &str = "ExtraDescription";
    pub const FATAL: &str = "Fatal";
    pub const ENABLED: &str = "Enabled";
    pub const TOTAL: &str = "Total";
    pub const REQUIRED: &str = "Required";
    pub const SUCCEEDED: &str = "Succeeded";
    pub const FAILED: &str = "Failed";
    pub const FATALLY_FAILED: &str = "FatallyFailed";
    pub const FINALIZED: &str = "Finalized";
}

/// One protocol frame: a type tag, ordered `Key=Value` fields, and an
/// optional raw payload.
///
/// Field keys are unique within a message and keep their insertion order
/// on the wire. Values are opaque strings; numeric and boolean fields are
/// parsed lazily by the accessors, so a frame is never rejected because of
/// a field its consumer does not read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    name: String,
    fields: Vec<(String, String)>,
    payload: Option<Bytes>,
}

impl Message {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            payload: None,
        }
    }

    /// The type tag (first line of the frame).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is(&self, tag: &str) -> bool {
        self.name == tag
    }

    /// Set a field, replacing an existing value in place so the original
    /// wire position is kept.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.put(key, value);
        self
    }

    /// Attach a raw payload and stamp the `DataLength` field to match.
    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.put(keys::DATA_LENGTH, payload.len().to_string());
        self.payload = Some(payload);
        self
    }

    /// Attach a payload without touching `DataLength`. The decoder uses
    /// this after it has already consumed the declared length.
    pub(crate) fn set_payload(&mut self, payload: Bytes) {
        self.payload = Some(payload);
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.iter().any(|(k, _)| k == key)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub fn take_payload(&mut self) -> Option<Bytes> {
        self.payload.take()
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

    /// The identifier correlating this message with a job, if present.
    pub fn identifier(&self) -> Option<&str> {
        self.field(keys::IDENTIFIER)
    }
}
