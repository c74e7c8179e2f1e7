//! Public facade over the connection, registry, and dispatcher. A
//! [`Session`] owns all three for its lifetime; there is no ambient
//! client state.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use warren_proto::fields::{Persistence, Priority, ReturnType, UploadFrom, Verbosity};
use warren_proto::{keys, tags, Message, RequestId, PROTOCOL_VERSION};

use crate::connection::{Connection, MessageReader};
use crate::dispatcher::{Dispatcher, UnsolicitedFn};
use crate::error::ClientError;
use crate::registry::{ListenerId, RequestRegistry};
use crate::state::{OperationKind, RequestSnapshot};

/// Connection-time parameters supplied by the embedding application.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub address: String,
    /// Client name sent in the handshake; the node uses it to scope the
    /// client-local queue.
    pub name: String,
    pub default_priority: Priority,
    pub default_verbosity: Verbosity,
    pub handshake_timeout: Duration,
    /// Subscribe to global-queue traffic right after the handshake.
    pub watch_global: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9481".into(),
            name: format!("warren-{}", uuid::Uuid::now_v7()),
            default_priority: Priority::default(),
            default_verbosity: Verbosity::PROGRESS,
            handshake_timeout: Duration::from_secs(10),
            watch_global: true,
        }
    }
}

/// Where the bytes of a single-file upload come from.
#[derive(Clone, Debug)]
pub enum PutSource {
    /// Shipped inline with the request.
    Direct(Bytes),
    /// A path readable by the node.
    Disk(String),
    /// A redirect to an existing key.
    Redirect(String),
}

impl Default for PutSource {
    fn default() -> Self {
        Self::Direct(Bytes::new())
    }
}

/// Parameters for a single-file upload.
#[derive(Clone, Debug, Default)]
pub struct PutRequest {
    pub uri: String,
    pub source: PutSource,
    pub identifier: Option<RequestId>,
    pub priority: Option<Priority>,
    pub verbosity: Option<Verbosity>,
    pub max_retries: Option<u32>,
    pub persistence: Persistence,
    pub global: bool,
    pub content_type: Option<String>,
}

/// Parameters for a retrieval.
#[derive(Clone, Debug, Default)]
pub struct GetRequest {
    pub uri: String,
    pub identifier: Option<RequestId>,
    pub priority: Option<Priority>,
    pub verbosity: Option<Verbosity>,
    pub max_retries: Option<u32>,
    pub persistence: Persistence,
    pub return_type: ReturnType,
    pub global: bool,
}

/// Parameters for uploading a directory tree readable by the node.
#[derive(Clone, Debug, Default)]
pub struct PutDirRequest {
    pub uri: String,
    pub directory: String,
    pub identifier: Option<RequestId>,
    pub priority: Option<Priority>,
    pub verbosity: Option<Verbosity>,
    pub max_retries: Option<u32>,
    pub persistence: Persistence,
    pub global: bool,
}

/// A live session with a warren node.
///
/// Submissions, cancellations, and listener registration may happen from
/// any task; they serialize only on the registry's internal locks and the
/// connection's write path. One background task drives the receive loop.
pub struct Session {
    config: SessionConfig,
    registry: Arc<RequestRegistry>,
    connection: RwLock<Arc<Connection>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    node_info: RwLock<Option<Message>>,
    unsolicited: Option<UnsolicitedFn>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("has_unsolicited", &self.unsolicited.is_some())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Connect, perform the handshake, and start the receive loop.
    pub async fn connect(config: SessionConfig) -> Result<Self, ClientError> {
        Self::connect_with(config, None).await
    }

    /// Like [`Session::connect`], with a handler for unsolicited and
    /// unrecognized messages.
    pub async fn connect_with(
        config: SessionConfig,
        unsolicited: Option<UnsolicitedFn>,
    ) -> Result<Self, ClientError> {
        let (connection, mut reader) = Connection::open(&config.address).await?;
        let node_info = handshake(&config, &connection, &mut reader).await?;

        let registry = Arc::new(RequestRegistry::new());
        let handle = Dispatcher::spawn(
            reader,
            Arc::clone(&registry),
            Arc::clone(&connection),
            unsolicited.clone(),
        );
        let session = Self {
            config,
            registry,
            connection: RwLock::new(connection),
            dispatcher: Mutex::new(Some(handle)),
            node_info: RwLock::new(Some(node_info)),
            unsolicited,
        };
        if session.config.watch_global {
            session.send(watch_global_message()).await?;
        }
        Ok(session)
    }

    /// The node's handshake reply, with version and capability fields.
    pub fn node_info(&self) -> Option<Message> {
        self.node_info.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.read().is_open()
    }

    /// Submit a single-file upload. Returns the identifier tracking it.
    pub async fn put(&self, request: PutRequest) -> Result<RequestId, ClientError> {
        let id = request.identifier.clone().unwrap_or_default();
        self.registry.register(id.clone(), OperationKind::Put)?;
        let message = self.build_put(&id, request);
        self.send_submission(id, message).await
    }

    /// Submit a retrieval. Returns the identifier tracking it.
    pub async fn get(&self, request: GetRequest) -> Result<RequestId, ClientError> {
        let id = request.identifier.clone().unwrap_or_default();
        self.registry.register(id.clone(), OperationKind::Get)?;
        let message = self.build_get(&id, request);
        self.send_submission(id, message).await
    }

    /// Submit a directory upload. Returns the identifier tracking it.
    pub async fn put_dir(&self, request: PutDirRequest) -> Result<RequestId, ClientError> {
        let id = request.identifier.clone().unwrap_or_default();
        self.registry.register(id.clone(), OperationKind::PutDir)?;
        let message = self.build_put_dir(&id, request);
        self.send_submission(id, message).await
    }

    /// Ask the node to drop a request. Cooperative: the request only
    /// reaches `Cancelled` once the node acknowledges the removal.
    pub async fn cancel(&self, id: &RequestId) -> Result<(), ClientError> {
        let snapshot = self
            .registry
            .snapshot(id)
            .ok_or_else(|| ClientError::NotFound(id.clone()))?;
        let message = Message::new(tags::REMOVE_REQUEST)
            .with_field(keys::IDENTIFIER, id.as_str())
            .with_field(keys::GLOBAL, bool_str(snapshot.is_global()));
        self.send(message).await
    }

    /// Start the persistent-request listing exchange. Responses populate
    /// the registry asynchronously; watch them via [`Session::subscribe_all`].
    pub async fn list_persistent_requests(&self) -> Result<(), ClientError> {
        self.send(Message::new(tags::LIST_PERSISTENT_REQUESTS)).await
    }

    /// Block until the request reaches a terminal phase, the connection
    /// dies, or the given wait elapses. A timeout leaves the node-side
    /// job untouched.
    pub async fn await_result(
        &self,
        id: &RequestId,
        wait: Option<Duration>,
    ) -> Result<RequestSnapshot, ClientError> {
        match wait {
            Some(limit) => match timeout(limit, self.wait_terminal(id)).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::Timeout(limit)),
            },
            None => self.wait_terminal(id).await,
        }
    }

    pub fn snapshot(&self, id: &RequestId) -> Option<RequestSnapshot> {
        self.registry.snapshot(id)
    }

    pub fn snapshots(&self) -> Vec<RequestSnapshot> {
        self.registry.snapshots()
    }

    /// Bind a callback to one request. Callbacks run on the receive-loop
    /// task and must not block.
    pub fn subscribe(
        &self,
        id: &RequestId,
        callback: impl Fn(&RequestSnapshot) + Send + Sync + 'static,
    ) -> Result<ListenerId, ClientError> {
        self.registry.subscribe(id, callback)
    }

    /// Bind a callback to every request, including jobs discovered
    /// through the listing exchange or the global watch.
    pub fn subscribe_all(
        &self,
        callback: impl Fn(&RequestSnapshot) + Send + Sync + 'static,
    ) -> ListenerId {
        self.registry.subscribe_all(callback)
    }

    pub fn unsubscribe(&self, listener_id: ListenerId) -> bool {
        self.registry.unsubscribe(listener_id)
    }

    /// Tear down and re-establish the connection, then re-issue the
    /// persistent-request listing so registry state resynchronizes with
    /// whatever is still running on the node.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        self.shutdown();

        let (connection, mut reader) = Connection::open(&self.config.address).await?;
        let node_info = handshake(&self.config, &connection, &mut reader).await?;
        *self.node_info.write() = Some(node_info);
        *self.connection.write() = Arc::clone(&connection);
        self.registry.mark_connected();

        let handle = Dispatcher::spawn(
            reader,
            Arc::clone(&self.registry),
            connection,
            self.unsolicited.clone(),
        );
        *self.dispatcher.lock() = Some(handle);

        if self.config.watch_global {
            self.send(watch_global_message()).await?;
        }
        self.list_persistent_requests().await
    }

    /// Close the connection and stop the receive loop. Pending waiters
    /// resolve with `NotConnected`.
    pub fn close(&self) {
        self.shutdown();
    }

    fn shutdown(&self) {
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
        self.connection.read().close();
        self.registry.mark_disconnected();
    }

    async fn wait_terminal(&self, id: &RequestId) -> Result<RequestSnapshot, ClientError> {
        let mut snapshots = self
            .registry
            .watch_request(id)
            .ok_or_else(|| ClientError::NotFound(id.clone()))?;
        {
            let current = snapshots.borrow();
            if current.phase.is_terminal() {
                return Ok(current.clone());
            }
        }
        if self.registry.is_disconnected() {
            return Err(ClientError::NotConnected);
        }
        let mut disconnected = self.registry.watch_disconnect();
        tokio::select! {
            changed = snapshots.wait_for(|snapshot| snapshot.phase.is_terminal()) => match changed {
                Ok(snapshot) => Ok(snapshot.clone()),
                Err(_) => Err(ClientError::NotFound(id.clone())),
            },
            _ = disconnected.wait_for(|gone| *gone) => Err(ClientError::NotConnected),
        }
    }

    async fn send(&self, message: Message) -> Result<(), ClientError> {
        let connection = Arc::clone(&self.connection.read());
        connection.send(message).await
    }

    async fn send_submission(
        &self,
        id: RequestId,
        message: Message,
    ) -> Result<RequestId, ClientError> {
        match self.send(message).await {
            Ok(()) => {
                tracing::debug!(id = %id, "request submitted");
                Ok(id)
            }
            Err(err) => {
                // Roll the registration back so the identifier is free
                // again once the transport recovers.
                self.registry.remove(&id);
                Err(err)
            }
        }
    }

    fn build_put(&self, id: &RequestId, request: PutRequest) -> Message {
        let mut message = self.submission_base(tags::CLIENT_PUT, id);
        message.put(keys::URI, request.uri);
        message.put(
            keys::PRIORITY,
            request
                .priority
                .unwrap_or(self.config.default_priority)
                .to_string(),
        );
        message.put(
            keys::VERBOSITY,
            request
                .verbosity
                .unwrap_or(self.config.default_verbosity)
                .to_string(),
        );
        message.put(keys::PERSISTENCE, request.persistence.as_str());
        message.put(keys::GLOBAL, bool_str(request.global));
        if let Some(max_retries) = request.max_retries {
            message.put(keys::MAX_RETRIES, max_retries.to_string());
        }
        if let Some(content_type) = request.content_type {
            message.put(keys::CONTENT_TYPE, content_type);
        }
        match request.source {
            PutSource::Direct(data) => {
                message.put(keys::UPLOAD_FROM, UploadFrom::Direct.as_str());
                message.with_payload(data)
            }
            PutSource::Disk(path) => {
                message.put(keys::UPLOAD_FROM, UploadFrom::Disk.as_str());
                message.put(keys::FILENAME, path);
                message
            }
            PutSource::Redirect(target) => {
                message.put(keys::UPLOAD_FROM, UploadFrom::Redirect.as_str());
                message.put(keys::TARGET_URI, target);
                message
            }
        }
    }

    fn build_get(&self, id: &RequestId, request: GetRequest) -> Message {
        let mut message = self.submission_base(tags::CLIENT_GET, id);
        message.put(keys::URI, request.uri);
        message.put(
            keys::PRIORITY,
            request
                .priority
                .unwrap_or(self.config.default_priority)
                .to_string(),
        );
        message.put(
            keys::VERBOSITY,
            request
                .verbosity
                .unwrap_or(self.config.default_verbosity)
                .to_string(),
        );
        message.put(keys::PERSISTENCE, request.persistence.as_str());
        message.put(keys::RETURN_TYPE, request.return_type.as_str());
        message.put(keys::GLOBAL, bool_str(request.global));
        if let Some(max_retries) = request.max_retries {
            message.put(keys::MAX_RETRIES, max_retries.to_string());
        }
        message
    }

    fn build_put_dir(&self, id: &RequestId, request: PutDirRequest) -> Message {
        let mut message = self.submission_base(tags::CLIENT_PUT_DIR, id);
        message.put(keys::URI, request.uri);
        message.put(keys::DIRECTORY, request.directory);
        message.put(
            keys::PRIORITY,
            request
                .priority
                .unwrap_or(self.config.default_priority)
                .to_string(),
        );
        message.put(
            keys::VERBOSITY,
            request
                .verbosity
                .unwrap_or(self.config.default_verbosity)
                .to_string(),
        );
        message.put(keys::PERSISTENCE, request.persistence.as_str());
        message.put(keys::GLOBAL, bool_str(request.global));
        if let Some(max_retries) = request.max_retries {
            message.put(keys::MAX_RETRIES, max_retries.to_string());
        }
        message
    }

    fn submission_base(&self, tag: &str, id: &RequestId) -> Message {
        Message::new(tag).with_field(keys::IDENTIFIER, id.as_str())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn handshake(
    config: &SessionConfig,
    connection: &Connection,
    reader: &mut MessageReader,
) -> Result<Message, ClientError> {
    let hello = Message::new(tags::HELLO)
        .with_field(keys::NAME, config.name.as_str())
        .with_field(keys::EXPECTED_VERSION, PROTOCOL_VERSION);
    connection.send(hello).await?;

    let reply = timeout(config.handshake_timeout, reader.next())
        .await
        .map_err(|_| ClientError::Handshake("no reply from node".into()))?;
    match reply {
        Some(Ok(message)) if message.is(tags::NODE_HELLO) => Ok(message),
        Some(Ok(message)) => {
            connection.close();
            Err(ClientError::Handshake(format!(
                "expected NodeHello, node sent {}",
                message.name()
            )))
        }
        Some(Err(err)) => {
            connection.close();
            Err(ClientError::Codec(err))
        }
        None => {
            connection.close();
            Err(ClientError::Handshake(
                "connection closed during handshake".into(),
            ))
        }
    }
}

fn watch_global_message() -> Message {
    Message::new(tags::WATCH_GLOBAL).with_field(keys::ENABLED, "true")
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}
