//! Single source of truth for every in-flight and completed request on a
//! session. The dispatcher translates wire messages into typed
//! [`RequestUpdate`]s; the registry owns all state transitions and keeps
//! them monotonic.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;

use warren_proto::{Message, RequestId};

use crate::error::ClientError;
use crate::state::{OperationKind, Phase, Progress, RequestError, RequestSnapshot, RequestState};

/// Correlated messages kept when no request owns their identifier. This
/// happens legitimately for jobs that pre-existed the connection and have
/// not been enumerated yet.
const ORPHAN_CAPACITY: usize = 64;

/// Typed state transition extracted from a wire message.
#[derive(Clone, Debug)]
pub enum RequestUpdate {
    /// Node acknowledged or enumerated a persistent job.
    Acknowledged {
        kind: OperationKind,
        message: Message,
    },
    /// Transfer counters changed.
    Progress { message: Message },
    /// Terminal success, possibly carrying returned data.
    Succeeded { message: Message },
    /// Terminal node-reported failure.
    Failed {
        error: RequestError,
        message: Message,
    },
    /// Node confirmed removal after a cancel.
    CancelAck { message: Message },
    /// Node restarted the transfer from scratch.
    Restarted { message: Message },
}

impl RequestUpdate {
    fn into_message(self) -> Message {
        match self {
            Self::Acknowledged { message, .. }
            | Self::Progress { message }
            | Self::Succeeded { message }
            | Self::Failed { message, .. }
            | Self::CancelAck { message }
            | Self::Restarted { message } => message,
        }
    }
}

/// Result of applying an update.
#[derive(Clone, Debug)]
pub enum ApplyOutcome {
    /// State changed; deliver this snapshot to listeners.
    Updated(RequestSnapshot),
    /// A node-reported job was admitted into the table.
    Admitted(RequestSnapshot),
    /// Cancel acknowledged; the entry is gone after this final snapshot.
    Removed(RequestSnapshot),
    /// No owner for this identifier; the message went to the orphan ring.
    Orphaned,
    /// Owner already terminal; recorded as a duplicate and ignored.
    Ignored,
}

pub type ListenerFn = Arc<dyn Fn(&RequestSnapshot) + Send + Sync>;

/// Handle for removing a registered listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    callback: ListenerFn,
}

struct RequestEntry {
    state: RequestState,
    snapshot_tx: watch::Sender<RequestSnapshot>,
}

#[derive(Default)]
struct ListenerTable {
    bound: HashMap<RequestId, Vec<Listener>>,
    global: Vec<Listener>,
}

pub struct RequestRegistry {
    requests: DashMap<RequestId, RequestEntry>,
    orphans: Mutex<VecDeque<(RequestId, Message)>>,
    listeners: Mutex<ListenerTable>,
    next_listener_id: AtomicU64,
    disconnected_tx: watch::Sender<bool>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        let (disconnected_tx, _) = watch::channel(false);
        Self {
            requests: DashMap::new(),
            orphans: Mutex::new(VecDeque::new()),
            listeners: Mutex::new(ListenerTable::default()),
            next_listener_id: AtomicU64::new(0),
            disconnected_tx,
        }
    }

    /// Track a caller-submitted request. Must happen before the request
    /// hits the wire so no response can arrive unowned.
    pub fn register(&self, id: RequestId, kind: OperationKind) -> Result<(), ClientError> {
        match self.requests.entry(id.clone()) {
            Entry::Occupied(_) => Err(ClientError::DuplicateIdentifier(id)),
            Entry::Vacant(vacant) => {
                let state = RequestState::new(id, kind);
                let (snapshot_tx, _) = watch::channel(state.snapshot());
                vacant.insert(RequestEntry { state, snapshot_tx });
                Ok(())
            }
        }
    }

    /// Drop a request outright (submission rollback). Bound listeners go
    /// with it.
    pub fn remove(&self, id: &RequestId) -> Option<RequestSnapshot> {
        self.listeners.lock().bound.remove(id);
        self.requests
            .remove(id)
            .map(|(_, entry)| entry.state.snapshot())
    }

    pub fn snapshot(&self, id: &RequestId) -> Option<RequestSnapshot> {
        self.requests.get(id).map(|entry| entry.state.snapshot())
    }

    pub fn snapshots(&self) -> Vec<RequestSnapshot> {
        self.requests
            .iter()
            .map(|entry| entry.state.snapshot())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Apply one typed update to the request owning `id`.
    pub fn apply(&self, id: &RequestId, update: RequestUpdate) -> ApplyOutcome {
        let Some(mut entry) = self.requests.get_mut(id) else {
            return match update {
                RequestUpdate::Acknowledged { kind, message } => {
                    ApplyOutcome::Admitted(self.admit(id.clone(), kind, &message))
                }
                other => {
                    self.push_orphan(id.clone(), other.into_message());
                    ApplyOutcome::Orphaned
                }
            };
        };

        if entry.state.phase.is_terminal() {
            drop(entry);
            tracing::debug!(id = %id, "message for finished request recorded as duplicate");
            self.push_orphan(id.clone(), update.into_message());
            return ApplyOutcome::Ignored;
        }

        let cancelled = matches!(update, RequestUpdate::CancelAck { .. });
        let state = &mut entry.state;
        match update {
            RequestUpdate::Acknowledged { kind, message } => {
                if kind != state.kind {
                    tracing::warn!(
                        id = %id,
                        expected = %state.kind,
                        reported = %kind,
                        "node reported a different operation kind; keeping ours"
                    );
                }
                state.merge_fields(&message);
                state.advance(Phase::Queued);
            }
            RequestUpdate::Progress { message } => {
                state.progress.update_from(&message);
                state.advance(Phase::InProgress);
            }
            RequestUpdate::Succeeded { mut message } => {
                state.data = message.take_payload();
                state.merge_fields(&message);
                state.advance(Phase::Succeeded);
            }
            RequestUpdate::Failed { error, .. } => {
                state.error = Some(error);
                state.advance(Phase::Failed);
            }
            RequestUpdate::CancelAck { .. } => {
                state.phase = Phase::Cancelled;
            }
            RequestUpdate::Restarted { .. } => {
                // The one sanctioned regression: counters reset, phase
                // back to Queued, identifier and kind untouched.
                state.progress = Progress::default();
                state.phase = Phase::Queued;
            }
        }
        state.updated_at = Utc::now();
        let snapshot = state.snapshot();
        entry.snapshot_tx.send_replace(snapshot.clone());
        drop(entry);

        if cancelled {
            self.requests.remove(id);
            ApplyOutcome::Removed(snapshot)
        } else {
            ApplyOutcome::Updated(snapshot)
        }
    }

    fn admit(&self, id: RequestId, kind: OperationKind, message: &Message) -> RequestSnapshot {
        let mut state = RequestState::discovered(id.clone(), kind);
        state.merge_fields(message);
        let snapshot = state.snapshot();
        let (snapshot_tx, _) = watch::channel(snapshot.clone());
        self.requests
            .insert(id.clone(), RequestEntry { state, snapshot_tx });
        tracing::info!(id = %id, kind = %kind, "admitted node-reported persistent request");
        snapshot
    }

    fn push_orphan(&self, id: RequestId, message: Message) {
        let mut orphans = self.orphans.lock();
        if orphans.len() == ORPHAN_CAPACITY {
            orphans.pop_front();
        }
        tracing::debug!(id = %id, tag = message.name(), "orphan message");
        orphans.push_back((id, message));
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().len()
    }

    pub fn orphans(&self) -> Vec<(RequestId, Message)> {
        self.orphans.lock().iter().cloned().collect()
    }

    /// Watch the snapshot stream of one request.
    pub fn watch_request(&self, id: &RequestId) -> Option<watch::Receiver<RequestSnapshot>> {
        self.requests.get(id).map(|entry| entry.snapshot_tx.subscribe())
    }

    pub fn watch_disconnect(&self) -> watch::Receiver<bool> {
        self.disconnected_tx.subscribe()
    }

    pub fn is_disconnected(&self) -> bool {
        *self.disconnected_tx.borrow()
    }

    pub fn mark_disconnected(&self) {
        self.disconnected_tx.send_replace(true);
    }

    pub fn mark_connected(&self) {
        self.disconnected_tx.send_replace(false);
    }

    /// Bind a callback to one identifier. Dropped automatically once the
    /// request reaches a terminal phase.
    pub fn subscribe(
        &self,
        id: &RequestId,
        callback: impl Fn(&RequestSnapshot) + Send + Sync + 'static,
    ) -> Result<ListenerId, ClientError> {
        if !self.requests.contains_key(id) {
            return Err(ClientError::NotFound(id.clone()));
        }
        let listener_id = self.next_id();
        self.listeners
            .lock()
            .bound
            .entry(id.clone())
            .or_default()
            .push(Listener {
                id: listener_id,
                callback: Arc::new(callback),
            });
        Ok(listener_id)
    }

    /// Bind a callback to every request, including ones discovered later.
    pub fn subscribe_all(
        &self,
        callback: impl Fn(&RequestSnapshot) + Send + Sync + 'static,
    ) -> ListenerId {
        let listener_id = self.next_id();
        self.listeners.lock().global.push(Listener {
            id: listener_id,
            callback: Arc::new(callback),
        });
        listener_id
    }

    pub fn unsubscribe(&self, listener_id: ListenerId) -> bool {
        let mut table = self.listeners.lock();
        let before = table.global.len();
        table.global.retain(|listener| listener.id != listener_id);
        if table.global.len() != before {
            return true;
        }
        for listeners in table.bound.values_mut() {
            let before = listeners.len();
            listeners.retain(|listener| listener.id != listener_id);
            if listeners.len() != before {
                return true;
            }
        }
        false
    }

    /// Deliver a snapshot: identifier-bound listeners first, in
    /// registration order, then every all-requests listener. Callbacks
    /// run outside the table lock.
    pub fn notify(&self, snapshot: &RequestSnapshot) {
        let (bound, global) = {
            let mut table = self.listeners.lock();
            let bound: Vec<ListenerFn> = table
                .bound
                .get(&snapshot.id)
                .map(|listeners| {
                    listeners
                        .iter()
                        .map(|listener| Arc::clone(&listener.callback))
                        .collect()
                })
                .unwrap_or_default();
            if snapshot.phase.is_terminal() {
                table.bound.remove(&snapshot.id);
            }
            let global: Vec<ListenerFn> = table
                .global
                .iter()
                .map(|listener| Arc::clone(&listener.callback))
                .collect();
            (bound, global)
        };
        for callback in bound {
            callback(snapshot);
        }
        for callback in global {
            callback(snapshot);
        }
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}
