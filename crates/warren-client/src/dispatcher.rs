//! The receive loop: one task per session pulls decoded frames off the
//! connection, correlates them by identifier, applies them through the
//! registry, and invokes listeners with the resulting snapshots.
//!
//! Listener callbacks run synchronously on this task, so they must not
//! block or do long-running work; anything heavy belongs on the
//! callback's own executor.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;

use warren_proto::{keys, tags, Message, RequestId};

use crate::connection::{Connection, MessageReader};
use crate::registry::{ApplyOutcome, RequestRegistry, RequestUpdate};
use crate::state::{OperationKind, RequestError};

/// Handler for messages outside any request's lifecycle: handshake
/// traffic, identifier-less errors, list-exchange boundaries, and tags
/// this client does not recognize.
pub type UnsolicitedFn = Arc<dyn Fn(&Message) + Send + Sync>;

pub(crate) struct Dispatcher {
    registry: Arc<RequestRegistry>,
    connection: Arc<Connection>,
    unsolicited: Option<UnsolicitedFn>,
}

impl Dispatcher {
    pub(crate) fn spawn(
        reader: MessageReader,
        registry: Arc<RequestRegistry>,
        connection: Arc<Connection>,
        unsolicited: Option<UnsolicitedFn>,
    ) -> JoinHandle<()> {
        let dispatcher = Self {
            registry,
            connection,
            unsolicited,
        };
        tokio::spawn(dispatcher.run(reader))
    }

    async fn run(self, mut reader: MessageReader) {
        loop {
            match reader.next().await {
                Some(Ok(message)) => self.route(message),
                Some(Err(err)) => {
                    tracing::error!(error = %err, "receive loop failed, closing connection");
                    break;
                }
                None => {
                    tracing::info!("node closed the connection");
                    break;
                }
            }
        }
        self.connection.close();
        self.registry.mark_disconnected();
    }

    fn route(&self, message: Message) {
        let Some(identifier) = message.identifier().map(RequestId::from_raw) else {
            self.global(message);
            return;
        };
        let update = match message.name() {
            tags::PERSISTENT_PUT => RequestUpdate::Acknowledged {
                kind: OperationKind::Put,
                message,
            },
            tags::PERSISTENT_GET => RequestUpdate::Acknowledged {
                kind: OperationKind::Get,
                message,
            },
            tags::PERSISTENT_PUT_DIR => RequestUpdate::Acknowledged {
                kind: OperationKind::PutDir,
                message,
            },
            tags::PROGRESS => RequestUpdate::Progress { message },
            tags::PUT_SUCCESSFUL | tags::DATA_FOUND | tags::ALL_DATA => {
                RequestUpdate::Succeeded { message }
            }
            tags::PUT_FAILED
            | tags::GET_FAILED
            | tags::PROTOCOL_ERROR
            | tags::IDENTIFIER_COLLISION => RequestUpdate::Failed {
                error: RequestError::from_message(&message),
                message,
            },
            tags::REQUEST_REMOVED => RequestUpdate::CancelAck { message },
            tags::RESTARTED => RequestUpdate::Restarted { message },
            _ => {
                // Correlated but unrecognized: forward compatibility says
                // hand it to the default handler, not the floor.
                self.global(message);
                return;
            }
        };
        match self.registry.apply(&identifier, update) {
            ApplyOutcome::Updated(snapshot)
            | ApplyOutcome::Admitted(snapshot)
            | ApplyOutcome::Removed(snapshot) => self.registry.notify(&snapshot),
            ApplyOutcome::Orphaned | ApplyOutcome::Ignored => {}
        }
    }

    fn global(&self, message: Message) {
        match message.name() {
            tags::NODE_HELLO => {
                tracing::debug!("node hello outside handshake ignored");
            }
            tags::END_LIST_PERSISTENT_REQUESTS => {
                tracing::debug!(tracked = self.registry.len(), "persistent request listing complete");
            }
            tags::PROTOCOL_ERROR => {
                tracing::warn!(
                    code = message.field(keys::CODE).unwrap_or("?"),
                    description = message.field(keys::CODE_DESCRIPTION).unwrap_or(""),
                    "node reported a global protocol error"
                );
            }
            other => {
                tracing::debug!(tag = other, "unrecognized message");
            }
        }
        if let Some(handler) = &self.unsolicited {
            handler(&message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::time::sleep;

    use crate::state::Phase;

    struct Harness {
        registry: Arc<RequestRegistry>,
        connection: Arc<Connection>,
        node: tokio::io::DuplexStream,
        handle: JoinHandle<()>,
    }

    fn start(unsolicited: Option<UnsolicitedFn>) -> Harness {
        let (near, node) = tokio::io::duplex(16 * 1024);
        let (connection, reader) = Connection::from_transport(Box::new(near));
        let registry = Arc::new(RequestRegistry::new());
        let handle = Dispatcher::spawn(
            reader,
            Arc::clone(&registry),
            Arc::clone(&connection),
            unsolicited,
        );
        Harness {
            registry,
            connection,
            node,
            handle,
        }
    }

    async fn feed(node: &mut tokio::io::DuplexStream, frames: &[u8]) {
        node.write_all(frames).await.unwrap();
        // Give the dispatcher task a beat to drain.
        sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn put_dir_progress_reaches_succeeded() {
        let mut harness = start(None);
        let id = RequestId::from_raw("job-1");
        harness
            .registry
            .register(id.clone(), OperationKind::PutDir)
            .unwrap();

        feed(
            &mut harness.node,
            b"PersistentPutDir\nIdentifier=job-1\nFileCount=3\nEnd\n\
              Progress\nIdentifier=job-1\nTotal=3\nSucceeded=1\nEnd\n\
              Progress\nIdentifier=job-1\nTotal=3\nSucceeded=3\nEnd\n\
              PutSuccessful\nIdentifier=job-1\nEnd\n",
        )
        .await;

        let snapshot = harness.registry.snapshot(&id).unwrap();
        assert_eq!(snapshot.phase, Phase::Succeeded);
        assert_eq!(snapshot.progress.succeeded, 3);
        assert_eq!(snapshot.put_dir_details().unwrap().file_count, Some(3));
        harness.handle.abort();
    }

    #[tokio::test]
    async fn node_failure_is_terminal_and_sticky() {
        let mut harness = start(None);
        let id = RequestId::from_raw("job-2");
        harness
            .registry
            .register(id.clone(), OperationKind::Get)
            .unwrap();

        feed(
            &mut harness.node,
            b"ProtocolError\nIdentifier=job-2\nCode=7\nCodeDescription=invalid key\nEnd\n",
        )
        .await;
        let snapshot = harness.registry.snapshot(&id).unwrap();
        assert_eq!(snapshot.phase, Phase::Failed);
        assert_eq!(snapshot.error.as_ref().unwrap().description, "invalid key");

        // Anything after the terminal message is a recorded duplicate.
        feed(
            &mut harness.node,
            b"Progress\nIdentifier=job-2\nSucceeded=9\nEnd\n",
        )
        .await;
        let snapshot = harness.registry.snapshot(&id).unwrap();
        assert_eq!(snapshot.phase, Phase::Failed);
        assert_eq!(snapshot.progress.succeeded, 0);
        harness.handle.abort();
    }

    #[tokio::test]
    async fn unknown_persistent_job_is_admitted_and_announced() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut harness = start(None);
        let log = Arc::clone(&seen);
        harness.registry.subscribe_all(move |snapshot| {
            log.lock().push((snapshot.id.clone(), snapshot.phase));
        });

        feed(
            &mut harness.node,
            b"PersistentPutDir\nIdentifier=old-1\nURI=SSK@site\nFileCount=2\nEnd\n",
        )
        .await;

        let id = RequestId::from_raw("old-1");
        let snapshot = harness.registry.snapshot(&id).unwrap();
        assert!(snapshot.discovered);
        assert_eq!(snapshot.kind, OperationKind::PutDir);
        assert_eq!(seen.lock().as_slice(), &[(id, Phase::Queued)]);
        harness.handle.abort();
    }

    #[tokio::test]
    async fn cancel_ack_delivers_then_removes() {
        let phases = Arc::new(Mutex::new(Vec::new()));
        let mut harness = start(None);
        let id = RequestId::from_raw("job-3");
        harness
            .registry
            .register(id.clone(), OperationKind::Put)
            .unwrap();
        let log = Arc::clone(&phases);
        harness
            .registry
            .subscribe(&id, move |snapshot| log.lock().push(snapshot.phase))
            .unwrap();

        feed(&mut harness.node, b"RequestRemoved\nIdentifier=job-3\nEnd\n").await;

        assert_eq!(phases.lock().as_slice(), &[Phase::Cancelled]);
        assert!(harness.registry.snapshot(&id).is_none());
        harness.handle.abort();
    }

    #[tokio::test]
    async fn progress_for_unknown_id_is_orphaned() {
        let mut harness = start(None);
        feed(
            &mut harness.node,
            b"Progress\nIdentifier=stranger\nSucceeded=1\nEnd\n",
        )
        .await;
        assert_eq!(harness.registry.orphan_count(), 1);
        assert!(harness.registry.is_empty());
        harness.handle.abort();
    }

    #[tokio::test]
    async fn unrecognized_tag_goes_to_unsolicited_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let handler: UnsolicitedFn = Arc::new(move |message: &Message| {
            log.lock().push(message.name().to_owned());
        });
        let mut harness = start(Some(handler));

        feed(
            &mut harness.node,
            b"FutureTag\nIdentifier=job-1\nEnd\n\
              EndListPersistentRequests\nEnd\n",
        )
        .await;

        assert_eq!(
            seen.lock().as_slice(),
            &["FutureTag".to_owned(), "EndListPersistentRequests".to_owned()]
        );
        harness.handle.abort();
    }

    #[tokio::test]
    async fn malformed_frame_closes_connection() {
        let mut harness = start(None);
        feed(&mut harness.node, b"Progress\nthis is not a field\nEnd\n").await;

        assert!(!harness.connection.is_open());
        assert!(harness.registry.is_disconnected());
        // The receive task exited on its own.
        harness.handle.await.unwrap();
    }

    #[tokio::test]
    async fn stream_end_marks_disconnect() {
        let harness = start(None);
        drop(harness.node);

        tokio::time::timeout(Duration::from_secs(1), harness.handle)
            .await
            .expect("dispatcher exits on stream end")
            .unwrap();
        assert!(harness.registry.is_disconnected());
        assert!(!harness.connection.is_open());
    }
}
