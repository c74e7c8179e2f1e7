//! Asynchronous client for a warren content-addressable storage node.
//!
//! The node runs long-lived jobs — single-file puts and gets, directory
//! puts — that survive client disconnects. This crate owns the control
//! connection, frames and correlates protocol traffic by identifier,
//! tracks every job in a request registry (including jobs discovered when
//! reattaching to a node that kept working without us), and delivers
//! immutable snapshots to listeners and waiters.

pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod session;
pub mod state;

pub use connection::{Connection, Transport};
pub use dispatcher::UnsolicitedFn;
pub use error::ClientError;
pub use registry::{ApplyOutcome, ListenerId, RequestRegistry, RequestUpdate};
pub use session::{
    GetRequest, PutDirRequest, PutRequest, PutSource, Session, SessionConfig,
};
pub use state::{
    FileEntry, GetDetails, OperationKind, Phase, Progress, PutDetails, PutDirDetails,
    RequestError, RequestSnapshot,
};
