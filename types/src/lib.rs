//! Shared types for the lamina multilevel cache: identifiers, the message
//! catalogue, the observable event model, configuration and error kinds.
//!
//! Everything here crosses node boundaries by value. Nodes own their state
//! exclusively; these types are the only things that travel between them.

pub mod config;
pub mod error;
pub mod event;
pub mod hops;
pub mod id;
pub mod message;

pub use config::Options;
pub use error::{OpError, OpResult, OpSuccess};
pub use event::{DataEvent, Direction, Event, EventLog, SnapshotRecord};
pub use hops::Hops;
pub use id::{NodeId, QueryId, Role};
pub use message::{
    CriticalUpdate, CriticalWriteResponse, CwOutcome, DataView, JoinCaches, Message, Perform,
    RequestKind, Response, Vote,
};

/// Keys stored in the database and caches.
pub type Key = u64;

/// Values stored under a [`Key`].
pub type Value = u64;

/// Per-key sequence number, owned and incremented only by the database.
pub type SeqNo = u64;
