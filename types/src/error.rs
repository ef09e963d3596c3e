//! Operation outcomes as seen by a client.
//!
//! Failures never cross node boundaries as `Err` values; they travel as null
//! responses along the same hop path as successes and only become a typed
//! error at the originating client.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Key, SeqNo, Value};

/// Why a client operation failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum OpError {
    /// A null response walked back down the hop path: the key is frozen by
    /// an in-flight critical write, or a cache on the path gave up waiting
    /// upstream. The wire does not distinguish the two.
    #[error("key {0} unavailable")]
    Unavailable(Key),
    /// No response arrived within the requester's timeout.
    #[error("timed out waiting for a response")]
    TimedOut,
    /// The critical-write session this operation opened was aborted.
    #[error("critical write aborted")]
    Aborted,
}

/// A successful operation: the value observed (read) or installed (write),
/// stamped with the database sequence number it carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpSuccess {
    pub value: Value,
    pub seqno: SeqNo,
}

pub type OpResult = Result<OpSuccess, OpError>;
