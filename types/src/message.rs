//! The on-the-wire message catalogue.
//!
//! One tagged union covers every message in the system; each node's handler
//! dispatches with a single `match` on the discriminator. Requests travel up
//! the tree recording hops, responses walk the hops back down.

use serde::{Deserialize, Serialize};

use crate::{Hops, Key, NodeId, QueryId, SeqNo, Value};

/// What an operation is, from the protocol's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Read,
    Write,
    CritRead,
    CritWrite,
}

impl RequestKind {
    pub fn read(critical: bool) -> Self {
        if critical {
            Self::CritRead
        } else {
            Self::Read
        }
    }

    pub fn write(critical: bool) -> Self {
        if critical {
            Self::CritWrite
        } else {
            Self::Write
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, Self::CritRead | Self::CritWrite)
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Self::Write | Self::CritWrite)
    }
}

/// An L2's (or L1's aggregated) answer to a `CriticalUpdate`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    Ok,
    No,
}

/// Terminal outcome of a critical-write session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CwOutcome {
    Commit,
    Abort,
}

/// Answer to a read or write, also used as the invalidation/update fan-out
/// for plain writes. `value = None` means the operation failed (key locked by
/// a critical write, or an upstream timeout).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub qid: QueryId,
    pub value: Option<(Key, Value)>,
    pub seqno: SeqNo,
    pub kind: RequestKind,
    pub hops: Hops,
}

/// First phase of a critical write: lock the key everywhere. DB → all L1s,
/// each L1 → all its L2s.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalUpdate {
    pub qid: QueryId,
    pub key: Key,
    pub value: Value,
    pub hops: Hops,
}

/// Second phase of a critical write: commit or abort, released to every cache
/// and routed along the hops to the originator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalWriteResponse {
    pub qid: QueryId,
    /// The key the session was about; lets a cache that lost its lock (cold
    /// restart) still make sense of the outcome, and keeps the checker log
    /// keyed.
    pub key: Key,
    pub outcome: CwOutcome,
    /// The committed sequence number; `None` on abort.
    pub new_seqno: Option<SeqNo>,
    pub hops: Hops,
}

/// Bootstrap wiring announcement: who a node's parent, children and snapshot
/// peers are.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinCaches {
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub snapshot_peers: Vec<NodeId>,
}

/// A workload instruction for a client node, standing in for the external
/// request generator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Perform {
    pub kind: RequestKind,
    pub key: Key,
    /// The value to write; ignored for reads.
    pub value: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Plain or critical read, travelling up toward the database.
    Read {
        qid: QueryId,
        key: Key,
        critical: bool,
        hops: Hops,
    },
    /// Plain or critical write, travelling up toward the database.
    Write {
        qid: QueryId,
        key: Key,
        value: Value,
        critical: bool,
        hops: Hops,
    },
    Response(Response),
    CriticalUpdate(CriticalUpdate),
    /// Vote for an open critical-write session; L2 → L1, aggregated L1 → DB.
    CriticalUpdateResponse { qid: QueryId, vote: Vote },
    /// Self-message: a vote-collection window expired (DB session timer, or
    /// an L1 waiting on its L2s).
    CriticalUpdateTimeout { qid: QueryId },
    CriticalWriteResponse(CriticalWriteResponse),
    /// Self-message: a pending request's timer fired.
    Timeout { qid: QueryId },
    /// Fault injection: the receiving cache crash-stops.
    Crash,
    /// Self-message scheduled on a detached timer: the crashed cache restarts
    /// cold.
    Recovery,
    JoinCaches(JoinCaches),
    /// Snapshot trigger, injected at the database.
    StartSnapshot,
    /// Chandy–Lamport marker.
    Token { snapshot_id: u64 },
    /// Workload instruction for a client.
    Perform(Perform),
    /// Harness probe: the receiver reports the sizes of its protocol maps.
    Probe,
}

/// The fields of a data-carrying message, as logged for the consistency
/// checker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataView {
    pub kind: RequestKind,
    pub key: Option<Key>,
    pub value: Option<Value>,
    pub seqno: Option<SeqNo>,
    pub qid: QueryId,
    /// The route the message carried, so hop integrity can be replayed from
    /// the log.
    pub hops: Hops,
}

impl Message {
    /// The checker-visible view of this message, if it carries data. Requests
    /// and responses are logged; votes, timers, tokens and control messages
    /// are not.
    pub fn data_view(&self) -> Option<DataView> {
        match self {
            Self::Read {
                qid,
                key,
                critical,
                hops,
            } => Some(DataView {
                kind: RequestKind::read(*critical),
                key: Some(*key),
                value: None,
                seqno: None,
                qid: *qid,
                hops: hops.clone(),
            }),
            Self::Write {
                qid,
                key,
                value,
                critical,
                hops,
            } => Some(DataView {
                kind: RequestKind::write(*critical),
                key: Some(*key),
                value: Some(*value),
                seqno: None,
                qid: *qid,
                hops: hops.clone(),
            }),
            Self::Response(r) => Some(DataView {
                kind: r.kind,
                key: r.value.map(|(k, _)| k),
                value: r.value.map(|(_, v)| v),
                seqno: Some(r.seqno),
                qid: r.qid,
                hops: r.hops.clone(),
            }),
            Self::CriticalUpdate(u) => Some(DataView {
                kind: RequestKind::CritWrite,
                key: Some(u.key),
                value: Some(u.value),
                seqno: None,
                qid: u.qid,
                hops: u.hops.clone(),
            }),
            Self::CriticalWriteResponse(r) => Some(DataView {
                kind: RequestKind::CritWrite,
                key: Some(r.key),
                value: None,
                seqno: r.new_seqno,
                qid: r.qid,
                hops: r.hops.clone(),
            }),
            _ => None,
        }
    }

    /// The `(key, value, seqno)` this message would deposit in a cache, for
    /// Chandy–Lamport channel recording. Only update-carrying messages count:
    /// successful responses and critical-update payloads.
    pub fn transit_view(&self) -> Option<(Key, Value, Option<SeqNo>)> {
        match self {
            Self::Response(r) => r.value.map(|(k, v)| (k, v, Some(r.seqno))),
            Self::CriticalUpdate(u) => Some((u.key, u.value, None)),
            _ => None,
        }
    }
}
