//! The observable event stream consumed by the test-suite checker.
//!
//! Every node publishes structured records of what it sends, receives and
//! decides. Records accumulate in an in-memory log for offline replay and are
//! simultaneously broadcast for live subscribers, with the default receiver
//! deactivated so an unobserved stream costs nothing.

use std::{collections::BTreeMap, sync::Arc};

use async_broadcast::{InactiveReceiver, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    message::DataView, CwOutcome, Hops, Key, NodeId, OpResult, QueryId, RequestKind, SeqNo, Value,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Sent,
    Received,
}

/// One send or receive of a data-carrying message, in the shape the
/// consistency checker expects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEvent {
    pub actor: NodeId,
    pub peer: NodeId,
    pub kind: RequestKind,
    pub key: Option<Key>,
    pub value: Option<Value>,
    pub seqno: Option<SeqNo>,
    pub qid: QueryId,
    pub critical: bool,
    pub direction: Direction,
    /// The route the message carried; responses must stay prefixes of their
    /// request's route.
    pub hops: Hops,
}

impl DataEvent {
    /// The checker-log record for one send or receive of a data-carrying
    /// message.
    pub fn from_view(actor: NodeId, peer: NodeId, view: DataView, direction: Direction) -> Self {
        Self {
            actor,
            peer,
            kind: view.kind,
            key: view.key,
            value: view.value,
            seqno: view.seqno,
            qid: view.qid,
            critical: view.kind.is_critical(),
            direction,
            hops: view.hops,
        }
    }
}

/// One participant's contribution to a snapshot round: its captured state and
/// the messages recorded in transit on its inbound channels.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub node: NodeId,
    pub snapshot_id: u64,
    pub store: BTreeMap<Key, Value>,
    pub seqno: BTreeMap<Key, SeqNo>,
    pub data_in_transit: BTreeMap<Key, Value>,
    pub seqno_in_transit: BTreeMap<Key, SeqNo>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    Data(DataEvent),
    /// A client operation reached a terminal outcome.
    ClientOutcome {
        client: NodeId,
        qid: QueryId,
        kind: RequestKind,
        key: Key,
        result: OpResult,
    },
    /// A client observed a sequence number below one it had already seen for
    /// the same key. Must never happen.
    MonotonicViolation {
        client: NodeId,
        key: Key,
        seen: SeqNo,
        prior: SeqNo,
        qid: QueryId,
    },
    /// The database resolved a critical-write session.
    CwResolved {
        qid: QueryId,
        key: Key,
        outcome: CwOutcome,
        new_seqno: Option<SeqNo>,
    },
    Snapshot(SnapshotRecord),
    Crashed { node: NodeId },
    Recovered { node: NodeId },
    /// Answer to a probe: current sizes of the node's protocol maps. All
    /// zeros in quiescence.
    Quiescence {
        node: NodeId,
        pending: usize,
        locked: usize,
        sessions: usize,
        timers: usize,
    },
}

/// Shared sink for [`Event`]s: an append-only record log plus a broadcast
/// channel for live waiting.
pub struct EventLog {
    records: Mutex<Vec<Event>>,
    sender: Sender<Event>,
    receiver: InactiveReceiver<Event>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (mut sender, receiver) = async_broadcast::broadcast(capacity);
        sender.set_overflow(true);
        Arc::new(Self {
            records: Mutex::new(Vec::new()),
            sender,
            receiver: receiver.deactivate(),
        })
    }

    /// Record an event and wake live subscribers. Send errors are ignored;
    /// they only mean nobody is listening right now.
    pub fn emit(&self, event: Event) {
        self.records.lock().push(event.clone());
        self.sender.try_broadcast(event).ok();
    }

    /// A live subscription starting from now. Older events are read from
    /// [`records`](Self::records).
    pub fn subscribe(&self) -> Receiver<Event> {
        self.receiver.activate_cloned()
    }

    /// Everything emitted so far.
    pub fn records(&self) -> Vec<Event> {
        self.records.lock().clone()
    }

    /// The full log as JSON lines, for offline consumption.
    pub fn to_json_lines(&self) -> serde_json::Result<String> {
        let records = self.records.lock();
        let mut out = String::new();
        for record in records.iter() {
            out.push_str(&serde_json::to_string(record)?);
            out.push('\n');
        }
        Ok(out)
    }
}
