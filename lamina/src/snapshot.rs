//! Chandy–Lamport snapshot state, embedded by composition in the database
//! and both cache tiers.
//!
//! A round starts at the database, which captures its state and floods
//! `Token`s down the tree. Every other participant captures on its first
//! token, re-floods to all of its peers, and records update-carrying
//! messages arriving on channels whose token is still outstanding. Once
//! tokens from every peer have arrived the participant emits its record and
//! resets for the next round. Clients do not participate; an L2 is a leaf
//! whose only peer is its parent L1.

use std::collections::{BTreeMap, HashSet};

use lamina_types::{Key, NodeId, SeqNo, SnapshotRecord, Value};

#[derive(Debug, Default)]
pub struct SnapshotState {
    snapshot_id: u64,
    captured: bool,
    captured_store: BTreeMap<Key, Value>,
    captured_seqno: BTreeMap<Key, SeqNo>,
    data_in_transit: BTreeMap<Key, Value>,
    seqno_in_transit: BTreeMap<Key, SeqNo>,
    tokens_received: HashSet<NodeId>,
}

impl SnapshotState {
    /// Open a round at the root: bump the round id and capture local state.
    /// Returns the new round id to stamp on the outgoing tokens.
    pub fn begin(&mut self, store: &BTreeMap<Key, Value>, seqno: &BTreeMap<Key, SeqNo>) -> u64 {
        self.snapshot_id += 1;
        self.capture(self.snapshot_id, store, seqno);
        self.snapshot_id
    }

    /// Capture local state for round `id`. First-token behavior at
    /// non-roots.
    pub fn capture(&mut self, id: u64, store: &BTreeMap<Key, Value>, seqno: &BTreeMap<Key, SeqNo>) {
        self.snapshot_id = id;
        self.captured = true;
        self.captured_store = store.clone();
        self.captured_seqno = seqno.clone();
        self.data_in_transit.clear();
        self.seqno_in_transit.clear();
        self.tokens_received.clear();
    }

    /// Note a token from `peer`, closing that channel's recording.
    pub fn on_token(&mut self, peer: NodeId, id: u64) {
        self.snapshot_id = id;
        self.tokens_received.insert(peer);
    }

    /// Whether a round is open and this participant has captured.
    pub fn captured(&self) -> bool {
        self.captured
    }

    /// Whether messages from `peer` belong to the cut and must be recorded:
    /// state is captured and `peer`'s token is still outstanding.
    pub fn recording(&self, peer: NodeId) -> bool {
        self.captured && !self.tokens_received.contains(&peer)
    }

    /// Record one in-transit update. Later messages for the same key
    /// overwrite earlier ones, matching in-order replay onto the captured
    /// store.
    pub fn record_transit(&mut self, key: Key, value: Value, seqno: Option<SeqNo>) {
        self.data_in_transit.insert(key, value);
        if let Some(seqno) = seqno {
            self.seqno_in_transit.insert(key, seqno);
        }
    }

    /// If tokens from every peer have arrived, close the round: emit this
    /// participant's record and reset everything but the round counter.
    pub fn try_complete(&mut self, node: NodeId, peers: &[NodeId]) -> Option<SnapshotRecord> {
        if !self.captured || !peers.iter().all(|p| self.tokens_received.contains(p)) {
            return None;
        }
        let record = SnapshotRecord {
            node,
            snapshot_id: self.snapshot_id,
            store: std::mem::take(&mut self.captured_store),
            seqno: std::mem::take(&mut self.captured_seqno),
            data_in_transit: std::mem::take(&mut self.data_in_transit),
            seqno_in_transit: std::mem::take(&mut self.seqno_in_transit),
        };
        self.captured = false;
        self.tokens_received.clear();
        Some(record)
    }

    /// Forget an in-progress round (crash recovery). The round counter is
    /// kept so a later token with a higher id is still adopted.
    pub fn reset(&mut self) {
        self.captured = false;
        self.captured_store.clear();
        self.captured_seqno.clear();
        self.data_in_transit.clear();
        self.seqno_in_transit.clear();
        self.tokens_received.clear();
    }
}
