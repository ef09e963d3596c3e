//! The cache node, used for both tiers.
//!
//! An L1 sits between the database and its L2s; an L2 between its L1 and its
//! clients. Both keep a local store stamped with the last observed sequence
//! number per key, forward misses upward with a pending entry and a timer,
//! pop themselves off response hops on the way back down, and take part in
//! critical-write rounds by locking keys and voting. The only asymmetries:
//! an L1 aggregates its L2s' votes before answering the database and fans
//! invalidations out to its children, while an L2 votes directly and never
//! forwards cache traffic to clients except along the hop path.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use lamina_types::{
    CriticalUpdate, CriticalWriteResponse, CwOutcome, DataEvent, Direction, Event, EventLog, Hops,
    Key, Message, NodeId, Options, QueryId, RequestKind, Response, SeqNo, Value, Vote,
};
use tracing::instrument;

use crate::{
    network::{Envelope, Mailbox, MailboxSender, Network, Outbox},
    snapshot::SnapshotState,
    timer::{TimerClass, TimerRegistry},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    L1,
    L2,
}

/// A request forwarded upward, awaiting the response or the timer.
struct PendingRequest {
    kind: RequestKind,
    key: Key,
    /// The request's hops as received; its tail is the downstream node a
    /// failure response must go to.
    return_hops: Hops,
}

/// A key frozen by a critical-write session observed at this cache.
struct CwLock {
    qid: QueryId,
    value: Value,
}

/// An L1's vote-collection round: which L2 children have answered Ok.
struct VoteRound {
    key: Key,
    acks: HashSet<NodeId>,
}

pub struct CacheNode {
    id: NodeId,
    tier: Tier,
    opt: Options,
    store: BTreeMap<Key, Value>,
    seqno: BTreeMap<Key, SeqNo>,
    pending: HashMap<QueryId, PendingRequest>,
    locked: HashMap<Key, CwLock>,
    votes: HashMap<QueryId, VoteRound>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    snapshot_peers: Vec<NodeId>,
    crashed: bool,
    snapshot: SnapshotState,
    timers: TimerRegistry,
    outbox: Outbox,
    events: Arc<EventLog>,
    mailbox: Mailbox,
}

impl CacheNode {
    pub fn new(
        id: NodeId,
        tier: Tier,
        opt: Options,
        network: Network,
        events: Arc<EventLog>,
        mailbox: Mailbox,
        mailbox_tx: MailboxSender,
    ) -> Self {
        Self {
            id,
            tier,
            outbox: Outbox::new(id, network, opt.network_delay(), opt.seed),
            timers: TimerRegistry::new(id, mailbox_tx),
            opt,
            store: BTreeMap::new(),
            seqno: BTreeMap::new(),
            pending: HashMap::new(),
            locked: HashMap::new(),
            votes: HashMap::new(),
            parent: None,
            children: Vec::new(),
            snapshot_peers: Vec::new(),
            crashed: false,
            snapshot: SnapshotState::default(),
            events,
            mailbox,
        }
    }

    #[instrument(skip_all, fields(id = %self.id), name = "Cache")]
    pub async fn run(mut self) {
        while let Some(env) = self.mailbox.recv().await {
            self.handle(env);
        }
        tracing::debug!("mailbox closed; cache task ending");
    }

    fn handle(&mut self, env: Envelope) {
        let Envelope { from, msg } = env;
        if self.crashed {
            if matches!(msg, Message::Recovery) {
                self.recover();
            } else {
                tracing::trace!(%from, "crashed; dropping message");
            }
            return;
        }
        // Chandy–Lamport channel recording: updates arriving while the
        // sender's token is outstanding belong to the cut.
        if self.snapshot.recording(from) {
            if let Some((key, value, seqno)) = msg.transit_view() {
                self.snapshot.record_transit(key, value, seqno);
            }
        }
        if let Some(view) = msg.data_view() {
            self.events.emit(Event::Data(DataEvent::from_view(
                self.id,
                from,
                view,
                Direction::Received,
            )));
        }
        match msg {
            Message::Read {
                qid,
                key,
                critical,
                hops,
            } => self.on_read(qid, key, critical, hops),
            Message::Write {
                qid,
                key,
                value,
                critical,
                hops,
            } => self.forward_up(qid, RequestKind::write(critical), key, hops, |qid, hops| {
                Message::Write {
                    qid,
                    key,
                    value,
                    critical,
                    hops,
                }
            }),
            Message::Response(resp) => self.on_response(resp),
            Message::CriticalUpdate(update) => self.on_critical_update(update),
            Message::CriticalUpdateResponse { qid, vote } => self.on_child_vote(from, qid, vote),
            Message::CriticalUpdateTimeout { qid } => self.on_vote_timeout(qid),
            Message::CriticalWriteResponse(resp) => self.on_cw_response(resp),
            Message::Timeout { qid } => self.on_timeout(qid),
            Message::Crash => self.crash(),
            Message::Recovery => {
                // Already recovered; a stray detached timer is harmless.
            },
            Message::JoinCaches(join) => {
                self.parent = join.parent;
                self.children = join.children;
                self.snapshot_peers = join.snapshot_peers;
            },
            Message::Token { snapshot_id } => self.on_token(from, snapshot_id),
            Message::Probe => {
                let timers = self.timers.live();
                self.events.emit(Event::Quiescence {
                    node: self.id,
                    pending: self.pending.len(),
                    locked: self.locked.len(),
                    sessions: self.votes.len(),
                    timers,
                });
            },
            other => {
                tracing::warn!(%from, ?other, "unexpected message at a cache");
            },
        }
    }

    /// Serve a plain read from the local store when possible; critical reads
    /// always go to the database so they cannot observe a value older than a
    /// committing critical write.
    fn on_read(&mut self, qid: QueryId, key: Key, critical: bool, hops: Hops) {
        if !critical && !self.locked.contains_key(&key) {
            if let Some(value) = self.store.get(&key).copied() {
                let seqno = self.seqno.get(&key).copied().unwrap_or(0);
                tracing::debug!(%qid, key, value, seqno, "cache hit");
                self.respond(Response {
                    qid,
                    value: Some((key, value)),
                    seqno,
                    kind: RequestKind::Read,
                    hops,
                });
                return;
            }
        }
        self.forward_up(qid, RequestKind::read(critical), key, hops, |qid, hops| {
            Message::Read {
                qid,
                key,
                critical,
                hops,
            }
        })
    }

    /// Record the pending entry, start the upstream timer, append ourselves
    /// to the hops and send on.
    fn forward_up(
        &mut self,
        qid: QueryId,
        kind: RequestKind,
        key: Key,
        mut hops: Hops,
        build: impl FnOnce(QueryId, Hops) -> Message,
    ) {
        let Some(parent) = self.parent else {
            tracing::warn!(%qid, "not wired to a parent; dropping request");
            return;
        };
        self.pending.insert(
            qid,
            PendingRequest {
                kind,
                key,
                return_hops: hops.clone(),
            },
        );
        self.timers.schedule(
            qid,
            TimerClass::Request,
            self.opt.request_timeout(),
            Message::Timeout { qid },
        );
        hops.push(self.id);
        self.send(parent, build(qid, hops));
    }

    fn on_response(&mut self, mut resp: Response) {
        if resp.hops.tail() == Some(self.id) {
            // Routed through us: pop our hop, settle the pending entry, and
            // pass it down the path.
            resp.hops.pop();
            if self.pending.remove(&resp.qid).is_none() {
                tracing::debug!(qid = %resp.qid, "routed response for a request no longer pending");
            }
            self.timers.cancel(resp.qid, TimerClass::Request);
            if let Some((key, value)) = resp.value {
                self.apply_update(key, value, resp.seqno);
            }
            // A successful write refreshes the rest of the subtree too.
            if self.tier == Tier::L1 && resp.kind.is_write() && resp.value.is_some() {
                let routed_to = resp.hops.tail();
                for child in self.children.clone() {
                    if Some(child) == routed_to {
                        continue;
                    }
                    self.send(
                        child,
                        Message::Response(Response {
                            hops: Hops::none(),
                            ..resp.clone()
                        }),
                    );
                }
            }
            self.respond(resp);
        } else {
            // An invalidation copy, or a broadcast routed at a sibling.
            if let Some((key, value)) = resp.value {
                self.apply_update(key, value, resp.seqno);
                if self.tier == Tier::L1 {
                    resp.hops = Hops::none();
                    for child in self.children.clone() {
                        self.send(child, Message::Response(resp.clone()));
                    }
                }
            }
        }
    }

    /// Overwrite the cached entry only for a seqno at least as new as ours;
    /// stale updates are discarded silently (a normal ordering event).
    fn apply_update(&mut self, key: Key, value: Value, seqno: SeqNo) {
        match self.seqno.get(&key) {
            Some(cached) if seqno < *cached => {
                tracing::debug!(key, seqno, cached, "discarding stale update");
            },
            _ => {
                self.store.insert(key, value);
                self.seqno.insert(key, seqno);
            },
        }
    }

    /// Phase one of a critical write: freeze the key and vote, pulling the
    /// whole subtree in first if we have cache children.
    fn on_critical_update(&mut self, update: CriticalUpdate) {
        if let Some(lock) = self.locked.get(&update.key) {
            if lock.qid != update.qid {
                tracing::warn!(
                    qid = %update.qid,
                    key = update.key,
                    held_by = %lock.qid,
                    "key already locked by another session; voting no",
                );
                self.vote(update.qid, Vote::No);
            }
            return;
        }
        self.locked.insert(
            update.key,
            CwLock {
                qid: update.qid,
                value: update.value,
            },
        );
        match self.tier {
            Tier::L2 => self.vote(update.qid, Vote::Ok),
            Tier::L1 => {
                if self.children.is_empty() {
                    self.vote(update.qid, Vote::Ok);
                    return;
                }
                self.votes.insert(
                    update.qid,
                    VoteRound {
                        key: update.key,
                        acks: HashSet::new(),
                    },
                );
                self.timers.schedule(
                    update.qid,
                    TimerClass::Vote,
                    self.opt.crit_write_timeout(),
                    Message::CriticalUpdateTimeout { qid: update.qid },
                );
                for child in self.children.clone() {
                    self.send(child, Message::CriticalUpdate(update.clone()));
                }
            },
        }
    }

    fn on_child_vote(&mut self, from: NodeId, qid: QueryId, vote: Vote) {
        let Some(round) = self.votes.get_mut(&qid) else {
            tracing::trace!(%from, %qid, "vote for a closed round");
            return;
        };
        let decision = match vote {
            Vote::No => Some(Vote::No),
            Vote::Ok => {
                round.acks.insert(from);
                self.children
                    .iter()
                    .all(|child| round.acks.contains(child))
                    .then_some(Vote::Ok)
            },
        };
        if let Some(vote) = decision {
            self.votes.remove(&qid);
            self.timers.cancel(qid, TimerClass::Vote);
            self.vote(qid, vote);
        }
    }

    fn on_vote_timeout(&mut self, qid: QueryId) {
        self.timers.cancel(qid, TimerClass::Vote);
        if let Some(round) = self.votes.remove(&qid) {
            tracing::warn!(%qid, key = round.key, "vote collection timed out; voting no");
            self.vote(qid, Vote::No);
        }
    }

    fn vote(&mut self, qid: QueryId, vote: Vote) {
        let Some(parent) = self.parent else {
            tracing::warn!(%qid, "not wired to a parent; dropping vote");
            return;
        };
        self.send(parent, Message::CriticalUpdateResponse { qid, vote });
    }

    /// Phase two: apply the proposal on commit, release the lock either way,
    /// fan the outcome out to cache children and route it toward the
    /// originator when the hop path says so.
    fn on_cw_response(&mut self, mut resp: CriticalWriteResponse) {
        match self.locked.get(&resp.key).map(|lock| lock.qid) {
            Some(holder) if holder == resp.qid => {
                if let Some(lock) = self.locked.remove(&resp.key) {
                    if resp.outcome == CwOutcome::Commit {
                        if let Some(seqno) = resp.new_seqno {
                            self.apply_update(resp.key, lock.value, seqno);
                        }
                    }
                }
            },
            Some(holder) => tracing::warn!(
                qid = %resp.qid,
                key = resp.key,
                held_by = %holder,
                "critical outcome for a key held by another session",
            ),
            // Normal after a cold restart wiped the lock.
            None => tracing::debug!(qid = %resp.qid, "critical outcome for an unknown session"),
        }
        if self.votes.remove(&resp.qid).is_some() {
            self.timers.cancel(resp.qid, TimerClass::Vote);
        }

        let mut routed_to = None;
        if resp.hops.tail() == Some(self.id) {
            resp.hops.pop();
            self.pending.remove(&resp.qid);
            self.timers.cancel(resp.qid, TimerClass::Request);
            if let Some(next) = resp.hops.tail() {
                routed_to = Some(next);
                self.send(next, Message::CriticalWriteResponse(resp.clone()));
            }
        }
        if self.tier == Tier::L1 {
            for child in self.children.clone() {
                if Some(child) == routed_to {
                    continue;
                }
                self.send(
                    child,
                    Message::CriticalWriteResponse(CriticalWriteResponse {
                        hops: Hops::none(),
                        ..resp.clone()
                    }),
                );
            }
        }
    }

    /// The upstream gave up on us: fail the request down its return path.
    fn on_timeout(&mut self, qid: QueryId) {
        self.timers.cancel(qid, TimerClass::Request);
        let Some(pending) = self.pending.remove(&qid) else {
            return;
        };
        tracing::warn!(%qid, key = pending.key, "upstream timeout; failing the request downward");
        let seqno = self.seqno.get(&pending.key).copied().unwrap_or(0);
        self.respond(Response {
            qid,
            value: None,
            seqno,
            kind: pending.kind,
            hops: pending.return_hops,
        });
    }

    fn crash(&mut self) {
        tracing::warn!("crashing");
        self.crashed = true;
        self.pending.clear();
        self.votes.clear();
        self.timers.cancel_all();
        self.snapshot.reset();
        self.events.emit(Event::Crashed { node: self.id });
        // Detached on purpose: nothing may cancel a recovery.
        self.timers
            .detached(self.opt.recovery_delay(), Message::Recovery);
    }

    /// Cold restart: wiring survives, everything else is gone.
    fn recover(&mut self) {
        tracing::info!("recovered; cold restart");
        self.crashed = false;
        self.store.clear();
        self.seqno.clear();
        self.pending.clear();
        self.locked.clear();
        self.votes.clear();
        self.snapshot.reset();
        self.events.emit(Event::Recovered { node: self.id });
    }

    fn on_token(&mut self, from: NodeId, snapshot_id: u64) {
        if !self.snapshot.captured() {
            self.snapshot.capture(snapshot_id, &self.store, &self.seqno);
            for peer in self.snapshot_peers.clone() {
                self.send(peer, Message::Token { snapshot_id });
            }
        }
        self.snapshot.on_token(from, snapshot_id);
        if let Some(record) = self.snapshot.try_complete(self.id, &self.snapshot_peers) {
            tracing::debug!(snapshot_id = record.snapshot_id, "snapshot participation complete");
            self.events.emit(Event::Snapshot(record));
        }
    }

    fn respond(&mut self, resp: Response) {
        match resp.hops.tail() {
            Some(next) => self.send(next, Message::Response(resp)),
            None => tracing::warn!(qid = %resp.qid, "response with no remaining hops"),
        }
    }

    fn send(&mut self, to: NodeId, msg: Message) {
        if let Some(view) = msg.data_view() {
            self.events.emit(Event::Data(DataEvent::from_view(
                self.id,
                to,
                view,
                Direction::Sent,
            )));
        }
        self.outbox.send(to, msg);
    }
}

#[cfg(test)]
mod test {
    use lamina_types::QueryId;
    use lamina_utils::test_utils::setup_test;
    use tokio::sync::mpsc;

    use super::*;

    /// A cache wired by hand, with zero network delay so sends land
    /// synchronously in the captured mailboxes.
    struct Rig {
        cache: CacheNode,
        parent_rx: Mailbox,
        child_rx: Mailbox,
    }

    fn rig(tier: Tier) -> Rig {
        setup_test();
        let parent = NodeId::l1(0);
        let child = NodeId::client(0);
        let me = NodeId::l2(0);

        let (parent_tx, parent_rx) = mpsc::unbounded_channel();
        let (child_tx, child_rx) = mpsc::unbounded_channel();
        let (me_tx, me_rx) = mpsc::unbounded_channel();
        let network = Network::new(
            [(parent, parent_tx), (child, child_tx), (me, me_tx.clone())]
                .into_iter()
                .collect(),
        );

        let opt = Options {
            network_delay_ms: 0,
            ..Options::default()
        };
        let events = EventLog::new(opt.events_channel_capacity);
        let mut cache = CacheNode::new(me, tier, opt, network, events, me_rx, me_tx);
        cache.handle(Envelope {
            from: NodeId::driver(),
            msg: Message::JoinCaches(lamina_types::JoinCaches {
                parent: Some(parent),
                children: vec![child],
                snapshot_peers: vec![parent],
            }),
        });
        Rig {
            cache,
            parent_rx,
            child_rx,
        }
    }

    fn update(qid: QueryId, key: Key, value: Value, seqno: SeqNo) -> Envelope {
        Envelope {
            from: NodeId::l1(0),
            msg: Message::Response(Response {
                qid,
                value: Some((key, value)),
                seqno,
                kind: RequestKind::Write,
                hops: Hops::none(),
            }),
        }
    }

    fn qid(seq: u64) -> QueryId {
        QueryId::new(NodeId::client(0), seq)
    }

    #[tokio::test]
    async fn stale_updates_are_discarded() {
        let mut rig = rig(Tier::L2);
        // Interleaving delivered seqno 3 before seqno 2 for the same key.
        rig.cache.handle(update(qid(1), 7, 73, 3));
        rig.cache.handle(update(qid(2), 7, 72, 2));
        assert_eq!(rig.cache.store.get(&7), Some(&73));
        assert_eq!(rig.cache.seqno.get(&7), Some(&3));
    }

    #[tokio::test]
    async fn plain_reads_hit_the_cache_but_locked_keys_forward() {
        let mut rig = rig(Tier::L2);
        rig.cache.handle(update(qid(1), 1, 10, 1));

        // Warm key: answered locally, nothing reaches the parent.
        rig.cache.handle(Envelope {
            from: NodeId::client(0),
            msg: Message::Read {
                qid: qid(2),
                key: 1,
                critical: false,
                hops: Hops::origin(NodeId::client(0)),
            },
        });
        let env = rig.child_rx.try_recv().expect("cache hit response");
        let Message::Response(resp) = env.msg else {
            panic!("expected a response");
        };
        assert_eq!(resp.value, Some((1, 10)));
        assert_eq!(resp.seqno, 1);
        assert!(rig.parent_rx.try_recv().is_err());

        // Same key under a critical-write lock: forwarded instead.
        rig.cache.handle(Envelope {
            from: NodeId::l1(0),
            msg: Message::CriticalUpdate(CriticalUpdate {
                qid: qid(3),
                key: 1,
                value: 99,
                hops: Hops::origin(NodeId::client(1)),
            }),
        });
        // The L2 votes Ok for the session first.
        let env = rig.parent_rx.try_recv().unwrap();
        assert!(matches!(
            env.msg,
            Message::CriticalUpdateResponse {
                vote: Vote::Ok,
                ..
            }
        ));
        rig.cache.handle(Envelope {
            from: NodeId::client(0),
            msg: Message::Read {
                qid: qid(4),
                key: 1,
                critical: false,
                hops: Hops::origin(NodeId::client(0)),
            },
        });
        let env = rig.parent_rx.try_recv().expect("locked key must forward");
        assert!(matches!(env.msg, Message::Read { key: 1, .. }));
        assert!(rig.cache.pending.contains_key(&qid(4)));
    }

    #[tokio::test]
    async fn critical_reads_always_forward() {
        let mut rig = rig(Tier::L2);
        rig.cache.handle(update(qid(1), 5, 50, 2));
        rig.cache.handle(Envelope {
            from: NodeId::client(0),
            msg: Message::Read {
                qid: qid(2),
                key: 5,
                critical: true,
                hops: Hops::origin(NodeId::client(0)),
            },
        });
        assert!(rig.child_rx.try_recv().is_err(), "no local answer");
        let env = rig.parent_rx.try_recv().unwrap();
        let Message::Read { hops, .. } = env.msg else {
            panic!("expected the forwarded read");
        };
        assert_eq!(hops.tail(), Some(NodeId::l2(0)));
    }

    #[tokio::test]
    async fn conflicting_critical_update_votes_no() {
        let mut rig = rig(Tier::L2);
        rig.cache.handle(Envelope {
            from: NodeId::l1(0),
            msg: Message::CriticalUpdate(CriticalUpdate {
                qid: qid(1),
                key: 2,
                value: 20,
                hops: Hops::origin(NodeId::client(1)),
            }),
        });
        let env = rig.parent_rx.try_recv().unwrap();
        assert!(matches!(
            env.msg,
            Message::CriticalUpdateResponse {
                vote: Vote::Ok,
                ..
            }
        ));

        // A different session on the same key cannot lock it.
        let other = QueryId::new(NodeId::client(9), 1);
        rig.cache.handle(Envelope {
            from: NodeId::l1(0),
            msg: Message::CriticalUpdate(CriticalUpdate {
                qid: other,
                key: 2,
                value: 21,
                hops: Hops::origin(NodeId::client(9)),
            }),
        });
        let env = rig.parent_rx.try_recv().unwrap();
        let Message::CriticalUpdateResponse { qid: voted, vote } = env.msg else {
            panic!("expected a vote");
        };
        assert_eq!(voted, other);
        assert_eq!(vote, Vote::No);
    }

    #[tokio::test]
    async fn commit_applies_the_locked_value_and_abort_does_not() {
        let mut rig = rig(Tier::L2);
        for (seq, key, value, outcome) in [
            (1, 2, 77, CwOutcome::Commit),
            (2, 3, 30, CwOutcome::Abort),
        ] {
            rig.cache.handle(Envelope {
                from: NodeId::l1(0),
                msg: Message::CriticalUpdate(CriticalUpdate {
                    qid: qid(seq),
                    key,
                    value,
                    hops: Hops::origin(NodeId::client(1)),
                }),
            });
            rig.parent_rx.try_recv().unwrap(); // the Ok vote
            rig.cache.handle(Envelope {
                from: NodeId::l1(0),
                msg: Message::CriticalWriteResponse(CriticalWriteResponse {
                    qid: qid(seq),
                    key,
                    outcome,
                    new_seqno: (outcome == CwOutcome::Commit).then_some(21),
                    hops: Hops::none(),
                }),
            });
        }
        assert_eq!(rig.cache.store.get(&2), Some(&77));
        assert_eq!(rig.cache.seqno.get(&2), Some(&21));
        assert_eq!(rig.cache.store.get(&3), None);
        assert!(rig.cache.locked.is_empty());
    }

    #[tokio::test]
    async fn crashed_caches_are_silent_and_restart_cold() {
        let mut rig = rig(Tier::L2);
        rig.cache.handle(update(qid(1), 1, 10, 1));
        rig.cache.handle(Envelope {
            from: NodeId::driver(),
            msg: Message::Crash,
        });

        rig.cache.handle(Envelope {
            from: NodeId::client(0),
            msg: Message::Read {
                qid: qid(2),
                key: 1,
                critical: false,
                hops: Hops::origin(NodeId::client(0)),
            },
        });
        assert!(rig.parent_rx.try_recv().is_err(), "crashed: no forwarding");
        assert!(rig.child_rx.try_recv().is_err(), "crashed: no responses");

        rig.cache.handle(Envelope {
            from: NodeId::l2(0),
            msg: Message::Recovery,
        });
        assert!(!rig.cache.crashed);
        assert!(rig.cache.store.is_empty(), "cold restart clears the store");
        assert!(rig.cache.pending.is_empty());
    }
}
