//! The authoritative database node: ground truth for every key, the only
//! authority that increments sequence numbers, and the coordinator of
//! critical-write sessions.

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

/// An open critical-write session awaiting votes from every L1.
struct CwSession {
    key: Key,
    value: Value,
    hops: Hops,
    acks: HashSet<NodeId>,
}

pub struct DatabaseNode {
    id: NodeId,
    opt: Options,
    store: BTreeMap<Key, Value>,
    seqno: BTreeMap<Key, SeqNo>,
    sessions: HashMap<QueryId, CwSession>,
    /// Keys frozen by an open session. While a key is here, plain reads
    /// return unavailable and plain writes are rejected.
    locked: HashMap<Key, QueryId>,
    l1s: Vec<NodeId>,
    snapshot: SnapshotState,
    timers: TimerRegistry,
    outbox: Outbox,
    events: Arc<EventLog>,
    mailbox: Mailbox,
}

impl DatabaseNode {
    pub fn new(
        id: NodeId,
        opt: Options,
        initial: BTreeMap<Key, Value>,
        network: Network,
        events: Arc<EventLog>,
        mailbox: Mailbox,
        mailbox_tx: MailboxSender,
    ) -> Self {
        let seqno = initial.keys().map(|k| (*k, 0)).collect();
        Self {
            id,
            outbox: Outbox::new(id, network, opt.network_delay(), opt.seed),
            timers: TimerRegistry::new(id, mailbox_tx),
            opt,
            store: initial,
            seqno,
            sessions: HashMap::new(),
            locked: HashMap::new(),
            l1s: Vec::new(),
            snapshot: SnapshotState::default(),
            events,
            mailbox,
        }
    }

    /// Drain the mailbox until every sender is gone. The database never
    /// crashes.
    #[instrument(skip_all, fields(id = %self.id), name = "Database")]
    pub async fn run(mut self) {
        while let Some(env) = self.mailbox.recv().await {
            self.handle(env);
        }
        tracing::debug!("mailbox closed; database task ending");
    }

    fn handle(&mut self, env: Envelope) {
        let Envelope { from, msg } = env;
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
                critical: false,
                hops,
            } => self.on_write(qid, key, value, hops),
            Message::Write {
                qid,
                key,
                value,
                critical: true,
                hops,
            } => self.on_critical_write(qid, key, value, hops),
            Message::CriticalUpdateResponse { qid, vote } => self.on_vote(from, qid, vote),
            Message::CriticalUpdateTimeout { qid } => {
                if self.sessions.contains_key(&qid) {
                    tracing::warn!(%qid, "critical write timed out waiting for votes; aborting");
                    self.resolve(qid, CwOutcome::Abort);
                }
            },
            Message::StartSnapshot => self.on_start_snapshot(),
            Message::Token { snapshot_id } => self.on_token(from, snapshot_id),
            Message::JoinCaches(join) => {
                self.l1s = join.children;
            },
            Message::Probe => {
                let timers = self.timers.live();
                self.events.emit(Event::Quiescence {
                    node: self.id,
                    pending: 0,
                    locked: self.locked.len(),
                    sessions: self.sessions.len(),
                    timers,
                });
            },
            other => {
                tracing::warn!(%from, ?other, "unexpected message at the database");
            },
        }
    }

    fn on_read(&mut self, qid: QueryId, key: Key, critical: bool, hops: Hops) {
        let seqno = self.seqno.get(&key).copied().unwrap_or(0);
        let value = if self.locked.contains_key(&key) {
            tracing::debug!(%qid, key, "read refused: key locked by a critical write");
            None
        } else {
            self.store.get(&key).map(|v| (key, *v))
        };
        self.respond(Response {
            qid,
            value,
            seqno,
            kind: RequestKind::read(critical),
            hops,
        });
    }

    fn on_write(&mut self, qid: QueryId, key: Key, value: Value, hops: Hops) {
        if self.locked.contains_key(&key) {
            tracing::debug!(%qid, key, "write refused: key locked by a critical write");
            let seqno = self.seqno.get(&key).copied().unwrap_or(0);
            self.respond(Response {
                qid,
                value: None,
                seqno,
                kind: RequestKind::Write,
                hops,
            });
            return;
        }
        let seqno = self.bump_seqno(key);
        self.store.insert(key, value);
        tracing::debug!(%qid, key, value, seqno, "applied plain write");
        // The success response doubles as the invalidation/update fan-out:
        // the L1 on the hop path routes it back to the originator, every L1
        // refreshes its subtree from it.
        for l1 in self.l1s.clone() {
            self.send(
                l1,
                Message::Response(Response {
                    qid,
                    value: Some((key, value)),
                    seqno,
                    kind: RequestKind::Write,
                    hops: hops.clone(),
                }),
            );
        }
    }

    fn on_critical_write(&mut self, qid: QueryId, key: Key, value: Value, hops: Hops) {
        if self.locked.contains_key(&key) {
            tracing::debug!(%qid, key, "critical write refused: key already in a session");
            let seqno = self.seqno.get(&key).copied().unwrap_or(0);
            self.respond(Response {
                qid,
                value: None,
                seqno,
                kind: RequestKind::CritWrite,
                hops,
            });
            return;
        }
        tracing::debug!(%qid, key, value, "opening critical write session");
        self.locked.insert(key, qid);
        self.sessions.insert(
            qid,
            CwSession {
                key,
                value,
                hops: hops.clone(),
                acks: HashSet::new(),
            },
        );
        self.timers.schedule(
            qid,
            TimerClass::Vote,
            self.opt.crit_write_timeout(),
            Message::CriticalUpdateTimeout { qid },
        );
        for l1 in self.l1s.clone() {
            self.send(
                l1,
                Message::CriticalUpdate(CriticalUpdate {
                    qid,
                    key,
                    value,
                    hops: hops.clone(),
                }),
            );
        }
    }

    fn on_vote(&mut self, from: NodeId, qid: QueryId, vote: Vote) {
        let Some(session) = self.sessions.get_mut(&qid) else {
            // The session already resolved; late votes are dropped.
            tracing::trace!(%from, %qid, "vote for a closed session");
            return;
        };
        match vote {
            Vote::No => {
                tracing::debug!(%from, %qid, "vote no; aborting");
                self.resolve(qid, CwOutcome::Abort);
            },
            Vote::Ok => {
                session.acks.insert(from);
                if self.l1s.iter().all(|l1| session.acks.contains(l1)) {
                    self.resolve(qid, CwOutcome::Commit);
                }
            },
        }
    }

    /// Close a session: apply on commit, release the lock, fan the outcome
    /// out to every L1 and clean up.
    fn resolve(&mut self, qid: QueryId, outcome: CwOutcome) {
        let Some(session) = self.sessions.remove(&qid) else {
            return;
        };
        self.timers.cancel(qid, TimerClass::Vote);
        self.locked.remove(&session.key);
        let new_seqno = match outcome {
            CwOutcome::Commit => {
                let seqno = self.bump_seqno(session.key);
                self.store.insert(session.key, session.value);
                Some(seqno)
            },
            CwOutcome::Abort => None,
        };
        tracing::info!(%qid, key = session.key, ?outcome, ?new_seqno, "critical write resolved");
        self.events.emit(Event::CwResolved {
            qid,
            key: session.key,
            outcome,
            new_seqno,
        });
        for l1 in self.l1s.clone() {
            self.send(
                l1,
                Message::CriticalWriteResponse(CriticalWriteResponse {
                    qid,
                    key: session.key,
                    outcome,
                    new_seqno,
                    hops: session.hops.clone(),
                }),
            );
        }
    }

    fn on_start_snapshot(&mut self) {
        let snapshot_id = self.snapshot.begin(&self.store, &self.seqno);
        tracing::info!(snapshot_id, "starting snapshot round");
        for l1 in self.l1s.clone() {
            self.send(l1, Message::Token { snapshot_id });
        }
        self.finish_snapshot_if_complete();
    }

    fn on_token(&mut self, from: NodeId, snapshot_id: u64) {
        if !self.snapshot.captured() {
            // Rounds start here, so this is unexpected, but the generic
            // first-token rule still applies.
            self.snapshot.capture(snapshot_id, &self.store, &self.seqno);
            for l1 in self.l1s.clone() {
                self.send(l1, Message::Token { snapshot_id });
            }
        }
        self.snapshot.on_token(from, snapshot_id);
        self.finish_snapshot_if_complete();
    }

    fn finish_snapshot_if_complete(&mut self) {
        if let Some(record) = self.snapshot.try_complete(self.id, &self.l1s) {
            tracing::info!(snapshot_id = record.snapshot_id, "snapshot round complete");
            self.events.emit(Event::Snapshot(record));
        }
    }

    fn bump_seqno(&mut self, key: Key) -> SeqNo {
        let seqno = self.seqno.entry(key).or_insert(0);
        *seqno += 1;
        *seqno
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
