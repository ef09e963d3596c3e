//! The client node: issues requests against its L2, enforces its own
//! timeout, and asserts the monotonic-read contract on every successful
//! response.

use std::{collections::HashMap, sync::Arc};

use lamina_types::{
    CriticalWriteResponse, CwOutcome, DataEvent, Direction, Event, EventLog, Hops, Key, Message,
    NodeId, OpError, OpSuccess, Options, Perform, QueryId, RequestKind, Response, SeqNo, Value,
};
use tracing::instrument;

use crate::{
    network::{Envelope, Mailbox, MailboxSender, Network, Outbox},
    timer::{TimerClass, TimerRegistry},
};

struct PendingOp {
    kind: RequestKind,
    key: Key,
    /// The proposed value for writes; what a commit reports back.
    value: Option<Value>,
}

pub struct ClientNode {
    id: NodeId,
    opt: Options,
    parent: Option<NodeId>,
    next_seq: u64,
    pending: HashMap<QueryId, PendingOp>,
    /// Highest seqno observed per key; the monotonic-read assertion.
    last_seen: HashMap<Key, SeqNo>,
    timers: TimerRegistry,
    outbox: Outbox,
    events: Arc<EventLog>,
    mailbox: Mailbox,
}

impl ClientNode {
    pub fn new(
        id: NodeId,
        opt: Options,
        network: Network,
        events: Arc<EventLog>,
        mailbox: Mailbox,
        mailbox_tx: MailboxSender,
    ) -> Self {
        Self {
            id,
            outbox: Outbox::new(id, network, opt.network_delay(), opt.seed),
            timers: TimerRegistry::new(id, mailbox_tx),
            opt,
            parent: None,
            next_seq: 0,
            pending: HashMap::new(),
            last_seen: HashMap::new(),
            events,
            mailbox,
        }
    }

    #[instrument(skip_all, fields(id = %self.id), name = "Client")]
    pub async fn run(mut self) {
        while let Some(env) = self.mailbox.recv().await {
            self.handle(env);
        }
        tracing::debug!("mailbox closed; client task ending");
    }

    fn handle(&mut self, env: Envelope) {
        let Envelope { from, msg } = env;
        if let Some(view) = msg.data_view() {
            self.events.emit(Event::Data(DataEvent::from_view(
                self.id,
                from,
                view,
                Direction::Received,
            )));
        }
        match msg {
            Message::Perform(perform) => self.on_perform(perform),
            Message::Response(resp) => self.on_response(resp),
            Message::CriticalWriteResponse(resp) => self.on_cw_response(resp),
            Message::Timeout { qid } => self.on_timeout(qid),
            Message::JoinCaches(join) => {
                self.parent = join.parent;
            },
            Message::Probe => {
                let timers = self.timers.live();
                self.events.emit(Event::Quiescence {
                    node: self.id,
                    pending: self.pending.len(),
                    locked: 0,
                    sessions: 0,
                    timers,
                });
            },
            other => {
                tracing::warn!(%from, ?other, "unexpected message at a client");
            },
        }
    }

    fn on_perform(&mut self, perform: Perform) {
        let Some(parent) = self.parent else {
            tracing::warn!("not wired to an L2; dropping workload instruction");
            return;
        };
        let qid = QueryId::new(self.id, self.next_seq);
        self.next_seq += 1;
        self.pending.insert(
            qid,
            PendingOp {
                kind: perform.kind,
                key: perform.key,
                value: perform.value,
            },
        );
        self.timers.schedule(
            qid,
            TimerClass::Request,
            self.opt.client_timeout(),
            Message::Timeout { qid },
        );
        let hops = Hops::origin(self.id);
        let msg = match perform.kind {
            RequestKind::Read | RequestKind::CritRead => Message::Read {
                qid,
                key: perform.key,
                critical: perform.kind.is_critical(),
                hops,
            },
            RequestKind::Write | RequestKind::CritWrite => Message::Write {
                qid,
                key: perform.key,
                value: perform.value.unwrap_or_default(),
                critical: perform.kind.is_critical(),
                hops,
            },
        };
        tracing::debug!(%qid, kind = ?perform.kind, key = perform.key, "issuing request");
        self.send(parent, msg);
    }

    fn on_response(&mut self, mut resp: Response) {
        if resp.hops.tail() == Some(self.id) {
            resp.hops.pop();
        }
        let Some(op) = self.pending.remove(&resp.qid) else {
            tracing::trace!(qid = %resp.qid, "late response; request already settled");
            return;
        };
        self.timers.cancel(resp.qid, TimerClass::Request);
        let result = match resp.value {
            Some((key, value)) => {
                self.note_seqno(resp.qid, key, resp.seqno);
                Ok(OpSuccess {
                    value,
                    seqno: resp.seqno,
                })
            },
            None => Err(OpError::Unavailable(op.key)),
        };
        tracing::debug!(qid = %resp.qid, ?result, "request settled");
        self.events.emit(Event::ClientOutcome {
            client: self.id,
            qid: resp.qid,
            kind: op.kind,
            key: op.key,
            result,
        });
    }

    fn on_cw_response(&mut self, mut resp: CriticalWriteResponse) {
        if resp.hops.tail() == Some(self.id) {
            resp.hops.pop();
        }
        let Some(op) = self.pending.remove(&resp.qid) else {
            tracing::trace!(qid = %resp.qid, "late critical outcome; request already settled");
            return;
        };
        self.timers.cancel(resp.qid, TimerClass::Request);
        let result = match resp.outcome {
            CwOutcome::Commit => {
                let seqno = resp.new_seqno.unwrap_or_default();
                self.note_seqno(resp.qid, op.key, seqno);
                Ok(OpSuccess {
                    value: op.value.unwrap_or_default(),
                    seqno,
                })
            },
            CwOutcome::Abort => Err(OpError::Aborted),
        };
        tracing::debug!(qid = %resp.qid, ?result, "critical write settled");
        self.events.emit(Event::ClientOutcome {
            client: self.id,
            qid: resp.qid,
            kind: op.kind,
            key: op.key,
            result,
        });
    }

    fn on_timeout(&mut self, qid: QueryId) {
        self.timers.cancel(qid, TimerClass::Request);
        let Some(op) = self.pending.remove(&qid) else {
            return;
        };
        tracing::warn!(%qid, key = op.key, "request timed out");
        self.events.emit(Event::ClientOutcome {
            client: self.id,
            qid,
            kind: op.kind,
            key: op.key,
            result: Err(OpError::TimedOut),
        });
    }

    /// Monotonic reads per key: a client that has seen seqno `s` for a key
    /// must never observe a smaller one afterwards.
    fn note_seqno(&mut self, qid: QueryId, key: Key, seqno: SeqNo) {
        let prior = self.last_seen.get(&key).copied().unwrap_or(0);
        if seqno < prior {
            tracing::error!(%qid, key, seqno, prior, "monotonic read violated");
            self.events.emit(Event::MonotonicViolation {
                client: self.id,
                key,
                seen: seqno,
                prior,
                qid,
            });
        } else {
            self.last_seen.insert(key, seqno);
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
