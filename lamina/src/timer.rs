//! Per-node one-shot timers.
//!
//! A timer is a spawned sleep-then-send task whose handle is retained under
//! `(query id, class)`. Firing delivers a message through the owner's own
//! mailbox, so timer handling is serialized with every other handler.
//! Cancellation aborts the task and is idempotent; a timer that already fired
//! leaves its message in the mailbox, where the handler treats the unknown
//! query id as a no-op.

use std::{collections::HashMap, time::Duration};

use lamina_types::{Message, NodeId, QueryId};
use tokio::{task::JoinHandle, time::sleep};

use crate::network::{Envelope, MailboxSender};

/// Which deadline a timer guards. A query id can own one timer of each class
/// at the same node (an L1 both forwards a critical write and collects votes
/// for it).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerClass {
    /// A forwarded request waiting for its upstream response.
    Request,
    /// A vote-collection window (database session, or L1 waiting on its L2s).
    Vote,
}

pub struct TimerRegistry {
    node: NodeId,
    mailbox: MailboxSender,
    timers: HashMap<(QueryId, TimerClass), JoinHandle<()>>,
}

impl TimerRegistry {
    pub fn new(node: NodeId, mailbox: MailboxSender) -> Self {
        Self {
            node,
            mailbox,
            timers: HashMap::new(),
        }
    }

    /// Schedule `msg` to be delivered to the owner after `delay`. Replaces an
    /// existing timer with the same key.
    pub fn schedule(&mut self, qid: QueryId, class: TimerClass, delay: Duration, msg: Message) {
        self.cancel(qid, class);
        let tx = self.mailbox.clone();
        let from = self.node;
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            tx.send(Envelope { from, msg }).ok();
        });
        self.timers.insert((qid, class), handle);
    }

    /// Abort a scheduled timer. Idempotent; aborting a fired timer is a
    /// no-op.
    pub fn cancel(&mut self, qid: QueryId, class: TimerClass) {
        if let Some(handle) = self.timers.remove(&(qid, class)) {
            handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }

    /// A timer outside the registry: cannot be cancelled, survives
    /// `cancel_all`. Used to schedule recovery from inside a crash.
    pub fn detached(&self, delay: Duration, msg: Message) {
        let tx = self.mailbox.clone();
        let from = self.node;
        tokio::spawn(async move {
            sleep(delay).await;
            tx.send(Envelope { from, msg }).ok();
        });
    }

    /// Number of live (unfired, uncancelled) timers.
    pub fn live(&mut self) -> usize {
        self.timers.retain(|_, handle| !handle.is_finished());
        self.timers.len()
    }
}
