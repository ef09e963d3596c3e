//! The transport shim: point-to-point delivery with an artificial per-send
//! delay.
//!
//! Every node owns a mailbox; the registry maps node ids to mailbox senders.
//! A node sends through its [`Outbox`], which lazily spawns one forwarder
//! task per destination. The forwarder delays each message by a uniform
//! random duration below the configured bound and delivers sequentially, so
//! the delay stays off the sender's critical path while every ordered pair of
//! nodes keeps FIFO delivery — a requirement of both the critical-write round
//! and the snapshot protocol.
//!
//! Each forwarder draws from its own `ChaCha8Rng`, seeded from the master
//! seed and the link's endpoints: a fixed seed reproduces a run exactly.

use std::{collections::HashMap, sync::Arc, time::Duration};

use lamina_types::{Message, NodeId};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::sleep,
};

/// A message together with its sender.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub from: NodeId,
    pub msg: Message,
}

pub type Mailbox = UnboundedReceiver<Envelope>;
pub type MailboxSender = UnboundedSender<Envelope>;

/// Immutable registry of every node's mailbox, shared by all outboxes.
#[derive(Clone, Default)]
pub struct Network {
    mailboxes: Arc<HashMap<NodeId, MailboxSender>>,
}

impl Network {
    pub fn new(mailboxes: HashMap<NodeId, MailboxSender>) -> Self {
        Self {
            mailboxes: Arc::new(mailboxes),
        }
    }

    /// Deliver directly, bypassing the delay shim. Used by the harness
    /// control plane (wiring, fault injection, probes), never by nodes.
    pub fn send_direct(&self, to: NodeId, env: Envelope) {
        if let Some(tx) = self.mailboxes.get(&to) {
            tx.send(env).ok();
        } else {
            tracing::warn!(%to, "dropping message for unknown node");
        }
    }

    fn mailbox(&self, to: NodeId) -> Option<MailboxSender> {
        self.mailboxes.get(&to).cloned()
    }
}

/// A node's sending half: one lazily created delay link per destination.
pub struct Outbox {
    from: NodeId,
    network: Network,
    delay_bound: Duration,
    seed: u64,
    links: HashMap<NodeId, UnboundedSender<Envelope>>,
}

impl Outbox {
    pub fn new(from: NodeId, network: Network, delay_bound: Duration, seed: u64) -> Self {
        Self {
            from,
            network,
            delay_bound,
            seed,
            links: HashMap::new(),
        }
    }

    pub fn send(&mut self, to: NodeId, msg: Message) {
        let env = Envelope {
            from: self.from,
            msg,
        };
        if self.delay_bound.is_zero() {
            self.network.send_direct(to, env);
            return;
        }
        if let Some(link) = self.links.get(&to) {
            // A closed link means the destination's task ended; nothing to do.
            link.send(env).ok();
            return;
        }
        let Some(dest) = self.network.mailbox(to) else {
            tracing::warn!(from = %self.from, %to, "dropping message for unknown node");
            return;
        };
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_link(
            rx,
            dest,
            self.delay_bound,
            link_seed(self.seed, self.from, to),
        ));
        tx.send(env).ok();
        self.links.insert(to, tx);
    }
}

/// Forwarder task for one ordered pair of nodes.
async fn run_link(
    mut rx: UnboundedReceiver<Envelope>,
    dest: MailboxSender,
    delay_bound: Duration,
    seed: u64,
) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let bound_ms = delay_bound.as_millis() as u64;
    while let Some(env) = rx.recv().await {
        sleep(Duration::from_millis(rng.gen_range(0..bound_ms))).await;
        if dest.send(env).is_err() {
            return;
        }
    }
}

fn link_seed(master: u64, from: NodeId, to: NodeId) -> u64 {
    // splitmix-style mixing keeps distinct links on distinct streams.
    let mut z = master
        .wrapping_add(from.as_u64().wrapping_mul(0x9e37_79b9_7f4a_7c15))
        .wrapping_add(to.as_u64().wrapping_mul(0xbf58_476d_1ce4_e5b9));
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
