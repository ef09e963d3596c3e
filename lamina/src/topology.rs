//! Tree description and bootstrap wiring.
//!
//! The tree is regular: one database, `l1_count` L1 caches, `l2_per_l1` L2s
//! under each L1, `clients_per_l2` clients under each L2. `spawn` builds the
//! mailboxes, starts every node task, delivers the `JoinCaches`
//! announcements and hands back a harness handle — the stand-in for the
//! external bootstrap, workload generator and fault injector.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use anyhow::{ensure, Result};
use lamina_types::{
    Event, EventLog, JoinCaches, Key, Message, NodeId, Options, Perform, RequestKind, Value,
};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    cache::{CacheNode, Tier},
    client::ClientNode,
    db::DatabaseNode,
    network::{Envelope, Network},
};

#[derive(Clone, Copy, Debug)]
pub struct Topology {
    pub l1_count: u32,
    pub l2_per_l1: u32,
    pub clients_per_l2: u32,
}

impl Topology {
    pub fn database(&self) -> NodeId {
        NodeId::database()
    }

    pub fn l1s(&self) -> Vec<NodeId> {
        (0..self.l1_count).map(NodeId::l1).collect()
    }

    pub fn l2s(&self) -> Vec<NodeId> {
        (0..self.l1_count * self.l2_per_l1).map(NodeId::l2).collect()
    }

    pub fn clients(&self) -> Vec<NodeId> {
        (0..self.l1_count * self.l2_per_l1 * self.clients_per_l2)
            .map(NodeId::client)
            .collect()
    }

    pub fn l2s_of(&self, l1: NodeId) -> Vec<NodeId> {
        let start = l1.index * self.l2_per_l1;
        (start..start + self.l2_per_l1).map(NodeId::l2).collect()
    }

    pub fn clients_of(&self, l2: NodeId) -> Vec<NodeId> {
        let start = l2.index * self.clients_per_l2;
        (start..start + self.clients_per_l2)
            .map(NodeId::client)
            .collect()
    }

    pub fn parent_of_l2(&self, l2: NodeId) -> NodeId {
        NodeId::l1(l2.index / self.l2_per_l1)
    }

    pub fn parent_of_client(&self, client: NodeId) -> NodeId {
        NodeId::l2(client.index / self.clients_per_l2)
    }

    pub fn all_nodes(&self) -> Vec<NodeId> {
        let mut nodes = vec![self.database()];
        nodes.extend(self.l1s());
        nodes.extend(self.l2s());
        nodes.extend(self.clients());
        nodes
    }
}

/// Handle to a running simulation: the control plane for workload, faults,
/// probes and snapshots, plus the observable event stream.
pub struct SimHandle {
    pub topology: Topology,
    pub opt: Options,
    pub events: Arc<EventLog>,
    network: Network,
    tasks: Vec<JoinHandle<()>>,
}

impl SimHandle {
    /// Build and start the whole tree. The database is seeded with
    /// `initial`, which is assumed to contain every key any client will
    /// request.
    pub fn spawn(topology: Topology, opt: Options, initial: BTreeMap<Key, Value>) -> Result<Self> {
        ensure!(topology.l1_count > 0, "at least one L1 is required");
        ensure!(topology.l2_per_l1 > 0, "at least one L2 per L1 is required");

        let events = EventLog::new(opt.events_channel_capacity);
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for node in topology.all_nodes() {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(node, tx);
            receivers.insert(node, rx);
        }
        let network = Network::new(senders.clone());

        let mut tasks = Vec::new();
        let db = topology.database();
        let take = |receivers: &mut HashMap<_, _>, node| {
            receivers
                .remove(&node)
                .expect("every node has exactly one mailbox")
        };

        tasks.push(tokio::spawn(
            DatabaseNode::new(
                db,
                opt.clone(),
                initial,
                network.clone(),
                events.clone(),
                take(&mut receivers, db),
                senders[&db].clone(),
            )
            .run(),
        ));
        for l1 in topology.l1s() {
            tasks.push(tokio::spawn(
                CacheNode::new(
                    l1,
                    Tier::L1,
                    opt.clone(),
                    network.clone(),
                    events.clone(),
                    take(&mut receivers, l1),
                    senders[&l1].clone(),
                )
                .run(),
            ));
        }
        for l2 in topology.l2s() {
            tasks.push(tokio::spawn(
                CacheNode::new(
                    l2,
                    Tier::L2,
                    opt.clone(),
                    network.clone(),
                    events.clone(),
                    take(&mut receivers, l2),
                    senders[&l2].clone(),
                )
                .run(),
            ));
        }
        for client in topology.clients() {
            tasks.push(tokio::spawn(
                ClientNode::new(
                    client,
                    opt.clone(),
                    network.clone(),
                    events.clone(),
                    take(&mut receivers, client),
                    senders[&client].clone(),
                )
                .run(),
            ));
        }

        let handle = SimHandle {
            topology,
            opt,
            events,
            network,
            tasks,
        };
        handle.wire();
        Ok(handle)
    }

    /// Deliver the `JoinCaches` announcements. Control-plane sends bypass
    /// the delay shim, so wiring lands before any workload.
    fn wire(&self) {
        let topology = &self.topology;
        self.send(
            topology.database(),
            Message::JoinCaches(JoinCaches {
                parent: None,
                children: topology.l1s(),
                snapshot_peers: topology.l1s(),
            }),
        );
        for l1 in topology.l1s() {
            let l2s = topology.l2s_of(l1);
            let mut snapshot_peers = vec![topology.database()];
            snapshot_peers.extend(l2s.iter().copied());
            self.send(
                l1,
                Message::JoinCaches(JoinCaches {
                    parent: Some(topology.database()),
                    children: l2s,
                    snapshot_peers,
                }),
            );
        }
        for l2 in topology.l2s() {
            let l1 = topology.parent_of_l2(l2);
            self.send(
                l2,
                Message::JoinCaches(JoinCaches {
                    parent: Some(l1),
                    children: topology.clients_of(l2),
                    // Clients do not participate in snapshots: an L2 is a
                    // leaf whose only peer is its parent.
                    snapshot_peers: vec![l1],
                }),
            );
        }
        for client in topology.clients() {
            self.send(
                client,
                Message::JoinCaches(JoinCaches {
                    parent: Some(topology.parent_of_client(client)),
                    children: Vec::new(),
                    snapshot_peers: Vec::new(),
                }),
            );
        }
    }

    pub fn send(&self, to: NodeId, msg: Message) {
        self.network.send_direct(
            to,
            Envelope {
                from: NodeId::driver(),
                msg,
            },
        );
    }

    /// Instruct a client to issue a request.
    pub fn perform(&self, client: NodeId, kind: RequestKind, key: Key, value: Option<Value>) {
        self.send(client, Message::Perform(Perform { kind, key, value }));
    }

    pub fn crash(&self, node: NodeId) {
        self.send(node, Message::Crash);
    }

    pub fn start_snapshot(&self) {
        self.send(self.topology.database(), Message::StartSnapshot);
    }

    /// Ask every node to report its protocol-map sizes.
    pub fn probe_all(&self) {
        for node in self.topology.all_nodes() {
            self.send(node, Message::Probe);
        }
    }

    pub fn subscribe(&self) -> async_broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}

impl Drop for SimHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
