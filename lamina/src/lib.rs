//! A simulated two-tier distributed cache.
//!
//! Clients talk to L2 caches, L2s to L1s, L1s to a single authoritative
//! database; requests climb the tree recording hops and responses walk the
//! hops back down. Plain writes fan out from the database as invalidation
//! updates; critical writes run a two-phase agreement between the database
//! and every L1 (each L1 in turn collecting votes from its L2s) before a
//! commit or abort is released. Caches crash-stop and cold-restart, per-key
//! sequence numbers keep client reads monotonic, and a Chandy–Lamport
//! snapshot can be cut across the whole tree at any time.
//!
//! Every node is a spawned task owning its state and draining a mailbox; no
//! state is shared across nodes and no handler ever blocks. Waiting is always
//! a scheduled timer plus a later inbound message.

pub mod cache;
pub mod client;
pub mod db;
pub mod network;
pub mod snapshot;
pub mod timer;
pub mod topology;

pub use cache::{CacheNode, Tier};
pub use client::ClientNode;
pub use db::DatabaseNode;
pub use network::{Envelope, MailboxSender, Network, Outbox};
pub use snapshot::SnapshotState;
pub use timer::{TimerClass, TimerRegistry};
pub use topology::{SimHandle, Topology};
