//! Node and query identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The role a node plays in the cache tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    /// The single authoritative database at the root.
    Database,
    /// First-tier cache, directly in front of the database.
    L1,
    /// Second-tier cache, directly in front of clients.
    L2,
    /// Request originator.
    Client,
    /// The external harness injecting workload and faults. Never a tree node.
    Driver,
}

/// Stable identifier of a node, unique across the whole simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub role: Role,
    pub index: u32,
}

impl NodeId {
    pub const fn database() -> Self {
        Self {
            role: Role::Database,
            index: 0,
        }
    }

    pub const fn l1(index: u32) -> Self {
        Self {
            role: Role::L1,
            index,
        }
    }

    pub const fn l2(index: u32) -> Self {
        Self {
            role: Role::L2,
            index,
        }
    }

    pub const fn client(index: u32) -> Self {
        Self {
            role: Role::Client,
            index,
        }
    }

    pub const fn driver() -> Self {
        Self {
            role: Role::Driver,
            index: 0,
        }
    }

    /// A stable 64-bit encoding, used to derive per-link RNG seeds.
    pub fn as_u64(&self) -> u64 {
        let role = match self.role {
            Role::Database => 0u64,
            Role::L1 => 1,
            Role::L2 => 2,
            Role::Client => 3,
            Role::Driver => 4,
        };
        (role << 32) | u64::from(self.index)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            Role::Database => write!(f, "db"),
            Role::L1 => write!(f, "l1-{}", self.index),
            Role::L2 => write!(f, "l2-{}", self.index),
            Role::Client => write!(f, "c{}", self.index),
            Role::Driver => write!(f, "driver"),
        }
    }
}

/// Globally unique identifier of a client request. Survives forwarding: every
/// message belonging to the same operation carries the same `QueryId`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueryId {
    /// The client that originated the request.
    pub origin: NodeId,
    /// The origin's request counter at issue time.
    pub seq: u64,
}

impl QueryId {
    pub fn new(origin: NodeId, seq: u64) -> Self {
        Self { origin, seq }
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.origin, self.seq)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn node_id_display_is_role_tagged() {
        assert_eq!(NodeId::database().to_string(), "db");
        assert_eq!(NodeId::l1(2).to_string(), "l1-2");
        assert_eq!(NodeId::l2(5).to_string(), "l2-5");
        assert_eq!(NodeId::client(9).to_string(), "c9");
    }

    #[test]
    fn as_u64_distinguishes_roles_and_indices() {
        let ids = [
            NodeId::database(),
            NodeId::l1(0),
            NodeId::l2(0),
            NodeId::client(0),
            NodeId::l1(1),
        ];
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                assert_ne!(a.as_u64(), b.as_u64(), "{a} vs {b}");
            }
        }
    }
}
