//! The route record carried by every request and walked back by responses.

use derive_more::Deref;
use serde::{Deserialize, Serialize};

use crate::NodeId;

/// Ordered list of nodes a request traversed from its origin toward the
/// database; the last entry is the most recent hop. A response carries the
/// remaining hops and each node on the way back pops its own tail entry, so a
/// response's hops are always a prefix of the matching request's.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deref, Serialize, Deserialize)]
pub struct Hops(Vec<NodeId>);

impl Hops {
    /// The route of a freshly issued request: just the originator.
    pub fn origin(node: NodeId) -> Self {
        Self(vec![node])
    }

    /// An empty route, used for invalidation copies of a response that fan
    /// out to a subtree rather than walk back to an originator.
    pub fn none() -> Self {
        Self(Vec::new())
    }

    /// Record a forwarding hop.
    pub fn push(&mut self, node: NodeId) {
        self.0.push(node);
    }

    /// Remove and return the most recent hop.
    pub fn pop(&mut self) -> Option<NodeId> {
        self.0.pop()
    }

    /// The most recent hop, i.e. the next recipient of a response.
    pub fn tail(&self) -> Option<NodeId> {
        self.0.last().copied()
    }

    pub fn is_prefix_of(&self, other: &Hops) -> bool {
        self.0.len() <= other.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn response_walk_is_a_prefix_at_every_step() {
        let client = NodeId::client(0);
        let l2 = NodeId::l2(0);
        let l1 = NodeId::l1(0);

        let mut request = Hops::origin(client);
        request.push(l2);
        request.push(l1);

        let mut response = request.clone();
        assert_eq!(response.pop(), Some(l1));
        assert!(response.is_prefix_of(&request));
        assert_eq!(response.pop(), Some(l2));
        assert!(response.is_prefix_of(&request));
        assert_eq!(response.tail(), Some(client));
        assert_eq!(response.pop(), Some(client));
        assert!(response.tail().is_none());
        assert!(response.is_prefix_of(&request));
    }

    #[test]
    fn none_is_a_prefix_of_everything() {
        let request = Hops::origin(NodeId::client(3));
        assert!(Hops::none().is_prefix_of(&request));
    }
}
