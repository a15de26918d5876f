//! Directed, weighted edges between nodes.
//!
//! An edge is an announcement that `from` can reach `to` at `address` for
//! cost `weight`, stamped with the announcer's session id. Edges are owned
//! by the mesh's edge arena and indexed by the `(from_name, to_name)` pair;
//! a matching reverse edge, when present, is cross-linked.

use std::fmt;

use crate::connection::ConnId;
use crate::node::NodeId;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct EdgeId(pub u32);

/// Where the `from` node says it can be reached for this edge.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} port {}", self.host, self.port)
    }
}

pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub address: Address,
    pub options: u32,
    pub weight: u32,
    /// Session id of the `from` node when the edge was announced.
    pub session_id: u32,
    /// Edge in the opposite direction, if present.
    pub reverse: Option<EdgeId>,
    /// Connection associated with this edge, if available.
    pub connection: Option<ConnId>,
}
