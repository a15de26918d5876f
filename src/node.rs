//! Named mesh participants.
//!
//! Nodes are created on first mention (an edge announcement or an explicit
//! import) and never destroyed at runtime. They live in the mesh's node
//! arena; `NodeId` handles are stable for the life of the mesh.

use crate::connection::ConnId;
use crate::crypto::PublicKey;
use crate::edge::EdgeId;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeId(pub u32);

/// Rough hardware class of a node, announced in ACK. Determines the weight
/// of edges leading to it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum DeviceClass {
    Backbone = 0,
    Stationary = 1,
    Portable = 2,
    Unknown = 3,
}

impl DeviceClass {
    pub fn edge_weight(self) -> u32 {
        match self {
            DeviceClass::Backbone => 1,
            DeviceClass::Stationary => 3,
            DeviceClass::Portable => 6,
            DeviceClass::Unknown => 9,
        }
    }

    pub fn from_number(n: u32) -> Option<DeviceClass> {
        match n {
            0 => Some(DeviceClass::Backbone),
            1 => Some(DeviceClass::Stationary),
            2 => Some(DeviceClass::Portable),
            3 => Some(DeviceClass::Unknown),
            _ => None,
        }
    }
}

pub struct Node {
    pub name: String,
    /// Long-lived signature key, once known.
    pub public_key: Option<PublicKey>,
    pub dev_class: DeviceClass,
    /// Bumped by the node every time it restarts; tie-break for edge
    /// announcements.
    pub session_id: u32,
    /// Submesh membership; `None` for core nodes.
    pub submesh: Option<String>,
    pub reachable: bool,
    /// Whether `key_material` is current.
    pub valid_key: bool,
    pub key_material: Option<Vec<u8>>,
    /// Live meta-connection to this node, if any.
    pub connection: Option<ConnId>,
    /// First hop on the path toward this node.
    pub nexthop: Option<NodeId>,
    /// Edges announced by this node.
    pub edges: Vec<EdgeId>,
}

impl Node {
    pub fn new(name: String) -> Self {
        Node {
            name,
            public_key: None,
            dev_class: DeviceClass::Unknown,
            session_id: 0,
            submesh: None,
            reachable: false,
            valid_key: false,
            key_material: None,
            connection: None,
            nexthop: None,
            edges: Vec::new(),
        }
    }
}
