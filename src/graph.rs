//! Reachability and first-hop recomputation over the edge graph.
//!
//! Runs after every edge mutation. An edge is only traversed when its
//! reverse edge exists: a one-sided announcement is not a usable path.
//! Routing policy beyond the first hop stays a pure function over the edge
//! graph and can be replaced by the façade.

use std::collections::VecDeque;

use tracing::debug;

use crate::connection::ConnId;
use crate::mesh::Mesh;
use crate::node::NodeId;

/// Breadth-first sweep from the local node: refreshes every node's
/// `reachable` flag and first-hop `nexthop`. Nodes that drop out of reach
/// lose their key state.
pub(crate) fn recalculate(mesh: &mut Mesh) {
    let prev: Vec<bool> = mesh.nodes.iter().map(|n| n.reachable).collect();
    for node in &mut mesh.nodes {
        node.reachable = false;
        node.nexthop = None;
    }

    let start = mesh.self_node;
    {
        let node = mesh.node_mut(start);
        node.reachable = true;
        node.nexthop = Some(start);
    }

    let mut queue = VecDeque::from([start]);
    while let Some(nid) = queue.pop_front() {
        let edge_ids = mesh.node(nid).edges.clone();
        for eid in edge_ids {
            let Some(edge) = mesh.edge(eid) else { continue };
            if edge.reverse.is_none() {
                continue;
            }
            let to = edge.to;
            if mesh.node(to).reachable {
                continue;
            }
            let hop = if nid == start {
                to
            } else {
                mesh.node(nid).nexthop.unwrap_or(to)
            };
            let node = mesh.node_mut(to);
            node.reachable = true;
            node.nexthop = Some(hop);
            queue.push_back(to);
        }
    }

    for (i, node) in mesh.nodes.iter_mut().enumerate() {
        let was = prev.get(i).copied().unwrap_or(false);
        if node.reachable != was {
            debug!(
                "node {} became {}",
                node.name,
                if node.reachable { "reachable" } else { "unreachable" }
            );
        }
        if !node.reachable && node.valid_key {
            node.valid_key = false;
            node.key_material = None;
        }
    }
}

/// OPEN connection of the first hop toward `target`.
pub(crate) fn next_hop(mesh: &Mesh, target: NodeId) -> Option<ConnId> {
    let hop = mesh.node(target).nexthop?;
    if hop == mesh.self_node {
        return None;
    }
    mesh.node(hop).connection
}
