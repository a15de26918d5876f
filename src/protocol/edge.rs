//! ADD_EDGE and DEL_EDGE: flooded topology announcements.
//!
//! Wire forms:
//!   `10 <from> <to> <address> <port> <options:hex> <weight> <session_id>`
//!   `11 <from> <to> <session_id>`
//!
//! The session id stamped on each announcement is the tie-break that lets
//! the mesh converge after a node restart: a stored edge with a strictly
//! greater session id wins; an equal one means the announcement is already
//! reflected; a strictly smaller one is stale and gets replaced.

use tracing::{debug, warn};

use crate::connection::ConnId;
use crate::edge::{Address, Edge, EdgeId};
use crate::graph;
use crate::mesh::Mesh;
use crate::protocol::{
    check_id, forward_request, seen_request, send_request, ProtocolError, Request,
};

/// Renders an ADD_EDGE line for an edge currently in the store.
pub(crate) fn format_add_edge(mesh: &Mesh, id: EdgeId) -> Option<String> {
    let edge = mesh.edge(id)?;
    Some(format!(
        "{} {} {} {} {} {:x} {} {}",
        Request::AddEdge.number(),
        mesh.node(edge.from).name,
        mesh.node(edge.to).name,
        edge.address.host,
        edge.address.port,
        edge.options,
        edge.weight,
        edge.session_id,
    ))
}

/// Broadcasts removal of a stored edge. Called before the edge is deleted.
pub(crate) fn announce_del_edge(
    mesh: &mut Mesh,
    submesh: Option<&str>,
    id: EdgeId,
) -> Result<(), ProtocolError> {
    let Some(edge) = mesh.edge(id) else {
        return Ok(());
    };
    let line = format!(
        "{} {} {} {}",
        Request::DelEdge.number(),
        mesh.node(edge.from).name,
        mesh.node(edge.to).name,
        edge.session_id,
    );
    send_request(mesh, None, submesh, line)
}

pub(crate) fn add_edge_h(mesh: &mut Mesh, id: ConnId, line: &str) -> Result<(), ProtocolError> {
    if seen_request(mesh, line) {
        return Ok(());
    }

    let mut fields = line.split_whitespace();
    fields.next();
    let from = fields.next().ok_or(ProtocolError::Malformed("ADD_EDGE"))?;
    let to = fields.next().ok_or(ProtocolError::Malformed("ADD_EDGE"))?;
    let host = fields.next().ok_or(ProtocolError::Malformed("ADD_EDGE"))?;
    let port: u16 = fields
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or(ProtocolError::Malformed("ADD_EDGE"))?;
    let options = fields
        .next()
        .and_then(|t| u32::from_str_radix(t, 16).ok())
        .ok_or(ProtocolError::Malformed("ADD_EDGE"))?;
    let weight: u32 = fields
        .next()
        .and_then(|t| t.parse().ok())
        .filter(|&w| w > 0)
        .ok_or(ProtocolError::Malformed("ADD_EDGE"))?;
    let session_id: u32 = fields
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or(ProtocolError::Malformed("ADD_EDGE"))?;

    if !check_id(from) || !check_id(to) {
        return Err(ProtocolError::InvalidName);
    }
    if from == mesh.name {
        // we are authoritative for our own edges
        debug!("ignoring announcement of our own edge {} -> {}", from, to);
        return Ok(());
    }

    if let Some(eid) = mesh.lookup_edge_id(from, to) {
        let stored = mesh.edge(eid).map(|e| e.session_id).unwrap_or(0);
        if stored >= session_id {
            debug!(
                "ignoring edge {} -> {} with old session id {}",
                from, to, session_id
            );
            return Ok(());
        }
        // stale entry, the announcement replaces it
        mesh.del_edge_record(eid);
    }

    let from_id = mesh.get_or_create_node(from);
    let to_id = mesh.get_or_create_node(to);
    mesh.add_edge_record(Edge {
        from: from_id,
        to: to_id,
        address: Address {
            host: host.to_string(),
            port,
        },
        options,
        weight,
        session_id,
        reverse: None,
        connection: None,
    });
    if mesh.node(from_id).session_id < session_id {
        mesh.node_mut(from_id).session_id = session_id;
    }
    graph::recalculate(mesh);

    forward_request(mesh, id, None, line);
    Ok(())
}

pub(crate) fn del_edge_h(mesh: &mut Mesh, id: ConnId, line: &str) -> Result<(), ProtocolError> {
    if seen_request(mesh, line) {
        return Ok(());
    }

    let mut fields = line.split_whitespace();
    fields.next();
    let from = fields.next().ok_or(ProtocolError::Malformed("DEL_EDGE"))?;
    let to = fields.next().ok_or(ProtocolError::Malformed("DEL_EDGE"))?;
    let session_id: u32 = fields
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or(ProtocolError::Malformed("DEL_EDGE"))?;

    if !check_id(from) || !check_id(to) {
        return Err(ProtocolError::InvalidName);
    }
    if from == mesh.name {
        warn!("got DEL_EDGE for our own edge {} -> {}", from, to);
        return Ok(());
    }

    let Some(eid) = mesh.lookup_edge_id(from, to) else {
        debug!("edge {} -> {} is not in the edge tree", from, to);
        return Ok(());
    };
    let stored = mesh.edge(eid).map(|e| e.session_id).unwrap_or(0);
    if stored > session_id {
        debug!(
            "ignoring removal of edge {} -> {} with old session id {}",
            from, to, session_id
        );
        return Ok(());
    }

    mesh.del_edge_record(eid);
    graph::recalculate(mesh);

    forward_request(mesh, id, None, line);
    Ok(())
}
