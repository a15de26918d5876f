//! KEY_CHANGED, REQ_KEY and ANS_KEY: key material distribution.
//!
//! KEY_CHANGED is flooded so every node drops its cached material for the
//! announcer. REQ_KEY and ANS_KEY are unicast, hop-by-hop along the first
//! hop toward the named destination; the material itself is opaque hex to
//! every node but the two endpoints.

use rand::RngCore;
use tracing::{debug, warn};

use crate::connection::ConnId;
use crate::mesh::Mesh;
use crate::protocol::{
    check_id, forward_request, seen_request, send_request, ProtocolError, Request,
};

/// Regenerates the payload key and floods the change. The hex salt makes
/// every announcement byte-unique for the loop-suppression cache.
pub(crate) fn send_key_changed(mesh: &mut Mesh) -> Result<(), ProtocolError> {
    rand::rngs::OsRng.fill_bytes(&mut mesh.payload_key);
    let salt = mesh.prng.next_u32();
    let line = format!(
        "{} {:x} {}",
        Request::KeyChanged.number(),
        salt,
        mesh.name
    );
    // record our own bytes so a flooded copy cannot bounce back
    seen_request(mesh, &line);
    send_request(mesh, None, None, line)
}

pub(crate) fn key_changed_h(mesh: &mut Mesh, id: ConnId, line: &str) -> Result<(), ProtocolError> {
    if seen_request(mesh, line) {
        return Ok(());
    }

    let mut fields = line.split_whitespace();
    fields.next();
    let _salt = fields
        .next()
        .ok_or(ProtocolError::Malformed("KEY_CHANGED"))?;
    let name = fields
        .next()
        .ok_or(ProtocolError::Malformed("KEY_CHANGED"))?;
    if !check_id(name) {
        return Err(ProtocolError::InvalidName);
    }

    let Some(nid) = mesh.node_id(name) else {
        return Err(ProtocolError::UnknownPeer(name.to_string()));
    };
    {
        let node = mesh.node_mut(nid);
        node.valid_key = false;
        node.key_material = None;
    }
    debug!("invalidated key material for {}", name);

    forward_request(mesh, id, None, line);
    Ok(())
}

pub(crate) fn send_req_key(mesh: &mut Mesh, to: &str) -> Result<(), ProtocolError> {
    let line = format!("{} {} {}", Request::ReqKey.number(), mesh.name, to);
    let conn = mesh
        .next_hop(to)
        .ok_or_else(|| ProtocolError::NoRoute(to.to_string()))?;
    send_request(mesh, Some(conn), None, line)
}

fn send_ans_key(mesh: &mut Mesh, to: &str) -> Result<(), ProtocolError> {
    let line = format!(
        "{} {} {} {}",
        Request::AnsKey.number(),
        mesh.name,
        to,
        hex::encode(mesh.payload_key)
    );
    let conn = mesh
        .next_hop(to)
        .ok_or_else(|| ProtocolError::NoRoute(to.to_string()))?;
    send_request(mesh, Some(conn), None, line)
}

/// Forwards a unicast request toward its destination; drops with a log
/// when no route exists.
fn forward_toward(mesh: &mut Mesh, to: &str, line: &str) -> Result<(), ProtocolError> {
    match mesh.next_hop(to) {
        Some(conn) => send_request(mesh, Some(conn), None, line.to_string()),
        None => {
            warn!("no route to {}, dropping {}", to, line);
            Ok(())
        }
    }
}

pub(crate) fn req_key_h(mesh: &mut Mesh, _id: ConnId, line: &str) -> Result<(), ProtocolError> {
    let mut fields = line.split_whitespace();
    fields.next();
    let from = fields.next().ok_or(ProtocolError::Malformed("REQ_KEY"))?;
    let to = fields.next().ok_or(ProtocolError::Malformed("REQ_KEY"))?;
    if !check_id(from) || !check_id(to) {
        return Err(ProtocolError::InvalidName);
    }
    if mesh.node_id(from).is_none() {
        return Err(ProtocolError::UnknownPeer(from.to_string()));
    }

    if to == mesh.name {
        send_ans_key(mesh, from)
    } else {
        forward_toward(mesh, to, line)
    }
}

pub(crate) fn ans_key_h(mesh: &mut Mesh, _id: ConnId, line: &str) -> Result<(), ProtocolError> {
    let mut fields = line.split_whitespace();
    fields.next();
    let from = fields.next().ok_or(ProtocolError::Malformed("ANS_KEY"))?;
    let to = fields.next().ok_or(ProtocolError::Malformed("ANS_KEY"))?;
    let material = fields.next().ok_or(ProtocolError::Malformed("ANS_KEY"))?;
    if !check_id(from) || !check_id(to) {
        return Err(ProtocolError::InvalidName);
    }

    if to == mesh.name {
        let material = hex::decode(material).map_err(|_| ProtocolError::Malformed("ANS_KEY"))?;
        let Some(nid) = mesh.node_id(from) else {
            return Err(ProtocolError::UnknownPeer(from.to_string()));
        };
        let node = mesh.node_mut(nid);
        node.key_material = Some(material);
        node.valid_key = true;
        debug!("stored key material for {}", from);
        Ok(())
    } else {
        forward_toward(mesh, to, line)
    }
}
