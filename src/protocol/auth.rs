//! ID and ACK: the meta-connection handshake.
//!
//! Both sides send ID as soon as the connection is wired. A valid ID
//! attaches the peer node, starts the session (the transport initiator
//! initiates the key exchange) and answers with ACK through it. A valid
//! ACK opens the connection, adds our side of the edge pair and floods it.

use tracing::{error, info};

use crate::connection::{ConnId, ConnectionState};
use crate::edge::{Address, Edge};
use crate::event::TimeSpec;
use crate::graph;
use crate::mesh::{conn_timer, Mesh, PING_INTERVAL_SECS};
use crate::node::DeviceClass;
use crate::protocol::{check_id, edge, send_request, AllowRequest, ProtocolError, Request};
use crate::sptps::Session;

/// Bumped on breaking meta-protocol changes; peers must match exactly.
pub const PROTOCOL_MAJOR: u32 = 17;

/// Label binding session keys to the meta connection.
const SPTPS_LABEL: &[u8] = b"meshlink meta";

pub(crate) fn send_id(mesh: &mut Mesh, id: ConnId) -> Result<(), ProtocolError> {
    let line = format!("{} {} {}", Request::Id.number(), mesh.name, PROTOCOL_MAJOR);
    send_request(mesh, Some(id), None, line)?;
    let conn = mesh.conn_mut(id).ok_or(ProtocolError::NoConnection)?;
    conn.state = ConnectionState::WaitId;
    conn.allow_request = AllowRequest::Only(Request::Id);
    Ok(())
}

pub(crate) fn id_h(mesh: &mut Mesh, id: ConnId, line: &str) -> Result<(), ProtocolError> {
    let mut fields = line.split_whitespace();
    fields.next();
    let name = fields.next().ok_or(ProtocolError::Malformed("ID"))?;
    let version: u32 = fields
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or(ProtocolError::Malformed("ID"))?;

    if !check_id(name) {
        error!("peer sent invalid name: {}", name);
        return Err(ProtocolError::InvalidName);
    }
    if version != PROTOCOL_MAJOR {
        return Err(ProtocolError::VersionMismatch(version));
    }

    let Some(nid) = mesh.node_id(name) else {
        return Err(ProtocolError::UnknownPeer(name.to_string()));
    };
    let (peer_key, already_connected) = {
        let node = mesh.node(nid);
        (node.public_key, node.connection.is_some())
    };
    let Some(peer_key) = peer_key else {
        return Err(ProtocolError::UnknownPeer(name.to_string()));
    };
    if already_connected {
        return Err(ProtocolError::DuplicateConnection(name.to_string()));
    }

    let keypair = mesh.keypair.clone();
    {
        let conn = mesh.conn_mut(id).ok_or(ProtocolError::NoConnection)?;
        conn.name = Some(name.to_string());
        conn.node = Some(nid);
        let initiator = conn.outgoing;
        conn.session = Some(Session::new(keypair, peer_key, initiator, SPTPS_LABEL));
        conn.pump_session();
        conn.state = ConnectionState::WaitAck;
        conn.allow_request = AllowRequest::Only(Request::Ack);
    }

    // the ACK travels through the session and implicitly confirms it
    send_ack(mesh, id)
}

fn send_ack(mesh: &mut Mesh, id: ConnId) -> Result<(), ProtocolError> {
    let line = format!(
        "{} {} {} {:x}",
        Request::Ack.number(),
        mesh.port,
        mesh.dev_class as u8,
        0u32
    );
    send_request(mesh, Some(id), None, line)
}

pub(crate) fn ack_h(mesh: &mut Mesh, id: ConnId, line: &str) -> Result<(), ProtocolError> {
    let mut fields = line.split_whitespace();
    fields.next();
    let port: u16 = fields
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or(ProtocolError::Malformed("ACK"))?;
    let dev_class = fields
        .next()
        .and_then(|t| t.parse().ok())
        .and_then(DeviceClass::from_number)
        .ok_or(ProtocolError::Malformed("ACK"))?;
    let options = fields
        .next()
        .and_then(|t| u32::from_str_radix(t, 16).ok())
        .ok_or(ProtocolError::Malformed("ACK"))?;

    let (nid, peer_host) = {
        let conn = mesh.conn_mut(id).ok_or(ProtocolError::NoConnection)?;
        let nid = conn.node.ok_or(ProtocolError::Malformed("ACK"))?;
        conn.state = ConnectionState::Open;
        conn.allow_request = AllowRequest::All;
        conn.pinged = false;
        (nid, conn.peer_address.host.clone())
    };

    {
        let node = mesh.node_mut(nid);
        node.dev_class = dev_class;
        node.connection = Some(id);
    }
    info!("connection with {} activated", mesh.node(nid).name);

    // bring the new peer up to date before announcing it
    let known: Vec<String> = mesh
        .edge_index
        .iter()
        .filter_map(|(_, &eid)| edge::format_add_edge(mesh, eid))
        .collect();
    for line in known {
        send_request(mesh, Some(id), None, line)?;
    }

    let eid = mesh.add_edge_record(Edge {
        from: mesh.self_node,
        to: nid,
        address: Address {
            host: peer_host,
            port,
        },
        options,
        weight: dev_class.edge_weight(),
        session_id: mesh.session_id,
        reverse: None,
        connection: Some(id),
    });
    if let Some(conn) = mesh.conn_mut(id) {
        conn.edge = Some(eid);
    }
    graph::recalculate(mesh);

    if let Some(line) = edge::format_add_edge(mesh, eid) {
        send_request(mesh, None, None, line)?;
    }

    mesh.event_loop
        .timeout_add(conn_timer(id), TimeSpec::new(PING_INTERVAL_SECS, 0));
    Ok(())
}
