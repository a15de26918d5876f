//! STATUS, ERROR, TERMREQ, PING and PONG.

use tracing::{debug, error, info};

use crate::connection::ConnId;
use crate::mesh::Mesh;
use crate::protocol::{send_request, ProtocolError, Request};

pub(crate) fn status_h(mesh: &mut Mesh, id: ConnId, line: &str) -> Result<(), ProtocolError> {
    let text = line.splitn(2, ' ').nth(1).unwrap_or("");
    let peer = mesh
        .get_connection(id)
        .map(|c| c.log_name().to_string())
        .unwrap_or_default();
    info!("status message from {}: {}", peer, text);
    Ok(())
}

pub(crate) fn error_h(mesh: &mut Mesh, id: ConnId, line: &str) -> Result<(), ProtocolError> {
    let text = line.splitn(2, ' ').nth(1).unwrap_or("");
    let peer = mesh
        .get_connection(id)
        .map(|c| c.log_name().to_string())
        .unwrap_or_default();
    error!("error message from {}: {}", peer, text);
    Err(ProtocolError::RemoteError(text.to_string()))
}

pub(crate) fn termreq_h(mesh: &mut Mesh, id: ConnId, _line: &str) -> Result<(), ProtocolError> {
    let peer = mesh
        .get_connection(id)
        .map(|c| c.log_name().to_string())
        .unwrap_or_default();
    debug!("termination request from {}", peer);
    Err(ProtocolError::TermReq)
}

pub(crate) fn ping_h(mesh: &mut Mesh, id: ConnId, _line: &str) -> Result<(), ProtocolError> {
    send_pong(mesh, id)
}

pub(crate) fn pong_h(mesh: &mut Mesh, id: ConnId, _line: &str) -> Result<(), ProtocolError> {
    let conn = mesh.conn_mut(id).ok_or(ProtocolError::NoConnection)?;
    conn.pinged = false;
    Ok(())
}

pub(crate) fn send_ping(mesh: &mut Mesh, id: ConnId) -> Result<(), ProtocolError> {
    let now = mesh.event_loop.now().sec;
    let conn = mesh.conn_mut(id).ok_or(ProtocolError::NoConnection)?;
    conn.pinged = true;
    conn.last_ping_time = now;
    send_request(mesh, Some(id), None, format!("{}", Request::Ping.number()))
}

fn send_pong(mesh: &mut Mesh, id: ConnId) -> Result<(), ProtocolError> {
    send_request(mesh, Some(id), None, format!("{}", Request::Pong.number()))
}

pub(crate) fn send_termreq(mesh: &mut Mesh, id: ConnId) -> Result<(), ProtocolError> {
    send_request(
        mesh,
        Some(id),
        None,
        format!("{}", Request::TermReq.number()),
    )
}
