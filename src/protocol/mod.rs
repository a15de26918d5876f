//! The line-oriented meta-protocol: request taxonomy, dispatch,
//! authorization gating, flooding and loop suppression.
//!
//! Every request is a single `\n`-terminated ASCII line whose first
//! whitespace-separated field is the decimal request number. Handlers that
//! fail cause exactly the offending connection to be torn down; the mesh as
//! a whole continues.

pub(crate) mod auth;
pub(crate) mod edge;
pub(crate) mod key;
pub(crate) mod misc;

use std::io;

use thiserror::Error;
use tracing::{debug, error};

use crate::connection::ConnId;
use crate::event::TimeSpec;
use crate::mesh::{Mesh, TIMER_PAST_REQUESTS};
use crate::sptps::SessionError;

/// Ceiling on a rendered request line including its newline.
pub const MAXBUFSIZE: usize = 16 * 1024;

/// Seconds a past-request entry suppresses re-flooding.
pub(crate) const REQUEST_TIMEOUT_SECS: u64 = 60;
/// Aging sweep interval; fuzzed by up to a second of jitter.
pub(crate) const REQUEST_AGE_SECS: u64 = 10;

/// The closed request set, numbered 0..11 on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Request {
    Id = 0,
    Ack = 1,
    Status = 2,
    Error = 3,
    TermReq = 4,
    Ping = 5,
    Pong = 6,
    KeyChanged = 7,
    ReqKey = 8,
    AnsKey = 9,
    AddEdge = 10,
    DelEdge = 11,
}

impl Request {
    pub fn number(self) -> u32 {
        self as u32
    }

    pub fn from_number(n: u32) -> Option<Request> {
        match n {
            0 => Some(Request::Id),
            1 => Some(Request::Ack),
            2 => Some(Request::Status),
            3 => Some(Request::Error),
            4 => Some(Request::TermReq),
            5 => Some(Request::Ping),
            6 => Some(Request::Pong),
            7 => Some(Request::KeyChanged),
            8 => Some(Request::ReqKey),
            9 => Some(Request::AnsKey),
            10 => Some(Request::AddEdge),
            11 => Some(Request::DelEdge),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Request::Id => "ID",
            Request::Ack => "ACK",
            Request::Status => "STATUS",
            Request::Error => "ERROR",
            Request::TermReq => "TERMREQ",
            Request::Ping => "PING",
            Request::Pong => "PONG",
            Request::KeyChanged => "KEY_CHANGED",
            Request::ReqKey => "REQ_KEY",
            Request::AnsKey => "ANS_KEY",
            Request::AddEdge => "ADD_EDGE",
            Request::DelEdge => "DEL_EDGE",
        }
    }

    /// Flooded to the whole mesh and subject to loop suppression.
    pub fn broadcastable(self) -> bool {
        matches!(
            self,
            Request::AddEdge | Request::DelEdge | Request::KeyChanged
        )
    }
}

/// Authorization mask on a connection: everything, or one specific request
/// while the meta handshake is in flight. ERROR is always let through.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AllowRequest {
    All,
    Only(Request),
}

impl AllowRequest {
    pub fn permits(self, request: Request) -> bool {
        match self {
            AllowRequest::All => true,
            AllowRequest::Only(allowed) => allowed == request || request == Request::Error,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bogus data")]
    BogusData,
    #[error("unknown request {0}")]
    UnknownRequest(u32),
    #[error("unauthorized request {0}")]
    Unauthorized(&'static str),
    #[error("malformed {0} request")]
    Malformed(&'static str),
    #[error("output buffer overflow")]
    Overflow,
    #[error("request line too long")]
    LineTooLong,
    #[error("invalid name")]
    InvalidName,
    #[error("protocol version mismatch, peer speaks {0}")]
    VersionMismatch(u32),
    #[error("no key known for peer {0}")]
    UnknownPeer(String),
    #[error("already connected to {0}")]
    DuplicateConnection(String),
    #[error("no route to {0}")]
    NoRoute(String),
    #[error("no such connection")]
    NoConnection,
    #[error("connection closed by peer")]
    PeerClosed,
    #[error("partial record at connection close")]
    TruncatedRecord,
    #[error("ping timeout")]
    Timeout,
    #[error("termination requested")]
    TermReq,
    #[error("error message from peer: {0}")]
    RemoteError(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Valid node names are 1-63 characters of `[A-Za-z0-9_-]`.
pub fn check_id(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Request name for log lines, from the rendered bytes.
fn request_name_of(line: &str) -> &'static str {
    line.split_whitespace()
        .next()
        .and_then(|t| t.parse().ok())
        .and_then(Request::from_number)
        .map(Request::name)
        .unwrap_or("bogus data")
}

fn peer_name(mesh: &Mesh, id: ConnId) -> String {
    mesh.get_connection(id)
        .map(|c| c.log_name().to_string())
        .unwrap_or_else(|| "<gone>".to_string())
}

/// The single choke point every rendered request passes through. `conn` of
/// `None` is the "everyone" sentinel: the line is broadcast to every OPEN
/// connection, optionally restricted to one submesh.
pub(crate) fn send_request(
    mesh: &mut Mesh,
    conn: Option<ConnId>,
    submesh: Option<&str>,
    mut line: String,
) -> Result<(), ProtocolError> {
    if line.len() + 1 > MAXBUFSIZE {
        error!(
            "output buffer overflow while sending request to {}",
            conn.map(|id| peer_name(mesh, id))
                .unwrap_or_else(|| "everyone".to_string())
        );
        return Err(ProtocolError::Overflow);
    }

    debug!(
        "sending {} to {}: {}",
        request_name_of(&line),
        conn.map(|id| peer_name(mesh, id))
            .unwrap_or_else(|| "everyone".to_string()),
        line
    );

    line.push('\n');
    match conn {
        Some(id) => mesh.send_meta(id, line.as_bytes()),
        None => {
            mesh.broadcast_meta(None, submesh, line.as_bytes());
            Ok(())
        }
    }
}

/// Re-emits a received line to every OPEN connection except its origin.
pub(crate) fn forward_request(mesh: &mut Mesh, from: ConnId, submesh: Option<&str>, line: &str) {
    debug!(
        "forwarding {} from {}: {}",
        request_name_of(line),
        peer_name(mesh, from),
        line
    );
    let mut data = Vec::with_capacity(line.len() + 1);
    data.extend_from_slice(line.as_bytes());
    data.push(b'\n');
    mesh.broadcast_meta(Some(from), submesh, &data);
}

/// Parses, authorizes and dispatches one complete request line. An error
/// means the connection must die.
pub(crate) fn receive_request(mesh: &mut Mesh, id: ConnId, line: &str) -> Result<(), ProtocolError> {
    let number: u32 = match line.split_whitespace().next().and_then(|t| t.parse().ok()) {
        Some(n) => n,
        None => {
            error!("bogus data received from {}", peer_name(mesh, id));
            return Err(ProtocolError::BogusData);
        }
    };
    let Some(request) = Request::from_number(number) else {
        debug!("unknown request from {}: {}", peer_name(mesh, id), line);
        return Err(ProtocolError::UnknownRequest(number));
    };

    let allow = mesh
        .get_connection(id)
        .ok_or(ProtocolError::NoConnection)?
        .allow_request;
    if !allow.permits(request) {
        error!("unauthorized request from {}", peer_name(mesh, id));
        return Err(ProtocolError::Unauthorized(request.name()));
    }

    debug!("got {} from {}: {}", request.name(), peer_name(mesh, id), line);

    let result = match request {
        Request::Id => auth::id_h(mesh, id, line),
        Request::Ack => auth::ack_h(mesh, id, line),
        Request::Status => misc::status_h(mesh, id, line),
        Request::Error => misc::error_h(mesh, id, line),
        Request::TermReq => misc::termreq_h(mesh, id, line),
        Request::Ping => misc::ping_h(mesh, id, line),
        Request::Pong => misc::pong_h(mesh, id, line),
        Request::KeyChanged => key::key_changed_h(mesh, id, line),
        Request::ReqKey => key::req_key_h(mesh, id, line),
        Request::AnsKey => key::ans_key_h(mesh, id, line),
        Request::AddEdge => edge::add_edge_h(mesh, id, line),
        Request::DelEdge => edge::del_edge_h(mesh, id, line),
    };

    if let Err(e) = result {
        error!(
            "error while processing {} from {}: {}",
            request.name(),
            peer_name(mesh, id),
            e
        );
        return Err(e);
    }
    Ok(())
}

/// Records the exact request bytes on first sight; true means the line was
/// already seen within the aging window and must not be re-flooded.
pub(crate) fn seen_request(mesh: &mut Mesh, line: &str) -> bool {
    if mesh.past_requests.contains_key(line) {
        debug!("already seen request");
        return true;
    }
    let was_empty = mesh.past_requests.is_empty();
    let now = mesh.event_loop.now().sec;
    mesh.past_requests.insert(line.to_string(), now);
    if was_empty {
        let jitter = mesh.timer_jitter();
        mesh.event_loop
            .timeout_set(TIMER_PAST_REQUESTS, TimeSpec::new(REQUEST_AGE_SECS, jitter));
    }
    false
}

/// Timer body: drops entries past their lifetime and re-arms itself iff
/// any remain.
pub(crate) fn age_past_requests(mesh: &mut Mesh) {
    let now = mesh.event_loop.now().sec;
    let mut deleted = 0usize;
    let mut left = 0usize;
    mesh.past_requests.retain(|_, first_seen| {
        if *first_seen + REQUEST_TIMEOUT_SECS <= now {
            deleted += 1;
            false
        } else {
            left += 1;
            true
        }
    });
    if deleted > 0 || left > 0 {
        debug!("aging past requests: deleted {}, left {}", deleted, left);
    }
    if left > 0 {
        let jitter = mesh.timer_jitter();
        mesh.event_loop
            .timeout_set(TIMER_PAST_REQUESTS, TimeSpec::new(REQUEST_AGE_SECS, jitter));
    }
}
