//! One reliable-transport peering and its handshake state machine.

use crate::edge::{Address, EdgeId};
use crate::event::Transport;
use crate::node::NodeId;
use crate::protocol::{AllowRequest, ProtocolError, Request, MAXBUFSIZE};
use crate::sptps::Session;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ConnId(pub u32);

/// ```text
///          new
///           │ accept/connect
///           ▼
///       PRE_ID ──send ID──► WAIT_ID ──recv ID──► WAIT_ACK ──recv ACK──► OPEN
///                                                                         │
///                                                                   error/close
///                                                                         ▼
///                                                                        DEAD
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConnectionState {
    PreId,
    WaitId,
    WaitAck,
    Open,
    Dead,
}

pub struct Connection {
    /// Peer name, once the ID request identified it.
    pub name: Option<String>,
    pub state: ConnectionState,
    /// Gate against out-of-order handshake requests.
    pub allow_request: AllowRequest,
    /// We initiated the transport connection; also makes us the session
    /// initiator.
    pub outgoing: bool,
    pub peer_address: Address,
    pub inbuf: Vec<u8>,
    pub outbuf: Vec<u8>,
    pub session: Option<Session>,
    pub node: Option<NodeId>,
    pub edge: Option<EdgeId>,
    pub pinged: bool,
    pub last_ping_time: u64,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) io_registered: bool,
}

impl Connection {
    pub(crate) fn new(transport: Box<dyn Transport>, outgoing: bool, peer_address: Address) -> Self {
        Connection {
            name: None,
            state: ConnectionState::PreId,
            allow_request: AllowRequest::Only(Request::Id),
            outgoing,
            peer_address,
            inbuf: Vec::new(),
            outbuf: Vec::new(),
            session: None,
            node: None,
            edge: None,
            pinged: false,
            last_ping_time: 0,
            transport,
            io_registered: false,
        }
    }

    /// Peer name for log lines, before and after identification.
    pub fn log_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unknown>")
    }

    /// Moves any wire bytes the session produced into the outbound buffer.
    pub(crate) fn pump_session(&mut self) {
        if let Some(session) = self.session.as_mut() {
            let out = session.take_outgoing();
            if !out.is_empty() {
                self.outbuf.extend_from_slice(&out);
            }
        }
    }

    /// Splits one complete `\n`-terminated request line out of `inbuf`.
    /// An unterminated line is left buffered unless it already exceeds
    /// `MAXBUFSIZE`, which is a protocol violation.
    pub(crate) fn extract_line(&mut self) -> Result<Option<String>, ProtocolError> {
        let Some(pos) = self.inbuf.iter().position(|&b| b == b'\n') else {
            if self.inbuf.len() > MAXBUFSIZE {
                return Err(ProtocolError::LineTooLong);
            }
            return Ok(None);
        };
        if pos >= MAXBUFSIZE {
            return Err(ProtocolError::LineTooLong);
        }
        let mut raw: Vec<u8> = self.inbuf.drain(..=pos).collect();
        raw.pop();
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        let line = String::from_utf8(raw).map_err(|_| ProtocolError::BogusData)?;
        Ok(Some(line))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // the event-loop registration must be gone before the slot is freed
        debug_assert!(!self.io_registered, "connection dropped while registered");
    }
}
