//! The mesh handle.
//!
//! One opaque value owns every piece of mutable state: the node arena and
//! name index, the edge arena and pair index, the connection arena, the
//! past-request cache and its timer, the mesh-local PRNG and the boxed
//! event loop. There is no process-wide state; everything is threaded
//! through `&mut Mesh`, and all mutation happens on the event-loop thread.

use rand::rngs::OsRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::io;
use tracing::{debug, info, warn};

use crate::connection::{ConnId, Connection, ConnectionState};
use crate::crypto::{Keypair, PublicKey};
use crate::edge::{Address, Edge, EdgeId};
use crate::event::{EventLoop, Interest, IoToken, TimeSpec, TimerToken, Transport, NSEC_PER_SEC};
use crate::graph;
use crate::node::{DeviceClass, Node, NodeId};
use crate::protocol::{self, ProtocolError};
use crate::splay::SplayMap;

/// Timer that ages the past-request cache.
pub const TIMER_PAST_REQUESTS: TimerToken = TimerToken(0);

/// Keepalive interval for OPEN connections.
pub const PING_INTERVAL_SECS: u64 = 60;

const CONN_TIMER_BASE: u32 = 1;

pub(crate) fn conn_timer(id: ConnId) -> TimerToken {
    TimerToken(CONN_TIMER_BASE + id.0)
}

/// Slot arena with a free list. Handles stay stable across removals of
/// other entries.
pub(crate) struct Arena<T> {
    slots: Vec<Option<T>>,
    free: Vec<u32>,
}

impl<T> Arena<T> {
    fn new() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, item: T) -> u32 {
        match self.free.pop() {
            Some(id) => {
                self.slots[id as usize] = Some(item);
                id
            }
            None => {
                self.slots.push(Some(item));
                (self.slots.len() - 1) as u32
            }
        }
    }

    pub(crate) fn remove(&mut self, id: u32) -> Option<T> {
        let item = self.slots.get_mut(id as usize)?.take();
        if item.is_some() {
            self.free.push(id);
        }
        item
    }

    pub(crate) fn get(&self, id: u32) -> Option<&T> {
        self.slots.get(id as usize)?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.slots.get_mut(id as usize)?.as_mut()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|item| (i as u32, item)))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|item| (i as u32, item)))
    }
}

/// Bootstrap parameters for a mesh handle. On-disk storage of these is the
/// façade's business.
pub struct MeshConfig {
    pub name: String,
    pub keypair: Keypair,
    pub dev_class: DeviceClass,
    /// Port peers should connect back to; announced in ACK.
    pub port: u16,
}

pub struct Mesh {
    pub(crate) name: String,
    pub(crate) keypair: Keypair,
    pub(crate) dev_class: DeviceClass,
    pub(crate) port: u16,
    /// Bumped on every restart; stamps our edge announcements.
    pub(crate) session_id: u32,
    pub(crate) self_node: NodeId,
    /// Current payload key material, served via ANS_KEY.
    pub(crate) payload_key: [u8; 32],
    pub(crate) event_loop: Box<dyn EventLoop>,
    pub(crate) nodes: Vec<Node>,
    pub(crate) node_index: SplayMap<String, NodeId>,
    pub(crate) edges: Arena<Edge>,
    pub(crate) edge_index: SplayMap<(String, String), EdgeId>,
    pub(crate) connections: Arena<Connection>,
    /// Exact request bytes -> second first seen.
    pub(crate) past_requests: SplayMap<String, u64>,
    /// Non-cryptographic stream for timer jitter and salts.
    pub(crate) prng: ChaCha8Rng,
}

impl Mesh {
    pub fn new(config: MeshConfig, mut event_loop: Box<dyn EventLoop>) -> Result<Self, ProtocolError> {
        if !protocol::check_id(&config.name) {
            return Err(ProtocolError::InvalidName);
        }

        let mut prng = ChaCha8Rng::from_rng(OsRng).expect("OS randomness");
        let session_id = prng.next_u32();
        let mut payload_key = [0u8; 32];
        OsRng.fill_bytes(&mut payload_key);

        // register the aging timer unarmed; seen_request arms it
        event_loop.timeout_add(TIMER_PAST_REQUESTS, TimeSpec::ZERO);

        let mut node = Node::new(config.name.clone());
        node.public_key = Some(config.keypair.public());
        node.dev_class = config.dev_class;
        node.session_id = session_id;
        node.reachable = true;
        let self_node = NodeId(0);
        node.nexthop = Some(self_node);

        let mut node_index = SplayMap::new();
        node_index.insert(config.name.clone(), self_node);

        info!(
            "mesh {} up, session id {:x}, key {}",
            config.name,
            session_id,
            config.keypair.public().fingerprint()
        );

        Ok(Mesh {
            name: config.name,
            keypair: config.keypair,
            dev_class: config.dev_class,
            port: config.port,
            session_id,
            self_node,
            payload_key,
            event_loop,
            nodes: vec![node],
            node_index,
            edges: Arena::new(),
            edge_index: SplayMap::new(),
            connections: Arena::new(),
            past_requests: SplayMap::new(),
            prng,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub(crate) fn timer_jitter(&mut self) -> u32 {
        self.prng.gen_range(0..NSEC_PER_SEC)
    }

    // ------------------------------------------------------------------
    // nodes
    // ------------------------------------------------------------------

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.node_index.get(name).copied()
    }

    pub fn lookup_node(&self, name: &str) -> Option<&Node> {
        self.node_id(name).map(|id| self.node(id))
    }

    pub fn local_node(&self) -> &Node {
        self.node(self.self_node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.node_index.iter().map(|(_, &id)| self.node(id))
    }

    pub fn node_count(&self) -> usize {
        self.node_index.len()
    }

    /// Nodes are created on first mention and never destroyed.
    pub(crate) fn get_or_create_node(&mut self, name: &str) -> NodeId {
        if let Some(&id) = self.node_index.get(name) {
            return id;
        }
        let id = NodeId(self.nodes.len() as u32);
        debug!("creating node {}", name);
        self.nodes.push(Node::new(name.to_string()));
        self.node_index.insert(name.to_string(), id);
        id
    }

    /// Imports a peer identity: creates the node on first mention and
    /// attaches its long-lived public key.
    pub fn add_known_node(
        &mut self,
        name: &str,
        key: PublicKey,
        dev_class: DeviceClass,
    ) -> Result<NodeId, ProtocolError> {
        if !protocol::check_id(name) {
            return Err(ProtocolError::InvalidName);
        }
        let id = self.get_or_create_node(name);
        let node = self.node_mut(id);
        node.public_key = Some(key);
        node.dev_class = dev_class;
        Ok(id)
    }

    /// Assigns a node to a named submesh, restricting which broadcasts
    /// reach it.
    pub fn set_submesh(&mut self, name: &str, submesh: Option<&str>) -> Result<(), ProtocolError> {
        let id = self
            .node_id(name)
            .ok_or_else(|| ProtocolError::UnknownPeer(name.to_string()))?;
        self.node_mut(id).submesh = submesh.map(str::to_string);
        Ok(())
    }

    // ------------------------------------------------------------------
    // edges
    // ------------------------------------------------------------------

    pub(crate) fn add_edge_record(&mut self, edge: Edge) -> EdgeId {
        let from_name = self.node(edge.from).name.clone();
        let to_name = self.node(edge.to).name.clone();
        let from = edge.from;
        let id = EdgeId(self.edges.insert(edge));
        self.edge_index
            .insert((from_name.clone(), to_name.clone()), id);
        self.nodes[from.0 as usize].edges.push(id);

        if let Some(&rid) = self.edge_index.get(&(to_name.clone(), from_name.clone())) {
            if let Some(rev) = self.edges.get_mut(rid.0) {
                rev.reverse = Some(id);
            }
            if let Some(e) = self.edges.get_mut(id.0) {
                e.reverse = Some(rid);
            }
        }
        debug!("adding edge {} -> {}", from_name, to_name);
        id
    }

    pub(crate) fn del_edge_record(&mut self, id: EdgeId) {
        let Some(edge) = self.edges.remove(id.0) else {
            return;
        };
        if let Some(rid) = edge.reverse {
            if let Some(rev) = self.edges.get_mut(rid.0) {
                rev.reverse = None;
            }
        }
        if let Some(cid) = edge.connection {
            if let Some(conn) = self.connections.get_mut(cid.0) {
                conn.edge = None;
            }
        }
        let from_name = self.node(edge.from).name.clone();
        let to_name = self.node(edge.to).name.clone();
        self.nodes[edge.from.0 as usize].edges.retain(|&e| e != id);
        self.edge_index.remove(&(from_name.clone(), to_name.clone()));
        debug!("removing edge {} -> {}", from_name, to_name);
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(id.0)
    }

    pub fn lookup_edge(&self, from: &str, to: &str) -> Option<&Edge> {
        let &id = self.edge_index.get(&(from.to_string(), to.to_string()))?;
        self.edges.get(id.0)
    }

    pub(crate) fn lookup_edge_id(&self, from: &str, to: &str) -> Option<EdgeId> {
        self.edge_index
            .get(&(from.to_string(), to.to_string()))
            .copied()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_index.len()
    }

    /// OPEN connection of the first hop toward `name`, if the node is
    /// reachable.
    pub fn next_hop(&self, name: &str) -> Option<ConnId> {
        let id = self.node_id(name)?;
        graph::next_hop(self, id)
    }

    // ------------------------------------------------------------------
    // connections
    // ------------------------------------------------------------------

    /// Wires a fresh transport peering to the event loop and sends our ID.
    pub fn add_connection(
        &mut self,
        transport: Box<dyn Transport>,
        outgoing: bool,
        peer_address: Address,
    ) -> Result<ConnId, ProtocolError> {
        let conn = Connection::new(transport, outgoing, peer_address);
        let id = ConnId(self.connections.insert(conn));
        self.event_loop.io_add(IoToken(id.0), Interest::READ);
        if let Some(conn) = self.connections.get_mut(id.0) {
            conn.io_registered = true;
            info!(
                "new {} connection with {}",
                if outgoing { "outgoing" } else { "incoming" },
                conn.peer_address
            );
        }
        if let Err(e) = protocol::auth::send_id(self, id) {
            self.terminate_connection(id, &e);
            return Err(e);
        }
        Ok(id)
    }

    pub fn get_connection(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(id.0)
    }

    pub(crate) fn conn_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.connections.get_mut(id.0)
    }

    pub fn connections(&self) -> impl Iterator<Item = (ConnId, &Connection)> {
        self.connections.iter().map(|(i, c)| (ConnId(i), c))
    }

    /// Readiness callback from the event loop.
    pub fn io_ready(&mut self, token: IoToken, readable: bool, writable: bool) {
        let id = ConnId(token.0);
        if self.connections.get(id.0).is_none() {
            return;
        }
        if readable {
            if let Err(e) = self.conn_read(id) {
                self.terminate_connection(id, &e);
                return;
            }
        }
        if writable {
            if let Err(e) = self.conn_flush(id) {
                self.terminate_connection(id, &e);
            }
        }
    }

    /// Timer callback from the event loop.
    pub fn timer_fired(&mut self, token: TimerToken) {
        if token == TIMER_PAST_REQUESTS {
            protocol::age_past_requests(self);
            return;
        }
        let id = ConnId(token.0 - CONN_TIMER_BASE);
        let Some(conn) = self.connections.get(id.0) else {
            return;
        };
        if conn.state != ConnectionState::Open {
            return;
        }
        if conn.pinged {
            // no PONG since the last interval
            self.terminate_connection(id, &ProtocolError::Timeout);
            return;
        }
        if let Err(e) = protocol::misc::send_ping(self, id) {
            self.terminate_connection(id, &e);
            return;
        }
        self.event_loop
            .timeout_set(conn_timer(id), TimeSpec::new(PING_INTERVAL_SECS, 0));
    }

    fn conn_read(&mut self, id: ConnId) -> Result<(), ProtocolError> {
        loop {
            let mut buf = [0u8; 4096];
            let n = {
                let conn = self.conn_mut(id).ok_or(ProtocolError::NoConnection)?;
                match conn.transport.recv(&mut buf) {
                    Ok(0) => {
                        let partial = !conn.inbuf.is_empty()
                            || conn
                                .session
                                .as_ref()
                                .is_some_and(|s| s.has_partial_record());
                        return Err(if partial {
                            ProtocolError::TruncatedRecord
                        } else {
                            ProtocolError::PeerClosed
                        });
                    }
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(ProtocolError::Io(e)),
                }
            };
            self.conn_ingest(id, &buf[..n])?;
            if self.connections.get(id.0).is_none() {
                return Ok(());
            }
        }
        self.conn_flush(id)
    }

    /// Feeds raw transport bytes through the session once one exists and
    /// dispatches complete request lines one at a time. When the ID
    /// handler starts the session mid-buffer, the remaining bytes belong
    /// to the record stream and are replayed into it.
    fn conn_ingest(&mut self, id: ConnId, chunk: &[u8]) -> Result<(), ProtocolError> {
        let mut pending = chunk.to_vec();
        'staging: loop {
            {
                let conn = self.conn_mut(id).ok_or(ProtocolError::NoConnection)?;
                if let Some(session) = conn.session.as_mut() {
                    let mut app = Vec::new();
                    session.receive_data(&pending, &mut app)?;
                    for payload in app {
                        conn.inbuf.extend_from_slice(&payload);
                    }
                    conn.pump_session();
                } else {
                    conn.inbuf.extend_from_slice(&pending);
                }
            }
            loop {
                let (line, had_session) = {
                    let conn = self.conn_mut(id).ok_or(ProtocolError::NoConnection)?;
                    (conn.extract_line()?, conn.session.is_some())
                };
                let Some(line) = line else {
                    return Ok(());
                };
                protocol::receive_request(self, id, &line)?;
                let Some(conn) = self.conn_mut(id) else {
                    return Ok(());
                };
                if !had_session && conn.session.is_some() && !conn.inbuf.is_empty() {
                    pending = std::mem::take(&mut conn.inbuf);
                    continue 'staging;
                }
            }
        }
    }

    fn conn_flush(&mut self, id: ConnId) -> Result<(), ProtocolError> {
        let pending = {
            let conn = self.conn_mut(id).ok_or(ProtocolError::NoConnection)?;
            conn.pump_session();
            while !conn.outbuf.is_empty() {
                match conn.transport.send(&conn.outbuf) {
                    Ok(0) => return Err(ProtocolError::PeerClosed),
                    Ok(n) => {
                        conn.outbuf.drain(..n);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(ProtocolError::Io(e)),
                }
            }
            !conn.outbuf.is_empty()
        };
        let interest = if pending {
            Interest::READ_WRITE
        } else {
            Interest::READ
        };
        self.event_loop.io_set(IoToken(id.0), interest);
        Ok(())
    }

    /// Appends a rendered request to one connection, through its session
    /// once one exists.
    pub(crate) fn send_meta(&mut self, id: ConnId, data: &[u8]) -> Result<(), ProtocolError> {
        {
            let conn = self.conn_mut(id).ok_or(ProtocolError::NoConnection)?;
            match conn.session.as_mut() {
                Some(session) => {
                    session.send_record(data)?;
                    conn.pump_session();
                }
                None => conn.outbuf.extend_from_slice(data),
            }
        }
        self.conn_flush(id)
    }

    /// Sends to every OPEN connection except `from`, optionally restricted
    /// to peers of one submesh (core nodes receive everything).
    pub(crate) fn broadcast_meta(&mut self, from: Option<ConnId>, submesh: Option<&str>, data: &[u8]) {
        let targets: Vec<ConnId> = self
            .connections
            .iter()
            .filter_map(|(i, conn)| {
                let id = ConnId(i);
                if Some(id) == from || conn.state != ConnectionState::Open {
                    return None;
                }
                if let Some(wanted) = submesh {
                    let member = conn
                        .node
                        .and_then(|nid| self.nodes[nid.0 as usize].submesh.as_deref());
                    if member.is_some_and(|m| m != wanted) {
                        return None;
                    }
                }
                Some(id)
            })
            .collect();
        for id in targets {
            if let Err(e) = self.send_meta(id, data) {
                warn!("broadcast failed: {}", e);
                self.terminate_connection(id, &e);
            }
        }
    }

    /// Sends TERMREQ and tears the connection down.
    pub fn close_connection(&mut self, id: ConnId) {
        let _ = protocol::misc::send_termreq(self, id);
        self.terminate_connection(id, &ProtocolError::TermReq);
    }

    /// Destroys a connection: session and buffers dropped, the event-loop
    /// registration removed before the slot is freed, the node and edge
    /// back-references cleared. If the connection was OPEN, our side of the
    /// edge pair is revoked and the revocation broadcast.
    pub fn terminate_connection(&mut self, id: ConnId, cause: &ProtocolError) {
        let Some(mut conn) = self.connections.remove(id.0) else {
            return;
        };
        info!(
            "closing connection with {} ({}): {}",
            conn.log_name(),
            conn.peer_address,
            cause
        );
        if conn.io_registered {
            self.event_loop.io_del(IoToken(id.0));
            conn.io_registered = false;
        }
        self.event_loop.timeout_del(conn_timer(id));
        conn.transport.close();
        conn.session = None;
        conn.inbuf.clear();
        conn.outbuf.clear();
        let was_open = conn.state == ConnectionState::Open;
        conn.state = ConnectionState::Dead;

        if let Some(nid) = conn.node {
            let node = self.node_mut(nid);
            if node.connection == Some(id) {
                node.connection = None;
            }
        }
        if let Some(eid) = conn.edge {
            if let Some(edge) = self.edges.get_mut(eid.0) {
                edge.connection = None;
            }
            if was_open {
                if let Err(e) = protocol::edge::announce_del_edge(self, None, eid) {
                    warn!("failed to announce edge removal: {}", e);
                }
                self.del_edge_record(eid);
                graph::recalculate(self);
            }
        }
    }

    // ------------------------------------------------------------------
    // request layer entry points
    // ------------------------------------------------------------------

    /// Renders and sends one request line: to one connection, or, with a
    /// `conn` of `None` (the "everyone" sentinel), to every OPEN
    /// connection, optionally restricted to a submesh.
    pub fn send_request(
        &mut self,
        conn: Option<ConnId>,
        submesh: Option<&str>,
        line: &str,
    ) -> Result<(), ProtocolError> {
        protocol::send_request(self, conn, submesh, line.to_string())
    }

    /// Re-emits a received broadcast line to every OPEN connection except
    /// the one it arrived on.
    pub fn forward_request(&mut self, from: ConnId, line: &str) {
        protocol::forward_request(self, from, None, line)
    }

    /// Loop-suppression check: records the exact bytes on first sight and
    /// reports whether they were already seen within the aging window.
    pub fn seen_request(&mut self, line: &str) -> bool {
        protocol::seen_request(self, line)
    }

    /// Dispatches one complete request line received on `conn`. On error
    /// the connection transitions to DEAD, exactly as on the I/O path.
    pub fn receive_request(&mut self, conn: ConnId, line: &str) -> Result<(), ProtocolError> {
        match protocol::receive_request(self, conn, line) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.terminate_connection(conn, &e);
                Err(e)
            }
        }
    }

    /// Regenerates the payload key and floods KEY_CHANGED.
    pub fn announce_key_change(&mut self) -> Result<(), ProtocolError> {
        protocol::key::send_key_changed(self)
    }

    /// Requests key material from a named node over the mesh.
    pub fn request_key(&mut self, peer: &str) -> Result<(), ProtocolError> {
        protocol::key::send_req_key(self, peer)
    }

    pub fn past_request_count(&self) -> usize {
        self.past_requests.len()
    }
}

impl Drop for Mesh {
    fn drop(&mut self) {
        for (i, conn) in self.connections.iter_mut() {
            if conn.io_registered {
                self.event_loop.io_del(IoToken(i));
                conn.io_registered = false;
            }
            self.event_loop.timeout_del(TimerToken(CONN_TIMER_BASE + i));
            conn.transport.close();
        }
        self.event_loop.timeout_del(TIMER_PAST_REQUESTS);
    }
}
