//! Deterministic test harness: a simulated event loop with a manual clock
//! and paired in-memory transports with non-blocking semantics.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::rc::Rc;

use meshlink::{
    Address, ConnId, DeviceClass, EventLoop, Interest, IoToken, Keypair, Mesh, MeshConfig,
    TimeSpec, TimerToken, Transport,
};

#[derive(Default)]
pub struct LoopState {
    pub now: TimeSpec,
    pub io: HashMap<IoToken, Interest>,
    /// timer -> absolute deadline; `None` while registered but unarmed
    pub timers: HashMap<TimerToken, Option<TimeSpec>>,
}

/// Simulated event loop. Clones share state, so a test can keep a handle
/// while the mesh owns the boxed copy.
#[derive(Clone, Default)]
pub struct SimLoop(pub Rc<RefCell<LoopState>>);

impl SimLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, secs: u64) {
        self.0.borrow_mut().now.sec += secs;
    }

    pub fn timer_deadline(&self, timer: TimerToken) -> Option<TimeSpec> {
        self.0.borrow().timers.get(&timer).copied().flatten()
    }

    pub fn timer_registered(&self, timer: TimerToken) -> bool {
        self.0.borrow().timers.contains_key(&timer)
    }

    pub fn io_registered(&self, io: IoToken) -> bool {
        self.0.borrow().io.contains_key(&io)
    }

    /// Fires every due timer once, disarming it first; the callee re-arms
    /// if it wants to keep running.
    pub fn fire_due(&self, mesh: &mut Mesh) {
        let now = self.0.borrow().now;
        let due: Vec<TimerToken> = self
            .0
            .borrow()
            .timers
            .iter()
            .filter_map(|(&t, &deadline)| match deadline {
                Some(d) if d <= now => Some(t),
                _ => None,
            })
            .collect();
        for timer in due {
            self.0.borrow_mut().timers.insert(timer, None);
            mesh.timer_fired(timer);
        }
    }
}

impl EventLoop for SimLoop {
    fn io_add(&mut self, io: IoToken, interest: Interest) {
        self.0.borrow_mut().io.insert(io, interest);
    }

    fn io_set(&mut self, io: IoToken, interest: Interest) {
        self.0.borrow_mut().io.insert(io, interest);
    }

    fn io_del(&mut self, io: IoToken) {
        self.0.borrow_mut().io.remove(&io);
    }

    fn timeout_add(&mut self, timer: TimerToken, after: TimeSpec) {
        let deadline = if after == TimeSpec::ZERO {
            None
        } else {
            Some(self.now() + after)
        };
        self.0.borrow_mut().timers.insert(timer, deadline);
    }

    fn timeout_set(&mut self, timer: TimerToken, after: TimeSpec) {
        let deadline = Some(self.now() + after);
        self.0.borrow_mut().timers.insert(timer, deadline);
    }

    fn timeout_del(&mut self, timer: TimerToken) {
        self.0.borrow_mut().timers.remove(&timer);
    }

    fn now(&self) -> TimeSpec {
        self.0.borrow().now
    }
}

/// One end of an in-memory byte pipe. Clones share the underlying queues;
/// tests keep a clone to inject bytes or watch traffic counters.
#[derive(Clone)]
pub struct SimTransport {
    recv_queue: Rc<RefCell<VecDeque<u8>>>,
    send_queue: Rc<RefCell<VecDeque<u8>>>,
    recv_closed: Rc<RefCell<bool>>,
    send_closed: Rc<RefCell<bool>>,
    /// Total bytes this end has written toward its peer.
    sent_bytes: Rc<RefCell<usize>>,
}

impl SimTransport {
    pub fn sent_bytes(&self) -> usize {
        *self.sent_bytes.borrow()
    }

    pub fn pending_bytes(&self) -> usize {
        self.send_queue.borrow().len()
    }
}

impl Transport for SimTransport {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut queue = self.recv_queue.borrow_mut();
        if queue.is_empty() {
            if *self.recv_closed.borrow() {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(queue.len());
        for slot in buf.iter_mut().take(n) {
            *slot = queue.pop_front().unwrap();
        }
        Ok(n)
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        self.send_queue.borrow_mut().extend(data.iter().copied());
        *self.sent_bytes.borrow_mut() += data.len();
        Ok(data.len())
    }

    fn close(&mut self) {
        *self.send_closed.borrow_mut() = true;
    }
}

/// Builds two connected transport ends.
pub fn transport_pair() -> (SimTransport, SimTransport) {
    let ab = Rc::new(RefCell::new(VecDeque::new()));
    let ba = Rc::new(RefCell::new(VecDeque::new()));
    let a_closed = Rc::new(RefCell::new(false));
    let b_closed = Rc::new(RefCell::new(false));
    let a = SimTransport {
        recv_queue: ba.clone(),
        send_queue: ab.clone(),
        recv_closed: b_closed.clone(),
        send_closed: a_closed.clone(),
        sent_bytes: Rc::new(RefCell::new(0)),
    };
    let b = SimTransport {
        recv_queue: ab,
        send_queue: ba,
        recv_closed: a_closed,
        send_closed: b_closed,
        sent_bytes: Rc::new(RefCell::new(0)),
    };
    (a, b)
}

pub fn addr(host: &str) -> Address {
    Address {
        host: host.to_string(),
        port: 655,
    }
}

/// A mesh on a fresh simulated loop.
pub fn make_mesh(name: &str) -> (Mesh, SimLoop, Keypair) {
    let sim = SimLoop::new();
    let keypair = Keypair::generate();
    let mesh = Mesh::new(
        MeshConfig {
            name: name.to_string(),
            keypair: keypair.clone(),
            dev_class: DeviceClass::Stationary,
            port: 655,
        },
        Box::new(sim.clone()),
    )
    .unwrap();
    (mesh, sim, keypair)
}

/// Tells each mesh about the other's identity key.
pub fn introduce(a: &mut Mesh, b_name: &str, b_key: &Keypair) {
    a.add_known_node(b_name, b_key.public(), DeviceClass::Stationary)
        .unwrap();
}

/// Creates a transport pair and wires one connection on each mesh.
/// `a` plays the outgoing side.
pub fn link(a: &mut Mesh, b: &mut Mesh) -> (ConnId, ConnId, SimTransport, SimTransport) {
    let (ta, tb) = transport_pair();
    let ca = a
        .add_connection(Box::new(ta.clone()), true, addr("198.51.100.2"))
        .unwrap();
    let cb = b
        .add_connection(Box::new(tb.clone()), false, addr("198.51.100.1"))
        .unwrap();
    (ca, cb, ta, tb)
}

fn step(mesh: &mut Mesh) {
    let ids: Vec<ConnId> = mesh.connections().map(|(id, _)| id).collect();
    for id in ids {
        mesh.io_ready(IoToken(id.0), true, true);
    }
}

/// Drives both meshes until traffic settles.
pub fn pump2(a: &mut Mesh, b: &mut Mesh) {
    for _ in 0..12 {
        step(a);
        step(b);
    }
}

/// Drives three meshes until traffic settles.
pub fn pump3(a: &mut Mesh, b: &mut Mesh, c: &mut Mesh) {
    for _ in 0..16 {
        step(a);
        step(b);
        step(c);
    }
}
