//! Collaborator interfaces: the readiness event loop and the reliable
//! transport.
//!
//! The core never owns a socket or a poll loop. The surrounding runtime
//! registers interest through [`EventLoop`] using opaque tokens and calls
//! back into [`crate::mesh::Mesh::io_ready`] / [`crate::mesh::Mesh::timer_fired`]
//! when the matching fd or timer is ready. Tests supply a deterministic
//! simulated loop.

use std::io;
use std::ops::Add;

/// Identifies one registered I/O source. The mesh uses the connection's
/// arena slot as the token value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct IoToken(pub u32);

/// Identifies one registered timer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TimerToken(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };
    pub const READ_WRITE: Interest = Interest {
        read: true,
        write: true,
    };
}

/// Seconds plus nanoseconds, as handed to timer registration.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct TimeSpec {
    pub sec: u64,
    pub nsec: u32,
}

pub const NSEC_PER_SEC: u32 = 1_000_000_000;

impl TimeSpec {
    pub const ZERO: TimeSpec = TimeSpec { sec: 0, nsec: 0 };

    pub fn new(sec: u64, nsec: u32) -> Self {
        TimeSpec { sec, nsec }
    }
}

impl Add for TimeSpec {
    type Output = TimeSpec;

    fn add(self, rhs: TimeSpec) -> TimeSpec {
        let nsec = self.nsec + rhs.nsec;
        TimeSpec {
            sec: self.sec + rhs.sec + u64::from(nsec / NSEC_PER_SEC),
            nsec: nsec % NSEC_PER_SEC,
        }
    }
}

/// The readiness multiplexer the core is driven by.
///
/// `timeout_add` registers a timer; a relative time of [`TimeSpec::ZERO`]
/// registers it unarmed. `timeout_set` re-arms a registered timer relative
/// to `now`. All calls happen on the event-loop thread.
pub trait EventLoop {
    fn io_add(&mut self, io: IoToken, interest: Interest);
    fn io_set(&mut self, io: IoToken, interest: Interest);
    fn io_del(&mut self, io: IoToken);
    fn timeout_add(&mut self, timer: TimerToken, after: TimeSpec);
    fn timeout_set(&mut self, timer: TimerToken, after: TimeSpec);
    fn timeout_del(&mut self, timer: TimerToken);
    /// Monotonic time.
    fn now(&self) -> TimeSpec;
}

/// A non-blocking, ordered, reliable byte stream.
///
/// `recv` returning `Ok(0)` means the peer closed; `ErrorKind::WouldBlock`
/// means no data is available right now. Partial sends are expected and
/// buffered by the caller.
pub trait Transport {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn send(&mut self, data: &[u8]) -> io::Result<usize>;
    fn close(&mut self);
}
