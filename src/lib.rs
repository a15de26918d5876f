pub mod connection;
pub mod crypto;
pub mod edge;
pub mod event;
mod graph;
pub mod mesh;
pub mod node;
pub mod protocol;
pub mod queue;
pub mod splay;
pub mod sptps;

pub use connection::{ConnId, Connection, ConnectionState};
pub use crypto::{CryptoError, Ecdh, Keypair, PublicKey, X25519};
pub use edge::{Address, Edge, EdgeId};
pub use event::{EventLoop, Interest, IoToken, TimeSpec, TimerToken, Transport};
pub use mesh::{Mesh, MeshConfig, PING_INTERVAL_SECS, TIMER_PAST_REQUESTS};
pub use node::{DeviceClass, Node, NodeId};
pub use protocol::{check_id, AllowRequest, ProtocolError, Request, MAXBUFSIZE};
pub use queue::{PushError, Queue};
pub use splay::SplayMap;
pub use sptps::{Session, SessionError, SessionState};
