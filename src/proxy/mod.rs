//! Proxy engine
//!
//! The readiness loop ([`server`]), the per-connection byte pump
//! ([`connection`]) and the per-direction stream followers that parse the
//! forwarded bytes and emit trace events.

mod connection;
mod follower;
mod http;
mod server;
mod websocket;

pub use follower::Follower;
pub use server::Proxy;

/// Bound on each per-direction proxy buffer. A full buffer pauses reads
/// from the corresponding socket, letting the kernel apply TCP-level
/// backpressure to the far peer.
pub const BUF_LIMIT: usize = 65_536;

/// Which half of a proxied connection a follower watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to server.
    Up,
    /// Server to client.
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
