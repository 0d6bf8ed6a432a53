//! Custom error types for tapline
//!
//! Separates errors that kill the whole process (trace sink failures,
//! startup problems) from errors that only abort a single proxied
//! connection.

use std::io;

use thiserror::Error;

use crate::proxy::Direction;

/// Startup errors. All of these are fatal to the process.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("failed to bind listener on 127.0.0.1:{port}")]
    Bind { port: u16, source: io::Error },

    #[error("cannot resolve upstream address '{addr}'")]
    Resolve { addr: String, source: io::Error },

    #[error("upstream address '{addr}' resolved to nothing")]
    NoAddress { addr: String },

    #[error("failed to register socket with the poller")]
    Register(#[source] io::Error),
}

/// Errors from the trace sink. Partial writes are retried internally;
/// anything surfacing here is a hard failure and fatal to the process.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("trace write failed: {0}")]
    Write(#[from] io::Error),
}

/// Errors raised while feeding a stream follower. `Trace` is fatal to the
/// process; the invariant violations abort only the offending connection.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Data arrived on a follower whose socket was supposed to be closed.
    #[error("data arrived in closed state on connection {conn_id} ({direction})")]
    DataAfterClose { conn_id: u64, direction: Direction },

    /// The one-shot request-rewrite latch fired a second time.
    #[error("uplink headers rewritten twice on connection {conn_id}")]
    DoubleRewrite { conn_id: u64 },

    #[error(transparent)]
    Trace(#[from] TraceError),
}

impl StreamError {
    /// Whether this error must take the whole process down rather than
    /// just the connection it was raised on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StreamError::Trace(_))
    }
}
