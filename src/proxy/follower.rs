//! Stream followers
//!
//! A follower is pinned to one direction of one proxied connection. It
//! accumulates the bytes that were actually forwarded, drives the parser
//! state machine over them, and emits one trace record per protocol-level
//! event. The two followers of a connection are cross-paired with weak
//! references so either can inspect (but never keep alive) the other.

use std::cell::RefCell;
use std::mem;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::StreamError;
use crate::proxy::http::{self, Head};
use crate::proxy::websocket::{self, WsAssembler};
use crate::proxy::Direction;
use crate::timing::Timers;
use crate::trace::{TraceRecord, TraceWriter};

/// Wall-clock seconds since the epoch, sub-second precision.
pub(crate) fn wallclock() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Parser state plus its per-state scratch. Transitions are by value; the
/// scratch of a state lives and dies with its variant.
pub(crate) enum StreamState {
    /// Waiting for an HTTP head (request or status line plus headers).
    Http,
    /// Consuming a fixed-length body.
    HttpLength { head: Head, remaining: usize },
    /// Consuming a chunked body.
    HttpChunked { head: Head, accum: Vec<u8> },
    /// Reassembling WebSocket frames.
    Websocket(WsAssembler),
    /// The protocol stream has ended; the socket may still be open.
    Eof,
    /// The socket is closed; any further data is an invariant violation.
    Closed,
}

impl StreamState {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            StreamState::Http => "http",
            StreamState::HttpLength { .. } => "http_length",
            StreamState::HttpChunked { .. } => "http_chunked",
            StreamState::Websocket(_) => "websocket",
            StreamState::Eof => "eof",
            StreamState::Closed => "closed",
        }
    }
}

/// Outcome of one state invocation.
pub(crate) enum Step {
    /// A prefix of the buffer was consumed; continue in the given state.
    Next(StreamState),
    /// The buffer cannot make progress; hand the state back untouched.
    NeedMore(StreamState),
}

pub struct Follower {
    trace: Rc<RefCell<TraceWriter>>,
    timers: Arc<Timers>,
    pub(crate) conn_id: u64,
    pub(crate) direction: Direction,
    pub(crate) pair: Weak<RefCell<Follower>>,
    state: StreamState,
    /// Name of the state currently executing, for trace rows emitted while
    /// the state value itself is checked out of `state`.
    state_name: &'static str,
    pub(crate) buf: Vec<u8>,
    pub(crate) begin: Option<f64>,
    pub(crate) end: Option<f64>,
}

impl Follower {
    fn new(
        trace: Rc<RefCell<TraceWriter>>,
        timers: Arc<Timers>,
        conn_id: u64,
        direction: Direction,
    ) -> Self {
        Self {
            trace,
            timers,
            conn_id,
            direction,
            pair: Weak::new(),
            state: StreamState::Http,
            state_name: "http",
            buf: Vec::new(),
            begin: None,
            end: None,
        }
    }

    /// Build the cross-paired uplink/downlink followers for one connection.
    pub fn pair(
        trace: Rc<RefCell<TraceWriter>>,
        timers: Arc<Timers>,
        conn_id: u64,
    ) -> (Rc<RefCell<Follower>>, Rc<RefCell<Follower>>) {
        let up = Rc::new(RefCell::new(Follower::new(
            trace.clone(),
            timers.clone(),
            conn_id,
            Direction::Up,
        )));
        let down = Rc::new(RefCell::new(Follower::new(
            trace,
            timers,
            conn_id,
            Direction::Down,
        )));
        up.borrow_mut().pair = Rc::downgrade(&down);
        down.borrow_mut().pair = Rc::downgrade(&up);
        (up, down)
    }

    pub(crate) fn state_name(&self) -> &'static str {
        self.state_name
    }

    /// Stamp the begin time (if unset) and refresh the end time without
    /// consuming bytes. Used when data is buffered but not yet parseable,
    /// e.g. an uplink read held back for the request rewrite.
    pub fn ping(&mut self) {
        let now = wallclock();
        if self.begin.is_none() {
            self.begin = Some(now);
        }
        self.end = Some(now);
    }

    /// Feed freshly forwarded bytes and drive the state machine until it
    /// can no longer make progress.
    pub fn data(&mut self, bytes: &[u8]) -> Result<(), StreamError> {
        if matches!(self.state, StreamState::Closed) {
            return Err(StreamError::DataAfterClose {
                conn_id: self.conn_id,
                direction: self.direction,
            });
        }
        self.timers.parse.start();
        self.ping();
        self.buf.extend_from_slice(bytes);
        let result = self.drive();
        self.timers.parse.stop();
        result
    }

    fn drive(&mut self) -> Result<(), StreamError> {
        loop {
            let state = mem::replace(&mut self.state, StreamState::Eof);
            self.state_name = state.name();
            let step = match state {
                StreamState::Http => http::head(self)?,
                StreamState::HttpLength { head, remaining } => {
                    http::fixed_length(self, head, remaining)?
                }
                StreamState::HttpChunked { head, accum } => http::chunked(self, head, accum)?,
                StreamState::Websocket(ws) => websocket::frames(self, ws)?,
                StreamState::Eof => {
                    if self.buf.is_empty() {
                        Step::NeedMore(StreamState::Eof)
                    } else {
                        let pair_state = self
                            .pair
                            .upgrade()
                            .map(|p| p.borrow().state_name())
                            .unwrap_or("gone");
                        tracing::warn!(
                            conn_id = self.conn_id,
                            direction = %self.direction,
                            pair_state,
                            "discarding {} bytes after end of stream",
                            self.buf.len()
                        );
                        self.buf.clear();
                        Step::Next(StreamState::Eof)
                    }
                }
                StreamState::Closed => {
                    return Err(StreamError::DataAfterClose {
                        conn_id: self.conn_id,
                        direction: self.direction,
                    })
                }
            };
            match step {
                Step::Next(next) => {
                    self.state = next;
                    self.state_name = self.state.name();
                    // the most recent bytes caused this transition
                    self.begin = self.end;
                }
                Step::NeedMore(state) => {
                    self.state = state;
                    self.state_name = self.state.name();
                    return Ok(());
                }
            }
        }
    }

    /// Write one trace record. `begin`/`end` default to the pending
    /// timestamps; the WebSocket reassembler overrides them with its own
    /// per-message start times.
    pub(crate) fn event(
        &mut self,
        notes: &str,
        headings: &[u8],
        body: &[u8],
        begin: Option<f64>,
        end: Option<f64>,
    ) -> Result<(), StreamError> {
        let end = end.or(self.end).unwrap_or_else(wallclock);
        let begin = begin.or(self.begin).unwrap_or(end);
        // trace time is accounted separately from parse time
        self.timers.parse.stop();
        let result = self.trace.borrow_mut().record(&TraceRecord {
            begin,
            end,
            conn_id: self.conn_id,
            direction: self.direction,
            state: self.state_name,
            notes,
            headings,
            body,
        });
        self.timers.parse.start();
        result.map_err(StreamError::from)
    }

    /// Mark the stream closed. Residual unparsed bytes become one final
    /// `unexpected EOF` event.
    pub fn close(&mut self) -> Result<(), StreamError> {
        if matches!(self.state, StreamState::Closed) {
            return Ok(());
        }
        self.timers.parse.start();
        self.ping();
        self.state = StreamState::Closed;
        self.state_name = "closed";
        let result = if self.buf.is_empty() {
            Ok(())
        } else {
            let residual = mem::take(&mut self.buf);
            self.event("unexpected EOF", b"", &residual, None, None)
        };
        self.timers.parse.stop();
        result
    }
}

impl Drop for Follower {
    fn drop(&mut self) {
        if !matches!(self.state, StreamState::Closed) {
            tracing::warn!(
                conn_id = self.conn_id,
                direction = %self.direction,
                state = self.state_name,
                "follower dropped without being closed"
            );
        }
    }
}
