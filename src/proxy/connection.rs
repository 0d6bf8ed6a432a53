//! Per-connection byte pump
//!
//! Couples one accepted client socket with one upstream socket through two
//! bounded buffers, feeding every forwarded byte to the matching follower.
//! The uplink is held back until the one-shot HTTP request rewrite has run
//! over the complete request head.
//!
//! Readiness bits are sticky, edge-triggered-poller style: the loop sets
//! them from poller events and they are cleared only when the matching
//! socket operation returns `WouldBlock`.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::mem;
use std::rc::Rc;
use std::sync::Arc;

use mio::event::Event;
use mio::net::TcpStream;
use mio::Token;

use crate::error::StreamError;
use crate::proxy::http::find_blank_line;
use crate::proxy::{Direction, Follower, BUF_LIMIT};
use crate::timing::Timers;
use crate::trace::TraceWriter;

/// Which socket of a connection a poller event landed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Client,
    Server,
}

/// Sticky readiness bits for one socket.
#[derive(Debug, Default, Clone, Copy)]
struct SocketEvents {
    readable: bool,
    writable: bool,
    error: bool,
}

impl SocketEvents {
    fn note(&mut self, event: &Event) {
        if event.is_readable() || event.is_read_closed() {
            self.readable = true;
        }
        if event.is_writable() {
            self.writable = true;
        }
        if event.is_error() {
            self.error = true;
        }
    }
}

pub(crate) struct Connection {
    pub(crate) id: u64,
    client: TcpStream,
    server: TcpStream,
    pub(crate) client_token: Token,
    pub(crate) server_token: Token,
    upbuf: Vec<u8>,
    downbuf: Vec<u8>,
    uplink: Rc<RefCell<Follower>>,
    downlink: Rc<RefCell<Follower>>,
    /// One-shot latch: set once the request head has been rewritten. The
    /// uplink is not forwarded upstream before this fires.
    http_rewritten: bool,
    /// Replacement value for the client's `Host:` header.
    host_header: String,
    client_events: SocketEvents,
    server_events: SocketEvents,
    timers: Arc<Timers>,
    closed: bool,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        client: TcpStream,
        server: TcpStream,
        client_token: Token,
        server_token: Token,
        host_header: String,
        trace: Rc<RefCell<TraceWriter>>,
        timers: Arc<Timers>,
    ) -> Self {
        let (uplink, downlink) = Follower::pair(trace, timers.clone(), id);
        Self {
            id,
            client,
            server,
            client_token,
            server_token,
            upbuf: Vec::new(),
            downbuf: Vec::new(),
            uplink,
            downlink,
            http_rewritten: false,
            host_header,
            client_events: SocketEvents::default(),
            server_events: SocketEvents::default(),
            timers,
            closed: false,
        }
    }

    pub(crate) fn client_mut(&mut self) -> &mut TcpStream {
        &mut self.client
    }

    pub(crate) fn server_mut(&mut self) -> &mut TcpStream {
        &mut self.server
    }

    pub(crate) fn note_event(&mut self, side: Side, event: &Event) {
        match side {
            Side::Client => self.client_events.note(event),
            Side::Server => self.server_events.note(event),
        }
    }

    /// Pump bytes in both directions until nothing more can move. Returns
    /// `false` once the connection is gone.
    pub(crate) fn process(&mut self) -> Result<bool, StreamError> {
        loop {
            if self.client_events.error || self.server_events.error {
                tracing::warn!(conn_id = self.id, "socket error reported, closing connection");
                self.shutdown()?;
                return Ok(false);
            }
            let mut progress = false;

            // downlink read: server socket into the downlink buffer
            if self.server_events.readable && self.downbuf.len() < BUF_LIMIT {
                let room = BUF_LIMIT - self.downbuf.len();
                let old = self.downbuf.len();
                match read_append(&mut self.server, &mut self.downbuf, room) {
                    Ok(0) => {
                        self.shutdown()?;
                        return Ok(false);
                    }
                    Ok(_) => {
                        progress = true;
                        self.downlink.borrow_mut().data(&self.downbuf[old..])?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.server_events.readable = false;
                    }
                    Err(e) => {
                        tracing::warn!(conn_id = self.id, error = %e, "upstream read failed");
                        self.shutdown()?;
                        return Ok(false);
                    }
                }
            }

            // downlink write: drain the downlink buffer to the client
            if self.client_events.writable && !self.downbuf.is_empty() {
                match write_some(&mut self.client, &self.downbuf) {
                    Ok(0) => {
                        self.shutdown()?;
                        return Ok(false);
                    }
                    Ok(n) => {
                        self.downbuf.drain(..n);
                        progress = true;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.client_events.writable = false;
                    }
                    Err(e) => {
                        tracing::warn!(conn_id = self.id, error = %e, "client write failed");
                        self.shutdown()?;
                        return Ok(false);
                    }
                }
            }

            // uplink read: client socket into the uplink buffer. Before the
            // rewrite latch the full request head must be able to
            // accumulate, so reads are not capped by the current length.
            let up_room = if self.http_rewritten {
                BUF_LIMIT.saturating_sub(self.upbuf.len())
            } else {
                BUF_LIMIT
            };
            if self.client_events.readable && up_room > 0 {
                match read_append(&mut self.client, &mut self.upbuf, up_room) {
                    Ok(0) => {
                        self.shutdown()?;
                        return Ok(false);
                    }
                    Ok(_) => {
                        progress = true;
                        // bytes may sit here a while; record their arrival
                        self.uplink.borrow_mut().ping();
                        if !self.http_rewritten {
                            self.rewrite_http_request()?;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.client_events.readable = false;
                    }
                    Err(e) => {
                        tracing::warn!(conn_id = self.id, error = %e, "client read failed");
                        self.shutdown()?;
                        return Ok(false);
                    }
                }
            }

            // uplink write: only after the rewrite. The follower sees the
            // prefix that actually went out, so observed bytes are always a
            // subset of forwarded bytes.
            if self.http_rewritten && self.server_events.writable && !self.upbuf.is_empty() {
                match write_some(&mut self.server, &self.upbuf) {
                    Ok(0) => {
                        self.shutdown()?;
                        return Ok(false);
                    }
                    Ok(n) => {
                        let sent: Vec<u8> = self.upbuf.drain(..n).collect();
                        self.uplink.borrow_mut().data(&sent)?;
                        progress = true;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.server_events.writable = false;
                    }
                    Err(e) => {
                        tracing::warn!(conn_id = self.id, error = %e, "upstream write failed");
                        self.shutdown()?;
                        return Ok(false);
                    }
                }
            }

            if !progress {
                return Ok(true);
            }
        }
    }

    /// Flush what can still be flushed, let the followers see any residual
    /// uplink bytes, and close both streams.
    pub(crate) fn shutdown(&mut self) -> Result<(), StreamError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if !self.upbuf.is_empty() {
            let rest = mem::take(&mut self.upbuf);
            self.uplink.borrow_mut().data(&rest)?;
            flush_best_effort(&mut self.server, &rest);
        }
        if !self.downbuf.is_empty() {
            let rest = mem::take(&mut self.downbuf);
            flush_best_effort(&mut self.client, &rest);
        }
        self.uplink.borrow_mut().close()?;
        self.downlink.borrow_mut().close()?;
        tracing::debug!(conn_id = self.id, "connection closed");
        Ok(())
    }

    fn rewrite_http_request(&mut self) -> Result<(), StreamError> {
        if self.http_rewritten {
            return Err(StreamError::DoubleRewrite { conn_id: self.id });
        }
        self.timers.rewrite.start();
        let rewritten = rewrite_head(&self.upbuf, &self.host_header);
        self.timers.rewrite.stop();
        if let Some(bytes) = rewritten {
            tracing::debug!(
                conn_id = self.id,
                direction = %Direction::Up,
                "rewrote client request head"
            );
            self.upbuf = bytes;
            self.http_rewritten = true;
        }
        Ok(())
    }
}

/// Rewrite a request head in place once the `\r?\n\r?\n` terminator is
/// visible: downgrade an `HTTP/2…` version token, point `Host:` at the
/// configured upstream, drop `Sec-WebSocket-Extensions:`. Lines that match
/// nothing are copied byte-for-byte, so a head with nothing to rewrite
/// passes through unchanged. Returns `None` while the head is incomplete.
pub(crate) fn rewrite_head(buf: &[u8], host: &str) -> Option<Vec<u8>> {
    let head_end = find_blank_line(buf)?;
    let head = &buf[..head_end];
    let mut out = Vec::with_capacity(buf.len() + 32);
    let mut at = 0;
    let mut first = true;
    while at < head.len() {
        let line_end = head[at..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| at + p + 1)
            .unwrap_or(head.len());
        let line = &head[at..line_end];
        if first {
            out.extend_from_slice(&rewrite_request_line(line));
            first = false;
        } else if header_name_is(line, "host") {
            out.extend_from_slice(format!("Host: {host}\r\n").as_bytes());
        } else if header_name_is(line, "sec-websocket-extensions") {
            // dropped: extensions would change the frame format we parse
        } else {
            out.extend_from_slice(line);
        }
        at = line_end;
    }
    out.extend_from_slice(&buf[head_end..]);
    Some(out)
}

/// Replace an `HTTP/2…` version token (the last token of the request line)
/// with `HTTP/1.1`. Other versions pass through untouched.
fn rewrite_request_line(line: &[u8]) -> Vec<u8> {
    let eol = line
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(line.len());
    let content = &line[..eol];
    let token_start = content
        .iter()
        .rposition(|&b| b == b' ')
        .map(|p| p + 1)
        .unwrap_or(0);
    if content[token_start..].starts_with(b"HTTP/2") {
        let mut out = content[..token_start].to_vec();
        out.extend_from_slice(b"HTTP/1.1");
        out.extend_from_slice(&line[eol..]);
        return out;
    }
    line.to_vec()
}

fn header_name_is(line: &[u8], name: &str) -> bool {
    let Some(colon) = line.iter().position(|&b| b == b':') else {
        return false;
    };
    let head = &line[..colon];
    let start = head
        .iter()
        .position(|b| !matches!(b, b' ' | b'\t'))
        .unwrap_or(head.len());
    let end = head
        .iter()
        .rposition(|b| !matches!(b, b' ' | b'\t'))
        .map_or(start, |p| p + 1);
    head[start..end].eq_ignore_ascii_case(name.as_bytes())
}

fn read_append(sock: &mut TcpStream, buf: &mut Vec<u8>, room: usize) -> io::Result<usize> {
    let old = buf.len();
    buf.resize(old + room, 0);
    loop {
        match sock.read(&mut buf[old..]) {
            Ok(n) => {
                buf.truncate(old + n);
                return Ok(n);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                buf.truncate(old);
                return Err(e);
            }
        }
    }
}

fn write_some(sock: &mut TcpStream, bytes: &[u8]) -> io::Result<usize> {
    loop {
        match sock.write(bytes) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn flush_best_effort(sock: &mut TcpStream, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        match write_some(sock, bytes) {
            Ok(0) | Err(_) => break,
            Ok(n) => bytes = &bytes[n..],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downgrades_http2_version_and_host() {
        let input = b"GET /index HTTP/2\r\nHost: example.org\r\nAccept: */*\r\n\r\n";
        let out = rewrite_head(input, "127.0.0.1:9000").unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("GET /index HTTP/1.1\r\n"));
        assert!(text.contains("Host: 127.0.0.1:9000\r\n"));
        assert!(!text.contains("example.org"));
        assert!(text.contains("Accept: */*\r\n"));
    }

    #[test]
    fn downgrades_dotted_http2_token() {
        let input = b"GET / HTTP/2.0\r\n\r\n";
        let out = rewrite_head(input, "h:1").unwrap();
        assert!(out.starts_with(b"GET / HTTP/1.1\r\n"));
    }

    #[test]
    fn host_match_is_case_insensitive_and_whitespace_tolerant() {
        let input = b"GET / HTTP/1.1\r\nhOsT\t : old.example\r\n\r\n";
        let out = rewrite_head(input, "up:8080").unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Host: up:8080\r\n"));
        assert!(!text.contains("old.example"));
    }

    #[test]
    fn strips_sec_websocket_extensions() {
        let input =
            b"GET /ws HTTP/1.1\r\nSec-WebSocket-Extensions: permessage-deflate\r\nUpgrade: websocket\r\n\r\n";
        let out = rewrite_head(input, "up:1").unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(!text.to_ascii_lowercase().contains("sec-websocket-extensions"));
        assert!(text.contains("Upgrade: websocket\r\n"));
    }

    #[test]
    fn untouched_head_is_byte_identical() {
        let input = b"GET / HTTP/1.1\r\nAccept: */*\r\nX-Other: 1\r\n\r\nbody bytes";
        let out = rewrite_head(input, "up:1").unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn incomplete_head_is_left_alone() {
        assert!(rewrite_head(b"GET / HTTP/2\r\nHost: x\r\n", "up:1").is_none());
    }

    #[test]
    fn body_bytes_pass_through_verbatim() {
        let input = b"POST / HTTP/2\r\nHost: a\r\n\r\n\x00\x01\xffraw";
        let out = rewrite_head(input, "b:2").unwrap();
        assert!(out.ends_with(b"\r\n\r\n\x00\x01\xffraw"));
    }

    #[test]
    fn http2_in_path_is_not_rewritten() {
        let input = b"GET /docs/HTTP/2 HTTP/1.1\r\n\r\n";
        let out = rewrite_head(input, "up:1").unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn bare_lf_head_is_rewritten_without_touching_other_lines() {
        let input = b"GET / HTTP/2\nAccept: */*\n\n";
        let out = rewrite_head(input, "up:1").unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("GET / HTTP/1.1\n"));
        assert!(text.contains("Accept: */*\n"));
    }
}
