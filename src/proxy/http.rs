//! HTTP/1.x stream parsing
//!
//! The `http`, `http_length` and `http_chunked` states of the follower
//! state machine. Parsing is byte-oriented; header names are matched ASCII
//! case-insensitively with whitespace tolerance around the colon. Bodies
//! are optionally decompressed before they land in the trace.

use std::io::Read;

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};

use crate::error::StreamError;
use crate::proxy::follower::{Follower, Step, StreamState};
use crate::proxy::websocket::WsAssembler;
use crate::proxy::Direction;

/// Where to go once the current message body is done: `http` again on
/// keep-alive, `eof` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resume {
    Http,
    Eof,
}

impl Resume {
    fn into_state(self) -> StreamState {
        match self {
            Resume::Http => StreamState::Http,
            Resume::Eof => StreamState::Eof,
        }
    }
}

/// Everything the body states need from the parsed head.
pub(crate) struct Head {
    /// First line of the head, CRLF stripped.
    pub(crate) status: String,
    /// The raw head bytes, terminator included.
    pub(crate) block: Vec<u8>,
    pub(crate) decoder: Decoder,
    pub(crate) resume: Resume,
}

/// Body decompression selected from `Content-Encoding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decoder {
    Identity,
    Gzip,
    Deflate,
}

impl Decoder {
    fn select(encoding: Option<&[u8]>, conn_id: u64, direction: Direction) -> Self {
        match encoding {
            None => Decoder::Identity,
            Some(v) if v.eq_ignore_ascii_case(b"gzip") => Decoder::Gzip,
            Some(v) if v.eq_ignore_ascii_case(b"deflate") => Decoder::Deflate,
            Some(v) if v.eq_ignore_ascii_case(b"identity") => Decoder::Identity,
            Some(v) => {
                tracing::warn!(
                    conn_id,
                    direction = %direction,
                    encoding = %String::from_utf8_lossy(v),
                    "unknown content encoding, passing body through"
                );
                Decoder::Identity
            }
        }
    }

    /// Decode `raw`, falling back to the raw bytes with a warning when the
    /// compressed stream is broken.
    pub(crate) fn decode(&self, raw: &[u8], conn_id: u64, direction: Direction) -> Vec<u8> {
        let result = match self {
            Decoder::Identity => return raw.to_vec(),
            Decoder::Gzip => {
                let mut out = Vec::new();
                GzDecoder::new(raw).read_to_end(&mut out).map(|_| out)
            }
            Decoder::Deflate => {
                let mut out = Vec::new();
                match ZlibDecoder::new(raw).read_to_end(&mut out) {
                    Ok(_) => Ok(out),
                    // some peers send raw deflate without the zlib wrapper
                    Err(_) => {
                        let mut out = Vec::new();
                        DeflateDecoder::new(raw).read_to_end(&mut out).map(|_| out)
                    }
                }
            }
        };
        match result {
            Ok(out) => out,
            Err(err) => {
                tracing::warn!(
                    conn_id,
                    direction = %direction,
                    %err,
                    "body decompression failed, emitting raw bytes"
                );
                raw.to_vec()
            }
        }
    }
}

/// Index one past the `\r?\n\r?\n` headers terminator, if present.
pub(crate) fn find_blank_line(buf: &[u8]) -> Option<usize> {
    for (i, &b) in buf.iter().enumerate() {
        if b != b'\n' {
            continue;
        }
        let rest = &buf[i + 1..];
        if rest.starts_with(b"\r\n") {
            return Some(i + 3);
        }
        if rest.starts_with(b"\n") {
            return Some(i + 2);
        }
    }
    None
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !matches!(b, b' ' | b'\t'))
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !matches!(b, b' ' | b'\t'))
        .map_or(start, |p| p + 1);
    &bytes[start..end]
}

/// Value of the first header named `name` in a head block, trimmed.
pub(crate) fn header_value<'a>(block: &'a [u8], name: &str) -> Option<&'a [u8]> {
    let mut lines = block.split(|&b| b == b'\n');
    lines.next()?; // request or status line
    for line in lines {
        let line = strip_cr(line);
        if line.is_empty() {
            break;
        }
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let (header_name, rest) = line.split_at(colon);
        if trim(header_name).eq_ignore_ascii_case(name.as_bytes()) {
            return Some(trim(&rest[1..]));
        }
    }
    None
}

fn has_token(value: &[u8], token: &str) -> bool {
    String::from_utf8_lossy(value)
        .to_ascii_lowercase()
        .contains(token)
}

/// The `http` state: wait for a complete head, pick the body framing and
/// emit the matching pre-event or message event.
pub(crate) fn head(fol: &mut Follower) -> Result<Step, StreamError> {
    let Some(head_end) = find_blank_line(&fol.buf) else {
        return Ok(Step::NeedMore(StreamState::Http));
    };
    let block: Vec<u8> = fol.buf.drain(..head_end).collect();
    let first_line = block.split(|&b| b == b'\n').next().unwrap_or(&[]);
    let status = String::from_utf8_lossy(strip_cr(first_line)).into_owned();

    let connection = header_value(&block, "connection");
    let resume = if connection.is_some_and(|v| has_token(v, "keep-alive")) {
        Resume::Http
    } else {
        Resume::Eof
    };
    let decoder = Decoder::select(
        header_value(&block, "content-encoding"),
        fol.conn_id,
        fol.direction,
    );

    let upgrading = connection.is_some_and(|v| has_token(v, "upgrade"))
        && header_value(&block, "upgrade").is_some_and(|v| has_token(v, "websocket"));
    if upgrading {
        fol.event("websocket upgrade", &block, b"", None, None)?;
        return Ok(Step::Next(StreamState::Websocket(WsAssembler::default())));
    }

    if let Some(len) = header_value(&block, "content-length")
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|s| s.trim().parse::<usize>().ok())
    {
        fol.event(&format!("content-length: {len}"), &block, b"", None, None)?;
        let head = Head {
            status,
            block,
            decoder,
            resume,
        };
        return Ok(Step::Next(StreamState::HttpLength {
            head,
            remaining: len,
        }));
    }

    if header_value(&block, "transfer-encoding").is_some_and(|v| has_token(v, "chunked")) {
        fol.event("transfer-encoding: chunked", &block, b"", None, None)?;
        let head = Head {
            status,
            block,
            decoder,
            resume,
        };
        return Ok(Step::Next(StreamState::HttpChunked {
            head,
            accum: Vec::new(),
        }));
    }

    // no body framing at all
    fol.event(&status, &block, b"", None, None)?;
    Ok(Step::Next(resume.into_state()))
}

/// The `http_length` state: wait for the declared number of body bytes,
/// then emit one event for the whole message.
pub(crate) fn fixed_length(
    fol: &mut Follower,
    head: Head,
    remaining: usize,
) -> Result<Step, StreamError> {
    if fol.buf.len() < remaining {
        return Ok(Step::NeedMore(StreamState::HttpLength { head, remaining }));
    }
    let raw: Vec<u8> = fol.buf.drain(..remaining).collect();
    let body = head.decoder.decode(&raw, fol.conn_id, fol.direction);
    fol.event(&head.status, &head.block, &body, None, None)?;
    Ok(Step::Next(head.resume.into_state()))
}

/// The `http_chunked` state: walk `size[;ext]` chunk headers, gathering
/// payloads into the accumulator. One event for the whole message fires on
/// the terminal chunk; intermediate chunks emit nothing.
pub(crate) fn chunked(
    fol: &mut Follower,
    head: Head,
    mut accum: Vec<u8>,
) -> Result<Step, StreamError> {
    loop {
        let Some(nl) = fol.buf.iter().position(|&b| b == b'\n') else {
            return Ok(Step::NeedMore(StreamState::HttpChunked { head, accum }));
        };
        let line = strip_cr(&fol.buf[..nl]);
        let size_part = match line.iter().position(|&b| b == b';') {
            Some(semi) => &line[..semi],
            None => line,
        };
        let size = std::str::from_utf8(size_part)
            .ok()
            .and_then(|s| usize::from_str_radix(s.trim(), 16).ok());
        let Some(size) = size else {
            tracing::warn!(
                conn_id = fol.conn_id,
                direction = %fol.direction,
                line = %String::from_utf8_lossy(line),
                "malformed chunk size, abandoning stream"
            );
            fol.buf.clear();
            return Ok(Step::Next(StreamState::Eof));
        };

        if size == 0 {
            // terminal chunk: consume through the blank line that ends the
            // trailer section (usually immediately after `0\r\n`)
            let Some(term) = find_blank_line(&fol.buf) else {
                return Ok(Step::NeedMore(StreamState::HttpChunked { head, accum }));
            };
            fol.buf.drain(..term);
            let body = head.decoder.decode(&accum, fol.conn_id, fol.direction);
            fol.event(&head.status, &head.block, &body, None, None)?;
            return Ok(Step::Next(head.resume.into_state()));
        }

        let data_start = nl + 1;
        let data_end = data_start + size;
        // the payload and its trailing CRLF must both be present
        if fol.buf.len() < data_end + 1 {
            return Ok(Step::NeedMore(StreamState::HttpChunked { head, accum }));
        }
        let trail = match fol.buf[data_end] {
            b'\n' => 1,
            b'\r' => {
                if fol.buf.len() < data_end + 2 {
                    return Ok(Step::NeedMore(StreamState::HttpChunked { head, accum }));
                }
                if fol.buf[data_end + 1] == b'\n' {
                    2
                } else {
                    0
                }
            }
            _ => 0,
        };
        if trail == 0 {
            tracing::warn!(
                conn_id = fol.conn_id,
                direction = %fol.direction,
                "chunk payload not followed by CRLF"
            );
        }
        accum.extend_from_slice(&fol.buf[data_start..data_end]);
        fol.buf.drain(..data_end + trail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::follower::testing::{capture_pair, rows};
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn fixed_length_round_trip() {
        let (_up, down, buf) = capture_pair(1);
        down.borrow_mut()
            .data(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
            .unwrap();

        let rows = rows(&buf);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][5], "content-length: 5");
        assert_eq!(rows[0][4], "http");
        assert_eq!(rows[1][5], "HTTP/1.1 200 OK");
        assert_eq!(rows[1][4], "http_length");
        assert_eq!(
            rows[1][6],
            hex::encode(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n")
        );
        assert_eq!(rows[1][7], hex::encode(b"hello"));
        assert_eq!(down.borrow().state_name(), "eof");
        down.borrow_mut().close().unwrap();
    }

    #[test]
    fn fixed_length_waits_for_full_body() {
        let (_up, down, buf) = capture_pair(1);
        down.borrow_mut()
            .data(b"HTTP/1.1 200 OK\r\nContent-Length: 12\r\n\r\nhel")
            .unwrap();
        assert_eq!(rows(&buf).len(), 1); // pre-event only
        assert_eq!(down.borrow().state_name(), "http_length");

        down.borrow_mut().data(b"lo worl").unwrap();
        assert_eq!(rows(&buf).len(), 1);

        down.borrow_mut().data(b"d!").unwrap();
        let rows = rows(&buf);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][7], hex::encode(b"hello world!"));
        down.borrow_mut().close().unwrap();
    }

    #[test]
    fn keep_alive_returns_to_http() {
        let (_up, down, buf) = capture_pair(1);
        down.borrow_mut()
            .data(b"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nContent-Length: 2\r\n\r\nok")
            .unwrap();
        assert_eq!(down.borrow().state_name(), "http");

        // a second message parses cleanly on the same follower
        down.borrow_mut()
            .data(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
        let rows = rows(&buf);
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[3][5], "HTTP/1.1 404 Not Found");
        down.borrow_mut().close().unwrap();
    }

    #[test]
    fn chunked_round_trip() {
        let (_up, down, buf) = capture_pair(2);
        down.borrow_mut()
            .data(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
            )
            .unwrap();

        let rows = rows(&buf);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][5], "transfer-encoding: chunked");
        assert_eq!(rows[1][5], "HTTP/1.1 200 OK");
        assert_eq!(rows[1][4], "http_chunked");
        assert_eq!(rows[1][7], hex::encode(b"hello world"));
        assert_eq!(down.borrow().state_name(), "eof");
        down.borrow_mut().close().unwrap();
    }

    #[test]
    fn chunked_handles_split_arrivals() {
        let (_up, down, buf) = capture_pair(2);
        let full =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        for chunk in full.chunks(7) {
            down.borrow_mut().data(chunk).unwrap();
        }
        let rows = rows(&buf);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][7], hex::encode(b"hello world"));
        down.borrow_mut().close().unwrap();
    }

    #[test]
    fn chunk_extensions_are_ignored() {
        let (_up, down, buf) = capture_pair(2);
        down.borrow_mut()
            .data(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5;ext=1\r\nhello\r\n0\r\n\r\n")
            .unwrap();
        let rows = rows(&buf);
        assert_eq!(rows[1][7], hex::encode(b"hello"));
        down.borrow_mut().close().unwrap();
    }

    #[test]
    fn gzip_body_is_decoded() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"the plain text").unwrap();
        let gz = enc.finish().unwrap();

        let mut message =
            format!("HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n", gz.len())
                .into_bytes();
        message.extend_from_slice(&gz);

        let (_up, down, buf) = capture_pair(3);
        down.borrow_mut().data(&message).unwrap();
        let rows = rows(&buf);
        assert_eq!(rows[1][7], hex::encode(b"the plain text"));
        down.borrow_mut().close().unwrap();
    }

    #[test]
    fn deflate_body_is_decoded() {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"inflate me").unwrap();
        let deflated = enc.finish().unwrap();

        let mut message = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: deflate\r\nContent-Length: {}\r\n\r\n",
            deflated.len()
        )
        .into_bytes();
        message.extend_from_slice(&deflated);

        let (_up, down, buf) = capture_pair(3);
        down.borrow_mut().data(&message).unwrap();
        let rows = rows(&buf);
        assert_eq!(rows[1][7], hex::encode(b"inflate me"));
        down.borrow_mut().close().unwrap();
    }

    #[test]
    fn unknown_encoding_falls_back_to_identity() {
        let (_up, down, buf) = capture_pair(3);
        down.borrow_mut()
            .data(b"HTTP/1.1 200 OK\r\nContent-Encoding: br\r\nContent-Length: 4\r\n\r\nsame")
            .unwrap();
        let rows = rows(&buf);
        assert_eq!(rows[1][7], hex::encode(b"same"));
        down.borrow_mut().close().unwrap();
    }

    #[test]
    fn upgrade_handshake_switches_to_websocket() {
        let (_up, down, buf) = capture_pair(4);
        down.borrow_mut()
            .data(
                b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
            )
            .unwrap();

        let rows = rows(&buf);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][5], "websocket upgrade");
        assert_eq!(rows[0][7], "");
        assert_eq!(down.borrow().state_name(), "websocket");
        down.borrow_mut().close().unwrap();
    }

    #[test]
    fn header_matching_tolerates_case_and_whitespace() {
        let (_up, down, buf) = capture_pair(5);
        down.borrow_mut()
            .data(b"HTTP/1.1 200 OK\r\ncontent-LENGTH  :   5\r\n\r\nhello")
            .unwrap();
        let rows = rows(&buf);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][5], "content-length: 5");
        assert_eq!(rows[1][7], hex::encode(b"hello"));
        down.borrow_mut().close().unwrap();
    }

    #[test]
    fn bare_lf_terminator_is_accepted() {
        let (_up, down, buf) = capture_pair(5);
        down.borrow_mut()
            .data(b"HTTP/1.1 200 OK\nContent-Length: 2\n\nok")
            .unwrap();
        let rows = rows(&buf);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][7], hex::encode(b"ok"));
        down.borrow_mut().close().unwrap();
    }

    #[test]
    fn zero_length_body_emits_immediately() {
        let (_up, down, buf) = capture_pair(5);
        down.borrow_mut()
            .data(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
        let rows = rows(&buf);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][7], "");
        assert_eq!(down.borrow().state_name(), "eof");
        down.borrow_mut().close().unwrap();
    }

    #[test]
    fn find_blank_line_variants() {
        assert_eq!(find_blank_line(b"a\r\n\r\nrest"), Some(5));
        assert_eq!(find_blank_line(b"a\n\nrest"), Some(3));
        assert_eq!(find_blank_line(b"a\n\r\nrest"), Some(4));
        assert_eq!(find_blank_line(b"a\r\n\nrest"), Some(4));
        assert_eq!(find_blank_line(b"a\r\nb"), None);
    }

    #[test]
    fn header_value_picks_first_match() {
        let block = b"GET / HTTP/1.1\r\nHost: a\r\nhost: b\r\n\r\n";
        assert_eq!(header_value(block, "host"), Some(&b"a"[..]));
        assert_eq!(header_value(block, "missing"), None);
    }
}
