//! WebSocket frame reassembly
//!
//! The `websocket` state of the follower state machine. Frames follow RFC
//! 6455 §5.2: FIN/RSV/opcode, MASK/len7, optional 16- or 64-bit big-endian
//! extended length, optional 4-byte masking key, payload XORed with the key
//! repeated modulo 4.
//!
//! Data messages may be fragmented across continuation frames with control
//! frames interleaved, so the reassembler keeps two independent message
//! start times. Events therefore come out in end-time order, which is not
//! necessarily begin-time order.

use crate::error::StreamError;
use crate::proxy::follower::{wallclock, Follower, Step, StreamState};

/// Scratch for the `websocket` state.
#[derive(Default)]
pub(crate) struct WsAssembler {
    /// Arrival time of the first byte of the in-flight data message.
    data_start: Option<f64>,
    /// Arrival time of the first byte of the in-flight control frame.
    ctrl_start: Option<f64>,
    /// Raw header (including mask key) of the initial fragment.
    frag_header: Vec<u8>,
    /// Message type carried by the initial fragment.
    frag_kind: Option<String>,
    /// Unmasked payload accumulated from earlier fragments.
    accum: Vec<u8>,
}

fn data_kind(opcode: u8) -> String {
    match opcode {
        1 => "text".to_owned(),
        2 => "binary".to_owned(),
        n => format!("unknown {n}"),
    }
}

fn control_notes(opcode: u8) -> String {
    match opcode {
        8 => "close".to_owned(),
        9 => "ping".to_owned(),
        10 => "pong".to_owned(),
        n => format!("unknown op {n}"),
    }
}

/// Drain as many complete frames from the buffer as possible. Partial
/// arrivals still stamp the applicable message start time so a message
/// spanning several reads keeps its true begin.
pub(crate) fn frames(fol: &mut Follower, mut ws: WsAssembler) -> Result<Step, StreamError> {
    loop {
        if fol.buf.is_empty() {
            return Ok(Step::NeedMore(StreamState::Websocket(ws)));
        }
        let arrived = fol.end.unwrap_or_else(wallclock);
        let b0 = fol.buf[0];
        let opcode = b0 & 0x0f;
        let control = opcode & 0x08 != 0;
        if control {
            ws.ctrl_start.get_or_insert(arrived);
        } else {
            ws.data_start.get_or_insert(arrived);
        }

        if fol.buf.len() < 2 {
            return Ok(Step::NeedMore(StreamState::Websocket(ws)));
        }
        let b1 = fol.buf[1];
        let masked = b1 & 0x80 != 0;
        let (ext, payload_len) = match b1 & 0x7f {
            126 => {
                if fol.buf.len() < 4 {
                    return Ok(Step::NeedMore(StreamState::Websocket(ws)));
                }
                (2, u16::from_be_bytes([fol.buf[2], fol.buf[3]]) as usize)
            }
            127 => {
                if fol.buf.len() < 10 {
                    return Ok(Step::NeedMore(StreamState::Websocket(ws)));
                }
                let mut len = [0u8; 8];
                len.copy_from_slice(&fol.buf[2..10]);
                (8, u64::from_be_bytes(len) as usize)
            }
            n => (0, n as usize),
        };
        let header_len = 2 + ext + if masked { 4 } else { 0 };
        if fol.buf.len() < header_len + payload_len {
            return Ok(Step::NeedMore(StreamState::Websocket(ws)));
        }

        let header: Vec<u8> = fol.buf[..header_len].to_vec();
        let mut payload: Vec<u8> = fol.buf[header_len..header_len + payload_len].to_vec();
        if masked {
            let key = &header[header_len - 4..];
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }
        fol.buf.drain(..header_len + payload_len);

        let fin = b0 & 0x80 != 0;
        let end = fol.end.unwrap_or(arrived);

        if control {
            let begin = ws.ctrl_start.take();
            fol.event(&control_notes(opcode), &header, &payload, begin, Some(end))?;
            if opcode == 8 {
                return Ok(Step::Next(StreamState::Eof));
            }
            continue;
        }

        if !fin {
            if opcode != 0 {
                // initial fragment of a fragmented message
                ws.frag_header = header;
                ws.frag_kind = Some(data_kind(opcode));
                ws.accum = payload;
            } else {
                ws.accum.extend_from_slice(&payload);
            }
            continue;
        }

        // final (or only) frame of a data message
        let kind = if opcode != 0 {
            data_kind(opcode)
        } else {
            ws.frag_kind.take().unwrap_or_else(|| data_kind(0))
        };
        let headings = if opcode != 0 {
            ws.frag_header.clear();
            header
        } else {
            std::mem::take(&mut ws.frag_header)
        };
        let mut body = std::mem::take(&mut ws.accum);
        body.extend_from_slice(&payload);
        let begin = ws.data_start.take();
        fol.event(&kind, &headings, &body, begin, Some(end))?;
        ws.frag_kind = None;
    }
}
