//! Trace output
//!
//! One tab-separated record per observed protocol event, appended to a
//! synchronous sink (stdout by default). Each record is fully committed to
//! the kernel before the writer returns, so a consumer tailing the stream
//! never sees a torn row. Time spent here is charged to the trace timer.

use std::io::{self, Write};
use std::sync::Arc;

use crate::error::TraceError;
use crate::proxy::Direction;
use crate::timing::Timers;

/// A single protocol-level event, ready for serialization.
pub struct TraceRecord<'a> {
    /// Wall-clock seconds, sub-second precision.
    pub begin: f64,
    pub end: f64,
    pub conn_id: u64,
    pub direction: Direction,
    /// Parser state name at the moment of emission.
    pub state: &'static str,
    /// Free text; tabs are replaced with spaces on output.
    pub notes: &'a str,
    /// Raw header bytes, hex-encoded on output.
    pub headings: &'a [u8],
    /// Raw (possibly decompressed) body bytes, hex-encoded on output.
    pub body: &'a [u8],
}

/// Appends trace records to a sink, flushing each one before returning.
pub struct TraceWriter {
    sink: Box<dyn Write>,
    timers: Arc<Timers>,
}

impl TraceWriter {
    pub fn new(sink: Box<dyn Write>, timers: Arc<Timers>) -> Self {
        Self { sink, timers }
    }

    pub fn stdout(timers: Arc<Timers>) -> Self {
        Self::new(Box::new(io::stdout()), timers)
    }

    /// Serialize and commit one record. `write_all` retries partial writes;
    /// a hard I/O error here is fatal to the process.
    pub fn record(&mut self, record: &TraceRecord<'_>) -> Result<(), TraceError> {
        self.timers.trace.start();
        let result = self.write_record(record);
        self.timers.trace.stop();
        result.map_err(TraceError::from)
    }

    fn write_record(&mut self, record: &TraceRecord<'_>) -> io::Result<()> {
        let notes = record.notes.replace('\t', " ");
        let line = format!(
            "{:.6}\t{:.6}\t{}\t{}\t{}\t{}\t{}\t{}\n",
            record.begin,
            record.end,
            record.conn_id,
            record.direction,
            record.state,
            notes,
            hex::encode(record.headings),
            hex::encode(record.body),
        );
        self.sink.write_all(line.as_bytes())?;
        self.sink.flush()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Write adapter over a shared byte buffer so tests can inspect what a
    /// follower emitted.
    pub(crate) struct SharedSink(pub Rc<RefCell<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    pub(crate) fn capture_writer() -> (TraceWriter, Rc<RefCell<Vec<u8>>>) {
        let buf = Rc::new(RefCell::new(Vec::new()));
        let writer = TraceWriter::new(
            Box::new(SharedSink(buf.clone())),
            Arc::new(Timers::new()),
        );
        (writer, buf)
    }

    #[test]
    fn record_is_tab_separated_and_hex_encoded() {
        let (mut writer, buf) = capture_writer();
        writer
            .record(&TraceRecord {
                begin: 1.25,
                end: 2.5,
                conn_id: 42,
                direction: Direction::Up,
                state: "http",
                notes: "GET / HTTP/1.1",
                headings: b"Host: x\r\n",
                body: b"hi",
            })
            .unwrap();

        let out = buf.borrow().clone();
        let line = String::from_utf8(out).unwrap();
        assert!(line.ends_with('\n'));
        let fields: Vec<&str> = line.trim_end().split('\t').collect();
        assert_eq!(fields.len(), 8);
        assert_eq!(fields[0], "1.250000");
        assert_eq!(fields[1], "2.500000");
        assert_eq!(fields[2], "42");
        assert_eq!(fields[3], "up");
        assert_eq!(fields[4], "http");
        assert_eq!(fields[5], "GET / HTTP/1.1");
        assert_eq!(fields[6], hex::encode(b"Host: x\r\n"));
        assert_eq!(fields[7], hex::encode(b"hi"));
    }

    #[test]
    fn tabs_in_notes_become_spaces() {
        let (mut writer, buf) = capture_writer();
        writer
            .record(&TraceRecord {
                begin: 0.0,
                end: 0.0,
                conn_id: 1,
                direction: Direction::Down,
                state: "eof",
                notes: "a\tb\tc",
                headings: b"",
                body: b"",
            })
            .unwrap();

        let out = buf.borrow().clone();
        let line = String::from_utf8(out).unwrap();
        let fields: Vec<&str> = line.trim_end().split('\t').collect();
        assert_eq!(fields.len(), 8);
        assert_eq!(fields[5], "a b c");
        assert_eq!(fields[3], "down");
    }
}
