//! Fixed-layout binary trace format.
//!
//! Each event is one 43-byte record with no length prefix; framing is
//! implied by the record size. Multi-byte integers are big-endian:
//!
//! ```text
//! kind:1 semantics:1 tid:2 addr:8 size:4 stack:1 value:8 insns:4
//! line:2 file:2 routine:2 seq:4 prev_line:2 prev_file:2
//! ```

use std::io;
use std::io::Read;
use std::io::Write;

use static_assertions::const_assert_eq;

use crate::event::Event;
use crate::event::EventKind;
use crate::event::Semantics;
use crate::event::SiteInfo;
use crate::fault::CaptureFault;
use crate::fault::CaptureResult;
use crate::types::ThreadId;

pub const RECORD_SIZE: usize = 43;

const_assert_eq!(RECORD_SIZE, 1 + 1 + 2 + 8 + 4 + 1 + 8 + 4 + 2 + 2 + 2 + 4 + 2 + 2);

pub type Record = [u8; RECORD_SIZE];

struct Cursor<'a> {
    buf: &'a mut Record,
    at: usize,
}

impl Cursor<'_> {
    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.at..self.at + bytes.len()].copy_from_slice(bytes);
        self.at += bytes.len();
    }
}

pub fn encode(ev: &Event) -> Record {
    let mut buf = [0u8; RECORD_SIZE];
    let mut c = Cursor {
        buf: &mut buf,
        at: 0,
    };
    c.put(&[ev.kind().as_u8(), ev.semantics().as_u8()]);
    c.put(&ev.tid().0.to_be_bytes());
    c.put(&ev.addr().to_be_bytes());
    c.put(&ev.size().to_be_bytes());
    c.put(&[ev.is_stack() as u8]);
    c.put(&ev.value().to_be_bytes());
    c.put(&ev.insn_count().to_be_bytes());
    let site = ev.site();
    c.put(&site.line.to_be_bytes());
    c.put(&site.file.to_be_bytes());
    c.put(&site.routine.to_be_bytes());
    c.put(&ev.seq().to_be_bytes());
    c.put(&site.prev_line.to_be_bytes());
    c.put(&site.prev_file.to_be_bytes());
    debug_assert_eq!(c.at, RECORD_SIZE);
    buf
}

fn be16(rec: &Record, at: usize) -> u16 {
    u16::from_be_bytes([rec[at], rec[at + 1]])
}

fn be32(rec: &Record, at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&rec[at..at + 4]);
    u32::from_be_bytes(b)
}

fn be64(rec: &Record, at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&rec[at..at + 8]);
    u64::from_be_bytes(b)
}

/// Decode and validate one record.
pub fn decode(rec: &Record) -> CaptureResult<Event> {
    let kind = EventKind::from_u8(rec[0]).ok_or(CaptureFault::InvalidKind(rec[0]))?;
    let semantics = Semantics::from_u8(rec[1]).ok_or(CaptureFault::InvalidSemantics(rec[1]))?;
    let ev = Event {
        kind,
        semantics,
        tid: ThreadId(be16(rec, 2)),
        addr: be64(rec, 4),
        size: be32(rec, 12),
        stack: rec[16] != 0,
        value: be64(rec, 17),
        insn_count: be32(rec, 25),
        site: SiteInfo {
            line: be16(rec, 29),
            file: be16(rec, 31),
            routine: be16(rec, 33),
            prev_line: be16(rec, 39),
            prev_file: be16(rec, 41),
        },
        seq: be32(rec, 35),
    };
    ev.validate()?;
    Ok(ev)
}

/// Binary sink writer. Every record is flushed on its own so a reader on
/// the other end of a pipe sees events one at a time.
pub struct WireWriter<W: Write> {
    inner: W,
    records: u64,
}

impl<W: Write> WireWriter<W> {
    pub fn new(inner: W) -> Self {
        WireWriter { inner, records: 0 }
    }

    pub fn write_event(&mut self, ev: &Event) -> io::Result<()> {
        self.inner.write_all(&encode(ev))?;
        self.inner.flush()?;
        self.records += 1;
        Ok(())
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Diagnostic text trace, one line per event.
pub struct TextWriter<W: Write> {
    inner: W,
}

impl<W: Write> TextWriter<W> {
    pub fn new(inner: W) -> Self {
        TextWriter { inner }
    }

    pub fn write_event(&mut self, ev: &Event) -> io::Result<()> {
        writeln!(self.inner, "{}", ev)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Iterator over the records of a binary trace. A clean end of stream
/// ends the iteration; a partial trailing record is an error.
pub struct TraceReader<R: Read> {
    inner: R,
    done: bool,
}

impl<R: Read> TraceReader<R> {
    pub fn new(inner: R) -> Self {
        TraceReader { inner, done: false }
    }

    /// Read one raw record, `None` on clean EOF.
    pub fn next_record(&mut self) -> io::Result<Option<Record>> {
        let mut rec = [0u8; RECORD_SIZE];
        let mut filled = 0;
        while filled < RECORD_SIZE {
            match self.inner.read(&mut rec[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        match filled {
            0 => Ok(None),
            RECORD_SIZE => Ok(Some(rec)),
            n => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("truncated trace record: {} of {} bytes", n, RECORD_SIZE),
            )),
        }
    }
}

impl<R: Read> Iterator for TraceReader<R> {
    type Item = CaptureResult<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let res = match self.next_record() {
            Ok(Some(rec)) => decode(&rec),
            Ok(None) => {
                self.done = true;
                return None;
            }
            Err(e) => Err(CaptureFault::SinkIo(e)),
        };
        if res.is_err() {
            self.done = true;
        }
        Some(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_write() -> Event {
        let site = SiteInfo {
            line: 0x0102,
            file: 0x0304,
            routine: 0x0506,
            prev_line: 0x0708,
            prev_file: 0x090a,
        };
        let mut ev = Event::memory(
            EventKind::MemoryWrite,
            ThreadId(0x0a0b),
            0x1122334455667788,
            8,
            true,
            site,
        )
        .unwrap()
        .with_value(0x8877665544332211)
        .unwrap();
        ev.stamp(0xdeadbeef);
        ev
    }

    #[test]
    fn test_layout_is_big_endian() {
        let rec = encode(&sample_write());
        assert_eq!(rec[0], 8);
        assert_eq!(rec[1], 0);
        assert_eq!(&rec[2..4], &[0x0a, 0x0b]);
        assert_eq!(
            &rec[4..12],
            &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]
        );
        assert_eq!(&rec[12..16], &[0, 0, 0, 8]);
        assert_eq!(rec[16], 1);
        assert_eq!(
            &rec[17..25],
            &[0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
        assert_eq!(&rec[25..29], &[0, 0, 0, 0]);
        assert_eq!(&rec[29..35], &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert_eq!(&rec[35..39], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&rec[39..43], &[0x07, 0x08, 0x09, 0x0a]);
    }

    #[test]
    fn test_decode_reproduces_fields() {
        let ev = sample_write();
        assert_eq!(decode(&encode(&ev)).unwrap(), ev);

        let lock = Event::lock(EventKind::LockAcquire, Semantics::End, ThreadId(7), 0xabc).unwrap();
        let back = decode(&encode(&lock)).unwrap();
        assert_eq!(back.semantics(), Semantics::End);
        assert_eq!(back.addr(), 0xabc);
    }

    #[test]
    fn test_decode_rejects_bad_bytes() {
        let mut rec = encode(&sample_write());
        rec[0] = 23;
        assert!(matches!(decode(&rec), Err(CaptureFault::InvalidKind(23))));
        rec[0] = 0;
        assert!(matches!(decode(&rec), Err(CaptureFault::InvalidKind(0))));
        rec[0] = EventKind::MemoryWrite.as_u8();
        rec[1] = 5;
        assert!(matches!(decode(&rec), Err(CaptureFault::InvalidSemantics(5))));
    }

    #[test]
    fn test_writer_reader_stream() {
        let mut w = WireWriter::new(Vec::new());
        w.write_event(&Event::region(EventKind::RoiStart, ThreadId(0)).unwrap())
            .unwrap();
        w.write_event(&sample_write()).unwrap();
        assert_eq!(w.records(), 2);
        let bytes = w.into_inner();
        assert_eq!(bytes.len(), 2 * RECORD_SIZE);

        let events: Vec<Event> = TraceReader::new(&bytes[..])
            .collect::<CaptureResult<_>>()
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), EventKind::RoiStart);
        assert_eq!(events[1].value(), 0x8877665544332211);
    }

    #[test]
    fn test_truncated_trailing_record() {
        let mut bytes = encode(&sample_write()).to_vec();
        bytes.extend_from_slice(&[1, 0, 0]);
        let mut r = TraceReader::new(&bytes[..]);
        assert!(r.next().unwrap().is_ok());
        assert!(matches!(r.next(), Some(Err(CaptureFault::SinkIo(_)))));
        assert!(r.next().is_none());
    }

    #[test]
    fn test_text_writer() {
        let mut out = Vec::new();
        let mut t = TextWriter::new(&mut out);
        t.write_event(&Event::basic_block(ThreadId(1), 9)).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("seq=0 BASIC_BLOCK - tid=1"));
        assert!(text.ends_with('\n'));
    }
}
