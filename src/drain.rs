//! The drain thread: the single consumer of the event queue.

use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use log::debug;
use log::info;
use log::trace;
use log::warn;

use crate::event::Event;
use crate::event::EventKind;
use crate::fault::CaptureFault;
use crate::fault::CaptureResult;
use crate::queue::EventQueue;
use crate::sink::Sink;
use crate::stats::TraceStats;
use crate::types::SeqId;
use crate::types::ThreadId;
use crate::wire::TextWriter;
use crate::wire::WireWriter;

pub type TextMirror = TextWriter<Box<dyn Write + Send>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub written: u64,
    pub root_finished: bool,
    /// Sequence id of the last event written.
    pub last_seq: SeqId,
}

pub struct Drainer {
    handle: JoinHandle<CaptureResult<DrainSummary>>,
}

struct DrainLoop {
    queue: Arc<EventQueue>,
    sink: WireWriter<Sink>,
    text: Option<TextMirror>,
    stats: Arc<TraceStats>,
    root: ThreadId,
}

impl DrainLoop {
    fn is_root_finish(&self, ev: &Event) -> bool {
        ev.kind() == EventKind::ThreadFinish && ev.tid() == self.root
    }

    fn forward(&mut self, ev: &Event) -> CaptureResult<()> {
        ev.validate()?;
        trace!("deq {}", ev);
        self.sink.write_event(ev)?;
        if let Some(text) = self.text.as_mut() {
            text.write_event(ev)?;
        }
        self.stats.record_dequeue(ev.kind());
        Ok(())
    }

    fn run(&mut self) -> CaptureResult<DrainSummary> {
        let mut summary = DrainSummary::default();
        while let Some(ev) = self.queue.pop() {
            self.queue.check_bound()?;
            self.forward(&ev)?;
            summary.written += 1;
            summary.last_seq = ev.seq();
            if self.is_root_finish(&ev) {
                summary.root_finished = true;
                break;
            }
        }
        self.sink.flush()?;
        if let Some(text) = self.text.as_mut() {
            text.flush()?;
        }
        Ok(summary)
    }
}

impl Drainer {
    pub fn spawn(
        queue: Arc<EventQueue>,
        sink: Sink,
        text: Option<TextMirror>,
        stats: Arc<TraceStats>,
        root: ThreadId,
    ) -> CaptureResult<Self> {
        let mut lp = DrainLoop {
            queue,
            sink: WireWriter::new(sink),
            text,
            stats,
            root,
        };
        let handle = thread::Builder::new()
            .name("trace-drain".into())
            .spawn(move || {
                let res = lp.run();
                // Nothing will be popped anymore; stop producers from
                // blocking on a full queue.
                lp.queue.close();
                match &res {
                    Ok(s) if s.root_finished => {
                        info!("Root thread finished, drain wrote {} events", s.written)
                    }
                    Ok(s) => debug!("Queue closed, drain wrote {} events", s.written),
                    Err(e) => warn!("Drain stopped: {}", e),
                }
                res
            })?;
        Ok(Drainer { handle })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> CaptureResult<DrainSummary> {
        self.handle.join().map_err(|_| {
            CaptureFault::SinkIo(std::io::Error::new(
                std::io::ErrorKind::Other,
                "drain thread panicked",
            ))
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Semantics;
    use crate::sink::SharedBuffer;
    use crate::wire::TraceReader;

    fn setup(cap: usize) -> (Arc<EventQueue>, Arc<TraceStats>, SharedBuffer) {
        (
            Arc::new(EventQueue::with_capacity(cap)),
            Arc::new(TraceStats::new()),
            SharedBuffer::new(),
        )
    }

    fn thread_ev(kind: EventKind, tid: u16) -> Event {
        Event::thread(kind, Semantics::End, ThreadId(tid)).unwrap()
    }

    #[test]
    fn test_stops_on_root_finish() {
        let (q, stats, buf) = setup(16);
        q.push(thread_ev(EventKind::ThreadStart, 0)).unwrap();
        q.push(thread_ev(EventKind::ThreadFinish, 3)).unwrap();
        q.push(thread_ev(EventKind::ThreadFinish, 0)).unwrap();
        q.push(Event::basic_block(ThreadId(3), 5)).unwrap();

        let d = Drainer::spawn(
            q.clone(),
            Box::new(buf.clone()),
            None,
            stats.clone(),
            ThreadId(0),
        )
        .unwrap();
        let summary = d.join().unwrap();
        assert!(summary.root_finished);
        assert_eq!(summary.written, 3);
        assert_eq!(summary.last_seq, 3);
        // The late basic block stays behind and the queue is closed.
        assert_eq!(q.len(), 1);
        assert!(q.is_closed());
        assert_eq!(stats.dequeued(EventKind::ThreadFinish), 2);
        assert_eq!(stats.dequeued(EventKind::BasicBlock), 0);

        let events: Vec<Event> = TraceReader::new(&buf.contents()[..])
            .collect::<CaptureResult<_>>()
            .unwrap();
        let seqs: Vec<u32> = events.iter().map(|e| e.seq()).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_rejects_reserved_kind() {
        let (q, stats, buf) = setup(4);
        let mut ev = Event::basic_block(ThreadId(1), 1);
        ev.kind = EventKind::Invalid;
        q.push(ev).unwrap();
        let d = Drainer::spawn(q.clone(), Box::new(buf.clone()), None, stats, ThreadId(0))
            .unwrap();
        assert!(matches!(d.join(), Err(CaptureFault::InvalidKind(0))));
        assert!(buf.contents().is_empty());
        assert!(q.is_closed());
    }

    #[test]
    fn test_text_mirror_and_close() {
        let (q, stats, buf) = setup(4);
        let text_buf = SharedBuffer::new();
        let mirror: TextMirror = TextWriter::new(Box::new(text_buf.clone()));
        let d = Drainer::spawn(q.clone(), Box::new(buf), Some(mirror), stats, ThreadId(0))
            .unwrap();
        q.push(Event::region(EventKind::RoiStart, ThreadId(0)).unwrap())
            .unwrap();
        q.push(Event::region(EventKind::RoiEnd, ThreadId(0)).unwrap())
            .unwrap();
        while q.len() > 0 {
            thread::yield_now();
        }
        q.close();
        let summary = d.join().unwrap();
        assert!(!summary.root_finished);
        assert_eq!(summary.written, 2);
        let text = String::from_utf8(text_buf.contents()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("ROI_START"));
        assert!(lines[1].contains("ROI_END"));
    }
}
