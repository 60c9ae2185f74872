// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Bounded multi-producer, single-consumer event queue.
//!
//! Producers are the instrumented application threads; the consumer is the
//! drain thread. The queue mutex also guards the sequence counter, so the
//! order in which events are stamped is exactly the order in which they are
//! popped.
//!
//! Back-pressure is a blocking wait: a producer facing a full queue sleeps
//! on `not_full` until the drain makes room, and the drain sleeps on
//! `not_empty` while there is nothing to do. Closing the queue wakes
//! everybody; pushes after close hand the event back to the caller.

use std::collections::VecDeque;
use std::sync::Condvar;
use std::sync::Mutex;

use log::trace;

use crate::event::Event;
use crate::fault::CaptureFault;
use crate::fault::CaptureResult;
use crate::types::SeqId;

pub const DEFAULT_QUEUE_CAPACITY: usize = 100_000;

struct QueueState {
    events: VecDeque<Event>,
    /// Last sequence id handed out; the first event gets 1.
    last_seq: SeqId,
    closed: bool,
}

pub struct EventQueue {
    mu: Mutex<QueueState>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
}

impl EventQueue {
    /// # Panics
    /// Panics if `capacity` is 0.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "event queue needs at least one slot");
        EventQueue {
            mu: Mutex::new(QueueState {
                events: VecDeque::with_capacity(capacity.min(DEFAULT_QUEUE_CAPACITY)),
                last_seq: 0,
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Stamp `event` with the next sequence id and append it, waiting for
    /// room if the queue is full. Returns the event unchanged if the queue
    /// has been closed.
    pub fn push(&self, mut event: Event) -> Result<SeqId, Event> {
        let mut state = self.mu.lock().unwrap();
        while state.events.len() >= self.capacity && !state.closed {
            state = self.not_full.wait(state).unwrap();
        }
        if state.closed {
            return Err(event);
        }
        state.last_seq = state.last_seq.wrapping_add(1);
        let seq = state.last_seq;
        event.stamp(seq);
        trace!("enq {}", event);
        state.events.push_back(event);
        drop(state);
        self.not_empty.notify_one();
        Ok(seq)
    }

    /// Take the oldest event, waiting while the queue is empty. `None`
    /// once the queue is closed and fully drained.
    pub fn pop(&self) -> Option<Event> {
        let mut state = self.mu.lock().unwrap();
        while state.events.is_empty() && !state.closed {
            state = self.not_empty.wait(state).unwrap();
        }
        let event = state.events.pop_front();
        drop(state);
        if event.is_some() {
            self.not_full.notify_one();
        }
        event
    }

    pub fn try_pop(&self) -> Option<Event> {
        let event = self.mu.lock().unwrap().events.pop_front();
        if event.is_some() {
            self.not_full.notify_one();
        }
        event
    }

    /// Refuse further pushes and wake every waiter.
    pub fn close(&self) {
        self.mu.lock().unwrap().closed = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.mu.lock().unwrap().closed
    }

    /// Remove everything still queued, oldest first.
    pub fn drain_remaining(&self) -> Vec<Event> {
        let events: Vec<Event> = self.mu.lock().unwrap().events.drain(..).collect();
        self.not_full.notify_all();
        events
    }

    pub fn len(&self) -> usize {
        self.mu.lock().unwrap().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sequence id of the most recently pushed event, 0 if none.
    pub fn last_seq(&self) -> SeqId {
        self.mu.lock().unwrap().last_seq
    }

    pub fn check_bound(&self) -> CaptureResult<()> {
        let len = self.len();
        if len > self.capacity {
            return Err(CaptureFault::QueueOverflow {
                len,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::types::ThreadId;

    fn bb(tid: u16, insns: u32) -> Event {
        Event::basic_block(ThreadId(tid), insns)
    }

    #[test]
    fn test_fifo_and_sequence() {
        let q = EventQueue::with_capacity(8);
        assert_eq!(q.push(bb(0, 10)).unwrap(), 1);
        assert_eq!(q.push(bb(0, 20)).unwrap(), 2);
        assert_eq!(q.push(bb(1, 30)).unwrap(), 3);
        assert_eq!(q.len(), 3);

        let a = q.pop().unwrap();
        let b = q.pop().unwrap();
        let c = q.pop().unwrap();
        assert_eq!((a.seq(), a.insn_count()), (1, 10));
        assert_eq!((b.seq(), b.insn_count()), (2, 20));
        assert_eq!((c.seq(), c.insn_count()), (3, 30));
        assert!(q.try_pop().is_none());
        assert_eq!(q.last_seq(), 3);
    }

    #[test]
    fn test_close_refuses_push_and_unblocks_pop() {
        let q = EventQueue::with_capacity(2);
        q.push(bb(0, 1)).unwrap();
        q.close();
        let rejected = q.push(bb(0, 2)).unwrap_err();
        assert_eq!(rejected.insn_count(), 2);
        assert_eq!(rejected.seq(), 0);
        // Already queued events are still delivered after close.
        assert_eq!(q.pop().unwrap().insn_count(), 1);
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_drain_remaining() {
        let q = EventQueue::with_capacity(4);
        for i in 0..3 {
            q.push(bb(0, i)).unwrap();
        }
        let rest = q.drain_remaining();
        assert_eq!(rest.len(), 3);
        assert!(q.is_empty());
        assert!(q.check_bound().is_ok());
    }

    #[test]
    fn test_concurrent_producers_keep_order() {
        let q = EventQueue::with_capacity(16);
        let popped = crossbeam::thread::scope(|s| {
            for tid in 0..4u16 {
                let q = &q;
                s.spawn(move |_| {
                    for i in 0..250 {
                        q.push(bb(tid, i)).unwrap();
                    }
                });
            }
            let consumer = s.spawn(|_| {
                let mut seen = Vec::new();
                while seen.len() < 1000 {
                    let ev = q.pop().unwrap();
                    assert!(q.len() <= q.capacity());
                    seen.push(ev);
                }
                seen
            });
            consumer.join().unwrap()
        })
        .unwrap();

        assert!(popped.windows(2).all(|w| w[0].seq() < w[1].seq()));
        // Per-producer program order survives the merge.
        for tid in 0..4u16 {
            let mine: Vec<u32> = popped
                .iter()
                .filter(|e| e.tid() == ThreadId(tid))
                .map(|e| e.insn_count())
                .collect();
            assert_eq!(mine, (0..250).collect::<Vec<_>>());
        }
        assert!(popped.iter().all(|e| e.kind() == EventKind::BasicBlock));
    }
}
