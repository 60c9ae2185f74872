//! End-to-end capture scenarios: callbacks in, decoded trace out.

use std::io;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use tracefront::lockstep::Channel;
use tracefront::*;

mod common;

use common::MEM_BASE;

fn site(line: u16) -> CodeSite {
    CodeSite {
        line,
        file: 1,
        routine: 1,
    }
}

#[test]
fn region_start_and_end_reach_sink_in_order() {
    let (capture, sink, _mem) = common::start(Config::default(), None);
    let ctx = ThreadContext::new(ThreadId(0));
    capture.roi_start(&ctx).unwrap();
    capture.roi_end(&ctx).unwrap();
    let report = capture.finish().unwrap();

    let events = common::decode_all(&sink);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind(), EventKind::RoiStart);
    assert_eq!(events[1].kind(), EventKind::RoiEnd);
    assert_eq!(events[0].tid(), events[1].tid());
    assert_eq!((events[0].seq(), events[1].seq()), (1, 2));
    assert_eq!(report.total_enqueued, 2);
    assert_eq!(report.total_dequeued, 2);
}

#[test]
fn write_event_carries_post_store_value() {
    let (capture, sink, mem) = common::start(Config::default(), None);
    let mut ctx = ThreadContext::new(ThreadId(0));
    let addr = MEM_BASE + 0x40;
    mem.store(addr, &0xdeadu64.to_ne_bytes());

    capture
        .before_write(
            &mut ctx,
            Access {
                addr,
                size: 8,
                stack: false,
                atomic: false,
            },
        )
        .unwrap();
    mem.store(addr, &0x1122334455667788u64.to_ne_bytes());
    capture.after_write(&mut ctx, 8, site(12)).unwrap();
    capture.finish().unwrap();

    let events = common::decode_all(&sink);
    assert_eq!(events.len(), 1);
    let ev = &events[0];
    assert_eq!(ev.kind(), EventKind::MemoryWrite);
    assert_eq!(ev.size(), 8);
    assert_eq!(ev.addr(), addr);
    assert_eq!(ev.value(), 0x1122334455667788);
}

#[test]
fn wide_vector_write_is_split() {
    let (capture, sink, mem) = common::start(Config::default(), None);
    let mut ctx = ThreadContext::new(ThreadId(2));
    let addr = MEM_BASE + 0x100;
    let slices = [
        0x0101010101010101u64,
        0x0202020202020202,
        0x0303030303030303,
        0x0404040404040404,
    ];

    capture
        .before_write(
            &mut ctx,
            Access {
                addr,
                size: 32,
                stack: true,
                atomic: false,
            },
        )
        .unwrap();
    for (k, v) in slices.iter().enumerate() {
        mem.store(addr + 8 * k as u64, &v.to_ne_bytes());
    }
    capture.after_write(&mut ctx, 32, site(7)).unwrap();
    capture.finish().unwrap();

    let events = common::decode_all(&sink);
    assert_eq!(events.len(), 4);
    for (k, ev) in events.iter().enumerate() {
        assert_eq!(ev.kind(), EventKind::MemoryWrite);
        assert_eq!(ev.addr(), addr + 8 * k as u64);
        assert_eq!(ev.size(), 8);
        assert_eq!(ev.value(), slices[k]);
        assert!(ev.is_stack());
    }
}

#[test]
fn lockstep_blocks_until_every_backend_acks() {
    let (mut backend, frontend) = UnixStream::pair().unwrap();
    let mut channels: Vec<Channel> = (0..8).map(|_| Box::new(io::empty()) as Channel).collect();
    channels[7] = Box::new(frontend);
    let config = Config {
        lockstep: true,
        backends: 3,
        ..Config::default()
    };
    let (capture, sink, _mem) = common::start(config, Some(LockstepSync::new(3, channels)));
    let released = AtomicBool::new(false);

    crossbeam::thread::scope(|s| {
        let producer = s.spawn(|_| {
            let mut ctx = ThreadContext::new(ThreadId(7));
            capture.before_lock_acquire(&mut ctx, 0xabc0).unwrap();
            released.store(true, Ordering::SeqCst);
            ctx
        });

        thread::sleep(Duration::from_millis(100));
        assert!(!released.load(Ordering::SeqCst));
        // The boundary event is already in the trace while the thread waits.
        while capture.stats().dequeued(EventKind::LockAcquire) == 0 {
            thread::yield_now();
        }

        backend.write_all(&7u16.to_be_bytes()).unwrap();
        backend.write_all(&7u16.to_be_bytes()).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(!released.load(Ordering::SeqCst));

        backend.write_all(&7u16.to_be_bytes()).unwrap();
        let ctx = producer.join().unwrap();
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(ctx.held_locks(), 1);
    })
    .unwrap();

    let report = capture.finish().unwrap();
    assert_eq!(report.region_boundaries, 1);
    let events = common::decode_all(&sink);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind(), EventKind::LockAcquire);
    assert_eq!(events[0].semantics(), Semantics::End);
    assert_eq!(events[0].tid(), ThreadId(7));
    assert_eq!(events[0].addr(), 0xabc0);
}

#[test]
fn pausing_backends_are_not_awaited_at_release() {
    // No acknowledgments are ever sent; only the acquire may block.
    let channels: Vec<Channel> = vec![Box::new(io::Cursor::new(vec![0u8, 0]))];
    let config = Config {
        lockstep: true,
        pausing: true,
        backends: 1,
        ..Config::default()
    };
    let (capture, sink, _mem) = common::start(config, Some(LockstepSync::new(1, channels)));
    let mut ctx = ThreadContext::new(ThreadId(0));
    capture.before_lock_acquire(&mut ctx, 0x10).unwrap();
    capture.after_lock_acquire(&mut ctx, 0x10).unwrap();
    capture.before_lock_release(&mut ctx, 0x10).unwrap();
    capture.before_thread_spawn(&mut ctx).unwrap();
    capture.after_join(&mut ctx).unwrap();
    capture.thread_end(ctx).unwrap();
    let report = capture.finish().unwrap();
    // The release is still a region boundary, just not waited on.
    assert_eq!(report.region_boundaries, 2);

    let kinds: Vec<(EventKind, Semantics)> = common::decode_all(&sink)
        .iter()
        .map(|e| (e.kind(), e.semantics()))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (EventKind::LockAcquire, Semantics::End),
            (EventKind::LockAcquire, Semantics::Begin),
            (EventKind::LockRelease, Semantics::End),
            (EventKind::ThreadSpawn, Semantics::End),
            (EventKind::ThreadJoin, Semantics::End),
            (EventKind::ThreadFinish, Semantics::End),
        ]
    );
}
