//! Collision-analysis diagnostic mode.
//!
//! Given two source lines suspected of racing, a thread reaching the first
//! line parks its access in a shared waiting list and sleeps, widening the
//! window in which another thread can reach the second line. Accesses at
//! the second line are checked against everything parked: an overlapping
//! pair where at least one side writes, or whose kinds differ, is reported
//! as a data race. No trace events are produced in this mode.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use log::debug;
use log::error;

use crate::event::Event;
use crate::fault::CaptureFault;
use crate::fault::CaptureResult;
use crate::stats::CollisionTally;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollisionSites {
    /// Line whose accesses are parked.
    pub park_line: u16,
    /// Line whose accesses are checked against parked ones.
    pub check_line: u16,
    pub park_delay: Duration,
    pub check_delay: Duration,
}

pub struct CollisionAnalyzer {
    sites: CollisionSites,
    waiting: Mutex<Vec<Event>>,
    waited: AtomicU64,
    checked: AtomicU64,
}

impl CollisionAnalyzer {
    pub fn new(sites: CollisionSites) -> Self {
        CollisionAnalyzer {
            sites,
            waiting: Mutex::new(Vec::new()),
            waited: AtomicU64::new(0),
            checked: AtomicU64::new(0),
        }
    }

    fn conflicts(parked: &Event, ev: &Event) -> bool {
        (parked.kind() != ev.kind() || ev.kind().is_write()) && parked.overlaps(ev)
    }

    pub fn observe(&self, ev: &Event) -> CaptureResult<()> {
        let site = ev.site();
        if site.line == 0 || site.file == 0 {
            return Ok(());
        }

        if site.line == self.sites.check_line {
            self.checked.fetch_add(1, Ordering::Relaxed);
            let waiting = self.waiting.lock().unwrap();
            let hit = waiting
                .iter()
                .find(|p| p.tid() != ev.tid() && Self::conflicts(p, ev));
            if let Some(p) = hit {
                error!("Data race:\n  previous: {}\n  current:  {}", p, ev);
                return Err(CaptureFault::DataRace {
                    addr: ev.addr(),
                    first: (p.tid(), p.kind()),
                    second: (ev.tid(), ev.kind()),
                });
            }
            drop(waiting);
            if !self.sites.check_delay.is_zero() {
                thread::sleep(self.sites.check_delay);
            }
        }

        if site.line == self.sites.park_line {
            self.waiting.lock().unwrap().push(ev.clone());
            self.waited.fetch_add(1, Ordering::Relaxed);
            debug!("parked {}", ev);
            thread::yield_now();
            thread::sleep(self.sites.park_delay);
            let mut waiting = self.waiting.lock().unwrap();
            if let Some(pos) = waiting.iter().position(|p| p.tid() == ev.tid()) {
                waiting.remove(pos);
            }
        }
        Ok(())
    }

    pub fn parked(&self) -> usize {
        self.waiting.lock().unwrap().len()
    }

    pub fn tally(&self) -> CollisionTally {
        CollisionTally {
            waited: self.waited.load(Ordering::Relaxed),
            checked: self.checked.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::event::EventKind;
    use crate::event::SiteInfo;
    use crate::types::ThreadId;

    fn access(kind: EventKind, tid: u16, addr: u64, line: u16) -> Event {
        let site = SiteInfo {
            line,
            file: 1,
            ..SiteInfo::default()
        };
        Event::memory(kind, ThreadId(tid), addr, 8, false, site).unwrap()
    }

    fn sites(delay_ms: u64) -> CollisionSites {
        CollisionSites {
            park_line: 10,
            check_line: 20,
            park_delay: Duration::from_millis(delay_ms),
            check_delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_uninteresting_access_passes() {
        let ca = CollisionAnalyzer::new(sites(1));
        ca.observe(&access(EventKind::MemoryWrite, 0, 0x10, 5)).unwrap();
        ca.observe(&access(EventKind::MemoryWrite, 0, 0x10, 0)).unwrap();
        assert_eq!(ca.tally(), CollisionTally::default());
    }

    #[test]
    fn test_park_then_release() {
        let ca = CollisionAnalyzer::new(sites(1));
        ca.observe(&access(EventKind::MemoryRead, 0, 0x10, 10)).unwrap();
        assert_eq!(ca.parked(), 0);
        assert_eq!(ca.tally().waited, 1);
    }

    #[test]
    fn test_detects_write_against_parked_read() {
        let analyzer = CollisionAnalyzer::new(sites(300));
        let ca = &analyzer;
        let (tx, rx) = mpsc::channel();
        let res = crossbeam::thread::scope(|s| {
            s.spawn(move |_| {
                tx.send(()).unwrap();
                ca.observe(&access(EventKind::MemoryRead, 1, 0x100, 10))
                    .unwrap();
            });
            rx.recv().unwrap();
            while ca.parked() == 0 {
                thread::yield_now();
            }
            ca.observe(&access(EventKind::MemoryWrite, 2, 0x104, 20))
        })
        .unwrap();
        assert!(matches!(
            res,
            Err(CaptureFault::DataRace {
                first: (ThreadId(1), EventKind::MemoryRead),
                second: (ThreadId(2), EventKind::MemoryWrite),
                ..
            })
        ));
    }

    #[test]
    fn test_read_read_is_not_a_race() {
        let ca = CollisionAnalyzer::new(sites(0));
        ca.waiting
            .lock()
            .unwrap()
            .push(access(EventKind::MemoryRead, 1, 0x100, 10));
        ca.observe(&access(EventKind::MemoryRead, 2, 0x100, 20))
            .unwrap();
        ca.observe(&access(EventKind::MemoryWrite, 2, 0x200, 20))
            .unwrap();
        assert_eq!(ca.tally().checked, 2);
    }
}
