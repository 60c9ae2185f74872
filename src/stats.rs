use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use anyhow::Result;
use crossbeam::utils::CachePadded;
use log::warn;
use serde::Deserialize;
use serde::Serialize;

use crate::event::EventKind;
use crate::event::KIND_SLOTS;
use crate::fault::CaptureFault;
use crate::fault::CaptureResult;

/// Kinds whose records may legitimately be left behind when the root
/// thread finishes before the other threads have wound down.
pub const SKEW_TOLERANT: [EventKind; 2] = [EventKind::ThreadStart, EventKind::ThreadFinish];

struct Counters {
    by_kind: [AtomicU64; KIND_SLOTS],
}

impl Counters {
    fn new() -> Self {
        Counters {
            by_kind: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    fn bump(&self, kind: EventKind) {
        self.by_kind[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self, kind: EventKind) -> u64 {
        self.by_kind[kind as usize].load(Ordering::Relaxed)
    }

    fn total(&self) -> u64 {
        self.by_kind.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }
}

/// Per-kind event tallies. The producer and consumer sides live on separate
/// cache lines; producers bump `enqueued` under the queue lock, the drain
/// bumps `dequeued`.
pub struct TraceStats {
    enqueued: CachePadded<Counters>,
    dequeued: CachePadded<Counters>,
    undelivered: CachePadded<Counters>,
    region_boundaries: AtomicU64,
}

impl Default for TraceStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceStats {
    pub fn new() -> Self {
        TraceStats {
            enqueued: CachePadded::new(Counters::new()),
            dequeued: CachePadded::new(Counters::new()),
            undelivered: CachePadded::new(Counters::new()),
            region_boundaries: AtomicU64::new(0),
        }
    }

    pub fn record_enqueue(&self, kind: EventKind) {
        self.enqueued.bump(kind);
    }

    pub fn record_dequeue(&self, kind: EventKind) {
        self.dequeued.bump(kind);
    }

    /// Event that was enqueued or attempted after the drain stopped and so
    /// never reached the sink.
    pub fn record_undelivered(&self, kind: EventKind) {
        self.undelivered.bump(kind);
    }

    pub fn record_region_boundary(&self) {
        self.region_boundaries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn enqueued(&self, kind: EventKind) -> u64 {
        self.enqueued.get(kind)
    }

    pub fn dequeued(&self, kind: EventKind) -> u64 {
        self.dequeued.get(kind)
    }

    pub fn undelivered(&self, kind: EventKind) -> u64 {
        self.undelivered.get(kind)
    }

    /// Every enqueued event must have been written to the sink. The only
    /// exception is thread start/finish records left behind after the root
    /// thread finished; those are the shutdown skew and only produce a
    /// warning.
    pub fn verify(&self) -> CaptureResult<()> {
        for kind in EventKind::TRACEABLE {
            let (enq, deq, und) = (
                self.enqueued(kind),
                self.dequeued(kind),
                self.undelivered(kind),
            );
            if enq != deq + und || (und > 0 && !SKEW_TOLERANT.contains(&kind)) {
                return Err(CaptureFault::StatsMismatch {
                    kind,
                    enqueued: enq,
                    dequeued: deq,
                    undelivered: und,
                });
            }
            if und > 0 {
                warn!(
                    "{} {} events not delivered, enqueued after root thread finished",
                    und, kind
                );
            }
        }
        Ok(())
    }

    pub fn report(&self) -> StatsReport {
        let mut kinds = BTreeMap::new();
        for kind in EventKind::TRACEABLE {
            let tally = KindTally {
                enqueued: self.enqueued(kind),
                dequeued: self.dequeued(kind),
                undelivered: self.undelivered(kind),
            };
            if tally.enqueued > 0 || tally.dequeued > 0 {
                kinds.insert(kind.name().to_string(), tally);
            }
        }
        let memory_events = EventKind::TRACEABLE
            .iter()
            .filter(|k| k.is_memory())
            .map(|k| self.enqueued(*k))
            .sum();
        StatsReport {
            total_enqueued: self.enqueued.total(),
            total_dequeued: self.dequeued.total(),
            total_undelivered: self.undelivered.total(),
            memory_events,
            region_boundaries: self.region_boundaries.load(Ordering::Relaxed),
            kinds,
            collision: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KindTally {
    pub enqueued: u64,
    pub dequeued: u64,
    pub undelivered: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CollisionTally {
    pub waited: u64,
    pub checked: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StatsReport {
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub total_undelivered: u64,
    pub memory_events: u64,
    pub region_boundaries: u64,
    pub kinds: BTreeMap<String, KindTally>,
    pub collision: Option<CollisionTally>,
}

impl StatsReport {
    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(w, "[ENQUEUE] total events: {}", self.total_enqueued)?;
        writeln!(w, "[ENQUEUE] memory events: {}", self.memory_events)?;
        for (name, t) in self.kinds.iter() {
            writeln!(w, "[ENQUEUE] {}: {}", name, t.enqueued)?;
        }
        writeln!(w, "[DEQUEUE] total events: {}", self.total_dequeued)?;
        for (name, t) in self.kinds.iter() {
            writeln!(w, "[DEQUEUE] {}: {}", name, t.dequeued)?;
        }
        if self.total_undelivered > 0 {
            writeln!(w, "[UNDELIVERED] total events: {}", self.total_undelivered)?;
            for (name, t) in self.kinds.iter().filter(|(_, t)| t.undelivered > 0) {
                writeln!(w, "[UNDELIVERED] {}: {}", name, t.undelivered)?;
            }
        }
        writeln!(w, "[REGION] boundaries: {}", self.region_boundaries)?;
        if let Some(c) = &self.collision {
            writeln!(w, "[COLLISION] waited events: {}", c.waited)?;
            writeln!(w, "[COLLISION] checked events: {}", c.checked)?;
        }
        Ok(())
    }

    pub fn format_json<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(w, "{}", serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
