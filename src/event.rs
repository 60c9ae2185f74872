//! Event model.
//!
//! An [`Event`] describes one traced occurrence on one monitored thread. It
//! can only be built through the kind-specific constructors below, each of
//! which rejects kinds outside its sanctioned set, so every event that
//! reaches the queue satisfies the kind/semantics invariant checked by
//! [`Event::validate`]. After construction the only field that may change
//! is the datum snapshot of a memory event ([`Event::with_value`]); the
//! queue stamps the sequence id on the way in.

use std::fmt;

use serde::Serialize;

use crate::fault::CaptureFault;
use crate::fault::CaptureResult;
use crate::types::SeqId;
use crate::types::ThreadId;

/// Event tag. Discriminants are the wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum EventKind {
    Invalid = 0,
    RoiStart = 1,
    RoiEnd = 2,
    ThreadStart = 3,
    ThreadFinish = 4,
    ThreadBlocked = 5,
    ThreadUnblocked = 6,
    MemoryRead = 7,
    MemoryWrite = 8,
    MemoryAlloc = 9,
    MemoryFree = 10,
    BasicBlock = 11,
    LockAcquire = 12,
    LockRelease = 13,
    ThreadJoin = 14,
    ThreadSpawn = 15,
    IgnoreConflictsBegin = 16,
    IgnoreConflictsEnd = 17,
    AtomicRead = 18,
    AtomicWrite = 19,
    LockAcqRead = 20,
    LockAcqWrite = 21,
    LockRelWrite = 22,
    // 23 and 24 are the REG_BEGIN/REG_END semantics codes.
    ServerRoiStart = 25,
    ServerRoiEnd = 26,
    TransStart = 27,
    TransEnd = 28,
    CheckPoint = 29,
}

/// Number of slots needed to index per-kind tables by wire code.
pub const KIND_SLOTS: usize = EventKind::CheckPoint as usize + 1;

impl EventKind {
    /// Every kind that may legally appear in a trace, in wire-code order.
    pub const TRACEABLE: [EventKind; 25] = [
        EventKind::RoiStart,
        EventKind::RoiEnd,
        EventKind::ThreadStart,
        EventKind::ThreadFinish,
        EventKind::MemoryRead,
        EventKind::MemoryWrite,
        EventKind::MemoryAlloc,
        EventKind::MemoryFree,
        EventKind::BasicBlock,
        EventKind::LockAcquire,
        EventKind::LockRelease,
        EventKind::ThreadJoin,
        EventKind::ThreadSpawn,
        EventKind::IgnoreConflictsBegin,
        EventKind::IgnoreConflictsEnd,
        EventKind::AtomicRead,
        EventKind::AtomicWrite,
        EventKind::LockAcqRead,
        EventKind::LockAcqWrite,
        EventKind::LockRelWrite,
        EventKind::ServerRoiStart,
        EventKind::ServerRoiEnd,
        EventKind::TransStart,
        EventKind::TransEnd,
        EventKind::CheckPoint,
    ];

    pub fn from_u8(raw: u8) -> Option<EventKind> {
        let kind = match raw {
            0 => EventKind::Invalid,
            1 => EventKind::RoiStart,
            2 => EventKind::RoiEnd,
            3 => EventKind::ThreadStart,
            4 => EventKind::ThreadFinish,
            5 => EventKind::ThreadBlocked,
            6 => EventKind::ThreadUnblocked,
            7 => EventKind::MemoryRead,
            8 => EventKind::MemoryWrite,
            9 => EventKind::MemoryAlloc,
            10 => EventKind::MemoryFree,
            11 => EventKind::BasicBlock,
            12 => EventKind::LockAcquire,
            13 => EventKind::LockRelease,
            14 => EventKind::ThreadJoin,
            15 => EventKind::ThreadSpawn,
            16 => EventKind::IgnoreConflictsBegin,
            17 => EventKind::IgnoreConflictsEnd,
            18 => EventKind::AtomicRead,
            19 => EventKind::AtomicWrite,
            20 => EventKind::LockAcqRead,
            21 => EventKind::LockAcqWrite,
            22 => EventKind::LockRelWrite,
            25 => EventKind::ServerRoiStart,
            26 => EventKind::ServerRoiEnd,
            27 => EventKind::TransStart,
            28 => EventKind::TransEnd,
            29 => EventKind::CheckPoint,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            EventKind::Invalid => "INVALID",
            EventKind::RoiStart => "ROI_START",
            EventKind::RoiEnd => "ROI_END",
            EventKind::ThreadStart => "THREAD_START",
            EventKind::ThreadFinish => "THREAD_FINISH",
            EventKind::ThreadBlocked => "THREAD_BLOCKED",
            EventKind::ThreadUnblocked => "THREAD_UNBLOCKED",
            EventKind::MemoryRead => "MEMORY_READ",
            EventKind::MemoryWrite => "MEMORY_WRITE",
            EventKind::MemoryAlloc => "MEMORY_ALLOC",
            EventKind::MemoryFree => "MEMORY_FREE",
            EventKind::BasicBlock => "BASIC_BLOCK",
            EventKind::LockAcquire => "LOCK_ACQUIRE",
            EventKind::LockRelease => "LOCK_RELEASE",
            EventKind::ThreadJoin => "THREAD_JOIN",
            EventKind::ThreadSpawn => "THREAD_SPAWN",
            EventKind::IgnoreConflictsBegin => "IGNORE_CONFLICTS_BEGIN",
            EventKind::IgnoreConflictsEnd => "IGNORE_CONFLICTS_END",
            EventKind::AtomicRead => "ATOMIC_READ",
            EventKind::AtomicWrite => "ATOMIC_WRITE",
            EventKind::LockAcqRead => "LOCK_ACQ_READ",
            EventKind::LockAcqWrite => "LOCK_ACQ_WRITE",
            EventKind::LockRelWrite => "LOCK_REL_WRITE",
            EventKind::ServerRoiStart => "SERVER_ROI_START",
            EventKind::ServerRoiEnd => "SERVER_ROI_END",
            EventKind::TransStart => "TRANS_START",
            EventKind::TransEnd => "TRANS_END",
            EventKind::CheckPoint => "CHECK_POINT",
        }
    }

    /// Kinds reserved on the wire that the capture layer never emits.
    pub fn is_reserved(self) -> bool {
        matches!(
            self,
            EventKind::Invalid | EventKind::ThreadBlocked | EventKind::ThreadUnblocked
        )
    }

    pub fn is_memory(self) -> bool {
        matches!(
            self,
            EventKind::MemoryRead
                | EventKind::MemoryWrite
                | EventKind::AtomicRead
                | EventKind::AtomicWrite
        )
    }

    pub fn is_write(self) -> bool {
        matches!(self, EventKind::MemoryWrite | EventKind::AtomicWrite)
    }

    /// Paired boundary kinds, the only ones that carry BEGIN/END semantics.
    pub fn is_paired(self) -> bool {
        matches!(
            self,
            EventKind::ThreadStart
                | EventKind::ThreadFinish
                | EventKind::ThreadJoin
                | EventKind::ThreadSpawn
                | EventKind::IgnoreConflictsBegin
                | EventKind::IgnoreConflictsEnd
                | EventKind::LockAcquire
                | EventKind::LockRelease
        )
    }

    fn is_region_marker(self) -> bool {
        matches!(
            self,
            EventKind::RoiStart
                | EventKind::RoiEnd
                | EventKind::ServerRoiStart
                | EventKind::ServerRoiEnd
                | EventKind::TransStart
                | EventKind::TransEnd
                | EventKind::CheckPoint
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Region semantics of a paired boundary event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Semantics {
    #[default]
    None,
    Begin,
    End,
}

impl Semantics {
    pub fn from_u8(raw: u8) -> Option<Semantics> {
        match raw {
            0 => Some(Semantics::None),
            23 => Some(Semantics::Begin),
            24 => Some(Semantics::End),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Semantics::None => 0,
            Semantics::Begin => 23,
            Semantics::End => 24,
        }
    }
}

/// Source-site annotation. Indices refer to the site index tables; 0 means
/// unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SiteInfo {
    pub line: u16,
    pub file: u16,
    pub routine: u16,
    pub prev_line: u16,
    pub prev_file: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub(crate) kind: EventKind,
    pub(crate) semantics: Semantics,
    pub(crate) tid: ThreadId,
    pub(crate) addr: u64,
    pub(crate) size: u32,
    pub(crate) stack: bool,
    pub(crate) value: u64,
    pub(crate) insn_count: u32,
    pub(crate) site: SiteInfo,
    pub(crate) seq: SeqId,
}

/// Operand widths a single memory event may carry.
pub const EVENT_OPERAND_SIZES: [u32; 5] = [0, 1, 2, 4, 8];

impl Event {
    fn bare(kind: EventKind, semantics: Semantics, tid: ThreadId) -> Self {
        Event {
            kind,
            semantics,
            tid,
            addr: 0,
            size: 0,
            stack: false,
            value: 0,
            insn_count: 0,
            site: SiteInfo::default(),
            seq: 0,
        }
    }

    fn require(
        constructor: &'static str,
        kind: EventKind,
        allowed: &[EventKind],
    ) -> CaptureResult<()> {
        if allowed.contains(&kind) {
            Ok(())
        } else {
            Err(CaptureFault::KindMismatch { constructor, kind })
        }
    }

    fn require_boundary(kind: EventKind, semantics: Semantics) -> CaptureResult<()> {
        if semantics == Semantics::None {
            return Err(CaptureFault::SemanticsMismatch { kind, semantics });
        }
        Ok(())
    }

    /// Region marker: ROI, server ROI, transaction or checkpoint.
    pub fn region(kind: EventKind, tid: ThreadId) -> CaptureResult<Self> {
        if !kind.is_region_marker() {
            return Err(CaptureFault::KindMismatch {
                constructor: "region",
                kind,
            });
        }
        Ok(Self::bare(kind, Semantics::None, tid))
    }

    pub fn thread(kind: EventKind, semantics: Semantics, tid: ThreadId) -> CaptureResult<Self> {
        Self::require(
            "thread",
            kind,
            &[
                EventKind::ThreadStart,
                EventKind::ThreadFinish,
                EventKind::ThreadJoin,
                EventKind::ThreadSpawn,
                EventKind::IgnoreConflictsBegin,
                EventKind::IgnoreConflictsEnd,
            ],
        )?;
        Self::require_boundary(kind, semantics)?;
        Ok(Self::bare(kind, semantics, tid))
    }

    pub fn lock(
        kind: EventKind,
        semantics: Semantics,
        tid: ThreadId,
        lock_addr: u64,
    ) -> CaptureResult<Self> {
        Self::require("lock", kind, &[EventKind::LockAcquire, EventKind::LockRelease])?;
        Self::require_boundary(kind, semantics)?;
        let mut ev = Self::bare(kind, semantics, tid);
        ev.addr = lock_addr;
        Ok(ev)
    }

    pub fn basic_block(tid: ThreadId, insn_count: u32) -> Self {
        let mut ev = Self::bare(EventKind::BasicBlock, Semantics::None, tid);
        ev.insn_count = insn_count;
        ev
    }

    /// Access to the lock word itself by a reader/writer lock primitive.
    pub fn lock_access(kind: EventKind, tid: ThreadId, addr: u64) -> CaptureResult<Self> {
        Self::require(
            "lock access",
            kind,
            &[
                EventKind::LockAcqRead,
                EventKind::LockAcqWrite,
                EventKind::LockRelWrite,
            ],
        )?;
        let mut ev = Self::bare(kind, Semantics::None, tid);
        ev.addr = addr;
        Ok(ev)
    }

    /// Memory access of at most 8 bytes. Wider operands are split by the
    /// capture layer before they get here.
    pub fn memory(
        kind: EventKind,
        tid: ThreadId,
        addr: u64,
        size: u32,
        stack: bool,
        site: SiteInfo,
    ) -> CaptureResult<Self> {
        if !kind.is_memory() {
            return Err(CaptureFault::KindMismatch {
                constructor: "memory",
                kind,
            });
        }
        if !EVENT_OPERAND_SIZES.contains(&size) {
            return Err(CaptureFault::UnsupportedOperandSize(size));
        }
        let mut ev = Self::bare(kind, Semantics::None, tid);
        ev.addr = addr;
        ev.size = size;
        ev.stack = stack;
        ev.site = site;
        Ok(ev)
    }

    pub fn allocation(kind: EventKind, tid: ThreadId, addr: u64, extent: u32) -> CaptureResult<Self> {
        Self::require(
            "allocation",
            kind,
            &[EventKind::MemoryAlloc, EventKind::MemoryFree],
        )?;
        if extent == 0 && kind == EventKind::MemoryAlloc {
            return Err(CaptureFault::ZeroExtent(kind));
        }
        let mut ev = Self::bare(kind, Semantics::None, tid);
        ev.addr = addr;
        ev.size = extent;
        Ok(ev)
    }

    /// Attach the datum snapshot of a memory event.
    pub fn with_value(mut self, value: u64) -> CaptureResult<Self> {
        if !self.kind.is_memory() {
            return Err(CaptureFault::KindMismatch {
                constructor: "value",
                kind: self.kind,
            });
        }
        self.value = value;
        Ok(self)
    }

    pub(crate) fn stamp(&mut self, seq: SeqId) {
        self.seq = seq;
    }

    /// Check the kind/semantics invariant. Events built by the constructors
    /// always pass; decoded or corrupted ones might not.
    pub fn validate(&self) -> CaptureResult<()> {
        if self.kind.is_reserved() {
            return Err(CaptureFault::InvalidKind(self.kind.as_u8()));
        }
        if self.kind.is_paired() != (self.semantics != Semantics::None) {
            return Err(CaptureFault::SemanticsMismatch {
                kind: self.kind,
                semantics: self.semantics,
            });
        }
        Ok(())
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn semantics(&self) -> Semantics {
        self.semantics
    }

    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn is_stack(&self) -> bool {
        self.stack
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn insn_count(&self) -> u32 {
        self.insn_count
    }

    pub fn site(&self) -> SiteInfo {
        self.site
    }

    pub fn seq(&self) -> SeqId {
        self.seq
    }

    /// Whether `self` and `other` touch at least one common byte.
    pub fn overlaps(&self, other: &Event) -> bool {
        let a_end = self.addr.saturating_add(self.size.max(1) as u64);
        let b_end = other.addr.saturating_add(other.size.max(1) as u64);
        self.addr < b_end && other.addr < a_end
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sem = match self.semantics {
            Semantics::None => "-",
            Semantics::Begin => "BEGIN",
            Semantics::End => "END",
        };
        write!(
            f,
            "seq={} {} {} tid={} addr={:#x} size={} stack={} value={:#x} insns={} \
             line={} file={} rtn={} prev_line={} prev_file={}",
            self.seq,
            self.kind,
            sem,
            self.tid,
            self.addr,
            self.size,
            self.stack as u8,
            self.value,
            self.insn_count,
            self.site.line,
            self.site.file,
            self.site.routine,
            self.site.prev_line,
            self.site.prev_file,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_round_trip() {
        for raw in 0..=u8::MAX {
            if let Some(kind) = EventKind::from_u8(raw) {
                assert_eq!(kind.as_u8(), raw);
            }
        }
        assert_eq!(EventKind::from_u8(23), None);
        assert_eq!(EventKind::from_u8(24), None);
        assert_eq!(EventKind::from_u8(30), None);
        assert_eq!(EventKind::CheckPoint.as_u8(), 29);
        assert_eq!(KIND_SLOTS, 30);
    }

    #[test]
    fn test_lock_constructor_rejects_memory_kind() {
        let err = Event::lock(EventKind::MemoryRead, Semantics::Begin, ThreadId(1), 0x10)
            .unwrap_err();
        assert!(matches!(
            err,
            CaptureFault::KindMismatch {
                constructor: "lock",
                kind: EventKind::MemoryRead
            }
        ));
    }

    #[test]
    fn test_boundary_requires_semantics() {
        let err = Event::thread(EventKind::ThreadStart, Semantics::None, ThreadId(0)).unwrap_err();
        assert!(matches!(err, CaptureFault::SemanticsMismatch { .. }));
        let ev = Event::thread(EventKind::ThreadStart, Semantics::End, ThreadId(0)).unwrap();
        assert!(ev.validate().is_ok());
    }

    #[test]
    fn test_region_marker_has_no_semantics() {
        let ev = Event::region(EventKind::CheckPoint, ThreadId(2)).unwrap();
        assert_eq!(ev.semantics(), Semantics::None);
        assert!(ev.validate().is_ok());
        assert!(Event::region(EventKind::LockAcquire, ThreadId(2)).is_err());
    }

    #[test]
    fn test_validate_catches_stray_semantics() {
        let mut ev = Event::basic_block(ThreadId(0), 12);
        ev.semantics = Semantics::Begin;
        assert!(matches!(
            ev.validate(),
            Err(CaptureFault::SemanticsMismatch {
                kind: EventKind::BasicBlock,
                semantics: Semantics::Begin
            })
        ));
        ev.kind = EventKind::ThreadBlocked;
        assert!(matches!(ev.validate(), Err(CaptureFault::InvalidKind(5))));
    }

    #[test]
    fn test_memory_constructor_sizes() {
        let site = SiteInfo::default();
        for size in EVENT_OPERAND_SIZES {
            assert!(Event::memory(EventKind::MemoryRead, ThreadId(0), 0x1000, size, false, site)
                .is_ok());
        }
        assert!(matches!(
            Event::memory(EventKind::MemoryRead, ThreadId(0), 0x1000, 16, false, site),
            Err(CaptureFault::UnsupportedOperandSize(16))
        ));
        assert!(Event::memory(EventKind::BasicBlock, ThreadId(0), 0, 4, false, site).is_err());
    }

    #[test]
    fn test_allocation_extent() {
        assert!(Event::allocation(EventKind::MemoryFree, ThreadId(0), 0x2000, 0).is_ok());
        assert!(matches!(
            Event::allocation(EventKind::MemoryAlloc, ThreadId(0), 0x2000, 0),
            Err(CaptureFault::ZeroExtent(EventKind::MemoryAlloc))
        ));
        let ev = Event::allocation(EventKind::MemoryAlloc, ThreadId(0), 0x2000, 64).unwrap();
        assert_eq!(ev.size(), 64);
    }

    #[test]
    fn test_with_value_only_on_memory() {
        let ev = Event::memory(
            EventKind::MemoryWrite,
            ThreadId(3),
            0x40,
            8,
            true,
            SiteInfo::default(),
        )
        .unwrap()
        .with_value(0x1122334455667788)
        .unwrap();
        assert_eq!(ev.value(), 0x1122334455667788);
        assert!(Event::basic_block(ThreadId(0), 1).with_value(1).is_err());
    }

    #[test]
    fn test_overlap() {
        let site = SiteInfo::default();
        let a = Event::memory(EventKind::MemoryWrite, ThreadId(0), 0x100, 8, false, site).unwrap();
        let b = Event::memory(EventKind::MemoryRead, ThreadId(1), 0x104, 4, false, site).unwrap();
        let c = Event::memory(EventKind::MemoryRead, ThreadId(1), 0x108, 4, false, site).unwrap();
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_display_line() {
        let ev = Event::lock(EventKind::LockRelease, Semantics::End, ThreadId(4), 0xbeef).unwrap();
        let line = ev.to_string();
        assert!(line.starts_with("seq=0 LOCK_RELEASE END tid=4 addr=0xbeef"));
    }
}
