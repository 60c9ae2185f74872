//! Capture-layer faults.
//!
//! Every variant is an invariant violation or a setup failure. None of them
//! is recoverable for the traced run: the caller is expected to abandon the
//! trace, but tests can assert on the exact reason instead of a process
//! abort.

use std::fmt;
use std::io;

use crate::event::EventKind;
use crate::event::Semantics;
use crate::types::ThreadId;

#[derive(Debug)]
pub enum CaptureFault {
    /// Raw kind byte that names no event kind, or a kind that may never
    /// reach the trace (INVALID, THREAD_BLOCKED, THREAD_UNBLOCKED).
    InvalidKind(u8),
    /// A constructor was handed a kind outside its sanctioned set.
    KindMismatch {
        constructor: &'static str,
        kind: EventKind,
    },
    SemanticsMismatch {
        kind: EventKind,
        semantics: Semantics,
    },
    /// Raw semantics byte that is neither 0, REG_BEGIN nor REG_END.
    InvalidSemantics(u8),
    UnbalancedSuppression {
        tid: ThreadId,
        depth: u32,
    },
    UnsupportedOperandSize(u32),
    ZeroExtent(EventKind),
    QueueOverflow {
        len: usize,
        capacity: usize,
    },
    MissingStagedWrite(ThreadId),
    StagedSizeMismatch {
        tid: ThreadId,
        staged: u32,
        actual: u32,
    },
    UnreadableMemory {
        addr: u64,
        size: u32,
        source: io::Error,
    },
    StatsMismatch {
        kind: EventKind,
        enqueued: u64,
        dequeued: u64,
        undelivered: u64,
    },
    NoChannel(ThreadId),
    ChannelClosed(ThreadId),
    ChannelSetup {
        path: String,
        cause: &'static str,
        source: io::Error,
    },
    SinkIo(io::Error),
    DataRace {
        addr: u64,
        first: (ThreadId, EventKind),
        second: (ThreadId, EventKind),
    },
    InvalidConfig(String),
}

impl fmt::Display for CaptureFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureFault::InvalidKind(raw) => write!(f, "invalid event kind {}", raw),
            CaptureFault::KindMismatch { constructor, kind } => {
                write!(f, "{} constructor cannot build {} events", constructor, kind)
            }
            CaptureFault::SemanticsMismatch { kind, semantics } => {
                write!(f, "{} events cannot carry {:?} semantics", kind, semantics)
            }
            CaptureFault::InvalidSemantics(raw) => write!(f, "invalid region semantics {}", raw),
            CaptureFault::UnbalancedSuppression { tid, depth } => write!(
                f,
                "thread {} left a suppression scope it never entered (depth {})",
                tid, depth
            ),
            CaptureFault::UnsupportedOperandSize(size) => {
                write!(f, "unsupported memory operand size {}", size)
            }
            CaptureFault::ZeroExtent(kind) => write!(f, "{} with zero extent", kind),
            CaptureFault::QueueOverflow { len, capacity } => {
                write!(f, "event queue holds {} events, capacity {}", len, capacity)
            }
            CaptureFault::MissingStagedWrite(tid) => {
                write!(f, "thread {} completed a write that was never staged", tid)
            }
            CaptureFault::StagedSizeMismatch {
                tid,
                staged,
                actual,
            } => write!(
                f,
                "thread {} staged a {}-byte write but completed a {}-byte one",
                tid, staged, actual
            ),
            CaptureFault::UnreadableMemory { addr, size, source } => {
                write!(f, "cannot read {} bytes at {:#x}: {}", size, addr, source)
            }
            CaptureFault::StatsMismatch {
                kind,
                enqueued,
                dequeued,
                undelivered,
            } => write!(
                f,
                "{} events lost: enqueued {}, dequeued {}, undelivered {}",
                kind, enqueued, dequeued, undelivered
            ),
            CaptureFault::NoChannel(tid) => write!(f, "no lockstep channel for thread {}", tid),
            CaptureFault::ChannelClosed(tid) => {
                write!(f, "lockstep channel for thread {} closed by backend", tid)
            }
            CaptureFault::ChannelSetup {
                path,
                cause,
                source,
            } => write!(f, "cannot set up channel {}: {} ({})", path, cause, source),
            CaptureFault::SinkIo(e) => write!(f, "trace sink write failed: {}", e),
            CaptureFault::DataRace {
                addr,
                first,
                second,
            } => write!(
                f,
                "data race at {:#x}: thread {} {} vs thread {} {}",
                addr, first.0, first.1, second.0, second.1
            ),
            CaptureFault::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for CaptureFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CaptureFault::UnreadableMemory { source, .. } => Some(source),
            CaptureFault::ChannelSetup { source, .. } => Some(source),
            CaptureFault::SinkIo(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CaptureFault {
    fn from(e: io::Error) -> Self {
        CaptureFault::SinkIo(e)
    }
}

pub type CaptureResult<T> = std::result::Result<T, CaptureFault>;

/// Name of the errno behind a channel setup failure.
pub fn errno_cause(e: &io::Error) -> &'static str {
    match e.raw_os_error() {
        Some(libc::EACCES) => "EACCES",
        Some(libc::EDQUOT) => "EDQUOT",
        Some(libc::EEXIST) => "EEXIST",
        Some(libc::ENAMETOOLONG) => "ENAMETOOLONG",
        Some(libc::ENOENT) => "ENOENT",
        Some(libc::ENOSPC) => "ENOSPC",
        Some(libc::ENOTDIR) => "ENOTDIR",
        Some(libc::EROFS) => "EROFS",
        Some(_) => "other",
        None => "unknown",
    }
}
