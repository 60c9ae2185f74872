//! Per-thread execution context.
//!
//! One [`ThreadContext`] exists per monitored thread. It is handed out by
//! [`crate::Capture::thread_begin`] and passed by `&mut` into every capture
//! callback on that thread, so none of its state needs a lock.

use log::debug;

use crate::event::EventKind;
use crate::fault::CaptureFault;
use crate::fault::CaptureResult;
use crate::types::ThreadId;

/// Write captured before the store retires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingWrite {
    pub kind: EventKind,
    pub addr: u64,
    pub size: u32,
    pub stack: bool,
}

#[derive(Debug)]
pub struct ThreadContext {
    tid: ThreadId,
    suppression: u32,
    pending: Option<PendingWrite>,
    last_line: u16,
    last_file: u16,
    held_locks: u32,
}

impl ThreadContext {
    pub fn new(tid: ThreadId) -> Self {
        ThreadContext {
            tid,
            suppression: 0,
            pending: None,
            last_line: 0,
            last_file: 0,
            held_locks: 0,
        }
    }

    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    pub fn suppression_depth(&self) -> u32 {
        self.suppression
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppression > 0
    }

    pub fn begin_suppression(&mut self) {
        self.suppression += 1;
        debug!("tid {} suppression -> {}", self.tid, self.suppression);
    }

    pub fn end_suppression(&mut self) -> CaptureResult<()> {
        if self.suppression == 0 {
            return Err(CaptureFault::UnbalancedSuppression {
                tid: self.tid,
                depth: 0,
            });
        }
        self.suppression -= 1;
        debug!("tid {} suppression -> {}", self.tid, self.suppression);
        Ok(())
    }

    /// Leave two nested suppression scopes at once.
    ///
    /// Some library-internal lock paths enter two scopes but return through a
    /// single exit point after tail-call elimination, so the instrumentation
    /// only observes one exit. This is only legal when both scopes are
    /// actually open.
    pub fn end_suppression_twice(&mut self) -> CaptureResult<()> {
        if self.suppression < 2 {
            return Err(CaptureFault::UnbalancedSuppression {
                tid: self.tid,
                depth: self.suppression,
            });
        }
        self.suppression -= 2;
        debug!("tid {} suppression -> {} (double exit)", self.tid, self.suppression);
        Ok(())
    }

    pub fn stage_write(&mut self, write: PendingWrite) {
        self.pending = Some(write);
    }

    /// Consume the write staged before the store. `size` is the width the
    /// engine reports after the store and must match the staged one.
    pub fn take_staged_write(&mut self, size: u32) -> CaptureResult<PendingWrite> {
        let staged = self
            .pending
            .take()
            .ok_or(CaptureFault::MissingStagedWrite(self.tid))?;
        if staged.size != size {
            return Err(CaptureFault::StagedSizeMismatch {
                tid: self.tid,
                staged: staged.size,
                actual: size,
            });
        }
        Ok(staged)
    }

    pub fn has_staged_write(&self) -> bool {
        self.pending.is_some()
    }

    pub fn record_site(&mut self, line: u16, file: u16) {
        self.last_line = line;
        self.last_file = file;
    }

    /// Line and file index of the last site control passed through.
    pub fn last_site(&self) -> (u16, u16) {
        (self.last_line, self.last_file)
    }

    pub(crate) fn note_acquire(&mut self) {
        self.held_locks += 1;
    }

    pub(crate) fn note_release(&mut self) {
        self.held_locks = self.held_locks.saturating_sub(1);
    }

    pub fn held_locks(&self) -> u32 {
        self.held_locks
    }
}
