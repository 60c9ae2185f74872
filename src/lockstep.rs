//! Lockstep handshake with the backends.
//!
//! In lockstep mode every monitored thread owns one inbound byte channel.
//! After the thread emits a boundary event it blocks until each of the
//! `backends` simulators has echoed the thread's id back as a 2-byte
//! big-endian value. There is no timeout: a backend that never answers
//! stalls the thread forever.

use std::fs::File;
use std::io;
use std::io::Read;
use std::path::Path;
use std::sync::Mutex;

use log::debug;
use log::info;
use log::warn;

use crate::event::EventKind;
use crate::event::Semantics;
use crate::fault::errno_cause;
use crate::fault::CaptureFault;
use crate::fault::CaptureResult;
use crate::fifo::channel_path;
use crate::types::ThreadId;

pub type Channel = Box<dyn Read + Send>;

pub struct LockstepSync {
    backends: u32,
    /// Indexed by thread id.
    channels: Vec<Mutex<Channel>>,
}

impl LockstepSync {
    pub fn new(backends: u32, channels: Vec<Channel>) -> Self {
        LockstepSync {
            backends,
            channels: channels.into_iter().map(Mutex::new).collect(),
        }
    }

    /// Open `count` per-thread named pipes for reading. Each open blocks
    /// until the backend side has opened the pipe for writing.
    pub fn open(
        backends: u32,
        dir: &Path,
        prefix: &str,
        suffix: &str,
        count: usize,
    ) -> CaptureResult<Self> {
        let mut channels: Vec<Channel> = Vec::with_capacity(count);
        for tid in 0..count {
            let path = channel_path(dir, prefix, suffix, tid);
            let file = File::open(&path).map_err(|source| CaptureFault::ChannelSetup {
                path: path.display().to_string(),
                cause: errno_cause(&source),
                source,
            })?;
            debug!("Opened lockstep channel {}", path.display());
            channels.push(Box::new(file));
        }
        info!(
            "Lockstep: {} channels, {} backend(s)",
            channels.len(),
            backends
        );
        Ok(Self::new(backends, channels))
    }

    pub fn backends(&self) -> u32 {
        self.backends
    }

    pub fn channels(&self) -> usize {
        self.channels.len()
    }

    /// Block until every backend has acknowledged the boundary just emitted
    /// by `tid`.
    pub fn wait_for_backends(&self, tid: ThreadId) -> CaptureResult<()> {
        let chan = self
            .channels
            .get(tid.index())
            .ok_or(CaptureFault::NoChannel(tid))?;
        let mut chan = chan.lock().unwrap();
        debug!("tid {} waiting for {} backend(s)", tid, self.backends);
        for _ in 0..self.backends {
            let mut buf = [0u8; 2];
            chan.read_exact(&mut buf).map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => CaptureFault::ChannelClosed(tid),
                _ => CaptureFault::SinkIo(e),
            })?;
            let echoed = u16::from_be_bytes(buf);
            if echoed != tid.0 {
                warn!(
                    "tid {} received acknowledgment for thread {} ({:#018b})",
                    tid, echoed, echoed
                );
            }
        }
        debug!("tid {} released by backends", tid);
        Ok(())
    }
}

/// Which emitted events are lockstep checkpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoundaryPolicy {
    /// Backends pause and restart on their own; do not wait at releases.
    pub pausing: bool,
}

impl BoundaryPolicy {
    /// End of the region before a lock acquire or release.
    pub fn is_boundary(kind: EventKind, semantics: Semantics) -> bool {
        matches!(
            (kind, semantics),
            (EventKind::LockAcquire, Semantics::End) | (EventKind::LockRelease, Semantics::End)
        )
    }

    /// Boundaries a thread actually waits at.
    pub fn is_checkpoint(&self, kind: EventKind, semantics: Semantics) -> bool {
        Self::is_boundary(kind, semantics) && !(self.pausing && kind == EventKind::LockRelease)
    }
}
