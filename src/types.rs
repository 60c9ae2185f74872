//! Newtype wrappers for identifiers carried on the wire.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Monitored application thread identifier, as assigned by the
/// instrumentation engine. The root (main) thread is normally `ThreadId(0)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ThreadId(pub u16);

impl ThreadId {
    pub const ROOT: ThreadId = ThreadId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for ThreadId {
    fn from(tid: u16) -> Self {
        ThreadId(tid)
    }
}

/// Global enqueue order stamped onto every event. The first event is 1.
pub type SeqId = u32;
