#![allow(dead_code)]

use std::io;
use std::sync::Arc;
use std::sync::Mutex;

use tracefront::memory::SnapshotMemory;
use tracefront::sink::SharedBuffer;
use tracefront::wire::TraceReader;
use tracefront::*;

/// Memory the test can modify while the capture holds a reader to it.
#[derive(Clone)]
pub struct SharedMemory(pub Arc<Mutex<SnapshotMemory>>);

impl SharedMemory {
    pub fn new(base: u64, len: usize) -> Self {
        SharedMemory(Arc::new(Mutex::new(SnapshotMemory::new(base, vec![0; len]))))
    }

    pub fn store(&self, addr: u64, data: &[u8]) {
        self.0.lock().unwrap().write(addr, data).unwrap();
    }
}

impl MemoryReader for SharedMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> io::Result<()> {
        self.0.lock().unwrap().read(addr, buf)
    }
}

pub const MEM_BASE: u64 = 0x7f00_0000_0000;

pub fn start(config: Config, lockstep: Option<LockstepSync>) -> (Capture, SharedBuffer, SharedMemory) {
    let sink = SharedBuffer::new();
    let mem = SharedMemory::new(MEM_BASE, 4096);
    let capture = Capture::with_parts(
        config,
        Box::new(sink.clone()),
        Box::new(mem.clone()),
        lockstep,
    )
    .unwrap();
    (capture, sink, mem)
}

pub fn decode_all(sink: &SharedBuffer) -> Vec<Event> {
    TraceReader::new(&sink.contents()[..])
        .collect::<CaptureResult<Vec<_>>>()
        .unwrap()
}
