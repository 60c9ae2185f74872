//! Trace sinks: plain files, pre-created named pipes, and a fan-out writer
//! that multicasts one trace to several backends.

use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;

use log::info;
use serde::Deserialize;
use serde::Serialize;

use crate::fault::errno_cause;
use crate::fault::CaptureFault;
use crate::fault::CaptureResult;

pub type Sink = Box<dyn Write + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Regular file, created or truncated.
    #[default]
    File,
    /// Named pipe created beforehand by the backend or `tracefront mkfifo`.
    /// Opening blocks until a reader attaches.
    Fifo,
}

fn setup_fault(path: &Path, source: io::Error) -> CaptureFault {
    CaptureFault::ChannelSetup {
        path: path.display().to_string(),
        cause: errno_cause(&source),
        source,
    }
}

pub fn open_sink(kind: SinkKind, path: &Path) -> CaptureResult<Sink> {
    let file = match kind {
        SinkKind::File => File::create(path),
        SinkKind::Fifo => OpenOptions::new().write(true).open(path),
    }
    .map_err(|e| setup_fault(path, e))?;
    info!("Opened {:?} trace sink {}", kind, path.display());
    Ok(Box::new(file))
}

/// Writes everything to every destination and flushes each one.
pub struct FanOut {
    dests: Vec<Sink>,
}

impl FanOut {
    pub fn new(dests: Vec<Sink>) -> Self {
        FanOut { dests }
    }

    pub fn open_all(kind: SinkKind, paths: &[impl AsRef<Path>]) -> CaptureResult<Self> {
        let dests = paths
            .iter()
            .map(|p| open_sink(kind, p.as_ref()))
            .collect::<CaptureResult<Vec<_>>>()?;
        Ok(FanOut::new(dests))
    }

    pub fn len(&self) -> usize {
        self.dests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dests.is_empty()
    }
}

impl Write for FanOut {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_all(buf)?;
        Ok(buf.len())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        for d in self.dests.iter_mut() {
            d.write_all(buf)?;
            d.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        for d in self.dests.iter_mut() {
            d.flush()?;
        }
        Ok(())
    }
}

/// Writer that appends into a shared buffer. Lets tests and in-process
/// consumers inspect what reached the sink while the drain still owns it.
#[derive(Clone, Default)]
pub struct SharedBuffer(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
