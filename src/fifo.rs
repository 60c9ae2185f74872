//! Named-pipe setup for the per-thread lockstep channels.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::path::PathBuf;

use log::debug;
use log::info;
use log::warn;

use crate::fault::errno_cause;
use crate::fault::CaptureFault;
use crate::fault::CaptureResult;

/// `<dir>/<prefix><tid><suffix>`, e.g. `/tmp/run/fifo.tid3canneal`.
pub fn channel_path(dir: &Path, prefix: &str, suffix: &str, tid: usize) -> PathBuf {
    dir.join(format!("{}{}{}", prefix, tid, suffix))
}

pub fn mkfifo(path: &Path) -> io::Result<()> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: cpath is a valid NUL-terminated string for the call's duration.
    let ret = unsafe { libc::mkfifo(cpath.as_ptr(), 0o666) };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Create `count` per-thread pipes. On failure every pipe this call may
/// have created is unlinked again before the fault is returned.
pub fn create_fifos(
    dir: &Path,
    prefix: &str,
    suffix: &str,
    count: usize,
) -> CaptureResult<Vec<PathBuf>> {
    let mut created = Vec::with_capacity(count);
    for tid in 0..count {
        let path = channel_path(dir, prefix, suffix, tid);
        if let Err(source) = mkfifo(&path) {
            let cause = errno_cause(&source);
            warn!("mkfifo failed for {}: {} ({})", path.display(), cause, source);
            remove_fifos(&created);
            return Err(CaptureFault::ChannelSetup {
                path: path.display().to_string(),
                cause,
                source,
            });
        }
        debug!("Created fifo {}", path.display());
        created.push(path);
    }
    info!("Created {} lockstep channels in {}", count, dir.display());
    Ok(created)
}

/// Best-effort unlink. Missing pipes are ignored.
pub fn remove_fifos(paths: &[PathBuf]) -> usize {
    let mut removed = 0;
    for p in paths {
        match std::fs::remove_file(p) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", p.display(), e),
        }
    }
    removed
}
