//! Safe-copy access to the datum behind a captured memory operand.
//!
//! Effective addresses handed over by the instrumentation engine may be
//! unmapped (predicated or speculative instructions), so values are never
//! read by dereferencing. [`ProcessMemory`] copies through
//! `process_vm_readv(2)` on the own pid, which reports `EFAULT` instead of
//! faulting.

use std::io;

use crate::fault::CaptureFault;
use crate::fault::CaptureResult;

/// Operand widths the capture layer accepts. Anything wider than 8 bytes is
/// split into 8-byte pieces.
pub const SUPPORTED_OPERAND_SIZES: [u32; 8] = [0, 1, 2, 4, 8, 16, 32, 64];

const PIECE: u32 = 8;

pub trait MemoryReader: Send + Sync {
    /// Fill `buf` from `addr`, or fail without touching the process.
    fn read(&self, addr: u64, buf: &mut [u8]) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessMemory;

impl MemoryReader for ProcessMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let local = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let remote = libc::iovec {
            iov_base: addr as *mut libc::c_void,
            iov_len: buf.len(),
        };
        // SAFETY: local describes a writable buffer we own; the kernel
        // validates the remote range and fails with EFAULT if unmapped.
        let ret = unsafe {
            libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0)
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        if ret as usize != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short read: {} of {} bytes", ret, buf.len()),
            ));
        }
        Ok(())
    }
}

/// A detached block of memory at a fixed base address.
#[derive(Debug, Clone)]
pub struct SnapshotMemory {
    base: u64,
    bytes: Vec<u8>,
}

impl SnapshotMemory {
    pub fn new(base: u64, bytes: Vec<u8>) -> Self {
        SnapshotMemory { base, bytes }
    }

    /// Offset of `[addr, addr + len)` inside the block, `EFAULT` if any
    /// byte falls outside it.
    fn offset(&self, addr: u64, len: usize) -> io::Result<usize> {
        addr.checked_sub(self.base)
            .and_then(|o| usize::try_from(o).ok())
            .filter(|o| o.checked_add(len).is_some_and(|end| end <= self.bytes.len()))
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EFAULT))
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) -> io::Result<()> {
        let off = self.offset(addr, data.len())?;
        self.bytes[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl MemoryReader for SnapshotMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> io::Result<()> {
        let off = self.offset(addr, buf.len())?;
        buf.copy_from_slice(&self.bytes[off..off + buf.len()]);
        Ok(())
    }
}

/// Break an access into the `(addr, size)` pieces that become events.
pub fn split_access(addr: u64, size: u32) -> CaptureResult<Vec<(u64, u32)>> {
    match size {
        0 | 1 | 2 | 4 | 8 => Ok(vec![(addr, size)]),
        16 | 32 | 64 => {
            if addr.checked_add(size as u64 - 1).is_none() {
                return Err(CaptureFault::UnreadableMemory {
                    addr,
                    size,
                    source: io::Error::from_raw_os_error(libc::EFAULT),
                });
            }
            Ok((0..size / PIECE)
                .map(|k| (addr + (k * PIECE) as u64, PIECE))
                .collect())
        }
        _ => Err(CaptureFault::UnsupportedOperandSize(size)),
    }
}

/// Read the datum of an access of at most 8 bytes, zero-extended. The bytes
/// are interpreted in host order, the way the program itself sees them.
pub fn snapshot(reader: &dyn MemoryReader, addr: u64, size: u32) -> CaptureResult<u64> {
    let mut buf = [0u8; 8];
    let n = size as usize;
    if n == 0 {
        return Ok(0);
    }
    if n > buf.len() {
        return Err(CaptureFault::UnsupportedOperandSize(size));
    }
    reader
        .read(addr, &mut buf[..n])
        .map_err(|source| CaptureFault::UnreadableMemory { addr, size, source })?;
    let value = match n {
        1 => buf[0] as u64,
        2 => u16::from_ne_bytes([buf[0], buf[1]]) as u64,
        4 => u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]) as u64,
        8 => u64::from_ne_bytes(buf),
        _ => return Err(CaptureFault::UnsupportedOperandSize(size)),
    };
    Ok(value)
}
