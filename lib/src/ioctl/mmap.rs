//! Mapping of `MMAP` buffer planes into user-space.
use std::ops::{Deref, DerefMut};
use std::os::unix::io::AsRawFd;
use std::slice;

use log::error;
use nix::errno::Errno;
use nix::libc::{self, c_void, off_t};
use thiserror::Error;

/// A plane of a V4L2 buffer mapped into our address space. The mapping stays valid until this
/// object is dropped, at which point it is unmapped.
pub struct PlaneMapping {
    addr: *mut c_void,
    length: usize,
}

impl PlaneMapping {
    pub fn size(&self) -> usize {
        self.length
    }
}

impl std::fmt::Debug for PlaneMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaneMapping")
            .field("addr", &self.addr)
            .field("length", &self.length)
            .finish()
    }
}

impl Deref for PlaneMapping {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        // Safe because `addr` and `length` come from a successful mmap() that lives as long as
        // `self`.
        unsafe { slice::from_raw_parts(self.addr as *const u8, self.length) }
    }
}

impl DerefMut for PlaneMapping {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { slice::from_raw_parts_mut(self.addr as *mut u8, self.length) }
    }
}

impl Drop for PlaneMapping {
    fn drop(&mut self) {
        // Safe because the pointer and length were constructed in mmap() and are always valid.
        if unsafe { libc::munmap(self.addr, self.length) } != 0 {
            error!("Error while unmapping plane: {}", Errno::last());
        }
    }
}

#[derive(Debug, Error)]
pub enum MmapError {
    #[error("cannot map a zero-sized plane")]
    ZeroLength,
    #[error("mmap error: {0}")]
    IoctlError(#[from] Errno),
}

impl From<MmapError> for Errno {
    fn from(err: MmapError) -> Self {
        match err {
            MmapError::ZeroLength => Errno::EINVAL,
            MmapError::IoctlError(e) => e,
        }
    }
}

/// Map `length` bytes of the plane identified by `mem_offset` (as returned by `querybuf`).
pub fn mmap(fd: &impl AsRawFd, mem_offset: u32, length: u32) -> Result<PlaneMapping, MmapError> {
    if length == 0 {
        return Err(MmapError::ZeroLength);
    }

    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            length as usize,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            mem_offset as off_t,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(MmapError::IoctlError(Errno::last()));
    }

    Ok(PlaneMapping {
        addr,
        length: length as usize,
    })
}
