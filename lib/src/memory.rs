//! Backing memory of V4L2 buffers.
//!
//! The decoder engine only uses `MMAP` buffers: the device allocates their memory and we map it
//! into our address space. The converter's OUTPUT queue instead uses `USERPTR` buffers, so it
//! can read a decoded frame directly from the decoder's mapping without copying it.
use std::fmt::Debug;

use enumn::N;

use crate::bindings;

/// All the memory types used by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum MemoryType {
    Mmap = bindings::v4l2_memory_V4L2_MEMORY_MMAP,
    UserPtr = bindings::v4l2_memory_V4L2_MEMORY_USERPTR,
}

/// Memory attached to a single plane when it is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneHandle {
    /// Device-provided memory: the buffer index is enough.
    Mmap,
    /// Memory owned by someone else, typically another engine's mapping.
    UserPtr { addr: usize, length: u32 },
}

impl PlaneHandle {
    pub fn memory_type(&self) -> MemoryType {
        match self {
            PlaneHandle::Mmap => MemoryType::Mmap,
            PlaneHandle::UserPtr { .. } => MemoryType::UserPtr,
        }
    }

    /// Fill a plane of a multi-planar V4L2 buffer with the handle's information.
    pub fn fill_v4l2_plane(&self, plane: &mut bindings::v4l2_plane) {
        match *self {
            PlaneHandle::Mmap => (),
            PlaneHandle::UserPtr { addr, length } => {
                plane.m.userptr = addr as nix::libc::c_ulong;
                plane.length = length;
            }
        }
    }
}
