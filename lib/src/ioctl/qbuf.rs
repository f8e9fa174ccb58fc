//! Safe wrapper for the `VIDIOC_QBUF` ioctl.
use nix::errno::Errno;
use std::os::unix::io::AsRawFd;
use thiserror::Error;

use crate::bindings;
use crate::ioctl::V4l2BufferPlanes;
use crate::memory::MemoryType;
use crate::memory::PlaneHandle;
use crate::QueueType;

/// Plane information to pass to `qbuf`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QBufPlane {
    /// Number of bytes of valid data in the plane. Ignored by the driver for CAPTURE queues.
    pub bytesused: u32,
    pub handle: PlaneHandle,
}

impl QBufPlane {
    pub fn new_mmap(bytesused: u32) -> Self {
        QBufPlane {
            bytesused,
            handle: PlaneHandle::Mmap,
        }
    }

    pub fn new_userptr(bytesused: u32, addr: usize, length: u32) -> Self {
        QBufPlane {
            bytesused,
            handle: PlaneHandle::UserPtr { addr, length },
        }
    }
}

#[doc(hidden)]
mod ioctl {
    use crate::bindings::v4l2_buffer;
    nix::ioctl_readwrite!(vidioc_qbuf, b'V', 15, v4l2_buffer);
}

#[derive(Debug, Error)]
pub enum QBufError {
    #[error("invalid number of planes specified for the buffer: got {0}, maximum is {1}")]
    NumPlanesMismatch(usize, usize),
    #[error("plane memory type {0:?} does not match queue memory type {1:?}")]
    MemoryTypeMismatch(MemoryType, MemoryType),
    #[error("ioctl error: {0}")]
    IoctlError(Errno),
}

impl From<Errno> for QBufError {
    fn from(errno: Errno) -> Self {
        Self::IoctlError(errno)
    }
}

impl From<QBufError> for Errno {
    fn from(err: QBufError) -> Self {
        match err {
            QBufError::NumPlanesMismatch(_, _) => Errno::EINVAL,
            QBufError::MemoryTypeMismatch(_, _) => Errno::EINVAL,
            QBufError::IoctlError(e) => e,
        }
    }
}

/// Safe wrapper around the `VIDIOC_QBUF` ioctl for multi-planar queues.
///
/// Every plane in `planes` must use the same memory type as `memory`.
pub fn qbuf(
    fd: &impl AsRawFd,
    queue: QueueType,
    memory: MemoryType,
    index: u32,
    planes: &[QBufPlane],
) -> Result<(), QBufError> {
    if planes.is_empty() || planes.len() > bindings::VIDEO_MAX_PLANES as usize {
        return Err(QBufError::NumPlanesMismatch(
            planes.len(),
            bindings::VIDEO_MAX_PLANES as usize,
        ));
    }
    if let Some(plane) = planes.iter().find(|p| p.handle.memory_type() != memory) {
        return Err(QBufError::MemoryTypeMismatch(
            plane.handle.memory_type(),
            memory,
        ));
    }

    let mut v4l2_planes: V4l2BufferPlanes = Default::default();
    for (plane, v4l2_plane) in planes.iter().zip(v4l2_planes.iter_mut()) {
        v4l2_plane.bytesused = plane.bytesused;
        plane.handle.fill_v4l2_plane(v4l2_plane);
    }

    let mut v4l2_buf = bindings::v4l2_buffer {
        index,
        type_: queue as u32,
        memory: memory as u32,
        field: bindings::v4l2_field_V4L2_FIELD_NONE,
        length: planes.len() as u32,
        ..Default::default()
    };
    v4l2_buf.m.planes = v4l2_planes.as_mut_ptr();

    unsafe { ioctl::vidioc_qbuf(fd.as_raw_fd(), &mut v4l2_buf) }?;
    Ok(())
}
