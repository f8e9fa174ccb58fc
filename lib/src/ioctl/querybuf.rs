//! Safe wrapper for the `VIDIOC_QUERYBUF` ioctl.
use std::os::unix::io::AsRawFd;

use nix::errno::Errno;
use thiserror::Error;

use crate::bindings;
use crate::ioctl::BufferFlags;
use crate::ioctl::V4l2BufferPlanes;
use crate::memory::MemoryType;
use crate::QueueType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryBufPlane {
    /// Offset to pass to `mmap()` in order to obtain a mapping for this plane.
    pub mem_offset: u32,
    /// Length of this plane.
    pub length: u32,
}

/// Contains all the information that makes sense when using `querybuf`.
#[derive(Debug, Clone)]
pub struct QueryBuffer {
    pub index: usize,
    pub flags: BufferFlags,
    pub planes: Vec<QueryBufPlane>,
}

#[doc(hidden)]
mod ioctl {
    use crate::bindings::v4l2_buffer;
    nix::ioctl_readwrite!(vidioc_querybuf, b'V', 9, v4l2_buffer);
}

#[derive(Debug, Error)]
pub enum QueryBufError {
    #[error("invalid buffer index {0}")]
    InvalidIndex(u32),
    #[error("ioctl error: {0}")]
    IoctlError(Errno),
}

impl From<QueryBufError> for Errno {
    fn from(err: QueryBufError) -> Self {
        match err {
            QueryBufError::InvalidIndex(_) => Errno::EINVAL,
            QueryBufError::IoctlError(e) => e,
        }
    }
}

/// Safe wrapper around the `VIDIOC_QUERYBUF` ioctl.
pub fn querybuf(
    fd: &impl AsRawFd,
    queue: QueueType,
    memory: MemoryType,
    index: u32,
) -> Result<QueryBuffer, QueryBufError> {
    let mut v4l2_buf = bindings::v4l2_buffer {
        index,
        type_: queue as u32,
        memory: memory as u32,
        ..Default::default()
    };
    let mut planes: V4l2BufferPlanes = Default::default();
    if queue.is_multiplanar() {
        v4l2_buf.m.planes = planes.as_mut_ptr();
        v4l2_buf.length = bindings::VIDEO_MAX_PLANES;
    }

    match unsafe { ioctl::vidioc_querybuf(fd.as_raw_fd(), &mut v4l2_buf) } {
        Ok(_) => (),
        Err(Errno::EINVAL) => return Err(QueryBufError::InvalidIndex(index)),
        Err(e) => return Err(QueryBufError::IoctlError(e)),
    }

    let planes = if queue.is_multiplanar() {
        planes
            .iter()
            .take(v4l2_buf.length as usize)
            .map(|plane| QueryBufPlane {
                mem_offset: unsafe { plane.m.mem_offset },
                length: plane.length,
            })
            .collect()
    } else {
        vec![QueryBufPlane {
            mem_offset: unsafe { v4l2_buf.m.offset },
            length: v4l2_buf.length,
        }]
    };

    Ok(QueryBuffer {
        index: v4l2_buf.index as usize,
        flags: BufferFlags::from_bits_truncate(v4l2_buf.flags),
        planes,
    })
}
