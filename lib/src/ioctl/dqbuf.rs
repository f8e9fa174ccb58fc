//! Safe wrapper for the `VIDIOC_DQBUF` ioctl.
use nix::errno::Errno;
use std::os::unix::io::AsRawFd;
use thiserror::Error;

use crate::bindings;
use crate::ioctl::BufferFlags;
use crate::ioctl::V4l2BufferPlanes;
use crate::memory::MemoryType;
use crate::QueueType;

/// Information for a dequeued buffer. Safe subset of `struct v4l2_buffer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DqBuffer {
    pub index: usize,
    pub flags: BufferFlags,
    /// Bytes of valid data in each plane, as reported by the driver.
    pub bytesused: Vec<u32>,
}

impl DqBuffer {
    pub fn has_error(&self) -> bool {
        self.flags.contains(BufferFlags::ERROR)
    }
}

#[doc(hidden)]
mod ioctl {
    use crate::bindings::v4l2_buffer;
    nix::ioctl_readwrite!(vidioc_dqbuf, b'V', 17, v4l2_buffer);
}

#[derive(Debug, Error)]
pub enum DqBufError {
    #[error("end-of-stream reached")]
    Eos,
    #[error("no buffer ready for dequeue")]
    NotReady,
    #[error("ioctl error: {0}")]
    IoctlError(Errno),
}

impl From<Errno> for DqBufError {
    fn from(error: Errno) -> Self {
        match error {
            Errno::EAGAIN => Self::NotReady,
            Errno::EPIPE => Self::Eos,
            error => Self::IoctlError(error),
        }
    }
}

impl From<DqBufError> for Errno {
    fn from(err: DqBufError) -> Self {
        match err {
            DqBufError::Eos => Errno::EPIPE,
            DqBufError::NotReady => Errno::EAGAIN,
            DqBufError::IoctlError(e) => e,
        }
    }
}

/// Safe wrapper around the `VIDIOC_DQBUF` ioctl for multi-planar queues.
///
/// With a non-blocking file descriptor, an empty queue is reported as [`DqBufError::NotReady`].
pub fn dqbuf(
    fd: &impl AsRawFd,
    queue: QueueType,
    memory: MemoryType,
) -> Result<DqBuffer, DqBufError> {
    let mut v4l2_planes: V4l2BufferPlanes = Default::default();
    let mut v4l2_buf = bindings::v4l2_buffer {
        type_: queue as u32,
        memory: memory as u32,
        length: bindings::VIDEO_MAX_PLANES,
        ..Default::default()
    };
    v4l2_buf.m.planes = v4l2_planes.as_mut_ptr();

    unsafe { ioctl::vidioc_dqbuf(fd.as_raw_fd(), &mut v4l2_buf) }?;

    let num_planes = std::cmp::min(v4l2_buf.length, bindings::VIDEO_MAX_PLANES) as usize;
    Ok(DqBuffer {
        index: v4l2_buf.index as usize,
        flags: BufferFlags::from_bits_truncate(v4l2_buf.flags),
        bytesused: v4l2_planes[..num_planes]
            .iter()
            .map(|p| p.bytesused)
            .collect(),
    })
}
