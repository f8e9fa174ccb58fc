//! Safe wrapper for the `VIDIOC_REQBUFS` ioctl.
use crate::bindings::v4l2_requestbuffers;
use crate::memory::MemoryType;
use crate::QueueType;
use nix::errno::Errno;
use std::os::unix::io::AsRawFd;
use thiserror::Error;

#[doc(hidden)]
mod ioctl {
    use crate::bindings::v4l2_requestbuffers;
    nix::ioctl_readwrite!(vidioc_reqbufs, b'V', 8, v4l2_requestbuffers);
}

#[derive(Debug, Error)]
pub enum ReqbufsError {
    #[error("invalid buffer ({0}) or memory type ({1:?}) requested")]
    InvalidBufferType(QueueType, MemoryType),
    #[error("queue is busy: buffers are still mapped or streaming")]
    Busy,
    #[error("ioctl error: {0}")]
    IoctlError(Errno),
}

impl From<ReqbufsError> for Errno {
    fn from(err: ReqbufsError) -> Self {
        match err {
            ReqbufsError::InvalidBufferType(_, _) => Errno::EINVAL,
            ReqbufsError::Busy => Errno::EBUSY,
            ReqbufsError::IoctlError(e) => e,
        }
    }
}

/// Safe wrapper around the `VIDIOC_REQBUFS` ioctl.
///
/// Returns the number of buffers actually allocated by the driver, which may be more or fewer
/// than `count`. A `count` of zero releases all the buffers of the queue.
pub fn reqbufs(
    fd: &impl AsRawFd,
    queue: QueueType,
    memory: MemoryType,
    count: u32,
) -> Result<u32, ReqbufsError> {
    let mut reqbufs = v4l2_requestbuffers {
        count,
        type_: queue as u32,
        memory: memory as u32,
        ..Default::default()
    };

    match unsafe { ioctl::vidioc_reqbufs(fd.as_raw_fd(), &mut reqbufs) } {
        Ok(_) => Ok(reqbufs.count),
        Err(Errno::EINVAL) => Err(ReqbufsError::InvalidBufferType(queue, memory)),
        Err(Errno::EBUSY) => Err(ReqbufsError::Busy),
        Err(e) => Err(ReqbufsError::IoctlError(e)),
    }
}
