//! Access to M2M device nodes.
//!
//! The [`M2mDevice`] trait is the seam between the engine adapters and the hardware: it exposes
//! exactly the operations the adapters need, with the error types of the [`crate::ioctl`]
//! module. [`V4l2Device`] implements it on top of a real `/dev/videoN` node.
pub mod namespace;
#[cfg(test)]
pub mod sim;

use std::fs::File;
use std::ops::DerefMut;
use std::os::unix::io::{AsFd, AsRawFd, FromRawFd, RawFd};
use std::path::Path;

use log::{debug, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use thiserror::Error;

use crate::ioctl::{
    self, Capability, CropError, CtrlId, DqBufError, DqBuffer, FmtDesc, FormatIterator, GCtrlError,
    GFmtError, MmapError, QBufError, QBufPlane, QueryBufError, QueryBufPlane, QueryBuffer,
    QueryCapError, ReqbufsError, SFmtError, StreamOffError, StreamOnError,
};
use crate::memory::MemoryType;
use crate::{Format, QueueDirection, QueueType, Rect};

/// Options used when opening a device node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    non_blocking_dqbuf: bool,
}

impl DeviceConfig {
    pub fn new() -> Self {
        Default::default()
    }

    /// Open the node with `O_NONBLOCK`, so `VIDIOC_DQBUF` returns `EAGAIN` instead of waiting.
    pub fn non_blocking_dqbuf(self) -> Self {
        DeviceConfig {
            non_blocking_dqbuf: true,
        }
    }

    pub fn is_non_blocking(&self) -> bool {
        self.non_blocking_dqbuf
    }
}

/// Outcome of waiting on one direction of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    /// A buffer can be dequeued.
    Ready,
    /// The timeout expired without any buffer completing.
    Busy,
    /// The device reported an error condition.
    Error,
}

/// Operations an engine adapter performs on its device.
///
/// All methods take `&self`: a device is a handle, and the state that changes behind it lives
/// in the driver.
pub trait M2mDevice {
    /// Mapping of a single `MMAP` plane.
    type Mapping: DerefMut<Target = [u8]>;

    fn query_capability(&self) -> Result<Capability, QueryCapError>;
    /// Pixel formats supported by `queue`.
    fn formats(&self, queue: QueueType) -> Vec<FmtDesc>;
    fn get_format(&self, queue: QueueType) -> Result<Format, GFmtError>;
    /// Apply `format` to `queue` and return what the driver actually selected.
    fn set_format(&self, queue: QueueType, format: &Format) -> Result<Format, SFmtError>;
    fn get_crop(&self, queue: QueueType) -> Result<Rect, CropError>;
    fn set_crop(&self, queue: QueueType, rect: Rect) -> Result<(), CropError>;
    fn get_control(&self, id: CtrlId) -> Result<i32, GCtrlError>;
    /// Returns the number of buffers actually allocated.
    fn request_buffers(
        &self,
        queue: QueueType,
        memory: MemoryType,
        count: u32,
    ) -> Result<u32, ReqbufsError>;
    fn query_buffer(
        &self,
        queue: QueueType,
        memory: MemoryType,
        index: usize,
    ) -> Result<QueryBuffer, QueryBufError>;
    fn map_plane(&self, plane: &QueryBufPlane) -> Result<Self::Mapping, MmapError>;
    fn queue_buffer(
        &self,
        queue: QueueType,
        memory: MemoryType,
        index: usize,
        planes: &[QBufPlane],
    ) -> Result<(), QBufError>;
    /// Must not block: an empty queue is reported as [`DqBufError::NotReady`].
    fn dequeue_buffer(&self, queue: QueueType, memory: MemoryType)
        -> Result<DqBuffer, DqBufError>;
    fn stream_on(&self, queue: QueueType) -> Result<(), StreamOnError>;
    fn stream_off(&self, queue: QueueType) -> Result<(), StreamOffError>;
    /// Wait at most `timeout_ms` milliseconds for a buffer of `direction` to complete.
    fn poll(&self, direction: QueueDirection, timeout_ms: i32) -> PollResult;
}

#[derive(Debug, Error)]
pub enum DeviceOpenError {
    #[error("cannot open {0}: {1}")]
    OpenFailed(String, Errno),
    #[error("error while querying capabilities: {0}")]
    QueryCapError(#[from] QueryCapError),
}

/// A V4L2 device node.
#[derive(Debug)]
pub struct V4l2Device {
    pub capability: Capability,
    file: File,
}

impl V4l2Device {
    pub fn open(path: &Path, config: &DeviceConfig) -> Result<Self, DeviceOpenError> {
        use nix::fcntl::{open, OFlag};
        use nix::sys::stat::Mode;

        let flags = OFlag::O_RDWR
            | OFlag::O_CLOEXEC
            | match config.non_blocking_dqbuf {
                true => OFlag::O_NONBLOCK,
                false => OFlag::empty(),
            };

        let fd = open(path, flags, Mode::empty())
            .map_err(|e| DeviceOpenError::OpenFailed(path.display().to_string(), e))?;
        // Safe because `open` just returned this descriptor to us and nothing else owns it.
        let file = unsafe { File::from_raw_fd(fd) };
        let capability: Capability = ioctl::querycap(&file)?;
        debug!(
            "Opened {}: driver {}, card {}, caps {}",
            path.display(),
            capability.driver,
            capability.card,
            capability.device_caps()
        );

        Ok(V4l2Device { capability, file })
    }
}

impl AsRawFd for V4l2Device {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl M2mDevice for V4l2Device {
    type Mapping = ioctl::PlaneMapping;

    fn query_capability(&self) -> Result<Capability, QueryCapError> {
        Ok(self.capability.clone())
    }

    fn formats(&self, queue: QueueType) -> Vec<FmtDesc> {
        FormatIterator::new(self, queue).collect()
    }

    fn get_format(&self, queue: QueueType) -> Result<Format, GFmtError> {
        ioctl::g_fmt(self, queue)
    }

    fn set_format(&self, queue: QueueType, format: &Format) -> Result<Format, SFmtError> {
        ioctl::s_fmt(self, queue, format)
    }

    fn get_crop(&self, queue: QueueType) -> Result<Rect, CropError> {
        ioctl::g_crop(self, queue)
    }

    fn set_crop(&self, queue: QueueType, rect: Rect) -> Result<(), CropError> {
        ioctl::s_crop(self, queue, rect)
    }

    fn get_control(&self, id: CtrlId) -> Result<i32, GCtrlError> {
        ioctl::g_ctrl(self, id)
    }

    fn request_buffers(
        &self,
        queue: QueueType,
        memory: MemoryType,
        count: u32,
    ) -> Result<u32, ReqbufsError> {
        ioctl::reqbufs(self, queue, memory, count)
    }

    fn query_buffer(
        &self,
        queue: QueueType,
        memory: MemoryType,
        index: usize,
    ) -> Result<QueryBuffer, QueryBufError> {
        ioctl::querybuf(self, queue, memory, index as u32)
    }

    fn map_plane(&self, plane: &QueryBufPlane) -> Result<Self::Mapping, MmapError> {
        ioctl::mmap(self, plane.mem_offset, plane.length)
    }

    fn queue_buffer(
        &self,
        queue: QueueType,
        memory: MemoryType,
        index: usize,
        planes: &[QBufPlane],
    ) -> Result<(), QBufError> {
        ioctl::qbuf(self, queue, memory, index as u32, planes)
    }

    fn dequeue_buffer(
        &self,
        queue: QueueType,
        memory: MemoryType,
    ) -> Result<DqBuffer, DqBufError> {
        ioctl::dqbuf(self, queue, memory)
    }

    fn stream_on(&self, queue: QueueType) -> Result<(), StreamOnError> {
        ioctl::streamon(self, queue)
    }

    fn stream_off(&self, queue: QueueType) -> Result<(), StreamOffError> {
        ioctl::streamoff(self, queue)
    }

    fn poll(&self, direction: QueueDirection, timeout_ms: i32) -> PollResult {
        let events = match direction {
            QueueDirection::Output => PollFlags::POLLOUT,
            QueueDirection::Capture => PollFlags::POLLIN,
        };
        // nix rejects values below -1.
        let timeout = PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::NONE);
        let mut poll_fd = [PollFd::new(self.file.as_fd(), events)];

        match poll(&mut poll_fd, timeout) {
            Err(e) => {
                warn!("poll() on {:?} queue failed: {}", direction, e);
                PollResult::Error
            }
            Ok(0) => PollResult::Busy,
            Ok(_) => match poll_fd[0].revents() {
                Some(revents) if revents.contains(PollFlags::POLLERR) => PollResult::Error,
                Some(revents) if revents.intersects(events) => PollResult::Ready,
                Some(_) => PollResult::Busy,
                None => {
                    warn!("Unknown poll flags returned on {:?} queue", direction);
                    PollResult::Error
                }
            },
        }
    }
}
