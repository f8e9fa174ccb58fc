//! Safe wrapper for the `VIDIOC_G_CTRL` ioctl.
use std::os::unix::io::AsRawFd;

use nix::errno::Errno;
use thiserror::Error;

use crate::bindings;

/// Controls read by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CtrlId {
    /// Minimum number of CAPTURE buffers the decoder needs to make progress.
    MinBuffersForCapture = bindings::V4L2_CID_MIN_BUFFERS_FOR_CAPTURE,
    MinBuffersForOutput = bindings::V4L2_CID_MIN_BUFFERS_FOR_OUTPUT,
}

#[doc(hidden)]
mod ioctl {
    use crate::bindings::v4l2_control;
    nix::ioctl_readwrite!(vidioc_g_ctrl, b'V', 27, v4l2_control);
}

#[derive(Debug, Error)]
pub enum GCtrlError {
    #[error("invalid control {0:?}")]
    InvalidControl(CtrlId),
    #[error("control value not available yet")]
    NotReady,
    #[error("ioctl error: {0}")]
    IoctlError(Errno),
}

impl From<GCtrlError> for Errno {
    fn from(err: GCtrlError) -> Self {
        match err {
            GCtrlError::InvalidControl(_) => Errno::EINVAL,
            GCtrlError::NotReady => Errno::EBUSY,
            GCtrlError::IoctlError(e) => e,
        }
    }
}

/// Safe wrapper around the `VIDIOC_G_CTRL` ioctl.
pub fn g_ctrl(fd: &impl AsRawFd, id: CtrlId) -> Result<i32, GCtrlError> {
    let mut ctrl = bindings::v4l2_control {
        id: id as u32,
        value: 0,
    };

    match unsafe { ioctl::vidioc_g_ctrl(fd.as_raw_fd(), &mut ctrl) } {
        Ok(_) => Ok(ctrl.value),
        Err(Errno::EINVAL) => Err(GCtrlError::InvalidControl(id)),
        Err(Errno::EBUSY) => Err(GCtrlError::NotReady),
        Err(e) => Err(GCtrlError::IoctlError(e)),
    }
}
