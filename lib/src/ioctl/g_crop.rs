//! Safe wrapper for the `VIDIOC_(G|S)_CROP` ioctls.
//!
//! On the decoder's CAPTURE queue the crop rectangle is the visible area of the decoded picture.
//! On the converter's OUTPUT queue it selects which part of the source frame gets converted.
use std::os::unix::io::AsRawFd;

use nix::errno::Errno;
use thiserror::Error;

use crate::bindings;
use crate::{QueueType, Rect};

#[doc(hidden)]
mod ioctl {
    use crate::bindings::v4l2_crop;
    nix::ioctl_readwrite!(vidioc_g_crop, b'V', 59, v4l2_crop);
    nix::ioctl_write_ptr!(vidioc_s_crop, b'V', 60, v4l2_crop);
}

#[derive(Debug, Error)]
pub enum CropError {
    #[error("cropping not supported on queue {0}")]
    NotSupported(QueueType),
    #[error("unexpected ioctl error: {0}")]
    IoctlError(Errno),
}

impl From<CropError> for Errno {
    fn from(err: CropError) -> Self {
        match err {
            CropError::NotSupported(_) => Errno::EINVAL,
            CropError::IoctlError(e) => e,
        }
    }
}

fn map_crop_error(queue: QueueType, errno: Errno) -> CropError {
    match errno {
        Errno::EINVAL | Errno::ENODATA => CropError::NotSupported(queue),
        e => CropError::IoctlError(e),
    }
}

/// Safe wrapper around the `VIDIOC_G_CROP` ioctl.
pub fn g_crop(fd: &impl AsRawFd, queue: QueueType) -> Result<Rect, CropError> {
    let mut crop = bindings::v4l2_crop {
        type_: queue as u32,
        ..Default::default()
    };

    match unsafe { ioctl::vidioc_g_crop(fd.as_raw_fd(), &mut crop) } {
        Ok(_) => Ok(Rect::from(crop.c)),
        Err(e) => Err(map_crop_error(queue, e)),
    }
}

/// Safe wrapper around the `VIDIOC_S_CROP` ioctl. The driver may adjust the rectangle, use
/// `g_crop` to read back the applied value.
pub fn s_crop(fd: &impl AsRawFd, queue: QueueType, rect: Rect) -> Result<(), CropError> {
    let crop = bindings::v4l2_crop {
        type_: queue as u32,
        c: rect.into(),
    };

    match unsafe { ioctl::vidioc_s_crop(fd.as_raw_fd(), &crop) } {
        Ok(_) => Ok(()),
        Err(e) => Err(map_crop_error(queue, e)),
    }
}
