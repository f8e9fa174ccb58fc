//! Safe wrapper for the `VIDIOC_(G|S)_FMT` ioctls.
use nix::errno::Errno;
use std::convert::{From, TryFrom, TryInto};
use std::os::unix::io::AsRawFd;
use thiserror::Error;

use crate::bindings;
use crate::bindings::v4l2_format;
use crate::Format;
use crate::FormatConversionError;
use crate::PlaneLayout;
use crate::QueueType;

impl TryFrom<(QueueType, &Format)> for v4l2_format {
    type Error = FormatConversionError;

    fn try_from((queue, format): (QueueType, &Format)) -> Result<Self, Self::Error> {
        let mut v4l2_fmt = v4l2_format {
            type_: queue as u32,
            ..Default::default()
        };

        if queue.is_multiplanar() {
            if format.plane_fmt.len() > bindings::VIDEO_MAX_PLANES as usize {
                return Err(Self::Error::TooManyPlanes(format.plane_fmt.len()));
            }

            let mut pix_mp = bindings::v4l2_pix_format_mplane {
                width: format.width,
                height: format.height,
                pixelformat: format.pixelformat.into(),
                field: bindings::v4l2_field_V4L2_FIELD_ANY,
                num_planes: format.plane_fmt.len() as u8,
                ..Default::default()
            };
            let mut planes = pix_mp.plane_fmt;
            for (plane, v4l2_plane) in format.plane_fmt.iter().zip(planes.iter_mut()) {
                *v4l2_plane = plane.into();
            }
            pix_mp.plane_fmt = planes;

            v4l2_fmt.fmt.pix_mp = pix_mp;
        } else {
            if format.plane_fmt.len() > 1 {
                return Err(Self::Error::TooManyPlanes(format.plane_fmt.len()));
            }

            let plane = format.plane_fmt.first().cloned().unwrap_or_default();
            v4l2_fmt.fmt.pix = bindings::v4l2_pix_format {
                width: format.width,
                height: format.height,
                pixelformat: format.pixelformat.into(),
                bytesperline: plane.bytesperline,
                sizeimage: plane.sizeimage,
                ..Default::default()
            };
        }

        Ok(v4l2_fmt)
    }
}

impl From<&PlaneLayout> for bindings::v4l2_plane_pix_format {
    fn from(plane: &PlaneLayout) -> Self {
        bindings::v4l2_plane_pix_format {
            sizeimage: plane.sizeimage,
            bytesperline: plane.bytesperline,
            ..Default::default()
        }
    }
}

#[doc(hidden)]
mod ioctl {
    use crate::bindings::v4l2_format;
    nix::ioctl_readwrite!(vidioc_g_fmt, b'V', 4, v4l2_format);
    nix::ioctl_readwrite!(vidioc_s_fmt, b'V', 5, v4l2_format);
}

#[derive(Debug, Error)]
pub enum GFmtError {
    #[error("error while converting from V4L2 format: {0}")]
    FromV4L2FormatConversionError(FormatConversionError),
    #[error("invalid buffer type requested")]
    InvalidBufferType,
    #[error("unexpected ioctl error: {0}")]
    IoctlError(Errno),
}

impl From<GFmtError> for Errno {
    fn from(err: GFmtError) -> Self {
        match err {
            GFmtError::FromV4L2FormatConversionError(_) => Errno::EINVAL,
            GFmtError::InvalidBufferType => Errno::EINVAL,
            GFmtError::IoctlError(e) => e,
        }
    }
}

/// Safe wrapper around the `VIDIOC_G_FMT` ioctl.
pub fn g_fmt(fd: &impl AsRawFd, queue: QueueType) -> Result<Format, GFmtError> {
    let mut fmt = v4l2_format {
        type_: queue as u32,
        ..Default::default()
    };

    match unsafe { ioctl::vidioc_g_fmt(fd.as_raw_fd(), &mut fmt) } {
        Ok(_) => fmt
            .try_into()
            .map_err(GFmtError::FromV4L2FormatConversionError),
        Err(Errno::EINVAL) => Err(GFmtError::InvalidBufferType),
        Err(e) => Err(GFmtError::IoctlError(e)),
    }
}

#[derive(Debug, Error)]
pub enum SFmtError {
    #[error("error while converting format: {0}")]
    ConversionError(#[from] FormatConversionError),
    #[error("invalid buffer type or format requested")]
    InvalidFormat,
    #[error("device currently busy")]
    DeviceBusy,
    #[error("unexpected ioctl error: {0}")]
    IoctlError(Errno),
}

impl From<SFmtError> for Errno {
    fn from(err: SFmtError) -> Self {
        match err {
            SFmtError::ConversionError(_) => Errno::EINVAL,
            SFmtError::InvalidFormat => Errno::EINVAL,
            SFmtError::DeviceBusy => Errno::EBUSY,
            SFmtError::IoctlError(e) => e,
        }
    }
}

/// Safe wrapper around the `VIDIOC_S_FMT` ioctl. Returns the format actually applied by the
/// driver, which may differ from the requested one.
pub fn s_fmt(fd: &impl AsRawFd, queue: QueueType, format: &Format) -> Result<Format, SFmtError> {
    let mut fmt = v4l2_format::try_from((queue, format))?;

    match unsafe { ioctl::vidioc_s_fmt(fd.as_raw_fd(), &mut fmt) } {
        Ok(_) => Ok(fmt.try_into()?),
        Err(Errno::EINVAL) => Err(SFmtError::InvalidFormat),
        Err(Errno::EBUSY) => Err(SFmtError::DeviceBusy),
        Err(e) => Err(SFmtError::IoctlError(e)),
    }
}
