//! Safer versions of the V4L2 ioctls used to drive M2M codecs, working on anything that
//! implements `AsRawFd`. Application code should normally go through [`crate::device`] instead.
//!
//! V4L2 ioctls take a single structure that carries both the input and the output of the call,
//! which makes it easy to forget which fields user-space is supposed to fill. Each wrapper here
//! therefore takes its input as plain parameters, builds the C structure itself, and returns a
//! safe Rust type built from what the driver wrote back.
//!
//! Each ioctl also gets its own error type. This lets callers tell apart situations where the
//! ioctl returned non-zero without anything being wrong: `VIDIOC_DQBUF` returns `EAGAIN` when no
//! buffer is ready yet, which is reported as [`DqBufError::NotReady`] and not as an error code.
//! All error types convert back to their originating `Errno`.

mod dqbuf;
mod enum_fmt;
mod g_crop;
mod g_ctrl;
mod g_fmt;
mod mmap;
mod qbuf;
mod querybuf;
mod querycap;
mod reqbufs;
mod streamon;

pub use dqbuf::*;
pub use enum_fmt::*;
pub use g_crop::*;
pub use g_ctrl::*;
pub use g_fmt::*;
pub use mmap::*;
pub use qbuf::*;
pub use querybuf::*;
pub use querycap::*;
pub use reqbufs::*;
pub use streamon::*;

use std::ffi::CStr;
use std::ffi::FromBytesWithNulError;

use bitflags::bitflags;
use nix::errno::Errno;

use crate::bindings;

/// Constructs an owned String from a slice containing a nul-terminated C string, after
/// checking that the slice indeed contains a nul character.
fn string_from_cstr(c_str: &[u8]) -> Result<String, FromBytesWithNulError> {
    let slice = match c_str.iter().position(|x| *x == b'\0') {
        // Pass the full slice, `from_bytes_with_nul` will return an error.
        None => c_str,
        Some(pos) => &c_str[..pos + 1],
    };

    Ok(CStr::from_bytes_with_nul(slice)?
        .to_string_lossy()
        .into_owned())
}

/// Extension trait for allowing easy conversion of ioctl errors into their originating error code.
pub trait IntoErrno {
    fn into_errno(self) -> i32;
}

impl<T> IntoErrno for T
where
    T: Into<Errno>,
{
    fn into_errno(self) -> i32 {
        self.into() as i32
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    /// `flags` member of `struct v4l2_buffer`.
    pub struct BufferFlags: u32 {
        const MAPPED = bindings::V4L2_BUF_FLAG_MAPPED;
        const QUEUED = bindings::V4L2_BUF_FLAG_QUEUED;
        const DONE = bindings::V4L2_BUF_FLAG_DONE;
        const KEYFRAME = bindings::V4L2_BUF_FLAG_KEYFRAME;
        const PFRAME = bindings::V4L2_BUF_FLAG_PFRAME;
        const BFRAME = bindings::V4L2_BUF_FLAG_BFRAME;
        const ERROR = bindings::V4L2_BUF_FLAG_ERROR;
        const LAST = bindings::V4L2_BUF_FLAG_LAST;
    }
}

/// A memory area we can pass to ioctls in order to get/set plane information
/// with the multi-planar API.
pub(crate) type V4l2BufferPlanes = [bindings::v4l2_plane; bindings::VIDEO_MAX_PLANES as usize];
