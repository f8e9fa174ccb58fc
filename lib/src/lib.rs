//! Hardware-accelerated video decoding over V4L2 memory-to-memory devices.
//!
//! The crate is layered the same way the devices are:
//!
//! * [`ioctl`] provides thin, memory-safe wrappers over the handful of V4L2 ioctls a stateful
//!   M2M decoder needs. [`device`] puts them behind the [`device::M2mDevice`] trait so the
//!   layers above can run against real nodes or a simulated device.
//!
//! * [`queue`] is a codec-agnostic view of one hardware buffer queue: request, map, queue,
//!   dequeue, stream and poll, with a per-buffer ownership flag.
//!
//! * [`decoder`] and [`converter`] drive the two engines: the bitstream decoder, and the
//!   optional scaler/format converter used when the decoder can only produce a tiled layout.
//!
//! * [`pipeline`] negotiates capabilities, wires both engines together and exposes the
//!   `open`/`decode`/`picture`/`reset`/`dispose` cycle to the caller.
//!
//! Everything is driven synchronously from the caller's thread. No call blocks for longer than
//! the configured poll timeouts.
#[doc(hidden)]
pub mod bindings;
pub mod converter;
pub mod decoder;
pub mod device;
pub mod ioctl;
pub mod memory;
pub mod pipeline;
pub mod queue;

use std::convert::TryFrom;
use std::fmt;
use std::fmt::{Debug, Display};

use enumn::N;
use thiserror::Error;

/// Possible directions for the queue
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueueDirection {
    /// Software to hardware (compressed data for a decoder).
    Output,
    /// Hardware to software (decoded or converted frames).
    Capture,
}

/// Queue types used by M2M codecs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, N)]
#[repr(u32)]
pub enum QueueType {
    VideoCapture = bindings::v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE,
    VideoOutput = bindings::v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_OUTPUT,
    VideoCaptureMplane = bindings::v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
    VideoOutputMplane = bindings::v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE,
}

impl QueueType {
    /// Returns the multi-planar queue type for `direction`. Both engines driven by this crate
    /// only expose the multi-planar API.
    pub fn mplane(direction: QueueDirection) -> Self {
        match direction {
            QueueDirection::Output => QueueType::VideoOutputMplane,
            QueueDirection::Capture => QueueType::VideoCaptureMplane,
        }
    }

    pub fn is_multiplanar(&self) -> bool {
        matches!(
            self,
            QueueType::VideoCaptureMplane | QueueType::VideoOutputMplane
        )
    }

    pub fn direction(&self) -> QueueDirection {
        match self {
            QueueType::VideoOutput | QueueType::VideoOutputMplane => QueueDirection::Output,
            QueueType::VideoCapture | QueueType::VideoCaptureMplane => QueueDirection::Capture,
        }
    }
}

impl Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

/// A Fourcc pixel format, as passed to V4L2.
///
/// # Examples
///
/// ```
/// # use m2mdec::PixelFormat;
/// let f = PixelFormat::from(b"NM12");
/// assert_eq!(f, PixelFormat::NV12M);
/// assert_eq!(f.to_string(), "NM12");
/// assert_eq!(format!("{:?}", f), "0x32314d4e (NM12)");
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct PixelFormat(u32);

impl PixelFormat {
    /// Semi-planar 4:2:0, one memory plane per component group.
    pub const NV12M: PixelFormat = PixelFormat::from_fourcc(b"NM12");
    /// Samsung 64x32 macroblock-tiled NV12M, the decoder's internal layout.
    pub const NV12MT: PixelFormat = PixelFormat::from_fourcc(b"TM12");
    /// Fully planar 4:2:0, three memory planes.
    pub const YUV420M: PixelFormat = PixelFormat::from_fourcc(b"YM12");

    pub const H264: PixelFormat = PixelFormat::from_fourcc(b"H264");
    pub const H263: PixelFormat = PixelFormat::from_fourcc(b"H263");
    pub const MPEG1: PixelFormat = PixelFormat::from_fourcc(b"MPG1");
    pub const MPEG2: PixelFormat = PixelFormat::from_fourcc(b"MPG2");
    pub const MPEG4: PixelFormat = PixelFormat::from_fourcc(b"MPG4");
    pub const XVID: PixelFormat = PixelFormat::from_fourcc(b"XVID");
    pub const VC1_ANNEX_G: PixelFormat = PixelFormat::from_fourcc(b"VC1G");
    pub const VC1_ANNEX_L: PixelFormat = PixelFormat::from_fourcc(b"VC1L");
    pub const VP8: PixelFormat = PixelFormat::from_fourcc(b"VP80");

    pub const fn from_u32(v: u32) -> Self {
        Self(v)
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }

    pub const fn from_fourcc(n: &[u8; 4]) -> Self {
        Self(n[0] as u32 | (n[1] as u32) << 8 | (n[2] as u32) << 16 | (n[3] as u32) << 24)
    }

    pub const fn to_fourcc(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl From<u32> for PixelFormat {
    fn from(i: u32) -> Self {
        Self::from_u32(i)
    }
}

impl From<PixelFormat> for u32 {
    fn from(format: PixelFormat) -> Self {
        format.to_u32()
    }
}

impl From<&[u8; 4]> for PixelFormat {
    fn from(n: &[u8; 4]) -> Self {
        Self::from_fourcc(n)
    }
}

impl fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("0x{:08x} ({})", self.0, self))
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let fourcc = self
            .to_fourcc()
            .iter()
            .map(|&x| x as char)
            .collect::<String>();
        f.write_str(fourcc.as_str())
    }
}

/// Description of a single plane in a format.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct PlaneLayout {
    /// Useful size of the plane ; the backing memory must be at least that large.
    pub sizeimage: u32,
    /// Bytes per line of data. Only meaningful for image formats.
    pub bytesperline: u32,
}

/// Unified representation of a V4L2 format for single and multi-planar queues.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Format {
    pub width: u32,
    pub height: u32,
    pub pixelformat: PixelFormat,
    /// Layout of each memory plane. The number of planes is defined by `pixelformat`.
    pub plane_fmt: Vec<PlaneLayout>,
}

impl Format {
    /// Returns the bytes-per-line of plane `index`, or `fallback` if the driver did not report
    /// one.
    pub fn stride(&self, index: usize, fallback: u32) -> u32 {
        match self.plane_fmt.get(index) {
            Some(plane) if plane.bytesperline > 0 => plane.bytesperline,
            _ => fallback,
        }
    }

    /// Returns the `sizeimage` of every plane, in order.
    pub fn plane_sizes(&self) -> Vec<u32> {
        self.plane_fmt.iter().map(|p| p.sizeimage).collect()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatConversionError {
    #[error("too many planes ({0}) specified")]
    TooManyPlanes(usize),
    #[error("invalid buffer type requested")]
    InvalidBufferType(u32),
}

impl TryFrom<bindings::v4l2_format> for Format {
    type Error = FormatConversionError;

    fn try_from(fmt: bindings::v4l2_format) -> std::result::Result<Self, Self::Error> {
        match QueueType::n(fmt.type_) {
            Some(QueueType::VideoCapture) | Some(QueueType::VideoOutput) => {
                let pix = unsafe { fmt.fmt.pix };
                Ok(Format {
                    width: pix.width,
                    height: pix.height,
                    pixelformat: PixelFormat::from(pix.pixelformat),
                    plane_fmt: vec![PlaneLayout {
                        bytesperline: pix.bytesperline,
                        sizeimage: pix.sizeimage,
                    }],
                })
            }
            Some(QueueType::VideoCaptureMplane) | Some(QueueType::VideoOutputMplane) => {
                // Copy out of the packed structure before touching any field.
                let pix_mp = unsafe { fmt.fmt.pix_mp };
                let num_planes = pix_mp.num_planes as usize;
                let planes = pix_mp.plane_fmt;

                // Can only happen if the driver returned a malformed v4l2_format.
                if num_planes > planes.len() {
                    return Err(Self::Error::TooManyPlanes(num_planes));
                }

                Ok(Format {
                    width: pix_mp.width,
                    height: pix_mp.height,
                    pixelformat: PixelFormat::from(pix_mp.pixelformat),
                    plane_fmt: planes[..num_planes]
                        .iter()
                        .map(|plane| PlaneLayout {
                            sizeimage: plane.sizeimage,
                            bytesperline: plane.bytesperline,
                        })
                        .collect(),
                })
            }
            None => Err(Self::Error::InvalidBufferType(fmt.type_)),
        }
    }
}

/// Quickly build a usable `Format` from a pixel format and resolution.
///
/// # Examples
///
/// ```
/// # use m2mdec::{Format, PixelFormat};
/// let f = Format::from((PixelFormat::YUV420M, (640, 480)));
/// assert_eq!(f.width, 640);
/// assert_eq!(f.height, 480);
/// assert_eq!(f.plane_fmt.len(), 0);
/// ```
impl<T: Into<PixelFormat>> From<(T, (u32, u32))> for Format {
    fn from((pixel_format, (width, height)): (T, (u32, u32))) -> Self {
        Format {
            width,
            height,
            pixelformat: pixel_format.into(),
            ..Default::default()
        }
    }
}

/// A more elegant representation for `v4l2_rect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(left: i32, top: i32, width: u32, height: u32) -> Rect {
        Rect {
            left,
            top,
            width,
            height,
        }
    }
}

impl From<bindings::v4l2_rect> for Rect {
    fn from(rect: bindings::v4l2_rect) -> Self {
        Rect {
            left: rect.left,
            top: rect.top,
            width: rect.width,
            height: rect.height,
        }
    }
}

impl From<Rect> for bindings::v4l2_rect {
    fn from(rect: Rect) -> Self {
        bindings::v4l2_rect {
            left: rect.left,
            top: rect.top,
            width: rect.width,
            height: rect.height,
        }
    }
}

impl Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}), {}x{}",
            self.left, self.top, self.width, self.height
        )
    }
}
