//! Decoded pictures as handed to the caller.

/// Pixel layout of a picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureFormat {
    /// Three planes: Y, U and V.
    Yuv420Planar,
    /// Two planes: Y and interleaved UV.
    Nv12,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PicturePlane<'a> {
    pub data: &'a [u8],
    pub stride: u32,
}

/// A picture borrowed from the pipeline's buffers. It can be read until the next call that
/// mutates the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Picture<'a> {
    pub width: u32,
    pub height: u32,
    pub format: PictureFormat,
    /// Empty for dropped pictures.
    pub planes: Vec<PicturePlane<'a>>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub dropped: bool,
}

/// Where the pixels of the current picture live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PictureSource {
    DecoderCapture(usize),
    ConverterCapture(usize),
}

/// Everything about the current picture except the pixel data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PictureInfo {
    pub width: u32,
    pub height: u32,
    pub format: PictureFormat,
    pub strides: Vec<u32>,
    pub source: PictureSource,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub dropped: bool,
}
