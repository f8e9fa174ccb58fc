//! Codecs understood by the decoder engine and the descriptor of a stream to decode.
use std::fmt;

use crate::PixelFormat;

/// Compressed formats a stream may come in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    H263,
    Mpeg1,
    Mpeg2,
    Mpeg4,
    Xvid,
    /// VC-1 advanced profile, SMPTE 421M Annex G framing.
    Vc1,
    /// VC-1 simple/main profile, Annex L framing.
    Vc1AnnexL,
    Vp8,
    Hevc,
    Vp9,
    Mjpeg,
}

impl Codec {
    /// Device format code for this codec, or `None` if the decoder engine cannot handle it.
    pub fn pixel_format(&self) -> Option<PixelFormat> {
        match self {
            Codec::H264 => Some(PixelFormat::H264),
            Codec::H263 => Some(PixelFormat::H263),
            Codec::Mpeg1 => Some(PixelFormat::MPEG1),
            Codec::Mpeg2 => Some(PixelFormat::MPEG2),
            Codec::Mpeg4 => Some(PixelFormat::MPEG4),
            Codec::Xvid => Some(PixelFormat::XVID),
            Codec::Vc1 => Some(PixelFormat::VC1_ANNEX_G),
            Codec::Vc1AnnexL => Some(PixelFormat::VC1_ANNEX_L),
            // VP8 carries no sequence header the decoder could be configured with.
            Codec::Vp8 | Codec::Hevc | Codec::Vp9 | Codec::Mjpeg => None,
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How NAL units are delimited in the stream's access units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Annex B start codes, which the decoder parses natively.
    StartCode,
    /// Length-prefixed NAL units with an `avcC` configuration record.
    LengthPrefixed,
}

/// Everything the pipeline needs to know about a stream before decoding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub codec: Codec,
    /// Out-of-band configuration data (sequence headers), possibly empty.
    pub extradata: Vec<u8>,
    /// The stream must not be handed to hardware decoders.
    pub software_only: bool,
    pub width: u32,
    pub height: u32,
}

impl StreamInfo {
    pub fn new(codec: Codec) -> Self {
        StreamInfo {
            codec,
            extradata: Vec::new(),
            software_only: false,
            width: 0,
            height: 0,
        }
    }

    pub fn with_extradata(self, extradata: impl Into<Vec<u8>>) -> Self {
        StreamInfo {
            extradata: extradata.into(),
            ..self
        }
    }

    pub fn with_size(self, width: u32, height: u32) -> Self {
        StreamInfo {
            width,
            height,
            ..self
        }
    }

    pub fn software_only(self) -> Self {
        StreamInfo {
            software_only: true,
            ..self
        }
    }

    /// An H.264 configuration record starting with version byte `1` is an `avcC` box. Every
    /// other stream is assumed to use start codes.
    pub fn framing(&self) -> Framing {
        match (self.codec, self.extradata.first()) {
            (Codec::H264, Some(1)) => Framing::LengthPrefixed,
            _ => Framing::StartCode,
        }
    }

    /// Whether access units must go through a bitstream converter before reaching the decoder.
    pub fn needs_bitstream_conversion(&self) -> bool {
        self.framing() == Framing::LengthPrefixed
    }
}
