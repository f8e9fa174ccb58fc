//! Orchestration of the decoder and converter engines into a decode session.
//!
//! A [`Pipeline`] is opened once per stream and then fed one access unit per call to
//! [`Pipeline::decode`]. Depending on what the decoder can produce, it runs in one of two
//! shapes decided at open time:
//!
//! * **native**: the decoder writes semi-planar frames the caller can read directly. A frame
//!   stays out of the hardware while the caller looks at it, and is given back at the start of
//!   the next call.
//! * **converted**: the decoder only produces its tiled layout, so every frame is lent to the
//!   converter, which writes a planar copy at the requested size. The converter is started on
//!   the first frame and always lags one frame behind, so the first call that decodes a frame
//!   returns [`DecodeStatus::NeedMoreData`].
//!
//! Pictures may come out of the decoder in a different order than they went in. Timestamps are
//! assigned from a [`TimestampLedger`] that hands out the smallest pending ones first.
//!
//! Everything runs on the caller's thread. Waiting on the hardware is bounded by the poll
//! timeouts of the engines, so a single call never blocks indefinitely.
pub mod ledger;
pub mod loan;
pub mod picture;

pub use ledger::{TimestampLedger, Timestamps};
pub use loan::{Engine, Loan, LoanBook, LoanError, LoanState};
pub use picture::{Picture, PictureFormat, PicturePlane};

use std::fmt;

use log::{debug, error, info, trace, warn};
use thiserror::Error;

use crate::converter::{Converter, ConverterConfig, ConverterError};
use crate::decoder::{BitstreamConverter, Decoder, DecoderConfig, DecoderError, StreamInfo};
use crate::device::namespace::DeviceNamespace;
use crate::device::M2mDevice;
use crate::Format;
use picture::{PictureInfo, PictureSource};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineOptions {
    pub decoder: DecoderConfig,
    pub converter: ConverterConfig,
    /// Size of converted pictures. Defaults to the visible size of the stream.
    pub display_size: Option<(u32, u32)>,
    /// Go through the converter even if the decoder can produce native frames.
    pub force_converter: bool,
}

impl PipelineOptions {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn decoder_config(self, decoder: DecoderConfig) -> Self {
        PipelineOptions { decoder, ..self }
    }

    pub fn converter_config(self, converter: ConverterConfig) -> Self {
        PipelineOptions { converter, ..self }
    }

    pub fn display_size(self, width: u32, height: u32) -> Self {
        PipelineOptions {
            display_size: Some((width, height)),
            ..self
        }
    }

    pub fn force_converter(self) -> Self {
        PipelineOptions {
            force_converter: true,
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Closed,
    Negotiating,
    Ready,
    /// A hardware error occurred. The pipeline must be disposed and opened again.
    Faulted,
}

impl PipelineState {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineState::Closed => "closed",
            PipelineState::Negotiating => "negotiating",
            PipelineState::Ready => "ready",
            PipelineState::Faulted => "faulted",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// A picture can be read with [`Pipeline::picture`].
    PictureReady,
    /// No picture came out of this call. Keep feeding data.
    NeedMoreData,
    /// A picture came out but drop mode is on. Only its metadata is available.
    Dropped,
}

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("pipeline is already {0}")]
    AlreadyOpen(PipelineState),
    #[error("stream must be decoded in software")]
    SoftwareOnly,
    #[error("stream needs a bitstream converter but none was provided")]
    BitstreamConverterMissing,
    #[error("decoder error: {0}")]
    Decoder(#[from] DecoderError),
    #[error("converter error: {0}")]
    Converter(#[from] ConverterError),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("pipeline is {0}")]
    NotOpen(PipelineState),
    #[error("pipeline has faulted and must be reopened")]
    Faulted,
    #[error("all input buffers are held by the decoder")]
    InputBuffersExhausted,
    #[error("decoder returned unknown CAPTURE buffer {0}")]
    UnknownFrame(usize),
    #[error("decoder error: {0}")]
    Decoder(#[from] DecoderError),
    #[error("converter error: {0}")]
    Converter(#[from] ConverterError),
    #[error("buffer loan error: {0}")]
    Loan(#[from] LoanError),
}

impl DecodeError {
    /// Whether the session is lost. Non-fatal errors only affect the call that returned them.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            DecodeError::NotOpen(_)
                | DecodeError::InputBuffersExhausted
                | DecodeError::Decoder(DecoderError::BufferTooLarge(..))
        )
    }
}

struct ConvertedPath<D: M2mDevice> {
    converter: Converter<D>,
    loans: LoanBook,
    /// CAPTURE buffer holding the last converted picture.
    presented: Option<usize>,
}

enum Shape<D: M2mDevice> {
    Native,
    Converted(ConvertedPath<D>),
}

pub struct Pipeline<D: M2mDevice> {
    options: PipelineOptions,
    state: PipelineState,
    decoder: Decoder<D>,
    shape: Option<Shape<D>>,
    bitstream: Option<Box<dyn BitstreamConverter>>,
    ledger: TimestampLedger,
    picture: Option<PictureInfo>,
    drop_state: bool,
}

impl<D: M2mDevice> Pipeline<D> {
    pub fn new(options: PipelineOptions) -> Self {
        Pipeline {
            decoder: Decoder::new(options.decoder.clone()),
            options,
            state: PipelineState::Closed,
            shape: None,
            bitstream: None,
            ledger: TimestampLedger::new(),
            picture: None,
            drop_state: false,
        }
    }

    /// Provide the converter used for streams the hardware cannot parse as-is. It is consumed
    /// by the next call to [`Pipeline::open`] that needs it.
    pub fn set_bitstream_converter(&mut self, converter: Box<dyn BitstreamConverter>) {
        self.bitstream = Some(converter);
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn is_native(&self) -> bool {
        matches!(self.shape, Some(Shape::Native))
    }

    pub fn name(&self) -> &'static str {
        match self.shape {
            Some(Shape::Native) => "m2m-native",
            Some(Shape::Converted(_)) => "m2m-converted",
            None => "m2m",
        }
    }

    /// Number of submitted access units whose picture has not come out yet.
    pub fn pending_timestamps(&self) -> usize {
        self.ledger.len()
    }

    /// Negotiate a decode session for `stream` with the devices of `namespace`. On failure
    /// everything set up so far is released and the pipeline is closed again.
    pub fn open<N>(&mut self, namespace: &N, stream: &StreamInfo) -> Result<(), OpenError>
    where
        N: DeviceNamespace<Device = D>,
    {
        if self.state != PipelineState::Closed {
            return Err(OpenError::AlreadyOpen(self.state));
        }
        if stream.software_only {
            return Err(OpenError::SoftwareOnly);
        }

        self.state = PipelineState::Negotiating;
        match self.negotiate(namespace, stream) {
            Ok(shape) => {
                self.shape = Some(shape);
                self.state = PipelineState::Ready;
                info!(
                    "Opened {} pipeline for {} stream, pictures of {}x{}",
                    self.name(),
                    stream.codec,
                    self.decoder.decoded_width(),
                    self.decoder.decoded_height()
                );
                Ok(())
            }
            Err(e) => {
                error!("Failed to open pipeline: {}", e);
                self.dispose();
                Err(e)
            }
        }
    }

    fn negotiate<N>(&mut self, namespace: &N, stream: &StreamInfo) -> Result<Shape<D>, OpenError>
    where
        N: DeviceNamespace<Device = D>,
    {
        self.decoder = Decoder::new(self.options.decoder.clone());
        self.decoder.open_device(namespace)?;
        if stream.needs_bitstream_conversion() {
            let converter = self
                .bitstream
                .take()
                .ok_or(OpenError::BitstreamConverterMissing)?;
            self.decoder.set_bitstream_converter(converter);
        }

        self.decoder.setup_output_format(stream)?;
        self.decoder.setup_output_buffers()?;
        self.decoder.queue_header(stream)?;

        let native = self.decoder.is_native() && !self.options.force_converter;
        if native {
            self.decoder.set_capture_format()?;
        }
        let format = self.decoder.get_capture_format()?;
        let crop = self.decoder.get_capture_crop()?;
        let granted = self.decoder.request_capture_buffers()?;

        let shape = if native {
            Shape::Native
        } else {
            let mut converter = Converter::new(self.options.converter.clone());
            converter.open_device(namespace)?;
            converter.setup_output_format(&format, crop)?;
            let (width, height) = self
                .options
                .display_size
                .unwrap_or((crop.width, crop.height));
            converter.setup_capture_format(width, height)?;
            converter.setup_buffers(granted)?;
            Shape::Converted(ConvertedPath {
                converter,
                loans: LoanBook::new(),
                presented: None,
            })
        };

        self.decoder.setup_capture_buffers()?;

        Ok(shape)
    }

    /// Submit one access unit, or nothing if `data` is empty, and try to get a picture out.
    ///
    /// The previous picture is no longer available after this call.
    pub fn decode(&mut self, data: &[u8], dts: i64, pts: i64) -> Result<DecodeStatus, DecodeError> {
        match self.state {
            PipelineState::Ready => (),
            PipelineState::Faulted => return Err(DecodeError::Faulted),
            state => return Err(DecodeError::NotOpen(state)),
        }

        self.picture = None;
        let result = self.decode_access_unit(data, dts, pts);
        if let Err(e) = &result {
            if e.is_fatal() {
                error!("Pipeline faulted: {}", e);
                self.state = PipelineState::Faulted;
            } else {
                debug!("Access unit not decoded: {}", e);
            }
        }

        result
    }

    fn decode_access_unit(
        &mut self,
        data: &[u8],
        dts: i64,
        pts: i64,
    ) -> Result<DecodeStatus, DecodeError> {
        if !data.is_empty() {
            self.submit(data, dts, pts)?;
        }

        // Only the native path keeps frames in the backlog.
        if let Some(index) = self.decoder.remove_first_decoded_capture_buffer() {
            trace!("Giving CAPTURE buffer {} back to the decoder", index);
            self.decoder.requeue_capture_buffer(index)?;
        }

        let frame = match self.decoder.dequeue_decoded_frame()? {
            Some(frame) => frame,
            None => return Ok(DecodeStatus::NeedMoreData),
        };
        trace!("Frame decoded into CAPTURE buffer {}", frame);

        let source = match self.shape.as_mut() {
            Some(Shape::Native) => {
                self.decoder.add_decoded_capture_buffer(frame);
                PictureSource::DecoderCapture(frame)
            }
            Some(Shape::Converted(path)) => match Self::convert(&mut self.decoder, path, frame)? {
                Some(converted) => PictureSource::ConverterCapture(converted),
                None => return Ok(DecodeStatus::NeedMoreData),
            },
            None => return Err(DecodeError::NotOpen(self.state)),
        };

        let timestamps = self.ledger.pop();
        let info = self.picture_info(source, timestamps);
        let status = if info.dropped {
            DecodeStatus::Dropped
        } else {
            DecodeStatus::PictureReady
        };
        self.picture = Some(info);

        Ok(status)
    }

    fn submit(&mut self, data: &[u8], dts: i64, pts: i64) -> Result<(), DecodeError> {
        let index = match self.decoder.first_free_output() {
            Some(index) => index,
            None => self
                .decoder
                .dequeue_output_buffer()?
                .ok_or(DecodeError::InputBuffersExhausted)?,
        };
        self.decoder.send_buffer(index, data)?;
        self.ledger.push(dts, pts);

        Ok(())
    }

    /// Lend decoded `frame` to the converter and collect the picture converted from the
    /// previous one. Returns `None` on the very first frame, which only starts the converter.
    fn convert(
        decoder: &mut Decoder<D>,
        path: &mut ConvertedPath<D>,
        frame: usize,
    ) -> Result<Option<usize>, DecodeError> {
        let converter = &mut path.converter;

        let capture = converter
            .free_capture_buffer(path.presented)
            .ok_or(ConverterError::NoFreeBuffer)?;
        converter.queue_capture_buffer(capture)?;
        let decoded = decoder
            .capture_buffer(frame)
            .ok_or(DecodeError::UnknownFrame(frame))?;
        converter.queue_output_buffer(frame, decoded)?;
        path.loans.lend(frame)?;

        if !converter.is_streaming() {
            converter.stream_on()?;
            debug!("Converter started, first picture comes with the next frame");
            return Ok(None);
        }

        let released = converter.dequeue_output_buffer()?;
        path.loans.mark_converted(released)?;
        let converted = converter.dequeue_capture_buffer()?;
        path.loans.settle(released)?;
        decoder.requeue_capture_buffer(released)?;
        path.presented = Some(converted);

        Ok(Some(converted))
    }

    fn picture_info(&self, source: PictureSource, timestamps: Timestamps) -> PictureInfo {
        let (width, height, format, layout) = match (source, &self.shape) {
            (PictureSource::ConverterCapture(_), Some(Shape::Converted(path))) => {
                let format = path.converter.capture_format();
                let (width, height) = format.map(|f| (f.width, f.height)).unwrap_or_default();
                (width, height, format, PictureFormat::Yuv420Planar)
            }
            _ => (
                self.decoder.decoded_width(),
                self.decoder.decoded_height(),
                self.decoder.capture_format(),
                PictureFormat::Nv12,
            ),
        };

        PictureInfo {
            width,
            height,
            format: layout,
            strides: plane_strides(format, width, layout),
            source,
            pts: timestamps.pts,
            dts: timestamps.dts,
            dropped: self.drop_state,
        }
    }

    /// The picture produced by the last call to [`Pipeline::decode`], if any.
    pub fn picture(&self) -> Option<Picture<'_>> {
        let info = self.picture.as_ref()?;

        let planes = if info.dropped {
            Vec::new()
        } else {
            let buffer = match (info.source, &self.shape) {
                (PictureSource::DecoderCapture(index), _) => self.decoder.capture_buffer(index),
                (PictureSource::ConverterCapture(index), Some(Shape::Converted(path))) => {
                    path.converter.capture_buffer(index)
                }
                _ => None,
            }?;
            buffer
                .planes
                .iter()
                .zip(info.strides.iter())
                .filter_map(|(plane, &stride)| plane.data().map(|data| PicturePlane { data, stride }))
                .collect()
        };

        Some(Picture {
            width: info.width,
            height: info.height,
            format: info.format,
            planes,
            pts: info.pts,
            dts: info.dts,
            dropped: info.dropped,
        })
    }

    /// In drop mode frames still go through both engines, but their pixels are not exposed.
    pub fn set_drop_state(&mut self, drop: bool) {
        self.drop_state = drop;
    }

    /// Forget pending timestamps and hand held frames back to the decoder, e.g. after a seek.
    /// The hardware is not flushed, so frames already in flight will still come out.
    pub fn reset(&mut self) {
        debug!(
            "Resetting pipeline, {} pending timestamps dropped",
            self.ledger.len()
        );
        self.ledger.clear();
        while let Some(index) = self.decoder.remove_first_decoded_capture_buffer() {
            if let Err(e) = self.decoder.requeue_capture_buffer(index) {
                warn!("Failed to requeue CAPTURE buffer {} on reset: {}", index, e);
            }
        }
        self.picture = None;
    }

    /// Release both engines. The converter goes first as it reads from decoder buffers.
    pub fn dispose(&mut self) {
        if let Some(Shape::Converted(mut path)) = self.shape.take() {
            path.converter.dispose();
            path.loans.clear();
        }
        self.decoder.dispose();
        self.ledger.clear();
        self.picture = None;
        self.state = PipelineState::Closed;
    }
}

impl<D: M2mDevice> Drop for Pipeline<D> {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn plane_strides(format: Option<&Format>, width: u32, layout: PictureFormat) -> Vec<u32> {
    let defaults: &[u32] = match layout {
        PictureFormat::Nv12 => &[width, width],
        PictureFormat::Yuv420Planar => &[width, width / 2, width / 2],
    };

    defaults
        .iter()
        .enumerate()
        .map(|(i, &fallback)| format.map_or(fallback, |f| f.stride(i, fallback)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::tests::{h264_stream, HEADER};
    use crate::decoder::Codec;
    use crate::device::sim::{SimConfig, SimDevice, SimNamespace};
    use crate::QueueType;

    const AU: [u8; 5] = [0, 0, 0, 1, 0x65];

    struct Devices {
        decoder: SimDevice,
        converter: SimDevice,
        ns: SimNamespace,
    }

    fn devices(native: bool) -> Devices {
        let decoder = SimDevice::new(SimConfig::decoder(native));
        let converter = SimDevice::new(SimConfig::converter());
        let ns = SimNamespace::new()
            .with_device(decoder.clone())
            .with_device(converter.clone());
        Devices {
            decoder,
            converter,
            ns,
        }
    }

    fn open(native: bool, options: PipelineOptions) -> (Pipeline<SimDevice>, Devices) {
        let devs = devices(native);
        let mut pipeline = Pipeline::new(options);
        pipeline.open(&devs.ns, &h264_stream()).unwrap();
        (pipeline, devs)
    }

    #[test]
    fn test_open_native() {
        let (pipeline, devs) = open(true, PipelineOptions::new());
        assert_eq!(pipeline.state(), PipelineState::Ready);
        assert!(pipeline.is_native());
        assert_eq!(pipeline.name(), "m2m-native");
        assert_eq!(
            devs.decoder.submissions(QueueType::VideoOutputMplane),
            vec![vec![HEADER.len() as u32]]
        );
        // The converter is not touched on the native path.
        assert_eq!(devs.converter.num_buffers(QueueType::VideoOutputMplane), 0);
    }

    #[test]
    fn test_open_converted() {
        let (pipeline, devs) = open(false, PipelineOptions::new());
        assert!(!pipeline.is_native());
        assert_eq!(pipeline.name(), "m2m-converted");
        // One converter OUTPUT slot per decoder CAPTURE buffer.
        assert_eq!(devs.converter.num_buffers(QueueType::VideoOutputMplane), 7);
        assert_eq!(devs.converter.num_buffers(QueueType::VideoCaptureMplane), 3);
        assert_eq!(
            devs.converter.output_crop(),
            Some(crate::Rect::new(0, 0, 1280, 720))
        );

        let (pipeline, _) = open(true, PipelineOptions::new().force_converter());
        assert_eq!(pipeline.name(), "m2m-converted");
    }

    #[test]
    fn test_open_rejections() {
        let devs = devices(true);
        let mut pipeline = Pipeline::new(PipelineOptions::new());
        assert!(matches!(
            pipeline.open(&devs.ns, &h264_stream().software_only()),
            Err(OpenError::SoftwareOnly)
        ));
        assert_eq!(pipeline.state(), PipelineState::Closed);

        let avcc = StreamInfo::new(Codec::H264).with_extradata(vec![1, 0x64, 0, 0x1f, 0xff]);
        assert!(matches!(
            pipeline.open(&devs.ns, &avcc),
            Err(OpenError::BitstreamConverterMissing)
        ));
        assert_eq!(pipeline.state(), PipelineState::Closed);

        pipeline.open(&devs.ns, &h264_stream()).unwrap();
        assert!(matches!(
            pipeline.open(&devs.ns, &h264_stream()),
            Err(OpenError::AlreadyOpen(PipelineState::Ready))
        ));
    }

    #[test]
    fn test_open_vp8_stream() {
        let devs = devices(true);
        let mut pipeline = Pipeline::new(PipelineOptions::new());
        assert!(matches!(
            pipeline.open(&devs.ns, &StreamInfo::new(Codec::Vp8)),
            Err(OpenError::Decoder(DecoderError::UnsupportedCodec(Codec::Vp8)))
        ));
        assert_eq!(pipeline.state(), PipelineState::Closed);
        assert!(devs.decoder.submissions(QueueType::VideoOutputMplane).is_empty());
        assert_eq!(devs.decoder.num_buffers(QueueType::VideoOutputMplane), 0);
    }

    #[test]
    fn test_open_failure_releases_everything() {
        // No converter for a decoder that cannot produce native frames.
        let decoder = SimDevice::new(SimConfig::decoder(false));
        let ns = SimNamespace::new().with_device(decoder.clone());
        let mut pipeline = Pipeline::new(PipelineOptions::new());
        assert!(matches!(
            pipeline.open(&ns, &h264_stream()),
            Err(OpenError::Converter(ConverterError::DeviceNotFound(_)))
        ));
        assert_eq!(pipeline.state(), PipelineState::Closed);
        assert_eq!(decoder.num_buffers(QueueType::VideoOutputMplane), 0);
        assert_eq!(decoder.num_buffers(QueueType::VideoCaptureMplane), 0);
        assert!(!decoder.is_streaming(QueueType::VideoOutputMplane));

        // The converter cannot shadow every decoder buffer.
        let decoder = SimDevice::new(SimConfig::decoder(false));
        let converter = SimDevice::new(SimConfig {
            max_buffers: 4,
            ..SimConfig::converter()
        });
        let ns = SimNamespace::new()
            .with_device(decoder.clone())
            .with_device(converter.clone());
        assert!(matches!(
            pipeline.open(&ns, &h264_stream()),
            Err(OpenError::Converter(ConverterError::NotEnoughBuffers(4, 7)))
        ));
        assert_eq!(decoder.num_buffers(QueueType::VideoCaptureMplane), 0);
        assert_eq!(converter.num_buffers(QueueType::VideoOutputMplane), 0);
        assert_eq!(converter.num_buffers(QueueType::VideoCaptureMplane), 0);

        // Disposing again is harmless, and the pipeline can still be opened.
        pipeline.dispose();
        let devs = devices(true);
        pipeline.open(&devs.ns, &h264_stream()).unwrap();
    }

    #[test]
    fn test_native_decode() {
        let (mut pipeline, devs) = open(true, PipelineOptions::new());
        assert_eq!(
            pipeline.decode(&AU, 0, 0).unwrap(),
            DecodeStatus::PictureReady
        );
        let picture = pipeline.picture().unwrap();
        assert_eq!(picture.format, PictureFormat::Nv12);
        assert_eq!((picture.width, picture.height), (1280, 720));
        assert_eq!(picture.planes.len(), 2);
        assert_eq!(picture.planes[0].stride, 1280);
        assert_eq!(picture.planes[0].data.len(), 1280 * 720);
        assert_eq!(picture.planes[1].data.len(), 1280 * 720 / 2);
        assert_eq!((picture.pts, picture.dts), (Some(0), Some(0)));
        assert!(!picture.dropped);

        // The frame is held until the next call, then handed back.
        let held = pipeline.decoder.first_decoded_capture_buffer().unwrap();
        assert!(!pipeline.decoder.is_capture_queued(held));
        assert_eq!(devs.decoder.num_queued(QueueType::VideoCaptureMplane), 6);
        assert_eq!(
            pipeline.decode(&AU, 1, 1).unwrap(),
            DecodeStatus::PictureReady
        );
        assert!(pipeline.decoder.is_capture_queued(held));
        assert_eq!(pipeline.decoder.backlog_len(), 1);
        assert_eq!(pipeline.picture().unwrap().pts, Some(1));

        // Draining call with no data and nothing decoded.
        assert_eq!(
            pipeline.decode(&[], 0, 0).unwrap(),
            DecodeStatus::NeedMoreData
        );
        assert!(pipeline.picture().is_none());
    }

    #[test]
    fn test_converter_warm_up() {
        let (mut pipeline, devs) = open(false, PipelineOptions::new());
        assert_eq!(
            pipeline.decode(&AU, 0, 0).unwrap(),
            DecodeStatus::NeedMoreData
        );
        assert!(pipeline.picture().is_none());
        assert_eq!(pipeline.pending_timestamps(), 1);
        assert!(devs.converter.is_streaming(QueueType::VideoOutputMplane));
        assert!(devs.converter.is_streaming(QueueType::VideoCaptureMplane));

        assert_eq!(
            pipeline.decode(&AU, 40, 40).unwrap(),
            DecodeStatus::PictureReady
        );
        let picture = pipeline.picture().unwrap();
        assert_eq!((picture.pts, picture.dts), (Some(0), Some(0)));
        assert_eq!(pipeline.pending_timestamps(), 1);
    }

    #[test]
    fn test_converted_picture() {
        let (mut pipeline, _) = open(false, PipelineOptions::new());
        pipeline.decode(&AU, 0, 0).unwrap();
        pipeline.decode(&AU, 1, 1).unwrap();

        let picture = pipeline.picture().unwrap();
        assert_eq!(picture.format, PictureFormat::Yuv420Planar);
        assert_eq!((picture.width, picture.height), (1280, 720));
        let strides: Vec<_> = picture.planes.iter().map(|p| p.stride).collect();
        assert_eq!(strides, vec![1280, 640, 640]);
        let sizes: Vec<_> = picture.planes.iter().map(|p| p.data.len()).collect();
        assert_eq!(sizes, vec![1280 * 720, 1280 * 720 / 4, 1280 * 720 / 4]);
    }

    #[test]
    fn test_display_size_rounded_to_even() {
        let (mut pipeline, _) = open(false, PipelineOptions::new().display_size(641, 361));
        pipeline.decode(&AU, 0, 0).unwrap();
        pipeline.decode(&AU, 1, 1).unwrap();
        let picture = pipeline.picture().unwrap();
        assert_eq!((picture.width, picture.height), (640, 360));
    }

    #[test]
    fn test_decoder_buffer_loaned_until_converted() {
        let (mut pipeline, devs) = open(false, PipelineOptions::new());
        pipeline.decode(&AU, 0, 0).unwrap();
        let path = match pipeline.shape.as_ref() {
            Some(Shape::Converted(path)) => path,
            _ => panic!("expected a converted pipeline"),
        };
        assert_eq!(path.loans.get(0).unwrap().state, LoanState::Lent);
        assert!(!pipeline.decoder.is_capture_queued(0));

        pipeline.decode(&AU, 1, 1).unwrap();
        let path = match pipeline.shape.as_ref() {
            Some(Shape::Converted(path)) => path,
            _ => panic!("expected a converted pipeline"),
        };
        // The first frame was converted and handed back, the second one is now lent.
        assert!(path.loans.get(0).is_none());
        assert!(pipeline.decoder.is_capture_queued(0));
        assert_eq!(path.loans.get(1).unwrap().state, LoanState::Lent);
        assert!(!pipeline.decoder.is_capture_queued(1));
        assert_eq!(path.loans.outstanding(), 1);
        assert_eq!(devs.decoder.num_queued(QueueType::VideoCaptureMplane), 6);
    }

    #[test]
    fn test_converter_capture_rotation() {
        let (mut pipeline, _) = open(false, PipelineOptions::new());
        pipeline.decode(&AU, 0, 0).unwrap();
        let mut presented = Vec::new();
        for ts in 1..8 {
            assert_eq!(
                pipeline.decode(&AU, ts, ts).unwrap(),
                DecodeStatus::PictureReady
            );
            assert_eq!(pipeline.picture().unwrap().pts, Some(ts - 1));
            match pipeline.shape.as_ref() {
                Some(Shape::Converted(path)) => presented.push(path.presented.unwrap()),
                _ => panic!("expected a converted pipeline"),
            }
        }
        // Consecutive pictures never share a buffer.
        assert!(presented.windows(2).all(|w| w[0] != w[1]));
    }

    #[test]
    fn test_timestamps_smallest_first() {
        let (mut pipeline, devs) = open(true, PipelineOptions::new());
        devs.decoder.set_hold_output(true);
        // Submitted in decode order, presented in display order.
        assert_eq!(
            pipeline.decode(&AU, 0, 3).unwrap(),
            DecodeStatus::NeedMoreData
        );
        assert_eq!(
            pipeline.decode(&AU, 1, 1).unwrap(),
            DecodeStatus::NeedMoreData
        );
        assert_eq!(pipeline.pending_timestamps(), 2);
        devs.decoder.set_hold_output(false);

        let mut pts = Vec::new();
        while let DecodeStatus::PictureReady = pipeline.decode(&[], 0, 0).unwrap() {
            pts.push(pipeline.picture().unwrap().pts.unwrap());
        }
        assert_eq!(pts, vec![1, 3]);
        assert_eq!(pipeline.pending_timestamps(), 0);
    }

    #[test]
    fn test_saturated_decoder() {
        let (mut pipeline, devs) = open(true, PipelineOptions::new());
        devs.decoder.set_hold_output(true);
        pipeline.decode(&AU, 0, 0).unwrap();
        // Reclaims the buffer that carried the header.
        pipeline.decode(&AU, 1, 1).unwrap();

        let err = pipeline.decode(&AU, 2, 2).unwrap_err();
        assert!(matches!(err, DecodeError::InputBuffersExhausted));
        assert!(!err.is_fatal());
        assert_eq!(pipeline.state(), PipelineState::Ready);
        assert_eq!(pipeline.pending_timestamps(), 2);

        devs.decoder.set_hold_output(false);
        assert_eq!(
            pipeline.decode(&AU, 2, 2).unwrap(),
            DecodeStatus::PictureReady
        );
        assert_eq!(pipeline.picture().unwrap().pts, Some(0));
    }

    #[test]
    fn test_retry_after_exhausted_input() {
        let (mut pipeline, devs) = open(true, PipelineOptions::new());
        devs.decoder.set_hold_output(true);
        pipeline.decode(&AU, 0, 0).unwrap();
        pipeline.decode(&AU, 1, 1).unwrap();
        assert!(matches!(
            pipeline.decode(&AU, 2, 2),
            Err(DecodeError::InputBuffersExhausted)
        ));
        devs.decoder.set_hold_output(false);

        // An empty call drains a picture, then the same unit goes through.
        let mut pts = Vec::new();
        assert_eq!(
            pipeline.decode(&[], 2, 2).unwrap(),
            DecodeStatus::PictureReady
        );
        pts.push(pipeline.picture().unwrap().pts);
        assert_eq!(
            pipeline.decode(&AU, 2, 2).unwrap(),
            DecodeStatus::PictureReady
        );
        pts.push(pipeline.picture().unwrap().pts);
        assert_eq!(
            pipeline.decode(&[], 3, 3).unwrap(),
            DecodeStatus::PictureReady
        );
        pts.push(pipeline.picture().unwrap().pts);

        assert_eq!(pts, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(pipeline.pending_timestamps(), 0);
    }

    #[test]
    fn test_oversized_access_unit() {
        let (mut pipeline, devs) = open(true, PipelineOptions::new());
        let err = pipeline.decode(&vec![0u8; 2_000_000], 0, 0).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Decoder(DecoderError::BufferTooLarge(2_000_000, 1_572_864))
        ));
        assert!(!err.is_fatal());
        assert_eq!(pipeline.state(), PipelineState::Ready);
        assert_eq!(pipeline.pending_timestamps(), 0);
        assert_eq!(devs.decoder.submissions(QueueType::VideoOutputMplane).len(), 1);

        assert_eq!(
            pipeline.decode(&AU, 1, 1).unwrap(),
            DecodeStatus::PictureReady
        );
        assert_eq!(pipeline.picture().unwrap().pts, Some(1));
    }

    #[test]
    fn test_hardware_fault() {
        let (mut pipeline, devs) = open(true, PipelineOptions::new());
        pipeline.decode(&AU, 0, 0).unwrap();
        devs.decoder.inject_fault();

        let err = pipeline.decode(&AU, 1, 1).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(pipeline.state(), PipelineState::Faulted);
        assert!(matches!(
            pipeline.decode(&AU, 2, 2),
            Err(DecodeError::Faulted)
        ));

        pipeline.dispose();
        assert_eq!(pipeline.state(), PipelineState::Closed);
        assert!(matches!(
            pipeline.decode(&AU, 3, 3),
            Err(DecodeError::NotOpen(PipelineState::Closed))
        ));
        let devs = devices(true);
        pipeline.open(&devs.ns, &h264_stream()).unwrap();
        assert_eq!(
            pipeline.decode(&AU, 4, 4).unwrap(),
            DecodeStatus::PictureReady
        );
    }

    #[test]
    fn test_drop_state() {
        let (mut pipeline, devs) = open(true, PipelineOptions::new());
        pipeline.set_drop_state(true);
        assert_eq!(pipeline.decode(&AU, 0, 7).unwrap(), DecodeStatus::Dropped);
        let picture = pipeline.picture().unwrap();
        assert!(picture.dropped);
        assert!(picture.planes.is_empty());
        assert_eq!(picture.pts, Some(7));
        // Buffers circulate as usual.
        assert_eq!(pipeline.decoder.backlog_len(), 1);
        pipeline.decode(&AU, 1, 8).unwrap();
        assert_eq!(devs.decoder.num_queued(QueueType::VideoCaptureMplane), 6);

        pipeline.set_drop_state(false);
        assert_eq!(
            pipeline.decode(&AU, 2, 9).unwrap(),
            DecodeStatus::PictureReady
        );
        assert_eq!(pipeline.picture().unwrap().planes.len(), 2);
    }

    #[test]
    fn test_reset() {
        let (mut pipeline, devs) = open(true, PipelineOptions::new());
        devs.decoder.set_hold_output(true);
        pipeline.decode(&AU, 0, 0).unwrap();
        devs.decoder.set_hold_output(false);
        pipeline.decode(&AU, 1, 1).unwrap();
        assert!(pipeline.picture().is_some());
        let held = pipeline.decoder.first_decoded_capture_buffer().unwrap();

        pipeline.reset();
        assert_eq!(pipeline.state(), PipelineState::Ready);
        assert_eq!(pipeline.pending_timestamps(), 0);
        assert_eq!(pipeline.decoder.backlog_len(), 0);
        assert!(pipeline.decoder.is_capture_queued(held));
        assert!(pipeline.picture().is_none());

        // The frame still in flight comes out without a timestamp.
        assert_eq!(
            pipeline.decode(&[], 0, 0).unwrap(),
            DecodeStatus::PictureReady
        );
        assert_eq!(pipeline.picture().unwrap().pts, None);
        assert_eq!(
            pipeline.decode(&AU, 100, 100).unwrap(),
            DecodeStatus::PictureReady
        );
        assert_eq!(pipeline.picture().unwrap().pts, Some(100));
    }

    #[test]
    fn test_reset_returns_held_frames() {
        let (mut pipeline, devs) = open(true, PipelineOptions::new());
        // More cycles than there are CAPTURE buffers.
        for ts in 0..10 {
            assert_eq!(
                pipeline.decode(&AU, ts, ts).unwrap(),
                DecodeStatus::PictureReady
            );
            assert_eq!(devs.decoder.num_queued(QueueType::VideoCaptureMplane), 6);
            pipeline.reset();
            assert_eq!(devs.decoder.num_queued(QueueType::VideoCaptureMplane), 7);
        }
    }

    #[test]
    fn test_dispose() {
        let (mut pipeline, devs) = open(false, PipelineOptions::new());
        pipeline.decode(&AU, 0, 0).unwrap();
        pipeline.decode(&AU, 1, 1).unwrap();
        pipeline.dispose();
        assert_eq!(pipeline.state(), PipelineState::Closed);
        assert_eq!(pipeline.name(), "m2m");
        assert!(pipeline.picture().is_none());
        for dev in [&devs.decoder, &devs.converter] {
            for queue in [QueueType::VideoOutputMplane, QueueType::VideoCaptureMplane] {
                assert_eq!(dev.num_buffers(queue), 0);
                assert!(!dev.is_streaming(queue));
            }
        }
        pipeline.dispose();
        assert_eq!(pipeline.state(), PipelineState::Closed);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(PipelineState::Negotiating.to_string(), "negotiating");
        assert_eq!(PipelineState::Faulted.to_string(), "faulted");
    }
}
