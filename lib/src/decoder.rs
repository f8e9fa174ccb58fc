//! Adapter for the stateful bitstream decoder engine.
//!
//! The decoder owns two queues: OUTPUT receives compressed access units and CAPTURE returns
//! decoded frames in either the engine's tiled layout or, when the device supports it, a
//! native semi-planar layout. Setting it up follows the usual stateful decoder sequence:
//!
//! 1. [`Decoder::open_device`] finds the device and queries its CAPTURE formats,
//! 2. [`Decoder::setup_output_format`] and [`Decoder::setup_output_buffers`] prepare OUTPUT,
//! 3. [`Decoder::queue_header`] submits the stream headers and starts OUTPUT,
//! 4. the CAPTURE format and crop are read back (and on the native path, selected),
//! 5. [`Decoder::request_capture_buffers`] and [`Decoder::setup_capture_buffers`] start CAPTURE.
//!
//! The decoder keeps its state at runtime rather than in its type, so that
//! [`Decoder::dispose`] can tear down whatever was set up when opening fails halfway.
pub mod bitstream;
pub mod codec;

pub use bitstream::{AvcToAnnexB, BitstreamConverter};
pub use codec::{Codec, Framing, StreamInfo};

use std::collections::VecDeque;
use std::fmt;

use log::{debug, info, trace, warn};
use thiserror::Error;

use crate::device::namespace::DeviceNamespace;
use crate::device::{DeviceConfig, DeviceOpenError, M2mDevice, PollResult};
use crate::ioctl::{CropError, CtrlId, GCtrlError, GFmtError, QueryCapError, SFmtError};
use crate::memory::MemoryType;
use crate::queue::{BufferDescriptor, Queue, QueueError};
use crate::{Format, PixelFormat, PlaneLayout, QueueDirection, QueueType, Rect};

/// Driver name of the decoder engine.
pub const DECODER_SIGNATURE: &str = "s5p-mfc-dec";
/// Capacity of each compressed input buffer.
pub const STREAM_BUFFER_SIZE: u32 = 1_572_864;
pub const NUM_OUTPUT_BUFFERS: u32 = 2;
/// CAPTURE buffers allocated on top of the minimum reported by the hardware.
pub const CAPTURE_EXTRA_BUFFERS: u32 = 3;
pub const POLL_TIMEOUT_MS: i32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    pub signature: String,
    pub output_buffers: u32,
    pub output_buffer_size: u32,
    pub capture_extra_buffers: u32,
    pub poll_timeout_ms: i32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        DecoderConfig {
            signature: DECODER_SIGNATURE.into(),
            output_buffers: NUM_OUTPUT_BUFFERS,
            output_buffer_size: STREAM_BUFFER_SIZE,
            capture_extra_buffers: CAPTURE_EXTRA_BUFFERS,
            poll_timeout_ms: POLL_TIMEOUT_MS,
        }
    }
}

impl DecoderConfig {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn signature(self, signature: impl Into<String>) -> Self {
        DecoderConfig {
            signature: signature.into(),
            ..self
        }
    }

    pub fn output_buffer_size(self, output_buffer_size: u32) -> Self {
        DecoderConfig {
            output_buffer_size,
            ..self
        }
    }

    pub fn poll_timeout_ms(self, poll_timeout_ms: i32) -> Self {
        DecoderConfig {
            poll_timeout_ms,
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Closed,
    Opened,
    FormatConfigured,
    BuffersReady,
    Streaming,
    Decoding,
    Disposed,
}

impl DecoderState {
    pub fn name(&self) -> &'static str {
        match self {
            DecoderState::Closed => "closed",
            DecoderState::Opened => "opened",
            DecoderState::FormatConfigured => "format configured",
            DecoderState::BuffersReady => "buffers ready",
            DecoderState::Streaming => "streaming",
            DecoderState::Decoding => "decoding",
            DecoderState::Disposed => "disposed",
        }
    }
}

impl fmt::Display for DecoderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("no decoder device matching {0:?} found")]
    DeviceNotFound(String),
    #[error("error while opening device: {0}")]
    DeviceOpen(#[from] DeviceOpenError),
    #[error("error while querying capabilities: {0}")]
    QueryCap(#[from] QueryCapError),
    #[error("decoder does not produce the {0} format")]
    TiledFormatUnsupported(PixelFormat),
    #[error("codec {0} is not supported by the decoder")]
    UnsupportedCodec(Codec),
    #[error("decoder cannot produce native frames")]
    NativeFormatUnsupported,
    #[error("stream has no header to configure the decoder with")]
    MissingHeader,
    #[error("error while getting format: {0}")]
    GetFormat(#[from] GFmtError),
    #[error("error while setting format: {0}")]
    SetFormat(#[from] SFmtError),
    #[error("error while getting crop rectangle: {0}")]
    Crop(#[from] CropError),
    #[error("error while reading control: {0}")]
    Control(#[from] GCtrlError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("access unit of {0} bytes does not fit into the {1} bytes input buffer")]
    BufferTooLarge(usize, usize),
    #[error("bitstream conversion failed: {0}")]
    Bitstream(anyhow::Error),
    #[error("operation not possible in state {0}")]
    InvalidState(DecoderState),
    #[error("decoder reported an error")]
    HardwareFault,
}

fn align_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) / alignment * alignment
}

pub struct Decoder<D: M2mDevice> {
    config: DecoderConfig,
    device: Option<D>,
    state: DecoderState,
    native_format: bool,
    output: Queue<D::Mapping>,
    capture: Queue<D::Mapping>,
    capture_granted: usize,
    capture_format: Option<Format>,
    crop: Rect,
    bitstream: Option<Box<dyn BitstreamConverter>>,
    backlog: VecDeque<usize>,
}

impl<D: M2mDevice> Decoder<D> {
    pub fn new(config: DecoderConfig) -> Self {
        Decoder {
            config,
            device: None,
            state: DecoderState::Closed,
            native_format: false,
            output: Queue::new(
                QueueType::mplane(QueueDirection::Output),
                MemoryType::Mmap,
            ),
            capture: Queue::new(
                QueueType::mplane(QueueDirection::Capture),
                MemoryType::Mmap,
            ),
            capture_granted: 0,
            capture_format: None,
            crop: Rect::default(),
            bitstream: None,
            backlog: VecDeque::new(),
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn device(&self) -> Option<&D> {
        self.device.as_ref()
    }

    /// Whether the engine can produce frames software can read directly.
    pub fn is_native(&self) -> bool {
        self.native_format
    }

    fn expect_state(&self, expected: DecoderState) -> Result<(), DecoderError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(DecoderError::InvalidState(self.state))
        }
    }

    /// Find and open the decoder device in `namespace`.
    pub fn open_device<N>(&mut self, namespace: &N) -> Result<(), DecoderError>
    where
        N: DeviceNamespace<Device = D>,
    {
        self.expect_state(DecoderState::Closed)?;

        let config = DeviceConfig::new().non_blocking_dqbuf();
        // Reported if no candidate works out.
        let mut last_error: Option<DecoderError> = None;
        for node in namespace.find(&self.config.signature) {
            let device = match namespace.open(&node, &config) {
                Ok(device) => device,
                Err(e) => {
                    warn!("Skipping {}: {}", node.path.display(), e);
                    last_error = Some(e.into());
                    continue;
                }
            };
            let caps = match device.query_capability() {
                Ok(caps) => caps,
                Err(e) => {
                    warn!("Skipping {}: {}", node.path.display(), e);
                    last_error = Some(e.into());
                    continue;
                }
            };
            if !caps.is_streaming_m2m() {
                debug!("{} is not a streaming M2M device, skipping", node.path.display());
                continue;
            }

            let formats = device.formats(self.capture.queue_type());
            for fmt in &formats {
                debug!("{} CAPTURE format: {}", node.path.display(), fmt);
            }
            if !formats.iter().any(|f| f.pixelformat == PixelFormat::NV12MT) {
                warn!(
                    "{} does not produce {}, skipping",
                    node.path.display(),
                    PixelFormat::NV12MT
                );
                last_error = Some(DecoderError::TiledFormatUnsupported(PixelFormat::NV12MT));
                continue;
            }
            self.native_format = formats.iter().any(|f| f.pixelformat == PixelFormat::NV12M);

            info!(
                "Using decoder {} ({}), native output {}",
                node.path.display(),
                caps.driver,
                if self.native_format { "supported" } else { "unsupported" }
            );
            self.device = Some(device);
            self.state = DecoderState::Opened;
            return Ok(());
        }

        Err(last_error
            .unwrap_or_else(|| DecoderError::DeviceNotFound(self.config.signature.clone())))
    }

    /// Configure OUTPUT for the stream's codec.
    pub fn setup_output_format(&mut self, stream: &StreamInfo) -> Result<(), DecoderError> {
        self.expect_state(DecoderState::Opened)?;
        let dev = self
            .device
            .as_ref()
            .ok_or(DecoderError::InvalidState(self.state))?;

        let pixelformat = stream
            .codec
            .pixel_format()
            .ok_or(DecoderError::UnsupportedCodec(stream.codec))?;
        if !dev
            .formats(self.output.queue_type())
            .iter()
            .any(|f| f.pixelformat == pixelformat)
        {
            return Err(DecoderError::UnsupportedCodec(stream.codec));
        }

        let format = Format {
            width: stream.width,
            height: stream.height,
            pixelformat,
            plane_fmt: vec![PlaneLayout {
                sizeimage: self.config.output_buffer_size,
                bytesperline: 0,
            }],
        };
        let applied = dev.set_format(self.output.queue_type(), &format)?;
        debug!(
            "OUTPUT format: {}, {} bytes per buffer",
            applied.pixelformat,
            applied.plane_fmt.first().map(|p| p.sizeimage).unwrap_or(0)
        );
        self.state = DecoderState::FormatConfigured;

        Ok(())
    }

    pub fn setup_output_buffers(&mut self) -> Result<(), DecoderError> {
        self.expect_state(DecoderState::FormatConfigured)?;
        let dev = self
            .device
            .as_ref()
            .ok_or(DecoderError::InvalidState(self.state))?;

        let granted = self.output.request_buffers(dev, self.config.output_buffers)?;
        self.output.map_buffers(dev, granted, false)?;
        self.state = DecoderState::BuffersReady;

        Ok(())
    }

    /// Route access units and headers through `converter` from now on.
    pub fn set_bitstream_converter(&mut self, converter: Box<dyn BitstreamConverter>) {
        self.bitstream = Some(converter);
    }

    /// Submit the stream headers as the first OUTPUT buffer and start OUTPUT streaming.
    pub fn queue_header(&mut self, stream: &StreamInfo) -> Result<(), DecoderError> {
        self.expect_state(DecoderState::BuffersReady)?;
        let dev = self
            .device
            .as_ref()
            .ok_or(DecoderError::InvalidState(self.state))?;

        let header = match &self.bitstream {
            Some(converter) => converter.extra_data(),
            None => stream.extradata.as_slice(),
        };
        if header.is_empty() {
            return Err(DecoderError::MissingHeader);
        }
        let index = self
            .output
            .first_free()
            .ok_or(DecoderError::InvalidState(self.state))?;
        self.output.write_plane(index, 0, header)?;
        self.output.queue_buffer(dev, index)?;
        debug!("Stream header of {} bytes queued", header.len());
        self.output.stream_on(dev)?;

        Ok(())
    }

    /// Select the native semi-planar layout on CAPTURE.
    pub fn set_capture_format(&mut self) -> Result<(), DecoderError> {
        if !self.native_format {
            return Err(DecoderError::NativeFormatUnsupported);
        }
        let dev = self
            .device
            .as_ref()
            .ok_or(DecoderError::InvalidState(self.state))?;

        let current = dev.get_format(self.capture.queue_type())?;
        let format = Format {
            pixelformat: PixelFormat::NV12M,
            plane_fmt: Vec::new(),
            ..current
        };
        let applied = dev.set_format(self.capture.queue_type(), &format)?;
        debug!(
            "CAPTURE format set to {} {}x{}",
            applied.pixelformat, applied.width, applied.height
        );
        self.capture_format = Some(applied);

        Ok(())
    }

    /// Read the CAPTURE format chosen by the hardware after parsing the headers.
    pub fn get_capture_format(&mut self) -> Result<Format, DecoderError> {
        let dev = self
            .device
            .as_ref()
            .ok_or(DecoderError::InvalidState(self.state))?;

        let format = dev.get_format(self.capture.queue_type())?;
        debug!(
            "CAPTURE format: {} {}x{}, {} planes",
            format.pixelformat,
            format.width,
            format.height,
            format.plane_fmt.len()
        );
        self.capture_format = Some(format.clone());

        Ok(format)
    }

    /// Read the visible rectangle of decoded frames. Falls back to the full frame if the
    /// driver does not report one.
    pub fn get_capture_crop(&mut self) -> Result<Rect, DecoderError> {
        let dev = self
            .device
            .as_ref()
            .ok_or(DecoderError::InvalidState(self.state))?;

        self.crop = match dev.get_crop(self.capture.queue_type()) {
            Ok(rect) => rect,
            Err(CropError::NotSupported(_)) => {
                let format = self
                    .capture_format
                    .as_ref()
                    .ok_or(DecoderError::InvalidState(self.state))?;
                warn!("No crop rectangle reported, using the full frame");
                Rect::new(0, 0, format.width, format.height)
            }
            Err(e) => return Err(e.into()),
        };
        debug!("CAPTURE crop: {}", self.crop);

        Ok(self.crop)
    }

    pub fn capture_format(&self) -> Option<&Format> {
        self.capture_format.as_ref()
    }

    pub fn crop(&self) -> Rect {
        self.crop
    }

    /// Width of decoded pictures. On the native path it is rounded up to a multiple of 16 to
    /// match the plane strides.
    pub fn decoded_width(&self) -> u32 {
        let native = self
            .capture_format
            .as_ref()
            .map(|f| f.pixelformat == PixelFormat::NV12M)
            .unwrap_or(false);
        if native {
            align_up(self.crop.width, 16)
        } else {
            self.crop.width
        }
    }

    pub fn decoded_height(&self) -> u32 {
        self.crop.height
    }

    /// Allocate the hardware minimum plus a safety margin of CAPTURE buffers. Returns the
    /// number granted.
    pub fn request_capture_buffers(&mut self) -> Result<usize, DecoderError> {
        let dev = self
            .device
            .as_ref()
            .ok_or(DecoderError::InvalidState(self.state))?;

        let min_buffers = dev.get_control(CtrlId::MinBuffersForCapture)?;
        let count = std::cmp::max(min_buffers, 0) as u32 + self.config.capture_extra_buffers;
        debug!(
            "Decoder needs {} CAPTURE buffers, requesting {}",
            min_buffers, count
        );
        self.capture_granted = self.capture.request_buffers(dev, count)?;

        Ok(self.capture_granted)
    }

    /// Map and queue every CAPTURE buffer, then start CAPTURE streaming.
    pub fn setup_capture_buffers(&mut self) -> Result<(), DecoderError> {
        self.expect_state(DecoderState::BuffersReady)?;
        let dev = self
            .device
            .as_ref()
            .ok_or(DecoderError::InvalidState(self.state))?;

        self.capture.map_buffers(dev, self.capture_granted, true)?;
        self.capture.stream_on(dev)?;
        self.state = DecoderState::Streaming;

        Ok(())
    }

    pub fn num_capture_buffers(&self) -> usize {
        self.capture.num_buffers()
    }

    pub fn num_output_buffers(&self) -> usize {
        self.output.num_buffers()
    }

    pub fn capture_buffer(&self, index: usize) -> Option<&BufferDescriptor<D::Mapping>> {
        self.capture.buffer(index)
    }

    /// An OUTPUT buffer we can fill, if any.
    pub fn first_free_output(&self) -> Option<usize> {
        self.output.first_free()
    }

    /// Copy an access unit into OUTPUT buffer `index` and submit it.
    ///
    /// If a bitstream converter is attached and fails, the unmodified bytes are sent instead.
    pub fn send_buffer(&mut self, index: usize, data: &[u8]) -> Result<(), DecoderError> {
        if !matches!(
            self.state,
            DecoderState::Streaming | DecoderState::Decoding
        ) {
            return Err(DecoderError::InvalidState(self.state));
        }
        let dev = self
            .device
            .as_ref()
            .ok_or(DecoderError::InvalidState(self.state))?;

        let data = match self.bitstream.as_mut() {
            Some(converter) => match converter.convert(data) {
                Ok(()) => converter.convert_buffer(),
                Err(e) => {
                    warn!("Bitstream conversion failed, sending data as-is: {:#}", e);
                    data
                }
            },
            None => data,
        };

        let capacity = self
            .output
            .buffer(index)
            .and_then(|b| b.planes.first())
            .map(|p| p.length as usize)
            .ok_or(QueueError::InvalidIndex(index))?;
        if data.len() > capacity {
            return Err(DecoderError::BufferTooLarge(data.len(), capacity));
        }

        self.output.write_plane(index, 0, data)?;
        self.output.queue_buffer(dev, index)?;
        trace!("{} bytes sent in OUTPUT buffer {}", data.len(), index);
        self.state = DecoderState::Decoding;

        Ok(())
    }

    /// Wait for the hardware to release an OUTPUT buffer.
    ///
    /// Returns the index of the released buffer, or `None` if the engine is saturated and
    /// nothing completed within the poll timeout.
    pub fn dequeue_output_buffer(&mut self) -> Result<Option<usize>, DecoderError> {
        let dev = self
            .device
            .as_ref()
            .ok_or(DecoderError::InvalidState(self.state))?;

        match self.output.poll(dev, self.config.poll_timeout_ms) {
            PollResult::Ready => Ok(self.output.dequeue_buffer(dev)?),
            PollResult::Busy => {
                debug!("Decoder saturated, no OUTPUT buffer released");
                Ok(None)
            }
            PollResult::Error => Err(DecoderError::HardwareFault),
        }
    }

    /// Try to get a decoded frame without waiting. `None` means no frame is ready yet.
    pub fn dequeue_decoded_frame(&mut self) -> Result<Option<usize>, DecoderError> {
        let dev = self
            .device
            .as_ref()
            .ok_or(DecoderError::InvalidState(self.state))?;

        Ok(self.capture.dequeue_buffer(dev)?)
    }

    /// Return a consumed frame to the hardware. Does nothing if it is already queued.
    pub fn requeue_capture_buffer(&mut self, index: usize) -> Result<(), DecoderError> {
        let dev = self
            .device
            .as_ref()
            .ok_or(DecoderError::InvalidState(self.state))?;

        if self.capture.is_queued(index)? {
            trace!("CAPTURE buffer {} already queued", index);
            return Ok(());
        }
        self.capture.queue_buffer(dev, index)?;

        Ok(())
    }

    pub fn is_capture_queued(&self, index: usize) -> bool {
        self.capture.is_queued(index).unwrap_or(false)
    }

    /// Keep a decoded frame out of the hardware until the next cycle.
    pub fn add_decoded_capture_buffer(&mut self, index: usize) {
        self.backlog.push_back(index);
    }

    pub fn first_decoded_capture_buffer(&self) -> Option<usize> {
        self.backlog.front().copied()
    }

    pub fn remove_first_decoded_capture_buffer(&mut self) -> Option<usize> {
        self.backlog.pop_front()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Stop both queues, release all buffers and close the device. Every step is attempted
    /// even if a previous one failed. Can be called at any time, any number of times.
    pub fn dispose(&mut self) {
        if let Some(dev) = self.device.as_ref() {
            for queue in [&mut self.output, &mut self.capture] {
                if let Err(e) = queue.stream_off(dev) {
                    warn!("Failed to stop {} queue: {}", queue.queue_type(), e);
                }
                if let Err(e) = queue.free_buffers(dev) {
                    warn!("Failed to free {} buffers: {}", queue.queue_type(), e);
                }
            }
        }
        if self.device.take().is_some() {
            debug!("Decoder device closed");
        }

        self.capture_granted = 0;
        self.capture_format = None;
        self.crop = Rect::default();
        self.bitstream = None;
        self.backlog.clear();
        if self.state != DecoderState::Closed {
            self.state = DecoderState::Disposed;
        }
    }
}

impl<D: M2mDevice> Drop for Decoder<D> {
    fn drop(&mut self) {
        self.dispose();
    }
}
