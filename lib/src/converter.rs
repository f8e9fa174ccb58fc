//! Adapter for the scaler/format converter engine.
//!
//! The converter is only needed when the decoder can only produce its tiled layout. Its OUTPUT
//! queue uses `USERPTR` memory so that decoded frames can be fed to it straight from the
//! decoder's CAPTURE mappings: converter OUTPUT buffer `i` always borrows decoder CAPTURE
//! buffer `i`. Its CAPTURE queue owns the converted pictures.
use std::ops::Deref;

use log::{debug, info, trace, warn};
use thiserror::Error;

use crate::device::namespace::DeviceNamespace;
use crate::device::{DeviceConfig, DeviceOpenError, M2mDevice, PollResult};
use crate::ioctl::{CropError, QueryCapError, SFmtError};
use crate::memory::MemoryType;
use crate::queue::{BufferDescriptor, Queue, QueueError};
use crate::{Format, PixelFormat, QueueDirection, QueueType, Rect};

/// Driver name of the converter engine.
pub const CONVERTER_SIGNATURE: &str = "fimc";
pub const NUM_CAPTURE_BUFFERS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConverterConfig {
    pub signature: String,
    pub capture_buffers: u32,
    pub poll_timeout_ms: i32,
    /// Layout of converted pictures.
    pub target_format: PixelFormat,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        ConverterConfig {
            signature: CONVERTER_SIGNATURE.into(),
            capture_buffers: NUM_CAPTURE_BUFFERS,
            poll_timeout_ms: crate::decoder::POLL_TIMEOUT_MS,
            target_format: PixelFormat::YUV420M,
        }
    }
}

impl ConverterConfig {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn signature(self, signature: impl Into<String>) -> Self {
        ConverterConfig {
            signature: signature.into(),
            ..self
        }
    }

    pub fn capture_buffers(self, capture_buffers: u32) -> Self {
        ConverterConfig {
            capture_buffers,
            ..self
        }
    }
}

#[derive(Debug, Error)]
pub enum ConverterError {
    #[error("no converter device matching {0:?} found")]
    DeviceNotFound(String),
    #[error("error while opening device: {0}")]
    DeviceOpen(#[from] DeviceOpenError),
    #[error("error while querying capabilities: {0}")]
    QueryCap(#[from] QueryCapError),
    #[error("error while setting format: {0}")]
    SetFormat(#[from] SFmtError),
    #[error("error while setting crop rectangle: {0}")]
    Crop(#[from] CropError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("{0} OUTPUT buffers granted, {1} needed")]
    NotEnoughBuffers(usize, usize),
    #[error("no free CAPTURE buffer")]
    NoFreeBuffer,
    #[error("converter did not complete a {0:?} buffer in time")]
    Timeout(QueueDirection),
    #[error("converter reported an error")]
    HardwareFault,
    #[error("converter device is not open")]
    NotOpen,
}

/// Round down to an even number, as the converter requires.
fn even(value: u32) -> u32 {
    value & !1
}

pub struct Converter<D: M2mDevice> {
    config: ConverterConfig,
    device: Option<D>,
    output: Queue<D::Mapping>,
    capture: Queue<D::Mapping>,
    capture_format: Option<Format>,
}

impl<D: M2mDevice> Converter<D> {
    pub fn new(config: ConverterConfig) -> Self {
        Converter {
            config,
            device: None,
            output: Queue::new(
                QueueType::mplane(QueueDirection::Output),
                MemoryType::UserPtr,
            ),
            capture: Queue::new(
                QueueType::mplane(QueueDirection::Capture),
                MemoryType::Mmap,
            ),
            capture_format: None,
        }
    }

    pub fn device(&self) -> Option<&D> {
        self.device.as_ref()
    }

    pub fn open_device<N>(&mut self, namespace: &N) -> Result<(), ConverterError>
    where
        N: DeviceNamespace<Device = D>,
    {
        let config = DeviceConfig::new().non_blocking_dqbuf();
        let mut last_error: Option<ConverterError> = None;
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
            let accepts_tiled = device
                .formats(self.output.queue_type())
                .iter()
                .any(|f| f.pixelformat == PixelFormat::NV12MT);
            let produces_target = device
                .formats(self.capture.queue_type())
                .iter()
                .any(|f| f.pixelformat == self.config.target_format);
            if !(accepts_tiled && produces_target) {
                debug!(
                    "{} cannot convert {} to {}, skipping",
                    node.path.display(),
                    PixelFormat::NV12MT,
                    self.config.target_format
                );
                continue;
            }

            info!("Using converter {} ({})", node.path.display(), caps.driver);
            self.device = Some(device);
            return Ok(());
        }

        Err(last_error
            .unwrap_or_else(|| ConverterError::DeviceNotFound(self.config.signature.clone())))
    }

    /// Accept the decoder's frames as input, converting only the `crop` area.
    pub fn setup_output_format(
        &mut self,
        decoded: &Format,
        crop: Rect,
    ) -> Result<(), ConverterError> {
        let dev = self.device.as_ref().ok_or(ConverterError::NotOpen)?;

        let applied = dev.set_format(self.output.queue_type(), decoded)?;
        debug!(
            "Converter OUTPUT format: {} {}x{}",
            applied.pixelformat, applied.width, applied.height
        );
        dev.set_crop(self.output.queue_type(), crop)?;
        debug!("Converter OUTPUT crop: {}", crop);

        Ok(())
    }

    /// Set the size of converted pictures, rounded down to even values.
    pub fn setup_capture_format(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<Format, ConverterError> {
        let dev = self.device.as_ref().ok_or(ConverterError::NotOpen)?;

        let format = Format::from((self.config.target_format, (even(width), even(height))));
        let applied = dev.set_format(self.capture.queue_type(), &format)?;
        debug!(
            "Converter CAPTURE format: {} {}x{}",
            applied.pixelformat, applied.width, applied.height
        );
        self.capture_format = Some(applied.clone());

        Ok(applied)
    }

    pub fn capture_format(&self) -> Option<&Format> {
        self.capture_format.as_ref()
    }

    /// Allocate one OUTPUT slot per decoder CAPTURE buffer, and the CAPTURE buffers.
    pub fn setup_buffers(&mut self, decoder_buffers: usize) -> Result<(), ConverterError> {
        let dev = self.device.as_ref().ok_or(ConverterError::NotOpen)?;

        let granted = self.output.request_buffers(dev, decoder_buffers as u32)?;
        if granted < decoder_buffers {
            return Err(ConverterError::NotEnoughBuffers(granted, decoder_buffers));
        }
        self.output.map_buffers(dev, granted, false)?;

        let granted = self
            .capture
            .request_buffers(dev, self.config.capture_buffers)?;
        self.capture.map_buffers(dev, granted, false)?;

        Ok(())
    }

    pub fn num_output_buffers(&self) -> usize {
        self.output.num_buffers()
    }

    pub fn num_capture_buffers(&self) -> usize {
        self.capture.num_buffers()
    }

    /// A CAPTURE buffer we own, other than `exclude`.
    pub fn free_capture_buffer(&self, exclude: Option<usize>) -> Option<usize> {
        self.capture.first_free_except(exclude)
    }

    pub fn queue_capture_buffer(&mut self, index: usize) -> Result<(), ConverterError> {
        let dev = self.device.as_ref().ok_or(ConverterError::NotOpen)?;
        Ok(self.capture.queue_buffer(dev, index)?)
    }

    /// Submit `foreign`, a buffer owned by the decoder, for conversion. It must stay untouched
    /// until [`Converter::dequeue_output_buffer`] returns `index`.
    pub fn queue_output_buffer<F>(
        &mut self,
        index: usize,
        foreign: &BufferDescriptor<F>,
    ) -> Result<(), ConverterError>
    where
        F: Deref<Target = [u8]>,
    {
        let dev = self.device.as_ref().ok_or(ConverterError::NotOpen)?;
        Ok(self.output.queue_borrowed(dev, index, foreign)?)
    }

    pub fn is_streaming(&self) -> bool {
        self.output.is_streaming() && self.capture.is_streaming()
    }

    /// Start both queues.
    pub fn stream_on(&mut self) -> Result<(), ConverterError> {
        let dev = self.device.as_ref().ok_or(ConverterError::NotOpen)?;
        self.output.stream_on(dev)?;
        self.capture.stream_on(dev)?;
        Ok(())
    }

    fn dequeue(
        dev: &D,
        queue: &mut Queue<D::Mapping>,
        timeout_ms: i32,
    ) -> Result<usize, ConverterError> {
        let direction = queue.queue_type().direction();
        match queue.poll(dev, timeout_ms) {
            PollResult::Ready => queue
                .dequeue_buffer(dev)?
                .ok_or(ConverterError::Timeout(direction)),
            PollResult::Busy => Err(ConverterError::Timeout(direction)),
            PollResult::Error => Err(ConverterError::HardwareFault),
        }
    }

    /// Wait for the converter to release a borrowed input buffer and return its index.
    pub fn dequeue_output_buffer(&mut self) -> Result<usize, ConverterError> {
        let dev = self.device.as_ref().ok_or(ConverterError::NotOpen)?;
        let index = Self::dequeue(dev, &mut self.output, self.config.poll_timeout_ms)?;
        trace!("Converter released input buffer {}", index);
        Ok(index)
    }

    /// Wait for a converted picture and return its CAPTURE buffer index.
    pub fn dequeue_capture_buffer(&mut self) -> Result<usize, ConverterError> {
        let dev = self.device.as_ref().ok_or(ConverterError::NotOpen)?;
        let index = Self::dequeue(dev, &mut self.capture, self.config.poll_timeout_ms)?;
        trace!("Converted picture in buffer {}", index);
        Ok(index)
    }

    pub fn capture_buffer(&self, index: usize) -> Option<&BufferDescriptor<D::Mapping>> {
        self.capture.buffer(index)
    }

    /// Best-effort teardown. Safe to call repeatedly.
    pub fn dispose(&mut self) {
        if let Some(dev) = self.device.as_ref() {
            for queue in [&mut self.output, &mut self.capture] {
                if let Err(e) = queue.stream_off(dev) {
                    warn!("Failed to stop converter {} queue: {}", queue.queue_type(), e);
                }
                if let Err(e) = queue.free_buffers(dev) {
                    warn!("Failed to free converter {} buffers: {}", queue.queue_type(), e);
                }
            }
        }
        if self.device.take().is_some() {
            debug!("Converter device closed");
        }
        self.capture_format = None;
    }
}

impl<D: M2mDevice> Drop for Converter<D> {
    fn drop(&mut self) {
        self.dispose();
    }
}
