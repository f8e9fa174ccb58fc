//! Deterministic in-process M2M device, used to exercise the engine adapters and the pipeline
//! without hardware.
//!
//! A `SimDevice` behaves as either a stateful decoder or a converter:
//!
//! * As a decoder, the first OUTPUT buffer received after STREAMON is the stream header and
//!   produces no frame. Every following non-empty OUTPUT buffer produces one frame, written into
//!   the next queued CAPTURE buffer once CAPTURE is streaming. The CAPTURE format is only known
//!   after the header has been processed.
//! * As a converter, one OUTPUT and one CAPTURE buffer are consumed together once both queues
//!   are streaming.
//!
//! Completion is immediate. The `hold_output` knob keeps OUTPUT buffers in the device to
//! simulate a saturated engine, and `inject_fault` makes every subsequent dequeue and poll fail.
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use nix::errno::Errno;

use super::namespace::{DeviceNamespace, DeviceNode};
use super::{DeviceConfig, DeviceOpenError, M2mDevice, PollResult};
use crate::ioctl::{
    BufferFlags, Capabilities, Capability, CropError, CtrlId, DqBufError, DqBuffer, FmtDesc,
    FormatFlags, GCtrlError, GFmtError, MmapError, QBufError, QBufPlane, QueryBufError,
    QueryBufPlane, QueryBuffer, QueryCapError, ReqbufsError, SFmtError, StreamOffError,
    StreamOnError,
};
use crate::memory::MemoryType;
use crate::{Format, PixelFormat, PlaneLayout, QueueDirection, QueueType, Rect};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimRole {
    Decoder,
    Converter,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub role: SimRole,
    pub driver: String,
    pub output_formats: Vec<PixelFormat>,
    pub capture_formats: Vec<PixelFormat>,
    /// Value of `V4L2_CID_MIN_BUFFERS_FOR_CAPTURE`.
    pub min_capture_buffers: i32,
    /// Size of the decoded frames, as reported by G_FMT on CAPTURE.
    pub coded_size: (u32, u32),
    /// Visible rectangle reported by G_CROP on CAPTURE.
    pub crop: Rect,
    /// Upper bound on the number of buffers granted by REQBUFS.
    pub max_buffers: u32,
    pub hold_output: bool,
    pub m2m: bool,
}

impl SimConfig {
    /// An MFC-like decoder. Without `native`, only the tiled layout is offered on CAPTURE.
    pub fn decoder(native: bool) -> Self {
        SimConfig {
            role: SimRole::Decoder,
            driver: "s5p-mfc-dec".into(),
            output_formats: vec![
                PixelFormat::H264,
                PixelFormat::H263,
                PixelFormat::MPEG1,
                PixelFormat::MPEG2,
                PixelFormat::MPEG4,
                PixelFormat::XVID,
                PixelFormat::VC1_ANNEX_G,
                PixelFormat::VC1_ANNEX_L,
                PixelFormat::VP8,
            ],
            capture_formats: if native {
                vec![PixelFormat::NV12MT, PixelFormat::NV12M]
            } else {
                vec![PixelFormat::NV12MT]
            },
            min_capture_buffers: 4,
            coded_size: (1280, 720),
            crop: Rect::new(0, 0, 1280, 720),
            max_buffers: 32,
            hold_output: false,
            m2m: true,
        }
    }

    /// A FIMC-like scaler.
    pub fn converter() -> Self {
        SimConfig {
            role: SimRole::Converter,
            driver: "fimc.0.m2m".into(),
            output_formats: vec![PixelFormat::NV12MT, PixelFormat::NV12M],
            capture_formats: vec![PixelFormat::YUV420M, PixelFormat::NV12M],
            min_capture_buffers: 0,
            coded_size: (0, 0),
            crop: Rect::default(),
            max_buffers: 32,
            hold_output: false,
            m2m: true,
        }
    }
}

/// Plane layout the simulated hardware uses for raw formats.
fn sim_planes(pixelformat: PixelFormat, width: u32, height: u32) -> Vec<PlaneLayout> {
    let luma = width * height;
    match pixelformat {
        PixelFormat::YUV420M => vec![
            PlaneLayout {
                sizeimage: luma,
                bytesperline: width,
            },
            PlaneLayout {
                sizeimage: luma / 4,
                bytesperline: width / 2,
            },
            PlaneLayout {
                sizeimage: luma / 4,
                bytesperline: width / 2,
            },
        ],
        _ => vec![
            PlaneLayout {
                sizeimage: luma,
                bytesperline: width,
            },
            PlaneLayout {
                sizeimage: luma / 2,
                bytesperline: width,
            },
        ],
    }
}

#[derive(Debug, Default)]
struct SimQueue {
    format: Option<Format>,
    memory: Option<MemoryType>,
    num_buffers: u32,
    queued: VecDeque<(usize, Vec<u32>)>,
    done: VecDeque<DqBuffer>,
    streaming: bool,
    /// `bytesused` of every buffer ever queued, in order.
    submissions: Vec<Vec<u32>>,
}

impl SimQueue {
    fn is_queued(&self, index: usize) -> bool {
        self.queued.iter().any(|(i, _)| *i == index) || self.done.iter().any(|b| b.index == index)
    }
}

#[derive(Debug)]
struct SimState {
    config: SimConfig,
    output: SimQueue,
    capture: SimQueue,
    output_crop: Option<Rect>,
    header_parsed: bool,
    pending_frames: usize,
    fault: bool,
}

impl SimState {
    fn queue(&self, queue: QueueType) -> &SimQueue {
        match queue.direction() {
            QueueDirection::Output => &self.output,
            QueueDirection::Capture => &self.capture,
        }
    }

    fn queue_mut(&mut self, queue: QueueType) -> &mut SimQueue {
        match queue.direction() {
            QueueDirection::Output => &mut self.output,
            QueueDirection::Capture => &mut self.capture,
        }
    }

    fn capture_plane_sizes(&self) -> Vec<u32> {
        self.capture
            .format
            .as_ref()
            .map(|f| f.plane_sizes())
            .unwrap_or_default()
    }

    fn process(&mut self) {
        match self.config.role {
            SimRole::Decoder => self.process_decoder(),
            SimRole::Converter => self.process_converter(),
        }
    }

    /// Once the header is known, CAPTURE defaults to the first supported layout at the coded
    /// size.
    fn parse_header(&mut self) {
        self.header_parsed = true;
        if self.capture.format.is_none() {
            let (width, height) = self.config.coded_size;
            let pixelformat = self.config.capture_formats[0];
            self.capture.format = Some(Format {
                width,
                height,
                pixelformat,
                plane_fmt: sim_planes(pixelformat, width, height),
            });
        }
    }

    fn process_decoder(&mut self) {
        if self.output.streaming && !self.config.hold_output {
            while let Some((index, bytesused)) = self.output.queued.pop_front() {
                if !self.header_parsed {
                    self.parse_header();
                } else if bytesused.iter().any(|&b| b > 0) {
                    self.pending_frames += 1;
                }
                self.output.done.push_back(DqBuffer {
                    index,
                    flags: BufferFlags::DONE,
                    bytesused,
                });
            }
        }

        let plane_sizes = self.capture_plane_sizes();
        while self.pending_frames > 0 && self.capture.streaming {
            match self.capture.queued.pop_front() {
                Some((index, _)) => {
                    self.capture.done.push_back(DqBuffer {
                        index,
                        flags: BufferFlags::DONE,
                        bytesused: plane_sizes.clone(),
                    });
                    self.pending_frames -= 1;
                }
                None => break,
            }
        }
    }

    fn process_converter(&mut self) {
        if !(self.output.streaming && self.capture.streaming) || self.config.hold_output {
            return;
        }

        let plane_sizes = self.capture_plane_sizes();
        while !self.output.queued.is_empty() && !self.capture.queued.is_empty() {
            if let Some((index, bytesused)) = self.output.queued.pop_front() {
                self.output.done.push_back(DqBuffer {
                    index,
                    flags: BufferFlags::DONE,
                    bytesused,
                });
            }
            if let Some((index, _)) = self.capture.queued.pop_front() {
                self.capture.done.push_back(DqBuffer {
                    index,
                    flags: BufferFlags::DONE,
                    bytesused: plane_sizes.clone(),
                });
            }
        }
    }
}

/// Handle to a simulated device. Clones share the same device.
#[derive(Debug, Clone)]
pub struct SimDevice(Rc<RefCell<SimState>>);

impl SimDevice {
    pub fn new(config: SimConfig) -> Self {
        SimDevice(Rc::new(RefCell::new(SimState {
            config,
            output: Default::default(),
            capture: Default::default(),
            output_crop: None,
            header_parsed: false,
            pending_frames: 0,
            fault: false,
        })))
    }

    /// Makes every further dequeue and poll fail as if the hardware had locked up.
    pub fn inject_fault(&self) {
        self.0.borrow_mut().fault = true;
    }

    pub fn set_hold_output(&self, hold: bool) {
        let mut state = self.0.borrow_mut();
        state.config.hold_output = hold;
        state.process();
    }

    pub fn num_buffers(&self, queue: QueueType) -> u32 {
        self.0.borrow().queue(queue).num_buffers
    }

    pub fn is_streaming(&self, queue: QueueType) -> bool {
        self.0.borrow().queue(queue).streaming
    }

    /// Number of buffers currently owned by the device on `queue`, processed or not.
    pub fn num_queued(&self, queue: QueueType) -> usize {
        let state = self.0.borrow();
        let q = state.queue(queue);
        q.queued.len() + q.done.len()
    }

    pub fn submissions(&self, queue: QueueType) -> Vec<Vec<u32>> {
        self.0.borrow().queue(queue).submissions.clone()
    }

    pub fn output_crop(&self) -> Option<Rect> {
        self.0.borrow().output_crop
    }
}

impl M2mDevice for SimDevice {
    type Mapping = Vec<u8>;

    fn query_capability(&self) -> Result<Capability, QueryCapError> {
        let state = self.0.borrow();
        let mut caps = Capabilities::STREAMING;
        if state.config.m2m {
            caps |= Capabilities::VIDEO_M2M_MPLANE;
        }
        Ok(Capability {
            driver: state.config.driver.clone(),
            card: state.config.driver.clone(),
            bus_info: "platform:sim".into(),
            version: 1,
            capabilities: caps | Capabilities::DEVICE_CAPS,
            device_caps: Some(caps),
        })
    }

    fn formats(&self, queue: QueueType) -> Vec<FmtDesc> {
        let state = self.0.borrow();
        let (formats, flags) = match (state.config.role, queue.direction()) {
            (SimRole::Decoder, QueueDirection::Output) => {
                (&state.config.output_formats, FormatFlags::COMPRESSED)
            }
            (_, QueueDirection::Output) => (&state.config.output_formats, FormatFlags::empty()),
            (_, QueueDirection::Capture) => (&state.config.capture_formats, FormatFlags::empty()),
        };
        formats
            .iter()
            .map(|&pixelformat| FmtDesc {
                flags,
                description: pixelformat.to_string(),
                pixelformat,
            })
            .collect()
    }

    fn get_format(&self, queue: QueueType) -> Result<Format, GFmtError> {
        let state = self.0.borrow();
        if state.config.role == SimRole::Decoder
            && queue.direction() == QueueDirection::Capture
            && !state.header_parsed
        {
            return Err(GFmtError::InvalidBufferType);
        }
        state
            .queue(queue)
            .format
            .clone()
            .ok_or(GFmtError::InvalidBufferType)
    }

    fn set_format(&self, queue: QueueType, format: &Format) -> Result<Format, SFmtError> {
        let mut state = self.0.borrow_mut();
        if state.queue(queue).num_buffers > 0 {
            return Err(SFmtError::DeviceBusy);
        }
        let supported = match queue.direction() {
            QueueDirection::Output => &state.config.output_formats,
            QueueDirection::Capture => &state.config.capture_formats,
        };
        if !supported.contains(&format.pixelformat) {
            return Err(SFmtError::InvalidFormat);
        }

        let compressed =
            state.config.role == SimRole::Decoder && queue.direction() == QueueDirection::Output;
        let applied = if compressed {
            Format {
                plane_fmt: vec![PlaneLayout {
                    sizeimage: format.plane_fmt.first().map(|p| p.sizeimage).unwrap_or(0),
                    bytesperline: 0,
                }],
                ..format.clone()
            }
        } else {
            let (width, height) = if state.config.role == SimRole::Decoder {
                state.config.coded_size
            } else {
                (format.width, format.height)
            };
            Format {
                width,
                height,
                pixelformat: format.pixelformat,
                plane_fmt: sim_planes(format.pixelformat, width, height),
            }
        };
        state.queue_mut(queue).format = Some(applied.clone());
        Ok(applied)
    }

    fn get_crop(&self, queue: QueueType) -> Result<Rect, CropError> {
        let state = self.0.borrow();
        match (state.config.role, queue.direction()) {
            (SimRole::Decoder, QueueDirection::Capture) if state.header_parsed => {
                Ok(state.config.crop)
            }
            (SimRole::Converter, QueueDirection::Output) => {
                state.output_crop.ok_or(CropError::NotSupported(queue))
            }
            _ => Err(CropError::NotSupported(queue)),
        }
    }

    fn set_crop(&self, queue: QueueType, rect: Rect) -> Result<(), CropError> {
        let mut state = self.0.borrow_mut();
        match (state.config.role, queue.direction()) {
            (SimRole::Converter, QueueDirection::Output) => {
                state.output_crop = Some(rect);
                Ok(())
            }
            _ => Err(CropError::NotSupported(queue)),
        }
    }

    fn get_control(&self, id: CtrlId) -> Result<i32, GCtrlError> {
        let state = self.0.borrow();
        match (state.config.role, id) {
            (SimRole::Decoder, CtrlId::MinBuffersForCapture) if state.header_parsed => {
                Ok(state.config.min_capture_buffers)
            }
            (SimRole::Decoder, CtrlId::MinBuffersForCapture) => Err(GCtrlError::NotReady),
            _ => Err(GCtrlError::InvalidControl(id)),
        }
    }

    fn request_buffers(
        &self,
        queue: QueueType,
        memory: MemoryType,
        count: u32,
    ) -> Result<u32, ReqbufsError> {
        let mut state = self.0.borrow_mut();
        let max_buffers = state.config.max_buffers;
        let q = state.queue_mut(queue);
        if q.streaming {
            return Err(ReqbufsError::Busy);
        }
        if count > 0 && q.format.is_none() {
            return Err(ReqbufsError::InvalidBufferType(queue, memory));
        }
        q.num_buffers = std::cmp::min(count, max_buffers);
        q.memory = if count > 0 { Some(memory) } else { None };
        q.queued.clear();
        q.done.clear();
        Ok(q.num_buffers)
    }

    fn query_buffer(
        &self,
        queue: QueueType,
        memory: MemoryType,
        index: usize,
    ) -> Result<QueryBuffer, QueryBufError> {
        let state = self.0.borrow();
        let q = state.queue(queue);
        if index >= q.num_buffers as usize || q.memory != Some(memory) {
            return Err(QueryBufError::InvalidIndex(index as u32));
        }
        let planes = q
            .format
            .as_ref()
            .map(|f| f.plane_sizes())
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(plane, length)| QueryBufPlane {
                mem_offset: ((index << 16) | (plane << 12)) as u32,
                length,
            })
            .collect();
        let flags = if q.is_queued(index) {
            BufferFlags::QUEUED
        } else {
            BufferFlags::empty()
        };
        Ok(QueryBuffer {
            index,
            flags,
            planes,
        })
    }

    fn map_plane(&self, plane: &QueryBufPlane) -> Result<Self::Mapping, MmapError> {
        if plane.length == 0 {
            return Err(MmapError::ZeroLength);
        }
        Ok(vec![0u8; plane.length as usize])
    }

    fn queue_buffer(
        &self,
        queue: QueueType,
        memory: MemoryType,
        index: usize,
        planes: &[QBufPlane],
    ) -> Result<(), QBufError> {
        let mut state = self.0.borrow_mut();
        let q = state.queue_mut(queue);
        if index >= q.num_buffers as usize || q.memory != Some(memory) || q.is_queued(index) {
            return Err(QBufError::IoctlError(Errno::EINVAL));
        }
        if planes.iter().any(|p| p.handle.memory_type() != memory) {
            return Err(QBufError::MemoryTypeMismatch(
                planes[0].handle.memory_type(),
                memory,
            ));
        }
        let bytesused: Vec<u32> = planes.iter().map(|p| p.bytesused).collect();
        q.submissions.push(bytesused.clone());
        q.queued.push_back((index, bytesused));
        state.process();
        Ok(())
    }

    fn dequeue_buffer(
        &self,
        queue: QueueType,
        _memory: MemoryType,
    ) -> Result<DqBuffer, DqBufError> {
        let mut state = self.0.borrow_mut();
        if state.fault {
            return Err(DqBufError::IoctlError(Errno::EIO));
        }
        state
            .queue_mut(queue)
            .done
            .pop_front()
            .ok_or(DqBufError::NotReady)
    }

    fn stream_on(&self, queue: QueueType) -> Result<(), StreamOnError> {
        let mut state = self.0.borrow_mut();
        let q = state.queue_mut(queue);
        if q.num_buffers == 0 {
            return Err(StreamOnError::InvalidQueue(queue));
        }
        q.streaming = true;
        state.process();
        Ok(())
    }

    fn stream_off(&self, queue: QueueType) -> Result<(), StreamOffError> {
        let mut state = self.0.borrow_mut();
        let q = state.queue_mut(queue);
        q.streaming = false;
        q.queued.clear();
        q.done.clear();
        Ok(())
    }

    fn poll(&self, direction: QueueDirection, _timeout_ms: i32) -> PollResult {
        let state = self.0.borrow();
        if state.fault {
            return PollResult::Error;
        }
        let q = match direction {
            QueueDirection::Output => &state.output,
            QueueDirection::Capture => &state.capture,
        };
        if q.done.is_empty() {
            PollResult::Busy
        } else {
            PollResult::Ready
        }
    }
}

/// A namespace holding simulated devices. Opening a node returns a handle sharing state with
/// the registered device, so tests can keep inspecting it.
#[derive(Debug, Default)]
pub struct SimNamespace {
    nodes: Vec<(DeviceNode, Option<SimDevice>)>,
}

impl SimNamespace {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_device(self, device: SimDevice) -> Self {
        let name = device.0.borrow().config.driver.clone();
        self.with_node(name, Some(device))
    }

    /// Register a node named `name` that fails to open.
    pub fn with_broken_node(self, name: &str) -> Self {
        self.with_node(name.into(), None)
    }

    fn with_node(mut self, name: String, device: Option<SimDevice>) -> Self {
        let index = self.nodes.len();
        self.nodes.push((
            DeviceNode {
                name,
                path: format!("/dev/video{}", index).into(),
            },
            device,
        ));
        self
    }
}

impl DeviceNamespace for SimNamespace {
    type Device = SimDevice;

    fn find(&self, signature: &str) -> Vec<DeviceNode> {
        self.nodes
            .iter()
            .filter(|(node, _)| node.name.contains(signature))
            .map(|(node, _)| node.clone())
            .collect()
    }

    fn open(
        &self,
        node: &DeviceNode,
        _config: &DeviceConfig,
    ) -> Result<Self::Device, DeviceOpenError> {
        self.nodes
            .iter()
            .find(|(n, _)| n == node)
            .and_then(|(_, device)| device.clone())
            .ok_or_else(|| {
                DeviceOpenError::OpenFailed(node.path.display().to_string(), Errno::ENOENT)
            })
    }
}
