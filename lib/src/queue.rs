//! Codec-agnostic management of one hardware buffer queue.
//!
//! A [`Queue`] tracks the buffers allocated on one side of an M2M device, their mappings, and
//! whether each of them is currently owned by the hardware (queued) or by us (free). Buffer
//! indices are stable for as long as the buffers stay allocated.
//!
//! Nothing here retries: a dequeue that finds nothing ready returns `Ok(None)` and it is up to
//! the engine adapters to decide what to do about it.
use std::ops::Deref;

use log::{debug, trace, warn};
use thiserror::Error;

use crate::device::{M2mDevice, PollResult};
use crate::ioctl::{
    DqBufError, MmapError, QBufError, QBufPlane, QueryBufError, ReqbufsError, StreamOffError,
    StreamOnError,
};
use crate::memory::MemoryType;
use crate::QueueType;

/// One plane of a buffer.
#[derive(Debug)]
pub struct PlaneDescriptor<M> {
    /// Size of the plane's memory.
    pub length: u32,
    /// Offset to pass to `mmap()`. Unused for `USERPTR` buffers.
    pub offset: u32,
    /// Bytes of valid data: set before queueing an OUTPUT buffer, updated by dequeue.
    pub bytesused: u32,
    /// Mapping of the plane, for `MMAP` buffers only.
    pub mapping: Option<M>,
}

impl<M: Deref<Target = [u8]>> PlaneDescriptor<M> {
    /// Valid data of the plane, if it is mapped.
    pub fn data(&self) -> Option<&[u8]> {
        self.mapping.as_ref().map(|m| {
            let len = std::cmp::min(self.bytesused as usize, m.len());
            &m[..len]
        })
    }

    /// The whole mapped memory of the plane.
    pub fn memory(&self) -> Option<&[u8]> {
        self.mapping.as_deref()
    }
}

#[derive(Debug)]
pub struct BufferDescriptor<M> {
    pub index: usize,
    pub planes: Vec<PlaneDescriptor<M>>,
    queued: bool,
}

impl<M> BufferDescriptor<M> {
    /// Whether the hardware currently owns this buffer.
    pub fn is_queued(&self) -> bool {
        self.queued
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("error while requesting buffers: {0}")]
    Reqbufs(#[from] ReqbufsError),
    #[error("error while querying buffer: {0}")]
    QueryBuf(#[from] QueryBufError),
    #[error("error while mapping buffer: {0}")]
    Mmap(#[from] MmapError),
    #[error("error while queueing buffer: {0}")]
    QBuf(#[from] QBufError),
    #[error("error while dequeueing buffer: {0}")]
    DqBuf(#[from] DqBufError),
    #[error("error while starting stream: {0}")]
    StreamOn(#[from] StreamOnError),
    #[error("error while stopping stream: {0}")]
    StreamOff(#[from] StreamOffError),
    #[error("buffer {0} does not exist")]
    InvalidIndex(usize),
    #[error("buffer {0} is already queued")]
    AlreadyQueued(usize),
    #[error("{0} bytes do not fit into a plane of {1} bytes")]
    TooLarge(usize, usize),
    #[error("plane {1} of buffer {0} is not mapped")]
    NotMapped(usize, usize),
    #[error("operation not possible with {0:?} memory")]
    WrongMemoryType(MemoryType),
}

/// One direction of an M2M device.
#[derive(Debug)]
pub struct Queue<M> {
    queue_type: QueueType,
    memory: MemoryType,
    buffers: Vec<BufferDescriptor<M>>,
    requested: bool,
    streaming: bool,
}

impl<M: Deref<Target = [u8]>> Queue<M> {
    pub fn new(queue_type: QueueType, memory: MemoryType) -> Self {
        Queue {
            queue_type,
            memory,
            buffers: Vec::new(),
            requested: false,
            streaming: false,
        }
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn memory(&self) -> MemoryType {
        self.memory
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn num_queued_buffers(&self) -> usize {
        self.buffers.iter().filter(|b| b.queued).count()
    }

    pub fn num_free_buffers(&self) -> usize {
        self.num_buffers() - self.num_queued_buffers()
    }

    pub fn buffer(&self, index: usize) -> Option<&BufferDescriptor<M>> {
        self.buffers.get(index)
    }

    pub fn buffers(&self) -> &[BufferDescriptor<M>] {
        &self.buffers
    }

    /// Index of the first buffer we own, if any.
    pub fn first_free(&self) -> Option<usize> {
        self.buffers.iter().position(|b| !b.queued)
    }

    /// First buffer we own that is not `exclude`.
    pub fn first_free_except(&self, exclude: Option<usize>) -> Option<usize> {
        self.buffers
            .iter()
            .position(|b| !b.queued && Some(b.index) != exclude)
    }

    pub fn is_queued(&self, index: usize) -> Result<bool, QueueError> {
        self.buffers
            .get(index)
            .map(|b| b.queued)
            .ok_or(QueueError::InvalidIndex(index))
    }

    /// Allocate `count` buffers and return how many the driver actually granted. The grant is
    /// what every further operation works with.
    pub fn request_buffers<D>(&mut self, dev: &D, count: u32) -> Result<usize, QueueError>
    where
        D: M2mDevice<Mapping = M>,
    {
        self.buffers.clear();
        let granted = dev.request_buffers(self.queue_type, self.memory, count)?;
        self.requested = true;
        debug!(
            "{} buffers requested on {} queue, {} granted",
            count, self.queue_type, granted
        );

        Ok(granted as usize)
    }

    /// Build the descriptors of the `granted` buffers. `MMAP` planes are mapped. `bytesused` is
    /// pre-filled with the length of each plane. With `auto_queue`, every buffer is handed to
    /// the hardware right away, as CAPTURE queues must be filled before streaming.
    pub fn map_buffers<D>(
        &mut self,
        dev: &D,
        granted: usize,
        auto_queue: bool,
    ) -> Result<(), QueueError>
    where
        D: M2mDevice<Mapping = M>,
    {
        self.buffers.clear();
        for index in 0..granted {
            let query = dev.query_buffer(self.queue_type, self.memory, index)?;
            let planes = query
                .planes
                .iter()
                .map(|plane| {
                    let mapping = match self.memory {
                        MemoryType::Mmap => Some(dev.map_plane(plane)?),
                        MemoryType::UserPtr => None,
                    };
                    Ok(PlaneDescriptor {
                        length: plane.length,
                        offset: plane.mem_offset,
                        bytesused: plane.length,
                        mapping,
                    })
                })
                .collect::<Result<Vec<_>, QueueError>>()?;
            trace!(
                "{} buffer {}: {} planes",
                self.queue_type,
                index,
                planes.len()
            );
            self.buffers.push(BufferDescriptor {
                index,
                planes,
                queued: false,
            });
        }

        if auto_queue {
            for index in 0..self.buffers.len() {
                self.queue_buffer(dev, index)?;
            }
        }

        Ok(())
    }

    /// Copy `data` into plane `plane` of buffer `index` and record its size.
    pub fn write_plane(&mut self, index: usize, plane: usize, data: &[u8]) -> Result<(), QueueError>
    where
        M: std::ops::DerefMut<Target = [u8]>,
    {
        let buffer = self
            .buffers
            .get_mut(index)
            .ok_or(QueueError::InvalidIndex(index))?;
        if buffer.queued {
            return Err(QueueError::AlreadyQueued(index));
        }
        let desc = buffer
            .planes
            .get_mut(plane)
            .ok_or(QueueError::NotMapped(index, plane))?;
        let mapping = desc
            .mapping
            .as_mut()
            .ok_or(QueueError::NotMapped(index, plane))?;
        if data.len() > mapping.len() {
            return Err(QueueError::TooLarge(data.len(), mapping.len()));
        }
        mapping[..data.len()].copy_from_slice(data);
        desc.bytesused = data.len() as u32;

        Ok(())
    }

    /// Hand buffer `index` of an `MMAP` queue to the hardware.
    pub fn queue_buffer<D>(&mut self, dev: &D, index: usize) -> Result<(), QueueError>
    where
        D: M2mDevice<Mapping = M>,
    {
        if self.memory != MemoryType::Mmap {
            return Err(QueueError::WrongMemoryType(self.memory));
        }
        let buffer = self
            .buffers
            .get_mut(index)
            .ok_or(QueueError::InvalidIndex(index))?;
        if buffer.queued {
            return Err(QueueError::AlreadyQueued(index));
        }

        let planes: Vec<QBufPlane> = buffer
            .planes
            .iter()
            .map(|p| QBufPlane::new_mmap(p.bytesused))
            .collect();
        dev.queue_buffer(self.queue_type, self.memory, index, &planes)?;
        buffer.queued = true;
        trace!("{} buffer {} queued", self.queue_type, index);

        Ok(())
    }

    /// Hand buffer `index` of a `USERPTR` queue to the hardware, backed by the mapped planes of
    /// `foreign`, a buffer owned by another queue.
    ///
    /// The caller must keep `foreign` alive and untouched until this buffer is dequeued.
    pub fn queue_borrowed<D, F>(
        &mut self,
        dev: &D,
        index: usize,
        foreign: &BufferDescriptor<F>,
    ) -> Result<(), QueueError>
    where
        D: M2mDevice<Mapping = M>,
        F: Deref<Target = [u8]>,
    {
        if self.memory != MemoryType::UserPtr {
            return Err(QueueError::WrongMemoryType(self.memory));
        }
        let buffer = self
            .buffers
            .get_mut(index)
            .ok_or(QueueError::InvalidIndex(index))?;
        if buffer.queued {
            return Err(QueueError::AlreadyQueued(index));
        }

        let planes = foreign
            .planes
            .iter()
            .enumerate()
            .map(|(i, p)| match &p.mapping {
                Some(mapping) => Ok(QBufPlane::new_userptr(
                    p.bytesused,
                    mapping.as_ptr() as usize,
                    p.length,
                )),
                None => Err(QueueError::NotMapped(foreign.index, i)),
            })
            .collect::<Result<Vec<_>, _>>()?;
        dev.queue_buffer(self.queue_type, self.memory, index, &planes)?;
        buffer.queued = true;
        trace!(
            "{} buffer {} queued, borrowing foreign buffer {}",
            self.queue_type,
            index,
            foreign.index
        );

        Ok(())
    }

    /// Retrieve a buffer the hardware is done with. Returns `Ok(None)` if none is ready yet.
    pub fn dequeue_buffer<D>(&mut self, dev: &D) -> Result<Option<usize>, QueueError>
    where
        D: M2mDevice<Mapping = M>,
    {
        let dqbuf = match dev.dequeue_buffer(self.queue_type, self.memory) {
            Ok(dqbuf) => dqbuf,
            Err(DqBufError::NotReady) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let index = dqbuf.index;
        let buffer = self
            .buffers
            .get_mut(index)
            .ok_or(QueueError::InvalidIndex(index))?;
        if !buffer.queued {
            warn!(
                "{} buffer {} dequeued but was not queued",
                self.queue_type, index
            );
        }
        buffer.queued = false;
        for (plane, bytesused) in buffer.planes.iter_mut().zip(dqbuf.bytesused.iter()) {
            plane.bytesused = *bytesused;
        }
        if dqbuf.has_error() {
            warn!("{} buffer {} dequeued with error flag", self.queue_type, index);
        }
        trace!("{} buffer {} dequeued", self.queue_type, index);

        Ok(Some(index))
    }

    pub fn stream_on<D>(&mut self, dev: &D) -> Result<(), QueueError>
    where
        D: M2mDevice<Mapping = M>,
    {
        dev.stream_on(self.queue_type)?;
        self.streaming = true;
        debug!("{} queue streaming", self.queue_type);
        Ok(())
    }

    /// Stop streaming. All buffers return to our ownership.
    pub fn stream_off<D>(&mut self, dev: &D) -> Result<(), QueueError>
    where
        D: M2mDevice<Mapping = M>,
    {
        if !self.streaming {
            return Ok(());
        }
        self.streaming = false;
        for buffer in self.buffers.iter_mut() {
            buffer.queued = false;
        }
        dev.stream_off(self.queue_type)?;
        debug!("{} queue stopped", self.queue_type);
        Ok(())
    }

    pub fn poll<D>(&self, dev: &D, timeout_ms: i32) -> PollResult
    where
        D: M2mDevice<Mapping = M>,
    {
        dev.poll(self.queue_type.direction(), timeout_ms)
    }

    /// Unmap and release all buffers. Works on queues whose allocation never completed.
    pub fn free_buffers<D>(&mut self, dev: &D) -> Result<(), QueueError>
    where
        D: M2mDevice<Mapping = M>,
    {
        // Mappings must go before the driver can release the memory.
        self.buffers.clear();
        if !self.requested {
            return Ok(());
        }
        self.requested = false;
        dev.request_buffers(self.queue_type, self.memory, 0)?;
        debug!("{} buffers released", self.queue_type);
        Ok(())
    }
}
