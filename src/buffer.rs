//! Memory-mapped capture buffers and their ownership bookkeeping.

use std::ptr::NonNull;
use std::slice;

use crate::error::{CaptureError, Result};

/// Who may touch a mapped buffer right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Owner {
    /// Queued; the device may write into it.
    Device,
    /// Dequeued or idle; the process may read it.
    Process,
}

/// One kernel buffer mapped into process memory.
///
/// The mapping is owned by the session that created it and released through
/// [`crate::CaptureDevice::unmap_buffer`].
#[derive(Debug)]
pub struct MappedBuffer {
    index: u32,
    ptr: NonNull<u8>,
    len: usize,
    owner: Owner,
}

// The mapping is exclusively owned and only read while the process owns it.
#[allow(unsafe_code)]
unsafe impl Send for MappedBuffer {}

impl MappedBuffer {
    /// Wrap a mapped region.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` bytes that stay mapped until the buffer is
    /// handed back to `unmap_buffer`, and nothing else may write to them while
    /// the buffer is process-owned.
    #[allow(unsafe_code)]
    pub const unsafe fn from_raw_parts(index: u32, ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            index,
            ptr,
            len,
            owner: Owner::Process,
        }
    }

    /// Kernel-assigned index.
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Capacity in bytes.
    pub const fn capacity(&self) -> usize {
        self.len
    }

    /// Start of the mapped region, for unmapping.
    pub const fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// The first `used` bytes, if the buffer is process-owned and large enough.
    pub(crate) fn payload(&self, used: usize) -> Option<&[u8]> {
        if self.owner != Owner::Process || used > self.len {
            return None;
        }
        // SAFETY: the region is mapped for `len` bytes and the device does not
        // write to a dequeued buffer.
        #[allow(unsafe_code)]
        let bytes = unsafe { slice::from_raw_parts(self.ptr.as_ptr(), used) };
        Some(bytes)
    }
}

/// Fixed set of mapped buffers indexed by their kernel index.
#[derive(Debug, Default)]
pub struct BufferRing {
    buffers: Vec<MappedBuffer>,
}

impl BufferRing {
    /// Create an empty ring.
    pub const fn new() -> Self {
        Self {
            buffers: Vec::new(),
        }
    }

    /// Number of mapped buffers.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether no buffer is mapped.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Index the next pushed buffer must carry.
    pub fn next_index(&self) -> usize {
        self.buffers.len()
    }

    /// Add a freshly mapped buffer. Its index must equal [`BufferRing::next_index`].
    pub fn push(&mut self, buffer: MappedBuffer) {
        debug_assert_eq!(buffer.index as usize, self.buffers.len());
        self.buffers.push(buffer);
    }

    #[cfg(test)]
    fn get(&self, index: u32) -> Option<&MappedBuffer> {
        self.buffers.get(index as usize)
    }

    /// Iterate over all buffers in index order.
    pub fn iter(&self) -> impl Iterator<Item = &MappedBuffer> {
        self.buffers.iter()
    }

    /// Number of buffers currently queued on the device.
    pub fn queued(&self) -> usize {
        self.buffers
            .iter()
            .filter(|buf| buf.owner == Owner::Device)
            .count()
    }

    /// Record that buffer `index` was handed to the device.
    pub fn check_in(&mut self, index: u32) -> Result<()> {
        let buffer = self.slot(index)?;
        if buffer.owner == Owner::Device {
            return Err(CaptureError::Fault(format!("buffer {index} is already queued")));
        }
        buffer.owner = Owner::Device;
        Ok(())
    }

    /// Record that buffer `index` came back from the device and return it.
    pub fn check_out(&mut self, index: u32) -> Result<&MappedBuffer> {
        let buffer = self.slot(index)?;
        if buffer.owner == Owner::Process {
            return Err(CaptureError::Fault(format!("buffer {index} was not queued")));
        }
        buffer.owner = Owner::Process;
        Ok(buffer)
    }

    /// Mark every buffer process-owned, as after stream-off.
    pub fn reclaim_all(&mut self) {
        for buffer in &mut self.buffers {
            buffer.owner = Owner::Process;
        }
    }

    /// Remove all buffers for unmapping.
    pub fn drain(&mut self) -> impl Iterator<Item = MappedBuffer> + '_ {
        self.buffers.drain(..)
    }

    fn slot(&mut self, index: u32) -> Result<&mut MappedBuffer> {
        let count = self.buffers.len();
        self.buffers.get_mut(index as usize).ok_or_else(|| {
            CaptureError::Fault(format!("buffer index {index} out of range ({count} mapped)"))
        })
    }
}
