//! Simulated capture device for testing without hardware.
//!
//! The mock keeps its own "kernel" buffer storage, honours the queue/dequeue
//! protocol and lets tests inject frames and failures. Clones share state, so a
//! test can keep a probe while the session owns the device.

#![allow(unsafe_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::ptr::NonNull;
use std::rc::Rc;
use std::time::Duration;

use crate::buffer::MappedBuffer;
use crate::error::{CaptureError, Result};
use crate::traits::{
    BufferPlacement, CaptureDevice, DequeuedBuffer, DeviceCapabilities, Format, Readiness,
};

/// Device operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    /// Capability query.
    QueryCaps,
    /// Format negotiation.
    SetFormat,
    /// Bitrate control.
    SetBitrate,
    /// Buffer request.
    RequestBuffers,
    /// Mapping of the given buffer index.
    Map(u32),
    /// Unmapping of the given buffer index.
    Unmap(u32),
    /// Queueing of the given buffer index.
    Queue(u32),
    /// Stream on.
    StreamOn,
    /// Stream off.
    StreamOff,
    /// Closing the descriptor.
    Close,
}

/// Record of a protocol call, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockCall {
    /// Buffer `index` was queued.
    Queue(u32),
    /// Buffer `index` was dequeued.
    Dequeue(u32),
    /// Streaming was turned on.
    StreamOn,
    /// Streaming was turned off.
    StreamOff,
}

struct Slot {
    // Backing storage, only ever accessed through `ptr`.
    _storage: Box<[u8]>,
    ptr: NonNull<u8>,
    len: usize,
    mapped: bool,
}

struct MockState {
    capabilities: DeviceCapabilities,
    buffer_len: usize,
    grant_limit: Option<u32>,
    format: Option<Format>,
    bitrate: Option<u32>,
    slots: Vec<Slot>,
    queued: VecDeque<u32>,
    filled: VecDeque<(u32, u32)>,
    streaming: bool,
    closed: bool,
    interrupt_next_wait: bool,
    spurious_next_wait: bool,
    failures: Vec<MockOp>,
    calls: Vec<MockCall>,
    unmapped: usize,
    sequence: u32,
}

/// Mock device for testing without hardware.
#[derive(Clone)]
pub struct MockDevice {
    state: Rc<RefCell<MockState>>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Create a capture+streaming device with 64 KiB buffers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(MockState {
                capabilities: DeviceCapabilities {
                    driver: "mock".to_owned(),
                    card: "Mock Camera".to_owned(),
                    bus_info: "mock:0".to_owned(),
                    can_capture: true,
                    can_stream: true,
                },
                buffer_len: 64 * 1024,
                grant_limit: None,
                format: None,
                bitrate: None,
                slots: Vec::new(),
                queued: VecDeque::new(),
                filled: VecDeque::new(),
                streaming: false,
                closed: false,
                interrupt_next_wait: false,
                spurious_next_wait: false,
                failures: Vec::new(),
                calls: Vec::new(),
                unmapped: 0,
                sequence: 0,
            })),
        }
    }

    /// Set the capabilities for this mock device.
    #[must_use]
    pub fn with_capabilities(self, capabilities: DeviceCapabilities) -> Self {
        self.state.borrow_mut().capabilities = capabilities;
        self
    }

    /// Set the length of every allocated buffer.
    #[must_use]
    pub fn with_buffer_len(self, len: usize) -> Self {
        self.state.borrow_mut().buffer_len = len;
        self
    }

    /// Grant at most `count` buffers on request.
    #[must_use]
    pub fn with_grant_limit(self, count: u32) -> Self {
        self.state.borrow_mut().grant_limit = Some(count);
        self
    }

    /// Make the next `op` fail with `EIO`.
    pub fn fail_on(&self, op: MockOp) {
        self.state.borrow_mut().failures.push(op);
    }

    /// Make the next readiness wait report an interrupt.
    pub fn interrupt_next_wait(&self) {
        self.state.borrow_mut().interrupt_next_wait = true;
    }

    /// Make the next readiness wait report ready although no buffer is filled.
    pub fn wake_next_wait(&self) {
        self.state.borrow_mut().spurious_next_wait = true;
    }

    /// Write a frame into the next queued buffer. Returns its index, or `None`
    /// when the device owns no free buffer.
    pub fn inject_frame(&self, data: &[u8]) -> Option<u32> {
        let mut state = self.state.borrow_mut();
        let index = *state.queued.front()?;
        let slot = state.slots.get(index as usize)?;
        if data.len() > slot.len {
            return None;
        }
        // SAFETY: the slot is queued, so the process does not read it, and
        // the storage holds `len` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), slot.ptr.as_ptr(), data.len());
        }
        state.queued.pop_front();
        let used = u32::try_from(data.len()).ok()?;
        state.filled.push_back((index, used));
        Some(index)
    }

    /// Report a filled buffer with a used-byte count, without writing data.
    pub fn inject_bytes_used(&self, bytes_used: u32) -> Option<u32> {
        let mut state = self.state.borrow_mut();
        let index = state.queued.pop_front()?;
        state.filled.push_back((index, bytes_used));
        Some(index)
    }

    /// Start of buffer `index` in device memory.
    pub fn buffer_ptr(&self, index: u32) -> Option<*const u8> {
        self.state
            .borrow()
            .slots
            .get(index as usize)
            .map(|slot| slot.ptr.as_ptr().cast_const())
    }

    /// Number of buffers currently queued and empty.
    pub fn queued_count(&self) -> usize {
        self.state.borrow().queued.len()
    }

    /// Number of buffers currently mapped.
    pub fn mapped_count(&self) -> usize {
        self.state.borrow().slots.iter().filter(|slot| slot.mapped).count()
    }

    /// Number of successful unmaps.
    pub fn unmapped_count(&self) -> usize {
        self.state.borrow().unmapped
    }

    /// Whether streaming is on.
    pub fn is_streaming(&self) -> bool {
        self.state.borrow().streaming
    }

    /// Whether the descriptor was closed.
    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    /// Last format set on the device.
    pub fn format(&self) -> Option<Format> {
        self.state.borrow().format.clone()
    }

    /// Last bitrate set on the device.
    pub fn bitrate(&self) -> Option<u32> {
        self.state.borrow().bitrate
    }

    /// Protocol calls seen so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.borrow().calls.clone()
    }

    fn check(&self, op: MockOp) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(os_error("closed", libc::EBADF));
        }
        if let Some(pos) = state.failures.iter().position(|failure| *failure == op) {
            state.failures.remove(pos);
            return Err(os_error("injected", libc::EIO));
        }
        Ok(())
    }
}

fn os_error(op: &'static str, errno: i32) -> CaptureError {
    CaptureError::io(op, io::Error::from_raw_os_error(errno))
}

impl CaptureDevice for MockDevice {
    fn query_capabilities(&mut self) -> Result<DeviceCapabilities> {
        self.check(MockOp::QueryCaps)?;
        Ok(self.state.borrow().capabilities.clone())
    }

    fn set_format(&mut self, format: &Format) -> Result<Format> {
        self.check(MockOp::SetFormat)?;
        let mut state = self.state.borrow_mut();
        // Drivers round odd dimensions down to even ones.
        let mut applied = format.clone();
        applied.width &= !1;
        applied.height &= !1;
        if applied.size == 0 {
            applied.size = u32::try_from(state.buffer_len).unwrap_or(u32::MAX);
        }
        state.format = Some(applied.clone());
        Ok(applied)
    }

    fn set_bitrate(&mut self, bitrate: u32) -> Result<()> {
        self.check(MockOp::SetBitrate)?;
        self.state.borrow_mut().bitrate = Some(bitrate);
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        self.check(MockOp::RequestBuffers)?;
        let mut state = self.state.borrow_mut();
        if state.streaming || state.slots.iter().any(|slot| slot.mapped) {
            return Err(os_error("VIDIOC_REQBUFS", libc::EBUSY));
        }
        let granted = state.grant_limit.map_or(count, |limit| count.min(limit));
        let len = state.buffer_len;
        state.slots = (0..granted)
            .map(|_| {
                let mut storage = vec![0u8; len].into_boxed_slice();
                let ptr = NonNull::new(storage.as_mut_ptr()).unwrap_or(NonNull::dangling());
                Slot {
                    _storage: storage,
                    ptr,
                    len,
                    mapped: false,
                }
            })
            .collect();
        state.queued.clear();
        state.filled.clear();
        Ok(granted)
    }

    fn query_buffer(&mut self, index: u32) -> Result<BufferPlacement> {
        let state = self.state.borrow();
        let slot = state
            .slots
            .get(index as usize)
            .ok_or_else(|| os_error("VIDIOC_QUERYBUF", libc::EINVAL))?;
        Ok(BufferPlacement {
            index,
            length: u32::try_from(slot.len).unwrap_or(u32::MAX),
            offset: index * 4096,
        })
    }

    fn map_buffer(&mut self, placement: &BufferPlacement) -> Result<MappedBuffer> {
        self.check(MockOp::Map(placement.index))?;
        let mut state = self.state.borrow_mut();
        let slot = state
            .slots
            .get_mut(placement.index as usize)
            .ok_or_else(|| os_error("mmap", libc::EINVAL))?;
        slot.mapped = true;
        // SAFETY: the storage lives as long as the shared state, which the
        // session keeps alive through its device handle.
        Ok(unsafe { MappedBuffer::from_raw_parts(placement.index, slot.ptr, slot.len) })
    }

    fn unmap_buffer(&mut self, buffer: MappedBuffer) -> Result<()> {
        self.check(MockOp::Unmap(buffer.index()))?;
        let mut state = self.state.borrow_mut();
        let slot = state
            .slots
            .get_mut(buffer.index() as usize)
            .filter(|slot| slot.mapped)
            .ok_or_else(|| os_error("munmap", libc::EINVAL))?;
        slot.mapped = false;
        state.unmapped += 1;
        Ok(())
    }

    fn queue_buffer(&mut self, index: u32) -> Result<()> {
        self.check(MockOp::Queue(index))?;
        let mut state = self.state.borrow_mut();
        let known = (index as usize) < state.slots.len();
        let busy = state.queued.contains(&index) || state.filled.iter().any(|(i, _)| *i == index);
        if !known || busy {
            return Err(os_error("VIDIOC_QBUF", libc::EINVAL));
        }
        state.queued.push_back(index);
        state.calls.push(MockCall::Queue(index));
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> Result<DequeuedBuffer> {
        let mut state = self.state.borrow_mut();
        if !state.streaming {
            return Err(os_error("VIDIOC_DQBUF", libc::EINVAL));
        }
        let (index, bytes_used) = state
            .filled
            .pop_front()
            .ok_or_else(|| os_error("VIDIOC_DQBUF", libc::EAGAIN))?;
        let sequence = state.sequence;
        state.sequence += 1;
        state.calls.push(MockCall::Dequeue(index));
        Ok(DequeuedBuffer {
            index,
            bytes_used,
            sequence,
        })
    }

    fn stream_on(&mut self) -> Result<()> {
        self.check(MockOp::StreamOn)?;
        let mut state = self.state.borrow_mut();
        state.streaming = true;
        state.calls.push(MockCall::StreamOn);
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.check(MockOp::StreamOff)?;
        let mut state = self.state.borrow_mut();
        state.streaming = false;
        state.queued.clear();
        state.filled.clear();
        state.calls.push(MockCall::StreamOff);
        Ok(())
    }

    fn wait_readable(&mut self, _timeout: Duration) -> Result<Readiness> {
        let mut state = self.state.borrow_mut();
        if state.interrupt_next_wait {
            state.interrupt_next_wait = false;
            return Ok(Readiness::Interrupted);
        }
        if state.spurious_next_wait {
            state.spurious_next_wait = false;
            return Ok(Readiness::Ready);
        }
        if state.streaming && !state.filled.is_empty() {
            Ok(Readiness::Ready)
        } else {
            Ok(Readiness::TimedOut)
        }
    }

    fn close(&mut self) -> Result<()> {
        self.check(MockOp::Close)?;
        self.state.borrow_mut().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::PixelFormat;

    #[test]
    fn test_mock_device_creation() {
        let mut device = MockDevice::new();
        let caps = device.query_capabilities().expect("caps should succeed");
        assert_eq!(caps.driver, "mock");
        assert!(caps.can_capture);
        assert!(caps.can_stream);
    }

    #[test]
    fn test_mock_format_rounding() {
        let mut device = MockDevice::new();
        let applied = device
            .set_format(&Format::request(641, 481, PixelFormat::Yuyv))
            .expect("set_format should succeed");
        assert_eq!((applied.width, applied.height), (640, 480));
        assert_eq!(device.format(), Some(applied));
    }

    #[test]
    fn test_mock_injection_needs_queued_buffer() {
        let mut device = MockDevice::new().with_buffer_len(16);
        assert_eq!(device.request_buffers(1).expect("reqbufs"), 1);
        assert_eq!(device.inject_frame(&[1, 2, 3]), None);

        device.queue_buffer(0).expect("queue");
        device.stream_on().expect("stream on");
        assert_eq!(device.inject_frame(&[1, 2, 3]), Some(0));
        assert_eq!(device.inject_frame(&[4]), None);
        assert_eq!(
            device.wait_readable(Duration::ZERO).expect("wait"),
            Readiness::Ready
        );

        let filled = device.dequeue_buffer().expect("dequeue");
        assert_eq!((filled.index, filled.bytes_used), (0, 3));
        assert_eq!(
            device.wait_readable(Duration::ZERO).expect("wait"),
            Readiness::TimedOut
        );
    }

    #[test]
    fn test_mock_failure_injection_is_one_shot() {
        let mut device = MockDevice::new();
        device.fail_on(MockOp::SetBitrate);
        assert!(device.set_bitrate(1).is_err());
        assert!(device.set_bitrate(1).is_ok());
        assert_eq!(device.bitrate(), Some(1));
    }
}
