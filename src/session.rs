//! Capture session: device binding, negotiation, buffer mapping, streaming and
//! frame acquisition over a [`CaptureDevice`].
//!
//! A session walks through a fixed sequence of stages:
//!
//! 1. [`CaptureSession::open`] binds a device and checks it can capture and stream.
//! 2. [`CaptureSession::configure`] sets format and bitrate, requests
//!    [`BUFFER_COUNT`] buffers and maps each of them.
//! 3. [`CaptureSession::start_streaming`] queues every buffer, then turns streaming on.
//! 4. [`CaptureSession::run`] / [`CaptureSession::sync_get_frame`] acquire one
//!    frame per call: wait, dequeue, consume, requeue.
//! 5. [`CaptureSession::stop_streaming`] and [`CaptureSession::close`].
//!
//! Frame data handed out is only valid for the duration of the call that
//! produced it; the buffer goes back to the device right afterwards.

use std::fmt;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::buffer::{BufferRing, MappedBuffer};
use crate::device::V4L2Device;
use crate::error::{CaptureError, Result};
use crate::traits::{CaptureDevice, DeviceCapabilities, Format, PixelFormat, Readiness};

/// Number of kernel buffers every session maps.
pub const BUFFER_COUNT: u32 = 2;

/// Callback receiving each frame's payload.
pub type FrameCallback = Box<dyn FnMut(&[u8]) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Opened,
    Configured,
    Streaming,
}

impl SessionState {
    const fn name(self) -> &'static str {
        match self {
            Self::Opened => "not configured",
            Self::Configured => "configured",
            Self::Streaming => "streaming",
        }
    }
}

/// Mapped buffer as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    /// Kernel-assigned index.
    pub index: u32,
    /// Capacity in bytes.
    pub capacity: usize,
}

/// An open capture device and everything mapped from it.
pub struct CaptureSession<D: CaptureDevice = V4L2Device> {
    path: String,
    device: D,
    capabilities: DeviceCapabilities,
    format: Option<Format>,
    buffers: BufferRing,
    on_frame: Option<FrameCallback>,
    state: SessionState,
    closed: bool,
}

impl CaptureSession<V4L2Device> {
    /// Open a V4L2 device node and bind a session to it.
    pub fn open(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(CaptureError::EmptyPath);
        }
        let device = V4L2Device::open(path).inspect_err(|err| {
            warn!(device = %path, error = %err, "cannot open device");
        })?;
        Self::bind(path, device)
    }
}

impl<D: CaptureDevice> CaptureSession<D> {
    /// Bind a session to an already opened device.
    ///
    /// The device must report both video capture and streaming I/O. On any
    /// failure the device is closed and no session is returned.
    pub fn bind(path: &str, mut device: D) -> Result<Self> {
        if path.is_empty() {
            discard(path, &mut device);
            return Err(CaptureError::EmptyPath);
        }

        let capabilities = match validate_capabilities(path, &mut device) {
            Ok(capabilities) => capabilities,
            Err(err) => {
                warn!(device = %path, error = %err, "device is not supported");
                discard(path, &mut device);
                return Err(err);
            }
        };

        info!(
            device = %path,
            driver = %capabilities.driver,
            card = %capabilities.card,
            "device opened"
        );

        Ok(Self {
            path: path.to_owned(),
            device,
            capabilities,
            format: None,
            buffers: BufferRing::new(),
            on_frame: None,
            state: SessionState::Opened,
            closed: false,
        })
    }

    /// Negotiate format and bitrate, then request and map [`BUFFER_COUNT`] buffers.
    ///
    /// Each step must succeed before the next one runs. On failure the session
    /// stays open and unconfigured. Buffers mapped before a mapping failure are
    /// kept until [`CaptureSession::close`] or the next configure attempt.
    pub fn configure(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
        bitrate: u32,
    ) -> Result<()> {
        self.expect_state("configure", SessionState::Opened)?;
        if width == 0 || height == 0 {
            return Err(CaptureError::InvalidArgument(format!(
                "invalid resolution {width}x{height}"
            )));
        }
        if i32::try_from(bitrate).is_err() {
            return Err(CaptureError::InvalidArgument(format!(
                "bitrate {bitrate} out of range"
            )));
        }

        if !self.buffers.is_empty() {
            debug!(
                device = %self.path,
                count = self.buffers.len(),
                "releasing buffers left by a failed configure"
            );
            if let Some(err) = self.unmap_all() {
                return Err(err);
            }
        }

        let applied = self
            .device
            .set_format(&Format::request(width, height, format))
            .inspect_err(|err| warn!(device = %self.path, error = %err, "format set failed"))?;

        self.device
            .set_bitrate(bitrate)
            .inspect_err(|err| warn!(device = %self.path, error = %err, "bitrate set failed"))?;

        let granted = self.device.request_buffers(BUFFER_COUNT).inspect_err(|err| {
            warn!(device = %self.path, error = %err, "device does not support mmap");
        })?;
        if granted < BUFFER_COUNT {
            warn!(device = %self.path, granted, "insufficient buffers");
            return Err(CaptureError::InsufficientBuffers {
                requested: BUFFER_COUNT,
                granted,
            });
        }

        for index in 0..BUFFER_COUNT {
            self.map_one(index)?;
        }

        info!(
            device = %self.path,
            width = applied.width,
            height = applied.height,
            fourcc = %applied.fourcc,
            bitrate,
            buffers = self.buffers.len(),
            "device configured"
        );
        self.format = Some(applied);
        self.state = SessionState::Configured;
        Ok(())
    }

    /// Register the callback fired by [`CaptureSession::run`], replacing any previous one.
    pub fn set_frame_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.on_frame = Some(Box::new(callback));
    }

    /// Remove the frame callback.
    pub fn clear_frame_callback(&mut self) {
        self.on_frame = None;
    }

    /// Queue every mapped buffer in index order, then turn streaming on.
    ///
    /// If any step fails streaming stays off and the buffers are reclaimed.
    pub fn start_streaming(&mut self) -> Result<()> {
        self.expect_state("start streaming", SessionState::Configured)?;

        let started = self.queue_all().and_then(|()| self.device.stream_on());
        if let Err(err) = started {
            warn!(device = %self.path, error = %err, "failed to start stream");
            if self.buffers.queued() > 0 {
                if let Err(off) = self.device.stream_off() {
                    warn!(device = %self.path, error = %off, "failed to reclaim queued buffers");
                }
            }
            self.buffers.reclaim_all();
            return Err(err);
        }

        self.state = SessionState::Streaming;
        info!(device = %self.path, "started stream");
        Ok(())
    }

    /// Turn streaming off. Buffers return to the process.
    pub fn stop_streaming(&mut self) -> Result<()> {
        self.expect_state("stop streaming", SessionState::Streaming)?;

        self.device.stream_off().inspect_err(|err| {
            warn!(device = %self.path, error = %err, "failed to stop stream");
        })?;

        self.buffers.reclaim_all();
        self.state = SessionState::Configured;
        info!(device = %self.path, "stopped stream");
        Ok(())
    }

    /// Acquire one frame and hand it to the frame callback, if any.
    ///
    /// Returns [`CaptureError::Timeout`] or [`CaptureError::Interrupted`] when no
    /// frame arrived; both are retryable. A zero timeout polls without waiting.
    pub fn run(&mut self, timeout: Duration) -> Result<()> {
        self.acquire("run", timeout, |on_frame, data| {
            if let Some(callback) = on_frame.as_mut() {
                callback(data);
            }
            Ok(())
        })
    }

    /// Acquire one frame and copy it into `out`. Returns the number of bytes written.
    ///
    /// A frame larger than `out` fails with [`CaptureError::BufferTooSmall`],
    /// leaves `out` untouched and still returns the buffer to the device.
    pub fn sync_get_frame(&mut self, timeout: Duration, out: &mut [u8]) -> Result<usize> {
        self.acquire("get frame", timeout, |_, data| {
            let capacity = out.len();
            let dest = out
                .get_mut(..data.len())
                .ok_or(CaptureError::BufferTooSmall {
                    needed: data.len(),
                    capacity,
                })?;
            dest.copy_from_slice(data);
            Ok(data.len())
        })
    }

    /// Unmap every buffer and close the device.
    ///
    /// Every release step runs even if an earlier one fails; the last failure
    /// is returned.
    pub fn close(mut self) -> Result<()> {
        self.teardown()
    }

    /// Device path the session was opened with.
    pub fn device_path(&self) -> &str {
        &self.path
    }

    /// Capabilities reported when the device was bound.
    pub const fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// Format applied by the driver, once configured.
    pub const fn format(&self) -> Option<&Format> {
        self.format.as_ref()
    }

    /// Whether streaming is on.
    pub fn is_streaming(&self) -> bool {
        self.state == SessionState::Streaming
    }

    /// Number of mapped buffers.
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Index and capacity of every mapped buffer.
    pub fn buffers(&self) -> Vec<BufferInfo> {
        self.buffers
            .iter()
            .map(|buffer| BufferInfo {
                index: buffer.index(),
                capacity: buffer.capacity(),
            })
            .collect()
    }

    fn expect_state(&self, op: &'static str, expected: SessionState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CaptureError::InvalidState {
                op,
                state: self.state.name(),
            })
        }
    }

    fn map_one(&mut self, index: u32) -> Result<()> {
        let placement = self.device.query_buffer(index).inspect_err(|err| {
            warn!(device = %self.path, index, error = %err, "buffer query failed");
        })?;
        if placement.index != index {
            return Err(CaptureError::Fault(format!(
                "queried buffer {index}, device answered {}",
                placement.index
            )));
        }

        let buffer = self.device.map_buffer(&placement).inspect_err(|err| {
            warn!(device = %self.path, index, error = %err, "mmap failed");
        })?;
        if buffer.index() as usize != self.buffers.next_index() {
            let err = CaptureError::Fault(format!("mapping for buffer {index} has wrong index"));
            if let Err(unmap) = self.device.unmap_buffer(buffer) {
                warn!(device = %self.path, index, error = %unmap, "munmap failed");
            }
            return Err(err);
        }

        debug!(
            device = %self.path,
            index,
            length = placement.length,
            offset = placement.offset,
            "buffer mapped"
        );
        self.buffers.push(buffer);
        Ok(())
    }

    fn queue_all(&mut self) -> Result<()> {
        for index in 0..BUFFER_COUNT {
            self.device.queue_buffer(index)?;
            self.buffers.check_in(index)?;
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> Result<()> {
        match self.device.wait_readable(timeout)? {
            Readiness::Ready => Ok(()),
            Readiness::TimedOut => {
                debug!(device = %self.path, ?timeout, "capture timeout");
                Err(CaptureError::Timeout)
            }
            Readiness::Interrupted => {
                debug!(device = %self.path, "wait interrupted");
                Err(CaptureError::Interrupted)
            }
        }
    }

    /// Wait, dequeue, let `consume` read the payload, requeue.
    ///
    /// The buffer is requeued whatever `consume` returns; a requeue failure
    /// takes precedence over the consumer's result.
    fn acquire<R, F>(&mut self, op: &'static str, timeout: Duration, consume: F) -> Result<R>
    where
        F: FnOnce(&mut Option<FrameCallback>, &[u8]) -> Result<R>,
    {
        self.expect_state(op, SessionState::Streaming)?;
        self.wait(timeout)?;

        let filled = match self.device.dequeue_buffer() {
            Ok(filled) => filled,
            // Readable without a completed buffer; nothing to hand out yet.
            Err(err) if err.raw_os_error() == Some(libc::EAGAIN) => {
                debug!(device = %self.path, "woken without a filled buffer");
                return Err(CaptureError::Timeout);
            }
            Err(err) => {
                warn!(device = %self.path, error = %err, "VIDIOC_DQBUF failed");
                return Err(err);
            }
        };

        let outcome = {
            let buffer = self.buffers.check_out(filled.index)?;
            let used = filled.bytes_used as usize;
            match buffer.payload(used) {
                Some(data) => consume(&mut self.on_frame, data),
                None => Err(CaptureError::Fault(format!(
                    "buffer {} reports {used} bytes, capacity {}",
                    filled.index,
                    buffer.capacity()
                ))),
            }
        };

        self.device.queue_buffer(filled.index).inspect_err(|err| {
            warn!(device = %self.path, index = filled.index, error = %err, "VIDIOC_QBUF failed");
        })?;
        self.buffers.check_in(filled.index)?;

        debug!(
            device = %self.path,
            index = filled.index,
            sequence = filled.sequence,
            bytes_used = filled.bytes_used,
            "frame acquired"
        );
        outcome
    }

    /// Unmap every buffer, logging failures. Returns the last one.
    fn unmap_all(&mut self) -> Option<CaptureError> {
        let mut last_err = None;
        let buffers: Vec<MappedBuffer> = self.buffers.drain().collect();
        for buffer in buffers {
            let index = buffer.index();
            if let Err(err) = self.device.unmap_buffer(buffer) {
                warn!(device = %self.path, index, error = %err, "munmap failed");
                last_err = Some(err);
            }
        }
        last_err
    }

    fn teardown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if self.state == SessionState::Streaming {
            warn!(device = %self.path, "closing while streaming");
        }

        let mut last_err = self.unmap_all();
        self.format = None;
        self.state = SessionState::Opened;

        match self.device.close() {
            Ok(()) => info!(device = %self.path, "device closed"),
            Err(err) => {
                warn!(device = %self.path, error = %err, "cannot close device");
                last_err = Some(err);
            }
        }

        last_err.map_or(Ok(()), Err)
    }
}

impl<D: CaptureDevice> Drop for CaptureSession<D> {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            warn!(device = %self.path, error = %err, "teardown on drop failed");
        }
    }
}

impl<D: CaptureDevice> fmt::Debug for CaptureSession<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSession")
            .field("path", &self.path)
            .field("state", &self.state)
            .field("format", &self.format)
            .field("buffers", &self.buffers.len())
            .field("callback", &self.on_frame.is_some())
            .finish_non_exhaustive()
    }
}

fn validate_capabilities<D: CaptureDevice>(
    path: &str,
    device: &mut D,
) -> Result<DeviceCapabilities> {
    let capabilities = device.query_capabilities()?;
    if !capabilities.can_capture {
        return Err(CaptureError::MissingCapability {
            path: path.to_owned(),
            capability: "video capture",
        });
    }
    if !capabilities.can_stream {
        return Err(CaptureError::MissingCapability {
            path: path.to_owned(),
            capability: "streaming I/O",
        });
    }
    Ok(capabilities)
}

fn discard<D: CaptureDevice>(path: &str, device: &mut D) {
    if let Err(err) = device.close() {
        warn!(device = %path, error = %err, "cannot close rejected device");
    }
}
