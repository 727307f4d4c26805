//! V4L2 device implementation using the v4l crate.
//!
//! Open, capabilities, format and controls go through `v4l::Device`. The
//! per-index buffer queue work has no safe counterpart in the crate and is
//! issued as raw ioctls on the device handle's descriptor.

use std::fmt;
use std::io;
use std::os::raw::{c_int, c_void};
use std::ptr::{self, NonNull};
use std::time::Duration;

use v4l::control::{Control, Value};
use v4l::format::FieldOrder;
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l2::vidioc;
use v4l::v4l_sys::{
    v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE, v4l2_buffer, v4l2_requestbuffers,
};
use v4l::video::Capture;
use v4l::Device;

use crate::buffer::MappedBuffer;
use crate::error::{CaptureError, Result};
use crate::traits::{
    BufferPlacement, CaptureDevice, DequeuedBuffer, DeviceCapabilities, Format, FourCC, Readiness,
};

/// `V4L2_CID_MPEG_VIDEO_BITRATE`: `V4L2_CID_CODEC_BASE + 207`.
const V4L2_CID_MPEG_VIDEO_BITRATE: u32 = 0x0099_0900 + 207;

const BUF_TYPE: u32 = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;

/// A V4L2 capture node.
pub struct V4L2Device {
    device: Option<Device>,
}

impl V4L2Device {
    /// Open a V4L2 device node (e.g., `/dev/video0`).
    pub fn open(path: &str) -> Result<Self> {
        if path.contains('\0') {
            return Err(CaptureError::InvalidArgument(format!(
                "device path {path:?} contains a NUL byte"
            )));
        }
        let device = Device::with_path(path).map_err(|err| CaptureError::io("open", err))?;
        Ok(Self {
            device: Some(device),
        })
    }

    fn device(&self) -> Result<&Device> {
        self.device
            .as_ref()
            .ok_or_else(|| CaptureError::io("device", io::Error::from_raw_os_error(libc::EBADF)))
    }

    /// Issue a buffer ioctl, retrying while it is interrupted by a signal.
    #[allow(unsafe_code)]
    fn xioctl<T>(&self, op: &'static str, request: vidioc::_IOC_TYPE, arg: &mut T) -> Result<()> {
        let fd: c_int = self.device()?.handle().fd();
        loop {
            // SAFETY: `arg` is the argument struct `request` expects and
            // outlives the call.
            let res = unsafe { v4l2::ioctl(fd, request, ptr::from_mut(arg).cast::<c_void>()) };
            match res {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                res => return res.map_err(|err| CaptureError::io(op, err)),
            }
        }
    }

    #[allow(unsafe_code)]
    fn mmap_buffer(index: u32) -> v4l2_buffer {
        v4l2_buffer {
            index,
            type_: BUF_TYPE,
            memory: Memory::Mmap as u32,
            // SAFETY: plain C struct, all-zero is a valid value.
            ..unsafe { std::mem::zeroed() }
        }
    }
}

impl CaptureDevice for V4L2Device {
    fn query_capabilities(&mut self) -> Result<DeviceCapabilities> {
        let caps = self
            .device()?
            .query_caps()
            .map_err(|err| CaptureError::io("VIDIOC_QUERYCAP", err))?;
        Ok(caps.into())
    }

    fn set_format(&mut self, format: &Format) -> Result<Format> {
        let device = self.device()?;
        let mut fmt =
            Capture::format(device).map_err(|err| CaptureError::io("VIDIOC_G_FMT", err))?;

        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = format.fourcc.into();
        fmt.field_order = FieldOrder::Interlaced;

        let fmt = Capture::set_format(device, &fmt)
            .map_err(|err| CaptureError::io("VIDIOC_S_FMT", err))?;

        Ok(Format {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.fourcc),
            stride: fmt.stride,
            size: fmt.size,
        })
    }

    fn set_bitrate(&mut self, bitrate: u32) -> Result<()> {
        if i32::try_from(bitrate).is_err() {
            return Err(CaptureError::InvalidArgument(format!(
                "bitrate {bitrate} out of range"
            )));
        }
        self.device()?
            .set_control(Control {
                id: V4L2_CID_MPEG_VIDEO_BITRATE,
                value: Value::Integer(i64::from(bitrate)),
            })
            .map_err(|err| CaptureError::io("VIDIOC_S_CTRL", err))
    }

    #[allow(unsafe_code)]
    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        let mut req = v4l2_requestbuffers {
            count,
            type_: BUF_TYPE,
            memory: Memory::Mmap as u32,
            // SAFETY: plain C struct, all-zero is a valid value.
            ..unsafe { std::mem::zeroed() }
        };
        self.xioctl("VIDIOC_REQBUFS", vidioc::VIDIOC_REQBUFS, &mut req)?;
        Ok(req.count)
    }

    #[allow(unsafe_code)]
    fn query_buffer(&mut self, index: u32) -> Result<BufferPlacement> {
        let mut buf = Self::mmap_buffer(index);
        self.xioctl("VIDIOC_QUERYBUF", vidioc::VIDIOC_QUERYBUF, &mut buf)?;
        Ok(BufferPlacement {
            index: buf.index,
            length: buf.length,
            // SAFETY: `offset` is the active member for memory-mapped buffers.
            offset: unsafe { buf.m.offset },
        })
    }

    #[allow(unsafe_code)]
    fn map_buffer(&mut self, placement: &BufferPlacement) -> Result<MappedBuffer> {
        let fd = self.device()?.handle().fd();
        let length = placement.length as usize;
        let offset = libc::off_t::try_from(placement.offset).map_err(|_| {
            CaptureError::Fault(format!("buffer offset {} out of range", placement.offset))
        })?;
        // SAFETY: maps a fresh shared region, nothing is aliased yet.
        let start = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset,
            )
        }
        .map_err(|err| CaptureError::io("mmap", err))?;

        let start = NonNull::new(start.cast::<u8>())
            .ok_or_else(|| CaptureError::Fault("mmap returned a null mapping".to_owned()))?;
        // SAFETY: `start` maps `length` bytes until `unmap_buffer`, and the
        // device only writes to it while the buffer is queued.
        Ok(unsafe { MappedBuffer::from_raw_parts(placement.index, start, length) })
    }

    #[allow(unsafe_code)]
    fn unmap_buffer(&mut self, buffer: MappedBuffer) -> Result<()> {
        // SAFETY: the region came from `map_buffer` and `buffer` is consumed.
        unsafe { v4l2::munmap(buffer.as_mut_ptr().cast::<c_void>(), buffer.capacity()) }
            .map_err(|err| CaptureError::io("munmap", err))
    }

    fn queue_buffer(&mut self, index: u32) -> Result<()> {
        let mut buf = Self::mmap_buffer(index);
        self.xioctl("VIDIOC_QBUF", vidioc::VIDIOC_QBUF, &mut buf)
    }

    fn dequeue_buffer(&mut self) -> Result<DequeuedBuffer> {
        let mut buf = Self::mmap_buffer(0);
        self.xioctl("VIDIOC_DQBUF", vidioc::VIDIOC_DQBUF, &mut buf)?;
        Ok(DequeuedBuffer {
            index: buf.index,
            bytes_used: buf.bytesused,
            sequence: buf.sequence,
        })
    }

    fn stream_on(&mut self) -> Result<()> {
        let mut typ = BUF_TYPE;
        self.xioctl("VIDIOC_STREAMON", vidioc::VIDIOC_STREAMON, &mut typ)
    }

    fn stream_off(&mut self) -> Result<()> {
        let mut typ = BUF_TYPE;
        self.xioctl("VIDIOC_STREAMOFF", vidioc::VIDIOC_STREAMOFF, &mut typ)
    }

    fn wait_readable(&mut self, timeout: Duration) -> Result<Readiness> {
        // Round up so a sub-millisecond timeout still waits.
        let millis = i32::try_from(timeout.as_micros().div_ceil(1000)).unwrap_or(i32::MAX);
        match self.device()?.handle().poll(libc::POLLIN, millis) {
            Ok(0) => Ok(Readiness::TimedOut),
            Ok(_) => Ok(Readiness::Ready),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(Readiness::Interrupted),
            Err(err) => Err(CaptureError::io("poll", err)),
        }
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the last handle closes the descriptor.
        drop(self.device.take());
        Ok(())
    }
}

impl fmt::Debug for V4L2Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("V4L2Device")
            .field("fd", &self.device.as_ref().map(|device| device.handle().fd()))
            .finish()
    }
}
