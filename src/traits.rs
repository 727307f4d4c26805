//! Core types and the device seam the capture session drives.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::buffer::MappedBuffer;
use crate::error::{CaptureError, Result};

/// Pixel format code as used by V4L2 (e.g., H264, YUYV).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// H.264 elementary stream (compressed by the device).
    pub const H264: Self = Self::new(b"H264");
    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");

    /// Little-endian code as stored in `v4l2_pix_format::pixelformat`.
    #[must_use]
    pub const fn code(self) -> u32 {
        u32::from_le_bytes(self.0)
    }
}

impl From<u32> for FourCC {
    fn from(code: u32) -> Self {
        Self(code.to_le_bytes())
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{}", char::from(byte))?;
        }
        Ok(())
    }
}

/// Capture encodings a session can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum PixelFormat {
    /// Hardware-encoded H.264.
    #[serde(alias = "h264")]
    H264,
    /// Raw YUYV 4:2:2.
    #[serde(alias = "yuyv", alias = "YUYV")]
    Yuyv,
}

impl PixelFormat {
    /// The V4L2 pixel format code for this encoding.
    pub const fn fourcc(self) -> FourCC {
        match self {
            Self::H264 => FourCC::H264,
            Self::Yuyv => FourCC::YUYV,
        }
    }
}

impl TryFrom<FourCC> for PixelFormat {
    type Error = CaptureError;

    fn try_from(fourcc: FourCC) -> Result<Self> {
        match fourcc {
            FourCC::H264 => Ok(Self::H264),
            FourCC::YUYV => Ok(Self::Yuyv),
            other => Err(CaptureError::InvalidArgument(format!(
                "unsupported pixel format {other}"
            ))),
        }
    }
}

impl FromStr for PixelFormat {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "H264" => Ok(Self::H264),
            "YUYV" => Ok(Self::Yuyv),
            _ => Err(CaptureError::InvalidArgument(format!(
                "unsupported pixel format '{s}'"
            ))),
        }
    }
}

/// Negotiated video format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride), zero for compressed formats.
    pub stride: u32,
    /// Maximum frame size in bytes as reported by the driver.
    pub size: u32,
}

impl Format {
    /// A format request. Stride and size stay zero; the driver fills them in.
    #[must_use]
    pub const fn request(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            fourcc: format.fourcc(),
            stride: 0,
            size: 0,
        }
    }
}

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming I/O.
    pub can_stream: bool,
}

impl From<v4l::Capabilities> for DeviceCapabilities {
    fn from(caps: v4l::Capabilities) -> Self {
        Self {
            can_capture: caps
                .capabilities
                .contains(v4l::capability::Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(v4l::capability::Flags::STREAMING),
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
        }
    }
}

/// Where a kernel buffer lives, as answered by a buffer query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPlacement {
    /// Kernel-assigned buffer index.
    pub index: u32,
    /// Buffer length in bytes.
    pub length: u32,
    /// Offset to pass to `mmap`.
    pub offset: u32,
}

/// A filled buffer handed over by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    /// Kernel-assigned buffer index.
    pub index: u32,
    /// Number of payload bytes the device wrote.
    pub bytes_used: u32,
    /// Frame sequence number.
    pub sequence: u32,
}

/// Outcome of a bounded readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A filled buffer can be dequeued.
    Ready,
    /// The timeout elapsed first.
    TimedOut,
    /// A signal interrupted the wait.
    Interrupted,
}

/// The buffer-queue protocol of a streaming capture device.
///
/// `V4L2Device` talks to the kernel; tests substitute a simulated device.
/// Buffer indices are the kernel's, always capture type with memory-mapped I/O.
pub trait CaptureDevice {
    /// Query driver identity and capability flags.
    fn query_capabilities(&mut self) -> Result<DeviceCapabilities>;

    /// Set capture format. Returns the format the driver actually applied.
    fn set_format(&mut self, format: &Format) -> Result<Format>;

    /// Set the target bitrate control, in bits per second.
    fn set_bitrate(&mut self, bitrate: u32) -> Result<()>;

    /// Request `count` memory-mapped buffers. Returns the number granted.
    fn request_buffers(&mut self, count: u32) -> Result<u32>;

    /// Query length and mapping offset of buffer `index`.
    fn query_buffer(&mut self, index: u32) -> Result<BufferPlacement>;

    /// Map a queried buffer into process memory.
    fn map_buffer(&mut self, placement: &BufferPlacement) -> Result<MappedBuffer>;

    /// Release a mapping created by [`CaptureDevice::map_buffer`].
    fn unmap_buffer(&mut self, buffer: MappedBuffer) -> Result<()>;

    /// Hand buffer `index` to the device.
    fn queue_buffer(&mut self, index: u32) -> Result<()>;

    /// Take the next filled buffer from the device.
    fn dequeue_buffer(&mut self) -> Result<DequeuedBuffer>;

    /// Turn streaming on.
    fn stream_on(&mut self) -> Result<()>;

    /// Turn streaming off.
    fn stream_off(&mut self) -> Result<()>;

    /// Block until a buffer is ready, at most `timeout`.
    fn wait_readable(&mut self, timeout: Duration) -> Result<Readiness>;

    /// Close the device descriptor. Further calls are invalid.
    fn close(&mut self) -> Result<()>;
}
