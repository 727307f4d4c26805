//! v4l2-capturer: handle-style capture sessions over V4L2 memory-mapped buffers
//!
//! A [`CaptureSession`] opens a capture node, negotiates format and bitrate,
//! maps a fixed ring of kernel buffers and acquires frames one call at a time,
//! either through a callback or by copying into a caller buffer. The device
//! protocol sits behind the [`CaptureDevice`] trait so the
//! session can be driven by a simulated device in tests.

pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod session;
pub mod traits;

#[cfg(test)]
pub mod mock;

pub use buffer::{BufferRing, MappedBuffer};
pub use crate::config::CaptureConfig;
pub use device::V4L2Device;
pub use error::{status, CaptureError, ErrorKind, Result};
pub use session::{BufferInfo, CaptureSession, FrameCallback, BUFFER_COUNT};
pub use traits::{
    BufferPlacement, CaptureDevice, DequeuedBuffer, DeviceCapabilities, Format, FourCC,
    PixelFormat, Readiness,
};
