//! Error type and errno-style status codes for capture operations.

use std::io;

use thiserror::Error;

/// Coarse classification of a [`CaptureError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid argument or call-order violation. Nothing was changed.
    Usage,
    /// Device lacks a capability, granted too few buffers or could not be mapped.
    Resource,
    /// The readiness wait elapsed without a filled buffer.
    Timeout,
    /// The readiness wait was interrupted by a signal.
    Interrupted,
    /// An underlying device or descriptor operation failed.
    Io,
}

/// Error type for capture operations.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The device path was empty.
    #[error("device path is empty")]
    EmptyPath,

    /// An argument was rejected before touching the device.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not allowed in the current session state.
    #[error("cannot {op} while session is {state}")]
    InvalidState {
        /// Operation that was attempted.
        op: &'static str,
        /// State the session was in.
        state: &'static str,
    },

    /// The device does not report a required capability.
    #[error("device '{path}' does not support {capability}")]
    MissingCapability {
        /// Device path.
        path: String,
        /// Name of the missing capability.
        capability: &'static str,
    },

    /// The driver granted fewer buffers than requested.
    #[error("insufficient buffers: requested {requested}, granted {granted}")]
    InsufficientBuffers {
        /// Number of buffers requested.
        requested: u32,
        /// Number of buffers the driver granted.
        granted: u32,
    },

    /// The caller-provided buffer cannot hold the frame.
    #[error("frame of {needed} bytes does not fit into {capacity} byte buffer")]
    BufferTooSmall {
        /// Frame size reported by the device.
        needed: usize,
        /// Capacity of the destination buffer.
        capacity: usize,
    },

    /// The device reported a buffer that does not match the mapped set.
    #[error("bad buffer from device: {0}")]
    Fault(String),

    /// No frame became available within the timeout.
    #[error("timed out waiting for a frame")]
    Timeout,

    /// The readiness wait was interrupted by a signal.
    #[error("wait for a frame was interrupted")]
    Interrupted,

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    /// A device operation failed.
    #[error("{op} failed: {source}")]
    Io {
        /// Name of the failed operation (e.g. `VIDIOC_S_FMT`).
        op: &'static str,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
}

impl CaptureError {
    /// Wrap an OS error raised by `op`.
    pub const fn io(op: &'static str, source: io::Error) -> Self {
        Self::Io { op, source }
    }

    /// Classify this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyPath
            | Self::InvalidArgument(_)
            | Self::InvalidState { .. }
            | Self::Config(_) => ErrorKind::Usage,
            Self::MissingCapability { .. }
            | Self::InsufficientBuffers { .. }
            | Self::BufferTooSmall { .. } => ErrorKind::Resource,
            Self::Timeout => ErrorKind::Timeout,
            Self::Interrupted => ErrorKind::Interrupted,
            Self::Fault(_) | Self::Io { .. } => ErrorKind::Io,
        }
    }

    /// Whether the caller should simply try again.
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::Interrupted)
    }

    /// Negative errno-style status code for this error.
    pub fn status_code(&self) -> i32 {
        let errno = match self {
            Self::EmptyPath
            | Self::InvalidArgument(_)
            | Self::InvalidState { .. }
            | Self::Config(_)
            | Self::MissingCapability { .. } => libc::EINVAL,
            Self::InsufficientBuffers { .. } | Self::BufferTooSmall { .. } => libc::ENOMEM,
            Self::Timeout | Self::Interrupted => libc::EAGAIN,
            Self::Fault(_) => libc::EFAULT,
            Self::Io { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
        };
        -errno
    }

    /// Underlying OS error code, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Collapse a result into a status code: zero on success, a negative errno otherwise.
pub fn status<T>(result: &Result<T>) -> i32 {
    result.as_ref().map_or_else(CaptureError::status_code, |_| 0)
}
