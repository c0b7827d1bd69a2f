use std::time::Duration;

use framelink_transport::TransportError;

use crate::header::FrameLimits;

/// Errors that can occur while encoding or decoding socket frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header contains an invalid magic number.
    #[error("invalid frame magic (expected \"FLHD\")")]
    InvalidMagic,

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The declared payload size disagrees with the declared dimensions.
    #[error("payload size {payload_size} does not match {width}x{height}x{channels}")]
    DimensionMismatch {
        payload_size: u64,
        width: u32,
        height: u32,
        channels: u32,
    },

    /// A write stopped making progress within the write timeout.
    #[error("write stalled after {written} of {total} bytes")]
    WriteStalled { written: usize, total: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection between frames.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer closed the connection partway through a frame.
    #[error("connection closed mid-frame ({buffered} bytes of an incomplete frame)")]
    TruncatedFrame { buffered: usize },
}

impl FrameError {
    /// A read or write gave up because its timeout elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            FrameError::Io(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                )
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;

/// Errors surfaced by every frame channel, whatever its backing.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Attach or connect before the producer side exists.
    #[error("channel {name} not found")]
    ChannelNotFound { name: String },

    /// Create while a live producer still owns the channel.
    #[error("channel {name} already exists (owned by live pid {owner_pid})")]
    ChannelAlreadyExists { name: String, owner_pid: i32 },

    /// Device-backed channel requested but no compatible driver or device.
    #[error("no compatible device: {0}")]
    DeviceUnavailable(String),

    /// Published dimensions exceed the configured maxima.
    #[error("frame {width}x{height}x{channels} exceeds channel limits {limits}")]
    FrameTooLarge {
        width: u32,
        height: u32,
        channels: u32,
        limits: FrameLimits,
    },

    /// Pixel buffer length disagrees with the declared dimensions.
    #[error("pixel buffer is {actual} bytes, dimensions require {expected}")]
    InvalidFrame { expected: usize, actual: usize },

    /// The producer tore the channel down.
    #[error("channel closed by producer")]
    ChannelClosed,

    /// The peer process went away without a clean close.
    #[error("peer gone: {0}")]
    PeerGone(String),

    /// A bounded wait expired.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The channel name cannot be used as a shared-memory name.
    #[error("invalid channel name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// The attached region was created by an incompatible layout.
    #[error("incompatible channel layout: {0}")]
    Incompatible(String),

    /// A device driver call failed after the device was found usable.
    #[error("device error: {0}")]
    Device(String),

    /// Socket wire framing error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Socket transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// OS-level error on a named resource.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Steady-state conditions a collaborator should ride out by polling,
    /// backing off, or reattaching, rather than exiting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ChannelError::Timeout(_) | ChannelError::ChannelClosed | ChannelError::PeerGone(_)
        )
    }

    /// Configuration and capability errors that must end start-up.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            ChannelError::ChannelNotFound { .. }
                | ChannelError::ChannelAlreadyExists { .. }
                | ChannelError::DeviceUnavailable(_)
        )
    }

    /// Per-frame contract violations; the channel itself is unaffected.
    pub fn is_frame_rejection(&self) -> bool {
        matches!(
            self,
            ChannelError::FrameTooLarge { .. } | ChannelError::InvalidFrame { .. }
        )
    }
}

pub type ChannelResult<T> = std::result::Result<T, ChannelError>;
