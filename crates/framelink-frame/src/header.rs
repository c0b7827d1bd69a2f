use std::fmt;

use crate::error::ChannelError;

/// Lifecycle state of one frame slot.
///
/// Transitions happen only under the channel's synchronization primitive:
/// `Empty -> Writing -> Ready -> Reading -> Ready`, and `Ready -> Writing`
/// when an unread frame is overwritten.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    Empty = 0,
    Writing = 1,
    Ready = 2,
    Reading = 3,
}

impl SlotState {
    /// Decode a raw state word read from shared memory.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Empty),
            1 => Some(Self::Writing),
            2 => Some(Self::Ready),
            3 => Some(Self::Reading),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Writing => "writing",
            Self::Ready => "ready",
            Self::Reading => "reading",
        }
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata published alongside every frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    /// Per-channel counter, starts at 1, never reused.
    pub sequence_number: u64,
    /// Producer-side capture time, monotonic clock, microseconds.
    pub timestamp_us: u64,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    /// Always `width * height * channels`.
    pub payload_size: u64,
}

/// Per-channel frame maxima, fixed at channel creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub max_width: u32,
    pub max_height: u32,
    pub max_channels: u32,
}

impl FrameLimits {
    pub const fn new(max_width: u32, max_height: u32, max_channels: u32) -> Self {
        Self {
            max_width,
            max_height,
            max_channels,
        }
    }

    /// Bytes one slot must hold: `max_width * max_height * max_channels`.
    pub fn slot_capacity(&self) -> u64 {
        u64::from(self.max_width) * u64::from(self.max_height) * u64::from(self.max_channels)
    }

    /// Validate a frame against these limits and its own declared size.
    ///
    /// Each dimension is checked against its own maximum, so a frame whose
    /// total size fits but whose width does not is still rejected.
    pub fn check(&self, frame: &RawFrame<'_>) -> Result<(), ChannelError> {
        if frame.width > self.max_width
            || frame.height > self.max_height
            || frame.channels > self.max_channels
        {
            return Err(ChannelError::FrameTooLarge {
                width: frame.width,
                height: frame.height,
                channels: frame.channels,
                limits: *self,
            });
        }

        let expected = frame.expected_len();
        if expected != frame.pixels.len() as u64 {
            return Err(ChannelError::InvalidFrame {
                expected: expected as usize,
                actual: frame.pixels.len(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for FrameLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{}",
            self.max_width, self.max_height, self.max_channels
        )
    }
}

/// One frame handed to `publish` by the source collaborator.
///
/// Pixels are tightly packed rows of `width * channels` bytes.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    pub pixels: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub timestamp_us: u64,
}

impl<'a> RawFrame<'a> {
    /// Frame stamped with the current monotonic time.
    pub fn new(pixels: &'a [u8], width: u32, height: u32, channels: u32) -> Self {
        Self {
            pixels,
            width,
            height,
            channels,
            timestamp_us: monotonic_micros(),
        }
    }

    pub fn with_timestamp(mut self, timestamp_us: u64) -> Self {
        self.timestamp_us = timestamp_us;
        self
    }

    /// Size implied by the declared dimensions.
    pub fn expected_len(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * u64::from(self.channels)
    }
}

/// Microseconds on `CLOCK_MONOTONIC`.
///
/// The clock is system-wide, so timestamps taken in the producer process are
/// comparable with readings taken in the consumer process.
pub fn monotonic_micros() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return 0;
    }
    (ts.tv_sec as u64) * 1_000_000 + (ts.tv_nsec as u64) / 1_000
}
