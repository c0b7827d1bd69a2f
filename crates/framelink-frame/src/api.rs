use std::fmt;
use std::time::Duration;

use crate::error::ChannelResult;
use crate::header::{FrameHeader, FrameLimits, RawFrame};

/// Which backing a channel end uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Two slots in a named POSIX shared-memory region.
    SharedMemory,
    /// Two device-resident slots coordinated through a host control region.
    Device,
    /// Length-prefixed frames over a Unix domain socket.
    Socket,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SharedMemory => "shm",
            Self::Device => "device",
            Self::Socket => "socket",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A device-resident frame payload.
///
/// `ptr` is a device address valid in the consumer's context until the next
/// `acquire` or `close` on the consumer that returned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBuffer {
    pub ptr: u64,
    pub len: usize,
    /// Row pitch in bytes (`width * channels`; slots are tightly packed).
    pub pitch: usize,
    pub device_ordinal: i32,
}

/// Payload of an acquired frame.
#[derive(Debug)]
pub enum FramePayload<'a> {
    /// Host bytes owned by the consumer handle.
    Host(&'a [u8]),
    /// Device memory, never copied to the host.
    Device(DeviceBuffer),
}

impl FramePayload<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::Host(bytes) => bytes.len(),
            Self::Device(buffer) => buffer.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Host bytes, if this payload lives in host memory.
    pub fn as_host(&self) -> Option<&[u8]> {
        match self {
            Self::Host(bytes) => Some(bytes),
            Self::Device(_) => None,
        }
    }
}

/// A frame returned by [`FrameConsumer::acquire`].
#[derive(Debug)]
pub struct AcquiredFrame<'a> {
    pub header: FrameHeader,
    pub payload: FramePayload<'a>,
}

/// Result of one `acquire` call.
///
/// The frame borrows the consumer, so it cannot be held across the next
/// `acquire`.
#[derive(Debug)]
pub enum Acquired<'a> {
    Frame(AcquiredFrame<'a>),
    /// Nothing newer than the last returned frame.
    NoNewFrame,
}

impl<'a> Acquired<'a> {
    pub fn frame(self) -> Option<AcquiredFrame<'a>> {
        match self {
            Self::Frame(frame) => Some(frame),
            Self::NoNewFrame => None,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Frame(_))
    }
}

/// Producer end of a frame channel.
pub trait FrameProducer: Send {
    /// Publish one frame and return the sequence number assigned to it.
    ///
    /// On host and device backings this never blocks on the consumer: an
    /// unread frame is overwritten. Frames that violate the channel limits
    /// are rejected without touching channel state.
    fn publish(&mut self, frame: &RawFrame<'_>) -> ChannelResult<u64>;

    fn backend(&self) -> Backend;

    fn limits(&self) -> FrameLimits;

    /// Tear the channel down; the consumer observes `ChannelClosed` or `PeerGone`.
    fn close(&mut self) -> ChannelResult<()>;
}

/// Consumer end of a frame channel.
pub trait FrameConsumer: Send {
    /// Fetch the newest frame not yet returned by this consumer.
    ///
    /// Host and device backings poll: they only wait (up to `timeout`) while
    /// the channel has never produced a frame. The socket backing waits up to
    /// `timeout` for the next message on every call.
    fn acquire(&mut self, timeout: Duration) -> ChannelResult<Acquired<'_>>;

    fn backend(&self) -> Backend;

    fn limits(&self) -> FrameLimits;

    /// Detach without destroying shared state.
    fn close(&mut self) -> ChannelResult<()>;
}

impl<P: FrameProducer + ?Sized> FrameProducer for Box<P> {
    fn publish(&mut self, frame: &RawFrame<'_>) -> ChannelResult<u64> {
        (**self).publish(frame)
    }

    fn backend(&self) -> Backend {
        (**self).backend()
    }

    fn limits(&self) -> FrameLimits {
        (**self).limits()
    }

    fn close(&mut self) -> ChannelResult<()> {
        (**self).close()
    }
}

impl<C: FrameConsumer + ?Sized> FrameConsumer for Box<C> {
    fn acquire(&mut self, timeout: Duration) -> ChannelResult<Acquired<'_>> {
        (**self).acquire(timeout)
    }

    fn backend(&self) -> Backend {
        (**self).backend()
    }

    fn limits(&self) -> FrameLimits {
        (**self).limits()
    }

    fn close(&mut self) -> ChannelResult<()> {
        (**self).close()
    }
}
