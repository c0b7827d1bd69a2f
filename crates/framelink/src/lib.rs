//! Latest-wins video frame exchange between two processes.
//!
//! A producer publishes raw frames at its own rate; a consumer picks up the
//! newest one at its own rate. Frames travel through a named shared-memory
//! region, through GPU memory shared between the processes, or, as a
//! fallback, through a Unix domain socket.
//!
//! # Crate Structure
//!
//! - [`frame`] — Frame data model, error taxonomy, producer/consumer traits, socket wire codec
//! - [`transport`] — Unix domain sockets with stale-path cleanup and connect backoff
//! - [`shm`] — Shared Frame Channel (two slots in host shared memory)
//! - [`device`] — Device Frame Channel (two slots in CUDA memory)
//! - [`channel`] — Socket Frame Channel, configuration, capability probe and backend selection
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use framelink::channel::{open_consumer, retry_with_backoff, Capabilities, ChannelConfig};
//!
//! let config = ChannelConfig::default();
//! let caps = Capabilities::probe();
//! let mut consumer = retry_with_backoff(&config.attach_backoff(), || open_consumer(&config, &caps))?;
//! if let Some(frame) = consumer.acquire(Duration::from_secs(1))?.frame() {
//!     println!("frame {} is {}x{}", frame.header.sequence_number, frame.header.width, frame.header.height);
//! }
//! # Ok::<(), framelink::frame::ChannelError>(())
//! ```

/// Re-export frame types.
pub mod frame {
    pub use framelink_frame::*;
}

/// Re-export transport types.
pub mod transport {
    pub use framelink_transport::*;
}

/// Re-export shared-memory channel types.
pub mod shm {
    pub use framelink_shm::*;
}

/// Re-export device channel types.
pub mod device {
    pub use framelink_device::*;
}

/// Re-export socket channel, configuration and selection types.
pub mod channel {
    pub use framelink_channel::*;
}

pub use framelink_frame::{
    Acquired, AcquiredFrame, Backend, ChannelError, ChannelResult, FrameConsumer, FrameLimits,
    FramePayload, FrameProducer, RawFrame,
};
