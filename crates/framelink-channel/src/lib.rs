//! Channel selection for framelink.
//!
//! This is the layer collaborators use: load a [`ChannelConfig`], probe the
//! host once, and open a producer or consumer end behind the
//! [`FrameProducer`](framelink_frame::FrameProducer) /
//! [`FrameConsumer`](framelink_frame::FrameConsumer) traits. Also home of
//! the Socket Frame Channel.

pub mod config;
pub mod error;
pub mod retry;
pub mod selector;
pub mod socket;

pub use config::{
    AttachConfig, ChannelConfig, ConsumerConfig, ProducerConfig, SharedMemoryConfig, SocketConfig,
    TransportPreference,
};
pub use error::{ConfigError, Result};
pub use retry::retry_with_backoff;
pub use selector::{attach_region, open_consumer, open_producer, plan, Capabilities};
pub use socket::{SocketFrameConsumer, SocketFrameProducer, SocketOptions};
