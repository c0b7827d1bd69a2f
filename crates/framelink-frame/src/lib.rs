//! Frame data model and wire framing shared by every framelink channel.
//!
//! - [`header`] — `FrameHeader`, `SlotState`, `FrameLimits`, `RawFrame`
//! - [`api`] — the `FrameProducer` / `FrameConsumer` interface all backends implement
//! - [`error`] — the channel error taxonomy
//! - [`codec`], [`reader`], [`writer`] — the socket wire format:
//!   an 8-byte payload size, a 32-byte header, then the payload
//!
//! No partial reads, no buffer management in user code.

pub mod api;
pub mod codec;
pub mod error;
pub mod header;
pub mod reader;
pub mod writer;

pub use api::{
    Acquired, AcquiredFrame, Backend, DeviceBuffer, FrameConsumer, FramePayload, FrameProducer,
};
pub use codec::{
    decode_frame, encode_frame, encode_header, FrameConfig, WireFrame, DEFAULT_MAX_PAYLOAD,
    FRAME_OVERHEAD,
    HEADER_SIZE, PREFIX_SIZE,
};
pub use error::{ChannelError, ChannelResult, FrameError, Result};
pub use header::{monotonic_micros, FrameHeader, FrameLimits, RawFrame, SlotState};
pub use reader::FrameReader;
pub use writer::FrameWriter;
