//! Shared Frame Channel: two frame slots in a named POSIX shared-memory
//! region, coordinated by a process-shared mutex and condition variable that
//! live inside the same region.
//!
//! The producer creates the region and never blocks on the consumer: an
//! unread frame is overwritten by the next publish. The consumer attaches,
//! polls for the newest frame, and detaches without destroying anything.
//!
//! [`ControlRegion`] is the slot protocol on its own. The device channel
//! reuses it with device-resident payloads.

#[cfg(not(unix))]
compile_error!("framelink-shm requires a unix platform");

pub mod channel;
pub mod control;
pub mod region;
mod sync;

pub use channel::{SharedFrameConsumer, SharedFrameProducer};
pub use control::{
    Backing, ControlInit, ControlRegion, ControlSnapshot, ReadOutcome, SlotSnapshot,
    DEVICE_HANDLE_SIZE, SLOT_COUNT,
};
pub use region::{normalize_name, pid_alive, probe_shared_memory, ShmRegion};
