//! Device Frame Channel: the two-slot protocol of `framelink-shm` with slot
//! payloads in GPU memory.
//!
//! The producer copies host pixels into device slots; the consumer gets a
//! device pointer it can wrap as an inference tensor, with no copy back to
//! the host. Headers, slot states and the lock stay in a host shared-memory
//! control region.
//!
//! The CUDA driver is loaded with `dlopen` on first use, so this crate builds
//! and runs on hosts without it; every entry point fails with
//! `DeviceUnavailable` there before touching device memory.

pub mod channel;
pub mod driver;
pub mod memory;

pub use channel::{DeviceFrameConsumer, DeviceFrameProducer};
pub use driver::{probe_device, DeviceProbe};
pub use memory::{CudaDevice, DeviceMemory, DevicePtr};
