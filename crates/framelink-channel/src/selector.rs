//! Capability probe and start-up backend selection.

use framelink_device::{CudaDevice, DeviceFrameConsumer, DeviceFrameProducer};
use framelink_frame::{Backend, ChannelError, ChannelResult, FrameConsumer, FrameProducer};
use framelink_shm::{Backing, ControlRegion, SharedFrameConsumer, SharedFrameProducer};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{ChannelConfig, TransportPreference};
use crate::socket::{SocketFrameConsumer, SocketFrameProducer};

/// What this host can back a channel with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub shared_memory: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_memory_error: Option<String>,
    pub device_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_error: Option<String>,
}

impl Capabilities {
    /// Probe shared memory with a throwaway region and the device driver
    /// without allocating device memory.
    pub fn probe() -> Self {
        let (shared_memory, shared_memory_error) = match framelink_shm::probe_shared_memory() {
            Ok(()) => (true, None),
            Err(err) => (false, Some(err.to_string())),
        };
        let device = framelink_device::probe_device();
        Self {
            shared_memory,
            shared_memory_error,
            device_count: device.device_count,
            device_error: device.reason,
        }
    }

    pub fn device(&self) -> bool {
        self.device_count > 0
    }
}

/// Backends to try, in order, for a preference on a host with `caps`.
///
/// Only `DeviceUnavailable` moves on to the next entry.
pub fn plan(preference: TransportPreference, caps: &Capabilities) -> Vec<Backend> {
    match preference {
        TransportPreference::Auto => {
            let mut order = Vec::with_capacity(3);
            if caps.device() {
                order.push(Backend::Device);
            }
            if caps.shared_memory {
                order.push(Backend::SharedMemory);
            }
            order.push(Backend::Socket);
            order
        }
        TransportPreference::Device => vec![Backend::Device, Backend::SharedMemory],
        TransportPreference::SharedMemory => vec![Backend::SharedMemory],
        TransportPreference::Socket => vec![Backend::Socket],
    }
}

/// Create the producer end of the configured channel.
pub fn open_producer(
    config: &ChannelConfig,
    caps: &Capabilities,
) -> ChannelResult<Box<dyn FrameProducer>> {
    let order = plan(config.transport, caps);
    let mut last_err = None;
    for (i, backend) in order.iter().enumerate() {
        match open_producer_backend(*backend, config) {
            Ok(producer) => {
                info!(
                    backend = %backend,
                    preference = %config.transport,
                    limits = %producer.limits(),
                    "frame producer ready"
                );
                return Ok(producer);
            }
            Err(ChannelError::DeviceUnavailable(reason)) if i + 1 < order.len() => {
                warn!(
                    backend = %backend,
                    next = %order[i + 1],
                    %reason,
                    "backend unavailable, falling back"
                );
                last_err = Some(ChannelError::DeviceUnavailable(reason));
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| ChannelError::DeviceUnavailable("no backend to try".into())))
}

fn open_producer_backend(
    backend: Backend,
    config: &ChannelConfig,
) -> ChannelResult<Box<dyn FrameProducer>> {
    let name = &config.shared_memory.name;
    let limits = config.limits();
    Ok(match backend {
        Backend::Device => Box::new(DeviceFrameProducer::create(name, limits, 0)?),
        Backend::SharedMemory => Box::new(SharedFrameProducer::create(name, limits)?),
        Backend::Socket => Box::new(SocketFrameProducer::connect(
            &config.socket.path,
            limits,
            config.socket_options(),
        )?),
    })
}

/// Open the consumer end of the configured channel.
///
/// Shared-region backends attach to whatever the producer created: a
/// device preference that fell back to host memory still yields a working
/// consumer. `ChannelNotFound` means the producer is not up yet; see
/// [`retry_with_backoff`](crate::retry_with_backoff).
pub fn open_consumer(
    config: &ChannelConfig,
    caps: &Capabilities,
) -> ChannelResult<Box<dyn FrameConsumer>> {
    let order = plan(config.transport, caps);
    let consumer: Box<dyn FrameConsumer> = match order.first() {
        Some(Backend::Device | Backend::SharedMemory) => attach_region(&config.shared_memory.name)?,
        Some(Backend::Socket) | None => Box::new(SocketFrameConsumer::bind(
            &config.socket.path,
            config.limits(),
        )?),
    };
    info!(
        backend = %consumer.backend(),
        preference = %config.transport,
        limits = %consumer.limits(),
        "frame consumer ready"
    );
    Ok(consumer)
}

/// Attach to a shared region, host or device backed.
pub fn attach_region(name: &str) -> ChannelResult<Box<dyn FrameConsumer>> {
    let control = ControlRegion::attach(name)?;
    Ok(match control.backing() {
        Backing::Host => Box::new(SharedFrameConsumer::from_control(control)?),
        Backing::Device => {
            let memory = CudaDevice::open(control.device_ordinal())?;
            Box::new(DeviceFrameConsumer::from_control(control, memory)?)
        }
    })
}
