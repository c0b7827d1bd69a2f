//! Channel configuration: a JSON model with a default for every field.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use framelink_frame::FrameLimits;
use framelink_transport::Backoff;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::socket::SocketOptions;

/// Which backend to instantiate at start-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportPreference {
    /// Device if a driver is present, else shared memory, else socket.
    #[default]
    Auto,
    #[serde(rename = "shm", alias = "shared_memory")]
    SharedMemory,
    /// Device, falling back to shared memory when no device is usable.
    Device,
    Socket,
}

impl TransportPreference {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportPreference::Auto => "auto",
            TransportPreference::SharedMemory => "shm",
            TransportPreference::Device => "device",
            TransportPreference::Socket => "socket",
        }
    }
}

impl fmt::Display for TransportPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportPreference {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(TransportPreference::Auto),
            "shm" | "shared_memory" | "shared-memory" => Ok(TransportPreference::SharedMemory),
            "device" | "gpu" | "cuda" => Ok(TransportPreference::Device),
            "socket" | "uds" => Ok(TransportPreference::Socket),
            other => Err(ConfigError::UnknownTransport(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedMemoryConfig {
    /// Region name; a leading `/` is optional.
    pub name: String,
    pub max_width: u32,
    pub max_height: u32,
    pub max_channels: u32,
}

impl Default for SharedMemoryConfig {
    fn default() -> Self {
        Self {
            name: "framelink_frames".to_string(),
            max_width: 1920,
            max_height: 1080,
            max_channels: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub path: PathBuf,
    /// How long `publish` waits for the consumer to drain the socket.
    pub send_timeout_ms: u64,
    /// How long the producer retries connecting before giving up.
    pub connect_timeout_ms: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/framelink.sock"),
            send_timeout_ms: 1000,
            connect_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub fps: u32,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self { fps: 24 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub fps: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self { fps: 10 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachConfig {
    /// Total time a consumer keeps retrying to attach to a missing channel.
    pub max_wait_ms: u64,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: 10_000,
        }
    }
}

/// Everything both ends of a channel must agree on, plus per-side rates.
///
/// Read once at `create`/`attach`; changing it afterwards has no effect on
/// an open channel.
///
/// Files are JSON. Pipeline configs written for the camera/detector tools
/// carry the same sections under older names, and load once converted
/// from YAML to JSON:
///
/// | older key               | field                        |
/// |-------------------------|------------------------------|
/// | `shared_memory.*`       | `shared_memory.*` (same)     |
/// | `data_source.fps`       | `producer.fps`               |
/// | `inference.fps`         | `consumer.fps`               |
///
/// Other keys in those sections (camera index, model path, logging) are
/// ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub shared_memory: SharedMemoryConfig,
    pub transport: TransportPreference,
    pub socket: SocketConfig,
    #[serde(alias = "data_source")]
    pub producer: ProducerConfig,
    #[serde(alias = "inference")]
    pub consumer: ConsumerConfig,
    pub attach: AttachConfig,
}

impl ChannelConfig {
    /// Load and validate a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let shm = &self.shared_memory;
        framelink_shm::normalize_name(&shm.name).map_err(|err| ConfigError::Invalid {
            field: "shared_memory.name",
            reason: err.to_string(),
        })?;
        for (field, value) in [
            ("shared_memory.max_width", shm.max_width),
            ("shared_memory.max_height", shm.max_height),
            ("shared_memory.max_channels", shm.max_channels),
            ("producer.fps", self.producer.fps),
            ("consumer.fps", self.consumer.fps),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.socket.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "socket.path",
                reason: "must not be empty".to_string(),
            });
        }
        if self.socket.send_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "socket.send_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn limits(&self) -> FrameLimits {
        FrameLimits::new(
            self.shared_memory.max_width,
            self.shared_memory.max_height,
            self.shared_memory.max_channels,
        )
    }

    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            send_timeout: Duration::from_millis(self.socket.send_timeout_ms),
            connect_timeout: Duration::from_millis(self.socket.connect_timeout_ms),
        }
    }

    /// Backoff for consumers attaching before the producer has created the channel.
    pub fn attach_backoff(&self) -> Backoff {
        Backoff::with_max_wait(Duration::from_millis(self.attach.max_wait_ms))
    }

    pub fn producer_interval(&self) -> Duration {
        frame_interval(self.producer.fps)
    }

    pub fn consumer_interval(&self) -> Duration {
        frame_interval(self.consumer.fps)
    }
}

fn frame_interval(fps: u32) -> Duration {
    Duration::from_secs(1) / fps.max(1)
}
