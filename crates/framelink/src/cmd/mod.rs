use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};
use framelink_channel::{ChannelConfig, TransportPreference};

use crate::exit::{config_error, CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod consume;
pub mod inspect;
pub mod probe;
pub mod produce;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Publish a synthetic moving test pattern.
    Produce(ProduceArgs),
    /// Acquire frames and print their metadata.
    Consume(ConsumeArgs),
    /// Report which backends this host supports.
    Probe(ProbeArgs),
    /// Print the control state of a shared-memory channel.
    Inspect(InspectArgs),
    /// Show version information.
    Version(VersionArgs),
}

impl Command {
    pub fn role(&self) -> &'static str {
        match self {
            Command::Produce(_) => "producer",
            Command::Consume(_) => "consumer",
            Command::Probe(_) => "probe",
            Command::Inspect(_) => "inspect",
            Command::Version(_) => "version",
        }
    }
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Produce(args) => produce::run(args, format),
        Command::Consume(args) => consume::run(args, format),
        Command::Probe(args) => probe::run(args, format),
        Command::Inspect(args) => inspect::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// Where the channel configuration comes from, plus per-field overrides.
#[derive(Args, Debug, Default)]
pub struct ChannelArgs {
    /// JSON configuration file.
    #[arg(long, value_name = "PATH", env = "FRAMELINK_CONFIG")]
    pub config: Option<PathBuf>,
    /// Shared-memory channel name.
    #[arg(long)]
    pub name: Option<String>,
    /// Backend preference: auto, shm, device or socket.
    #[arg(long, value_name = "KIND", env = "FRAMELINK_TRANSPORT")]
    pub transport: Option<TransportPreference>,
    /// Socket path for the socket backend.
    #[arg(long, value_name = "PATH")]
    pub socket_path: Option<PathBuf>,
    /// Frames per second for this side.
    #[arg(long)]
    pub fps: Option<u32>,
}

/// Which side's rate `--fps` overrides.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Producer,
    Consumer,
}

impl ChannelArgs {
    pub fn resolve(&self, side: Side) -> CliResult<ChannelConfig> {
        let mut config = match &self.config {
            Some(path) => ChannelConfig::from_path(path).map_err(config_error)?,
            None => ChannelConfig::default(),
        };
        if let Some(name) = &self.name {
            config.shared_memory.name = name.clone();
        }
        if let Some(transport) = self.transport {
            config.transport = transport;
        }
        if let Some(path) = &self.socket_path {
            config.socket.path = path.clone();
        }
        if let Some(fps) = self.fps {
            match side {
                Side::Producer => config.producer.fps = fps,
                Side::Consumer => config.consumer.fps = fps,
            }
        }
        config.validate().map_err(config_error)?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
pub struct ProduceArgs {
    #[command(flatten)]
    pub channel: ChannelArgs,
    /// Frame width (default: the channel maximum).
    #[arg(long)]
    pub width: Option<u32>,
    /// Frame height (default: the channel maximum).
    #[arg(long)]
    pub height: Option<u32>,
    /// Channels per pixel (default: the channel maximum).
    #[arg(long)]
    pub channels: Option<u32>,
    /// Stop after publishing N frames.
    #[arg(long)]
    pub count: Option<u64>,
}

#[derive(Args, Debug)]
pub struct ConsumeArgs {
    #[command(flatten)]
    pub channel: ChannelArgs,
    /// Exit after printing N frames.
    #[arg(long)]
    pub count: Option<u64>,
    /// Longest a single acquire waits (e.g. 1s, 250ms).
    #[arg(long, default_value = "1s")]
    pub timeout: String,
    /// How long to keep retrying while the channel does not exist yet.
    #[arg(long, value_name = "DURATION")]
    pub attach_timeout: Option<String>,
}

#[derive(Args, Debug, Default)]
pub struct ProbeArgs {
    /// Preference to compute the backend order for.
    #[arg(long, value_name = "KIND", env = "FRAMELINK_TRANSPORT", default_value = "auto")]
    pub transport: TransportPreference,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    #[command(flatten)]
    pub channel: ChannelArgs,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(match unit {
        "ms" => Duration::from_millis(value),
        _ => Duration::from_secs(value),
    })
}

/// Flag cleared by Ctrl-C.
pub fn install_ctrlc_handler() -> CliResult<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))?;
    Ok(running)
}

/// Sleep the rest of `interval` since `started`, waking early on Ctrl-C.
pub fn pace(started: std::time::Instant, interval: Duration, running: &AtomicBool) {
    const STEP: Duration = Duration::from_millis(50);
    while running.load(Ordering::SeqCst) {
        let left = interval.saturating_sub(started.elapsed());
        if left.is_zero() {
            return;
        }
        std::thread::sleep(left.min(STEP));
    }
}
