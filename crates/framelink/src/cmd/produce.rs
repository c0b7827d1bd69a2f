use std::sync::atomic::Ordering;
use std::time::Instant;

use framelink_channel::{open_producer, Capabilities};
use framelink_frame::{ChannelError, FrameProducer, RawFrame};
use serde::Serialize;
use tracing::{info, warn};

use crate::cmd::{install_ctrlc_handler, pace, ProduceArgs, Side};
use crate::exit::{channel_error, CliError, CliResult, DATA_INVALID, SUCCESS};
use crate::output::{print_report, OutputFormat};

#[derive(Serialize)]
struct ProduceReport {
    schema_id: &'static str,
    backend: &'static str,
    published: u64,
    dropped: u64,
    last_sequence: u64,
}

/// Stand-in for a camera: a diagonal gradient that shifts every frame.
struct TestPattern {
    base: Vec<u8>,
    len: usize,
}

impl TestPattern {
    fn new(width: u32, height: u32, channels: u32) -> Self {
        let row = width as usize * channels as usize;
        let len = row * height as usize;
        // One extra period lets every frame be a window into the same buffer.
        let base = (0..len + 256)
            .map(|i| {
                let x = if row == 0 { 0 } else { i % row };
                let y = if row == 0 { 0 } else { i / row };
                (x + y) as u8
            })
            .collect();
        Self { base, len }
    }

    fn frame(&self, index: u64) -> &[u8] {
        let offset = (index % 256) as usize;
        &self.base[offset..offset + self.len]
    }
}

pub fn run(args: ProduceArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args.channel.resolve(Side::Producer)?;
    let limits = config.limits();
    let width = args.width.unwrap_or(limits.max_width);
    let height = args.height.unwrap_or(limits.max_height);
    let channels = args.channels.unwrap_or(limits.max_channels);
    if width > limits.max_width || height > limits.max_height || channels > limits.max_channels {
        return Err(CliError::new(
            DATA_INVALID,
            format!("{width}x{height}x{channels} exceeds channel limits {limits}"),
        ));
    }

    let running = install_ctrlc_handler()?;
    let caps = Capabilities::probe();
    let mut producer =
        open_producer(&config, &caps).map_err(|err| channel_error("open producer failed", err))?;
    let backend = producer.backend();

    let pattern = TestPattern::new(width, height, channels);
    let interval = config.producer_interval();
    let progress_every = u64::from(config.producer.fps) * 3;
    let mut published = 0u64;
    let mut dropped = 0u64;
    let mut last_sequence = 0u64;
    let mut index = 0u64;

    info!(%backend, width, height, channels, fps = config.producer.fps, "producing frames");

    while running.load(Ordering::SeqCst) && args.count.is_none_or(|count| published < count) {
        let started = Instant::now();
        let frame = RawFrame::new(pattern.frame(index), width, height, channels);
        index += 1;

        match producer.publish(&frame) {
            Ok(sequence) => {
                published += 1;
                last_sequence = sequence;
                if published % progress_every == 0 {
                    info!(published, dropped, sequence, "progress");
                }
            }
            Err(ChannelError::Timeout(waited)) => {
                dropped += 1;
                warn!(?waited, dropped, "frame dropped, consumer is not keeping up");
            }
            Err(err) => {
                let _ = producer.close();
                return Err(channel_error("publish failed", err));
            }
        }

        pace(started, interval, &running);
    }

    producer
        .close()
        .map_err(|err| channel_error("close failed", err))?;
    info!(published, dropped, "producer stopped");

    print_report(
        &ProduceReport {
            schema_id: "https://schemas.3leaps.dev/framelink/cli/v1/produce-report.schema.json",
            backend: backend.as_str(),
            published,
            dropped,
            last_sequence,
        },
        format,
    );
    Ok(SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_frames_have_exact_length_and_move() {
        let pattern = TestPattern::new(4, 3, 3);
        assert_eq!(pattern.frame(0).len(), 36);
        assert_eq!(pattern.frame(255).len(), 36);
        assert_ne!(pattern.frame(0), pattern.frame(1));
        assert_eq!(pattern.frame(0), pattern.frame(256));
    }

    #[test]
    fn empty_pattern_is_valid() {
        let pattern = TestPattern::new(0, 0, 0);
        assert!(pattern.frame(7).is_empty());
    }
}
