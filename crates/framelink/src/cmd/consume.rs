use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use framelink_channel::{open_consumer, retry_with_backoff, Capabilities, ChannelConfig};
use framelink_frame::{Acquired, Backend, ChannelError, FrameConsumer};
use tracing::{debug, info, warn};

use crate::cmd::{install_ctrlc_handler, pace, parse_duration, ConsumeArgs, Side};
use crate::exit::{channel_error, CliResult, SUCCESS};
use crate::output::{print_frame, OutputFormat};

pub fn run(args: ConsumeArgs, format: OutputFormat) -> CliResult<i32> {
    let mut config = args.channel.resolve(Side::Consumer)?;
    let timeout = parse_duration(&args.timeout)?;
    if let Some(attach_timeout) = &args.attach_timeout {
        config.attach.max_wait_ms = parse_duration(attach_timeout)?.as_millis() as u64;
    }

    let running = install_ctrlc_handler()?;
    let caps = Capabilities::probe();
    let mut consumer = attach(&config, &caps, &running)?;

    let interval = config.consumer_interval();
    let mut printed = 0u64;

    while running.load(Ordering::SeqCst) && args.count.is_none_or(|count| printed < count) {
        let started = Instant::now();
        let backend = consumer.backend();
        let mut reattach = false;

        match consumer.acquire(timeout) {
            Ok(Acquired::Frame(frame)) => {
                print_frame(&frame, backend, format);
                printed += 1;
            }
            Ok(Acquired::NoNewFrame) => debug!("no new frame"),
            Err(ChannelError::Timeout(waited)) => {
                debug!(?waited, "no frame before timeout");
                continue;
            }
            Err(ChannelError::ChannelClosed) => {
                info!(printed, "producer closed the channel");
                return Ok(SUCCESS);
            }
            Err(ChannelError::PeerGone(reason)) if backend == Backend::Socket => {
                // The next acquire waits for a new producer connection.
                warn!(%reason, "producer disconnected");
            }
            Err(ChannelError::PeerGone(reason)) => {
                warn!(%reason, "producer gone, re-attaching");
                reattach = true;
            }
            Err(err) => return Err(channel_error("acquire failed", err)),
        }

        if reattach {
            drop(consumer);
            consumer = attach(&config, &caps, &running)?;
            continue;
        }
        pace(started, interval, &running);
    }

    consumer
        .close()
        .map_err(|err| channel_error("close failed", err))?;
    info!(printed, "consumer stopped");
    Ok(SUCCESS)
}

fn attach(
    config: &ChannelConfig,
    caps: &Capabilities,
    running: &AtomicBool,
) -> CliResult<Box<dyn FrameConsumer>> {
    let started = Instant::now();
    let consumer = retry_with_backoff(&config.attach_backoff(), || {
        if !running.load(Ordering::SeqCst) {
            return Err(ChannelError::Timeout(started.elapsed()));
        }
        open_consumer(config, caps)
    })
    .map_err(|err| channel_error("attach failed", err))?;
    debug!(elapsed = ?started.elapsed(), "attached");
    Ok(consumer)
}
