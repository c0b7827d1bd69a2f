use std::time::Duration;

use framelink_frame::{
    Acquired, AcquiredFrame, Backend, ChannelError, ChannelResult, FrameConsumer, FrameHeader,
    FrameLimits, FramePayload, FrameProducer, RawFrame,
};
use tracing::debug;

use crate::control::{Backing, ControlInit, ControlRegion, ReadOutcome};

/// Producer end of a Shared Frame Channel.
#[derive(Debug)]
pub struct SharedFrameProducer {
    control: ControlRegion,
    closed: bool,
}

impl SharedFrameProducer {
    /// Create the named channel with room for frames up to `limits`.
    pub fn create(name: &str, limits: FrameLimits) -> ChannelResult<Self> {
        let control = ControlRegion::create(name, ControlInit::host(limits))?;
        Ok(Self {
            control,
            closed: false,
        })
    }

    /// The normalized shared-memory name.
    pub fn name(&self) -> &str {
        self.control.name()
    }

    pub fn control(&self) -> &ControlRegion {
        &self.control
    }
}

impl FrameProducer for SharedFrameProducer {
    fn publish(&mut self, frame: &RawFrame<'_>) -> ChannelResult<u64> {
        if self.closed {
            return Err(ChannelError::ChannelClosed);
        }
        self.control.limits().check(frame)?;

        let slot = self.control.begin_write()?;
        // SAFETY: `begin_write` marked `slot` Writing, so the consumer will not read it,
        // and `check` bounded the length by the slot capacity.
        let dst = unsafe { self.control.slot_payload_mut(slot, frame.pixels.len()) };
        dst.copy_from_slice(frame.pixels);

        self.control.commit_write(
            slot,
            &FrameHeader {
                sequence_number: 0,
                timestamp_us: frame.timestamp_us,
                width: frame.width,
                height: frame.height,
                channels: frame.channels,
                payload_size: frame.pixels.len() as u64,
            },
        )
    }

    fn backend(&self) -> Backend {
        Backend::SharedMemory
    }

    fn limits(&self) -> FrameLimits {
        self.control.limits()
    }

    fn close(&mut self) -> ChannelResult<()> {
        self.closed = true;
        self.control.close()
    }
}

/// Consumer end of a Shared Frame Channel.
///
/// Each new frame is copied out of its slot into a buffer owned by the
/// consumer; the slot is handed back before `acquire` returns.
#[derive(Debug)]
pub struct SharedFrameConsumer {
    control: ControlRegion,
    last_seen: u64,
    buf: Vec<u8>,
    closed: bool,
}

impl SharedFrameConsumer {
    /// Attach to a channel created by a live producer.
    ///
    /// Fails with `ChannelNotFound` when the producer has not created it yet;
    /// callers that start before the producer retry with backoff.
    pub fn attach(name: &str) -> ChannelResult<Self> {
        Self::from_control(ControlRegion::attach(name)?)
    }

    /// Take over an attached host-backed region.
    pub fn from_control(control: ControlRegion) -> ChannelResult<Self> {
        if control.backing() != Backing::Host {
            return Err(ChannelError::Incompatible(format!(
                "channel {} has {} backing",
                control.name(),
                control.backing().as_str()
            )));
        }
        control.release_stale_reads()?;
        Ok(Self {
            control,
            last_seen: 0,
            buf: Vec::new(),
            closed: false,
        })
    }

    /// Sequence number of the last frame returned, 0 before the first.
    pub fn last_sequence(&self) -> u64 {
        self.last_seen
    }

    pub fn control(&self) -> &ControlRegion {
        &self.control
    }
}

impl FrameConsumer for SharedFrameConsumer {
    fn acquire(&mut self, timeout: Duration) -> ChannelResult<Acquired<'_>> {
        if self.closed {
            return Err(ChannelError::ChannelClosed);
        }

        let (slot, header) = match self.control.begin_read(self.last_seen, timeout)? {
            ReadOutcome::NoNewFrame => return Ok(Acquired::NoNewFrame),
            ReadOutcome::Ready { slot, header } => (slot, header),
        };

        if header.payload_size > self.control.limits().slot_capacity() {
            self.control.end_read(slot)?;
            return Err(ChannelError::Incompatible(format!(
                "slot {slot} claims {} bytes, capacity is {}",
                header.payload_size,
                self.control.limits().slot_capacity()
            )));
        }

        let len = header.payload_size as usize;
        self.buf.clear();
        // SAFETY: `begin_read` marked `slot` Reading, so the producer will not write
        // it until `end_read`, and `len` is within the slot capacity.
        self.buf
            .extend_from_slice(unsafe { self.control.slot_payload(slot, len) });
        self.control.end_read(slot)?;

        debug_assert!(header.sequence_number > self.last_seen);
        self.last_seen = header.sequence_number;
        debug!(slot, sequence = header.sequence_number, "acquired frame");

        Ok(Acquired::Frame(AcquiredFrame {
            header,
            payload: FramePayload::Host(&self.buf),
        }))
    }

    fn backend(&self) -> Backend {
        Backend::SharedMemory
    }

    fn limits(&self) -> FrameLimits {
        self.control.limits()
    }

    fn close(&mut self) -> ChannelResult<()> {
        self.closed = true;
        self.control.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelink_frame::SlotState;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn unique_name(tag: &str) -> String {
        format!(
            "/flch-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .subsec_nanos()
        )
    }

    fn pattern(width: u32, height: u32, channels: u32, seed: u8) -> Vec<u8> {
        (0..width * height * channels)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    const LIMITS: FrameLimits = FrameLimits::new(64, 48, 3);

    fn expect_frame<'a>(acquired: Acquired<'a>) -> AcquiredFrame<'a> {
        acquired.frame().expect("expected a new frame")
    }

    #[test]
    fn round_trip_is_byte_identical() {
        let name = unique_name("rt");
        let mut producer = SharedFrameProducer::create(&name, LIMITS).unwrap();
        let mut consumer = SharedFrameConsumer::attach(&name).unwrap();

        let pixels = pattern(64, 48, 3, 7);
        let frame = RawFrame::new(&pixels, 64, 48, 3).with_timestamp(123_456);
        let seq = producer.publish(&frame).unwrap();
        assert_eq!(seq, 1);

        let got = expect_frame(consumer.acquire(Duration::from_secs(1)).unwrap());
        assert_eq!(got.header.sequence_number, 1);
        assert_eq!(got.header.timestamp_us, 123_456);
        assert_eq!(
            (got.header.width, got.header.height, got.header.channels),
            (64, 48, 3)
        );
        assert_eq!(got.payload.as_host().unwrap(), pixels.as_slice());
    }

    #[test]
    fn second_acquire_without_publish_is_no_new_frame() {
        let name = unique_name("nonew");
        let mut producer = SharedFrameProducer::create(&name, LIMITS).unwrap();
        let mut consumer = SharedFrameConsumer::attach(&name).unwrap();

        let pixels = pattern(4, 4, 3, 1);
        producer.publish(&RawFrame::new(&pixels, 4, 4, 3)).unwrap();

        assert!(consumer.acquire(Duration::from_secs(1)).unwrap().is_new());
        let start = Instant::now();
        assert!(!consumer.acquire(Duration::from_secs(1)).unwrap().is_new());
        assert!(
            start.elapsed() < Duration::from_millis(500),
            "poll must not wait once a frame exists"
        );
    }

    #[test]
    fn latest_wins_and_sequences_increase() {
        let name = unique_name("latest");
        let mut producer = SharedFrameProducer::create(&name, LIMITS).unwrap();
        let mut consumer = SharedFrameConsumer::attach(&name).unwrap();

        for seed in 1..=5u8 {
            let pixels = pattern(8, 8, 1, seed);
            producer.publish(&RawFrame::new(&pixels, 8, 8, 1)).unwrap();
        }

        let got = expect_frame(consumer.acquire(Duration::ZERO).unwrap());
        assert_eq!(got.header.sequence_number, 5);
        assert_eq!(got.payload.as_host().unwrap(), pattern(8, 8, 1, 5).as_slice());

        let pixels = pattern(8, 8, 1, 6);
        producer.publish(&RawFrame::new(&pixels, 8, 8, 1)).unwrap();
        let got = expect_frame(consumer.acquire(Duration::ZERO).unwrap());
        assert_eq!(got.header.sequence_number, 6);
    }

    #[test]
    fn oversized_frame_leaves_state_unchanged() {
        let name = unique_name("big");
        let mut producer = SharedFrameProducer::create(&name, LIMITS).unwrap();
        let mut consumer = SharedFrameConsumer::attach(&name).unwrap();

        let pixels = pattern(8, 8, 3, 9);
        producer.publish(&RawFrame::new(&pixels, 8, 8, 3)).unwrap();
        let before = producer.control().snapshot().unwrap();

        let wide = vec![0u8; 65 * 2 * 3];
        let err = producer
            .publish(&RawFrame::new(&wide, 65, 2, 3))
            .unwrap_err();
        assert!(matches!(err, ChannelError::FrameTooLarge { width: 65, .. }));

        let deep = vec![0u8; 4 * 4 * 4];
        assert!(matches!(
            producer.publish(&RawFrame::new(&deep, 4, 4, 4)),
            Err(ChannelError::FrameTooLarge { channels: 4, .. })
        ));
        assert!(matches!(
            producer.publish(&RawFrame::new(&deep, 4, 4, 3)),
            Err(ChannelError::InvalidFrame { .. })
        ));

        assert_eq!(producer.control().snapshot().unwrap(), before);
        let got = expect_frame(consumer.acquire(Duration::ZERO).unwrap());
        assert_eq!(got.header.sequence_number, 1);
        assert_eq!(got.payload.as_host().unwrap(), pixels.as_slice());
    }

    #[test]
    fn empty_and_maximum_frames() {
        let name = unique_name("sizes");
        let mut producer = SharedFrameProducer::create(&name, LIMITS).unwrap();
        let mut consumer = SharedFrameConsumer::attach(&name).unwrap();

        producer.publish(&RawFrame::new(&[], 0, 0, 0)).unwrap();
        let got = expect_frame(consumer.acquire(Duration::ZERO).unwrap());
        assert!(got.payload.is_empty());

        let pixels = pattern(64, 48, 3, 2);
        producer.publish(&RawFrame::new(&pixels, 64, 48, 3)).unwrap();
        let got = expect_frame(consumer.acquire(Duration::ZERO).unwrap());
        assert_eq!(got.payload.len(), LIMITS.slot_capacity() as usize);
    }

    #[test]
    fn first_acquire_times_out_when_nothing_published() {
        let name = unique_name("timeout");
        let _producer = SharedFrameProducer::create(&name, LIMITS).unwrap();
        let mut consumer = SharedFrameConsumer::attach(&name).unwrap();

        let err = consumer.acquire(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn producer_close_is_channel_closed() {
        let name = unique_name("close");
        let mut producer = SharedFrameProducer::create(&name, LIMITS).unwrap();
        let mut consumer = SharedFrameConsumer::attach(&name).unwrap();

        producer.close().unwrap();
        assert!(matches!(
            producer.publish(&RawFrame::new(&[], 0, 0, 0)),
            Err(ChannelError::ChannelClosed)
        ));
        assert!(matches!(
            consumer.acquire(Duration::from_secs(1)),
            Err(ChannelError::ChannelClosed)
        ));
    }

    #[test]
    fn dropped_producer_closes_channel() {
        let name = unique_name("drop");
        let producer = SharedFrameProducer::create(&name, LIMITS).unwrap();
        let mut consumer = SharedFrameConsumer::attach(&name).unwrap();
        drop(producer);

        assert!(matches!(
            consumer.acquire(Duration::from_secs(1)),
            Err(ChannelError::ChannelClosed)
        ));
        assert!(matches!(
            SharedFrameConsumer::attach(&name),
            Err(ChannelError::ChannelNotFound { .. })
        ));
    }

    #[test]
    fn consumer_can_reattach() {
        let name = unique_name("reattach");
        let mut producer = SharedFrameProducer::create(&name, LIMITS).unwrap();

        let pixels = pattern(2, 2, 3, 4);
        producer.publish(&RawFrame::new(&pixels, 2, 2, 3)).unwrap();
        {
            let mut consumer = SharedFrameConsumer::attach(&name).unwrap();
            assert!(consumer.acquire(Duration::ZERO).unwrap().is_new());
            consumer.close().unwrap();
            assert!(matches!(
                consumer.acquire(Duration::ZERO),
                Err(ChannelError::ChannelClosed)
            ));
        }

        producer.publish(&RawFrame::new(&pixels, 2, 2, 3)).unwrap();
        let mut consumer = SharedFrameConsumer::attach(&name).unwrap();
        let got = expect_frame(consumer.acquire(Duration::ZERO).unwrap());
        assert_eq!(got.header.sequence_number, 2);
    }

    #[test]
    fn fast_producer_slow_consumer_stress() {
        const FRAMES: u64 = 10_000;
        let name = unique_name("stress");
        let mut producer = SharedFrameProducer::create(&name, LIMITS).unwrap();
        let mut consumer = SharedFrameConsumer::attach(&name).unwrap();
        let done = Arc::new(AtomicBool::new(false));

        let reader = {
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut last = 0u64;
                let mut seen = 0u64;
                loop {
                    let finished = done.load(Ordering::Acquire);
                    match consumer.acquire(Duration::from_secs(5)).unwrap() {
                        Acquired::Frame(frame) => {
                            let seq = frame.header.sequence_number;
                            assert!(seq > last, "sequence went from {last} to {seq}");
                            assert_eq!(frame.header.timestamp_us, seq * 10);
                            let fill = (seq % 251) as u8;
                            let bytes = frame.payload.as_host().unwrap();
                            assert_eq!(bytes.len() as u64, frame.header.payload_size);
                            assert!(bytes.iter().all(|b| *b == fill), "torn read at {seq}");
                            last = seq;
                            seen += 1;
                        }
                        Acquired::NoNewFrame if finished => break,
                        Acquired::NoNewFrame => {}
                    }
                    std::thread::sleep(Duration::from_micros(600));
                }
                (last, seen, consumer)
            })
        };

        for seq in 1..=FRAMES {
            let width = 1 + (seq % 64) as u32;
            let pixels = vec![(seq % 251) as u8; width as usize * 48 * 3];
            let frame = RawFrame::new(&pixels, width, 48, 3).with_timestamp(seq * 10);
            assert_eq!(producer.publish(&frame).unwrap(), seq);
            std::thread::sleep(Duration::from_micros(50));
        }
        done.store(true, Ordering::Release);

        let (last, seen, consumer) = reader.join().unwrap();
        assert_eq!(last, FRAMES, "consumer must end on the newest frame");
        assert!(seen > 0 && seen <= FRAMES);

        let snapshot = producer.control().snapshot().unwrap();
        assert_eq!(snapshot.last_sequence, FRAMES);
        for slot in snapshot.slots {
            assert!(
                !matches!(slot.state, SlotState::Writing | SlotState::Reading),
                "slot left in {}",
                slot.state
            );
        }
        drop(consumer);
    }
}
