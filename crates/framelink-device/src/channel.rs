use std::time::Duration;

use framelink_frame::{
    Acquired, AcquiredFrame, Backend, ChannelError, ChannelResult, DeviceBuffer, FrameConsumer,
    FrameHeader, FrameLimits, FramePayload, FrameProducer, RawFrame,
};
use framelink_shm::{Backing, ControlInit, ControlRegion, ReadOutcome, SLOT_COUNT};
use tracing::{debug, warn};

use crate::memory::{CudaDevice, DeviceMemory, DevicePtr};

/// Producer end of a Device Frame Channel.
///
/// Owns two device allocations sized for the channel limits; frames are
/// copied into them from host memory.
pub struct DeviceFrameProducer<M: DeviceMemory = CudaDevice> {
    control: ControlRegion,
    memory: M,
    slots: [DevicePtr; SLOT_COUNT],
    closed: bool,
}

impl DeviceFrameProducer<CudaDevice> {
    /// Create the named channel on CUDA device `ordinal`.
    ///
    /// Fails with `DeviceUnavailable` before creating anything when the
    /// device cannot be used.
    pub fn create(name: &str, limits: FrameLimits, ordinal: i32) -> ChannelResult<Self> {
        Self::create_with(name, limits, CudaDevice::open(ordinal)?)
    }
}

impl<M: DeviceMemory> DeviceFrameProducer<M> {
    pub fn create_with(name: &str, limits: FrameLimits, mut memory: M) -> ChannelResult<Self> {
        let capacity = usize::try_from(limits.slot_capacity()).map_err(|_| {
            ChannelError::Device(format!("frame limits {limits} exceed addressable memory"))
        })?;

        let mut slots = [0; SLOT_COUNT];
        let mut handles = [[0; framelink_shm::DEVICE_HANDLE_SIZE]; SLOT_COUNT];
        let mut allocated = 0;
        let exported = (|| {
            for i in 0..SLOT_COUNT {
                slots[i] = memory.alloc(capacity)?;
                allocated += 1;
                handles[i] = memory.export(slots[i])?;
            }
            ControlRegion::create(
                name,
                ControlInit::device(limits, memory.ordinal(), handles),
            )
        })();

        match exported {
            Ok(control) => {
                debug!(name = %control.name(), capacity, "allocated device slots");
                Ok(Self {
                    control,
                    memory,
                    slots,
                    closed: false,
                })
            }
            Err(err) => {
                for ptr in &slots[..allocated] {
                    let _ = memory.free(*ptr);
                }
                Err(err)
            }
        }
    }

    pub fn name(&self) -> &str {
        self.control.name()
    }

    pub fn control(&self) -> &ControlRegion {
        &self.control
    }
}

impl<M: DeviceMemory> FrameProducer for DeviceFrameProducer<M> {
    fn publish(&mut self, frame: &RawFrame<'_>) -> ChannelResult<u64> {
        if self.closed {
            return Err(ChannelError::ChannelClosed);
        }
        self.control.limits().check(frame)?;

        let slot = self.control.begin_write()?;
        if let Err(err) = self.memory.copy_from_host(self.slots[slot], frame.pixels) {
            self.control.abort_write(slot)?;
            return Err(err);
        }

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
        Backend::Device
    }

    fn limits(&self) -> FrameLimits {
        self.control.limits()
    }

    fn close(&mut self) -> ChannelResult<()> {
        self.closed = true;
        self.control.close()
    }
}

impl<M: DeviceMemory> Drop for DeviceFrameProducer<M> {
    fn drop(&mut self) {
        if let Err(err) = self.control.close() {
            warn!(name = %self.control.name(), error = %err, "failed to close device channel");
        }
        for ptr in self.slots {
            if let Err(err) = self.memory.free(ptr) {
                warn!(error = %err, "failed to free device slot");
            }
        }
    }
}

impl<M: DeviceMemory> std::fmt::Debug for DeviceFrameProducer<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceFrameProducer")
            .field("control", &self.control)
            .field("ordinal", &self.memory.ordinal())
            .finish()
    }
}

/// Consumer end of a Device Frame Channel.
///
/// A returned frame's device memory stays valid, and is not overwritten,
/// until the next `acquire` or `close`.
pub struct DeviceFrameConsumer<M: DeviceMemory = CudaDevice> {
    control: ControlRegion,
    memory: M,
    slots: [DevicePtr; SLOT_COUNT],
    held: Option<usize>,
    last_seen: u64,
    closed: bool,
}

impl DeviceFrameConsumer<CudaDevice> {
    /// Attach to a device-backed channel, opening the device it was created on.
    pub fn attach(name: &str) -> ChannelResult<Self> {
        let control = ControlRegion::attach(name)?;
        require_device_backing(&control)?;
        let memory = CudaDevice::open(control.device_ordinal())?;
        Self::from_control(control, memory)
    }
}

impl<M: DeviceMemory> DeviceFrameConsumer<M> {
    /// Take over an attached device-backed region and import its slots.
    pub fn from_control(control: ControlRegion, mut memory: M) -> ChannelResult<Self> {
        require_device_backing(&control)?;
        control.release_stale_reads()?;

        let mut slots = [0; SLOT_COUNT];
        for (i, slot) in slots.iter_mut().enumerate() {
            match memory.import(&control.device_handle(i)) {
                Ok(ptr) => *slot = ptr,
                Err(err) => {
                    for ptr in &slots[..i] {
                        let _ = memory.release_import(*ptr);
                    }
                    return Err(err);
                }
            }
        }
        debug!(name = %control.name(), "imported device slots");

        Ok(Self {
            control,
            memory,
            slots,
            held: None,
            last_seen: 0,
            closed: false,
        })
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_seen
    }

    pub fn control(&self) -> &ControlRegion {
        &self.control
    }

    fn release_held(&mut self) -> ChannelResult<()> {
        if let Some(slot) = self.held.take() {
            self.control.end_read(slot)?;
        }
        Ok(())
    }
}

fn require_device_backing(control: &ControlRegion) -> ChannelResult<()> {
    if control.backing() != Backing::Device {
        return Err(ChannelError::Incompatible(format!(
            "channel {} has {} backing",
            control.name(),
            control.backing().as_str()
        )));
    }
    Ok(())
}

impl<M: DeviceMemory> FrameConsumer for DeviceFrameConsumer<M> {
    fn acquire(&mut self, timeout: Duration) -> ChannelResult<Acquired<'_>> {
        if self.closed {
            return Err(ChannelError::ChannelClosed);
        }

        let outcome = match self.held {
            Some(held) => self.control.advance_read(held, self.last_seen)?,
            None => self.control.begin_read(self.last_seen, timeout)?,
        };
        let (slot, header) = match outcome {
            ReadOutcome::NoNewFrame => return Ok(Acquired::NoNewFrame),
            ReadOutcome::Ready { slot, header } => (slot, header),
        };
        self.held = Some(slot);

        if header.payload_size > self.control.limits().slot_capacity() {
            self.release_held()?;
            return Err(ChannelError::Incompatible(format!(
                "slot {slot} claims {} bytes, capacity is {}",
                header.payload_size,
                self.control.limits().slot_capacity()
            )));
        }

        self.last_seen = header.sequence_number;
        debug!(slot, sequence = header.sequence_number, "acquired device frame");

        Ok(Acquired::Frame(AcquiredFrame {
            header,
            payload: FramePayload::Device(DeviceBuffer {
                ptr: self.slots[slot],
                len: header.payload_size as usize,
                pitch: header.width as usize * header.channels as usize,
                device_ordinal: self.memory.ordinal(),
            }),
        }))
    }

    fn backend(&self) -> Backend {
        Backend::Device
    }

    fn limits(&self) -> FrameLimits {
        self.control.limits()
    }

    fn close(&mut self) -> ChannelResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // The producer may already have unlinked the region; the mapping is still ours.
        self.release_held()?;
        for ptr in self.slots {
            self.memory.release_import(ptr)?;
        }
        self.control.close()
    }
}

impl<M: DeviceMemory> Drop for DeviceFrameConsumer<M> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(name = %self.control.name(), error = %err, "failed to detach device channel");
        }
    }
}

impl<M: DeviceMemory> std::fmt::Debug for DeviceFrameConsumer<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceFrameConsumer")
            .field("control", &self.control)
            .field("held", &self.held)
            .field("last_seen", &self.last_seen)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::emulated::{EmulatedDevice, Pool};
    use framelink_frame::SlotState;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn unique_name(tag: &str) -> String {
        format!(
            "/fldv-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .subsec_nanos()
        )
    }

    const LIMITS: FrameLimits = FrameLimits::new(16, 16, 3);

    fn pair(
        tag: &str,
    ) -> (
        Arc<Pool>,
        DeviceFrameProducer<EmulatedDevice>,
        DeviceFrameConsumer<EmulatedDevice>,
    ) {
        let pool = Pool::new();
        let name = unique_name(tag);
        let producer = DeviceFrameProducer::create_with(
            &name,
            LIMITS,
            EmulatedDevice {
                pool: Arc::clone(&pool),
            },
        )
        .unwrap();
        let consumer = DeviceFrameConsumer::from_control(
            ControlRegion::attach(&name).unwrap(),
            EmulatedDevice {
                pool: Arc::clone(&pool),
            },
        )
        .unwrap();
        (pool, producer, consumer)
    }

    fn device_frame(acquired: Acquired<'_>) -> (FrameHeader, DeviceBuffer) {
        match acquired {
            Acquired::Frame(AcquiredFrame {
                header,
                payload: FramePayload::Device(buf),
            }) => (header, buf),
            other => panic!("expected a device frame, got {other:?}"),
        }
    }

    #[test]
    fn frame_lands_in_device_memory() {
        let (pool, mut producer, mut consumer) = pair("roundtrip");
        let pixels: Vec<u8> = (0..4 * 2 * 3).map(|i| i as u8).collect();
        let seq = producer.publish(&RawFrame::new(&pixels, 4, 2, 3)).unwrap();
        assert_eq!(seq, 1);

        let (header, buf) = device_frame(consumer.acquire(Duration::from_secs(1)).unwrap());
        assert_eq!(header.sequence_number, 1);
        assert_eq!((header.width, header.height, header.channels), (4, 2, 3));
        assert_eq!(buf.len, pixels.len());
        assert_eq!(buf.pitch, 12);
        assert_eq!(buf.device_ordinal, 0);
        assert_eq!(pool.read(buf.ptr, buf.len), pixels);
    }

    #[test]
    fn held_slot_is_not_overwritten() {
        let (pool, mut producer, mut consumer) = pair("held");
        producer.publish(&RawFrame::new(&[1; 12], 2, 2, 3)).unwrap();
        let (_, first) = device_frame(consumer.acquire(Duration::from_secs(1)).unwrap());

        for value in 2..6u8 {
            producer
                .publish(&RawFrame::new(&[value; 12], 2, 2, 3))
                .unwrap();
        }
        assert_eq!(pool.read(first.ptr, 12), vec![1; 12]);

        let (header, latest) = device_frame(consumer.acquire(Duration::ZERO).unwrap());
        assert_eq!(header.sequence_number, 5);
        assert_ne!(latest.ptr, first.ptr);
        assert_eq!(pool.read(latest.ptr, 12), vec![5; 12]);
    }

    #[test]
    fn repeated_acquire_is_no_new_frame_and_keeps_hold() {
        let (_pool, mut producer, mut consumer) = pair("repeat");
        producer.publish(&RawFrame::new(&[7; 3], 1, 1, 3)).unwrap();
        device_frame(consumer.acquire(Duration::from_secs(1)).unwrap());

        assert!(!consumer.acquire(Duration::ZERO).unwrap().is_new());
        let snap = producer.control().snapshot().unwrap();
        assert_eq!(
            snap.slots.iter().filter(|s| s.state == SlotState::Reading).count(),
            1
        );
    }

    #[test]
    fn oversized_frame_is_rejected_without_copy() {
        let (pool, mut producer, _consumer) = pair("oversize");
        let pixels = vec![0u8; 17 * 16 * 3];
        assert!(matches!(
            producer.publish(&RawFrame::new(&pixels, 17, 16, 3)),
            Err(ChannelError::FrameTooLarge { .. })
        ));
        assert_eq!(pool.copies.load(Ordering::SeqCst), 0);
        assert_eq!(producer.control().snapshot().unwrap().last_sequence, 0);
    }

    #[test]
    fn failed_copy_leaves_previous_frame_current() {
        let (pool, mut producer, mut consumer) = pair("copyfail");
        producer.publish(&RawFrame::new(&[1; 3], 1, 1, 3)).unwrap();

        pool.fail_copies.store(true, Ordering::SeqCst);
        assert!(matches!(
            producer.publish(&RawFrame::new(&[2; 3], 1, 1, 3)),
            Err(ChannelError::Device(_))
        ));
        pool.fail_copies.store(false, Ordering::SeqCst);

        let (header, _) = device_frame(consumer.acquire(Duration::from_secs(1)).unwrap());
        assert_eq!(header.sequence_number, 1);
    }

    #[test]
    fn fast_producer_slow_consumer_stress() {
        const FRAMES: u64 = 10_000;
        let (pool, mut producer, mut consumer) = pair("stress");
        let done = Arc::new(AtomicBool::new(false));

        let reader = {
            let done = Arc::clone(&done);
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                let mut last = 0u64;
                let mut seen = 0u64;
                loop {
                    let finished = done.load(Ordering::Acquire);
                    match consumer.acquire(Duration::from_secs(5)).unwrap() {
                        Acquired::Frame(AcquiredFrame {
                            header,
                            payload: FramePayload::Device(buf),
                        }) => {
                            let seq = header.sequence_number;
                            assert!(seq > last, "sequence went from {last} to {seq}");
                            assert_eq!(header.timestamp_us, seq * 10);
                            assert_eq!(buf.len as u64, header.payload_size);
                            assert_eq!(buf.pitch, header.width as usize * 3);
                            let fill = (seq % 251) as u8;
                            let bytes = pool.read(buf.ptr, buf.len);
                            assert!(bytes.iter().all(|b| *b == fill), "torn read at {seq}");
                            last = seq;
                            seen += 1;
                        }
                        Acquired::Frame(other) => panic!("expected a device frame, got {other:?}"),
                        Acquired::NoNewFrame if finished => break,
                        Acquired::NoNewFrame => {}
                    }
                    std::thread::sleep(Duration::from_micros(600));
                }
                (last, seen, consumer)
            })
        };

        for seq in 1..=FRAMES {
            let width = 1 + (seq % 16) as u32;
            let pixels = vec![(seq % 251) as u8; width as usize * 16 * 3];
            let frame = RawFrame::new(&pixels, width, 16, 3).with_timestamp(seq * 10);
            assert_eq!(producer.publish(&frame).unwrap(), seq);
            std::thread::sleep(Duration::from_micros(50));
        }
        done.store(true, Ordering::Release);

        let (last, seen, mut consumer) = reader.join().unwrap();
        assert_eq!(last, FRAMES, "consumer must end on the newest frame");
        assert!(seen > 0 && seen <= FRAMES);

        consumer.close().unwrap();
        let snapshot = producer.control().snapshot().unwrap();
        assert_eq!(snapshot.last_sequence, FRAMES);
        for slot in snapshot.slots {
            assert!(
                !matches!(slot.state, SlotState::Writing | SlotState::Reading),
                "slot left in {}",
                slot.state
            );
        }
        assert_eq!(pool.live_allocations(), 2);
    }

    #[test]
    fn host_channel_is_incompatible() {
        let name = unique_name("hostback");
        let _host = framelink_shm::SharedFrameProducer::create(&name, LIMITS).unwrap();
        let err = DeviceFrameConsumer::from_control(
            ControlRegion::attach(&name).unwrap(),
            EmulatedDevice { pool: Pool::new() },
        )
        .unwrap_err();
        assert!(matches!(err, ChannelError::Incompatible(_)));
    }

    #[test]
    fn producer_drop_frees_slots_and_closes() {
        let (pool, producer, mut consumer) = pair("drop");
        assert_eq!(pool.live_allocations(), 2);
        drop(producer);
        assert_eq!(pool.live_allocations(), 0);
        assert!(matches!(
            consumer.acquire(Duration::from_millis(50)),
            Err(ChannelError::ChannelClosed)
        ));
    }

    #[test]
    fn cuda_producer_without_device_is_unavailable() {
        if crate::probe_device().available() {
            return;
        }
        let err = DeviceFrameProducer::create(&unique_name("nocuda"), LIMITS, 0).unwrap_err();
        assert!(matches!(err, ChannelError::DeviceUnavailable(_)));
    }
}
