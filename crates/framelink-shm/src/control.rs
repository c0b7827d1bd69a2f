//! The control block at offset 0 of every channel region, and the slot
//! protocol built on it.

use std::cell::{Cell, UnsafeCell};
use std::io;
use std::mem::size_of;
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use framelink_frame::{ChannelError, ChannelResult, FrameHeader, FrameLimits, SlotState};
use tracing::{debug, info, warn};

use crate::region::{normalize_name, pid_alive, ShmRegion};
use crate::sync::{RawSync, SyncGuard};

/// Slots per channel.
pub const SLOT_COUNT: usize = 2;

/// Bytes reserved per slot for an exported device memory handle.
pub const DEVICE_HANDLE_SIZE: usize = 64;

const MAGIC: u64 = u64::from_le_bytes(*b"FLNKCTL1");
const LAYOUT_VERSION: u32 = 1;
const NO_SLOT: u32 = u32::MAX;
const PAGE_SIZE: usize = 4096;

/// Longest a first-frame wait sleeps before re-checking producer liveness.
const LIVENESS_SLICE: Duration = Duration::from_millis(100);

const EMPTY: u32 = SlotState::Empty as u32;
const WRITING: u32 = SlotState::Writing as u32;
const READY: u32 = SlotState::Ready as u32;
const READING: u32 = SlotState::Reading as u32;

/// Where slot payloads live.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// In the region itself, after the control block.
    Host = 0,
    /// In device memory; the region carries exported handles only.
    Device = 1,
}

impl Backing {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Host),
            1 => Some(Self::Device),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Device => "device",
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SlotHeader {
    state: u32,
    width: u32,
    height: u32,
    channels: u32,
    sequence: u64,
    timestamp_us: u64,
    payload_size: u64,
}

impl SlotHeader {
    const EMPTY: Self = Self {
        state: EMPTY,
        width: 0,
        height: 0,
        channels: 0,
        sequence: 0,
        timestamp_us: 0,
        payload_size: 0,
    };

    fn frame_header(&self) -> FrameHeader {
        FrameHeader {
            sequence_number: self.sequence,
            timestamp_us: self.timestamp_us,
            width: self.width,
            height: self.height,
            channels: self.channels,
            payload_size: self.payload_size,
        }
    }
}

/// State touched only while holding the mutex.
#[repr(C)]
struct Guarded {
    last_sequence: u64,
    latest_ready: u32,
    _reserved: u32,
    slots: [SlotHeader; SLOT_COUNT],
}

#[repr(C)]
struct ControlBlock {
    /// Stored last during initialization; attach ignores a region without it.
    magic: AtomicU64,
    version: u32,
    slot_count: u32,
    max_width: u32,
    max_height: u32,
    max_channels: u32,
    backing: u32,
    slot_capacity: u64,
    payload_offset: u64,
    region_size: u64,
    owner_pid: AtomicI32,
    closed: AtomicU32,
    device_ordinal: i32,
    _reserved: u32,
    device_handles: [[u8; DEVICE_HANDLE_SIZE]; SLOT_COUNT],
    sync: RawSync,
    guarded: UnsafeCell<Guarded>,
}

/// What a producer records in a new region.
#[derive(Debug, Clone)]
pub struct ControlInit {
    pub limits: FrameLimits,
    pub backing: Backing,
    pub device_ordinal: i32,
    pub device_handles: [[u8; DEVICE_HANDLE_SIZE]; SLOT_COUNT],
}

impl ControlInit {
    /// Payloads stored in the region.
    pub fn host(limits: FrameLimits) -> Self {
        Self {
            limits,
            backing: Backing::Host,
            device_ordinal: -1,
            device_handles: [[0; DEVICE_HANDLE_SIZE]; SLOT_COUNT],
        }
    }

    /// Payloads in two device allocations, exported as IPC handles.
    pub fn device(
        limits: FrameLimits,
        device_ordinal: i32,
        device_handles: [[u8; DEVICE_HANDLE_SIZE]; SLOT_COUNT],
    ) -> Self {
        Self {
            limits,
            backing: Backing::Device,
            device_ordinal,
            device_handles,
        }
    }
}

/// Result of [`ControlRegion::begin_read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `slot` is now `Reading` and belongs to the consumer until `end_read`.
    Ready { slot: usize, header: FrameHeader },
    NoNewFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub state: SlotState,
    pub header: FrameHeader,
}

/// Consistent copy of the control block, taken under the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlSnapshot {
    pub name: String,
    pub limits: FrameLimits,
    pub backing: Backing,
    pub owner_pid: i32,
    pub owner_alive: bool,
    pub closed: bool,
    pub region_size: u64,
    pub last_sequence: u64,
    pub latest_ready: Option<usize>,
    pub slots: [SlotSnapshot; SLOT_COUNT],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Producer,
    Consumer,
}

/// One end's mapping of a channel region.
///
/// Producers [`create`](Self::create), everyone else [`attach`](Self::attach)es.
pub struct ControlRegion {
    region: ShmRegion,
    role: Role,
    closed: bool,
    peer_died: Cell<bool>,
}

impl std::fmt::Debug for ControlRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlRegion")
            .field("name", &self.region.name())
            .field("role", &self.role)
            .field("backing", &self.backing())
            .field("limits", &self.limits())
            .finish()
    }
}

impl ControlRegion {
    /// Create and initialize the named region.
    ///
    /// A region still owned by a live producer yields `ChannelAlreadyExists`.
    /// One left behind by a dead or closed producer is unlinked and
    /// recreated.
    pub fn create(name: &str, init: ControlInit) -> ChannelResult<Self> {
        let name = normalize_name(name)?;
        let (payload_offset, region_size) = layout(&init)?;

        let mut reclaimed = false;
        loop {
            match ShmRegion::create(&name, region_size) {
                Ok(region) => {
                    // SAFETY: the region is freshly created, zeroed, exclusively ours
                    // and at least `size_of::<ControlBlock>()` bytes long.
                    let initialized =
                        unsafe { initialize(&region, &init, payload_offset, region_size) };
                    if let Err(err) = initialized {
                        drop(region);
                        let _ = ShmRegion::unlink(&name);
                        return Err(err);
                    }
                    info!(
                        name = %name,
                        limits = %init.limits,
                        backing = init.backing.as_str(),
                        region_size,
                        "created frame channel"
                    );
                    return Ok(Self {
                        region,
                        role: Role::Producer,
                        closed: false,
                        peer_died: Cell::new(false),
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists && !reclaimed => {
                    if let Some(owner_pid) = live_owner(&name) {
                        return Err(ChannelError::ChannelAlreadyExists { name, owner_pid });
                    }
                    warn!(name = %name, "removing stale channel region left by a dead producer");
                    ShmRegion::unlink(&name)?;
                    reclaimed = true;
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    let owner_pid = live_owner(&name).unwrap_or(0);
                    return Err(ChannelError::ChannelAlreadyExists { name, owner_pid });
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Map an existing region created by a live producer.
    pub fn attach(name: &str) -> ChannelResult<Self> {
        let name = normalize_name(name)?;
        let not_found = || ChannelError::ChannelNotFound { name: name.clone() };

        let region = match ShmRegion::open(&name) {
            Ok(region) => region,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::UnexpectedEof
                ) =>
            {
                return Err(not_found());
            }
            Err(err) => return Err(err.into()),
        };
        if region.len() < size_of::<ControlBlock>() {
            return Err(not_found());
        }

        let this = Self {
            region,
            role: Role::Consumer,
            closed: false,
            peer_died: Cell::new(false),
        };
        let block = this.block();
        if block.magic.load(Ordering::Acquire) != MAGIC {
            debug!(name = %name, "region exists but is not initialized");
            return Err(not_found());
        }
        if block.version != LAYOUT_VERSION || block.slot_count as usize != SLOT_COUNT {
            return Err(ChannelError::Incompatible(format!(
                "layout version {} with {} slots, expected version {LAYOUT_VERSION} with {SLOT_COUNT}",
                block.version, block.slot_count
            )));
        }
        this.validate_layout()?;
        if block.closed.load(Ordering::Acquire) != 0 {
            return Err(not_found());
        }
        let owner_pid = block.owner_pid.load(Ordering::Acquire);
        if !pid_alive(owner_pid) {
            debug!(name = %name, owner_pid, "region owner is gone");
            return Err(not_found());
        }

        info!(name = %name, owner_pid, backing = this.backing().as_str(), "attached to frame channel");
        Ok(this)
    }

    fn validate_layout(&self) -> ChannelResult<()> {
        let block = self.block();
        let backing = Backing::from_raw(block.backing).ok_or_else(|| {
            ChannelError::Incompatible(format!("unknown backing kind {}", block.backing))
        })?;
        let init = ControlInit {
            backing,
            ..ControlInit::host(self.limits())
        };
        let (payload_offset, region_size) = layout(&init)?;
        if block.slot_capacity != self.limits().slot_capacity()
            || block.payload_offset != payload_offset as u64
            || block.region_size != region_size as u64
            || self.region.len() < region_size
        {
            return Err(ChannelError::Incompatible(format!(
                "region of {} bytes does not match its recorded layout",
                self.region.len()
            )));
        }
        Ok(())
    }

    fn block(&self) -> &ControlBlock {
        // SAFETY: the mapping is page-aligned and at least `size_of::<ControlBlock>()`
        // bytes (checked on create and attach). Fields written after publication are
        // atomics or inside `UnsafeCell`.
        unsafe { &*self.region.as_ptr().cast::<ControlBlock>() }
    }

    fn lock(&self) -> ChannelResult<SyncGuard<'_>> {
        let mut guard = self.block().sync.lock()?;
        if guard.owner_died() {
            match self.role {
                Role::Consumer => {
                    warn!(name = %self.name(), "producer died holding the channel lock");
                    self.peer_died.set(true);
                }
                Role::Producer => {
                    warn!(name = %self.name(), "consumer died holding the channel lock");
                    release_stale_reads(self.state(&mut guard));
                }
            }
        }
        Ok(guard)
    }

    fn state<'g>(&'g self, _guard: &'g mut SyncGuard<'_>) -> &'g mut Guarded {
        // SAFETY: the guard proves this thread holds the process-shared mutex.
        unsafe { &mut *self.block().guarded.get() }
    }

    /// Producer: claim a write target and mark it `Writing`.
    ///
    /// The target is never the slot being read; when both are free, the slot
    /// that is not the latest ready one is preferred, so an unread frame is
    /// only overwritten when the consumer holds the other slot.
    pub fn begin_write(&self) -> ChannelResult<usize> {
        let mut guard = self.lock()?;
        let st = self.state(&mut guard);
        let slot = (0..SLOT_COUNT)
            .filter(|i| st.slots[*i].state != READING)
            .min_by_key(|i| *i as u32 == st.latest_ready)
            .ok_or_else(|| ChannelError::Incompatible("both slots are marked reading".into()))?;
        st.slots[slot].state = WRITING;
        Ok(slot)
    }

    /// Producer: publish a filled slot and return its sequence number.
    pub fn commit_write(&self, slot: usize, frame: &FrameHeader) -> ChannelResult<u64> {
        let mut guard = self.lock()?;
        let st = self.state(&mut guard);
        st.last_sequence += 1;
        let sequence = st.last_sequence;
        st.slots[slot] = SlotHeader {
            state: READY,
            width: frame.width,
            height: frame.height,
            channels: frame.channels,
            sequence,
            timestamp_us: frame.timestamp_us,
            payload_size: frame.payload_size,
        };
        st.latest_ready = slot as u32;
        self.block().sync.notify_all();
        drop(guard);
        debug!(slot, sequence, "published frame");
        Ok(sequence)
    }

    /// Producer: give up a claimed slot whose payload may be half written.
    pub fn abort_write(&self, slot: usize) -> ChannelResult<()> {
        let mut guard = self.lock()?;
        let st = self.state(&mut guard);
        st.slots[slot] = SlotHeader::EMPTY;
        if st.latest_ready == slot as u32 {
            st.latest_ready = NO_SLOT;
        }
        Ok(())
    }

    /// Consumer: claim the newest ready slot if it is newer than `last_seen`.
    ///
    /// Waits up to `timeout` only while nothing was ever published.
    pub fn begin_read(&self, last_seen: u64, timeout: Duration) -> ChannelResult<ReadOutcome> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock()?;
        loop {
            self.check_peer()?;
            if self.state(&mut guard).last_sequence != 0 {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ChannelError::Timeout(timeout));
            }
            guard.wait(remaining.min(LIVENESS_SLICE))?;
            if guard.owner_died() {
                self.peer_died.set(true);
            }
        }

        let st = self.state(&mut guard);
        let Some(slot) = index(st.latest_ready) else {
            return Ok(ReadOutcome::NoNewFrame);
        };
        let header = st.slots[slot];
        if header.state != READY || header.sequence <= last_seen {
            return Ok(ReadOutcome::NoNewFrame);
        }
        st.slots[slot].state = READING;
        Ok(ReadOutcome::Ready {
            slot,
            header: header.frame_header(),
        })
    }

    /// Consumer: hand a slot claimed by `begin_read` back as `Ready`.
    pub fn end_read(&self, slot: usize) -> ChannelResult<()> {
        let mut guard = self.lock()?;
        let st = self.state(&mut guard);
        if st.slots[slot].state == READING {
            st.slots[slot].state = READY;
        }
        Ok(())
    }

    /// Consumer: trade the held `Reading` slot for a newer frame, if any.
    ///
    /// Both changes happen under one lock, so the producer always has a
    /// slot to write. On `NoNewFrame` the held slot stays `Reading`.
    pub fn advance_read(&self, held: usize, last_seen: u64) -> ChannelResult<ReadOutcome> {
        let mut guard = self.lock()?;
        self.check_peer()?;
        let st = self.state(&mut guard);
        let Some(slot) = index(st.latest_ready).filter(|slot| *slot != held) else {
            return Ok(ReadOutcome::NoNewFrame);
        };
        let header = st.slots[slot];
        if header.state != READY || header.sequence <= last_seen {
            return Ok(ReadOutcome::NoNewFrame);
        }
        st.slots[slot].state = READING;
        if st.slots[held].state == READING {
            st.slots[held].state = READY;
        }
        Ok(ReadOutcome::Ready {
            slot,
            header: header.frame_header(),
        })
    }

    /// Consumer: release reads left behind by a previous consumer process.
    pub fn release_stale_reads(&self) -> ChannelResult<()> {
        let mut guard = self.lock()?;
        release_stale_reads(self.state(&mut guard));
        Ok(())
    }

    fn check_peer(&self) -> ChannelResult<()> {
        let block = self.block();
        if block.closed.load(Ordering::Acquire) != 0 {
            return Err(ChannelError::ChannelClosed);
        }
        if self.peer_died.get() {
            return Err(ChannelError::PeerGone(
                "producer died while holding the channel lock".into(),
            ));
        }
        let owner_pid = block.owner_pid.load(Ordering::Acquire);
        if !pid_alive(owner_pid) {
            return Err(ChannelError::PeerGone(format!(
                "producer process {owner_pid} exited without closing the channel"
            )));
        }
        Ok(())
    }

    /// Copy of the whole control state.
    pub fn snapshot(&self) -> ChannelResult<ControlSnapshot> {
        let block = self.block();
        let mut guard = self.lock()?;
        let st = self.state(&mut guard);
        let slot = |i: usize| -> ChannelResult<SlotSnapshot> {
            let raw = st.slots[i];
            let state = SlotState::from_raw(raw.state).ok_or_else(|| {
                ChannelError::Incompatible(format!("slot {i} has unknown state {}", raw.state))
            })?;
            Ok(SlotSnapshot {
                state,
                header: raw.frame_header(),
            })
        };
        let slots = [slot(0)?, slot(1)?];
        let owner_pid = block.owner_pid.load(Ordering::Acquire);
        Ok(ControlSnapshot {
            name: self.name().to_string(),
            limits: self.limits(),
            backing: self.backing(),
            owner_pid,
            owner_alive: pid_alive(owner_pid),
            closed: block.closed.load(Ordering::Acquire) != 0,
            region_size: block.region_size,
            last_sequence: st.last_sequence,
            latest_ready: index(st.latest_ready),
            slots,
        })
    }

    /// Payload bytes of a host-backed slot.
    ///
    /// # Safety
    /// The caller must own `slot` through the slot protocol (`Writing` for
    /// the producer, `Reading` for the consumer), and the region must be
    /// host-backed.
    pub(crate) unsafe fn slot_payload(&self, slot: usize, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.payload_ptr(slot), len)
    }

    /// # Safety
    /// As for [`slot_payload`](Self::slot_payload), and only the producer
    /// writes.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slot_payload_mut(&self, slot: usize, len: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.payload_ptr(slot), len)
    }

    fn payload_ptr(&self, slot: usize) -> *mut u8 {
        debug_assert_eq!(self.backing(), Backing::Host);
        debug_assert!(slot < SLOT_COUNT);
        let block = self.block();
        let offset = block.payload_offset as usize + slot * block.slot_capacity as usize;
        // SAFETY: `validate_layout`/`layout` guarantee both slots lie inside the mapping.
        unsafe { self.region.as_ptr().add(offset) }
    }

    /// Exported device handle of `slot` (device backing only).
    pub fn device_handle(&self, slot: usize) -> [u8; DEVICE_HANDLE_SIZE] {
        self.block().device_handles[slot]
    }

    pub fn device_ordinal(&self) -> i32 {
        self.block().device_ordinal
    }

    pub fn limits(&self) -> FrameLimits {
        let block = self.block();
        FrameLimits::new(block.max_width, block.max_height, block.max_channels)
    }

    pub fn backing(&self) -> Backing {
        Backing::from_raw(self.block().backing).unwrap_or(Backing::Host)
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn owner_pid(&self) -> i32 {
        self.block().owner_pid.load(Ordering::Acquire)
    }

    pub fn is_producer(&self) -> bool {
        self.role == Role::Producer
    }

    /// Producer: mark the channel closed, wake waiters and unlink the name.
    ///
    /// The consumer keeps its mapping and observes `ChannelClosed`.
    /// Consumers just detach. Idempotent.
    pub fn close(&mut self) -> ChannelResult<()> {
        if self.closed || self.role != Role::Producer {
            self.closed = true;
            return Ok(());
        }
        self.closed = true;
        {
            let _guard = self.lock()?;
            self.block().closed.store(1, Ordering::Release);
            self.block().sync.notify_all();
        }
        ShmRegion::unlink(self.name())?;
        info!(name = %self.name(), "closed frame channel");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_owner_pid(&self, pid: i32) {
        self.block().owner_pid.store(pid, Ordering::Release);
    }
}

impl Drop for ControlRegion {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(name = %self.name(), error = %err, "failed to close frame channel");
        }
    }
}

fn index(raw: u32) -> Option<usize> {
    let slot = raw as usize;
    (slot < SLOT_COUNT).then_some(slot)
}

fn release_stale_reads(st: &mut Guarded) {
    for slot in st.slots.iter_mut().filter(|s| s.state == READING) {
        slot.state = READY;
    }
}

/// `(payload_offset, region_size)` for a region with these settings.
fn layout(init: &ControlInit) -> ChannelResult<(usize, usize)> {
    let payload_offset = size_of::<ControlBlock>().div_ceil(PAGE_SIZE) * PAGE_SIZE;
    let payload_bytes = match init.backing {
        Backing::Host => usize::try_from(init.limits.slot_capacity())
            .ok()
            .and_then(|capacity| capacity.checked_mul(SLOT_COUNT)),
        Backing::Device => Some(0),
    };
    let region_size = payload_bytes
        .and_then(|bytes| bytes.checked_add(payload_offset))
        .ok_or_else(|| {
            ChannelError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame limits {} exceed addressable memory", init.limits),
            ))
        })?;
    Ok((payload_offset, region_size))
}

/// Fill in a fresh control block and publish it by storing the magic.
///
/// # Safety
/// `region` must be newly created, zero-filled, at least `region_size`
/// bytes, and not yet visible to any other mapping user.
unsafe fn initialize(
    region: &ShmRegion,
    init: &ControlInit,
    payload_offset: usize,
    region_size: usize,
) -> ChannelResult<()> {
    let block = region.as_ptr().cast::<ControlBlock>();
    addr_of_mut!((*block).version).write(LAYOUT_VERSION);
    addr_of_mut!((*block).slot_count).write(SLOT_COUNT as u32);
    addr_of_mut!((*block).max_width).write(init.limits.max_width);
    addr_of_mut!((*block).max_height).write(init.limits.max_height);
    addr_of_mut!((*block).max_channels).write(init.limits.max_channels);
    addr_of_mut!((*block).backing).write(init.backing as u32);
    addr_of_mut!((*block).slot_capacity).write(init.limits.slot_capacity());
    addr_of_mut!((*block).payload_offset).write(payload_offset as u64);
    addr_of_mut!((*block).region_size).write(region_size as u64);
    addr_of_mut!((*block).owner_pid).write(AtomicI32::new(std::process::id() as i32));
    addr_of_mut!((*block).closed).write(AtomicU32::new(0));
    addr_of_mut!((*block).device_ordinal).write(init.device_ordinal);
    addr_of_mut!((*block).device_handles).write(init.device_handles);
    addr_of_mut!((*block).guarded).write(UnsafeCell::new(Guarded {
        last_sequence: 0,
        latest_ready: NO_SLOT,
        _reserved: 0,
        slots: [SlotHeader::EMPTY; SLOT_COUNT],
    }));
    RawSync::init(addr_of_mut!((*block).sync))?;
    (*block).magic.store(MAGIC, Ordering::Release);
    Ok(())
}

/// Pid of the live producer owning an existing region, if any.
fn live_owner(name: &str) -> Option<i32> {
    let region = ShmRegion::open(name).ok()?;
    if region.len() < size_of::<ControlBlock>() {
        return None;
    }
    // SAFETY: the mapping is page-aligned and large enough for the block.
    let block = unsafe { &*region.as_ptr().cast::<ControlBlock>() };
    if block.magic.load(Ordering::Acquire) != MAGIC || block.closed.load(Ordering::Acquire) != 0 {
        return None;
    }
    let pid = block.owner_pid.load(Ordering::Acquire);
    pid_alive(pid).then_some(pid)
}
