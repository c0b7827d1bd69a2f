//! Device allocations and IPC handles behind a small trait.

use std::ffi::{c_char, c_void};

use framelink_frame::{ChannelError, ChannelResult};
use framelink_shm::DEVICE_HANDLE_SIZE;
use tracing::{debug, warn};

use crate::driver::{
    self, CuContext, CuDevice, CuIpcMemHandle, CudaApi, CU_IPC_MEM_LAZY_ENABLE_PEER_ACCESS,
};

/// A device virtual address.
pub type DevicePtr = u64;

/// The device operations the frame channel needs.
///
/// [`CudaDevice`] is the real implementation; tests substitute host memory.
pub trait DeviceMemory: Send {
    fn ordinal(&self) -> i32;

    fn alloc(&mut self, bytes: usize) -> ChannelResult<DevicePtr>;

    fn free(&mut self, ptr: DevicePtr) -> ChannelResult<()>;

    /// Copy `src` to `dst` and wait until the copy is visible to other processes.
    fn copy_from_host(&mut self, dst: DevicePtr, src: &[u8]) -> ChannelResult<()>;

    /// Export an allocation made by `alloc` for another process.
    fn export(&mut self, ptr: DevicePtr) -> ChannelResult<[u8; DEVICE_HANDLE_SIZE]>;

    /// Map an allocation exported by another process.
    fn import(&mut self, handle: &[u8; DEVICE_HANDLE_SIZE]) -> ChannelResult<DevicePtr>;

    fn release_import(&mut self, ptr: DevicePtr) -> ChannelResult<()>;
}

/// One CUDA device through its primary context.
pub struct CudaDevice {
    api: &'static CudaApi,
    device: CuDevice,
    ctx: CuContext,
    ordinal: i32,
}

// SAFETY: the primary context may be made current on any thread, and every
// call below makes it current first.
unsafe impl Send for CudaDevice {}

impl CudaDevice {
    /// Open device `ordinal`.
    ///
    /// `DeviceUnavailable` when the driver is missing, fails to initialize, or
    /// has no device with that ordinal.
    pub fn open(ordinal: i32) -> ChannelResult<Self> {
        let count = driver::device_count()?;
        if ordinal < 0 || ordinal as u32 >= count {
            return Err(ChannelError::DeviceUnavailable(format!(
                "device {ordinal} requested, driver reports {count}"
            )));
        }
        let api = driver::api()?;

        let mut device: CuDevice = 0;
        // SAFETY: valid out-pointer; ordinal checked against the device count.
        let rc = unsafe { (api.cu_device_get)(&mut device, ordinal) };
        driver::check(api, rc, "cuDeviceGet").map_err(unavailable)?;

        let mut ctx: CuContext = std::ptr::null_mut();
        // SAFETY: valid out-pointer and device handle.
        let rc = unsafe { (api.cu_primary_ctx_retain)(&mut ctx, device) };
        driver::check(api, rc, "cuDevicePrimaryCtxRetain").map_err(unavailable)?;

        debug!(ordinal, "opened CUDA device");
        Ok(Self {
            api,
            device,
            ctx,
            ordinal,
        })
    }

    fn make_current(&self) -> ChannelResult<()> {
        // SAFETY: `ctx` is a retained primary context.
        let rc = unsafe { (self.api.cu_ctx_set_current)(self.ctx) };
        driver::check(self.api, rc, "cuCtxSetCurrent")
    }
}

fn unavailable(err: ChannelError) -> ChannelError {
    match err {
        ChannelError::Device(msg) => ChannelError::DeviceUnavailable(msg),
        other => other,
    }
}

impl DeviceMemory for CudaDevice {
    fn ordinal(&self) -> i32 {
        self.ordinal
    }

    fn alloc(&mut self, bytes: usize) -> ChannelResult<DevicePtr> {
        self.make_current()?;
        let mut ptr: DevicePtr = 0;
        // SAFETY: valid out-pointer with the context current.
        let rc = unsafe { (self.api.cu_mem_alloc)(&mut ptr, bytes.max(1)) };
        driver::check(self.api, rc, "cuMemAlloc")?;
        Ok(ptr)
    }

    fn free(&mut self, ptr: DevicePtr) -> ChannelResult<()> {
        self.make_current()?;
        // SAFETY: `ptr` came from `alloc` and is freed once.
        let rc = unsafe { (self.api.cu_mem_free)(ptr) };
        driver::check(self.api, rc, "cuMemFree")
    }

    fn copy_from_host(&mut self, dst: DevicePtr, src: &[u8]) -> ChannelResult<()> {
        if src.is_empty() {
            return Ok(());
        }
        self.make_current()?;
        // SAFETY: `dst` is an allocation of at least `src.len()` bytes; the
        // caller checks the frame against the slot capacity.
        let rc = unsafe {
            (self.api.cu_memcpy_htod)(dst, src.as_ptr().cast::<c_void>(), src.len())
        };
        driver::check(self.api, rc, "cuMemcpyHtoD")?;
        // SAFETY: no arguments; the context is current.
        let rc = unsafe { (self.api.cu_ctx_synchronize)() };
        driver::check(self.api, rc, "cuCtxSynchronize")
    }

    fn export(&mut self, ptr: DevicePtr) -> ChannelResult<[u8; DEVICE_HANDLE_SIZE]> {
        self.make_current()?;
        let mut handle = CuIpcMemHandle { reserved: [0; 64] };
        // SAFETY: valid out-pointer; `ptr` is the base of an allocation.
        let rc = unsafe { (self.api.cu_ipc_get_mem_handle)(&mut handle, ptr) };
        driver::check(self.api, rc, "cuIpcGetMemHandle")?;
        Ok(handle.reserved.map(|b| b as u8))
    }

    fn import(&mut self, handle: &[u8; DEVICE_HANDLE_SIZE]) -> ChannelResult<DevicePtr> {
        self.make_current()?;
        let handle = CuIpcMemHandle {
            reserved: handle.map(|b| b as c_char),
        };
        let mut ptr: DevicePtr = 0;
        // SAFETY: valid out-pointer; the handle bytes come from `export` in the producer.
        let rc = unsafe {
            (self.api.cu_ipc_open_mem_handle)(&mut ptr, handle, CU_IPC_MEM_LAZY_ENABLE_PEER_ACCESS)
        };
        driver::check(self.api, rc, "cuIpcOpenMemHandle")?;
        Ok(ptr)
    }

    fn release_import(&mut self, ptr: DevicePtr) -> ChannelResult<()> {
        self.make_current()?;
        // SAFETY: `ptr` came from `import` and is closed once.
        let rc = unsafe { (self.api.cu_ipc_close_mem_handle)(ptr) };
        driver::check(self.api, rc, "cuIpcCloseMemHandle")
    }
}

impl Drop for CudaDevice {
    fn drop(&mut self) {
        // SAFETY: the context was retained in `open` and is released once.
        let rc = unsafe { (self.api.cu_primary_ctx_release)(self.device) };
        if let Err(err) = driver::check(self.api, rc, "cuDevicePrimaryCtxRelease") {
            warn!(ordinal = self.ordinal, error = %err, "failed to release CUDA context");
        }
    }
}

impl std::fmt::Debug for CudaDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaDevice")
            .field("ordinal", &self.ordinal)
            .finish()
    }
}
