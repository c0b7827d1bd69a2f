//! CUDA driver entry points resolved with `dlopen`/`dlsym`.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr, CString};
use std::sync::OnceLock;

use framelink_frame::{ChannelError, ChannelResult};
use tracing::debug;

pub(crate) type CuResult = c_int;
pub(crate) type CuDevice = c_int;
pub(crate) type CuContext = *mut c_void;
pub(crate) type CuDevicePtr = u64;

pub(crate) const CUDA_SUCCESS: CuResult = 0;
pub(crate) const CU_IPC_MEM_LAZY_ENABLE_PEER_ACCESS: c_uint = 1;

/// `CUipcMemHandle`: 64 opaque bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct CuIpcMemHandle {
    pub reserved: [c_char; 64],
}

pub(crate) struct CudaApi {
    pub cu_init: unsafe extern "C" fn(c_uint) -> CuResult,
    pub cu_device_get_count: unsafe extern "C" fn(*mut c_int) -> CuResult,
    pub cu_device_get: unsafe extern "C" fn(*mut CuDevice, c_int) -> CuResult,
    pub cu_primary_ctx_retain: unsafe extern "C" fn(*mut CuContext, CuDevice) -> CuResult,
    pub cu_primary_ctx_release: unsafe extern "C" fn(CuDevice) -> CuResult,
    pub cu_ctx_set_current: unsafe extern "C" fn(CuContext) -> CuResult,
    pub cu_ctx_synchronize: unsafe extern "C" fn() -> CuResult,
    pub cu_mem_alloc: unsafe extern "C" fn(*mut CuDevicePtr, usize) -> CuResult,
    pub cu_mem_free: unsafe extern "C" fn(CuDevicePtr) -> CuResult,
    pub cu_memcpy_htod: unsafe extern "C" fn(CuDevicePtr, *const c_void, usize) -> CuResult,
    pub cu_ipc_get_mem_handle: unsafe extern "C" fn(*mut CuIpcMemHandle, CuDevicePtr) -> CuResult,
    pub cu_ipc_open_mem_handle:
        unsafe extern "C" fn(*mut CuDevicePtr, CuIpcMemHandle, c_uint) -> CuResult,
    pub cu_ipc_close_mem_handle: unsafe extern "C" fn(CuDevicePtr) -> CuResult,
    pub cu_get_error_name: unsafe extern "C" fn(CuResult, *mut *const c_char) -> CuResult,
}

static CUDA_API: OnceLock<Result<CudaApi, String>> = OnceLock::new();

fn last_dl_error(fallback: &str) -> String {
    // SAFETY: dlerror returns a thread-local C string or null.
    unsafe {
        let p = libc::dlerror();
        if p.is_null() {
            fallback.to_string()
        } else {
            CStr::from_ptr(p).to_string_lossy().into_owned()
        }
    }
}

/// Resolve the first of `names` the library exports.
fn load_symbol<T: Copy>(handle: *mut c_void, names: &[&'static str]) -> Result<T, String> {
    debug_assert_eq!(std::mem::size_of::<T>(), std::mem::size_of::<*mut c_void>());
    for name in names {
        let cname = CString::new(*name).map_err(|_| format!("invalid CUDA symbol name: {name}"))?;
        // SAFETY: handle is a live dlopen handle and cname is NUL-terminated.
        let ptr = unsafe { libc::dlsym(handle, cname.as_ptr()) };
        if !ptr.is_null() {
            // SAFETY: the symbol is the driver function whose signature `T` declares.
            return Ok(unsafe { std::mem::transmute_copy(&ptr) });
        }
    }
    Err(format!(
        "dlsym({}) failed: {}",
        names.join("|"),
        last_dl_error("unknown dlsym error")
    ))
}

fn load_api() -> Result<CudaApi, String> {
    let mut handle = std::ptr::null_mut();
    let mut last_err = String::from("unknown dlopen error");
    for candidate in ["libcuda.so.1", "libcuda.so"] {
        let soname =
            CString::new(candidate).map_err(|_| format!("invalid CUDA soname: {candidate}"))?;
        // SAFETY: valid soname and dlopen flags.
        handle = unsafe { libc::dlopen(soname.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL) };
        if !handle.is_null() {
            debug!(soname = candidate, "loaded CUDA driver");
            break;
        }
        last_err = last_dl_error("unknown dlopen error");
    }
    if handle.is_null() {
        return Err(format!("dlopen(libcuda.so.1|libcuda.so) failed: {last_err}"));
    }

    Ok(CudaApi {
        cu_init: load_symbol(handle, &["cuInit"])?,
        cu_device_get_count: load_symbol(handle, &["cuDeviceGetCount"])?,
        cu_device_get: load_symbol(handle, &["cuDeviceGet"])?,
        cu_primary_ctx_retain: load_symbol(handle, &["cuDevicePrimaryCtxRetain"])?,
        cu_primary_ctx_release: load_symbol(
            handle,
            &["cuDevicePrimaryCtxRelease_v2", "cuDevicePrimaryCtxRelease"],
        )?,
        cu_ctx_set_current: load_symbol(handle, &["cuCtxSetCurrent"])?,
        cu_ctx_synchronize: load_symbol(handle, &["cuCtxSynchronize"])?,
        cu_mem_alloc: load_symbol(handle, &["cuMemAlloc_v2"])?,
        cu_mem_free: load_symbol(handle, &["cuMemFree_v2"])?,
        cu_memcpy_htod: load_symbol(handle, &["cuMemcpyHtoD_v2"])?,
        cu_ipc_get_mem_handle: load_symbol(handle, &["cuIpcGetMemHandle"])?,
        cu_ipc_open_mem_handle: load_symbol(
            handle,
            &["cuIpcOpenMemHandle_v2", "cuIpcOpenMemHandle"],
        )?,
        cu_ipc_close_mem_handle: load_symbol(handle, &["cuIpcCloseMemHandle"])?,
        cu_get_error_name: load_symbol(handle, &["cuGetErrorName"])?,
    })
}

/// The loaded driver, or `DeviceUnavailable` with the reason it could not load.
pub(crate) fn api() -> ChannelResult<&'static CudaApi> {
    CUDA_API
        .get_or_init(load_api)
        .as_ref()
        .map_err(|err| ChannelError::DeviceUnavailable(err.clone()))
}

pub(crate) fn error_name(api: &CudaApi, rc: CuResult) -> String {
    let mut name: *const c_char = std::ptr::null();
    // SAFETY: `name` is a valid out-pointer; the driver returns a static string.
    let ok = unsafe { (api.cu_get_error_name)(rc, &mut name) } == CUDA_SUCCESS;
    if ok && !name.is_null() {
        // SAFETY: non-null static C string from the driver.
        unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned()
    } else {
        format!("CUresult {rc}")
    }
}

/// Map a driver status to `ChannelError::Device`.
pub(crate) fn check(api: &CudaApi, rc: CuResult, call: &str) -> ChannelResult<()> {
    if rc == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(ChannelError::Device(format!(
            "{call} failed: {}",
            error_name(api, rc)
        )))
    }
}

/// Outcome of probing for a usable device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProbe {
    pub device_count: u32,
    /// Why no device is usable, when `device_count` is 0.
    pub reason: Option<String>,
}

impl DeviceProbe {
    pub fn available(&self) -> bool {
        self.device_count > 0
    }
}

/// Load the driver, initialize it and count devices.
///
/// Never allocates device memory.
pub fn probe_device() -> DeviceProbe {
    match device_count() {
        Ok(0) => DeviceProbe {
            device_count: 0,
            reason: Some("driver reports no devices".to_string()),
        },
        Ok(count) => DeviceProbe {
            device_count: count,
            reason: None,
        },
        Err(err) => DeviceProbe {
            device_count: 0,
            reason: Some(err.to_string()),
        },
    }
}

pub(crate) fn device_count() -> ChannelResult<u32> {
    let api = api()?;
    // SAFETY: cuInit takes flags only.
    let rc = unsafe { (api.cu_init)(0) };
    if rc != CUDA_SUCCESS {
        return Err(ChannelError::DeviceUnavailable(format!(
            "cuInit failed: {}",
            error_name(api, rc)
        )));
    }
    let mut count: c_int = 0;
    // SAFETY: `count` is a valid out-pointer.
    let rc = unsafe { (api.cu_device_get_count)(&mut count) };
    if rc != CUDA_SUCCESS {
        return Err(ChannelError::DeviceUnavailable(format!(
            "cuDeviceGetCount failed: {}",
            error_name(api, rc)
        )));
    }
    Ok(count.max(0) as u32)
}
