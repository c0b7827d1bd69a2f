use std::ffi::CString;
use std::io;
use std::ptr::NonNull;

use framelink_frame::ChannelError;
use tracing::debug;

/// Longest shared-memory name accepted, leading slash included.
#[cfg(target_os = "linux")]
const MAX_NAME_LEN: usize = 255;
#[cfg(not(target_os = "linux"))]
const MAX_NAME_LEN: usize = 31;

/// Turn a configured channel name into a POSIX shared-memory name.
///
/// `"frames"` and `"/frames"` name the same region. Any further `/`, an
/// interior NUL, or an over-long name is rejected.
pub fn normalize_name(name: &str) -> Result<String, ChannelError> {
    let invalid = |reason| ChannelError::InvalidName {
        name: name.to_string(),
        reason,
    };

    let bare = name.strip_prefix('/').unwrap_or(name);
    if bare.is_empty() {
        return Err(invalid("name is empty"));
    }
    if bare.contains('/') {
        return Err(invalid("only a single leading '/' is allowed"));
    }
    if bare.contains('\0') {
        return Err(invalid("name contains a NUL byte"));
    }
    if bare.len() + 1 > MAX_NAME_LEN {
        return Err(invalid("name is too long for this platform"));
    }
    Ok(format!("/{bare}"))
}

/// Whether a process with this pid still exists.
///
/// `EPERM` means it exists but belongs to another user.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// A mapped POSIX shared-memory object.
///
/// Dropping unmaps; the name is only removed by [`ShmRegion::unlink`].
pub struct ShmRegion {
    ptr: NonNull<u8>,
    len: usize,
    name: String,
}

// SAFETY: the mapping is plain memory owned by this value; all cross-process
// access to it goes through the control block's synchronization.
unsafe impl Send for ShmRegion {}

impl ShmRegion {
    /// Create a new object of `len` zeroed bytes.
    ///
    /// Fails with `ErrorKind::AlreadyExists` if the name is taken.
    pub fn create(name: &str, len: usize) -> io::Result<Self> {
        let c_name = c_name(name)?;
        // SAFETY: `c_name` is a valid NUL-terminated string.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::mode_t,
            )
        };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: `fd` was just opened by us.
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } == -1 {
            let err = io::Error::last_os_error();
            // SAFETY: `fd` is open; the half-created name is removed again.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(err);
        }

        match map(fd, len) {
            Ok(ptr) => {
                debug!(name, len, "created shared memory region");
                Ok(Self {
                    ptr,
                    len,
                    name: name.to_string(),
                })
            }
            Err(err) => {
                // SAFETY: as above.
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                Err(err)
            }
        }
    }

    /// Open and map an existing object in full.
    ///
    /// Fails with `ErrorKind::NotFound` if no object has this name.
    pub fn open(name: &str) -> io::Result<Self> {
        let c_name = c_name(name)?;
        // SAFETY: `c_name` is a valid NUL-terminated string.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        // SAFETY: `fd` is open and `stat` is writable storage for one `stat`.
        if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } == -1 {
            let err = io::Error::last_os_error();
            // SAFETY: `fd` is open.
            unsafe { libc::close(fd) };
            return Err(err);
        }
        // SAFETY: fstat succeeded and initialized `stat`.
        let len = unsafe { stat.assume_init() }.st_size as usize;
        if len == 0 {
            // SAFETY: `fd` is open.
            unsafe { libc::close(fd) };
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "shared memory object has no size yet",
            ));
        }

        let ptr = map(fd, len)?;
        debug!(name, len, "opened shared memory region");
        Ok(Self {
            ptr,
            len,
            name: name.to_string(),
        })
    }

    /// Remove a name. A name that is already gone is not an error.
    pub fn unlink(name: &str) -> io::Result<()> {
        let c_name = c_name(name)?;
        // SAFETY: `c_name` is a valid NUL-terminated string.
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } == -1 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` describe a mapping created by `map` and not yet unmapped.
        if unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) } == -1 {
            debug!(
                name = %self.name,
                error = %io::Error::last_os_error(),
                "munmap failed"
            );
        }
    }
}

impl std::fmt::Debug for ShmRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmRegion")
            .field("name", &self.name)
            .field("len", &self.len)
            .finish()
    }
}

/// Create, map and unlink a throwaway region.
///
/// Succeeds when named shared memory is usable by this process.
pub fn probe_shared_memory() -> io::Result<()> {
    let name = format!("/framelink-probe-{}", std::process::id());
    let _ = ShmRegion::unlink(&name);
    let region = ShmRegion::create(&name, 4096)?;
    // SAFETY: the mapping is at least one byte long and writable.
    unsafe { region.as_ptr().write_volatile(1) };
    drop(region);
    ShmRegion::unlink(&name)
}

fn c_name(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in name"))
}

/// Map `fd` shared and close it; the mapping stays valid.
fn map(fd: libc::c_int, len: usize) -> io::Result<NonNull<u8>> {
    // SAFETY: `fd` is an open shared-memory descriptor of at least `len` bytes.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    let err = io::Error::last_os_error();
    // SAFETY: `fd` is open and no longer needed once mapped.
    unsafe { libc::close(fd) };

    if addr == libc::MAP_FAILED {
        return Err(err);
    }
    NonNull::new(addr.cast::<u8>()).ok_or_else(|| io::Error::other("mmap returned null"))
}
