//! Process-shared mutex and condition variable placed inside a mapped region.

use std::cell::UnsafeCell;
use std::io;
use std::time::Duration;

/// `pthread_mutex_t` + `pthread_cond_t` with `PTHREAD_PROCESS_SHARED`.
///
/// On Linux the mutex is robust: if the holder dies, the next locker gets
/// the lock back with [`SyncGuard::owner_died`] set.
#[repr(C)]
pub(crate) struct RawSync {
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    cond: UnsafeCell<libc::pthread_cond_t>,
}

pub(crate) struct SyncGuard<'a> {
    sync: &'a RawSync,
    owner_died: bool,
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

#[cfg(target_os = "linux")]
const WAIT_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;
#[cfg(not(target_os = "linux"))]
const WAIT_CLOCK: libc::clockid_t = libc::CLOCK_REALTIME;

impl RawSync {
    /// Initialize in place.
    ///
    /// # Safety
    /// `this` must point to writable memory for a `RawSync` that no other
    /// thread or process is using yet.
    pub(crate) unsafe fn init(this: *mut RawSync) -> io::Result<()> {
        let mut mattr = std::mem::MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        check(libc::pthread_mutexattr_init(mattr.as_mut_ptr()))?;
        let mattr_ptr = mattr.as_mut_ptr();
        let result = (|| {
            check(libc::pthread_mutexattr_setpshared(
                mattr_ptr,
                libc::PTHREAD_PROCESS_SHARED,
            ))?;
            #[cfg(target_os = "linux")]
            check(libc::pthread_mutexattr_setrobust(
                mattr_ptr,
                libc::PTHREAD_MUTEX_ROBUST,
            ))?;
            check(libc::pthread_mutex_init(
                UnsafeCell::raw_get(std::ptr::addr_of!((*this).mutex)),
                mattr_ptr,
            ))
        })();
        libc::pthread_mutexattr_destroy(mattr_ptr);
        result?;

        let mut cattr = std::mem::MaybeUninit::<libc::pthread_condattr_t>::uninit();
        check(libc::pthread_condattr_init(cattr.as_mut_ptr()))?;
        let cattr_ptr = cattr.as_mut_ptr();
        let result = (|| {
            check(libc::pthread_condattr_setpshared(
                cattr_ptr,
                libc::PTHREAD_PROCESS_SHARED,
            ))?;
            #[cfg(target_os = "linux")]
            check(libc::pthread_condattr_setclock(cattr_ptr, WAIT_CLOCK))?;
            check(libc::pthread_cond_init(
                UnsafeCell::raw_get(std::ptr::addr_of!((*this).cond)),
                cattr_ptr,
            ))
        })();
        libc::pthread_condattr_destroy(cattr_ptr);
        result
    }

    pub(crate) fn lock(&self) -> io::Result<SyncGuard<'_>> {
        // SAFETY: the mutex was initialized by `init` before the region was published.
        let rc = unsafe { libc::pthread_mutex_lock(self.mutex.get()) };
        let owner_died = self.recover(rc)?;
        Ok(SyncGuard {
            sync: self,
            owner_died,
        })
    }

    /// Wake every waiter.
    pub(crate) fn notify_all(&self) {
        // SAFETY: the condition variable was initialized by `init`.
        unsafe { libc::pthread_cond_broadcast(self.cond.get()) };
    }

    /// Map a lock result, making the mutex consistent after an owner death.
    fn recover(&self, rc: libc::c_int) -> io::Result<bool> {
        #[cfg(target_os = "linux")]
        if rc == libc::EOWNERDEAD {
            // SAFETY: we hold the mutex; EOWNERDEAD hands it over in the inconsistent state.
            check(unsafe { libc::pthread_mutex_consistent(self.mutex.get()) })?;
            return Ok(true);
        }
        check(rc)?;
        Ok(false)
    }
}

impl SyncGuard<'_> {
    /// The previous holder died while holding the lock.
    pub(crate) fn owner_died(&self) -> bool {
        self.owner_died
    }

    /// Release the lock, wait for a notification or `timeout`, re-acquire.
    ///
    /// Returns `false` on timeout. Spurious wakeups return `true`; callers
    /// re-check their predicate.
    pub(crate) fn wait(&mut self, timeout: Duration) -> io::Result<bool> {
        let deadline = deadline_after(timeout)?;
        // SAFETY: we hold the mutex, and `cond`/`mutex` are initialized and process-shared.
        let rc = unsafe {
            libc::pthread_cond_timedwait(self.sync.cond.get(), self.sync.mutex.get(), &deadline)
        };
        if rc == libc::ETIMEDOUT {
            return Ok(false);
        }
        if self.sync.recover(rc)? {
            self.owner_died = true;
        }
        Ok(true)
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: this guard proves the calling thread holds the mutex.
        unsafe { libc::pthread_mutex_unlock(self.sync.mutex.get()) };
    }
}

fn deadline_after(timeout: Duration) -> io::Result<libc::timespec> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `now` is a valid, writable timespec.
    if unsafe { libc::clock_gettime(WAIT_CLOCK, &mut now) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let total_nsec = now.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
    let extra_secs = timeout.as_secs().saturating_add(total_nsec / 1_000_000_000);
    Ok(libc::timespec {
        tv_sec: now.tv_sec.saturating_add(extra_secs as libc::time_t),
        tv_nsec: (total_nsec % 1_000_000_000) as _,
    })
}
