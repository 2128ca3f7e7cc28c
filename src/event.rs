//! Cross-process binary semaphore.
//!
//! Lives inside a shared memory segment and must therefore be initialized
//! in place with the process-shared flag; a process-local wrapper object
//! would only synchronize threads of one endpoint.

use crate::error::{BridgeError, Result};
use std::cell::UnsafeCell;
use std::time::Duration;

#[repr(C)]
pub struct Event {
    sem: UnsafeCell<libc::sem_t>,
}

// SAFETY: sem_t is the kernel's process-shared primitive; concurrent
// post/wait from any number of threads and processes is its contract.
unsafe impl Send for Event {}
unsafe impl Sync for Event {}

impl Event {
    /// Initialize a semaphore at `slot`, which must point into memory
    /// shared between the endpoints.
    ///
    /// # Safety
    ///
    /// `slot` must be valid for writes of `size_of::<Event>()` bytes and
    /// must not already hold a live semaphore.
    pub unsafe fn init_in_place(slot: *mut Event) -> Result<()> {
        if libc::sem_init((*slot).sem.get(), 1, 0) != 0 {
            return Err(BridgeError::SharedMemory(format!(
                "sem_init failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    pub fn post(&self) {
        // SAFETY: the semaphore was initialized by the segment creator.
        unsafe {
            libc::sem_post(self.sem.get());
        }
    }

    /// Block until posted.
    pub fn wait(&self) {
        loop {
            // SAFETY: see post().
            let rc = unsafe { libc::sem_wait(self.sem.get()) };
            if rc == 0 {
                return;
            }
            if std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                return;
            }
        }
    }

    /// Block until posted or until `timeout` elapses. Returns true iff the
    /// semaphore was acquired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut deadline = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: plain out-parameter syscall.
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut deadline);
        }
        let nanos = deadline.tv_nsec as i64 + timeout.subsec_nanos() as i64;
        deadline.tv_sec += timeout.as_secs() as libc::time_t + (nanos / 1_000_000_000) as libc::time_t;
        deadline.tv_nsec = nanos % 1_000_000_000;

        loop {
            // SAFETY: see post().
            let rc = unsafe { libc::sem_timedwait(self.sem.get(), &deadline) };
            if rc == 0 {
                return true;
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                _ => return false,
            }
        }
    }
}
