//! Synchronous shared-memory transport.
//!
//! A data port is one System V shared memory segment carrying a
//! [`ControlBlock`] (two cross-process semaphores) followed by a single
//! request/response frame. The party that last posted `request` owns the
//! frame until `response` comes back; at most one transaction is in flight
//! per port, enforced by the requester-side guards in the endpoint.

use crate::error::{BridgeError, Result};
use crate::event::Event;
use crate::protocol::DataFrame;
use std::os::raw::c_void;
use std::time::Duration;

/// Bound applied to caller-unbounded waits. An unbounded wait on the audio
/// thread would freeze the host if the child dies mid-transaction.
pub const DEFAULT_SOFT_LIMIT: Duration = Duration::from_secs(30);

/// Segment header: request/response semaphore pair, frame follows.
#[repr(C)]
pub struct ControlBlock {
    pub request: Event,
    pub response: Event,
}

pub struct DataPort {
    id: i32,
    buffer: *mut u8,
    frame_size: usize,
    created: bool,
    soft_limit: Duration,
}

// SAFETY: the raw segment pointer is shared between threads, but all frame
// access is serialized by the request/response handshake plus the per-port
// guards on the requester side; the semaphores themselves are Sync.
unsafe impl Send for DataPort {}
unsafe impl Sync for DataPort {}

impl Default for DataPort {
    fn default() -> Self {
        Self::new()
    }
}

impl DataPort {
    pub fn new() -> Self {
        Self {
            id: -1,
            buffer: std::ptr::null_mut(),
            frame_size: 0,
            created: false,
            soft_limit: DEFAULT_SOFT_LIMIT,
        }
    }

    pub fn set_soft_limit(&mut self, limit: Duration) {
        self.soft_limit = limit;
    }

    /// Allocate a fresh private segment of `header + frame_size` bytes,
    /// attach it and construct the semaphore pair in place.
    pub fn create(&mut self, frame_size: usize) -> Result<()> {
        if !self.is_null() {
            return Err(BridgeError::SharedMemory(
                "unable to create, port is already attached".to_string(),
            ));
        }

        let buffer_size = std::mem::size_of::<ControlBlock>() + frame_size;

        // SAFETY: plain SysV calls; failure paths release the segment.
        unsafe {
            let id = libc::shmget(libc::IPC_PRIVATE, buffer_size, 0o600);
            if id < 0 {
                return Err(BridgeError::SharedMemory(format!(
                    "unable to allocate {} bytes of shared memory: {}",
                    buffer_size,
                    std::io::Error::last_os_error()
                )));
            }

            let addr = libc::shmat(id, std::ptr::null(), 0);
            if addr as isize == -1 {
                libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut());
                return Err(BridgeError::SharedMemory(format!(
                    "unable to attach shared memory segment with id {}: {}",
                    id,
                    std::io::Error::last_os_error()
                )));
            }

            let block = addr as *mut ControlBlock;
            if let Err(e) = Event::init_in_place(std::ptr::addr_of_mut!((*block).request))
                .and_then(|_| Event::init_in_place(std::ptr::addr_of_mut!((*block).response)))
            {
                libc::shmdt(addr);
                libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut());
                return Err(e);
            }

            self.id = id;
            self.buffer = addr as *mut u8;
        }

        self.frame_size = frame_size;
        self.created = true;
        Ok(())
    }

    /// Attach a segment created by the peer; the frame size is inferred
    /// from the kernel-reported segment size.
    pub fn connect(&mut self, id: i32) -> Result<()> {
        if !self.is_null() {
            return Err(BridgeError::SharedMemory(
                "unable to connect on already initialized port".to_string(),
            ));
        }

        // SAFETY: see create().
        unsafe {
            let addr = libc::shmat(id, std::ptr::null(), 0);
            if addr as isize == -1 {
                return Err(BridgeError::SharedMemory(format!(
                    "unable to attach shared memory segment with id {}: {}",
                    id,
                    std::io::Error::last_os_error()
                )));
            }

            let mut info: libc::shmid_ds = std::mem::zeroed();
            if libc::shmctl(id, libc::IPC_STAT, &mut info) != 0 {
                libc::shmdt(addr);
                return Err(BridgeError::SharedMemory(format!(
                    "unable to stat shared memory segment with id {}: {}",
                    id,
                    std::io::Error::last_os_error()
                )));
            }

            self.frame_size = info.shm_segsz as usize - std::mem::size_of::<ControlBlock>();
            self.buffer = addr as *mut u8;
        }

        self.id = id;
        self.created = false;
        Ok(())
    }

    /// Detach; the creating side also marks the segment for removal. The
    /// peer keeps a valid mapping until it detaches, which is what lets
    /// the endpoint tear ports down without handshaking the child.
    pub fn disconnect(&mut self) {
        if self.is_null() {
            return;
        }

        // SAFETY: buffer/id are the live attachment.
        unsafe {
            libc::shmdt(self.buffer as *const c_void);
            if self.created {
                libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut());
            }
        }

        self.id = -1;
        self.buffer = std::ptr::null_mut();
        self.frame_size = 0;
        self.created = false;
    }

    pub fn is_null(&self) -> bool {
        self.id < 0
    }

    /// True iff the peer is still attached (kernel attach count > 1).
    pub fn is_connected(&self) -> bool {
        // SAFETY: out-parameter stat call.
        unsafe {
            let mut info: libc::shmid_ds = std::mem::zeroed();
            if libc::shmctl(self.id, libc::IPC_STAT, &mut info) != 0 {
                tracing::error!(id = self.id, "unable to stat shared memory segment");
                return false;
            }
            info.shm_nattch > 1
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Typed view of the frame header.
    ///
    /// Only valid while the port is attached. Frame contents are owned by
    /// whichever side last posted per the handshake; callers must hold the
    /// port's requester guard.
    #[allow(clippy::mut_from_ref)]
    pub fn frame(&self) -> &mut DataFrame {
        debug_assert!(!self.is_null());
        // SAFETY: the segment outlives self, and access is serialized by
        // the handshake (see type-level comment).
        unsafe { &mut *(self.buffer.add(std::mem::size_of::<ControlBlock>()) as *mut DataFrame) }
    }

    /// Byte view of the variable payload after the frame header.
    #[allow(clippy::mut_from_ref)]
    pub fn payload(&self) -> &mut [u8] {
        debug_assert!(!self.is_null());
        let header = std::mem::size_of::<ControlBlock>() + std::mem::size_of::<DataFrame>();
        // SAFETY: see frame().
        unsafe {
            std::slice::from_raw_parts_mut(
                self.buffer.add(header),
                self.frame_size - std::mem::size_of::<DataFrame>(),
            )
        }
    }

    fn control_block(&self) -> &ControlBlock {
        // SAFETY: attached segment begins with the control block.
        unsafe { &*(self.buffer as *const ControlBlock) }
    }

    pub fn send_request(&self) {
        if !self.is_null() {
            self.control_block().request.post();
        }
    }

    pub fn send_response(&self) {
        if !self.is_null() {
            self.control_block().response.post();
        }
    }

    /// Wait for a request. `None` means caller-unbounded, which is bounded
    /// by the soft limit; expiry of that bound is logged with `tag`.
    pub fn wait_request(&self, tag: &str, timeout: Option<Duration>) -> bool {
        if self.is_null() {
            return false;
        }
        match timeout {
            Some(t) => self.control_block().request.wait_timeout(t),
            None => {
                if !self.control_block().request.wait_timeout(self.soft_limit) {
                    tracing::error!(tag, "request wait failed");
                    return false;
                }
                true
            }
        }
    }

    /// Wait for a response; timeout semantics as [`wait_request`].
    ///
    /// [`wait_request`]: DataPort::wait_request
    pub fn wait_response(&self, tag: &str, timeout: Option<Duration>) -> bool {
        if self.is_null() {
            return false;
        }
        match timeout {
            Some(t) => self.control_block().response.wait_timeout(t),
            None => {
                if !self.control_block().response.wait_timeout(self.soft_limit) {
                    tracing::error!(tag, "response wait failed");
                    return false;
                }
                true
            }
        }
    }
}

impl Drop for DataPort {
    fn drop(&mut self) {
        self.disconnect();
    }
}
