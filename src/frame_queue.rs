//! Lossy asynchronous callback channel.
//!
//! Host callbacks raised from the child's audio thread cannot block on the
//! synchronous callback port, so they travel as fixed-size messages on a
//! System V message queue instead. The queue is keyed by the control
//! port's shared-memory id, which is unique system-wide across both
//! primitive namespaces, so no extra id negotiation is needed. Frames are
//! dropped when the queue is full; the sender is a real-time thread and
//! must never wait.

use crate::error::{BridgeError, Result};
use crate::protocol::DataFrame;
use std::os::raw::c_void;
use std::sync::atomic::{AtomicI32, Ordering};

/// Queue message payload size; matches the Linux default maximum message
/// size (`/proc/sys/kernel/msgmax`) and the callback port frame size.
pub const CALLBACK_FRAME_SIZE: usize = 8192;

/// One queued callback frame: a [`DataFrame`] header plus payload bytes,
/// aligned so the header view is well-formed.
#[repr(C, align(8))]
pub struct FrameBuf {
    pub bytes: [u8; CALLBACK_FRAME_SIZE],
}

impl Default for FrameBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuf {
    pub fn new() -> Self {
        Self {
            bytes: [0; CALLBACK_FRAME_SIZE],
        }
    }

    /// Split into the frame header and the payload bytes behind it.
    pub fn parts(&mut self) -> (&mut DataFrame, &mut [u8]) {
        let (head, tail) = self.bytes.split_at_mut(std::mem::size_of::<DataFrame>());
        // SAFETY: the buffer is 8-aligned and at least header-sized.
        (unsafe { &mut *(head.as_mut_ptr() as *mut DataFrame) }, tail)
    }
}

#[repr(C)]
struct Message {
    mtype: libc::c_long,
    data: [u8; CALLBACK_FRAME_SIZE],
}

pub struct FrameQueue {
    msgid: AtomicI32,
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameQueue {
    pub fn new() -> Self {
        Self {
            msgid: AtomicI32::new(-1),
        }
    }

    /// Open (or create) the queue for `key` with owner-only permissions.
    pub fn connect(&self, key: i32) -> Result<()> {
        // SAFETY: plain syscall.
        let id = unsafe { libc::msgget(key as libc::key_t, 0o600 | libc::IPC_CREAT) };
        if id == -1 {
            return Err(BridgeError::Queue(format!(
                "unable to connect callback queue (key = {}): {}",
                key,
                std::io::Error::last_os_error()
            )));
        }
        self.msgid.store(id, Ordering::Release);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.msgid.load(Ordering::Acquire) >= 0
    }

    /// Send one frame without blocking. A full queue drops the frame: the
    /// callbacks carried here are informational and the caller is the
    /// audio thread.
    pub fn push_frame(&self, frame: &FrameBuf) {
        let id = self.msgid.load(Ordering::Acquire);
        if id < 0 {
            return;
        }
        let msg = Message {
            mtype: 1,
            data: frame.bytes,
        };
        // SAFETY: msg is a properly laid out SysV message.
        let rc = unsafe {
            libc::msgsnd(
                id,
                &msg as *const Message as *const c_void,
                CALLBACK_FRAME_SIZE,
                libc::IPC_NOWAIT,
            )
        };
        if rc == -1 {
            tracing::warn!(
                error = %std::io::Error::last_os_error(),
                "callback frame dropped"
            );
        }
    }

    /// Non-blocking receive; returns false when the queue is empty.
    pub fn pop_frame(&self, out: &mut FrameBuf) -> bool {
        let id = self.msgid.load(Ordering::Acquire);
        if id < 0 {
            return false;
        }
        let mut msg = Message {
            mtype: 0,
            data: [0; CALLBACK_FRAME_SIZE],
        };
        // SAFETY: msg is a properly laid out SysV message.
        let n = unsafe {
            libc::msgrcv(
                id,
                &mut msg as *mut Message as *mut c_void,
                CALLBACK_FRAME_SIZE,
                0,
                libc::IPC_NOWAIT,
            )
        };
        if n < 0 {
            return false;
        }
        out.bytes = msg.data;
        true
    }
}

impl Drop for FrameQueue {
    fn drop(&mut self) {
        let id = self.msgid.load(Ordering::Acquire);
        if id >= 0 {
            // SAFETY: removing our own queue.
            unsafe {
                libc::msgctl(id, libc::IPC_RMID, std::ptr::null_mut());
            }
        }
    }
}
