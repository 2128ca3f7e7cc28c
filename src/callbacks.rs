//! Host-service callbacks requested by the child.
//!
//! Synchronous callbacks arrive on the callback port and are serviced by a
//! dedicated pump thread; callbacks originating on the child's audio
//! thread arrive as fire-and-forget frames on the kernel queue and are
//! drained at the end of every `process*` call.

use crate::endpoint::{AutomateEntry, Shared};
use crate::frame_queue::FrameBuf;
use crate::protocol::{DataFrame, PluginInfo};
use crate::vst2::{host_opcode as cb, VstEvent, VstEvents, VstTimeInfo};
use smallvec::SmallVec;
use std::os::raw::c_void;
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc};

/// Pump thread body: service callback-port requests until the run flag is
/// cleared. The poll quantum bounds shutdown latency.
pub(crate) fn pump_loop(shared: Arc<Shared>, ready: mpsc::Sender<()>) {
    tracing::trace!("callback pump started");
    let _ = ready.send(());

    while shared.pump_run.load(Ordering::Acquire) {
        let port = shared.callback_port.lock();
        if port.wait_request("callback pump", Some(shared.config.pump_poll)) {
            let frame = port.frame();
            frame.value = shared.handle_audio_master(frame, port.payload());
            port.send_response();
        }
    }

    tracing::trace!("callback pump terminated");
}

impl Shared {
    /// Route one child-originated callback to the native host.
    pub(crate) fn handle_audio_master(&self, frame: &mut DataFrame, payload: &mut [u8]) -> isize {
        if frame.opcode != cb::GET_TIME && frame.opcode != cb::IDLE {
            tracing::trace!(
                opcode = frame.opcode,
                index = frame.index,
                value = frame.value,
                "handle_audio_master"
            );
        }

        match frame.opcode {
            cb::VERSION
            | cb::WANT_MIDI_DEPRECATED
            | cb::IDLE
            | cb::BEGIN_EDIT
            | cb::END_EDIT
            | cb::UPDATE_DISPLAY
            | cb::GET_VENDOR_VERSION
            | cb::SIZE_WINDOW
            | cb::GET_INPUT_LATENCY
            | cb::GET_OUTPUT_LATENCY
            | cb::GET_CURRENT_PROCESS_LEVEL
            | cb::GET_AUTOMATION_STATE
            | cb::CURRENT_ID
            | cb::GET_SAMPLE_RATE => (self.master)(
                self.effect,
                frame.opcode,
                frame.index,
                frame.value,
                std::ptr::null_mut(),
                frame.opt,
            ),

            cb::AUTOMATE => {
                // Some hosts call getParameter() from inside their automate
                // handler on the same thread while a process transaction is
                // in flight; serve that read from this cache.
                *self.automate.lock() = Some(AutomateEntry {
                    thread: std::thread::current().id(),
                    index: frame.index,
                    value: frame.value as f32,
                });

                let result = (self.master)(
                    self.effect,
                    frame.opcode,
                    frame.index,
                    frame.value,
                    std::ptr::null_mut(),
                    frame.opt,
                );

                *self.automate.lock() = None;
                result
            }

            cb::IO_CHANGED => {
                // SAFETY: the payload carries the child's updated PluginInfo.
                let info =
                    unsafe { std::ptr::read_unaligned(payload.as_ptr() as *const PluginInfo) };
                // SAFETY: mirrored fields the host re-reads after IOChanged.
                unsafe { crate::endpoint::apply_info(self.effect, &info) };

                (self.master)(
                    self.effect,
                    frame.opcode,
                    frame.index,
                    frame.value,
                    std::ptr::null_mut(),
                    frame.opt,
                )
            }

            cb::GET_VENDOR_STRING | cb::GET_PRODUCT_STRING | cb::CAN_DO => (self.master)(
                self.effect,
                frame.opcode,
                frame.index,
                frame.value,
                payload.as_mut_ptr() as *mut c_void,
                frame.opt,
            ),

            cb::GET_TIME => {
                let value = (self.master)(
                    self.effect,
                    frame.opcode,
                    frame.index,
                    frame.value,
                    std::ptr::null_mut(),
                    frame.opt,
                );

                let time = value as *const VstTimeInfo;
                if time.is_null() {
                    return 0;
                }
                // SAFETY: the host returned a pointer to its time info; the
                // child reads the copy out of the payload.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        time as *const u8,
                        payload.as_mut_ptr(),
                        std::mem::size_of::<VstTimeInfo>(),
                    );
                }
                1
            }

            cb::PROCESS_EVENTS => self.forward_events(frame.index as usize, payload),

            _ => {
                tracing::error!(opcode = frame.opcode, "unhandled host callback");
                0
            }
        }
    }

    /// Pop every queued async callback and service it. Called right after
    /// each `process*` round trip completes.
    pub(crate) fn drain_frame_queue(&self) {
        let mut buf = FrameBuf::new();
        while self.frame_queue.pop_frame(&mut buf) {
            tracing::debug!("processing async host callback from audio thread");
            let (frame, payload) = buf.parts();
            self.handle_audio_master(frame, payload);
        }
    }

    /// Value remembered by the automate handler for a same-thread
    /// re-entrant `getParameter`.
    pub(crate) fn automated_value(&self, index: i32) -> Option<f32> {
        let cache = self.automate.lock();
        let entry = cache.as_ref()?;
        if entry.thread != std::thread::current().id() {
            return None;
        }
        if entry.index != index {
            tracing::error!(
                cached = entry.index,
                index,
                "unable to serve automated parameter"
            );
            return Some(0.0);
        }
        Some(entry.value)
    }

    /// Rebuild a `VstEvents` list over the records laid out contiguously
    /// in the payload and hand it to the host.
    fn forward_events(&self, count: usize, payload: &mut [u8]) -> isize {
        let record = std::mem::size_of::<VstEvent>();
        let count = count.min(payload.len() / record);

        let mut pointers: SmallVec<[*mut VstEvent; 64]> = SmallVec::with_capacity(count);
        for i in 0..count {
            // SAFETY: the payload is 8-aligned and carries `count` records.
            pointers.push(unsafe { payload.as_mut_ptr().add(i * record) } as *mut VstEvent);
        }

        // VstEvents declares two pointer slots; allocate past them for the
        // rest, with 8-byte alignment for the header words.
        let header = std::mem::offset_of!(VstEvents, events);
        let needed = header + count.max(2) * std::mem::size_of::<*mut VstEvent>();
        let mut storage = vec![0u64; needed.div_ceil(8)];

        // SAFETY: storage is aligned and large enough for the header plus
        // `count` pointer slots; the events stay alive in the payload for
        // the duration of the host call.
        unsafe {
            let events = storage.as_mut_ptr() as *mut VstEvents;
            (*events).num_events = count as i32;
            (*events).reserved = 0;
            let slots = (storage.as_mut_ptr() as *mut u8).add(header) as *mut *mut VstEvent;
            for (i, pointer) in pointers.iter().enumerate() {
                *slots.add(i) = *pointer;
            }
            (self.master)(
                self.effect,
                cb::PROCESS_EVENTS,
                0,
                0,
                events as *mut c_void,
                0.0,
            )
        }
    }
}
