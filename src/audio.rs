//! Audio-path marshaling.
//!
//! `process*` rounds ship every input channel back-to-back through the
//! audio port, suspend on the response semaphore (bounded by the soft
//! limit), drain the async callback queue and read the outputs back.
//! Parameter access rides the same port so none of it ever contends with
//! main-thread UI dispatches.

use crate::endpoint::Shared;
use crate::protocol::Command;

impl Shared {
    pub(crate) fn get_parameter(&self, index: i32) -> f32 {
        // Re-entrant read from inside the host's automation handler; answer
        // from the cache instead of deadlocking against the in-flight
        // process transaction.
        if let Some(value) = self.automated_value(index) {
            return value;
        }

        let guard = self.audio.lock();
        let port = guard.borrow();
        if port.is_null() {
            return 0.0;
        }

        let frame = port.frame();
        frame.set_command(Command::GetParameter);
        frame.index = index;
        port.send_request();
        if !port.wait_response("getParameter", None) {
            return 0.0;
        }
        port.frame().opt
    }

    pub(crate) fn set_parameter(&self, index: i32, value: f32) {
        let guard = self.audio.lock();
        let port = guard.borrow();
        if port.is_null() {
            return;
        }

        let frame = port.frame();
        frame.set_command(Command::SetParameter);
        frame.index = index;
        frame.opt = value;
        port.send_request();
        port.wait_response("setParameter", None);
    }

    pub(crate) fn process_replacing(
        &self,
        inputs: *mut *mut f32,
        outputs: *mut *mut f32,
        frames: i32,
    ) {
        self.process_impl(
            Command::ProcessSingle,
            inputs,
            outputs,
            frames,
            "processReplacing",
        );
    }

    pub(crate) fn process_double_replacing(
        &self,
        inputs: *mut *mut f64,
        outputs: *mut *mut f64,
        frames: i32,
    ) {
        self.process_impl(
            Command::ProcessDouble,
            inputs,
            outputs,
            frames,
            "processDoubleReplacing",
        );
    }

    fn process_impl<T: Copy>(
        &self,
        command: Command,
        inputs: *mut *mut T,
        outputs: *mut *mut T,
        frames: i32,
        tag: &str,
    ) {
        // SAFETY: channel counts change only at defined protocol points.
        let (num_inputs, num_outputs) = unsafe {
            (
                (*self.effect).num_inputs as usize,
                (*self.effect).num_outputs as usize,
            )
        };
        let stride = std::mem::size_of::<T>() * frames as usize;

        let guard = self.audio.lock();
        {
            let port = guard.borrow();
            if port.is_null() {
                return;
            }

            let frame = port.frame();
            frame.set_command(command);
            frame.value = frames as isize;

            let payload = port.payload();
            for channel in 0..num_inputs {
                // SAFETY: the host passes num_inputs channels of `frames`
                // samples; the port was sized for them by set_block_size.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        *inputs.add(channel) as *const u8,
                        payload.as_mut_ptr().add(channel * stride),
                        stride,
                    );
                }
            }

            port.send_request();
            if !port.wait_response(tag, None) {
                return;
            }
        }

        // All async callbacks the child raised during this block are
        // observed before process returns to the host. The port borrow is
        // released first: a callback handler may re-enter the audio port.
        self.drain_frame_queue();

        let port = guard.borrow();
        let payload = port.payload();
        for channel in 0..num_outputs {
            // SAFETY: symmetric to the input copy above.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    payload.as_ptr().add(channel * stride),
                    *outputs.add(channel) as *mut u8,
                    stride,
                );
            }
        }
    }
}
