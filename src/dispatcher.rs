//! Opcode state machine.
//!
//! Each host dispatch is marshaled into the frame of the port selected by
//! the trampoline in `endpoint` (control for the construction thread and
//! `effEditOpen`, audio for everything else), forwarded, and the response
//! unmarshaled per opcode. Chunk transfers larger than the port frame are
//! split across `GetDataBlock`/`SetDataBlock` rounds on the same port with
//! no interleaving.

use crate::data_port::DataPort;
use crate::endpoint::Shared;
use crate::error::{BridgeError, Result};
use crate::protocol::{self, Command, DataFrame};
use crate::vst2::{
    effect_opcode as op, ERect, MidiKeyName, VstEvent, VstEvents, VstParameterProperties,
    VstPatchChunkInfo, VstPinProperties, VstSpeakerArrangement,
};
use std::cell::RefCell;
use std::os::raw::{c_char, c_void};

impl Shared {
    pub(crate) fn dispatch(
        &self,
        port: &RefCell<DataPort>,
        opcode: i32,
        index: i32,
        value: isize,
        ptr: *mut c_void,
        opt: f32,
    ) -> isize {
        if opcode != op::EDIT_IDLE {
            tracing::trace!(opcode, index, value, "dispatch");
        }

        match opcode {
            // The child runs its own window event loop; idle ticks would
            // only add round trips.
            op::EDIT_IDLE => return 1,
            op::SET_BLOCK_SIZE => return self.set_block_size(port, value),
            _ => {}
        }

        {
            let p = port.borrow();
            if p.is_null() {
                tracing::error!(opcode, "dispatch on an unconnected port");
                return 0;
            }
            let frame = p.frame();
            frame.set_command(Command::Dispatch);
            frame.opcode = opcode;
            frame.index = index;
            frame.value = value;
            frame.opt = opt;
        }

        match opcode {
            op::OPEN => {
                let result = self.forward(port, "dispatch/effOpen");
                // Pre-provision the audio port so the first process call
                // does not pay for port negotiation.
                self.set_block_size(port, self.config.preprovision_frames);
                result
            }

            op::GET_VST_VERSION
            | op::GET_PLUG_CATEGORY
            | op::SET_SAMPLE_RATE
            | op::GET_VENDOR_VERSION
            | op::EDIT_CLOSE
            | op::MAINS_CHANGED
            | op::CAN_BE_AUTOMATED
            | op::GET_PROGRAM
            | op::START_PROCESS
            | op::SET_PROGRAM
            | op::BEGIN_SET_PROGRAM
            | op::END_SET_PROGRAM
            | op::STOP_PROCESS
            | op::GET_NUM_MIDI_INPUT_CHANNELS
            | op::GET_NUM_MIDI_OUTPUT_CHANNELS
            | op::SET_PAN_LAW
            | op::GET_TAIL_SIZE
            | op::SET_EDIT_KNOB_MODE
            | op::CONNECT_INPUT_DEPRECATED
            | op::CONNECT_OUTPUT_DEPRECATED
            | op::KEYS_REQUIRED_DEPRECATED
            | op::IDENTIFY_DEPRECATED => self.forward(port, "dispatch/plain"),

            op::CLOSE => {
                self.forward(port, "dispatch/effClose");
                tracing::debug!("closing plugin");
                1
            }

            op::EDIT_OPEN => self.edit_open(port, ptr),

            op::EDIT_GET_RECT => {
                let p = port.borrow();
                p.send_request();
                if !p.wait_response("dispatch/effEditGetRect", None) {
                    return 0;
                }
                // SAFETY: the response payload carries the editor ERect.
                let rect =
                    unsafe { std::ptr::read_unaligned(p.payload().as_ptr() as *const ERect) };
                let mut cached = self.rect.lock();
                *cached = rect;
                // SAFETY: the caller passed an out-pointer for a rectangle
                // that must stay valid; ours lives as long as the endpoint.
                unsafe {
                    *(ptr as *mut *const ERect) = &*cached as *const ERect;
                }
                p.frame().value
            }

            op::CAN_DO => {
                {
                    let p = port.borrow();
                    // SAFETY: ptr is the host's query string.
                    unsafe { protocol::copy_cstr_in(p.payload(), ptr as *const c_char) };
                }
                self.forward(port, "dispatch/effCanDo")
            }

            op::SET_PROGRAM_NAME => {
                {
                    let p = port.borrow();
                    let payload = p.payload();
                    let cap = crate::vst2::MAX_PROG_NAME_LEN.min(payload.len());
                    // SAFETY: ptr is the host's program name.
                    unsafe { protocol::copy_cstr_in(&mut payload[..cap], ptr as *const c_char) };
                }
                self.forward(port, "dispatch/effSetProgramName")
            }

            op::GET_PROGRAM_NAME | op::GET_PROGRAM_NAME_INDEXED => {
                self.forward_string(port, "dispatch/effGetProgramName", ptr, crate::vst2::MAX_PROG_NAME_LEN)
            }

            op::GET_VENDOR_STRING | op::SHELL_GET_NEXT_PLUGIN => {
                self.forward_string(port, "dispatch/effGetVendorString", ptr, crate::vst2::MAX_VENDOR_STR_LEN)
            }

            op::GET_PRODUCT_STRING => {
                self.forward_string(port, "dispatch/effGetProductString", ptr, crate::vst2::MAX_PRODUCT_STR_LEN)
            }

            op::GET_EFFECT_NAME => {
                self.forward_string(port, "dispatch/effGetEffectName", ptr, crate::vst2::MAX_EFFECT_NAME_LEN)
            }

            op::GET_PARAM_NAME | op::GET_PARAM_LABEL | op::GET_PARAM_DISPLAY => {
                self.forward_param_string(port, ptr)
            }

            op::GET_PARAMETER_PROPERTIES => self.forward_struct_out(
                port,
                "dispatch/effGetParameterProperties",
                ptr,
                std::mem::size_of::<VstParameterProperties>(),
            ),

            op::GET_INPUT_PROPERTIES | op::GET_OUTPUT_PROPERTIES => self.forward_struct_out(
                port,
                "dispatch/effGetPinProperties",
                ptr,
                std::mem::size_of::<VstPinProperties>(),
            ),

            op::GET_MIDI_KEY_NAME => self.forward_struct_out(
                port,
                "dispatch/effGetMidiKeyName",
                ptr,
                std::mem::size_of::<MidiKeyName>(),
            ),

            op::BEGIN_LOAD_BANK | op::BEGIN_LOAD_PROGRAM => {
                {
                    let p = port.borrow();
                    // SAFETY: ptr is the host's VstPatchChunkInfo.
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            ptr as *const u8,
                            p.payload().as_mut_ptr(),
                            std::mem::size_of::<VstPatchChunkInfo>(),
                        );
                    }
                }
                self.forward(port, "dispatch/effBeginLoadProgram")
            }

            op::PROCESS_EVENTS => {
                {
                    let p = port.borrow();
                    let payload = p.payload();
                    // SAFETY: ptr is a VstEvents list; only fixed-size base
                    // records cross the process boundary.
                    unsafe {
                        let events = ptr as *const VstEvents;
                        let record = std::mem::size_of::<VstEvent>();
                        let count = ((*events).num_events as usize).min(payload.len() / record);
                        p.frame().index = count as i32;
                        let slots = (*events).events.as_ptr();
                        for i in 0..count {
                            std::ptr::copy_nonoverlapping(
                                *slots.add(i) as *const u8,
                                payload.as_mut_ptr().add(i * record),
                                record,
                            );
                        }
                    }
                }
                self.forward(port, "dispatch/effProcessEvents")
            }

            op::SET_SPEAKER_ARRANGEMENT => {
                {
                    let p = port.borrow();
                    let payload = p.payload();
                    let size = std::mem::size_of::<VstSpeakerArrangement>();
                    // SAFETY: the convention packs the input arrangement in
                    // `value` and the output arrangement in `ptr`.
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            value as *const u8,
                            payload.as_mut_ptr(),
                            size,
                        );
                        std::ptr::copy_nonoverlapping(
                            ptr as *const u8,
                            payload.as_mut_ptr().add(size),
                            size,
                        );
                    }
                }
                self.forward(port, "dispatch/effSetSpeakerArrangement")
            }

            op::GET_CHUNK => match self.get_chunk(port, ptr) {
                Ok(size) => size,
                Err(e) => {
                    tracing::error!(error = %e, "chunk read failed");
                    0
                }
            },
            op::SET_CHUNK => self.set_chunk(port, index, value, ptr),

            _ => {
                tracing::error!(opcode, "unhandled dispatch opcode");
                0
            }
        }
    }

    /// Send the prepared frame and wait for the child's reply. Returns 0
    /// on a soft-limit timeout.
    fn forward(&self, port: &RefCell<DataPort>, tag: &str) -> isize {
        let p = port.borrow();
        p.send_request();
        if !p.wait_response(tag, None) {
            return 0;
        }
        p.frame().value
    }

    fn forward_string(
        &self,
        port: &RefCell<DataPort>,
        tag: &str,
        ptr: *mut c_void,
        cap: usize,
    ) -> isize {
        let p = port.borrow();
        p.send_request();
        if !p.wait_response(tag, None) {
            return 0;
        }
        // SAFETY: ptr is the host's string buffer of at least `cap` bytes.
        unsafe { protocol::copy_cstr_out(ptr as *mut c_char, p.payload(), cap) };
        p.frame().value
    }

    /// Parameter strings are capped at 24 bytes including the terminator
    /// and the copy stops at the first non-printable byte; several plugins
    /// are known to emit garbage tails past their nominal 8-byte field.
    fn forward_param_string(&self, port: &RefCell<DataPort>, ptr: *mut c_void) -> isize {
        let p = port.borrow();
        p.send_request();
        if !p.wait_response("dispatch/effGetParamDisplay", None) {
            return 0;
        }
        let source = p.payload();
        let dest = ptr as *mut u8;
        let mut i = 0;
        while i < crate::vst2::EXT_MAX_PARAM_STR_LEN - 1 {
            let byte = source[i];
            if !(0x20..=0x7e).contains(&byte) {
                break;
            }
            // SAFETY: ptr is the host's parameter-string buffer.
            unsafe { *dest.add(i) = byte };
            i += 1;
        }
        // SAFETY: see above.
        unsafe { *dest.add(i) = 0 };
        p.frame().value
    }

    fn forward_struct_out(
        &self,
        port: &RefCell<DataPort>,
        tag: &str,
        ptr: *mut c_void,
        size: usize,
    ) -> isize {
        let p = port.borrow();
        p.send_request();
        if !p.wait_response(tag, None) {
            return 0;
        }
        // SAFETY: ptr is the host's out-structure of `size` bytes.
        unsafe { std::ptr::copy_nonoverlapping(p.payload().as_ptr(), ptr as *mut u8, size) };
        p.frame().value
    }

    /// Grow the audio port to fit `frames` samples of double-precision
    /// audio on every channel, then tell the child the new segment id.
    /// Shrinking never recreates the port.
    pub(crate) fn set_block_size(&self, port: &RefCell<DataPort>, frames: isize) -> isize {
        // SAFETY: channel counts are updated only at defined protocol points.
        let (inputs, outputs) = unsafe {
            (
                (*self.effect).num_inputs as usize,
                (*self.effect).num_outputs as usize,
            )
        };
        let frame_size = std::mem::size_of::<DataFrame>()
            + std::mem::size_of::<f64>() * frames as usize * (inputs + outputs);

        let audio = self.audio.lock();
        if audio.borrow().frame_size() >= frame_size {
            return 1;
        }

        tracing::debug!(frames, frame_size, "growing audio port");
        let new_id = {
            let mut audio_port = audio.borrow_mut();
            audio_port.disconnect();
            audio_port.set_soft_limit(self.config.soft_limit);
            if let Err(e) = audio_port.create(frame_size) {
                tracing::error!(error = %e, "unable to create audio port");
                return 0;
            }
            audio_port.id()
        };

        let p = port.borrow();
        let frame = p.frame();
        frame.set_command(Command::Dispatch);
        frame.opcode = op::SET_BLOCK_SIZE;
        frame.index = new_id;
        frame.value = frames;
        frame.opt = 0.0;
        p.send_request();
        if !p.wait_response("dispatch/effSetBlockSize", None) {
            return 0;
        }
        p.frame().value
    }

    fn edit_open(&self, port: &RefCell<DataPort>, ptr: *mut c_void) -> isize {
        let parent = ptr as u64;
        let p = port.borrow();
        p.send_request();
        if !p.wait_response("dispatch/effEditOpen", None) {
            return 0;
        }

        // SAFETY: the response payload carries the editor ERect.
        let rect = unsafe { std::ptr::read_unaligned(p.payload().as_ptr() as *const ERect) };
        *self.rect.lock() = rect;

        let width = (rect.right - rect.left) as u32;
        let height = (rect.bottom - rect.top) as u32;
        tracing::debug!(width, height, "requested editor window size");

        self.embedder.resize_parent(parent, width, height);
        std::thread::sleep(self.config.edit_open_settle);

        let child = p.frame().value as u64;
        self.embedder.reparent(child, parent);
        self.embedder.embedded_notify(child, parent);
        self.embedder.focus_out(child);

        p.frame().set_command(Command::ShowWindow);
        p.send_request();
        if !p.wait_response("dispatch/effEditOpen show", None) {
            return 0;
        }

        std::thread::sleep(self.config.edit_open_settle);
        self.embedder.map(child);

        p.frame().value
    }

    fn get_chunk(&self, port: &RefCell<DataPort>, ptr: *mut c_void) -> Result<isize> {
        let p = port.borrow();
        let block_size = p.frame_size() - std::mem::size_of::<DataFrame>();

        // Tell the child how much payload fits per round trip.
        p.frame().value = block_size as isize;
        p.send_request();
        if !p.wait_response("dispatch/effGetChunk", None) {
            return Ok(0);
        }

        let chunk_size = p.frame().value as usize;
        let count = (p.frame().index as usize).min(block_size).min(chunk_size);
        tracing::debug!(chunk_size, "chunk transfer started");

        if chunk_size == 0 || count == 0 {
            return Err(BridgeError::Protocol(
                "chunk read is unsupported by the plugin".to_string(),
            ));
        }

        let mut chunk = self.chunk.lock();
        chunk.clear();
        chunk.reserve(chunk_size);
        chunk.extend_from_slice(&p.payload()[..count]);

        while chunk.len() < chunk_size {
            let want = block_size.min(chunk_size - chunk.len());
            let frame = p.frame();
            frame.set_command(Command::GetDataBlock);
            frame.index = want as i32;
            tracing::debug!(want, "requesting next chunk block");

            p.send_request();
            if !p.wait_response("dispatch/effGetChunk read", None) {
                return Ok(0);
            }

            let got = (p.frame().index as usize).min(want);
            if got == 0 {
                return Err(BridgeError::Protocol(
                    "premature end of chunk transmission".to_string(),
                ));
            }
            chunk.extend_from_slice(&p.payload()[..got]);
        }

        tracing::debug!(received = chunk.len(), "chunk transfer complete");

        // SAFETY: the caller receives a pointer into our buffer, valid
        // until the next chunk transfer.
        unsafe {
            *(ptr as *mut *mut c_void) = chunk.as_mut_ptr() as *mut c_void;
        }
        Ok(chunk_size as isize)
    }

    fn set_chunk(
        &self,
        port: &RefCell<DataPort>,
        is_preset: i32,
        byte_size: isize,
        ptr: *mut c_void,
    ) -> isize {
        let total = byte_size as usize;
        tracing::debug!(total, "chunk write started");

        // SAFETY: ptr is the host's chunk of `byte_size` bytes.
        let data: &[u8] = if total == 0 {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(ptr as *const u8, total) }
        };

        let p = port.borrow();
        let block_size = p.frame_size() - std::mem::size_of::<DataFrame>();

        let mut sent = 0;
        while sent < total {
            let count = block_size.min(total - sent);
            let frame = p.frame();
            frame.set_command(Command::SetDataBlock);
            frame.index = count as i32;
            p.payload()[..count].copy_from_slice(&data[sent..sent + count]);
            tracing::debug!(count, "sending next chunk block");

            p.send_request();
            if !p.wait_response("dispatch/effSetChunk", None) {
                return 0;
            }
            sent += count;
        }

        let frame = p.frame();
        frame.set_command(Command::Dispatch);
        frame.opcode = op::SET_CHUNK;
        frame.index = is_preset;
        frame.value = total as isize;
        p.send_request();
        if !p.wait_response("dispatch/effSetChunk write", None) {
            return 0;
        }

        tracing::debug!(total, "chunk write complete");
        p.frame().value
    }
}
