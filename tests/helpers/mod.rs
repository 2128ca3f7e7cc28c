//! Test harness: an in-process child endpoint speaking the responder side
//! of the wire protocol, plus a recording host callback and embedder.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::os::raw::c_void;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use vst2_bridge::endpoint::{BridgeConfig, ChildHandle, HostLauncher};
use vst2_bridge::protocol::{Command, DataFrame, PluginInfo};
use vst2_bridge::vst2::{effect_opcode as op, host_opcode as cb, AEffect, ERect, VstTimeInfo};
use vst2_bridge::window::WindowEmbedder;
use vst2_bridge::{load, DataPort, DiscardEmbedder, FrameBuf, FrameQueue, Result};

/// Serializes tests: the recording host callback keeps global state.
pub static TEST_LOCK: Mutex<()> = Mutex::new(());

pub static MASTER_LOG: Mutex<Vec<(i32, i32, isize, f32)>> = Mutex::new(Vec::new());
pub static REENTRY_VALUES: Mutex<Vec<f32>> = Mutex::new(Vec::new());
pub static VENDOR_REPLY: &[u8] = b"BridgeWorks\0";

pub static TIME_INFO: VstTimeInfo = VstTimeInfo {
    sample_pos: 1024.0,
    sample_rate: 48000.0,
    nanoseconds: 0.0,
    ppq_pos: 4.0,
    tempo: 123.0,
    bar_start_pos: 0.0,
    cycle_start_pos: 0.0,
    cycle_end_pos: 0.0,
    time_sig_numerator: 4,
    time_sig_denominator: 4,
    smpte_offset: 0,
    smpte_frame_rate: 0,
    samples_to_next_clock: 0,
    flags: 0,
};

/// Host callback used by all tests: records every call, answers a few
/// opcodes with fixed data and re-enters getParameter from the automation
/// handler the way some hosts do.
pub extern "C" fn recording_master(
    effect: *mut AEffect,
    opcode: i32,
    index: i32,
    value: isize,
    ptr: *mut c_void,
    opt: f32,
) -> isize {
    MASTER_LOG.lock().push((opcode, index, value, opt));
    match opcode {
        cb::VERSION => 2400,
        cb::AUTOMATE => {
            // SAFETY: the bridge hands us its own live effect.
            let reentry = unsafe { ((*effect).get_parameter)(effect, index) };
            REENTRY_VALUES.lock().push(reentry);
            0
        }
        cb::GET_TIME => &TIME_INFO as *const VstTimeInfo as isize,
        cb::GET_VENDOR_STRING => {
            // SAFETY: ptr is the payload buffer of the callback port.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    VENDOR_REPLY.as_ptr(),
                    ptr as *mut u8,
                    VENDOR_REPLY.len(),
                );
            }
            1
        }
        cb::PROCESS_EVENTS => {
            // SAFETY: ptr is a rebuilt VstEvents list.
            unsafe {
                let events = ptr as *const vst2_bridge::vst2::VstEvents;
                let count = (*events).num_events as usize;
                let slots = (*events).events.as_ptr();
                let mut seen = Vec::with_capacity(count);
                for i in 0..count {
                    seen.push(**slots.add(i));
                }
                RECEIVED_EVENTS.lock().push(seen);
            }
            1
        }
        _ => 1,
    }
}

pub static RECEIVED_EVENTS: Mutex<Vec<Vec<vst2_bridge::vst2::VstEvent>>> = Mutex::new(Vec::new());

pub fn reset_master_log() {
    MASTER_LOG.lock().clear();
    REENTRY_VALUES.lock().clear();
    RECEIVED_EVENTS.lock().clear();
}

pub struct RecordingEmbedder {
    pub log: Arc<Mutex<Vec<String>>>,
}

impl WindowEmbedder for RecordingEmbedder {
    fn resize_parent(&self, parent: u64, width: u32, height: u32) {
        self.log
            .lock()
            .push(format!("resize_parent({parent}, {width}, {height})"));
    }

    fn reparent(&self, child: u64, parent: u64) {
        self.log.lock().push(format!("reparent({child}, {parent})"));
    }

    fn embedded_notify(&self, child: u64, parent: u64) {
        self.log
            .lock()
            .push(format!("embedded_notify({child}, {parent})"));
    }

    fn focus_out(&self, child: u64) {
        self.log.lock().push(format!("focus_out({child})"));
    }

    fn map(&self, child: u64) {
        self.log.lock().push(format!("map({child})"));
    }
}

/// Scripted child endpoint state plus everything it observed.
pub struct MockState {
    pub info: PluginInfo,
    pub edit_rect: ERect,
    pub child_window: u64,
    /// Data served by chunk reads; replaced by a completed chunk write.
    pub chunk: Mutex<Vec<u8>>,
    /// Never answer the handshake (setup-failure scripting).
    pub silent_handshake: AtomicBool,
    /// Dispatch opcodes that are received but never answered.
    pub silent_opcodes: Mutex<HashSet<i32>>,
    /// Payload bytes written for string-returning dispatches.
    pub string_replies: Mutex<HashMap<i32, Vec<u8>>>,

    pub handshake_count: AtomicU32,
    pub control_dispatches: Mutex<Vec<(i32, i32, isize, f32)>>,
    pub audio_dispatches: Mutex<Vec<i32>>,
    pub string_requests: Mutex<Vec<Vec<u8>>>,
    pub event_payloads: Mutex<Vec<(i32, Vec<u8>)>>,
    pub audio_port_sizes: Mutex<Vec<usize>>,
    pub get_parameter_calls: Mutex<Vec<i32>>,
    pub set_parameter_calls: Mutex<Vec<(i32, f32)>>,
    pub set_data_blocks: Mutex<Vec<usize>>,
    pub final_set_chunk: Mutex<Option<(i32, isize)>>,
    pub show_window_count: AtomicU32,
    pub callback_frame_size: Mutex<Option<usize>>,

    callback_port: Mutex<Option<DataPort>>,
    queue: Mutex<Option<FrameQueue>>,
    stop: AtomicBool,
}

impl MockState {
    pub fn new(info: PluginInfo) -> Arc<Self> {
        Arc::new(Self {
            info,
            edit_rect: ERect {
                top: 0,
                left: 0,
                bottom: 300,
                right: 400,
            },
            child_window: 0x00c0_ffee,
            chunk: Mutex::new(Vec::new()),
            silent_handshake: AtomicBool::new(false),
            silent_opcodes: Mutex::new(HashSet::new()),
            string_replies: Mutex::new(HashMap::new()),
            handshake_count: AtomicU32::new(0),
            control_dispatches: Mutex::new(Vec::new()),
            audio_dispatches: Mutex::new(Vec::new()),
            string_requests: Mutex::new(Vec::new()),
            event_payloads: Mutex::new(Vec::new()),
            audio_port_sizes: Mutex::new(Vec::new()),
            get_parameter_calls: Mutex::new(Vec::new()),
            set_parameter_calls: Mutex::new(Vec::new()),
            set_data_blocks: Mutex::new(Vec::new()),
            final_set_chunk: Mutex::new(None),
            show_window_count: AtomicU32::new(0),
            callback_frame_size: Mutex::new(None),
            callback_port: Mutex::new(None),
            queue: Mutex::new(None),
            stop: AtomicBool::new(false),
        })
    }

    pub fn dispatched_opcodes(&self) -> Vec<i32> {
        self.control_dispatches
            .lock()
            .iter()
            .map(|(opcode, ..)| *opcode)
            .collect()
    }

    /// Issue a synchronous callback from the "child" and return the
    /// bridge's answer plus a copy of the response payload.
    pub fn sync_callback(
        &self,
        opcode: i32,
        index: i32,
        value: isize,
        opt: f32,
        payload_in: &[u8],
    ) -> (isize, Vec<u8>) {
        let guard = self.callback_port.lock();
        let port = guard.as_ref().expect("callback port not connected");
        let frame = port.frame();
        frame.set_command(Command::AudioMaster);
        frame.opcode = opcode;
        frame.index = index;
        frame.value = value;
        frame.opt = opt;
        port.payload()[..payload_in.len()].copy_from_slice(payload_in);
        port.send_request();
        assert!(port.wait_response("mock sync callback", Some(Duration::from_secs(5))));
        (port.frame().value, port.payload().to_vec())
    }

    /// Queue an asynchronous callback the way the child's audio thread
    /// would: fire-and-forget through the kernel queue.
    pub fn async_callback(&self, opcode: i32, index: i32, value: isize, opt: f32) {
        let mut buf = FrameBuf::new();
        {
            let (frame, _) = buf.parts();
            frame.set_command(Command::AudioMaster);
            frame.opcode = opcode;
            frame.index = index;
            frame.value = value;
            frame.opt = opt;
        }
        let guard = self.queue.lock();
        guard.as_ref().expect("queue not connected").push_frame(&buf);
    }
}

pub struct MockLauncher {
    pub state: Arc<MockState>,
}

impl HostLauncher for MockLauncher {
    fn launch(&self, control_port_id: i32) -> Result<Box<dyn ChildHandle>> {
        let state = Arc::clone(&self.state);
        let thread = std::thread::spawn(move || control_loop(state, control_port_id));
        Ok(Box::new(MockChild {
            state: Arc::clone(&self.state),
            control_thread: Some(thread),
        }))
    }
}

pub struct MockChild {
    state: Arc<MockState>,
    control_thread: Option<JoinHandle<()>>,
}

impl ChildHandle for MockChild {
    fn kill(&mut self) {
        self.state.stop.store(true, Ordering::SeqCst);
    }

    fn wait(&mut self) {
        self.state.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.control_thread.take() {
            let _ = thread.join();
        }
    }
}

enum Action {
    Respond,
    Silent,
    RespondExit,
}

fn control_loop(state: Arc<MockState>, control_id: i32) {
    let mut control = DataPort::new();
    if control.connect(control_id).is_err() {
        return;
    }

    if !control.wait_request("mock handshake", Some(Duration::from_secs(5))) {
        return;
    }
    state.handshake_count.fetch_add(1, Ordering::SeqCst);
    if state.silent_handshake.load(Ordering::SeqCst) {
        return;
    }

    assert_eq!(control.frame().command(), Some(Command::HostInfo));
    let callback_id = control.frame().opcode;
    let mut callback = DataPort::new();
    if callback.connect(callback_id).is_ok() {
        *state.callback_frame_size.lock() = Some(callback.frame_size());
        *state.callback_port.lock() = Some(callback);
    }
    let queue = FrameQueue::new();
    if queue.connect(control_id).is_ok() {
        *state.queue.lock() = Some(queue);
    }

    // SAFETY: handshake response payload carries the plugin description.
    unsafe {
        std::ptr::write_unaligned(control.payload().as_mut_ptr() as *mut PluginInfo, state.info);
    }
    control.frame().set_command(Command::PluginInfo);
    control.send_response();

    let mut audio_threads: Vec<JoinHandle<()>> = Vec::new();
    let mut serve_offset = 0usize;
    let mut received = Vec::new();

    loop {
        if state.stop.load(Ordering::SeqCst) {
            break;
        }
        if !control.wait_request("mock control", Some(Duration::from_millis(10))) {
            if !control.is_connected() {
                break;
            }
            continue;
        }

        let action = handle_command(
            &state,
            &control,
            &mut serve_offset,
            &mut received,
            &mut audio_threads,
        );
        match action {
            Action::Silent => continue,
            Action::Respond => {
                control.frame().set_command(Command::Response);
                control.send_response();
            }
            Action::RespondExit => {
                control.frame().set_command(Command::Response);
                control.send_response();
                break;
            }
        }
    }

    state.stop.store(true, Ordering::SeqCst);
    for thread in audio_threads {
        let _ = thread.join();
    }
    *state.callback_port.lock() = None;
    *state.queue.lock() = None;
}

fn handle_command(
    state: &Arc<MockState>,
    port: &DataPort,
    serve_offset: &mut usize,
    received: &mut Vec<u8>,
    audio_threads: &mut Vec<JoinHandle<()>>,
) -> Action {
    let frame = port.frame();
    match frame.command() {
        Some(Command::Dispatch) => handle_dispatch(state, port, serve_offset, received, audio_threads),
        Some(Command::GetDataBlock) => {
            let chunk = state.chunk.lock();
            let want = frame.index as usize;
            let remaining = chunk.len() - *serve_offset;
            let count = want.min(remaining);
            port.payload()[..count].copy_from_slice(&chunk[*serve_offset..*serve_offset + count]);
            frame.index = count as i32;
            *serve_offset += count;
            Action::Respond
        }
        Some(Command::SetDataBlock) => {
            let count = frame.index as usize;
            state.set_data_blocks.lock().push(count);
            received.extend_from_slice(&port.payload()[..count]);
            Action::Respond
        }
        Some(Command::ShowWindow) => {
            state.show_window_count.fetch_add(1, Ordering::SeqCst);
            Action::Respond
        }
        other => {
            panic!("mock control port received unexpected command {other:?}");
        }
    }
}

fn handle_dispatch(
    state: &Arc<MockState>,
    port: &DataPort,
    serve_offset: &mut usize,
    received: &mut Vec<u8>,
    audio_threads: &mut Vec<JoinHandle<()>>,
) -> Action {
    let frame = port.frame();
    let opcode = frame.opcode;
    state
        .control_dispatches
        .lock()
        .push((opcode, frame.index, frame.value, frame.opt));

    if state.silent_opcodes.lock().contains(&opcode) {
        return Action::Silent;
    }

    match opcode {
        op::SET_BLOCK_SIZE => {
            let mut audio = DataPort::new();
            if audio.connect(frame.index).is_ok() {
                state.audio_port_sizes.lock().push(audio.frame_size());
                let audio_state = Arc::clone(state);
                audio_threads.push(std::thread::spawn(move || audio_loop(audio_state, audio)));
            }
            frame.value = 1;
        }

        op::GET_CHUNK => {
            let chunk = state.chunk.lock();
            let block_size = frame.value as usize;
            if chunk.is_empty() {
                frame.value = 0;
                frame.index = 0;
            } else {
                let count = block_size.min(chunk.len());
                port.payload()[..count].copy_from_slice(&chunk[..count]);
                frame.value = chunk.len() as isize;
                frame.index = count as i32;
                *serve_offset = count;
            }
        }

        op::SET_CHUNK => {
            *state.final_set_chunk.lock() = Some((frame.index, frame.value));
            *state.chunk.lock() = std::mem::take(received);
            frame.value = 1;
        }

        op::EDIT_OPEN => {
            // SAFETY: payload is large enough for an ERect.
            unsafe {
                std::ptr::write_unaligned(
                    port.payload().as_mut_ptr() as *mut ERect,
                    state.edit_rect,
                );
            }
            frame.value = state.child_window as isize;
        }

        op::EDIT_GET_RECT => {
            // SAFETY: see EDIT_OPEN.
            unsafe {
                std::ptr::write_unaligned(
                    port.payload().as_mut_ptr() as *mut ERect,
                    state.edit_rect,
                );
            }
            frame.value = 1;
        }

        op::SET_PROGRAM_NAME | op::CAN_DO => {
            let payload = port.payload();
            let end = payload.iter().position(|&b| b == 0).unwrap_or(0);
            state.string_requests.lock().push(payload[..end].to_vec());
            frame.value = 1;
        }

        op::PROCESS_EVENTS => {
            let count = frame.index;
            let bytes = count as usize * std::mem::size_of::<vst2_bridge::vst2::VstEvent>();
            state
                .event_payloads
                .lock()
                .push((count, port.payload()[..bytes].to_vec()));
            frame.value = 1;
        }

        op::CLOSE => {
            frame.value = 1;
            return Action::RespondExit;
        }

        _ => {
            if let Some(reply) = state.string_replies.lock().get(&opcode) {
                port.payload()[..reply.len()].copy_from_slice(reply);
            }
            frame.value = 1;
        }
    }

    Action::Respond
}

fn audio_loop(state: Arc<MockState>, audio: DataPort) {
    while !state.stop.load(Ordering::SeqCst) {
        if !audio.wait_request("mock audio", Some(Duration::from_millis(10))) {
            continue;
        }
        let frame = audio.frame();
        match frame.command() {
            Some(Command::ProcessSingle) => {
                let samples = frame.value as usize * state.info.output_count as usize;
                // SAFETY: the payload was sized for the negotiated block.
                let data = unsafe {
                    std::slice::from_raw_parts_mut(audio.payload().as_mut_ptr() as *mut f32, samples)
                };
                for sample in data {
                    *sample *= 2.0;
                }
            }
            Some(Command::ProcessDouble) => {
                let samples = frame.value as usize * state.info.output_count as usize;
                // SAFETY: see ProcessSingle.
                let data = unsafe {
                    std::slice::from_raw_parts_mut(audio.payload().as_mut_ptr() as *mut f64, samples)
                };
                for sample in data {
                    *sample *= 2.0;
                }
            }
            Some(Command::GetParameter) => {
                state.get_parameter_calls.lock().push(frame.index);
                frame.opt = frame.index as f32 * 0.5;
            }
            Some(Command::SetParameter) => {
                state
                    .set_parameter_calls
                    .lock()
                    .push((frame.index, frame.opt));
            }
            Some(Command::Dispatch) => {
                state.audio_dispatches.lock().push(frame.opcode);
                frame.value = 1;
            }
            other => {
                panic!("mock audio port received unexpected command {other:?}");
            }
        }
        frame.set_command(Command::Response);
        audio.send_response();
    }
}

pub fn default_info() -> PluginInfo {
    PluginInfo {
        flags: 0x10,
        program_count: 4,
        param_count: 16,
        input_count: 2,
        output_count: 2,
        initial_delay: 0,
        unique_id: 0xdead_beef_u32 as i32,
        version: 1000,
    }
}

pub fn test_config() -> BridgeConfig {
    BridgeConfig {
        soft_limit: Duration::from_secs(5),
        edit_open_settle: Duration::from_millis(1),
        ..Default::default()
    }
}

/// Load a bridged effect against the mock child with the default embedder.
pub fn load_mock(state: &Arc<MockState>, config: BridgeConfig) -> *mut AEffect {
    let launcher = MockLauncher {
        state: Arc::clone(state),
    };
    load(&launcher, Box::new(DiscardEmbedder), recording_master, config)
        .expect("bridge load failed")
}

/// Drive the close path; the effect pointer is invalid afterwards.
pub fn close(effect: *mut AEffect) {
    // SAFETY: mirrors what a host does at plugin teardown.
    unsafe {
        ((*effect).dispatcher)(effect, op::CLOSE, 0, 0, std::ptr::null_mut(), 0.0);
    }
}

pub fn dispatch(effect: *mut AEffect, opcode: i32, index: i32, value: isize, ptr: *mut c_void, opt: f32) -> isize {
    // SAFETY: test-side host driving the effect.
    unsafe { ((*effect).dispatcher)(effect, opcode, index, value, ptr, opt) }
}

pub fn payload_budget(config: &BridgeConfig) -> usize {
    config.control_frame_size - std::mem::size_of::<DataFrame>()
}
