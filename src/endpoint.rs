//! Plugin-side bridge endpoint.
//!
//! [`load`] creates the three transports, starts the child process through
//! a [`HostLauncher`], performs the handshake and hands the native host a
//! heap-allocated `AEffect` whose function pointers route back into the
//! bridge. Teardown is driven by the host sending `effClose`: the dispatch
//! trampoline forwards it to the child, releases the port guard and only
//! then drops the owning endpoint.

use crate::data_port::DataPort;
use crate::error::{BridgeError, Result};
use crate::frame_queue::{FrameQueue, CALLBACK_FRAME_SIZE};
use crate::protocol::{Command, PluginInfo, CONTROL_FRAME_SIZE};
use crate::vst2::{self, effect_opcode as op, AEffect, ERect, HostCallbackProc};
use crate::window::WindowEmbedder;
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::RefCell;
use std::os::raw::c_void;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Frame size of the control port.
    pub control_frame_size: usize,
    /// Bound applied to caller-unbounded semaphore waits.
    pub soft_limit: Duration,
    /// Poll quantum of the callback pump; bounds shutdown latency.
    pub pump_poll: Duration,
    /// Settle delay on both sides of the editor reparenting dance. Without
    /// it some editors come up black; the race is in the foreign runtime.
    pub edit_open_settle: Duration,
    /// Block size pre-provisioned for the audio port right after `effOpen`.
    pub preprovision_frames: isize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            control_frame_size: CONTROL_FRAME_SIZE,
            soft_limit: crate::data_port::DEFAULT_SOFT_LIMIT,
            pump_poll: Duration::from_millis(100),
            edit_open_settle: Duration::from_millis(100),
            preprovision_frames: 256,
        }
    }
}

/// Handle on the running child process.
pub trait ChildHandle: Send {
    fn kill(&mut self);
    fn wait(&mut self);
}

impl ChildHandle for std::process::Child {
    fn kill(&mut self) {
        let _ = std::process::Child::kill(self);
    }

    fn wait(&mut self) {
        let _ = std::process::Child::wait(self);
    }
}

/// Starts the host endpoint once the control port exists. The launcher is
/// told only the control port id; everything else the child needs travels
/// over the wire protocol.
pub trait HostLauncher {
    fn launch(&self, control_port_id: i32) -> Result<Box<dyn ChildHandle>>;
}

/// Production launcher: runs the foreign-ABI loader through its wrapper
/// script with the runtime prefix and loader selected via environment.
pub struct LoaderLauncher {
    pub host_script: PathBuf,
    pub vst_path: PathBuf,
    pub prefix_path: PathBuf,
    pub loader_path: PathBuf,
    pub log_level: u32,
    pub log_socket_path: PathBuf,
}

impl HostLauncher for LoaderLauncher {
    fn launch(&self, control_port_id: i32) -> Result<Box<dyn ChildHandle>> {
        let child = std::process::Command::new("/bin/sh")
            .arg(&self.host_script)
            .arg(&self.vst_path)
            .arg(control_port_id.to_string())
            .arg(self.log_level.to_string())
            .arg(&self.log_socket_path)
            .env("WINEPREFIX", &self.prefix_path)
            .env("WINELOADER", &self.loader_path)
            .spawn()
            .map_err(|e| {
                BridgeError::Spawn(format!("{}: {}", self.host_script.display(), e))
            })?;
        tracing::debug!(pid = child.id(), "host endpoint started");
        Ok(Box::new(child))
    }
}

pub(crate) struct AutomateEntry {
    pub(crate) thread: ThreadId,
    pub(crate) index: i32,
    pub(crate) value: f32,
}

/// State shared between the host's threads and the callback pump.
pub(crate) struct Shared {
    pub(crate) master: HostCallbackProc,
    pub(crate) effect: *mut AEffect,
    pub(crate) config: BridgeConfig,
    pub(crate) embedder: Box<dyn WindowEmbedder>,
    /// Main-thread dispatches and the handshake.
    pub(crate) control: ReentrantMutex<RefCell<DataPort>>,
    /// `process*`, parameter access and off-main-thread dispatches.
    pub(crate) audio: ReentrantMutex<RefCell<DataPort>>,
    /// Serviced exclusively by the pump thread.
    pub(crate) callback_port: Mutex<DataPort>,
    pub(crate) frame_queue: FrameQueue,
    /// Chunk assembled by `effGetChunk`; the caller receives a pointer into
    /// this buffer, valid until the next chunk transfer.
    pub(crate) chunk: Mutex<Vec<u8>>,
    /// Editor rectangle handed out by `effEditGetRect`.
    pub(crate) rect: Mutex<ERect>,
    /// Automated parameter remembered across the re-entrant `getParameter`
    /// some hosts issue from inside their automation handler.
    pub(crate) automate: Mutex<Option<AutomateEntry>>,
    pub(crate) main_thread: ThreadId,
    pub(crate) pump_run: AtomicBool,
}

// SAFETY: the raw effect pointer is written only under defined protocol
// points (construction, IOChanged) and the host owns its read side; all
// other state is behind locks or is Sync itself.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

/// Owns the child process, the pump thread and the shared state. Lives
/// boxed behind `AEffect::object`; destroyed by the `effClose` dispatch.
pub struct PluginEndpoint {
    pub(crate) shared: Arc<Shared>,
    pump: Option<JoinHandle<()>>,
    child: Option<Box<dyn ChildHandle>>,
}

impl Drop for PluginEndpoint {
    fn drop(&mut self) {
        tracing::trace!("waiting for callback pump termination");
        self.shared.pump_run.store(false, Ordering::Release);
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }

        self.shared.control.lock().borrow_mut().disconnect();
        self.shared.callback_port.lock().disconnect();
        self.shared.audio.lock().borrow_mut().disconnect();

        tracing::trace!("waiting for host endpoint termination");
        if let Some(mut child) = self.child.take() {
            child.wait();
        }

        // SAFETY: load() allocated the effect; after effClose the host must
        // not touch it again.
        unsafe {
            drop(Box::from_raw(self.shared.effect));
        }
        tracing::trace!("plugin endpoint terminated");
    }
}

pub(crate) unsafe fn apply_info(effect: *mut AEffect, info: &PluginInfo) {
    (*effect).flags = info.flags;
    (*effect).num_programs = info.program_count;
    (*effect).num_params = info.param_count;
    (*effect).num_inputs = info.input_count;
    (*effect).num_outputs = info.output_count;
    (*effect).initial_delay = info.initial_delay;
    (*effect).unique_id = info.unique_id;
    (*effect).version = info.version;
}

fn new_effect() -> *mut AEffect {
    Box::into_raw(Box::new(AEffect {
        magic: vst2::EFFECT_MAGIC,
        dispatcher: dispatch_proc,
        process: None,
        set_parameter: set_parameter_proc,
        get_parameter: get_parameter_proc,
        num_programs: 0,
        num_params: 0,
        num_inputs: 0,
        num_outputs: 0,
        flags: 0,
        resvd1: 0,
        resvd2: 0,
        initial_delay: 0,
        real_qualities: 0,
        off_qualities: 0,
        io_ratio: 0.0,
        object: std::ptr::null_mut(),
        user: std::ptr::null_mut(),
        unique_id: 0,
        version: 0,
        process_replacing: process_replacing_proc,
        process_double_replacing: process_double_replacing_proc,
        future: [0; 56],
    }))
}

/// Bring up the bridge and return the effect the native host will drive.
///
/// On any setup failure the child is reaped, the transports are released
/// and an error is returned; callers at the foreign-ABI entry point map
/// that to a null effect pointer.
pub fn load(
    launcher: &dyn HostLauncher,
    embedder: Box<dyn WindowEmbedder>,
    master: HostCallbackProc,
    config: BridgeConfig,
) -> Result<*mut AEffect> {
    let main_thread = thread::current().id();
    tracing::debug!(?main_thread, "loading bridged plugin");

    let mut control = DataPort::new();
    control.set_soft_limit(config.soft_limit);
    control.create(config.control_frame_size)?;
    let control_id = control.id();

    let mut callback = DataPort::new();
    callback.set_soft_limit(config.soft_limit);
    callback.create(CALLBACK_FRAME_SIZE)?;
    let callback_id = callback.id();

    let mut child = launcher.launch(control_id)?;

    let effect = new_effect();

    let shared = Arc::new(Shared {
        master,
        effect,
        config,
        embedder,
        control: ReentrantMutex::new(RefCell::new(control)),
        audio: ReentrantMutex::new(RefCell::new(DataPort::new())),
        callback_port: Mutex::new(callback),
        frame_queue: FrameQueue::new(),
        chunk: Mutex::new(Vec::new()),
        rect: Mutex::new(ERect::default()),
        automate: Mutex::new(None),
        main_thread,
        pump_run: AtomicBool::new(true),
    });

    let (ready_tx, ready_rx) = mpsc::channel();
    let pump_shared = Arc::clone(&shared);
    let pump = match thread::Builder::new()
        .name("bridge-callbacks".to_string())
        .spawn(move || crate::callbacks::pump_loop(pump_shared, ready_tx))
    {
        Ok(pump) => pump,
        Err(e) => {
            child.kill();
            child.wait();
            // SAFETY: nothing else refers to the effect yet.
            unsafe { drop(Box::from_raw(effect)) };
            return Err(e.into());
        }
    };
    let _ = ready_rx.recv();

    let info = {
        let guard = shared.control.lock();
        let port = guard.borrow();
        let frame = port.frame();
        frame.set_command(Command::HostInfo);
        frame.opcode = callback_id;
        frame.index = 0;
        frame.value = 0;
        frame.opt = 0.0;
        port.send_request();

        tracing::trace!("waiting for host endpoint response");
        if port.wait_response("PluginEndpoint::load", None) {
            // SAFETY: the handshake response payload carries a PluginInfo.
            Some(unsafe { std::ptr::read_unaligned(port.payload().as_ptr() as *const PluginInfo) })
        } else {
            None
        }
    };

    let info = match info {
        Some(info) => info,
        None => {
            tracing::error!("host endpoint is not responding");
            child.kill();
            abort_load(&shared, pump, child, effect);
            return Err(BridgeError::HandshakeTimeout);
        }
    };

    // The control segment id keys the async callback queue as well; one id
    // spans both kernel namespaces without extra negotiation.
    if let Err(e) = shared.frame_queue.connect(control_id) {
        child.kill();
        abort_load(&shared, pump, child, effect);
        return Err(e);
    }

    // SAFETY: the effect is not yet visible to the host.
    unsafe { apply_info(effect, &info) };

    tracing::debug!(
        flags = format_args!("{:#010x}", info.flags),
        programs = info.program_count,
        params = info.param_count,
        inputs = info.input_count,
        outputs = info.output_count,
        initial_delay = info.initial_delay,
        unique_id = format_args!("{:#010x}", info.unique_id),
        version = info.version,
        "bridged plugin summary"
    );

    let endpoint = Box::new(PluginEndpoint {
        shared,
        pump: Some(pump),
        child: Some(child),
    });
    // SAFETY: still exclusive access; the host receives the pointer next.
    unsafe {
        (*effect).object = Box::into_raw(endpoint) as *mut c_void;
    }
    Ok(effect)
}

fn abort_load(
    shared: &Arc<Shared>,
    pump: JoinHandle<()>,
    mut child: Box<dyn ChildHandle>,
    effect: *mut AEffect,
) {
    shared.pump_run.store(false, Ordering::Release);
    let _ = pump.join();
    child.wait();
    // SAFETY: the effect never reached the host.
    unsafe { drop(Box::from_raw(effect)) };
}

extern "C" fn dispatch_proc(
    effect: *mut AEffect,
    opcode: i32,
    index: i32,
    value: isize,
    ptr: *mut c_void,
    opt: f32,
) -> isize {
    // SAFETY: object is the boxed endpoint installed by load().
    let object = unsafe { (*effect).object };
    let endpoint = unsafe { &*(object as *const PluginEndpoint) };
    let shared = &endpoint.shared;

    // Most hosts dispatch UI work on the construction thread; anything else
    // rides the audio port so it cannot stall DSP behind UI traffic. The
    // exception is effEditOpen, which some hosts send from a worker thread
    // but which the child must service on its own main thread.
    let result = if opcode == op::EDIT_OPEN || thread::current().id() == shared.main_thread {
        let guard = shared.control.lock();
        shared.dispatch(&guard, opcode, index, value, ptr, opt)
    } else {
        let guard = shared.audio.lock();
        shared.dispatch(&guard, opcode, index, value, ptr, opt)
    };

    // Two-phase teardown: the close reply has been received and the port
    // guard released above; only now is the endpoint itself reclaimed.
    if opcode == op::CLOSE {
        // SAFETY: the host relinquishes the effect with effClose; no other
        // call can be in flight per the VST threading contract.
        unsafe { drop(Box::from_raw(object as *mut PluginEndpoint)) };
    }

    result
}

extern "C" fn get_parameter_proc(effect: *mut AEffect, index: i32) -> f32 {
    // SAFETY: see dispatch_proc.
    let endpoint = unsafe { &*((*effect).object as *const PluginEndpoint) };
    endpoint.shared.get_parameter(index)
}

extern "C" fn set_parameter_proc(effect: *mut AEffect, index: i32, value: f32) {
    // SAFETY: see dispatch_proc.
    let endpoint = unsafe { &*((*effect).object as *const PluginEndpoint) };
    endpoint.shared.set_parameter(index, value);
}

extern "C" fn process_replacing_proc(
    effect: *mut AEffect,
    inputs: *mut *mut f32,
    outputs: *mut *mut f32,
    frames: i32,
) {
    // SAFETY: see dispatch_proc.
    let endpoint = unsafe { &*((*effect).object as *const PluginEndpoint) };
    endpoint.shared.process_replacing(inputs, outputs, frames);
}

extern "C" fn process_double_replacing_proc(
    effect: *mut AEffect,
    inputs: *mut *mut f64,
    outputs: *mut *mut f64,
    frames: i32,
) {
    // SAFETY: see dispatch_proc.
    let endpoint = unsafe { &*((*effect).object as *const PluginEndpoint) };
    endpoint.shared.process_double_replacing(inputs, outputs, frames);
}
