//! Minimal VST 2.4 ABI surface.
//!
//! The bridge core treats these as opaque wire layouts: it never interprets
//! the DSP side of the API, it only moves the structures between the native
//! host and the child process. Layouts follow the published 2.4 headers.

use std::os::raw::c_void;

pub const EFFECT_MAGIC: i32 = 0x5673_7450; // 'VstP'

pub const MAX_PROG_NAME_LEN: usize = 24;
pub const MAX_VENDOR_STR_LEN: usize = 64;
pub const MAX_PRODUCT_STR_LEN: usize = 64;
pub const MAX_EFFECT_NAME_LEN: usize = 32;
/// Extended parameter-string cap (terminator included). Many plugins write
/// past the official 8-byte limit, so copies stop at 24 bytes instead.
pub const EXT_MAX_PARAM_STR_LEN: usize = 24;

pub type DispatcherProc = extern "C" fn(
    effect: *mut AEffect,
    opcode: i32,
    index: i32,
    value: isize,
    ptr: *mut c_void,
    opt: f32,
) -> isize;

pub type HostCallbackProc = extern "C" fn(
    effect: *mut AEffect,
    opcode: i32,
    index: i32,
    value: isize,
    ptr: *mut c_void,
    opt: f32,
) -> isize;

pub type GetParameterProc = extern "C" fn(effect: *mut AEffect, index: i32) -> f32;
pub type SetParameterProc = extern "C" fn(effect: *mut AEffect, index: i32, value: f32);

pub type ProcessProc =
    extern "C" fn(effect: *mut AEffect, inputs: *mut *mut f32, outputs: *mut *mut f32, frames: i32);
pub type ProcessDoubleProc =
    extern "C" fn(effect: *mut AEffect, inputs: *mut *mut f64, outputs: *mut *mut f64, frames: i32);

#[repr(C)]
pub struct AEffect {
    pub magic: i32,
    pub dispatcher: DispatcherProc,
    pub process: Option<ProcessProc>,
    pub set_parameter: SetParameterProc,
    pub get_parameter: GetParameterProc,
    pub num_programs: i32,
    pub num_params: i32,
    pub num_inputs: i32,
    pub num_outputs: i32,
    pub flags: i32,
    pub resvd1: isize,
    pub resvd2: isize,
    pub initial_delay: i32,
    pub real_qualities: i32,
    pub off_qualities: i32,
    pub io_ratio: f32,
    pub object: *mut c_void,
    pub user: *mut c_void,
    pub unique_id: i32,
    pub version: i32,
    pub process_replacing: ProcessProc,
    pub process_double_replacing: ProcessDoubleProc,
    pub future: [u8; 56],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ERect {
    pub top: i16,
    pub left: i16,
    pub bottom: i16,
    pub right: i16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VstTimeInfo {
    pub sample_pos: f64,
    pub sample_rate: f64,
    pub nanoseconds: f64,
    pub ppq_pos: f64,
    pub tempo: f64,
    pub bar_start_pos: f64,
    pub cycle_start_pos: f64,
    pub cycle_end_pos: f64,
    pub time_sig_numerator: i32,
    pub time_sig_denominator: i32,
    pub smpte_offset: i32,
    pub smpte_frame_rate: i32,
    pub samples_to_next_clock: i32,
    pub flags: i32,
}

/// Fixed-size base event record. Larger event kinds (SysEx) carry pointers
/// and cannot cross the process boundary; the bridge moves base records only.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VstEvent {
    pub event_type: i32,
    pub byte_size: i32,
    pub delta_frames: i32,
    pub flags: i32,
    pub data: [u8; 16],
}

#[repr(C)]
pub struct VstEvents {
    pub num_events: i32,
    pub reserved: isize,
    /// Flexible array member; hosts allocate past the declared two slots.
    pub events: [*mut VstEvent; 2],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VstParameterProperties {
    pub step_float: f32,
    pub small_step_float: f32,
    pub large_step_float: f32,
    pub label: [u8; 64],
    pub flags: i32,
    pub min_integer: i32,
    pub max_integer: i32,
    pub step_integer: i32,
    pub large_step_integer: i32,
    pub short_label: [u8; 8],
    pub display_index: i16,
    pub category: i16,
    pub num_parameters_in_category: i16,
    pub reserved: i16,
    pub category_label: [u8; 24],
    pub future: [u8; 16],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VstPinProperties {
    pub label: [u8; 64],
    pub flags: i32,
    pub arrangement_type: i32,
    pub short_label: [u8; 8],
    pub future: [u8; 48],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VstPatchChunkInfo {
    pub version: i32,
    pub plugin_unique_id: i32,
    pub plugin_version: i32,
    pub num_elements: i32,
    pub future: [u8; 48],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VstSpeakerProperties {
    pub azimuth: f32,
    pub elevation: f32,
    pub radius: f32,
    pub reserved: f32,
    pub name: [u8; 64],
    pub speaker_type: i32,
    pub future: [u8; 28],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VstSpeakerArrangement {
    pub arrangement_type: i32,
    pub num_channels: i32,
    pub speakers: [VstSpeakerProperties; 8],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct MidiKeyName {
    pub this_program_index: i32,
    pub this_key_number: i32,
    pub key_name: [u8; 64],
    pub reserved: i32,
    pub flags: i32,
}

/// Effect (plugin-side) dispatcher opcodes.
pub mod effect_opcode {
    pub const OPEN: i32 = 0;
    pub const CLOSE: i32 = 1;
    pub const SET_PROGRAM: i32 = 2;
    pub const GET_PROGRAM: i32 = 3;
    pub const SET_PROGRAM_NAME: i32 = 4;
    pub const GET_PROGRAM_NAME: i32 = 5;
    pub const GET_PARAM_LABEL: i32 = 6;
    pub const GET_PARAM_DISPLAY: i32 = 7;
    pub const GET_PARAM_NAME: i32 = 8;
    pub const SET_SAMPLE_RATE: i32 = 10;
    pub const SET_BLOCK_SIZE: i32 = 11;
    pub const MAINS_CHANGED: i32 = 12;
    pub const EDIT_GET_RECT: i32 = 13;
    pub const EDIT_OPEN: i32 = 14;
    pub const EDIT_CLOSE: i32 = 15;
    pub const EDIT_IDLE: i32 = 19;
    pub const IDENTIFY_DEPRECATED: i32 = 22;
    pub const GET_CHUNK: i32 = 23;
    pub const SET_CHUNK: i32 = 24;
    pub const PROCESS_EVENTS: i32 = 25;
    pub const CAN_BE_AUTOMATED: i32 = 26;
    pub const GET_PROGRAM_NAME_INDEXED: i32 = 29;
    pub const CONNECT_INPUT_DEPRECATED: i32 = 31;
    pub const CONNECT_OUTPUT_DEPRECATED: i32 = 32;
    pub const GET_INPUT_PROPERTIES: i32 = 33;
    pub const GET_OUTPUT_PROPERTIES: i32 = 34;
    pub const GET_PLUG_CATEGORY: i32 = 35;
    pub const SET_SPEAKER_ARRANGEMENT: i32 = 42;
    pub const GET_EFFECT_NAME: i32 = 45;
    pub const GET_VENDOR_STRING: i32 = 47;
    pub const GET_PRODUCT_STRING: i32 = 48;
    pub const GET_VENDOR_VERSION: i32 = 49;
    pub const CAN_DO: i32 = 51;
    pub const GET_TAIL_SIZE: i32 = 52;
    pub const GET_PARAMETER_PROPERTIES: i32 = 56;
    pub const KEYS_REQUIRED_DEPRECATED: i32 = 57;
    pub const GET_VST_VERSION: i32 = 58;
    pub const SET_EDIT_KNOB_MODE: i32 = 61;
    pub const GET_MIDI_KEY_NAME: i32 = 66;
    pub const BEGIN_SET_PROGRAM: i32 = 67;
    pub const END_SET_PROGRAM: i32 = 68;
    pub const SHELL_GET_NEXT_PLUGIN: i32 = 70;
    pub const START_PROCESS: i32 = 71;
    pub const STOP_PROCESS: i32 = 72;
    pub const SET_PAN_LAW: i32 = 74;
    pub const BEGIN_LOAD_BANK: i32 = 75;
    pub const BEGIN_LOAD_PROGRAM: i32 = 76;
    pub const GET_NUM_MIDI_INPUT_CHANNELS: i32 = 78;
    pub const GET_NUM_MIDI_OUTPUT_CHANNELS: i32 = 79;
}

/// Host (audioMaster) callback opcodes.
pub mod host_opcode {
    pub const AUTOMATE: i32 = 0;
    pub const VERSION: i32 = 1;
    pub const CURRENT_ID: i32 = 2;
    pub const IDLE: i32 = 3;
    pub const WANT_MIDI_DEPRECATED: i32 = 6;
    pub const GET_TIME: i32 = 7;
    pub const PROCESS_EVENTS: i32 = 8;
    pub const IO_CHANGED: i32 = 13;
    pub const NEED_IDLE_DEPRECATED: i32 = 14;
    pub const SIZE_WINDOW: i32 = 15;
    pub const GET_SAMPLE_RATE: i32 = 16;
    pub const GET_BLOCK_SIZE: i32 = 17;
    pub const GET_INPUT_LATENCY: i32 = 18;
    pub const GET_OUTPUT_LATENCY: i32 = 19;
    pub const GET_CURRENT_PROCESS_LEVEL: i32 = 23;
    pub const GET_AUTOMATION_STATE: i32 = 24;
    pub const GET_VENDOR_STRING: i32 = 32;
    pub const GET_PRODUCT_STRING: i32 = 33;
    pub const GET_VENDOR_VERSION: i32 = 34;
    pub const CAN_DO: i32 = 37;
    pub const UPDATE_DISPLAY: i32 = 42;
    pub const BEGIN_EDIT: i32 = 43;
    pub const END_EDIT: i32 = 44;
}
