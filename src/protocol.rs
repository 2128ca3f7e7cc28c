//! Wire protocol shared by both bridge endpoints.
//!
//! Every transaction on a data port rewrites a single [`DataFrame`] in
//! place: the requester fills it and posts `request`, the responder
//! overwrites it and posts `response`. The variable payload lives directly
//! after the header, bounded by the port's frame size.

use std::os::raw::c_char;

/// Frame discriminator. The numeric values are wire-stable: both endpoints
/// are built against the same layout.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    HostInfo = 0,
    PluginInfo = 1,
    Dispatch = 2,
    GetParameter = 3,
    SetParameter = 4,
    ProcessSingle = 5,
    ProcessDouble = 6,
    ShowWindow = 7,
    GetDataBlock = 8,
    SetDataBlock = 9,
    AudioMaster = 10,
    Response = 11,
}

impl Command {
    pub fn from_raw(raw: u32) -> Option<Command> {
        Some(match raw {
            0 => Command::HostInfo,
            1 => Command::PluginInfo,
            2 => Command::Dispatch,
            3 => Command::GetParameter,
            4 => Command::SetParameter,
            5 => Command::ProcessSingle,
            6 => Command::ProcessDouble,
            7 => Command::ShowWindow,
            8 => Command::GetDataBlock,
            9 => Command::SetDataBlock,
            10 => Command::AudioMaster,
            11 => Command::Response,
            _ => return None,
        })
    }
}

/// Fixed frame header. `index` doubles as a byte count during chunked
/// transfers and `value` doubles as a return channel on responses.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DataFrame {
    pub command: u32,
    pub opcode: i32,
    pub index: i32,
    pub value: isize,
    pub opt: f32,
}

impl DataFrame {
    pub fn command(&self) -> Option<Command> {
        Command::from_raw(self.command)
    }

    pub fn set_command(&mut self, command: Command) {
        self.command = command as u32;
    }
}

/// Effect description carried by the handshake response and by
/// `IOChanged` callbacks.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PluginInfo {
    pub flags: i32,
    pub program_count: i32,
    pub param_count: i32,
    pub input_count: i32,
    pub output_count: i32,
    pub initial_delay: i32,
    pub unique_id: i32,
    pub version: i32,
}

/// Frame size of the control port. Large enough for every fixed-size
/// dispatch payload and for a useful chunk-transfer block.
pub const CONTROL_FRAME_SIZE: usize = 65536;

/// Copy a NUL-terminated C string from `src` into `dst`, truncating to the
/// buffer and always terminating.
///
/// # Safety
///
/// `dst` must point to at least `cap` writable bytes and `src` must be a
/// valid NUL-terminated string.
pub unsafe fn copy_cstr_out(dst: *mut c_char, src: &[u8], cap: usize) {
    if cap == 0 {
        return;
    }
    let mut i = 0;
    while i < cap - 1 && i < src.len() && src[i] != 0 {
        *dst.add(i) = src[i] as c_char;
        i += 1;
    }
    *dst.add(i) = 0;
}

/// Copy the caller's NUL-terminated string into a payload buffer,
/// truncating to the buffer and always terminating.
///
/// # Safety
///
/// `src` must be a valid NUL-terminated string.
pub unsafe fn copy_cstr_in(dst: &mut [u8], src: *const c_char) {
    if dst.is_empty() {
        return;
    }
    if src.is_null() {
        dst[0] = 0;
        return;
    }
    let mut i = 0;
    while i < dst.len() - 1 {
        let b = *src.add(i) as u8;
        if b == 0 {
            break;
        }
        dst[i] = b;
        i += 1;
    }
    dst[i] = 0;
}
