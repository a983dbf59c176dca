//! Core request opcodes handled by the kernel

pub const CREATE_WINDOW: u8 = 1;
pub const DESTROY_WINDOW: u8 = 4;
pub const DESTROY_SUBWINDOWS: u8 = 5;
pub const SET_SELECTION_OWNER: u8 = 22;
pub const GET_SELECTION_OWNER: u8 = 23;
pub const GRAB_SERVER: u8 = 36;
pub const UNGRAB_SERVER: u8 = 37;
pub const GET_INPUT_FOCUS: u8 = 43;
pub const CREATE_PIXMAP: u8 = 53;
pub const FREE_PIXMAP: u8 = 54;
pub const CREATE_GC: u8 = 55;
pub const FREE_GC: u8 = 60;
pub const QUERY_EXTENSION: u8 = 98;
pub const LIST_EXTENSIONS: u8 = 99;
pub const SET_CLOSE_DOWN_MODE: u8 = 112;
pub const KILL_CLIENT: u8 = 113;
pub const NO_OPERATION: u8 = 127;

/// First major opcode available to extensions
pub const EXTENSION_BASE: u8 = 128;

/// Human readable name of a core opcode, for logging
pub fn name(major: u8) -> &'static str {
    match major {
        CREATE_WINDOW => "CreateWindow",
        DESTROY_WINDOW => "DestroyWindow",
        DESTROY_SUBWINDOWS => "DestroySubwindows",
        SET_SELECTION_OWNER => "SetSelectionOwner",
        GET_SELECTION_OWNER => "GetSelectionOwner",
        GRAB_SERVER => "GrabServer",
        UNGRAB_SERVER => "UngrabServer",
        GET_INPUT_FOCUS => "GetInputFocus",
        CREATE_PIXMAP => "CreatePixmap",
        FREE_PIXMAP => "FreePixmap",
        CREATE_GC => "CreateGC",
        FREE_GC => "FreeGC",
        QUERY_EXTENSION => "QueryExtension",
        LIST_EXTENSIONS => "ListExtensions",
        SET_CLOSE_DOWN_MODE => "SetCloseDownMode",
        KILL_CLIENT => "KillClient",
        NO_OPERATION => "NoOperation",
        m if m >= EXTENSION_BASE => "extension",
        _ => "unknown",
    }
}
