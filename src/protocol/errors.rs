//! X11 protocol error codes and error handling

use super::types::{ByteOrder, XID};
use super::wire::WireWriter;
use std::fmt;

/// X11 error codes as defined in the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    Request = 1,
    Value = 2,
    Window = 3,
    Pixmap = 4,
    Atom = 5,
    Cursor = 6,
    Font = 7,
    Match = 8,
    Drawable = 9,
    Access = 10,
    Alloc = 11,
    Colormap = 12,
    GContext = 13,
    IDChoice = 14,
    Name = 15,
    Length = 16,
    Implementation = 17,
}

impl ErrorCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            1 => Some(ErrorCode::Request),
            2 => Some(ErrorCode::Value),
            3 => Some(ErrorCode::Window),
            4 => Some(ErrorCode::Pixmap),
            5 => Some(ErrorCode::Atom),
            6 => Some(ErrorCode::Cursor),
            7 => Some(ErrorCode::Font),
            8 => Some(ErrorCode::Match),
            9 => Some(ErrorCode::Drawable),
            10 => Some(ErrorCode::Access),
            11 => Some(ErrorCode::Alloc),
            12 => Some(ErrorCode::Colormap),
            13 => Some(ErrorCode::GContext),
            14 => Some(ErrorCode::IDChoice),
            15 => Some(ErrorCode::Name),
            16 => Some(ErrorCode::Length),
            17 => Some(ErrorCode::Implementation),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Request => "Request: bad request code",
            ErrorCode::Value => "Value: integer parameter out of range",
            ErrorCode::Window => "Window: invalid Window parameter",
            ErrorCode::Pixmap => "Pixmap: invalid Pixmap parameter",
            ErrorCode::Atom => "Atom: invalid Atom parameter",
            ErrorCode::Cursor => "Cursor: invalid Cursor parameter",
            ErrorCode::Font => "Font: invalid Font parameter",
            ErrorCode::Match => "Match: parameter mismatch",
            ErrorCode::Drawable => "Drawable: invalid Drawable parameter",
            ErrorCode::Access => "Access: attempt to access private resource",
            ErrorCode::Alloc => "Alloc: insufficient resources",
            ErrorCode::Colormap => "Colormap: invalid Colormap parameter",
            ErrorCode::GContext => "GContext: invalid GC parameter",
            ErrorCode::IDChoice => "IDChoice: invalid resource ID for this connection",
            ErrorCode::Name => "Name: font or color name doesn't exist",
            ErrorCode::Length => "Length: request length incorrect",
            ErrorCode::Implementation => "Implementation: server implementation error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A per-request protocol error, as returned by a request handler.
///
/// `code` is either a core [`ErrorCode`] or an extension error
/// (`error_base + n`). The sequence number and opcodes are filled in by the
/// dispatcher when the error is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolError {
    pub code: u8,
    pub bad_value: u32,
}

impl ProtocolError {
    pub fn new(code: ErrorCode, bad_value: u32) -> Self {
        ProtocolError {
            code: code as u8,
            bad_value,
        }
    }

    /// An extension-defined error code
    pub fn extension(code: u8, bad_value: u32) -> Self {
        ProtocolError { code, bad_value }
    }

    pub fn request() -> Self {
        Self::new(ErrorCode::Request, 0)
    }

    pub fn length() -> Self {
        Self::new(ErrorCode::Length, 0)
    }

    pub fn value(value: u32) -> Self {
        Self::new(ErrorCode::Value, value)
    }

    pub fn access() -> Self {
        Self::new(ErrorCode::Access, 0)
    }

    pub fn alloc() -> Self {
        Self::new(ErrorCode::Alloc, 0)
    }

    pub fn id_choice(id: XID) -> Self {
        Self::new(ErrorCode::IDChoice, id.get())
    }

    pub fn atom(atom: u32) -> Self {
        Self::new(ErrorCode::Atom, atom)
    }

    pub fn bad_match() -> Self {
        Self::new(ErrorCode::Match, 0)
    }

    pub fn core_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_u8(self.code)
    }

    /// Encode as a 32-byte Error packet in the client's byte order
    pub fn encode(&self, order: ByteOrder, sequence: u16, major: u8, minor: u16) -> Vec<u8> {
        let mut writer = WireWriter::new(order);
        writer
            .u8(0) // Error
            .u8(self.code)
            .u16(sequence)
            .u32(self.bad_value)
            .u16(minor)
            .u8(major)
            .zeros(21);
        writer.into_inner()
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.core_code() {
            Some(code) => write!(f, "{} (value 0x{:08x})", code, self.bad_value),
            None => write!(
                f,
                "extension error {} (value 0x{:08x})",
                self.code, self.bad_value
            ),
        }
    }
}

impl std::error::Error for ProtocolError {}
