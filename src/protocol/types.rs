//! Core X11 protocol types
//!
//! These types represent the fundamental data types used in the X11 protocol.
//! They are kept minimal and close to the wire protocol for efficiency.

use std::fmt;

/// X11 resource ID - used for windows, pixmaps, graphics contexts, etc.
///
/// The high bits of every XID carry the slot index of the owning client, so
/// the owner can be recovered without a table lookup (see
/// [`crate::resources::XidLayout`]).
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct XID(pub u32);

impl XID {
    pub const NONE: XID = XID(0);

    pub fn new(id: u32) -> Self {
        XID(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for XID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Window ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window(pub XID);

impl Window {
    pub const NONE: Window = Window(XID::NONE);

    pub fn new(id: u32) -> Self {
        Window(XID::new(id))
    }

    pub fn id(&self) -> XID {
        self.0
    }
}

/// Colormap ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Colormap(pub XID);

impl Colormap {
    pub fn new(id: u32) -> Self {
        Colormap(XID::new(id))
    }

    pub fn id(&self) -> XID {
        self.0
    }
}

/// Atom - interned string identifier
///
/// Atom storage lives outside the kernel; selections only need the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Atom(pub u32);

impl Atom {
    pub const NONE: Atom = Atom(0);
    pub const PRIMARY: Atom = Atom(1);
    pub const SECONDARY: Atom = Atom(2);

    pub fn new(id: u32) -> Self {
        Atom(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

/// Visual ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VisualID(pub u32);

impl VisualID {
    pub fn new(id: u32) -> Self {
        VisualID(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

/// Slot index of a connected client. Slot 0 is the server itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u16);

impl ClientId {
    /// The server's own pseudo-client; owns the root window and fake IDs
    pub const SERVER: ClientId = ClientId(0);

    pub fn index(&self) -> usize {
        self.0 as usize
    }

    pub fn is_server(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client {}", self.0)
    }
}

/// Timestamp in server milliseconds. Zero means CurrentTime on the wire.
pub type Timestamp = u32;

pub const CURRENT_TIME: Timestamp = 0;

/// Byte order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    LSBFirst = 0,
    MSBFirst = 1,
}

impl ByteOrder {
    pub fn native() -> Self {
        if cfg!(target_endian = "little") {
            ByteOrder::LSBFirst
        } else {
            ByteOrder::MSBFirst
        }
    }

    /// Whether talking to a peer in this order requires swapping
    pub fn is_swapped(&self) -> bool {
        *self != ByteOrder::native()
    }
}

/// Decoded connection-setup order byte.
///
/// Byte order and trust are separate properties of the session even though
/// the handshake carries both in one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderByte {
    pub byte_order: ByteOrder,
    pub trusted: bool,
}

impl OrderByte {
    pub const LSB_TRUSTED: u8 = b'l';
    pub const MSB_TRUSTED: u8 = b'B';
    pub const LSB_UNTRUSTED: u8 = b'L';
    pub const MSB_UNTRUSTED: u8 = b'b';

    pub fn parse(byte: u8) -> Option<Self> {
        let (byte_order, trusted) = match byte {
            Self::LSB_TRUSTED => (ByteOrder::LSBFirst, true),
            Self::MSB_TRUSTED => (ByteOrder::MSBFirst, true),
            Self::LSB_UNTRUSTED => (ByteOrder::LSBFirst, false),
            Self::MSB_UNTRUSTED => (ByteOrder::MSBFirst, false),
            _ => return None,
        };
        Some(OrderByte {
            byte_order,
            trusted,
        })
    }
}

/// Window class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum WindowClass {
    CopyFromParent = 0,
    InputOutput = 1,
    InputOnly = 2,
}

impl WindowClass {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(WindowClass::CopyFromParent),
            1 => Some(WindowClass::InputOutput),
            2 => Some(WindowClass::InputOnly),
            _ => None,
        }
    }
}
