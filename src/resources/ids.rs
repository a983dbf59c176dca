//! Resource ID layout
//!
//! An XID is split into a client field and a per-client resource field.
//! The number of client bits follows from the configured client limit, so
//! the owner of any ID is a shift and a mask away.

use crate::protocol::{ClientId, XID};

/// Bits shared between the client field and the resource field
const RESOURCE_AND_CLIENT_COUNT: u32 = 29;

/// Set on IDs the server synthesizes inside a client's namespace
pub const SERVER_BIT: u32 = 0x4000_0000;

/// Derived bit layout for a given client limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XidLayout {
    client_bits: u32,
    offset: u32,
}

impl XidLayout {
    /// Layout for `limit_clients` slots, rounded up to a power of two
    pub fn new(limit_clients: usize) -> Self {
        let client_bits = limit_clients.max(2).next_power_of_two().trailing_zeros();
        XidLayout {
            client_bits,
            offset: RESOURCE_AND_CLIENT_COUNT - client_bits,
        }
    }

    /// Number of client slots, including the server's slot 0
    pub fn max_clients(&self) -> usize {
        1 << self.client_bits
    }

    /// Shift applied to a slot index to form its ID base
    pub fn client_offset(&self) -> u32 {
        self.offset
    }

    /// Mask of the per-client resource field
    pub fn id_mask(&self) -> u32 {
        (1 << self.offset) - 1
    }

    fn client_mask(&self) -> u32 {
        ((1 << self.client_bits) - 1) << self.offset
    }

    /// First ID of a client's namespace
    pub fn client_base(&self, client: ClientId) -> u32 {
        (client.0 as u32) << self.offset
    }

    /// Owning client of an ID
    pub fn client_of(&self, id: XID) -> ClientId {
        ClientId(((id.get() & self.client_mask()) >> self.offset) as u16)
    }

    /// Whether `id` was synthesized by the server
    pub fn is_server_id(&self, id: XID) -> bool {
        id.get() & SERVER_BIT != 0
    }
}

impl Default for XidLayout {
    fn default() -> Self {
        XidLayout::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let layout = XidLayout::default();
        assert_eq!(layout.max_clients(), 256);
        assert_eq!(layout.client_offset(), 21);
        assert_eq!(layout.id_mask(), 0x001f_ffff);
        assert_eq!(layout.client_base(ClientId(1)), 0x0020_0000);
        assert_eq!(layout.client_of(XID(0x0040_0123)), ClientId(2));
    }

    #[test]
    fn test_server_bit_is_outside_client_field() {
        let layout = XidLayout::new(2048);
        let id = XID(SERVER_BIT | layout.client_base(ClientId(5)) | 7);
        assert_eq!(layout.client_of(id), ClientId(5));
        assert!(layout.is_server_id(id));
    }
}
