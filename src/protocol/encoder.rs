//! X11 reply encoder
//!
//! Replies for the core requests the kernel answers itself.

use super::wire::Reply;
use super::*;

/// Reply encoder bound to one client's byte order
pub struct ProtocolEncoder {
    byte_order: ByteOrder,
}

impl ProtocolEncoder {
    pub fn new(byte_order: ByteOrder) -> Self {
        ProtocolEncoder { byte_order }
    }

    /// Encode QueryExtension reply
    pub fn encode_query_extension_reply(
        &self,
        sequence: u16,
        present: bool,
        major_opcode: u8,
        first_event: u8,
        first_error: u8,
    ) -> Vec<u8> {
        let mut reply = Reply::new(self.byte_order, sequence, 0);
        reply
            .body()
            .bool(present)
            .u8(major_opcode)
            .u8(first_event)
            .u8(first_error);
        reply.finish()
    }

    /// Encode ListExtensions reply; names are STR (length-prefixed) entries
    pub fn encode_list_extensions_reply(&self, sequence: u16, names: &[String]) -> Vec<u8> {
        let names: Vec<&[u8]> = names
            .iter()
            .map(|name| &name.as_bytes()[..name.len().min(255)])
            .collect();
        let mut reply = Reply::new(self.byte_order, sequence, names.len() as u8);
        let body = reply.body();
        body.zeros(24);
        for name in &names {
            body.u8(name.len() as u8).bytes(name);
        }
        reply.finish()
    }

    /// Encode GetSelectionOwner reply
    pub fn encode_get_selection_owner_reply(&self, sequence: u16, owner: Window) -> Vec<u8> {
        let mut reply = Reply::new(self.byte_order, sequence, 0);
        reply.body().u32(owner.id().get());
        reply.finish()
    }

    /// Encode GetInputFocus reply
    pub fn encode_get_input_focus_reply(
        &self,
        sequence: u16,
        focus: Window,
        revert_to: u8,
    ) -> Vec<u8> {
        let mut reply = Reply::new(self.byte_order, sequence, revert_to);
        reply.body().u32(focus.id().get());
        reply.finish()
    }
}
