//! X11 protocol events
//!
//! The kernel itself only originates the events tied to its own state:
//! selection ownership changes. Everything else is generated by subsystems
//! layered on top of it.

use super::types::*;
use super::wire::WireWriter;

/// Size of every core event on the wire
pub const EVENT_LEN: usize = 32;

/// Event type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    SelectionClear = 29,
    SelectionRequest = 30,
    SelectionNotify = 31,
}

/// Events the kernel can deliver to a client
#[derive(Debug, Clone)]
pub enum Event {
    SelectionClear(SelectionClearEvent),
}

impl Event {
    /// Get the event type code
    pub fn event_type(&self) -> EventType {
        match self {
            Event::SelectionClear(_) => EventType::SelectionClear,
        }
    }

    /// Encode for a client using `order`, stamped with its last sequence
    pub fn encode(&self, order: ByteOrder, sequence: u16) -> Vec<u8> {
        let mut writer = WireWriter::new(order);
        match self {
            Event::SelectionClear(ev) => ev.encode(&mut writer, sequence),
        }
        writer.zeros(EVENT_LEN.saturating_sub(writer.len()));
        writer.into_inner()
    }
}

/// Sent to the previous owner when a selection changes hands
#[derive(Debug, Clone)]
pub struct SelectionClearEvent {
    pub time: Timestamp,
    pub owner: Window,
    pub selection: Atom,
}

impl SelectionClearEvent {
    fn encode(&self, writer: &mut WireWriter, sequence: u16) {
        writer
            .u8(EventType::SelectionClear as u8)
            .u8(0)
            .u16(sequence)
            .u32(self.time)
            .u32(self.owner.id().get())
            .u32(self.selection.get());
    }
}
