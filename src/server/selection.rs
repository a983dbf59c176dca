//! Selection ownership
//!
//! Only ownership is tracked; conversion traffic goes through events the
//! kernel does not originate. A selection loses its owner as soon as the
//! owner window is destroyed, without a SelectionClear.

use super::objects::WindowRec;
use super::{DispatchError, Server};
use crate::protocol::{
    Atom, ClientId, Event, ProtocolEncoder, ProtocolError, Request, SelectionClearEvent, Timestamp,
    Window, CURRENT_TIME,
};
use crate::security::Access;
use log::debug;

/// Ownership record of one selection atom
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub selection: Atom,
    pub owner: Window,
    /// Client that set the current owner; `None` once released
    pub client: Option<ClientId>,
    pub last_change: Timestamp,
}

#[derive(Debug, Default)]
pub struct SelectionTable {
    entries: Vec<Selection>,
}

impl SelectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, selection: Atom) -> Option<&Selection> {
        self.entries.iter().find(|s| s.selection == selection)
    }

    /// Record a new owner, returning the previous record
    pub fn set(&mut self, record: Selection) -> Option<Selection> {
        match self.entries.iter_mut().find(|s| s.selection == record.selection) {
            Some(existing) => Some(std::mem::replace(existing, record)),
            None => {
                self.entries.push(record);
                None
            }
        }
    }

    /// Release every selection owned by `client`, keeping the change times
    pub fn remove_client(&mut self, client: ClientId) -> usize {
        let mut released = 0;
        for entry in self.entries.iter_mut().filter(|s| s.client == Some(client)) {
            entry.owner = Window::NONE;
            entry.client = None;
            released += 1;
        }
        released
    }

    /// Release every selection whose owner window fails `live`
    pub fn release_dead_owners(&mut self, mut live: impl FnMut(Window) -> bool) -> usize {
        let mut released = 0;
        for entry in self
            .entries
            .iter_mut()
            .filter(|s| s.owner != Window::NONE)
        {
            if !live(entry.owner) {
                entry.owner = Window::NONE;
                entry.client = None;
                released += 1;
            }
        }
        released
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// SetSelectionOwner
pub(crate) fn handle_set_selection_owner(
    server: &mut Server,
    client: ClientId,
    req: &Request,
) -> Result<(), DispatchError> {
    req.expect_len(16)?;
    let mut reader = req.reader();
    let owner = Window::new(reader.u32()?);
    let selection = Atom::new(reader.u32()?);
    let time = reader.u32()?;

    if selection == Atom::NONE {
        return Err(ProtocolError::atom(0).into());
    }
    if owner != Window::NONE {
        server.lookup_window(owner.id(), client, Access::SET_ATTR)?;
    }

    let now = server.current_time();
    let time = if time == CURRENT_TIME { now } else { time };
    // times in the future, or older than the last change, are ignored
    if time > now {
        return Ok(());
    }
    if server
        .selections
        .get(selection)
        .is_some_and(|s| time < s.last_change)
    {
        return Ok(());
    }

    let previous = server.selections.set(Selection {
        selection,
        owner,
        client: (owner != Window::NONE).then_some(client),
        last_change: time,
    });
    debug!(
        "Selection {} now owned by {} ({})",
        selection.get(),
        owner.id(),
        client
    );

    if let Some(Selection {
        owner: old_owner,
        client: Some(old_client),
        ..
    }) = previous
    {
        if owner == Window::NONE || old_client != client {
            server.send_event(
                old_client,
                &Event::SelectionClear(SelectionClearEvent {
                    time,
                    owner: old_owner,
                    selection,
                }),
            );
        }
    }
    Ok(())
}

/// GetSelectionOwner
pub(crate) fn handle_get_selection_owner(
    server: &mut Server,
    client: ClientId,
    req: &Request,
) -> Result<(), DispatchError> {
    req.expect_len(8)?;
    let selection = Atom::new(req.reader().u32()?);
    if selection == Atom::NONE {
        return Err(ProtocolError::atom(0).into());
    }

    let owner = server
        .selections
        .get(selection)
        .map_or(Window::NONE, |s| s.owner);

    let Some(order) = server.client(client).map(|c| c.byte_order()) else {
        return Ok(());
    };
    let reply = ProtocolEncoder::new(order).encode_get_selection_owner_reply(req.wire_sequence(), owner);
    server.send(client, &reply);
    Ok(())
}

impl Server {
    /// Drop ownership held by windows that no longer exist
    pub(crate) fn release_dead_selections(&mut self) {
        let window_type = self.object_types().window;
        let resources = &self.resources;
        let released = self.selections.release_dead_owners(|owner| {
            resources
                .get::<WindowRec>(owner.id(), window_type.into())
                .is_some()
        });
        if released > 0 {
            debug!("Released {} selection(s) of destroyed windows", released);
        }
    }
}
