//! X11 extension registry
//!
//! Extensions claim a major opcode at or above 128 plus contiguous ranges of
//! event and error codes. The ranges are handed out in registration order
//! from fixed budgets, and the whole registry is torn down and rebuilt on
//! every server generation.

use super::{DispatchError, Server};
use crate::protocol::opcodes::EXTENSION_BASE;
use crate::protocol::{ClientId, Request};
use crate::security::{AccessHook, AccessSubject};
use log::{debug, info, warn};
use std::rc::Rc;

/// First event code available to extensions
pub const EXTENSION_EVENT_BASE: u16 = 64;
/// Size of the whole event code space
pub const MAX_EVENTS: u16 = 128;
/// First error code available to extensions
pub const FIRST_EXTENSION_ERROR: u16 = 128;
/// Exclusive upper bound of the error code space
pub const LAST_ERROR: u16 = 255;
/// Exclusive upper bound of the major opcode space
const MAX_MAJOR_OPCODE: u16 = 256;

/// The request handling side of an extension.
///
/// Only `dispatch` is required. The byte-swapped variant exists for
/// extensions that decode fields by hand; handlers that read through
/// [`crate::protocol::WireReader`] get the client's byte order for free.
pub trait ExtensionHandler {
    /// Handle a request from a client using the server's byte order
    fn dispatch(&self, server: &mut Server, client: ClientId, req: &Request)
        -> Result<(), DispatchError>;

    /// Handle a request from a byte-swapped client
    fn dispatch_swapped(
        &self,
        server: &mut Server,
        client: ClientId,
        req: &Request,
    ) -> Result<(), DispatchError> {
        self.dispatch(server, client, req)
    }

    /// Minor opcode of a request, reported in errors and access checks
    fn minor_opcode(&self, req: &Request) -> u16 {
        req.data as u16
    }

    /// Called once when the registry shuts down at the end of a generation
    fn reset(&self) {}

    /// Whether untrusted clients may see and use the extension
    fn untrusted_safe(&self) -> bool {
        false
    }
}

/// What a successful registration was assigned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionHandle {
    pub index: usize,
    pub major_opcode: u8,
    /// First event code, 0 if the extension has no events
    pub event_base: u8,
    pub n_events: u8,
    /// First error code, 0 if the extension has no errors
    pub error_base: u8,
    pub n_errors: u8,
}

/// Answer to QueryExtension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryResult {
    pub present: bool,
    pub major_opcode: u8,
    pub first_event: u8,
    pub first_error: u8,
}

struct ExtensionEntry {
    name: String,
    handle: ExtensionHandle,
    handler: Rc<dyn ExtensionHandler>,
}

/// Opcode, event and error allocation for one server generation
pub struct ExtensionRegistry {
    entries: Vec<ExtensionEntry>,
    last_event: u16,
    last_error: u16,
    visibility: Option<Rc<dyn AccessHook>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        ExtensionRegistry {
            entries: Vec::new(),
            last_event: EXTENSION_EVENT_BASE,
            last_error: FIRST_EXTENSION_ERROR,
            visibility: None,
        }
    }

    /// Install the hook that decides which clients can see which extensions
    pub fn set_visibility_hook(&mut self, hook: Option<Rc<dyn AccessHook>>) {
        self.visibility = hook;
    }

    /// Register an extension. Fails without changing any state when the name
    /// is taken or any of the opcode, event or error budgets would overflow.
    pub fn add_extension(
        &mut self,
        name: &str,
        n_events: u8,
        n_errors: u8,
        handler: Rc<dyn ExtensionHandler>,
    ) -> Option<ExtensionHandle> {
        if name.is_empty() || name.len() > u8::MAX as usize {
            warn!("Refusing extension with unusable name {:?}", name);
            return None;
        }
        if self.find_by_name(name).is_some() {
            warn!("Extension {} registered twice", name);
            return None;
        }
        let major = EXTENSION_BASE as u16 + self.entries.len() as u16;
        if major >= MAX_MAJOR_OPCODE {
            warn!("No major opcode left for extension {}", name);
            return None;
        }
        if self.last_event + n_events as u16 > MAX_EVENTS {
            warn!(
                "Extension {} needs {} events, only {} left",
                name,
                n_events,
                MAX_EVENTS - self.last_event
            );
            return None;
        }
        if self.last_error + n_errors as u16 > LAST_ERROR {
            warn!(
                "Extension {} needs {} errors, only {} left",
                name,
                n_errors,
                LAST_ERROR - self.last_error
            );
            return None;
        }

        let handle = ExtensionHandle {
            index: self.entries.len(),
            major_opcode: major as u8,
            event_base: if n_events > 0 { self.last_event as u8 } else { 0 },
            n_events,
            error_base: if n_errors > 0 { self.last_error as u8 } else { 0 },
            n_errors,
        };
        self.last_event += n_events as u16;
        self.last_error += n_errors as u16;
        self.entries.push(ExtensionEntry {
            name: name.to_string(),
            handle,
            handler,
        });
        info!(
            "Registered extension {} (major {}, events {}+{}, errors {}+{})",
            name, handle.major_opcode, handle.event_base, n_events, handle.error_base, n_errors
        );
        Some(handle)
    }

    pub fn find_by_name(&self, name: &str) -> Option<ExtensionHandle> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.handle)
    }

    pub fn find_by_opcode(&self, major: u8) -> Option<ExtensionHandle> {
        let index = major.checked_sub(EXTENSION_BASE)? as usize;
        self.entries.get(index).map(|entry| entry.handle)
    }

    pub fn name(&self, handle: ExtensionHandle) -> Option<&str> {
        self.entries.get(handle.index).map(|entry| entry.name.as_str())
    }

    /// Handler installed at `major`
    pub fn handler(&self, major: u8) -> Option<Rc<dyn ExtensionHandler>> {
        let index = major.checked_sub(EXTENSION_BASE)? as usize;
        self.entries.get(index).map(|entry| entry.handler.clone())
    }

    fn visible(&self, entry: &ExtensionEntry, subject: &AccessSubject) -> bool {
        match &self.visibility {
            Some(hook) => {
                hook.extension_visible(subject, &entry.name, entry.handler.untrusted_safe())
            }
            None => true,
        }
    }

    /// QueryExtension: hidden extensions look exactly like missing ones
    pub fn query(&self, name: &str, subject: &AccessSubject) -> QueryResult {
        self.entries
            .iter()
            .find(|entry| entry.name == name && self.visible(entry, subject))
            .map(|entry| QueryResult {
                present: true,
                major_opcode: entry.handle.major_opcode,
                first_event: entry.handle.event_base,
                first_error: entry.handle.error_base,
            })
            .unwrap_or_default()
    }

    /// ListExtensions, filtered like `query`
    pub fn list(&self, subject: &AccessSubject) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| self.visible(entry, subject))
            .map(|entry| entry.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run reset hooks newest first, then return every allocator to its base
    pub fn shutdown(&mut self) {
        for entry in self.entries.iter().rev() {
            debug!("Shutting down extension {}", entry.name);
            entry.handler.reset();
        }
        self.entries.clear();
        self.last_event = EXTENSION_EVENT_BASE;
        self.last_error = FIRST_EXTENSION_ERROR;
    }
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
