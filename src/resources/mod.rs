//! Resource database
//!
//! Every server-side object a client can name lives here, keyed by its XID
//! and tagged with a type registered for the current generation. The owning
//! client of an ID is encoded in the ID itself, so entries are grouped in
//! per-client tables that can be torn down as a unit when a session ends.
//!
//! Deletion is re-entrant: the payload is detached and the entry left as a
//! tombstone while the type's destructor runs, so a destructor may delete
//! other resources, and a second delete of the same ID during or after the
//! first observes "not found" instead of running the destructor twice.

mod ids;
mod types;

pub use ids::{XidLayout, SERVER_BIT};
pub use types::{
    ClassSet, Destructor, Match, ResourceType, TypeClass, TypeFlags, TypeInfo, TypeRegistry,
    MAX_TYPES,
};

use crate::protocol::{ClientId, ErrorCode, ProtocolError, XID};
use crate::security::{Access, AccessHook, AccessSubject};
use log::{debug, trace};
use std::any::Any;
use std::collections::HashMap;
use std::rc::Rc;
use thiserror::Error;

/// Why a resource operation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("resource {0} not found")]
    NotFound(XID),
    #[error("resource {0} has the wrong type")]
    WrongType(XID),
    #[error("access to resource {0} denied")]
    AccessDenied(XID),
    #[error("resource id {0} already in use")]
    IdInUse(XID),
    #[error("resource id {0} is not valid for this client")]
    BadIdChoice(XID),
    #[error("resource type space exhausted")]
    TypesExhausted,
    #[error("resource type or class from another generation")]
    StaleType,
    #[error("resource id space of {0} exhausted")]
    IdsExhausted(ClientId),
    #[error("no resource table for {0}")]
    UnknownClient(ClientId),
    #[error("resource table for {0} already exists")]
    ClientInUse(ClientId),
}

impl ResourceError {
    /// Map to the protocol error a request handler reports.
    ///
    /// `default_code` is the type-specific error (`BadWindow`, `BadPixmap`,
    /// ...) used for lookups that fail to find a matching resource.
    pub fn to_protocol(&self, default_code: ErrorCode) -> ProtocolError {
        match *self {
            ResourceError::NotFound(id) | ResourceError::WrongType(id) => {
                ProtocolError::new(default_code, id.get())
            }
            ResourceError::AccessDenied(id) => ProtocolError::new(ErrorCode::Access, id.get()),
            ResourceError::IdInUse(id) | ResourceError::BadIdChoice(id) => {
                ProtocolError::id_choice(id)
            }
            ResourceError::TypesExhausted
            | ResourceError::IdsExhausted(_)
            | ResourceError::StaleType
            | ResourceError::UnknownClient(_)
            | ResourceError::ClientInUse(_) => ProtocolError::alloc(),
        }
    }
}

enum Slot {
    Live(Box<dyn Any>),
    /// Destructor in progress; the ID stays reserved until it returns
    Dying,
}

struct Entry {
    rtype: ResourceType,
    value: Slot,
    /// Creation order within the database, used for teardown order
    seq: u64,
}

impl Entry {
    fn live(&self) -> Option<&(dyn Any + 'static)> {
        match &self.value {
            Slot::Live(value) => Some(&**value),
            Slot::Dying => None,
        }
    }
}

struct ClientTable {
    entries: HashMap<XID, Entry>,
    trusted: bool,
    /// Low bits of the next server-synthesized ID
    next_fake: u32,
}

/// The resource database of one server
pub struct ResourceDatabase {
    layout: XidLayout,
    types: TypeRegistry,
    clients: Vec<Option<ClientTable>>,
    access_hook: Option<Rc<dyn AccessHook>>,
    next_seq: u64,
}

impl ResourceDatabase {
    pub fn new(layout: XidLayout) -> Self {
        ResourceDatabase {
            layout,
            types: TypeRegistry::new(),
            clients: Vec::new(),
            access_hook: None,
            next_seq: 0,
        }
    }

    pub fn layout(&self) -> XidLayout {
        self.layout
    }

    pub fn generation(&self) -> u32 {
        self.types.generation()
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// Install the hook consulted by access-controlled lookups
    pub fn set_access_hook(&mut self, hook: Option<Rc<dyn AccessHook>>) {
        self.access_hook = hook;
    }

    // Types

    pub fn register_type(
        &mut self,
        name: &str,
        destructor: Rc<dyn Destructor>,
        classes: ClassSet,
        flags: TypeFlags,
    ) -> Result<ResourceType, ResourceError> {
        let rtype = self.types.register(name, destructor, classes, flags)?;
        debug!("Registered resource type {} ({:?})", name, rtype);
        Ok(rtype)
    }

    pub fn register_class(&mut self) -> Result<TypeClass, ResourceError> {
        self.types.register_class()
    }

    /// The class matching windows and pixmaps
    pub fn drawable_class(&self) -> TypeClass {
        self.types.drawable()
    }

    /// Name of a type, for logging and access checks
    pub fn type_name(&self, rtype: ResourceType) -> &str {
        self.types
            .info(rtype)
            .map(|info| info.name.as_str())
            .unwrap_or("UNKNOWN")
    }

    // Client tables

    /// Create the (empty) table for a newly set-up client
    pub fn init_client(&mut self, client: ClientId, trusted: bool) -> Result<(), ResourceError> {
        let index = client.index();
        if index >= self.layout.max_clients() {
            return Err(ResourceError::UnknownClient(client));
        }
        if self.clients.len() <= index {
            self.clients.resize_with(index + 1, || None);
        }
        if self.clients[index].is_some() {
            return Err(ResourceError::ClientInUse(client));
        }
        self.clients[index] = Some(ClientTable {
            entries: HashMap::new(),
            trusted,
            next_fake: 1,
        });
        Ok(())
    }

    pub fn has_client(&self, client: ClientId) -> bool {
        self.table(client).is_some()
    }

    pub fn is_trusted(&self, client: ClientId) -> bool {
        self.table(client).is_some_and(|table| table.trusted)
    }

    fn table(&self, client: ClientId) -> Option<&ClientTable> {
        self.clients.get(client.index()).and_then(Option::as_ref)
    }

    fn table_mut(&mut self, client: ClientId) -> Option<&mut ClientTable> {
        self.clients.get_mut(client.index()).and_then(Option::as_mut)
    }

    fn entry(&self, id: XID) -> Option<&Entry> {
        self.table(self.layout.client_of(id))?.entries.get(&id)
    }

    fn entry_mut(&mut self, id: XID) -> Option<&mut Entry> {
        let owner = self.layout.client_of(id);
        self.table_mut(owner)?.entries.get_mut(&id)
    }

    fn subject(&self, client: ClientId) -> AccessSubject {
        AccessSubject {
            client,
            trusted: client.is_server() || self.is_trusted(client),
        }
    }

    // IDs

    /// Owning client of an ID
    pub fn owner_of(&self, id: XID) -> ClientId {
        self.layout.client_of(id)
    }

    /// Whether `client` may create a resource named `id`
    pub fn legal_new_id(&self, id: XID, client: ClientId) -> Result<(), ResourceError> {
        if id.get() & !self.layout.id_mask() != self.layout.client_base(client) {
            return Err(ResourceError::BadIdChoice(id));
        }
        if self.entry(id).is_some() {
            return Err(ResourceError::BadIdChoice(id));
        }
        Ok(())
    }

    /// Synthesize an unused ID inside `client`'s namespace
    pub fn fake_client_id(&mut self, client: ClientId) -> Result<XID, ResourceError> {
        let base = self.layout.client_base(client) | SERVER_BIT;
        let mask = self.layout.id_mask();
        let table = self
            .table_mut(client)
            .ok_or(ResourceError::UnknownClient(client))?;
        for _ in 0..=mask {
            let low = table.next_fake & mask;
            table.next_fake = (low + 1) & mask;
            if low == 0 {
                continue;
            }
            let id = XID(base | low);
            if !table.entries.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(ResourceError::IdsExhausted(client))
    }

    fn used_low_bits(&self, client: ClientId) -> Vec<u32> {
        let mask = self.layout.id_mask();
        let mut used: Vec<u32> = self
            .table(client)
            .map(|table| {
                table
                    .entries
                    .keys()
                    .filter(|id| !self.layout.is_server_id(**id))
                    .map(|id| id.get() & mask)
                    .collect()
            })
            .unwrap_or_default();
        used.sort_unstable();
        used
    }

    /// Largest run of unused IDs in `client`'s namespace, as (first, count)
    pub fn xid_range(&self, client: ClientId) -> (XID, u32) {
        let base = self.layout.client_base(client);
        let mask = self.layout.id_mask();
        let mut best = (0u32, 0u32);
        let mut start = 0u32;
        for used in self
            .used_low_bits(client)
            .into_iter()
            .chain(std::iter::once(mask + 1))
        {
            let len = used.saturating_sub(start);
            if len > best.1 {
                best = (start, len);
            }
            start = used + 1;
        }
        if best.1 == 0 {
            return (XID::NONE, 0);
        }
        (XID(base | best.0), best.1)
    }

    /// Up to `count` unused IDs in `client`'s namespace, lowest first
    pub fn xid_list(&self, client: ClientId, count: u32) -> Vec<XID> {
        let base = self.layout.client_base(client);
        let used = self.used_low_bits(client);
        let mut used = used.iter().peekable();
        let mut ids = Vec::new();
        for low in 0..=self.layout.id_mask() {
            if ids.len() as u32 >= count {
                break;
            }
            while used.next_if(|u| **u < low).is_some() {}
            if used.next_if_eq(&&low).is_some() {
                continue;
            }
            ids.push(XID(base | low));
        }
        ids
    }

    // Binding

    /// Bind `id` to a payload of type `rtype`
    pub fn add<T: Any>(&mut self, id: XID, rtype: ResourceType, value: T) -> Result<(), ResourceError> {
        self.add_boxed(id, rtype, Box::new(value))
    }

    pub fn add_boxed(
        &mut self,
        id: XID,
        rtype: ResourceType,
        value: Box<dyn Any>,
    ) -> Result<(), ResourceError> {
        if self.types.info(rtype).is_none() {
            return Err(ResourceError::StaleType);
        }
        let owner = self.layout.client_of(id);
        let seq = self.next_seq;
        let table = self
            .table_mut(owner)
            .ok_or(ResourceError::UnknownClient(owner))?;
        if table.entries.contains_key(&id) {
            return Err(ResourceError::IdInUse(id));
        }
        table.entries.insert(
            id,
            Entry {
                rtype,
                value: Slot::Live(value),
                seq,
            },
        );
        self.next_seq += 1;
        trace!("Added {} resource {}", self.type_name(rtype), id);
        Ok(())
    }

    /// Replace the payload of a live resource without running its destructor
    pub fn change_value<T: Any>(
        &mut self,
        id: XID,
        rtype: ResourceType,
        value: T,
    ) -> Result<(), ResourceError> {
        let entry = self.entry_mut(id).ok_or(ResourceError::NotFound(id))?;
        if entry.rtype != rtype {
            return Err(ResourceError::WrongType(id));
        }
        match entry.value {
            Slot::Live(_) => {
                entry.value = Slot::Live(Box::new(value));
                Ok(())
            }
            Slot::Dying => Err(ResourceError::NotFound(id)),
        }
    }

    // Lookup

    /// Type of a live resource
    pub fn type_of(&self, id: XID) -> Option<ResourceType> {
        let entry = self.entry(id)?;
        entry.live().map(|_| entry.rtype)
    }

    pub fn is_live(&self, id: XID) -> bool {
        self.type_of(id).is_some()
    }

    fn matched_entry(&self, id: XID, m: Match) -> Result<&Entry, ResourceError> {
        let entry = self.entry(id).ok_or(ResourceError::NotFound(id))?;
        if entry.live().is_none() {
            return Err(ResourceError::NotFound(id));
        }
        if !self.types.matches(entry.rtype, m) {
            return Err(ResourceError::WrongType(id));
        }
        Ok(entry)
    }

    fn check_access(
        &self,
        id: XID,
        rtype: ResourceType,
        who: ClientId,
        access: Access,
    ) -> Result<(), ResourceError> {
        let Some(hook) = &self.access_hook else {
            return Ok(());
        };
        let subject = self.subject(who);
        let owner = self.subject(self.layout.client_of(id));
        if hook.resource_access(&subject, &owner, id, self.type_name(rtype), access) {
            Ok(())
        } else {
            Err(ResourceError::AccessDenied(id))
        }
    }

    /// Access-controlled lookup on behalf of client `who`
    pub fn lookup<T: Any>(
        &self,
        id: XID,
        m: Match,
        who: ClientId,
        access: Access,
    ) -> Result<&T, ResourceError> {
        let entry = self.matched_entry(id, m)?;
        self.check_access(id, entry.rtype, who, access)?;
        entry
            .live()
            .and_then(|value| value.downcast_ref::<T>())
            .ok_or(ResourceError::WrongType(id))
    }

    /// Access-controlled lookup that only reports the matched type
    pub fn lookup_any(
        &self,
        id: XID,
        m: Match,
        who: ClientId,
        access: Access,
    ) -> Result<ResourceType, ResourceError> {
        let entry = self.matched_entry(id, m)?;
        self.check_access(id, entry.rtype, who, access)?;
        Ok(entry.rtype)
    }

    /// Unchecked lookup for server-internal use
    pub fn get<T: Any>(&self, id: XID, m: Match) -> Option<&T> {
        self.matched_entry(id, m)
            .ok()
            .and_then(Entry::live)
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Unchecked mutable lookup for server-internal use
    pub fn get_mut<T: Any>(&mut self, id: XID, m: Match) -> Option<&mut T> {
        let rtype = self.matched_entry(id, m).ok()?.rtype;
        let entry = self.entry_mut(id)?;
        debug_assert_eq!(entry.rtype, rtype);
        match &mut entry.value {
            Slot::Live(value) => value.downcast_mut::<T>(),
            Slot::Dying => None,
        }
    }

    /// First live resource of `owner` matching `m` whose payload satisfies
    /// `pred`, in creation order.
    ///
    /// Used to find one physical replica among several resources that stand
    /// for the same logical object.
    pub fn lookup_scoped<T: Any>(
        &self,
        owner: ClientId,
        m: Match,
        mut pred: impl FnMut(XID, &T) -> bool,
    ) -> Option<(XID, &T)> {
        let table = self.table(owner)?;
        let mut candidates: Vec<(&XID, &Entry)> = table
            .entries
            .iter()
            .filter(|(_, entry)| self.types.matches(entry.rtype, m))
            .collect();
        candidates.sort_unstable_by_key(|(_, entry)| entry.seq);
        candidates.into_iter().find_map(|(id, entry)| {
            let value = entry.live()?.downcast_ref::<T>()?;
            pred(*id, value).then_some((*id, value))
        })
    }

    /// Live IDs of `client` matching `m`, in creation order
    pub fn client_resources(&self, client: ClientId, m: Match) -> Vec<XID> {
        let Some(table) = self.table(client) else {
            return Vec::new();
        };
        let mut ids: Vec<(u64, XID)> = table
            .entries
            .iter()
            .filter(|(_, entry)| entry.live().is_some() && self.types.matches(entry.rtype, m))
            .map(|(id, entry)| (entry.seq, *id))
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    pub fn count_client_resources(&self, client: ClientId) -> usize {
        self.table(client)
            .map(|table| table.entries.values().filter(|e| e.live().is_some()).count())
            .unwrap_or(0)
    }

    // Deletion

    /// Run the destructor for `id` and unbind it
    pub fn delete(&mut self, id: XID) -> Result<(), ResourceError> {
        self.delete_matching(id, Match::Any)
    }

    /// Delete `id` only if it is bound with type `rtype`
    pub fn delete_by_type(&mut self, id: XID, rtype: ResourceType) -> Result<(), ResourceError> {
        self.delete_matching(id, Match::Type(rtype))
    }

    fn delete_matching(&mut self, id: XID, m: Match) -> Result<(), ResourceError> {
        let rtype = self.matched_entry(id, m)?.rtype;
        let Some(entry) = self.entry_mut(id) else {
            return Err(ResourceError::NotFound(id));
        };
        let Slot::Live(value) = std::mem::replace(&mut entry.value, Slot::Dying) else {
            return Err(ResourceError::NotFound(id));
        };

        trace!("Deleting {} resource {}", self.type_name(rtype), id);
        if let Some(destructor) = self.types.destructor(rtype) {
            destructor.destroy(self, id, value);
        }

        let owner = self.layout.client_of(id);
        if let Some(table) = self.table_mut(owner) {
            table.entries.remove(&id);
        }
        Ok(())
    }

    /// Delete the live resources of `client` selected by `select`,
    /// newest first, until none are left
    fn sweep(&mut self, client: ClientId, select: impl Fn(&TypeRegistry, &Entry) -> bool) -> usize {
        let mut freed = 0;
        loop {
            let Some(table) = self.table(client) else {
                return freed;
            };
            let mut victims: Vec<(u64, XID)> = table
                .entries
                .iter()
                .filter(|(_, entry)| entry.live().is_some() && select(&self.types, entry))
                .map(|(id, entry)| (entry.seq, *id))
                .collect();
            if victims.is_empty() {
                return freed;
            }
            victims.sort_unstable_by(|a, b| b.cmp(a));
            for (_, id) in victims {
                // an earlier destructor may already have taken it
                if self.is_live(id) && self.delete(id).is_ok() {
                    freed += 1;
                }
            }
        }
    }

    /// Free everything `client` owns and drop its table
    pub fn delete_all_for_client(&mut self, client: ClientId) {
        let freed = self.sweep(client, |_, _| true);
        if let Some(slot) = self.clients.get_mut(client.index()) {
            *slot = None;
        }
        debug!("Freed {} resources of {}", freed, client);
    }

    /// Free the resources of `client` whose type is flagged never-retain
    pub fn free_never_retain(&mut self, client: ClientId) {
        let freed = self.sweep(client, |types, entry| {
            types
                .info(entry.rtype)
                .is_some_and(|info| info.flags.contains(TypeFlags::NEVER_RETAIN))
        });
        debug!("Freed {} never-retain resources of {}", freed, client);
    }

    /// Free every resource of every client, then start a new generation in
    /// which all previously issued type tags are stale
    pub fn reset(&mut self) {
        for index in (0..self.clients.len()).rev() {
            self.delete_all_for_client(ClientId(index as u16));
        }
        self.clients.clear();
        self.types.reset();
        debug!("Resource database reset, generation {}", self.generation());
    }
}
