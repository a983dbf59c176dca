//! Core X11 server implementation
//!
//! This module contains the server context: the resource database, the
//! extension registry, the scheduler and the client table of one running
//! server, plus the session lifecycle that ties them together. Everything
//! runs on one thread; a request handler always runs to completion before
//! any other client is looked at.

mod client;
mod dispatch;
pub mod ext;
pub mod extensions;
mod handlers;
mod handshake;
pub mod listener;
pub mod objects;
pub mod scheduler;
pub mod selection;

pub use client::{Client, ClientState, CloseDownMode};
pub use extensions::{ExtensionHandle, ExtensionHandler, ExtensionRegistry, QueryResult};
pub use handlers::ALL_TEMPORARY;
pub use objects::{GcRec, ObjectTypes, PixmapRec, WindowRec};
pub use scheduler::Scheduler;

use crate::config::{ServerConfig, TerminatePolicy};
use crate::connection::Listener;
use crate::error::ServerError;
use crate::protocol::{Atom, ByteOrder, ClientId, Colormap, Event, ProtocolError, Timestamp, Window};
use crate::resources::{ResourceDatabase, XidLayout};
use crate::security::{AccessHook, AllowAll, Authorizer, CookieAuthorizer};
use log::{debug, info};
use selection::SelectionTable;
use std::rc::Rc;
use std::time::Instant;
use thiserror::Error;

/// How a request handler failed
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Reported to the client as an Error packet; the connection stays open
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The connection is closed before anything else it sent is processed
    #[error("client exception: {0}")]
    ClientFatal(String),
}

/// Notified of every client state transition
pub trait ClientStateListener {
    fn client_state_changed(&self, client: ClientId, state: ClientState);
}

/// A subsystem that registers extensions, resource types or listeners.
///
/// `init` runs once per server generation, after the resource database and
/// the extension registry have been reset.
pub trait ExtensionModule {
    fn name(&self) -> &str;

    fn init(&self, server: &mut Server) -> Result<(), ServerError>;
}

/// Pending interruption of the dispatch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchException {
    /// Start a new generation
    Reset,
    /// Leave `run`
    Terminate,
}

/// Main X11 server state
pub struct Server {
    config: ServerConfig,
    pub(crate) resources: ResourceDatabase,
    pub(crate) extensions: ExtensionRegistry,
    pub(crate) scheduler: Scheduler,
    pub(crate) selections: SelectionTable,

    /// Indexed by slot; slot 0 is the server itself and stays empty
    clients: Vec<Option<Client>>,
    /// Clients that completed setup and have not closed down
    n_clients: usize,

    listeners: Vec<Listener>,
    state_listeners: Vec<Rc<dyn ClientStateListener>>,
    access: Rc<dyn AccessHook>,
    authorizer: Box<dyn Authorizer>,
    modules: Vec<Rc<dyn ExtensionModule>>,

    types: ObjectTypes,
    root: Window,
    default_colormap: Colormap,

    exception: Option<DispatchException>,
    terminating: bool,
    /// Server time at which an armed terminate delay expires
    terminate_at: Option<u64>,
    started: Instant,
}

impl Server {
    /// Create a server and run the first generation's initialization.
    ///
    /// No socket is opened until [`Server::listen`].
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let layout = XidLayout::new(config.limit_clients);
        let access: Rc<dyn AccessHook> = Rc::new(config.security.clone());
        let authorizer: Box<dyn Authorizer> = match &config.auth_cookie {
            Some(cookie) => Box::new(CookieAuthorizer::new(cookie.clone())),
            None => Box::new(AllowAll),
        };

        let mut resources = ResourceDatabase::new(layout);
        resources.set_access_hook(Some(access.clone()));
        let objects = objects::init_server_objects(&mut resources, &config.screen)?;
        let mut extensions = ExtensionRegistry::new();
        extensions.set_visibility_hook(Some(access.clone()));

        let mut clients = Vec::new();
        clients.resize_with(layout.max_clients(), || None);

        let mut server = Server {
            scheduler: Scheduler::new(config.scheduler),
            config,
            resources,
            extensions,
            selections: SelectionTable::new(),
            clients,
            n_clients: 0,
            listeners: Vec::new(),
            state_listeners: Vec::new(),
            access,
            authorizer,
            modules: ext::builtin_modules(),
            types: objects.types,
            root: objects.root,
            default_colormap: objects.default_colormap,
            exception: None,
            terminating: false,
            terminate_at: None,
            started: Instant::now(),
        };
        server.init_modules()?;
        info!(
            "Server generation {} ready ({} client slots)",
            server.generation(),
            layout.max_clients() - 1
        );
        Ok(server)
    }

    fn init_modules(&mut self) -> Result<(), ServerError> {
        let modules = self.modules.clone();
        for module in modules {
            debug!("Initializing {}", module.name());
            module.init(self)?;
        }
        Ok(())
    }

    /// Add a module; it is initialized now and again every generation
    pub fn add_module(&mut self, module: Rc<dyn ExtensionModule>) -> Result<(), ServerError> {
        module.init(self)?;
        self.modules.push(module);
        Ok(())
    }

    /// Register an extension for the current generation
    pub fn add_extension(
        &mut self,
        name: &str,
        n_events: u8,
        n_errors: u8,
        handler: Rc<dyn ExtensionHandler>,
    ) -> Result<ExtensionHandle, ServerError> {
        self.extensions
            .add_extension(name, n_events, n_errors, handler)
            .ok_or_else(|| ServerError::ExtensionBudget(name.to_string()))
    }

    pub fn add_state_listener(&mut self, listener: Rc<dyn ClientStateListener>) {
        self.state_listeners.push(listener);
    }

    /// Replace the hook consulted for requests, resources and extension
    /// visibility
    pub fn set_access_hook(&mut self, hook: Rc<dyn AccessHook>) {
        self.resources.set_access_hook(Some(hook.clone()));
        self.extensions.set_visibility_hook(Some(hook.clone()));
        self.access = hook;
    }

    pub fn set_authorizer(&mut self, authorizer: Box<dyn Authorizer>) {
        self.authorizer = authorizer;
    }

    // Accessors

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn resources(&self) -> &ResourceDatabase {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut ResourceDatabase {
        &mut self.resources
    }

    pub fn extensions(&self) -> &ExtensionRegistry {
        &self.extensions
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn selection_owner(&self, selection: Atom) -> Option<&selection::Selection> {
        self.selections.get(selection)
    }

    pub fn object_types(&self) -> ObjectTypes {
        self.types
    }

    pub fn root_window(&self) -> Window {
        self.root
    }

    pub fn default_colormap(&self) -> Colormap {
        self.default_colormap
    }

    pub fn generation(&self) -> u32 {
        self.resources.generation()
    }

    pub fn client(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(id.index()).and_then(Option::as_ref)
    }

    pub fn client_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.clients.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Every occupied slot, in slot order
    pub fn clients(&self) -> impl Iterator<Item = &Client> {
        self.clients.iter().flatten()
    }

    /// Number of clients that completed setup and are still running
    pub fn n_clients(&self) -> usize {
        self.n_clients
    }

    pub fn exception(&self) -> Option<DispatchException> {
        self.exception
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating
    }

    /// Byte order to answer `client` in
    pub fn client_order(&self, client: ClientId) -> ByteOrder {
        self.client(client)
            .map(|c| c.byte_order())
            .unwrap_or_else(ByteOrder::native)
    }

    /// Milliseconds since the server started
    pub fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Protocol timestamp; wraps like the 32-bit server clock it models
    pub fn current_time(&self) -> Timestamp {
        let now = self.now_ms() as u32;
        // zero means CurrentTime on the wire
        now.max(1)
    }

    // Output

    /// Queue raw bytes for a client
    pub fn send(&mut self, client: ClientId, bytes: &[u8]) {
        if let Some(c) = self.client_mut(client) {
            if !c.is_gone() {
                c.send(bytes);
            }
        }
    }

    /// Deliver an event in the client's byte order, stamped with its last
    /// request's sequence number
    pub fn send_event(&mut self, client: ClientId, event: &Event) {
        let Some(c) = self.client_mut(client) else {
            return;
        };
        if c.is_gone() || c.state() != ClientState::Running {
            return;
        }
        let bytes = event.encode(c.byte_order(), c.sequence_number() as u16);
        c.send(&bytes);
    }

    // Grabs

    /// Give `client` the server grab; everybody else is parked
    pub fn grab_server(&mut self, client: ClientId) {
        debug!("{} grabbed the server", client);
        self.scheduler.grab(client);
    }

    /// Release the grab and requeue the parked clients in arrival order
    pub fn ungrab_server(&mut self) {
        if let Some(holder) = self.scheduler.ungrab() {
            debug!("{} released the server grab", holder);
        }
    }

    // Session lifecycle

    pub(crate) fn set_client_state(&mut self, id: ClientId, state: ClientState) {
        let Some(client) = self.client_mut(id) else {
            return;
        };
        client.set_state(state);
        debug!("{} is now {}", id, state);
        let listeners = self.state_listeners.clone();
        for listener in listeners {
            listener.client_state_changed(id, state);
        }
    }

    pub(crate) fn client_running(&mut self, id: ClientId) {
        self.set_client_state(id, ClientState::Running);
        self.n_clients += 1;
        self.terminate_at = None;
    }

    /// End a client's session.
    ///
    /// A client that is still connected loses its connection, its grab and
    /// its selections. Unless its close-down mode retains resources it is
    /// then destroyed together with everything it owns and its slot becomes
    /// free; a retaining client is parked in the retained state instead and
    /// only destroyed by a later kill.
    pub fn close_down(&mut self, id: ClientId) {
        let Some(client) = self.client(id) else {
            return;
        };
        let was_running = client.state() == ClientState::Running;
        let gone = client.is_gone();
        let really = gone || client.close_down_mode() == CloseDownMode::DestroyAll;

        if !gone {
            if self.scheduler.grabbed_by() == Some(id) {
                self.ungrab_server();
            }
            let released = self.selections.remove_client(id);
            if released > 0 {
                debug!("Released {} selection(s) of {}", released, id);
            }
            if !really {
                self.resources.free_never_retain(id);
                self.set_client_state(id, ClientState::Retained);
            }
            if let Some(client) = self.client_mut(id) {
                client.client_gone = true;
                client.close_connection();
            }
            self.scheduler.remove_client(id);
            if was_running {
                self.n_clients = self.n_clients.saturating_sub(1);
            }
            info!("{} disconnected ({} client(s) left)", id, self.n_clients);
        }

        if really {
            if was_running && self.n_clients == 0 {
                self.last_client_gone();
            }
            self.set_client_state(id, ClientState::Gone);
            self.resources.delete_all_for_client(id);
            self.release_dead_selections();
            self.scheduler.remove_client(id);
            if let Some(slot) = self.clients.get_mut(id.index()) {
                *slot = None;
            }
            debug!("{} destroyed, slot free", id);
        } else {
            info!("{} retained ({:?})", id, self.client(id).map(|c| c.close_down_mode()));
        }
    }

    /// Destroy every disconnected client that was retained temporarily
    pub fn close_down_retained_temporary(&mut self) {
        let victims: Vec<ClientId> = self
            .clients()
            .filter(|c| c.is_gone() && c.close_down_mode() == CloseDownMode::RetainTemporary)
            .map(|c| c.id())
            .collect();
        for id in victims {
            self.close_down(id);
        }
    }

    fn last_client_gone(&mut self) {
        match self.config.terminate {
            TerminatePolicy::Reset => self.exception = Some(DispatchException::Reset),
            TerminatePolicy::NoReset => {}
            TerminatePolicy::Terminate { delay_ms: 0 } => {
                self.exception = Some(DispatchException::Terminate)
            }
            TerminatePolicy::Terminate { delay_ms } => {
                self.terminate_at = Some(self.now_ms() + delay_ms);
                info!("Last client gone, terminating in {}ms", delay_ms);
            }
        }
    }

    /// Tear the current generation down and start the next one.
    ///
    /// Every client, retained or not, is destroyed first.
    pub fn reset(&mut self) -> Result<(), ServerError> {
        let ids: Vec<ClientId> = self.clients().map(|c| c.id()).collect();
        for id in ids {
            if let Some(client) = self.client_mut(id) {
                client.close_down_mode = CloseDownMode::DestroyAll;
            }
            self.close_down(id);
        }

        self.resources.reset();
        self.extensions.shutdown();
        self.selections.clear();
        self.scheduler.reset();

        let objects = objects::init_server_objects(&mut self.resources, &self.config.screen)?;
        self.types = objects.types;
        self.root = objects.root;
        self.default_colormap = objects.default_colormap;
        self.n_clients = 0;
        self.exception = None;
        self.terminate_at = None;
        self.init_modules()?;
        info!("Server reset, generation {}", self.generation());
        Ok(())
    }
}
