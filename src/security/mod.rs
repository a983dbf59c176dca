//! Security and isolation
//!
//! This module decides what a client may do: whether its connection is
//! authorized at all, which requests it may issue, which resources of other
//! clients it may touch, and which extensions it can discover.

use crate::protocol::{opcodes, ClientId, XID};
use bitflags::bitflags;
use log::debug;

bitflags! {
    /// Kinds of access requested on a resource
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const DESTROY = 1 << 2;
        const CREATE = 1 << 3;
        const GET_ATTR = 1 << 4;
        const SET_ATTR = 1 << 5;
        const LIST = 1 << 6;
        const ADD = 1 << 7;
        const REMOVE = 1 << 8;
        const USE = 1 << 9;
        const MANAGE = 1 << 10;
    }
}

/// Access that untrusted clients keep on server-owned resources such as the
/// root window. ADD and REMOVE let them parent top-level windows on root.
const SERVER_RESOURCE_ACCESS: Access = Access::READ
    .union(Access::GET_ATTR)
    .union(Access::USE)
    .union(Access::LIST)
    .union(Access::ADD)
    .union(Access::REMOVE);

/// The party an access decision is made for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessSubject {
    pub client: ClientId,
    pub trusted: bool,
}

impl AccessSubject {
    /// The server's own pseudo-client
    pub const SERVER: AccessSubject = AccessSubject {
        client: ClientId::SERVER,
        trusted: true,
    };
}

/// Veto points consulted by the dispatcher, the resource database and the
/// extension registry. Every hook allows by default.
pub trait AccessHook {
    /// Checked before a request reaches its handler
    fn request_allowed(&self, _subject: &AccessSubject, _major: u8, _minor: u16) -> bool {
        true
    }

    /// Checked by access-controlled resource lookups
    fn resource_access(
        &self,
        _subject: &AccessSubject,
        _owner: &AccessSubject,
        _id: XID,
        _type_name: &str,
        _access: Access,
    ) -> bool {
        true
    }

    /// Checked by QueryExtension and ListExtensions
    fn extension_visible(&self, _subject: &AccessSubject, _name: &str, _untrusted_safe: bool) -> bool {
        true
    }
}

/// Security policy configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityPolicy {
    /// Untrusted clients may only touch resources of other untrusted clients,
    /// plus read-only use of server-owned resources
    pub isolate_untrusted: bool,

    /// Allow GrabServer from untrusted clients
    pub allow_untrusted_grabs: bool,

    /// Allow KillClient and SetCloseDownMode from untrusted clients
    pub allow_untrusted_kill: bool,

    /// Hide extensions not marked safe for untrusted clients
    pub hide_unsafe_extensions: bool,

    /// Maximum resources per client (0 = unlimited)
    pub max_resources_per_client: usize,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        SecurityPolicy {
            isolate_untrusted: true,
            allow_untrusted_grabs: false,
            allow_untrusted_kill: false,
            hide_unsafe_extensions: true,
            max_resources_per_client: 10_000,
        }
    }
}

impl SecurityPolicy {
    /// Create a permissive policy (for testing) - allows everything
    pub fn permissive() -> Self {
        SecurityPolicy {
            isolate_untrusted: false,
            allow_untrusted_grabs: true,
            allow_untrusted_kill: true,
            hide_unsafe_extensions: false,
            max_resources_per_client: 0,
        }
    }

    /// Create a strict policy (maximum security)
    pub fn strict() -> Self {
        SecurityPolicy {
            isolate_untrusted: true,
            allow_untrusted_grabs: false,
            allow_untrusted_kill: false,
            hide_unsafe_extensions: true,
            max_resources_per_client: 1000,
        }
    }

    /// Look up a preset by name
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "permissive" => Some(Self::permissive()),
            "default" => Some(Self::default()),
            "strict" => Some(Self::strict()),
            _ => None,
        }
    }
}

impl AccessHook for SecurityPolicy {
    fn request_allowed(&self, subject: &AccessSubject, major: u8, _minor: u16) -> bool {
        if subject.trusted {
            return true;
        }
        let allowed = match major {
            opcodes::GRAB_SERVER => self.allow_untrusted_grabs,
            opcodes::KILL_CLIENT | opcodes::SET_CLOSE_DOWN_MODE => self.allow_untrusted_kill,
            _ => true,
        };
        if !allowed {
            debug!(
                "Denied {} from untrusted {}",
                opcodes::name(major),
                subject.client
            );
        }
        allowed
    }

    fn resource_access(
        &self,
        subject: &AccessSubject,
        owner: &AccessSubject,
        id: XID,
        type_name: &str,
        access: Access,
    ) -> bool {
        if subject.trusted || !self.isolate_untrusted || !owner.trusted {
            return true;
        }
        if owner.client.is_server() && SERVER_RESOURCE_ACCESS.contains(access) {
            return true;
        }
        debug!(
            "Denied {:?} on {} {} to untrusted {}",
            access, type_name, id, subject.client
        );
        false
    }

    fn extension_visible(&self, subject: &AccessSubject, _name: &str, untrusted_safe: bool) -> bool {
        subject.trusted || untrusted_safe || !self.hide_unsafe_extensions
    }
}

/// Outcome of checking a connection's authorization data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny(String),
}

/// Decides whether a connection may proceed past setup
pub trait Authorizer {
    fn authorize(&self, protocol_name: &str, data: &[u8]) -> AuthDecision;
}

/// Accepts every connection
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _protocol_name: &str, _data: &[u8]) -> AuthDecision {
        AuthDecision::Allow
    }
}

/// Name of the shared-secret authorization protocol
pub const MIT_MAGIC_COOKIE: &str = "MIT-MAGIC-COOKIE-1";

/// Shared-secret check against a single cookie
#[derive(Debug, Clone)]
pub struct CookieAuthorizer {
    cookie: Vec<u8>,
}

impl CookieAuthorizer {
    pub fn new(cookie: Vec<u8>) -> Self {
        CookieAuthorizer { cookie }
    }
}

impl Authorizer for CookieAuthorizer {
    fn authorize(&self, protocol_name: &str, data: &[u8]) -> AuthDecision {
        if protocol_name.is_empty() {
            return AuthDecision::Deny(
                "Authorization required, but no authorization protocol specified".to_string(),
            );
        }
        if protocol_name != MIT_MAGIC_COOKIE {
            return AuthDecision::Deny(format!(
                "Authorization protocol {} not supported",
                protocol_name
            ));
        }
        // compare every byte so timing does not leak the matching prefix
        let same = data.len() == self.cookie.len()
            && data
                .iter()
                .zip(&self.cookie)
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0;
        if same {
            AuthDecision::Allow
        } else {
            AuthDecision::Deny(format!("Invalid {} key", MIT_MAGIC_COOKIE))
        }
    }
}
