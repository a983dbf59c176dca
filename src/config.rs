//! Server configuration

use crate::error::ServerError;
use crate::security::SecurityPolicy;

/// Base TCP port; display `n` listens on `X11_TCP_BASE + n`
pub const X11_TCP_BASE: u16 = 6000;

/// Directory holding the local display sockets
pub const X11_UNIX_DIR: &str = "/tmp/.X11-unix";

/// Smart scheduler tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Base time slice in milliseconds
    pub interval_ms: u64,
    /// Upper bound the slice may grow to while one client runs alone
    pub max_slice_ms: u64,
    /// Plain round-robin with a fixed request budget per turn
    pub disabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            interval_ms: 20,
            max_slice_ms: 320,
            disabled: false,
        }
    }
}

/// What happens once the last running client has gone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminatePolicy {
    /// Start a new server generation
    #[default]
    Reset,
    /// Keep the current generation and wait for new clients
    NoReset,
    /// Exit, after `delay_ms` without a new connection
    Terminate { delay_ms: u64 },
}

/// Geometry advertised for the single screen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenConfig {
    pub width: u16,
    pub height: u16,
    pub width_mm: u16,
    pub height_mm: u16,
    pub depth: u8,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        ScreenConfig {
            width: 1920,
            height: 1080,
            width_mm: 508,
            height_mm: 286,
            depth: 24,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub display: u16,
    pub listen_tcp: bool,
    pub listen_unix: bool,
    /// Number of client slots, including the server's own slot
    pub limit_clients: usize,
    pub scheduler: SchedulerConfig,
    pub terminate: TerminatePolicy,
    /// MIT-MAGIC-COOKIE-1 secret; `None` accepts every connection
    pub auth_cookie: Option<Vec<u8>>,
    pub security: SecurityPolicy,
    pub vendor: String,
    pub release: u32,
    pub screen: ScreenConfig,
    /// Largest request accepted under BIG-REQUESTS, in 4-byte units
    pub max_big_request_len: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            display: 1,
            listen_tcp: false,
            listen_unix: cfg!(unix),
            limit_clients: 256,
            scheduler: SchedulerConfig::default(),
            terminate: TerminatePolicy::default(),
            auth_cookie: None,
            security: SecurityPolicy::default(),
            vendor: "x11dix".to_string(),
            release: 12_101_000,
            screen: ScreenConfig::default(),
            max_big_request_len: 4_194_303,
        }
    }
}

impl ServerConfig {
    /// TCP port for this display
    pub fn tcp_port(&self) -> u16 {
        X11_TCP_BASE.saturating_add(self.display)
    }

    /// Path of the local socket for this display
    pub fn unix_path(&self) -> String {
        format!("{}/X{}", X11_UNIX_DIR, self.display)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if !self.limit_clients.is_power_of_two() || !(64..=2048).contains(&self.limit_clients) {
            return Err(ServerError::Config(format!(
                "client limit must be a power of two between 64 and 2048, got {}",
                self.limit_clients
            )));
        }
        if self.scheduler.interval_ms == 0 || self.scheduler.max_slice_ms < self.scheduler.interval_ms
        {
            return Err(ServerError::Config(format!(
                "scheduler slice {}ms/{}ms is not usable",
                self.scheduler.interval_ms, self.scheduler.max_slice_ms
            )));
        }
        if self.max_big_request_len < u16::MAX as u32 {
            return Err(ServerError::Config(
                "maximum big request length is below the core limit".to_string(),
            ));
        }
        if self.vendor.len() > u16::MAX as usize {
            return Err(ServerError::Config("vendor string too long".to_string()));
        }
        Ok(())
    }
}
