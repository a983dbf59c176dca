//! x11dix - Main entry point
//!
//! Runs the dispatch kernel on its own, with no output device attached.
//! Useful for protocol conformance work and as a headless sink for clients.

use clap::Parser;
use std::process;
use x11dix::config::{SchedulerConfig, ServerConfig, TerminatePolicy};
use x11dix::security::SecurityPolicy;
use x11dix::{Server, VERSION};

#[derive(Parser, Debug)]
#[command(name = "x11dix")]
#[command(about = "Device-independent X11 server kernel")]
#[command(version)]
struct Cli {
    /// Display number
    #[arg(short, long, default_value_t = 1)]
    display: u16,

    /// Listen on TCP (port 6000 + display)
    #[arg(long)]
    tcp: bool,

    /// Do not listen on the local socket
    #[arg(long)]
    no_unix: bool,

    /// Number of client slots (power of two, 64 to 2048)
    #[arg(long, default_value_t = 256)]
    limit_clients: usize,

    /// Base scheduler time slice in milliseconds
    #[arg(long, default_value_t = 20)]
    sched_interval: u64,

    /// Longest scheduler time slice in milliseconds
    #[arg(long, default_value_t = 320)]
    sched_max: u64,

    /// Plain round-robin scheduling
    #[arg(long)]
    dumb_sched: bool,

    /// Keep serving the same generation when the last client leaves
    #[arg(long, conflicts_with = "terminate")]
    noreset: bool,

    /// Exit when the last client leaves, after this many milliseconds
    /// without a new connection
    #[arg(long, value_name = "DELAY_MS", num_args = 0..=1, default_missing_value = "0")]
    terminate: Option<u64>,

    /// Require this MIT-MAGIC-COOKIE-1 (hex) from every client
    #[arg(long, value_name = "HEX")]
    cookie: Option<String>,

    /// Security preset: permissive, default, strict
    #[arg(long, default_value = "default")]
    security: String,
}

fn parse_hex(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err("cookie must have an even number of hex digits".to_string());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| format!("invalid hex in cookie: {}", s))
        })
        .collect()
}

fn build_config(cli: Cli) -> Result<ServerConfig, String> {
    let security = SecurityPolicy::preset(&cli.security)
        .ok_or_else(|| format!("Invalid security level: {}", cli.security))?;
    let terminate = match (cli.noreset, cli.terminate) {
        (_, Some(delay_ms)) => TerminatePolicy::Terminate { delay_ms },
        (true, None) => TerminatePolicy::NoReset,
        (false, None) => TerminatePolicy::Reset,
    };
    let auth_cookie = cli.cookie.as_deref().map(parse_hex).transpose()?;
    Ok(ServerConfig {
        display: cli.display,
        listen_tcp: cli.tcp,
        listen_unix: !cli.no_unix,
        limit_clients: cli.limit_clients,
        scheduler: SchedulerConfig {
            interval_ms: cli.sched_interval,
            max_slice_ms: cli.sched_max,
            disabled: cli.dumb_sched,
        },
        terminate,
        auth_cookie,
        security,
        ..ServerConfig::default()
    })
}

fn main() {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match build_config(cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {}", err);
            process::exit(1);
        }
    };

    log::info!("x11dix v{}", VERSION);
    log::info!("Display: :{}", config.display);
    log::info!("TCP listening: {}", config.listen_tcp);
    log::info!("Unix socket listening: {}", config.listen_unix);
    log::info!(
        "Security policy: isolate_untrusted={}, hide_unsafe_extensions={}",
        config.security.isolate_untrusted,
        config.security.hide_unsafe_extensions
    );

    let mut server = match Server::new(config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: Failed to initialize server: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = server.listen() {
        eprintln!("Error: Failed to start listening: {}", e);
        process::exit(1);
    }

    if let Err(e) = server.run() {
        log::error!("Server stopped: {}", e);
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["x11dix"]);
        let config = build_config(cli).unwrap();
        assert_eq!(config.display, 1);
        assert!(config.listen_unix);
        assert_eq!(config.terminate, TerminatePolicy::Reset);
        assert!(config.auth_cookie.is_none());
    }

    #[test]
    fn test_cli_terminate_and_cookie() {
        let cli = Cli::parse_from(["x11dix", "--terminate", "500", "--cookie", "0aff"]);
        let config = build_config(cli).unwrap();
        assert_eq!(config.terminate, TerminatePolicy::Terminate { delay_ms: 500 });
        assert_eq!(config.auth_cookie, Some(vec![0x0a, 0xff]));

        let cli = Cli::parse_from(["x11dix", "--security", "bogus"]);
        assert!(build_config(cli).is_err());
    }
}
