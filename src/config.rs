//! Command-line surface and the immutable [`Config`] derived from it.
//!
//! Defaults mirror `pixelserv-tls`'s `DEFAULT_PORT`/`SECOND_PORT`/
//! `DEFAULT_PEM_PATH`/`DEFAULT_TIMEOUT`/`DEFAULT_KEEPALIVE`/
//! `DEFAULT_THREAD_MAX`/`MAX_PORTS`/`MAX_TLS_PORTS`/`BACKLOG`.

use std::path::PathBuf;

use clap::Parser;

use crate::error::StartupError;

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_HTTPS_PORT: u16 = 443;
pub const DEFAULT_PEM_DIR: &str = "/etc/pixelserv/";
pub const DEFAULT_TIMEOUT_SECS: u64 = 2;
pub const DEFAULT_KEEPALIVE_SECS: u64 = 5;
pub const DEFAULT_THREAD_MAX: usize = 100;
pub const MAX_PORTS: usize = 8;
pub const MAX_TLS_PORTS: usize = 8;
pub const BACKLOG: i32 = 20;
pub const DEFAULT_STATS_URL: &str = "/servstats";
pub const DEFAULT_STATS_TEXT_URL: &str = "/servstats.txt";

#[derive(Parser, Debug, Clone)]
#[command(name = "pixelserv-rs", version, about = "Ad-blackhole pixel/204 server with dynamic per-SNI TLS certs")]
pub struct Args {
    /// Bind address or hostname (default: 0.0.0.0)
    #[clap(default_value = "0.0.0.0")]
    pub bind_addr: String,

    /// Disable HTTP 204 reply to generate_204 URLs
    #[clap(short = '2', default_value_t = false)]
    pub no_204: bool,

    /// Stay in the foreground (accepted for CLI compatibility; this build never daemonizes)
    #[clap(short = 'f', default_value_t = false)]
    pub foreground: bool,

    /// Deprecated, ignored; kept for command-line compatibility
    #[clap(short = 'r', hide = true, default_value_t = false)]
    pub deprecated_r: bool,

    /// Disable redirect to the decoded path embedded in tracker links
    #[clap(short = 'R', default_value_t = false)]
    pub no_redirect: bool,

    /// Log level: 0 critical, 1 error (default), 2 warning, 3 notice, 4 info, 5 debug
    #[clap(short = 'l', default_value_t = 1)]
    pub log_level: u8,

    /// Bind to a named interface instead of all interfaces
    #[clap(short = 'n')]
    pub iface: Option<String>,

    /// Per-read timeout in seconds
    #[clap(short = 'o', default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub select_timeout: u64,

    /// HTTP/1.1 keep-alive ceiling in seconds
    #[clap(short = 'O', default_value_t = DEFAULT_KEEPALIVE_SECS)]
    pub http_keepalive: u64,

    /// Add an HTTP listener port (repeatable)
    #[clap(short = 'p')]
    pub http_ports: Vec<u16>,

    /// Add an HTTPS listener port (repeatable)
    #[clap(short = 'k')]
    pub https_ports: Vec<u16>,

    /// Relative stats HTML URL
    #[clap(short = 's', default_value = DEFAULT_STATS_URL)]
    pub stats_url: String,

    /// Relative stats text URL
    #[clap(short = 't', default_value = DEFAULT_STATS_TEXT_URL)]
    pub stats_text_url: String,

    /// Max concurrent connection workers
    #[clap(short = 'T', default_value_t = DEFAULT_THREAD_MAX)]
    pub max_service_threads: usize,

    /// Drop privileges to this user after binding (no-op if absent or unprivileged)
    #[clap(short = 'u')]
    pub user: Option<String>,

    /// Warn when elapsed connection time exceeds this many milliseconds (debug builds only)
    #[clap(short = 'w')]
    pub warn_ms: Option<u64>,

    /// Directory holding ca.crt/ca.key and minted per-host certs
    #[clap(short = 'z', default_value = DEFAULT_PEM_DIR)]
    pub pem_dir: PathBuf,
}

/// Resolved, validated server configuration. Unlike `Args`, port policy has
/// already been applied (see [`Config::from_args`]).
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub do_204: bool,
    pub do_redirect: bool,
    pub log_level: u8,
    pub iface: Option<String>,
    pub select_timeout: std::time::Duration,
    pub http_keepalive: std::time::Duration,
    /// All ports to listen on, HTTP and HTTPS alike.
    pub ports: Vec<u16>,
    /// Subset of `ports` that should be handled as TLS listeners.
    pub tls_ports: Vec<u16>,
    pub stats_url: String,
    pub stats_text_url: String,
    pub max_service_threads: usize,
    pub user: Option<String>,
    pub warn_ms: Option<u64>,
    pub pem_dir: PathBuf,
}

impl Config {
    /// Resolves `-k`/`-p` into the final listener set. Excess ports past
    /// the configured maximum are a hard error here, instead of
    /// `pixelserv.c`'s silent fallthrough that registers a would-be TLS
    /// port as plaintext HTTP.
    pub fn from_args(args: Args) -> Result<Self, StartupError> {
        if args.https_ports.len() > MAX_TLS_PORTS {
            return Err(StartupError::TooManyTlsPorts { max: MAX_TLS_PORTS });
        }
        if args.http_ports.len() > MAX_PORTS {
            return Err(StartupError::TooManyPorts { max: MAX_PORTS });
        }

        let mut ports = args.http_ports.clone();
        let mut tls_ports = args.https_ports.clone();

        if ports.is_empty() && tls_ports.is_empty() {
            // no -p and no -k: open both defaults
            ports.push(DEFAULT_HTTP_PORT);
            tls_ports.push(DEFAULT_HTTPS_PORT);
        } else if tls_ports.is_empty() {
            // only -p: add the default HTTPS port
            tls_ports.push(DEFAULT_HTTPS_PORT);
        } else if ports.is_empty() {
            // only -k: add the default HTTP port
            ports.push(DEFAULT_HTTP_PORT);
        }

        let mut all_ports = ports;
        for p in &tls_ports {
            if !all_ports.contains(p) {
                all_ports.push(*p);
            }
        }

        Ok(Config {
            bind_addr: args.bind_addr,
            do_204: !args.no_204,
            do_redirect: !args.no_redirect,
            log_level: args.log_level,
            iface: args.iface,
            select_timeout: std::time::Duration::from_secs(args.select_timeout),
            http_keepalive: std::time::Duration::from_secs(args.http_keepalive),
            ports: all_ports,
            tls_ports,
            stats_url: args.stats_url,
            stats_text_url: args.stats_text_url,
            max_service_threads: args.max_service_threads,
            user: args.user,
            warn_ms: args.warn_ms,
            pem_dir: args.pem_dir,
        })
    }

    pub fn is_tls_port(&self, port: u16) -> bool {
        self.tls_ports.contains(&port)
    }
}
