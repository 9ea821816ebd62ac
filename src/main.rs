//! Entry point: parse argv, stand up the ambient stack (logging, the CA,
//! the certificate factory), optionally drop privileges, then hand off to
//! the dispatcher until it returns on SIGTERM.

mod certs;
mod classify;
mod config;
mod conn;
mod dispatcher;
mod error;
mod responses;
mod signals;
mod stats;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use certs::{CertPipe, CertificateAuthority, TlsContextCache};
use config::{Args, Config};
use error::StartupError;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Config::from_args can fail (too many -p/-k ports) before anything
    // that needs a logger exists yet, so it's reported straight to stderr.
    let cfg = match Config::from_args(args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("pixelserv-rs: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(cfg.log_level);
    info!(version = env!("CARGO_PKG_VERSION"), "pixelserv-rs starting");
    if std::env::args().any(|a| a == "-r") {
        tracing::debug!("-r is deprecated and ignored");
    }

    match run(cfg).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!("fatal startup error: {e}");
            std::process::exit(1);
        }
    }
}

/// Maps the `-l` 0..5 verbosity scale (`pixelserv.c`'s `log_level`) onto a
/// `tracing` level filter. `tracing` has no "critical"/"notice" levels,
/// so they collapse onto the nearest neighbor.
fn level_filter_for(log_level: u8) -> &'static str {
    match log_level {
        0 | 1 => "error",
        2 => "warn",
        3 | 4 => "info",
        _ => "debug",
    }
}

fn init_tracing(log_level: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_filter_for(log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// The fallible bulk of startup: CA load, FIFO/factory stand-up, listener
/// binding, privilege drop, then the dispatcher's main loop.
async fn run(cfg: Config) -> Result<(), StartupError> {
    tokio::fs::create_dir_all(&cfg.pem_dir)
        .await
        .map_err(|source| StartupError::PemDir { dir: cfg.pem_dir.clone(), source })?;

    // Missing CA material is fatal at startup; the dispatcher never runs
    // without a CA to sign leaf certs from.
    let ca = CertificateAuthority::load(&cfg.pem_dir).await?;

    // The FIFO lives next to the pem dir, not inside it.
    let runtime_dir = cfg.pem_dir.parent().map(|p| p.to_path_buf()).unwrap_or_else(|| cfg.pem_dir.clone());
    tokio::fs::create_dir_all(&runtime_dir)
        .await
        .map_err(|source| StartupError::PemDir { dir: runtime_dir.clone(), source })?;
    let factory_pipe = CertPipe::create(&runtime_dir)?;

    if let Some(user) = &cfg.user {
        chown_to_service_user(&factory_pipe, user)?;
    }

    let cache_pipe = factory_pipe.clone();
    let pem_dir = cfg.pem_dir.clone();
    tokio::spawn(certs::factory::run(ca, factory_pipe, pem_dir));

    let tls_cache = Arc::new(TlsContextCache::new(cache_pipe, cfg.pem_dir.clone()));

    // Bind every listener (may require root for ports < 1024) before
    // dropping privileges, never after.
    let listeners = dispatcher::bind_all(&cfg)?;

    if let Some(user) = &cfg.user {
        drop_privileges(user)?;
        info!(user, "dropped privileges");
    }

    dispatcher::run(Arc::new(cfg), tls_cache, listeners).await
}

/// `chown`s both halves of the certificate-factory FIFO to the service
/// user. Must run while still root, i.e. before [`drop_privileges`].
fn chown_to_service_user(pipe: &CertPipe, user: &str) -> Result<(), StartupError> {
    let account = nix::unistd::User::from_name(user)
        .map_err(|source| StartupError::PrivilegeDrop { user: user.to_string(), source })?
        .ok_or_else(|| StartupError::UnknownUser(user.to_string()))?;

    for path in [&pipe.req_path, &pipe.reply_path] {
        nix::unistd::chown(path, Some(account.uid), Some(account.gid))
            .map_err(|source| StartupError::PrivilegeDrop { user: user.to_string(), source })?;
    }
    Ok(())
}

/// Drops root to the configured service user once listeners are bound.
/// Group is dropped before user, matching the usual `setgid`-then-`setuid`
/// ordering (dropping uid first would forfeit the permission needed to
/// change gid).
fn drop_privileges(user: &str) -> Result<(), StartupError> {
    let account = nix::unistd::User::from_name(user)
        .map_err(|source| StartupError::PrivilegeDrop { user: user.to_string(), source })?
        .ok_or_else(|| StartupError::UnknownUser(user.to_string()))?;

    nix::unistd::setgid(account.gid)
        .map_err(|source| StartupError::PrivilegeDrop { user: user.to_string(), source })?;
    nix::unistd::setuid(account.uid)
        .map_err(|source| StartupError::PrivilegeDrop { user: user.to_string(), source })?;
    Ok(())
}
