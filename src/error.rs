//! Error taxonomy. Startup errors are fatal and bubble to `main`; connection
//! errors never leave the task that produced them -- they are converted into
//! a [`crate::classify::Classification`]/[`crate::classify::SslOutcome`] pair
//! and posted to the dispatcher instead.

use std::io;
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum StartupError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("more than {max} TLS ports requested with -k")]
    TooManyTlsPorts { max: usize },

    #[error("more than {max} ports requested with -p")]
    TooManyPorts { max: usize },

    #[error("failed to create request pipe at {path}: {source}")]
    PipeCreate {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("failed to load CA material from {dir}: {source}")]
    CaLoad {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("CA certificate in {dir} is malformed: {reason}")]
    CaMalformed { dir: PathBuf, reason: String },

    #[error("failed to spawn certificate factory: {0}")]
    FactorySpawn(String),

    #[error("invalid PEM directory {dir}: {source}")]
    PemDir {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to drop privileges to user {user}: {source}")]
    PrivilegeDrop {
        user: String,
        #[source]
        source: nix::Error,
    },

    #[error("user {0:?} not found")]
    UnknownUser(String),
}

#[derive(thiserror::Error, Debug)]
pub enum ConnError {
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("peer closed during handshake")]
    HandshakeClosed,

    #[error("read timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("peer closed connection")]
    PeerClosed,

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum CertFactoryError {
    #[error("hostname {0:?} is not a valid DNS name")]
    InvalidHostname(String),

    #[error("failed to mint certificate for {host}: {source}")]
    Mint {
        host: String,
        #[source]
        source: rcgen::Error,
    },

    #[error("failed to persist certificate for {host}: {source}")]
    Persist {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("certificate factory channel closed")]
    FactoryGone,
}
