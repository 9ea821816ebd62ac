//! Per-connection plumbing: protocol sniffing (TLS vs. plaintext), minimal
//! HTTP request-line/header parsing, and the connection handler state
//! machine that ties them together.

pub mod handler;
pub mod http;
pub mod sniff;
