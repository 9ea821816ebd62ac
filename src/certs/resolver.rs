//! Synchronous SNI-driven certificate selection for `rustls`. The real
//! work -- asking the factory, minting, loading -- happens ahead of time
//! in [`super::cache::TlsContextCache::get_or_create`]; this resolver only
//! ever reads a table entry a connection handler already primed.

use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;

/// Bridges the async [`super::cache::TlsContextCache`] into rustls's
/// synchronous `resolve` hook. A connection handler calls
/// `TlsContextCache::get_or_create` for the sniffed SNI hostname *before*
/// constructing the `ServerConfig` that wraps this resolver, so by the
/// time rustls invokes `resolve` the answer is already cached.
#[derive(Debug)]
pub struct SniCertResolver {
    certified_key: Arc<CertifiedKey>,
}

impl SniCertResolver {
    pub fn new(certified_key: Arc<CertifiedKey>) -> Self {
        SniCertResolver { certified_key }
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.certified_key.clone())
    }
}
