//! Dynamic per-SNI-hostname TLS certificate issuance: a local CA
//! ([`factory::CertificateAuthority`]), a FIFO-based request/reply
//! protocol to a dedicated minting task ([`fifo`], [`factory::run`]), and
//! an in-process cache handlers consult before completing a handshake
//! ([`cache::TlsContextCache`]).

pub mod cache;
pub mod factory;
pub mod fifo;
pub mod resolver;

pub use cache::TlsContextCache;
pub use factory::CertificateAuthority;
pub use fifo::CertPipe;
