//! The in-process `hostname -> TLS server context` table, backed by a
//! request/reply round trip to the certificate factory on a miss.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::fs::File;
use tokio::sync::{Mutex, RwLock};

use crate::error::CertFactoryError;

use super::factory::{cert_path, key_path};
use super::fifo::{self, CertPipe};
use super::resolver::SniCertResolver;

const REPLY_OK: u8 = 0x00;

pub struct TlsContextCache {
    table: RwLock<HashMap<String, Arc<ServerConfig>>>,
    /// Serializes request/reply pairs across the FIFO so one worker's reply
    /// is never misrouted to another's request.
    pipe_lock: Mutex<()>,
    pipe: CertPipe,
    pem_dir: PathBuf,
}

impl TlsContextCache {
    pub fn new(pipe: CertPipe, pem_dir: PathBuf) -> Self {
        TlsContextCache {
            table: RwLock::new(HashMap::new()),
            pipe_lock: Mutex::new(()),
            pipe,
            pem_dir,
        }
    }

    /// Returns a ready-to-use server config for `host`, minting a
    /// certificate through the factory on first use. The `bool` tells the
    /// caller whether this was a cache hit, so it can report `SslOutcome`
    /// accurately.
    pub async fn get_or_create(
        &self,
        host: &str,
    ) -> Result<(Arc<ServerConfig>, bool), CertFactoryError> {
        if let Some(config) = self.table.read().await.get(host) {
            return Ok((config.clone(), true));
        }

        self.request_cert(host).await?;

        let config = Arc::new(self.build_server_config(host)?);
        // Last writer wins on a concurrent miss; both contexts are valid,
        // the older one is simply dropped.
        self.table.write().await.insert(host.to_string(), config.clone());
        Ok((config, false))
    }

    async fn request_cert(&self, host: &str) -> Result<(), CertFactoryError> {
        let _guard = self.pipe_lock.lock().await;

        let mut req_file = File::options()
            .write(true)
            .open(&self.pipe.req_path)
            .await
            .map_err(|_| CertFactoryError::FactoryGone)?;
        fifo::write_framed(&mut req_file, host.as_bytes())
            .await
            .map_err(|_| CertFactoryError::FactoryGone)?;

        let mut reply_file = File::open(&self.pipe.reply_path)
            .await
            .map_err(|_| CertFactoryError::FactoryGone)?;
        let frame = fifo::read_framed(&mut reply_file)
            .await
            .map_err(|_| CertFactoryError::FactoryGone)?
            .ok_or(CertFactoryError::FactoryGone)?;

        match frame.first() {
            Some(&REPLY_OK) => Ok(()),
            Some(_) => {
                let reason = String::from_utf8_lossy(&frame[1..]).into_owned();
                Err(CertFactoryError::Persist {
                    host: host.to_string(),
                    source: std::io::Error::other(reason),
                })
            }
            None => Err(CertFactoryError::FactoryGone),
        }
    }

    /// Builds a `ServerConfig` wrapping a [`SniCertResolver`] over the one
    /// `CertifiedKey` this connection needs, using
    /// `rustls::server::ResolvesServerCert` as the SNI-driven certificate
    /// selection hook.
    fn build_server_config(&self, host: &str) -> Result<ServerConfig, CertFactoryError> {
        let cert_bytes = std::fs::read(cert_path(&self.pem_dir, host))
            .map_err(|source| CertFactoryError::Persist { host: host.to_string(), source })?;
        let key_bytes = std::fs::read(key_path(&self.pem_dir, host))
            .map_err(|source| CertFactoryError::Persist { host: host.to_string(), source })?;

        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_bytes.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CertFactoryError::Persist {
                host: host.to_string(),
                source: std::io::Error::other(e),
            })?;
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_bytes.as_slice())
            .map_err(|e| CertFactoryError::Persist {
                host: host.to_string(),
                source: std::io::Error::other(e),
            })?
            .ok_or_else(|| CertFactoryError::Persist {
                host: host.to_string(),
                source: std::io::Error::other("no private key in key file"),
            })?;

        let signing_key = any_supported_type(&key).map_err(|e| CertFactoryError::Persist {
            host: host.to_string(),
            source: std::io::Error::other(e),
        })?;
        let certified_key = Arc::new(CertifiedKey::new(certs, signing_key));
        let resolver = Arc::new(SniCertResolver::new(certified_key));

        Ok(ServerConfig::builder().with_no_client_auth().with_cert_resolver(resolver))
    }
}
