//! The certificate factory: loads the local CA once, mints per-hostname
//! leaf certificates on demand, and persists them under the PEM directory.
//! `pixelserv.c` runs this as either a forked child or the main process
//! itself; here it is a dedicated Tokio task instead.

use std::path::{Path, PathBuf};

use rcgen::{CertificateParams, DistinguishedName, DnType, Issuer, KeyPair, SerialNumber};
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::{CertFactoryError, StartupError};

use super::fifo::{self, CertPipe};

/// `pixelserv.c`'s default validity window: ten years, backdated by one day
/// to tolerate clock skew on the client.
const LEAF_VALIDITY_DAYS: i64 = 3650;
const LEAF_BACKDATE_DAYS: i64 = 1;

const REPLY_OK: u8 = 0x00;
const REPLY_ERR: u8 = 0x01;

pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    /// Present when `ca.crt` held more than one certificate at load time --
    /// an intermediate chain to attach to every minted leaf.
    chain_pem: Option<String>,
}

impl CertificateAuthority {
    pub async fn load(pem_dir: &Path) -> Result<Self, StartupError> {
        let cert_path = pem_dir.join("ca.crt");
        let key_path = pem_dir.join("ca.key");

        let cert_pem = fs::read_to_string(&cert_path)
            .await
            .map_err(|source| StartupError::CaLoad { dir: pem_dir.to_path_buf(), source })?;
        let key_pem = fs::read_to_string(&key_path)
            .await
            .map_err(|source| StartupError::CaLoad { dir: pem_dir.to_path_buf(), source })?;

        let cert_count = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| StartupError::CaMalformed {
                dir: pem_dir.to_path_buf(),
                reason: source.to_string(),
            })?
            .len();

        if cert_count == 0 {
            return Err(StartupError::CaMalformed {
                dir: pem_dir.to_path_buf(),
                reason: "ca.crt contains no certificates".into(),
            });
        }

        let chain_pem = if cert_count > 1 {
            info!(
                dir = %pem_dir.display(),
                certs = cert_count,
                "ca.crt carries an intermediate chain; attaching it to every minted leaf"
            );
            Some(cert_pem.clone())
        } else {
            None
        };

        let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| StartupError::CaMalformed {
            dir: pem_dir.to_path_buf(),
            reason: e.to_string(),
        })?;

        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair).map_err(|e| {
            StartupError::CaMalformed { dir: pem_dir.to_path_buf(), reason: e.to_string() }
        })?;

        Ok(CertificateAuthority { issuer, chain_pem })
    }

    fn mint(&self, host: &str) -> Result<(String, String), CertFactoryError> {
        let mut params = CertificateParams::new(vec![host.to_string()]).map_err(|source| {
            CertFactoryError::Mint { host: host.to_string(), source }
        })?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - TimeDuration::days(LEAF_BACKDATE_DAYS);
        params.not_after = now + TimeDuration::days(LEAF_VALIDITY_DAYS);
        let serial = leaf_serial(host);
        info!(host, serial = %hex::encode(serial), "minting leaf certificate");
        params.serial_number = Some(SerialNumber::from_slice(&serial));

        let leaf_key = KeyPair::generate()
            .map_err(|source| CertFactoryError::Mint { host: host.to_string(), source })?;
        let leaf_cert = params
            .signed_by(&leaf_key, &self.issuer)
            .map_err(|source| CertFactoryError::Mint { host: host.to_string(), source })?;

        let mut cert_pem = leaf_cert.pem();
        if let Some(chain) = &self.chain_pem {
            cert_pem.push('\n');
            cert_pem.push_str(chain);
        }

        Ok((cert_pem, leaf_key.serialize_pem()))
    }
}

/// Hostname hash used as a deterministic serial, so re-minting the same
/// host twice never produces two different serials. Top bit cleared so
/// the DER INTEGER encoding never needs an extra leading zero byte.
fn leaf_serial(host: &str) -> [u8; 8] {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(host.as_bytes());
    let mut serial = [0u8; 8];
    serial.copy_from_slice(&digest[..8]);
    serial[0] &= 0x7f;
    serial
}

pub fn validate_hostname(host: &str) -> Result<String, CertFactoryError> {
    let host = host.trim().to_ascii_lowercase();
    if host.is_empty() || host.len() > 255 || host.contains('\0') {
        return Err(CertFactoryError::InvalidHostname(host));
    }
    if !host.split('.').all(|label| !label.is_empty() && label.len() <= 63) {
        return Err(CertFactoryError::InvalidHostname(host));
    }
    Ok(host)
}

pub fn cert_path(pem_dir: &Path, host: &str) -> PathBuf {
    pem_dir.join(format!("{host}.crt"))
}

pub fn key_path(pem_dir: &Path, host: &str) -> PathBuf {
    pem_dir.join(format!("{host}.key"))
}

/// Returns the cached cert if one is already on disk and parses,
/// otherwise mints and persists a fresh one.
async fn ensure_cert(
    ca: &CertificateAuthority,
    pem_dir: &Path,
    host: &str,
) -> Result<(), CertFactoryError> {
    let host = validate_hostname(host)?;
    let cert_file = cert_path(pem_dir, &host);
    let key_file = key_path(pem_dir, &host);

    if let (Ok(existing_cert), Ok(existing_key)) =
        (fs::read(&cert_file).await, fs::read(&key_file).await)
    {
        let parses = rustls_pemfile::certs(&mut existing_cert.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .is_ok_and(|certs| !certs.is_empty())
            && rustls_pemfile::private_key(&mut existing_key.as_slice()).is_ok_and(|k| k.is_some());
        if parses {
            return Ok(());
        }
    }

    let (cert_pem, key_pem) = ca.mint(&host)?;
    persist_atomic(&cert_file, cert_pem.as_bytes())
        .await
        .map_err(|source| CertFactoryError::Persist { host: host.clone(), source })?;
    persist_atomic(&key_file, key_pem.as_bytes())
        .await
        .map_err(|source| CertFactoryError::Persist { host, source })?;
    Ok(())
}

/// Write-to-temp-then-rename so a reader never observes a partial file.
/// The temp name mixes the pid with a random suffix so two overlapping
/// writes for the same host (a racing double-mint) never collide on the
/// same path.
async fn persist_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension(format!(
        "{}.tmp-{}-{}",
        path.extension().and_then(|e| e.to_str()).unwrap_or("pem"),
        std::process::id(),
        fastrand::u32(..),
    ));
    let mut tmp = fs::File::create(&tmp_path).await?;
    tmp.write_all(contents).await?;
    tmp.flush().await?;
    fs::rename(&tmp_path, path).await
}

/// Runs the factory's request/reply loop over the FIFO pair until the
/// request FIFO's writer side disappears for good (process shutdown).
pub async fn run(ca: CertificateAuthority, pipe: CertPipe, pem_dir: PathBuf) {
    loop {
        match tokio::fs::File::open(&pipe.req_path).await {
            Ok(mut req_file) => loop {
                match fifo::read_framed(&mut req_file).await {
                    Ok(Some(frame)) => {
                        let host = String::from_utf8_lossy(&frame).into_owned();
                        let result = ensure_cert(&ca, &pem_dir, &host).await;
                        if let Err(e) = reply(&pipe, &result).await {
                            tracing::warn!("certificate factory reply write failed: {e}");
                        }
                        if let Err(e) = result {
                            tracing::debug!("certificate mint for {host:?} failed: {e}");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("certificate factory request read failed: {e}");
                        break;
                    }
                }
            },
            Err(e) => {
                tracing::error!("certificate factory could not open request pipe: {e}");
                return;
            }
        }
    }
}

async fn reply(pipe: &CertPipe, result: &Result<(), CertFactoryError>) -> std::io::Result<()> {
    let mut reply_file = tokio::fs::File::options().write(true).open(&pipe.reply_path).await?;
    let payload = match result {
        Ok(()) => vec![REPLY_OK],
        Err(e) => {
            let mut buf = vec![REPLY_ERR];
            buf.extend_from_slice(e.to_string().as_bytes());
            buf
        }
    };
    fifo::write_framed(&mut reply_file, &payload).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_overlong_hostnames() {
        assert!(validate_hostname("").is_err());
        assert!(validate_hostname(&"a".repeat(256)).is_err());
        assert!(validate_hostname("EXAMPLE.com").unwrap() == "example.com");
    }

    #[test]
    fn rejects_oversized_labels() {
        let host = format!("{}.com", "a".repeat(64));
        assert!(validate_hostname(&host).is_err());
    }

    #[test]
    fn leaf_serial_is_deterministic_per_host() {
        assert_eq!(leaf_serial("example.com"), leaf_serial("example.com"));
        assert_ne!(leaf_serial("example.com"), leaf_serial("other.example.com"));
        assert_eq!(leaf_serial("example.com")[0] & 0x80, 0);
    }
}
