//! The named FIFO pair the TLS context cache and certificate factory talk
//! over: mode 0600, owned by the service user, length-prefixed hostname
//! requests and status replies -- split into a `.req`/`.reply` pair so
//! request writes from many cache misses never interleave with the
//! factory's replies.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::StartupError;

#[derive(Clone)]
pub struct CertPipe {
    pub req_path: PathBuf,
    pub reply_path: PathBuf,
}

impl CertPipe {
    /// Creates both FIFOs if absent. Safe to call once at startup from the
    /// process that also spawns the certificate factory task.
    pub fn create(runtime_dir: &Path) -> Result<Self, StartupError> {
        let req_path = runtime_dir.join("pixelserv_cert_pipe.req");
        let reply_path = runtime_dir.join("pixelserv_cert_pipe.reply");

        for path in [&req_path, &reply_path] {
            match nix::unistd::mkfifo(path, nix::sys::stat::Mode::from_bits_truncate(0o600)) {
                Ok(()) => {}
                Err(nix::errno::Errno::EEXIST) => {}
                Err(source) => {
                    return Err(StartupError::PipeCreate { path: path.clone(), source });
                }
            }
        }

        Ok(CertPipe { req_path, reply_path })
    }
}

/// Writes `payload` as a 2-byte big-endian length prefix followed by the
/// bytes themselves. Hostnames are capped at 255 bytes, so a `u16` length
/// is ample headroom.
pub async fn write_framed(file: &mut File, payload: &[u8]) -> std::io::Result<()> {
    let len = u16::try_from(payload.len()).unwrap_or(u16::MAX);
    file.write_all(&len.to_be_bytes()).await?;
    file.write_all(&payload[..len as usize]).await?;
    file.flush().await
}

/// Reads one length-prefixed frame. Returns `Ok(None)` on a clean EOF
/// (writer closed its end between frames, e.g. process restart).
pub async fn read_framed(file: &mut File) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 2];
    if let Err(e) = file.read_exact(&mut len_buf).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e);
    }
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    file.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn round_trips_a_frame_through_a_regular_file() {
        let dir = std::env::temp_dir().join(format!("pixelserv-fifo-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("frame.bin");

        {
            let mut std_file = std::fs::File::create(&path).unwrap();
            std_file.write_all(&[]).unwrap();
        }

        let mut writer = File::options().write(true).open(&path).await.unwrap();
        write_framed(&mut writer, b"example.com").await.unwrap();
        drop(writer);

        let mut reader = File::open(&path).await.unwrap();
        let frame = read_framed(&mut reader).await.unwrap().unwrap();
        assert_eq!(frame, b"example.com");

        std::fs::remove_dir_all(&dir).ok();
    }
}
