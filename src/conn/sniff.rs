//! Plaintext-vs-TLS branch point: peek the first byte a client sends and,
//! for TLS, pull the SNI hostname out of the ClientHello without consuming
//! the stream, so the dispatcher can route to the TLS or plaintext path
//! before committing to either.

use tokio::net::TcpStream;

const TLS_HANDSHAKE_RECORD_TYPE: u8 = 0x16;
const CLIENT_HELLO_HANDSHAKE_TYPE: u8 = 0x01;
const SNI_EXTENSION_TYPE: u16 = 0x0000;
const SNI_HOST_NAME_TYPE: u8 = 0x00;

/// Up to this many bytes of the ClientHello are inspected for SNI. Real
/// ClientHellos with a handful of extensions comfortably fit.
const PEEK_BUF_SIZE: usize = 4096;

pub enum Sniffed {
    PlainText,
    Tls { sni: Option<String> },
}

pub async fn sniff(stream: &TcpStream) -> std::io::Result<Sniffed> {
    let mut buf = vec![0u8; PEEK_BUF_SIZE];
    let n = stream.peek(&mut buf).await?;
    if n == 0 || buf[0] != TLS_HANDSHAKE_RECORD_TYPE {
        return Ok(Sniffed::PlainText);
    }
    Ok(Sniffed::Tls { sni: extract_sni(&buf[..n]) })
}

/// Parses a TLS record header, handshake header, and ClientHello body far
/// enough to reach the extensions block, then walks extensions looking for
/// the server_name (SNI) extension. Returns `None` on any malformed or
/// incomplete input rather than erroring -- the caller treats a missing
/// SNI as a handshake it cannot route and fails the connection.
fn extract_sni(buf: &[u8]) -> Option<String> {
    if buf.len() < 5 {
        return None;
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    let handshake = &buf[5..buf.len().min(5 + record_len)];

    if handshake.is_empty() || handshake[0] != CLIENT_HELLO_HANDSHAKE_TYPE {
        return None;
    }
    let hs_len = u32::from_be_bytes([0, handshake[1], handshake[2], handshake[3]]) as usize;
    let client_hello = &handshake[4..handshake.len().min(4 + hs_len)];

    // version(2) + random(32)
    if client_hello.len() < 34 {
        return None;
    }
    let mut pos = 34;

    let session_id_len = *client_hello.get(pos)? as usize;
    pos += 1 + session_id_len;

    let cipher_suites_len =
        u16::from_be_bytes([*client_hello.get(pos)?, *client_hello.get(pos + 1)?]) as usize;
    pos += 2 + cipher_suites_len;

    let compression_len = *client_hello.get(pos)? as usize;
    pos += 1 + compression_len;

    if pos + 2 > client_hello.len() {
        return None;
    }
    let extensions_len = u16::from_be_bytes([client_hello[pos], client_hello[pos + 1]]) as usize;
    pos += 2;
    let extensions_end = (pos + extensions_len).min(client_hello.len());

    while pos + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([client_hello[pos], client_hello[pos + 1]]);
        let ext_len = u16::from_be_bytes([client_hello[pos + 2], client_hello[pos + 3]]) as usize;
        pos += 4;

        if ext_type == SNI_EXTENSION_TYPE {
            if ext_len >= 5 && pos + ext_len <= extensions_end {
                let name_type = client_hello[pos + 2];
                if name_type == SNI_HOST_NAME_TYPE {
                    let name_len =
                        u16::from_be_bytes([client_hello[pos + 3], client_hello[pos + 4]]) as usize;
                    if pos + 5 + name_len <= extensions_end {
                        let name = &client_hello[pos + 5..pos + 5 + name_len];
                        return String::from_utf8(name.to_vec()).ok();
                    }
                }
            }
            return None;
        }
        pos += ext_len;
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_hello_with_sni(host: &str) -> Vec<u8> {
        let host_bytes = host.as_bytes();
        let mut server_name_list = vec![SNI_HOST_NAME_TYPE];
        server_name_list.extend_from_slice(&(host_bytes.len() as u16).to_be_bytes());
        server_name_list.extend_from_slice(host_bytes);

        let mut sni_ext_body = Vec::new();
        sni_ext_body.extend_from_slice(&(server_name_list.len() as u16).to_be_bytes());
        sni_ext_body.extend_from_slice(&server_name_list);

        let mut extensions = Vec::new();
        extensions.extend_from_slice(&SNI_EXTENSION_TYPE.to_be_bytes());
        extensions.extend_from_slice(&(sni_ext_body.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni_ext_body);

        let mut client_hello = Vec::new();
        client_hello.extend_from_slice(&[0x03, 0x03]); // version
        client_hello.extend_from_slice(&[0u8; 32]); // random
        client_hello.push(0); // session id len
        client_hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // cipher suites
        client_hello.push(1); // compression methods len
        client_hello.push(0);
        client_hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        client_hello.extend_from_slice(&extensions);

        let mut handshake = vec![CLIENT_HELLO_HANDSHAKE_TYPE];
        let hs_len = client_hello.len() as u32;
        handshake.extend_from_slice(&hs_len.to_be_bytes()[1..]);
        handshake.extend_from_slice(&client_hello);

        let mut record = vec![TLS_HANDSHAKE_RECORD_TYPE, 0x03, 0x03];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn extracts_sni_from_a_well_formed_client_hello() {
        let record = client_hello_with_sni("example.com");
        assert_eq!(extract_sni(&record), Some("example.com".to_string()));
    }

    #[test]
    fn non_tls_first_byte_yields_none() {
        assert_eq!(extract_sni(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(extract_sni(&[]), None);
    }

    #[test]
    fn truncated_record_does_not_panic() {
        let record = client_hello_with_sni("example.com");
        assert_eq!(extract_sni(&record[..10]), None);
    }
}
