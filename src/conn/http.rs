//! Minimal request-line/header parsing via `httparse`, just enough to
//! build a [`RequestFingerprint`] and know where keep-alive and stats
//! decisions come from (`Connection`/`Host` headers).

use crate::classify::{Method, RequestFingerprint};

const MAX_HEADERS: usize = 32;

pub enum ParsedRequest {
    Complete { consumed: usize, info: RequestInfo },
    Partial,
    BadRequest,
}

pub struct RequestInfo {
    pub method: Method,
    pub path: String,
    pub has_host_header: bool,
    pub keep_alive: bool,
}

impl RequestInfo {
    pub fn fingerprint(&self) -> RequestFingerprint<'_> {
        RequestFingerprint {
            method: self.method,
            path: &self.path,
            has_host_header: self.has_host_header,
        }
    }
}

/// Parses one HTTP request out of the front of `buf`, stack-allocating the
/// header array the way `httparse`'s own examples do (no per-request heap
/// allocation on the hot path).
pub fn parse_request(buf: &[u8]) -> ParsedRequest {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => {
            let method = req.method.map(Method::parse).unwrap_or(Method::Other);
            let path = req.path.unwrap_or("").to_string();
            let minor_version = req.version.unwrap_or(0);

            let mut has_host_header = false;
            let mut connection_header: Option<String> = None;
            for header in req.headers.iter() {
                if header.name.eq_ignore_ascii_case("host") {
                    has_host_header = true;
                } else if header.name.eq_ignore_ascii_case("connection") {
                    connection_header = Some(String::from_utf8_lossy(header.value).into_owned());
                }
            }

            let keep_alive = match connection_header {
                Some(v) => v.to_ascii_lowercase().contains("keep-alive"),
                None => minor_version >= 1,
            };

            ParsedRequest::Complete {
                consumed,
                info: RequestInfo { method, path, has_host_header, keep_alive },
            }
        }
        Ok(httparse::Status::Partial) => ParsedRequest::Partial,
        Err(_) => ParsedRequest::BadRequest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_simple_get_with_host_header() {
        let raw = b"GET /pixel.gif HTTP/1.1\r\nHost: example.com\r\n\r\n";
        match parse_request(raw) {
            ParsedRequest::Complete { consumed, info } => {
                assert_eq!(consumed, raw.len());
                assert_eq!(info.method, Method::Get);
                assert_eq!(info.path, "/pixel.gif");
                assert!(info.has_host_header);
                assert!(info.keep_alive);
            }
            _ => panic!("expected a complete parse"),
        }
    }

    #[test]
    fn http_1_0_without_connection_header_is_not_keep_alive() {
        let raw = b"GET / HTTP/1.0\r\n\r\n";
        match parse_request(raw) {
            ParsedRequest::Complete { info, .. } => assert!(!info.keep_alive),
            _ => panic!("expected a complete parse"),
        }
    }

    #[test]
    fn connection_close_overrides_http_1_1_default() {
        let raw = b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n";
        match parse_request(raw) {
            ParsedRequest::Complete { info, .. } => assert!(!info.keep_alive),
            _ => panic!("expected a complete parse"),
        }
    }

    #[test]
    fn partial_request_awaits_more_bytes() {
        let raw = b"GET /pixel.gif HTTP/1.1\r\nHost: exam";
        assert!(matches!(parse_request(raw), ParsedRequest::Partial));
    }
}
