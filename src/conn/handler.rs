//! Per-connection state machine: sniff, (maybe) TLS handshake, classify,
//! respond, keep-alive loop. Mirrors `pixelserv.c`'s `conn_handler` and
//! posts one [`PipeRecord`] per served request plus a final
//! `ActionDecKcc` at teardown.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::certs::TlsContextCache;
use crate::classify::{self, Classification, SslOutcome};
use crate::config::Config;
use crate::error::ConnError;
use crate::stats::{PipeRecord, StatsSnapshot};

use super::http::{self, ParsedRequest};
use super::sniff::{self, Sniffed};

const READ_BUF_SIZE: usize = 4096;
const MAX_REQUEST_HEAD: usize = 16 * 1024;

pub async fn handle_connection(
    stream: TcpStream,
    cfg: Arc<Config>,
    tls_cache: Arc<TlsContextCache>,
    stats_tx: UnboundedSender<PipeRecord>,
    stats_rx: watch::Receiver<StatsSnapshot>,
) {
    let _ = stream.set_nodelay(true);

    let krq = match sniff::sniff(&stream).await {
        Ok(Sniffed::PlainText) => {
            serve_loop(stream, &cfg, SslOutcome::NotTls, &stats_tx, &stats_rx).await
        }
        Ok(Sniffed::Tls { sni }) => {
            handle_tls(stream, &cfg, &tls_cache, sni, &stats_tx, &stats_rx).await
        }
        Err(_) => {
            post(&stats_tx, PipeRecord::outcome(Classification::FailGeneral, SslOutcome::NotTls, 0.0, 0));
            0
        }
    };

    post(&stats_tx, PipeRecord::dec_kcc(krq));
}

async fn handle_tls(
    stream: TcpStream,
    cfg: &Config,
    tls_cache: &TlsContextCache,
    sni: Option<String>,
    stats_tx: &UnboundedSender<PipeRecord>,
    stats_rx: &watch::Receiver<StatsSnapshot>,
) -> u32 {
    let Some(host) = sni else {
        post(stats_tx, PipeRecord::outcome(Classification::FailGeneral, SslOutcome::Err, 0.0, 0));
        return 0;
    };

    let (server_config, was_hit) = match tls_cache.get_or_create(&host).await {
        Ok(pair) => pair,
        Err(_) => {
            post(stats_tx, PipeRecord::outcome(Classification::FailGeneral, SslOutcome::Err, 0.0, 0));
            return 0;
        }
    };
    let ssl_outcome = if was_hit { SslOutcome::Hit } else { SslOutcome::Miss };

    let acceptor = TlsAcceptor::from(server_config);
    let tls_stream = match tokio::time::timeout(cfg.select_timeout, acceptor.accept(stream)).await
    {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            let (conn_err, handshake_ssl) = classify_handshake_failure(e);
            tracing::debug!(error = %conn_err, host = %host, "TLS handshake failed");
            post(stats_tx, PipeRecord::outcome(Classification::FailClosed, handshake_ssl, 0.0, 0));
            return 0;
        }
        Err(_) => {
            post(stats_tx, PipeRecord::outcome(Classification::FailTimeout, ssl_outcome, 0.0, 0));
            return 0;
        }
    };

    serve_loop(tls_stream, cfg, ssl_outcome, stats_tx, stats_rx).await
}

/// Distinguishes `SSL_ERR` from `SSL_HIT_CLS` (client closed mid-handshake)
/// from the `io::Error` `rustls`/Tokio surfaces for a failed `accept()`. A
/// client that simply hangs up mid-handshake surfaces as EOF/reset/broken-pipe;
/// anything else (a malformed ClientHello, a cipher mismatch) is a genuine
/// protocol error.
fn classify_handshake_failure(err: io::Error) -> (ConnError, SslOutcome) {
    match err.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
            (ConnError::HandshakeClosed, SslOutcome::HitCls)
        }
        _ => {
            let msg = err.to_string();
            (ConnError::Handshake(msg), SslOutcome::Err)
        }
    }
}

async fn serve_loop<S>(
    mut stream: S,
    cfg: &Config,
    ssl: SslOutcome,
    stats_tx: &UnboundedSender<PipeRecord>,
    stats_rx: &watch::Receiver<StatsSnapshot>,
) -> u32
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(READ_BUF_SIZE);
    let mut krq: u32 = 0;
    let keepalive_deadline = tokio::time::Instant::now() + cfg.http_keepalive;

    loop {
        let started = Instant::now();
        match read_one_request(&mut stream, &mut buf, cfg, keepalive_deadline).await {
            Ok(Some((info, rx_total))) => {
                let fp = info.fingerprint();
                let class = classify::classify(&fp, cfg);
                let will_keep_alive = info.keep_alive
                    && class.allows_keepalive()
                    && tokio::time::Instant::now() < keepalive_deadline;

                let write_result =
                    write_response(&mut stream, class, &info.path, cfg, stats_rx, will_keep_alive).await;
                let run_time = started.elapsed().as_secs_f64();
                warn_if_slow(cfg, run_time, class);

                match write_result {
                    Ok(()) => post(stats_tx, PipeRecord::outcome(class, ssl, run_time, rx_total)),
                    Err(_) => {
                        post(stats_tx, PipeRecord::outcome(Classification::FailReply, ssl, run_time, rx_total));
                        return krq;
                    }
                }

                krq += 1;
                if !will_keep_alive {
                    return krq;
                }
            }
            Ok(None) => return krq,
            Err(TimedOut) => {
                post(stats_tx, PipeRecord::outcome(Classification::FailTimeout, ssl, started.elapsed().as_secs_f64(), 0));
                return krq;
            }
        }
    }
}

struct TimedOut;

/// `-w msec`: log a warning when a single request took longer than the
/// configured threshold to serve. `pixelserv.c` only wires this up in its
/// `DEBUG` build; the rewrite keeps that the same way, gating the check on
/// `cfg!(debug_assertions)` instead of a separate compile flag.
fn warn_if_slow(cfg: &Config, run_time_secs: f64, class: Classification) {
    if cfg!(debug_assertions) {
        if let Some(elapsed_ms) = slow_elapsed_ms(cfg.warn_ms, run_time_secs) {
            tracing::warn!(?class, elapsed_ms, threshold_ms = cfg.warn_ms, "connection exceeded warn threshold");
        }
    }
}

/// Returns the elapsed milliseconds when they exceed `warn_ms`, else `None`.
/// Split out from [`warn_if_slow`] so the threshold comparison itself is
/// testable independent of `cfg!(debug_assertions)`.
fn slow_elapsed_ms(warn_ms: Option<u64>, run_time_secs: f64) -> Option<f64> {
    let threshold_ms = warn_ms?;
    let elapsed_ms = run_time_secs * 1000.0;
    (elapsed_ms > threshold_ms as f64).then_some(elapsed_ms)
}

/// Reads and parses one request, honoring `select_timeout` per read and
/// the overall keep-alive wall-clock ceiling.
async fn read_one_request<S>(
    stream: &mut S,
    buf: &mut Vec<u8>,
    cfg: &Config,
    keepalive_deadline: tokio::time::Instant,
) -> Result<Option<(http::RequestInfo, u64)>, TimedOut>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let ParsedRequest::Complete { consumed, info } = http::parse_request(buf) {
            let rx_total = consumed as u64;
            buf.drain(..consumed);
            return Ok(Some((info, rx_total)));
        }

        if buf.len() > MAX_REQUEST_HEAD {
            return Ok(None);
        }

        let mut chunk = [0u8; READ_BUF_SIZE];
        let remaining = keepalive_deadline.saturating_duration_since(tokio::time::Instant::now());
        let read_timeout = cfg.select_timeout.min(remaining.max(std::time::Duration::from_millis(1)));

        match tokio::time::timeout(read_timeout, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => return Ok(None),
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(_)) => return Ok(None),
            Err(_) => return Err(TimedOut),
        }
    }
}

async fn write_response<S>(
    stream: &mut S,
    class: Classification,
    path: &str,
    cfg: &Config,
    stats_rx: &watch::Receiver<StatsSnapshot>,
    keep_alive: bool,
) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = render_response(class, path, cfg, stats_rx, keep_alive);
    stream.write_all(&response).await?;
    stream.flush().await
}

fn render_response(
    class: Classification,
    path: &str,
    cfg: &Config,
    stats_rx: &watch::Receiver<StatsSnapshot>,
    keep_alive: bool,
) -> Vec<u8> {
    use crate::stats::render;

    match class {
        Classification::Send204 => status_line_only(204, "No Content", keep_alive),
        Classification::SendNoUrl | Classification::SendBadPath | Classification::SendBad => {
            status_line_only(400, "Bad Request", keep_alive)
        }
        Classification::SendStats => {
            let snapshot = stats_rx.borrow().clone();
            let body = render::render_html(&snapshot);
            body_response(200, "OK", "text/html", body.into_bytes(), keep_alive)
        }
        Classification::SendStatsText => {
            let snapshot = stats_rx.borrow().clone();
            let body = render::render_text(&snapshot);
            body_response(200, "OK", "text/plain", body.into_bytes(), keep_alive)
        }
        Classification::SendRedirect => match classify::tracker_redirect_target(path) {
            Some(target) => redirect_response(307, "Temporary Redirect", &target, keep_alive),
            None => status_line_only(307, "Temporary Redirect", keep_alive),
        },
        Classification::SendOptions => format!(
            "HTTP/1.1 200 OK\r\nDate: {}\r\nAllow: GET, HEAD, OPTIONS\r\nContent-Length: 0\r\nConnection: {}\r\n\r\n",
            http_date(),
            connection_header(keep_alive)
        )
        .into_bytes(),
        Classification::SendHead => status_line_only(200, "OK", keep_alive),
        Classification::SendPost => body_response(200, "OK", "text/plain", Vec::new(), keep_alive),
        _ => match crate::responses::canned_response(class) {
            Some(canned) => {
                let _ = cfg;
                let mut head = format!(
                    "HTTP/1.1 200 OK\r\nDate: {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nCache-Control: {}\r\nConnection: {}\r\n\r\n",
                    http_date(),
                    canned.content_type,
                    canned.body.len(),
                    canned.cache_control,
                    connection_header(keep_alive),
                )
                .into_bytes();
                head.extend_from_slice(canned.body);
                head
            }
            None => status_line_only(204, "No Content", keep_alive),
        },
    }
}

/// Current time in the RFC 7231 `Date` header format every response
/// carries, e.g. `Tue, 15 Nov 1994 08:12:31 GMT`.
fn http_date() -> String {
    chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Every canned response carries `Connection: keep-alive` or `close`,
/// reflecting what the serve loop actually decided, not a constant, so a
/// client never gets told to reuse a socket the server is about to drop.
fn connection_header(keep_alive: bool) -> &'static str {
    if keep_alive { "keep-alive" } else { "close" }
}

fn redirect_response(code: u16, reason: &str, location: &str, keep_alive: bool) -> Vec<u8> {
    format!(
        "HTTP/1.1 {code} {reason}\r\nDate: {}\r\nLocation: {location}\r\nContent-Length: 0\r\nConnection: {}\r\n\r\n",
        http_date(),
        connection_header(keep_alive)
    )
    .into_bytes()
}

fn status_line_only(code: u16, reason: &str, keep_alive: bool) -> Vec<u8> {
    format!(
        "HTTP/1.1 {code} {reason}\r\nDate: {}\r\nContent-Length: 0\r\nConnection: {}\r\n\r\n",
        http_date(),
        connection_header(keep_alive)
    )
    .into_bytes()
}

fn body_response(code: u16, reason: &str, content_type: &str, body: Vec<u8>, keep_alive: bool) -> Vec<u8> {
    let mut head = format!(
        "HTTP/1.1 {code} {reason}\r\nDate: {}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n",
        http_date(),
        body.len(),
        connection_header(keep_alive)
    )
    .into_bytes();
    head.extend_from_slice(&body);
    head
}

fn post(tx: &UnboundedSender<PipeRecord>, record: PipeRecord) {
    let _ = tx.send(record);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_mid_handshake_is_client_closed_not_an_error() {
        let err = io::Error::from(io::ErrorKind::UnexpectedEof);
        let (conn_err, ssl) = classify_handshake_failure(err);
        assert_eq!(ssl, SslOutcome::HitCls);
        assert!(matches!(conn_err, ConnError::HandshakeClosed));
    }

    #[test]
    fn reset_mid_handshake_is_also_client_closed() {
        let err = io::Error::from(io::ErrorKind::ConnectionReset);
        let (_, ssl) = classify_handshake_failure(err);
        assert_eq!(ssl, SslOutcome::HitCls);
    }

    #[test]
    fn malformed_handshake_is_a_genuine_ssl_error() {
        let err = io::Error::other("peer sent no shared cipher suite");
        let (conn_err, ssl) = classify_handshake_failure(err);
        assert_eq!(ssl, SslOutcome::Err);
        assert!(matches!(conn_err, ConnError::Handshake(_)));
    }

    #[test]
    fn slow_elapsed_ms_is_none_without_a_configured_threshold() {
        assert_eq!(slow_elapsed_ms(None, 5.0), None);
    }

    #[test]
    fn slow_elapsed_ms_fires_only_past_the_threshold() {
        assert_eq!(slow_elapsed_ms(Some(100), 0.05), None);
        assert_eq!(slow_elapsed_ms(Some(100), 0.2), Some(200.0));
    }

    #[test]
    fn canned_extension_response_carries_matching_content_length() {
        let cfg_args = crate::config::Args {
            bind_addr: "0.0.0.0".into(),
            no_204: false,
            foreground: false,
            deprecated_r: false,
            no_redirect: false,
            log_level: 1,
            iface: None,
            select_timeout: 2,
            http_keepalive: 5,
            http_ports: vec![],
            https_ports: vec![],
            stats_url: "/servstats".into(),
            stats_text_url: "/servstats.txt".into(),
            max_service_threads: 100,
            user: None,
            warn_ms: None,
            pem_dir: "/tmp/pixelserv-rs-test".into(),
        };
        let cfg = Config::from_args(cfg_args).unwrap();
        let (_tx, rx) = watch::channel(StatsSnapshot::default());

        let response = render_response(Classification::SendGif, "/pixel.gif", &cfg, &rx, true);
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.contains("Content-Type: image/gif"));
        assert!(text.contains(&format!("Content-Length: {}", crate::responses::GIF_PIXEL.len())));
        assert!(response.ends_with(crate::responses::GIF_PIXEL));
    }

    #[test]
    fn send_204_has_no_body_and_no_content_type() {
        let cfg_args = crate::config::Args {
            bind_addr: "0.0.0.0".into(),
            no_204: false,
            foreground: false,
            deprecated_r: false,
            no_redirect: false,
            log_level: 1,
            iface: None,
            select_timeout: 2,
            http_keepalive: 5,
            http_ports: vec![],
            https_ports: vec![],
            stats_url: "/servstats".into(),
            stats_text_url: "/servstats.txt".into(),
            max_service_threads: 100,
            user: None,
            warn_ms: None,
            pem_dir: "/tmp/pixelserv-rs-test".into(),
        };
        let cfg = Config::from_args(cfg_args).unwrap();
        let (_tx, rx) = watch::channel(StatsSnapshot::default());

        let response = render_response(Classification::Send204, "/generate_204", &cfg, &rx, false);
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 204 No Content"));
        assert!(text.contains("Content-Length: 0"));
        assert!(!text.contains("Content-Type"));
    }
}
