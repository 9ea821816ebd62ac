//! Crate-root integration-style tests: scenarios that exercise more than
//! one module together, following the concrete request/response fixtures
//! `pixelserv.c`'s own test suite covers. Per-module behavior has its own
//! `#[cfg(test)]` block next to the code it covers; this file is for the
//! seams between them.

use crate::certs::factory::{cert_path, key_path, validate_hostname};
use crate::classify::{self, Classification, Method, RequestFingerprint, SslOutcome};
use crate::config::{Args, Config};
use crate::conn::http::{parse_request, ParsedRequest};
use crate::responses::canned_response;
use crate::stats::{render, PipeRecord, Stats};
use std::path::PathBuf;

fn default_config() -> Config {
    Config::from_args(Args {
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
        pem_dir: PathBuf::from("/tmp/pixelserv-rs-test"),
    })
    .unwrap()
}

/// `GET /pixel.gif HTTP/1.0` -> `HTTP/1.x 200 OK`, `Content-Type: image/gif`,
/// body = canned 43-byte 1x1 GIF.
#[test]
fn pixel_gif_request_parses_classifies_and_serves_the_canned_gif() {
    let raw = b"GET /pixel.gif HTTP/1.0\r\n\r\n";
    let ParsedRequest::Complete { info, .. } = parse_request(raw) else {
        panic!("expected a complete parse");
    };

    let cfg = default_config();
    let class = classify::classify(&info.fingerprint(), &cfg);
    assert_eq!(class, Classification::SendGif);

    let canned = canned_response(class).expect("gif classification has a canned body");
    assert_eq!(canned.content_type, "image/gif");
    assert_eq!(canned.body.len(), 43);
    assert_eq!(&canned.body[0..6], b"GIF89a");
}

/// `GET /generate_204 HTTP/1.1` with `Host:` set (default config) ->
/// `HTTP/1.1 204 No Content`, empty body.
#[test]
fn generate_204_with_default_config_classifies_as_204() {
    let raw = b"GET /generate_204 HTTP/1.1\r\nHost: x\r\n\r\n";
    let ParsedRequest::Complete { info, .. } = parse_request(raw) else {
        panic!("expected a complete parse");
    };
    assert!(info.has_host_header);
    assert!(info.keep_alive);

    let cfg = default_config();
    assert_eq!(classify::classify(&info.fingerprint(), &cfg), Classification::Send204);
}

/// With `-2` (no_204) set, the same URL falls through to extension-based
/// classification instead: the default pixel for that URL's extension,
/// or `SEND_NO_EXT` when it has none.
#[test]
fn generate_204_with_no_204_flag_falls_through_to_no_ext() {
    let args = Args {
        bind_addr: "0.0.0.0".into(),
        no_204: true,
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
        pem_dir: PathBuf::from("/tmp/pixelserv-rs-test"),
    };
    let cfg = Config::from_args(args).unwrap();

    let fp = RequestFingerprint { method: Method::Get, path: "/generate_204", has_host_header: true };
    assert_eq!(classify::classify(&fp, &cfg), Classification::SendNoExt);
}

/// `POST /foo HTTP/1.1` with `Host:` and `Content-Length: 0` -> classified
/// `SEND_POST`, minimal 200 response.
#[test]
fn post_request_classifies_as_send_post_regardless_of_path() {
    let raw = b"POST /foo HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n";
    let ParsedRequest::Complete { info, .. } = parse_request(raw) else {
        panic!("expected a complete parse");
    };
    let cfg = default_config();
    assert_eq!(classify::classify(&info.fingerprint(), &cfg), Classification::SendPost);
}

/// `GET /servstats HTTP/1.0` (with default `-s`) -> 200 OK,
/// `Content-Type: text/html`, body contains every named counter.
#[test]
fn servstats_request_classifies_as_stats_and_renders_every_counter() {
    let raw = b"GET /servstats HTTP/1.0\r\n\r\n";
    let ParsedRequest::Complete { info, .. } = parse_request(raw) else {
        panic!("expected a complete parse");
    };
    let cfg = default_config();
    assert_eq!(classify::classify(&info.fingerprint(), &cfg), Classification::SendStats);

    let stats = Stats::new(cfg.log_level);
    let html = render::render_html(&stats.snapshot());
    for counter in ["gif", "txt", "jpg", "png", "swf", "ico", "noc", "rdr", "bad"] {
        assert!(html.contains(counter), "stats page missing counter {counter}");
    }
}

/// Offering K+1 concurrent connections against `max_service_threads = K`
/// results in exactly one `clt` increment, and the first K proceed
/// normally.
#[test]
fn admission_control_rejects_only_the_overflow_connection() {
    const K: usize = 4;
    let mut stats = Stats::new(1);

    for _ in 0..K {
        stats.on_accept();
    }
    // The (K+1)-th arrival is rejected by the dispatcher before
    // `on_accept` is ever called for it -- this mirrors that decision.
    stats.on_admission_rejected();

    let snap = stats.snapshot();
    assert_eq!(snap.kcc, K as i64);
    assert_eq!(snap.kmx, K as i64);
    assert_eq!(snap.clt, 1);
}

/// A single connection issuing N HTTP/1.1 GETs yields N result records
/// with monotonically increasing `krq`, and exactly one `ActionDecKcc` at
/// close. Exercised here at the `Stats` level, standing in for the
/// worker's serve loop.
#[test]
fn keep_alive_sequence_produces_one_dec_kcc_with_final_request_count() {
    let mut stats = Stats::new(1);
    stats.on_accept();

    const N: u32 = 5;
    for i in 0..N {
        stats.apply(PipeRecord::outcome(Classification::SendGif, SslOutcome::NotTls, 0.001, 120 + i as u64));
    }
    stats.apply(PipeRecord::dec_kcc(N));

    let snap = stats.snapshot();
    assert_eq!(*snap.by_class.get("gif").unwrap(), N as u64);
    assert_eq!(snap.keepalive_peak, N);
    assert_eq!(snap.kcc, 0);
}

/// After samples s1..sn, the reported running mean rounds (s1+...+sn)/n,
/// exercised through the same `Stats::apply` path a worker's pipe records
/// would take.
#[test]
fn ema_over_a_realistic_record_sequence_matches_the_plain_mean() {
    let mut stats = Stats::new(1);
    let samples = [0.010, 0.025, 0.005, 0.040];
    for &s in &samples {
        stats.apply(PipeRecord::outcome(Classification::SendGif, SslOutcome::NotTls, s, 100));
    }
    let snap = stats.snapshot();
    let expected_ms = (samples.iter().sum::<f64>() / samples.len() as f64 * 1000.0).round() as i64;
    assert_eq!(snap.time_avg_ms, expected_ms);
}

/// Certificate idempotence, the path-construction half: the same hostname
/// always maps to the same on-disk paths, and distinct hosts never
/// collide.
#[test]
fn cert_and_key_paths_are_stable_and_host_specific() {
    let dir = PathBuf::from("/var/cache/pixelserv");
    let host = validate_hostname("Example.COM").unwrap();
    assert_eq!(host, "example.com");

    let cert_a = cert_path(&dir, &host);
    let cert_b = cert_path(&dir, &host);
    assert_eq!(cert_a, cert_b);
    assert_ne!(cert_path(&dir, &host), cert_path(&dir, "other.example.com"));
    assert_ne!(cert_path(&dir, &host), key_path(&dir, &host));
}

/// Stats and stats-text classifications never overlap with extension
/// classifications, so classification rule order stays intact even when
/// a configured stats URL happens to look like a file path.
#[test]
fn configured_stats_url_wins_over_extension_mapping() {
    let args = Args {
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
        stats_url: "/admin/stats.gif".into(),
        stats_text_url: "/servstats.txt".into(),
        max_service_threads: 100,
        user: None,
        warn_ms: None,
        pem_dir: PathBuf::from("/tmp/pixelserv-rs-test"),
    };
    let cfg = Config::from_args(args).unwrap();

    let fp = RequestFingerprint { method: Method::Get, path: "/admin/stats.gif", has_host_header: true };
    assert_eq!(classify::classify(&fp, &cfg), Classification::SendStats);
}
