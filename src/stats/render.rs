//! Stats page rendering: HTML for `SendStats`, plain text for
//! `SendStatsText`. Both read the same [`StatsSnapshot`] and must surface
//! every named counter.

use std::fmt::Write as _;

use super::StatsSnapshot;

const COUNTER_ORDER: &[&str] = &[
    "err", "tmo", "cls", "cly", "gif", "txt", "jpg", "png", "swf", "ico", "bad", "sta", "stt",
    "noc", "rdr", "nfe", "ufe", "nou", "pth", "pst", "hed", "opt",
];

const SSL_ORDER: &[&str] = &["slh", "slm", "sle", "slc"];

/// Renders the human-facing HTML stats page.
pub fn render_html(snap: &StatsSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "<html><head><title>pixelserv-rs stats</title></head><body>");
    let _ = writeln!(out, "<h1>pixelserv-rs</h1>");
    let _ = writeln!(
        out,
        "<p>generated at: {}</p>",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(out, "<p>uptime: {}s</p>", snap.uptime_secs);
    let _ = writeln!(out, "<p>total requests: {}</p>", snap.count);
    let _ = writeln!(out, "<p>connections in flight: {} (peak {})</p>", snap.kcc, snap.kmx);
    let _ = writeln!(out, "<p>connections turned away (clt): {}</p>", snap.clt);
    let _ = writeln!(
        out,
        "<p>receive size: peak {}B, avg {}B</p>",
        snap.rx_peak, snap.rx_avg
    );
    let _ = writeln!(
        out,
        "<p>connection time: peak {}ms, avg {}ms</p>",
        snap.time_peak_ms, snap.time_avg_ms
    );
    let _ = writeln!(
        out,
        "<p>keep-alive requests per connection: peak {}, avg {}</p>",
        snap.keepalive_peak, snap.keepalive_avg
    );

    let _ = writeln!(out, "<table border=\"1\"><tr><th>counter</th><th>value</th></tr>");
    for name in COUNTER_ORDER {
        let value = snap.by_class.get(name).copied().unwrap_or(0);
        let _ = writeln!(out, "<tr><td>{name}</td><td>{value}</td></tr>");
    }
    for name in SSL_ORDER {
        let value = snap.by_ssl.get(name).copied().unwrap_or(0);
        let _ = writeln!(out, "<tr><td>{name}</td><td>{value}</td></tr>");
    }
    let _ = writeln!(out, "</table>");
    let _ = writeln!(out, "</body></html>");
    out
}

/// Renders the machine-parseable `name value` text stats page, one pair per
/// line, used by monitoring scripts that shouldn't have to scrape HTML.
pub fn render_text(snap: &StatsSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "uptime {}", snap.uptime_secs);
    let _ = writeln!(out, "count {}", snap.count);
    let _ = writeln!(out, "kcc {}", snap.kcc);
    let _ = writeln!(out, "kmx {}", snap.kmx);
    let _ = writeln!(out, "clt {}", snap.clt);
    let _ = writeln!(out, "rmx {}", snap.rx_peak);
    let _ = writeln!(out, "ravg {}", snap.rx_avg);
    let _ = writeln!(out, "tmx {}", snap.time_peak_ms);
    let _ = writeln!(out, "tavg {}", snap.time_avg_ms);
    let _ = writeln!(out, "krqmax {}", snap.keepalive_peak);
    let _ = writeln!(out, "kvg {}", snap.keepalive_avg);

    for name in COUNTER_ORDER {
        let value = snap.by_class.get(name).copied().unwrap_or(0);
        let _ = writeln!(out, "{name} {value}");
    }
    for name in SSL_ORDER {
        let value = snap.by_ssl.get(name).copied().unwrap_or(0);
        let _ = writeln!(out, "{name} {value}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_contains_every_counter_name() {
        let snap = StatsSnapshot::default();
        let body = render_html(&snap);
        for name in COUNTER_ORDER.iter().chain(SSL_ORDER.iter()) {
            assert!(body.contains(name), "missing counter {name} in html stats page");
        }
    }

    #[test]
    fn text_contains_every_counter_name() {
        let snap = StatsSnapshot::default();
        let body = render_text(&snap);
        for name in COUNTER_ORDER.iter().chain(SSL_ORDER.iter()) {
            assert!(body.contains(name), "missing counter {name} in text stats page");
        }
    }

    #[test]
    fn text_format_is_one_pair_per_line() {
        let snap = StatsSnapshot::default();
        let body = render_text(&snap);
        for line in body.lines() {
            assert_eq!(line.split_whitespace().count(), 2);
        }
    }
}
