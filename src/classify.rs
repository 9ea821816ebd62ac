//! Request classification: method + path + extension -> [`Classification`].
//!
//! Mirrors the `response_struct.status`/`.ssl` tag pair from
//! `pixelserv.c`'s closed classification set, typed as an enum here
//! instead of an int macro.

use crate::config::Config;

/// Closed set of response classifications, one per `pixelserv.c` status tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    SendGif,
    SendTxt,
    SendJpg,
    SendPng,
    SendSwf,
    SendIco,
    SendStats,
    SendStatsText,
    Send204,
    SendRedirect,
    SendNoExt,
    SendUnkExt,
    SendNoUrl,
    SendBadPath,
    SendPost,
    SendHead,
    SendOptions,
    SendBad,
    FailGeneral,
    FailTimeout,
    FailClosed,
    FailReply,
    ActionLogVerb,
    ActionDecKcc,
}

impl Classification {
    /// Whether this classification is a counted send/fail outcome (as
    /// opposed to an internal bookkeeping action like `ActionDecKcc`).
    /// `pixelserv.c` compares `pipedata.status < ACTION_LOG_VERB` to draw
    /// this same line when feeding the size/run_time EMAs.
    pub fn is_countable_outcome(self) -> bool {
        !matches!(self, Classification::ActionLogVerb | Classification::ActionDecKcc)
    }

    /// Whether the connection should stay open for another request after
    /// this response, assuming the client asked for keep-alive. Failure
    /// outcomes always close; every successful send may keep-alive.
    pub fn allows_keepalive(self) -> bool {
        !matches!(
            self,
            Classification::FailGeneral
                | Classification::FailTimeout
                | Classification::FailClosed
                | Classification::FailReply
                | Classification::ActionLogVerb
                | Classification::ActionDecKcc
        )
    }
}

/// TLS handshake outcome, reported alongside a [`Classification`] for TLS
/// connections (`SSL_NOT_TLS` for plaintext connections).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SslOutcome {
    NotTls,
    Hit,
    Miss,
    Err,
    HitCls,
}

/// The inputs the classifier sees, extracted from the request line and
/// `Host` header by [`crate::conn::http`].
#[derive(Debug, Clone)]
pub struct RequestFingerprint<'a> {
    pub method: Method,
    pub path: &'a str,
    pub has_host_header: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Head,
    Options,
    Other,
}

impl Method {
    pub fn parse(token: &str) -> Self {
        match token {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "HEAD" => Method::Head,
            "OPTIONS" => Method::Options,
            _ => Method::Other,
        }
    }
}

const RECOGNIZED_EXTENSIONS: &[(&str, Classification)] = &[
    (".gif", Classification::SendGif),
    (".png", Classification::SendPng),
    (".jpg", Classification::SendJpg),
    (".jpeg", Classification::SendJpg),
    (".ico", Classification::SendIco),
    (".swf", Classification::SendSwf),
    (".js", Classification::SendTxt),
    (".txt", Classification::SendTxt),
];

fn extension_of(path: &str) -> Option<&str> {
    let last_segment = path.rsplit('/').next().unwrap_or(path);
    let last_segment = last_segment.split(['?', '#']).next().unwrap_or(last_segment);
    last_segment.rfind('.').map(|i| &last_segment[i..])
}

/// Rule order: method overrides first, then the two configured stats
/// URLs, then `generate_204`, then path sanity, then extension mapping,
/// then the tracker-link redirect.
pub fn classify(fp: &RequestFingerprint<'_>, cfg: &Config) -> Classification {
    match fp.method {
        Method::Post => return Classification::SendPost,
        Method::Head => return Classification::SendHead,
        Method::Options => return Classification::SendOptions,
        Method::Other => return Classification::SendBad,
        Method::Get => {}
    }

    let path_only = fp.path.split(['?', '#']).next().unwrap_or(fp.path);

    if path_only == cfg.stats_url {
        return Classification::SendStats;
    }
    if path_only == cfg.stats_text_url {
        return Classification::SendStatsText;
    }

    if fp.path.contains("generate_204") && cfg.do_204 {
        return Classification::Send204;
    }

    if fp.path.is_empty() {
        return Classification::SendNoUrl;
    }
    if !path_only.starts_with('/') {
        return Classification::SendBadPath;
    }

    if let Some(ext) = extension_of(path_only) {
        let ext_lower = ext.to_ascii_lowercase();
        if let Some((_, class)) = RECOGNIZED_EXTENSIONS
            .iter()
            .find(|(known, _)| *known == ext_lower)
        {
            return *class;
        }

        if cfg.do_redirect && is_tracker_link(path_only) {
            return Classification::SendRedirect;
        }

        return Classification::SendUnkExt;
    }

    if cfg.do_redirect && is_tracker_link(path_only) {
        return Classification::SendRedirect;
    }

    Classification::SendNoExt
}

/// Tracker links embed a percent-encoded absolute URL after a recognizable
/// marker segment, e.g. `/ri/v1/t/.../http%3A%2F%2Fexample.com%2Fpixel.gif`.
/// We treat any path containing a `%2F%2F`-escaped scheme separator as a
/// tracker link candidate; the embedded target is decoded in
/// [`crate::conn::handler`] when building the 307 response.
fn is_tracker_link(path: &str) -> bool {
    path.to_ascii_lowercase().contains("%2f%2f")
}

/// Extracts and percent-decodes the tracker target embedded in `path`, if
/// any. Returns `None` if no embedded absolute URL can be found.
pub fn tracker_redirect_target(path: &str) -> Option<String> {
    let idx = path.to_ascii_lowercase().find("%3a%2f%2f")?;
    // back up to the start of the scheme token that precedes `://`
    let scheme_start = path[..idx].rfind('/').map(|i| i + 1).unwrap_or(0);
    let encoded = &path[scheme_start..];
    let decoded = percent_encoding::percent_decode_str(encoded)
        .decode_utf8()
        .ok()?;
    Some(decoded.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        Config {
            bind_addr: "0.0.0.0".into(),
            do_204: true,
            do_redirect: true,
            log_level: 1,
            iface: None,
            select_timeout: std::time::Duration::from_secs(2),
            http_keepalive: std::time::Duration::from_secs(5),
            ports: vec![80, 443],
            tls_ports: vec![443],
            stats_url: "/servstats".into(),
            stats_text_url: "/servstats.txt".into(),
            max_service_threads: 100,
            user: None,
            warn_ms: None,
            pem_dir: "/tmp".into(),
        }
    }

    fn fp<'a>(method: Method, path: &'a str) -> RequestFingerprint<'a> {
        RequestFingerprint { method, path, has_host_header: true }
    }

    #[test]
    fn method_overrides_win_first() {
        assert_eq!(classify(&fp(Method::Post, "/pixel.gif"), &cfg()), Classification::SendPost);
        assert_eq!(classify(&fp(Method::Head, "/pixel.gif"), &cfg()), Classification::SendHead);
        assert_eq!(classify(&fp(Method::Options, "/"), &cfg()), Classification::SendOptions);
        assert_eq!(classify(&fp(Method::Other, "/"), &cfg()), Classification::SendBad);
    }

    #[test]
    fn extension_mapping() {
        assert_eq!(classify(&fp(Method::Get, "/a.gif"), &cfg()), Classification::SendGif);
        assert_eq!(classify(&fp(Method::Get, "/a.PNG"), &cfg()), Classification::SendPng);
        assert_eq!(classify(&fp(Method::Get, "/a.jpeg"), &cfg()), Classification::SendJpg);
        assert_eq!(classify(&fp(Method::Get, "/a.ico"), &cfg()), Classification::SendIco);
        assert_eq!(classify(&fp(Method::Get, "/a.swf"), &cfg()), Classification::SendSwf);
        assert_eq!(classify(&fp(Method::Get, "/a.js"), &cfg()), Classification::SendTxt);
        assert_eq!(classify(&fp(Method::Get, "/a.weird"), &cfg()), Classification::SendUnkExt);
        assert_eq!(classify(&fp(Method::Get, "/noext"), &cfg()), Classification::SendNoExt);
    }

    #[test]
    fn generate_204_respects_flag() {
        assert_eq!(classify(&fp(Method::Get, "/generate_204"), &cfg()), Classification::Send204);
        let mut no204 = cfg();
        no204.do_204 = false;
        assert_eq!(classify(&fp(Method::Get, "/generate_204"), &no204), Classification::SendNoExt);
    }

    #[test]
    fn stats_urls_match_configured_paths() {
        assert_eq!(classify(&fp(Method::Get, "/servstats"), &cfg()), Classification::SendStats);
        assert_eq!(classify(&fp(Method::Get, "/servstats.txt"), &cfg()), Classification::SendStatsText);
    }

    #[test]
    fn empty_and_malformed_paths() {
        assert_eq!(classify(&fp(Method::Get, ""), &cfg()), Classification::SendNoUrl);
        assert_eq!(classify(&fp(Method::Get, "no-leading-slash"), &cfg()), Classification::SendBadPath);
    }

    #[test]
    fn tracker_redirect_target_decodes_embedded_url() {
        let path = "/ri/v1/t/abc/http%3A%2F%2Fexample.com%2Fpixel.gif";
        let target = tracker_redirect_target(path).unwrap();
        assert_eq!(target, "http://example.com/pixel.gif");
    }
}
