//! Process-wide counters and moving averages, owned exclusively by the
//! dispatcher. Stats renderers get an owned [`StatsSnapshot`] copy, never
//! a live reference, so a slow render never tears against an in-flight
//! counter update.

pub mod record;
pub mod render;

use std::collections::HashMap;
use std::time::Instant;

use crate::classify::{Classification, SslOutcome};
pub use record::PipeRecord;

/// Incremental moving average: `new = old + (sample - old) / n`.
/// Matches `pixelserv.c`'s `ema()` helper exactly, including starting from
/// `old = 0, n = 0`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ema {
    value: f64,
    count: u64,
}

impl Ema {
    pub fn update(&mut self, sample: f64) {
        self.count += 1;
        self.value += (sample - self.value) / self.count as f64;
    }

    /// The visible integer statistic: `round(new)`.
    pub fn rounded(&self) -> i64 {
        self.value.round() as i64
    }

    pub fn raw(&self) -> f64 {
        self.value
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StatsSnapshot {
    /// Not serialized: `Instant` has no wall-clock meaning outside this
    /// process, so the JSON dump (`SIGUSR2`, debug builds) carries
    /// `uptime_secs` instead.
    #[serde(skip)]
    pub started_at: Option<Instant>,
    pub uptime_secs: u64,
    pub count: u64,
    pub kcc: i64,
    pub kmx: i64,
    pub clt: u64,
    pub by_class: HashMap<&'static str, u64>,
    pub by_ssl: HashMap<&'static str, u64>,
    pub rx_peak: u64,
    pub rx_avg: i64,
    pub time_peak_ms: i64,
    pub time_avg_ms: i64,
    pub keepalive_peak: u32,
    pub keepalive_avg: i64,
}

pub struct Stats {
    started_at: Instant,
    count: u64,
    kcc: i64,
    kmx: i64,
    clt: u64,
    by_class: HashMap<Classification, u64>,
    by_ssl: HashMap<SslOutcome, u64>,
    rx_peak: u64,
    rx_avg: Ema,
    time_peak_secs: f64,
    time_avg: Ema,
    keepalive_peak: u32,
    keepalive_avg: Ema,
    log_level: u8,
}

impl Stats {
    pub fn new(initial_log_level: u8) -> Self {
        Stats {
            started_at: Instant::now(),
            count: 0,
            kcc: 0,
            kmx: 0,
            clt: 0,
            by_class: HashMap::new(),
            by_ssl: HashMap::new(),
            rx_peak: 0,
            rx_avg: Ema::default(),
            time_peak_secs: 0.0,
            time_avg: Ema::default(),
            keepalive_peak: 0,
            keepalive_avg: Ema::default(),
            log_level: initial_log_level,
        }
    }

    pub fn log_level(&self) -> u8 {
        self.log_level
    }

    /// Called once at accept time, on the dispatcher's single thread, so
    /// there is no cross-thread write race to guard against.
    pub fn on_accept(&mut self) {
        self.kcc += 1;
        if self.kcc > self.kmx {
            self.kmx = self.kcc;
        }
    }

    pub fn on_admission_rejected(&mut self) {
        self.count += 1;
        self.clt += 1;
    }

    /// Drains one result record, applying it exactly as `pixelserv.c`'s
    /// main loop's pipe-read branch does.
    pub fn apply(&mut self, rec: PipeRecord) {
        match rec.status {
            Classification::ActionLogVerb => {
                if let Some(verb) = rec.verb {
                    self.log_level = verb;
                }
                return;
            }
            Classification::ActionDecKcc => {
                self.kcc -= 1;
                self.keepalive_avg.update(rec.krq as f64);
                if rec.krq > self.keepalive_peak {
                    self.keepalive_peak = rec.krq;
                }
                return;
            }
            status => {
                *self.by_class.entry(status).or_insert(0) += 1;
            }
        }

        match rec.ssl {
            SslOutcome::NotTls => {}
            ssl => {
                *self.by_ssl.entry(ssl).or_insert(0) += 1;
            }
        }

        self.count += 1;

        if rec.rx_total > 0 {
            self.rx_avg.update(rec.rx_total as f64);
            if rec.rx_total > self.rx_peak {
                self.rx_peak = rec.rx_total;
            }
        }

        if !matches!(rec.status, Classification::FailTimeout) {
            self.time_avg.update(rec.run_time);
            if rec.run_time > self.time_peak_secs {
                self.time_peak_secs = rec.run_time;
            }
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let by_class = self
            .by_class
            .iter()
            .map(|(k, v)| (class_name(*k), *v))
            .collect();
        let by_ssl = self.by_ssl.iter().map(|(k, v)| (ssl_name(*k), *v)).collect();

        StatsSnapshot {
            started_at: Some(self.started_at),
            uptime_secs: self.started_at.elapsed().as_secs(),
            count: self.count,
            kcc: self.kcc,
            kmx: self.kmx,
            clt: self.clt,
            by_class,
            by_ssl,
            rx_peak: self.rx_peak,
            rx_avg: self.rx_avg.rounded(),
            time_peak_ms: (self.time_peak_secs * 1000.0).round() as i64,
            time_avg_ms: (self.time_avg.raw() * 1000.0).round() as i64,
            keepalive_peak: self.keepalive_peak,
            keepalive_avg: self.keepalive_avg.rounded(),
        }
    }
}

fn class_name(c: Classification) -> &'static str {
    match c {
        Classification::SendGif => "gif",
        Classification::SendTxt => "txt",
        Classification::SendJpg => "jpg",
        Classification::SendPng => "png",
        Classification::SendSwf => "swf",
        Classification::SendIco => "ico",
        Classification::SendStats => "sta",
        Classification::SendStatsText => "stt",
        Classification::Send204 => "noc",
        Classification::SendRedirect => "rdr",
        Classification::SendNoExt => "nfe",
        Classification::SendUnkExt => "ufe",
        Classification::SendNoUrl => "nou",
        Classification::SendBadPath => "pth",
        Classification::SendPost => "pst",
        Classification::SendHead => "hed",
        Classification::SendOptions => "opt",
        Classification::SendBad => "bad",
        Classification::FailGeneral => "err",
        Classification::FailTimeout => "tmo",
        Classification::FailClosed => "cls",
        Classification::FailReply => "cly",
        Classification::ActionLogVerb | Classification::ActionDecKcc => "_action",
    }
}

fn ssl_name(s: SslOutcome) -> &'static str {
    match s {
        SslOutcome::NotTls => "not_tls",
        SslOutcome::Hit => "slh",
        SslOutcome::Miss => "slm",
        SslOutcome::Err => "sle",
        SslOutcome::HitCls => "slc",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_matches_running_mean() {
        let mut ema = Ema::default();
        let samples = [10.0, 20.0, 30.0, 15.0];
        for s in samples {
            ema.update(s);
        }
        let expected: f64 = samples.iter().sum::<f64>() / samples.len() as f64;
        assert_eq!(ema.rounded(), expected.round() as i64);
    }

    #[test]
    fn dec_kcc_updates_keepalive_ema_and_peak() {
        let mut stats = Stats::new(1);
        stats.on_accept();
        stats.apply(PipeRecord::dec_kcc(3));
        stats.apply(PipeRecord::dec_kcc(7));
        let snap = stats.snapshot();
        assert_eq!(snap.keepalive_peak, 7);
        assert_eq!(snap.keepalive_avg, 5);
        assert_eq!(snap.kcc, -1); // one dec without a matching accept is intentional here
    }

    #[test]
    fn timeout_does_not_feed_runtime_ema() {
        let mut stats = Stats::new(1);
        stats.apply(PipeRecord::outcome(Classification::FailTimeout, SslOutcome::NotTls, 9.0, 0));
        let snap = stats.snapshot();
        assert_eq!(snap.time_avg_ms, 0);
    }

    #[test]
    fn admission_rejection_counts_clt_and_count() {
        let mut stats = Stats::new(1);
        stats.on_admission_rejected();
        let snap = stats.snapshot();
        assert_eq!(snap.clt, 1);
        assert_eq!(snap.count, 1);
    }
}
