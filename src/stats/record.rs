//! The result record a connection worker posts to the dispatcher, once per
//! keep-alive request plus one final `ActionDecKcc` at teardown. Stands in
//! for `pixelserv.c`'s `response_struct` written down the stats pipe.

use crate::classify::{Classification, SslOutcome};

#[derive(Debug, Clone, Copy)]
pub struct PipeRecord {
    pub status: Classification,
    pub ssl: SslOutcome,
    pub run_time: f64,
    pub krq: u32,
    /// Bytes of request head received; feeds the receive-size peak/EMA.
    /// Named directly from `pixelserv.c`'s `response_struct.rx_total`.
    pub rx_total: u64,
    /// Only meaningful when `status == ActionLogVerb`.
    pub verb: Option<u8>,
}

impl PipeRecord {
    pub fn outcome(status: Classification, ssl: SslOutcome, run_time: f64, rx_total: u64) -> Self {
        PipeRecord { status, ssl, run_time, krq: 0, rx_total, verb: None }
    }

    pub fn dec_kcc(krq: u32) -> Self {
        PipeRecord {
            status: Classification::ActionDecKcc,
            ssl: SslOutcome::NotTls,
            run_time: 0.0,
            krq,
            rx_total: 0,
            verb: None,
        }
    }
}
