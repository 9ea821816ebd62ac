//! SIGTERM/SIGUSR1/SIGUSR2 listeners, fed into the dispatcher's
//! `tokio::select!` loop instead of a C-style handler that flips a flag:
//! the async equivalent of the self-pipe trick, handling each signal in
//! the normal multiplexed wait rather than from a signal context.

use tokio::signal::unix::{signal, Signal, SignalKind};

use crate::error::StartupError;

/// One `tokio::signal::unix::Signal` stream per signal the dispatcher
/// reacts to.
pub struct Signals {
    pub term: Signal,
    pub usr1: Signal,
    pub usr2: Signal,
}

impl Signals {
    pub fn install() -> Result<Self, StartupError> {
        let to_err = |e: std::io::Error| StartupError::FactorySpawn(e.to_string());
        Ok(Signals {
            term: signal(SignalKind::terminate()).map_err(to_err)?,
            usr1: signal(SignalKind::user_defined1()).map_err(to_err)?,
            usr2: signal(SignalKind::user_defined2()).map_err(to_err)?,
        })
    }
}
