//! The dispatcher: binds every configured listener, admits or rejects new
//! connections against `max_service_threads`, spawns one worker task per
//! accepted connection, drains the stats channel, and reacts to signals.
//! Mirrors `pixelserv.c`'s single-threaded `select()` main loop, with
//! per-listener accept loops forwarding into one channel standing in for
//! the original's single `select()` fd set.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use socket2::{Domain, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::certs::TlsContextCache;
use crate::config::{Config, BACKLOG};
use crate::conn::handler;
use crate::error::StartupError;
use crate::signals::Signals;
use crate::stats::{PipeRecord, Stats, StatsSnapshot};

/// One accepted connection plus the port it arrived on, so the dispatcher
/// can tell which listeners are under load without querying each socket.
struct Accepted {
    stream: TcpStream,
    port: u16,
}

/// Binds every port in `cfg.ports`, via `socket2` so `SO_REUSEADDR` (and,
/// when `-n` names an interface, `SO_BINDTODEVICE`) are set before the
/// listening socket is handed to Tokio.
fn bind_listener(cfg: &Config, port: u16) -> Result<TcpListener, StartupError> {
    // Bracket bare IPv6 literals ("::" -> "[::]:port") so the combined
    // string parses as a single SocketAddr either way.
    let host = if cfg.bind_addr.contains(':') && !cfg.bind_addr.starts_with('[') {
        format!("[{}]", cfg.bind_addr)
    } else {
        cfg.bind_addr.clone()
    };
    let addr: SocketAddr = format!("{host}:{port}").parse().map_err(|e| {
        StartupError::Bind { addr: format!("{host}:{port}"), source: std::io::Error::other(format!("{e}")) }
    })?;

    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)
        .map_err(|source| StartupError::Bind { addr: addr.to_string(), source })?;

    socket.set_reuse_address(true).map_err(|source| StartupError::Bind { addr: addr.to_string(), source })?;

    #[cfg(target_os = "linux")]
    if let Some(iface) = &cfg.iface {
        if let Err(source) = socket.bind_device(Some(iface.as_bytes())) {
            return Err(StartupError::Bind { addr: addr.to_string(), source });
        }
    }

    socket.set_nodelay(true).map_err(|source| StartupError::Bind { addr: addr.to_string(), source })?;

    socket.bind(&addr.into()).map_err(|source| StartupError::Bind { addr: addr.to_string(), source })?;
    enable_tcp_fastopen(&socket);
    socket.listen(BACKLOG).map_err(|source| StartupError::Bind { addr: addr.to_string(), source })?;
    socket.set_nonblocking(true).map_err(|source| StartupError::Bind { addr: addr.to_string(), source })?;

    TcpListener::from_std(socket.into())
        .map_err(|source| StartupError::Bind { addr: addr.to_string(), source })
}

/// Best-effort `TCP_FASTOPEN`. A listening socket that can't take it just
/// falls back to the regular three-way handshake; that's not worth
/// failing startup over.
#[cfg(target_os = "linux")]
fn enable_tcp_fastopen(socket: &Socket) {
    use std::os::unix::io::AsRawFd;

    let queue_len: libc::c_int = 5;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_FASTOPEN,
            &queue_len as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        debug!("TCP_FASTOPEN unavailable: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(target_os = "linux"))]
fn enable_tcp_fastopen(_socket: &Socket) {}

/// Spawns one accept loop per listener, all funneling into `conn_tx`. This
/// is the async analogue of adding each listening fd to the original
/// process's single `select()` set.
fn spawn_acceptors(listeners: Vec<(u16, TcpListener)>, conn_tx: mpsc::UnboundedSender<Accepted>) {
    for (port, listener) in listeners {
        let conn_tx = conn_tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        if conn_tx.send(Accepted { stream, port }).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(port, "accept() failed: {e}");
                    }
                }
            }
        });
    }
}

fn log_snapshot(snapshot: &StatsSnapshot) {
    info!(
        count = snapshot.count,
        kcc = snapshot.kcc,
        kmx = snapshot.kmx,
        clt = snapshot.clt,
        rx_avg = snapshot.rx_avg,
        rx_peak = snapshot.rx_peak,
        time_avg_ms = snapshot.time_avg_ms,
        time_peak_ms = snapshot.time_peak_ms,
        "stats snapshot"
    );
}

/// Binds every port in `cfg.ports` up front, so a bind failure is always a
/// startup error, never a mid-run surprise, and so `main` has a chance to
/// drop privileges between "bind the low ports" and "serve connections".
pub fn bind_all(cfg: &Config) -> Result<Vec<(u16, TcpListener)>, StartupError> {
    let mut listeners = Vec::with_capacity(cfg.ports.len());
    for &port in &cfg.ports {
        listeners.push((port, bind_listener(cfg, port)?));
        info!(port, tls = cfg.is_tls_port(port), "listening");
    }
    Ok(listeners)
}

/// Runs the dispatcher until SIGTERM, over listeners already bound by
/// [`bind_all`].
pub async fn run(
    cfg: Arc<Config>,
    tls_cache: Arc<TlsContextCache>,
    listeners: Vec<(u16, TcpListener)>,
) -> Result<(), StartupError> {
    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<Accepted>();
    spawn_acceptors(listeners, conn_tx);

    let (stats_tx, mut stats_rx) = mpsc::unbounded_channel::<PipeRecord>();
    let (snapshot_tx, snapshot_rx) = watch::channel(StatsSnapshot::default());

    let mut stats = Stats::new(cfg.log_level);
    let kcc = AtomicI64::new(0);
    let mut signals = Signals::install()?;

    loop {
        tokio::select! {
            Some(accepted) = conn_rx.recv() => {
                if kcc.load(Ordering::Relaxed) >= cfg.max_service_threads as i64 {
                    stats.on_admission_rejected();
                    debug!(port = accepted.port, "connection rejected: at max_service_threads");
                    continue;
                }
                stats.on_accept();
                kcc.store(stats_kcc(&stats), Ordering::Relaxed);

                let cfg = Arc::clone(&cfg);
                let tls_cache = Arc::clone(&tls_cache);
                let stats_tx = stats_tx.clone();
                let stats_rx = snapshot_rx.clone();
                tokio::spawn(handler::handle_connection(accepted.stream, cfg, tls_cache, stats_tx, stats_rx));
            }
            Some(rec) = stats_rx.recv() => {
                stats.apply(rec);
                kcc.store(stats_kcc(&stats), Ordering::Relaxed);
                let _ = snapshot_tx.send(stats.snapshot());
            }
            _ = signals.term.recv() => {
                info!("SIGTERM received, logging final stats and exiting");
                log_snapshot(&stats.snapshot());
                return Ok(());
            }
            _ = signals.usr1.recv() => {
                log_snapshot(&stats.snapshot());
            }
            _ = signals.usr2.recv(), if cfg!(debug_assertions) => {
                match serde_json::to_string(&stats.snapshot()) {
                    Ok(json) => debug!(log_level = stats.log_level(), stats = %json, "SIGUSR2: last instrumentation point"),
                    Err(e) => debug!("SIGUSR2: failed to serialize stats snapshot: {e}"),
                }
            }
        }
    }
}

fn stats_kcc(stats: &Stats) -> i64 {
    stats.snapshot().kcc
}
