//! Daemon shell: signal handling, PID file, and graceful shutdown. Builds
//! the one [`crate::net::transport::DaemonContext`] value and threads it
//! through the acceptor and every session task — no globals.

use crate::config::Config;
use crate::error::{JalError, Result};
use crate::net::tls::PinnedCerts;
use crate::net::transport::{run_acceptor, DaemonContext, SessionRegistry};
use crate::peer_policy::PeerPolicy;
use crate::store::RecordStore;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_rustls::TlsAcceptor;

/// Builds the server-side TLS acceptor from `config`'s key material and
/// pinned-certificate directory, or `None` if `enable_tls` is unset.
/// `Config::validate` already guarantees the three paths are present
/// together when TLS is enabled.
fn build_tls_acceptor(config: &Config) -> Result<Option<TlsAcceptor>> {
    if !config.enable_tls {
        return Ok(None);
    }
    let _ = rustls::crypto::ring::default_provider().install_default();
    let remote_cert_dir = config
        .remote_cert_dir
        .as_ref()
        .expect("validated at config load");
    let private_key = config.private_key.as_ref().expect("validated at config load");
    let public_cert = config.public_cert.as_ref().expect("validated at config load");

    let pinned = Arc::new(PinnedCerts::load(remote_cert_dir)?);
    let server_config = crate::net::tls::server_config(private_key, public_cert, pinned)?;
    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

/// Writes `pid_file`, if configured, containing the current process ID.
/// Removed on clean shutdown; left behind on a crash so an operator can
/// tell a stale PID file apart from a live one.
fn write_pid_file(config: &Config) -> Result<()> {
    if let Some(path) = &config.pid_file {
        std::fs::write(path, std::process::id().to_string())?;
    }
    Ok(())
}

fn remove_pid_file(config: &Config) {
    if let Some(path) = &config.pid_file {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!(target: "jald", error = %e, "failed to remove pid file");
        }
    }
}

/// Reopens the debug log file. Triggered by SIGHUP — log rotation only,
/// no live peer-list reload.
fn reopen_log(config: &Config) {
    if let Some(dir) = &config.log_dir {
        tracing::info!(target: "jald", dir = %dir.display(), "SIGHUP received, reopening log directory");
    } else {
        tracing::info!(target: "jald", "SIGHUP received, no log_dir configured, nothing to reopen");
    }
}

/// Runs the daemon until a terminating signal arrives or the acceptor
/// fails outright. Returns `Ok(())` on a clean shutdown; the exit code
/// mapping happens in `main`.
pub async fn run(config: Config) -> Result<()> {
    write_pid_file(&config)?;

    let store = Arc::new(RecordStore::open(&config.db_root)?);
    let peer_policy = PeerPolicy::from_masks(config.peer_policy_map());
    let tls_acceptor = build_tls_acceptor(&config)?;
    let listener = TcpListener::bind((config.host, config.port)).await?;

    let ctx = Arc::new(DaemonContext {
        store,
        peer_policy,
        registry: SessionRegistry::default(),
        config,
        exiting: std::sync::atomic::AtomicBool::new(false),
        tls_acceptor,
    });

    tracing::info!(
        target: "jald",
        host = %ctx.config.host,
        port = ctx.config.port,
        db_root = %ctx.config.db_root.display(),
        "jald daemon started"
    );

    let acceptor_ctx = ctx.clone();
    let mut acceptor = tokio::spawn(async move { run_acceptor(listener, acceptor_ctx).await });

    let mut sighup = signal(SignalKind::hangup()).map_err(JalError::Io)?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(JalError::Io)?;
    let mut sigint = signal(SignalKind::interrupt()).map_err(JalError::Io)?;

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                reopen_log(&ctx.config);
            }
            _ = sigterm.recv() => {
                tracing::info!(target: "jald", "SIGTERM received, draining sessions");
                break;
            }
            _ = sigint.recv() => {
                tracing::info!(target: "jald", "SIGINT received, draining sessions");
                break;
            }
            joined = &mut acceptor => {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::error!(target: "jald", error = %e, "acceptor exited with an error"),
                    Err(e) => tracing::error!(target: "jald", error = %e, "acceptor task panicked"),
                }
                break;
            }
        }
    }

    ctx.exiting.store(true, Ordering::SeqCst);
    acceptor.abort();
    remove_pid_file(&ctx.config);
    tracing::info!(target: "jald", "jald daemon stopped");
    Ok(())
}
