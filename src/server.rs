//! The embedded SSH server
//!
//! One [`Server`] per agent. [`Server::serve`] may be called for any number
//! of listeners; [`Server::close`] hangs up on everything and leaves the
//! server ready to serve again.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::keys::{Algorithm, PrivateKey};
use russh::{Disconnect, MethodKind, MethodSet};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::command::{self, Command, CommandDeps, CommandError, SystemDeps};
use crate::config::{Config, Env};
use crate::forward::tcp::TcpForwarder;
#[cfg(unix)]
use crate::forward::unix::UnixForwarder;
use crate::metrics;
use crate::ssh::ConnectionHandler;
use crate::tracker::{Registration, Tracker, TrackerError};
#[cfg(unix)]
use crate::x11::X11Displays;

/// Below this, `max_timeout` is a plain idle timeout; at or above it, it
/// becomes a keepalive budget.
const KEEPALIVE_THRESHOLD: Duration = Duration::from_secs(3);
const KEEPALIVE_MAX: usize = 3;
/// How long a closing connection gets to finish its disconnect.
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server is closing")]
    AlreadyClosing,
}

impl From<TrackerError> for ServerError {
    fn from(err: TrackerError) -> Self {
        match err {
            TrackerError::AlreadyClosing => Self::AlreadyClosing,
        }
    }
}

/// Live session counts by client type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnStats {
    pub sessions: i64,
    pub vscode: i64,
    pub jetbrains: i64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) sessions: AtomicI64,
    pub(crate) vscode: AtomicI64,
    pub(crate) jetbrains: Arc<AtomicI64>,
}

/// Holds one unit of a counter until dropped.
pub(crate) struct CountGuard<'a>(&'a AtomicI64);

impl<'a> CountGuard<'a> {
    pub(crate) fn new(counter: &'a AtomicI64) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// State shared by every connection of a server.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) ssh_config: Arc<russh::server::Config>,
    pub(crate) tracker: Arc<Tracker>,
    pub(crate) counters: Counters,
    pub(crate) tcp: Arc<TcpForwarder>,
    #[cfg(unix)]
    pub(crate) unix: Arc<UnixForwarder>,
    #[cfg(unix)]
    pub(crate) x11_displays: Arc<X11Displays>,
    pub(crate) deps: Arc<dyn CommandDeps>,
}

impl Shared {
    pub(crate) fn create_command(&self, script: &str, env: Env) -> Result<Command, CommandError> {
        command::build(&self.config, script, env, self.deps.as_ref())
    }
}

/// Anything [`Server::serve`] can accept connections from.
pub trait Listener: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// The next connection and a printable peer address.
    fn accept(&self) -> impl Future<Output = io::Result<(Self::Stream, String)>> + Send;

    fn local_addr_string(&self) -> String;
}

impl Listener for TcpListener {
    type Stream = tokio::net::TcpStream;

    async fn accept(&self) -> io::Result<(Self::Stream, String)> {
        let (stream, peer) = TcpListener::accept(self).await?;
        Ok((stream, peer.to_string()))
    }

    fn local_addr_string(&self) -> String {
        self.local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into())
    }
}

#[cfg(unix)]
impl Listener for tokio::net::UnixListener {
    type Stream = tokio::net::UnixStream;

    async fn accept(&self) -> io::Result<(Self::Stream, String)> {
        let (stream, _) = tokio::net::UnixListener::accept(self).await?;
        Ok((stream, "unix".into()))
    }

    fn local_addr_string(&self) -> String {
        self.local_addr()
            .ok()
            .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
            .unwrap_or_else(|| "unix".into())
    }
}

/// SSH settings derived from [`Config`].
fn ssh_config(config: &Config, key: PrivateKey) -> russh::server::Config {
    let mut methods = MethodSet::empty();
    methods.push(MethodKind::None);
    methods.push(MethodKind::Password);
    methods.push(MethodKind::PublicKey);

    let mut ssh = russh::server::Config {
        keys: vec![key],
        methods,
        auth_rejection_time: Duration::ZERO,
        auth_rejection_time_initial: Some(Duration::ZERO),
        inactivity_timeout: None,
        ..Default::default()
    };
    if config.max_timeout >= KEEPALIVE_THRESHOLD {
        ssh.keepalive_interval = Some(config.max_timeout / KEEPALIVE_MAX as u32);
        ssh.keepalive_max = KEEPALIVE_MAX;
    } else if !config.max_timeout.is_zero() {
        ssh.inactivity_timeout = Some(config.max_timeout);
    }
    ssh
}

#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_deps(config, Arc::new(SystemDeps))
    }

    /// Like [`Server::new`], resolving commands through `deps`.
    pub fn with_deps(config: Config, deps: Arc<dyn CommandDeps>) -> Result<Self> {
        // Clients are not expected to pin this key.
        let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
            .context("failed to generate host key")?;
        let ssh_config = Arc::new(ssh_config(&config, key));

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                ssh_config,
                tracker: Tracker::new(),
                counters: Counters::default(),
                tcp: Arc::new(TcpForwarder::default()),
                #[cfg(unix)]
                unix: Arc::new(UnixForwarder::default()),
                #[cfg(unix)]
                x11_displays: Arc::new(X11Displays::default()),
                deps,
            }),
        })
    }

    /// Accept connections until the listener fails or the server closes.
    pub async fn serve<L: Listener>(&self, listener: L) -> io::Result<()> {
        let listen_addr = listener.local_addr_string();
        info!(%listen_addr, "started serving listener");

        let registration = self
            .shared
            .tracker
            .track_listener(CancellationToken::new())
            .await;
        let res = loop {
            let (stream, remote_addr) = tokio::select! {
                _ = registration.token().cancelled() => {
                    break Err(io::Error::new(io::ErrorKind::ConnectionAborted, "listener closed"));
                }
                res = listener.accept() => match res {
                    Ok(conn) => conn,
                    Err(e) => break Err(e),
                },
            };

            let Some(conn) = self
                .shared
                .tracker
                .track_conn(&registration, CancellationToken::new())
            else {
                info!(%remote_addr, "received connection after server closed");
                continue;
            };
            let span = info_span!("conn", %remote_addr, %listen_addr);
            tokio::spawn(handle_conn(Arc::clone(&self.shared), stream, conn).instrument(span));
        };

        drop(listener);
        drop(registration);
        info!(%listen_addr, error = ?res.as_ref().err(), "stopped serving listener");
        res
    }

    /// Hang up on every session and connection, stop every listener, and
    /// wait for all of them to finish. Sessions get no exit status, so
    /// OpenSSH clients report 255.
    pub async fn close(&self) -> Result<(), ServerError> {
        self.shared.tracker.close().await?;
        info!("server closed");
        Ok(())
    }

    /// Graceful shutdown. Does nothing: [`Server::close`] is the only way
    /// to stop the server.
    // TODO: SIGHUP running commands and let their sessions exit on their own.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        Ok(())
    }

    pub fn conn_stats(&self) -> ConnStats {
        let counters = &self.shared.counters;
        ConnStats {
            sessions: counters.sessions.load(Ordering::SeqCst),
            vscode: counters.vscode.load(Ordering::SeqCst),
            jetbrains: counters.jetbrains.load(Ordering::SeqCst),
        }
    }

    /// Resolve `script` the way a session would.
    pub fn create_command(&self, script: &str, env: Env) -> Result<Command, CommandError> {
        self.shared.create_command(script, env)
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }
}

async fn handle_conn<S>(shared: Arc<Shared>, stream: S, conn: Registration)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    info!("started serving connection");
    let handler = ConnectionHandler::new(Arc::clone(&shared), conn.token().clone(), conn.id());
    let running =
        match russh::server::run_stream(Arc::clone(&shared.ssh_config), stream, handler).await {
            Ok(running) => running,
            Err(e) => {
                warn!(error = %e, "ssh connection failed");
                metrics::record_failed_connection();
                return;
            }
        };

    let handle = running.handle();
    tokio::pin!(running);
    let res = tokio::select! {
        res = &mut running => res,
        _ = conn.token().cancelled() => {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "server closing".into(), "en".into())
                .await;
            match tokio::time::timeout(DISCONNECT_GRACE, &mut running).await {
                Ok(res) => res,
                Err(_) => {
                    warn!("connection did not finish disconnecting");
                    Ok(())
                }
            }
        }
    };

    match res {
        Ok(()) => info!("ssh connection complete"),
        Err(e) => {
            warn!(error = %e, "ssh connection failed");
            metrics::record_failed_connection();
        }
    }
    drop(conn);
}
