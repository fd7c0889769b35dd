//! SSH connection handler

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use russh::server::{self, Handle, Msg, Session};
use russh::{Channel, ChannelId, Pty, Sig};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Env;
use crate::forward::tcp;
use crate::jetbrains::{self, WatchedStream};
use crate::runner::{Controls, SessionIo};
#[cfg(unix)]
use crate::runner::{PtyRequest, WindowSize};
use crate::server::Shared;
use crate::session::{self, SessionEnd, SessionRequest};
use crate::x11::X11Request;

/// A session channel still collecting requests.
struct Pending {
    channel: Channel<Msg>,
    env: Env,
    #[cfg(unix)]
    pty: Option<PtyRequest>,
    x11: Option<X11Request>,
    agent: bool,
}

/// A session channel whose command has started.
struct Running {
    signals: UnboundedSender<Sig>,
    #[cfg(unix)]
    resizes: UnboundedSender<WindowSize>,
}

enum ChannelState {
    Pending(Pending),
    Running(Running),
}

/// Per-connection SSH handler
pub struct ConnectionHandler {
    shared: Arc<Shared>,
    /// Cancelled when the connection ends; everything the connection
    /// started hangs off it.
    cancel: CancellationToken,
    /// Tags the forwards this connection owns.
    conn_id: u64,
    channels: HashMap<ChannelId, ChannelState>,
}

impl ConnectionHandler {
    pub(crate) fn new(shared: Arc<Shared>, cancel: CancellationToken, conn_id: u64) -> Self {
        Self {
            shared,
            cancel,
            conn_id,
            channels: HashMap::new(),
        }
    }

    fn pending(&mut self, channel: ChannelId) -> Option<&mut Pending> {
        match self.channels.get_mut(&channel) {
            Some(ChannelState::Pending(pending)) => Some(pending),
            _ => None,
        }
    }

    /// Hand a pending channel to a session task.
    fn start_session(
        &mut self,
        channel: ChannelId,
        raw_command: String,
        subsystem: Option<String>,
        session: &mut Session,
    ) -> Result<()> {
        let Some(ChannelState::Pending(pending)) = self.channels.remove(&channel) else {
            warn!(?channel, "session already started");
            session.channel_failure(channel)?;
            return Ok(());
        };

        let (sig_tx, signals) = mpsc::unbounded_channel();
        #[cfg(unix)]
        let (resize_tx, resizes) = mpsc::unbounded_channel();
        self.channels.insert(
            channel,
            ChannelState::Running(Running {
                signals: sig_tx,
                #[cfg(unix)]
                resizes: resize_tx,
            }),
        );
        session.channel_success(channel)?;

        let stderr = pending.channel.make_writer_ext(Some(1));
        let (stdin, stdout) = tokio::io::split(pending.channel.into_stream());
        let io = SessionIo {
            stdin: Box::pin(stdin),
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
        };
        let controls = Controls {
            signals,
            #[cfg(unix)]
            resizes,
        };
        let req = SessionRequest {
            raw_command,
            subsystem,
            env: pending.env,
            #[cfg(unix)]
            pty: pending.pty,
            x11: pending.x11,
            agent: pending.agent,
        };

        let shared = Arc::clone(&self.shared);
        let handle = session.handle();
        let conn = self.cancel.clone();
        tokio::spawn(async move {
            let end =
                session::handle_session(shared, req, io, controls, handle.clone(), &conn).await;
            if let SessionEnd::Exit(code) = end {
                let _ = handle.eof(channel).await;
                let _ = handle.exit_status_request(channel, code).await;
            }
            let _ = handle.close(channel).await;
        });
        Ok(())
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Close a forwarding channel once its relay is done.
async fn close_channel(handle: Handle, channel: ChannelId) {
    let _ = handle.close(channel).await;
}

impl server::Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<server::Auth, Self::Error> {
        debug!(user, "accepting auth: none");
        Ok(server::Auth::Accept)
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<server::Auth, Self::Error> {
        debug!(user, "accepting auth: password");
        Ok(server::Auth::Accept)
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _key: &russh::keys::PublicKey,
    ) -> Result<server::Auth, Self::Error> {
        debug!(user, "accepting auth: publickey");
        Ok(server::Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(channel_id = ?channel.id(), "session channel opened");
        self.channels.insert(
            channel.id(),
            ChannelState::Pending(Pending {
                channel,
                env: Env::new(),
                #[cfg(unix)]
                pty: None,
                x11: None,
                agent: false,
            }),
        );
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        #[cfg(unix)]
        {
            if let Some(pending) = self.pending(channel) {
                pending.pty = Some(PtyRequest {
                    term: term.to_string(),
                    size: WindowSize::from_ssh(col_width, row_height, pix_width, pix_height),
                });
                session.channel_success(channel)?;
                return Ok(());
            }
        }
        #[cfg(not(unix))]
        let _ = (term, col_width, row_height, pix_width, pix_height);
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(pending) = self.pending(channel) {
            pending
                .env
                .push((variable_name.to_string(), variable_value.to_string()));
        }
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        single_connection: bool,
        x11_auth_protocol: &str,
        x11_auth_cookie: &str,
        x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let req = X11Request {
            single_connection,
            auth_protocol: x11_auth_protocol.to_string(),
            auth_cookie: x11_auth_cookie.to_string(),
            screen: x11_screen_number,
        };
        if self.pending(channel).is_none() || !negotiate_x11(&self.shared, &req).await {
            session.channel_failure(channel)?;
            return Ok(());
        }
        if let Some(pending) = self.pending(channel) {
            pending.x11 = Some(req);
        }
        session.channel_success(channel)?;
        Ok(())
    }

    async fn agent_request(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        match self.pending(channel) {
            Some(pending) => {
                pending.agent = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_session(channel, String::new(), None, session)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let raw_command = String::from_utf8_lossy(data).into_owned();
        self.start_session(channel, raw_command, None, session)
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_session(channel, String::new(), Some(name.to_string()), session)
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        #[cfg(unix)]
        {
            let size = WindowSize::from_ssh(col_width, row_height, pix_width, pix_height);
            match self.channels.get_mut(&channel) {
                Some(ChannelState::Running(running)) => {
                    let _ = running.resizes.send(size);
                }
                Some(ChannelState::Pending(Pending { pty: Some(pty), .. })) => pty.size = size,
                _ => {}
            }
        }
        #[cfg(not(unix))]
        let _ = (channel, col_width, row_height, pix_width, pix_height);
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(ChannelState::Running(running)) = self.channels.get(&channel) {
            let _ = running.signals.send(signal);
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(?channel, "channel closed by client");
        self.channels.remove(&channel);
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(
            destination_host = host_to_connect,
            destination_port = port_to_connect,
            originator_address,
            originator_port,
            "local port forward"
        );

        let watched = jetbrains::is_jetbrains(port_to_connect).await;
        let counter = Arc::clone(&self.shared.counters.jetbrains);
        let cancel = self.cancel.clone();
        let handle = session.handle();
        let host = host_to_connect.to_string();
        tokio::spawn(async move {
            let id = channel.id();
            let stream = channel.into_stream();
            let res = if watched {
                info!(port = port_to_connect, "jetbrains backend forward");
                tcp::direct(&cancel, &host, port_to_connect, WatchedStream::new(stream, counter))
                    .await
            } else {
                tcp::direct(&cancel, &host, port_to_connect, stream).await
            };
            if let Err(e) = res {
                warn!(host, port = port_to_connect, error = %e, "direct-tcpip dial failed");
            }
            close_channel(handle, id).await;
        });
        Ok(true)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(bind_host = address, bind_port = *port, "reverse port forward");
        let shared = &self.shared;
        match shared
            .tcp
            .forward(
                &shared.tracker,
                session.handle(),
                address,
                *port,
                self.conn_id,
                &self.cancel,
            )
            .await
        {
            Ok(bound) => {
                *port = bound;
                Ok(true)
            }
            Err(e) => {
                warn!(bind_host = address, bind_port = *port, error = %e, "tcpip-forward rejected");
                Ok(false)
            }
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        match self.shared.tcp.cancel(address, port, self.conn_id) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(error = %e, "cancel-tcpip-forward rejected");
                Ok(false)
            }
        }
    }

    #[cfg(unix)]
    async fn channel_open_direct_streamlocal(
        &mut self,
        channel: Channel<Msg>,
        socket_path: &str,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(socket_path, "direct-streamlocal");
        let cancel = self.cancel.clone();
        let handle = session.handle();
        let socket_path = socket_path.to_string();
        tokio::spawn(async move {
            let id = channel.id();
            if let Err(e) =
                crate::forward::unix::direct(&cancel, &socket_path, channel.into_stream()).await
            {
                warn!(socket_path, error = %e, "direct-streamlocal dial failed");
            }
            close_channel(handle, id).await;
        });
        Ok(true)
    }

    #[cfg(unix)]
    async fn streamlocal_forward(
        &mut self,
        socket_path: &str,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let shared = &self.shared;
        match shared
            .unix
            .forward(
                &shared.tracker,
                session.handle(),
                socket_path,
                self.conn_id,
                &self.cancel,
            )
            .await
        {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(socket_path, error = %e, "streamlocal-forward rejected");
                Ok(false)
            }
        }
    }

    #[cfg(unix)]
    async fn cancel_streamlocal_forward(
        &mut self,
        socket_path: &str,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        match self.shared.unix.cancel(socket_path, self.conn_id).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(socket_path, error = %e, "cancel-streamlocal-forward rejected");
                Ok(false)
            }
        }
    }
}

/// Check `req` and prepare the socket directory. A failure only disables
/// X11 for this session.
#[cfg(unix)]
async fn negotiate_x11(shared: &Arc<Shared>, req: &X11Request) -> bool {
    let shared = Arc::clone(shared);
    let req = req.clone();
    match tokio::task::spawn_blocking(move || crate::x11::negotiate(&shared.config, &req)).await {
        Ok(Ok(())) => {
            debug!("x11 forwarding negotiated");
            true
        }
        Ok(Err(e)) => {
            warn!(error = %e, "x11 negotiation failed");
            false
        }
        Err(e) => {
            warn!(error = %e, "x11 negotiation task failed");
            false
        }
    }
}

#[cfg(not(unix))]
async fn negotiate_x11(_shared: &Arc<Shared>, _req: &X11Request) -> bool {
    false
}
