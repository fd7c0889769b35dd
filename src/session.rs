//! Session handling: what happens between `shell`/`exec`/`subsystem` and
//! the exit status.

use std::process::Stdio;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Env;
use crate::forward::ChannelOpener;
use crate::metrics;
#[cfg(unix)]
use crate::runner::PtyRequest;
use crate::runner::{Controls, Labels, Runner, SessionError, SessionIo};
use crate::server::{CountGuard, Shared};
use crate::x11::X11Request;

/// Exit status for sessions that failed inside the server rather than in
/// the command. Unlikely to be confused with a real exit code.
pub const MAGIC_SESSION_ERROR_CODE: u32 = 229;

/// Set by IDE clients to say who they are. Never reaches the command.
pub const MAGIC_SESSION_TYPE_ENV: &str = "CODER_SSH_SESSION_TYPE";

pub const BLOCKED_FILE_TRANSFER_ERROR_CODE: u32 = 65;
pub const BLOCKED_FILE_TRANSFER_ERROR_MESSAGE: &str = "File transfer has been disabled.";
pub const BLOCKED_FILE_TRANSFER_COMMANDS: [&str; 4] = ["nc", "rsync", "scp", "sftp"];

/// Which client opened the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MagicType {
    Ssh,
    VsCode,
    JetBrains,
    Unknown,
}

impl MagicType {
    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "" => Self::Ssh,
            "vscode" => Self::VsCode,
            "jetbrains" => Self::JetBrains,
            _ => Self::Unknown,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Ssh => "ssh",
            Self::VsCode => "vscode",
            Self::JetBrains => "jetbrains",
            Self::Unknown => "unknown",
        }
    }
}

/// Strip the magic variable from `env` and classify the session by it.
pub fn extract_magic_type(env: Env) -> (MagicType, Env) {
    let mut value = String::new();
    let env = env
        .into_iter()
        .filter(|(name, v)| {
            if name == MAGIC_SESSION_TYPE_ENV {
                value = v.clone();
                false
            } else {
                true
            }
        })
        .collect();
    (MagicType::parse(&value), env)
}

/// Whether a session looks like a file transfer that the config forbids.
/// Matches on the program name only, so this stops honest tools, not
/// determined users.
pub fn file_transfer_blocked(block: bool, subsystem: Option<&str>, raw_command: &str) -> bool {
    if !block {
        return false;
    }
    if subsystem == Some("sftp") {
        return true;
    }
    let Some(first) = shell_words::split(raw_command)
        .ok()
        .and_then(|words| words.into_iter().next())
    else {
        return false;
    };
    let base = std::path::Path::new(&first)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or(first);
    BLOCKED_FILE_TRANSFER_COMMANDS.contains(&base.as_str())
}

/// Everything the client asked for before starting the session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub raw_command: String,
    pub subsystem: Option<String>,
    pub env: Env,
    #[cfg(unix)]
    pub pty: Option<PtyRequest>,
    /// Already negotiated.
    pub x11: Option<X11Request>,
    pub agent: bool,
}

/// How the session channel should be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Send this exit status, then close.
    Exit(u32),
    /// Close without an exit status.
    Hangup,
}

/// Map a runner result to what the client sees.
pub fn exit_code(res: Result<(), SessionError>) -> SessionEnd {
    match res {
        Ok(()) => {
            info!("normal ssh session exit");
            SessionEnd::Exit(0)
        }
        Err(SessionError::Canceled) => {
            info!("ssh session canceled");
            SessionEnd::Hangup
        }
        Err(SessionError::Exit(code)) => {
            // -1 (killed by a signal) would go out as 4294967295; report 255 like OpenSSH.
            let exit_code = if code == -1 { 255 } else { code as u32 };
            info!(process_exit_code = code, exit_code, "ssh session returned");
            SessionEnd::Exit(exit_code)
        }
        Err(e) => {
            warn!(error = %e, "ssh session failed");
            SessionEnd::Exit(MAGIC_SESSION_ERROR_CODE)
        }
    }
}

/// Run one session to completion.
pub(crate) async fn handle_session<O: ChannelOpener>(
    shared: Arc<Shared>,
    req: SessionRequest,
    mut io: SessionIo,
    controls: Controls,
    opener: O,
    conn: &CancellationToken,
) -> SessionEnd {
    let span = info_span!("session", id = %Uuid::new_v4());
    async move {
        info!("handling ssh session");

        let cancel = conn.child_token();
        let Some(_registration) = shared.tracker.track_session(cancel.clone()) else {
            info!("unable to accept new session, server is closing");
            return SessionEnd::Hangup;
        };

        let mut extra_env = Env::new();
        if let Some(x11) = &req.x11 {
            match start_x11(&shared, x11, opener.clone(), &cancel).await {
                Ok(display_number) => extra_env.push((
                    "DISPLAY".into(),
                    format!("localhost:{display_number}.{}", x11.screen),
                )),
                Err(e) => {
                    error!(error = %e, "x11 handler failed");
                    return SessionEnd::Exit(1);
                }
            }
        }

        let subsystem = req.subsystem.as_deref();
        if file_transfer_blocked(shared.config.block_file_transfer, subsystem, &req.raw_command) {
            warn!(?subsystem, raw_command = %req.raw_command, "file transfer blocked");
            // sftp clients choke on anything that is not a packet.
            if subsystem.is_none() {
                let message = format!("\x02{BLOCKED_FILE_TRANSFER_ERROR_MESSAGE}\n");
                let _ = io.stdout.write_all(message.as_bytes()).await;
                let _ = io.stdout.flush().await;
            }
            return SessionEnd::Exit(BLOCKED_FILE_TRANSFER_ERROR_CODE);
        }

        match subsystem {
            None => {}
            Some("sftp") => return serve_sftp(&shared, io, &cancel).await,
            Some(other) => {
                warn!(subsystem = other, "unsupported subsystem");
                return SessionEnd::Exit(1);
            }
        }

        exit_code(session_start(&shared, req, extra_env, io, controls, opener, cancel).await)
    }
    .instrument(span)
    .await
}

/// Forward a free display for the session and record the client's cookie
/// for it. The forward stops with the session.
#[cfg(unix)]
async fn start_x11<O: ChannelOpener>(
    shared: &Arc<Shared>,
    x11: &X11Request,
    opener: O,
    cancel: &CancellationToken,
) -> Result<u32, crate::x11::X11Error> {
    let forward = cancel.child_token();
    let display_number = crate::x11::forward(
        &shared.tracker,
        &shared.x11_displays,
        &shared.config,
        x11.single_connection,
        opener,
        forward.clone(),
    )?;

    let req = x11.clone();
    let written =
        tokio::task::spawn_blocking(move || crate::x11::write_xauthority(display_number, &req))
            .await;
    match written {
        Ok(Ok(())) => Ok(display_number),
        Ok(Err(e)) => {
            forward.cancel();
            Err(e)
        }
        Err(e) => {
            forward.cancel();
            Err(std::io::Error::other(e).into())
        }
    }
}

#[cfg(not(unix))]
async fn start_x11<O: ChannelOpener>(
    _shared: &Arc<Shared>,
    _x11: &X11Request,
    _opener: O,
    _cancel: &CancellationToken,
) -> Result<u32, std::io::Error> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "x11 forwarding needs unix sockets",
    ))
}

async fn session_start<O: ChannelOpener>(
    shared: &Arc<Shared>,
    req: SessionRequest,
    extra_env: Env,
    io: SessionIo,
    controls: Controls,
    opener: O,
    cancel: CancellationToken,
) -> Result<(), SessionError> {
    let mut env = req.env;
    env.extend(extra_env);
    let (magic, env) = extract_magic_type(env);

    let counters = &shared.counters;
    let _count = match magic {
        MagicType::Ssh => Some(CountGuard::new(&counters.sessions)),
        MagicType::VsCode => Some(CountGuard::new(&counters.vscode)),
        // One long-lived forward is counted instead; see `jetbrains`.
        MagicType::JetBrains => None,
        MagicType::Unknown => {
            warn!("invalid magic ssh session type specified");
            None
        }
    };

    #[cfg(unix)]
    let is_pty = req.pty.is_some();
    #[cfg(not(unix))]
    let is_pty = false;
    let labels = Labels {
        magic_type: magic.label(),
        pty: is_pty,
    };

    let mut cmd = shared
        .create_command(&req.raw_command, env)
        .inspect_err(|_| labels.error("create_command"))?;

    #[cfg(unix)]
    let _agent = if req.agent {
        let agent = crate::agent::AgentForward::start(opener, &cancel).map_err(|e| {
            labels.error("listener");
            SessionError::AgentListener(e)
        })?;
        cmd.env.push((
            "SSH_AUTH_SOCK".into(),
            agent.socket_path().to_string_lossy().into_owned(),
        ));
        Some(agent)
    } else {
        None
    };
    #[cfg(not(unix))]
    let _ = (opener, req.agent);

    let runner = Runner {
        config: &shared.config,
        labels,
        cancel,
    };
    #[cfg(unix)]
    {
        if let Some(pty) = &req.pty {
            return runner
                .run_pty(cmd, io, pty, &req.raw_command, controls)
                .await;
        }
    }
    runner.run_plain(&cmd, io, controls.signals).await
}

/// Serve the `sftp` subsystem with the host's `sftp-server`, started in the
/// home directory.
async fn serve_sftp(shared: &Shared, io: SessionIo, cancel: &CancellationToken) -> SessionEnd {
    metrics::record_sftp_connection();

    let Some(engine) = shared.config.sftp_server_paths.iter().find(|p| p.is_file()) else {
        warn!("no sftp-server binary found");
        metrics::record_sftp_error();
        return SessionEnd::Exit(1);
    };

    let mut command = tokio::process::Command::new(engine);
    match crate::paths::home_dir() {
        Some(home) => {
            command.current_dir(home);
        }
        None => warn!("get sftp working directory failed, unable to get home dir"),
    }
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(error = %e, engine = %engine.display(), "start sftp server");
            metrics::record_sftp_error();
            return SessionEnd::Exit(1);
        }
    };
    debug!(engine = %engine.display(), "sftp server started");

    let SessionIo {
        mut stdin,
        mut stdout,
        ..
    } = io;
    let (Some(mut child_in), Some(mut child_out)) = (child.stdin.take(), child.stdout.take())
    else {
        metrics::record_sftp_error();
        return SessionEnd::Exit(1);
    };

    let input = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut stdin, &mut child_in).await;
        let _ = child_in.shutdown().await;
    });
    let served = async {
        let _ = tokio::io::copy(&mut child_out, &mut stdout).await;
        let _ = stdout.flush().await;
        child.wait().await
    };
    let status = tokio::select! {
        status = served => Some(status),
        _ = cancel.cancelled() => None,
    };
    input.abort();

    match status {
        Some(Ok(status)) if status.success() => SessionEnd::Exit(0),
        Some(Ok(status)) => {
            warn!(%status, "sftp server closed with error");
            metrics::record_sftp_error();
            SessionEnd::Exit(1)
        }
        Some(Err(e)) => {
            warn!(error = %e, "sftp server wait failed");
            metrics::record_sftp_error();
            SessionEnd::Exit(1)
        }
        None => SessionEnd::Hangup,
    }
}
