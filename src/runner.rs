//! Session runners: one resolved command, run to completion
//!
//! Runners only see a narrow view of a session ([`SessionIo`] plus the
//! [`Controls`] channels), so tests can drive them with in-memory streams.

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};

use russh::Sig;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{is_login_shell, Command, CommandError};
use crate::config::{Banner, Config};
use crate::metrics;
use crate::process;

#[cfg(unix)]
pub use crate::pty::WindowSize;

pub type BoxReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// The byte streams of one session.
pub struct SessionIo {
    pub stdin: BoxReader,
    pub stdout: BoxWriter,
    pub stderr: BoxWriter,
}

/// Client-driven events for a running session. Either channel may close on
/// its own; the runner keeps serving the other.
pub struct Controls {
    pub signals: UnboundedReceiver<Sig>,
    #[cfg(unix)]
    pub resizes: UnboundedReceiver<WindowSize>,
}

/// What the client asked for in its `pty-req`.
#[cfg(unix)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub size: WindowSize,
}

/// Why a session did not end cleanly.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The process ran and exited non-zero. -1 means killed by a signal.
    #[error("process exited with code {0}")]
    Exit(i32),
    #[error("create command: {0}")]
    Command(#[from] CommandError),
    #[error("start command: {0}")]
    Start(#[source] io::Error),
    #[error("create stdin pipe")]
    StdinPipe,
    #[error("copy error: {0}")]
    Copy(#[source] io::Error),
    #[error("process wait: {0}")]
    Wait(#[source] io::Error),
    #[error("new agent listener: {0}")]
    AgentListener(#[source] io::Error),
    #[error("session canceled")]
    Canceled,
}

impl SessionError {
    fn from_status(status: ExitStatus) -> Result<(), Self> {
        if status.success() {
            return Ok(());
        }
        Err(Self::Exit(status.code().unwrap_or(-1)))
    }
}

/// Metric labels shared by everything a session records.
#[derive(Debug, Clone, Copy)]
pub struct Labels {
    pub magic_type: &'static str,
    pub pty: bool,
}

impl Labels {
    pub(crate) fn error(&self, what: &'static str) {
        metrics::record_session_error(self.magic_type, self.pty, what);
    }
}

/// Runs commands for one session.
pub struct Runner<'a> {
    pub config: &'a Config,
    pub labels: Labels,
    pub cancel: CancellationToken,
}

impl Runner<'_> {
    /// Run without a terminal: stdio is piped straight to the session.
    pub async fn run_plain(
        &self,
        cmd: &Command,
        io: SessionIo,
        mut signals: UnboundedReceiver<Sig>,
    ) -> Result<(), SessionError> {
        metrics::record_session(self.labels.magic_type, false);

        let SessionIo {
            mut stdin,
            mut stdout,
            mut stderr,
        } = io;

        let mut command = cmd.to_tokio();
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        process::set_new_group(&mut command);

        let mut child = command.spawn().map_err(|e| {
            self.labels.error("start_command");
            SessionError::Start(e)
        })?;

        // A pipe, not inherited stdin: reads block forever otherwise.
        let Some(mut child_stdin) = child.stdin.take() else {
            self.labels.error("stdin_pipe");
            return Err(SessionError::StdinPipe);
        };
        let labels = self.labels;
        let stdin_task = tokio::spawn(async move {
            if tokio::io::copy(&mut stdin, &mut child_stdin).await.is_err() {
                labels.error("stdin_io_copy");
            }
            let _ = child_stdin.shutdown().await;
        });

        let mut child_stdout = child.stdout.take();
        let mut child_stderr = child.stderr.take();
        let pid = child.id();

        let finished = {
            let drain = async {
                let out = async {
                    if let Some(out) = child_stdout.as_mut() {
                        let _ = tokio::io::copy(out, &mut stdout).await;
                    }
                    let _ = stdout.flush().await;
                };
                let err = async {
                    if let Some(err) = child_stderr.as_mut() {
                        let _ = tokio::io::copy(err, &mut stderr).await;
                    }
                    let _ = stderr.flush().await;
                };
                tokio::join!(out, err);
                child.wait().await
            };
            tokio::pin!(drain);

            let mut signals_open = true;
            loop {
                tokio::select! {
                    status = &mut drain => break Some(status),
                    _ = self.cancel.cancelled() => break None,
                    sig = signals.recv(), if signals_open => match sig {
                        Some(sig) => self.deliver(pid, &sig),
                        None => signals_open = false,
                    },
                }
            }
        };
        stdin_task.abort();

        match finished {
            Some(Ok(status)) => SessionError::from_status(status),
            Some(Err(e)) => {
                self.labels.error("wait");
                Err(SessionError::Wait(e))
            }
            None => {
                info!("session canceled, terminating process");
                if let Err(e) = process::terminate(&mut child).await {
                    warn!(%e, "terminating canceled process failed");
                }
                Err(SessionError::Canceled)
            }
        }
    }

    /// Run inside a fresh PTY. Output is drained before the exit code is
    /// collected, so nothing the command printed is lost.
    #[cfg(unix)]
    pub async fn run_pty(
        &self,
        mut cmd: Command,
        io: SessionIo,
        request: &PtyRequest,
        raw_command: &str,
        controls: Controls,
    ) -> Result<(), SessionError> {
        metrics::record_session(self.labels.magic_type, true);

        let SessionIo {
            mut stdin,
            mut stdout,
            stderr: _stderr,
        } = io;

        if is_login_shell(raw_command) {
            for banner in (self.config.announcement_banners)() {
                if let Err(e) = show_banner(&mut stdout, &banner).await {
                    warn!(%e, "failed to show announcement banner");
                    self.labels.error("announcement_banner");
                    break;
                }
            }
        }

        if !is_quiet_login(raw_command, crate::paths::home_dir().as_deref()) {
            if let Some(motd) = (self.config.motd_file)() {
                if let Err(e) = show_motd(&mut stdout, &motd).await {
                    warn!(%e, "failed to show MOTD");
                    self.labels.error("motd");
                }
            }
        }

        cmd.env.push(("TERM".into(), request.term.clone()));

        let (master, mut child) = crate::pty::spawn(&cmd, request.size).map_err(|e| {
            self.labels.error("start_command");
            SessionError::Start(e)
        })?;
        let pid = child.id();

        let relay = {
            let master = master.clone();
            let labels = self.labels;
            let Controls {
                mut signals,
                mut resizes,
            } = controls;
            tokio::spawn(async move {
                let (mut signals_open, mut resizes_open) = (true, true);
                while signals_open || resizes_open {
                    tokio::select! {
                        sig = signals.recv(), if signals_open => match sig {
                            Some(sig) => deliver(labels, pid, &sig),
                            None => signals_open = false,
                        },
                        size = resizes.recv(), if resizes_open => match size {
                            Some(size) => {
                                if let Err(e) = master.resize(size) {
                                    warn!(%e, "failed to resize tty");
                                    labels.error("resize");
                                }
                            }
                            None => resizes_open = false,
                        },
                    }
                }
            })
        };

        let input = {
            let mut writer = master.clone();
            let labels = self.labels;
            tokio::spawn(async move {
                if tokio::io::copy(&mut stdin, &mut writer).await.is_err() {
                    labels.error("input_io_copy");
                }
            })
        };

        let mut reader = master;
        let copied = tokio::select! {
            res = tokio::io::copy(&mut reader, &mut stdout) => Some(res),
            _ = self.cancel.cancelled() => None,
        };
        input.abort();
        relay.abort();
        let _ = stdout.flush().await;

        match copied {
            None => {
                info!("session canceled, terminating process");
                if let Err(e) = process::terminate(&mut child).await {
                    warn!(%e, "terminating canceled process failed");
                }
                return Err(SessionError::Canceled);
            }
            Some(Err(e)) => {
                self.labels.error("output_io_copy");
                let _ = process::terminate(&mut child).await;
                return Err(SessionError::Copy(e));
            }
            Some(Ok(n)) => debug!(bytes = n, "copy output done"),
        }

        match child.wait().await {
            Ok(status) => SessionError::from_status(status),
            Err(e) => {
                warn!(%e, "process wait exited with error");
                self.labels.error("wait");
                Err(SessionError::Wait(e))
            }
        }
    }

    fn deliver(&self, pid: Option<u32>, sig: &Sig) {
        deliver(self.labels, pid, sig);
    }
}

fn deliver(labels: Labels, pid: Option<u32>, sig: &Sig) {
    let name = process::sig_name(sig);
    info!(ssh_signal = name, "received signal from client");
    if let Err(e) = process::signal(pid, sig) {
        warn!(ssh_signal = name, %e, "signaling the process failed");
        labels.error("signal");
    }
}

/// Quiet unless this is a login shell without `~/.hushlogin`.
pub fn is_quiet_login(raw_command: &str, home: Option<&Path>) -> bool {
    if !is_login_shell(raw_command) {
        return true;
    }
    match home {
        Some(home) => home.join(".hushlogin").exists(),
        None => false,
    }
}

/// Write an enabled, non-blank banner followed by a blank line.
pub async fn show_banner<W>(dest: &mut W, banner: &Banner) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if !banner.enabled || banner.message.is_empty() {
        return Ok(());
    }
    let message = format!("{}\n\n", banner.message.trim());
    write_with_carriage_return(message.as_bytes(), dest).await
}

/// Copy the MOTD file to `dest`. A missing file is not an error.
pub async fn show_motd<W>(dest: &mut W, path: &Path) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if path.as_os_str().is_empty() {
        return Ok(());
    }
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    write_with_carriage_return(file, dest).await
}

/// Terminate every line with `\r\n` so it starts at column zero in a raw tty.
async fn write_with_carriage_return<R, W>(src: R, dest: &mut W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut lines = BufReader::new(src).lines();
    while let Some(line) = lines.next_line().await? {
        dest.write_all(line.as_bytes()).await?;
        dest.write_all(b"\r\n").await?;
    }
    dest.flush().await
}
