//! SSH test client for automated testing
//!
//! Connects to agentssh, runs commands, captures output and exit status.

use std::time::Duration;

use anyhow::{Context, Result};
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// What a finished command produced.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the server closed the channel without an exit status.
    pub exit_status: Option<u32>,
}

impl ExecOutput {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// SSH test client for running commands and capturing output
pub struct SshTestClient {
    handle: Handle<ClientHandler>,
}

impl SshTestClient {
    /// Connect and authenticate with the `none` method, which agentssh
    /// always accepts.
    pub async fn connect(addr: &str, username: &str) -> Result<Self> {
        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(config, addr, ClientHandler)
            .await
            .context("failed to connect")?;

        let auth_result = handle
            .authenticate_none(username)
            .await
            .context("authentication failed")?;
        if !auth_result.success() {
            anyhow::bail!("authentication rejected");
        }

        Ok(Self { handle })
    }

    /// Run `command` without a pty.
    pub async fn exec(&self, command: &str) -> Result<ExecOutput> {
        self.run(command, &[], None).await
    }

    /// Run `command` with extra environment variables.
    pub async fn exec_env(&self, command: &str, env: &[(&str, &str)]) -> Result<ExecOutput> {
        self.run(command, env, None).await
    }

    /// Run `command` on an 80x24 pty of type `term`.
    pub async fn exec_pty(&self, command: &str, term: &str) -> Result<ExecOutput> {
        self.run(command, &[], Some(term)).await
    }

    /// Start the `subsystem` and return whatever it produced, given no input.
    pub async fn subsystem(&self, subsystem: &str) -> Result<ExecOutput> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .context("failed to open session channel")?;
        channel
            .request_subsystem(true, subsystem)
            .await
            .context("failed to request subsystem")?;
        channel.eof().await.context("failed to send eof")?;
        collect(channel).await
    }

    /// Open a `direct-tcpip` channel to `host:port` through the server.
    pub async fn direct_tcpip(
        &self,
        host: &str,
        port: u32,
    ) -> Result<impl AsyncRead + AsyncWrite + Unpin> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, port, "127.0.0.1", 0)
            .await
            .context("failed to open direct-tcpip channel")?;
        Ok(channel.into_stream())
    }

    async fn run(
        &self,
        command: &str,
        env: &[(&str, &str)],
        term: Option<&str>,
    ) -> Result<ExecOutput> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .context("failed to open session channel")?;

        for (name, value) in env {
            channel
                .set_env(false, *name, *value)
                .await
                .context("failed to set env")?;
        }
        if let Some(term) = term {
            channel
                .request_pty(false, term, 80, 24, 0, 0, &[])
                .await
                .context("failed to request PTY")?;
        }
        channel
            .exec(true, command)
            .await
            .context("failed to request exec")?;
        channel.eof().await.context("failed to send eof")?;

        collect(channel).await
    }

    /// Close the connection
    pub async fn close(self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "goodbye", "en")
            .await
            .context("failed to disconnect")?;
        Ok(())
    }
}

/// Read a session channel until it closes.
async fn collect(mut channel: russh::Channel<client::Msg>) -> Result<ExecOutput> {
    let mut output = ExecOutput::default();
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(30), channel.wait())
            .await
            .context("timeout waiting for channel")?;
        match msg {
            Some(ChannelMsg::Data { data }) => output.stdout.extend_from_slice(&data),
            Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                output.stderr.extend_from_slice(&data)
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => output.exit_status = Some(exit_status),
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }
    Ok(output)
}

/// Client handler that trusts any host key
struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}
