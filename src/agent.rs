//! SSH agent forwarding
//!
//! A private socket in a fresh temp directory; every connection to it is
//! relayed to the client's agent over an `auth-agent@openssh.com` channel.

use std::io;
use std::path::{Path, PathBuf};

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bicopy::bicopy;
use crate::forward::ChannelOpener;

/// A live agent socket. Dropping it stops the listener and removes the
/// directory.
pub struct AgentForward {
    dir: PathBuf,
    socket: PathBuf,
    cancel: CancellationToken,
}

impl AgentForward {
    /// Value for `SSH_AUTH_SOCK`.
    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    /// Create the socket and start relaying. Connections stop with `parent`.
    pub fn start<O: ChannelOpener>(opener: O, parent: &CancellationToken) -> io::Result<Self> {
        let dir = std::env::temp_dir().join(format!("auth-agent-{}", Uuid::new_v4()));
        {
            use std::os::unix::fs::DirBuilderExt;
            std::fs::DirBuilder::new().mode(0o700).create(&dir)?;
        }
        let socket = dir.join("listener.sock");
        let listener = match UnixListener::bind(&socket) {
            Ok(listener) => listener,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&dir);
                return Err(e);
            }
        };

        let cancel = parent.child_token();
        let token = cancel.clone();
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = token.cancelled() => break,
                    res = listener.accept() => match res {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            warn!(%e, "agent socket accept failed");
                            break;
                        }
                    },
                };
                let opener = opener.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    match opener.open_agent().await {
                        Ok(channel) => bicopy(&token, stream, channel).await,
                        Err(e) => warn!(%e, "auth-agent channel open failed"),
                    }
                });
            }
        });

        debug!(socket = %socket.display(), "agent forwarding listening");
        Ok(Self {
            dir,
            socket,
            cancel,
        })
    }
}

impl Drop for AgentForward {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            debug!(%e, "remove agent socket dir");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::testing::{FakeOpener, Opened};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn agent_requests_reach_the_client() {
        let (opener, mut opened) = FakeOpener::new();
        let agent = AgentForward::start(opener, &CancellationToken::new()).unwrap();
        let socket = agent.socket_path().to_path_buf();

        {
            use std::os::unix::fs::PermissionsExt;
            let dir = socket.parent().unwrap();
            let mode = std::fs::metadata(dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }

        let mut local = tokio::net::UnixStream::connect(&socket).await.unwrap();
        let (what, mut far) = opened.recv().await.unwrap();
        assert_eq!(what, Opened::Agent);

        local.write_all(b"\x00\x00\x00\x01\x0b").await.unwrap();
        let mut buf = [0u8; 5];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x00\x00\x00\x01\x0b");

        drop(agent);
        assert!(!socket.exists());
    }
}
