//! Port and socket forwarding
//!
//! - `tcp`: `tcpip-forward` listeners and `direct-tcpip` dials
//! - `unix`: the OpenSSH streamlocal extension, both directions
//!
//! Anything that needs to open a channel back to the client goes through
//! [`ChannelOpener`], so forwarders can be exercised without a live SSH
//! connection.

use std::future::Future;
use std::io;

use russh::server::{Handle, Msg};
use russh::ChannelStream;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod tcp;
#[cfg(unix)]
pub mod unix;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("{0} is already forwarded")]
    AlreadyForwarded(String),
    #[error("{0} is not forwarded")]
    NotForwarded(String),
    #[error("{0} is forwarded by another connection")]
    NotOwner(String),
    #[error("port {0} out of range")]
    InvalidPort(u32),
    #[error("create socket directory: {0}")]
    SocketDir(#[source] io::Error),
    #[error("listen: {0}")]
    Bind(#[source] io::Error),
    #[error("server is closing")]
    Closing,
}

/// Opens client-bound channels on one connection.
pub trait ChannelOpener: Clone + Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// `forwarded-tcpip`: a connection arrived on a remote-forward listener.
    fn open_forwarded_tcpip(
        &self,
        bind_addr: String,
        bind_port: u32,
        originator_addr: String,
        originator_port: u32,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// `forwarded-streamlocal@openssh.com`
    fn open_forwarded_streamlocal(
        &self,
        socket_path: String,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// `x11`
    fn open_x11(
        &self,
        originator_addr: String,
        originator_port: u32,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// `auth-agent@openssh.com`
    fn open_agent(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

fn open_error(kind: &str, err: russh::Error) -> io::Error {
    io::Error::other(format!("open {kind} channel: {err}"))
}

impl ChannelOpener for Handle {
    type Stream = ChannelStream<Msg>;

    async fn open_forwarded_tcpip(
        &self,
        bind_addr: String,
        bind_port: u32,
        originator_addr: String,
        originator_port: u32,
    ) -> io::Result<Self::Stream> {
        self.channel_open_forwarded_tcpip(bind_addr, bind_port, originator_addr, originator_port)
            .await
            .map(|ch| ch.into_stream())
            .map_err(|e| open_error("forwarded-tcpip", e))
    }

    async fn open_forwarded_streamlocal(&self, socket_path: String) -> io::Result<Self::Stream> {
        self.channel_open_forwarded_streamlocal(socket_path)
            .await
            .map(|ch| ch.into_stream())
            .map_err(|e| open_error("forwarded-streamlocal", e))
    }

    async fn open_x11(
        &self,
        originator_addr: String,
        originator_port: u32,
    ) -> io::Result<Self::Stream> {
        self.channel_open_x11(originator_addr, originator_port)
            .await
            .map(|ch| ch.into_stream())
            .map_err(|e| open_error("x11", e))
    }

    async fn open_agent(&self) -> io::Result<Self::Stream> {
        self.channel_open_agent()
            .await
            .map(|ch| ch.into_stream())
            .map_err(|e| open_error("auth-agent", e))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! An in-memory [`ChannelOpener`] that hands the far end of every
    //! opened channel to the test.

    use super::*;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Opened {
        ForwardedTcpip { bind_addr: String, bind_port: u32 },
        ForwardedStreamlocal { socket_path: String },
        X11 { originator_addr: String },
        Agent,
    }

    #[derive(Clone)]
    pub(crate) struct FakeOpener {
        tx: mpsc::UnboundedSender<(Opened, DuplexStream)>,
    }

    impl FakeOpener {
        pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<(Opened, DuplexStream)>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Self { tx }, rx)
        }

        fn open(&self, what: Opened) -> io::Result<DuplexStream> {
            let (near, far) = tokio::io::duplex(1 << 16);
            self.tx
                .send((what, far))
                .map_err(|_| io::Error::other("test dropped the receiver"))?;
            Ok(near)
        }
    }

    impl ChannelOpener for FakeOpener {
        type Stream = DuplexStream;

        async fn open_forwarded_tcpip(
            &self,
            bind_addr: String,
            bind_port: u32,
            _originator_addr: String,
            _originator_port: u32,
        ) -> io::Result<DuplexStream> {
            self.open(Opened::ForwardedTcpip {
                bind_addr,
                bind_port,
            })
        }

        async fn open_forwarded_streamlocal(&self, socket_path: String) -> io::Result<DuplexStream> {
            self.open(Opened::ForwardedStreamlocal { socket_path })
        }

        async fn open_x11(
            &self,
            originator_addr: String,
            _originator_port: u32,
        ) -> io::Result<DuplexStream> {
            self.open(Opened::X11 { originator_addr })
        }

        async fn open_agent(&self) -> io::Result<DuplexStream> {
            self.open(Opened::Agent)
        }
    }
}
