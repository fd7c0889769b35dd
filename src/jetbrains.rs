//! JetBrains Gateway detection
//!
//! JetBrains clients open many short sessions but keep one `direct-tcpip`
//! channel to the IDE backend for as long as the IDE is connected. That
//! channel is what gets counted.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// Present on the command line of JetBrains IDE backends.
pub const MAGIC_PROCESS_CMDLINE: &str = "idea.vendor.name=JetBrains";

/// Whether the process listening on `port` is a JetBrains backend.
pub async fn is_jetbrains(port: u32) -> bool {
    let Ok(port) = u16::try_from(port) else {
        return false;
    };
    match tokio::task::spawn_blocking(move || listening_cmdline(port)).await {
        Ok(Some(cmdline)) => cmdline.contains(MAGIC_PROCESS_CMDLINE),
        Ok(None) => false,
        Err(e) => {
            debug!(%e, "cmdline lookup task failed");
            false
        }
    }
}

#[cfg(target_os = "linux")]
fn listening_cmdline(port: u16) -> Option<String> {
    use procfs::net::TcpState;
    use procfs::process::FDTarget;

    let entries = procfs::net::tcp()
        .into_iter()
        .chain(procfs::net::tcp6())
        .flatten();
    let inode = entries
        .filter(|entry| entry.state == TcpState::Listen && entry.local_address.port() == port)
        .map(|entry| entry.inode)
        .next()?;

    for process in procfs::process::all_processes().ok()?.flatten() {
        let Ok(fds) = process.fd() else {
            continue;
        };
        let owns_socket = fds
            .flatten()
            .any(|fd| matches!(fd.target, FDTarget::Socket(ino) if ino == inode));
        if owns_socket {
            return process.cmdline().ok().map(|args| args.join(" "));
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn listening_cmdline(_port: u16) -> Option<String> {
    None
}

/// A channel stream counted in `counter` for as long as it is open.
///
/// The count goes up when the stream is wrapped and down exactly once, on
/// shutdown or drop, whichever comes first.
pub struct WatchedStream<S> {
    inner: S,
    counter: Arc<AtomicI64>,
    released: AtomicBool,
}

impl<S> WatchedStream<S> {
    pub fn new(inner: S, counter: Arc<AtomicI64>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self {
            inner,
            counter,
            released: AtomicBool::new(false),
        }
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl<S> Drop for WatchedStream<S> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for WatchedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for WatchedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let res = ready!(Pin::new(&mut self.inner).poll_shutdown(cx));
        self.release();
        Poll::Ready(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn counts_once_across_shutdown_and_drop() {
        let counter = Arc::new(AtomicI64::new(0));
        let (near, mut far) = tokio::io::duplex(64);

        let mut watched = WatchedStream::new(near, Arc::clone(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        watched.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        far.read_exact(&mut buf).await.unwrap();

        watched.shutdown().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        watched.shutdown().await.unwrap();
        drop(watched);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropping_without_shutdown_releases() {
        let counter = Arc::new(AtomicI64::new(0));
        let (near, _far) = tokio::io::duplex(64);
        let a = WatchedStream::new(near, Arc::clone(&counter));
        let (near, _far2) = tokio::io::duplex(64);
        let b = WatchedStream::new(near, Arc::clone(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        drop(a);
        drop(b);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn plain_listeners_are_not_jetbrains() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = u32::from(listener.local_addr().unwrap().port());
        assert!(!is_jetbrains(port).await);
        assert!(!is_jetbrains(70_000).await);
    }
}
