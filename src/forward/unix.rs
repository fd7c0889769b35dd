//! Unix socket forwarding (`streamlocal-forward@openssh.com` and
//! `direct-streamlocal@openssh.com`)

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChannelOpener, ForwardError};
use crate::bicopy::bicopy;
use crate::tracker::Tracker;

struct Entry {
    id: u64,
    /// Connection that requested the forward.
    owner: u64,
    cancel: CancellationToken,
    /// Cancelled by the accept loop once it has cleaned up.
    done: CancellationToken,
}

/// Forwarded socket paths. Guarded by its own lock, separate from the
/// server's tracker.
#[derive(Default)]
pub struct UnixForwarder {
    forwards: Mutex<HashMap<PathBuf, Entry>>,
    next_id: AtomicU64,
}

impl UnixForwarder {
    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, Entry>> {
        self.forwards.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_forwarded(&self, path: &Path) -> bool {
        self.lock().contains_key(path)
    }

    /// Drop the entry for `path` if it is still forward `id`.
    fn release(&self, path: &Path, id: u64) {
        let mut forwards = self.lock();
        if forwards.get(path).is_some_and(|entry| entry.id == id) {
            forwards.remove(path);
        }
    }

    /// Listen on `socket_path` and open a `forwarded-streamlocal` channel for
    /// every connection. The path is claimed before anything touches the
    /// filesystem, so concurrent requests for one path get exactly one
    /// listener.
    pub async fn forward<O: ChannelOpener>(
        self: &Arc<Self>,
        tracker: &Arc<Tracker>,
        opener: O,
        socket_path: &str,
        owner: u64,
        parent: &CancellationToken,
    ) -> Result<(), ForwardError> {
        let path = PathBuf::from(socket_path);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = parent.child_token();
        let done = CancellationToken::new();
        let registration = tracker
            .try_track_listener(cancel.clone())
            .ok_or(ForwardError::Closing)?;
        {
            let mut forwards = self.lock();
            if forwards.contains_key(&path) {
                return Err(ForwardError::AlreadyForwarded(socket_path.to_string()));
            }
            forwards.insert(
                path.clone(),
                Entry {
                    id,
                    owner,
                    cancel: cancel.clone(),
                    done: done.clone(),
                },
            );
        }

        let listener = match bind(&path).await {
            Ok(listener) => listener,
            Err(e) => {
                self.release(&path, id);
                done.cancel();
                return Err(e);
            }
        };
        info!(socket_path, "streamlocal-forward listening");

        let forwarder = Arc::clone(self);
        let socket_path = socket_path.to_string();
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = listener.accept() => match res {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            warn!(%e, "streamlocal-forward accept failed");
                            break;
                        }
                    },
                };

                let opener = opener.clone();
                let cancel = cancel.clone();
                let socket_path = socket_path.clone();
                tokio::spawn(async move {
                    match opener.open_forwarded_streamlocal(socket_path).await {
                        Ok(channel) => bicopy(&cancel, stream, channel).await,
                        Err(e) => warn!(%e, "forwarded-streamlocal open failed"),
                    }
                });
            }

            drop(listener);
            if let Err(e) = std::fs::remove_file(&path) {
                debug!(%e, "remove forwarded socket");
            }
            forwarder.release(&path, id);
            drop(registration);
            done.cancel();
            debug!(socket_path, "streamlocal-forward stopped");
        });

        Ok(())
    }

    /// Close the listener on `socket_path` if `owner` requested it, and wait
    /// for its accept loop to deregister it so the path can be forwarded
    /// again right away.
    pub async fn cancel(&self, socket_path: &str, owner: u64) -> Result<(), ForwardError> {
        let (cancel, done) = {
            let forwards = self.lock();
            let entry = forwards
                .get(Path::new(socket_path))
                .ok_or_else(|| ForwardError::NotForwarded(socket_path.to_string()))?;
            if entry.owner != owner {
                return Err(ForwardError::NotOwner(socket_path.to_string()));
            }
            (entry.cancel.clone(), entry.done.clone())
        };
        cancel.cancel();
        done.cancelled().await;
        info!(socket_path, "streamlocal-forward canceled");
        Ok(())
    }
}

async fn bind(path: &Path) -> Result<UnixListener, ForwardError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(ForwardError::SocketDir)?;
    }
    UnixListener::bind(path).map_err(ForwardError::Bind)
}

/// Serve a `direct-streamlocal` channel: dial the socket and splice it to
/// the channel until either side closes.
pub async fn direct<S>(cancel: &CancellationToken, socket_path: &str, channel: S) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send,
{
    let stream = UnixStream::connect(socket_path).await?;
    debug!(socket_path, "direct-streamlocal connected");
    bicopy(cancel, stream, channel).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::testing::{FakeOpener, Opened};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn a_path_is_forwarded_once() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("nested/dir/app.sock");
        let sock = sock.to_str().unwrap();

        let forwarder = Arc::new(UnixForwarder::default());
        let tracker = Tracker::new();
        let (opener, mut opened) = FakeOpener::new();
        let conn = CancellationToken::new();

        forwarder
            .forward(&tracker, opener.clone(), sock, 1, &conn)
            .await
            .unwrap();
        assert!(matches!(
            forwarder.forward(&tracker, opener.clone(), sock, 1, &conn).await,
            Err(ForwardError::AlreadyForwarded(_))
        ));

        let mut local = UnixStream::connect(sock).await.unwrap();
        let (what, mut far) = opened.recv().await.unwrap();
        assert_eq!(
            what,
            Opened::ForwardedStreamlocal {
                socket_path: sock.to_string()
            }
        );
        local.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn cancel_frees_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("app.sock");
        let sock = sock.to_str().unwrap();

        let forwarder = Arc::new(UnixForwarder::default());
        let tracker = Tracker::new();
        let (opener, _opened) = FakeOpener::new();
        let conn = CancellationToken::new();

        forwarder
            .forward(&tracker, opener.clone(), sock, 1, &conn)
            .await
            .unwrap();
        forwarder.cancel(sock, 1).await.unwrap();
        assert!(!forwarder.is_forwarded(Path::new(sock)));
        assert!(!Path::new(sock).exists());
        assert!(matches!(
            forwarder.cancel(sock, 1).await,
            Err(ForwardError::NotForwarded(_))
        ));

        forwarder.forward(&tracker, opener, sock, 1, &conn).await.unwrap();
        assert!(forwarder.is_forwarded(Path::new(sock)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_requests_get_one_listener() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("race.sock");
        let sock = sock.to_str().unwrap();

        let forwarder = Arc::new(UnixForwarder::default());
        let tracker = Tracker::new();
        let (opener, _opened) = FakeOpener::new();
        let conn = CancellationToken::new();

        let (a, b) = tokio::join!(
            forwarder.forward(&tracker, opener.clone(), sock, 1, &conn),
            forwarder.forward(&tracker, opener.clone(), sock, 2, &conn),
        );
        let won = [&a, &b].iter().filter(|res| res.is_ok()).count();
        assert_eq!(won, 1, "a: {a:?}, b: {b:?}");
        let lost = if a.is_ok() { b } else { a };
        assert!(matches!(lost, Err(ForwardError::AlreadyForwarded(_))));
        assert_eq!(tracker.counts().listeners, 1);
        UnixStream::connect(sock).await.unwrap();
    }

    #[tokio::test]
    async fn only_the_owner_cancels_a_forward() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("owned.sock");
        let sock = sock.to_str().unwrap();

        let forwarder = Arc::new(UnixForwarder::default());
        let tracker = Tracker::new();
        let (opener, _opened) = FakeOpener::new();
        let conn = CancellationToken::new();

        forwarder
            .forward(&tracker, opener, sock, 1, &conn)
            .await
            .unwrap();
        assert!(matches!(
            forwarder.cancel(sock, 2).await,
            Err(ForwardError::NotOwner(_))
        ));
        assert!(Path::new(sock).exists());
        forwarder.cancel(sock, 1).await.unwrap();
        assert!(!Path::new(sock).exists());
    }

    #[tokio::test]
    async fn closing_tracker_leaves_no_socket_behind() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("late.sock");
        let sock = sock.to_str().unwrap();

        let forwarder = Arc::new(UnixForwarder::default());
        let tracker = Tracker::new();
        let (opener, _opened) = FakeOpener::new();

        // A live session keeps the close in flight.
        let session = tracker.track_session(CancellationToken::new()).unwrap();
        let closing = tokio::spawn({
            let tracker = Arc::clone(&tracker);
            async move { tracker.close().await }
        });
        while !tracker.is_closing() {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            forwarder
                .forward(&tracker, opener, sock, 1, &CancellationToken::new())
                .await,
            Err(ForwardError::Closing)
        ));
        assert!(!Path::new(sock).exists());
        assert!(!forwarder.is_forwarded(Path::new(sock)));

        drop(session);
        closing.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn direct_streamlocal_dials_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("svc.sock");
        let server = UnixListener::bind(&sock).unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = server.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let (near, mut far) = tokio::io::duplex(1024);
        let path = sock.to_str().unwrap().to_string();
        tokio::spawn(async move { direct(&CancellationToken::new(), &path, near).await });

        far.write_all(b"echo!").await.unwrap();
        let mut got = Vec::new();
        far.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"echo!");
    }
}
