//! X11 forwarding
//!
//! Negotiation checks the request and prepares the socket directory.
//! Forwarding binds the first free `X<display>` in that directory, opens
//! an `x11` channel back to the client for each connection made to it, and
//! the session then writes the client's cookie for that display to
//! `~/.Xauthority` so local X clients can authenticate.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
#[cfg(unix)]
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use thiserror::Error;

pub const X11_DEFAULT_DISPLAY_OFFSET: u32 = 10;
pub const X11_DEFAULT_SOCKET_DIR: &str = "/tmp/.X11-unix";
/// How many display numbers past the offset are tried.
pub const X11_MAX_DISPLAYS: u32 = 200;

/// Xauthority address family for local connections.
const FAMILY_LOCAL: u16 = 0x0100;
#[cfg(unix)]
const XAUTH_LOCK_TIMEOUT: Duration = Duration::from_millis(500);

/// The client's `x11-req`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X11Request {
    pub single_connection: bool,
    pub auth_protocol: String,
    /// Hex encoded.
    pub auth_cookie: String,
    pub screen: u32,
}

#[derive(Debug, Error)]
pub enum X11Error {
    #[error("get hostname: {0}")]
    Hostname(#[source] io::Error),
    #[error("create socket directory: {0}")]
    SocketDir(#[source] io::Error),
    #[error("no home directory for the Xauthority file")]
    NoHome,
    #[error("auth cookie is not valid hex")]
    Cookie,
    #[error("xauthority field of {0} bytes does not fit")]
    FieldTooLong(usize),
    #[error("timed out waiting for the Xauthority lock")]
    LockTimeout,
    #[error("xauthority: {0}")]
    Io(#[from] io::Error),
    #[error("bind x11 socket: {0}")]
    Bind(#[source] io::Error),
    #[error("no free x11 display in {0}..{1}")]
    NoFreeDisplay(u32, u32),
    #[error("server is closing")]
    Closing,
}

/// One Xauthority record: family, then length-prefixed address, display
/// number, auth protocol name and auth data. Integers are big-endian.
pub fn encode_entry(
    host: &str,
    display: &str,
    protocol: &str,
    cookie: &[u8],
) -> Result<BytesMut, X11Error> {
    let mut buf = BytesMut::with_capacity(
        2 + 8 + host.len() + display.len() + protocol.len() + cookie.len(),
    );
    buf.put_u16(FAMILY_LOCAL);
    for field in [host.as_bytes(), display.as_bytes(), protocol.as_bytes(), cookie] {
        let len = u16::try_from(field.len()).map_err(|_| X11Error::FieldTooLong(field.len()))?;
        buf.put_u16(len);
        buf.put_slice(field);
    }
    Ok(buf)
}

fn decode_hex(s: &str) -> Result<Vec<u8>, X11Error> {
    let s = s.as_bytes();
    if s.len() % 2 != 0 {
        return Err(X11Error::Cookie);
    }
    let nibble = |c: u8| match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(X11Error::Cookie),
    };
    s.chunks(2)
        .map(|pair| Ok((nibble(pair[0])? << 4) | nibble(pair[1])?))
        .collect()
}

/// Append a record to the Xauthority file at `path`. The file is only ever
/// appended to, under an exclusive lock, and created with mode 0600.
pub fn append_entry(
    path: &Path,
    host: &str,
    display: u32,
    protocol: &str,
    cookie_hex: &str,
) -> Result<(), X11Error> {
    let cookie = decode_hex(cookie_hex)?;
    let entry = encode_entry(host, &display.to_string(), protocol, &cookie)?;

    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = lock_exclusive(options.open(path)?)?;
    file.write_all(&entry)?;
    file.flush()?;
    Ok(())
}

/// Non-blocking lock attempts with backoff, so a stuck holder costs us at
/// most [`XAUTH_LOCK_TIMEOUT`]. The lock is released when the guard drops.
#[cfg(unix)]
fn lock_exclusive(mut file: File) -> Result<nix::fcntl::Flock<File>, X11Error> {
    use nix::errno::Errno;
    use nix::fcntl::{Flock, FlockArg};

    let deadline = Instant::now() + XAUTH_LOCK_TIMEOUT;
    let mut backoff = Duration::from_millis(5);
    loop {
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => return Ok(locked),
            Err((unlocked, Errno::EWOULDBLOCK)) => file = unlocked,
            Err((_, errno)) => return Err(io::Error::from(errno).into()),
        }
        if Instant::now() >= deadline {
            return Err(X11Error::LockTimeout);
        }
        std::thread::sleep(backoff);
        backoff = (backoff * 2).min(Duration::from_millis(100));
    }
}

#[cfg(not(unix))]
fn lock_exclusive(file: File) -> Result<File, X11Error> {
    Ok(file)
}

#[cfg(unix)]
pub use listener::{forward, negotiate, write_xauthority, X11Displays};

#[cfg(unix)]
mod listener {
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex, MutexGuard};

    use tokio::net::UnixListener;
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, info, warn};

    use super::*;
    use crate::bicopy::bicopy;
    use crate::config::Config;
    use crate::forward::ChannelOpener;
    use crate::tracker::Tracker;

    /// Display numbers held by this server's sessions.
    #[derive(Default)]
    pub struct X11Displays {
        taken: Mutex<HashSet<u32>>,
    }

    impl X11Displays {
        fn lock(&self) -> MutexGuard<'_, HashSet<u32>> {
            self.taken.lock().unwrap_or_else(|e| e.into_inner())
        }

        fn claim(self: &Arc<Self>, number: u32) -> Option<DisplayLease> {
            self.lock().insert(number).then(|| DisplayLease {
                displays: Arc::clone(self),
                number,
            })
        }

        pub fn is_taken(&self, number: u32) -> bool {
            self.lock().contains(&number)
        }
    }

    /// One session's hold on a display number.
    struct DisplayLease {
        displays: Arc<X11Displays>,
        number: u32,
    }

    impl Drop for DisplayLease {
        fn drop(&mut self) {
            self.displays.lock().remove(&self.number);
        }
    }

    /// Check the request and create the socket directory. Blocking.
    pub fn negotiate(config: &Config, req: &X11Request) -> Result<(), X11Error> {
        use std::os::unix::fs::DirBuilderExt;

        decode_hex(&req.auth_cookie)?;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&config.x11_socket_dir)
            .map_err(X11Error::SocketDir)?;
        Ok(())
    }

    /// Record the client's cookie for `display_number` in the user's
    /// Xauthority file. Blocking.
    pub fn write_xauthority(display_number: u32, req: &X11Request) -> Result<(), X11Error> {
        let hostname = nix::unistd::gethostname()
            .map_err(|e| X11Error::Hostname(e.into()))?
            .to_string_lossy()
            .into_owned();
        let xauthority = crate::paths::xauthority_path().ok_or(X11Error::NoHome)?;
        append_entry(
            &xauthority,
            &hostname,
            display_number,
            &req.auth_protocol,
            &req.auth_cookie,
        )?;
        debug!(display_number, path = %xauthority.display(), "xauthority entry added");
        Ok(())
    }

    /// Bind the first display at or after the configured offset that no
    /// other session holds and no other process is listening on.
    fn bind_free_display(
        displays: &Arc<X11Displays>,
        config: &Config,
    ) -> Result<(UnixListener, PathBuf, DisplayLease), X11Error> {
        let first = config.x11_display_offset;
        let last = first.saturating_add(X11_MAX_DISPLAYS);
        for number in first..last {
            let Some(lease) = displays.claim(number) else {
                continue;
            };
            let path = config.x11_socket_dir.join(format!("X{number}"));
            if std::os::unix::net::UnixStream::connect(&path).is_ok() {
                debug!(display_number = number, "x11 display served by another process");
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed stale x11 socket"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => debug!(path = %path.display(), %e, "remove stale x11 socket"),
            }
            match UnixListener::bind(&path) {
                Ok(listener) => return Ok((listener, path, lease)),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
                Err(e) => return Err(X11Error::Bind(e)),
            }
        }
        Err(X11Error::NoFreeDisplay(first, last))
    }

    /// Bind a free display socket and forward its connections to the
    /// client until `cancel` fires. Returns the display number.
    pub fn forward<O: ChannelOpener>(
        tracker: &Arc<Tracker>,
        displays: &Arc<X11Displays>,
        config: &Config,
        single_connection: bool,
        opener: O,
        cancel: CancellationToken,
    ) -> Result<u32, X11Error> {
        let registration = tracker
            .try_track_listener(cancel.clone())
            .ok_or(X11Error::Closing)?;
        let (listener, path, lease) = bind_free_display(displays, config)?;
        let display_number = lease.number;
        info!(display_number, path = %path.display(), "x11 forwarding listening");

        tokio::spawn(async move {
            let originator = path.to_string_lossy().into_owned();
            let mut accepted = 0usize;
            loop {
                let stream = tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = listener.accept() => match res {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            warn!(%e, "x11 accept failed");
                            break;
                        }
                    },
                };
                accepted += 1;
                if single_connection && accepted > 1 {
                    debug!("single-connection x11 forward, dropping extra connection");
                    drop(stream);
                    continue;
                }

                let opener = opener.clone();
                let originator = originator.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    match opener.open_x11(originator, 0).await {
                        Ok(channel) => bicopy(&cancel, stream, channel).await,
                        Err(e) => warn!(%e, "x11 channel open failed"),
                    }
                });
            }
            drop(listener);
            // Unlinked while the lease still keeps sibling sessions off this
            // display, so the path is still ours.
            let _ = std::fs::remove_file(&path);
            drop(lease);
            drop(registration);
            debug!(display_number, "x11 forwarding stopped");
        });
        Ok(display_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;

    fn read_field(buf: &mut &[u8]) -> Vec<u8> {
        let len = buf.get_u16() as usize;
        let field = buf[..len].to_vec();
        buf.advance(len);
        field
    }

    #[test]
    fn xauthority_record_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".Xauthority");
        append_entry(&path, "workspace", 10, "MIT-MAGIC-COOKIE-1", "00ff10Ab").unwrap();
        append_entry(&path, "workspace", 11, "MIT-MAGIC-COOKIE-1", "01").unwrap();

        let data = std::fs::read(&path).unwrap();
        let mut buf = data.as_slice();

        assert_eq!(buf.get_u16(), FAMILY_LOCAL);
        assert_eq!(read_field(&mut buf), b"workspace");
        assert_eq!(read_field(&mut buf), b"10");
        assert_eq!(read_field(&mut buf), b"MIT-MAGIC-COOKIE-1");
        assert_eq!(read_field(&mut buf), vec![0x00, 0xff, 0x10, 0xab]);

        // Appended, not replaced.
        assert_eq!(buf.get_u16(), FAMILY_LOCAL);
        read_field(&mut buf);
        assert_eq!(read_field(&mut buf), b"11");
        read_field(&mut buf);
        assert_eq!(read_field(&mut buf), vec![0x01]);
        assert!(buf.is_empty());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn bad_cookie_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".Xauthority");
        assert!(matches!(
            append_entry(&path, "h", 10, "MIT-MAGIC-COOKIE-1", "xyz"),
            Err(X11Error::Cookie)
        ));
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn forwards_connections_as_x11_channels() {
        use crate::config::Config;
        use crate::forward::testing::{FakeOpener, Opened};
        use crate::tracker::Tracker;
        use std::sync::Arc;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio_util::sync::CancellationToken;

        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            x11_socket_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        // A stale socket file from an earlier session.
        std::fs::write(dir.path().join("X10"), "").unwrap();

        let tracker = Tracker::new();
        let displays = Arc::new(X11Displays::default());
        let (opener, mut opened) = FakeOpener::new();
        let cancel = CancellationToken::new();
        let display_number =
            forward(&tracker, &displays, &config, true, opener, cancel.clone()).unwrap();
        assert_eq!(display_number, 10);
        assert_eq!(tracker.counts().listeners, 1);

        let mut client = tokio::net::UnixStream::connect(dir.path().join("X10"))
            .await
            .unwrap();
        let (what, mut far) = opened.recv().await.unwrap();
        assert!(matches!(what, Opened::X11 { .. }));

        client.write_all(b"hello x").await.unwrap();
        let mut buf = [0u8; 7];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello x");

        // Single connection: the second one is closed straight away.
        let mut second = tokio::net::UnixStream::connect(dir.path().join("X10"))
            .await
            .unwrap();
        let mut rest = Vec::new();
        second.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while tracker.counts().listeners != 0 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!dir.path().join("X10").exists());
        assert!(!displays.is_taken(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn concurrent_sessions_get_their_own_displays() {
        use crate::config::Config;
        use crate::forward::testing::{FakeOpener, Opened};
        use crate::tracker::Tracker;
        use std::sync::Arc;
        use std::time::Duration;
        use tokio_util::sync::CancellationToken;

        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            x11_socket_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        // Another process already serves X12.
        let _foreign = tokio::net::UnixListener::bind(dir.path().join("X12")).unwrap();

        let tracker = Tracker::new();
        let displays = Arc::new(X11Displays::default());
        let (opener, mut opened) = FakeOpener::new();
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        let c = CancellationToken::new();

        assert_eq!(
            forward(&tracker, &displays, &config, false, opener.clone(), a.clone()).unwrap(),
            10
        );
        assert_eq!(
            forward(&tracker, &displays, &config, false, opener.clone(), b.clone()).unwrap(),
            11
        );
        assert_eq!(
            forward(&tracker, &displays, &config, false, opener.clone(), c.clone()).unwrap(),
            13
        );

        a.cancel();
        tokio::time::timeout(Duration::from_secs(5), async {
            while tracker.counts().listeners != 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!dir.path().join("X10").exists());
        assert!(dir.path().join("X12").exists());

        // B's socket survived A's teardown and still forwards.
        tokio::net::UnixStream::connect(dir.path().join("X11"))
            .await
            .unwrap();
        let (what, _far) = opened.recv().await.unwrap();
        assert!(matches!(what, Opened::X11 { .. }));

        // The freed display is handed out again.
        let d = CancellationToken::new();
        assert_eq!(
            forward(&tracker, &displays, &config, false, opener, d.clone()).unwrap(),
            10
        );
        for token in [b, c, d] {
            token.cancel();
        }
    }

    #[cfg(unix)]
    #[test]
    fn negotiate_rejects_bad_cookies_and_makes_the_socket_dir() {
        use crate::config::Config;

        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            x11_socket_dir: dir.path().join(".X11-unix"),
            ..Config::default()
        };
        let mut req = X11Request {
            single_connection: false,
            auth_protocol: "MIT-MAGIC-COOKIE-1".into(),
            auth_cookie: "zz".into(),
            screen: 0,
        };
        assert!(matches!(negotiate(&config, &req), Err(X11Error::Cookie)));

        req.auth_cookie = "00ff".into();
        negotiate(&config, &req).unwrap();
        assert!(config.x11_socket_dir.is_dir());
    }
}
