//! TCP forwarding: `tcpip-forward` listeners and `direct-tcpip` dials

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry as Slot;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
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
}

/// Remote-forward listeners of one server, keyed by bound address and port.
#[derive(Default)]
pub struct TcpForwarder {
    forwards: DashMap<(String, u32), Entry>,
    next_id: AtomicU64,
}

/// `""` and `*` mean every interface, as in OpenSSH.
fn bind_host(addr: &str) -> &str {
    match addr {
        "" | "*" => "0.0.0.0",
        other => other,
    }
}

impl TcpForwarder {
    /// Listen on `addr:port` and open a `forwarded-tcpip` channel for every
    /// connection. Returns the bound port, which differs from `port` when the
    /// client asked for 0.
    pub async fn forward<O: ChannelOpener>(
        self: &Arc<Self>,
        tracker: &Arc<Tracker>,
        opener: O,
        addr: &str,
        port: u32,
        owner: u64,
        parent: &CancellationToken,
    ) -> Result<u32, ForwardError> {
        let port16 = u16::try_from(port).map_err(|_| ForwardError::InvalidPort(port))?;
        let listener = TcpListener::bind((bind_host(addr), port16))
            .await
            .map_err(ForwardError::Bind)?;
        let bound = u32::from(listener.local_addr().map_err(ForwardError::Bind)?.port());

        let key = (addr.to_string(), bound);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = parent.child_token();
        let registration = tracker
            .try_track_listener(cancel.clone())
            .ok_or(ForwardError::Closing)?;
        match self.forwards.entry(key.clone()) {
            Slot::Occupied(_) => {
                return Err(ForwardError::AlreadyForwarded(format!("{addr}:{bound}")))
            }
            Slot::Vacant(slot) => {
                slot.insert(Entry {
                    id,
                    owner,
                    cancel: cancel.clone(),
                });
            }
        }
        info!(addr, port = bound, "tcpip-forward listening");

        let forwarder = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = listener.accept() => match res {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(%e, "tcpip-forward accept failed");
                            break;
                        }
                    },
                };
                debug!(%peer, port = bound, "forwarded tcp connection");

                let opener = opener.clone();
                let cancel = cancel.clone();
                let bind_addr = key.0.clone();
                tokio::spawn(async move {
                    match opener
                        .open_forwarded_tcpip(
                            bind_addr,
                            bound,
                            peer.ip().to_string(),
                            u32::from(peer.port()),
                        )
                        .await
                    {
                        Ok(channel) => bicopy(&cancel, stream, channel).await,
                        Err(e) => warn!(%e, "forwarded-tcpip open failed"),
                    }
                });
            }
            forwarder.forwards.remove_if(&key, |_, entry| entry.id == id);
            drop(registration);
            debug!(addr = %key.0, port = bound, "tcpip-forward stopped");
        });

        Ok(bound)
    }

    /// Stop the listener for `addr:port` if `owner` requested it. The accept
    /// loop deregisters it.
    pub fn cancel(&self, addr: &str, port: u32, owner: u64) -> Result<(), ForwardError> {
        let key = (addr.to_string(), port);
        let entry = self
            .forwards
            .get(&key)
            .ok_or_else(|| ForwardError::NotForwarded(format!("{addr}:{port}")))?;
        if entry.owner != owner {
            return Err(ForwardError::NotOwner(format!("{addr}:{port}")));
        }
        entry.cancel.cancel();
        drop(entry);
        info!(addr, port, "tcpip-forward canceled");
        Ok(())
    }

    pub fn is_forwarded(&self, addr: &str, port: u32) -> bool {
        self.forwards.contains_key(&(addr.to_string(), port))
    }
}

/// Serve a `direct-tcpip` channel: dial `host:port` and splice it to the
/// channel until either side closes.
pub async fn direct<S>(cancel: &CancellationToken, host: &str, port: u32, channel: S) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send,
{
    let port = u16::try_from(port)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("port {port} out of range")))?;
    let stream = TcpStream::connect((host, port)).await?;
    debug!(host, port, "direct-tcpip connected");
    bicopy(cancel, stream, channel).await;
    Ok(())
}
