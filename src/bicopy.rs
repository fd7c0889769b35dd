//! Bidirectional stream splice
//!
//! Every forwarding path (direct-tcpip, streamlocal, X11, agent) relays its
//! channel through [`bicopy`].

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Copy `a` to `b` and `b` to `a` until either side finishes.
///
/// When one direction hits EOF or an error, or `cancel` fires, both streams
/// are shut down and both copies stop. Errors are not reported; callers that
/// need them inspect their own ends.
pub async fn bicopy<A, B>(cancel: &CancellationToken, a: A, b: B)
where
    A: AsyncRead + AsyncWrite + Send,
    B: AsyncRead + AsyncWrite + Send,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    {
        let a_to_b = tokio::io::copy(&mut a_read, &mut b_write);
        let b_to_a = tokio::io::copy(&mut b_read, &mut a_write);

        tokio::select! {
            res = a_to_b => debug!(?res, "bicopy: a->b finished"),
            res = b_to_a => debug!(?res, "bicopy: b->a finished"),
            _ = cancel.cancelled() => debug!("bicopy: canceled"),
        }
    }

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;
}
