//! Pseudo-terminal allocation for interactive sessions

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{openpty, Winsize};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::Child;
use tracing::debug;

use crate::command::Command;

/// Terminal dimensions as negotiated over SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
    pub pix_width: u16,
    pub pix_height: u16,
}

impl WindowSize {
    /// Clamp protocol-sized values into what the kernel accepts.
    pub fn from_ssh(cols: u32, rows: u32, pix_width: u32, pix_height: u32) -> Self {
        let clamp = |v: u32| u16::try_from(v).unwrap_or(u16::MAX);
        Self {
            cols: clamp(cols),
            rows: clamp(rows),
            pix_width: clamp(pix_width),
            pix_height: clamp(pix_height),
        }
    }

    fn to_winsize(self) -> Winsize {
        Winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: self.pix_width,
            ws_ypixel: self.pix_height,
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self {
            cols: 80,
            rows: 24,
            pix_width: 0,
            pix_height: 0,
        }
    }
}

/// Master side of a PTY. Clones share the same descriptor.
#[derive(Clone)]
pub struct PtyMaster {
    fd: Arc<AsyncFd<File>>,
}

impl PtyMaster {
    pub fn resize(&self, size: WindowSize) -> io::Result<()> {
        let ws = size.to_winsize();
        // SAFETY: the descriptor is a live PTY master owned by `self.fd`.
        let rc = unsafe { libc::ioctl(self.fd.get_ref().as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        debug!(cols = size.cols, rows = size.rows, "pty resized");
        Ok(())
    }
}

impl AsyncRead for PtyMaster {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.read(unfilled)
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                // The slave side is gone: the command exited. Treat as EOF.
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => {
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for PtyMaster {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.fd.poll_write_ready(cx))?;
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.write(data)
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Start `cmd` as the session leader of a fresh PTY sized to `size`.
///
/// The child's process group is its own session, so
/// [`process::terminate`](crate::process::terminate) reaches everything it spawned.
pub fn spawn(cmd: &Command, size: WindowSize) -> io::Result<(PtyMaster, Child)> {
    let ws = size.to_winsize();
    let pty = openpty(Some(&ws), None).map_err(io::Error::from)?;
    set_nonblocking(&pty.master)?;

    let mut command = cmd.to_tokio();
    command
        .stdin(Stdio::from(pty.slave.try_clone()?))
        .stdout(Stdio::from(pty.slave.try_clone()?))
        .stderr(Stdio::from(pty.slave.try_clone()?))
        .kill_on_drop(true);

    // SAFETY: only async-signal-safe calls between fork and exec.
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            // TIOCSCTTY request type varies by platform (c_ulong on glibc/macOS, c_int on musl)
            if libc::ioctl(0, libc::TIOCSCTTY as _, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn()?;
    // Our copies of the slave must go, or reads on the master never see EIO.
    drop(command);
    drop(pty.slave);

    let master = AsyncFd::new(File::from(pty.master))?;
    Ok((PtyMaster { fd: Arc::new(master) }, child))
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = OFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFL)?);
    fcntl(raw, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn sh(script: &str) -> Command {
        Command {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            env: vec![("PATH".into(), "/usr/bin:/bin".into())],
            working_dir: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn output_drains_to_eof_after_exit() {
        let (mut master, mut child) = spawn(&sh("echo from-the-tty"), WindowSize::default()).unwrap();
        let mut out = Vec::new();
        master.read_to_end(&mut out).await.unwrap();
        assert!(String::from_utf8_lossy(&out).contains("from-the-tty"));
        assert!(child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn initial_size_is_visible_to_the_command() {
        let size = WindowSize {
            cols: 132,
            rows: 43,
            ..WindowSize::default()
        };
        let (mut master, mut child) = spawn(&sh("stty size"), size).unwrap();
        let mut out = Vec::new();
        master.read_to_end(&mut out).await.unwrap();
        assert!(String::from_utf8_lossy(&out).contains("43 132"));
        child.wait().await.unwrap();
    }

    #[test]
    fn oversized_dimensions_are_clamped() {
        let size = WindowSize::from_ssh(100_000, 50, 0, 0);
        assert_eq!(size.cols, u16::MAX);
        assert_eq!(size.rows, 50);
    }
}
