//! Process-group control for session commands.
//!
//! Exactly one platform implementation is compiled in. Callers never branch
//! on the target themselves.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use russh::Sig;
use tokio::process::{Child, Command};
use tracing::debug;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use self::unix as imp;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use self::windows as imp;

/// How long a terminated process gets to exit before it is killed outright.
pub const KILL_GRACE: Duration = Duration::from_secs(3);

/// Start the command in its own process group so it can be torn down as a unit.
pub fn set_new_group(cmd: &mut Command) {
    imp::set_new_group(cmd);
}

/// Ask the process group to stop, then kill it if it is still around after
/// [`KILL_GRACE`]. Returns the reaped exit status.
pub async fn terminate(child: &mut Child) -> io::Result<ExitStatus> {
    if let Err(err) = imp::interrupt(child) {
        debug!(%err, "interrupting process group failed");
    }
    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            debug!("process ignored interrupt, killing");
            child.start_kill()?;
            child.wait().await
        }
    }
}

/// Deliver an SSH signal to the process with the given id.
///
/// Signals the platform cannot express are reported as `Unsupported`.
pub fn signal(pid: Option<u32>, sig: &Sig) -> io::Result<()> {
    let Some(pid) = pid else {
        return Err(io::Error::new(io::ErrorKind::NotFound, "process already exited"));
    };
    imp::signal(pid, sig)
}

/// Short name of an SSH signal, as it appears on the wire.
pub fn sig_name(sig: &Sig) -> &str {
    match sig {
        Sig::ABRT => "ABRT",
        Sig::ALRM => "ALRM",
        Sig::FPE => "FPE",
        Sig::HUP => "HUP",
        Sig::ILL => "ILL",
        Sig::INT => "INT",
        Sig::KILL => "KILL",
        Sig::PIPE => "PIPE",
        Sig::QUIT => "QUIT",
        Sig::SEGV => "SEGV",
        Sig::TERM => "TERM",
        Sig::USR1 => "USR1",
        Sig::Custom(name) => name.as_str(),
    }
}
