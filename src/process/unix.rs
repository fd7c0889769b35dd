use std::io;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use russh::Sig;
use tokio::process::{Child, Command};

pub(super) fn set_new_group(cmd: &mut Command) {
    cmd.process_group(0);
}

/// SIGHUP the whole group, the same thing a closing terminal does.
pub(super) fn interrupt(child: &Child) -> io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    match signal::killpg(Pid::from_raw(pid as i32), Signal::SIGHUP) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(errno.into()),
    }
}

pub(super) fn signal(pid: u32, sig: &Sig) -> io::Result<()> {
    let os = to_os_signal(sig).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unsupported signal {}", super::sig_name(sig)),
        )
    })?;
    signal::kill(Pid::from_raw(pid as i32), os).map_err(io::Error::from)
}

fn to_os_signal(sig: &Sig) -> Option<Signal> {
    Some(match sig {
        Sig::ABRT => Signal::SIGABRT,
        Sig::ALRM => Signal::SIGALRM,
        Sig::FPE => Signal::SIGFPE,
        Sig::HUP => Signal::SIGHUP,
        Sig::ILL => Signal::SIGILL,
        Sig::INT => Signal::SIGINT,
        Sig::KILL => Signal::SIGKILL,
        Sig::PIPE => Signal::SIGPIPE,
        Sig::QUIT => Signal::SIGQUIT,
        Sig::SEGV => Signal::SIGSEGV,
        Sig::TERM => Signal::SIGTERM,
        Sig::USR1 => Signal::SIGUSR1,
        Sig::Custom(_) => return None,
    })
}
