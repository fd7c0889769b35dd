use std::io;

use russh::Sig;
use tokio::process::{Child, Command};

const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

pub(super) fn set_new_group(cmd: &mut Command) {
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

/// There is no console interrupt for a detached group, so this kills.
pub(super) fn interrupt(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}

pub(super) fn signal(pid: u32, sig: &Sig) -> io::Result<()> {
    match sig {
        Sig::INT | Sig::KILL | Sig::TERM => {
            let status = std::process::Command::new("taskkill")
                .args(["/F", "/T", "/PID", &pid.to_string()])
                .status()?;
            if status.success() {
                Ok(())
            } else {
                Err(io::Error::other(format!("taskkill exited with {status}")))
            }
        }
        other => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unsupported signal {}", super::sig_name(other)),
        )),
    }
}
