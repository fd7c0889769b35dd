//! Command resolution
//!
//! Turns the raw command string of an SSH session into a concrete program
//! invocation, the way OpenSSH runs everything through the user's shell.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::{Config, Env};

#[cfg(windows)]
const SHELL_CALLER: &str = "/c";
#[cfg(not(windows))]
const SHELL_CALLER: &str = "-c";

/// Errors from resolving a command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("get current user: {0}")]
    CurrentUser(String),
    #[error("get user shell: {0}")]
    UserShell(String),
    #[error("get home dir: {0}")]
    HomeDir(String),
    #[error("split shebang: {0}")]
    Shebang(#[from] shell_words::ParseError),
    #[error("shebang names no interpreter")]
    EmptyShebang,
    #[error("apply env: {0:#}")]
    UpdateEnv(anyhow::Error),
}

/// Host facts a command is built from. Swap it out to build commands for
/// another environment, such as a container.
pub trait CommandDeps: Send + Sync {
    fn current_user(&self) -> Result<String, CommandError>;
    /// Environment of the current process.
    fn environ(&self) -> Env;
    fn home_dir(&self) -> Result<PathBuf, CommandError>;
    fn user_shell(&self, username: &str) -> Result<String, CommandError>;
}

/// [`CommandDeps`] backed by the running host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDeps;

impl CommandDeps for SystemDeps {
    fn current_user(&self) -> Result<String, CommandError> {
        whoami::fallible::username().map_err(|e| CommandError::CurrentUser(e.to_string()))
    }

    fn environ(&self) -> Env {
        std::env::vars().collect()
    }

    fn home_dir(&self) -> Result<PathBuf, CommandError> {
        crate::paths::home_dir()
            .ok_or_else(|| CommandError::HomeDir("no home directory for current user".into()))
    }

    #[cfg(unix)]
    fn user_shell(&self, username: &str) -> Result<String, CommandError> {
        match nix::unistd::User::from_name(username) {
            Ok(Some(user)) => Ok(user.shell.to_string_lossy().into_owned()),
            Ok(None) => std::env::var("SHELL").map_err(|_| {
                CommandError::UserShell(format!("user {username} not found and SHELL unset"))
            }),
            Err(errno) => Err(CommandError::UserShell(errno.to_string())),
        }
    }

    #[cfg(windows)]
    fn user_shell(&self, _username: &str) -> Result<String, CommandError> {
        Ok(std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string()))
    }
}

/// A resolved invocation. Built once, then only read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
    pub env: Env,
    pub working_dir: PathBuf,
}

impl Command {
    /// A process builder with exactly this command's environment.
    pub fn to_tokio(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.working_dir)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k, v)));
        cmd
    }

    /// Last value of `name` in the environment, if set.
    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// An empty raw command means the client asked for a login shell.
pub fn is_login_shell(raw_command: &str) -> bool {
    raw_command.is_empty()
}

/// Resolve `script` into a [`Command`].
///
/// `env` is the session's own environment; it lands after the process
/// environment and before the injected `USER`/`SSH_*` variables.
pub fn build(
    config: &Config,
    script: &str,
    env: Env,
    deps: &dyn CommandDeps,
) -> Result<Command, CommandError> {
    let username = deps.current_user()?;
    let shell = deps.user_shell(&username)?;

    let mut program = shell;
    let mut args = vec![SHELL_CALLER.to_string(), script.to_string()];

    let trimmed = script.trim();
    if let Some(rest) = trimmed.strip_prefix("#!") {
        let line = rest.lines().next().unwrap_or_default().trim();
        let mut words = shell_words::split(line)?.into_iter();
        program = words.next().ok_or(CommandError::EmptyShebang)?;
        args = words.collect();
        args.push(SHELL_CALLER.to_string());
        args.push(script.to_string());
    }

    if is_login_shell(script) {
        args.clear();
        if cfg!(not(windows)) {
            args.push("-l".to_string());
        }
    }

    let working_dir = match (config.working_directory)() {
        Some(dir) if is_dir(&dir) => dir,
        _ => deps.home_dir()?,
    };

    let mut full_env = deps.environ();
    full_env.extend(env);
    full_env.push(("USER".into(), username));
    // There is no real peer address to report; these exist because clients expect them.
    full_env.push(("SSH_CLIENT".into(), "0.0.0.0 0 0".into()));
    full_env.push(("SSH_CONNECTION".into(), "0.0.0.0 0 0.0.0.0 0".into()));
    let full_env = (config.update_env)(full_env).map_err(CommandError::UpdateEnv)?;

    Ok(Command {
        program,
        args,
        env: full_env,
        working_dir,
    })
}

fn is_dir(path: &Path) -> bool {
    !path.as_os_str().is_empty() && std::fs::metadata(path).is_ok()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    pub(crate) struct FakeDeps {
        pub home: PathBuf,
        pub shell: String,
        pub fail_user: bool,
    }

    impl FakeDeps {
        pub(crate) fn new(home: &Path) -> Self {
            Self {
                home: home.to_path_buf(),
                shell: "/bin/sh".into(),
                fail_user: false,
            }
        }
    }

    impl CommandDeps for FakeDeps {
        fn current_user(&self) -> Result<String, CommandError> {
            if self.fail_user {
                return Err(CommandError::CurrentUser("no passwd entry".into()));
            }
            Ok("coder".into())
        }

        fn environ(&self) -> Env {
            vec![("PATH".into(), "/usr/bin:/bin".into())]
        }

        fn home_dir(&self) -> Result<PathBuf, CommandError> {
            Ok(self.home.clone())
        }

        fn user_shell(&self, _username: &str) -> Result<String, CommandError> {
            Ok(self.shell.clone())
        }
    }

    #[test]
    fn script_runs_through_the_user_shell() {
        let home = tempfile::tempdir().unwrap();
        let cmd = build(
            &Config::default(),
            "echo hi",
            vec![],
            &FakeDeps::new(home.path()),
        )
        .unwrap();
        assert_eq!(cmd.program, "/bin/sh");
        assert_eq!(cmd.args, vec!["-c", "echo hi"]);
    }

    #[test]
    fn shebang_picks_the_interpreter() {
        let home = tempfile::tempdir().unwrap();
        let script = "  #!/usr/bin/env python3 -u\nprint('hi')\n";
        let cmd = build(&Config::default(), script, vec![], &FakeDeps::new(home.path())).unwrap();
        assert_eq!(cmd.program, "/usr/bin/env");
        assert_eq!(cmd.args, vec!["python3", "-u", "-c", script]);
    }

    #[test]
    fn quoted_shebang_arguments_stay_together() {
        let home = tempfile::tempdir().unwrap();
        let script = "#!/bin/bash -o 'pipefail'\ntrue";
        let cmd = build(&Config::default(), script, vec![], &FakeDeps::new(home.path())).unwrap();
        assert_eq!(cmd.program, "/bin/bash");
        assert_eq!(cmd.args, vec!["-o", "pipefail", "-c", script]);
    }

    #[test]
    fn empty_script_is_a_login_shell() {
        let home = tempfile::tempdir().unwrap();
        let cmd = build(&Config::default(), "", vec![], &FakeDeps::new(home.path())).unwrap();
        assert_eq!(cmd.program, "/bin/sh");
        assert_eq!(cmd.args, vec!["-l"]);
    }

    #[test]
    fn injected_env_follows_session_env() {
        let home = tempfile::tempdir().unwrap();
        let cmd = build(
            &Config::default(),
            "true",
            vec![("LANG".into(), "C".into())],
            &FakeDeps::new(home.path()),
        )
        .unwrap();
        let names: Vec<&str> = cmd.env.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            names,
            vec!["PATH", "LANG", "USER", "SSH_CLIENT", "SSH_CONNECTION"]
        );
        assert_eq!(cmd.env_var("USER"), Some("coder"));
        assert_eq!(cmd.env_var("SSH_CLIENT"), Some("0.0.0.0 0 0"));
        assert_eq!(cmd.env_var("SSH_CONNECTION"), Some("0.0.0.0 0 0.0.0.0 0"));
    }

    #[test]
    fn update_hook_sees_the_final_env() {
        let home = tempfile::tempdir().unwrap();
        let config = Config {
            update_env: Arc::new(|mut env: Env| -> anyhow::Result<Env> {
                env.retain(|(k, _)| k != "PATH");
                env.push(("HOOKED".into(), "1".into()));
                Ok(env)
            }),
            ..Config::default()
        };
        let cmd = build(&config, "true", vec![], &FakeDeps::new(home.path())).unwrap();
        assert_eq!(cmd.env_var("PATH"), None);
        assert_eq!(cmd.env_var("HOOKED"), Some("1"));
    }

    #[test]
    fn update_hook_failure_is_reported() {
        let home = tempfile::tempdir().unwrap();
        let config = Config {
            update_env: Arc::new(|_env: Env| -> anyhow::Result<Env> {
                anyhow::bail!("no env for you")
            }),
            ..Config::default()
        };
        let err = build(&config, "true", vec![], &FakeDeps::new(home.path())).unwrap_err();
        assert!(matches!(err, CommandError::UpdateEnv(_)));
    }

    #[test]
    fn missing_working_directory_falls_back_to_home() {
        let home = tempfile::tempdir().unwrap();
        let config = Config {
            working_directory: Arc::new(|| Some(PathBuf::from("/definitely/not/here"))),
            ..Config::default()
        };
        let cmd = build(&config, "true", vec![], &FakeDeps::new(home.path())).unwrap();
        assert_eq!(cmd.working_dir, home.path());

        let work = tempfile::tempdir().unwrap();
        let work_path = work.path().to_path_buf();
        let config = Config {
            working_directory: Arc::new(move || Some(work_path.clone())),
            ..Config::default()
        };
        let cmd = build(&config, "true", vec![], &FakeDeps::new(home.path())).unwrap();
        assert_eq!(cmd.working_dir, work.path());
    }

    #[test]
    fn unknown_user_fails_resolution() {
        let home = tempfile::tempdir().unwrap();
        let mut deps = FakeDeps::new(home.path());
        deps.fail_user = true;
        let err = build(&Config::default(), "true", vec![], &deps).unwrap_err();
        assert!(matches!(err, CommandError::CurrentUser(_)));
    }
}
