//! Centralized path resolution for agentssh
//!
//! Follows XDG Base Directory Specification with 12-factor env var overrides.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `AGENTSSH_CONFIG` | Config file path | `~/.config/agentssh/config.toml` |
//! | `AGENTSSH_LISTEN` | Listen address | `127.0.0.1:2222` |

use std::path::PathBuf;

use tracing::info;

/// Default SSH listen address for the standalone binary.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:2222";

/// Home directory of the current user.
///
/// Priority: `HOME` > the user database entry.
pub fn home_dir() -> Option<PathBuf> {
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return Some(PathBuf::from(home));
        }
    }
    dirs::home_dir()
}

/// Get the XDG config directory for agentssh
///
/// Priority: `XDG_CONFIG_HOME` > `~/.config`
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("agentssh");
    }

    if let Some(home) = home_dir() {
        return home.join(".config/agentssh");
    }

    PathBuf::from(".")
}

/// Get the config file path
///
/// Priority: `AGENTSSH_CONFIG` env var > `config_dir()/config.toml`
pub fn config_path() -> PathBuf {
    std::env::var("AGENTSSH_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| config_dir().join("config.toml"))
}

/// Listen address override, if any.
pub fn listen_addr_override() -> Option<String> {
    std::env::var("AGENTSSH_LISTEN").ok().filter(|s| !s.is_empty())
}

/// The Xauthority file X11 clients read credentials from.
pub fn xauthority_path() -> Option<PathBuf> {
    home_dir().map(|home| home.join(".Xauthority"))
}

/// Log resolved paths for discoverability
pub fn log_paths() {
    info!("config directory: {}", config_dir().display());
    info!("config file: {}", config_path().display());
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Serializes every test in the crate that touches process env vars.
    pub(crate) static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_path_env_vars() {
        env::remove_var("AGENTSSH_CONFIG");
        env::remove_var("AGENTSSH_LISTEN");
        env::remove_var("XDG_CONFIG_HOME");
    }

    #[test]
    fn test_env_var_override_config() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_path_env_vars();
        env::set_var("AGENTSSH_CONFIG", "/custom/agentssh.toml");
        assert_eq!(config_path(), PathBuf::from("/custom/agentssh.toml"));
        clear_path_env_vars();
    }

    #[test]
    fn test_xdg_config_home_override() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_path_env_vars();
        env::set_var("XDG_CONFIG_HOME", "/xdg/config");
        assert_eq!(config_dir(), PathBuf::from("/xdg/config/agentssh"));
        assert_eq!(
            config_path(),
            PathBuf::from("/xdg/config/agentssh/config.toml")
        );
        clear_path_env_vars();
    }

    #[test]
    fn test_listen_override_ignores_empty() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_path_env_vars();
        env::set_var("AGENTSSH_LISTEN", "");
        assert_eq!(listen_addr_override(), None);
        env::set_var("AGENTSSH_LISTEN", "0.0.0.0:22");
        assert_eq!(listen_addr_override().as_deref(), Some("0.0.0.0:22"));
        clear_path_env_vars();
    }
}
