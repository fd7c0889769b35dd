//! Server configuration
//!
//! [`Config`] is the runtime surface the embedding agent hands to
//! [`Server::new`](crate::Server::new). [`ConfigFile`] is its TOML form, used
//! by the standalone binary.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::x11::{X11_DEFAULT_DISPLAY_OFFSET, X11_DEFAULT_SOCKET_DIR};

/// Environment as ordered `(name, value)` pairs. Later entries win.
pub type Env = Vec<(String, String)>;

/// Rewrites a command's environment just before it is spawned.
pub type EnvUpdater = Arc<dyn Fn(Env) -> Result<Env> + Send + Sync>;

/// An announcement shown to login shells.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Banner {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub message: String,
}

/// Server configuration
#[derive(Clone)]
pub struct Config {
    /// Idle limit. At 3s or more it becomes a keepalive budget instead.
    pub max_timeout: Duration,
    /// Message-of-the-day file, shown to login shells.
    pub motd_file: Arc<dyn Fn() -> Option<PathBuf> + Send + Sync>,
    pub announcement_banners: Arc<dyn Fn() -> Vec<Banner> + Send + Sync>,
    pub update_env: EnvUpdater,
    /// Where commands run. Falls back to the home directory when unset or missing.
    pub working_directory: Arc<dyn Fn() -> Option<PathBuf> + Send + Sync>,
    pub x11_display_offset: u32,
    pub x11_socket_dir: PathBuf,
    /// Refuse scp/rsync/sftp style sessions.
    pub block_file_transfer: bool,
    /// Candidate locations of the SFTP engine binary, tried in order.
    pub sftp_server_paths: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_timeout: Duration::ZERO,
            motd_file: Arc::new(|| None::<PathBuf>),
            announcement_banners: Arc::new(Vec::<Banner>::new),
            update_env: Arc::new(|env: Env| -> Result<Env> { Ok(env) }),
            working_directory: Arc::new(crate::paths::home_dir),
            x11_display_offset: X11_DEFAULT_DISPLAY_OFFSET,
            x11_socket_dir: PathBuf::from(X11_DEFAULT_SOCKET_DIR),
            block_file_transfer: false,
            sftp_server_paths: default_sftp_server_paths(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("max_timeout", &self.max_timeout)
            .field("x11_display_offset", &self.x11_display_offset)
            .field("x11_socket_dir", &self.x11_socket_dir)
            .field("block_file_transfer", &self.block_file_transfer)
            .field("sftp_server_paths", &self.sftp_server_paths)
            .finish_non_exhaustive()
    }
}

fn default_sftp_server_paths() -> Vec<PathBuf> {
    [
        "/usr/lib/openssh/sftp-server",
        "/usr/libexec/openssh/sftp-server",
        "/usr/lib/ssh/sftp-server",
        "/usr/libexec/sftp-server",
    ]
    .into_iter()
    .map(PathBuf::from)
    .collect()
}

fn default_listen_addr() -> String {
    crate::paths::DEFAULT_LISTEN_ADDR.to_string()
}

fn default_x11_display_offset() -> u32 {
    X11_DEFAULT_DISPLAY_OFFSET
}

fn default_x11_socket_dir() -> PathBuf {
    PathBuf::from(X11_DEFAULT_SOCKET_DIR)
}

/// Config file structure
#[derive(Debug, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Seconds; 0 disables the idle limit.
    #[serde(default)]
    pub max_timeout_secs: u64,
    pub motd_file: Option<PathBuf>,
    #[serde(default)]
    pub banners: Vec<Banner>,
    pub working_directory: Option<PathBuf>,
    #[serde(default = "default_x11_display_offset")]
    pub x11_display_offset: u32,
    #[serde(default = "default_x11_socket_dir")]
    pub x11_socket_dir: PathBuf,
    #[serde(default)]
    pub block_file_transfer: bool,
    #[serde(default = "default_sftp_server_paths")]
    pub sftp_server_paths: Vec<PathBuf>,
    /// Extra variables set on every command, overriding inherited ones.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_timeout_secs: 0,
            motd_file: None,
            banners: vec![],
            working_directory: None,
            x11_display_offset: default_x11_display_offset(),
            x11_socket_dir: default_x11_socket_dir(),
            block_file_transfer: false,
            sftp_server_paths: default_sftp_server_paths(),
            env: BTreeMap::new(),
        }
    }
}

impl ConfigFile {
    /// Load config from a TOML file. A missing file yields defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!("config not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        let config: ConfigFile = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        tracing::info!(
            block_file_transfer = config.block_file_transfer,
            "loaded config from {}",
            path.display()
        );

        Ok(config)
    }

    /// Turn the file form into the runtime form.
    pub fn into_config(self) -> Config {
        let motd = self.motd_file;
        let banners = self.banners;
        let extra: Env = self.env.into_iter().collect();
        let working_directory: Arc<dyn Fn() -> Option<PathBuf> + Send + Sync> =
            match self.working_directory {
                Some(dir) => Arc::new(move || Some(dir.clone())),
                None => Arc::new(crate::paths::home_dir),
            };

        Config {
            max_timeout: Duration::from_secs(self.max_timeout_secs),
            motd_file: Arc::new(move || motd.clone()),
            announcement_banners: Arc::new(move || banners.clone()),
            update_env: Arc::new(move |mut env: Env| -> Result<Env> {
                for (name, value) in &extra {
                    env.retain(|(n, _)| n != name);
                    env.push((name.clone(), value.clone()));
                }
                Ok(env)
            }),
            working_directory,
            x11_display_offset: self.x11_display_offset,
            x11_socket_dir: self.x11_socket_dir,
            block_file_transfer: self.block_file_transfer,
            sftp_server_paths: self.sftp_server_paths,
        }
    }
}
