//! agentssh - the embedded SSH server of a workspace agent
//!
//! Every client is trusted: authentication always succeeds. The server runs
//! commands as the agent's own user, with or without a pseudo-terminal, and
//! relays TCP, Unix socket, X11 and agent traffic for the client.
//! The standalone binary is in `main.rs`.

#[cfg(unix)]
pub mod agent;
pub mod bicopy;
pub mod command;
pub mod config;
pub mod forward;
pub mod jetbrains;
pub mod metrics;
pub mod paths;
pub mod process;
#[cfg(unix)]
pub mod pty;
pub mod runner;
pub mod server;
pub mod session;
pub mod ssh;
#[cfg(feature = "testing")]
pub mod testing;
pub mod tracker;
pub mod x11;

pub use config::{Config, ConfigFile};
pub use server::{ConnStats, Listener, Server, ServerError};
