//! Testing utilities for agentssh
//!
//! Provides an SSH test client for automated testing against the agentssh server.

mod ssh_client;

pub use ssh_client::{ExecOutput, SshTestClient};
