//! OpenTelemetry counters for the SSH server
//!
//! Recorded through the global meter; nothing is exported unless the
//! embedding process installs a meter provider.

use std::sync::OnceLock;

use opentelemetry::metrics::Counter;
use opentelemetry::KeyValue;

const METER: &str = "agentssh";

fn sessions_total() -> Counter<u64> {
    static COUNTER: OnceLock<Counter<u64>> = OnceLock::new();
    COUNTER
        .get_or_init(|| {
            opentelemetry::global::meter(METER)
                .u64_counter("agentssh.sessions.total")
                .with_description("Total number of SSH sessions started")
                .build()
        })
        .clone()
}

fn session_errors() -> Counter<u64> {
    static COUNTER: OnceLock<Counter<u64>> = OnceLock::new();
    COUNTER
        .get_or_init(|| {
            opentelemetry::global::meter(METER)
                .u64_counter("agentssh.session.errors")
                .with_description("Errors encountered while running SSH sessions")
                .build()
        })
        .clone()
}

fn sftp_connections_total() -> Counter<u64> {
    static COUNTER: OnceLock<Counter<u64>> = OnceLock::new();
    COUNTER
        .get_or_init(|| {
            opentelemetry::global::meter(METER)
                .u64_counter("agentssh.sftp.connections.total")
                .with_description("Total number of SFTP sessions")
                .build()
        })
        .clone()
}

fn sftp_server_errors() -> Counter<u64> {
    static COUNTER: OnceLock<Counter<u64>> = OnceLock::new();
    COUNTER
        .get_or_init(|| {
            opentelemetry::global::meter(METER)
                .u64_counter("agentssh.sftp.server.errors")
                .with_description("SFTP sessions that ended with an error")
                .build()
        })
        .clone()
}

fn failed_connections_total() -> Counter<u64> {
    static COUNTER: OnceLock<Counter<u64>> = OnceLock::new();
    COUNTER
        .get_or_init(|| {
            opentelemetry::global::meter(METER)
                .u64_counter("agentssh.connections.failed")
                .with_description("Connections that failed the SSH handshake")
                .build()
        })
        .clone()
}

fn pty_label(pty: bool) -> &'static str {
    if pty {
        "yes"
    } else {
        "no"
    }
}

pub fn record_session(magic_type: &'static str, pty: bool) {
    sessions_total().add(
        1,
        &[
            KeyValue::new("magic_type", magic_type),
            KeyValue::new("pty", pty_label(pty)),
        ],
    );
}

pub fn record_session_error(magic_type: &'static str, pty: bool, error: &'static str) {
    session_errors().add(
        1,
        &[
            KeyValue::new("magic_type", magic_type),
            KeyValue::new("pty", pty_label(pty)),
            KeyValue::new("error", error),
        ],
    );
}

pub fn record_sftp_connection() {
    sftp_connections_total().add(1, &[]);
}

pub fn record_sftp_error() {
    sftp_server_errors().add(1, &[]);
}

pub fn record_failed_connection() {
    failed_connections_total().add(1, &[]);
}
