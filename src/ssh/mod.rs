//! SSH protocol surface
//!
//! One [`ConnectionHandler`] per accepted connection. It answers russh's
//! callbacks and hands session channels to [`crate::session`].

mod handler;

pub use handler::ConnectionHandler;
