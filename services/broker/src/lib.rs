//! gmessage broker service library crate.
//!
//! # Purpose
//! Exposes the broker's subsystems (config, auth, per-connection dispatch and
//! the TCP server loop) to the `gmsg-broker` binary and to integration tests.
//!
//! # Key invariants
//! - Permission and subject errors are reported with `-ERR` and leave the
//!   client link open. Protocol errors close it.
//! - A client keeps the permissions it authenticated with across user reloads.
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod server;

pub use config::BrokerConfig;
pub use server::ServerHandle;
