//! dap-probe: drive Debug Adapter Protocol adapters through their startup
//! handshake and record exactly what crossed the wire.

pub mod config;
pub mod dap;
pub mod io;
pub mod logging;

#[cfg(test)]
mod test_utils;

pub use config::{ConfigError, HandshakeTimeouts, SessionConfig, SessionConfigBuilder};
pub use dap::{Session, SessionError};
