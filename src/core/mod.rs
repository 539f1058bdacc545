//! Transport foundation shared by every node connection.
//!
//! ## Modules
//!
//! - [`connection`] - RESP-framed stream
//! - [`multiplexed`] - Multiplexed connection for concurrent requests
//! - [`command`] - Command builders and reply converters

pub use crate::proto::error::{Error, Result};

/// Command construction helpers.
pub mod command;
/// Low-level connection management.
pub mod connection;
/// Multiplexing logic.
pub mod multiplexed;

cfg_if::cfg_if! {
    if #[cfg(feature = "tls")] {
        mod tls;
        pub use tls::TlsConnectorInner;
    }
}
