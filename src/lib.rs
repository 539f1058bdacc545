//! # Slotmux
//!
//! Cluster-aware Redis client with slot routing, redirect handling and
//! multiplexed node connections.
//!
//! ## Features
//!
//! - `cluster` (default) - cluster client, slot hashing and routing
//! - `tls` - TLS for node connections
//!
//! ## Example
//!
//! ```no_run
//! use slotmux::ClusterClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ClusterClient::connect("127.0.0.1:7000,127.0.0.1:7001").await?;
//!     assert!(client.ping("any-key").await?);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod core;
pub mod proto;

#[cfg(feature = "cluster")]
pub mod cluster;

pub use crate::proto::error::{Error, Result};
pub use crate::proto::frame::Frame;

#[cfg(feature = "cluster")]
pub use crate::cluster::{
    key_slot, slot_for_keys, ClusterBuilder, ClusterClient, NodeStatus, SlotMap, SLOT_COUNT,
};
