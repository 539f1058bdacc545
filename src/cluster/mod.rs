//! Redis Cluster support: slot hashing, topology discovery, and routing.
//!
//! ## Example
//!
//! ```no_run
//! # async fn example() -> slotmux::Result<()> {
//! use bytes::Bytes;
//! use slotmux::ClusterClient;
//!
//! // Comma-separated seed nodes; the rest of the cluster is discovered.
//! let client = ClusterClient::connect("127.0.0.1:7000,127.0.0.1:7001").await?;
//!
//! client.set("key", Bytes::from("value")).await?;
//! let value = client.get("key").await?;
//!
//! // Node-scoped commands take a routing hint: a key or a node address.
//! let keys_on_node = client.dbsize("key").await?;
//! # Ok(())
//! # }
//! ```

mod builder;
mod client;
pub mod commands;
mod errors;
mod loader;
mod registry;
mod router;
mod slot;
mod topology;

pub use builder::ClusterBuilder;
pub use client::ClusterClient;
pub use errors::parse_redis_error;
pub use registry::NodeStatus;
pub use slot::{key_slot, slot_for_keys, SLOT_COUNT};
pub use topology::{Node, NodeRecord, NodeRole, SlotMap, SlotRange, SlotRecord};
