//! Redis Cluster client.
//!
//! Key-scoped commands are routed by the slot of their (prefixed) keys.
//! Node-scoped commands (PING, ECHO, RANDOMKEY, DBSIZE, FLUSHDB, INFO) take
//! a routing hint instead: a node address from the slot map, or a key whose
//! owner should answer.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;

use super::builder::{split_seeds, ClusterBuilder};
use super::registry::NodeStatus;
use super::router::Router;
use super::slot::slot_for_keys;
use super::topology::SlotMap;
use crate::core::command::{self, Cmd};
use crate::proto::frame::Frame;
use crate::Result;

/// Redis Cluster client.
///
/// Cheap to clone; clones share the slot map and node connections.
///
/// # Example
///
/// ```no_run
/// use bytes::Bytes;
/// use slotmux::ClusterClient;
///
/// # #[tokio::main]
/// # async fn main() -> slotmux::Result<()> {
/// let client = ClusterClient::connect("127.0.0.1:7000,127.0.0.1:7001").await?;
/// client.set("{user:1}:name", Bytes::from("ada")).await?;
/// let name = client.get("{user:1}:name").await?;
/// assert!(client.ping("{user:1}:name").await?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ClusterClient {
    router: Arc<Router>,
    prefix: Arc<RwLock<Option<Bytes>>>,
}

impl ClusterClient {
    pub(crate) fn new(router: Router, prefix: Option<String>) -> Self {
        Self {
            router: Arc::new(router),
            prefix: Arc::new(RwLock::new(prefix.map(Bytes::from))),
        }
    }

    /// Connects using a comma-separated seed list and default settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TopologyUnavailable`](crate::Error::TopologyUnavailable)
    /// if no seed answers `CLUSTER SLOTS` with a usable map.
    pub async fn connect(addresses: &str) -> Result<Self> {
        ClusterBuilder::new()
            .seeds(split_seeds(addresses))
            .build()
            .await
    }

    /// Returns a builder for custom settings.
    pub fn builder() -> ClusterBuilder {
        ClusterBuilder::new()
    }

    /// Sets or clears the key prefix at runtime.
    pub fn set_prefix(&self, prefix: Option<&str>) {
        *self.prefix.write() = prefix.map(|p| Bytes::copy_from_slice(p.as_bytes()));
    }

    /// Current key prefix.
    pub fn prefix(&self) -> Option<Bytes> {
        self.prefix.read().clone()
    }

    fn key(&self, key: &str) -> Bytes {
        match self.prefix.read().as_ref() {
            Some(prefix) => {
                let mut buf = BytesMut::with_capacity(prefix.len() + key.len());
                buf.extend_from_slice(prefix);
                buf.extend_from_slice(key.as_bytes());
                buf.freeze()
            }
            None => Bytes::copy_from_slice(key.as_bytes()),
        }
    }

    fn keys(&self, keys: &[&str]) -> Vec<Bytes> {
        keys.iter().map(|k| self.key(k)).collect()
    }

    async fn route(&self, cmd: Cmd, keys: &[Bytes], read_only: bool) -> Result<Frame> {
        let slot = slot_for_keys(keys)?;
        self.router.dispatch(cmd.into_frame(), slot, read_only).await
    }

    async fn route_scoped(&self, cmd: Cmd, hint: &str) -> Result<Frame> {
        let key = self.key(hint);
        self.router
            .dispatch_scoped(cmd.into_frame(), hint, &key)
            .await
    }

    /// Sends an arbitrary key-scoped command.
    ///
    /// The frame is `command`, then the prefixed `keys`, then `args`. All
    /// keys must hash to one slot.
    ///
    /// # Errors
    ///
    /// - [`Error::CrossSlot`](crate::Error::CrossSlot) before anything is sent
    ///   if the keys span slots
    /// - [`Error::Server`](crate::Error::Server) for error replies
    pub async fn dispatch(&self, command: &str, keys: &[&str], args: &[Bytes]) -> Result<Frame> {
        let keys = self.keys(keys);
        let cmd = Cmd::new(Bytes::copy_from_slice(command.as_bytes()))
            .args(keys.iter().cloned())
            .args(args.iter().cloned());
        self.route(cmd, &keys, false).await
    }

    /// Sends an arbitrary node-scoped command, routed by `hint`.
    pub async fn dispatch_scoped(&self, command: &str, hint: &str, args: &[Bytes]) -> Result<Frame> {
        let cmd = Cmd::new(Bytes::copy_from_slice(command.as_bytes())).args(args.iter().cloned());
        self.route_scoped(cmd, hint).await
    }

    /// Gets the value of a key.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let key = self.key(key);
        let frame = self
            .route(command::get(key.clone()), &[key], true)
            .await?;
        command::frame_to_bytes(frame)
    }

    /// Sets a key.
    pub async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        let key = self.key(key);
        let frame = self
            .route(command::set(key.clone(), value), &[key], false)
            .await?;
        command::frame_to_ok(frame).map(|_| ())
    }

    /// Sets a key that expires after `expiry` (whole seconds, at least one).
    pub async fn set_with_expiry(&self, key: &str, value: Bytes, expiry: Duration) -> Result<()> {
        let key = self.key(key);
        let cmd = command::set_with_expiry(key.clone(), value, expiry);
        let frame = self.route(cmd, &[key], false).await?;
        command::frame_to_ok(frame).map(|_| ())
    }

    /// Deletes keys sharing one slot. Returns how many existed.
    pub async fn del(&self, keys: &[&str]) -> Result<i64> {
        let keys = self.keys(keys);
        let frame = self
            .route(command::del(keys.iter().cloned()), &keys, false)
            .await?;
        command::frame_to_int(frame)
    }

    /// Returns true if the key exists.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let key = self.key(key);
        let frame = self
            .route(command::exists([key.clone()]), &[key], true)
            .await?;
        command::frame_to_bool(frame)
    }

    /// Increments an integer key by one.
    pub async fn incr(&self, key: &str) -> Result<i64> {
        self.incr_by(key, 1).await
    }

    /// Increments an integer key by `amount`.
    pub async fn incr_by(&self, key: &str, amount: i64) -> Result<i64> {
        let key = self.key(key);
        let frame = self
            .route(command::incr_by(key.clone(), amount), &[key], false)
            .await?;
        command::frame_to_int(frame)
    }

    /// Decrements an integer key by one.
    pub async fn decr(&self, key: &str) -> Result<i64> {
        self.decr_by(key, 1).await
    }

    /// Decrements an integer key by `amount`.
    pub async fn decr_by(&self, key: &str, amount: i64) -> Result<i64> {
        let key = self.key(key);
        let frame = self
            .route(command::decr_by(key.clone(), amount), &[key], false)
            .await?;
        command::frame_to_int(frame)
    }

    /// Gets several keys sharing one slot; missing keys are `None`.
    pub async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Bytes>>> {
        let keys = self.keys(keys);
        let frame = self
            .route(command::mget(keys.iter().cloned()), &keys, true)
            .await?;
        command::frame_to_vec_bytes(frame)
    }

    /// Sets several keys sharing one slot.
    pub async fn mset(&self, pairs: &[(&str, Bytes)]) -> Result<()> {
        let pairs: Vec<(Bytes, Bytes)> = pairs
            .iter()
            .map(|(k, v)| (self.key(k), v.clone()))
            .collect();
        let keys: Vec<Bytes> = pairs.iter().map(|(k, _)| k.clone()).collect();
        let frame = self.route(command::mset(pairs), &keys, false).await?;
        command::frame_to_ok(frame).map(|_| ())
    }

    /// Sets a timeout on a key. Returns false if the key does not exist.
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let key = self.key(key);
        let frame = self
            .route(command::expire(key.clone(), ttl), &[key], false)
            .await?;
        command::frame_to_bool(frame)
    }

    /// Remaining time to live in seconds (-1 no expiry, -2 missing key).
    pub async fn ttl(&self, key: &str) -> Result<i64> {
        let key = self.key(key);
        let frame = self
            .route(command::ttl(key.clone()), &[key], true)
            .await?;
        command::frame_to_int(frame)
    }

    /// Adds members to a set. Returns how many were new.
    pub async fn sadd(&self, key: &str, members: &[Bytes]) -> Result<i64> {
        let key = self.key(key);
        let cmd = command::sadd(key.clone(), members.iter().cloned());
        let frame = self.route(cmd, &[key], false).await?;
        command::frame_to_int(frame)
    }

    /// Members of a set.
    pub async fn smembers(&self, key: &str) -> Result<Vec<Bytes>> {
        let key = self.key(key);
        let frame = self
            .route(command::smembers(key.clone()), &[key], true)
            .await?;
        command::frame_to_members(frame)
    }

    /// Elements of a list or set, sorted numerically.
    pub async fn sort(&self, key: &str) -> Result<Vec<Bytes>> {
        let key = self.key(key);
        let frame = self
            .route(command::sort(key.clone()), &[key], false)
            .await?;
        command::frame_to_members(frame)
    }

    /// Pings the node chosen by `hint`.
    pub async fn ping(&self, hint: &str) -> Result<bool> {
        let frame = self.route_scoped(command::ping(), hint).await?;
        Ok(matches!(frame.as_bytes(), Some(b"PONG")))
    }

    /// Echoes `message` from the node chosen by `hint`.
    pub async fn echo(&self, hint: &str, message: Bytes) -> Result<Bytes> {
        let frame = self.route_scoped(command::echo(message), hint).await?;
        Ok(command::frame_to_bytes(frame)?.unwrap_or_default())
    }

    /// A random key of the node chosen by `hint`, `None` if it has no keys.
    pub async fn random_key(&self, hint: &str) -> Result<Option<Bytes>> {
        let frame = self.route_scoped(command::randomkey(), hint).await?;
        command::frame_to_bytes(frame)
    }

    /// Number of keys on the node chosen by `hint`.
    pub async fn dbsize(&self, hint: &str) -> Result<i64> {
        let frame = self.route_scoped(command::dbsize(), hint).await?;
        command::frame_to_int(frame)
    }

    /// Deletes every key on the node chosen by `hint`.
    pub async fn flushdb(&self, hint: &str) -> Result<bool> {
        let frame = self.route_scoped(command::flushdb(), hint).await?;
        command::frame_to_ok(frame)
    }

    /// Server information of the node chosen by `hint`.
    pub async fn info(&self, hint: &str) -> Result<HashMap<String, String>> {
        let frame = self.route_scoped(command::info(), hint).await?;
        command::frame_to_info(frame)
    }

    /// Addresses of every master in the current slot map.
    pub fn masters(&self) -> Vec<String> {
        self.slot_map()
            .masters()
            .map(|node| node.address().to_string())
            .collect()
    }

    /// Current slot map snapshot.
    pub fn slot_map(&self) -> Arc<SlotMap> {
        self.router.loader().snapshot()
    }

    /// Number of nodes in the current slot map.
    pub fn node_count(&self) -> usize {
        self.slot_map().nodes().len()
    }

    /// Returns true when every slot has an owner.
    pub fn is_fully_covered(&self) -> bool {
        self.slot_map().is_complete()
    }

    /// Re-reads the topology now.
    pub async fn refresh_topology(&self) -> Result<()> {
        let epoch = self.slot_map().epoch();
        self.router.loader().refresh(epoch).await.map(|_| ())
    }

    /// Registry state of a node, `None` if the node is unknown.
    pub fn node_status(&self, address: &str) -> Option<NodeStatus> {
        self.router.loader().registry().state(address)
    }
}

impl fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map = self.slot_map();
        f.debug_struct("ClusterClient")
            .field("epoch", &map.epoch())
            .field("nodes", &map.nodes().len())
            .field("prefix", &self.prefix())
            .finish()
    }
}
