//! Topology discovery and coalesced refresh.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::commands::cluster_slots;
use super::errors::parse_redis_error;
use super::registry::{host_of, open_connection, NodeRegistry};
use super::topology::SlotMap;
use crate::proto::frame::Frame;
use crate::{Error, Result};

/// Owns the current [`SlotMap`] and replaces it on refresh.
pub(crate) struct TopologyLoader {
    seeds: Vec<String>,
    current: RwLock<Arc<SlotMap>>,
    refresh_lock: Mutex<()>,
    registry: Arc<NodeRegistry>,
}

impl TopologyLoader {
    pub fn new(seeds: Vec<String>, registry: Arc<NodeRegistry>) -> Self {
        Self {
            seeds,
            current: RwLock::new(Arc::new(SlotMap::empty())),
            refresh_lock: Mutex::new(()),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Builds the first slot map from the seed list.
    pub async fn load(&self) -> Result<Arc<SlotMap>> {
        if self.seeds.is_empty() {
            return Err(Error::TopologyUnavailable {
                attempted: 0,
                reason: "no seed nodes configured".to_string(),
            });
        }
        let _guard = self.refresh_lock.lock().await;
        let map = self.fetch_any(&self.seeds).await?;
        Ok(self.install(map))
    }

    /// Current snapshot. Never blocks on a refresh in progress.
    pub fn snapshot(&self) -> Arc<SlotMap> {
        self.current.read().clone()
    }

    /// Re-reads the topology.
    ///
    /// `observed_epoch` is the epoch of the snapshot the caller routed with.
    /// If a newer map was installed since, it is returned as is.
    #[instrument(skip(self), level = "debug")]
    pub async fn refresh(&self, observed_epoch: u64) -> Result<Arc<SlotMap>> {
        let _guard = self.refresh_lock.lock().await;
        let current = self.snapshot();
        if current.epoch() != observed_epoch {
            debug!(epoch = current.epoch(), "topology already refreshed");
            return Ok(current);
        }
        let candidates = self.candidates(&current);
        let map = self.fetch_any(&candidates).await?;
        Ok(self.install(map))
    }

    /// Nodes to ask, in order: masters, replicas, then seeds.
    ///
    /// Nodes still cooling down after a failure are skipped, except seeds.
    fn candidates(&self, current: &SlotMap) -> Vec<String> {
        let mut candidates: Vec<String> = current
            .masters()
            .chain(current.nodes().iter().filter(|n| !n.is_master()))
            .map(|n| n.address())
            .filter(|address| !self.registry.in_cooldown(address))
            .map(str::to_string)
            .collect();
        for seed in &self.seeds {
            if !candidates.contains(seed) {
                candidates.push(seed.clone());
            }
        }
        candidates
    }

    async fn fetch_any(&self, candidates: &[String]) -> Result<SlotMap> {
        let mut reason = String::from("no candidate nodes");
        for address in candidates {
            match self.fetch_from(address).await {
                Ok(map) if !map.ranges().is_empty() => return Ok(map),
                Ok(_) => {
                    warn!(address = %address, "node reported no slot ranges");
                    reason = format!("{} reported no slot ranges", address);
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "topology query failed");
                    reason = format!("{}: {}", address, e);
                }
            }
        }
        Err(Error::TopologyUnavailable {
            attempted: candidates.len(),
            reason,
        })
    }

    /// Asks one node for `CLUSTER SLOTS` over a dedicated connection.
    async fn fetch_from(&self, address: &str) -> Result<SlotMap> {
        let options = self.registry.options();
        let connection = open_connection(address, options).await?;
        let limit = options.read_timeout.unwrap_or(options.connect_timeout);
        let reply = tokio::time::timeout(
            limit,
            connection.send_command(cluster_slots().into_frame()),
        )
        .await
        .map_err(|_| Error::Io {
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "CLUSTER SLOTS timed out"),
        })??;
        match reply {
            Frame::Error(e) => Err(parse_redis_error(&e)),
            reply => SlotMap::from_cluster_slots(reply, host_of(address)),
        }
    }

    fn install(&self, map: SlotMap) -> Arc<SlotMap> {
        let mut current = self.current.write();
        let map = Arc::new(map.with_epoch(current.epoch() + 1));
        self.registry.sync_with(&map);
        *current = map.clone();
        info!(
            epoch = map.epoch(),
            ranges = map.ranges().len(),
            masters = map.masters().count(),
            complete = map.is_complete(),
            "installed cluster topology"
        );
        map
    }
}
