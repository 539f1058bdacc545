//! Slot-based command routing with redirect and failover handling.
//!
//! Every dispatch gets at most one automatic retry:
//!
//! - `MOVED` refreshes the slot map and resends to the named node
//! - `ASK` resends to the named node prefixed with `ASKING`, map untouched
//! - a broken connection marks the node failed, refreshes, and resends to
//!   the new owner
//! - a failed node past its cool-down refreshes and resends without
//!   marking anything
//!
//! A node that refuses without being asked (in-flight limit reached, still
//! cooling down, handshake rejected) fails the command as is: no mark, no
//! refresh.
//!
//! A second redirect becomes [`Error::RedirectionLoop`]; a second
//! connection failure becomes [`Error::NodeUnavailable`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use super::commands::{asking, readonly};
use super::errors::{is_redirect, parse_redis_error};
use super::loader::TopologyLoader;
use super::registry::{NodeRegistry, Refusal};
use super::slot::key_slot;
use super::topology::SlotMap;
use crate::proto::frame::Frame;
use crate::{Error, Result};

/// Where a node-scoped command goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ScopedTarget {
    /// The hint named a node of the current map.
    Node(String),
    /// The hint is a key; this is its slot.
    Slot(u16),
}

pub(crate) struct Router {
    loader: TopologyLoader,
    persistent: bool,
    read_from_replicas: bool,
    replica_cursor: AtomicUsize,
}

impl Router {
    pub fn new(loader: TopologyLoader, persistent: bool, read_from_replicas: bool) -> Self {
        Self {
            loader,
            persistent,
            read_from_replicas,
            replica_cursor: AtomicUsize::new(0),
        }
    }

    pub fn loader(&self) -> &TopologyLoader {
        &self.loader
    }

    fn registry(&self) -> &Arc<NodeRegistry> {
        self.loader.registry()
    }

    /// Sends a key-scoped command to the owner of `slot`.
    ///
    /// With `read_only` set and replica reads enabled, the first attempt may
    /// go to a replica of the slot.
    pub async fn dispatch(&self, frame: Frame, slot: u16, read_only: bool) -> Result<Frame> {
        let mut map = self.loader.snapshot();
        let master = self.master_address(&mut map, slot).await?;
        let (address, prefix) = match self.pick_replica(&map, slot, read_only) {
            Some(replica) => (replica, Some(readonly().into_frame())),
            None => (master, None),
        };
        debug!(slot, address = %address, "routing command");

        let first_error = match self.send(&address, Some(slot), &frame, prefix).await {
            Ok(reply) => return Ok(reply),
            Err(e) => e,
        };

        let (retry_address, prefix, redirected) = match first_error {
            SendError::Reply(Error::Moved { address: target, .. }) => {
                warn!(slot, from = %address, to = %target, "MOVED redirect");
                if let Err(e) = self.loader.refresh(map.epoch()).await {
                    warn!(error = %e, "topology refresh after MOVED failed");
                }
                (target, None, true)
            }
            SendError::Reply(Error::Ask { address: target, .. }) => {
                debug!(slot, from = %address, to = %target, "ASK redirect");
                (target, Some(asking().into_frame()), true)
            }
            SendError::Broken(e) => {
                warn!(slot, address = %address, error = %e, "node connection failed");
                self.registry().mark_failed(&address);
                (self.owner_after_failure(&address, slot, &map, &e).await?, None, false)
            }
            SendError::Stale(e) => {
                debug!(slot, address = %address, "failed node past cool-down, refreshing");
                (self.owner_after_failure(&address, slot, &map, &e).await?, None, false)
            }
            SendError::Refused(e) | SendError::Reply(e) => return Err(e),
        };

        match self.send(&retry_address, Some(slot), &frame, prefix).await {
            Ok(reply) => Ok(reply),
            Err(SendError::Reply(second)) if redirected && is_redirect(&second) => {
                let target = redirect_target(&second).unwrap_or_default();
                warn!(slot, first = %retry_address, second = %target, "redirection loop");
                Err(Error::RedirectionLoop {
                    slot,
                    first: retry_address,
                    second: target,
                })
            }
            Err(SendError::Broken(second)) => {
                self.registry().mark_failed(&retry_address);
                Err(unavailable(&retry_address, Some(slot), &second))
            }
            Err(second) => Err(second.into_error()),
        }
    }

    /// Refreshes the slot map after `address` failed and returns the master
    /// now owning `slot`.
    async fn owner_after_failure(
        &self,
        address: &str,
        slot: u16,
        map: &SlotMap,
        cause: &Error,
    ) -> Result<String> {
        let refreshed = match self.loader.refresh(map.epoch()).await {
            Ok(map) => map,
            Err(refresh_error) => {
                warn!(error = %refresh_error, "topology refresh after failure failed");
                return Err(unavailable(address, Some(slot), cause));
            }
        };
        refreshed
            .master_for_slot(slot)
            .map(|node| node.address().to_string())
            .ok_or(Error::SlotNotCovered { slot })
    }

    /// Decides where a node-scoped command with `hint` goes.
    ///
    /// `key` is the hint with the client's key prefix applied; it is only
    /// used when the hint does not name a node.
    pub fn resolve_hint(&self, map: &SlotMap, hint: &str, key: &[u8]) -> ScopedTarget {
        match map.node(hint) {
            Some(node) => ScopedTarget::Node(node.address().to_string()),
            None => ScopedTarget::Slot(key_slot(key)),
        }
    }

    /// Sends a node-scoped command. Redirects are returned, not followed.
    pub async fn dispatch_scoped(&self, frame: Frame, hint: &str, key: &[u8]) -> Result<Frame> {
        let mut map = self.loader.snapshot();
        let target = self.resolve_hint(&map, hint, key);
        let (address, slot) = match &target {
            ScopedTarget::Node(address) => (address.clone(), None),
            ScopedTarget::Slot(slot) => (self.master_address(&mut map, *slot).await?, Some(*slot)),
        };
        debug!(hint, address = %address, "routing node-scoped command");

        let error = match self.send(&address, slot, &frame, None).await {
            Ok(reply) => return Ok(reply),
            Err(SendError::Broken(e)) => {
                warn!(address = %address, error = %e, "node connection failed");
                self.registry().mark_failed(&address);
                e
            }
            Err(SendError::Stale(e)) => e,
            Err(other) => return Err(other.into_error()),
        };

        let refreshed = match self.loader.refresh(map.epoch()).await {
            Ok(map) => map,
            Err(_) => return Err(unavailable(&address, slot, &error)),
        };
        let retry_address = match slot.and_then(|slot| refreshed.master_for_slot(slot)) {
            Some(node) if node.address() != address => node.address().to_string(),
            _ => return Err(unavailable(&address, slot, &error)),
        };
        match self.send(&retry_address, slot, &frame, None).await {
            Ok(reply) => Ok(reply),
            Err(SendError::Broken(e)) => {
                self.registry().mark_failed(&retry_address);
                Err(unavailable(&retry_address, slot, &e))
            }
            Err(other) => Err(other.into_error()),
        }
    }

    /// Master of `slot`, refreshing once if the slot has no owner.
    async fn master_address(&self, map: &mut Arc<SlotMap>, slot: u16) -> Result<String> {
        if let Some(node) = map.master_for_slot(slot) {
            return Ok(node.address().to_string());
        }
        debug!(slot, "slot not covered, refreshing topology");
        *map = self.loader.refresh(map.epoch()).await?;
        map.master_for_slot(slot)
            .map(|node| node.address().to_string())
            .ok_or(Error::SlotNotCovered { slot })
    }

    fn pick_replica(&self, map: &SlotMap, slot: u16, read_only: bool) -> Option<String> {
        if !(read_only && self.read_from_replicas) {
            return None;
        }
        let replicas: Vec<_> = map
            .replicas_for_slot(slot)
            .into_iter()
            .filter(|node| !self.registry().in_cooldown(node.address()))
            .collect();
        if replicas.is_empty() {
            return None;
        }
        let idx = self.replica_cursor.fetch_add(1, Ordering::Relaxed) % replicas.len();
        Some(replicas[idx].address().to_string())
    }

    /// One request to one node.
    ///
    /// `prefix` (ASKING or READONLY) is written together with `frame` so no
    /// other command can run between them on the shared connection.
    async fn send(
        &self,
        address: &str,
        slot: Option<u16>,
        frame: &Frame,
        prefix: Option<Frame>,
    ) -> std::result::Result<Frame, SendError> {
        let handle = self
            .registry()
            .get_connection(address, slot)
            .await
            .map_err(SendError::from)?;
        let mut guard = InFlight {
            registry: self.registry(),
            address,
            armed: true,
        };
        let result = match prefix {
            None => handle.connection.send_command(frame.clone()).await,
            Some(prefix) => handle
                .connection
                .send_pipeline(vec![prefix, frame.clone()])
                .await
                .and_then(last_reply),
        };
        guard.armed = false;
        drop(handle);

        let reply = result.map_err(|e| {
            if e.is_connection_error() {
                SendError::Broken(e)
            } else {
                SendError::Reply(e)
            }
        })?;
        if !self.persistent {
            self.registry().evict(address);
        }
        match reply {
            Frame::Error(message) => Err(SendError::Reply(parse_redis_error(&message))),
            reply => Ok(reply),
        }
    }
}

/// How a single [`Router::send`] failed, which decides the retry.
#[derive(Debug)]
enum SendError {
    /// The node was not asked: busy, cooling down, or handshake rejected.
    Refused(Error),
    /// The node could not be reached or the connection broke mid-request.
    Broken(Error),
    /// The registry's view of the node is out of date.
    Stale(Error),
    /// The node answered with an error.
    Reply(Error),
}

impl SendError {
    fn into_error(self) -> Error {
        match self {
            SendError::Refused(e)
            | SendError::Broken(e)
            | SendError::Stale(e)
            | SendError::Reply(e) => e,
        }
    }
}

impl From<Refusal> for SendError {
    fn from(refusal: Refusal) -> Self {
        match refusal {
            Refusal::Unreachable(e) => SendError::Broken(e),
            Refusal::Stale(e) => SendError::Stale(e),
            other => SendError::Refused(other.into_error()),
        }
    }
}

/// Evicts the node's connection if a request is dropped mid-flight.
///
/// The reply of an abandoned request would otherwise still be read off the
/// shared connection.
struct InFlight<'a> {
    registry: &'a NodeRegistry,
    address: &'a str,
    armed: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(address = self.address, "request cancelled, evicting connection");
            self.registry.evict(self.address);
        }
    }
}

/// Reply of the command in a `[prefix, command]` pair.
fn last_reply(mut replies: Vec<Frame>) -> Result<Frame> {
    let reply = replies
        .pop()
        .ok_or_else(|| Error::protocol("missing reply"))?;
    match replies.pop() {
        Some(Frame::Error(message)) => Err(parse_redis_error(&message)),
        _ => Ok(reply),
    }
}

fn redirect_target(error: &Error) -> Option<String> {
    match error {
        Error::Moved { address, .. } | Error::Ask { address, .. } => Some(address.clone()),
        _ => None,
    }
}

fn unavailable(address: &str, slot: Option<u16>, cause: &Error) -> Error {
    let reason = match cause {
        Error::NodeUnavailable { reason, .. } => reason.clone(),
        other => other.to_string(),
    };
    Error::NodeUnavailable {
        address: address.to_string(),
        slot,
        reason,
    }
}
