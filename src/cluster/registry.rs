//! Node registry: one lazily opened, multiplexed connection per node.
//!
//! The registry owns every connection handle. Routing code borrows a
//! [`NodeHandle`] for the duration of one request; the handle holds a
//! permit of the node's in-flight limit.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::topology::SlotMap;
use crate::core::command;
use crate::core::connection::Connection;
use crate::core::multiplexed::MultiplexedConnection;
use crate::proto::frame::Frame;
use crate::{Error, Result};

#[cfg(feature = "tls")]
use crate::core::TlsConnectorInner;

/// How node connections are opened.
#[derive(Debug, Clone)]
pub(crate) struct ConnectOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Option<Duration>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub queue_size: usize,
    #[cfg(feature = "tls")]
    pub tls: Option<TlsConnectorInner>,
}

/// Observable state of a registered node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Known, no open connection.
    Idle,
    /// A connection is open.
    Connected,
    /// Recently failed; refused until a topology refresh reinstates it.
    Failed,
}

enum NodeState {
    Idle,
    Connected(MultiplexedConnection),
    Failed { since: Instant },
}

struct NodeEntry {
    state: NodeState,
    permits: Arc<Semaphore>,
}

impl NodeEntry {
    fn new(max_in_flight: usize) -> Self {
        Self {
            state: NodeState::Idle,
            permits: Arc::new(Semaphore::new(max_in_flight)),
        }
    }
}

/// A borrowed connection to one node.
pub(crate) struct NodeHandle {
    pub connection: MultiplexedConnection,
    _permit: OwnedSemaphorePermit,
}

/// Why [`NodeRegistry::get_connection`] handed out no connection.
///
/// Every variant carries the error to show the caller; they differ in what
/// routing should do next.
#[derive(Debug)]
pub(crate) enum Refusal {
    /// Every in-flight permit of the node is taken. The node is healthy.
    Busy(Error),
    /// The node failed recently and is still cooling down.
    CoolingDown(Error),
    /// The registry entry is out of date: the cool-down has elapsed or the
    /// node was removed while waiting. A topology refresh settles it.
    Stale(Error),
    /// Connecting failed at the transport level.
    Unreachable(Error),
    /// The node answered the handshake with an error (e.g. AUTH).
    Rejected(Error),
}

impl Refusal {
    pub fn into_error(self) -> Error {
        match self {
            Refusal::Busy(e)
            | Refusal::CoolingDown(e)
            | Refusal::Stale(e)
            | Refusal::Unreachable(e)
            | Refusal::Rejected(e) => e,
        }
    }
}

pub(crate) struct NodeRegistry {
    nodes: Mutex<HashMap<String, NodeEntry>>,
    options: ConnectOptions,
    max_in_flight: usize,
    acquire_timeout: Duration,
    failure_cooldown: Duration,
}

impl NodeRegistry {
    pub fn new(
        options: ConnectOptions,
        max_in_flight: usize,
        acquire_timeout: Duration,
        failure_cooldown: Duration,
    ) -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            options,
            max_in_flight: max_in_flight.max(1),
            acquire_timeout,
            failure_cooldown,
        }
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// Returns a connection to `address`, opening one if needed.
    ///
    /// Unknown addresses (a redirect target not yet in the slot map) are
    /// registered on the fly. A failed node is refused without any I/O.
    pub async fn get_connection(
        &self,
        address: &str,
        slot: Option<u16>,
    ) -> std::result::Result<NodeHandle, Refusal> {
        let permits = {
            let mut nodes = self.nodes.lock();
            let entry = nodes
                .entry(address.to_string())
                .or_insert_with(|| NodeEntry::new(self.max_in_flight));
            if let NodeState::Failed { since } = entry.state {
                return Err(self.refuse_failed(address, slot, since));
            }
            entry.permits.clone()
        };

        let permit = match tokio::time::timeout(self.acquire_timeout, permits.acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(Refusal::Stale(unavailable(
                    address,
                    slot,
                    "node removed from registry",
                )))
            }
            Err(_) => {
                return Err(Refusal::Busy(unavailable(
                    address,
                    slot,
                    format!("no free connection slot within {:?}", self.acquire_timeout),
                )))
            }
        };

        if let Some(connection) = self.live_connection(address, slot)? {
            return Ok(NodeHandle {
                connection,
                _permit: permit,
            });
        }

        debug!(address, "opening node connection");
        let connection = open_connection(address, &self.options)
            .await
            .map_err(|e| {
                if e.is_connection_error() {
                    Refusal::Unreachable(unavailable(address, slot, e.to_string()))
                } else {
                    Refusal::Rejected(e)
                }
            })?;

        let mut nodes = self.nodes.lock();
        let connection = match nodes.get_mut(address) {
            Some(entry) => match &entry.state {
                NodeState::Connected(existing) if !existing.is_closed() => existing.clone(),
                NodeState::Failed { since } => {
                    return Err(self.refuse_failed(address, slot, *since))
                }
                _ => {
                    entry.state = NodeState::Connected(connection.clone());
                    connection
                }
            },
            None => connection,
        };
        Ok(NodeHandle {
            connection,
            _permit: permit,
        })
    }

    /// Returns the live connection of `address`, if there is one.
    fn live_connection(
        &self,
        address: &str,
        slot: Option<u16>,
    ) -> std::result::Result<Option<MultiplexedConnection>, Refusal> {
        let mut nodes = self.nodes.lock();
        let Some(entry) = nodes.get_mut(address) else {
            return Ok(None);
        };
        match &entry.state {
            NodeState::Connected(connection) if !connection.is_closed() => {
                Ok(Some(connection.clone()))
            }
            NodeState::Connected(_) => {
                entry.state = NodeState::Idle;
                Ok(None)
            }
            NodeState::Failed { since } => Err(self.refuse_failed(address, slot, *since)),
            NodeState::Idle => Ok(None),
        }
    }

    fn refuse_failed(&self, address: &str, slot: Option<u16>, since: Instant) -> Refusal {
        let elapsed = since.elapsed();
        let error = unavailable(address, slot, format!("marked failed {:?} ago", elapsed));
        if elapsed < self.failure_cooldown {
            Refusal::CoolingDown(error)
        } else {
            Refusal::Stale(error)
        }
    }

    /// Drops the node's connection and refuses it until reinstated.
    ///
    /// Marking an already failed node keeps the original failure time.
    pub fn mark_failed(&self, address: &str) {
        let mut nodes = self.nodes.lock();
        let entry = nodes
            .entry(address.to_string())
            .or_insert_with(|| NodeEntry::new(self.max_in_flight));
        if !matches!(entry.state, NodeState::Failed { .. }) {
            warn!(address, "marking node as failed");
            entry.state = NodeState::Failed {
                since: Instant::now(),
            };
        }
    }

    /// Drops the node's connection without marking it failed.
    pub fn evict(&self, address: &str) {
        if let Some(entry) = self.nodes.lock().get_mut(address) {
            if matches!(entry.state, NodeState::Connected(_)) {
                debug!(address, "evicting node connection");
                entry.state = NodeState::Idle;
            }
        }
    }

    /// Registers a node without connecting to it.
    pub fn add_node(&self, address: &str) {
        self.nodes
            .lock()
            .entry(address.to_string())
            .or_insert_with(|| NodeEntry::new(self.max_in_flight));
    }

    /// Forgets a node. Requests waiting for one of its permits fail.
    pub fn remove_node(&self, address: &str) {
        if let Some(entry) = self.nodes.lock().remove(address) {
            debug!(address, "removing node");
            entry.permits.close();
        }
    }

    /// Clears the failure mark of `address` once its cool-down elapsed.
    ///
    /// Returns true if the node is usable afterwards.
    pub fn reinstate(&self, address: &str) -> bool {
        let mut nodes = self.nodes.lock();
        let Some(entry) = nodes.get_mut(address) else {
            return false;
        };
        match entry.state {
            NodeState::Failed { since } if since.elapsed() < self.failure_cooldown => false,
            NodeState::Failed { .. } => {
                debug!(address, "reinstating node");
                entry.state = NodeState::Idle;
                true
            }
            _ => true,
        }
    }

    /// Returns true while a failed node is still cooling down.
    pub fn in_cooldown(&self, address: &str) -> bool {
        match self.nodes.lock().get(address).map(|e| &e.state) {
            Some(NodeState::Failed { since }) => since.elapsed() < self.failure_cooldown,
            _ => false,
        }
    }

    pub fn state(&self, address: &str) -> Option<NodeStatus> {
        self.nodes.lock().get(address).map(|entry| match entry.state {
            NodeState::Idle => NodeStatus::Idle,
            NodeState::Connected(_) => NodeStatus::Connected,
            NodeState::Failed { .. } => NodeStatus::Failed,
        })
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    /// Aligns the registry with a freshly installed slot map.
    ///
    /// New nodes are added, nodes the map no longer lists are removed and
    /// listed nodes past their cool-down are reinstated.
    pub fn sync_with(&self, map: &SlotMap) {
        for node in map.nodes() {
            self.add_node(node.address());
            self.reinstate(node.address());
        }
        let stale: Vec<String> = self
            .nodes
            .lock()
            .keys()
            .filter(|address| map.node(address).is_none())
            .cloned()
            .collect();
        for address in stale {
            self.remove_node(&address);
        }
    }
}

fn unavailable(address: &str, slot: Option<u16>, reason: impl Into<String>) -> Error {
    Error::NodeUnavailable {
        address: address.to_string(),
        slot,
        reason: reason.into(),
    }
}

/// Host part of `host:port`, without IPv6 brackets.
pub(crate) fn host_of(address: &str) -> &str {
    let host = address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(address);
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Opens and authenticates a connection to `address`.
pub(crate) async fn open_connection(
    address: &str,
    options: &ConnectOptions,
) -> Result<MultiplexedConnection> {
    let stream = tokio::time::timeout(options.connect_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| Error::Io {
            source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
        })??;
    stream.set_nodelay(true)?;

    #[cfg(feature = "tls")]
    let connection = match &options.tls {
        Some(tls) => {
            let stream = tls.connect(host_of(address), stream).await?;
            MultiplexedConnection::new(
                Connection::new(stream),
                options.queue_size,
                options.read_timeout,
            )
        }
        None => MultiplexedConnection::new(
            Connection::new(stream),
            options.queue_size,
            options.read_timeout,
        ),
    };
    #[cfg(not(feature = "tls"))]
    let connection = MultiplexedConnection::new(
        Connection::new(stream),
        options.queue_size,
        options.read_timeout,
    );

    tokio::time::timeout(options.connect_timeout, authenticate(&connection, options))
        .await
        .map_err(|_| Error::Io {
            source: io::Error::new(io::ErrorKind::TimedOut, "AUTH timed out"),
        })??;
    Ok(connection)
}

async fn authenticate(connection: &MultiplexedConnection, options: &ConnectOptions) -> Result<()> {
    let Some(password) = &options.password else {
        return Ok(());
    };
    let cmd = match &options.username {
        Some(username) => command::auth_with_username(username.clone(), password.clone()),
        None => command::auth(password.clone()),
    };
    match connection.send_command(cmd.into_frame()).await? {
        Frame::Error(_) => Err(Error::Auth),
        _ => Ok(()),
    }
}
