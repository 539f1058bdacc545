//! Slot map: which node owns which hash slot.
//!
//! A [`SlotMap`] is an immutable snapshot. Nodes live in an arena and slot
//! ranges refer to them by index; a refresh builds a complete new map and
//! swaps it in whole, so routing never sees a half-updated table.

use std::fmt;

use super::slot::SLOT_COUNT;
use crate::proto::frame::Frame;
use crate::{Error, Result};

/// Role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Serves writes for its slot ranges.
    Master,
    /// Replicates a master.
    Replica,
}

/// A cluster node known to the slot map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    address: String,
    id: Option<String>,
    role: NodeRole,
}

impl Node {
    /// Network address (`host:port`). This is the node's identity.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Node id assigned by Redis (40 hex characters), when reported.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Role of the node.
    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Returns true if the node is a master.
    pub fn is_master(&self) -> bool {
        self.role == NodeRole::Master
    }
}

/// A contiguous range of slots and the nodes serving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRange {
    /// First slot (inclusive).
    pub start: u16,
    /// Last slot (inclusive).
    pub end: u16,
    master: usize,
    replicas: Vec<usize>,
}

impl SlotRange {
    /// Returns true if `slot` is within this range.
    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }

    /// Number of slots in the range.
    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    /// Always false: ranges are validated to hold at least one slot.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// One node entry of a topology record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    /// Host name or IP.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Node id, when reported.
    pub id: Option<String>,
}

impl NodeRecord {
    /// Creates a record without a node id.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            id: None,
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One `(start, end, [master, replicas...])` record of a topology reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRecord {
    /// First slot (inclusive).
    pub start: u16,
    /// Last slot (inclusive).
    pub end: u16,
    /// Master first, then replicas.
    pub nodes: Vec<NodeRecord>,
}

/// Immutable mapping of slot ranges to nodes.
#[derive(Clone, PartialEq, Eq)]
pub struct SlotMap {
    nodes: Vec<Node>,
    ranges: Vec<SlotRange>,
    epoch: u64,
}

impl SlotMap {
    /// A map owning no slots.
    pub fn empty() -> Self {
        Self {
            nodes: Vec::new(),
            ranges: Vec::new(),
            epoch: 0,
        }
    }

    /// Builds a map from topology records.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if a record has no master, a slot is out
    /// of range, a range is inverted, or two ranges overlap.
    pub fn from_records(records: Vec<SlotRecord>) -> Result<Self> {
        let mut map = Self::empty();
        for record in records {
            if record.start > record.end || record.end >= SLOT_COUNT {
                return Err(Error::protocol(format!(
                    "invalid slot range {}-{}",
                    record.start, record.end
                )));
            }
            let mut nodes = record.nodes.iter();
            let master = nodes.next().ok_or_else(|| {
                Error::protocol(format!(
                    "slot range {}-{} has no master",
                    record.start, record.end
                ))
            })?;
            let master = map.intern(master, NodeRole::Master);
            let replicas = nodes.map(|n| map.intern(n, NodeRole::Replica)).collect();
            map.ranges.push(SlotRange {
                start: record.start,
                end: record.end,
                master,
                replicas,
            });
        }

        map.ranges.sort_by_key(|r| r.start);
        if let Some(pair) = map.ranges.windows(2).find(|w| w[1].start <= w[0].end) {
            return Err(Error::protocol(format!(
                "overlapping slot ranges {}-{} and {}-{}",
                pair[0].start, pair[0].end, pair[1].start, pair[1].end
            )));
        }
        Ok(map)
    }

    /// Parses a `CLUSTER SLOTS` reply.
    ///
    /// `origin_host` replaces empty host fields, which Redis sends to mean
    /// "the address you asked".
    pub fn from_cluster_slots(frame: Frame, origin_host: &str) -> Result<Self> {
        let records = match frame {
            Frame::Array(records) => records,
            other => {
                return Err(Error::protocol(format!(
                    "CLUSTER SLOTS reply must be an array, got {:?}",
                    other
                )))
            }
        };
        let records = records
            .into_iter()
            .map(|record| parse_record(record, origin_host))
            .collect::<Result<Vec<_>>>()?;
        Self::from_records(records)
    }

    pub(crate) fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }

    /// Refresh generation this snapshot was installed in (0 = never loaded).
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn intern(&mut self, record: &NodeRecord, role: NodeRole) -> usize {
        let address = record.address();
        if let Some(idx) = self.nodes.iter().position(|n| n.address == address) {
            let node = &mut self.nodes[idx];
            if role == NodeRole::Master {
                node.role = NodeRole::Master;
            }
            if node.id.is_none() {
                node.id = record.id.clone();
            }
            return idx;
        }
        self.nodes.push(Node {
            address,
            id: record.id.clone(),
            role,
        });
        self.nodes.len() - 1
    }

    fn range_for_slot(&self, slot: u16) -> Option<&SlotRange> {
        let idx = self.ranges.partition_point(|r| r.end < slot);
        self.ranges.get(idx).filter(|r| r.contains(slot))
    }

    /// Master owning `slot`, if any.
    pub fn master_for_slot(&self, slot: u16) -> Option<&Node> {
        self.range_for_slot(slot).map(|r| &self.nodes[r.master])
    }

    /// Replicas serving `slot`.
    pub fn replicas_for_slot(&self, slot: u16) -> Vec<&Node> {
        self.range_for_slot(slot)
            .map(|r| r.replicas.iter().map(|&i| &self.nodes[i]).collect())
            .unwrap_or_default()
    }

    /// Looks a node up by address.
    pub fn node(&self, address: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.address == address)
    }

    /// Every known node, in discovery order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Masters owning at least one range.
    pub fn masters(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.is_master())
    }

    /// Slot ranges sorted by start slot.
    pub fn ranges(&self) -> &[SlotRange] {
        &self.ranges
    }

    /// Address of the master of `range`.
    pub fn master_of(&self, range: &SlotRange) -> &str {
        &self.nodes[range.master].address
    }

    /// Number of slots that have an owner.
    pub fn covered_slots(&self) -> usize {
        self.ranges.iter().map(SlotRange::len).sum()
    }

    /// Returns true when every slot 0-16383 has an owner.
    pub fn is_complete(&self) -> bool {
        self.covered_slots() == usize::from(SLOT_COUNT)
    }
}

impl Default for SlotMap {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for SlotMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ranges: Vec<String> = self
            .ranges
            .iter()
            .map(|r| format!("{}-{}@{}", r.start, r.end, self.master_of(r)))
            .collect();
        f.debug_struct("SlotMap")
            .field("epoch", &self.epoch)
            .field("ranges", &ranges)
            .finish()
    }
}

fn parse_record(frame: Frame, origin_host: &str) -> Result<SlotRecord> {
    let items = match frame {
        Frame::Array(items) if items.len() >= 3 => items,
        other => {
            return Err(Error::protocol(format!(
                "malformed CLUSTER SLOTS record: {:?}",
                other
            )))
        }
    };
    let mut items = items.into_iter();
    let start = parse_slot(items.next())?;
    let end = parse_slot(items.next())?;
    let nodes = items
        .map(|node| parse_node(node, origin_host))
        .collect::<Result<Vec<_>>>()?;
    Ok(SlotRecord { start, end, nodes })
}

fn parse_slot(frame: Option<Frame>) -> Result<u16> {
    match frame {
        Some(Frame::Integer(n)) => u16::try_from(n)
            .ok()
            .filter(|slot| *slot < SLOT_COUNT)
            .ok_or_else(|| Error::protocol(format!("slot {} out of range", n))),
        other => Err(Error::protocol(format!(
            "slot must be an integer, got {:?}",
            other
        ))),
    }
}

fn parse_node(frame: Frame, origin_host: &str) -> Result<NodeRecord> {
    let items = match frame {
        Frame::Array(items) if items.len() >= 2 => items,
        other => {
            return Err(Error::protocol(format!(
                "malformed node entry: {:?}",
                other
            )))
        }
    };
    let host = match items[0].as_str() {
        Some("") | Some("?") => origin_host.to_string(),
        Some(host) => host.to_string(),
        None => return Err(Error::protocol("node host must be a string")),
    };
    let port = match &items[1] {
        Frame::Integer(p) => u16::try_from(*p)
            .map_err(|_| Error::protocol(format!("node port {} out of range", p)))?,
        other => {
            return Err(Error::protocol(format!(
                "node port must be an integer, got {:?}",
                other
            )))
        }
    };
    let id = items
        .get(2)
        .and_then(Frame::as_str)
        .map(str::to_string);
    Ok(NodeRecord { host, port, id })
}
