use std::io;

use thiserror::Error;

/// Result type alias for slotmux operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to a Redis cluster.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An IO error occurred.
    #[error("IO error: {source}")]
    Io {
        /// The underlying IO error.
        #[from]
        source: io::Error,
    },

    /// A reply did not have the shape the command expects.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the error.
        message: String,
    },

    /// The server returned an error.
    #[error("server error: {message}")]
    Server {
        /// Error message from server.
        message: String,
    },

    /// Authentication failed.
    #[error("authentication failed")]
    Auth,

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of invalid argument.
        message: String,
    },

    /// The byte stream could not be decoded as RESP.
    #[error("decode error: {source}")]
    Decode {
        /// Underlying decode error.
        #[from]
        source: DecodeError,
    },

    /// Redis Cluster: key moved to another node (permanent redirect).
    ///
    /// Handled by the router; only surfaced when the retry budget of a
    /// dispatch is already spent.
    #[cfg(feature = "cluster")]
    #[error("MOVED to slot {slot} at {address}")]
    Moved {
        /// The slot number (0-16383).
        slot: u16,
        /// The address of the node owning this slot (e.g., "127.0.0.1:7001").
        address: String,
    },

    /// Redis Cluster: temporary redirect during migration (ASK redirect).
    ///
    /// The slot map is never updated for ASK redirects.
    #[cfg(feature = "cluster")]
    #[error("ASK to slot {slot} at {address}")]
    Ask {
        /// The slot number (0-16383).
        slot: u16,
        /// The address of the node temporarily handling this slot.
        address: String,
    },

    /// Redis Cluster is down or unavailable.
    #[cfg(feature = "cluster")]
    #[error("CLUSTERDOWN cluster is down")]
    ClusterDown,

    /// Multi-key operation with keys in different slots.
    ///
    /// Detected before anything is sent. Use hash tags `{...}` to keep
    /// related keys in one slot.
    #[cfg(feature = "cluster")]
    #[error("CROSSSLOT keys map to different slots ({expected} and {found})")]
    CrossSlot {
        /// Slot of the first key.
        expected: u16,
        /// Slot of the first key that disagreed.
        found: u16,
    },

    /// No node answered a topology query.
    #[cfg(feature = "cluster")]
    #[error("cluster topology unavailable after trying {attempted} node(s): {reason}")]
    TopologyUnavailable {
        /// Number of nodes that were asked.
        attempted: usize,
        /// Last failure observed.
        reason: String,
    },

    /// A node could not be reached, timed out, or is cooling down after a failure.
    #[cfg(feature = "cluster")]
    #[error("node {address} unavailable (slot {slot:?}): {reason}")]
    NodeUnavailable {
        /// Node address (host:port).
        address: String,
        /// Slot being routed, when the command was key-scoped.
        slot: Option<u16>,
        /// Underlying cause.
        reason: String,
    },

    /// A dispatch was redirected a second time.
    #[cfg(feature = "cluster")]
    #[error("redirection loop for slot {slot}: {first} -> {second}")]
    RedirectionLoop {
        /// Slot being routed.
        slot: u16,
        /// Target of the first redirection.
        first: String,
        /// Target of the second redirection.
        second: String,
    },

    /// No node in the slot map owns the slot.
    #[cfg(feature = "cluster")]
    #[error("slot {slot} is not covered by any node")]
    SlotNotCovered {
        /// The unowned slot.
        slot: u16,
    },
}

impl Error {
    /// Returns true if the error means the transport to a node is broken,
    /// as opposed to the node answering with an error.
    ///
    /// [`Error::NodeUnavailable`] does not count; it also covers a node
    /// whose in-flight limit is reached.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Io { .. } | Error::Decode { .. })
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn connection_closed() -> Self {
        Error::Io {
            source: io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"),
        }
    }
}

/// Error returned when a byte stream is not valid RESP.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DecodeError {
    message: String,
}

impl DecodeError {
    /// Creates a new decode error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
