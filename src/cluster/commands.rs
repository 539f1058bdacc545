//! Cluster management commands used by topology discovery and redirects.

use crate::core::command::Cmd;

/// Creates a CLUSTER SLOTS command.
///
/// The reply lists every slot range with its master first and replicas after.
pub fn cluster_slots() -> Cmd {
    Cmd::new("CLUSTER").arg("SLOTS")
}

/// Creates an ASKING command.
///
/// Only affects the command sent right after it on the same connection.
pub fn asking() -> Cmd {
    Cmd::new("ASKING")
}

/// Creates a READONLY command, allowing reads from a replica connection.
pub fn readonly() -> Cmd {
    Cmd::new("READONLY")
}
