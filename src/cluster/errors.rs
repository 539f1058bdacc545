//! Classification of error replies from cluster nodes.
//!
//! - `MOVED <slot> <host>:<port>` - the slot lives elsewhere now
//! - `ASK <slot> <host>:<port>` - the slot is migrating; ask once over there
//! - `CLUSTERDOWN ...` - the cluster cannot serve the request

use crate::Error;

/// Turns an error reply into a typed error.
///
/// Anything that is not a well-formed redirect or `CLUSTERDOWN` is returned
/// as [`Error::Server`] with the message untouched, including a server-side
/// `CROSSSLOT`.
pub fn parse_redis_error(error_msg: &[u8]) -> Error {
    let msg = String::from_utf8_lossy(error_msg);
    let msg = msg.trim();

    if let Some(redirect) = msg.strip_prefix("MOVED ") {
        if let Some((slot, address)) = parse_redirect(redirect) {
            return Error::Moved { slot, address };
        }
    }

    if let Some(redirect) = msg.strip_prefix("ASK ") {
        if let Some((slot, address)) = parse_redirect(redirect) {
            return Error::Ask { slot, address };
        }
    }

    if msg.starts_with("CLUSTERDOWN") {
        return Error::ClusterDown;
    }

    Error::Server {
        message: msg.to_string(),
    }
}

/// Returns true for MOVED and ASK.
pub(crate) fn is_redirect(error: &Error) -> bool {
    matches!(error, Error::Moved { .. } | Error::Ask { .. })
}

/// Splits `"<slot> <host>:<port>"`.
fn parse_redirect(args: &str) -> Option<(u16, String)> {
    let mut parts = args.split_whitespace();
    let slot: u16 = parts.next()?.parse().ok()?;
    let address = parts.next()?;
    if parts.next().is_some() || !address.contains(':') {
        return None;
    }
    Some((slot, address.to_string()))
}
