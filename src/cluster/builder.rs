use std::sync::Arc;
use std::time::Duration;

use percent_encoding::percent_decode_str;
use url::Url;

use super::client::ClusterClient;
use super::loader::TopologyLoader;
use super::registry::{ConnectOptions, NodeRegistry};
use super::router::Router;
use crate::{Error, Result};

#[cfg(feature = "tls")]
use crate::core::TlsConnectorInner;

const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_FAILURE_COOLDOWN: Duration = Duration::from_secs(2);
const DEFAULT_QUEUE_SIZE: usize = 1024;
const DEFAULT_MAX_IN_FLIGHT: usize = 1024;
const DEFAULT_PORT: u16 = 6379;

/// Builder for configuring and creating a [`ClusterClient`].
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use slotmux::ClusterBuilder;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = ClusterBuilder::new()
///     .seeds(["127.0.0.1:7000", "127.0.0.1:7001"])
///     .connection_timeout(Duration::from_millis(500))
///     .prefix("app:")
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ClusterBuilder {
    seeds: Vec<String>,
    connection_timeout: Duration,
    read_timeout: Option<Duration>,
    persistent: bool,
    prefix: Option<String>,
    password: Option<String>,
    username: Option<String>,
    tls: bool,
    queue_size: usize,
    max_in_flight_per_node: usize,
    acquire_timeout: Duration,
    failure_cooldown: Duration,
    read_from_replicas: bool,
}

impl Default for ClusterBuilder {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            read_timeout: None,
            persistent: true,
            prefix: None,
            password: None,
            username: None,
            tls: false,
            queue_size: DEFAULT_QUEUE_SIZE,
            max_in_flight_per_node: DEFAULT_MAX_IN_FLIGHT,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            failure_cooldown: DEFAULT_FAILURE_COOLDOWN,
            read_from_replicas: false,
        }
    }
}

impl ClusterBuilder {
    /// Creates a new [`ClusterBuilder`] with default settings.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the seed list.
    ///
    /// Seeds are `host:port`, `redis://host:port` or `rediss://host:port`.
    /// They bootstrap the topology and are the last resort when every known
    /// node fails; commands are never routed to a seed as such.
    #[inline]
    pub fn seeds<I, S>(mut self, seeds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.seeds = seeds.into_iter().map(Into::into).collect();
        self
    }

    /// Appends one seed.
    #[inline]
    pub fn seed(mut self, seed: impl Into<String>) -> Self {
        self.seeds.push(seed.into());
        self
    }

    /// Sets the connect timeout for node connections (default: 1s).
    #[inline]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Sets how long a command waits for its reply. `None` means no limit.
    #[inline]
    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Keeps node connections open between commands (default: true).
    ///
    /// When disabled, a node's connection is dropped after every command.
    #[inline]
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Prepends `prefix` to every key before hashing and sending.
    #[inline]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Sets the password sent with `AUTH` on every new connection.
    #[inline]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets the username for ACL authentication.
    #[inline]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Enables TLS for every node connection. Requires the `tls` feature.
    #[inline]
    pub fn tls(mut self, enabled: bool) -> Self {
        self.tls = enabled;
        self
    }

    /// Sets the request queue size of each node connection (default: 1024).
    #[inline]
    pub fn queue_size(mut self, size: usize) -> Self {
        self.queue_size = size;
        self
    }

    /// Caps concurrent requests per node (default: 1024).
    #[inline]
    pub fn max_in_flight_per_node(mut self, max: usize) -> Self {
        self.max_in_flight_per_node = max;
        self
    }

    /// Sets how long a command waits for a free slot on a busy node before
    /// failing with [`Error::NodeUnavailable`] (default: 1s).
    #[inline]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Sets how long a failed node is left alone before a topology refresh
    /// may reinstate it (default: 2s).
    #[inline]
    pub fn failure_cooldown(mut self, cooldown: Duration) -> Self {
        self.failure_cooldown = cooldown;
        self
    }

    /// Lets read-only commands go to replicas (default: false).
    #[inline]
    pub fn read_from_replicas(mut self, enabled: bool) -> Self {
        self.read_from_replicas = enabled;
        self
    }

    /// Loads the cluster topology and returns a ready client.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if a seed cannot be parsed, or TLS is
    ///   requested without the `tls` feature
    /// - [`Error::TopologyUnavailable`] if no seed is given or none answers
    pub async fn build(self) -> Result<ClusterClient> {
        let mut seeds = Vec::with_capacity(self.seeds.len());
        let mut tls = self.tls;
        let mut username = self.username;
        let mut password = self.password;
        for seed in &self.seeds {
            let parsed = parse_seed(seed)?;
            tls |= parsed.tls;
            username = username.or(parsed.username);
            password = password.or(parsed.password);
            if !seeds.contains(&parsed.address) {
                seeds.push(parsed.address);
            }
        }

        let options = ConnectOptions {
            connect_timeout: self.connection_timeout,
            read_timeout: self.read_timeout,
            username,
            password,
            queue_size: self.queue_size.max(1),
            #[cfg(feature = "tls")]
            tls: tls.then(TlsConnectorInner::new),
        };
        if tls && cfg!(not(feature = "tls")) {
            return Err(Error::InvalidArgument {
                message: "TLS requested but the `tls` feature is disabled".to_string(),
            });
        }

        let registry = Arc::new(NodeRegistry::new(
            options,
            self.max_in_flight_per_node,
            self.acquire_timeout,
            self.failure_cooldown,
        ));
        let loader = TopologyLoader::new(seeds, registry);
        loader.load().await?;

        let router = Router::new(loader, self.persistent, self.read_from_replicas);
        Ok(ClusterClient::new(router, self.prefix))
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Seed {
    address: String,
    tls: bool,
    username: Option<String>,
    password: Option<String>,
}

fn parse_seed(seed: &str) -> Result<Seed> {
    let seed = seed.trim();
    if !seed.contains("://") {
        let address = if seed.contains(':') {
            seed.to_string()
        } else {
            format!("{}:{}", seed, DEFAULT_PORT)
        };
        return Ok(Seed {
            address,
            tls: false,
            username: None,
            password: None,
        });
    }

    let invalid = |message: String| Error::InvalidArgument { message };
    let url = Url::parse(seed).map_err(|e| invalid(format!("invalid seed {}: {}", seed, e)))?;
    let tls = match url.scheme() {
        "redis" => false,
        "rediss" => true,
        other => return Err(invalid(format!("unsupported seed scheme: {}", other))),
    };
    let host = url
        .host_str()
        .ok_or_else(|| invalid(format!("seed {} has no host", seed)))?;
    let port = url.port().unwrap_or(DEFAULT_PORT);
    let username = Some(url.username())
        .filter(|u| !u.is_empty())
        .map(decode_credential)
        .transpose()?;
    let password = url.password().map(decode_credential).transpose()?;
    Ok(Seed {
        address: format!("{}:{}", host, port),
        tls,
        username,
        password,
    })
}

/// Userinfo comes percent-encoded out of the URL.
fn decode_credential(raw: &str) -> Result<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|e| Error::InvalidArgument {
            message: format!("seed credentials are not valid UTF-8: {}", e),
        })
}

/// Splits a comma-separated seed list.
pub(crate) fn split_seeds(addresses: &str) -> Vec<String> {
    addresses
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
