use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::{Error, Result};

/// TLS connector shared by every node connection of a client.
#[derive(Clone)]
pub struct TlsConnectorInner {
    connector: TlsConnector,
}

impl TlsConnectorInner {
    /// Creates a connector trusting Mozilla's root certificates (`webpki-roots`).
    pub fn new() -> Self {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Self {
            connector: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Runs the TLS handshake for `host` over an established TCP stream.
    pub async fn connect(&self, host: &str, stream: TcpStream) -> Result<TlsStream<TcpStream>> {
        let name = ServerName::try_from(host.to_string()).map_err(|_| Error::InvalidArgument {
            message: format!("invalid TLS server name: {}", host),
        })?;
        Ok(self.connector.connect(name, stream).await?)
    }
}

impl Default for TlsConnectorInner {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TlsConnectorInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnectorInner").finish_non_exhaustive()
    }
}
