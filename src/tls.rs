//! TLS termination for routed connections.

use crate::{Handler, Stream};
use async_trait::async_trait;
use rustls::{
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
    ServerConfig,
};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

/// Certificate selection by requested server name.
///
/// rustls exposes the whole ClientHello to its resolver, but routing
/// only ever selects by name - and STARTTLS substitutes a name that was
/// negotiated in plaintext before any ClientHello exists. Keeping the
/// seam name-only makes that substitution possible.
pub trait ResolveCert: Send + Sync {
    fn resolve(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>>;
}

/// Serves one certificate regardless of the requested name.
pub struct StaticCert(pub Arc<CertifiedKey>);

impl ResolveCert for StaticCert {
    fn resolve(&self, _server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// TLS configuration attached to a route: certificate selection plus
/// the protocols advertised via ALPN.
#[derive(Clone)]
pub struct TlsConfig {
    certs: Arc<dyn ResolveCert>,
    alpn: Vec<Vec<u8>>,
}

impl TlsConfig {
    pub fn new(certs: Arc<dyn ResolveCert>) -> Self {
        Self {
            certs,
            alpn: Vec::new(),
        }
    }

    pub fn with_alpn(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn = protocols;
        self
    }

    /// Builds the rustls config for one handshake. `override_name`,
    /// when set, takes precedence over whatever SNI the ClientHello
    /// carries.
    fn server_config(&self, override_name: Option<String>) -> Arc<ServerConfig> {
        let mut config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(CertSelect {
                certs: self.certs.clone(),
                override_name,
            }));
        config.alpn_protocols = self.alpn.clone();

        Arc::new(config)
    }
}

/// Adapter between rustls certificate resolution and [`ResolveCert`].
struct CertSelect {
    certs: Arc<dyn ResolveCert>,
    override_name: Option<String>,
}

impl ResolvesServerCert for CertSelect {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = self
            .override_name
            .as_deref()
            .or_else(|| client_hello.server_name());
        self.certs.resolve(name)
    }
}

/// Decorator that terminates TLS, then delegates the cleartext stream.
///
/// A failed handshake drops the connection without delegating; there
/// is nothing to retry.
pub struct TlsHandler {
    next: Arc<dyn Handler>,
    config: TlsConfig,
}

impl TlsHandler {
    pub fn new(next: Arc<dyn Handler>, config: TlsConfig) -> Self {
        Self { next, config }
    }

    /// Handshake with certificate selection patched to prefer
    /// `override_name` over the ClientHello's SNI. Used by STARTTLS,
    /// where the identity arrived during the plaintext exchange.
    pub(crate) async fn serve_with_name(
        &self,
        stream: Stream,
        override_name: Option<String>,
    ) -> Result<(), anyhow::Error> {
        let acceptor = TlsAcceptor::from(self.config.server_config(override_name));
        let tls = acceptor.accept(stream).await?;
        debug!("Completed TLS handshake");

        self.next.serve(Box::new(tls)).await
    }
}

#[async_trait]
impl Handler for TlsHandler {
    async fn serve(&self, stream: Stream) -> Result<(), anyhow::Error> {
        self.serve_with_name(stream, None).await
    }
}
