//! Routing table and per-connection dispatch.
//!
//! The router owns the mapping from sniffed identities to handlers.
//! Registration happens once, at setup, through `&mut self`; serving
//! borrows `&self`, so publishing the router behind an [`Arc`] after
//! construction gives the single-writer-then-many-readers discipline
//! for free - no lock, and no way to register mid-serve.

use crate::{
    conn::{LookAhead, Replay},
    sniff,
    starttls::{Protocol, StartTlsHandler},
    tls::{TlsConfig, TlsHandler},
    Handler, Stream,
};
use std::{collections::HashMap, sync::Arc};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported STARTTLS protocol `{0}`")]
    UnsupportedProtocol(String),
}

/// One routing-table entry.
///
/// A closed set rather than a bare trait object: dispatch needs to
/// know that a wildcard route negotiates STARTTLS before any TLS
/// record shows up on the wire, and a tag is the honest way to ask.
enum Route {
    Forward(Arc<dyn Handler>),
    Tls(TlsHandler),
    StartTls(StartTlsHandler),
}

impl Route {
    async fn serve(&self, stream: Stream) -> Result<(), anyhow::Error> {
        match self {
            Route::Forward(handler) => handler.serve(stream).await,
            Route::Tls(handler) => handler.serve(stream).await,
            Route::StartTls(handler) => handler.serve(stream).await,
        }
    }
}

/// Maps sniffed connection identities to handlers.
#[derive(Default)]
pub struct Router {
    routing_table: HashMap<String, Route>,
    // TLS configs for hosts whose forwarder is not yet known; drained
    // when the HTTPS forwarder is installed.
    host_tls_config: HashMap<String, TlsConfig>,
    catch_all_no_tls: Option<Arc<dyn Handler>>,
    http_forwarder: Option<Arc<dyn Handler>>,
    https_forwarder: Option<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes `host` (or the `*` wildcard) to `handler`. Hostnames are
    /// case-normalized; the last write for a key wins.
    pub fn add_route(&mut self, host: &str, handler: Arc<dyn Handler>) {
        self.insert(host, Route::Forward(handler));
    }

    /// Routes `host` to `handler` behind TLS termination with
    /// `config`.
    pub fn add_route_tls(&mut self, host: &str, handler: Arc<dyn Handler>, config: TlsConfig) {
        self.insert(host, Route::Tls(TlsHandler::new(handler, config)));
    }

    /// Routes `host` to `handler` behind a STARTTLS negotiation for
    /// `protocol`, then TLS termination with `config`.
    ///
    /// Unknown protocol names are a configuration error and are
    /// rejected here, rather than surfacing as a silent connection
    /// drop at serve time.
    pub fn add_route_starttls(
        &mut self,
        host: &str,
        protocol: &str,
        handler: Arc<dyn Handler>,
        config: TlsConfig,
    ) -> Result<(), Error> {
        let protocol = Protocol::from_name(protocol).ok_or_else(|| {
            warn!(protocol, "Refusing route with unsupported STARTTLS protocol");
            Error::UnsupportedProtocol(protocol.to_owned())
        })?;

        self.insert(
            host,
            Route::StartTls(StartTlsHandler::new(handler, config, protocol)),
        );
        Ok(())
    }

    /// Records a TLS config for `host` now; the route itself is
    /// materialized when the HTTPS forwarder becomes known.
    pub fn add_route_http_tls(&mut self, host: &str, config: TlsConfig) {
        self.host_tls_config.insert(host.to_lowercase(), config);
    }

    /// Fallback for connections that are not TLS.
    pub fn set_catch_all_no_tls(&mut self, handler: Arc<dyn Handler>) {
        self.catch_all_no_tls = Some(handler);
    }

    /// Fallback for plaintext connections when no catch-all is set.
    pub fn set_http_forwarder(&mut self, handler: Arc<dyn Handler>) {
        self.http_forwarder = Some(handler);
    }

    /// Installs the final HTTPS fallback: materializes a TLS route for
    /// every host recorded via [`add_route_http_tls`], then parks the
    /// forwarder itself behind `default_config`.
    ///
    /// [`add_route_http_tls`]: Self::add_route_http_tls
    pub fn set_https_forwarder(&mut self, handler: Arc<dyn Handler>, default_config: TlsConfig) {
        for (host, config) in std::mem::take(&mut self.host_tls_config) {
            self.insert(&host, Route::Tls(TlsHandler::new(handler.clone(), config)));
        }

        self.https_forwarder = Some(Route::Tls(TlsHandler::new(handler, default_config)));
    }

    fn insert(&mut self, host: &str, route: Route) {
        self.routing_table.insert(host.to_lowercase(), route);
    }

    /// Decides which handler owns `stream` and hands it over with any
    /// sniffed bytes reinstated at the front.
    #[instrument(skip_all)]
    pub async fn serve(&self, stream: Stream) -> Result<(), anyhow::Error> {
        // Single possible destination: byte inspection is pure
        // overhead and would break protocols that are not TLS-shaped.
        if self.routing_table.is_empty() {
            if let Some(catch_all) = &self.catch_all_no_tls {
                return catch_all.serve(stream).await;
            }
        }

        let mut reader = LookAhead::new(stream);
        let sniffed = sniff::client_hello(&mut reader).await;
        debug!(
            server_name = %sniffed.server_name,
            is_tls = sniffed.is_tls,
            "Sniffed incoming connection"
        );
        let (stream, peeked) = reader.into_parts();
        let stream: Stream = Box::new(Replay::new(peeked, stream));

        if !sniffed.is_tls {
            // No SNI exists before a plaintext STARTTLS exchange, so a
            // wildcard STARTTLS route outranks the fallbacks here.
            if let Some(route @ Route::StartTls(_)) = self.routing_table.get("*") {
                return route.serve(stream).await;
            }

            return match (&self.catch_all_no_tls, &self.http_forwarder) {
                (Some(catch_all), _) => catch_all.serve(stream).await,
                (None, Some(forwarder)) => forwarder.serve(stream).await,
                (None, None) => {
                    debug!("No handler for plaintext connection, dropping");
                    shutdown(stream).await
                }
            };
        }

        let server_name = sniffed.server_name.to_lowercase();
        if !server_name.is_empty() {
            if let Some(route) = self.routing_table.get(&server_name) {
                return route.serve(stream).await;
            }
        }

        if let Some(route) = self.routing_table.get("*") {
            return route.serve(stream).await;
        }

        match &self.https_forwarder {
            Some(route) => route.serve(stream).await,
            None => {
                debug!(server_name = %server_name, "No handler for TLS connection, dropping");
                shutdown(stream).await
            }
        }
    }
}

async fn shutdown(mut stream: Stream) -> Result<(), anyhow::Error> {
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::Router;
    use crate::{
        sniff::client_hello_for,
        tls::{StaticCert, TlsConfig},
        Handler, Stream,
    };
    use async_trait::async_trait;
    use std::{
        io,
        pin::Pin,
        sync::{Arc, Mutex},
        task::{Context, Poll},
    };
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

    /// Handler stub that records every byte the routed stream carries.
    #[derive(Clone, Default)]
    struct Recording {
        bytes: Arc<Mutex<Vec<u8>>>,
        hits: Arc<Mutex<usize>>,
    }

    impl Recording {
        fn bytes(&self) -> Vec<u8> {
            self.bytes.lock().expect("not poisoned").clone()
        }

        fn hits(&self) -> usize {
            *self.hits.lock().expect("not poisoned")
        }
    }

    #[async_trait]
    impl Handler for Recording {
        async fn serve(&self, mut stream: Stream) -> Result<(), anyhow::Error> {
            *self.hits.lock().expect("not poisoned") += 1;
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await?;
            self.bytes.lock().expect("not poisoned").extend(buf);
            Ok(())
        }
    }

    /// Stream whose read path panics: proves the sniffer never ran.
    struct NoPeeking;

    impl AsyncRead for NoPeeking {
        fn poll_read(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            _: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            panic!("connection was sniffed");
        }
    }

    impl AsyncWrite for NoPeeking {
        fn poll_write(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            _: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(0))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    async fn closed_stream_with(bytes: &[u8]) -> Stream {
        let (mut client, server) = tokio::io::duplex(8192);
        client.write_all(bytes).await.expect("write");
        client.shutdown().await.expect("shutdown");
        Box::new(server)
    }

    fn test_tls_config() -> TlsConfig {
        use rustls::sign::{CertifiedKey, RsaSigningKey};
        use rustls::{Certificate, PrivateKey};

        let key = PrivateKey(include_bytes!("../testdata/key.der").to_vec());
        let signing = RsaSigningKey::new(&key).expect("valid test key");
        let key = CertifiedKey::new(
            vec![Certificate(include_bytes!("../testdata/cert.der").to_vec())],
            Arc::new(signing),
        );
        TlsConfig::new(Arc::new(StaticCert(Arc::new(key))))
    }

    #[tokio::test]
    async fn empty_table_with_catch_all_skips_sniffing() {
        // NoPeeking panics on any read, so this only passes if the
        // fast path skips the sniffer entirely.
        struct Hit(Arc<Mutex<usize>>);

        #[async_trait]
        impl Handler for Hit {
            async fn serve(&self, _stream: Stream) -> Result<(), anyhow::Error> {
                *self.0.lock().expect("not poisoned") += 1;
                Ok(())
            }
        }

        let hits = Arc::new(Mutex::new(0));
        let mut router = Router::new();
        router.set_catch_all_no_tls(Arc::new(Hit(hits.clone())));

        router
            .serve(Box::new(NoPeeking))
            .await
            .expect("served without sniffing");
        assert_eq!(*hits.lock().expect("not poisoned"), 1);
    }

    #[tokio::test]
    async fn routes_by_sni_case_insensitively() {
        let recording = Recording::default();
        let mut router = Router::new();
        router.add_route("Example.COM", Arc::new(recording.clone()));

        let hello = client_hello_for("example.com");
        router
            .serve(closed_stream_with(&hello).await)
            .await
            .expect("served");

        assert_eq!(recording.hits(), 1);
        // The handler sees the stream from byte zero.
        assert_eq!(recording.bytes(), hello);
    }

    #[tokio::test]
    async fn wildcard_takes_unmatched_tls_with_bytes_intact() {
        let a = Recording::default();
        let b = Recording::default();
        let mut router = Router::new();
        router.add_route("a.example", Arc::new(a.clone()));
        router.add_route("*", Arc::new(b.clone()));

        let hello = client_hello_for("b.example");
        router
            .serve(closed_stream_with(&hello).await)
            .await
            .expect("served");

        assert_eq!(a.hits(), 0);
        assert_eq!(b.hits(), 1);
        assert_eq!(b.bytes(), hello);
    }

    #[tokio::test]
    async fn plaintext_goes_to_catch_all_with_replay() {
        let route = Recording::default();
        let catch_all = Recording::default();
        let mut router = Router::new();
        router.add_route("a.example", Arc::new(route.clone()));
        router.set_catch_all_no_tls(Arc::new(catch_all.clone()));

        let request = b"GET / HTTP/1.1\r\nHost: a.example\r\n\r\n";
        router
            .serve(closed_stream_with(request).await)
            .await
            .expect("served");

        assert_eq!(route.hits(), 0);
        assert_eq!(catch_all.hits(), 1);
        assert_eq!(catch_all.bytes(), request);
    }

    #[tokio::test]
    async fn plaintext_falls_back_to_http_forwarder() {
        let forwarder = Recording::default();
        let mut router = Router::new();
        router.add_route("a.example", Arc::new(Recording::default()));
        router.set_http_forwarder(Arc::new(forwarder.clone()));

        let request = b"EHLO mail.example\r\n";
        router
            .serve(closed_stream_with(request).await)
            .await
            .expect("served");

        assert_eq!(forwarder.hits(), 1);
        assert_eq!(forwarder.bytes(), request);
    }

    #[tokio::test]
    async fn unroutable_connections_are_dropped() {
        let other = Recording::default();
        let mut router = Router::new();
        router.add_route("other.host", Arc::new(other.clone()));

        let hello = client_hello_for("nobody.example");
        router
            .serve(closed_stream_with(&hello).await)
            .await
            .expect("dropped cleanly");

        assert_eq!(other.hits(), 0);
    }

    #[tokio::test]
    async fn wildcard_starttls_takes_plaintext_connections() {
        let next = Recording::default();
        let mut router = Router::new();
        router
            .add_route_starttls("*", "xmpp", Arc::new(next.clone()), test_tls_config())
            .expect("xmpp is supported");

        // Stream header without 'to': negotiation must fail, which
        // proves the plaintext bytes reached the STARTTLS machine with
        // the peeked prefix intact.
        let (mut client, server) = tokio::io::duplex(8192);
        client
            .write_all(b"<stream:stream xmlns:stream='http://etherx.jabber.org/streams'>")
            .await
            .expect("write");
        client.shutdown().await.expect("shutdown");

        let outcome = router.serve(Box::new(server)).await;
        assert!(outcome.is_err());

        let mut answer = String::new();
        client.read_to_string(&mut answer).await.expect("read");
        assert!(answer.contains("<improper-addressing"));
        assert_eq!(next.hits(), 0);
    }

    #[tokio::test]
    async fn rejects_unsupported_starttls_protocol() {
        let mut router = Router::new();
        let outcome = router.add_route_starttls(
            "mail.example",
            "smtp",
            Arc::new(Recording::default()),
            test_tls_config(),
        );

        assert!(matches!(
            outcome,
            Err(super::Error::UnsupportedProtocol(name)) if name == "smtp"
        ));
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let first = Recording::default();
        let second = Recording::default();
        let mut router = Router::new();
        router.add_route("app.example", Arc::new(first.clone()));
        router.add_route("APP.example", Arc::new(second.clone()));

        let hello = client_hello_for("app.example");
        router
            .serve(closed_stream_with(&hello).await)
            .await
            .expect("served");

        assert_eq!(first.hits(), 0);
        assert_eq!(second.hits(), 1);
    }
}
