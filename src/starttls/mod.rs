//! Plaintext STARTTLS negotiation ahead of TLS termination.
//!
//! Some protocols upgrade to TLS in-band: the connection starts in
//! plaintext and both sides explicitly agree to switch. No SNI is on
//! the wire at sniff time, so the target identity is discovered during
//! the plaintext exchange and substituted for certificate selection.

pub mod xmpp;

use crate::{
    tls::{TlsConfig, TlsHandler},
    Handler, Stream,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Protocols with a STARTTLS negotiation machine.
///
/// The set is closed on purpose: registration validates against it and
/// the handler dispatches exhaustively, so a route can never carry a
/// protocol nothing knows how to negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Xmpp,
}

impl Protocol {
    /// Registry lookup used at route-registration time.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "xmpp" => Some(Self::Xmpp),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Xmpp => "xmpp",
        }
    }
}

/// Decorator that runs the plaintext negotiation, then terminates TLS
/// with certificate selection patched to honor the negotiated
/// identity, then delegates like a plain TLS route.
///
/// Negotiation failure abandons the connection; the machine has
/// already sent whatever protocol-level error applies.
pub struct StartTlsHandler {
    next: Arc<dyn Handler>,
    config: TlsConfig,
    protocol: Protocol,
}

impl StartTlsHandler {
    pub fn new(next: Arc<dyn Handler>, config: TlsConfig, protocol: Protocol) -> Self {
        Self {
            next,
            config,
            protocol,
        }
    }
}

#[async_trait]
impl Handler for StartTlsHandler {
    async fn serve(&self, mut stream: Stream) -> Result<(), anyhow::Error> {
        let negotiated = match self.protocol {
            Protocol::Xmpp => {
                let mut machine = xmpp::Xmpp::new(&mut stream);
                machine.negotiate().await?;
                machine.into_server_name()
            }
        };
        debug!(
            protocol = self.protocol.name(),
            server_name = negotiated.as_deref().unwrap_or_default(),
            "Completed STARTTLS negotiation"
        );

        TlsHandler::new(self.next.clone(), self.config.clone())
            .serve_with_name(stream, negotiated)
            .await
    }
}
