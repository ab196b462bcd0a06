//! TLS ClientHello sniffing.
//!
//! To route by SNI, the field needs to be parsed out of the TLS
//! handshake. To avoid reinventing wheels - module leverages
//! [`rustls`]: the peeked record is fed into a throwaway
//! [`Acceptor`] whose only job is to decode the ClientHello.

use crate::conn::LookAhead;
use rustls::server::Acceptor;
use std::io::{self, Cursor};
use tokio::io::AsyncRead;
use tracing::{debug, instrument, trace, warn};

const RECORD_TYPE_HANDSHAKE: u8 = 0x16;
const RECORD_HEADER_LEN: usize = 5;

/// Outcome of sniffing the first bytes of an unclassified stream.
///
/// The bytes inspected stay buffered in the [`LookAhead`] the sniffer
/// ran over; the caller reinstates them before dispatching.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Sniffed {
    /// SNI hostname from the ClientHello; empty when the connection is
    /// not TLS or the name could not be recovered.
    pub server_name: String,
    pub is_tls: bool,
}

impl Sniffed {
    fn tls(server_name: Option<String>) -> Self {
        Self {
            server_name: server_name.unwrap_or_default(),
            is_tls: true,
        }
    }
}

/// Classifies the stream and, for TLS, recovers the SNI hostname from
/// the ClientHello. Consumes nothing: every byte inspected stays
/// buffered in `reader` for replay.
#[instrument(skip_all)]
pub async fn client_hello<R>(reader: &mut LookAhead<R>) -> Sniffed
where
    R: AsyncRead + Unpin,
{
    let first = match reader.peek(1).await {
        Ok(buffered) => buffered[0],
        Err(err) => {
            if err.kind() != io::ErrorKind::UnexpectedEof {
                warn!("Failed to peek first byte: {err}");
            }
            return Sniffed::default();
        }
    };

    if first != RECORD_TYPE_HANDSHAKE {
        debug!("First byte {first:#04x} is not a TLS handshake record");
        return Sniffed::default();
    }

    let record_len = match reader.peek(RECORD_HEADER_LEN).await {
        // Version bytes at offsets 1-2 are irrelevant for routing.
        Ok(hdr) => u16::from_be_bytes([hdr[3], hdr[4]]) as usize,
        Err(err) => {
            warn!("Failed to peek record header: {err}");
            return Sniffed::default();
        }
    };

    match reader.peek(RECORD_HEADER_LEN + record_len).await {
        Ok(buffered) => {
            let hello = &buffered[..RECORD_HEADER_LEN + record_len];
            Sniffed::tls(server_name(hello))
        }
        Err(err) => {
            // TLS for sure, but the ClientHello is truncated. The
            // record may still complete downstream, so classify as TLS
            // with no name and let the fallback routes take it.
            debug!("Truncated ClientHello record: {err}");
            Sniffed::tls(None)
        }
    }
}

/// Feeds one complete handshake record into a sacrificial [`Acceptor`]
/// so the rustls ClientHello parser recovers the SNI value. The
/// acceptor is dropped right after; no handshake is ever completed on
/// it.
fn server_name(hello: &[u8]) -> Option<String> {
    let mut acceptor = Acceptor::default();
    let mut cursor = Cursor::new(hello);
    if let Err(err) = acceptor.read_tls(&mut cursor) {
        debug!("Record is not readable as TLS: {err}");
        return None;
    }

    match acceptor.accept() {
        Ok(Some(accepted)) => {
            let sni = accepted.client_hello().server_name().map(ToOwned::to_owned);
            debug!("Got sni from incoming connection: {sni:?}");
            sni
        }
        Ok(None) => {
            trace!("Record does not hold a complete ClientHello");
            None
        }
        Err(err) => {
            debug!("Record does not parse as a ClientHello: {err}");
            None
        }
    }
}

#[cfg(test)]
pub(crate) fn client_hello_for(host: &str) -> Vec<u8> {
    use rustls::{ClientConfig, ClientConnection, RootCertStore};
    use std::sync::Arc;

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(RootCertStore::empty())
        .with_no_client_auth();

    let mut conn = ClientConnection::new(
        Arc::new(config),
        host.try_into().expect("valid dns name"),
    )
    .expect("client connection");

    let mut hello = Vec::new();
    conn.write_tls(&mut hello).expect("write ClientHello");
    hello
}
