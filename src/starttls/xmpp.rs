//! STARTTLS negotiation for XMPP (RFC 6120 §5).
//!
//! The server side of the plaintext exchange: read the client's stream
//! header to learn who it is addressing, advertise `starttls` as
//! required, and confirm the client's `<starttls/>` with a
//! `<proceed/>`. The caller then layers the real TLS handshake on the
//! same connection, selecting a certificate for the negotiated name.

use bytes::{Buf, BytesMut};
use quick_xml::{
    events::{BytesStart, Event},
    Reader,
};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const FEATURES: &str = "<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls></stream:features>";
const PROCEED: &str = "<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>";

// Caps buffering for a single element. A peer that streams this much
// without producing one is not speaking the handshake subset of XMPP.
const MAX_ELEMENT_LEN: usize = 16 * 1024;

const NOT_WELL_FORMED: &str = "<not-well-formed xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>";
const IMPROPER_ADDRESSING: &str = "<improper-addressing xmlns='urn:ietf:params:xml:ns:xmpp-streams'/><text xml:lang='en' xmlns='urn:ietf:params:xml:ns:xmpp-streams'>Missing &apos;to&apos; attribute</text>";
const POLICY_VIOLATION: &str = "<policy-violation xmlns='urn:ietf:params:xml:ns:xmpp-streams'/><text xml:lang='en' xmlns='urn:ietf:params:xml:ns:xmpp-streams'>Use of STARTTLS required</text>";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("client sent an invalid initial stream header")]
    MalformedHandshake,
    #[error("client did not send a 'to' attribute in the initial stream header")]
    MissingIdentity,
    #[error("client requested feature '{0}' instead of starttls")]
    UnexpectedElement(String),
    #[error("stream already open")]
    AlreadyOpen,
    #[error("stream not open")]
    NotOpen,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Open/close marker for the server side of the plaintext stream.
///
/// Opening twice or closing an unopened stream is a programming error
/// and gets a typed rejection instead of silently clobbering state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Init,
    Open { id: i64 },
    Closed,
}

impl StreamState {
    fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

/// One negotiation attempt over one connection. Created per attempt,
/// discarded after success or failure.
pub struct Xmpp<C> {
    conn: C,
    buf: BytesMut,
    state: StreamState,
    identity: Option<String>,
}

impl<C> Xmpp<C>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(conn: C) -> Self {
        Self {
            conn,
            buf: BytesMut::with_capacity(512),
            state: StreamState::Init,
            identity: None,
        }
    }

    /// Runs the plaintext exchange to completion.
    ///
    /// On success exactly three things have been written - the stream
    /// header, the features list and the proceed element - and the
    /// client's next bytes will be a TLS ClientHello. Protocol
    /// violations are answered with the matching stream error before
    /// the stream is closed; if that write itself fails, the write
    /// error is surfaced instead (the connection is being abandoned
    /// either way).
    pub async fn negotiate(&mut self) -> Result<(), Error> {
        let open = self.next_element().await?;
        if open.prefix.as_deref() != Some("stream") || open.local != "stream" {
            self.send_error(NOT_WELL_FORMED).await?;
            return Err(Error::MalformedHandshake);
        }

        match open.to.filter(|to| !to.is_empty()) {
            Some(to) => self.identity = Some(to),
            None => {
                self.send_error(IMPROPER_ADDRESSING).await?;
                return Err(Error::MissingIdentity);
            }
        }
        debug!(
            to = self.identity.as_deref().unwrap_or_default(),
            "Client opened stream"
        );

        self.send(FEATURES).await?;

        let request = self.next_element().await?;
        if request.local != "starttls" {
            self.send_error(POLICY_VIOLATION).await?;
            return Err(Error::UnexpectedElement(request.local));
        }

        // No stream close on success: the TLS handshake continues on
        // this same byte stream.
        self.send(PROCEED).await
    }

    /// The identity the client addressed, available after the stream
    /// header was read. Stands in for SNI during certificate
    /// selection.
    pub fn server_name(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn into_server_name(self) -> Option<String> {
        self.identity
    }

    /// Reads the next opening element, buffering until the parser can
    /// produce one. Anything that is not an element (declarations,
    /// whitespace, comments) is skipped.
    async fn next_element(&mut self) -> Result<Element, Error> {
        loop {
            match Self::parse_element(&self.buf) {
                Ok(Some((element, consumed))) => {
                    self.buf.advance(consumed);
                    return Ok(element);
                }
                Ok(None) if self.buf.len() > MAX_ELEMENT_LEN => {
                    self.send_error(NOT_WELL_FORMED).await?;
                    return Err(Error::MalformedHandshake);
                }
                Ok(None) => {}
                Err(err) => {
                    self.send_error(NOT_WELL_FORMED).await?;
                    return Err(err);
                }
            }

            let read = self.conn.read_buf(&mut self.buf).await?;
            if read == 0 {
                self.send_error(NOT_WELL_FORMED).await?;
                return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
        }
    }

    /// Attempts to extract the next opening element from `buf`.
    /// Returns the element plus the bytes consumed, or `None` while
    /// the buffer only holds a partial document.
    fn parse_element(buf: &[u8]) -> Result<Option<(Element, usize)>, Error> {
        let mut reader = Reader::from_reader(buf);
        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) | Ok(Event::Empty(start)) => {
                    let consumed = reader.buffer_position();
                    return Ok(Some((Element::from_start(&start)?, consumed)));
                }
                Ok(Event::Eof) => return Ok(None),
                Ok(_) => continue,
                // A tag cut off mid-buffer; more bytes may complete it.
                Err(quick_xml::Error::UnexpectedEof(_)) => return Ok(None),
                Err(err) => {
                    debug!("Failed to parse client stream: {err}");
                    return Err(Error::MalformedHandshake);
                }
            }
        }
    }

    /// Sends on the plaintext stream, opening it first if necessary.
    async fn send(&mut self, data: &str) -> Result<(), Error> {
        if !self.state.is_open() {
            self.open_stream().await?;
        }

        self.conn.write_all(data.as_bytes()).await?;
        Ok(())
    }

    /// Emits the server stream header with a fresh id and, once known,
    /// the negotiated identity as `from`.
    async fn open_stream(&mut self) -> Result<(), Error> {
        if self.state.is_open() {
            return Err(Error::AlreadyOpen);
        }

        let id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(1, |since| since.as_nanos() as i64);
        let from = self
            .identity
            .as_deref()
            .map(|from| format!("from='{from}' "))
            .unwrap_or_default();
        let header = format!("<stream:stream id='{id}' version='1.0' xml:lang='en' xmlns:stream='http://etherx.jabber.org/streams' {from}xmlns='jabber:client'>");

        self.conn.write_all(header.as_bytes()).await?;
        self.state = StreamState::Open { id };
        Ok(())
    }

    async fn close_stream(&mut self) -> Result<(), Error> {
        if !self.state.is_open() {
            return Err(Error::NotOpen);
        }

        self.conn.write_all(b"</stream:stream>").await?;
        self.state = StreamState::Closed;
        Ok(())
    }

    /// Best-effort stream error ahead of abandoning the connection.
    async fn send_error(&mut self, condition: &str) -> Result<(), Error> {
        self.send(&format!("<stream:error>{condition}</stream:error>"))
            .await?;
        self.close_stream().await
    }
}

/// The parts of an opening element negotiation cares about.
#[derive(Debug)]
struct Element {
    prefix: Option<String>,
    local: String,
    to: Option<String>,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> Result<Self, Error> {
        let name = start.name();
        let prefix = name
            .prefix()
            .map(|prefix| String::from_utf8_lossy(prefix.as_ref()).into_owned());
        let local = String::from_utf8_lossy(name.local_name().as_ref()).into_owned();

        let mut to = None;
        for attr in start.attributes() {
            let attr = attr.map_err(|_| Error::MalformedHandshake)?;
            if attr.key.local_name().as_ref() == b"to" {
                let value = attr
                    .unescape_value()
                    .map_err(|_| Error::MalformedHandshake)?;
                to = Some(value.into_owned());
                break;
            }
        }

        Ok(Self { prefix, local, to })
    }
}
