#![doc = include_str!("../Readme.md")]

pub mod conn;
pub mod forward;
pub mod router;
pub mod sniff;
pub mod starttls;
pub mod tls;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub use forward::Forward;
pub use router::Router;

/// A duplex byte stream, the shape an accept loop hands over.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Duplex for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed stream passed between the router and handlers.
pub type Stream = Box<dyn Duplex>;

/// Owns and serves a single accepted connection for its lifetime.
///
/// Invocations share no mutable state; the handler value itself is
/// shared read-only across connection tasks.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve(&self, stream: Stream) -> Result<(), anyhow::Error>;
}
