//! Plain TCP forwarding to a fixed backend.

use crate::{Handler, Stream};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::{io, net::TcpStream};
use tracing::debug;

/// Pipes the connection to a single backend address, both directions,
/// until either side closes.
pub struct Forward {
    backend: SocketAddr,
}

impl Forward {
    pub fn new(backend: SocketAddr) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Handler for Forward {
    async fn serve(&self, mut stream: Stream) -> Result<(), anyhow::Error> {
        let mut backend = TcpStream::connect(self.backend).await?;
        debug!(backend = %self.backend, "Forwarding connection");

        let (to_backend, to_client) = io::copy_bidirectional(&mut stream, &mut backend).await?;
        debug!(to_backend, to_client, "Connection finished");
        Ok(())
    }
}
