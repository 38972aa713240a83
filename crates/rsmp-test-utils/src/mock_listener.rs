// mock_listener: accepts connections from a site under test.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::mock_peer::MockPeer;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Binds to port 0 (random) so each test gets an isolated endpoint.
pub struct MockListener {
    listener: TcpListener,
    addr: SocketAddr,
}

impl MockListener {
    pub async fn bind() -> Result<Self, BoxError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        Ok(MockListener { listener, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for the next incoming connection.
    pub async fn accept(&self, within: Duration) -> Result<MockPeer, BoxError> {
        let (stream, _) = tokio::time::timeout(within, self.listener.accept())
            .await
            .map_err(|_| "no connection accepted in time")??;
        Ok(MockPeer::from_stream(stream))
    }
}
