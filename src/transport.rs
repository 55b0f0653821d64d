//! Overlay transport: the only way the proxy reaches a destination.
//!
//! The proxy core only needs `bring_up`, `dial` and `tear_down`. How the
//! overlay authenticates, discovers peers and carries packets is the
//! provider's business.

use crate::config::Credential;
use crate::error::ProxyError;
use async_trait::async_trait;
use log::{debug, info};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_socks::tcp::Socks5Stream;

/// Byte stream dialed through the overlay.
///
/// `AsyncWrite::poll_shutdown` is the "close write" operation: streams that
/// support it half-close, the rest close outright.
pub trait OverlayStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> OverlayStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type OverlayConn = Box<dyn OverlayStream>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Brings the overlay node up. Failure is fatal at startup.
    async fn bring_up(&self) -> Result<(), ProxyError>;

    /// Opens a stream to `addr` (`host:port`) through the overlay.
    async fn dial(&self, addr: &str) -> Result<OverlayConn, ProxyError>;

    async fn tear_down(&self) {}
}

/// Dials once with an upper bound. A timeout is reported as a dial error.
pub async fn dial_with_timeout(
    transport: &dyn Transport,
    addr: &str,
    limit: Duration,
) -> Result<OverlayConn, ProxyError> {
    match timeout(limit, transport.dial(addr)).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::Dial(format!("dial {} timed out after {}s", addr, limit.as_secs()))),
    }
}

/// Signals "no more writes" on `stream`. Errors only mean the peer is gone.
pub async fn close_write<W>(stream: &mut W)
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if let Err(e) = stream.shutdown().await {
        debug!("close_write: {}", e);
    }
}

/// Dials through the SOCKS5 endpoint of a local overlay gateway.
///
/// The node authenticates with RFC 1929 username/password, the node name as
/// username and the overlay auth key as password.
pub struct Socks5Transport {
    gateway: SocketAddr,
    node_name: String,
    credential: Credential,
    probe_timeout: Duration,
}

impl Socks5Transport {
    pub fn new(
        gateway: SocketAddr,
        node_name: impl Into<String>,
        credential: Credential,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            node_name: node_name.into(),
            credential,
            probe_timeout,
        }
    }
}

#[async_trait]
impl Transport for Socks5Transport {
    async fn bring_up(&self) -> Result<(), ProxyError> {
        debug!("Probing overlay gateway at {}", self.gateway);
        let probe = timeout(self.probe_timeout, TcpStream::connect(self.gateway))
            .await
            .map_err(|_| ProxyError::Dial(format!("overlay gateway {} did not answer", self.gateway)))?
            .map_err(|e| ProxyError::Dial(format!("overlay gateway {} unreachable: {}", self.gateway, e)))?;
        drop(probe);

        info!("Overlay node '{}' is up via gateway {}", self.node_name, self.gateway);
        Ok(())
    }

    async fn dial(&self, addr: &str) -> Result<OverlayConn, ProxyError> {
        let stream = Socks5Stream::connect_with_password(
            self.gateway,
            addr,
            &self.node_name,
            self.credential.expose(),
        )
        .await
        .map_err(|e| ProxyError::Dial(format!("{}: {}", addr, e)))?;

        Ok(Box::new(stream))
    }

    async fn tear_down(&self) {
        info!("Overlay node '{}' leaving gateway {}", self.node_name, self.gateway);
    }
}
