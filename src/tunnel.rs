use crate::error::ProxyError;
use crate::transport::{OverlayConn, Transport, close_write, dial_with_timeout};
use bytes::Bytes;
use http::uri::Authority;
use log::{debug, info, warn};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::{JoinError, JoinHandle};

pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
pub const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
pub const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";

/// Bytes moved in each direction over the life of a tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Handles `CONNECT`: dials the target through the overlay and splices the
/// client connection onto the overlay stream.
#[derive(Clone)]
pub struct TunnelRelay {
    transport: Arc<dyn Transport>,
    dial_timeout: Duration,
}

impl TunnelRelay {
    pub fn new(transport: Arc<dyn Transport>, dial_timeout: Duration) -> Self {
        Self { transport, dial_timeout }
    }

    /// Runs the tunnel to completion.
    ///
    /// `client` is owned exclusively from here on. `pending` holds bytes the
    /// client sent after the request head that were already read off the
    /// socket; they are delivered upstream before anything else.
    pub async fn run<C>(&self, mut client: C, pending: Bytes, target: &str) -> Result<TunnelStats, ProxyError>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let well_formed = target
            .parse::<Authority>()
            .map(|authority| !authority.host().is_empty() && authority.port_u16().is_some())
            .unwrap_or(false);
        if !well_formed {
            client.write_all(BAD_REQUEST).await?;
            close_write(&mut client).await;
            return Err(ProxyError::BadRequest(format!("CONNECT target must be host:port, got {:?}", target)));
        }

        let upstream = match dial_with_timeout(self.transport.as_ref(), target, self.dial_timeout).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!("CONNECT {} failed: {}", target, e);
                client.write_all(BAD_GATEWAY).await?;
                close_write(&mut client).await;
                return Err(e);
            }
        };

        client.write_all(CONNECTION_ESTABLISHED).await?;
        client.flush().await?;
        debug!("Tunnel to {} established", target);

        let stats = TunnelSession::new(client, upstream, pending).run(target).await;
        info!(
            "Tunnel to {} closed ({} bytes up, {} bytes down)",
            target, stats.client_to_upstream, stats.upstream_to_client
        );
        Ok(stats)
    }
}

/// A client stream spliced onto an overlay stream.
pub struct TunnelSession<C> {
    client: C,
    upstream: OverlayConn,
    pending: Bytes,
}

impl<C> TunnelSession<C>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(client: C, upstream: OverlayConn, pending: Bytes) -> Self {
        Self { client, upstream, pending }
    }

    /// Pumps bytes both ways and returns once both directions are done.
    /// An error in one direction tears the other one down.
    pub async fn run(self, label: &str) -> TunnelStats {
        let (mut client_read, mut client_write) = tokio::io::split(self.client);
        let (mut upstream_read, mut upstream_write) = tokio::io::split(self.upstream);
        let pending = self.pending;

        let mut outbound: JoinHandle<io::Result<u64>> = tokio::spawn(async move {
            let result = async {
                upstream_write.write_all(&pending).await?;
                let copied = tokio::io::copy(&mut client_read, &mut upstream_write).await?;
                Ok(pending.len() as u64 + copied)
            }
            .await;
            close_write(&mut upstream_write).await;
            result
        });

        let mut inbound: JoinHandle<io::Result<u64>> = tokio::spawn(async move {
            let result = tokio::io::copy(&mut upstream_read, &mut client_write).await;
            close_write(&mut client_write).await;
            result
        });

        let (up, down) = tokio::select! {
            first = &mut outbound => {
                let up = settle(first, label, "client -> upstream");
                if up.is_none() {
                    inbound.abort();
                }
                (up, settle(inbound.await, label, "upstream -> client"))
            }
            first = &mut inbound => {
                let down = settle(first, label, "upstream -> client");
                if down.is_none() {
                    outbound.abort();
                }
                (settle(outbound.await, label, "client -> upstream"), down)
            }
        };

        TunnelStats {
            client_to_upstream: up.unwrap_or(0),
            upstream_to_client: down.unwrap_or(0),
        }
    }
}

fn settle(joined: Result<io::Result<u64>, JoinError>, label: &str, direction: &str) -> Option<u64> {
    match joined {
        Ok(Ok(bytes)) => Some(bytes),
        Ok(Err(e)) => {
            debug!("Tunnel {} {}: {}", label, direction, e);
            None
        }
        Err(e) if e.is_cancelled() => None,
        Err(e) => {
            warn!("Tunnel {} {} task failed: {}", label, direction, e);
            None
        }
    }
}
