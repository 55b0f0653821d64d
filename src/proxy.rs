use crate::classify::{LocalPage, Route, classify};
use crate::common::{ProxyBody, ResponseBuilder};
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::forward_proxy::ForwardProxy;
use crate::http1::{HeadError, HeaderFields, RequestHead};
use crate::lookahead::Lookahead;
use crate::pages::{PageRenderer, program_name};
use crate::transport::{Transport, close_write};
use crate::tunnel::{BAD_REQUEST, TunnelRelay};
use hyper::body::Incoming;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use log::{debug, info, warn};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

pub const HEADERS_TOO_LARGE: &[u8] = b"HTTP/1.1 431 Request Header Fields Too Large\r\n\r\n";

/// Pause after a failed `accept()` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The local proxy listener.
pub struct ProxyServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
}

impl ProxyServer {
    /// Binds the listener. Nothing is accepted until [`ProxyServer::run_until`].
    pub async fn bind(config: Arc<ProxyConfig>, transport: Arc<dyn Transport>) -> Result<Self, ProxyError> {
        info!("Binding proxy listener to: {}", config.listen_addr);
        let listener = TcpListener::bind(config.listen_addr).await?;
        Ok(Self {
            listener,
            dispatcher: Arc::new(Dispatcher::new(&config, transport, &program_name())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `shutdown` resolves. Connections already
    /// accepted keep running on their own tasks.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()>,
    {
        info!("Proxy listening on: http://{}", self.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Stopped accepting connections");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("set_nodelay for {}: {}", peer, e);
                        }
                        let dispatcher = self.dispatcher.clone();
                        tokio::spawn(async move {
                            dispatcher.serve_connection(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        warn!("Error accepting connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }
    }

    pub async fn run(self) -> Result<(), ProxyError> {
        self.run_until(std::future::pending()).await
    }
}

/// Per-connection routing: classifies the request once and hands the
/// connection to exactly one handler.
pub struct Dispatcher {
    pages: PageRenderer,
    tunnel: TunnelRelay,
    forward: ForwardProxy,
    max_header_size: usize,
}

impl Dispatcher {
    pub fn new(config: &ProxyConfig, transport: Arc<dyn Transport>, program: &str) -> Self {
        Self {
            pages: PageRenderer::new(config, program),
            tunnel: TunnelRelay::new(transport.clone(), config.dial_timeout()),
            forward: ForwardProxy::new(transport, config.dial_timeout()),
            max_header_size: config.max_header_size,
        }
    }

    pub async fn serve_connection<S>(self: Arc<Self>, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut reader = Lookahead::new(stream, self.max_header_size);
        let (head_len, head) = match RequestHead::peek(&mut reader, self.max_header_size).await {
            Ok(parsed) => parsed,
            Err(HeadError::Closed) => {
                debug!("{} closed before sending a request", peer);
                return;
            }
            Err(HeadError::TooLarge(limit)) => {
                debug!("{} sent a request head over {} bytes", peer, limit);
                reply_raw(&mut reader, HEADERS_TOO_LARGE).await;
                return;
            }
            Err(HeadError::Malformed(e)) => {
                debug!("{} sent a malformed request: {}", peer, e);
                reply_raw(&mut reader, BAD_REQUEST).await;
                return;
            }
            Err(HeadError::Io(e)) => {
                debug!("Reading request from {}: {}", peer, e);
                return;
            }
        };

        let route = classify(&head.method, &head.uri);
        debug!("{} {} {} -> {:?}", peer, head.method, head.uri, route);

        match route {
            Route::Tunnel(target) => {
                reader.discard(head_len);
                let (pending, stream) = reader.into_parts();
                if let Err(e) = self.tunnel.run(stream, pending, &target).await {
                    debug!("Tunnel for {} to {} ended: {}", peer, target, e);
                }
            }
            route => {
                let dispatcher = self.clone();
                let fields = Arc::new(head.fields);
                let service = service_fn(move |req| {
                    let dispatcher = dispatcher.clone();
                    let route = route.clone();
                    let fields = fields.clone();
                    async move { Ok::<_, Infallible>(dispatcher.respond(route, req, &fields).await) }
                });

                if let Err(e) = ServerBuilder::new()
                    .keep_alive(false)
                    .serve_connection(TokioIo::new(reader), service)
                    .await
                {
                    debug!("Error serving connection from {}: {}", peer, e);
                }
            }
        }
    }

    async fn respond(&self, route: Route, req: Request<Incoming>, fields: &HeaderFields) -> Response<ProxyBody> {
        match route {
            Route::Local(LocalPage::Status) => ResponseBuilder::html(self.pages.status_page()),
            Route::Local(LocalPage::Pac) => ResponseBuilder::pac(self.pages.pac_script()),
            Route::Local(LocalPage::NotFound) => ResponseBuilder::not_found(),
            Route::Forward => self.forward.handle_request(req, fields).await,
            // tunnels never reach hyper
            Route::Tunnel(_) => ResponseBuilder::bad_request(),
        }
    }
}

async fn reply_raw<S>(stream: &mut S, response: &[u8])
where
    S: AsyncWrite + Unpin,
{
    if let Err(e) = stream.write_all(response).await {
        debug!("Writing error response: {}", e);
        return;
    }
    close_write(stream).await;
}
