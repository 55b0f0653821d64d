use crate::common::{ProxyBody, ResponseBuilder, empty};
use crate::error::ProxyError;
use crate::http1::{BodyFraming, HeadError, MAX_RESPONSE_HEAD, ResponseHead, decode_chunked};
use crate::lookahead::Lookahead;
use crate::transport::{OverlayConn, Transport, dial_with_timeout};
use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Body, Frame};
use hyper::ext::ReasonPhrase;
use hyper::header::{HOST, HeaderName, HeaderValue};
use hyper::{Method, Request, Response, Uri};
use log::{debug, info, warn};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio_util::io::ReaderStream;

const PROXY_CONNECTION: &str = "proxy-connection";

/// Destination of an absolute-form request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    /// Port given explicitly and different from the scheme's default.
    explicit_port: bool,
    pub path_and_query: String,
}

impl Target {
    pub fn from_uri(uri: &Uri) -> Result<Self, ProxyError> {
        let (Some(scheme), Some(authority)) = (uri.scheme_str(), uri.authority()) else {
            return Err(ProxyError::BadRequest(format!("request target {} is not absolute-form", uri)));
        };
        if authority.host().is_empty() {
            return Err(ProxyError::BadRequest(format!("request target {} has no host", uri)));
        }

        let default_port = if scheme.eq_ignore_ascii_case("https") { 443 } else { 80 };
        let port = authority.port_u16().unwrap_or(default_port);
        let path_and_query = match uri.path_and_query().map(|pq| pq.as_str()) {
            Some(pq) if pq.starts_with('/') => pq.to_string(),
            Some(pq) if !pq.is_empty() => format!("/{}", pq),
            _ => "/".to_string(),
        };

        Ok(Self {
            host: authority.host().to_string(),
            port,
            explicit_port: port != default_port,
            path_and_query,
        })
    }

    /// `host:port` handed to the transport.
    pub fn dial_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Value of the `Host` header sent upstream.
    pub fn host_header(&self) -> String {
        if self.explicit_port {
            self.dial_addr()
        } else {
            self.host.clone()
        }
    }
}

/// Writes the upstream request head: origin-form request line, `Host` first,
/// then every client header in wire order except `Host` and `Proxy-Connection`.
pub fn serialize_request_head(method: &Method, target: &Target, fields: &[(HeaderName, HeaderValue)]) -> Vec<u8> {
    let mut head = Vec::with_capacity(256 + fields.len() * 32);
    head.extend_from_slice(method.as_str().as_bytes());
    head.push(b' ');
    head.extend_from_slice(target.path_and_query.as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\nHost: ");
    head.extend_from_slice(target.host_header().as_bytes());
    head.extend_from_slice(b"\r\n");

    for (name, value) in fields {
        if name == HOST || name.as_str() == PROXY_CONNECTION {
            continue;
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }

    head.extend_from_slice(b"\r\n");
    head
}

/// Relays absolute-form requests over a fresh overlay connection per request.
#[derive(Clone)]
pub struct ForwardProxy {
    transport: Arc<dyn Transport>,
    dial_timeout: Duration,
}

impl ForwardProxy {
    pub fn new(transport: Arc<dyn Transport>, dial_timeout: Duration) -> Self {
        Self { transport, dial_timeout }
    }

    /// Relays `req` upstream. `fields` are the client's header fields in wire
    /// order; they are what gets sent, `req.headers()` only drives body framing.
    pub async fn handle_request<B>(&self, req: Request<B>, fields: &[(HeaderName, HeaderValue)]) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display,
    {
        let summary = format!("{} {}", req.method(), req.uri());
        match self.process_request(req, fields).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Forwarding {} failed: {}", summary, e);
                ResponseBuilder::from_error(&e)
            }
        }
    }

    async fn process_request<B>(
        &self,
        req: Request<B>,
        fields: &[(HeaderName, HeaderValue)],
    ) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display,
    {
        let target = Target::from_uri(req.uri())?;
        let framing = BodyFraming::for_request(req.headers())
            .map_err(|e| ProxyError::BadRequest(e.to_string()))?;

        let dial_addr = target.dial_addr();
        debug!("HTTP {} {} via overlay to {}", req.method(), target.path_and_query, dial_addr);
        let mut conn = dial_with_timeout(self.transport.as_ref(), &dial_addr, self.dial_timeout).await?;

        let (parts, body) = req.into_parts();
        conn.write_all(&serialize_request_head(&parts.method, &target, fields)).await?;
        send_body(&mut conn, body, framing).await?;
        conn.flush().await?;

        let mut reader = Lookahead::new(conn, MAX_RESPONSE_HEAD);
        let head = loop {
            let head = ResponseHead::read(&mut reader).await.map_err(upstream_error)?;
            if !head.is_interim() {
                break head;
            }
            debug!("Skipping interim {} from {}", head.status, dial_addr);
        };
        let framing = BodyFraming::for_response(&parts.method, &head).map_err(upstream_error)?;

        info!("{} {}{} -> {}", parts.method, target.host_header(), target.path_and_query, head.status);

        let (leftover, conn) = reader.into_parts();
        Ok(relay_response(head, response_body(leftover, conn, framing)))
    }
}

/// Client-facing response carrying the upstream status line and headers as received.
fn relay_response(head: ResponseHead, body: ProxyBody) -> Response<ProxyBody> {
    let mut response = Response::new(body);
    *response.status_mut() = head.status;
    *response.headers_mut() = head.headers;
    if let Some(phrase) = head.reason.and_then(|reason| ReasonPhrase::try_from(reason.into_bytes()).ok()) {
        response.extensions_mut().insert(phrase);
    }
    response
}

fn upstream_error(e: HeadError) -> ProxyError {
    ProxyError::Upstream(e.to_string())
}

/// Streams the client's body upstream, re-chunking when the client sent it chunked.
async fn send_body<B>(conn: &mut OverlayConn, body: B, framing: BodyFraming) -> Result<(), ProxyError>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::fmt::Display,
{
    if framing == BodyFraming::Empty {
        return Ok(());
    }
    let chunked = framing == BodyFraming::Chunked;
    let mut body = Box::pin(body);

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| ProxyError::Http(format!("reading request body: {}", e)))?;
        let Ok(data) = frame.into_data() else {
            continue; // trailers are not forwarded
        };
        if data.is_empty() {
            continue;
        }
        if chunked {
            conn.write_all(format!("{:x}\r\n", data.len()).as_bytes()).await?;
            conn.write_all(&data).await?;
            conn.write_all(b"\r\n").await?;
        } else {
            conn.write_all(&data).await?;
        }
    }

    if chunked {
        conn.write_all(b"0\r\n\r\n").await?;
    }
    Ok(())
}

/// Body of the upstream response: bytes already read past the head first,
/// then the rest of the connection, cut according to `framing`.
fn response_body(leftover: Bytes, conn: OverlayConn, framing: BodyFraming) -> ProxyBody {
    let source = Cursor::new(leftover).chain(conn);
    match framing {
        BodyFraming::Empty => empty(),
        BodyFraming::Length(len) => stream_body(ReaderStream::new(source.take(len))),
        BodyFraming::Chunked => stream_body(decode_chunked(BufReader::new(source))),
        BodyFraming::UntilEof => stream_body(ReaderStream::new(source)),
    }
}

fn stream_body<S>(stream: S) -> ProxyBody
where
    S: futures::Stream<Item = std::io::Result<Bytes>> + Send + 'static,
{
    StreamBody::new(stream.map_ok(Frame::data).map_err(ProxyError::Io)).boxed_unsync()
}
