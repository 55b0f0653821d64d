//! End-to-end tests: a real listener on 127.0.0.1 with an in-process
//! overlay that maps overlay names onto local test servers.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tailgate::config::ProxyConfig;
use tailgate::error::ProxyError;
use tailgate::proxy::ProxyServer;
use tailgate::transport::{OverlayConn, Transport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Overlay stand-in: known names dial local sockets, everything else fails.
#[derive(Default)]
struct LocalOverlay {
    routes: HashMap<String, SocketAddr>,
    dials: AtomicUsize,
}

impl LocalOverlay {
    fn route(mut self, overlay_addr: &str, local: SocketAddr) -> Self {
        self.routes.insert(overlay_addr.to_string(), local);
        self
    }
}

#[async_trait]
impl Transport for LocalOverlay {
    async fn bring_up(&self) -> Result<(), ProxyError> {
        Ok(())
    }

    async fn dial(&self, addr: &str) -> Result<OverlayConn, ProxyError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let local = self
            .routes
            .get(addr)
            .ok_or_else(|| ProxyError::Dial(format!("no route to {}", addr)))?;
        Ok(Box::new(TcpStream::connect(local).await?))
    }
}

struct RunningProxy {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), ProxyError>>,
}

impl RunningProxy {
    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.unwrap().unwrap();
    }
}

async fn start_proxy(overlay: Arc<LocalOverlay>) -> RunningProxy {
    let mut config = ProxyConfig::default();
    config.listen_addr = "127.0.0.1:0".parse().unwrap();
    config.dial_timeout_secs = 2;

    let server = ProxyServer::bind(Arc::new(config), overlay).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run_until(async {
        let _ = rx.await;
    }));

    RunningProxy { addr, shutdown: Some(tx), task }
}

/// Echoes everything back and half-closes once the peer does.
async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = stream.into_split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
                let _ = write.shutdown().await;
            });
        }
    });
    addr
}

/// Serves one canned response and reports the raw request it received.
async fn start_http_upstream(response: &'static [u8]) -> (SocketAddr, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request = read_request(&mut stream).await;
        let _ = tx.send(request);
        stream.write_all(response).await.unwrap();
        stream.shutdown().await.unwrap();
    });
    (addr, rx)
}

/// Reads a request head plus a `content-length` body, if any.
async fn read_request(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        let text = String::from_utf8_lossy(&buf).to_string();
        if let Some(head_end) = text.find("\r\n\r\n") {
            let body_len = text[..head_end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if buf.len() >= head_end + 4 + body_len {
                break;
            }
        }
    }
    String::from_utf8(buf).unwrap()
}

async fn send_and_read_all(proxy: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("proxy did not close the connection")
        .unwrap();
    String::from_utf8(response).unwrap()
}

#[tokio::test]
async fn test_connect_tunnel_relays_both_ways() {
    let echo = start_echo_server().await;
    let overlay = Arc::new(LocalOverlay::default().route("db.tail1234.ts.net:5432", echo));
    let proxy = start_proxy(overlay.clone()).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(b"CONNECT db.tail1234.ts.net:5432 HTTP/1.1\r\nHost: db.tail1234.ts.net:5432\r\n\r\n")
        .await
        .unwrap();

    let mut status = vec![0u8; ESTABLISHED.len()];
    client.read_exact(&mut status).await.unwrap();
    assert_eq!(status, ESTABLISHED);

    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");

    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    timeout(Duration::from_secs(5), client.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert!(rest.is_empty());
    assert_eq!(overlay.dials.load(Ordering::SeqCst), 1);

    proxy.stop().await;
}

#[tokio::test]
async fn test_connect_keeps_bytes_sent_with_the_request() {
    let echo = start_echo_server().await;
    let overlay = Arc::new(LocalOverlay::default().route("100.64.0.5:443", echo));
    let proxy = start_proxy(overlay).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    // TLS ClientHello stand-in pipelined right behind the CONNECT head
    client
        .write_all(b"CONNECT 100.64.0.5:443 HTTP/1.1\r\n\r\n\x16\x03\x01hello-early")
        .await
        .unwrap();

    let mut status = vec![0u8; ESTABLISHED.len()];
    client.read_exact(&mut status).await.unwrap();
    assert_eq!(status, ESTABLISHED);

    let mut echoed = vec![0u8; 14];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"\x16\x03\x01hello-early");

    proxy.stop().await;
}

#[tokio::test]
async fn test_connect_dial_failure_is_exact_502() {
    let proxy = start_proxy(Arc::new(LocalOverlay::default())).await;

    let response = send_and_read_all(proxy.addr, b"CONNECT gone.ts.net:443 HTTP/1.1\r\n\r\n").await;
    assert_eq!(response, "HTTP/1.1 502 Bad Gateway\r\n\r\n");

    proxy.stop().await;
}

#[tokio::test]
async fn test_connect_without_port_is_400() {
    let overlay = Arc::new(LocalOverlay::default());
    let proxy = start_proxy(overlay.clone()).await;

    let response = send_and_read_all(proxy.addr, b"CONNECT nas.ts.net HTTP/1.1\r\n\r\n").await;
    assert_eq!(response, "HTTP/1.1 400 Bad Request\r\n\r\n");
    assert_eq!(overlay.dials.load(Ordering::SeqCst), 0);

    proxy.stop().await;
}

#[tokio::test]
async fn test_local_pages_never_dial() {
    let overlay = Arc::new(LocalOverlay::default());
    let proxy = start_proxy(overlay.clone()).await;

    let status = send_and_read_all(proxy.addr, b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
    assert!(status.starts_with("HTTP/1.1 200 OK\r\n"), "{}", status);
    assert!(status.to_lowercase().contains("content-type: text/html; charset=utf-8"));
    assert!(status.contains("/proxy.pac"));

    let pac = send_and_read_all(proxy.addr, b"GET /proxy.pac HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
    assert!(pac.starts_with("HTTP/1.1 200 OK\r\n"), "{}", pac);
    assert!(pac.to_lowercase().contains("content-type: application/x-ns-proxy-autoconfig"));
    assert!(pac.contains("function FindProxyForURL(url, host)"));

    let missing = send_and_read_all(proxy.addr, b"GET /nope HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
    assert!(missing.starts_with("HTTP/1.1 404 Not Found\r\n"), "{}", missing);

    assert_eq!(overlay.dials.load(Ordering::SeqCst), 0);
    proxy.stop().await;
}

#[tokio::test]
async fn test_forward_dial_failure_is_generic_502() {
    let proxy = start_proxy(Arc::new(LocalOverlay::default())).await;

    let response = send_and_read_all(
        proxy.addr,
        b"GET http://bad.invalid/ HTTP/1.1\r\nHost: bad.invalid\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{}", response);
    assert!(response.ends_with("\r\n\r\nBad Gateway"), "{}", response);
    assert!(!response.contains("no route"));

    proxy.stop().await;
}

#[tokio::test]
async fn test_forward_rewrites_request_and_relays_response() {
    let (upstream, captured) = start_http_upstream(
        b"HTTP/1.1 200 Healthy\r\nContent-Type: application/json\r\nX-Upstream: grafana\r\nContent-Length: 11\r\n\r\n{\"ok\":true}",
    )
    .await;
    let overlay = Arc::new(LocalOverlay::default().route("grafana.ts.net:3000", upstream));
    let proxy = start_proxy(overlay).await;

    let response = send_and_read_all(
        proxy.addr,
        b"GET http://grafana.ts.net:3000/api/health?full=1 HTTP/1.1\r\n\
          Host: grafana.ts.net:3000\r\n\
          Accept: text/html\r\n\
          Proxy-Connection: keep-alive\r\n\
          User-Agent: tailgate-test\r\n\
          Accept: application/json\r\n\r\n",
    )
    .await;

    let request = captured.await.unwrap();
    assert!(
        request.starts_with("GET /api/health?full=1 HTTP/1.1\r\nHost: grafana.ts.net:3000\r\n"),
        "{}",
        request
    );
    assert!(!request.to_lowercase().contains("proxy-connection"));
    assert!(
        request.contains("accept: text/html\r\nuser-agent: tailgate-test\r\naccept: application/json\r\n"),
        "{}",
        request
    );

    assert!(response.starts_with("HTTP/1.1 200 Healthy\r\n"), "{}", response);
    let lower = response.to_lowercase();
    assert!(lower.contains("content-type: application/json"));
    assert!(lower.contains("x-upstream: grafana"));
    assert!(response.ends_with("{\"ok\":true}"));

    proxy.stop().await;
}

#[tokio::test]
async fn test_forward_streams_request_body() {
    let (upstream, captured) =
        start_http_upstream(b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n").await;
    let overlay = Arc::new(LocalOverlay::default().route("api.ts.net:80", upstream));
    let proxy = start_proxy(overlay).await;

    let response = send_and_read_all(
        proxy.addr,
        b"POST http://api.ts.net/items HTTP/1.1\r\nHost: api.ts.net\r\nContent-Length: 9\r\n\r\nname=disk",
    )
    .await;

    let request = captured.await.unwrap();
    assert!(request.starts_with("POST /items HTTP/1.1\r\nHost: api.ts.net\r\n"), "{}", request);
    assert!(request.ends_with("\r\n\r\nname=disk"), "{}", request);
    assert!(response.starts_with("HTTP/1.1 201 Created\r\n"), "{}", response);

    proxy.stop().await;
}

#[tokio::test]
async fn test_forward_relays_chunked_response() {
    let (upstream, _captured) = start_http_upstream(
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
    )
    .await;
    let overlay = Arc::new(LocalOverlay::default().route("logs.ts.net:80", upstream));
    let proxy = start_proxy(overlay).await;

    let response = send_and_read_all(
        proxy.addr,
        b"GET http://logs.ts.net/tail HTTP/1.1\r\nHost: logs.ts.net\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert!(response.to_lowercase().contains("transfer-encoding: chunked"));
    assert!(response.contains("hello"));
    assert!(response.contains(" world"));

    proxy.stop().await;
}

#[tokio::test]
async fn test_shutdown_stops_accepting_but_drains_tunnels() {
    let echo = start_echo_server().await;
    let overlay = Arc::new(LocalOverlay::default().route("ssh.ts.net:22", echo));
    let proxy = start_proxy(overlay).await;
    let addr = proxy.addr;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"CONNECT ssh.ts.net:22 HTTP/1.1\r\n\r\n").await.unwrap();
    let mut status = vec![0u8; ESTABLISHED.len()];
    client.read_exact(&mut status).await.unwrap();
    assert_eq!(status, ESTABLISHED);

    proxy.stop().await;

    assert!(TcpStream::connect(addr).await.is_err());

    client.write_all(b"still here").await.unwrap();
    let mut echoed = vec![0u8; 10];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"still here");
}
