//! WebSocket upgrade proxy
//!
//! Clients arrive through an edge that tells us which instance port they
//! want in a routing header (`fly-forwarded-port` by default). Only upgrade
//! requests for ports the gate knows about are forwarded; everything else is
//! answered with a bare status line and closed.
//!
//! The proxy works on raw sockets: it reads the request head itself, replays
//! it to the instance with the routing and `Host` headers rewritten, relays
//! the instance's `101` and then splices the two streams.

use crate::config::ProxyConfig;
use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::supervisor::Supervisor;
use hyper::StatusCode;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Largest request or response head accepted
const MAX_HEAD_SIZE: usize = 16 * 1024;

const READ_CHUNK: usize = 4096;

/// Read-only view deciding whether a port may be dialed
pub trait ConnectionGate: Send + Sync + 'static {
    fn is_known_port(&self, port: u16) -> bool;
}

impl ConnectionGate for Registry {
    fn is_known_port(&self, port: u16) -> bool {
        Registry::is_known_port(self, port)
    }
}

impl ConnectionGate for Supervisor {
    fn is_known_port(&self, port: u16) -> bool {
        Supervisor::is_known_port(self, port)
    }
}

impl<F> ConnectionGate for F
where
    F: Fn(u16) -> bool + Send + Sync + 'static,
{
    fn is_known_port(&self, port: u16) -> bool {
        self(port)
    }
}

pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    context: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
}

struct ProxyContext {
    gate: Arc<dyn ConnectionGate>,
    config: ProxyConfig,
    metrics: Arc<Metrics>,
}

impl ProxyServer {
    pub async fn bind(
        bind_addr: SocketAddr,
        gate: Arc<dyn ConnectionGate>,
        config: ProxyConfig,
        metrics: Arc<Metrics>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            context: Arc::new(ProxyContext {
                gate,
                config,
                metrics,
            }),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            addr = %self.local_addr,
            port_header = %self.context.config.port_header,
            "WebSocket proxy listening"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, context).await {
                                    debug!(addr = %addr, error = %e, "Proxy connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept proxy connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    mut client: TcpStream,
    addr: SocketAddr,
    context: Arc<ProxyContext>,
) -> io::Result<()> {
    let metrics = &context.metrics;
    metrics.proxy_connections.inc();
    let conn_id = Uuid::new_v4().to_string();
    let handshake_timeout = context.config.handshake_timeout();

    let read = tokio::time::timeout(handshake_timeout, read_head(&mut client, MAX_HEAD_SIZE)).await;
    let (head, client_rest) = match read {
        Ok(Ok(HeadRead::Complete { head, rest })) => (head, rest),
        Ok(Ok(HeadRead::Closed)) => return Ok(()),
        Ok(Ok(HeadRead::TooLarge)) => {
            metrics.proxy_rejected.inc();
            return reject(&mut client, StatusCode::BAD_REQUEST).await;
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            debug!(addr = %addr, %conn_id, "Client sent no request head in time");
            return Ok(());
        }
    };

    let Some(request) = RequestHead::parse(&head) else {
        metrics.proxy_rejected.inc();
        return reject(&mut client, StatusCode::BAD_REQUEST).await;
    };

    if !request.is_upgrade() {
        debug!(addr = %addr, %conn_id, request_target = %request.target, "Not an upgrade request");
        metrics.proxy_rejected.inc();
        return reject(&mut client, StatusCode::BAD_REQUEST).await;
    }

    let Some(port) = request.routed_port(&context.config.port_header) else {
        debug!(addr = %addr, %conn_id, "Missing or invalid routing header");
        metrics.proxy_rejected.inc();
        return reject(&mut client, StatusCode::BAD_REQUEST).await;
    };

    if !context.gate.is_known_port(port) {
        debug!(addr = %addr, %conn_id, port, "No instance on requested port");
        metrics.proxy_rejected.inc();
        return reject(&mut client, StatusCode::NOT_FOUND).await;
    }

    let upstream_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let connect = tokio::time::timeout(
        context.config.connect_timeout(),
        TcpStream::connect(upstream_addr),
    )
    .await;
    let mut upstream = match connect {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(%conn_id, port, error = %e, "Failed to connect to instance");
            metrics.proxy_upstream_failures.inc();
            return reject(&mut client, StatusCode::BAD_GATEWAY).await;
        }
        Err(_) => {
            warn!(%conn_id, port, "Timed out connecting to instance");
            metrics.proxy_upstream_failures.inc();
            return reject(&mut client, StatusCode::BAD_GATEWAY).await;
        }
    };
    let _ = upstream.set_nodelay(true);

    let mut forwarded = request.to_upstream(port, &context.config.port_header);
    forwarded.extend_from_slice(&client_rest);
    if let Err(status) = send_upgrade(&mut upstream, &forwarded).await {
        warn!(%conn_id, port, "Failed to send upgrade request to instance");
        metrics.proxy_upstream_failures.inc();
        return reject(&mut client, status).await;
    }

    let read = tokio::time::timeout(handshake_timeout, read_head(&mut upstream, MAX_HEAD_SIZE)).await;
    let (response, upstream_rest) = match read {
        Ok(Ok(HeadRead::Complete { head, rest })) => (head, rest),
        _ => {
            warn!(%conn_id, port, "Instance did not answer the upgrade");
            metrics.proxy_upstream_failures.inc();
            return reject(&mut client, StatusCode::BAD_GATEWAY).await;
        }
    };

    match parse_status(&response) {
        Some(101) => {}
        status => {
            warn!(%conn_id, port, ?status, "Instance refused the upgrade");
            metrics.proxy_upstream_failures.inc();
            return reject(&mut client, StatusCode::BAD_GATEWAY).await;
        }
    }

    let mut reply = Vec::with_capacity(response.len() + upstream_rest.len());
    reply.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    reply.extend_from_slice(header_lines(&response));
    reply.extend_from_slice(b"\r\n");
    reply.extend_from_slice(&upstream_rest);
    client.write_all(&reply).await?;

    debug!(addr = %addr, %conn_id, port, "Upgrade successful, splicing");
    metrics.proxy_active.inc();
    let result = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    metrics.proxy_active.dec();

    match result {
        Ok((to_upstream, to_client)) => {
            metrics.proxy_bytes_to_upstream.inc_by(to_upstream);
            metrics.proxy_bytes_to_client.inc_by(to_client);
            debug!(%conn_id, port, to_upstream, to_client, "Proxy connection closed");
        }
        Err(e) => {
            debug!(%conn_id, port, error = %e, "Proxy connection ended with error");
        }
    }
    Ok(())
}

/// Write the rewritten head, plus any early client bytes, to the instance
async fn send_upgrade<W>(upstream: &mut W, forwarded: &[u8]) -> Result<(), StatusCode>
where
    W: AsyncWrite + Unpin,
{
    let sent = async {
        upstream.write_all(forwarded).await?;
        upstream.flush().await
    };
    sent.await.map_err(|e: io::Error| {
        debug!(error = %e, "Upstream write failed");
        StatusCode::BAD_GATEWAY
    })
}

/// Answer with a bare status line and close
async fn reject(client: &mut TcpStream, status: StatusCode) -> io::Result<()> {
    client.write_all(&rejection(status)).await?;
    client.shutdown().await
}

fn rejection(status: StatusCode) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nDate: {}\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        http_date()
    )
    .into_bytes()
}

/// Current time in IMF-fixdate form
pub fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

#[derive(Debug, PartialEq, Eq)]
enum HeadRead {
    /// Full head including the blank line, plus anything read past it
    Complete { head: Vec<u8>, rest: Vec<u8> },
    /// Peer closed before sending a full head
    Closed,
    TooLarge,
}

async fn read_head<S>(stream: &mut S, limit: usize) -> io::Result<HeadRead>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(HeadRead::Closed);
        }
        let search_from = buf.len().saturating_sub(3);
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = find_head_end(&buf[search_from..]) {
            let end = search_from + pos + 4;
            if end > limit {
                return Ok(HeadRead::TooLarge);
            }
            let rest = buf.split_off(end);
            return Ok(HeadRead::Complete { head: buf, rest });
        }
        if buf.len() > limit {
            return Ok(HeadRead::TooLarge);
        }
    }
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// A parsed client request head
#[derive(Debug, Clone, PartialEq, Eq)]
struct RequestHead {
    method: String,
    target: String,
    version: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    fn parse(data: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(data).ok()?;
        let mut lines = text.split("\r\n");

        let mut request_line = lines.next()?.split(' ');
        let method = request_line.next().filter(|m| !m.is_empty())?.to_string();
        let target = request_line.next().filter(|t| !t.is_empty())?.to_string();
        let version = request_line.next().filter(|v| v.starts_with("HTTP/"))?.to_string();

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':')?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Some(Self {
            method,
            target,
            version,
            headers,
        })
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn is_upgrade(&self) -> bool {
        let has_upgrade = self.header("upgrade").is_some_and(|v| !v.is_empty());
        let connection_upgrade = self.header("connection").is_some_and(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        });
        has_upgrade && connection_upgrade
    }

    fn routed_port(&self, header: &str) -> Option<u16> {
        self.header(header)?
            .parse::<u16>()
            .ok()
            .filter(|p| *p > 0)
    }

    /// Head to send to the instance
    fn to_upstream(&self, port: u16, port_header: &str) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, self.target, self.version);
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case(port_header) {
                continue;
            }
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str(&format!("Host: localhost:{}\r\n\r\n", port));
        out.into_bytes()
    }
}

/// Status code from a response head
fn parse_status(head: &[u8]) -> Option<u16> {
    let line_end = find_line_end(head)?;
    let status_line = std::str::from_utf8(&head[..line_end]).ok()?;
    let mut parts = status_line.splitn(3, ' ');
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

/// Header lines of a response head, each with its CRLF, without the
/// status line or the terminating blank line
fn header_lines(head: &[u8]) -> &[u8] {
    let Some(line_end) = find_line_end(head) else {
        return &[];
    };
    let start = line_end + 2;
    let end = head.len().saturating_sub(2);
    if start >= end {
        return &[];
    }
    &head[start..end]
}

fn find_line_end(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}
