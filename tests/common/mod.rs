//! Shared helpers for integration tests
//!
//! `MockEngine` starts a real listener per topic that accepts WebSocket
//! handshakes and echoes every byte afterwards. Plain HTTP requests get a
//! small text reply naming the topic and the request target, which is enough
//! to exercise the API passthrough.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::Engine as _;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use topicgate::config::Config;
use topicgate::engine::{InstanceConfig, InstanceEngine, InstanceHandle, PeerSink};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Default)]
pub struct MockEngine {
    pub initialized: AtomicUsize,
    pub stopped: Arc<AtomicUsize>,
    pub init_delay: Duration,
    pub failing: Mutex<HashSet<String>>,
    /// Request heads received by any instance, in arrival order
    pub requests: Arc<Mutex<Vec<String>>>,
    pub sinks: Mutex<Vec<(String, PeerSink)>>,
    /// Report an API address nothing listens on
    pub api_down: AtomicBool,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            init_delay: delay,
            ..Self::default()
        })
    }

    pub fn fail_topic(&self, topic: &str) {
        self.failing.lock().insert(topic.to_string());
    }

    pub fn take_api_down(&self) {
        self.api_down.store(true, Ordering::SeqCst);
    }

    pub fn initialized(&self) -> usize {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn sink(&self, topic: &str) -> Option<PeerSink> {
        self.sinks
            .lock()
            .iter()
            .rev()
            .find(|(t, _)| t == topic)
            .map(|(_, s)| s.clone())
    }
}

pub struct MockHandle {
    addrs: Vec<String>,
    api_addr: SocketAddr,
    server: Mutex<Option<JoinHandle<()>>>,
    stopped: Arc<AtomicUsize>,
}

#[async_trait]
impl InstanceHandle for MockHandle {
    async fn stop(&self) -> anyhow::Result<()> {
        let server = self.server.lock().take();
        if let Some(server) = server {
            server.abort();
            let _ = server.await;
        }
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn listen_addrs(&self) -> Vec<String> {
        self.addrs.clone()
    }

    fn api_addr(&self) -> Option<SocketAddr> {
        Some(self.api_addr)
    }
}

#[async_trait]
impl InstanceEngine for MockEngine {
    async fn initialize(
        &self,
        config: InstanceConfig,
        peers: PeerSink,
    ) -> anyhow::Result<Box<dyn InstanceHandle>> {
        if !self.init_delay.is_zero() {
            tokio::time::sleep(self.init_delay).await;
        }
        if self.failing.lock().contains(&config.topic) {
            anyhow::bail!("mock engine refuses '{}'", config.topic);
        }

        let listener = TcpListener::bind(("127.0.0.1", config.port)).await?;
        let api_addr = if self.api_down.load(Ordering::SeqCst) {
            let unused = TcpListener::bind("127.0.0.1:0").await?;
            unused.local_addr()?
        } else {
            listener.local_addr()?
        };
        let topic = config.topic.clone();
        let requests = Arc::clone(&self.requests);

        let server = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let topic = topic.clone();
                let requests = Arc::clone(&requests);
                tokio::spawn(serve_mock_connection(stream, topic, requests));
            }
        });

        self.initialized.fetch_add(1, Ordering::SeqCst);
        self.sinks.lock().push((config.topic.clone(), peers));

        Ok(Box::new(MockHandle {
            addrs: config.listen_addrs,
            api_addr,
            server: Mutex::new(Some(server)),
            stopped: Arc::clone(&self.stopped),
        }))
    }
}

async fn serve_mock_connection(
    mut stream: TcpStream,
    topic: String,
    requests: Arc<Mutex<Vec<String>>>,
) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let rest = buf[head_end..].to_vec();
    requests.lock().push(head.clone());

    let key = header_value(&head, "sec-websocket-key");
    match key {
        Some(key) => {
            let reply = format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {}\r\n\r\n",
                accept_key(&key)
            );
            if stream.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
            if !rest.is_empty() && stream.write_all(&rest).await.is_err() {
                return;
            }
            let (mut reader, mut writer) = stream.split();
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        }
        None => {
            let target = head
                .lines()
                .next()
                .and_then(|l| l.split(' ').nth(1))
                .unwrap_or("/")
                .to_string();
            let body = format!("{} {}", topic, target);
            let reply = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(reply.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    }
}

pub fn header_value(head: &str, name: &str) -> Option<String> {
    head.lines().find_map(|line| {
        let (n, v) = line.split_once(':')?;
        n.trim()
            .eq_ignore_ascii_case(name)
            .then(|| v.trim().to_string())
    })
}

pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

static NEXT_PORT: AtomicU16 = AtomicU16::new(0);

/// A run of `count` consecutive ports that are currently free
pub async fn free_port_range(count: u16) -> (u16, u16) {
    let base = 20_000 + (std::process::id() % 200) as u16 * 100;
    loop {
        let offset = NEXT_PORT.fetch_add(count, Ordering::SeqCst) % 20_000;
        let start = base + offset;
        let end = start + count - 1;

        let mut all_free = true;
        for port in start..=end {
            if TcpListener::bind(("127.0.0.1", port)).await.is_err() {
                all_free = false;
                break;
            }
        }
        if all_free {
            return (start, end);
        }
    }
}

/// Config with a private port range and data root, eviction off
pub async fn test_config(data_root: &Path, ports: u16) -> Config {
    let (start, end) = free_port_range(ports).await;
    let mut config = Config::default();
    config.server.bind = "127.0.0.1".to_string();
    config.server.admin_token = Some("test-token".to_string());
    config.supervisor.start_port = start;
    config.supervisor.end_port = end;
    config.supervisor.data_root = data_root.to_path_buf();
    config.supervisor.sleep_timeout_ms = 0;
    config.proxy.connect_timeout_ms = 1000;
    config.proxy.handshake_timeout_ms = 2000;
    config
}

/// Send `request` and read until the peer closes
pub async fn raw_exchange(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(request.as_bytes()).await.expect("write");
    let mut response = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response)).await;
    String::from_utf8_lossy(&response).to_string()
}

/// HTTP/1.1 GET with `Connection: close`
pub async fn http_get(addr: SocketAddr, path: &str, token: Option<&str>) -> String {
    let auth = token
        .map(|t| format!("Authorization: Bearer {}\r\n", t))
        .unwrap_or_default();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\n{}Connection: close\r\n\r\n",
        path, addr, auth
    );
    raw_exchange(addr, &request).await
}

/// HTTP/1.1 POST with a text body
pub async fn http_post(addr: SocketAddr, path: &str, body: &str, token: Option<&str>) -> String {
    let auth = token
        .map(|t| format!("Authorization: Bearer {}\r\n", t))
        .unwrap_or_default();
    let request = format!(
        "POST {} HTTP/1.1\r\nHost: {}\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        path,
        addr,
        auth,
        body.len(),
        body
    );
    raw_exchange(addr, &request).await
}

/// Body of a raw HTTP response
pub fn body_of(response: &str) -> &str {
    response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .unwrap_or("")
}
