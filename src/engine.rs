//! The instance engine seam
//!
//! The supervisor never looks inside an instance. It hands the engine a typed
//! [`InstanceConfig`] plus a [`PeerSink`], and gets back an [`InstanceHandle`]
//! that occupies a local port and can be stopped.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Everything an engine needs to bring up one topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    pub topic: String,
    /// Local port the instance must bind
    pub port: u16,
    /// Storage directory owned by the instance
    pub storage_path: PathBuf,
    /// Multiaddrs to listen on
    pub listen_addrs: Vec<String>,
    /// Multiaddrs to advertise to peers
    pub announce_addrs: Vec<String>,
}

impl InstanceConfig {
    /// Build listen and announce addresses for `port`
    ///
    /// Without a public hostname everything stays on loopback. With one, the
    /// instance listens on all interfaces and announces the public name over
    /// `wss`, plus the private address when known.
    pub fn new(
        topic: &str,
        port: u16,
        storage_path: PathBuf,
        public_hostname: Option<&str>,
        private_address: Option<&str>,
    ) -> Self {
        let (listen_addrs, announce_addrs) = match public_hostname {
            None => {
                let local = format!("/ip4/127.0.0.1/tcp/{}/ws", port);
                (vec![local.clone()], vec![local])
            }
            Some(hostname) => {
                let mut announce = vec![format!("/dns4/{}/tcp/{}/wss", hostname, port)];
                if let Some(private) = private_address {
                    announce.push(format!("/ip6/{}/tcp/{}/ws", private, port));
                }
                (vec![format!("/ip6/::/tcp/{}/ws", port)], announce)
            }
        };

        Self {
            topic: topic.to_string(),
            port,
            storage_path,
            listen_addrs,
            announce_addrs,
        }
    }

    /// Check the config before it is handed to an engine
    pub fn validate(&self) -> Result<(), String> {
        if self.topic.is_empty() {
            return Err("topic must not be empty".to_string());
        }
        if self.port == 0 {
            return Err(format!("'{}': port must be greater than 0", self.topic));
        }
        if self.listen_addrs.is_empty() {
            return Err(format!("'{}': at least one listen address required", self.topic));
        }
        let suffix = format!("/tcp/{}/", self.port);
        if let Some(addr) = self
            .listen_addrs
            .iter()
            .chain(&self.announce_addrs)
            .find(|a| !a.contains(&suffix))
        {
            return Err(format!(
                "'{}': address {} does not use port {}",
                self.topic, addr, self.port
            ));
        }
        if self.storage_path.file_name().and_then(|n| n.to_str()) != Some(self.topic.as_str()) {
            return Err(format!(
                "'{}': storage path {} is not the topic's directory",
                self.topic,
                self.storage_path.display()
            ));
        }
        Ok(())
    }
}

/// Where an engine reports how many peers an instance has
///
/// Cloned into the engine at initialize time; the supervisor reads the
/// latest value from its activity tick.
#[derive(Debug, Clone, Default)]
pub struct PeerSink {
    count: Arc<AtomicUsize>,
}

impl PeerSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_peer_count_changed(&self, count: usize) {
        self.count.store(count, Ordering::Release);
    }

    /// Last reported peer count
    pub fn last_peer_count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

/// A running instance
#[async_trait]
pub trait InstanceHandle: Send + Sync {
    /// Release the instance's sockets, storage handles and processes
    async fn stop(&self) -> anyhow::Result<()>;

    /// Addresses the instance can be reached on
    fn listen_addrs(&self) -> Vec<String>;

    /// Local HTTP API of the instance, if it serves one
    fn api_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Starts instances
#[async_trait]
pub trait InstanceEngine: Send + Sync + 'static {
    async fn initialize(
        &self,
        config: InstanceConfig,
        peers: PeerSink,
    ) -> anyhow::Result<Box<dyn InstanceHandle>>;
}
