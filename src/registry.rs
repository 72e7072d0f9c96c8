//! Topic ↔ instance bookkeeping
//!
//! Two concurrent maps: topic → record and port → topic. Readers (the proxy's
//! gate check, the watchdog, the control server) may look at them at any
//! time; only supervisor queue tasks insert or remove.

use crate::engine::{InstanceHandle, PeerSink};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// One running topic
pub struct InstanceRecord {
    topic: String,
    port: u16,
    handle: Box<dyn InstanceHandle>,
    peers: PeerSink,
    epoch: Instant,
    started_at_ms: u64,
    /// Milliseconds since the registry epoch
    last_active_ms: AtomicU64,
    evicting: AtomicBool,
    activity_task: Mutex<Option<JoinHandle<()>>>,
}

impl InstanceRecord {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn handle(&self) -> &dyn InstanceHandle {
        self.handle.as_ref()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.last_peer_count()
    }

    pub fn peers(&self) -> &PeerSink {
        &self.peers
    }

    /// Record activity now
    pub fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_active_ms.fetch_max(now, Ordering::AcqRel);
    }

    /// Time since the instance last had a peer (or started)
    pub fn idle_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_active_ms.load(Ordering::Acquire)))
    }

    pub fn uptime(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.started_at_ms))
    }

    /// Mark the record as scheduled for eviction; false if it already was
    pub fn begin_eviction(&self) -> bool {
        !self.evicting.swap(true, Ordering::AcqRel)
    }

    /// Allow the watchdog to schedule eviction again
    pub fn cancel_eviction(&self) {
        self.evicting.store(false, Ordering::Release);
    }

    pub(crate) fn set_activity_task(&self, task: JoinHandle<()>) {
        if let Some(old) = self.activity_task.lock().replace(task) {
            old.abort();
        }
    }

    pub(crate) fn cancel_activity_task(&self) {
        if let Some(task) = self.activity_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for InstanceRecord {
    fn drop(&mut self) {
        self.cancel_activity_task();
    }
}

/// The set of running instances
pub struct Registry {
    instances: DashMap<String, Arc<InstanceRecord>>,
    ports: DashMap<u16, String>,
    epoch: Instant,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
            ports: DashMap::new(),
            epoch: Instant::now(),
        }
    }

    /// Build a record stamped active as of now
    pub fn new_record(
        &self,
        topic: &str,
        port: u16,
        handle: Box<dyn InstanceHandle>,
        peers: PeerSink,
    ) -> InstanceRecord {
        let now = self.epoch.elapsed().as_millis() as u64;
        InstanceRecord {
            topic: topic.to_string(),
            port,
            handle,
            peers,
            epoch: self.epoch,
            started_at_ms: now,
            last_active_ms: AtomicU64::new(now),
            evicting: AtomicBool::new(false),
            activity_task: Mutex::new(None),
        }
    }

    pub fn get(&self, topic: &str) -> Option<Arc<InstanceRecord>> {
        self.instances.get(topic).map(|r| Arc::clone(r.value()))
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.instances.contains_key(topic)
    }

    /// Whether `port` belongs to a running instance
    pub fn is_known_port(&self, port: u16) -> bool {
        self.ports.contains_key(&port)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Snapshot of all records
    pub fn records(&self) -> Vec<Arc<InstanceRecord>> {
        self.instances.iter().map(|r| Arc::clone(r.value())).collect()
    }

    pub(crate) fn insert(&self, record: Arc<InstanceRecord>) {
        self.ports.insert(record.port, record.topic.clone());
        self.instances.insert(record.topic.clone(), record);
    }

    pub(crate) fn remove(&self, topic: &str) -> Option<Arc<InstanceRecord>> {
        let (_, record) = self.instances.remove(topic)?;
        self.ports.remove_if(&record.port, |_, t| t == topic);
        Some(record)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
