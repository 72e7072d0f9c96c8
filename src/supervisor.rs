//! The instance supervisor
//!
//! Owns the registry, ban set and port cursor. Every structural change
//! (start, stop, ban, the final drain) runs as a task on one [`TaskQueue`],
//! so registry mutation never races with itself.
//!
//! # Usage
//!
//! `Supervisor` is shared behind an `Arc`; [`new`](Supervisor::new) returns
//! `Arc<Self>` and must be called inside a tokio runtime because it spawns
//! the queue worker and the idle watchdog.
//!
//! ```ignore
//! let supervisor = Supervisor::new(&config, engine);
//! let info = supervisor.start("hello-world").await?;
//! ```

use crate::allocator::PortAllocator;
use crate::config::{Config, SupervisorConfig};
use crate::engine::{InstanceConfig, InstanceEngine, PeerSink};
use crate::error::{Result, SupervisorError};
use crate::metrics::Metrics;
use crate::queue::TaskQueue;
use crate::registry::{InstanceRecord, Registry};
use crate::watchdog;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Upper bound on a single instance stop while closing
const CLOSE_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest topic accepted (it becomes a directory name)
const MAX_TOPIC_LEN: usize = 255;

/// What callers learn about a running instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceInfo {
    pub topic: String,
    #[serde(skip_serializing)]
    pub port: u16,
    pub addrs: Vec<String>,
}

impl InstanceInfo {
    fn from_record(record: &InstanceRecord) -> Self {
        Self {
            topic: record.topic().to_string(),
            port: record.port(),
            addrs: record.handle().listen_addrs(),
        }
    }
}

/// Status line for the admin listing
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub topic: String,
    pub port: u16,
    pub peers: usize,
    pub idle_secs: u64,
    pub uptime_secs: u64,
}

/// Check a topic before it is used as a key and a directory name
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(SupervisorError::BadRequest("topic must not be empty".to_string()));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(SupervisorError::BadRequest(format!(
            "topic longer than {} bytes",
            MAX_TOPIC_LEN
        )));
    }
    if topic == "." || topic == ".." {
        return Err(SupervisorError::BadRequest(format!("invalid topic '{}'", topic)));
    }
    if !topic
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(SupervisorError::BadRequest(format!(
            "topic '{}' may only contain ASCII letters, digits, '-', '_' and '.'",
            topic
        )));
    }
    Ok(())
}

pub struct Supervisor {
    config: SupervisorConfig,
    public_hostname: Option<String>,
    private_address: Option<String>,
    engine: Arc<dyn InstanceEngine>,
    registry: Arc<Registry>,
    banned: RwLock<HashSet<String>>,
    /// Only touched from queue tasks
    allocator: Mutex<PortAllocator>,
    queue: TaskQueue,
    metrics: Arc<Metrics>,
    closing: AtomicBool,
    closed: OnceCell<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl Supervisor {
    pub fn new(config: &Config, engine: Arc<dyn InstanceEngine>) -> Arc<Self> {
        let sup = config.supervisor.clone();
        let banned: HashSet<String> = if sup.banning {
            sup.banned_topics.iter().cloned().collect()
        } else {
            HashSet::new()
        };
        let (shutdown_tx, _) = watch::channel(false);

        let supervisor = Arc::new(Self {
            allocator: Mutex::new(PortAllocator::new(sup.start_port, sup.end_port)),
            public_hostname: config.server.public_hostname.clone(),
            private_address: config.server.private_address.clone(),
            engine,
            registry: Arc::new(Registry::new()),
            banned: RwLock::new(banned),
            queue: TaskQueue::new(),
            metrics: Arc::new(Metrics::new()),
            closing: AtomicBool::new(false),
            closed: OnceCell::new(),
            shutdown_tx,
            config: sup,
        });

        if let Some(timeout) = supervisor.config.sleep_timeout() {
            info!(
                sleep_timeout_ms = timeout.as_millis() as u64,
                "Instances will sleep after inactivity"
            );
            watchdog::spawn(
                Arc::downgrade(&supervisor),
                timeout,
                supervisor.config.watchdog_interval(),
                supervisor.subscribe_shutdown(),
            );
        } else {
            info!("Idle eviction disabled");
        }

        supervisor
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Receiver flipped to `true` once [`close`](Self::close) has finished
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Whether `port` belongs to a running instance
    pub fn is_known_port(&self, port: u16) -> bool {
        self.registry.is_known_port(port)
    }

    pub fn is_banned(&self, topic: &str) -> bool {
        self.banned.read().contains(topic)
    }

    /// Info for a running topic, without starting it
    pub fn info(&self, topic: &str) -> Option<InstanceInfo> {
        self.registry.get(topic).map(|r| InstanceInfo::from_record(&r))
    }

    /// All running instances, sorted by topic
    pub fn list(&self) -> Vec<InstanceStatus> {
        let mut list: Vec<InstanceStatus> = self
            .registry
            .records()
            .iter()
            .map(|r| InstanceStatus {
                topic: r.topic().to_string(),
                port: r.port(),
                peers: r.peer_count(),
                idle_secs: r.idle_for().as_secs(),
                uptime_secs: r.uptime().as_secs(),
            })
            .collect();
        list.sort_by(|a, b| a.topic.cmp(&b.topic));
        list
    }

    /// Peer count reported from outside the process (control callback)
    pub fn peer_count_changed(&self, topic: &str, count: usize) -> Result<()> {
        let record = self
            .registry
            .get(topic)
            .ok_or_else(|| SupervisorError::NotFound(topic.to_string()))?;
        record.peers().on_peer_count_changed(count);
        if count > 0 {
            record.touch();
        }
        debug!(topic, count, "Peer count changed");
        Ok(())
    }

    /// Start `topic` if it is not running and return its addresses
    pub async fn start(self: &Arc<Self>, topic: &str) -> Result<InstanceInfo> {
        validate_topic(topic)?;
        if self.is_closing() {
            return Err(SupervisorError::ShuttingDown);
        }

        let this = Arc::clone(self);
        let topic = topic.to_string();
        self.queue.run(async move { this.start_task(&topic).await }).await?
    }

    /// Stop a running topic
    pub async fn stop(self: &Arc<Self>, topic: &str) -> Result<()> {
        let this = Arc::clone(self);
        let topic = topic.to_string();
        self.queue.run(async move { this.stop_task(&topic).await }).await?
    }

    /// Ban `topic`, stopping it if it is running
    ///
    /// Never fails: a missing instance or a failing stop is only logged.
    pub async fn ban(self: &Arc<Self>, topic: &str) {
        if !self.config.banning {
            debug!(topic, "Banning disabled, ignoring ban");
            return;
        }
        if !self.banned.write().insert(topic.to_string()) {
            return;
        }
        self.metrics.topics_banned.inc();
        info!(topic, "Topic banned");

        let this = Arc::clone(self);
        let owned = topic.to_string();
        let result = self
            .queue
            .run(async move {
                if this.registry.contains(&owned) {
                    this.stop_task(&owned).await
                } else {
                    Ok(())
                }
            })
            .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) | Err(e) => warn!(topic, error = %e, "Failed to stop banned topic"),
        }
    }

    /// Admin hook for an external finished-work source
    pub async fn notify_completed(self: &Arc<Self>, topic: &str) {
        self.ban(topic).await;
    }

    /// Drain the queue, stop every instance and signal shutdown
    ///
    /// Idempotent: concurrent and repeated calls all wait for the same drain.
    pub async fn close(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.closed.get_or_init(|| this.close_inner()).await;
    }

    async fn close_inner(self: Arc<Self>) {
        self.closing.store(true, Ordering::Release);

        info!(pending = self.queue.pending(), "Waiting for queue to clear");
        self.queue.on_idle().await;

        info!(count = self.registry.len(), "Stopping running instances");
        let this = Arc::clone(&self);
        if let Err(e) = self.queue.run(async move { this.stop_all_task().await }).await {
            error!(error = %e, "Failed to stop instances");
        }

        let _ = self.shutdown_tx.send(true);
        info!("Supervisor closed");
    }

    async fn start_task(&self, topic: &str) -> Result<InstanceInfo> {
        if let Some(record) = self.registry.get(topic) {
            return Ok(InstanceInfo::from_record(&record));
        }

        if self.is_banned(topic) {
            warn!(topic, "Refusing to start banned topic");
            return Err(SupervisorError::Forbidden(topic.to_string()));
        }

        if self.is_closing() {
            return Err(SupervisorError::ShuttingDown);
        }

        let port = self
            .allocator
            .lock()
            .allocate(|p| self.registry.is_known_port(p))?;

        let storage_path = self.config.data_root.join(topic);
        let init_failed = |source: anyhow::Error| SupervisorError::InitializationFailed {
            topic: topic.to_string(),
            source,
        };

        if let Err(e) = tokio::fs::create_dir_all(&storage_path).await {
            self.metrics.start_failures.inc();
            error!(topic, path = %storage_path.display(), error = %e, "Failed to create storage directory");
            return Err(init_failed(e.into()));
        }

        let instance_config = InstanceConfig::new(
            topic,
            port,
            storage_path,
            self.public_hostname.as_deref(),
            self.private_address.as_deref(),
        );
        instance_config
            .validate()
            .map_err(|e| init_failed(anyhow::anyhow!(e)))?;

        debug!(topic, port, "Initializing instance");
        let peers = PeerSink::new();
        let handle = match self.engine.initialize(instance_config, peers.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                self.metrics.start_failures.inc();
                error!(topic, port, error = %e, "Failed to initialize instance");
                return Err(init_failed(e));
            }
        };

        let record = Arc::new(self.registry.new_record(topic, port, handle, peers));
        record.set_activity_task(spawn_activity_tick(
            Arc::downgrade(&record),
            self.config.activity_interval(),
        ));
        self.registry.insert(Arc::clone(&record));

        self.metrics.instances_started.inc();
        self.metrics.instances_running.inc();
        info!(topic, port, "Started instance");

        Ok(InstanceInfo::from_record(&record))
    }

    async fn stop_task(&self, topic: &str) -> Result<()> {
        let record = self
            .registry
            .get(topic)
            .ok_or_else(|| SupervisorError::NotFound(topic.to_string()))?;

        if let Err(e) = record.handle().stop().await {
            warn!(topic, error = %e, "Instance did not stop cleanly");
        }
        record.cancel_activity_task();
        self.registry.remove(topic);

        self.metrics.instances_stopped.inc();
        self.metrics.instances_running.dec();
        info!(topic, port = record.port(), "Stopped instance");
        Ok(())
    }

    async fn stop_all_task(&self) {
        let records = self.registry.records();
        let stops = records.iter().map(|record| async move {
            let result = tokio::time::timeout(CLOSE_STOP_TIMEOUT, record.handle().stop()).await;
            record.cancel_activity_task();
            self.registry.remove(record.topic());
            self.metrics.instances_stopped.inc();
            self.metrics.instances_running.dec();
            (record.topic(), result)
        });

        for (topic, result) in futures::future::join_all(stops).await {
            match result {
                Ok(Ok(())) => info!(topic, "Stopped instance"),
                Ok(Err(e)) => warn!(topic, error = %e, "Instance did not stop cleanly"),
                Err(_) => warn!(
                    topic,
                    timeout_secs = CLOSE_STOP_TIMEOUT.as_secs(),
                    "Instance stop timed out"
                ),
            }
        }
    }

    /// Queue an idle eviction for `topic`
    pub(crate) fn enqueue_eviction(self: &Arc<Self>, record: &InstanceRecord, timeout: Duration) {
        let this = Arc::clone(self);
        let topic = record.topic().to_string();
        let queued = self.queue.enqueue(async move {
            this.evict_task(&topic, timeout).await;
        });
        if let Err(e) = queued {
            record.cancel_eviction();
            debug!(topic = record.topic(), error = %e, "Could not queue eviction");
        }
    }

    async fn evict_task(&self, topic: &str, timeout: Duration) {
        let Some(record) = self.registry.get(topic) else {
            debug!(topic, "Instance already gone before eviction");
            return;
        };
        // peers may have reconnected while the task waited
        if record.idle_for() <= timeout {
            record.cancel_eviction();
            return;
        }

        match self.stop_task(topic).await {
            Ok(()) => self.metrics.instances_evicted.inc(),
            Err(e) => debug!(topic, error = %e, "Eviction stop failed"),
        }
    }
}

/// Refresh `last_active` while the instance has peers
fn spawn_activity_tick(record: Weak<InstanceRecord>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(record) = record.upgrade() else {
                break;
            };
            if record.peer_count() > 0 {
                record.touch();
            }
        }
    })
}
