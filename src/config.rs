use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the supervisor
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and admin settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Instance lifecycle settings
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Reverse proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// How instances are run
    #[serde(default)]
    pub engine: EngineConfig,

    /// External finished-work list
    #[serde(default)]
    pub completed: CompletedConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the control and proxy listeners (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the control endpoint (default: 3000)
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Port for the WebSocket proxy (disabled when unset)
    pub proxy_port: Option<u16>,

    /// Authentication token for admin endpoints
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Externally reachable hostname used in announce addresses
    pub public_hostname: Option<String>,

    /// Private network address announced alongside the public one
    pub private_address: Option<String>,

    /// Maximum idle API passthrough connections per instance (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle API passthrough connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            control_port: default_control_port(),
            proxy_port: None,
            admin_token: None,
            public_hostname: None,
            private_address: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// First port handed to instances (inclusive)
    #[serde(default = "default_start_port")]
    pub start_port: u16,

    /// Last port handed to instances (inclusive)
    #[serde(default = "default_end_port")]
    pub end_port: u16,

    /// Directory holding one storage subdirectory per topic
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Inactivity in milliseconds before an instance is stopped (0 disables)
    #[serde(default = "default_sleep_timeout")]
    pub sleep_timeout_ms: u64,

    /// Enable idle eviction
    #[serde(default = "default_true")]
    pub idle_eviction: bool,

    /// Enable banning
    #[serde(default = "default_true")]
    pub banning: bool,

    /// Topics banned from startup
    #[serde(default)]
    pub banned_topics: Vec<String>,

    /// Idle watchdog tick in milliseconds
    #[serde(default = "default_tick")]
    pub watchdog_interval_ms: u64,

    /// Per-instance activity tick in milliseconds
    #[serde(default = "default_tick")]
    pub activity_interval_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            start_port: default_start_port(),
            end_port: default_end_port(),
            data_root: default_data_root(),
            sleep_timeout_ms: default_sleep_timeout(),
            idle_eviction: true,
            banning: true,
            banned_topics: Vec::new(),
            watchdog_interval_ms: default_tick(),
            activity_interval_ms: default_tick(),
        }
    }
}

impl SupervisorConfig {
    /// Idle threshold, `None` when eviction is off
    pub fn sleep_timeout(&self) -> Option<Duration> {
        if !self.idle_eviction || self.sleep_timeout_ms == 0 {
            return None;
        }
        Some(Duration::from_millis(self.sleep_timeout_ms))
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms.max(1))
    }

    pub fn activity_interval(&self) -> Duration {
        Duration::from_millis(self.activity_interval_ms.max(1))
    }

    /// Number of ports in the range
    pub fn range_size(&self) -> usize {
        (self.end_port as usize + 1).saturating_sub(self.start_port as usize)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Header naming the instance port a connection is for
    #[serde(default = "default_port_header")]
    pub port_header: String,

    /// Upstream connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Timeout for reading request and upstream handshake heads in milliseconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port_header: default_port_header(),
            connect_timeout_ms: default_connect_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
        }
    }
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Configuration for the process engine
///
/// # Security Warning
///
/// `command` and `args` are executed directly for every topic that is
/// started. Configuration files must be protected with appropriate file
/// permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Command run once per topic
    pub command: Option<String>,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Whether instances serve their HTTP API on their own port
    #[serde(default)]
    pub expose_api: bool,

    /// Seconds to wait for an instance to accept connections
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            expose_api: false,
            startup_timeout_secs: default_startup_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

impl EngineConfig {
    /// Create an engine config running `command`
    pub fn command(command: &str) -> Self {
        Self {
            command: Some(command.to_string()),
            ..Self::default()
        }
    }

    /// Set arguments (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletedConfig {
    /// URL listing finished topics (poller disabled when unset)
    pub url: Option<String>,

    /// Seconds between polls
    #[serde(default = "default_completed_interval")]
    pub interval_secs: u64,
}

impl Default for CompletedConfig {
    fn default() -> Self {
        Self {
            url: None,
            interval_secs: default_completed_interval(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_control_port() -> u16 {
    3000
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_start_port() -> u16 {
    9000
}

fn default_end_port() -> u16 {
    9999
}

fn default_data_root() -> PathBuf {
    PathBuf::from("./data")
}

fn default_sleep_timeout() -> u64 {
    15_000 // 15 seconds
}

fn default_true() -> bool {
    true
}

fn default_tick() -> u64 {
    1000
}

fn default_port_header() -> String {
    "fly-forwarded-port".to_string()
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_handshake_timeout() -> u64 {
    10_000
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_shutdown_grace_period() -> u64 {
    10
}

fn default_completed_interval() -> u64 {
    60
}

impl Config {
    /// Load from a TOML file; a missing file yields the defaults
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config: Config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> anyhow::Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid value for {}: {:?}", key, value))
        }

        if let Some(v) = lookup("PORT") {
            self.server.control_port = parse("PORT", v)?;
        }
        if let Some(v) = lookup("PROXY_PORT") {
            self.server.proxy_port = Some(parse("PROXY_PORT", v)?);
        }
        if let Some(v) = lookup("START_PORT") {
            self.supervisor.start_port = parse("START_PORT", v)?;
        }
        if let Some(v) = lookup("END_PORT") {
            self.supervisor.end_port = parse("END_PORT", v)?;
        }
        if let Some(v) = lookup("DATA_ROOT") {
            self.supervisor.data_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("TIMEOUT") {
            self.supervisor.sleep_timeout_ms = parse("TIMEOUT", v)?;
        }
        if let Some(v) = lookup("PUBLIC_HOSTNAME") {
            self.server.public_hostname = Some(v);
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        let sup = &self.supervisor;

        if sup.start_port == 0 {
            errors.push("supervisor.start_port must be greater than 0".to_string());
        }
        if sup.start_port > sup.end_port {
            errors.push(format!(
                "supervisor.start_port ({}) must not exceed supervisor.end_port ({})",
                sup.start_port, sup.end_port
            ));
        }

        let in_range = |port: u16| port >= sup.start_port && port <= sup.end_port;
        if in_range(self.server.control_port) {
            errors.push(format!(
                "server.control_port ({}) lies inside the instance port range",
                self.server.control_port
            ));
        }
        if let Some(proxy_port) = self.server.proxy_port {
            if in_range(proxy_port) {
                errors.push(format!(
                    "server.proxy_port ({}) lies inside the instance port range",
                    proxy_port
                ));
            }
            if proxy_port == self.server.control_port {
                errors.push("server.proxy_port must differ from server.control_port".to_string());
            }
        }

        if self.proxy.port_header.trim().is_empty() {
            errors.push("proxy.port_header must not be empty".to_string());
        }

        if let Some(ref command) = self.engine.command {
            if command.trim().is_empty() {
                errors.push("engine.command must not be empty".to_string());
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
