//! Process-wide counters and gauges
//!
//! Every metric lives in one `prometheus::Registry` and is rendered in the
//! text exposition format on `GET /metrics`.

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    pub instances_started: IntCounter,
    pub instances_stopped: IntCounter,
    pub instances_evicted: IntCounter,
    pub start_failures: IntCounter,
    pub topics_banned: IntCounter,
    pub instances_running: IntGauge,
    pub proxy_connections: IntCounter,
    pub proxy_rejected: IntCounter,
    pub proxy_upstream_failures: IntCounter,
    pub proxy_active: IntGauge,
    pub proxy_bytes_to_upstream: IntCounter,
    pub proxy_bytes_to_client: IntCounter,
    pub api_requests: IntCounter,
    pub api_failures: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let gauge = IntGauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl Metrics {
    pub fn new() -> Self {
        Self::try_new().expect("metric names are static and unique")
    }

    /// Build every metric and register it in a fresh registry
    pub fn try_new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let r = &registry;

        Ok(Self {
            instances_started: counter(r, "topicgate_instances_started_total", "Instances started")?,
            instances_stopped: counter(r, "topicgate_instances_stopped_total", "Instances stopped")?,
            instances_evicted: counter(
                r,
                "topicgate_instances_evicted_total",
                "Instances stopped for inactivity",
            )?,
            start_failures: counter(r, "topicgate_start_failures_total", "Failed instance starts")?,
            topics_banned: counter(r, "topicgate_topics_banned_total", "Topics banned")?,
            instances_running: gauge(r, "topicgate_instances_running", "Instances currently running")?,
            proxy_connections: counter(
                r,
                "topicgate_proxy_connections_total",
                "Connections accepted by the proxy",
            )?,
            proxy_rejected: counter(
                r,
                "topicgate_proxy_rejected_total",
                "Proxy connections rejected before dialing",
            )?,
            proxy_upstream_failures: counter(
                r,
                "topicgate_proxy_upstream_failures_total",
                "Proxy dial or handshake failures",
            )?,
            proxy_active: gauge(
                r,
                "topicgate_proxy_active_connections",
                "Spliced proxy connections open",
            )?,
            proxy_bytes_to_upstream: counter(
                r,
                "topicgate_proxy_bytes_to_upstream_total",
                "Bytes spliced client to instance",
            )?,
            proxy_bytes_to_client: counter(
                r,
                "topicgate_proxy_bytes_to_client_total",
                "Bytes spliced instance to client",
            )?,
            api_requests: counter(r, "topicgate_api_requests_total", "API passthrough requests")?,
            api_failures: counter(
                r,
                "topicgate_api_failures_total",
                "API passthrough requests that got no upstream response",
            )?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode all metrics; returns the content type and the body
    pub fn render(&self) -> prometheus::Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
