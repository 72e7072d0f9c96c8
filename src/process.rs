//! Child-process instance engine
//!
//! Runs `engine.command` once per topic. The instance learns its port, data
//! directory and multiaddrs from its environment and is considered started
//! once its port accepts TCP connections.

use crate::config::EngineConfig;
use crate::engine::{InstanceConfig, InstanceEngine, InstanceHandle, PeerSink};
use anyhow::Context;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Interval between readiness checks (in milliseconds)
const READY_POLL_INTERVAL_MS: u64 = 50;

pub struct ProcessEngine {
    config: EngineConfig,
    /// Base URL of the control server, for the peer-count callback
    control_url: String,
    token: Option<String>,
}

impl ProcessEngine {
    pub fn new(config: EngineConfig, control_url: String, token: Option<String>) -> Self {
        Self {
            config,
            control_url,
            token,
        }
    }

    fn command(&self, instance: &InstanceConfig) -> anyhow::Result<Command> {
        let program = self
            .config
            .command
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Process engine requires 'engine.command'"))?;

        let mut cmd = Command::new(program);
        cmd.args(&self.config.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir);
        }
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        cmd.env("PORT", instance.port.to_string());
        cmd.env("TOPIC", &instance.topic);
        cmd.env("DATA_DIR", &instance.storage_path);
        cmd.env("LISTEN_ADDRS", instance.listen_addrs.join(","));
        cmd.env("ANNOUNCE_ADDRS", instance.announce_addrs.join(","));
        cmd.env(
            "TOPICGATE_PEERS_URL",
            format!(
                "{}/peers/{}",
                self.control_url.trim_end_matches('/'),
                urlencoding::encode(&instance.topic)
            ),
        );
        if let Some(ref token) = self.token {
            cmd.env("TOPICGATE_TOKEN", token);
        }

        Ok(cmd)
    }
}

#[async_trait]
impl InstanceEngine for ProcessEngine {
    async fn initialize(
        &self,
        config: InstanceConfig,
        _peers: PeerSink,
    ) -> anyhow::Result<Box<dyn InstanceHandle>> {
        let topic = config.topic.clone();
        let port = config.port;

        let mut child = self
            .command(&config)?
            .spawn()
            .with_context(|| format!("Failed to spawn instance for '{}'", topic))?;
        let pid = child.id().unwrap_or(0);
        info!(%topic, port, pid, "Instance process spawned");

        if let Some(stdout) = child.stdout.take() {
            forward_output(topic.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(topic.clone(), "stderr", stderr);
        }

        if let Err(e) = wait_for_port(&mut child, port, self.config.startup_timeout()).await {
            let _ = child.kill().await;
            return Err(e.context(format!("Instance '{}' did not become ready", topic)));
        }
        debug!(%topic, port, "Instance accepting connections");

        let api_addr = self
            .config
            .expose_api
            .then(|| SocketAddr::from((Ipv4Addr::LOCALHOST, port)));

        Ok(Box::new(ProcessHandle {
            topic,
            child: Mutex::new(Some(child)),
            listen_addrs: config.listen_addrs,
            api_addr,
            grace_period: self.config.shutdown_grace_period(),
        }))
    }
}

/// A running instance process
pub struct ProcessHandle {
    topic: String,
    child: Mutex<Option<Child>>,
    listen_addrs: Vec<String>,
    api_addr: Option<SocketAddr>,
    grace_period: Duration,
}

#[async_trait]
impl InstanceHandle for ProcessHandle {
    async fn stop(&self) -> anyhow::Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        stop_child(&self.topic, &mut child, self.grace_period).await
    }

    fn listen_addrs(&self) -> Vec<String> {
        self.listen_addrs.clone()
    }

    fn api_addr(&self) -> Option<SocketAddr> {
        self.api_addr
    }
}

/// Poll until the instance port accepts, the process exits, or time runs out
async fn wait_for_port(child: &mut Child, port: u16, timeout: Duration) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

    loop {
        if let Some(status) = child.try_wait()? {
            anyhow::bail!("process exited before accepting connections ({})", status);
        }
        if TcpStream::connect(addr).await.is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            anyhow::bail!("port {} not accepting after {:?}", port, timeout);
        }
        tokio::time::sleep(Duration::from_millis(READY_POLL_INTERVAL_MS)).await;
    }
}

/// SIGTERM, then SIGKILL once the grace period runs out
async fn stop_child(topic: &str, child: &mut Child, grace_period: Duration) -> anyhow::Result<()> {
    if let Some(pid) = child.id() {
        info!(topic, pid, "Sending SIGTERM to instance");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(topic, ?status, "Instance process exited");
            Ok(())
        }
        Ok(Err(e)) => Err(e).context("Error waiting for instance to exit"),
        Err(_) => {
            warn!(
                topic,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            child.kill().await.context("Failed to kill instance process")
        }
    }
}

/// Relay a child's output into the log, one line per event
fn forward_output<R>(topic: String, stream: &'static str, output: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(output).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(topic = %topic, stream, "{}", line);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::net::TcpListener;

    fn instance(topic: &str, port: u16) -> InstanceConfig {
        InstanceConfig::new(topic, port, PathBuf::from("/tmp").join(topic), None, None)
    }

    fn engine(command: &str, args: &[&str], startup_secs: u64) -> ProcessEngine {
        let mut config =
            EngineConfig::command(command).with_args(args.iter().map(|a| a.to_string()).collect());
        config.startup_timeout_secs = startup_secs;
        config.shutdown_grace_period_secs = 1;
        ProcessEngine::new(config, "http://127.0.0.1:3000/".to_string(), Some("secret".to_string()))
    }

    #[test]
    fn test_command_environment() {
        let engine = engine("sleep", &["60"], 1);
        let cmd = engine.command(&instance("my room", 9005)).unwrap();

        let envs: std::collections::HashMap<_, _> = cmd
            .as_std()
            .get_envs()
            .filter_map(|(k, v)| Some((k.to_str()?.to_string(), v?.to_str()?.to_string())))
            .collect();
        assert_eq!(envs["PORT"], "9005");
        assert_eq!(envs["TOPIC"], "my room");
        assert_eq!(envs["LISTEN_ADDRS"], "/ip4/127.0.0.1/tcp/9005/ws");
        assert_eq!(envs["TOPICGATE_PEERS_URL"], "http://127.0.0.1:3000/peers/my%20room");
        assert_eq!(envs["TOPICGATE_TOKEN"], "secret");
    }

    #[tokio::test]
    async fn test_missing_command_fails() {
        let engine = ProcessEngine::new(EngineConfig::default(), "http://x".to_string(), None);
        let result = engine.initialize(instance("room", 9100), PeerSink::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_process_that_exits_fails() {
        let engine = engine("true", &[], 5);
        let started = Instant::now();
        let result = engine.initialize(instance("room", 1), PeerSink::new()).await;

        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_startup_timeout() {
        // a free port nobody will listen on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let engine = engine("sleep", &["60"], 1);
        let err = engine
            .initialize(instance("room", port), PeerSink::new())
            .await
            .err()
            .expect("startup should time out");
        assert!(format!("{:#}", err).contains("not accepting"));
    }

    #[tokio::test]
    async fn test_start_and_stop_process() {
        // stand in for the instance's listener
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let engine = engine("sleep", &["60"], 2);
        let handle = engine
            .initialize(instance("room", port), PeerSink::new())
            .await
            .unwrap();

        assert_eq!(handle.listen_addrs(), vec![format!("/ip4/127.0.0.1/tcp/{}/ws", port)]);
        assert!(handle.api_addr().is_none());

        handle.stop().await.unwrap();
        // second stop is a no-op
        handle.stop().await.unwrap();
    }
}
