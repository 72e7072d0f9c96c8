//! Supervisor behavior against an engine that binds real ports

mod common;

use common::{test_config, MockEngine};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use topicgate::error::SupervisorError;
use topicgate::supervisor::Supervisor;

#[tokio::test]
async fn test_started_instance_accepts_connections() {
    let dir = tempfile::tempdir().unwrap();
    let engine = MockEngine::new();
    let config = test_config(dir.path(), 4).await;
    let supervisor = Supervisor::new(&config, engine.clone());

    let info = supervisor.start("room").await.unwrap();

    assert_eq!(info.port, config.supervisor.start_port);
    assert!(TcpStream::connect(("127.0.0.1", info.port)).await.is_ok());
    assert!(dir.path().join("room").is_dir());

    supervisor.close().await;
}

#[tokio::test]
async fn test_concurrent_starts_share_one_instance() {
    let dir = tempfile::tempdir().unwrap();
    let engine = MockEngine::with_delay(Duration::from_millis(30));
    let config = test_config(dir.path(), 4).await;
    let supervisor = Supervisor::new(&config, engine.clone());

    let mut handles = Vec::new();
    for _ in 0..20 {
        let supervisor = Arc::clone(&supervisor);
        handles.push(tokio::spawn(async move { supervisor.start("shared").await }));
    }

    let mut ports = HashSet::new();
    for handle in handles {
        ports.insert(handle.await.unwrap().unwrap().port);
    }

    assert_eq!(ports.len(), 1);
    assert_eq!(engine.initialized(), 1);

    supervisor.close().await;
}

#[tokio::test]
async fn test_distinct_topics_get_distinct_ports() {
    let dir = tempfile::tempdir().unwrap();
    let engine = MockEngine::new();
    let config = test_config(dir.path(), 3).await;
    let supervisor = Supervisor::new(&config, engine.clone());

    let a = supervisor.start("a").await.unwrap();
    let b = supervisor.start("b").await.unwrap();
    let c = supervisor.start("c").await.unwrap();
    let ports: HashSet<u16> = [a.port, b.port, c.port].into_iter().collect();
    assert_eq!(ports.len(), 3);

    let err = supervisor.start("d").await.unwrap_err();
    assert!(matches!(err, SupervisorError::ResourceExhausted { .. }));

    supervisor.close().await;
}

#[tokio::test]
async fn test_stop_releases_port_for_reuse() {
    let dir = tempfile::tempdir().unwrap();
    let engine = MockEngine::new();
    let config = test_config(dir.path(), 1).await;
    let supervisor = Supervisor::new(&config, engine.clone());

    let first = supervisor.start("first").await.unwrap();
    supervisor.stop("first").await.unwrap();
    assert!(!supervisor.is_known_port(first.port));

    // the listener is gone, so the same port can be bound again
    let second = supervisor.start("second").await.unwrap();
    assert_eq!(second.port, first.port);
    assert!(supervisor.is_known_port(second.port));

    supervisor.close().await;
}

#[tokio::test]
async fn test_failed_initialization_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let engine = MockEngine::new();
    engine.fail_topic("broken");
    let config = test_config(dir.path(), 2).await;
    let supervisor = Supervisor::new(&config, engine.clone());

    let err = supervisor.start("broken").await.unwrap_err();
    assert!(matches!(err, SupervisorError::InitializationFailed { .. }));
    assert!(supervisor.info("broken").is_none());
    assert_eq!(supervisor.metrics().start_failures.get(), 1);

    supervisor.close().await;
}

#[tokio::test]
async fn test_banned_topic_is_stopped_and_refused() {
    let dir = tempfile::tempdir().unwrap();
    let engine = MockEngine::new();
    let config = test_config(dir.path(), 2).await;
    let supervisor = Supervisor::new(&config, engine.clone());

    let info = supervisor.start("match-7").await.unwrap();
    supervisor.ban("match-7").await;

    assert!(!supervisor.is_known_port(info.port));
    assert_eq!(engine.stopped(), 1);
    assert!(matches!(
        supervisor.start("match-7").await,
        Err(SupervisorError::Forbidden(_))
    ));

    supervisor.close().await;
}

#[tokio::test]
async fn test_idle_instance_sleeps_after_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let engine = MockEngine::new();
    let mut config = test_config(dir.path(), 2).await;
    config.supervisor.sleep_timeout_ms = 400;
    config.supervisor.watchdog_interval_ms = 50;
    config.supervisor.activity_interval_ms = 50;
    let supervisor = Supervisor::new(&config, engine.clone());

    let info = supervisor.start("sleepy").await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(supervisor.is_known_port(info.port), "stopped before the timeout");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while supervisor.is_known_port(info.port) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(!supervisor.is_known_port(info.port));
    assert_eq!(engine.stopped(), 1);

    // a later request brings it back
    let again = supervisor.start("sleepy").await.unwrap();
    assert!(supervisor.is_known_port(again.port));
    assert_eq!(engine.initialized(), 2);

    supervisor.close().await;
}

#[tokio::test]
async fn test_connected_peers_keep_instance_awake() {
    let dir = tempfile::tempdir().unwrap();
    let engine = MockEngine::new();
    let mut config = test_config(dir.path(), 2).await;
    config.supervisor.sleep_timeout_ms = 200;
    config.supervisor.watchdog_interval_ms = 50;
    config.supervisor.activity_interval_ms = 20;
    let supervisor = Supervisor::new(&config, engine.clone());

    let info = supervisor.start("busy").await.unwrap();
    engine.sink("busy").unwrap().on_peer_count_changed(3);

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(supervisor.is_known_port(info.port));
    assert_eq!(supervisor.list()[0].peers, 3);

    supervisor.close().await;
}

#[tokio::test]
async fn test_close_stops_everything_once() {
    let dir = tempfile::tempdir().unwrap();
    let engine = MockEngine::new();
    let config = test_config(dir.path(), 4).await;
    let supervisor = Supervisor::new(&config, engine.clone());

    let mut ports = Vec::new();
    for topic in ["a", "b", "c", "d"] {
        ports.push(supervisor.start(topic).await.unwrap().port);
    }

    let closers: Vec<_> = (0..4)
        .map(|_| {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.close().await })
        })
        .collect();
    for closer in closers {
        closer.await.unwrap();
    }

    assert_eq!(engine.stopped(), 4);
    assert!(supervisor.list().is_empty());
    for port in ports {
        assert!(!supervisor.is_known_port(port));
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }
    assert!(matches!(
        supervisor.start("late").await,
        Err(SupervisorError::ShuttingDown)
    ));
}
