use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use topicgate::completed::CompletedPoller;
use topicgate::config::Config;
use topicgate::control::{control_url, ControlServer, PKG_NAME, VERSION};
use topicgate::pool::{ApiPool, PoolConfig};
use topicgate::process::ProcessEngine;
use topicgate::proxy::{ConnectionGate, ProxyServer};
use topicgate::supervisor::Supervisor;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("topicgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("topicgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    std::fs::create_dir_all(&config.supervisor.data_root).map_err(|e| {
        anyhow::anyhow!(
            "Failed to create data root '{}': {}",
            config.supervisor.data_root.display(),
            e
        )
    })?;

    let bind_ip: IpAddr = config.server.bind.parse().map_err(|e| {
        error!(bind = %config.server.bind, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address '{}': {}", config.server.bind, e)
    })?;

    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin token (configure admin_token to set a fixed value)");
        token
    });

    if config.engine.command.is_none() {
        warn!("No engine.command configured; every topic start will fail");
    }
    let engine = Arc::new(ProcessEngine::new(
        config.engine.clone(),
        control_url(bind_ip, config.server.control_port),
        Some(admin_token.clone()),
    ));

    let supervisor = Supervisor::new(&config, engine);
    let shutdown_rx = supervisor.subscribe_shutdown();

    let pool = Arc::new(ApiPool::new(PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    }));

    let control = ControlServer::bind(
        SocketAddr::new(bind_ip, config.server.control_port),
        Arc::clone(&supervisor),
        pool,
        admin_token,
        shutdown_rx.clone(),
    )
    .await?;
    let control_handle = tokio::spawn(async move {
        if let Err(e) = control.run().await {
            error!(error = %e, "Control server error");
        }
    });

    let proxy_handle = match config.server.proxy_port {
        Some(port) => {
            let gate: Arc<dyn ConnectionGate> = Arc::clone(&supervisor) as Arc<dyn ConnectionGate>;
            let proxy = ProxyServer::bind(
                SocketAddr::new(bind_ip, port),
                gate,
                config.proxy.clone(),
                Arc::clone(supervisor.metrics()),
                shutdown_rx.clone(),
            )
            .await?;
            Some(tokio::spawn(async move {
                if let Err(e) = proxy.run().await {
                    error!(error = %e, "Proxy server error");
                }
            }))
        }
        None => {
            info!("No proxy_port configured, WebSocket proxy disabled");
            None
        }
    };

    if let Some(poller) =
        CompletedPoller::new(&config.completed, Arc::clone(&supervisor), shutdown_rx.clone())?
    {
        tokio::spawn(poller.run());
    }

    wait_for_signal().await;

    // a second Ctrl+C while draining exits immediately
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received second SIGINT, exiting immediately");
            std::process::exit(1);
        }
    });

    info!("Stopping all instances...");
    supervisor.close().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if let Some(handle) = proxy_handle {
            let _ = handle.await;
        }
        let _ = control_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), shutting down...");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting topic supervisor");
    info!(
        bind = %config.server.bind,
        control_port = config.server.control_port,
        proxy_port = ?config.server.proxy_port,
        public_hostname = ?config.server.public_hostname,
        "Server configuration"
    );
    info!(
        start_port = config.supervisor.start_port,
        end_port = config.supervisor.end_port,
        data_root = %config.supervisor.data_root.display(),
        sleep_timeout_ms = config.supervisor.sleep_timeout_ms,
        idle_eviction = config.supervisor.idle_eviction,
        banning = config.supervisor.banning,
        banned_topics = config.supervisor.banned_topics.len(),
        "Supervisor settings"
    );
    info!(
        port_header = %config.proxy.port_header,
        connect_timeout_ms = config.proxy.connect_timeout_ms,
        handshake_timeout_ms = config.proxy.handshake_timeout_ms,
        "Proxy settings"
    );
    info!(
        command = ?config.engine.command,
        args = ?config.engine.args,
        expose_api = config.engine.expose_api,
        startup_timeout_secs = config.engine.startup_timeout_secs,
        shutdown_grace_period_secs = config.engine.shutdown_grace_period_secs,
        "Engine settings"
    );
    info!(
        url = ?config.completed.url,
        interval_secs = config.completed.interval_secs,
        "Completed-topic source"
    );
}
