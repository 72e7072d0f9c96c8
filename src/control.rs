//! Control HTTP server
//!
//! Resolves topics to instance addresses (starting them on demand), passes
//! `/api/{topic}/...` through to instance APIs, exposes metrics, and carries
//! the token-protected admin endpoints.

use crate::error::{json_error_response, supervisor_error_response, ErrorCode, SupervisorError};
use crate::pool::{upstream_path, ApiPool};
use crate::supervisor::Supervisor;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

type ControlResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// URL instances use to reach the control server
///
/// A wildcard bind address is not dialable, so it maps to loopback of the
/// same family.
pub fn control_url(bind_ip: IpAddr, port: u16) -> String {
    let ip = match bind_ip {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    format!("http://{}", SocketAddr::new(ip, port))
}

fn full(body: impl Into<Bytes>) -> BoxBody<Bytes, hyper::Error> {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

fn response(status: StatusCode, body: impl Into<Bytes>) -> ControlResponse {
    Response::builder()
        .status(status)
        .body(full(body))
        .expect("valid response with StatusCode enum")
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> ControlResponse {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full(body))
        .expect("valid response with StatusCode enum and static header")
}

struct ControlState {
    supervisor: Arc<Supervisor>,
    pool: Arc<ApiPool>,
    auth_token: String,
}

pub struct ControlServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<ControlState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ControlServer {
    pub async fn bind(
        bind_addr: SocketAddr,
        supervisor: Arc<Supervisor>,
        pool: Arc<ApiPool>,
        auth_token: String,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            state: Arc::new(ControlState {
                supervisor,
                pool,
                auth_token,
            }),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn auth_token(&self) -> &str {
        &self.state.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr, "Control server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "Control connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Control server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    _addr: SocketAddr,
    state: Arc<ControlState>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Control connection error: {}", e))?;

    Ok(())
}

fn check_auth(req: &Request<Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected_token))
        .unwrap_or(false)
}

fn decode_topic(segment: &str) -> Result<String, SupervisorError> {
    urlencoding::decode(segment)
        .map(|t| t.into_owned())
        .map_err(|_| SupervisorError::BadRequest("topic is not valid UTF-8".to_string()))
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ControlState>,
) -> Result<ControlResponse, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Control request");

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::GET, "/metrics") => match state.supervisor.metrics().render() {
            Ok((content_type, body)) => Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, content_type)
                .body(full(body))
                .expect("valid response with encoder content type"),
            Err(e) => {
                error!(error = %e, "Failed to render metrics");
                response(StatusCode::INTERNAL_SERVER_ERROR, "failed to render metrics")
            }
        },

        (&Method::GET, p) if p.starts_with("/topic/") => {
            let segment = p.strip_prefix("/topic/").unwrap_or("");
            resolve_topic(&state.supervisor, segment).await
        }

        (_, p) if p.starts_with("/api/") => {
            let rest = p.strip_prefix("/api/").unwrap_or("");
            return forward_api(req, &state, rest.to_string()).await;
        }

        (&Method::GET, "/instances") => {
            if !check_auth(&req, &state.auth_token) {
                warn!(%path, "Unauthorized control request");
                response(StatusCode::UNAUTHORIZED, "unauthorized")
            } else {
                let instances = state.supervisor.list();
                let body = serde_json::json!({
                    "count": instances.len(),
                    "instances": instances,
                });
                json_response(StatusCode::OK, body.to_string())
            }
        }

        (&Method::POST, p) if p.starts_with("/ban/") => {
            if !check_auth(&req, &state.auth_token) {
                warn!(%path, "Unauthorized control request");
                response(StatusCode::UNAUTHORIZED, "unauthorized")
            } else {
                match decode_topic(p.strip_prefix("/ban/").unwrap_or("")) {
                    Ok(topic) if !topic.is_empty() => {
                        state.supervisor.notify_completed(&topic).await;
                        json_response(
                            StatusCode::OK,
                            serde_json::json!({ "banned": topic }).to_string(),
                        )
                    }
                    Ok(_) => json_error_response(ErrorCode::BadRequest, "missing topic"),
                    Err(e) => supervisor_error_response(&e),
                }
            }
        }

        (&Method::POST, p) if p.starts_with("/peers/") => {
            if !check_auth(&req, &state.auth_token) {
                warn!(%path, "Unauthorized control request");
                response(StatusCode::UNAUTHORIZED, "unauthorized")
            } else {
                let topic = match decode_topic(p.strip_prefix("/peers/").unwrap_or("")) {
                    Ok(topic) => topic,
                    Err(e) => return Ok(supervisor_error_response(&e)),
                };
                let body = req.into_body().collect().await?.to_bytes();
                let count = std::str::from_utf8(&body)
                    .ok()
                    .and_then(|s| s.trim().parse::<usize>().ok());
                match count {
                    Some(count) => match state.supervisor.peer_count_changed(&topic, count) {
                        Ok(()) => response(StatusCode::OK, "ok"),
                        Err(e) => supervisor_error_response(&e),
                    },
                    None => json_error_response(
                        ErrorCode::BadRequest,
                        "body must be a decimal peer count",
                    ),
                }
            }
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

/// Start the topic if needed and return its addresses
async fn resolve_topic(supervisor: &Arc<Supervisor>, segment: &str) -> ControlResponse {
    let topic = match decode_topic(segment) {
        Ok(topic) => topic,
        Err(e) => return supervisor_error_response(&e),
    };

    match supervisor.start(&topic).await {
        Ok(info) => match serde_json::to_string(&info) {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(e) => json_error_response(ErrorCode::InternalError, e.to_string()),
        },
        Err(e) => {
            if matches!(e, SupervisorError::InitializationFailed { .. }) {
                error!(%topic, error = %e, "Topic start failed");
            } else {
                debug!(%topic, error = %e, "Topic start refused");
            }
            supervisor_error_response(&e)
        }
    }
}

/// Pass `/api/{topic}/...` through to the instance API
async fn forward_api(
    req: Request<Incoming>,
    state: &ControlState,
    rest: String,
) -> Result<ControlResponse, hyper::Error> {
    let (segment, tail) = match rest.find('/') {
        Some(idx) => rest.split_at(idx),
        None => (rest.as_str(), ""),
    };
    let topic = match decode_topic(segment) {
        Ok(topic) => topic,
        Err(e) => return Ok(supervisor_error_response(&e)),
    };

    let Some(record) = state.supervisor.registry().get(&topic) else {
        return Ok(json_error_response(
            ErrorCode::NotFound,
            format!("no instance for '{}'", topic),
        ));
    };
    let Some(api_addr) = record.handle().api_addr() else {
        return Ok(json_error_response(
            ErrorCode::NotFound,
            format!("instance '{}' has no API", topic),
        ));
    };

    let metrics = state.supervisor.metrics();
    metrics.api_requests.inc();

    let target = upstream_path(tail, req.uri().query());
    match state.pool.forward(req, api_addr, &target).await {
        Ok(response) => Ok(response),
        Err(e) => {
            warn!(%topic, %api_addr, error = %e, "API passthrough failed");
            metrics.api_failures.inc();
            Ok(supervisor_error_response(&SupervisorError::UpstreamUnavailable(
                e.to_string(),
            )))
        }
    }
}
