//! The service registry: an in-memory liveness table over HTTP.
//!
//! Servers announce themselves with a periodic `POST` carrying their
//! endpoint in the `X-Myrpc-Server` header; clients fetch the live set
//! with a `GET` and read it back from the `X-Myrpc-Servers` response
//! header as a comma-separated list. An entry whose last heartbeat is
//! older than the registry timeout is lazily purged the next time the
//! table is read.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use tracing::{info, warn};

use crate::error::{Result, RpcError};

/// Default path the registry serves on.
pub const DEFAULT_PATH: &str = "/myrpc/registry";

/// Default liveness timeout: a server is dropped if no heartbeat arrives
/// for five minutes.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Request header carrying one endpoint on a heartbeat POST.
pub const SERVER_HEADER: &str = "X-Myrpc-Server";
/// Response header carrying the alive set on a GET.
pub const SERVERS_HEADER: &str = "X-Myrpc-Servers";

struct ServerItem {
    addr: String,
    start: Instant,
}

/// The liveness table. Accessed only from HTTP handlers.
pub struct Registry {
    timeout: Duration,
    servers: Mutex<HashMap<String, ServerItem>>,
}

impl Registry {
    /// A timeout of zero disables expiry.
    pub fn new(timeout: Duration) -> Registry {
        Registry {
            timeout,
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts a server or refreshes its heartbeat timestamp.
    pub fn put_server(&self, addr: &str) {
        let mut servers = self.servers.lock().expect("registry lock poisoned");
        match servers.get_mut(addr) {
            Some(item) => item.start = Instant::now(),
            None => {
                servers.insert(
                    addr.to_string(),
                    ServerItem { addr: addr.to_string(), start: Instant::now() },
                );
            }
        }
    }

    /// The alive endpoints in ascending order. Expired entries are
    /// removed as a side effect.
    pub fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.servers.lock().expect("registry lock poisoned");
        let timeout = self.timeout;
        servers.retain(|_, item| timeout.is_zero() || item.start.elapsed() <= timeout);
        let mut alive: Vec<String> = servers.values().map(|item| item.addr.clone()).collect();
        alive.sort();
        alive
    }

    /// Returns a router serving the registry protocol on `path`.
    pub fn http_router(self: &Arc<Self>, path: &str) -> Router {
        info!("rpc registry path: {}", path);
        Router::new().route(path, any(serve)).with_state(Arc::clone(self))
    }
}

async fn serve(State(registry): State<Arc<Registry>>, req: Request) -> Response {
    if req.method() == Method::GET {
        Response::builder()
            .status(StatusCode::OK)
            .header(SERVERS_HEADER, registry.alive_servers().join(","))
            .body(Body::empty())
            .expect("alive-servers response")
    } else if req.method() == Method::POST {
        let addr = req
            .headers()
            .get(SERVER_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if addr.is_empty() {
            return status_only(StatusCode::INTERNAL_SERVER_ERROR);
        }
        registry.put_server(addr);
        status_only(StatusCode::OK)
    } else {
        status_only(StatusCode::METHOD_NOT_ALLOWED)
    }
}

fn status_only(status: StatusCode) -> Response {
    Response::builder().status(status).body(Body::empty()).expect("static response")
}

/// Announces `addr` to the registry now and then every `period` until a
/// heartbeat fails. A period of zero picks the registry's default
/// timeout minus a minute, so the entry never lapses between beats.
///
/// The first heartbeat is sent before this returns; the ticker stops on
/// the first failure and the server is expected to re-register on
/// restart.
pub async fn heartbeat(registry_url: &str, addr: &str, period: Duration) -> Result<()> {
    let period = if period.is_zero() {
        DEFAULT_TIMEOUT - Duration::from_secs(60)
    } else {
        period
    };
    let http = reqwest::Client::new();
    send_heartbeat(&http, registry_url, addr).await?;

    let registry_url = registry_url.to_string();
    let addr = addr.to_string();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await; // the immediate first tick; already sent above
        loop {
            ticker.tick().await;
            if send_heartbeat(&http, &registry_url, &addr).await.is_err() {
                break;
            }
        }
    });
    Ok(())
}

async fn send_heartbeat(http: &reqwest::Client, registry_url: &str, addr: &str) -> Result<()> {
    info!("{} send heart beat to registry {}", addr, registry_url);
    http.post(registry_url)
        .header(SERVER_HEADER, addr)
        .send()
        .await
        .map_err(|e| {
            warn!("rpc server: heart beat err: {e}");
            RpcError::Registry(e.to_string())
        })?;
    Ok(())
}
