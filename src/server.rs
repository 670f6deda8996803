//! The RPC server: accept loop, per-session dispatch, handler tasks.
//!
//! Each inbound connection gets its own session task. A session starts by
//! decoding the handshake frame (fixed format, §`options`); a bad magic
//! number or unknown codec tag drops the connection without a reply.
//! After that the session loop reads `(header, body)` frames, resolves
//! `Service.Method` names against the registered services, and spawns one
//! task per request so slow handlers never block the read loop.
//!
//! Responses may be produced in any order, but every `(header, body)`
//! pair goes through a per-session mutex so the pair is contiguous on the
//! wire. When the peer hangs up, the loop drains in-flight handlers
//! before closing the codec.
//!
//! A server can also share a port with an HTTP server: [`Server::http_router`]
//! returns a route whose `CONNECT` handler hijacks the stream and serves
//! it exactly like a plain TCP connection.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use futures::future::BoxFuture;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::codec::{self, CodecWrite, Header};
use crate::error::{Result, RpcError};
use crate::options;
use crate::service::Service;

/// Default path for the HTTP CONNECT tunnel.
pub const DEFAULT_HTTP_PATH: &str = "/_myrpc_";

type SharedWriter = Arc<Mutex<Box<dyn CodecWrite>>>;

/// An RPC server holding the registered services.
///
/// The server itself is cheap state behind an `Arc`; sessions, handlers
/// and the HTTP tunnel all share it.
pub struct Server {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Server {
        Server { services: RwLock::new(HashMap::new()) }
    }

    /// Publishes a service. Rejects empty names, names containing `.`
    /// (which could never be resolved) and duplicates.
    pub fn register(&self, service: Service) -> Result<()> {
        let name = service.name().to_string();
        if name.is_empty() || name.contains('.') {
            return Err(RpcError::InvalidService(format!("invalid service name {name:?}")));
        }
        let mut services = self.services.write().expect("service map lock poisoned");
        if services.contains_key(&name) {
            return Err(RpcError::InvalidService(format!("service already defined: {name}")));
        }
        services.insert(name, Arc::new(service));
        Ok(())
    }

    /// Accepts connections on the listener and serves each one on its own
    /// task. Runs until the listener itself fails.
    pub async fn accept(self: &Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (socket, peer) = listener.accept().await?;
            let _ = socket.set_nodelay(true);
            info!("rpc server: accepting connection from {}", peer);
            let server = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = server.serve_conn(socket).await {
                    debug!("rpc server: session ended: {e}");
                }
            });
        }
    }

    /// Serves a single established duplex stream until the peer hangs up.
    pub async fn serve_conn<S>(self: Arc<Self>, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let opt = match options::read_handshake(&mut stream).await {
            Ok(opt) => opt,
            Err(e) => {
                warn!("rpc server: options error: {e}");
                return Ok(());
            }
        };
        let (mut reader, writer) = codec::split(opt.codec, stream);
        let writer: SharedWriter = Arc::new(Mutex::new(writer));
        let placeholder = opt.codec.encode(&()).unwrap_or_default();
        let mut handlers = JoinSet::new();

        loop {
            let header = match reader.read_header().await {
                Ok(h) => h,
                Err(e) => {
                    if !e.is_eof() {
                        error!("rpc server: read header error: {e}");
                    }
                    break;
                }
            };
            // Every request carries a body frame; consume it even when
            // dispatch fails so the stream stays aligned.
            let body = match reader.read_body().await {
                Ok(b) => b,
                Err(e) => {
                    if !e.is_eof() {
                        error!("rpc server: read body error: {e}");
                    }
                    break;
                }
            };
            let invocation = self.resolve(&header.service_method).and_then(|(svc, method)| {
                svc.invoke(&method, opt.codec, body)
                    .ok_or_else(|| format!("rpc server: can't find method {method}"))
            });
            match invocation {
                Err(errmsg) => {
                    let mut h = header;
                    h.error = errmsg;
                    send_response(&writer, &h, &placeholder).await;
                }
                Ok(fut) => {
                    handlers.spawn(run_handler(
                        fut,
                        header,
                        Arc::clone(&writer),
                        opt.handle_timeout,
                        placeholder.clone(),
                    ));
                }
            }
        }

        // drain in-flight handlers before tearing the codec down
        while handlers.join_next().await.is_some() {}
        let _ = writer.lock().await.close().await;
        Ok(())
    }

    /// Splits `Service.Method` at the last dot and looks the service up.
    /// The error string is sent back to the caller verbatim.
    fn resolve(&self, service_method: &str) -> std::result::Result<(Arc<Service>, String), String> {
        let Some((service_name, method_name)) = service_method.rsplit_once('.') else {
            return Err(format!(
                "rpc server: service/method request ill-formed: {service_method}"
            ));
        };
        let svc = self
            .services
            .read()
            .expect("service map lock poisoned")
            .get(service_name)
            .cloned()
            .ok_or_else(|| format!("rpc server: can't find service {service_name}"))?;
        Ok((svc, method_name.to_string()))
    }

    /// Returns a router that tunnels the RPC protocol through an HTTP
    /// `CONNECT` on `path`, so the server can share a port with an HTTP
    /// server. Other methods receive `405`.
    pub fn http_router(self: &Arc<Self>, path: &str) -> Router {
        info!("rpc server: http tunnel path: {}", path);
        Router::new().route(path, any(tunnel)).with_state(Arc::clone(self))
    }
}

/// Runs one handler to completion (or to its deadline) and writes the
/// single response for the request.
async fn run_handler(
    fut: BoxFuture<'static, anyhow::Result<Vec<u8>>>,
    mut header: Header,
    writer: SharedWriter,
    handle_timeout: Duration,
    placeholder: Vec<u8>,
) {
    // The handler runs in its own task so a fired deadline leaves it
    // running; only its result is discarded.
    let mut child = tokio::spawn(fut);
    let outcome = if handle_timeout.is_zero() {
        Some((&mut child).await)
    } else {
        tokio::select! {
            // biased: a handler that already finished beats the deadline
            biased;
            res = &mut child => Some(res),
            _ = tokio::time::sleep(handle_timeout) => None,
        }
    };
    let body = match outcome {
        Some(Ok(Ok(reply))) => reply,
        Some(Ok(Err(e))) => {
            header.error = e.to_string();
            placeholder
        }
        Some(Err(e)) => {
            header.error = format!("rpc server: handler panic: {e}");
            placeholder
        }
        None => {
            header.error = format!(
                "rpc server: request handle timeout: expect within {:?}",
                handle_timeout
            );
            placeholder
        }
    };
    send_response(&writer, &header, &body).await;
}

async fn send_response(writer: &SharedWriter, header: &Header, body: &[u8]) {
    let mut w = writer.lock().await;
    if let Err(e) = w.write(header, body).await {
        error!("rpc server: write response error: {e}");
    }
}

/// The CONNECT handler: hijacks the upgraded stream and serves it like a
/// freshly accepted TCP connection.
async fn tunnel(State(server): State<Arc<Server>>, req: Request) -> Response {
    if req.method() != Method::CONNECT {
        return Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(Body::from("405 must CONNECT\n"))
            .expect("static response");
    }
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = server.serve_conn(TokioIo::new(upgraded)).await {
                    debug!("rpc server: tunnelled session ended: {e}");
                }
            }
            Err(e) => warn!("rpc server: connect upgrade error: {e}"),
        }
    });
    Response::builder()
        .status(StatusCode::OK)
        .body(Body::empty())
        .expect("static response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_rejects_bad_and_duplicate_names() {
        let server = Server::new();
        assert!(server.register(Service::new("")).is_err());
        assert!(server.register(Service::new("Foo.Bar")).is_err());
        server.register(Service::new("Foo")).expect("first registration");
        let err = server.register(Service::new("Foo")).expect_err("duplicate");
        assert!(err.to_string().contains("already defined"));
    }

    #[test]
    fn resolve_splits_at_the_last_dot() {
        let server = Server::new();
        server.register(Service::new("Foo")).unwrap();

        assert!(server.resolve("Foo.Sum").is_ok());
        let err = server.resolve("FooSum").expect_err("no dot");
        assert!(err.contains("ill-formed"));
        let err = server.resolve("Bar.Sum").expect_err("unknown service");
        assert!(err.contains("can't find service"));
    }
}
