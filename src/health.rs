//! Admin HTTP server for liveness, readiness and route inspection.
//!
//! Provides `/healthz` (liveness), `/readyz` (readiness, true once the
//! router has been bootstrapped) and `/routes` (the routing table as JSON).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use pingora_core::server::ShutdownWatch;
use pingora_core::services::background::BackgroundService;
use serde::Serialize;
use tokio::net::TcpListener;

use crate::proxy::Router;

/// State shared by admin requests.
#[derive(Clone)]
pub struct AdminState {
    pub router: Arc<Router>,
    pub ready: Arc<AtomicBool>,
}

#[derive(Serialize)]
struct RouteEntry<'a> {
    id: &'a str,
    criterion: &'a str,
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

fn routes_json(router: &Router) -> Response<Full<Bytes>> {
    let routes = router.routes();
    let entries: Vec<RouteEntry<'_>> = routes
        .iter()
        .map(|(id, criterion)| RouteEntry { id, criterion })
        .collect();

    match serde_json::to_vec(&entries) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to encode routes");
            text(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

/// Builds the response for an admin `path`.
pub fn admin_response(path: &str, state: &AdminState) -> Response<Full<Bytes>> {
    match path {
        "/healthz" => text(StatusCode::OK, "ok"),
        "/readyz" if state.ready.load(Ordering::SeqCst) => text(StatusCode::OK, "ok"),
        "/readyz" => text(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
        "/routes" => routes_json(&state.router),
        _ => text(StatusCode::NOT_FOUND, "not found"),
    }
}

/// Handles admin requests.
pub async fn admin_handler(
    req: Request<hyper::body::Incoming>,
    state: AdminState,
) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(admin_response(req.uri().path(), &state))
}

/// Starts the admin server on the given address.
///
/// Runs indefinitely, accepting connections and handling admin requests.
pub async fn start_admin_server(addr: SocketAddr, state: AdminState) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "admin server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| admin_handler(req, state.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "admin connection error");
            }
        });
    }
}

/// Runs the admin server inside the Pingora server until shutdown.
pub struct AdminService {
    addr: SocketAddr,
    state: AdminState,
}

impl AdminService {
    pub fn new(addr: SocketAddr, state: AdminState) -> Self {
        Self { addr, state }
    }
}

#[async_trait]
impl BackgroundService for AdminService {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        tokio::select! {
            result = start_admin_server(self.addr, self.state.clone()) => {
                if let Err(e) = result {
                    tracing::error!(addr = %self.addr, error = %e, "admin server stopped");
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("admin server shutting down");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{Acl, AclConfig};
    use crate::registry::Registry;
    use serde_json::json;
    use std::net::TcpListener as StdTcpListener;

    fn state(ready: bool) -> AdminState {
        AdminState {
            router: Arc::new(Router::new()),
            ready: Arc::new(AtomicBool::new(ready)),
        }
    }

    /// Starts the admin server on a free port and returns its address.
    /// We test through the actual server since hyper::body::Incoming
    /// cannot be constructed directly.
    async fn serve(state: AdminState) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let handle = tokio::spawn(async move {
            let _ = start_admin_server(addr, state).await;
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        (addr, handle)
    }

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let (addr, handle) = serve(state(false)).await;

        let response = http_get(&format!("http://{}/healthz", addr)).await;
        assert_eq!(response.0, 200);
        assert_eq!(response.1, "ok");

        handle.abort();
    }

    #[tokio::test]
    async fn test_readyz_follows_bootstrap() {
        let state = state(false);
        let ready = state.ready.clone();
        let (addr, handle) = serve(state).await;

        let response = http_get(&format!("http://{}/readyz", addr)).await;
        assert_eq!(response.0, 503);

        ready.store(true, Ordering::SeqCst);
        let response = http_get(&format!("http://{}/readyz", addr)).await;
        assert_eq!(response.0, 200);
        assert_eq!(response.1, "ok");

        handle.abort();
    }

    #[tokio::test]
    async fn test_routes_lists_table() {
        let state = state(true);
        let config: AclConfig = serde_json::from_value(json!({
            "id": "svc-01",
            "criterion": "Path(`/ping`)",
            "endpoint": {
                "matcher": "header",
                "shard_expr": "X-Id",
                "shard_func": "none",
                "shard_config": {"backend_name": "a", "backend": "http://a.local"}
            }
        }))
        .unwrap();
        state
            .router
            .upsert_acl(Acl::load(config, &Registry::default()).unwrap())
            .unwrap();
        let (addr, handle) = serve(state).await;

        let response = http_get(&format!("http://{}/routes", addr)).await;
        assert_eq!(response.0, 200);
        assert_eq!(response.1, r#"[{"id":"svc-01","criterion":"Path(`/ping`)"}]"#);

        handle.abort();
    }

    #[tokio::test]
    async fn test_unknown_path_returns_404() {
        let (addr, handle) = serve(state(true)).await;

        let response = http_get(&format!("http://{}/foo", addr)).await;
        assert_eq!(response.0, 404);

        handle.abort();
    }

    #[test]
    fn test_empty_routes_is_empty_array() {
        let response = admin_response("/routes", &state(true));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    /// Simple HTTP GET using tokio's TcpStream (no external deps).
    async fn http_get(url: &str) -> (u16, String) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpStream;

        let url = url.strip_prefix("http://").unwrap();
        let (addr, path) = url.split_once('/').unwrap_or((url, ""));
        let path = format!("/{}", path);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, addr
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        // Parse status code from "HTTP/1.1 200 OK"
        let status_line = response.lines().next().unwrap();
        let status_code: u16 = status_line
            .split_whitespace()
            .nth(1)
            .unwrap()
            .parse()
            .unwrap();

        // Get body (after \r\n\r\n)
        let body = response
            .split("\r\n\r\n")
            .nth(1)
            .unwrap_or("")
            .to_string();

        (status_code, body)
    }
}
