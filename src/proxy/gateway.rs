//! Pingora ProxyHttp implementation for the gateway.
//!
//! Each request is routed to an ACL, the ACL's endpoint picks the
//! backend from the shard key, and Pingora forwards the request there.
//! Routing misses, sharding failures and panics are answered directly
//! with the fixed JSON error bodies.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::Uri;
use pingora_core::prelude::*;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{ProxyHttp, Session};

use super::acl::Acl;
use super::http_error::HttpError;
use super::recovery::{recover_async, ErrorReporter};
use super::request::RequestView;
use super::Router;
use crate::shard::Backend;

/// Largest request body Pingora can replay upstream after it has been
/// read for routing.
pub const MAX_REPLAY_BYTES: usize = 64 * 1024;

/// Default limit on bodies buffered for `body` matchers.
pub const DEFAULT_MAX_BODY_BYTES: usize = MAX_REPLAY_BYTES;

/// Request body collected for `body` matchers, capped at `limit` bytes.
#[derive(Debug)]
pub struct BodyBuffer {
    buf: BytesMut,
    limit: usize,
}

impl BodyBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
        }
    }

    /// Appends `chunk`. Returns false, keeping nothing of it, when the body
    /// would grow past the limit.
    pub fn push(&mut self, chunk: &[u8]) -> bool {
        if self.buf.len() + chunk.len() > self.limit {
            return false;
        }
        self.buf.extend_from_slice(chunk);
        true
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Where a request is forwarded and how.
#[derive(Clone)]
pub struct Upstream {
    pub peer: HttpPeer,
    pub uri: Uri,
    pub keep_alive: bool,
}

impl Upstream {
    /// Resolves `backend` and rewrites `request` for it.
    pub async fn plan(backend: &Backend, request: &Uri) -> Result<Self> {
        let peer = backend.peer().await.map_err(|e| {
            Error::explain(
                ErrorType::ConnectNoRoute,
                format!("failed to resolve backend {}: {}", backend.name(), e),
            )
        })?;
        let uri = backend.upstream_uri(request).map_err(|e| {
            Error::explain(
                ErrorType::InternalError,
                format!("invalid upstream uri for {}: {}", backend.name(), e),
            )
        })?;

        Ok(Self {
            peer,
            uri,
            keep_alive: backend.keep_alive(),
        })
    }
}

/// Per-request context for the gateway proxy.
pub struct GatewayCtx {
    /// The ACL the request was routed to.
    pub acl: Option<Arc<Acl>>,
    /// The backend picked by the ACL's endpoint.
    pub backend: Option<Arc<Backend>>,
    pub upstream: Option<Upstream>,
    /// Body read for sharding, sent upstream in place of the replayed one.
    pub body: Option<Bytes>,
    pub started: Instant,
}

impl Default for GatewayCtx {
    fn default() -> Self {
        Self {
            acl: None,
            backend: None,
            upstream: None,
            body: None,
            started: Instant::now(),
        }
    }
}

/// Gateway proxy that routes and shards HTTP requests to backends.
pub struct GatewayProxy {
    router: Arc<Router>,
    reporter: Arc<dyn ErrorReporter>,
    max_body_bytes: usize,
}

impl GatewayProxy {
    pub fn new(router: Arc<Router>, reporter: Arc<dyn ErrorReporter>, max_body_bytes: usize) -> Self {
        Self {
            router,
            reporter,
            max_body_bytes: max_body_bytes.min(MAX_REPLAY_BYTES),
        }
    }

    /// Finds the ACL for the request.
    fn locate(&self, req: &RequestView<'_>) -> Result<Arc<Acl>, HttpError> {
        self.router.route(req).map_err(|e| {
            tracing::warn!(url = %req.uri, error = %e, "failed to find route");
            HttpError::NotFound
        })
    }

    /// Picks the backend for the request from the ACL's endpoint.
    fn select(&self, acl: &Acl, req: &RequestView<'_>) -> Result<Arc<Backend>, HttpError> {
        match acl.endpoint.shard(req) {
            Ok(Some(backend)) => Ok(backend),
            Ok(None) => {
                tracing::warn!(acl = %acl.id, url = %req.uri, "no backend for shard key");
                Err(HttpError::ServiceUnavailable)
            }
            Err(e) => {
                tracing::warn!(acl = %acl.id, url = %req.uri, error = %e, "failed to find backend");
                Err(HttpError::ServiceUnavailable)
            }
        }
    }

    /// Reads the whole downstream body.
    ///
    /// Returns `None` when the body is larger than the limit or cannot be
    /// replayed upstream.
    async fn buffer_body(&self, session: &mut Session) -> Result<Option<Bytes>> {
        session.enable_retry_buffering();

        let mut buffer = BodyBuffer::new(self.max_body_bytes);
        while let Some(chunk) = session.read_request_body().await? {
            if !buffer.push(&chunk) {
                return Ok(None);
            }
        }

        // Pingora only hands the body to request_body_filter when it kept a
        // replay copy.
        if !buffer.is_empty() && session.get_retry_buffer().is_none() {
            return Ok(None);
        }
        tracing::debug!(bytes = buffer.len(), "request body buffered");
        Ok(Some(buffer.freeze()))
    }

    /// Routes, shards and plans the upstream for the request.
    ///
    /// `Ok(Some(_))` is the error to answer with instead of forwarding.
    async fn prepare(&self, session: &mut Session, ctx: &mut GatewayCtx) -> Result<Option<HttpError>> {
        let located = {
            let req = session.req_header();
            self.locate(&RequestView::new(&req.method, &req.uri, &req.headers))
        };
        let acl = match located {
            Ok(acl) => acl,
            Err(error) => return Ok(Some(error)),
        };
        ctx.acl = Some(Arc::clone(&acl));

        let body = if acl.endpoint.reads_body() {
            match self.buffer_body(session).await? {
                Some(body) => Some(body),
                None => {
                    tracing::warn!(acl = %acl.id, limit = self.max_body_bytes, "request body too large to shard on");
                    return Ok(Some(HttpError::ServiceUnavailable));
                }
            }
        } else {
            None
        };

        let selected = {
            let req = session.req_header();
            let view = RequestView::new(&req.method, &req.uri, &req.headers);
            let view = match body.as_deref() {
                Some(bytes) => view.with_body(bytes),
                None => view,
            };
            self.select(&acl, &view)
        };
        let backend = match selected {
            Ok(backend) => backend,
            Err(error) => return Ok(Some(error)),
        };
        ctx.backend = Some(Arc::clone(&backend));

        let request_uri = session.req_header().uri.clone();
        ctx.upstream = Some(Upstream::plan(&backend, &request_uri).await?);
        ctx.body = body.filter(|b| !b.is_empty());
        Ok(None)
    }

    /// Reports a panic recovered while preparing a request and turns it
    /// into the internal error response.
    fn settle<T>(&self, outcome: Result<T, String>, url: &str) -> Result<T, HttpError> {
        outcome.map_err(|panic| {
            self.reporter.capture(&panic, url);
            HttpError::Internal
        })
    }
}

/// Paths answered by the proxy itself, before routing.
pub fn is_health_check(path: &str) -> bool {
    path == "/" || path == "/ping"
}

async fn write_json(session: &mut Session, status: u16, body: Bytes) -> Result<()> {
    let mut header = ResponseHeader::build(status, None)?;
    header.insert_header("Content-Type", "application/json")?;
    header.insert_header("Content-Length", body.len().to_string())?;
    session
        .write_response_header(Box::new(header), false)
        .await?;
    session.write_response_body(Some(body), true).await?;
    Ok(())
}

async fn respond_error(session: &mut Session, error: HttpError) -> Result<()> {
    write_json(session, error.status().as_u16(), error.body()).await
}

#[async_trait]
impl ProxyHttp for GatewayProxy {
    type CTX = GatewayCtx;

    fn new_ctx(&self) -> Self::CTX {
        GatewayCtx::default()
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        if is_health_check(session.req_header().uri.path()) {
            write_json(session, 200, Bytes::from_static(b"{}")).await?;
            return Ok(true);
        }

        let url = session.req_header().uri.to_string();
        let outcome = recover_async(self.prepare(session, ctx)).await;
        let error = match self.settle(outcome, &url) {
            Ok(Ok(None)) => return Ok(false),
            Ok(Ok(Some(error))) | Err(error) => error,
            Ok(Err(e)) => return Err(e),
        };

        respond_error(session, error).await?;
        Ok(true)
    }

    async fn request_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        _end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        if let Some(buffered) = ctx.body.take() {
            *body = Some(buffered);
        }
        Ok(())
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let upstream = ctx
            .upstream
            .as_ref()
            .ok_or_else(|| Error::explain(ErrorType::InternalError, "no backend selected"))?;
        Ok(Box::new(upstream.peer.clone()))
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let Some(upstream) = ctx.upstream.as_ref() else {
            return Ok(());
        };

        upstream_request.set_uri(upstream.uri.clone());
        if !upstream.keep_alive {
            upstream_request.insert_header("Connection", "close")?;
        }
        Ok(())
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        let status = session
            .response_written()
            .map(|r| r.status.as_u16())
            .unwrap_or(0);

        let path = session.req_header().uri.path();
        if is_health_check(path) {
            return;
        }

        let acl = ctx.acl.as_ref().map(|a| a.id.as_str()).unwrap_or("-");
        let backend = ctx.backend.as_ref().map(|b| b.name()).unwrap_or("-");
        let elapsed_ms = ctx.started.elapsed().as_millis() as u64;

        match e {
            Some(err) => tracing::warn!(
                acl = acl,
                backend = backend,
                path = path,
                status = status,
                elapsed_ms = elapsed_ms,
                error = %err,
                "request failed"
            ),
            None => tracing::info!(
                acl = acl,
                backend = backend,
                method = session.req_header().method.as_str(),
                path = path,
                status = status,
                elapsed_ms = elapsed_ms,
                "request completed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::acl::AclConfig;
    use crate::proxy::request::test_support::OwnedRequest;
    use crate::registry::Registry;
    use crate::shard::{BackendDefaults, BackendDefinition};
    use pingora_core::upstreams::peer::Peer;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<String>>);

    impl ErrorReporter for Recording {
        fn capture(&self, message: &str, _request_url: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    fn lookup_acl(id: &str, criterion: &str) -> Acl {
        let config: AclConfig = serde_json::from_value(json!({
            "id": id,
            "criterion": criterion,
            "endpoint": {
                "matcher": "path",
                "shard_expr": "/(GF-|R-).*",
                "shard_func": "lookup",
                "shard_config": {
                    "GF-": {"backend_name": "backendA", "backend": "http://backend-a.local"},
                    "R-": {"backend_name": "backendB", "backend": "http://backend-b.local"}
                }
            }
        }))
        .unwrap();
        Acl::load(config, &Registry::default()).unwrap()
    }

    fn gateway_with(acls: Vec<Acl>) -> (GatewayProxy, Arc<Recording>) {
        let router = Arc::new(Router::new());
        for acl in acls {
            router.upsert_acl(acl).unwrap();
        }
        let reporter = Arc::new(Recording::default());
        let proxy = GatewayProxy::new(router, reporter.clone(), DEFAULT_MAX_BODY_BYTES);
        (proxy, reporter)
    }

    // ========== Phase 1: Construction ==========

    #[test]
    fn test_gateway_proxy_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<GatewayProxy>();
    }

    #[test]
    fn test_gateway_ctx_default() {
        let ctx = GatewayCtx::default();
        assert!(ctx.acl.is_none());
        assert!(ctx.backend.is_none());
        assert!(ctx.upstream.is_none());
        assert!(ctx.body.is_none());
    }

    #[test]
    fn test_body_limit_is_capped_at_replay_size() {
        let router = Arc::new(Router::new());
        let proxy = GatewayProxy::new(router, Arc::new(Recording::default()), 1 << 20);
        assert_eq!(proxy.max_body_bytes, MAX_REPLAY_BYTES);
    }

    #[test]
    fn test_health_check_paths() {
        assert!(is_health_check("/"));
        assert!(is_health_check("/ping"));
        assert!(!is_health_check("/ping/"));
        assert!(!is_health_check("/pingx"));
    }

    // ========== Phase 2: Routing & Sharding ==========

    #[test]
    fn test_routes_and_shards_to_backend() {
        let (proxy, _) = gateway_with(vec![lookup_acl("svc-01", "PathRegexp(`/(GF-|R-)`)")]);
        let req = OwnedRequest::get("/R-1234");

        let acl = proxy.locate(&req.view()).unwrap();
        assert_eq!(acl.id, "svc-01");
        let backend = proxy.select(&acl, &req.view()).unwrap();
        assert_eq!(backend.name(), "backendB");
    }

    #[test]
    fn test_unregistered_path_is_not_found() {
        let (proxy, _) = gateway_with(vec![lookup_acl("svc-01", "Path(`/R-1234`)")]);
        let err = proxy.locate(&OwnedRequest::get("/unknown").view()).unwrap_err();
        assert_eq!(err, HttpError::NotFound);
        assert_eq!(err.status().as_u16(), 404);
    }

    #[test]
    fn test_missing_backend_is_unavailable() {
        let (proxy, _) = gateway_with(vec![lookup_acl("svc-01", "PathRegexp(`/`)")]);
        let req = OwnedRequest::get("/XX-1");
        let acl = proxy.locate(&req.view()).unwrap();
        assert_eq!(proxy.select(&acl, &req.view()).unwrap_err(), HttpError::ServiceUnavailable);
    }

    #[test]
    fn test_shard_error_is_unavailable() {
        let config: AclConfig = serde_json::from_value(json!({
            "id": "mod",
            "criterion": "PathRegexp(`/`)",
            "endpoint": {
                "matcher": "header",
                "shard_expr": "X-Id",
                "shard_func": "modulo",
                "shard_config": {"0": {"backend_name": "a", "backend": "http://a.local"}}
            }
        }))
        .unwrap();
        let (proxy, reporter) = gateway_with(vec![Acl::load(config, &Registry::default()).unwrap()]);

        let req = OwnedRequest::get("/").header("X-Id", "abc");
        let acl = proxy.locate(&req.view()).unwrap();
        assert_eq!(proxy.select(&acl, &req.view()).unwrap_err(), HttpError::ServiceUnavailable);
        assert!(reporter.0.lock().unwrap().is_empty());
    }

    // ========== Phase 3: Body Buffering ==========

    #[test]
    fn test_body_buffer_holds_bodies_past_replay_size() {
        let chunk = vec![b'x'; 16 * 1024];
        let mut buffer = BodyBuffer::new(256 * 1024);
        for _ in 0..5 {
            assert!(buffer.push(&chunk));
        }

        assert_eq!(buffer.len(), 80 * 1024);
        let body = buffer.freeze();
        assert_eq!(body.len(), 80 * 1024);
        assert!(body.iter().all(|b| *b == b'x'));
    }

    #[test]
    fn test_body_buffer_rejects_chunk_over_limit() {
        let mut buffer = BodyBuffer::new(MAX_REPLAY_BYTES);
        assert!(buffer.push(&vec![b'a'; MAX_REPLAY_BYTES - 1]));
        assert!(buffer.push(b"b"));
        assert!(!buffer.push(b"c"));
        assert_eq!(buffer.len(), MAX_REPLAY_BYTES);
    }

    #[test]
    fn test_empty_body_buffer() {
        let buffer = BodyBuffer::new(8);
        assert!(buffer.is_empty());
        assert!(buffer.freeze().is_empty());
    }

    // ========== Phase 4: Upstream & Panics ==========

    fn backend(url: &str, defaults: &BackendDefaults) -> Backend {
        let definition = BackendDefinition {
            backend_name: "shard-a".to_string(),
            backend_url: url.to_string(),
            timeout: None,
        };
        Backend::from_definition(&definition, defaults).unwrap()
    }

    #[tokio::test]
    async fn test_upstream_plan_resolves_peer_and_uri() {
        let backend = backend("http://127.0.0.1:9000/base", &BackendDefaults::default());
        let request: Uri = "/R-1?x=1".parse().unwrap();

        let upstream = Upstream::plan(&backend, &request).await.unwrap();
        assert_eq!(upstream.peer.address().to_string(), "127.0.0.1:9000");
        assert_eq!(upstream.uri, "/base/R-1?x=1");
        assert!(!upstream.keep_alive);
    }

    #[tokio::test]
    async fn test_upstream_plan_carries_keep_alive() {
        let defaults = BackendDefaults {
            keep_alive: true,
            ..BackendDefaults::default()
        };
        let backend = backend("http://127.0.0.1:9000", &defaults);
        let upstream = Upstream::plan(&backend, &"/".parse().unwrap()).await.unwrap();
        assert!(upstream.keep_alive);
    }

    #[tokio::test]
    async fn test_panic_while_preparing_is_internal_and_reported() {
        async fn plan_that_panics() -> Option<HttpError> {
            tokio::task::yield_now().await;
            panic!("resolver exploded")
        }
        let (proxy, reporter) = gateway_with(vec![]);

        let outcome = recover_async(plan_that_panics()).await;
        assert_eq!(proxy.settle(outcome, "/R-1"), Err(HttpError::Internal));
        assert_eq!(
            reporter.0.lock().unwrap().as_slice(),
            &["resolver exploded".to_string()]
        );
    }

    #[tokio::test]
    async fn test_completed_preparation_is_not_reported() {
        let (proxy, reporter) = gateway_with(vec![]);

        let outcome = recover_async(async { Some(HttpError::NotFound) }).await;
        assert_eq!(proxy.settle(outcome, "/R-1"), Ok(Some(HttpError::NotFound)));
        assert!(reporter.0.lock().unwrap().is_empty());
    }
}
