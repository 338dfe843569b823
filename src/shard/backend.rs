//! Upstream backends and their declarative definitions.
//!
//! A `Backend` is immutable once built and shared (via `Arc`) by every
//! request that shards to it. The Pingora peer used to reach it is
//! derived per request so DNS changes are picked up without a reload.

use std::net::SocketAddr;
use std::time::Duration;

use http::uri::InvalidUri;
use http::Uri;
use pingora_core::upstreams::peer::HttpPeer;
use serde::{Deserialize, Serialize};
use url::Url;

/// Errors raised while turning a `BackendDefinition` into a `Backend`.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("missing backend name in shard config: {0}")]
    MissingName(String),

    #[error("missing backend url in shard config: {0}")]
    MissingUrl(String),

    #[error("URL Parsing failed for: {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported backend url '{0}': expected http(s) scheme with a host")]
    UnsupportedUrl(String),
}

/// One entry of a `shard_config`, as persisted in the config store.
///
/// Name and URL default to empty so that a missing field is reported by
/// `validate` with the offending definition instead of a serde error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDefinition {
    #[serde(default)]
    pub backend_name: String,

    #[serde(rename = "backend", default)]
    pub backend_url: String,

    /// Dial timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

impl BackendDefinition {
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.backend_name.is_empty() {
            return Err(BackendError::MissingName(format!("{:?}", self)));
        }
        if self.backend_url.is_empty() {
            return Err(BackendError::MissingUrl(format!("{:?}", self)));
        }
        Ok(())
    }
}

/// Process-wide connection settings applied to every backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendDefaults {
    pub dial_timeout: Duration,
    pub idle_timeout: Duration,
    pub keep_alive: bool,
}

impl Default for BackendDefaults {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_millis(1000),
            idle_timeout: Duration::from_millis(90_000),
            keep_alive: false,
        }
    }
}

/// A named upstream target.
#[derive(Debug)]
pub struct Backend {
    name: String,
    url: Url,
    dial_timeout: Duration,
    idle_timeout: Duration,
    keep_alive: bool,
}

impl Backend {
    /// Validates `definition` and builds a backend from it.
    ///
    /// A per-backend `timeout` overrides the default dial timeout.
    pub fn from_definition(
        definition: &BackendDefinition,
        defaults: &BackendDefaults,
    ) -> Result<Self, BackendError> {
        definition.validate()?;

        let dial_timeout = definition
            .timeout
            .map(|ms| Duration::from_millis(ms as u64))
            .unwrap_or(defaults.dial_timeout);

        Self::new(
            &definition.backend_name,
            &definition.backend_url,
            dial_timeout,
            defaults,
        )
    }

    fn new(
        name: &str,
        server_url: &str,
        dial_timeout: Duration,
        defaults: &BackendDefaults,
    ) -> Result<Self, BackendError> {
        let url = Url::parse(server_url).map_err(|source| BackendError::InvalidUrl {
            url: server_url.to_string(),
            source,
        })?;

        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(BackendError::UnsupportedUrl(server_url.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            url,
            dial_timeout,
            idle_timeout: defaults.idle_timeout,
            keep_alive: defaults.keep_alive,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn is_tls(&self) -> bool {
        self.url.scheme() == "https"
    }

    /// Host used for SNI. IPv6 literals come back without brackets.
    pub fn sni(&self) -> String {
        self.url
            .host_str()
            .unwrap_or_default()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string()
    }

    /// `host:port` of the backend, with the scheme's default port filled in.
    pub fn authority(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        let port = self.url.port_or_known_default().unwrap_or(80);
        format!("{}:{}", host, port)
    }

    /// Resolves the backend host and builds the Pingora peer for it.
    pub async fn peer(&self) -> std::io::Result<HttpPeer> {
        let addr = tokio::net::lookup_host(self.authority())
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no address for backend {}", self.authority()),
                )
            })?;

        Ok(self.peer_for(addr))
    }

    /// Builds the Pingora peer for an already resolved address.
    pub fn peer_for(&self, addr: SocketAddr) -> HttpPeer {
        let mut peer = HttpPeer::new(addr, self.is_tls(), self.sni());
        peer.options.connection_timeout = Some(self.dial_timeout);
        peer.options.idle_timeout = Some(self.idle_timeout);
        peer
    }

    /// Rewrites a downstream request URI for this backend.
    ///
    /// The backend path is joined with the request path by a single `/`
    /// and the backend query, if any, goes in front of the request query.
    pub fn upstream_uri(&self, request: &Uri) -> Result<Uri, InvalidUri> {
        let path = join_paths(self.url.path(), request.path());

        let query = match (self.url.query(), request.query()) {
            (Some(base), Some(extra)) if !base.is_empty() && !extra.is_empty() => {
                Some(format!("{}&{}", base, extra))
            }
            (Some(base), _) if !base.is_empty() => Some(base.to_string()),
            (_, Some(extra)) if !extra.is_empty() => Some(extra.to_string()),
            _ => None,
        };

        match query {
            Some(q) => format!("{}?{}", path, q).parse(),
            None => path.parse(),
        }
    }
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(name: &str, url: &str) -> BackendDefinition {
        BackendDefinition {
            backend_name: name.to_string(),
            backend_url: url.to_string(),
            timeout: None,
        }
    }

    fn backend(url: &str) -> Backend {
        Backend::from_definition(&definition("svc", url), &BackendDefaults::default()).unwrap()
    }

    #[test]
    fn test_missing_name_is_rejected() {
        let err = Backend::from_definition(
            &definition("", "http://localhost"),
            &BackendDefaults::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("missing backend name in shard config:"));
    }

    #[test]
    fn test_missing_url_is_rejected() {
        let err = Backend::from_definition(&definition("svc", ""), &BackendDefaults::default())
            .unwrap_err();
        assert!(err.to_string().contains("missing backend url in shard config:"));
    }

    #[test]
    fn test_malformed_url_is_rejected() {
        let err = Backend::from_definition(
            &definition("svc", "ht$tp://shard00.local"),
            &BackendDefaults::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("URL Parsing failed for"));
    }

    #[test]
    fn test_timeout_overrides_default_dial_timeout() {
        let mut def = definition("svc", "http://localhost");
        def.timeout = Some(100.0);
        let backend = Backend::from_definition(&def, &BackendDefaults::default()).unwrap();
        assert_eq!(backend.dial_timeout(), Duration::from_millis(100));
        assert_eq!(backend.name(), "svc");
    }

    #[test]
    fn test_authority_fills_default_port() {
        assert_eq!(backend("http://shard00.local").authority(), "shard00.local:80");
        assert_eq!(backend("https://shard00.local").authority(), "shard00.local:443");
        assert_eq!(backend("http://10.0.0.1:9090").authority(), "10.0.0.1:9090");
    }

    #[test]
    fn test_peer_carries_timeouts_and_tls() {
        let backend = backend("https://secure.local");
        let peer = backend.peer_for("127.0.0.1:443".parse().unwrap());
        assert!(peer.is_tls());
        assert_eq!(peer.sni, "secure.local");
        assert_eq!(peer.options.connection_timeout, Some(backend.dial_timeout()));
    }

    #[test]
    fn test_upstream_uri_joins_paths() {
        let uri: Uri = "/R-1234?x=1".parse().unwrap();

        assert_eq!(
            backend("http://localhost").upstream_uri(&uri).unwrap(),
            "/R-1234?x=1"
        );
        assert_eq!(
            backend("http://localhost/r").upstream_uri(&uri).unwrap(),
            "/r/R-1234?x=1"
        );
        assert_eq!(
            backend("http://localhost/r/").upstream_uri(&uri).unwrap(),
            "/r/R-1234?x=1"
        );
    }

    #[test]
    fn test_upstream_uri_merges_queries() {
        let uri: Uri = "/orders?id=7".parse().unwrap();
        assert_eq!(
            backend("http://localhost/api?tenant=a").upstream_uri(&uri).unwrap(),
            "/api/orders?tenant=a&id=7"
        );

        let bare: Uri = "/orders".parse().unwrap();
        assert_eq!(
            backend("http://localhost/api?tenant=a").upstream_uri(&bare).unwrap(),
            "/api/orders?tenant=a"
        );
    }

    #[test]
    fn test_backend_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Backend>();
    }
}
