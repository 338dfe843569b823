//! Borrowed view of a downstream request.

use std::borrow::Cow;

use http::{HeaderMap, Method, Uri};

/// The parts of a request that routing and shard-key extraction read.
///
/// `body` is only populated when the matched ACL needs it; the proxy
/// buffers it before sharding.
#[derive(Debug, Clone, Copy)]
pub struct RequestView<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
    pub body: Option<&'a [u8]>,
}

impl<'a> RequestView<'a> {
    pub fn new(method: &'a Method, uri: &'a Uri, headers: &'a HeaderMap) -> Self {
        Self {
            method,
            uri,
            headers,
            body: None,
        }
    }

    pub fn with_body(mut self, body: &'a [u8]) -> Self {
        self.body = Some(body);
        self
    }

    /// Percent-decoded path. A path that does not decode to UTF-8 is
    /// returned as sent.
    pub fn path(&self) -> Cow<'a, str> {
        let raw = self.uri.path();
        urlencoding::decode(raw).unwrap_or(Cow::Borrowed(raw))
    }

    /// Host from the URI authority, else the `Host` header. No port, lowercase.
    pub fn host(&self) -> String {
        let raw = self
            .uri
            .host()
            .or_else(|| self.headers.get(http::header::HOST).and_then(|v| v.to_str().ok()))
            .unwrap_or_default();
        strip_port(raw).to_ascii_lowercase()
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    host.split(':').next().unwrap_or(host)
}
