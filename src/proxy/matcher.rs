//! Shard-key extraction from requests.
//!
//! A `MatcherKind` is bound to its shard expression once, when the ACL's
//! endpoint is built, so regexes and body queries are compiled a single
//! time and the per-request work is a lookup.

use regex::Regex;
use serde_json::Value;

use super::request::RequestView;

/// Errors from binding or running a matcher.
#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("failed to find a matcher for: {0}")]
    NotFound(String),

    #[error("invalid path pattern {expr}: {source}")]
    InvalidPattern {
        expr: String,
        #[source]
        source: regex::Error,
    },

    #[error("no match found for expr: {0}")]
    NoMatch(String),

    #[error("expr has no capture group: {0}")]
    NoCaptureGroup(String),

    #[error("failed to parse shard expr: {expr}: {reason}")]
    InvalidQuery { expr: String, reason: String },

    #[error("failed to unmarshal request body for shard expr: {expr}: {source}")]
    MalformedBody {
        expr: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to apply parsed shard expr: {0}")]
    QueryMiss(String),

    #[error("failed to type assert bodyKey")]
    TypeAssertion,
}

/// The named extraction strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherKind {
    Header,
    MultiHeaders,
    Param,
    Path,
    Body,
}

impl MatcherKind {
    pub const ALL: [MatcherKind; 5] = [
        MatcherKind::Header,
        MatcherKind::MultiHeaders,
        MatcherKind::Param,
        MatcherKind::Path,
        MatcherKind::Body,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MatcherKind::Header => "header",
            MatcherKind::MultiHeaders => "multi-headers",
            MatcherKind::Param => "param",
            MatcherKind::Path => "path",
            MatcherKind::Body => "body",
        }
    }

    /// Compiles `expr` for this strategy.
    pub fn bind(self, expr: &str) -> Result<BoundMatcher, MatchError> {
        let bound = match self {
            MatcherKind::Header => BoundMatcher::Header(expr.to_string()),
            MatcherKind::MultiHeaders => BoundMatcher::MultiHeaders(
                expr.split(',').map(|h| h.trim().to_string()).collect(),
            ),
            MatcherKind::Param => BoundMatcher::Param(expr.to_string()),
            MatcherKind::Path => {
                let re = Regex::new(expr).map_err(|source| MatchError::InvalidPattern {
                    expr: expr.to_string(),
                    source,
                })?;
                BoundMatcher::Path {
                    expr: expr.to_string(),
                    re,
                }
            }
            MatcherKind::Body => BoundMatcher::Body {
                expr: expr.to_string(),
                query: BodyQuery::parse(expr)?,
            },
        };
        Ok(bound)
    }
}

/// A matcher with its expression compiled in.
#[derive(Debug)]
pub enum BoundMatcher {
    Header(String),
    MultiHeaders(Vec<String>),
    Param(String),
    Path { expr: String, re: Regex },
    Body { expr: String, query: BodyQuery },
}

impl BoundMatcher {
    /// Extracts the shard key from `req`.
    pub fn shard_key(&self, req: &RequestView<'_>) -> Result<String, MatchError> {
        match self {
            BoundMatcher::Header(name) => Ok(header_value(req, name)),
            BoundMatcher::MultiHeaders(names) => Ok(names
                .iter()
                .map(|name| header_value(req, name))
                .collect::<Vec<_>>()
                .join(",")),
            BoundMatcher::Param(name) => Ok(req
                .uri
                .query()
                .and_then(|q| {
                    url::form_urlencoded::parse(q.as_bytes())
                        .find(|(k, _)| k == name)
                        .map(|(_, v)| v.into_owned())
                })
                .unwrap_or_default()),
            BoundMatcher::Path { expr, re } => {
                let path = req.path();
                let caps = re
                    .captures(&path)
                    .ok_or_else(|| MatchError::NoMatch(expr.clone()))?;
                if caps.len() < 2 {
                    return Err(MatchError::NoCaptureGroup(expr.clone()));
                }
                Ok(caps
                    .get(1)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default())
            }
            BoundMatcher::Body { expr, query } => {
                let doc: Value = serde_json::from_slice(req.body.unwrap_or_default()).map_err(
                    |source| MatchError::MalformedBody {
                        expr: expr.clone(),
                        source,
                    },
                )?;
                let found = query
                    .apply(&doc)
                    .ok_or_else(|| MatchError::QueryMiss(expr.clone()))?;
                scalar_key(found)
            }
        }
    }

    /// Whether extraction needs the buffered request body.
    pub fn reads_body(&self) -> bool {
        matches!(self, BoundMatcher::Body { .. })
    }
}

/// First value of the header, or empty when absent or unnamed.
fn header_value(req: &RequestView<'_>, name: &str) -> String {
    if name.is_empty() {
        return String::new();
    }
    req.headers
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default()
}

fn scalar_key(value: &Value) -> Result<String, MatchError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(i), _, _) => i.to_string(),
            (_, Some(u), _) => u.to_string(),
            (_, _, Some(f)) => f.to_string(),
            _ => n.to_string(),
        }),
        _ => Err(MatchError::TypeAssertion),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Key(String),
    Index(usize),
}

/// A path into a JSON document: `.a.b`, `.items.[0].id` or `.items[0].id`.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyQuery {
    steps: Vec<Step>,
}

impl BodyQuery {
    pub fn parse(expr: &str) -> Result<Self, MatchError> {
        let invalid = |reason: &str| MatchError::InvalidQuery {
            expr: expr.to_string(),
            reason: reason.to_string(),
        };

        let rest = expr
            .strip_prefix('.')
            .ok_or_else(|| invalid("query must start with '.'"))?;

        let mut steps = Vec::new();
        if rest.is_empty() {
            return Ok(Self { steps });
        }

        for segment in rest.split('.') {
            if segment.is_empty() {
                return Err(invalid("empty path segment"));
            }

            let (key, mut indices) = match segment.find('[') {
                Some(idx) => (&segment[..idx], &segment[idx..]),
                None => (segment, ""),
            };
            if !key.is_empty() {
                steps.push(Step::Key(key.to_string()));
            }

            while !indices.is_empty() {
                let close = indices
                    .find(']')
                    .ok_or_else(|| invalid("unterminated index"))?;
                let index = indices[1..close]
                    .parse()
                    .map_err(|_| invalid("array index must be a non-negative integer"))?;
                steps.push(Step::Index(index));
                indices = &indices[close + 1..];
                if !indices.is_empty() && !indices.starts_with('[') {
                    return Err(invalid("unexpected characters after index"));
                }
            }
        }

        Ok(Self { steps })
    }

    fn apply<'v>(&self, doc: &'v Value) -> Option<&'v Value> {
        self.steps.iter().try_fold(doc, |node, step| match step {
            Step::Key(k) => node.as_object()?.get(k),
            Step::Index(i) => node.as_array()?.get(*i),
        })
    }
}
