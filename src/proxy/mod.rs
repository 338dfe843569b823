//! HTTP request routing and sharding.
//!
//! Incoming requests are matched against ACL criteria by the `Router`.
//! The winning ACL's `Endpoint` extracts a shard key from the request and
//! hands it to a sharder, which picks the backend the gateway forwards to.

mod acl;
mod criterion;
mod endpoint;
mod gateway;
mod http_error;
mod matcher;
mod recovery;
pub(crate) mod request;
mod router;

pub use acl::{Acl, AclConfig};
pub use criterion::{Criterion, CriterionError};
pub use endpoint::{Endpoint, EndpointConfig, EndpointError};
pub use gateway::{is_health_check, GatewayCtx, GatewayProxy, DEFAULT_MAX_BODY_BYTES, MAX_REPLAY_BYTES};
pub use http_error::HttpError;
pub use matcher::{BodyQuery, BoundMatcher, MatchError, MatcherKind};
pub use recovery::{ErrorReporter, TracingReporter};
pub use request::RequestView;
pub use router::{Router, RouterError};
