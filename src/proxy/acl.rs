//! ACLs: routing rules pairing a criterion with an endpoint.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::endpoint::{Endpoint, EndpointConfig, EndpointError};
use crate::registry::Registry;

/// The persisted form of an ACL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclConfig {
    pub id: String,
    pub criterion: String,
    pub endpoint: EndpointConfig,
}

impl AclConfig {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl fmt::Display for AclConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ACL({}, {})", self.id, self.criterion)
    }
}

/// A loaded ACL: its config plus the endpoint derived from it.
///
/// The endpoint is never persisted; it is rebuilt from the config each
/// time the ACL is loaded.
#[derive(Debug)]
pub struct Acl {
    pub id: String,
    pub criterion: String,
    pub endpoint_config: EndpointConfig,
    pub endpoint: Endpoint,
}

impl Acl {
    pub fn load(config: AclConfig, registry: &Registry) -> Result<Self, EndpointError> {
        let endpoint = Endpoint::new(&config.endpoint, registry)?;
        Ok(Self {
            id: config.id,
            criterion: config.criterion,
            endpoint_config: config.endpoint,
            endpoint,
        })
    }

    pub fn config(&self) -> AclConfig {
        AclConfig {
            id: self.id.clone(),
            criterion: self.criterion.clone(),
            endpoint: self.endpoint_config.clone(),
        }
    }
}

impl fmt::Display for Acl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ACL({}, {})", self.id, self.criterion)
    }
}
