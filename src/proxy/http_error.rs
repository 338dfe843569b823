//! Fixed JSON error responses returned to clients.

use bytes::Bytes;
use http::StatusCode;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ErrorResponse<'a> {
    errors: [ErrorDetails<'a>; 1],
}

#[derive(Debug, Serialize)]
struct ErrorDetails<'a> {
    code: &'a str,
    message: &'a str,
    message_title: &'a str,
    message_severity: &'a str,
}

/// The error responses the proxy can produce.
///
/// Bodies never carry internal error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpError {
    /// No ACL matched the request.
    NotFound,
    /// The ACL matched but no backend could be picked.
    ServiceUnavailable,
    /// Serving the request panicked before it was forwarded.
    Internal,
}

impl HttpError {
    pub fn status(&self) -> StatusCode {
        match self {
            HttpError::NotFound => StatusCode::NOT_FOUND,
            HttpError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            HttpError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            HttpError::NotFound => "weaver:route:not_found",
            HttpError::ServiceUnavailable | HttpError::Internal => "weaver:service:unavailable",
        }
    }

    fn title(&self) -> &'static str {
        match self {
            HttpError::Internal => "Internal error",
            _ => "Failure",
        }
    }

    pub fn body(&self) -> Bytes {
        let response = ErrorResponse {
            errors: [ErrorDetails {
                code: self.code(),
                message: "Something went wrong",
                message_title: self.title(),
                message_severity: "failure",
            }],
        };
        serde_json::to_vec(&response)
            .map(Bytes::from)
            .unwrap_or_default()
    }
}
