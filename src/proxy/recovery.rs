//! Panic containment for the request path.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;

/// Receives panics recovered while serving a request.
pub trait ErrorReporter: Send + Sync {
    fn capture(&self, message: &str, request_url: &str);
}

/// Reports panics as error-level log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn capture(&self, message: &str, request_url: &str) {
        tracing::error!(error = message, request_url = request_url, "recovered from panic");
    }
}

/// Awaits `fut`, turning a panic while polling it into `Err` with the
/// panic message.
pub async fn recover_async<F: Future>(fut: F) -> Result<F::Output, String> {
    AssertUnwindSafe(fut).catch_unwind().await.map_err(panic_message)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic".to_string()
}
