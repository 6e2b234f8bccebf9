//! Observability: subscriber setup and per-call tracing
//!
//! The crate itself only emits `tracing` events. Binaries decide where they
//! go; [`init_tracing`] is the default: a fmt subscriber filtered through
//! `RUST_LOG`, falling back to `info`.
//!
//! [`TracingLayer`] decorates a tower service (typically the HTTP client
//! behind a [`ServiceOperation`](crate::operation::ServiceOperation)) with a
//! span per remote call and a completion event carrying latency and status.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{debug, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;

use crate::error::OperationError;

const DEFAULT_FILTER: &str = "info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global fmt subscriber.
///
/// Safe to call more than once; only the first call installs anything.
pub fn init_tracing() {
    let _ = try_init_tracing();
}

/// Like [`init_tracing`] but reports whether a subscriber was already set.
pub fn try_init_tracing() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .try_init()
}

/// Layer that wraps every call in an `operation_call` span.
#[derive(Debug, Clone, Copy)]
pub struct TracingLayer {
    name: &'static str,
}

impl TracingLayer {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl Default for TracingLayer {
    fn default() -> Self {
        Self::new("operation")
    }
}

#[derive(Debug, Clone)]
pub struct Traced<S> {
    inner: S,
    name: &'static str,
}

impl<S> Layer<S> for TracingLayer {
    type Service = Traced<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Traced {
            inner,
            name: self.name,
        }
    }
}

impl<S, I> Service<I> for Traced<S>
where
    S: Service<I, Error = OperationError>,
    S::Future: Send + 'static,
    S::Response: 'static,
{
    type Response = S::Response;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, OperationError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: I) -> Self::Future {
        let span = info_span!("operation_call", name = self.name);
        let fut = self.inner.call(req);
        Box::pin(
            async move {
                let started = Instant::now();
                let out = fut.await;
                let elapsed_ms = started.elapsed().as_millis() as u64;
                match &out {
                    Ok(_) => debug!(elapsed_ms, "call ok"),
                    Err(e) => warn!(elapsed_ms, status = ?e.status(), error = %e, "call failed"),
                }
                out
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::{service_fn, ServiceExt};

    #[tokio::test]
    async fn traced_service_passes_results_through() {
        let svc = TracingLayer::new("echo").layer(service_fn(|n: u32| async move {
            if n == 0 {
                Err(OperationError::http(500, "boom"))
            } else {
                Ok(n * 2)
            }
        }));
        assert_eq!(svc.clone().oneshot(4).await.unwrap(), 8);
        let err = svc.oneshot(0).await.unwrap_err();
        assert_eq!(err.status(), Some(500));
    }
}
