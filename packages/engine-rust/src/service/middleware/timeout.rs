//! Timeout middleware for inbound exchanges.
//!
//! An exchange that runs past the timeout has its cancellation token
//! triggered. The engine notices at the next safe point and unwinds it, and
//! the caller then receives `EngineError::Timeout`.

use std::task::{Context, Poll};
use std::time::Duration;

use switchyard_core::Exchange;
use tower::{Layer, Service};

use crate::error::EngineError;
use crate::service::router::ExchangeFuture;

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer enforcing a per-exchange timeout. `None` passes exchanges
/// through untouched.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutLayer {
    timeout: Option<Duration>,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            timeout: self.timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    timeout: Option<Duration>,
}

impl<S> Service<Exchange> for TimeoutService<S>
where
    S: Service<Exchange, Response = Exchange, Error = EngineError> + Send,
    S::Future: Send + 'static,
{
    type Response = Exchange;
    type Error = EngineError;
    type Future = ExchangeFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, exchange: Exchange) -> Self::Future {
        let Some(timeout) = self.timeout else {
            return Box::pin(self.inner.call(exchange));
        };
        let token = exchange.context().cancellation.clone();
        let exchange_id = exchange.id();
        let fut = self.inner.call(exchange);
        Box::pin(async move {
            tokio::pin!(fut);
            match tokio::time::timeout(timeout, &mut fut).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    tracing::warn!(%exchange_id, timeout_ms = timeout.as_millis(), "exchange timed out, cancelling");
                    token.cancel();
                    // The traversal still owns the exchange; let it unwind.
                    let _ = fut.await;
                    Err(EngineError::Timeout {
                        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    })
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
