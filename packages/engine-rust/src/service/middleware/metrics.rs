//! Metrics middleware for inbound exchanges.
//!
//! Each exchange runs inside an `exchange` span; duration and outcome are
//! recorded on the span and in the `switchyard_exchange_duration_seconds`
//! histogram.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use switchyard_core::Exchange;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::error::EngineError;
use crate::service::router::ExchangeFuture;

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsLayer {
    route_id: Arc<str>,
}

impl MetricsLayer {
    #[must_use]
    pub fn new(route_id: &str) -> Self {
        Self {
            route_id: Arc::from(route_id),
        }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            route_id: Arc::clone(&self.route_id),
        }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
    route_id: Arc<str>,
}

fn outcome(result: &Result<Exchange, EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(EngineError::Overloaded) => "shed",
        Err(EngineError::Timeout { .. }) => "timeout",
        Err(_) => "error",
    }
}

impl<S> Service<Exchange> for MetricsService<S>
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
        let route_id = Arc::clone(&self.route_id);
        let span = info_span!(
            "exchange",
            route = %route_id,
            exchange_id = %exchange.id(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(exchange);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();
                let outcome = outcome(&result);

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);
                metrics::histogram!(
                    "switchyard_exchange_duration_seconds",
                    "route" => route_id.to_string(),
                    "outcome" => outcome
                )
                .record(elapsed.as_secs_f64());

                tracing::debug!(route = %route_id, duration_ms, outcome, "exchange complete");
                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use switchyard_core::{ExchangeContext, ExchangeId, RouteError, TypeConverterRegistry};
    use tower::ServiceExt;

    use super::*;

    struct FailingService;

    impl Service<Exchange> for FailingService {
        type Response = Exchange;
        type Error = EngineError;
        type Future = ExchangeFuture;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, exchange: Exchange) -> Self::Future {
            Box::pin(async move {
                Err(EngineError::ExchangeFailed {
                    exchange_id: exchange.id(),
                    source: RouteError::processing("stub", "nope"),
                })
            })
        }
    }

    #[tokio::test]
    async fn passes_results_through() {
        let svc = MetricsLayer::new("r").layer(FailingService);
        let ex = Exchange::new(Arc::new(ExchangeContext::new(Arc::new(
            TypeConverterRegistry::default(),
        ))));
        let id = ex.id();
        match svc.oneshot(ex).await {
            Err(EngineError::ExchangeFailed { exchange_id, .. }) => assert_eq!(exchange_id, id),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn outcomes_are_classified() {
        assert_eq!(outcome(&Err(EngineError::Overloaded)), "shed");
        assert_eq!(outcome(&Err(EngineError::Timeout { timeout_ms: 1 })), "timeout");
        assert_eq!(outcome(&Err(EngineError::NoReply(ExchangeId::new()))), "error");
    }
}
