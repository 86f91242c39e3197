//! Route dispatch as a tower service: the innermost layer of the inbound
//! pipeline.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use switchyard_core::Exchange;
use tower::Service;

use crate::error::EngineError;
use crate::routing::RoutingEngine;

/// Future type shared by every service in the inbound pipeline.
pub type ExchangeFuture = Pin<Box<dyn Future<Output = Result<Exchange, EngineError>> + Send>>;

/// Submits each exchange to one route and resolves when it finishes.
#[derive(Debug, Clone)]
pub struct RouteService {
    engine: RoutingEngine,
    route_id: Arc<str>,
}

impl RouteService {
    #[must_use]
    pub fn new(engine: RoutingEngine, route_id: &str) -> Self {
        Self {
            engine,
            route_id: Arc::from(route_id),
        }
    }

    #[must_use]
    pub fn route_id(&self) -> &str {
        &self.route_id
    }
}

impl Service<Exchange> for RouteService {
    type Response = Exchange;
    type Error = EngineError;
    type Future = ExchangeFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Admission is decided per exchange by `submit`.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, exchange: Exchange) -> Self::Future {
        let engine = self.engine.clone();
        let route_id = Arc::clone(&self.route_id);
        Box::pin(async move { engine.process(&route_id, exchange).await })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::*;
    use crate::definition::{RouteDefinition, StepDefinition};

    #[tokio::test]
    async fn dispatches_to_the_named_route() {
        let engine = RoutingEngine::builder().build();
        engine
            .add_route(&RouteDefinition::new("r", "direct:r").step(StepDefinition::ConvertBodyTo {
                to: "string".to_string(),
            }))
            .unwrap();
        engine.start().await.unwrap();

        let svc = RouteService::new(engine.clone(), "r");
        let done = svc.oneshot(engine.create_exchange_with_body(7_i64)).await.unwrap();
        assert_eq!(done.body().and_then(|b| b.as_str()), Some("7"));
        assert_eq!(done.from_route(), Some("r"));

        let missing = RouteService::new(engine.clone(), "missing");
        assert!(matches!(
            missing.oneshot(engine.create_exchange()).await,
            Err(EngineError::UnknownRoute(_))
        ));
        engine.stop().await.unwrap();
    }
}
