//! Pipeline composition: combines all middleware layers into a single service stack.

use switchyard_core::Exchange;
use tower::ServiceBuilder;

use super::load_shed::LoadShedLayer;
use super::metrics::MetricsLayer;
use super::timeout::TimeoutLayer;
use crate::error::EngineError;
use crate::service::config::EngineConfig;
use crate::service::router::{ExchangeFuture, RouteService};

/// Wraps a [`RouteService`] with the inbound middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject when overloaded (fail fast before doing any work)
/// 2. `TimeoutLayer` -- cancel exchanges that exceed `exchange_timeout`
/// 3. `MetricsLayer` -- record timing and outcome (closest to the route)
///
/// `load_shed` is passed in rather than built here so every route shares
/// the engine's permits.
#[must_use]
pub fn build_inbound_pipeline(
    route: RouteService,
    load_shed: &LoadShedLayer,
    config: &EngineConfig,
) -> impl tower::Service<Exchange, Response = Exchange, Error = EngineError, Future = ExchangeFuture>
       + Clone
       + Send {
    let metrics = MetricsLayer::new(route.route_id());
    ServiceBuilder::new()
        .layer(load_shed.clone())
        .layer(TimeoutLayer::new(config.exchange_timeout))
        .layer(metrics)
        .service(route)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use switchyard_core::RouteError;
    use tower::{Service, ServiceExt};

    use super::*;
    use crate::definition::{RouteDefinition, StepDefinition};
    use crate::routing::RoutingEngine;

    async fn engine(config: EngineConfig) -> RoutingEngine {
        let engine = RoutingEngine::builder().config(config).build();
        engine
            .add_route(
                &RouteDefinition::new("slow", "direct:slow").step(StepDefinition::Delay { millis: 5_000 }),
            )
            .unwrap();
        engine
            .add_route(&RouteDefinition::new("fast", "direct:fast").step(StepDefinition::To {
                uri: "mock:fast".to_string(),
            }))
            .unwrap();
        engine.start().await.unwrap();
        engine
    }

    #[tokio::test]
    async fn routes_through_all_layers() {
        let engine = engine(EngineConfig::default()).await;
        let svc = engine.route_service("fast").unwrap();
        let done = svc.oneshot(engine.create_exchange_with_body("x")).await.unwrap();
        assert_eq!(done.from_route(), Some("fast"));
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn timeout_cancels_the_running_exchange() {
        let engine = engine(EngineConfig {
            exchange_timeout: Some(Duration::from_millis(20)),
            ..EngineConfig::default()
        })
        .await;
        let svc = engine.route_service("slow").unwrap();
        let err = svc.oneshot(engine.create_exchange()).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout { timeout_ms: 20 }));
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn load_is_shed_across_routes() {
        let engine = engine(EngineConfig {
            max_concurrent_exchanges: 1,
            ..EngineConfig::default()
        })
        .await;
        let mut slow = engine.route_service("slow").unwrap();
        let fast = engine.route_service("fast").unwrap();

        let _ = ServiceExt::ready(&mut slow).await.unwrap();
        let ex = engine.create_exchange();
        let token = ex.context().cancellation.clone();
        let running = tokio::spawn(slow.call(ex));

        let err = fast.oneshot(engine.create_exchange()).await.unwrap_err();
        assert!(matches!(err, EngineError::Overloaded));

        token.cancel();
        let err = running.await.unwrap().unwrap_err();
        assert!(err.route_error().is_some_and(RouteError::is_cancellation));
        engine.stop().await.unwrap();
    }
}
