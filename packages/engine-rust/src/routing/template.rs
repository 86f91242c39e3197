//! Sends exchanges straight to an endpoint, outside any route.

use std::sync::Arc;

use dashmap::DashMap;
use switchyard_core::{
    Body, Exchange, ExchangeContext, ExchangePattern, Outcome, Processor, TypeConverterRegistry,
};
use tokio_util::sync::CancellationToken;

use crate::endpoint::EndpointRegistry;
use crate::error::EngineError;
use crate::service::shutdown::ShutdownController;

/// Obtained from [`RoutingEngine::template`](super::RoutingEngine::template).
/// Producers are created once per endpoint URI and reused.
#[derive(Clone)]
pub struct ProducerTemplate {
    endpoints: Arc<EndpointRegistry>,
    converters: Arc<TypeConverterRegistry>,
    shutdown: Arc<ShutdownController>,
    cancellation: CancellationToken,
    producers: Arc<DashMap<String, Arc<dyn Processor>>>,
}

impl ProducerTemplate {
    pub(crate) fn new(
        endpoints: Arc<EndpointRegistry>,
        converters: Arc<TypeConverterRegistry>,
        shutdown: Arc<ShutdownController>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            endpoints,
            converters,
            shutdown,
            cancellation,
            producers: Arc::new(DashMap::new()),
        }
    }

    fn producer(&self, uri: &str) -> Result<Arc<dyn Processor>, EngineError> {
        if let Some(producer) = self.producers.get(uri) {
            return Ok(Arc::clone(producer.value()));
        }
        let producer = self.endpoints.resolve(uri)?.create_producer()?;
        Ok(Arc::clone(
            self.producers
                .entry(uri.to_string())
                .or_insert(producer)
                .value(),
        ))
    }

    fn exchange(&self, body: impl Into<Body>, pattern: ExchangePattern) -> Exchange {
        let ctx = ExchangeContext::new(Arc::clone(&self.converters))
            .with_parent_token(&self.cancellation);
        Exchange::with_body(Arc::new(ctx), body).with_pattern(pattern)
    }

    /// Sends `exchange` to `uri` and returns it as the endpoint left it. A
    /// failure inside the endpoint is left on the exchange.
    ///
    /// # Errors
    ///
    /// The engine is not started, or the URI cannot be resolved.
    pub async fn send(&self, uri: &str, exchange: Exchange) -> Result<Exchange, EngineError> {
        if !self.shutdown.is_accepting() {
            return Err(EngineError::NotAccepting(self.shutdown.state()));
        }
        let producer = self.producer(uri)?;
        let _in_flight = self.shutdown.in_flight_guard();
        let mut done = match producer.process(exchange) {
            Outcome::Complete(exchange) => exchange,
            Outcome::Pending(pending) => pending.await,
        };
        done.promote_output();
        Ok(done)
    }

    /// Fire-and-forget send of `body`.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send), plus [`EngineError::ExchangeFailed`].
    pub async fn send_body(&self, uri: &str, body: impl Into<Body>) -> Result<(), EngineError> {
        let done = self
            .send(uri, self.exchange(body, ExchangePattern::InOnly))
            .await?;
        failure(&done).map_or(Ok(()), Err)
    }

    /// Request/reply: sends `body` as InOut and returns the reply body.
    ///
    /// # Errors
    ///
    /// As [`send_body`](Self::send_body), plus [`EngineError::NoReply`] when
    /// the reply has no body.
    pub async fn request_body(&self, uri: &str, body: impl Into<Body>) -> Result<Body, EngineError> {
        let mut done = self
            .send(uri, self.exchange(body, ExchangePattern::InOut))
            .await?;
        if let Some(error) = failure(&done) {
            return Err(error);
        }
        let id = done.id();
        done.message_mut().take_body().ok_or(EngineError::NoReply(id))
    }
}

fn failure(exchange: &Exchange) -> Option<EngineError> {
    exchange
        .exception()
        .map(|source| EngineError::ExchangeFailed {
            exchange_id: exchange.id(),
            source: source.clone(),
        })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::definition::{RouteDefinition, StepDefinition};
    use crate::endpoint::MockEndpoint;
    use crate::routing::RoutingEngine;

    async fn started_engine() -> RoutingEngine {
        let engine = RoutingEngine::builder().build();
        engine
            .add_route(
                &RouteDefinition::new("echo", "direct:echo")
                    .step(StepDefinition::ConvertBodyTo {
                        to: "string".to_string(),
                    })
                    .step(StepDefinition::To {
                        uri: "mock:echoed".to_string(),
                    }),
            )
            .unwrap();
        engine.start().await.unwrap();
        engine
    }

    #[tokio::test]
    async fn request_body_returns_the_reply() {
        let engine = started_engine().await;
        let reply = engine
            .template()
            .request_body("direct:echo", 42_i64)
            .await
            .unwrap();
        assert_eq!(reply.as_str(), Some("42"));
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn send_body_reaches_the_endpoint() {
        let engine = started_engine().await;
        let template = engine.template();
        template.send_body("mock:direct-send", "a").await.unwrap();
        template.send_body("mock:direct-send", "b").await.unwrap();
        let mock = engine
            .endpoint::<MockEndpoint>("mock:direct-send")
            .unwrap()
            .unwrap();
        mock.expected_bodies_received(["a", "b"]);
        mock.assert_satisfied(Duration::from_millis(50)).await.unwrap();
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn requires_a_started_engine() {
        let engine = RoutingEngine::builder().build();
        assert!(matches!(
            engine.template().send_body("mock:x", "a").await,
            Err(EngineError::NotAccepting(_))
        ));
    }
}
