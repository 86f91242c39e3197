//! `direct:` synchronous in-process call into another route.
//!
//! The producer runs the consuming route's graph on the caller's exchange, in
//! the caller's traversal turn, so the sub-route behaves like an inlined
//! pipeline: failures propagate back to the caller's error handlers and an
//! asynchronous step in the sub-route suspends the caller too.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use dashmap::DashMap;
use switchyard_core::exchange::properties;
use switchyard_core::{Exchange, Outcome, Processor, RouteError};
use tracing::debug;

use super::{Component, ComponentContext, Consumer, Endpoint, EndpointUri};
use crate::error::EndpointError;
use crate::routing::traversal::{drive, Advance};
use crate::routing::{RouteHandle, RouteRuntime};

/// Consumer slot for one `direct:` name.
#[derive(Default)]
struct DirectSlot {
    claimed: AtomicBool,
    route: ArcSwapOption<RouteRuntime>,
}

#[derive(Default)]
pub struct DirectComponent {
    slots: DashMap<String, Arc<DirectSlot>>,
}

impl DirectComponent {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Component for DirectComponent {
    fn scheme(&self) -> &str {
        "direct"
    }

    fn create_endpoint(
        &self,
        uri: &EndpointUri,
        _ctx: &ComponentContext,
    ) -> Result<Arc<dyn Endpoint>, EndpointError> {
        if let Some(name) = uri.options().keys().next() {
            return Err(EndpointError::Configuration {
                uri: uri.to_string(),
                source: crate::error::ConfigError::UnknownOption(name.clone()),
            });
        }
        let slot = Arc::clone(
            self.slots
                .entry(uri.path().to_string())
                .or_default()
                .value(),
        );
        Ok(Arc::new(DirectEndpoint {
            uri: uri.to_string(),
            slot,
        }))
    }
}

pub struct DirectEndpoint {
    uri: String,
    slot: Arc<DirectSlot>,
}

impl DirectEndpoint {
    /// Whether a started route currently consumes from this endpoint.
    #[must_use]
    pub fn has_consumer(&self) -> bool {
        self.slot.route.load().is_some()
    }
}

impl Endpoint for DirectEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> Result<Arc<dyn Processor>, EndpointError> {
        Ok(Arc::new(DirectProducer {
            uri: self.uri.clone(),
            slot: Arc::clone(&self.slot),
        }))
    }

    fn create_consumer(&self, route: RouteHandle) -> Result<Arc<dyn Consumer>, EndpointError> {
        if self.slot.claimed.swap(true, Ordering::SeqCst) {
            return Err(EndpointError::ConsumerExists {
                uri: self.uri.clone(),
            });
        }
        Ok(Arc::new(DirectConsumer {
            slot: Arc::clone(&self.slot),
            route,
        }))
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct DirectProducer {
    uri: String,
    slot: Arc<DirectSlot>,
}

impl Processor for DirectProducer {
    fn label(&self) -> &str {
        &self.uri
    }

    fn process(&self, mut exchange: Exchange) -> Outcome {
        let Some(route) = self.slot.route.load_full() else {
            exchange.set_exception(RouteError::processing(
                &self.uri,
                "no consumer is running for this endpoint",
            ));
            return Outcome::Complete(exchange);
        };
        exchange.set_property(properties::TO_ENDPOINT, self.uri.as_str());
        debug!(uri = %self.uri, route = route.id(), exchange_id = %exchange.id(), "direct call");

        let mut traversal = route.traversal();
        match traversal.advance(exchange) {
            Advance::Finished(mut done) => {
                // A filter inside the sub-route only stops the sub-route.
                done.clear_route_stop();
                Outcome::Complete(done)
            }
            suspended @ Advance::Suspended(_) => Outcome::Pending(Box::pin(async move {
                let mut done = drive(traversal, suspended).await;
                done.clear_route_stop();
                done
            })),
        }
    }
}

struct DirectConsumer {
    slot: Arc<DirectSlot>,
    route: RouteHandle,
}

#[async_trait]
impl Consumer for DirectConsumer {
    async fn start(&self) -> anyhow::Result<()> {
        self.slot.route.store(Some(Arc::clone(&self.route)));
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.slot.route.store(None);
        Ok(())
    }
}
