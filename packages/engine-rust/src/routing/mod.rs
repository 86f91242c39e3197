//! The asynchronous routing engine.

pub mod aggregation;
pub(crate) mod barrier;
pub mod callback;
pub mod engine;
pub(crate) mod fanout;
pub mod template;
pub mod traversal;

use std::sync::Arc;

use switchyard_core::Exchange;

use crate::graph::CompiledRoute;
use crate::service::shutdown::ShutdownController;

pub use callback::{Completion, ExchangeCallback, Submission};
pub use engine::{RoutingEngine, RoutingEngineBuilder};
pub use template::ProducerTemplate;
pub use traversal::{drive, Advance, RouteScope, Suspension, Traversal, TraversalState};

/// A started route: its compiled graph plus the scope its traversals run in.
#[derive(Debug)]
pub struct RouteRuntime {
    pub route: CompiledRoute,
    pub scope: RouteScope,
    shutdown: Arc<ShutdownController>,
}

/// Shared handle consumers use to feed exchanges into a route.
pub type RouteHandle = Arc<RouteRuntime>;

impl RouteRuntime {
    pub(crate) fn new(
        route: CompiledRoute,
        scope: RouteScope,
        shutdown: Arc<ShutdownController>,
    ) -> Self {
        Self {
            route,
            scope,
            shutdown,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.route.id
    }

    /// A fresh traversal positioned at the route's first node.
    #[must_use]
    pub fn traversal(&self) -> Traversal {
        Traversal::new(self.scope.clone(), Arc::clone(&self.route.root))
    }

    /// Routes `exchange` to completion, counted as in flight for shutdown
    /// draining. Used by consumers that own the exchange, such as `seda:`.
    pub async fn run(&self, mut exchange: Exchange) -> Exchange {
        let _in_flight = self.shutdown.in_flight_guard();
        exchange.set_from_route(self.id());
        let mut traversal = self.traversal();
        let step = traversal.advance(exchange);
        drive(traversal, step).await
    }
}
