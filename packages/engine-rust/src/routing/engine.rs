//! The engine facade: route registration, lifecycle, and exchange submission.

use std::path::Path;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use switchyard_core::{Body, Exchange, ExchangeContext, RouteError, TypeConverterRegistry};
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::callback::{Completion, ExchangeCallback, Submission};
use super::template::ProducerTemplate;
use super::traversal::{drive, Advance, RouteScope};
use super::{RouteHandle, RouteRuntime};
use crate::beans::Beans;
use crate::definition::{RouteDefinition, RoutesDocument};
use crate::endpoint::{Component, ComponentContext, Consumer, Endpoint, EndpointRegistry};
use crate::error::{CompileError, EndpointError, EngineError};
use crate::graph::RouteCompiler;
use crate::service::config::EngineConfig;
use crate::service::middleware::{build_inbound_pipeline, LoadShedLayer};
use crate::service::registry::{ManagedService, ServiceContext, ServiceRegistry};
use crate::service::router::{ExchangeFuture, RouteService};
use crate::service::shutdown::{EngineState, ShutdownController};

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RoutingEngineBuilder {
    config: EngineConfig,
    converters: Option<Arc<TypeConverterRegistry>>,
    beans: Beans,
    components: Vec<Arc<dyn Component>>,
}

impl RoutingEngineBuilder {
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to [`TypeConverterRegistry::default`], which carries the
    /// built-in converters.
    #[must_use]
    pub fn converters(mut self, converters: Arc<TypeConverterRegistry>) -> Self {
        self.converters = Some(converters);
        self
    }

    #[must_use]
    pub fn beans(mut self, beans: Beans) -> Self {
        self.beans = beans;
        self
    }

    /// Adds a component. A component whose scheme matches a built-in one
    /// replaces it.
    #[must_use]
    pub fn component(mut self, component: Arc<dyn Component>) -> Self {
        self.components.push(component);
        self
    }

    #[must_use]
    pub fn build(self) -> RoutingEngine {
        let config = Arc::new(self.config);
        let converters = self
            .converters
            .unwrap_or_else(|| Arc::new(TypeConverterRegistry::default()));
        let endpoints = Arc::new(EndpointRegistry::new(
            ComponentContext {
                converters: Arc::clone(&converters),
                config: Arc::clone(&config),
            },
            self.components,
        ));
        let compiler = RouteCompiler::new(
            Arc::new(self.beans),
            Arc::clone(&endpoints),
            config.allow_unbounded_redelivery,
        );
        let shutdown = Arc::new(ShutdownController::new());
        let cancellation = CancellationToken::new();
        let template = ProducerTemplate::new(
            Arc::clone(&endpoints),
            Arc::clone(&converters),
            Arc::clone(&shutdown),
            cancellation.clone(),
        );

        RoutingEngine {
            inner: Arc::new(EngineInner {
                parallel_limit: Arc::new(Semaphore::new(config.parallel_processing_limit.max(1))),
                load_shed: LoadShedLayer::new(config.max_concurrent_exchanges),
                config,
                converters,
                endpoints,
                compiler,
                routes: DashMap::new(),
                order: RwLock::new(Vec::new()),
                services: ServiceRegistry::new(),
                shutdown,
                cancellation,
                template,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// RoutingEngine
// ---------------------------------------------------------------------------

struct EngineInner {
    config: Arc<EngineConfig>,
    converters: Arc<TypeConverterRegistry>,
    endpoints: Arc<EndpointRegistry>,
    compiler: RouteCompiler,
    routes: DashMap<String, RouteHandle>,
    order: RwLock<Vec<String>>,
    services: ServiceRegistry,
    shutdown: Arc<ShutdownController>,
    /// Parent of every route and exchange token.
    cancellation: CancellationToken,
    parallel_limit: Arc<Semaphore>,
    /// Shared by every route service, so the limit is engine-wide.
    load_shed: LoadShedLayer,
    template: ProducerTemplate,
}

/// Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct RoutingEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for RoutingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingEngine")
            .field("name", &self.inner.config.name)
            .field("state", &self.inner.shutdown.state())
            .field("routes", &*self.inner.order.read())
            .finish_non_exhaustive()
    }
}

impl RoutingEngine {
    #[must_use]
    pub fn builder() -> RoutingEngineBuilder {
        RoutingEngineBuilder::default()
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn converters(&self) -> &Arc<TypeConverterRegistry> {
        &self.inner.converters
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        self.inner.shutdown.state()
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.inner.shutdown.in_flight_count()
    }

    // -- Routes ---------------------------------------------------------------

    /// Compiles and registers a route. Routes can only be added before
    /// [`start`](Self::start).
    ///
    /// A route whose `from` endpoint cannot consume (such as `mock:`) is
    /// still registered and can be fed through [`submit`](Self::submit).
    ///
    /// # Errors
    ///
    /// Compilation failures, a duplicate id, or a `from` endpoint that
    /// already has a consumer.
    pub fn add_route(&self, definition: &RouteDefinition) -> Result<(), EngineError> {
        let inner = &self.inner;
        let state = inner.shutdown.state();
        if state != EngineState::Starting {
            return Err(EngineError::Lifecycle(anyhow!(
                "routes can only be added before the engine starts (state: {state:?})"
            )));
        }
        if inner.routes.contains_key(&definition.id) {
            return Err(CompileError::DuplicateRoute(definition.id.clone()).into());
        }
        let compiled = inner.compiler.compile(definition)?;
        let from = inner.endpoints.resolve(&compiled.from)?;

        let scope = RouteScope::new(
            compiled.id.as_str(),
            inner.cancellation.child_token(),
            Arc::clone(&inner.parallel_limit),
        );
        let runtime = Arc::new(RouteRuntime::new(compiled, scope, Arc::clone(&inner.shutdown)));

        let Entry::Vacant(slot) = inner.routes.entry(definition.id.clone()) else {
            return Err(CompileError::DuplicateRoute(definition.id.clone()).into());
        };
        let consumer = match from.create_consumer(Arc::clone(&runtime)) {
            Ok(consumer) => Some(consumer),
            Err(EndpointError::Unsupported { .. }) => {
                debug!(route = %definition.id, from = %from.uri(), "route has no consumer");
                None
            }
            Err(e) => return Err(e.into()),
        };
        slot.insert(runtime);
        inner.order.write().push(definition.id.clone());
        if let Some(consumer) = consumer {
            inner.services.register(Arc::new(RouteConsumerService {
                name: format!("route:{}", definition.id),
                consumer,
            }));
        }
        info!(route = %definition.id, from = %definition.from, "route added");
        Ok(())
    }

    /// Adds every route in a JSON document: a bare array of route
    /// definitions or `{"routes": [...]}`. Returns the added ids.
    ///
    /// # Errors
    ///
    /// Parse failures, or the first route that cannot be added. Routes before
    /// it stay registered.
    pub fn add_routes_json(&self, text: &str) -> Result<Vec<String>, EngineError> {
        let document: RoutesDocument = serde_json::from_str(text).map_err(CompileError::from)?;
        let mut ids = Vec::new();
        for route in document.into_routes() {
            self.add_route(&route)?;
            ids.push(route.id);
        }
        Ok(ids)
    }

    /// # Errors
    ///
    /// I/O failures, plus everything [`add_routes_json`](Self::add_routes_json) reports.
    pub fn load_routes_file(&self, path: impl AsRef<Path>) -> Result<Vec<String>, EngineError> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(CompileError::from)?;
        self.add_routes_json(&text)
    }

    /// Route ids in registration order.
    #[must_use]
    pub fn route_ids(&self) -> Vec<String> {
        self.inner.order.read().clone()
    }

    #[must_use]
    pub fn route(&self, route_id: &str) -> Option<RouteHandle> {
        self.inner.routes.get(route_id).map(|r| Arc::clone(r.value()))
    }

    // -- Lifecycle ------------------------------------------------------------

    /// Starts route consumers in registration order and begins accepting
    /// exchanges.
    ///
    /// # Errors
    ///
    /// Fails when the engine was already started, or when a consumer fails to
    /// start; consumers started before it are stopped again.
    pub async fn start(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        let state = inner.shutdown.state();
        if state != EngineState::Starting {
            return Err(EngineError::Lifecycle(anyhow!(
                "engine cannot start from state {state:?}"
            )));
        }
        let ctx = ServiceContext {
            config: Arc::clone(&inner.config),
        };
        if let Err(e) = inner.services.start_all(&ctx).await {
            if let Err(stop_error) = inner.services.stop_all(true).await {
                warn!(error = %stop_error, "failed to roll back consumers");
            }
            return Err(EngineError::Lifecycle(e));
        }
        inner.shutdown.set_started();
        info!(engine = %inner.config.name, routes = inner.routes.len(), "engine started");
        Ok(())
    }

    /// Stops accepting exchanges, waits up to `shutdown_timeout` for in-flight
    /// ones, cancels whatever is left, then stops consumers in reverse order.
    ///
    /// # Errors
    ///
    /// The first consumer that failed to stop. The engine is `Stopped`
    /// regardless.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        if matches!(
            inner.shutdown.state(),
            EngineState::Draining | EngineState::Stopped
        ) {
            return Ok(());
        }
        inner.shutdown.trigger_shutdown();
        info!(engine = %inner.config.name, in_flight = inner.shutdown.in_flight_count(), "engine draining");

        let timeout = inner.config.shutdown_timeout;
        let drained = inner.shutdown.wait_for_drain(timeout).await;
        if !drained {
            warn!(
                in_flight = inner.shutdown.in_flight_count(),
                "shutdown timeout expired, cancelling in-flight exchanges"
            );
        }
        inner.cancellation.cancel();
        if !drained && !inner.shutdown.wait_for_drain(timeout).await {
            warn!(
                in_flight = inner.shutdown.in_flight_count(),
                "exchanges still running after cancellation"
            );
        }

        let result = inner.services.stop_all(!drained).await;
        inner.shutdown.set_stopped();
        info!(engine = %inner.config.name, "engine stopped");
        result.map_err(EngineError::Lifecycle)
    }

    // -- Exchanges ------------------------------------------------------------

    /// A new exchange whose cancellation follows the engine's.
    #[must_use]
    pub fn create_exchange(&self) -> Exchange {
        Exchange::new(self.exchange_context())
    }

    #[must_use]
    pub fn create_exchange_with_body(&self, body: impl Into<Body>) -> Exchange {
        Exchange::with_body(self.exchange_context(), body)
    }

    fn exchange_context(&self) -> Arc<ExchangeContext> {
        Arc::new(
            ExchangeContext::new(Arc::clone(&self.inner.converters))
                .with_parent_token(&self.inner.cancellation),
        )
    }

    /// Routes `exchange` through `route_id`.
    ///
    /// Synchronous steps run on the calling thread. If the traversal
    /// suspends, it continues on a spawned task. `callback` runs exactly
    /// once in every case, including when the submission is rejected.
    pub fn submit(
        &self,
        route_id: &str,
        mut exchange: Exchange,
        callback: impl ExchangeCallback,
    ) -> Submission {
        let callback: Box<dyn ExchangeCallback> = Box::new(callback);
        let inner = &self.inner;

        let state = inner.shutdown.state();
        if state != EngineState::Started {
            return reject(route_id, exchange, callback, EngineError::NotAccepting(state));
        }
        let Some(route) = self.route(route_id) else {
            return reject(
                route_id,
                exchange,
                callback,
                EngineError::UnknownRoute(route_id.to_string()),
            );
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return reject(
                route_id,
                exchange,
                callback,
                EngineError::Internal("submit must be called inside a tokio runtime".to_string()),
            );
        };

        let in_flight = inner.shutdown.in_flight_guard();
        exchange.set_from_route(route.id());
        let guard = CompletionGuard::new(route.id(), &exchange, callback);
        let mut traversal = route.traversal();
        match traversal.advance(exchange) {
            Advance::Finished(done) => {
                guard.complete(done);
                drop(in_flight);
                Submission::CompletedSynchronously
            }
            suspended @ Advance::Suspended(_) => {
                debug!(route = route.id(), "traversal suspended");
                Submission::Suspended(runtime.spawn(async move {
                    let _in_flight = in_flight;
                    let done = drive(traversal, suspended).await;
                    guard.complete(done);
                }))
            }
        }
    }

    /// Routes `exchange` through `route_id` and waits for the result.
    ///
    /// # Errors
    ///
    /// Rejections, or [`EngineError::ExchangeFailed`] when the exchange
    /// finished with an exception.
    pub async fn process(&self, route_id: &str, exchange: Exchange) -> Result<Exchange, EngineError> {
        let (tx, rx) = oneshot::channel();
        // The spawned task, if any, keeps running without the handle.
        let _submission = self.submit(route_id, exchange, move |completion: Completion| {
            let _ = tx.send(completion);
        });
        rx.await
            .map_err(|_| EngineError::Internal("exchange completion was dropped".to_string()))?
            .into_result()
    }

    /// `route_id` as a tower service behind the inbound middleware: load
    /// shedding, the exchange timeout, and metrics.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownRoute`].
    pub fn route_service(
        &self,
        route_id: &str,
    ) -> Result<
        impl tower::Service<Exchange, Response = Exchange, Error = EngineError, Future = ExchangeFuture>
            + Clone
            + Send,
        EngineError,
    > {
        if !self.inner.routes.contains_key(route_id) {
            return Err(EngineError::UnknownRoute(route_id.to_string()));
        }
        Ok(build_inbound_pipeline(
            RouteService::new(self.clone(), route_id),
            &self.inner.load_shed,
            &self.inner.config,
        ))
    }

    /// Typed endpoint lookup; `Ok(None)` when the endpoint is not an `E`.
    ///
    /// # Errors
    ///
    /// The URI cannot be resolved.
    pub fn endpoint<E: Endpoint>(&self, uri: &str) -> Result<Option<Arc<E>>, EngineError> {
        Ok(self.inner.endpoints.typed::<E>(uri)?)
    }

    #[must_use]
    pub fn template(&self) -> ProducerTemplate {
        self.inner.template.clone()
    }
}

fn outcome_label(exchange: &Exchange) -> &'static str {
    match exchange.exception() {
        None => "completed",
        Some(e) if e.is_cancellation() => "cancelled",
        Some(_) => "failed",
    }
}

fn complete(route_id: &str, exchange: Exchange, callback: Box<dyn ExchangeCallback>) {
    let outcome = outcome_label(&exchange);
    metrics::counter!(
        "switchyard_exchanges_total",
        "route" => route_id.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    debug!(route = route_id, exchange_id = %exchange.id(), outcome, "exchange finished");
    match exchange.exception().cloned() {
        None => callback.on_complete(exchange),
        Some(source) => {
            let exchange_id = exchange.id();
            callback.on_failure(exchange, EngineError::ExchangeFailed { exchange_id, source });
        }
    }
}

/// Owns the callback of an accepted submission. If the traversal ends
/// without completing (a processor panicked), dropping the guard reports the
/// exchange as it was submitted, failed.
struct CompletionGuard {
    route_id: String,
    submitted: Option<Exchange>,
    callback: Option<Box<dyn ExchangeCallback>>,
}

impl CompletionGuard {
    fn new(route_id: &str, exchange: &Exchange, callback: Box<dyn ExchangeCallback>) -> Self {
        Self {
            route_id: route_id.to_string(),
            submitted: Some(exchange.clone()),
            callback: Some(callback),
        }
    }

    fn complete(mut self, exchange: Exchange) {
        self.submitted = None;
        if let Some(callback) = self.callback.take() {
            complete(&self.route_id, exchange, callback);
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let (Some(callback), Some(mut exchange)) = (self.callback.take(), self.submitted.take())
        else {
            return;
        };
        warn!(
            route = %self.route_id,
            exchange_id = %exchange.id(),
            "exchange terminated without completing"
        );
        exchange.set_exception(RouteError::processing(
            self.route_id.as_str(),
            "exchange terminated without completing",
        ));
        complete(&self.route_id, exchange, callback);
    }
}

fn reject(
    route_id: &str,
    exchange: Exchange,
    callback: Box<dyn ExchangeCallback>,
    error: EngineError,
) -> Submission {
    metrics::counter!(
        "switchyard_exchanges_total",
        "route" => route_id.to_string(),
        "outcome" => "rejected"
    )
    .increment(1);
    debug!(route = route_id, exchange_id = %exchange.id(), error = %error, "exchange rejected");
    callback.on_failure(exchange, error);
    Submission::CompletedSynchronously
}

// ---------------------------------------------------------------------------
// Route consumers as managed services
// ---------------------------------------------------------------------------

struct RouteConsumerService {
    name: String,
    consumer: Arc<dyn Consumer>,
}

#[async_trait]
impl ManagedService for RouteConsumerService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        self.consumer.start().await
    }

    async fn stop(&self, _terminate: bool) -> anyhow::Result<()> {
        self.consumer.stop().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
