//! `mock:` endpoints for tests: record what they receive and check
//! expectations.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use switchyard_core::{Exchange, Outcome, Processor, RouteError};
use tokio::sync::Notify;

use super::{apply_options, Component, ComponentContext, Endpoint, EndpointUri};
use crate::configurer::PropertyConfigurer;
use crate::error::EndpointError;

#[derive(Default)]
pub struct MockComponent {
    endpoints: DashMap<String, Arc<MockEndpoint>>,
}

impl MockComponent {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Component for MockComponent {
    fn scheme(&self) -> &str {
        "mock"
    }

    fn create_endpoint(
        &self,
        uri: &EndpointUri,
        ctx: &ComponentContext,
    ) -> Result<Arc<dyn Endpoint>, EndpointError> {
        let endpoint = Arc::clone(
            self.endpoints
                .entry(uri.path().to_string())
                .or_insert_with(|| {
                    Arc::new(MockEndpoint {
                        uri: format!("mock:{}", uri.path()),
                        inner: Arc::new(MockInner::default()),
                    })
                })
                .value(),
        );

        let configurer = PropertyConfigurer::<MockState>::new(Arc::clone(&ctx.converters))
            .checked_option::<i64>(
                "expectedCount",
                |s, v| {
                    s.expected_count = Some(usize::try_from(v).map_err(|e| e.to_string())?);
                    Ok(())
                },
                |s| s.expected_count.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX)),
            );
        apply_options(uri, &configurer, &mut *endpoint.inner.state.lock())?;

        Ok(endpoint)
    }
}

#[derive(Default)]
struct MockState {
    received: Vec<Exchange>,
    expected_count: Option<usize>,
    expected_bodies: Option<Vec<String>>,
    failure: Option<RouteError>,
}

impl MockState {
    /// `Ok(true)` when satisfied, `Ok(false)` when more exchanges may still
    /// arrive, `Err` when the expectation can no longer be met.
    fn check(&self) -> Result<bool, String> {
        let received = self.received.len();
        if let Some(expected) = self.expected_count {
            if received > expected {
                return Err(format!("expected {expected} exchanges, received {received}"));
            }
            if received < expected {
                return Ok(false);
            }
        }
        if let Some(expected) = &self.expected_bodies {
            let bodies = bodies_of(&self.received);
            if bodies.len() < expected.len() {
                return Ok(false);
            }
            if bodies[..expected.len()] != expected[..] {
                return Err(format!("expected bodies {expected:?}, received {bodies:?}"));
            }
        }
        Ok(true)
    }
}

fn bodies_of(exchanges: &[Exchange]) -> Vec<String> {
    exchanges
        .iter()
        .map(|e| match e.body() {
            None => String::new(),
            Some(body) => e
                .body_as::<String>()
                .unwrap_or_else(|_| format!("{body:?}")),
        })
        .collect()
}

#[derive(Default)]
struct MockInner {
    state: Mutex<MockState>,
    arrived: Notify,
}

/// Recording endpoint. Look one up with `engine.endpoint::<MockEndpoint>(uri)`.
pub struct MockEndpoint {
    uri: String,
    inner: Arc<MockInner>,
}

impl MockEndpoint {
    pub fn expected_message_count(&self, count: usize) {
        self.inner.state.lock().expected_count = Some(count);
    }

    pub fn expected_bodies_received<I, S>(&self, bodies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.state.lock().expected_bodies = Some(bodies.into_iter().map(Into::into).collect());
    }

    /// Every exchange received from now on fails with `error`.
    pub fn fail_with(&self, error: RouteError) {
        self.inner.state.lock().failure = Some(error);
    }

    #[must_use]
    pub fn received_count(&self) -> usize {
        self.inner.state.lock().received.len()
    }

    #[must_use]
    pub fn received_exchanges(&self) -> Vec<Exchange> {
        self.inner.state.lock().received.clone()
    }

    /// Received bodies rendered as text.
    #[must_use]
    pub fn received_bodies(&self) -> Vec<String> {
        bodies_of(&self.inner.state.lock().received)
    }

    /// Clears received exchanges, expectations, and injected failures.
    pub fn reset(&self) {
        *self.inner.state.lock() = MockState::default();
    }

    /// Waits up to `timeout` for the expectations to be met.
    ///
    /// # Errors
    ///
    /// Describes the unmet expectation.
    pub async fn assert_satisfied(&self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let arrived = self.inner.arrived.notified();
            match self.inner.state.lock().check() {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(reason) => anyhow::bail!("{}: {reason}", self.uri),
            }
            if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                let state = self.inner.state.lock();
                return match state.check() {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(anyhow::anyhow!(
                        "{}: timed out after {timeout:?} with {} exchanges received",
                        self.uri,
                        state.received.len()
                    )),
                    Err(reason) => Err(anyhow::anyhow!("{}: {reason}", self.uri)),
                };
            }
        }
    }
}

impl Endpoint for MockEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> Result<Arc<dyn Processor>, EndpointError> {
        Ok(Arc::new(MockProducer {
            uri: self.uri.clone(),
            inner: Arc::clone(&self.inner),
        }))
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct MockProducer {
    uri: String,
    inner: Arc<MockInner>,
}

impl Processor for MockProducer {
    fn label(&self) -> &str {
        &self.uri
    }

    fn process(&self, mut exchange: Exchange) -> Outcome {
        let failure = {
            let mut state = self.inner.state.lock();
            state.received.push(exchange.clone());
            state.failure.clone()
        };
        self.inner.arrived.notify_waiters();
        if let Some(error) = failure {
            exchange.set_exception(error);
        }
        Outcome::Complete(exchange)
    }
}
