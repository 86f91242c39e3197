//! The exchange: one unit of work travelling through a route.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::body::Body;
use crate::context::ExchangeContext;
use crate::error::RouteError;
use crate::message::Message;
use crate::types::Value;

/// Exchange property keys written by the engine.
pub mod properties {
    pub const REDELIVERY_COUNTER: &str = "SwitchyardRedeliveryCounter";
    pub const REDELIVERY_MAX_COUNTER: &str = "SwitchyardRedeliveryMaxCounter";
    pub const REDELIVERED: &str = "SwitchyardRedelivered";
    pub const SPLIT_INDEX: &str = "SwitchyardSplitIndex";
    pub const SPLIT_SIZE: &str = "SwitchyardSplitSize";
    pub const SPLIT_COMPLETE: &str = "SwitchyardSplitComplete";
    pub const MULTICAST_INDEX: &str = "SwitchyardMulticastIndex";
    pub const MULTICAST_COMPLETE: &str = "SwitchyardMulticastComplete";
    pub const AGGREGATED_SIZE: &str = "SwitchyardAggregatedSize";
    pub const FILTER_MATCHED: &str = "SwitchyardFilterMatched";
    pub const TO_ENDPOINT: &str = "SwitchyardToEndpoint";
    pub const FAILURE_ENDPOINT: &str = "SwitchyardFailureEndpoint";
    pub const ERROR_HANDLED: &str = "SwitchyardErrorHandled";
}

/// Diagnostic headers attached before an exchange is dead-lettered.
pub mod headers {
    pub const FAILURE_KIND: &str = "SwitchyardFailureKind";
    pub const FAILURE_MESSAGE: &str = "SwitchyardFailureMessage";
    pub const FAILURE_ROUTE_ID: &str = "SwitchyardFailureRouteId";
    pub const FAILURE_ENDPOINT: &str = "SwitchyardFailureEndpoint";
    pub const FAILURE_REDELIVERIES: &str = "SwitchyardFailureRedeliveries";
    pub const FAILURE_TIMESTAMP: &str = "SwitchyardFailureTimestamp";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeId(Uuid);

impl ExchangeId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ExchangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Message exchange pattern.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExchangePattern {
    /// Fire-and-forget: the caller does not wait for a reply.
    #[default]
    InOnly,
    /// Request-response: the final message is the reply.
    InOut,
}

/// A message travelling through a route together with its metadata.
///
/// Invariant: the output message and the exception are never both
/// authoritative. Setting an exception discards any pending output.
#[derive(Debug, Clone)]
pub struct Exchange {
    id: ExchangeId,
    pattern: ExchangePattern,
    input: Message,
    output: Option<Message>,
    exception: Option<RouteError>,
    caught: Option<RouteError>,
    properties: BTreeMap<String, Value>,
    context: Arc<ExchangeContext>,
    from_route: Option<String>,
    stopped: bool,
}

impl Exchange {
    #[must_use]
    pub fn new(context: Arc<ExchangeContext>) -> Self {
        Self {
            id: ExchangeId::new(),
            pattern: ExchangePattern::InOnly,
            input: Message::new(),
            output: None,
            exception: None,
            caught: None,
            properties: BTreeMap::new(),
            context,
            from_route: None,
            stopped: false,
        }
    }

    #[must_use]
    pub fn with_body(context: Arc<ExchangeContext>, body: impl Into<Body>) -> Self {
        let mut exchange = Self::new(context);
        exchange.input.set_body(body);
        exchange
    }

    #[must_use]
    pub fn with_pattern(mut self, pattern: ExchangePattern) -> Self {
        self.pattern = pattern;
        self
    }

    #[must_use]
    pub fn id(&self) -> ExchangeId {
        self.id
    }

    #[must_use]
    pub fn pattern(&self) -> ExchangePattern {
        self.pattern
    }

    pub fn set_pattern(&mut self, pattern: ExchangePattern) {
        self.pattern = pattern;
    }

    #[must_use]
    pub fn context(&self) -> &Arc<ExchangeContext> {
        &self.context
    }

    // -- messages -----------------------------------------------------------

    #[must_use]
    pub fn message(&self) -> &Message {
        &self.input
    }

    pub fn message_mut(&mut self) -> &mut Message {
        &mut self.input
    }

    pub fn set_message(&mut self, message: Message) {
        self.input = message;
    }

    #[must_use]
    pub fn output(&self) -> Option<&Message> {
        self.output.as_ref()
    }

    /// Sets the output message. Ignored while an exception is set.
    pub fn set_output(&mut self, message: Message) {
        if self.exception.is_none() {
            self.output = Some(message);
        }
    }

    /// Moves a pending output message into the input slot. The engine calls
    /// this after every step so the next step sees the previous result.
    pub fn promote_output(&mut self) {
        if let Some(output) = self.output.take() {
            self.input = output;
        }
    }

    #[must_use]
    pub fn body(&self) -> Option<&Body> {
        self.input.body()
    }

    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.input.set_body(body);
    }

    /// Input body converted through the context's registry.
    ///
    /// # Errors
    ///
    /// See [`Message::body_as`].
    pub fn body_as<T: Any + Clone + Send + Sync>(&self) -> Result<T, RouteError> {
        self.input.body_as::<T>(&self.context.converters)
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&Value> {
        self.input.header(name)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.input.set_header(name, value);
    }

    // -- failure ------------------------------------------------------------

    #[must_use]
    pub fn exception(&self) -> Option<&RouteError> {
        self.exception.as_ref()
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.exception.is_some()
    }

    /// Records a failure and discards any pending output.
    pub fn set_exception(&mut self, error: RouteError) {
        self.output = None;
        self.exception = Some(error);
    }

    pub fn take_exception(&mut self) -> Option<RouteError> {
        self.exception.take()
    }

    /// The failure that was handled by dead-lettering, if any.
    #[must_use]
    pub fn caught_exception(&self) -> Option<&RouteError> {
        self.caught.as_ref()
    }

    pub fn set_caught_exception(&mut self, error: RouteError) {
        self.caught = Some(error);
    }

    // -- properties ---------------------------------------------------------

    #[must_use]
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(name.into(), value.into());
    }

    pub fn remove_property(&mut self, name: &str) -> Option<Value> {
        self.properties.remove(name)
    }

    #[must_use]
    pub fn properties(&self) -> &BTreeMap<String, Value> {
        &self.properties
    }

    // -- routing state ------------------------------------------------------

    #[must_use]
    pub fn from_route(&self) -> Option<&str> {
        self.from_route.as_deref()
    }

    pub fn set_from_route(&mut self, route_id: impl Into<String>) {
        self.from_route = Some(route_id.into());
    }

    /// Marks the exchange so the remaining steps of its current route are
    /// skipped. Not a failure.
    pub fn stop_route(&mut self) {
        self.stopped = true;
    }

    #[must_use]
    pub fn is_route_stopped(&self) -> bool {
        self.stopped
    }

    pub fn clear_route_stop(&mut self) {
        self.stopped = false;
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.context.is_cancelled()
    }

    /// Copy for fan-out: fresh id, independent message and properties, same
    /// shared context. Exception and stop state are not carried over.
    #[must_use]
    pub fn copy(&self) -> Exchange {
        Exchange {
            id: ExchangeId::new(),
            pattern: self.pattern,
            input: self.input.clone(),
            output: None,
            exception: None,
            caught: None,
            properties: self.properties.clone(),
            context: Arc::clone(&self.context),
            from_route: self.from_route.clone(),
            stopped: false,
        }
    }
}
