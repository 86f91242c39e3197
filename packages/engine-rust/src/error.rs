//! Errors at the engine boundary: compilation, endpoints, configuration, and
//! exchange submission.

use switchyard_core::{ExchangeId, RouteError};

use crate::service::shutdown::EngineState;

/// Errors from building and registering routes.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("route id {0:?} is already registered")]
    DuplicateRoute(String),

    #[error("route definition has an empty id")]
    MissingRouteId,

    #[error("unknown processor reference {0:?}")]
    UnknownProcessor(String),

    #[error("unknown predicate reference {0:?}")]
    UnknownPredicate(String),

    #[error("unknown aggregation strategy {0:?}")]
    UnknownStrategy(String),

    #[error("unknown split expression {0:?}")]
    UnknownSplitExpression(String),

    #[error("unknown type alias {0:?}")]
    UnknownTypeAlias(String),

    #[error("invalid regular expression {pattern:?}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid template {template:?}: {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("invalid redelivery policy: {0}")]
    InvalidPolicy(String),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error("cannot parse route definitions: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("cannot read route file: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from resolving endpoint URIs and creating producers and consumers.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("invalid endpoint uri {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("no component registered for scheme {0:?}")]
    UnknownScheme(String),

    #[error("endpoint {uri} does not support {operation}")]
    Unsupported {
        uri: String,
        operation: &'static str,
    },

    #[error("endpoint {uri} already has a consumer")]
    ConsumerExists { uri: String },

    #[error("cannot configure endpoint {uri}: {source}")]
    Configuration {
        uri: String,
        #[source]
        source: ConfigError,
    },
}

/// Errors from applying named options to a configurable target.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown option {0:?}")]
    UnknownOption(String),

    #[error("invalid value {value:?} for option {name:?}: {source}")]
    InvalidValue {
        name: String,
        value: String,
        #[source]
        source: RouteError,
    },

    #[error("option {name:?} out of range: {reason}")]
    OutOfRange { name: String, reason: String },
}

/// Errors reported to callers of the routing engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine is not accepting exchanges (state: {0:?})")]
    NotAccepting(EngineState),

    #[error("no route with id {0:?}")]
    UnknownRoute(String),

    #[error("engine overloaded")]
    Overloaded,

    #[error("exchange timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("exchange {exchange_id} failed: {source}")]
    ExchangeFailed {
        exchange_id: ExchangeId,
        #[source]
        source: RouteError,
    },

    #[error("exchange {0} completed without a reply message")]
    NoReply(ExchangeId),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("lifecycle failure: {0}")]
    Lifecycle(#[source] anyhow::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// The route-level failure carried by this error, if any.
    #[must_use]
    pub fn route_error(&self) -> Option<&RouteError> {
        match self {
            EngineError::ExchangeFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}
