//! Failure kinds carried in an exchange's exception slot.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Coarse classification of a [`RouteError`], used by redelivery policies
/// to decide what is retriable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Conversion,
    Processing,
    Cancellation,
    Aggregation,
    RedeliveryExhausted,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Conversion => "conversion",
            ErrorKind::Processing => "processing",
            ErrorKind::Cancellation => "cancellation",
            ErrorKind::Aggregation => "aggregation",
            ErrorKind::RedeliveryExhausted => "redeliveryExhausted",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error stored in an exchange's exception slot.
///
/// `Clone` so that a failure can be copied onto a parent exchange, kept as
/// the "caught" exception after dead-lettering, and reported to callbacks.
/// Arbitrary causes are kept behind an `Arc`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RouteError {
    #[error("no type converter available to convert from {from} to {to}")]
    NoTypeConversionAvailable { from: String, to: String },

    #[error("conversion from {from} to {to} failed: {reason}")]
    ConversionFailed {
        from: String,
        to: String,
        reason: String,
    },

    #[error("processing failed at {node}: {message}")]
    Processing {
        node: String,
        message: String,
        #[source]
        cause: Option<Arc<anyhow::Error>>,
    },

    #[error("exchange cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("aggregation failed: {message}")]
    Aggregation { message: String },

    #[error("redelivery exhausted after {attempts} attempts: {last}")]
    RedeliveryExhausted { attempts: u32, last: Box<RouteError> },
}

impl RouteError {
    /// Builds a processing failure without an underlying cause.
    pub fn processing(node: impl Into<String>, message: impl Into<String>) -> Self {
        RouteError::Processing {
            node: node.into(),
            message: message.into(),
            cause: None,
        }
    }

    /// Wraps an arbitrary error as a processing failure at `node`.
    pub fn from_cause(node: impl Into<String>, cause: anyhow::Error) -> Self {
        RouteError::Processing {
            node: node.into(),
            message: cause.to_string(),
            cause: Some(Arc::new(cause)),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        RouteError::Cancelled {
            reason: reason.into(),
        }
    }

    pub fn aggregation(message: impl Into<String>) -> Self {
        RouteError::Aggregation {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            RouteError::NoTypeConversionAvailable { .. } | RouteError::ConversionFailed { .. } => {
                ErrorKind::Conversion
            }
            RouteError::Processing { .. } => ErrorKind::Processing,
            RouteError::Cancelled { .. } => ErrorKind::Cancellation,
            RouteError::Aggregation { .. } => ErrorKind::Aggregation,
            RouteError::RedeliveryExhausted { .. } => ErrorKind::RedeliveryExhausted,
        }
    }

    /// The innermost failure, looking through `RedeliveryExhausted` wrappers.
    #[must_use]
    pub fn root(&self) -> &RouteError {
        match self {
            RouteError::RedeliveryExhausted { last, .. } => last.root(),
            other => other,
        }
    }

    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        self.kind() == ErrorKind::Cancellation
    }
}
