use std::sync::Arc;
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::converter::TypeConverterRegistry;

/// Per-unit-of-work context shared by an exchange and every copy made from it.
///
/// Fan-out copies hold the same `Arc<ExchangeContext>`, so correlation and
/// cancellation reach every branch without extra plumbing.
#[derive(Debug, Clone)]
pub struct ExchangeContext {
    /// Correlation identifier propagated to every copy. Defaults to the id of
    /// the first exchange created in this context.
    pub correlation_id: String,
    /// Identifier of the unit of work the exchange belongs to.
    pub unit_of_work: Uuid,
    /// Converter registry used for body and header conversions.
    pub converters: Arc<TypeConverterRegistry>,
    /// Cancelling this token stops the exchange and all of its copies at the
    /// next safe point.
    pub cancellation: CancellationToken,
    pub created_at: SystemTime,
}

impl ExchangeContext {
    #[must_use]
    pub fn new(converters: Arc<TypeConverterRegistry>) -> Self {
        let unit_of_work = Uuid::new_v4();
        Self {
            correlation_id: unit_of_work.to_string(),
            unit_of_work,
            converters,
            cancellation: CancellationToken::new(),
            created_at: SystemTime::now(),
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Context whose token is a child of `parent`: cancelling the parent
    /// cancels this context, not the other way round.
    #[must_use]
    pub fn with_parent_token(mut self, parent: &CancellationToken) -> Self {
        self.cancellation = parent.child_token();
        self
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}
