//! Completion notification for submitted exchanges.

use switchyard_core::Exchange;
use tokio::task::JoinHandle;

use crate::error::EngineError;

/// Receives the final state of a submitted exchange. The engine calls
/// exactly one of the two methods exactly once per submission, including
/// submissions it rejects.
pub trait ExchangeCallback: Send + 'static {
    fn on_complete(self: Box<Self>, exchange: Exchange);

    fn on_failure(self: Box<Self>, exchange: Exchange, error: EngineError);
}

/// Final state handed to closure callbacks.
#[derive(Debug)]
pub enum Completion {
    Done(Exchange),
    Failed { exchange: Exchange, error: EngineError },
}

impl Completion {
    #[must_use]
    pub fn exchange(&self) -> &Exchange {
        match self {
            Completion::Done(exchange) | Completion::Failed { exchange, .. } => exchange,
        }
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Completion::Failed { .. })
    }

    /// # Errors
    ///
    /// Returns the failure when the exchange did not complete.
    pub fn into_result(self) -> Result<Exchange, EngineError> {
        match self {
            Completion::Done(exchange) => Ok(exchange),
            Completion::Failed { error, .. } => Err(error),
        }
    }
}

impl<F> ExchangeCallback for F
where
    F: FnOnce(Completion) + Send + 'static,
{
    fn on_complete(self: Box<Self>, exchange: Exchange) {
        (*self)(Completion::Done(exchange));
    }

    fn on_failure(self: Box<Self>, exchange: Exchange, error: EngineError) {
        (*self)(Completion::Failed { exchange, error });
    }
}

/// How a submission proceeded.
#[derive(Debug)]
pub enum Submission {
    /// The traversal finished on the submitting thread; the callback has
    /// already run.
    CompletedSynchronously,
    /// The traversal suspended and continues on a spawned task, which runs
    /// the callback when it finishes.
    Suspended(JoinHandle<()>),
}

impl Submission {
    #[must_use]
    pub fn is_synchronous(&self) -> bool {
        matches!(self, Submission::CompletedSynchronously)
    }

    /// Waits until the callback has run.
    pub async fn wait(self) {
        if let Submission::Suspended(handle) = self {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "exchange task ended abnormally");
            }
        }
    }
}
