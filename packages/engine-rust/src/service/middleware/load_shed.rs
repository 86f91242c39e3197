//! Load-shedding middleware for inbound exchanges.
//!
//! Rejects exchanges when the engine is overloaded (concurrent count exceeds
//! `max_concurrent_exchanges`) with `EngineError::Overloaded`.

use std::sync::Arc;
use std::task::{Context, Poll};

use switchyard_core::Exchange;
use tokio::sync::Semaphore;
use tower::{Layer, Service};

use crate::error::EngineError;
use crate::service::router::ExchangeFuture;

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

/// Tower layer that limits concurrent exchanges via a semaphore.
///
/// When all permits are taken, incoming exchanges are rejected immediately
/// with `EngineError::Overloaded` rather than queued. Clones share permits.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    semaphore: Arc<Semaphore>,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent as usize)),
        }
    }

    /// Permits currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            semaphore: self.semaphore.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    semaphore: Arc<Semaphore>,
}

impl<S> Service<Exchange> for LoadShedService<S>
where
    S: Service<Exchange, Response = Exchange, Error = EngineError> + Send,
    S::Future: Send + 'static,
{
    type Response = Exchange;
    type Error = EngineError;
    type Future = ExchangeFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, exchange: Exchange) -> Self::Future {
        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            tracing::debug!(exchange_id = %exchange.id(), "exchange shed");
            return Box::pin(async { Err(EngineError::Overloaded) });
        };

        let fut = self.inner.call(exchange);
        Box::pin(async move {
            let result = fut.await;
            drop(permit);
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
