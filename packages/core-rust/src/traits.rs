use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RouteError;
use crate::exchange::Exchange;

/// Future returned by a processor that cannot finish synchronously. It
/// resolves to the same exchange, possibly with its exception slot set.
pub type PendingExchange = Pin<Box<dyn Future<Output = Exchange> + Send + 'static>>;

/// Result of handing an exchange to a processor.
pub enum Outcome {
    /// Processing finished on the caller's thread.
    Complete(Exchange),
    /// Processing continues asynchronously; the engine suspends the traversal
    /// and resumes it when the future resolves, possibly on another worker.
    Pending(PendingExchange),
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Complete(exchange) => f.debug_tuple("Complete").field(&exchange.id()).finish(),
            Outcome::Pending(_) => f.write_str("Pending"),
        }
    }
}

/// Unit of work in a route.
///
/// Processors report failure by setting the exchange's exception slot, never
/// by panicking. A processor is shared by every exchange routed through its
/// node, so it must be `Send + Sync`.
pub trait Processor: Send + Sync {
    /// Name used in logs and failure diagnostics.
    fn label(&self) -> &str {
        "processor"
    }

    fn process(&self, exchange: Exchange) -> Outcome;
}

/// Async counterpart of [`Processor`], for steps that await I/O or timers.
/// Wrap with [`async_processor`] to plug it into a route.
#[async_trait]
pub trait AsyncProcessor: Send + Sync {
    /// # Errors
    ///
    /// Any returned error is stored in the exchange's exception slot.
    async fn process(&self, exchange: &mut Exchange) -> Result<(), RouteError>;
}

// ---------------------------------------------------------------------------
// Adapters
// ---------------------------------------------------------------------------

struct FnProcessor<F> {
    label: String,
    f: F,
}

impl<F> Processor for FnProcessor<F>
where
    F: Fn(&mut Exchange) -> Result<(), RouteError> + Send + Sync,
{
    fn label(&self) -> &str {
        &self.label
    }

    fn process(&self, mut exchange: Exchange) -> Outcome {
        if let Err(err) = (self.f)(&mut exchange) {
            exchange.set_exception(err);
        }
        Outcome::Complete(exchange)
    }
}

/// Wraps a synchronous closure as a [`Processor`].
pub fn processor_fn<F>(label: impl Into<String>, f: F) -> Arc<dyn Processor>
where
    F: Fn(&mut Exchange) -> Result<(), RouteError> + Send + Sync + 'static,
{
    Arc::new(FnProcessor {
        label: label.into(),
        f,
    })
}

struct AsyncAdapter<P> {
    label: String,
    inner: Arc<P>,
}

impl<P: AsyncProcessor + 'static> Processor for AsyncAdapter<P> {
    fn label(&self) -> &str {
        &self.label
    }

    fn process(&self, mut exchange: Exchange) -> Outcome {
        let inner = Arc::clone(&self.inner);
        Outcome::Pending(Box::pin(async move {
            if let Err(err) = inner.process(&mut exchange).await {
                exchange.set_exception(err);
            }
            exchange
        }))
    }
}

/// Wraps an [`AsyncProcessor`]; every invocation suspends the traversal.
pub fn async_processor<P>(label: impl Into<String>, processor: P) -> Arc<dyn Processor>
where
    P: AsyncProcessor + 'static,
{
    Arc::new(AsyncAdapter {
        label: label.into(),
        inner: Arc::new(processor),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::context::ExchangeContext;
    use crate::converter::TypeConverterRegistry;

    fn exchange(body: &str) -> Exchange {
        let ctx = ExchangeContext::new(Arc::new(TypeConverterRegistry::default()));
        Exchange::with_body(Arc::new(ctx), body)
    }

    #[test]
    fn fn_processor_completes_synchronously() {
        let upper = processor_fn("upper", |ex: &mut Exchange| {
            let text: String = ex.body_as()?;
            ex.set_body(text.to_uppercase());
            Ok(())
        });
        assert_eq!(upper.label(), "upper");
        let Outcome::Complete(done) = upper.process(exchange("ab")) else {
            panic!("expected synchronous completion");
        };
        assert_eq!(done.body().and_then(crate::Body::as_str), Some("AB"));
    }

    #[test]
    fn fn_processor_error_sets_exception() {
        let failing = processor_fn("fail", |_: &mut Exchange| {
            Err(RouteError::processing("fail", "boom"))
        });
        let Outcome::Complete(done) = failing.process(exchange("x")) else {
            panic!("expected synchronous completion");
        };
        assert!(done.is_failed());
    }

    struct Sleepy;

    #[async_trait]
    impl AsyncProcessor for Sleepy {
        async fn process(&self, exchange: &mut Exchange) -> Result<(), RouteError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            exchange.set_header("slept", true);
            Ok(())
        }
    }

    #[tokio::test]
    async fn async_processor_suspends() {
        let sleepy = async_processor("sleepy", Sleepy);
        let Outcome::Pending(fut) = sleepy.process(exchange("x")) else {
            panic!("expected pending outcome");
        };
        let done = fut.await;
        assert_eq!(done.header("slept"), Some(&crate::Value::Bool(true)));
    }
}
