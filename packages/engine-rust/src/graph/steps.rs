//! Built-in leaf processors for the declarative step kinds.

use std::sync::Arc;
use std::time::Duration;

use switchyard_core::{Exchange, Outcome, Processor, RouteError, TypeKey};
use tracing::{debug, error, info, trace, warn};

use super::predicate::{value_to_body, Expression};
use crate::definition::LogLevel;

pub struct SetHeader {
    label: String,
    name: String,
    expression: Expression,
}

impl SetHeader {
    #[must_use]
    pub fn new(name: impl Into<String>, expression: Expression) -> Arc<dyn Processor> {
        let name = name.into();
        Arc::new(Self {
            label: format!("setHeader({name})"),
            name,
            expression,
        })
    }
}

impl Processor for SetHeader {
    fn label(&self) -> &str {
        &self.label
    }

    fn process(&self, mut exchange: Exchange) -> Outcome {
        match self.expression.evaluate(&exchange) {
            Ok(value) => exchange.set_header(self.name.clone(), value),
            Err(e) => exchange.set_exception(e),
        }
        Outcome::Complete(exchange)
    }
}

pub struct RemoveHeader {
    label: String,
    name: String,
}

impl RemoveHeader {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<dyn Processor> {
        let name = name.into();
        Arc::new(Self {
            label: format!("removeHeader({name})"),
            name,
        })
    }
}

impl Processor for RemoveHeader {
    fn label(&self) -> &str {
        &self.label
    }

    fn process(&self, mut exchange: Exchange) -> Outcome {
        exchange.message_mut().remove_header(&self.name);
        Outcome::Complete(exchange)
    }
}

pub struct SetProperty {
    label: String,
    name: String,
    expression: Expression,
}

impl SetProperty {
    #[must_use]
    pub fn new(name: impl Into<String>, expression: Expression) -> Arc<dyn Processor> {
        let name = name.into();
        Arc::new(Self {
            label: format!("setProperty({name})"),
            name,
            expression,
        })
    }
}

impl Processor for SetProperty {
    fn label(&self) -> &str {
        &self.label
    }

    fn process(&self, mut exchange: Exchange) -> Outcome {
        match self.expression.evaluate(&exchange) {
            Ok(value) => exchange.set_property(self.name.clone(), value),
            Err(e) => exchange.set_exception(e),
        }
        Outcome::Complete(exchange)
    }
}

/// Replaces the body. A null result clears it.
pub struct SetBody {
    expression: Expression,
}

impl SetBody {
    #[must_use]
    pub fn new(expression: Expression) -> Arc<dyn Processor> {
        Arc::new(Self { expression })
    }
}

impl Processor for SetBody {
    fn label(&self) -> &str {
        "setBody"
    }

    fn process(&self, mut exchange: Exchange) -> Outcome {
        match self.expression.evaluate(&exchange) {
            Ok(value) => match value_to_body(value) {
                Some(body) => exchange.set_body(body),
                None => exchange.message_mut().clear_body(),
            },
            Err(e) => exchange.set_exception(e),
        }
        Outcome::Complete(exchange)
    }
}

pub struct ConvertBodyTo {
    label: String,
    target: TypeKey,
}

impl ConvertBodyTo {
    #[must_use]
    pub fn new(alias: &str, target: TypeKey) -> Arc<dyn Processor> {
        Arc::new(Self {
            label: format!("convertBodyTo({alias})"),
            target,
        })
    }
}

impl Processor for ConvertBodyTo {
    fn label(&self) -> &str {
        &self.label
    }

    fn process(&self, mut exchange: Exchange) -> Outcome {
        let converted = match exchange.body() {
            None => return Outcome::Complete(exchange),
            Some(body) => exchange.context().converters.convert(body, self.target),
        };
        match converted {
            Ok(body) => exchange.set_body(body),
            Err(e) => exchange.set_exception(e),
        }
        Outcome::Complete(exchange)
    }
}

/// Logs a rendered template under the `switchyard::route` target.
pub struct LogMessage {
    message: Expression,
    level: LogLevel,
}

impl LogMessage {
    #[must_use]
    pub fn new(message: Expression, level: LogLevel) -> Arc<dyn Processor> {
        Arc::new(Self { message, level })
    }
}

impl Processor for LogMessage {
    fn label(&self) -> &str {
        "log"
    }

    fn process(&self, mut exchange: Exchange) -> Outcome {
        let text = match self.message.evaluate(&exchange) {
            Ok(value) => value.to_string(),
            Err(e) => {
                exchange.set_exception(e);
                return Outcome::Complete(exchange);
            }
        };
        let route = exchange.from_route().unwrap_or_default();
        let id = exchange.id();
        match self.level {
            LogLevel::Trace => trace!(target: "switchyard::route", route, exchange_id = %id, "{text}"),
            LogLevel::Debug => debug!(target: "switchyard::route", route, exchange_id = %id, "{text}"),
            LogLevel::Info => info!(target: "switchyard::route", route, exchange_id = %id, "{text}"),
            LogLevel::Warn => warn!(target: "switchyard::route", route, exchange_id = %id, "{text}"),
            LogLevel::Error => error!(target: "switchyard::route", route, exchange_id = %id, "{text}"),
        }
        Outcome::Complete(exchange)
    }
}

/// Suspends the traversal for a fixed time without blocking a worker.
pub struct Delay {
    label: String,
    delay: Duration,
}

impl Delay {
    #[must_use]
    pub fn new(delay: Duration) -> Arc<dyn Processor> {
        Arc::new(Self {
            label: format!("delay({}ms)", delay.as_millis()),
            delay,
        })
    }
}

impl Processor for Delay {
    fn label(&self) -> &str {
        &self.label
    }

    fn process(&self, mut exchange: Exchange) -> Outcome {
        if self.delay.is_zero() {
            return Outcome::Complete(exchange);
        }
        let delay = self.delay;
        Outcome::Pending(Box::pin(async move {
            let token = exchange.context().cancellation.clone();
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = token.cancelled() => {
                    exchange.set_exception(RouteError::cancelled("cancelled during delay"));
                }
            }
            exchange
        }))
    }
}
