//! `log:` writes each exchange to the tracing subscriber.

use std::any::Any;
use std::sync::Arc;

use switchyard_core::{Exchange, Outcome, Processor};
use tracing::{debug, error, info, trace, warn};

use super::{apply_options, Component, ComponentContext, Endpoint, EndpointUri};
use crate::configurer::PropertyConfigurer;
use crate::definition::LogLevel;
use crate::error::EndpointError;

#[derive(Debug, Clone)]
struct LogOptions {
    level: LogLevel,
    show_headers: bool,
    show_body: bool,
}

fn level_name(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogComponent;

impl Component for LogComponent {
    fn scheme(&self) -> &str {
        "log"
    }

    fn create_endpoint(
        &self,
        uri: &EndpointUri,
        ctx: &ComponentContext,
    ) -> Result<Arc<dyn Endpoint>, EndpointError> {
        let configurer = PropertyConfigurer::<LogOptions>::new(Arc::clone(&ctx.converters))
            .checked_option::<String>(
                "level",
                |o, v| {
                    o.level = v.parse()?;
                    Ok(())
                },
                |o| level_name(o.level).to_string(),
            )
            .option::<bool>("showHeaders", |o, v| o.show_headers = v, |o| o.show_headers)
            .option::<bool>("showBody", |o, v| o.show_body = v, |o| o.show_body);

        let mut options = LogOptions {
            level: LogLevel::Info,
            show_headers: false,
            show_body: true,
        };
        apply_options(uri, &configurer, &mut options)?;

        Ok(Arc::new(LogEndpoint {
            uri: uri.to_string(),
            category: uri.path().to_string(),
            options,
        }))
    }
}

pub struct LogEndpoint {
    uri: String,
    category: String,
    options: LogOptions,
}

impl Endpoint for LogEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> Result<Arc<dyn Processor>, EndpointError> {
        Ok(Arc::new(LogProducer {
            uri: self.uri.clone(),
            category: self.category.clone(),
            options: self.options.clone(),
        }))
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct LogProducer {
    uri: String,
    category: String,
    options: LogOptions,
}

/// Renders the body as text when a converter allows it.
pub(crate) fn describe_body(exchange: &Exchange) -> String {
    match exchange.body() {
        None => "<empty>".to_string(),
        Some(body) => exchange
            .body_as::<String>()
            .unwrap_or_else(|_| format!("<{}>", body.type_key())),
    }
}

fn describe_headers(exchange: &Exchange) -> String {
    exchange
        .message()
        .headers()
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Processor for LogProducer {
    fn label(&self) -> &str {
        &self.uri
    }

    fn process(&self, exchange: Exchange) -> Outcome {
        let body = if self.options.show_body {
            describe_body(&exchange)
        } else {
            String::new()
        };
        let headers = if self.options.show_headers {
            describe_headers(&exchange)
        } else {
            String::new()
        };
        let category = self.category.as_str();
        let id = exchange.id();
        let pattern = exchange.pattern();
        match self.options.level {
            LogLevel::Trace => trace!(category, exchange_id = %id, ?pattern, body, headers, "exchange"),
            LogLevel::Debug => debug!(category, exchange_id = %id, ?pattern, body, headers, "exchange"),
            LogLevel::Info => info!(category, exchange_id = %id, ?pattern, body, headers, "exchange"),
            LogLevel::Warn => warn!(category, exchange_id = %id, ?pattern, body, headers, "exchange"),
            LogLevel::Error => error!(category, exchange_id = %id, ?pattern, body, headers, "exchange"),
        }
        Outcome::Complete(exchange)
    }
}
