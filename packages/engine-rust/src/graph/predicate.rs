//! Compiled predicates and expressions.

use std::fmt;

use regex::Regex;
use switchyard_core::{Body, Exchange, RouteError, Value};

use crate::beans::PredicateFn;
use crate::definition::Comparison;
use crate::error::CompileError;

pub enum Predicate {
    HeaderEquals { name: String, value: Value },
    HeaderExists(String),
    HeaderMatches { name: String, regex: Regex },
    PropertyEquals { name: String, value: Value },
    BodyEquals(String),
    BodyContains(String),
    BodyMatches(Regex),
    BodyLength { op: Comparison, value: usize },
    Constant(bool),
    Not(Box<Predicate>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Custom { name: String, f: PredicateFn },
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::HeaderEquals { name, value } => write!(f, "header({name}) == {value}"),
            Predicate::HeaderExists(name) => write!(f, "header({name}) exists"),
            Predicate::HeaderMatches { name, regex } => write!(f, "header({name}) =~ {regex}"),
            Predicate::PropertyEquals { name, value } => write!(f, "property({name}) == {value}"),
            Predicate::BodyEquals(v) => write!(f, "body == {v:?}"),
            Predicate::BodyContains(v) => write!(f, "body contains {v:?}"),
            Predicate::BodyMatches(regex) => write!(f, "body =~ {regex}"),
            Predicate::BodyLength { op, value } => write!(f, "length(body) {op:?} {value}"),
            Predicate::Constant(b) => write!(f, "{b}"),
            Predicate::Not(p) => write!(f, "not({p:?})"),
            Predicate::And(ps) => f.debug_tuple("and").field(ps).finish(),
            Predicate::Or(ps) => f.debug_tuple("or").field(ps).finish(),
            Predicate::Custom { name, .. } => write!(f, "ref({name})"),
        }
    }
}

/// Values compare equal when they are identical or render the same text, so
/// a header holding `Int(3)` matches a definition literal `"3"`.
fn loosely_equal(left: &Value, right: &Value) -> bool {
    left == right || left.to_string() == right.to_string()
}

fn body_text(exchange: &Exchange) -> Result<String, RouteError> {
    match exchange.body() {
        None => Ok(String::new()),
        Some(_) => exchange.body_as::<String>(),
    }
}

impl Predicate {
    /// Evaluates the predicate. Body predicates convert the body to text
    /// through the exchange's converter registry.
    ///
    /// # Errors
    ///
    /// Conversion failures, or errors returned by custom predicates.
    pub fn matches(&self, exchange: &Exchange) -> Result<bool, RouteError> {
        Ok(match self {
            Predicate::HeaderEquals { name, value } => exchange
                .header(name)
                .is_some_and(|actual| loosely_equal(actual, value)),
            Predicate::HeaderExists(name) => exchange.header(name).is_some(),
            Predicate::HeaderMatches { name, regex } => exchange
                .header(name)
                .is_some_and(|actual| regex.is_match(&actual.to_string())),
            Predicate::PropertyEquals { name, value } => exchange
                .property(name)
                .is_some_and(|actual| loosely_equal(actual, value)),
            Predicate::BodyEquals(expected) => body_text(exchange)? == *expected,
            Predicate::BodyContains(needle) => body_text(exchange)?.contains(needle.as_str()),
            Predicate::BodyMatches(regex) => regex.is_match(&body_text(exchange)?),
            Predicate::BodyLength { op, value } => {
                op.holds(body_text(exchange)?.chars().count(), *value)
            }
            Predicate::Constant(b) => *b,
            Predicate::Not(inner) => !inner.matches(exchange)?,
            Predicate::And(all) => {
                for p in all {
                    if !p.matches(exchange)? {
                        return Ok(false);
                    }
                }
                true
            }
            Predicate::Or(any) => {
                for p in any {
                    if p.matches(exchange)? {
                        return Ok(true);
                    }
                }
                false
            }
            Predicate::Custom { f, .. } => f(exchange)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Literal(String),
    Body,
    Header(String),
    Property(String),
    ExchangeId,
}

/// Parses `Hello ${header.name}` into literal and placeholder parts.
///
/// # Errors
///
/// [`CompileError::InvalidTemplate`] for unknown placeholders.
pub fn parse_template(template: &str) -> Result<Vec<TemplatePart>, CompileError> {
    let invalid = |reason: String| CompileError::InvalidTemplate {
        template: template.to_string(),
        reason,
    };
    let placeholder = Regex::new(r"\$\{([^}]*)\}").map_err(|e| invalid(e.to_string()))?;

    let mut parts = Vec::new();
    let mut last = 0;
    for captures in placeholder.captures_iter(template) {
        let (Some(whole), Some(inner)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        if whole.start() > last {
            parts.push(TemplatePart::Literal(template[last..whole.start()].to_string()));
        }
        let key = inner.as_str().trim();
        let part = if key == "body" {
            TemplatePart::Body
        } else if key == "exchangeId" {
            TemplatePart::ExchangeId
        } else if let Some(name) = key.strip_prefix("header.") {
            TemplatePart::Header(name.to_string())
        } else if let Some(name) = key.strip_prefix("property.") {
            TemplatePart::Property(name.to_string())
        } else {
            return Err(invalid(format!("unknown placeholder ${{{key}}}")));
        };
        parts.push(part);
        last = whole.end();
    }
    if last < template.len() {
        parts.push(TemplatePart::Literal(template[last..].to_string()));
    }
    Ok(parts)
}

#[derive(Debug, Clone)]
pub enum Expression {
    Constant(Value),
    Header(String),
    Property(String),
    Body,
    Template(Vec<TemplatePart>),
}

impl Expression {
    /// Evaluates to a value. Missing headers and properties evaluate to
    /// `Value::Null`; in templates they render as empty text.
    ///
    /// # Errors
    ///
    /// Conversion failures while reading the body.
    pub fn evaluate(&self, exchange: &Exchange) -> Result<Value, RouteError> {
        match self {
            Expression::Constant(v) => Ok(v.clone()),
            Expression::Header(name) => Ok(exchange.header(name).cloned().unwrap_or(Value::Null)),
            Expression::Property(name) => {
                Ok(exchange.property(name).cloned().unwrap_or(Value::Null))
            }
            Expression::Body => body_value(exchange),
            Expression::Template(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        TemplatePart::Literal(text) => out.push_str(text),
                        TemplatePart::Body => out.push_str(&body_text(exchange)?),
                        TemplatePart::Header(name) => {
                            if let Some(v) = exchange.header(name) {
                                out.push_str(&v.to_string());
                            }
                        }
                        TemplatePart::Property(name) => {
                            if let Some(v) = exchange.property(name) {
                                out.push_str(&v.to_string());
                            }
                        }
                        TemplatePart::ExchangeId => out.push_str(&exchange.id().to_string()),
                    }
                }
                Ok(Value::String(out))
            }
        }
    }
}

/// The body as a [`Value`]: native scalars map directly, anything else goes
/// through the converter registry.
pub(crate) fn body_value(exchange: &Exchange) -> Result<Value, RouteError> {
    let Some(body) = exchange.body() else {
        return Ok(Value::Null);
    };
    if let Some(s) = body.as_str() {
        return Ok(Value::String(s.to_string()));
    }
    if let Some(i) = body.downcast_ref::<i64>() {
        return Ok(Value::Int(*i));
    }
    if let Some(f) = body.downcast_ref::<f64>() {
        return Ok(Value::Float(*f));
    }
    if let Some(b) = body.downcast_ref::<bool>() {
        return Ok(Value::Bool(*b));
    }
    if let Some(bytes) = body.downcast_ref::<Vec<u8>>() {
        return Ok(Value::Bytes(bytes.clone()));
    }
    exchange.body_as::<Value>()
}

/// Wraps a [`Value`] as a body with its native payload type, so a
/// `Value::String` becomes a `String` body.
#[must_use]
pub(crate) fn value_to_body(value: Value) -> Option<Body> {
    Some(match value {
        Value::Null => return None,
        Value::Bool(b) => Body::new(b),
        Value::Int(i) => Body::new(i),
        Value::Float(f) => Body::new(f),
        Value::String(s) => Body::new(s),
        Value::Bytes(b) => Body::new(b),
        other @ (Value::Array(_) | Value::Map(_)) => Body::new(other),
    })
}
