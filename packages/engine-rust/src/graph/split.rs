//! Split expressions: turn one exchange's body into a lazy sequence of parts.

use switchyard_core::{Body, Exchange, RouteError, Value};

use super::predicate::value_to_body;

/// Lazily produced sub-message bodies.
pub type Parts = Box<dyn Iterator<Item = Body> + Send>;

pub trait SplitExpression: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the body cannot be read in the expected shape.
    fn split(&self, exchange: &Exchange) -> Result<Parts, RouteError>;
}

/// Splits text on a delimiter. Empty segments are skipped.
#[derive(Debug, Clone)]
pub struct Tokenize {
    pub token: String,
}

struct TokenIter {
    text: String,
    token: String,
    pos: usize,
}

impl Iterator for TokenIter {
    type Item = Body;

    fn next(&mut self) -> Option<Body> {
        while self.pos < self.text.len() {
            let rest = &self.text[self.pos..];
            let (segment, advance) = match rest.find(self.token.as_str()) {
                Some(at) if !self.token.is_empty() => (&rest[..at], at + self.token.len()),
                _ => (rest, rest.len()),
            };
            self.pos += advance;
            if !segment.is_empty() {
                return Some(Body::new(segment.to_string()));
            }
        }
        None
    }
}

impl SplitExpression for Tokenize {
    fn split(&self, exchange: &Exchange) -> Result<Parts, RouteError> {
        let text = match exchange.body() {
            None => String::new(),
            Some(_) => exchange.body_as::<String>()?,
        };
        Ok(Box::new(TokenIter {
            text,
            token: self.token.clone(),
            pos: 0,
        }))
    }
}

/// Splits text into lines, accepting `\n` and `\r\n`.
#[derive(Debug, Clone, Copy)]
pub struct Lines;

impl SplitExpression for Lines {
    fn split(&self, exchange: &Exchange) -> Result<Parts, RouteError> {
        let inner = Tokenize {
            token: "\n".to_string(),
        }
        .split(exchange)?;
        Ok(Box::new(inner.filter_map(|body| {
            let line = body.as_str()?.trim_end_matches('\r');
            (!line.is_empty()).then(|| Body::new(line.to_string()))
        })))
    }
}

/// Splits a list body into its elements.
#[derive(Debug, Clone, Copy)]
pub struct ArrayItems;

impl SplitExpression for ArrayItems {
    fn split(&self, exchange: &Exchange) -> Result<Parts, RouteError> {
        let items: Vec<Value> = match exchange.body() {
            None => Vec::new(),
            Some(body) => {
                if let Some(items) = body.downcast_ref::<Vec<Value>>() {
                    items.clone()
                } else {
                    match exchange.body_as::<Value>()? {
                        Value::Array(items) => items,
                        other => {
                            return Err(RouteError::processing(
                                "split",
                                format!("expected a list body, got {}", other.kind_name()),
                            ))
                        }
                    }
                }
            }
        };
        Ok(Box::new(items.into_iter().filter_map(value_to_body)))
    }
}
