//! Messages: body, case-insensitive headers, attachments.

use std::any::Any;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::body::{Body, TypeKey};
use crate::converter::TypeConverterRegistry;
use crate::error::RouteError;
use crate::types::Value;

/// Header map with case-insensitive keys.
///
/// Entries are keyed by the lowercased name. The original spelling of the
/// most recent write is kept for iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: BTreeMap<String, (String, Value)>,
}

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(&name.to_ascii_lowercase()).map(|(_, v)| v)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    /// Sets a header, returning the previous value under any spelling.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let name = name.into();
        self.entries
            .insert(name.to_ascii_lowercase(), (name, value.into()))
            .map(|(_, v)| v)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.entries
            .remove(&name.to_ascii_lowercase())
            .map(|(_, v)| v)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates `(name, value)` pairs using the last-written spelling.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.values().map(|(name, v)| (name.as_str(), v))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.set(k, v);
        }
        headers
    }
}

/// Named binary attachment carried alongside the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct Message {
    body: Option<Body>,
    headers: Headers,
    attachments: BTreeMap<String, Attachment>,
}

impl Message {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body(body: impl Into<Body>) -> Self {
        Self {
            body: Some(body.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = Some(body.into());
    }

    pub fn take_body(&mut self) -> Option<Body> {
        self.body.take()
    }

    pub fn clear_body(&mut self) {
        self.body = None;
    }

    /// Returns the body as `T`: the payload itself when it already is a `T`,
    /// otherwise a conversion through `registry`.
    ///
    /// # Errors
    ///
    /// [`RouteError::NoTypeConversionAvailable`] when the message has no body
    /// or no converter applies; [`RouteError::ConversionFailed`] when the
    /// converter rejects the payload.
    pub fn body_as<T: Any + Clone + Send + Sync>(
        &self,
        registry: &TypeConverterRegistry,
    ) -> Result<T, RouteError> {
        let body = self.body.as_ref().ok_or_else(|| RouteError::NoTypeConversionAvailable {
            from: "<empty body>".to_string(),
            to: std::any::type_name::<T>().to_string(),
        })?;
        if let Some(value) = body.downcast_ref::<T>() {
            return Ok(value.clone());
        }
        registry.convert_to::<T>(body)
    }

    /// Untyped variant of [`body_as`](Self::body_as).
    ///
    /// # Errors
    ///
    /// Same as [`body_as`](Self::body_as).
    pub fn body_converted(
        &self,
        registry: &TypeConverterRegistry,
        target: TypeKey,
    ) -> Result<Body, RouteError> {
        let body = self.body.as_ref().ok_or_else(|| RouteError::NoTypeConversionAvailable {
            from: "<empty body>".to_string(),
            to: target.name().to_string(),
        })?;
        registry.convert(body, target)
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.headers.set(name, value);
    }

    pub fn remove_header(&mut self, name: &str) -> Option<Value> {
        self.headers.remove(name)
    }

    #[must_use]
    pub fn attachments(&self) -> &BTreeMap<String, Attachment> {
        &self.attachments
    }

    pub fn add_attachment(&mut self, name: impl Into<String>, attachment: Attachment) {
        self.attachments.insert(name.into(), attachment);
    }

    pub fn remove_attachment(&mut self, name: &str) -> Option<Attachment> {
        self.attachments.remove(name)
    }
}
