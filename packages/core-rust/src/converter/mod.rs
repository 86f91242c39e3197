//! Type converter registry.
//!
//! A registry is assembled single-writer through [`TypeConverterRegistryBuilder`]
//! and then frozen. The frozen registry is shared read-only behind an `Arc`,
//! so lookups on the hot path never lock.
//!
//! Lookup order for `convert(body, target)`:
//! 1. identity (body already has the target type)
//! 2. an exact converter registered for `(source, target)`
//! 3. fallback converters, in registration order
//! 4. a chain through exactly one intermediate type; intermediates are tried
//!    in the order their converters from `source` were registered
//! 5. [`RouteError::NoTypeConversionAvailable`]

mod builtin;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::body::{Body, TypeKey};
use crate::error::RouteError;

pub use builtin::ValueFallback;

/// Type-erased conversion function. Errors are reported through `anyhow` and
/// surface as [`RouteError::ConversionFailed`].
pub type ConvertFn = Arc<dyn Fn(&Body) -> anyhow::Result<Body> + Send + Sync>;

/// Converter consulted when no exact `(source, target)` pair is registered.
pub trait FallbackConverter: Send + Sync {
    fn name(&self) -> &str;

    /// Returns `None` when this fallback does not apply to the pair, so the
    /// registry can continue with the next strategy.
    fn try_convert(
        &self,
        body: &Body,
        target: TypeKey,
        registry: &TypeConverterRegistry,
    ) -> Option<Result<Body, RouteError>>;
}

/// Bulk registration hook, used by components that ship their own converters.
pub trait ConverterProvider {
    fn provide(&self, builder: TypeConverterRegistryBuilder) -> TypeConverterRegistryBuilder;
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct TypeConverterRegistryBuilder {
    converters: HashMap<(TypeKey, TypeKey), ConvertFn>,
    by_source: HashMap<TypeKey, Vec<TypeKey>>,
    fallbacks: Vec<Arc<dyn FallbackConverter>>,
}

impl TypeConverterRegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a typed converter from `S` to `T`.
    ///
    /// The last registration for a pair wins; overriding is logged.
    #[must_use]
    pub fn register<S, T, F>(self, convert: F) -> Self
    where
        S: Any + Send + Sync,
        T: Any + Send + Sync,
        F: Fn(&S) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let source = TypeKey::of::<S>();
        let erased: ConvertFn = Arc::new(move |body: &Body| {
            let value = body.downcast_ref::<S>().ok_or_else(|| {
                anyhow::anyhow!("expected {}, got {}", source, body.type_key())
            })?;
            convert(value).map(Body::new)
        });
        self.register_dyn(source, TypeKey::of::<T>(), erased)
    }

    /// Registers a type-erased converter. The function must return a body of
    /// type `target`.
    #[must_use]
    pub fn register_dyn(mut self, source: TypeKey, target: TypeKey, convert: ConvertFn) -> Self {
        if self.converters.insert((source, target), convert).is_some() {
            info!(from = %source, to = %target, "type converter overridden");
        } else {
            self.by_source.entry(source).or_default().push(target);
        }
        self
    }

    #[must_use]
    pub fn add_fallback(mut self, fallback: impl FallbackConverter + 'static) -> Self {
        self.fallbacks.push(Arc::new(fallback));
        self
    }

    #[must_use]
    pub fn with_provider(self, provider: &dyn ConverterProvider) -> Self {
        provider.provide(self)
    }

    /// Adds the built-in converters and the `Value` fallback.
    #[must_use]
    pub fn with_defaults(self) -> Self {
        builtin::register_defaults(self)
    }

    #[must_use]
    pub fn build(self) -> TypeConverterRegistry {
        debug!(
            converters = self.converters.len(),
            fallbacks = self.fallbacks.len(),
            "type converter registry built"
        );
        TypeConverterRegistry {
            converters: self.converters,
            by_source: self.by_source,
            fallbacks: self.fallbacks,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Immutable converter lookup table.
pub struct TypeConverterRegistry {
    converters: HashMap<(TypeKey, TypeKey), ConvertFn>,
    by_source: HashMap<TypeKey, Vec<TypeKey>>,
    fallbacks: Vec<Arc<dyn FallbackConverter>>,
}

impl fmt::Debug for TypeConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeConverterRegistry")
            .field("converters", &self.converters.len())
            .field("fallbacks", &self.fallbacks.len())
            .finish()
    }
}

impl Default for TypeConverterRegistry {
    fn default() -> Self {
        TypeConverterRegistryBuilder::new().with_defaults().build()
    }
}

impl TypeConverterRegistry {
    #[must_use]
    pub fn builder() -> TypeConverterRegistryBuilder {
        TypeConverterRegistryBuilder::new()
    }

    /// Registry with no converters at all; only identity conversions succeed.
    #[must_use]
    pub fn empty() -> Self {
        TypeConverterRegistryBuilder::new().build()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.converters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.converters.is_empty()
    }

    /// Whether an exact converter is registered for the pair.
    #[must_use]
    pub fn has_converter(&self, source: TypeKey, target: TypeKey) -> bool {
        self.converters.contains_key(&(source, target))
    }

    /// Converts `body` to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::NoTypeConversionAvailable`] when no strategy
    /// applies, or [`RouteError::ConversionFailed`] when the chosen converter
    /// reports an error.
    pub fn convert(&self, body: &Body, target: TypeKey) -> Result<Body, RouteError> {
        let source = body.type_key();
        if source == target {
            return Ok(body.clone());
        }

        if let Some(convert) = self.converters.get(&(source, target)) {
            return apply(convert, body, source, target);
        }

        for fallback in &self.fallbacks {
            if let Some(result) = fallback.try_convert(body, target, self) {
                return result;
            }
        }

        if let Some(intermediates) = self.by_source.get(&source) {
            for &via in intermediates {
                if via == target {
                    continue;
                }
                let (Some(first), Some(second)) = (
                    self.converters.get(&(source, via)),
                    self.converters.get(&(via, target)),
                ) else {
                    continue;
                };
                let step = apply(first, body, source, via)?;
                return apply(second, &step, via, target);
            }
        }

        Err(RouteError::NoTypeConversionAvailable {
            from: source.name().to_string(),
            to: target.name().to_string(),
        })
    }

    /// Converts `body` and extracts the typed value.
    ///
    /// # Errors
    ///
    /// Same as [`convert`](Self::convert).
    pub fn convert_to<T: Any + Clone + Send + Sync>(&self, body: &Body) -> Result<T, RouteError> {
        let target = TypeKey::of::<T>();
        let converted = self.convert(body, target)?;
        converted
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| RouteError::ConversionFailed {
                from: body.type_key().name().to_string(),
                to: target.name().to_string(),
                reason: format!("converter produced {}", converted.type_key()),
            })
    }

    /// Converts a plain value of type `S` into `T`.
    ///
    /// # Errors
    ///
    /// Same as [`convert`](Self::convert).
    pub fn convert_value<S, T>(&self, value: S) -> Result<T, RouteError>
    where
        S: Any + Send + Sync,
        T: Any + Clone + Send + Sync,
    {
        self.convert_to::<T>(&Body::new(value))
    }
}

fn apply(
    convert: &ConvertFn,
    body: &Body,
    source: TypeKey,
    target: TypeKey,
) -> Result<Body, RouteError> {
    let converted = convert(body).map_err(|e| RouteError::ConversionFailed {
        from: source.name().to_string(),
        to: target.name().to_string(),
        reason: e.to_string(),
    })?;
    if converted.type_key() != target {
        return Err(RouteError::ConversionFailed {
            from: source.name().to_string(),
            to: target.name().to_string(),
            reason: format!("converter produced {}", converted.type_key()),
        });
    }
    Ok(converted)
}
