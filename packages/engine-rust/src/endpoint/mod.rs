//! Endpoints: named message sources and sinks addressed by URI.
//!
//! A [`Component`] owns a URI scheme and creates [`Endpoint`]s for it. An
//! endpoint hands out a producer (a processor that sends exchanges to it) and
//! at most one consumer (which feeds exchanges into a route).

pub mod direct;
pub mod log;
pub mod mock;
pub mod seda;

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use switchyard_core::{Processor, TypeConverterRegistry};

use crate::error::EndpointError;
use crate::routing::RouteHandle;
use crate::service::config::EngineConfig;

pub use direct::DirectComponent;
pub use log::LogComponent;
pub use mock::{MockComponent, MockEndpoint};
pub use seda::SedaComponent;

// ---------------------------------------------------------------------------
// URI
// ---------------------------------------------------------------------------

/// `scheme:path?key=value&key2=value2`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUri {
    scheme: String,
    path: String,
    options: BTreeMap<String, String>,
}

impl EndpointUri {
    /// # Errors
    ///
    /// [`EndpointError::InvalidUri`] when the scheme or path is missing or an
    /// option is malformed.
    pub fn parse(raw: &str) -> Result<Self, EndpointError> {
        let invalid = |reason: &str| EndpointError::InvalidUri {
            uri: raw.to_string(),
            reason: reason.to_string(),
        };
        let (scheme, rest) = raw.trim().split_once(':').ok_or_else(|| invalid("missing scheme"))?;
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(invalid("scheme must be alphanumeric"));
        }
        let rest = rest.trim_start_matches("//");
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };
        if path.is_empty() {
            return Err(invalid("missing path"));
        }

        let mut options = BTreeMap::new();
        for pair in query.into_iter().flat_map(|q| q.split('&')).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| invalid(&format!("option {pair:?} has no value")))?;
            if key.is_empty() {
                return Err(invalid("option with empty name"));
            }
            options.insert(key.to_string(), value.to_string());
        }

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            path: path.to_string(),
            options,
        })
    }

    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }
}

/// Canonical form: lowercase scheme, options sorted by name.
impl fmt::Display for EndpointUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.path)?;
        let mut sep = '?';
        for (key, value) in &self.options {
            write!(f, "{sep}{key}={value}")?;
            sep = '&';
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// What components need from the engine when creating endpoints.
#[derive(Debug, Clone)]
pub struct ComponentContext {
    pub converters: Arc<TypeConverterRegistry>,
    pub config: Arc<EngineConfig>,
}

pub trait Component: Send + Sync {
    fn scheme(&self) -> &str;

    /// # Errors
    ///
    /// Invalid options or a path the component cannot serve.
    fn create_endpoint(
        &self,
        uri: &EndpointUri,
        ctx: &ComponentContext,
    ) -> Result<Arc<dyn Endpoint>, EndpointError>;
}

pub trait Endpoint: Send + Sync + 'static {
    /// Canonical URI of this endpoint.
    fn uri(&self) -> &str;

    /// # Errors
    ///
    /// [`EndpointError::Unsupported`] for consume-only endpoints.
    fn create_producer(&self) -> Result<Arc<dyn Processor>, EndpointError>;

    /// Creates the consumer feeding this endpoint's exchanges into `route`.
    ///
    /// # Errors
    ///
    /// [`EndpointError::Unsupported`] for produce-only endpoints.
    fn create_consumer(&self, route: RouteHandle) -> Result<Arc<dyn Consumer>, EndpointError> {
        let _ = route;
        Err(EndpointError::Unsupported {
            uri: self.uri().to_string(),
            operation: "consuming",
        })
    }

    /// Upcast used by typed lookups such as `engine.endpoint::<MockEndpoint>(uri)`.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Feeds exchanges into a route between `start` and `stop`.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Components by scheme and endpoints by canonical URI.
pub struct EndpointRegistry {
    components: HashMap<String, Arc<dyn Component>>,
    endpoints: DashMap<String, Arc<dyn Endpoint>>,
    ctx: ComponentContext,
}

impl EndpointRegistry {
    /// Registry with the built-in `direct`, `seda`, `mock`, and `log`
    /// components plus `extra` (which override built-ins of the same scheme).
    #[must_use]
    pub fn new(ctx: ComponentContext, extra: Vec<Arc<dyn Component>>) -> Self {
        let builtins: Vec<Arc<dyn Component>> = vec![
            Arc::new(DirectComponent::new()),
            Arc::new(SedaComponent::new()),
            Arc::new(MockComponent::new()),
            Arc::new(LogComponent),
        ];
        let components = builtins
            .into_iter()
            .chain(extra)
            .map(|c| (c.scheme().to_string(), c))
            .collect();
        Self {
            components,
            endpoints: DashMap::new(),
            ctx,
        }
    }

    /// Resolves `raw` to a cached endpoint, creating it on first use.
    ///
    /// # Errors
    ///
    /// Invalid URI, unknown scheme, or endpoint creation failure.
    pub fn resolve(&self, raw: &str) -> Result<Arc<dyn Endpoint>, EndpointError> {
        let uri = EndpointUri::parse(raw)?;
        let key = uri.to_string();
        if let Some(existing) = self.endpoints.get(&key) {
            return Ok(Arc::clone(existing.value()));
        }
        let component = self
            .components
            .get(uri.scheme())
            .ok_or_else(|| EndpointError::UnknownScheme(uri.scheme().to_string()))?;
        let endpoint = component.create_endpoint(&uri, &self.ctx)?;
        Ok(Arc::clone(
            self.endpoints.entry(key).or_insert(endpoint).value(),
        ))
    }

    /// Typed lookup of an endpoint.
    ///
    /// # Errors
    ///
    /// As [`resolve`](Self::resolve); `None` inside the `Ok` when the
    /// endpoint is not an `E`.
    pub fn typed<E: Endpoint>(&self, raw: &str) -> Result<Option<Arc<E>>, EndpointError> {
        Ok(self.resolve(raw)?.into_any().downcast::<E>().ok())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Applies endpoint URI options to `target` through `configurer`, rejecting
/// unknown names.
pub(crate) fn apply_options<T: 'static>(
    uri: &EndpointUri,
    configurer: &crate::configurer::PropertyConfigurer<T>,
    target: &mut T,
) -> Result<(), EndpointError> {
    configurer
        .configure_all(target, uri.options(), false)
        .map_err(|source| EndpointError::Configuration {
            uri: uri.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> EndpointRegistry {
        EndpointRegistry::new(
            ComponentContext {
                converters: Arc::new(TypeConverterRegistry::default()),
                config: Arc::new(EngineConfig::default()),
            },
            Vec::new(),
        )
    }

    #[test]
    fn parses_scheme_path_and_options() {
        let uri = EndpointUri::parse("SEDA:orders?size=10&blockWhenFull=true").unwrap();
        assert_eq!(uri.scheme(), "seda");
        assert_eq!(uri.path(), "orders");
        assert_eq!(uri.options().get("size").map(String::as_str), Some("10"));
        assert_eq!(uri.to_string(), "seda:orders?blockWhenFull=true&size=10");
    }

    #[test]
    fn rejects_malformed_uris() {
        for raw in ["orders", ":orders", "direct:", "seda:a?size", "seda:a?=1"] {
            assert!(EndpointUri::parse(raw).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn endpoints_are_cached_by_canonical_uri() {
        let registry = registry();
        let a = registry.resolve("seda:out?size=5&blockWhenFull=true").unwrap();
        let b = registry.resolve("seda:out?blockWhenFull=true&size=5").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert!(matches!(
            registry.resolve("seda:out?colour=red"),
            Err(EndpointError::Configuration { .. })
        ));
    }

    #[test]
    fn unknown_scheme_is_reported() {
        assert!(matches!(
            registry().resolve("ftp:somewhere"),
            Err(EndpointError::UnknownScheme(s)) if s == "ftp"
        ));
    }

    #[test]
    fn typed_lookup_downcasts() {
        let registry = registry();
        let mock = registry.typed::<MockEndpoint>("mock:result").unwrap();
        assert!(mock.is_some());
        let not_mock = registry.typed::<MockEndpoint>("log:audit").unwrap();
        assert!(not_mock.is_none());
    }
}
