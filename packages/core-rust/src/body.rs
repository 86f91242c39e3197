//! Opaque typed payloads and the runtime type keys used to convert them.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::types::Value;

/// Identifies a runtime payload representation.
///
/// Equality and hashing use the `TypeId` only; the name is carried for
/// diagnostics and logs.
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    #[must_use]
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    #[must_use]
    pub fn id(&self) -> TypeId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Opaque message payload.
///
/// The value is immutable and reference counted, so copying an exchange for
/// fan-out never copies payload bytes. Changing a body means replacing it.
#[derive(Clone)]
pub struct Body {
    value: Arc<dyn Any + Send + Sync>,
    type_key: TypeKey,
}

impl Body {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_key: TypeKey::of::<T>(),
        }
    }

    #[must_use]
    pub fn type_key(&self) -> TypeKey {
        self.type_key
    }

    #[must_use]
    pub fn is<T: Any>(&self) -> bool {
        self.type_key.id() == TypeId::of::<T>()
    }

    /// Borrows the payload if it is exactly a `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Convenience accessor for string payloads.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.downcast_ref::<String>().map(String::as_str)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.downcast_ref::<String>() {
            return write!(f, "Body({s:?})");
        }
        if let Some(v) = self.downcast_ref::<Value>() {
            return write!(f, "Body({v:?})");
        }
        if let Some(i) = self.downcast_ref::<i64>() {
            return write!(f, "Body({i})");
        }
        write!(f, "Body(<{}>)", self.type_key.name())
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Body::new(value)
    }
}

impl From<&str> for Body {
    fn from(value: &str) -> Self {
        Body::new(value.to_string())
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Body::new(value)
    }
}

impl From<i64> for Body {
    fn from(value: i64) -> Self {
        Body::new(value)
    }
}

impl From<Value> for Body {
    fn from(value: Value) -> Self {
        Body::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_key_equality_ignores_name_source() {
        assert_eq!(TypeKey::of::<String>(), TypeKey::of::<String>());
        assert_ne!(TypeKey::of::<String>(), TypeKey::of::<i64>());
        assert!(TypeKey::of::<String>().name().contains("String"));
    }

    #[test]
    fn downcast_only_exact_type() {
        let body = Body::from("hello");
        assert!(body.is::<String>());
        assert_eq!(body.as_str(), Some("hello"));
        assert!(body.downcast_ref::<i64>().is_none());
    }

    #[test]
    fn clone_shares_payload() {
        let body = Body::new(vec![1u8, 2, 3]);
        let copy = body.clone();
        let a = body.downcast_ref::<Vec<u8>>().map(Vec::as_ptr);
        let b = copy.downcast_ref::<Vec<u8>>().map(Vec::as_ptr);
        assert_eq!(a, b);
    }

    #[test]
    fn debug_shows_known_payloads() {
        assert_eq!(format!("{:?}", Body::from("x")), "Body(\"x\")");
        assert_eq!(format!("{:?}", Body::from(5i64)), "Body(5)");
    }
}
