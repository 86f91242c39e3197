//! Option configurer: explicit `name -> (type, setter, getter)` tables used to
//! apply string options (endpoint URI parameters, engine settings) to typed
//! targets without reflection.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use switchyard_core::{Body, TypeConverterRegistry, TypeKey, Value};

use crate::error::ConfigError;

type Setter<T> = Box<dyn Fn(&mut T, &Body) -> Result<(), ConfigError> + Send + Sync>;
type Getter<T> = Box<dyn Fn(&T) -> Value + Send + Sync>;

struct OptionEntry<T> {
    name: &'static str,
    declared: TypeKey,
    set: Setter<T>,
    get: Getter<T>,
}

/// Table of configurable options for targets of type `T`.
///
/// Raw values arrive as strings and are converted to the option's declared
/// type through the type converter registry before the setter runs.
pub struct PropertyConfigurer<T> {
    options: Vec<OptionEntry<T>>,
    converters: Arc<TypeConverterRegistry>,
}

impl<T: 'static> PropertyConfigurer<T> {
    #[must_use]
    pub fn new(converters: Arc<TypeConverterRegistry>) -> Self {
        Self {
            options: Vec::new(),
            converters,
        }
    }

    /// Declares an option whose value has type `V`.
    #[must_use]
    pub fn option<V>(mut self, name: &'static str, set: fn(&mut T, V), get: fn(&T) -> V) -> Self
    where
        V: Any + Clone + Send + Sync + Into<Value>,
    {
        self.options.push(OptionEntry {
            name,
            declared: TypeKey::of::<V>(),
            set: Box::new(move |target, body| {
                let value = body.downcast_ref::<V>().cloned().ok_or_else(|| {
                    ConfigError::OutOfRange {
                        name: name.to_string(),
                        reason: format!("expected {}", TypeKey::of::<V>()),
                    }
                })?;
                set(target, value);
                Ok(())
            }),
            get: Box::new(move |target| get(target).into()),
        });
        self
    }

    /// Declares an option with a validating setter.
    #[must_use]
    pub fn checked_option<V>(
        mut self,
        name: &'static str,
        set: fn(&mut T, V) -> Result<(), String>,
        get: fn(&T) -> V,
    ) -> Self
    where
        V: Any + Clone + Send + Sync + Into<Value>,
    {
        self.options.push(OptionEntry {
            name,
            declared: TypeKey::of::<V>(),
            set: Box::new(move |target, body| {
                let value = body.downcast_ref::<V>().cloned().ok_or_else(|| {
                    ConfigError::OutOfRange {
                        name: name.to_string(),
                        reason: format!("expected {}", TypeKey::of::<V>()),
                    }
                })?;
                set(target, value).map_err(|reason| ConfigError::OutOfRange {
                    name: name.to_string(),
                    reason,
                })
            }),
            get: Box::new(move |target| get(target).into()),
        });
        self
    }

    fn find(&self, name: &str, ignore_case: bool) -> Option<&OptionEntry<T>> {
        self.options.iter().find(|entry| {
            if ignore_case {
                entry.name.eq_ignore_ascii_case(name)
            } else {
                entry.name == name
            }
        })
    }

    /// Applies one option. Returns `Ok(false)` when the name is unknown.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when `raw` cannot be converted to
    /// the declared type, or [`ConfigError::OutOfRange`] when the setter
    /// rejects it.
    pub fn configure(
        &self,
        target: &mut T,
        name: &str,
        raw: &str,
        ignore_case: bool,
    ) -> Result<bool, ConfigError> {
        let Some(entry) = self.find(name, ignore_case) else {
            return Ok(false);
        };
        let converted = self
            .converters
            .convert(&Body::new(raw.to_string()), entry.declared)
            .map_err(|source| ConfigError::InvalidValue {
                name: entry.name.to_string(),
                value: raw.to_string(),
                source,
            })?;
        (entry.set)(target, &converted)?;
        Ok(true)
    }

    /// Applies every option in `options`, failing on the first unknown name.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownOption`] for names with no table entry, plus the
    /// errors of [`configure`](Self::configure).
    pub fn configure_all(
        &self,
        target: &mut T,
        options: &BTreeMap<String, String>,
        ignore_case: bool,
    ) -> Result<(), ConfigError> {
        for (name, raw) in options {
            if !self.configure(target, name, raw, ignore_case)? {
                return Err(ConfigError::UnknownOption(name.clone()));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn option_type(&self, name: &str, ignore_case: bool) -> Option<TypeKey> {
        self.find(name, ignore_case).map(|entry| entry.declared)
    }

    #[must_use]
    pub fn option_value(&self, target: &T, name: &str, ignore_case: bool) -> Option<Value> {
        self.find(name, ignore_case).map(|entry| (entry.get)(target))
    }
}
