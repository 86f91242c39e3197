//! Converters every registry starts with when built `with_defaults()`.

use anyhow::Context as _;

use super::{FallbackConverter, TypeConverterRegistry, TypeConverterRegistryBuilder};
use crate::body::{Body, TypeKey};
use crate::error::RouteError;
use crate::types::Value;

pub(super) fn register_defaults(builder: TypeConverterRegistryBuilder) -> TypeConverterRegistryBuilder {
    builder
        .register::<String, Vec<u8>, _>(|s| Ok(s.as_bytes().to_vec()))
        .register::<Vec<u8>, String, _>(|b| {
            String::from_utf8(b.clone()).context("payload is not valid UTF-8")
        })
        .register::<String, i64, _>(|s| {
            s.trim()
                .parse::<i64>()
                .with_context(|| format!("cannot parse {s:?} as integer"))
        })
        .register::<i64, String, _>(|i| Ok(i.to_string()))
        .register::<String, f64, _>(|s| {
            s.trim()
                .parse::<f64>()
                .with_context(|| format!("cannot parse {s:?} as float"))
        })
        .register::<f64, String, _>(|f| Ok(f.to_string()))
        .register::<String, bool, _>(|s| parse_bool(s))
        .register::<bool, String, _>(|b| Ok(b.to_string()))
        .register::<i64, f64, _>(|i| {
            #[allow(clippy::cast_precision_loss)]
            Ok(*i as f64)
        })
        .register::<String, Value, _>(|s| Ok(Value::String(s.clone())))
        .register::<Value, String, _>(|v| Ok(v.to_string()))
        .register::<Value, serde_json::Value, _>(|v| Ok(serde_json::Value::from(v.clone())))
        .register::<serde_json::Value, Value, _>(|j| Ok(Value::from(j.clone())))
        .register::<serde_json::Value, String, _>(|j| {
            serde_json::to_string(j).context("cannot render JSON")
        })
        .register::<String, serde_json::Value, _>(|s| {
            serde_json::from_str(s).context("payload is not valid JSON")
        })
        .register::<Vec<Value>, Value, _>(|items| Ok(Value::Array(items.clone())))
        .add_fallback(ValueFallback)
}

fn parse_bool(s: &str) -> anyhow::Result<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        other => anyhow::bail!("cannot parse {other:?} as boolean"),
    }
}

/// Unwraps a [`Value`] body into its native payload and converts from there.
///
/// `Value::String("42")` reaches `i64` through the `String -> i64` converter,
/// `Value::Bytes` reaches `String` through UTF-8 decoding, and so on. Maps and
/// nulls have no native form and are left to the other strategies.
pub struct ValueFallback;

impl FallbackConverter for ValueFallback {
    fn name(&self) -> &str {
        "value"
    }

    fn try_convert(
        &self,
        body: &Body,
        target: TypeKey,
        registry: &TypeConverterRegistry,
    ) -> Option<Result<Body, RouteError>> {
        let value = body.downcast_ref::<Value>()?;
        let native = match value {
            Value::Bool(b) => Body::new(*b),
            Value::Int(i) => Body::new(*i),
            Value::Float(f) => Body::new(*f),
            Value::String(s) => Body::new(s.clone()),
            Value::Bytes(b) => Body::new(b.clone()),
            Value::Array(items) => Body::new(items.clone()),
            Value::Null | Value::Map(_) => return None,
        };
        if native.type_key() == target {
            return Some(Ok(native));
        }
        match registry.convert(&native, target) {
            Err(RouteError::NoTypeConversionAvailable { .. }) => None,
            other => Some(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn registry() -> TypeConverterRegistry {
        TypeConverterRegistry::default()
    }

    #[test]
    fn bytes_and_strings() {
        let r = registry();
        let bytes: Vec<u8> = r.convert_value("héllo".to_string()).unwrap();
        let back: String = r.convert_value(bytes).unwrap();
        assert_eq!(back, "héllo");
        assert!(r.convert_value::<Vec<u8>, String>(vec![0xff, 0xfe]).is_err());
    }

    #[test]
    fn booleans_accept_common_spellings() {
        let r = registry();
        assert!(r.convert_value::<String, bool>("Yes".into()).unwrap());
        assert!(!r.convert_value::<String, bool>("0".into()).unwrap());
        assert!(r.convert_value::<String, bool>("maybe".into()).is_err());
    }

    #[test]
    fn json_text_round_trip() {
        let r = registry();
        let json: serde_json::Value = r.convert_value(r#"{"a":1}"#.to_string()).unwrap();
        assert_eq!(json["a"], 1);
        let value: Value = r.convert_value(json).unwrap();
        assert!(matches!(value, Value::Map(_)));
    }

    #[test]
    fn integer_reaches_json_through_chain() {
        // i64 -> String -> serde_json::Value
        let json: serde_json::Value = registry().convert_value(12i64).unwrap();
        assert_eq!(json, serde_json::json!(12));
    }

    #[test]
    fn value_map_falls_through_to_text_chain() {
        // Maps skip the fallback; Value -> String -> i64 then fails to parse.
        let err = registry()
            .convert_value::<Value, i64>(Value::Map(std::collections::BTreeMap::new()))
            .unwrap_err();
        assert!(matches!(err, RouteError::ConversionFailed { .. }));
    }

    proptest! {
        #[test]
        fn integer_text_round_trip(n in any::<i64>()) {
            let r = registry();
            let text: String = r.convert_value(n).unwrap();
            let back: i64 = r.convert_value(text).unwrap();
            prop_assert_eq!(back, n);
        }

        #[test]
        fn utf8_round_trip(s in ".*") {
            let r = registry();
            let bytes: Vec<u8> = r.convert_value(s.clone()).unwrap();
            let back: String = r.convert_value(bytes).unwrap();
            prop_assert_eq!(back, s);
        }
    }
}
