//! The rich value domain extensions operate on.
//!
//! `ExtValue` is a superset of JSON: alongside the plain data kinds it can
//! hold live functions and error values. Only its marshaled form (see
//! [`crate::marshal`]) ever crosses the isolation boundary.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::ErrorProxy;

/// Future returned by an [`ExtFunction`] invocation.
pub type ExtFunctionFuture = BoxFuture<'static, std::result::Result<ExtValue, ErrorProxy>>;

/// A callable extension value with a declared arity.
///
/// Invocations are asynchronous even when the body is synchronous: the value
/// may be a hydrated stub whose call is a full round trip across the
/// isolation boundary.
#[derive(Clone)]
pub struct ExtFunction {
    arity: usize,
    inner: Arc<dyn Fn(Vec<ExtValue>) -> ExtFunctionFuture + Send + Sync>,
}

impl ExtFunction {
    /// Create a function from an async-producing closure.
    pub fn new(
        arity: usize,
        f: impl Fn(Vec<ExtValue>) -> ExtFunctionFuture + Send + Sync + 'static,
    ) -> Self {
        Self {
            arity,
            inner: Arc::new(f),
        }
    }

    /// Create a function from a synchronous closure.
    pub fn from_sync(
        arity: usize,
        f: impl Fn(Vec<ExtValue>) -> std::result::Result<ExtValue, ErrorProxy>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self::new(arity, move |args| {
            let out = f(args);
            Box::pin(async move { out })
        })
    }

    /// Declared argument count. Calls must match it exactly.
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Invoke the function.
    pub fn call(&self, args: Vec<ExtValue>) -> ExtFunctionFuture {
        (self.inner)(args)
    }

    fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ExtFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<function/{}>", self.arity)
    }
}

/// A value flowing through extension exports.
#[derive(Debug, Clone)]
pub enum ExtValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<ExtValue>),
    Object(BTreeMap<String, ExtValue>),
    Function(ExtFunction),
    Error(ErrorProxy),
}

impl ExtValue {
    pub fn int(v: i64) -> Self {
        Self::Number(v.into())
    }

    /// Build a number from a float. Non-finite floats collapse to `Null`,
    /// matching the JSON value domain.
    pub fn float(v: f64) -> Self {
        serde_json::Number::from_f64(v).map_or(Self::Null, Self::Number)
    }

    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    pub fn array(items: impl IntoIterator<Item = ExtValue>) -> Self {
        Self::Array(items.into_iter().collect())
    }

    pub fn object(entries: impl IntoIterator<Item = (String, ExtValue)>) -> Self {
        Self::Object(entries.into_iter().collect())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, ExtValue>> {
        match self {
            Self::Object(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&ExtFunction> {
        match self {
            Self::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Classification label used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Function(_) => "function",
            Self::Error(_) => "error",
        }
    }

    /// Convert into plain JSON. Fails on functions and error values: those
    /// kinds have no data representation outside the marshaled wire form.
    pub fn into_json(self) -> crate::Result<serde_json::Value> {
        match self {
            Self::Null => Ok(serde_json::Value::Null),
            Self::Bool(b) => Ok(serde_json::Value::Bool(b)),
            Self::Number(n) => Ok(serde_json::Value::Number(n)),
            Self::String(s) => Ok(serde_json::Value::String(s)),
            Self::Array(items) => Ok(serde_json::Value::Array(
                items
                    .into_iter()
                    .map(ExtValue::into_json)
                    .collect::<crate::Result<_>>()?,
            )),
            Self::Object(entries) => {
                let mut map = serde_json::Map::with_capacity(entries.len());
                for (key, value) in entries {
                    map.insert(key, value.into_json()?);
                }
                Ok(serde_json::Value::Object(map))
            }
            Self::Function(f) => Err(crate::Error::validation(format!(
                "a function value (arity {}) cannot be represented as plain data",
                f.arity()
            ))),
            Self::Error(proxy) => Err(crate::Error::validation(format!(
                "an error value ({proxy}) cannot be represented as plain data"
            ))),
        }
    }
}

impl PartialEq for ExtValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a == b,
            (Self::Function(a), Self::Function(b)) => a.ptr_eq(b),
            (Self::Error(a), Self::Error(b)) => a == b,
            _ => false,
        }
    }
}

impl From<serde_json::Value> for ExtValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(ExtValue::from).collect())
            }
            serde_json::Value::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, ExtValue::from(v))).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_conversion_round_trips_plain_data() {
        let json = serde_json::json!({
            "name": "caesar",
            "shift": 3,
            "enabled": true,
            "aliases": ["rot", null],
        });
        let value = ExtValue::from(json.clone());
        assert_eq!(value.into_json().unwrap(), json);
    }

    #[test]
    fn functions_are_rejected_by_json_conversion() {
        let value = ExtValue::object([(
            "run".to_string(),
            ExtValue::Function(ExtFunction::from_sync(1, |mut args| Ok(args.remove(0)))),
        )]);
        assert!(value.into_json().is_err());
    }

    #[test]
    fn function_equality_is_identity() {
        let f = ExtFunction::from_sync(0, |_| Ok(ExtValue::Null));
        let a = ExtValue::Function(f.clone());
        let b = ExtValue::Function(f);
        let c = ExtValue::Function(ExtFunction::from_sync(0, |_| Ok(ExtValue::Null)));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn sync_functions_resolve_immediately() {
        let double = ExtFunction::from_sync(1, |args| {
            let n = args[0].as_f64().unwrap_or_default();
            Ok(ExtValue::float(n * 2.0))
        });
        let out = double.call(vec![ExtValue::int(21)]).await.unwrap();
        assert_eq!(out.as_f64(), Some(42.0));
    }
}
