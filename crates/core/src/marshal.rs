//! Marshal/hydrate layer for boundary-crossing values.
//!
//! Marshaling classifies a value into one of five kinds (array, plain
//! object, function, error, scalar) and rewrites the two live kinds into
//! proxies: functions become pointer proxies registered in the local
//! [`FunctionRegistry`], errors become name+message snapshots. Hydration is
//! the inverse; a hydrated function proxy is a stub that pays one full
//! message round trip per invocation through a [`RemoteCaller`].

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::error::ErrorProxy;
use crate::proto::{RemoteOutcome, WireValue};
use crate::value::{ExtFunction, ExtValue};

/// Registry of live functions addressable by pointer string.
///
/// One registry per side of a boundary, living exactly as long as its
/// environment: entries are never removed individually, only wiped with the
/// environment itself.
#[derive(Default)]
pub struct FunctionRegistry {
    entries: DashMap<String, ExtFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live function, returning its freshly generated pointer.
    ///
    /// The pointer string encodes the declared arity alongside a unique id so
    /// the remote side can pre-validate call arity without a round trip.
    pub fn register(&self, function: ExtFunction) -> String {
        let pointer = format!("fn:{}:{}", function.arity(), Uuid::new_v4());
        self.entries.insert(pointer.clone(), function);
        pointer
    }

    pub fn get(&self, pointer: &str) -> Option<ExtFunction> {
        self.entries.get(pointer).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The outbound half of a function-pointer round trip.
///
/// Implemented by each side of the boundary: the worker routes calls to the
/// controller's registry and vice versa. The future is `'static` so hydrated
/// stubs can outlive the hydration call site.
pub trait RemoteCaller: Send + Sync {
    fn call_function_pointer(
        &self,
        pointer: String,
        args: Vec<WireValue>,
    ) -> BoxFuture<'static, RemoteOutcome>;
}

/// Marshal a value for the boundary, registering live functions locally.
pub fn marshal(value: ExtValue, registry: &FunctionRegistry) -> WireValue {
    match value {
        ExtValue::Null => WireValue::Null,
        ExtValue::Bool(value) => WireValue::Bool { value },
        ExtValue::Number(value) => WireValue::Number { value },
        ExtValue::String(value) => WireValue::String { value },
        ExtValue::Array(items) => WireValue::Array {
            items: items.into_iter().map(|v| marshal(v, registry)).collect(),
        },
        ExtValue::Object(entries) => WireValue::Object {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k, marshal(v, registry)))
                .collect(),
        },
        ExtValue::Function(function) => {
            let arity = function.arity();
            let pointer = registry.register(function);
            WireValue::Function { pointer, arity }
        }
        ExtValue::Error(proxy) => WireValue::Error {
            name: proxy.name,
            message: proxy.message,
        },
    }
}

/// Hydrate a wire value received from the boundary.
///
/// Function proxies become callable stubs bound to `caller`; arguments a stub
/// is invoked with are marshaled against `registry`, so callbacks may carry
/// further functions to arbitrary nesting depth.
pub fn hydrate(
    value: WireValue,
    registry: &Arc<FunctionRegistry>,
    caller: &Arc<dyn RemoteCaller>,
) -> ExtValue {
    match value {
        WireValue::Null => ExtValue::Null,
        WireValue::Bool { value } => ExtValue::Bool(value),
        WireValue::Number { value } => ExtValue::Number(value),
        WireValue::String { value } => ExtValue::String(value),
        WireValue::Array { items } => ExtValue::Array(
            items
                .into_iter()
                .map(|v| hydrate(v, registry, caller))
                .collect(),
        ),
        WireValue::Object { entries } => ExtValue::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k, hydrate(v, registry, caller)))
                .collect(),
        ),
        WireValue::Function { pointer, arity } => {
            let registry = Arc::clone(registry);
            let caller = Arc::clone(caller);
            ExtValue::Function(ExtFunction::new(arity, move |args| {
                let registry = Arc::clone(&registry);
                let caller = Arc::clone(&caller);
                let pointer = pointer.clone();
                Box::pin(async move {
                    if args.len() != arity {
                        return Err(ErrorProxy::from(crate::Error::ArityMismatch {
                            expected: arity,
                            actual: args.len(),
                        }));
                    }
                    let wire_args = args
                        .into_iter()
                        .map(|arg| marshal(arg, &registry))
                        .collect();
                    let outcome = caller.call_function_pointer(pointer, wire_args).await?;
                    Ok(hydrate(outcome, &registry, &caller))
                })
            }))
        }
        WireValue::Error { name, message } => ExtValue::Error(ErrorProxy::new(name, message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Loopback caller: resolves pointers against a registry on "the other
    /// side" and records every crossing.
    struct LoopbackCaller {
        remote: Arc<FunctionRegistry>,
        calls: Mutex<Vec<String>>,
    }

    impl RemoteCaller for LoopbackCaller {
        fn call_function_pointer(
            &self,
            pointer: String,
            args: Vec<WireValue>,
        ) -> BoxFuture<'static, RemoteOutcome> {
            self.calls.lock().unwrap().push(pointer.clone());
            let remote = Arc::clone(&self.remote);
            Box::pin(async move {
                let function = remote
                    .get(&pointer)
                    .ok_or_else(|| ErrorProxy::new("UnknownFunctionPointerError", pointer))?;
                let hydrator: Arc<dyn RemoteCaller> = Arc::new(NoCaller);
                let local = Arc::new(FunctionRegistry::new());
                let args = args
                    .into_iter()
                    .map(|a| hydrate(a, &local, &hydrator))
                    .collect();
                let out = function.call(args).await?;
                Ok(marshal(out, &remote))
            })
        }
    }

    struct NoCaller;

    impl RemoteCaller for NoCaller {
        fn call_function_pointer(
            &self,
            _pointer: String,
            _args: Vec<WireValue>,
        ) -> BoxFuture<'static, RemoteOutcome> {
            Box::pin(async { Err(ErrorProxy::new("EnvironmentError", "no boundary")) })
        }
    }

    fn sample_value() -> ExtValue {
        ExtValue::object([
            ("name".to_string(), ExtValue::string("rot13")),
            ("shift".to_string(), ExtValue::int(13)),
            ("wrap".to_string(), ExtValue::Bool(true)),
            (
                "alphabet".to_string(),
                ExtValue::array([ExtValue::string("a"), ExtValue::Null, ExtValue::float(0.5)]),
            ),
        ])
    }

    #[test]
    fn marshal_hydrate_round_trips_plain_values() {
        let registry = Arc::new(FunctionRegistry::new());
        let caller: Arc<dyn RemoteCaller> = Arc::new(NoCaller);
        let original = sample_value();
        let wire = marshal(original.clone(), &registry);
        let back = hydrate(wire, &registry, &caller);
        assert_eq!(back, original);
        assert!(registry.is_empty());
    }

    #[test]
    fn errors_cross_as_name_and_message_only() {
        let registry = Arc::new(FunctionRegistry::new());
        let caller: Arc<dyn RemoteCaller> = Arc::new(NoCaller);
        let wire = marshal(
            ExtValue::Error(ErrorProxy::new("Error", "bad key")),
            &registry,
        );
        assert_eq!(
            wire,
            WireValue::Error {
                name: "Error".into(),
                message: "bad key".into()
            }
        );
        let back = hydrate(wire, &registry, &caller);
        assert_eq!(back, ExtValue::Error(ErrorProxy::new("Error", "bad key")));
    }

    #[tokio::test]
    async fn hydrated_function_issues_exactly_one_pointer_call() {
        let remote = Arc::new(FunctionRegistry::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_fn = Arc::clone(&hits);
        let double = ExtFunction::from_sync(1, move |args| {
            hits_in_fn.fetch_add(1, Ordering::SeqCst);
            let n = args[0].as_f64().unwrap_or_default();
            Ok(ExtValue::float(n * 2.0))
        });

        let wire = marshal(ExtValue::Function(double), &remote);
        assert!(matches!(wire, WireValue::Function { arity: 1, .. }));

        let caller: Arc<dyn RemoteCaller> = Arc::new(LoopbackCaller {
            remote: Arc::clone(&remote),
            calls: Mutex::new(Vec::new()),
        });
        let local = Arc::new(FunctionRegistry::new());
        let stub = match hydrate(wire, &local, &caller) {
            ExtValue::Function(f) => f,
            other => panic!("expected function stub, got {other:?}"),
        };

        let out = stub.call(vec![ExtValue::int(21)]).await.unwrap();
        assert_eq!(out.as_f64(), Some(42.0));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stub_pre_validates_arity_without_a_round_trip() {
        let remote = Arc::new(FunctionRegistry::new());
        let wire = marshal(
            ExtValue::Function(ExtFunction::from_sync(2, |_| Ok(ExtValue::Null))),
            &remote,
        );
        let loopback = Arc::new(LoopbackCaller {
            remote: Arc::clone(&remote),
            calls: Mutex::new(Vec::new()),
        });
        let caller: Arc<dyn RemoteCaller> = loopback.clone();
        let local = Arc::new(FunctionRegistry::new());
        let stub = match hydrate(wire, &local, &caller) {
            ExtValue::Function(f) => f,
            other => panic!("expected function stub, got {other:?}"),
        };

        let err = stub.call(vec![ExtValue::Null]).await.unwrap_err();
        assert_eq!(err.name, "ArityMismatchError");
        assert!(loopback.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn pointer_encodes_arity() {
        let registry = FunctionRegistry::new();
        let pointer = registry.register(ExtFunction::from_sync(3, |_| Ok(ExtValue::Null)));
        assert!(pointer.starts_with("fn:3:"));
        assert_eq!(registry.len(), 1);
    }
}
