//! The sandbox worker runtime.
//!
//! Runs as an isolated task: receives `WorkerMessage`s, executes bundle
//! scripts through the module loader, invokes module exports with hydrated
//! arguments, and marshals everything leaving the sandbox. Each inbound
//! request is handled on its own spawned task, so responses may complete out
//! of order; correlation is by id only.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use pipeforge_core::{
    hydrate, marshal, ControllerMessage, ControllerRequest, Error, ErrorProxy, ExtFunction,
    ExtValue, FunctionRegistry, RemoteCaller, RemoteOutcome, Result, SandboxLimits, WireValue,
    WorkerMessage, WorkerRequest, MAX_REQUEST_ID,
};
use pipeforge_loader::{ModuleLoader, ScriptScope};

use crate::resolver::ScriptResolver;

/// State owned by one worker for the lifetime of its environment.
pub(crate) struct WorkerShared {
    loader: ModuleLoader,
    imported: tokio::sync::Mutex<HashSet<Url>>,
    registry: Arc<FunctionRegistry>,
    resolver: Arc<dyn ScriptResolver>,
    outbound: mpsc::Sender<ControllerMessage>,
    /// Worker-originated requests awaiting controller responses. Its id space
    /// is independent from the controller's.
    pending: Mutex<PendingCalls>,
    limits: Mutex<SandboxLimits>,
}

struct PendingCalls {
    next_id: u64,
    slots: HashMap<u64, oneshot::Sender<RemoteOutcome>>,
}

pub(crate) struct WorkerLink {
    pub tx: mpsc::Sender<WorkerMessage>,
    pub join: tokio::task::JoinHandle<Result<()>>,
}

/// Boot a worker task with its own inbound and outbound channels.
pub(crate) fn spawn_worker(
    resolver: Arc<dyn ScriptResolver>,
    capacity: usize,
) -> (WorkerLink, mpsc::Receiver<ControllerMessage>) {
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
    let shared = Arc::new(WorkerShared {
        loader: ModuleLoader::new(),
        imported: tokio::sync::Mutex::new(HashSet::new()),
        registry: Arc::new(FunctionRegistry::new()),
        resolver,
        outbound: outbound_tx,
        pending: Mutex::new(PendingCalls {
            next_id: 0,
            slots: HashMap::new(),
        }),
        limits: Mutex::new(SandboxLimits::default()),
    });
    let join = tokio::spawn(run_worker(inbound_rx, shared));
    (
        WorkerLink {
            tx: inbound_tx,
            join,
        },
        outbound_rx,
    )
}

/// The worker event loop. Returns an error only on fatal conditions; the
/// relay converts that into an `error` message on the controller side.
async fn run_worker(
    mut inbound: mpsc::Receiver<WorkerMessage>,
    shared: Arc<WorkerShared>,
) -> Result<()> {
    shared
        .outbound
        .send(ControllerMessage::Initialized)
        .await
        .map_err(|_| Error::environment("controller channel closed before initialization"))?;

    while let Some(message) = inbound.recv().await {
        match message {
            WorkerMessage::Request { id, request } => {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    let outcome = handle_request(&shared, request).await;
                    let _ = shared
                        .outbound
                        .send(ControllerMessage::Respond { id, outcome })
                        .await;
                });
            }
            WorkerMessage::Respond { id, outcome } => {
                let slot = shared.lock_pending()?.slots.remove(&id);
                match slot {
                    Some(tx) => {
                        let _ = tx.send(outcome);
                    }
                    None => {
                        return Err(Error::protocol(format!(
                            "respond carries unknown worker request id {id}"
                        )));
                    }
                }
            }
            // The relay terminates the worker itself and never forwards this
            // variant; the arm exists so dispatch stays exhaustive.
            WorkerMessage::Terminate => {}
        }
    }
    Ok(())
}

async fn handle_request(shared: &Arc<WorkerShared>, request: WorkerRequest) -> RemoteOutcome {
    dispatch_request(shared, request)
        .await
        .map_err(ErrorProxy::from)
}

async fn dispatch_request(
    shared: &Arc<WorkerShared>,
    request: WorkerRequest,
) -> Result<WireValue> {
    match request {
        WorkerRequest::Configure { settings } => {
            *shared.lock_limits()? = settings;
            Ok(WireValue::Null)
        }
        WorkerRequest::Ping => Ok(WireValue::Null),
        WorkerRequest::ImportScripts { urls } => {
            for url in &urls {
                import_bundle(shared, url).await?;
            }
            Ok(WireValue::Null)
        }
        WorkerRequest::GetModuleExport {
            bundle_url,
            module_id,
            export_name,
        } => {
            import_bundle(shared, &bundle_url).await?;
            let value = lookup_export(shared, &bundle_url, &module_id, &export_name)?;
            Ok(marshal(value, &shared.registry))
        }
        WorkerRequest::CallModuleExport {
            bundle_url,
            module_id,
            export_name,
            args,
            timeout_ms,
        } => {
            import_bundle(shared, &bundle_url).await?;
            let value = lookup_export(shared, &bundle_url, &module_id, &export_name)?;
            let function = match value {
                ExtValue::Function(function) => function,
                other => {
                    tracing::debug!(
                        module = %module_id,
                        export = %export_name,
                        kind = other.kind(),
                        "call target is not a function"
                    );
                    return Err(Error::NotCallable {
                        module: module_id,
                        export: export_name,
                    });
                }
            };
            invoke(shared, function, args, timeout_ms).await
        }
        WorkerRequest::CallFunctionPointer { pointer, args } => {
            let function = shared
                .registry
                .get(&pointer)
                .ok_or(Error::UnknownFunctionPointer(pointer))?;
            invoke(shared, function, args, None).await
        }
    }
}

/// Arity-check, hydrate, invoke under the configured timeout, marshal back.
/// The arity check runs before hydration so a mismatched call has no side
/// effects at all.
async fn invoke(
    shared: &Arc<WorkerShared>,
    function: ExtFunction,
    args: Vec<WireValue>,
    timeout_ms: Option<u64>,
) -> Result<WireValue> {
    if args.len() != function.arity() {
        return Err(Error::ArityMismatch {
            expected: function.arity(),
            actual: args.len(),
        });
    }

    let caller: Arc<dyn RemoteCaller> = Arc::new(WorkerCaller {
        shared: Arc::clone(shared),
    });
    let args: Vec<ExtValue> = args
        .into_iter()
        .map(|arg| hydrate(arg, &shared.registry, &caller))
        .collect();

    let timeout = Duration::from_millis(match timeout_ms {
        Some(ms) => ms,
        None => shared.lock_limits()?.default_timeout_ms,
    });
    let outcome = tokio::time::timeout(timeout, function.call(args))
        .await
        .map_err(|_| {
            Error::Timeout(format!(
                "export invocation exceeded {} ms",
                timeout.as_millis()
            ))
        })?;
    let value = outcome.map_err(Error::from)?;
    Ok(marshal(value, &shared.registry))
}

fn lookup_export(
    shared: &Arc<WorkerShared>,
    bundle_url: &Url,
    module_id: &str,
    export_name: &str,
) -> Result<ExtValue> {
    let module = shared.loader.require(bundle_url, module_id)?;
    module
        .as_object()
        .and_then(|entries| entries.get(export_name))
        .cloned()
        .ok_or_else(|| Error::ExportNotAvailable {
            module: module_id.to_string(),
            export: export_name.to_string(),
        })
}

async fn import_bundle(shared: &Arc<WorkerShared>, url: &Url) -> Result<()> {
    let mut imported = shared.imported.lock().await;
    if imported.contains(url) {
        return Ok(());
    }
    let script = shared.resolver.fetch(url).await?;
    let mut scope = ScriptScope::new(&shared.loader, url.clone());
    script.evaluate(&mut scope)?;
    imported.insert(url.clone());
    tracing::debug!(bundle = %url, "bundle imported");
    Ok(())
}

impl WorkerShared {
    fn lock_pending(&self) -> Result<MutexGuard<'_, PendingCalls>> {
        self.pending
            .lock()
            .map_err(|_| Error::internal("worker pending map lock poisoned"))
    }

    fn lock_limits(&self) -> Result<MutexGuard<'_, SandboxLimits>> {
        self.limits
            .lock()
            .map_err(|_| Error::internal("worker limits lock poisoned"))
    }
}

/// Routes hydrated function-pointer stubs back to the controller's registry.
struct WorkerCaller {
    shared: Arc<WorkerShared>,
}

impl RemoteCaller for WorkerCaller {
    fn call_function_pointer(
        &self,
        pointer: String,
        args: Vec<WireValue>,
    ) -> BoxFuture<'static, RemoteOutcome> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            let (id, rx) = {
                let mut pending = shared
                    .lock_pending()
                    .map_err(ErrorProxy::from)?;
                let id = next_request_id(&mut pending);
                let (tx, rx) = oneshot::channel();
                pending.slots.insert(id, tx);
                (id, rx)
            };

            let request = ControllerRequest::CallFunctionPointer { pointer, args };
            if shared
                .outbound
                .send(ControllerMessage::Request { id, request })
                .await
                .is_err()
            {
                if let Ok(mut pending) = shared.pending.lock() {
                    pending.slots.remove(&id);
                }
                return Err(ErrorProxy::from(Error::environment(
                    "controller channel closed during callback",
                )));
            }

            match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(ErrorProxy::from(Error::environment(
                    "worker torn down while awaiting callback response",
                ))),
            }
        })
    }
}

/// Allocate the next worker-side request id, wrapping at the JSON-safe
/// boundary and skipping ids that still have a pending entry.
fn next_request_id(pending: &mut PendingCalls) -> u64 {
    loop {
        let id = pending.next_id;
        pending.next_id = if pending.next_id >= MAX_REQUEST_ID {
            0
        } else {
            pending.next_id + 1
        };
        if !pending.slots.contains_key(&id) {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{FnScript, StaticResolver};

    fn math_bundle_url() -> Url {
        Url::parse("test://math").unwrap()
    }

    /// A bundle in the shape extension authors produce: one module, data and
    /// function exports, defined through the exports-mutation pattern.
    fn math_resolver() -> Arc<StaticResolver> {
        let resolver = StaticResolver::new();
        resolver.register(
            math_bundle_url(),
            Arc::new(FnScript::new(|scope| {
                scope.define(
                    Some("mod"),
                    Some(vec!["exports".to_string()]),
                    Box::new(|slots| {
                        if let ExtValue::Object(entries) = &mut slots[0] {
                            entries.insert("VERSION".to_string(), ExtValue::string("1.0.0"));
                            entries.insert(
                                "double".to_string(),
                                ExtValue::Function(ExtFunction::from_sync(1, |args| {
                                    match args[0].as_i64() {
                                        Some(n) => Ok(ExtValue::int(n * 2)),
                                        None => {
                                            Err(ErrorProxy::new("Error", "expected a number"))
                                        }
                                    }
                                })),
                            );
                            entries.insert(
                                "tap".to_string(),
                                ExtValue::Function(ExtFunction::new(1, |args| {
                                    Box::pin(async move {
                                        let callback = args[0]
                                            .as_function()
                                            .ok_or_else(|| {
                                                ErrorProxy::new("Error", "expected a callback")
                                            })?
                                            .clone();
                                        callback.call(vec![ExtValue::int(5)]).await
                                    })
                                })),
                            );
                        }
                        Ok(ExtValue::Null)
                    }),
                )
            })),
        );
        Arc::new(resolver)
    }

    struct WorkerHarness {
        tx: mpsc::Sender<WorkerMessage>,
        rx: mpsc::Receiver<ControllerMessage>,
        _join: tokio::task::JoinHandle<Result<()>>,
    }

    async fn start_worker() -> WorkerHarness {
        let (link, mut rx) = spawn_worker(math_resolver(), 16);
        match rx.recv().await {
            Some(ControllerMessage::Initialized) => {}
            other => panic!("expected initialized, got {other:?}"),
        }
        WorkerHarness {
            tx: link.tx,
            rx,
            _join: link.join,
        }
    }

    async fn roundtrip(harness: &mut WorkerHarness, id: u64, request: WorkerRequest) -> RemoteOutcome {
        harness
            .tx
            .send(WorkerMessage::Request { id, request })
            .await
            .unwrap();
        match harness.rx.recv().await {
            Some(ControllerMessage::Respond { id: got, outcome }) => {
                assert_eq!(got, id);
                outcome
            }
            other => panic!("expected respond, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn call_module_export_doubles() {
        let mut harness = start_worker().await;
        let outcome = roundtrip(
            &mut harness,
            1,
            WorkerRequest::CallModuleExport {
                bundle_url: math_bundle_url(),
                module_id: "mod".into(),
                export_name: "double".into(),
                args: vec![WireValue::Number { value: 21.into() }],
                timeout_ms: None,
            },
        )
        .await;
        assert_eq!(outcome.unwrap(), WireValue::Number { value: 42.into() });
    }

    #[tokio::test]
    async fn get_module_export_marshals_functions_as_proxies() {
        let mut harness = start_worker().await;
        let version = roundtrip(
            &mut harness,
            1,
            WorkerRequest::GetModuleExport {
                bundle_url: math_bundle_url(),
                module_id: "mod".into(),
                export_name: "VERSION".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            version,
            WireValue::String {
                value: "1.0.0".into()
            }
        );

        let double = roundtrip(
            &mut harness,
            2,
            WorkerRequest::GetModuleExport {
                bundle_url: math_bundle_url(),
                module_id: "mod".into(),
                export_name: "double".into(),
            },
        )
        .await
        .unwrap();
        assert!(matches!(double, WireValue::Function { arity: 1, .. }));
    }

    #[tokio::test]
    async fn arity_mismatch_rejects_without_invoking() {
        let mut harness = start_worker().await;
        let err = roundtrip(
            &mut harness,
            1,
            WorkerRequest::CallModuleExport {
                bundle_url: math_bundle_url(),
                module_id: "mod".into(),
                export_name: "double".into(),
                args: vec![
                    WireValue::Number { value: 1.into() },
                    WireValue::Number { value: 2.into() },
                ],
                timeout_ms: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.name, "ArityMismatchError");
    }

    #[tokio::test]
    async fn missing_export_is_not_available() {
        let mut harness = start_worker().await;
        let err = roundtrip(
            &mut harness,
            1,
            WorkerRequest::GetModuleExport {
                bundle_url: math_bundle_url(),
                module_id: "mod".into(),
                export_name: "halve".into(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.name, "ExportNotAvailableError");
    }

    #[tokio::test]
    async fn data_export_is_not_callable() {
        let mut harness = start_worker().await;
        let err = roundtrip(
            &mut harness,
            1,
            WorkerRequest::CallModuleExport {
                bundle_url: math_bundle_url(),
                module_id: "mod".into(),
                export_name: "VERSION".into(),
                args: vec![],
                timeout_ms: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.name, "NotCallableError");
    }

    #[tokio::test]
    async fn unknown_function_pointer_is_rejected() {
        let mut harness = start_worker().await;
        let err = roundtrip(
            &mut harness,
            1,
            WorkerRequest::CallFunctionPointer {
                pointer: "fn:0:no-such-pointer".into(),
                args: vec![],
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.name, "UnknownFunctionPointerError");
    }

    #[tokio::test]
    async fn export_error_crosses_as_error_proxy() {
        let mut harness = start_worker().await;
        let err = roundtrip(
            &mut harness,
            1,
            WorkerRequest::CallModuleExport {
                bundle_url: math_bundle_url(),
                module_id: "mod".into(),
                export_name: "double".into(),
                args: vec![WireValue::String {
                    value: "nope".into(),
                }],
                timeout_ms: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err, ErrorProxy::new("Error", "expected a number"));
    }

    #[tokio::test]
    async fn callback_argument_rides_back_through_the_boundary() {
        let mut harness = start_worker().await;

        // Play the controller: register nothing, just answer the worker's
        // callFunctionPointer request by hand.
        harness
            .tx
            .send(WorkerMessage::Request {
                id: 9,
                request: WorkerRequest::CallModuleExport {
                    bundle_url: math_bundle_url(),
                    module_id: "mod".into(),
                    export_name: "tap".into(),
                    args: vec![WireValue::Function {
                        pointer: "fn:1:controller-side".into(),
                        arity: 1,
                    }],
                    timeout_ms: None,
                },
            })
            .await
            .unwrap();

        // The export invokes the hydrated stub, which issues exactly one
        // controller-bound request.
        let (callback_id, pointer, args) = match harness.rx.recv().await {
            Some(ControllerMessage::Request {
                id,
                request: ControllerRequest::CallFunctionPointer { pointer, args },
            }) => (id, pointer, args),
            other => panic!("expected callback request, got {other:?}"),
        };
        assert_eq!(pointer, "fn:1:controller-side");
        assert_eq!(args, vec![WireValue::Number { value: 5.into() }]);

        harness
            .tx
            .send(WorkerMessage::Respond {
                id: callback_id,
                outcome: Ok(WireValue::String {
                    value: "seen".into(),
                }),
            })
            .await
            .unwrap();

        match harness.rx.recv().await {
            Some(ControllerMessage::Respond { id: 9, outcome }) => {
                assert_eq!(
                    outcome.unwrap(),
                    WireValue::String {
                        value: "seen".into()
                    }
                );
            }
            other => panic!("expected final respond, got {other:?}"),
        }
    }
}
