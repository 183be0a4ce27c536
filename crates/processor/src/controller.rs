//! Environment lifecycle, request multiplexing, and liveness.
//!
//! The controller owns the pending-request map and the environment state
//! machine (Uninitialized → Initializing → Initialized, any state →
//! Uninitialized on fatal error). Every outbound message carries a unique id;
//! responses are correlated by id alone, so they may arrive in any order. A
//! response nobody is waiting for means the two sides have desynchronized and
//! is fatal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use url::Url;

use pipeforge_core::config::{ProcessorConfig, SandboxSettings};
use pipeforge_core::{
    hydrate, marshal, ControllerMessage, ControllerRequest, Error, ErrorProxy, ExtValue,
    FunctionRegistry, RemoteCaller, RemoteOutcome, Result, WireValue, WorkerMessage,
    WorkerRequest, MAX_REQUEST_ID,
};
use pipeforge_sandbox::{Environment, EnvironmentFactory};

/// The privileged side of one sandbox environment.
///
/// Cheap to clone via `Arc` internally; one instance manages exactly one
/// environment, and several controllers may coexist in a process.
pub struct Controller {
    shared: Arc<ControllerShared>,
}

struct ControllerShared {
    factory: Arc<dyn EnvironmentFactory>,
    config: ProcessorConfig,
    sandbox: SandboxSettings,
    /// Controller-side registry for functions handed to the sandbox.
    registry: Arc<FunctionRegistry>,
    state: tokio::sync::Mutex<EnvSlot>,
    pending: Mutex<PendingRequests>,
    ping: Mutex<PingState>,
}

struct PendingRequests {
    next_id: u64,
    slots: HashMap<u64, oneshot::Sender<Result<WireValue>>>,
}

#[derive(Default)]
struct PingState {
    /// Id of the ping whose pong has not arrived yet.
    outstanding: Option<u64>,
    /// Set when a liveness tick saw the environment still initializing; a
    /// second consecutive observation means the boot has stalled.
    stalled_init: bool,
}

enum EnvSlot {
    Uninitialized,
    Initializing {
        link: EnvLink,
        queue: Vec<WorkerMessage>,
    },
    Initialized {
        link: EnvLink,
    },
}

struct EnvLink {
    tx: mpsc::Sender<WorkerMessage>,
    /// Keeps the relay alive; dropping it releases the whole environment.
    environment: Environment,
    listener: JoinHandle<()>,
    liveness: JoinHandle<()>,
}

impl Controller {
    pub fn new(
        factory: Arc<dyn EnvironmentFactory>,
        config: ProcessorConfig,
        sandbox: SandboxSettings,
    ) -> Self {
        Self {
            shared: Arc::new(ControllerShared {
                factory,
                config,
                sandbox,
                registry: Arc::new(FunctionRegistry::new()),
                state: tokio::sync::Mutex::new(EnvSlot::Uninitialized),
                pending: Mutex::new(PendingRequests {
                    next_id: 0,
                    slots: HashMap::new(),
                }),
                ping: Mutex::new(PingState::default()),
            }),
        }
    }

    /// Read a named export of a module without invoking it.
    pub async fn get_module_value(
        &self,
        bundle_url: &Url,
        module_id: &str,
        export_name: &str,
    ) -> Result<ExtValue> {
        let wire = post(
            &self.shared,
            WorkerRequest::GetModuleExport {
                bundle_url: bundle_url.clone(),
                module_id: module_id.to_string(),
                export_name: export_name.to_string(),
            },
            false,
        )
        .await?;
        Ok(hydrate_response(&self.shared, wire))
    }

    /// Invoke a named export with the default timeout.
    pub async fn call_module_function(
        &self,
        bundle_url: &Url,
        module_id: &str,
        export_name: &str,
        args: Vec<ExtValue>,
    ) -> Result<ExtValue> {
        self.call_inner(bundle_url, module_id, export_name, args, None)
            .await
    }

    /// Invoke a named export with an explicit per-call timeout.
    pub async fn call_module_function_with_timeout(
        &self,
        bundle_url: &Url,
        module_id: &str,
        export_name: &str,
        args: Vec<ExtValue>,
        timeout: Duration,
    ) -> Result<ExtValue> {
        self.call_inner(
            bundle_url,
            module_id,
            export_name,
            args,
            Some(timeout.as_millis() as u64),
        )
        .await
    }

    async fn call_inner(
        &self,
        bundle_url: &Url,
        module_id: &str,
        export_name: &str,
        args: Vec<ExtValue>,
        timeout_ms: Option<u64>,
    ) -> Result<ExtValue> {
        let args = args
            .into_iter()
            .map(|arg| marshal(arg, &self.shared.registry))
            .collect();
        let wire = post(
            &self.shared,
            WorkerRequest::CallModuleExport {
                bundle_url: bundle_url.clone(),
                module_id: module_id.to_string(),
                export_name: export_name.to_string(),
                args,
                timeout_ms,
            },
            false,
        )
        .await?;
        Ok(hydrate_response(&self.shared, wire))
    }

    /// Force a bundle's scripts to load ahead of first real use.
    pub async fn preload_bundle(&self, url: &Url) -> Result<()> {
        post(
            &self.shared,
            WorkerRequest::ImportScripts {
                urls: vec![url.clone()],
            },
            false,
        )
        .await?;
        Ok(())
    }

    /// Discard a bundle's module caches without tearing the environment down.
    ///
    /// The relay recycles the worker underneath; requests in flight at that
    /// moment are rejected with a termination error, and the recycled worker
    /// transparently re-enters the configure handshake.
    pub async fn terminate_bundle(&self, url: &Url) -> Result<()> {
        let sent = {
            let mut state = self.shared.state.lock().await;
            let slot = std::mem::replace(&mut *state, EnvSlot::Uninitialized);
            let link = match slot {
                EnvSlot::Uninitialized => return Ok(()),
                EnvSlot::Initializing { link, .. } => link,
                EnvSlot::Initialized { link } => link,
            };
            let sent = link.tx.send(WorkerMessage::Terminate).await.is_ok();
            // Queued messages are dropped along with their pending entries;
            // the fresh worker starts from a clean module cache. Rejection
            // happens under the state lock so the recycled worker's handshake
            // cannot interleave and lose its own pending entry.
            *state = EnvSlot::Initializing {
                link,
                queue: Vec::new(),
            };
            reject_all_pending(
                &self.shared,
                &Error::terminated(format!("bundle '{url}' terminated")),
            );
            clear_ping(&self.shared);
            sent
        };

        if !sent {
            teardown(
                &self.shared,
                Error::environment("environment channel closed during bundle termination"),
            )
            .await;
            return Err(Error::environment(
                "environment channel closed during bundle termination",
            ));
        }

        tracing::info!(bundle = %url, "bundle terminated; worker recycling");
        Ok(())
    }

    /// Tear the environment down explicitly. Pending requests are rejected;
    /// the next request boots a fresh environment.
    pub async fn shutdown(&self) {
        teardown(&self.shared, Error::terminated("controller shut down")).await;
    }

    /// Whether the controller currently holds no environment (testing and
    /// diagnostics).
    pub async fn is_uninitialized(&self) -> bool {
        matches!(&*self.shared.state.lock().await, EnvSlot::Uninitialized)
    }
}

/// Hydrate a response value, binding function proxies back to this
/// controller's boundary.
fn hydrate_response(shared: &Arc<ControllerShared>, wire: WireValue) -> ExtValue {
    let caller: Arc<dyn RemoteCaller> = Arc::new(ControllerCaller {
        shared: Arc::clone(shared),
    });
    hydrate(wire, &shared.registry, &caller)
}

/// Issue one request: allocate an id, store the pending entry, dispatch (or
/// queue), await the correlated response.
async fn post(
    shared: &Arc<ControllerShared>,
    request: WorkerRequest,
    force: bool,
) -> Result<WireValue> {
    let (id, rx) = register_pending(shared)?;
    if let Err(err) = dispatch(shared, WorkerMessage::Request { id, request }, force).await {
        remove_pending(shared, id);
        return Err(err);
    }
    match rx.await {
        Ok(outcome) => outcome,
        Err(_) => Err(Error::environment("environment torn down before response")),
    }
}

fn register_pending(
    shared: &Arc<ControllerShared>,
) -> Result<(u64, oneshot::Receiver<Result<WireValue>>)> {
    let mut pending = lock_pending(shared)?;
    let id = next_request_id(&mut pending);
    let (tx, rx) = oneshot::channel();
    pending.slots.insert(id, tx);
    Ok((id, rx))
}

fn remove_pending(shared: &Arc<ControllerShared>, id: u64) {
    if let Ok(mut pending) = shared.pending.lock() {
        pending.slots.remove(&id);
    }
}

/// Allocate the next controller-side request id, wrapping at the JSON-safe
/// boundary and never reusing an id that still has a pending entry.
fn next_request_id(pending: &mut PendingRequests) -> u64 {
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

fn lock_pending(shared: &ControllerShared) -> Result<MutexGuard<'_, PendingRequests>> {
    shared
        .pending
        .lock()
        .map_err(|_| Error::internal("pending request map lock poisoned"))
}

/// Route a message to the environment according to the state machine. The
/// `force` flag lets exactly one message, the configure handshake, through
/// while still initializing.
async fn dispatch(
    shared: &Arc<ControllerShared>,
    message: WorkerMessage,
    force: bool,
) -> Result<()> {
    let mut state = shared.state.lock().await;
    // A teardown or bundle termination may have drained this request's
    // pending entry between registration and dispatch; the caller already
    // holds the rejection, so the message must not reach any environment.
    if let WorkerMessage::Request { id, .. } = &message {
        if !lock_pending(shared)?.slots.contains_key(id) {
            return Err(Error::terminated(
                "request rejected before dispatch",
            ));
        }
    }
    match &mut *state {
        EnvSlot::Uninitialized => {
            let link = boot(shared).await?;
            *state = EnvSlot::Initializing {
                link,
                queue: vec![message],
            };
            Ok(())
        }
        EnvSlot::Initializing { link, queue } => {
            if force {
                link.tx
                    .send(message)
                    .await
                    .map_err(|_| Error::environment("environment channel closed"))
            } else {
                queue.push(message);
                Ok(())
            }
        }
        EnvSlot::Initialized { link } => link
            .tx
            .send(message)
            .await
            .map_err(|_| Error::environment("environment channel closed")),
    }
}

/// Create the environment and start its listener and liveness tasks.
fn boot<'a>(shared: &'a Arc<ControllerShared>) -> BoxFuture<'a, Result<EnvLink>> {
    Box::pin(async move {
        tracing::info!("initializing sandbox environment");
        let mut environment = shared.factory.create(&shared.sandbox).await?;
        let tx = environment.sender();
        let rx = environment
            .take_receiver()
            .ok_or_else(|| Error::internal("environment receiver already taken"))?;
        let listener = tokio::spawn(listen(Arc::clone(shared), rx));
        let liveness = tokio::spawn(liveness(Arc::clone(shared)));
        Ok(EnvLink {
            tx,
            environment,
            listener,
            liveness,
        })
    })
}

/// The message listener: resolves responses by id, spawns callback handlers,
/// and reacts to readiness and failure signals.
async fn listen(shared: Arc<ControllerShared>, mut rx: mpsc::Receiver<ControllerMessage>) {
    while let Some(message) = rx.recv().await {
        match message {
            ControllerMessage::Initialized => {
                tokio::spawn(handshake(Arc::clone(&shared)));
            }
            ControllerMessage::Respond { id, outcome } => {
                let slot = match lock_pending(&shared) {
                    Ok(mut pending) => Ok(pending.slots.remove(&id)),
                    Err(err) => Err(err),
                };
                let slot = match slot {
                    Ok(slot) => slot,
                    Err(err) => {
                        teardown(&shared, err).await;
                        return;
                    }
                };
                match slot {
                    Some(tx) => {
                        pong_received(&shared, id);
                        let _ = tx.send(outcome.map_err(Error::from));
                    }
                    None => {
                        // Never ignore this: an unmatched id means the two
                        // sides have desynchronized.
                        let err =
                            Error::protocol(format!("response with unknown request id {id}"));
                        tracing::error!(%err, "protocol violation; tearing down");
                        teardown(&shared, err).await;
                        return;
                    }
                }
            }
            ControllerMessage::Request { id, request } => {
                tokio::spawn(handle_callback(Arc::clone(&shared), id, request));
            }
            ControllerMessage::Error { error } => {
                teardown(&shared, Error::from(error)).await;
                return;
            }
        }
    }
    teardown(&shared, Error::environment("environment channel closed")).await;
}

/// The configure handshake, entered on every `initialized` signal: the
/// first boot and every worker recycle alike.
async fn handshake(shared: Arc<ControllerShared>) {
    {
        let mut state = shared.state.lock().await;
        match std::mem::replace(&mut *state, EnvSlot::Uninitialized) {
            // Torn down in the meantime; the signal is stale.
            EnvSlot::Uninitialized => return,
            EnvSlot::Initializing { link, queue } => {
                *state = EnvSlot::Initializing { link, queue };
            }
            // A recycled worker announced itself: drop back to Initializing
            // so everything new queues behind the fresh handshake.
            EnvSlot::Initialized { link } => {
                *state = EnvSlot::Initializing {
                    link,
                    queue: Vec::new(),
                };
            }
        }
    }
    if let Ok(mut ping) = shared.ping.lock() {
        ping.stalled_init = false;
    }

    tracing::debug!("configure handshake started");
    let settings = shared.config.limits();
    match post(&shared, WorkerRequest::Configure { settings }, true).await {
        Ok(_) => promote(&shared).await,
        // A bundle termination rejected the in-flight configure; the recycled
        // worker's own handshake owns the environment now.
        Err(Error::Terminated(_)) => {}
        Err(err) => {
            teardown(
                &shared,
                Error::environment(format!("configure handshake failed: {err}")),
            )
            .await;
        }
    }
}

/// Flush the queue and enter Initialized.
async fn promote(shared: &Arc<ControllerShared>) {
    let mut state = shared.state.lock().await;
    match std::mem::replace(&mut *state, EnvSlot::Uninitialized) {
        EnvSlot::Initializing { link, queue } => {
            let mut flushed = true;
            for message in queue {
                if link.tx.send(message).await.is_err() {
                    flushed = false;
                    break;
                }
            }
            *state = EnvSlot::Initialized { link };
            drop(state);
            if flushed {
                tracing::info!("sandbox environment initialized");
            } else {
                teardown(
                    shared,
                    Error::environment("environment channel closed while flushing queue"),
                )
                .await;
            }
        }
        other => {
            // Torn down (or re-handshaken) while configuring; keep whatever
            // state the later actor established.
            *state = other;
        }
    }
}

/// Handle a worker-originated function-pointer call against the controller's
/// registry and respond under the worker's id.
async fn handle_callback(shared: Arc<ControllerShared>, id: u64, request: ControllerRequest) {
    let ControllerRequest::CallFunctionPointer { pointer, args } = request;
    let outcome: RemoteOutcome = run_callback(&shared, pointer, args)
        .await
        .map_err(ErrorProxy::from);

    let tx = {
        match &*shared.state.lock().await {
            EnvSlot::Initialized { link } | EnvSlot::Initializing { link, .. } => {
                Some(link.tx.clone())
            }
            EnvSlot::Uninitialized => None,
        }
    };
    if let Some(tx) = tx {
        let _ = tx.send(WorkerMessage::Respond { id, outcome }).await;
    }
}

async fn run_callback(
    shared: &Arc<ControllerShared>,
    pointer: String,
    args: Vec<WireValue>,
) -> Result<WireValue> {
    let function = shared
        .registry
        .get(&pointer)
        .ok_or(Error::UnknownFunctionPointer(pointer))?;
    if args.len() != function.arity() {
        return Err(Error::ArityMismatch {
            expected: function.arity(),
            actual: args.len(),
        });
    }
    let caller: Arc<dyn RemoteCaller> = Arc::new(ControllerCaller {
        shared: Arc::clone(shared),
    });
    let args = args
        .into_iter()
        .map(|arg| hydrate(arg, &shared.registry, &caller))
        .collect();
    let value = function.call(args).await.map_err(Error::from)?;
    Ok(marshal(value, &shared.registry))
}

/// The liveness loop: detects stalled initialization and missing pongs.
/// Active only while requests are pending; a quiet environment is never
/// pinged.
async fn liveness(shared: Arc<ControllerShared>) {
    let mut interval = tokio::time::interval(shared.config.ping_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        interval.tick().await;

        let initializing = matches!(&*shared.state.lock().await, EnvSlot::Initializing { .. });
        if initializing {
            let stalled = match shared.ping.lock() {
                Ok(mut ping) => {
                    let seen_before = ping.stalled_init;
                    ping.stalled_init = true;
                    seen_before
                }
                Err(_) => false,
            };
            if stalled {
                teardown(
                    &shared,
                    Error::unresponsive("initialization did not complete within the ping interval"),
                )
                .await;
                return;
            }
            continue;
        }

        let (pong_missing, user_pending, outstanding) = {
            let outstanding = shared.ping.lock().ok().and_then(|ping| ping.outstanding);
            match shared.pending.lock() {
                Ok(pending) => {
                    let pong_missing = outstanding
                        .map(|id| pending.slots.contains_key(&id))
                        .unwrap_or(false);
                    let user_pending = pending
                        .slots
                        .keys()
                        .any(|id| Some(*id) != outstanding);
                    (pong_missing, user_pending, outstanding)
                }
                Err(_) => return,
            }
        };

        if pong_missing && user_pending {
            teardown(
                &shared,
                Error::unresponsive("no pong received within the ping interval"),
            )
            .await;
            return;
        }

        if user_pending && outstanding.is_none() {
            let (id, rx) = match register_pending(&shared) {
                Ok(entry) => entry,
                Err(_) => return,
            };
            if let Ok(mut ping) = shared.ping.lock() {
                ping.outstanding = Some(id);
            }
            tracing::debug!(id, "liveness ping sent");
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                if dispatch(
                    &shared,
                    WorkerMessage::Request {
                        id,
                        request: WorkerRequest::Ping,
                    },
                    false,
                )
                .await
                .is_err()
                {
                    remove_pending(&shared, id);
                }
                let _ = rx.await;
            });
        }
    }
}

fn pong_received(shared: &Arc<ControllerShared>, id: u64) {
    if let Ok(mut ping) = shared.ping.lock() {
        if ping.outstanding == Some(id) {
            ping.outstanding = None;
        }
    }
}

fn clear_ping(shared: &Arc<ControllerShared>) {
    if let Ok(mut ping) = shared.ping.lock() {
        *ping = PingState::default();
    }
}

fn reject_all_pending(shared: &Arc<ControllerShared>, cause: &Error) {
    let slots = match shared.pending.lock() {
        Ok(mut pending) => std::mem::take(&mut pending.slots),
        Err(_) => return,
    };
    for (_, tx) in slots {
        let _ = tx.send(Err(cause.clone()));
    }
}

/// Release the environment, reject all pending work, reset to Uninitialized.
/// Idempotent: a second call finds nothing to release.
async fn teardown(shared: &Arc<ControllerShared>, cause: Error) {
    let link = {
        let mut state = shared.state.lock().await;
        let link = match std::mem::replace(&mut *state, EnvSlot::Uninitialized) {
            EnvSlot::Uninitialized => return,
            EnvSlot::Initializing { link, .. } => link,
            EnvSlot::Initialized { link } => link,
        };
        // Reject under the state lock: a request racing this teardown either
        // lands in the drained map before the reset (rejected here) or boots
        // a fresh environment after it; never both, never neither.
        reject_all_pending(shared, &cause);
        clear_ping(shared);
        link
    };
    tracing::warn!(%cause, "tearing down sandbox environment");
    link.liveness.abort();
    // Dropping the environment aborts the relay, which releases the worker.
    drop(link.environment);
    // May be this very task; abort last, with no awaits behind it.
    link.listener.abort();
}

/// Routes hydrated function-pointer stubs from responses back through the
/// regular request path.
struct ControllerCaller {
    shared: Arc<ControllerShared>,
}

impl RemoteCaller for ControllerCaller {
    fn call_function_pointer(
        &self,
        pointer: String,
        args: Vec<WireValue>,
    ) -> BoxFuture<'static, RemoteOutcome> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            post(
                &shared,
                WorkerRequest::CallFunctionPointer { pointer, args },
                false,
            )
            .await
            .map_err(ErrorProxy::from)
        })
    }
}
