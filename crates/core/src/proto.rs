//! Message envelopes crossing the isolation boundary.
//!
//! Both directions are closed tagged unions: an envelope with an unknown
//! `type` (or a wire value with an unknown `kind`) is a deserialization
//! error, never silently ignored. The boundary behaves like a
//! structured-clone channel, so every type here is pure serializable data.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ErrorProxy;

/// Largest request id before the counter wraps: the largest integer exactly
/// representable as a JSON number (2^53 - 1). Ids stay losslessly
/// representable on any side of the boundary.
pub const MAX_REQUEST_ID: u64 = 9_007_199_254_740_991;

/// Outcome of a request/response cycle: a marshaled success value or a
/// marshaled error, exactly one of the two.
pub type RemoteOutcome = std::result::Result<WireValue, ErrorProxy>;

/// The marshaled form of an [`crate::ExtValue`]: plain data plus proxies.
///
/// Functions cross as `{ kind: "function", pointer, arity }` and errors as
/// `{ kind: "error", name, message }`; everything else passes through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WireValue {
    Null,
    Bool { value: bool },
    Number { value: serde_json::Number },
    String { value: String },
    Array { items: Vec<WireValue> },
    Object { entries: std::collections::BTreeMap<String, WireValue> },
    Function { pointer: String, arity: usize },
    Error { name: String, message: String },
}

/// Sandbox-side limits delivered by the `configure` handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxLimits {
    /// Default bound on a single export invocation, applied when a call
    /// request does not carry its own timeout.
    pub default_timeout_ms: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
        }
    }
}

/// Request payloads travelling controller → worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WorkerRequest {
    /// Initialization handshake; the only request allowed through while the
    /// environment is still initializing.
    Configure { settings: SandboxLimits },
    /// Liveness probe; the respond message is the pong.
    Ping,
    /// Fetch and evaluate the given bundle scripts in the sandbox scope.
    ImportScripts { urls: Vec<Url> },
    /// Resolve a module and read one of its named exports.
    GetModuleExport {
        bundle_url: Url,
        module_id: String,
        export_name: String,
    },
    /// Resolve a module and invoke one of its named exports.
    CallModuleExport {
        bundle_url: Url,
        module_id: String,
        export_name: String,
        args: Vec<WireValue>,
        timeout_ms: Option<u64>,
    },
    /// Invoke a live function previously registered under a pointer.
    CallFunctionPointer { pointer: String, args: Vec<WireValue> },
}

/// Envelope travelling controller → worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WorkerMessage {
    /// A request stamped with the controller-side id it responds under.
    Request { id: u64, request: WorkerRequest },
    /// A response to a worker-originated request.
    Respond { id: u64, outcome: RemoteOutcome },
    /// Environment termination. Intercepted by the relay; the worker never
    /// sees it (the variant exists so the worker's dispatch is exhaustive).
    Terminate,
}

/// Request payloads travelling worker → controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ControllerRequest {
    /// Invoke a live function registered on the controller side.
    CallFunctionPointer { pointer: String, args: Vec<WireValue> },
}

/// Envelope travelling worker → controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ControllerMessage {
    /// The worker signals readiness; triggers the configure handshake.
    Initialized,
    /// A request stamped with the worker-side id it responds under.
    Request { id: u64, request: ControllerRequest },
    /// A response to a controller-originated request.
    Respond { id: u64, outcome: RemoteOutcome },
    /// An uncaught worker-level failure, surfaced by the relay.
    Error { error: ErrorProxy },
}
