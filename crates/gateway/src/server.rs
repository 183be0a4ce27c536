//! Axum-based HTTP server for the processor surface.

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use url::Url;

use pipeforge_core::operation::{ControlChange, Issue, OperationControls, OperationHandle};
use pipeforge_core::Error;
use pipeforge_processor::{execute_operation, Controller};

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to bind to.
    pub port: u16,
    /// Enable CORS.
    pub enable_cors: bool,
    /// Enable request tracing.
    pub enable_tracing: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            enable_cors: true,
            enable_tracing: true,
        }
    }
}

/// Shared application state.
pub struct AppState {
    /// The sandbox controller.
    pub controller: Arc<Controller>,
}

/// Gateway server.
pub struct GatewayServer {
    config: GatewayConfig,
    state: Arc<AppState>,
}

impl GatewayServer {
    /// Create a new gateway server.
    pub fn new(config: GatewayConfig, controller: Arc<Controller>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { controller }),
        }
    }

    /// Build the Axum router.
    pub fn build_router(&self) -> Router {
        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/v1/operations/execute", post(execute_handler))
            .route("/v1/modules/value", post(module_value_handler))
            .route("/v1/bundles/preload", post(preload_handler))
            .route("/v1/bundles/terminate", post(terminate_handler))
            .with_state(self.state.clone());

        if self.config.enable_cors {
            router = router.layer(CorsLayer::new().allow_origin(Any).allow_methods(Any));
        }

        if self.config.enable_tracing {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Run the server.
    pub async fn run(&self) -> std::io::Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "gateway listening");
        axum::serve(listener, self.build_router()).await
    }
}

// =============================================================================
// Request/response payloads
// =============================================================================

#[derive(Deserialize)]
struct ExecuteRequest {
    bundle_url: Url,
    module_id: String,
    export_name: String,
    #[serde(default)]
    controls: OperationControls,
}

#[derive(Serialize)]
struct ExecuteResponse {
    changes: Vec<ControlChange>,
    issues: Vec<Issue>,
}

#[derive(Deserialize)]
struct ModuleValueRequest {
    bundle_url: Url,
    module_id: String,
    export_name: String,
}

#[derive(Serialize)]
struct ModuleValueResponse {
    value: serde_json::Value,
}

#[derive(Deserialize)]
struct BundleRequest {
    url: Url,
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(StatusResponse { status: "ok" })
}

async fn execute_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExecuteRequest>,
) -> impl IntoResponse {
    let handle = OperationHandle {
        bundle_url: request.bundle_url,
        module_id: request.module_id,
        export_name: request.export_name,
    };
    let outcome = execute_operation(&state.controller, &handle, &request.controls).await;
    Json(ExecuteResponse {
        changes: outcome.changes,
        issues: outcome.issues,
    })
}

async fn module_value_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ModuleValueRequest>,
) -> Result<Json<ModuleValueResponse>, ApiError> {
    let value = state
        .controller
        .get_module_value(&request.bundle_url, &request.module_id, &request.export_name)
        .await?;
    let value = value
        .into_json()
        .map_err(|_| ApiError::not_data("export is callable; invoke it instead"))?;
    Ok(Json(ModuleValueResponse { value }))
}

async fn preload_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BundleRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.controller.preload_bundle(&request.url).await?;
    Ok(Json(StatusResponse { status: "loaded" }))
}

async fn terminate_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BundleRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.controller.terminate_bundle(&request.url).await?;
    Ok(Json(StatusResponse { status: "terminated" }))
}

// =============================================================================
// Error mapping
// =============================================================================

/// An error rendered as a JSON body with a taxonomy-derived status code.
struct ApiError {
    status: StatusCode,
    name: String,
    message: String,
}

impl ApiError {
    fn not_data(message: &str) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            name: "NotDataError".into(),
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::InvalidRequest(_) | Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Remote { name, .. }
                if name == "ScriptLoadError"
                    || name == "ModuleNotResolvedError"
                    || name == "ExportNotAvailableError" =>
            {
                StatusCode::NOT_FOUND
            }
            Error::Remote { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Timeout(_) | Error::Unresponsive(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            name: err.proxy_name().to_string(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": { "name": self.name, "message": self.message },
        });
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use pipeforge_core::config::{ProcessorConfig, SandboxSettings};
    use pipeforge_sandbox::builtins::{register_builtins, text_bundle_url};
    use pipeforge_sandbox::{StaticResolver, TaskEnvironmentFactory};
    use tower::ServiceExt;

    fn router() -> Router {
        let resolver = StaticResolver::new();
        register_builtins(&resolver);
        let factory = Arc::new(TaskEnvironmentFactory::new(Arc::new(resolver)));
        let controller = Arc::new(Controller::new(
            factory,
            ProcessorConfig::default(),
            SandboxSettings::default(),
        ));
        GatewayServer::new(GatewayConfig::default(), controller).build_router()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let response = router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn execute_runs_the_builtin_mirror_operation() {
        let request = post_json(
            "/v1/operations/execute",
            serde_json::json!({
                "bundle_url": text_bundle_url(),
                "module_id": "text",
                "export_name": "mirror",
                "controls": {
                    "values": { "text": "abc" },
                    "priorities": ["text"],
                },
            }),
        );
        let response = router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["changes"][0]["control"], "text");
        assert_eq!(body["changes"][0]["value"], "cba");
    }

    #[tokio::test]
    async fn module_value_returns_data_exports() {
        let request = post_json(
            "/v1/modules/value",
            serde_json::json!({
                "bundle_url": text_bundle_url(),
                "module_id": "text",
                "export_name": "VERSION",
            }),
        );
        let response = router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["value"], "1.2.0");
    }

    #[tokio::test]
    async fn unknown_bundle_maps_to_not_found() {
        let request = post_json(
            "/v1/bundles/preload",
            serde_json::json!({ "url": "builtin://missing" }),
        );
        let response = router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"]["name"], "ScriptLoadError");
    }

    #[tokio::test]
    async fn terminate_of_an_idle_controller_is_a_no_op() {
        let request = post_json(
            "/v1/bundles/terminate",
            serde_json::json!({ "url": text_bundle_url() }),
        );
        let response = router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "terminated");
    }
}
