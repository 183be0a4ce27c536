#![deny(unused)]
//! Pipeforge - sandboxed extension runtime for blueprint pipelines
//!
//! Boots the sandbox controller over the built-in bundles and serves the
//! processor surface over HTTP for the editor frontend.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pipeforge_core::config::AppConfig;
use pipeforge_gateway::{GatewayConfig, GatewayServer};
use pipeforge_processor::Controller;
use pipeforge_sandbox::builtins::{register_builtins, text_bundle_url};
use pipeforge_sandbox::{StaticResolver, TaskEnvironmentFactory};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    configure_tracing();

    tracing::info!("Starting Pipeforge v{}", env!("CARGO_PKG_VERSION"));

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(%err, "no usable config files; falling back to defaults");
            AppConfig::default()
        }
    };

    // =========================================================================
    // Bundle registry
    // =========================================================================
    let resolver = StaticResolver::new();
    register_builtins(&resolver);
    tracing::info!(bundles = resolver.len(), "bundle registry initialized");

    // =========================================================================
    // Sandbox controller
    // =========================================================================
    let factory = Arc::new(TaskEnvironmentFactory::new(Arc::new(resolver)));
    let controller = Arc::new(Controller::new(
        factory,
        config.processor.clone(),
        config.sandbox.clone(),
    ));

    // Warm the environment so the first editor interaction does not pay the
    // boot cost.
    if let Err(err) = controller.preload_bundle(&text_bundle_url()).await {
        tracing::warn!(%err, "builtin bundle preload failed");
    }

    // =========================================================================
    // Gateway
    // =========================================================================
    let gateway_config = GatewayConfig {
        host: config.server.host.clone(),
        port: config.server.port,
        enable_cors: true,
        enable_tracing: true,
    };
    let server = GatewayServer::new(gateway_config, controller.clone());

    println!();
    println!("  Pipeforge v{}", env!("CARGO_PKG_VERSION"));
    println!("  Endpoints:");
    println!("    GET  /health                 - Health check");
    println!("    POST /v1/operations/execute  - Run an operation export");
    println!("    POST /v1/modules/value       - Read a module export");
    println!("    POST /v1/bundles/preload     - Load a bundle ahead of use");
    println!("    POST /v1/bundles/terminate   - Discard a bundle's modules");
    println!("  Server: http://{}:{}", config.server.host, config.server.port);
    println!();

    server.run().await?;

    controller.shutdown().await;
    Ok(())
}

/// Stdout tracing with a RUST_LOG-overridable filter.
fn configure_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,pipeforge=debug".into()),
    );
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
