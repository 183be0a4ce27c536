#![deny(unused)]
//! HTTP surface for Pipeforge.
//!
//! A thin axum layer over the processor: the editor frontend reaches the
//! controller's four operations and the operation executor through JSON
//! endpoints. No semantics live here: handlers translate payloads and map
//! the error taxonomy onto status codes.

pub mod server;

pub use server::{AppState, GatewayConfig, GatewayServer};
