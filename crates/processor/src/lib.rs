#![deny(unused)]
//! The privileged controller for Pipeforge sandbox environments.
//!
//! This crate is the only surface application code sees: a [`Controller`]
//! managing one isolated execution environment (lazy boot, configure
//! handshake, liveness pings, teardown with pending-request rejection,
//! request multiplexing by id), and the operation [`executor`] that turns
//! export invocations into store-safe outcomes.

pub mod controller;
pub mod executor;

pub use controller::Controller;
pub use executor::{execute_operation, OperationOutcome};
