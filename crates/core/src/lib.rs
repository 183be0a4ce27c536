#![deny(unused)]
//! Core types, protocol definitions, and error types for Pipeforge.
//!
//! This crate provides the foundational building blocks shared across the
//! sandbox runtime layers: the rich value domain extensions operate on, the
//! closed message unions crossing the isolation boundary, the marshal/hydrate
//! layer that turns functions and errors into proxies, and the operation
//! contract exchanged with the document/store layer.

pub mod config;
pub mod error;
pub mod marshal;
pub mod operation;
pub mod proto;
pub mod value;

pub use error::{Error, ErrorProxy, Result};
pub use marshal::{hydrate, marshal, FunctionRegistry, RemoteCaller};
pub use proto::{
    ControllerMessage, ControllerRequest, RemoteOutcome, SandboxLimits, WireValue, WorkerMessage,
    WorkerRequest, MAX_REQUEST_ID,
};
pub use value::{ExtFunction, ExtValue};
