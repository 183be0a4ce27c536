#![deny(unused)]
//! Sandbox execution plane for Pipeforge.
//!
//! This crate hosts everything that lives on the far side of the isolation
//! boundary, plus the machinery that erects the boundary itself:
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │  Controller (pipeforge_processor)          │
//! │    ↓ WorkerMessage  /  ↑ ControllerMessage │
//! ├────────────────────────────────────────────┤
//! │  Bridge Relay (owns the worker task)       │
//! │    forwards both ways, intercepts          │
//! │    terminate, reports worker failures      │
//! ├────────────────────────────────────────────┤
//! │  Worker Runtime (isolated task)            │
//! │    module loader · function registry ·     │
//! │    marshal/hydrate · script evaluation     │
//! └────────────────────────────────────────────┘
//! ```
//!
//! The boundary is message passing over bounded channels: no shared memory,
//! no synchronous cross-boundary call. One environment per controller;
//! multiple environments may coexist in one process.

pub mod builtins;
pub mod environment;
pub mod resolver;

mod relay;
mod worker;

pub use environment::{Environment, EnvironmentFactory, TaskEnvironmentFactory};
pub use resolver::{FnScript, Script, ScriptResolver, StaticResolver};
