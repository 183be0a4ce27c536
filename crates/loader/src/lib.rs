#![deny(unused)]
//! In-sandbox module loader for Pipeforge.
//!
//! A minimal AMD-style define/require runtime: bundle scripts declare modules
//! with optional dependency lists, dependencies resolve asynchronously (a
//! module may be required before the script defining it has run), and factory
//! functions fire once every declared dependency is available. No host module
//! system is involved: this is the only resolution mechanism extension
//! bundles see.

pub mod loader;
pub mod scope;

pub use loader::{
    ModuleDefinition, ModuleFactory, ModuleKey, ModuleLoader, RequireCallback, DEFAULT_MODULE_ID,
};
pub use scope::ScriptScope;
