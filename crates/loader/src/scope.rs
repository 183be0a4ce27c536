//! The loader surface a bundle script evaluates against.

use url::Url;

use pipeforge_core::{ExtValue, Result};

use crate::loader::{ModuleDefinition, ModuleFactory, ModuleLoader, RequireCallback};

/// Curried view of the loader for one bundle: every definition and lookup a
/// script performs is keyed under the bundle URL it was fetched from.
pub struct ScriptScope<'a> {
    loader: &'a ModuleLoader,
    bundle: Url,
}

impl<'a> ScriptScope<'a> {
    pub fn new(loader: &'a ModuleLoader, bundle: Url) -> Self {
        Self { loader, bundle }
    }

    pub fn bundle(&self) -> &Url {
        &self.bundle
    }

    /// Register a module with a factory and an optional dependency list.
    pub fn define(
        &mut self,
        id: Option<&str>,
        deps: Option<Vec<String>>,
        factory: ModuleFactory,
    ) -> Result<()> {
        self.loader
            .define(&self.bundle, id, ModuleDefinition::Factory { deps, factory })
    }

    /// Register a module as a plain value; it resolves immediately.
    pub fn define_value(&mut self, id: Option<&str>, value: ExtValue) -> Result<()> {
        self.loader
            .define(&self.bundle, id, ModuleDefinition::Value(value))
    }

    /// Synchronous require of an already-resolved module.
    pub fn require(&self, id: &str) -> Result<ExtValue> {
        self.loader.require(&self.bundle, id)
    }

    /// Asynchronous require; `callback` fires once all ids have resolved.
    pub fn require_async(&mut self, ids: &[String], callback: RequireCallback) -> Result<()> {
        self.loader.require_async(&self.bundle, ids, callback)
    }
}
