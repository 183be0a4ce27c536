//! Bundle script resolution.
//!
//! `importScripts` turns a bundle URL into an executable script through the
//! [`ScriptResolver`] seam. The in-tree implementation is a registry of
//! native bundles compiled into the host; fetching and interpreting remote
//! bundle code plugs in behind the same trait.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use url::Url;

use pipeforge_core::{Error, Result};
use pipeforge_loader::ScriptScope;

/// A bundle script: evaluated once per worker against a loader scope keyed by
/// the bundle's URL. Evaluation registers the bundle's module definitions;
/// an evaluation error fails the whole import.
pub trait Script: Send + Sync {
    fn evaluate(&self, scope: &mut ScriptScope<'_>) -> Result<()>;
}

/// A script backed by a closure. The closure runs once per worker import and
/// must rebuild its factories each time.
pub struct FnScript {
    eval: Box<dyn Fn(&mut ScriptScope<'_>) -> Result<()> + Send + Sync>,
}

impl FnScript {
    pub fn new(eval: impl Fn(&mut ScriptScope<'_>) -> Result<()> + Send + Sync + 'static) -> Self {
        Self {
            eval: Box::new(eval),
        }
    }
}

impl Script for FnScript {
    fn evaluate(&self, scope: &mut ScriptScope<'_>) -> Result<()> {
        (self.eval)(scope)
    }
}

/// Resolves a bundle URL to its script.
#[async_trait]
pub trait ScriptResolver: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<Arc<dyn Script>>;
}

/// Registry of native bundles keyed by URL.
#[derive(Default)]
pub struct StaticResolver {
    bundles: DashMap<Url, Arc<dyn Script>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bundle under its URL, replacing any previous registration.
    pub fn register(&self, url: Url, script: Arc<dyn Script>) {
        self.bundles.insert(url, script);
    }

    pub fn with_bundle(self, url: Url, script: Arc<dyn Script>) -> Self {
        self.register(url, script);
        self
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }
}

#[async_trait]
impl ScriptResolver for StaticResolver {
    async fn fetch(&self, url: &Url) -> Result<Arc<dyn Script>> {
        self.bundles
            .get(url)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::script_load(format!("no bundle registered for '{url}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeforge_core::ExtValue;

    #[tokio::test]
    async fn fetch_returns_registered_bundle() {
        let url = Url::parse("builtin://sample").unwrap();
        let resolver = StaticResolver::new().with_bundle(
            url.clone(),
            Arc::new(FnScript::new(|scope| {
                scope.define_value(Some("mod"), ExtValue::int(7))
            })),
        );
        assert!(resolver.fetch(&url).await.is_ok());
    }

    #[tokio::test]
    async fn fetch_of_unknown_bundle_fails() {
        let resolver = StaticResolver::new();
        let url = Url::parse("builtin://missing").unwrap();
        let err = resolver.fetch(&url).await.err().unwrap();
        assert!(matches!(err, Error::ScriptLoad(_)));
    }
}
