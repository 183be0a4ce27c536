//! define/require resolution over asynchronously arriving definitions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use url::Url;

use pipeforge_core::{Error, ErrorProxy, ExtFunction, ExtValue, Result};

/// The reserved id an anonymous `define` registers under. It cannot be used
/// explicitly.
pub const DEFAULT_MODULE_ID: &str = "default";

/// Dependency list used when a factory declares none.
const DEFAULT_DEPS: [&str; 3] = ["require", "exports", "module"];

/// Composite module key: the same module id may exist in several bundles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleKey {
    pub bundle: Url,
    pub id: String,
}

impl std::fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.bundle, self.id)
    }
}

/// A module factory: invoked with its resolved dependencies as positional
/// slots once all of them are available. The `exports` slot may be mutated in
/// place; see [`ModuleLoader::define`].
pub type ModuleFactory =
    Box<dyn FnOnce(&mut [ExtValue]) -> std::result::Result<ExtValue, ErrorProxy> + Send>;

/// Callback of the async require form, fired once with all requested values.
pub type RequireCallback = Box<dyn FnOnce(Vec<ExtValue>) -> Result<()> + Send>;

/// What `define` registers: a plain value (resolves immediately) or a factory
/// with a dependency list.
pub enum ModuleDefinition {
    Value(ExtValue),
    Factory {
        /// `None` means the default list `["require", "exports", "module"]`.
        deps: Option<Vec<String>>,
        factory: ModuleFactory,
    },
}

type Waiter = Box<dyn FnOnce(ExtValue) -> Result<()> + Send>;

#[derive(Default)]
struct LoaderInner {
    resolved: HashMap<ModuleKey, ExtValue>,
    defined: HashSet<ModuleKey>,
    waiters: HashMap<ModuleKey, Vec<Waiter>>,
}

/// The loader itself. Clones share state; lifetime is the environment's,
/// so modules are never unregistered individually.
#[derive(Clone, Default)]
pub struct ModuleLoader {
    inner: Arc<Mutex<LoaderInner>>,
}

/// Shared progress of one dependency gather (a define's deps or an async
/// require).
struct Gather {
    slots: Vec<Option<ExtValue>>,
    remaining: usize,
    on_ready: Option<RequireCallback>,
}

impl Gather {
    /// Fill one slot; if it was the last, run the callback outside the lock.
    fn fill(state: &Arc<Mutex<Gather>>, index: usize, value: ExtValue) -> Result<()> {
        let ready = {
            let mut gather = lock(state)?;
            gather.slots[index] = Some(value);
            gather.remaining -= 1;
            if gather.remaining == 0 {
                let slots = std::mem::take(&mut gather.slots);
                gather.on_ready.take().map(|cb| (cb, slots))
            } else {
                None
            }
        };
        if let Some((on_ready, slots)) = ready {
            on_ready(collect_slots(slots)?)?;
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| Error::internal("module loader lock poisoned"))
}

fn collect_slots(slots: Vec<Option<ExtValue>>) -> Result<Vec<ExtValue>> {
    slots
        .into_iter()
        .map(|slot| slot.ok_or_else(|| Error::internal("dependency slot left unfilled")))
        .collect()
}

impl ModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module definition under `bundle`.
    ///
    /// `id` defaults to the reserved [`DEFAULT_MODULE_ID`], which cannot be
    /// passed explicitly. Redefining an id that already has a definition is a
    /// definition conflict. A factory's dependencies resolve in unspecified
    /// order; once all are available the factory runs with them as positional
    /// slots. If `exports` is among the declared deps, the module's value is
    /// that (possibly mutated) slot, otherwise the factory's return value.
    pub fn define(
        &self,
        bundle: &Url,
        id: Option<&str>,
        definition: ModuleDefinition,
    ) -> Result<()> {
        if id == Some(DEFAULT_MODULE_ID) {
            return Err(Error::definition_conflict(format!(
                "the id '{DEFAULT_MODULE_ID}' is reserved for anonymous definitions"
            )));
        }
        let key = ModuleKey {
            bundle: bundle.clone(),
            id: id.unwrap_or(DEFAULT_MODULE_ID).to_string(),
        };

        {
            let mut inner = lock(&self.inner)?;
            if !inner.defined.insert(key.clone()) {
                return Err(Error::definition_conflict(format!(
                    "module '{key}' is already defined"
                )));
            }
        }

        match definition {
            ModuleDefinition::Value(value) => self.resolve(&key, value),
            ModuleDefinition::Factory { deps, factory } => {
                let deps = deps.unwrap_or_else(|| {
                    DEFAULT_DEPS.iter().map(|dep| dep.to_string()).collect()
                });
                self.run_factory_when_ready(key, deps, factory)
            }
        }
    }

    /// Synchronous require: returns the already-resolved module value. Never
    /// triggers loading.
    pub fn require(&self, bundle: &Url, id: &str) -> Result<ExtValue> {
        let key = ModuleKey {
            bundle: bundle.clone(),
            id: id.to_string(),
        };
        lock(&self.inner)?
            .resolved
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::module_not_resolved(key.to_string()))
    }

    /// Asynchronous require: `callback` fires once with every requested value
    /// once all of them have resolved, synchronously for an empty list.
    pub fn require_async(
        &self,
        bundle: &Url,
        ids: &[String],
        callback: RequireCallback,
    ) -> Result<()> {
        let inits = ids
            .iter()
            .map(|id| {
                SlotInit::Await(ModuleKey {
                    bundle: bundle.clone(),
                    id: id.clone(),
                })
            })
            .collect();
        self.gather(inits, callback)
    }

    /// Whether a module has resolved (testing and diagnostics).
    pub fn is_resolved(&self, bundle: &Url, id: &str) -> bool {
        let key = ModuleKey {
            bundle: bundle.clone(),
            id: id.to_string(),
        };
        lock(&self.inner)
            .map(|inner| inner.resolved.contains_key(&key))
            .unwrap_or(false)
    }

    fn run_factory_when_ready(
        &self,
        key: ModuleKey,
        deps: Vec<String>,
        factory: ModuleFactory,
    ) -> Result<()> {
        let exports_index = deps.iter().position(|dep| dep == "exports");
        let inits = deps
            .iter()
            .map(|dep| match dep.as_str() {
                "exports" => SlotInit::Ready(ExtValue::object([])),
                "module" => SlotInit::Ready(ExtValue::object([
                    ("id".to_string(), ExtValue::string(key.id.clone())),
                    ("bundle".to_string(), ExtValue::string(key.bundle.as_str())),
                ])),
                "require" => SlotInit::Ready(self.require_function(&key.bundle)),
                name => SlotInit::Await(ModuleKey {
                    bundle: key.bundle.clone(),
                    id: name.to_string(),
                }),
            })
            .collect();

        let loader = self.clone();
        self.gather(
            inits,
            Box::new(move |mut slots| {
                let produced = factory(&mut slots).map_err(Error::from)?;
                let value = match exports_index {
                    Some(index) => slots
                        .into_iter()
                        .nth(index)
                        .ok_or_else(|| Error::internal("exports slot out of range"))?,
                    None => produced,
                };
                loader.resolve(&key, value)
            }),
        )
    }

    /// The value backing a factory's `require` dependency slot: a function
    /// resolving already-resolved modules of the same bundle at call time.
    fn require_function(&self, bundle: &Url) -> ExtValue {
        let loader = self.clone();
        let bundle = bundle.clone();
        ExtValue::Function(ExtFunction::new(1, move |args| {
            let out = match args.first().and_then(ExtValue::as_str) {
                Some(id) => loader.require(&bundle, id).map_err(ErrorProxy::from),
                None => Err(ErrorProxy::from(Error::invalid_request(
                    "require expects a module id string",
                ))),
            };
            Box::pin(async move { out })
        }))
    }

    /// Fill ready slots, install waiters for pending ones, and fire
    /// `on_ready` once nothing remains, immediately when nothing was
    /// pending to begin with.
    fn gather(&self, inits: Vec<SlotInit>, on_ready: RequireCallback) -> Result<()> {
        let total = inits.len();
        let state = Arc::new(Mutex::new(Gather {
            slots: vec![None; total],
            remaining: total,
            on_ready: Some(on_ready),
        }));

        let mut pending = Vec::new();
        {
            let mut inner = lock(&self.inner)?;
            for (index, init) in inits.into_iter().enumerate() {
                match init {
                    SlotInit::Ready(value) => pending.push((index, value)),
                    SlotInit::Await(key) => match inner.resolved.get(&key) {
                        Some(value) => pending.push((index, value.clone())),
                        None => {
                            let state = Arc::clone(&state);
                            inner.waiters.entry(key).or_default().push(Box::new(
                                move |value| Gather::fill(&state, index, value),
                            ));
                        }
                    },
                }
            }
        }

        for (index, value) in pending {
            Gather::fill(&state, index, value)?;
        }

        // Zero dependencies: nothing filled, fire synchronously.
        if total == 0 {
            let ready = {
                let mut gather = lock(&state)?;
                gather.on_ready.take()
            };
            if let Some(on_ready) = ready {
                on_ready(Vec::new())?;
            }
        }
        Ok(())
    }

    /// Mark a module resolved and run everything waiting on it.
    fn resolve(&self, key: &ModuleKey, value: ExtValue) -> Result<()> {
        let waiters = {
            let mut inner = lock(&self.inner)?;
            if inner.resolved.contains_key(key) {
                return Err(Error::definition_conflict(format!(
                    "module '{key}' resolved twice"
                )));
            }
            inner.resolved.insert(key.clone(), value.clone());
            inner.waiters.remove(key).unwrap_or_default()
        };
        for waiter in waiters {
            waiter(value.clone())?;
        }
        Ok(())
    }
}

enum SlotInit {
    Ready(ExtValue),
    Await(ModuleKey),
}
