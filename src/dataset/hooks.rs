//! Hook registries: named user functions invoked by the solver.
//!
//! Hooks are addressed as `<module>.<function>`; the split is at the last
//! dot, so module names may themselves be dotted. Modules bind lazily: a
//! registered loader runs on the first reference to any of its functions
//! and its function map is memoized for the process lifetime (a failed
//! load is memoized too). Two registries exist with identical semantics:
//! one for procedures (`code.name`) and one for per-row post processors
//! (`query.post`).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::recipe::Recipe;
use crate::error::DatasetError;
use crate::value::{EntityId, RecordMap, Value};

/// A procedure: given the recipe node, entity type, dataset name and the id
/// batch, produce one value per id.
pub type ProcedureFn = dyn Fn(&Recipe, &str, &str, &[EntityId]) -> Result<HashMap<EntityId, Value>, DatasetError>
    + Send
    + Sync;

/// Outcome of one post-processing hook.
pub enum PostOutcome {
    /// The (possibly rewritten) row continues down the pipeline.
    Row(RecordMap),
    /// The row is discarded.
    Drop,
}

/// A per-row post processor.
pub type PostHookFn = dyn Fn(RecordMap) -> Result<PostOutcome, DatasetError> + Send + Sync;

/// The functions exported by one module.
pub type ModuleFns<F> = HashMap<String, Arc<F>>;

type LoaderFn<F> = dyn Fn() -> Option<ModuleFns<F>> + Send + Sync;

pub struct HookRegistry<F: ?Sized> {
    loaders: RwLock<HashMap<String, Arc<LoaderFn<F>>>>,
    /// Memoized module binds; `None` records a module that failed to load.
    modules: RwLock<HashMap<String, Option<ModuleFns<F>>>>,
}

impl<F: ?Sized> HookRegistry<F> {
    pub fn new() -> HookRegistry<F> {
        HookRegistry {
            loaders: RwLock::new(HashMap::new()),
            modules: RwLock::new(HashMap::new()),
        }
    }

    /// Register a module loader, invoked on first reference.
    pub fn register_loader(
        &self,
        module: &str,
        loader: impl Fn() -> Option<ModuleFns<F>> + Send + Sync + 'static,
    ) {
        self.loaders
            .write()
            .unwrap()
            .insert(module.to_string(), Arc::new(loader));
    }

    /// Register a single function eagerly.
    pub fn register(&self, module: &str, function: &str, hook: Arc<F>) {
        let mut modules = self.modules.write().unwrap();
        let entry = modules.entry(module.to_string()).or_insert_with(|| Some(HashMap::new()));
        match entry {
            Some(functions) => {
                functions.insert(function.to_string(), hook);
            }
            None => {
                // A previously failed load is superseded by the explicit bind.
                let mut functions = HashMap::new();
                functions.insert(function.to_string(), hook);
                *entry = Some(functions);
            }
        }
    }

    /// Bind a qualified `<module>.<function>` name.
    pub fn resolve(&self, qualified: &str) -> Result<Arc<F>, DatasetError> {
        let (module, function) = qualified.rsplit_once('.').ok_or_else(|| {
            DatasetError::Configuration(format!(
                "invalid qualified function name [{}]",
                qualified
            ))
        })?;

        if let Some(entry) = self.modules.read().unwrap().get(module) {
            return lookup(entry, module, function);
        }

        // First reference: run the loader (if any) outside the module lock.
        let loader = self.loaders.read().unwrap().get(module).cloned();
        let loaded = loader.and_then(|load| load());

        let mut modules = self.modules.write().unwrap();
        let entry = modules.entry(module.to_string()).or_insert(loaded);
        lookup(entry, module, function)
    }
}

impl<F: ?Sized> Default for HookRegistry<F> {
    fn default() -> Self {
        HookRegistry::new()
    }
}

fn lookup<F: ?Sized>(
    entry: &Option<ModuleFns<F>>,
    module: &str,
    function: &str,
) -> Result<Arc<F>, DatasetError> {
    let functions = entry.as_ref().ok_or_else(|| {
        DatasetError::UnknownHook(format!("module [{}] cannot be loaded", module))
    })?;
    functions.get(function).cloned().ok_or_else(|| {
        DatasetError::UnknownHook(format!(
            "module [{}] does not have a function [{}]",
            module, function
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn upper_hook() -> Arc<PostHookFn> {
        Arc::new(|row: RecordMap| Ok(PostOutcome::Row(row)))
    }

    #[test]
    fn eager_registration_resolves() {
        let registry: HookRegistry<PostHookFn> = HookRegistry::new();
        registry.register("fixes", "keep", upper_hook());
        assert!(registry.resolve("fixes.keep").is_ok());
        assert!(matches!(
            registry.resolve("fixes.missing"),
            Err(DatasetError::UnknownHook(_))
        ));
        assert!(matches!(
            registry.resolve("nomodule.f"),
            Err(DatasetError::UnknownHook(_))
        ));
    }

    #[test]
    fn dotted_module_names_split_at_last_dot() {
        let registry: HookRegistry<PostHookFn> = HookRegistry::new();
        registry.register("tmklib.fixes.PROD", "productos", upper_hook());
        assert!(registry.resolve("tmklib.fixes.PROD.productos").is_ok());
    }

    #[test]
    fn undotted_names_are_rejected() {
        let registry: HookRegistry<PostHookFn> = HookRegistry::new();
        assert!(matches!(
            registry.resolve("plain"),
            Err(DatasetError::Configuration(_))
        ));
    }

    #[test]
    fn loaders_run_once_and_memoize() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let registry: HookRegistry<PostHookFn> = HookRegistry::new();
        registry.register_loader("lazy", || {
            CALLS.fetch_add(1, Ordering::SeqCst);
            let mut fns: ModuleFns<PostHookFn> = HashMap::new();
            fns.insert(
                "keep".to_string(),
                Arc::new(|row: RecordMap| Ok(PostOutcome::Row(row))) as Arc<PostHookFn>,
            );
            Some(fns)
        });

        assert!(registry.resolve("lazy.keep").is_ok());
        assert!(registry.resolve("lazy.keep").is_ok());
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_loads_are_memoized() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let registry: HookRegistry<PostHookFn> = HookRegistry::new();
        registry.register_loader("broken", || {
            CALLS.fetch_add(1, Ordering::SeqCst);
            None
        });
        assert!(registry.resolve("broken.f").is_err());
        assert!(registry.resolve("broken.g").is_err());
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
