//! Dataset engine: batched entity-dataset resolution.
//!
//! Each business entity (EntityType, EntityId) can have any number of named
//! datasets, described by recipes in a per-application repository. A batch
//! of heterogeneous requests is coalesced by (EntityType, DatasetName) so
//! each group costs one solver pass, then the results are redistributed in
//! request order with per-request error isolation.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use entity_datasets::config::Config;
//! # use entity_datasets::db::postgres::PostgresBroker;
//! # use entity_datasets::dataset::{DatasetEngine, Request};
//! # async fn run() -> anyhow::Result<()> {
//! let config = Arc::new(Config::load_default()?);
//! let broker = Arc::new(PostgresBroker::from_config(&config)?);
//! let engine = DatasetEngine::new(config, broker)?;
//!
//! let results = engine
//!     .fetch(vec![
//!         Request::new("PROD", 1, "texts"),
//!         Request::new("PROD", 2, "texts"),
//!         Request::new("CONT", 7, "profile"),
//!     ])
//!     .await;
//! # Ok(())
//! # }
//! ```

pub mod coercion;
pub mod hooks;
pub mod iso8601;
pub mod loader;
pub mod query;
pub mod recipe;
pub mod solver;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use indexmap::IndexMap;

use crate::codetables::CodeTableCache;
use crate::config::Config;
use crate::db::{ConnectionBroker, ConnectionSet};
use crate::error::DatasetError;
use crate::value::{EntityId, Key, Value};

use hooks::{HookRegistry, PostHookFn, ProcedureFn};
use loader::RecipeRepository;
use solver::{SolveOutput, Solver};

pub use recipe::Recipe;

/// One dataset request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Request {
    pub entity_type: String,
    pub entity_id: EntityId,
    pub dataset: String,
}

impl Request {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<EntityId>,
        dataset: impl Into<String>,
    ) -> Request {
        Request {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            dataset: dataset.into(),
        }
    }
}

/// Per-request result envelope: (EntityType, EntityId, failed, payload).
/// Errors are shared within a group, so they arrive `Arc`-wrapped.
#[derive(Debug, Clone)]
pub struct FetchEntry {
    pub entity_type: String,
    pub entity_id: EntityId,
    pub payload: Result<Value, Arc<DatasetError>>,
}

impl FetchEntry {
    pub fn failed(&self) -> bool {
        self.payload.is_err()
    }

    pub fn data(&self) -> Option<&Value> {
        self.payload.as_ref().ok()
    }

    pub fn error(&self) -> Option<&DatasetError> {
        self.payload.as_ref().err().map(Arc::as_ref)
    }
}

/// Batch pre-processor: may rewrite the request list before grouping, e.g.
/// redirecting a generic dataset name to a specialized one per entity.
pub type PreProcessFn = dyn Fn(Vec<Request>, &str) -> Vec<Request> + Send + Sync;

pub struct DatasetEngine {
    config: Arc<Config>,
    broker: Arc<dyn ConnectionBroker>,
    repositories: RwLock<HashMap<String, Arc<RecipeRepository>>>,
    codetables: CodeTableCache,
    procedures: HookRegistry<ProcedureFn>,
    post_hooks: HookRegistry<PostHookFn>,
    pre_process: RwLock<Option<Arc<PreProcessFn>>>,
    default_database: Option<String>,
}

impl DatasetEngine {
    /// Build an engine with the default application repository configured.
    pub fn new(
        config: Arc<Config>,
        broker: Arc<dyn ConnectionBroker>,
    ) -> Result<DatasetEngine, DatasetError> {
        let default_repo = Arc::new(RecipeRepository::from_config(&config, "default")?);
        let mut repositories = HashMap::new();
        repositories.insert("default".to_string(), default_repo);

        Ok(DatasetEngine {
            codetables: CodeTableCache::new(broker.clone(), &config),
            default_database: config.get_str("db.dataset.database"),
            config,
            broker,
            repositories: RwLock::new(repositories),
            procedures: HookRegistry::new(),
            post_hooks: HookRegistry::new(),
            pre_process: RwLock::new(None),
        })
    }

    /// Configure an additional application's repository from
    /// `<application>.dataset.*`.
    pub fn configure_application(&self, application: &str) -> Result<(), DatasetError> {
        let repository = Arc::new(RecipeRepository::from_config(&self.config, application)?);
        self.repositories
            .write()
            .unwrap()
            .insert(application.to_string(), repository);
        Ok(())
    }

    /// Swap the batch pre-processor, returning the previous one.
    pub fn set_pre_process(&self, hook: Option<Arc<PreProcessFn>>) -> Option<Arc<PreProcessFn>> {
        let mut slot = self.pre_process.write().unwrap();
        std::mem::replace(&mut *slot, hook)
    }

    /// Procedure hooks (`code.name`).
    pub fn procedures(&self) -> &HookRegistry<ProcedureFn> {
        &self.procedures
    }

    /// Post-processing hooks (`query.post`).
    pub fn post_hooks(&self) -> &HookRegistry<PostHookFn> {
        &self.post_hooks
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn broker(&self) -> &dyn ConnectionBroker {
        self.broker.as_ref()
    }

    pub fn codetables(&self) -> &CodeTableCache {
        &self.codetables
    }

    /// The solver's default logical database (`db.dataset.database`); the
    /// broker's own default applies when unset.
    pub fn default_database(&self) -> Option<&str> {
        self.default_database.as_deref()
    }

    /// Resolve datasets for a batch of requests in the default application.
    pub async fn fetch(&self, requests: Vec<Request>) -> Vec<FetchEntry> {
        self.fetch_for(requests, "default").await
    }

    /// Resolve datasets for a batch of requests. The output is aligned with
    /// the input: same length, same (EntityType, EntityId) order, with
    /// per-request failure isolation.
    pub async fn fetch_for(&self, requests: Vec<Request>, application: &str) -> Vec<FetchEntry> {
        let pre_process = self.pre_process.read().unwrap().clone();
        let requests = match pre_process {
            Some(hook) => hook(requests, application),
            None => requests,
        };

        // Group by (EntityType, DatasetName), deduplicating ids in
        // first-seen order.
        let mut groups: IndexMap<(String, String), FetchGroup> = IndexMap::new();
        for request in &requests {
            let group = groups
                .entry((request.entity_type.clone(), request.dataset.clone()))
                .or_insert_with(FetchGroup::default);
            if !group.ids.contains(&request.entity_id) {
                group.ids.push(request.entity_id.clone());
            }
        }

        // One connection set per batch, shared by every group and augment.
        let mut connections = ConnectionSet::new(self.broker.clone());

        for ((entity_type, dataset_name), group) in groups.iter_mut() {
            let started = Instant::now();
            let outcome = self
                .solve_group(application, entity_type, dataset_name, &group.ids, &mut connections)
                .await;
            tracing::info!(
                entity_type = %entity_type,
                dataset_name = %dataset_name,
                ids = group.ids.len(),
                failed = outcome.is_err(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "solved dataset group"
            );

            match outcome {
                Ok(output) => {
                    for id in &group.ids {
                        let payload = match output.get(&Key::from_entity_id(id)) {
                            Some(value) => Ok(value.clone()),
                            None => Err(Arc::new(DatasetError::MissingKey(id.clone()))),
                        };
                        group.results.insert(id.clone(), payload);
                    }
                }
                Err(error) => {
                    let error = Arc::new(error);
                    for id in &group.ids {
                        group.results.insert(id.clone(), Err(error.clone()));
                    }
                }
            }
        }

        requests
            .into_iter()
            .map(|request| {
                let key = (request.entity_type.clone(), request.dataset.clone());
                let payload = groups
                    .get(&key)
                    .and_then(|group| group.results.get(&request.entity_id).cloned())
                    .unwrap_or_else(|| {
                        Err(Arc::new(DatasetError::MissingKey(request.entity_id.clone())))
                    });
                FetchEntry {
                    entity_type: request.entity_type,
                    entity_id: request.entity_id,
                    payload,
                }
            })
            .collect()
    }

    async fn solve_group(
        &self,
        application: &str,
        entity_type: &str,
        dataset_name: &str,
        ids: &[EntityId],
        connections: &mut ConnectionSet,
    ) -> Result<SolveOutput, DatasetError> {
        let repository = self.repository(application)?;
        let recipe = repository.get(entity_type, dataset_name)?;

        let mut solver = Solver {
            engine: self,
            connections,
        };
        let output = solver
            .solve(&recipe, entity_type, dataset_name, ids)
            .await?;

        // A list result has no per-id identity to distribute by.
        if matches!(output, SolveOutput::List(_)) {
            return Err(DatasetError::Runtime(format!(
                "list output of [{}/{}] cannot be distributed by entity id",
                entity_type, dataset_name
            )));
        }
        Ok(output)
    }

    fn repository(&self, application: &str) -> Result<Arc<RecipeRepository>, DatasetError> {
        self.repositories
            .read()
            .unwrap()
            .get(application)
            .cloned()
            .ok_or_else(|| {
                DatasetError::Configuration(format!(
                    "dataset repository for application [{}] not configured",
                    application
                ))
            })
    }
}

#[derive(Default)]
struct FetchGroup {
    ids: Vec<EntityId>,
    results: HashMap<EntityId, Result<Value, Arc<DatasetError>>>,
}
