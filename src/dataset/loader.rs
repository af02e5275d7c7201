//! Recipe repository: locate, parse and cache recipe files.
//!
//! Each dataset is a YAML file in a folder named after the entity type
//! (dataset `texts` for `PROD` lives at `PROD/texts.yaml`); a dataset
//! shared by several entity types lives under `__all__`. Applications other
//! than the default get their own repository configured under
//! `<application>.dataset.*`.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use super::recipe::Recipe;
use crate::config::Config;
use crate::error::DatasetError;

/// Environment override for the search path list (colon-separated).
pub const DATASET_DIR_ENV: &str = "ECOMMERCE_DATASET_DIR";

/// Token in a search path replaced by the install location.
const MODULE_TOKEN: &str = "{{module}}";

pub struct RecipeRepository {
    folder: PathBuf,
    cache: RwLock<HashMap<(String, String), Arc<Recipe>>>,
}

impl RecipeRepository {
    /// Build the repository for an application from its `*.dataset.*`
    /// configuration block.
    pub fn from_config(config: &Config, application: &str) -> Result<RecipeRepository, DatasetError> {
        let prefix = if application == "default" {
            "db.dataset".to_string()
        } else {
            format!("{}.dataset", application)
        };

        let kind = config
            .get_multi(&prefix, "loader")
            .and_then(crate::config::scalar_string)
            .unwrap_or_else(|| "folder".to_string());
        if kind != "folder" {
            return Err(DatasetError::Configuration(format!(
                "dataset loader [{}] does not exist",
                kind
            )));
        }

        let folders = config
            .get_string_list(&format!("{}.paths", prefix))
            .unwrap_or_else(default_folders);
        let folder = folders
            .iter()
            .find_map(|candidate| resolve_folder(candidate))
            .ok_or_else(|| {
                DatasetError::Configuration(format!(
                    "cannot find a dataset folder among {:?}",
                    folders
                ))
            })?;

        Ok(RecipeRepository {
            folder,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// A repository rooted at a fixed folder (tests, tools).
    pub fn at_folder(folder: impl Into<PathBuf>) -> RecipeRepository {
        RecipeRepository {
            folder: folder.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// The parsed recipe for (entity, dataset), memoized on first use.
    pub fn get(&self, entity: &str, dataset: &str) -> Result<Arc<Recipe>, DatasetError> {
        let cache_key = (entity.to_string(), dataset.to_string());
        if let Some(recipe) = self.cache.read().unwrap().get(&cache_key) {
            return Ok(recipe.clone());
        }

        let recipe = Arc::new(self.load(entity, dataset)?);
        let mut cache = self.cache.write().unwrap();
        let recipe = cache.entry(cache_key).or_insert(recipe);
        Ok(recipe.clone())
    }

    /// Try the four candidate files in order; parse the first that exists.
    fn load(&self, entity: &str, dataset: &str) -> Result<Recipe, DatasetError> {
        let candidates = [
            self.folder.join(entity).join(format!("{}.yaml", dataset)),
            self.folder.join(entity).join(format!("{}.json", dataset)),
            self.folder.join("__all__").join(format!("{}.yaml", dataset)),
            self.folder.join("__all__").join(format!("{}.json", dataset)),
        ];

        for path in &candidates {
            if !path.is_file() {
                continue;
            }
            let text = fs::read_to_string(path).map_err(|e| DatasetError::RecipeSyntax {
                entity: entity.to_string(),
                dataset: dataset.to_string(),
                detail: e.to_string(),
            })?;
            let recipe = Recipe::parse(&text).map_err(|e| DatasetError::RecipeSyntax {
                entity: entity.to_string(),
                dataset: dataset.to_string(),
                detail: e.to_string(),
            })?;
            recipe.validate()?;
            return Ok(recipe);
        }

        Err(DatasetError::RecipeNotFound {
            entity: entity.to_string(),
            dataset: dataset.to_string(),
        })
    }
}

fn default_folders() -> Vec<String> {
    if let Ok(paths) = env::var(DATASET_DIR_ENV) {
        return paths.split(':').map(str::to_string).collect();
    }
    vec![
        "./dataset".to_string(),
        format!("{}/dataset", MODULE_TOKEN),
    ]
}

/// Expand `{{module}}` to the install location (the directory of the
/// running executable) and keep the folder only if it exists.
fn resolve_folder(folder: &str) -> Option<PathBuf> {
    let expanded = if folder.contains(MODULE_TOKEN) {
        let module_dir = env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|p| p.to_path_buf()))
            .unwrap_or_default();
        folder.replace(MODULE_TOKEN, &module_dir.to_string_lossy())
    } else {
        folder.to_string()
    };
    let path = PathBuf::from(expanded);
    path.is_dir().then_some(path)
}
