//! Recipe model: the declarative description of one dataset.
//!
//! Recipe files are flat YAML (or JSON) documents whose keys use dotted
//! names (`query.sql`, `code.name`, `join.key`); augments nest sub-recipes
//! under attribute names. A parsed recipe is immutable and cached by the
//! repository. Unknown keys are ignored.
//!
//! ```yaml
//! single: false
//! query.sql: >
//!     SELECT ProductId, TextRole, TextContent
//!     FROM ProductTexts
//!     WHERE ProductId IN ({{ID:ProductId}})
//! query.columns: [ ProductId, TextRole, TextContent ]
//! query.id: [ ProductId ]
//! query.group: [ ProductId ]
//! query.key: [ ProductId, TextRole ]
//! ```

use indexmap::IndexMap;
use serde::Deserialize;

use super::coercion::CoerceSpec;
use crate::error::DatasetError;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Recipe {
    /// One shared result broadcast to every requested id.
    #[serde(default)]
    pub single: bool,

    /// Logical database name; absent selects the solver default.
    #[serde(default)]
    pub database: Option<String>,

    /// SQL template with `{{GROUP:VAR}}` macros.
    #[serde(rename = "query.sql", default)]
    pub sql: Option<String>,

    /// Column names bound positionally to the result row.
    #[serde(rename = "query.columns", default)]
    pub columns: Option<Vec<String>>,

    /// Placeholder names expanded to IN / BETWEEN primary-key predicates.
    #[serde(rename = "query.id", default)]
    pub id_columns: Vec<String>,

    /// Table alias prepended to generated predicates.
    #[serde(rename = "query.prefix", default)]
    pub prefix: Option<String>,

    /// Local variables for the `VAR` macro group.
    #[serde(rename = "query.var", default)]
    pub vars: IndexMap<String, serde_yaml::Value>,

    /// `list` preserves fetch order instead of keying rows.
    #[serde(rename = "query.output", default)]
    pub output: Option<String>,

    /// Keep only the first row, exposed under `__all__`.
    #[serde(rename = "query.static", default)]
    pub static_first: bool,

    /// Outer grouping columns.
    #[serde(rename = "query.group", default)]
    pub group: Vec<String>,

    /// Inner record key columns.
    #[serde(rename = "query.key", default)]
    pub key: Vec<String>,

    /// Column whose integer value must be one of the requested ids.
    #[serde(rename = "query.filter", default)]
    pub filter: Option<String>,

    #[serde(rename = "query.coerce", default)]
    pub coerce: Option<CoerceSpec>,

    /// Field name → code-list name projection.
    #[serde(rename = "query.translate", default)]
    pub translate: Option<IndexMap<String, String>>,

    /// Sub-recipes merged into each row, in declaration order.
    #[serde(rename = "query.augment", default)]
    pub query_augment: Option<IndexMap<String, Recipe>>,

    /// Post-processing hook names, run per row in order.
    #[serde(rename = "query.post", default)]
    pub post: Option<StringOrSeq>,

    /// Qualified procedure name; used when `query.sql` is absent.
    #[serde(rename = "code.name", default)]
    pub code_name: Option<String>,

    /// Sub-recipes merged into the single result (`single: true` only).
    #[serde(default)]
    pub augment: Option<IndexMap<String, Recipe>>,

    /// In augment position: columns of the parent row forming the join key.
    #[serde(rename = "join.key", default)]
    pub join_key: Option<Vec<String>>,
}

impl Recipe {
    /// Parse a recipe document. YAML is a superset of JSON, so both recipe
    /// file flavors go through the same parser.
    pub fn parse(text: &str) -> Result<Recipe, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Early structural checks, recursing into augments. A node drives a
    /// query or a procedure, never both; a node with neither is valid and
    /// contributes nothing of its own (augment-only recipes).
    pub fn validate(&self) -> Result<(), DatasetError> {
        if self.sql.is_some() && self.code_name.is_some() {
            return Err(DatasetError::Configuration(
                "a recipe node cannot carry both query.sql and code.name".to_string(),
            ));
        }
        for sub in self.augments().chain(self.query_augments()) {
            sub.validate()?;
        }
        Ok(())
    }

    pub fn post_hooks(&self) -> Vec<&str> {
        match &self.post {
            None => Vec::new(),
            Some(StringOrSeq::One(name)) => vec![name.as_str()],
            Some(StringOrSeq::Many(names)) => names.iter().map(String::as_str).collect(),
        }
    }

    fn augments(&self) -> impl Iterator<Item = &Recipe> {
        self.augment.iter().flat_map(|m| m.values())
    }

    fn query_augments(&self) -> impl Iterator<Item = &Recipe> {
        self.query_augment.iter().flat_map(|m| m.values())
    }
}

/// A scalar-or-sequence field (`query.post` accepts both).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StringOrSeq {
    One(String),
    Many(Vec<String>),
}
