//! Configuration access by dotted key.
//!
//! The configuration is a YAML document assembled from a global file plus a
//! local override file (deep-merged, so local keys win), or from a string
//! in tests. Lookups use a simplified dotted syntax where
//! `get("some.array[0].node")` is equivalent to indexing
//! `conf["some"]["array"][0]["node"]`.

pub mod keychain;

use std::fs;
use std::path::{Path, PathBuf};

use serde_yaml::Value as Yaml;
use thiserror::Error;

pub use keychain::Keychain;

/// File names merged into one document, in order.
pub const GLOBAL_FILE: &str = "global.yaml";
pub const LOCAL_FILE: &str = "local.yaml";

/// Directories searched for configuration files.
pub const DEFAULT_DIRS: &[&str] = &["./config", "/etc/ecommerce"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    #[error("cannot read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone)]
pub struct Config {
    root: Yaml,
}

impl Config {
    /// Parse a configuration document from a string.
    pub fn from_str(text: &str) -> Result<Config, ConfigError> {
        let root: Yaml = serde_yaml::from_str(text)?;
        Ok(Config { root })
    }

    /// Load `global.yaml` + `local.yaml` from the default directories.
    pub fn load_default() -> Result<Config, ConfigError> {
        let dirs: Vec<PathBuf> = DEFAULT_DIRS.iter().map(PathBuf::from).collect();
        Config::load(&dirs, GLOBAL_FILE, LOCAL_FILE)
    }

    /// Load the named files, each resolved against the first directory that
    /// contains it, and deep-merge them in order (later files win).
    pub fn load(dirs: &[PathBuf], global: &str, local: &str) -> Result<Config, ConfigError> {
        let mut root = Yaml::Null;
        for name in [global, local] {
            let path = find_file(name, dirs)?;
            let text = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            let layer: Yaml = serde_yaml::from_str(&text)?;
            root = merge_yaml(root, layer);
        }
        Ok(Config { root })
    }

    /// Look up a value by dotted key; `None` when any path segment is
    /// missing or the key syntax is invalid.
    pub fn get(&self, key: &str) -> Option<&Yaml> {
        let mut node = &self.root;
        for segment in key.split('.').filter(|s| !s.is_empty()) {
            node = match parse_segment(segment)? {
                Segment::Field(name) => node.get(name)?,
                Segment::Indexed(name, index) => node.get(name)?.get(index)?,
            };
        }
        Some(node)
    }

    /// Join two key fragments with a dot and look the result up.
    pub fn get_multi(&self, prefix: &str, key: &str) -> Option<&Yaml> {
        self.get(&format!("{}.{}", prefix, key))
    }

    /// Scalar lookup rendered as a string; `None` for missing keys or
    /// non-scalar values.
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(scalar_string)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(value) => yaml_truthy(value),
            None => default,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Yaml::as_i64)
    }

    /// A sequence of scalars rendered as strings.
    pub fn get_string_list(&self, key: &str) -> Option<Vec<String>> {
        let seq = self.get(key)?.as_sequence()?;
        Some(seq.iter().filter_map(scalar_string).collect())
    }
}

enum Segment<'a> {
    Field(&'a str),
    Indexed(&'a str, usize),
}

fn parse_segment(segment: &str) -> Option<Segment<'_>> {
    match segment.find('[') {
        None => Some(Segment::Field(segment)),
        Some(open) => {
            let close = segment.rfind(']')?;
            if close != segment.len() - 1 || close <= open {
                return None;
            }
            let index: usize = segment[open + 1..close].parse().ok()?;
            Some(Segment::Indexed(&segment[..open], index))
        }
    }
}

/// Mapping entries from `over` replace or recurse into `base`; any other
/// combination replaces the base value wholesale.
fn merge_yaml(base: Yaml, over: Yaml) -> Yaml {
    match (base, over) {
        (Yaml::Mapping(mut base), Yaml::Mapping(over)) => {
            for (key, value) in over {
                match base.remove(&key) {
                    Some(existing) => {
                        base.insert(key, merge_yaml(existing, value));
                    }
                    None => {
                        base.insert(key, value);
                    }
                }
            }
            Yaml::Mapping(base)
        }
        (base, Yaml::Null) => base,
        (_, over) => over,
    }
}

fn find_file(name: &str, dirs: &[PathBuf]) -> Result<PathBuf, ConfigError> {
    for dir in dirs {
        let candidate = Path::new(dir).join(name);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(ConfigError::FileNotFound(name.to_string()))
}

/// Render a YAML scalar as a string (booleans and numbers included).
pub(crate) fn scalar_string(value: &Yaml) -> Option<String> {
    match value {
        Yaml::Bool(b) => Some(b.to_string()),
        Yaml::Number(n) => Some(n.to_string()),
        Yaml::String(s) => Some(s.clone()),
        _ => None,
    }
}

/// Truthiness used for flags like `loosetypes` and `FlagGrouped`: accepts
/// native booleans, `1`, `"true"` and `"yes"`.
pub(crate) fn yaml_truthy(value: &Yaml) -> bool {
    match value {
        Yaml::Bool(b) => *b,
        Yaml::Number(n) => n.as_i64() == Some(1),
        Yaml::String(s) => {
            let s = s.to_ascii_lowercase();
            s == "true" || s == "yes" || s == "1"
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
db:
    default: test
    databases: [ "test", "backoffice" ]
    test:
        driver: memory
        loosetypes: true
    dataset:
        loader: folder
        paths: [ "./tests/dataset" ]
items:
    - name: first
    - name: second
"#;

    #[test]
    fn dotted_lookup() {
        let config = Config::from_str(SAMPLE).unwrap();
        assert_eq!(config.get_str("db.default").as_deref(), Some("test"));
        assert_eq!(config.get_str("db.test.driver").as_deref(), Some("memory"));
        assert!(config.get("db.missing").is_none());
    }

    #[test]
    fn indexed_lookup() {
        let config = Config::from_str(SAMPLE).unwrap();
        assert_eq!(
            config.get_str("items[1].name").as_deref(),
            Some("second")
        );
        assert!(config.get("items[9].name").is_none());
    }

    #[test]
    fn bool_and_list_lookup() {
        let config = Config::from_str(SAMPLE).unwrap();
        assert!(config.get_bool("db.test.loosetypes", false));
        assert!(!config.get_bool("db.test.missing", false));
        assert_eq!(
            config.get_string_list("db.databases"),
            Some(vec!["test".to_string(), "backoffice".to_string()])
        );
    }

    #[test]
    fn local_overrides_merge_after_global() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("global.yaml"), "a:\n  b: 1\n").unwrap();
        std::fs::write(dir.path().join("local.yaml"), "a:\n  b: 2\n").unwrap();
        let config =
            Config::load(&[dir.path().to_path_buf()], GLOBAL_FILE, LOCAL_FILE).unwrap();
        assert_eq!(config.get_i64("a.b"), Some(2));
    }
}
