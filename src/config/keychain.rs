//! Password keychain.
//!
//! Database passwords may be stored out of the main configuration in a
//! keychain file (a YAML mapping of key name to password). Configuration
//! values of the form `keychain:{name}:{fallback}` are resolved through the
//! chain; any other value passes through unchanged, so applications can keep
//! cleartext passwords in config files without caring which values are
//! chained.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::Config;

/// Default keychain file name and search directories.
const DEFAULT_FILE: &str = "keychain.yaml";
const DEFAULT_DIRS: &[&str] = &["./config", "/etc/ecommerce"];

#[derive(Debug, Default)]
pub struct Keychain {
    keys: HashMap<String, String>,
}

impl Keychain {
    /// Build a keychain from `keychain.file` / `keychain.dirs`. A missing
    /// or unreadable chain yields an empty keychain; fetch then falls back
    /// to the inline value.
    pub fn from_config(config: &Config) -> Keychain {
        let file = config
            .get_str("keychain.file")
            .unwrap_or_else(|| DEFAULT_FILE.to_string());
        let dirs = config
            .get_string_list("keychain.dirs")
            .unwrap_or_else(|| DEFAULT_DIRS.iter().map(|d| d.to_string()).collect());

        let mut keys = HashMap::new();
        if let Some(path) = find_chain(&file, &dirs) {
            if let Ok(text) = fs::read_to_string(&path) {
                match serde_yaml::from_str::<HashMap<String, String>>(&text) {
                    Ok(parsed) => keys = parsed,
                    Err(error) => {
                        tracing::warn!(path = %path.display(), %error, "ignoring unparsable keychain file");
                    }
                }
            }
        }
        Keychain { keys }
    }

    /// Resolve a configured password value. `keychain:{name}:{fallback}`
    /// looks `name` up in the chain and falls back to the embedded value;
    /// anything else is returned unchanged.
    pub fn fetch(&self, value: &str) -> String {
        let Some(rest) = value.strip_prefix("keychain:") else {
            return value.to_string();
        };
        let (name, fallback) = match rest.split_once(':') {
            Some((name, fallback)) => (name, fallback),
            None => (rest, ""),
        };
        self.keys
            .get(name)
            .cloned()
            .unwrap_or_else(|| fallback.to_string())
    }
}

fn find_chain(file: &str, dirs: &[String]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| Path::new(dir).join(file))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_values_pass_through() {
        let chain = Keychain::default();
        assert_eq!(chain.fetch("hunter2"), "hunter2");
    }

    #[test]
    fn chained_values_resolve_or_fall_back() {
        let mut chain = Keychain::default();
        chain.keys.insert("prod-db".into(), "secret".into());
        assert_eq!(chain.fetch("keychain:prod-db:default"), "secret");
        assert_eq!(chain.fetch("keychain:other-db:default"), "default");
    }
}
