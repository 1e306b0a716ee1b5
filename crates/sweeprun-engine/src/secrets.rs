//! Secret sources resolved before a run starts.

use std::collections::BTreeMap;
use std::path::Path;

use sweeprun_core::SecretSourceRef;
use tracing::debug;

use crate::error::EngineError;

/// Prefix of env vars carrying secrets into executed commands.
pub const SECRET_ENV_PREFIX: &str = "SWEEPRUN_SECRET_";

/// A named source of secret values.
pub trait SecretSource: Send + Sync {
    /// Source kind, for logs.
    fn kind(&self) -> &str;

    /// Look up one secret.
    fn get(&self, key: &str) -> Option<String>;

    /// Secrets this source hands to executed commands.
    fn items(&self) -> Vec<(String, String)>;
}

/// Secrets read from the process environment, optionally under a prefix.
#[derive(Debug, Clone, Default)]
pub struct EnvSecrets {
    prefix: String,
}

impl EnvSecrets {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl SecretSource for EnvSecrets {
    fn kind(&self) -> &str {
        "env"
    }

    fn get(&self, key: &str) -> Option<String> {
        std::env::var(format!("{}{}", self.prefix, key)).ok()
    }

    fn items(&self) -> Vec<(String, String)> {
        // Without a prefix there is no way to tell secrets from other vars.
        if self.prefix.is_empty() {
            return Vec::new();
        }
        std::env::vars()
            .filter_map(|(k, v)| k.strip_prefix(&self.prefix).map(|k| (k.to_string(), v)))
            .collect()
    }
}

/// Secrets held in memory, e.g. loaded from a JSON file.
#[derive(Debug, Clone, Default)]
pub struct MapSecrets {
    values: BTreeMap<String, String>,
}

impl MapSecrets {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    /// Load a flat JSON object of secrets.
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let bytes = std::fs::read(path).map_err(|e| {
            EngineError::Secrets(format!("failed to read '{}': {}", path.display(), e))
        })?;
        let values = serde_json::from_slice(&bytes).map_err(|e| {
            EngineError::Secrets(format!("'{}' is not a JSON object of strings: {}", path.display(), e))
        })?;
        Ok(Self { values })
    }
}

impl SecretSource for MapSecrets {
    fn kind(&self) -> &str {
        "file"
    }

    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn items(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// All secret sources of one run, searched in declaration order.
#[derive(Default)]
pub struct Secrets {
    sources: Vec<Box<dyn SecretSource>>,
}

impl Secrets {
    /// Resolve the declared secret sources of a task.
    pub fn resolve(refs: &[SecretSourceRef]) -> Result<Self, EngineError> {
        let mut sources: Vec<Box<dyn SecretSource>> = Vec::with_capacity(refs.len());
        for r in refs {
            let source: Box<dyn SecretSource> = match r.kind.as_str() {
                "env" => Box::new(EnvSecrets::new(r.source.clone())),
                "file" => Box::new(MapSecrets::from_file(Path::new(&r.source))?),
                other => {
                    return Err(EngineError::Secrets(format!(
                        "unsupported secret source kind '{other}'"
                    )))
                }
            };
            debug!(kind = %source.kind(), "Resolved secret source");
            sources.push(source);
        }
        Ok(Self { sources })
    }

    /// Builder method to add a source.
    pub fn with_source(mut self, source: impl SecretSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// Look up a secret in the first source that has it.
    pub fn get(&self, key: &str) -> Option<String> {
        self.sources.iter().find_map(|s| s.get(key))
    }

    /// Env pairs (`SWEEPRUN_SECRET_<KEY>`) for executed commands.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        let mut merged = BTreeMap::new();
        for source in self.sources.iter().rev() {
            merged.extend(source.items());
        }
        merged
            .into_iter()
            .map(|(k, v)| (format!("{SECRET_ENV_PREFIX}{k}"), v))
            .collect()
    }
}
