//! Trusted API key list.
//!
//! The list is loaded once at startup and never mutated afterwards, so it is
//! shared by `Arc` without any locking. Lookups are a linear scan in file
//! order, which is fine for the small key sets this gate is deployed with.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// A trusted API key and the numeric id its quota is tracked under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    /// The secret presented in the `API_KEY` header
    pub key: String,
    /// Identity suffix used in store keys
    pub id: i64,
}

/// Errors raised while loading the key list.
#[derive(Debug, Error)]
pub enum ApiKeyError {
    #[error("failed to read API key file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse API key list: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to parse API key list: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Ordered, immutable list of trusted API keys.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyRegistry {
    records: Vec<ApiKeyRecord>,
}

impl ApiKeyRegistry {
    /// Create a registry from records, keeping their order.
    pub fn new(records: Vec<ApiKeyRecord>) -> Self {
        Self { records }
    }

    /// Load the key list from a file. `.yaml`/`.yml` files are parsed as YAML,
    /// everything else as JSON.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ApiKeyError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ApiKeyError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml") | Some("yml")
        );
        let registry = if is_yaml {
            Self::from_yaml(&contents)?
        } else {
            Self::from_json(&contents)?
        };

        info!(path = %path.display(), keys = registry.len(), "Loaded API keys");
        Ok(registry)
    }

    /// Parse a JSON array of `{ "key": ..., "id": ... }` records.
    pub fn from_json(json: &str) -> Result<Self, ApiKeyError> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    /// Parse a YAML sequence of `{ key, id }` records.
    pub fn from_yaml(yaml: &str) -> Result<Self, ApiKeyError> {
        Ok(Self::new(serde_yaml::from_str(yaml)?))
    }

    /// Find the record whose key matches exactly. The first match wins.
    pub fn find(&self, key: &str) -> Option<&ApiKeyRecord> {
        self.records.iter().find(|record| record.key == key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
