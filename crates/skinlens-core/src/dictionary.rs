//! Class dictionary: output index → human-readable label.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum DictionaryError {
    #[error("failed to read class dictionary at {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse class dictionary at {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("class dictionary is empty")]
    Empty,
}

/// Ordered class names, indexed by model output position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDictionary {
    names: Vec<String>,
}

impl ClassDictionary {
    pub fn new(names: Vec<String>) -> Result<Self, DictionaryError> {
        if names.is_empty() {
            return Err(DictionaryError::Empty);
        }
        Ok(Self { names })
    }

    /// Load a JSON array of strings, e.g. `["acne", "eczema", ...]`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DictionaryError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| DictionaryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let names: Vec<String> =
            serde_json::from_str(&raw).map_err(|source| DictionaryError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let dictionary = Self::new(names)?;
        info!(path = %path.display(), classes = dictionary.len(), "class dictionary loaded");
        Ok(dictionary)
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}
