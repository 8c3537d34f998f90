//! Expected error payloads keyed by test path

use serde_json::Value;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use tracing::debug;

use crate::error::{E2eError, E2eResult};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorTable {
    entries: HashMap<String, Value>,
}

impl ErrorTable {
    /// Read the table; a missing file is an empty table
    pub fn load(path: &Path) -> E2eResult<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No error table at {}", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(E2eError::ErrorTable {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })
            }
        };

        let entries = serde_json::from_str(&raw).map_err(|e| E2eError::ErrorTable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { entries })
    }

    /// Expected payload for `id`; `None` both when absent and unknown
    pub fn lookup(&self, id: &str) -> Option<&Value> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let table = ErrorTable::load(&tmp.path().join("errors.json")).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.lookup("anything"), None);
    }

    #[test]
    fn test_lookup_existing_and_absent_keys() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("errors.json");
        std::fs::write(&path, r#"{ "/errors/load": { "status": 500, "message": "Crashing now" } }"#).unwrap();

        let table = ErrorTable::load(&path).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.lookup("/errors/load"),
            Some(&json!({ "status": 500, "message": "Crashing now" }))
        );
        assert_eq!(table.lookup("/errors/other"), None);
    }

    #[test]
    fn test_malformed_file_is_configuration_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("errors.json");
        std::fs::write(&path, "not json").unwrap();

        let err = ErrorTable::load(&path).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_directory_is_configuration_error() {
        let tmp = TempDir::new().unwrap();
        let err = ErrorTable::load(tmp.path()).unwrap_err();
        assert!(matches!(err, E2eError::ErrorTable { .. }));
    }
}
