/// Dotenv file access
///
/// Each environment keeps its connection string in its own dotenv file
/// (`.env.prod`, `.env.dev`). Only reading is supported; the files belong to
/// the application.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::core::connection;
use crate::error::DbctlError;
use crate::utils::{is_sensitive_key, mask_sensitive};

pub struct EnvFile {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl EnvFile {
    /// Load a dotenv file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DbctlError> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            return Err(DbctlError::Config(format!(
                "env file not found at {}",
                path.display()
            )));
        }

        let iter = dotenv::from_path_iter(&path).map_err(|e| {
            DbctlError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;

        let mut values = BTreeMap::new();
        for item in iter {
            let (key, value) = item.map_err(|e| {
                DbctlError::Config(format!("failed to parse {}: {}", path.display(), e))
            })?;
            values.insert(key, value);
        }

        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get a value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Entries safe to print: credentials masked, connection strings shown
    /// without their password
    pub fn masked_entries(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .map(|(key, value)| {
                let shown = if let Ok(info) = connection::parse(value) {
                    info.masked()
                } else if is_sensitive_key(key) {
                    mask_sensitive(value, 2)
                } else {
                    value.clone()
                };
                (key.clone(), shown)
            })
            .collect()
    }
}
