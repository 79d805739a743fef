/// Application settings
/// Stored in dbctl.toml next to the project, or ~/.config/dbctl/config.toml

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::archive::ArchiveFormat;
use crate::core::registry::Role;
use crate::utils::{
    find_upwards, is_valid_table_name, CONFIG_ENV_VAR, CONFIG_FILE_NAME, DEFAULT_APP_COMMAND,
    DEFAULT_APP_PORT_FLAG, DEFAULT_DEVELOPMENT, DEFAULT_PRODUCTION, DEFAULT_WATCH_TABLES,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub backups_dir: PathBuf,
    pub state_dir: PathBuf,
    pub watch_tables: Vec<String>,
    pub default_format: ArchiveFormat,
    pub compress: bool,
    pub keep: Option<usize>,
    pub tools: ToolPaths,
    pub app: AppSection,
    pub migrations: MigrationSection,
    pub environments: BTreeMap<String, EnvironmentConfig>,

    /// Directory relative paths are resolved against
    #[serde(skip)]
    pub base_dir: PathBuf,

    /// File the settings were read from, if any
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

/// Locations of the PostgreSQL client programs and helpers
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolPaths {
    pub pg_dump: String,
    pub pg_restore: String,
    pub psql: String,
    pub lsof: String,
}

/// How to launch the web application for `dbctl run`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppSection {
    pub command: Vec<String>,
    pub port_flag: Option<String>,
    pub workdir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MigrationSection {
    pub dir: PathBuf,
    pub python: String,
    pub shell: String,
}

/// One `[environments.<name>]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    pub role: Role,
    pub url: Option<String>,
    pub env_file: Option<PathBuf>,
    pub url_var: Option<String>,
    pub port: Option<u16>,
    pub app_env: Option<String>,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            pg_dump: "pg_dump".to_string(),
            pg_restore: "pg_restore".to_string(),
            psql: "psql".to_string(),
            lsof: "lsof".to_string(),
        }
    }
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            command: DEFAULT_APP_COMMAND.iter().map(|s| s.to_string()).collect(),
            port_flag: Some(DEFAULT_APP_PORT_FLAG.to_string()),
            workdir: None,
        }
    }
}

impl Default for MigrationSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("migrations"),
            python: "python3".to_string(),
            shell: "sh".to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut environments = BTreeMap::new();
        for (default, role) in [
            (DEFAULT_PRODUCTION, Role::Production),
            (DEFAULT_DEVELOPMENT, Role::Development),
        ] {
            environments.insert(
                default.name.to_string(),
                EnvironmentConfig {
                    role,
                    url: None,
                    env_file: Some(PathBuf::from(default.env_file)),
                    url_var: None,
                    port: Some(default.port),
                    app_env: Some(default.app_env.to_string()),
                },
            );
        }

        Self {
            backups_dir: PathBuf::from("backups"),
            state_dir: PathBuf::from(".dbctl"),
            watch_tables: DEFAULT_WATCH_TABLES.iter().map(|s| s.to_string()).collect(),
            default_format: ArchiveFormat::PlainSql,
            compress: false,
            keep: None,
            tools: ToolPaths::default(),
            app: AppSection::default(),
            migrations: MigrationSection::default(),
            environments,
            base_dir: PathBuf::from("."),
            source: None,
        }
    }
}

impl AppConfig {
    /// Locate the settings file: explicit path, $DBCTL_CONFIG, dbctl.toml in
    /// the current directory or a parent, then the user config directory
    pub fn discover(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if !path.is_file() {
                return Err(anyhow!("settings file not found at {}", path.display()));
            }
            return Ok(Some(path.to_path_buf()));
        }

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let path = PathBuf::from(path);
            if !path.is_file() {
                return Err(anyhow!(
                    "{} points at {}, which does not exist",
                    CONFIG_ENV_VAR,
                    path.display()
                ));
            }
            return Ok(Some(path));
        }

        let current_dir = std::env::current_dir().context("Failed to get current directory")?;
        if let Some(found) = find_upwards(&current_dir, CONFIG_FILE_NAME) {
            return Ok(Some(found));
        }

        Ok(dirs::config_dir()
            .map(|dir| dir.join("dbctl").join("config.toml"))
            .filter(|path| path.is_file()))
    }

    /// Load settings, falling back to the built-in defaults rooted at the
    /// current directory when no file is found
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match Self::discover(explicit)? {
            Some(path) => Self::from_file(&path),
            None => {
                let mut config = Self::default();
                config.base_dir =
                    std::env::current_dir().context("Failed to get current directory")?;
                Ok(config)
            }
        }
    }

    /// Parse a settings file; relative paths resolve against its directory
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;

        let mut config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))?;

        config.base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.source = Some(path.to_path_buf());

        Ok(config)
    }

    /// Resolve a configured path against the settings directory
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn backups_path(&self) -> PathBuf {
        self.resolve_path(&self.backups_dir)
    }

    pub fn state_path(&self) -> PathBuf {
        self.resolve_path(&self.state_dir)
    }

    /// Validate settings that do not need the environments to be loaded
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for table in &self.watch_tables {
            if !is_valid_table_name(table) {
                errors.push(format!("watch_tables: '{}' is not a valid table name", table));
            }
        }

        if self.environments.is_empty() {
            errors.push("no environments configured".to_string());
        }

        for (name, env) in &self.environments {
            match (&env.url, &env.env_file) {
                (None, None) => errors.push(format!(
                    "environment '{}' needs either url or env_file",
                    name
                )),
                (Some(_), Some(_)) => errors.push(format!(
                    "environment '{}' sets both url and env_file",
                    name
                )),
                _ => {}
            }
        }

        if self.app.command.is_empty() {
            errors.push("app.command is empty".to_string());
        }

        if self.keep == Some(0) {
            errors.push("keep must be at least 1".to_string());
        }

        errors
    }
}
