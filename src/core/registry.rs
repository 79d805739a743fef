/// Environment registry
///
/// Maps environment names to a connection and a safety role. Loaded once at
/// startup and read-only afterwards.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

use crate::core::config::EnvFile;
use crate::core::connection::{self, ConnectionInfo};
use crate::error::DbctlError;
use crate::utils::app_config::{AppConfig, EnvironmentConfig};
use crate::utils::DEFAULT_URL_VAR;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Production,
    Development,
    Other,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Production => "production",
            Role::Development => "development",
            Role::Other => "other",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub name: String,
    pub connection: ConnectionInfo,
    pub role: Role,
    pub app_port: Option<u16>,
    pub app_env: Option<String>,
}

impl Environment {
    pub fn new(name: impl Into<String>, role: Role, connection: ConnectionInfo) -> Self {
        Self {
            name: name.into(),
            connection,
            role,
            app_port: None,
            app_env: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct EnvironmentRegistry {
    environments: BTreeMap<String, Environment>,
    unavailable: BTreeMap<String, DbctlError>,
}

impl EnvironmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from already-resolved environments
    pub fn from_environments(
        environments: impl IntoIterator<Item = Environment>,
    ) -> Result<Self, DbctlError> {
        let mut registry = Self::new();
        for env in environments {
            registry.insert(env)?;
        }
        Ok(registry)
    }

    pub fn insert(&mut self, env: Environment) -> Result<(), DbctlError> {
        if self.environments.contains_key(&env.name) {
            return Err(DbctlError::Config(format!(
                "environment '{}' is defined twice",
                env.name
            )));
        }
        self.environments.insert(env.name.clone(), env);
        Ok(())
    }

    /// Load every configured environment. One that cannot be resolved (missing
    /// env file, bad URL) is remembered and only fails when it is used.
    pub fn load(settings: &AppConfig) -> Self {
        let mut registry = Self::new();

        for (name, cfg) in &settings.environments {
            match Self::connection_for(settings, name, cfg) {
                Ok(connection) => {
                    debug!(environment = %name, database = %connection, "environment loaded");
                    registry.environments.insert(
                        name.clone(),
                        Environment {
                            name: name.clone(),
                            connection,
                            role: cfg.role,
                            app_port: cfg.port,
                            app_env: cfg.app_env.clone(),
                        },
                    );
                }
                Err(e) => {
                    warn!(environment = %name, error = %e, "environment unavailable");
                    registry.unavailable.insert(name.clone(), e);
                }
            }
        }

        registry
    }

    fn connection_for(
        settings: &AppConfig,
        name: &str,
        cfg: &EnvironmentConfig,
    ) -> Result<ConnectionInfo, DbctlError> {
        if let Some(url) = &cfg.url {
            return connection::parse(url);
        }

        let env_file = cfg.env_file.as_ref().ok_or_else(|| {
            DbctlError::Config(format!("environment '{}' has neither url nor env_file", name))
        })?;
        let path = settings.resolve_path(env_file);
        let file = EnvFile::load(&path)?;

        let var = cfg.url_var.as_deref().unwrap_or(DEFAULT_URL_VAR);
        let url = file.get(var).ok_or_else(|| {
            DbctlError::Config(format!("{} is not set in {}", var, path.display()))
        })?;

        connection::parse(url)
    }

    /// Look up an environment by name
    pub fn resolve(&self, name: &str) -> Result<&Environment, DbctlError> {
        if let Some(env) = self.environments.get(name) {
            return Ok(env);
        }

        if let Some(err) = self.unavailable.get(name) {
            return Err(match err {
                DbctlError::MalformedConnectionString(msg) => {
                    DbctlError::MalformedConnectionString(format!("environment '{}': {}", name, msg))
                }
                other => DbctlError::Config(format!(
                    "environment '{}' is not usable: {}",
                    name, other
                )),
            });
        }

        Err(DbctlError::UnknownEnvironment {
            name: name.to_string(),
            known: self.names().join(", "),
        })
    }

    /// Names of every configured environment, usable or not
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .environments
            .keys()
            .chain(self.unavailable.keys())
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn environments(&self) -> impl Iterator<Item = &Environment> {
        self.environments.values()
    }

    pub fn unavailable(&self) -> impl Iterator<Item = (&String, &DbctlError)> {
        self.unavailable.iter()
    }

    fn database_names(&self, role: Role, except: &str) -> Vec<(&str, String)> {
        self.environments
            .values()
            .filter(|e| e.role == role && e.name != except)
            .map(|e| (e.name.as_str(), e.connection.database.to_lowercase()))
            .collect()
    }

    /// Check that `env` is what the caller expects it to be.
    ///
    /// Besides the declared role, a database-name rule applies: a
    /// non-production environment must not name a database that contains a
    /// production environment's database name, and a production environment
    /// must not name one containing a development database name.
    pub fn assert_role(&self, env: &Environment, expected: Role) -> Result<(), DbctlError> {
        let mismatch = |reason: String| DbctlError::RoleMismatch {
            env: env.name.clone(),
            reason,
        };

        if env.role != expected {
            return Err(mismatch(format!(
                "environment is tagged {}, expected {}",
                env.role, expected
            )));
        }

        let database = env.connection.database.to_lowercase();
        let protected = match expected {
            Role::Production => self.database_names(Role::Development, &env.name),
            Role::Development | Role::Other => self.database_names(Role::Production, &env.name),
        };

        for (other, other_db) in protected {
            if database.contains(&other_db) {
                return Err(mismatch(format!(
                    "database '{}' contains the database name of environment '{}' ({})",
                    env.connection.database, other, other_db
                )));
            }
        }

        Ok(())
    }

    /// Guard for destructive operations on `env`. Production targets need
    /// `force`; without it every target also has to pass its role check.
    pub fn assert_restorable(&self, env: &Environment, force: bool) -> Result<(), DbctlError> {
        if force {
            warn!(environment = %env.name, role = %env.role, "safety checks bypassed with --force");
            return Ok(());
        }

        if env.role == Role::Production {
            return Err(DbctlError::RoleMismatch {
                env: env.name.clone(),
                reason: "refusing to overwrite a production environment without --force"
                    .to_string(),
            });
        }

        self.assert_role(env, env.role)
    }

    /// Configuration problems worth reporting
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for (name, err) in &self.unavailable {
            errors.push(format!("environment '{}' is not usable: {}", name, err));
        }

        for env in self.environments.values() {
            if !env.connection.is_postgres() {
                errors.push(format!(
                    "environment '{}' uses non-PostgreSQL scheme '{}'",
                    env.name, env.connection.scheme
                ));
            }

            if let Err(e) = self.assert_role(env, env.role) {
                errors.push(e.to_string());
            }
        }

        let envs: Vec<&Environment> = self.environments.values().collect();
        for (i, a) in envs.iter().enumerate() {
            for b in &envs[i + 1..] {
                let (ca, cb) = (&a.connection, &b.connection);
                if ca.host == cb.host && ca.port == cb.port && ca.database == cb.database {
                    errors.push(format!(
                        "environments '{}' and '{}' point at the same database",
                        a.name, b.name
                    ));
                }
            }
        }

        errors
    }
}
