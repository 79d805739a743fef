/// dbctl defaults and well-known names
///
/// Defaults mirror the application this tool was written for: a production
/// and a development instance, each reading DATABASE_URL from its own dotenv
/// file.

/// Port used when a connection string omits one
pub const DEFAULT_PG_PORT: u16 = 5432;

/// Database every PostgreSQL server has; used to create, drop and inspect targets
pub const MAINTENANCE_DATABASE: &str = "postgres";

/// Variable holding the connection string inside an environment's dotenv file
pub const DEFAULT_URL_VAR: &str = "DATABASE_URL";

/// Settings file looked up in the current directory and its parents
pub const CONFIG_FILE_NAME: &str = "dbctl.toml";

/// Environment variable pointing at an explicit settings file
pub const CONFIG_ENV_VAR: &str = "DBCTL_CONFIG";

/// Name of the per-environment pointer to the newest archive
pub const LATEST_ALIAS: &str = "latest";

/// Suffix of the manifest written next to every archive
pub const MANIFEST_SUFFIX: &str = ".manifest.json";

/// Suffix carried by archives until they are complete and verified
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Suffix of the uncompressed dump while it waits to be gzipped
pub const RAW_SUFFIX: &str = ".raw.partial";

/// Lines of external tool stderr kept in error messages
pub const ERROR_TAIL_LINES: usize = 12;

/// Tables whose row counts are tracked unless the settings say otherwise
pub const DEFAULT_WATCH_TABLES: &[&str] = &[
    "event_completions",
    "task_sessions",
    "user_xp",
    "xp_transactions",
    "daily_xp_deductions",
];

/// Built-in environment definition used when no settings file exists
#[derive(Debug, Clone, Copy)]
pub struct DefaultEnvironment {
    pub name: &'static str,
    pub env_file: &'static str,
    pub app_env: &'static str,
    pub port: u16,
}

pub const DEFAULT_PRODUCTION: DefaultEnvironment = DefaultEnvironment {
    name: "production",
    env_file: ".env.prod",
    app_env: "prod",
    port: 8501,
};

pub const DEFAULT_DEVELOPMENT: DefaultEnvironment = DefaultEnvironment {
    name: "development",
    env_file: ".env.dev",
    app_env: "dev",
    port: 8502,
};

/// Default application launch command; the port flag and value are appended
pub const DEFAULT_APP_COMMAND: &[&str] = &["streamlit", "run", "app.py"];
pub const DEFAULT_APP_PORT_FLAG: &str = "--server.port";
