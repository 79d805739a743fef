/// PostgreSQL client tooling
///
/// Everything dbctl does to a database goes through [`DatabaseTools`]. The
/// production implementation shells out to `psql`, `pg_dump` and
/// `pg_restore`, handing credentials over in the child's environment only.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::core::archive::ArchiveFormat;
use crate::core::connection::ConnectionInfo;
use crate::error::DbctlError;
use crate::utils::app_config::ToolPaths;
use crate::utils::{tail_lines, ERROR_TAIL_LINES, MAINTENANCE_DATABASE};

#[derive(Debug, Error)]
pub enum ToolError {
    /// The server could not be reached or refused the login
    #[error("{0}")]
    Unavailable(String),

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("could not run {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl ToolError {
    /// Attach the environment name and turn into a reportable error
    pub fn for_env(self, env: &str) -> DbctlError {
        match self {
            ToolError::Unavailable(cause) => DbctlError::ConnectionUnavailable {
                env: env.to_string(),
                cause,
            },
            ToolError::Failed { program, stderr, .. } => DbctlError::ToolFailed { program, stderr },
            ToolError::Launch { program, source } => DbctlError::ToolFailed {
                program,
                stderr: source.to_string(),
            },
            ToolError::Io(e) => DbctlError::Io(e),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatabaseTools: Send + Sync {
    /// Open a session on `conn` and run a trivial query
    async fn ping(&self, conn: &ConnectionInfo) -> Result<(), ToolError>;

    /// Whether `conn.database` exists on its server
    async fn database_exists(&self, conn: &ConnectionInfo) -> Result<bool, ToolError>;

    async fn create_database(&self, conn: &ConnectionInfo) -> Result<(), ToolError>;

    async fn drop_database(&self, conn: &ConnectionInfo) -> Result<(), ToolError>;

    /// Terminate other sessions on `conn.database`; returns how many
    async fn terminate_connections(&self, conn: &ConnectionInfo) -> Result<u64, ToolError>;

    /// User tables as `schema.table`
    async fn list_tables(&self, conn: &ConnectionInfo) -> Result<Vec<String>, ToolError>;

    async fn count_rows(&self, conn: &ConnectionInfo, table: &str) -> Result<u64, ToolError>;

    /// Dump `conn.database` to `dest` with clean, owner-less, ACL-less output
    async fn dump(
        &self,
        conn: &ConnectionInfo,
        format: ArchiveFormat,
        dest: &Path,
    ) -> Result<(), ToolError>;

    /// Table of contents of a custom or directory archive
    async fn archive_contents(&self, archive: &Path) -> Result<Vec<String>, ToolError>;

    /// Replay an uncompressed archive into `conn.database`
    async fn replay(
        &self,
        conn: &ConnectionInfo,
        format: ArchiveFormat,
        archive: &Path,
    ) -> Result<(), ToolError>;

    /// Run a SQL file in a single transaction
    async fn run_sql_file(&self, conn: &ConnectionInfo, file: &Path) -> Result<(), ToolError>;
}

/// Row counts for a watch-list; tables that could not be counted are listed
/// separately
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowCounts {
    pub counts: BTreeMap<String, u64>,
    pub missing: Vec<String>,
}

/// Count rows of every watched table. Failures are logged and the table is
/// reported missing; counting never fails the caller.
pub async fn watched_row_counts(
    tools: &dyn DatabaseTools,
    conn: &ConnectionInfo,
    tables: &[String],
) -> RowCounts {
    let mut result = RowCounts::default();

    for table in tables {
        match tools.count_rows(conn, table).await {
            Ok(count) => {
                debug!(table = %table, rows = count, "counted rows");
                result.counts.insert(table.clone(), count);
            }
            Err(e) => {
                warn!(table = %table, database = %conn.database, error = %e, "could not count rows");
                result.missing.push(table.clone());
            }
        }
    }

    result
}

/// Quote a single identifier; dots stay part of the name
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote an identifier, splitting an optional schema prefix
pub fn quote_qualified(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// libpq environment for a connection; the password never reaches argv
pub fn libpq_env(conn: &ConnectionInfo) -> Vec<(&'static str, String)> {
    let mut env = vec![
        ("PGHOST", conn.bare_host().to_string()),
        ("PGPORT", conn.port.to_string()),
        ("PGDATABASE", conn.database.clone()),
    ];

    if let Some(user) = &conn.user {
        env.push(("PGUSER", user.clone()));
    }
    if let Some(password) = &conn.password {
        env.push(("PGPASSWORD", password.expose().to_string()));
    }

    for (key, value) in &conn.params {
        let var = match key.as_str() {
            "sslmode" => "PGSSLMODE",
            "sslrootcert" => "PGSSLROOTCERT",
            "sslcert" => "PGSSLCERT",
            "sslkey" => "PGSSLKEY",
            "connect_timeout" => "PGCONNECT_TIMEOUT",
            "application_name" => "PGAPPNAME",
            "options" => "PGOPTIONS",
            _ => continue,
        };
        env.push((var, value.clone()));
    }

    env
}

const UNAVAILABLE_MARKERS: &[&str] = &[
    "could not connect to server",
    "connection to server",
    "connection refused",
    "could not translate host name",
    "password authentication failed",
    "no password supplied",
    "timeout expired",
    "the database system is starting up",
    "the database system is shutting down",
];

fn looks_unavailable(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    UNAVAILABLE_MARKERS.iter().any(|m| lower.contains(m))
}

/// [`DatabaseTools`] backed by the PostgreSQL client programs
pub struct PgTools {
    paths: ToolPaths,
}

impl PgTools {
    pub fn new(paths: ToolPaths) -> Self {
        Self { paths }
    }

    async fn run(
        &self,
        program: &str,
        args: &[String],
        conn: Option<&ConnectionInfo>,
    ) -> Result<String, ToolError> {
        debug!(program, ?args, "running");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(conn) = conn {
            cmd.envs(libpq_env(conn));
        }

        let output = cmd.output().await.map_err(|source| ToolError::Launch {
            program: program.to_string(),
            source,
        })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).to_string());
        }

        let stderr = tail_lines(&String::from_utf8_lossy(&output.stderr), ERROR_TAIL_LINES);
        // psql exits with 2 when the connection itself went bad
        let psql_connection_failure = program == self.paths.psql && output.status.code() == Some(2);

        if psql_connection_failure || looks_unavailable(&stderr) {
            Err(ToolError::Unavailable(stderr))
        } else {
            Err(ToolError::Failed {
                program: program.to_string(),
                status: output.status.to_string(),
                stderr,
            })
        }
    }

    /// Run one statement through psql and return its unaligned output rows
    async fn query(&self, conn: &ConnectionInfo, sql: &str) -> Result<Vec<String>, ToolError> {
        let args = [
            "-X",
            "-q",
            "-A",
            "-t",
            "-v",
            "ON_ERROR_STOP=1",
            "-c",
            sql,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>();

        let stdout = self.run(&self.paths.psql, &args, Some(conn)).await?;
        Ok(stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    async fn query_scalar(&self, conn: &ConnectionInfo, sql: &str) -> Result<u64, ToolError> {
        let rows = self.query(conn, sql).await?;
        rows.first()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ToolError::Failed {
                program: self.paths.psql.clone(),
                status: "0".to_string(),
                stderr: format!("unexpected output for `{}`: {:?}", sql, rows),
            })
    }

    fn maintenance(conn: &ConnectionInfo) -> ConnectionInfo {
        conn.for_database(MAINTENANCE_DATABASE)
    }
}

#[async_trait]
impl DatabaseTools for PgTools {
    async fn ping(&self, conn: &ConnectionInfo) -> Result<(), ToolError> {
        self.query(conn, "SELECT 1").await.map(|_| ())
    }

    async fn database_exists(&self, conn: &ConnectionInfo) -> Result<bool, ToolError> {
        let sql = format!(
            "SELECT count(*) FROM pg_database WHERE datname = {}",
            quote_literal(&conn.database)
        );
        Ok(self.query_scalar(&Self::maintenance(conn), &sql).await? > 0)
    }

    async fn create_database(&self, conn: &ConnectionInfo) -> Result<(), ToolError> {
        let sql = format!("CREATE DATABASE {}", quote_ident(&conn.database));
        self.query(&Self::maintenance(conn), &sql).await.map(|_| ())
    }

    async fn drop_database(&self, conn: &ConnectionInfo) -> Result<(), ToolError> {
        let sql = format!("DROP DATABASE IF EXISTS {}", quote_ident(&conn.database));
        self.query(&Self::maintenance(conn), &sql).await.map(|_| ())
    }

    async fn terminate_connections(&self, conn: &ConnectionInfo) -> Result<u64, ToolError> {
        let sql = format!(
            "SELECT count(pg_terminate_backend(pid)) FROM pg_stat_activity \
             WHERE datname = {} AND pid <> pg_backend_pid()",
            quote_literal(&conn.database)
        );
        self.query_scalar(&Self::maintenance(conn), &sql).await
    }

    async fn list_tables(&self, conn: &ConnectionInfo) -> Result<Vec<String>, ToolError> {
        self.query(
            conn,
            "SELECT schemaname || '.' || tablename FROM pg_tables \
             WHERE schemaname NOT IN ('pg_catalog', 'information_schema') ORDER BY 1",
        )
        .await
    }

    async fn count_rows(&self, conn: &ConnectionInfo, table: &str) -> Result<u64, ToolError> {
        let sql = format!("SELECT count(*) FROM {}", quote_qualified(table));
        self.query_scalar(conn, &sql).await
    }

    async fn dump(
        &self,
        conn: &ConnectionInfo,
        format: ArchiveFormat,
        dest: &Path,
    ) -> Result<(), ToolError> {
        let args = vec![
            "--clean".to_string(),
            "--if-exists".to_string(),
            "--no-owner".to_string(),
            "--no-acl".to_string(),
            format!("--format={}", format.pg_dump_flag()),
            format!("--file={}", dest.display()),
        ];
        self.run(&self.paths.pg_dump, &args, Some(conn)).await.map(|_| ())
    }

    async fn archive_contents(&self, archive: &Path) -> Result<Vec<String>, ToolError> {
        let args = vec!["--list".to_string(), archive.display().to_string()];
        let stdout = self.run(&self.paths.pg_restore, &args, None).await?;
        Ok(stdout.lines().map(str::to_string).collect())
    }

    async fn replay(
        &self,
        conn: &ConnectionInfo,
        format: ArchiveFormat,
        archive: &Path,
    ) -> Result<(), ToolError> {
        match format {
            ArchiveFormat::PlainSql => self.run_sql_file(conn, archive).await,
            ArchiveFormat::Custom | ArchiveFormat::Directory => {
                let args = vec![
                    "--clean".to_string(),
                    "--if-exists".to_string(),
                    "--no-owner".to_string(),
                    "--no-acl".to_string(),
                    "--exit-on-error".to_string(),
                    "--single-transaction".to_string(),
                    format!("--dbname={}", conn.database),
                    archive.display().to_string(),
                ];
                self.run(&self.paths.pg_restore, &args, Some(conn)).await.map(|_| ())
            }
        }
    }

    async fn run_sql_file(&self, conn: &ConnectionInfo, file: &Path) -> Result<(), ToolError> {
        let args = vec![
            "-X".to_string(),
            "-q".to_string(),
            "-v".to_string(),
            "ON_ERROR_STOP=1".to_string(),
            "--single-transaction".to_string(),
            "-f".to_string(),
            file.display().to_string(),
        ];
        self.run(&self.paths.psql, &args, Some(conn)).await.map(|_| ())
    }
}
