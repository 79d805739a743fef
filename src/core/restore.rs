/// Restore management
///
/// Replays an archive into an environment's database. The environment guard
/// runs before anything else and a refused guard makes no tool calls at all.
/// After the replay the watch-list is counted again and compared with the
/// manifest written at backup time.

use std::collections::BTreeMap;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::core::archive::{gunzip_file, ArchiveFormat, ArchiveStore, BackupManifest};
use crate::core::connection::ConnectionInfo;
use crate::core::postgres::{watched_row_counts, DatabaseTools};
use crate::core::registry::{Environment, EnvironmentRegistry};
use crate::error::DbctlError;
use crate::utils::MAINTENANCE_DATABASE;

/// Asks the operator before a destructive step
pub trait Confirm: Send + Sync {
    fn is_interactive(&self) -> bool;

    fn confirm(&self, prompt: &str) -> bool;
}

/// Prompts on the controlling terminal
pub struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn is_interactive(&self) -> bool {
        io::stdin().is_terminal()
    }

    fn confirm(&self, prompt: &str) -> bool {
        print!("{} [y/N]: ", prompt);
        if io::stdout().flush().is_err() {
            return false;
        }

        let mut input = String::new();
        if io::stdin().lock().read_line(&mut input).is_err() {
            return false;
        }
        matches!(input.trim().to_lowercase().as_str(), "y" | "yes")
    }
}

/// Which archive to restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveRef {
    Path(PathBuf),
    /// The `latest` alias of the named environment
    Latest(String),
}

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Bypass the environment guard
    pub force: bool,
    /// Skip the confirmation prompt
    pub assume_yes: bool,
    /// Drop and recreate the target database before replaying
    pub recreate: bool,
    /// Tables to count when the archive has no manifest
    pub watch_tables: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Success,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RestoreResult {
    pub target: String,
    pub archive: PathBuf,
    pub manifest: Option<BackupManifest>,
    /// Counts before the restore; `None` when the database did not exist
    pub pre_counts: Option<BTreeMap<String, u64>>,
    pub post_counts: BTreeMap<String, u64>,
    pub warnings: Vec<String>,
    pub outcome: RestoreOutcome,
}

struct StepFailure {
    step: &'static str,
    destructive: bool,
    source: DbctlError,
}

fn at_step(step: &'static str, destructive: bool) -> impl FnOnce(DbctlError) -> StepFailure {
    move |source| StepFailure {
        step,
        destructive,
        source,
    }
}

pub struct RestoreManager<'a> {
    registry: &'a EnvironmentRegistry,
    tools: &'a dyn DatabaseTools,
    store: &'a ArchiveStore,
    confirm: &'a dyn Confirm,
}

impl<'a> RestoreManager<'a> {
    pub fn new(
        registry: &'a EnvironmentRegistry,
        tools: &'a dyn DatabaseTools,
        store: &'a ArchiveStore,
        confirm: &'a dyn Confirm,
    ) -> Self {
        Self {
            registry,
            tools,
            store,
            confirm,
        }
    }

    /// Restore `archive` into environment `env_name`
    pub async fn restore(
        &self,
        env_name: &str,
        archive: &ArchiveRef,
        options: &RestoreOptions,
    ) -> Result<RestoreResult, DbctlError> {
        let env = self.registry.resolve(env_name)?;
        self.registry.assert_restorable(env, options.force)?;

        let archive = self.resolve_archive(archive)?;
        let manifest = match BackupManifest::load_for(&archive) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(archive = %archive.display(), error = %e, "ignoring unreadable manifest");
                None
            }
        };
        let (format, compressed) = match &manifest {
            Some(m) => (m.format, m.compressed),
            None => ArchiveFormat::detect(&archive).ok_or_else(|| {
                DbctlError::ArchiveNotFound(format!(
                    "{} is not a recognised archive (.sql, .sql.gz, .dump or directory)",
                    archive.display()
                ))
            })?,
        };

        let mut report = RestoreResult {
            target: env.name.clone(),
            archive,
            manifest,
            pre_counts: None,
            post_counts: BTreeMap::new(),
            warnings: Vec::new(),
            outcome: RestoreOutcome::Success,
        };

        match self.run_steps(env, format, compressed, options, &mut report).await {
            Ok(()) => {
                info!(environment = %env.name, archive = %report.archive.display(), "restore complete");
                Ok(report)
            }
            Err(failure) => {
                report.outcome = RestoreOutcome::Failed(failure.source.to_string());
                Err(DbctlError::Restore {
                    env: env.name.clone(),
                    step: failure.step,
                    destructive: failure.destructive,
                    report: Box::new(report),
                    source: Box::new(failure.source),
                })
            }
        }
    }

    fn resolve_archive(&self, archive: &ArchiveRef) -> Result<PathBuf, DbctlError> {
        match archive {
            ArchiveRef::Latest(source_env) => self.store.latest(source_env),
            ArchiveRef::Path(path) if path.exists() => Ok(path.clone()),
            ArchiveRef::Path(path) => Err(DbctlError::ArchiveNotFound(format!(
                "{} does not exist",
                path.display()
            ))),
        }
    }

    async fn run_steps(
        &self,
        env: &Environment,
        format: ArchiveFormat,
        compressed: bool,
        options: &RestoreOptions,
        report: &mut RestoreResult,
    ) -> Result<(), StepFailure> {
        let name = env.name.as_str();
        let conn = &env.connection;

        if !options.assume_yes {
            self.ask(env, &report.archive).map_err(at_step("confirm", false))?;
        }

        info!(environment = name, database = %conn, archive = %report.archive.display(), "starting restore");

        let maintenance = conn.for_database(MAINTENANCE_DATABASE);
        self.tools
            .ping(&maintenance)
            .await
            .map_err(|e| e.for_env(name))
            .map_err(at_step("connect", false))?;
        let exists = self
            .tools
            .database_exists(conn)
            .await
            .map_err(|e| e.for_env(name))
            .map_err(at_step("connect", false))?;

        let watch = match &report.manifest {
            Some(m) => m.watch_list(),
            None => options.watch_tables.clone(),
        };

        if exists {
            report.pre_counts = Some(watched_row_counts(self.tools, conn, &watch).await.counts);

            match self.tools.terminate_connections(conn).await {
                Ok(0) => {}
                Ok(n) => info!(environment = name, sessions = n, "terminated open sessions"),
                Err(e) => {
                    warn!(environment = name, error = %e, "could not terminate open sessions");
                    report
                        .warnings
                        .push(format!("could not terminate open sessions: {}", e));
                }
            }
        }

        if options.recreate && exists {
            self.tools
                .drop_database(conn)
                .await
                .map_err(|e| e.for_env(name))
                .map_err(at_step("drop", false))?;
            info!(environment = name, database = %conn.database, "dropped database");
        }
        if options.recreate || !exists {
            self.tools
                .create_database(conn)
                .await
                .map_err(|e| e.for_env(name))
                .map_err(at_step("create", options.recreate && exists))?;
            debug!(environment = name, database = %conn.database, "created database");
        }

        self.replay(name, conn, format, compressed, &report.archive)
            .await
            .map_err(at_step("replay", true))?;

        let post = watched_row_counts(self.tools, conn, &watch).await;
        let missing_at_backup = report
            .manifest
            .as_ref()
            .map(|m| m.missing_tables.as_slice())
            .unwrap_or_default();
        for table in post.missing.iter().filter(|t| !missing_at_backup.contains(t)) {
            report
                .warnings
                .push(format!("table {} could not be counted after the restore", table));
        }
        report.post_counts = post.counts;

        self.compare(name, report).map_err(at_step("verify", true))
    }

    fn ask(&self, env: &Environment, archive: &Path) -> Result<(), DbctlError> {
        if !self.confirm.is_interactive() {
            return Err(DbctlError::UserAborted(
                "not a terminal; pass --yes to restore without confirmation".to_string(),
            ));
        }

        let prompt = format!(
            "Replace the data of '{}' ({}) with {}?",
            env.name,
            env.connection.masked(),
            archive.display()
        );
        if self.confirm.confirm(&prompt) {
            Ok(())
        } else {
            Err(DbctlError::UserAborted("restore cancelled".to_string()))
        }
    }

    async fn replay(
        &self,
        env: &str,
        conn: &ConnectionInfo,
        format: ArchiveFormat,
        compressed: bool,
        archive: &Path,
    ) -> Result<(), DbctlError> {
        if !compressed {
            return self
                .tools
                .replay(conn, format, archive)
                .await
                .map_err(|e| e.for_env(env));
        }

        let plain = tempfile::Builder::new()
            .prefix("dbctl-restore-")
            .suffix(".sql")
            .tempfile()?;
        gunzip_file(archive, plain.path())?;
        debug!(archive = %archive.display(), "decompressed archive for replay");

        self.tools
            .replay(conn, format, plain.path())
            .await
            .map_err(|e| e.for_env(env))
    }

    /// Differences are warnings. Empty watched tables after restoring a backup
    /// that recorded rows mean the replay most likely did nothing.
    fn compare(&self, env: &str, report: &mut RestoreResult) -> Result<(), DbctlError> {
        let Some(manifest) = &report.manifest else {
            report
                .warnings
                .push("archive has no manifest; row counts were not compared".to_string());
            return Ok(());
        };

        for (table, expected) in &manifest.watched_row_counts {
            match report.post_counts.get(table) {
                Some(actual) if actual == expected => {}
                Some(actual) => report.warnings.push(format!(
                    "{}: backup recorded {} rows, restored database has {}",
                    table, expected, actual
                )),
                None => {}
            }
        }

        let expected = manifest.total_watched_rows();
        if expected > 0 && report.post_counts.values().all(|&n| n == 0) {
            return Err(DbctlError::SuspectedRestoreFailure {
                env: env.to_string(),
                expected,
            });
        }

        Ok(())
    }
}
