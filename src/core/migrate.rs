/// Schema migrations
///
/// Units live in one directory and are ordered by their numeric prefix:
///
/// ```text
/// 001_init.up.sql        002_add_xp.sql         003_backfill.py
/// 001_init.down.sql                             004_cleanup.sh
/// ```
///
/// SQL units run through psql in a single transaction. Scripts are invoked
/// as `<interpreter> <path> up|down` with `DATABASE_URL` set. Every applied or
/// reverted unit is appended to a per-environment JSON-lines ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::core::postgres::DatabaseTools;
use crate::core::registry::{Environment, EnvironmentRegistry};
use crate::error::DbctlError;
use crate::utils::app_config::MigrationSection;
use crate::utils::{tail_lines, ERROR_TAIL_LINES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => f.write_str("up"),
            Direction::Down => f.write_str("down"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpreter {
    Python,
    Shell,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitKind {
    Sql { up: PathBuf, down: Option<PathBuf> },
    /// The script receives the direction as its only argument
    Script { path: PathBuf, interpreter: Interpreter },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationUnit {
    /// File stem without direction, e.g. `001_init`
    pub id: String,
    pub sequence: u64,
    pub name: String,
    pub kind: UnitKind,
}

impl MigrationUnit {
    pub fn is_reversible(&self) -> bool {
        match &self.kind {
            UnitKind::Sql { down, .. } => down.is_some(),
            UnitKind::Script { .. } => true,
        }
    }
}

fn unit_file_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d+)_([A-Za-z0-9_-]+?)(?:\.(up|down))?\.(sql|py|sh)$")
            .expect("migration file pattern is valid")
    })
}

/// Find the migration units in `dir`, ordered by sequence
pub fn discover(dir: &Path) -> Result<Vec<MigrationUnit>, DbctlError> {
    if !dir.is_dir() {
        return Err(DbctlError::Config(format!(
            "migrations directory {} does not exist",
            dir.display()
        )));
    }

    let mut ups: BTreeMap<String, (u64, String, UnitKind)> = BTreeMap::new();
    let mut downs: BTreeMap<String, PathBuf> = BTreeMap::new();

    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    for path in paths {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let Some(caps) = unit_file_pattern().captures(&file_name) else {
            debug!(file = %file_name, "not a migration unit, skipping");
            continue;
        };

        let sequence: u64 = caps[1].parse().map_err(|_| {
            DbctlError::Config(format!("migration {} has an oversized sequence number", file_name))
        })?;
        let name = caps[2].to_string();
        let id = format!("{}_{}", &caps[1], name);
        let direction = caps.get(3).map(|m| m.as_str());
        let ext = &caps[4];

        let duplicate = || DbctlError::Config(format!("migration {} is defined twice", id));

        match (ext, direction) {
            ("sql", Some("down")) => {
                if downs.insert(id.clone(), path).is_some() {
                    return Err(duplicate());
                }
            }
            ("sql", _) => {
                let kind = UnitKind::Sql { up: path, down: None };
                if ups.insert(id.clone(), (sequence, name, kind)).is_some() {
                    return Err(duplicate());
                }
            }
            (_, Some(_)) => {
                warn!(file = %file_name, "scripts take the direction as an argument; skipping");
            }
            (ext, None) => {
                let interpreter = if ext == "py" {
                    Interpreter::Python
                } else {
                    Interpreter::Shell
                };
                let kind = UnitKind::Script { path, interpreter };
                if ups.insert(id.clone(), (sequence, name, kind)).is_some() {
                    return Err(duplicate());
                }
            }
        }
    }

    for (id, down_path) in downs {
        match ups.get_mut(&id) {
            Some((_, _, UnitKind::Sql { down, .. })) => *down = Some(down_path),
            _ => {
                return Err(DbctlError::Config(format!(
                    "{} has no matching up migration",
                    down_path.display()
                )))
            }
        }
    }

    let mut units: Vec<MigrationUnit> = ups
        .into_iter()
        .map(|(id, (sequence, name, kind))| MigrationUnit {
            id,
            sequence,
            name,
            kind,
        })
        .collect();
    units.sort_by_key(|u| u.sequence);

    for pair in units.windows(2) {
        if pair[0].sequence == pair[1].sequence {
            return Err(DbctlError::Config(format!(
                "migrations {} and {} share sequence number {}",
                pair[0].id, pair[1].id, pair[0].sequence
            )));
        }
    }

    Ok(units)
}

/// Look a unit up by id (`001_init`) or sequence number (`1`, `001`)
pub fn find<'u>(units: &'u [MigrationUnit], key: &str) -> Result<&'u MigrationUnit, DbctlError> {
    let sequence: Option<u64> = key.parse().ok();
    units
        .iter()
        .find(|u| u.id == key || Some(u.sequence) == sequence)
        .ok_or_else(|| DbctlError::Config(format!("no migration matches '{}'", key)))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub id: String,
    pub name: String,
    pub direction: Direction,
    pub applied_at: DateTime<Utc>,
}

/// Append-only JSON-lines log of migration runs for one environment
pub struct MigrationLedger {
    path: PathBuf,
}

impl MigrationLedger {
    pub fn for_environment(state_dir: &Path, env: &str) -> Self {
        Self {
            path: state_dir.join("migrations").join(format!("{}.jsonl", env)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> Result<Vec<MigrationRecord>, DbctlError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path)?;
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line).map_err(|e| {
                    DbctlError::Config(format!("{}:{}: {}", self.path.display(), i + 1, e))
                })
            })
            .collect()
    }

    /// Currently applied units: the last `up` of each id not followed by a `down`
    pub fn applied(&self) -> Result<BTreeMap<String, MigrationRecord>, DbctlError> {
        let mut applied = BTreeMap::new();
        for record in self.records()? {
            match record.direction {
                Direction::Up => {
                    applied.insert(record.id.clone(), record);
                }
                Direction::Down => {
                    applied.remove(&record.id);
                }
            }
        }
        Ok(applied)
    }

    pub fn append(&self, record: &MigrationRecord) -> Result<(), DbctlError> {
        let write_failed = |source| DbctlError::ArchiveWriteFailed {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(write_failed)?;
        }

        let line = serde_json::to_string(record)
            .map_err(|e| DbctlError::Config(format!("cannot serialize migration record: {}", e)))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(write_failed)?;
        writeln!(file, "{}", line).map_err(write_failed)?;
        file.sync_all().map_err(write_failed)
    }
}

/// Runs one unit in one direction against an environment
#[async_trait]
pub trait UnitExecutor: Send + Sync {
    async fn execute(
        &self,
        unit: &MigrationUnit,
        direction: Direction,
        env: &Environment,
    ) -> Result<(), DbctlError>;
}

pub struct ProcessExecutor<'a> {
    tools: &'a dyn DatabaseTools,
    python: String,
    shell: String,
    workdir: Option<PathBuf>,
}

impl<'a> ProcessExecutor<'a> {
    pub fn new(tools: &'a dyn DatabaseTools, settings: &MigrationSection) -> Self {
        Self {
            tools,
            python: settings.python.clone(),
            shell: settings.shell.clone(),
            workdir: None,
        }
    }

    /// Directory scripts run in
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    async fn run_script(
        &self,
        path: &Path,
        interpreter: Interpreter,
        direction: Direction,
        env: &Environment,
    ) -> Result<(), DbctlError> {
        let program = match interpreter {
            Interpreter::Python => &self.python,
            Interpreter::Shell => &self.shell,
        };

        let mut cmd = Command::new(program);
        cmd.arg(path)
            .arg(direction.to_string())
            .env("DATABASE_URL", env.connection.to_url())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(app_env) = &env.app_env {
            cmd.env("APP_ENV", app_env);
        }
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await.map_err(|e| DbctlError::ToolFailed {
            program: program.clone(),
            stderr: e.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!(script = %path.display(), output = %stdout.trim(), "script output");
        }

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(DbctlError::ToolFailed {
                program: path.display().to_string(),
                stderr: format!("{}: {}", output.status, tail_lines(&stderr, ERROR_TAIL_LINES)),
            })
        }
    }
}

#[async_trait]
impl UnitExecutor for ProcessExecutor<'_> {
    async fn execute(
        &self,
        unit: &MigrationUnit,
        direction: Direction,
        env: &Environment,
    ) -> Result<(), DbctlError> {
        match (&unit.kind, direction) {
            (UnitKind::Sql { up, .. }, Direction::Up) => self
                .tools
                .run_sql_file(&env.connection, up)
                .await
                .map_err(|e| e.for_env(&env.name)),
            (UnitKind::Sql { down: Some(down), .. }, Direction::Down) => self
                .tools
                .run_sql_file(&env.connection, down)
                .await
                .map_err(|e| e.for_env(&env.name)),
            (UnitKind::Sql { down: None, .. }, Direction::Down) => {
                Err(DbctlError::Irreversible(unit.id.clone()))
            }
            (UnitKind::Script { path, interpreter }, _) => {
                self.run_script(path, *interpreter, direction, env).await
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MigrationOptions {
    /// Re-apply units that are already applied
    pub force: bool,
}

/// A unit and whether the environment has it applied
#[derive(Debug, Clone)]
pub struct UnitStatus {
    pub id: String,
    pub name: String,
    pub applied_at: Option<DateTime<Utc>>,
    /// False for ledger entries whose file is gone
    pub on_disk: bool,
}

/// Units to run by default: pending ones ascending for `up` (all unless
/// `steps` says otherwise), applied ones newest-first for `down` (one unless
/// `steps` says otherwise)
pub fn plan<'u>(
    direction: Direction,
    units: &'u [MigrationUnit],
    applied: &BTreeMap<String, MigrationRecord>,
    steps: Option<usize>,
) -> Vec<&'u MigrationUnit> {
    match direction {
        Direction::Up => units
            .iter()
            .filter(|u| !applied.contains_key(&u.id))
            .take(steps.unwrap_or(usize::MAX))
            .collect(),
        Direction::Down => units
            .iter()
            .rev()
            .filter(|u| applied.contains_key(&u.id))
            .take(steps.unwrap_or(1))
            .collect(),
    }
}

pub struct MigrationRunner<'a> {
    registry: &'a EnvironmentRegistry,
    executor: &'a dyn UnitExecutor,
    state_dir: PathBuf,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(
        registry: &'a EnvironmentRegistry,
        executor: &'a dyn UnitExecutor,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            executor,
            state_dir: state_dir.into(),
        }
    }

    pub fn ledger(&self, env: &str) -> MigrationLedger {
        MigrationLedger::for_environment(&self.state_dir, env)
    }

    /// Every unit on disk plus ledger entries without a file
    pub fn status(
        &self,
        env_name: &str,
        units: &[MigrationUnit],
    ) -> Result<Vec<UnitStatus>, DbctlError> {
        let env = self.registry.resolve(env_name)?;
        let mut applied = self.ledger(&env.name).applied()?;

        let mut statuses: Vec<UnitStatus> = units
            .iter()
            .map(|u| UnitStatus {
                id: u.id.clone(),
                name: u.name.clone(),
                applied_at: applied.remove(&u.id).map(|r| r.applied_at),
                on_disk: true,
            })
            .collect();

        statuses.extend(applied.into_values().map(|r| UnitStatus {
            id: r.id,
            name: r.name,
            applied_at: Some(r.applied_at),
            on_disk: false,
        }));

        Ok(statuses)
    }

    /// Run `units` in `direction` against `env_name`.
    ///
    /// The whole set is validated before anything runs. Execution stops at the
    /// first failing unit; units completed before it stay applied.
    pub async fn apply(
        &self,
        direction: Direction,
        env_name: &str,
        units: &[&MigrationUnit],
        options: &MigrationOptions,
    ) -> Result<Vec<MigrationRecord>, DbctlError> {
        let env = self.registry.resolve(env_name)?;
        let ledger = self.ledger(&env.name);
        let applied = ledger.applied()?;

        for unit in units {
            let is_applied = applied.contains_key(&unit.id);
            match direction {
                Direction::Up if is_applied && !options.force => {
                    return Err(DbctlError::AlreadyApplied(unit.id.clone()));
                }
                Direction::Down if !is_applied => {
                    return Err(DbctlError::NotApplied(unit.id.clone()));
                }
                Direction::Down if !unit.is_reversible() => {
                    return Err(DbctlError::Irreversible(unit.id.clone()));
                }
                _ => {}
            }
        }

        let mut ordered: Vec<&MigrationUnit> = units.to_vec();
        ordered.sort_by_key(|u| u.sequence);
        if direction == Direction::Down {
            ordered.reverse();
        }

        let mut completed = Vec::new();
        for unit in ordered {
            info!(environment = %env.name, migration = %unit.id, %direction, "running migration");

            let failed = |cause: String, completed: &[MigrationRecord]| DbctlError::MigrationFailed {
                id: unit.id.clone(),
                direction: direction.to_string(),
                cause,
                completed: completed.iter().map(|r| r.id.clone()).collect(),
            };

            if let Err(e) = self.executor.execute(unit, direction, env).await {
                return Err(failed(e.to_string(), &completed));
            }

            let record = MigrationRecord {
                id: unit.id.clone(),
                name: unit.name.clone(),
                direction,
                applied_at: Utc::now(),
            };
            if let Err(e) = ledger.append(&record) {
                return Err(failed(
                    format!("ran, but could not be recorded in the ledger: {}", e),
                    &completed,
                ));
            }
            completed.push(record);
        }

        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::parse;
    use crate::core::registry::Role;
    use crate::core::testing::FakeServer;
    use crate::error::ErrorKind;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        runs: Mutex<Vec<(String, Direction)>>,
        fail_on: Option<String>,
    }

    impl Recorder {
        fn runs(&self) -> Vec<(String, Direction)> {
            self.runs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UnitExecutor for Recorder {
        async fn execute(
            &self,
            unit: &MigrationUnit,
            direction: Direction,
            _env: &Environment,
        ) -> Result<(), DbctlError> {
            if self.fail_on.as_deref() == Some(unit.id.as_str()) {
                return Err(DbctlError::ToolFailed {
                    program: "psql".to_string(),
                    stderr: "ERROR:  syntax error at or near \"CREAT\"".to_string(),
                });
            }
            self.runs.lock().unwrap().push((unit.id.clone(), direction));
            Ok(())
        }
    }

    fn registry() -> EnvironmentRegistry {
        EnvironmentRegistry::from_environments([Environment::new(
            "development",
            Role::Development,
            parse("postgresql+psycopg://app:pw@localhost:5432/app_development").unwrap(),
        )])
        .unwrap()
    }

    fn write_units(dir: &Path) {
        for (name, body) in [
            ("001_init.up.sql", "CREATE TABLE users ();"),
            ("001_init.down.sql", "DROP TABLE users;"),
            ("002_add_xp.sql", "CREATE TABLE user_xp ();"),
            ("003_backfill.py", "import sys\n"),
            ("README.md", "how to write migrations"),
        ] {
            fs::write(dir.join(name), body).unwrap();
        }
    }

    #[test]
    fn test_discover() {
        let tmp = TempDir::new().unwrap();
        write_units(tmp.path());

        let units = discover(tmp.path()).unwrap();
        let ids: Vec<&str> = units.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["001_init", "002_add_xp", "003_backfill"]);

        assert_eq!(units[0].sequence, 1);
        assert_eq!(units[0].name, "init");
        assert!(units[0].is_reversible());
        assert!(!units[1].is_reversible());
        assert!(matches!(
            units[2].kind,
            UnitKind::Script {
                interpreter: Interpreter::Python,
                ..
            }
        ));
    }

    #[test]
    fn test_find_by_id_or_sequence() {
        let tmp = TempDir::new().unwrap();
        write_units(tmp.path());
        let units = discover(tmp.path()).unwrap();

        assert_eq!(find(&units, "002_add_xp").unwrap().id, "002_add_xp");
        assert_eq!(find(&units, "2").unwrap().id, "002_add_xp");
        assert_eq!(find(&units, "003").unwrap().id, "003_backfill");
        assert_eq!(find(&units, "9").unwrap_err().kind(), ErrorKind::Config);
    }

    #[test]
    fn test_discover_rejects_ambiguous_sets() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("001_init.sql"), "").unwrap();
        fs::write(tmp.path().join("001_other.sql"), "").unwrap();
        assert_eq!(discover(tmp.path()).unwrap_err().kind(), ErrorKind::Config);

        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("001_init.sql"), "").unwrap();
        fs::write(tmp.path().join("001_init.up.sql"), "").unwrap();
        assert_eq!(discover(tmp.path()).unwrap_err().kind(), ErrorKind::Config);

        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("002_orphan.down.sql"), "").unwrap();
        assert_eq!(discover(tmp.path()).unwrap_err().kind(), ErrorKind::Config);

        assert_eq!(
            discover(&tmp.path().join("missing")).unwrap_err().kind(),
            ErrorKind::Config
        );
    }

    #[tokio::test]
    async fn test_apply_up_then_reapply() {
        let tmp = TempDir::new().unwrap();
        let migrations = TempDir::new().unwrap();
        write_units(migrations.path());
        let units = discover(migrations.path()).unwrap();

        let registry = registry();
        let recorder = Recorder::default();
        let runner = MigrationRunner::new(&registry, &recorder, tmp.path());

        let all: Vec<&MigrationUnit> = units.iter().collect();
        let records = runner
            .apply(Direction::Up, "development", &all, &MigrationOptions::default())
            .await
            .unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(runner.ledger("development").applied().unwrap().len(), 3);

        let err = runner
            .apply(Direction::Up, "development", &all[..1], &MigrationOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyApplied);
        assert_eq!(recorder.runs().len(), 3);

        runner
            .apply(Direction::Up, "development", &all[..1], &MigrationOptions { force: true })
            .await
            .unwrap();
        assert_eq!(recorder.runs().len(), 4);
        assert_eq!(runner.ledger("development").records().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_down_validation() {
        let tmp = TempDir::new().unwrap();
        let migrations = TempDir::new().unwrap();
        write_units(migrations.path());
        let units = discover(migrations.path()).unwrap();

        let registry = registry();
        let recorder = Recorder::default();
        let runner = MigrationRunner::new(&registry, &recorder, tmp.path());

        let err = runner
            .apply(Direction::Down, "development", &[&units[0]], &MigrationOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotApplied);

        let all: Vec<&MigrationUnit> = units.iter().collect();
        runner
            .apply(Direction::Up, "development", &all, &MigrationOptions::default())
            .await
            .unwrap();

        // 002_add_xp has no down file; nothing runs, including 001
        let err = runner
            .apply(
                Direction::Down,
                "development",
                &[&units[0], &units[1]],
                &MigrationOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Irreversible);
        assert_eq!(recorder.runs().len(), 3);

        let reverted = runner
            .apply(Direction::Down, "development", &[&units[2], &units[0]], &MigrationOptions::default())
            .await
            .unwrap();
        let ids: Vec<&str> = reverted.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["003_backfill", "001_init"]);

        let applied = runner.ledger("development").applied().unwrap();
        assert_eq!(applied.keys().collect::<Vec<_>>(), vec!["002_add_xp"]);
    }

    #[tokio::test]
    async fn test_failure_keeps_completed_units() {
        let tmp = TempDir::new().unwrap();
        let migrations = TempDir::new().unwrap();
        write_units(migrations.path());
        let units = discover(migrations.path()).unwrap();

        let registry = registry();
        let recorder = Recorder {
            fail_on: Some("002_add_xp".to_string()),
            ..Recorder::default()
        };
        let runner = MigrationRunner::new(&registry, &recorder, tmp.path());

        let all: Vec<&MigrationUnit> = units.iter().collect();
        let err = runner
            .apply(Direction::Up, "development", &all, &MigrationOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::MigrationFailed);
        match err {
            DbctlError::MigrationFailed { id, completed, .. } => {
                assert_eq!(id, "002_add_xp");
                assert_eq!(completed, vec!["001_init".to_string()]);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let applied = runner.ledger("development").applied().unwrap();
        assert_eq!(applied.keys().collect::<Vec<_>>(), vec!["001_init"]);
    }

    #[tokio::test]
    async fn test_plan_and_status() {
        let tmp = TempDir::new().unwrap();
        let migrations = TempDir::new().unwrap();
        write_units(migrations.path());
        let units = discover(migrations.path()).unwrap();

        let registry = registry();
        let recorder = Recorder::default();
        let runner = MigrationRunner::new(&registry, &recorder, tmp.path());

        let applied = BTreeMap::new();
        assert_eq!(plan(Direction::Up, &units, &applied, None).len(), 3);
        assert_eq!(plan(Direction::Up, &units, &applied, Some(2)).len(), 2);
        assert!(plan(Direction::Down, &units, &applied, None).is_empty());

        runner
            .apply(Direction::Up, "development", &[&units[0], &units[1]], &MigrationOptions::default())
            .await
            .unwrap();
        let applied = runner.ledger("development").applied().unwrap();

        let pending = plan(Direction::Up, &units, &applied, None);
        assert_eq!(pending[0].id, "003_backfill");
        let down = plan(Direction::Down, &units, &applied, None);
        assert_eq!(down.len(), 1);
        assert_eq!(down[0].id, "002_add_xp");

        // A ledger entry whose file was deleted still shows up
        fs::remove_file(migrations.path().join("002_add_xp.sql")).unwrap();
        let units = discover(migrations.path()).unwrap();
        let status = runner.status("development", &units).unwrap();
        assert_eq!(status.len(), 3);
        assert!(status[0].applied_at.is_some());
        assert!(status[1].applied_at.is_none());
        assert_eq!(status[2].id, "002_add_xp");
        assert!(!status[2].on_disk);
    }

    #[tokio::test]
    async fn test_sql_units_run_through_psql_tools() {
        let migrations = TempDir::new().unwrap();
        write_units(migrations.path());
        fs::write(migrations.path().join("004_broken.sql"), "CREATE TABLE half ();\nFAIL here").unwrap();
        let units = discover(migrations.path()).unwrap();

        let tools = FakeServer::new().with_database("app_development", &[]);
        let executor = ProcessExecutor::new(&tools, &MigrationSection::default());
        let env = registry().resolve("development").unwrap().clone();

        executor.execute(&units[0], Direction::Up, &env).await.unwrap();
        assert!(tools.tables("app_development").unwrap().contains_key("users"));

        executor.execute(&units[0], Direction::Down, &env).await.unwrap();
        assert!(!tools.tables("app_development").unwrap().contains_key("users"));

        let err = executor.execute(&units[1], Direction::Down, &env).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Irreversible);

        let err = executor.execute(&units[3], Direction::Up, &env).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolFailed);
        assert!(!tools.tables("app_development").unwrap().contains_key("half"));
    }

    #[tokio::test]
    async fn test_scripts_get_direction_and_database_url() {
        let migrations = TempDir::new().unwrap();
        let out = migrations.path().join("out.txt");
        fs::write(
            migrations.path().join("001_seed.sh"),
            format!("echo \"$1 $DATABASE_URL\" > '{}'\n", out.display()),
        )
        .unwrap();
        fs::write(migrations.path().join("002_fail.sh"), "echo boom >&2\nexit 3\n").unwrap();
        let units = discover(migrations.path()).unwrap();

        let tools = FakeServer::new();
        let executor = ProcessExecutor::new(&tools, &MigrationSection::default());
        let env = registry().resolve("development").unwrap().clone();

        executor.execute(&units[0], Direction::Up, &env).await.unwrap();
        let written = fs::read_to_string(&out).unwrap();
        assert_eq!(
            written.trim(),
            "up postgresql+psycopg://app:pw@localhost:5432/app_development"
        );

        let err = executor.execute(&units[1], Direction::Down, &env).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolFailed);
        assert!(err.to_string().contains("boom"));
    }
}
