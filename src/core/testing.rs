/// In-memory stand-in for a PostgreSQL server and its client tools
///
/// Databases are maps of table name to row count. A dump writes those maps
/// to disk as `CREATE TABLE` lines plus `-- rows` markers and a replay reads
/// them back, so backup and restore can be exercised end to end.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::core::archive::ArchiveFormat;
use crate::core::connection::ConnectionInfo;
use crate::core::postgres::{DatabaseTools, ToolError};
use crate::utils::MAINTENANCE_DATABASE;

type Tables = BTreeMap<String, u64>;

#[derive(Default)]
pub struct FakeServer {
    databases: Mutex<BTreeMap<String, Tables>>,
    calls: Mutex<Vec<String>>,
    unavailable: bool,
    empty_dump: bool,
    noop_replay: bool,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database(self, name: &str, tables: &[(&str, u64)]) -> Self {
        let tables = tables.iter().map(|(t, n)| (t.to_string(), *n)).collect();
        self.databases.lock().unwrap().insert(name.to_string(), tables);
        self
    }

    /// Every connection attempt is refused
    pub fn unreachable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// Dumps succeed but define nothing
    pub fn with_empty_dumps(mut self) -> Self {
        self.empty_dump = true;
        self
    }

    /// Replays succeed but change nothing
    pub fn with_noop_replays(mut self) -> Self {
        self.noop_replay = true;
        self
    }

    pub fn tables(&self, database: &str) -> Option<Tables> {
        self.databases.lock().unwrap().get(database).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn check_reachable(&self, conn: &ConnectionInfo) -> Result<(), ToolError> {
        if self.unavailable {
            return Err(ToolError::Unavailable(format!(
                "connection to server at \"{}\", port {} failed: Connection refused",
                conn.host, conn.port
            )));
        }
        if conn.database != MAINTENANCE_DATABASE
            && !self.databases.lock().unwrap().contains_key(&conn.database)
        {
            return Err(ToolError::Unavailable(format!(
                "FATAL:  database \"{}\" does not exist",
                conn.database
            )));
        }
        Ok(())
    }

    fn failed(message: String) -> ToolError {
        ToolError::Failed {
            program: "fake".to_string(),
            status: "exit status: 1".to_string(),
            stderr: message,
        }
    }

    fn content_path(path: &Path) -> PathBuf {
        if path.is_dir() {
            path.join("toc.dat")
        } else {
            path.to_path_buf()
        }
    }
}

/// Apply the statements a fake dump or migration file understands
fn apply_script(tables: &mut Tables, script: &str) -> Result<(), ToolError> {
    for line in script.lines().map(str::trim) {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["CREATE", "TABLE", name, ..] => {
                tables.entry(name.trim_end_matches(';').to_string()).or_insert(0);
            }
            ["DROP", "TABLE", name, ..] => {
                tables.remove(name.trim_end_matches(';'));
            }
            ["--", "rows", name, count] => {
                let count = count.parse().map_err(|_| FakeServer::failed(line.to_string()))?;
                tables.insert(name.to_string(), count);
            }
            ["FAIL", ..] => return Err(FakeServer::failed(format!("ERROR:  {}", line))),
            _ => {}
        }
    }
    Ok(())
}

#[async_trait]
impl DatabaseTools for FakeServer {
    async fn ping(&self, conn: &ConnectionInfo) -> Result<(), ToolError> {
        self.record(format!("ping {}", conn.database));
        self.check_reachable(conn)
    }

    async fn database_exists(&self, conn: &ConnectionInfo) -> Result<bool, ToolError> {
        self.record(format!("exists {}", conn.database));
        self.check_reachable(&conn.for_database(MAINTENANCE_DATABASE))?;
        Ok(self.databases.lock().unwrap().contains_key(&conn.database))
    }

    async fn create_database(&self, conn: &ConnectionInfo) -> Result<(), ToolError> {
        self.record(format!("create {}", conn.database));
        let mut databases = self.databases.lock().unwrap();
        if databases.contains_key(&conn.database) {
            return Err(Self::failed(format!(
                "ERROR:  database \"{}\" already exists",
                conn.database
            )));
        }
        databases.insert(conn.database.clone(), Tables::new());
        Ok(())
    }

    async fn drop_database(&self, conn: &ConnectionInfo) -> Result<(), ToolError> {
        self.record(format!("drop {}", conn.database));
        self.databases.lock().unwrap().remove(&conn.database);
        Ok(())
    }

    async fn terminate_connections(&self, conn: &ConnectionInfo) -> Result<u64, ToolError> {
        self.record(format!("terminate {}", conn.database));
        Ok(0)
    }

    async fn list_tables(&self, conn: &ConnectionInfo) -> Result<Vec<String>, ToolError> {
        self.record(format!("list {}", conn.database));
        self.check_reachable(conn)?;
        let tables = self.tables(&conn.database).unwrap_or_default();
        Ok(tables.keys().map(|t| format!("public.{}", t)).collect())
    }

    async fn count_rows(&self, conn: &ConnectionInfo, table: &str) -> Result<u64, ToolError> {
        self.record(format!("count {}.{}", conn.database, table));
        self.check_reachable(conn)?;
        self.tables(&conn.database)
            .and_then(|t| t.get(table).copied())
            .ok_or_else(|| Self::failed(format!("ERROR:  relation \"{}\" does not exist", table)))
    }

    async fn dump(
        &self,
        conn: &ConnectionInfo,
        format: ArchiveFormat,
        dest: &Path,
    ) -> Result<(), ToolError> {
        self.record(format!("dump {}", conn.database));
        self.check_reachable(conn)?;

        let mut script = String::from("SET statement_timeout = 0;\n");
        if !self.empty_dump {
            for (table, rows) in self.tables(&conn.database).unwrap_or_default() {
                script.push_str(&format!("CREATE TABLE {} ();\n-- rows {} {}\n", table, table, rows));
            }
        }

        let file = if format == ArchiveFormat::Directory {
            fs::create_dir_all(dest)?;
            dest.join("toc.dat")
        } else {
            dest.to_path_buf()
        };
        fs::write(file, script)?;
        Ok(())
    }

    async fn archive_contents(&self, archive: &Path) -> Result<Vec<String>, ToolError> {
        self.record("contents");
        let script = fs::read_to_string(Self::content_path(archive))?;
        Ok(script
            .lines()
            .filter_map(|l| l.strip_prefix("CREATE TABLE "))
            .enumerate()
            .map(|(i, rest)| {
                let name = rest.split_whitespace().next().unwrap_or_default();
                format!("{}; 1259 {} TABLE public {} app", i + 1, 16384 + i, name)
            })
            .collect())
    }

    async fn replay(
        &self,
        conn: &ConnectionInfo,
        _format: ArchiveFormat,
        archive: &Path,
    ) -> Result<(), ToolError> {
        self.record(format!("replay {}", conn.database));
        self.check_reachable(conn)?;
        if self.noop_replay {
            return Ok(());
        }

        let script = fs::read_to_string(Self::content_path(archive))?;
        let mut replayed = Tables::new();
        apply_script(&mut replayed, &script)?;
        self.databases
            .lock()
            .unwrap()
            .insert(conn.database.clone(), replayed);
        Ok(())
    }

    async fn run_sql_file(&self, conn: &ConnectionInfo, file: &Path) -> Result<(), ToolError> {
        self.record(format!("sql {}", conn.database));
        self.check_reachable(conn)?;

        let script = fs::read_to_string(file)?;
        let mut databases = self.databases.lock().unwrap();
        let tables = databases.entry(conn.database.clone()).or_default();

        // Single transaction: nothing changes unless the whole file applies
        let mut staged = tables.clone();
        apply_script(&mut staged, &script)?;
        *tables = staged;
        Ok(())
    }
}
