/// Backup management
///
/// A backup dumps one environment's database into the archive store:
///
/// 1. Check the server answers
/// 2. Record row counts of the watch-list and the table inventory
/// 3. `pg_dump` into a `.partial` artifact
/// 4. Verify the artifact defines something, gzip it when asked
/// 5. Move it into place, write the manifest and point `latest` at it
///
/// Nothing under the final name exists until step 5, so an interrupted or
/// empty dump never replaces a good `latest`.

use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::core::archive::{
    append_suffix, artifact_size, gzip_file, partial_path, plain_sql_has_definitions,
    remove_artifact, toc_has_definitions, ArchiveEntry, ArchiveFormat, ArchiveStore,
    BackupManifest,
};
use crate::core::postgres::{watched_row_counts, DatabaseTools, ToolError};
use crate::core::registry::{EnvironmentRegistry, Role};
use crate::error::DbctlError;
use crate::utils::{AppConfig, RAW_SUFFIX};

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub format: ArchiveFormat,
    /// Write the archive here instead of the store; a directory gets a
    /// generated file name
    pub destination: Option<PathBuf>,
    pub watch_tables: Vec<String>,
    /// Gzip plain SQL output. Custom and directory dumps are compressed by
    /// pg_dump already.
    pub compress: bool,
    pub expect_role: Option<Role>,
    /// Archives to keep per environment after a successful backup
    pub keep: Option<usize>,
}

impl BackupOptions {
    pub fn from_config(settings: &AppConfig) -> Self {
        Self {
            format: settings.default_format,
            destination: None,
            watch_tables: settings.watch_tables.clone(),
            compress: settings.compress,
            expect_role: None,
            keep: settings.keep,
        }
    }
}

pub struct BackupManager<'a> {
    registry: &'a EnvironmentRegistry,
    tools: &'a dyn DatabaseTools,
    store: &'a ArchiveStore,
}

fn at_step(env: &str, step: &'static str) -> impl FnOnce(DbctlError) -> DbctlError {
    let env = env.to_string();
    move |source| DbctlError::Backup {
        env,
        step,
        source: Box::new(source),
    }
}

fn tool_step(env: &str, step: &'static str) -> impl FnOnce(ToolError) -> DbctlError {
    let env = env.to_string();
    move |e| {
        let source = e.for_env(&env);
        at_step(&env, step)(source)
    }
}

fn discard(path: &Path) {
    if let Err(e) = remove_artifact(path) {
        warn!(path = %path.display(), error = %e, "could not remove partial artifact");
    }
}

impl<'a> BackupManager<'a> {
    pub fn new(
        registry: &'a EnvironmentRegistry,
        tools: &'a dyn DatabaseTools,
        store: &'a ArchiveStore,
    ) -> Self {
        Self {
            registry,
            tools,
            store,
        }
    }

    /// Back up environment `env_name` and return the manifest of the new archive
    pub async fn create_backup(
        &self,
        env_name: &str,
        options: &BackupOptions,
    ) -> Result<BackupManifest, DbctlError> {
        let env = self.registry.resolve(env_name)?;
        let name = env.name.as_str();
        let conn = &env.connection;
        let started = Utc::now();

        if let Some(role) = options.expect_role {
            self.registry
                .assert_role(env, role)
                .map_err(at_step(name, "role-check"))?;
        }

        info!(environment = name, database = %conn, format = %options.format, "starting backup");

        self.tools
            .ping(conn)
            .await
            .map_err(tool_step(name, "connect"))?;

        let counts = watched_row_counts(self.tools, conn, &options.watch_tables).await;
        let tables = self
            .tools
            .list_tables(conn)
            .await
            .map_err(tool_step(name, "inventory"))?;
        debug!(environment = name, tables = tables.len(), "table inventory taken");

        let compress = options.compress && options.format == ArchiveFormat::PlainSql;
        if options.compress && !compress {
            debug!(format = %options.format, "format is compressed by pg_dump, skipping gzip");
        }

        let final_path = self
            .target_path(name, options, compress, started)
            .map_err(at_step(name, "dump"))?;
        let staged = partial_path(&final_path);
        let raw = if compress {
            append_suffix(&final_path, RAW_SUFFIX)
        } else {
            staged.clone()
        };
        prepare_target(&final_path).map_err(at_step(name, "dump"))?;

        if let Err(e) = self.tools.dump(conn, options.format, &raw).await {
            discard(&raw);
            return Err(tool_step(name, "dump")(e));
        }

        if let Err(e) = self.verify(name, options.format, &raw).await {
            discard(&raw);
            return Err(at_step(name, "verify")(e));
        }

        if compress {
            let result = gzip_file(&raw, &staged).map_err(|source| DbctlError::ArchiveWriteFailed {
                path: staged.clone(),
                source,
            });
            discard(&raw);
            if let Err(e) = result {
                discard(&staged);
                return Err(at_step(name, "compress")(e));
            }
        }

        fs::rename(&staged, &final_path)
            .map_err(|source| DbctlError::ArchiveWriteFailed {
                path: final_path.clone(),
                source,
            })
            .map_err(at_step(name, "finalize"))?;

        let manifest = BackupManifest {
            created_at: started,
            source_environment: name.to_string(),
            archive_path: final_path.clone(),
            format: options.format,
            compressed: compress,
            table_count: tables.len(),
            watched_row_counts: counts.counts,
            missing_tables: counts.missing,
            size_bytes: artifact_size(&final_path)
                .map_err(DbctlError::Io)
                .map_err(at_step(name, "manifest"))?,
        };
        manifest.write().map_err(at_step(name, "manifest"))?;

        self.store
            .set_latest(name, &final_path)
            .map_err(at_step(name, "alias"))?;

        info!(
            environment = name,
            archive = %final_path.display(),
            size = manifest.size_bytes,
            "backup complete"
        );

        if let Some(keep) = options.keep {
            match self.store.prune(name, keep) {
                Ok(removed) => {
                    for path in removed {
                        info!(archive = %path.display(), "pruned old backup");
                    }
                }
                Err(e) => warn!(environment = name, error = %e, "pruning old backups failed"),
            }
        }

        Ok(manifest)
    }

    /// Archives in the store, newest first, grouped by environment
    pub fn list_backups(
        &self,
        env_name: Option<&str>,
    ) -> Result<Vec<(String, Vec<ArchiveEntry>)>, DbctlError> {
        let envs = match env_name {
            Some(name) => vec![name.to_string()],
            None => self.store.environments()?,
        };

        envs.into_iter()
            .map(|env| {
                let entries = self.store.list(&env)?;
                Ok((env, entries))
            })
            .collect()
    }

    fn target_path(
        &self,
        env: &str,
        options: &BackupOptions,
        compress: bool,
        at: chrono::DateTime<Utc>,
    ) -> Result<PathBuf, DbctlError> {
        let generated = self.store.archive_path(env, options.format, compress, at);

        match &options.destination {
            Some(dest) => destination_path(dest, &generated, compress),
            None => Ok(generated),
        }
    }

    /// An artifact passes when it is non-empty and defines at least one object
    async fn verify(&self, env: &str, format: ArchiveFormat, path: &Path) -> Result<(), DbctlError> {
        let empty = || DbctlError::EmptyArchive {
            env: env.to_string(),
            path: path.to_path_buf(),
        };

        if artifact_size(path)? == 0 {
            return Err(empty());
        }

        let defines_objects = match format {
            ArchiveFormat::PlainSql => plain_sql_has_definitions(path, false)?,
            ArchiveFormat::Custom | ArchiveFormat::Directory => {
                let toc = self
                    .tools
                    .archive_contents(path)
                    .await
                    .map_err(|e| e.for_env(env))?;
                toc_has_definitions(&toc)
            }
        };

        if defines_objects {
            Ok(())
        } else {
            Err(empty())
        }
    }
}

/// Final path for an operator-chosen destination. Relative paths resolve
/// against the current directory; a directory receives the generated file
/// name; gzip output always ends in `.gz`.
fn destination_path(dest: &Path, generated: &Path, compress: bool) -> Result<PathBuf, DbctlError> {
    let dest = std::path::absolute(dest)?;

    if dest.is_dir() {
        return Ok(match generated.file_name() {
            Some(file_name) => dest.join(file_name),
            None => dest,
        });
    }

    let gzipped = dest.extension().is_some_and(|ext| ext == "gz");
    if compress && !gzipped {
        Ok(append_suffix(&dest, ".gz"))
    } else {
        Ok(dest)
    }
}

fn prepare_target(path: &Path) -> Result<(), DbctlError> {
    let write_failed = |path: &Path, source| DbctlError::ArchiveWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    if path.exists() {
        return Err(write_failed(
            path,
            io::Error::new(io::ErrorKind::AlreadyExists, "archive already exists"),
        ));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| write_failed(parent, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::parse;
    use crate::core::postgres::MockDatabaseTools;
    use crate::core::registry::Environment;
    use crate::core::testing::FakeServer;
    use crate::error::ErrorKind;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn registry() -> EnvironmentRegistry {
        EnvironmentRegistry::from_environments([
            Environment::new(
                "production",
                Role::Production,
                parse("postgres://app:pw@localhost:5432/app_production").unwrap(),
            ),
            Environment::new(
                "development",
                Role::Development,
                parse("postgres://app:pw@localhost:5432/app_development").unwrap(),
            ),
        ])
        .unwrap()
    }

    fn options(format: ArchiveFormat) -> BackupOptions {
        BackupOptions {
            format,
            destination: None,
            watch_tables: vec!["users".to_string(), "user_xp".to_string()],
            compress: false,
            expect_role: None,
            keep: None,
        }
    }

    fn server() -> FakeServer {
        FakeServer::new().with_database("app_production", &[("users", 42), ("tasks", 7)])
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().to_string())
                    .filter(|n| n.ends_with(".partial"))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_backup_writes_archive_manifest_and_alias() {
        let tmp = TempDir::new().unwrap();
        let registry = registry();
        let tools = server();
        let store = ArchiveStore::new(tmp.path());
        let manager = BackupManager::new(&registry, &tools, &store);

        let manifest = manager
            .create_backup("production", &options(ArchiveFormat::PlainSql))
            .await
            .unwrap();

        assert!(manifest.archive_path.exists());
        assert!(manifest.archive_path.to_string_lossy().ends_with(".sql"));
        assert_eq!(manifest.source_environment, "production");
        assert_eq!(manifest.table_count, 2);
        assert_eq!(
            manifest.watched_row_counts,
            BTreeMap::from([("users".to_string(), 42)])
        );
        assert_eq!(manifest.missing_tables, vec!["user_xp".to_string()]);
        assert!(manifest.size_bytes > 0);

        assert_eq!(store.latest("production").unwrap(), manifest.archive_path);
        let stored = BackupManifest::load_for(&manifest.archive_path).unwrap().unwrap();
        assert_eq!(stored, manifest);
        assert!(leftovers(&store.env_dir("production")).is_empty());
    }

    #[tokio::test]
    async fn test_compressed_plain_backup() {
        let tmp = TempDir::new().unwrap();
        let registry = registry();
        let tools = server();
        let store = ArchiveStore::new(tmp.path());
        let manager = BackupManager::new(&registry, &tools, &store);

        let mut opts = options(ArchiveFormat::PlainSql);
        opts.compress = true;
        let manifest = manager.create_backup("production", &opts).await.unwrap();

        assert!(manifest.compressed);
        assert!(manifest.archive_path.to_string_lossy().ends_with(".sql.gz"));
        assert!(plain_sql_has_definitions(&manifest.archive_path, true).unwrap());
        assert!(leftovers(&store.env_dir("production")).is_empty());
    }

    #[tokio::test]
    async fn test_compress_ignored_for_custom_format() {
        let tmp = TempDir::new().unwrap();
        let registry = registry();
        let tools = server();
        let store = ArchiveStore::new(tmp.path());
        let manager = BackupManager::new(&registry, &tools, &store);

        let mut opts = options(ArchiveFormat::Custom);
        opts.compress = true;
        let manifest = manager.create_backup("production", &opts).await.unwrap();

        assert!(!manifest.compressed);
        assert!(manifest.archive_path.to_string_lossy().ends_with(".dump"));
        assert!(tools.calls().contains(&"contents".to_string()));
    }

    #[tokio::test]
    async fn test_directory_format() {
        let tmp = TempDir::new().unwrap();
        let registry = registry();
        let tools = server();
        let store = ArchiveStore::new(tmp.path());
        let manager = BackupManager::new(&registry, &tools, &store);

        let manifest = manager
            .create_backup("production", &options(ArchiveFormat::Directory))
            .await
            .unwrap();

        assert!(manifest.archive_path.is_dir());
        assert_eq!(store.list("production").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_structurally_empty_dump_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let registry = registry();
        let tools = FakeServer::new()
            .with_empty_dumps()
            .with_database("app_production", &[("users", 42)]);
        let store = ArchiveStore::new(tmp.path());
        let manager = BackupManager::new(&registry, &tools, &store);

        for format in [ArchiveFormat::PlainSql, ArchiveFormat::Custom] {
            let err = manager
                .create_backup("production", &options(format))
                .await
                .unwrap_err();

            assert_eq!(err.kind(), ErrorKind::EmptyArchive);
            assert_eq!(err.step(), Some("verify"));
        }

        assert!(store.latest("production").is_err());
        assert!(store.list("production").unwrap().is_empty());
        assert!(leftovers(&store.env_dir("production")).is_empty());
    }

    #[tokio::test]
    async fn test_zero_byte_dump_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let registry = registry();
        let store = ArchiveStore::new(tmp.path());

        let mut tools = MockDatabaseTools::new();
        tools.expect_ping().returning(|_| Ok(()));
        tools.expect_count_rows().returning(|_, _| Ok(1));
        tools
            .expect_list_tables()
            .returning(|_| Ok(vec!["public.users".to_string()]));
        tools.expect_dump().returning(|_, _, dest| {
            fs::write(dest, b"").map_err(ToolError::Io)
        });

        let manager = BackupManager::new(&registry, &tools, &store);
        let err = manager
            .create_backup("production", &options(ArchiveFormat::PlainSql))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::EmptyArchive);
        assert!(leftovers(&store.env_dir("production")).is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_server_stops_before_dump() {
        let tmp = TempDir::new().unwrap();
        let registry = registry();
        let store = ArchiveStore::new(tmp.path());

        let mut tools = MockDatabaseTools::new();
        tools
            .expect_ping()
            .times(1)
            .returning(|_| Err(ToolError::Unavailable("Connection refused".to_string())));

        let manager = BackupManager::new(&registry, &tools, &store);
        let err = manager
            .create_backup("production", &options(ArchiveFormat::PlainSql))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConnectionUnavailable);
        assert_eq!(err.step(), Some("connect"));
        assert!(!err.to_string().contains("pw@"));
    }

    #[tokio::test]
    async fn test_failing_dump_tool() {
        let tmp = TempDir::new().unwrap();
        let registry = registry();
        let store = ArchiveStore::new(tmp.path());

        let mut tools = MockDatabaseTools::new();
        tools.expect_ping().returning(|_| Ok(()));
        tools.expect_count_rows().returning(|_, _| Ok(1));
        tools.expect_list_tables().returning(|_| Ok(Vec::new()));
        tools.expect_dump().returning(|_, _, _| {
            Err(ToolError::Failed {
                program: "pg_dump".to_string(),
                status: "exit status: 1".to_string(),
                stderr: "pg_dump: error: permission denied for table users".to_string(),
            })
        });

        let manager = BackupManager::new(&registry, &tools, &store);
        let err = manager
            .create_backup("production", &options(ArchiveFormat::PlainSql))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ToolFailed);
        assert_eq!(err.step(), Some("dump"));
    }

    #[tokio::test]
    async fn test_expected_role_is_checked_first() {
        let tmp = TempDir::new().unwrap();
        let registry = registry();
        let store = ArchiveStore::new(tmp.path());
        let tools = MockDatabaseTools::new();
        let manager = BackupManager::new(&registry, &tools, &store);

        let mut opts = options(ArchiveFormat::PlainSql);
        opts.expect_role = Some(Role::Production);
        let err = manager.create_backup("development", &opts).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RoleMismatch);
    }

    #[tokio::test]
    async fn test_unknown_environment() {
        let tmp = TempDir::new().unwrap();
        let registry = registry();
        let store = ArchiveStore::new(tmp.path());
        let tools = MockDatabaseTools::new();
        let manager = BackupManager::new(&registry, &tools, &store);

        let err = manager
            .create_backup("staging", &options(ArchiveFormat::PlainSql))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownEnvironment);
    }

    #[tokio::test]
    async fn test_destination_directory_and_retention() {
        let tmp = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let registry = registry();
        let tools = server();
        let store = ArchiveStore::new(tmp.path());
        let manager = BackupManager::new(&registry, &tools, &store);

        let mut opts = options(ArchiveFormat::PlainSql);
        opts.destination = Some(out.path().to_path_buf());
        let manifest = manager.create_backup("production", &opts).await.unwrap();

        assert_eq!(manifest.archive_path.parent(), Some(out.path()));
        assert!(BackupManifest::sidecar_path(&manifest.archive_path).exists());
        assert_eq!(store.latest("production").unwrap(), manifest.archive_path);

        let mut opts = options(ArchiveFormat::PlainSql);
        opts.keep = Some(1);
        for _ in 0..3 {
            manager.create_backup("production", &opts).await.unwrap();
        }
        let listed = manager.list_backups(Some("production")).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].1.len(), 1);
        assert_eq!(listed[0].1[0].path, store.latest("production").unwrap());
    }

    #[test]
    fn test_relative_destination_is_anchored_at_current_dir() {
        let generated = Path::new("/backups/production/production_20250101_120000.sql");
        let cwd = std::env::current_dir().unwrap();

        let plain = destination_path(Path::new("prod.sql"), generated, false).unwrap();
        assert!(plain.is_absolute());
        assert_eq!(plain, cwd.join("prod.sql"));

        let gzipped = destination_path(Path::new("prod.sql"), generated, true).unwrap();
        assert_eq!(gzipped, cwd.join("prod.sql.gz"));

        let kept = destination_path(Path::new("prod.sql.gz"), generated, true).unwrap();
        assert_eq!(kept, cwd.join("prod.sql.gz"));
    }

    #[tokio::test]
    async fn test_compressed_backup_to_path_without_extension() {
        let tmp = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let registry = registry();
        let tools = server();
        let store = ArchiveStore::new(tmp.path());
        let manager = BackupManager::new(&registry, &tools, &store);

        let mut opts = options(ArchiveFormat::PlainSql);
        opts.compress = true;
        opts.destination = Some(out.path().join("prod_backup"));
        let manifest = manager.create_backup("production", &opts).await.unwrap();

        assert_eq!(manifest.archive_path, out.path().join("prod_backup.gz"));
        assert!(plain_sql_has_definitions(&manifest.archive_path, true).unwrap());
        assert_eq!(store.latest("production").unwrap(), manifest.archive_path);
        assert!(leftovers(out.path()).is_empty());
    }
}
