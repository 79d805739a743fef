/// Archive store
///
/// Layout under the backups directory:
///
/// ```text
/// backups/<env>/<env>_<YYYYmmdd_HHMMSS>.<sql|sql.gz|dump|dir>
/// backups/<env>/<archive>.manifest.json
/// backups/<env>/latest          -> file name of the newest archive
/// ```
///
/// Artifacts are produced under a `.partial` name and only renamed once
/// verified, so an interrupted backup never becomes `latest`.

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::DbctlError;
use crate::utils::{LATEST_ALIAS, MANIFEST_SUFFIX, PARTIAL_SUFFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveFormat {
    /// SQL script replayed with psql
    PlainSql,
    /// pg_dump directory format
    Directory,
    /// pg_dump custom (compressed) format
    Custom,
}

impl ArchiveFormat {
    /// Value for `pg_dump --format`
    pub fn pg_dump_flag(&self) -> &'static str {
        match self {
            ArchiveFormat::PlainSql => "plain",
            ArchiveFormat::Directory => "directory",
            ArchiveFormat::Custom => "custom",
        }
    }

    pub fn extension(&self, compressed: bool) -> &'static str {
        match (self, compressed) {
            (ArchiveFormat::PlainSql, false) => "sql",
            (ArchiveFormat::PlainSql, true) => "sql.gz",
            (ArchiveFormat::Directory, _) => "dir",
            (ArchiveFormat::Custom, _) => "dump",
        }
    }

    /// Infer format and gzip compression from an archive's name
    pub fn detect(path: &Path) -> Option<(ArchiveFormat, bool)> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();

        if name.ends_with(".sql.gz") {
            Some((ArchiveFormat::PlainSql, true))
        } else if name.ends_with(".sql") {
            Some((ArchiveFormat::PlainSql, false))
        } else if name.ends_with(".dump") || name.ends_with(".backup") {
            Some((ArchiveFormat::Custom, false))
        } else if path.is_dir() || name.ends_with(".dir") {
            Some((ArchiveFormat::Directory, false))
        } else {
            None
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArchiveFormat::PlainSql => "plain-sql",
            ArchiveFormat::Directory => "directory",
            ArchiveFormat::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// Provenance record written next to every archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub created_at: DateTime<Utc>,
    pub source_environment: String,
    pub archive_path: PathBuf,
    pub format: ArchiveFormat,
    pub compressed: bool,
    pub table_count: usize,
    pub watched_row_counts: BTreeMap<String, u64>,
    #[serde(default)]
    pub missing_tables: Vec<String>,
    pub size_bytes: u64,
}

impl BackupManifest {
    pub fn sidecar_path(archive: &Path) -> PathBuf {
        append_suffix(archive, MANIFEST_SUFFIX)
    }

    /// Manifest stored next to `archive`, if there is one
    pub fn load_for(archive: &Path) -> Result<Option<Self>, DbctlError> {
        let path = Self::sidecar_path(archive);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)?;
        let manifest = serde_json::from_str(&content).map_err(|e| {
            DbctlError::Config(format!("unreadable manifest {}: {}", path.display(), e))
        })?;
        Ok(Some(manifest))
    }

    /// Write the sidecar atomically
    pub fn write(&self) -> Result<PathBuf, DbctlError> {
        let path = Self::sidecar_path(&self.archive_path);
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| DbctlError::Config(format!("cannot serialize manifest: {}", e)))?;
        write_atomic(&path, content.as_bytes())?;
        Ok(path)
    }

    /// Tables the manifest knows about, counted or not
    pub fn watch_list(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.watched_row_counts.keys().cloned().collect();
        tables.extend(self.missing_tables.iter().cloned());
        tables
    }

    pub fn total_watched_rows(&self) -> u64 {
        self.watched_row_counts.values().sum()
    }
}

/// An archive found on disk
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    pub manifest: Option<BackupManifest>,
    pub size_bytes: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl ArchiveEntry {
    fn sort_key(&self) -> Option<DateTime<Utc>> {
        self.manifest
            .as_ref()
            .map(|m| m.created_at)
            .or(self.modified)
    }
}

pub struct ArchiveStore {
    root: PathBuf,
}

impl ArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn env_dir(&self, env: &str) -> PathBuf {
        self.root.join(env)
    }

    /// Fresh archive path for `env`; never returns an existing path
    pub fn archive_path(
        &self,
        env: &str,
        format: ArchiveFormat,
        compressed: bool,
        at: DateTime<Utc>,
    ) -> PathBuf {
        let dir = self.env_dir(env);
        let stamp = at.format("%Y%m%d_%H%M%S");
        let ext = format.extension(compressed);

        let mut path = dir.join(format!("{}_{}.{}", env, stamp, ext));
        let mut n = 2;
        while path.exists() || partial_path(&path).exists() {
            path = dir.join(format!("{}_{}-{}.{}", env, stamp, n, ext));
            n += 1;
        }
        path
    }

    fn alias_path(&self, env: &str) -> PathBuf {
        self.env_dir(env).join(LATEST_ALIAS)
    }

    /// Point the environment's `latest` alias at `archive`
    pub fn set_latest(&self, env: &str, archive: &Path) -> Result<(), DbctlError> {
        let dir = self.env_dir(env);
        fs::create_dir_all(&dir).map_err(|source| DbctlError::ArchiveWriteFailed {
            path: dir.clone(),
            source,
        })?;

        // Archives inside the store are recorded by name so the directory can move
        let target = match archive.parent() {
            Some(parent) if parent == dir => archive
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| archive.to_path_buf()),
            _ => archive.to_path_buf(),
        };

        write_atomic(&self.alias_path(env), target.to_string_lossy().as_bytes())
    }

    /// Archive the `latest` alias points at
    pub fn latest(&self, env: &str) -> Result<PathBuf, DbctlError> {
        let alias = self.alias_path(env);
        let target = fs::read_to_string(&alias).map_err(|_| {
            DbctlError::ArchiveNotFound(format!("no backups recorded for environment '{}'", env))
        })?;

        let target = PathBuf::from(target.trim());
        let path = if target.is_absolute() {
            target
        } else {
            self.env_dir(env).join(target)
        };

        if !path.exists() {
            return Err(DbctlError::ArchiveNotFound(format!(
                "latest backup of '{}' points at {}, which no longer exists",
                env,
                path.display()
            )));
        }
        Ok(path)
    }

    /// Environments that have a directory in the store
    pub fn environments(&self) -> Result<Vec<String>, DbctlError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut names: Vec<String> = fs::read_dir(&self.root)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Complete archives of `env`, newest first
    pub fn list(&self, env: &str) -> Result<Vec<ArchiveEntry>, DbctlError> {
        let dir = self.env_dir(env);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)?.filter_map(|e| e.ok()) {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();

            if name == LATEST_ALIAS
                || name.ends_with(MANIFEST_SUFFIX)
                || name.ends_with(PARTIAL_SUFFIX)
                || name.starts_with('.')
                || ArchiveFormat::detect(&path).is_none()
            {
                continue;
            }

            let manifest = match BackupManifest::load_for(&path) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(archive = %path.display(), error = %e, "ignoring manifest");
                    None
                }
            };

            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from);

            entries.push(ArchiveEntry {
                size_bytes: artifact_size(&path).unwrap_or(0),
                path,
                manifest,
                modified,
            });
        }

        entries.sort_by(|a, b| {
            b.sort_key()
                .cmp(&a.sort_key())
                .then_with(|| b.path.cmp(&a.path))
        });
        Ok(entries)
    }

    /// Remove all but the `keep` newest archives of `env`. The archive the
    /// `latest` alias points at is never removed.
    pub fn prune(&self, env: &str, keep: usize) -> Result<Vec<PathBuf>, DbctlError> {
        let latest = self.latest(env).ok();
        let mut removed = Vec::new();

        for entry in self.list(env)?.into_iter().skip(keep) {
            if latest.as_deref() == Some(entry.path.as_path()) {
                continue;
            }
            remove_artifact(&entry.path)?;
            remove_artifact(&BackupManifest::sidecar_path(&entry.path))?;
            removed.push(entry.path);
        }

        Ok(removed)
    }
}

pub(crate) fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

/// Name an artifact carries until it is complete
pub fn partial_path(path: &Path) -> PathBuf {
    append_suffix(path, PARTIAL_SUFFIX)
}

/// Write a file through a temporary sibling and rename it into place
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), DbctlError> {
    let write_failed = |source| DbctlError::ArchiveWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_failed)?;
    }

    let tmp = append_suffix(path, ".tmp");
    fs::write(&tmp, contents).map_err(write_failed)?;
    fs::rename(&tmp, path).map_err(write_failed)?;
    Ok(())
}

/// Size of a file, or the total size of a directory's files
pub fn artifact_size(path: &Path) -> io::Result<u64> {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    if !metadata.is_dir() {
        return Ok(metadata.len());
    }

    let mut total = 0;
    for entry in fs::read_dir(path)? {
        total += artifact_size(&entry?.path())?;
    }
    Ok(total)
}

/// Remove a file or directory; a missing path is not an error
pub fn remove_artifact(path: &Path) -> Result<(), DbctlError> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(DbctlError::ArchiveWriteFailed {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Gzip `src` into `dest`
pub fn gzip_file(src: &Path, dest: &Path) -> io::Result<()> {
    let mut input = fs::File::open(src)?;
    let mut encoder = GzEncoder::new(fs::File::create(dest)?, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?.sync_all()
}

/// Decompress a gzip file into `dest`
pub fn gunzip_file(src: &Path, dest: &Path) -> io::Result<()> {
    let mut decoder = GzDecoder::new(fs::File::open(src)?);
    let mut output = fs::File::create(dest)?;
    io::copy(&mut decoder, &mut output)?;
    Ok(())
}

/// Whether a plain SQL dump defines at least one object
pub fn plain_sql_has_definitions(path: &Path, compressed: bool) -> io::Result<bool> {
    let file = fs::File::open(path)?;
    let reader: Box<dyn Read> = if compressed {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    for line in BufReader::new(reader).lines() {
        let line = line?;
        let statement = line.trim_start().to_uppercase();
        if statement.starts_with("CREATE ") {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Whether a `pg_restore --list` table of contents defines at least one object
pub fn toc_has_definitions(entries: &[String]) -> bool {
    const KINDS: &[&str] = &[
        " TABLE ", " VIEW ", " SEQUENCE ", " FUNCTION ", " TYPE ", " SCHEMA ",
    ];

    entries
        .iter()
        .map(|e| e.trim())
        .filter(|e| !e.is_empty() && !e.starts_with(';'))
        .any(|e| KINDS.iter().any(|kind| e.contains(kind)))
}
