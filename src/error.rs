//! Error types shared by every dbctl operation

use std::path::PathBuf;
use thiserror::Error;

use crate::core::restore::RestoreResult;

/// Failure kinds, independent of the context an error was wrapped in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MalformedConnectionString,
    UnknownEnvironment,
    RoleMismatch,
    ConnectionUnavailable,
    EmptyArchive,
    ArchiveWriteFailed,
    SuspectedRestoreFailure,
    AlreadyApplied,
    NotApplied,
    Irreversible,
    MigrationFailed,
    ArchiveNotFound,
    UserAborted,
    ToolFailed,
    Config,
    Io,
}

#[derive(Error, Debug)]
pub enum DbctlError {
    #[error("malformed connection string: {0}")]
    MalformedConnectionString(String),

    #[error("unknown environment '{name}' (known: {known})")]
    UnknownEnvironment { name: String, known: String },

    #[error("role check failed for environment '{env}': {reason}")]
    RoleMismatch { env: String, reason: String },

    #[error("cannot reach the database of environment '{env}': {cause}")]
    ConnectionUnavailable { env: String, cause: String },

    #[error("dump of '{env}' produced an empty archive ({})", .path.display())]
    EmptyArchive { env: String, path: PathBuf },

    #[error("failed to write {}: {source}", .path.display())]
    ArchiveWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("restore into '{env}' looks failed: watched tables are empty but the backup recorded {expected} rows")]
    SuspectedRestoreFailure { env: String, expected: u64 },

    #[error("migration {0} is already applied (use --force to re-apply)")]
    AlreadyApplied(String),

    #[error("migration {0} has never been applied")]
    NotApplied(String),

    #[error("migration {0} has no down procedure")]
    Irreversible(String),

    #[error("migration {id} failed while running {direction}: {cause}")]
    MigrationFailed {
        id: String,
        direction: String,
        cause: String,
        completed: Vec<String>,
    },

    #[error("archive not found: {0}")]
    ArchiveNotFound(String),

    #[error("aborted: {0}")]
    UserAborted(String),

    #[error("{program} failed: {stderr}")]
    ToolFailed { program: String, stderr: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backup of '{env}' failed at step '{step}': {source}")]
    Backup {
        env: String,
        step: &'static str,
        #[source]
        source: Box<DbctlError>,
    },

    #[error("restore into '{env}' failed at step '{step}' ({}): {source}", destructive_note(.destructive))]
    Restore {
        env: String,
        step: &'static str,
        destructive: bool,
        report: Box<RestoreResult>,
        #[source]
        source: Box<DbctlError>,
    },
}

fn destructive_note(destructive: &bool) -> &'static str {
    if *destructive {
        "the target database was already modified"
    } else {
        "no destructive action was taken"
    }
}

impl DbctlError {
    /// Kind of the innermost error, looking through step wrappers
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbctlError::MalformedConnectionString(_) => ErrorKind::MalformedConnectionString,
            DbctlError::UnknownEnvironment { .. } => ErrorKind::UnknownEnvironment,
            DbctlError::RoleMismatch { .. } => ErrorKind::RoleMismatch,
            DbctlError::ConnectionUnavailable { .. } => ErrorKind::ConnectionUnavailable,
            DbctlError::EmptyArchive { .. } => ErrorKind::EmptyArchive,
            DbctlError::ArchiveWriteFailed { .. } => ErrorKind::ArchiveWriteFailed,
            DbctlError::SuspectedRestoreFailure { .. } => ErrorKind::SuspectedRestoreFailure,
            DbctlError::AlreadyApplied(_) => ErrorKind::AlreadyApplied,
            DbctlError::NotApplied(_) => ErrorKind::NotApplied,
            DbctlError::Irreversible(_) => ErrorKind::Irreversible,
            DbctlError::MigrationFailed { .. } => ErrorKind::MigrationFailed,
            DbctlError::ArchiveNotFound(_) => ErrorKind::ArchiveNotFound,
            DbctlError::UserAborted(_) => ErrorKind::UserAborted,
            DbctlError::ToolFailed { .. } => ErrorKind::ToolFailed,
            DbctlError::Config(_) => ErrorKind::Config,
            DbctlError::Io(_) => ErrorKind::Io,
            DbctlError::Backup { source, .. } => source.kind(),
            DbctlError::Restore { source, .. } => source.kind(),
        }
    }

    /// Process exit code for this failure
    pub fn exit_code(&self) -> u8 {
        match self.kind() {
            ErrorKind::ToolFailed | ErrorKind::Io => 1,
            ErrorKind::MalformedConnectionString
            | ErrorKind::UnknownEnvironment
            | ErrorKind::Config => 2,
            ErrorKind::RoleMismatch => 3,
            ErrorKind::UserAborted => 4,
            ErrorKind::ConnectionUnavailable => 5,
            ErrorKind::ArchiveNotFound => 6,
            ErrorKind::EmptyArchive | ErrorKind::ArchiveWriteFailed => 7,
            ErrorKind::SuspectedRestoreFailure => 8,
            ErrorKind::AlreadyApplied | ErrorKind::NotApplied | ErrorKind::Irreversible => 9,
            ErrorKind::MigrationFailed => 10,
        }
    }

    /// Whether a restore had already modified its target when it failed
    pub fn destructive_action_taken(&self) -> bool {
        matches!(self, DbctlError::Restore { destructive: true, .. })
    }

    /// Step at which a backup or restore failed
    pub fn step(&self) -> Option<&'static str> {
        match self {
            DbctlError::Backup { step, .. } | DbctlError::Restore { step, .. } => Some(step),
            _ => None,
        }
    }
}
