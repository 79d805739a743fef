pub mod app_process;
pub mod archive;
pub mod backup;
pub mod config;
pub mod connection;
pub mod migrate;
pub mod postgres;
pub mod registry;
pub mod restore;

#[cfg(test)]
pub(crate) mod testing;

pub use app_process::AppLauncher;
pub use archive::ArchiveStore;
pub use backup::BackupManager;
pub use config::EnvFile;
pub use migrate::MigrationRunner;
pub use postgres::PgTools;
pub use registry::EnvironmentRegistry;
pub use restore::RestoreManager;
