/// CLI argument parsing

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use dbctl::core::archive::ArchiveFormat;
use dbctl::core::registry::Role;

// Build timestamp injected at compile time
pub const VERSION_WITH_BUILD: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (built: ",
    env!("BUILD_TIMESTAMP"),
    ")"
);

#[derive(Parser)]
#[command(name = "dbctl")]
#[command(author, version = VERSION_WITH_BUILD, about, long_about = None)]
pub struct Cli {
    /// Settings file (default: dbctl.toml in this or a parent directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Backup operations
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },

    /// Restore an archive into an environment
    Restore(RestoreArgs),

    /// Schema migrations
    Migrate {
        #[command(subcommand)]
        command: MigrateCommands,
    },

    /// Run the application against an environment
    Run {
        /// Environment name
        env: String,

        /// Port to serve on (default: the environment's port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Stop the application listening on an environment's port
    Stop {
        /// Environment name
        env: String,

        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum BackupCommands {
    /// Dump an environment's database
    Create {
        /// Environment to back up
        #[arg(short, long)]
        env: String,

        /// Archive format (default from settings)
        #[arg(short, long, value_enum)]
        format: Option<ArchiveFormat>,

        /// Write the archive to this file or directory
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Gzip plain SQL archives
        #[arg(long)]
        compress: bool,

        /// Do not gzip, even when the settings ask for it
        #[arg(long, conflicts_with = "compress")]
        no_compress: bool,

        /// Fail unless the environment has this role
        #[arg(long, value_enum)]
        expect_role: Option<Role>,

        /// Keep only the N newest archives of this environment
        #[arg(long)]
        keep: Option<usize>,
    },

    /// List archives, newest first
    List {
        /// Only this environment
        #[arg(short, long)]
        env: Option<String>,
    },
}

/// Command-line override of the `compress` setting
pub fn compress_override(compress: bool, no_compress: bool) -> Option<bool> {
    match (compress, no_compress) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

#[derive(Args)]
pub struct RestoreArgs {
    /// Environment to restore into
    #[arg(short, long)]
    pub env: String,

    /// Archive file or directory
    #[arg(short, long, conflicts_with = "from")]
    pub archive: Option<PathBuf>,

    /// Use the latest backup of this environment (default: the target itself)
    #[arg(long)]
    pub from: Option<String>,

    /// Allow restoring into a production environment
    #[arg(long)]
    pub force: bool,

    /// Do not ask for confirmation
    #[arg(short, long)]
    pub yes: bool,

    /// Drop and recreate the database first
    #[arg(long)]
    pub recreate: bool,
}

#[derive(Args)]
pub struct MigrationTarget {
    /// Environment to migrate
    #[arg(short, long)]
    pub env: String,

    /// Directory holding the migration units (default from settings)
    #[arg(short, long)]
    pub dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum MigrateCommands {
    /// Apply pending migrations
    Up {
        #[command(flatten)]
        target: MigrationTarget,

        /// Apply only this migration (id or sequence number)
        #[arg(long)]
        only: Option<String>,

        /// Apply at most N migrations
        #[arg(long, conflicts_with = "only")]
        steps: Option<usize>,

        /// Re-apply migrations that are already applied
        #[arg(long)]
        force: bool,
    },

    /// Revert applied migrations (the newest one by default)
    Down {
        #[command(flatten)]
        target: MigrationTarget,

        /// Revert only this migration (id or sequence number)
        #[arg(long)]
        only: Option<String>,

        /// Revert the N newest migrations
        #[arg(long, conflicts_with = "only")]
        steps: Option<usize>,
    },

    /// Show which migrations are applied
    Status {
        #[command(flatten)]
        target: MigrationTarget,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show settings and environments with credentials masked
    View,

    /// Check settings, env files and environment roles
    Validate,
}
