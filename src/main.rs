mod cli;

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use cli::{BackupCommands, Cli, Commands, ConfigCommands, MigrateCommands, RestoreArgs};
use dbctl::core::backup::BackupOptions;
use dbctl::core::migrate::{self, Direction, MigrationOptions, MigrationUnit, ProcessExecutor};
use dbctl::core::restore::{ArchiveRef, RestoreOptions, RestoreResult, TerminalConfirm};
use dbctl::core::{
    AppLauncher, ArchiveStore, BackupManager, EnvFile, EnvironmentRegistry, MigrationRunner,
    PgTools, RestoreManager,
};
use dbctl::utils::{format_bytes, truncate_string, AppConfig};
use dbctl::DbctlError;

/// Everything a command needs, loaded once per invocation
struct Workspace {
    settings: AppConfig,
    registry: EnvironmentRegistry,
    store: ArchiveStore,
    tools: PgTools,
}

impl Workspace {
    fn load(config: Option<PathBuf>) -> Result<Self> {
        let settings = AppConfig::load(config.as_deref())?;
        match &settings.source {
            Some(path) => debug!(settings = %path.display(), "loaded settings"),
            None => debug!("no settings file found, using defaults"),
        }

        let registry = EnvironmentRegistry::load(&settings);
        let store = ArchiveStore::new(settings.backups_path());
        let tools = PgTools::new(settings.tools.clone());

        Ok(Self {
            settings,
            registry,
            store,
            tools,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "dbctl=debug" } else { "dbctl=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let ws = Workspace::load(cli.config)?;

    match cli.command {
        Commands::Backup { command } => handle_backup(command, &ws).await,
        Commands::Restore(args) => handle_restore(args, &ws).await,
        Commands::Migrate { command } => handle_migrate(command, &ws).await,
        Commands::Run { env, port } => handle_run(&env, port, &ws).await,
        Commands::Stop { env, port } => handle_stop(&env, port, &ws).await,
        Commands::Config { command } => handle_config(command, &ws),
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<DbctlError>()
        .map(DbctlError::exit_code)
        .unwrap_or(1)
}

fn report_error(err: &anyhow::Error) {
    let Some(e) = err.downcast_ref::<DbctlError>() else {
        eprintln!("{} {:#}", "✗".red(), err);
        return;
    };

    eprintln!("{} {}", "✗".red(), e);

    match e {
        DbctlError::Restore {
            report,
            destructive,
            ..
        } => {
            print_counts(report);
            if *destructive {
                eprintln!(
                    "{} The target database may be partially restored. Re-run the restore, or use --recreate.",
                    "⚠".yellow()
                );
            }
        }
        DbctlError::MigrationFailed { completed, .. } if !completed.is_empty() => {
            eprintln!("  Completed before the failure: {}", completed.join(", "));
        }
        _ => {}
    }
}

fn spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

fn elapsed(started: Instant) -> String {
    let millis = started.elapsed().as_millis() as u64;
    humantime::format_duration(Duration::from_millis(millis)).to_string()
}

async fn handle_backup(command: BackupCommands, ws: &Workspace) -> Result<()> {
    let manager = BackupManager::new(&ws.registry, &ws.tools, &ws.store);

    match command {
        BackupCommands::Create {
            env,
            format,
            out,
            compress,
            no_compress,
            expect_role,
            keep,
        } => {
            let mut options = BackupOptions::from_config(&ws.settings);
            if let Some(format) = format {
                options.format = format;
            }
            options.destination = out;
            if let Some(compress) = cli::compress_override(compress, no_compress) {
                options.compress = compress;
            }
            options.expect_role = expect_role;
            if keep.is_some() {
                options.keep = keep;
            }

            let started = Instant::now();
            let pb = spinner(format!("Backing up {}...", env));
            let result = manager.create_backup(&env, &options).await;
            pb.finish_and_clear();
            let manifest = result?;

            println!(
                "{} Backup of {} written to {}",
                "✓".green(),
                env.bold(),
                manifest.archive_path.display()
            );
            println!(
                "  {} {}, {} tables, {} in {}",
                manifest.format,
                if manifest.compressed { "(gzip)" } else { "" },
                manifest.table_count,
                format_bytes(manifest.size_bytes),
                elapsed(started)
            );
            for (table, rows) in &manifest.watched_row_counts {
                println!("  {:<28} {:>10}", table, rows);
            }
            for table in &manifest.missing_tables {
                println!("  {:<28} {:>10}", table, "missing".yellow());
            }
        }
        BackupCommands::List { env } => {
            let listing = manager.list_backups(env.as_deref())?;
            if listing.iter().all(|(_, entries)| entries.is_empty()) {
                println!("No backups found in {}", ws.store.root().display());
                return Ok(());
            }

            for (env, entries) in listing {
                if entries.is_empty() {
                    continue;
                }
                let latest = ws.store.latest(&env).ok();

                println!("\n{}", env.bold());
                println!(
                    "  {:<2}{:<21} {:<10} {:>10} {:>12}  {}",
                    "", "Created", "Format", "Size", "Rows", "Archive"
                );
                println!("  {}", "-".repeat(80));

                for entry in entries {
                    let marker = if latest.as_ref() == Some(&entry.path) { "*" } else { "" };
                    let created = entry
                        .manifest
                        .as_ref()
                        .map(|m| m.created_at)
                        .or(entry.modified)
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    let format = entry
                        .manifest
                        .as_ref()
                        .map(|m| m.format.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    let rows = entry
                        .manifest
                        .as_ref()
                        .map(|m| m.total_watched_rows().to_string())
                        .unwrap_or_else(|| "-".to_string());
                    let name = entry
                        .path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();

                    println!(
                        "  {:<2}{:<21} {:<10} {:>10} {:>12}  {}",
                        marker,
                        created,
                        format,
                        format_bytes(entry.size_bytes),
                        rows,
                        name
                    );
                }
            }
        }
    }

    Ok(())
}

async fn handle_restore(args: RestoreArgs, ws: &Workspace) -> Result<()> {
    let archive = match (args.archive, args.from) {
        (Some(path), _) => ArchiveRef::Path(path),
        (None, Some(source)) => ArchiveRef::Latest(source),
        (None, None) => ArchiveRef::Latest(args.env.clone()),
    };
    let options = RestoreOptions {
        force: args.force,
        assume_yes: args.yes,
        recreate: args.recreate,
        watch_tables: ws.settings.watch_tables.clone(),
    };

    let confirm = TerminalConfirm;
    let manager = RestoreManager::new(&ws.registry, &ws.tools, &ws.store, &confirm);

    let started = Instant::now();
    // The confirmation prompt and a spinner would fight over the terminal
    let pb = options
        .assume_yes
        .then(|| spinner(format!("Restoring into {}...", args.env)));
    let result = manager.restore(&args.env, &archive, &options).await;
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
    let result = result?;

    println!(
        "{} Restored {} into {} in {}",
        "✓".green(),
        result.archive.display(),
        args.env.bold(),
        elapsed(started)
    );
    print_counts(&result);

    Ok(())
}

fn print_counts(result: &RestoreResult) {
    let expected: BTreeMap<String, u64> = result
        .manifest
        .as_ref()
        .map(|m| m.watched_row_counts.clone())
        .unwrap_or_default();
    let pre = result.pre_counts.clone().unwrap_or_default();

    let mut tables: Vec<&String> = expected
        .keys()
        .chain(pre.keys())
        .chain(result.post_counts.keys())
        .collect();
    tables.sort();
    tables.dedup();

    if !tables.is_empty() {
        println!(
            "  {:<28} {:>10} {:>10} {:>10}",
            "Table", "Backup", "Before", "After"
        );
        let show = |counts: &BTreeMap<String, u64>, table: &String| {
            counts
                .get(table)
                .map(u64::to_string)
                .unwrap_or_else(|| "-".to_string())
        };
        for table in tables {
            println!(
                "  {:<28} {:>10} {:>10} {:>10}",
                table,
                show(&expected, table),
                show(&pre, table),
                show(&result.post_counts, table)
            );
        }
    }

    for warning in &result.warnings {
        println!("  {} {}", "⚠".yellow(), warning);
    }
}

async fn handle_migrate(command: MigrateCommands, ws: &Workspace) -> Result<()> {
    let (direction, target, only, steps, force) = match command {
        MigrateCommands::Up {
            target,
            only,
            steps,
            force,
        } => (Direction::Up, target, only, steps, force),
        MigrateCommands::Down {
            target,
            only,
            steps,
        } => (Direction::Down, target, only, steps, false),
        MigrateCommands::Status { target } => {
            return show_migration_status(&target.env, target.dir, ws);
        }
    };

    let env = ws.registry.resolve(&target.env)?;
    let dir = migrations_dir(target.dir, ws);
    let units = migrate::discover(&dir)?;

    let executor = ProcessExecutor::new(&ws.tools, &ws.settings.migrations)
        .with_workdir(ws.settings.base_dir.clone());
    let runner = MigrationRunner::new(&ws.registry, &executor, ws.settings.state_path());
    let applied = runner.ledger(&env.name).applied()?;

    let selected: Vec<&MigrationUnit> = match &only {
        Some(key) => vec![migrate::find(&units, key)?],
        None => migrate::plan(direction, &units, &applied, steps),
    };

    if selected.is_empty() {
        match direction {
            Direction::Up => println!("No pending migrations - {} is up to date", env.name),
            Direction::Down => println!("No applied migrations to revert on {}", env.name),
        }
        return Ok(());
    }

    println!(
        "Running {} migration(s) {} on {} ({})",
        selected.len(),
        direction,
        env.name.bold(),
        env.connection.masked()
    );

    let started = Instant::now();
    let records = runner
        .apply(direction, &env.name, &selected, &MigrationOptions { force })
        .await?;

    for record in &records {
        println!("  {} {} {}", "✓".green(), direction, record.id);
    }
    println!("Done in {}", elapsed(started));

    Ok(())
}

fn migrations_dir(dir: Option<PathBuf>, ws: &Workspace) -> PathBuf {
    dir.unwrap_or_else(|| ws.settings.resolve_path(&ws.settings.migrations.dir))
}

fn show_migration_status(env_name: &str, dir: Option<PathBuf>, ws: &Workspace) -> Result<()> {
    let units = migrate::discover(&migrations_dir(dir, ws))?;

    let executor = ProcessExecutor::new(&ws.tools, &ws.settings.migrations);
    let runner = MigrationRunner::new(&ws.registry, &executor, ws.settings.state_path());
    let statuses = runner.status(env_name, &units)?;

    if statuses.is_empty() {
        println!("No migrations found");
        return Ok(());
    }

    println!("\nMigrations for {}:", env_name.bold());
    println!("{:<32} {:<28} Applied", "Id", "Name");
    println!("{}", "=".repeat(80));

    for status in &statuses {
        let applied = match status.applied_at {
            Some(at) => at.format("%Y-%m-%d %H:%M:%S UTC").to_string().green(),
            None => "pending".yellow(),
        };
        let missing = if status.on_disk { "" } else { " (file missing)" };
        println!(
            "{:<32} {:<28} {}{}",
            status.id,
            truncate_string(&status.name, 28),
            applied,
            missing.red()
        );
    }

    let pending = statuses.iter().filter(|s| s.applied_at.is_none()).count();
    println!("\nTotal: {} migration(s), {} pending", statuses.len(), pending);

    Ok(())
}

fn launcher(ws: &Workspace) -> AppLauncher {
    let mut app = ws.settings.app.clone();
    let workdir = app.workdir.clone().unwrap_or_else(|| PathBuf::from("."));
    app.workdir = Some(ws.settings.resolve_path(&workdir));
    AppLauncher::new(app, &ws.settings.tools)
}

async fn handle_run(env_name: &str, port: Option<u16>, ws: &Workspace) -> Result<()> {
    let env = ws.registry.resolve(env_name)?;
    let launcher = launcher(ws);
    let plan = launcher.plan(env, port)?;

    println!(
        "Starting {} on port {} against {}",
        env.name.bold(),
        plan.port,
        env.connection.masked()
    );
    println!("  {}", plan.display().dimmed());

    let status = launcher.start(&plan).await?;
    if !status.success() {
        return Err(DbctlError::ToolFailed {
            program: plan.program.clone(),
            stderr: format!("application exited with {}", status),
        }
        .into());
    }

    Ok(())
}

async fn handle_stop(env_name: &str, port: Option<u16>, ws: &Workspace) -> Result<()> {
    let env = ws.registry.resolve(env_name)?;
    let stopped = launcher(ws).stop(env, port).await?;

    if stopped.is_empty() {
        println!("Nothing is running for {}", env.name);
    } else {
        let pids: Vec<String> = stopped.iter().map(u32::to_string).collect();
        println!("{} Stopped {} (pid {})", "✓".green(), env.name, pids.join(", "));
    }

    Ok(())
}

fn handle_config(command: ConfigCommands, ws: &Workspace) -> Result<()> {
    match command {
        ConfigCommands::View => {
            let settings = &ws.settings;
            let source = settings
                .source
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(defaults)".to_string());

            println!("Settings: {}\n", source);
            println!("{:<16} {}", "backups_dir", settings.backups_path().display());
            println!("{:<16} {}", "state_dir", settings.state_path().display());
            println!("{:<16} {}", "format", settings.default_format);
            println!("{:<16} {}", "compress", settings.compress);
            println!("{:<16} {}", "watch_tables", settings.watch_tables.join(", "));
            println!(
                "{:<16} {}",
                "migrations",
                settings.resolve_path(&settings.migrations.dir).display()
            );
            println!("{:<16} {}", "app", settings.app.command.join(" "));

            println!("\nEnvironments:");
            for env in ws.registry.environments() {
                let port = env
                    .app_port
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  {:<14} {:<12} port {:<6} {}",
                    env.name.bold(),
                    env.role,
                    port,
                    env.connection.masked()
                );
            }
            for (name, err) in ws.registry.unavailable() {
                println!("  {:<14} {}", name.bold(), err.to_string().red());
            }

            for (name, cfg) in &settings.environments {
                let Some(env_file) = &cfg.env_file else {
                    continue;
                };
                let path = settings.resolve_path(env_file);
                let Ok(file) = EnvFile::load(&path) else {
                    continue;
                };

                println!("\n{} ({}):", name.bold(), file.path().display());
                for (key, value) in file.masked_entries() {
                    println!("  {}={}", key, value);
                }
            }
        }
        ConfigCommands::Validate => {
            let mut errors = ws.settings.validate();
            errors.extend(ws.registry.validate());

            if errors.is_empty() {
                println!("{} Configuration is valid", "✓".green());
            } else {
                println!("{} Configuration errors:", "✗".red());
                for error in &errors {
                    println!("  - {}", error);
                }
                return Err(DbctlError::Config(format!("{} problem(s) found", errors.len())).into());
            }
        }
    }

    Ok(())
}
