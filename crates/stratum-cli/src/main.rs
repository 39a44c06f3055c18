mod render;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stratum_common::Version;
use stratum_config::{AppConfig, ConfigLoader, LedgerBackend, LogConfig};
use stratum_db::migrations::{load_dir, scaffold};
use stratum_db::{
    JsonFileLedger, Ledger, MemoryLedger, MemoryStore, Migration, MigrationRunner, RevertTarget,
    RunReport, SqliteLedger, SqliteStore, Store, status,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stratum", version, about = "Versioned, reversible collection schema migrations")]
struct Cli {
    /// Config file (YAML or TOML). Defaults to ~/.stratum/config.yml
    #[arg(short, long, global = true, env = "STRATUM_CONFIG")]
    config: Option<PathBuf>,

    /// Record store database, overriding the config file
    #[arg(long, global = true, env = "STRATUM_DB")]
    db: Option<PathBuf>,

    /// Directory holding `<version>_<name>.json` migrations
    #[arg(long, global = true, env = "STRATUM_MIGRATIONS_DIR")]
    migrations_dir: Option<PathBuf>,

    /// Log filter, overriding the config file (RUST_LOG wins over both)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply, revert and inspect schema migrations
    #[command(subcommand)]
    Migrate(MigrateCommand),
}

#[derive(Subcommand)]
enum MigrateCommand {
    /// Apply pending migrations in version order
    Up {
        /// Stop after this version
        #[arg(long)]
        to: Option<Version>,
        /// Run against an in-memory copy and leave the store untouched
        #[arg(long)]
        dry_run: bool,
    },
    /// Revert applied migrations, newest first
    Down {
        /// Number of migrations to revert (default 1)
        #[arg(long, conflicts_with = "to")]
        count: Option<usize>,
        /// Revert every migration newer than this version
        #[arg(long)]
        to: Option<Version>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Show applied and pending migrations
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Scaffold a new migration file
    Create {
        /// Lowercase name, e.g. created_harvests
        name: String,
    },
    /// Release a migration lock left behind by a crashed run
    Unlock,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = load_config(&cli)?;
    init_tracing(&config.log);

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current migration");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let Commands::Migrate(command) = cli.command;
    tokio::task::spawn_blocking(move || execute(command, &config, cancel))
        .await
        .context("migration task panicked")?
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let loader = match &cli.config {
        Some(path) => ConfigLoader::new(path),
        None => ConfigLoader::from_default_location()?,
    };
    let mut config = loader
        .load()
        .with_context(|| format!("failed to load config from {}", loader.path().display()))?;

    if let Some(db) = &cli.db {
        config.database.path = db.clone();
    }
    if let Some(dir) = &cli.migrations_dir {
        config.migrations.dir = dir.clone();
    }
    if let Some(level) = &cli.log_level {
        config.log.level = level.clone();
    }
    Ok(config)
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_ledger(config: &AppConfig) -> Result<Box<dyn Ledger>> {
    let path = config.ledger_path();
    let ledger: Box<dyn Ledger> = match config.ledger.backend {
        LedgerBackend::Sqlite => Box::new(
            SqliteLedger::open(&path)
                .with_context(|| format!("failed to open ledger in {}", path.display()))?,
        ),
        LedgerBackend::Json => Box::new(
            JsonFileLedger::open(&path)
                .with_context(|| format!("failed to open ledger {}", path.display()))?,
        ),
    };
    Ok(ledger)
}

fn load_units(config: &AppConfig) -> Result<Vec<Migration>> {
    let units = load_dir(&config.migrations.dir).with_context(|| {
        format!("failed to load migrations from {}", config.migrations.dir.display())
    })?;
    info!("found {} migration(s) in {}", units.len(), config.migrations.dir.display());
    Ok(units)
}

fn open_store(config: &AppConfig) -> Result<SqliteStore> {
    SqliteStore::open(&config.database.path)
        .with_context(|| format!("failed to open {}", config.database.path.display()))
}

/// A run over the loaded units.
enum Plan<'a> {
    Up {
        units: &'a [Migration],
        to: Option<Version>,
    },
    Down {
        units: &'a [Migration],
        target: RevertTarget,
    },
}

impl Plan<'_> {
    fn run<S: Store>(&self, runner: &MigrationRunner<'_, S>) -> stratum_common::Result<RunReport> {
        match self {
            Plan::Up { units, to } => runner.apply_all(units, *to),
            Plan::Down { units, target } => runner.revert(units, *target),
        }
    }
}

fn execute(command: MigrateCommand, config: &AppConfig, cancel: Arc<AtomicBool>) -> Result<ExitCode> {
    match command {
        MigrateCommand::Up { to, dry_run } => {
            let units = load_units(config)?;
            run(config, dry_run, cancel, Plan::Up { units: &units, to })
        }
        MigrateCommand::Down { count, to, dry_run } => {
            let units = load_units(config)?;
            let target = match (count, to) {
                (_, Some(version)) => RevertTarget::To(version),
                (Some(n), None) => RevertTarget::Count(n),
                (None, None) => RevertTarget::default(),
            };
            run(config, dry_run, cancel, Plan::Down { units: &units, target })
        }
        MigrateCommand::Status { json } => {
            let units = load_units(config)?;
            let ledger = open_ledger(config)?;
            let rows = status(&units, ledger.as_ref())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print!("{}", render::status_table(&rows));
            }
            Ok(ExitCode::SUCCESS)
        }
        MigrateCommand::Create { name } => {
            let path = scaffold(&config.migrations.dir, &name)
                .with_context(|| format!("failed to create migration `{name}`"))?;
            println!("created {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        MigrateCommand::Unlock => {
            let store = open_store(config)?;
            match store.force_unlock()? {
                Some(holder) => println!("released migration lock held by {holder}"),
                None => println!("no migration lock was held"),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Run `plan` against the real store, or against in-memory copies of the
/// store and ledger when `dry_run` is set.
fn run(config: &AppConfig, dry_run: bool, cancel: Arc<AtomicBool>, plan: Plan<'_>) -> Result<ExitCode> {
    let store = open_store(config)?;
    let ledger = open_ledger(config)?;

    let report = if dry_run {
        info!("dry run: changes are applied to an in-memory copy only");
        let shadow_store = MemoryStore::from_schema(store.snapshot()?);
        let shadow_ledger = MemoryLedger::from_entries(ledger.entries()?);
        plan.run(&MigrationRunner::new(&shadow_store, &shadow_ledger).with_cancel_flag(cancel))?
    } else {
        plan.run(&MigrationRunner::new(&store, ledger.as_ref()).with_cancel_flag(cancel))?
    };

    print!("{}", render::report_summary(&report, dry_run));
    if let (Some(version), Some(error)) = (report.failed_at, &report.error) {
        eprintln!("migration {version} failed: {error}");
        return Ok(ExitCode::FAILURE);
    }
    if report.cancelled {
        eprintln!("cancelled before all migrations ran");
        return Ok(ExitCode::from(130));
    }
    Ok(ExitCode::SUCCESS)
}
