/*!
 * @file db_init.rs
 * @brief Database bring-up, reset, status and maintenance CLI
 */

use anyhow::{anyhow, Context, Result};
use clap::error::ErrorKind;
use clap::{ArgGroup, Parser};
use dbkeeper::orchestrator::{InitReport, InitStep, MaintenanceReport, StatusReport};
use dbkeeper::{init_tracing_logger, Config, InitOptions, LogLevel, Orchestrator, ResetOptions};
use std::process::ExitCode;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "db-init", author, version, about = "Initialize and maintain the application database")]
#[command(group(ArgGroup::new("mode").args(["quick", "reset", "status", "maintenance"])))]
struct Cli {
    /// Connect, create indexes and migrate only
    #[arg(long)]
    quick: bool,

    /// Back up, clear, reindex, migrate and reseed (refused in production)
    #[arg(long)]
    reset: bool,

    /// Print connection, migration, index and backup status
    #[arg(long)]
    status: bool,

    /// Audit index usage, prune old backups and check health
    #[arg(long)]
    maintenance: bool,

    /// Record failing steps and keep going
    #[arg(long)]
    continue_on_error: bool,

    /// Skip the seed step
    #[arg(long)]
    no_seeds: bool,

    /// Configuration file, by default $DBKEEPER_CONFIG or ./dbkeeper.toml
    #[arg(short, long)]
    config: Option<String>,
}

fn config_path(flag: Option<String>) -> String {
    flag.or_else(|| std::env::var("DBKEEPER_CONFIG").ok())
        .unwrap_or_else(|| "dbkeeper.toml".to_string())
}

fn mark(ok: bool) -> &'static str {
    if ok {
        "✅"
    } else {
        "❌"
    }
}

fn print_checklist(report: &InitReport, steps: &[InitStep]) {
    for step in steps {
        if let Some(error) = report.errors.iter().find(|e| e.step == *step) {
            println!("❌ {:<12} {}", step.as_str(), error.error);
        } else if report.skipped.contains(step) {
            println!("➖ {:<12} skipped", step.as_str());
        } else {
            println!("{} {}", mark(report.completed(*step)), step.as_str());
        }
    }
}

fn print_status(status: &StatusReport) {
    println!("Environment: {}", status.environment);

    let health = &status.health;
    match &health.error {
        None => println!(
            "{} database   {} ({} collections, {} documents, {}ms)",
            mark(health.connected),
            health.database.as_deref().unwrap_or("?"),
            health.collections.unwrap_or(0),
            health.objects.unwrap_or(0),
            health.latency_ms
        ),
        Some(error) => println!("❌ database   {} [{}]", error, health.state),
    }

    match &status.cache.error {
        None => println!("✅ cache      {}ms", status.cache.latency_ms),
        Some(error) => println!("❌ cache      {}", error),
    }

    if let Some(migrations) = &status.migrations {
        println!(
            "{} migrations version {} ({} applied, {} pending)",
            mark(migrations.pending.is_empty()),
            migrations.current_version,
            migrations.applied.len(),
            migrations.pending.len()
        );
    }
    if let Some(indexes) = &status.indexes {
        for (collection, stats) in indexes {
            println!("{} indexes    {:<14} {}", mark(stats.exists), collection, stats.total_indexes);
        }
    }
    if let Some(backups) = &status.backups {
        println!("✅ backups    {} on disk", backups.len());
        if let Some(latest) = backups.first() {
            println!("             latest {} ({})", latest.name, latest.created_at.to_rfc3339());
        }
    }
    for error in &status.errors {
        println!("❌ {:<10} {}", error.section, error.error);
    }
}

fn print_maintenance(report: &MaintenanceReport) {
    println!("{} unused indexes: {}", mark(report.unused_indexes.is_empty()), report.unused_indexes.len());
    for usage in &report.unused_indexes {
        println!("     {}.{}", usage.collection, usage.name);
    }
    println!("✅ pruned backups: {}", report.pruned_backups.len());
    println!("{} health", mark(report.health.connected));
    for error in &report.errors {
        println!("❌ {:<16} {}", error.section, error.error);
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let config = Config::load(config_path(cli.config.clone()))
        .await
        .context("failed to load configuration")?;
    let _ = init_tracing_logger(LogLevel::parse(&config.logging.level), config.logging.detailed);

    let orchestrator = Orchestrator::new(config)?;
    let outcome = execute(&cli, &orchestrator).await;
    orchestrator.shutdown().await;
    outcome
}

async fn execute(cli: &Cli, orchestrator: &Orchestrator) -> Result<bool> {
    if cli.status {
        if let Err(e) = orchestrator.connection().connect().await {
            warn!("Status will be partial: {}", e);
        }
        let status = orchestrator.get_status().await;
        print_status(&status);
        return Ok(status.health.connected && status.errors.is_empty());
    }

    if cli.maintenance {
        orchestrator.connection().connect().await?;
        let report = orchestrator.run_maintenance().await;
        print_maintenance(&report);
        return Ok(report.errors.is_empty());
    }

    if cli.reset {
        let options = ResetOptions {
            reseed: !cli.no_seeds,
            ..Default::default()
        };
        let report = orchestrator
            .reset_database(options)
            .await
            .map_err(|e| anyhow!("reset failed: {}", e))?;
        if let Some(backup) = &report.backup {
            println!("✅ backup     {}", backup);
        }
        println!("✅ cleared    {} document(s)", report.cleared.documents_deleted);
        println!(
            "{} reindexed  {} collection(s)",
            mark(report.reindexed.iter().all(|r| r.success)),
            report.reindexed.len()
        );
        println!("✅ migrated   version {}", report.migrations.current_version);
        if let Some(seeds) = &report.seeds {
            println!("{} seeded     {} unit(s)", mark(seeds.failed.is_empty()), seeds.executed.len());
        }
        return Ok(true);
    }

    if cli.quick {
        let report = orchestrator.quick_setup().await?;
        print_checklist(&report, &[InitStep::Connect, InitStep::Index, InitStep::Migrate]);
        return Ok(report.success());
    }

    let options = InitOptions {
        continue_on_error: cli.continue_on_error,
        run_seeds: !cli.no_seeds,
    };
    let report = orchestrator.initialize(options).await?;
    print_checklist(&report, &InitStep::ALL);
    Ok(report.success())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("❌ {:#}", e);
            ExitCode::FAILURE
        }
    }
}
