/*!
 * @file db_migrate.rs
 * @brief Migration status, apply, rollback, authoring and checksum CLI
 */

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use dbkeeper::{init_tracing_logger, Config, LogLevel, Orchestrator};
use std::process::ExitCode;

const DOWN_USAGE: &str = "Usage: db-migrate down --version=N";

#[derive(Parser, Debug)]
#[command(name = "db-migrate", author, version, about = "Manage schema migrations")]
struct Cli {
    /// Configuration file, by default $DBKEEPER_CONFIG or ./dbkeeper.toml
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the current version with applied and pending migrations
    Status,
    /// Apply every pending migration
    Up,
    /// Roll back to the given version
    #[command(disable_version_flag = true)]
    Down {
        /// Target version; everything above it is undone
        #[arg(long)]
        version: Option<i64>,
    },
    /// Write a new migration template
    Create {
        #[arg(long)]
        name: String,
    },
    /// Compare recorded checksums with the compiled-in migrations
    Verify,
}

fn config_path(flag: Option<String>) -> String {
    flag.or_else(|| std::env::var("DBKEEPER_CONFIG").ok())
        .unwrap_or_else(|| "dbkeeper.toml".to_string())
}

async fn run(cli: Cli) -> Result<bool> {
    let config = Config::load(config_path(cli.config))
        .await
        .context("failed to load configuration")?;
    let _ = init_tracing_logger(LogLevel::parse(&config.logging.level), config.logging.detailed);

    let orchestrator = Orchestrator::new(config)?;
    let migrations = orchestrator.migrations();

    // Authoring only touches the filesystem.
    if let Command::Create { name } = &cli.command {
        let draft = migrations.create_migration(name).await?;
        println!("✅ created {} at {}", draft.filename, draft.path.display());
        println!("   register it in src/migrations/mod.rs");
        return Ok(true);
    }

    orchestrator
        .connection()
        .connect()
        .await
        .context("cannot reach the database")?;

    let outcome = match cli.command {
        Command::Status => {
            let status = migrations.get_migration_status().await?;
            println!("Current version: {}", status.current_version);
            for record in &status.applied {
                println!("✅ {} applied {}", record.filename, record.applied_at.to_rfc3339());
            }
            for pending in &status.pending {
                println!("⏳ {} pending", pending.filename);
            }
            Ok(true)
        }
        Command::Up => {
            let run = migrations.run_migrations().await?;
            if run.applied.is_empty() {
                println!("✅ already at version {}", run.current_version);
            } else {
                for version in &run.applied {
                    println!("✅ applied {}", version);
                }
                println!("Now at version {}", run.current_version);
            }
            Ok(true)
        }
        Command::Down { version } => {
            let target = version.context(DOWN_USAGE)?;
            let run = migrations.rollback_to_version(target).await?;
            for version in &run.rolled_back {
                println!("✅ rolled back {}", version);
            }
            for version in &run.skipped {
                println!("❌ {} not rolled back", version);
            }
            println!("Now at version {}", run.current_version);
            Ok(run.skipped.is_empty())
        }
        Command::Verify => {
            let drift = migrations.verify_checksums().await?;
            for entry in &drift {
                match &entry.current {
                    Some(_) => println!("❌ {} changed since it was applied", entry.filename),
                    None => println!("❌ {} is recorded but no longer registered", entry.filename),
                }
            }
            if drift.is_empty() {
                println!("✅ all applied migrations match");
            }
            Ok(drift.is_empty())
        }
        Command::Create { .. } => Ok(true),
    };

    orchestrator.shutdown().await;
    outcome
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

    // Checked before touching configuration or the database.
    if let Command::Down { version: None } = cli.command {
        eprintln!("{}", DOWN_USAGE);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("❌ {:#}", e);
            ExitCode::FAILURE
        }
    }
}
