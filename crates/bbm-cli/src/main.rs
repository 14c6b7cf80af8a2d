use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bbm_config::{ConfigLoader, LogConfig, LogFormat};
use bbm_db::DatabaseRegistry;
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::{DeleteArgs, QueueArgs};

#[derive(Parser)]
#[command(name = "bbm", version)]
#[command(about = "Inspect and manage batched background migrations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (defaults to <config dir>/bbm/config.yml)
    #[arg(short, long, global = true, env = "BBM_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List every batched migration stored on a database
    List {
        #[arg(short, long, default_value = "main")]
        database: String,
    },

    /// Show the most recent batched migrations for a database
    Recent {
        #[arg(short, long, default_value = "main")]
        database: String,
    },

    /// Summarize recent migrations on every configured database
    Status,

    /// Queue a new batched background migration
    Queue(QueueArgs),

    /// Delete a batched background migration by its configuration
    Delete(DeleteArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loader = match &cli.config {
        Some(path) => ConfigLoader::new(path),
        None => ConfigLoader::from_default_location(),
    };
    let config = loader
        .load()
        .with_context(|| format!("failed to load config from {}", loader.path().display()))?;

    init_tracing(&config.log, cli.verbose);
    debug!("using config at {}", loader.path().display());

    let registry =
        Arc::new(DatabaseRegistry::from_config(&config).context("failed to open databases")?);

    match cli.command {
        Commands::List { database } => commands::list(&registry, &database, cli.json)?,
        Commands::Recent { database } => commands::recent(&registry, &database, cli.json)?,
        Commands::Status => commands::status(registry, cli.json).await?,
        Commands::Queue(args) => commands::queue(&registry, &args, cli.json)?,
        Commands::Delete(args) => commands::delete(&registry, &args)?,
    }

    Ok(())
}

/// `RUST_LOG` wins over the configured level; `--verbose` forces debug.
fn init_tracing(log: &LogConfig, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_queue_arguments() {
        let cli = Cli::try_parse_from([
            "bbm",
            "queue",
            "--database",
            "ci",
            "--job-class",
            "CopyColumn",
            "--table",
            "ci_builds",
            "--column",
            "id",
            "--arg",
            "[\"id\"]",
            "--arg",
            "plain",
            "--batch-size",
            "500",
        ])
        .unwrap();

        match cli.command {
            Commands::Queue(args) => {
                assert_eq!(args.database, "ci");
                assert_eq!(args.job_arguments, vec!["[\"id\"]", "plain"]);
                assert_eq!(args.batch_size, Some(500));
                assert_eq!(args.interval_secs, 120);
            }
            _ => panic!("expected queue command"),
        }
    }

    #[test]
    fn database_defaults_to_main() {
        let cli = Cli::try_parse_from(["bbm", "--json", "recent"]).unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Recent { database } => assert_eq!(database, "main"),
            _ => panic!("expected recent command"),
        }
    }
}
