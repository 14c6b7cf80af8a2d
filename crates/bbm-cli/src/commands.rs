use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bbm_db::{
    DatabaseRegistry, GitlabSchema, LogicalDatabase, QueueOptions,
    delete_batched_background_migration, queue_batched_background_migration,
};
use bbm_finders::{BackgroundMigrationsFinder, BatchedBackgroundMigrationsFinder};
use clap::Args;
use serde_json::Value;
use tracing::info;

use crate::output::{self, DatabaseStatus};

#[derive(Args, Debug)]
pub struct QueueArgs {
    #[arg(short, long, default_value = "main")]
    pub database: String,

    /// Job class that processes each batch
    #[arg(long = "job-class")]
    pub job_class_name: String,

    #[arg(long = "table")]
    pub table_name: String,

    #[arg(long = "column")]
    pub column_name: String,

    /// Job argument; parsed as JSON when possible, otherwise kept as a string
    #[arg(long = "arg")]
    pub job_arguments: Vec<String>,

    /// Seconds between batches
    #[arg(long, default_value_t = 120)]
    pub interval_secs: u64,

    #[arg(long)]
    pub batch_min: Option<i64>,

    /// Defaults to the current maximum of the column
    #[arg(long)]
    pub batch_max: Option<i64>,

    #[arg(long)]
    pub batch_size: Option<i64>,

    #[arg(long)]
    pub sub_batch_size: Option<i64>,

    /// Defaults to the schema owned by --database
    #[arg(long)]
    pub gitlab_schema: Option<String>,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    #[arg(short, long, default_value = "main")]
    pub database: String,

    #[arg(long = "job-class")]
    pub job_class_name: String,

    #[arg(long = "table")]
    pub table_name: String,

    #[arg(long = "column")]
    pub column_name: String,

    #[arg(long = "arg")]
    pub job_arguments: Vec<String>,
}

pub fn list(registry: &DatabaseRegistry, database: &str, json: bool) -> Result<()> {
    let migrations = BackgroundMigrationsFinder::new(registry, database)?.execute()?;
    output::print_migrations(&migrations, json)
}

pub fn recent(registry: &DatabaseRegistry, database: &str, json: bool) -> Result<()> {
    let migrations = BatchedBackgroundMigrationsFinder::new(registry, database)?.execute()?;
    output::print_migrations(&migrations, json)
}

pub async fn status(registry: Arc<DatabaseRegistry>, json: bool) -> Result<()> {
    let statuses = collect_status(registry).await?;
    output::print_status(&statuses, json)
}

/// Run the recent-migrations finder for every configured database, one
/// blocking task per database.
pub async fn collect_status(registry: Arc<DatabaseRegistry>) -> Result<Vec<DatabaseStatus>> {
    let tasks: Vec<_> = registry
        .databases()
        .map(|database| {
            let registry = Arc::clone(&registry);
            tokio::task::spawn_blocking(move || -> bbm_common::Result<DatabaseStatus> {
                let finder = BatchedBackgroundMigrationsFinder::new(&registry, database.as_str())?;
                let recent = finder.execute()?;
                Ok(DatabaseStatus::new(
                    database,
                    finder.connection().name(),
                    recent,
                ))
            })
        })
        .collect();

    let mut statuses = Vec::with_capacity(tasks.len());
    for task in tasks {
        statuses.push(task.await.context("status task failed")??);
    }
    Ok(statuses)
}

pub fn queue(registry: &DatabaseRegistry, args: &QueueArgs, json: bool) -> Result<()> {
    let database: LogicalDatabase = args.database.parse()?;
    let connection = registry.fetch(&args.database)?;

    let mut options = QueueOptions::new(Duration::from_secs(args.interval_secs));
    options.allowed_gitlab_schemas = vec![database.gitlab_schema()];
    options.batch_max_value = args.batch_max;
    if let Some(min) = args.batch_min {
        options.batch_min_value = min;
    }
    if let Some(size) = args.batch_size {
        options.batch_size = size;
    }
    if let Some(size) = args.sub_batch_size {
        options.sub_batch_size = size;
    }
    if let Some(schema) = &args.gitlab_schema {
        options.gitlab_schema = Some(schema.parse::<GitlabSchema>()?);
    }

    let job_arguments = parse_job_arguments(&args.job_arguments);
    let scope = connection.scope();
    let migration = queue_batched_background_migration(
        &scope,
        &args.job_class_name,
        &args.table_name,
        &args.column_name,
        &job_arguments,
        &options,
    )?;

    output::print_migrations(std::slice::from_ref(&migration), json)
}

pub fn delete(registry: &DatabaseRegistry, args: &DeleteArgs) -> Result<()> {
    let connection = registry.fetch(&args.database)?;
    let job_arguments = parse_job_arguments(&args.job_arguments);

    let scope = connection.scope();
    let deleted = delete_batched_background_migration(
        &scope,
        &args.job_class_name,
        &args.table_name,
        &args.column_name,
        &job_arguments,
    )?;

    info!("delete finished on {}", scope.name());
    println!("deleted {deleted} batched background migration(s)");
    Ok(())
}

fn parse_job_arguments(raw: &[String]) -> Vec<Value> {
    raw.iter()
        .map(|arg| serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.clone())))
        .collect()
}
