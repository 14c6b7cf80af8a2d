use std::sync::LazyLock;
use std::time::Duration;

use bbm_common::{Error, Result};
use chrono::Utc;
use regex::Regex;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use tracing::{info, warn};

use crate::batched_migration::{
    BatchedMigration, MigrationStatus, NewBatchedMigration, format_timestamp, serialize_arguments,
};
use crate::schema::GitlabSchema;

/// Shortest allowed delay between two batches of one migration.
pub const BATCH_MIN_DELAY: Duration = Duration::from_secs(2 * 60);

const BATCH_CLASS_NAME: &str = "PrimaryKeyBatchingStrategy";
const BATCH_MIN_VALUE: i64 = 1;
const BATCH_SIZE: i64 = 1_000;
const SUB_BATCH_SIZE: i64 = 100;
const PAUSE_MS: i64 = 100;

static IDENTIFIER: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$"));

/// Batching settings for [`queue_batched_background_migration`].
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub job_interval: Duration,
    pub batch_min_value: i64,
    /// Defaults to the current maximum of the batched column.
    pub batch_max_value: Option<i64>,
    pub batch_class_name: String,
    pub batch_size: i64,
    pub max_batch_size: Option<i64>,
    pub sub_batch_size: i64,
    pub pause_ms: i64,
    /// Defaults to [`gitlab_schema_from_context`] over `allowed_gitlab_schemas`.
    pub gitlab_schema: Option<GitlabSchema>,
    pub allowed_gitlab_schemas: Vec<GitlabSchema>,
}

impl QueueOptions {
    pub fn new(job_interval: Duration) -> Self {
        Self {
            job_interval,
            batch_min_value: BATCH_MIN_VALUE,
            batch_max_value: None,
            batch_class_name: BATCH_CLASS_NAME.to_string(),
            batch_size: BATCH_SIZE,
            max_batch_size: None,
            sub_batch_size: SUB_BATCH_SIZE,
            pause_ms: PAUSE_MS,
            gitlab_schema: None,
            allowed_gitlab_schemas: Vec::new(),
        }
    }
}

/// Schema a migration belongs to when none is given explicitly.
pub fn gitlab_schema_from_context(allowed_gitlab_schemas: &[GitlabSchema]) -> GitlabSchema {
    allowed_gitlab_schemas
        .first()
        .copied()
        .unwrap_or(GitlabSchema::Main)
}

/// Persist a new batched migration over `table_name.column_name`.
///
/// An identical migration (same schema, job class, table, column and
/// arguments) is returned as-is instead of being duplicated. When no upper
/// bound is given and the table is empty, the record is created already
/// finished.
pub fn queue_batched_background_migration(
    conn: &Connection,
    job_class_name: &str,
    table_name: &str,
    column_name: &str,
    job_arguments: &[Value],
    options: &QueueOptions,
) -> Result<BatchedMigration> {
    if !conn.is_autocommit() {
        return Err(Error::TransactionOpen("queue_batched_background_migration"));
    }
    validate_identifier("table", table_name)?;
    validate_identifier("column", column_name)?;

    if options.batch_size <= 0 || options.sub_batch_size <= 0 {
        return Err(Error::Validation(
            "batch_size and sub_batch_size must be positive".into(),
        ));
    }

    let gitlab_schema = options
        .gitlab_schema
        .unwrap_or_else(|| gitlab_schema_from_context(&options.allowed_gitlab_schemas));

    if let Some(existing) = find_for_configuration(
        conn,
        gitlab_schema,
        job_class_name,
        table_name,
        column_name,
        job_arguments,
    )? {
        warn!(
            "batched background migration not enqueued because it already exists: \
             job_class_name: {job_class_name}, table_name: {table_name}, \
             column_name: {column_name}, job_arguments: {job_arguments:?}"
        );
        return Ok(existing);
    }

    ensure_column_exists(conn, table_name, column_name)?;

    let interval = options.job_interval.max(BATCH_MIN_DELAY);

    let batch_max_value = match options.batch_max_value {
        Some(value) => Some(value),
        None => column_max(conn, table_name, column_name)?,
    };
    let (max_value, status) = match batch_max_value {
        Some(value) => (value, MigrationStatus::Active),
        None => (options.batch_min_value, MigrationStatus::Finished),
    };

    if max_value < options.batch_min_value {
        return Err(Error::Validation(format!(
            "batch_max_value {max_value} is below batch_min_value {}",
            options.batch_min_value
        )));
    }

    let new = NewBatchedMigration {
        job_class_name: job_class_name.to_string(),
        table_name: table_name.to_string(),
        column_name: column_name.to_string(),
        job_arguments: job_arguments.to_vec(),
        interval: interval.as_secs() as i64,
        min_value: options.batch_min_value,
        max_value,
        batch_class_name: options.batch_class_name.clone(),
        batch_size: options.batch_size,
        max_batch_size: options.max_batch_size,
        sub_batch_size: options.sub_batch_size,
        pause_ms: options.pause_ms,
        total_tuple_count: Some(row_count(conn, table_name)?),
        status,
        gitlab_schema,
        created_at: Utc::now(),
    };

    let migration = BatchedMigration::insert(conn, &new)?;
    info!(
        "queued batched background migration {} ({job_class_name} on {table_name}.{column_name}, \
         {gitlab_schema}, {status})",
        migration.id
    );
    Ok(migration)
}

/// Remove migrations matching the configuration in any schema. Returns the
/// number of deleted records; a missing migration is not an error.
pub fn delete_batched_background_migration(
    conn: &Connection,
    job_class_name: &str,
    table_name: &str,
    column_name: &str,
    job_arguments: &[Value],
) -> Result<usize> {
    let arguments = serialize_arguments(job_arguments)?;
    let deleted = conn
        .execute(
            "DELETE FROM batched_background_migrations
             WHERE job_class_name = ?1 AND table_name = ?2
               AND column_name = ?3 AND job_arguments = ?4",
            params![job_class_name, table_name, column_name, arguments],
        )
        .map_err(|e| Error::Database(format!("failed to delete batched migration: {e}")))?;

    if deleted > 0 {
        info!("deleted {deleted} batched background migration(s) for {job_class_name}");
    }
    Ok(deleted)
}

pub fn find_for_configuration(
    conn: &Connection,
    gitlab_schema: GitlabSchema,
    job_class_name: &str,
    table_name: &str,
    column_name: &str,
    job_arguments: &[Value],
) -> Result<Option<BatchedMigration>> {
    let arguments = serialize_arguments(job_arguments)?;
    let sql = format!(
        "SELECT {} FROM batched_background_migrations
         WHERE gitlab_schema = ?1 AND job_class_name = ?2 AND table_name = ?3
           AND column_name = ?4 AND job_arguments = ?5
         ORDER BY id ASC LIMIT 1",
        crate::batched_migration::COLUMNS
    );
    conn.query_row(
        &sql,
        params![
            gitlab_schema.as_str(),
            job_class_name,
            table_name,
            column_name,
            arguments
        ],
        BatchedMigration::from_row,
    )
    .optional()
    .map_err(|e| Error::Database(format!("failed to look up batched migration: {e}")))
}

/// Move a migration's cursor forward. The cursor never moves backwards and
/// is capped at `max_value`; reaching it finishes the migration.
///
/// The regression and status checks are part of the `UPDATE`, so a writer on
/// another connection that moved the cursor in between is never overwritten.
pub fn advance_cursor(conn: &Connection, id: i64, value: i64) -> Result<BatchedMigration> {
    let updated = conn
        .execute(
            "UPDATE batched_background_migrations
             SET cursor_value = MIN(?1, max_value),
                 status = CASE WHEN ?1 >= max_value THEN 'finished' ELSE status END,
                 updated_at = ?2
             WHERE id = ?3
               AND COALESCE(cursor_value, min_value) <= ?1
               AND status NOT IN ('finished', 'failed')",
            params![value, format_timestamp(Utc::now()), id],
        )
        .map_err(|e| Error::Database(format!("failed to advance migration {id}: {e}")))?;

    let migration = BatchedMigration::find(conn, id)?
        .ok_or_else(|| Error::NotFound(format!("batched background migration {id}")))?;

    if updated == 0 {
        if migration.status.is_terminal() {
            return Err(Error::Validation(format!(
                "batched background migration {id} is {} and cannot advance",
                migration.status
            )));
        }
        return Err(Error::CursorRegression {
            id,
            current: migration.cursor_value.unwrap_or(migration.min_value),
            requested: value,
        });
    }

    if migration.status == MigrationStatus::Finished {
        info!("batched background migration {id} is now finished");
    }
    Ok(migration)
}

fn validate_identifier(kind: &str, name: &str) -> Result<()> {
    let pattern = IDENTIFIER
        .as_ref()
        .map_err(|e| Error::Validation(format!("identifier pattern failed to compile: {e}")))?;
    if pattern.is_match(name) {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid {kind} name: {name:?}")))
    }
}

/// Double-quoted names that match no column are read as string literals by
/// SQLite, so the column is checked against the catalog before use.
fn ensure_column_exists(conn: &Connection, table_name: &str, column_name: &str) -> Result<()> {
    let table_exists: bool = conn
        .query_row(
            "SELECT count(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table_name],
            |row| row.get(0),
        )
        .map_err(|e| Error::Database(format!("failed to look up table {table_name}: {e}")))?;
    if !table_exists {
        return Err(Error::Validation(format!("unknown table: {table_name}")));
    }

    let column_exists: bool = conn
        .query_row(
            "SELECT count(*) > 0 FROM pragma_table_info(?1) WHERE name = ?2",
            params![table_name, column_name],
            |row| row.get(0),
        )
        .map_err(|e| {
            Error::Database(format!("failed to look up column {table_name}.{column_name}: {e}"))
        })?;
    if !column_exists {
        return Err(Error::Validation(format!(
            "unknown column: {table_name}.{column_name}"
        )));
    }
    Ok(())
}

fn column_max(conn: &Connection, table_name: &str, column_name: &str) -> Result<Option<i64>> {
    conn.query_row(
        &format!("SELECT MAX(\"{column_name}\") FROM \"{table_name}\""),
        [],
        |row| row.get(0),
    )
    .map_err(|e| Error::Database(format!("failed to read max of {table_name}.{column_name}: {e}")))
}

fn row_count(conn: &Connection, table_name: &str) -> Result<i64> {
    conn.query_row(&format!("SELECT COUNT(*) FROM \"{table_name}\""), [], |row| {
        row.get(0)
    })
    .map_err(|e| Error::Database(format!("failed to count rows of {table_name}: {e}")))
}
