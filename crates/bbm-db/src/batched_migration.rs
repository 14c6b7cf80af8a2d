use std::fmt;
use std::str::FromStr;

use bbm_common::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::{GitlabSchema, GitlabSchemaSet};

pub(crate) const COLUMNS: &str = "id, job_class_name, table_name, column_name, job_arguments, interval, \
     min_value, max_value, cursor_value, batch_class_name, batch_size, max_batch_size, \
     sub_batch_size, pause_ms, total_tuple_count, status, gitlab_schema, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Pending,
    Active,
    Paused,
    Finished,
    Failed,
}

impl MigrationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::Active => "active",
            MigrationStatus::Paused => "paused",
            MigrationStatus::Finished => "finished",
            MigrationStatus::Failed => "failed",
        }
    }

    /// Finished and failed migrations are no longer advanced.
    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationStatus::Finished | MigrationStatus::Failed)
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(MigrationStatus::Pending),
            "active" => Ok(MigrationStatus::Active),
            "paused" => Ok(MigrationStatus::Paused),
            "finished" => Ok(MigrationStatus::Finished),
            "failed" => Ok(MigrationStatus::Failed),
            other => Err(Error::Validation(format!("unknown migration status: {other}"))),
        }
    }
}

/// A persisted, resumable batched background migration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchedMigration {
    pub id: i64,
    pub job_class_name: String,
    pub table_name: String,
    pub column_name: String,
    pub job_arguments: Vec<Value>,
    /// Seconds between batches.
    pub interval: i64,
    pub min_value: i64,
    pub max_value: i64,
    /// Highest cursor value processed so far; `None` before the first batch.
    pub cursor_value: Option<i64>,
    pub batch_class_name: String,
    pub batch_size: i64,
    pub max_batch_size: Option<i64>,
    pub sub_batch_size: i64,
    pub pause_ms: i64,
    pub total_tuple_count: Option<i64>,
    pub status: MigrationStatus,
    pub gitlab_schema: GitlabSchema,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Attributes for a migration record that has not been stored yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBatchedMigration {
    pub job_class_name: String,
    pub table_name: String,
    pub column_name: String,
    pub job_arguments: Vec<Value>,
    pub interval: i64,
    pub min_value: i64,
    pub max_value: i64,
    pub batch_class_name: String,
    pub batch_size: i64,
    pub max_batch_size: Option<i64>,
    pub sub_batch_size: i64,
    pub pause_ms: i64,
    pub total_tuple_count: Option<i64>,
    pub status: MigrationStatus,
    pub gitlab_schema: GitlabSchema,
    pub created_at: DateTime<Utc>,
}

impl NewBatchedMigration {
    pub fn new(
        job_class_name: impl Into<String>,
        table_name: impl Into<String>,
        column_name: impl Into<String>,
        gitlab_schema: GitlabSchema,
    ) -> Self {
        Self {
            job_class_name: job_class_name.into(),
            table_name: table_name.into(),
            column_name: column_name.into(),
            job_arguments: Vec::new(),
            interval: 120,
            min_value: 1,
            max_value: 1,
            batch_class_name: "PrimaryKeyBatchingStrategy".to_string(),
            batch_size: 1_000,
            max_batch_size: None,
            sub_batch_size: 100,
            pause_ms: 100,
            total_tuple_count: None,
            status: MigrationStatus::Active,
            gitlab_schema,
            created_at: Utc::now(),
        }
    }
}

impl BatchedMigration {
    /// Lazy query over every migration record.
    pub fn all() -> BatchedMigrationQuery {
        BatchedMigrationQuery::default()
    }

    pub fn ordered_by_created_at_desc() -> BatchedMigrationQuery {
        Self::all().ordered_by_created_at_desc()
    }

    pub fn for_gitlab_schema(
        schemas: impl IntoIterator<Item = GitlabSchema>,
    ) -> BatchedMigrationQuery {
        Self::all().for_gitlab_schema(schemas)
    }

    pub fn insert(conn: &Connection, new: &NewBatchedMigration) -> Result<Self> {
        let arguments = serialize_arguments(&new.job_arguments)?;
        let created_at = format_timestamp(new.created_at);

        conn.execute(
            "INSERT INTO batched_background_migrations (
                job_class_name, table_name, column_name, job_arguments, interval,
                min_value, max_value, batch_class_name, batch_size, max_batch_size,
                sub_batch_size, pause_ms, total_tuple_count, status, gitlab_schema,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)",
            params![
                new.job_class_name,
                new.table_name,
                new.column_name,
                arguments,
                new.interval,
                new.min_value,
                new.max_value,
                new.batch_class_name,
                new.batch_size,
                new.max_batch_size,
                new.sub_batch_size,
                new.pause_ms,
                new.total_tuple_count,
                new.status.as_str(),
                new.gitlab_schema.as_str(),
                created_at,
            ],
        )
        .map_err(|e| Error::Database(format!("failed to insert batched migration: {e}")))?;

        let id = conn.last_insert_rowid();
        Self::find(conn, id)?
            .ok_or_else(|| Error::NotFound(format!("batched background migration {id}")))
    }

    pub fn find(conn: &Connection, id: i64) -> Result<Option<Self>> {
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM batched_background_migrations WHERE id = ?1"),
            params![id],
            Self::from_row,
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to load batched migration {id}: {e}")))
    }

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_class_name: row.get(1)?,
            table_name: row.get(2)?,
            column_name: row.get(3)?,
            job_arguments: parse_column(row, 4, |s| {
                serde_json::from_str(s).map_err(Error::from)
            })?,
            interval: row.get(5)?,
            min_value: row.get(6)?,
            max_value: row.get(7)?,
            cursor_value: row.get(8)?,
            batch_class_name: row.get(9)?,
            batch_size: row.get(10)?,
            max_batch_size: row.get(11)?,
            sub_batch_size: row.get(12)?,
            pause_ms: row.get(13)?,
            total_tuple_count: row.get(14)?,
            status: parse_column(row, 15, str::parse)?,
            gitlab_schema: parse_column(row, 16, str::parse)?,
            created_at: parse_column(row, 17, parse_timestamp)?,
            updated_at: parse_column(row, 18, parse_timestamp)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum QueryOrder {
    #[default]
    Id,
    CreatedAtDesc,
}

/// Chainable query over `batched_background_migrations`. Nothing touches the
/// database until [`load`](Self::load) or [`count`](Self::count).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchedMigrationQuery {
    order: QueryOrder,
    gitlab_schemas: Option<GitlabSchemaSet>,
    limit: Option<usize>,
}

impl BatchedMigrationQuery {
    /// Newest first; ties on `created_at` fall back to the newest id.
    pub fn ordered_by_created_at_desc(mut self) -> Self {
        self.order = QueryOrder::CreatedAtDesc;
        self
    }

    /// Keep only records tagged with one of `schemas`. An empty set matches
    /// nothing. Repeated calls intersect.
    pub fn for_gitlab_schema(mut self, schemas: impl IntoIterator<Item = GitlabSchema>) -> Self {
        let schemas: GitlabSchemaSet = schemas.into_iter().collect();
        self.gitlab_schemas = Some(match self.gitlab_schemas.take() {
            Some(existing) => existing.intersection(&schemas).copied().collect(),
            None => schemas,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn load(&self, conn: &Connection) -> Result<Vec<BatchedMigration>> {
        let (sql, values) = self.to_sql(COLUMNS);
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map(params_from_iter(values.iter()), BatchedMigration::from_row)
            .map_err(|e| Error::Database(format!("failed to query batched migrations: {e}")))?;

        let mut migrations = Vec::new();
        for row in rows {
            migrations.push(
                row.map_err(|e| Error::Database(format!("failed to read migration row: {e}")))?,
            );
        }
        Ok(migrations)
    }

    pub fn count(&self, conn: &Connection) -> Result<usize> {
        let (sql, values) = self.to_sql("id");
        let count: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM ({sql})"),
                params_from_iter(values.iter()),
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(format!("failed to count batched migrations: {e}")))?;
        Ok(count as usize)
    }

    fn to_sql(&self, columns: &str) -> (String, Vec<&'static str>) {
        let mut sql = format!("SELECT {columns} FROM batched_background_migrations");
        let mut values = Vec::new();

        if let Some(schemas) = &self.gitlab_schemas {
            if schemas.is_empty() {
                sql.push_str(" WHERE 0");
            } else {
                let placeholders: Vec<String> =
                    (1..=schemas.len()).map(|i| format!("?{i}")).collect();
                sql.push_str(&format!(
                    " WHERE gitlab_schema IN ({})",
                    placeholders.join(", ")
                ));
                values.extend(schemas.iter().map(|s| s.as_str()));
            }
        }

        match self.order {
            QueryOrder::Id => sql.push_str(" ORDER BY id ASC"),
            QueryOrder::CreatedAtDesc => sql.push_str(" ORDER BY created_at DESC, id DESC"),
        }

        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        (sql, values)
    }
}

pub(crate) fn serialize_arguments(arguments: &[Value]) -> Result<String> {
    Ok(serde_json::to_string(arguments)?)
}

/// Fixed-width UTC timestamps so text order matches time order.
pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Validation(format!("invalid timestamp {s:?}: {e}")))
}

fn parse_column<T>(
    row: &Row<'_>,
    idx: usize,
    parse: impl FnOnce(&str) -> Result<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
