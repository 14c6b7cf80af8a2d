use bbm_common::{Error, Result};
use rusqlite::{Connection, params};
use tracing::info;

/// Migration system for tracking and applying database schema changes.
///
/// Each migration has a version number and a SQL statement.
/// Migrations are applied in order and tracked in a `_migrations` table.
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_batched_background_migrations",
        sql: "CREATE TABLE batched_background_migrations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_class_name TEXT NOT NULL,
                table_name TEXT NOT NULL,
                column_name TEXT NOT NULL,
                job_arguments TEXT NOT NULL DEFAULT '[]',
                interval INTEGER NOT NULL,
                min_value INTEGER NOT NULL DEFAULT 1,
                max_value INTEGER NOT NULL,
                batch_class_name TEXT NOT NULL DEFAULT 'PrimaryKeyBatchingStrategy',
                batch_size INTEGER NOT NULL,
                max_batch_size INTEGER,
                sub_batch_size INTEGER NOT NULL,
                pause_ms INTEGER NOT NULL DEFAULT 100,
                total_tuple_count INTEGER,
                status TEXT NOT NULL DEFAULT 'paused',
                gitlab_schema TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK (max_value >= min_value),
                CHECK (batch_size > 0 AND sub_batch_size > 0)
            );

            CREATE UNIQUE INDEX index_batched_migrations_on_configuration
                ON batched_background_migrations
                (gitlab_schema, job_class_name, table_name, column_name, job_arguments);",
    },
    Migration {
        version: 2,
        name: "index_batched_migrations_on_gitlab_schema_and_created_at",
        sql: "CREATE INDEX index_batched_migrations_on_gitlab_schema_and_created_at
                ON batched_background_migrations (gitlab_schema, created_at);",
    },
    Migration {
        version: 3,
        name: "add_cursor_value_to_batched_background_migrations",
        sql: "ALTER TABLE batched_background_migrations ADD COLUMN cursor_value INTEGER;",
    },
];

/// Apply every migration newer than the recorded schema version.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| Error::Database(format!("failed to create _migrations table: {e}")))?;

    let current = schema_version(conn)?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::Database(format!("failed to begin migration: {e}")))?;
        tx.execute_batch(migration.sql).map_err(|e| {
            Error::Database(format!("migration {} failed: {e}", migration.name))
        })?;
        tx.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            params![migration.version, migration.name],
        )
        .map_err(|e| Error::Database(format!("failed to record migration: {e}")))?;
        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit migration: {e}")))?;

        info!("applied schema migration {} ({})", migration.version, migration.name);
    }

    Ok(())
}

pub fn schema_version(conn: &Connection) -> Result<u32> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| {
        row.get(0)
    })
    .map_err(|e| Error::Database(format!("failed to read schema version: {e}")))
}
