use std::collections::BTreeMap;

use anyhow::Result;
use bbm_db::{BatchedMigration, LogicalDatabase};
use serde::Serialize;

/// Recent migrations of one logical database, for `bbm status`.
#[derive(Debug, Serialize)]
pub struct DatabaseStatus {
    pub database: LogicalDatabase,
    pub connection: String,
    pub status_counts: BTreeMap<String, usize>,
    pub recent: Vec<BatchedMigration>,
}

impl DatabaseStatus {
    pub fn new(database: LogicalDatabase, connection: &str, recent: Vec<BatchedMigration>) -> Self {
        let mut status_counts = BTreeMap::new();
        for migration in &recent {
            *status_counts
                .entry(migration.status.to_string())
                .or_insert(0) += 1;
        }
        Self {
            database,
            connection: connection.to_string(),
            status_counts,
            recent,
        }
    }
}

pub fn print_migrations(migrations: &[BatchedMigration], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(migrations)?);
    } else {
        print!("{}", render_table(migrations));
    }
    Ok(())
}

pub fn print_status(statuses: &[DatabaseStatus], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(statuses)?);
        return Ok(());
    }

    for status in statuses {
        println!("{}", render_status_line(status));
        if !status.recent.is_empty() {
            print!("{}", render_table(&status.recent));
        }
        println!();
    }
    Ok(())
}

fn render_status_line(status: &DatabaseStatus) -> String {
    let counts: Vec<String> = status
        .status_counts
        .iter()
        .map(|(name, count)| format!("{name} {count}"))
        .collect();
    let summary = if counts.is_empty() {
        "none".to_string()
    } else {
        counts.join(", ")
    };
    format!(
        "{} (connection {}): {} recent; {summary}",
        status.database,
        status.connection,
        status.recent.len()
    )
}

fn render_table(migrations: &[BatchedMigration]) -> String {
    if migrations.is_empty() {
        return "no batched background migrations\n".to_string();
    }

    let header = [
        "ID", "JOB CLASS", "TABLE", "COLUMN", "STATUS", "SCHEMA", "PROGRESS", "CREATED",
    ];
    let rows: Vec<[String; 8]> = migrations
        .iter()
        .map(|m| {
            [
                m.id.to_string(),
                m.job_class_name.clone(),
                m.table_name.clone(),
                m.column_name.clone(),
                m.status.to_string(),
                m.gitlab_schema.to_string(),
                progress(m),
                m.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]
        })
        .collect();

    let mut widths = header.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    let header: Vec<String> = header.iter().map(|h| h.to_string()).collect();
    push_row(&mut out, &header, &widths);
    for row in &rows {
        push_row(&mut out, row, &widths);
    }
    out
}

fn push_row(out: &mut String, cells: &[String], widths: &[usize]) {
    let line: Vec<String> = cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{cell:<width$}"))
        .collect();
    out.push_str(line.join("  ").trim_end());
    out.push('\n');
}

fn progress(migration: &BatchedMigration) -> String {
    match migration.cursor_value {
        Some(cursor) => format!("{cursor}/{}", migration.max_value),
        None => format!("-/{}", migration.max_value),
    }
}

#[cfg(test)]
mod tests {
    use bbm_db::{GitlabSchema, MigrationStatus};
    use chrono::{TimeZone, Utc};

    use super::*;

    fn migration(id: i64, status: MigrationStatus, cursor: Option<i64>) -> BatchedMigration {
        let at = Utc.with_ymd_and_hms(2022, 5, 4, 10, 30, 0).unwrap();
        BatchedMigration {
            id,
            job_class_name: "CopyColumnUsingBackgroundMigrationJob".into(),
            table_name: "events".into(),
            column_name: "id".into(),
            job_arguments: vec![],
            interval: 120,
            min_value: 1,
            max_value: 500,
            cursor_value: cursor,
            batch_class_name: "PrimaryKeyBatchingStrategy".into(),
            batch_size: 1000,
            max_batch_size: None,
            sub_batch_size: 100,
            pause_ms: 100,
            total_tuple_count: None,
            status,
            gitlab_schema: GitlabSchema::Main,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn table_aligns_columns() {
        let table = render_table(&[
            migration(1, MigrationStatus::Active, Some(250)),
            migration(12, MigrationStatus::Finished, None),
        ]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ID  JOB CLASS"));
        assert!(lines[1].contains("250/500"));
        assert!(lines[2].starts_with("12  "));
        assert!(lines[2].contains("-/500"));
        assert!(lines[2].ends_with("2022-05-04 10:30:00"));
    }

    #[test]
    fn empty_table_says_so() {
        assert_eq!(render_table(&[]), "no batched background migrations\n");
    }

    #[test]
    fn status_line_counts_statuses() {
        let status = DatabaseStatus::new(
            LogicalDatabase::Main,
            "main",
            vec![
                migration(1, MigrationStatus::Active, None),
                migration(2, MigrationStatus::Active, None),
                migration(3, MigrationStatus::Failed, None),
            ],
        );
        assert_eq!(
            render_status_line(&status),
            "main (connection main): 3 recent; active 2, failed 1"
        );

        let empty = DatabaseStatus::new(LogicalDatabase::Ci, "ci", vec![]);
        assert_eq!(render_status_line(&empty), "ci (connection ci): 0 recent; none");
    }
}
