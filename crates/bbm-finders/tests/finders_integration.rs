use std::path::Path;
use std::sync::Arc;
use std::thread;

use bbm_common::Error;
use bbm_config::{AppConfig, DatabaseConfig};
use bbm_db::{BatchedMigration, DatabaseRegistry, GitlabSchema, NewBatchedMigration};
use bbm_finders::{BackgroundMigrationsFinder, BatchedBackgroundMigrationsFinder};
use chrono::{DateTime, Duration, TimeZone, Utc};

/// Registry with `main` and `ci` on separate database files.
fn split_registry(dir: &Path) -> DatabaseRegistry {
    let mut config = AppConfig::default();
    config.databases.clear();
    config.databases.insert(
        "main".to_string(),
        DatabaseConfig {
            path: dir.join("main.db"),
        },
    );
    config.databases.insert(
        "ci".to_string(),
        DatabaseConfig {
            path: dir.join("ci.db"),
        },
    );
    DatabaseRegistry::from_config(&config).expect("open registry")
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2022, 6, 1, 9, 0, 0).unwrap()
}

fn seed(registry: &DatabaseRegistry, database: &str, schema: GitlabSchema, count: i64) {
    let connection = registry.fetch(database).unwrap();
    let scope = connection.scope();
    for i in 0..count {
        let mut new = NewBatchedMigration::new(
            format!("{schema}Job{i}"),
            "projects",
            "id",
            schema,
        );
        new.created_at = start() + Duration::seconds(i);
        BatchedMigration::insert(&scope, &new).unwrap();
    }
}

#[test]
fn recent_migrations_for_main_are_the_newest_ten() {
    let dir = tempfile::tempdir().unwrap();
    let registry = split_registry(dir.path());
    seed(&registry, "main", GitlabSchema::Main, 15);

    let found = BatchedBackgroundMigrationsFinder::new(&registry, "main")
        .unwrap()
        .execute()
        .unwrap();

    let jobs: Vec<String> = found.iter().map(|m| m.job_class_name.clone()).collect();
    let expected: Vec<String> = (5..15).rev().map(|i| format!("gitlab_mainJob{i}")).collect();
    assert_eq!(jobs, expected);
}

#[test]
fn ci_without_ci_rows_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let registry = split_registry(dir.path());
    seed(&registry, "main", GitlabSchema::Main, 15);

    let recent = BatchedBackgroundMigrationsFinder::new(&registry, "ci")
        .unwrap()
        .execute()
        .unwrap();
    assert!(recent.is_empty());

    let all = BackgroundMigrationsFinder::new(&registry, "ci")
        .unwrap()
        .execute()
        .unwrap();
    assert!(all.is_empty());
}

#[test]
fn unknown_database_fails_for_both_finders() {
    let dir = tempfile::tempdir().unwrap();
    let registry = split_registry(dir.path());

    let err = BatchedBackgroundMigrationsFinder::new(&registry, "unknown").unwrap_err();
    assert!(matches!(err, Error::UnknownDatabase(_)));

    let err = BackgroundMigrationsFinder::new(&registry, "unknown").unwrap_err();
    assert!(matches!(err, Error::UnknownDatabase(_)));
}

#[test]
fn rows_tagged_outside_the_connection_schemas_are_hidden() {
    let dir = tempfile::tempdir().unwrap();
    let registry = split_registry(dir.path());
    // a ci-tagged row that ended up in the main database
    seed(&registry, "main", GitlabSchema::Ci, 3);
    seed(&registry, "main", GitlabSchema::Shared, 2);

    let finder = BatchedBackgroundMigrationsFinder::new(&registry, "main").unwrap();
    let recent = finder.execute().unwrap();
    assert_eq!(recent.len(), 2);
    assert!(recent.iter().all(|m| m.gitlab_schema == GitlabSchema::Shared));

    // the unfiltered finder still sees everything on the connection
    let all = BackgroundMigrationsFinder::new(&registry, "main")
        .unwrap()
        .execute()
        .unwrap();
    assert_eq!(all.len(), 5);
}

#[test]
fn shared_connection_serves_both_databases() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    let shared = DatabaseConfig {
        path: dir.path().join("gitlab.db"),
    };
    config.databases.insert("main".to_string(), shared.clone());
    config.databases.insert("ci".to_string(), shared);
    let registry = DatabaseRegistry::from_config(&config).unwrap();

    seed(&registry, "main", GitlabSchema::Main, 2);
    seed(&registry, "ci", GitlabSchema::Ci, 2);

    for database in ["main", "ci"] {
        let recent = BatchedBackgroundMigrationsFinder::new(&registry, database)
            .unwrap()
            .execute()
            .unwrap();
        assert_eq!(recent.len(), 4, "database {database}");
    }
}

#[test]
fn execute_twice_returns_identical_results() {
    let dir = tempfile::tempdir().unwrap();
    let registry = split_registry(dir.path());
    seed(&registry, "main", GitlabSchema::Main, 12);
    seed(&registry, "ci", GitlabSchema::Ci, 4);

    let recent = BatchedBackgroundMigrationsFinder::new(&registry, "main").unwrap();
    assert_eq!(recent.execute().unwrap(), recent.execute().unwrap());

    let all = BackgroundMigrationsFinder::new(&registry, "ci").unwrap();
    assert_eq!(all.execute().unwrap(), all.execute().unwrap());
}

#[test]
fn finders_for_different_databases_run_in_parallel() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(split_registry(dir.path()));
    seed(&registry, "main", GitlabSchema::Main, 15);
    seed(&registry, "ci", GitlabSchema::Ci, 3);

    let handles: Vec<_> = [("main", 10), ("ci", 3)]
        .into_iter()
        .flat_map(|(database, expected)| {
            (0..4).map(move |_| (database, expected))
        })
        .map(|(database, expected)| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let found = BatchedBackgroundMigrationsFinder::new(&registry, database)
                    .unwrap()
                    .execute()
                    .unwrap();
                assert_eq!(found.len(), expected);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}
