use std::collections::{BTreeMap, BTreeSet};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bbm_common::{Error, Result};
use bbm_config::AppConfig;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::database::LogicalDatabase;
use crate::migrations::run_migrations;
use crate::schema::{GitlabSchemaSet, gitlab_schemas_for_connection};

/// A physical SQLite connection and the logical databases routed to it.
pub struct DatabaseConnection {
    name: String,
    databases: BTreeSet<LogicalDatabase>,
    conn: Mutex<Connection>,
}

/// Shared, immutable handle to a resolved connection.
pub type ConnectionHandle = Arc<DatabaseConnection>;

impl DatabaseConnection {
    pub fn open(path: &Path, databases: BTreeSet<LogicalDatabase>) -> Result<Self> {
        info!("opening database at {}", path.display());
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Self::with_connection(conn, databases)
    }

    pub fn in_memory(databases: BTreeSet<LogicalDatabase>) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Self::with_connection(conn, databases)
    }

    fn with_connection(conn: Connection, databases: BTreeSet<LogicalDatabase>) -> Result<Self> {
        let name = databases
            .first()
            .map(|db| db.as_str().to_string())
            .ok_or_else(|| Error::Config("connection must serve at least one database".into()))?;

        run_migrations(&conn)?;

        Ok(Self {
            name,
            databases,
            conn: Mutex::new(conn),
        })
    }

    /// Config name of the connection: the first logical database it serves.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn databases(&self) -> &BTreeSet<LogicalDatabase> {
        &self.databases
    }

    pub fn serves(&self, database: LogicalDatabase) -> bool {
        self.databases.contains(&database)
    }

    pub fn gitlab_schemas(&self) -> GitlabSchemaSet {
        gitlab_schemas_for_connection(self)
    }

    /// Bind this connection for the lifetime of the returned scope. The
    /// binding is released when the scope drops, including during unwinding.
    pub fn scope(&self) -> ConnectionScope<'_> {
        let guard = self.conn.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            warn!(
                "connection {} was released by a panicking scope, recovering",
                self.name
            );
            poisoned.into_inner()
        });
        debug!("acquired connection scope for {}", self.name);
        ConnectionScope {
            guard,
            name: &self.name,
        }
    }
}

impl std::fmt::Debug for DatabaseConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConnection")
            .field("name", &self.name)
            .field("databases", &self.databases)
            .finish_non_exhaustive()
    }
}

/// Exclusive, call-scoped access to a [`DatabaseConnection`].
pub struct ConnectionScope<'a> {
    guard: MutexGuard<'a, Connection>,
    name: &'a str,
}

impl ConnectionScope<'_> {
    pub fn name(&self) -> &str {
        self.name
    }
}

impl Deref for ConnectionScope<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.guard
    }
}

impl Drop for ConnectionScope<'_> {
    fn drop(&mut self) {
        debug!("released connection scope for {}", self.name);
    }
}

/// Lookup table from logical database to its connection, built once at
/// startup.
#[derive(Debug, Clone)]
pub struct DatabaseRegistry {
    connections: BTreeMap<LogicalDatabase, ConnectionHandle>,
}

impl DatabaseRegistry {
    /// Open every configured database. Entries sharing a path share a
    /// connection.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let mut by_path: BTreeMap<PathBuf, BTreeSet<LogicalDatabase>> = BTreeMap::new();
        let mut in_memory = Vec::new();

        for (name, db_config) in &config.databases {
            let database: LogicalDatabase = name.parse()?;
            if db_config.is_in_memory() {
                in_memory.push(database);
            } else {
                by_path
                    .entry(db_config.path.clone())
                    .or_default()
                    .insert(database);
            }
        }

        let mut connections = BTreeMap::new();
        for (path, databases) in by_path {
            let handle = Arc::new(DatabaseConnection::open(&path, databases.clone())?);
            for database in databases {
                connections.insert(database, Arc::clone(&handle));
            }
        }
        for database in in_memory {
            let handle = Arc::new(DatabaseConnection::in_memory([database].into())?);
            connections.insert(database, handle);
        }

        info!("database registry ready with {} database(s)", connections.len());
        Ok(Self { connections })
    }

    /// One private in-memory connection per database.
    pub fn in_memory(databases: &[LogicalDatabase]) -> Result<Self> {
        let mut connections = BTreeMap::new();
        for &database in databases {
            let handle = Arc::new(DatabaseConnection::in_memory([database].into())?);
            connections.insert(database, handle);
        }
        Ok(Self { connections })
    }

    /// Resolve a database by name. Unknown or unconfigured names fail with
    /// [`Error::UnknownDatabase`].
    pub fn fetch(&self, name: &str) -> Result<ConnectionHandle> {
        let database: LogicalDatabase = name.parse()?;
        self.get(database)
    }

    pub fn get(&self, database: LogicalDatabase) -> Result<ConnectionHandle> {
        self.connections
            .get(&database)
            .cloned()
            .ok_or_else(|| Error::UnknownDatabase(database.to_string()))
    }

    pub fn databases(&self) -> impl Iterator<Item = LogicalDatabase> + '_ {
        self.connections.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use bbm_config::DatabaseConfig;

    use super::*;

    fn config_with(entries: &[(&str, DatabaseConfig)]) -> AppConfig {
        let mut config = AppConfig::default();
        config.databases = entries
            .iter()
            .map(|(name, db)| (name.to_string(), db.clone()))
            .collect();
        config
    }

    #[test]
    fn fetch_resolves_configured_databases() {
        let registry =
            DatabaseRegistry::in_memory(&[LogicalDatabase::Main, LogicalDatabase::Ci]).unwrap();

        let main = registry.fetch("main").unwrap();
        let ci = registry.fetch("ci").unwrap();
        assert_eq!(main.name(), "main");
        assert_eq!(ci.name(), "ci");
        assert!(!Arc::ptr_eq(&main, &ci));
    }

    #[test]
    fn fetch_unknown_name_fails() {
        let registry = DatabaseRegistry::in_memory(&[LogicalDatabase::Main]).unwrap();
        let err = registry.fetch("unknown").unwrap_err();
        assert!(matches!(err, Error::UnknownDatabase(ref name) if name == "unknown"));
    }

    #[test]
    fn fetch_unconfigured_database_fails() {
        let registry = DatabaseRegistry::in_memory(&[LogicalDatabase::Main]).unwrap();
        let err = registry.fetch("ci").unwrap_err();
        assert!(matches!(err, Error::UnknownDatabase(ref name) if name == "ci"));
    }

    #[test]
    fn from_config_rejects_unknown_database_keys() {
        let config = config_with(&[("geo", DatabaseConfig::in_memory())]);
        let err = DatabaseRegistry::from_config(&config).unwrap_err();
        assert!(matches!(err, Error::UnknownDatabase(_)));
    }

    #[test]
    fn from_config_shares_connection_for_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let shared = DatabaseConfig {
            path: dir.path().join("gitlab.db"),
        };
        let config = config_with(&[("main", shared.clone()), ("ci", shared)]);

        let registry = DatabaseRegistry::from_config(&config).unwrap();
        let main = registry.get(LogicalDatabase::Main).unwrap();
        let ci = registry.get(LogicalDatabase::Ci).unwrap();

        assert!(Arc::ptr_eq(&main, &ci));
        assert_eq!(ci.name(), "main");
        assert!(ci.serves(LogicalDatabase::Main));
        assert!(ci.serves(LogicalDatabase::Ci));
    }

    #[test]
    fn from_config_separates_distinct_paths() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(&[
            (
                "main",
                DatabaseConfig {
                    path: dir.path().join("main.db"),
                },
            ),
            (
                "ci",
                DatabaseConfig {
                    path: dir.path().join("nested").join("ci.db"),
                },
            ),
        ]);

        let registry = DatabaseRegistry::from_config(&config).unwrap();
        assert_eq!(registry.len(), 2);
        let ci = registry.get(LogicalDatabase::Ci).unwrap();
        assert!(!ci.serves(LogicalDatabase::Main));
        assert!(dir.path().join("nested").join("ci.db").exists());
    }

    #[test]
    fn scope_is_released_after_panic() {
        let connection = DatabaseConnection::in_memory([LogicalDatabase::Main].into()).unwrap();

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _scope = connection.scope();
            panic!("query blew up");
        }));
        assert!(result.is_err());

        let scope = connection.scope();
        let one: i64 = scope.query_row("SELECT 1", [], |row| row.get(0)).unwrap();
        assert_eq!(one, 1);
    }

    #[test]
    fn scope_is_released_on_drop() {
        let connection = DatabaseConnection::in_memory([LogicalDatabase::Main].into()).unwrap();
        {
            let scope = connection.scope();
            assert_eq!(scope.name(), "main");
        }
        let scope = connection.scope();
        assert!(scope.is_autocommit());
    }
}
