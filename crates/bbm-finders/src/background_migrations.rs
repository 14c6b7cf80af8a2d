use bbm_common::Result;
use bbm_db::{BatchedMigration, ConnectionHandle, DatabaseRegistry};
use tracing::debug;

/// Every batched migration stored behind one logical database's connection.
#[derive(Debug, Clone)]
pub struct BackgroundMigrationsFinder {
    connection: ConnectionHandle,
}

impl BackgroundMigrationsFinder {
    /// Resolves `database` up front; unknown names fail here, before any
    /// query runs.
    pub fn new(registry: &DatabaseRegistry, database: &str) -> Result<Self> {
        Ok(Self {
            connection: registry.fetch(database)?,
        })
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn execute(&self) -> Result<Vec<BatchedMigration>> {
        let scope = self.connection.scope();
        let migrations = BatchedMigration::all().load(&scope)?;
        debug!(
            "found {} background migration(s) on {}",
            migrations.len(),
            scope.name()
        );
        Ok(migrations)
    }
}
