use bbm_common::Result;
use bbm_db::{BatchedMigration, ConnectionHandle, DatabaseRegistry, GitlabSchemaSet};
use tracing::debug;

/// The most recently created batched migrations whose schema tag the
/// database's connection serves.
#[derive(Debug, Clone)]
pub struct BatchedBackgroundMigrationsFinder {
    connection: ConnectionHandle,
    gitlab_schemas: GitlabSchemaSet,
}

impl BatchedBackgroundMigrationsFinder {
    pub const RETURNED_MIGRATIONS: usize = 10;

    /// Resolves the connection and its schema set eagerly, so the query in
    /// [`execute`](Self::execute) only depends on this value.
    pub fn new(registry: &DatabaseRegistry, database: &str) -> Result<Self> {
        let connection = registry.fetch(database)?;
        let gitlab_schemas = connection.gitlab_schemas();
        Ok(Self {
            connection,
            gitlab_schemas,
        })
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn gitlab_schemas(&self) -> &GitlabSchemaSet {
        &self.gitlab_schemas
    }

    pub fn execute(&self) -> Result<Vec<BatchedMigration>> {
        let scope = self.connection.scope();
        let migrations = BatchedMigration::ordered_by_created_at_desc()
            .for_gitlab_schema(self.gitlab_schemas.iter().copied())
            .limit(Self::RETURNED_MIGRATIONS)
            .load(&scope)?;
        debug!(
            "found {} batched background migration(s) on {}",
            migrations.len(),
            scope.name()
        );
        Ok(migrations)
    }
}
