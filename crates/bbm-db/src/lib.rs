pub mod batched_migration;
pub mod database;
pub mod helpers;
pub mod migrations;
pub mod registry;
pub mod schema;

pub use batched_migration::{
    BatchedMigration, BatchedMigrationQuery, MigrationStatus, NewBatchedMigration,
};
pub use database::LogicalDatabase;
pub use helpers::{
    BATCH_MIN_DELAY, QueueOptions, advance_cursor, delete_batched_background_migration,
    find_for_configuration, gitlab_schema_from_context, queue_batched_background_migration,
};
pub use registry::{ConnectionHandle, ConnectionScope, DatabaseConnection, DatabaseRegistry};
pub use schema::{GitlabSchema, GitlabSchemaSet, gitlab_schemas_for_connection};
