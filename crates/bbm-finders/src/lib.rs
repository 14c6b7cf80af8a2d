//! Read projections over the batched background migrations of one logical
//! database, for admin monitoring.

pub mod background_migrations;
pub mod batched_background_migrations;

pub use background_migrations::BackgroundMigrationsFinder;
pub use batched_background_migrations::BatchedBackgroundMigrationsFinder;
