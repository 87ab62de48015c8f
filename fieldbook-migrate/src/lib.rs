//! Fieldbook Migration Framework
//!
//! Versioned schema migrations for the document databases behind a
//! fieldbook deployment:
//! - Step registry: one keep/update/delete function per version bump
//! - Batched runner with per-document failure isolation
//! - Durable per-database migration log driving idempotent upgrades

pub mod registry;
pub mod service;

pub use registry::{
    DatabaseType, MigrationAction, MigrationRegistry, MigrationStep, VersionTarget,
    default_registry,
};
pub use service::{
    DatabaseTarget, DbHealth, MigrationLogEntry, MigrationOutcome, MigrationStatus,
    MigrationsDocument, build_default_migration_doc, identify_migrations, is_up_to_date,
    migrate_dbs, perform_migration,
};
