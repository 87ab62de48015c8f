//! Migration runner
//!
//! Streams every document of a database through a step function in fixed
//! batches, isolating per-document failures so one bad document cannot
//! block the rest. Progress is recorded in a `MigrationsDocument` per
//! database: the durable log of which version each database reached and
//! how each attempt went. The version only ever advances past steps that
//! completed without issues, so a crashed or failed run resumes from the
//! last good version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, warn};

use fieldbook_core::store::{
    AllDocsOptions, DESIGN_DOC_PREFIX, MIGRATIONS_BY_DB_INDEX, doc_id, doc_rev, to_doc,
};
use fieldbook_core::{DataError, DocumentStore, JsonDoc, Result};

use crate::registry::{DatabaseType, MigrationAction, MigrationRegistry, MigrationStep};

/// Documents are streamed through a step in pages of this size.
const MIGRATION_BATCH_SIZE: usize = 250;

/// Author recorded on log entries not attributable to a person.
const SYSTEM_USER: &str = "system";

/// Health of a database with respect to its migrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbHealth {
    #[serde(rename = "healthy")]
    Healthy,
    #[serde(rename = "not-healthy")]
    NotHealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStatus {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "failure")]
    Failure,
}

/// One attempt at moving a database between versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationLogEntry {
    pub from: u32,
    pub to: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub launched_by: String,
    pub status: MigrationStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
    pub notes: String,
}

/// Per-database migration state, stored in the migrations database and
/// indexed by `(db_type, db_name)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationsDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub db_type: DatabaseType,
    pub db_name: String,
    /// The version the database has verifiably reached.
    pub version: u32,
    pub status: DbHealth,
    pub migration_log: Vec<MigrationLogEntry>,
}

/// Seed state for a database seen for the first time: assumed to be at the
/// type's default version, with one synthetic success entry saying so.
pub fn build_default_migration_doc(
    registry: &MigrationRegistry,
    db_type: DatabaseType,
    db_name: &str,
) -> Result<MigrationsDocument> {
    let version = registry.target(db_type)?.default_version;
    let now = Utc::now();
    Ok(MigrationsDocument {
        id: format!("migration-{}", uuid::Uuid::new_v4()),
        rev: None,
        db_type,
        db_name: db_name.to_string(),
        version,
        status: DbHealth::Healthy,
        migration_log: vec![MigrationLogEntry {
            from: 0,
            to: version,
            started_at: now,
            completed_at: now,
            launched_by: SYSTEM_USER.to_string(),
            status: MigrationStatus::Success,
            issues: Vec::new(),
            notes: "Initial automatic migration record. No operation performed - the database is assumed to be at the default version.".to_string(),
        }],
    })
}

/// Whether the database already sits at its type's target version.
pub fn is_up_to_date(registry: &MigrationRegistry, doc: &MigrationsDocument) -> Result<bool> {
    Ok(registry.target(doc.db_type)?.target_version == doc.version)
}

/// The chain of steps this database still needs.
pub fn identify_migrations<'a>(
    registry: &'a MigrationRegistry,
    doc: &MigrationsDocument,
) -> Result<Vec<&'a MigrationStep>> {
    registry.identify_migrations(doc.db_type, doc.version).map_err(|err| {
        DataError::MigrationPath(format!(
            "{} database {} at version {}: {err}",
            doc.db_type, doc.db_name, doc.version
        ))
    })
}

/// Aggregate result of running one step over one database.
#[derive(Debug, Default)]
pub struct MigrationOutcome {
    /// Per-document (or batch-level) failures, human readable.
    pub issues: Vec<String>,
    pub processed: usize,
    pub written: usize,
    pub deleted: usize,
}

impl MigrationOutcome {
    pub fn succeeded(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Run one step over every non-design document of a database.
///
/// Never fails: a document whose step function or write fails lands in
/// `issues` and processing continues; an unreachable database is reported
/// as a single batch-level issue.
pub async fn perform_migration(
    store: &dyn DocumentStore,
    step: &MigrationStep,
) -> MigrationOutcome {
    let mut outcome = MigrationOutcome::default();
    let mut processed_ids: BTreeSet<String> = BTreeSet::new();
    let mut bookmark: Option<String> = None;

    loop {
        let rows = match store
            .all_docs(AllDocsOptions::page(bookmark.clone(), MIGRATION_BATCH_SIZE))
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                outcome.issues.push(format!("Error processing batch: {err}"));
                break;
            }
        };
        let Some(last) = rows.last() else {
            break;
        };
        bookmark = Some(last.id.clone());

        for row in rows {
            if row.id.starts_with(DESIGN_DOC_PREFIX) || processed_ids.contains(&row.id) {
                continue;
            }
            let Some(doc) = row.doc else { continue };
            processed_ids.insert(row.id.clone());

            if let Err(err) = apply_step(store, step, &doc, &mut outcome).await {
                outcome
                    .issues
                    .push(format!("Error migrating document {}: {err}", row.id));
            }
        }
    }

    outcome.processed = processed_ids.len();
    outcome
}

async fn apply_step(
    store: &dyn DocumentStore,
    step: &MigrationStep,
    doc: &JsonDoc,
    outcome: &mut MigrationOutcome,
) -> Result<()> {
    match step.run(doc)? {
        MigrationAction::Keep => {}
        MigrationAction::Update(mut updated) => {
            // The step function decides the body; identity and the
            // concurrency token always come from the stored document.
            let map = updated
                .as_object_mut()
                .ok_or_else(|| DataError::Backend("updated document is not an object".to_string()))?;
            map.insert("_id".to_string(), doc["_id"].clone());
            map.insert("_rev".to_string(), doc["_rev"].clone());
            store.put(updated).await?;
            outcome.written += 1;
        }
        MigrationAction::Delete => {
            let id = doc_id(doc)
                .ok_or_else(|| DataError::Backend("document missing _id".to_string()))?;
            let rev = doc_rev(doc)
                .ok_or_else(|| DataError::Backend("document missing _rev".to_string()))?;
            store.delete(id, rev).await?;
            outcome.deleted += 1;
        }
    }
    Ok(())
}

/// One database to bring up to its target version.
pub struct DatabaseTarget {
    pub db_type: DatabaseType,
    pub db_name: String,
    pub store: Arc<dyn DocumentStore>,
}

/// Load the migration document for a database, or seed and persist the
/// default one.
async fn load_or_create_migration_doc(
    registry: &MigrationRegistry,
    migration_store: &dyn DocumentStore,
    db_type: DatabaseType,
    db_name: &str,
) -> Result<MigrationsDocument> {
    let key = Value::Array(vec![serde_json::to_value(db_type)?, json!(db_name)]);
    let rows = migration_store
        .query(MIGRATIONS_BY_DB_INDEX, Some(vec![key]))
        .await?;

    if let Some(doc) = rows.into_iter().find_map(|row| row.doc) {
        return Ok(serde_json::from_value(doc)?);
    }

    let mut doc = build_default_migration_doc(registry, db_type, db_name)?;
    let result = migration_store.put(to_doc(&doc)?).await?;
    doc.rev = Some(result.rev);
    Ok(doc)
}

/// Bring every listed database up to its target version, recording each
/// attempt in the migrations database.
///
/// Databases already at their target are skipped without any writes. A
/// failing step stops that database's chain: its version stays at the last
/// good step, its status becomes not-healthy, and the remaining databases
/// are still processed. Failures are recorded on the migration document
/// rather than returned; only migrations-database access errors propagate.
pub async fn migrate_dbs(
    registry: &MigrationRegistry,
    dbs: &[DatabaseTarget],
    migration_store: &dyn DocumentStore,
    user_id: Option<&str>,
) -> Result<()> {
    let user_id = user_id.unwrap_or(SYSTEM_USER);

    for db in dbs {
        let started_at = Utc::now();
        let mut doc =
            load_or_create_migration_doc(registry, migration_store, db.db_type, &db.db_name)
                .await?;

        if is_up_to_date(registry, &doc)? {
            info!(db_type = %db.db_type, db_name = %db.db_name, version = doc.version,
                "database already up to date");
            continue;
        }

        let steps = match identify_migrations(registry, &doc) {
            Ok(steps) => steps,
            Err(err) => {
                error!(db_type = %db.db_type, db_name = %db.db_name, %err,
                    "cannot build migration path");
                record_path_failure(migration_store, &mut doc, started_at, user_id, &err)
                    .await?;
                continue;
            }
        };
        if steps.is_empty() {
            continue;
        }

        let target_version = registry.target(db.db_type)?.target_version;
        let mut entry = MigrationLogEntry {
            from: doc.version,
            to: target_version,
            started_at,
            completed_at: started_at,
            launched_by: user_id.to_string(),
            status: MigrationStatus::Success,
            issues: Vec::new(),
            notes: format!("Migrating from v{} to v{target_version}", doc.version),
        };

        let mut current_version = doc.version;
        for step in steps {
            info!(db_type = %db.db_type, db_name = %db.db_name,
                from = step.from, to = step.to, description = %step.description,
                "applying migration step");
            entry.notes.push_str(&format!("\n- {}", step.description));

            let outcome = perform_migration(db.store.as_ref(), step).await;
            info!(processed = outcome.processed, written = outcome.written,
                deleted = outcome.deleted, "migration step finished");

            if outcome.succeeded() {
                current_version = step.to;
            } else {
                warn!(db_type = %db.db_type, db_name = %db.db_name,
                    issues = outcome.issues.len(), "migration step reported issues");
                entry.issues.extend(outcome.issues);
                entry.status = MigrationStatus::Failure;
                break;
            }
        }

        entry.completed_at = Utc::now();
        doc.version = current_version;
        doc.status = match entry.status {
            MigrationStatus::Success => DbHealth::Healthy,
            MigrationStatus::Failure => DbHealth::NotHealthy,
        };
        doc.migration_log.push(entry);

        let result = migration_store.put(to_doc(&doc)?).await?;
        doc.rev = Some(result.rev);
    }
    Ok(())
}

/// Record an unbuildable migration path on the document without advancing
/// its version.
async fn record_path_failure(
    migration_store: &dyn DocumentStore,
    doc: &mut MigrationsDocument,
    started_at: DateTime<Utc>,
    user_id: &str,
    err: &DataError,
) -> Result<()> {
    doc.status = DbHealth::NotHealthy;
    doc.migration_log.push(MigrationLogEntry {
        from: doc.version,
        to: doc.version,
        started_at,
        completed_at: Utc::now(),
        launched_by: user_id.to_string(),
        status: MigrationStatus::Failure,
        issues: vec![err.to_string()],
        notes: "Migration failed before any documents were touched".to_string(),
    });
    let result = migration_store.put(to_doc(doc)?).await?;
    doc.rev = Some(result.rev);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::default_registry;

    #[test]
    fn test_default_doc_is_healthy_with_synthetic_entry() {
        let registry = default_registry();
        let doc =
            build_default_migration_doc(&registry, DatabaseType::People, "people-main").unwrap();
        assert_eq!(doc.version, 1);
        assert_eq!(doc.status, DbHealth::Healthy);
        assert_eq!(doc.migration_log.len(), 1);
        assert_eq!(doc.migration_log[0].status, MigrationStatus::Success);
        assert_eq!(doc.migration_log[0].launched_by, "system");
    }

    #[test]
    fn test_status_serialization_shape() {
        let json = serde_json::to_value(DbHealth::NotHealthy).unwrap();
        assert_eq!(json, "not-healthy");
        let json = serde_json::to_value(MigrationStatus::Failure).unwrap();
        assert_eq!(json, "failure");
        let json = serde_json::to_value(DatabaseType::People).unwrap();
        assert_eq!(json, "PEOPLE");
    }

    #[test]
    fn test_identify_wraps_db_details() {
        let registry = default_registry();
        let mut doc =
            build_default_migration_doc(&registry, DatabaseType::People, "people-main").unwrap();
        doc.version = 9;
        let err = identify_migrations(&registry, &doc).unwrap_err();
        assert!(err.to_string().contains("people-main"));
    }
}
