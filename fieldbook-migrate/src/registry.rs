//! Migration step registry
//!
//! Every schema change ships as a single-version step: a pure function from
//! one document to a keep/update/delete decision. The registry holds the
//! ordered step list plus the per-database-type version targets, and can
//! compute the exact chain of steps needed to bring a database from its
//! current version to the target.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt;

use fieldbook_core::{DataError, JsonDoc, Result};

/// Which logical database a step applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DatabaseType {
    #[serde(rename = "DATA")]
    Data,
    #[serde(rename = "PEOPLE")]
    People,
    #[serde(rename = "PROJECTS")]
    Projects,
    #[serde(rename = "TEMPLATES")]
    Templates,
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DatabaseType::Data => "DATA",
            DatabaseType::People => "PEOPLE",
            DatabaseType::Projects => "PROJECTS",
            DatabaseType::Templates => "TEMPLATES",
        };
        f.write_str(name)
    }
}

/// What a step decided for one document.
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationAction {
    /// Document is already in the target shape.
    Keep,
    /// Replace the document with this body (`_id`/`_rev` are preserved by
    /// the runner).
    Update(JsonDoc),
    /// Remove the document.
    Delete,
}

type MigrationFn = Box<dyn Fn(&JsonDoc) -> Result<MigrationAction> + Send + Sync>;

/// One single-version migration step.
pub struct MigrationStep {
    pub db_type: DatabaseType,
    pub from: u32,
    pub to: u32,
    pub description: String,
    run: MigrationFn,
}

impl MigrationStep {
    pub fn new(
        db_type: DatabaseType,
        from: u32,
        to: u32,
        description: impl Into<String>,
        run: impl Fn(&JsonDoc) -> Result<MigrationAction> + Send + Sync + 'static,
    ) -> Self {
        Self {
            db_type,
            from,
            to,
            description: description.into(),
            run: Box::new(run),
        }
    }

    /// Apply the step to one document. An error marks this document as
    /// failed without affecting the rest of the batch.
    pub fn run(&self, doc: &JsonDoc) -> Result<MigrationAction> {
        (self.run)(doc)
    }
}

impl fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationStep")
            .field("db_type", &self.db_type)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("description", &self.description)
            .finish()
    }
}

/// Version bounds for one database type.
#[derive(Debug, Clone, Copy)]
pub struct VersionTarget {
    /// Version assumed for a database seen for the first time.
    pub default_version: u32,
    /// Version every database of this type should be brought to.
    pub target_version: u32,
}

/// Ordered migration steps plus per-type version targets.
pub struct MigrationRegistry {
    steps: Vec<MigrationStep>,
    targets: BTreeMap<DatabaseType, VersionTarget>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            targets: BTreeMap::new(),
        }
    }

    pub fn register_step(&mut self, step: MigrationStep) {
        self.steps.push(step);
    }

    pub fn set_target(&mut self, db_type: DatabaseType, target: VersionTarget) {
        self.targets.insert(db_type, target);
    }

    /// Version bounds for a database type; absence is a registry
    /// configuration error.
    pub fn target(&self, db_type: DatabaseType) -> Result<VersionTarget> {
        self.targets.get(&db_type).copied().ok_or_else(|| {
            DataError::MigrationPath(format!("no version target registered for {db_type}"))
        })
    }

    fn find_step(&self, db_type: DatabaseType, from: u32, to: u32) -> Option<&MigrationStep> {
        self.steps
            .iter()
            .find(|step| step.db_type == db_type && step.from == from && step.to == to)
    }

    /// The ordered chain of steps from `current_version` to the type's
    /// target. Empty when already at the target. Fails when the stored
    /// version is ahead of the target (downgrades are unsupported) or a
    /// step in the chain is missing.
    pub fn identify_migrations(
        &self,
        db_type: DatabaseType,
        current_version: u32,
    ) -> Result<Vec<&MigrationStep>> {
        let target = self.target(db_type)?.target_version;

        if current_version > target {
            return Err(DataError::MigrationPath(format!(
                "cannot downgrade {db_type}: database is at version {current_version}, target is {target}"
            )));
        }

        let mut chain = Vec::new();
        for version in current_version..target {
            let step = self.find_step(db_type, version, version + 1).ok_or_else(|| {
                DataError::MigrationPath(format!(
                    "missing {db_type} migration from version {version} to {}",
                    version + 1
                ))
            })?;
            chain.push(step);
        }
        Ok(chain)
    }
}

impl Default for MigrationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Flatten the legacy `other_roles` list of a people document into the
/// current `global_roles` model. Every user is at least a general user.
fn people_v1_to_v2(doc: &JsonDoc) -> Result<MigrationAction> {
    let mut updated = doc.clone();
    let mut global_roles = vec![json!("GENERAL_USER")];

    let legacy = doc
        .get("other_roles")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for role in &legacy {
        match role.as_str() {
            Some("cluster-admin") => global_roles.push(json!("GENERAL_ADMIN")),
            Some("notebook-creator") => global_roles.push(json!("GENERAL_CREATOR")),
            Some(other) => {
                tracing::warn!(role = other, "legacy role has no mapping, dropping");
            }
            None => {}
        }
    }

    if let Some(map) = updated.as_object_mut() {
        map.remove("other_roles");
        map.insert("global_roles".to_string(), Value::Array(global_roles));
    }
    Ok(MigrationAction::Update(updated))
}

/// Stamp the `status` field introduced in projects v2; existing documents
/// predate it and are all live projects.
fn projects_v1_to_v2(doc: &JsonDoc) -> Result<MigrationAction> {
    if doc.get("status").is_some() {
        return Ok(MigrationAction::Keep);
    }
    let mut updated = doc.clone();
    if let Some(map) = updated.as_object_mut() {
        map.insert("status".to_string(), json!("active"));
    }
    Ok(MigrationAction::Update(updated))
}

/// The registry with all known steps and current version targets.
pub fn default_registry() -> MigrationRegistry {
    let mut registry = MigrationRegistry::new();

    registry.set_target(
        DatabaseType::Data,
        VersionTarget {
            default_version: 1,
            target_version: 1,
        },
    );
    registry.set_target(
        DatabaseType::People,
        VersionTarget {
            default_version: 1,
            target_version: 2,
        },
    );
    registry.set_target(
        DatabaseType::Projects,
        VersionTarget {
            default_version: 1,
            target_version: 2,
        },
    );
    registry.set_target(
        DatabaseType::Templates,
        VersionTarget {
            default_version: 1,
            target_version: 1,
        },
    );

    registry.register_step(MigrationStep::new(
        DatabaseType::People,
        1,
        2,
        "Flatten legacy other_roles into the global_roles permission model",
        people_v1_to_v2,
    ));
    registry.register_step(MigrationStep::new(
        DatabaseType::Projects,
        1,
        2,
        "Add the project status field, defaulting existing projects to active",
        projects_v1_to_v2,
    ));

    registry
}
