//! Merge engine integration tests
//!
//! Build small revision DAGs through the repository layer and drive head
//! reduction, conflict detection and manual resolution against the
//! in-memory store.

use fieldbook_core::repository;
use fieldbook_core::{
    DataContext, FormRecord, MemoryStore, MergeState, RecordId, RevisionCache, RevisionId,
    UserMergeResult, find_conflicting_fields, get_initial_merge_details,
    get_merge_information_for_head, merge_heads, merge_revisions, save_user_merge_result,
};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;

fn context() -> DataContext {
    // RUST_LOG=fieldbook_core=debug shows the merge walk when debugging.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    DataContext::with_store(Arc::new(MemoryStore::new()))
}

fn form(
    record_id: &RecordId,
    base: Option<&RevisionId>,
    fields: &[(&str, Value)],
) -> FormRecord {
    let mut data = BTreeMap::new();
    let mut annotations = BTreeMap::new();
    let mut field_types = BTreeMap::new();
    for (name, value) in fields {
        data.insert(name.to_string(), value.clone());
        annotations.insert(name.to_string(), Value::Null);
        field_types.insert(name.to_string(), "core::string".to_string());
    }
    FormRecord {
        record_id: record_id.clone(),
        base_revision_id: base.cloned(),
        record_type: "Survey".to_string(),
        data,
        annotations,
        field_types,
        updated: chrono::Utc::now(),
        updated_by: "tester".to_string(),
        relationship: None,
    }
}

/// Root revision with the given fields, returning its id.
async fn seed_record(
    context: &DataContext,
    record_id: &RecordId,
    fields: &[(&str, Value)],
) -> RevisionId {
    repository::upsert(context, &form(record_id, None, fields))
        .await
        .unwrap()
}

/// Branch off `base` with the given full field map, leaving `base` a head
/// as well when it already was one.
async fn branch(
    context: &DataContext,
    record_id: &RecordId,
    base: &RevisionId,
    fields: &[(&str, Value)],
) -> RevisionId {
    repository::upsert(context, &form(record_id, Some(base), fields))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_fast_forward_keeps_descendant() {
    let context = context();
    let record_id = RecordId::generate();

    let r1 = seed_record(&context, &record_id, &[("site", json!("A"))]).await;
    // Create a child of r1 without retiring r1 as a head, as replication
    // would when the child arrives before the head update.
    let r2 = RevisionId::generate();
    repository::add_revision_from_form(
        &context,
        &form(&record_id, Some(&r1), &[("site", json!("B"))]),
        &r2,
    )
    .await
    .unwrap();
    repository::update_heads(&context, &record_id, &[], &r2).await.unwrap();

    let record = repository::get_record(&context, &record_id).await.unwrap();
    assert_eq!(record.heads.len(), 2);

    let fully_merged = merge_heads(&context, &record_id).await.unwrap();
    assert!(fully_merged);

    let record = repository::get_record(&context, &record_id).await.unwrap();
    assert_eq!(record.heads, vec![r2]);
    // Fast-forward creates no revision.
    assert_eq!(record.revisions.len(), 2);
    assert!(record.invariants_hold());
}

#[tokio::test]
async fn test_disjoint_field_edits_automerge() {
    let context = context();
    let record_id = RecordId::generate();

    let r1 = seed_record(
        &context,
        &record_id,
        &[("site", json!("A")), ("depth", json!(1))],
    )
    .await;
    branch(
        &context,
        &record_id,
        &r1,
        &[("site", json!("B")), ("depth", json!(1))],
    )
    .await;
    branch(
        &context,
        &record_id,
        &r1,
        &[("site", json!("A")), ("depth", json!(2))],
    )
    .await;

    let fully_merged = merge_heads(&context, &record_id).await.unwrap();
    assert!(fully_merged);

    let record = repository::get_record(&context, &record_id).await.unwrap();
    assert_eq!(record.heads.len(), 1);
    assert_eq!(record.revisions.len(), 4);
    assert!(record.invariants_hold());

    // The merged revision took each side's change.
    let merged = repository::full_record_data(&context, &record_id, &record.heads[0], false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(merged.data["site"], json!("B"));
    assert_eq!(merged.data["depth"], json!(2));
}

#[tokio::test]
async fn test_same_value_different_avps_conflict() {
    let context = context();
    let record_id = RecordId::generate();

    let r0 = seed_record(&context, &record_id, &[("site", json!("A0"))]).await;
    let r1 = branch(&context, &record_id, &r0, &[("site", json!("A"))]).await;
    // Both branches set the field to the same new value. The AVPs differ,
    // so this is still a conflict.
    branch(&context, &record_id, &r1, &[("site", json!("B"))]).await;
    branch(&context, &record_id, &r1, &[("site", json!("B"))]).await;

    let fully_merged = merge_heads(&context, &record_id).await.unwrap();
    assert!(!fully_merged);

    let record = repository::get_record(&context, &record_id).await.unwrap();
    assert_eq!(record.heads.len(), 2);
    assert_eq!(record.revisions.len(), 4);
}

#[tokio::test]
async fn test_pairwise_merge_reports_sides() {
    let context = context();
    let record_id = RecordId::generate();

    let r1 = seed_record(
        &context,
        &record_id,
        &[("site", json!("A")), ("depth", json!(1))],
    )
    .await;
    let us = branch(
        &context,
        &record_id,
        &r1,
        &[("site", json!("B")), ("depth", json!(1))],
    )
    .await;
    let them = branch(
        &context,
        &record_id,
        &r1,
        &[("site", json!("A")), ("depth", json!(2))],
    )
    .await;

    let mut cache = RevisionCache::new();
    let result = merge_revisions(&context, &mut cache, &us, &them).await.unwrap();
    assert_eq!(result.state(), MergeState::MergedBoth);
    assert!(result.is_successful().unwrap());

    let merged = repository::get_revision(&context, result.new_revision_id().unwrap())
        .await
        .unwrap();
    let mut expected_parents = vec![us, them];
    expected_parents.sort();
    assert_eq!(merged.parents, expected_parents);
    assert_eq!(merged.created_by, "automerge");
}

#[tokio::test]
async fn test_delete_against_edit_does_not_automerge() {
    let context = context();
    let record_id = RecordId::generate();

    let r1 = seed_record(&context, &record_id, &[("site", json!("A"))]).await;
    branch(&context, &record_id, &r1, &[("site", json!("B"))]).await;
    // The other branch deletes at r1.
    repository::set_deleted_flag(&context, &record_id, &r1, "tester", true)
        .await
        .unwrap();

    let fully_merged = merge_heads(&context, &record_id).await.unwrap();
    assert!(!fully_merged);

    let record = repository::get_record(&context, &record_id).await.unwrap();
    assert_eq!(record.heads.len(), 2);
}

#[tokio::test]
async fn test_three_disjoint_heads_reduce_to_one() {
    let context = context();
    let record_id = RecordId::generate();

    let base_fields = [
        ("a", json!(0)),
        ("b", json!(0)),
        ("c", json!(0)),
    ];
    let r1 = seed_record(&context, &record_id, &base_fields).await;
    branch(
        &context,
        &record_id,
        &r1,
        &[("a", json!(1)), ("b", json!(0)), ("c", json!(0))],
    )
    .await;
    branch(
        &context,
        &record_id,
        &r1,
        &[("a", json!(0)), ("b", json!(1)), ("c", json!(0))],
    )
    .await;
    branch(
        &context,
        &record_id,
        &r1,
        &[("a", json!(0)), ("b", json!(0)), ("c", json!(1))],
    )
    .await;

    let fully_merged = merge_heads(&context, &record_id).await.unwrap();
    assert!(fully_merged);

    let record = repository::get_record(&context, &record_id).await.unwrap();
    assert_eq!(record.heads.len(), 1);
    // 4 original revisions plus 2 pairwise merges.
    assert_eq!(record.revisions.len(), 6);

    let merged = repository::full_record_data(&context, &record_id, &record.heads[0], false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(merged.data["a"], json!(1));
    assert_eq!(merged.data["b"], json!(1));
    assert_eq!(merged.data["c"], json!(1));
}

#[tokio::test]
async fn test_manual_merge_resolves_conflict() {
    let context = context();
    let record_id = RecordId::generate();

    let r1 = seed_record(
        &context,
        &record_id,
        &[("site", json!("A")), ("note", json!("x"))],
    )
    .await;
    let h1 = branch(
        &context,
        &record_id,
        &r1,
        &[("site", json!("B")), ("note", json!("x"))],
    )
    .await;
    let h2 = branch(
        &context,
        &record_id,
        &r1,
        &[("site", json!("C")), ("note", json!("x"))],
    )
    .await;

    assert!(!merge_heads(&context, &record_id).await.unwrap());

    let conflicting = find_conflicting_fields(&context, &record_id, &h1).await.unwrap();
    assert_eq!(conflicting, vec!["site".to_string()]);

    let info = get_merge_information_for_head(&context, &record_id, &h1)
        .await
        .unwrap();
    assert_eq!(info.fields["site"].data, json!("B"));
    let chosen_site = info.fields["site"].avp_id.clone();
    let shared_note = info.fields["note"].avp_id.clone();

    let mut parents = vec![h1, h2];
    parents.sort();
    let mut field_choices = BTreeMap::new();
    field_choices.insert("site".to_string(), Some(chosen_site));
    field_choices.insert("note".to_string(), Some(shared_note));

    let resolution = UserMergeResult {
        record_id: record_id.clone(),
        parents: parents.clone(),
        updated: chrono::Utc::now(),
        updated_by: "arbiter".to_string(),
        record_type: "Survey".to_string(),
        field_choices,
        field_types: BTreeMap::new(),
        relationship: Default::default(),
    };
    let resolved = save_user_merge_result(&context, &resolution).await.unwrap();

    let record = repository::get_record(&context, &record_id).await.unwrap();
    assert_eq!(record.heads, vec![resolved.clone()]);
    assert!(record.invariants_hold());

    let revision = repository::get_revision(&context, &resolved).await.unwrap();
    assert_eq!(revision.parents, parents);
    assert_eq!(revision.created_by, "arbiter");

    let full = repository::full_record_data(&context, &record_id, &resolved, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(full.data["site"], json!("B"));
    assert_eq!(full.data["note"], json!("x"));
}

#[tokio::test]
async fn test_initial_merge_details_cover_all_heads() {
    let context = context();
    let record_id = RecordId::generate();

    let r1 = seed_record(&context, &record_id, &[("site", json!("A"))]).await;
    let h1 = branch(&context, &record_id, &r1, &[("site", json!("B"))]).await;
    let h2 = branch(&context, &record_id, &r1, &[("site", json!("C"))]).await;

    let details = get_initial_merge_details(&context, &record_id)
        .await
        .unwrap()
        .expect("at least one head hydrates");

    assert_eq!(details.available_heads.len(), 2);
    assert!(details.available_heads.contains_key(&h1));
    assert!(details.available_heads.contains_key(&h2));
    assert!(!details.available_heads[&h1].deleted);
    assert!(details.available_heads.contains_key(&details.initial_head));
    assert_eq!(
        details.initial_head_data.revision_id,
        details.initial_head
    );
    assert!(details.initial_head_data.fields.contains_key("site"));
}

#[tokio::test]
async fn test_neither_side_choice_nulls_field() {
    let context = context();
    let record_id = RecordId::generate();

    let r1 = seed_record(&context, &record_id, &[("site", json!("A"))]).await;
    let h1 = branch(&context, &record_id, &r1, &[("site", json!("B"))]).await;
    let h2 = branch(&context, &record_id, &r1, &[("site", json!("C"))]).await;

    let mut parents = vec![h1, h2];
    parents.sort();
    let mut field_choices = BTreeMap::new();
    field_choices.insert("site".to_string(), None);
    let mut field_types = BTreeMap::new();
    field_types.insert("site".to_string(), "core::string".to_string());

    let resolved = save_user_merge_result(
        &context,
        &UserMergeResult {
            record_id: record_id.clone(),
            parents,
            updated: chrono::Utc::now(),
            updated_by: "arbiter".to_string(),
            record_type: "Survey".to_string(),
            field_choices,
            field_types,
            relationship: Default::default(),
        },
    )
    .await
    .unwrap();

    let full = repository::full_record_data(&context, &record_id, &resolved, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(full.data["site"], Value::Null);
    assert_eq!(full.field_types["site"], "core::string");
}

#[tokio::test]
async fn test_no_shared_ancestor_is_an_error() {
    let context = context();
    let record_id = RecordId::generate();

    // Two root revisions for the same record id, as can happen when two
    // devices create the same record independently without replication.
    let r1 = seed_record(&context, &record_id, &[("site", json!("A"))]).await;
    let r2 = RevisionId::generate();
    repository::add_revision_from_form(
        &context,
        &form(&record_id, None, &[("site", json!("B"))]),
        &r2,
    )
    .await
    .unwrap();
    repository::update_heads(&context, &record_id, &[], &r2).await.unwrap();

    let mut cache = RevisionCache::new();
    let err = merge_revisions(&context, &mut cache, &r1, &r2).await.unwrap_err();
    assert!(matches!(
        err,
        fieldbook_core::DataError::NoSharedRevision { .. }
    ));
}
