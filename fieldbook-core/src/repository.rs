//! Repository layer: typed CRUD over the document store
//!
//! Converts between the stored document model and the hydrated forms the
//! caller works with. All reads and writes go through the context's
//! document store; nothing is cached beyond a single logical operation.
//! Head advancement is a safe-write (set union, difference, sort) so it can
//! be replayed under optimistic-concurrency retries.

use futures::future::try_join_all;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

use crate::attachments::{dump_avp, load_avp};
use crate::context::{DataContext, DatabaseResolver, TokenContents};
use crate::error::{DataError, Result};
use crate::ident::{AvpId, RecordId, RevisionId};
use crate::store::{
    AllDocsOptions, DESIGN_DOC_PREFIX, DEFAULT_WRITE_ATTEMPTS, DocRow, JsonDoc,
    RECORD_REVISIONS_INDEX, from_typed_doc, safe_write, to_doc,
};
use crate::types::{
    AVP_FORMAT_VERSION, AttributeValuePair, AvpIdMap, FormData, FormRecord, FullRecord,
    HRID_PREFIX, RECORD_FORMAT_VERSION, REVISION_FORMAT_VERSION, Record, RecordMetadata,
    Revision,
};

/// Fetch a document and deserialize it after checking its discriminant.
pub async fn get_typed<T: serde::de::DeserializeOwned>(
    context: &DataContext,
    id: &str,
    discriminant: &'static str,
) -> Result<T> {
    let doc = context.store().get(id).await?;
    from_typed_doc(doc, discriminant)
}

/// Fetch the record document for `record_id`.
pub async fn get_record(context: &DataContext, record_id: &RecordId) -> Result<Record> {
    get_typed(context, record_id.as_str(), "record_format_version").await
}

/// Batch-fetch records; absent ids are simply missing from the map.
pub async fn get_records(
    context: &DataContext,
    record_ids: &[RecordId],
) -> Result<BTreeMap<RecordId, Record>> {
    let rows = fetch_rows(context, record_ids.iter().map(|id| id.to_string())).await?;
    collect_typed(rows, "record_format_version", |record: &Record| {
        record.id.clone()
    })
}

/// Fetch one revision.
pub async fn get_revision(context: &DataContext, revision_id: &RevisionId) -> Result<Revision> {
    get_typed(context, revision_id.as_str(), "revision_format_version").await
}

/// Batch-fetch revisions; absent ids are missing from the map.
pub async fn get_revisions(
    context: &DataContext,
    revision_ids: &[RevisionId],
) -> Result<BTreeMap<RevisionId, Revision>> {
    let rows = fetch_rows(context, revision_ids.iter().map(|id| id.to_string())).await?;
    collect_typed(rows, "revision_format_version", |revision: &Revision| {
        revision.id.clone()
    })
}

/// Fetch one AVP, hydrated through the attachment loader.
pub async fn get_avp(context: &DataContext, avp_id: &AvpId) -> Result<AttributeValuePair> {
    let avp: AttributeValuePair =
        get_typed(context, avp_id.as_str(), "avp_format_version").await?;
    load_avp(context, avp).await
}

/// Batch-fetch AVPs and hydrate their attachments. Attachment loads for
/// independent AVPs are issued concurrently.
pub async fn get_avps(
    context: &DataContext,
    avp_ids: &[AvpId],
) -> Result<BTreeMap<AvpId, AttributeValuePair>> {
    let rows = fetch_rows(context, avp_ids.iter().map(|id| id.to_string())).await?;
    let raw: Vec<AttributeValuePair> = rows
        .into_iter()
        .filter_map(|row| row.doc)
        .map(|doc| from_typed_doc(doc, "avp_format_version"))
        .collect::<Result<_>>()?;

    let loaded = try_join_all(raw.into_iter().map(|avp| load_avp(context, avp))).await?;
    Ok(loaded.into_iter().map(|avp| (avp.id.clone(), avp)).collect())
}

/// Query a named index; omitting `keys` returns everything visible through
/// the index.
pub async fn query_indexed(
    context: &DataContext,
    index: &str,
    keys: Option<Vec<Value>>,
) -> Result<Vec<DocRow>> {
    context.store().query(index, keys).await
}

/// Advance the record's heads: add `new_revision_id`, drop each obsolete
/// id, keep both lists sorted, and register the new revision. The mutation
/// is pure set algebra, so the safe-write retry loop can replay it against
/// whatever record state it finds.
pub async fn update_heads(
    context: &DataContext,
    record_id: &RecordId,
    obsolete: &[RevisionId],
    new_revision_id: &RevisionId,
) -> Result<()> {
    safe_write(
        context.store(),
        record_id.as_str(),
        DEFAULT_WRITE_ATTEMPTS,
        |current| {
            let doc =
                current.ok_or_else(|| DataError::NotFound(record_id.to_string()))?;
            let mut record: Record = from_typed_doc(doc, "record_format_version")?;

            record.heads.push(new_revision_id.clone());
            record.heads.retain(|head| !obsolete.contains(head));
            record.heads.sort();
            record.heads.dedup();

            record.revisions.push(new_revision_id.clone());
            record.revisions.sort();
            record.revisions.dedup();

            to_doc(&record)
        },
    )
    .await?;
    Ok(())
}

/// Create the record document for a brand-new record. A concurrent create
/// of the same id is fine: the conflict means the record already exists.
pub async fn create_record_if_missing(
    context: &DataContext,
    form: &FormRecord,
    revision_id: &RevisionId,
) -> Result<()> {
    let record = Record {
        id: form.record_id.clone(),
        rev: None,
        record_format_version: RECORD_FORMAT_VERSION,
        created: form.updated,
        created_by: form.updated_by.clone(),
        revisions: vec![revision_id.clone()],
        heads: vec![revision_id.clone()],
        record_type: form.record_type.clone(),
    };
    match context.store().put(to_doc(&record)?).await {
        Ok(_) => Ok(()),
        Err(err) if err.is_conflict() => Ok(()),
        Err(err) => Err(err),
    }
}

/// Build the AVP map for a new revision. Fields whose value and annotation
/// are unchanged from the base revision reuse the existing AVP id
/// (structural sharing); changed fields get a fresh AVP, run through the
/// attachment dumper and written in one batch.
async fn new_avps_from_form(
    context: &DataContext,
    form: &FormRecord,
    new_revision_id: &RevisionId,
) -> Result<AvpIdMap> {
    let (base_avps, base_data) = match &form.base_revision_id {
        Some(base_id) => {
            let revision = get_revision(context, base_id).await?;
            let data = form_data_from_revision(context, &revision).await?;
            (revision.avps, data)
        }
        None => (AvpIdMap::new(), FormData::default()),
    };

    let mut avp_map = AvpIdMap::new();
    let mut docs_to_write: Vec<JsonDoc> = Vec::new();

    for (field_name, field_value) in &form.data {
        let field_type = form
            .field_types
            .get(field_name)
            .cloned()
            .unwrap_or_else(|| "??:??".to_string());
        let annotation = form
            .annotations
            .get(field_name)
            .cloned()
            .unwrap_or(Value::Null);

        let handler = context.types().handler_for(&field_type);
        let stored_value = base_data.data.get(field_name);
        let stored_annotation = base_data.annotations.get(field_name);
        let data_changed =
            stored_value.is_none_or(|stored| !handler.equals(stored, field_value));
        let annotation_changed =
            stored_annotation.is_none_or(|stored| !handler.equals(stored, &annotation));

        if data_changed || annotation_changed {
            let avp = AttributeValuePair {
                id: AvpId::generate(),
                rev: None,
                avp_format_version: AVP_FORMAT_VERSION,
                avp_type: field_type,
                data: field_value.clone(),
                revision_id: new_revision_id.clone(),
                record_id: form.record_id.clone(),
                annotations: annotation,
                created: form.updated,
                created_by: form.updated_by.clone(),
                attachment_refs: None,
            };
            avp_map.insert(field_name.clone(), avp.id.clone());
            let (dumped, attachments) = dump_avp(context, avp)?;
            docs_to_write.push(to_doc(&dumped)?);
            for attachment in attachments {
                docs_to_write.push(to_doc(&attachment)?);
            }
        } else {
            let existing = base_avps.get(field_name).ok_or_else(|| {
                DataError::Backend(format!(
                    "unchanged field {field_name} has no AVP in the base revision"
                ))
            })?;
            avp_map.insert(field_name.clone(), existing.clone());
        }
    }

    for result in context.store().bulk_put(docs_to_write).await? {
        result?;
    }
    Ok(avp_map)
}

/// Write the new revision document for a form snapshot.
pub async fn add_revision_from_form(
    context: &DataContext,
    form: &FormRecord,
    new_revision_id: &RevisionId,
) -> Result<()> {
    let avps = new_avps_from_form(context, form, new_revision_id).await?;
    let revision = Revision {
        id: new_revision_id.clone(),
        rev: None,
        revision_format_version: REVISION_FORMAT_VERSION,
        avps,
        record_id: form.record_id.clone(),
        parents: form.base_revision_id.iter().cloned().collect(),
        created: form.updated,
        created_by: form.updated_by.clone(),
        record_type: form.record_type.clone(),
        deleted: None,
        relationship: form.relationship.clone(),
    };
    context.store().put(to_doc(&revision)?).await?;
    Ok(())
}

/// Create or update a record from a form snapshot, returning the id of the
/// freshly created revision.
pub async fn upsert(context: &DataContext, form: &FormRecord) -> Result<RevisionId> {
    let revision_id = RevisionId::generate();
    match &form.base_revision_id {
        None => {
            create_record_if_missing(context, form, &revision_id).await?;
            add_revision_from_form(context, form, &revision_id).await?;
        }
        Some(base) => {
            add_revision_from_form(context, form, &revision_id).await?;
            update_heads(context, &form.record_id, &[base.clone()], &revision_id).await?;
        }
    }
    Ok(revision_id)
}

/// Hydrate the field values of a revision. AVP fetches and their
/// attachment loads run concurrently.
pub async fn form_data_from_revision(
    context: &DataContext,
    revision: &Revision,
) -> Result<FormData> {
    let avp_ids: Vec<AvpId> = revision.avps.values().cloned().collect();
    let avps = get_avps(context, &avp_ids).await?;

    let mut form_data = FormData::default();
    for (field_name, avp_id) in &revision.avps {
        let avp = avps.get(avp_id).ok_or_else(|| {
            DataError::NotFound(avp_id.to_string())
        })?;
        form_data.data.insert(field_name.clone(), avp.data.clone());
        form_data
            .annotations
            .insert(field_name.clone(), avp.annotations.clone());
        form_data
            .types
            .insert(field_name.clone(), avp.avp_type.clone());
    }
    Ok(form_data)
}

/// Full hydrated data for one revision of a record. Returns `None` when
/// the revision is deleted, unless `include_deleted` is set.
pub async fn full_record_data(
    context: &DataContext,
    record_id: &RecordId,
    revision_id: &RevisionId,
    include_deleted: bool,
) -> Result<Option<FullRecord>> {
    let revision = get_revision(context, revision_id).await?;
    if revision.is_deleted() && !include_deleted {
        return Ok(None);
    }
    let record = get_record(context, record_id).await?;
    let form_data = form_data_from_revision(context, &revision).await?;

    Ok(Some(FullRecord {
        record_id: record_id.clone(),
        revision_id: revision_id.clone(),
        record_type: revision.record_type.clone(),
        data: form_data.data,
        annotations: form_data.annotations,
        field_types: form_data.types,
        created: record.created,
        created_by: record.created_by,
        updated: revision.created,
        deleted: revision.is_deleted(),
        updated_by: revision.created_by,
        relationship: revision.relationship,
    }))
}

/// Human-readable identifier for a revision: the value of the first field
/// whose name carries the `hrid` prefix, when it is a string. Lookup
/// failures degrade to `None` rather than failing the listing.
pub async fn hrid_for_revision(context: &DataContext, revision: &Revision) -> Option<String> {
    let (field_name, avp_id) = revision
        .avps
        .iter()
        .find(|(name, _)| name.starts_with(HRID_PREFIX))?;
    match get_avp(context, avp_id).await {
        Ok(avp) => avp.data.as_str().map(str::to_string),
        Err(err) => {
            warn!(revision = %revision.id, field = field_name.as_str(), %err, "failed to load HRID field");
            None
        }
    }
}

/// Metadata for one record at one revision.
pub async fn record_metadata(
    context: &DataContext,
    record_id: &RecordId,
    revision_id: &RevisionId,
) -> Result<RecordMetadata> {
    let record = get_record(context, record_id).await?;
    let revision = get_revision(context, revision_id).await?;
    let hrid = hrid_for_revision(context, &revision)
        .await
        .unwrap_or_else(|| record_id.to_string());
    Ok(metadata_from(&record, &revision, hrid))
}

fn metadata_from(record: &Record, revision: &Revision, hrid: String) -> RecordMetadata {
    RecordMetadata {
        record_id: record.id.clone(),
        revision_id: revision.id.clone(),
        created: record.created,
        created_by: record.created_by.clone(),
        updated: revision.created,
        updated_by: revision.created_by.clone(),
        conflicts: record.heads.len() > 1,
        deleted: revision.is_deleted(),
        hrid,
        record_type: record.record_type.clone(),
        relationship: revision.relationship.clone(),
    }
}

/// Metadata for the first head of each record; all records when
/// `record_ids` is `None`. Records whose head revision cannot be fetched
/// are skipped.
pub async fn list_record_metadata(
    context: &DataContext,
    record_ids: Option<&[RecordId]>,
) -> Result<BTreeMap<RecordId, RecordMetadata>> {
    let records: Vec<Record> = match record_ids {
        Some(ids) => get_records(context, ids).await?.into_values().collect(),
        None => all_records(context).await?,
    };

    let head_ids: Vec<RevisionId> = records
        .iter()
        .filter_map(|record| record.heads.first().cloned())
        .collect();
    if head_ids.is_empty() {
        return Ok(BTreeMap::new());
    }
    let revisions = get_revisions(context, &head_ids).await?;

    let mut out = BTreeMap::new();
    for record in &records {
        let Some(head) = record.heads.first() else {
            continue;
        };
        let Some(revision) = revisions.get(head) else {
            // The head revision has not replicated yet; skip the record.
            continue;
        };
        let hrid = hrid_for_revision(context, revision)
            .await
            .unwrap_or_else(|| record.id.to_string());
        out.insert(record.id.clone(), metadata_from(record, revision, hrid));
    }
    Ok(out)
}

/// Every record document in the database.
pub async fn all_records(context: &DataContext) -> Result<Vec<Record>> {
    let docs = context
        .store()
        .find(
            serde_json::json!({"record_format_version": RECORD_FORMAT_VERSION}),
            None,
        )
        .await?;
    docs.into_iter()
        .map(|doc| from_typed_doc(doc, "record_format_version"))
        .collect()
}

/// All revision ids ever attached to a record.
pub async fn record_revisions(
    context: &DataContext,
    record_id: &RecordId,
) -> Result<Vec<RevisionId>> {
    Ok(get_record(context, record_id).await?.revisions)
}

/// One page of the record → head-revision listing.
#[derive(Debug, Clone)]
pub struct HeadRevisionRow {
    pub record_id: RecordId,
    pub revision: Revision,
}

/// Paginated listing over the record → latest-revision index. Pass the
/// last record id of the previous page as `bookmark` to resume past it.
pub async fn some_records(
    context: &DataContext,
    limit: usize,
    bookmark: Option<&RecordId>,
    filter_deleted: bool,
) -> Result<Vec<HeadRevisionRow>> {
    let rows = context.store().query(RECORD_REVISIONS_INDEX, None).await?;

    let mut out = Vec::new();
    for row in rows {
        if row.id.starts_with(DESIGN_DOC_PREFIX) {
            continue;
        }
        if let Some(mark) = bookmark {
            if row.id.as_str() <= mark.as_str() {
                continue;
            }
        }
        let Some(doc) = row.doc else { continue };
        let revision: Revision = from_typed_doc(doc, "revision_format_version")?;
        if filter_deleted && revision.is_deleted() {
            continue;
        }
        out.push(HeadRevisionRow {
            record_id: RecordId::from_string(row.id),
            revision,
        });
        if out.len() == limit {
            break;
        }
    }
    Ok(out)
}

/// Mark the sole head of a record as deleted by appending a `deleted`
/// revision. Fails with `TooManyHeads` when the record is conflicted.
pub async fn delete_record(
    context: &DataContext,
    record_id: &RecordId,
    user_id: &str,
) -> Result<RevisionId> {
    let base = sole_head(context, record_id).await?;
    set_deleted_flag(context, record_id, &base, user_id, true).await
}

/// Restore a deleted record by appending an undeleting revision.
pub async fn undelete_record(
    context: &DataContext,
    record_id: &RecordId,
    user_id: &str,
) -> Result<RevisionId> {
    let base = sole_head(context, record_id).await?;
    set_deleted_flag(context, record_id, &base, user_id, false).await
}

async fn sole_head(context: &DataContext, record_id: &RecordId) -> Result<RevisionId> {
    let record = get_record(context, record_id).await?;
    match record.heads.as_slice() {
        [head] => Ok(head.clone()),
        _ => Err(DataError::TooManyHeads(record_id.clone())),
    }
}

/// Append a revision that only flips the deleted flag, carrying the base
/// revision's AVP map unchanged.
pub async fn set_deleted_flag(
    context: &DataContext,
    record_id: &RecordId,
    base_revision_id: &RevisionId,
    user_id: &str,
    deleted: bool,
) -> Result<RevisionId> {
    let base = get_revision(context, base_revision_id).await?;
    let new_revision_id = RevisionId::generate();
    let revision = Revision {
        id: new_revision_id.clone(),
        rev: None,
        revision_format_version: REVISION_FORMAT_VERSION,
        avps: base.avps.clone(),
        record_id: record_id.clone(),
        parents: vec![base_revision_id.clone()],
        created: chrono::Utc::now(),
        created_by: user_id.to_string(),
        record_type: base.record_type.clone(),
        deleted: Some(deleted),
        relationship: base.relationship.clone(),
    };
    context.store().put(to_doc(&revision)?).await?;
    update_heads(context, record_id, &[base_revision_id.clone()], &new_revision_id).await?;
    Ok(new_revision_id)
}

/// Apply deletion filtering and the resolver's permission filter to a
/// metadata listing.
pub fn visible_record_metadata(
    resolver: &dyn DatabaseResolver,
    token: &TokenContents,
    project_id: &str,
    records: Vec<RecordMetadata>,
    filter_deleted: bool,
) -> Vec<RecordMetadata> {
    records
        .into_iter()
        .filter(|metadata| {
            !(metadata.deleted && filter_deleted)
                && resolver.should_display_record(token, project_id, metadata)
        })
        .collect()
}

async fn fetch_rows(
    context: &DataContext,
    ids: impl Iterator<Item = String>,
) -> Result<Vec<DocRow>> {
    let keys: Vec<String> = ids.collect();
    if keys.is_empty() {
        return Ok(Vec::new());
    }
    context
        .store()
        .all_docs(AllDocsOptions::docs_for_keys(keys))
        .await
}

fn collect_typed<T, K, F>(
    rows: Vec<DocRow>,
    discriminant: &'static str,
    key: F,
) -> Result<BTreeMap<K, T>>
where
    T: serde::de::DeserializeOwned,
    K: Ord,
    F: Fn(&T) -> K,
{
    rows.into_iter()
        .filter_map(|row| row.doc)
        .map(|doc| {
            let value: T = from_typed_doc(doc, discriminant)?;
            Ok((key(&value), value))
        })
        .collect()
}
