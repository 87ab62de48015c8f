//! Merge engine
//!
//! Reduces a record's heads toward one by pairwise three-way automerge.
//! "Cannot auto-merge" is an expected outcome carried in the returned
//! [`MergeResult`], never an error; errors are reserved for structural
//! problems (missing revisions, no shared ancestor, incompatible types).
//! Conflicts the automerge refuses are handed to an operator through the
//! manual-merge functions at the bottom of this module.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, warn};

use crate::context::DataContext;
use crate::error::{DataError, Result};
use crate::ident::{AvpId, RecordId, RevisionId};
use crate::repository::{get_avps, get_record, get_revision, get_revisions, update_heads};
use crate::store::to_doc;
use crate::types::{
    AVP_FORMAT_VERSION, AttributeValuePair, AvpIdMap, FieldMergeInformation,
    InitialMergeDetails, REVISION_FORMAT_VERSION, RecordMergeInformation, Relationship,
    Revision, RevisionInitialDetails, UserMergeResult,
};

/// Author recorded on automerge-created revisions.
const AUTOMERGE_USER: &str = "automerge";

/// How many of the record's revisions are prefetched into the cache before
/// head reduction starts.
const CACHE_SEED_SIZE: usize = 100;

/// Outcome state of one pairwise merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeState {
    /// No field has been reconciled yet; asking for success is an error.
    Unset,
    /// Every reconciled field was shared by both sides.
    Trivial,
    /// At least one field took our side's change.
    MergedUs,
    /// At least one field took their side's change.
    MergedThem,
    /// Some fields took ours, some theirs. Still a success.
    MergedBoth,
    /// At least one field (or the deleted flag, or a relationship) could
    /// not be reconciled. Terminal failure.
    NoMerge,
    /// One head was an ancestor of the other; no revision was created.
    FastForward,
}

/// Accumulated result of one pairwise merge. Field reconciliations feed the
/// state machine one at a time; `no_merge` is sticky, `fast_forward` is
/// terminal.
#[derive(Debug, Clone)]
pub struct MergeResult {
    state: MergeState,
    new_revision_id: Option<RevisionId>,
}

impl MergeResult {
    pub fn new() -> Self {
        Self {
            state: MergeState::Unset,
            new_revision_id: None,
        }
    }

    pub fn state(&self) -> MergeState {
        self.state
    }

    pub fn set_trivial(&mut self) {
        if self.state == MergeState::Unset {
            self.state = MergeState::Trivial;
        }
    }

    pub fn set_merge_us(&mut self) {
        match self.state {
            MergeState::Unset | MergeState::Trivial => self.state = MergeState::MergedUs,
            MergeState::MergedThem => self.state = MergeState::MergedBoth,
            _ => {}
        }
    }

    pub fn set_merge_them(&mut self) {
        match self.state {
            MergeState::Unset | MergeState::Trivial => self.state = MergeState::MergedThem,
            MergeState::MergedUs => self.state = MergeState::MergedBoth,
            _ => {}
        }
    }

    pub fn set_no_merge(&mut self) {
        self.state = MergeState::NoMerge;
    }

    pub fn set_fast_forward(&mut self, surviving: RevisionId) {
        self.state = MergeState::FastForward;
        self.new_revision_id = Some(surviving);
    }

    pub fn add_new_revision(&mut self, revision_id: RevisionId) {
        self.new_revision_id = Some(revision_id);
    }

    /// Whether the pairwise merge succeeded. Asking before any
    /// reconciliation has run is a programming error.
    pub fn is_successful(&self) -> Result<bool> {
        match self.state {
            MergeState::Unset => Err(DataError::MergeNotAttempted),
            MergeState::NoMerge => Ok(false),
            _ => Ok(true),
        }
    }

    /// The surviving head: the synthesized revision for a three-way merge,
    /// the retained head for a fast-forward.
    pub fn new_revision_id(&self) -> Result<&RevisionId> {
        self.new_revision_id
            .as_ref()
            .ok_or(DataError::MergeNotAttempted)
    }
}

impl Default for MergeResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Memoized revision lookups for one merge invocation. Owned by the caller
/// of the pairwise merge, never shared across records.
pub struct RevisionCache {
    revisions: BTreeMap<RevisionId, Revision>,
}

impl RevisionCache {
    pub fn new() -> Self {
        Self {
            revisions: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, revision: Revision) {
        self.revisions.insert(revision.id.clone(), revision);
    }

    /// Fetch-through lookup.
    pub async fn get(
        &mut self,
        context: &DataContext,
        revision_id: &RevisionId,
    ) -> Result<Revision> {
        if let Some(revision) = self.revisions.get(revision_id) {
            return Ok(revision.clone());
        }
        let revision = get_revision(context, revision_id).await?;
        self.revisions.insert(revision_id.clone(), revision.clone());
        Ok(revision)
    }
}

impl Default for RevisionCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the shared ancestor used as the three-way merge base.
///
/// Walks backwards from `us`, feeding a queue seeded with `them`; the first
/// revision encountered twice is the base. This is a single-pass search,
/// not a canonical lowest-common-ancestor computation, and its answer is
/// part of the on-disk merge semantics, so it stays as is.
async fn base_revision(
    context: &DataContext,
    cache: &mut RevisionCache,
    us: &Revision,
    them: &Revision,
) -> Result<Revision> {
    let mut seen: BTreeSet<RevisionId> = BTreeSet::new();
    let mut to_check: VecDeque<Revision> = VecDeque::new();
    to_check.push_back(them.clone());
    let mut current = Some(us.clone());

    while let Some(revision) = current {
        if seen.contains(&revision.id) {
            return Ok(revision);
        }
        seen.insert(revision.id.clone());
        for parent_id in &revision.parents {
            let parent = cache.get(context, parent_id).await?;
            to_check.push_back(parent);
        }
        current = to_check.pop_front();
    }

    Err(DataError::NoSharedRevision {
        us: us.id.clone(),
        them: them.id.clone(),
    })
}

/// Union of field names across the three revisions.
fn field_union(base: &Revision, them: &Revision, us: &Revision) -> BTreeSet<String> {
    base.avps
        .keys()
        .chain(them.avps.keys())
        .chain(us.avps.keys())
        .cloned()
        .collect()
}

fn avp_for<'a>(revision: &'a Revision, field: &str) -> Result<&'a AvpId> {
    revision.avps.get(field).ok_or_else(|| {
        DataError::Backend(format!(
            "revision {} has no AVP for field {field}",
            revision.id
        ))
    })
}

/// Three-way reconciliation of one relationship slot. `None` result means
/// irreconcilable.
fn merge_relation<T: Clone + PartialEq>(
    base: &Option<T>,
    them: &Option<T>,
    us: &Option<T>,
) -> Option<Option<T>> {
    if them == us {
        Some(us.clone())
    } else if them == base {
        Some(us.clone())
    } else if us == base {
        Some(them.clone())
    } else {
        None
    }
}

/// Pairwise three-way merge of two head revisions.
///
/// On success a new revision with both heads as parents is written and the
/// record's heads are advanced; on fast-forward only the heads move. The
/// `no_merge` outcome leaves the store untouched.
pub async fn merge_revisions(
    context: &DataContext,
    cache: &mut RevisionCache,
    us_id: &RevisionId,
    them_id: &RevisionId,
) -> Result<MergeResult> {
    debug!(us = %us_id, them = %them_id, "starting pairwise merge");
    let mut result = MergeResult::new();
    let them = cache.get(context, them_id).await?;
    let us = cache.get(context, us_id).await?;
    let base = base_revision(context, cache, &us, &them).await?;
    debug!(base = %base.id, "found merge base");

    if base.id == them.id {
        result.set_fast_forward(us.id.clone());
        update_heads(
            context,
            &us.record_id,
            &[them.id.clone(), base.id.clone()],
            &us.id,
        )
        .await?;
        return Ok(result);
    }
    if base.id == us.id {
        result.set_fast_forward(them.id.clone());
        update_heads(
            context,
            &them.record_id,
            &[us.id.clone(), base.id.clone()],
            &them.id,
        )
        .await?;
        return Ok(result);
    }

    if them.record_type != us.record_type {
        return Err(DataError::UnsupportedMerge {
            us: us.record_type.clone(),
            them: them.record_type.clone(),
        });
    }

    if them.is_deleted() != us.is_deleted() {
        result.set_no_merge();
    }

    let base_rel = base.relationship.clone().unwrap_or_default();
    let them_rel = them.relationship.clone().unwrap_or_default();
    let us_rel = us.relationship.clone().unwrap_or_default();

    let parent = match merge_relation(&base_rel.parent, &them_rel.parent, &us_rel.parent) {
        Some(parent) => parent,
        None => {
            result.set_no_merge();
            None
        }
    };
    let linked = match merge_relation(&base_rel.linked, &them_rel.linked, &us_rel.linked) {
        Some(linked) => linked,
        None => {
            result.set_no_merge();
            None
        }
    };

    let mut avp_map = AvpIdMap::new();
    for field in field_union(&base, &them, &us) {
        let base_avp = avp_for(&base, &field)?;
        let their_avp = avp_for(&them, &field)?;
        let our_avp = avp_for(&us, &field)?;

        if their_avp == our_avp {
            avp_map.insert(field, our_avp.clone());
            result.set_trivial();
        } else if their_avp == base_avp {
            avp_map.insert(field, our_avp.clone());
            result.set_merge_us();
        } else if our_avp == base_avp {
            avp_map.insert(field, their_avp.clone());
            result.set_merge_them();
        } else {
            result.set_no_merge();
        }
    }

    if result.is_successful()? {
        let new_revision_id = RevisionId::generate();
        let mut parents = vec![us.id.clone(), them.id.clone()];
        parents.sort();

        let revision = Revision {
            id: new_revision_id.clone(),
            rev: None,
            revision_format_version: REVISION_FORMAT_VERSION,
            avps: avp_map,
            record_id: us.record_id.clone(),
            parents: parents.clone(),
            created: chrono::Utc::now(),
            created_by: AUTOMERGE_USER.to_string(),
            record_type: us.record_type.clone(),
            deleted: Some(them.is_deleted() && us.is_deleted()),
            relationship: Some(Relationship { parent, linked }),
        };
        context.store().put(to_doc(&revision)?).await?;
        cache.insert(revision);
        update_heads(context, &us.record_id, &parents, &new_revision_id).await?;
        result.add_new_revision(new_revision_id);
    }
    Ok(result)
}

/// Reduce a record's heads by repeated pairwise merging.
///
/// Greedy and order dependent: heads are taken in their stored (sorted)
/// order, and each successful merge's output immediately becomes the "us"
/// side for the remaining heads. Returns true only when every attempted
/// pair merged; failed pairs leave both heads standing.
pub async fn merge_heads(context: &DataContext, record_id: &RecordId) -> Result<bool> {
    let record = get_record(context, record_id).await?;
    debug!(record = %record_id, heads = record.heads.len(), "merging heads");

    let mut cache = RevisionCache::new();
    let seed: Vec<RevisionId> = record
        .revisions
        .iter()
        .take(CACHE_SEED_SIZE)
        .cloned()
        .collect();
    for revision in get_revisions(context, &seed).await?.into_values() {
        cache.insert(revision);
    }
    for revision in get_revisions(context, &record.heads).await?.into_values() {
        cache.insert(revision);
    }

    let mut fully_merged = true;
    let mut working_heads = record.heads.clone();
    while working_heads.len() > 1 {
        let mut us_id = working_heads.remove(0);
        for them_id in working_heads.clone() {
            let pairwise = merge_revisions(context, &mut cache, &us_id, &them_id).await?;
            if pairwise.is_successful()? {
                working_heads.retain(|head| *head != them_id);
                us_id = pairwise.new_revision_id()?.clone();
                debug!(merged = %them_id, into = %us_id, "pairwise merge succeeded");
            } else {
                fully_merged = false;
            }
        }
    }
    Ok(fully_merged)
}

/// Field names on which `revision_id` disagrees with any other current
/// head, by AVP id.
pub async fn find_conflicting_fields(
    context: &DataContext,
    record_id: &RecordId,
    revision_id: &RevisionId,
) -> Result<Vec<String>> {
    let record = get_record(context, record_id).await?;

    let mut revs_to_get = record.heads.clone();
    if !record.heads.contains(revision_id) {
        warn!(record = %record_id, revision = %revision_id, "conflict check against a non-head revision");
        revs_to_get.insert(0, revision_id.clone());
    }
    let revisions = get_revisions(context, &revs_to_get).await?;
    let initial = revisions
        .get(revision_id)
        .ok_or_else(|| DataError::NotFound(revision_id.to_string()))?;

    let mut conflicting: BTreeSet<String> = BTreeSet::new();
    for head_id in &record.heads {
        if head_id == revision_id {
            continue;
        }
        let Some(head) = revisions.get(head_id) else {
            continue;
        };
        for (field_name, avp_id) in &initial.avps {
            if head.avps.get(field_name) != Some(avp_id) {
                conflicting.insert(field_name.clone());
            }
        }
    }
    Ok(conflicting.into_iter().collect())
}

/// Starting state for a manual merge: summaries of every head plus the
/// first head that hydrates cleanly. `None` when no head could be
/// hydrated at all (e.g. replication has not delivered their AVPs yet).
pub async fn get_initial_merge_details(
    context: &DataContext,
    record_id: &RecordId,
) -> Result<Option<InitialMergeDetails>> {
    let record = get_record(context, record_id).await?;
    let heads = get_revisions(context, &record.heads).await?;

    let mut available_heads = BTreeMap::new();
    for (revision_id, revision) in &heads {
        available_heads.insert(
            revision_id.clone(),
            RevisionInitialDetails {
                record_type: revision.record_type.clone(),
                created: revision.created,
                created_by: revision.created_by.clone(),
                deleted: revision.is_deleted(),
            },
        );
    }

    for (revision_id, revision) in &heads {
        match merge_information_for_revision(context, revision).await {
            Ok(information) => {
                return Ok(Some(InitialMergeDetails {
                    initial_head: revision_id.clone(),
                    initial_head_data: information,
                    available_heads,
                }));
            }
            Err(err) => {
                warn!(record = %record_id, revision = %revision_id, %err,
                    "skipping unhydratable head for initial merge details");
            }
        }
    }
    Ok(None)
}

/// Hydrated view of one head revision for the manual-merge display.
pub async fn get_merge_information_for_head(
    context: &DataContext,
    record_id: &RecordId,
    revision_id: &RevisionId,
) -> Result<RecordMergeInformation> {
    let record = get_record(context, record_id).await?;
    if !record.heads.contains(revision_id) {
        warn!(record = %record_id, revision = %revision_id, "merge information requested for a non-head revision");
    }
    let revision = get_revision(context, revision_id).await?;
    merge_information_for_revision(context, &revision).await
}

async fn merge_information_for_revision(
    context: &DataContext,
    revision: &Revision,
) -> Result<RecordMergeInformation> {
    let avp_ids: Vec<AvpId> = revision.avps.values().cloned().collect();
    let avps = get_avps(context, &avp_ids).await?;

    let mut fields = BTreeMap::new();
    for (field_name, avp_id) in &revision.avps {
        let avp = avps
            .get(avp_id)
            .ok_or_else(|| DataError::NotFound(avp_id.to_string()))?;
        fields.insert(
            field_name.clone(),
            FieldMergeInformation {
                data: avp.data.clone(),
                field_type: avp.avp_type.clone(),
                annotations: avp.annotations.clone(),
                created: avp.created,
                created_by: avp.created_by.clone(),
                avp_id: avp_id.clone(),
            },
        );
    }

    Ok(RecordMergeInformation {
        record_id: revision.record_id.clone(),
        revision_id: revision.id.clone(),
        record_type: revision.record_type.clone(),
        updated: revision.created,
        updated_by: revision.created_by.clone(),
        fields,
        deleted: revision.is_deleted(),
        relationship: revision.relationship.clone().unwrap_or_default(),
    })
}

/// Materialize the AVP map for an operator's resolution. A `None` choice
/// means "neither side": a fresh AVP with null data is written for it.
async fn avp_map_from_choices(
    context: &DataContext,
    merge_result: &UserMergeResult,
    new_revision_id: &RevisionId,
) -> Result<AvpIdMap> {
    let mut avp_map = AvpIdMap::new();
    for (field_name, choice) in &merge_result.field_choices {
        match choice {
            Some(avp_id) => {
                avp_map.insert(field_name.clone(), avp_id.clone());
            }
            None => {
                let avp = AttributeValuePair {
                    id: AvpId::generate(),
                    rev: None,
                    avp_format_version: AVP_FORMAT_VERSION,
                    avp_type: merge_result
                        .field_types
                        .get(field_name)
                        .cloned()
                        .unwrap_or_else(|| "??:??".to_string()),
                    data: Value::Null,
                    revision_id: new_revision_id.clone(),
                    record_id: merge_result.record_id.clone(),
                    annotations: Value::Null,
                    created: merge_result.updated,
                    created_by: merge_result.updated_by.clone(),
                    attachment_refs: None,
                };
                context.store().put(to_doc(&avp)?).await?;
                avp_map.insert(field_name.clone(), avp.id);
            }
        }
    }
    Ok(avp_map)
}

/// Persist an operator's conflict resolution as a new revision whose
/// parents are the resolved heads, and advance the record's heads past
/// them.
pub async fn save_user_merge_result(
    context: &DataContext,
    merge_result: &UserMergeResult,
) -> Result<RevisionId> {
    let new_revision_id = RevisionId::generate();
    let avps = avp_map_from_choices(context, merge_result, &new_revision_id).await?;

    let revision = Revision {
        id: new_revision_id.clone(),
        rev: None,
        revision_format_version: REVISION_FORMAT_VERSION,
        avps,
        record_id: merge_result.record_id.clone(),
        parents: merge_result.parents.clone(),
        created: merge_result.updated,
        created_by: merge_result.updated_by.clone(),
        record_type: merge_result.record_type.clone(),
        deleted: Some(false),
        relationship: Some(merge_result.relationship.clone()),
    };
    context.store().put(to_doc(&revision)?).await?;
    update_heads(
        context,
        &merge_result.record_id,
        &merge_result.parents,
        &new_revision_id,
    )
    .await?;
    Ok(new_revision_id)
}
