use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::classify::{
    AmbiguityCause, MatchClassifier, MatchOutcome, connected_groups, group_conflict, shared_type,
};
use crate::domain::{
    CanonicalRecord, IdType, IdentifierSet, IncomingRecord, NewRecord, RecordId, RecordPatch,
    SecondaryIds,
};
use crate::error::ReconcileError;
use crate::index::ReferenceIndex;
use crate::normalize::{IdentifierIssue, normalize_record};
use crate::store::{ReferenceStore, fetch_snapshot};

pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

/// What to do when a uniquely matched text ref already holds a different
/// value than the incoming row for the same identifier type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Keep the stored value, log the mismatch, update the other fields.
    #[default]
    Log,
    /// Route the row to the flawed set instead of updating.
    Flag,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOptions {
    pub chunk_size: usize,
    pub merge_compatible_input: bool,
    pub field_conflicts: ConflictPolicy,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            merge_compatible_input: true,
            field_conflicts: ConflictPolicy::Log,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlawedRecord {
    pub ids: IdentifierSet,
    #[serde(flatten)]
    pub secondary: SecondaryIds,
    pub cause: AmbiguityCause,
    pub candidates: Vec<RecordId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRecord {
    pub record: IncomingRecord,
    pub reason: String,
}

/// A stored value and an incoming value that disagree. The stored one wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldConflict {
    pub record_id: RecordId,
    pub field: String,
    pub kept: String,
    pub incoming: String,
}

/// Incoming rows for one identifier tuple that carry different secondary
/// IDs. The first row's value is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputConflict {
    pub ids: IdentifierSet,
    pub field: String,
    pub kept: String,
    pub incoming: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordUpdate {
    pub record_id: RecordId,
    pub matched: Vec<IdentifierSet>,
    pub patch: RecordPatch,
}

/// Outcome of reconciling one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub to_insert: Vec<NewRecord>,
    pub to_update: Vec<RecordUpdate>,
    pub flawed: Vec<FlawedRecord>,
    pub rejected: Vec<RejectedRecord>,
    pub conflicts: Vec<FieldConflict>,
    pub input_conflicts: Vec<InputConflict>,
    pub issues: Vec<IdentifierIssue>,
}

impl Reconciliation {
    /// Identifier tuples of every flawed row; content keyed to them is held back.
    pub fn flawed_ids(&self) -> HashSet<IdentifierSet> {
        self.flawed.iter().map(|flawed| flawed.ids.clone()).collect()
    }

    pub fn patches(&self) -> Vec<RecordPatch> {
        self.to_update
            .iter()
            .filter(|update| !update.patch.is_empty())
            .map(|update| update.patch.clone())
            .collect()
    }

    pub fn updated_count(&self) -> usize {
        self.to_update
            .iter()
            .filter(|update| !update.patch.is_empty())
            .count()
    }

    pub fn unchanged_count(&self) -> usize {
        self.to_update.len() - self.updated_count()
    }
}

/// A normalized work item. `rows` keeps the original identifier tuples
/// when several compatible rows were merged into one.
#[derive(Debug, Clone)]
struct Candidate {
    order: usize,
    ids: IdentifierSet,
    secondary: SecondaryIds,
    rows: Vec<IdentifierSet>,
}

#[derive(Debug, Default)]
struct Prepared {
    candidates: Vec<Candidate>,
    flawed: Vec<(usize, FlawedRecord)>,
    rejected: Vec<RejectedRecord>,
    input_conflicts: Vec<InputConflict>,
    issues: Vec<IdentifierIssue>,
}

#[derive(Debug)]
enum Classified {
    Insert(usize, NewRecord),
    Match(usize, Candidate, CanonicalRecord),
    Flawed(usize, FlawedRecord),
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    options: ReconcileOptions,
}

impl Reconciler {
    pub fn new(options: ReconcileOptions) -> Result<Self, ReconcileError> {
        if options.chunk_size == 0 {
            return Err(ReconcileError::InvalidChunkSize);
        }
        Ok(Self { options })
    }

    pub fn options(&self) -> &ReconcileOptions {
        &self.options
    }

    /// Reconciles `batch` against a fixed index snapshot.
    pub fn plan(&self, batch: &[IncomingRecord], index: &ReferenceIndex) -> Reconciliation {
        let prepared = self.prepare(batch);
        let mut classified = Vec::with_capacity(prepared.candidates.len());
        for chunk in prepared.candidates.chunks(self.options.chunk_size) {
            self.classify_chunk(chunk, index, &mut classified);
        }
        self.finish(prepared, classified)
    }

    /// Reconciles `batch` against the store, fetching one snapshot per chunk.
    ///
    /// Each chunk's snapshot holds every text ref sharing an identifier with
    /// the chunk, so the outcome for a row never depends on the chunk size.
    /// Any query failure aborts the whole batch.
    pub fn reconcile<S>(
        &self,
        store: &S,
        batch: &[IncomingRecord],
    ) -> Result<Reconciliation, ReconcileError>
    where
        S: ReferenceStore + ?Sized,
    {
        let prepared = self.prepare(batch);
        let mut classified = Vec::with_capacity(prepared.candidates.len());
        for (number, chunk) in prepared.candidates.chunks(self.options.chunk_size).enumerate() {
            let snapshot = fetch_snapshot(store, chunk.iter().map(|candidate| &candidate.ids))?;
            debug!(
                chunk = number,
                rows = chunk.len(),
                snapshot = snapshot.len(),
                "classifying chunk"
            );
            let index = ReferenceIndex::build(snapshot);
            self.classify_chunk(chunk, &index, &mut classified);
        }
        let result = self.finish(prepared, classified);
        info!(
            rows = batch.len(),
            insert = result.to_insert.len(),
            update = result.updated_count(),
            unchanged = result.unchanged_count(),
            flawed = result.flawed.len(),
            rejected = result.rejected.len(),
            "reconciled text refs"
        );
        Ok(result)
    }

    /// Writes inserts and non-empty patches. Returns the IDs assigned to
    /// `to_insert`, in order.
    pub fn apply<S>(
        &self,
        store: &mut S,
        reconciliation: &Reconciliation,
    ) -> Result<Vec<RecordId>, ReconcileError>
    where
        S: ReferenceStore + ?Sized,
    {
        let mut assigned = Vec::new();
        if !reconciliation.to_insert.is_empty() {
            assigned = store.insert_records(&reconciliation.to_insert)?;
            if assigned.len() != reconciliation.to_insert.len() {
                return Err(ReconcileError::StoreWrite(format!(
                    "store assigned {} ids for {} new text refs",
                    assigned.len(),
                    reconciliation.to_insert.len()
                )));
            }
        }
        let patches = reconciliation.patches();
        if !patches.is_empty() {
            store.update_records(&patches)?;
        }
        info!(
            inserted = assigned.len(),
            updated = patches.len(),
            "wrote text refs"
        );
        Ok(assigned)
    }

    fn prepare(&self, batch: &[IncomingRecord]) -> Prepared {
        let mut prepared = Prepared::default();

        // Identical tuples collapse onto their first occurrence.
        let mut distinct: Vec<(usize, IdentifierSet, SecondaryIds)> = Vec::new();
        let mut seen = HashMap::<IdentifierSet, usize>::new();
        for (position, record) in batch.iter().enumerate() {
            let normalized = match normalize_record(record) {
                Ok(normalized) => normalized,
                Err(err) => {
                    warn!(record = ?record, error = %err, "rejecting incoming record");
                    prepared.rejected.push(RejectedRecord {
                        record: record.clone(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            prepared.issues.extend(normalized.issues);
            match seen.get(&normalized.ids) {
                Some(slot) => {
                    let (_, ids, secondary) = &mut distinct[*slot];
                    let conflicts = secondary.fill_from(&normalized.secondary);
                    record_input_conflicts(&mut prepared.input_conflicts, ids, conflicts);
                }
                None => {
                    seen.insert(normalized.ids.clone(), distinct.len());
                    distinct.push((position, normalized.ids, normalized.secondary));
                }
            }
        }

        let sets = distinct
            .iter()
            .map(|(_, ids, _)| ids.clone())
            .collect::<Vec<_>>();
        for group in connected_groups(&sets) {
            let (first_position, first_ids, first_secondary) = &distinct[group[0]];
            if group.len() == 1 {
                prepared.candidates.push(Candidate {
                    order: *first_position,
                    ids: first_ids.clone(),
                    secondary: first_secondary.clone(),
                    rows: vec![first_ids.clone()],
                });
                continue;
            }

            let members = group.iter().map(|slot| &sets[*slot]).collect::<Vec<_>>();
            let conflict = group_conflict(&members);
            if conflict.is_none() && self.options.merge_compatible_input {
                let mut ids = first_ids.clone();
                let mut secondary = first_secondary.clone();
                let mut dropped = Vec::new();
                for slot in &group[1..] {
                    ids.fill_from(&distinct[*slot].1);
                    dropped.extend(secondary.fill_from(&distinct[*slot].2));
                }
                record_input_conflicts(&mut prepared.input_conflicts, &ids, dropped);
                debug!(rows = group.len(), ids = %ids, "merged compatible incoming rows");
                prepared.candidates.push(Candidate {
                    order: *first_position,
                    ids,
                    secondary,
                    rows: members.into_iter().cloned().collect(),
                });
                continue;
            }

            let cause = AmbiguityCause::InputCollision(shared_type(&members));
            warn!(
                rows = group.len(),
                %cause,
                conflicting = ?conflict,
                "incoming rows share an identifier"
            );
            for slot in &group {
                let (position, ids, secondary) = &distinct[*slot];
                prepared.flawed.push((
                    *position,
                    FlawedRecord {
                        ids: ids.clone(),
                        secondary: secondary.clone(),
                        cause: cause.clone(),
                        candidates: Vec::new(),
                    },
                ));
            }
        }

        prepared.candidates.sort_by_key(|candidate| candidate.order);
        prepared
    }

    fn classify_chunk(
        &self,
        chunk: &[Candidate],
        index: &ReferenceIndex,
        out: &mut Vec<Classified>,
    ) {
        let classifier = MatchClassifier::new(index);
        for candidate in chunk {
            match classifier.classify(&candidate.ids) {
                MatchOutcome::NoMatch => out.push(Classified::Insert(
                    candidate.order,
                    NewRecord {
                        ids: candidate.ids.clone(),
                        secondary: candidate.secondary.clone(),
                    },
                )),
                MatchOutcome::UniqueMatch(id) => {
                    let Some(record) = index.get(id) else {
                        continue;
                    };
                    if self.options.field_conflicts == ConflictPolicy::Flag {
                        if let Some((id_type, _, _)) =
                            stored_conflicts(record, &candidate.ids).first()
                        {
                            push_flawed(
                                out,
                                candidate,
                                AmbiguityCause::FieldConflict(*id_type),
                                vec![id],
                            );
                            continue;
                        }
                    }
                    out.push(Classified::Match(
                        candidate.order,
                        candidate.clone(),
                        record.clone(),
                    ));
                }
                MatchOutcome::AmbiguousMatch { candidates, cause } => {
                    push_flawed(out, candidate, cause, candidates);
                }
            }
        }
    }

    fn finish(&self, prepared: Prepared, mut classified: Vec<Classified>) -> Reconciliation {
        classified.sort_by_key(|item| match item {
            Classified::Insert(order, _)
            | Classified::Match(order, _, _)
            | Classified::Flawed(order, _) => *order,
        });

        let mut result = Reconciliation {
            rejected: prepared.rejected,
            input_conflicts: prepared.input_conflicts,
            issues: prepared.issues,
            ..Default::default()
        };
        let mut flawed = prepared.flawed;
        let mut matches = BTreeMap::<RecordId, (CanonicalRecord, Vec<Candidate>)>::new();
        for item in classified {
            match item {
                Classified::Insert(_, record) => result.to_insert.push(record),
                Classified::Flawed(order, record) => flawed.push((order, record)),
                Classified::Match(_, candidate, record) => {
                    matches
                        .entry(record.id)
                        .or_insert_with(|| (record, Vec::new()))
                        .1
                        .push(candidate);
                }
            }
        }

        for (record_id, (record, candidates)) in matches {
            let (update, conflicts) = build_update(&record, &candidates);
            for conflict in &conflicts {
                warn!(
                    record_id,
                    field = %conflict.field,
                    kept = %conflict.kept,
                    incoming = %conflict.incoming,
                    "mismatch between reference store and incoming metadata"
                );
            }
            result.conflicts.extend(conflicts);
            result.to_update.push(update);
        }

        flawed.sort_by_key(|(order, _)| *order);
        result.flawed = flawed.into_iter().map(|(_, record)| record).collect();
        result
    }
}

fn record_input_conflicts(
    out: &mut Vec<InputConflict>,
    ids: &IdentifierSet,
    conflicts: Vec<(&'static str, String, String)>,
) {
    for (field, kept, incoming) in conflicts {
        warn!(
            ids = %ids,
            field,
            kept = %kept,
            incoming = %incoming,
            "incoming rows disagree on a secondary identifier"
        );
        out.push(InputConflict {
            ids: ids.clone(),
            field: field.to_string(),
            kept,
            incoming,
        });
    }
}

fn push_flawed(
    out: &mut Vec<Classified>,
    candidate: &Candidate,
    cause: AmbiguityCause,
    candidates: Vec<RecordId>,
) {
    for row in &candidate.rows {
        out.push(Classified::Flawed(
            candidate.order,
            FlawedRecord {
                ids: row.clone(),
                secondary: candidate.secondary.clone(),
                cause: cause.clone(),
                candidates: candidates.clone(),
            },
        ));
    }
}

/// The stored value of `id_type`, normalized when possible. A stored value
/// that no longer normalizes still counts as populated.
fn stored_value(record: &CanonicalRecord, id_type: IdType) -> Option<String> {
    record
        .raw(id_type)
        .filter(|raw| !raw.trim().is_empty())
        .map(|raw| id_type.normalize(raw).unwrap_or_else(|| raw.to_string()))
}

fn stored_conflicts(record: &CanonicalRecord, ids: &IdentifierSet) -> Vec<(IdType, String, String)> {
    ids.iter()
        .filter_map(|(id_type, incoming)| {
            stored_value(record, id_type)
                .filter(|kept| kept != incoming)
                .map(|kept| (id_type, kept, incoming.to_string()))
        })
        .collect()
}

/// Fills fields the record lacks, first incoming row wins, and collects
/// every disagreement with the stored or earlier incoming value.
fn build_update(
    record: &CanonicalRecord,
    candidates: &[Candidate],
) -> (RecordUpdate, Vec<FieldConflict>) {
    let mut patch = RecordPatch::new(record.id);
    let mut conflicts = Vec::new();
    let mut merged_secondary = record.secondary.clone();
    let mut matched = Vec::new();

    for candidate in candidates {
        matched.extend(candidate.rows.iter().cloned());
        for (id_type, kept, incoming) in stored_conflicts(record, &candidate.ids) {
            conflicts.push(FieldConflict {
                record_id: record.id,
                field: id_type.to_string(),
                kept,
                incoming,
            });
        }
        let mut fill = IdentifierSet::default();
        for (id_type, value) in candidate.ids.iter() {
            if stored_value(record, id_type).is_some() {
                continue;
            }
            match patch.ids.get(id_type) {
                Some(kept) if kept != value => conflicts.push(FieldConflict {
                    record_id: record.id,
                    field: id_type.to_string(),
                    kept: kept.to_string(),
                    incoming: value.to_string(),
                }),
                Some(_) => {}
                None => match id_type {
                    IdType::Pmid => fill.pmid = candidate.ids.pmid.clone(),
                    IdType::Pmcid => fill.pmcid = candidate.ids.pmcid.clone(),
                    IdType::Doi => fill.doi = candidate.ids.doi.clone(),
                },
            }
        }
        patch.ids.fill_from(&fill);

        for (field, kept, incoming) in merged_secondary.fill_from(&candidate.secondary) {
            conflicts.push(FieldConflict {
                record_id: record.id,
                field: field.to_string(),
                kept,
                incoming,
            });
        }
    }

    for (name, value) in merged_secondary.fields() {
        let already = record
            .secondary
            .fields()
            .iter()
            .any(|(field, stored)| *field == name && stored.is_some());
        if already {
            continue;
        }
        let value = value.map(str::to_string);
        match name {
            "cord_uid" => patch.secondary.cord_uid = value,
            "who_covidence" => patch.secondary.who_covidence = value,
            _ => patch.secondary.microsoft_id = value,
        }
    }

    (
        RecordUpdate {
            record_id: record.id,
            matched,
            patch,
        },
        conflicts,
    )
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn stored(id: RecordId, pmid: Option<&str>, doi: Option<&str>) -> CanonicalRecord {
        CanonicalRecord {
            id,
            pmid: pmid.map(str::to_string),
            pmcid: None,
            doi: doi.map(str::to_string),
            secondary: SecondaryIds::default(),
        }
    }

    fn incoming(pmid: Option<&str>, pmcid: Option<&str>, doi: Option<&str>) -> IncomingRecord {
        IncomingRecord {
            pmid: pmid.map(str::to_string),
            pmcid: pmcid.map(str::to_string),
            doi: doi.map(str::to_string),
            secondary: SecondaryIds::default(),
        }
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(ReconcileOptions::default()).unwrap()
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let options = ReconcileOptions {
            chunk_size: 0,
            ..Default::default()
        };
        assert_matches!(
            Reconciler::new(options),
            Err(ReconcileError::InvalidChunkSize)
        );
    }

    #[test]
    fn unique_match_fills_missing_fields_only() {
        let index = ReferenceIndex::build([stored(7, Some("12345"), Some("10.1/A"))]);
        let result = reconciler().plan(&[incoming(Some("12345"), Some("PMC9"), None)], &index);
        assert!(result.to_insert.is_empty());
        assert_eq!(result.to_update.len(), 1);
        let patch = &result.to_update[0].patch;
        assert_eq!(patch.record_id, 7);
        assert_eq!(patch.ids.get(IdType::Pmcid), Some("PMC9"));
        assert_eq!(patch.ids.doi, None);
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn stored_value_wins_and_conflict_is_recorded() {
        let index = ReferenceIndex::build([stored(7, Some("12345"), Some("10.1/A"))]);
        let result = reconciler().plan(&[incoming(Some("12345"), None, Some("10.1/Z"))], &index);
        assert_eq!(result.to_update.len(), 1);
        assert!(result.to_update[0].patch.is_empty());
        assert_eq!(
            result.conflicts,
            vec![FieldConflict {
                record_id: 7,
                field: "doi".to_string(),
                kept: "10.1/A".to_string(),
                incoming: "10.1/Z".to_string(),
            }]
        );
    }

    #[test]
    fn flag_policy_routes_conflicts_to_flawed() {
        let options = ReconcileOptions {
            field_conflicts: ConflictPolicy::Flag,
            ..Default::default()
        };
        let index = ReferenceIndex::build([stored(7, Some("12345"), Some("10.1/A"))]);
        let result = Reconciler::new(options)
            .unwrap()
            .plan(&[incoming(Some("12345"), None, Some("10.1/Z"))], &index);
        assert!(result.to_update.is_empty());
        assert_eq!(result.flawed.len(), 1);
        assert_eq!(result.flawed[0].cause, AmbiguityCause::FieldConflict(IdType::Doi));
    }

    #[test]
    fn compatible_rows_merge_into_one_insert() {
        let result = reconciler().plan(
            &[
                incoming(Some("1"), None, None),
                incoming(Some("1"), None, Some("10.1/x")),
                incoming(None, Some("PMC2"), Some("10.1/X")),
            ],
            &ReferenceIndex::new(),
        );
        assert_eq!(result.to_insert.len(), 1);
        let ids = &result.to_insert[0].ids;
        assert_eq!(ids.get(IdType::Pmid), Some("1"));
        assert_eq!(ids.get(IdType::Pmcid), Some("PMC2"));
        assert_eq!(ids.get(IdType::Doi), Some("10.1/X"));
    }

    #[test]
    fn conflicting_rows_are_flawed() {
        let result = reconciler().plan(
            &[
                incoming(Some("1"), None, Some("10.1/x")),
                incoming(Some("2"), None, Some("10.1/x")),
                incoming(Some("3"), None, None),
            ],
            &ReferenceIndex::new(),
        );
        assert_eq!(result.to_insert.len(), 1);
        assert_eq!(result.flawed.len(), 2);
        assert!(
            result
                .flawed
                .iter()
                .all(|flawed| flawed.cause == AmbiguityCause::InputCollision(IdType::Doi))
        );
    }

    #[test]
    fn merge_disabled_flags_every_shared_row() {
        let options = ReconcileOptions {
            merge_compatible_input: false,
            ..Default::default()
        };
        let result = Reconciler::new(options).unwrap().plan(
            &[
                incoming(Some("1"), None, None),
                incoming(Some("1"), None, Some("10.1/x")),
            ],
            &ReferenceIndex::new(),
        );
        assert!(result.to_insert.is_empty());
        assert_eq!(result.flawed.len(), 2);
    }

    #[test]
    fn identical_rows_collapse() {
        let result = reconciler().plan(
            &[
                incoming(Some("1"), None, None),
                incoming(Some("1.0"), None, None),
            ],
            &ReferenceIndex::new(),
        );
        assert_eq!(result.to_insert.len(), 1);
        assert!(result.flawed.is_empty());
    }

    #[test]
    fn rows_without_ids_are_rejected() {
        let result = reconciler().plan(
            &[incoming(Some("Other"), Some(""), None)],
            &ReferenceIndex::new(),
        );
        assert!(result.to_insert.is_empty());
        assert_eq!(result.rejected.len(), 1);
        assert_eq!(
            result.rejected[0].reason,
            ReconcileError::NoIdentifiers.to_string()
        );
    }

    #[test]
    fn two_rows_updating_one_record_keep_first_value() {
        let index = ReferenceIndex::build([stored(7, Some("12345"), Some("10.1/A"))]);
        let result = reconciler().plan(
            &[
                incoming(Some("12345"), Some("PMC1"), None),
                incoming(None, Some("PMC2"), Some("10.1/a")),
            ],
            &index,
        );
        assert_eq!(result.to_update.len(), 1);
        assert_eq!(result.to_update[0].patch.ids.get(IdType::Pmcid), Some("PMC1"));
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].incoming, "PMC2");
    }
}
