use std::collections::{BTreeMap, BTreeSet};

use assert_matches::assert_matches;

use textref_reconciler::classify::{AmbiguityCause, MatchClassifier, MatchOutcome};
use textref_reconciler::domain::{
    CanonicalRecord, IdType, IdentifierSet, IncomingRecord, NewRecord, RecordId, RecordPatch,
    SecondaryIds,
};
use textref_reconciler::error::ReconcileError;
use textref_reconciler::index::ReferenceIndex;
use textref_reconciler::reconcile::{ReconcileOptions, Reconciler};
use textref_reconciler::store::{MemoryStore, ReferenceStore};

fn canonical(
    id: RecordId,
    pmid: Option<&str>,
    pmcid: Option<&str>,
    doi: Option<&str>,
) -> CanonicalRecord {
    CanonicalRecord {
        id,
        pmid: pmid.map(str::to_string),
        pmcid: pmcid.map(str::to_string),
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

fn reconciler(chunk_size: usize) -> Reconciler {
    Reconciler::new(ReconcileOptions {
        chunk_size,
        ..Default::default()
    })
    .unwrap()
}

/// 4000 stored text refs; every 500th shares its DOI with its predecessor.
fn stored_records() -> Vec<CanonicalRecord> {
    (1..=4000u64)
        .map(|id| {
            let doi_id = if id % 500 == 0 { id - 1 } else { id };
            CanonicalRecord {
                id,
                pmid: Some((100_000 + id).to_string()),
                pmcid: (id % 3 == 0).then(|| format!("PMC{id}")),
                doi: Some(format!("10.1000/{doi_id}")),
                secondary: SecondaryIds::default(),
            }
        })
        .collect()
}

/// A mix of matches, new records, cross-identifier conflicts and in-batch
/// collisions whose partners sit 5000 rows apart.
fn incoming_batch(size: usize) -> Vec<IncomingRecord> {
    (0..size)
        .map(|i| {
            let existing = (i % 4000) as u64 + 1;
            match i % 4 {
                0 => IncomingRecord {
                    pmid: Some(format!("{}.0", 100_000 + existing)),
                    ..Default::default()
                },
                1 => IncomingRecord {
                    pmid: Some((900_000 + i).to_string()),
                    doi: Some(format!("10.2000/{i}")),
                    ..Default::default()
                },
                2 if i % 40 == 2 => IncomingRecord {
                    pmid: Some((100_000 + existing).to_string()),
                    doi: Some(format!("10.1000/{}", existing % 4000 + 7)),
                    ..Default::default()
                },
                2 => IncomingRecord {
                    pmcid: (i % 3 == 0).then(|| format!("pmc{}", 700_000 + i)),
                    doi: Some(format!("http://dx.doi.org/10.1000/{existing}")),
                    ..Default::default()
                },
                _ => IncomingRecord {
                    pmid: (i % 8 != 3).then(|| (800_000 + i).to_string()),
                    doi: Some(format!("10.4000/{}", i % 5000)),
                    ..Default::default()
                },
            }
        })
        .collect()
}

#[test]
fn classification_is_chunk_size_invariant() {
    let index = ReferenceIndex::build(stored_records());
    let batch = incoming_batch(10_000);

    let single = reconciler(1).plan(&batch, &index);
    let large = reconciler(5_000).plan(&batch, &index);
    let whole = reconciler(10_000).plan(&batch, &index);

    assert_eq!(single, large);
    assert_eq!(large, whole);
    assert!(!single.to_insert.is_empty());
    assert!(!single.to_update.is_empty());
    assert!(
        single
            .flawed
            .iter()
            .any(|flawed| matches!(flawed.cause, AmbiguityCause::CrossIdentifier(_)))
    );
    assert!(
        single
            .flawed
            .iter()
            .any(|flawed| flawed.cause == AmbiguityCause::InputCollision(IdType::Doi))
    );
}

#[test]
fn store_driven_reconcile_matches_snapshot_plan() {
    let records = stored_records();
    let store = MemoryStore::with_records(records.clone());
    let batch = incoming_batch(2_000);

    let planned = reconciler(10_000).plan(&batch, &ReferenceIndex::build(records));
    let tiny_chunks = reconciler(1).reconcile(&store, &batch).unwrap();
    let odd_chunks = reconciler(333).reconcile(&store, &batch).unwrap();

    assert_eq!(tiny_chunks, planned);
    assert_eq!(odd_chunks, planned);
}

#[test]
fn pmid_and_doi_pointing_at_different_records_are_never_merged() {
    let index = ReferenceIndex::build([
        canonical(1, Some("100"), None, Some("10.1/one")),
        canonical(2, Some("200"), None, Some("10.1/two")),
    ]);
    let batch = [
        incoming(Some("100"), None, Some("10.1/two")),
        incoming(Some("200"), None, Some("10.1/one")),
    ];
    let result = reconciler(10).plan(&batch, &index);

    assert!(result.to_insert.is_empty());
    assert!(result.to_update.is_empty());
    assert_eq!(result.flawed.len(), 2);
    for flawed in &result.flawed {
        assert_eq!(flawed.candidates, vec![1, 2]);
        assert_eq!(
            flawed.cause,
            AmbiguityCause::CrossIdentifier(vec![IdType::Pmid, IdType::Doi])
        );
    }
}

#[test]
fn resolver_prefixed_doi_matches_lowercase_stored_doi() {
    let index = ReferenceIndex::build([canonical(3, None, None, Some("10.1000/xyz"))]);
    let ids = IdentifierSet {
        doi: Some("http://dx.doi.org/10.1000/XYZ".parse().unwrap()),
        ..Default::default()
    };
    assert_eq!(ids.get(IdType::Doi), Some("10.1000/XYZ"));
    assert_eq!(
        MatchClassifier::new(&index).classify(&ids),
        MatchOutcome::UniqueMatch(3)
    );
}

#[test]
fn pmid_only_row_confirms_existing_record_without_overwriting() {
    let index = ReferenceIndex::build([canonical(7, Some("12345"), None, Some("10.1/A"))]);
    let result = reconciler(10).plan(&[incoming(Some("12345"), None, None)], &index);

    assert!(result.to_insert.is_empty());
    assert!(result.flawed.is_empty());
    assert_eq!(result.to_update.len(), 1);
    assert_eq!(result.to_update[0].record_id, 7);
    assert_eq!(result.to_update[0].patch, RecordPatch::new(7));
    assert_eq!(result.unchanged_count(), 1);
}

#[test]
fn unknown_identifiers_become_an_insert() {
    let index = ReferenceIndex::build([canonical(7, Some("12345"), None, Some("10.1/A"))]);
    let result = reconciler(10).plan(&[incoming(None, Some("PMC999"), Some("10.1/B"))], &index);

    assert_eq!(
        result.to_insert,
        vec![NewRecord {
            ids: IdentifierSet {
                pmcid: Some("PMC999".parse().unwrap()),
                doi: Some("10.1/B".parse().unwrap()),
                ..Default::default()
            },
            secondary: SecondaryIds::default(),
        }]
    );
}

#[test]
fn apply_writes_inserts_and_patches() {
    let mut store = MemoryStore::with_records([canonical(7, Some("12345"), None, None)]);
    let engine = reconciler(10);
    let batch = [
        IncomingRecord {
            pmid: Some("12345".to_string()),
            doi: Some("doi:10.1/a".to_string()),
            secondary: SecondaryIds {
                cord_uid: Some("ug7v899j".to_string()),
                ..Default::default()
            },
            ..Default::default()
        },
        incoming(Some("555"), None, None),
    ];
    let result = engine.reconcile(&store, &batch).unwrap();
    let assigned = engine.apply(&mut store, &result).unwrap();

    assert_eq!(assigned, vec![8]);
    let updated = store.find_by_ids(&BTreeSet::from([7])).unwrap();
    assert_eq!(updated[0].doi.as_deref(), Some("10.1/A"));
    assert_eq!(updated[0].secondary.cord_uid.as_deref(), Some("ug7v899j"));

    // Second pass finds everything in place.
    let again = engine.reconcile(&store, &batch).unwrap();
    assert!(again.to_insert.is_empty());
    assert_eq!(again.unchanged_count(), 2);
}

struct UnreachableStore;

impl ReferenceStore for UnreachableStore {
    fn find_by_identifiers(
        &self,
        _id_type: IdType,
        _values: &BTreeSet<String>,
    ) -> Result<Vec<CanonicalRecord>, ReconcileError> {
        Err(ReconcileError::StoreQuery("connection refused".to_string()))
    }

    fn find_by_ids(
        &self,
        _ids: &BTreeSet<RecordId>,
    ) -> Result<Vec<CanonicalRecord>, ReconcileError> {
        Err(ReconcileError::StoreQuery("connection refused".to_string()))
    }

    fn insert_records(&mut self, _records: &[NewRecord]) -> Result<Vec<RecordId>, ReconcileError> {
        Err(ReconcileError::StoreWrite("read-only".to_string()))
    }

    fn update_records(&mut self, _patches: &[RecordPatch]) -> Result<(), ReconcileError> {
        Err(ReconcileError::StoreWrite("read-only".to_string()))
    }

    fn records(&self) -> Result<Vec<CanonicalRecord>, ReconcileError> {
        Ok(Vec::new())
    }
}

#[test]
fn store_query_failure_aborts_the_batch() {
    let result = reconciler(10).reconcile(&UnreachableStore, &[incoming(Some("1"), None, None)]);
    assert_matches!(result, Err(ReconcileError::StoreQuery(_)));
}

#[test]
fn rejected_rows_do_not_reach_the_store() {
    // Only rejected rows: nothing to fetch, so the unreachable store is never queried.
    let result = reconciler(10)
        .reconcile(&UnreachableStore, &[incoming(Some("Other"), None, Some(" "))])
        .unwrap();
    assert_eq!(result.rejected.len(), 1);
    assert!(result.to_insert.is_empty());
}

#[test]
fn duplicate_store_doi_reports_candidates() {
    let index = ReferenceIndex::build([
        canonical(1, Some("100"), None, Some("10.1/dup")),
        canonical(2, Some("200"), None, Some("10.1/DUP")),
    ]);
    let result = reconciler(10).plan(&[incoming(None, None, Some("10.1/dup"))], &index);
    let causes = result
        .flawed
        .iter()
        .map(|flawed| (flawed.cause.to_string(), flawed.candidates.clone()))
        .collect::<BTreeMap<_, _>>();
    assert_eq!(
        causes,
        BTreeMap::from([("duplicate_in_store:doi".to_string(), vec![1, 2])])
    );
}

fn with_cord_uid(mut record: IncomingRecord, cord_uid: &str) -> IncomingRecord {
    record.secondary.cord_uid = Some(cord_uid.to_string());
    record
}

#[test]
fn disagreeing_secondary_ids_in_the_batch_are_reported() {
    let batch = vec![
        with_cord_uid(incoming(Some("1"), None, None), "uidA"),
        with_cord_uid(incoming(Some("1"), None, None), "uidB"),
        with_cord_uid(incoming(Some("2"), None, None), "uidC"),
        with_cord_uid(incoming(Some("2"), None, Some("10.7/z")), "uidD"),
    ];
    let result = reconciler(1).plan(&batch, &ReferenceIndex::default());

    assert!(result.flawed.is_empty());
    assert_eq!(result.to_insert.len(), 2);
    assert_eq!(
        result.to_insert[0].secondary.cord_uid.as_deref(),
        Some("uidA")
    );
    assert_eq!(
        result.to_insert[1].secondary.cord_uid.as_deref(),
        Some("uidC")
    );

    let dropped = result
        .input_conflicts
        .iter()
        .map(|conflict| {
            (
                conflict.ids.to_string(),
                conflict.field.as_str(),
                conflict.kept.as_str(),
                conflict.incoming.as_str(),
            )
        })
        .collect::<Vec<_>>();
    assert_eq!(
        dropped,
        vec![
            ("pmid:1".to_string(), "cord_uid", "uidA", "uidB"),
            ("pmid:2 doi:10.7/Z".to_string(), "cord_uid", "uidC", "uidD"),
        ]
    );
    assert!(result.conflicts.is_empty());
}
