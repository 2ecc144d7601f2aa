use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::domain::{CanonicalRecord, IdType, IdentifierSet, RecordId};
use crate::error::ReconcileError;

static EMPTY: BTreeSet<RecordId> = BTreeSet::new();

/// Multi-key index over a snapshot of text refs.
///
/// Each identifier type maps normalized values to every record carrying
/// them. Records that share a value are never merged here; deciding what a
/// shared value means is left to the classifier.
#[derive(Debug, Clone, Default)]
pub struct ReferenceIndex {
    records: BTreeMap<RecordId, CanonicalRecord>,
    by_pmid: HashMap<String, BTreeSet<RecordId>>,
    by_pmcid: HashMap<String, BTreeSet<RecordId>>,
    by_doi: HashMap<String, BTreeSet<RecordId>>,
}

impl ReferenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build<I>(records: I) -> Self
    where
        I: IntoIterator<Item = CanonicalRecord>,
    {
        let mut index = Self::new();
        for record in records {
            index.insert(record);
        }
        index
    }

    /// Adds or replaces a record, keeping the per-type maps in sync.
    pub fn insert(&mut self, record: CanonicalRecord) {
        if let Some(previous) = self.records.remove(&record.id) {
            self.unlink(&previous);
        }
        let ids = record.identifiers();
        for (id_type, value) in ids.iter() {
            self.map_mut(id_type)
                .entry(value.to_string())
                .or_default()
                .insert(record.id);
        }
        self.records.insert(record.id, record);
    }

    fn unlink(&mut self, record: &CanonicalRecord) {
        let ids = record.identifiers();
        for (id_type, value) in ids.iter() {
            let map = self.map_mut(id_type);
            if let Some(set) = map.get_mut(value) {
                set.remove(&record.id);
                if set.is_empty() {
                    map.remove(value);
                }
            }
        }
    }

    fn map(&self, id_type: IdType) -> &HashMap<String, BTreeSet<RecordId>> {
        match id_type {
            IdType::Pmid => &self.by_pmid,
            IdType::Pmcid => &self.by_pmcid,
            IdType::Doi => &self.by_doi,
        }
    }

    fn map_mut(&mut self, id_type: IdType) -> &mut HashMap<String, BTreeSet<RecordId>> {
        match id_type {
            IdType::Pmid => &mut self.by_pmid,
            IdType::Pmcid => &mut self.by_pmcid,
            IdType::Doi => &mut self.by_doi,
        }
    }

    /// IDs of the records carrying `value`. The value is normalized first,
    /// so raw and canonical forms find the same records.
    pub fn lookup_ids(&self, id_type: IdType, value: &str) -> &BTreeSet<RecordId> {
        id_type
            .normalize(value)
            .and_then(|key| self.map(id_type).get(&key))
            .unwrap_or(&EMPTY)
    }

    pub fn lookup(&self, id_type: IdType, value: &str) -> Vec<&CanonicalRecord> {
        self.lookup_ids(id_type, value)
            .iter()
            .filter_map(|id| self.records.get(id))
            .collect()
    }

    pub fn get(&self, id: RecordId) -> Option<&CanonicalRecord> {
        self.records.get(&id)
    }

    pub fn records(&self) -> impl Iterator<Item = &CanonicalRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Per-type hits for every identifier in `ids`, in priority order.
    /// Types without a hit are left out.
    pub fn hits(&self, ids: &IdentifierSet) -> Vec<(IdType, &BTreeSet<RecordId>)> {
        ids.iter()
            .map(|(id_type, value)| (id_type, self.lookup_ids(id_type, value)))
            .filter(|(_, found)| !found.is_empty())
            .collect()
    }

    /// Resolves `ids` to a single record.
    ///
    /// `Ok(None)` when nothing matches; `AmbiguousReference` when the union
    /// of all per-type hits holds more than one record.
    pub fn resolve(&self, ids: &IdentifierSet) -> Result<Option<RecordId>, ReconcileError> {
        let hits = self.hits(ids);
        let union = hits
            .iter()
            .flat_map(|(_, found)| found.iter().copied())
            .collect::<BTreeSet<_>>();
        match union.len() {
            0 => Ok(None),
            1 => Ok(union.into_iter().next()),
            _ => {
                let (id_type, value) = hits
                    .iter()
                    .find(|(_, found)| found.len() > 1)
                    .or_else(|| hits.last())
                    .and_then(|(id_type, _)| ids.get(*id_type).map(|value| (*id_type, value)))
                    .unwrap_or((IdType::Pmid, ""));
                Err(ReconcileError::AmbiguousReference {
                    id_type,
                    value: value.to_string(),
                    candidates: union.into_iter().collect(),
                })
            }
        }
    }
}
