use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::Builder;
use tracing::debug;

use crate::domain::{
    CanonicalRecord, ContentFormat, ContentKey, ContentRecord, IdType, IdentifierSet, NewRecord,
    RecordId, RecordPatch, TextType,
};
use crate::error::ReconcileError;
use crate::index::ReferenceIndex;

/// Persistent collection of canonical text refs.
///
/// Lookups take normalized values. Implementations must return every record
/// carrying one of the values, duplicates included.
pub trait ReferenceStore {
    fn find_by_identifiers(
        &self,
        id_type: IdType,
        values: &BTreeSet<String>,
    ) -> Result<Vec<CanonicalRecord>, ReconcileError>;

    fn find_by_ids(&self, ids: &BTreeSet<RecordId>)
    -> Result<Vec<CanonicalRecord>, ReconcileError>;

    /// Inserts new text refs and returns their IDs in input order.
    fn insert_records(&mut self, records: &[NewRecord]) -> Result<Vec<RecordId>, ReconcileError>;

    fn update_records(&mut self, patches: &[RecordPatch]) -> Result<(), ReconcileError>;

    fn records(&self) -> Result<Vec<CanonicalRecord>, ReconcileError>;
}

/// Content rows keyed by (text ref, source, format, text type).
pub trait ContentStore {
    /// Rows already stored for `record_ids` under one source/format/text type.
    fn find_content(
        &self,
        record_ids: &BTreeSet<RecordId>,
        source: &str,
        format: ContentFormat,
        text_type: TextType,
    ) -> Result<Vec<ContentRecord>, ReconcileError>;

    fn content_for(&self, record_id: RecordId) -> Result<Vec<ContentRecord>, ReconcileError>;

    /// Inserts content rows. A key that already exists is a write error.
    fn insert_content(&mut self, rows: &[ContentRecord]) -> Result<usize, ReconcileError>;

    fn content_count_by_source(&self) -> Result<BTreeMap<String, usize>, ReconcileError>;
}

/// Durable commit of staged writes.
pub trait Persist {
    fn persist(&self) -> Result<(), ReconcileError>;
}

/// Every stored text ref sharing an identifier with any of `sets`.
pub fn fetch_snapshot<'a, S, I>(store: &S, sets: I) -> Result<Vec<CanonicalRecord>, ReconcileError>
where
    S: ReferenceStore + ?Sized,
    I: IntoIterator<Item = &'a IdentifierSet>,
{
    let mut values = BTreeMap::<IdType, BTreeSet<String>>::new();
    for ids in sets {
        for (id_type, value) in ids.iter() {
            values.entry(id_type).or_default().insert(value.to_string());
        }
    }

    let mut found = BTreeMap::<RecordId, CanonicalRecord>::new();
    for (id_type, values) in values {
        for record in store.find_by_identifiers(id_type, &values)? {
            found.entry(record.id).or_insert(record);
        }
    }
    Ok(found.into_values().collect())
}

/// In-memory store. Also the working set behind [`LocalStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    index: ReferenceIndex,
    content: BTreeMap<ContentKey, String>,
    next_id: RecordId,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store as-is, duplicates included.
    pub fn with_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = CanonicalRecord>,
    {
        let index = ReferenceIndex::build(records);
        let next_id = index.records().map(|record| record.id).max().unwrap_or(0);
        Self {
            index,
            content: BTreeMap::new(),
            next_id,
        }
    }

    pub fn with_content<I>(mut self, rows: I) -> Self
    where
        I: IntoIterator<Item = ContentRecord>,
    {
        self.content
            .extend(rows.into_iter().map(|row| (row.key, row.content)));
        self
    }

    pub fn index(&self) -> &ReferenceIndex {
        &self.index
    }

    pub fn content_rows(&self) -> impl Iterator<Item = ContentRecord> + '_ {
        self.content.iter().map(|(key, content)| ContentRecord {
            key: key.clone(),
            content: content.clone(),
        })
    }

    fn next_id(&self) -> RecordId {
        self.next_id
    }
}

impl ReferenceStore for MemoryStore {
    fn find_by_identifiers(
        &self,
        id_type: IdType,
        values: &BTreeSet<String>,
    ) -> Result<Vec<CanonicalRecord>, ReconcileError> {
        let ids = values
            .iter()
            .flat_map(|value| self.index.lookup_ids(id_type, value).iter().copied())
            .collect::<BTreeSet<_>>();
        self.find_by_ids(&ids)
    }

    fn find_by_ids(
        &self,
        ids: &BTreeSet<RecordId>,
    ) -> Result<Vec<CanonicalRecord>, ReconcileError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.index.get(*id))
            .cloned()
            .collect())
    }

    fn insert_records(&mut self, records: &[NewRecord]) -> Result<Vec<RecordId>, ReconcileError> {
        let mut assigned = Vec::with_capacity(records.len());
        for record in records {
            self.next_id += 1;
            self.index
                .insert(CanonicalRecord::from_new(self.next_id, record));
            assigned.push(self.next_id);
        }
        Ok(assigned)
    }

    fn update_records(&mut self, patches: &[RecordPatch]) -> Result<(), ReconcileError> {
        // Validate the whole batch before touching anything.
        if let Some(missing) = patches
            .iter()
            .find(|patch| self.index.get(patch.record_id).is_none())
        {
            return Err(ReconcileError::StoreWrite(format!(
                "text ref {} does not exist",
                missing.record_id
            )));
        }
        for patch in patches {
            if let Some(mut record) = self.index.get(patch.record_id).cloned() {
                record.apply(patch);
                self.index.insert(record);
            }
        }
        Ok(())
    }

    fn records(&self) -> Result<Vec<CanonicalRecord>, ReconcileError> {
        Ok(self.index.records().cloned().collect())
    }
}

impl ContentStore for MemoryStore {
    fn find_content(
        &self,
        record_ids: &BTreeSet<RecordId>,
        source: &str,
        format: ContentFormat,
        text_type: TextType,
    ) -> Result<Vec<ContentRecord>, ReconcileError> {
        Ok(record_ids
            .iter()
            .map(|record_id| ContentKey {
                record_id: *record_id,
                source: source.to_string(),
                format,
                text_type,
            })
            .filter_map(|key| {
                self.content.get(&key).map(|content| ContentRecord {
                    content: content.clone(),
                    key,
                })
            })
            .collect())
    }

    fn content_for(&self, record_id: RecordId) -> Result<Vec<ContentRecord>, ReconcileError> {
        Ok(self
            .content
            .iter()
            .filter(|(key, _)| key.record_id == record_id)
            .map(|(key, content)| ContentRecord {
                key: key.clone(),
                content: content.clone(),
            })
            .collect())
    }

    fn insert_content(&mut self, rows: &[ContentRecord]) -> Result<usize, ReconcileError> {
        let mut seen = BTreeSet::new();
        for row in rows {
            if self.content.contains_key(&row.key) || !seen.insert(&row.key) {
                return Err(ReconcileError::StoreWrite(format!(
                    "content already exists for text ref {} ({}, {}, {})",
                    row.key.record_id, row.key.source, row.key.format, row.key.text_type
                )));
            }
        }
        for row in rows {
            self.content.insert(row.key.clone(), row.content.clone());
        }
        Ok(rows.len())
    }

    fn content_count_by_source(&self) -> Result<BTreeMap<String, usize>, ReconcileError> {
        let mut counts = BTreeMap::new();
        for key in self.content.keys() {
            *counts.entry(key.source.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

impl Persist for MemoryStore {
    fn persist(&self) -> Result<(), ReconcileError> {
        Ok(())
    }
}

/// On-disk layout of a local store.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: Utf8PathBuf,
}

impl StoreLayout {
    /// `explicit`, else `.textref/` in the working directory when present,
    /// else the per-user data directory.
    pub fn resolve(explicit: Option<&Utf8Path>) -> Result<Self, ReconcileError> {
        if let Some(root) = explicit {
            return Ok(Self::new_with_root(root.to_path_buf()));
        }

        let cwd = std::env::current_dir().map_err(|err| ReconcileError::Filesystem(err.to_string()))?;
        let project_root = Utf8PathBuf::from_path_buf(cwd.join(".textref"))
            .map_err(|_| ReconcileError::Filesystem("invalid project path".to_string()))?;
        if project_root.as_std_path().is_dir() {
            return Ok(Self::new_with_root(project_root));
        }

        BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.data_local_dir().join("textref-reconciler")).ok()
            })
            .map(Self::new_with_root)
            .ok_or_else(|| {
                ReconcileError::Filesystem("unable to resolve data directory".to_string())
            })
    }

    pub fn new_with_root(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Text refs and content together, so one rename commits a run.
    pub fn data_path(&self) -> Utf8PathBuf {
        self.root.join("store.json")
    }

    pub fn reviews_dir(&self) -> Utf8PathBuf {
        self.root.join("reviews")
    }

    pub fn review_path(&self, stamp: &str) -> Utf8PathBuf {
        self.reviews_dir().join(format!("review-{stamp}.csv"))
    }

    pub fn ensure_root(&self) -> Result<(), ReconcileError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| ReconcileError::Filesystem(err.to_string()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    schema_version: u32,
    next_id: RecordId,
    records: Vec<CanonicalRecord>,
    #[serde(default)]
    content: Vec<ContentRecord>,
}

/// JSON-file store. Writes are staged in memory until [`Persist::persist`].
#[derive(Debug, Clone)]
pub struct LocalStore {
    layout: StoreLayout,
    inner: MemoryStore,
}

impl LocalStore {
    pub fn open(layout: StoreLayout) -> Result<Self, ReconcileError> {
        let mut inner = MemoryStore::new();
        if let Some(file) = read_json::<StoreFile>(&layout.data_path())? {
            let floor = file.next_id;
            inner = MemoryStore::with_records(file.records).with_content(file.content);
            inner.next_id = inner.next_id().max(floor);
        }
        debug!(
            root = %layout.root(),
            refs = inner.index().len(),
            content = inner.content.len(),
            "opened local store"
        );
        Ok(Self { layout, inner })
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }
}

impl ReferenceStore for LocalStore {
    fn find_by_identifiers(
        &self,
        id_type: IdType,
        values: &BTreeSet<String>,
    ) -> Result<Vec<CanonicalRecord>, ReconcileError> {
        self.inner.find_by_identifiers(id_type, values)
    }

    fn find_by_ids(
        &self,
        ids: &BTreeSet<RecordId>,
    ) -> Result<Vec<CanonicalRecord>, ReconcileError> {
        self.inner.find_by_ids(ids)
    }

    fn insert_records(&mut self, records: &[NewRecord]) -> Result<Vec<RecordId>, ReconcileError> {
        self.inner.insert_records(records)
    }

    fn update_records(&mut self, patches: &[RecordPatch]) -> Result<(), ReconcileError> {
        self.inner.update_records(patches)
    }

    fn records(&self) -> Result<Vec<CanonicalRecord>, ReconcileError> {
        self.inner.records()
    }
}

impl ContentStore for LocalStore {
    fn find_content(
        &self,
        record_ids: &BTreeSet<RecordId>,
        source: &str,
        format: ContentFormat,
        text_type: TextType,
    ) -> Result<Vec<ContentRecord>, ReconcileError> {
        self.inner.find_content(record_ids, source, format, text_type)
    }

    fn content_for(&self, record_id: RecordId) -> Result<Vec<ContentRecord>, ReconcileError> {
        self.inner.content_for(record_id)
    }

    fn insert_content(&mut self, rows: &[ContentRecord]) -> Result<usize, ReconcileError> {
        self.inner.insert_content(rows)
    }

    fn content_count_by_source(&self) -> Result<BTreeMap<String, usize>, ReconcileError> {
        self.inner.content_count_by_source()
    }
}

impl Persist for LocalStore {
    fn persist(&self) -> Result<(), ReconcileError> {
        self.layout.ensure_root()?;
        let file = StoreFile {
            schema_version: 2,
            next_id: self.inner.next_id(),
            records: self.inner.index().records().cloned().collect(),
            content: self.inner.content_rows().collect(),
        };
        write_json_atomic(&self.layout.data_path(), &file)?;
        debug!(root = %self.layout.root(), "persisted local store");
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<Option<T>, ReconcileError> {
    if !path.as_std_path().exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| ReconcileError::StoreQuery(format!("{path}: {err}")))?;
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|err| ReconcileError::StoreQuery(format!("{path}: {err}")))
}

/// Writes through a temp file in the target directory, then renames over `path`.
pub fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Utf8Path,
    value: &T,
) -> Result<(), ReconcileError> {
    let parent = path
        .parent()
        .ok_or_else(|| ReconcileError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| ReconcileError::Filesystem(err.to_string()))?;
    let content = serde_json::to_vec_pretty(value)
        .map_err(|err| ReconcileError::StoreWrite(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix("textref-store")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| ReconcileError::Filesystem(err.to_string()))?;
    temp.write_all(&content)
        .map_err(|err| ReconcileError::StoreWrite(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| ReconcileError::StoreWrite(err.to_string()))?;
    Ok(())
}
