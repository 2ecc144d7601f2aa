use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

use crate::config::ResolvedConfig;
use crate::content::{ContentFlaw, ContentLinker, FlawedContent};
use crate::documents::DocumentSource;
use crate::domain::{
    CanonicalRecord, ContentFormat, ContentKey, IdType, IdentifierSet, IdentifierSpecifier,
    RecordId, TextType,
};
use crate::error::ReconcileError;
use crate::metadata::{MetadataEntry, MetadataFilter};
use crate::reconcile::{FieldConflict, FlawedRecord, InputConflict, Reconciler, RejectedRecord};
use crate::store::{ContentStore, Persist, ReferenceStore};

#[derive(Debug, Clone)]
pub struct PopulateOptions {
    pub dry_run: bool,
    pub with_content: bool,
}

impl Default for PopulateOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            with_content: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PopulateSummary {
    pub rows: usize,
    pub skipped: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub flawed: usize,
    pub rejected: usize,
    pub conflicts: usize,
    pub input_conflicts: usize,
    pub content_candidates: usize,
    pub content_inserted: usize,
    pub content_duplicates: usize,
    pub content_flawed: usize,
}

/// One line of the manual review file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewEntry {
    pub kind: String,
    pub cause: String,
    pub pmid: Option<String>,
    pub pmcid: Option<String>,
    pub doi: Option<String>,
    pub cord_uid: Option<String>,
    pub candidates: String,
}

impl ReviewEntry {
    fn with_ids(kind: &str, cause: String, ids: &IdentifierSet) -> Self {
        Self {
            kind: kind.to_string(),
            cause,
            pmid: ids.get(IdType::Pmid).map(str::to_string),
            pmcid: ids.get(IdType::Pmcid).map(str::to_string),
            doi: ids.get(IdType::Doi).map(str::to_string),
            cord_uid: None,
            candidates: String::new(),
        }
    }
}

impl From<&FlawedRecord> for ReviewEntry {
    fn from(flawed: &FlawedRecord) -> Self {
        let mut entry = ReviewEntry::with_ids("text_ref", flawed.cause.to_string(), &flawed.ids);
        entry.cord_uid = flawed.secondary.cord_uid.clone();
        entry.candidates = join_ids(&flawed.candidates);
        entry
    }
}

impl From<&FlawedContent> for ReviewEntry {
    fn from(flawed: &FlawedContent) -> Self {
        let cause = format!("{}:{}", flawed.flaw.as_str(), flawed.source);
        let mut entry = ReviewEntry::with_ids("content", cause, &flawed.ids);
        entry.cord_uid = flawed.cord_uid.clone();
        if let ContentFlaw::Ambiguous { candidates } = &flawed.flaw {
            entry.candidates = join_ids(candidates);
        }
        entry
    }
}

impl From<&RejectedRecord> for ReviewEntry {
    fn from(rejected: &RejectedRecord) -> Self {
        Self {
            kind: "rejected".to_string(),
            cause: rejected.reason.clone(),
            pmid: rejected.record.pmid.clone(),
            pmcid: rejected.record.pmcid.clone(),
            doi: rejected.record.doi.clone(),
            cord_uid: rejected.record.secondary.cord_uid.clone(),
            candidates: String::new(),
        }
    }
}

impl From<&InputConflict> for ReviewEntry {
    fn from(conflict: &InputConflict) -> Self {
        let cause = format!("field_conflict:{}={}", conflict.field, conflict.incoming);
        let mut entry = ReviewEntry::with_ids("input_conflict", cause, &conflict.ids);
        if conflict.field == "cord_uid" {
            entry.cord_uid = Some(conflict.kept.clone());
        }
        entry
    }
}

fn join_ids(ids: &[RecordId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(";")
}

#[derive(Debug, Clone, Serialize)]
pub struct PopulateResult {
    pub generated_at: String,
    pub dry_run: bool,
    pub summary: PopulateSummary,
    pub inserted_ids: Vec<RecordId>,
    pub conflicts: Vec<FieldConflict>,
    pub input_conflicts: Vec<InputConflict>,
    pub review: Vec<ReviewEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LookupEntry {
    pub record: CanonicalRecord,
    pub content: Vec<ContentKey>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LookupResult {
    pub specifier: String,
    pub records: Vec<LookupEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsResult {
    pub text_refs: usize,
    pub with_pmid: usize,
    pub with_pmcid: usize,
    pub with_doi: usize,
    pub content_total: usize,
    pub content_by_source: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreferredEntry {
    pub record_id: RecordId,
    pub source: String,
    pub format: ContentFormat,
    pub text_type: TextType,
    pub length: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PreferredResult {
    pub entries: Vec<PreferredEntry>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

fn emit(sink: &dyn ProgressSink, message: String, elapsed: Option<Duration>) {
    sink.event(ProgressEvent { message, elapsed });
}

/// Pipeline entry points over one store.
#[derive(Debug, Clone)]
pub struct App<S> {
    store: S,
    config: ResolvedConfig,
}

impl<S> App<S>
where
    S: ReferenceStore + ContentStore + Persist + Clone,
{
    pub fn new(store: S, config: ResolvedConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Reconciles a metadata feed into the store and links its content.
    ///
    /// All writes go to a working copy that replaces the store only after
    /// it has been persisted, so any failure leaves the store untouched.
    /// A dry run stops before persisting.
    pub fn populate(
        &mut self,
        entries: Vec<MetadataEntry>,
        mut documents: Option<&mut DocumentSource>,
        options: PopulateOptions,
        sink: &dyn ProgressSink,
    ) -> Result<PopulateResult, ReconcileError> {
        let started = Instant::now();
        let reconciler = Reconciler::new(self.config.reconcile.clone())?;
        let linker = ContentLinker::new(self.config.content_chunk_size)?;
        let mut summary = PopulateSummary {
            rows: entries.len(),
            ..Default::default()
        };

        emit(sink, format!("phase=Filter; {} metadata rows", entries.len()), None);
        let filter = MetadataFilter::new(&self.config.exclude_dois, self.config.require_doi);
        let accepted = entries
            .into_iter()
            .filter(|entry| filter.accepts(entry))
            .collect::<Vec<_>>();
        summary.skipped = summary.rows - accepted.len();

        let incoming = accepted
            .iter()
            .map(MetadataEntry::incoming)
            .collect::<Vec<_>>();
        let mut candidates = Vec::new();
        if options.with_content {
            emit(sink, "phase=Content; collecting content".to_string(), None);
            for entry in &accepted {
                candidates.extend(
                    entry.content_candidates(&self.config.source_tag, documents.as_deref_mut()),
                );
            }
        }
        summary.content_candidates = candidates.len();

        emit(
            sink,
            format!("phase=Reconcile; {} incoming records", incoming.len()),
            Some(started.elapsed()),
        );
        let mut working = self.store.clone();
        let reconciliation = reconciler.reconcile(&working, &incoming)?;
        let inserted_ids = reconciler.apply(&mut working, &reconciliation)?;
        summary.inserted = inserted_ids.len();
        summary.updated = reconciliation.updated_count();
        summary.unchanged = reconciliation.unchanged_count();
        summary.flawed = reconciliation.flawed.len();
        summary.rejected = reconciliation.rejected.len();
        summary.conflicts = reconciliation.conflicts.len();
        summary.input_conflicts = reconciliation.input_conflicts.len();

        emit(
            sink,
            format!("phase=Link; {} content candidates", candidates.len()),
            Some(started.elapsed()),
        );
        let linked = linker.link(&working, candidates, &reconciliation.flawed_ids())?;
        if !linked.to_insert.is_empty() {
            working.insert_content(&linked.to_insert)?;
        }
        summary.content_inserted = linked.to_insert.len();
        summary.content_duplicates = linked.duplicates;
        summary.content_flawed = linked.flawed.len();

        if options.dry_run {
            emit(sink, "phase=Store; dry run, nothing written".to_string(), Some(started.elapsed()));
        } else {
            emit(sink, "phase=Store; persisting".to_string(), Some(started.elapsed()));
            working.persist()?;
            self.store = working;
        }

        let mut review = reconciliation
            .flawed
            .iter()
            .map(ReviewEntry::from)
            .collect::<Vec<_>>();
        review.extend(reconciliation.rejected.iter().map(ReviewEntry::from));
        review.extend(reconciliation.input_conflicts.iter().map(ReviewEntry::from));
        review.extend(linked.flawed.iter().map(ReviewEntry::from));

        info!(
            inserted = summary.inserted,
            updated = summary.updated,
            flawed = summary.flawed,
            content = summary.content_inserted,
            dry_run = options.dry_run,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "populate finished"
        );

        Ok(PopulateResult {
            generated_at: chrono::Utc::now().to_rfc3339(),
            dry_run: options.dry_run,
            summary,
            inserted_ids,
            conflicts: reconciliation.conflicts,
            input_conflicts: reconciliation.input_conflicts,
            review,
        })
    }

    fn find(&self, specifier: &IdentifierSpecifier) -> Result<Vec<CanonicalRecord>, ReconcileError> {
        let records = match specifier.as_lookup() {
            Some((id_type, value)) => self
                .store
                .find_by_identifiers(id_type, &BTreeSet::from([value.to_string()]))?,
            None => {
                let IdentifierSpecifier::Record(id) = specifier else {
                    return Ok(Vec::new());
                };
                self.store.find_by_ids(&BTreeSet::from([*id]))?
            }
        };
        if records.is_empty() {
            return Err(ReconcileError::NotFound(specifier.to_string()));
        }
        Ok(records)
    }

    pub fn lookup(
        &self,
        specifier: &IdentifierSpecifier,
        sink: &dyn ProgressSink,
    ) -> Result<LookupResult, ReconcileError> {
        emit(sink, format!("phase=Resolve; looking up {specifier}"), None);
        let records = self
            .find(specifier)?
            .into_iter()
            .map(|record| {
                let content = self
                    .store
                    .content_for(record.id)?
                    .into_iter()
                    .map(|row| row.key)
                    .collect();
                Ok(LookupEntry { record, content })
            })
            .collect::<Result<Vec<_>, ReconcileError>>()?;
        Ok(LookupResult {
            specifier: specifier.to_string(),
            records,
        })
    }

    pub fn stats(&self, sink: &dyn ProgressSink) -> Result<StatsResult, ReconcileError> {
        emit(sink, "phase=Resolve; scanning store".to_string(), None);
        let records = self.store.records()?;
        let count = |id_type: IdType| {
            records
                .iter()
                .filter(|record| record.raw(id_type).is_some())
                .count()
        };
        let content_by_source = self.store.content_count_by_source()?;
        Ok(StatsResult {
            text_refs: records.len(),
            with_pmid: count(IdType::Pmid),
            with_pmcid: count(IdType::Pmcid),
            with_doi: count(IdType::Doi),
            content_total: content_by_source.values().sum(),
            content_by_source,
        })
    }

    /// Best content row per text ref under the configured priority tables.
    pub fn preferred(
        &self,
        specifier: Option<&IdentifierSpecifier>,
        sink: &dyn ProgressSink,
    ) -> Result<PreferredResult, ReconcileError> {
        emit(sink, "phase=Resolve; ranking content".to_string(), None);
        let records = match specifier {
            Some(specifier) => self.find(specifier)?,
            None => self.store.records()?,
        };
        let mut rows = Vec::new();
        for record in &records {
            rows.extend(self.store.content_for(record.id)?);
        }
        let entries = self
            .config
            .priority
            .preferred(rows)
            .into_values()
            .map(|row| PreferredEntry {
                record_id: row.key.record_id,
                source: row.key.source,
                format: row.key.format,
                text_type: row.key.text_type,
                length: row.content.chars().count(),
            })
            .collect();
        Ok(PreferredResult { entries })
    }
}
