use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{
    ContentCandidate, ContentFormat, ContentKey, ContentRecord, IdentifierSet, RecordId, TextType,
};
use crate::error::ReconcileError;
use crate::index::ReferenceIndex;
use crate::store::{ContentStore, ReferenceStore, fetch_snapshot};

pub const DEFAULT_CONTENT_CHUNK_SIZE: usize = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentFlaw {
    /// The text ref this content belongs to was routed to review.
    ReferenceFlawed,
    /// No text ref carries any of the candidate's identifiers.
    Unmatched,
    /// The candidate's identifiers reach more than one text ref.
    Ambiguous { candidates: Vec<RecordId> },
}

impl ContentFlaw {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentFlaw::ReferenceFlawed => "reference_flawed",
            ContentFlaw::Unmatched => "unmatched",
            ContentFlaw::Ambiguous { .. } => "ambiguous",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlawedContent {
    pub ids: IdentifierSet,
    pub cord_uid: Option<String>,
    pub source: String,
    pub text_type: TextType,
    pub flaw: ContentFlaw,
}

impl FlawedContent {
    fn new(candidate: &ContentCandidate, flaw: ContentFlaw) -> Self {
        Self {
            ids: candidate.ids.clone(),
            cord_uid: candidate.cord_uid.clone(),
            source: candidate.source.clone(),
            text_type: candidate.text_type,
            flaw,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkResult {
    pub to_insert: Vec<ContentRecord>,
    pub flawed: Vec<FlawedContent>,
    pub duplicates: usize,
}

/// Attaches content candidates to text refs and drops the ones whose key
/// is already stored.
///
/// Candidates resolve strictly: the union of hits across identifier types
/// must be exactly one text ref. Equality is on the key only, so a stored
/// row with different text still blocks the insert.
#[derive(Debug, Clone)]
pub struct ContentLinker {
    chunk_size: usize,
}

impl ContentLinker {
    pub fn new(chunk_size: usize) -> Result<Self, ReconcileError> {
        if chunk_size == 0 {
            return Err(ReconcileError::InvalidChunkSize);
        }
        Ok(Self { chunk_size })
    }

    pub fn link<S>(
        &self,
        store: &S,
        candidates: Vec<ContentCandidate>,
        excluded: &HashSet<IdentifierSet>,
    ) -> Result<LinkResult, ReconcileError>
    where
        S: ReferenceStore + ContentStore + ?Sized,
    {
        let mut result = LinkResult::default();
        let mut seen = HashSet::<ContentKey>::new();
        let total = candidates.len();

        for (number, chunk) in candidates.chunks(self.chunk_size).enumerate() {
            let mut eligible = Vec::with_capacity(chunk.len());
            for candidate in chunk {
                if excluded.contains(&candidate.ids) {
                    debug!(ids = %candidate.ids, source = %candidate.source, "content of flawed text ref held back");
                    result
                        .flawed
                        .push(FlawedContent::new(candidate, ContentFlaw::ReferenceFlawed));
                } else {
                    eligible.push(candidate);
                }
            }

            let snapshot =
                fetch_snapshot(store, eligible.iter().map(|candidate| &candidate.ids))?;
            let index = ReferenceIndex::build(snapshot);
            let resolved = resolve_chunk(&index, eligible, &mut result.flawed);
            let existing = existing_keys(store, &resolved)?;
            debug!(
                chunk = number,
                resolved = resolved.len(),
                existing = existing.len(),
                "linking content chunk"
            );

            for (record_id, candidate) in resolved {
                let key = candidate.key_for(record_id);
                if existing.contains(&key) || !seen.insert(key.clone()) {
                    debug!(record_id, source = %key.source, text_type = %key.text_type, "content already present");
                    result.duplicates += 1;
                    continue;
                }
                result.to_insert.push(ContentRecord {
                    key,
                    content: candidate.content.clone(),
                });
            }
        }

        info!(
            candidates = total,
            insert = result.to_insert.len(),
            duplicates = result.duplicates,
            flawed = result.flawed.len(),
            "linked content"
        );
        Ok(result)
    }
}

fn resolve_chunk<'c>(
    index: &ReferenceIndex,
    candidates: Vec<&'c ContentCandidate>,
    flawed: &mut Vec<FlawedContent>,
) -> Vec<(RecordId, &'c ContentCandidate)> {
    let mut resolved = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        match index.resolve(&candidate.ids) {
            Ok(Some(record_id)) => resolved.push((record_id, candidate)),
            Ok(None) => {
                warn!(ids = %candidate.ids, source = %candidate.source, "content matches no text ref");
                flawed.push(FlawedContent::new(candidate, ContentFlaw::Unmatched));
            }
            Err(err) => {
                let candidates = match err {
                    ReconcileError::AmbiguousReference { candidates, .. } => candidates,
                    _ => Vec::new(),
                };
                warn!(ids = %candidate.ids, source = %candidate.source, ?candidates, "content matches several text refs");
                flawed.push(FlawedContent::new(
                    candidate,
                    ContentFlaw::Ambiguous { candidates },
                ));
            }
        }
    }
    resolved
}

/// Stored keys for the resolved candidates, queried once per
/// (source, format, text type) group.
fn existing_keys<S>(
    store: &S,
    resolved: &[(RecordId, &ContentCandidate)],
) -> Result<HashSet<ContentKey>, ReconcileError>
where
    S: ContentStore + ?Sized,
{
    let mut groups = BTreeMap::<(&str, ContentFormat, TextType), BTreeSet<RecordId>>::new();
    for (record_id, candidate) in resolved {
        groups
            .entry((
                candidate.source.as_str(),
                candidate.format,
                candidate.text_type,
            ))
            .or_default()
            .insert(*record_id);
    }

    let mut existing = HashSet::new();
    for ((source, format, text_type), record_ids) in groups {
        existing.extend(
            store
                .find_content(&record_ids, source, format, text_type)?
                .into_iter()
                .map(|row| row.key),
        );
    }
    Ok(existing)
}
