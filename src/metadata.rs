use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::documents::DocumentSource;
use crate::domain::{
    ContentCandidate, ContentFormat, IdentifierSet, IncomingRecord, SecondaryIds, TextType,
};
use crate::error::ReconcileError;
use crate::normalize::{normalize_doi, normalize_record};

/// One row of a CORD-19 style `metadata.csv`. Unknown columns are ignored,
/// missing ones read as empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MetadataEntry {
    #[serde(default)]
    pub cord_uid: Option<String>,
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub doi: Option<String>,
    #[serde(default)]
    pub pmcid: Option<String>,
    #[serde(default)]
    pub pubmed_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, rename = "abstract")]
    pub abstract_text: Option<String>,
    #[serde(default, rename = "WHO #Covidence")]
    pub who_covidence: Option<String>,
    #[serde(default, rename = "Microsoft Academic Paper ID")]
    pub microsoft_id: Option<String>,
    #[serde(default)]
    pub pdf_json_files: Option<String>,
    #[serde(default)]
    pub pmc_json_files: Option<String>,
}

impl MetadataEntry {
    pub fn incoming(&self) -> IncomingRecord {
        IncomingRecord {
            pmid: self.pubmed_id.clone(),
            pmcid: self.pmcid.clone(),
            doi: self.doi.clone(),
            secondary: SecondaryIds {
                cord_uid: self.cord_uid.clone(),
                who_covidence: self.who_covidence.clone(),
                microsoft_id: self.microsoft_id.clone(),
            },
        }
    }

    /// Normalized identifiers, or `None` when the row has no usable one.
    pub fn identifiers(&self) -> Option<IdentifierSet> {
        normalize_record(&self.incoming()).ok().map(|normalized| normalized.ids)
    }

    pub fn first_pdf_json(&self) -> Option<&str> {
        self.pdf_json_files
            .as_deref()?
            .split(';')
            .map(str::trim)
            .find(|path| !path.is_empty())
    }

    pub fn pmc_json(&self) -> Option<&str> {
        self.pmc_json_files
            .as_deref()?
            .split(';')
            .map(str::trim)
            .find(|path| !path.is_empty())
    }

    /// Abstract and full-text candidates for this entry, keyed by its own
    /// identifiers. Full texts are only read when `documents` is given; a
    /// document that cannot be read is logged and skipped.
    pub fn content_candidates(
        &self,
        source_tag: &str,
        mut documents: Option<&mut DocumentSource>,
    ) -> Vec<ContentCandidate> {
        let Some(ids) = self.identifiers() else {
            return Vec::new();
        };
        let candidate = |suffix: &str, text_type: TextType, content: String| ContentCandidate {
            ids: ids.clone(),
            cord_uid: self.cord_uid.clone(),
            source: format!("{source_tag}_{suffix}"),
            format: ContentFormat::Text,
            text_type,
            content,
        };

        let mut candidates = Vec::new();
        if let Some(text) = self
            .abstract_text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
        {
            candidates.push(candidate("abstract", TextType::Abstract, text.to_string()));
        }

        let Some(documents) = documents.as_deref_mut() else {
            return candidates;
        };
        for (suffix, path) in [("pmc_xml", self.pmc_json()), ("pdf", self.first_pdf_json())] {
            let Some(path) = path else {
                continue;
            };
            match documents.read_text(path) {
                Ok(text) => candidates.push(candidate(suffix, TextType::Fulltext, text)),
                Err(err) => warn!(
                    cord_uid = self.cord_uid.as_deref().unwrap_or(""),
                    error = %err,
                    "skipping full text"
                ),
            }
        }
        candidates
    }
}

/// Row-level filter applied before reconciliation.
#[derive(Debug, Clone, Default)]
pub struct MetadataFilter {
    exclude_dois: HashSet<String>,
    require_doi: bool,
}

impl MetadataFilter {
    pub fn new<I, S>(exclude_dois: I, require_doi: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            exclude_dois: exclude_dois
                .into_iter()
                .filter_map(|doi| normalize_doi(doi.as_ref()))
                .collect(),
            require_doi,
        }
    }

    pub fn accepts(&self, entry: &MetadataEntry) -> bool {
        match entry.doi.as_deref().and_then(normalize_doi) {
            Some(doi) => !self.exclude_dois.contains(&doi),
            None => !self.require_doi,
        }
    }
}

/// Streams [`MetadataEntry`] rows from CSV, gunzipping `.gz` files.
pub struct MetadataReader<R: Read> {
    inner: csv::Reader<R>,
}

impl<R: Read> std::fmt::Debug for MetadataReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataReader").finish_non_exhaustive()
    }
}

impl MetadataReader<Box<dyn Read>> {
    pub fn open(path: &Path) -> Result<Self, ReconcileError> {
        if !path.exists() {
            return Err(ReconcileError::MissingInput(path.to_path_buf()));
        }
        let file = File::open(path).map_err(|err| ReconcileError::MetadataRead {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        let gzipped = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("gz"))
            .unwrap_or(false);
        let reader: Box<dyn Read> = if gzipped {
            Box::new(GzDecoder::new(BufReader::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };
        debug!(path = %path.display(), gzipped, "reading metadata");
        Ok(Self::from_reader(reader))
    }
}

impl<R: Read> MetadataReader<R> {
    pub fn from_reader(reader: R) -> Self {
        let inner = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        Self { inner }
    }

    pub fn entries(&mut self) -> impl Iterator<Item = Result<MetadataEntry, ReconcileError>> + '_ {
        self.inner
            .deserialize::<MetadataEntry>()
            .map(|row| row.map_err(parse_error))
    }

    pub fn read_all(mut self) -> Result<Vec<MetadataEntry>, ReconcileError> {
        self.entries().collect()
    }
}

fn parse_error(err: csv::Error) -> ReconcileError {
    let line = err.position().map(|position| position.line()).unwrap_or(0);
    ReconcileError::MetadataParse {
        line,
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::IdType;

    const CSV: &str = "\
cord_uid,sha,source_x,title,doi,pmcid,pubmed_id,abstract,WHO #Covidence,Microsoft Academic Paper ID,pdf_json_files,pmc_json_files
ug7v899j,abc,PMC,Title one,10.1186/1471-2334-1-6,PMC35282,11472636.0,First abstract,,3001.0,document_parses/pdf_json/abc.json; document_parses/pdf_json/def.json,
02tnwd4m,,Elsevier,Title two,,,,,#1234,,,
";

    #[test]
    fn reads_rows_and_ignores_unknown_columns() {
        let entries = MetadataReader::from_reader(CSV.as_bytes()).read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].pubmed_id.as_deref(), Some("11472636.0"));
        assert_eq!(entries[0].abstract_text.as_deref(), Some("First abstract"));
        assert_eq!(
            entries[0].first_pdf_json(),
            Some("document_parses/pdf_json/abc.json")
        );
        assert_eq!(entries[1].doi, None);
        assert_eq!(entries[1].who_covidence.as_deref(), Some("#1234"));
    }

    #[test]
    fn incoming_record_normalizes_float_pmid() {
        let entries = MetadataReader::from_reader(CSV.as_bytes()).read_all().unwrap();
        let ids = entries[0].identifiers().unwrap();
        assert_eq!(ids.get(IdType::Pmid), Some("11472636"));
        assert_eq!(ids.get(IdType::Doi), Some("10.1186/1471-2334-1-6"));
        assert_eq!(entries[1].identifiers(), None);
    }

    #[test]
    fn abstract_candidate_without_documents() {
        let entries = MetadataReader::from_reader(CSV.as_bytes()).read_all().unwrap();
        let candidates = entries[0].content_candidates("cord19", None);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].source, "cord19_abstract");
        assert_eq!(candidates[0].text_type, TextType::Abstract);
        assert!(entries[1].content_candidates("cord19", None).is_empty());
    }

    #[test]
    fn filter_excludes_listed_and_doi_less_rows() {
        let filter = MetadataFilter::new(["0.1126/science.abb7331"], true);
        let listed = MetadataEntry {
            doi: Some("https://doi.org/0.1126/SCIENCE.ABB7331".to_string()),
            ..Default::default()
        };
        let plain = MetadataEntry {
            doi: Some("10.1/x".to_string()),
            ..Default::default()
        };
        assert!(!filter.accepts(&listed));
        assert!(filter.accepts(&plain));
        assert!(!filter.accepts(&MetadataEntry::default()));
        assert!(MetadataFilter::new(Vec::<String>::new(), false).accepts(&MetadataEntry::default()));
    }
}
