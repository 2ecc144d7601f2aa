//! Canonical forms for the identifiers found in literature metadata feeds.
//!
//! Every normalizer is idempotent: feeding its output back in returns the
//! same value. Inputs that cannot be normalized yield `None` and are treated
//! as absent by callers.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::warn;

use crate::domain::{IdType, IdentifierSet, IncomingRecord, SecondaryIds};
use crate::error::ReconcileError;

const DOI_PREFIXES: [&str; 7] = [
    "https://doi.org/",
    "http://doi.org/",
    "https://dx.doi.org/",
    "http://dx.doi.org/",
    "dx.doi.org/",
    "doi.org/",
    "doi:",
];

static PMCID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^PMC[0-9]+$").expect("PMCID pattern is valid"));

/// Drops the `.0` a tabular loader appends when it reads an integer column
/// holding blanks as floating point. Repeated suffixes all go, along with
/// whitespace left in front of them.
pub fn strip_float_suffix(value: &str) -> &str {
    let mut value = value.trim_end();
    while let Some(stripped) = value.strip_suffix(".0") {
        value = stripped.trim_end();
    }
    value
}

/// Strips resolver prefixes and uppercases. Does not validate DOI syntax.
pub fn normalize_doi(raw: &str) -> Option<String> {
    let mut value = raw.trim();
    loop {
        let lower = value.to_ascii_lowercase();
        match DOI_PREFIXES.iter().find(|prefix| lower.starts_with(*prefix)) {
            Some(prefix) => value = value[prefix.len()..].trim_start(),
            None => break,
        }
    }
    if value.is_empty() {
        return None;
    }
    Some(value.to_uppercase())
}

/// Digits only; anything else (e.g. `"Other"`) is rejected.
pub fn normalize_pmid(raw: &str) -> Option<String> {
    let value = strip_float_suffix(raw.trim());
    if value.is_empty() || !value.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    Some(value.to_string())
}

/// `PMC<digits>`; bare digits get the prefix.
pub fn normalize_pmcid(raw: &str) -> Option<String> {
    let value = raw.trim().to_ascii_uppercase();
    let value = if !value.is_empty() && value.chars().all(|ch| ch.is_ascii_digit()) {
        format!("PMC{value}")
    } else {
        value
    };
    PMCID_RE.is_match(&value).then_some(value)
}

/// Trims informational IDs and removes float artifacts. Blank becomes `None`.
pub fn normalize_secondary(raw: &str) -> Option<String> {
    let value = strip_float_suffix(raw.trim());
    (!value.is_empty()).then(|| value.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentifierIssue {
    pub id_type: IdType,
    pub value: String,
}

impl From<&IdentifierIssue> for ReconcileError {
    fn from(issue: &IdentifierIssue) -> Self {
        ReconcileError::UnparseableIdentifier {
            id_type: issue.id_type,
            value: issue.value.clone(),
        }
    }
}

/// An incoming record after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRecord {
    pub ids: IdentifierSet,
    pub secondary: SecondaryIds,
    pub issues: Vec<IdentifierIssue>,
}

/// Normalizes every field of `record`.
///
/// Unparseable identifiers are dropped and reported in `issues`. A record
/// left without any primary identifier is rejected with
/// [`ReconcileError::NoIdentifiers`].
pub fn normalize_record(record: &IncomingRecord) -> Result<NormalizedRecord, ReconcileError> {
    let mut ids = IdentifierSet::default();
    let mut issues = Vec::new();

    for id_type in IdType::PRIORITY {
        let Some(raw) = record.raw(id_type) else {
            continue;
        };
        if raw.trim().is_empty() {
            continue;
        }
        let Some(value) = id_type.normalize(raw) else {
            let issue = IdentifierIssue {
                id_type,
                value: raw.to_string(),
            };
            warn!(error = %ReconcileError::from(&issue), "dropping identifier");
            issues.push(issue);
            continue;
        };
        match id_type {
            IdType::Pmid => ids.pmid = value.parse().ok(),
            IdType::Pmcid => ids.pmcid = value.parse().ok(),
            IdType::Doi => ids.doi = value.parse().ok(),
        }
    }

    if ids.is_empty() {
        return Err(ReconcileError::NoIdentifiers);
    }

    Ok(NormalizedRecord {
        ids,
        secondary: record.secondary_normalized(),
        issues,
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn doi_prefixes_are_stripped() {
        assert_eq!(
            normalize_doi("http://dx.doi.org/10.1000/XYZ").as_deref(),
            Some("10.1000/XYZ")
        );
        assert_eq!(
            normalize_doi("doi.org/10.1000/abc").as_deref(),
            Some("10.1000/ABC")
        );
        assert_eq!(
            normalize_doi("DOI: 10.1000/abc").as_deref(),
            Some("10.1000/ABC")
        );
    }

    #[test]
    fn doi_blank_is_none() {
        assert_eq!(normalize_doi("   "), None);
        assert_eq!(normalize_doi("https://doi.org/"), None);
    }

    #[test]
    fn doi_nested_prefixes_are_idempotent() {
        let once = normalize_doi("https://doi.org/doi:10.1/x").unwrap();
        assert_eq!(once, "10.1/X");
        assert_eq!(normalize_doi(&once).as_deref(), Some(once.as_str()));
    }

    #[test]
    fn pmid_float_artifact() {
        assert_eq!(normalize_pmid("12345.0").as_deref(), Some("12345"));
        assert_eq!(normalize_pmid(" 12345 ").as_deref(), Some("12345"));
        assert_eq!(normalize_pmid("Other"), None);
        assert_eq!(normalize_pmid("12a45"), None);
        assert_eq!(normalize_pmid(""), None);
    }

    #[test]
    fn pmcid_forms() {
        assert_eq!(normalize_pmcid("pmc999").as_deref(), Some("PMC999"));
        assert_eq!(normalize_pmcid("999").as_deref(), Some("PMC999"));
        assert_eq!(normalize_pmcid("PMC"), None);
        assert_eq!(normalize_pmcid("PMCX1"), None);
    }

    #[test]
    fn record_with_only_bad_ids_is_rejected() {
        let record = IncomingRecord {
            pmid: Some("Other".to_string()),
            ..Default::default()
        };
        assert_matches!(normalize_record(&record), Err(ReconcileError::NoIdentifiers));
    }

    #[test]
    fn record_keeps_good_ids_and_reports_bad() {
        let record = IncomingRecord {
            pmid: Some("Other".to_string()),
            doi: Some("doi.org/10.1/b".to_string()),
            ..Default::default()
        };
        let normalized = normalize_record(&record).unwrap();
        assert_eq!(normalized.ids.get(IdType::Doi), Some("10.1/B"));
        assert_eq!(normalized.ids.pmid, None);
        assert_eq!(
            normalized.issues,
            vec![IdentifierIssue {
                id_type: IdType::Pmid,
                value: "Other".to_string()
            }]
        );
    }
}
