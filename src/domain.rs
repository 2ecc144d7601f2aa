use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ReconcileError;
use crate::normalize::{normalize_doi, normalize_pmcid, normalize_pmid, normalize_secondary};

/// Internal text ref ID assigned by the reference store.
pub type RecordId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdType {
    Pmid,
    Pmcid,
    Doi,
}

impl IdType {
    /// Lookup order used by classification and content linking.
    pub const PRIORITY: [IdType; 3] = [IdType::Pmid, IdType::Pmcid, IdType::Doi];

    pub fn as_str(&self) -> &'static str {
        match self {
            IdType::Pmid => "pmid",
            IdType::Pmcid => "pmcid",
            IdType::Doi => "doi",
        }
    }

    /// Normalizes `value` the way identifiers of this type are compared.
    pub fn normalize(&self, value: &str) -> Option<String> {
        match self {
            IdType::Pmid => normalize_pmid(value),
            IdType::Pmcid => normalize_pmcid(value),
            IdType::Doi => normalize_doi(value),
        }
    }
}

impl fmt::Display for IdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IdType {
    type Err = ReconcileError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pmid" | "pubmed_id" => Ok(IdType::Pmid),
            "pmcid" => Ok(IdType::Pmcid),
            "doi" => Ok(IdType::Doi),
            _ => Err(ReconcileError::InvalidSpecifier(value.to_string())),
        }
    }
}

macro_rules! identifier_newtype {
    ($name:ident, $id_type:expr, $normalize:path) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ReconcileError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                $normalize(value)
                    .map(Self)
                    .ok_or_else(|| ReconcileError::UnparseableIdentifier {
                        id_type: $id_type,
                        value: value.to_string(),
                    })
            }
        }

        impl TryFrom<String> for $name {
            type Error = ReconcileError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

identifier_newtype!(Pmid, IdType::Pmid, normalize_pmid);
identifier_newtype!(Pmcid, IdType::Pmcid, normalize_pmcid);
identifier_newtype!(Doi, IdType::Doi, normalize_doi);

/// Normalized primary identifiers of one work.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct IdentifierSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmid: Option<Pmid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmcid: Option<Pmcid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<Doi>,
}

impl IdentifierSet {
    pub fn get(&self, id_type: IdType) -> Option<&str> {
        match id_type {
            IdType::Pmid => self.pmid.as_ref().map(Pmid::as_str),
            IdType::Pmcid => self.pmcid.as_ref().map(Pmcid::as_str),
            IdType::Doi => self.doi.as_ref().map(Doi::as_str),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pmid.is_none() && self.pmcid.is_none() && self.doi.is_none()
    }

    /// Present identifiers in lookup priority order.
    pub fn iter(&self) -> impl Iterator<Item = (IdType, &str)> + '_ {
        IdType::PRIORITY
            .into_iter()
            .filter_map(|id_type| self.get(id_type).map(|value| (id_type, value)))
    }

    /// Fills fields missing on `self` from `other`.
    pub fn fill_from(&mut self, other: &IdentifierSet) {
        if self.pmid.is_none() {
            self.pmid = other.pmid.clone();
        }
        if self.pmcid.is_none() {
            self.pmcid = other.pmcid.clone();
        }
        if self.doi.is_none() {
            self.doi = other.doi.clone();
        }
    }
}

impl fmt::Display for IdentifierSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self
            .iter()
            .map(|(id_type, value)| format!("{id_type}:{value}"))
            .collect::<Vec<_>>();
        if parts.is_empty() {
            write!(f, "<none>")
        } else {
            write!(f, "{}", parts.join(" "))
        }
    }
}

/// Informational identifiers that never take part in matching.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SecondaryIds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cord_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub who_covidence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub microsoft_id: Option<String>,
}

impl SecondaryIds {
    pub fn fields(&self) -> [(&'static str, Option<&str>); 3] {
        [
            ("cord_uid", self.cord_uid.as_deref()),
            ("who_covidence", self.who_covidence.as_deref()),
            ("microsoft_id", self.microsoft_id.as_deref()),
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.cord_uid.is_none() && self.who_covidence.is_none() && self.microsoft_id.is_none()
    }

    /// Fills fields missing on `self` from `other` and returns the
    /// `(field, kept, rejected)` triples where both sides disagree.
    pub fn fill_from(&mut self, other: &SecondaryIds) -> Vec<(&'static str, String, String)> {
        let mut conflicts = Vec::new();
        for (name, slot, incoming) in [
            ("cord_uid", &mut self.cord_uid, &other.cord_uid),
            ("who_covidence", &mut self.who_covidence, &other.who_covidence),
            ("microsoft_id", &mut self.microsoft_id, &other.microsoft_id),
        ] {
            let Some(value) = incoming else {
                continue;
            };
            match slot {
                None => *slot = Some(value.clone()),
                Some(kept) if *kept != *value => {
                    conflicts.push((name, kept.clone(), value.clone()));
                }
                Some(_) => {}
            }
        }
        conflicts
    }
}

/// A persisted text ref, as the reference store returns it.
///
/// Primary identifiers are kept as stored; legacy rows may predate DOI
/// uppercasing, so comparisons go through [`CanonicalRecord::identifiers`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmcid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    #[serde(flatten)]
    pub secondary: SecondaryIds,
}

impl CanonicalRecord {
    pub fn raw(&self, id_type: IdType) -> Option<&str> {
        match id_type {
            IdType::Pmid => self.pmid.as_deref(),
            IdType::Pmcid => self.pmcid.as_deref(),
            IdType::Doi => self.doi.as_deref(),
        }
    }

    /// Normalized view of the stored identifiers. Values that no longer
    /// normalize are left out.
    pub fn identifiers(&self) -> IdentifierSet {
        IdentifierSet {
            pmid: self.pmid.as_deref().and_then(|value| value.parse().ok()),
            pmcid: self.pmcid.as_deref().and_then(|value| value.parse().ok()),
            doi: self.doi.as_deref().and_then(|value| value.parse().ok()),
        }
    }

    pub fn from_new(id: RecordId, record: &NewRecord) -> Self {
        Self {
            id,
            pmid: record.ids.pmid.as_ref().map(|value| value.to_string()),
            pmcid: record.ids.pmcid.as_ref().map(|value| value.to_string()),
            doi: record.ids.doi.as_ref().map(|value| value.to_string()),
            secondary: record.secondary.clone(),
        }
    }

    /// Applies a patch; only empty fields are written.
    pub fn apply(&mut self, patch: &RecordPatch) {
        if self.pmid.is_none() {
            self.pmid = patch.ids.pmid.as_ref().map(|value| value.to_string());
        }
        if self.pmcid.is_none() {
            self.pmcid = patch.ids.pmcid.as_ref().map(|value| value.to_string());
        }
        if self.doi.is_none() {
            self.doi = patch.ids.doi.as_ref().map(|value| value.to_string());
        }
        // Patches only carry secondary IDs the record lacks.
        let dropped = self.secondary.fill_from(&patch.secondary);
        debug_assert!(dropped.is_empty(), "patch overwrote secondary IDs: {dropped:?}");
    }
}

/// A raw identifier tuple from the external metadata feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingRecord {
    pub pmid: Option<String>,
    pub pmcid: Option<String>,
    pub doi: Option<String>,
    #[serde(flatten)]
    pub secondary: SecondaryIds,
}

impl IncomingRecord {
    pub fn raw(&self, id_type: IdType) -> Option<&str> {
        match id_type {
            IdType::Pmid => self.pmid.as_deref(),
            IdType::Pmcid => self.pmcid.as_deref(),
            IdType::Doi => self.doi.as_deref(),
        }
    }

    pub fn secondary_normalized(&self) -> SecondaryIds {
        SecondaryIds {
            cord_uid: self.secondary.cord_uid.as_deref().and_then(normalize_secondary),
            who_covidence: self
                .secondary
                .who_covidence
                .as_deref()
                .and_then(normalize_secondary),
            microsoft_id: self
                .secondary
                .microsoft_id
                .as_deref()
                .and_then(normalize_secondary),
        }
    }
}

/// A reconciled record that has no counterpart in the store yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewRecord {
    pub ids: IdentifierSet,
    #[serde(flatten)]
    pub secondary: SecondaryIds,
}

/// Fields to fill on an existing text ref. Only carries values the record lacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordPatch {
    pub record_id: RecordId,
    pub ids: IdentifierSet,
    #[serde(flatten)]
    pub secondary: SecondaryIds,
}

impl RecordPatch {
    pub fn new(record_id: RecordId) -> Self {
        Self {
            record_id,
            ids: IdentifierSet::default(),
            secondary: SecondaryIds::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.secondary.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextType {
    Fulltext,
    Abstract,
    Title,
}

impl TextType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextType::Fulltext => "fulltext",
            TextType::Abstract => "abstract",
            TextType::Title => "title",
        }
    }
}

impl fmt::Display for TextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentFormat {
    Text,
    Xml,
}

impl fmt::Display for ContentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentFormat::Text => write!(f, "text"),
            ContentFormat::Xml => write!(f, "xml"),
        }
    }
}

/// Identity of a stored content row. Content bytes are not part of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentKey {
    pub record_id: RecordId,
    pub source: String,
    pub format: ContentFormat,
    pub text_type: TextType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRecord {
    #[serde(flatten)]
    pub key: ContentKey,
    pub content: String,
}

/// Content waiting to be linked, still keyed by the feed's identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentCandidate {
    pub ids: IdentifierSet,
    pub cord_uid: Option<String>,
    pub source: String,
    pub format: ContentFormat,
    pub text_type: TextType,
    pub content: String,
}

impl ContentCandidate {
    pub fn key_for(&self, record_id: RecordId) -> ContentKey {
        ContentKey {
            record_id,
            source: self.source.clone(),
            format: self.format,
            text_type: self.text_type,
        }
    }
}

/// `pmid:123`, `pmcid:PMC1`, `doi:10.1/x` or `id:42`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifierSpecifier {
    Pmid(Pmid),
    Pmcid(Pmcid),
    Doi(Doi),
    Record(RecordId),
}

impl IdentifierSpecifier {
    pub fn as_lookup(&self) -> Option<(IdType, &str)> {
        match self {
            IdentifierSpecifier::Pmid(value) => Some((IdType::Pmid, value.as_str())),
            IdentifierSpecifier::Pmcid(value) => Some((IdType::Pmcid, value.as_str())),
            IdentifierSpecifier::Doi(value) => Some((IdType::Doi, value.as_str())),
            IdentifierSpecifier::Record(_) => None,
        }
    }
}

impl fmt::Display for IdentifierSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentifierSpecifier::Pmid(value) => write!(f, "pmid:{value}"),
            IdentifierSpecifier::Pmcid(value) => write!(f, "pmcid:{value}"),
            IdentifierSpecifier::Doi(value) => write!(f, "doi:{value}"),
            IdentifierSpecifier::Record(id) => write!(f, "id:{id}"),
        }
    }
}

impl FromStr for IdentifierSpecifier {
    type Err = ReconcileError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let (kind, rest) = trimmed
            .split_once(':')
            .ok_or_else(|| ReconcileError::InvalidSpecifier(value.to_string()))?;
        match kind.to_ascii_lowercase().as_str() {
            "pmid" => Ok(IdentifierSpecifier::Pmid(rest.parse()?)),
            "pmcid" => Ok(IdentifierSpecifier::Pmcid(rest.parse()?)),
            "doi" => Ok(IdentifierSpecifier::Doi(rest.parse()?)),
            "id" | "trid" => rest
                .trim()
                .parse()
                .map(IdentifierSpecifier::Record)
                .map_err(|_| ReconcileError::InvalidSpecifier(value.to_string())),
            _ => Err(ReconcileError::InvalidSpecifier(value.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_pmid_rejects_words() {
        let err = "Other".parse::<Pmid>().unwrap_err();
        assert_matches!(
            err,
            ReconcileError::UnparseableIdentifier {
                id_type: IdType::Pmid,
                ..
            }
        );
    }

    #[test]
    fn parse_doi_strips_resolver() {
        let doi: Doi = "https://doi.org/10.1038/s41586-020-2649-2".parse().unwrap();
        assert_eq!(doi.as_str(), "10.1038/S41586-020-2649-2");
    }

    #[test]
    fn parse_specifier_doi_with_colon_in_value() {
        let spec: IdentifierSpecifier = "doi:doi:10.1/abc".parse().unwrap();
        assert_matches!(spec, IdentifierSpecifier::Doi(ref doi) if doi.as_str() == "10.1/ABC");
    }

    #[test]
    fn parse_specifier_record_id() {
        let spec: IdentifierSpecifier = "id:42".parse().unwrap();
        assert_eq!(spec, IdentifierSpecifier::Record(42));
        assert!("id:abc".parse::<IdentifierSpecifier>().is_err());
    }

    #[test]
    fn secondary_fill_keeps_first_value() {
        let mut kept = SecondaryIds {
            cord_uid: Some("abc".to_string()),
            ..Default::default()
        };
        let incoming = SecondaryIds {
            cord_uid: Some("xyz".to_string()),
            microsoft_id: Some("3001".to_string()),
            ..Default::default()
        };
        let conflicts = kept.fill_from(&incoming);
        assert_eq!(kept.cord_uid.as_deref(), Some("abc"));
        assert_eq!(kept.microsoft_id.as_deref(), Some("3001"));
        assert_eq!(
            conflicts,
            vec![("cord_uid", "abc".to_string(), "xyz".to_string())]
        );
    }

    #[test]
    fn canonical_identifiers_normalize_legacy_doi() {
        let record = CanonicalRecord {
            id: 7,
            pmid: Some("12345".to_string()),
            pmcid: None,
            doi: Some("10.1000/xyz".to_string()),
            secondary: SecondaryIds::default(),
        };
        let ids = record.identifiers();
        assert_eq!(ids.get(IdType::Doi), Some("10.1000/XYZ"));
        assert_eq!(ids.get(IdType::Pmid), Some("12345"));
    }
}
