use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::{ContentRecord, RecordId};

/// Rank given to keys a table does not list.
pub const UNRANKED: u32 = 100;

/// Ordered `(key, rank)` pairs; lower ranks are preferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriorityTable(Vec<(String, u32)>);

impl PriorityTable {
    pub fn new<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, u32)>,
        K: Into<String>,
    {
        Self(
            entries
                .into_iter()
                .map(|(key, rank)| (key.into(), rank))
                .collect(),
        )
    }

    pub fn rank(&self, key: &str) -> u32 {
        match self.0.iter().find(|(known, _)| known == key) {
            Some((_, rank)) => *rank,
            None => {
                info!(key, "no priority configured, ranking last");
                UNRANKED
            }
        }
    }

    pub fn entries(&self) -> &[(String, u32)] {
        &self.0
    }
}

/// Lowest-ranked item per group. Ties keep the earliest item.
pub fn pick_best<T, K, G, R>(items: impl IntoIterator<Item = T>, group: G, rank: R) -> BTreeMap<K, T>
where
    K: Ord,
    G: Fn(&T) -> K,
    R: Fn(&T) -> (u32, u32),
{
    let mut best = BTreeMap::<K, ((u32, u32), T)>::new();
    for item in items {
        let key = group(&item);
        let score = rank(&item);
        match best.get(&key) {
            Some((kept, _)) if *kept <= score => {}
            _ => {
                best.insert(key, (score, item));
            }
        }
    }
    best.into_iter().map(|(key, (_, item))| (key, item)).collect()
}

/// Preference order for choosing one content row per text ref.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPriority {
    pub text_type: PriorityTable,
    pub source: PriorityTable,
}

impl Default for ContentPriority {
    fn default() -> Self {
        Self {
            text_type: default_text_type_priority(),
            source: default_source_priority(),
        }
    }
}

impl ContentPriority {
    pub fn score(&self, row: &ContentRecord) -> (u32, u32) {
        (
            self.text_type.rank(row.key.text_type.as_str()),
            self.source.rank(&row.key.source),
        )
    }

    /// Preferred content row for each text ref.
    pub fn preferred(&self, rows: Vec<ContentRecord>) -> BTreeMap<RecordId, ContentRecord> {
        pick_best(rows, |row: &ContentRecord| row.key.record_id, |row| self.score(row))
    }
}

pub fn default_text_type_priority() -> PriorityTable {
    PriorityTable::new([("fulltext", 0), ("abstract", 1), ("title", 2)])
}

pub fn default_source_priority() -> PriorityTable {
    PriorityTable::new([
        ("pmc_oa", 0),
        ("manuscripts", 1),
        ("elsevier", 2),
        ("cord19_pmc_xml", 3),
        ("cord19_pdf", 4),
        ("cord19_abstract", 5),
        ("pubmed", 6),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ContentFormat, ContentKey, TextType};

    fn row(record_id: RecordId, source: &str, text_type: TextType) -> ContentRecord {
        ContentRecord {
            key: ContentKey {
                record_id,
                source: source.to_string(),
                format: ContentFormat::Text,
                text_type,
            },
            content: format!("{source}-{text_type}"),
        }
    }

    #[test]
    fn fulltext_beats_abstract_regardless_of_source() {
        let best = ContentPriority::default().preferred(vec![
            row(1, "pmc_oa", TextType::Abstract),
            row(1, "cord19_pdf", TextType::Fulltext),
            row(2, "pubmed", TextType::Abstract),
        ]);
        assert_eq!(best[&1].key.source, "cord19_pdf");
        assert_eq!(best[&2].key.source, "pubmed");
    }

    #[test]
    fn source_breaks_ties_and_unknown_ranks_last() {
        let best = ContentPriority::default().preferred(vec![
            row(1, "somewhere_else", TextType::Fulltext),
            row(1, "cord19_pmc_xml", TextType::Fulltext),
            row(1, "pmc_oa", TextType::Fulltext),
        ]);
        assert_eq!(best[&1].key.source, "pmc_oa");
        assert_eq!(default_source_priority().rank("somewhere_else"), UNRANKED);
    }
}
