use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::Serialize;
use tracing::warn;

use crate::domain::{IdType, IdentifierSet, RecordId};
use crate::index::ReferenceIndex;

/// Why a record was routed to the flawed channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", content = "id_types", rename_all = "snake_case")]
pub enum AmbiguityCause {
    /// One identifier value is carried by several text refs in the store.
    DuplicateInStore(IdType),
    /// Different identifier types of the same record point at different text refs.
    CrossIdentifier(Vec<IdType>),
    /// Rows of the incoming batch share this identifier but disagree elsewhere.
    InputCollision(IdType),
    /// The matched text ref already holds a different value for this type.
    FieldConflict(IdType),
}

impl fmt::Display for AmbiguityCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmbiguityCause::DuplicateInStore(id_type) => write!(f, "duplicate_in_store:{id_type}"),
            AmbiguityCause::CrossIdentifier(types) => {
                let names = types.iter().map(IdType::as_str).collect::<Vec<_>>();
                write!(f, "over_match_db:{}", names.join(","))
            }
            AmbiguityCause::InputCollision(id_type) => write!(f, "over_match_input:{id_type}"),
            AmbiguityCause::FieldConflict(id_type) => write!(f, "field_conflict:{id_type}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    NoMatch,
    UniqueMatch(RecordId),
    AmbiguousMatch {
        candidates: Vec<RecordId>,
        cause: AmbiguityCause,
    },
}

/// Classifies normalized identifier sets against one index snapshot.
///
/// Ambiguity is never resolved by vote: any record reachable through more
/// than one distinct text ref is reported as ambiguous.
#[derive(Debug, Clone, Copy)]
pub struct MatchClassifier<'a> {
    index: &'a ReferenceIndex,
}

impl<'a> MatchClassifier<'a> {
    pub fn new(index: &'a ReferenceIndex) -> Self {
        Self { index }
    }

    pub fn classify(&self, ids: &IdentifierSet) -> MatchOutcome {
        let hits = self.index.hits(ids);
        let candidates = hits
            .iter()
            .flat_map(|(_, found)| found.iter().copied())
            .collect::<BTreeSet<_>>();

        match candidates.len() {
            0 => MatchOutcome::NoMatch,
            1 => MatchOutcome::UniqueMatch(candidates.into_iter().next().unwrap_or_default()),
            _ => {
                let cause = match hits.iter().find(|(_, found)| found.len() > 1) {
                    Some((id_type, _)) => AmbiguityCause::DuplicateInStore(*id_type),
                    None => AmbiguityCause::CrossIdentifier(
                        hits.iter().map(|(id_type, _)| *id_type).collect(),
                    ),
                };
                let candidates = candidates.into_iter().collect::<Vec<_>>();
                warn!(ids = %ids, %cause, ?candidates, "ambiguous text ref match");
                MatchOutcome::AmbiguousMatch { candidates, cause }
            }
        }
    }
}

/// Union-find over row positions.
#[derive(Debug, Clone)]
struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let a = self.find(a);
        let b = self.find(b);
        if a == b {
            return;
        }
        match self.rank[a].cmp(&self.rank[b]) {
            std::cmp::Ordering::Less => self.parent[a] = b,
            std::cmp::Ordering::Greater => self.parent[b] = a,
            std::cmp::Ordering::Equal => {
                self.parent[b] = a;
                self.rank[a] = self.rank[a].saturating_add(1);
            }
        }
    }
}

/// Groups identifier sets connected through any shared value.
///
/// Returned groups list positions in ascending order, and groups are ordered
/// by their first position, so the result depends only on the input order.
pub fn connected_groups(sets: &[IdentifierSet]) -> Vec<Vec<usize>> {
    let mut dsu = DisjointSet::new(sets.len());
    let mut first_seen = HashMap::<(IdType, &str), usize>::new();
    for (position, ids) in sets.iter().enumerate() {
        for (id_type, value) in ids.iter() {
            match first_seen.get(&(id_type, value)) {
                Some(first) => dsu.union(*first, position),
                None => {
                    first_seen.insert((id_type, value), position);
                }
            }
        }
    }

    let mut by_root = HashMap::<usize, usize>::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for position in 0..sets.len() {
        let root = dsu.find(position);
        match by_root.get(&root) {
            Some(slot) => groups[*slot].push(position),
            None => {
                by_root.insert(root, groups.len());
                groups.push(vec![position]);
            }
        }
    }
    groups
}

/// The first identifier type on which members of a group disagree, if any.
pub fn group_conflict(members: &[&IdentifierSet]) -> Option<IdType> {
    IdType::PRIORITY.into_iter().find(|id_type| {
        let values = members
            .iter()
            .filter_map(|ids| ids.get(*id_type))
            .collect::<BTreeSet<_>>();
        values.len() > 1
    })
}

/// The identifier type that links members of a group, for reporting.
pub fn shared_type(members: &[&IdentifierSet]) -> IdType {
    IdType::PRIORITY
        .into_iter()
        .find(|id_type| {
            let mut seen = BTreeSet::new();
            members
                .iter()
                .filter_map(|ids| ids.get(*id_type))
                .any(|value| !seen.insert(value))
        })
        .unwrap_or(IdType::Pmid)
}
