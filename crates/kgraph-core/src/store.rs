use std::collections::{BTreeMap, BTreeSet, HashMap};

use uuid::Uuid;

use crate::pipeline::merge::{absorb, dedup_evidence};
use crate::registry::CanonicalRegistry;
use crate::triple::{Triple, TripleKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Merged,
}

/// In-memory working set of triples keyed by equivalence, with a
/// (subject, object) pair index for conflict lookups.
#[derive(Debug, Clone, Default)]
pub struct TripleStore {
    triples: BTreeMap<TripleKey, Triple>,
    pairs: HashMap<(Uuid, Uuid), BTreeSet<TripleKey>>,
}

impl TripleStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_triples<I>(triples: I) -> Self
    where
        I: IntoIterator<Item = Triple>,
    {
        let mut store = Self::new();
        for triple in triples {
            store.insert(triple);
        }
        store
    }

    pub fn insert(&mut self, mut triple: Triple) -> InsertOutcome {
        let key = triple.key();
        if let Some(existing) = self.triples.get_mut(&key) {
            absorb(existing, triple);
            return InsertOutcome::Merged;
        }

        triple.evidence = dedup_evidence(std::mem::take(&mut triple.evidence));
        self.pairs.entry(key.pair()).or_default().insert(key);
        self.triples.insert(key, triple);
        InsertOutcome::Inserted
    }

    #[must_use]
    pub fn get(&self, key: &TripleKey) -> Option<&Triple> {
        self.triples.get(key)
    }

    #[must_use]
    pub fn contains(&self, key: &TripleKey) -> bool {
        self.triples.contains_key(key)
    }

    /// Every triple from `subject` to `object`, whatever the relation.
    pub fn between(&self, subject: Uuid, object: Uuid) -> impl Iterator<Item = &Triple> {
        self.pairs
            .get(&(subject, object))
            .into_iter()
            .flatten()
            .filter_map(|key| self.triples.get(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Triple> {
        self.triples.values()
    }

    pub fn len(&self) -> usize {
        self.triples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }

    /// Points every reference at the live entity behind it, merging triples
    /// that become equivalent. Returns how many triples changed key.
    pub fn rewrite_references(&mut self, registry: &CanonicalRegistry) -> usize {
        let mut rewritten = 0;
        let mut merged = 0;
        let old = std::mem::take(&mut self.triples);
        self.pairs.clear();

        for (key, mut triple) in old {
            if let Some(subject) = registry.entity_ref(triple.subject.id) {
                triple.subject = subject;
            }
            if let Some(object) = registry.entity_ref(triple.object.id) {
                triple.object = object;
            }
            if triple.key() != key {
                rewritten += 1;
            }
            if self.insert(triple) == InsertOutcome::Merged {
                merged += 1;
            }
        }

        if merged > 0 {
            tracing::debug!("Rewrite merged {} triples into existing keys", merged);
        }
        rewritten
    }
}
