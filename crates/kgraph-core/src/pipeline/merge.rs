use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use crate::triple::{EvidenceRecord, Triple, TripleKey};

/// Unions evidence, keeping one record per (source, snippet). When two
/// records share a key the smaller one under the record ordering wins, and the
/// result is sorted, so the output is independent of input order.
pub fn dedup_evidence<I>(records: I) -> Vec<EvidenceRecord>
where
    I: IntoIterator<Item = EvidenceRecord>,
{
    let mut by_key: BTreeMap<(String, String), EvidenceRecord> = BTreeMap::new();

    for record in records {
        let key = (
            record.source_document_path.clone(),
            record.text_snippet.clone(),
        );
        match by_key.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                if record < *slot.get() {
                    slot.insert(record);
                }
            }
        }
    }

    let mut merged: Vec<EvidenceRecord> = by_key.into_values().collect();
    merged.sort();
    merged
}

/// Folds an equivalent triple into `target`.
pub fn absorb(target: &mut Triple, other: Triple) {
    debug_assert_eq!(target.key(), other.key());

    let evidence = std::mem::take(&mut target.evidence);
    target.evidence = dedup_evidence(evidence.into_iter().chain(other.evidence));
    target.confidence = target.confidence.max(other.confidence);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub input: usize,
    pub output: usize,
    /// Merged triples whose evidence is partly inferred.
    pub mixed_inference: usize,
}

impl MergeStats {
    pub fn collapsed(&self) -> usize {
        self.input - self.output
    }
}

/// Collapses equivalent triples into one per (subject, relation, object).
///
/// Confidence is the maximum over the group and evidence lists are unioned,
/// so the operation is associative and commutative.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeService;

impl MergeService {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    pub fn merge<I>(&self, triples: I) -> (Vec<Triple>, MergeStats)
    where
        I: IntoIterator<Item = Triple>,
    {
        let mut groups: BTreeMap<TripleKey, Triple> = BTreeMap::new();
        let mut input = 0;

        for triple in triples {
            input += 1;
            match groups.entry(triple.key()) {
                Entry::Vacant(slot) => {
                    let mut triple = triple;
                    triple.evidence = dedup_evidence(std::mem::take(&mut triple.evidence));
                    slot.insert(triple);
                }
                Entry::Occupied(mut slot) => absorb(slot.get_mut(), triple),
            }
        }

        let merged: Vec<Triple> = groups.into_values().collect();
        let stats = MergeStats {
            input,
            output: merged.len(),
            mixed_inference: merged.iter().filter(|t| t.has_mixed_inference()).count(),
        };

        tracing::info!(
            "Merged {} triples into {} unique triples",
            stats.input,
            stats.output
        );
        for triple in merged.iter().filter(|t| t.has_mixed_inference()) {
            tracing::warn!(
                "{} mixes inferred and extracted evidence ({} of {} inferred)",
                triple,
                triple.inferred_count(),
                triple.evidence.len()
            );
        }

        (merged, stats)
    }

    /// Merges already-merged sub-batches.
    pub fn merge_batches<I>(&self, batches: I) -> Vec<Triple>
    where
        I: IntoIterator<Item = Vec<Triple>>,
    {
        self.merge(batches.into_iter().flatten()).0
    }
}
