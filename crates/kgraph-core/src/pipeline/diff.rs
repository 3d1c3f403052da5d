use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use crate::registry::CanonicalRegistry;
use crate::store::TripleStore;
use crate::triple::{EvidenceRecord, Triple, TripleKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Same subject and object, different relation.
    RelationMismatch,
    /// Same relation stored from object to subject.
    ReversedDirection,
}

impl ConflictKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RelationMismatch => "relation_mismatch",
            Self::ReversedDirection => "reversed_direction",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffStatus {
    Identical,
    New,
    Conflicting(ConflictKind),
}

/// Classification of one new triple against stored state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub status: DiffStatus,
    pub triple: Triple,
    /// Stored triples the classification was made against.
    pub stored: Vec<Triple>,
    /// Evidence not yet present on the stored triple; empty unless identical.
    pub new_evidence: Vec<EvidenceRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceAppend {
    pub stored: Triple,
    pub new_evidence: Vec<EvidenceRecord>,
    pub confidence: f64,
}

/// Both versions of a conflict, held for manual review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub new: Triple,
    pub stored: Vec<Triple>,
}

impl std::fmt::Display for Conflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}) vs ", self.new, self.kind.as_str())?;
        let stored: Vec<String> = self.stored.iter().map(ToString::to_string).collect();
        f.write_str(&stored.join(", "))
    }
}

/// What the storage collaborator has to apply. Stored triples missing from
/// the new set are never listed and never deleted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TripleDiff {
    pub to_insert: Vec<Triple>,
    pub to_update: Vec<EvidenceAppend>,
    pub flagged: Vec<Conflict>,
    /// Identical triples with nothing new to append.
    pub unchanged: Vec<TripleKey>,
}

impl TripleDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_insert.is_empty() && self.to_update.is_empty() && self.flagged.is_empty()
    }

    pub fn push(&mut self, entry: DiffEntry) {
        match entry.status {
            DiffStatus::New => self.to_insert.push(entry.triple),
            DiffStatus::Identical => {
                let key = entry.triple.key();
                match entry.stored.into_iter().next() {
                    Some(stored) if !entry.new_evidence.is_empty() => {
                        let confidence = stored.confidence.max(entry.triple.confidence);
                        self.to_update.push(EvidenceAppend {
                            stored,
                            new_evidence: entry.new_evidence,
                            confidence,
                        });
                    }
                    _ => self.unchanged.push(key),
                }
            }
            DiffStatus::Conflicting(kind) => self.flagged.push(Conflict {
                kind,
                new: entry.triple,
                stored: entry.stored,
            }),
        }
    }
}

/// Stored triple set with every reference resolved through the registry's
/// redirects, so stored triples that now name the same entities are merged
/// before anything is compared against them.
pub struct DiffExtractor {
    stored: TripleStore,
}

impl DiffExtractor {
    #[must_use]
    pub fn new(stored: &TripleStore, registry: &CanonicalRegistry) -> Self {
        let mut stored = stored.clone();
        let rewritten = stored.rewrite_references(registry);
        if rewritten > 0 {
            tracing::debug!("{} stored triples follow redirects", rewritten);
        }
        Self { stored }
    }

    #[must_use]
    pub fn classify(&self, triple: &Triple) -> DiffEntry {
        let key = triple.key();

        if let Some(stored) = self.stored.get(&key) {
            let known: BTreeSet<(&str, &str)> = stored.evidence.iter().map(EvidenceRecord::dedup_key).collect();
            let new_evidence = triple
                .evidence
                .iter()
                .filter(|e| !known.contains(&e.dedup_key()))
                .cloned()
                .collect();
            return Self::entry(DiffStatus::Identical, triple, vec![stored.clone()], new_evidence);
        }

        let same_pair: Vec<Triple> = self.stored.between(key.subject, key.object).cloned().collect();
        if !same_pair.is_empty() {
            return Self::entry(
                DiffStatus::Conflicting(ConflictKind::RelationMismatch),
                triple,
                same_pair,
                Vec::new(),
            );
        }

        let reversed = TripleKey {
            subject: key.object,
            relation: key.relation,
            object: key.subject,
        };
        if let Some(stored) = self.stored.get(&reversed) {
            return Self::entry(
                DiffStatus::Conflicting(ConflictKind::ReversedDirection),
                triple,
                vec![stored.clone()],
                Vec::new(),
            );
        }

        Self::entry(DiffStatus::New, triple, Vec::new(), Vec::new())
    }

    fn entry(status: DiffStatus, triple: &Triple, stored: Vec<Triple>, new_evidence: Vec<EvidenceRecord>) -> DiffEntry {
        DiffEntry {
            status,
            triple: triple.clone(),
            stored,
            new_evidence,
        }
    }

    /// Classifies every new triple. Conflicts are flagged, never resolved.
    pub fn extract<'t, I>(&self, triples: I) -> (TripleDiff, Vec<DiffEntry>)
    where
        I: IntoIterator<Item = &'t Triple>,
    {
        let mut diff = TripleDiff::default();
        let mut entries = Vec::new();

        for triple in triples {
            let entry = self.classify(triple);
            if let DiffStatus::Conflicting(kind) = entry.status {
                tracing::warn!("Flagged {} for review: {}", triple, kind.as_str());
            }
            entries.push(entry.clone());
            diff.push(entry);
        }

        tracing::info!(
            "Diff: {} new, {} updated, {} conflicts, {} unchanged",
            diff.to_insert.len(),
            diff.to_update.len(),
            diff.flagged.len(),
            diff.unchanged.len()
        );

        (diff, entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntityType, RelationType};
    use chrono::{TimeZone, Utc};

    fn evidence(snippet: &str) -> EvidenceRecord {
        EvidenceRecord {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
            source_document_path: "networking.md".into(),
            text_snippet: snippet.into(),
            section_heading_path: vec!["Networking".into()],
            inferred: false,
        }
    }

    fn triple(
        registry: &mut CanonicalRegistry,
        subject: (&str, EntityType),
        relation: RelationType,
        object: (&str, EntityType),
        snippets: &[&str],
    ) -> Triple {
        Triple {
            subject: registry.mint(subject.0, subject.1).unwrap(),
            relation,
            object: registry.mint(object.0, object.1).unwrap(),
            evidence: snippets.iter().map(|s| evidence(s)).collect(),
            confidence: 0.9,
        }
    }

    const RDS: (&str, EntityType) = ("Amazon RDS", EntityType::Service);
    const VPC: (&str, EntityType) = ("Amazon VPC", EntityType::Service);

    #[test]
    fn test_identical_with_unchanged_evidence() {
        let mut registry = CanonicalRegistry::new();
        let stored = triple(&mut registry, RDS, RelationType::DependsOn, VPC, &["RDS instances live in a VPC"]);
        let store = TripleStore::from_triples(vec![stored.clone()]);

        let entry = DiffExtractor::new(&store, &registry).classify(&stored);

        assert_eq!(entry.status, DiffStatus::Identical);
        assert!(entry.new_evidence.is_empty());

        let (diff, _) = DiffExtractor::new(&store, &registry).extract([&stored]);
        assert!(diff.is_empty());
        assert_eq!(diff.unchanged, vec![stored.key()]);
    }

    #[test]
    fn test_identical_with_new_evidence_is_update() {
        let mut registry = CanonicalRegistry::new();
        let stored = triple(&mut registry, RDS, RelationType::DependsOn, VPC, &["RDS instances live in a VPC"]);
        let store = TripleStore::from_triples(vec![stored.clone()]);
        let fresh = triple(
            &mut registry,
            RDS,
            RelationType::DependsOn,
            VPC,
            &["RDS instances live in a VPC", "RDS needs subnets from the VPC"],
        );

        let (diff, entries) = DiffExtractor::new(&store, &registry).extract([&fresh]);

        assert_eq!(entries[0].new_evidence.len(), 1);
        assert_eq!(diff.to_update.len(), 1);
        assert_eq!(diff.to_update[0].stored, stored);
        assert_eq!(diff.to_update[0].new_evidence[0].text_snippet, "RDS needs subnets from the VPC");
    }

    #[test]
    fn test_different_relation_is_conflict() {
        let mut registry = CanonicalRegistry::new();
        let a = ("Service A", EntityType::Service);
        let b = ("Component B", EntityType::Component);
        let stored = triple(&mut registry, a, RelationType::Uses, b, &["A uses B daily"]);
        let store = TripleStore::from_triples(vec![stored.clone()]);
        let fresh = triple(&mut registry, a, RelationType::Implements, b, &["A implements B fully"]);

        let (diff, entries) = DiffExtractor::new(&store, &registry).extract([&fresh]);

        assert_eq!(entries[0].status, DiffStatus::Conflicting(ConflictKind::RelationMismatch));
        assert_eq!(diff.flagged.len(), 1);
        assert_eq!(diff.flagged[0].stored, vec![stored]);
        assert!(diff.to_insert.is_empty());
    }

    #[test]
    fn test_reversed_direction_is_conflict() {
        let mut registry = CanonicalRegistry::new();
        let stored = triple(&mut registry, RDS, RelationType::DependsOn, VPC, &["RDS depends on the VPC"]);
        let store = TripleStore::from_triples(vec![stored]);
        let fresh = triple(&mut registry, VPC, RelationType::DependsOn, RDS, &["the VPC depends on RDS"]);

        let entry = DiffExtractor::new(&store, &registry).classify(&fresh);

        assert_eq!(entry.status, DiffStatus::Conflicting(ConflictKind::ReversedDirection));
    }

    #[test]
    fn test_unrelated_is_new_and_stored_is_kept() {
        let mut registry = CanonicalRegistry::new();
        let stored = triple(&mut registry, RDS, RelationType::DependsOn, VPC, &["RDS depends on the VPC"]);
        let store = TripleStore::from_triples(vec![stored]);
        let fresh = triple(
            &mut registry,
            ("AWS Lambda", EntityType::Service),
            RelationType::DependsOn,
            VPC,
            &["Lambda can attach to a VPC"],
        );

        let (diff, _) = DiffExtractor::new(&store, &registry).extract([&fresh]);

        assert_eq!(diff.to_insert, vec![fresh]);
        assert!(diff.to_update.is_empty());
        assert!(diff.flagged.is_empty());
    }

    #[test]
    fn test_stored_references_follow_redirects() {
        let mut registry = CanonicalRegistry::new();
        let stored = triple(
            &mut registry,
            ("Aurora", EntityType::Service),
            RelationType::DependsOn,
            VPC,
            &["Aurora clusters live in a VPC"],
        );
        let store = TripleStore::from_triples(vec![stored.clone()]);
        let keep = registry.mint("Amazon Aurora", EntityType::Service).unwrap();
        registry.redirect(stored.subject.id, keep.id).unwrap();

        let fresh = triple(
            &mut registry,
            ("Amazon Aurora", EntityType::Service),
            RelationType::DependsOn,
            VPC,
            &["Aurora clusters live in a VPC"],
        );
        let entry = DiffExtractor::new(&store, &registry).classify(&fresh);

        assert_eq!(entry.status, DiffStatus::Identical);
        assert!(entry.new_evidence.is_empty());
        assert_eq!(entry.stored.len(), 1);
        assert_eq!(entry.stored[0].subject, keep);
        assert_eq!(entry.stored[0].evidence, stored.evidence);
    }

    #[test]
    fn test_redirected_duplicates_are_merged_before_comparison() {
        let mut registry = CanonicalRegistry::new();
        let short = triple(
            &mut registry,
            ("Aurora", EntityType::Service),
            RelationType::DependsOn,
            VPC,
            &["Aurora clusters live in a VPC"],
        );
        let long = triple(
            &mut registry,
            ("Amazon Aurora", EntityType::Service),
            RelationType::DependsOn,
            VPC,
            &["Amazon Aurora needs private subnets"],
        );
        let store = TripleStore::from_triples(vec![short.clone(), long.clone()]);
        registry.redirect(short.subject.id, long.subject.id).unwrap();

        let fresh = Triple {
            evidence: vec![evidence("Aurora clusters live in a VPC"), evidence("Amazon Aurora needs private subnets")],
            ..long.clone()
        };
        let (diff, entries) = DiffExtractor::new(&store, &registry).extract([&fresh]);

        assert_eq!(entries[0].status, DiffStatus::Identical);
        assert_eq!(entries[0].stored.len(), 1);
        assert_eq!(entries[0].stored[0].evidence.len(), 2);
        assert!(diff.is_empty());
        assert_eq!(diff.unchanged, vec![long.key()]);
    }

    #[test]
    fn test_redirect_can_surface_a_reversed_conflict() {
        let mut registry = CanonicalRegistry::new();
        let stored = triple(
            &mut registry,
            VPC,
            RelationType::DependsOn,
            ("RDS", EntityType::Service),
            &["The VPC depends on RDS placement"],
        );
        let store = TripleStore::from_triples(vec![stored.clone()]);
        let rds = registry.mint(RDS.0, RDS.1).unwrap();
        registry.redirect(stored.object.id, rds.id).unwrap();

        let fresh = triple(&mut registry, RDS, RelationType::DependsOn, VPC, &["RDS depends on the VPC"]);
        let entry = DiffExtractor::new(&store, &registry).classify(&fresh);

        assert_eq!(entry.status, DiffStatus::Conflicting(ConflictKind::ReversedDirection));
        assert_eq!(entry.stored[0].object, rds);
    }
}
