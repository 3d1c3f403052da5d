use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::EntityRef;
use crate::schema::RelationType;

/// A candidate statement as produced by the extraction collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTriple {
    pub subject_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_type_hint: Option<String>,
    pub relation_text: String,
    pub object_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_type_hint: Option<String>,
    #[serde(default)]
    pub evidence_snippet: String,
    #[serde(default)]
    pub source_path: String,
    #[serde(default)]
    pub section_path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub inferred: bool,
    /// Extractor confidence; defaults to 1.0 when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl RawTriple {
    #[must_use]
    pub fn new(
        subject_text: impl Into<String>,
        relation_text: impl Into<String>,
        object_text: impl Into<String>,
    ) -> Self {
        Self {
            subject_text: subject_text.into(),
            subject_type_hint: None,
            relation_text: relation_text.into(),
            object_text: object_text.into(),
            object_type_hint: None,
            evidence_snippet: String::new(),
            source_path: String::new(),
            section_path: Vec::new(),
            timestamp: None,
            inferred: false,
            confidence: None,
        }
    }

    #[must_use]
    pub fn with_types(mut self, subject: impl Into<String>, object: impl Into<String>) -> Self {
        self.subject_type_hint = Some(subject.into());
        self.object_type_hint = Some(object.into());
        self
    }

    #[must_use]
    pub fn with_evidence(mut self, snippet: impl Into<String>, source_path: impl Into<String>) -> Self {
        self.evidence_snippet = snippet.into();
        self.source_path = source_path.into();
        self
    }

    #[must_use]
    pub fn with_section(mut self, section_path: Vec<String>) -> Self {
        self.section_path = section_path;
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    #[must_use]
    pub fn inferred(mut self) -> Self {
        self.inferred = true;
        self
    }

    #[must_use]
    pub fn evidence(&self) -> EvidenceRecord {
        EvidenceRecord {
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            source_document_path: self.source_path.clone(),
            text_snippet: self.evidence_snippet.trim().to_string(),
            section_heading_path: self.section_path.clone(),
            inferred: self.inferred,
        }
    }
}

/// Provenance for a triple. Field order defines the canonical ordering of
/// evidence lists.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub timestamp: DateTime<Utc>,
    pub source_document_path: String,
    pub text_snippet: String,
    #[serde(default)]
    pub section_heading_path: Vec<String>,
    #[serde(default)]
    pub inferred: bool,
}

impl EvidenceRecord {
    #[must_use]
    pub fn word_count(&self) -> usize {
        self.text_snippet.split_whitespace().count()
    }

    /// Deduplication key.
    #[must_use]
    pub fn dedup_key(&self) -> (&str, &str) {
        (&self.source_document_path, &self.text_snippet)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TripleKey {
    pub subject: Uuid,
    pub relation: RelationType,
    pub object: Uuid,
}

impl TripleKey {
    #[must_use]
    pub fn pair(&self) -> (Uuid, Uuid) {
        (self.subject, self.object)
    }
}

/// A normalized statement that has not been validated yet. The relation is
/// absent when the relation normalizer did not recognize the phrase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateTriple {
    pub subject: EntityRef,
    pub relation: Option<RelationType>,
    pub relation_text: String,
    pub object: EntityRef,
    pub evidence: Vec<EvidenceRecord>,
    pub confidence: f64,
}

impl CandidateTriple {
    #[must_use]
    pub fn into_triple(self) -> Option<Triple> {
        let relation = self.relation?;
        Some(Triple {
            subject: self.subject,
            relation,
            object: self.object,
            evidence: self.evidence,
            confidence: self.confidence,
        })
    }
}

impl std::fmt::Display for CandidateTriple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let relation = self.relation.map_or(self.relation_text.as_str(), |r| r.as_str());
        write!(f, "{} --[{}]--> {}", self.subject, relation, self.object)
    }
}

/// A validated statement. Equivalence is defined by [`TripleKey`] only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Triple {
    pub subject: EntityRef,
    pub relation: RelationType,
    pub object: EntityRef,
    pub evidence: Vec<EvidenceRecord>,
    pub confidence: f64,
}

impl Triple {
    #[must_use]
    pub fn key(&self) -> TripleKey {
        TripleKey {
            subject: self.subject.id,
            relation: self.relation,
            object: self.object.id,
        }
    }

    #[must_use]
    pub fn is_equivalent(&self, other: &Self) -> bool {
        self.key() == other.key()
    }

    pub fn inferred_count(&self) -> usize {
        self.evidence.iter().filter(|e| e.inferred).count()
    }

    /// Backed by both inferred and extracted evidence.
    #[must_use]
    pub fn has_mixed_inference(&self) -> bool {
        let inferred = self.inferred_count();
        inferred > 0 && inferred < self.evidence.len()
    }
}

impl std::fmt::Display for Triple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} --[{}]--> {}", self.subject, self.relation, self.object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::EntityType;
    use chrono::TimeZone;

    fn entity(name: &str, entity_type: EntityType) -> EntityRef {
        EntityRef {
            id: crate::entity::derive_entity_id(name, entity_type),
            name: name.into(),
            entity_type,
        }
    }

    #[test]
    fn test_raw_triple_deserializes_with_defaults() {
        let raw: RawTriple = serde_json::from_str(
            r#"{"subject_text": "EC2", "relation_text": "uses", "object_text": "EBS"}"#,
        )
        .unwrap();

        assert_eq!(raw.subject_text, "EC2");
        assert!(raw.subject_type_hint.is_none());
        assert!(!raw.inferred);
        assert!(raw.section_path.is_empty());
    }

    #[test]
    fn test_evidence_from_raw() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let raw = RawTriple::new("a", "uses", "b")
            .with_evidence("  Use MFA everywhere ", "docs/security.md")
            .with_section(vec!["Security".into(), "Identity".into()])
            .with_timestamp(ts);

        let evidence = raw.evidence();
        assert_eq!(evidence.text_snippet, "Use MFA everywhere");
        assert_eq!(evidence.word_count(), 3);
        assert_eq!(evidence.dedup_key(), ("docs/security.md", "Use MFA everywhere"));
        assert_eq!(evidence.timestamp, ts);
    }

    #[test]
    fn test_equivalence_ignores_evidence_and_confidence() {
        let rds = entity("Amazon RDS", EntityType::Service);
        let vpc = entity("Amazon VPC", EntityType::Service);
        let a = Triple {
            subject: rds.clone(),
            relation: RelationType::DependsOn,
            object: vpc.clone(),
            evidence: Vec::new(),
            confidence: 0.2,
        };
        let b = Triple {
            confidence: 0.9,
            ..a.clone()
        };
        let c = Triple {
            subject: vpc,
            object: rds,
            ..a.clone()
        };

        assert!(a.is_equivalent(&b));
        assert!(!a.is_equivalent(&c));
        assert_eq!(a.to_string(), "Service:Amazon RDS --[depends_on]--> Service:Amazon VPC");
    }

    #[test]
    fn test_candidate_without_relation_is_not_a_triple() {
        let candidate = CandidateTriple {
            subject: entity("A", EntityType::Service),
            relation: None,
            relation_text: "frobnicates".into(),
            object: entity("B", EntityType::Component),
            evidence: Vec::new(),
            confidence: 1.0,
        };

        assert_eq!(candidate.to_string(), "Service:A --[frobnicates]--> Component:B");
        assert!(candidate.into_triple().is_none());
    }
}
