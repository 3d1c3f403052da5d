use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::SchemaMode;
use crate::schema::Schema;
use crate::triple::{CandidateTriple, EvidenceRecord};

/// Outcome of validating one triple. Everything but `Ok` is a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictReason {
    Ok,
    MissingField,
    UnknownEntityType,
    UnknownRelation,
    TypeMismatch,
    BusinessRuleViolation,
    EvidenceTooShort,
}

impl VerdictReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::MissingField => "missing_field",
            Self::UnknownEntityType => "unknown_entity_type",
            Self::UnknownRelation => "unknown_relation",
            Self::TypeMismatch => "type_mismatch",
            Self::BusinessRuleViolation => "business_rule_violation",
            Self::EvidenceTooShort => "evidence_too_short",
        }
    }

    #[must_use]
    pub fn is_rejection(&self) -> bool {
        !matches!(self, Self::Ok)
    }
}

impl std::fmt::Display for VerdictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    /// Human-readable form of the triple, available even when it never
    /// reached normalization.
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<CandidateTriple>,
    pub accepted: bool,
    pub reason: VerdictReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ValidationVerdict {
    #[must_use]
    pub fn accept(candidate: CandidateTriple) -> Self {
        Self {
            label: candidate.to_string(),
            candidate: Some(candidate),
            accepted: true,
            reason: VerdictReason::Ok,
            detail: None,
        }
    }

    #[must_use]
    pub fn reject(candidate: CandidateTriple, reason: VerdictReason, detail: impl Into<String>) -> Self {
        Self {
            label: candidate.to_string(),
            candidate: Some(candidate),
            accepted: false,
            reason,
            detail: Some(detail.into()),
        }
    }

    /// Rejection of a triple that failed before a candidate could be built.
    #[must_use]
    pub fn reject_unresolved(label: String, reason: VerdictReason, detail: impl Into<String>) -> Self {
        Self {
            label,
            candidate: None,
            accepted: false,
            reason,
            detail: Some(detail.into()),
        }
    }
}

/// Pure check of a normalized triple against the schema. The first failing
/// check decides the reason.
pub struct TripleValidator<'a> {
    schema: &'a Schema,
    mode: SchemaMode,
    min_evidence_words: usize,
}

impl<'a> TripleValidator<'a> {
    #[must_use]
    pub fn new(schema: &'a Schema, mode: SchemaMode, min_evidence_words: usize) -> Self {
        Self {
            schema,
            mode,
            min_evidence_words,
        }
    }

    #[must_use]
    pub fn validate(&self, candidate: CandidateTriple) -> ValidationVerdict {
        let Some(relation) = candidate.relation else {
            let detail = format!("'{}' is not a known relation", candidate.relation_text);
            return ValidationVerdict::reject(candidate, VerdictReason::UnknownRelation, detail);
        };
        let (subject, object) = (&candidate.subject, &candidate.object);

        if self.mode.checks_types()
            && !self
                .schema
                .is_allowed(relation, subject.entity_type, object.entity_type)
        {
            let detail = format!(
                "'{}' does not allow {} -> {}",
                relation, subject.entity_type, object.entity_type
            );
            return ValidationVerdict::reject(candidate, VerdictReason::TypeMismatch, detail);
        }

        let rule = self.schema.business_rule(relation);
        let holds = if self.mode.checks_types() {
            rule.holds(subject, object)
        } else {
            rule.endpoints_hold(subject, object)
        };
        if !holds {
            let detail = rule.describe();
            return ValidationVerdict::reject(candidate, VerdictReason::BusinessRuleViolation, detail);
        }

        if let Some(detail) = self.evidence_problem(&candidate.evidence) {
            return ValidationVerdict::reject(candidate, VerdictReason::EvidenceTooShort, detail);
        }

        ValidationVerdict::accept(candidate)
    }

    fn evidence_problem(&self, evidence: &[EvidenceRecord]) -> Option<String> {
        if evidence.is_empty() {
            return Some("no evidence".into());
        }
        if evidence.iter().all(|e| e.inferred) {
            return None;
        }
        let longest = evidence.iter().map(EvidenceRecord::word_count).max().unwrap_or(0);
        (longest < self.min_evidence_words).then(|| {
            format!(
                "longest snippet has {longest} words, at least {} required",
                self.min_evidence_words
            )
        })
    }

    /// Validates a batch, returning the accepted candidates plus a verdict
    /// for every input.
    pub fn validate_all<I>(&self, candidates: I) -> (Vec<CandidateTriple>, Vec<ValidationVerdict>)
    where
        I: IntoIterator<Item = CandidateTriple>,
    {
        let mut accepted = Vec::new();
        let mut verdicts = Vec::new();

        for candidate in candidates {
            let verdict = self.validate(candidate);
            if verdict.accepted {
                if let Some(candidate) = &verdict.candidate {
                    accepted.push(candidate.clone());
                }
            } else {
                tracing::debug!(
                    "Rejected {}: {} ({})",
                    verdict.label,
                    verdict.reason,
                    verdict.detail.as_deref().unwrap_or("")
                );
            }
            verdicts.push(verdict);
        }

        tracing::info!(
            "Validated {} triples: {} accepted, {} rejected",
            verdicts.len(),
            accepted.len(),
            verdicts.len() - accepted.len()
        );

        (accepted, verdicts)
    }
}

/// Rejection counts keyed by reason.
#[must_use]
pub fn rejection_counts(verdicts: &[ValidationVerdict]) -> BTreeMap<VerdictReason, usize> {
    let mut counts = BTreeMap::new();
    for verdict in verdicts.iter().filter(|v| v.reason.is_rejection()) {
        *counts.entry(verdict.reason).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{derive_entity_id, EntityRef};
    use crate::schema::{EntityType, RelationType};
    use chrono::Utc;

    fn entity(name: &str, entity_type: EntityType) -> EntityRef {
        EntityRef {
            id: derive_entity_id(name, entity_type),
            name: name.into(),
            entity_type,
        }
    }

    fn evidence(snippet: &str, inferred: bool) -> EvidenceRecord {
        EvidenceRecord {
            timestamp: Utc::now(),
            source_document_path: "doc.md".into(),
            text_snippet: snippet.into(),
            section_heading_path: Vec::new(),
            inferred,
        }
    }

    fn candidate(
        subject: EntityRef,
        relation: Option<RelationType>,
        object: EntityRef,
        evidence: Vec<EvidenceRecord>,
    ) -> CandidateTriple {
        CandidateTriple {
            subject,
            relation,
            relation_text: relation.map_or_else(|| "frobnicates".into(), |r| r.to_string()),
            object,
            evidence,
            confidence: 1.0,
        }
    }

    fn strict(schema: &Schema) -> TripleValidator<'_> {
        TripleValidator::new(schema, SchemaMode::Strict, 3)
    }

    #[test]
    fn test_uses_pillar_is_type_mismatch() {
        let schema = Schema::builtin();
        let verdict = strict(&schema).validate(candidate(
            entity("Amazon EC2", EntityType::Service),
            Some(RelationType::Uses),
            entity("Reliability", EntityType::Pillar),
            vec![evidence("EC2 runs in many zones", false)],
        ));

        assert!(!verdict.accepted);
        assert_eq!(verdict.reason, VerdictReason::TypeMismatch);
    }

    #[test]
    fn test_recommended_by_accepted() {
        let schema = Schema::builtin();
        let verdict = strict(&schema).validate(candidate(
            entity("Enable MFA", EntityType::BestPractice),
            Some(RelationType::RecommendedBy),
            entity("Security", EntityType::Pillar),
            vec![evidence("Use MFA everywhere", false)],
        ));

        assert!(verdict.accepted);
        assert_eq!(verdict.reason, VerdictReason::Ok);
    }

    #[test]
    fn test_first_failing_check_wins() {
        let schema = Schema::builtin();
        let validator = strict(&schema);

        let unknown = validator.validate(candidate(
            entity("A", EntityType::Service),
            None,
            entity("B", EntityType::Pillar),
            Vec::new(),
        ));
        assert_eq!(unknown.reason, VerdictReason::UnknownRelation);

        let mismatch = validator.validate(candidate(
            entity("A", EntityType::Service),
            Some(RelationType::RecommendedBy),
            entity("B", EntityType::Pillar),
            Vec::new(),
        ));
        assert_eq!(mismatch.reason, VerdictReason::TypeMismatch);
    }

    #[test]
    fn test_self_dependency_violates_business_rule() {
        let schema = Schema::builtin();
        let vpc = entity("Amazon VPC", EntityType::Service);

        for mode in [SchemaMode::Strict, SchemaMode::Legacy] {
            let verdict = TripleValidator::new(&schema, mode, 3).validate(candidate(
                vpc.clone(),
                Some(RelationType::DependsOn),
                vpc.clone(),
                vec![evidence("the VPC depends on itself", false)],
            ));
            assert_eq!(verdict.reason, VerdictReason::BusinessRuleViolation);
            assert!(verdict.detail.unwrap().contains("subject != object"));
        }
    }

    #[test]
    fn test_legacy_mode_skips_type_checks() {
        let schema = Schema::builtin();
        let verdict = TripleValidator::new(&schema, SchemaMode::Legacy, 3).validate(candidate(
            entity("Amazon EC2", EntityType::Service),
            Some(RelationType::Uses),
            entity("Reliability", EntityType::Pillar),
            vec![evidence("EC2 runs in many zones", false)],
        ));

        assert!(verdict.accepted);
    }

    #[test]
    fn test_evidence_rules() {
        let schema = Schema::builtin();
        let validator = strict(&schema);
        let check = |evidence| {
            validator
                .validate(candidate(
                    entity("EC2", EntityType::Service),
                    Some(RelationType::Uses),
                    entity("EBS Volume", EntityType::Component),
                    evidence,
                ))
                .reason
        };

        assert_eq!(check(Vec::new()), VerdictReason::EvidenceTooShort);
        assert_eq!(check(vec![evidence("uses EBS", false)]), VerdictReason::EvidenceTooShort);
        assert_eq!(check(vec![evidence("uses", true)]), VerdictReason::Ok);
        assert_eq!(
            check(vec![evidence("uses", true), evidence("EC2 uses EBS", false)]),
            VerdictReason::Ok
        );
        assert_eq!(
            check(vec![evidence("uses", true), evidence("uses EBS", false)]),
            VerdictReason::EvidenceTooShort
        );
    }

    #[test]
    fn test_validate_all_counts() {
        let schema = Schema::builtin();
        let good = candidate(
            entity("Enable MFA", EntityType::BestPractice),
            Some(RelationType::RecommendedBy),
            entity("Security", EntityType::Pillar),
            vec![evidence("Use MFA everywhere", false)],
        );
        let bad = candidate(
            entity("Amazon EC2", EntityType::Service),
            Some(RelationType::Uses),
            entity("Reliability", EntityType::Pillar),
            vec![evidence("EC2 runs in many zones", false)],
        );

        let (accepted, verdicts) = strict(&schema).validate_all(vec![good, bad.clone(), bad]);

        assert_eq!(accepted.len(), 1);
        assert_eq!(verdicts.len(), 3);
        assert_eq!(
            rejection_counts(&verdicts),
            BTreeMap::from([(VerdictReason::TypeMismatch, 2)])
        );
    }
}
