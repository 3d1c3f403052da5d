use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::clusterer::{rewrite_references, EntityClusterer};
use super::diff::{DiffEntry, DiffExtractor, TripleDiff};
use super::merge::MergeService;
use super::normalizer::{EntityNormalizer, Resolution, ResolutionMethod};
use super::relation::RelationNormalizer;
use super::validator::{rejection_counts, TripleValidator, ValidationVerdict, VerdictReason};
use crate::config::PipelineConfig;
use crate::registry::CanonicalRegistry;
use crate::schema::Schema;
use crate::similarity::{SimilarityOracle, StringSimilarity, TimeoutOracle};
use crate::store::TripleStore;
use crate::triple::{CandidateTriple, RawTriple, Triple};
use crate::{Error, Result};

/// Everything a run reads and mutates, passed explicitly to every stage.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub schema: Schema,
    pub registry: CanonicalRegistry,
    pub config: PipelineConfig,
}

impl RunContext {
    #[must_use]
    pub fn new(schema: Schema, registry: CanonicalRegistry, config: PipelineConfig) -> Self {
        Self {
            schema,
            registry,
            config,
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(Schema::builtin(), CanonicalRegistry::seeded(), PipelineConfig::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub raw_triples: usize,
    pub accepted: usize,
    pub rejected: BTreeMap<VerdictReason, usize>,
    pub entities_minted: usize,
    pub aliases_learned: usize,
    pub clusters: usize,
    pub entities_redirected: usize,
    pub references_rewritten: usize,
    pub oracle_failures: usize,
    pub merged_triples: usize,
    pub duplicates_collapsed: usize,
    pub mixed_inference: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub conflicts: Vec<String>,
}

impl RunReport {
    pub fn rejected_total(&self) -> usize {
        self.rejected.values().sum()
    }
}

const RULE: &str = "============================================================";

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = String::new();
        writeln!(out, "{RULE}")?;
        writeln!(out, "Import Report")?;
        writeln!(out, "{RULE}")?;
        writeln!(out, "Raw triples: {}", self.raw_triples)?;
        writeln!(out, "Accepted: {}", self.accepted)?;
        writeln!(out, "Rejected: {}", self.rejected_total())?;
        for (reason, count) in &self.rejected {
            writeln!(out, "  {reason}: {count}")?;
        }
        writeln!(out)?;
        writeln!(out, "Entities minted: {}", self.entities_minted)?;
        writeln!(out, "Aliases learned: {}", self.aliases_learned)?;
        writeln!(
            out,
            "Clusters merged: {} ({} entities redirected, {} references rewritten)",
            self.clusters, self.entities_redirected, self.references_rewritten
        )?;
        if self.oracle_failures > 0 {
            writeln!(out, "Oracle failures: {}", self.oracle_failures)?;
        }
        writeln!(
            out,
            "Merged triples: {} ({} duplicates collapsed)",
            self.merged_triples, self.duplicates_collapsed
        )?;
        if self.mixed_inference > 0 {
            writeln!(out, "Mixed inference: {}", self.mixed_inference)?;
        }
        writeln!(out)?;
        writeln!(out, "New triples: {}", self.inserted)?;
        writeln!(out, "Updated triples: {}", self.updated)?;
        writeln!(out, "Unchanged: {}", self.unchanged)?;
        writeln!(out, "Conflicts: {}", self.conflicts.len())?;
        for (i, conflict) in self.conflicts.iter().enumerate() {
            writeln!(out, "  {}. {conflict}", i + 1)?;
        }
        write!(out, "{RULE}")?;
        f.write_str(&out)
    }
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub diff: TripleDiff,
    pub report: RunReport,
    /// One verdict per raw triple, in input order.
    pub verdicts: Vec<ValidationVerdict>,
    pub merged: Vec<Triple>,
    pub entries: Vec<DiffEntry>,
}

/// Normalization, clustering, validation, merge and diff over one batch.
pub struct ImportPipeline {
    oracle: Box<dyn SimilarityOracle>,
    merge: MergeService,
}

impl ImportPipeline {
    #[must_use]
    pub fn new<O: SimilarityOracle + 'static>(oracle: O) -> Self {
        Self {
            oracle: Box::new(oracle),
            merge: MergeService::new(),
        }
    }

    /// Wraps `oracle` so that every call gives up after `timeout`.
    #[must_use]
    pub fn with_timeout<O: SimilarityOracle + 'static>(oracle: O, timeout: Duration) -> Self {
        Self::new(TimeoutOracle::new(oracle, timeout))
    }

    /// Default string oracle under the configured timeout.
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::with_timeout(StringSimilarity::default(), config.oracle_timeout)
    }

    /// Runs one batch against a read-only snapshot of stored triples. Only
    /// `ctx.registry` is mutated; nothing is persisted.
    pub fn run(&self, ctx: &mut RunContext, raw: Vec<RawTriple>, stored: &TripleStore) -> Result<RunOutput> {
        ctx.config.validate()?;

        let mut report = RunReport {
            raw_triples: raw.len(),
            ..RunReport::default()
        };
        let mut slots: Vec<Option<ValidationVerdict>> = vec![None; raw.len()];
        let mut candidates: Vec<(usize, CandidateTriple)> = Vec::new();
        let validator = TripleValidator::new(&ctx.schema, ctx.config.schema_mode, ctx.config.min_evidence_words);

        {
            let entities = EntityNormalizer::new(self.oracle.as_ref(), ctx.config.similarity_threshold)?;
            let relations =
                RelationNormalizer::new(self.oracle.as_ref(), ctx.config.relation_similarity_threshold);

            for (index, raw) in raw.into_iter().enumerate() {
                let (candidate, resolutions) =
                    match Self::prepare(&entities, &relations, &ctx.registry, &raw, &mut report) {
                        Ok(prepared) => prepared,
                        Err(Rejection::Triple(reason, detail)) => {
                            tracing::debug!("Rejected {}: {} ({})", label(&raw), reason, detail);
                            slots[index] = Some(ValidationVerdict::reject_unresolved(label(&raw), reason, detail));
                            continue;
                        }
                        Err(Rejection::Fatal(e)) => return Err(e),
                    };

                let verdict = validator.validate(candidate);
                if !verdict.accepted {
                    tracing::debug!(
                        "Rejected {}: {} ({})",
                        verdict.label,
                        verdict.reason,
                        verdict.detail.as_deref().unwrap_or("")
                    );
                    slots[index] = Some(verdict);
                    continue;
                }

                for resolution in &resolutions {
                    if EntityNormalizer::commit(&mut ctx.registry, resolution)? {
                        record(&mut report, resolution);
                    }
                }
                if let Some(candidate) = verdict.candidate {
                    candidates.push((index, candidate));
                }
            }
        }
        tracing::info!(
            "Normalized {} of {} raw triples ({} entities minted, {} aliases learned)",
            candidates.len(),
            report.raw_triples,
            report.entities_minted,
            report.aliases_learned
        );

        if ctx.config.enable_clustering {
            let outcome = EntityClusterer::new(self.oracle.as_ref(), ctx.config.similarity_threshold)
                .cluster(&mut ctx.registry)?;
            report.clusters = outcome.clusters.len();
            report.entities_redirected = outcome.redirected();
            report.oracle_failures += outcome.oracle_failures;

            report.references_rewritten = candidates
                .iter_mut()
                .map(|(_, candidate)| rewrite_references(&ctx.registry, std::slice::from_mut(candidate)))
                .sum();
        }

        // Clustering can collapse both endpoints into one entity.
        let (indices, batch): (Vec<usize>, Vec<CandidateTriple>) = candidates.into_iter().unzip();
        let (accepted, verdicts) = validator.validate_all(batch);
        for (index, verdict) in indices.into_iter().zip(verdicts) {
            slots[index] = Some(verdict);
        }
        let verdicts: Vec<ValidationVerdict> = slots.into_iter().flatten().collect();
        report.accepted = accepted.len();
        report.rejected = rejection_counts(&verdicts);

        let (merged, stats) = self
            .merge
            .merge(accepted.into_iter().filter_map(CandidateTriple::into_triple));
        report.merged_triples = stats.output;
        report.duplicates_collapsed = stats.collapsed();
        report.mixed_inference = stats.mixed_inference;

        let (diff, entries) = DiffExtractor::new(stored, &ctx.registry).extract(&merged);
        report.inserted = diff.to_insert.len();
        report.updated = diff.to_update.len();
        report.unchanged = diff.unchanged.len();
        report.conflicts = diff.flagged.iter().map(ToString::to_string).collect();

        Ok(RunOutput {
            diff,
            report,
            verdicts,
            merged,
            entries,
        })
    }

    /// Builds a candidate and the registry writes it needs, or the reason the
    /// raw triple cannot become one. The registry is only read here.
    fn prepare(
        entities: &EntityNormalizer<'_>,
        relations: &RelationNormalizer<'_>,
        registry: &CanonicalRegistry,
        raw: &RawTriple,
        report: &mut RunReport,
    ) -> std::result::Result<(CandidateTriple, [Resolution; 2]), Rejection> {
        for (field, value) in [
            ("subject", &raw.subject_text),
            ("relation", &raw.relation_text),
            ("object", &raw.object_text),
        ] {
            if value.trim().is_empty() {
                return Err(Rejection::Triple(VerdictReason::MissingField, format!("{field} is empty")));
            }
        }

        let relation = relations.normalize(&raw.relation_text);
        report.oracle_failures += relation.oracle_failures;
        if relation.relation.is_none() {
            return Err(Rejection::Triple(
                VerdictReason::UnknownRelation,
                format!("'{}' is not a known relation", raw.relation_text.trim()),
            ));
        }

        let subject_type =
            entities.resolve_type(registry, &raw.subject_text, raw.subject_type_hint.as_deref())?;
        let object_type =
            entities.resolve_type(registry, &raw.object_text, raw.object_type_hint.as_deref())?;

        let subject = entities.lookup(registry, &raw.subject_text, subject_type)?;
        let object = entities.lookup(registry, &raw.object_text, object_type)?;
        report.oracle_failures += subject.oracle_failures + object.oracle_failures;

        let evidence = if raw.evidence_snippet.trim().is_empty() {
            Vec::new()
        } else {
            vec![raw.evidence()]
        };
        let confidence = raw.confidence.unwrap_or(1.0).clamp(0.0, 1.0) * subject.score.min(object.score);

        let candidate = CandidateTriple {
            subject: subject.entity.clone(),
            relation: relation.relation,
            relation_text: raw.relation_text.trim().to_string(),
            object: object.entity.clone(),
            evidence,
            confidence,
        };
        Ok((candidate, [subject, object]))
    }
}

/// Counts a registry write made on behalf of an accepted triple.
fn record(report: &mut RunReport, resolution: &Resolution) {
    match resolution.method {
        ResolutionMethod::Minted => report.entities_minted += 1,
        ResolutionMethod::Similarity => report.aliases_learned += 1,
        ResolutionMethod::Alias | ResolutionMethod::CanonicalName => {}
    }
}

/// Why a raw triple did not become a candidate.
enum Rejection {
    /// Recorded against the triple; the batch continues.
    Triple(VerdictReason, String),
    /// Aborts the run.
    Fatal(Error),
}

impl From<Error> for Rejection {
    fn from(error: Error) -> Self {
        let reason = match &error {
            Error::UnknownEntityType(_) => VerdictReason::UnknownEntityType,
            Error::UnknownRelation(_) => VerdictReason::UnknownRelation,
            Error::MissingField(_) => VerdictReason::MissingField,
            _ => return Self::Fatal(error),
        };
        Self::Triple(reason, error.to_string())
    }
}

fn label(raw: &RawTriple) -> String {
    format!(
        "{} --[{}]--> {}",
        raw.subject_text.trim(),
        raw.relation_text.trim(),
        raw.object_text.trim()
    )
}
