use std::collections::HashMap;

use crate::schema::RelationType;
use crate::similarity::SimilarityOracle;

const PHRASES: &[(&str, RelationType)] = &[
    ("utilizes", RelationType::Uses),
    ("employs", RelationType::Uses),
    ("leverages", RelationType::Uses),
    ("makes_use_of", RelationType::Uses),
    ("use", RelationType::Uses),
    ("used_with", RelationType::Uses),
    ("follows", RelationType::Implements),
    ("adopts", RelationType::Implements),
    ("applies", RelationType::Implements),
    ("apply", RelationType::Implements),
    ("implement", RelationType::Implements),
    ("mitigates", RelationType::Addresses),
    ("resolves", RelationType::Addresses),
    ("solves", RelationType::Addresses),
    ("handles", RelationType::Addresses),
    ("prevents", RelationType::Addresses),
    ("recommended", RelationType::RecommendedBy),
    ("suggested_by", RelationType::RecommendedBy),
    ("suggested", RelationType::RecommendedBy),
    ("aligned_with", RelationType::RecommendedBy),
    ("impacts", RelationType::Affects),
    ("influences", RelationType::Affects),
    ("improves", RelationType::Affects),
    ("enhances", RelationType::Affects),
    ("reduces", RelationType::Affects),
    ("reduce", RelationType::Affects),
    ("increases", RelationType::Affects),
    ("depends", RelationType::DependsOn),
    ("requires", RelationType::DependsOn),
    ("relies_on", RelationType::DependsOn),
    ("rely_on", RelationType::DependsOn),
    ("needs", RelationType::DependsOn),
    ("built_on", RelationType::DependsOn),
    ("breaks", RelationType::Violates),
    ("contradicts", RelationType::Violates),
    ("conflicts_with", RelationType::Violates),
    ("example", RelationType::ExampleOf),
    ("instance_of", RelationType::ExampleOf),
    ("demonstrates", RelationType::ExampleOf),
    ("kind_of", RelationType::ExampleOf),
    ("type_of", RelationType::ExampleOf),
];

const AUXILIARIES: &[&str] = &["is", "are", "was", "were", "be", "can", "should", "must", "may"];
const ARTICLES: &[&str] = &["a", "an", "the"];
const ADVERBS: &[&str] = &[
    "also",
    "always",
    "automatically",
    "closely",
    "commonly",
    "directly",
    "explicitly",
    "frequently",
    "fully",
    "generally",
    "greatly",
    "heavily",
    "highly",
    "implicitly",
    "indirectly",
    "largely",
    "mainly",
    "often",
    "only",
    "partially",
    "primarily",
    "really",
    "significantly",
    "strongly",
    "typically",
    "usually",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationMethod {
    Canonical,
    Phrase,
    Similarity,
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelationResolution {
    /// `None` when the phrase is unrecognized. A new relation is never invented.
    pub relation: Option<RelationType>,
    pub method: Option<RelationMethod>,
    pub score: f64,
    pub oracle_failures: usize,
}

impl RelationResolution {
    fn found(relation: RelationType, method: RelationMethod, score: f64, oracle_failures: usize) -> Self {
        Self {
            relation: Some(relation),
            method: Some(method),
            score,
            oracle_failures,
        }
    }

    fn unrecognized(oracle_failures: usize) -> Self {
        Self {
            relation: None,
            method: None,
            score: 0.0,
            oracle_failures,
        }
    }
}

/// Maps free-text verb phrases onto the closed relation set.
pub struct RelationNormalizer<'a> {
    phrases: HashMap<&'static str, RelationType>,
    oracle: &'a dyn SimilarityOracle,
    threshold: f64,
}

impl<'a> RelationNormalizer<'a> {
    #[must_use]
    pub fn new(oracle: &'a dyn SimilarityOracle, threshold: f64) -> Self {
        Self {
            phrases: PHRASES.iter().copied().collect(),
            oracle,
            threshold,
        }
    }

    /// "Depends heavily on" and "depends_on" both become `depends_on`.
    #[must_use]
    pub fn canonicalize(raw: &str) -> String {
        raw.to_lowercase()
            .split(|c: char| c.is_whitespace() || c == '_' || c == '-')
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("_")
    }

    fn reduce(phrase: &str) -> String {
        let tokens: Vec<&str> = phrase
            .split('_')
            .filter(|t| !ADVERBS.contains(t) && !ARTICLES.contains(t))
            .collect();
        let start = tokens.iter().take_while(|t| AUXILIARIES.contains(t)).count();
        tokens[start..].join("_")
    }

    fn lookup(&self, phrase: &str) -> Option<(RelationType, RelationMethod)> {
        if let Ok(relation) = phrase.parse::<RelationType>() {
            return Some((relation, RelationMethod::Canonical));
        }
        self.phrases
            .get(phrase)
            .map(|&relation| (relation, RelationMethod::Phrase))
    }

    pub fn normalize(&self, raw: &str) -> RelationResolution {
        let phrase = Self::canonicalize(raw);
        if phrase.is_empty() {
            return RelationResolution::unrecognized(0);
        }

        let reduced = Self::reduce(&phrase);
        for candidate in [&phrase, &reduced] {
            if let Some((relation, method)) = self.lookup(candidate) {
                return RelationResolution::found(relation, method, 1.0, 0);
            }
        }

        let mut failures = 0;
        let mut best: Option<(RelationType, f64)> = None;
        let spoken = reduced.replace('_', " ");
        for relation in RelationType::ALL {
            match self.oracle.similarity(&spoken, &relation.as_str().replace('_', " ")) {
                Ok(score) => {
                    if !matches!(best, Some((_, top)) if top >= score) {
                        best = Some((relation, score));
                    }
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!("Relation similarity for '{}' failed: {}", raw, e);
                }
            }
        }
        if let Some((relation, score)) = best.filter(|&(_, s)| s >= self.threshold) {
            return RelationResolution::found(relation, RelationMethod::Similarity, score, failures);
        }

        // "uses_component", "is_depends_on_service"
        let tokens: Vec<&str> = reduced.split('_').collect();
        let partial = RelationType::ALL.into_iter().find(|relation| {
            let name: Vec<&str> = relation.as_str().split('_').collect();
            tokens.windows(name.len()).any(|w| w == name.as_slice())
        });
        if let Some(relation) = partial {
            return RelationResolution::found(relation, RelationMethod::Partial, 1.0, failures);
        }

        tracing::debug!("Could not normalize relation '{}'", raw);
        RelationResolution::unrecognized(failures)
    }
}
