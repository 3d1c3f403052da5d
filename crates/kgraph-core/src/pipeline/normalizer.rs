use std::collections::BTreeSet;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{derive_entity_id, EntityRef};
use crate::registry::CanonicalRegistry;
use crate::schema::EntityType;
use crate::similarity::SimilarityOracle;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    Alias,
    CanonicalName,
    Similarity,
    Minted,
}

impl ResolutionMethod {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alias => "alias",
            Self::CanonicalName => "canonical_name",
            Self::Similarity => "similarity",
            Self::Minted => "minted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// The mention after whitespace collapse.
    pub surface: String,
    pub entity: EntityRef,
    pub method: ResolutionMethod,
    /// 1.0 for rule-based matches and new entities, the oracle score otherwise.
    pub score: f64,
    pub oracle_failures: usize,
}

impl Resolution {
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.method == ResolutionMethod::Minted
    }
}

/// Rule-based rewrites tried before any lookup: vendor prefixes, a trailing
/// "service", and resource nouns after service names ("S3 bucket").
#[derive(Debug, Clone)]
struct SurfaceRules {
    vendor_prefix: Regex,
    generic_suffix: Regex,
    resource_suffix: Regex,
}

impl SurfaceRules {
    fn new() -> Result<Self> {
        Ok(Self {
            vendor_prefix: Regex::new(r"(?i)^(aws|amazon)\s+")?,
            generic_suffix: Regex::new(r"(?i)\s+service$")?,
            resource_suffix: Regex::new(r"(?i)\s+(bucket|instance|volume|gateway|endpoint)s?$")?,
        })
    }

    fn variants(&self, mention: &str, entity_type: Option<EntityType>) -> Vec<String> {
        let base = collapse(mention);
        let mut out = vec![base.clone()];

        let unprefixed = self.vendor_prefix.replace(&base, "").into_owned();
        let mut stripped = self.generic_suffix.replace(&unprefixed, "").into_owned();
        if matches!(entity_type, None | Some(EntityType::Service)) {
            stripped = self.resource_suffix.replace(&stripped, "").into_owned();
        }

        for variant in [unprefixed, stripped] {
            if !variant.is_empty() && !out.contains(&variant) {
                out.push(variant);
            }
        }
        out
    }
}

fn collapse(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Per-mention resolution of raw entity text to a canonical entity.
pub struct EntityNormalizer<'a> {
    oracle: &'a dyn SimilarityOracle,
    threshold: f64,
    rules: SurfaceRules,
}

impl<'a> EntityNormalizer<'a> {
    pub fn new(oracle: &'a dyn SimilarityOracle, threshold: f64) -> Result<Self> {
        Ok(Self {
            oracle,
            threshold,
            rules: SurfaceRules::new()?,
        })
    }

    /// Resolves a type hint against the closed type set. Without a hint the
    /// mention is typed only if the registry knows it under exactly one type.
    pub fn resolve_type(
        &self,
        registry: &CanonicalRegistry,
        mention: &str,
        hint: Option<&str>,
    ) -> Result<EntityType> {
        if let Some(hint) = hint.filter(|h| !h.trim().is_empty()) {
            return hint.parse();
        }

        let mut types = BTreeSet::new();
        for variant in self.rules.variants(mention, None) {
            types.extend(registry.alias_types(&variant));
            types.extend(
                EntityType::ALL
                    .into_iter()
                    .filter(|&t| registry.find_by_name(&variant, t).is_some()),
            );
        }

        let mut iter = types.iter();
        match (iter.next(), iter.next()) {
            (Some(&only), None) => Ok(only),
            (None, _) => Err(Error::UnknownEntityType(format!("no type hint for '{}'", mention.trim()))),
            _ => Err(Error::UnknownEntityType(format!(
                "no type hint for '{}', which is known as {}",
                mention.trim(),
                types.iter().map(EntityType::as_str).collect::<Vec<_>>().join(" and ")
            ))),
        }
    }

    /// Alias lookup, then canonical name, then the oracle, then a new entity.
    /// Writes the outcome to the registry.
    pub fn normalize(
        &self,
        registry: &mut CanonicalRegistry,
        mention: &str,
        entity_type: EntityType,
    ) -> Result<Resolution> {
        let resolution = self.lookup(registry, mention, entity_type)?;
        Self::commit(registry, &resolution)?;
        Ok(resolution)
    }

    /// Resolves a mention without touching the registry. A `Minted`
    /// resolution carries the identity the entity will get once committed.
    pub fn lookup(
        &self,
        registry: &CanonicalRegistry,
        mention: &str,
        entity_type: EntityType,
    ) -> Result<Resolution> {
        let surface = collapse(mention);
        if surface.is_empty() {
            return Err(Error::MissingField("entity mention"));
        }
        let variants = self.rules.variants(&surface, Some(entity_type));

        if let Some(entity) = variants
            .iter()
            .find_map(|v| registry.lookup_alias_of_type(v, entity_type))
        {
            return Ok(Self::matched(surface, entity.to_ref(), ResolutionMethod::Alias, 1.0, 0));
        }

        if let Some(entity) = variants
            .iter()
            .find_map(|v| registry.find_by_name(v, entity_type))
        {
            return Ok(Self::matched(surface, entity.to_ref(), ResolutionMethod::CanonicalName, 1.0, 0));
        }

        let (best, failures) = self.best_match(registry, &surface, entity_type);
        if let Some((id, score)) = best.filter(|&(_, score)| score >= self.threshold) {
            let entity = registry.entity_ref(id).ok_or(Error::EntityNotFound(id))?;
            tracing::debug!(
                "'{}' matched {} by similarity ({:.2})",
                surface,
                entity,
                score
            );
            return Ok(Self::matched(surface, entity, ResolutionMethod::Similarity, score, failures));
        }

        let entity = EntityRef {
            id: derive_entity_id(&surface, entity_type),
            name: surface.clone(),
            entity_type,
        };
        Ok(Self::matched(surface, entity, ResolutionMethod::Minted, 1.0, failures))
    }

    /// Applies a resolution: a similarity match becomes an alias and a new
    /// entity is minted. Returns whether the registry changed.
    pub fn commit(registry: &mut CanonicalRegistry, resolution: &Resolution) -> Result<bool> {
        match resolution.method {
            ResolutionMethod::Similarity => registry.register(&resolution.surface, resolution.entity.id),
            ResolutionMethod::Minted => {
                let fresh = registry.get(resolution.entity.id).is_none();
                registry.mint(&resolution.surface, resolution.entity.entity_type)?;
                Ok(fresh)
            }
            ResolutionMethod::Alias | ResolutionMethod::CanonicalName => Ok(false),
        }
    }

    /// Highest-scoring live entity of the type; ties keep the earliest created.
    fn best_match(
        &self,
        registry: &CanonicalRegistry,
        surface: &str,
        entity_type: EntityType,
    ) -> (Option<(Uuid, f64)>, usize) {
        let mut best: Option<(Uuid, f64)> = None;
        let mut failures = 0;

        for candidate in registry.all_of_type(entity_type) {
            match self.oracle.similarity(surface, &candidate.canonical_name) {
                Ok(score) => {
                    if !matches!(best, Some((_, top)) if top >= score) {
                        best = Some((candidate.id, score));
                    }
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        "Similarity check '{}' vs '{}' failed, treating as no match: {}",
                        surface,
                        candidate.canonical_name,
                        e
                    );
                }
            }
        }

        (best, failures)
    }

    fn matched(
        surface: String,
        entity: EntityRef,
        method: ResolutionMethod,
        score: f64,
        oracle_failures: usize,
    ) -> Resolution {
        Resolution {
            surface,
            entity,
            method,
            score,
            oracle_failures,
        }
    }
}
