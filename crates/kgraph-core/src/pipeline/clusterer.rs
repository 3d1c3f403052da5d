use std::cmp::Reverse;
use std::collections::BTreeMap;

use petgraph::unionfind::UnionFind;
use serde::{Deserialize, Serialize};

use crate::entity::{CanonicalEntity, EntityRef};
use crate::registry::CanonicalRegistry;
use crate::schema::EntityType;
use crate::similarity::SimilarityOracle;
use crate::triple::CandidateTriple;
use crate::Result;

/// A group of near-duplicate entities and the one they collapse into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub representative: EntityRef,
    /// Entities redirected to the representative.
    pub merged: Vec<EntityRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterOutcome {
    pub clusters: Vec<Cluster>,
    pub comparisons: usize,
    pub oracle_failures: usize,
}

impl ClusterOutcome {
    #[must_use]
    pub fn redirected(&self) -> usize {
        self.clusters.iter().map(|c| c.merged.len()).sum()
    }
}

/// Whole-registry pass that merges near-duplicate entities the per-mention
/// normalizer missed.
///
/// Comparison is pairwise within each entity type, so cost grows with the
/// square of the per-type entity count. Corpora with low hundreds of entities
/// per type are the intended scale.
pub struct EntityClusterer<'a> {
    oracle: &'a dyn SimilarityOracle,
    threshold: f64,
}

impl<'a> EntityClusterer<'a> {
    #[must_use]
    pub fn new(oracle: &'a dyn SimilarityOracle, threshold: f64) -> Self {
        Self { oracle, threshold }
    }

    /// Computes clusters without touching the registry.
    #[must_use]
    pub fn plan(&self, registry: &CanonicalRegistry) -> ClusterOutcome {
        let mut outcome = ClusterOutcome::default();

        for entity_type in EntityType::ALL {
            let entities = registry.all_of_type(entity_type);
            if entities.len() < 2 {
                continue;
            }

            let mut sets = UnionFind::<usize>::new(entities.len());
            for i in 0..entities.len() {
                for j in (i + 1)..entities.len() {
                    outcome.comparisons += 1;
                    match self
                        .oracle
                        .similarity(&entities[i].canonical_name, &entities[j].canonical_name)
                    {
                        Ok(score) if score >= self.threshold => {
                            sets.union(i, j);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            outcome.oracle_failures += 1;
                            tracing::warn!(
                                "Similarity check '{}' vs '{}' failed, treating as distinct: {}",
                                entities[i].canonical_name,
                                entities[j].canonical_name,
                                e
                            );
                        }
                    }
                }
            }

            let mut groups: BTreeMap<usize, Vec<&CanonicalEntity>> = BTreeMap::new();
            for (index, root) in sets.into_labeling().into_iter().enumerate() {
                groups.entry(root).or_default().push(entities[index]);
            }

            outcome.clusters.extend(
                groups
                    .into_values()
                    .filter(|members| members.len() > 1)
                    .filter_map(|members| Self::collapse(&members)),
            );
        }

        outcome
    }

    /// Plans clusters, then redirects every non-representative member.
    pub fn cluster(&self, registry: &mut CanonicalRegistry) -> Result<ClusterOutcome> {
        let outcome = self.plan(registry);

        for cluster in &outcome.clusters {
            for member in &cluster.merged {
                registry.redirect(member.id, cluster.representative.id)?;
            }
            tracing::debug!(
                "Clustered {} entities into {}",
                cluster.merged.len() + 1,
                cluster.representative
            );
        }

        tracing::info!(
            "Clustering made {} comparisons and merged {} entities into {} clusters",
            outcome.comparisons,
            outcome.redirected(),
            outcome.clusters.len()
        );

        Ok(outcome)
    }

    /// Longest canonical name wins; ties go to the earliest created.
    fn collapse(members: &[&CanonicalEntity]) -> Option<Cluster> {
        let representative = members.iter().copied().max_by_key(|e| {
            (
                e.canonical_name.chars().count(),
                Reverse(e.created_seq),
                Reverse(e.id),
            )
        })?;

        let mut merged: Vec<&CanonicalEntity> = members
            .iter()
            .copied()
            .filter(|e| e.id != representative.id)
            .collect();
        merged.sort_by_key(|e| e.created_seq);

        Some(Cluster {
            representative: representative.to_ref(),
            merged: merged.into_iter().map(CanonicalEntity::to_ref).collect(),
        })
    }
}

/// Points candidate endpoints at live entities. Returns how many candidates
/// had a reference rewritten.
pub fn rewrite_references(registry: &CanonicalRegistry, candidates: &mut [CandidateTriple]) -> usize {
    let mut rewritten = 0;
    for candidate in candidates {
        let mut changed = false;
        for endpoint in [&mut candidate.subject, &mut candidate.object] {
            if let Some(live) = registry.entity_ref(endpoint.id) {
                if live != *endpoint {
                    *endpoint = live;
                    changed = true;
                }
            }
        }
        if changed {
            rewritten += 1;
        }
    }
    rewritten
}
