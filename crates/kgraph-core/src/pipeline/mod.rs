mod clusterer;
mod diff;
pub(crate) mod merge;
mod normalizer;
mod relation;
mod run;
mod validator;

pub use clusterer::{rewrite_references, Cluster, ClusterOutcome, EntityClusterer};
pub use diff::{
    Conflict, ConflictKind, DiffEntry, DiffExtractor, DiffStatus, EvidenceAppend, TripleDiff,
};
pub use merge::{dedup_evidence, MergeService, MergeStats};
pub use normalizer::{EntityNormalizer, Resolution, ResolutionMethod};
pub use relation::{RelationMethod, RelationNormalizer, RelationResolution};
pub use run::{ImportPipeline, RunContext, RunOutput, RunReport};
pub use validator::{rejection_counts, TripleValidator, ValidationVerdict, VerdictReason};
