pub mod config;
pub mod entity;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod schema;
pub mod similarity;
pub mod storage;
pub mod store;
pub mod triple;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{PipelineConfig, SchemaMode};
pub use entity::{derive_entity_id, fold_surface, CanonicalEntity, EntityOrigin, EntityRef};
pub use error::{Error, Result};
pub use pipeline::{
    Conflict, ConflictKind, DiffStatus, ImportPipeline, RunContext, RunOutput, RunReport,
    TripleDiff, ValidationVerdict, VerdictReason,
};
pub use registry::{CanonicalRegistry, RegistrySnapshot};
pub use schema::{EntityType, RelationType, Schema, SchemaDefinition};
pub use similarity::{Metric, OracleError, SimilarityOracle, StringSimilarity, TimeoutOracle};
pub use storage::{CommitStats, SnapshotStore, StoredState, Storage};
pub use store::TripleStore;
pub use triple::{CandidateTriple, EvidenceRecord, RawTriple, Triple, TripleKey};
