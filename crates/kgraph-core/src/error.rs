use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("Unknown relation: {0}")]
    UnknownRelation(String),

    #[error("Invalid schema definition: {0}")]
    SchemaDefinition(String),

    #[error("Entity id {id} already belongs to '{existing}', refusing to reassign it to '{requested}'")]
    IdentityConflict {
        id: Uuid,
        existing: String,
        requested: String,
    },

    #[error("Entity not found: {0}")]
    EntityNotFound(Uuid),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Invalid stored row: {0}")]
    InvalidRow(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
