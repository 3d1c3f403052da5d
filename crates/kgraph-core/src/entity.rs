use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::EntityType;

const ENTITY_NAMESPACE: Uuid = Uuid::from_u128(0x5f1c_8a2e_94d3_4b7a_a0e6_3c2d_71b9_0e44);

/// Lower-cases and collapses internal whitespace. Used for every name and
/// alias comparison.
#[must_use]
pub fn fold_surface(raw: &str) -> String {
    raw.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic id for a canonical name of a given type, so re-runs mint the
/// same identity.
#[must_use]
pub fn derive_entity_id(canonical_name: &str, entity_type: EntityType) -> Uuid {
    let key = format!("{}:{}", entity_type.as_str(), fold_surface(canonical_name));
    Uuid::new_v5(&ENTITY_NAMESPACE, key.as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityOrigin {
    /// Part of the static alias table.
    Seeded,
    /// Created by the normalizer during a run.
    Minted,
}

impl EntityOrigin {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seeded => "seeded",
            Self::Minted => "minted",
        }
    }
}

impl std::str::FromStr for EntityOrigin {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "seeded" => Ok(Self::Seeded),
            "minted" => Ok(Self::Minted),
            _ => Err(crate::Error::InvalidRow(format!("unknown entity origin '{s}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub id: Uuid,
    pub canonical_name: String,
    pub entity_type: EntityType,
    #[serde(default)]
    pub aliases: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Set when the clusterer merged this entity into another one. The entity
    /// itself is kept so older references still resolve.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_to: Option<Uuid>,
    pub origin: EntityOrigin,
    pub created_seq: u64,
    pub created_at: DateTime<Utc>,
}

impl CanonicalEntity {
    #[must_use]
    pub fn new(canonical_name: String, entity_type: EntityType, origin: EntityOrigin) -> Self {
        Self {
            id: derive_entity_id(&canonical_name, entity_type),
            canonical_name,
            entity_type,
            aliases: BTreeSet::new(),
            description: None,
            redirect_to: None,
            origin,
            created_seq: 0,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases.extend(aliases.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn is_redirect(&self) -> bool {
        self.redirect_to.is_some()
    }

    #[must_use]
    pub fn to_ref(&self) -> EntityRef {
        EntityRef {
            id: self.id,
            name: self.canonical_name.clone(),
            entity_type: self.entity_type,
        }
    }
}

/// The part of a canonical entity a triple carries around.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: Uuid,
    pub name: String,
    pub entity_type: EntityType,
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.name)
    }
}
