use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::entity::EntityRef;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Service,
    Component,
    Pattern,
    Pillar,
    BestPractice,
    Risk,
    Mitigation,
    Metric,
    Role,
}

impl EntityType {
    pub const ALL: [Self; 9] = [
        Self::Service,
        Self::Component,
        Self::Pattern,
        Self::Pillar,
        Self::BestPractice,
        Self::Risk,
        Self::Mitigation,
        Self::Metric,
        Self::Role,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Service => "Service",
            Self::Component => "Component",
            Self::Pattern => "Pattern",
            Self::Pillar => "Pillar",
            Self::BestPractice => "BestPractice",
            Self::Risk => "Risk",
            Self::Mitigation => "Mitigation",
            Self::Metric => "Metric",
            Self::Role => "Role",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts `BestPractice`, `best_practice`, `Best Practice` and similar spellings.
impl std::str::FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let folded: String = s
            .chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(char::to_lowercase)
            .collect();

        match folded.as_str() {
            "service" => Ok(Self::Service),
            "component" => Ok(Self::Component),
            "pattern" => Ok(Self::Pattern),
            "pillar" => Ok(Self::Pillar),
            "bestpractice" => Ok(Self::BestPractice),
            "risk" => Ok(Self::Risk),
            "mitigation" => Ok(Self::Mitigation),
            "metric" => Ok(Self::Metric),
            "role" => Ok(Self::Role),
            _ => Err(Error::UnknownEntityType(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    Uses,
    Implements,
    Addresses,
    RecommendedBy,
    Affects,
    DependsOn,
    Violates,
    ExampleOf,
}

impl RelationType {
    pub const ALL: [Self; 8] = [
        Self::Uses,
        Self::Implements,
        Self::Addresses,
        Self::RecommendedBy,
        Self::Affects,
        Self::DependsOn,
        Self::Violates,
        Self::ExampleOf,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uses => "uses",
            Self::Implements => "implements",
            Self::Addresses => "addresses",
            Self::RecommendedBy => "recommended_by",
            Self::Affects => "affects",
            Self::DependsOn => "depends_on",
            Self::Violates => "violates",
            Self::ExampleOf => "example_of",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for RelationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RelationType {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "uses" => Ok(Self::Uses),
            "implements" => Ok(Self::Implements),
            "addresses" => Ok(Self::Addresses),
            "recommended_by" => Ok(Self::RecommendedBy),
            "affects" => Ok(Self::Affects),
            "depends_on" => Ok(Self::DependsOn),
            "violates" => Ok(Self::Violates),
            "example_of" => Ok(Self::ExampleOf),
            _ => Err(Error::UnknownRelation(s.to_string())),
        }
    }
}

/// Type compatibility and endpoint constraints for one relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationRule {
    pub subject_types: Vec<EntityType>,
    pub object_types: Vec<EntityType>,
    /// Subject and object must be different entities.
    pub distinct_endpoints: bool,
}

impl RelationRule {
    #[must_use]
    pub fn allows(&self, subject: EntityType, object: EntityType) -> bool {
        self.subject_types.contains(&subject) && self.object_types.contains(&object)
    }

    #[must_use]
    pub fn pairs(&self) -> Vec<(EntityType, EntityType)> {
        self.subject_types
            .iter()
            .flat_map(|&s| self.object_types.iter().map(move |&o| (s, o)))
            .collect()
    }
}

/// Predicate over a concrete (subject, object) pair for a relation.
#[derive(Debug, Clone, Copy)]
pub struct BusinessRule<'a> {
    relation: RelationType,
    rule: &'a RelationRule,
}

impl BusinessRule<'_> {
    #[must_use]
    pub fn relation(&self) -> RelationType {
        self.relation
    }

    #[must_use]
    pub fn holds(&self, subject: &EntityRef, object: &EntityRef) -> bool {
        self.rule.allows(subject.entity_type, object.entity_type)
            && self.endpoints_hold(subject, object)
    }

    /// The identity part of the rule only; used when type checks are bypassed.
    #[must_use]
    pub fn endpoints_hold(&self, subject: &EntityRef, object: &EntityRef) -> bool {
        !self.rule.distinct_endpoints || subject.id != object.id
    }

    #[must_use]
    pub fn describe(&self) -> String {
        let subjects = join_types(&self.rule.subject_types);
        let objects = join_types(&self.rule.object_types);
        if self.rule.distinct_endpoints {
            format!(
                "'{}' requires subject in {{{subjects}}}, object in {{{objects}}}, subject != object",
                self.relation
            )
        } else {
            format!(
                "'{}' requires subject in {{{subjects}}}, object in {{{objects}}}",
                self.relation
            )
        }
    }
}

fn join_types(types: &[EntityType]) -> String {
    types
        .iter()
        .map(EntityType::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

const BUILTIN_RULES: [(RelationType, &[EntityType], &[EntityType], bool); 8] = [
    (
        RelationType::Uses,
        &[EntityType::Service, EntityType::Component],
        &[EntityType::Component],
        false,
    ),
    (
        RelationType::Implements,
        &[EntityType::Component, EntityType::Service],
        &[EntityType::Pattern],
        false,
    ),
    (
        RelationType::Addresses,
        &[EntityType::Mitigation, EntityType::BestPractice],
        &[EntityType::Risk],
        false,
    ),
    (
        RelationType::RecommendedBy,
        &[EntityType::BestPractice],
        &[EntityType::Pillar],
        false,
    ),
    (
        RelationType::Affects,
        &[
            EntityType::Service,
            EntityType::Component,
            EntityType::Pattern,
            EntityType::BestPractice,
        ],
        &[EntityType::Metric],
        false,
    ),
    (
        RelationType::DependsOn,
        &[EntityType::Service, EntityType::Component],
        &[EntityType::Service, EntityType::Component],
        true,
    ),
    (
        RelationType::Violates,
        &[EntityType::Service, EntityType::Component, EntityType::Pattern],
        &[EntityType::Pillar],
        false,
    ),
    (
        RelationType::ExampleOf,
        &[EntityType::Service, EntityType::Component, EntityType::Pattern],
        &[EntityType::Pattern],
        true,
    ),
];

/// Serialized form of a schema, supplied by an external config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub relations: BTreeMap<String, RelationDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDefinition {
    pub subject: Vec<String>,
    pub object: Vec<String>,
    #[serde(default)]
    pub distinct_endpoints: bool,
}

/// Closed-world catalog of entity types, relation types and their rules.
/// Read-only once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    rules: [RelationRule; 8],
}

impl Schema {
    #[must_use]
    pub fn builtin() -> Self {
        let rules = BUILTIN_RULES.map(|(_, subjects, objects, distinct)| RelationRule {
            subject_types: subjects.to_vec(),
            object_types: objects.to_vec(),
            distinct_endpoints: distinct,
        });
        Self { rules }
    }

    pub fn from_definition(definition: &SchemaDefinition) -> Result<Self> {
        let mut parsed: BTreeMap<RelationType, RelationRule> = BTreeMap::new();

        for (name, def) in &definition.relations {
            let relation: RelationType = name
                .parse()
                .map_err(|_| Error::SchemaDefinition(format!("unknown relation '{name}'")))?;

            let subject_types = parse_type_set(name, "subject", &def.subject)?;
            let object_types = parse_type_set(name, "object", &def.object)?;

            parsed.insert(
                relation,
                RelationRule {
                    subject_types,
                    object_types,
                    distinct_endpoints: def.distinct_endpoints,
                },
            );
        }

        let mut rules = Vec::with_capacity(RelationType::ALL.len());
        for relation in RelationType::ALL {
            let rule = parsed.remove(&relation).ok_or_else(|| {
                Error::SchemaDefinition(format!("relation '{relation}' has no rule"))
            })?;
            rules.push(rule);
        }

        let rules: [RelationRule; 8] = rules
            .try_into()
            .map_err(|_| Error::SchemaDefinition("relation table size mismatch".into()))?;

        Ok(Self { rules })
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let definition: SchemaDefinition = serde_json::from_str(json)
            .map_err(|e| Error::SchemaDefinition(format!("malformed schema document: {e}")))?;
        Self::from_definition(&definition)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let schema = Self::from_json_str(&text)?;
        tracing::info!("Loaded schema definition from {}", path.as_ref().display());
        Ok(schema)
    }

    #[must_use]
    pub fn definition(&self) -> SchemaDefinition {
        let relations = RelationType::ALL
            .iter()
            .map(|&relation| {
                let rule = self.rule(relation);
                (
                    relation.as_str().to_string(),
                    RelationDefinition {
                        subject: rule.subject_types.iter().map(ToString::to_string).collect(),
                        object: rule.object_types.iter().map(ToString::to_string).collect(),
                        distinct_endpoints: rule.distinct_endpoints,
                    },
                )
            })
            .collect();
        SchemaDefinition { relations }
    }

    #[must_use]
    pub fn rule(&self, relation: RelationType) -> &RelationRule {
        &self.rules[relation.index()]
    }

    #[must_use]
    pub fn allowed_pairs(&self, relation: RelationType) -> Vec<(EntityType, EntityType)> {
        self.rule(relation).pairs()
    }

    #[must_use]
    pub fn is_allowed(&self, relation: RelationType, subject: EntityType, object: EntityType) -> bool {
        self.rule(relation).allows(subject, object)
    }

    #[must_use]
    pub fn is_valid_type(&self, name: &str) -> bool {
        name.parse::<EntityType>().is_ok()
    }

    #[must_use]
    pub fn business_rule(&self, relation: RelationType) -> BusinessRule<'_> {
        BusinessRule {
            relation,
            rule: self.rule(relation),
        }
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::builtin()
    }
}

fn parse_type_set(relation: &str, side: &str, names: &[String]) -> Result<Vec<EntityType>> {
    if names.is_empty() {
        return Err(Error::SchemaDefinition(format!(
            "relation '{relation}' has an empty {side} type set"
        )));
    }

    let mut types = Vec::with_capacity(names.len());
    for name in names {
        let ty: EntityType = name.parse().map_err(|_| {
            Error::SchemaDefinition(format!(
                "relation '{relation}' names unknown {side} type '{name}'"
            ))
        })?;
        if !types.contains(&ty) {
            types.push(ty);
        }
    }
    Ok(types)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn entity(name: &str, entity_type: EntityType) -> EntityRef {
        EntityRef {
            id: Uuid::new_v4(),
            name: name.into(),
            entity_type,
        }
    }

    #[test]
    fn test_entity_type_parsing() {
        assert_eq!("BestPractice".parse::<EntityType>().unwrap(), EntityType::BestPractice);
        assert_eq!("best_practice".parse::<EntityType>().unwrap(), EntityType::BestPractice);
        assert_eq!("Best Practice".parse::<EntityType>().unwrap(), EntityType::BestPractice);
        assert_eq!("service".parse::<EntityType>().unwrap(), EntityType::Service);
        assert!(matches!(
            "Concept".parse::<EntityType>(),
            Err(Error::UnknownEntityType(_))
        ));
    }

    #[test]
    fn test_relation_parsing() {
        assert_eq!("depends_on".parse::<RelationType>().unwrap(), RelationType::DependsOn);
        assert_eq!(" Uses ".parse::<RelationType>().unwrap(), RelationType::Uses);
        assert!("RELATES_TO".parse::<RelationType>().is_err());
    }

    #[test]
    fn test_builtin_allowed_pairs() {
        let schema = Schema::builtin();

        assert_eq!(
            schema.allowed_pairs(RelationType::RecommendedBy),
            vec![(EntityType::BestPractice, EntityType::Pillar)]
        );
        assert_eq!(
            schema.allowed_pairs(RelationType::Uses),
            vec![
                (EntityType::Service, EntityType::Component),
                (EntityType::Component, EntityType::Component),
            ]
        );
        assert_eq!(schema.allowed_pairs(RelationType::DependsOn).len(), 4);
        assert!(!schema.is_allowed(RelationType::Uses, EntityType::Service, EntityType::Pillar));
        assert!(schema.is_allowed(RelationType::Affects, EntityType::BestPractice, EntityType::Metric));
    }

    #[test]
    fn test_builtin_rule_table() {
        use EntityType::{BestPractice, Component, Metric, Mitigation, Pattern, Pillar, Risk, Service};

        let expected: [(RelationType, &[EntityType], &[EntityType], bool); 8] = [
            (RelationType::Uses, &[Service, Component], &[Component], false),
            (RelationType::Implements, &[Component, Service], &[Pattern], false),
            (RelationType::Addresses, &[Mitigation, BestPractice], &[Risk], false),
            (RelationType::RecommendedBy, &[BestPractice], &[Pillar], false),
            (RelationType::Affects, &[Service, Component, Pattern, BestPractice], &[Metric], false),
            (RelationType::DependsOn, &[Service, Component], &[Service, Component], true),
            (RelationType::Violates, &[Service, Component, Pattern], &[Pillar], false),
            (RelationType::ExampleOf, &[Service, Component, Pattern], &[Pattern], true),
        ];

        let schema = Schema::builtin();
        for (relation, subjects, objects, distinct) in expected {
            let rule = schema.rule(relation);
            assert_eq!(rule.subject_types, subjects, "{relation} subjects");
            assert_eq!(rule.object_types, objects, "{relation} objects");
            assert_eq!(rule.distinct_endpoints, distinct, "{relation} endpoints");
            assert_eq!(schema.allowed_pairs(relation).len(), subjects.len() * objects.len());
        }
        assert!(RelationType::ALL.iter().all(|r| expected.iter().any(|e| e.0 == *r)));
    }

    #[test]
    fn test_is_valid_type() {
        let schema = Schema::builtin();
        assert!(schema.is_valid_type("Mitigation"));
        assert!(!schema.is_valid_type("Document"));
    }

    #[test]
    fn test_business_rule_distinct_endpoints() {
        let schema = Schema::builtin();
        let vpc = entity("Amazon VPC", EntityType::Service);
        let rds = entity("Amazon RDS", EntityType::Service);

        let depends_on = schema.business_rule(RelationType::DependsOn);
        assert!(depends_on.holds(&rds, &vpc));
        assert!(!depends_on.holds(&vpc, &vpc));

        let pattern = entity("Serverless", EntityType::Pattern);
        let example_of = schema.business_rule(RelationType::ExampleOf);
        assert!(!example_of.holds(&pattern, &pattern));
        assert!(!example_of.endpoints_hold(&pattern, &pattern));

        let uses = schema.business_rule(RelationType::Uses);
        let sg = entity("Security Group", EntityType::Component);
        assert!(uses.endpoints_hold(&sg, &sg));
    }

    #[test]
    fn test_definition_round_trips_builtin() {
        let schema = Schema::builtin();
        let json = serde_json::to_string(&schema.definition()).unwrap();
        assert_eq!(Schema::from_json_str(&json).unwrap(), schema);
    }

    #[test]
    fn test_definition_missing_relation_is_fatal() {
        let json = r#"{"relations": {"uses": {"subject": ["Service"], "object": ["Component"]}}}"#;
        let err = Schema::from_json_str(json).unwrap_err();
        assert!(matches!(err, Error::SchemaDefinition(msg) if msg.contains("has no rule")));
    }

    #[test]
    fn test_definition_unknown_type_is_fatal() {
        let mut definition = Schema::builtin().definition();
        definition
            .relations
            .get_mut("uses")
            .unwrap()
            .object
            .push("Widget".into());

        let err = Schema::from_definition(&definition).unwrap_err();
        assert!(matches!(err, Error::SchemaDefinition(msg) if msg.contains("Widget")));
    }

    #[test]
    fn test_definition_malformed_json_is_fatal() {
        assert!(matches!(
            Schema::from_json_str("{ not json"),
            Err(Error::SchemaDefinition(_))
        ));
    }
}
