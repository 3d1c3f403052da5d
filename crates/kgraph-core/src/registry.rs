use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{derive_entity_id, fold_surface, CanonicalEntity, EntityOrigin, EntityRef};
use crate::schema::EntityType;
use crate::{Error, Result};

struct Seed {
    name: &'static str,
    entity_type: EntityType,
    description: &'static str,
    aliases: &'static [&'static str],
}

const fn seed(
    name: &'static str,
    entity_type: EntityType,
    description: &'static str,
    aliases: &'static [&'static str],
) -> Seed {
    Seed {
        name,
        entity_type,
        description,
        aliases,
    }
}

const SEEDS: &[Seed] = &[
    // Well-Architected pillars
    seed("Operational Excellence", EntityType::Pillar, "Run and monitor systems to deliver business value", &["Ops Excellence", "Operational Excellence Pillar"]),
    seed("Security", EntityType::Pillar, "Protect information, systems and assets", &["Security Pillar"]),
    seed("Reliability", EntityType::Pillar, "Perform the intended function correctly and consistently", &["Reliability Pillar"]),
    seed("Performance Efficiency", EntityType::Pillar, "Use computing resources efficiently as demand changes", &["Performance Efficiency Pillar", "Performance"]),
    seed("Cost Optimization", EntityType::Pillar, "Deliver business value at the lowest price point", &["Cost Optimization Pillar", "Cost"]),
    // Patterns
    seed("Multi-AZ Deployment", EntityType::Pattern, "Resources spread across Availability Zones", &["Multi-AZ", "Multi Availability Zone", "Multi-AZ Pattern"]),
    seed("Blue-Green Deployment", EntityType::Pattern, "Two identical production environments", &["Blue Green", "Blue/Green"]),
    seed("Canary Deployment", EntityType::Pattern, "Gradual rollout to a subset of users", &["Canary"]),
    seed("Hub and Spoke", EntityType::Pattern, "Central hub network connected to spoke networks", &["Hub-and-Spoke", "Hub & Spoke"]),
    seed("Serverless", EntityType::Pattern, "Managed services that scale automatically", &["Serverless Architecture"]),
    // Services
    seed("Amazon EC2", EntityType::Service, "Resizable compute capacity", &["EC2", "Elastic Compute Cloud", "EC2 instance", "AWS EC2"]),
    seed("Amazon S3", EntityType::Service, "Object storage", &["S3", "Simple Storage Service", "S3 bucket", "AWS S3"]),
    seed("Amazon DynamoDB", EntityType::Service, "NoSQL database", &["DynamoDB", "AWS DynamoDB"]),
    seed("Amazon RDS", EntityType::Service, "Managed relational database", &["RDS", "Relational Database Service", "AWS RDS"]),
    seed("AWS Lambda", EntityType::Service, "Serverless compute", &["Lambda", "Lambda function"]),
    seed("Amazon VPC", EntityType::Service, "Isolated network environment", &["VPC", "Virtual Private Cloud", "AWS VPC"]),
    seed("AWS Transit Gateway", EntityType::Service, "Network transit hub for connecting VPCs", &["TGW", "Transit Gateway"]),
    seed("AWS Direct Connect", EntityType::Service, "Dedicated network connection", &["DX", "DirectConnect"]),
    seed("AWS Site-to-Site VPN", EntityType::Service, "IPSec VPN between networks", &["VPN", "IPSec VPN", "Site-to-Site", "AWS VPN"]),
    seed("AWS Client VPN", EntityType::Service, "Managed client-based VPN", &["Client VPN"]),
    seed("AWS IAM", EntityType::Service, "Identity and Access Management", &["IAM", "Identity and Access Management"]),
    seed("AWS CloudWatch", EntityType::Service, "Monitoring and observability", &["CloudWatch"]),
    seed("AWS CloudTrail", EntityType::Service, "API call logging", &["CloudTrail"]),
    seed("Amazon Route 53", EntityType::Service, "DNS and domain names", &["Route53", "Route 53", "R53"]),
    seed("Elastic Load Balancing", EntityType::Service, "Load balancing", &["ELB", "ALB", "NLB", "CLB", "Load Balancer", "AWS ELB"]),
    seed("AWS PrivateLink", EntityType::Service, "Private connectivity to services", &["PrivateLink"]),
    seed("Amazon CloudFront", EntityType::Service, "Content delivery network", &["CloudFront", "CDN"]),
    seed("AWS EKS", EntityType::Service, "Elastic Kubernetes Service", &["EKS", "Elastic Kubernetes Service"]),
    seed("Amazon SNS", EntityType::Service, "Simple Notification Service", &["SNS", "AWS SNS"]),
    seed("Amazon SQS", EntityType::Service, "Simple Queue Service", &["SQS", "AWS SQS"]),
    seed("Amazon Kinesis", EntityType::Service, "Streaming data", &["Kinesis"]),
    seed("AWS KMS", EntityType::Service, "Key Management Service", &["KMS", "Key Management Service"]),
    seed("AWS Organizations", EntityType::Service, "Account management and governance", &["Organizations"]),
    seed("AWS Control Tower", EntityType::Service, "Multi-account governance", &["Control Tower"]),
    seed("AWS Backup", EntityType::Service, "Centralized backup", &["Backup"]),
    seed("AWS Elastic Disaster Recovery", EntityType::Service, "Disaster recovery", &["DRS", "Elastic Disaster Recovery", "AWS DRS"]),
    seed("Amazon GuardDuty", EntityType::Service, "Threat detection", &["GuardDuty"]),
    seed("AWS WAF", EntityType::Service, "Web Application Firewall", &["WAF", "Web Application Firewall"]),
    seed("AWS Shield", EntityType::Service, "DDoS protection", &["Shield"]),
    seed("AWS Certificate Manager", EntityType::Service, "TLS certificate management", &["ACM", "Certificate Manager", "AWS ACM"]),
    seed("AWS IAM Identity Center", EntityType::Service, "Single sign-on", &["IAM Identity Center", "SSO", "AWS SSO"]),
    seed("Amazon Cognito", EntityType::Service, "User identity for applications", &["Cognito"]),
    // Components
    seed("EBS Volume", EntityType::Component, "Elastic Block Store volume", &["EBS", "Volume"]),
    seed("VPC Subnet", EntityType::Component, "Subnet within a VPC", &["Subnet"]),
    seed("Security Group", EntityType::Component, "Virtual firewall for instances", &["SG"]),
    seed("Network ACL", EntityType::Component, "Network access control list", &["NACL"]),
    seed("NAT Gateway", EntityType::Component, "Network address translation gateway", &["NAT", "NATGW"]),
    seed("Internet Gateway", EntityType::Component, "Gateway for internet access", &["IGW"]),
    seed("Route Table", EntityType::Component, "Routing table for network traffic", &[]),
    seed("Elastic IP", EntityType::Component, "Static IPv4 address", &["EIP"]),
    seed("VPC Endpoint", EntityType::Component, "Private connection to services", &["Endpoint"]),
];

/// Serialized registry state handed to and received from persistent storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub entities: Vec<CanonicalEntity>,
}

/// Mapping from surface strings to canonical identities for one import run.
///
/// Entities are never removed: clustering marks merged-away entities as
/// redirects, and every lookup follows redirects to the live entity.
#[derive(Debug, Clone, Default)]
pub struct CanonicalRegistry {
    entities: HashMap<Uuid, CanonicalEntity>,
    alias_index: HashMap<String, Vec<Uuid>>,
    name_index: HashMap<(EntityType, String), Uuid>,
    next_seq: u64,
}

impl CanonicalRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the static alias table.
    #[must_use]
    pub fn seeded() -> Self {
        let mut registry = Self::new();
        for seed in SEEDS {
            let entity = CanonicalEntity::new(seed.name.to_string(), seed.entity_type, EntityOrigin::Seeded)
                .with_description(seed.description)
                .with_aliases(seed.aliases.iter().copied());
            // Seed names are unique per type, so this cannot collide.
            if let Err(e) = registry.insert(entity, false) {
                tracing::warn!("Skipping seed entity '{}': {}", seed.name, e);
            }
        }
        registry
    }

    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Result<Self> {
        let mut registry = Self::new();
        registry.load_snapshot(snapshot)?;
        Ok(registry)
    }

    /// Merges persisted entities into this registry. Existing identities keep
    /// their state; aliases and redirects are unioned in.
    pub fn load_snapshot(&mut self, snapshot: RegistrySnapshot) -> Result<usize> {
        let mut loaded = 0;
        for entity in snapshot.entities {
            let redirect = entity.redirect_to;
            let id = entity.id;
            let known = self.entities.contains_key(&id);
            self.insert(entity, true)?;
            if !known {
                loaded += 1;
            }
            if let (Some(target), Some(existing)) = (redirect, self.entities.get_mut(&id)) {
                existing.redirect_to.get_or_insert(target);
            }
        }
        tracing::debug!("Loaded {} persisted entities into registry", loaded);
        Ok(loaded)
    }

    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut entities: Vec<CanonicalEntity> = self.entities.values().cloned().collect();
        entities.sort_by(|a, b| a.created_seq.cmp(&b.created_seq).then(a.id.cmp(&b.id)));
        RegistrySnapshot { entities }
    }

    fn insert(&mut self, mut entity: CanonicalEntity, keep_seq: bool) -> Result<Uuid> {
        let id = entity.id;

        if let Some(existing) = self.entities.get(&id) {
            if fold_surface(&existing.canonical_name) != fold_surface(&entity.canonical_name) {
                return Err(Error::IdentityConflict {
                    id,
                    existing: existing.canonical_name.clone(),
                    requested: entity.canonical_name,
                });
            }
            for alias in entity.aliases {
                self.index_alias(&alias, id);
                if let Some(existing) = self.entities.get_mut(&id) {
                    existing.aliases.insert(alias);
                }
            }
            return Ok(id);
        }

        if keep_seq {
            self.next_seq = self.next_seq.max(entity.created_seq + 1);
        } else {
            entity.created_seq = self.next_seq;
            self.next_seq += 1;
        }

        self.name_index
            .entry((entity.entity_type, fold_surface(&entity.canonical_name)))
            .or_insert(id);
        for alias in &entity.aliases {
            self.index_alias(alias, id);
        }
        self.entities.insert(id, entity);
        Ok(id)
    }

    fn index_alias(&mut self, raw: &str, id: Uuid) -> bool {
        let key = fold_surface(raw);
        if key.is_empty() {
            return false;
        }
        let ids = self.alias_index.entry(key).or_default();
        if ids.contains(&id) {
            false
        } else {
            ids.push(id);
            true
        }
    }

    /// Returns the entity for `canonical_name`, creating it if it is new.
    pub fn mint(&mut self, canonical_name: &str, entity_type: EntityType) -> Result<EntityRef> {
        let id = derive_entity_id(canonical_name, entity_type);
        if !self.entities.contains_key(&id) {
            let entity = CanonicalEntity::new(canonical_name.trim().to_string(), entity_type, EntityOrigin::Minted);
            self.insert(entity, false)?;
            tracing::debug!("Minted {}:{} ({})", entity_type, canonical_name, id);
        } else if let Some(existing) = self.entities.get(&id) {
            if fold_surface(&existing.canonical_name) != fold_surface(canonical_name) {
                return Err(Error::IdentityConflict {
                    id,
                    existing: existing.canonical_name.clone(),
                    requested: canonical_name.to_string(),
                });
            }
        }
        self.entity_ref(id).ok_or(Error::EntityNotFound(id))
    }

    /// Records `raw` as an alias of the live entity behind `entity_id`.
    /// Returns whether the alias was new.
    pub fn register(&mut self, raw: &str, entity_id: Uuid) -> Result<bool> {
        let target = self
            .resolve(entity_id)
            .map(|e| e.id)
            .ok_or(Error::EntityNotFound(entity_id))?;

        let raw = raw.trim();
        if !self.index_alias(raw, target) {
            return Ok(false);
        }
        if let Some(entity) = self.entities.get_mut(&target) {
            if fold_surface(&entity.canonical_name) != fold_surface(raw) {
                entity.aliases.insert(raw.to_string());
            }
        }
        Ok(true)
    }

    /// Marks `from` as merged into `to`, moving its names over as aliases.
    pub fn redirect(&mut self, from: Uuid, to: Uuid) -> Result<()> {
        let target = self.resolve(to).map(|e| e.id).ok_or(Error::EntityNotFound(to))?;
        let source = self.entities.get(&from).ok_or(Error::EntityNotFound(from))?;
        if source.id == target {
            return Ok(());
        }

        let mut moved: BTreeSet<String> = source.aliases.clone();
        moved.insert(source.canonical_name.clone());

        if let Some(source) = self.entities.get_mut(&from) {
            source.redirect_to = Some(target);
        }
        if let Some(target_entity) = self.entities.get_mut(&target) {
            let target_key = fold_surface(&target_entity.canonical_name);
            target_entity
                .aliases
                .extend(moved.into_iter().filter(|a| fold_surface(a) != target_key));
        }
        Ok(())
    }

    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<&CanonicalEntity> {
        self.entities.get(&id)
    }

    /// Follows redirects to the live entity.
    #[must_use]
    pub fn resolve(&self, id: Uuid) -> Option<&CanonicalEntity> {
        let mut current = self.entities.get(&id)?;
        for _ in 0..self.entities.len() {
            match current.redirect_to {
                Some(next) => current = self.entities.get(&next)?,
                None => return Some(current),
            }
        }
        tracing::warn!("Redirect cycle detected starting at {}", id);
        None
    }

    #[must_use]
    pub fn entity_ref(&self, id: Uuid) -> Option<EntityRef> {
        self.resolve(id).map(CanonicalEntity::to_ref)
    }

    #[must_use]
    pub fn lookup_alias(&self, raw: &str) -> Option<&CanonicalEntity> {
        let ids = self.alias_index.get(&fold_surface(raw))?;
        ids.iter().find_map(|&id| self.resolve(id))
    }

    #[must_use]
    pub fn lookup_alias_of_type(&self, raw: &str, entity_type: EntityType) -> Option<&CanonicalEntity> {
        let ids = self.alias_index.get(&fold_surface(raw))?;
        ids.iter()
            .filter_map(|&id| self.resolve(id))
            .find(|e| e.entity_type == entity_type)
    }

    /// Entity types the alias table maps `raw` to.
    #[must_use]
    pub fn alias_types(&self, raw: &str) -> BTreeSet<EntityType> {
        self.alias_index
            .get(&fold_surface(raw))
            .into_iter()
            .flatten()
            .filter_map(|&id| self.resolve(id))
            .map(|e| e.entity_type)
            .collect()
    }

    #[must_use]
    pub fn find_by_name(&self, name: &str, entity_type: EntityType) -> Option<&CanonicalEntity> {
        let id = self.name_index.get(&(entity_type, fold_surface(name)))?;
        self.resolve(*id)
    }

    /// Live (non-redirected) entities of a type, oldest first.
    #[must_use]
    pub fn all_of_type(&self, entity_type: EntityType) -> Vec<&CanonicalEntity> {
        let mut entities: Vec<&CanonicalEntity> = self
            .entities
            .values()
            .filter(|e| e.entity_type == entity_type && !e.is_redirect())
            .collect();
        entities.sort_by(|a, b| a.created_seq.cmp(&b.created_seq).then(a.id.cmp(&b.id)));
        entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.entities.values().filter(|e| !e.is_redirect()).count()
    }
}
