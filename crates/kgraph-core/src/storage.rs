use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite, Transaction};
use uuid::Uuid;

use crate::{
    entity::{CanonicalEntity, EntityRef},
    pipeline::{Conflict, TripleDiff},
    registry::RegistrySnapshot,
    store::TripleStore,
    triple::{EvidenceRecord, Triple, TripleKey},
    Error, Result,
};

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS canonical_entities (
    id TEXT PRIMARY KEY,
    canonical_name TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    description TEXT,
    redirect_to TEXT,
    origin TEXT NOT NULL,
    created_seq INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entities_type ON canonical_entities(entity_type);

CREATE TABLE IF NOT EXISTS entity_aliases (
    entity_id TEXT NOT NULL REFERENCES canonical_entities(id),
    alias TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_aliases_unique ON entity_aliases(entity_id, alias);

CREATE TABLE IF NOT EXISTS triples (
    subject_id TEXT NOT NULL,
    relation TEXT NOT NULL,
    object_id TEXT NOT NULL,
    subject_name TEXT NOT NULL,
    subject_type TEXT NOT NULL,
    object_name TEXT NOT NULL,
    object_type TEXT NOT NULL,
    confidence REAL NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (subject_id, relation, object_id)
);

CREATE INDEX IF NOT EXISTS idx_triples_pair ON triples(subject_id, object_id);

CREATE TABLE IF NOT EXISTS evidence (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    subject_id TEXT NOT NULL,
    relation TEXT NOT NULL,
    object_id TEXT NOT NULL,
    source_document_path TEXT NOT NULL,
    text_snippet TEXT NOT NULL,
    section_path TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    inferred INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_evidence_unique
    ON evidence(subject_id, relation, object_id, source_document_path, text_snippet);

CREATE TABLE IF NOT EXISTS review_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    subject_id TEXT NOT NULL,
    relation TEXT NOT NULL,
    object_id TEXT NOT NULL,
    new_triple TEXT NOT NULL,
    stored_triples TEXT NOT NULL,
    flagged_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_review_unique
    ON review_queue(kind, subject_id, relation, object_id);
"#;

type EntityRow = (String, String, String, Option<String>, Option<String>, String, i64, String);
type TripleRow = (String, String, String, String, String, String, String, f64);
type EvidenceRow = (String, String, String, String, String, String, String, i64);

/// Registry and triples as persisted by earlier runs.
#[derive(Debug, Clone, Default)]
pub struct StoredState {
    pub registry: RegistrySnapshot,
    pub triples: TripleStore,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    pub entities: usize,
    pub inserted: usize,
    pub evidence_appended: usize,
    pub flagged: usize,
}

/// Persistence collaborator: a snapshot read at the start of a run and one
/// atomic commit at the end.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load_snapshot(&self) -> Result<StoredState>;

    async fn commit_run(&self, registry: &RegistrySnapshot, diff: &TripleDiff) -> Result<CommitStats>;
}

pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn open(path: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&format!("sqlite:{path}?mode=rwc"))
            .await?;

        sqlx::query(INIT_SQL).execute(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::query(INIT_SQL).execute(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn load_entities(&self) -> Result<Vec<CanonicalEntity>> {
        let rows: Vec<EntityRow> = sqlx::query_as(
            r#"
            SELECT id, canonical_name, entity_type, description, redirect_to, origin, created_seq, created_at
            FROM canonical_entities ORDER BY created_seq
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let aliases: Vec<(String, String)> =
            sqlx::query_as("SELECT entity_id, alias FROM entity_aliases")
                .fetch_all(&self.pool)
                .await?;
        let mut by_entity: HashMap<Uuid, Vec<String>> = HashMap::new();
        for (entity_id, alias) in aliases {
            by_entity.entry(parse_id(&entity_id)?).or_default().push(alias);
        }

        rows.into_iter()
            .map(|row| {
                let mut entity = parse_entity_row(row)?;
                if let Some(aliases) = by_entity.remove(&entity.id) {
                    entity.aliases.extend(aliases);
                }
                Ok(entity)
            })
            .collect()
    }

    pub async fn load_triples(&self) -> Result<Vec<Triple>> {
        let rows: Vec<TripleRow> = sqlx::query_as(
            r#"
            SELECT subject_id, relation, object_id, subject_name, subject_type, object_name, object_type, confidence
            FROM triples ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let evidence_rows: Vec<EvidenceRow> = sqlx::query_as(
            r#"
            SELECT subject_id, relation, object_id, source_document_path, text_snippet, section_path, timestamp, inferred
            FROM evidence ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut evidence: HashMap<TripleKey, Vec<EvidenceRecord>> = HashMap::new();
        for row in evidence_rows {
            let (key, record) = parse_evidence_row(row)?;
            evidence.entry(key).or_default().push(record);
        }

        rows.into_iter()
            .map(|row| {
                let mut triple = parse_triple_row(row)?;
                triple.evidence = evidence.remove(&triple.key()).unwrap_or_default();
                Ok(triple)
            })
            .collect()
    }

    /// Open conflicts awaiting manual review, oldest first.
    pub async fn review_queue(&self) -> Result<Vec<Conflict>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT kind, new_triple, stored_triples FROM review_queue ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(kind, new_triple, stored)| {
                Ok(Conflict {
                    kind: serde_json::from_value(serde_json::Value::String(kind))?,
                    new: serde_json::from_str(&new_triple)?,
                    stored: serde_json::from_str(&stored)?,
                })
            })
            .collect()
    }

    async fn upsert_entity(tx: &mut Transaction<'_, Sqlite>, entity: &CanonicalEntity) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO canonical_entities
                (id, canonical_name, entity_type, description, redirect_to, origin, created_seq, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                description = COALESCE(canonical_entities.description, excluded.description),
                redirect_to = COALESCE(canonical_entities.redirect_to, excluded.redirect_to)
            "#,
        )
        .bind(entity.id.to_string())
        .bind(&entity.canonical_name)
        .bind(entity.entity_type.as_str())
        .bind(&entity.description)
        .bind(entity.redirect_to.map(|id| id.to_string()))
        .bind(entity.origin.as_str())
        .bind(i64::try_from(entity.created_seq).unwrap_or(i64::MAX))
        .bind(entity.created_at.to_rfc3339())
        .execute(&mut **tx)
        .await?;

        for alias in &entity.aliases {
            sqlx::query("INSERT OR IGNORE INTO entity_aliases (entity_id, alias) VALUES (?, ?)")
                .bind(entity.id.to_string())
                .bind(alias)
                .execute(&mut **tx)
                .await?;
        }

        Ok(())
    }

    async fn insert_triple(tx: &mut Transaction<'_, Sqlite>, triple: &Triple) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO triples
                (subject_id, relation, object_id, subject_name, subject_type, object_name, object_type,
                 confidence, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(triple.subject.id.to_string())
        .bind(triple.relation.as_str())
        .bind(triple.object.id.to_string())
        .bind(&triple.subject.name)
        .bind(triple.subject.entity_type.as_str())
        .bind(&triple.object.name)
        .bind(triple.object.entity_type.as_str())
        .bind(triple.confidence)
        .bind(&now)
        .bind(&now)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn append_evidence(
        tx: &mut Transaction<'_, Sqlite>,
        key: TripleKey,
        records: &[EvidenceRecord],
    ) -> Result<usize> {
        let mut appended = 0;
        for record in records {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO evidence
                    (subject_id, relation, object_id, source_document_path, text_snippet,
                     section_path, timestamp, inferred)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(key.subject.to_string())
            .bind(key.relation.as_str())
            .bind(key.object.to_string())
            .bind(&record.source_document_path)
            .bind(&record.text_snippet)
            .bind(serde_json::to_string(&record.section_heading_path)?)
            .bind(record.timestamp.to_rfc3339())
            .bind(i64::from(record.inferred))
            .execute(&mut **tx)
            .await?;
            if result.rows_affected() > 0 {
                appended += 1;
            }
        }
        Ok(appended)
    }

    async fn raise_confidence(tx: &mut Transaction<'_, Sqlite>, key: TripleKey, confidence: f64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE triples SET confidence = MAX(confidence, ?), updated_at = ?
            WHERE subject_id = ? AND relation = ? AND object_id = ?
            "#,
        )
        .bind(confidence)
        .bind(Utc::now().to_rfc3339())
        .bind(key.subject.to_string())
        .bind(key.relation.as_str())
        .bind(key.object.to_string())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Queues a conflict unless the same one is already waiting for review.
    async fn flag(tx: &mut Transaction<'_, Sqlite>, conflict: &Conflict) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO review_queue
                (kind, subject_id, relation, object_id, new_triple, stored_triples, flagged_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(conflict.kind.as_str())
        .bind(conflict.new.subject.id.to_string())
        .bind(conflict.new.relation.as_str())
        .bind(conflict.new.object.id.to_string())
        .bind(serde_json::to_string(&conflict.new)?)
        .bind(serde_json::to_string(&conflict.stored)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl SnapshotStore for Storage {
    async fn load_snapshot(&self) -> Result<StoredState> {
        let entities = self.load_entities().await?;
        let triples = self.load_triples().await?;
        tracing::info!(
            "Loaded snapshot: {} entities, {} triples",
            entities.len(),
            triples.len()
        );

        Ok(StoredState {
            registry: RegistrySnapshot { entities },
            triples: TripleStore::from_triples(triples),
        })
    }

    /// Applies the whole diff in one transaction; a failure leaves stored
    /// state as it was. Nothing is ever deleted.
    async fn commit_run(&self, registry: &RegistrySnapshot, diff: &TripleDiff) -> Result<CommitStats> {
        let mut tx = self.pool.begin().await?;
        let mut stats = CommitStats::default();

        for entity in &registry.entities {
            Self::upsert_entity(&mut tx, entity).await?;
            stats.entities += 1;
        }

        for triple in &diff.to_insert {
            if Self::insert_triple(&mut tx, triple).await? {
                stats.inserted += 1;
            }
            stats.evidence_appended += Self::append_evidence(&mut tx, triple.key(), &triple.evidence).await?;
        }

        for update in &diff.to_update {
            // The stored side may sit under ids rewritten by clustering.
            if Self::insert_triple(&mut tx, &update.stored).await? {
                stats.inserted += 1;
                stats.evidence_appended +=
                    Self::append_evidence(&mut tx, update.stored.key(), &update.stored.evidence).await?;
            }
            let key = update.stored.key();
            stats.evidence_appended += Self::append_evidence(&mut tx, key, &update.new_evidence).await?;
            Self::raise_confidence(&mut tx, key, update.confidence).await?;
        }

        for conflict in &diff.flagged {
            if Self::flag(&mut tx, conflict).await? {
                stats.flagged += 1;
            }
        }

        tx.commit().await?;

        tracing::info!(
            "Committed run: {} entities, {} triples inserted, {} evidence records appended, {} flagged",
            stats.entities,
            stats.inserted,
            stats.evidence_appended,
            stats.flagged
        );

        Ok(stats)
    }
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| Error::InvalidRow(format!("invalid id '{raw}'")))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .map_err(|_| Error::InvalidRow(format!("invalid timestamp '{raw}'")))?
        .with_timezone(&Utc))
}

fn parse_entity_row(row: EntityRow) -> Result<CanonicalEntity> {
    let (id, canonical_name, entity_type, description, redirect_to, origin, created_seq, created_at) = row;

    Ok(CanonicalEntity {
        id: parse_id(&id)?,
        canonical_name,
        entity_type: entity_type.parse()?,
        aliases: std::collections::BTreeSet::new(),
        description,
        redirect_to: redirect_to.as_deref().map(parse_id).transpose()?,
        origin: origin.parse()?,
        created_seq: u64::try_from(created_seq).unwrap_or_default(),
        created_at: parse_time(&created_at)?,
    })
}

fn parse_triple_row(row: TripleRow) -> Result<Triple> {
    let (subject_id, relation, object_id, subject_name, subject_type, object_name, object_type, confidence) =
        row;

    Ok(Triple {
        subject: EntityRef {
            id: parse_id(&subject_id)?,
            name: subject_name,
            entity_type: subject_type.parse()?,
        },
        relation: relation.parse()?,
        object: EntityRef {
            id: parse_id(&object_id)?,
            name: object_name,
            entity_type: object_type.parse()?,
        },
        evidence: Vec::new(),
        confidence,
    })
}

fn parse_evidence_row(row: EvidenceRow) -> Result<(TripleKey, EvidenceRecord)> {
    let (subject_id, relation, object_id, source_document_path, text_snippet, section_path, timestamp, inferred) =
        row;

    let key = TripleKey {
        subject: parse_id(&subject_id)?,
        relation: relation.parse()?,
        object: parse_id(&object_id)?,
    };
    let record = EvidenceRecord {
        timestamp: parse_time(&timestamp)?,
        source_document_path,
        text_snippet,
        section_heading_path: serde_json::from_str(&section_path)?,
        inferred: inferred != 0,
    };
    Ok((key, record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ConflictKind, EvidenceAppend};
    use crate::registry::CanonicalRegistry;
    use crate::schema::{EntityType, RelationType};
    use chrono::TimeZone;

    fn evidence(snippet: &str) -> EvidenceRecord {
        EvidenceRecord {
            timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap(),
            source_document_path: "docs/reliability.md".into(),
            text_snippet: snippet.into(),
            section_heading_path: vec!["Reliability".into(), "Networking".into()],
            inferred: false,
        }
    }

    fn rds_depends_on_vpc(registry: &CanonicalRegistry, snippet: &str) -> Triple {
        let rds = registry.find_by_name("Amazon RDS", EntityType::Service).unwrap();
        let vpc = registry.find_by_name("Amazon VPC", EntityType::Service).unwrap();
        Triple {
            subject: rds.to_ref(),
            relation: RelationType::DependsOn,
            object: vpc.to_ref(),
            evidence: vec![evidence(snippet)],
            confidence: 0.8,
        }
    }

    #[tokio::test]
    async fn test_commit_and_reload_snapshot() {
        let storage = Storage::open_memory().await.unwrap();
        let mut registry = CanonicalRegistry::seeded();
        let latency = registry.mint("Latency", EntityType::Metric).unwrap();
        registry.register("p99 latency", latency.id).unwrap();
        let triple = rds_depends_on_vpc(&registry, "RDS instances are placed in VPC subnets");

        let diff = TripleDiff {
            to_insert: vec![triple.clone()],
            ..TripleDiff::default()
        };
        let stats = storage.commit_run(&registry.snapshot(), &diff).await.unwrap();
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.evidence_appended, 1);

        let state = storage.load_snapshot().await.unwrap();
        assert_eq!(state.registry.entities.len(), registry.len());
        assert_eq!(state.triples.len(), 1);
        assert_eq!(state.triples.get(&triple.key()).unwrap(), &triple);

        let reloaded = CanonicalRegistry::from_snapshot(state.registry).unwrap();
        assert_eq!(reloaded.lookup_alias("P99 Latency").unwrap().id, latency.id);
    }

    #[tokio::test]
    async fn test_update_appends_evidence_and_flags_conflicts() {
        let storage = Storage::open_memory().await.unwrap();
        let registry = CanonicalRegistry::seeded();
        let stored = rds_depends_on_vpc(&registry, "RDS instances are placed in VPC subnets");
        storage
            .commit_run(
                &registry.snapshot(),
                &TripleDiff {
                    to_insert: vec![stored.clone()],
                    ..TripleDiff::default()
                },
            )
            .await
            .unwrap();

        let mut reversed = stored.clone();
        std::mem::swap(&mut reversed.subject, &mut reversed.object);

        let diff = TripleDiff {
            to_update: vec![EvidenceAppend {
                stored: stored.clone(),
                new_evidence: vec![
                    evidence("RDS instances are placed in VPC subnets"),
                    evidence("Multi-AZ RDS needs two subnets"),
                ],
                confidence: 0.95,
            }],
            flagged: vec![Conflict {
                kind: ConflictKind::ReversedDirection,
                new: reversed,
                stored: vec![stored.clone()],
            }],
            ..TripleDiff::default()
        };
        let stats = storage.commit_run(&registry.snapshot(), &diff).await.unwrap();
        assert_eq!(stats.evidence_appended, 1);
        assert_eq!(stats.flagged, 1);

        let state = storage.load_snapshot().await.unwrap();
        let triple = state.triples.get(&stored.key()).unwrap();
        assert_eq!(triple.evidence.len(), 2);
        assert!((triple.confidence - 0.95).abs() < f64::EPSILON);

        let queue = storage.review_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].kind, ConflictKind::ReversedDirection);
        assert_eq!(queue[0].stored, vec![stored]);
    }

    #[tokio::test]
    async fn test_same_conflict_is_queued_once() {
        let storage = Storage::open_memory().await.unwrap();
        let registry = CanonicalRegistry::seeded();
        let stored = rds_depends_on_vpc(&registry, "RDS instances are placed in VPC subnets");
        let mut reversed = stored.clone();
        std::mem::swap(&mut reversed.subject, &mut reversed.object);
        let diff = TripleDiff {
            flagged: vec![Conflict {
                kind: ConflictKind::ReversedDirection,
                new: reversed,
                stored: vec![stored],
            }],
            ..TripleDiff::default()
        };

        let first = storage.commit_run(&registry.snapshot(), &diff).await.unwrap();
        let second = storage.commit_run(&registry.snapshot(), &diff).await.unwrap();

        assert_eq!(first.flagged, 1);
        assert_eq!(second.flagged, 0);
        assert_eq!(storage.review_queue().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_database_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("graph.db");
        let path = path.to_str().unwrap();
        let registry = CanonicalRegistry::seeded();
        let triple = rds_depends_on_vpc(&registry, "RDS instances are placed in VPC subnets");

        {
            let storage = Storage::open(path).await.unwrap();
            storage
                .commit_run(
                    &registry.snapshot(),
                    &TripleDiff {
                        to_insert: vec![triple.clone()],
                        ..TripleDiff::default()
                    },
                )
                .await
                .unwrap();
            storage.pool.close().await;
        }

        let storage = Storage::open(path).await.unwrap();
        let state = storage.load_snapshot().await.unwrap();
        assert_eq!(state.registry.entities.len(), registry.len());
        assert!(state.triples.contains(&triple.key()));
    }

    #[tokio::test]
    async fn test_commit_keeps_existing_redirects() {
        let storage = Storage::open_memory().await.unwrap();
        let mut registry = CanonicalRegistry::new();
        let keep = registry.mint("Amazon Aurora", EntityType::Service).unwrap();
        let dup = registry.mint("Aurora", EntityType::Service).unwrap();
        registry.redirect(dup.id, keep.id).unwrap();
        storage.commit_run(&registry.snapshot(), &TripleDiff::default()).await.unwrap();

        let mut fresh = CanonicalRegistry::new();
        fresh.mint("Aurora", EntityType::Service).unwrap();
        storage.commit_run(&fresh.snapshot(), &TripleDiff::default()).await.unwrap();

        let entities = storage.load_entities().await.unwrap();
        let aurora = entities.iter().find(|e| e.id == dup.id).unwrap();
        assert_eq!(aurora.redirect_to, Some(keep.id));
    }
}
