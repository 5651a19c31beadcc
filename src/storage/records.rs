//! SQLite-backed record store for documents and their CoT sets.
//!
//! The store is the only shared mutable resource of the pipeline. Statuses
//! change exclusively through [`RecordStore::commit_transition`], which is a
//! compare-and-set on `processing_status` executed inside one transaction
//! together with any score, artifact and spawn updates.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::collaborators::CandidateDocument;
use crate::pipeline::gate::{is_legal_transition, OrderBy, Stage};
use crate::pipeline::status::{ArtifactSlot, RecordId, ScoreField, Status, Subject};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    locator             TEXT    NOT NULL UNIQUE,
    metadata            TEXT    NOT NULL DEFAULT '{}',
    processing_status   TEXT    NOT NULL DEFAULT 'pending',
    suitability_score   INTEGER,
    profile_artifact    TEXT,
    extraction_artifact TEXT,
    created_at          TEXT    NOT NULL,
    updated_at          TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS document_categories (
    document_id INTEGER NOT NULL REFERENCES documents(id),
    category    TEXT    NOT NULL,
    UNIQUE (document_id, category)
);

CREATE TABLE IF NOT EXISTS cot_sets (
    id                          INTEGER PRIMARY KEY AUTOINCREMENT,
    document_id                 INTEGER NOT NULL REFERENCES documents(id),
    extraction_index            INTEGER NOT NULL DEFAULT 0,
    processing_status           TEXT    NOT NULL DEFAULT 'extracted',
    quality_score               INTEGER,
    voice_score                 INTEGER,
    extraction_artifact         TEXT,
    critique_artifact           TEXT,
    refinement_artifact         TEXT,
    quality_assessment_artifact TEXT,
    voicing_artifact            TEXT,
    voicing_assessment_artifact TEXT,
    created_at                  TEXT    NOT NULL,
    updated_at                  TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(processing_status);
CREATE INDEX IF NOT EXISTS idx_cot_sets_status ON cot_sets(processing_status);
CREATE INDEX IF NOT EXISTS idx_cot_sets_document ON cot_sets(document_id);
CREATE INDEX IF NOT EXISTS idx_document_categories_category ON document_categories(category);
"#;

/// Unit separator used to pack category lists into one column.
const CATEGORY_SEPARATOR: char = '\u{1f}';

const DOCUMENT_COLUMNS: &str = "d.id AS id, d.locator AS locator, d.metadata AS metadata, \
     d.processing_status AS processing_status, d.suitability_score AS suitability_score, \
     d.profile_artifact AS profile_artifact, d.extraction_artifact AS extraction_artifact, \
     d.created_at AS created_at, \
     (SELECT GROUP_CONCAT(category, char(31)) FROM document_categories dc \
      WHERE dc.document_id = d.id) AS categories";

const COT_SET_COLUMNS: &str = "c.id AS id, c.document_id AS document_id, \
     c.extraction_index AS extraction_index, c.processing_status AS processing_status, \
     c.quality_score AS quality_score, c.voice_score AS voice_score, \
     c.extraction_artifact AS extraction_artifact, c.critique_artifact AS critique_artifact, \
     c.refinement_artifact AS refinement_artifact, \
     c.quality_assessment_artifact AS quality_assessment_artifact, \
     c.voicing_artifact AS voicing_artifact, \
     c.voicing_assessment_artifact AS voicing_assessment_artifact, c.created_at AS created_at";

/// Primary category of the document joined as `d`: the smallest tag.
const PRIMARY_CATEGORY_EXPR: &str = "COALESCE((SELECT MIN(category) FROM document_categories pc \
     WHERE pc.document_id = d.id), '')";

/// Errors that can occur in the record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQL query failed.
    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    /// The record's status changed since it was read.
    #[error("Stale state for {record}: expected '{expected}', found '{actual}'")]
    StaleState {
        record: RecordId,
        expected: Status,
        actual: Status,
    },

    /// The record does not exist.
    #[error("Record not found: {0}")]
    NotFound(RecordId),

    /// The requested transition is not a row of the stage table.
    #[error("Illegal transition for {record}: '{from}' -> '{to}'")]
    IllegalTransition {
        record: RecordId,
        from: Status,
        to: Status,
    },

    /// Score, artifact or spawn updates do not fit the transition.
    #[error("Invalid update for {record}: {message}")]
    InvalidUpdate { record: RecordId, message: String },

    /// A stored value could not be decoded.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// Metadata serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_stale(&self) -> bool {
        matches!(self, StoreError::StaleState { .. })
    }
}

/// Snapshot of one document row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentRecord {
    pub id: i64,
    pub locator: String,
    /// Sorted, deduplicated category tags.
    pub categories: Vec<String>,
    pub metadata: serde_json::Value,
    pub status: Status,
    pub suitability_score: Option<i64>,
    pub profile_artifact: Option<String>,
    pub extraction_artifact: Option<String>,
    pub created_at: String,
}

impl DocumentRecord {
    /// Lexicographically smallest category, if any.
    pub fn primary_category(&self) -> Option<&str> {
        self.categories.first().map(String::as_str)
    }
}

/// Snapshot of one CoT set row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CotSetRecord {
    pub id: i64,
    pub document_id: i64,
    pub extraction_index: i64,
    pub status: Status,
    pub quality_score: Option<i64>,
    pub voice_score: Option<i64>,
    pub extraction_artifact: Option<String>,
    pub critique_artifact: Option<String>,
    pub refinement_artifact: Option<String>,
    pub quality_assessment_artifact: Option<String>,
    pub voicing_artifact: Option<String>,
    pub voicing_assessment_artifact: Option<String>,
    pub created_at: String,
}

/// A record read from either table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "subject", rename_all = "snake_case")]
pub enum RecordSnapshot {
    Document(DocumentRecord),
    CotSet(CotSetRecord),
}

impl RecordSnapshot {
    pub fn id(&self) -> RecordId {
        match self {
            RecordSnapshot::Document(d) => RecordId::document(d.id),
            RecordSnapshot::CotSet(c) => RecordId::cot_set(c.id),
        }
    }

    pub fn status(&self) -> Status {
        match self {
            RecordSnapshot::Document(d) => d.status,
            RecordSnapshot::CotSet(c) => c.status,
        }
    }

    pub fn score(&self, field: ScoreField) -> Option<i64> {
        match (self, field) {
            (RecordSnapshot::Document(d), ScoreField::Suitability) => d.suitability_score,
            (RecordSnapshot::CotSet(c), ScoreField::Quality) => c.quality_score,
            (RecordSnapshot::CotSet(c), ScoreField::Voice) => c.voice_score,
            _ => None,
        }
    }

    pub fn artifact(&self, slot: ArtifactSlot) -> Option<&str> {
        let value = match (self, slot) {
            (RecordSnapshot::Document(d), ArtifactSlot::Profile) => &d.profile_artifact,
            (RecordSnapshot::Document(d), ArtifactSlot::DocumentExtraction) => {
                &d.extraction_artifact
            }
            (RecordSnapshot::CotSet(c), ArtifactSlot::Extraction) => &c.extraction_artifact,
            (RecordSnapshot::CotSet(c), ArtifactSlot::Critique) => &c.critique_artifact,
            (RecordSnapshot::CotSet(c), ArtifactSlot::Refinement) => &c.refinement_artifact,
            (RecordSnapshot::CotSet(c), ArtifactSlot::QualityAssessment) => {
                &c.quality_assessment_artifact
            }
            (RecordSnapshot::CotSet(c), ArtifactSlot::Voicing) => &c.voicing_artifact,
            (RecordSnapshot::CotSet(c), ArtifactSlot::VoicingAssessment) => {
                &c.voicing_assessment_artifact
            }
            _ => return None,
        };
        value.as_deref()
    }
}

/// A CoT set created by a successful extraction commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCotSet {
    pub extraction_index: i64,
    pub extraction_artifact: String,
}

/// Field updates applied atomically with a status change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionUpdate {
    pub scores: Vec<(ScoreField, i64)>,
    pub artifacts: Vec<(ArtifactSlot, String)>,
    pub spawn: Vec<NewCotSet>,
}

impl TransitionUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_score(mut self, field: ScoreField, value: i64) -> Self {
        self.scores.push((field, value));
        self
    }

    pub fn with_artifact(mut self, slot: ArtifactSlot, reference: impl Into<String>) -> Self {
        self.artifacts.push((slot, reference.into()));
        self
    }

    pub fn with_spawn(mut self, cot_set: NewCotSet) -> Self {
        self.spawn.push(cot_set);
        self
    }
}

/// Extra selection criteria for [`RecordStore::fetch_eligible`].
#[derive(Debug, Clone, Default)]
pub struct EligibleFilter {
    /// Minimum for the stage's gate field; ignored for ungated stages.
    pub min_score: Option<i64>,
    /// Keep records whose document carries any of these categories.
    pub categories: Vec<String>,
    /// Restrict to one document (or the CoT sets of one document).
    pub document_id: Option<i64>,
}

impl EligibleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_score(mut self, min: i64) -> Self {
        self.min_score = Some(min);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.categories.push(category.into());
        self
    }

    pub fn with_document(mut self, document_id: i64) -> Self {
        self.document_id = Some(document_id);
        self
    }
}

/// Outcome of document registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegisterReport {
    pub inserted: u64,
    pub duplicates: u64,
    pub rejected: u64,
}

/// Terminal CoT set joined with its source document.
#[derive(Debug, Clone, PartialEq)]
pub struct CorpusCandidate {
    pub cot_set: CotSetRecord,
    pub locator: String,
    pub categories: Vec<String>,
}

/// Row counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub documents: BTreeMap<String, u64>,
    pub cot_sets: BTreeMap<String, u64>,
}

impl StatusCounts {
    pub fn count(&self, status: Status) -> u64 {
        let map = match status.subject() {
            Subject::Document => &self.documents,
            Subject::CotSet => &self.cot_sets,
        };
        map.get(status.as_str()).copied().unwrap_or(0)
    }

    pub fn total_documents(&self) -> u64 {
        self.documents.values().sum()
    }

    pub fn total_cot_sets(&self) -> u64 {
        self.cot_sets.values().sum()
    }
}

/// Persistent store of documents and CoT sets.
#[derive(Clone)]
pub struct RecordStore {
    pool: SqlitePool,
}

impl RecordStore {
    /// Opens (or creates) the database at `path` and applies the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(10))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        tracing::info!(path = %path.display(), "Record store opened");
        Ok(Self { pool })
    }

    /// Opens a private in-memory database.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        // Each in-memory connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;
        Ok(Self { pool })
    }

    // ===== Ingestion =====

    /// Inserts new documents at `pending`. Known locators are left untouched.
    pub async fn register_documents(
        &self,
        candidates: &[CandidateDocument],
    ) -> Result<RegisterReport, StoreError> {
        let mut report = RegisterReport::default();
        let mut tx = self.pool.begin().await?;

        for candidate in candidates {
            let locator = candidate.locator.trim();
            if locator.is_empty() {
                report.rejected += 1;
                continue;
            }

            let now = now_timestamp();
            let metadata = serde_json::to_string(&candidate.metadata)?;
            let result = sqlx::query(
                "INSERT OR IGNORE INTO documents
                    (locator, metadata, processing_status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
            )
            .bind(locator)
            .bind(&metadata)
            .bind(Status::Pending.as_str())
            .bind(&now)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                report.duplicates += 1;
                continue;
            }

            let document_id = result.last_insert_rowid();
            for category in &candidate.categories {
                let category = category.trim();
                if category.is_empty() {
                    continue;
                }
                sqlx::query(
                    "INSERT OR IGNORE INTO document_categories (document_id, category)
                     VALUES (?1, ?2)",
                )
                .bind(document_id)
                .bind(category)
                .execute(&mut *tx)
                .await?;
            }
            report.inserted += 1;
        }

        tx.commit().await?;
        tracing::info!(
            inserted = report.inserted,
            duplicates = report.duplicates,
            rejected = report.rejected,
            "Documents registered"
        );
        Ok(report)
    }

    // ===== Selection =====

    /// Returns up to `limit` records currently eligible for `stage`.
    ///
    /// Records are returned in the order the caller should process them.
    pub async fn fetch_eligible(
        &self,
        stage: Stage,
        filter: &EligibleFilter,
        order: OrderBy,
        limit: usize,
    ) -> Result<Vec<RecordSnapshot>, StoreError> {
        let rule = stage.rule();
        let gate = rule.gate.zip(filter.min_score);

        let (columns, from, alias) = match rule.subject {
            Subject::Document => (DOCUMENT_COLUMNS, "documents d", "d"),
            Subject::CotSet => (
                COT_SET_COLUMNS,
                "cot_sets c JOIN documents d ON d.id = c.document_id",
                "c",
            ),
        };

        let mut conditions = vec![format!("{}.processing_status = ?", alias)];
        if let Some((field, _)) = gate {
            conditions.push(format!("{}.{} >= ?", alias, field.column()));
        }
        if !filter.categories.is_empty() {
            let placeholders = vec!["?"; filter.categories.len()].join(", ");
            conditions.push(format!(
                "EXISTS (SELECT 1 FROM document_categories fc \
                 WHERE fc.document_id = d.id AND fc.category IN ({}))",
                placeholders
            ));
        }
        if filter.document_id.is_some() {
            conditions.push("d.id = ?".to_string());
        }
        let where_clause = conditions.join(" AND ");

        let sql = match order {
            OrderBy::Identity => format!(
                "SELECT {} FROM {} WHERE {} ORDER BY {}.id LIMIT ?",
                columns, from, where_clause, alias
            ),
            OrderBy::Random => format!(
                "SELECT {} FROM {} WHERE {} ORDER BY RANDOM() LIMIT ?",
                columns, from, where_clause
            ),
            OrderBy::CategoryBalanced => format!(
                "SELECT * FROM (SELECT {columns}, ROW_NUMBER() OVER (\
                     PARTITION BY {primary} ORDER BY RANDOM()) AS category_rank \
                 FROM {from} WHERE {where_clause}) \
                 ORDER BY category_rank, RANDOM() LIMIT ?",
                columns = columns,
                primary = PRIMARY_CATEGORY_EXPR,
                from = from,
                where_clause = where_clause
            ),
        };

        let mut query = sqlx::query(&sql).bind(rule.input.as_str());
        if let Some((_, min)) = gate {
            query = query.bind(min);
        }
        for category in &filter.categories {
            query = query.bind(category);
        }
        if let Some(document_id) = filter.document_id {
            query = query.bind(document_id);
        }
        let rows = query
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        let snapshots = rows
            .iter()
            .map(|row| match rule.subject {
                Subject::Document => document_from_row(row).map(RecordSnapshot::Document),
                Subject::CotSet => cot_set_from_row(row).map(RecordSnapshot::CotSet),
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(
            stage = %stage,
            order = %order,
            limit = limit,
            selected = snapshots.len(),
            "Fetched eligible records"
        );
        Ok(snapshots)
    }

    // ===== Transitions =====

    /// Atomically moves `record` from `expected` to `new_status`.
    ///
    /// Score and artifact updates, and any spawned CoT sets, are written in
    /// the same transaction. Fails with [`StoreError::StaleState`] when the
    /// stored status is no longer `expected`.
    pub async fn commit_transition(
        &self,
        record: RecordId,
        expected: Status,
        new_status: Status,
        update: &TransitionUpdate,
    ) -> Result<(), StoreError> {
        validate_transition(record, expected, new_status, update)?;

        let mut assignments = vec!["processing_status = ?", "updated_at = ?"]
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        for (field, _) in &update.scores {
            assignments.push(format!("{} = ?", field.column()));
        }
        for (slot, _) in &update.artifacts {
            assignments.push(format!("{} = ?", slot.column()));
        }
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ? AND processing_status = ?",
            record.subject.table(),
            assignments.join(", ")
        );

        let now = now_timestamp();
        let mut tx = self.pool.begin().await?;

        let mut query = sqlx::query(&sql).bind(new_status.as_str()).bind(&now);
        for (_, value) in &update.scores {
            query = query.bind(*value);
        }
        for (_, reference) in &update.artifacts {
            query = query.bind(reference);
        }
        let result = query
            .bind(record.id)
            .bind(expected.as_str())
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            let current = sqlx::query(&format!(
                "SELECT processing_status FROM {} WHERE id = ?1",
                record.subject.table()
            ))
            .bind(record.id)
            .fetch_optional(&mut *tx)
            .await?;

            return match current {
                None => Err(StoreError::NotFound(record)),
                Some(row) => {
                    let actual = parse_status(row.try_get("processing_status")?)?;
                    Err(StoreError::StaleState {
                        record,
                        expected,
                        actual,
                    })
                }
            };
        }

        for cot_set in &update.spawn {
            sqlx::query(
                "INSERT INTO cot_sets
                    (document_id, extraction_index, processing_status, extraction_artifact,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            )
            .bind(record.id)
            .bind(cot_set.extraction_index)
            .bind(Status::Extracted.as_str())
            .bind(&cot_set.extraction_artifact)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::debug!(
            record = %record,
            from = %expected,
            to = %new_status,
            spawned = update.spawn.len(),
            "Transition committed"
        );
        Ok(())
    }

    // ===== Reads =====

    pub async fn get_document(&self, id: i64) -> Result<Option<DocumentRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents d WHERE d.id = ?1",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    pub async fn get_cot_set(&self, id: i64) -> Result<Option<CotSetRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM cot_sets c WHERE c.id = ?1",
            COT_SET_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(cot_set_from_row).transpose()
    }

    /// Reads either kind of record.
    pub async fn get(&self, record: RecordId) -> Result<Option<RecordSnapshot>, StoreError> {
        Ok(match record.subject {
            Subject::Document => self
                .get_document(record.id)
                .await?
                .map(RecordSnapshot::Document),
            Subject::CotSet => self.get_cot_set(record.id).await?.map(RecordSnapshot::CotSet),
        })
    }

    /// CoT sets derived from `document_id`, oldest first.
    pub async fn cot_sets_for_document(
        &self,
        document_id: i64,
    ) -> Result<Vec<CotSetRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM cot_sets c WHERE c.document_id = ?1 ORDER BY c.id",
            COT_SET_COLUMNS
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(cot_set_from_row).collect()
    }

    /// All CoT sets at the terminal success status, by id.
    pub async fn terminal_cot_sets(&self) -> Result<Vec<CorpusCandidate>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {}, d.locator AS document_locator, \
             (SELECT GROUP_CONCAT(category, char(31)) FROM document_categories dc \
              WHERE dc.document_id = d.id) AS categories \
             FROM cot_sets c JOIN documents d ON d.id = c.document_id \
             WHERE c.processing_status = ?1 ORDER BY c.id",
            COT_SET_COLUMNS
        ))
        .bind(Status::VoicingScored.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(CorpusCandidate {
                    cot_set: cot_set_from_row(row)?,
                    locator: row.try_get("document_locator")?,
                    categories: split_categories(row.try_get("categories")?),
                })
            })
            .collect()
    }

    /// Counts rows per status in both tables.
    pub async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let mut counts = StatusCounts::default();
        for (subject, map) in [
            (Subject::Document, &mut counts.documents),
            (Subject::CotSet, &mut counts.cot_sets),
        ] {
            let rows = sqlx::query(&format!(
                "SELECT processing_status, COUNT(*) AS total FROM {} GROUP BY processing_status",
                subject.table()
            ))
            .fetch_all(&self.pool)
            .await?;
            for row in rows {
                let status: String = row.try_get("processing_status")?;
                let total: i64 = row.try_get("total")?;
                let total = status_total(&status, total)?;
                map.insert(status, total);
            }
        }
        Ok(counts)
    }
}

fn status_total(status: &str, total: i64) -> Result<u64, StoreError> {
    u64::try_from(total)
        .map_err(|_| StoreError::Corrupt(format!("count {} for status '{}'", total, status)))
}

fn validate_transition(
    record: RecordId,
    expected: Status,
    new_status: Status,
    update: &TransitionUpdate,
) -> Result<(), StoreError> {
    if expected.subject() != record.subject
        || new_status.subject() != record.subject
        || !is_legal_transition(expected, new_status)
    {
        return Err(StoreError::IllegalTransition {
            record,
            from: expected,
            to: new_status,
        });
    }

    if let Some((field, _)) = update
        .scores
        .iter()
        .find(|(field, _)| field.subject() != record.subject)
    {
        return Err(StoreError::InvalidUpdate {
            record,
            message: format!("{} does not belong to a {}", field, record.subject),
        });
    }

    if let Some((slot, _)) = update
        .artifacts
        .iter()
        .find(|(slot, _)| slot.subject() != record.subject)
    {
        return Err(StoreError::InvalidUpdate {
            record,
            message: format!("{} does not belong to a {}", slot.column(), record.subject),
        });
    }

    if !update.spawn.is_empty() && new_status != Status::CotExtracted {
        return Err(StoreError::InvalidUpdate {
            record,
            message: format!("CoT sets can only be spawned by '{}'", Status::CotExtracted),
        });
    }

    Ok(())
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_status(value: String) -> Result<Status, StoreError> {
    value.parse().map_err(StoreError::Corrupt)
}

fn split_categories(packed: Option<String>) -> Vec<String> {
    let mut categories: Vec<String> = packed
        .unwrap_or_default()
        .split(CATEGORY_SEPARATOR)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    categories.sort();
    categories.dedup();
    categories
}

fn document_from_row(row: &SqliteRow) -> Result<DocumentRecord, StoreError> {
    let metadata: String = row.try_get("metadata")?;
    Ok(DocumentRecord {
        id: row.try_get("id")?,
        locator: row.try_get("locator")?,
        categories: split_categories(row.try_get("categories")?),
        metadata: serde_json::from_str(&metadata)?,
        status: parse_status(row.try_get("processing_status")?)?,
        suitability_score: row.try_get("suitability_score")?,
        profile_artifact: row.try_get("profile_artifact")?,
        extraction_artifact: row.try_get("extraction_artifact")?,
        created_at: row.try_get("created_at")?,
    })
}

fn cot_set_from_row(row: &SqliteRow) -> Result<CotSetRecord, StoreError> {
    Ok(CotSetRecord {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        extraction_index: row.try_get("extraction_index")?,
        status: parse_status(row.try_get("processing_status")?)?,
        quality_score: row.try_get("quality_score")?,
        voice_score: row.try_get("voice_score")?,
        extraction_artifact: row.try_get("extraction_artifact")?,
        critique_artifact: row.try_get("critique_artifact")?,
        refinement_artifact: row.try_get("refinement_artifact")?,
        quality_assessment_artifact: row.try_get("quality_assessment_artifact")?,
        voicing_artifact: row.try_get("voicing_artifact")?,
        voicing_assessment_artifact: row.try_get("voicing_assessment_artifact")?,
        created_at: row.try_get("created_at")?,
    })
}
