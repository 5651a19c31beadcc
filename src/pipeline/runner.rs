//! Stage runner: one stage, one record, inside a failure boundary.
//!
//! The runner performs the stage's single collaborator call, writes the
//! artifact and commits the transition. Anything that goes wrong with the
//! record itself (model errors after retries, malformed output, unreadable
//! upstream artifacts, text extraction errors) comes back as a
//! [`OutcomeStatus::Failed`] outcome without touching the store. Only
//! infrastructure errors escape as [`PipelineError`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use super::config::{PipelineConfig, TemplateNames};
use super::gate::{is_eligible, next_status, OutcomeKind, Stage, StageConfig, StageKind};
use super::orchestrator::PipelineError;
use super::retry::RetryPolicy;
use super::status::{RecordId, ScoreField, Status};
use crate::collaborators::{ModelInvoker, ScoreParser, TemplateVars, TextExtractor};
use crate::scoring::RubricScorer;
use crate::storage::artifacts::{Artifact, ArtifactRef, ArtifactWriter};
use crate::storage::records::{
    CotSetRecord, DocumentRecord, NewCotSet, RecordSnapshot, RecordStore, StoreError,
    TransitionUpdate,
};
use crate::utils::tagged::{
    extract_results, parse_cot, parse_critique, parse_extraction, parse_voiced, CotTriple,
    VoicedCot,
};

/// How a stage run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Why a record was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Not at the stage's input status.
    Ineligible,
    /// At the input status but below the score threshold.
    Gated,
    /// Another writer moved the record first.
    Stale,
}

/// Result of running one stage on one record.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub record: RecordId,
    pub stage: Stage,
    pub status: OutcomeStatus,
    /// Status committed by this run, if any.
    pub new_status: Option<Status>,
    pub score: Option<i64>,
    pub artifact: Option<ArtifactRef>,
    /// Raw model response; kept on failures for the failure artifact.
    #[serde(skip)]
    pub artifact_text: Option<String>,
    pub error: Option<String>,
    pub skip_reason: Option<SkipReason>,
    /// CoT sets created by an extraction.
    pub spawned: usize,
}

impl Outcome {
    fn new(record: RecordId, stage: Stage, status: OutcomeStatus) -> Self {
        Self {
            record,
            stage,
            status,
            new_status: None,
            score: None,
            artifact: None,
            artifact_text: None,
            error: None,
            skip_reason: None,
            spawned: 0,
        }
    }

    pub(crate) fn skipped(record: RecordId, stage: Stage, reason: SkipReason) -> Self {
        let mut outcome = Self::new(record, stage, OutcomeStatus::Skipped);
        outcome.skip_reason = Some(reason);
        outcome
    }

    fn failed(record: RecordId, stage: Stage, failure: StageFailure) -> Self {
        let mut outcome = Self::new(record, stage, OutcomeStatus::Failed);
        outcome.error = Some(failure.message);
        outcome.artifact_text = failure.response;
        outcome
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Succeeded
    }
}

/// A record-level failure: message plus the model response, when there was one.
#[derive(Debug)]
struct StageFailure {
    message: String,
    response: Option<String>,
}

/// Internal error type for stage work.
#[derive(Debug)]
enum WorkError {
    Failed(StageFailure),
    Fatal(PipelineError),
}

impl WorkError {
    fn failed(message: impl Into<String>) -> Self {
        WorkError::Failed(StageFailure {
            message: message.into(),
            response: None,
        })
    }

    fn malformed(message: impl std::fmt::Display, response: &str) -> Self {
        WorkError::Failed(StageFailure {
            message: format!("Malformed model output: {}", message),
            response: Some(response.to_string()),
        })
    }
}

impl From<StoreError> for WorkError {
    fn from(err: StoreError) -> Self {
        WorkError::Fatal(PipelineError::Store(err))
    }
}

/// Product of successful stage work, before it is persisted.
#[derive(Debug, Default)]
struct StageWork {
    /// Artifact body (invoke stages).
    response: Option<String>,
    score: Option<i64>,
    /// Number of CoT sets to spawn (extraction).
    spawn: usize,
    metadata: BTreeMap<String, String>,
}

/// Score parsers for the three score stages.
#[derive(Clone)]
pub struct Scorers {
    pub profiling: Arc<dyn ScoreParser>,
    pub quality: Arc<dyn ScoreParser>,
    pub voicing: Arc<dyn ScoreParser>,
}

impl Scorers {
    /// Rubric scorers built from the configured rubrics.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            profiling: Arc::new(RubricScorer::new(config.rubrics.profiling.clone())),
            quality: Arc::new(RubricScorer::new(config.rubrics.quality.clone())),
            voicing: Arc::new(RubricScorer::new(config.rubrics.voicing.clone())),
        }
    }

    fn for_field(&self, field: ScoreField) -> &Arc<dyn ScoreParser> {
        match field {
            ScoreField::Suitability => &self.profiling,
            ScoreField::Quality => &self.quality,
            ScoreField::Voice => &self.voicing,
        }
    }
}

/// Runs single stages against single records.
#[derive(Clone)]
pub struct StageRunner {
    store: RecordStore,
    artifacts: ArtifactWriter,
    extractor: Arc<dyn TextExtractor>,
    invoker: Arc<dyn ModelInvoker>,
    scorers: Scorers,
    retry: RetryPolicy,
    templates: TemplateNames,
}

impl StageRunner {
    /// Creates a runner using the rubrics, retry policy and template names of `config`.
    pub fn new(
        store: RecordStore,
        artifacts: ArtifactWriter,
        extractor: Arc<dyn TextExtractor>,
        invoker: Arc<dyn ModelInvoker>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            store,
            artifacts,
            extractor,
            invoker,
            scorers: Scorers::from_config(config),
            retry: config.retry.clone(),
            templates: config.templates.clone(),
        }
    }

    pub fn with_scorers(mut self, scorers: Scorers) -> Self {
        self.scorers = scorers;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn artifacts(&self) -> &ArtifactWriter {
        &self.artifacts
    }

    pub fn invoker(&self) -> &Arc<dyn ModelInvoker> {
        &self.invoker
    }

    pub fn templates(&self) -> &TemplateNames {
        &self.templates
    }

    /// Runs `config.stage` on `record`.
    pub async fn run(
        &self,
        record: &RecordSnapshot,
        config: &StageConfig,
    ) -> Result<Outcome, PipelineError> {
        let rule = config.rule();
        let id = record.id();

        if !is_eligible(record, config) {
            let reason = if id.subject == rule.subject && record.status() == rule.input {
                SkipReason::Gated
            } else {
                SkipReason::Ineligible
            };
            tracing::debug!(record = %id, stage = %rule.stage, reason = ?reason, "Record skipped");
            return Ok(Outcome::skipped(id, rule.stage, reason));
        }

        let work = match rule.kind {
            StageKind::Invoke => self.invoke_stage(rule.stage, record).await,
            StageKind::Score => self.score_stage(rule.stage, record).await,
        };
        let work = match work {
            Ok(work) => work,
            Err(WorkError::Fatal(err)) => return Err(err),
            Err(WorkError::Failed(failure)) => {
                tracing::warn!(
                    record = %id,
                    stage = %rule.stage,
                    error = %failure.message,
                    "Stage failed"
                );
                return Ok(Outcome::failed(id, rule.stage, failure));
            }
        };

        let new_status = next_status(record, config, OutcomeKind::Success)?;
        let mut update = TransitionUpdate::new();
        let mut artifact = None;

        if let Some(body) = &work.response {
            let mut metadata = work.metadata.clone();
            metadata.insert("outcome".to_string(), "success".to_string());
            let reference = self
                .artifacts
                .write(id, rule.stage, &metadata, body)
                .await?;
            if let Some(slot) = rule.artifact {
                update = update.with_artifact(slot, reference.as_str());
            }
            for index in 0..work.spawn {
                update = update.with_spawn(NewCotSet {
                    extraction_index: index as i64,
                    extraction_artifact: reference.as_str().to_string(),
                });
            }
            artifact = Some(reference);
        }
        if let (Some(field), Some(score)) = (rule.writes, work.score) {
            update = update.with_score(field, score);
        }

        match self
            .store
            .commit_transition(id, rule.input, new_status, &update)
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_stale() => {
                tracing::info!(
                    record = %id,
                    stage = %rule.stage,
                    orphan = ?artifact.as_ref().map(ArtifactRef::as_str),
                    "Record changed concurrently, skipping"
                );
                return Ok(Outcome::skipped(id, rule.stage, SkipReason::Stale));
            }
            Err(err) => return Err(err.into()),
        }

        tracing::info!(
            record = %id,
            stage = %rule.stage,
            status = %new_status,
            score = ?work.score,
            spawned = work.spawn,
            "Stage succeeded"
        );

        let mut outcome = Outcome::new(id, rule.stage, OutcomeStatus::Succeeded);
        outcome.new_status = Some(new_status);
        outcome.score = work.score;
        outcome.artifact = artifact;
        outcome.artifact_text = work.response;
        outcome.spawned = work.spawn;
        Ok(outcome)
    }

    // ===== Invoke stages =====

    async fn invoke_stage(
        &self,
        stage: Stage,
        record: &RecordSnapshot,
    ) -> Result<StageWork, WorkError> {
        let template = self
            .templates
            .for_stage(stage)
            .ok_or_else(|| WorkError::failed(format!("no template configured for '{}'", stage)))?
            .to_string();

        let mut vars = TemplateVars::new();
        let mut metadata = BTreeMap::new();
        metadata.insert("template".to_string(), template.clone());

        match record {
            RecordSnapshot::Document(doc) => {
                vars.insert("paper".to_string(), self.paper_text(doc).await?);
                metadata.insert("locator".to_string(), doc.locator.clone());
            }
            RecordSnapshot::CotSet(cot) => {
                metadata.insert("document_id".to_string(), cot.document_id.to_string());
                metadata.insert(
                    "extraction_index".to_string(),
                    cot.extraction_index.to_string(),
                );
                self.cot_variables(stage, cot, &mut vars).await?;
            }
        }

        let response = self.call_model(stage, &template, &vars).await?;
        let mut work = StageWork {
            metadata,
            ..StageWork::default()
        };

        // Reject structurally unusable output now, while the response is at hand.
        match stage {
            Stage::Profile => self.validate_score(ScoreField::Suitability, &response)?,
            Stage::Extract => {
                let triples =
                    parse_extraction(&response).map_err(|e| WorkError::malformed(e, &response))?;
                work.spawn = triples.len();
                work.metadata
                    .insert("cot_sets".to_string(), triples.len().to_string());
            }
            Stage::Critique => {
                parse_critique(&response).map_err(|e| WorkError::malformed(e, &response))?;
            }
            Stage::Refine => {
                extract_results(&response)
                    .and_then(|section| parse_cot(section, true))
                    .map_err(|e| WorkError::malformed(e, &response))?;
            }
            Stage::AssessQuality => self.validate_score(ScoreField::Quality, &response)?,
            Stage::Voice => {
                parse_voiced(&response).map_err(|e| WorkError::malformed(e, &response))?;
            }
            Stage::AssessVoicing => self.validate_score(ScoreField::Voice, &response)?,
            Stage::ScoreProfile | Stage::ScoreQuality | Stage::ScoreVoicing => {}
        }

        work.response = Some(response);
        Ok(work)
    }

    async fn call_model(
        &self,
        stage: Stage,
        template: &str,
        vars: &TemplateVars,
    ) -> Result<String, WorkError> {
        self.retry
            .run(stage.as_str(), || self.invoker.invoke(template, vars))
            .await
            .map_err(|e| WorkError::failed(format!("Model invocation failed: {}", e)))
    }

    fn validate_score(&self, field: ScoreField, response: &str) -> Result<(), WorkError> {
        self.scorers
            .for_field(field)
            .parse_score(response)
            .map(|_| ())
            .map_err(|e| WorkError::malformed(e, response))
    }

    /// Fills the template variables a CoT stage needs from upstream artifacts.
    async fn cot_variables(
        &self,
        stage: Stage,
        cot: &CotSetRecord,
        vars: &mut TemplateVars,
    ) -> Result<(), WorkError> {
        let needs_paper = stage != Stage::AssessVoicing;
        if needs_paper {
            let doc = self.store.get_document(cot.document_id).await?.ok_or_else(|| {
                WorkError::failed(format!("source document {} not found", cot.document_id))
            })?;
            vars.insert("paper".to_string(), self.paper_text(&doc).await?);
        }

        let triple = match stage {
            Stage::Critique | Stage::Refine => self.extracted_triple(cot).await?,
            _ => self.refined_triple(cot).await?,
        };
        insert_triple(vars, &triple);

        if stage == Stage::Refine {
            let critique = self
                .read_upstream(cot.critique_artifact.as_deref(), "critique")
                .await?;
            let text = parse_critique(&critique.body)
                .map_err(|e| WorkError::failed(format!("Unreadable critique artifact: {}", e)))?;
            vars.insert("critique".to_string(), text);
        }

        if stage == Stage::AssessVoicing {
            let voiced = self.voiced(cot).await?;
            vars.insert(
                "voiced_chain_of_reasoning".to_string(),
                voiced.chain_of_reasoning,
            );
            vars.insert("voiced_answer".to_string(), voiced.answer);
        }
        Ok(())
    }

    async fn paper_text(&self, doc: &DocumentRecord) -> Result<String, WorkError> {
        self.extractor
            .extract_text(&doc.locator)
            .await
            .map_err(|e| WorkError::failed(format!("Text extraction failed: {}", e)))
    }

    async fn extracted_triple(&self, cot: &CotSetRecord) -> Result<CotTriple, WorkError> {
        let artifact = self
            .read_upstream(cot.extraction_artifact.as_deref(), "extraction")
            .await?;
        let mut triples = parse_extraction(&artifact.body)
            .map_err(|e| WorkError::failed(format!("Unreadable extraction artifact: {}", e)))?;
        let index = usize::try_from(cot.extraction_index).unwrap_or(usize::MAX);
        if index >= triples.len() {
            return Err(WorkError::failed(format!(
                "extraction artifact has no candidate {}",
                cot.extraction_index
            )));
        }
        Ok(triples.swap_remove(index))
    }

    async fn refined_triple(&self, cot: &CotSetRecord) -> Result<CotTriple, WorkError> {
        let artifact = self
            .read_upstream(cot.refinement_artifact.as_deref(), "refinement")
            .await?;
        extract_results(&artifact.body)
            .and_then(|section| parse_cot(section, true))
            .map_err(|e| WorkError::failed(format!("Unreadable refinement artifact: {}", e)))
    }

    async fn voiced(&self, cot: &CotSetRecord) -> Result<VoicedCot, WorkError> {
        let artifact = self
            .read_upstream(cot.voicing_artifact.as_deref(), "voicing")
            .await?;
        parse_voiced(&artifact.body)
            .map_err(|e| WorkError::failed(format!("Unreadable voicing artifact: {}", e)))
    }

    async fn read_upstream(
        &self,
        reference: Option<&str>,
        what: &str,
    ) -> Result<Artifact, WorkError> {
        let reference = reference
            .ok_or_else(|| WorkError::failed(format!("missing {} artifact reference", what)))?;
        self.artifacts
            .read(&ArtifactRef::from(reference))
            .await
            .map_err(|e| WorkError::failed(format!("Unreadable {} artifact: {}", what, e)))
    }

    // ===== Score stages =====

    async fn score_stage(
        &self,
        stage: Stage,
        record: &RecordSnapshot,
    ) -> Result<StageWork, WorkError> {
        let field = stage
            .rule()
            .writes
            .ok_or_else(|| WorkError::failed(format!("stage '{}' writes no score", stage)))?;
        let (reference, what) = match (stage, record) {
            (Stage::ScoreProfile, RecordSnapshot::Document(doc)) => {
                (doc.profile_artifact.as_deref(), "profile")
            }
            (Stage::ScoreQuality, RecordSnapshot::CotSet(cot)) => {
                (cot.quality_assessment_artifact.as_deref(), "quality assessment")
            }
            (Stage::ScoreVoicing, RecordSnapshot::CotSet(cot)) => {
                (cot.voicing_assessment_artifact.as_deref(), "voicing assessment")
            }
            _ => {
                return Err(WorkError::failed(format!(
                    "stage '{}' cannot score {}",
                    stage,
                    record.id()
                )))
            }
        };

        let assessment = self.read_upstream(reference, what).await?;
        let score = self
            .scorers
            .for_field(field)
            .parse_score(&assessment.body)
            .map_err(|e| WorkError::failed(format!("Scoring failed: {}", e)))?;

        Ok(StageWork {
            score: Some(score),
            ..StageWork::default()
        })
    }
}

fn insert_triple(vars: &mut TemplateVars, triple: &CotTriple) {
    vars.insert(
        "question".to_string(),
        triple.question.clone().unwrap_or_default(),
    );
    vars.insert(
        "chain_of_reasoning".to_string(),
        triple.chain_of_reasoning.clone(),
    );
    vars.insert("answer".to_string(), triple.answer.clone());
}
