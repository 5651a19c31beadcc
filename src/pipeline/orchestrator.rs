//! Batch orchestration over the stage runner.
//!
//! The orchestrator selects eligible records, hands each to the
//! [`StageRunner`] and turns record-level failures into data: a failure
//! artifact plus the stage's failure status. One bad record never aborts a
//! batch; only configuration and infrastructure errors do.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use super::config::{ConfigError, PipelineConfig};
use super::gate::{is_eligible, next_status, GateError, OrderBy, OutcomeKind, Stage, StageConfig};
use super::runner::{Outcome, OutcomeStatus, SkipReason, StageRunner};
use super::status::Status;
use crate::storage::artifacts::ArtifactError;
use crate::storage::records::{EligibleFilter, RecordSnapshot, StoreError, TransitionUpdate};

/// Errors that abort a batch.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Record store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Artifact storage error.
    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    /// A record was handed to a stage that cannot accept it.
    #[error("Gate error: {0}")]
    Gate(#[from] GateError),
}

/// Summary of one stage batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub stage: Stage,
    pub order_by: OrderBy,
    pub selected: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
}

impl BatchResult {
    fn new(stage: Stage, order_by: OrderBy) -> Self {
        Self {
            stage,
            order_by,
            selected: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            cancelled: false,
        }
    }

    fn record(&mut self, outcome: &Outcome) {
        self.selected += 1;
        match outcome.status {
            OutcomeStatus::Succeeded => self.succeeded += 1,
            OutcomeStatus::Failed => self.failed += 1,
            OutcomeStatus::Skipped => self.skipped += 1,
        }
    }
}

/// Summary of a full pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub order_by: OrderBy,
    /// One entry per stage, in stage order.
    pub stages: Vec<BatchResult>,
    pub documents_processed: usize,
    pub cot_sets_completed: usize,
    /// Records that stopped at a score gate.
    pub gated: usize,
    pub cancelled: bool,
}

impl PipelineReport {
    pub fn stage(&self, stage: Stage) -> Option<&BatchResult> {
        self.stages.iter().find(|result| result.stage == stage)
    }

    pub fn total_failed(&self) -> usize {
        self.stages.iter().map(|result| result.failed).sum()
    }
}

const DOCUMENT_STAGES: [Stage; 3] = [Stage::Profile, Stage::ScoreProfile, Stage::Extract];

const COT_STAGES: [Stage; 7] = [
    Stage::Critique,
    Stage::Refine,
    Stage::AssessQuality,
    Stage::ScoreQuality,
    Stage::Voice,
    Stage::AssessVoicing,
    Stage::ScoreVoicing,
];

/// Where a record's progression through several stages ended.
enum Progress {
    Advanced(RecordSnapshot),
    Stopped,
    Gated,
}

/// Drives batches of records through the stage runner.
pub struct BatchOrchestrator {
    runner: StageRunner,
    config: PipelineConfig,
    cancel: Arc<AtomicBool>,
}

impl BatchOrchestrator {
    pub fn new(runner: StageRunner, config: PipelineConfig) -> Self {
        Self {
            runner,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shares an externally owned cancellation flag.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Flag that stops the batch before the next record when set.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn runner(&self) -> &StageRunner {
        &self.runner
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Validates the configuration and the templates `stages` need.
    fn preflight(&self, stages: &[Stage]) -> Result<(), PipelineError> {
        self.config.validate()?;
        for stage in stages {
            if let Some(template) = self.runner.templates().for_stage(*stage) {
                if !self.runner.invoker().has_template(template) {
                    return Err(ConfigError::ValidationFailed(format!(
                        "template '{}' for stage '{}' is not available",
                        template, stage
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Runs one stage over up to `limit` eligible records.
    pub async fn run_stage(
        &self,
        stage: Stage,
        order_by: OrderBy,
        limit: usize,
    ) -> Result<BatchResult, PipelineError> {
        self.preflight(&[stage])?;
        let stage_config = self.config.stage_config(stage)?;

        let mut filter = EligibleFilter::new();
        if let Some(min) = stage_config.min_score {
            filter = filter.with_min_score(min);
        }
        let records = self
            .runner
            .store()
            .fetch_eligible(stage, &filter, order_by, limit)
            .await?;

        tracing::info!(
            stage = %stage,
            order_by = %order_by,
            selected = records.len(),
            "Starting stage batch"
        );

        let mut result = BatchResult::new(stage, order_by);
        for record in &records {
            if self.is_cancelled() {
                tracing::warn!(stage = %stage, processed = result.selected, "Batch cancelled");
                result.cancelled = true;
                break;
            }
            let outcome = self.process(record, &stage_config).await?;
            result.record(&outcome);
        }

        tracing::info!(
            stage = %stage,
            succeeded = result.succeeded,
            failed = result.failed,
            skipped = result.skipped,
            "Stage batch finished"
        );
        Ok(result)
    }

    /// Takes up to `limit` pending documents through every stage.
    pub async fn run_pipeline(
        &self,
        order_by: OrderBy,
        limit: usize,
    ) -> Result<PipelineReport, PipelineError> {
        self.preflight(&Stage::ALL)?;
        let configs = Stage::ALL
            .iter()
            .map(|stage| Ok((*stage, self.config.stage_config(*stage)?)))
            .collect::<Result<BTreeMap<Stage, StageConfig>, ConfigError>>()?;

        let documents = self
            .runner
            .store()
            .fetch_eligible(Stage::Profile, &EligibleFilter::new(), order_by, limit)
            .await?;

        tracing::info!(
            order_by = %order_by,
            documents = documents.len(),
            "Starting full pipeline run"
        );

        let mut report = PipelineReport {
            order_by,
            stages: Stage::ALL
                .iter()
                .map(|stage| BatchResult::new(*stage, order_by))
                .collect(),
            documents_processed: 0,
            cot_sets_completed: 0,
            gated: 0,
            cancelled: false,
        };

        'documents: for document in documents {
            if self.is_cancelled() {
                report.cancelled = true;
                break;
            }
            report.documents_processed += 1;
            let document_id = document.id().id;

            match self
                .advance(document, &DOCUMENT_STAGES, &configs, &mut report)
                .await?
            {
                Progress::Advanced(_) => {}
                Progress::Gated => {
                    report.gated += 1;
                    continue;
                }
                Progress::Stopped => continue,
            }

            let cot_sets = self
                .runner
                .store()
                .cot_sets_for_document(document_id)
                .await?;
            for cot_set in cot_sets {
                if cot_set.status != Status::Extracted {
                    continue;
                }
                if self.is_cancelled() {
                    report.cancelled = true;
                    break 'documents;
                }
                match self
                    .advance(
                        RecordSnapshot::CotSet(cot_set),
                        &COT_STAGES,
                        &configs,
                        &mut report,
                    )
                    .await?
                {
                    Progress::Advanced(record) if record.status() == Status::VoicingScored => {
                        report.cot_sets_completed += 1;
                    }
                    Progress::Gated => report.gated += 1,
                    Progress::Advanced(_) | Progress::Stopped => {}
                }
            }
        }

        if report.cancelled {
            tracing::warn!(
                documents_processed = report.documents_processed,
                "Pipeline run cancelled"
            );
        }
        tracing::info!(
            documents_processed = report.documents_processed,
            cot_sets_completed = report.cot_sets_completed,
            gated = report.gated,
            failed = report.total_failed(),
            "Pipeline run finished"
        );
        Ok(report)
    }

    /// Moves one record through `stages` until it finishes or stops.
    async fn advance(
        &self,
        mut record: RecordSnapshot,
        stages: &[Stage],
        configs: &BTreeMap<Stage, StageConfig>,
        report: &mut PipelineReport,
    ) -> Result<Progress, PipelineError> {
        for stage in stages {
            let Some(stage_config) = configs.get(stage) else {
                return Ok(Progress::Stopped);
            };
            if !is_eligible(&record, stage_config) {
                if record.status() == stage_config.rule().input {
                    tracing::info!(
                        record = %record.id(),
                        stage = %stage,
                        "Record stopped at score gate"
                    );
                    return Ok(Progress::Gated);
                }
                return Ok(Progress::Stopped);
            }

            let outcome = self.process(&record, stage_config).await?;
            if let Some(result) = report.stages.iter_mut().find(|r| r.stage == *stage) {
                result.record(&outcome);
            }
            if !outcome.is_success() {
                return Ok(Progress::Stopped);
            }

            record = match self.runner.store().get(record.id()).await? {
                Some(fresh) => fresh,
                None => return Ok(Progress::Stopped),
            };
        }
        Ok(Progress::Advanced(record))
    }

    /// Runs one record and persists a failure if the stage failed.
    async fn process(
        &self,
        record: &RecordSnapshot,
        stage_config: &StageConfig,
    ) -> Result<Outcome, PipelineError> {
        let outcome = self.runner.run(record, stage_config).await?;
        if outcome.status != OutcomeStatus::Failed {
            return Ok(outcome);
        }
        self.record_failure(record, stage_config, outcome).await
    }

    async fn record_failure(
        &self,
        record: &RecordSnapshot,
        stage_config: &StageConfig,
        mut outcome: Outcome,
    ) -> Result<Outcome, PipelineError> {
        let rule = stage_config.rule();
        let id = record.id();
        let failure_status = next_status(record, stage_config, OutcomeKind::Failure)?;

        let error = outcome.error.clone().unwrap_or_default();
        let mut body = error.clone();
        if let Some(response) = &outcome.artifact_text {
            body.push_str("\n\n--- response ---\n");
            body.push_str(response);
        }
        let mut metadata = BTreeMap::new();
        metadata.insert("outcome".to_string(), "failure".to_string());
        metadata.insert("error".to_string(), error);

        let reference = self
            .runner
            .artifacts()
            .write(id, rule.stage, &metadata, &body)
            .await?;

        let mut update = TransitionUpdate::new();
        if let Some(slot) = rule.artifact {
            update = update.with_artifact(slot, reference.as_str());
        }

        match self
            .runner
            .store()
            .commit_transition(id, rule.input, failure_status, &update)
            .await
        {
            Ok(()) => {
                outcome.new_status = Some(failure_status);
                outcome.artifact = Some(reference);
                Ok(outcome)
            }
            Err(err) if err.is_stale() => {
                tracing::info!(record = %id, stage = %rule.stage, "Failure commit lost a race");
                Ok(Outcome::skipped(id, rule.stage, SkipReason::Stale))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{CandidateDocument, ModelInvoker, TemplateVars, TextExtractor};
    use crate::error::{ExtractionError, InvocationError};
    use crate::pipeline::retry::RetryPolicy;
    use crate::storage::artifacts::{ArtifactRef, ArtifactWriter};
    use crate::storage::records::RecordStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StaticExtractor;

    #[async_trait]
    impl TextExtractor for StaticExtractor {
        async fn extract_text(&self, locator: &str) -> Result<String, ExtractionError> {
            if locator.contains("broken") {
                return Err(ExtractionError::NotText {
                    locator: locator.to_string(),
                });
            }
            Ok(format!("Full text of {}", locator))
        }
    }

    /// Answers each template with a canned response.
    struct CannedInvoker {
        responses: BTreeMap<String, String>,
        calls: Mutex<Vec<String>>,
    }

    impl CannedInvoker {
        fn new(pairs: &[(&str, String)]) -> Self {
            Self {
                responses: pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ModelInvoker for CannedInvoker {
        async fn invoke(
            &self,
            template_name: &str,
            _variables: &TemplateVars,
        ) -> Result<String, InvocationError> {
            self.calls.lock().unwrap().push(template_name.to_string());
            self.responses
                .get(template_name)
                .cloned()
                .ok_or_else(|| InvocationError::UnknownTemplate(template_name.to_string()))
        }

        fn has_template(&self, template_name: &str) -> bool {
            self.responses.contains_key(template_name)
        }
    }

    fn rubric_answer(criteria: &[&str], yes: usize) -> String {
        let tags: String = criteria
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let value = if i < yes { "yes" } else { "no" };
                format!("<{c}>{value}</{c}>")
            })
            .collect();
        format!("<results>{}</results>", tags)
    }

    fn profile_answer(yes: usize) -> String {
        let rubric = crate::scoring::Rubric::profiling();
        let criteria: Vec<&str> = rubric.criteria.iter().map(String::as_str).collect();
        rubric_answer(&criteria, yes)
    }

    async fn setup(invoker: CannedInvoker) -> (tempfile::TempDir, BatchOrchestrator) {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open_in_memory().await.unwrap();
        let config = PipelineConfig::default()
            .with_artifact_root(dir.path().join("artifacts"))
            .with_retry(RetryPolicy::no_retry());
        let runner = StageRunner::new(
            store,
            ArtifactWriter::new(dir.path().join("artifacts")),
            Arc::new(StaticExtractor),
            Arc::new(invoker),
            &config,
        );
        (dir, BatchOrchestrator::new(runner, config))
    }

    async fn ingest(orchestrator: &BatchOrchestrator, locators: &[&str]) {
        let candidates: Vec<CandidateDocument> = locators
            .iter()
            .map(|l| CandidateDocument {
                locator: l.to_string(),
                categories: vec!["cs.CL".to_string()],
                metadata: serde_json::json!({}),
            })
            .collect();
        orchestrator
            .runner()
            .store()
            .register_documents(&candidates)
            .await
            .unwrap();
    }

    fn all_templates(profile: String) -> CannedInvoker {
        CannedInvoker::new(&[
            ("paper_profiling", profile),
            ("cot_extraction", String::new()),
            ("cot_critique", String::new()),
            ("cot_refinement", String::new()),
            ("cot_quality_assessment", String::new()),
            ("cot_voicing", String::new()),
            ("cot_voicing_assessment", String::new()),
        ])
    }

    #[tokio::test]
    async fn test_failed_record_is_persisted_with_artifact() {
        let (_dir, orchestrator) = setup(all_templates(profile_answer(10))).await;
        ingest(&orchestrator, &["a.txt", "broken.txt", "c.txt"]).await;

        let result = orchestrator
            .run_stage(Stage::Profile, OrderBy::Identity, 10)
            .await
            .unwrap();
        assert_eq!(result.selected, 3);
        assert_eq!(result.succeeded, 2);
        assert_eq!(result.failed, 1);
        assert!(!result.cancelled);

        let store = orchestrator.runner().store();
        let failed = store.get_document(2).await.unwrap().unwrap();
        assert_eq!(failed.status, Status::FailedProfiling);
        let reference = failed.profile_artifact.expect("failure artifact recorded");
        let artifact = orchestrator
            .runner()
            .artifacts()
            .read(&ArtifactRef::from(reference))
            .await
            .unwrap();
        assert_eq!(artifact.get("outcome"), Some("failure"));
        assert!(artifact.body.contains("Text extraction failed"));

        assert_eq!(
            store.get_document(3).await.unwrap().unwrap().status,
            Status::Profiled
        );
    }

    #[tokio::test]
    async fn test_malformed_output_keeps_response_in_failure_artifact() {
        let (_dir, orchestrator) =
            setup(all_templates("I cannot answer that.".to_string())).await;
        ingest(&orchestrator, &["a.txt"]).await;

        let result = orchestrator
            .run_stage(Stage::Profile, OrderBy::Identity, 10)
            .await
            .unwrap();
        assert_eq!(result.failed, 1);

        let doc = orchestrator
            .runner()
            .store()
            .get_document(1)
            .await
            .unwrap()
            .unwrap();
        let artifact = orchestrator
            .runner()
            .artifacts()
            .read(&ArtifactRef::from(doc.profile_artifact.unwrap()))
            .await
            .unwrap();
        assert!(artifact.body.contains("I cannot answer that."));
    }

    #[tokio::test]
    async fn test_invalid_config_aborts_before_selection() {
        let (_dir, mut orchestrator) = setup(all_templates(profile_answer(10))).await;
        ingest(&orchestrator, &["a.txt"]).await;
        orchestrator.config.batch_limit = 0;

        let err = orchestrator
            .run_stage(Stage::Profile, OrderBy::Identity, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert_eq!(
            orchestrator
                .runner()
                .store()
                .get_document(1)
                .await
                .unwrap()
                .unwrap()
                .status,
            Status::Pending
        );
    }

    #[tokio::test]
    async fn test_missing_template_is_config_error() {
        let (_dir, orchestrator) =
            setup(CannedInvoker::new(&[("paper_profiling", profile_answer(10))])).await;
        assert!(orchestrator
            .run_stage(Stage::Profile, OrderBy::Identity, 10)
            .await
            .is_ok());
        let err = orchestrator
            .run_stage(Stage::Extract, OrderBy::Identity, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(ConfigError::ValidationFailed(_))));
    }

    #[tokio::test]
    async fn test_cancel_flag_stops_between_records() {
        let (_dir, orchestrator) = setup(all_templates(profile_answer(10))).await;
        ingest(&orchestrator, &["a.txt", "b.txt"]).await;
        orchestrator.cancel_flag().store(true, Ordering::SeqCst);

        let result = orchestrator
            .run_stage(Stage::Profile, OrderBy::Identity, 10)
            .await
            .unwrap();
        assert!(result.cancelled);
        assert_eq!(result.selected, 0);
    }

    #[tokio::test]
    async fn test_pipeline_stops_at_suitability_gate() {
        let (_dir, orchestrator) = setup(all_templates(profile_answer(7))).await;
        ingest(&orchestrator, &["a.txt"]).await;

        let report = orchestrator
            .run_pipeline(OrderBy::Identity, 10)
            .await
            .unwrap();
        assert_eq!(report.documents_processed, 1);
        assert_eq!(report.gated, 1);
        assert_eq!(report.cot_sets_completed, 0);
        assert_eq!(report.stage(Stage::ScoreProfile).unwrap().succeeded, 1);
        assert_eq!(report.stage(Stage::Extract).unwrap().selected, 0);

        let doc = orchestrator
            .runner()
            .store()
            .get_document(1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.status, Status::ProfileScored);
        assert_eq!(doc.suitability_score, Some(7));
    }
}
