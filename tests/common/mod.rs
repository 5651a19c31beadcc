//! In-process collaborators shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use paper_cot_forge::collaborators::{CandidateDocument, ModelInvoker, TemplateVars, TextExtractor};
use paper_cot_forge::error::{ExtractionError, InvocationError};
use paper_cot_forge::pipeline::{BatchOrchestrator, PipelineConfig, RetryPolicy, StageRunner};
use paper_cot_forge::scoring::Rubric;
use paper_cot_forge::storage::{ArtifactWriter, RecordStore};

pub const TEMPLATES: [&str; 7] = [
    "paper_profiling",
    "cot_extraction",
    "cot_critique",
    "cot_refinement",
    "cot_quality_assessment",
    "cot_voicing",
    "cot_voicing_assessment",
];

/// Returns the text of every locator except those containing "unreadable".
pub struct FakeExtractor;

#[async_trait]
impl TextExtractor for FakeExtractor {
    async fn extract_text(&self, locator: &str) -> Result<String, ExtractionError> {
        if locator.contains("unreadable") {
            return Err(ExtractionError::NotFound(locator.to_string()));
        }
        Ok(format!("Paper {}", locator))
    }
}

type Responder = dyn Fn(&str, &TemplateVars) -> Result<String, InvocationError> + Send + Sync;

/// Model stand-in driven by a closure over template name and variables.
pub struct ScriptedInvoker {
    respond: Box<Responder>,
    pub calls: AtomicU32,
}

impl ScriptedInvoker {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&str, &TemplateVars) -> Result<String, InvocationError> + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(respond),
            calls: AtomicU32::new(0),
        }
    }

    /// Well-formed answers everywhere, with `sets` candidates per extraction.
    pub fn well_behaved(sets: usize) -> Self {
        Self::new(move |template, vars| Ok(default_response(template, vars, sets)))
    }
}

#[async_trait]
impl ModelInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        template_name: &str,
        variables: &TemplateVars,
    ) -> Result<String, InvocationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(template_name, variables)
    }

    fn has_template(&self, template_name: &str) -> bool {
        TEMPLATES.contains(&template_name)
    }
}

pub fn var<'a>(vars: &'a TemplateVars, key: &str) -> &'a str {
    vars.get(key).map(String::as_str).unwrap_or_default()
}

/// `<results>` block answering the first `yes` criteria with yes, the rest no.
pub fn rubric_answer(rubric: &Rubric, yes: usize) -> String {
    let tags: String = rubric
        .criteria
        .iter()
        .enumerate()
        .map(|(i, c)| format!("<{c}>{}</{c}>", if i < yes { "yes" } else { "no" }))
        .collect();
    format!("<results>{}</results>", tags)
}

pub fn extraction_response(sets: usize) -> String {
    (0..sets)
        .map(|i| {
            format!(
                "<results><question>Question {i}?</question>\
                 <chain_of_reasoning>Step A{i}. Step B{i}.</chain_of_reasoning>\
                 <answer>Answer {i}</answer></results>\n"
            )
        })
        .collect()
}

pub fn default_response(template: &str, vars: &TemplateVars, sets: usize) -> String {
    match template {
        "paper_profiling" => rubric_answer(&Rubric::profiling(), 10),
        "cot_extraction" => extraction_response(sets),
        "cot_critique" => "<results><critique>Step B skips a premise.</critique></results>".to_string(),
        "cot_refinement" => format!(
            "<results><question>{}</question>\
             <chain_of_reasoning>{} Refined.</chain_of_reasoning>\
             <answer>{}</answer></results>",
            var(vars, "question"),
            var(vars, "chain_of_reasoning"),
            var(vars, "answer")
        ),
        "cot_quality_assessment" => rubric_answer(&Rubric::quality(), 4),
        "cot_voicing" => format!(
            "<results><content><chain_of_reasoning>I think: {}</chain_of_reasoning>\
             <answer>{}</answer></content></results>",
            var(vars, "chain_of_reasoning"),
            var(vars, "answer")
        ),
        "cot_voicing_assessment" => rubric_answer(&Rubric::voicing(), 3),
        other => format!("unexpected template {}", other),
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub store: RecordStore,
    pub artifacts: ArtifactWriter,
    pub config: PipelineConfig,
    pub invoker: Arc<ScriptedInvoker>,
}

impl Harness {
    pub async fn new(invoker: ScriptedInvoker) -> Self {
        Self::with_config(invoker, PipelineConfig::default()).await
    }

    pub async fn with_config(invoker: ScriptedInvoker, config: PipelineConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = config
            .with_database_path(dir.path().join("pipeline.db"))
            .with_artifact_root(dir.path().join("artifacts"))
            .with_retry(RetryPolicy::no_retry());
        let store = RecordStore::open(&config.database_path).await.unwrap();
        let artifacts = ArtifactWriter::new(&config.artifact_root);
        Self {
            dir,
            store,
            artifacts,
            config,
            invoker: Arc::new(invoker),
        }
    }

    pub fn runner(&self) -> StageRunner {
        StageRunner::new(
            self.store.clone(),
            self.artifacts.clone(),
            Arc::new(FakeExtractor),
            self.invoker.clone(),
            &self.config,
        )
        .with_retry(self.config.retry.clone())
    }

    pub fn orchestrator(&self) -> BatchOrchestrator {
        BatchOrchestrator::new(self.runner(), self.config.clone())
    }

    pub async fn ingest(&self, locators: &[&str]) {
        let tagged: Vec<(&str, &str)> = locators.iter().map(|l| (*l, "")).collect();
        self.ingest_tagged(&tagged).await;
    }

    /// Registers `(locator, category)` pairs; an empty category means none.
    pub async fn ingest_tagged(&self, documents: &[(&str, &str)]) {
        let candidates: Vec<CandidateDocument> = documents
            .iter()
            .map(|(locator, category)| CandidateDocument {
                locator: locator.to_string(),
                categories: if category.is_empty() {
                    vec![]
                } else {
                    vec![category.to_string()]
                },
                metadata: serde_json::json!({ "title": locator }),
            })
            .collect();
        self.store.register_documents(&candidates).await.unwrap();
    }
}
