//! Corpus compilation from finished CoT sets.
//!
//! The compiler reads every CoT set at `voicing_scored`, applies the final
//! score thresholds, keeps the best `max_per_group` sets per dedup group and
//! writes the survivors as JSON Lines plus a YAML mirror. It never writes to
//! the record store, and the output carries no timestamps, so compiling the
//! same state twice yields byte-identical files.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::pipeline::config::ConfigError;
use crate::storage::artifacts::{ArtifactRef, ArtifactWriter};
use crate::storage::records::{CorpusCandidate, RecordStore, StoreError};
use crate::utils::tagged::{extract_results, parse_cot, parse_voiced};

/// Group key used for documents without categories.
pub const UNCATEGORIZED: &str = "uncategorized";

/// Errors that can occur while compiling a corpus.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What counts as a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupScope {
    /// CoT sets from the same document.
    Document,
    /// CoT sets whose documents share a primary category.
    Category,
}

impl DedupScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupScope::Document => "document",
            DedupScope::Category => "category",
        }
    }
}

impl fmt::Display for DedupScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DedupScope {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "document" | "paper" => Ok(DedupScope::Document),
            "category" => Ok(DedupScope::Category),
            other => Err(ConfigError::InvalidValue {
                key: "dedup_scope".to_string(),
                message: format!("expected document or category, got '{}'", other),
            }),
        }
    }
}

/// Shape of each emitted line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorpusFormat {
    /// `{question, reasoning, answer, provenance}`
    Record,
    /// `{messages: [system, user, assistant], provenance}`
    Chat,
}

impl CorpusFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorpusFormat::Record => "record",
            CorpusFormat::Chat => "chat",
        }
    }
}

impl fmt::Display for CorpusFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CorpusFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "record" => Ok(CorpusFormat::Record),
            "chat" => Ok(CorpusFormat::Chat),
            other => Err(ConfigError::InvalidValue {
                key: "format".to_string(),
                message: format!("expected record or chat, got '{}'", other),
            }),
        }
    }
}

/// Compilation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusSettings {
    pub dedup_scope: DedupScope,
    /// Sets kept per dedup group.
    pub max_per_group: usize,
    pub format: CorpusFormat,
    /// Share of records routed to the validation file, in `[0, 1)`.
    pub validation_fraction: f64,
    /// System message for the chat format.
    pub system_prompt: String,
}

impl Default for CorpusSettings {
    fn default() -> Self {
        Self {
            dedup_scope: DedupScope::Document,
            max_per_group: 1,
            format: CorpusFormat::Record,
            validation_fraction: 0.0,
            system_prompt: "Reason step by step before giving a final answer.".to_string(),
        }
    }
}

impl CorpusSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_per_group == 0 {
            return Err(ConfigError::ValidationFailed(
                "corpus.max_per_group must be greater than 0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.validation_fraction) {
            return Err(ConfigError::ValidationFailed(
                "corpus.validation_fraction must be in [0, 1)".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_dedup_scope(mut self, scope: DedupScope) -> Self {
        self.dedup_scope = scope;
        self
    }

    pub fn with_max_per_group(mut self, k: usize) -> Self {
        self.max_per_group = k;
        self
    }

    pub fn with_format(mut self, format: CorpusFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_validation_fraction(mut self, fraction: f64) -> Self {
        self.validation_fraction = fraction;
        self
    }
}

/// Where an emitted record came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Provenance {
    pub cot_set_id: i64,
    pub document_id: i64,
    pub locator: String,
    pub primary_category: String,
    pub quality_score: i64,
    pub voice_score: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// One line of the corpus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CorpusEntry {
    Record {
        question: String,
        reasoning: String,
        answer: String,
        provenance: Provenance,
    },
    Chat {
        messages: Vec<ChatMessage>,
        provenance: Provenance,
    },
}

impl CorpusEntry {
    pub fn provenance(&self) -> &Provenance {
        match self {
            CorpusEntry::Record { provenance, .. } | CorpusEntry::Chat { provenance, .. } => {
                provenance
            }
        }
    }
}

/// Counts and paths of one compilation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompileReport {
    /// CoT sets at `voicing_scored`.
    pub candidates: usize,
    /// Records in the main corpus file.
    pub written: usize,
    /// `below_threshold + deduplicated + unreadable`.
    pub excluded: usize,
    pub below_threshold: usize,
    pub deduplicated: usize,
    pub unreadable: usize,
    /// Records routed to the validation file.
    pub validation: usize,
    pub output: PathBuf,
    pub mirror: PathBuf,
    pub validation_output: Option<PathBuf>,
}

/// Builds the training corpus from finished CoT sets.
pub struct CorpusCompiler {
    store: RecordStore,
    artifacts: ArtifactWriter,
    settings: CorpusSettings,
}

impl CorpusCompiler {
    pub fn new(store: RecordStore, artifacts: ArtifactWriter, settings: CorpusSettings) -> Self {
        Self {
            store,
            artifacts,
            settings,
        }
    }

    pub fn settings(&self) -> &CorpusSettings {
        &self.settings
    }

    /// Compiles every qualifying CoT set into `output_path`.
    pub async fn compile(
        &self,
        min_quality: i64,
        min_voice: i64,
        output_path: impl AsRef<Path>,
    ) -> Result<CompileReport, CompileError> {
        self.settings.validate()?;
        let output_path = output_path.as_ref();

        let candidates = self.store.terminal_cot_sets().await?;
        let mut report = CompileReport {
            candidates: candidates.len(),
            output: output_path.to_path_buf(),
            mirror: output_path.with_extension("yaml"),
            ..CompileReport::default()
        };

        let (passing, below): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|c| passes_thresholds(c, min_quality, min_voice));
        report.below_threshold = below.len();

        let (mut kept, dropped) = select_per_group(
            passing,
            self.settings.dedup_scope,
            self.settings.max_per_group,
        );
        report.deduplicated = dropped;
        kept.sort_by_key(|c| (c.cot_set.document_id, c.cot_set.id));

        let mut main = Vec::with_capacity(kept.len());
        let mut validation = Vec::new();
        for candidate in &kept {
            let entry = match self.build_entry(candidate).await {
                Ok(entry) => entry,
                Err(message) => {
                    tracing::warn!(
                        cot_set = candidate.cot_set.id,
                        error = %message,
                        "Excluding CoT set with unreadable artifacts"
                    );
                    report.unreadable += 1;
                    continue;
                }
            };
            if in_validation_split(candidate.cot_set.id, self.settings.validation_fraction) {
                validation.push(entry);
            } else {
                main.push(entry);
            }
        }

        write_atomic(output_path, &to_jsonl(&main)?)?;
        write_atomic(&report.mirror, serde_yaml::to_string(&main)?.as_bytes())?;
        if self.settings.validation_fraction > 0.0 {
            let path = validation_path(output_path);
            write_atomic(&path, &to_jsonl(&validation)?)?;
            report.validation_output = Some(path);
        }

        report.written = main.len();
        report.validation = validation.len();
        report.excluded = report.below_threshold + report.deduplicated + report.unreadable;

        tracing::info!(
            output = %output_path.display(),
            candidates = report.candidates,
            written = report.written,
            validation = report.validation,
            excluded = report.excluded,
            "Corpus compiled"
        );
        Ok(report)
    }

    async fn build_entry(&self, candidate: &CorpusCandidate) -> Result<CorpusEntry, String> {
        let cot = &candidate.cot_set;
        let refinement = self
            .read_body(cot.refinement_artifact.as_deref(), "refinement")
            .await?;
        let question = extract_results(&refinement)
            .and_then(|section| parse_cot(section, true))
            .map_err(|e| format!("refinement artifact: {}", e))?
            .question
            .unwrap_or_default();

        let voicing = self
            .read_body(cot.voicing_artifact.as_deref(), "voicing")
            .await?;
        let voiced = parse_voiced(&voicing).map_err(|e| format!("voicing artifact: {}", e))?;

        let provenance = Provenance {
            cot_set_id: cot.id,
            document_id: cot.document_id,
            locator: candidate.locator.clone(),
            primary_category: primary_category(candidate).to_string(),
            quality_score: cot.quality_score.unwrap_or_default(),
            voice_score: cot.voice_score.unwrap_or_default(),
        };

        Ok(match self.settings.format {
            CorpusFormat::Record => CorpusEntry::Record {
                question,
                reasoning: voiced.chain_of_reasoning,
                answer: voiced.answer,
                provenance,
            },
            CorpusFormat::Chat => CorpusEntry::Chat {
                messages: vec![
                    ChatMessage {
                        role: "system".to_string(),
                        content: self.settings.system_prompt.clone(),
                    },
                    ChatMessage {
                        role: "user".to_string(),
                        content: question,
                    },
                    ChatMessage {
                        role: "assistant".to_string(),
                        content: format!(
                            "{}\n\nAnswer: {}",
                            voiced.chain_of_reasoning, voiced.answer
                        ),
                    },
                ],
                provenance,
            },
        })
    }

    async fn read_body(&self, reference: Option<&str>, what: &str) -> Result<String, String> {
        let reference = reference.ok_or_else(|| format!("missing {} artifact", what))?;
        self.artifacts
            .read(&ArtifactRef::from(reference))
            .await
            .map(|artifact| artifact.body)
            .map_err(|e| format!("{} artifact: {}", what, e))
    }
}

fn passes_thresholds(candidate: &CorpusCandidate, min_quality: i64, min_voice: i64) -> bool {
    let cot = &candidate.cot_set;
    matches!(
        (cot.quality_score, cot.voice_score),
        (Some(q), Some(v)) if q >= min_quality && v >= min_voice
    )
}

/// Lexicographically smallest category, or [`UNCATEGORIZED`].
fn primary_category(candidate: &CorpusCandidate) -> &str {
    candidate
        .categories
        .iter()
        .min()
        .map(String::as_str)
        .unwrap_or(UNCATEGORIZED)
}

fn group_key(candidate: &CorpusCandidate, scope: DedupScope) -> String {
    match scope {
        DedupScope::Document => candidate.cot_set.document_id.to_string(),
        DedupScope::Category => primary_category(candidate).to_string(),
    }
}

/// Keeps the best `k` candidates per group; returns them and the number dropped.
///
/// Best means highest quality plus voice score, then earliest creation, then
/// lowest id.
fn select_per_group(
    candidates: Vec<CorpusCandidate>,
    scope: DedupScope,
    k: usize,
) -> (Vec<CorpusCandidate>, usize) {
    let mut groups: BTreeMap<String, Vec<CorpusCandidate>> = BTreeMap::new();
    for candidate in candidates {
        groups
            .entry(group_key(&candidate, scope))
            .or_default()
            .push(candidate);
    }

    let mut kept = Vec::new();
    let mut dropped = 0;
    for (_, mut group) in groups {
        group.sort_by(|a, b| {
            combined_score(b)
                .cmp(&combined_score(a))
                .then_with(|| a.cot_set.created_at.cmp(&b.cot_set.created_at))
                .then_with(|| a.cot_set.id.cmp(&b.cot_set.id))
        });
        dropped += group.len().saturating_sub(k);
        group.truncate(k);
        kept.extend(group);
    }
    (kept, dropped)
}

fn combined_score(candidate: &CorpusCandidate) -> i64 {
    candidate.cot_set.quality_score.unwrap_or_default()
        + candidate.cot_set.voice_score.unwrap_or_default()
}

/// Stable split on the hash of the CoT set id.
fn in_validation_split(cot_set_id: i64, fraction: f64) -> bool {
    if fraction <= 0.0 {
        return false;
    }
    let digest = hex::encode(Sha256::digest(cot_set_id.to_string().as_bytes()));
    let prefix = u32::from_str_radix(&digest[..8], 16).unwrap_or(u32::MAX);
    let bucket = f64::from(prefix) / (f64::from(u32::MAX) + 1.0);
    bucket < fraction
}

fn validation_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("corpus");
    output.with_file_name(format!("{}.validation.jsonl", stem))
}

fn to_jsonl(entries: &[CorpusEntry]) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut out, entry)?;
        out.push(b'\n');
    }
    Ok(out)
}

/// Writes through a temp file in the target directory, then renames.
fn write_atomic(path: &Path, content: &[u8]) -> Result<(), std::io::Error> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;
    let mut file = NamedTempFile::new_in(parent)?;
    file.write_all(content)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
