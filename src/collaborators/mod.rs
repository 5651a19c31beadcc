//! Collaborator traits consumed by the pipeline, plus default implementations.
//!
//! The pipeline never fetches papers, renders prompts or judges quality
//! itself. It calls:
//!
//! - [`DocumentSource`] to discover candidate papers,
//! - [`TextExtractor`] to turn a locator into plain text,
//! - [`ModelInvoker`] to run a named prompt template, and
//! - [`ScoreParser`] to turn an assessment into an integer score.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ExtractionError, InvocationError, ScoreError, SourceError};

/// A document offered for ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateDocument {
    pub locator: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Restricts which candidates a source returns.
#[derive(Debug, Clone, Default)]
pub struct SourceFilter {
    /// Keep candidates tagged with any of these; empty keeps all.
    pub categories: Vec<String>,
    pub limit: Option<usize>,
}

impl SourceFilter {
    fn accepts(&self, candidate: &CandidateDocument) -> bool {
        self.categories.is_empty()
            || candidate
                .categories
                .iter()
                .any(|c| self.categories.contains(c))
    }
}

/// Template variables passed to a [`ModelInvoker`].
pub type TemplateVars = BTreeMap<String, String>;

#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn list_candidate_documents(
        &self,
        filter: &SourceFilter,
    ) -> Result<Vec<CandidateDocument>, SourceError>;
}

#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract_text(&self, locator: &str) -> Result<String, ExtractionError>;
}

#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(
        &self,
        template_name: &str,
        variables: &TemplateVars,
    ) -> Result<String, InvocationError>;

    /// Whether `template_name` can be rendered. Used for fail-fast config checks.
    fn has_template(&self, template_name: &str) -> bool;
}

pub trait ScoreParser: Send + Sync {
    fn parse_score(&self, structured_text: &str) -> Result<i64, ScoreError>;
}

/// Reads candidates from a JSON Lines file, one object per line.
///
/// ```text
/// {"locator": "papers/2401.00001.txt", "categories": ["cs.CL"], "metadata": {"title": "..."}}
/// ```
#[derive(Debug, Clone)]
pub struct JsonlDocumentSource {
    path: PathBuf,
}

impl JsonlDocumentSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DocumentSource for JsonlDocumentSource {
    async fn list_candidate_documents(
        &self,
        filter: &SourceFilter,
    ) -> Result<Vec<CandidateDocument>, SourceError> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let mut candidates = Vec::new();

        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let candidate: CandidateDocument =
                serde_json::from_str(line).map_err(|e| SourceError::InvalidEntry {
                    line: index + 1,
                    message: e.to_string(),
                })?;
            if candidate.locator.trim().is_empty() {
                return Err(SourceError::InvalidEntry {
                    line: index + 1,
                    message: "locator is empty".to_string(),
                });
            }
            if !filter.accepts(&candidate) {
                continue;
            }
            candidates.push(candidate);
            if filter.limit.is_some_and(|limit| candidates.len() >= limit) {
                break;
            }
        }

        tracing::info!(
            path = %self.path.display(),
            candidates = candidates.len(),
            "Loaded candidate documents"
        );
        Ok(candidates)
    }
}

/// Reads documents as UTF-8 text from the local filesystem.
///
/// Locators are paths, optionally prefixed with `file://`. Relative paths are
/// resolved against the base directory when one is set.
#[derive(Debug, Clone, Default)]
pub struct FsTextExtractor {
    base_dir: Option<PathBuf>,
}

impl FsTextExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    fn resolve(&self, locator: &str) -> PathBuf {
        let raw = locator.strip_prefix("file://").unwrap_or(locator);
        let path = PathBuf::from(raw);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        }
    }
}

#[async_trait]
impl TextExtractor for FsTextExtractor {
    async fn extract_text(&self, locator: &str) -> Result<String, ExtractionError> {
        let path = self.resolve(locator);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ExtractionError::NotFound(path.display().to_string()));
            }
            Err(e) => return Err(ExtractionError::Io(e)),
        };

        let text = String::from_utf8(bytes).map_err(|_| ExtractionError::NotText {
            locator: locator.to_string(),
        })?;
        if text.trim().is_empty() {
            return Err(ExtractionError::Empty(locator.to_string()));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_jsonl_source_filters_and_limits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("papers.jsonl");
        std::fs::write(
            &path,
            concat!(
                "{\"locator\": \"a.txt\", \"categories\": [\"cs.AI\"]}\n",
                "\n",
                "{\"locator\": \"b.txt\", \"categories\": [\"math.CO\"], \"metadata\": {\"title\": \"B\"}}\n",
                "{\"locator\": \"c.txt\", \"categories\": [\"cs.AI\", \"cs.LG\"]}\n",
            ),
        )
        .unwrap();

        let source = JsonlDocumentSource::new(&path);
        let all = source
            .list_candidate_documents(&SourceFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[1].metadata["title"], "B");
        assert!(all[0].metadata.is_object());

        let filter = SourceFilter {
            categories: vec!["cs.AI".to_string()],
            limit: Some(1),
        };
        let filtered = source.list_candidate_documents(&filter).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].locator, "a.txt");
    }

    #[tokio::test]
    async fn test_jsonl_source_reports_bad_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("papers.jsonl");
        std::fs::write(&path, "{\"locator\": \"a.txt\"}\nnot json\n").unwrap();

        let err = JsonlDocumentSource::new(&path)
            .list_candidate_documents(&SourceFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::InvalidEntry { line: 2, .. }));
    }

    #[tokio::test]
    async fn test_fs_extractor_reads_relative_and_file_urls() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("paper.txt"), "Abstract. We show...").unwrap();

        let extractor = FsTextExtractor::new().with_base_dir(dir.path());
        assert_eq!(
            extractor.extract_text("paper.txt").await.unwrap(),
            "Abstract. We show..."
        );

        let absolute = format!("file://{}", dir.path().join("paper.txt").display());
        assert!(FsTextExtractor::new().extract_text(&absolute).await.is_ok());
    }

    #[tokio::test]
    async fn test_fs_extractor_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blank.txt"), "  \n").unwrap();
        std::fs::write(dir.path().join("binary.bin"), [0xff, 0xfe, 0x00]).unwrap();
        let extractor = FsTextExtractor::new().with_base_dir(dir.path());

        assert!(matches!(
            extractor.extract_text("missing.txt").await,
            Err(ExtractionError::NotFound(_))
        ));
        assert!(matches!(
            extractor.extract_text("blank.txt").await,
            Err(ExtractionError::Empty(_))
        ));
        assert!(matches!(
            extractor.extract_text("binary.bin").await,
            Err(ExtractionError::NotText { .. })
        ));
    }
}
