//! Append-only artifact storage on the filesystem.
//!
//! Every stage invocation leaves one immutable text file behind:
//!
//! ```text
//! <root>/<stage>/<subject>-<id>/<timestamp>-<uuid>.txt
//! ```
//!
//! The file starts with a `---` delimited header of sorted `key: value` lines
//! followed by the body verbatim. Database rows reference artifacts by their
//! path relative to the root. Files are opened with `create_new`, so
//! concurrent writers never clobber each other and no locking is needed.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::pipeline::gate::Stage;
use crate::pipeline::status::RecordId;

const DELIMITER: &str = "---";

/// Header keys set by the writer itself.
pub const RESERVED_KEYS: [&str; 5] = ["artifact_id", "body_sha256", "record", "stage", "written_at"];

/// Errors that can occur during artifact operations.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Artifact file does not exist.
    #[error("Artifact not found: {0}")]
    NotFound(String),

    /// Reference escapes the artifact root or is otherwise unusable.
    #[error("Invalid artifact reference '{0}'")]
    InvalidReference(String),

    /// Metadata key is empty or contains ':' or whitespace.
    #[error("Invalid metadata key '{0}'")]
    InvalidKey(String),

    /// Metadata key collides with a writer-managed key.
    #[error("Metadata key '{0}' is reserved")]
    ReservedKey(String),

    /// File does not follow the artifact layout.
    #[error("Malformed artifact '{reference}': {message}")]
    Malformed { reference: String, message: String },

    /// Body does not match its recorded checksum.
    #[error("Checksum mismatch for '{reference}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        reference: String,
        expected: String,
        actual: String,
    },

    /// Walking the artifact tree failed.
    #[error("Directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Path of an artifact relative to the artifact root, `/`-separated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ArtifactRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ArtifactRef {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A parsed artifact file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub reference: ArtifactRef,
    /// All header entries, reserved ones included.
    pub metadata: BTreeMap<String, String>,
    pub body: String,
}

impl Artifact {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn stage(&self) -> Option<&str> {
        self.get("stage")
    }

    pub fn record(&self) -> Option<&str> {
        self.get("record")
    }
}

/// Writes and reads artifacts under one root directory.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    root: PathBuf,
}

impl ArtifactWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the artifact root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes a new artifact and returns its reference.
    pub async fn write(
        &self,
        record: RecordId,
        stage: Stage,
        metadata: &BTreeMap<String, String>,
        body: &str,
    ) -> Result<ArtifactRef, ArtifactError> {
        for key in metadata.keys() {
            validate_key(key)?;
        }

        let artifact_id = Uuid::new_v4();
        let now = Utc::now();
        let relative = format!(
            "{}/{}-{}/{}-{}.txt",
            stage,
            record.subject,
            record.id,
            now.format("%Y%m%dT%H%M%S%.6fZ"),
            artifact_id
        );

        let mut header = metadata.clone();
        header.insert("artifact_id".to_string(), artifact_id.to_string());
        header.insert("record".to_string(), record.to_string());
        header.insert("stage".to_string(), stage.to_string());
        header.insert(
            "written_at".to_string(),
            now.to_rfc3339_opts(SecondsFormat::Micros, true),
        );
        header.insert("body_sha256".to_string(), sha256_hex(body));

        let mut content = String::with_capacity(body.len() + 256);
        content.push_str(DELIMITER);
        content.push('\n');
        for (key, value) in &header {
            content.push_str(key);
            content.push_str(": ");
            content.push_str(&escape_value(value));
            content.push('\n');
        }
        content.push_str(DELIMITER);
        content.push('\n');
        content.push_str(body);

        let path = self.root.join(&relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;

        tracing::debug!(
            record = %record,
            stage = %stage,
            artifact = %relative,
            bytes = content.len(),
            "Artifact written"
        );
        Ok(ArtifactRef(relative))
    }

    /// Reads an artifact and verifies its body checksum.
    pub async fn read(&self, reference: &ArtifactRef) -> Result<Artifact, ArtifactError> {
        let path = self.resolve(reference)?;
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArtifactError::NotFound(reference.to_string()));
            }
            Err(e) => return Err(ArtifactError::Io(e)),
        };

        let (metadata, body) = parse_content(&content).map_err(|message| {
            ArtifactError::Malformed {
                reference: reference.to_string(),
                message,
            }
        })?;

        let expected = metadata
            .get("body_sha256")
            .cloned()
            .ok_or_else(|| ArtifactError::Malformed {
                reference: reference.to_string(),
                message: "missing body_sha256".to_string(),
            })?;
        let actual = sha256_hex(body);
        if expected != actual {
            return Err(ArtifactError::ChecksumMismatch {
                reference: reference.to_string(),
                expected,
                actual,
            });
        }

        Ok(Artifact {
            reference: reference.clone(),
            metadata,
            body: body.to_string(),
        })
    }

    /// Lists artifact references, optionally only those of one record.
    pub fn list(&self, record: Option<RecordId>) -> Result<Vec<ArtifactRef>, ArtifactError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let record_dir = record.map(|r| format!("{}-{}", r.subject, r.id));

        let mut refs = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(3).max_depth(3) {
            let entry = entry?;
            if !entry.file_type().is_file()
                || entry.path().extension().and_then(|e| e.to_str()) != Some("txt")
            {
                continue;
            }
            if let Some(dir) = &record_dir {
                let parent = entry
                    .path()
                    .parent()
                    .and_then(|p| p.file_name())
                    .and_then(|n| n.to_str());
                if parent != Some(dir.as_str()) {
                    continue;
                }
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let parts: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect();
            refs.push(ArtifactRef(parts.join("/")));
        }
        refs.sort();
        Ok(refs)
    }

    fn resolve(&self, reference: &ArtifactRef) -> Result<PathBuf, ArtifactError> {
        let relative = Path::new(reference.as_str());
        let safe = !reference.as_str().is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(ArtifactError::InvalidReference(reference.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn validate_key(key: &str) -> Result<(), ArtifactError> {
    if key.is_empty() || key.contains(':') || key.chars().any(char::is_whitespace) {
        return Err(ArtifactError::InvalidKey(key.to_string()));
    }
    if RESERVED_KEYS.contains(&key) {
        return Err(ArtifactError::ReservedKey(key.to_string()));
    }
    Ok(())
}

fn sha256_hex(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}

fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_value(value: &str) -> Result<String, String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => return Err(format!("unknown escape '\\{}'", other)),
            None => return Err("dangling escape".to_string()),
        }
    }
    Ok(out)
}

/// Splits file content into header entries and body.
fn parse_content(content: &str) -> Result<(BTreeMap<String, String>, &str), String> {
    let rest = content
        .strip_prefix("---\n")
        .ok_or_else(|| "missing opening delimiter".to_string())?;

    let mut metadata = BTreeMap::new();
    let mut offset = 0;
    loop {
        let line_end = rest[offset..]
            .find('\n')
            .ok_or_else(|| "missing closing delimiter".to_string())?;
        let line = &rest[offset..offset + line_end];
        offset += line_end + 1;

        if line == DELIMITER {
            break;
        }
        let (key, value) = line
            .split_once(": ")
            .ok_or_else(|| format!("invalid header line '{}'", line))?;
        metadata.insert(key.to_string(), unescape_value(value)?);
    }

    Ok((metadata, &rest[offset..]))
}
