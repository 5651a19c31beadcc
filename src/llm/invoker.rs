//! Template-driven model invocation.
//!
//! Prompt templates are plain files in one directory, addressed by file stem:
//! `templates/cot_critique.tera` is the template `cot_critique`. Rendering uses
//! tera with autoescaping disabled, since the output is a prompt, not HTML.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tera::{Context, Tera};
use walkdir::WalkDir;

use super::litellm::{GenerationRequest, LlmProvider, Message};
use crate::collaborators::{ModelInvoker, TemplateVars};
use crate::error::InvocationError;

const TEMPLATE_EXTENSIONS: [&str; 3] = ["tera", "md", "txt"];

/// [`ModelInvoker`] that renders a tera template and sends it to an [`LlmProvider`].
pub struct TemplateInvoker {
    tera: Tera,
    provider: Arc<dyn LlmProvider>,
    model: String,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
    system_prompt: Option<String>,
}

impl TemplateInvoker {
    /// Loads every `*.tera`, `*.md` and `*.txt` file directly inside `dir`.
    pub fn from_dir(
        dir: impl AsRef<Path>,
        provider: Arc<dyn LlmProvider>,
    ) -> Result<Self, InvocationError> {
        let dir = dir.as_ref();
        let mut templates = Vec::new();

        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| InvocationError::TemplateLoad {
                path: dir.display().to_string(),
                message: e.to_string(),
            })?;
            let path = entry.path();
            let supported = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| TEMPLATE_EXTENSIONS.contains(&ext));
            if !entry.file_type().is_file() || !supported {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let content =
                std::fs::read_to_string(path).map_err(|e| InvocationError::TemplateLoad {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
            templates.push((name.to_string(), content));
        }

        let invoker = Self::from_templates(templates, provider)?;
        tracing::info!(
            dir = %dir.display(),
            templates = invoker.template_names().len(),
            "Prompt templates loaded"
        );
        Ok(invoker)
    }

    /// Builds an invoker from in-memory `(name, source)` pairs.
    pub fn from_templates<I, N, S>(
        templates: I,
        provider: Arc<dyn LlmProvider>,
    ) -> Result<Self, InvocationError>
    where
        I: IntoIterator<Item = (N, S)>,
        N: AsRef<str>,
        S: AsRef<str>,
    {
        let mut tera = Tera::default();
        tera.autoescape_on(vec![]);
        for (name, source) in templates {
            tera.add_raw_template(name.as_ref(), source.as_ref())?;
        }

        Ok(Self {
            tera,
            provider,
            model: String::new(),
            temperature: None,
            max_tokens: None,
            system_prompt: None,
        })
    }

    /// Model to request; empty uses the provider's default.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn template_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tera.get_template_names().collect();
        names.sort_unstable();
        names
    }

    /// Renders `template_name` without calling the model.
    pub fn render(
        &self,
        template_name: &str,
        variables: &TemplateVars,
    ) -> Result<String, InvocationError> {
        if !self.has_template(template_name) {
            return Err(InvocationError::UnknownTemplate(template_name.to_string()));
        }
        let mut context = Context::new();
        for (key, value) in variables {
            context.insert(key.as_str(), value);
        }
        Ok(self.tera.render(template_name, &context)?)
    }
}

#[async_trait]
impl ModelInvoker for TemplateInvoker {
    async fn invoke(
        &self,
        template_name: &str,
        variables: &TemplateVars,
    ) -> Result<String, InvocationError> {
        let prompt = self.render(template_name, variables)?;

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system_prompt {
            messages.push(Message::system(system.as_str()));
        }
        messages.push(Message::user(prompt));

        let request = GenerationRequest {
            model: Some(self.model.clone()).filter(|m| !m.is_empty()),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self.provider.generate(request).await?;
        if response.content.trim().is_empty() {
            return Err(InvocationError::EmptyResponse);
        }

        tracing::debug!(
            template = template_name,
            model = %response.model,
            total_tokens = response.total_tokens,
            "Template invocation completed"
        );
        Ok(response.content)
    }

    fn has_template(&self, template_name: &str) -> bool {
        self.tera.get_template_names().any(|name| name == template_name)
    }
}
