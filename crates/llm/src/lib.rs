//! The LLM port: deterministic prompt rendering plus completion calls
//! returning text, parsed JSON, or a finite text stream.
//!
//! Provider authentication, retries, and fallback chains belong to the
//! port implementation, not to this crate. The [`testing`] module ships a
//! scripted client used across the workspace's test suites.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use serde_json::Value;

pub mod testing;

/// Error raised by template rendering or completion calls.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("failed to render prompt template")]
    Template(#[from] minijinja::Error),
    #[error("model response is not valid JSON: {message}")]
    Parse { message: String, content: String },
    #[error("model returned an empty response")]
    Empty,
    #[error("provider call failed: {0}")]
    Provider(String),
}

/// LlmClient is the completion surface the planning pipeline consumes.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Completes `prompt`, returning the raw response text.
    async fn complete(&self, prompt: &str, temperature: f32) -> Result<String, LlmError>;

    /// Completes `prompt` and parses the response as one JSON object.
    /// Responses wrapped in Markdown code fences are unwrapped first.
    async fn complete_json(&self, prompt: &str, temperature: f32) -> Result<Value, LlmError> {
        let content = self.complete(prompt, temperature).await?;
        parse_json_content(&content)
    }

    /// Streams the completion as text chunks. The stream is finite and
    /// not restartable.
    async fn stream_text(
        &self,
        prompt: &str,
        temperature: f32,
    ) -> Result<BoxStream<'static, Result<String, LlmError>>, LlmError>;
}

/// Extracts and parses the JSON object in a model response, stripping
/// ```json fences and leading prose when present.
pub fn parse_json_content(content: &str) -> Result<Value, LlmError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(LlmError::Empty);
    }

    let candidate = if let Some(rest) = content.split("```json").nth(1) {
        rest.split("```").next().unwrap_or(rest).trim()
    } else if let Some(rest) = content.split("```").nth(1) {
        rest.trim()
    } else {
        content
    };

    match serde_json::from_str(candidate) {
        Ok(value) => Ok(value),
        Err(first_err) => {
            // Salvage an object embedded in prose.
            if let (Some(start), Some(end)) = (candidate.find('{'), candidate.rfind('}')) {
                if start < end {
                    if let Ok(value) = serde_json::from_str(&candidate[start..=end]) {
                        return Ok(value);
                    }
                }
            }
            Err(LlmError::Parse {
                message: first_err.to_string(),
                content: content.to_string(),
            })
        }
    }
}

/// TemplateEngine renders the embedded prompt templates.
pub struct TemplateEngine {
    env: minijinja::Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Panics if an embedded template fails to compile; that is a build
    /// defect, not a runtime condition.
    pub fn new() -> Self {
        let mut env = minijinja::Environment::new();
        for (name, source) in [
            (
                "schema_classifier",
                include_str!("../templates/schema_classifier.j2"),
            ),
            (
                "orchestration_plan",
                include_str!("../templates/orchestration_plan.j2"),
            ),
            (
                "plan_optimization",
                include_str!("../templates/plan_optimization.j2"),
            ),
        ] {
            if let Err(err) = env.add_template(name, source) {
                panic!("embedded template {name} does not compile: {err}");
            }
        }
        Self { env }
    }

    pub fn render(&self, name: &str, context: &impl Serialize) -> Result<String, LlmError> {
        let template = self.env.get_template(name)?;
        Ok(template.render(context)?)
    }
}
