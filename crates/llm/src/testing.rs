//! A scripted LLM client for tests: responses are queued ahead of time
//! and prompts are recorded for assertion.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::{LlmClient, LlmError};

enum Scripted {
    Text(String),
    Failure(String),
}

/// ScriptedLlm pops one queued response per call, in order. Calling with
/// an empty queue raises a provider error, which surfaces scripting
/// mistakes quickly.
#[derive(Default)]
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<Scripted>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, text: impl Into<String>) -> Self {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Scripted::Text(text.into()));
        self
    }

    pub fn respond_json(self, value: serde_json::Value) -> Self {
        let text = value.to_string();
        self.respond(text)
    }

    pub fn fail(self, message: impl Into<String>) -> Self {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Scripted::Failure(message.into()));
        self
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn remaining(&self) -> usize {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, prompt: &str, _temperature: f32) -> Result<String, LlmError> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());
        match self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            Some(Scripted::Text(text)) => Ok(text),
            Some(Scripted::Failure(message)) => Err(LlmError::Provider(message)),
            None => Err(LlmError::Provider(
                "scripted client has no responses left".to_string(),
            )),
        }
    }

    async fn stream_text(
        &self,
        prompt: &str,
        temperature: f32,
    ) -> Result<BoxStream<'static, Result<String, LlmError>>, LlmError> {
        let text = self.complete(prompt, temperature).await?;
        let chunks: Vec<Result<String, LlmError>> = text
            .split_inclusive(' ')
            .map(|chunk| Ok(chunk.to_string()))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }
}
