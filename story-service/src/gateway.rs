// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::prompts::{NO_REFERENCE_CONTEXT, PromptKind, SYSTEM_PROMPT, render_template};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Object,
    Array,
    /// Any value except `null`.
    Any,
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => !value.is_null(),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "non-null value",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldKind,
}

impl Field {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind }
    }
}

/// Required top-level fields of a generated payload.
#[derive(Debug)]
pub struct Schema {
    pub name: &'static str,
    pub required: &'static [Field],
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("output is not valid JSON: {0}")]
    Unparseable(String),
    #[error("output is not a JSON object")]
    NotAnObject,
    #[error("missing required field {0:?}")]
    MissingField(&'static str),
    #[error("field {field:?} should be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
}

impl Schema {
    pub fn validate(&self, value: &Value) -> Result<(), SchemaError> {
        let object = value.as_object().ok_or(SchemaError::NotAnObject)?;
        for field in self.required {
            match object.get(field.name) {
                None | Some(Value::Null) => return Err(SchemaError::MissingField(field.name)),
                Some(value) if !field.kind.matches(value) => {
                    return Err(SchemaError::WrongType {
                        field: field.name,
                        expected: field.kind.as_str(),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("model call failed: {0}")]
    Failed(String),
    #[error("{schema} output rejected: {source}")]
    Invalid {
        schema: &'static str,
        #[source]
        source: SchemaError,
    },
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub kind: PromptKind,
    pub system: String,
    pub prompt: String,
    /// Values the prompt was rendered from.
    pub variables: Map<String, Value>,
}

/// Raw text completion. Knows nothing about sessions or schemas.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalQuery {
    pub knowledge_base_id: String,
    pub query: String,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &RetrievalQuery) -> anyhow::Result<Vec<String>>;
}

/// Returns base64 image data, or `None` when the backend produced nothing.
#[async_trait]
pub trait ImageClient: Send + Sync {
    async fn generate(&self, prompt: &str) -> anyhow::Result<Option<String>>;
}

#[derive(Clone)]
pub struct Gateway {
    model: Arc<dyn ModelClient>,
    retriever: Arc<dyn Retriever>,
    images: Arc<dyn ImageClient>,
}

impl Gateway {
    pub fn new(
        model: Arc<dyn ModelClient>,
        retriever: Arc<dyn Retriever>,
        images: Arc<dyn ImageClient>,
    ) -> Self {
        Self {
            model,
            retriever,
            images,
        }
    }

    pub async fn generate(
        &self,
        kind: PromptKind,
        variables: &Map<String, Value>,
        schema: &Schema,
    ) -> Result<Value, GenerationError> {
        let request = ModelRequest {
            kind,
            system: SYSTEM_PROMPT.to_string(),
            prompt: render_template(kind.template(), variables),
            variables: variables.clone(),
        };

        let started = std::time::Instant::now();
        let raw = self
            .model
            .complete(&request)
            .await
            .map_err(|error| GenerationError::Failed(format!("{error:#}")))?;
        debug!(
            kind = kind.as_str(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            output_chars = raw.len(),
            "model call completed"
        );

        parse_model_output(&raw, schema).map_err(|source| {
            warn!(kind = kind.as_str(), error = %source, "model output rejected");
            GenerationError::Invalid {
                schema: schema.name,
                source,
            }
        })
    }

    /// Retrieval is best-effort: a failed lookup renders as "no reference material".
    pub async fn generate_with_retrieval(
        &self,
        kind: PromptKind,
        mut variables: Map<String, Value>,
        schema: &Schema,
        query: RetrievalQuery,
    ) -> Result<Value, GenerationError> {
        let context = match self.retriever.retrieve(&query).await {
            Ok(passages) if !passages.is_empty() => {
                debug!(
                    knowledge_base_id = %query.knowledge_base_id,
                    passages = passages.len(),
                    "retrieved reference passages"
                );
                passages.join("\n---\n")
            }
            Ok(_) => NO_REFERENCE_CONTEXT.to_string(),
            Err(error) => {
                warn!(
                    knowledge_base_id = %query.knowledge_base_id,
                    error = %format!("{error:#}"),
                    "retrieval failed; generating without reference material"
                );
                NO_REFERENCE_CONTEXT.to_string()
            }
        };
        variables.insert("reference_context".to_string(), Value::String(context));
        self.generate(kind, &variables, schema).await
    }

    pub async fn generate_image(&self, description: &str) -> Option<String> {
        match self.images.generate(description).await {
            Ok(image) => image,
            Err(error) => {
                warn!(
                    error = %format!("{error:#}"),
                    "image generation failed; continuing without image"
                );
                None
            }
        }
    }
}

/// Parses and validates model text. A failed first attempt gets one retry
/// with markdown fences and surrounding prose removed.
pub fn parse_model_output(raw: &str, schema: &Schema) -> Result<Value, SchemaError> {
    let first = serde_json::from_str::<Value>(raw.trim())
        .map_err(|error| SchemaError::Unparseable(error.to_string()))
        .and_then(|value| schema.validate(&value).map(|_| value));

    match first {
        Ok(value) => Ok(value),
        Err(first_error) => {
            let stripped = strip_code_fences(raw);
            let value = serde_json::from_str::<Value>(stripped)
                .map_err(|_| first_error.clone())?;
            schema.validate(&value)?;
            Ok(value)
        }
    }
}

fn strip_code_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        // Skip the language tag line, if any.
        let body_start = after.find('\n').map(|index| index + 1).unwrap_or(0);
        let body = &after[body_start..];
        text = match body.find("```") {
            Some(end) => &body[..end],
            None => body,
        };
    }

    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text.trim(),
    }
}

#[derive(Clone)]
pub struct OpenAiModelClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl OpenAiModelClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            timeout,
        }
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    response_format: ResponseFormat,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[async_trait]
impl ModelClient for OpenAiModelClient {
    async fn complete(&self, request: &ModelRequest) -> anyhow::Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            response_format: ResponseFormat {
                kind: "json_object",
            },
            temperature: 0.9,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .with_context(|| {
                format!("chat completion request for {} failed", request.kind.as_str())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("chat completion returned {}: {}", status, body);
        }

        let parsed = response
            .json::<ChatCompletionResponse>()
            .await
            .context("failed to decode chat completion response")?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("chat completion returned no content"))
    }
}

#[derive(Clone)]
pub struct OpenAiImageClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl OpenAiImageClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            timeout,
        }
    }
}

#[derive(Deserialize)]
struct ImageGenerationResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Deserialize)]
struct ImageData {
    #[serde(default)]
    b64_json: Option<String>,
}

#[async_trait]
impl ImageClient for OpenAiImageClient {
    async fn generate(&self, prompt: &str) -> anyhow::Result<Option<String>> {
        let url = format!("{}/images/generations", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&serde_json::json!({
                "model": self.model,
                "prompt": prompt,
                "n": 1,
                "size": "1024x1024",
                "response_format": "b64_json",
            }))
            .send()
            .await
            .context("image generation request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("image generation returned {}: {}", status, body);
        }

        let parsed = response
            .json::<ImageGenerationResponse>()
            .await
            .context("failed to decode image generation response")?;
        Ok(parsed.data.into_iter().find_map(|image| image.b64_json))
    }
}

pub struct DisabledImages;

#[async_trait]
impl ImageClient for DisabledImages {
    async fn generate(&self, _prompt: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

#[derive(Clone)]
pub struct HttpRetriever {
    client: reqwest::Client,
    url: String,
    top_k: usize,
}

impl HttpRetriever {
    pub fn new(url: impl Into<String>, top_k: usize) -> Self {
        let url = url.into();
        info!(url = %url, top_k, "reference retrieval enabled");
        Self {
            client: reqwest::Client::new(),
            url,
            top_k: top_k.max(1),
        }
    }
}

#[derive(Deserialize)]
struct RetrievalResponse {
    #[serde(default)]
    passages: Vec<String>,
}

#[async_trait]
impl Retriever for HttpRetriever {
    async fn retrieve(&self, query: &RetrievalQuery) -> anyhow::Result<Vec<String>> {
        let response = self
            .client
            .post(&self.url)
            .timeout(Duration::from_secs(10))
            .json(&serde_json::json!({
                "knowledge_base_id": query.knowledge_base_id,
                "query": query.query,
                "top_k": self.top_k,
            }))
            .send()
            .await
            .context("retrieval request failed")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("retrieval endpoint returned {}", status);
        }

        let parsed = response
            .json::<RetrievalResponse>()
            .await
            .context("failed to decode retrieval response")?;
        Ok(parsed
            .passages
            .into_iter()
            .map(|passage| passage.trim().to_string())
            .filter(|passage| !passage.is_empty())
            .take(self.top_k)
            .collect())
    }
}

pub struct NoRetriever;

#[async_trait]
impl Retriever for NoRetriever {
    async fn retrieve(&self, _query: &RetrievalQuery) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
}
