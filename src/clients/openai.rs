//! Azure OpenAI chat completions and embeddings.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{ClientError, check_status, trim_base};
use crate::config::OpenAiConfig;

const SERVICE: &str = "azure-openai";
const EMBEDDING_BATCH: usize = 16;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Text generation and embedding model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Embeds each input, preserving order.
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ClientError>;
    /// Returns the trimmed content of the first choice.
    async fn chat(&self, request: ChatRequest) -> Result<String, ClientError>;
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

/// [`LanguageModel`] backed by Azure OpenAI deployments.
pub struct AzureOpenAi {
    http: Client,
    config: OpenAiConfig,
    embedding_deployment: String,
}

impl AzureOpenAi {
    pub fn new(http: Client, config: OpenAiConfig, embedding_deployment: String) -> Self {
        Self {
            http,
            config,
            embedding_deployment,
        }
    }

    fn deployment_url(&self, deployment: &str, operation: &str) -> String {
        format!(
            "{}/openai/deployments/{}/{}?api-version={}",
            trim_base(&self.config.endpoint),
            deployment,
            operation,
            self.config.api_version
        )
    }

    async fn post<B: Serialize + ?Sized, R: for<'de> Deserialize<'de>>(
        &self,
        url: String,
        body: &B,
    ) -> Result<R, ClientError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| ClientError::NotConfigured("OpenAI API key".to_string()))?;

        let response = self
            .http
            .post(url)
            .header("api-key", api_key)
            .json(body)
            .send()
            .await?;

        check_status(SERVICE, response)
            .await?
            .json::<R>()
            .await
            .map_err(|e| ClientError::malformed(SERVICE, e))
    }
}

#[async_trait]
impl LanguageModel for AzureOpenAi {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ClientError> {
        let mut vectors = Vec::with_capacity(inputs.len());

        for batch in inputs.chunks(EMBEDDING_BATCH) {
            let url = self.deployment_url(&self.embedding_deployment, "embeddings");
            let mut response: EmbeddingResponse = self
                .post(url, &serde_json::json!({ "input": batch }))
                .await?;

            if response.data.len() != batch.len() {
                return Err(ClientError::malformed(
                    SERVICE,
                    format!(
                        "expected {} embeddings, got {}",
                        batch.len(),
                        response.data.len()
                    ),
                ));
            }
            response.data.sort_by_key(|d| d.index);
            vectors.extend(response.data.into_iter().map(|d| d.embedding));
        }

        tracing::debug!(count = vectors.len(), "Created embeddings");
        Ok(vectors)
    }

    async fn chat(&self, request: ChatRequest) -> Result<String, ClientError> {
        let url = self.deployment_url(&self.config.chat_deployment, "chat/completions");
        let response: ChatResponse = self.post(url, &request).await?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .ok_or_else(|| ClientError::malformed(SERVICE, "completion had no content"))
    }
}
