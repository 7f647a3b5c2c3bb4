use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

/// Configuration for the completion backend
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LlmProvider {
    Ollama,
    OpenAI,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Ollama,
            api_key: None,
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            timeout_secs: 60,
        }
    }
}

impl LlmConfig {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self> {
        let provider = std::env::var("LLM_PROVIDER")
            .unwrap_or_else(|_| "ollama".to_string())
            .to_lowercase();

        let provider = match provider.as_str() {
            "openai" => LlmProvider::OpenAI,
            _ => LlmProvider::Ollama,
        };

        let base_url = match provider {
            LlmProvider::Ollama => {
                std::env::var("OLLAMA_URL").unwrap_or_else(|_| "http://localhost:11434".to_string())
            }
            LlmProvider::OpenAI => {
                std::env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com".to_string())
            }
        };

        let model = match provider {
            LlmProvider::Ollama => {
                std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| "llama3.2:3b".to_string())
            }
            LlmProvider::OpenAI => {
                std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string())
            }
        };

        let api_key = if provider == LlmProvider::OpenAI {
            Some(
                std::env::var("OPENAI_API_KEY")
                    .context("OPENAI_API_KEY required for OpenAI provider")?,
            )
        } else {
            None
        };

        Ok(Self {
            provider,
            api_key,
            base_url,
            model,
            timeout_secs: 60,
        })
    }
}

/// One completion call: system/user prompt pair, an output cap, and whether a
/// JSON object is expected back.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub json: bool,
}

/// Seam between the summarizer and the network. Tests substitute
/// call-counting mocks.
#[async_trait]
pub trait CompletionApi: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String>;
}

/// HTTP-backed completion client
pub struct LlmClient {
    config: LlmConfig,
    client: Client,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap();

        Self { config, client }
    }

    /// Try to create from environment, returns None if LLM summaries are
    /// disabled
    pub fn from_env_optional() -> Option<Self> {
        let use_llm = std::env::var("USE_LLM_SUMMARIES")
            .unwrap_or_else(|_| "false".to_string())
            .to_lowercase();

        if use_llm == "true" || use_llm == "1" {
            match LlmConfig::from_env() {
                Ok(config) => Some(Self::new(config)),
                Err(e) => {
                    warn!("Failed to initialize completion client: {}", e);
                    None
                }
            }
        } else {
            None
        }
    }

    /// Call Ollama API
    async fn call_ollama(&self, request: &CompletionRequest) -> Result<String> {
        let url = format!("{}/api/generate", self.config.base_url);
        let prompt = format!("{}\n\n{}", request.system, request.user);

        let mut request_body = json!({
            "model": self.config.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": 0.3,
                "num_predict": request.max_tokens,
            }
        });
        if request.json {
            request_body["format"] = json!("json");
        }

        debug!("Calling Ollama at {}", url);

        let response = self
            .client
            .post(&url)
            .json(&request_body)
            .send()
            .await
            .context("Failed to call Ollama API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama API error {}: {}", status, error_text);
        }

        #[derive(Deserialize)]
        struct OllamaResponse {
            response: String,
        }

        let ollama_response: OllamaResponse = response
            .json()
            .await
            .context("Failed to parse Ollama response")?;

        Ok(ollama_response.response)
    }

    /// Call OpenAI-compatible API
    async fn call_openai(&self, request: &CompletionRequest) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.config.base_url);

        let mut request_body = json!({
            "model": self.config.model,
            "messages": [
                {
                    "role": "system",
                    "content": request.system,
                },
                {
                    "role": "user",
                    "content": request.user,
                }
            ],
            "temperature": 0.3,
            "max_tokens": request.max_tokens,
        });
        if request.json {
            request_body["response_format"] = json!({ "type": "json_object" });
        }

        debug!("Calling OpenAI at {}", url);

        let mut http_request = self.client.post(&url).json(&request_body);

        if let Some(ref api_key) = self.config.api_key {
            http_request = http_request.bearer_auth(api_key);
        }

        let response = http_request
            .send()
            .await
            .context("Failed to call OpenAI API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI API error {}: {}", status, error_text);
        }

        #[derive(Deserialize)]
        struct OpenAIResponse {
            choices: Vec<OpenAIChoice>,
        }

        #[derive(Deserialize)]
        struct OpenAIChoice {
            message: OpenAIMessage,
        }

        #[derive(Deserialize)]
        struct OpenAIMessage {
            content: String,
        }

        let openai_response: OpenAIResponse = response
            .json()
            .await
            .context("Failed to parse OpenAI response")?;

        openai_response
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| anyhow::anyhow!("No response from OpenAI"))
    }
}

#[async_trait]
impl CompletionApi for LlmClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        match self.config.provider {
            LlmProvider::Ollama => self.call_ollama(&request).await,
            LlmProvider::OpenAI => self.call_openai(&request).await,
        }
    }
}
