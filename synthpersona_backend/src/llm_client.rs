use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::{LlmConfig, LlmProvider};
use crate::http_client::build_http_client_with_timeout;

const ANTHROPIC_DEFAULT_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// One prompt sent to the model
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Model output. `truncated` is set when the provider stopped on the token limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub truncated: bool,
}

impl Completion {
    pub fn complete(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            truncated: false,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LlmError {
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
    #[error("model client misconfigured: {0}")]
    Configuration(String),
    #[error("cancelled before the call was issued")]
    Cancelled,
}

impl LlmError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Timeout(_) | LlmError::Transport(_) => true,
            LlmError::Http { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            LlmError::MalformedResponse(_) | LlmError::Configuration(_) | LlmError::Cancelled => {
                false
            }
        }
    }

    fn from_reqwest(error: reqwest::Error, timeout: Duration) -> Self {
        if error.is_timeout() {
            LlmError::Timeout(timeout)
        } else {
            LlmError::Transport(error.to_string())
        }
    }
}

/// Text-in/text-out model capability consumed by the generator and the tagger
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError>;

    /// Provider/model label for logs
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<Message>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// HTTP model client for an OpenAI-compatible or Anthropic endpoint
#[derive(Clone)]
pub struct LlmClient {
    provider: LlmProvider,
    api_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let client = build_http_client_with_timeout(Some(timeout))?;

        let mut api_url = config.api_url.trim().trim_end_matches('/').to_string();
        if config.provider == LlmProvider::Anthropic && api_url.contains("localhost:11434") {
            api_url = ANTHROPIC_DEFAULT_URL.to_string();
        }

        Ok(Self {
            provider: config.provider,
            api_url,
            api_key: config.api_key.clone().unwrap_or_default(),
            model: config.model.clone(),
            timeout,
            client,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Cheap round-trip confirming connectivity and a non-empty answer
    pub async fn preflight(&self) -> Result<String> {
        let request = CompletionRequest {
            system: "Reply with the single word: ok".to_string(),
            user: "ok".to_string(),
            temperature: 0.0,
            max_tokens: 16,
        };
        let completion = self
            .complete(&request)
            .await
            .map_err(anyhow::Error::new)
            .context("Preflight call failed")?;
        let text = completion.text.trim().to_string();
        if text.is_empty() {
            anyhow::bail!("Preflight returned an empty answer");
        }
        Ok(text)
    }

    async fn send_json<B: Serialize>(
        &self,
        req: reqwest::RequestBuilder,
        body: &B,
    ) -> Result<String, LlmError> {
        let response = req
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::from_reqwest(e, self.timeout))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::from_reqwest(e, self.timeout))?;

        if !status.is_success() {
            return Err(LlmError::Http {
                status: status.as_u16(),
                body: text.chars().take(500).collect(),
            });
        }
        Ok(text)
    }

    async fn complete_openai(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let url = format!("{}/chat/completions", self.api_url);
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: request.system.clone(),
                },
                Message {
                    role: "user".to_string(),
                    content: request.user.clone(),
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let mut req = self.client.post(&url);
        // Local servers (Ollama, LM Studio) accept requests without a key
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let raw = self.send_json(req, &body).await?;
        parse_openai_response(&raw)
    }

    async fn complete_anthropic(
        &self,
        request: &CompletionRequest,
    ) -> Result<Completion, LlmError> {
        if self.api_key.is_empty() {
            return Err(LlmError::Configuration(
                "ANTHROPIC_API_KEY / llm.api_key is not set".to_string(),
            ));
        }
        let url = format!("{}/v1/messages", self.api_url);
        let body = AnthropicRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            system: &request.system,
            messages: vec![Message {
                role: "user".to_string(),
                content: request.user.clone(),
            }],
            temperature: request.temperature,
        };

        let req = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION);

        let raw = self.send_json(req, &body).await?;
        parse_anthropic_response(&raw)
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        match self.provider {
            LlmProvider::OpenAi => self.complete_openai(request).await,
            LlmProvider::Anthropic => self.complete_anthropic(request).await,
        }
    }

    fn describe(&self) -> String {
        format!("{:?}:{}", self.provider, self.model)
    }
}

fn parse_openai_response(raw: &str) -> Result<Completion, LlmError> {
    let completion: ChatCompletionResponse =
        serde_json::from_str(raw).map_err(|e| LlmError::MalformedResponse(e.to_string()))?;
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::MalformedResponse("no choices in response".to_string()))?;
    Ok(Completion {
        text: choice.message.content.unwrap_or_default(),
        truncated: choice.finish_reason.as_deref() == Some("length"),
    })
}

fn parse_anthropic_response(raw: &str) -> Result<Completion, LlmError> {
    let response: AnthropicResponse =
        serde_json::from_str(raw).map_err(|e| LlmError::MalformedResponse(e.to_string()))?;
    let text = response
        .content
        .into_iter()
        .filter(|block| block.kind == "text")
        .filter_map(|block| block.text)
        .collect::<Vec<_>>()
        .join("");
    Ok(Completion {
        text,
        truncated: response.stop_reason.as_deref() == Some("max_tokens"),
    })
}

/// Parse a JSON payload out of model text, tolerating `<think>` preambles,
/// markdown code fences and prose around a single top-level object.
pub fn parse_json_response<T>(response: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    if let Ok(parsed) = serde_json::from_str::<T>(response) {
        return Ok(parsed);
    }

    let cleaned = if let Some(think_end) = response.rfind("</think>") {
        &response[think_end + 8..]
    } else {
        response
    };

    if let Ok(parsed) = serde_json::from_str::<T>(cleaned.trim()) {
        return Ok(parsed);
    }

    let json_content = if let Some(start) = cleaned.find("```json") {
        let after_start = &cleaned[start + 7..];
        if let Some(end) = after_start.find("```") {
            after_start[..end].trim()
        } else {
            cleaned
        }
    } else if let Some(start) = cleaned.find('{') {
        match cleaned.rfind('}') {
            Some(end) if end > start => &cleaned[start..=end],
            _ => cleaned,
        }
    } else {
        cleaned
    };

    serde_json::from_str::<T>(json_content.trim()).with_context(|| {
        format!(
            "Failed to parse JSON. Original: {}",
            response.chars().take(300).collect::<String>()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn openai_length_finish_marks_truncation() {
        let raw = r##"{"choices":[{"message":{"role":"assistant","content":"# Anna"},"finish_reason":"length"}]}"##;
        let completion = parse_openai_response(raw).expect("parse");
        assert_eq!(completion.text, "# Anna");
        assert!(completion.truncated);

        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"ok"},"finish_reason":"stop"}]}"#;
        assert!(!parse_openai_response(raw).unwrap().truncated);
    }

    #[test]
    fn openai_without_choices_is_malformed() {
        let err = parse_openai_response(r#"{"choices":[]}"#).unwrap_err();
        assert!(matches!(err, LlmError::MalformedResponse(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn anthropic_joins_text_blocks() {
        let raw = r##"{"content":[{"type":"text","text":"# Boris"},{"type":"text","text":"\nbody"}],"stop_reason":"max_tokens"}"##;
        let completion = parse_anthropic_response(raw).expect("parse");
        assert_eq!(completion.text, "# Boris\nbody");
        assert!(completion.truncated);
    }

    #[test]
    fn retry_classification() {
        assert!(LlmError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(LlmError::Transport("reset".into()).is_retryable());
        assert!(LlmError::Http { status: 429, body: String::new() }.is_retryable());
        assert!(LlmError::Http { status: 503, body: String::new() }.is_retryable());
        assert!(!LlmError::Http { status: 401, body: String::new() }.is_retryable());
        assert!(!LlmError::Cancelled.is_retryable());
    }

    #[test]
    fn json_extraction_handles_fences_and_think_blocks() {
        let fenced = "Here you go:\n```json\n{\"tags\": []}\n```";
        let value: Value = parse_json_response(fenced).expect("fenced");
        assert!(value["tags"].is_array());

        let thinking = "<think>hmm</think>\n{\"tags\": {\"style\": \"formal\"}}";
        let value: Value = parse_json_response(thinking).expect("think");
        assert_eq!(value["tags"]["style"], "formal");

        let prose = "Result: {\"a\": 1} done";
        let value: Value = parse_json_response(prose).expect("prose");
        assert_eq!(value["a"], 1);

        assert!(parse_json_response::<Value>("no json here").is_err());
    }

    #[test]
    fn closing_brace_before_opening_brace_is_an_error() {
        assert!(parse_json_response::<Value>("I skipped the } part, see {").is_err());
        assert!(parse_json_response::<Value>("Note: } then {").is_err());
    }

    #[test]
    fn anthropic_default_url_replaces_local_default() {
        let config = LlmConfig {
            provider: LlmProvider::Anthropic,
            ..LlmConfig::default()
        };
        let client = LlmClient::from_config(&config).expect("client");
        assert_eq!(client.api_url, ANTHROPIC_DEFAULT_URL);
        assert_eq!(client.describe(), format!("Anthropic:{}", config.model));
    }
}
