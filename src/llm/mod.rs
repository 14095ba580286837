use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("LLM server returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("No choices in response")]
    EmptyResponse,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: usize,
    #[serde(default)]
    pub completion_tokens: usize,
    #[serde(default)]
    pub total_tokens: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

/// A single chat-completion call. `json_response` asks the server for a JSON object body.
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub json_response: bool,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            temperature: None,
            max_tokens: None,
            json_response: false,
        }
    }

    pub fn json(mut self) -> Self {
        self.json_response = true;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[derive(Clone, Debug)]
pub struct Completion {
    pub content: String,
    pub usage: Option<Usage>,
    pub model: String,
}

/// Anything that can answer a chat-completion request.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError>;

    fn model_name(&self) -> String;
}

#[derive(Deserialize, Debug)]
pub struct ModelListResponse {
    pub data: Vec<ModelInfo>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ModelInfo {
    pub id: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<Usage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
}

impl LlmClient {
    pub fn new(base_url: Option<String>, model: Option<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: model.unwrap_or_else(|| "gpt-4-turbo".to_string()),
            api_key,
            temperature: 0.0,
            max_tokens: 4096,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut client = Self::new(
            Some(config.llm_base_url()),
            Some(config.llm_model.clone()),
            config.llm_api_key.clone(),
        );
        client.temperature = config.llm_temperature;
        client.max_tokens = config.llm_max_tokens;
        client
    }

    fn authorize(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
            // OpenRouter specific headers
            if self.base_url.contains("openrouter") {
                builder = builder
                    .header("HTTP-Referer", "http://localhost:8080")
                    .header("X-Title", "certex");
            }
        }
        builder
    }

    pub async fn fetch_models(&self) -> Result<Vec<String>, LlmError> {
        let url = format!("{}/models", self.base_url);
        let resp = self.authorize(self.client.get(&url)).send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Server { status, body });
        }

        let body: ModelListResponse = resp.json().await?;
        Ok(body.data.into_iter().map(|m| m.id).collect())
    }
}

#[async_trait]
impl CompletionService for LlmClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);

        let req = ChatRequest {
            model: self.model.clone(),
            messages: request.messages,
            temperature: request.temperature.unwrap_or(self.temperature),
            max_tokens: Some(request.max_tokens.unwrap_or(self.max_tokens)),
            response_format: request
                .json_response
                .then_some(ResponseFormat { kind: "json_object" }),
        };

        tracing::debug!(model = %self.model, json = request.json_response, "Sending chat completion");
        let resp = self.authorize(self.client.post(&url).json(&req)).send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Server { status, body });
        }

        let body: ChatResponse = resp.json().await?;
        let content = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or(LlmError::EmptyResponse)?;

        Ok(Completion {
            content,
            usage: body.usage,
            model: body.model.unwrap_or_else(|| self.model.clone()),
        })
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }
}

/// Recovers a JSON object from model output.
///
/// Tries, in order: a ```json fenced block, any ``` fenced block, the whole
/// text, and finally the span from the first `{` to the last `}`.
pub fn parse_json_object(text: &str) -> Option<serde_json::Map<String, Value>> {
    let trimmed = text.trim();

    let mut candidates: Vec<&str> = Vec::new();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + "```json".len()..];
        if let Some(end) = rest.find("```") {
            candidates.push(rest[..end].trim());
        }
    } else if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        if let Some(end) = rest.find("```") {
            candidates.push(rest[..end].trim());
        }
    }
    candidates.push(trimmed);
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            candidates.push(&trimmed[start..=end]);
        }
    }

    candidates.into_iter().find_map(|candidate| {
        match serde_json::from_str::<Value>(candidate) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_object() {
        let map = parse_json_object(r#"{"a": 1}"#).unwrap();
        assert_eq!(map["a"], 1);
    }

    #[test]
    fn parses_json_fence() {
        let text = "Here you go:\n```json\n{\"insured\": {\"name\": \"Acme\"}}\n```\nThanks";
        let map = parse_json_object(text).unwrap();
        assert_eq!(map["insured"]["name"], "Acme");
    }

    #[test]
    fn parses_bare_fence() {
        let map = parse_json_object("```\n{\"x\": true}\n```").unwrap();
        assert_eq!(map["x"], true);
    }

    #[test]
    fn extracts_braced_span_from_prose() {
        let map = parse_json_object("Sure! {\"k\": \"v\"} hope that helps").unwrap();
        assert_eq!(map["k"], "v");
    }

    #[test]
    fn rejects_non_objects_and_garbage() {
        assert!(parse_json_object("[1, 2, 3]").is_none());
        assert!(parse_json_object("no json here").is_none());
        assert!(parse_json_object("").is_none());
    }

    #[test]
    fn json_request_serializes_response_format() {
        let req = ChatRequest {
            model: "m".into(),
            messages: vec![ChatMessage::user("hi")],
            temperature: 0.0,
            max_tokens: None,
            response_format: Some(ResponseFormat { kind: "json_object" }),
        };
        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(body["response_format"]["type"], "json_object");
        assert!(body.get("max_tokens").is_none());
    }
}
