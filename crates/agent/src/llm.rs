use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use cartwheel_core::config::{LlmConfig, LlmProvider};
use cartwheel_core::domain::tool::ToolKind;

#[derive(Clone, Debug, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

impl ToolSpec {
    pub fn for_kind(kind: ToolKind) -> Self {
        Self {
            name: kind.name().to_owned(),
            description: kind.description().to_owned(),
            schema: kind.argument_schema(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ToolChoice {
    Auto,
    /// Force the named tool; `arguments` are the engine's expected arguments,
    /// enforced after the call in case the model drops or mangles them.
    Forced { name: String, arguments: Value },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PromptRole {
    User,
    Assistant,
    /// Synthetic turn carrying serialized tool results back to the model.
    Tool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub messages: Vec<PromptMessage>,
    pub tools: Vec<ToolSpec>,
    pub tool_choice: ToolChoice,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    Length,
    Other,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Completion {
    pub text: String,
    pub tokens_used: u32,
    pub stop_reason: StopReason,
    pub tool_invocations: Vec<ToolInvocation>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("completion request timed out")]
    Timeout,
    #[error("completion transport failure: {0}")]
    Transport(String),
    #[error("completion api returned status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("completion payload was malformed: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError>;
}

/// Chat-completions client. All configured providers expose the
/// OpenAI-compatible `/chat/completions` wire format, so one client covers
/// openai, anthropic, and ollama; only base url and auth header differ.
pub struct HttpCompletionProvider {
    client: reqwest::Client,
    provider: LlmProvider,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
}

impl HttpCompletionProvider {
    pub fn from_config(config: &LlmConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| ProviderError::Transport(error.to_string()))?;

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| default_base_url(config.provider).to_owned());

        Ok(Self {
            client,
            provider: config.provider,
            base_url: base_url.trim_end_matches('/').to_owned(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

fn default_base_url(provider: LlmProvider) -> &'static str {
    match provider {
        LlmProvider::OpenAi => "https://api.openai.com/v1",
        LlmProvider::Anthropic => "https://api.anthropic.com/v1",
        LlmProvider::Ollama => "http://localhost:11434/v1",
    }
}

#[async_trait]
impl CompletionProvider for HttpCompletionProvider {
    fn name(&self) -> &'static str {
        self.provider.as_str()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError> {
        let body = build_request_body(&self.model, &request);
        let url = format!("{}/chat/completions", self.base_url);

        let mut http_request = self.client.post(&url).json(&body);
        if let Some(api_key) = &self.api_key {
            http_request = http_request.bearer_auth(api_key.expose_secret());
        }

        let response = http_request.send().await.map_err(|error| {
            if error.is_timeout() {
                ProviderError::Timeout
            } else {
                ProviderError::Transport(error.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status: status.as_u16(), message });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|error| ProviderError::Malformed(error.to_string()))?;

        let completion = parse_completion(&payload)?;
        debug!(
            event_name = "llm.completion",
            provider = self.name(),
            tokens_used = completion.tokens_used,
            tool_invocations = completion.tool_invocations.len(),
            "completion received"
        );
        Ok(completion)
    }
}

pub(crate) fn build_request_body(model: &str, request: &CompletionRequest) -> Value {
    let mut messages = vec![json!({ "role": "system", "content": request.system_prompt })];
    for message in &request.messages {
        let role = match message.role {
            PromptRole::User => "user",
            PromptRole::Assistant => "assistant",
            // Tool results travel as a synthetic user turn so the exchange
            // stays valid without per-call ids.
            PromptRole::Tool => "user",
        };
        messages.push(json!({ "role": role, "content": message.content }));
    }

    let mut body = json!({ "model": model, "messages": messages });

    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.schema,
                    }
                })
            })
            .collect();
        body["tools"] = Value::Array(tools);
        body["tool_choice"] = match &request.tool_choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::Forced { name, .. } => {
                json!({ "type": "function", "function": { "name": name } })
            }
        };
    }

    body
}

pub(crate) fn parse_completion(payload: &Value) -> Result<Completion, ProviderError> {
    let message = payload
        .pointer("/choices/0/message")
        .ok_or_else(|| ProviderError::Malformed("missing choices[0].message".to_owned()))?;

    let text = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();

    let mut tool_invocations = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for (index, call) in calls.iter().enumerate() {
            let name = call
                .pointer("/function/name")
                .and_then(Value::as_str)
                .ok_or_else(|| ProviderError::Malformed("tool call without a name".to_owned()))?;
            let raw_arguments =
                call.pointer("/function/arguments").and_then(Value::as_str).unwrap_or("{}");
            let arguments: Value = serde_json::from_str(raw_arguments).map_err(|error| {
                ProviderError::Malformed(format!("tool call arguments for `{name}`: {error}"))
            })?;
            let id = call
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| format!("call-{index}"));
            tool_invocations.push(ToolInvocation { id, name: name.to_owned(), arguments });
        }
    }

    let stop_reason = match payload.pointer("/choices/0/finish_reason").and_then(Value::as_str) {
        Some("stop") => StopReason::EndTurn,
        Some("tool_calls") => StopReason::ToolUse,
        Some("length") => StopReason::Length,
        _ => StopReason::Other,
    };

    let tokens_used =
        payload.pointer("/usage/total_tokens").and_then(Value::as_u64).unwrap_or(0) as u32;

    Ok(Completion { text, tokens_used, stop_reason, tool_invocations })
}
