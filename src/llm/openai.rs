//! OpenAI-compatible chat completions client.

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::{LlmClient, Message, Role, ToolCall};
use crate::config::LlmConfig;
use crate::tools::ToolSpec;
use crate::{mlog_debug, mlog_trace, Error, Result};

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Function names on the wire may not contain `:`.
const WIRE_SEPARATOR: &str = "---";

pub struct OpenAiClient {
    client: Client,
    endpoint: String,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: WireFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

fn to_wire_name(name: &str) -> String {
    name.replace(':', WIRE_SEPARATOR)
}

fn from_wire_name(name: &str) -> String {
    name.replacen(WIRE_SEPARATOR, ":", 1)
}

impl OpenAiClient {
    /// Build a client. The key comes from `api_key`, else the environment
    /// variable named by `api_key_env`; an empty key sends no auth header.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = match &config.api_key {
            Some(secret) => secret.expose().to_string(),
            None => std::env::var(&config.api_key_env).unwrap_or_default(),
        };

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        if !api_key.is_empty() {
            let mut auth = header::HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|_| Error::Config("invalid characters in API key".into()))?;
            auth.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, auth);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        let endpoint = format!(
            "{}/chat/completions",
            config
                .base_url
                .as_deref()
                .unwrap_or(DEFAULT_ENDPOINT)
                .trim_end_matches('/')
        );
        let model = if config.model.is_empty() {
            DEFAULT_MODEL.to_string()
        } else {
            config.model.clone()
        };

        mlog_debug!(
            "OpenAiClient endpoint={} model={} api_key={}",
            endpoint,
            model,
            crate::log::redact(&api_key)
        );

        Ok(Self {
            client,
            endpoint,
            model,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    fn to_wire(message: &Message) -> WireMessage {
        let tool_calls = if message.tool_calls.is_empty() {
            None
        } else {
            Some(
                message
                    .tool_calls
                    .iter()
                    .map(|call| WireToolCall {
                        id: call.id.clone(),
                        call_type: function_type(),
                        function: WireFunctionCall {
                            name: to_wire_name(&call.name),
                            arguments: call.arguments.to_string(),
                        },
                    })
                    .collect(),
            )
        };
        WireMessage {
            role: message.role.to_string(),
            content: Some(message.content.clone()),
            tool_calls,
            tool_call_id: message.tool_call_id.clone(),
        }
    }

    fn from_wire(message: WireMessage) -> Message {
        let tool_calls = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| {
                // Arguments stay a JSON string when they do not parse; the
                // registry decodes strings again before dispatch.
                let arguments = serde_json::from_str(&call.function.arguments)
                    .unwrap_or(Value::String(call.function.arguments));
                ToolCall {
                    id: call.id,
                    name: from_wire_name(&call.function.name),
                    arguments,
                }
            })
            .collect();
        Message {
            role: Role::Assistant,
            content: message.content.unwrap_or_default(),
            tool_calls,
            tool_call_id: None,
            name: None,
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn generate(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<Message> {
        let request = CompletionRequest {
            model: &self.model,
            messages: messages.iter().map(Self::to_wire).collect(),
            tools: tools
                .iter()
                .map(|spec| WireTool {
                    tool_type: "function",
                    function: WireFunction {
                        name: to_wire_name(&spec.name),
                        description: spec.description.clone(),
                        parameters: spec.parameters.clone(),
                    },
                })
                .collect(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        mlog_trace!(
            "OpenAI request: {}",
            serde_json::to_string(&request).unwrap_or_default()
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Llm(format!("request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Llm(format!("failed to read response: {}", e)))?;
        mlog_trace!("OpenAI response ({}): {}", status, body);

        if !status.is_success() {
            let detail = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(Error::Llm(format!("{}: {}", status, detail)));
        }

        let parsed: CompletionResponse = serde_json::from_str(&body)?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Llm("response contained no choices".into()))?;
        Ok(Self::from_wire(choice.message))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
