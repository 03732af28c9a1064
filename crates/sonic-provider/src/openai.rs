//! Chat-completions provider for OpenAI and any OpenAI-compatible endpoint
//! (see `openai_compat`). Shares the request/response shape used by
//! DeepSeek, Groq, Ollama, OpenRouter, Together and Fireworks.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_core::Stream;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::StreamExt;

use crate::{ContentBlock, LlmProvider, LlmRequest, LlmResponse, StreamChunk};

#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn to_api_request(request: LlmRequest, stream: bool) -> ApiRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = request.system {
            messages.push(ApiMessage {
                role: "system".to_string(),
                content: system,
            });
        }
        for m in request.messages {
            messages.push(ApiMessage {
                role: m.role,
                content: m.text(),
            });
        }

        let tools: Vec<ApiTool> = request
            .tools
            .into_iter()
            .map(|t| ApiTool {
                tool_type: "function".to_string(),
                function: ApiFunction {
                    name: t.name,
                    description: t.description,
                    parameters: t.input_schema,
                },
            })
            .collect();

        ApiRequest {
            model: request.model,
            messages,
            max_tokens: request.max_tokens,
            tools: if tools.is_empty() { None } else { Some(tools) },
            temperature: request.temperature,
            stream,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/chat/completions", self.api_base);
        let payload = Self::to_api_request(request, false);

        let req = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&payload);

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(anyhow!("openai api error (timeout) [retryable]: request timed out after 60s"));
            }
            Err(e) if e.is_connect() => {
                return Err(anyhow!("openai api error (connect) [retryable]: {e}"));
            }
            Err(e) => return Err(e.into()),
        };

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await?;
            return Err(anyhow!("openai api error ({status}): {text}"));
        }

        let body: ApiResponse = resp.json().await?;
        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("openai response had no choices"))?;
        let text = choice.message.content.unwrap_or_default();

        Ok(LlmResponse {
            content: vec![ContentBlock::Text { text: text.clone() }],
            text,
            input_tokens: body.usage.as_ref().map(|u| u.prompt_tokens),
            output_tokens: body.usage.as_ref().map(|u| u.completion_tokens),
            stop_reason: choice.finish_reason,
        })
    }

    async fn stream(
        &self,
        request: LlmRequest,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>> {
        let url = format!("{}/chat/completions", self.api_base);
        let payload = Self::to_api_request(request, true);

        let req = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&payload);

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(anyhow!("openai api error (timeout) [retryable]: request timed out after 60s"));
            }
            Err(e) if e.is_connect() => {
                return Err(anyhow!("openai api error (connect) [retryable]: {e}"));
            }
            Err(e) => return Err(e.into()),
        };

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await?;
            return Err(anyhow!("openai api error ({status}): {text}"));
        }

        Ok(Box::pin(parse_sse_stream(resp.bytes_stream())))
    }
}

fn parse_sse_stream(
    byte_stream: impl Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
) -> impl Stream<Item = Result<StreamChunk>> + Send {
    async_stream::stream! {
        tokio::pin!(byte_stream);
        let mut buffer = String::new();

        while let Some(chunk_result) = byte_stream.next().await {
            match chunk_result {
                Ok(bytes) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));

                    while let Some(pos) = buffer.find('\n') {
                        let line = buffer[..pos].trim().to_string();
                        buffer = buffer[pos + 1..].to_string();

                        let Some(data) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        if data == "[DONE]" {
                            yield Ok(StreamChunk {
                                delta: String::new(),
                                is_final: true,
                                input_tokens: None,
                                output_tokens: None,
                                stop_reason: None,
                                content_blocks: vec![],
                            });
                            continue;
                        }

                        match serde_json::from_str::<StreamEvent>(data) {
                            Ok(event) => {
                                let choice = event.choices.into_iter().next();
                                let delta = choice
                                    .as_ref()
                                    .and_then(|c| c.delta.content.clone())
                                    .unwrap_or_default();
                                let finish_reason = choice.and_then(|c| c.finish_reason);
                                yield Ok(StreamChunk {
                                    delta,
                                    is_final: finish_reason.is_some(),
                                    input_tokens: None,
                                    output_tokens: None,
                                    stop_reason: finish_reason,
                                    content_blocks: vec![],
                                });
                            }
                            Err(e) => {
                                yield Err(anyhow!("invalid sse event payload: {e}"));
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    yield Err(anyhow!("stream error: {e}"));
                    return;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: ApiFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiChoice {
    message: ApiChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamEvent {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LlmMessage;

    #[test]
    fn openai_new_trims_trailing_slash() {
        let provider = OpenAiProvider::new("sk-test", "https://api.openai.com/v1/");
        assert_eq!(provider.api_base, "https://api.openai.com/v1");
    }

    #[test]
    fn to_api_request_prepends_system_message() {
        let req = LlmRequest {
            model: "gpt-4o".into(),
            system: Some("be terse".into()),
            messages: vec![LlmMessage::user("hi")],
            max_tokens: 512,
            tools: vec![],
            temperature: None,
        };
        let api_req = OpenAiProvider::to_api_request(req, false);
        assert_eq!(api_req.messages[0].role, "system");
        assert_eq!(api_req.messages[1].role, "user");
        assert!(!api_req.stream);
    }

    #[test]
    fn to_api_request_without_system_has_no_system_message() {
        let req = LlmRequest::simple("gpt-4o".into(), None, "hi".into());
        let api_req = OpenAiProvider::to_api_request(req, true);
        assert_eq!(api_req.messages.len(), 1);
        assert!(api_req.stream);
    }
}
