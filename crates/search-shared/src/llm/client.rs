use std::pin::Pin;

use async_trait::async_trait;
use futures::stream::Stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::types::{
    LlmConfig, LlmError, LlmMessage, LlmRole, StreamDelta, ToolCall, ToolCallDelta, ToolChoice,
    ToolDefinition,
};

pub type LlmStream = Pin<Box<dyn Stream<Item = Result<StreamDelta, LlmError>> + Send>>;

/// The only surface the answer pipeline needs from a provider: streaming
/// completion with optional function calling.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn config(&self) -> &LlmConfig;

    async fn complete(
        &self,
        messages: &[LlmMessage],
        tools: Option<&[ToolDefinition]>,
        tool_choice: Option<ToolChoice>,
        structured_response_format: Option<serde_json::Value>,
    ) -> Result<String, LlmError>;

    async fn stream(
        &self,
        messages: &[LlmMessage],
        tools: Option<&[ToolDefinition]>,
        tool_choice: Option<ToolChoice>,
        structured_response_format: Option<serde_json::Value>,
    ) -> Result<LlmStream, LlmError>;
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct WireToolCall {
    id: String,
    r#type: &'static str,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    index: usize,
    id: Option<String>,
    function: Option<ChunkFunction>,
}

#[derive(Debug, Deserialize)]
struct ChunkFunction {
    name: Option<String>,
    arguments: Option<String>,
}

/// Provider client speaking the OpenAI-compatible chat completions wire
/// format over SSE.
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    config: LlmConfig,
    temperature: f32,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        config: LlmConfig,
        timeout: std::time::Duration,
        temperature: f32,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            api_key,
            config,
            temperature,
        }
    }

    fn build_body(
        &self,
        messages: &[LlmMessage],
        tools: Option<&[ToolDefinition]>,
        tool_choice: Option<ToolChoice>,
        structured_response_format: Option<serde_json::Value>,
        stream: bool,
    ) -> serde_json::Value {
        let wire_messages: Vec<WireMessage> = messages
            .iter()
            .map(|m| WireMessage {
                role: match m.role {
                    LlmRole::System => "system",
                    LlmRole::User => "user",
                    LlmRole::Assistant => "assistant",
                    LlmRole::Tool => "tool",
                },
                content: &m.content,
                tool_calls: if m.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        m.tool_calls
                            .iter()
                            .map(|tc| WireToolCall {
                                id: tc.id.clone(),
                                r#type: "function",
                                function: WireFunction {
                                    name: tc.name.clone(),
                                    arguments: tc.arguments.to_string(),
                                },
                            })
                            .collect(),
                    )
                },
                tool_call_id: m.tool_call_id.as_deref(),
            })
            .collect();

        let mut body = serde_json::json!({
            "model": self.config.model_name,
            "messages": wire_messages,
            "temperature": self.temperature,
            "stream": stream,
        });

        if let Some(tools) = tools {
            if !tools.is_empty() {
                body["tools"] = serde_json::Value::Array(
                    tools
                        .iter()
                        .map(|t| {
                            serde_json::json!({
                                "type": "function",
                                "function": {
                                    "name": t.name,
                                    "description": t.description,
                                    "parameters": t.parameters,
                                },
                            })
                        })
                        .collect(),
                );
                if let Some(choice) = tool_choice {
                    body["tool_choice"] = match choice {
                        ToolChoice::Auto => serde_json::json!("auto"),
                        ToolChoice::Required => serde_json::json!("required"),
                    };
                }
            }
        }

        if let Some(format) = structured_response_format {
            body["response_format"] = format;
        }

        body
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response, LlmError> {
        let mut request = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| LlmError::Api(format!("failed to call LLM API: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 {
            return Err(LlmError::RateLimited(text));
        }
        if status.as_u16() == 400 && text.contains("context") && text.contains("length") {
            return Err(LlmError::ContextOverflow(text));
        }
        Err(LlmError::Api(format!("LLM API error: {status} - {text}")))
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    fn config(&self) -> &LlmConfig {
        &self.config
    }

    async fn complete(
        &self,
        messages: &[LlmMessage],
        tools: Option<&[ToolDefinition]>,
        tool_choice: Option<ToolChoice>,
        structured_response_format: Option<serde_json::Value>,
    ) -> Result<String, LlmError> {
        let body = self.build_body(messages, tools, tool_choice, structured_response_format, false);
        let response = self.send(&body).await?;

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Api(format!("bad completion payload: {e}")))?;

        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    async fn stream(
        &self,
        messages: &[LlmMessage],
        tools: Option<&[ToolDefinition]>,
        tool_choice: Option<ToolChoice>,
        structured_response_format: Option<serde_json::Value>,
    ) -> Result<LlmStream, LlmError> {
        debug!("Starting LLM stream with {} messages", messages.len());
        let body = self.build_body(messages, tools, tool_choice, structured_response_format, true);
        let response = self.send(&body).await?;

        let byte_stream = response.bytes_stream();

        // Parse the SSE stream; a single network chunk may carry several
        // "data: " lines and a line may split across chunks.
        let parsed_stream = futures::stream::unfold(
            (byte_stream, String::new(), false),
            |(mut stream, mut buffer, mut done)| async move {
                loop {
                    if done {
                        return None;
                    }

                    // Emit the first complete event in the buffer
                    if let Some(newline_idx) = buffer.find('\n') {
                        let line = buffer[..newline_idx].trim().to_string();
                        buffer.drain(..=newline_idx);

                        let Some(json_str) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        if json_str == "[DONE]" {
                            return None;
                        }
                        let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(json_str)
                        else {
                            continue;
                        };

                        let delta = chunk
                            .choices
                            .into_iter()
                            .next()
                            .map(|c| c.delta)
                            .unwrap_or(ChunkDelta {
                                content: None,
                                tool_calls: None,
                            });

                        let tool_call = delta.tool_calls.and_then(|calls| {
                            calls.into_iter().next().map(|tc| ToolCallDelta {
                                index: tc.index,
                                id: tc.id,
                                name: tc.function.as_ref().and_then(|f| f.name.clone()),
                                arguments_fragment: tc
                                    .function
                                    .and_then(|f| f.arguments)
                                    .unwrap_or_default(),
                            })
                        });

                        if delta.content.is_none() && tool_call.is_none() {
                            continue;
                        }

                        return Some((
                            Ok(StreamDelta {
                                content: delta.content,
                                tool_call,
                            }),
                            (stream, buffer, done),
                        ));
                    }

                    match stream.next().await {
                        Some(Ok(bytes)) => {
                            buffer.push_str(&String::from_utf8_lossy(&bytes));
                        }
                        Some(Err(e)) => {
                            done = true;
                            return Some((
                                Err(LlmError::Stream(format!("stream error: {e}"))),
                                (stream, buffer, done),
                            ));
                        }
                        None => return None,
                    }
                }
            },
        );

        Ok(Box::pin(parsed_stream))
    }
}

/// Accumulates tool-call deltas streamed across many chunks into complete
/// tool calls.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: Vec<(Option<String>, Option<String>, String)>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: ToolCallDelta) {
        while self.calls.len() <= delta.index {
            self.calls.push((None, None, String::new()));
        }
        let slot = &mut self.calls[delta.index];
        if let Some(id) = delta.id {
            slot.0 = Some(id);
        }
        if let Some(name) = delta.name {
            slot.1 = Some(name);
        }
        slot.2.push_str(&delta.arguments_fragment);
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn finish(self) -> Vec<ToolCall> {
        self.calls
            .into_iter()
            .filter_map(|(id, name, args)| {
                let name = name?;
                let arguments = if args.trim().is_empty() {
                    serde_json::json!({})
                } else {
                    serde_json::from_str(&args).ok()?
                };
                Some(ToolCall {
                    id: id.unwrap_or_else(|| format!("call_{name}")),
                    name,
                    arguments,
                })
            })
            .collect()
    }
}
