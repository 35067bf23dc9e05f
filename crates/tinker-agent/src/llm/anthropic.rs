//! Anthropic Messages API backend.
//!
//! Translates the normalized model to and from the Messages API wire format
//! and normalizes the SSE event stream into [`Delta`]s.  An ephemeral
//! `cache_control` hint is attached to the system prompt and to the final
//! content block of the final message on streaming requests -- a cost
//! optimization the API is free to ignore.

use futures::StreamExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::llm::gateway::{ChatRequest, StreamProducer, error_for_status};
use crate::llm::sse::{LineBuffer, SseEvent, SseLineParser};
use crate::llm::types::{
    ContentBlock, Delta, Message, MessageContent, MessageParam, MessageResponse, Role, TextContent,
    ToolDefinition, ToolUseContent, Usage,
};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 16384;

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

pub(crate) async fn prompt(
    http: &reqwest::Client,
    api_key: &str,
    base_url: Option<&str>,
    request: &ChatRequest,
) -> Result<MessageResponse> {
    let body = build_request_body(request, false);
    let response = send(http, api_key, base_url, &body).await?;
    let v: Value = response.json().await.map_err(|e| AgentError::ParseFailed {
        reason: format!("invalid JSON response: {e}"),
    })?;
    parse_response(&v)
}

pub(crate) async fn open_stream(
    http: &reqwest::Client,
    api_key: &str,
    base_url: Option<&str>,
    request: &ChatRequest,
) -> Result<reqwest::Response> {
    let body = build_request_body(request, true);
    send(http, api_key, base_url, &body).await
}

pub(crate) async fn drive_stream(
    response: reqwest::Response,
    producer: StreamProducer,
    cancel: CancellationToken,
) {
    let mut lines = LineBuffer::new();
    let mut parser = SseLineParser::new();
    let mut acc = Accumulator::default();
    let mut relaying = true;

    let mut byte_stream = response.bytes_stream();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("anthropic stream cancelled");
                producer.finish(Err(AgentError::Cancelled));
                return;
            }
            chunk = byte_stream.next() => chunk,
        };

        match chunk {
            None => break,
            Some(Err(e)) => {
                producer.finish(Err(AgentError::StreamFailed {
                    reason: format!("stream read error: {e}"),
                }));
                return;
            }
            Some(Ok(bytes)) => {
                lines.extend(&bytes);
                loop {
                    let line = match lines.next_line() {
                        Ok(Some(line)) => line,
                        Ok(None) => break,
                        Err(e) => {
                            producer.finish(Err(e));
                            return;
                        }
                    };
                    let Some(event) = parser.feed(&line) else {
                        continue;
                    };
                    match acc.apply(&event) {
                        Ok(delta) => {
                            if relaying && !producer.send(delta).await {
                                relaying = false;
                            }
                        }
                        Err(e) => {
                            producer.finish(Err(e));
                            return;
                        }
                    }
                }
                if acc.complete {
                    break;
                }
            }
        }
    }

    producer.finish(acc.into_response());
}

async fn send(
    http: &reqwest::Client,
    api_key: &str,
    base_url: Option<&str>,
    body: &Value,
) -> Result<reqwest::Response> {
    let url = format!(
        "{}/v1/messages",
        base_url.unwrap_or(ANTHROPIC_BASE_URL)
    );

    let response = http
        .post(&url)
        .header("x-api-key", api_key)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .json(body)
        .send()
        .await?;

    error_for_status(response).await
}

// ---------------------------------------------------------------------------
// Request building
// ---------------------------------------------------------------------------

fn build_request_body(request: &ChatRequest, stream: bool) -> Value {
    let mut messages: Vec<Value> = request.messages.iter().map(message_param_to_wire).collect();

    if stream {
        attach_cache_hint(&mut messages);
    }

    let mut body = json!({
        "model": request.model,
        "max_tokens": MAX_TOKENS,
        "messages": messages,
    });

    if !request.tools.is_empty() {
        body["tools"] = tools_to_wire(&request.tools);
    }

    // The system prompt travels only on streaming requests; one-shot calls
    // are the short-lived sub-agent surface and run bare.
    if stream {
        if let Some(system) = &request.system_prompt {
            body["system"] = json!([{
                "type": "text",
                "text": system,
                "cache_control": {"type": "ephemeral"},
            }]);
        }
        body["stream"] = json!(true);
    }

    body
}

/// Mark the final content block of the final message as a cache breakpoint.
fn attach_cache_hint(messages: &mut [Value]) {
    let Some(last_message) = messages.last_mut() else {
        return;
    };
    if let Some(blocks) = last_message["content"].as_array_mut() {
        if let Some(last_block) = blocks.last_mut() {
            last_block["cache_control"] = json!({"type": "ephemeral"});
        }
    }
}

fn message_param_to_wire(message: &MessageParam) -> Value {
    let content: Vec<Value> = message
        .content
        .iter()
        .map(|block| match block {
            MessageContent::Text(t) => json!({
                "type": "text",
                "text": t.text,
            }),
            MessageContent::ToolUse(t) => json!({
                "type": "tool_use",
                "id": t.id,
                "name": t.name,
                "input": t.input,
            }),
            MessageContent::ToolResult(r) => {
                let content: Vec<Value> = r
                    .content
                    .iter()
                    .map(|t| json!({"type": "text", "text": t.text}))
                    .collect();
                let mut wire = json!({
                    "type": "tool_result",
                    "tool_use_id": r.tool_use_id,
                    "content": content,
                });
                if r.is_error {
                    wire["is_error"] = json!(true);
                }
                wire
            }
        })
        .collect();

    json!({
        "role": message.role,
        "content": content,
    })
}

fn tools_to_wire(tools: &[ToolDefinition]) -> Value {
    let tools: Vec<Value> = tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.input_schema,
            })
        })
        .collect();
    json!(tools)
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

fn parse_role(v: &Value) -> Role {
    match v.as_str() {
        Some("user") => Role::User,
        _ => Role::Assistant,
    }
}

fn parse_usage(v: &Value) -> Usage {
    Usage {
        input_tokens: v["input_tokens"].as_u64().unwrap_or(0),
        output_tokens: v["output_tokens"].as_u64().unwrap_or(0),
        cache_creation_input_tokens: v["cache_creation_input_tokens"].as_u64(),
        cache_read_input_tokens: v["cache_read_input_tokens"].as_u64(),
    }
}

fn parse_response(v: &Value) -> Result<MessageResponse> {
    let blocks = v["content"]
        .as_array()
        .ok_or_else(|| AgentError::ParseFailed {
            reason: "missing `content` array in response".into(),
        })?;

    let mut content: Vec<ContentBlock> = Vec::with_capacity(blocks.len());
    for block in blocks {
        match block["type"].as_str() {
            Some("text") => {
                if let Some(text) = block["text"].as_str() {
                    content.push(ContentBlock::Text(TextContent::new(text)));
                }
            }
            Some("tool_use") => {
                content.push(ContentBlock::ToolUse(ToolUseContent {
                    id: block["id"].as_str().unwrap_or_default().to_owned(),
                    name: block["name"].as_str().unwrap_or_default().to_owned(),
                    input: block["input"].clone(),
                    metadata: None,
                }));
            }
            other => {
                tracing::trace!(block_type = ?other, "skipping unrecognised content block");
            }
        }
    }

    Ok(MessageResponse {
        message: Message {
            role: parse_role(&v["role"]),
            content,
        },
        usage: parse_usage(&v["usage"]),
    })
}

// ---------------------------------------------------------------------------
// Stream accumulation
// ---------------------------------------------------------------------------

/// Assembles SSE events into the final message while normalizing each event
/// into exactly one [`Delta`].
#[derive(Debug, Default)]
struct Accumulator {
    role: Option<Role>,
    blocks: Vec<BlockBuilder>,
    usage: Usage,
    complete: bool,
}

#[derive(Debug)]
enum BlockBuilder {
    Text { text: String },
    ToolUse { id: String, name: String, input_json: String },
    /// A block type the normalizer does not understand.  Its deltas are
    /// ignored and it is dropped from the final message.
    Unknown,
}

impl Accumulator {
    fn apply(&mut self, event: &SseEvent) -> Result<Delta> {
        match event.event.as_deref().unwrap_or_default() {
            "message_start" => {
                let v = parse_json(&event.data)?;
                let message = &v["message"];
                let role = parse_role(&message["role"]);
                self.role = Some(role);
                self.usage = parse_usage(&message["usage"]);
                Ok(Delta::MessageStart { role })
            }

            "content_block_start" => {
                let v = parse_json(&event.data)?;
                let block = &v["content_block"];
                let builder = match block["type"].as_str() {
                    Some("text") => BlockBuilder::Text {
                        text: block["text"].as_str().unwrap_or_default().to_owned(),
                    },
                    Some("tool_use") => BlockBuilder::ToolUse {
                        id: block["id"].as_str().unwrap_or_default().to_owned(),
                        name: block["name"].as_str().unwrap_or_default().to_owned(),
                        input_json: String::new(),
                    },
                    other => {
                        tracing::trace!(block_type = ?other, "unrecognised content block type");
                        BlockBuilder::Unknown
                    }
                };
                self.blocks.push(builder);
                Ok(Delta::Ignored)
            }

            "content_block_delta" => {
                let v = parse_json(&event.data)?;
                let index = v["index"].as_u64().unwrap_or(0) as usize;
                let delta = &v["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        let text = delta["text"].as_str().unwrap_or_default().to_owned();
                        if let Some(BlockBuilder::Text { text: buf }) = self.blocks.get_mut(index) {
                            buf.push_str(&text);
                        }
                        Ok(Delta::TextUpdate { text })
                    }
                    Some("input_json_delta") => {
                        let partial = delta["partial_json"].as_str().unwrap_or_default();
                        if let Some(BlockBuilder::ToolUse { input_json, .. }) =
                            self.blocks.get_mut(index)
                        {
                            input_json.push_str(partial);
                        }
                        Ok(Delta::Ignored)
                    }
                    other => {
                        tracing::trace!(delta_type = ?other, "unrecognised delta type");
                        Ok(Delta::Ignored)
                    }
                }
            }

            "message_delta" => {
                let v = parse_json(&event.data)?;
                if let Some(output) = v["usage"]["output_tokens"].as_u64() {
                    self.usage.output_tokens = output;
                }
                Ok(Delta::Ignored)
            }

            "message_stop" => {
                self.complete = true;
                Ok(Delta::Ignored)
            }

            // content_block_stop, ping, and anything newer.
            other => {
                tracing::trace!(event_type = other, "ignoring SSE event");
                Ok(Delta::Ignored)
            }
        }
    }

    fn into_response(self) -> Result<MessageResponse> {
        let mut content: Vec<ContentBlock> = Vec::with_capacity(self.blocks.len());
        for builder in self.blocks {
            match builder {
                BlockBuilder::Text { text } => {
                    content.push(ContentBlock::Text(TextContent::new(text)));
                }
                BlockBuilder::ToolUse { id, name, input_json } => {
                    let input: Value = if input_json.is_empty() {
                        Value::Object(Default::default())
                    } else {
                        serde_json::from_str(&input_json).map_err(|e| AgentError::ParseFailed {
                            reason: format!("invalid JSON in tool call `{name}` input: {e}"),
                        })?
                    };
                    content.push(ContentBlock::ToolUse(ToolUseContent {
                        id,
                        name,
                        input,
                        metadata: None,
                    }));
                }
                BlockBuilder::Unknown => {}
            }
        }

        Ok(MessageResponse {
            message: Message {
                role: self.role.unwrap_or(Role::Assistant),
                content,
            },
            usage: self.usage,
        })
    }
}

fn parse_json(data: &str) -> Result<Value> {
    serde_json::from_str(data).map_err(|e| AgentError::ParseFailed {
        reason: format!("invalid JSON in SSE data: {e}"),
    })
}
