//! OpenAI Chat Completions backend.
//!
//! Also covers OpenAI-compatible endpoints (local inference servers,
//! gateways) via the gateway's base-URL override.  Tool calls ride as
//! `function` entries with JSON-string arguments, tool results as `role:
//! "tool"` messages, and streaming accumulates `choices[].delta` fragments
//! until the `[DONE]` sentinel.

use futures::StreamExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::llm::gateway::{ChatRequest, StreamProducer, error_for_status};
use crate::llm::sse::{LineBuffer, SseLineParser};
use crate::llm::types::{
    ContentBlock, Delta, Message, MessageContent, MessageParam, MessageResponse, Role, TextContent,
    ToolDefinition, ToolUseContent, Usage,
};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
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
                tracing::debug!("openai stream cancelled");
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
                    match acc.feed_data(&event.data) {
                        Ok(deltas) => {
                            for delta in deltas {
                                if relaying && !producer.send(delta).await {
                                    relaying = false;
                                }
                            }
                        }
                        Err(e) => {
                            producer.finish(Err(e));
                            return;
                        }
                    }
                }
                if acc.done {
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
        "{}/chat/completions",
        base_url.unwrap_or(OPENAI_BASE_URL)
    );

    let response = http
        .post(&url)
        .bearer_auth(api_key)
        .json(body)
        .send()
        .await?;

    error_for_status(response).await
}

// ---------------------------------------------------------------------------
// Request building
// ---------------------------------------------------------------------------

fn build_request_body(request: &ChatRequest, stream: bool) -> Value {
    let mut messages: Vec<Value> = Vec::with_capacity(request.messages.len() + 1);

    if stream {
        if let Some(system) = &request.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
    }

    for message in &request.messages {
        messages.extend(message_param_to_wire(message));
    }

    let mut body = json!({
        "model": request.model,
        "max_tokens": MAX_TOKENS,
        "messages": messages,
    });

    if !request.tools.is_empty() {
        body["tools"] = tools_to_wire(&request.tools);
    }

    if stream {
        body["stream"] = json!(true);
        // Ask for usage in the final chunk; without it streamed calls would
        // report zero tokens.
        body["stream_options"] = json!({"include_usage": true});
    }

    body
}

/// One context entry can expand to several wire messages: tool results each
/// become their own `role: "tool"` entry.
fn message_param_to_wire(message: &MessageParam) -> Vec<Value> {
    let mut wire: Vec<Value> = Vec::new();
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    for block in &message.content {
        match block {
            MessageContent::Text(t) => text_parts.push(&t.text),
            MessageContent::ToolUse(t) => tool_calls.push(json!({
                "id": t.id,
                "type": "function",
                "function": {
                    "name": t.name,
                    "arguments": t.input.to_string(),
                },
            })),
            MessageContent::ToolResult(r) => {
                let text: String = r
                    .content
                    .iter()
                    .map(|t| t.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                wire.push(json!({
                    "role": "tool",
                    "tool_call_id": r.tool_use_id,
                    "content": text,
                }));
            }
        }
    }

    if !text_parts.is_empty() || !tool_calls.is_empty() {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        let mut entry = json!({"role": role});
        if !text_parts.is_empty() {
            entry["content"] = json!(text_parts.join("\n"));
        }
        if !tool_calls.is_empty() {
            entry["tool_calls"] = json!(tool_calls);
        }
        // Tool results were already emitted above; keep conversational
        // content ahead of them in the wire order.
        wire.insert(0, entry);
    }

    wire
}

fn tools_to_wire(tools: &[ToolDefinition]) -> Value {
    let tools: Vec<Value> = tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                },
            })
        })
        .collect();
    json!(tools)
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

fn parse_usage(v: &Value) -> Usage {
    Usage {
        input_tokens: v["prompt_tokens"].as_u64().unwrap_or(0),
        output_tokens: v["completion_tokens"].as_u64().unwrap_or(0),
        cache_creation_input_tokens: None,
        cache_read_input_tokens: v["prompt_tokens_details"]["cached_tokens"].as_u64(),
    }
}

fn parse_tool_call(tc: &Value) -> Result<ToolUseContent> {
    let func = &tc["function"];
    let name = func["name"].as_str().unwrap_or_default().to_owned();
    let args = func["arguments"].as_str().unwrap_or("{}");
    let input: Value = if args.is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str(args).map_err(|e| AgentError::ParseFailed {
            reason: format!("invalid JSON in tool call `{name}` arguments: {e}"),
        })?
    };
    Ok(ToolUseContent {
        id: tc["id"].as_str().unwrap_or_default().to_owned(),
        name,
        input,
        metadata: None,
    })
}

fn parse_response(v: &Value) -> Result<MessageResponse> {
    let message = &v["choices"][0]["message"];
    if message.is_null() {
        return Err(AgentError::ParseFailed {
            reason: "missing `choices[0].message` in response".into(),
        });
    }

    let mut content: Vec<ContentBlock> = Vec::new();
    if let Some(text) = message["content"].as_str() {
        if !text.is_empty() {
            content.push(ContentBlock::Text(TextContent::new(text)));
        }
    }
    if let Some(tool_calls) = message["tool_calls"].as_array() {
        for tc in tool_calls {
            content.push(ContentBlock::ToolUse(parse_tool_call(tc)?));
        }
    }

    Ok(MessageResponse {
        message: Message {
            role: Role::Assistant,
            content,
        },
        usage: parse_usage(&v["usage"]),
    })
}

// ---------------------------------------------------------------------------
// Stream accumulation
// ---------------------------------------------------------------------------

/// Accumulates `choices[].delta` fragments.  The id and function name arrive
/// in the first chunk for each tool call, with argument fragments following;
/// chunks are correlated by `index`.
#[derive(Debug, Default)]
struct Accumulator {
    text: String,
    tool_calls: Vec<ToolCallBuilder>,
    usage: Usage,
    done: bool,
}

#[derive(Debug, Default)]
struct ToolCallBuilder {
    id: String,
    name: String,
    arguments: String,
}

impl Accumulator {
    fn feed_data(&mut self, data: &str) -> Result<Vec<Delta>> {
        let data = data.trim();

        if data == "[DONE]" {
            self.done = true;
            return Ok(Vec::new());
        }

        let v: Value = serde_json::from_str(data).map_err(|e| AgentError::ParseFailed {
            reason: format!("invalid JSON in SSE data: {e}"),
        })?;

        if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
            self.usage = parse_usage(usage);
        }

        let delta = &v["choices"][0]["delta"];
        let mut deltas = Vec::new();

        if delta["role"].as_str() == Some("assistant") {
            deltas.push(Delta::MessageStart {
                role: Role::Assistant,
            });
        }

        if let Some(text) = delta["content"].as_str() {
            if !text.is_empty() {
                self.text.push_str(text);
                deltas.push(Delta::TextUpdate {
                    text: text.to_owned(),
                });
            }
        }

        if let Some(tool_calls) = delta["tool_calls"].as_array() {
            for tc in tool_calls {
                let index = tc["index"].as_u64().unwrap_or(0) as usize;
                while self.tool_calls.len() <= index {
                    self.tool_calls.push(ToolCallBuilder::default());
                }
                let builder = &mut self.tool_calls[index];
                if let Some(id) = tc["id"].as_str() {
                    builder.id = id.to_owned();
                }
                let func = &tc["function"];
                if let Some(name) = func["name"].as_str() {
                    builder.name.push_str(name);
                }
                if let Some(args) = func["arguments"].as_str() {
                    builder.arguments.push_str(args);
                }
            }
        }

        if deltas.is_empty() {
            deltas.push(Delta::Ignored);
        }
        Ok(deltas)
    }

    fn into_response(self) -> Result<MessageResponse> {
        let mut content: Vec<ContentBlock> = Vec::new();
        if !self.text.is_empty() {
            content.push(ContentBlock::Text(TextContent::new(self.text)));
        }
        for builder in self.tool_calls {
            let input: Value = if builder.arguments.is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&builder.arguments).map_err(|e| AgentError::ParseFailed {
                    reason: format!(
                        "invalid JSON in tool call `{}` arguments: {e}",
                        builder.name
                    ),
                })?
            };
            content.push(ContentBlock::ToolUse(ToolUseContent {
                id: builder.id,
                name: builder.name,
                input,
                metadata: None,
            }));
        }

        Ok(MessageResponse {
            message: Message {
                role: Role::Assistant,
                content,
            },
            usage: self.usage,
        })
    }
}
