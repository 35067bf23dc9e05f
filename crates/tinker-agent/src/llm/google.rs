//! Google Gemini API backend.
//!
//! Translates the normalized model to and from the `generateContent` wire
//! format.  Gemini addresses function responses by *name* (ids are optional
//! on its side), assigns no id to some function calls (we mint a UUID so the
//! tool runner can correlate results), and threads opaque `thoughtSignature`
//! continuation tokens through content parts -- those round-trip untouched via
//! block metadata.

use futures::StreamExt;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::llm::gateway::{ChatRequest, StreamProducer, error_for_status};
use crate::llm::sse::{LineBuffer, SseLineParser};
use crate::llm::types::{
    ContentBlock, Delta, Message, MessageContent, MessageParam, MessageResponse, Role, TextContent,
    ToolDefinition, ToolUseContent, Usage,
};

const GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const THOUGHT_SIGNATURE: &str = "thoughtSignature";

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
    let url = endpoint(base_url, &request.model, "generateContent");
    let response = send(http, api_key, &url, &body).await?;
    let v: Value = response.json().await.map_err(|e| AgentError::ParseFailed {
        reason: format!("invalid JSON response: {e}"),
    })?;

    let parts = candidate_parts(&v);
    parts_to_response(&parts, &v["usageMetadata"])
}

pub(crate) async fn open_stream(
    http: &reqwest::Client,
    api_key: &str,
    base_url: Option<&str>,
    request: &ChatRequest,
) -> Result<reqwest::Response> {
    let body = build_request_body(request, true);
    let url = format!(
        "{}?alt=sse",
        endpoint(base_url, &request.model, "streamGenerateContent")
    );
    send(http, api_key, &url, &body).await
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
                tracing::debug!("google stream cancelled");
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
                    let chunk: Value = match serde_json::from_str(&event.data) {
                        Ok(v) => v,
                        Err(e) => {
                            producer.finish(Err(AgentError::ParseFailed {
                                reason: format!("invalid JSON in SSE data: {e}"),
                            }));
                            return;
                        }
                    };
                    for delta in acc.apply_chunk(&chunk) {
                        if relaying && !producer.send(delta).await {
                            relaying = false;
                        }
                    }
                }
            }
        }
    }

    producer.finish(acc.into_response());
}

fn endpoint(base_url: Option<&str>, model: &str, method: &str) -> String {
    format!(
        "{}/models/{model}:{method}",
        base_url.unwrap_or(GOOGLE_BASE_URL)
    )
}

async fn send(
    http: &reqwest::Client,
    api_key: &str,
    url: &str,
    body: &Value,
) -> Result<reqwest::Response> {
    let response = http
        .post(url)
        .header("x-goog-api-key", api_key)
        .json(body)
        .send()
        .await?;

    error_for_status(response).await
}

// ---------------------------------------------------------------------------
// Request building
// ---------------------------------------------------------------------------

fn build_request_body(request: &ChatRequest, stream: bool) -> Value {
    let contents: Vec<Value> = request.messages.iter().map(message_param_to_content).collect();

    let mut body = json!({ "contents": contents });

    if !request.tools.is_empty() {
        body["tools"] = json!([{
            "functionDeclarations": request
                .tools
                .iter()
                .map(tool_to_declaration)
                .collect::<Vec<Value>>(),
        }]);
    }

    if stream {
        if let Some(system) = &request.system_prompt {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
    }

    body
}

fn tool_to_declaration(tool: &ToolDefinition) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "parametersJsonSchema": tool.input_schema,
    })
}

fn signature_of(metadata: &Option<Map<String, Value>>) -> Option<&str> {
    metadata
        .as_ref()
        .and_then(|m| m.get(THOUGHT_SIGNATURE))
        .and_then(Value::as_str)
}

fn message_param_to_content(message: &MessageParam) -> Value {
    let mut parts: Vec<Value> = Vec::with_capacity(message.content.len());

    for block in &message.content {
        match block {
            MessageContent::Text(t) => {
                let mut part = json!({"text": t.text});
                if let Some(sig) = signature_of(&t.metadata) {
                    part[THOUGHT_SIGNATURE] = json!(sig);
                }
                parts.push(part);
            }
            MessageContent::ToolUse(t) => {
                let mut part = json!({
                    "functionCall": {
                        "name": t.name,
                        "id": t.id,
                        "args": t.input,
                    }
                });
                if let Some(sig) = signature_of(&t.metadata) {
                    part[THOUGHT_SIGNATURE] = json!(sig);
                }
                parts.push(part);
            }
            MessageContent::ToolResult(r) => {
                let text: String = r
                    .content
                    .iter()
                    .map(|t| t.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                parts.push(json!({
                    "functionResponse": {
                        "name": r.name,
                        "id": r.tool_use_id,
                        "response": {"result": text},
                    }
                }));
            }
        }
    }

    json!({
        "role": match message.role {
            Role::Assistant => "model",
            Role::User => "user",
        },
        "parts": parts,
    })
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

fn candidate_parts(v: &Value) -> Vec<Value> {
    v["candidates"][0]["content"]["parts"]
        .as_array()
        .cloned()
        .unwrap_or_default()
}

fn metadata_with_signature(part: &Value) -> Option<Map<String, Value>> {
    part[THOUGHT_SIGNATURE].as_str().map(|sig| {
        let mut metadata = Map::new();
        metadata.insert(THOUGHT_SIGNATURE.to_owned(), Value::String(sig.to_owned()));
        metadata
    })
}

fn parts_to_response(parts: &[Value], usage: &Value) -> Result<MessageResponse> {
    let mut content: Vec<ContentBlock> = Vec::new();

    for part in parts {
        if let Some(text) = part["text"].as_str() {
            content.push(ContentBlock::Text(TextContent {
                text: text.to_owned(),
                metadata: metadata_with_signature(part),
            }));
        }

        let call = &part["functionCall"];
        if !call.is_null() {
            let Some(name) = call["name"].as_str() else {
                continue;
            };
            if call["args"].is_null() {
                continue;
            }
            let id = match call["id"].as_str() {
                Some(id) if !id.is_empty() => id.to_owned(),
                // Gemini omits ids; mint one so results can be correlated.
                _ => Uuid::new_v4().to_string(),
            };
            content.push(ContentBlock::ToolUse(ToolUseContent {
                id,
                name: name.to_owned(),
                input: call["args"].clone(),
                metadata: metadata_with_signature(part),
            }));
        }
    }

    Ok(MessageResponse {
        message: Message {
            role: Role::Assistant,
            content,
        },
        usage: Usage {
            input_tokens: usage["promptTokenCount"].as_u64().unwrap_or(0),
            output_tokens: usage["candidatesTokenCount"].as_u64().unwrap_or(0),
            cache_creation_input_tokens: None,
            cache_read_input_tokens: usage["cachedContentTokenCount"].as_u64(),
        },
    })
}

// ---------------------------------------------------------------------------
// Stream accumulation
// ---------------------------------------------------------------------------

/// Accumulates streamed chunks into the final part list while producing the
/// relayed deltas: the first chunk carrying text additionally produces
/// `message_start`, and chunks without text produce nothing.
#[derive(Debug, Default)]
struct Accumulator {
    parts: Vec<Value>,
    usage: Value,
    started: bool,
}

impl Accumulator {
    fn apply_chunk(&mut self, chunk: &Value) -> Vec<Delta> {
        let chunk_parts = candidate_parts(chunk);

        let text: String = chunk_parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect();

        self.parts.extend(chunk_parts);
        if !chunk["usageMetadata"].is_null() {
            self.usage = chunk["usageMetadata"].clone();
        }

        let mut deltas = Vec::new();
        if !text.is_empty() {
            if !self.started {
                self.started = true;
                deltas.push(Delta::MessageStart {
                    role: Role::Assistant,
                });
            }
            deltas.push(Delta::TextUpdate { text });
        }
        deltas
    }

    fn into_response(self) -> Result<MessageResponse> {
        parts_to_response(&self.parts, &self.usage)
    }
}
