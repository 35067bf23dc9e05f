//! Provider-agnostic message model.
//!
//! These types are the normalized currency between the agent loop, the tool
//! runner, the compactor, and the per-backend wire translation in
//! [`super::anthropic`], [`super::google`], and [`super::openai`].  Backends
//! translate to and from their native formats; nothing outside the `llm`
//! module ever sees a provider-specific shape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Roles and content blocks
// ---------------------------------------------------------------------------

/// The author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Input from the human (or synthetic turns the agent injects on the
    /// human's behalf: reminders, tool results, context summaries).
    User,
    /// Output from the model.
    Assistant,
}

/// A block of plain text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    pub text: String,
    /// Provider-specific opaque metadata (e.g. Google thinking signatures).
    /// Round-trips through the gateway untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl TextContent {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: None,
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseContent {
    /// Unique identifier correlating this invocation with its result.
    pub id: String,
    /// Name of the tool to invoke (must match a registered tool).
    pub name: String,
    /// Arguments as a JSON value shaped by the tool's input schema.
    pub input: Value,
    /// Provider-specific opaque metadata.  Round-trips untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// The result of executing one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultContent {
    /// The [`ToolUseContent::id`] this result corresponds to.
    pub tool_use_id: String,
    /// The tool name.  Carried because the Google backend addresses function
    /// responses by name rather than id.
    pub name: String,
    /// Result content.
    pub content: Vec<TextContent>,
    /// Whether the invocation was denied or interrupted.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

/// Content a model may produce: text or a tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text(TextContent),
    ToolUse(ToolUseContent),
}

/// Content a context entry may hold: model content plus tool results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text(TextContent),
    ToolUse(ToolUseContent),
    ToolResult(ToolResultContent),
}

impl From<ContentBlock> for MessageContent {
    fn from(block: ContentBlock) -> Self {
        match block {
            ContentBlock::Text(t) => Self::Text(t),
            ContentBlock::ToolUse(t) => Self::ToolUse(t),
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A completed message as produced by the gateway.  Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    /// The text of the first text block, if any.
    pub fn text(&self) -> Option<&str> {
        self.content.iter().find_map(|block| match block {
            ContentBlock::Text(t) => Some(t.text.as_str()),
            ContentBlock::ToolUse(_) => None,
        })
    }

    /// Whether any content block is a tool invocation.
    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|block| matches!(block, ContentBlock::ToolUse(_)))
    }
}

/// A conversation context entry.
///
/// Invariant: every tool_result block references a tool_use block in the
/// immediately preceding assistant turn.  Entries are appended once and never
/// mutated; the compactor may replace the whole list, never edit entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageParam {
    pub role: Role,
    pub content: Vec<MessageContent>,
}

impl MessageParam {
    /// A user turn holding a single text block.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![MessageContent::Text(TextContent::new(text))],
        }
    }
}

impl From<Message> for MessageParam {
    fn from(message: Message) -> Self {
        Self {
            role: message.role,
            content: message.content.into_iter().map(Into::into).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Usage and responses
// ---------------------------------------------------------------------------

/// Token usage for a single model call (not cumulative).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
}

/// A completed model call: the message plus its usage.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageResponse {
    pub message: Message,
    pub usage: Usage,
}

// ---------------------------------------------------------------------------
// Streaming deltas
// ---------------------------------------------------------------------------

/// One incremental unit of a streamed response.
///
/// Deltas are strictly ordered, never duplicated, consumed synchronously,
/// and not persisted.  Backend events the normalizer does not recognize
/// become [`Delta::Ignored`] rather than failing the stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    MessageStart { role: Role },
    TextUpdate { text: String },
    Ignored,
}

// ---------------------------------------------------------------------------
// Tool definitions
// ---------------------------------------------------------------------------

/// A tool definition exposed to the model.
///
/// Registered once at startup and immutable thereafter.  Translation into
/// each backend's native declaration format is purely structural.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description of what the tool does.
    pub description: String,
    /// JSON Schema describing the tool's input.
    pub input_schema: Value,
}
