//! Context compaction.
//!
//! When the tracked input-token count crosses the threshold, everything but a
//! protected recent window is rendered as a transcript, summarized by the
//! provider's small model, and spliced back in as a single synthetic user
//! turn.  Either the whole replacement happens or none of it: a failed
//! summarization call propagates and the context is left untouched.

use crate::error::{AgentError, Result};
use crate::hooks::{EmitEvent, SessionHooks};
use crate::llm::gateway::{ChatRequest, Provider, ProviderGateway};
use crate::llm::types::{MessageContent, MessageParam, Role};

const SUMMARIZE_PROMPT: &str = include_str!("prompts/summarize.md");

/// Character cap for tool inputs in the transcript.
const TOOL_INPUT_CAP: usize = 200;
/// Character cap for tool results in the transcript.
const TOOL_RESULT_CAP: usize = 500;

/// Compaction thresholds.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Input-token count at which compaction triggers.
    pub token_threshold: u64,
    /// Number of recent turns (user + assistant pairs) never summarized.
    pub recent_turns: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            token_threshold: 80_000,
            recent_turns: 10,
        }
    }
}

impl CompactionConfig {
    /// The protected message window: two messages per turn.
    fn recent_messages(&self) -> usize {
        self.recent_turns * 2
    }
}

/// A replacement context produced by compaction.
#[derive(Debug, Clone)]
pub struct SummarizeResult {
    pub context: Vec<MessageParam>,
    /// Always zero: the next model call re-establishes the real count.
    pub context_tokens: u64,
}

/// Compact the context if the token threshold has been crossed.
///
/// Returns `None` when below the threshold or when the context does not
/// extend past the protected recent window.
pub async fn maybe_summarize(
    context: &[MessageParam],
    context_tokens: u64,
    provider: Provider,
    gateway: &dyn ProviderGateway,
    config: &CompactionConfig,
    hooks: &dyn SessionHooks,
) -> Result<Option<SummarizeResult>> {
    if context_tokens < config.token_threshold {
        return Ok(None);
    }

    let recent = config.recent_messages();
    if context.len() <= recent {
        return Ok(None);
    }

    let split = context.len() - recent;
    let (to_summarize, to_keep) = context.split_at(split);

    tracing::info!(
        context_tokens,
        summarized = to_summarize.len(),
        kept = to_keep.len(),
        "compacting conversation context"
    );
    hooks.emit_message(EmitEvent::agent_update("Summarizing conversation context..."));

    let summary = generate_summary(to_summarize, provider, gateway).await?;

    let mut new_context = Vec::with_capacity(1 + to_keep.len());
    new_context.push(MessageParam::user_text(format!(
        "<context-summary>\nThe following is a summary of our earlier conversation:\n\n{summary}\n</context-summary>"
    )));
    new_context.extend_from_slice(to_keep);

    hooks.emit_message(EmitEvent::agent_update("Context summarized."));

    Ok(Some(SummarizeResult {
        context: new_context,
        context_tokens: 0,
    }))
}

/// Ask the provider's small model for a summary of `messages`.
async fn generate_summary(
    messages: &[MessageParam],
    provider: Provider,
    gateway: &dyn ProviderGateway,
) -> Result<String> {
    let transcript = format_messages_as_text(messages);
    let prompt = SUMMARIZE_PROMPT.replace("$conversation", &transcript);

    let request = ChatRequest::new(
        provider,
        provider.small_model(),
        vec![MessageParam::user_text(prompt)],
    );

    tracing::debug!(model = provider.small_model(), "requesting context summary");
    let response = gateway.prompt(request).await?;

    response
        .message
        .text()
        .map(str::to_owned)
        .ok_or_else(|| AgentError::Summarization {
            reason: "summary response contained no text".into(),
        })
}

/// Render messages as a role-labeled transcript.  Tool calls appear as
/// bracketed descriptors and tool results are truncated so a pathological
/// tool output cannot blow the summarization budget.
pub fn format_messages_as_text(messages: &[MessageParam]) -> String {
    let mut sections: Vec<String> = Vec::with_capacity(messages.len());

    for message in messages {
        let role = match message.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
        };

        let mut parts: Vec<String> = Vec::with_capacity(message.content.len());
        for block in &message.content {
            match block {
                MessageContent::Text(t) => parts.push(t.text.clone()),
                MessageContent::ToolUse(t) => {
                    let input = truncate_chars(&t.input.to_string(), TOOL_INPUT_CAP);
                    parts.push(format!("[Tool: {}] Input: {input}...", t.name));
                }
                MessageContent::ToolResult(r) => {
                    let text: String = r
                        .content
                        .iter()
                        .map(|t| t.text.as_str())
                        .collect::<Vec<_>>()
                        .join("\n");
                    let truncated = truncate_chars(&text, TOOL_RESULT_CAP);
                    let ellipsis = if truncated.chars().count() >= TOOL_RESULT_CAP {
                        "..."
                    } else {
                        ""
                    };
                    parts.push(format!("[Tool Result: {}] {truncated}{ellipsis}", r.name));
                }
            }
        }

        sections.push(format!("{role}:\n{}", parts.join("\n")));
    }

    sections.join("\n\n---\n\n")
}

fn truncate_chars(text: &str, cap: usize) -> String {
    text.chars().take(cap).collect()
}
