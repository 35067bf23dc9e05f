//! Tool execution for one assistant turn.
//!
//! Processes the tool invocations of a single assistant message strictly in
//! array order, enforcing the permission gate and interruption semantics.
//! Whatever happens -- unknown tool, denial, tool panic-by-error -- the output
//! mirrors the input 1:1: one tool_result block per tool_use block, same ids,
//! same order.

use serde_json::Value;

use crate::hooks::{EmitEvent, SessionHooks};
use crate::llm::types::{
    ContentBlock, Message, MessageContent, MessageParam, Role, TextContent, ToolResultContent,
};
use crate::tools::{
    ASK_USER_QUESTION_TOOL, AskUserQuestionInput, QuestionAnswer, READ_TOOL, ToolContext,
    ToolRegistry,
};

const TOOL_NOT_FOUND: &str = "Tool not found.";
const TOOL_INTERRUPTED: &str = "Tool use was interrupted.";
const TOOL_NOT_PERMITTED: &str = "Tool use is not permitted.";

/// The outcome of running one assistant message's tool invocations.
#[derive(Debug, Clone)]
pub struct ToolRunOutcome {
    /// A synthetic user turn whose tool_result blocks mirror the input's
    /// tool_use blocks 1:1 in id and order.
    pub result_message: MessageParam,
    /// Whether a permission denial interrupted the run.
    pub interrupted: bool,
}

/// Execute the tool invocations of `message` and collect their results.
///
/// A denied invocation marks the run interrupted: it is the last invocation
/// attempted, and every later one is answered with an interruption notice
/// without executing.  Unknown tool names never interrupt.  Tool failures are
/// rendered as `Error: ...` content for the model to react to.
pub async fn run_tool_calls(
    message: &Message,
    ctx: &ToolContext,
    registry: &ToolRegistry,
    hooks: &dyn SessionHooks,
) -> ToolRunOutcome {
    let mut results: Vec<ToolResultContent> = Vec::new();
    let mut interrupted = false;

    for block in &message.content {
        let ContentBlock::ToolUse(invocation) = block else {
            continue;
        };
        let (id, name, input) = (&invocation.id, &invocation.name, &invocation.input);

        if !registry.is_known(name) {
            results.push(result(id, name, TOOL_NOT_FOUND, false));
            continue;
        }

        if interrupted {
            results.push(result(id, name, TOOL_INTERRUPTED, true));
            continue;
        }

        if registry.requires_permission(name) && !hooks.can_use_tool(name, input).await {
            hooks.emit_message(EmitEvent::agent_update(format!(
                "Interrupted: {name} {}",
                registry.describe_use(name, input)
            )));
            results.push(result(id, name, TOOL_NOT_PERMITTED, true));
            interrupted = true;
            continue;
        }

        hooks.emit_message(EmitEvent::tool_use(format!(
            "{name} {}",
            registry.describe_use(name, input)
        )));
        tracing::debug!(tool = %name, id = %id, "executing tool");

        if name == ASK_USER_QUESTION_TOOL {
            let text = match serde_json::from_value::<AskUserQuestionInput>(input.clone()) {
                Ok(questions) => {
                    let answers = hooks.ask_user_question(questions).await;
                    format_question_answers(&answers)
                }
                Err(e) => format!("Error: {e}"),
            };
            results.push(result(id, name, &text, false));
            continue;
        }

        let tool = registry
            .get(name)
            .expect("known tool is registered")
            .clone();
        let text = match tool.execute(input.clone(), ctx).await {
            Ok(output) => {
                if name == READ_TOOL {
                    if let Some(path) = input.get("path").and_then(Value::as_str) {
                        hooks.save_to_session_memory(path, &output);
                    }
                }
                output
            }
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, "tool execution failed");
                format!("Error: {e}")
            }
        };
        results.push(result(id, name, &text, false));
    }

    ToolRunOutcome {
        result_message: MessageParam {
            role: Role::User,
            content: results.into_iter().map(MessageContent::ToolResult).collect(),
        },
        interrupted,
    }
}

fn result(id: &str, name: &str, text: &str, is_error: bool) -> ToolResultContent {
    ToolResultContent {
        tool_use_id: id.to_owned(),
        name: name.to_owned(),
        content: vec![TextContent::new(text)],
        is_error,
    }
}

/// Render structured question answers as one text result.
///
/// Per answer: `Question {n}: {question}`, then `Selected: ...` and
/// `Custom response: ...` when present, or `No selection made.` when neither
/// is; paragraphs are separated by a blank line.  An empty answer list means
/// the user cancelled the dialog.
pub fn format_question_answers(answers: &[QuestionAnswer]) -> String {
    if answers.is_empty() {
        return "User cancelled the question dialog.".to_owned();
    }

    answers
        .iter()
        .enumerate()
        .map(|(idx, answer)| {
            let mut lines = vec![format!("Question {}: {}", idx + 1, answer.question)];

            if !answer.selected_labels.is_empty() {
                lines.push(format!("Selected: {}", answer.selected_labels.join(", ")));
            }

            if let Some(custom) = answer
                .custom_text
                .as_ref()
                .filter(|text| !text.is_empty())
            {
                lines.push(format!("Custom response: {custom}"));
            }

            if lines.len() == 1 {
                lines.push("No selection made.".to_owned());
            }

            lines.join("\n")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
