//! The tool contract and registry.
//!
//! Tool implementations live outside this crate (shell, file edit, search,
//! web fetch, extensions...).  The core consumes them through the [`Tool`]
//! trait and a [`ToolRegistry`] built once at startup and passed by
//! reference -- there is no process-wide registry.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::llm::gateway::Provider;
use crate::llm::types::ToolDefinition;

/// Name of the interactive question tool the runner special-cases: it
/// delegates to the session's question hook instead of executing.
pub const ASK_USER_QUESTION_TOOL: &str = "askUserQuestion";

/// Name of the file-read tool whose successful results are persisted to
/// session memory, keyed by path.
pub const READ_TOOL: &str = "read";

/// Execution context handed to tools.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub provider: Provider,
    pub model: String,
}

/// A tool failure.  Caught at the runner boundary and rendered as
/// conversation content (`Error: ...`); never propagates further.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ToolError(pub String);

impl From<String> for ToolError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for ToolError {
    fn from(message: &str) -> Self {
        Self(message.to_owned())
    }
}

/// A named capability the model may invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The definition advertised to the model.
    fn definition(&self) -> &ToolDefinition;

    /// Whether invocations must pass the permission gate.
    fn requires_permission(&self) -> bool {
        false
    }

    /// A short human-readable description of one invocation, shown in
    /// progress notifications (e.g. the file being read).
    fn describe_use(&self, input: &Value) -> String;

    /// Execute the tool.
    async fn execute(&self, input: Value, ctx: &ToolContext)
    -> std::result::Result<String, ToolError>;
}

/// The set of tools available to a session.
///
/// Constructed once at startup (builtins plus extension tools) and read-only
/// thereafter; insertion order is the order definitions are advertised in.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool.  Names must be unique.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.definition().name.clone();
        if self.get(&name).is_some() {
            return Err(AgentError::Config {
                reason: format!("duplicate tool name: {name}"),
            });
        }
        self.tools.push(tool);
        Ok(())
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.definition().name == name)
    }

    /// All definitions, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition().clone()).collect()
    }

    pub fn requires_permission(&self, name: &str) -> bool {
        self.get(name).is_some_and(|t| t.requires_permission())
    }

    /// Describe one invocation, falling back to the bare name for unknown
    /// tools.
    pub fn describe_use(&self, name: &str, input: &Value) -> String {
        self.get(name)
            .map(|t| t.describe_use(input))
            .unwrap_or_else(|| name.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Interactive question types
// ---------------------------------------------------------------------------

/// Input schema of the interactive question tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskUserQuestionInput {
    pub questions: Vec<QuestionInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionInput {
    pub question: String,
    pub header: String,
    pub options: Vec<OptionInput>,
    #[serde(default)]
    pub multi_select: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionInput {
    pub label: String,
    pub description: String,
}

/// One answered question, as returned by the session's question hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionAnswer {
    pub question: String,
    pub selected_labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_text: Option<String>,
}
