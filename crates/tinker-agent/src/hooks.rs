//! Session callbacks.
//!
//! The host (terminal UI, test harness, headless runner) observes and steers
//! a session through [`SessionHooks`].  Every method has a no-op default so
//! hosts implement only what they need.  The permission and question hooks
//! may suspend for as long as a human takes to answer; the core does not
//! time-box them.

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::types::Usage;
use crate::tools::{AskUserQuestionInput, QuestionAnswer};

/// Kind of a progress notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitKind {
    /// Agent lifecycle updates (compaction, interruptions).
    AgentUpdate,
    /// A tool is about to run.
    ToolUse,
}

/// A fire-and-forget progress notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitEvent {
    pub kind: EmitKind,
    pub message: String,
}

impl EmitEvent {
    pub fn agent_update(message: impl Into<String>) -> Self {
        Self {
            kind: EmitKind::AgentUpdate,
            message: message.into(),
        }
    }

    pub fn tool_use(message: impl Into<String>) -> Self {
        Self {
            kind: EmitKind::ToolUse,
            message: message.into(),
        }
    }
}

/// Callbacks a host wires into the agent.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// The permission gate.  Returning `false` denies the invocation and
    /// interrupts the rest of the assistant turn.
    async fn can_use_tool(&self, _name: &str, _input: &Value) -> bool {
        true
    }

    /// Present questions to the user.  An empty answer list means the user
    /// cancelled the dialog.
    async fn ask_user_question(&self, _input: AskUserQuestionInput) -> Vec<QuestionAnswer> {
        Vec::new()
    }

    /// Progress notification.  Fire-and-forget.
    fn emit_message(&self, _event: EmitEvent) {}

    /// Persist a value to session memory.
    fn save_to_session_memory(&self, _key: &str, _value: &str) {}

    /// Token usage for one completed model call.  Called exactly once per
    /// completed (non-cancelled) call.
    fn update_token_usage(&self, _usage: &Usage) {}
}

/// Hooks that do nothing.  Permission checks pass.
pub struct NoHooks;

#[async_trait]
impl SessionHooks for NoHooks {}
