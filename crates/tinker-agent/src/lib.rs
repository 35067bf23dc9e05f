//! Agent core for Tinker, a terminal-based conversational coding agent.
//!
//! This crate is the orchestration engine: the turn-loop state machine, the
//! provider-agnostic streaming gateway, the tool-call execution engine with
//! permission/interruption semantics, and token-budget-driven context
//! compaction.  Terminal rendering, the individual tools, and CLI
//! bootstrapping live in the host crates; this one only defines the
//! contracts it consumes ([`tools::Tool`], [`hooks::SessionHooks`]).
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐   deltas    ┌─────────────┐    SSE     ┌───────────┐
//! │  host  │<────────────│    Agent    │───────────>│  Gateway  │
//! │ (UI)   │   hooks     │ (turn loop) │   retry    │ (3 backends)
//! └────────┘────────────>└──┬───────┬──┘            └───────────┘
//!                           │       │
//!                    ┌──────┴──┐ ┌──┴────────┐
//!                    │ Runner  │ │ Compactor │
//!                    │ (tools) │ │ (summary) │
//!                    └─────────┘ └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`llm`] -- normalized message model, per-backend wire translation, and
//!   the two-phase streaming surface.
//! - [`retry`] -- bounded exponential backoff over classified transient
//!   failures.
//! - [`runner`] -- tool execution for one assistant turn.
//! - [`compaction`] -- context summarization past a token threshold.
//! - [`agent`] -- the turn loop composing all of the above.
//! - [`tools`] / [`hooks`] -- the contracts hosts implement.
//! - [`config`] -- settings and credential lookup.

pub mod agent;
pub mod compaction;
pub mod config;
pub mod error;
pub mod hooks;
pub mod llm;
pub mod retry;
pub mod runner;
pub mod tools;

pub use agent::{Agent, PromptOutcome, TurnHandle, TurnOptions};
pub use compaction::{CompactionConfig, SummarizeResult, format_messages_as_text, maybe_summarize};
pub use config::Settings;
pub use config::auth::CredentialStore;
pub use error::{AgentError, Result};
pub use hooks::{EmitEvent, EmitKind, NoHooks, SessionHooks};
pub use llm::{
    ChatRequest, ContentBlock, Delta, HttpGateway, Message, MessageContent, MessageParam,
    MessageResponse, Provider, ProviderGateway, Role, StreamHandle, StreamProducer, TextContent,
    ToolDefinition, ToolResultContent, ToolUseContent, Usage,
};
pub use retry::{Retry, RetryPolicy, with_retry};
pub use runner::{ToolRunOutcome, format_question_answers, run_tool_calls};
pub use tools::{
    ASK_USER_QUESTION_TOOL, AskUserQuestionInput, OptionInput, QuestionAnswer, QuestionInput,
    READ_TOOL, Tool, ToolContext, ToolError, ToolRegistry,
};
