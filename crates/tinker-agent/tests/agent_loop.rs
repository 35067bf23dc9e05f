//! End-to-end turn-loop behavior against a scripted gateway.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use tinker_agent::{
    Agent, AgentError, ChatRequest, CompactionConfig, ContentBlock, Delta, EmitEvent, Message,
    MessageContent, MessageParam, MessageResponse, Provider, ProviderGateway, Result, Retry,
    RetryPolicy, Role, SessionHooks, StreamHandle, TextContent, Tool, ToolContext, ToolDefinition,
    ToolError, ToolRegistry, ToolUseContent, TurnOptions, Usage,
};
use tinker_agent::tools::{AskUserQuestionInput, QuestionAnswer};

// ---------------------------------------------------------------------------
// Scripted gateway
// ---------------------------------------------------------------------------

enum ScriptedTurn {
    /// Stream the deltas, then resolve with the response.  `prompt` skips
    /// the deltas.
    Respond {
        deltas: Vec<Delta>,
        response: MessageResponse,
    },
    /// Fail at connection establishment with this status.
    FailStatus(u16),
    /// Send the deltas, then park until cancellation fires.
    HangAfter { deltas: Vec<Delta> },
}

#[derive(Default)]
struct ScriptState {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<ChatRequest>>,
}

#[derive(Clone, Default)]
struct ScriptedGateway {
    state: Arc<ScriptState>,
}

impl ScriptedGateway {
    fn push(&self, turn: ScriptedTurn) {
        self.state.turns.lock().unwrap().push_back(turn);
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    fn remaining(&self) -> usize {
        self.state.turns.lock().unwrap().len()
    }

    fn next_turn(&self, request: &ChatRequest) -> Result<ScriptedTurn> {
        self.state.requests.lock().unwrap().push(request.clone());
        self.state
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(AgentError::Config {
                reason: "scripted gateway exhausted".into(),
            })
    }
}

#[async_trait]
impl ProviderGateway for ScriptedGateway {
    async fn prompt(&self, request: ChatRequest) -> Result<MessageResponse> {
        match self.next_turn(&request)? {
            ScriptedTurn::Respond { response, .. } => Ok(response),
            ScriptedTurn::FailStatus(status) => Err(AgentError::ApiStatus {
                status,
                body: "scripted failure".into(),
            }),
            ScriptedTurn::HangAfter { .. } => Err(AgentError::Config {
                reason: "prompt cannot hang".into(),
            }),
        }
    }

    async fn stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<StreamHandle> {
        match self.next_turn(&request)? {
            ScriptedTurn::Respond { deltas, response } => {
                let (producer, handle) = StreamHandle::new();
                tokio::spawn(async move {
                    for delta in deltas {
                        producer.send(delta).await;
                    }
                    producer.finish(Ok(response));
                });
                Ok(handle)
            }
            ScriptedTurn::FailStatus(status) => Err(AgentError::ApiStatus {
                status,
                body: "scripted failure".into(),
            }),
            ScriptedTurn::HangAfter { deltas } => {
                let (producer, handle) = StreamHandle::new();
                tokio::spawn(async move {
                    for delta in deltas {
                        producer.send(delta).await;
                    }
                    cancel.cancelled().await;
                    producer.finish(Err(AgentError::Cancelled));
                });
                Ok(handle)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn text_response(text: &str, input_tokens: u64) -> MessageResponse {
    MessageResponse {
        message: Message {
            role: Role::Assistant,
            content: vec![ContentBlock::Text(TextContent::new(text))],
        },
        usage: Usage {
            input_tokens,
            output_tokens: 7,
            cache_creation_input_tokens: None,
            cache_read_input_tokens: None,
        },
    }
}

fn tool_response(calls: &[(&str, &str, Value)], input_tokens: u64) -> MessageResponse {
    MessageResponse {
        message: Message {
            role: Role::Assistant,
            content: calls
                .iter()
                .map(|(id, name, input)| {
                    ContentBlock::ToolUse(ToolUseContent {
                        id: (*id).to_owned(),
                        name: (*name).to_owned(),
                        input: input.clone(),
                        metadata: None,
                    })
                })
                .collect(),
        },
        usage: Usage {
            input_tokens,
            output_tokens: 3,
            cache_creation_input_tokens: None,
            cache_read_input_tokens: None,
        },
    }
}

fn text_deltas(parts: &[&str]) -> Vec<Delta> {
    let mut deltas = vec![Delta::MessageStart {
        role: Role::Assistant,
    }];
    deltas.extend(parts.iter().map(|p| Delta::TextUpdate {
        text: (*p).to_owned(),
    }));
    deltas
}

struct EchoTool {
    definition: ToolDefinition,
    gated: bool,
}

impl EchoTool {
    fn named(name: &str) -> Self {
        Self {
            definition: ToolDefinition {
                name: name.to_owned(),
                description: format!("The {name} tool"),
                input_schema: json!({"type": "object"}),
            },
            gated: false,
        }
    }

    fn gated(mut self) -> Self {
        self.gated = true;
        self
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    fn requires_permission(&self) -> bool {
        self.gated
    }

    fn describe_use(&self, input: &Value) -> String {
        input.to_string()
    }

    async fn execute(
        &self,
        input: Value,
        _ctx: &ToolContext,
    ) -> std::result::Result<String, ToolError> {
        Ok(format!("echo: {input}"))
    }
}

#[derive(Default)]
struct TestHooks {
    deny_all: bool,
    usage_reports: Mutex<Vec<Usage>>,
    events: Mutex<Vec<EmitEvent>>,
}

#[async_trait]
impl SessionHooks for TestHooks {
    async fn can_use_tool(&self, _name: &str, _input: &Value) -> bool {
        !self.deny_all
    }

    async fn ask_user_question(&self, _input: AskUserQuestionInput) -> Vec<QuestionAnswer> {
        Vec::new()
    }

    fn emit_message(&self, event: EmitEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn update_token_usage(&self, usage: &Usage) {
        self.usage_reports.lock().unwrap().push(usage.clone());
    }
}

struct Harness {
    gateway: ScriptedGateway,
    agent: Agent,
    hooks: Arc<TestHooks>,
    options: TurnOptions,
}

fn harness_with(hooks: TestHooks, tools: Vec<EchoTool>) -> Harness {
    let gateway = ScriptedGateway::default();
    let agent = Agent::new(
        Arc::new(gateway.clone()),
        Provider::Anthropic,
        "claude-sonnet-4-5-20250929",
    );

    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(Arc::new(tool)).unwrap();
    }

    let hooks = Arc::new(hooks);
    let options = TurnOptions {
        registry: Arc::new(registry),
        hooks: hooks.clone(),
    };

    Harness {
        gateway,
        agent,
        hooks,
        options,
    }
}

fn harness() -> Harness {
    harness_with(TestHooks::default(), vec![EchoTool::named("echo")])
}

async fn drain(handle: &mut tinker_agent::TurnHandle) -> Vec<Delta> {
    let mut deltas = Vec::new();
    while let Some(delta) = handle.next_delta().await {
        deltas.push(delta);
    }
    deltas
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn streamed_turn_relays_deltas_in_order_and_appends_context() {
    let h = harness();
    h.gateway.push(ScriptedTurn::Respond {
        deltas: text_deltas(&["Hel", "lo"]),
        response: text_response("Hello", 42),
    });

    let mut handle = h.agent.stream(Some("hi there".into()), h.options.clone());
    let deltas = drain(&mut handle).await;
    handle.finish().await.unwrap();

    assert_eq!(
        deltas,
        vec![
            Delta::MessageStart {
                role: Role::Assistant
            },
            Delta::TextUpdate { text: "Hel".into() },
            Delta::TextUpdate { text: "lo".into() },
        ]
    );

    // Concatenated text updates equal the final message text.
    let streamed: String = deltas
        .iter()
        .filter_map(|d| match d {
            Delta::TextUpdate { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, "Hello");

    let context = h.agent.context().await;
    assert_eq!(context.len(), 2);
    assert_eq!(context[0], MessageParam::user_text("hi there"));
    assert_eq!(context[1].role, Role::Assistant);

    assert_eq!(h.agent.context_tokens().await, 42);
    let usage = h.hooks.usage_reports.lock().unwrap();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].input_tokens, 42);
}

#[tokio::test]
async fn tool_turns_loop_until_a_text_only_response() {
    let h = harness();
    h.gateway.push(ScriptedTurn::Respond {
        deltas: vec![Delta::MessageStart {
            role: Role::Assistant,
        }],
        response: tool_response(&[("t1", "echo", json!({"value": 1}))], 10),
    });
    h.gateway.push(ScriptedTurn::Respond {
        deltas: text_deltas(&["done"]),
        response: text_response("done", 20),
    });

    let mut handle = h.agent.stream(Some("run the tool".into()), h.options.clone());
    drain(&mut handle).await;
    handle.finish().await.unwrap();

    let context = h.agent.context().await;
    // user, assistant(tool_use), user(tool_result), assistant(text)
    assert_eq!(context.len(), 4);
    match &context[2].content[0] {
        MessageContent::ToolResult(r) => {
            assert_eq!(r.tool_use_id, "t1");
            assert!(r.content[0].text.starts_with("echo:"));
        }
        other => panic!("unexpected content: {other:?}"),
    }

    // One usage report per completed model call.
    assert_eq!(h.hooks.usage_reports.lock().unwrap().len(), 2);

    // The second model call saw the tool results.
    let requests = h.gateway.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].messages.len(), 3);
}

#[tokio::test]
async fn denied_permission_interrupts_the_turn() {
    let h = harness_with(
        TestHooks {
            deny_all: true,
            ..Default::default()
        },
        vec![EchoTool::named("echo").gated()],
    );
    h.gateway.push(ScriptedTurn::Respond {
        deltas: vec![],
        response: tool_response(&[("t1", "echo", json!({}))], 10),
    });

    let mut handle = h.agent.stream(Some("try it".into()), h.options.clone());
    drain(&mut handle).await;
    handle.finish().await.unwrap();

    let context = h.agent.context().await;
    assert_eq!(context.len(), 3);
    match &context[2].content[0] {
        MessageContent::ToolResult(r) => {
            assert_eq!(r.content[0].text, "Tool use is not permitted.");
            assert!(r.is_error);
        }
        other => panic!("unexpected content: {other:?}"),
    }

    // The loop stopped: no second model call was attempted.
    assert_eq!(h.gateway.requests().len(), 1);
}

#[tokio::test]
async fn start_reminder_is_injected_exactly_once() {
    let gateway = ScriptedGateway::default();
    let agent = Agent::new(
        Arc::new(gateway.clone()),
        Provider::Anthropic,
        "claude-sonnet-4-5-20250929",
    )
    .with_start_reminder("Remember the house rules.");

    let hooks = Arc::new(TestHooks::default());
    let options = TurnOptions {
        registry: Arc::new(ToolRegistry::new()),
        hooks,
    };

    for turn in 0..2 {
        gateway.push(ScriptedTurn::Respond {
            deltas: text_deltas(&["ok"]),
            response: text_response("ok", 5),
        });
        let mut handle = agent.stream(Some(format!("message {turn}")), options.clone());
        drain(&mut handle).await;
        handle.finish().await.unwrap();
    }

    let context = agent.context().await;
    assert_eq!(context.len(), 5);
    assert_eq!(
        context[0],
        MessageParam::user_text("Remember the house rules.")
    );
    let reminders = context
        .iter()
        .filter(|m| *m == &MessageParam::user_text("Remember the house rules."))
        .count();
    assert_eq!(reminders, 1);
}

#[tokio::test]
async fn cancellation_discards_the_partial_turn() {
    let h = harness();
    h.gateway.push(ScriptedTurn::HangAfter {
        deltas: text_deltas(&["partial"]),
    });

    let mut handle = h.agent.stream(Some("long task".into()), h.options.clone());

    // Pull the deltas that made it out, then cancel mid-stream.
    assert!(handle.next_delta().await.is_some());
    assert!(handle.next_delta().await.is_some());
    h.agent.cancel();

    let rest = drain(&mut handle).await;
    assert!(rest.is_empty());
    handle.finish().await.unwrap();

    // No partial assistant turn, no usage report, no tool execution.
    let context = h.agent.context().await;
    assert_eq!(context.len(), 1);
    assert_eq!(context[0], MessageParam::user_text("long task"));
    assert!(h.hooks.usage_reports.lock().unwrap().is_empty());
}

#[tokio::test]
async fn provider_failures_bubble_out_of_the_turn() {
    let h = harness();
    h.gateway.push(ScriptedTurn::FailStatus(401));

    let mut handle = h.agent.stream(Some("hi".into()), h.options.clone());
    let deltas = drain(&mut handle).await;
    assert!(deltas.is_empty());

    let err = handle.finish().await.unwrap_err();
    assert!(matches!(err, AgentError::ApiStatus { status: 401, .. }));

    // The user input stays in context for a later retry by the host.
    assert_eq!(h.agent.context().await.len(), 1);
}

#[tokio::test]
async fn transient_failures_are_retried_through_the_wrapper() {
    let gateway = ScriptedGateway::default();
    gateway.push(ScriptedTurn::FailStatus(503));
    gateway.push(ScriptedTurn::Respond {
        deltas: text_deltas(&["ok"]),
        response: text_response("ok", 5),
    });

    let retrying = Retry::new(gateway.clone()).with_policy(RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(1),
    });
    let agent = Agent::new(
        Arc::new(retrying),
        Provider::Anthropic,
        "claude-sonnet-4-5-20250929",
    );

    let options = TurnOptions {
        registry: Arc::new(ToolRegistry::new()),
        hooks: Arc::new(TestHooks::default()),
    };

    let mut handle = agent.stream(Some("hi".into()), options);
    drain(&mut handle).await;
    handle.finish().await.unwrap();

    assert_eq!(gateway.requests().len(), 2);
    assert_eq!(agent.context().await.len(), 2);
}

#[tokio::test]
async fn crossing_the_token_threshold_compacts_older_history() {
    let gateway = ScriptedGateway::default();
    let seeded: Vec<MessageParam> = (0..26)
        .map(|i| {
            if i % 2 == 0 {
                MessageParam::user_text(format!("old user {i}"))
            } else {
                MessageParam {
                    role: Role::Assistant,
                    content: vec![MessageContent::Text(TextContent::new(format!(
                        "old assistant {i}"
                    )))],
                }
            }
        })
        .collect();

    let agent = Agent::new(
        Arc::new(gateway.clone()),
        Provider::Anthropic,
        "claude-sonnet-4-5-20250929",
    )
    .with_compaction(CompactionConfig {
        token_threshold: 1_000,
        recent_turns: 10,
    })
    .with_context(seeded.clone());

    let hooks = Arc::new(TestHooks::default());
    let options = TurnOptions {
        registry: Arc::new(ToolRegistry::new()),
        hooks: hooks.clone(),
    };

    // The streamed turn reports enough input tokens to cross the threshold;
    // the follow-up one-shot answers the summarization request.
    gateway.push(ScriptedTurn::Respond {
        deltas: text_deltas(&["fresh reply"]),
        response: text_response("fresh reply", 5_000),
    });
    gateway.push(ScriptedTurn::Respond {
        deltas: vec![],
        response: text_response("condensed summary", 100),
    });

    let mut handle = agent.stream(Some("latest question".into()), options);
    drain(&mut handle).await;
    handle.finish().await.unwrap();

    let context = agent.context().await;
    // summary + protected window + the new assistant message
    assert_eq!(context.len(), 1 + 20 + 1);
    match &context[0].content[0] {
        MessageContent::Text(t) => {
            assert!(t.text.starts_with("<context-summary>"));
            assert!(t.text.contains("condensed summary"));
        }
        other => panic!("unexpected content: {other:?}"),
    }
    assert_eq!(agent.context_tokens().await, 0);

    // The summarization request targeted the provider's small model.
    let requests = gateway.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].model, Provider::Anthropic.small_model());

    // Compaction progress was announced.
    let events = hooks.events.lock().unwrap();
    assert!(events.iter().any(|e| e.message == "Context summarized."));
}

#[tokio::test]
async fn prompt_runs_the_loop_without_touching_session_state() {
    let h = harness();
    h.gateway.push(ScriptedTurn::Respond {
        deltas: vec![],
        response: tool_response(&[("t1", "echo", json!({"n": 1}))], 10),
    });
    h.gateway.push(ScriptedTurn::Respond {
        deltas: vec![],
        response: text_response("the answer", 20),
    });

    let outcome = h
        .agent
        .prompt("side question", h.options.clone())
        .await
        .unwrap();

    assert_eq!(outcome.text.as_deref(), Some("the answer"));
    // The session context is untouched by one-shot calls.
    assert!(h.agent.context().await.is_empty());
    assert_eq!(h.hooks.usage_reports.lock().unwrap().len(), 2);
    assert_eq!(h.gateway.remaining(), 0);
}

#[tokio::test]
async fn prompt_never_invokes_the_compactor() {
    let gateway = ScriptedGateway::default();
    let agent = Agent::new(
        Arc::new(gateway.clone()),
        Provider::Anthropic,
        "claude-sonnet-4-5-20250929",
    )
    .with_compaction(CompactionConfig {
        token_threshold: 1,
        recent_turns: 1,
    })
    .with_context(
        (0..10)
            .map(|i| MessageParam::user_text(format!("old {i}")))
            .collect(),
    );

    // A single scripted response; a summarization call would exhaust the
    // script and fail the turn.
    gateway.push(ScriptedTurn::Respond {
        deltas: vec![],
        response: text_response("ok", 1_000_000),
    });

    let options = TurnOptions {
        registry: Arc::new(ToolRegistry::new()),
        hooks: Arc::new(TestHooks::default()),
    };
    let outcome = agent.prompt("quick one", options).await.unwrap();
    assert_eq!(outcome.text.as_deref(), Some("ok"));
    assert_eq!(agent.context().await.len(), 10);
}
