//! The turn-loop agent.
//!
//! An [`Agent`] owns one conversation: the ordered context, the current
//! provider/model selection, the last-seen input-token count, and a
//! cancellation handle.  [`Agent::stream`] is the canonical entry point -- it
//! relays every delta to the consumer in order, then runs tools and loops
//! until an assistant turn carries no tool invocations or a denial
//! interrupts the run.  [`Agent::prompt`] is the one-shot surface for
//! short-lived sub-agent calls.
//!
//! Cancellation is cooperative and never an error: a fired handle stops the
//! turn at the next relay point, aborts the in-flight request, and returns
//! normally without appending a partial assistant turn, reporting usage, or
//! running tools.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::compaction::{CompactionConfig, maybe_summarize};
use crate::error::{AgentError, Result};
use crate::llm::gateway::{ChatRequest, Provider, ProviderGateway};
use crate::llm::types::{Delta, Message, MessageParam, MessageResponse};
use crate::runner::run_tool_calls;
use crate::tools::{ToolContext, ToolRegistry};
use crate::hooks::SessionHooks;

/// Per-turn collaborators supplied by the host.
#[derive(Clone)]
pub struct TurnOptions {
    pub registry: Arc<ToolRegistry>,
    pub hooks: Arc<dyn SessionHooks>,
}

/// The consumer half of a streamed turn: a drainable delta sequence plus a
/// separately awaitable outcome, mirroring the gateway's two-phase shape.
pub struct TurnHandle {
    deltas: mpsc::Receiver<Delta>,
    outcome: oneshot::Receiver<Result<()>>,
}

impl TurnHandle {
    /// Pull the next delta; `None` once the turn stops producing them.
    pub async fn next_delta(&mut self) -> Option<Delta> {
        self.deltas.recv().await
    }

    /// Await the turn outcome.  Provider failures surface here; a cancelled
    /// turn resolves to `Ok(())`.
    pub async fn finish(self) -> Result<()> {
        let TurnHandle { deltas, outcome } = self;
        drop(deltas);
        outcome.await.map_err(|_| AgentError::StreamFailed {
            reason: "agent turn ended without reporting an outcome".into(),
        })?
    }
}

/// The result of a one-shot [`Agent::prompt`] call.
#[derive(Debug, Clone)]
pub struct PromptOutcome {
    /// The final assistant message.
    pub message: Message,
    /// Its first text block, for hosts that only want the answer.
    pub text: Option<String>,
}

#[derive(Clone)]
struct Selection {
    provider: Provider,
    model: String,
}

#[derive(Default)]
struct ConversationState {
    context: Vec<MessageParam>,
    context_tokens: u64,
}

/// Everything a running turn needs, snapshotted at [`Agent::stream`] time so
/// the loop is unaffected by concurrent selection changes.
struct TurnContext {
    gateway: Arc<dyn ProviderGateway>,
    provider: Provider,
    model: String,
    system_prompt: Option<String>,
    start_reminder: Option<String>,
    compaction: CompactionConfig,
    registry: Arc<ToolRegistry>,
    hooks: Arc<dyn SessionHooks>,
    cancel: CancellationToken,
}

/// A single conversational session.
///
/// One logical thread of control: turns run one at a time (the conversation
/// state sits behind an async mutex held for the duration of a turn), while
/// a hosting process may run many independent agents concurrently, sharing
/// only the stateless gateway and the read-only tool registry.
pub struct Agent {
    gateway: Arc<dyn ProviderGateway>,
    selection: StdMutex<Selection>,
    system_prompt: Option<String>,
    start_reminder: Option<String>,
    compaction: CompactionConfig,
    state: Arc<Mutex<ConversationState>>,
    cancel: StdMutex<CancellationToken>,
}

impl Agent {
    pub fn new(
        gateway: Arc<dyn ProviderGateway>,
        provider: Provider,
        model: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            selection: StdMutex::new(Selection {
                provider,
                model: model.into(),
            }),
            system_prompt: None,
            start_reminder: None,
            compaction: CompactionConfig::default(),
            state: Arc::new(Mutex::new(ConversationState::default())),
            cancel: StdMutex::new(CancellationToken::new()),
        }
    }

    /// System prompt sent with every streamed model call.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// A reminder injected once, as a synthetic leading user turn, on the
    /// very first turn of the session.
    pub fn with_start_reminder(mut self, reminder: impl Into<String>) -> Self {
        self.start_reminder = Some(reminder.into());
        self
    }

    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }

    /// Seed the conversation with a previously persisted context.
    pub fn with_context(self, context: Vec<MessageParam>) -> Self {
        self.state
            .try_lock()
            .expect("no turn is running during construction")
            .context = context;
        self
    }

    /// Switch the provider/model used by subsequent turns.
    pub fn set_model(&self, provider: Provider, model: impl Into<String>) {
        let mut selection = self.selection.lock().unwrap();
        selection.provider = provider;
        selection.model = model.into();
    }

    /// The current provider/model selection.
    pub fn selection(&self) -> (Provider, String) {
        let selection = self.selection.lock().unwrap();
        (selection.provider, selection.model.clone())
    }

    /// A snapshot of the conversation context.
    pub async fn context(&self) -> Vec<MessageParam> {
        self.state.lock().await.context.clone()
    }

    /// The input-token count of the most recent completed model call.
    pub async fn context_tokens(&self) -> u64 {
        self.state.lock().await.context_tokens
    }

    /// Signal the current turn to stop.  Idempotent, and safe to call when
    /// no turn is running.
    pub fn cancel(&self) {
        self.cancel.lock().unwrap().cancel();
    }

    /// Run one streamed turn.
    ///
    /// `input` is appended as a user turn when present; continuation turns
    /// (after tool results) pass `None`.  The handle's delta sequence is the
    /// single externally visible suspension point: the loop yields after
    /// each delta and resumes when the consumer pulls the next.
    pub fn stream(&self, input: Option<String>, options: TurnOptions) -> TurnHandle {
        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap() = cancel.clone();

        let (provider, model) = self.selection();
        let ctx = TurnContext {
            gateway: Arc::clone(&self.gateway),
            provider,
            model,
            system_prompt: self.system_prompt.clone(),
            start_reminder: self.start_reminder.clone(),
            compaction: self.compaction.clone(),
            registry: Arc::clone(&options.registry),
            hooks: Arc::clone(&options.hooks),
            cancel,
        };

        let (delta_tx, delta_rx) = mpsc::channel(1);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let result = run_turn_loop(state, input, ctx, delta_tx).await;
            let _ = outcome_tx.send(result);
        });

        TurnHandle {
            deltas: delta_rx,
            outcome: outcome_rx,
        }
    }

    /// Run a one-shot turn loop without incremental relay.
    ///
    /// Works on a snapshot of the context and does not write back -- and,
    /// deliberately, never invokes the compactor: this is the surface for
    /// short-lived sub-agent calls whose histories stay small by
    /// construction.
    pub async fn prompt(
        &self,
        input: impl Into<String>,
        options: TurnOptions,
    ) -> Result<PromptOutcome> {
        let (provider, model) = self.selection();
        let mut messages = self.state.lock().await.context.clone();
        messages.push(MessageParam::user_text(input));

        loop {
            let request = ChatRequest::new(provider, model.clone(), messages.clone())
                .with_tools(options.registry.definitions());

            let MessageResponse { message, usage } = self.gateway.prompt(request).await?;
            options.hooks.update_token_usage(&usage);

            messages.push(message.clone().into());
            if !message.has_tool_use() {
                return Ok(PromptOutcome {
                    text: message.text().map(str::to_owned),
                    message,
                });
            }

            let tool_ctx = ToolContext {
                provider,
                model: model.clone(),
            };
            let outcome =
                run_tool_calls(&message, &tool_ctx, &options.registry, options.hooks.as_ref())
                    .await;
            messages.push(outcome.result_message);

            if outcome.interrupted {
                return Ok(PromptOutcome {
                    text: message.text().map(str::to_owned),
                    message,
                });
            }
        }
    }
}

async fn run_turn_loop(
    state: Arc<Mutex<ConversationState>>,
    input: Option<String>,
    ctx: TurnContext,
    deltas: mpsc::Sender<Delta>,
) -> Result<()> {
    let mut state = state.lock().await;

    if state.context.is_empty() {
        if let Some(reminder) = &ctx.start_reminder {
            state.context.push(MessageParam::user_text(reminder.clone()));
        }
    }

    if let Some(input) = input {
        state.context.push(MessageParam::user_text(input));
    }

    let mut relaying = true;
    loop {
        if ctx.cancel.is_cancelled() {
            return Ok(());
        }

        let mut request = ChatRequest::new(ctx.provider, ctx.model.clone(), state.context.clone())
            .with_tools(ctx.registry.definitions());
        if let Some(system) = &ctx.system_prompt {
            request = request.with_system_prompt(system.clone());
        }

        let mut stream = match ctx.gateway.stream(request, ctx.cancel.clone()).await {
            Err(e) if e.is_cancellation() => return Ok(()),
            other => other?,
        };

        while let Some(delta) = stream.next_delta().await {
            if relaying && deltas.send(delta).await.is_err() {
                relaying = false;
            }
        }

        // Stopped mid-relay: no partial assistant turn, no usage report, no
        // tool execution.
        if ctx.cancel.is_cancelled() {
            tracing::debug!("turn cancelled during stream relay");
            return Ok(());
        }

        let MessageResponse { message, usage } = match stream.full_message().await {
            Err(e) if e.is_cancellation() => return Ok(()),
            other => other?,
        };

        ctx.hooks.update_token_usage(&usage);
        state.context_tokens = usage.input_tokens;

        if let Some(compacted) = maybe_summarize(
            &state.context,
            state.context_tokens,
            ctx.provider,
            ctx.gateway.as_ref(),
            &ctx.compaction,
            ctx.hooks.as_ref(),
        )
        .await?
        {
            state.context = compacted.context;
            state.context_tokens = compacted.context_tokens;
        }

        state.context.push(message.clone().into());

        if !message.has_tool_use() {
            return Ok(());
        }

        let tool_ctx = ToolContext {
            provider: ctx.provider,
            model: ctx.model.clone(),
        };
        let outcome =
            run_tool_calls(&message, &tool_ctx, &ctx.registry, ctx.hooks.as_ref()).await;
        state.context.push(outcome.result_message);

        if outcome.interrupted {
            return Ok(());
        }
    }
}
