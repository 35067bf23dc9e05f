//! The provider gateway: one normalized surface over every LLM backend.
//!
//! [`ProviderGateway`] is the seam the agent loop, the retry wrapper, and the
//! compactor all talk to.  [`HttpGateway`] is the real implementation,
//! dispatching to the per-backend wire modules; tests (and alternative
//! hosts) supply their own implementations and build [`StreamHandle`]s via
//! [`StreamHandle::new`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::auth::CredentialStore;
use crate::error::{AgentError, Result};
use crate::llm::types::{Delta, MessageParam, MessageResponse, ToolDefinition};
use crate::llm::{anthropic, google, openai};

/// Capacity of the delta channel.  A single slot keeps the producer in
/// lockstep with the consumer: every delta suspends the stream task until the
/// consumer pulls it, so relay order is also delivery order.
const STREAM_BUFFER: usize = 1;

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// The LLM backends the gateway can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    Google,
    OpenAi,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::Google => "google",
            Self::OpenAi => "openai",
        }
    }

    /// The model used when the caller does not pick one.
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Anthropic => "claude-sonnet-4-5-20250929",
            Self::Google => "gemini-3-flash-preview",
            Self::OpenAi => "gpt-5.2-codex",
        }
    }

    /// The cheap model used for secondary calls such as summarization.
    pub fn small_model(&self) -> &'static str {
        match self {
            Self::Anthropic => "claude-haiku-4-5-20251001",
            Self::Google => "gemini-2.0-flash",
            Self::OpenAi => "gpt-4o-mini",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "anthropic" => Ok(Self::Anthropic),
            "google" => Ok(Self::Google),
            "openai" => Ok(Self::OpenAi),
            other => Err(AgentError::Config {
                reason: format!("unknown provider: {other}"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A full request to one backend.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub provider: Provider,
    pub model: String,
    pub messages: Vec<MessageParam>,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolDefinition>,
}

impl ChatRequest {
    pub fn new(provider: Provider, model: impl Into<String>, messages: Vec<MessageParam>) -> Self {
        Self {
            provider,
            model: model.into(),
            messages,
            system_prompt: None,
            tools: Vec::new(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

// ---------------------------------------------------------------------------
// Two-phase streaming result
// ---------------------------------------------------------------------------

/// The consumer half of a streamed model call.
///
/// Two phases: a lazy, single-pass delta sequence drained via
/// [`next_delta`](Self::next_delta), and a completion resolved via
/// [`full_message`](Self::full_message).  The completion only resolves after
/// the producer has finished accumulating every delta internally, and it
/// yields a result equivalent to what [`ProviderGateway::prompt`] would have
/// returned for the same input, aggregated usage included.
pub struct StreamHandle {
    deltas: mpsc::Receiver<Delta>,
    completion: oneshot::Receiver<Result<MessageResponse>>,
}

impl StreamHandle {
    /// Create a connected producer/consumer pair.
    ///
    /// Gateway implementations hand the [`StreamProducer`] to the task that
    /// drives the backend stream and return the handle to the caller.
    pub fn new() -> (StreamProducer, StreamHandle) {
        let (delta_tx, delta_rx) = mpsc::channel(STREAM_BUFFER);
        let (completion_tx, completion_rx) = oneshot::channel();
        (
            StreamProducer {
                deltas: delta_tx,
                completion: completion_tx,
            },
            StreamHandle {
                deltas: delta_rx,
                completion: completion_rx,
            },
        )
    }

    /// Pull the next delta; `None` once the stream has ended.
    pub async fn next_delta(&mut self) -> Option<Delta> {
        self.deltas.recv().await
    }

    /// Resolve the final message.  Any undelivered deltas are discarded.
    pub async fn full_message(self) -> Result<MessageResponse> {
        let StreamHandle { deltas, completion } = self;
        drop(deltas);
        completion.await.map_err(|_| AgentError::StreamFailed {
            reason: "stream task ended without producing a result".into(),
        })?
    }
}

/// The producer half of a [`StreamHandle`].
pub struct StreamProducer {
    deltas: mpsc::Sender<Delta>,
    completion: oneshot::Sender<Result<MessageResponse>>,
}

impl StreamProducer {
    /// Relay one delta.  Returns `false` once the consumer has stopped
    /// pulling; producers keep accumulating either way so the completion
    /// stays truthful.
    pub async fn send(&self, delta: Delta) -> bool {
        self.deltas.send(delta).await.is_ok()
    }

    /// Finish the stream: close the delta channel and resolve the completion.
    pub fn finish(self, result: Result<MessageResponse>) {
        drop(self.deltas);
        let _ = self.completion.send(result);
    }
}

// ---------------------------------------------------------------------------
// Gateway trait
// ---------------------------------------------------------------------------

/// One-shot and streaming completion over a normalized message history.
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// One-shot completion.
    async fn prompt(&self, request: ChatRequest) -> Result<MessageResponse>;

    /// Streaming completion.  The returned handle's delta sequence is lazy,
    /// single-pass, and finite; it ends on backend completion or when
    /// `cancel` fires (in which case the completion resolves to
    /// [`AgentError::Cancelled`] and the in-flight request is aborted).
    async fn stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<StreamHandle>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// [`ProviderGateway`] over HTTP, covering the Anthropic Messages API, the
/// Google Gemini API, and the OpenAI Chat Completions API (including
/// OpenAI-compatible endpoints via [`with_base_url`](Self::with_base_url)).
///
/// Stateless apart from the connection pool and read-only credentials, so a
/// hosting process shares one instance across every session.
pub struct HttpGateway {
    http: reqwest::Client,
    credentials: CredentialStore,
    base_urls: HashMap<Provider, String>,
}

impl HttpGateway {
    pub fn new(credentials: CredentialStore) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| AgentError::Config {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            credentials,
            base_urls: HashMap::new(),
        })
    }

    /// Override the base URL for one provider (e.g. an OpenAI-compatible
    /// endpoint such as a local inference server).
    pub fn with_base_url(mut self, provider: Provider, url: impl Into<String>) -> Self {
        self.base_urls.insert(provider, url.into());
        self
    }

    fn base_url(&self, provider: Provider) -> Option<&str> {
        self.base_urls.get(&provider).map(String::as_str)
    }

    fn api_key(&self, provider: Provider) -> Result<String> {
        self.credentials
            .get(provider)
            .ok_or_else(|| AgentError::MissingApiKey {
                provider: provider.as_str().to_owned(),
            })
    }
}

#[async_trait]
impl ProviderGateway for HttpGateway {
    async fn prompt(&self, request: ChatRequest) -> Result<MessageResponse> {
        let api_key = self.api_key(request.provider)?;
        let base_url = self.base_url(request.provider);

        tracing::debug!(
            provider = %request.provider,
            model = %request.model,
            messages = request.messages.len(),
            "sending prompt request"
        );

        match request.provider {
            Provider::Anthropic => anthropic::prompt(&self.http, &api_key, base_url, &request).await,
            Provider::Google => google::prompt(&self.http, &api_key, base_url, &request).await,
            Provider::OpenAi => openai::prompt(&self.http, &api_key, base_url, &request).await,
        }
    }

    async fn stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<StreamHandle> {
        let api_key = self.api_key(request.provider)?;
        let base_url = self.base_url(request.provider);

        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        tracing::debug!(
            provider = %request.provider,
            model = %request.model,
            messages = request.messages.len(),
            "opening stream"
        );

        // Establish the connection before spawning so connection-level
        // failures (bad status, refused connect) surface here, where the
        // retry wrapper can see them.  Only body consumption runs in the
        // background task.
        let provider = request.provider;
        let response = match provider {
            Provider::Anthropic => {
                anthropic::open_stream(&self.http, &api_key, base_url, &request).await?
            }
            Provider::Google => google::open_stream(&self.http, &api_key, base_url, &request).await?,
            Provider::OpenAi => openai::open_stream(&self.http, &api_key, base_url, &request).await?,
        };

        let (producer, handle) = StreamHandle::new();
        tokio::spawn(async move {
            match provider {
                Provider::Anthropic => anthropic::drive_stream(response, producer, cancel).await,
                Provider::Google => google::drive_stream(response, producer, cancel).await,
                Provider::OpenAi => openai::drive_stream(response, producer, cancel).await,
            }
        });

        Ok(handle)
    }
}

/// Read a non-success response body into an [`AgentError::ApiStatus`].
pub(crate) async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AgentError::ApiStatus {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{ContentBlock, Message, Role, TextContent, Usage};

    fn response(text: &str) -> MessageResponse {
        MessageResponse {
            message: Message {
                role: Role::Assistant,
                content: vec![ContentBlock::Text(TextContent::new(text))],
            },
            usage: Usage::default(),
        }
    }

    #[tokio::test]
    async fn stream_handle_delivers_deltas_then_completion() {
        let (producer, mut handle) = StreamHandle::new();

        tokio::spawn(async move {
            producer
                .send(Delta::MessageStart {
                    role: Role::Assistant,
                })
                .await;
            producer
                .send(Delta::TextUpdate {
                    text: "hi".into(),
                })
                .await;
            producer.finish(Ok(response("hi")));
        });

        assert_eq!(
            handle.next_delta().await,
            Some(Delta::MessageStart {
                role: Role::Assistant
            })
        );
        assert_eq!(
            handle.next_delta().await,
            Some(Delta::TextUpdate { text: "hi".into() })
        );
        assert_eq!(handle.next_delta().await, None);

        let full = handle.full_message().await.unwrap();
        assert_eq!(full.message.text(), Some("hi"));
    }

    #[tokio::test]
    async fn full_message_without_draining_discards_deltas() {
        let (producer, handle) = StreamHandle::new();

        tokio::spawn(async move {
            // The consumer never drains; sends fail once it drops the
            // receiver, and the completion must still resolve.
            producer.send(Delta::TextUpdate { text: "a".into() }).await;
            producer.send(Delta::TextUpdate { text: "b".into() }).await;
            producer.finish(Ok(response("ab")));
        });

        let full = handle.full_message().await.unwrap();
        assert_eq!(full.message.text(), Some("ab"));
    }

    #[tokio::test]
    async fn dropped_producer_reports_stream_failure() {
        let (producer, handle) = StreamHandle::new();
        drop(producer);
        let err = handle.full_message().await.unwrap_err();
        assert!(matches!(err, AgentError::StreamFailed { .. }));
    }

    #[test]
    fn provider_models() {
        assert_eq!(Provider::Anthropic.default_model(), "claude-sonnet-4-5-20250929");
        assert_eq!(Provider::Anthropic.small_model(), "claude-haiku-4-5-20251001");
        assert_eq!(Provider::Google.small_model(), "gemini-2.0-flash");
        assert_eq!(Provider::OpenAi.small_model(), "gpt-4o-mini");
    }

    #[tokio::test]
    async fn missing_credential_is_a_configuration_error() {
        let gateway = HttpGateway::new(CredentialStore::empty()).unwrap();
        let request = ChatRequest::new(Provider::Anthropic, "claude-sonnet-4-5-20250929", vec![]);
        let err = gateway.prompt(request).await.unwrap_err();
        assert!(matches!(err, AgentError::MissingApiKey { ref provider } if provider == "anthropic"));
        assert!(!err.is_retryable());
    }
}
