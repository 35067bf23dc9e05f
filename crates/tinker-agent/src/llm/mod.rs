//! LLM gateway: normalized message model, per-backend wire translation, and
//! the two-phase streaming surface.

pub mod anthropic;
pub mod gateway;
pub mod google;
pub mod openai;
pub mod sse;
pub mod types;

pub use gateway::{
    ChatRequest, HttpGateway, Provider, ProviderGateway, StreamHandle, StreamProducer,
};
pub use types::{
    ContentBlock, Delta, Message, MessageContent, MessageParam, MessageResponse, Role,
    TextContent, ToolDefinition, ToolResultContent, ToolUseContent, Usage,
};
