pub mod config;
pub mod domain;
pub mod errors;

pub use config::{AppConfig, ConfigError, ConfigOverrides, LlmProvider, LoadOptions, LogFormat};
pub use domain::chat::{ChatReply, ChatRequest, ReplyMetadata};
pub use domain::checkout::{CheckoutState, DeliveryMode};
pub use domain::conversation::{
    ContentBlock, Conversation, ConversationId, Message, MessageContent, MessageMetadata, Role,
};
pub use domain::tool::{ToolCall, ToolKind, ToolOutcome};
pub use errors::{ApplicationError, DomainError, InterfaceError};
