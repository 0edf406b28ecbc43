//! Tool-call orchestration engine for the Cartwheel shopping assistant.
//!
//! This crate is the "brain" of the system: given a user message it decides
//! which remote commerce tools to invoke, corrects the completion model's
//! mistakes, and synthesizes the final reply. The completion model is treated
//! as an unreliable instruction source, so the checkout protocol is enforced
//! structurally here:
//!
//! - **Auto-chaining** (`orchestrator`) - a successful delivery-address set is
//!   always followed by a delivery-modes fetch, and a successful payment set
//!   by an order placement, whether or not the model asked for them.
//! - **Fuzzy correction** (`heuristics`) - model-supplied delivery codes are
//!   remapped to the nearest cached backend code.
//! - **Cart lifecycle** (`session` + `orchestrator`) - carts are created
//!   lazily, tracked per conversation, and retired once an order is placed.
//!
//! Resilience collaborators keep the loop usable against a flaky backend:
//! bounded retry with deterministic backoff (`retry`), a TTL/size-bounded
//! read cache (`cache`), a sliding-window health monitor (`health`), and a
//! guardrail filter screening every inbound message and sanitizing every
//! outbound reply (`guardrails`).

pub mod cache;
pub mod gateway;
pub mod guardrails;
pub mod health;
pub mod heuristics;
pub mod llm;
pub mod orchestrator;
pub mod retry;
pub mod session;

pub use cache::TtlCache;
pub use gateway::{BackendError, CommerceBackend, ToolGateway};
pub use guardrails::{GuardrailRejection, Guardrails};
pub use health::{HealthMonitor, HealthSnapshot, HealthStatus};
pub use llm::{
    Completion, CompletionProvider, CompletionRequest, PromptMessage, PromptRole, ProviderError,
    StopReason, ToolChoice, ToolInvocation, ToolSpec,
};
pub use orchestrator::{Orchestrator, ReferenceData};
pub use retry::{run_with_retry, RetryClass, RetryError, RetryPolicy};
pub use session::{SessionError, SessionStore};
