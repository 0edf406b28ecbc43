use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use cartwheel_core::config::LlmProvider;
use cartwheel_core::domain::chat::{ChatReply, ChatRequest, ReplyMetadata};
use cartwheel_core::domain::checkout::DeliveryMode;
use cartwheel_core::domain::conversation::{ContentBlock, ConversationId, Message, MessageMetadata};
use cartwheel_core::domain::tool::{ToolCall, ToolKind, ToolOutcome};
use cartwheel_core::errors::InterfaceError;

use crate::gateway::ToolGateway;
use crate::guardrails::Guardrails;
use crate::heuristics::{correct_delivery_code, extract_order_code, is_order_inquiry};
use crate::llm::{
    CompletionProvider, CompletionRequest, PromptMessage, PromptRole, ProviderError, ToolChoice,
    ToolInvocation, ToolSpec,
};
use crate::session::{SessionError, SessionStore};

const EMPTY_REPLY_PLACEHOLDER: &str =
    "I've completed the requested steps. Is there anything else I can help you with?";
const PROVIDER_FAILURE_REPLY: &str =
    "Sorry, I ran into a problem answering that. Please try again in a moment.";
const REAUTH_REPLY: &str = "Your session has expired. Please log in again to continue.";

/// Store-wide data fetched once at startup and embedded into every system
/// prompt so the model does not burn tool calls on it.
#[derive(Clone, Debug, Default)]
pub struct ReferenceData {
    pub categories: Value,
    pub site_config: Value,
}

/// The per-turn checkout state machine.
///
/// The completion model is treated as an unreliable instruction source: it
/// narrates actions it never issued, echoes display labels instead of backend
/// codes, and forgets order codes it was just shown. Every rule here exists
/// to make the checkout protocol hold structurally anyway.
pub struct Orchestrator {
    session: Arc<SessionStore>,
    gateway: ToolGateway,
    guardrails: Guardrails,
    default_provider: Arc<dyn CompletionProvider>,
    provider_overrides: HashMap<LlmProvider, Arc<dyn CompletionProvider>>,
    reference: ReferenceData,
    context_window: usize,
}

/// Accumulated record of one turn's tool activity.
#[derive(Default)]
struct TurnLog {
    blocks: Vec<ContentBlock>,
    results: Vec<(String, ToolOutcome)>,
    tools_used: Vec<String>,
    products_found: u32,
}

impl TurnLog {
    fn record(&mut self, call_id: &str, name: &str, arguments: &Value, outcome: &ToolOutcome) {
        self.blocks.push(ContentBlock::ToolInvocation {
            id: call_id.to_owned(),
            name: name.to_owned(),
            arguments: arguments.clone(),
        });
        self.blocks.push(ContentBlock::ToolResult {
            id: call_id.to_owned(),
            content: outcome.content.clone(),
            is_error: outcome.is_error,
        });
        self.results.push((name.to_owned(), outcome.clone()));
    }
}

impl Orchestrator {
    pub fn new(
        session: Arc<SessionStore>,
        gateway: ToolGateway,
        guardrails: Guardrails,
        default_provider: Arc<dyn CompletionProvider>,
        provider_overrides: HashMap<LlmProvider, Arc<dyn CompletionProvider>>,
        reference: ReferenceData,
        context_window: usize,
    ) -> Self {
        Self {
            session,
            gateway,
            guardrails,
            default_provider,
            provider_overrides,
            reference,
            context_window,
        }
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    /// Processes one inbound turn end to end. Turns for the same conversation
    /// are serialized on its lock; turns for different conversations run
    /// concurrently.
    pub async fn handle(&self, request: ChatRequest) -> Result<ChatReply, InterfaceError> {
        let caller = request.caller().to_owned();
        let known_conversation = request
            .conversation_id
            .as_deref()
            .map(|raw| self.session.exists(&ConversationId::from(raw)))
            .unwrap_or(false);

        if let Err(rejection) = self.guardrails.screen(&caller, &request.message, known_conversation)
        {
            info!(
                event_name = "agent.guardrail_rejected",
                caller_id = %caller,
                reason_code = rejection.reason_code(),
                "inbound message rejected before any backend call"
            );
            return Err(if rejection.is_rate_limit() {
                InterfaceError::rate_limited(rejection.to_string(), caller)
            } else {
                InterfaceError::bad_request(rejection.to_string(), caller)
            });
        }

        let (conversation_id, created) =
            self.session.ensure_conversation(request.conversation_id.as_deref(), Some(&caller));
        if created {
            self.guardrails.track_conversation(&caller, &conversation_id.0);
        }

        let turn_lock = self.session.turn_lock(&conversation_id).map_err(not_found)?;
        let _turn_guard = turn_lock.lock().await;

        self.session
            .append_message(&conversation_id, Message::user(&request.message))
            .map_err(not_found)?;

        // Opportunistic tracking: any order code in the user's text becomes
        // the conversation's "last referenced order".
        if let Some(code) = extract_order_code(&request.message) {
            let _ = self.session.set_last_order_code(&conversation_id, code);
        }

        let catalog: Vec<ToolSpec> = ToolKind::catalog_for(request.is_authenticated)
            .into_iter()
            .map(ToolSpec::for_kind)
            .collect();
        let tool_choice = self.forced_tool_choice(&request, &conversation_id);
        let system_prompt = self.build_system_prompt(&caller, request.is_authenticated);
        let history = self.prompt_history(&conversation_id)?;

        let provider = self.provider_for(request.provider_override);
        let first = match provider
            .complete(CompletionRequest {
                system_prompt: system_prompt.clone(),
                messages: history.clone(),
                tools: catalog,
                tool_choice: tool_choice.clone(),
            })
            .await
        {
            Ok(completion) => completion,
            Err(fault) => return self.provider_failure(&conversation_id, provider.name(), fault),
        };

        let invocations = enforce_forced_choice(first.tool_invocations.clone(), &tool_choice);

        let mut log = TurnLog::default();
        for invocation in &invocations {
            self.execute_invocation(&request, &conversation_id, invocation, &mut log).await;
        }

        let mut tokens_used = first.tokens_used;

        if detect_auth_expiry(&log.results) {
            info!(
                event_name = "agent.auth_expired",
                conversation_id = %conversation_id,
                "backend rejected the caller's token; short-circuiting to re-auth reply"
            );
            return self.finish_turn(
                &conversation_id,
                provider.name(),
                REAUTH_REPLY.to_owned(),
                log,
                tokens_used,
                true,
            );
        }

        let final_text = if log.results.is_empty() {
            first.text
        } else {
            let mut follow_up = history;
            if !first.text.trim().is_empty() {
                follow_up
                    .push(PromptMessage { role: PromptRole::Assistant, content: first.text.clone() });
            }
            follow_up.push(PromptMessage {
                role: PromptRole::Tool,
                content: render_tool_results(&log.results),
            });

            // Second pass gets no tools: its only job is the natural-language
            // reply over the results it was just shown.
            match provider
                .complete(CompletionRequest {
                    system_prompt,
                    messages: follow_up,
                    tools: Vec::new(),
                    tool_choice: ToolChoice::Auto,
                })
                .await
            {
                Ok(second) => {
                    tokens_used += second.tokens_used;
                    second.text
                }
                Err(fault) => {
                    return self.provider_failure(&conversation_id, provider.name(), fault)
                }
            }
        };

        let final_text = if final_text.trim().is_empty() {
            EMPTY_REPLY_PLACEHOLDER.to_owned()
        } else {
            final_text
        };

        self.finish_turn(&conversation_id, provider.name(), final_text, log, tokens_used, false)
    }

    /// Dispatches one model-requested invocation, applying auth gating, cart
    /// resolution, fuzzy code correction, and the structural chaining rules.
    async fn execute_invocation(
        &self,
        request: &ChatRequest,
        conversation_id: &ConversationId,
        invocation: &ToolInvocation,
        log: &mut TurnLog,
    ) {
        let Some(kind) = ToolKind::parse(&invocation.name) else {
            warn!(
                event_name = "agent.unknown_tool",
                conversation_id = %conversation_id,
                tool = %invocation.name,
                "model requested a tool outside the catalog"
            );
            let outcome = ToolOutcome::error(
                json!({ "error": format!("unknown tool `{}`", invocation.name) }),
            );
            log.record(&invocation.id, &invocation.name, &invocation.arguments, &outcome);
            return;
        };

        // Gated strictly by the request's flag; conversation content is never
        // consulted.
        if kind.requires_auth() && !request.is_authenticated {
            let outcome = ToolOutcome::error(
                json!({ "error": format!("`{kind}` requires an authenticated caller") }),
            );
            log.record(&invocation.id, kind.name(), &invocation.arguments, &outcome);
            return;
        }

        let mut arguments = invocation.arguments.clone();
        if !arguments.is_object() {
            arguments = json!({});
        }

        if kind == ToolKind::SetDeliveryMode {
            self.apply_delivery_code_correction(conversation_id, &mut arguments);
        }

        if kind.is_cart_scoped() {
            match self.resolve_cart(request, conversation_id, kind, log).await {
                CartResolution::Resolved(cart_id) => {
                    arguments["cart_id"] = json!(cart_id);
                }
                CartResolution::NoCart => {}
                CartResolution::CreationFailed => {
                    let outcome = ToolOutcome::error(
                        json!({ "error": "could not create a cart for this conversation" }),
                    );
                    log.record(&invocation.id, kind.name(), &arguments, &outcome);
                    return;
                }
            }
        }

        let outcome =
            self.run_tool(request, conversation_id, kind, arguments, &invocation.id, log).await;

        // Structural chaining: the model routinely narrates "the address has
        // been set" without issuing the follow-up call, so the follow-up is
        // never left to model discipline. Each chains exactly once per
        // successful predecessor.
        if !outcome.is_error {
            match kind {
                ToolKind::SetDeliveryAddress => {
                    let call_id = format!("chain-{}", Uuid::new_v4());
                    self.run_tool(
                        request,
                        conversation_id,
                        ToolKind::GetDeliveryModes,
                        self.cart_arguments(conversation_id),
                        &call_id,
                        log,
                    )
                    .await;
                }
                ToolKind::SetPaymentDetails => {
                    let call_id = format!("chain-{}", Uuid::new_v4());
                    if request.is_authenticated {
                        self.run_tool(
                            request,
                            conversation_id,
                            ToolKind::PlaceOrder,
                            self.cart_arguments(conversation_id),
                            &call_id,
                            log,
                        )
                        .await;
                    } else {
                        let outcome = ToolOutcome::error(json!({
                            "error": "`place_order` requires an authenticated caller"
                        }));
                        log.record(
                            &call_id,
                            ToolKind::PlaceOrder.name(),
                            &json!({}),
                            &outcome,
                        );
                    }
                }
                _ => {}
            }
        }
    }

    /// Executes one call through the gateway and folds its side effects into
    /// the conversation's checkout state.
    async fn run_tool(
        &self,
        request: &ChatRequest,
        conversation_id: &ConversationId,
        kind: ToolKind,
        arguments: Value,
        call_id: &str,
        log: &mut TurnLog,
    ) -> ToolOutcome {
        let call = ToolCall::new(call_id, kind, arguments.clone());
        let outcome = self.gateway.execute(&call, request.caller_access_token.as_deref()).await;
        log.tools_used.push(kind.name().to_owned());
        log.record(call_id, kind.name(), &arguments, &outcome);

        if !outcome.is_error {
            match kind {
                ToolKind::CreateCart => {
                    if let Some(cart_id) = extract_cart_id(&outcome.content) {
                        let _ = self.session.set_cart_id(conversation_id, cart_id);
                    }
                }
                ToolKind::GetDeliveryModes => {
                    let modes = parse_delivery_modes(&outcome.content);
                    if !modes.is_empty() {
                        let _ = self.session.set_delivery_modes(conversation_id, modes);
                    }
                }
                ToolKind::PlaceOrder => {
                    // The cart converted to an order; it must never be reused.
                    let _ = self.session.clear_cart(conversation_id);
                    if let Some(code) = extract_order_code_field(&outcome.content) {
                        let _ = self.session.set_last_order_code(conversation_id, code);
                    }
                }
                ToolKind::SearchProducts => {
                    log.products_found += count_products(&outcome.content);
                }
                _ => {}
            }
        }

        outcome
    }

    /// Resolves the conversation's cart, creating one transparently for
    /// cart-mutating calls. Runs under the turn lock, so two racing calls for
    /// the same conversation cannot each create a cart.
    async fn resolve_cart(
        &self,
        request: &ChatRequest,
        conversation_id: &ConversationId,
        kind: ToolKind,
        log: &mut TurnLog,
    ) -> CartResolution {
        if let Some(cart_id) = self.session.cart_id(conversation_id).ok().flatten() {
            return CartResolution::Resolved(cart_id);
        }
        if !kind.mutates_cart() {
            return CartResolution::NoCart;
        }

        let call_id = format!("auto-{}", Uuid::new_v4());
        let outcome =
            self.run_tool(request, conversation_id, ToolKind::CreateCart, json!({}), &call_id, log)
                .await;
        if outcome.is_error {
            return CartResolution::CreationFailed;
        }
        match self.session.cart_id(conversation_id).ok().flatten() {
            Some(cart_id) => CartResolution::Resolved(cart_id),
            None => CartResolution::NoCart,
        }
    }

    fn cart_arguments(&self, conversation_id: &ConversationId) -> Value {
        match self.session.cart_id(conversation_id).ok().flatten() {
            Some(cart_id) => json!({ "cart_id": cart_id }),
            None => json!({}),
        }
    }

    fn apply_delivery_code_correction(
        &self,
        conversation_id: &ConversationId,
        arguments: &mut Value,
    ) {
        let modes = self.session.delivery_modes(conversation_id).unwrap_or_default();
        let Some(requested) = arguments.get("delivery_code").and_then(Value::as_str) else {
            return;
        };
        if let Some(corrected) = correct_delivery_code(requested, &modes) {
            if corrected != requested {
                info!(
                    event_name = "agent.delivery_code_corrected",
                    conversation_id = %conversation_id,
                    requested,
                    corrected = %corrected,
                    "remapped model-supplied delivery code"
                );
            }
            arguments["delivery_code"] = json!(corrected);
        }
    }

    /// Order-inquiry tool forcing: an authenticated caller asking about an
    /// order gets a forced `order_status` call with the code from the message
    /// or, failing that, the conversation's tracked last order code.
    fn forced_tool_choice(
        &self,
        request: &ChatRequest,
        conversation_id: &ConversationId,
    ) -> ToolChoice {
        if !request.is_authenticated || !is_order_inquiry(&request.message) {
            return ToolChoice::Auto;
        }
        let code = extract_order_code(&request.message)
            .or_else(|| self.session.last_order_code(conversation_id).ok().flatten());
        match code {
            Some(code) => ToolChoice::Forced {
                name: ToolKind::OrderStatus.name().to_owned(),
                arguments: json!({ "order_code": code }),
            },
            None => ToolChoice::Auto,
        }
    }

    fn provider_for(&self, requested: Option<LlmProvider>) -> &Arc<dyn CompletionProvider> {
        requested
            .and_then(|key| self.provider_overrides.get(&key))
            .unwrap_or(&self.default_provider)
    }

    fn prompt_history(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<PromptMessage>, InterfaceError> {
        let messages = self
            .session
            .recent_messages(conversation_id, self.context_window)
            .map_err(not_found)?;
        Ok(messages
            .iter()
            .map(|message| PromptMessage {
                role: match message.role {
                    cartwheel_core::domain::conversation::Role::User => PromptRole::User,
                    cartwheel_core::domain::conversation::Role::Assistant => PromptRole::Assistant,
                },
                content: message.text(),
            })
            .collect())
    }

    fn build_system_prompt(&self, caller: &str, authenticated: bool) -> String {
        format!(
            "You are the shopping assistant for an online store. Help the customer search \
             products, manage their cart, and complete checkout using only the provided tools.\n\
             Rules:\n\
             - Stay on shopping topics; politely decline anything else.\n\
             - Add items to a cart before attempting checkout steps.\n\
             - After setting a delivery address, consult the available delivery modes before \
             selecting one, and select modes by their backend code, never by display label.\n\
             - Never invent order codes, prices, or product data; read them from tool results.\n\
             Caller: {caller} (authenticated: {authenticated}).\n\
             Category tree: {categories}\n\
             Site configuration: {site}",
            categories = self.reference.categories,
            site = self.reference.site_config,
        )
    }

    fn provider_failure(
        &self,
        conversation_id: &ConversationId,
        provider_name: &str,
        fault: ProviderError,
    ) -> Result<ChatReply, InterfaceError> {
        error!(
            event_name = "agent.provider_failed",
            conversation_id = %conversation_id,
            error = %fault,
            "completion provider call failed; turn degraded to generic reply"
        );
        // The user's message stays in history so the next turn has context.
        let message = Message::assistant(PROVIDER_FAILURE_REPLY).with_metadata(MessageMetadata {
            provider_name: Some(provider_name.to_owned()),
            ..MessageMetadata::default()
        });
        let _ = self.session.append_message(conversation_id, message);

        Ok(ChatReply {
            conversation_id: conversation_id.0.clone(),
            message: PROVIDER_FAILURE_REPLY.to_owned(),
            metadata: ReplyMetadata {
                products_found: 0,
                tools_used: Vec::new(),
                tokens_used: 0,
                provider_name: provider_name.to_owned(),
                reauth_required: false,
            },
        })
    }

    fn finish_turn(
        &self,
        conversation_id: &ConversationId,
        provider_name: &str,
        reply_text: String,
        log: TurnLog,
        tokens_used: u32,
        reauth_required: bool,
    ) -> Result<ChatReply, InterfaceError> {
        let sanitized = self.guardrails.sanitize(&reply_text);

        let metadata = MessageMetadata {
            products_found: log.products_found,
            tools_used: log.tools_used.clone(),
            tokens_used,
            provider_name: Some(provider_name.to_owned()),
        };

        let message = if log.blocks.is_empty() {
            Message::assistant(sanitized.clone())
        } else {
            let mut blocks = log.blocks;
            blocks.push(ContentBlock::Text { text: sanitized.clone() });
            Message::assistant_blocks(blocks)
        };
        self.session
            .append_message(conversation_id, message.with_metadata(metadata))
            .map_err(not_found)?;

        info!(
            event_name = "agent.turn_completed",
            conversation_id = %conversation_id,
            tools_used = log.tools_used.len(),
            products_found = log.products_found,
            tokens_used,
            reauth_required,
            "turn completed"
        );

        Ok(ChatReply {
            conversation_id: conversation_id.0.clone(),
            message: sanitized,
            metadata: ReplyMetadata {
                products_found: log.products_found,
                tools_used: log.tools_used,
                tokens_used,
                provider_name: provider_name.to_owned(),
                reauth_required,
            },
        })
    }
}

enum CartResolution {
    Resolved(String),
    NoCart,
    CreationFailed,
}

fn not_found(error: SessionError) -> InterfaceError {
    InterfaceError::bad_request(error.to_string(), "unassigned")
}

/// A forced tool choice is enforced after the call too: if the model ignored
/// the directive or mangled the arguments, the expected invocation is
/// restored.
fn enforce_forced_choice(
    mut invocations: Vec<ToolInvocation>,
    tool_choice: &ToolChoice,
) -> Vec<ToolInvocation> {
    if let ToolChoice::Forced { name, arguments } = tool_choice {
        match invocations.iter_mut().find(|invocation| invocation.name == *name) {
            Some(invocation) => invocation.arguments = arguments.clone(),
            None => invocations.insert(
                0,
                ToolInvocation {
                    id: format!("forced-{}", Uuid::new_v4()),
                    name: name.clone(),
                    arguments: arguments.clone(),
                },
            ),
        }
    }
    invocations
}

/// Matches the backend's unauthorized signatures in error payloads.
fn detect_auth_expiry(results: &[(String, ToolOutcome)]) -> bool {
    results.iter().any(|(_, outcome)| {
        if !outcome.is_error {
            return false;
        }
        if outcome.content.get("status").and_then(Value::as_u64) == Some(401) {
            return true;
        }
        outcome.content.to_string().to_ascii_lowercase().contains("unauthorized")
    })
}

fn render_tool_results(results: &[(String, ToolOutcome)]) -> String {
    let rendered: Vec<Value> = results
        .iter()
        .map(|(name, outcome)| {
            json!({ "tool": name, "is_error": outcome.is_error, "result": outcome.content })
        })
        .collect();
    json!({ "tool_results": rendered }).to_string()
}

fn extract_cart_id(content: &Value) -> Option<String> {
    content
        .get("cart_id")
        .or_else(|| content.get("code"))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn extract_order_code_field(content: &Value) -> Option<String> {
    content
        .get("order_code")
        .or_else(|| content.get("code"))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn parse_delivery_modes(content: &Value) -> Vec<DeliveryMode> {
    content
        .get("delivery_modes")
        .and_then(Value::as_array)
        .map(|modes| {
            modes
                .iter()
                .filter_map(|mode| {
                    Some(DeliveryMode {
                        code: mode.get("code")?.as_str()?.to_owned(),
                        name: mode
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_owned(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn count_products(content: &Value) -> u32 {
    content.get("products").and_then(Value::as_array).map(|products| products.len() as u32).unwrap_or(0)
}
