use serde::{Deserialize, Serialize};

use crate::config::LlmProvider;

/// Inbound turn request as delivered by the transport layer.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub caller_id: Option<String>,
    #[serde(default)]
    pub is_authenticated: bool,
    #[serde(default)]
    pub caller_access_token: Option<String>,
    #[serde(default)]
    pub provider_override: Option<LlmProvider>,
}

impl ChatRequest {
    pub fn caller(&self) -> &str {
        self.caller_id.as_deref().unwrap_or("anonymous")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyMetadata {
    pub products_found: u32,
    pub tools_used: Vec<String>,
    pub tokens_used: u32,
    pub provider_name: String,
    /// Set when the backend rejected the caller's token; the client should
    /// re-authenticate before retrying.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub reauth_required: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub conversation_id: String,
    pub message: String,
    pub metadata: ReplyMetadata,
}
