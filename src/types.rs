use serde::{Deserialize, Serialize};
use sqlx::PgPool;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub contact_id: String,
    pub channel: String,
    pub status: String,
    pub priority: String,
    pub assigned_agent_id: Option<String>,
    pub external_conversation_id: String,
    pub last_message_at: String,
    pub created_at: String,
    pub updated_at: String,
    pub contact_name: String,
    pub contact_phone: String,
    pub last_message: Option<ChatMessage>,
    pub unread_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_type: String,
    pub channel: String,
    #[serde(default)]
    pub external_message_id: String,
    pub direction: String,
    pub content: String,
    pub message_type: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationComment {
    pub id: String,
    pub conversation_id: String,
    pub agent_id: String,
    pub text: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAppointment {
    pub id: String,
    pub conversation_id: String,
    pub contact_id: String,
    pub agent_id: String,
    pub call_type: String,
    pub scheduled_at: String,
    pub duration_minutes: i32,
    pub status: String,
    pub notes: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MacroReply {
    pub id: String,
    pub title: String,
    pub shortcut: String,
    pub content: String,
    pub category: String,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    pub id: String,
    pub order_number: String,
    pub customer_name: String,
    pub customer_phone: String,
    pub status: String,
    pub total: String,
    pub currency: String,
    pub items: serde_json::Value,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: String,
    pub status: String,
    pub avatar_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookLogEntry {
    pub id: String,
    pub channel: String,
    pub external_id: String,
    pub payload: String,
    pub processed: bool,
    pub error: Option<String>,
    pub created_at: String,
}

pub struct AppState {
    pub db: PgPool,
    pub http_client: reqwest::Client,
    pub provider: ProviderConfig,
    pub webhook_signing_secret: String,
}

/// Outbound messaging provider credentials. An empty account_sid means sends
/// are persisted locally without calling out.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_whatsapp: String,
    pub from_messenger: String,
    pub api_base_url: String,
}

#[derive(Debug, Deserialize)]
pub struct InboundWebhookForm {
    #[serde(rename = "MessageSid", default)]
    pub message_sid: String,
    #[serde(rename = "From", default)]
    pub from: String,
    #[serde(rename = "To", default)]
    pub to: String,
    #[serde(rename = "Body")]
    pub body: Option<String>,
    #[serde(rename = "NumMedia", default)]
    pub num_media: String,
    #[serde(rename = "MediaUrl0")]
    pub media_url0: Option<String>,
    #[serde(rename = "ProfileName", default)]
    pub profile_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginBody {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAgentStatusBody {
    pub status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConversationStatusBody {
    pub status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConversationPriorityBody {
    pub priority: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignConversationBody {
    pub agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub content: String,
    #[serde(default)]
    pub media_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCommentBody {
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCommentBody {
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCallBody {
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub contact_id: String,
    #[serde(default)]
    pub call_type: String,
    pub scheduled_at: String,
    #[serde(default)]
    pub duration_minutes: Option<i32>,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCallBody {
    pub scheduled_at: Option<String>,
    pub duration_minutes: Option<i32>,
    pub status: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMacroBody {
    pub title: String,
    pub shortcut: String,
    pub content: String,
    #[serde(default)]
    pub category: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMacroBody {
    pub title: Option<String>,
    pub shortcut: Option<String>,
    pub content: Option<String>,
    pub category: Option<String>,
}
