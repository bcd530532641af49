use std::{collections::HashMap, env, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, patch, post, put},
    Json, Router,
};
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::inbound::{
    self, latest_message, outbound_destination, parse_message_row, phone_digits,
    touch_conversation, unread_inbound_count, validate_inbound,
};
use crate::types::*;

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn normalize_email(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

const CONVERSATION_STATUSES: [&str; 4] = ["open", "assigned", "resolved", "closed"];
const CONVERSATION_PRIORITIES: [&str; 3] = ["low", "medium", "high"];
const CALL_STATUSES: [&str; 4] = ["scheduled", "completed", "cancelled", "no_show"];
const AGENT_STATUSES: [&str; 3] = ["online", "away", "offline"];

fn is_conversation_status(value: &str) -> bool {
    CONVERSATION_STATUSES.contains(&value)
}

fn is_conversation_priority(value: &str) -> bool {
    CONVERSATION_PRIORITIES.contains(&value)
}

fn is_call_status(value: &str) -> bool {
    CALL_STATUSES.contains(&value)
}

fn is_agent_status(value: &str) -> bool {
    AGENT_STATUSES.contains(&value)
}

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_default();
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "inbox".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

/// Hex HMAC-SHA256 of the raw webhook body, compared against the provider's
/// signature header. Verification is skipped when no secret is configured.
fn verify_webhook_signature(secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    if secret.is_empty() {
        return true;
    }
    let signature = signature_header.unwrap_or("").trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db_err| db_err.is_unique_violation())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    Some(token.trim().to_string())
}

fn agent_profile_from_row(row: sqlx::postgres::PgRow) -> AgentProfile {
    AgentProfile {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        role: row.get("role"),
        status: row.get("status"),
        avatar_url: row.get("avatar_url"),
    }
}

async fn auth_agent_from_headers(
    state: &Arc<AppState>,
    headers: &HeaderMap,
) -> Result<AgentProfile, (StatusCode, Json<Value>)> {
    let token = bearer_token(headers).ok_or((
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "missing bearer token" })),
    ))?;

    let row = sqlx::query(
        "SELECT a.id, a.name, a.email, a.role, a.status, a.avatar_url \
         FROM user_sessions s JOIN agents a ON a.id = s.agent_id WHERE s.token = $1",
    )
    .bind(&token)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten()
    .ok_or((
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "invalid token" })),
    ))?;
    Ok(agent_profile_from_row(row))
}

async fn get_conversation_summary_db(
    pool: &PgPool,
    conversation_id: &str,
) -> Option<ConversationSummary> {
    let row = sqlx::query(
        "SELECT v.id, v.contact_id, v.channel, v.status, v.priority, v.assigned_agent_id, \
                v.external_conversation_id, v.last_message_at, v.created_at, v.updated_at, \
                c.display_name AS contact_name, c.phone AS contact_phone \
         FROM conversations v JOIN contacts c ON c.id = v.contact_id \
         WHERE v.id = $1",
    )
    .bind(conversation_id)
    .fetch_optional(pool)
    .await
    .ok()
    .flatten()?;
    Some(conversation_summary_from_row(pool, row).await)
}

async fn conversation_summary_from_row(
    pool: &PgPool,
    row: sqlx::postgres::PgRow,
) -> ConversationSummary {
    let id: String = row.get("id");
    let last_message = latest_message(pool, &id).await;
    let unread_count = unread_inbound_count(pool, &id).await;
    ConversationSummary {
        id,
        contact_id: row.get("contact_id"),
        channel: row.get("channel"),
        status: row.get("status"),
        priority: row.get("priority"),
        assigned_agent_id: row.get("assigned_agent_id"),
        external_conversation_id: row.get("external_conversation_id"),
        last_message_at: row.get("last_message_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        contact_name: row.get("contact_name"),
        contact_phone: row.get("contact_phone"),
        last_message,
        unread_count,
    }
}

fn comment_from_row(row: sqlx::postgres::PgRow) -> ConversationComment {
    ConversationComment {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        agent_id: row.get("agent_id"),
        text: row.get("text"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

async fn list_comments_db(pool: &PgPool, conversation_id: &str) -> Vec<ConversationComment> {
    sqlx::query(
        "SELECT id, conversation_id, agent_id, text, created_at, updated_at \
         FROM conversation_comments WHERE conversation_id = $1 ORDER BY created_at ASC",
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await
    .unwrap_or_default()
    .into_iter()
    .map(comment_from_row)
    .collect()
}

fn call_from_row(row: sqlx::postgres::PgRow) -> CallAppointment {
    CallAppointment {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        contact_id: row.get("contact_id"),
        agent_id: row.get("agent_id"),
        call_type: row.get("call_type"),
        scheduled_at: row.get("scheduled_at"),
        duration_minutes: row.get("duration_minutes"),
        status: row.get("status"),
        notes: row.get("notes"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn macro_from_row(row: sqlx::postgres::PgRow) -> MacroReply {
    MacroReply {
        id: row.get("id"),
        title: row.get("title"),
        shortcut: row.get("shortcut"),
        content: row.get("content"),
        category: row.get("category"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn order_from_row(row: sqlx::postgres::PgRow) -> OrderRecord {
    let items_raw: String = row.get("items");
    OrderRecord {
        id: row.get("id"),
        order_number: row.get("order_number"),
        customer_name: row.get("customer_name"),
        customer_phone: row.get("customer_phone"),
        status: row.get("status"),
        total: row.get("total"),
        currency: row.get("currency"),
        items: serde_json::from_str(&items_raw).unwrap_or_else(|_| json!([])),
        created_at: row.get("created_at"),
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

// ---------------------------------------------------------------------------
// Auth + agents

async fn login_agent(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginBody>,
) -> impl IntoResponse {
    let email = normalize_email(&body.email);
    let row = sqlx::query(
        "SELECT id, name, email, password_hash, role, status, avatar_url FROM agents WHERE email = $1",
    )
    .bind(&email)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();

    let Some(row) = row else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid credentials" })),
        )
            .into_response();
    };
    let password_hash: String = row.get("password_hash");
    let valid = verify(body.password, &password_hash).unwrap_or(false);
    if !valid {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid credentials" })),
        )
            .into_response();
    }

    let profile = agent_profile_from_row(row);
    let token = Uuid::new_v4().to_string();
    let inserted = sqlx::query(
        "INSERT INTO user_sessions (token, agent_id, created_at) VALUES ($1,$2,$3)",
    )
    .bind(&token)
    .bind(&profile.id)
    .bind(now_iso())
    .execute(&state.db)
    .await;
    if let Err(err) = inserted {
        eprintln!("[auth] failed to store session token: {err}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to create auth token" })),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        Json(json!({ "token": token, "agent": profile })),
    )
        .into_response()
}

async fn logout_agent(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let Some(token) = bearer_token(&headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing bearer token" })),
        )
            .into_response();
    };
    let _ = sqlx::query("DELETE FROM user_sessions WHERE token = $1")
        .bind(&token)
        .execute(&state.db)
        .await;
    (StatusCode::OK, Json(json!({ "ok": true }))).into_response()
}

async fn get_me(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    match auth_agent_from_headers(&state, &headers).await {
        Ok(profile) => (StatusCode::OK, Json(json!({ "agent": profile }))).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_agents(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let agents = sqlx::query(
        "SELECT id, name, email, role, status, avatar_url FROM agents ORDER BY name ASC",
    )
    .fetch_all(&state.db)
    .await
    .unwrap_or_default()
    .into_iter()
    .map(agent_profile_from_row)
    .collect::<Vec<_>>();
    Json(json!({ "agents": agents })).into_response()
}

async fn patch_agent_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateAgentStatusBody>,
) -> impl IntoResponse {
    let profile = match auth_agent_from_headers(&state, &headers).await {
        Ok(profile) => profile,
        Err(err) => return err.into_response(),
    };
    if !is_agent_status(&body.status) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "status must be one of online, away, offline" })),
        )
            .into_response();
    }
    let _ = sqlx::query("UPDATE agents SET status = $1, updated_at = $2 WHERE id = $3")
        .bind(&body.status)
        .bind(now_iso())
        .bind(&profile.id)
        .execute(&state.db)
        .await;
    Json(json!({ "ok": true, "status": body.status })).into_response()
}

// ---------------------------------------------------------------------------
// Inbound webhook

async fn inbound_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature = headers
        .get("x-webhook-signature")
        .and_then(|v| v.to_str().ok());
    if !verify_webhook_signature(&state.webhook_signing_secret, signature, &body) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid webhook signature" })),
        )
            .into_response();
    }

    let form = match serde_urlencoded::from_bytes::<InboundWebhookForm>(body.as_ref()) {
        Ok(form) => form,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "malformed form payload" })),
            )
                .into_response();
        }
    };
    if let Err(reason) = validate_inbound(&form) {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": reason }))).into_response();
    }

    let raw = String::from_utf8_lossy(&body).to_string();
    let result = inbound::process_inbound(&state, &form, &raw).await;
    // Always 200 past validation so the provider does not retry the delivery.
    (StatusCode::OK, Json(result)).into_response()
}

// ---------------------------------------------------------------------------
// Conversations

async fn get_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }

    let status = params.get("status").cloned().unwrap_or_default();
    let channel = params.get("channel").cloned().unwrap_or_default();
    let search = params.get("search").cloned().unwrap_or_default();

    let rows = sqlx::query(
        "SELECT v.id, v.contact_id, v.channel, v.status, v.priority, v.assigned_agent_id, \
                v.external_conversation_id, v.last_message_at, v.created_at, v.updated_at, \
                c.display_name AS contact_name, c.phone AS contact_phone \
         FROM conversations v JOIN contacts c ON c.id = v.contact_id \
         WHERE ($1 = '' OR v.status = $1) \
           AND ($2 = '' OR v.channel = $2) \
           AND ($3 = '' OR c.display_name ILIKE '%' || $3 || '%' OR c.phone ILIKE '%' || $3 || '%') \
         ORDER BY v.last_message_at DESC, v.created_at DESC \
         LIMIT 100",
    )
    .bind(&status)
    .bind(&channel)
    .bind(&search)
    .fetch_all(&state.db)
    .await;

    let rows = match rows {
        Ok(rows) => rows,
        Err(err) => {
            eprintln!("[conversations] list query failed: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to load conversations" })),
            )
                .into_response();
        }
    };

    let mut conversations = Vec::with_capacity(rows.len());
    for row in rows {
        conversations.push(conversation_summary_from_row(&state.db, row).await);
    }
    Json(json!({ "conversations": conversations })).into_response()
}

async fn get_conversation(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let Some(summary) = get_conversation_summary_db(&state.db, &conversation_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "conversation not found" })),
        )
            .into_response();
    };
    Json(json!({ "conversation": summary })).into_response()
}

async fn put_conversation_status(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateConversationStatusBody>,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    if !is_conversation_status(&body.status) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "status must be one of open, assigned, resolved, closed" })),
        )
            .into_response();
    }

    // Any-to-any transitions are allowed on purpose; the UI drives the
    // lifecycle. Leaving the assigned state clears the assignee.
    let result = if body.status == "assigned" {
        sqlx::query("UPDATE conversations SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(&body.status)
            .bind(now_iso())
            .bind(&conversation_id)
            .execute(&state.db)
            .await
    } else {
        sqlx::query(
            "UPDATE conversations SET status = $1, assigned_agent_id = NULL, updated_at = $2 WHERE id = $3",
        )
        .bind(&body.status)
        .bind(now_iso())
        .bind(&conversation_id)
        .execute(&state.db)
        .await
    };

    match result {
        Ok(done) if done.rows_affected() > 0 => {}
        Ok(_) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "conversation not found" })),
            )
                .into_response();
        }
        Err(err) => {
            eprintln!("[conversations] status update failed: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to update status" })),
            )
                .into_response();
        }
    }

    match get_conversation_summary_db(&state.db, &conversation_id).await {
        Some(summary) => Json(json!({ "conversation": summary })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "conversation not found" })),
        )
            .into_response(),
    }
}

async fn put_conversation_priority(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateConversationPriorityBody>,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    if !is_conversation_priority(&body.priority) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "priority must be one of low, medium, high" })),
        )
            .into_response();
    }
    let result = sqlx::query(
        "UPDATE conversations SET priority = $1, updated_at = $2 WHERE id = $3",
    )
    .bind(&body.priority)
    .bind(now_iso())
    .bind(&conversation_id)
    .execute(&state.db)
    .await;
    match result {
        Ok(done) if done.rows_affected() > 0 => {}
        Ok(_) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "conversation not found" })),
            )
                .into_response();
        }
        Err(err) => {
            eprintln!("[conversations] priority update failed: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to update priority" })),
            )
                .into_response();
        }
    }
    match get_conversation_summary_db(&state.db, &conversation_id).await {
        Some(summary) => Json(json!({ "conversation": summary })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "conversation not found" })),
        )
            .into_response(),
    }
}

async fn put_conversation_assign(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AssignConversationBody>,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }

    let agent_id = body.agent_id.filter(|id| !id.trim().is_empty());
    if let Some(ref agent_id) = agent_id {
        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM agents WHERE id = $1")
            .bind(agent_id)
            .fetch_one(&state.db)
            .await
            .unwrap_or(0)
            > 0;
        if !exists {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "unknown agent id" })),
            )
                .into_response();
        }
    }

    // Assigning moves an open thread to assigned; unassigning reopens it.
    let result = match agent_id {
        Some(ref agent_id) => sqlx::query(
            "UPDATE conversations SET assigned_agent_id = $1, \
                    status = CASE WHEN status = 'open' THEN 'assigned' ELSE status END, \
                    updated_at = $2 WHERE id = $3",
        )
        .bind(agent_id)
        .bind(now_iso())
        .bind(&conversation_id)
        .execute(&state.db)
        .await,
        None => sqlx::query(
            "UPDATE conversations SET assigned_agent_id = NULL, \
                    status = CASE WHEN status = 'assigned' THEN 'open' ELSE status END, \
                    updated_at = $1 WHERE id = $2",
        )
        .bind(now_iso())
        .bind(&conversation_id)
        .execute(&state.db)
        .await,
    };

    match result {
        Ok(done) if done.rows_affected() > 0 => {}
        Ok(_) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "conversation not found" })),
            )
                .into_response();
        }
        Err(err) => {
            eprintln!("[conversations] assign update failed: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to assign conversation" })),
            )
                .into_response();
        }
    }
    match get_conversation_summary_db(&state.db, &conversation_id).await {
        Some(summary) => Json(json!({ "conversation": summary })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "conversation not found" })),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// Messages

async fn get_conversation_messages(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM conversations WHERE id = $1")
        .bind(&conversation_id)
        .fetch_one(&state.db)
        .await
        .unwrap_or(0)
        > 0;
    if !exists {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "conversation not found" })),
        )
            .into_response();
    }
    let messages = sqlx::query(
        "SELECT id, conversation_id, sender_type, channel, external_message_id, direction, content, message_type, metadata, created_at, read_at \
         FROM messages WHERE conversation_id = $1 ORDER BY created_at ASC",
    )
    .bind(&conversation_id)
    .fetch_all(&state.db)
    .await
    .unwrap_or_default()
    .into_iter()
    .map(parse_message_row)
    .collect::<Vec<_>>();
    Json(json!({ "messages": messages })).into_response()
}

/// Calls the provider send API. Ok(sid) on success, Err(reason) on provider
/// failure, Ok("") when the provider is unconfigured (local-only persist).
async fn send_provider_message(
    state: &Arc<AppState>,
    channel: &str,
    destination: &str,
    content: &str,
    media_url: Option<&str>,
) -> Result<String, String> {
    let provider = &state.provider;
    if provider.account_sid.is_empty() {
        return Ok(String::new());
    }

    let from = if channel == "whatsapp" {
        provider.from_whatsapp.clone()
    } else {
        provider.from_messenger.clone()
    };
    if from.is_empty() {
        return Err(format!("no sender configured for channel '{channel}'"));
    }

    let url = format!(
        "{}/2010-04-01/Accounts/{}/Messages.json",
        provider.api_base_url.trim_end_matches('/'),
        provider.account_sid
    );
    let mut params = vec![
        ("To".to_string(), destination.to_string()),
        ("From".to_string(), from),
        ("Body".to_string(), content.to_string()),
    ];
    if let Some(url) = media_url {
        params.push(("MediaUrl".to_string(), url.to_string()));
    }

    let response = state
        .http_client
        .post(&url)
        .basic_auth(&provider.account_sid, Some(&provider.auth_token))
        .form(&params)
        .send()
        .await
        .map_err(|err| format!("provider request failed: {err}"))?;

    let status = response.status();
    let payload = response.json::<Value>().await.unwrap_or_else(|_| json!({}));
    if !status.is_success() {
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("provider rejected the message");
        return Err(format!("provider error {status}: {message}"));
    }
    Ok(payload
        .get("sid")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string())
}

async fn post_conversation_message(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SendMessageBody>,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    if body.content.trim().is_empty() && body.media_url.is_none() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "content is required" })),
        )
            .into_response();
    }

    let row = sqlx::query(
        "SELECT v.channel, c.phone, c.external_user_id \
         FROM conversations v JOIN contacts c ON c.id = v.contact_id WHERE v.id = $1",
    )
    .bind(&conversation_id)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();
    let Some(row) = row else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "conversation not found" })),
        )
            .into_response();
    };
    let channel: String = row.get("channel");
    let contact_phone: String = row.get("phone");
    let external_user_id: String = row.get("external_user_id");

    let destination = outbound_destination(&channel, &contact_phone, &external_user_id);
    let media_url = body.media_url.as_deref().filter(|url| !url.is_empty());
    let send_result =
        send_provider_message(&state, &channel, &destination, &body.content, media_url).await;

    let (external_message_id, send_error) = match &send_result {
        Ok(sid) => (sid.clone(), None),
        Err(reason) => {
            eprintln!("[outbound] delivery failed for {conversation_id}: {reason}");
            (String::new(), Some(reason.clone()))
        }
    };

    let mut metadata = json!({});
    if let Some(url) = media_url {
        metadata["mediaUrl"] = Value::String(url.to_string());
    }
    if let Some(reason) = &send_error {
        metadata["deliveryError"] = Value::String(reason.clone());
    }

    let message_type = if media_url.is_some() { "media" } else { "text" };
    let message = ChatMessage {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation_id.clone(),
        sender_type: "agent".to_string(),
        channel: channel.clone(),
        external_message_id,
        direction: "outbound".to_string(),
        content: body.content.clone(),
        message_type: message_type.to_string(),
        metadata,
        created_at: now_iso(),
        read_at: None,
    };

    let inserted = sqlx::query(
        "INSERT INTO messages \
         (id, conversation_id, sender_type, channel, external_message_id, direction, content, message_type, metadata, created_at, read_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,NULL)",
    )
    .bind(&message.id)
    .bind(&message.conversation_id)
    .bind(&message.sender_type)
    .bind(&message.channel)
    .bind(&message.external_message_id)
    .bind(&message.direction)
    .bind(&message.content)
    .bind(&message.message_type)
    .bind(message.metadata.to_string())
    .bind(&message.created_at)
    .execute(&state.db)
    .await;
    if let Err(err) = inserted {
        eprintln!("[outbound] failed to persist message: {err}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to store message" })),
        )
            .into_response();
    }
    touch_conversation(&state.db, &conversation_id).await;

    match send_result {
        Ok(sid) => (
            StatusCode::CREATED,
            Json(json!({
                "message": message,
                "delivered": !sid.is_empty(),
            })),
        )
            .into_response(),
        Err(_) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({
                "message": message,
                "delivered": false,
                "error": "provider delivery failed",
            })),
        )
            .into_response(),
    }
}

async fn post_conversation_read(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let result = sqlx::query(
        "UPDATE messages SET read_at = $1 \
         WHERE conversation_id = $2 AND direction = 'inbound' AND read_at IS NULL",
    )
    .bind(now_iso())
    .bind(&conversation_id)
    .execute(&state.db)
    .await;
    match result {
        Ok(done) => Json(json!({ "ok": true, "marked": done.rows_affected() })).into_response(),
        Err(err) => {
            eprintln!("[messages] mark-read failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to mark messages read" })),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Comments — every mutation answers with the full updated list so the UI can
// swap its local copy wholesale.

async fn get_comments(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let comments = list_comments_db(&state.db, &conversation_id).await;
    Json(json!({ "comments": comments })).into_response()
}

async fn post_comment(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateCommentBody>,
) -> impl IntoResponse {
    let profile = match auth_agent_from_headers(&state, &headers).await {
        Ok(profile) => profile,
        Err(err) => return err.into_response(),
    };
    if body.text.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "text is required" })),
        )
            .into_response();
    }
    let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM conversations WHERE id = $1")
        .bind(&conversation_id)
        .fetch_one(&state.db)
        .await
        .unwrap_or(0)
        > 0;
    if !exists {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "conversation not found" })),
        )
            .into_response();
    }

    let now = now_iso();
    let inserted = sqlx::query(
        "INSERT INTO conversation_comments (id, conversation_id, agent_id, text, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$5)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&conversation_id)
    .bind(&profile.id)
    .bind(body.text.trim())
    .bind(&now)
    .execute(&state.db)
    .await;
    if let Err(err) = inserted {
        eprintln!("[comments] insert failed: {err}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to store comment" })),
        )
            .into_response();
    }
    let comments = list_comments_db(&state.db, &conversation_id).await;
    (StatusCode::CREATED, Json(json!({ "comments": comments }))).into_response()
}

async fn patch_comment(
    Path((conversation_id, comment_id)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateCommentBody>,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    if body.text.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "text is required" })),
        )
            .into_response();
    }
    let result = sqlx::query(
        "UPDATE conversation_comments SET text = $1, updated_at = $2 \
         WHERE id = $3 AND conversation_id = $4",
    )
    .bind(body.text.trim())
    .bind(now_iso())
    .bind(&comment_id)
    .bind(&conversation_id)
    .execute(&state.db)
    .await;
    match result {
        Ok(done) if done.rows_affected() > 0 => {}
        Ok(_) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "comment not found" })),
            )
                .into_response();
        }
        Err(err) => {
            eprintln!("[comments] update failed: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to update comment" })),
            )
                .into_response();
        }
    }
    let comments = list_comments_db(&state.db, &conversation_id).await;
    Json(json!({ "comments": comments })).into_response()
}

async fn delete_comment(
    Path((conversation_id, comment_id)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let result = sqlx::query(
        "DELETE FROM conversation_comments WHERE id = $1 AND conversation_id = $2",
    )
    .bind(&comment_id)
    .bind(&conversation_id)
    .execute(&state.db)
    .await;
    match result {
        Ok(done) if done.rows_affected() > 0 => {}
        Ok(_) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "comment not found" })),
            )
                .into_response();
        }
        Err(err) => {
            eprintln!("[comments] delete failed: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to delete comment" })),
            )
                .into_response();
        }
    }
    let comments = list_comments_db(&state.db, &conversation_id).await;
    Json(json!({ "comments": comments })).into_response()
}

// ---------------------------------------------------------------------------
// Orders

async fn get_orders(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let phone = phone_digits(params.get("phone").map(String::as_str).unwrap_or(""));
    let search = params.get("search").cloned().unwrap_or_default();
    let orders = sqlx::query(
        "SELECT id, order_number, customer_name, customer_phone, status, total, currency, items, created_at \
         FROM orders \
         WHERE ($1 = '' OR regexp_replace(customer_phone, '[^0-9]', '', 'g') = $1) \
           AND ($2 = '' OR order_number ILIKE '%' || $2 || '%' OR customer_name ILIKE '%' || $2 || '%') \
         ORDER BY created_at DESC LIMIT 100",
    )
    .bind(&phone)
    .bind(&search)
    .fetch_all(&state.db)
    .await
    .unwrap_or_default()
    .into_iter()
    .map(order_from_row)
    .collect::<Vec<_>>();
    Json(json!({ "orders": orders })).into_response()
}

async fn get_order(
    Path(order_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let row = sqlx::query(
        "SELECT id, order_number, customer_name, customer_phone, status, total, currency, items, created_at \
         FROM orders WHERE id = $1",
    )
    .bind(&order_id)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();
    match row {
        Some(row) => Json(json!({ "order": order_from_row(row) })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "order not found" })),
        )
            .into_response(),
    }
}

async fn get_conversation_orders(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let phone: Option<String> = sqlx::query_scalar(
        "SELECT c.phone FROM conversations v JOIN contacts c ON c.id = v.contact_id WHERE v.id = $1",
    )
    .bind(&conversation_id)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();
    let Some(phone) = phone else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "conversation not found" })),
        )
            .into_response();
    };

    let digits = phone_digits(&phone);
    if digits.is_empty() {
        return Json(json!({ "orders": [] })).into_response();
    }
    let orders = sqlx::query(
        "SELECT id, order_number, customer_name, customer_phone, status, total, currency, items, created_at \
         FROM orders WHERE regexp_replace(customer_phone, '[^0-9]', '', 'g') = $1 \
         ORDER BY created_at DESC",
    )
    .bind(&digits)
    .fetch_all(&state.db)
    .await
    .unwrap_or_default()
    .into_iter()
    .map(order_from_row)
    .collect::<Vec<_>>();
    Json(json!({ "orders": orders })).into_response()
}

// ---------------------------------------------------------------------------
// Calls / scheduled sessions

async fn get_calls(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let conversation_id = params.get("conversation_id").cloned().unwrap_or_default();
    let calls = sqlx::query(
        "SELECT id, conversation_id, contact_id, agent_id, call_type, scheduled_at, duration_minutes, status, notes, created_at, updated_at \
         FROM calls WHERE ($1 = '' OR conversation_id = $1) ORDER BY scheduled_at ASC LIMIT 200",
    )
    .bind(&conversation_id)
    .fetch_all(&state.db)
    .await
    .unwrap_or_default()
    .into_iter()
    .map(call_from_row)
    .collect::<Vec<_>>();
    Json(json!({ "calls": calls })).into_response()
}

async fn post_call(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateCallBody>,
) -> impl IntoResponse {
    let profile = match auth_agent_from_headers(&state, &headers).await {
        Ok(profile) => profile,
        Err(err) => return err.into_response(),
    };
    if body.scheduled_at.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "scheduledAt is required" })),
        )
            .into_response();
    }
    let call_type = match body.call_type.as_str() {
        "session" => "session",
        _ => "call",
    };
    let mut contact_id = body.contact_id.clone();
    if !body.conversation_id.is_empty() {
        let linked: Option<String> =
            sqlx::query_scalar("SELECT contact_id FROM conversations WHERE id = $1")
                .bind(&body.conversation_id)
                .fetch_optional(&state.db)
                .await
                .ok()
                .flatten();
        let Some(linked) = linked else {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "conversation not found" })),
            )
                .into_response();
        };
        if contact_id.is_empty() {
            contact_id = linked;
        }
    }

    let now = now_iso();
    let id = Uuid::new_v4().to_string();
    let inserted = sqlx::query(
        "INSERT INTO calls (id, conversation_id, contact_id, agent_id, call_type, scheduled_at, duration_minutes, status, notes, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,'scheduled',$8,$9,$9)",
    )
    .bind(&id)
    .bind(&body.conversation_id)
    .bind(&contact_id)
    .bind(&profile.id)
    .bind(call_type)
    .bind(body.scheduled_at.trim())
    .bind(body.duration_minutes.unwrap_or(30))
    .bind(&body.notes)
    .bind(&now)
    .execute(&state.db)
    .await;
    if let Err(err) = inserted {
        eprintln!("[calls] insert failed: {err}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to schedule call" })),
        )
            .into_response();
    }

    let row = sqlx::query(
        "SELECT id, conversation_id, contact_id, agent_id, call_type, scheduled_at, duration_minutes, status, notes, created_at, updated_at \
         FROM calls WHERE id = $1",
    )
    .bind(&id)
    .fetch_one(&state.db)
    .await;
    match row {
        Ok(row) => (
            StatusCode::CREATED,
            Json(json!({ "call": call_from_row(row) })),
        )
            .into_response(),
        Err(err) => {
            eprintln!("[calls] reload failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to load scheduled call" })),
            )
                .into_response()
        }
    }
}

async fn patch_call(
    Path(call_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateCallBody>,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    if let Some(ref status) = body.status {
        if !is_call_status(status) {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "status must be one of scheduled, completed, cancelled, no_show" })),
            )
                .into_response();
        }
    }
    let result = sqlx::query(
        "UPDATE calls SET \
            scheduled_at = COALESCE($1, scheduled_at), \
            duration_minutes = COALESCE($2, duration_minutes), \
            status = COALESCE($3, status), \
            notes = COALESCE($4, notes), \
            updated_at = $5 \
         WHERE id = $6",
    )
    .bind(body.scheduled_at.as_deref())
    .bind(body.duration_minutes)
    .bind(body.status.as_deref())
    .bind(body.notes.as_deref())
    .bind(now_iso())
    .bind(&call_id)
    .execute(&state.db)
    .await;
    match result {
        Ok(done) if done.rows_affected() > 0 => {}
        Ok(_) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "call not found" })),
            )
                .into_response();
        }
        Err(err) => {
            eprintln!("[calls] update failed: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to update call" })),
            )
                .into_response();
        }
    }
    let row = sqlx::query(
        "SELECT id, conversation_id, contact_id, agent_id, call_type, scheduled_at, duration_minutes, status, notes, created_at, updated_at \
         FROM calls WHERE id = $1",
    )
    .bind(&call_id)
    .fetch_one(&state.db)
    .await;
    match row {
        Ok(row) => Json(json!({ "call": call_from_row(row) })).into_response(),
        Err(err) => {
            eprintln!("[calls] reload failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to load call" })),
            )
                .into_response()
        }
    }
}

async fn delete_call(
    Path(call_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let result = sqlx::query("DELETE FROM calls WHERE id = $1")
        .bind(&call_id)
        .execute(&state.db)
        .await;
    match result {
        Ok(done) if done.rows_affected() > 0 => Json(json!({ "ok": true })).into_response(),
        Ok(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "call not found" })),
        )
            .into_response(),
        Err(err) => {
            eprintln!("[calls] delete failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to delete call" })),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Macros (saved replies)

async fn get_macros(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let macros = sqlx::query(
        "SELECT id, title, shortcut, content, category, created_by, created_at, updated_at \
         FROM macros ORDER BY title ASC",
    )
    .fetch_all(&state.db)
    .await
    .unwrap_or_default()
    .into_iter()
    .map(macro_from_row)
    .collect::<Vec<_>>();
    Json(json!({ "macros": macros })).into_response()
}

async fn post_macro(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateMacroBody>,
) -> impl IntoResponse {
    let profile = match auth_agent_from_headers(&state, &headers).await {
        Ok(profile) => profile,
        Err(err) => return err.into_response(),
    };
    if body.title.trim().is_empty() || body.content.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "title and content are required" })),
        )
            .into_response();
    }
    let shortcut = body.shortcut.trim().replace('/', "");
    if shortcut.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "shortcut is required" })),
        )
            .into_response();
    }

    let now = now_iso();
    let id = Uuid::new_v4().to_string();
    let inserted = sqlx::query(
        "INSERT INTO macros (id, title, shortcut, content, category, created_by, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$7)",
    )
    .bind(&id)
    .bind(body.title.trim())
    .bind(&shortcut)
    .bind(&body.content)
    .bind(body.category.trim())
    .bind(&profile.id)
    .bind(&now)
    .execute(&state.db)
    .await;
    if let Err(err) = inserted {
        if is_unique_violation(&err) {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "shortcut already in use" })),
            )
                .into_response();
        }
        eprintln!("[macros] insert failed: {err}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to create macro" })),
        )
            .into_response();
    }

    let row = sqlx::query(
        "SELECT id, title, shortcut, content, category, created_by, created_at, updated_at \
         FROM macros WHERE id = $1",
    )
    .bind(&id)
    .fetch_one(&state.db)
    .await;
    match row {
        Ok(row) => (
            StatusCode::CREATED,
            Json(json!({ "macro": macro_from_row(row) })),
        )
            .into_response(),
        Err(err) => {
            eprintln!("[macros] reload failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to load macro" })),
            )
                .into_response()
        }
    }
}

async fn patch_macro(
    Path(macro_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateMacroBody>,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let shortcut = body.shortcut.map(|s| s.trim().replace('/', ""));
    if let Some(ref shortcut) = shortcut {
        if shortcut.is_empty() {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "shortcut cannot be empty" })),
            )
                .into_response();
        }
    }
    let result = sqlx::query(
        "UPDATE macros SET \
            title = COALESCE($1, title), \
            shortcut = COALESCE($2, shortcut), \
            content = COALESCE($3, content), \
            category = COALESCE($4, category), \
            updated_at = $5 \
         WHERE id = $6",
    )
    .bind(body.title.as_deref().map(str::trim))
    .bind(shortcut.as_deref())
    .bind(body.content.as_deref())
    .bind(body.category.as_deref().map(str::trim))
    .bind(now_iso())
    .bind(&macro_id)
    .execute(&state.db)
    .await;
    match result {
        Ok(done) if done.rows_affected() > 0 => {}
        Ok(_) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "macro not found" })),
            )
                .into_response();
        }
        Err(err) if is_unique_violation(&err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "shortcut already in use" })),
            )
                .into_response();
        }
        Err(err) => {
            eprintln!("[macros] update failed: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to update macro" })),
            )
                .into_response();
        }
    }
    let row = sqlx::query(
        "SELECT id, title, shortcut, content, category, created_by, created_at, updated_at \
         FROM macros WHERE id = $1",
    )
    .bind(&macro_id)
    .fetch_one(&state.db)
    .await;
    match row {
        Ok(row) => Json(json!({ "macro": macro_from_row(row) })).into_response(),
        Err(err) => {
            eprintln!("[macros] reload failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to load macro" })),
            )
                .into_response()
        }
    }
}

async fn delete_macro(
    Path(macro_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let result = sqlx::query("DELETE FROM macros WHERE id = $1")
        .bind(&macro_id)
        .execute(&state.db)
        .await;
    match result {
        Ok(done) if done.rows_affected() > 0 => Json(json!({ "ok": true })).into_response(),
        Ok(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "macro not found" })),
        )
            .into_response(),
        Err(err) => {
            eprintln!("[macros] delete failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to delete macro" })),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Webhook audit log (manual debugging only)

async fn get_webhook_logs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let limit = params
        .get("limit")
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(50)
        .clamp(1, 200);
    let logs = sqlx::query(
        "SELECT id, channel, external_id, payload, processed, error, created_at \
         FROM webhook_logs ORDER BY created_at DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(&state.db)
    .await
    .unwrap_or_default()
    .into_iter()
    .map(|row| WebhookLogEntry {
        id: row.get("id"),
        channel: row.get("channel"),
        external_id: row.get("external_id"),
        payload: row.get("payload"),
        processed: row.get("processed"),
        error: row.get("error"),
        created_at: row.get("created_at"),
    })
    .collect::<Vec<_>>();
    Json(json!({ "webhookLogs": logs })).into_response()
}

// ---------------------------------------------------------------------------
// Startup

async fn seed_admin_agent(db: &PgPool) {
    let email = env::var("SEED_ADMIN_EMAIL").unwrap_or_default();
    let password = env::var("SEED_ADMIN_PASSWORD").unwrap_or_default();
    if email.is_empty() || password.is_empty() {
        return;
    }
    let email = normalize_email(&email);
    let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM agents WHERE email = $1")
        .bind(&email)
        .fetch_one(db)
        .await
        .unwrap_or(0)
        > 0;
    if exists {
        return;
    }
    let Ok(password_hash) = hash(&password, DEFAULT_COST) else {
        eprintln!("[startup] failed to hash seed admin password");
        return;
    };
    let now = now_iso();
    let inserted = sqlx::query(
        "INSERT INTO agents (id, name, email, password_hash, role, status, avatar_url, created_at, updated_at) \
         VALUES ($1,'Admin',$2,$3,'admin','offline','',$4,$4)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&email)
    .bind(&password_hash)
    .bind(&now)
    .execute(db)
    .await;
    match inserted {
        Ok(_) => eprintln!("[startup] seeded admin agent {email}"),
        Err(err) => eprintln!("[startup] failed to seed admin agent: {err}"),
    }
}

fn provider_config_from_env() -> ProviderConfig {
    ProviderConfig {
        account_sid: env::var("PROVIDER_ACCOUNT_SID").unwrap_or_default(),
        auth_token: env::var("PROVIDER_AUTH_TOKEN").unwrap_or_default(),
        from_whatsapp: env::var("PROVIDER_FROM_WHATSAPP").unwrap_or_default(),
        from_messenger: env::var("PROVIDER_FROM_MESSENGER").unwrap_or_default(),
        api_base_url: env::var("PROVIDER_API_BASE_URL")
            .unwrap_or_else(|_| "https://api.twilio.com".to_string()),
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/webhooks/inbound", post(inbound_webhook))
        .route("/api/auth/login", post(login_agent))
        .route("/api/auth/logout", post(logout_agent))
        .route("/api/auth/me", get(get_me))
        .route("/api/agents", get(get_agents))
        .route("/api/agents/status", patch(patch_agent_status))
        .route("/api/conversations", get(get_conversations))
        .route("/api/conversations/{conversation_id}", get(get_conversation))
        .route(
            "/api/conversations/{conversation_id}/status",
            put(put_conversation_status),
        )
        .route(
            "/api/conversations/{conversation_id}/priority",
            put(put_conversation_priority),
        )
        .route(
            "/api/conversations/{conversation_id}/assign",
            put(put_conversation_assign),
        )
        .route(
            "/api/conversations/{conversation_id}/messages",
            get(get_conversation_messages).post(post_conversation_message),
        )
        .route(
            "/api/conversations/{conversation_id}/read",
            post(post_conversation_read),
        )
        .route(
            "/api/conversations/{conversation_id}/comments",
            get(get_comments).post(post_comment),
        )
        .route(
            "/api/conversations/{conversation_id}/comments/{comment_id}",
            patch(patch_comment).delete(delete_comment),
        )
        .route(
            "/api/conversations/{conversation_id}/orders",
            get(get_conversation_orders),
        )
        .route("/api/orders", get(get_orders))
        .route("/api/orders/{order_id}", get(get_order))
        .route("/api/calls", get(get_calls).post(post_call))
        .route(
            "/api/calls/{call_id}",
            patch(patch_call).delete(delete_call),
        )
        .route("/api/macros", get(get_macros).post(post_macro))
        .route(
            "/api/macros/{macro_id}",
            patch(patch_macro).delete(delete_macro),
        )
        .route("/api/webhook-logs", get(get_webhook_logs))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run() {
    let _ = dotenvy::dotenv();

    let port = env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(4000);
    let database_url = resolve_database_url();

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)");

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .expect("failed to run sqlx migrations");

    seed_admin_agent(&db).await;

    let state = Arc::new(AppState {
        db,
        http_client: reqwest::Client::new(),
        provider: provider_config_from_env(),
        webhook_signing_secret: env::var("WEBHOOK_SIGNING_SECRET").unwrap_or_default(),
    });

    let app = router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    println!("inbox server running at http://localhost:{port}");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_status_value_is_accepted() {
        // The lifecycle is deliberately permissive: the UI may move a
        // conversation between any two statuses.
        for status in CONVERSATION_STATUSES {
            assert!(is_conversation_status(status));
        }
        assert!(!is_conversation_status("archived"));
        assert!(!is_conversation_status(""));
    }

    #[test]
    fn priority_values() {
        for priority in CONVERSATION_PRIORITIES {
            assert!(is_conversation_priority(priority));
        }
        assert!(!is_conversation_priority("urgent"));
    }

    #[test]
    fn call_status_values() {
        for status in CALL_STATUSES {
            assert!(is_call_status(status));
        }
        assert!(!is_call_status("missed"));
    }

    #[test]
    fn email_normalization() {
        assert_eq!(normalize_email("  Ana@Example.COM "), "ana@example.com");
    }

    #[test]
    fn signature_skipped_without_secret() {
        assert!(verify_webhook_signature("", None, b"payload"));
    }

    #[test]
    fn signature_required_with_secret() {
        assert!(!verify_webhook_signature("secret", None, b"payload"));
        assert!(!verify_webhook_signature("secret", Some(""), b"payload"));
        assert!(!verify_webhook_signature("secret", Some("deadbeef"), b"payload"));
        assert!(!verify_webhook_signature("secret", Some("not-hex!"), b"payload"));
    }

    #[test]
    fn signature_accepts_valid_hmac() {
        let mut mac = Hmac::<Sha256>::new_from_slice(b"secret").unwrap();
        mac.update(b"payload");
        let sig = hex::encode(mac.finalize().into_bytes());
        assert!(verify_webhook_signature("secret", Some(&sig), b"payload"));
        assert!(!verify_webhook_signature("secret", Some(&sig), b"tampered"));
    }

    #[test]
    fn unique_violation_is_told_apart_from_other_db_errors() {
        #[derive(Debug)]
        struct DuplicateKey;

        impl std::fmt::Display for DuplicateKey {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("duplicate key value violates unique constraint")
            }
        }
        impl std::error::Error for DuplicateKey {}
        impl sqlx::error::DatabaseError for DuplicateKey {
            fn message(&self) -> &str {
                "duplicate key value violates unique constraint"
            }
            fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
                self
            }
            fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
                self
            }
            fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
                self
            }
            fn kind(&self) -> sqlx::error::ErrorKind {
                sqlx::error::ErrorKind::UniqueViolation
            }
        }

        let dup = sqlx::Error::Database(Box::new(DuplicateKey));
        assert!(is_unique_violation(&dup));
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn webhook_form_parses_provider_fields() {
        let body = "MessageSid=SM1&From=whatsapp%3A%2B5215551234567&To=whatsapp%3A%2B14155238886&Body=hola&NumMedia=0";
        let form: InboundWebhookForm = serde_urlencoded::from_str(body).unwrap();
        assert_eq!(form.message_sid, "SM1");
        assert_eq!(form.from, "whatsapp:+5215551234567");
        assert_eq!(form.body.as_deref(), Some("hola"));
        assert_eq!(form.num_media, "0");
        assert!(form.media_url0.is_none());
    }

    #[test]
    fn webhook_form_tolerates_missing_body() {
        let body = "MessageSid=SM2&From=messenger%3A998877&NumMedia=1&MediaUrl0=https%3A%2F%2Fcdn%2Fimg.jpg";
        let form: InboundWebhookForm = serde_urlencoded::from_str(body).unwrap();
        assert!(form.body.is_none());
        assert_eq!(form.media_url0.as_deref(), Some("https://cdn/img.jpg"));
    }
}
