use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::types::{AppState, InboundWebhookForm};

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

const CHANNEL_PREFIXES: [&str; 3] = ["whatsapp", "messenger", "facebook"];

/// Split a provider sender string like `whatsapp:+5215551234567` into
/// (channel, bare identifier). Unrecognized prefixes are rejected instead of
/// being misfiled under a default channel.
pub fn split_channel_identifier(raw: &str) -> Result<(String, String), String> {
    let trimmed = raw.trim();
    let Some((prefix, rest)) = trimmed.split_once(':') else {
        return Err(format!("sender '{trimmed}' has no channel prefix"));
    };
    let prefix = prefix.to_ascii_lowercase();
    if !CHANNEL_PREFIXES.contains(&prefix.as_str()) {
        return Err(format!("unsupported channel prefix '{prefix}'"));
    }
    if rest.is_empty() {
        return Err(format!("sender '{trimmed}' has an empty identifier"));
    }
    Ok((prefix, rest.to_string()))
}

pub fn phone_digits(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Phone column value for a contact. WhatsApp identifiers already are phone
/// numbers; for messenger/facebook the numeric platform id is shaped into one
/// so phone-keyed lookups (orders) still have something to match on.
pub fn synthesized_phone(external_user_id: &str) -> String {
    let digits = phone_digits(external_user_id);
    if digits.is_empty() {
        String::new()
    } else {
        format!("+{digits}")
    }
}

pub fn synthesized_display_name(channel: &str, external_user_id: &str, hint: &str) -> String {
    if !hint.trim().is_empty() {
        return hint.trim().to_string();
    }
    match channel {
        "whatsapp" => format!("WhatsApp {external_user_id}"),
        "messenger" => format!("Messenger {external_user_id}"),
        _ => format!("Facebook {external_user_id}"),
    }
}

pub fn validate_inbound(form: &InboundWebhookForm) -> Result<(), &'static str> {
    if form.from.trim().is_empty() {
        return Err("From is required");
    }
    let num_media = form.num_media.trim().parse::<usize>().unwrap_or(0);
    if form.body.is_none() && num_media == 0 {
        return Err("Body is required");
    }
    Ok(())
}

/// Upsert the contact row for (external_user_id, channel) and return its id.
/// The unique constraint makes concurrent first deliveries collapse onto one
/// row; the no-op update lets RETURNING yield the existing id.
pub async fn resolve_contact(
    db: &PgPool,
    external_user_id: &str,
    channel: &str,
    display_name_hint: &str,
) -> Result<String, sqlx::Error> {
    let now = now_iso();
    let id = Uuid::new_v4().to_string();
    let display_name = synthesized_display_name(channel, external_user_id, display_name_hint);
    let phone = synthesized_phone(external_user_id);

    let contact_id: String = sqlx::query_scalar(
        "INSERT INTO contacts (id, external_user_id, channel, display_name, phone, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$6) \
         ON CONFLICT (external_user_id, channel) DO UPDATE SET updated_at = EXCLUDED.updated_at \
         RETURNING id",
    )
    .bind(&id)
    .bind(external_user_id)
    .bind(channel)
    .bind(&display_name)
    .bind(&phone)
    .bind(&now)
    .fetch_one(db)
    .await?;

    // Backfill the display name when a real profile name arrives after the
    // contact was created with a synthesized one.
    if !display_name_hint.trim().is_empty() {
        let _ = sqlx::query(
            "UPDATE contacts SET display_name = $1 \
             WHERE id = $2 AND (display_name = '' OR display_name LIKE 'WhatsApp %' OR display_name LIKE 'Messenger %' OR display_name LIKE 'Facebook %')",
        )
        .bind(display_name_hint.trim())
        .bind(&contact_id)
        .execute(db)
        .await;
    }

    Ok(contact_id)
}

/// Most recent open/assigned conversation for the contact on this channel,
/// creating one when none is active. Resolved/closed threads never receive new
/// inbound messages; they get a fresh conversation instead.
pub async fn resolve_conversation(
    db: &PgPool,
    contact_id: &str,
    channel: &str,
) -> Result<String, sqlx::Error> {
    let existing: Option<String> = sqlx::query_scalar(
        "SELECT id FROM conversations \
         WHERE contact_id = $1 AND channel = $2 AND status IN ('open','assigned') \
         ORDER BY last_message_at DESC, created_at DESC LIMIT 1",
    )
    .bind(contact_id)
    .bind(channel)
    .fetch_optional(db)
    .await?;
    if let Some(id) = existing {
        return Ok(id);
    }

    let now = now_iso();
    let conversation_id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO conversations \
         (id, contact_id, channel, status, priority, assigned_agent_id, external_conversation_id, last_message_at, created_at, updated_at) \
         VALUES ($1,$2,$3,'open','medium',NULL,'',$4,$4,$4)",
    )
    .bind(&conversation_id)
    .bind(contact_id)
    .bind(channel)
    .bind(&now)
    .execute(db)
    .await?;
    Ok(conversation_id)
}

/// Insert the inbound message; a conflict on external_message_id means the
/// provider delivered the same message twice and the row is silently dropped.
/// Returns false for that duplicate case.
pub async fn record_inbound_message(
    db: &PgPool,
    conversation_id: &str,
    channel: &str,
    external_message_id: &str,
    content: &str,
    media_url: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let message_type = if media_url.is_some() { "media" } else { "text" };
    let metadata = match media_url {
        Some(url) => json!({ "mediaUrl": url }).to_string(),
        None => "{}".to_string(),
    };
    let result = sqlx::query(
        "INSERT INTO messages \
         (id, conversation_id, sender_type, channel, external_message_id, direction, content, message_type, metadata, created_at, read_at) \
         VALUES ($1,$2,'contact',$3,$4,'inbound',$5,$6,$7,$8,NULL) \
         ON CONFLICT (external_message_id) WHERE external_message_id <> '' DO NOTHING",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(conversation_id)
    .bind(channel)
    .bind(external_message_id)
    .bind(content)
    .bind(message_type)
    .bind(&metadata)
    .bind(now_iso())
    .execute(db)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Touch last_message_at/updated_at. No-ops when the conversation is gone.
pub async fn touch_conversation(db: &PgPool, conversation_id: &str) {
    let now = now_iso();
    let _ = sqlx::query(
        "UPDATE conversations SET last_message_at = $1, updated_at = $1 WHERE id = $2",
    )
    .bind(&now)
    .bind(conversation_id)
    .execute(db)
    .await;
}

/// Best-effort audit row. Returns None when the insert fails; processing
/// continues either way.
pub async fn log_webhook(
    db: &PgPool,
    channel: &str,
    external_id: &str,
    payload: &str,
) -> Option<String> {
    let id = Uuid::new_v4().to_string();
    let inserted = sqlx::query(
        "INSERT INTO webhook_logs (id, channel, external_id, payload, processed, error, created_at) \
         VALUES ($1,$2,$3,$4,FALSE,NULL,$5)",
    )
    .bind(&id)
    .bind(channel)
    .bind(external_id)
    .bind(payload)
    .bind(now_iso())
    .execute(db)
    .await;
    match inserted {
        Ok(_) => Some(id),
        Err(err) => {
            eprintln!("[webhook] audit log insert failed: {err}");
            None
        }
    }
}

pub async fn complete_webhook_log(db: &PgPool, log_id: &str, error: Option<&str>) {
    let result = sqlx::query(
        "UPDATE webhook_logs SET processed = $1, error = $2 WHERE id = $3",
    )
    .bind(error.is_none())
    .bind(error)
    .bind(log_id)
    .execute(db)
    .await;
    if let Err(err) = result {
        eprintln!("[webhook] audit log update failed: {err}");
    }
}

/// Full pipeline for one validated inbound payload: normalize the sender,
/// resolve contact and conversation, record the message, touch the thread.
/// Returns the JSON body the webhook responds with; the HTTP status is always
/// 200 so the provider never retries.
pub async fn process_inbound(state: &Arc<AppState>, form: &InboundWebhookForm, raw: &str) -> Value {
    let (channel, external_user_id) = match split_channel_identifier(&form.from) {
        Ok(parts) => parts,
        Err(reason) => {
            let log_id = log_webhook(&state.db, "", &form.message_sid, raw).await;
            if let Some(log_id) = log_id {
                complete_webhook_log(&state.db, &log_id, Some(&reason)).await;
            }
            eprintln!("[webhook] rejected payload: {reason}");
            return json!({ "success": false, "error": reason });
        }
    };

    let log_id = log_webhook(&state.db, &channel, &form.message_sid, raw).await;

    let outcome = ingest_message(state, form, &channel, &external_user_id).await;
    match outcome {
        Ok((conversation_id, inserted)) => {
            if let Some(log_id) = log_id {
                complete_webhook_log(&state.db, &log_id, None).await;
            }
            json!({
                "success": true,
                "conversationId": conversation_id,
                "duplicate": !inserted,
            })
        }
        Err(err) => {
            let reason = format!("inbound processing failed: {err}");
            eprintln!("[webhook] {reason}");
            if let Some(log_id) = log_id {
                complete_webhook_log(&state.db, &log_id, Some(&reason)).await;
            }
            json!({ "success": false, "error": "internal error" })
        }
    }
}

async fn ingest_message(
    state: &Arc<AppState>,
    form: &InboundWebhookForm,
    channel: &str,
    external_user_id: &str,
) -> Result<(String, bool), sqlx::Error> {
    let contact_id =
        resolve_contact(&state.db, external_user_id, channel, &form.profile_name).await?;
    let conversation_id = resolve_conversation(&state.db, &contact_id, channel).await?;

    let num_media = form.num_media.trim().parse::<usize>().unwrap_or(0);
    let media_url = if num_media > 0 {
        form.media_url0.as_deref().filter(|url| !url.is_empty())
    } else {
        None
    };
    let content = form.body.clone().unwrap_or_default();

    let inserted = record_inbound_message(
        &state.db,
        &conversation_id,
        channel,
        &form.message_sid,
        &content,
        media_url,
    )
    .await?;

    if inserted {
        touch_conversation(&state.db, &conversation_id).await;
    }
    Ok((conversation_id, inserted))
}

/// Destination formatting for outbound sends: WhatsApp wants `whatsapp:+e164`,
/// messenger/facebook the bare platform id behind their prefix.
pub fn outbound_destination(channel: &str, contact_phone: &str, external_user_id: &str) -> String {
    if channel == "whatsapp" {
        let digits = phone_digits(contact_phone);
        if !digits.is_empty() {
            return format!("whatsapp:+{digits}");
        }
        let digits = phone_digits(external_user_id);
        return format!("whatsapp:+{digits}");
    }
    format!("{channel}:{external_user_id}")
}

pub async fn unread_inbound_count(db: &PgPool, conversation_id: &str) -> usize {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(1) FROM messages \
         WHERE conversation_id = $1 AND direction = 'inbound' AND read_at IS NULL",
    )
    .bind(conversation_id)
    .fetch_one(db)
    .await
    .unwrap_or(0) as usize
}

pub async fn latest_message(db: &PgPool, conversation_id: &str) -> Option<crate::types::ChatMessage> {
    let row = sqlx::query(
        "SELECT id, conversation_id, sender_type, channel, external_message_id, direction, content, message_type, metadata, created_at, read_at \
         FROM messages WHERE conversation_id = $1 ORDER BY created_at DESC LIMIT 1",
    )
    .bind(conversation_id)
    .fetch_optional(db)
    .await
    .ok()
    .flatten()?;
    Some(parse_message_row(row))
}

pub fn parse_message_row(row: sqlx::postgres::PgRow) -> crate::types::ChatMessage {
    let metadata_raw: String = row.get("metadata");
    crate::types::ChatMessage {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        sender_type: row.get("sender_type"),
        channel: row.get("channel"),
        external_message_id: row.get("external_message_id"),
        direction: row.get("direction"),
        content: row.get("content"),
        message_type: row.get("message_type"),
        metadata: serde_json::from_str(&metadata_raw).unwrap_or_else(|_| json!({})),
        created_at: row.get("created_at"),
        read_at: row.get("read_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(from: &str, body: Option<&str>, num_media: &str) -> InboundWebhookForm {
        InboundWebhookForm {
            message_sid: "SM123".to_string(),
            from: from.to_string(),
            to: "whatsapp:+14155238886".to_string(),
            body: body.map(|b| b.to_string()),
            num_media: num_media.to_string(),
            media_url0: None,
            profile_name: String::new(),
        }
    }

    #[test]
    fn splits_whatsapp_sender() {
        let (channel, id) = split_channel_identifier("whatsapp:+5215551234567").unwrap();
        assert_eq!(channel, "whatsapp");
        assert_eq!(id, "+5215551234567");
    }

    #[test]
    fn splits_messenger_sender() {
        let (channel, id) = split_channel_identifier("messenger:998877").unwrap();
        assert_eq!(channel, "messenger");
        assert_eq!(id, "998877");
    }

    #[test]
    fn rejects_unknown_prefix() {
        assert!(split_channel_identifier("telegram:123").is_err());
    }

    #[test]
    fn rejects_missing_prefix() {
        assert!(split_channel_identifier("+5215551234567").is_err());
    }

    #[test]
    fn rejects_empty_identifier() {
        assert!(split_channel_identifier("whatsapp:").is_err());
    }

    #[test]
    fn prefix_is_case_insensitive() {
        let (channel, id) = split_channel_identifier("WhatsApp:+521555").unwrap();
        assert_eq!(channel, "whatsapp");
        assert_eq!(id, "+521555");
    }

    #[test]
    fn validate_requires_from() {
        assert!(validate_inbound(&form("", Some("hi"), "0")).is_err());
    }

    #[test]
    fn validate_requires_body_without_media() {
        assert!(validate_inbound(&form("whatsapp:+521555", None, "0")).is_err());
    }

    #[test]
    fn validate_allows_empty_body_with_media() {
        assert!(validate_inbound(&form("whatsapp:+521555", None, "1")).is_ok());
        assert!(validate_inbound(&form("whatsapp:+521555", Some(""), "0")).is_ok());
    }

    #[test]
    fn synthesizes_display_names() {
        assert_eq!(
            synthesized_display_name("whatsapp", "+521555", ""),
            "WhatsApp +521555"
        );
        assert_eq!(
            synthesized_display_name("messenger", "998877", ""),
            "Messenger 998877"
        );
        assert_eq!(synthesized_display_name("whatsapp", "+521555", " Ana "), "Ana");
    }

    #[test]
    fn synthesizes_phone_shapes() {
        assert_eq!(synthesized_phone("+5215551234567"), "+5215551234567");
        assert_eq!(synthesized_phone("998877"), "+998877");
        assert_eq!(synthesized_phone("abc"), "");
    }

    #[test]
    fn formats_outbound_destinations() {
        assert_eq!(
            outbound_destination("whatsapp", "+52 155 5123", ""),
            "whatsapp:+521555123"
        );
        assert_eq!(
            outbound_destination("whatsapp", "", "+5215551234567"),
            "whatsapp:+5215551234567"
        );
        assert_eq!(
            outbound_destination("messenger", "+998877", "998877"),
            "messenger:998877"
        );
        assert_eq!(
            outbound_destination("facebook", "", "12345"),
            "facebook:12345"
        );
    }

    #[test]
    fn digit_filter_strips_formatting() {
        assert_eq!(phone_digits("+52 (155) 512-34.67"), "5215551234567");
        assert_eq!(phone_digits("no digits"), "");
    }
}
