use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::broadcast::normalize_phone;
use crate::types::{AppState, ScheduledReminder};

pub const REMINDER_TTL_SECONDS: u64 = 48 * 3600;
pub const REMINDER_LEAD_MINUTES: i64 = 60;
const SWEEP_INTERVAL_SECONDS: u64 = 60;

pub fn reminder_key(event_uri: &str) -> String {
    format!("reminder:{event_uri}")
}

async fn send_text_best_effort(state: &AppState, phone: &str, text: &str) {
    let Some(transport) = &state.transport else {
        return;
    };
    if let Err(err) = transport.send_text(phone, text).await {
        tracing::warn!(phone, %err, "scheduling message failed to send");
    }
}

/// A one-shot scheduling link from Calendly, falling back to the configured
/// public booking link when the API is unavailable or unconfigured.
pub async fn create_scheduling_link(state: &AppState) -> Result<String, String> {
    let config = &state.config;
    if !config.calendly_api_key.is_empty() && !config.calendly_event_type.is_empty() {
        let attempt = state
            .http
            .post("https://api.calendly.com/scheduling_links")
            .bearer_auth(&config.calendly_api_key)
            .json(&json!({
                "max_event_count": 1,
                "owner": config.calendly_event_type,
                "owner_type": "EventType",
            }))
            .send()
            .await;
        match attempt {
            Ok(response) if response.status().is_success() => {
                if let Ok(payload) = response.json::<Value>().await {
                    if let Some(url) = payload
                        .get("resource")
                        .and_then(|r| r.get("booking_url"))
                        .and_then(Value::as_str)
                    {
                        return Ok(url.to_string());
                    }
                }
                tracing::warn!("calendly response had no booking_url");
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                tracing::warn!(%status, body, "calendly link creation failed");
            }
            Err(err) => tracing::warn!(%err, "calendly request failed"),
        }
    }
    if !config.calendly_public_link.is_empty() {
        return Ok(config.calendly_public_link.clone());
    }
    Err("calendly not configured".to_string())
}

/// Create a scheduling link and deliver it over WhatsApp. Backs
/// `POST /api/schedule-visit` and the conversational scheduling intent.
pub async fn send_scheduling_link(
    state: &AppState,
    phone: &str,
    name: &str,
    property_id: Option<&str>,
) -> Result<String, String> {
    let link = create_scheduling_link(state).await?;
    let text = scheduling_invite_text(name, property_id, &link);
    send_text_best_effort(state, phone, &text).await;
    Ok(link)
}

fn scheduling_invite_text(name: &str, property_id: Option<&str>, link: &str) -> String {
    let greeting = if name.trim().is_empty() {
        String::new()
    } else {
        format!("{}, ", name.trim().split_whitespace().next().unwrap_or(""))
    };
    let visit = match property_id {
        Some(id) => format!("sua visita ao imóvel código {id}"),
        None => "sua visita".to_string(),
    };
    format!("{greeting}para agendar {visit} é só escolher o melhor horário aqui: {link} 📅")
}

/// Customer phone out of the Calendly custom question answers.
pub fn phone_from_invitee(payload: &Value) -> Option<String> {
    let answers = payload.get("questions_and_answers")?.as_array()?;
    for entry in answers {
        let question = entry
            .get("question")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_lowercase();
        if question.contains("telefone") || question.contains("whatsapp") {
            if let Some(answer) = entry.get("answer").and_then(Value::as_str) {
                if let Some(phone) = normalize_phone(answer) {
                    return Some(phone);
                }
            }
        }
    }
    None
}

fn event_uri(payload: &Value) -> String {
    payload
        .get("scheduled_event")
        .and_then(|e| e.get("uri"))
        .and_then(Value::as_str)
        .or_else(|| payload.get("event").and_then(Value::as_str))
        .or_else(|| payload.get("uri").and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}

/// Reminder record out of an `invitee.created` payload. `None` when the
/// phone is missing, the start time is unparseable, or the reminder moment
/// (60 minutes before the visit) has already passed.
pub fn reminder_from_payload(payload: &Value, now: DateTime<Utc>) -> Option<ScheduledReminder> {
    let phone = phone_from_invitee(payload)?;
    let start_raw = payload
        .get("scheduled_event")
        .and_then(|e| e.get("start_time"))
        .and_then(Value::as_str)?;
    let start = DateTime::parse_from_rfc3339(start_raw)
        .ok()?
        .with_timezone(&Utc);
    let fire_at = start - chrono::Duration::minutes(REMINDER_LEAD_MINUTES);
    if fire_at <= now {
        return None;
    }
    let uri = event_uri(payload);
    if uri.is_empty() {
        return None;
    }
    Some(ScheduledReminder {
        event_uri: uri,
        phone,
        invitee_name: payload
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        property_title: payload
            .get("tracking")
            .and_then(|t| t.get("utm_content"))
            .and_then(Value::as_str)
            .map(str::to_string),
        visit_start: start.to_rfc3339(),
        fire_at: fire_at.to_rfc3339(),
        created_at: now.to_rfc3339(),
    })
}

fn friendly_time(rfc3339: &str) -> String {
    DateTime::parse_from_rfc3339(rfc3339)
        .map(|dt| dt.format("%d/%m às %H:%M").to_string())
        .unwrap_or_else(|_| rfc3339.to_string())
}

/// Booking confirmed: confirm to the customer, notify the realtor, store the
/// reminder record for the sweep.
pub async fn handle_invitee_created(state: &AppState, payload: &Value) {
    let Some(phone) = phone_from_invitee(payload) else {
        tracing::warn!("invitee.created without a resolvable phone number");
        return;
    };
    let name = payload
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let start = payload
        .get("scheduled_event")
        .and_then(|e| e.get("start_time"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    send_text_best_effort(
        state,
        &phone,
        &format!(
            "Visita confirmada para {}! Qualquer imprevisto é só me avisar por aqui. 🏠",
            friendly_time(start)
        ),
    )
    .await;
    if !state.config.realtor_phone.is_empty() {
        send_text_best_effort(
            state,
            &state.config.realtor_phone,
            &format!(
                "Nova visita agendada: {} ({}) em {}.",
                name,
                phone,
                friendly_time(start)
            ),
        )
        .await;
    }

    if let Some(reminder) = reminder_from_payload(payload, Utc::now()) {
        state
            .kv
            .set_json(
                &reminder_key(&reminder.event_uri),
                &reminder,
                Some(REMINDER_TTL_SECONDS),
            )
            .await;
        tracing::info!(event_uri = %reminder.event_uri, fire_at = %reminder.fire_at, "reminder stored");
    }
}

/// Booking canceled: delete the reminder record (which also prevents the
/// sweep from ever firing it) and notify both parties.
pub async fn handle_invitee_canceled(state: &AppState, payload: &Value) {
    let uri = event_uri(payload);
    let stored: Option<ScheduledReminder> = if uri.is_empty() {
        None
    } else {
        state.kv.get_json(&reminder_key(&uri)).await
    };
    if !uri.is_empty() {
        state.kv.del(&reminder_key(&uri)).await;
    }

    let phone = stored
        .as_ref()
        .map(|r| r.phone.clone())
        .or_else(|| phone_from_invitee(payload));
    if let Some(phone) = phone {
        send_text_best_effort(
            state,
            &phone,
            "Sua visita foi cancelada. Quando quiser remarcar é só me chamar por aqui! 😉",
        )
        .await;
    }
    if !state.config.realtor_phone.is_empty() {
        let who = stored
            .as_ref()
            .map(|r| r.invitee_name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "cliente".to_string());
        send_text_best_effort(
            state,
            &state.config.realtor_phone,
            &format!("Visita cancelada: {who}."),
        )
        .await;
    }
}

/// One pass over the durable reminder records: fire everything due, delete
/// what fired. Returns how many reminders fired.
pub async fn sweep_due_reminders(state: &AppState) -> usize {
    let now = Utc::now();
    let mut fired = 0usize;
    for key in state.kv.keys_with_prefix("reminder:").await {
        let Some(reminder) = state.kv.get_json::<ScheduledReminder>(&key).await else {
            continue;
        };
        let due = DateTime::parse_from_rfc3339(&reminder.fire_at)
            .map(|at| at.with_timezone(&Utc) <= now)
            .unwrap_or(true);
        if !due {
            continue;
        }
        let place = reminder
            .property_title
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(|t| format!(" no imóvel {t}"))
            .unwrap_or_default();
        send_text_best_effort(
            state,
            &reminder.phone,
            &format!(
                "Lembrete: sua visita{place} é hoje, {}. Até já! 🏠",
                friendly_time(&reminder.visit_start)
            ),
        )
        .await;
        if !state.config.realtor_phone.is_empty() {
            send_text_best_effort(
                state,
                &state.config.realtor_phone,
                &format!(
                    "Lembrete de visita em 1h: {} ({}) às {}.",
                    reminder.invitee_name,
                    reminder.phone,
                    friendly_time(&reminder.visit_start)
                ),
            )
            .await;
        }
        state.kv.del(&key).await;
        fired += 1;
        tracing::info!(event_uri = %reminder.event_uri, "reminder fired");
    }
    fired
}

/// Long-lived background task: poll the durable records instead of arming
/// in-process timers, so restarts keep pending reminders and cancellation is
/// just the record deletion.
pub async fn run_reminder_sweep(state: Arc<AppState>) {
    loop {
        tokio::time::sleep(Duration::from_secs(SWEEP_INTERVAL_SECONDS)).await;
        sweep_due_reminders(&state).await;
    }
}
