use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use crate::baserow::BaserowClient;
use crate::broadcast::{self, prepare_recipients, run_broadcast};
use crate::config::AppConfig;
use crate::evolution::EvolutionClient;
use crate::kv::KvStore;
use crate::scheduling;
use crate::sdr;
use crate::types::{
    AppState, BroadcastBody, ConversationContext, ScheduleVisitBody, ScheduledReminder,
    SendMessageBody, TestAiBody,
};

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Message text out of an Evolution `messages.upsert` data record: plain
/// conversation, extended text, or a media caption.
fn inbound_text(data: &Value) -> Option<String> {
    let message = data.get("message")?;
    let text = message
        .get("conversation")
        .and_then(Value::as_str)
        .or_else(|| {
            message
                .get("extendedTextMessage")
                .and_then(|m| m.get("text"))
                .and_then(Value::as_str)
        })
        .or_else(|| {
            message
                .get("imageMessage")
                .and_then(|m| m.get("caption"))
                .and_then(Value::as_str)
        })?;
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

fn phone_from_remote_jid(jid: &str) -> Option<String> {
    if jid.contains("@g.us") {
        return None;
    }
    let user = jid.split('@').next().unwrap_or("");
    broadcast::normalize_phone(user)
}

/// Inbound WhatsApp events. Only `messages.upsert` not originated by the bot
/// account is processed; the response is always 200 so the transport never
/// retries into a loop.
async fn webhook_whatsapp(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    let event = payload.get("event").and_then(Value::as_str).unwrap_or("");
    if event != "messages.upsert" {
        return Json(json!({ "received": true }));
    }
    let data = payload.get("data").cloned().unwrap_or_else(|| json!({}));
    let from_me = data
        .get("key")
        .and_then(|k| k.get("fromMe"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if from_me {
        return Json(json!({ "received": true }));
    }
    let remote_jid = data
        .get("key")
        .and_then(|k| k.get("remoteJid"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let Some(phone) = phone_from_remote_jid(remote_jid) else {
        return Json(json!({ "received": true }));
    };
    let Some(text) = inbound_text(&data) else {
        return Json(json!({ "received": true }));
    };
    let push_name = data
        .get("pushName")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let state = state.clone();
    tokio::spawn(async move {
        let outcome = sdr::handle_inbound_message(&state, &phone, &push_name, &text).await;

        if !outcome.reply.is_empty() {
            if let Some(transport) = &state.transport {
                if let Err(err) = transport.send_text(&phone, &outcome.reply).await {
                    tracing::error!(%phone, %err, "reply failed to send");
                }
            }
        }
        if outcome.human_handoff && !state.config.realtor_phone.is_empty() {
            if let Some(transport) = &state.transport {
                let notice = format!(
                    "Cliente {} ({phone}) pediu atendimento humano. Última mensagem: \"{text}\"",
                    if push_name.is_empty() { "sem nome" } else { push_name.as_str() },
                );
                if let Err(err) = transport
                    .send_text(&state.config.realtor_phone, &notice)
                    .await
                {
                    tracing::warn!(%err, "handoff notification failed to send");
                }
            }
        }
        if outcome.scheduling_intent {
            if let Err(err) = scheduling::send_scheduling_link(&state, &phone, &push_name, None).await {
                tracing::warn!(%phone, %err, "scheduling link unavailable");
            }
        }
    });

    Json(json!({ "received": true }))
}

/// Calendly events. Errors are absorbed and logged; the response is always
/// 200 for the same retry-avoidance reason as the WhatsApp webhook.
async fn webhook_calendly(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let event = body.get("event").and_then(Value::as_str).unwrap_or("");
    let payload = body.get("payload").cloned().unwrap_or_else(|| json!({}));
    let state = state.clone();
    match event {
        "invitee.created" => {
            tokio::spawn(async move {
                scheduling::handle_invitee_created(&state, &payload).await;
            });
        }
        "invitee.canceled" => {
            tokio::spawn(async move {
                scheduling::handle_invitee_canceled(&state, &payload).await;
            });
        }
        _ => {}
    }
    Json(json!({ "received": true }))
}

/// Site form submissions from Typebot. The stored lead shapes the greeting
/// of the customer's first WhatsApp message.
async fn webhook_typebot(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    match sdr::ingest_typebot_lead(&state, &body).await {
        Some(phone) => Json(json!({ "received": true, "phone": phone })).into_response(),
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "phone inválido" })),
        )
            .into_response(),
    }
}

/// Starts a broadcast. With `Accept: text/event-stream` the progress events
/// stream as SSE JSON lines; otherwise the whole run is buffered into a
/// single JSON summary.
async fn post_broadcast(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<BroadcastBody>,
) -> axum::response::Response {
    if body.message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "message é obrigatório" })),
        )
            .into_response();
    }
    if body.recipients.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "recipients é obrigatório" })),
        )
            .into_response();
    }
    let Some(transport) = state.transport.clone() else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "EVOLUTION_API_URL, EVOLUTION_API_KEY e EVOLUTION_INSTANCE não configurados"
            })),
        )
            .into_response();
    };
    let (recipients, invalid) = prepare_recipients(&body.recipients);
    if recipients.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "nenhum destinatário com número válido", "invalid": invalid })),
        )
            .into_response();
    }

    let wants_stream = headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false);

    let message = body.message.clone();
    if wants_stream {
        let (tx, rx) = mpsc::unbounded_channel();
        broadcast::spawn_broadcast(transport, message, recipients, invalid, tx);
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            let event = rx.recv().await?;
            let data = serde_json::to_string(&event).unwrap_or_default();
            Some((Ok::<_, Infallible>(Event::default().data(data)), rx))
        });
        return Sse::new(stream).keep_alive(KeepAlive::default()).into_response();
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let summary = run_broadcast(&transport, &message, recipients, invalid, &tx).await;
    while rx.try_recv().is_ok() {}
    Json(summary).into_response()
}

async fn get_conversations(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut conversations = Vec::new();
    for key in state.kv.keys_with_prefix("conversation:").await {
        let Some(ctx) = state.kv.get_json::<ConversationContext>(&key).await else {
            continue;
        };
        let phone = key.trim_start_matches("conversation:").to_string();
        let last_message = ctx.history.last().map(|turn| turn.content.clone());
        conversations.push(json!({
            "phoneNumber": phone,
            "messageCount": ctx.history.len(),
            "propertyId": ctx.property_id,
            "qualification": ctx.qualification,
            "schedulingInProgress": ctx.scheduling_in_progress,
            "lastMessage": last_message,
            "createdAt": ctx.created_at,
        }));
    }
    Json(json!({ "conversations": conversations }))
}

async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path(phone_number): Path<String>,
) -> impl IntoResponse {
    let Some(phone) = broadcast::normalize_phone(&phone_number) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "número inválido" })),
        )
            .into_response();
    };
    match state
        .kv
        .get_json::<ConversationContext>(&sdr::conversation_key(&phone))
        .await
    {
        Some(ctx) => Json(json!({ "phoneNumber": phone, "context": ctx })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "conversa não encontrada" })),
        )
            .into_response(),
    }
}

async fn get_sdr_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let conversation_keys = state.kv.keys_with_prefix("conversation:").await;
    let mut qualified_agent = 0usize;
    let mut qualified_human = 0usize;
    let mut awaiting_preference = 0usize;
    for key in &conversation_keys {
        if let Some(ctx) = state.kv.get_json::<ConversationContext>(key).await {
            use crate::types::QualificationState::*;
            match ctx.qualification {
                QualifiedAgent => qualified_agent += 1,
                QualifiedHuman => qualified_human += 1,
                AwaitingPreference => awaiting_preference += 1,
                Init => {}
            }
        }
    }
    let customers = state.kv.keys_with_prefix("customer:").await.len();
    let reminders = state.kv.keys_with_prefix("reminder:").await.len();
    let typebot_leads = state.kv.keys_with_prefix("typebot:lead:").await.len();
    Json(json!({
        "activeConversations": conversation_keys.len(),
        "totalCustomers": customers,
        "qualifiedAgent": qualified_agent,
        "qualifiedHuman": qualified_human,
        "awaitingPreference": awaiting_preference,
        "pendingReminders": reminders,
        "typebotLeads": typebot_leads,
    }))
}

async fn get_reminders(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut reminders = Vec::new();
    for key in state.kv.keys_with_prefix("reminder:").await {
        if let Some(reminder) = state.kv.get_json::<ScheduledReminder>(&key).await {
            reminders.push(reminder);
        }
    }
    Json(json!({ "reminders": reminders }))
}

async fn post_schedule_visit(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ScheduleVisitBody>,
) -> impl IntoResponse {
    let Some(phone) = broadcast::normalize_phone(&body.phone) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "phone inválido" })),
        )
            .into_response();
    };
    let property_id = body.property_id.as_deref();
    match scheduling::send_scheduling_link(&state, &phone, &body.name, property_id).await {
        Ok(link) => Json(json!({ "schedulingLink": link, "phone": phone })).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err })),
        )
            .into_response(),
    }
}

async fn post_send_message(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendMessageBody>,
) -> impl IntoResponse {
    if body.text.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "text é obrigatório" })),
        )
            .into_response();
    }
    let Some(phone) = broadcast::normalize_phone(&body.number) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "number inválido" })),
        )
            .into_response();
    };
    let Some(transport) = &state.transport else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "transporte WhatsApp não configurado" })),
        )
            .into_response();
    };
    match transport.send_text(&phone, &body.text).await {
        Ok(result) => Json(json!({ "sent": true, "result": result })).into_response(),
        Err(err) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "sent": false, "error": err })),
        )
            .into_response(),
    }
}

async fn post_test_ai(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TestAiBody>,
) -> impl IntoResponse {
    if body.message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "message é obrigatório" })),
        )
            .into_response();
    }
    match sdr::test_ai_reply(&state, body.phone.as_deref(), &body.message).await {
        Ok(reply) => Json(json!({ "reply": reply })).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err })),
        )
            .into_response(),
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook/whatsapp", post(webhook_whatsapp))
        .route("/webhook/calendly", post(webhook_calendly))
        .route("/webhook/typebot", post(webhook_typebot))
        .route("/api/whatsapp/broadcast", post(post_broadcast))
        .route("/api/conversations", get(get_conversations))
        .route("/api/conversations/{phone_number}", get(get_conversation))
        .route("/api/sdr-stats", get(get_sdr_stats))
        .route("/api/reminders", get(get_reminders))
        .route("/api/schedule-visit", post(post_schedule_visit))
        .route("/api/send-message", post(post_send_message))
        .route("/api/test-ai", post(post_test_ai))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env();
    let http = reqwest::Client::new();
    let kv = KvStore::new(http.clone(), &config);
    let transport = EvolutionClient::from_config(http.clone(), &config);
    let baserow = BaserowClient::from_config(http.clone(), &config);
    if transport.is_none() {
        tracing::warn!("evolution transport not configured, outbound sends disabled");
    }
    if baserow.is_none() {
        tracing::warn!("baserow not configured, lead upserts and catalog disabled");
    }

    let port = config.port;
    let state = Arc::new(AppState {
        config,
        http,
        kv,
        transport,
        baserow,
    });

    tokio::spawn(scheduling::run_reminder_sweep(state.clone()));

    let app = router(state);
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    tracing::info!(%addr, "sdr server listening");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}
