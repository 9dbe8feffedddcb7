use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::baserow::format_properties_for_prompt;
use crate::intent::{self, OrdinalRef, PreferenceChoice};
use crate::openai;
use crate::prompting::{render_system_prompt, SystemPromptContext};
use crate::scoring;
use crate::types::{
    AppState, ChatTurn, ConversationContext, CustomerHistory, CustomerState, LeadSource, Property,
    QualificationState, SdrOutcome, TypebotLead,
};

pub const CONVERSATION_TTL_SECONDS: u64 = 6 * 3600;
pub const TYPEBOT_UNPROCESSED_TTL_SECONDS: u64 = 30 * 86_400;
pub const TYPEBOT_PROCESSED_TTL_SECONDS: u64 = 90 * 86_400;
pub const HISTORY_WINDOW: usize = 20;
const MAX_PROPERTY_PHOTOS: usize = 3;
const IMAGE_DELAY_MS: u64 = 1500;
const PROPERTY_CTA: &str =
    "Gostou? Posso agendar uma visita para você conhecer pessoalmente. É só me dizer o melhor dia e horário! 😊";

pub fn customer_key(phone: &str) -> String {
    format!("customer:{phone}")
}

pub fn conversation_key(phone: &str) -> String {
    format!("conversation:{phone}")
}

pub fn typebot_key(phone: &str) -> String {
    format!("typebot:lead:{phone}")
}

/// Stores a site-form lead so the first WhatsApp message from this number is
/// greeted with its answers. Returns the normalized phone when the payload
/// carries a usable one.
pub async fn ingest_typebot_lead(state: &AppState, payload: &Value) -> Option<String> {
    let raw = ["phone", "telefone", "whatsapp"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))?;
    let phone = crate::broadcast::normalize_phone(raw)?;
    let lead = TypebotLead {
        lead_info: payload.clone(),
        processed: false,
        created_at: Utc::now().to_rfc3339(),
    };
    state
        .kv
        .set_json(
            &typebot_key(&phone),
            &lead,
            Some(TYPEBOT_UNPROCESSED_TTL_SECONDS),
        )
        .await;
    Some(phone)
}

fn parsed(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Recomputed every turn, never stored. An unprocessed typebot lead outranks
/// the returning/new classification.
pub fn classify_customer_state(
    previous: Option<&CustomerHistory>,
    typebot: Option<&TypebotLead>,
) -> CustomerState {
    if typebot.is_some_and(|lead| !lead.processed) {
        return CustomerState::TypebotLead;
    }
    let Some(previous) = previous else {
        return CustomerState::New;
    };
    let Some(last) = parsed(&previous.last_contact) else {
        return CustomerState::ReturningLater;
    };
    let age = Utc::now() - last;
    if age.num_hours() < 24 {
        CustomerState::ReturningSameDay
    } else if age.num_days() < 7 {
        CustomerState::ReturningWithinWeek
    } else {
        CustomerState::ReturningLater
    }
}

fn customer_note(state: CustomerState, push_name: &str) -> String {
    let name = push_name.trim();
    let greeting = if name.is_empty() {
        String::new()
    } else {
        format!(" O nome dele no WhatsApp é {name}.")
    };
    match state {
        CustomerState::New => format!("Primeiro contato deste cliente.{greeting}"),
        CustomerState::ReturningSameDay => format!(
            "O cliente já conversou com você hoje; continue de onde parou, sem se apresentar de novo.{greeting}"
        ),
        CustomerState::ReturningWithinWeek => format!(
            "O cliente conversou com você nos últimos dias; retome o assunto com naturalidade.{greeting}"
        ),
        CustomerState::ReturningLater => format!(
            "Faz mais de uma semana desde a última conversa; dê boas-vindas de volta.{greeting}"
        ),
        CustomerState::TypebotLead => format!(
            "O cliente preencheu o formulário do site e este é o primeiro atendimento; use os dados informados.{greeting}"
        ),
    }
}

fn typebot_block(typebot: Option<&TypebotLead>) -> String {
    let Some(lead) = typebot.filter(|lead| !lead.processed) else {
        return String::new();
    };
    match &lead.lead_info {
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| match value {
                Value::String(s) => format!("{key}: {s}"),
                other => format!("{key}: {other}"),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::String(s) => s.clone(),
        _ => String::new(),
    }
}

fn fallback_reply(state: &AppState) -> String {
    let mut reply = String::from(
        "Desculpe, estou com uma instabilidade técnica neste momento. 😔",
    );
    if !state.config.realtor_phone.is_empty() {
        reply.push_str(&format!(
            " Você pode falar direto com um dos nossos consultores pelo WhatsApp {}.",
            state.config.realtor_phone
        ));
    } else if !state.config.site_base_url.is_empty() {
        reply.push_str(&format!(
            " Você pode falar com um consultor pelo site {}/contato.",
            state.config.site_base_url
        ));
    }
    reply
}

/// Append one user/assistant exchange, keeping only the most recent
/// `HISTORY_WINDOW` entries (oldest dropped first).
pub fn push_exchange(ctx: &mut ConversationContext, user: &str, assistant: &str) {
    ctx.history.push(ChatTurn::new("user", user));
    ctx.history.push(ChatTurn::new("assistant", assistant));
    if ctx.history.len() > HISTORY_WINDOW {
        let excess = ctx.history.len() - HISTORY_WINDOW;
        ctx.history.drain(..excess);
    }
}

fn last_assistant_text(history: &[ChatTurn]) -> Option<&str> {
    history
        .iter()
        .rev()
        .find(|turn| turn.role == "assistant")
        .map(|turn| turn.content.as_str())
}

/// The auto-send gate of the detail sequence: either the customer completed
/// qualification choosing the automated agent, or the message itself is an
/// explicit photo/info request. A short affirmative only counts when the
/// previous assistant turn offered details.
pub fn auto_send_allowed(ctx: &ConversationContext, user_text: &str, has_properties: bool) -> bool {
    if !has_properties {
        return false;
    }
    if ctx.qualification == QualificationState::QualifiedAgent {
        return true;
    }
    if intent::photo_request(user_text) {
        return true;
    }
    intent::short_affirmative(user_text)
        && last_assistant_text(&ctx.history)
            .map(intent::offered_details)
            .unwrap_or(false)
}

/// Properties mentioned by title in an assistant message, in order of first
/// appearance. Used for ordinal references ("o primeiro", "2", "ambas").
fn properties_mentioned_in<'a>(text: &str, properties: &'a [Property]) -> Vec<&'a Property> {
    let lowered = text.to_lowercase();
    let mut mentioned: Vec<(usize, &Property)> = properties
        .iter()
        .filter(|property| !property.title.is_empty())
        .filter_map(|property| {
            lowered
                .find(&property.title.to_lowercase())
                .map(|pos| (pos, property))
        })
        .collect();
    mentioned.sort_by_key(|(pos, _)| *pos);
    mentioned.into_iter().map(|(_, property)| property).collect()
}

/// Best-effort disambiguation chain, in contract order:
/// (a) type+neighborhood combination in the message or the reply,
/// (b) ordinal against the latest listing-shaped assistant message,
/// (c) the context property, (d) the landing property,
/// (e) weak single-keyword title match. Empty result means no auto-send.
pub fn resolve_properties<'a>(
    ctx: &ConversationContext,
    user_text: &str,
    ai_reply: &str,
    properties: &'a [Property],
) -> Vec<&'a Property> {
    let user_lower = user_text.to_lowercase();
    let reply_lower = ai_reply.to_lowercase();

    // (a) explicit type + neighborhood combination
    for property in properties {
        let ptype = property.property_type.to_lowercase();
        let neighborhood = property.neighborhood.to_lowercase();
        if ptype.is_empty() || neighborhood.is_empty() {
            continue;
        }
        let in_user = user_lower.contains(&ptype) && user_lower.contains(&neighborhood);
        let in_reply = reply_lower.contains(&ptype) && reply_lower.contains(&neighborhood);
        if in_user || in_reply {
            return vec![property];
        }
    }

    // (b) ordinal reference against the latest listing-shaped assistant text
    let ordinal = intent::ordinal_reference(user_text);
    if ordinal != OrdinalRef::None {
        let listing_text = ctx
            .history
            .iter()
            .rev()
            .filter(|turn| turn.role == "assistant")
            .map(|turn| turn.content.as_str())
            .find(|text| intent::looks_like_listing(text))
            .or_else(|| intent::looks_like_listing(ai_reply).then_some(ai_reply));
        if let Some(listing_text) = listing_text {
            let mentioned = properties_mentioned_in(listing_text, properties);
            match ordinal {
                OrdinalRef::First => {
                    if let Some(first) = mentioned.first().copied() {
                        return vec![first];
                    }
                }
                OrdinalRef::Second => {
                    if let Some(second) = mentioned.get(1).copied() {
                        return vec![second];
                    }
                }
                OrdinalRef::Third => {
                    if let Some(third) = mentioned.get(2).copied() {
                        return vec![third];
                    }
                }
                OrdinalRef::All => {
                    if !mentioned.is_empty() {
                        return mentioned;
                    }
                }
                OrdinalRef::None => {}
            }
        }
    }

    // (c) property already in context, (d) landing property
    for id in [&ctx.property_id, &ctx.landing_property_id] {
        if let Some(id) = id {
            if let Some(found) = properties.iter().find(|p| &p.id == id) {
                return vec![found];
            }
        }
    }

    // (e) weak single-keyword title match, last resort
    for property in properties {
        let matched = property
            .title
            .to_lowercase()
            .split_whitespace()
            .any(|word| word.chars().count() > 3 && user_lower.contains(word));
        if matched {
            return vec![property];
        }
    }

    Vec::new()
}

fn absolute_url(site_base_url: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else if site_base_url.is_empty() {
        url.to_string()
    } else {
        format!("{}/{}", site_base_url, url.trim_start_matches('/'))
    }
}

pub fn format_property_details(property: &Property, site_base_url: &str) -> String {
    let mut details = format!("🏠 *{}*\n", property.title);
    if !property.price.is_empty() {
        details.push_str(&format!("💰 {}\n", property.price));
    }
    let mut location = property.neighborhood.clone();
    if !property.city.is_empty() {
        if !location.is_empty() {
            location.push_str(" - ");
        }
        location.push_str(&property.city);
    }
    if !location.is_empty() {
        details.push_str(&format!("📍 {location}\n"));
    }
    if !property.bedrooms.is_empty() || !property.bathrooms.is_empty() {
        details.push_str(&format!(
            "🛏 {} quartos | 🚿 {} banheiros\n",
            property.bedrooms, property.bathrooms
        ));
    }
    if !property.area.is_empty() {
        details.push_str(&format!("📐 {}\n", property.area));
    }
    if !property.description.is_empty() {
        details.push_str(&format!("\n{}\n", property.description));
    }
    if !site_base_url.is_empty() && !property.id.is_empty() {
        details.push_str(&format!("\n{site_base_url}/imovel/{}", property.id));
    }
    details
}

/// Detail sequence for one property: text block, up to three photos with an
/// inter-image delay, then the fixed call to action.
async fn send_property_details(state: &AppState, phone: &str, property: &Property) {
    let Some(transport) = &state.transport else {
        return;
    };
    let details = format_property_details(property, &state.config.site_base_url);
    if let Err(err) = transport.send_text(phone, &details).await {
        tracing::error!(phone, %err, "property detail text failed to send");
        return;
    }
    for photo in property.photos.iter().take(MAX_PROPERTY_PHOTOS) {
        tokio::time::sleep(Duration::from_millis(IMAGE_DELAY_MS)).await;
        let url = absolute_url(&state.config.site_base_url, photo);
        if let Err(err) = transport.send_image(phone, &url, &property.title).await {
            tracing::warn!(phone, %err, "property photo failed to send");
        }
    }
    if let Err(err) = transport.send_text(phone, PROPERTY_CTA).await {
        tracing::warn!(phone, %err, "property call-to-action failed to send");
    }
}

fn build_system_prompt(
    state: &AppState,
    customer_state: CustomerState,
    push_name: &str,
    typebot: Option<&TypebotLead>,
    properties: &[Property],
) -> String {
    render_system_prompt(&SystemPromptContext {
        customer_state: customer_state.label(),
        customer_note: &customer_note(customer_state, push_name),
        typebot_block: &typebot_block(typebot),
        properties_block: &format_properties_for_prompt(properties),
        site_base_url: &state.config.site_base_url,
    })
}

async fn active_properties(state: &AppState) -> Vec<Property> {
    let Some(baserow) = &state.baserow else {
        return Vec::new();
    };
    match baserow.list_active_properties().await {
        Ok(properties) => properties,
        Err(err) => {
            tracing::error!(%err, "property catalog fetch failed");
            Vec::new()
        }
    }
}

/// One inbound WhatsApp message, end to end: state classification, history
/// bookkeeping, LLM reply, qualification transitions, lead scoring and the
/// auto-send/scheduling decisions. Storage trouble degrades, it never aborts
/// the turn.
pub async fn handle_inbound_message(
    state: &AppState,
    phone: &str,
    push_name: &str,
    text: &str,
) -> SdrOutcome {
    let now = Utc::now().to_rfc3339();

    // 1. explicit property reference in the message body
    let turn_property = intent::extract_property_code(text);

    // 2. typebot lead, if the customer came through the site form
    let mut typebot: Option<TypebotLead> = state.kv.get_json(&typebot_key(phone)).await;

    // 3. customer history upsert; the pre-update record drives classification
    let previous: Option<CustomerHistory> = state.kv.get_json(&customer_key(phone)).await;
    let customer_state = classify_customer_state(previous.as_ref(), typebot.as_ref());
    let history = match previous.clone() {
        Some(mut h) => {
            h.last_contact = now.clone();
            h.total_messages += 1;
            h
        }
        None => CustomerHistory {
            first_contact: now.clone(),
            last_contact: now.clone(),
            total_messages: 1,
            source: if typebot.is_some() {
                LeadSource::Typebot
            } else {
                LeadSource::Direct
            },
        },
    };
    state.kv.set_json(&customer_key(phone), &history, None).await;

    // 4. conversation context
    let mut ctx: ConversationContext = state
        .kv
        .get_json(&conversation_key(phone))
        .await
        .unwrap_or_else(|| ConversationContext {
            history: Vec::new(),
            property_id: None,
            landing_property_id: None,
            qualification: QualificationState::Init,
            scheduling_in_progress: false,
            scheduling_data: None,
            created_at: now.clone(),
        });
    let first_turn = ctx.history.is_empty();
    if let Some(code) = &turn_property {
        if first_turn && ctx.landing_property_id.is_none() {
            ctx.landing_property_id = Some(code.clone());
        }
        ctx.property_id = Some(code.clone());
    }
    if first_turn && ctx.property_id.is_some() {
        ctx.history.push(ChatTurn::new(
            "system",
            format!(
                "O cliente chegou pelo site já interessado no imóvel de código {}. \
                 Mesmo assim, pergunte primeiro se ele prefere um consultor humano ou o \
                 atendimento automático antes de apresentar qualquer detalhe do imóvel.",
                ctx.property_id.as_deref().unwrap_or_default()
            ),
        ));
    }

    // 5. active catalog
    let properties = active_properties(state).await;

    // 6. LLM reply on top of the rolling window
    let system_prompt =
        build_system_prompt(state, customer_state, push_name, typebot.as_ref(), &properties);
    let ai_reply = match openai::chat_completion_text(state, &system_prompt, &ctx.history, text).await
    {
        Ok(reply) => reply,
        Err(err) => {
            tracing::error!(phone, %err, "llm call failed, using fallback reply");
            fallback_reply(state)
        }
    };

    // 7. qualification transitions, heuristics only (user choice answers the
    //    previous turn's question, so it is evaluated first)
    let mut human_handoff = false;
    if ctx.qualification == QualificationState::AwaitingPreference {
        match intent::preference_choice(text) {
            PreferenceChoice::Agent => ctx.qualification = QualificationState::QualifiedAgent,
            PreferenceChoice::Human => {
                ctx.qualification = QualificationState::QualifiedHuman;
                human_handoff = true;
            }
            PreferenceChoice::None => {}
        }
    }
    if ctx.qualification == QualificationState::Init && intent::preference_question(&ai_reply) {
        ctx.qualification = QualificationState::AwaitingPreference;
    }

    // 12/13 use the pre-exchange window (the offer that "sim" answers lives
    // in the previous assistant turn), so evaluate the gate before appending.
    let allow_auto_send = auto_send_allowed(&ctx, text, !properties.is_empty());
    let resolved = if allow_auto_send {
        resolve_properties(&ctx, text, &ai_reply, &properties)
            .into_iter()
            .cloned()
            .collect::<Vec<Property>>()
    } else {
        Vec::new()
    };

    // 14. scheduling intent from either side of the exchange
    let scheduling_intent =
        intent::scheduling_intent(text) || intent::scheduling_intent(&ai_reply);
    if scheduling_intent && !ctx.scheduling_in_progress {
        ctx.scheduling_in_progress = true;
        ctx.scheduling_data = Some(serde_json::json!({
            "propertyId": ctx.property_id,
            "detectedAt": now,
        }));
    }

    // 8/9. window bookkeeping and persistence
    push_exchange(&mut ctx, text, &ai_reply);
    state
        .kv
        .set_json(&conversation_key(phone), &ctx, Some(CONVERSATION_TTL_SECONDS))
        .await;

    // 10. first SDR interaction consumes the typebot lead
    if let Some(lead) = typebot.as_mut() {
        if !lead.processed {
            lead.processed = true;
            state
                .kv
                .set_json(&typebot_key(phone), lead, Some(TYPEBOT_PROCESSED_TTL_SECONDS))
                .await;
        }
    }

    // 11. lead scoring, every turn
    scoring::score_and_upsert_lead(
        state,
        phone,
        push_name,
        &ctx,
        Some(&history),
        typebot.as_ref(),
    )
    .await;

    // 12/13. detail sequence replaces the free-text reply when it fires
    if !resolved.is_empty() {
        for property in &resolved {
            send_property_details(state, phone, property).await;
        }
        return SdrOutcome {
            reply: String::new(),
            property_sent: true,
            scheduling_intent,
            human_handoff,
        };
    }

    SdrOutcome {
        reply: ai_reply,
        property_sent: false,
        scheduling_intent,
        human_handoff,
    }
}

/// Prompt + completion only, no persistence. Backs `POST /api/test-ai`.
pub async fn test_ai_reply(
    state: &AppState,
    phone: Option<&str>,
    message: &str,
) -> Result<String, String> {
    let typebot: Option<TypebotLead> = match phone {
        Some(phone) => state.kv.get_json(&typebot_key(phone)).await,
        None => None,
    };
    let previous: Option<CustomerHistory> = match phone {
        Some(phone) => state.kv.get_json(&customer_key(phone)).await,
        None => None,
    };
    let customer_state = classify_customer_state(previous.as_ref(), typebot.as_ref());
    let properties = active_properties(state).await;
    let system_prompt = build_system_prompt(state, customer_state, "", typebot.as_ref(), &properties);
    openai::chat_completion_text(state, &system_prompt, &[], message).await
}
