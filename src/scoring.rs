use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::types::{
    AppState, ConversationContext, CustomerHistory, LeadQuality, LeadScore, LeadSource,
    TypebotLead,
};

pub struct ScoreInput<'a> {
    pub context: Option<&'a ConversationContext>,
    pub history: Option<&'a CustomerHistory>,
    pub typebot: Option<&'a TypebotLead>,
    pub name: &'a str,
    pub email: &'a str,
}

fn parsed(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Additive score, recomputed from scratch on every evaluation. No bucket
/// multiplies another; the quality tier is a pure function of the total.
pub fn compute_lead_score(input: &ScoreInput<'_>) -> LeadScore {
    let mut score = 0u32;
    let mut indicators = Vec::new();

    let total_messages = input.history.map(|h| h.total_messages).unwrap_or(0);
    let engagement = if total_messages >= 20 {
        30
    } else if total_messages >= 10 {
        20
    } else if total_messages >= 3 {
        10
    } else {
        0
    };
    if engagement > 0 {
        score += engagement;
        indicators.push(format!("engajamento: {total_messages} mensagens"));
    }

    if input
        .context
        .map(|ctx| ctx.property_id.is_some())
        .unwrap_or(false)
    {
        score += 25;
        indicators.push("interesse em imóvel específico".to_string());
    }

    if let Some(ctx) = input.context {
        if ctx.qualification.completed() {
            score += 20;
            indicators.push("qualificação concluída".to_string());
        } else if ctx.qualification.asked_about_preference() {
            score += 10;
            indicators.push("preferência de atendimento perguntada".to_string());
        }
    }

    let has_name = !input.name.trim().is_empty();
    let has_email = !input.email.trim().is_empty();
    if has_name && has_email {
        score += 15;
        indicators.push("contato completo (nome e email)".to_string());
    } else if has_name || has_email {
        score += 12;
        indicators.push("contato parcial".to_string());
    }

    let from_typebot = input.typebot.is_some()
        || input
            .history
            .map(|h| h.source == LeadSource::Typebot)
            .unwrap_or(false);
    if from_typebot {
        score += 10;
        indicators.push("origem typebot".to_string());
    }

    // Recency only counts for returning contacts; a first-ever message
    // scores zero here by definition.
    if let Some(history) = input.history.filter(|h| h.total_messages > 1) {
        if let Some(last) = parsed(&history.last_contact) {
            let age = Utc::now() - last;
            if age.num_hours() <= 24 {
                score += 10;
                indicators.push("ativo nas últimas 24h".to_string());
            } else if age.num_days() <= 7 {
                score += 5;
                indicators.push("ativo na última semana".to_string());
            }
        }
    }

    let score = score.min(100);
    LeadScore {
        score,
        quality: LeadQuality::from_score(score),
        indicators,
    }
}

fn typebot_text(lead: Option<&TypebotLead>, keys: &[&str]) -> String {
    let Some(lead) = lead else {
        return String::new();
    };
    for key in keys {
        if let Some(value) = lead.lead_info.get(key).and_then(Value::as_str) {
            if !value.trim().is_empty() {
                return value.trim().to_string();
            }
        }
    }
    String::new()
}

/// Evaluate and push one lead row. Name/email come from the typebot answers
/// when present, otherwise from the WhatsApp push name; the Baserow upsert
/// keeps previously filled cells.
pub async fn score_and_upsert_lead(
    state: &AppState,
    phone: &str,
    push_name: &str,
    context: &ConversationContext,
    history: Option<&CustomerHistory>,
    typebot: Option<&TypebotLead>,
) -> Option<LeadScore> {
    let name = {
        let from_typebot = typebot_text(typebot, &["nome", "name"]);
        if from_typebot.is_empty() {
            push_name.trim().to_string()
        } else {
            from_typebot
        }
    };
    let email = typebot_text(typebot, &["email", "e-mail"]);

    let result = compute_lead_score(&ScoreInput {
        context: Some(context),
        history,
        typebot,
        name: &name,
        email: &email,
    });

    let Some(baserow) = &state.baserow else {
        tracing::debug!(phone, "baserow not configured, skipping lead upsert");
        return Some(result);
    };

    let source = history
        .map(|h| h.source)
        .unwrap_or(if typebot.is_some() {
            LeadSource::Typebot
        } else {
            LeadSource::Direct
        });
    let mut fields = json!({
        "Score": result.score,
        "Qualidade": result.quality.as_str(),
        "Total de Mensagens": history.map(|h| h.total_messages).unwrap_or(0),
        "Origem": source.as_str(),
        "Tags": format!("{},{}", result.quality.as_str(), source.as_str()),
        "Observações": result.indicators.join("; "),
    });
    if !name.is_empty() {
        fields["Nome"] = json!(name);
    }
    if !email.is_empty() {
        fields["Email"] = json!(email);
    }
    if let Some(property_id) = &context.property_id {
        fields["Imóvel de Interesse"] = json!(property_id);
    }
    if let Some(lead) = typebot {
        if !lead.lead_info.is_null() {
            fields["Preferências"] = json!(lead.lead_info.to_string());
        }
    }

    if let Err(err) = baserow.upsert_lead(phone, fields).await {
        tracing::error!(phone, %err, "lead upsert failed");
    }
    Some(result)
}
