use serde_json::{json, Value};

use crate::types::{AppState, ChatTurn};

/// Plain text chat completion: system prompt + rolling window + new message.
/// Callers translate any `Err` into the fixed fallback reply, never into a
/// customer-visible error.
pub async fn chat_completion_text(
    state: &AppState,
    system: &str,
    history: &[ChatTurn],
    user: &str,
) -> Result<String, String> {
    let api_key = state.config.openai_api_key.trim();
    if api_key.is_empty() {
        return Err("OPENAI_API_KEY not configured".to_string());
    }

    let mut messages = vec![json!({ "role": "system", "content": system })];
    for turn in history {
        messages.push(json!({ "role": turn.role, "content": turn.content }));
    }
    messages.push(json!({ "role": "user", "content": user }));

    let response = state
        .http
        .post("https://api.openai.com/v1/chat/completions")
        .bearer_auth(api_key)
        .json(&json!({
            "model": state.config.openai_chat_model,
            "messages": messages,
            "temperature": 0.7,
            "max_tokens": 500
        }))
        .send()
        .await
        .map_err(|err| format!("openai request failed: {err}"))?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(format!("openai returned {status}: {body}"));
    }
    let payload = response
        .json::<Value>()
        .await
        .map_err(|err| format!("openai parse failed: {err}"))?;
    let text = payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"))
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("")
        .to_string();
    if text.is_empty() {
        return Err("openai response had empty content".to_string());
    }
    Ok(text)
}
