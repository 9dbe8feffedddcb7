//! Keyword/regex classifiers behind named entry points, so the conversation
//! flow never embeds matching rules directly. All matching is done on the
//! lowercased text; accented and unaccented spellings are listed where
//! customers actually type both.

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferenceChoice {
    Agent,
    Human,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrdinalRef {
    First,
    Second,
    Third,
    All,
    None,
}

fn contains_any(text: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| text.contains(p))
}

/// "Código do imóvel: <digits>" anywhere in the message, accents optional.
pub fn extract_property_code(text: &str) -> Option<String> {
    let re = Regex::new(r"(?i)c[oó]digo do im[oó]vel:\s*(\d+)").ok()?;
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Did the assistant just ask the human-vs-automated preference question?
pub fn preference_question(ai_reply: &str) -> bool {
    let text = ai_reply.to_lowercase();
    contains_any(
        &text,
        &[
            "prefere ser atendido por um consultor",
            "quer que eu mesma",
            "consultor humano ou",
        ],
    )
}

/// Which side the customer picked. Any human-side keyword wins over the
/// agent-side phrases; qualification only completes on `Agent`.
pub fn preference_choice(user_message: &str) -> PreferenceChoice {
    let text = user_message.to_lowercase();
    let wants_human = contains_any(
        &text,
        &["consultor", "corretor", "humano", "atendente", "pessoa de verdade"],
    );
    if wants_human {
        return PreferenceChoice::Human;
    }
    let wants_agent = contains_any(
        &text,
        &[
            "pode me ajudar",
            "com você",
            "com voce",
            "você mesma",
            "voce mesma",
            "pode continuar",
            "prefiro você",
            "prefiro voce",
        ],
    );
    if wants_agent {
        PreferenceChoice::Agent
    } else {
        PreferenceChoice::None
    }
}

/// Explicit photo or detail request in the customer's own words.
pub fn photo_request(user_message: &str) -> bool {
    let text = user_message.to_lowercase();
    contains_any(
        &text,
        &[
            "foto",
            "imagem",
            "imagens",
            "me manda",
            "me mande",
            "me mostra",
            "me mostre",
            "quero ver",
            "posso ver",
            "mais detalhes",
            "mais informa",
        ],
    )
}

/// Short affirmatives only count as a photo request when the previous
/// assistant message implied an offer; the caller checks that separately
/// with [`offered_details`].
pub fn short_affirmative(user_message: &str) -> bool {
    let text = user_message.trim().to_lowercase();
    matches!(
        text.as_str(),
        "sim" | "quero" | "ok" | "pode ser" | "claro" | "quero sim" | "sim, quero" | "pode"
    )
}

/// Did the assistant's last message offer to send photos or details?
pub fn offered_details(assistant_text: &str) -> bool {
    let text = assistant_text.to_lowercase();
    contains_any(
        &text,
        &[
            "foto",
            "enviar os detalhes",
            "enviar detalhes",
            "mandar os detalhes",
            "te mostro",
            "quer ver",
            "posso te enviar",
            "posso enviar",
        ],
    )
}

/// Scheduling keywords, checked against both the customer message and the
/// assistant reply.
pub fn scheduling_intent(text: &str) -> bool {
    let text = text.to_lowercase();
    contains_any(
        &text,
        &["agendar", "agendamento", "visita", "visitar", "marcar"],
    )
}

/// Ordinal reference to a previously listed property. Token match so that a
/// bare "1" counts but digits inside a phone number or price do not.
pub fn ordinal_reference(user_message: &str) -> OrdinalRef {
    let text = user_message.to_lowercase();
    if contains_any(
        &text,
        &["ambas", "ambos", "todas", "todos", "as duas", "os dois"],
    ) {
        return OrdinalRef::All;
    }
    let tokens: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    for token in &tokens {
        match *token {
            "primeiro" | "primeira" | "1" => return OrdinalRef::First,
            "segundo" | "segunda" | "2" => return OrdinalRef::Second,
            "terceiro" | "terceira" | "3" => return OrdinalRef::Third,
            _ => {}
        }
    }
    OrdinalRef::None
}

/// Does an assistant message look like a property listing? Price marker,
/// bedroom count, a house emoji, or an unusually long body all qualify.
pub fn looks_like_listing(assistant_text: &str) -> bool {
    let text = assistant_text.to_lowercase();
    text.contains("r$")
        || text.contains("quartos")
        || assistant_text.contains('\u{1F3E0}')
        || assistant_text.contains('\u{1F3E1}')
        || assistant_text.chars().count() > 400
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_code_is_extracted_with_or_without_accents() {
        assert_eq!(
            extract_property_code("Olá! Código do imóvel: 42").as_deref(),
            Some("42")
        );
        assert_eq!(
            extract_property_code("codigo do imovel: 7, pode me falar?").as_deref(),
            Some("7")
        );
        assert_eq!(extract_property_code("quero uma casa"), None);
    }

    #[test]
    fn preference_question_matches_the_scripted_phrasings() {
        assert!(preference_question(
            "Você prefere ser atendido por um consultor humano ou quer que eu mesma te ajude?"
        ));
        assert!(!preference_question("Essa casa tem 3 quartos."));
    }

    #[test]
    fn human_keywords_win_over_agent_phrases() {
        assert_eq!(
            preference_choice("pode me ajudar você mesma"),
            PreferenceChoice::Agent
        );
        assert_eq!(
            preference_choice("prefiro falar com um consultor, mas você pode me ajudar"),
            PreferenceChoice::Human
        );
        assert_eq!(preference_choice("quanto custa?"), PreferenceChoice::None);
    }

    #[test]
    fn explicit_photo_request_is_detected() {
        assert!(photo_request("me manda foto"));
        assert!(photo_request("Quero ver o apartamento"));
        assert!(!photo_request("qual o endereço?"));
    }

    #[test]
    fn bare_affirmative_is_not_a_photo_request_by_itself() {
        assert!(!photo_request("sim"));
        assert!(short_affirmative("sim"));
        assert!(short_affirmative(" Quero "));
        assert!(!short_affirmative("sim, mas só amanhã"));
    }

    #[test]
    fn offered_details_matches_assistant_offers() {
        assert!(offered_details("Posso te enviar as fotos da casa?"));
        assert!(!offered_details("Fica no bairro Centro."));
    }

    #[test]
    fn scheduling_keywords_match_in_either_direction() {
        assert!(scheduling_intent("queria agendar uma visita"));
        assert!(scheduling_intent("Podemos marcar um horário para você conhecer o imóvel"));
        assert!(!scheduling_intent("qual o valor do condomínio?"));
    }

    #[test]
    fn ordinals_match_as_whole_tokens_only() {
        assert_eq!(ordinal_reference("o primeiro"), OrdinalRef::First);
        assert_eq!(ordinal_reference("2"), OrdinalRef::Second);
        assert_eq!(ordinal_reference("gostei de ambas"), OrdinalRef::All);
        assert_eq!(ordinal_reference("meu telefone é 51999"), OrdinalRef::None);
        assert_eq!(ordinal_reference("R$ 120.000"), OrdinalRef::None);
    }

    #[test]
    fn listing_shape_detection() {
        assert!(looks_like_listing("Casa no Centro por R$ 450.000"));
        assert!(looks_like_listing("Tem 3 quartos e 2 banheiros"));
        assert!(looks_like_listing("🏠 Casa Jardim"));
        assert!(!looks_like_listing("Bom dia!"));
        assert!(looks_like_listing(&"detalhes ".repeat(60)));
    }
}
