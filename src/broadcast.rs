use std::collections::HashSet;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::evolution::EvolutionClient;
use crate::types::{BroadcastEvent, BroadcastRecipient, BroadcastSummary, RecipientResult};

pub const MESSAGE_DELAY_MS: u64 = 3000;
pub const BATCH_SIZE: usize = 20;
pub const BATCH_PAUSE_MS: u64 = 60_000;
pub const MAX_CONSECUTIVE_FAILURES: usize = 5;
pub const LARGE_BROADCAST_THRESHOLD: usize = 50;
pub const STOP_REASON: &str = "Envio interrompido após falhas consecutivas";

/// Brazilian mobile numbers only: digits, country prefix 55, 12-13 digits.
/// Already-normalized input round-trips unchanged.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.starts_with("55") && (12..=13).contains(&digits.len()) {
        return Some(digits);
    }
    if digits.len() == 11 {
        return Some(format!("55{digits}"));
    }
    if digits.len() > 13 && digits.starts_with("55") {
        return Some(digits[..13].to_string());
    }
    if digits.len() >= 12 {
        return Some(digits);
    }
    None
}

fn first_name(name: &str) -> &str {
    name.split_whitespace().next().unwrap_or("")
}

/// `{{nome}}`/`{{name}}` → full name, `{{primeiroNome}}`/`{{firstName}}` →
/// first token; both fall back to "cliente". Placeholders are matched
/// case-insensitively and tolerate surrounding whitespace.
pub fn apply_template(template: &str, name: &str) -> String {
    let name = name.trim();
    let full = if name.is_empty() { "cliente" } else { name };
    let first = {
        let token = first_name(name);
        if token.is_empty() {
            "cliente"
        } else {
            token
        }
    };

    let mut out = template.to_string();
    if let Ok(re) = Regex::new(r"(?i)\{\{\s*(primeironome|firstname)\s*\}\}") {
        out = re.replace_all(&out, first).into_owned();
    }
    if let Ok(re) = Regex::new(r"(?i)\{\{\s*(nome|name)\s*\}\}") {
        out = re.replace_all(&out, full).into_owned();
    }
    out
}

/// Raw admin-supplied records → validated, deduplicated recipients. Invalid
/// numbers are discarded and counted; the first occurrence of a normalized
/// number wins.
pub fn prepare_recipients(raw: &[Value]) -> (Vec<BroadcastRecipient>, usize) {
    let mut seen = HashSet::new();
    let mut recipients = Vec::new();
    let mut invalid = 0usize;
    for record in raw {
        let phone_raw = ["phone", "telefone", "number", "numero", "whatsapp"]
            .iter()
            .find_map(|key| record.get(key).and_then(Value::as_str))
            .unwrap_or("");
        let Some(phone) = normalize_phone(phone_raw) else {
            invalid += 1;
            continue;
        };
        if !seen.insert(phone.clone()) {
            continue;
        }
        let name = ["name", "nome"]
            .iter()
            .find_map(|key| record.get(key).and_then(Value::as_str))
            .unwrap_or("")
            .trim()
            .to_string();
        recipients.push(BroadcastRecipient { phone, name });
    }
    (recipients, invalid)
}

/// Anything the engine can push a personalized message through.
pub trait BroadcastSender: Sync {
    fn send(
        &self,
        phone: &str,
        text: &str,
    ) -> impl std::future::Future<Output = Result<(), String>> + Send;
}

impl BroadcastSender for EvolutionClient {
    async fn send(&self, phone: &str, text: &str) -> Result<(), String> {
        self.send_text(phone, text).await.map(|_| ())
    }
}

/// Paced batch sender. One attempt per recipient, no retries; a failure only
/// affects later recipients through the consecutive-failure counter. Every
/// attempt emits a progress event; the 60s batch pause replaces the 3s
/// per-message delay after every 20th send when recipients remain.
pub async fn run_broadcast<S: BroadcastSender>(
    sender: &S,
    message: &str,
    recipients: Vec<BroadcastRecipient>,
    invalid: usize,
    events: &UnboundedSender<BroadcastEvent>,
) -> BroadcastSummary {
    let job_id = Uuid::new_v4().to_string();
    let total = recipients.len();
    let warning = (total > LARGE_BROADCAST_THRESHOLD).then(|| {
        format!(
            "{total} destinatários: o envio completo levará vários minutos com a cadência atual"
        )
    });
    let _ = events.send(BroadcastEvent::Start {
        job_id: job_id.clone(),
        total,
        invalid,
        warning,
    });
    tracing::info!(%job_id, total, invalid, "broadcast started");

    let mut sent = 0usize;
    let mut failed = 0usize;
    let mut consecutive_failures = 0usize;
    let mut results: Vec<RecipientResult> = Vec::with_capacity(total);

    for (i, recipient) in recipients.iter().enumerate() {
        let index = i + 1;
        let text = apply_template(message, &recipient.name);
        let outcome = sender.send(&recipient.phone, &text).await;
        let (success, error) = match outcome {
            Ok(()) => {
                sent += 1;
                consecutive_failures = 0;
                (true, None)
            }
            Err(err) => {
                failed += 1;
                consecutive_failures += 1;
                tracing::warn!(phone = %recipient.phone, %err, "broadcast send failed");
                (false, Some(err))
            }
        };
        results.push(RecipientResult {
            phone: recipient.phone.clone(),
            name: recipient.name.clone(),
            success,
            error: error.clone(),
        });
        let _ = events.send(BroadcastEvent::Progress {
            sent,
            failed,
            index,
            total,
            phone: recipient.phone.clone(),
            name: recipient.name.clone(),
            success,
            error,
        });

        if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            for remaining in recipients.iter().skip(index) {
                failed += 1;
                results.push(RecipientResult {
                    phone: remaining.phone.clone(),
                    name: remaining.name.clone(),
                    success: false,
                    error: Some(STOP_REASON.to_string()),
                });
            }
            let _ = events.send(BroadcastEvent::Stopped {
                sent,
                failed,
                total,
                reason: STOP_REASON.to_string(),
                results: results.clone(),
            });
            tracing::warn!(%job_id, sent, failed, "broadcast stopped by circuit breaker");
            return BroadcastSummary {
                job_id,
                sent,
                failed,
                total,
                stopped: true,
                results,
            };
        }

        if index < total {
            if index % BATCH_SIZE == 0 {
                let _ = events.send(BroadcastEvent::BatchPause {
                    sent,
                    failed,
                    index,
                    total,
                    pause_ms: BATCH_PAUSE_MS,
                });
                tokio::time::sleep(Duration::from_millis(BATCH_PAUSE_MS)).await;
            } else {
                tokio::time::sleep(Duration::from_millis(MESSAGE_DELAY_MS)).await;
            }
        }
    }

    let _ = events.send(BroadcastEvent::Complete {
        sent,
        failed,
        total,
        results: results.clone(),
    });
    tracing::info!(%job_id, sent, failed, "broadcast complete");
    BroadcastSummary {
        job_id,
        sent,
        failed,
        total,
        stopped: false,
        results,
    }
}

/// Runs the job on a background task for the streaming mode. A panic inside
/// the job surfaces as a terminal `error` event instead of a silently closed
/// stream.
pub fn spawn_broadcast<S>(
    sender: S,
    message: String,
    recipients: Vec<BroadcastRecipient>,
    invalid: usize,
    events: UnboundedSender<BroadcastEvent>,
) where
    S: BroadcastSender + Send + 'static,
{
    let job_events = events.clone();
    let job = tokio::spawn(async move {
        run_broadcast(&sender, &message, recipients, invalid, &job_events).await;
    });
    tokio::spawn(async move {
        if let Err(err) = job.await {
            tracing::error!(%err, "broadcast job aborted");
            let _ = events.send(BroadcastEvent::Error {
                message: format!("envio interrompido por falha interna: {err}"),
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    #[test]
    fn normalization_covers_the_contractual_cases() {
        // Idempotence on an already-normalized 13-digit number.
        assert_eq!(
            normalize_phone("5511988887777").as_deref(),
            Some("5511988887777")
        );
        // 11 digits gains the country prefix.
        assert_eq!(
            normalize_phone("11988887777").as_deref(),
            Some("5511988887777")
        );
        // 15 digits starting with 55 truncates to 13.
        assert_eq!(
            normalize_phone("551198888777799").as_deref(),
            Some("5511988887777")
        );
        // Formatting characters are stripped first.
        assert_eq!(
            normalize_phone("+55 (11) 98888-7777").as_deref(),
            Some("5511988887777")
        );
        // Too short is invalid.
        assert_eq!(normalize_phone("988887777"), None);
        // 12 digits without the prefix is accepted as-is.
        assert_eq!(
            normalize_phone("441198888777").as_deref(),
            Some("441198888777")
        );
    }

    #[test]
    fn dedupe_keeps_the_first_occurrence_per_normalized_number() {
        let (recipients, invalid) = prepare_recipients(&[
            json!({ "phone": "11988887777", "name": "Maria" }),
            json!({ "phone": "+55 11 98888-7777", "name": "Maria Duplicada" }),
            json!({ "phone": "123", "name": "Inválido" }),
        ]);
        assert_eq!(invalid, 1);
        assert_eq!(recipients.len(), 1);
        assert_eq!(recipients[0].phone, "5511988887777");
        assert_eq!(recipients[0].name, "Maria");
    }

    #[test]
    fn template_substitution_with_fallback_chain() {
        assert_eq!(
            apply_template("Olá {{nome}}!", "Maria Silva"),
            "Olá Maria Silva!"
        );
        assert_eq!(
            apply_template("Oi {{primeiroNome}}", "Maria Silva"),
            "Oi Maria"
        );
        assert_eq!(apply_template("Olá {{ NOME }}!", ""), "Olá cliente!");
        assert_eq!(apply_template("Oi {{firstName}}", ""), "Oi cliente");
        assert_eq!(
            apply_template("{{nome}} / {{primeiroNome}}", "Ana Paula Souza"),
            "Ana Paula Souza / Ana"
        );
    }

    struct ScriptedSender {
        outcomes: Mutex<Vec<Result<(), String>>>,
        sends: Mutex<Vec<(Instant, String)>>,
    }

    impl ScriptedSender {
        fn new(outcomes: Vec<Result<(), String>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                sends: Mutex::new(Vec::new()),
            }
        }

        fn always_ok(count: usize) -> Self {
            Self::new(vec![Ok(()); count])
        }

        fn send_instants(&self) -> Vec<Instant> {
            self.sends.lock().unwrap().iter().map(|(t, _)| *t).collect()
        }
    }

    impl BroadcastSender for ScriptedSender {
        async fn send(&self, phone: &str, _text: &str) -> Result<(), String> {
            self.sends
                .lock()
                .unwrap()
                .push((Instant::now(), phone.to_string()));
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                Ok(())
            } else {
                outcomes.remove(0)
            }
        }
    }

    fn recipients(n: usize) -> Vec<BroadcastRecipient> {
        (0..n)
            .map(|i| BroadcastRecipient {
                phone: format!("55119888800{i:02}"),
                name: format!("Cliente {i}"),
            })
            .collect()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<BroadcastEvent>) -> Vec<BroadcastEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn twenty_first_send_waits_the_batch_pause_not_the_message_delay() {
        let sender = ScriptedSender::always_ok(21);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let summary = run_broadcast(&sender, "Oi {{nome}}", recipients(21), 0, &tx).await;
        assert_eq!(summary.sent, 21);
        assert!(!summary.stopped);

        let instants = sender.send_instants();
        for pair in instants[..20].windows(2) {
            assert_eq!((pair[1] - pair[0]).as_millis(), MESSAGE_DELAY_MS as u128);
        }
        assert_eq!(
            (instants[20] - instants[19]).as_millis(),
            BATCH_PAUSE_MS as u128
        );

        let events = drain(&mut rx);
        let pauses = events
            .iter()
            .filter(|e| matches!(e, BroadcastEvent::BatchPause { .. }))
            .count();
        assert_eq!(pauses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn nineteen_recipients_never_hit_a_batch_pause() {
        let sender = ScriptedSender::always_ok(19);
        let (tx, mut rx) = mpsc::unbounded_channel();
        run_broadcast(&sender, "Oi", recipients(19), 0, &tx).await;

        let instants = sender.send_instants();
        for pair in instants.windows(2) {
            assert_eq!((pair[1] - pair[0]).as_millis(), MESSAGE_DELAY_MS as u128);
        }
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .all(|e| !matches!(e, BroadcastEvent::BatchPause { .. })));
        assert!(matches!(events.last(), Some(BroadcastEvent::Complete { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn five_consecutive_failures_stop_the_job_and_fail_the_rest() {
        // Sends 3-7 fail; 8+ would succeed but must never be attempted.
        let mut outcomes = vec![Ok(()), Ok(())];
        outcomes.extend((0..5).map(|i| Err(format!("timeout {i}"))));
        outcomes.extend(vec![Ok(()); 3]);
        let sender = ScriptedSender::new(outcomes);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let summary = run_broadcast(&sender, "Oi", recipients(10), 0, &tx).await;

        assert!(summary.stopped);
        assert_eq!(summary.sent, 2);
        assert_eq!(summary.failed, 8);
        assert_eq!(sender.send_instants().len(), 7);
        // Recipients 8..10 carry the fixed stop reason, not a send error.
        for result in &summary.results[7..] {
            assert!(!result.success);
            assert_eq!(result.error.as_deref(), Some(STOP_REASON));
        }
        // The attempted failures keep their verbatim transport error.
        assert_eq!(summary.results[2].error.as_deref(), Some("timeout 0"));

        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(BroadcastEvent::Stopped { .. })));
        assert!(events
            .iter()
            .all(|e| !matches!(e, BroadcastEvent::Complete { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn a_success_resets_the_consecutive_failure_counter() {
        let outcomes = vec![
            Err("e1".to_string()),
            Err("e2".to_string()),
            Err("e3".to_string()),
            Err("e4".to_string()),
            Ok(()),
            Err("e5".to_string()),
            Ok(()),
        ];
        let sender = ScriptedSender::new(outcomes);
        let (tx, _rx) = mpsc::unbounded_channel();
        let summary = run_broadcast(&sender, "Oi", recipients(7), 0, &tx).await;
        assert!(!summary.stopped);
        assert_eq!(summary.sent, 2);
        assert_eq!(summary.failed, 5);
    }

    struct PanickingSender;

    impl BroadcastSender for PanickingSender {
        async fn send(&self, _phone: &str, _text: &str) -> Result<(), String> {
            panic!("transport gone");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_job_ends_the_stream_with_an_error_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_broadcast(PanickingSender, "Oi".to_string(), recipients(2), 0, tx);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert!(matches!(events.last(), Some(BroadcastEvent::Error { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_recipient_list_attaches_a_warning_to_start() {
        let sender = ScriptedSender::always_ok(51);
        let (tx, mut rx) = mpsc::unbounded_channel();
        run_broadcast(&sender, "Oi", recipients(51), 0, &tx).await;
        let events = drain(&mut rx);
        match &events[0] {
            BroadcastEvent::Start { warning, total, .. } => {
                assert_eq!(*total, 51);
                assert!(warning.is_some());
            }
            other => panic!("expected start event, got {other:?}"),
        }
    }
}
