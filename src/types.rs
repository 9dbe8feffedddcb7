use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::baserow::BaserowClient;
use crate::config::AppConfig;
use crate::evolution::EvolutionClient;
use crate::kv::KvStore;

pub struct AppState {
    pub config: AppConfig,
    pub http: reqwest::Client,
    pub kv: KvStore,
    pub transport: Option<EvolutionClient>,
    pub baserow: Option<BaserowClient>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// Closed qualification state. `QualifiedAgent`/`QualifiedHuman` are only
/// reachable from `AwaitingPreference`, so "completed implies asked" holds
/// by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QualificationState {
    #[default]
    Init,
    AwaitingPreference,
    QualifiedAgent,
    QualifiedHuman,
}

impl QualificationState {
    pub fn asked_about_preference(self) -> bool {
        self != QualificationState::Init
    }

    /// True only when the customer explicitly chose to continue with the
    /// automated agent. Choosing the human consultant leaves the
    /// qualification at the asked tier.
    pub fn completed(self) -> bool {
        self == QualificationState::QualifiedAgent
    }
}

/// Per-phone conversation state, JSON under `conversation:<phone>`, 6h TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationContext {
    #[serde(default)]
    pub history: Vec<ChatTurn>,
    #[serde(default)]
    pub property_id: Option<String>,
    /// The property the customer originally arrived on; never overridden by
    /// later references, only used as a disambiguation fallback.
    #[serde(default)]
    pub landing_property_id: Option<String>,
    #[serde(default)]
    pub qualification: QualificationState,
    #[serde(default)]
    pub scheduling_in_progress: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling_data: Option<Value>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LeadSource {
    Direct,
    Typebot,
}

impl LeadSource {
    pub fn as_str(self) -> &'static str {
        match self {
            LeadSource::Direct => "direct",
            LeadSource::Typebot => "typebot",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerHistory {
    pub first_contact: String,
    pub last_contact: String,
    pub total_messages: u64,
    pub source: LeadSource,
}

/// Prefilled form answers from Typebot, JSON under `typebot:lead:<phone>`.
/// TTL 30 days while unprocessed, re-stored with 90 days once processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypebotLead {
    #[serde(default)]
    pub lead_info: Value,
    #[serde(default)]
    pub processed: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomerState {
    New,
    ReturningSameDay,
    ReturningWithinWeek,
    ReturningLater,
    TypebotLead,
}

impl CustomerState {
    pub fn label(self) -> &'static str {
        match self {
            CustomerState::New => "NEW",
            CustomerState::ReturningSameDay => "RETURNING_SAME_DAY",
            CustomerState::ReturningWithinWeek => "RETURNING_WITHIN_WEEK",
            CustomerState::ReturningLater => "RETURNING_LATER",
            CustomerState::TypebotLead => "TYPEBOT_LEAD",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    pub id: String,
    pub title: String,
    pub price: String,
    pub property_type: String,
    pub category: String,
    pub location: String,
    pub city: String,
    pub neighborhood: String,
    pub bedrooms: String,
    pub bathrooms: String,
    pub area: String,
    pub description: String,
    pub photos: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LeadQuality {
    Hot,
    Warm,
    Cold,
}

impl LeadQuality {
    pub fn as_str(self) -> &'static str {
        match self {
            LeadQuality::Hot => "hot",
            LeadQuality::Warm => "warm",
            LeadQuality::Cold => "cold",
        }
    }

    pub fn from_score(score: u32) -> Self {
        if score >= 80 {
            LeadQuality::Hot
        } else if score >= 50 {
            LeadQuality::Warm
        } else {
            LeadQuality::Cold
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadScore {
    pub score: u32,
    pub quality: LeadQuality,
    pub indicators: Vec<String>,
}

/// Reminder record, JSON under `reminder:<eventUri>`, 48h TTL. Fired by the
/// periodic sweep and deleted on fire or on cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledReminder {
    pub event_uri: String,
    pub phone: String,
    #[serde(default)]
    pub invitee_name: String,
    #[serde(default)]
    pub property_title: Option<String>,
    pub visit_start: String,
    pub fire_at: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastRecipient {
    pub phone: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecipientResult {
    pub phone: String,
    pub name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One line of the broadcast progress stream; serialized as the SSE payload
/// `{"type": "start" | "progress" | "batch_pause" | "stopped" | "complete" | "error", ...}`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastEvent {
    Start {
        job_id: String,
        total: usize,
        invalid: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },
    Progress {
        sent: usize,
        failed: usize,
        index: usize,
        total: usize,
        phone: String,
        name: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    BatchPause {
        sent: usize,
        failed: usize,
        index: usize,
        total: usize,
        pause_ms: u64,
    },
    Stopped {
        sent: usize,
        failed: usize,
        total: usize,
        reason: String,
        results: Vec<RecipientResult>,
    },
    Complete {
        sent: usize,
        failed: usize,
        total: usize,
        results: Vec<RecipientResult>,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastSummary {
    pub job_id: String,
    pub sent: usize,
    pub failed: usize,
    pub total: usize,
    pub stopped: bool,
    pub results: Vec<RecipientResult>,
}

/// What the conversation engine decided for one inbound message. The outer
/// webhook handler performs the transport calls for `reply` and the
/// scheduling/handoff follow-ups; property detail sequences are already sent
/// by the engine itself when `property_sent` is true.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SdrOutcome {
    pub reply: String,
    pub property_sent: bool,
    pub scheduling_intent: bool,
    pub human_handoff: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastBody {
    pub message: String,
    #[serde(default)]
    pub recipients: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub number: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestAiBody {
    pub message: String,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleVisitBody {
    pub phone: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub property_id: Option<String>,
}
