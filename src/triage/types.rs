//! Decision model shared by the decision service, policy engine and store.
//!
//! Field names on `TriageDecision` and `DecisionResponse` are the JSON
//! contract with the decision-service prompt; keep them stable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::triage::slots::CalendarSlot;

/// Highest valid confidence score.
pub const MAX_CONFIDENCE: u8 = 10;

// ── Key point ───────────────────────────────────────────────────────

/// Recommended action category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum KeyPoint {
    Schedule,
    Respond,
    UpdateDatabase,
    Archive,
    Review,
}

impl KeyPoint {
    /// Wire value used by the decision service.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Schedule => "Schedule",
            Self::Respond => "Respond",
            Self::UpdateDatabase => "Update_Database",
            Self::Archive => "Archive",
            Self::Review => "Review",
        }
    }

    /// Lenient parse. Anything unrecognised is `Review`.
    pub fn parse(raw: &str) -> Self {
        let normalized: String = raw
            .trim()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "schedule" => Self::Schedule,
            "respond" => Self::Respond,
            "updatedatabase" => Self::UpdateDatabase,
            "archive" => Self::Archive,
            _ => Self::Review,
        }
    }
}

impl From<String> for KeyPoint {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<KeyPoint> for String {
    fn from(kp: KeyPoint) -> Self {
        kp.as_str().to_string()
    }
}

impl std::fmt::Display for KeyPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Round and clamp a raw score into `0..=10`. Non-finite values become 0.
pub fn clamp_confidence(raw: f64) -> u8 {
    if !raw.is_finite() {
        return 0;
    }
    raw.round().clamp(0.0, f64::from(MAX_CONFIDENCE)) as u8
}

// ── Direction ───────────────────────────────────────────────────────

/// Whether an email was sent by us or to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    /// CRM next-step text for an activity logged from this email.
    pub fn next_step(&self, contact_name: &str, subject: &str) -> String {
        match self {
            Self::Inbound => format!("Reply to {contact_name} about \"{subject}\""),
            Self::Outbound => format!("Follow up with {contact_name} on \"{subject}\""),
        }
    }
}

// ── Context ─────────────────────────────────────────────────────────

/// The CRM contact an email was resolved to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactContext {
    pub contact_id: String,
    pub name: String,
    pub email: String,
    pub company_id: Option<String>,
    pub direction: Direction,
    pub last_chat: Option<DateTime<Utc>>,
}

/// Calendar availability attached to scheduling emails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarContext {
    pub summary: String,
    #[serde(default)]
    pub slots: Vec<CalendarSlot>,
    #[serde(default)]
    pub structured_slots: Vec<CalendarSlot>,
    pub upcoming_events: usize,
}

/// Database entries the decision service thinks are worth adding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSuggestions {
    #[serde(default)]
    pub has_business_relevance: bool,
    #[serde(default)]
    pub suggested_entries: Vec<serde_json::Value>,
}

/// User feedback on a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rating", rename_all = "snake_case")]
pub enum Feedback {
    Good,
    Bad { text: String },
}

// ── Drafts ──────────────────────────────────────────────────────────

/// Which suggested draft was used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftVariant {
    Pushy,
    Exploratory,
    Standard,
}

/// Auto-creation preference order.
pub const DRAFT_PREFERENCE: [DraftVariant; 3] = [
    DraftVariant::Pushy,
    DraftVariant::Exploratory,
    DraftVariant::Standard,
];

// ── Decision service output ─────────────────────────────────────────

/// Validated output of the decision service, before it is keyed to an email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionResponse {
    pub key_point: KeyPoint,
    pub confidence: u8,
    pub action_reason: String,
    #[serde(default)]
    pub suggested_draft: Option<String>,
    #[serde(default)]
    pub suggested_draft_pushy: Option<String>,
    #[serde(default)]
    pub suggested_draft_exploratory: Option<String>,
    #[serde(default)]
    pub alternative_options: Vec<String>,
    #[serde(default)]
    pub uncertainty_factors: Vec<String>,
    #[serde(default)]
    pub database_suggestions: DatabaseSuggestions,
}

// ── Persisted decision ──────────────────────────────────────────────

/// The persisted triage decision. One per email id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageDecision {
    pub email_id: String,
    pub key_point: KeyPoint,
    pub confidence: u8,
    pub action_reason: String,
    #[serde(default)]
    pub suggested_draft: Option<String>,
    #[serde(default)]
    pub suggested_draft_pushy: Option<String>,
    #[serde(default)]
    pub suggested_draft_exploratory: Option<String>,
    #[serde(default)]
    pub alternative_options: Vec<String>,
    #[serde(default)]
    pub uncertainty_factors: Vec<String>,
    #[serde(default)]
    pub database_suggestions: DatabaseSuggestions,
    #[serde(default)]
    pub contact_context: Option<ContactContext>,
    #[serde(default)]
    pub calendar_context: Option<CalendarContext>,
    #[serde(rename = "autoArchived", default)]
    pub auto_archived: bool,
    #[serde(rename = "draftCreated", default)]
    pub draft_created: bool,
    #[serde(default)]
    pub feedback: Option<Feedback>,
}

impl TriageDecision {
    /// Key a decision-service response to an email with its enrichment.
    pub fn from_response(
        email_id: impl Into<String>,
        response: DecisionResponse,
        contact_context: Option<ContactContext>,
        calendar_context: Option<CalendarContext>,
    ) -> Self {
        Self {
            email_id: email_id.into(),
            key_point: response.key_point,
            confidence: response.confidence.min(MAX_CONFIDENCE),
            action_reason: response.action_reason,
            suggested_draft: non_empty(response.suggested_draft),
            suggested_draft_pushy: non_empty(response.suggested_draft_pushy),
            suggested_draft_exploratory: non_empty(response.suggested_draft_exploratory),
            alternative_options: response.alternative_options,
            uncertainty_factors: response.uncertainty_factors,
            database_suggestions: response.database_suggestions,
            contact_context,
            calendar_context,
            auto_archived: false,
            draft_created: false,
            feedback: None,
        }
    }

    /// Carry forward what a re-triage must never lose: automation flags
    /// stay true once set, and existing feedback is kept.
    pub fn inherit_from(&mut self, prior: &TriageDecision) {
        self.auto_archived |= prior.auto_archived;
        self.draft_created |= prior.draft_created;
        if self.feedback.is_none() {
            self.feedback = prior.feedback.clone();
        }
    }

    /// Non-empty draft text for a variant.
    pub fn draft(&self, variant: DraftVariant) -> Option<&str> {
        let text = match variant {
            DraftVariant::Pushy => self.suggested_draft_pushy.as_deref(),
            DraftVariant::Exploratory => self.suggested_draft_exploratory.as_deref(),
            DraftVariant::Standard => self.suggested_draft.as_deref(),
        };
        text.filter(|t| !t.trim().is_empty())
    }

    /// The draft auto-creation would pick (pushy > exploratory > standard).
    pub fn preferred_draft(&self) -> Option<(DraftVariant, &str)> {
        DRAFT_PREFERENCE
            .iter()
            .find_map(|v| self.draft(*v).map(|text| (*v, text)))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}
