//! Decision service: email + enrichment in, structured recommendation out.
//!
//! The JSON field names and `key_point` values below are shared with the
//! prompt and must not change.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::TriageError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::mail::Email;
use crate::triage::enrichment::EnrichedContext;
use crate::triage::types::{
    DatabaseSuggestions, DecisionResponse, Direction, KeyPoint, clamp_confidence,
};

/// Max tokens for the decision call. Three drafts need room.
const DECISION_MAX_TOKENS: u32 = 2048;

const DECISION_TEMPERATURE: f32 = 0.2;

#[async_trait]
pub trait DecisionService: Send + Sync {
    async fn decide(
        &self,
        email: &Email,
        context: &EnrichedContext,
    ) -> Result<DecisionResponse, TriageError>;
}

/// `DecisionService` backed by an LLM provider.
pub struct LlmDecisionService {
    llm: Arc<dyn LlmProvider>,
}

impl LlmDecisionService {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl DecisionService for LlmDecisionService {
    async fn decide(
        &self,
        email: &Email,
        context: &EnrichedContext,
    ) -> Result<DecisionResponse, TriageError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(build_prompt(email, context)),
        ])
        .with_max_tokens(DECISION_MAX_TOKENS)
        .with_temperature(DECISION_TEMPERATURE);

        let response = self.llm.complete(request).await?;
        debug!(
            email_id = %email.id,
            model = self.llm.model_name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "Decision response received"
        );

        let decision = parse_decision_response(&response.content)?;
        info!(
            email_id = %email.id,
            key_point = %decision.key_point,
            confidence = decision.confidence,
            "Email triaged"
        );
        Ok(decision)
    }
}

const SYSTEM_PROMPT: &str = r#"You triage a salesperson's email. Decide the single most useful next action and how sure you are.

Respond with ONE JSON object and nothing else:
{
  "key_point": "Schedule" | "Respond" | "Update_Database" | "Archive" | "Review",
  "confidence": integer 0-10,
  "action_reason": "one sentence",
  "suggested_draft": "reply text or null",
  "suggested_draft_pushy": "direct, action-oriented reply or null",
  "suggested_draft_exploratory": "softer, question-led reply or null",
  "alternative_options": ["other reasonable actions"],
  "uncertainty_factors": ["what would change your mind"],
  "database_suggestions": {
    "has_business_relevance": true | false,
    "suggested_entries": [{"type": "contact" | "company" | "deal", "details": "..."}]
  }
}

Rules:
- Archive only newsletters, notifications and messages that need nothing from us.
- Schedule when a meeting time must be agreed; use the proposed windows if given.
- Update_Database when the email carries CRM-worthy facts (new contact, deal stage, company change).
- Review when unsure. Confidence 9-10 means you would act without asking.
- Drafts are plain text, no subject line, signed with first name only."#;

/// User prompt: the email plus whatever enrichment found.
pub fn build_prompt(email: &Email, context: &EnrichedContext) -> String {
    let mut prompt = String::new();

    let direction = match context.direction {
        Direction::Inbound => "inbound (sent to us)",
        Direction::Outbound => "outbound (sent by us)",
    };
    prompt.push_str(&format!("Direction: {direction}\n"));
    prompt.push_str(&format!("From: {}\n", email.from));
    if !email.to.is_empty() {
        prompt.push_str(&format!("To: {}\n", email.to.join(", ")));
    }
    prompt.push_str(&format!("Subject: {}\n", email.subject));
    prompt.push_str(&format!("Received: {}\n", email.date.to_rfc3339()));
    prompt.push_str(&format!("\nBody:\n{}\n", email.body));

    match &context.contact_context {
        Some(contact) => {
            prompt.push_str(&format!(
                "\nKnown contact: {} <{}>",
                contact.name, contact.email
            ));
            if let Some(last) = contact.last_chat {
                prompt.push_str(&format!(", last correspondence {}", last.format("%Y-%m-%d")));
            }
            prompt.push('\n');
        }
        None => prompt.push_str("\nKnown contact: none\n"),
    }

    if let Some(calendar) = &context.calendar_context {
        prompt.push_str(&format!("\nCalendar: {}\n", calendar.summary));
        for slot in &calendar.structured_slots {
            prompt.push_str(&format!("- {}\n", slot.label));
        }
    }

    if let Some(research) = &context.company_research {
        prompt.push_str(&format!("\nCompany background: {research}\n"));
    }

    prompt
}

/// Raw service output before validation.
#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(default)]
    key_point: Option<String>,
    #[serde(default)]
    confidence: Option<serde_json::Value>,
    #[serde(default)]
    action_reason: Option<String>,
    #[serde(default)]
    suggested_draft: Option<String>,
    #[serde(default)]
    suggested_draft_pushy: Option<String>,
    #[serde(default)]
    suggested_draft_exploratory: Option<String>,
    #[serde(default)]
    alternative_options: Vec<serde_json::Value>,
    #[serde(default)]
    uncertainty_factors: Vec<serde_json::Value>,
    #[serde(default)]
    database_suggestions: Option<DatabaseSuggestions>,
}

/// Parse and validate a decision. `confidence` is required; everything
/// else has a safe default.
pub fn parse_decision_response(raw: &str) -> Result<DecisionResponse, TriageError> {
    let json_str = extract_json_object(raw);
    let parsed: RawDecision = serde_json::from_str(&json_str)
        .map_err(|e| TriageError::Decision(format!("JSON parse error: {e}")))?;

    let confidence = parsed
        .confidence
        .as_ref()
        .and_then(confidence_value)
        .ok_or_else(|| TriageError::Decision("missing or non-numeric confidence".into()))?;

    Ok(DecisionResponse {
        key_point: parsed
            .key_point
            .as_deref()
            .map(KeyPoint::parse)
            .unwrap_or(KeyPoint::Review),
        confidence: clamp_confidence(confidence),
        action_reason: parsed.action_reason.unwrap_or_default(),
        suggested_draft: parsed.suggested_draft,
        suggested_draft_pushy: parsed.suggested_draft_pushy,
        suggested_draft_exploratory: parsed.suggested_draft_exploratory,
        alternative_options: strings(parsed.alternative_options),
        uncertainty_factors: strings(parsed.uncertainty_factors),
        database_suggestions: parsed.database_suggestions.unwrap_or_default(),
    })
}

fn confidence_value(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn strings(values: Vec<serde_json::Value>) -> Vec<String> {
    values
        .into_iter()
        .filter_map(|v| match v {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        })
        .collect()
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
pub fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
