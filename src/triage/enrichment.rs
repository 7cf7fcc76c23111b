//! Context enrichment: who an email is with, when we are free, and what the
//! sender's company does.
//!
//! Every sub-step degrades independently. A failed lookup leaves its part of
//! the context empty and adds an event; it never fails the email.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::TriageConfig;
use crate::crm::Contact;
use crate::error::EnrichmentError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::mail::{Email, MailTransport};
use crate::store::Database;
use crate::triage::slots::SlotGenerator;
use crate::triage::state::TriageEvent;
use crate::triage::types::{CalendarContext, ContactContext, Direction};

/// Consumer mail providers. Senders on these domains are not researched.
pub const CONSUMER_DOMAINS: &[&str] = &[
    "gmail.com",
    "googlemail.com",
    "yahoo.com",
    "hotmail.com",
    "outlook.com",
    "live.com",
    "msn.com",
    "icloud.com",
    "me.com",
    "aol.com",
    "protonmail.com",
    "proton.me",
    "gmx.com",
];

/// Words that make an email a scheduling email.
pub const SCHEDULING_KEYWORDS: &[&str] = &["meeting", "schedule", "calendar"];

/// Looks up background on a company by mail domain.
#[async_trait]
pub trait CompanyResearcher: Send + Sync {
    async fn research(&self, domain: &str) -> Result<String, EnrichmentError>;
}

const RESEARCH_MAX_TOKENS: u32 = 300;

/// Company brief from the configured LLM.
pub struct LlmCompanyResearcher {
    llm: Arc<dyn LlmProvider>,
}

impl LlmCompanyResearcher {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl CompanyResearcher for LlmCompanyResearcher {
    async fn research(&self, domain: &str) -> Result<String, EnrichmentError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(
                "You write short company briefs for a sales inbox. Answer in at most three \
                 sentences: what the company does, its approximate size, and anything a \
                 salesperson should know. If you do not recognise the company, say so.",
            ),
            ChatMessage::user(format!("Company website domain: {domain}")),
        ])
        .with_max_tokens(RESEARCH_MAX_TOKENS)
        .with_temperature(0.2);

        let response = self
            .llm
            .complete(request)
            .await
            .map_err(|e| EnrichmentError::Research {
                domain: domain.to_string(),
                reason: e.to_string(),
            })?;

        let brief = response.content.trim().to_string();
        if brief.is_empty() {
            return Err(EnrichmentError::Research {
                domain: domain.to_string(),
                reason: "empty response".into(),
            });
        }
        Ok(brief)
    }
}

/// Everything enrichment learned about one email.
#[derive(Debug, Clone)]
pub struct EnrichedContext {
    pub direction: Direction,
    pub contact_context: Option<ContactContext>,
    pub calendar_context: Option<CalendarContext>,
    pub company_research: Option<String>,
    pub events: Vec<TriageEvent>,
}

/// Case-insensitive substring match of the sender against our own addresses.
pub fn detect_direction(sender: &str, self_addresses: &[String]) -> Direction {
    let sender = sender.to_lowercase();
    let outbound = self_addresses
        .iter()
        .map(|a| a.trim().to_lowercase())
        .any(|a| !a.is_empty() && sender.contains(&a));
    if outbound {
        Direction::Outbound
    } else {
        Direction::Inbound
    }
}

pub fn is_scheduling_email(email: &Email) -> bool {
    let haystack = format!("{} {}", email.subject, email.body).to_lowercase();
    SCHEDULING_KEYWORDS.iter().any(|k| haystack.contains(k))
}

pub fn is_consumer_domain(domain: &str) -> bool {
    CONSUMER_DOMAINS.contains(&domain.to_lowercase().as_str())
}

/// First contact whose name or email appears in the subject or body.
fn mentioned_contact<'a>(email: &Email, contacts: &'a [Contact]) -> Option<&'a Contact> {
    let haystack = format!("{}\n{}", email.subject, email.body).to_lowercase();
    contacts.iter().find(|c| {
        let name = c.name.trim().to_lowercase();
        let addr = c.email.trim().to_lowercase();
        (!name.is_empty() && haystack.contains(&name)) || (!addr.is_empty() && haystack.contains(&addr))
    })
}

fn to_context(contact: &Contact, direction: Direction) -> ContactContext {
    ContactContext {
        contact_id: contact.id.clone(),
        name: contact.name.clone(),
        email: contact.email.clone(),
        company_id: contact.company_id.clone(),
        direction,
        last_chat: contact.last_chat,
    }
}

/// Gathers context for one email.
pub struct ContextEnricher {
    db: Arc<dyn Database>,
    mail: Arc<dyn MailTransport>,
    researcher: Option<Arc<dyn CompanyResearcher>>,
    clock: Arc<dyn Clock>,
    slots: SlotGenerator,
    self_addresses: Vec<String>,
    contact_scan_limit: usize,
    lookahead_days: u32,
}

impl ContextEnricher {
    pub fn new(
        config: &TriageConfig,
        db: Arc<dyn Database>,
        mail: Arc<dyn MailTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            mail,
            researcher: None,
            clock,
            slots: SlotGenerator::new(config.timezone, config.calendar_lookahead_days),
            self_addresses: config.self_addresses.clone(),
            contact_scan_limit: config.contact_scan_limit,
            lookahead_days: config.calendar_lookahead_days,
        }
    }

    pub fn with_researcher(mut self, researcher: Arc<dyn CompanyResearcher>) -> Self {
        self.researcher = Some(researcher);
        self
    }

    pub fn direction(&self, email: &Email) -> Direction {
        detect_direction(&email.from, &self.self_addresses)
    }

    /// Run every enrichment step. Never fails.
    pub async fn enrich(&self, email: &Email) -> EnrichedContext {
        let mut events = Vec::new();
        let direction = self.direction(email);
        events.push(TriageEvent::DirectionDetected { direction });

        let contact_context = match self.resolve_contact(email, direction).await {
            Ok(Some(ctx)) => {
                events.push(TriageEvent::ContactResolved {
                    contact_id: ctx.contact_id.clone(),
                    name: ctx.name.clone(),
                });
                Some(ctx)
            }
            Ok(None) => {
                events.push(TriageEvent::ContactNotFound);
                None
            }
            Err(e) => {
                warn!(email_id = %email.id, error = %e, "Contact lookup failed");
                events.push(TriageEvent::ContactLookupFailed { reason: e.to_string() });
                None
            }
        };

        let calendar_context = if is_scheduling_email(email) {
            match self.calendar_context().await {
                Ok(ctx) => {
                    events.push(if ctx.slots.is_empty() && ctx.structured_slots.is_empty() {
                        TriageEvent::CalendarSummaryOnly {
                            upcoming_events: ctx.upcoming_events,
                        }
                    } else {
                        TriageEvent::CalendarAttached {
                            slots: ctx.slots.len(),
                            structured_slots: ctx.structured_slots.len(),
                        }
                    });
                    Some(ctx)
                }
                Err(e) => {
                    warn!(email_id = %email.id, error = %e, "Calendar enrichment failed");
                    events.push(TriageEvent::CalendarUnavailable { reason: e.to_string() });
                    None
                }
            }
        } else {
            None
        };

        let company_research = self.company_research(email, &mut events).await;

        debug!(
            email_id = %email.id,
            ?direction,
            contact = contact_context.is_some(),
            calendar = calendar_context.is_some(),
            research = company_research.is_some(),
            "Enrichment complete"
        );

        EnrichedContext {
            direction,
            contact_context,
            calendar_context,
            company_research,
            events,
        }
    }

    /// Outbound: first recent contact mentioned in the email.
    /// Inbound: exact sender address match.
    pub async fn resolve_contact(
        &self,
        email: &Email,
        direction: Direction,
    ) -> Result<Option<ContactContext>, EnrichmentError> {
        let contact = match direction {
            Direction::Outbound => {
                let recent = self
                    .db
                    .recent_contacts(self.contact_scan_limit)
                    .await
                    .map_err(|e| EnrichmentError::ContactLookup(e.to_string()))?;
                mentioned_contact(email, &recent).cloned()
            }
            Direction::Inbound => self
                .db
                .find_contact_by_email(&email.sender_address())
                .await
                .map_err(|e| EnrichmentError::ContactLookup(e.to_string()))?,
        };
        Ok(contact.map(|c| to_context(&c, direction)))
    }

    /// Busy times turned into raw and structured slots.
    pub async fn calendar_context(&self) -> Result<CalendarContext, EnrichmentError> {
        let busy = self
            .mail
            .busy_intervals(self.lookahead_days)
            .await
            .map_err(|e| EnrichmentError::Calendar(e.to_string()))?;

        let now = self.clock.now();
        let slots = self.slots.available_slots(&busy, now);
        let structured_slots = self.slots.structured_slots(&busy, now);
        let upcoming_events = busy.len();

        let summary = if slots.is_empty() && structured_slots.is_empty() {
            format!(
                "{upcoming_events} upcoming events in the next {} days",
                self.lookahead_days
            )
        } else {
            let mut summary = format!(
                "{upcoming_events} upcoming events in the next {} days; {} open 30-minute slots",
                self.lookahead_days,
                slots.len()
            );
            if let Some(first) = slots.first() {
                summary.push_str(&format!(", earliest {}", first.label));
            }
            if !structured_slots.is_empty() {
                let windows: Vec<&str> = structured_slots.iter().map(|s| s.label.as_str()).collect();
                summary.push_str(&format!(". Proposed windows: {}", windows.join("; ")));
            }
            summary
        };

        Ok(CalendarContext {
            summary,
            slots,
            structured_slots,
            upcoming_events,
        })
    }

    async fn company_research(&self, email: &Email, events: &mut Vec<TriageEvent>) -> Option<String> {
        let researcher = self.researcher.as_ref()?;
        let domain = email.sender_domain()?;
        if is_consumer_domain(&domain) {
            return None;
        }
        match researcher.research(&domain).await {
            Ok(brief) => {
                events.push(TriageEvent::CompanyResearched { domain });
                Some(brief)
            }
            Err(e) => {
                warn!(email_id = %email.id, %domain, error = %e, "Company research failed");
                events.push(TriageEvent::CompanyResearchFailed {
                    domain,
                    reason: e.to_string(),
                });
                None
            }
        }
    }
}
