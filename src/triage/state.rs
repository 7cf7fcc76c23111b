//! Per-email triage state machine and the structured run log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::triage::policy::PolicyPlan;
use crate::triage::types::{Direction, DraftVariant, KeyPoint, TriageDecision};

/// State of one email in the triage pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageState {
    /// Email is in hand, nothing done yet.
    Fetched,
    /// Contact, calendar and company context being gathered.
    Enriching,
    /// Decision request in flight.
    AwaitingDecision,
    /// Decision service answered and the decision was recorded.
    Decided,
    /// Automation policy ran (repeatable).
    AutomationApplied,
    /// User feedback stored.
    FeedbackRecorded,
    /// Decision service failed. Terminal until the user re-triggers.
    Error,
}

impl TriageState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TriageState) -> bool {
        use TriageState::*;

        matches!(
            (self, target),
            (Fetched, Enriching) |
            (Enriching, AwaitingDecision) |
            (AwaitingDecision, Decided) | (AwaitingDecision, Error) |
            (Decided, AutomationApplied) | (Decided, FeedbackRecorded) |
            (AutomationApplied, AutomationApplied) | (AutomationApplied, FeedbackRecorded) |
            (FeedbackRecorded, FeedbackRecorded) |
            // Manual re-trigger
            (Error, Fetched) | (Decided, Fetched) |
            (AutomationApplied, Fetched) | (FeedbackRecorded, Fetched)
        )
    }

    /// Error is the only state that needs a user action to leave.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error)
    }
}

impl std::fmt::Display for TriageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Fetched => "fetched",
            Self::Enriching => "enriching",
            Self::AwaitingDecision => "awaiting_decision",
            Self::Decided => "decided",
            Self::AutomationApplied => "automation_applied",
            Self::FeedbackRecorded => "feedback_recorded",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// One entry of the structured run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriageEvent {
    StateChanged {
        from: TriageState,
        to: TriageState,
    },
    DirectionDetected {
        direction: Direction,
    },
    ContactResolved {
        contact_id: String,
        name: String,
    },
    ContactNotFound,
    ContactLookupFailed {
        reason: String,
    },
    CalendarAttached {
        slots: usize,
        structured_slots: usize,
    },
    /// Busy times fetched but no slot could be produced.
    CalendarSummaryOnly {
        upcoming_events: usize,
    },
    CalendarUnavailable {
        reason: String,
    },
    CompanyResearched {
        domain: String,
    },
    CompanyResearchFailed {
        domain: String,
        reason: String,
    },
    DecisionReceived {
        key_point: KeyPoint,
        confidence: u8,
    },
    DecisionFailed {
        reason: String,
    },
    DecisionPersisted,
    PersistFailed {
        reason: String,
    },
    Archived,
    /// Archive rule matched but the email is too fresh.
    ArchivePending {
        hours_elapsed: i64,
    },
    ArchiveFailed {
        reason: String,
    },
    DraftCreated {
        variant: DraftVariant,
        draft_id: Option<String>,
    },
    DraftFailed {
        reason: String,
    },
    /// Pushy and exploratory drafts offered for manual choice.
    DraftsSurfaced,
    ActivityLogged {
        priority: i64,
    },
    ActivityFailed {
        reason: String,
    },
    /// Action skipped because the prior record already has it.
    AlreadyApplied {
        action: String,
    },
    FeedbackStored,
}

impl TriageEvent {
    /// Whether this event records a failed step.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::ContactLookupFailed { .. }
                | Self::CalendarUnavailable { .. }
                | Self::CompanyResearchFailed { .. }
                | Self::DecisionFailed { .. }
                | Self::PersistFailed { .. }
                | Self::ArchiveFailed { .. }
                | Self::DraftFailed { .. }
                | Self::ActivityFailed { .. }
        )
    }
}

/// Outcome of one orchestrator run.
#[derive(Debug, Clone, Serialize)]
pub struct TriageRun {
    pub email_id: String,
    pub state: TriageState,
    pub decision: Option<TriageDecision>,
    pub plan: Option<PolicyPlan>,
    pub events: Vec<TriageEvent>,
    pub started_at: DateTime<Utc>,
}

impl TriageRun {
    pub fn new(email_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            email_id: email_id.into(),
            state: TriageState::Fetched,
            decision: None,
            plan: None,
            events: Vec::new(),
            started_at,
        }
    }

    /// Pick up a stored decision. It starts in `FeedbackRecorded` if it
    /// already carries feedback, else `AutomationApplied`.
    pub fn resume(decision: TriageDecision, started_at: DateTime<Utc>) -> Self {
        let state = if decision.feedback.is_some() {
            TriageState::FeedbackRecorded
        } else {
            TriageState::AutomationApplied
        };
        Self {
            email_id: decision.email_id.clone(),
            state,
            decision: Some(decision),
            plan: None,
            events: Vec::new(),
            started_at,
        }
    }

    /// Transition to a new state, logging a `StateChanged` event.
    pub fn transition_to(&mut self, new_state: TriageState) -> Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.state, new_state
            ));
        }
        self.events.push(TriageEvent::StateChanged {
            from: self.state,
            to: new_state,
        });
        self.state = new_state;
        Ok(())
    }

    pub fn record(&mut self, event: TriageEvent) {
        self.events.push(event);
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = TriageEvent>) {
        self.events.extend(events);
    }

    pub fn failures(&self) -> impl Iterator<Item = &TriageEvent> {
        self.events.iter().filter(|e| e.is_failure())
    }
}
