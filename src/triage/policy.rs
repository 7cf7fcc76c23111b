//! Confidence-gated automation.
//!
//! `AutomationPolicy::evaluate` is pure: it reads a decision, the email and
//! the previously stored record and returns a `PolicyPlan`. `apply` then
//! performs the side effects and sets the decision's flags. Every rule is
//! evaluated; several can fire for one email.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::crm::{Activity, ActivityPriority};
use crate::mail::{Email, MailTransport, extract_address};
use crate::store::Database;
use crate::triage::state::TriageEvent;
use crate::triage::types::{Direction, DraftVariant, KeyPoint, TriageDecision};

pub const ARCHIVE_MIN_CONFIDENCE: u8 = 9;
/// The email must be strictly older than this before auto-archive.
pub const ARCHIVE_MIN_AGE_HOURS: i64 = 2;
pub const DRAFT_MIN_CONFIDENCE: u8 = 7;
/// Lower bound for offering drafts to the user instead of creating one.
pub const SURFACE_MIN_CONFIDENCE: u8 = 4;
pub const ACTIVITY_MIN_CONFIDENCE: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ArchivePlan {
    Archive,
    /// Too fresh. Waits for a later manual re-trigger.
    Pending { hours_elapsed: i64 },
    AlreadyArchived,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DraftPlan {
    Create {
        variant: DraftVariant,
        to: String,
        subject: String,
        body: String,
    },
    /// Offered for manual choice, nothing created.
    Surface {
        pushy: Option<String>,
        exploratory: Option<String>,
    },
    AlreadyCreated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityPlan {
    pub contact_id: String,
    pub company_id: Option<String>,
    pub priority: ActivityPriority,
    pub description: String,
    pub next_step: String,
}

/// What automation will do for one decision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PolicyPlan {
    pub archive: Option<ArchivePlan>,
    pub draft: Option<DraftPlan>,
    pub activity: Option<ActivityPlan>,
}

/// Executes automation against the mail transport and CRM store.
pub struct AutomationPolicy {
    mail: Arc<dyn MailTransport>,
    db: Arc<dyn Database>,
}

impl AutomationPolicy {
    pub fn new(mail: Arc<dyn MailTransport>, db: Arc<dyn Database>) -> Self {
        Self { mail, db }
    }

    /// Evaluate all rules. Flags already set on `prior` are not planned again.
    pub fn evaluate(
        decision: &TriageDecision,
        email: &Email,
        direction: Direction,
        prior: Option<&TriageDecision>,
        now: DateTime<Utc>,
    ) -> PolicyPlan {
        let already_archived = decision.auto_archived || prior.is_some_and(|p| p.auto_archived);
        let already_drafted = decision.draft_created || prior.is_some_and(|p| p.draft_created);

        PolicyPlan {
            archive: plan_archive(decision, email, now, already_archived),
            draft: plan_draft(decision, email, direction, already_drafted),
            activity: plan_activity(decision, email),
        }
    }

    /// Run the plan. Flags are set only for side effects that succeeded.
    pub async fn apply(
        &self,
        plan: &PolicyPlan,
        decision: &mut TriageDecision,
        email: &Email,
        now: DateTime<Utc>,
    ) -> Vec<TriageEvent> {
        let mut events = Vec::new();

        match &plan.archive {
            Some(ArchivePlan::Archive) => match self.mail.archive(&email.id).await {
                Ok(()) => {
                    info!(email_id = %email.id, "Email auto-archived");
                    decision.auto_archived = true;
                    events.push(TriageEvent::Archived);
                }
                Err(e) => {
                    warn!(email_id = %email.id, error = %e, "Auto-archive failed");
                    events.push(TriageEvent::ArchiveFailed { reason: e.to_string() });
                }
            },
            Some(ArchivePlan::Pending { hours_elapsed }) => {
                events.push(TriageEvent::ArchivePending {
                    hours_elapsed: *hours_elapsed,
                });
            }
            Some(ArchivePlan::AlreadyArchived) => {
                decision.auto_archived = true;
                events.push(TriageEvent::AlreadyApplied {
                    action: "archive".into(),
                });
            }
            None => {}
        }

        match &plan.draft {
            Some(DraftPlan::Create {
                variant,
                to,
                subject,
                body,
            }) => match self.mail.create_draft(to, subject, body).await {
                Ok(draft_id) => {
                    info!(email_id = %email.id, ?variant, "Draft created");
                    decision.draft_created = true;
                    events.push(TriageEvent::DraftCreated {
                        variant: *variant,
                        draft_id,
                    });
                }
                Err(e) => {
                    warn!(email_id = %email.id, error = %e, "Draft creation failed");
                    events.push(TriageEvent::DraftFailed { reason: e.to_string() });
                }
            },
            Some(DraftPlan::Surface { .. }) => events.push(TriageEvent::DraftsSurfaced),
            Some(DraftPlan::AlreadyCreated) => {
                decision.draft_created = true;
                events.push(TriageEvent::AlreadyApplied {
                    action: "draft".into(),
                });
            }
            None => {}
        }

        if let Some(activity) = &plan.activity {
            let record = Activity {
                id: Uuid::new_v4().to_string(),
                contact_id: activity.contact_id.clone(),
                company_id: activity.company_id.clone(),
                email_id: email.id.clone(),
                description: activity.description.clone(),
                next_step: activity.next_step.clone(),
                priority: activity.priority,
                created_at: now,
            };
            match self.db.upsert_activity(&record).await {
                Ok(()) => events.push(TriageEvent::ActivityLogged {
                    priority: activity.priority.as_i64(),
                }),
                Err(e) => {
                    warn!(email_id = %email.id, error = %e, "CRM activity write failed");
                    events.push(TriageEvent::ActivityFailed { reason: e.to_string() });
                }
            }
        }

        events
    }
}

fn plan_archive(
    decision: &TriageDecision,
    email: &Email,
    now: DateTime<Utc>,
    already_archived: bool,
) -> Option<ArchivePlan> {
    if decision.key_point != KeyPoint::Archive || decision.confidence < ARCHIVE_MIN_CONFIDENCE {
        return None;
    }
    if already_archived {
        return Some(ArchivePlan::AlreadyArchived);
    }
    let elapsed = now - email.date;
    if elapsed > Duration::hours(ARCHIVE_MIN_AGE_HOURS) {
        Some(ArchivePlan::Archive)
    } else {
        Some(ArchivePlan::Pending {
            hours_elapsed: elapsed.num_hours().max(0),
        })
    }
}

fn plan_draft(
    decision: &TriageDecision,
    email: &Email,
    direction: Direction,
    already_drafted: bool,
) -> Option<DraftPlan> {
    if decision.confidence >= DRAFT_MIN_CONFIDENCE {
        let (variant, body) = decision.preferred_draft()?;
        if already_drafted {
            return Some(DraftPlan::AlreadyCreated);
        }
        return Some(DraftPlan::Create {
            variant,
            to: draft_recipient(decision, email, direction)?,
            subject: reply_subject(&email.subject),
            body: body.to_string(),
        });
    }

    let manual_band = (SURFACE_MIN_CONFIDENCE..DRAFT_MIN_CONFIDENCE).contains(&decision.confidence);
    if decision.key_point == KeyPoint::Respond && manual_band {
        let pushy = decision.draft(DraftVariant::Pushy).map(str::to_string);
        let exploratory = decision.draft(DraftVariant::Exploratory).map(str::to_string);
        if pushy.is_some() || exploratory.is_some() {
            return Some(DraftPlan::Surface { pushy, exploratory });
        }
    }
    None
}

fn plan_activity(decision: &TriageDecision, email: &Email) -> Option<ActivityPlan> {
    let contact = decision.contact_context.as_ref()?;
    let high = decision.confidence >= ACTIVITY_MIN_CONFIDENCE;
    if !(decision.key_point == KeyPoint::UpdateDatabase || high) {
        return None;
    }
    Some(ActivityPlan {
        contact_id: contact.contact_id.clone(),
        company_id: contact.company_id.clone(),
        priority: if high {
            ActivityPriority::High
        } else {
            ActivityPriority::Normal
        },
        description: format!("{}: {}", decision.key_point, email.subject),
        next_step: contact.direction.next_step(&contact.name, &email.subject),
    })
}

/// Inbound replies go to the sender. Outbound follow-ups go to the resolved
/// contact, else the first recipient; never back to ourselves.
fn draft_recipient(decision: &TriageDecision, email: &Email, direction: Direction) -> Option<String> {
    match direction {
        Direction::Inbound => Some(email.sender_address()),
        Direction::Outbound => decision
            .contact_context
            .as_ref()
            .map(|c| c.email.trim())
            .filter(|addr| !addr.is_empty())
            .map(str::to_string)
            .or_else(|| email.to.first().map(|to| extract_address(to).to_string()))
            .filter(|addr| !addr.is_empty()),
    }
}

fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed.to_lowercase().starts_with("re:") {
        trimmed.to_string()
    } else {
        format!("Re: {trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    use crate::error::MailError;
    use crate::mail::{BusyInterval, MailQuery};
    use crate::store::LibSqlBackend;
    use crate::triage::types::{ContactContext, DatabaseSuggestions, DecisionResponse};

    #[derive(Default)]
    struct RecordingMail {
        archived: Mutex<Vec<String>>,
        drafts: Mutex<Vec<(String, String, String)>>,
        fail_archive: bool,
    }

    #[async_trait]
    impl MailTransport for RecordingMail {
        async fn fetch_recent(&self, _n: usize) -> Result<Vec<Email>, MailError> {
            Ok(vec![])
        }
        async fn search(&self, _q: &MailQuery, _max: usize) -> Result<Vec<Email>, MailError> {
            Ok(vec![])
        }
        async fn archive(&self, id: &str) -> Result<(), MailError> {
            if self.fail_archive {
                return Err(MailError::Command {
                    command: "UID MOVE".into(),
                    reason: "NO".into(),
                });
            }
            self.archived.lock().unwrap().push(id.to_string());
            Ok(())
        }
        async fn create_draft(&self, to: &str, subject: &str, body: &str) -> Result<Option<String>, MailError> {
            self.drafts
                .lock()
                .unwrap()
                .push((to.into(), subject.into(), body.into()));
            Ok(Some("Drafts:1".into()))
        }
        async fn busy_intervals(&self, _days: u32) -> Result<Vec<BusyInterval>, MailError> {
            Ok(vec![])
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
    }

    fn email_received(hours_ago: i64) -> Email {
        Email::new("INBOX:7", "Ann <ann@acme.io>", "Pricing", now() - Duration::hours(hours_ago), "")
    }

    fn decision(key_point: KeyPoint, confidence: u8) -> TriageDecision {
        TriageDecision::from_response(
            "INBOX:7",
            DecisionResponse {
                key_point,
                confidence,
                action_reason: "r".into(),
                suggested_draft: None,
                suggested_draft_pushy: None,
                suggested_draft_exploratory: None,
                alternative_options: vec![],
                uncertainty_factors: vec![],
                database_suggestions: DatabaseSuggestions::default(),
            },
            None,
            None,
        )
    }

    fn contact(direction: Direction) -> ContactContext {
        ContactContext {
            contact_id: "c1".into(),
            name: "Ann".into(),
            email: "ann@acme.io".into(),
            company_id: Some("co1".into()),
            direction,
            last_chat: None,
        }
    }

    #[test]
    fn archive_fires_after_two_hours() {
        let d = decision(KeyPoint::Archive, 9);
        let plan = AutomationPolicy::evaluate(&d, &email_received(3), Direction::Inbound, None, now());
        assert_eq!(plan.archive, Some(ArchivePlan::Archive));
    }

    #[test]
    fn archive_pending_when_fresh() {
        let d = decision(KeyPoint::Archive, 9);
        let plan = AutomationPolicy::evaluate(&d, &email_received(1), Direction::Inbound, None, now());
        assert_eq!(plan.archive, Some(ArchivePlan::Pending { hours_elapsed: 1 }));
        // exactly two hours is still pending
        let plan = AutomationPolicy::evaluate(&d, &email_received(2), Direction::Inbound, None, now());
        assert!(matches!(plan.archive, Some(ArchivePlan::Pending { .. })));
    }

    #[test]
    fn archive_needs_confidence_nine() {
        let d = decision(KeyPoint::Archive, 8);
        let plan = AutomationPolicy::evaluate(&d, &email_received(5), Direction::Inbound, None, now());
        assert!(plan.archive.is_none());
    }

    #[test]
    fn draft_created_at_seven_with_preference() {
        let mut d = decision(KeyPoint::Respond, 7);
        d.suggested_draft = Some("standard".into());
        d.suggested_draft_exploratory = Some("exploratory".into());
        let plan = AutomationPolicy::evaluate(&d, &email_received(0), Direction::Inbound, None, now());
        match plan.draft {
            Some(DraftPlan::Create { variant, to, subject, body }) => {
                assert_eq!(variant, DraftVariant::Exploratory);
                assert_eq!(body, "exploratory");
                assert_eq!(to, "ann@acme.io");
                assert_eq!(subject, "Re: Pricing");
            }
            other => panic!("expected draft creation, got {other:?}"),
        }
    }

    #[test]
    fn drafts_surfaced_at_six() {
        let mut d = decision(KeyPoint::Respond, 6);
        d.suggested_draft_pushy = Some("pushy".into());
        d.suggested_draft_exploratory = Some("exploratory".into());
        let plan = AutomationPolicy::evaluate(&d, &email_received(0), Direction::Inbound, None, now());
        assert_eq!(
            plan.draft,
            Some(DraftPlan::Surface {
                pushy: Some("pushy".into()),
                exploratory: Some("exploratory".into()),
            })
        );
    }

    #[test]
    fn no_draft_rule_below_four_or_without_drafts() {
        let mut d = decision(KeyPoint::Respond, 3);
        d.suggested_draft_pushy = Some("pushy".into());
        assert!(AutomationPolicy::evaluate(&d, &email_received(0), Direction::Inbound, None, now()).draft.is_none());

        let d = decision(KeyPoint::Respond, 9);
        assert!(AutomationPolicy::evaluate(&d, &email_received(0), Direction::Inbound, None, now()).draft.is_none());
    }

    #[test]
    fn activity_rules() {
        let mut d = decision(KeyPoint::Review, 8);
        assert!(AutomationPolicy::evaluate(&d, &email_received(0), Direction::Inbound, None, now()).activity.is_none());

        d.contact_context = Some(contact(Direction::Inbound));
        let plan = AutomationPolicy::evaluate(&d, &email_received(0), Direction::Inbound, None, now());
        let activity = plan.activity.unwrap();
        assert_eq!(activity.priority, ActivityPriority::High);
        assert!(activity.next_step.starts_with("Reply to Ann"));

        let mut d = decision(KeyPoint::UpdateDatabase, 5);
        d.contact_context = Some(contact(Direction::Outbound));
        let activity = AutomationPolicy::evaluate(&d, &email_received(0), Direction::Outbound, None, now())
            .activity
            .unwrap();
        assert_eq!(activity.priority, ActivityPriority::Normal);
        assert!(activity.next_step.starts_with("Follow up with Ann"));

        let mut d = decision(KeyPoint::Respond, 7);
        d.contact_context = Some(contact(Direction::Inbound));
        assert!(AutomationPolicy::evaluate(&d, &email_received(0), Direction::Inbound, None, now()).activity.is_none());
    }

    #[test]
    fn rules_are_independent() {
        let mut d = decision(KeyPoint::Archive, 10);
        d.suggested_draft = Some("thanks".into());
        d.contact_context = Some(contact(Direction::Inbound));
        let plan = AutomationPolicy::evaluate(&d, &email_received(4), Direction::Inbound, None, now());
        assert_eq!(plan.archive, Some(ArchivePlan::Archive));
        assert!(matches!(plan.draft, Some(DraftPlan::Create { .. })));
        assert!(plan.activity.is_some());
    }

    #[test]
    fn prior_flags_are_not_replanned() {
        let mut d = decision(KeyPoint::Archive, 10);
        d.suggested_draft = Some("thanks".into());
        let mut prior = d.clone();
        prior.auto_archived = true;
        prior.draft_created = true;
        let plan = AutomationPolicy::evaluate(&d, &email_received(4), Direction::Inbound, Some(&prior), now());
        assert_eq!(plan.archive, Some(ArchivePlan::AlreadyArchived));
        assert_eq!(plan.draft, Some(DraftPlan::AlreadyCreated));
    }

    #[test]
    fn outbound_draft_goes_to_contact() {
        let mut d = decision(KeyPoint::Respond, 8);
        d.suggested_draft = Some("following up".into());
        d.contact_context = Some(contact(Direction::Outbound));
        let email = Email::new("Sent:1", "me@mycorp.com", "Re: Proposal", now(), "");
        match AutomationPolicy::evaluate(&d, &email, Direction::Outbound, None, now()).draft {
            Some(DraftPlan::Create { to, subject, .. }) => {
                assert_eq!(to, "ann@acme.io");
                assert_eq!(subject, "Re: Proposal");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn outbound_draft_without_contact_goes_to_recipient() {
        let mut d = decision(KeyPoint::Respond, 8);
        d.suggested_draft = Some("checking in".into());
        let email = Email::new("Sent:1", "me@mycorp.com", "Proposal", now(), "")
            .with_to(vec!["Ann <ann@acme.io>".into()]);
        match AutomationPolicy::evaluate(&d, &email, Direction::Outbound, None, now()).draft {
            Some(DraftPlan::Create { to, .. }) => assert_eq!(to, "ann@acme.io"),
            other => panic!("unexpected {other:?}"),
        }

        // nobody to write to: no draft rather than one addressed to ourselves
        let bare = Email::new("Sent:2", "me@mycorp.com", "Notes", now(), "");
        assert!(AutomationPolicy::evaluate(&d, &bare, Direction::Outbound, None, now()).draft.is_none());
    }

    #[tokio::test]
    async fn apply_sets_flags_and_logs_activity() {
        let mail = Arc::new(RecordingMail::default());
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let policy = AutomationPolicy::new(mail.clone(), db.clone());

        let mut d = decision(KeyPoint::Archive, 9);
        d.suggested_draft_pushy = Some("pushy".into());
        d.contact_context = Some(contact(Direction::Inbound));
        let email = email_received(3);
        let plan = AutomationPolicy::evaluate(&d, &email, Direction::Inbound, None, now());
        let events = policy.apply(&plan, &mut d, &email, now()).await;

        assert!(d.auto_archived);
        assert!(d.draft_created);
        assert_eq!(*mail.archived.lock().unwrap(), vec!["INBOX:7".to_string()]);
        assert_eq!(mail.drafts.lock().unwrap()[0].2, "pushy");
        assert!(events.contains(&TriageEvent::Archived));
        assert!(events.contains(&TriageEvent::ActivityLogged { priority: 1 }));

        let activity = db.activity_for_email("INBOX:7").await.unwrap().unwrap();
        assert_eq!(activity.contact_id, "c1");
        assert_eq!(activity.created_at, now());
        assert_eq!(activity.priority, ActivityPriority::High);
    }

    #[tokio::test]
    async fn failed_archive_leaves_flag_false() {
        let mail = Arc::new(RecordingMail {
            fail_archive: true,
            ..Default::default()
        });
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let policy = AutomationPolicy::new(mail, db);

        let mut d = decision(KeyPoint::Archive, 9);
        let email = email_received(3);
        let plan = AutomationPolicy::evaluate(&d, &email, Direction::Inbound, None, now());
        let events = policy.apply(&plan, &mut d, &email, now()).await;

        assert!(!d.auto_archived);
        assert!(matches!(events[0], TriageEvent::ArchiveFailed { .. }));
    }
}
