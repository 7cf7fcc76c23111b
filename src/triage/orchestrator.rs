//! Triage orchestrator: enrichment → decision → persist → automation.
//!
//! Every run is started by a caller. Nothing here retries or re-evaluates
//! on its own; a pending archive or a failed decision waits for the next
//! manual trigger.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::error::TriageError;
use crate::mail::{Email, MailTransport};
use crate::pacing::{PaceKind, Pacer};
use crate::store::Database;
use crate::triage::decision::DecisionService;
use crate::triage::enrichment::ContextEnricher;
use crate::triage::policy::AutomationPolicy;
use crate::triage::state::{TriageEvent, TriageRun, TriageState};
use crate::triage::types::{Feedback, TriageDecision};

pub struct TriageOrchestrator {
    enricher: ContextEnricher,
    decider: Arc<dyn DecisionService>,
    policy: AutomationPolicy,
    db: Arc<dyn Database>,
    mail: Arc<dyn MailTransport>,
    pacer: Arc<dyn Pacer>,
    clock: Arc<dyn Clock>,
}

impl TriageOrchestrator {
    pub fn new(
        enricher: ContextEnricher,
        decider: Arc<dyn DecisionService>,
        db: Arc<dyn Database>,
        mail: Arc<dyn MailTransport>,
        pacer: Arc<dyn Pacer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            enricher,
            decider,
            policy: AutomationPolicy::new(mail.clone(), db.clone()),
            db,
            mail,
            pacer,
            clock,
        }
    }

    /// Triage one email. Failures end up in the run, never as `Err`.
    pub async fn triage(&self, email: &Email) -> TriageRun {
        let mut run = TriageRun::new(email.id.clone(), self.clock.now());
        info!(email_id = %email.id, subject = %email.subject, "Triaging email");

        advance(&mut run, TriageState::Enriching);
        let context = self.enricher.enrich(email).await;
        let direction = context.direction;
        run.extend(context.events.iter().cloned());

        advance(&mut run, TriageState::AwaitingDecision);
        let response = match self.decider.decide(email, &context).await {
            Ok(r) => r,
            Err(e) => {
                error!(email_id = %email.id, error = %e, "Decision service failed");
                run.record(TriageEvent::DecisionFailed { reason: e.to_string() });
                advance(&mut run, TriageState::Error);
                return run;
            }
        };

        let mut decision = TriageDecision::from_response(
            email.id.clone(),
            response,
            context.contact_context,
            context.calendar_context,
        );
        let prior = match self.db.get_decision(&email.id).await {
            Ok(prior) => prior,
            Err(e) => {
                warn!(email_id = %email.id, error = %e, "Could not load prior decision");
                None
            }
        };
        if let Some(prior) = &prior {
            decision.inherit_from(prior);
        }
        run.record(TriageEvent::DecisionReceived {
            key_point: decision.key_point,
            confidence: decision.confidence,
        });
        advance(&mut run, TriageState::Decided);

        self.persist(&decision, &mut run).await;

        let now = self.clock.now();
        let plan = AutomationPolicy::evaluate(&decision, email, direction, prior.as_ref(), now);
        let flags_before = (decision.auto_archived, decision.draft_created);
        let events = self.policy.apply(&plan, &mut decision, email, now).await;
        run.extend(events);
        advance(&mut run, TriageState::AutomationApplied);

        if (decision.auto_archived, decision.draft_created) != flags_before {
            self.persist(&decision, &mut run).await;
        }

        info!(
            email_id = %email.id,
            key_point = %decision.key_point,
            confidence = decision.confidence,
            archived = decision.auto_archived,
            drafted = decision.draft_created,
            "Triage complete"
        );
        run.decision = Some(decision);
        run.plan = Some(plan);
        run
    }

    /// Triage emails one after another with a pause between them.
    pub async fn triage_batch(&self, emails: &[Email]) -> Vec<TriageRun> {
        let count = emails.len();
        info!(count, "Triaging email batch");

        let mut runs = Vec::with_capacity(count);
        for (i, email) in emails.iter().enumerate() {
            if i > 0 {
                self.pacer.pause(PaceKind::BetweenEmails).await;
            }
            runs.push(self.triage(email).await);
        }

        let failed = runs.iter().filter(|r| r.state.is_error()).count();
        info!(total = count, failed, "Batch triage complete");
        runs
    }

    /// Fetch the `n` most recent emails and triage them as a batch.
    pub async fn triage_recent(&self, n: usize) -> Result<Vec<TriageRun>, TriageError> {
        let emails = self.mail.fetch_recent(n).await?;
        Ok(self.triage_batch(&emails).await)
    }

    /// Store user feedback on an existing decision.
    pub async fn record_feedback(
        &self,
        email_id: &str,
        feedback: Feedback,
    ) -> Result<TriageRun, TriageError> {
        record_feedback(self.db.as_ref(), email_id, feedback, self.clock.now()).await
    }

    async fn persist(&self, decision: &TriageDecision, run: &mut TriageRun) {
        match self.db.upsert_decision(decision).await {
            Ok(()) => run.record(TriageEvent::DecisionPersisted),
            Err(e) => {
                warn!(email_id = %decision.email_id, error = %e, "Decision not persisted");
                run.record(TriageEvent::PersistFailed { reason: e.to_string() });
            }
        }
    }
}

/// Attach feedback to the stored decision for `email_id`. The returned run
/// starts from the stored decision and ends in `FeedbackRecorded`.
pub async fn record_feedback(
    db: &dyn Database,
    email_id: &str,
    feedback: Feedback,
    now: DateTime<Utc>,
) -> Result<TriageRun, TriageError> {
    let mut decision = db
        .get_decision(email_id)
        .await?
        .ok_or_else(|| TriageError::UnknownEmail(email_id.to_string()))?;
    decision.feedback = Some(feedback);
    db.upsert_decision(&decision).await?;
    info!(email_id, feedback = ?decision.feedback, "Feedback recorded");

    let mut run = TriageRun::resume(decision, now);
    advance(&mut run, TriageState::FeedbackRecorded);
    run.record(TriageEvent::FeedbackStored);
    Ok(run)
}

fn advance(run: &mut TriageRun, to: TriageState) {
    let from = run.state;
    if run.transition_to(to).is_err() {
        let err = TriageError::InvalidTransition {
            email_id: run.email_id.clone(),
            from: from.to_string(),
            to: to.to_string(),
        };
        error!(error = %err, "Illegal triage state change");
    }
}
