//! Email triage: enrichment, decision, automation.

pub mod decision;
pub mod enrichment;
pub mod orchestrator;
pub mod policy;
pub mod slots;
pub mod state;
pub mod types;

pub use decision::{DecisionService, LlmDecisionService};
pub use enrichment::{CompanyResearcher, ContextEnricher, EnrichedContext, LlmCompanyResearcher};
pub use orchestrator::TriageOrchestrator;
pub use policy::{AutomationPolicy, PolicyPlan};
pub use state::{TriageEvent, TriageRun, TriageState};
pub use types::{Feedback, KeyPoint, TriageDecision};
