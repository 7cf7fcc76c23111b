//! Unified `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::crm::{Activity, Company, Contact};
use crate::error::DatabaseError;
use crate::triage::types::TriageDecision;

/// Backend-agnostic database trait covering decisions and the CRM tables.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Triage decisions ────────────────────────────────────────────

    /// Insert or replace the decision for its email id (last write wins).
    async fn upsert_decision(&self, decision: &TriageDecision) -> Result<(), DatabaseError>;

    async fn get_decision(&self, email_id: &str) -> Result<Option<TriageDecision>, DatabaseError>;

    /// Most recently updated decisions.
    async fn recent_decisions(&self, limit: usize) -> Result<Vec<TriageDecision>, DatabaseError>;

    // ── Contacts ────────────────────────────────────────────────────

    async fn insert_contact(&self, contact: &Contact) -> Result<(), DatabaseError>;

    async fn get_contact(&self, id: &str) -> Result<Option<Contact>, DatabaseError>;

    /// The `limit` most recently created contacts, newest first.
    async fn recent_contacts(&self, limit: usize) -> Result<Vec<Contact>, DatabaseError>;

    /// Exact, case-insensitive email match. At most one contact.
    async fn find_contact_by_email(&self, email: &str) -> Result<Option<Contact>, DatabaseError>;

    /// Every contact with a non-empty email, oldest first.
    async fn contacts_with_email(&self) -> Result<Vec<Contact>, DatabaseError>;

    async fn contacts_for_company(&self, company_id: &str) -> Result<Vec<Contact>, DatabaseError>;

    async fn update_contact_last_chat(
        &self,
        id: &str,
        last_chat: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Companies ───────────────────────────────────────────────────

    async fn insert_company(&self, company: &Company) -> Result<(), DatabaseError>;

    async fn get_company(&self, id: &str) -> Result<Option<Company>, DatabaseError>;

    async fn list_companies(&self) -> Result<Vec<Company>, DatabaseError>;

    async fn update_company_last_chat(
        &self,
        id: &str,
        last_chat: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Activities ──────────────────────────────────────────────────

    /// Insert or replace the activity for its email id.
    async fn upsert_activity(&self, activity: &Activity) -> Result<(), DatabaseError>;

    async fn activity_for_email(&self, email_id: &str) -> Result<Option<Activity>, DatabaseError>;
}
