//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! fixed-width RFC 3339 UTC text so they sort lexically.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::crm::{Activity, ActivityPriority, Company, Contact};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::Database;
use crate::triage::types::TriageDecision;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_contacts(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<Contact>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut contacts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_contact(&row) {
                Ok(c) => contacts.push(c),
                Err(e) => warn!(op, "Skipping unreadable contact row: {e}"),
            }
        }
        Ok(contacts)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format for every TEXT time column.
fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<&DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_ts(dt)),
        None => libsql::Value::Null,
    }
}

const CONTACT_COLUMNS: &str = "id, name, email, company_id, last_chat, created_at";

fn row_to_contact(row: &libsql::Row) -> Result<Contact, libsql::Error> {
    let last_chat: Option<String> = row.get(4).ok();
    let created_str: String = row.get(5)?;
    Ok(Contact {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get::<String>(2).unwrap_or_default(),
        company_id: row.get(3).ok(),
        last_chat: parse_optional_datetime(&last_chat),
        created_at: parse_datetime(&created_str),
    })
}

const COMPANY_COLUMNS: &str = "id, name, domain, last_chat";

fn row_to_company(row: &libsql::Row) -> Result<Company, libsql::Error> {
    let last_chat: Option<String> = row.get(3).ok();
    Ok(Company {
        id: row.get(0)?,
        name: row.get(1)?,
        domain: row.get(2).ok(),
        last_chat: parse_optional_datetime(&last_chat),
    })
}

const ACTIVITY_COLUMNS: &str =
    "id, contact_id, company_id, email_id, description, next_step, priority, created_at";

fn row_to_activity(row: &libsql::Row) -> Result<Activity, libsql::Error> {
    let created_str: String = row.get(7)?;
    Ok(Activity {
        id: row.get(0)?,
        contact_id: row.get(1)?,
        company_id: row.get(2).ok(),
        email_id: row.get(3)?,
        description: row.get(4)?,
        next_step: row.get(5)?,
        priority: ActivityPriority::from_i64(row.get(6)?),
        created_at: parse_datetime(&created_str),
    })
}

fn payload_to_decision(payload: &str) -> Result<TriageDecision, DatabaseError> {
    serde_json::from_str(payload)
        .map_err(|e| DatabaseError::Serialization(format!("decision payload: {e}")))
}

// ── Database impl ───────────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Triage decisions ────────────────────────────────────────────

    async fn upsert_decision(&self, decision: &TriageDecision) -> Result<(), DatabaseError> {
        let payload = serde_json::to_string(decision)
            .map_err(|e| DatabaseError::Serialization(format!("decision payload: {e}")))?;
        let now = fmt_ts(&Utc::now());

        self.conn()
            .execute(
                "INSERT INTO triage_decisions (email_id, key_point, confidence, auto_archived,
                    draft_created, payload, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT(email_id) DO UPDATE SET
                    key_point = excluded.key_point,
                    confidence = excluded.confidence,
                    auto_archived = excluded.auto_archived,
                    draft_created = excluded.draft_created,
                    payload = excluded.payload,
                    updated_at = excluded.updated_at",
                params![
                    decision.email_id.as_str(),
                    decision.key_point.as_str(),
                    i64::from(decision.confidence),
                    decision.auto_archived as i64,
                    decision.draft_created as i64,
                    payload,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_decision: {e}")))?;

        debug!(email_id = %decision.email_id, key_point = %decision.key_point, "Decision upserted");
        Ok(())
    }

    async fn get_decision(&self, email_id: &str) -> Result<Option<TriageDecision>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT payload FROM triage_decisions WHERE email_id = ?1",
                params![email_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_decision: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let payload: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                payload_to_decision(&payload).map(Some)
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_decision: {e}"))),
        }
    }

    async fn recent_decisions(&self, limit: usize) -> Result<Vec<TriageDecision>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT payload FROM triage_decisions ORDER BY updated_at DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_decisions: {e}")))?;

        let mut decisions = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let payload: String = match row.get(0) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Skipping unreadable decision row: {e}");
                    continue;
                }
            };
            match payload_to_decision(&payload) {
                Ok(d) => decisions.push(d),
                Err(e) => warn!("Skipping undecodable decision: {e}"),
            }
        }
        Ok(decisions)
    }

    // ── Contacts ────────────────────────────────────────────────────

    async fn insert_contact(&self, contact: &Contact) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO contacts (id, name, email, company_id, last_chat, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    contact.id.as_str(),
                    contact.name.as_str(),
                    contact.email.as_str(),
                    opt_text(contact.company_id.as_deref()),
                    opt_ts(contact.last_chat.as_ref()),
                    fmt_ts(&contact.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_contact: {e}")))?;
        Ok(())
    }

    async fn get_contact(&self, id: &str) -> Result<Option<Contact>, DatabaseError> {
        let contacts = self
            .query_contacts(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
                params![id],
                "get_contact",
            )
            .await?;
        Ok(contacts.into_iter().next())
    }

    async fn recent_contacts(&self, limit: usize) -> Result<Vec<Contact>, DatabaseError> {
        self.query_contacts(
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts ORDER BY created_at DESC LIMIT ?1"),
            params![limit as i64],
            "recent_contacts",
        )
        .await
    }

    async fn find_contact_by_email(&self, email: &str) -> Result<Option<Contact>, DatabaseError> {
        let email = email.trim();
        if email.is_empty() {
            return Ok(None);
        }
        let contacts = self
            .query_contacts(
                &format!(
                    "SELECT {CONTACT_COLUMNS} FROM contacts
                     WHERE email = ?1 COLLATE NOCASE ORDER BY created_at ASC LIMIT 1"
                ),
                params![email],
                "find_contact_by_email",
            )
            .await?;
        Ok(contacts.into_iter().next())
    }

    async fn contacts_with_email(&self) -> Result<Vec<Contact>, DatabaseError> {
        self.query_contacts(
            &format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts
                 WHERE TRIM(email) != '' ORDER BY created_at ASC, id ASC"
            ),
            (),
            "contacts_with_email",
        )
        .await
    }

    async fn contacts_for_company(&self, company_id: &str) -> Result<Vec<Contact>, DatabaseError> {
        self.query_contacts(
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE company_id = ?1"),
            params![company_id],
            "contacts_for_company",
        )
        .await
    }

    async fn update_contact_last_chat(
        &self,
        id: &str,
        last_chat: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE contacts SET last_chat = ?2 WHERE id = ?1",
                params![id, fmt_ts(&last_chat)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_contact_last_chat: {e}")))?;
        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "contact".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    // ── Companies ───────────────────────────────────────────────────

    async fn insert_company(&self, company: &Company) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO companies (id, name, domain, last_chat) VALUES (?1, ?2, ?3, ?4)",
                params![
                    company.id.as_str(),
                    company.name.as_str(),
                    opt_text(company.domain.as_deref()),
                    opt_ts(company.last_chat.as_ref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_company: {e}")))?;
        Ok(())
    }

    async fn get_company(&self, id: &str) -> Result<Option<Company>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {COMPANY_COLUMNS} FROM companies WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_company: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_company(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_company: {e}"))),
        }
    }

    async fn list_companies(&self) -> Result<Vec<Company>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {COMPANY_COLUMNS} FROM companies ORDER BY name ASC, id ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_companies: {e}")))?;

        let mut companies = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_company(&row) {
                Ok(c) => companies.push(c),
                Err(e) => warn!("Skipping unreadable company row: {e}"),
            }
        }
        Ok(companies)
    }

    async fn update_company_last_chat(
        &self,
        id: &str,
        last_chat: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE companies SET last_chat = ?2 WHERE id = ?1",
                params![id, fmt_ts(&last_chat)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_company_last_chat: {e}")))?;
        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "company".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    // ── Activities ──────────────────────────────────────────────────

    async fn upsert_activity(&self, activity: &Activity) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO activities (id, contact_id, company_id, email_id, description,
                    next_step, priority, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(email_id) DO UPDATE SET
                    contact_id = excluded.contact_id,
                    company_id = excluded.company_id,
                    description = excluded.description,
                    next_step = excluded.next_step,
                    priority = excluded.priority",
                params![
                    activity.id.as_str(),
                    activity.contact_id.as_str(),
                    opt_text(activity.company_id.as_deref()),
                    activity.email_id.as_str(),
                    activity.description.as_str(),
                    activity.next_step.as_str(),
                    activity.priority.as_i64(),
                    fmt_ts(&activity.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_activity: {e}")))?;
        debug!(email_id = %activity.email_id, contact_id = %activity.contact_id, "Activity upserted");
        Ok(())
    }

    async fn activity_for_email(&self, email_id: &str) -> Result<Option<Activity>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ACTIVITY_COLUMNS} FROM activities WHERE email_id = ?1"),
                params![email_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("activity_for_email: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_activity(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("activity_for_email: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    use crate::triage::types::{DatabaseSuggestions, DecisionResponse, Feedback, KeyPoint};

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_decision(email_id: &str, key_point: KeyPoint, confidence: u8) -> TriageDecision {
        TriageDecision::from_response(
            email_id,
            DecisionResponse {
                key_point,
                confidence,
                action_reason: "reason".into(),
                suggested_draft: Some("Thanks!".into()),
                suggested_draft_pushy: None,
                suggested_draft_exploratory: None,
                alternative_options: vec!["wait".into()],
                uncertainty_factors: vec![],
                database_suggestions: DatabaseSuggestions::default(),
            },
            None,
            None,
        )
    }

    #[tokio::test]
    async fn migrations_can_run_on_spawned_task() {
        let db = Arc::new(test_db().await);
        let handle = tokio::spawn({
            let db = db.clone();
            async move { db.run_migrations().await }
        });
        handle.await.unwrap().unwrap();
        assert!(db.recent_decisions(10).await.unwrap().is_empty());
    }

    // ── Decision tests ──────────────────────────────────────────────

    #[tokio::test]
    async fn decision_round_trip() {
        let db = test_db().await;
        let decision = make_decision("INBOX:1", KeyPoint::Respond, 8);
        db.upsert_decision(&decision).await.unwrap();

        let fetched = db.get_decision("INBOX:1").await.unwrap().unwrap();
        assert_eq!(fetched, decision);
    }

    #[tokio::test]
    async fn decision_upsert_replaces() {
        let db = test_db().await;
        db.upsert_decision(&make_decision("e1", KeyPoint::Respond, 5))
            .await
            .unwrap();

        let mut second = make_decision("e1", KeyPoint::Archive, 9);
        second.auto_archived = true;
        second.feedback = Some(Feedback::Bad { text: "too eager".into() });
        db.upsert_decision(&second).await.unwrap();

        let fetched = db.get_decision("e1").await.unwrap().unwrap();
        assert_eq!(fetched, second);
        assert_eq!(db.recent_decisions(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn decision_not_found() {
        let db = test_db().await;
        assert!(db.get_decision("missing").await.unwrap().is_none());
    }

    // ── Contact tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn recent_contacts_newest_first() {
        let db = test_db().await;
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for i in 0..5 {
            let c = Contact::new(format!("C{i}"), format!("c{i}@x.com"))
                .with_created_at(base + Duration::days(i));
            db.insert_contact(&c).await.unwrap();
        }

        let recent = db.recent_contacts(3).await.unwrap();
        let names: Vec<_> = recent.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["C4", "C3", "C2"]);
    }

    #[tokio::test]
    async fn find_contact_case_insensitive() {
        let db = test_db().await;
        let c = Contact::new("Ann", "Ann@Acme.io");
        db.insert_contact(&c).await.unwrap();

        let found = db.find_contact_by_email("ann@acme.IO").await.unwrap().unwrap();
        assert_eq!(found.id, c.id);
        assert!(db.find_contact_by_email("bob@acme.io").await.unwrap().is_none());
        assert!(db.find_contact_by_email("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn contacts_with_email_skips_blank() {
        let db = test_db().await;
        db.insert_contact(&Contact::new("A", "a@x.com")).await.unwrap();
        db.insert_contact(&Contact::new("B", "")).await.unwrap();
        db.insert_contact(&Contact::new("C", "  ")).await.unwrap();

        let contacts = db.contacts_with_email().await.unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].name, "A");
    }

    #[tokio::test]
    async fn update_last_chat_and_company_filter() {
        let db = test_db().await;
        let company = Company::new("Acme").with_domain("acme.io");
        db.insert_company(&company).await.unwrap();
        let c = Contact::new("Ann", "ann@acme.io").with_company(company.id.clone());
        db.insert_contact(&c).await.unwrap();
        db.insert_contact(&Contact::new("Solo", "solo@x.com")).await.unwrap();

        let ts = Utc.with_ymd_and_hms(2024, 1, 20, 12, 0, 0).unwrap();
        db.update_contact_last_chat(&c.id, ts).await.unwrap();

        let members = db.contacts_for_company(&company.id).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].last_chat, Some(ts));

        db.update_company_last_chat(&company.id, ts).await.unwrap();
        let fetched = db.get_company(&company.id).await.unwrap().unwrap();
        assert_eq!(fetched.last_chat, Some(ts));
        assert_eq!(fetched.domain.as_deref(), Some("acme.io"));
    }

    #[tokio::test]
    async fn update_missing_contact_is_not_found() {
        let db = test_db().await;
        let err = db
            .update_contact_last_chat("nope", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    // ── Activity tests ──────────────────────────────────────────────

    #[tokio::test]
    async fn activity_upsert_keyed_by_email() {
        let db = test_db().await;
        let mut activity = Activity {
            id: "a1".into(),
            contact_id: "c1".into(),
            company_id: None,
            email_id: "e1".into(),
            description: "Pricing question".into(),
            next_step: "Reply".into(),
            priority: ActivityPriority::Normal,
            created_at: Utc::now(),
        };
        db.upsert_activity(&activity).await.unwrap();

        activity.id = "a2".into();
        activity.priority = ActivityPriority::High;
        db.upsert_activity(&activity).await.unwrap();

        let fetched = db.activity_for_email("e1").await.unwrap().unwrap();
        assert_eq!(fetched.id, "a1");
        assert_eq!(fetched.priority, ActivityPriority::High);
    }

    #[tokio::test]
    async fn local_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("triage.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.upsert_decision(&make_decision("e1", KeyPoint::Review, 2))
                .await
                .unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.get_decision("e1").await.unwrap().is_some());
    }
}
