//! Correspondence resolver: backfills `last_chat` from mail history.
//!
//! Pass 1 walks contacts in fixed-size batches with a stagger before each
//! contact and a pause between batches. Pass 2 rolls contact timestamps up
//! to their companies. Neither pass ever moves a timestamp backwards, and
//! a failing item is counted as skipped without stopping the pass.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ResolverConfig;
use crate::crm::{Company, Contact};
use crate::error::{DatabaseError, Error};
use crate::mail::{MailQuery, MailTransport};
use crate::pacing::{PaceKind, Pacer};
use crate::store::Database;

/// Counts for one pass. `updated + skipped == total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassStats {
    pub updated: usize,
    pub total: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolverReport {
    pub contacts: PassStats,
    pub companies: PassStats,
}

pub struct CorrespondenceResolver {
    db: Arc<dyn Database>,
    mail: Arc<dyn MailTransport>,
    pacer: Arc<dyn Pacer>,
    config: ResolverConfig,
}

impl CorrespondenceResolver {
    pub fn new(
        config: ResolverConfig,
        db: Arc<dyn Database>,
        mail: Arc<dyn MailTransport>,
        pacer: Arc<dyn Pacer>,
    ) -> Self {
        Self {
            db,
            mail,
            pacer,
            config,
        }
    }

    /// Run both passes. Fails only if a table cannot be listed.
    pub async fn run(&self) -> Result<ResolverReport, DatabaseError> {
        let contacts = self.resolve_contacts().await?;
        let companies = self.resolve_companies().await?;
        info!(
            contacts_updated = contacts.updated,
            contacts_total = contacts.total,
            companies_updated = companies.updated,
            companies_total = companies.total,
            "Correspondence resolver finished"
        );
        Ok(ResolverReport {
            contacts,
            companies,
        })
    }

    /// Pass 1: newest message per contact address.
    pub async fn resolve_contacts(&self) -> Result<PassStats, DatabaseError> {
        let contacts = self.db.contacts_with_email().await?;
        let mut stats = PassStats {
            total: contacts.len(),
            ..PassStats::default()
        };
        let batch_size = self.config.batch_size.max(1);
        info!(total = stats.total, batch_size, "Resolving contact last_chat");

        for (batch_index, batch) in contacts.chunks(batch_size).enumerate() {
            if batch_index > 0 {
                self.pacer.pause(PaceKind::BatchPause).await;
            }
            for contact in batch {
                self.pacer.pause(PaceKind::Stagger).await;
                match self.resolve_contact(contact).await {
                    Ok(true) => stats.updated += 1,
                    Ok(false) => stats.skipped += 1,
                    Err(e) => {
                        warn!(contact_id = %contact.id, error = %e, "Skipping contact");
                        stats.skipped += 1;
                    }
                }
            }
        }
        Ok(stats)
    }

    /// Returns whether the contact was updated.
    async fn resolve_contact(&self, contact: &Contact) -> Result<bool, Error> {
        let query = MailQuery::Involving(contact.email.trim().to_string());
        let newest = self
            .mail
            .search(&query, 1)
            .await?
            .into_iter()
            .map(|e| e.date)
            .max();

        let Some(newest) = newest else {
            debug!(contact_id = %contact.id, "No correspondence found");
            return Ok(false);
        };
        if !is_newer(newest, contact.last_chat) {
            return Ok(false);
        }
        self.db.update_contact_last_chat(&contact.id, newest).await?;
        debug!(contact_id = %contact.id, last_chat = %newest, "Contact last_chat updated");
        Ok(true)
    }

    /// Pass 2: company `last_chat` = max over its contacts.
    pub async fn resolve_companies(&self) -> Result<PassStats, DatabaseError> {
        let companies = self.db.list_companies().await?;
        let mut stats = PassStats {
            total: companies.len(),
            ..PassStats::default()
        };

        for company in &companies {
            match self.resolve_company(company).await {
                Ok(true) => stats.updated += 1,
                Ok(false) => stats.skipped += 1,
                Err(e) => {
                    warn!(company_id = %company.id, error = %e, "Skipping company");
                    stats.skipped += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn resolve_company(&self, company: &Company) -> Result<bool, DatabaseError> {
        let latest = self
            .db
            .contacts_for_company(&company.id)
            .await?
            .into_iter()
            .filter_map(|c| c.last_chat)
            .max();

        match latest {
            Some(latest) if is_newer(latest, company.last_chat) => {
                self.db.update_company_last_chat(&company.id, latest).await?;
                debug!(company_id = %company.id, last_chat = %latest, "Company last_chat updated");
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn is_newer(candidate: DateTime<Utc>, stored: Option<DateTime<Utc>>) -> bool {
    stored.is_none_or(|s| candidate > s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use chrono::TimeZone;

    use crate::error::MailError;
    use crate::mail::{BusyInterval, Email};
    use crate::pacing::RecordingPacer;
    use crate::store::LibSqlBackend;

    /// Mail history keyed by address; addresses in `broken` error out.
    #[derive(Default)]
    struct HistoryMail {
        newest: HashMap<String, DateTime<Utc>>,
        broken: Vec<String>,
    }

    #[async_trait]
    impl MailTransport for HistoryMail {
        async fn fetch_recent(&self, _n: usize) -> Result<Vec<Email>, MailError> {
            Ok(vec![])
        }
        async fn search(&self, query: &MailQuery, _max: usize) -> Result<Vec<Email>, MailError> {
            let MailQuery::Involving(addr) = query else {
                return Ok(vec![]);
            };
            if self.broken.contains(addr) {
                return Err(MailError::Command {
                    command: "UID SEARCH".into(),
                    reason: "BAD".into(),
                });
            }
            Ok(self
                .newest
                .get(addr)
                .map(|d| vec![Email::new("x", addr.as_str(), "hi", *d, "")])
                .unwrap_or_default())
        }
        async fn archive(&self, _id: &str) -> Result<(), MailError> {
            Ok(())
        }
        async fn create_draft(&self, _to: &str, _s: &str, _b: &str) -> Result<Option<String>, MailError> {
            Ok(None)
        }
        async fn busy_intervals(&self, _days: u32) -> Result<Vec<BusyInterval>, MailError> {
            Ok(vec![])
        }
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 12, 0, 0).unwrap()
    }

    fn resolver(db: Arc<LibSqlBackend>, mail: HistoryMail, pacer: Arc<RecordingPacer>) -> CorrespondenceResolver {
        CorrespondenceResolver::new(ResolverConfig::default(), db, Arc::new(mail), pacer)
    }

    #[tokio::test]
    async fn seven_contacts_make_two_batches() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        for i in 0..7 {
            db.insert_contact(&Contact::new(format!("C{i}"), format!("c{i}@x.com")))
                .await
                .unwrap();
        }
        let pacer = Arc::new(RecordingPacer::new());
        let stats = resolver(db, HistoryMail::default(), pacer.clone())
            .resolve_contacts()
            .await
            .unwrap();

        use PaceKind::*;
        assert_eq!(
            pacer.calls(),
            vec![
                Stagger, Stagger, Stagger, Stagger, Stagger,
                BatchPause,
                Stagger, Stagger,
            ]
        );
        assert_eq!(stats.total, 7);
        assert_eq!(stats.skipped, 7);
    }

    #[tokio::test]
    async fn only_strictly_newer_updates() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let stale = Contact::new("Stale", "stale@x.com").with_last_chat(day(20));
        let fresh = Contact::new("Fresh", "fresh@x.com").with_last_chat(day(10));
        let never = Contact::new("Never", "never@x.com");
        let equal = Contact::new("Equal", "equal@x.com").with_last_chat(day(12));
        for c in [&stale, &fresh, &never, &equal] {
            db.insert_contact(c).await.unwrap();
        }

        let mail = HistoryMail {
            newest: HashMap::from([
                ("stale@x.com".to_string(), day(15)),
                ("fresh@x.com".to_string(), day(18)),
                ("never@x.com".to_string(), day(3)),
                ("equal@x.com".to_string(), day(12)),
            ]),
            broken: vec![],
        };
        let stats = resolver(db.clone(), mail, Arc::new(RecordingPacer::new()))
            .resolve_contacts()
            .await
            .unwrap();

        assert_eq!(stats, PassStats { updated: 2, total: 4, skipped: 2 });
        assert_eq!(db.get_contact(&stale.id).await.unwrap().unwrap().last_chat, Some(day(20)));
        assert_eq!(db.get_contact(&fresh.id).await.unwrap().unwrap().last_chat, Some(day(18)));
        assert_eq!(db.get_contact(&never.id).await.unwrap().unwrap().last_chat, Some(day(3)));
        assert_eq!(db.get_contact(&equal.id).await.unwrap().unwrap().last_chat, Some(day(12)));
    }

    #[tokio::test]
    async fn search_errors_are_skipped() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.insert_contact(&Contact::new("Broken", "broken@x.com")).await.unwrap();
        db.insert_contact(&Contact::new("Ok", "ok@x.com")).await.unwrap();

        let mail = HistoryMail {
            newest: HashMap::from([("ok@x.com".to_string(), day(5))]),
            broken: vec!["broken@x.com".into()],
        };
        let stats = resolver(db, mail, Arc::new(RecordingPacer::new()))
            .resolve_contacts()
            .await
            .unwrap();
        assert_eq!(stats, PassStats { updated: 1, total: 2, skipped: 1 });
    }

    #[tokio::test]
    async fn company_takes_max_of_contacts() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let acme = Company::new("Acme");
        let empty = Company::new("Empty");
        db.insert_company(&acme).await.unwrap();
        db.insert_company(&empty).await.unwrap();
        db.insert_contact(&Contact::new("A", "a@acme.io").with_company(acme.id.clone()).with_last_chat(day(15)))
            .await
            .unwrap();
        db.insert_contact(&Contact::new("B", "b@acme.io").with_company(acme.id.clone()).with_last_chat(day(20)))
            .await
            .unwrap();

        let stats = resolver(db.clone(), HistoryMail::default(), Arc::new(RecordingPacer::new()))
            .resolve_companies()
            .await
            .unwrap();

        assert_eq!(stats, PassStats { updated: 1, total: 2, skipped: 1 });
        assert_eq!(db.get_company(&acme.id).await.unwrap().unwrap().last_chat, Some(day(20)));
        assert_eq!(db.get_company(&empty.id).await.unwrap().unwrap().last_chat, None);
    }

    #[tokio::test]
    async fn company_never_moves_backwards() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mut acme = Company::new("Acme");
        acme.last_chat = Some(day(25));
        db.insert_company(&acme).await.unwrap();
        db.insert_contact(&Contact::new("A", "a@acme.io").with_company(acme.id.clone()).with_last_chat(day(20)))
            .await
            .unwrap();

        let report = resolver(db.clone(), HistoryMail::default(), Arc::new(RecordingPacer::new()))
            .run()
            .await
            .unwrap();
        assert_eq!(report.companies.updated, 0);
        assert_eq!(db.get_company(&acme.id).await.unwrap().unwrap().last_chat, Some(day(25)));
    }
}
