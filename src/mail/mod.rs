//! Mail transport: the collaborator both triage and the resolver talk to.
//!
//! `MailTransport` is pure I/O. Triage decisions and pacing live elsewhere.

pub mod ics;
pub mod imap;

pub use imap::{ImapConfig, ImapMailTransport};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MailError;

/// Maximum body characters kept on a fetched email.
pub const MAX_BODY_CHARS: usize = 2000;

/// Snippet length used for previews and prompts.
pub const SNIPPET_CHARS: usize = 200;

/// A fetched email. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    /// Transport-specific id (used for archive).
    pub id: String,
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    pub subject: String,
    pub date: DateTime<Utc>,
    pub snippet: String,
    /// Body text, truncated to `MAX_BODY_CHARS`.
    pub body: String,
}

impl Email {
    /// Build an email, deriving the snippet and truncating the body.
    pub fn new(
        id: impl Into<String>,
        from: impl Into<String>,
        subject: impl Into<String>,
        date: DateTime<Utc>,
        body: &str,
    ) -> Self {
        let body: String = body.chars().take(MAX_BODY_CHARS).collect();
        let snippet = body
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .chars()
            .take(SNIPPET_CHARS)
            .collect();
        Self {
            id: id.into(),
            from: from.into(),
            to: Vec::new(),
            subject: subject.into(),
            date,
            snippet,
            body,
        }
    }

    pub fn with_to(mut self, to: Vec<String>) -> Self {
        self.to = to;
        self
    }

    /// Domain part of the sender address, lowercased.
    pub fn sender_domain(&self) -> Option<String> {
        extract_address(&self.from)
            .rsplit_once('@')
            .map(|(_, domain)| domain.to_lowercase())
            .filter(|d| !d.is_empty())
    }

    /// Bare sender address (strips `Name <addr>` wrapping).
    pub fn sender_address(&self) -> String {
        extract_address(&self.from).to_string()
    }
}

/// Strip a display name: `"Alice <alice@x.com>"` → `"alice@x.com"`.
pub fn extract_address(raw: &str) -> &str {
    match (raw.rfind('<'), raw.rfind('>')) {
        (Some(start), Some(end)) if end > start => raw[start + 1..end].trim(),
        _ => raw.trim(),
    }
}

/// A busy calendar interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusyInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub all_day: bool,
}

/// A mail history query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailQuery {
    /// Messages sent from or to this address.
    Involving(String),
    /// Messages from this sender.
    From(String),
    /// Free-text match on subject/body.
    Text(String),
}

/// Mail transport contract.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Fetch the `n` most recent inbox messages, newest first.
    async fn fetch_recent(&self, n: usize) -> Result<Vec<Email>, MailError>;

    /// Search mail history, newest first, at most `max_results`.
    async fn search(&self, query: &MailQuery, max_results: usize) -> Result<Vec<Email>, MailError>;

    /// Archive a message by id.
    async fn archive(&self, id: &str) -> Result<(), MailError>;

    /// Create a draft. Returns the draft's id if the server reports one.
    async fn create_draft(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<Option<String>, MailError>;

    /// Busy intervals over the next `window_days` days.
    async fn busy_intervals(&self, window_days: u32) -> Result<Vec<BusyInterval>, MailError>;
}
