//! CRM entities touched by triage and the correspondence resolver.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A known contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: String,
    /// Empty when unknown.
    pub email: String,
    pub company_id: Option<String>,
    /// Most recent correspondence. Never decreased by the resolver.
    pub last_chat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Contact {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            email: email.into(),
            company_id: None,
            last_chat: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_company(mut self, company_id: impl Into<String>) -> Self {
        self.company_id = Some(company_id.into());
        self
    }

    pub fn with_last_chat(mut self, last_chat: DateTime<Utc>) -> Self {
        self.last_chat = Some(last_chat);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// A company. `last_chat` is the max over its contacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub id: String,
    pub name: String,
    pub domain: Option<String>,
    pub last_chat: Option<DateTime<Utc>>,
}

impl Company {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            domain: None,
            last_chat: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }
}

/// Activity priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityPriority {
    High = 1,
    Normal = 2,
}

impl ActivityPriority {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Self {
        if value == 1 { Self::High } else { Self::Normal }
    }
}

/// A CRM activity logged from a triaged email. One per email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub contact_id: String,
    pub company_id: Option<String>,
    pub email_id: String,
    pub description: String,
    pub next_step: String,
    pub priority: ActivityPriority,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_numbers() {
        assert_eq!(ActivityPriority::High.as_i64(), 1);
        assert_eq!(ActivityPriority::Normal.as_i64(), 2);
        assert_eq!(ActivityPriority::from_i64(1), ActivityPriority::High);
        assert_eq!(ActivityPriority::from_i64(7), ActivityPriority::Normal);
    }
}
