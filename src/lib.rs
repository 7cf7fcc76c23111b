//! Inbox Triage: email triage with confidence-gated automation, plus a
//! correspondence resolver that keeps CRM `last_chat` fields current.

pub mod clock;
pub mod config;
pub mod crm;
pub mod error;
pub mod llm;
pub mod mail;
pub mod pacing;
pub mod resolver;
pub mod store;
pub mod triage;
