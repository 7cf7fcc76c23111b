//! IMAP mail transport: raw IMAP over rustls, drafts built with lettre.
//!
//! Each operation opens a short-lived session on a blocking thread
//! (`spawn_blocking`), runs its commands, and logs out. Message ids are
//! `"{mailbox}:{uid}"` so archive can find the message again.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::MailError;
use crate::mail::ics::IcsCalendar;
use crate::mail::{BusyInterval, Email, MailQuery, MailTransport};

const INBOX: &str = "INBOX";

// ── Configuration ───────────────────────────────────────────────────

/// IMAP transport configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub archive_mailbox: String,
    pub drafts_mailbox: String,
    /// Mailboxes scanned by `search` (inbox and sent, typically).
    pub search_mailboxes: Vec<String>,
    /// Published iCalendar feed used for busy intervals.
    pub calendar_url: Option<String>,
    pub timezone: Tz,
}

impl ImapConfig {
    /// Build config from environment variables.
    /// Returns `None` if `EMAIL_IMAP_HOST` is not set.
    pub fn from_env(timezone: Tz) -> Option<Self> {
        let imap_host = std::env::var("EMAIL_IMAP_HOST").ok()?;

        let imap_port: u16 = std::env::var("EMAIL_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default());
        let from_address = std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        let archive_mailbox =
            std::env::var("EMAIL_ARCHIVE_MAILBOX").unwrap_or_else(|_| "Archive".to_string());
        let drafts_mailbox =
            std::env::var("EMAIL_DRAFTS_MAILBOX").unwrap_or_else(|_| "Drafts".to_string());

        let search_mailboxes: Vec<String> = std::env::var("EMAIL_SEARCH_MAILBOXES")
            .unwrap_or_else(|_| "INBOX,Sent".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let calendar_url = std::env::var("CALENDAR_ICS_URL").ok().filter(|s| !s.is_empty());

        Some(Self {
            imap_host,
            imap_port,
            username,
            password,
            from_address,
            archive_mailbox,
            drafts_mailbox,
            search_mailboxes,
            calendar_url,
            timezone,
        })
    }
}

// ── Transport ───────────────────────────────────────────────────────

/// IMAP-backed `MailTransport`.
pub struct ImapMailTransport {
    config: ImapConfig,
    calendar: Option<IcsCalendar>,
    clock: Arc<dyn Clock>,
}

impl ImapMailTransport {
    pub fn new(config: ImapConfig) -> Self {
        let calendar = config
            .calendar_url
            .as_ref()
            .map(|url| IcsCalendar::new(url.clone(), config.timezone));
        Self {
            config,
            calendar,
            clock: Arc::new(SystemClock),
        }
    }

    /// Clock that anchors the calendar window.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run a blocking session closure on the blocking pool.
    async fn with_session<T, F>(&self, f: F) -> Result<T, MailError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession, &ImapConfig) -> Result<T, MailError> + Send + 'static,
    {
        let cfg = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::connect(&cfg)?;
            let result = f(&mut session, &cfg);
            session.logout();
            result
        })
        .await
        .map_err(|e| MailError::Command {
            command: "session".into(),
            reason: format!("IMAP task panicked: {e}"),
        })?
    }
}

#[async_trait]
impl MailTransport for ImapMailTransport {
    async fn fetch_recent(&self, n: usize) -> Result<Vec<Email>, MailError> {
        let mut emails = self
            .with_session(move |session, _| {
                session.select(INBOX)?;
                let uids = session.uid_search("ALL")?;
                let start = uids.len().saturating_sub(n);
                let mut emails = Vec::new();
                for uid in &uids[start..] {
                    if let Some(email) = session.fetch_email(INBOX, *uid)? {
                        emails.push(email);
                    }
                }
                Ok(emails)
            })
            .await?;
        emails.sort_by(|a, b| b.date.cmp(&a.date));
        info!(count = emails.len(), "Fetched recent emails");
        Ok(emails)
    }

    async fn search(&self, query: &MailQuery, max_results: usize) -> Result<Vec<Email>, MailError> {
        let criteria = search_criteria(query);
        let mut emails = self
            .with_session(move |session, cfg| {
                let mut found = Vec::new();
                for mailbox in &cfg.search_mailboxes {
                    if let Err(e) = session.select(mailbox) {
                        warn!(mailbox = %mailbox, error = %e, "Skipping unselectable mailbox");
                        continue;
                    }
                    let uids = session.uid_search(&criteria)?;
                    let start = uids.len().saturating_sub(max_results);
                    for uid in &uids[start..] {
                        if let Some(email) = session.fetch_email(mailbox, *uid)? {
                            found.push(email);
                        }
                    }
                }
                Ok(found)
            })
            .await?;
        emails.sort_by(|a, b| b.date.cmp(&a.date));
        emails.truncate(max_results);
        debug!(?query, hits = emails.len(), "Mail search complete");
        Ok(emails)
    }

    async fn archive(&self, id: &str) -> Result<(), MailError> {
        let (mailbox, uid) = parse_message_id(id)?;
        self.with_session(move |session, cfg| {
            session.select(&mailbox)?;
            let target = quote(&cfg.archive_mailbox);
            if session.command(&format!("UID MOVE {uid} {target}")).is_ok() {
                return Ok(());
            }
            // Servers without MOVE: copy, flag deleted, expunge.
            session.command(&format!("UID COPY {uid} {target}"))?;
            session.command(&format!("UID STORE {uid} +FLAGS (\\Deleted)"))?;
            session.command(&format!("UID EXPUNGE {uid}"))?;
            Ok(())
        })
        .await?;
        info!(id, "Email archived");
        Ok(())
    }

    async fn create_draft(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<Option<String>, MailError> {
        let raw = build_draft(&self.config.from_address, to, subject, body)?;
        let draft_id = self
            .with_session(move |session, cfg| session.append(&cfg.drafts_mailbox, &raw))
            .await?;
        info!(to, draft_id = draft_id.as_deref().unwrap_or("unknown"), "Draft created");
        Ok(draft_id)
    }

    async fn busy_intervals(&self, window_days: u32) -> Result<Vec<BusyInterval>, MailError> {
        match &self.calendar {
            Some(calendar) => calendar.busy_intervals(self.clock.now(), window_days).await,
            None => Err(MailError::Unsupported(
                "no calendar feed configured (CALENDAR_ICS_URL)".into(),
            )),
        }
    }
}

// ── IMAP session ────────────────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Lines of an IMAP response plus any literals that arrived with it.
#[derive(Debug, Default)]
struct ImapResponse {
    lines: Vec<String>,
    literals: Vec<Vec<u8>>,
}

/// One authenticated IMAP connection.
struct ImapSession {
    tls: TlsStream,
    tag: u32,
}

impl ImapSession {
    fn connect(config: &ImapConfig) -> Result<Self, MailError> {
        let conn_err = |reason: String| MailError::Connection {
            host: config.imap_host.clone(),
            reason,
        };

        let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))?;
        tcp.set_read_timeout(Some(Duration::from_secs(30)))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(config.imap_host.clone())
            .map_err(|e| conn_err(format!("invalid server name: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| conn_err(format!("TLS setup failed: {e}")))?;

        let mut session = Self {
            tls: rustls::StreamOwned::new(conn, tcp),
            tag: 0,
        };

        let _greeting = session.read_line()?;

        session
            .command(&format!(
                "LOGIN {} {}",
                quote(&config.username),
                quote(config.password.expose_secret())
            ))
            .map_err(|_| MailError::AuthFailed {
                username: config.username.clone(),
            })?;

        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, MailError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.tls.read(&mut byte) {
                Ok(0) => {
                    return Err(MailError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "IMAP connection closed",
                    )));
                }
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read_literal(&mut self, size: usize) -> Result<Vec<u8>, MailError> {
        let mut buf = vec![0u8; size];
        self.tls.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn next_tag(&mut self) -> String {
        self.tag += 1;
        format!("A{}", self.tag)
    }

    /// Read until the tagged completion line, collecting literals.
    fn read_response(&mut self, tag: &str, command: &str) -> Result<ImapResponse, MailError> {
        let mut response = ImapResponse::default();
        loop {
            let line = self.read_line()?;
            if let Some(size) = literal_size(&line) {
                let literal = self.read_literal(size)?;
                response.literals.push(literal);
            }
            let done = line.starts_with(tag);
            response.lines.push(line);
            if done {
                break;
            }
        }

        let status_ok = response
            .lines
            .last()
            .is_some_and(|l| l[tag.len()..].trim_start().starts_with("OK"));
        if status_ok {
            Ok(response)
        } else {
            Err(MailError::Command {
                command: command_name(command),
                reason: response.lines.last().cloned().unwrap_or_default().trim().to_string(),
            })
        }
    }

    fn command(&mut self, cmd: &str) -> Result<ImapResponse, MailError> {
        let tag = self.next_tag();
        let full = format!("{tag} {cmd}\r\n");
        self.tls.write_all(full.as_bytes())?;
        self.tls.flush()?;
        self.read_response(&tag, cmd)
    }

    fn select(&mut self, mailbox: &str) -> Result<(), MailError> {
        self.command(&format!("SELECT {}", quote(mailbox)))?;
        Ok(())
    }

    fn uid_search(&mut self, criteria: &str) -> Result<Vec<u32>, MailError> {
        let resp = self.command(&format!("UID SEARCH {criteria}"))?;
        let mut uids: Vec<u32> = resp
            .lines
            .iter()
            .filter(|l| l.starts_with("* SEARCH"))
            .flat_map(|l| l.split_whitespace().skip(2))
            .filter_map(|s| s.parse().ok())
            .collect();
        uids.sort_unstable();
        Ok(uids)
    }

    fn fetch_email(&mut self, mailbox: &str, uid: u32) -> Result<Option<Email>, MailError> {
        let resp = self.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        let Some(raw) = resp.literals.first() else {
            return Ok(None);
        };
        Ok(parse_email(&format!("{mailbox}:{uid}"), raw))
    }

    /// APPEND a message as a draft. Returns `"{mailbox}:{uid}"` if the server
    /// supports UIDPLUS.
    fn append(&mut self, mailbox: &str, raw: &[u8]) -> Result<Option<String>, MailError> {
        let tag = self.next_tag();
        let cmd = format!(
            "APPEND {} (\\Draft \\Seen) {{{}}}",
            quote(mailbox),
            raw.len()
        );
        self.tls.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        self.tls.flush()?;

        let continuation = self.read_line()?;
        if !continuation.starts_with('+') {
            return Err(MailError::Command {
                command: "APPEND".into(),
                reason: continuation.trim().to_string(),
            });
        }
        self.tls.write_all(raw)?;
        self.tls.write_all(b"\r\n")?;
        self.tls.flush()?;

        let resp = self.read_response(&tag, &cmd)?;
        Ok(resp
            .lines
            .last()
            .and_then(|l| parse_append_uid(l))
            .map(|uid| format!("{mailbox}:{uid}")))
    }

    fn logout(&mut self) {
        let _ = self.command("LOGOUT");
    }
}

// ── Helpers (public for testing) ────────────────────────────────────

/// Quote an IMAP string argument.
pub fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// IMAP SEARCH criteria for a query.
pub fn search_criteria(query: &MailQuery) -> String {
    match query {
        MailQuery::Involving(addr) => format!("OR FROM {} TO {}", quote(addr), quote(addr)),
        MailQuery::From(addr) => format!("FROM {}", quote(addr)),
        MailQuery::Text(text) => format!("TEXT {}", quote(text)),
    }
}

/// Split `"{mailbox}:{uid}"`; a bare uid refers to the inbox.
pub fn parse_message_id(id: &str) -> Result<(String, u32), MailError> {
    let (mailbox, uid) = id.rsplit_once(':').unwrap_or((INBOX, id));
    let uid = uid.parse().map_err(|_| MailError::NotFound { id: id.to_string() })?;
    Ok((mailbox.to_string(), uid))
}

/// `{123}` at the end of a line announces a literal of 123 bytes.
fn literal_size(line: &str) -> Option<usize> {
    let trimmed = line.trim_end();
    let inner = trimmed.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].parse().ok()
}

/// `A5 OK [APPENDUID 38505 3955] APPEND completed` → 3955.
fn parse_append_uid(line: &str) -> Option<u32> {
    let start = line.find("[APPENDUID ")?;
    let rest = &line[start + 11..];
    let end = rest.find(']')?;
    rest[..end].split_whitespace().nth(1)?.parse().ok()
}

fn command_name(cmd: &str) -> String {
    let mut parts = cmd.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("UID"), Some(sub)) => format!("UID {sub}"),
        (Some(first), _) => first.to_string(),
        _ => String::new(),
    }
}

/// Build an RFC 5322 draft message.
pub fn build_draft(from: &str, to: &str, subject: &str, body: &str) -> Result<Vec<u8>, MailError> {
    let message = lettre::Message::builder()
        .from(from.parse().map_err(|e| MailError::InvalidAddress {
            address: from.to_string(),
            reason: format!("{e}"),
        })?)
        .to(to.parse().map_err(|e| MailError::InvalidAddress {
            address: to.to_string(),
            reason: format!("{e}"),
        })?)
        .subject(subject)
        .body(body.to_string())
        .map_err(|e| MailError::Command {
            command: "APPEND".into(),
            reason: format!("failed to build draft: {e}"),
        })?;
    Ok(message.formatted())
}

/// Parse a raw RFC 5322 message into an `Email`.
pub fn parse_email(id: &str, raw: &[u8]) -> Option<Email> {
    let parsed = MessageParser::default().parse(raw)?;

    let from = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into());

    let to: Vec<String> = parsed
        .to()
        .map(|addr| {
            addr.iter()
                .filter_map(|a| a.address())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();

    let subject = parsed.subject().unwrap_or("(no subject)").to_string();

    let date = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    // body_text converts an HTML-only body to plain text
    let body = if let Some(text) = parsed.body_text(0) {
        text.to_string()
    } else {
        parsed
            .attachments()
            .find_map(|part| {
                let is_text = MimeHeaders::content_type(part).is_some_and(|ct| ct.ctype() == "text");
                if is_text {
                    std::str::from_utf8(part.contents()).ok().map(str::to_string)
                } else {
                    None
                }
            })
            .unwrap_or_default()
    };

    Some(Email::new(id, from, subject, date, &body).with_to(to))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const RAW: &str = "From: Alice <alice@acme.io>\r\n\
To: me@example.com, cc@example.com\r\n\
Subject: Quarterly review\r\n\
Date: Mon, 15 Jan 2024 10:30:00 +0000\r\n\
Message-ID: <abc@acme.io>\r\n\
\r\n\
Can we schedule a meeting next week?\r\n";

    #[test]
    fn parse_email_extracts_fields() {
        let email = parse_email("INBOX:42", RAW.as_bytes()).unwrap();
        assert_eq!(email.id, "INBOX:42");
        assert_eq!(email.from, "alice@acme.io");
        assert_eq!(email.to, vec!["me@example.com", "cc@example.com"]);
        assert_eq!(email.subject, "Quarterly review");
        assert_eq!(email.date, Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap());
        assert!(email.body.contains("schedule a meeting"));
    }

    #[test]
    fn search_criteria_quotes_addresses() {
        assert_eq!(
            search_criteria(&MailQuery::Involving("bob@x.com".into())),
            "OR FROM \"bob@x.com\" TO \"bob@x.com\""
        );
        assert_eq!(search_criteria(&MailQuery::Text("say \"hi\"".into())), "TEXT \"say \\\"hi\\\"\"");
    }

    #[test]
    fn message_id_round_trip() {
        assert_eq!(parse_message_id("Sent:17").unwrap(), ("Sent".to_string(), 17));
        assert_eq!(parse_message_id("99").unwrap(), ("INBOX".to_string(), 99));
        assert_eq!(
            parse_message_id("[Gmail]/All Mail:5").unwrap(),
            ("[Gmail]/All Mail".to_string(), 5)
        );
        assert!(parse_message_id("INBOX:abc").is_err());
    }

    #[test]
    fn literal_size_detection() {
        assert_eq!(literal_size("* 1 FETCH (UID 4 BODY[] {1234}\r\n"), Some(1234));
        assert_eq!(literal_size("* 1 FETCH (FLAGS (\\Seen))\r\n"), None);
    }

    #[test]
    fn append_uid_parsing() {
        assert_eq!(parse_append_uid("A5 OK [APPENDUID 38505 3955] APPEND completed"), Some(3955));
        assert_eq!(parse_append_uid("A5 OK APPEND completed"), None);
    }

    #[test]
    fn command_names() {
        assert_eq!(command_name("UID MOVE 4 \"Archive\""), "UID MOVE");
        assert_eq!(command_name("SELECT \"INBOX\""), "SELECT");
    }

    #[test]
    fn draft_contains_headers_and_body() {
        let raw = build_draft("me@example.com", "bob@x.com", "Re: hi", "Sounds good").unwrap();
        let text = String::from_utf8(raw).unwrap();
        assert!(text.contains("To: bob@x.com"));
        assert!(text.contains("Subject: Re: hi"));
        assert!(text.contains("Sounds good"));
    }

    #[test]
    fn draft_rejects_bad_address() {
        let err = build_draft("me@example.com", "not an address", "x", "y").unwrap_err();
        assert!(matches!(err, MailError::InvalidAddress { .. }));
    }

    #[test]
    fn html_only_body_becomes_text() {
        let raw = "From: alice@acme.io\r\n\
Subject: Newsletter\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<div><b>Bold</b> and <i>italic</i></div>\r\n";
        let email = parse_email("INBOX:1", raw.as_bytes()).unwrap();
        assert!(email.body.contains("Bold"));
        assert!(email.body.contains("italic"));
        assert!(!email.body.contains('<'));
    }

    #[test]
    fn calendar_window_follows_injected_clock() {
        let fixed = Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap();
        let config = ImapConfig {
            imap_host: "imap.example.com".into(),
            imap_port: 993,
            username: "me".into(),
            password: SecretString::from("pw"),
            from_address: "me@example.com".into(),
            archive_mailbox: "Archive".into(),
            drafts_mailbox: "Drafts".into(),
            search_mailboxes: vec![INBOX.into()],
            calendar_url: None,
            timezone: chrono_tz::UTC,
        };
        let transport =
            ImapMailTransport::new(config).with_clock(Arc::new(crate::clock::FixedClock(fixed)));
        assert_eq!(transport.clock.now(), fixed);
    }
}
