//! iCalendar feed reader: busy intervals from a published `.ics` URL.
//!
//! Only what busy-time computation needs: `VEVENT` start/end, all-day
//! detection, and skipping cancelled or transparent (free) events.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::debug;

use crate::error::MailError;
use crate::mail::BusyInterval;

/// A published calendar feed.
pub struct IcsCalendar {
    client: reqwest::Client,
    url: String,
    /// Zone for floating (zone-less) local times.
    default_tz: Tz,
}

impl IcsCalendar {
    pub fn new(url: impl Into<String>, default_tz: Tz) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            default_tz,
        }
    }

    /// Fetch the feed and return intervals overlapping `[now, now + window_days)`.
    pub async fn busy_intervals(
        &self,
        now: DateTime<Utc>,
        window_days: u32,
    ) -> Result<Vec<BusyInterval>, MailError> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| MailError::Calendar(format!("fetch failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(MailError::Calendar(format!("HTTP {}", resp.status())));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| MailError::Calendar(format!("read failed: {e}")))?;

        let window_end = now + Duration::days(i64::from(window_days));
        let intervals: Vec<BusyInterval> = parse_ics(&body, self.default_tz)
            .into_iter()
            .filter(|i| i.end > now && i.start < window_end)
            .collect();
        debug!(count = intervals.len(), window_days, "Calendar feed parsed");
        Ok(intervals)
    }
}

/// Unfold RFC 5545 continuation lines.
fn unfold(raw: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix(' ').or_else(|| line.strip_prefix('\t')) {
            if let Some(last) = lines.last_mut() {
                last.push_str(rest);
                continue;
            }
        }
        lines.push(line.to_string());
    }
    lines
}

/// A parsed DTSTART/DTEND value.
#[derive(Debug, Clone, Copy)]
enum IcsTime {
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
}

fn parse_time(params: &str, value: &str, default_tz: Tz) -> Option<IcsTime> {
    let value = value.trim();
    if (params.contains("VALUE=DATE") && !params.contains("VALUE=DATE-TIME")) || value.len() == 8 {
        return NaiveDate::parse_from_str(value, "%Y%m%d")
            .ok()
            .map(IcsTime::Date);
    }
    if let Some(utc) = value.strip_suffix('Z') {
        return NaiveDateTime::parse_from_str(utc, "%Y%m%dT%H%M%S")
            .ok()
            .map(|n| IcsTime::DateTime(n.and_utc()));
    }
    let naive = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S").ok()?;
    let tz = params
        .split(';')
        .find_map(|p| p.strip_prefix("TZID="))
        .and_then(|id| id.trim_matches('"').parse::<Tz>().ok())
        .unwrap_or(default_tz);
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| IcsTime::DateTime(dt.with_timezone(&Utc)))
}

/// Parse all busy `VEVENT`s in a calendar body.
pub fn parse_ics(raw: &str, default_tz: Tz) -> Vec<BusyInterval> {
    let mut intervals = Vec::new();
    let mut in_event = false;
    let mut start: Option<IcsTime> = None;
    let mut end: Option<IcsTime> = None;
    let mut skip = false;

    for line in unfold(raw) {
        if line == "BEGIN:VEVENT" {
            in_event = true;
            start = None;
            end = None;
            skip = false;
            continue;
        }
        if line == "END:VEVENT" {
            in_event = false;
            if !skip && let Some(interval) = to_interval(start, end) {
                intervals.push(interval);
            }
            continue;
        }
        if !in_event {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let (name, params) = key.split_once(';').unwrap_or((key, ""));
        match name {
            "DTSTART" => start = parse_time(params, value, default_tz),
            "DTEND" => end = parse_time(params, value, default_tz),
            "STATUS" if value.eq_ignore_ascii_case("CANCELLED") => skip = true,
            "TRANSP" if value.eq_ignore_ascii_case("TRANSPARENT") => skip = true,
            _ => {}
        }
    }

    intervals.sort_by_key(|i| i.start);
    intervals
}

fn to_interval(start: Option<IcsTime>, end: Option<IcsTime>) -> Option<BusyInterval> {
    match (start?, end) {
        (IcsTime::Date(s), e) => {
            let e = match e {
                Some(IcsTime::Date(d)) => d,
                Some(IcsTime::DateTime(dt)) => dt.date_naive(),
                None => s + Duration::days(1),
            };
            Some(BusyInterval {
                start: s.and_hms_opt(0, 0, 0)?.and_utc(),
                end: e.and_hms_opt(0, 0, 0)?.and_utc(),
                all_day: true,
            })
        }
        (IcsTime::DateTime(s), e) => {
            let e = match e {
                Some(IcsTime::DateTime(dt)) => dt,
                Some(IcsTime::Date(d)) => d.and_hms_opt(0, 0, 0)?.and_utc(),
                None => s,
            };
            Some(BusyInterval {
                start: s,
                end: e.max(s),
                all_day: false,
            })
        }
    }
}
