//! Meeting slot generation from busy intervals.
//!
//! Two views of the same free time:
//! - raw: up to 10 half-hour slots, weekdays 09:00–18:00 local, starting now
//! - structured: 3 windows of 2–3 hours on separate business days, the
//!   first at least 2 business days out
//!
//! Both stay inside the lookahead window the busy data was fetched for.
//!
//! Everything is computed from the caller's `now`, so identical inputs give
//! identical slots.

use std::collections::BTreeSet;

use chrono::{
    DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc,
    Weekday,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::mail::BusyInterval;

const WORKDAY_START_HOUR: u32 = 9;
const WORKDAY_END_HOUR: u32 = 18;
/// After this local hour the rest of today is not offered.
const LATE_CUTOFF_HOUR: u32 = 17;
const SLOT_MINUTES: i64 = 30;
pub const MAX_RAW_SLOTS: usize = 10;
pub const STRUCTURED_SLOT_COUNT: usize = 3;
const MIN_WINDOW_MINUTES: i64 = 120;
const MAX_WINDOW_MINUTES: i64 = 180;
const MIN_BUSINESS_DAYS_AHEAD: u32 = 2;

/// A proposed meeting time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarSlot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// e.g. `Tue, Jan 16 · 10:00 – 10:30` in local time.
    pub label: String,
}

impl CalendarSlot {
    fn new(start: DateTime<Tz>, end: DateTime<Tz>) -> Self {
        Self {
            label: format_label(start, end),
            start: start.with_timezone(&Utc),
            end: end.with_timezone(&Utc),
        }
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }
}

pub fn format_label(start: DateTime<Tz>, end: DateTime<Tz>) -> String {
    format!(
        "{} – {}",
        start.format("%a, %b %-d · %H:%M"),
        end.format("%H:%M")
    )
}

/// Slot generator for one time zone and lookahead window.
#[derive(Debug, Clone)]
pub struct SlotGenerator {
    tz: Tz,
    lookahead_days: u32,
}

impl SlotGenerator {
    pub fn new(tz: Tz, lookahead_days: u32) -> Self {
        Self { tz, lookahead_days }
    }

    /// Up to `MAX_RAW_SLOTS` free half-hour slots inside the lookahead window.
    pub fn available_slots(&self, busy: &[BusyInterval], now: DateTime<Utc>) -> Vec<CalendarSlot> {
        let calendar = BusyCalendar::new(busy, self.tz);
        let local_now = now.with_timezone(&self.tz);
        let today = local_now.date_naive();
        let mut slots = Vec::new();

        for offset in 0..i64::from(self.lookahead_days) {
            let day = today + Duration::days(offset);
            if !calendar.is_workday(day) {
                continue;
            }
            let Some((mut cursor, day_end)) = self.working_hours(day) else {
                continue;
            };
            if day == today {
                if local_now.hour() >= LATE_CUTOFF_HOUR {
                    continue;
                }
                cursor = cursor.max(next_half_hour(local_now));
            }

            let busy_today = calendar.timed_on(day, self.tz);
            while cursor + Duration::minutes(SLOT_MINUTES) <= day_end {
                let end = cursor + Duration::minutes(SLOT_MINUTES);
                if !overlaps_any(&busy_today, cursor, end) {
                    slots.push(CalendarSlot::new(cursor, end));
                    if slots.len() == MAX_RAW_SLOTS {
                        return slots;
                    }
                }
                cursor = end;
            }
        }
        slots
    }

    /// `STRUCTURED_SLOT_COUNT` windows of 2–3 hours, one per business day.
    ///
    /// Fewer than three only when the lookahead window runs out of free
    /// business days.
    pub fn structured_slots(&self, busy: &[BusyInterval], now: DateTime<Utc>) -> Vec<CalendarSlot> {
        let calendar = BusyCalendar::new(busy, self.tz);
        let today = now.with_timezone(&self.tz).date_naive();
        let first_day = add_business_days(today, MIN_BUSINESS_DAYS_AHEAD);
        let mut windows = Vec::new();

        let mut day = first_day;
        while windows.len() < STRUCTURED_SLOT_COUNT
            && (day - today).num_days() < i64::from(self.lookahead_days)
        {
            if calendar.is_workday(day)
                && let Some((start, end)) = self.working_hours(day)
            {
                let busy_today = calendar.timed_on(day, self.tz);
                let window = free_blocks(&busy_today, start, end)
                    .into_iter()
                    .find(|(s, e)| (*e - *s).num_minutes() >= MIN_WINDOW_MINUTES)
                    .map(|(s, e)| (s, e.min(s + Duration::minutes(MAX_WINDOW_MINUTES))));
                if let Some((s, e)) = window {
                    windows.push(CalendarSlot::new(s, e));
                }
            }
            day += Duration::days(1);
        }
        windows
    }

    fn working_hours(&self, day: NaiveDate) -> Option<(DateTime<Tz>, DateTime<Tz>)> {
        Some((
            resolve_local(&self.tz, day, WORKDAY_START_HOUR)?,
            resolve_local(&self.tz, day, WORKDAY_END_HOUR)?,
        ))
    }
}

/// Busy data split into all-day dates and timed intervals.
struct BusyCalendar {
    blocked_days: BTreeSet<NaiveDate>,
    timed: Vec<(DateTime<Tz>, DateTime<Tz>)>,
}

impl BusyCalendar {
    fn new(busy: &[BusyInterval], tz: Tz) -> Self {
        let mut blocked_days = BTreeSet::new();
        let mut timed = Vec::new();
        for interval in busy {
            if interval.all_day {
                // All-day events carry their calendar date at UTC midnight.
                let first = interval.start.date_naive();
                let last = interval.end.date_naive().max(first + Duration::days(1));
                let mut d = first;
                while d < last {
                    blocked_days.insert(d);
                    d += Duration::days(1);
                }
            } else if interval.end > interval.start {
                timed.push((interval.start.with_timezone(&tz), interval.end.with_timezone(&tz)));
            }
        }
        Self {
            blocked_days,
            timed: merge_intervals(timed),
        }
    }

    fn is_workday(&self, day: NaiveDate) -> bool {
        is_business_day(day) && !self.blocked_days.contains(&day)
    }

    fn timed_on(&self, day: NaiveDate, tz: Tz) -> Vec<(DateTime<Tz>, DateTime<Tz>)> {
        let Some(day_start) = resolve_local(&tz, day, 0) else {
            return Vec::new();
        };
        let day_end = day_start + Duration::days(1);
        self.timed
            .iter()
            .filter(|(s, e)| *s < day_end && *e > day_start)
            .copied()
            .collect()
    }
}

fn is_business_day(day: NaiveDate) -> bool {
    !matches!(day.weekday(), Weekday::Sat | Weekday::Sun)
}

fn add_business_days(from: NaiveDate, count: u32) -> NaiveDate {
    let mut day = from;
    let mut added = 0;
    while added < count {
        day += Duration::days(1);
        if is_business_day(day) {
            added += 1;
        }
    }
    day
}

/// Round up to the next :00 or :30 boundary (unchanged if already on one).
fn next_half_hour(t: DateTime<Tz>) -> DateTime<Tz> {
    let floored = t
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t);
    let minute = floored.minute();
    let on_boundary = minute % 30 == 0 && floored == t;
    if on_boundary {
        return t;
    }
    let bump = 30 - i64::from(minute % 30);
    floored + Duration::minutes(bump)
}

/// Local `hour:00` on `date`, tolerating DST gaps.
fn resolve_local(tz: &Tz, date: NaiveDate, hour: u32) -> Option<DateTime<Tz>> {
    let naive = NaiveDateTime::new(date, NaiveTime::from_hms_opt(hour, 0, 0)?);
    let local = tz.from_local_datetime(&naive);
    local.earliest().or_else(|| {
        warn!(%date, hour, %tz, "Local time falls in a DST gap; using post-transition time");
        local.latest()
    })
}

fn merge_intervals(
    mut intervals: Vec<(DateTime<Tz>, DateTime<Tz>)>,
) -> Vec<(DateTime<Tz>, DateTime<Tz>)> {
    intervals.sort_by_key(|(start, _)| *start);
    let mut merged: Vec<(DateTime<Tz>, DateTime<Tz>)> = Vec::new();
    for (start, end) in intervals {
        if let Some((_, current_end)) = merged.last_mut()
            && start <= *current_end
        {
            if end > *current_end {
                *current_end = end;
            }
            continue;
        }
        merged.push((start, end));
    }
    merged
}

/// Gaps between sorted, merged busy intervals inside `[day_start, day_end)`.
fn free_blocks(
    busy: &[(DateTime<Tz>, DateTime<Tz>)],
    day_start: DateTime<Tz>,
    day_end: DateTime<Tz>,
) -> Vec<(DateTime<Tz>, DateTime<Tz>)> {
    let mut blocks = Vec::new();
    let mut cursor = day_start;
    for (start, end) in busy {
        if *start > cursor {
            blocks.push((cursor, (*start).min(day_end)));
        }
        if *end > cursor {
            cursor = *end;
        }
        if cursor >= day_end {
            break;
        }
    }
    if day_end > cursor {
        blocks.push((cursor, day_end));
    }
    blocks.retain(|(s, e)| e > s);
    blocks
}

fn overlaps_any(
    busy: &[(DateTime<Tz>, DateTime<Tz>)],
    start: DateTime<Tz>,
    end: DateTime<Tz>,
) -> bool {
    busy.iter().any(|(s, e)| start < *e && end > *s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn busy(start: DateTime<Utc>, end: DateTime<Utc>) -> BusyInterval {
        BusyInterval { start, end, all_day: false }
    }

    fn all_day(y: i32, m: u32, d: u32) -> BusyInterval {
        BusyInterval {
            start: utc(y, m, d, 0, 0),
            end: utc(y, m, d, 0, 0) + Duration::days(1),
            all_day: true,
        }
    }

    fn generator() -> SlotGenerator {
        SlotGenerator::new(chrono_tz::UTC, 7)
    }

    // 2024-01-15 is a Monday.

    #[test]
    fn raw_slots_start_at_workday_open() {
        let slots = generator().available_slots(&[], utc(2024, 1, 15, 7, 0));
        assert_eq!(slots.len(), MAX_RAW_SLOTS);
        assert_eq!(slots[0].start, utc(2024, 1, 15, 9, 0));
        assert_eq!(slots[9].end, utc(2024, 1, 15, 14, 0));
        assert!(slots.iter().all(|s| s.duration_minutes() == 30));
    }

    #[test]
    fn raw_slots_round_up_to_half_hour() {
        let slots = generator().available_slots(&[], utc(2024, 1, 15, 10, 10));
        assert_eq!(slots[0].start, utc(2024, 1, 15, 10, 30));
        let slots = generator().available_slots(&[], utc(2024, 1, 15, 11, 0));
        assert_eq!(slots[0].start, utc(2024, 1, 15, 11, 0));
    }

    #[test]
    fn raw_slots_skip_busy_time() {
        let busy = vec![busy(utc(2024, 1, 15, 9, 15), utc(2024, 1, 15, 10, 0))];
        let slots = generator().available_slots(&busy, utc(2024, 1, 15, 8, 0));
        assert_eq!(slots[0].start, utc(2024, 1, 15, 10, 0));
    }

    #[test]
    fn raw_slots_skip_rest_of_day_after_five() {
        let slots = generator().available_slots(&[], utc(2024, 1, 15, 17, 5));
        assert_eq!(slots[0].start, utc(2024, 1, 16, 9, 0));
    }

    #[test]
    fn raw_slots_fill_until_six_before_five() {
        let slots = generator().available_slots(&[], utc(2024, 1, 15, 16, 40));
        assert_eq!(slots[0].start, utc(2024, 1, 15, 17, 0));
        assert_eq!(slots[1].start, utc(2024, 1, 15, 17, 30));
        assert_eq!(slots[2].start, utc(2024, 1, 16, 9, 0));
    }

    #[test]
    fn raw_slots_skip_weekends_and_all_day_events() {
        // Saturday now, Monday blocked all day
        let slots = generator().available_slots(&[all_day(2024, 1, 22)], utc(2024, 1, 20, 10, 0));
        assert_eq!(slots[0].start, utc(2024, 1, 23, 9, 0));
    }

    #[test]
    fn raw_slots_respect_local_zone() {
        let generator = SlotGenerator::new(chrono_tz::America::New_York, 7);
        // 12:00 UTC is 07:00 in New York
        let slots = generator.available_slots(&[], utc(2024, 1, 15, 12, 0));
        assert_eq!(slots[0].start, utc(2024, 1, 15, 14, 0));
        assert_eq!(slots[0].label, "Mon, Jan 15 · 09:00 – 09:30");
    }

    #[test]
    fn structured_slots_start_two_business_days_out() {
        let slots = generator().structured_slots(&[], utc(2024, 1, 15, 10, 0));
        assert_eq!(slots.len(), STRUCTURED_SLOT_COUNT);
        assert_eq!(slots[0].start, utc(2024, 1, 17, 9, 0));
        assert_eq!(slots[0].end, utc(2024, 1, 17, 12, 0));
        assert_eq!(slots[1].start, utc(2024, 1, 18, 9, 0));
        assert_eq!(slots[2].start, utc(2024, 1, 19, 9, 0));
    }

    #[test]
    fn structured_slots_cross_weekend() {
        // Friday → Tuesday
        let slots = generator().structured_slots(&[], utc(2024, 1, 19, 10, 0));
        assert_eq!(slots[0].start, utc(2024, 1, 23, 9, 0));
        assert_eq!(slots[2].start, utc(2024, 1, 25, 9, 0));
    }

    #[test]
    fn structured_slots_need_two_free_hours() {
        let busy = vec![
            busy(utc(2024, 1, 17, 9, 0), utc(2024, 1, 17, 10, 30)),
            busy(utc(2024, 1, 17, 12, 0), utc(2024, 1, 17, 18, 0)),
            busy(utc(2024, 1, 18, 9, 0), utc(2024, 1, 18, 13, 0)),
            busy(utc(2024, 1, 18, 15, 30), utc(2024, 1, 18, 16, 0)),
        ];
        let slots = SlotGenerator::new(chrono_tz::UTC, 14).structured_slots(&busy, utc(2024, 1, 15, 10, 0));
        assert_eq!(slots.len(), 3);
        // Jan 17 has only 90 free minutes; Jan 18 13:00–15:30 is 2.5h
        assert_eq!(slots[0].start, utc(2024, 1, 18, 13, 0));
        assert_eq!(slots[0].end, utc(2024, 1, 18, 15, 30));
        assert_eq!(slots[1].start, utc(2024, 1, 19, 9, 0));
        assert_eq!(slots[2].start, utc(2024, 1, 22, 9, 0));
        assert!(slots.iter().all(|s| (120..=180).contains(&s.duration_minutes())));
    }

    #[test]
    fn structured_slots_stay_inside_lookahead() {
        // Whole week blocked: nothing unchecked may be offered
        let busy: Vec<BusyInterval> = (15..=21).map(|d| all_day(2024, 1, d)).collect();
        let now = utc(2024, 1, 15, 10, 0);
        assert!(generator().available_slots(&busy, now).is_empty());
        assert!(generator().structured_slots(&busy, now).is_empty());

        // Only Wed and Thu left before the window closes
        let short = SlotGenerator::new(chrono_tz::UTC, 4);
        let slots = short.structured_slots(&[], now);
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[1].start, utc(2024, 1, 18, 9, 0));
    }

    #[test]
    fn structured_slots_are_deterministic() {
        let busy = vec![busy(utc(2024, 1, 17, 9, 0), utc(2024, 1, 17, 9, 30))];
        let now = utc(2024, 1, 15, 10, 0);
        assert_eq!(
            generator().structured_slots(&busy, now),
            generator().structured_slots(&busy, now)
        );
    }

    #[test]
    fn label_format() {
        let tz = chrono_tz::UTC;
        let start = tz.with_ymd_and_hms(2024, 1, 16, 10, 0, 0).unwrap();
        let end = tz.with_ymd_and_hms(2024, 1, 16, 10, 30, 0).unwrap();
        assert_eq!(format_label(start, end), "Tue, Jan 16 · 10:00 – 10:30");
    }

    #[test]
    fn merge_overlapping_intervals() {
        let tz = chrono_tz::UTC;
        let at = |h| tz.with_ymd_and_hms(2024, 1, 16, h, 0, 0).unwrap();
        let merged = merge_intervals(vec![(at(11), at(13)), (at(9), at(10)), (at(12), at(14))]);
        assert_eq!(merged, vec![(at(9), at(10)), (at(11), at(14))]);
    }
}
