//! Recurrence expansion: weekday rule + date range → concrete fire times.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use classbell_types::{Occurrence, OccurrencePayload, RenderMode, Target, TimetableEntry};

/// A weekly class rule as entered by an admin. Consumed once by [`expand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurrenceSpec {
    pub subject_id: String,
    pub batch_id: String,
    pub days_of_week: Vec<Weekday>,
    pub start_date: NaiveDate,
    /// `None` means one occurrence per weekday, on or after `start_date`.
    pub end_date: Option<NaiveDate>,
    pub time_of_day: NaiveTime,
    pub notify_offset_minutes: u32,
    pub render_mode: RenderMode,
    pub manual_text: Option<String>,
    pub link_url: Option<String>,
    pub topic_id: Option<i64>,
}

impl RecurrenceSpec {
    /// One weekly AI-rendered class from a timetable row, first firing on
    /// the matching weekday on or after `start_date`. Rows with an unknown
    /// weekday or time are rejected.
    pub fn from_timetable(entry: &TimetableEntry, start_date: NaiveDate) -> Option<Self> {
        let day = entry.day.trim().parse::<Weekday>().ok()?;
        let time = parse_clock(&entry.time)?;
        let subject = entry.subject.trim();
        let batch = entry.batch.trim();
        if subject.is_empty() || batch.is_empty() {
            return None;
        }
        Some(Self {
            subject_id: subject.to_string(),
            batch_id: batch.to_string(),
            days_of_week: vec![day],
            start_date,
            end_date: None,
            time_of_day: time,
            notify_offset_minutes: 0,
            render_mode: RenderMode::Ai,
            manual_text: None,
            link_url: None,
            topic_id: None,
        })
    }
}

/// Fire times for `spec`, interpreting dates and times in `tz`.
///
/// With an end date the result is ascending. Without one it follows the
/// order of `days_of_week`. Times already in the past are kept; deciding
/// what to do with them belongs to the caller.
pub fn expand(spec: &RecurrenceSpec, tz: Tz) -> Vec<DateTime<Utc>> {
    let offset = Duration::minutes(i64::from(spec.notify_offset_minutes));
    let fire = |date: NaiveDate| local_to_utc(date.and_time(spec.time_of_day), tz) - offset;

    match spec.end_date {
        Some(end) => spec
            .start_date
            .iter_days()
            .take_while(|d| *d <= end)
            .filter(|d| spec.days_of_week.contains(&d.weekday()))
            .map(fire)
            .collect(),
        None => {
            let start_wd = spec.start_date.weekday().num_days_from_monday();
            let mut seen = [false; 7];
            spec.days_of_week
                .iter()
                .filter(|wd| !std::mem::replace(&mut seen[wd.num_days_from_monday() as usize], true))
                .map(|wd| {
                    let ahead = (wd.num_days_from_monday() + 7 - start_wd) % 7;
                    fire(spec.start_date + Duration::days(i64::from(ahead)))
                })
                .collect()
        }
    }
}

/// Expand `spec` into storable occurrences aimed at `group`.
pub fn build_occurrences(
    spec: &RecurrenceSpec,
    group: Target,
    tz: Tz,
    now: DateTime<Utc>,
) -> Vec<Occurrence> {
    let target = group.with_topic(spec.topic_id);
    let display_time = spec.time_of_day.format("%H:%M").to_string();

    expand(spec, tz)
        .into_iter()
        .map(|fire_at| Occurrence {
            id: uuid::Uuid::new_v4().to_string(),
            origin_id: None,
            fire_at,
            target,
            payload: OccurrencePayload {
                batch_id: spec.batch_id.clone(),
                subject_id: spec.subject_id.clone(),
                display_time: display_time.clone(),
                link: spec.link_url.clone(),
                manual_text: spec.manual_text.clone(),
                render_mode: spec.render_mode,
                notify_offset_minutes: spec.notify_offset_minutes,
                retry_count: 0,
            },
            created_at: now,
        })
        .collect()
}

/// Resolve a wall-clock time in `tz`. Ambiguous times take the earlier
/// instant; times inside a DST gap move forward by an hour.
pub fn local_to_utc(local: NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    tz.from_local_datetime(&local)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(local + Duration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&local))
}

/// Parse "HH:MM" (24h) or "h:MM AM".
pub fn parse_clock(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(&raw.to_ascii_uppercase(), "%I:%M %p"))
        .ok()
}

/// Parse a comma separated weekday list ("Mon,Wed" or "monday, friday").
pub fn parse_weekdays(raw: &str) -> Option<Vec<Weekday>> {
    let days = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Weekday>().ok())
        .collect::<Option<Vec<_>>>()?;
    (!days.is_empty()).then_some(days)
}
