//! Argument parsing and reply formatting shared by chat commands and
//! subcommands.

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;

use classbell_cron::RecurrenceSpec;
use classbell_cron::delivery::escape_html;
use classbell_cron::recurrence::{parse_clock, parse_weekdays};
use classbell_cron::service::ServiceStatus;
use classbell_types::{AttendanceRecord, Occurrence, RenderMode};

pub const SCHEDULE_USAGE: &str =
    "/schedule <batch> <subject> <days> <start YYYY-MM-DD> <end YYYY-MM-DD|-> <HH:MM> [offset] [link]";
pub const EDIT_USAGE: &str = "/edit <id> <single|day|all> <time|date|link|message|topic> <value>";

/// Raw schedule fields as typed by an admin.
#[derive(Debug, Default)]
pub struct ScheduleArgs<'a> {
    pub batch: &'a str,
    pub subject: &'a str,
    pub days: &'a str,
    pub start: &'a str,
    pub end: Option<&'a str>,
    pub time: &'a str,
    pub offset: u32,
    pub link: Option<&'a str>,
    pub manual: Option<&'a str>,
    pub topic: Option<i64>,
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .with_context(|| format!("invalid date '{raw}' (expected YYYY-MM-DD)"))
}

impl ScheduleArgs<'_> {
    pub fn into_spec(self) -> Result<RecurrenceSpec> {
        if self.batch.is_empty() || self.subject.is_empty() {
            bail!("batch and subject are required");
        }
        let days_of_week =
            parse_weekdays(self.days).ok_or_else(|| anyhow!("invalid days '{}'", self.days))?;
        let time_of_day =
            parse_clock(self.time).ok_or_else(|| anyhow!("invalid time '{}'", self.time))?;
        let start_date = parse_date(self.start)?;
        let end_date = self
            .end
            .filter(|e| !matches!(*e, "" | "-"))
            .map(parse_date)
            .transpose()?;
        if end_date.is_some_and(|end| end < start_date) {
            bail!("end date is before start date");
        }

        Ok(RecurrenceSpec {
            subject_id: self.subject.to_string(),
            batch_id: self.batch.to_string(),
            days_of_week,
            start_date,
            end_date,
            time_of_day,
            notify_offset_minutes: self.offset,
            render_mode: if self.manual.is_some() {
                RenderMode::Manual
            } else {
                RenderMode::Ai
            },
            manual_text: self.manual.map(str::to_string),
            link_url: self.link.map(str::to_string),
            topic_id: self.topic,
        })
    }
}

/// Parse the argument string of the `/schedule` chat command.
pub fn parse_schedule_command(args: &str, topic: Option<i64>) -> Result<RecurrenceSpec> {
    let parts: Vec<&str> = args.split_whitespace().collect();
    if parts.len() < 6 {
        bail!("usage: {SCHEDULE_USAGE}");
    }
    let mut rest = parts[6..].iter();
    let mut offset = 0;
    let mut link = None;
    if let Some(next) = rest.next() {
        match next.parse::<u32>() {
            Ok(minutes) => {
                offset = minutes;
                link = rest.next().copied();
            }
            Err(_) => link = Some(*next),
        }
    }

    ScheduleArgs {
        batch: parts[0],
        subject: parts[1],
        days: parts[2],
        start: parts[3],
        end: Some(parts[4]),
        time: parts[5],
        offset,
        link,
        manual: None,
        topic,
    }
    .into_spec()
}

/// `/edit` arguments: id, scope, field and the rest of the line as value.
pub fn split_edit_command(args: &str) -> Result<(&str, &str, &str, &str)> {
    let mut parts = args.splitn(4, char::is_whitespace);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(id), Some(scope), Some(field)) if !id.is_empty() => {
            Ok((id, scope, field, parts.next().unwrap_or("").trim()))
        }
        _ => bail!("usage: {EDIT_USAGE}"),
    }
}

/// At most `max` characters of `text`, cut on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}

/// Case-insensitive admin check; with no admins configured anyone may manage.
pub fn is_admin(configured: &[String], stored: &[String], username: Option<&str>) -> bool {
    if configured.is_empty() && stored.is_empty() {
        return true;
    }
    let Some(name) = username.map(|u| u.trim_start_matches('@')) else {
        return false;
    };
    configured
        .iter()
        .chain(stored)
        .any(|a| a.trim_start_matches('@').eq_ignore_ascii_case(name))
}

fn local(at: DateTime<Utc>, tz: Tz) -> String {
    at.with_timezone(&tz).format("%a %d %b %H:%M").to_string()
}

pub fn format_agenda(occurrences: &[Occurrence], tz: Tz, limit: usize) -> String {
    if occurrences.is_empty() {
        return "📭 No classes scheduled.".to_string();
    }
    let mut lines = vec![format!("📅 <b>{} scheduled</b>", occurrences.len())];
    for occ in occurrences.iter().take(limit) {
        lines.push(format!(
            "• {} {} {} <code>{}</code>",
            local(occ.fire_at, tz),
            escape_html(&occ.payload.batch_id),
            escape_html(&occ.payload.subject_id),
            occ.id
        ));
    }
    if occurrences.len() > limit {
        lines.push(format!("… and {} more", occurrences.len() - limit));
    }
    lines.join("\n")
}

pub fn format_attendance(sheets: &[(String, AttendanceRecord)], tz: Tz) -> String {
    if sheets.is_empty() {
        return "No attendance recorded yet.".to_string();
    }
    sheets
        .iter()
        .map(|(_, sheet)| {
            format!(
                "<b>{} {}</b> ({}): {} present\n{}",
                escape_html(sheet.batch_id.as_deref().unwrap_or("?")),
                escape_html(sheet.subject_id.as_deref().unwrap_or("?")),
                local(sheet.opened_at, tz),
                sheet.attendees.len(),
                escape_html(&sheet.attendees.join(", "))
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn format_status(status: &ServiceStatus, tz: Tz) -> String {
    let group = match status.group {
        Some(target) if status.group_name.is_empty() => target.chat_id.to_string(),
        Some(_) => escape_html(&status.group_name),
        None => "not linked".to_string(),
    };
    let next = status
        .next_fire
        .map(|at| local(at, tz))
        .unwrap_or_else(|| "-".to_string());
    let started = status
        .stats
        .started_at
        .map(|at| local(at, tz))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "🤖 <b>Status</b>\nGroup: {group}\nPending: {} ({} timers)\nNext: {next}\n\
         Scheduled total: {}\nAI requests: {}\nUp since: {started}",
        status.pending, status.timers, status.stats.classes_scheduled, status.stats.ai_requests
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone, Weekday};
    use classbell_types::{OccurrencePayload, SystemStats, Target};

    #[test]
    fn test_parse_schedule_command_full() {
        let spec = parse_schedule_command(
            "CSDA Maths mon,wed 2024-01-01 2024-01-31 10:00 15 https://meet.example/x",
            Some(4),
        )
        .unwrap();
        assert_eq!(spec.batch_id, "CSDA");
        assert_eq!(spec.days_of_week, vec![Weekday::Mon, Weekday::Wed]);
        assert_eq!(spec.end_date, NaiveDate::from_ymd_opt(2024, 1, 31));
        assert_eq!(spec.time_of_day, NaiveTime::from_hms_opt(10, 0, 0).unwrap());
        assert_eq!(spec.notify_offset_minutes, 15);
        assert_eq!(spec.link_url.as_deref(), Some("https://meet.example/x"));
        assert_eq!(spec.topic_id, Some(4));
        assert_eq!(spec.render_mode, RenderMode::Ai);
    }

    #[test]
    fn test_parse_schedule_command_open_ended_with_link() {
        let spec =
            parse_schedule_command("AIML DBMS fri 2024-01-01 - 9:30 https://l.example", None)
                .unwrap();
        assert!(spec.end_date.is_none());
        assert_eq!(spec.notify_offset_minutes, 0);
        assert_eq!(spec.link_url.as_deref(), Some("https://l.example"));
    }

    #[test]
    fn test_parse_schedule_command_errors() {
        assert!(parse_schedule_command("CSDA Maths mon", None).is_err());
        assert!(parse_schedule_command("CSDA Maths funday 2024-01-01 - 10:00", None).is_err());
        assert!(parse_schedule_command("CSDA Maths mon 2024-02-01 2024-01-01 10:00", None).is_err());
    }

    #[test]
    fn test_manual_args() {
        let spec = ScheduleArgs {
            batch: "CSDA",
            subject: "Maths",
            days: "tue",
            start: "2024-01-01",
            time: "08:00",
            manual: Some("Lab today"),
            ..ScheduleArgs::default()
        }
        .into_spec()
        .unwrap();
        assert_eq!(spec.render_mode, RenderMode::Manual);
        assert_eq!(spec.manual_text.as_deref(), Some("Lab today"));
    }

    #[test]
    fn test_split_edit_command() {
        assert_eq!(
            split_edit_command("abc day message Room 4 today").unwrap(),
            ("abc", "day", "message", "Room 4 today")
        );
        assert!(split_edit_command("abc day").is_err());
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("🔔🔔🔔", 2), "🔔🔔");
        assert_eq!(truncate_chars("short", 4000), "short");
    }

    #[test]
    fn test_is_admin() {
        assert!(is_admin(&[], &[], None));
        let configured = vec!["Alice".to_string()];
        let stored = vec!["@bob".to_string()];
        assert!(is_admin(&configured, &stored, Some("alice")));
        assert!(is_admin(&configured, &stored, Some("bob")));
        assert!(!is_admin(&configured, &stored, Some("mallory")));
        assert!(!is_admin(&configured, &stored, None));
    }

    #[test]
    fn test_format_agenda_truncates() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 4, 30, 0).unwrap();
        let occ = |id: &str| Occurrence {
            id: id.into(),
            origin_id: None,
            fire_at: at,
            target: Target::group(-1),
            payload: OccurrencePayload {
                batch_id: "CSDA".into(),
                subject_id: "Maths".into(),
                display_time: "10:00".into(),
                link: None,
                manual_text: None,
                render_mode: RenderMode::Ai,
                notify_offset_minutes: 0,
                retry_count: 0,
            },
            created_at: at,
        };
        let text = format_agenda(&[occ("a"), occ("b"), occ("c")], chrono_tz::Asia::Kolkata, 2);
        assert!(text.contains("Mon 01 Jan 10:00 CSDA Maths <code>a</code>"));
        assert!(!text.contains("<code>c</code>"));
        assert!(text.ends_with("… and 1 more"));
        assert_eq!(format_agenda(&[], chrono_tz::UTC, 5), "📭 No classes scheduled.");
    }

    #[test]
    fn test_format_status_unlinked() {
        let status = ServiceStatus {
            group: None,
            group_name: String::new(),
            pending: 0,
            timers: 1,
            next_fire: None,
            stats: SystemStats::default(),
        };
        let text = format_status(&status, chrono_tz::UTC);
        assert!(text.contains("Group: not linked"));
        assert!(text.contains("Pending: 0 (1 timers)"));
    }
}
