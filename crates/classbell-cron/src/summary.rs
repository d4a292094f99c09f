//! Evening digest of the next day's classes.

use chrono::{Duration, NaiveDate};
use chrono_tz::Tz;

use classbell_types::Occurrence;

use crate::delivery::escape_html;

/// HTML list of classes starting on the day after `today`, or `None` when
/// there are none.
pub fn next_day_summary(occurrences: &[Occurrence], today: NaiveDate, tz: Tz) -> Option<String> {
    let tomorrow = today + Duration::days(1);
    let mut classes: Vec<_> = occurrences
        .iter()
        .map(|o| (o.class_start().with_timezone(&tz), o))
        .filter(|(start, _)| start.date_naive() == tomorrow)
        .collect();
    if classes.is_empty() {
        return None;
    }
    classes.sort_by_key(|(start, _)| *start);

    let mut text = format!(
        "📅 <b>Tomorrow's classes ({})</b>",
        tomorrow.format("%a %d %b")
    );
    for (start, occ) in classes {
        text.push_str(&format!(
            "\n• {} {} {}",
            start.format("%H:%M"),
            escape_html(&occ.payload.batch_id),
            escape_html(&occ.payload.subject_id),
        ));
    }
    Some(text)
}
