//! Timetable extraction prompt and response parsing.

use std::sync::LazyLock;

use anyhow::Context;
use regex::Regex;

use classbell_types::TimetableEntry;

pub(crate) const TIMETABLE_PROMPT: &str = r#"Analyze this timetable image. Extract class details into strict JSON:
[{"day": "Mon", "time": "10:00", "subject": "Maths", "batch": "CSDA"}]
Constraints:
1. Days: Mon, Tue, Wed, Thu, Fri, Sat, Sun.
2. Time: 24h format HH:MM.
3. Return ONLY raw JSON."#;

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)```[a-z]*").unwrap());

/// Remove markdown code fences the model likes to wrap output in.
pub fn strip_fences(text: &str) -> String {
    FENCE_RE.replace_all(text, "").trim().to_string()
}

/// Parse the model's JSON list of classes.
pub fn parse_timetable(text: &str) -> anyhow::Result<Vec<TimetableEntry>> {
    let cleaned = strip_fences(text);
    // Tolerate prose around the list.
    let json = match (cleaned.find('['), cleaned.rfind(']')) {
        (Some(start), Some(end)) if start < end => &cleaned[start..=end],
        _ => cleaned.as_str(),
    };
    serde_json::from_str(json).context("Timetable response is not a JSON list of classes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_list() {
        let text = "```json\n[{\"day\":\"Tue\",\"time\":\"14:00\",\"subject\":\"OS\",\"batch\":\"AICS\"}]\n```";
        let entries = parse_timetable(text).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].subject, "OS");
        assert_eq!(entries[0].day, "Tue");
    }

    #[test]
    fn test_parse_with_prose() {
        let text = "Here is the timetable:\n[{\"day\":\"Mon\",\"time\":\"09:00\",\"subject\":\"DBMS\",\"batch\":\"CSDA\"}]\nGood luck!";
        assert_eq!(parse_timetable(text).unwrap()[0].batch, "CSDA");
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(parse_timetable("I could not read the image.").is_err());
    }
}
