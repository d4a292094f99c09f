//! classbell-media: Gemini-backed announcement writing and timetable reading.

pub mod announce;
pub mod gemini;
pub mod timetable;

pub use announce::GeminiAnnouncer;
pub use gemini::GeminiClient;
pub use timetable::parse_timetable;
