use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// ULID and ID Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MicroSummaryId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionSummaryId(pub String);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MicroSummaryId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SessionSummaryId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Enumerations
// ============================================================================

/// Channel discriminator on incoming indexing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventChannel {
    SceneIndex,
    VisualIndex,
    Transcript,
    SpokenIndex,
    Alert,
}

impl EventChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventChannel::SceneIndex => "scene_index",
            EventChannel::VisualIndex => "visual_index",
            EventChannel::Transcript => "transcript",
            EventChannel::SpokenIndex => "spoken_index",
            EventChannel::Alert => "alert",
        }
    }

    /// Returns `None` for channels the pipeline does not recognize.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scene_index" => Some(EventChannel::SceneIndex),
            "visual_index" => Some(EventChannel::VisualIndex),
            "transcript" => Some(EventChannel::Transcript),
            "spoken_index" => Some(EventChannel::SpokenIndex),
            "alert" => Some(EventChannel::Alert),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppCategory {
    Development,
    Browsing,
    Communication,
    Documents,
    Design,
    Email,
    Entertainment,
    Other,
}

impl AppCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppCategory::Development => "development",
            AppCategory::Browsing => "browsing",
            AppCategory::Communication => "communication",
            AppCategory::Documents => "documents",
            AppCategory::Design => "design",
            AppCategory::Email => "email",
            AppCategory::Entertainment => "entertainment",
            AppCategory::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "development" => AppCategory::Development,
            "browsing" => AppCategory::Browsing,
            "communication" => AppCategory::Communication,
            "documents" => AppCategory::Documents,
            "design" => AppCategory::Design,
            "email" => AppCategory::Email,
            "entertainment" => AppCategory::Entertainment,
            _ => AppCategory::Other,
        }
    }
}

/// Dominant activity inferred for a segment, from a fixed priority list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionTag {
    Coding,
    Browsing,
    Chatting,
    Reading,
    Meeting,
    Writing,
    Designing,
    Watching,
    Emailing,
    Working,
}

impl ActionTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionTag::Coding => "coding",
            ActionTag::Browsing => "browsing",
            ActionTag::Chatting => "chatting",
            ActionTag::Reading => "reading",
            ActionTag::Meeting => "meeting",
            ActionTag::Writing => "writing",
            ActionTag::Designing => "designing",
            ActionTag::Watching => "watching",
            ActionTag::Emailing => "emailing",
            ActionTag::Working => "working",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "coding" => ActionTag::Coding,
            "browsing" => ActionTag::Browsing,
            "chatting" => ActionTag::Chatting,
            "reading" => ActionTag::Reading,
            "meeting" => ActionTag::Meeting,
            "writing" => ActionTag::Writing,
            "designing" => ActionTag::Designing,
            "watching" => ActionTag::Watching,
            "emailing" => ActionTag::Emailing,
            _ => ActionTag::Working,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductivityLabel {
    Productive,
    Neutral,
    Distracted,
}

impl ProductivityLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductivityLabel::Productive => "productive",
            ProductivityLabel::Neutral => "neutral",
            ProductivityLabel::Distracted => "distracted",
        }
    }

    /// Lenient parse for model-supplied labels; anything outside the closed
    /// set maps to `Neutral`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "productive" => ProductivityLabel::Productive,
            "distracted" => ProductivityLabel::Distracted,
            _ => ProductivityLabel::Neutral,
        }
    }
}

// ============================================================================
// Raw Events and Segments
// ============================================================================

/// One atomic notification from the capture/indexing feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: EventId,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub channel: EventChannel,
    /// App attribution from classification; bare transcripts carry none.
    pub app_name: Option<String>,
    pub category: Option<AppCategory>,
    pub text: String,
    /// Original message, verbatim.
    pub payload: String,
}

/// A contiguous same-app run of raw events within one flush window.
///
/// Immutable after creation except for `project`, which the summarizer may
/// backfill once a model has inferred it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivitySegment {
    pub id: SegmentId,
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub app_name: String,
    pub category: AppCategory,
    pub action: ActionTag,
    pub project: Option<String>,
    pub context: Option<String>,
    pub transcript: Option<String>,
    pub event_count: i64,
    pub is_idle: bool,
}

impl ActivitySegment {
    pub fn duration_secs(&self) -> i64 {
        (self.end_time - self.start_time).num_seconds()
    }
}

// ============================================================================
// Summary Tiers
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicroSummary {
    pub id: MicroSummaryId,
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub summary: String,
    /// Seconds per app, summed from segment durations. Never model-supplied.
    pub app_breakdown: BTreeMap<String, i64>,
    pub primary_activity: String,
    pub productivity: ProductivityLabel,
    pub project: Option<String>,
    pub segment_ids: Vec<SegmentId>,
}

impl MicroSummary {
    pub fn duration_secs(&self) -> i64 {
        (self.end_time - self.start_time).num_seconds()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionSummaryId,
    pub session_id: String,
    pub date: NaiveDate,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub summary: String,
    pub key_activities: Vec<String>,
    /// Seconds per project, summed from segments in range.
    pub project_breakdown: BTreeMap<String, i64>,
    /// Seconds per app, summed across contributing micro-summaries.
    pub app_breakdown: BTreeMap<String, i64>,
    pub productivity: ProductivityLabel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaySection {
    pub title: String,
    pub summary: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// One row per calendar date, overwritten on regeneration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub headline: String,
    pub summary: String,
    pub highlights: Vec<String>,
    pub improvements: Vec<String>,
    pub sections: Vec<DaySection>,
    pub tracked_secs: i64,
    pub idle_secs: i64,
    pub productive_secs: i64,
    pub distracted_secs: i64,
    pub top_apps: Vec<AppDuration>,
    pub top_projects: Vec<ProjectDuration>,
}

// ============================================================================
// Aggregates
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppDuration {
    pub app_name: String,
    pub seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDuration {
    pub project: String,
    pub seconds: i64,
}

/// Deterministic day-level aggregates pulled straight from stored rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayStats {
    pub tracked_secs: i64,
    pub idle_secs: i64,
    pub productive_secs: i64,
    pub distracted_secs: i64,
    pub top_apps: Vec<AppDuration>,
    pub top_projects: Vec<ProjectDuration>,
}

// ============================================================================
// Calendar Helpers
// ============================================================================

/// UTC instants covering the local calendar day `[midnight, midnight + 24h)`.
///
/// Every day-scoped query and the daily-section hour anchor go through this
/// one helper so "the calendar day" means the same thing everywhere.
pub fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let midnight = date.and_time(NaiveTime::MIN);
    let start = match Local.from_local_datetime(&midnight) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
        chrono::LocalResult::None => Utc.from_utc_datetime(&midnight),
    };
    (start, start + chrono::Duration::hours(24))
}

/// Local calendar date an instant falls on.
pub fn local_date_of(ts: DateTime<Utc>) -> NaiveDate {
    ts.with_timezone(&Local).date_naive()
}

// ============================================================================
// Helper Functions
// ============================================================================

pub fn generate_event_id() -> EventId {
    EventId(format!("evt_{}", ulid::Ulid::new()))
}

pub fn generate_segment_id() -> SegmentId {
    SegmentId(format!("seg_{}", ulid::Ulid::new()))
}

pub fn generate_micro_summary_id() -> MicroSummaryId {
    MicroSummaryId(format!("micro_{}", ulid::Ulid::new()))
}

pub fn generate_session_summary_id() -> SessionSummaryId {
    SessionSummaryId(format!("sess_{}", ulid::Ulid::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_generation() {
        let event_id = generate_event_id();
        assert!(event_id.0.starts_with("evt_"));

        let segment_id = generate_segment_id();
        assert!(segment_id.0.starts_with("seg_"));

        let a = generate_micro_summary_id();
        let b = generate_micro_summary_id();
        assert_ne!(a.0, b.0);
    }

    #[test]
    fn test_channel_parse() {
        assert_eq!(
            EventChannel::parse("scene_index"),
            Some(EventChannel::SceneIndex)
        );
        assert_eq!(EventChannel::parse("heartbeat"), None);
        assert_eq!(EventChannel::Alert.as_str(), "alert");
    }

    #[test]
    fn test_productivity_parse_defaults_to_neutral() {
        assert_eq!(
            ProductivityLabel::parse("Productive"),
            ProductivityLabel::Productive
        );
        assert_eq!(
            ProductivityLabel::parse("extremely busy"),
            ProductivityLabel::Neutral
        );
        assert_eq!(ProductivityLabel::parse(""), ProductivityLabel::Neutral);
    }

    #[test]
    fn test_day_bounds_cover_24_hours() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let (start, end) = day_bounds(date);
        assert_eq!((end - start).num_hours(), 24);
        assert_eq!(local_date_of(start), date);
    }

    #[test]
    fn test_segment_duration() {
        let start = Utc::now();
        let segment = ActivitySegment {
            id: generate_segment_id(),
            session_id: "session-1".to_string(),
            start_time: start,
            end_time: start + chrono::Duration::seconds(90),
            app_name: "Terminal".to_string(),
            category: AppCategory::Development,
            action: ActionTag::Coding,
            project: None,
            context: None,
            transcript: None,
            event_count: 3,
            is_idle: false,
        };
        assert_eq!(segment.duration_secs(), 90);
    }
}
