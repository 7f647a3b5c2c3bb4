use chrono::{DateTime, NaiveDate, Utc};
use recap_schemas::{ActivitySegment, DayStats, MicroSummary, RawEvent, SessionSummary};
use serde_json::json;
use std::time::Duration;

/// Deep dives show at most this many raw events, with an overflow note.
pub const DEEP_DIVE_EVENT_CAP: usize = 50;

const DEEP_DIVE_TEXT_MAX_CHARS: usize = 120;

/// The prompt templates the config provider supplies. Each entry is the
/// system prompt for one summary tier; the on-demand path reuses
/// `session_summary`.
#[derive(Debug, Clone)]
pub struct PromptSet {
    pub micro_summary: String,
    pub session_summary: String,
    pub daily_summary: String,
    pub deep_dive: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            micro_summary: "You summarize a short window of computer activity. \
                The user message is a JSON object with activity segments and the project \
                names already seen this session. Respond with a JSON object: \
                {\"summary\": string (1-2 sentences), \"primary_activity\": string, \
                \"productivity_label\": \"productive\"|\"neutral\"|\"distracted\", \
                \"project\": string|null}. Prefer reusing a known project name over \
                inventing a variant; use null when no project is evident. Do not \
                include durations or statistics in the summary."
                .to_string(),
            session_summary: "You roll up micro-summaries of computer activity into one \
                session overview. The user message lists each micro-summary with its \
                time range, activity and productivity label. Respond with a JSON \
                object: {\"summary\": string (2-3 sentences), \"productivity_label\": \
                \"productive\"|\"neutral\"|\"distracted\"}. Describe what was worked \
                on, not numbers; durations are computed elsewhere."
                .to_string(),
            daily_summary: "You write an end-of-day review from session summaries (or \
                micro-summaries) and a precomputed stats block. Respond with a JSON \
                object: {\"headline\": string, \"summary\": string, \"highlights\": \
                [string], \"improvements\": [string], \"sections\": [{\"title\": \
                string, \"summary\": string, \"start_hour\": number, \"end_hour\": \
                number}]}. Hours are 0-24 within the day. Never restate totals that \
                are already in the stats block as your own computation."
                .to_string(),
            deep_dive: "You analyze a raw log of screen and audio activity events for \
                one time range and answer with plain text, not JSON. Describe what \
                happened, in what order, and anything notable about focus or context \
                switches. Be concrete and concise."
                .to_string(),
        }
    }
}

/// Intervals and knobs for the summarizer, owned by the caller.
#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    pub micro_interval: Duration,
    pub session_interval: Duration,
    /// Rows in the top-apps/top-projects tables of a daily summary.
    pub top_n: usize,
    pub max_tokens: u32,
    pub prompts: PromptSet,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            micro_interval: Duration::from_secs(10 * 60),
            session_interval: Duration::from_secs(60 * 60),
            top_n: 5,
            max_tokens: 1024,
            prompts: PromptSet::default(),
        }
    }
}

// ============================================================================
// User-prompt builders (deterministic renderings of stored rows)
// ============================================================================

pub fn micro_user_prompt(segments: &[ActivitySegment], known_projects: &[String]) -> String {
    let rows: Vec<serde_json::Value> = segments
        .iter()
        .map(|s| {
            json!({
                "app": s.app_name,
                "category": s.category.as_str(),
                "action": s.action.as_str(),
                "context": s.context,
                "transcript": s.transcript,
                "duration_secs": s.duration_secs(),
                "idle": s.is_idle,
            })
        })
        .collect();

    json!({
        "segments": rows,
        "known_projects": known_projects,
    })
    .to_string()
}

pub fn session_user_prompt(micros: &[MicroSummary]) -> String {
    let mut lines = vec!["Micro-summaries for this session:".to_string()];
    lines.extend(micros.iter().map(micro_digest_line));
    lines.join("\n")
}

pub fn on_demand_user_prompt(micros: &[MicroSummary]) -> String {
    let mut lines = vec![
        "Summarize the activity so far today, as of right now:".to_string(),
    ];
    lines.extend(micros.iter().map(micro_digest_line));
    lines.join("\n")
}

pub fn daily_user_prompt(
    date: NaiveDate,
    sessions: &[SessionSummary],
    micros: &[MicroSummary],
    stats: &DayStats,
) -> String {
    let mut lines = vec![format!("Day under review: {date}")];

    if !sessions.is_empty() {
        lines.push("Session summaries:".to_string());
        for s in sessions {
            lines.push(format!(
                "- {}-{} [{}] {}",
                s.start_time.format("%H:%M"),
                s.end_time.format("%H:%M"),
                s.productivity.as_str(),
                s.summary
            ));
        }
    } else {
        lines.push("Micro-summaries (no full sessions recorded):".to_string());
        lines.extend(micros.iter().map(micro_digest_line));
    }

    lines.push(String::new());
    lines.push(stats_block(stats));
    lines.join("\n")
}

pub fn deep_dive_user_prompt(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    events: &[RawEvent],
) -> String {
    let mut lines = vec![format!(
        "Activity events from {} to {}:",
        start.format("%H:%M"),
        end.format("%H:%M")
    )];

    for event in events.iter().take(DEEP_DIVE_EVENT_CAP) {
        let app = event.app_name.as_deref().unwrap_or("-");
        lines.push(format!(
            "[{}] {} {} — {}",
            event.timestamp.format("%H:%M"),
            event.channel.as_str(),
            app,
            truncate(&event.text, DEEP_DIVE_TEXT_MAX_CHARS)
        ));
    }

    if events.len() > DEEP_DIVE_EVENT_CAP {
        lines.push(format!("(+{} more events)", events.len() - DEEP_DIVE_EVENT_CAP));
    }

    lines.join("\n")
}

fn micro_digest_line(micro: &MicroSummary) -> String {
    format!(
        "- {}-{} {} [{}] ({}): {}",
        micro.start_time.format("%H:%M"),
        micro.end_time.format("%H:%M"),
        micro.primary_activity,
        micro.productivity.as_str(),
        format_duration(micro.duration_secs()),
        micro.summary
    )
}

/// Rendered deterministic stats for the daily prompt.
pub fn stats_block(stats: &DayStats) -> String {
    let mut lines = vec![
        "Stats (precomputed, authoritative):".to_string(),
        format!("Tracked: {}", format_duration(stats.tracked_secs)),
        format!("Idle: {}", format_duration(stats.idle_secs)),
        format!("Productive: {}", format_duration(stats.productive_secs)),
        format!("Distracted: {}", format_duration(stats.distracted_secs)),
    ];

    if !stats.top_apps.is_empty() {
        let apps: Vec<String> = stats
            .top_apps
            .iter()
            .map(|a| format!("{} ({})", a.app_name, format_duration(a.seconds)))
            .collect();
        lines.push(format!("Top apps: {}", apps.join(", ")));
    }

    if !stats.top_projects.is_empty() {
        let projects: Vec<String> = stats
            .top_projects
            .iter()
            .map(|p| format!("{} ({})", p.project, format_duration(p.seconds)))
            .collect();
        lines.push(format!("Top projects: {}", projects.join(", ")));
    }

    lines.join("\n")
}

// ============================================================================
// Formatting helpers
// ============================================================================

/// Human-readable duration: "45s", "12m", "1h 05m".
pub fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Strip a trailing TLD so "github.com" and "github" aggregate together.
pub fn normalize_app_name(name: &str) -> String {
    let trimmed = name.trim();
    for suffix in [".com", ".org", ".net", ".io", ".app", ".dev"] {
        if let Some(stripped) = trimmed.strip_suffix(suffix) {
            if !stripped.is_empty() {
                return stripped.to_string();
            }
        }
    }
    trimmed.to_string()
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut truncated: String = text.chars().take(max_chars).collect();
        truncated.push('…');
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use recap_schemas::{
        generate_event_id, generate_micro_summary_id, generate_segment_id, AppCategory,
        EventChannel, ProductivityLabel,
    };
    use std::collections::BTreeMap;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(60), "1m");
        assert_eq!(format_duration(12 * 60 + 30), "12m");
        assert_eq!(format_duration(3900), "1h 05m");
        assert_eq!(format_duration(-5), "0s");
    }

    #[test]
    fn test_normalize_app_name() {
        assert_eq!(normalize_app_name("github.com"), "github");
        assert_eq!(normalize_app_name("notion.app"), "notion");
        assert_eq!(normalize_app_name("Terminal"), "Terminal");
        assert_eq!(normalize_app_name(".com"), ".com");
    }

    #[test]
    fn test_micro_prompt_includes_known_projects() {
        let now = Utc::now();
        let segment = ActivitySegment {
            id: generate_segment_id(),
            session_id: "s1".to_string(),
            start_time: now,
            end_time: now + ChronoDuration::seconds(300),
            app_name: "Visual Studio Code".to_string(),
            category: AppCategory::Development,
            action: recap_schemas::ActionTag::Coding,
            project: None,
            context: Some("Editing main.rs".to_string()),
            transcript: None,
            event_count: 5,
            is_idle: false,
        };

        let prompt = micro_user_prompt(&[segment], &["recap".to_string()]);
        assert!(prompt.contains("known_projects"));
        assert!(prompt.contains("recap"));
        assert!(prompt.contains("\"duration_secs\":300"));
    }

    #[test]
    fn test_deep_dive_prompt_caps_events() {
        let now = Utc::now();
        let events: Vec<RawEvent> = (0..60)
            .map(|i| RawEvent {
                id: generate_event_id(),
                session_id: "s1".to_string(),
                timestamp: now + ChronoDuration::seconds(i),
                channel: EventChannel::SceneIndex,
                app_name: Some("Terminal".to_string()),
                category: Some(AppCategory::Development),
                text: format!("event {i}"),
                payload: "{}".to_string(),
            })
            .collect();

        let prompt = deep_dive_user_prompt(now, now + ChronoDuration::seconds(60), &events);
        assert!(prompt.contains("(+10 more events)"));
        assert!(prompt.contains("event 49"));
        assert!(!prompt.contains("event 50\n"));
    }

    #[test]
    fn test_stats_block_renders_tables() {
        let stats = DayStats {
            tracked_secs: 3900,
            idle_secs: 300,
            productive_secs: 3000,
            distracted_secs: 120,
            top_apps: vec![recap_schemas::AppDuration {
                app_name: "Terminal".to_string(),
                seconds: 3600,
            }],
            top_projects: vec![recap_schemas::ProjectDuration {
                project: "recap".to_string(),
                seconds: 1800,
            }],
        };

        let block = stats_block(&stats);
        assert!(block.contains("Tracked: 1h 05m"));
        assert!(block.contains("Top apps: Terminal (1h 00m)"));
        assert!(block.contains("Top projects: recap (30m)"));
    }

    #[test]
    fn test_session_prompt_digest_lines() {
        let now = Utc::now();
        let micro = MicroSummary {
            id: generate_micro_summary_id(),
            session_id: "s1".to_string(),
            start_time: now,
            end_time: now + ChronoDuration::seconds(600),
            summary: "Worked on the parser".to_string(),
            app_breakdown: BTreeMap::new(),
            primary_activity: "coding".to_string(),
            productivity: ProductivityLabel::Productive,
            project: None,
            segment_ids: vec![],
        };

        let prompt = session_user_prompt(&[micro]);
        assert!(prompt.contains("coding [productive] (10m): Worked on the parser"));
    }
}
