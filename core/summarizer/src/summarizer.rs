use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use recap_schemas::{
    day_bounds, generate_micro_summary_id, generate_session_summary_id, local_date_of,
    DailySummary, DaySection, MicroSummary, ProductivityLabel, SessionSummary,
};
use recap_store::Database;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::llm::{CompletionApi, CompletionRequest};
use crate::prompts::{self, SummarizerConfig};

const NO_SESSION_MESSAGE: &str = "No tracking session is active.";
const NO_EVENTS_MESSAGE: &str = "No activity was recorded in this time range.";
const NO_ACTIVITY_MESSAGE: &str = "No activity recorded yet today.";
const ANALYSIS_UNAVAILABLE_MESSAGE: &str = "Analysis is unavailable right now.";

/// Result of one summary-generation attempt. `Empty` means there was nothing
/// to summarize (or no completion client is wired); `Failed` means the
/// attempt ran and degraded. Neither is an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Produced(T),
    Empty,
    Failed,
}

impl<T> Outcome<T> {
    pub fn produced(self) -> Option<T> {
        match self {
            Outcome::Produced(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Outcome::Empty)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed)
    }
}

struct SummarySession {
    session_id: String,
    started_at: DateTime<Utc>,
    /// Segments at or before this instant are already micro-summarized.
    last_micro_time: DateTime<Utc>,
    /// Micro-summaries before this instant are already session-summarized.
    last_session_time: DateTime<Utc>,
}

type DeepDiveKey = (String, i64, i64);

/// Model-supplied fields only; every numeric aggregate is recomputed from
/// stored rows.
#[derive(Debug, Deserialize)]
struct MicroModelOutput {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    primary_activity: Option<String>,
    #[serde(default)]
    productivity_label: Option<String>,
    #[serde(default)]
    project: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionModelOutput {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    productivity_label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DailyModelOutput {
    #[serde(default)]
    headline: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    highlights: Vec<String>,
    #[serde(default)]
    improvements: Vec<String>,
    #[serde(default)]
    sections: Vec<SectionModelOutput>,
}

#[derive(Debug, Deserialize)]
struct SectionModelOutput {
    #[serde(default)]
    title: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    start_hour: u32,
    #[serde(default)]
    end_hour: u32,
}

/// Escalates segments into micro-summaries, micro-summaries into session
/// summaries, and those into a per-date daily summary; also serves cached
/// on-demand deep dives.
///
/// Cloneable handle over shared state; the caller owns one per session.
/// Completion failures never propagate — they fold into `Outcome::Failed` or
/// a fallback string. Storage failures do propagate.
#[derive(Clone)]
pub struct Summarizer {
    db: Arc<Mutex<Database>>,
    client: Option<Arc<dyn CompletionApi>>,
    config: Arc<SummarizerConfig>,
    state: Arc<Mutex<Option<SummarySession>>>,
    cache: Arc<Mutex<HashMap<DeepDiveKey, String>>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Summarizer {
    pub fn new(
        db: Arc<Mutex<Database>>,
        client: Option<Arc<dyn CompletionApi>>,
        config: SummarizerConfig,
    ) -> Self {
        Self {
            db,
            client,
            config: Arc::new(config),
            state: Arc::new(Mutex::new(None)),
            cache: Arc::new(Mutex::new(HashMap::new())),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Initialize watermarks for a fresh session and arm the micro and
    /// session interval timers.
    pub async fn start_periodic_summaries(&self, session_id: &str) {
        let now = Utc::now();
        {
            let mut state = self.state.lock().await;
            *state = Some(SummarySession {
                session_id: session_id.to_string(),
                started_at: now,
                last_micro_time: now,
                last_session_time: now,
            });
        }

        let micro = self.clone();
        let micro_interval = self.config.micro_interval;
        let micro_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(micro_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = micro.generate_micro_summary(None).await {
                    error!("Periodic micro-summary failed: {e:#}");
                }
            }
        });

        let session = self.clone();
        let session_interval = self.config.session_interval;
        let session_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(session_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = session.generate_session_summary().await {
                    error!("Periodic session summary failed: {e:#}");
                }
            }
        });

        let mut tasks = self.tasks.lock().await;
        for old in tasks.drain(..) {
            old.abort();
        }
        tasks.push(micro_task);
        tasks.push(session_task);

        info!("Started periodic summaries for session {}", session_id);
    }

    /// Digest segments newer than the micro watermark (or inside an explicit
    /// window) into one micro-summary.
    ///
    /// The app-duration breakdown is recomputed from segment durations; the
    /// model contributes prose, the productivity label and a project guess.
    /// A returned project is backfilled onto the contributing segments — the
    /// one sanctioned mutation of stored segments.
    pub async fn generate_micro_summary(
        &self,
        window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Outcome<MicroSummary>> {
        let Some((session_id, watermark)) = self.session_view(|s| s.last_micro_time).await else {
            debug!("Micro summary skipped: no active session");
            return Ok(Outcome::Empty);
        };

        let (segments, known_projects) = {
            let db = self.db.lock().await;
            let segments = match window {
                Some((start, end)) => db.segments_between(&session_id, start, end)?,
                None => db.segments_after(&session_id, watermark)?,
            };
            let known_projects = db.distinct_projects(&session_id)?;
            (segments, known_projects)
        };

        if segments.is_empty() {
            return Ok(Outcome::Empty);
        }
        let Some(client) = &self.client else {
            debug!("Micro summary skipped: no completion client");
            return Ok(Outcome::Empty);
        };

        let request = CompletionRequest {
            system: self.config.prompts.micro_summary.clone(),
            user: prompts::micro_user_prompt(&segments, &known_projects),
            max_tokens: self.config.max_tokens,
            json: true,
        };

        let raw = match client.complete(request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Micro-summary completion failed: {e:#}");
                return Ok(Outcome::Failed);
            }
        };
        let parsed: MicroModelOutput = match serde_json::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Micro-summary model output was not valid JSON: {e}");
                return Ok(Outcome::Failed);
            }
        };

        let start_time = segments[0].start_time;
        let end_time = segments
            .iter()
            .map(|s| s.end_time)
            .max()
            .unwrap_or(start_time);

        let mut app_breakdown: BTreeMap<String, i64> = BTreeMap::new();
        for segment in &segments {
            *app_breakdown.entry(segment.app_name.clone()).or_insert(0) +=
                segment.duration_secs();
        }

        let productivity = parsed
            .productivity_label
            .as_deref()
            .map(ProductivityLabel::parse)
            .unwrap_or(ProductivityLabel::Neutral);
        let project = normalize_project(parsed.project);
        let segment_ids: Vec<_> = segments.iter().map(|s| s.id.clone()).collect();

        let micro = MicroSummary {
            id: generate_micro_summary_id(),
            session_id: session_id.clone(),
            start_time,
            end_time,
            summary: parsed.summary.unwrap_or_default(),
            app_breakdown,
            primary_activity: parsed
                .primary_activity
                .unwrap_or_else(|| "working".to_string()),
            productivity,
            project: project.clone(),
            segment_ids: segment_ids.clone(),
        };

        {
            let db = self.db.lock().await;
            if let Some(project) = &project {
                db.annotate_segments_project(&segment_ids, project)?;
            }
            db.insert_micro_summary(&micro)?;
        }

        {
            let mut state = self.state.lock().await;
            if let Some(session) = state.as_mut() {
                if micro.end_time > session.last_micro_time {
                    session.last_micro_time = micro.end_time;
                }
            }
        }

        info!(
            "Micro summary {} covers {} segments ({})",
            micro.id,
            micro.segment_ids.len(),
            prompts::format_duration(micro.duration_secs())
        );
        Ok(Outcome::Produced(micro))
    }

    /// Roll up micro-summaries since the session watermark.
    ///
    /// Deterministic fields: key activities (one line per micro), per-app
    /// seconds summed across micro breakdowns (TLD-normalized names), and
    /// per-project seconds summed from the segments in range — segments, not
    /// micros, are the source of truth for project attribution.
    pub async fn generate_session_summary(&self) -> Result<Outcome<SessionSummary>> {
        let Some((session_id, since)) = self.session_view(|s| s.last_session_time).await else {
            debug!("Session summary skipped: no active session");
            return Ok(Outcome::Empty);
        };
        let now = Utc::now();

        let micros = {
            let db = self.db.lock().await;
            db.micro_summaries_between(&session_id, since, now)?
        };
        if micros.is_empty() {
            return Ok(Outcome::Empty);
        }
        let Some(client) = &self.client else {
            debug!("Session summary skipped: no completion client");
            return Ok(Outcome::Empty);
        };

        let start_time = micros[0].start_time;
        let end_time = micros.iter().map(|m| m.end_time).max().unwrap_or(start_time);

        let key_activities: Vec<String> = micros
            .iter()
            .map(|m| {
                format!(
                    "{} ({})",
                    m.primary_activity,
                    prompts::format_duration(m.duration_secs())
                )
            })
            .collect();

        let mut app_breakdown: BTreeMap<String, i64> = BTreeMap::new();
        for micro in &micros {
            for (app, secs) in &micro.app_breakdown {
                *app_breakdown
                    .entry(prompts::normalize_app_name(app))
                    .or_insert(0) += secs;
            }
        }

        let mut project_breakdown: BTreeMap<String, i64> = BTreeMap::new();
        {
            let db = self.db.lock().await;
            for segment in db.segments_between(&session_id, start_time, end_time)? {
                if let Some(project) = segment.project.as_deref().filter(|p| !p.is_empty()) {
                    *project_breakdown.entry(project.to_string()).or_insert(0) +=
                        segment.duration_secs();
                }
            }
        }

        let request = CompletionRequest {
            system: self.config.prompts.session_summary.clone(),
            user: prompts::session_user_prompt(&micros),
            max_tokens: self.config.max_tokens,
            json: true,
        };

        let raw = match client.complete(request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Session-summary completion failed: {e:#}");
                return Ok(Outcome::Failed);
            }
        };
        let parsed: SessionModelOutput = match serde_json::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Session-summary model output was not valid JSON: {e}");
                return Ok(Outcome::Failed);
            }
        };

        let summary = SessionSummary {
            id: generate_session_summary_id(),
            session_id: session_id.clone(),
            date: local_date_of(start_time),
            start_time,
            end_time,
            summary: parsed.summary.unwrap_or_default(),
            key_activities,
            project_breakdown,
            app_breakdown,
            productivity: parsed
                .productivity_label
                .as_deref()
                .map(ProductivityLabel::parse)
                .unwrap_or(ProductivityLabel::Neutral),
        };

        {
            let db = self.db.lock().await;
            db.insert_session_summary(&summary)?;
        }

        {
            let mut state = self.state.lock().await;
            if let Some(session) = state.as_mut() {
                session.last_session_time = now;
            }
        }

        info!(
            "Session summary {} rolls up {} micro-summaries",
            summary.id,
            micros.len()
        );
        Ok(Outcome::Produced(summary))
    }

    /// Consolidate a calendar date into its single daily row (upserted).
    ///
    /// Inputs are the date's session summaries, falling back to its
    /// micro-summaries; with neither, no completion call is made. All numeric
    /// totals come from the stored aggregates, never the model.
    pub async fn generate_daily_summary(&self, date: NaiveDate) -> Result<Outcome<DailySummary>> {
        let (sessions, micros, stats) = {
            let db = self.db.lock().await;
            let sessions = db.session_summaries_for_date(date)?;
            let micros = if sessions.is_empty() {
                db.micro_summaries_for_day(date)?
            } else {
                Vec::new()
            };
            if sessions.is_empty() && micros.is_empty() {
                return Ok(Outcome::Empty);
            }
            let stats = db.day_stats(date, self.config.top_n)?;
            (sessions, micros, stats)
        };

        let Some(client) = &self.client else {
            debug!("Daily summary skipped: no completion client");
            return Ok(Outcome::Empty);
        };

        let request = CompletionRequest {
            system: self.config.prompts.daily_summary.clone(),
            user: prompts::daily_user_prompt(date, &sessions, &micros, &stats),
            max_tokens: self.config.max_tokens,
            json: true,
        };

        let raw = match client.complete(request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Daily-summary completion failed: {e:#}");
                return Ok(Outcome::Failed);
            }
        };
        let parsed: DailyModelOutput = match serde_json::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Daily-summary model output was not valid JSON: {e}");
                return Ok(Outcome::Failed);
            }
        };

        let (midnight, _) = day_bounds(date);
        let sections: Vec<DaySection> = parsed
            .sections
            .into_iter()
            .filter_map(|s| {
                let start_hour = s.start_hour.min(24);
                let end_hour = s.end_hour.min(24);
                if end_hour < start_hour {
                    return None;
                }
                Some(DaySection {
                    title: s.title,
                    summary: s.summary,
                    start_time: midnight + chrono::Duration::hours(start_hour as i64),
                    end_time: midnight + chrono::Duration::hours(end_hour as i64),
                })
            })
            .collect();

        let daily = DailySummary {
            date,
            headline: parsed.headline.unwrap_or_default(),
            summary: parsed.summary.unwrap_or_default(),
            highlights: parsed.highlights,
            improvements: parsed.improvements,
            sections,
            tracked_secs: stats.tracked_secs,
            idle_secs: stats.idle_secs,
            productive_secs: stats.productive_secs,
            distracted_secs: stats.distracted_secs,
            top_apps: stats.top_apps,
            top_projects: stats.top_projects,
        };

        {
            let db = self.db.lock().await;
            db.upsert_daily_summary(&daily)?;
        }

        info!("Daily summary upserted for {}", date);
        Ok(Outcome::Produced(daily))
    }

    /// On-demand free-text analysis of the raw events in a time range,
    /// cached by (session, range).
    ///
    /// Cache entries are never invalidated: a range analyzed before more
    /// events landed keeps serving the original analysis.
    pub async fn generate_deep_dive(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<String> {
        let Some((session_id, _)) = self.session_view(|s| s.started_at).await else {
            return Ok(NO_SESSION_MESSAGE.to_string());
        };

        let key: DeepDiveKey = (session_id.clone(), start.timestamp(), end.timestamp());
        {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.get(&key) {
                debug!("Deep dive served from cache for {:?}", key);
                return Ok(cached.clone());
            }
        }

        let events = {
            let db = self.db.lock().await;
            db.events_between(&session_id, start, end)?
        };
        if events.is_empty() {
            return Ok(NO_EVENTS_MESSAGE.to_string());
        }
        let Some(client) = &self.client else {
            return Ok(ANALYSIS_UNAVAILABLE_MESSAGE.to_string());
        };

        let request = CompletionRequest {
            system: self.config.prompts.deep_dive.clone(),
            user: prompts::deep_dive_user_prompt(start, end, &events),
            max_tokens: self.config.max_tokens,
            json: false,
        };

        match client.complete(request).await {
            Ok(analysis) => {
                let mut cache = self.cache.lock().await;
                cache.insert(key, analysis.clone());
                Ok(analysis)
            }
            Err(e) => {
                // Failures are not cached, so the next request retries.
                warn!("Deep-dive completion failed: {e:#}");
                Ok(ANALYSIS_UNAVAILABLE_MESSAGE.to_string())
            }
        }
    }

    /// User-triggered "summarize now": flush pending segments into a micro,
    /// then digest today's micro-summaries without persisting anything new.
    pub async fn generate_on_demand_summary(&self) -> Result<String> {
        // Best-effort forced flush; Empty/Failed just means nothing new.
        self.generate_micro_summary(None).await?;

        let Some((session_id, _)) = self.session_view(|s| s.started_at).await else {
            return Ok(NO_SESSION_MESSAGE.to_string());
        };

        let micros = {
            let db = self.db.lock().await;
            db.micro_summaries_for_session_on(&session_id, local_date_of(Utc::now()))?
        };

        let Some(latest) = micros.last().map(|m| m.summary.clone()) else {
            return Ok(NO_ACTIVITY_MESSAGE.to_string());
        };
        if micros.len() == 1 {
            return Ok(latest);
        }
        let Some(client) = &self.client else {
            return Ok(latest);
        };

        let request = CompletionRequest {
            system: self.config.prompts.session_summary.clone(),
            user: prompts::on_demand_user_prompt(&micros),
            max_tokens: self.config.max_tokens,
            json: true,
        };

        match client.complete(request).await {
            Ok(raw) => match serde_json::from_str::<SessionModelOutput>(&raw) {
                Ok(parsed) => Ok(parsed.summary.unwrap_or(latest)),
                Err(e) => {
                    warn!("On-demand model output was not valid JSON: {e}");
                    Ok(latest)
                }
            },
            Err(e) => {
                warn!("On-demand completion failed: {e:#}");
                Ok(latest)
            }
        }
    }

    /// Disarm both timers, then drain the pipeline: final micro-summary,
    /// final session summary, daily summary for today. Each step is
    /// best-effort; a failure is logged and the next step still runs.
    pub async fn stop_periodic_summaries(&self) {
        {
            let mut tasks = self.tasks.lock().await;
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }

        if let Err(e) = self.generate_micro_summary(None).await {
            warn!("Final micro-summary flush failed: {e:#}");
        }
        if let Err(e) = self.generate_session_summary().await {
            warn!("Final session summary failed: {e:#}");
        }
        if let Err(e) = self.generate_daily_summary(local_date_of(Utc::now())).await {
            warn!("Daily summary at stop failed: {e:#}");
        }

        let mut state = self.state.lock().await;
        if let Some(session) = state.take() {
            info!("Summarizer drained for session {}", session.session_id);
        }
    }

    async fn session_view<F, R>(&self, f: F) -> Option<(String, R)>
    where
        F: FnOnce(&SummarySession) -> R,
    {
        let state = self.state.lock().await;
        state.as_ref().map(|s| (s.session_id.clone(), f(s)))
    }
}

/// Model project strings are normalized: empty and null-like values mean "no
/// project".
fn normalize_project(project: Option<String>) -> Option<String> {
    let project = project?;
    let trimmed = project.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.to_lowercase().as_str() {
        "null" | "none" | "n/a" | "unknown" => None,
        _ => Some(trimmed.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_project() {
        assert_eq!(normalize_project(None), None);
        assert_eq!(normalize_project(Some("".to_string())), None);
        assert_eq!(normalize_project(Some("  ".to_string())), None);
        assert_eq!(normalize_project(Some("null".to_string())), None);
        assert_eq!(normalize_project(Some("None".to_string())), None);
        assert_eq!(normalize_project(Some("n/a".to_string())), None);
        assert_eq!(
            normalize_project(Some(" recap ".to_string())),
            Some("recap".to_string())
        );
    }

    #[test]
    fn test_outcome_helpers() {
        let produced: Outcome<i32> = Outcome::Produced(7);
        assert_eq!(produced.clone().produced(), Some(7));
        assert!(!produced.is_empty());

        let empty: Outcome<i32> = Outcome::Empty;
        assert!(empty.is_empty());
        assert_eq!(empty.produced(), None);

        let failed: Outcome<i32> = Outcome::Failed;
        assert!(failed.is_failed());
    }
}
