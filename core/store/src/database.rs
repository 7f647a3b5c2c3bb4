use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use recap_schemas::{
    day_bounds, ActivitySegment, AppCategory, AppDuration, DailySummary, DaySection, DayStats,
    EventChannel, EventId, MicroSummary, MicroSummaryId, ProductivityLabel, ProjectDuration,
    RawEvent, SegmentId, SessionSummary, SessionSummaryId,
};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

const DATE_FORMAT: &str = "%Y-%m-%d";

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Initialize the database with the pipeline schema.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;

        let db = Self { conn };
        db.init_schema()?;

        info!("Database initialized");
        Ok(db)
    }

    /// In-memory database, used by tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;

        let db = Self { conn };
        db.init_schema()?;

        Ok(db)
    }

    /// Create all tables and indexes
    fn init_schema(&self) -> Result<()> {
        // Raw events (append-only within a session)
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                ts TEXT NOT NULL,
                channel TEXT NOT NULL,
                app_name TEXT,
                category TEXT,
                text TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        // Activity segments. `project` is the only column ever updated after
        // insert, via annotate_segments_project.
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS segments (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                duration_secs INTEGER NOT NULL,
                app_name TEXT NOT NULL,
                category TEXT NOT NULL,
                action TEXT NOT NULL,
                project TEXT,
                context TEXT,
                transcript TEXT,
                event_count INTEGER NOT NULL,
                is_idle INTEGER NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS micro_summaries (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                duration_secs INTEGER NOT NULL,
                summary TEXT NOT NULL,
                app_breakdown TEXT NOT NULL,
                primary_activity TEXT NOT NULL,
                productivity TEXT NOT NULL,
                project TEXT,
                segment_ids TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS session_summaries (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                date TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                summary TEXT NOT NULL,
                key_activities TEXT NOT NULL,
                project_breakdown TEXT NOT NULL,
                app_breakdown TEXT NOT NULL,
                productivity TEXT NOT NULL
            )",
            [],
        )?;

        // One row per calendar date, overwritten on regeneration.
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS daily_summaries (
                date TEXT PRIMARY KEY,
                headline TEXT NOT NULL,
                summary TEXT NOT NULL,
                highlights TEXT NOT NULL,
                improvements TEXT NOT NULL,
                sections TEXT NOT NULL,
                tracked_secs INTEGER NOT NULL,
                idle_secs INTEGER NOT NULL,
                productive_secs INTEGER NOT NULL,
                distracted_secs INTEGER NOT NULL,
                top_apps TEXT NOT NULL,
                top_projects TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        // Indexes for performance
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_session_ts ON events(session_id, ts)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_segments_session_start ON segments(session_id, start_time)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_segments_start ON segments(start_time)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_micro_session_start ON micro_summaries(session_id, start_time)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_micro_start ON micro_summaries(start_time)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_session_summaries_date ON session_summaries(date)",
            [],
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Raw events
    // ========================================================================

    /// Insert a raw event
    pub fn insert_event(&self, event: &RawEvent) -> Result<()> {
        self.conn.execute(
            "INSERT INTO events (id, session_id, ts, channel, app_name, category,
                                 text, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.id.0,
                event.session_id,
                event.timestamp.to_rfc3339(),
                event.channel.as_str(),
                event.app_name,
                event.category.map(|c| c.as_str()),
                event.text,
                event.payload,
                Utc::now().to_rfc3339(),
            ],
        )?;

        debug!("Inserted event: {}", event.id);
        Ok(())
    }

    /// All raw events for a session inside `[start, end]`, in time order.
    pub fn events_between(
        &self,
        session_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, ts, channel, app_name, category, text, payload
             FROM events
             WHERE session_id = ?1 AND ts >= ?2 AND ts <= ?3
             ORDER BY ts ASC",
        )?;

        let events = stmt
            .query_map(
                params![session_id, start.to_rfc3339(), end.to_rfc3339()],
                row_to_event,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(events)
    }

    // ========================================================================
    // Segments
    // ========================================================================

    /// Batch insert one flush's segments, preserving their time order.
    pub fn insert_segments(&mut self, segments: &[ActivitySegment]) -> Result<()> {
        let tx = self.conn.transaction()?;

        for segment in segments {
            tx.execute(
                "INSERT INTO segments (id, session_id, start_time, end_time, duration_secs,
                                       app_name, category, action, project, context,
                                       transcript, event_count, is_idle)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    segment.id.0,
                    segment.session_id,
                    segment.start_time.to_rfc3339(),
                    segment.end_time.to_rfc3339(),
                    segment.duration_secs(),
                    segment.app_name,
                    segment.category.as_str(),
                    segment.action.as_str(),
                    segment.project,
                    segment.context,
                    segment.transcript,
                    segment.event_count,
                    segment.is_idle,
                ],
            )?;
        }

        tx.commit()?;

        debug!("Inserted {} segments", segments.len());
        Ok(())
    }

    /// Segments for a session strictly after `watermark`, in time order.
    pub fn segments_after(
        &self,
        session_id: &str,
        watermark: DateTime<Utc>,
    ) -> Result<Vec<ActivitySegment>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, start_time, end_time, app_name, category, action,
                    project, context, transcript, event_count, is_idle
             FROM segments
             WHERE session_id = ?1 AND start_time > ?2
             ORDER BY start_time ASC",
        )?;

        let segments = stmt
            .query_map(params![session_id, watermark.to_rfc3339()], row_to_segment)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(segments)
    }

    /// Segments for a session starting inside `[start, end]`, in time order.
    pub fn segments_between(
        &self,
        session_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ActivitySegment>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, start_time, end_time, app_name, category, action,
                    project, context, transcript, event_count, is_idle
             FROM segments
             WHERE session_id = ?1 AND start_time >= ?2 AND start_time <= ?3
             ORDER BY start_time ASC",
        )?;

        let segments = stmt
            .query_map(
                params![session_id, start.to_rfc3339(), end.to_rfc3339()],
                row_to_segment,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(segments)
    }

    /// Backfill an inferred project onto segments.
    ///
    /// Segments are immutable after insert; this is the single sanctioned
    /// exception, keyed by explicit id list.
    pub fn annotate_segments_project(&self, ids: &[SegmentId], project: &str) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let placeholders = (2..ids.len() + 2)
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("UPDATE segments SET project = ?1 WHERE id IN ({placeholders})");

        let mut values: Vec<String> = Vec::with_capacity(ids.len() + 1);
        values.push(project.to_string());
        values.extend(ids.iter().map(|id| id.0.clone()));

        let updated = self.conn.execute(&sql, params_from_iter(values.iter()))?;

        debug!("Annotated {} segments with project '{}'", updated, project);
        Ok(updated)
    }

    /// Distinct non-empty project names seen in a session, for prompt biasing.
    pub fn distinct_projects(&self, session_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT project FROM segments
             WHERE session_id = ?1 AND project IS NOT NULL AND project != ''
             ORDER BY project ASC",
        )?;

        let projects = stmt
            .query_map(params![session_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(projects)
    }

    // ========================================================================
    // Micro summaries
    // ========================================================================

    pub fn insert_micro_summary(&self, micro: &MicroSummary) -> Result<()> {
        self.conn.execute(
            "INSERT INTO micro_summaries (id, session_id, start_time, end_time, duration_secs,
                                          summary, app_breakdown, primary_activity,
                                          productivity, project, segment_ids)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                micro.id.0,
                micro.session_id,
                micro.start_time.to_rfc3339(),
                micro.end_time.to_rfc3339(),
                micro.duration_secs(),
                micro.summary,
                serde_json::to_string(&micro.app_breakdown)?,
                micro.primary_activity,
                micro.productivity.as_str(),
                micro.project,
                serde_json::to_string(&micro.segment_ids)?,
            ],
        )?;

        debug!("Inserted micro summary: {}", micro.id);
        Ok(())
    }

    /// Micro summaries for a session starting inside `[start, end]`.
    pub fn micro_summaries_between(
        &self,
        session_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MicroSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, start_time, end_time, summary, app_breakdown,
                    primary_activity, productivity, project, segment_ids
             FROM micro_summaries
             WHERE session_id = ?1 AND start_time >= ?2 AND start_time <= ?3
             ORDER BY start_time ASC",
        )?;

        let micros = stmt
            .query_map(
                params![session_id, start.to_rfc3339(), end.to_rfc3339()],
                row_to_micro,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(micros)
    }

    /// All micro summaries falling on a calendar day, any session.
    pub fn micro_summaries_for_day(&self, date: NaiveDate) -> Result<Vec<MicroSummary>> {
        let (start, end) = day_bounds(date);
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, start_time, end_time, summary, app_breakdown,
                    primary_activity, productivity, project, segment_ids
             FROM micro_summaries
             WHERE start_time >= ?1 AND start_time < ?2
             ORDER BY start_time ASC",
        )?;

        let micros = stmt
            .query_map(params![start.to_rfc3339(), end.to_rfc3339()], row_to_micro)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(micros)
    }

    /// Micro summaries for one session on a calendar day.
    pub fn micro_summaries_for_session_on(
        &self,
        session_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<MicroSummary>> {
        let (start, end) = day_bounds(date);
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, start_time, end_time, summary, app_breakdown,
                    primary_activity, productivity, project, segment_ids
             FROM micro_summaries
             WHERE session_id = ?1 AND start_time >= ?2 AND start_time < ?3
             ORDER BY start_time ASC",
        )?;

        let micros = stmt
            .query_map(
                params![session_id, start.to_rfc3339(), end.to_rfc3339()],
                row_to_micro,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(micros)
    }

    // ========================================================================
    // Session summaries
    // ========================================================================

    pub fn insert_session_summary(&self, summary: &SessionSummary) -> Result<()> {
        self.conn.execute(
            "INSERT INTO session_summaries (id, session_id, date, start_time, end_time,
                                            summary, key_activities, project_breakdown,
                                            app_breakdown, productivity)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                summary.id.0,
                summary.session_id,
                summary.date.format(DATE_FORMAT).to_string(),
                summary.start_time.to_rfc3339(),
                summary.end_time.to_rfc3339(),
                summary.summary,
                serde_json::to_string(&summary.key_activities)?,
                serde_json::to_string(&summary.project_breakdown)?,
                serde_json::to_string(&summary.app_breakdown)?,
                summary.productivity.as_str(),
            ],
        )?;

        debug!("Inserted session summary: {}", summary.id);
        Ok(())
    }

    pub fn session_summaries_for_date(&self, date: NaiveDate) -> Result<Vec<SessionSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, date, start_time, end_time, summary, key_activities,
                    project_breakdown, app_breakdown, productivity
             FROM session_summaries
             WHERE date = ?1
             ORDER BY start_time ASC",
        )?;

        let summaries = stmt
            .query_map(
                params![date.format(DATE_FORMAT).to_string()],
                row_to_session_summary,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(summaries)
    }

    // ========================================================================
    // Daily summaries
    // ========================================================================

    /// Insert or overwrite the single row for a date.
    pub fn upsert_daily_summary(&self, daily: &DailySummary) -> Result<()> {
        self.conn.execute(
            "INSERT INTO daily_summaries (date, headline, summary, highlights, improvements,
                                          sections, tracked_secs, idle_secs, productive_secs,
                                          distracted_secs, top_apps, top_projects, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(date) DO UPDATE SET
                 headline = excluded.headline,
                 summary = excluded.summary,
                 highlights = excluded.highlights,
                 improvements = excluded.improvements,
                 sections = excluded.sections,
                 tracked_secs = excluded.tracked_secs,
                 idle_secs = excluded.idle_secs,
                 productive_secs = excluded.productive_secs,
                 distracted_secs = excluded.distracted_secs,
                 top_apps = excluded.top_apps,
                 top_projects = excluded.top_projects,
                 updated_at = excluded.updated_at",
            params![
                daily.date.format(DATE_FORMAT).to_string(),
                daily.headline,
                daily.summary,
                serde_json::to_string(&daily.highlights)?,
                serde_json::to_string(&daily.improvements)?,
                serde_json::to_string(&daily.sections)?,
                daily.tracked_secs,
                daily.idle_secs,
                daily.productive_secs,
                daily.distracted_secs,
                serde_json::to_string(&daily.top_apps)?,
                serde_json::to_string(&daily.top_projects)?,
                Utc::now().to_rfc3339(),
            ],
        )?;

        debug!("Upserted daily summary for {}", daily.date);
        Ok(())
    }

    pub fn daily_summary(&self, date: NaiveDate) -> Result<Option<DailySummary>> {
        let daily = self
            .conn
            .query_row(
                "SELECT date, headline, summary, highlights, improvements, sections,
                        tracked_secs, idle_secs, productive_secs, distracted_secs,
                        top_apps, top_projects
                 FROM daily_summaries WHERE date = ?1",
                params![date.format(DATE_FORMAT).to_string()],
                row_to_daily_summary,
            )
            .optional()?;

        Ok(daily)
    }

    // ========================================================================
    // Daily aggregates
    // ========================================================================

    /// Deterministic day-level aggregates: tracked/idle seconds from segments,
    /// productive/distracted seconds from micro summaries, plus top app and
    /// project duration tables.
    pub fn day_stats(&self, date: NaiveDate, top_n: usize) -> Result<DayStats> {
        let (start, end) = day_bounds(date);
        let start = start.to_rfc3339();
        let end = end.to_rfc3339();

        let tracked_secs: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(duration_secs), 0) FROM segments
             WHERE start_time >= ?1 AND start_time < ?2",
            params![start, end],
            |row| row.get(0),
        )?;

        let idle_secs: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(duration_secs), 0) FROM segments
             WHERE start_time >= ?1 AND start_time < ?2 AND is_idle = 1",
            params![start, end],
            |row| row.get(0),
        )?;

        let productive_secs: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(duration_secs), 0) FROM micro_summaries
             WHERE start_time >= ?1 AND start_time < ?2 AND productivity = 'productive'",
            params![start, end],
            |row| row.get(0),
        )?;

        let distracted_secs: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(duration_secs), 0) FROM micro_summaries
             WHERE start_time >= ?1 AND start_time < ?2 AND productivity = 'distracted'",
            params![start, end],
            |row| row.get(0),
        )?;

        let mut stmt = self.conn.prepare(
            "SELECT app_name, SUM(duration_secs) AS total FROM segments
             WHERE start_time >= ?1 AND start_time < ?2
             GROUP BY app_name
             ORDER BY total DESC
             LIMIT ?3",
        )?;
        let top_apps = stmt
            .query_map(params![start, end, top_n as i64], |row| {
                Ok(AppDuration {
                    app_name: row.get(0)?,
                    seconds: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT project, SUM(duration_secs) AS total FROM segments
             WHERE start_time >= ?1 AND start_time < ?2
               AND project IS NOT NULL AND project != ''
             GROUP BY project
             ORDER BY total DESC
             LIMIT ?3",
        )?;
        let top_projects = stmt
            .query_map(params![start, end, top_n as i64], |row| {
                Ok(ProjectDuration {
                    project: row.get(0)?,
                    seconds: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(DayStats {
            tracked_secs,
            idle_secs,
            productive_secs,
            distracted_secs,
            top_apps,
            top_projects,
        })
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn json_error(err: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err))
}

fn time_error(err: chrono::ParseError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err))
}

fn parse_ts(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(time_error)
}

fn parse_date(value: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(value, DATE_FORMAT).map_err(time_error)
}

fn row_to_event(row: &Row) -> rusqlite::Result<RawEvent> {
    let ts: String = row.get("ts")?;
    let channel: String = row.get("channel")?;
    let category: Option<String> = row.get("category")?;

    Ok(RawEvent {
        id: EventId(row.get("id")?),
        session_id: row.get("session_id")?,
        timestamp: parse_ts(&ts)?,
        // Unknown channels never reach the store; default defensively anyway.
        channel: EventChannel::parse(&channel).unwrap_or(EventChannel::Alert),
        app_name: row.get("app_name")?,
        category: category.map(|c| AppCategory::parse(&c)),
        text: row.get("text")?,
        payload: row.get("payload")?,
    })
}

fn row_to_segment(row: &Row) -> rusqlite::Result<ActivitySegment> {
    let start_time: String = row.get("start_time")?;
    let end_time: String = row.get("end_time")?;
    let category: String = row.get("category")?;
    let action: String = row.get("action")?;

    Ok(ActivitySegment {
        id: SegmentId(row.get("id")?),
        session_id: row.get("session_id")?,
        start_time: parse_ts(&start_time)?,
        end_time: parse_ts(&end_time)?,
        app_name: row.get("app_name")?,
        category: AppCategory::parse(&category),
        action: recap_schemas::ActionTag::parse(&action),
        project: row.get("project")?,
        context: row.get("context")?,
        transcript: row.get("transcript")?,
        event_count: row.get("event_count")?,
        is_idle: row.get("is_idle")?,
    })
}

fn row_to_micro(row: &Row) -> rusqlite::Result<MicroSummary> {
    let start_time: String = row.get("start_time")?;
    let end_time: String = row.get("end_time")?;
    let productivity: String = row.get("productivity")?;
    let breakdown_json: String = row.get("app_breakdown")?;
    let segment_ids_json: String = row.get("segment_ids")?;

    let app_breakdown: BTreeMap<String, i64> =
        serde_json::from_str(&breakdown_json).map_err(json_error)?;
    let segment_ids: Vec<SegmentId> =
        serde_json::from_str(&segment_ids_json).map_err(json_error)?;

    Ok(MicroSummary {
        id: MicroSummaryId(row.get("id")?),
        session_id: row.get("session_id")?,
        start_time: parse_ts(&start_time)?,
        end_time: parse_ts(&end_time)?,
        summary: row.get("summary")?,
        app_breakdown,
        primary_activity: row.get("primary_activity")?,
        productivity: ProductivityLabel::parse(&productivity),
        project: row.get("project")?,
        segment_ids,
    })
}

fn row_to_session_summary(row: &Row) -> rusqlite::Result<SessionSummary> {
    let date: String = row.get("date")?;
    let start_time: String = row.get("start_time")?;
    let end_time: String = row.get("end_time")?;
    let productivity: String = row.get("productivity")?;
    let key_activities_json: String = row.get("key_activities")?;
    let project_json: String = row.get("project_breakdown")?;
    let app_json: String = row.get("app_breakdown")?;

    Ok(SessionSummary {
        id: SessionSummaryId(row.get("id")?),
        session_id: row.get("session_id")?,
        date: parse_date(&date)?,
        start_time: parse_ts(&start_time)?,
        end_time: parse_ts(&end_time)?,
        summary: row.get("summary")?,
        key_activities: serde_json::from_str(&key_activities_json).map_err(json_error)?,
        project_breakdown: serde_json::from_str(&project_json).map_err(json_error)?,
        app_breakdown: serde_json::from_str(&app_json).map_err(json_error)?,
        productivity: ProductivityLabel::parse(&productivity),
    })
}

fn row_to_daily_summary(row: &Row) -> rusqlite::Result<DailySummary> {
    let date: String = row.get("date")?;
    let highlights_json: String = row.get("highlights")?;
    let improvements_json: String = row.get("improvements")?;
    let sections_json: String = row.get("sections")?;
    let top_apps_json: String = row.get("top_apps")?;
    let top_projects_json: String = row.get("top_projects")?;

    let sections: Vec<DaySection> = serde_json::from_str(&sections_json).map_err(json_error)?;

    Ok(DailySummary {
        date: parse_date(&date)?,
        headline: row.get("headline")?,
        summary: row.get("summary")?,
        highlights: serde_json::from_str(&highlights_json).map_err(json_error)?,
        improvements: serde_json::from_str(&improvements_json).map_err(json_error)?,
        sections,
        tracked_secs: row.get("tracked_secs")?,
        idle_secs: row.get("idle_secs")?,
        productive_secs: row.get("productive_secs")?,
        distracted_secs: row.get("distracted_secs")?,
        top_apps: serde_json::from_str(&top_apps_json).map_err(json_error)?,
        top_projects: serde_json::from_str(&top_projects_json).map_err(json_error)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use recap_schemas::{
        generate_event_id, generate_micro_summary_id, generate_segment_id,
        generate_session_summary_id, local_date_of, ActionTag,
    };

    fn sample_event(session_id: &str, ts: DateTime<Utc>, app: &str) -> RawEvent {
        RawEvent {
            id: generate_event_id(),
            session_id: session_id.to_string(),
            timestamp: ts,
            channel: EventChannel::SceneIndex,
            app_name: Some(app.to_string()),
            category: Some(AppCategory::Development),
            text: format!("Working in {app}"),
            payload: "{}".to_string(),
        }
    }

    fn sample_segment(
        session_id: &str,
        start: DateTime<Utc>,
        secs: i64,
        app: &str,
        project: Option<&str>,
        idle: bool,
    ) -> ActivitySegment {
        ActivitySegment {
            id: generate_segment_id(),
            session_id: session_id.to_string(),
            start_time: start,
            end_time: start + Duration::seconds(secs),
            app_name: app.to_string(),
            category: AppCategory::Development,
            action: ActionTag::Coding,
            project: project.map(str::to_string),
            context: Some("context".to_string()),
            transcript: None,
            event_count: 4,
            is_idle: idle,
        }
    }

    fn sample_micro(
        session_id: &str,
        start: DateTime<Utc>,
        secs: i64,
        productivity: ProductivityLabel,
    ) -> MicroSummary {
        let mut breakdown = BTreeMap::new();
        breakdown.insert("Terminal".to_string(), secs);
        MicroSummary {
            id: generate_micro_summary_id(),
            session_id: session_id.to_string(),
            start_time: start,
            end_time: start + Duration::seconds(secs),
            summary: "Worked in the terminal".to_string(),
            app_breakdown: breakdown,
            primary_activity: "coding".to_string(),
            productivity,
            project: None,
            segment_ids: vec![generate_segment_id()],
        }
    }

    #[test]
    fn test_event_round_trip() {
        let db = Database::in_memory().unwrap();
        let now = Utc::now();

        db.insert_event(&sample_event("s1", now, "Terminal")).unwrap();
        db.insert_event(&sample_event("s1", now + Duration::seconds(5), "Terminal"))
            .unwrap();
        db.insert_event(&sample_event("s2", now, "Chrome")).unwrap();

        let events = db
            .events_between("s1", now - Duration::seconds(1), now + Duration::seconds(10))
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].app_name.as_deref(), Some("Terminal"));
        assert!(events[0].timestamp <= events[1].timestamp);
    }

    #[test]
    fn test_segments_after_watermark() {
        let mut db = Database::in_memory().unwrap();
        let now = Utc::now();

        db.insert_segments(&[
            sample_segment("s1", now, 60, "Terminal", None, false),
            sample_segment("s1", now + Duration::seconds(120), 60, "Chrome", None, false),
        ])
        .unwrap();

        let all = db.segments_after("s1", now - Duration::seconds(1)).unwrap();
        assert_eq!(all.len(), 2);

        // Strictly-after selection: a segment starting exactly at the
        // watermark is excluded.
        let after = db.segments_after("s1", now).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].app_name, "Chrome");
    }

    #[test]
    fn test_project_backfill() {
        let mut db = Database::in_memory().unwrap();
        let now = Utc::now();

        let a = sample_segment("s1", now, 60, "Terminal", None, false);
        let b = sample_segment("s1", now + Duration::seconds(70), 60, "Chrome", None, false);
        db.insert_segments(&[a.clone(), b.clone()]).unwrap();

        let updated = db
            .annotate_segments_project(&[a.id.clone()], "recap")
            .unwrap();
        assert_eq!(updated, 1);

        let segments = db.segments_after("s1", now - Duration::seconds(1)).unwrap();
        assert_eq!(segments[0].project.as_deref(), Some("recap"));
        assert_eq!(segments[1].project, None);

        assert_eq!(db.distinct_projects("s1").unwrap(), vec!["recap"]);
    }

    #[test]
    fn test_micro_summary_round_trip() {
        let db = Database::in_memory().unwrap();
        let now = Utc::now();

        let micro = sample_micro("s1", now, 300, ProductivityLabel::Productive);
        db.insert_micro_summary(&micro).unwrap();

        let loaded = db
            .micro_summaries_between("s1", now - Duration::seconds(1), now + Duration::seconds(1))
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].summary, micro.summary);
        assert_eq!(loaded[0].app_breakdown, micro.app_breakdown);
        assert_eq!(loaded[0].segment_ids, micro.segment_ids);
        assert_eq!(loaded[0].productivity, ProductivityLabel::Productive);
    }

    #[test]
    fn test_session_summary_round_trip() {
        let db = Database::in_memory().unwrap();
        let now = Utc::now();
        let date = local_date_of(now);

        let mut projects = BTreeMap::new();
        projects.insert("recap".to_string(), 600i64);

        let summary = SessionSummary {
            id: generate_session_summary_id(),
            session_id: "s1".to_string(),
            date,
            start_time: now,
            end_time: now + Duration::seconds(600),
            summary: "A focused session".to_string(),
            key_activities: vec!["coding (10m)".to_string()],
            project_breakdown: projects,
            app_breakdown: BTreeMap::new(),
            productivity: ProductivityLabel::Productive,
        };
        db.insert_session_summary(&summary).unwrap();

        let loaded = db.session_summaries_for_date(date).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].key_activities, summary.key_activities);
        assert_eq!(loaded[0].project_breakdown["recap"], 600);
    }

    #[test]
    fn test_daily_summary_upsert_overwrites() {
        let db = Database::in_memory().unwrap();
        let date = local_date_of(Utc::now());

        let mut daily = DailySummary {
            date,
            headline: "First draft".to_string(),
            summary: "summary".to_string(),
            highlights: vec!["one".to_string()],
            improvements: vec![],
            sections: vec![],
            tracked_secs: 100,
            idle_secs: 10,
            productive_secs: 80,
            distracted_secs: 5,
            top_apps: vec![],
            top_projects: vec![],
        };
        db.upsert_daily_summary(&daily).unwrap();

        daily.headline = "Second draft".to_string();
        daily.tracked_secs = 200;
        db.upsert_daily_summary(&daily).unwrap();

        let loaded = db.daily_summary(date).unwrap().unwrap();
        assert_eq!(loaded.headline, "Second draft");
        assert_eq!(loaded.tracked_secs, 200);
        assert_eq!(loaded.highlights, vec!["one".to_string()]);
    }

    #[test]
    fn test_day_stats_aggregates() {
        let mut db = Database::in_memory().unwrap();
        let now = Utc::now();
        let date = local_date_of(now);
        let (day_start, _) = day_bounds(date);
        let base = day_start + Duration::hours(9);

        db.insert_segments(&[
            sample_segment("s1", base, 600, "Terminal", Some("recap"), false),
            sample_segment("s1", base + Duration::seconds(700), 300, "Chrome", None, false),
            sample_segment("s1", base + Duration::seconds(1100), 120, "Chrome", None, true),
        ])
        .unwrap();

        db.insert_micro_summary(&sample_micro(
            "s1",
            base,
            900,
            ProductivityLabel::Productive,
        ))
        .unwrap();
        db.insert_micro_summary(&sample_micro(
            "s1",
            base + Duration::seconds(1000),
            120,
            ProductivityLabel::Distracted,
        ))
        .unwrap();

        let stats = db.day_stats(date, 5).unwrap();
        assert_eq!(stats.tracked_secs, 1020);
        assert_eq!(stats.idle_secs, 120);
        assert_eq!(stats.productive_secs, 900);
        assert_eq!(stats.distracted_secs, 120);
        assert_eq!(stats.top_apps[0].app_name, "Terminal");
        assert_eq!(stats.top_apps[0].seconds, 600);
        assert_eq!(stats.top_apps[1].app_name, "Chrome");
        assert_eq!(stats.top_apps[1].seconds, 420);
        assert_eq!(stats.top_projects.len(), 1);
        assert_eq!(stats.top_projects[0].project, "recap");
    }

    #[test]
    fn test_reopen_persists_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recap.db");
        let now = Utc::now();

        {
            let db = Database::new(&path).unwrap();
            db.insert_event(&sample_event("s1", now, "Terminal")).unwrap();
        }

        let db = Database::new(&path).unwrap();
        let events = db
            .events_between("s1", now - Duration::seconds(1), now + Duration::seconds(1))
            .unwrap();
        assert_eq!(events.len(), 1);
    }
}
