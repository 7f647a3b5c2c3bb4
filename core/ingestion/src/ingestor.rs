use anyhow::Result;
use chrono::{DateTime, Utc};
use recap_schemas::{
    generate_event_id, generate_segment_id, ActivitySegment, AppCategory, EventChannel, RawEvent,
};
use recap_store::Database;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::classifier::SceneClassifier;

const CONTEXT_MAX_CHARS: usize = 200;
const TRANSCRIPT_MAX_CHARS: usize = 500;

/// Host-supplied idle verdict, polled once per flush.
pub trait IdleDetector: Send + Sync {
    fn is_currently_idle(&self) -> bool;
}

/// Detector for hosts that don't track idleness.
pub struct NeverIdle;

impl IdleDetector for NeverIdle {
    fn is_currently_idle(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IngestConfig {
    pub flush_interval: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Cumulative counters for the current ingestion session.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IngestStats {
    pub received: u64,
    pub dropped: u64,
    pub segments_flushed: u64,
}

struct ActiveSession {
    session_id: String,
    buffer: Vec<RawEvent>,
    stats: IngestStats,
}

/// Receives raw indexing messages for a tracking session, buffers them, and
/// periodically flushes the buffer into contiguous same-app activity
/// segments.
///
/// Cloneable handle over shared state; the caller owns one per session.
#[derive(Clone)]
pub struct EventIngestor {
    db: Arc<Mutex<Database>>,
    idle: Arc<dyn IdleDetector>,
    classifier: Arc<SceneClassifier>,
    session: Arc<Mutex<Option<ActiveSession>>>,
    flush_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EventIngestor {
    pub fn new(db: Arc<Mutex<Database>>, idle: Arc<dyn IdleDetector>) -> Self {
        Self {
            db,
            idle,
            classifier: Arc::new(SceneClassifier::new()),
            session: Arc::new(Mutex::new(None)),
            flush_task: Arc::new(Mutex::new(None)),
        }
    }

    /// Reset buffer and counters for a fresh session and arm the periodic
    /// flush.
    pub async fn start_ingestion(&self, session_id: &str, config: IngestConfig) {
        {
            let mut session = self.session.lock().await;
            *session = Some(ActiveSession {
                session_id: session_id.to_string(),
                buffer: Vec::new(),
                stats: IngestStats::default(),
            });
        }

        let ingestor = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.flush_interval);
            // The first tick completes immediately; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = ingestor.flush_to_segments().await {
                    error!("Periodic segment flush failed: {e:#}");
                }
            }
        });

        let mut task = self.flush_task.lock().await;
        if let Some(old) = task.replace(handle) {
            old.abort();
        }

        info!(
            "Started ingestion for session {} (flush every {:?})",
            session_id, config.flush_interval
        );
    }

    /// Ingest one raw indexing message.
    ///
    /// Malformed or unrecognized messages are logged and discarded — never an
    /// error. `Err` is reserved for storage failures.
    pub async fn ingest_event(&self, message: Value) -> Result<()> {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else {
            debug!("Dropping event: no active ingestion session");
            return Ok(());
        };

        session.stats.received += 1;

        let channel = message
            .get("channel")
            .and_then(Value::as_str)
            .and_then(EventChannel::parse);
        let Some(channel) = channel else {
            session.stats.dropped += 1;
            debug!("Dropping event with no recognizable channel");
            return Ok(());
        };

        let timestamp = message
            .get("timestamp")
            .and_then(Value::as_i64)
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now);

        let text = message_text(&message);

        let (app_name, category, text) = match channel {
            EventChannel::SceneIndex | EventChannel::VisualIndex => {
                let Some(text) = text.filter(|t| !t.trim().is_empty()) else {
                    session.stats.dropped += 1;
                    debug!("Dropping {} event with empty text", channel.as_str());
                    return Ok(());
                };
                let scene = self.classifier.classify_scene(&text);
                (Some(scene.app_name), Some(scene.category), text)
            }
            EventChannel::Transcript => {
                let Some(text) = text.filter(|t| !t.trim().is_empty()) else {
                    session.stats.dropped += 1;
                    debug!("Dropping transcript event with empty text");
                    return Ok(());
                };
                (None, None, text)
            }
            EventChannel::SpokenIndex => {
                let summary = message
                    .get("summary")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or(text)
                    .unwrap_or_default();
                (None, None, summary)
            }
            EventChannel::Alert => {
                let label = message.get("label").and_then(Value::as_str).unwrap_or("");
                let event_name = message
                    .get("event_name")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let (app, category) = self.classifier.classify_alert(label, event_name);
                let text = if label.is_empty() { event_name } else { label };
                (Some(app), Some(category), text.to_string())
            }
        };

        let event = RawEvent {
            id: generate_event_id(),
            session_id: session.session_id.clone(),
            timestamp,
            channel,
            app_name,
            category,
            text,
            payload: message.to_string(),
        };

        {
            let db = self.db.lock().await;
            db.insert_event(&event)?;
        }

        session.buffer.push(event);
        Ok(())
    }

    /// Partition the buffered events, in arrival order, into maximal same-app
    /// runs, persist one segment per run, and return the new segments.
    ///
    /// The buffer is swapped out before anything awaits, so events arriving
    /// mid-flush start a new buffer.
    pub async fn flush_to_segments(&self) -> Result<Vec<ActivitySegment>> {
        let (session_id, events) = {
            let mut guard = self.session.lock().await;
            match guard.as_mut() {
                Some(session) if !session.buffer.is_empty() => (
                    session.session_id.clone(),
                    std::mem::take(&mut session.buffer),
                ),
                _ => return Ok(Vec::new()),
            }
        };

        let event_count = events.len();
        // One idle verdict per flush, applied to every segment in it.
        let is_idle = self.idle.is_currently_idle();

        let segments: Vec<ActivitySegment> = partition_into_runs(events)
            .into_iter()
            .filter_map(|run| self.build_segment(&session_id, run, is_idle))
            .collect();

        {
            let mut db = self.db.lock().await;
            db.insert_segments(&segments)?;
        }

        {
            let mut guard = self.session.lock().await;
            if let Some(session) = guard.as_mut() {
                session.stats.segments_flushed += segments.len() as u64;
            }
        }

        info!(
            "Flushed {} events into {} segments for session {}",
            event_count,
            segments.len(),
            session_id
        );
        Ok(segments)
    }

    /// Stop the flush timer, flush whatever is buffered, and clear session
    /// state.
    pub async fn stop_ingestion(&self) -> Result<Vec<ActivitySegment>> {
        {
            let mut task = self.flush_task.lock().await;
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }

        let segments = self.flush_to_segments().await?;

        let mut guard = self.session.lock().await;
        if let Some(session) = guard.take() {
            info!(
                "Stopped ingestion for session {} ({} received, {} dropped, {} segments)",
                session.session_id,
                session.stats.received,
                session.stats.dropped,
                session.stats.segments_flushed
            );
        }

        Ok(segments)
    }

    /// Counters for the active session, if any.
    pub async fn stats(&self) -> Option<IngestStats> {
        self.session.lock().await.as_ref().map(|s| s.stats)
    }

    fn build_segment(
        &self,
        session_id: &str,
        run: Run,
        is_idle: bool,
    ) -> Option<ActivitySegment> {
        let first = run.events.first()?;
        let last = run.events.last()?;
        let start_time = first.timestamp;
        // Upstream timestamps are expected in order; clamp so a stray
        // out-of-order event can't invert the range.
        let end_time = last.timestamp.max(start_time);

        let scene_texts: Vec<String> = run
            .events
            .iter()
            .filter(|e| {
                matches!(
                    e.channel,
                    EventChannel::SceneIndex | EventChannel::VisualIndex
                )
            })
            .map(|e| e.text.clone())
            .collect();

        let action = self.classifier.infer_action(&scene_texts);
        let project = self.classifier.infer_project(&scene_texts);
        let context = scene_texts.first().map(|t| truncate(t, CONTEXT_MAX_CHARS));

        let transcript_parts: Vec<&str> = run
            .events
            .iter()
            .filter(|e| e.channel == EventChannel::Transcript)
            .map(|e| e.text.as_str())
            .collect();
        let transcript = if transcript_parts.is_empty() {
            None
        } else {
            Some(truncate(&transcript_parts.join(" "), TRANSCRIPT_MAX_CHARS))
        };

        Some(ActivitySegment {
            id: generate_segment_id(),
            session_id: session_id.to_string(),
            start_time,
            end_time,
            app_name: run.app.unwrap_or_else(|| "Unknown".to_string()),
            category: run.category.unwrap_or(AppCategory::Other),
            action,
            project,
            context,
            transcript,
            event_count: run.events.len() as i64,
            is_idle,
        })
    }
}

struct Run {
    app: Option<String>,
    category: Option<AppCategory>,
    events: Vec<RawEvent>,
}

impl Run {
    fn starting(event: RawEvent) -> Self {
        Self {
            app: event.app_name.clone(),
            category: event.category,
            events: vec![event],
        }
    }
}

/// Maximal runs sharing one app attribution. A boundary occurs only when an
/// attributed event names a different app than the current run; unattributed
/// events (bare transcripts) always continue the current run, and the first
/// attributed event in an unattributed run adopts its app.
fn partition_into_runs(events: Vec<RawEvent>) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();

    for event in events {
        let boundary = match (runs.last(), &event.app_name) {
            (None, _) => true,
            (Some(run), Some(app)) => {
                run.app.as_deref().is_some_and(|current| current != app.as_str())
            }
            (Some(_), None) => false,
        };

        if boundary {
            runs.push(Run::starting(event));
        } else if let Some(run) = runs.last_mut() {
            if run.app.is_none() && event.app_name.is_some() {
                run.app = event.app_name.clone();
                run.category = event.category;
            }
            run.events.push(event);
        }
    }

    runs
}

fn message_text(message: &Value) -> Option<String> {
    message
        .get("text")
        .and_then(Value::as_str)
        .or_else(|| {
            message
                .get("data")
                .and_then(|d| d.get("text"))
                .and_then(Value::as_str)
        })
        .map(str::to_string)
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
    use recap_schemas::generate_event_id;

    fn event(app: Option<&str>, channel: EventChannel, offset_secs: i64) -> RawEvent {
        RawEvent {
            id: generate_event_id(),
            session_id: "s1".to_string(),
            timestamp: Utc::now() + chrono::Duration::seconds(offset_secs),
            channel,
            app_name: app.map(str::to_string),
            category: app.map(|_| AppCategory::Development),
            text: "text".to_string(),
            payload: "{}".to_string(),
        }
    }

    #[test]
    fn test_runs_split_on_app_change() {
        let events = vec![
            event(Some("Visual Studio Code"), EventChannel::SceneIndex, 0),
            event(Some("Visual Studio Code"), EventChannel::SceneIndex, 120),
            event(Some("Google Chrome"), EventChannel::SceneIndex, 240),
            event(Some("Google Chrome"), EventChannel::SceneIndex, 360),
        ];

        let runs = partition_into_runs(events);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].events.len(), 2);
        assert_eq!(runs[1].app.as_deref(), Some("Google Chrome"));
    }

    #[test]
    fn test_transcripts_never_start_a_run() {
        let events = vec![
            event(Some("Zoom"), EventChannel::SceneIndex, 0),
            event(None, EventChannel::Transcript, 10),
            event(None, EventChannel::Transcript, 20),
            event(Some("Zoom"), EventChannel::SceneIndex, 30),
        ];

        let runs = partition_into_runs(events);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].events.len(), 4);
    }

    #[test]
    fn test_leading_transcripts_adopt_first_app() {
        let events = vec![
            event(None, EventChannel::Transcript, 0),
            event(Some("Slack"), EventChannel::SceneIndex, 10),
        ];

        let runs = partition_into_runs(events);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].app.as_deref(), Some("Slack"));
    }

    #[test]
    fn test_partition_preserves_every_event_in_order() {
        let events: Vec<RawEvent> = (0..20)
            .map(|i| {
                let app = if i % 7 == 0 { Some("A") } else if i % 5 == 0 { Some("B") } else { None };
                event(app, EventChannel::SceneIndex, i)
            })
            .collect();
        let ids: Vec<String> = events.iter().map(|e| e.id.0.clone()).collect();

        let runs = partition_into_runs(events);
        let flattened: Vec<String> = runs
            .iter()
            .flat_map(|r| r.events.iter().map(|e| e.id.0.clone()))
            .collect();

        assert_eq!(flattened, ids);
    }

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("héllo", 10), "héllo");
        let long = "é".repeat(300);
        let cut = truncate(&long, 200);
        assert_eq!(cut.chars().count(), 201);
    }
}
