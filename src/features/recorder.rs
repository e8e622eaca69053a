//! Append-only verification history for one workflow run.
//!
//! Two streams are kept, both in strict transition order:
//! * the **event log**: terminal [`VerificationEvent`]s, mirrored to a sink;
//! * the **timeline**: every transition (detected, waiting, resolved,
//!   resumed, ...) with a monotonic sequence number, for end-of-run reports.
//!
//! A sink write failure never fails the run. The record is retried on the
//! fallback sink and kept in an in-memory buffer.

use crate::core::error::SinkError;
use crate::core::types::{ChallengeKind, FailureReason, Outcome, ResolvedBy, VerificationEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    /// Accepts one terminal event. Sinks shared between runs serialize their own writes.
    async fn append(&self, event: &VerificationEvent) -> Result<(), SinkError>;
}

/// JSON-lines file, one terminal event per line, opened in append mode.
pub struct JsonlFileSink {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl JsonlFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventSink for JsonlFileSink {
    fn name(&self) -> &str {
        "jsonl_file"
    }

    async fn append(&self, event: &VerificationEvent) -> Result<(), SinkError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            let f = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(f);
        }
        let Some(file) = guard.as_mut() else {
            return Err(SinkError::Unavailable(self.path.display().to_string()));
        };
        if let Err(e) = async {
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await
        {
            // Reopen on the next write.
            *guard = None;
            return Err(e.into());
        }
        Ok(())
    }
}

/// Structured log line on the `challenge_gate::events` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn append(&self, event: &VerificationEvent) -> Result<(), SinkError> {
        let json = serde_json::to_string(event)?;
        info!(target: "challenge_gate::events", "{}", json);
        Ok(())
    }
}

/// Collects events in memory; clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Arc<std::sync::Mutex<Vec<VerificationEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<VerificationEvent> {
        self.events.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn append(&self, event: &VerificationEvent) -> Result<(), SinkError> {
        self.events
            .lock()
            .map_err(|_| SinkError::Unavailable("memory sink poisoned".to_string()))?
            .push(event.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum TimelineEntry {
    Detected {
        kind: ChallengeKind,
        group: String,
        page_url: String,
    },
    Rejected {
        kind: ChallengeKind,
        count: u32,
        ceiling: u32,
    },
    WaitingEntered {
        kind: ChallengeKind,
        timeout_secs: f64,
    },
    Resolved {
        kind: ChallengeKind,
        outcome: Outcome,
        duration_seconds: f64,
        resolved_by: Option<ResolvedBy>,
        failure_reason: Option<FailureReason>,
    },
    Resumed {
        stage: String,
        next_step: String,
    },
    PageStateMismatch {
        expected: String,
        actual: String,
    },
    /// One recovery reload after a failed post-check; `completed` is false
    /// when the browser did not confirm it within the budget.
    PageReloaded {
        url: String,
        completed: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineRecord {
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub entry: TimelineEntry,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub challenges: usize,
    pub successes: usize,
    pub timeouts: usize,
    pub failures: usize,
    pub total_wait_seconds: f64,
}

pub struct EventRecorder {
    events: Vec<VerificationEvent>,
    timeline: Vec<TimelineRecord>,
    next_seq: u64,
    primary: Option<Arc<dyn EventSink>>,
    fallback: Arc<dyn EventSink>,
    fallback_buffer: Vec<String>,
}

impl std::fmt::Debug for EventRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRecorder")
            .field("events", &self.events.len())
            .field("timeline", &self.timeline.len())
            .field("primary", &self.primary.as_ref().map(|s| s.name().to_string()))
            .field("fallback", &self.fallback.name())
            .finish()
    }
}

impl Default for EventRecorder {
    fn default() -> Self {
        Self::new(None)
    }
}

impl EventRecorder {
    /// `primary` receives every terminal event; the tracing sink is the fallback.
    pub fn new(primary: Option<Arc<dyn EventSink>>) -> Self {
        Self::with_fallback(primary, Arc::new(TracingSink))
    }

    pub fn with_fallback(primary: Option<Arc<dyn EventSink>>, fallback: Arc<dyn EventSink>) -> Self {
        Self {
            events: Vec::new(),
            timeline: Vec::new(),
            next_seq: 0,
            primary,
            fallback,
            fallback_buffer: Vec::new(),
        }
    }

    pub fn note(&mut self, entry: TimelineEntry) {
        match &entry {
            TimelineEntry::Detected {
                kind,
                group,
                page_url,
            } => info!(
                "challenge_gate: [event] detected kind={} group={} url={}",
                kind, group, page_url
            ),
            TimelineEntry::Rejected {
                kind,
                count,
                ceiling,
            } => error!(
                "challenge_gate: [event] rejected kind={} encounter={} ceiling={}",
                kind, count, ceiling
            ),
            TimelineEntry::WaitingEntered { kind, timeout_secs } => info!(
                "challenge_gate: [event] waiting for manual verification kind={} timeout={:.0}s",
                kind, timeout_secs
            ),
            TimelineEntry::Resolved {
                kind,
                outcome,
                duration_seconds,
                ..
            } => match outcome {
                Outcome::Success => info!(
                    "challenge_gate: [event] verification completed kind={} in {:.1}s",
                    kind, duration_seconds
                ),
                Outcome::Timeout => warn!(
                    "challenge_gate: [event] verification timed out kind={} after {:.1}s",
                    kind, duration_seconds
                ),
                _ => error!(
                    "challenge_gate: [event] verification failed kind={} after {:.1}s",
                    kind, duration_seconds
                ),
            },
            TimelineEntry::Resumed { stage, next_step } => info!(
                "challenge_gate: [event] flow resumed stage={} next_step={}",
                stage, next_step
            ),
            TimelineEntry::PageStateMismatch { expected, actual } => warn!(
                "challenge_gate: [event] page state mismatch expected={} actual={}",
                expected, actual
            ),
            TimelineEntry::PageReloaded { url, completed } => warn!(
                "challenge_gate: [event] page reloaded url={} completed={}",
                url, completed
            ),
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.timeline.push(TimelineRecord {
            seq,
            at: Utc::now(),
            entry,
        });
    }

    /// Append a terminal event to the run's log and mirror it to the sinks.
    ///
    /// Returns whether the primary sink write succeeded. Pending events are refused.
    pub async fn append(&mut self, event: VerificationEvent) -> bool {
        if !event.is_terminal() {
            warn!("challenge_gate: refusing to record a pending verification event");
            return false;
        }

        self.note(TimelineEntry::Resolved {
            kind: event.challenge_kind,
            outcome: event.outcome,
            duration_seconds: event.duration_seconds,
            resolved_by: event.resolved_by,
            failure_reason: event.failure_reason,
        });

        let primary = self.primary.clone();
        let fallback = Arc::clone(&self.fallback);
        let primary_ok = match primary {
            Some(sink) => match sink.append(&event).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        "challenge_gate: event sink `{}` unavailable ({}); falling back to `{}`",
                        sink.name(),
                        e,
                        fallback.name()
                    );
                    self.buffer_fallback(&event);
                    if let Err(e2) = fallback.append(&event).await {
                        error!("challenge_gate: fallback sink failed too: {}", e2);
                    }
                    false
                }
            },
            None => {
                if let Err(e) = fallback.append(&event).await {
                    self.buffer_fallback(&event);
                    warn!("challenge_gate: event sink `{}` failed: {}", fallback.name(), e);
                    false
                } else {
                    true
                }
            }
        };

        self.events.push(event);
        primary_ok
    }

    fn buffer_fallback(&mut self, event: &VerificationEvent) {
        let line = serde_json::to_string(event).unwrap_or_else(|_| {
            format!(
                "{} {:?} {:.1}s",
                event.challenge_kind, event.outcome, event.duration_seconds
            )
        });
        self.fallback_buffer.push(line);
    }

    /// Terminal events, in the order they completed.
    pub fn events(&self) -> &[VerificationEvent] {
        &self.events
    }

    pub fn timeline(&self) -> &[TimelineRecord] {
        &self.timeline
    }

    /// Serialized events that could not reach the primary sink.
    pub fn fallback_messages(&self) -> &[String] {
        &self.fallback_buffer
    }

    pub fn summary(&self) -> RunSummary {
        self.events.iter().fold(RunSummary::default(), |mut acc, ev| {
            acc.challenges += 1;
            match ev.outcome {
                Outcome::Success => acc.successes += 1,
                Outcome::Timeout => acc.timeouts += 1,
                Outcome::Failure => acc.failures += 1,
                Outcome::Pending => {}
            }
            acc.total_wait_seconds += ev.duration_seconds;
            acc
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Resolution;
    use std::time::Duration;

    struct BrokenSink;

    #[async_trait]
    impl EventSink for BrokenSink {
        fn name(&self) -> &str {
            "broken"
        }

        async fn append(&self, _event: &VerificationEvent) -> Result<(), SinkError> {
            Err(SinkError::Unavailable("disk full".to_string()))
        }
    }

    fn terminal(kind: ChallengeKind, resolution: Resolution, secs: u64) -> VerificationEvent {
        let mut ev = VerificationEvent::open(kind, "https://shop.test/");
        ev.complete(resolution, Duration::from_secs(secs));
        ev
    }

    #[tokio::test]
    async fn pending_events_never_reach_the_log() {
        let sink = MemorySink::new();
        let mut rec = EventRecorder::new(Some(Arc::new(sink.clone())));
        let pending = VerificationEvent::open(ChallengeKind::Slider, "");
        assert!(!rec.append(pending).await);
        assert!(rec.events().is_empty());
        assert!(sink.snapshot().is_empty());
    }

    #[tokio::test]
    async fn broken_primary_falls_back_without_losing_the_event() {
        let fallback = MemorySink::new();
        let mut rec = EventRecorder::with_fallback(
            Some(Arc::new(BrokenSink)),
            Arc::new(fallback.clone()),
        );

        let ok = rec
            .append(terminal(
                ChallengeKind::PressAndHold,
                Resolution::Success(ResolvedBy::UrlMatched),
                25,
            ))
            .await;

        assert!(!ok);
        assert_eq!(rec.events().len(), 1);
        assert_eq!(fallback.snapshot().len(), 1);
        assert_eq!(rec.fallback_messages().len(), 1);
        assert!(rec.fallback_messages()[0].contains("press-and-hold"));
    }

    #[tokio::test]
    async fn timeline_sequence_is_strictly_increasing() {
        let mut rec = EventRecorder::default();
        rec.note(TimelineEntry::Detected {
            kind: ChallengeKind::Checkbox,
            group: "captcha_container".into(),
            page_url: "https://shop.test/".into(),
        });
        rec.note(TimelineEntry::WaitingEntered {
            kind: ChallengeKind::Checkbox,
            timeout_secs: 120.0,
        });
        rec.append(terminal(ChallengeKind::Checkbox, Resolution::Timeout, 120))
            .await;

        let seqs: Vec<u64> = rec.timeline().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(matches!(
            rec.timeline()[2].entry,
            TimelineEntry::Resolved {
                outcome: Outcome::Timeout,
                ..
            }
        ));
        let summary = rec.summary();
        assert_eq!(summary.timeouts, 1);
        assert_eq!(summary.total_wait_seconds, 120.0);
    }

    #[tokio::test]
    async fn jsonl_sink_appends_one_line_per_event() {
        let dir = std::env::temp_dir().join(format!(
            "challenge-gate-test-{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let path = dir.join("events.jsonl");
        let sink = JsonlFileSink::new(&path);

        sink.append(&terminal(ChallengeKind::Slider, Resolution::Timeout, 3))
            .await
            .unwrap();
        sink.append(&terminal(
            ChallengeKind::Slider,
            Resolution::Failure(FailureReason::SessionLost),
            1,
        ))
        .await
        .unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["failure_reason"], "session_lost");

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
