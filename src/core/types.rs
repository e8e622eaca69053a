use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Recognized challenge families. Produced only by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChallengeKind {
    PressAndHold,
    Checkbox,
    Slider,
    GenericModal,
    Unknown,
}

impl ChallengeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeKind::PressAndHold => "press-and-hold",
            ChallengeKind::Checkbox => "checkbox",
            ChallengeKind::Slider => "slider",
            ChallengeKind::GenericModal => "generic-modal",
            ChallengeKind::Unknown => "unknown",
        }
    }

    /// Lenient parse used by config files; anything unrecognized maps to `Unknown`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "press-and-hold" | "press-hold" | "hold" => ChallengeKind::PressAndHold,
            "checkbox" | "captcha" => ChallengeKind::Checkbox,
            "slider" => ChallengeKind::Slider,
            "generic-modal" | "modal" | "overlay" => ChallengeKind::GenericModal,
            _ => ChallengeKind::Unknown,
        }
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Success,
    Timeout,
    Failure,
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Pending)
    }
}

/// Which completion signal ended a successful wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedBy {
    UrlMatched,
    ChallengeCleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// CDP transport ended while the browser process was still running.
    SessionLost,
    /// The operator closed the window, or the browser process exited.
    BrowserClosed,
    MaxAttemptsExceeded,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::SessionLost => "session_lost",
            FailureReason::BrowserClosed => "browser_closed",
            FailureReason::MaxAttemptsExceeded => "max_attempts_exceeded",
        };
        f.write_str(s)
    }
}

/// Terminal transition applied to a pending [`VerificationEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Success(ResolvedBy),
    Timeout,
    Failure(FailureReason),
}

impl Resolution {
    pub fn is_success(&self) -> bool {
        matches!(self, Resolution::Success(_))
    }

    pub fn outcome(&self) -> Outcome {
        match self {
            Resolution::Success(_) => Outcome::Success,
            Resolution::Timeout => Outcome::Timeout,
            Resolution::Failure(_) => Outcome::Failure,
        }
    }
}

/// One record per challenge encounter.
///
/// Created `Pending` at detection time; [`VerificationEvent::complete`] applies
/// exactly one terminal transition. `ended_at` is derived from `started_at`
/// plus the monotonic elapsed time, so it can never precede the start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationEvent {
    pub challenge_kind: ChallengeKind,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: Outcome,
    #[serde(default)]
    pub page_url: String,
    #[serde(default)]
    pub resolved_by: Option<ResolvedBy>,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
    #[serde(default)]
    pub duration_seconds: f64,
}

impl VerificationEvent {
    pub fn open(challenge_kind: ChallengeKind, page_url: impl Into<String>) -> Self {
        Self::open_at(challenge_kind, page_url, Utc::now())
    }

    /// Pending event whose start is the given detection timestamp.
    pub fn open_at(
        challenge_kind: ChallengeKind,
        page_url: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            challenge_kind,
            started_at,
            ended_at: None,
            outcome: Outcome::Pending,
            page_url: page_url.into(),
            resolved_by: None,
            failure_reason: None,
            duration_seconds: 0.0,
        }
    }

    /// Apply the terminal transition. Returns `false` (and leaves the record
    /// untouched) if the event was already terminal.
    pub fn complete(&mut self, resolution: Resolution, elapsed: Duration) -> bool {
        if self.outcome.is_terminal() {
            return false;
        }
        let elapsed_chrono =
            chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        self.ended_at = Some(self.started_at + elapsed_chrono);
        self.duration_seconds = elapsed.as_secs_f64();
        self.outcome = resolution.outcome();
        match resolution {
            Resolution::Success(by) => self.resolved_by = Some(by),
            Resolution::Timeout => {}
            Resolution::Failure(reason) => self.failure_reason = Some(reason),
        }
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_terminal()
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.ended_at
            .and_then(|end| (end - self.started_at).to_std().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_applies_exactly_once() {
        let mut ev = VerificationEvent::open(ChallengeKind::PressAndHold, "https://example.test/a");
        assert!(!ev.is_terminal());

        assert!(ev.complete(Resolution::Timeout, Duration::from_secs(120)));
        assert!(!ev.complete(
            Resolution::Success(ResolvedBy::UrlMatched),
            Duration::from_secs(1)
        ));

        assert_eq!(ev.outcome, Outcome::Timeout);
        assert!(ev.resolved_by.is_none());
        assert_eq!(ev.elapsed(), Some(Duration::from_secs(120)));
        assert!(ev.ended_at.unwrap() >= ev.started_at);
    }

    #[test]
    fn failure_carries_reason() {
        let mut ev = VerificationEvent::open(ChallengeKind::Slider, "");
        ev.complete(Resolution::Failure(FailureReason::BrowserClosed), Duration::ZERO);
        assert_eq!(ev.outcome, Outcome::Failure);
        assert_eq!(ev.failure_reason, Some(FailureReason::BrowserClosed));
        assert_eq!(ev.ended_at, Some(ev.started_at));
    }

    #[test]
    fn serializes_with_kebab_kind_and_rfc3339() {
        let mut ev = VerificationEvent::open(ChallengeKind::GenericModal, "https://example.test/");
        ev.complete(
            Resolution::Success(ResolvedBy::ChallengeCleared),
            Duration::from_millis(2500),
        );
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["challenge_kind"], "generic-modal");
        assert_eq!(json["outcome"], "success");
        assert_eq!(json["resolved_by"], "challenge_cleared");
        assert!(json["started_at"].as_str().unwrap().contains('T'));
        assert_eq!(json["duration_seconds"], 2.5);
    }

    #[test]
    fn kind_labels_are_lenient() {
        assert_eq!(ChallengeKind::from_label("Press_And_Hold"), ChallengeKind::PressAndHold);
        assert_eq!(ChallengeKind::from_label("modal"), ChallengeKind::GenericModal);
        assert_eq!(ChallengeKind::from_label("something-new"), ChallengeKind::Unknown);
    }
}
