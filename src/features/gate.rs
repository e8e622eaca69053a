use crate::browser::probe::{PageProbe, PageReload, PageSignals, Presence};
use crate::core::config::{GateConfig, StageConfig};
use crate::core::error::GateError;
use crate::core::types::{
    ChallengeKind, FailureReason, Resolution, ResolvedBy, VerificationEvent,
};
use crate::features::attempts::RunVerificationState;
use crate::features::detector::{ChallengeDetector, ChallengeMatch};
use crate::features::notify::{Notifier, PageBanner};
use crate::features::recorder::{EventRecorder, RunSummary, TimelineEntry, TimelineRecord};
use crate::features::waiter::{VerificationWaiter, WaiterSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// What a stage should do after handing its submit to the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// No challenge appeared; continue with stage-native success monitoring.
    NoChallenge,
    /// A challenge was cleared and the page is where the stage expects it.
    Resumed {
        kind: ChallengeKind,
        resolved_by: ResolvedBy,
    },
}

/// Challenge-gated orchestrator for one workflow run.
///
/// Owns the run's page signals, attempt counter and event log. Nothing is
/// shared between gates, so concurrent runs each build their own.
pub struct ChallengeGate<P> {
    signals: PageSignals<P>,
    detector: ChallengeDetector,
    run_state: RunVerificationState,
    recorder: EventRecorder,
    notifier: Notifier,
    waiter_settings: WaiterSettings,
    settle_delay: Duration,
    default_timeout: Duration,
    banner: Option<Arc<dyn PageBanner>>,
    reloader: Option<Arc<dyn PageReload>>,
    pending: Option<ChallengeMatch>,
}

impl<P: PageProbe> ChallengeGate<P> {
    pub fn new(probe: P, config: &GateConfig, recorder: EventRecorder) -> Self {
        let detector = ChallengeDetector::from_config(config.signature_groups.as_deref());
        Self {
            signals: PageSignals::new(probe, config.resolve_detection_budget()),
            detector,
            run_state: RunVerificationState::new(config.resolve_max_challenges()),
            recorder,
            notifier: Notifier::new(config.resolve_notifications())
                .with_banner_budget(config.resolve_detection_budget()),
            waiter_settings: WaiterSettings {
                poll_interval: config.resolve_poll_interval(),
                clear_grace: config.resolve_clear_grace(),
            },
            settle_delay: config.resolve_settle_delay(),
            default_timeout: config.resolve_timeout(),
            banner: None,
            reloader: None,
            pending: None,
        }
    }

    pub fn with_banner(mut self, banner: Arc<dyn PageBanner>) -> Self {
        self.banner = Some(banner);
        self
    }

    /// Allow one reload-and-recheck when the post-check finds the wrong page.
    pub fn with_reload(mut self, reloader: Arc<dyn PageReload>) -> Self {
        self.reloader = Some(reloader);
        self
    }

    pub fn with_detector(mut self, detector: ChallengeDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn signals(&self) -> &PageSignals<P> {
        &self.signals
    }

    pub fn run_state(&self) -> &RunVerificationState {
        &self.run_state
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Classify the current page. A dead session reads as "no challenge" here;
    /// [`Self::handle_post_submit`] surfaces it as a failure instead.
    pub async fn detect(&mut self) -> Option<ChallengeKind> {
        match self.detect_checked().await {
            Ok(m) => m.map(|m| m.kind),
            Err(reason) => {
                warn!("challenge_gate: detection skipped, session unusable ({})", reason);
                None
            }
        }
    }

    async fn detect_checked(&mut self) -> Result<Option<ChallengeMatch>, FailureReason> {
        let found = self.detector.detect_match(&self.signals).await?;
        if let Some(m) = &found {
            self.recorder.note(TimelineEntry::Detected {
                kind: m.kind,
                group: m.group.clone(),
                page_url: m.page_url.clone(),
            });
        }
        self.pending = found.clone();
        Ok(found)
    }

    /// Count a positive detection against the run's ceiling.
    ///
    /// On rejection a terminal failure event is logged and no wait may start.
    pub async fn register_challenge(&mut self) -> bool {
        if self.run_state.register_challenge() {
            return true;
        }
        let challenge = self.take_pending();
        self.recorder.note(TimelineEntry::Rejected {
            kind: challenge.kind,
            count: self.run_state.count(),
            ceiling: self.run_state.ceiling(),
        });
        let mut event = VerificationEvent::open_at(
            challenge.kind,
            challenge.page_url.clone(),
            challenge.detected_wall,
        );
        event.complete(
            Resolution::Failure(FailureReason::MaxAttemptsExceeded),
            challenge.detected_at.elapsed(),
        );
        self.recorder.append(event).await;
        false
    }

    /// Suspend until the pending challenge clears or `timeout` elapses.
    pub async fn wait_for_resolution(&mut self, expected_url_pattern: &str, timeout: Duration) -> bool {
        self.resolve(expected_url_pattern, timeout).await.is_success()
    }

    fn take_pending(&mut self) -> ChallengeMatch {
        self.pending.take().unwrap_or_else(|| {
            ChallengeMatch::new(ChallengeKind::Unknown, "", self.signals.last_known_url())
        })
    }

    async fn resolve(&mut self, expected_url_pattern: &str, timeout: Duration) -> Resolution {
        let challenge = self.take_pending();
        let banner = self.banner.clone();

        self.notifier
            .challenge_started(challenge.kind, timeout, self.run_state.remaining(), banner.as_deref())
            .await;

        let resolution = {
            let mut waiter =
                VerificationWaiter::new(&self.signals, &self.detector, self.waiter_settings);
            waiter
                .wait_for_resolution(&challenge, expected_url_pattern, timeout, &mut self.recorder)
                .await
        };

        self.notifier
            .challenge_finished(resolution, banner.as_deref())
            .await;
        resolution
    }

    /// Post-check after a cleared challenge: the expected URL is reached and no
    /// signature is left. Re-checked on the poll interval for up to the settle
    /// delay, so an in-flight redirect can land. An empty pattern checks only
    /// the signatures. With a reloader attached, one reload-and-recheck is
    /// tried before reporting a mismatch.
    pub async fn verify_page_state(&mut self, expected_url_pattern: &str) -> bool {
        match self.recheck_until_settled(expected_url_pattern).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(reason) => {
                error!("challenge_gate: page state check failed, session unusable ({})", reason);
                return false;
            }
        }

        if let Some(reloader) = self.reloader.clone() {
            if self.recover_by_reload(reloader.as_ref(), expected_url_pattern).await {
                return true;
            }
        }

        let actual = self.signals.last_known_url();
        self.recorder.note(TimelineEntry::PageStateMismatch {
            expected: expected_url_pattern.to_string(),
            actual,
        });
        false
    }

    async fn recheck_until_settled(&self, expected_url_pattern: &str) -> Result<bool, FailureReason> {
        let deadline = Instant::now() + self.settle_delay;
        loop {
            if self.page_state_matches(expected_url_pattern).await? {
                info!(
                    "challenge_gate: page state verified (url {})",
                    self.signals.last_known_url()
                );
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.waiter_settings.poll_interval.min(deadline - now)).await;
        }
    }

    async fn recover_by_reload(&mut self, reloader: &dyn PageReload, expected_url_pattern: &str) -> bool {
        let url = self.signals.last_known_url();
        warn!(
            "challenge_gate: page state mismatch (expected `{}`, at {}); reloading once",
            expected_url_pattern, url
        );
        let completed = match tokio::time::timeout(self.signals.budget(), reloader.reload()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("challenge_gate: page reload failed: {}", e);
                self.recorder.note(TimelineEntry::PageReloaded {
                    url,
                    completed: false,
                });
                return false;
            }
            Err(_) => {
                warn!(
                    "challenge_gate: page reload not confirmed within {}ms; re-checking anyway",
                    self.signals.budget().as_millis()
                );
                false
            }
        };
        self.recorder.note(TimelineEntry::PageReloaded { url, completed });

        match self.recheck_until_settled(expected_url_pattern).await {
            Ok(true) => {
                info!("challenge_gate: page state recovered after reload");
                true
            }
            Ok(false) => false,
            Err(reason) => {
                error!("challenge_gate: page state check failed after reload ({})", reason);
                false
            }
        }
    }

    async fn page_state_matches(&self, expected_url_pattern: &str) -> Result<bool, FailureReason> {
        let url_ok = self.signals.url_matches(expected_url_pattern).await?;
        if !url_ok && !expected_url_pattern.is_empty() {
            return Ok(false);
        }
        let presence = self
            .signals
            .presence_within(self.detector.signatures(), self.signals.budget())
            .await?;
        Ok(presence == Presence::Absent)
    }

    /// Wait for the post-submit settle delay before the first detection pass.
    pub async fn settle_after_submit(&self) {
        if !self.settle_delay.is_zero() {
            debug!(
                "challenge_gate: settling {}ms after submit",
                self.settle_delay.as_millis()
            );
            tokio::time::sleep(self.settle_delay).await;
        }
    }

    /// Full integration-point sequence after a stage's own form submit:
    /// detect → register → wait → post-check.
    pub async fn handle_post_submit(&mut self, stage: &StageConfig, timeout: Duration) -> Result<GateDecision, GateError> {
        let Some(found) = self
            .detect_checked()
            .await
            .map_err(GateError::VerificationFailure)?
        else {
            debug!("challenge_gate: stage `{}` saw no challenge", stage.name);
            return Ok(GateDecision::NoChallenge);
        };

        info!(
            "challenge_gate: stage `{}` interrupted by {} challenge",
            stage.name, found.kind
        );
        if !self.register_challenge().await {
            return Err(GateError::AttemptCeilingExceeded {
                ceiling: self.run_state.ceiling(),
            });
        }

        match self.resolve(&stage.expected_url_pattern, timeout).await {
            Resolution::Success(resolved_by) => {
                if !self.verify_page_state(&stage.expected_url_pattern).await {
                    return Err(GateError::PageStateMismatch {
                        expected: stage.expected_url_pattern.clone(),
                        actual: self.signals.last_known_url(),
                    });
                }
                self.recorder.note(TimelineEntry::Resumed {
                    stage: stage.name.clone(),
                    next_step: stage.next_step_label().to_string(),
                });
                debug!("challenge_gate: monitoring for subsequent challenges stays active");
                Ok(GateDecision::Resumed {
                    kind: found.kind,
                    resolved_by,
                })
            }
            Resolution::Timeout => Err(GateError::VerificationTimeout(timeout)),
            Resolution::Failure(reason) => Err(GateError::VerificationFailure(reason)),
        }
    }

    /// Terminal events for this run, in completion order.
    pub fn events(&self) -> &[VerificationEvent] {
        self.recorder.events()
    }

    pub fn timeline(&self) -> &[TimelineRecord] {
        self.recorder.timeline()
    }

    pub fn summary(&self) -> RunSummary {
        self.recorder.summary()
    }

    pub fn fallback_messages(&self) -> &[String] {
        self.recorder.fallback_messages()
    }

    pub fn into_recorder(self) -> EventRecorder {
        self.recorder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::probe::Signature;
    use crate::browser::scripted::ScriptedPage;
    use crate::core::types::Outcome;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn quiet_config() -> GateConfig {
        GateConfig {
            verification_timeout_secs: Some(120),
            max_challenges_per_run: Some(3),
            notifications_enabled: Some(false),
            poll_interval_ms: Some(1000),
            detection_budget_ms: Some(3000),
            settle_delay_ms: Some(2000),
            clear_grace_ms: Some(0),
            ..GateConfig::default()
        }
    }

    fn stage() -> StageConfig {
        StageConfig::new("registration", "/account")
    }

    fn hold() -> Signature {
        Signature::text("press & hold")
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_and_resumes_after_redirect() {
        let page = ScriptedPage::new("https://shop.test/register")
            .with_element(hold(), Duration::ZERO, Some(secs(25)))
            .navigate_at(secs(25), "https://shop.test/account");
        let mut gate = ChallengeGate::new(page, &quiet_config(), EventRecorder::default());

        let decision = gate.handle_post_submit(&stage(), secs(120)).await.unwrap();
        assert_eq!(
            decision,
            GateDecision::Resumed {
                kind: ChallengeKind::PressAndHold,
                resolved_by: ResolvedBy::UrlMatched
            }
        );
        assert_eq!(gate.run_state().count(), 1);
        assert_eq!(gate.events().len(), 1);
        assert!(matches!(
            gate.timeline().last().map(|r| &r.entry),
            Some(TimelineEntry::Resumed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cleared_without_redirect_fails_post_check() {
        // Challenge disappears but the page never reaches the expected URL.
        let page = ScriptedPage::new("https://shop.test/register")
            .with_element(hold(), Duration::ZERO, Some(secs(5)));
        let mut gate = ChallengeGate::new(page, &quiet_config(), EventRecorder::default());

        let err = gate.handle_post_submit(&stage(), secs(120)).await.unwrap_err();
        assert!(matches!(err, GateError::PageStateMismatch { .. }));
        // The verification itself succeeded.
        assert_eq!(gate.events()[0].outcome, Outcome::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn post_check_tolerates_an_in_flight_redirect() {
        let page = ScriptedPage::new("https://shop.test/register")
            .with_element(hold(), Duration::ZERO, Some(secs(5)))
            .navigate_at(secs(6), "https://shop.test/account");
        let mut gate = ChallengeGate::new(page, &quiet_config(), EventRecorder::default());

        let decision = gate.handle_post_submit(&stage(), secs(120)).await.unwrap();
        assert_eq!(
            decision,
            GateDecision::Resumed {
                kind: ChallengeKind::PressAndHold,
                resolved_by: ResolvedBy::ChallengeCleared
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn empty_pattern_resumes_once_signatures_are_gone() {
        let page = ScriptedPage::new("https://shop.test/register")
            .with_element(hold(), Duration::ZERO, Some(secs(5)));
        let mut gate = ChallengeGate::new(page, &quiet_config(), EventRecorder::default());

        let decision = gate
            .handle_post_submit(&StageConfig::new("custom", ""), secs(120))
            .await
            .unwrap();
        assert_eq!(
            decision,
            GateDecision::Resumed {
                kind: ChallengeKind::PressAndHold,
                resolved_by: ResolvedBy::ChallengeCleared
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn one_reload_recovers_a_stuck_page() {
        let page = Arc::new(
            ScriptedPage::new("https://shop.test/register")
                .with_element(hold(), Duration::ZERO, Some(secs(5)))
                .reload_lands_on("https://shop.test/account"),
        );
        let mut gate = ChallengeGate::new(Arc::clone(&page), &quiet_config(), EventRecorder::default())
            .with_reload(Arc::clone(&page) as Arc<dyn PageReload>);

        let decision = gate.handle_post_submit(&stage(), secs(120)).await.unwrap();
        assert!(matches!(decision, GateDecision::Resumed { .. }));
        assert_eq!(page.reloads(), 1);
        assert!(gate.timeline().iter().any(|r| matches!(
            &r.entry,
            TimelineEntry::PageReloaded { url, completed: true } if url == "https://shop.test/register"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn reload_is_tried_once_then_mismatch_is_reported() {
        let page = Arc::new(
            ScriptedPage::new("https://shop.test/register")
                .with_element(hold(), Duration::ZERO, Some(secs(5))),
        );
        let mut gate = ChallengeGate::new(Arc::clone(&page), &quiet_config(), EventRecorder::default())
            .with_reload(Arc::clone(&page) as Arc<dyn PageReload>);

        let err = gate.handle_post_submit(&stage(), secs(120)).await.unwrap_err();
        assert!(matches!(err, GateError::PageStateMismatch { .. }));
        assert_eq!(page.reloads(), 1);
        let tail: Vec<&TimelineEntry> = gate.timeline().iter().rev().take(2).map(|r| &r.entry).collect();
        assert!(matches!(tail[0], TimelineEntry::PageStateMismatch { .. }));
        assert!(matches!(tail[1], TimelineEntry::PageReloaded { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn event_starts_at_detection_and_rejection_keeps_it() {
        let page = ScriptedPage::new("https://shop.test/register")
            .with_element(hold(), Duration::ZERO, None);
        let config = GateConfig {
            max_challenges_per_run: Some(0),
            ..quiet_config()
        };
        let mut gate = ChallengeGate::new(page, &config, EventRecorder::default());

        assert_eq!(gate.detect().await, Some(ChallengeKind::PressAndHold));
        let detected_wall = gate.pending.as_ref().map(|m| m.detected_wall).unwrap();
        tokio::time::sleep(secs(2)).await;
        assert!(!gate.register_challenge().await);

        let ev = &gate.events()[0];
        assert_eq!(ev.started_at, detected_wall);
        assert_eq!(ev.duration_seconds, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_challenge_passes_through() {
        let page = ScriptedPage::new("https://shop.test/account");
        let mut gate = ChallengeGate::new(page, &quiet_config(), EventRecorder::default());
        assert_eq!(
            gate.handle_post_submit(&stage(), secs(120)).await.unwrap(),
            GateDecision::NoChallenge
        );
        assert_eq!(gate.run_state().count(), 0);
        assert!(gate.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_logs_failure_without_waiting() {
        let page = ScriptedPage::new("https://shop.test/register")
            .with_element(hold(), Duration::ZERO, None);
        let config = GateConfig {
            max_challenges_per_run: Some(0),
            ..quiet_config()
        };
        let mut gate = ChallengeGate::new(page, &config, EventRecorder::default());

        let start = Instant::now();
        let err = gate.handle_post_submit(&stage(), secs(120)).await.unwrap_err();
        assert!(matches!(err, GateError::AttemptCeilingExceeded { ceiling: 0 }));
        assert_eq!(start.elapsed(), Duration::ZERO);

        let ev = &gate.events()[0];
        assert_eq!(ev.outcome, Outcome::Failure);
        assert_eq!(ev.failure_reason, Some(FailureReason::MaxAttemptsExceeded));
        assert_eq!(ev.duration_seconds, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn session_loss_during_detection_is_a_failure() {
        let page = ScriptedPage::new("https://shop.test/register")
            .closed_at(Duration::ZERO, FailureReason::SessionLost);
        let mut gate = ChallengeGate::new(page, &quiet_config(), EventRecorder::default());
        let err = gate.handle_post_submit(&stage(), secs(120)).await.unwrap_err();
        assert!(matches!(
            err,
            GateError::VerificationFailure(FailureReason::SessionLost)
        ));
        assert_eq!(gate.detect().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn boolean_contracts_compose() {
        let page = ScriptedPage::new("https://shop.test/register")
            .with_element(Signature::selector("#px-captcha"), Duration::ZERO, None);
        let mut gate = ChallengeGate::new(page, &quiet_config(), EventRecorder::default());

        assert_eq!(gate.detect().await, Some(ChallengeKind::Checkbox));
        assert!(gate.register_challenge().await);
        assert!(!gate.wait_for_resolution("/account", secs(30)).await);

        let ev = &gate.events()[0];
        assert_eq!(ev.challenge_kind, ChallengeKind::Checkbox);
        assert_eq!(ev.outcome, Outcome::Timeout);
        assert_eq!(ev.duration_seconds, 30.0);
    }
}
