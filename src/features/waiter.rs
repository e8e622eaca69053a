//! Verification Waiter: `Idle → Waiting → {Success, Timeout, Failure}`.
//!
//! While waiting, each poll tick checks, in this order:
//! 1. the wall-clock deadline (timeout wins over anything seen later in the tick);
//! 2. session liveness (a dead session is `Failure`);
//! 3. signal (a): the current URL contains the stage's expected pattern;
//! 4. signal (b): none of the detector's signatures match any more.
//!
//! Whichever signal is observed first resolves the wait. The loop sleeps
//! between ticks, never past the deadline.

use crate::browser::probe::{PageProbe, PageSignals, Presence};
use crate::core::types::{ChallengeKind, FailureReason, Resolution, ResolvedBy, VerificationEvent};
use crate::features::detector::{ChallengeDetector, ChallengeMatch};
use crate::features::recorder::{EventRecorder, TimelineEntry};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct WaiterSettings {
    pub poll_interval: Duration,
    /// How long signal (b) must hold continuously before it counts.
    pub clear_grace: Duration,
}

impl Default for WaiterSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            clear_grace: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaiterState {
    Idle,
    Waiting {
        kind: ChallengeKind,
        deadline: Instant,
    },
    Resolved(Resolution),
}

pub struct VerificationWaiter<'a, P> {
    signals: &'a PageSignals<P>,
    detector: &'a ChallengeDetector,
    settings: WaiterSettings,
    state: WaiterState,
}

impl<'a, P: PageProbe> VerificationWaiter<'a, P> {
    pub fn new(
        signals: &'a PageSignals<P>,
        detector: &'a ChallengeDetector,
        settings: WaiterSettings,
    ) -> Self {
        Self {
            signals,
            detector,
            settings,
            state: WaiterState::Idle,
        }
    }

    pub fn state(&self) -> WaiterState {
        self.state
    }

    /// Block the calling stage until the challenge resolves or `timeout` elapses.
    ///
    /// The deadline runs from entry into `Waiting`; the event's duration runs
    /// from `challenge.detected_at`. The terminal [`VerificationEvent`] is appended to `recorder` before returning.
    pub async fn wait_for_resolution(
        &mut self,
        challenge: &ChallengeMatch,
        expected_url_pattern: &str,
        timeout: Duration,
        recorder: &mut EventRecorder,
    ) -> Resolution {
        let mut event = VerificationEvent::open_at(
            challenge.kind,
            challenge.page_url.clone(),
            challenge.detected_wall,
        );
        let deadline = Instant::now() + timeout;
        self.state = WaiterState::Waiting {
            kind: challenge.kind,
            deadline,
        };
        recorder.note(TimelineEntry::WaitingEntered {
            kind: challenge.kind,
            timeout_secs: timeout.as_secs_f64(),
        });
        info!(
            "challenge_gate: waiting for manual verification (kind={}, expected url contains `{}`, timeout {}s)",
            challenge.kind,
            expected_url_pattern,
            timeout.as_secs()
        );

        let resolution = self.poll_until_resolved(expected_url_pattern, deadline).await;

        // Measured from detection, so time spent notifying the operator counts.
        let elapsed = challenge.detected_at.elapsed();
        event.complete(resolution, elapsed);
        self.state = WaiterState::Resolved(resolution);
        recorder.append(event).await;
        resolution
    }

    async fn poll_until_resolved(&self, expected_url_pattern: &str, deadline: Instant) -> Resolution {
        let mut cleared_since: Option<Instant> = None;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return self.deadline_reached();
            }
            if let Err(reason) = self.signals.check_alive() {
                return self.session_failure(reason);
            }

            let url = match self.signals.current_url_within(self.read_budget(deadline)).await {
                Ok(url) => url,
                Err(reason) => return self.session_failure(reason),
            };
            // A read that outlived the deadline cannot resolve the wait.
            if Instant::now() >= deadline {
                return self.deadline_reached();
            }
            if crate::browser::probe::url_matches_pattern(&url, expected_url_pattern) {
                info!("challenge_gate: verification complete, url reached {}", url);
                return Resolution::Success(ResolvedBy::UrlMatched);
            }

            let presence = match self
                .signals
                .presence_within(self.detector.signatures(), self.read_budget(deadline))
                .await
            {
                Ok(p) => p,
                Err(reason) => return self.session_failure(reason),
            };
            if Instant::now() >= deadline {
                return self.deadline_reached();
            }
            match presence {
                Presence::Absent => {
                    let since = *cleared_since.get_or_insert(now);
                    if now.duration_since(since) >= self.settings.clear_grace {
                        info!("challenge_gate: verification complete, challenge elements gone");
                        return Resolution::Success(ResolvedBy::ChallengeCleared);
                    }
                    debug!(
                        "challenge_gate: challenge absent for {:?}, holding for grace {:?}",
                        now.duration_since(since),
                        self.settings.clear_grace
                    );
                }
                Presence::Present => cleared_since = None,
                Presence::Unknown => {}
            }

            let pause = self
                .settings
                .poll_interval
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::time::sleep(pause).await;
        }
    }

    /// Per-query budget, never reaching past the deadline.
    fn read_budget(&self, deadline: Instant) -> Duration {
        self.signals
            .budget()
            .min(deadline.saturating_duration_since(Instant::now()))
    }

    fn deadline_reached(&self) -> Resolution {
        warn!("challenge_gate: manual verification deadline reached");
        Resolution::Timeout
    }

    fn session_failure(&self, reason: FailureReason) -> Resolution {
        warn!(
            "challenge_gate: browser session unusable during verification ({})",
            reason
        );
        Resolution::Failure(reason)
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

    fn hold_match() -> ChallengeMatch {
        ChallengeMatch::new(
            ChallengeKind::PressAndHold,
            "press_and_hold",
            "https://shop.test/register",
        )
    }

    async fn run(page: ScriptedPage, settings: WaiterSettings, timeout: Duration) -> (Resolution, EventRecorder) {
        let signals = PageSignals::new(page, secs(3));
        let detector = ChallengeDetector::default();
        let mut recorder = EventRecorder::default();
        let mut waiter = VerificationWaiter::new(&signals, &detector, settings);
        assert_eq!(waiter.state(), WaiterState::Idle);
        let r = waiter
            .wait_for_resolution(&hold_match(), "/account", timeout, &mut recorder)
            .await;
        assert_eq!(waiter.state(), WaiterState::Resolved(r));
        (r, recorder)
    }

    #[tokio::test(start_paused = true)]
    async fn url_signal_wins_when_it_comes_first() {
        let page = ScriptedPage::new("https://shop.test/register")
            .with_element(Signature::text("press & hold"), Duration::ZERO, Some(secs(40)))
            .navigate_at(secs(25), "https://shop.test/account");
        let (r, rec) = run(page, WaiterSettings::default(), secs(120)).await;

        assert_eq!(r, Resolution::Success(ResolvedBy::UrlMatched));
        let ev = &rec.events()[0];
        assert_eq!(ev.outcome, Outcome::Success);
        assert_eq!(ev.duration_seconds, 25.0);
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_signal_wins_when_it_comes_first() {
        let page = ScriptedPage::new("https://shop.test/register")
            .with_element(Signature::text("press & hold"), Duration::ZERO, Some(secs(10)))
            .navigate_at(secs(30), "https://shop.test/account");
        let (r, rec) = run(page, WaiterSettings::default(), secs(120)).await;

        assert_eq!(r, Resolution::Success(ResolvedBy::ChallengeCleared));
        assert_eq!(rec.events()[0].duration_seconds, 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_at_the_deadline() {
        let page = ScriptedPage::new("https://shop.test/register")
            .with_element(Signature::text("press & hold"), Duration::ZERO, None);
        let (r, rec) = run(page, WaiterSettings::default(), secs(120)).await;

        assert_eq!(r, Resolution::Timeout);
        let ev = &rec.events()[0];
        assert_eq!(ev.outcome, Outcome::Timeout);
        assert!(ev.duration_seconds >= 120.0);
        assert!(ev.duration_seconds <= 121.0);
    }

    #[tokio::test(start_paused = true)]
    async fn non_integral_timeout_is_not_overshot() {
        let page = ScriptedPage::new("https://shop.test/register")
            .with_element(Signature::text("press & hold"), Duration::ZERO, None);
        let (r, rec) = run(page, WaiterSettings::default(), Duration::from_millis(2500)).await;

        assert_eq!(r, Resolution::Timeout);
        assert_eq!(rec.events()[0].duration_seconds, 2.5);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_url_read_cannot_resolve_past_the_deadline() {
        // The redirect lands at 1s but each read takes 2.9s; the wait is 0.5s.
        let page = ScriptedPage::new("https://shop.test/register")
            .with_element(Signature::text("press & hold"), Duration::ZERO, None)
            .navigate_at(secs(1), "https://shop.test/account")
            .query_delay(Duration::from_millis(2900));
        let (r, rec) = run(page, WaiterSettings::default(), Duration::from_millis(500)).await;

        assert_eq!(r, Resolution::Timeout);
        let ev = &rec.events()[0];
        assert_eq!(ev.resolved_by, None);
        assert_eq!(ev.duration_seconds, 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_signature_read_is_capped_at_the_deadline() {
        let page = ScriptedPage::new("https://shop.test/register")
            .with_element(Signature::text("press & hold"), Duration::ZERO, Some(secs(1)))
            .query_delay(Duration::from_millis(1200));
        let (r, rec) = run(page, WaiterSettings::default(), secs(2)).await;

        assert_eq!(r, Resolution::Timeout);
        assert_eq!(rec.events()[0].duration_seconds, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn duration_counts_from_detection() {
        let page = ScriptedPage::new("https://shop.test/register")
            .with_element(Signature::text("press & hold"), Duration::ZERO, Some(secs(10)));
        let signals = PageSignals::new(page, secs(3));
        let detector = ChallengeDetector::default();
        let mut recorder = EventRecorder::default();
        let challenge = hold_match();

        tokio::time::sleep(secs(4)).await;
        let mut waiter = VerificationWaiter::new(&signals, &detector, WaiterSettings::default());
        let r = waiter
            .wait_for_resolution(&challenge, "/account", secs(120), &mut recorder)
            .await;

        assert_eq!(r, Resolution::Success(ResolvedBy::ChallengeCleared));
        let ev = &recorder.events()[0];
        assert_eq!(ev.started_at, challenge.detected_wall);
        assert_eq!(ev.duration_seconds, 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_browser_is_a_failure_not_a_timeout() {
        let page = ScriptedPage::new("https://shop.test/register")
            .with_element(Signature::text("press & hold"), Duration::ZERO, None)
            .closed_at(secs(7), FailureReason::BrowserClosed);
        let (r, rec) = run(page, WaiterSettings::default(), secs(120)).await;

        assert_eq!(r, Resolution::Failure(FailureReason::BrowserClosed));
        let ev = &rec.events()[0];
        assert_eq!(ev.outcome, Outcome::Failure);
        assert_eq!(ev.failure_reason, Some(FailureReason::BrowserClosed));
        assert_eq!(ev.duration_seconds, 7.0);
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_gap_is_not_mistaken_for_clearing() {
        let page = ScriptedPage::new("https://shop.test/register")
            .with_element(Signature::text("press & hold"), Duration::ZERO, None)
            .transient_between(secs(3), secs(5));
        let (r, _) = run(page, WaiterSettings::default(), secs(8)).await;
        assert_eq!(r, Resolution::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_period_rejects_a_flicker() {
        // Element vanishes for 2s at t=5 then returns; clears for good at t=20.
        let page = ScriptedPage::new("https://shop.test/register")
            .with_element(Signature::text("press & hold"), Duration::ZERO, Some(secs(5)))
            .with_element(Signature::text("press & hold"), secs(7), Some(secs(20)));
        let settings = WaiterSettings {
            poll_interval: secs(1),
            clear_grace: secs(3),
        };
        let (r, rec) = run(page, settings, secs(120)).await;

        assert_eq!(r, Resolution::Success(ResolvedBy::ChallengeCleared));
        assert_eq!(rec.events()[0].duration_seconds, 23.0);
    }

    #[tokio::test(start_paused = true)]
    async fn transitions_are_journaled_in_order() {
        let page = ScriptedPage::new("https://shop.test/register")
            .with_element(Signature::text("press & hold"), Duration::ZERO, Some(secs(2)));
        let (_, rec) = run(page, WaiterSettings::default(), secs(120)).await;

        let entries: Vec<&TimelineEntry> = rec.timeline().iter().map(|r| &r.entry).collect();
        assert!(matches!(entries[0], TimelineEntry::WaitingEntered { timeout_secs, .. } if *timeout_secs == 120.0));
        assert!(matches!(
            entries[1],
            TimelineEntry::Resolved {
                outcome: Outcome::Success,
                resolved_by: Some(ResolvedBy::ChallengeCleared),
                ..
            }
        ));
    }
}
