//! Scripted page timeline implementing [`PageProbe`] without a browser.
//!
//! Time is measured with `tokio::time::Instant` from construction, so a paused
//! tokio clock drives the timeline deterministically. Used for offline dry
//! runs of the gate and throughout the test suite.

use crate::browser::probe::{PageProbe, PageReload, Signature};
use crate::core::error::ProbeError;
use crate::core::types::FailureReason;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct ScriptedElement {
    signature: Signature,
    from: Duration,
    until: Option<Duration>,
}

#[derive(Debug)]
pub struct ScriptedPage {
    origin: Instant,
    initial_url: String,
    navigations: Vec<(Duration, String)>,
    elements: Vec<ScriptedElement>,
    transient: Vec<(Duration, Duration)>,
    closed: Option<(Duration, FailureReason)>,
    query_delay: Duration,
    signature_queries: AtomicUsize,
    reload_target: Option<String>,
    reloaded_at: Mutex<Option<Duration>>,
    reloads: AtomicUsize,
}

impl ScriptedPage {
    pub fn new(initial_url: impl Into<String>) -> Self {
        Self {
            origin: Instant::now(),
            initial_url: initial_url.into(),
            navigations: Vec::new(),
            elements: Vec::new(),
            transient: Vec::new(),
            closed: None,
            query_delay: Duration::ZERO,
            signature_queries: AtomicUsize::new(0),
            reload_target: None,
            reloaded_at: Mutex::new(None),
            reloads: AtomicUsize::new(0),
        }
    }

    /// The page navigates to `url` at `at`.
    pub fn navigate_at(mut self, at: Duration, url: impl Into<String>) -> Self {
        self.navigations.push((at, url.into()));
        self.navigations.sort_by_key(|(t, _)| *t);
        self
    }

    /// An element matching `signature` is visible from `from` until `until` (forever if `None`).
    pub fn with_element(mut self, signature: Signature, from: Duration, until: Option<Duration>) -> Self {
        self.elements.push(ScriptedElement {
            signature,
            from,
            until,
        });
        self
    }

    /// Queries in `[from, until)` fail as if the page were between documents.
    pub fn transient_between(mut self, from: Duration, until: Duration) -> Self {
        self.transient.push((from, until));
        self
    }

    pub fn closed_at(mut self, at: Duration, reason: FailureReason) -> Self {
        self.closed = Some((at, reason));
        self
    }

    /// Every round-trip query takes this long.
    pub fn query_delay(mut self, delay: Duration) -> Self {
        self.query_delay = delay;
        self
    }

    /// A reload lands the page on `url`. Without this a reload keeps the
    /// current document.
    pub fn reload_lands_on(mut self, url: impl Into<String>) -> Self {
        self.reload_target = Some(url.into());
        self
    }

    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    pub fn signature_queries(&self) -> usize {
        self.signature_queries.load(Ordering::SeqCst)
    }

    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn in_transient(&self, t: Duration) -> bool {
        self.transient.iter().any(|(from, until)| t >= *from && t < *until)
    }

    fn url_at(&self, t: Duration) -> String {
        let reloaded_at = self.reloaded_at.lock().ok().and_then(|g| *g);
        if let (Some(at), Some(target)) = (reloaded_at, &self.reload_target) {
            let later_navigation = self.navigations.iter().any(|(n, _)| *n > at && *n <= t);
            if t >= at && !later_navigation {
                return target.clone();
            }
        }
        self.navigations
            .iter()
            .rev()
            .find(|(at, _)| *at <= t)
            .map(|(_, url)| url.clone())
            .unwrap_or_else(|| self.initial_url.clone())
    }

    fn visible_at(&self, t: Duration, signature: &Signature) -> bool {
        self.elements.iter().any(|el| {
            &el.signature == signature && t >= el.from && el.until.map_or(true, |until| t < until)
        })
    }

    async fn round_trip(&self) -> Result<Duration, ProbeError> {
        if !self.query_delay.is_zero() {
            tokio::time::sleep(self.query_delay).await;
        }
        self.liveness().map_err(ProbeError::SessionGone)?;
        let t = self.now();
        if self.in_transient(t) {
            return Err(ProbeError::Transient(
                "execution context was destroyed".to_string(),
            ));
        }
        Ok(t)
    }
}

#[async_trait]
impl PageProbe for ScriptedPage {
    fn liveness(&self) -> Result<(), FailureReason> {
        match self.closed {
            Some((at, reason)) if self.now() >= at => Err(reason),
            _ => Ok(()),
        }
    }

    async fn current_url(&self) -> Result<String, ProbeError> {
        let t = self.round_trip().await?;
        Ok(self.url_at(t))
    }

    async fn any_visible(&self, signatures: &[Signature]) -> Result<bool, ProbeError> {
        self.signature_queries.fetch_add(1, Ordering::SeqCst);
        let t = self.round_trip().await?;
        Ok(signatures.iter().any(|s| self.visible_at(t, s)))
    }
}

#[async_trait]
impl PageReload for ScriptedPage {
    async fn reload(&self) -> anyhow::Result<()> {
        self.liveness()
            .map_err(|reason| anyhow::anyhow!("cannot reload: {}", reason))?;
        self.reloads.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut at) = self.reloaded_at.lock() {
            *at = Some(self.now());
        }
        Ok(())
    }
}
