//! Read-only page queries used by the detector and the waiter.
//!
//! [`PageProbe`] is the raw seam against a live browser page. [`PageSignals`]
//! wraps it with the tolerance rules the orchestrator relies on:
//! * a page that is mid-navigation reads as "not present" / "unchanged";
//! * signature matching is capped by a time budget and reads as "not present"
//!   when the budget runs out;
//! * only a dead session is surfaced, as a [`FailureReason`].
//!
//! Neither type offers a way to click, type into, or otherwise act on the page.

use crate::core::error::ProbeError;
use crate::core::types::FailureReason;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// A fixed pattern recognizing a challenge on the page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Signature {
    /// CSS selector; matches when a visible element satisfies it.
    Selector(String),
    /// Case-insensitive substring of the page's visible text.
    Text(String),
}

impl Signature {
    pub fn selector(s: impl Into<String>) -> Self {
        Signature::Selector(s.into())
    }

    pub fn text(s: impl Into<String>) -> Self {
        Signature::Text(s.into().to_lowercase())
    }
}

#[async_trait]
pub trait PageProbe: Send + Sync {
    /// Liveness flag. Must not round-trip to the browser.
    fn liveness(&self) -> Result<(), FailureReason>;

    async fn current_url(&self) -> Result<String, ProbeError>;

    /// True when at least one of `signatures` matches the current page.
    async fn any_visible(&self, signatures: &[Signature]) -> Result<bool, ProbeError>;
}

#[async_trait]
impl<T: PageProbe + ?Sized> PageProbe for std::sync::Arc<T> {
    fn liveness(&self) -> Result<(), FailureReason> {
        (**self).liveness()
    }

    async fn current_url(&self) -> Result<String, ProbeError> {
        (**self).current_url().await
    }

    async fn any_visible(&self, signatures: &[Signature]) -> Result<bool, ProbeError> {
        (**self).any_visible(signatures).await
    }
}

/// Reloads the current document. Used once by the post-check to recover
/// from a page that did not land where the stage expects.
#[async_trait]
pub trait PageReload: Send + Sync {
    async fn reload(&self) -> anyhow::Result<()>;
}

pub type SignalResult<T> = Result<T, FailureReason>;

/// Outcome of one signature check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Present,
    Absent,
    /// Mid-navigation or over budget: no evidence either way.
    Unknown,
}

/// Page Signal Probe: tolerant, budgeted view over a [`PageProbe`].
pub struct PageSignals<P> {
    probe: P,
    budget: Duration,
    last_url: Mutex<String>,
}

impl<P: PageProbe> PageSignals<P> {
    pub fn new(probe: P, budget: Duration) -> Self {
        Self {
            probe,
            budget,
            last_url: Mutex::new(String::new()),
        }
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn check_alive(&self) -> SignalResult<()> {
        self.probe.liveness()
    }

    /// Signature check under the configured budget.
    pub async fn challenge_present(&self, signatures: &[Signature]) -> SignalResult<bool> {
        self.challenge_present_within(signatures, self.budget).await
    }

    /// Signature check under an explicit budget. Budget exhaustion and
    /// transient page states both read as "not present".
    pub async fn challenge_present_within(
        &self,
        signatures: &[Signature],
        budget: Duration,
    ) -> SignalResult<bool> {
        Ok(self.presence_within(signatures, budget).await? == Presence::Present)
    }

    /// Three-valued signature check; `Unknown` when the page could not be read in time.
    pub async fn presence_within(
        &self,
        signatures: &[Signature],
        budget: Duration,
    ) -> SignalResult<Presence> {
        self.check_alive()?;
        if signatures.is_empty() {
            return Ok(Presence::Absent);
        }
        match tokio::time::timeout(budget, self.probe.any_visible(signatures)).await {
            Ok(Ok(true)) => Ok(Presence::Present),
            Ok(Ok(false)) => Ok(Presence::Absent),
            Ok(Err(ProbeError::Transient(msg))) => {
                debug!("challenge_gate: probe transient during signature check: {}", msg);
                Ok(Presence::Unknown)
            }
            Ok(Err(ProbeError::SessionGone(reason))) => Err(reason),
            Err(_) => {
                warn!(
                    "challenge_gate: signature check exceeded {}ms budget; treating as not present",
                    budget.as_millis()
                );
                Ok(Presence::Unknown)
            }
        }
    }

    /// Current URL; the last known URL while the page is between documents.
    pub async fn current_url(&self) -> SignalResult<String> {
        self.current_url_within(self.budget).await
    }

    /// URL read under an explicit budget; falls back to the last known URL
    /// when the read does not finish in time.
    pub async fn current_url_within(&self, budget: Duration) -> SignalResult<String> {
        self.check_alive()?;
        match tokio::time::timeout(budget, self.probe.current_url()).await {
            Ok(Ok(url)) => {
                if let Ok(mut last) = self.last_url.lock() {
                    last.clone_from(&url);
                }
                Ok(url)
            }
            Ok(Err(ProbeError::SessionGone(reason))) => Err(reason),
            Ok(Err(ProbeError::Transient(msg))) => {
                debug!("challenge_gate: probe transient during url read: {}", msg);
                Ok(self.last_known_url())
            }
            Err(_) => Ok(self.last_known_url()),
        }
    }

    pub async fn url_changed_since(&self, reference_url: &str) -> SignalResult<bool> {
        let url = self.current_url().await?;
        Ok(!url.is_empty() && url != reference_url)
    }

    /// Substring match of the current URL against a stage's expected pattern.
    pub async fn url_matches(&self, pattern: &str) -> SignalResult<bool> {
        let url = self.current_url().await?;
        Ok(url_matches_pattern(&url, pattern))
    }

    pub fn last_known_url(&self) -> String {
        self.last_url
            .lock()
            .map(|u| u.clone())
            .unwrap_or_default()
    }
}

pub fn url_matches_pattern(url: &str, pattern: &str) -> bool {
    !pattern.is_empty() && url.contains(pattern)
}
