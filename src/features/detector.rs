use crate::browser::probe::{PageProbe, PageSignals, Signature, SignalResult};
use crate::core::config::SignatureGroupConfig;
use crate::core::types::ChallengeKind;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Ordered set of signatures that share one challenge kind.
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureGroup {
    pub name: String,
    pub kind: ChallengeKind,
    pub signatures: Vec<Signature>,
}

impl SignatureGroup {
    pub fn new(name: impl Into<String>, kind: ChallengeKind, signatures: Vec<Signature>) -> Self {
        Self {
            name: name.into(),
            kind,
            signatures,
        }
    }
}

impl From<&SignatureGroupConfig> for SignatureGroup {
    fn from(cfg: &SignatureGroupConfig) -> Self {
        let kind = cfg
            .kind
            .as_deref()
            .map(ChallengeKind::from_label)
            .unwrap_or(ChallengeKind::Unknown);
        let signatures = cfg
            .selectors
            .iter()
            .map(Signature::selector)
            .chain(cfg.text_markers.iter().map(Signature::text))
            .collect();
        Self::new(cfg.name.clone(), kind, signatures)
    }
}

/// Built-in priority order: captcha containers, overlays, press-and-hold, sliders.
pub fn default_signature_groups() -> Vec<SignatureGroup> {
    vec![
        SignatureGroup::new(
            "captcha_container",
            ChallengeKind::Checkbox,
            vec![
                Signature::selector("#px-captcha"),
                Signature::selector("[data-testid=\"px-captcha\"]"),
                Signature::selector(".px-captcha-container"),
                Signature::selector("div[id*=\"px-captcha\"]"),
                Signature::selector("div[class*=\"px-captcha\"]"),
                Signature::selector(".g-recaptcha"),
                Signature::selector(".h-captcha"),
                Signature::selector("#cf-challenge-running"),
            ],
        ),
        SignatureGroup::new(
            "modal_overlay",
            ChallengeKind::GenericModal,
            vec![
                Signature::selector("#challenge-container"),
                Signature::selector("iframe[src*=\"captcha\"]"),
                Signature::selector("iframe[src*=\"challenge\"]"),
                Signature::selector("iframe[title*=\"verification\" i]"),
            ],
        ),
        SignatureGroup::new(
            "press_and_hold",
            ChallengeKind::PressAndHold,
            vec![
                Signature::selector("[aria-label*=\"press and hold\" i]"),
                Signature::text("press & hold"),
                Signature::text("press and hold"),
            ],
        ),
        SignatureGroup::new(
            "slider",
            ChallengeKind::Slider,
            vec![
                Signature::selector(".geetest_slider"),
                Signature::selector("[class*=\"slider-captcha\"]"),
                Signature::text("slide to verify"),
            ],
        ),
    ]
}

/// A positive detection: which group matched, its kind, and when it was seen.
#[derive(Debug, Clone, PartialEq)]
pub struct ChallengeMatch {
    pub kind: ChallengeKind,
    pub group: String,
    pub page_url: String,
    /// Monotonic detection instant; event durations are measured from here.
    pub detected_at: Instant,
    pub detected_wall: DateTime<Utc>,
}

impl ChallengeMatch {
    /// Stamped with the current time.
    pub fn new(kind: ChallengeKind, group: impl Into<String>, page_url: impl Into<String>) -> Self {
        Self {
            kind,
            group: group.into(),
            page_url: page_url.into(),
            detected_at: Instant::now(),
            detected_wall: Utc::now(),
        }
    }
}

/// Classifies the current page against a fixed, prioritized signature list.
///
/// Only read-only queries are reachable from here.
#[derive(Debug, Clone)]
pub struct ChallengeDetector {
    groups: Vec<SignatureGroup>,
    all: Vec<Signature>,
}

impl ChallengeDetector {
    pub fn new(groups: Vec<SignatureGroup>) -> Self {
        let all = groups
            .iter()
            .flat_map(|g| g.signatures.iter().cloned())
            .collect();
        Self { groups, all }
    }

    pub fn from_config(groups: Option<&[SignatureGroupConfig]>) -> Self {
        match groups {
            Some(cfgs) if !cfgs.is_empty() => {
                Self::new(cfgs.iter().map(SignatureGroup::from).collect())
            }
            _ => Self::new(default_signature_groups()),
        }
    }

    pub fn groups(&self) -> &[SignatureGroup] {
        &self.groups
    }

    /// Every configured signature, flattened in priority order.
    pub fn signatures(&self) -> &[Signature] {
        &self.all
    }

    pub async fn detect<P: PageProbe>(&self, signals: &PageSignals<P>) -> SignalResult<Option<ChallengeKind>> {
        Ok(self.detect_match(signals).await?.map(|m| m.kind))
    }

    /// First matching group in priority order wins. The whole pass shares one
    /// budget; if it runs out the result is "no challenge".
    pub async fn detect_match<P: PageProbe>(
        &self,
        signals: &PageSignals<P>,
    ) -> SignalResult<Option<ChallengeMatch>> {
        let deadline = Instant::now() + signals.budget();
        for group in &self.groups {
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "challenge_gate: detection budget ({}ms) exhausted before group `{}`; assuming no challenge",
                    signals.budget().as_millis(),
                    group.name
                );
                return Ok(None);
            }
            let remaining = deadline - now;
            if signals
                .challenge_present_within(&group.signatures, remaining)
                .await?
            {
                let page_url = signals.current_url().await.unwrap_or_default();
                info!(
                    "challenge_gate: challenge detected kind={} group={} url={}",
                    group.kind, group.name, page_url
                );
                return Ok(Some(ChallengeMatch::new(group.kind, group.name.clone(), page_url)));
            }
        }
        debug!("challenge_gate: no challenge signature matched");
        Ok(None)
    }

    /// True while any configured signature is still on the page.
    pub async fn any_present<P: PageProbe>(&self, signals: &PageSignals<P>) -> SignalResult<bool> {
        signals.challenge_present(&self.all).await
    }
}

impl Default for ChallengeDetector {
    fn default() -> Self {
        Self::new(default_signature_groups())
    }
}
