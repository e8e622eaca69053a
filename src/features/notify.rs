use crate::core::types::{ChallengeKind, Resolution};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

#[cfg(feature = "desktop-notify")]
use notify_rust::Notification;
#[cfg(feature = "desktop-notify")]
use rodio::{OutputStreamBuilder, Sink, Source};

pub const BANNER_ELEMENT_ID: &str = "__challenge_gate_banner__";

/// Surface inside the browser window where the operator is told what to do.
///
/// Implemented by the browser session; the banner is our own element and is
/// never part of any signature.
#[async_trait]
pub trait PageBanner: Send + Sync {
    async fn show_banner(&self, message: &str) -> anyhow::Result<()>;
    async fn clear_banner(&self) -> anyhow::Result<()>;
}

/// Tells the human operator a challenge needs them, and when it is over.
#[derive(Debug, Clone, Copy)]
pub struct Notifier {
    enabled: bool,
    /// Cap on each in-page banner call.
    banner_budget: Duration,
}

impl Notifier {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            banner_budget: Duration::from_secs(3),
        }
    }

    pub fn with_banner_budget(mut self, budget: Duration) -> Self {
        self.banner_budget = budget;
        self
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub async fn challenge_started(
        &self,
        kind: ChallengeKind,
        timeout: Duration,
        remaining: u32,
        banner: Option<&dyn PageBanner>,
    ) {
        if !self.enabled {
            return;
        }
        eprintln!("{}", render_console_banner(kind, timeout, remaining));
        if let Some(b) = banner {
            let msg = format!(
                "Verification required ({}). Please complete it in this window within {}s.",
                kind,
                timeout.as_secs()
            );
            match tokio::time::timeout(self.banner_budget, b.show_banner(&msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("challenge_gate: in-page banner failed: {}", e),
                Err(_) => warn!(
                    "challenge_gate: in-page banner not shown within {}ms; continuing",
                    self.banner_budget.as_millis()
                ),
            }
        }
        desktop_alert(kind, timeout);
        play_tone(Tone::Urgent);
    }

    pub async fn challenge_finished(&self, resolution: Resolution, banner: Option<&dyn PageBanner>) {
        if !self.enabled {
            return;
        }
        if let Some(b) = banner {
            match tokio::time::timeout(self.banner_budget, b.clear_banner()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("challenge_gate: clearing in-page banner failed: {}", e),
                Err(_) => warn!(
                    "challenge_gate: in-page banner not cleared within {}ms; continuing",
                    self.banner_budget.as_millis()
                ),
            }
        }
        if resolution.is_success() {
            info!("challenge_gate: verification cleared; automation resuming");
            play_tone(Tone::Success);
        } else {
            eprintln!("challenge_gate: verification not completed ({:?}); this run will stop", resolution);
        }
    }
}

pub fn render_console_banner(kind: ChallengeKind, timeout: Duration, remaining: u32) -> String {
    let rule = "=".repeat(62);
    format!(
        "\n{rule}\n  VERIFICATION CHALLENGE DETECTED\n\n  kind:      {kind}\n  action:    complete the challenge in the browser window\n  timeout:   {}s\n  attempts:  {remaining} left after this one\n{rule}",
        timeout.as_secs()
    )
}

enum Tone {
    Urgent,
    Success,
}

#[cfg(feature = "desktop-notify")]
fn desktop_alert(kind: ChallengeKind, timeout: Duration) {
    let body = format!(
        "A {} challenge is waiting in the browser ({}s).",
        kind,
        timeout.as_secs()
    );
    if let Err(e) = Notification::new()
        .summary("Verification required")
        .body(&body)
        .show()
    {
        warn!("challenge_gate: desktop notification failed: {}", e);
    }
}

#[cfg(not(feature = "desktop-notify"))]
fn desktop_alert(_kind: ChallengeKind, _timeout: Duration) {}

#[cfg(feature = "desktop-notify")]
fn play_tone(tone: Tone) {
    // Best-effort audio. If audio output is unavailable, silently ignore.
    let (freq, dur_ms) = match tone {
        Tone::Urgent => (880.0_f32, 700u64),
        Tone::Success => (523.0_f32, 250u64),
    };

    std::thread::spawn(move || {
        let Ok(mut stream) = OutputStreamBuilder::open_default_stream() else {
            return;
        };
        stream.log_on_drop(false);
        let sink = Sink::connect_new(stream.mixer());
        let src = rodio::source::SineWave::new(freq)
            .take_duration(Duration::from_millis(dur_ms))
            .amplify(0.20);
        sink.append(src);
        sink.sleep_until_end();
    });
}

#[cfg(not(feature = "desktop-notify"))]
fn play_tone(_tone: Tone) {}
