use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// GateConfig: file-based config loader (challenge-gate.json) with env-var fallback
// ---------------------------------------------------------------------------

pub const ENV_CONFIG_PATH: &str = "CHALLENGE_GATE_CONFIG";
pub const ENV_CHROME_EXECUTABLE: &str = "CHROME_EXECUTABLE";

pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_MAX_CHALLENGES: u32 = 3;
pub const DEFAULT_POLL_MS: u64 = 1000;
pub const DEFAULT_DETECT_BUDGET_MS: u64 = 3000;
pub const DEFAULT_SETTLE_MS: u64 = 2000;

pub const STAGE_REGISTRATION: &str = "registration";
pub const STAGE_PROFILE_UPDATE: &str = "profile_update";

/// One workflow stage that may be interrupted by a challenge after its submit.
#[derive(serde::Deserialize, Clone, Debug, PartialEq)]
pub struct StageConfig {
    pub name: String,
    /// Substring of the URL the stage lands on once its submit went through.
    pub expected_url_pattern: String,
    /// Overrides the run-wide verification timeout for this stage.
    #[serde(default)]
    pub verification_timeout_secs: Option<u64>,
    /// Free-form label logged when the flow resumes after a cleared challenge.
    #[serde(default)]
    pub next_step: Option<String>,
}

impl StageConfig {
    pub fn new(name: impl Into<String>, expected_url_pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expected_url_pattern: expected_url_pattern.into(),
            verification_timeout_secs: None,
            next_step: None,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.verification_timeout_secs = Some(secs);
        self
    }

    pub fn with_next_step(mut self, step: impl Into<String>) -> Self {
        self.next_step = Some(step.into());
        self
    }

    pub fn next_step_label(&self) -> &str {
        self.next_step.as_deref().unwrap_or("continue")
    }
}

/// Signature group as written in the config file. Order in the list is priority order.
#[derive(serde::Deserialize, Clone, Debug, PartialEq)]
pub struct SignatureGroupConfig {
    pub name: String,
    /// Challenge kind label (`press-and-hold`, `checkbox`, `slider`, `generic-modal`).
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub selectors: Vec<String>,
    /// Case-insensitive substrings matched against the page's visible text.
    #[serde(default)]
    pub text_markers: Vec<String>,
}

/// Top-level config loaded from `challenge-gate.json`.
///
/// Every scalar is optional in the file; `resolve_*` applies
/// JSON field → env var → built-in default.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct GateConfig {
    pub verification_timeout_secs: Option<u64>,
    pub max_challenges_per_run: Option<u32>,
    pub notifications_enabled: Option<bool>,
    pub poll_interval_ms: Option<u64>,
    pub detection_budget_ms: Option<u64>,
    pub settle_delay_ms: Option<u64>,
    /// How long signal (b) must hold before it counts. Zero accepts it on first sight.
    pub clear_grace_ms: Option<u64>,
    pub event_log_path: Option<PathBuf>,
    #[serde(default)]
    pub signature_groups: Option<Vec<SignatureGroupConfig>>,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    let v = std::env::var(key).ok()?;
    let v = v.trim().to_ascii_lowercase();
    if v.is_empty() {
        return None;
    }
    Some(!matches!(v.as_str(), "0" | "false" | "no" | "off" | "disabled"))
}

impl GateConfig {
    /// Verification timeout: JSON → `CHALLENGE_GATE_TIMEOUT_SECS` → 120s.
    pub fn resolve_timeout(&self) -> Duration {
        let secs = self
            .verification_timeout_secs
            .or_else(|| env_parse("CHALLENGE_GATE_TIMEOUT_SECS"))
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        Duration::from_secs(secs)
    }

    /// Per-stage timeout if the stage sets one, otherwise the run-wide value.
    pub fn resolve_stage_timeout(&self, stage: &StageConfig) -> Duration {
        stage
            .verification_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.resolve_timeout())
    }

    /// Challenge ceiling: JSON → `CHALLENGE_GATE_MAX_CHALLENGES` → 3.
    pub fn resolve_max_challenges(&self) -> u32 {
        self.max_challenges_per_run
            .or_else(|| env_parse("CHALLENGE_GATE_MAX_CHALLENGES"))
            .unwrap_or(DEFAULT_MAX_CHALLENGES)
    }

    /// Notifications: JSON → `CHALLENGE_GATE_NOTIFY` (set to "0" to disable) → on.
    pub fn resolve_notifications(&self) -> bool {
        self.notifications_enabled
            .or_else(|| env_flag("CHALLENGE_GATE_NOTIFY"))
            .unwrap_or(true)
    }

    pub fn resolve_poll_interval(&self) -> Duration {
        let ms = self
            .poll_interval_ms
            .or_else(|| env_parse("CHALLENGE_GATE_POLL_MS"))
            .unwrap_or(DEFAULT_POLL_MS);
        Duration::from_millis(ms.max(1))
    }

    pub fn resolve_detection_budget(&self) -> Duration {
        let ms = self
            .detection_budget_ms
            .or_else(|| env_parse("CHALLENGE_GATE_DETECT_BUDGET_MS"))
            .unwrap_or(DEFAULT_DETECT_BUDGET_MS);
        Duration::from_millis(ms)
    }

    /// Pause between a form submit and the first detection pass.
    pub fn resolve_settle_delay(&self) -> Duration {
        let ms = self
            .settle_delay_ms
            .or_else(|| env_parse("CHALLENGE_GATE_SETTLE_MS"))
            .unwrap_or(DEFAULT_SETTLE_MS);
        Duration::from_millis(ms)
    }

    pub fn resolve_clear_grace(&self) -> Duration {
        let ms = self
            .clear_grace_ms
            .or_else(|| env_parse("CHALLENGE_GATE_CLEAR_GRACE_MS"))
            .unwrap_or(0);
        Duration::from_millis(ms)
    }

    /// JSONL event log: JSON → `CHALLENGE_GATE_EVENT_LOG` → none.
    pub fn resolve_event_log_path(&self) -> Option<PathBuf> {
        if let Some(p) = &self.event_log_path {
            if !p.as_os_str().is_empty() {
                return Some(p.clone());
            }
        }
        std::env::var("CHALLENGE_GATE_EVENT_LOG")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    }

    /// Stage lookup by name; falls back to the built-in stage table.
    pub fn stage(&self, name: &str) -> Option<StageConfig> {
        self.stages
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .or_else(|| default_stages().into_iter().find(|s| s.name == name))
    }
}

/// Built-in stage table. Expected patterns are path fragments; sites override them in config.
pub fn default_stages() -> Vec<StageConfig> {
    vec![
        StageConfig::new(STAGE_REGISTRATION, "/account").with_next_step("profile_update"),
        StageConfig::new(STAGE_PROFILE_UPDATE, "/profile").with_next_step("persist_account"),
    ]
}

/// Load `challenge-gate.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `CHALLENGE_GATE_CONFIG` env var path
/// 2. `./challenge-gate.json`
/// 3. `../challenge-gate.json`
/// 4. `<user config dir>/challenge-gate/challenge-gate.json`
///
/// Missing file → `GateConfig::default()` (env-var fallbacks apply).
/// Parse error → log a warning, return `GateConfig::default()`.
pub fn load_gate_config() -> GateConfig {
    let mut candidates = vec![
        PathBuf::from("challenge-gate.json"),
        PathBuf::from("../challenge-gate.json"),
    ];
    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join("challenge-gate").join("challenge-gate.json"));
    }
    if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
        candidates.insert(0, PathBuf::from(env_path));
    }

    for path in &candidates {
        let Ok(contents) = std::fs::read_to_string(path) else {
            continue;
        };
        return match parse_gate_config(&contents) {
            Ok(cfg) => {
                tracing::info!("challenge-gate.json loaded from {}", path.display());
                cfg
            }
            Err(e) => {
                tracing::warn!(
                    "challenge-gate.json parse error at {}: {} (using defaults)",
                    path.display(),
                    e
                );
                GateConfig::default()
            }
        };
    }

    GateConfig::default()
}

pub fn parse_gate_config(contents: &str) -> Result<GateConfig, serde_json::Error> {
    serde_json::from_str::<GateConfig>(contents)
}

/// Optional override for the Chromium-family browser executable.
pub fn chrome_executable_override() -> Option<String> {
    let p = std::env::var(ENV_CHROME_EXECUTABLE).ok()?;
    let p = p.trim();
    if p.is_empty() || !std::path::Path::new(p).exists() {
        return None;
    }
    Some(p.to_string())
}
