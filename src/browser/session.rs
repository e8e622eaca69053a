use crate::browser::probe::{PageProbe, PageReload, Signature};
use crate::core::config::chrome_executable_override;
use crate::core::error::ProbeError;
use crate::core::types::FailureReason;
use crate::features::notify::{PageBanner, BANNER_ELEMENT_ID};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chromiumoxide::Browser;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_DEBUGGING_PORT: u16 = 9222;

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub debugging_port: u16,
    /// Profile directory; a throwaway one under the temp dir when `None`.
    pub user_data_dir: Option<PathBuf>,
    pub startup_wait: Duration,
    pub connect_attempts: u32,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            debugging_port: DEFAULT_DEBUGGING_PORT,
            user_data_dir: None,
            startup_wait: Duration::from_millis(3000),
            connect_attempts: 5,
        }
    }
}

/// A visible Chromium-family window driven over CDP.
///
/// The operator solves challenges in this window; the crate itself only reads
/// from the page and paints its own banner.
pub struct BrowserSession {
    browser: Browser,
    page: chromiumoxide::Page,
    handler_task: tokio::task::JoinHandle<()>,
    closed: Arc<AtomicBool>,
    child: Mutex<Option<Child>>,
    profile_dir: Option<PathBuf>,
    created_profile_dir: bool,
    debugging_port: u16,
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        self.handler_task.abort();
        if let Ok(mut guard) = self.child.lock() {
            if let Some(mut child) = guard.take() {
                debug!(
                    "challenge_gate: BrowserSession drop - killing browser on port {}",
                    self.debugging_port
                );
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        if self.created_profile_dir {
            if let Some(dir) = self.profile_dir.take() {
                let _ = std::fs::remove_dir_all(dir);
            }
        }
    }
}

impl BrowserSession {
    pub async fn launch(opts: &LaunchOptions) -> anyhow::Result<Self> {
        let chrome_exe = find_chrome_executable().ok_or_else(|| {
            anyhow!("Browser executable not found (tried CHROME_EXECUTABLE, Brave, Chrome, Chromium)")
        })?;

        let (profile_dir, created_profile_dir) = match &opts.user_data_dir {
            Some(dir) => (dir.clone(), false),
            None => (
                std::env::temp_dir().join(format!(
                    "challenge-gate-{}-{}",
                    std::process::id(),
                    opts.debugging_port
                )),
                true,
            ),
        };
        std::fs::create_dir_all(&profile_dir)
            .with_context(|| format!("creating profile dir {}", profile_dir.display()))?;

        let args = vec![
            format!("--remote-debugging-port={}", opts.debugging_port),
            format!("--user-data-dir={}", profile_dir.display()),
            "--disable-infobars".to_string(),
            "--no-first-run".to_string(),
            "--no-default-browser-check".to_string(),
        ];

        info!("challenge_gate: launching visible browser {}", chrome_exe);
        let child = std::process::Command::new(&chrome_exe)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn browser: {}", e))?;

        tokio::time::sleep(opts.startup_wait).await;

        let (browser, handler) = connect_cdp(opts.debugging_port, opts.connect_attempts.max(1)).await?;
        let closed = Arc::new(AtomicBool::new(false));
        let handler_task = spawn_handler_task(handler, Arc::clone(&closed));

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| anyhow!("Failed to open working tab: {}", e))?;

        Ok(Self {
            browser,
            page,
            handler_task,
            closed,
            child: Mutex::new(Some(child)),
            profile_dir: Some(profile_dir),
            created_profile_dir,
            debugging_port: opts.debugging_port,
        })
    }

    pub fn page(&self) -> &chromiumoxide::Page {
        &self.page
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn goto(&self, url: &str) -> anyhow::Result<()> {
        self.page
            .goto(url)
            .await
            .map_err(|e| anyhow!("navigation to {} failed: {}", url, e))?;
        Ok(())
    }

    pub async fn close(&mut self) {
        info!(
            "challenge_gate: closing browser session (port {})",
            self.debugging_port
        );
        let _ = self.browser.close().await;
        let _ = self.browser.wait().await;
        self.handler_task.abort();
        if let Ok(mut guard) = self.child.lock() {
            if let Some(mut child) = guard.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }

    fn process_exited(&self) -> bool {
        let Ok(mut guard) = self.child.lock() else {
            return false;
        };
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(Some(_))),
            None => false,
        }
    }

    fn map_cdp_error(&self, op: &str, err: impl std::fmt::Display) -> ProbeError {
        if let Err(reason) = self.liveness() {
            return ProbeError::SessionGone(reason);
        }
        let msg = err.to_string();
        let lower = msg.to_lowercase();
        if lower.contains("target closed") || lower.contains("no such target") {
            return ProbeError::SessionGone(FailureReason::BrowserClosed);
        }
        ProbeError::Transient(format!("{op}: {msg}"))
    }
}

#[async_trait]
impl PageProbe for BrowserSession {
    fn liveness(&self) -> Result<(), FailureReason> {
        if self.process_exited() {
            return Err(FailureReason::BrowserClosed);
        }
        if self.is_closed() {
            return Err(FailureReason::SessionLost);
        }
        Ok(())
    }

    async fn current_url(&self) -> Result<String, ProbeError> {
        match self.page.url().await {
            Ok(Some(url)) => Ok(url),
            Ok(None) => Err(ProbeError::Transient("page has no url yet".to_string())),
            Err(e) => Err(self.map_cdp_error("url", e)),
        }
    }

    async fn any_visible(&self, signatures: &[Signature]) -> Result<bool, ProbeError> {
        let js = signature_probe_script(signatures);
        let value = self
            .page
            .evaluate(js)
            .await
            .map_err(|e| self.map_cdp_error("evaluate", e))?;
        value
            .into_value::<bool>()
            .map_err(|e| ProbeError::Transient(format!("probe result: {e}")))
    }
}

#[async_trait]
impl PageReload for BrowserSession {
    async fn reload(&self) -> anyhow::Result<()> {
        self.liveness()
            .map_err(|reason| anyhow!("cannot reload, browser session unusable: {}", reason))?;
        info!("challenge_gate: reloading page");
        self.page
            .reload()
            .await
            .map_err(|e| anyhow!("page reload failed: {}", e))?;
        Ok(())
    }
}

#[async_trait]
impl PageBanner for BrowserSession {
    async fn show_banner(&self, message: &str) -> anyhow::Result<()> {
        self.page
            .evaluate(banner_show_script(message))
            .await
            .map_err(|e| anyhow!("banner inject failed: {}", e))?;
        Ok(())
    }

    async fn clear_banner(&self) -> anyhow::Result<()> {
        self.page
            .evaluate(banner_clear_script())
            .await
            .map_err(|e| anyhow!("banner removal failed: {}", e))?;
        Ok(())
    }
}

async fn connect_cdp(
    debugging_port: u16,
    attempts: u32,
) -> anyhow::Result<(Browser, chromiumoxide::Handler)> {
    let json_url = format!("http://127.0.0.1:{}/json/version", debugging_port);
    let mut last_error = None;

    for attempt in 1..=attempts {
        let ws_url_result: anyhow::Result<String> = async {
            let response = reqwest::get(&json_url)
                .await
                .map_err(|e| anyhow!("HTTP request failed: {}", e))?;
            let json: serde_json::Value = response
                .json()
                .await
                .map_err(|e| anyhow!("JSON parse failed: {}", e))?;
            json["webSocketDebuggerUrl"]
                .as_str()
                .ok_or_else(|| anyhow!("No webSocketDebuggerUrl in response"))
                .map(|s| s.to_string())
        }
        .await;

        match ws_url_result {
            Ok(ws_url) => {
                info!("challenge_gate: discovered CDP endpoint: {}", ws_url);
                match Browser::connect(ws_url).await {
                    Ok(pair) => return Ok(pair),
                    Err(e) => last_error = Some(anyhow!("Browser connect failed: {}", e)),
                }
            }
            Err(e) => last_error = Some(e),
        }

        if attempt < attempts {
            info!(
                "challenge_gate: CDP connection attempt {} failed, retrying...",
                attempt
            );
            tokio::time::sleep(Duration::from_millis(2000)).await;
        }
    }

    Err(anyhow!(
        "Failed to connect to browser after {} attempts. Last error: {:?}",
        attempts,
        last_error
    ))
}

fn spawn_handler_task(
    mut handler: chromiumoxide::Handler,
    closed: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                warn!("chromiumoxide handler event error: {}", e);
            }
        }
        closed.store(true, Ordering::SeqCst);
    })
}

/// Locate a Chromium-family browser: `CHROME_EXECUTABLE`, then `PATH`, then
/// well-known install locations.
pub fn find_chrome_executable() -> Option<String> {
    if let Some(p) = chrome_executable_override() {
        return Some(p);
    }

    let names = [
        "google-chrome",
        "chromium",
        "chromium-browser",
        "brave-browser",
        "brave",
        "chrome",
    ];
    if let Ok(path_var) = std::env::var("PATH") {
        for dir in std::env::split_paths(&path_var) {
            for exe in names {
                let full = dir.join(exe);
                if full.exists() {
                    return Some(full.to_string_lossy().to_string());
                }
            }
        }
    }

    #[cfg(target_os = "macos")]
    let candidates: &[&str] = &[
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
        "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
    ];
    #[cfg(target_os = "windows")]
    let candidates: &[&str] = &[
        r"C:\Program Files\Google\Chrome\Application\chrome.exe",
        r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        r"C:\Program Files\BraveSoftware\Brave-Browser\Application\brave.exe",
    ];
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let candidates: &[&str] = &[
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/usr/bin/brave-browser",
        "/usr/local/bin/chromium",
        "/snap/bin/chromium",
    ];

    candidates
        .iter()
        .find(|c| Path::new(c).exists())
        .map(|c| c.to_string())
}

/// Read-only page script: true when any selector matches a visible element or
/// any text marker occurs in the visible body text. Our own banner is skipped.
pub fn signature_probe_script(signatures: &[Signature]) -> String {
    let mut selectors = Vec::new();
    let mut texts = Vec::new();
    for sig in signatures {
        match sig {
            Signature::Selector(s) => selectors.push(s.as_str()),
            Signature::Text(t) => texts.push(t.as_str()),
        }
    }
    let selectors = serde_json::to_string(&selectors).unwrap_or_else(|_| "[]".to_string());
    let texts = serde_json::to_string(&texts).unwrap_or_else(|_| "[]".to_string());
    let banner = serde_json::to_string(BANNER_ELEMENT_ID).unwrap_or_else(|_| "\"\"".to_string());

    format!(
        r#"(() => {{
            const selectors = {selectors};
            const texts = {texts};
            const banner = document.getElementById({banner});
            const visible = (el) => {{
                if (banner && banner.contains(el)) return false;
                const r = el.getBoundingClientRect();
                const s = window.getComputedStyle(el);
                return r.width > 0 && r.height > 0 && s.display !== 'none' && s.visibility !== 'hidden';
            }};
            for (const sel of selectors) {{
                let nodes = [];
                try {{ nodes = document.querySelectorAll(sel); }} catch (_) {{ continue; }}
                for (const n of nodes) {{ if (visible(n)) return true; }}
            }}
            if (texts.length === 0) return false;
            let body = ((document.body && document.body.innerText) || '');
            if (banner) body = body.replace(banner.innerText || '', '');
            body = body.toLowerCase();
            return texts.some(t => body.includes(t));
        }})()"#
    )
}

fn banner_show_script(message: &str) -> String {
    let id = serde_json::to_string(BANNER_ELEMENT_ID).unwrap_or_else(|_| "\"\"".to_string());
    let msg = serde_json::to_string(message).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"(() => {{
            const id = {id};
            let div = document.getElementById(id);
            if (!div) {{
                div = document.createElement('div');
                div.id = id;
                div.style.position = 'fixed';
                div.style.left = '0';
                div.style.top = '0';
                div.style.right = '0';
                div.style.zIndex = '2147483647';
                div.style.padding = '16px';
                div.style.fontSize = '20px';
                div.style.fontWeight = '700';
                div.style.background = 'rgba(0,0,0,0.85)';
                div.style.color = 'white';
                div.style.textAlign = 'center';
                div.style.pointerEvents = 'none';
                div.style.borderBottom = '4px solid #ff4444';
                document.documentElement.appendChild(div);
            }}
            div.textContent = {msg};
            return true;
        }})()"#
    )
}

fn banner_clear_script() -> String {
    let id = serde_json::to_string(BANNER_ELEMENT_ID).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"(() => {{ const el = document.getElementById({id}); if (el) el.remove(); return true; }})()"#
    )
}
