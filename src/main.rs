use std::sync::Arc;
use tracing::{error, info, warn};

use challenge_gate::browser::{BrowserSession, LaunchOptions, PageReload};
use challenge_gate::core::config::{load_gate_config, STAGE_REGISTRATION};
use challenge_gate::features::notify::PageBanner;
use challenge_gate::{ChallengeGate, EventRecorder, EventSink, GateDecision, JsonlFileSink};

const USAGE: &str = "usage: challenge-gate watch <url> [--stage <name>] [--expect <url-fragment>] [--timeout <secs>] [--port <n>]";

#[derive(Debug)]
struct WatchArgs {
    url: String,
    stage: String,
    expect: Option<String>,
    timeout_secs: Option<u64>,
    port: Option<u16>,
}

fn flag_value(args: &[String], name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == name {
            return it.next().cloned();
        }
        if let Some(rest) = a.strip_prefix(&prefix) {
            return Some(rest.to_string());
        }
    }
    None
}

fn parse_watch_args(args: &[String]) -> Option<WatchArgs> {
    let (cmd, rest) = args.split_first()?;
    if cmd != "watch" {
        return None;
    }
    let mut url = None;
    let mut it = rest.iter();
    while let Some(a) = it.next() {
        if a.starts_with("--") {
            if !a.contains('=') {
                it.next();
            }
            continue;
        }
        url = Some(a.clone());
        break;
    }
    let url = url?;
    Some(WatchArgs {
        url,
        stage: flag_value(rest, "--stage").unwrap_or_else(|| STAGE_REGISTRATION.to_string()),
        expect: flag_value(rest, "--expect"),
        timeout_secs: flag_value(rest, "--timeout").and_then(|v| v.trim().parse().ok()),
        port: flag_value(rest, "--port").and_then(|v| v.trim().parse().ok()),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,chromiumoxide=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{USAGE}");
        return Ok(());
    }
    let Some(watch) = parse_watch_args(&args) else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    let target = url::Url::parse(&watch.url)
        .map_err(|e| anyhow::anyhow!("invalid url `{}`: {}", watch.url, e))?;

    let config = load_gate_config();
    let mut stage = config
        .stage(&watch.stage)
        .unwrap_or_else(|| challenge_gate::StageConfig::new(watch.stage.clone(), ""));
    if let Some(expect) = watch.expect.clone() {
        stage.expected_url_pattern = expect;
    }
    if let Some(secs) = watch.timeout_secs {
        stage = stage.with_timeout(secs);
    }
    let timeout = config.resolve_stage_timeout(&stage);
    if stage.expected_url_pattern.is_empty() {
        warn!("challenge_gate: no expected url pattern; the challenge-cleared signal alone resolves and the post-check only looks for leftover signatures");
    }

    let primary: Option<Arc<dyn EventSink>> = config
        .resolve_event_log_path()
        .map(|p| Arc::new(JsonlFileSink::new(p)) as Arc<dyn EventSink>);
    let recorder = EventRecorder::new(primary);

    let mut opts = LaunchOptions::default();
    if let Some(port) = watch.port {
        opts.debugging_port = port;
    }
    let session = Arc::new(BrowserSession::launch(&opts).await?);
    session.goto(target.as_str()).await?;
    info!(
        "challenge_gate: watching {} for stage `{}` (timeout {}s)",
        target,
        stage.name,
        timeout.as_secs()
    );

    let mut gate = ChallengeGate::new(Arc::clone(&session), &config, recorder)
        .with_banner(Arc::clone(&session) as Arc<dyn PageBanner>)
        .with_reload(Arc::clone(&session) as Arc<dyn PageReload>);
    gate.settle_after_submit().await;

    let result = gate.handle_post_submit(&stage, timeout).await;
    let exit_code = match &result {
        Ok(GateDecision::NoChallenge) => {
            info!("challenge_gate: no challenge on the page");
            0
        }
        Ok(GateDecision::Resumed { kind, resolved_by }) => {
            info!("challenge_gate: {} challenge cleared ({:?})", kind, resolved_by);
            0
        }
        Err(e) => {
            error!("challenge_gate: run failed: {}", e);
            1
        }
    };

    let report = serde_json::json!({
        "stage": stage.name,
        "succeeded": result.is_ok(),
        "failure": result.as_ref().err().map(|e| e.to_string()),
        "events": gate.events(),
        "timeline": gate.timeline(),
        "summary": gate.summary(),
        "fallback_messages": gate.fallback_messages(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    drop(gate);
    match Arc::try_unwrap(session) {
        Ok(mut s) => s.close().await,
        Err(_) => warn!("challenge_gate: browser session still shared; leaving cleanup to drop"),
    }

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
