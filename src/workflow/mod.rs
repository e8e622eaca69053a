//! Workflow integration points.
//!
//! A stage owns its form: it fills and submits it through a [`StageDriver`],
//! then hands control to the gate. The gate either finds nothing, or blocks
//! until the operator clears the challenge and the page is where the stage
//! expects it. Finally the stage runs its own success check.

use crate::browser::probe::PageProbe;
use crate::core::config::{GateConfig, StageConfig, STAGE_PROFILE_UPDATE, STAGE_REGISTRATION};
use crate::core::error::GateError;
use crate::core::types::{ChallengeKind, ResolvedBy, VerificationEvent};
use crate::features::gate::{ChallengeGate, GateDecision};
use crate::features::recorder::{RunSummary, TimelineRecord};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info};

/// Stage-specific collaborator: form submission and the stage's native
/// success check (e.g. a redirect status or a confirmation element).
#[async_trait]
pub trait StageDriver: Send {
    async fn submit(&mut self) -> anyhow::Result<()>;

    async fn confirm_success(&mut self) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Registration,
    ProfileUpdate,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Registration => STAGE_REGISTRATION,
            Stage::ProfileUpdate => STAGE_PROFILE_UPDATE,
        }
    }

    pub fn config(&self, cfg: &GateConfig) -> StageConfig {
        cfg.stage(self.name())
            .unwrap_or_else(|| StageConfig::new(self.name(), ""))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub challenge: Option<ChallengeKind>,
    pub resolved_by: Option<ResolvedBy>,
}

/// Submit, settle, gate, then the stage-native check.
pub async fn run_stage<P: PageProbe>(
    gate: &mut ChallengeGate<P>,
    stage: &StageConfig,
    timeout: std::time::Duration,
    driver: &mut dyn StageDriver,
) -> Result<StageReport, GateError> {
    driver
        .submit()
        .await
        .map_err(|source| GateError::Collaborator {
            stage: stage.name.clone(),
            source,
        })?;
    gate.settle_after_submit().await;

    let mut report = StageReport {
        stage: stage.name.clone(),
        challenge: None,
        resolved_by: None,
    };
    if let GateDecision::Resumed { kind, resolved_by } = gate.handle_post_submit(stage, timeout).await? {
        report.challenge = Some(kind);
        report.resolved_by = Some(resolved_by);
    }

    let confirmed = driver
        .confirm_success()
        .await
        .map_err(|source| GateError::Collaborator {
            stage: stage.name.clone(),
            source,
        })?;
    if !confirmed {
        return Err(GateError::StageUnconfirmed {
            stage: stage.name.clone(),
        });
    }
    info!("challenge_gate: stage `{}` confirmed", stage.name);
    Ok(report)
}

/// End-of-run report for the workflow loop.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub succeeded: bool,
    pub stages: Vec<StageReport>,
    pub failed_stage: Option<String>,
    pub failure: Option<String>,
    #[serde(skip)]
    pub error: Option<GateError>,
    pub events: Vec<VerificationEvent>,
    pub timeline: Vec<TimelineRecord>,
    pub summary: RunSummary,
    pub fallback_messages: Vec<String>,
}

/// One verification run: a gate plus the stages it guards, executed in order.
pub struct WorkflowRun<P> {
    gate: ChallengeGate<P>,
    config: GateConfig,
    reports: Vec<StageReport>,
}

impl<P: PageProbe> WorkflowRun<P> {
    pub fn new(gate: ChallengeGate<P>, config: GateConfig) -> Self {
        Self {
            gate,
            config,
            reports: Vec::new(),
        }
    }

    pub fn gate(&self) -> &ChallengeGate<P> {
        &self.gate
    }

    pub async fn run_stage(&mut self, stage: Stage, driver: &mut dyn StageDriver) -> Result<(), GateError> {
        let cfg = stage.config(&self.config);
        let timeout = self.config.resolve_stage_timeout(&cfg);
        let report = run_stage(&mut self.gate, &cfg, timeout, driver).await?;
        self.reports.push(report);
        Ok(())
    }

    /// Run every stage in order; the first error ends the run.
    pub async fn run(mut self, steps: Vec<(Stage, Box<dyn StageDriver>)>) -> RunReport {
        let mut failure = None;
        for (stage, mut driver) in steps {
            if let Err(e) = self.run_stage(stage, driver.as_mut()).await {
                error!("challenge_gate: run failed at stage `{}`: {}", stage.name(), e);
                failure = Some((stage, e));
                break;
            }
        }
        self.finish(failure)
    }

    fn finish(self, failure: Option<(Stage, GateError)>) -> RunReport {
        let events = self.gate.events().to_vec();
        let timeline = self.gate.timeline().to_vec();
        let summary = self.gate.summary();
        let fallback_messages = self.gate.fallback_messages().to_vec();
        let (failed_stage, failure, error) = match failure {
            Some((stage, e)) => (Some(stage.name().to_string()), Some(e.to_string()), Some(e)),
            None => (None, None, None),
        };
        RunReport {
            succeeded: error.is_none(),
            stages: self.reports,
            failed_stage,
            failure,
            error,
            events,
            timeline,
            summary,
            fallback_messages,
        }
    }
}
