use tracing::{error, info};

/// Per-run challenge counter and its ceiling.
///
/// The counter only passes the ceiling on the same transition that marks the
/// run failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunVerificationState {
    count: u32,
    ceiling: u32,
    failed: bool,
}

impl RunVerificationState {
    pub fn new(ceiling: u32) -> Self {
        Self {
            count: 0,
            ceiling,
            failed: false,
        }
    }

    /// Call once per positive detection, before any wait starts.
    ///
    /// Returns `false` once the ceiling is exceeded; the caller must abort the
    /// run. A wait already in progress is unaffected.
    pub fn register_challenge(&mut self) -> bool {
        if self.failed {
            error!(
                "challenge_gate: run already exhausted its {} challenges; rejecting",
                self.ceiling
            );
            return false;
        }
        self.count += 1;
        if self.count > self.ceiling {
            self.failed = true;
            error!(
                "challenge_gate: maximum challenges per run ({}) exceeded (encounter {})",
                self.ceiling, self.count
            );
            return false;
        }
        info!(
            "challenge_gate: challenge attempt {}/{}",
            self.count, self.ceiling
        );
        true
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn remaining(&self) -> u32 {
        self.ceiling.saturating_sub(self.count)
    }
}
