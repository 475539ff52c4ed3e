/// Backoff bookkeeping for reattaching a dropped subscription
use crate::config::ResumePolicy;
use std::time::Duration;

pub(crate) struct ResumeState {
    policy: ResumePolicy,
    failures: u32,
}

impl ResumeState {
    pub(crate) fn new(policy: ResumePolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Number of the attempt about to be made (1-based)
    pub(crate) fn attempt(&self) -> u32 {
        self.failures + 1
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failed attempt. Returns true exactly once, on the failure that crosses
    /// the degraded threshold.
    pub(crate) fn fail(&mut self) -> bool {
        self.failures = self.failures.saturating_add(1);
        self.failures == self.policy.degraded_after.max(1)
    }

    pub(crate) fn is_degraded(&self) -> bool {
        self.failures >= self.policy.degraded_after.max(1)
    }

    pub(crate) fn reset(&mut self) {
        self.failures = 0;
    }

    /// Wait before the next attempt: the initial backoff, doubled per consecutive
    /// failure, capped at the maximum
    pub(crate) fn delay(&self) -> Duration {
        let shift = self.failures.saturating_sub(1).min(16);
        self.policy
            .initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.policy.max_backoff)
    }
}
