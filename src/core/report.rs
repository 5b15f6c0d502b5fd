//! ST-051: Run report and exit code.

use super::context::StackOutputs;
use super::types::{RunAction, SkipReason, StackStatus};
use crate::hooks::HookReport;
use crate::provider::RemoteStatus;
use std::fmt;
use std::time::Duration;

/// Exit code for a run interrupted by cancellation.
pub const EXIT_CANCELLED: i32 = 130;

/// Final state of one declared stack.
#[derive(Debug, Clone)]
pub struct StackReport {
    pub name: String,
    pub fqn: String,
    pub action: RunAction,
    pub status: StackStatus,
    pub remote_status: Option<RemoteStatus>,
    /// Failure or no-op detail
    pub reason: Option<String>,
    pub skip: Option<SkipReason>,
    pub duration: Duration,
    pub outputs: StackOutputs,
    /// Per-stack hook outcomes
    pub hooks: Vec<HookReport>,
    /// Interrupted mid-operation by cancellation
    pub cancelled: bool,
}

impl StackReport {
    pub fn new(name: &str, fqn: &str, action: RunAction, status: StackStatus) -> Self {
        Self {
            name: name.to_string(),
            fqn: fqn.to_string(),
            action,
            status,
            remote_status: None,
            reason: None,
            skip: None,
            duration: Duration::ZERO,
            outputs: StackOutputs::new(),
            hooks: Vec::new(),
            cancelled: false,
        }
    }

    pub fn skipped(name: &str, fqn: &str, action: RunAction, reason: SkipReason) -> Self {
        let mut report = Self::new(name, fqn, action, StackStatus::Skipped);
        report.skip = Some(reason);
        report
    }

    pub fn failed(name: &str, fqn: &str, action: RunAction, reason: impl Into<String>) -> Self {
        let mut report = Self::new(name, fqn, action, StackStatus::Failed);
        report.reason = Some(reason.into());
        report
    }

    /// Settled, or intentionally disabled.
    pub fn is_ok(&self) -> bool {
        self.status.is_success() || self.skip == Some(SkipReason::Disabled)
    }
}

impl fmt::Display for StackReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<24} {}", self.name, self.status)?;
        if let Some(skip) = &self.skip {
            write!(f, " ({})", skip)?;
        }
        if let Some(remote) = self.remote_status {
            write!(f, " [{}]", remote)?;
        }
        if let Some(reason) = &self.reason {
            write!(f, ": {}", reason)?;
        }
        Ok(())
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub action: RunAction,
    pub run_id: String,
    /// Every declared stack, in declaration order
    pub stacks: Vec<StackReport>,
    /// Run-level hook outcomes
    pub hooks: Vec<HookReport>,
    pub cancelled: bool,
    pub duration: Duration,
}

impl RunReport {
    pub fn stack(&self, name: &str) -> Option<&StackReport> {
        self.stacks.iter().find(|s| s.name == name)
    }

    /// A required run-level hook that failed.
    pub fn hook_failure(&self) -> Option<&HookReport> {
        self.hooks.iter().find(|h| h.required && h.is_failed())
    }

    pub fn succeeded(&self) -> bool {
        !self.cancelled && self.hook_failure().is_none() && self.stacks.iter().all(StackReport::is_ok)
    }

    /// 0 on success, 130 when cancelled, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            EXIT_CANCELLED
        } else if self.succeeded() {
            0
        } else {
            1
        }
    }

    /// (settled, failed, skipped) counts.
    pub fn counts(&self) -> (u32, u32, u32) {
        let mut counts = (0, 0, 0);
        for stack in &self.stacks {
            match stack.status {
                StackStatus::Failed => counts.1 += 1,
                StackStatus::Skipped => counts.2 += 1,
                _ => counts.0 += 1,
            }
        }
        counts
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for stack in &self.stacks {
            writeln!(f, "  {}", stack)?;
        }
        for hook in self.hooks.iter().filter(|h| h.is_failed()) {
            writeln!(f, "  hook {} ({}): {}", hook.path, hook.phase, hook.status)?;
        }
        let (ok, failed, skipped) = self.counts();
        write!(
            f,
            "{} {}: {} settled, {} failed, {} skipped in {:.1}s",
            self.action,
            if self.cancelled { "cancelled" } else if self.succeeded() { "complete" } else { "failed" },
            ok,
            failed,
            skipped,
            self.duration.as_secs_f64()
        )
    }
}
