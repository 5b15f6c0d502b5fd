//! ST-021: Provider client: polling, diffing and retry around a [`Provider`].
//!
//! Every mutating call is followed by a poll loop that describes the stack
//! until it leaves its `*_IN_PROGRESS` state, the timeout expires, or the run
//! is cancelled. Throttling-class errors are retried with exponential backoff.

use super::{digest, Provider, ProviderStackState, RemoteStatus, StackRequest};
use crate::core::context::StackOutputs;
use crate::core::types::{Settings, StackStatus};
use crate::error::ProviderError;
use indexmap::IndexMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Poll loop and retry tunables.
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub recreate_failed: bool,
}

impl From<&Settings> for PollSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            timeout: settings.timeout(),
            max_retries: settings.max_retries,
            backoff_base: settings.backoff_base(),
            recreate_failed: settings.recreate_failed,
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

/// What applying a request would do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Update,
    NoChange,
    /// Delete a stack left by a failed create, then create it again
    Recreate,
}

/// One changed key in parameters or tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterChange {
    pub key: String,
    pub old: Option<String>,
    pub new: Option<String>,
}

impl fmt::Display for ParameterChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.old, &self.new) {
            (None, Some(new)) => write!(f, "+ {} = {}", self.key, new),
            (Some(old), None) => write!(f, "- {} (was {})", self.key, old),
            (Some(old), Some(new)) => write!(f, "~ {}: {} -> {}", self.key, old, new),
            (None, None) => write!(f, "  {}", self.key),
        }
    }
}

/// Difference between a remote stack and a request.
#[derive(Debug, Clone)]
pub struct Diff {
    pub stack: String,
    pub action: ChangeKind,
    pub template_changed: bool,
    pub old_digest: Option<String>,
    pub new_digest: String,
    pub parameters: Vec<ParameterChange>,
    pub tags: Vec<ParameterChange>,
}

impl Diff {
    pub fn has_changes(&self) -> bool {
        self.action != ChangeKind::NoChange
    }

    /// One-line description for plan output.
    pub fn summary(&self) -> String {
        match self.action {
            ChangeKind::Create => format!("create ({} parameters)", self.parameters.len()),
            ChangeKind::Recreate => "replace stack left by a failed create".to_string(),
            ChangeKind::NoChange => "no changes".to_string(),
            ChangeKind::Update => {
                let mut parts = Vec::new();
                if self.template_changed {
                    parts.push("template changed".to_string());
                }
                if !self.parameters.is_empty() {
                    parts.push(format!("{} parameter change(s)", self.parameters.len()));
                }
                if !self.tags.is_empty() {
                    parts.push(format!("{} tag change(s)", self.tags.len()));
                }
                parts.join(", ")
            }
        }
    }
}

/// Settled outcome of one apply or destroy.
#[derive(Debug, Clone)]
pub struct StackResult {
    pub status: StackStatus,
    pub remote_status: Option<RemoteStatus>,
    pub reason: Option<String>,
    pub outputs: StackOutputs,
}

impl StackResult {
    fn settled(status: StackStatus, state: &ProviderStackState) -> Self {
        Self {
            status,
            remote_status: Some(state.status),
            reason: state.status_reason.clone(),
            outputs: state.outputs.clone(),
        }
    }

    fn failed(remote_status: Option<RemoteStatus>, reason: impl Into<String>) -> Self {
        Self {
            status: StackStatus::Failed,
            remote_status,
            reason: Some(reason.into()),
            outputs: StackOutputs::new(),
        }
    }
}

/// A [`Provider`] plus the polling and retry policy around it.
#[derive(Clone)]
pub struct ProviderClient {
    provider: Arc<dyn Provider>,
    settings: PollSettings,
}

impl ProviderClient {
    pub fn new(provider: Arc<dyn Provider>, settings: PollSettings) -> Self {
        Self { provider, settings }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    /// Current remote state, `None` when the stack does not exist.
    pub async fn describe(&self, name: &str) -> Result<Option<ProviderStackState>, ProviderError> {
        let state = self
            .with_retry("describe", || self.provider.describe_stack(name))
            .await?;
        Ok(state.filter(|s| s.status != RemoteStatus::DeleteComplete))
    }

    /// Compare the remote stack against a request without mutating anything.
    pub async fn plan(&self, request: &StackRequest) -> Result<Diff, ProviderError> {
        let current = self.describe(&request.name).await?;
        Ok(diff_state(current.as_ref(), request))
    }

    /// Create or update a stack and wait for it to settle.
    pub async fn apply(
        &self,
        request: &StackRequest,
        cancel: &CancellationToken,
    ) -> Result<StackResult, ProviderError> {
        check_cancel(&request.name, cancel)?;
        let mut current = self.describe(&request.name).await?;
        if current.as_ref().is_some_and(|s| s.status.is_in_progress()) {
            debug!(stack = %request.name, "waiting for in-flight operation to settle");
            current = self.wait(&request.name, cancel).await?;
        }

        let Some(state) = current else {
            return self.create(request, cancel).await;
        };

        if state.status.needs_recreate() {
            if !self.settings.recreate_failed {
                return Ok(StackResult::failed(
                    Some(state.status),
                    format!(
                        "stack is in {} after a failed create; enable recreate_failed to replace it",
                        state.status
                    ),
                ));
            }
            info!(stack = %request.name, status = %state.status, "deleting failed stack before recreate");
            check_cancel(&request.name, cancel)?;
            self.with_retry("delete", || self.provider.delete_stack(&request.name))
                .await?;
            if let Some(left) = self.wait(&request.name, cancel).await? {
                return Ok(StackResult::failed(
                    Some(left.status),
                    "failed stack could not be deleted",
                ));
            }
            return self.create(request, cancel).await;
        }

        if !state.status.is_updatable() {
            return Ok(StackResult::failed(
                Some(state.status),
                format!("stack cannot be updated from {}", state.status),
            ));
        }

        let diff = diff_state(Some(&state), request);
        if !diff.has_changes() {
            debug!(stack = %request.name, "no changes");
            return Ok(StackResult::settled(StackStatus::NoChange, &state));
        }

        info!(stack = %request.name, changes = %diff.summary(), "updating stack");
        check_cancel(&request.name, cancel)?;
        self.with_retry("update", || self.provider.update_stack(request))
            .await?;
        let settled = self.wait(&request.name, cancel).await?;
        Ok(outcome(&request.name, settled, StackStatus::UpdateComplete))
    }

    /// Delete a stack and wait for it to disappear.
    pub async fn destroy(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<StackResult, ProviderError> {
        check_cancel(name, cancel)?;
        let mut current = self.describe(name).await?;
        if current.as_ref().is_some_and(|s| s.status.is_in_progress()) {
            current = self.wait(name, cancel).await?;
        }
        if current.is_none() {
            return Ok(StackResult {
                status: StackStatus::NoChange,
                remote_status: None,
                reason: Some("stack does not exist".to_string()),
                outputs: StackOutputs::new(),
            });
        }

        info!(stack = %name, "deleting stack");
        check_cancel(name, cancel)?;
        self.with_retry("delete", || self.provider.delete_stack(name))
            .await?;
        match self.wait(name, cancel).await? {
            None => Ok(StackResult {
                status: StackStatus::Destroyed,
                remote_status: Some(RemoteStatus::DeleteComplete),
                reason: None,
                outputs: StackOutputs::new(),
            }),
            Some(state) => Ok(StackResult::failed(
                Some(state.status),
                state
                    .status_reason
                    .unwrap_or_else(|| format!("delete ended in {}", state.status)),
            )),
        }
    }

    async fn create(
        &self,
        request: &StackRequest,
        cancel: &CancellationToken,
    ) -> Result<StackResult, ProviderError> {
        info!(stack = %request.name, "creating stack");
        check_cancel(&request.name, cancel)?;
        self.with_retry("create", || self.provider.create_stack(request))
            .await?;
        let settled = self.wait(&request.name, cancel).await?;
        Ok(outcome(&request.name, settled, StackStatus::CreateComplete))
    }

    /// Poll until the stack leaves its in-progress state. `None` means the
    /// stack no longer exists.
    pub async fn wait(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ProviderStackState>, ProviderError> {
        let deadline = Instant::now() + self.settings.timeout;
        loop {
            check_cancel(name, cancel)?;
            let state = self.describe(name).await?;
            match &state {
                Some(s) if s.status.is_in_progress() => {
                    debug!(stack = %name, status = %s.status, "waiting");
                }
                _ => return Ok(state),
            }
            if Instant::now() >= deadline {
                return Err(ProviderError::Timeout {
                    stack: name.to_string(),
                    timeout: self.settings.timeout,
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ProviderError::Cancelled(name.to_string()));
                }
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
    }

    /// Run a provider call, retrying throttling-class errors with backoff.
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0u32;
        loop {
            match call().await {
                Err(e) if e.is_transient() && attempt < self.settings.max_retries => {
                    let delay = self
                        .settings
                        .backoff_base
                        .saturating_mul(2u32.saturating_pow(attempt));
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "retrying provider call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

/// No new mutation is issued once the run is cancelled.
fn check_cancel(name: &str, cancel: &CancellationToken) -> Result<(), ProviderError> {
    if cancel.is_cancelled() {
        return Err(ProviderError::Cancelled(name.to_string()));
    }
    Ok(())
}

fn outcome(name: &str, settled: Option<ProviderStackState>, success: StackStatus) -> StackResult {
    match settled {
        None => StackResult::failed(None, format!("stack '{}' disappeared", name)),
        Some(state) if state.status.is_complete() => StackResult::settled(success, &state),
        Some(state) => {
            let reason = state
                .status_reason
                .clone()
                .unwrap_or_else(|| format!("operation ended in {}", state.status));
            StackResult::failed(Some(state.status), reason)
        }
    }
}

/// Diff a described state against a request.
pub fn diff_state(current: Option<&ProviderStackState>, request: &StackRequest) -> Diff {
    let new_digest = digest(&request.template_body);
    let empty = IndexMap::new();
    let (action, old_digest, old_params, old_tags) = match current {
        None => (ChangeKind::Create, None, &empty, &empty),
        Some(state) if state.status.needs_recreate() => (
            ChangeKind::Recreate,
            Some(digest(&state.template_body)),
            &empty,
            &empty,
        ),
        Some(state) => (
            ChangeKind::Update,
            Some(digest(&state.template_body)),
            &state.parameters,
            &state.tags,
        ),
    };

    let template_changed = old_digest.as_deref() != Some(new_digest.as_str());
    let parameters = diff_maps(old_params, &request.parameters);
    let tags = diff_maps(old_tags, &request.tags);
    let action = if action == ChangeKind::Update
        && !template_changed
        && parameters.is_empty()
        && tags.is_empty()
    {
        ChangeKind::NoChange
    } else {
        action
    };

    Diff {
        stack: request.name.clone(),
        action,
        template_changed,
        old_digest,
        new_digest,
        parameters,
        tags,
    }
}

fn diff_maps(
    old: &IndexMap<String, String>,
    new: &IndexMap<String, String>,
) -> Vec<ParameterChange> {
    let mut changes = Vec::new();
    for (key, value) in new {
        match old.get(key) {
            Some(prev) if prev == value => {}
            prev => changes.push(ParameterChange {
                key: key.clone(),
                old: prev.cloned(),
                new: Some(value.clone()),
            }),
        }
    }
    for (key, value) in old {
        if !new.contains_key(key) {
            changes.push(ParameterChange {
                key: key.clone(),
                old: Some(value.clone()),
                new: None,
            });
        }
    }
    changes
}
