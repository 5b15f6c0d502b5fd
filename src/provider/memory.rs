//! ST-023: In-process provider.
//!
//! Simulates asynchronous settling: a mutated stack stays `*_IN_PROGRESS` for
//! a configurable number of describe calls. Supports failure and throttling
//! injection and records every mutating call.

use super::{parse_template_outputs, Provider, ProviderStackState, RemoteStatus, StackRequest};
use crate::error::ProviderError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A mutating call observed by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    Create(String),
    Update(String),
    Delete(String),
}

#[derive(Debug)]
struct Entry {
    state: ProviderStackState,
    pending: u32,
    target: RemoteStatus,
    remove_on_settle: bool,
}

#[derive(Debug, Default)]
struct Inner {
    stacks: HashMap<String, Entry>,
    calls: Vec<ProviderCall>,
    throttle: u32,
    peak_in_progress: usize,
}

impl Inner {
    fn check_throttle(&mut self) -> Result<(), ProviderError> {
        if self.throttle > 0 {
            self.throttle -= 1;
            return Err(ProviderError::Throttled("rate exceeded".to_string()));
        }
        Ok(())
    }

    fn track_in_progress(&mut self) {
        let n = self
            .stacks
            .values()
            .filter(|e| e.state.status.is_in_progress())
            .count();
        self.peak_in_progress = self.peak_in_progress.max(n);
    }
}

#[derive(Debug)]
pub struct MemoryProvider {
    inner: Mutex<Inner>,
    settle_polls: u32,
    failing: HashSet<String>,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self {
            inner: Mutex::default(),
            settle_polls: 1,
            failing: HashSet::new(),
        }
    }

    /// Number of describe calls before a mutation settles.
    pub fn with_settle_polls(mut self, polls: u32) -> Self {
        self.settle_polls = polls;
        self
    }

    /// Mutations of this stack settle in a failed state.
    pub fn fail_on(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    /// The next `n` calls of any kind are throttled.
    pub fn throttle_next(mut self, n: u32) -> Self {
        self.inner
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .throttle = n;
        self
    }

    /// Insert a settled stack.
    pub fn seed(&self, state: ProviderStackState) {
        let target = state.status;
        self.lock().stacks.insert(
            state.name.clone(),
            Entry {
                state,
                pending: 0,
                target,
                remove_on_settle: false,
            },
        );
    }

    /// Current state without advancing the simulation.
    pub fn stack(&self, name: &str) -> Option<ProviderStackState> {
        self.lock().stacks.get(name).map(|e| e.state.clone())
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    /// Most stacks ever in progress at the same time.
    pub fn peak_in_progress(&self) -> usize {
        self.lock().peak_in_progress
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn describe_stack(
        &self,
        name: &str,
    ) -> Result<Option<ProviderStackState>, ProviderError> {
        let mut inner = self.lock();
        inner.check_throttle()?;
        let Some(entry) = inner.stacks.get_mut(name) else {
            return Ok(None);
        };
        entry.pending = entry.pending.saturating_sub(1);
        if entry.pending == 0 && entry.state.status.is_in_progress() {
            if entry.remove_on_settle {
                inner.stacks.remove(name);
                return Ok(None);
            }
            entry.state.status = entry.target;
        }
        Ok(Some(entry.state.clone()))
    }

    async fn create_stack(&self, request: &StackRequest) -> Result<(), ProviderError> {
        let outputs = parse_template_outputs(&request.template_body)?;
        let failing = self.failing.contains(&request.name);
        let mut inner = self.lock();
        inner.check_throttle()?;
        if inner.stacks.contains_key(&request.name) {
            return Err(ProviderError::Validation(format!(
                "stack '{}' already exists",
                request.name
            )));
        }
        inner.calls.push(ProviderCall::Create(request.name.clone()));

        let mut state = ProviderStackState::new(&request.name, RemoteStatus::CreateInProgress);
        state.template_body = request.template_body.clone();
        state.parameters = request.parameters.clone();
        state.tags = request.tags.clone();
        let target = if failing {
            state.status_reason = Some("injected failure".to_string());
            RemoteStatus::RollbackComplete
        } else {
            state.outputs = outputs;
            RemoteStatus::CreateComplete
        };
        inner.stacks.insert(
            request.name.clone(),
            Entry {
                state,
                pending: self.settle_polls,
                target,
                remove_on_settle: false,
            },
        );
        inner.track_in_progress();
        Ok(())
    }

    async fn update_stack(&self, request: &StackRequest) -> Result<(), ProviderError> {
        let outputs = parse_template_outputs(&request.template_body)?;
        let failing = self.failing.contains(&request.name);
        let settle_polls = self.settle_polls;
        let mut inner = self.lock();
        inner.check_throttle()?;
        let entry = inner
            .stacks
            .get_mut(&request.name)
            .ok_or_else(|| ProviderError::NotFound(request.name.clone()))?;

        entry.state.status = RemoteStatus::UpdateInProgress;
        entry.pending = settle_polls;
        entry.remove_on_settle = false;
        if failing {
            entry.state.status_reason = Some("injected failure".to_string());
            entry.target = RemoteStatus::UpdateRollbackComplete;
        } else {
            entry.state.status_reason = None;
            entry.state.template_body = request.template_body.clone();
            entry.state.parameters = request.parameters.clone();
            entry.state.tags = request.tags.clone();
            entry.state.outputs = outputs;
            entry.target = RemoteStatus::UpdateComplete;
        }
        inner.calls.push(ProviderCall::Update(request.name.clone()));
        inner.track_in_progress();
        Ok(())
    }

    async fn delete_stack(&self, name: &str) -> Result<(), ProviderError> {
        let failing = self.failing.contains(name);
        let settle_polls = self.settle_polls;
        let mut inner = self.lock();
        inner.check_throttle()?;
        inner.calls.push(ProviderCall::Delete(name.to_string()));
        if let Some(entry) = inner.stacks.get_mut(name) {
            entry.state.status = RemoteStatus::DeleteInProgress;
            entry.pending = settle_polls;
            if failing {
                entry.state.status_reason = Some("injected failure".to_string());
                entry.target = RemoteStatus::DeleteFailed;
                entry.remove_on_settle = false;
            } else {
                entry.target = RemoteStatus::DeleteComplete;
                entry.remove_on_settle = true;
            }
        }
        inner.track_in_progress();
        Ok(())
    }
}
