//! ST-022: File-backed provider.
//!
//! Each stack is a YAML document at `<state_dir>/stacks/<name>.yaml`, written
//! atomically (temp file + rename). Operations settle immediately.

use super::{parse_template_outputs, Provider, ProviderStackState, RemoteStatus, StackRequest};
use crate::error::ProviderError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct LocalProvider {
    state_dir: PathBuf,
}

impl LocalProvider {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// State file path for a stack.
    pub fn stack_path(&self, name: &str) -> PathBuf {
        self.state_dir.join("stacks").join(format!("{}.yaml", name))
    }

    /// Load a stack's state. Returns None if the file doesn't exist.
    pub fn load(&self, name: &str) -> Result<Option<ProviderStackState>, ProviderError> {
        let path = self.stack_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let state = serde_yaml_ng::from_str(&content).map_err(|e| {
            ProviderError::Serialization(format!("invalid state file {}: {}", path.display(), e))
        })?;
        Ok(Some(state))
    }

    /// Save a stack's state atomically (write to temp, then rename).
    pub fn save(&self, state: &ProviderStackState) -> Result<(), ProviderError> {
        let path = self.stack_path(&state.name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml_ng::to_string(state)
            .map_err(|e| ProviderError::Serialization(e.to_string()))?;

        let tmp_path = path.with_extension("yaml.tmp");
        std::fs::write(&tmp_path, &yaml)?;
        std::fs::rename(&tmp_path, &path)?;
        debug!(path = %path.display(), status = %state.status, "saved stack state");
        Ok(())
    }

    fn settled(request: &StackRequest, status: RemoteStatus) -> Result<ProviderStackState, ProviderError> {
        let mut state = ProviderStackState::new(&request.name, status);
        state.outputs = parse_template_outputs(&request.template_body)?;
        state.template_body = request.template_body.clone();
        state.parameters = request.parameters.clone();
        state.tags = request.tags.clone();
        Ok(state)
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn describe_stack(
        &self,
        name: &str,
    ) -> Result<Option<ProviderStackState>, ProviderError> {
        self.load(name)
    }

    async fn create_stack(&self, request: &StackRequest) -> Result<(), ProviderError> {
        if self.load(&request.name)?.is_some() {
            return Err(ProviderError::Validation(format!(
                "stack '{}' already exists",
                request.name
            )));
        }
        self.save(&Self::settled(request, RemoteStatus::CreateComplete)?)
    }

    async fn update_stack(&self, request: &StackRequest) -> Result<(), ProviderError> {
        if self.load(&request.name)?.is_none() {
            return Err(ProviderError::NotFound(request.name.clone()));
        }
        self.save(&Self::settled(request, RemoteStatus::UpdateComplete)?)
    }

    async fn delete_stack(&self, name: &str) -> Result<(), ProviderError> {
        let path = self.stack_path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
