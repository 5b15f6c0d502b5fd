//! ST-020: Provider abstraction.
//!
//! A provider creates, updates, deletes and describes named stacks. Mutations
//! are asynchronous on the provider side: a stack passes through an
//! `*_IN_PROGRESS` state before settling, which [`ProviderClient`] polls for.

pub mod client;
pub mod local;
pub mod memory;

pub use client::{ChangeKind, Diff, ParameterChange, PollSettings, ProviderClient, StackResult};
pub use local::LocalProvider;
pub use memory::{MemoryProvider, ProviderCall};

use crate::core::types::{value_to_string, Value};
use crate::error::ProviderError;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Remote stack state as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteStatus {
    CreateInProgress,
    CreateFailed,
    CreateComplete,
    RollbackInProgress,
    RollbackFailed,
    RollbackComplete,
    DeleteInProgress,
    DeleteFailed,
    DeleteComplete,
    UpdateInProgress,
    UpdateCompleteCleanupInProgress,
    UpdateComplete,
    UpdateRollbackInProgress,
    UpdateRollbackFailed,
    UpdateRollbackCompleteCleanupInProgress,
    UpdateRollbackComplete,
}

impl RemoteStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateInProgress => "CREATE_IN_PROGRESS",
            Self::CreateFailed => "CREATE_FAILED",
            Self::CreateComplete => "CREATE_COMPLETE",
            Self::RollbackInProgress => "ROLLBACK_IN_PROGRESS",
            Self::RollbackFailed => "ROLLBACK_FAILED",
            Self::RollbackComplete => "ROLLBACK_COMPLETE",
            Self::DeleteInProgress => "DELETE_IN_PROGRESS",
            Self::DeleteFailed => "DELETE_FAILED",
            Self::DeleteComplete => "DELETE_COMPLETE",
            Self::UpdateInProgress => "UPDATE_IN_PROGRESS",
            Self::UpdateCompleteCleanupInProgress => "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS",
            Self::UpdateComplete => "UPDATE_COMPLETE",
            Self::UpdateRollbackInProgress => "UPDATE_ROLLBACK_IN_PROGRESS",
            Self::UpdateRollbackFailed => "UPDATE_ROLLBACK_FAILED",
            Self::UpdateRollbackCompleteCleanupInProgress => {
                "UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS"
            }
            Self::UpdateRollbackComplete => "UPDATE_ROLLBACK_COMPLETE",
        }
    }

    /// Still moving; keep polling.
    pub fn is_in_progress(self) -> bool {
        self.as_str().ends_with("_IN_PROGRESS")
    }

    /// Settled after a failed operation.
    pub fn is_failed(self) -> bool {
        matches!(
            self,
            Self::CreateFailed
                | Self::RollbackFailed
                | Self::RollbackComplete
                | Self::DeleteFailed
                | Self::UpdateRollbackFailed
                | Self::UpdateRollbackComplete
        )
    }

    /// Settled after a successful operation.
    pub fn is_complete(self) -> bool {
        matches!(
            self,
            Self::CreateComplete | Self::UpdateComplete | Self::DeleteComplete
        )
    }

    /// Left behind by a failed create; can only be deleted.
    pub fn needs_recreate(self) -> bool {
        matches!(self, Self::RollbackComplete | Self::CreateFailed)
    }

    /// Settled states an update may start from.
    pub fn is_updatable(self) -> bool {
        matches!(
            self,
            Self::CreateComplete | Self::UpdateComplete | Self::UpdateRollbackComplete
        )
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Described state of one remote stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStackState {
    pub name: String,
    pub status: RemoteStatus,
    #[serde(default)]
    pub status_reason: Option<String>,
    #[serde(default)]
    pub template_body: String,
    #[serde(default)]
    pub parameters: IndexMap<String, String>,
    #[serde(default)]
    pub tags: IndexMap<String, String>,
    #[serde(default)]
    pub outputs: IndexMap<String, String>,
}

impl ProviderStackState {
    pub fn new(name: &str, status: RemoteStatus) -> Self {
        Self {
            name: name.to_string(),
            status,
            status_reason: None,
            template_body: String::new(),
            parameters: IndexMap::new(),
            tags: IndexMap::new(),
            outputs: IndexMap::new(),
        }
    }

    pub fn with_output(mut self, key: &str, value: &str) -> Self {
        self.outputs.insert(key.to_string(), value.to_string());
        self
    }
}

/// Desired state of one stack, fully rendered.
#[derive(Debug, Clone, PartialEq)]
pub struct StackRequest {
    /// Fully-qualified stack name
    pub name: String,
    pub template_body: String,
    pub parameters: IndexMap<String, String>,
    pub tags: IndexMap<String, String>,
}

impl StackRequest {
    pub fn new(name: &str, template_body: &str) -> Self {
        Self {
            name: name.to_string(),
            template_body: template_body.to_string(),
            parameters: IndexMap::new(),
            tags: IndexMap::new(),
        }
    }
}

/// A stack provider. Mutating calls return once the operation is accepted;
/// completion is observed through `describe_stack`.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// `None` when the stack does not exist.
    async fn describe_stack(&self, name: &str)
        -> Result<Option<ProviderStackState>, ProviderError>;

    async fn create_stack(&self, request: &StackRequest) -> Result<(), ProviderError>;

    async fn update_stack(&self, request: &StackRequest) -> Result<(), ProviderError>;

    async fn delete_stack(&self, name: &str) -> Result<(), ProviderError>;
}

/// Content digest of a template body. Returns `"blake3:{hex}"`.
pub fn digest(body: &str) -> String {
    format!("blake3:{}", blake3::hash(body.as_bytes()).to_hex())
}

/// Outputs declared by a template's top-level `outputs:` mapping.
pub fn parse_template_outputs(body: &str) -> Result<IndexMap<String, String>, ProviderError> {
    if body.trim().is_empty() {
        return Ok(IndexMap::new());
    }
    let doc: Value = serde_yaml_ng::from_str(body)
        .map_err(|e| ProviderError::Validation(format!("template is not valid YAML: {}", e)))?;
    let mut outputs = IndexMap::new();
    if let Some(Value::Object(map)) = doc.get("outputs") {
        for (key, value) in map {
            outputs.insert(key.clone(), value_to_string(value));
        }
    }
    Ok(outputs)
}
