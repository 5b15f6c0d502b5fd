//! ST-005: Error taxonomy.
//!
//! Configuration errors are fatal before any remote call. Lookup and hook errors
//! are fatal to the owning stack. Transient provider errors are retried by the
//! client; everything else surfaces as a failed stack.

use crate::core::types::LifecyclePhase;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for top-level operations.
pub type Result<T, E = StrataError> = std::result::Result<T, E>;

/// Fatal configuration problems, detected before the provider is touched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("dependency cycle detected: {}", .path.join(" -> "))]
    CyclicGraph { path: Vec<String> },

    #[error("stack '{stack}' references unknown stack '{reference}'")]
    UnknownStack { stack: String, reference: String },

    #[error("stack '{stack}' references disabled stack '{reference}'")]
    DisabledStack { stack: String, reference: String },

    #[error("duplicate stack name '{0}'")]
    DuplicateStack(String),

    #[error("stack '{stack}': {source}")]
    Lookup {
        stack: String,
        #[source]
        source: LookupError,
    },

    #[error("unknown hook '{path}' (search path: {search})")]
    UnknownHook { path: String, search: String },

    #[error("unknown lookup path '{path}' for type '{kind}'")]
    UnknownLookupPath { kind: String, path: String },

    #[error("'{0}' is already registered")]
    DuplicateRegistration(String),

    #[error("{0} validation error(s)")]
    Invalid(usize),

    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml_ng::Error),
}

/// Failure to resolve a `${type query::args}` expression.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("malformed lookup expression '{expr}': {reason}")]
    Malformed { expr: String, reason: String },

    #[error("unknown lookup type '{0}'")]
    UnknownType(String),

    #[error("{lookup} lookup: '{query}' not found")]
    NotFound { lookup: String, query: String },

    #[error("lookup nesting exceeds maximum depth of {0}")]
    DepthExceeded(usize),

    #[error("{lookup} lookup returned a non-scalar value mixed with other text")]
    NonScalarConcatenation { lookup: String },

    #[error("{lookup} lookup: invalid argument: {reason}")]
    InvalidArgument { lookup: String, reason: String },

    #[error("{lookup} lookup: {message}")]
    Failed { lookup: String, message: String },

    #[error("{lookup} lookup: {source}")]
    Provider {
        lookup: String,
        #[source]
        source: ProviderError,
    },

    #[error("variable '{variable}': {source}")]
    Variable {
        variable: String,
        #[source]
        source: Box<LookupError>,
    },
}

impl LookupError {
    pub fn not_found(lookup: &str, query: &str) -> Self {
        Self::NotFound {
            lookup: lookup.to_string(),
            query: query.to_string(),
        }
    }

    pub fn invalid(lookup: &str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            lookup: lookup.to_string(),
            reason: reason.into(),
        }
    }

    pub fn failed(lookup: &str, message: impl Into<String>) -> Self {
        Self::Failed {
            lookup: lookup.to_string(),
            message: message.into(),
        }
    }

    pub fn in_variable(variable: &str, source: LookupError) -> Self {
        Self::Variable {
            variable: variable.to_string(),
            source: Box::new(source),
        }
    }

    /// True when the handler could not find what the query names.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Provider { source, .. } => matches!(source, ProviderError::NotFound(_)),
            Self::Variable { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Errors that indicate broken configuration rather than missing data.
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::Malformed { .. } | Self::UnknownType(_) | Self::DepthExceeded(_) => true,
            Self::Variable { source, .. } => source.is_configuration(),
            _ => false,
        }
    }
}

/// Hook construction or execution failure.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("hook '{path}' failed: {message}")]
    Failed { path: String, message: String },

    #[error("hook '{path}' does not support the {phase} phase")]
    Unsupported { path: String, phase: LifecyclePhase },

    #[error("unknown hook '{path}'")]
    Unknown { path: String },

    #[error("hook '{path}' returned a falsy result")]
    Falsy { path: String },

    #[error("hook '{path}' arguments: {source}")]
    Lookup {
        path: String,
        #[source]
        source: LookupError,
    },
}

impl HookError {
    pub fn failed(path: &str, message: impl Into<String>) -> Self {
        Self::Failed {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

/// Errors raised by a provider or the polling client around it.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("throttled: {0}")]
    Throttled(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("stack '{0}' does not exist")]
    NotFound(String),

    #[error("stack '{stack}' did not settle within {timeout:?}")]
    Timeout { stack: String, timeout: Duration },

    #[error("cancelled while waiting on stack '{0}'")]
    Cancelled(String),

    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state serialization error: {0}")]
    Serialization(String),
}

impl ProviderError {
    /// Throttling-class and transient network errors are retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Throttled(_) | Self::Transient(_))
    }
}

/// Template loading and rendering errors.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("stack '{0}' has no template_body or template_path")]
    Missing(String),

    #[error("cannot read template {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unclosed template placeholder at position {0}")]
    Unclosed(usize),

    #[error("unknown template variable: {0}")]
    UnknownVariable(String),
}

/// Umbrella error for the CLI and the run entry points.
#[derive(Debug, Error)]
pub enum StrataError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("run cancelled")]
    Cancelled,
}
