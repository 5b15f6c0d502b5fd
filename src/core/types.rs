//! ST-001: Configuration, status, plan, and event types.
//!
//! Defines the YAML schema for stacks and hooks, the per-stack status model,
//! plan actions, and provenance events. Config types derive
//! Serialize/Deserialize for YAML roundtripping.

use crate::provider::RemoteStatus;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Structured value used for variables, lookup results, and hook data.
pub type Value = serde_json::Value;

// ============================================================================
// Top-level strata.yaml
// ============================================================================

/// Root configuration: the declared stacks and lifecycle hooks of one deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrataConfig {
    /// Prefix applied to every stack name before any remote call
    #[serde(default)]
    pub namespace: String,

    /// Deploy environment name (dev, prod, ...)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Target region
    #[serde(default)]
    pub region: String,

    /// Prefixes tried when resolving hook and lookup paths
    #[serde(default)]
    pub search_path: Vec<String>,

    /// Custom lookup type name -> registered implementation path
    #[serde(default)]
    pub lookups: IndexMap<String, String>,

    /// Values served by the `var` lookup
    #[serde(default)]
    pub variables: IndexMap<String, Value>,

    /// Engine settings
    #[serde(default)]
    pub settings: Settings,

    #[serde(default)]
    pub pre_deploy: Vec<HookDecl>,

    #[serde(default)]
    pub post_deploy: Vec<HookDecl>,

    #[serde(default)]
    pub pre_destroy: Vec<HookDecl>,

    #[serde(default)]
    pub post_destroy: Vec<HookDecl>,

    /// Stack declarations (order-preserving)
    #[serde(default)]
    pub stacks: Vec<StackDef>,

    /// Directory template paths are relative to (set by the loader)
    #[serde(skip)]
    pub base_dir: PathBuf,
}

fn default_environment() -> String {
    "default".to_string()
}

impl StrataConfig {
    /// Run-level hook declarations for a phase.
    pub fn hooks(&self, phase: LifecyclePhase) -> &[HookDecl] {
        match phase {
            LifecyclePhase::PreDeploy => &self.pre_deploy,
            LifecyclePhase::PostDeploy => &self.post_deploy,
            LifecyclePhase::PreDestroy => &self.pre_destroy,
            LifecyclePhase::PostDestroy => &self.post_destroy,
        }
    }

    /// Look up a declared stack by its short name.
    pub fn stack(&self, name: &str) -> Option<&StackDef> {
        self.stacks.iter().find(|s| s.name == name)
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Maximum number of stacks operated on at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Interval between describe polls while a stack settles
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Per-poll-loop timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retry budget for throttling-class provider errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay; doubles per attempt
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Maximum nesting depth of lookup expressions
    #[serde(default = "default_max_lookup_depth")]
    pub max_lookup_depth: usize,

    /// Delete and recreate stacks left behind by a failed create
    #[serde(default)]
    pub recreate_failed: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            max_lookup_depth: default_max_lookup_depth(),
            recreate_failed: false,
        }
    }
}

impl Settings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_timeout_secs() -> u64 {
    3600
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    250
}

fn default_max_lookup_depth() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_enabled() -> Value {
    Value::Bool(true)
}

// ============================================================================
// Stacks
// ============================================================================

/// A named, independently deployable unit of infrastructure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackDef {
    /// Short name, unique within the config (namespace is prefixed at run time)
    pub name: String,

    /// Template file, relative to the config directory
    #[serde(default)]
    pub template_path: Option<PathBuf>,

    /// Inline template
    #[serde(default)]
    pub template_body: Option<String>,

    /// Input variables; strings may embed lookups
    #[serde(default)]
    pub variables: IndexMap<String, Value>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Never updated; still created when missing and usable as a dependency
    #[serde(default)]
    pub locked: bool,

    /// Stacks that must complete before this one
    #[serde(default)]
    pub requires: Vec<String>,

    /// Stacks that must wait for this one
    #[serde(default)]
    pub required_by: Vec<String>,

    #[serde(default)]
    pub tags: IndexMap<String, String>,

    /// Hooks scoped to this stack, run by the worker around the provider call
    #[serde(default)]
    pub hooks: StackHooks,
}

impl StackDef {
    /// Minimal enabled stack with an inline template.
    pub fn new(name: &str, template_body: &str) -> Self {
        Self {
            name: name.to_string(),
            template_path: None,
            template_body: Some(template_body.to_string()),
            variables: IndexMap::new(),
            enabled: true,
            locked: false,
            requires: vec![],
            required_by: vec![],
            tags: IndexMap::new(),
            hooks: StackHooks::default(),
        }
    }
}

/// Per-stack hook declarations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StackHooks {
    #[serde(default)]
    pub pre_deploy: Vec<HookDecl>,
    #[serde(default)]
    pub post_deploy: Vec<HookDecl>,
    #[serde(default)]
    pub pre_destroy: Vec<HookDecl>,
    #[serde(default)]
    pub post_destroy: Vec<HookDecl>,
}

impl StackHooks {
    pub fn for_phase(&self, phase: LifecyclePhase) -> &[HookDecl] {
        match phase {
            LifecyclePhase::PreDeploy => &self.pre_deploy,
            LifecyclePhase::PostDeploy => &self.post_deploy,
            LifecyclePhase::PreDestroy => &self.pre_destroy,
            LifecyclePhase::PostDestroy => &self.post_destroy,
        }
    }

    pub fn all(&self) -> impl Iterator<Item = &HookDecl> {
        self.pre_deploy
            .iter()
            .chain(&self.post_deploy)
            .chain(&self.pre_destroy)
            .chain(&self.post_destroy)
    }
}

// ============================================================================
// Hooks
// ============================================================================

/// An ordered hook entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookDecl {
    /// Registered hook path, resolved against the search path
    pub path: String,

    /// Arguments passed to the hook constructor; lookup-resolvable
    #[serde(default)]
    pub args: IndexMap<String, Value>,

    /// Hook Data key the hook's mapping result is stored under
    #[serde(default)]
    pub data_key: Option<String>,

    /// Failure aborts the phase when set
    #[serde(default = "default_true")]
    pub required: bool,

    /// Boolean or a lookup resolving to one
    #[serde(default = "default_enabled")]
    pub enabled: Value,
}

impl HookDecl {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            args: IndexMap::new(),
            data_key: None,
            required: true,
            enabled: default_enabled(),
        }
    }
}

/// Named points in the deploy/destroy lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    PreDeploy,
    PostDeploy,
    PreDestroy,
    PostDestroy,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreDeploy => write!(f, "pre_deploy"),
            Self::PostDeploy => write!(f, "post_deploy"),
            Self::PreDestroy => write!(f, "pre_destroy"),
            Self::PostDestroy => write!(f, "post_destroy"),
        }
    }
}

// ============================================================================
// Run action and stack status
// ============================================================================

/// What a run does to the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunAction {
    Deploy,
    Destroy,
}

impl RunAction {
    pub fn pre_phase(self) -> LifecyclePhase {
        match self {
            Self::Deploy => LifecyclePhase::PreDeploy,
            Self::Destroy => LifecyclePhase::PreDestroy,
        }
    }

    pub fn post_phase(self) -> LifecyclePhase {
        match self {
            Self::Deploy => LifecyclePhase::PostDeploy,
            Self::Destroy => LifecyclePhase::PostDestroy,
        }
    }
}

impl fmt::Display for RunAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deploy => write!(f, "deploy"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

/// Terminal status of a stack after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StackStatus {
    CreateComplete,
    UpdateComplete,
    NoChange,
    Failed,
    Skipped,
    Destroyed,
}

impl StackStatus {
    /// Settled states that let dependents proceed.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Self::CreateComplete | Self::UpdateComplete | Self::NoChange | Self::Destroyed
        )
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateComplete => write!(f, "CREATE_COMPLETE"),
            Self::UpdateComplete => write!(f, "UPDATE_COMPLETE"),
            Self::NoChange => write!(f, "NO_CHANGE"),
            Self::Failed => write!(f, "FAILED"),
            Self::Skipped => write!(f, "SKIPPED"),
            Self::Destroyed => write!(f, "DESTROYED"),
        }
    }
}

/// Why a stack was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// Declared with `enabled: false`, an intentional no-op.
    Disabled,
    /// A dependency ended FAILED or SKIPPED.
    DependencyFailed(String),
    /// A required run-level hook aborted the phase.
    HookAborted(String),
    /// The run was cancelled before the stack started.
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::DependencyFailed(dep) => write!(f, "dependency '{}' did not complete", dep),
            Self::HookAborted(hook) => write!(f, "aborted by hook '{}'", hook),
            Self::Cancelled => write!(f, "cancelled before start"),
        }
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Action a deploy or destroy would take on a stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanAction {
    Create,
    Update,
    Destroy,
    NoOp,
    Locked,
    Unresolved(String),
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Destroy => write!(f, "DESTROY"),
            Self::NoOp => write!(f, "NO-OP"),
            Self::Locked => write!(f, "LOCKED"),
            Self::Unresolved(_) => write!(f, "UNRESOLVED"),
        }
    }
}

/// A single planned change.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    /// Short stack name
    pub stack: String,

    /// Namespaced stack name
    pub fqn: String,

    pub action: PlanAction,

    /// Human-readable description
    pub description: String,
}

/// Full execution plan.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub action: RunAction,

    /// Changes in execution order
    pub changes: Vec<PlannedChange>,

    /// Summary counts
    pub to_create: u32,
    pub to_update: u32,
    pub to_destroy: u32,
    pub unchanged: u32,
    pub unresolved: u32,
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    RunStarted {
        action: RunAction,
        namespace: String,
        strata_version: String,
    },
    StackStarted {
        stack: String,
        action: RunAction,
    },
    StackFinished {
        stack: String,
        status: StackStatus,
        remote_status: Option<RemoteStatus>,
        duration_seconds: f64,
    },
    StackFailed {
        stack: String,
        error: String,
        cancelled: bool,
    },
    StackSkipped {
        stack: String,
        reason: SkipReason,
    },
    HookFailed {
        hook: String,
        phase: LifecyclePhase,
        stack: Option<String>,
        error: String,
    },
    RunCompleted {
        succeeded: u32,
        failed: u32,
        skipped: u32,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    pub run_id: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

// ============================================================================
// Value helpers
// ============================================================================

/// True for strings, numbers, booleans, and null.
pub fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

/// Render a value as text: scalars verbatim, structures as compact JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Parse a boolean from the fixed truthy/falsy vocabulary.
pub fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "t" | "true" | "on" | "1" => Some(true),
        "n" | "no" | "f" | "false" | "off" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_st001_config_parse() {
        let yaml = r#"
namespace: acme
environment: dev
region: us-east-1
variables:
  VpcCidr: 10.0.0.0/16
settings:
  concurrency: 2
pre_deploy:
  - path: command
    args:
      command: "echo hi"
    data_key: greet
stacks:
  - name: vpc
    template_body: "outputs: {}"
    variables:
      Cidr: "${var VpcCidr}"
  - name: app
    template_path: templates/app.yaml
    requires: [vpc]
    locked: true
    tags:
      team: core
"#;
        let config: StrataConfig = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.namespace, "acme");
        assert_eq!(config.environment, "dev");
        assert_eq!(config.settings.concurrency, 2);
        assert_eq!(config.settings.max_retries, 5);
        assert_eq!(config.stacks.len(), 2);
        assert_eq!(config.stacks[1].requires, vec!["vpc"]);
        assert!(config.stacks[1].locked);
        assert!(config.stacks[0].enabled);
        assert_eq!(config.pre_deploy[0].data_key.as_deref(), Some("greet"));
        assert!(config.pre_deploy[0].required);
        assert_eq!(config.pre_deploy[0].enabled, Value::Bool(true));
        assert_eq!(config.stack("app").unwrap().tags["team"], "core");
    }

    #[test]
    fn test_st001_settings_defaults() {
        let s = Settings::default();
        assert_eq!(s.concurrency, 4);
        assert_eq!(s.poll_interval(), Duration::from_secs(2));
        assert_eq!(s.timeout(), Duration::from_secs(3600));
        assert_eq!(s.backoff_base(), Duration::from_millis(250));
        assert_eq!(s.max_lookup_depth, 10);
        assert!(!s.recreate_failed);
    }

    #[test]
    fn test_st001_environment_default() {
        let config: StrataConfig = serde_yaml_ng::from_str("stacks: []").unwrap();
        assert_eq!(config.environment, "default");
        assert!(config.namespace.is_empty());
    }

    #[test]
    fn test_st001_hooks_for_phase() {
        let mut config = StrataConfig::default();
        config.post_destroy.push(HookDecl::new("data"));
        assert!(config.hooks(LifecyclePhase::PreDeploy).is_empty());
        assert_eq!(config.hooks(LifecyclePhase::PostDestroy).len(), 1);
        assert_eq!(RunAction::Destroy.pre_phase(), LifecyclePhase::PreDestroy);
        assert_eq!(RunAction::Deploy.post_phase(), LifecyclePhase::PostDeploy);
    }

    #[test]
    fn test_st001_status_display() {
        assert_eq!(StackStatus::CreateComplete.to_string(), "CREATE_COMPLETE");
        assert_eq!(StackStatus::NoChange.to_string(), "NO_CHANGE");
        assert_eq!(StackStatus::Skipped.to_string(), "SKIPPED");
        assert!(StackStatus::Destroyed.is_success());
        assert!(!StackStatus::Skipped.is_success());
        assert!(!StackStatus::Failed.is_success());
    }

    #[test]
    fn test_st001_plan_action_display() {
        assert_eq!(PlanAction::Create.to_string(), "CREATE");
        assert_eq!(PlanAction::NoOp.to_string(), "NO-OP");
        assert_eq!(PlanAction::Unresolved("x".into()).to_string(), "UNRESOLVED");
    }

    #[test]
    fn test_st001_phase_display() {
        assert_eq!(LifecyclePhase::PreDeploy.to_string(), "pre_deploy");
        assert_eq!(LifecyclePhase::PostDestroy.to_string(), "post_destroy");
    }

    #[test]
    fn test_st001_provenance_event_serde() {
        let event = ProvenanceEvent::StackSkipped {
            stack: "app".to_string(),
            reason: SkipReason::DependencyFailed("vpc".to_string()),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"stack_skipped\""));
        assert!(json.contains("dependency_failed"));
    }

    #[test]
    fn test_st001_value_to_string() {
        assert_eq!(value_to_string(&Value::String("hello".into())), "hello");
        assert_eq!(value_to_string(&Value::Bool(true)), "true");
        assert_eq!(value_to_string(&Value::Null), "");
        assert_eq!(value_to_string(&serde_json::json!([1, 2])), "[1,2]");
        assert!(is_scalar(&serde_json::json!(3)));
        assert!(!is_scalar(&serde_json::json!({"a": 1})));
    }

    #[test]
    fn test_st001_parse_bool_vocabulary() {
        for t in ["y", "Yes", "TRUE", "on", "1", "t"] {
            assert_eq!(parse_bool(t), Some(true), "{t}");
        }
        for f in ["n", "No", "false", "OFF", "0", "f"] {
            assert_eq!(parse_bool(f), Some(false), "{f}");
        }
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_bool(""), None);
    }
}
