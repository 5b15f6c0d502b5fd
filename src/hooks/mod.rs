//! ST-030: Lifecycle hooks.
//!
//! Hooks run in declaration order at named points of a deploy or destroy.
//! Each invocation constructs a fresh hook from its registered factory with
//! resolved arguments. A result is judged by truthiness: `null`, `false`, `0`,
//! empty strings and empty sequences are failures, mappings always succeed.
//! Results of hooks that declare a `data_key` are published as Hook Data.

pub mod builtin;

use crate::core::context::RunContext;
use crate::core::plugin::PluginTable;
use crate::core::types::{parse_bool, HookDecl, LifecyclePhase, Value};
use crate::error::{ConfigError, HookError, LookupError};
use crate::lookups::{LookupScope, Resolver};
use crate::provider::ProviderClient;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Path prefix builtin hooks are registered under.
pub const BUILTIN_PREFIX: &str = "strata.hooks";

/// What a running hook can see.
pub struct HookContext<'a> {
    pub ctx: &'a RunContext,
    /// Configured hook path
    pub path: &'a str,
    pub phase: LifecyclePhase,
    /// Owning stack for per-stack hooks
    pub stack: Option<&'a str>,
}

/// A lifecycle hook. Phases a hook does not implement report unsupported.
#[async_trait]
pub trait Hook: Send + Sync {
    async fn pre_deploy(&self, cx: &HookContext<'_>) -> Result<Value, HookError> {
        Err(unsupported(cx))
    }

    async fn post_deploy(&self, cx: &HookContext<'_>) -> Result<Value, HookError> {
        Err(unsupported(cx))
    }

    async fn pre_destroy(&self, cx: &HookContext<'_>) -> Result<Value, HookError> {
        Err(unsupported(cx))
    }

    async fn post_destroy(&self, cx: &HookContext<'_>) -> Result<Value, HookError> {
        Err(unsupported(cx))
    }
}

fn unsupported(cx: &HookContext<'_>) -> HookError {
    HookError::Unsupported {
        path: cx.path.to_string(),
        phase: cx.phase,
    }
}

/// Dispatch to the method for the context's phase.
pub async fn invoke(hook: &dyn Hook, cx: &HookContext<'_>) -> Result<Value, HookError> {
    match cx.phase {
        LifecyclePhase::PreDeploy => hook.pre_deploy(cx).await,
        LifecyclePhase::PostDeploy => hook.post_deploy(cx).await,
        LifecyclePhase::PreDestroy => hook.pre_destroy(cx).await,
        LifecyclePhase::PostDestroy => hook.post_destroy(cx).await,
    }
}

/// Builds a hook from its resolved arguments.
pub type HookFactory =
    Arc<dyn Fn(&IndexMap<String, Value>) -> Result<Box<dyn Hook>, HookError> + Send + Sync>;

/// Hook path -> factory table with a configured search path.
#[derive(Clone)]
pub struct HookRegistry {
    factories: PluginTable<HookFactory>,
    search_path: Vec<String>,
}

impl HookRegistry {
    /// Empty registry; the builtin prefix is always searched last.
    pub fn new(search_path: &[String]) -> Self {
        let mut search_path = search_path.to_vec();
        search_path.push(BUILTIN_PREFIX.to_string());
        Self {
            factories: PluginTable::new(),
            search_path,
        }
    }

    pub fn with_builtins(search_path: &[String]) -> Self {
        let mut registry = Self::new(search_path);
        registry.factories = builtin::builtins()
            .into_iter()
            .map(|(name, factory)| (format!("{}.{}", BUILTIN_PREFIX, name), factory))
            .collect();
        registry
    }

    pub fn register(&mut self, path: &str, factory: HookFactory) -> Result<(), ConfigError> {
        self.factories.insert(path, factory)
    }

    pub fn resolve(&self, path: &str) -> Option<HookFactory> {
        self.factories.resolve(path, &self.search_path)
    }

    /// Every declared hook path must resolve before the run starts.
    pub fn validate<'a>(
        &self,
        decls: impl IntoIterator<Item = &'a HookDecl>,
    ) -> Result<(), ConfigError> {
        for decl in decls {
            if self.resolve(&decl.path).is_none() {
                return Err(ConfigError::UnknownHook {
                    path: decl.path.clone(),
                    search: self.search_path.join(", "),
                });
            }
        }
        Ok(())
    }

    pub fn construct(
        &self,
        path: &str,
        args: &IndexMap<String, Value>,
    ) -> Result<Box<dyn Hook>, HookError> {
        let factory = self.resolve(path).ok_or_else(|| HookError::Unknown {
            path: path.to_string(),
        })?;
        factory(args)
    }
}

/// Truthiness of a hook result.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookStatus {
    Succeeded,
    Failed(String),
    /// `enabled` resolved to false
    Disabled,
}

impl fmt::Display for HookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "ok"),
            Self::Failed(e) => write!(f, "failed: {}", e),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// Outcome of one hook invocation.
#[derive(Debug, Clone)]
pub struct HookReport {
    pub path: String,
    pub phase: LifecyclePhase,
    pub stack: Option<String>,
    pub required: bool,
    pub status: HookStatus,
}

impl HookReport {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, HookStatus::Failed(_))
    }
}

/// Result of running one phase's hook list.
#[derive(Debug, Clone, Default)]
pub struct PipelineResult {
    pub reports: Vec<HookReport>,
}

impl PipelineResult {
    /// The required hook that aborted the phase.
    pub fn failure(&self) -> Option<&HookReport> {
        self.reports.iter().find(|r| r.required && r.is_failed())
    }

    pub fn is_aborted(&self) -> bool {
        self.failure().is_some()
    }
}

/// Runs hook lists against a registry and resolver.
#[derive(Clone)]
pub struct HookPipeline {
    registry: Arc<HookRegistry>,
    resolver: Resolver,
}

impl HookPipeline {
    pub fn new(registry: Arc<HookRegistry>, resolver: Resolver) -> Self {
        Self { registry, resolver }
    }

    pub fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    /// Run hooks in order. A failing required hook stops the list; a failing
    /// optional hook is logged and the list continues.
    pub async fn run(
        &self,
        phase: LifecyclePhase,
        decls: &[HookDecl],
        ctx: &RunContext,
        stack: Option<&str>,
        provider: Option<&ProviderClient>,
    ) -> PipelineResult {
        let mut result = PipelineResult::default();
        for decl in decls {
            let status = match self.run_one(phase, decl, ctx, stack, provider).await {
                Ok(true) => HookStatus::Succeeded,
                Ok(false) => {
                    debug!(hook = %decl.path, %phase, "hook disabled");
                    HookStatus::Disabled
                }
                Err(e) => HookStatus::Failed(e.to_string()),
            };
            let failed = matches!(status, HookStatus::Failed(_));
            if let HookStatus::Failed(ref message) = status {
                if decl.required {
                    error!(hook = %decl.path, %phase, stack = stack.unwrap_or("-"), error = %message, "required hook failed");
                } else {
                    warn!(hook = %decl.path, %phase, stack = stack.unwrap_or("-"), error = %message, "optional hook failed, continuing");
                }
            }
            result.reports.push(HookReport {
                path: decl.path.clone(),
                phase,
                stack: stack.map(str::to_string),
                required: decl.required,
                status,
            });
            if failed && decl.required {
                break;
            }
        }
        result
    }

    /// Returns false when the hook is disabled.
    async fn run_one(
        &self,
        phase: LifecyclePhase,
        decl: &HookDecl,
        ctx: &RunContext,
        stack: Option<&str>,
        provider: Option<&ProviderClient>,
    ) -> Result<bool, HookError> {
        let mut scope = LookupScope::execute(ctx);
        scope.stack = stack;
        scope.provider = provider;

        let lookup_err = |source: LookupError| HookError::Lookup {
            path: decl.path.clone(),
            source,
        };
        let enabled = self
            .resolver
            .resolve_value(&decl.enabled, &scope)
            .await
            .map_err(lookup_err)?;
        if !enabled_flag(&decl.path, &enabled)? {
            return Ok(false);
        }

        let args = self
            .resolver
            .resolve_variables(&decl.args, &scope)
            .await
            .map_err(lookup_err)?;
        let hook = self.registry.construct(&decl.path, &args)?;

        let cx = HookContext {
            ctx,
            path: &decl.path,
            phase,
            stack,
        };
        info!(hook = %decl.path, %phase, stack = stack.unwrap_or("-"), "running hook");
        let value = invoke(hook.as_ref(), &cx).await?;
        if !is_truthy(&value) {
            return Err(HookError::Falsy {
                path: decl.path.clone(),
            });
        }
        if let Some(key) = &decl.data_key {
            if value.is_object() {
                ctx.set_hook_data(key, value);
            } else {
                debug!(hook = %decl.path, key = %key, "result is not a mapping, hook data unchanged");
            }
        }
        Ok(true)
    }
}

fn enabled_flag(path: &str, value: &Value) -> Result<bool, HookError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        Value::String(s) => parse_bool(s)
            .ok_or_else(|| HookError::failed(path, format!("enabled: '{}' is not a boolean", s))),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
        _ => Err(HookError::failed(path, "enabled must be a boolean")),
    }
}
