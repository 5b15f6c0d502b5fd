//! ST-006: Run context shared by resolution, hooks and the executor.
//!
//! Passed explicitly through graph building, lookup resolution, hooks and the
//! executor. Hook Data and the output cache are shared across workers behind a
//! single lock; no guard is ever held across an await point.

use super::types::{StrataConfig, Value};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Outputs of a single stack, keyed by output name.
pub type StackOutputs = IndexMap<String, String>;

#[derive(Debug, Default)]
struct SharedState {
    hook_data: IndexMap<String, Value>,
    outputs: HashMap<String, StackOutputs>,
}

/// The bundle of run-scoped data passed through resolution and execution.
#[derive(Debug, Default)]
pub struct RunContext {
    namespace: String,
    environment: String,
    region: String,
    env: HashMap<String, String>,
    variables: IndexMap<String, Value>,
    base_dir: PathBuf,
    shared: RwLock<SharedState>,
}

impl RunContext {
    pub fn new(namespace: &str, environment: &str, region: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            environment: environment.to_string(),
            region: region.to_string(),
            ..Self::default()
        }
    }

    /// Context for a config, with the process environment as the `env` mapping.
    pub fn from_config(config: &StrataConfig) -> Self {
        Self::new(&config.namespace, &config.environment, &config.region)
            .with_env(std::env::vars().collect())
            .with_variables(config.variables.clone())
            .with_base_dir(&config.base_dir)
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_variables(mut self, variables: IndexMap<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    /// Directory relative file paths are read from.
    pub fn with_base_dir(mut self, base_dir: &Path) -> Self {
        self.base_dir = base_dir.to_path_buf();
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    pub fn variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    /// Fully-qualified stack name: `{namespace}-{name}`, or the bare name.
    pub fn fqn(&self, name: &str) -> String {
        if self.namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}-{}", self.namespace, name)
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SharedState> {
        self.shared.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SharedState> {
        self.shared.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn hook_data(&self, key: &str) -> Option<Value> {
        self.read().hook_data.get(key).cloned()
    }

    pub fn has_hook_data(&self, key: &str) -> bool {
        self.read().hook_data.contains_key(key)
    }

    /// Store a hook result; last write wins, nested structures are not merged.
    pub fn set_hook_data(&self, key: &str, value: Value) {
        self.write().hook_data.insert(key.to_string(), value);
    }

    pub fn hook_data_snapshot(&self) -> IndexMap<String, Value> {
        self.read().hook_data.clone()
    }

    /// Cached outputs for a fully-qualified stack name.
    pub fn outputs(&self, fqn: &str) -> Option<StackOutputs> {
        self.read().outputs.get(fqn).cloned()
    }

    pub fn record_outputs(&self, fqn: &str, outputs: StackOutputs) {
        self.write().outputs.insert(fqn.to_string(), outputs);
    }

    pub fn forget_outputs(&self, fqn: &str) {
        self.write().outputs.remove(fqn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_st006_fqn_with_namespace() {
        let ctx = RunContext::new("acme", "dev", "us-east-1");
        assert_eq!(ctx.fqn("vpc"), "acme-vpc");
        assert_eq!(ctx.environment(), "dev");
        assert_eq!(ctx.region(), "us-east-1");
    }

    #[test]
    fn test_st006_fqn_without_namespace() {
        let ctx = RunContext::new("", "dev", "");
        assert_eq!(ctx.fqn("vpc"), "vpc");
    }

    #[test]
    fn test_st006_hook_data_last_write_wins() {
        let ctx = RunContext::default();
        ctx.set_hook_data("k", serde_json::json!({"a": 1, "b": 2}));
        ctx.set_hook_data("k", serde_json::json!({"c": 3}));
        assert_eq!(ctx.hook_data("k"), Some(serde_json::json!({"c": 3})));
        assert!(ctx.has_hook_data("k"));
        assert!(!ctx.has_hook_data("missing"));
    }

    #[test]
    fn test_st006_outputs_cache() {
        let ctx = RunContext::new("ns", "dev", "");
        let mut outputs = StackOutputs::new();
        outputs.insert("VpcId".into(), "vpc-123".into());
        ctx.record_outputs("ns-vpc", outputs);
        assert_eq!(ctx.outputs("ns-vpc").unwrap()["VpcId"], "vpc-123");
        ctx.forget_outputs("ns-vpc");
        assert!(ctx.outputs("ns-vpc").is_none());
    }

    #[test]
    fn test_st006_env_and_variables() {
        let mut env = HashMap::new();
        env.insert("FOO".to_string(), "bar".to_string());
        let mut vars = IndexMap::new();
        vars.insert("Cidr".to_string(), Value::String("10.0.0.0/16".into()));
        let ctx = RunContext::default().with_env(env).with_variables(vars);
        assert_eq!(ctx.env_var("FOO"), Some("bar"));
        assert_eq!(ctx.env_var("NOPE"), None);
        assert_eq!(ctx.variable("Cidr").unwrap(), "10.0.0.0/16");
    }

    #[test]
    fn test_st006_concurrent_writers() {
        let ctx = Arc::new(RunContext::default());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ctx = Arc::clone(&ctx);
                std::thread::spawn(move || {
                    ctx.set_hook_data(&format!("k{i}"), Value::from(i));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ctx.hook_data_snapshot().len(), 8);
    }
}
