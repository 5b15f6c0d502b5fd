//! ST-011: Lookup handler registry.
//!
//! Handlers are registered by type name at startup. Custom handlers can also be
//! registered under a path and bound to a type name from configuration
//! (`lookups: { mytype: custom.lookups.mine }`), resolved against the search path.

pub mod expr;
pub mod handlers;
pub mod resolver;

pub use expr::{Field, LookupExpr, Segment};
pub use resolver::Resolver;

use crate::core::context::RunContext;
use crate::core::plugin::PluginTable;
use crate::core::types::Value;
use crate::error::{ConfigError, LookupError};
use crate::provider::ProviderClient;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Path prefix builtin handlers are registered under.
pub const BUILTIN_PREFIX: &str = "strata.lookups";

/// How remote-reading handlers behave during a resolution pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Record same-run stack references as edges; no remote reads.
    Discovery,
    /// Resolve for real.
    Execute,
}

/// Resolved arguments of one lookup, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LookupArgs {
    values: IndexMap<String, String>,
}

impl LookupArgs {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl From<IndexMap<String, String>> for LookupArgs {
    fn from(values: IndexMap<String, String>) -> Self {
        Self { values }
    }
}

impl<const N: usize> From<[(&str, &str); N]> for LookupArgs {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Self {
            values: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

/// What a handler may see while resolving.
pub struct LookupScope<'a> {
    pub ctx: &'a RunContext,
    /// Short name of the stack whose field is being resolved
    pub stack: Option<&'a str>,
    /// Absent during discovery and in isolated tests
    pub provider: Option<&'a ProviderClient>,
    pub mode: ResolveMode,
}

impl<'a> LookupScope<'a> {
    pub fn execute(ctx: &'a RunContext) -> Self {
        Self {
            ctx,
            stack: None,
            provider: None,
            mode: ResolveMode::Execute,
        }
    }

    pub fn discovery(ctx: &'a RunContext, stack: &'a str) -> Self {
        Self {
            ctx,
            stack: Some(stack),
            provider: None,
            mode: ResolveMode::Discovery,
        }
    }

    pub fn for_stack(mut self, stack: &'a str) -> Self {
        self.stack = Some(stack);
        self
    }

    pub fn with_provider(mut self, provider: &'a ProviderClient) -> Self {
        self.provider = Some(provider);
        self
    }
}

/// A lookup type. Handlers must be idempotent and side-effect free apart from
/// explicitly remote reads.
#[async_trait]
pub trait LookupHandler: Send + Sync {
    async fn handle(
        &self,
        query: &str,
        args: &LookupArgs,
        scope: &LookupScope<'_>,
    ) -> Result<Value, LookupError>;

    /// Same-run stack this query depends on.
    fn dependency(&self, _query: &str) -> Option<String> {
        None
    }

    /// Handlers that read provider state are not invoked during discovery.
    fn reads_remote(&self) -> bool {
        false
    }

    /// String results are themselves resolved one level deeper.
    fn expands_result(&self) -> bool {
        false
    }
}

/// Type name -> handler table.
#[derive(Clone, Default)]
pub struct LookupRegistry {
    handlers: HashMap<String, Arc<dyn LookupHandler>>,
    paths: PluginTable<Arc<dyn LookupHandler>>,
}

impl LookupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every builtin handler.
    pub fn with_builtins() -> Self {
        let builtins = handlers::builtins();
        Self {
            paths: builtins
                .iter()
                .map(|(kind, handler)| (format!("{}.{}", BUILTIN_PREFIX, kind), Arc::clone(handler)))
                .collect(),
            handlers: builtins
                .into_iter()
                .map(|(kind, handler)| (kind.to_string(), handler))
                .collect(),
        }
    }

    /// Register a handler under a unique type name.
    pub fn register(
        &mut self,
        kind: &str,
        handler: Arc<dyn LookupHandler>,
    ) -> Result<(), ConfigError> {
        if self.handlers.contains_key(kind) {
            return Err(ConfigError::DuplicateRegistration(kind.to_string()));
        }
        self.handlers.insert(kind.to_string(), handler);
        Ok(())
    }

    /// Make an implementation loadable by path from configuration.
    pub fn register_path(
        &mut self,
        path: &str,
        handler: Arc<dyn LookupHandler>,
    ) -> Result<(), ConfigError> {
        self.paths.insert(path, handler)
    }

    /// Bind configured type names to registered paths.
    pub fn load_aliases(
        &mut self,
        aliases: &IndexMap<String, String>,
        search_path: &[String],
    ) -> Result<(), ConfigError> {
        let mut search = search_path.to_vec();
        search.push(BUILTIN_PREFIX.to_string());
        for (kind, path) in aliases {
            let handler =
                self.paths
                    .resolve(path, &search)
                    .ok_or_else(|| ConfigError::UnknownLookupPath {
                        kind: kind.clone(),
                        path: path.clone(),
                    })?;
            self.register(kind, handler)?;
        }
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn LookupHandler>> {
        self.handlers.get(kind).cloned()
    }

    /// Registered type names, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl LookupHandler for Fixed {
        async fn handle(
            &self,
            _query: &str,
            _args: &LookupArgs,
            _scope: &LookupScope<'_>,
        ) -> Result<Value, LookupError> {
            Ok(Value::String(self.0.to_string()))
        }
    }

    #[test]
    fn test_st011_builtins_registered() {
        let r = LookupRegistry::with_builtins();
        for kind in ["env", "var", "output", "cfn", "hook_data", "random.string", "file"] {
            assert!(r.get(kind).is_some(), "missing builtin {kind}");
        }
        assert!(r.kinds().contains(&"env"));
    }

    #[test]
    fn test_st011_duplicate_type_rejected() {
        let mut r = LookupRegistry::with_builtins();
        let err = r.register("env", Arc::new(Fixed("x"))).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateRegistration(_)));
    }

    #[test]
    fn test_st011_alias_resolves_via_search_path() {
        let mut r = LookupRegistry::with_builtins();
        r.register_path("acme.lookups.region", Arc::new(Fixed("eu")))
            .unwrap();
        let mut aliases = IndexMap::new();
        aliases.insert("acme_region".to_string(), "region".to_string());
        aliases.insert("environ".to_string(), "env".to_string());
        r.load_aliases(&aliases, &["acme.lookups".to_string()])
            .unwrap();
        assert!(r.get("acme_region").is_some());
        assert!(r.get("environ").is_some());
    }

    #[test]
    fn test_st011_alias_unknown_path() {
        let mut r = LookupRegistry::new();
        let mut aliases = IndexMap::new();
        aliases.insert("x".to_string(), "nowhere.x".to_string());
        let err = r.load_aliases(&aliases, &[]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownLookupPath { .. }));
    }

    #[test]
    fn test_st011_args_access() {
        let args = LookupArgs::from([("default", "bar"), ("get", "a.b")]);
        assert_eq!(args.get("default"), Some("bar"));
        assert_eq!(args.get("nope"), None);
        assert_eq!(args.iter().count(), 2);
        assert!(!args.is_empty());
    }
}
