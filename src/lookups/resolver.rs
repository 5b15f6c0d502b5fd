//! ST-012: Lookup resolution.
//!
//! Nested expressions are resolved inside-out before the outer handler runs.
//! After the handler returns, common arguments apply in fixed order: `load`,
//! `get`, `transform` (with `delimiter` and `indent`), then `default`, which
//! only replaces a not-found condition.
//!
//! Within one top-level field, identical sub-expressions are evaluated once.

use super::expr::{contains_lookup, Field, LookupExpr, Segment};
use super::{LookupArgs, LookupHandler, LookupRegistry, LookupScope, ResolveMode};
use crate::core::types::{is_scalar, parse_bool, value_to_string, Value};
use crate::error::LookupError;
use futures::future::{BoxFuture, FutureExt};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Resolves fields and variable maps against a handler registry.
#[derive(Clone)]
pub struct Resolver {
    registry: Arc<LookupRegistry>,
    max_depth: usize,
}

impl Resolver {
    pub fn new(registry: Arc<LookupRegistry>, max_depth: usize) -> Self {
        Self {
            registry,
            max_depth,
        }
    }

    pub fn registry(&self) -> &LookupRegistry {
        &self.registry
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Resolve one field.
    pub async fn resolve_str(
        &self,
        input: &str,
        scope: &LookupScope<'_>,
    ) -> Result<Value, LookupError> {
        self.resolve_value(&Value::String(input.to_string()), scope)
            .await
    }

    /// Resolve every string inside a value; structure is preserved.
    pub async fn resolve_value(
        &self,
        value: &Value,
        scope: &LookupScope<'_>,
    ) -> Result<Value, LookupError> {
        let sink = Mutex::default();
        self.walk(value, scope, &sink).await
    }

    /// Resolve a variable map, attributing failures to the variable.
    pub async fn resolve_variables(
        &self,
        variables: &IndexMap<String, Value>,
        scope: &LookupScope<'_>,
    ) -> Result<IndexMap<String, Value>, LookupError> {
        let sink = Mutex::default();
        let mut resolved = IndexMap::with_capacity(variables.len());
        for (name, value) in variables {
            let value = self
                .walk(value, scope, &sink)
                .await
                .map_err(|e| LookupError::in_variable(name, e))?;
            resolved.insert(name.clone(), value);
        }
        Ok(resolved)
    }

    /// Discovery pass: the same-run stacks a variable map references.
    pub async fn discover(
        &self,
        variables: &IndexMap<String, Value>,
        scope: &LookupScope<'_>,
    ) -> Result<BTreeSet<String>, LookupError> {
        let sink = Mutex::default();
        for (name, value) in variables {
            self.walk(value, scope, &sink)
                .await
                .map_err(|e| LookupError::in_variable(name, e))?;
        }
        Ok(sink.into_inner().unwrap_or_else(PoisonError::into_inner))
    }

    fn walk<'s>(
        &'s self,
        value: &'s Value,
        scope: &'s LookupScope<'_>,
        discovered: &'s Mutex<BTreeSet<String>>,
    ) -> BoxFuture<'s, Result<Value, LookupError>> {
        async move {
            match value {
                Value::String(text) if contains_lookup(text) => {
                    let field = Field::parse(text, self.max_depth)?;
                    let session = Session {
                        resolver: self,
                        scope,
                        memo: Mutex::default(),
                        discovered,
                    };
                    session.eval_field(&field, 0).await
                }
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.walk(item, scope, discovered).await?);
                    }
                    Ok(Value::Array(out))
                }
                Value::Object(map) => {
                    let mut out = serde_json::Map::with_capacity(map.len());
                    for (key, item) in map {
                        out.insert(key.clone(), self.walk(item, scope, discovered).await?);
                    }
                    Ok(Value::Object(out))
                }
                other => Ok(other.clone()),
            }
        }
        .boxed()
    }
}

/// State for resolving one top-level field.
struct Session<'r, 'a> {
    resolver: &'r Resolver,
    scope: &'r LookupScope<'a>,
    memo: Mutex<HashMap<String, Value>>,
    discovered: &'r Mutex<BTreeSet<String>>,
}

impl<'r, 'a> Session<'r, 'a> {
    fn eval_field<'s>(
        &'s self,
        field: &'s Field,
        depth: usize,
    ) -> BoxFuture<'s, Result<Value, LookupError>> {
        async move {
            if depth > self.resolver.max_depth {
                return Err(LookupError::DepthExceeded(self.resolver.max_depth));
            }
            if let Some(expr) = field.single_lookup() {
                return self.eval_lookup(expr, depth).await;
            }

            let mut out = String::new();
            for segment in field.segments() {
                match segment {
                    Segment::Literal(text) => out.push_str(text),
                    Segment::Lookup(expr) => {
                        let value = self.eval_lookup(expr, depth).await?;
                        if !is_scalar(&value) {
                            return Err(LookupError::NonScalarConcatenation {
                                lookup: expr.kind.clone(),
                            });
                        }
                        out.push_str(&value_to_string(&value));
                    }
                }
            }
            Ok(Value::String(out))
        }
        .boxed()
    }

    fn eval_lookup<'s>(
        &'s self,
        expr: &'s LookupExpr,
        depth: usize,
    ) -> BoxFuture<'s, Result<Value, LookupError>> {
        async move {
            let cached = self
                .memo
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&expr.raw)
                .cloned();
            if let Some(value) = cached {
                return Ok(value);
            }

            let handler = self
                .resolver
                .registry
                .get(&expr.kind)
                .ok_or_else(|| LookupError::UnknownType(expr.kind.clone()))?;

            let query = value_to_string(&self.eval_field(&expr.query, depth + 1).await?);
            let mut resolved = IndexMap::with_capacity(expr.args.len());
            for (key, field) in &expr.args {
                let value = self.eval_field(field, depth + 1).await?;
                resolved.insert(key.clone(), value_to_string(&value));
            }
            let args = LookupArgs::from(resolved);

            let discovery = self.scope.mode == ResolveMode::Discovery;
            if discovery {
                if let Some(dep) = handler.dependency(&query) {
                    self.discovered
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(dep);
                    return Ok(placeholder(expr, &query));
                }
                if handler.reads_remote() {
                    return Ok(placeholder(expr, &query));
                }
            }

            let value = match self.invoke(handler.as_ref(), expr, &query, &args, depth).await {
                Ok(value) => value,
                Err(e) if e.is_not_found() && args.get("default").is_some() => {
                    Value::String(args.get("default").unwrap_or_default().to_string())
                }
                Err(e) if discovery && !e.is_configuration() => {
                    debug!(lookup = %expr.kind, query = %query, error = %e, "discovery placeholder");
                    placeholder(expr, &query)
                }
                Err(e) => return Err(e),
            };

            self.memo
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(expr.raw.clone(), value.clone());
            Ok(value)
        }
        .boxed()
    }

    async fn invoke(
        &self,
        handler: &dyn LookupHandler,
        expr: &LookupExpr,
        query: &str,
        args: &LookupArgs,
        depth: usize,
    ) -> Result<Value, LookupError> {
        let raw = handler.handle(query, args, self.scope).await?;
        let raw = match raw {
            Value::String(text) if handler.expands_result() && contains_lookup(&text) => {
                let field = Field::parse_at(&text, depth + 1, self.resolver.max_depth)?;
                self.eval_field(&field, depth + 1).await?
            }
            other => other,
        };
        post_process(&expr.kind, raw, args)
    }
}

fn placeholder(expr: &LookupExpr, query: &str) -> Value {
    Value::String(format!("<{} {}>", expr.kind, query))
}

/// Apply `load`, `get`, `transform` and `indent` to a handler result.
pub fn post_process(kind: &str, value: Value, args: &LookupArgs) -> Result<Value, LookupError> {
    let mut value = value;

    if let Some(format) = args.get("load") {
        value = load(kind, format, &value)?;
    }

    if let Some(path) = args.get("get") {
        value = project(&value, path).ok_or_else(|| LookupError::not_found(kind, path))?;
    }

    let indent = args
        .get("indent")
        .map(|raw| {
            raw.parse::<usize>()
                .map_err(|_| LookupError::invalid(kind, "indent must be a non-negative integer"))
        })
        .transpose()?;

    if let Some(transform) = args.get("transform") {
        let delimiter = args.get("delimiter").unwrap_or(",");
        value = apply_transform(kind, value, transform, delimiter, indent)?;
    } else if indent.is_some() && !is_scalar(&value) {
        value = Value::String(to_json(kind, &value, indent)?);
    }

    Ok(value)
}

fn load(kind: &str, format: &str, value: &Value) -> Result<Value, LookupError> {
    let text = match value {
        Value::String(text) => text,
        _ => return Err(LookupError::invalid(kind, "load requires a string value")),
    };
    match format {
        "json" => serde_json::from_str(text)
            .map_err(|e| LookupError::failed(kind, format!("cannot load json: {}", e))),
        "yaml" => serde_yaml_ng::from_str(text)
            .map_err(|e| LookupError::failed(kind, format!("cannot load yaml: {}", e))),
        "toml" => {
            let parsed: toml::Value = toml::from_str(text)
                .map_err(|e| LookupError::failed(kind, format!("cannot load toml: {}", e)))?;
            serde_json::to_value(parsed)
                .map_err(|e| LookupError::failed(kind, format!("cannot convert toml: {}", e)))
        }
        other => Err(LookupError::invalid(
            kind,
            format!("unknown load format '{}'", other),
        )),
    }
}

/// Follow a dotted path through mappings and sequences.
pub fn project(value: &Value, path: &str) -> Option<Value> {
    let mut current = value;
    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

fn apply_transform(
    kind: &str,
    value: Value,
    transform: &str,
    delimiter: &str,
    indent: Option<usize>,
) -> Result<Value, LookupError> {
    match transform {
        "str" => {
            let text = match &value {
                Value::Array(items) if items.iter().all(is_scalar) => items
                    .iter()
                    .map(value_to_string)
                    .collect::<Vec<_>>()
                    .join(delimiter),
                Value::Array(_) | Value::Object(_) => to_json(kind, &value, indent)?,
                scalar => value_to_string(scalar),
            };
            Ok(Value::String(text))
        }
        "bool" => match value {
            Value::Bool(b) => Ok(Value::Bool(b)),
            Value::String(ref s) => parse_bool(s)
                .map(Value::Bool)
                .ok_or_else(|| LookupError::invalid(kind, format!("'{}' is not a boolean", s))),
            Value::Number(ref n) => parse_bool(&n.to_string())
                .map(Value::Bool)
                .ok_or_else(|| LookupError::invalid(kind, format!("'{}' is not a boolean", n))),
            _ => Err(LookupError::invalid(
                kind,
                "only scalars can be transformed to bool",
            )),
        },
        other => Err(LookupError::invalid(
            kind,
            format!("unknown transform '{}'", other),
        )),
    }
}

fn to_json(kind: &str, value: &Value, indent: Option<usize>) -> Result<String, LookupError> {
    let Some(width) = indent else {
        return Ok(value.to_string());
    };
    let pad = " ".repeat(width);
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(pad.as_bytes());
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value
        .serialize(&mut ser)
        .map_err(|e| LookupError::failed(kind, format!("cannot serialize: {}", e)))?;
    String::from_utf8(buf).map_err(|e| LookupError::failed(kind, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::RunContext;
    use serde_json::json;

    fn resolver() -> Resolver {
        Resolver::new(Arc::new(LookupRegistry::with_builtins()), 10)
    }

    fn ctx_with_env(pairs: &[(&str, &str)]) -> RunContext {
        RunContext::new("ns", "dev", "us-east-1").with_env(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_st012_env_default_when_absent() {
        let ctx = ctx_with_env(&[]);
        let scope = LookupScope::execute(&ctx);
        let v = resolver()
            .resolve_str("${env FOO::default=bar}", &scope)
            .await
            .unwrap();
        assert_eq!(v, json!("bar"));
    }

    #[tokio::test]
    async fn test_st012_env_value_when_present() {
        let ctx = ctx_with_env(&[("FOO", "real")]);
        let scope = LookupScope::execute(&ctx);
        let v = resolver()
            .resolve_str("${env FOO::default=bar}", &scope)
            .await
            .unwrap();
        assert_eq!(v, json!("real"));
    }

    #[tokio::test]
    async fn test_st012_missing_without_default_raises() {
        let ctx = ctx_with_env(&[]);
        let scope = LookupScope::execute(&ctx);
        let err = resolver().resolve_str("${env FOO}", &scope).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_st012_concatenates_scalars() {
        let ctx = ctx_with_env(&[("A", "x"), ("B", "y")]);
        let scope = LookupScope::execute(&ctx);
        let v = resolver()
            .resolve_str("pre-${env A}-${env B}-post", &scope)
            .await
            .unwrap();
        assert_eq!(v, json!("pre-x-y-post"));
    }

    #[tokio::test]
    async fn test_st012_non_scalar_alone_is_kept() {
        let ctx = RunContext::default();
        ctx.set_hook_data("net", json!({"subnets": ["a", "b"]}));
        let scope = LookupScope::execute(&ctx);
        let v = resolver()
            .resolve_str("${hook_data net.subnets}", &scope)
            .await
            .unwrap();
        assert_eq!(v, json!(["a", "b"]));
    }

    #[tokio::test]
    async fn test_st012_non_scalar_mixed_rejected() {
        let ctx = RunContext::default();
        ctx.set_hook_data("net", json!({"subnets": ["a", "b"]}));
        let scope = LookupScope::execute(&ctx);
        let err = resolver()
            .resolve_str("subnets: ${hook_data net.subnets}", &scope)
            .await
            .unwrap_err();
        assert!(matches!(err, LookupError::NonScalarConcatenation { .. }));
    }

    #[tokio::test]
    async fn test_st012_nested_inside_out() {
        let ctx = ctx_with_env(&[("WHICH", "TARGET"), ("TARGET", "found")]);
        let scope = LookupScope::execute(&ctx);
        let v = resolver()
            .resolve_str("${env ${env WHICH}}", &scope)
            .await
            .unwrap();
        assert_eq!(v, json!("found"));
    }

    #[tokio::test]
    async fn test_st012_nested_default() {
        let ctx = ctx_with_env(&[("FALLBACK", "fb")]);
        let scope = LookupScope::execute(&ctx);
        let v = resolver()
            .resolve_str("${env MISSING::default=${env FALLBACK}}", &scope)
            .await
            .unwrap();
        assert_eq!(v, json!("fb"));
    }

    #[tokio::test]
    async fn test_st012_load_and_get() {
        let ctx = ctx_with_env(&[("DOC", r#"{"db": {"port": 5432}}"#)]);
        let scope = LookupScope::execute(&ctx);
        let v = resolver()
            .resolve_str("${env DOC::load=json, get=db.port}", &scope)
            .await
            .unwrap();
        assert_eq!(v, json!(5432));
    }

    #[tokio::test]
    async fn test_st012_load_yaml_and_toml() {
        let ctx = ctx_with_env(&[("Y", "a:\n  b: yes-value"), ("T", "[a]\nb = 3")]);
        let scope = LookupScope::execute(&ctx);
        let r = resolver();
        let y = r.resolve_str("${env Y::load=yaml, get=a.b}", &scope).await.unwrap();
        assert_eq!(y, json!("yes-value"));
        let t = r.resolve_str("${env T::load=toml, get=a.b}", &scope).await.unwrap();
        assert_eq!(t, json!(3));
    }

    #[tokio::test]
    async fn test_st012_get_missing_uses_default() {
        let ctx = ctx_with_env(&[("DOC", r#"{"a": 1}"#)]);
        let scope = LookupScope::execute(&ctx);
        let r = resolver();
        let v = r
            .resolve_str("${env DOC::load=json, get=b, default=none}", &scope)
            .await
            .unwrap();
        assert_eq!(v, json!("none"));
        let err = r
            .resolve_str("${env DOC::load=json, get=b}", &scope)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_st012_transform_str_joins() {
        let ctx = RunContext::default();
        ctx.set_hook_data("net", json!({"ids": ["a", "b", "c"]}));
        let scope = LookupScope::execute(&ctx);
        let r = resolver();
        let v = r
            .resolve_str("${hook_data net.ids::transform=str}", &scope)
            .await
            .unwrap();
        assert_eq!(v, json!("a,b,c"));
        let v = r
            .resolve_str("ids=${hook_data net.ids::transform=str, delimiter=;}", &scope)
            .await
            .unwrap();
        assert_eq!(v, json!("ids=a;b;c"));
    }

    #[tokio::test]
    async fn test_st012_transform_str_mapping_with_indent() {
        let ctx = RunContext::default();
        ctx.set_hook_data("cfg", json!({"a": 1}));
        let scope = LookupScope::execute(&ctx);
        let v = resolver()
            .resolve_str("${hook_data cfg::transform=str, indent=4}", &scope)
            .await
            .unwrap();
        assert_eq!(v, json!("{\n    \"a\": 1\n}"));
    }

    #[tokio::test]
    async fn test_st012_transform_bool() {
        let ctx = ctx_with_env(&[("ON", "yes"), ("OFF", "off"), ("BAD", "perhaps")]);
        let scope = LookupScope::execute(&ctx);
        let r = resolver();
        assert_eq!(
            r.resolve_str("${env ON::transform=bool}", &scope).await.unwrap(),
            json!(true)
        );
        assert_eq!(
            r.resolve_str("${env OFF::transform=bool}", &scope).await.unwrap(),
            json!(false)
        );
        let err = r
            .resolve_str("${env BAD::transform=bool}", &scope)
            .await
            .unwrap_err();
        assert!(matches!(err, LookupError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_st012_unknown_transform() {
        let ctx = ctx_with_env(&[("A", "1")]);
        let scope = LookupScope::execute(&ctx);
        let err = resolver()
            .resolve_str("${env A::transform=upper}", &scope)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown transform"));
    }

    #[tokio::test]
    async fn test_st012_unknown_type() {
        let ctx = RunContext::default();
        let scope = LookupScope::execute(&ctx);
        let err = resolver().resolve_str("${nope x}", &scope).await.unwrap_err();
        assert!(matches!(err, LookupError::UnknownType(k) if k == "nope"));
    }

    #[tokio::test]
    async fn test_st012_self_referential_var_fails_deterministically() {
        let mut vars = IndexMap::new();
        vars.insert("loop".to_string(), json!("x${var loop}"));
        let ctx = RunContext::default().with_variables(vars);
        let scope = LookupScope::execute(&ctx);
        let err = resolver().resolve_str("${var loop}", &scope).await.unwrap_err();
        assert!(matches!(err, LookupError::DepthExceeded(10)));
    }

    #[tokio::test]
    async fn test_st012_var_expands_references() {
        let mut vars = IndexMap::new();
        vars.insert("base".to_string(), json!("10.0"));
        vars.insert("cidr".to_string(), json!("${var base}.0.0/16"));
        let ctx = RunContext::default().with_variables(vars);
        let scope = LookupScope::execute(&ctx);
        let v = resolver().resolve_str("${var cidr}", &scope).await.unwrap();
        assert_eq!(v, json!("10.0.0.0/16"));
    }

    #[tokio::test]
    async fn test_st012_idempotent_resolution() {
        let ctx = ctx_with_env(&[("A", "1")]);
        ctx.set_hook_data("d", json!({"k": [1, 2]}));
        let scope = LookupScope::execute(&ctx);
        let r = resolver();
        let input = "${env A}:${hook_data d.k::transform=str}";
        let first = r.resolve_str(input, &scope).await.unwrap();
        let second = r.resolve_str(input, &scope).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_st012_random_stable_within_field_fresh_across() {
        let ctx = RunContext::default();
        let scope = LookupScope::execute(&ctx);
        let r = resolver();
        let v = r
            .resolve_str("${random.string 16}|${random.string 16}", &scope)
            .await
            .unwrap();
        let text = v.as_str().unwrap().to_string();
        let (a, b) = text.split_once('|').unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        let other = r.resolve_str("${random.string 16}", &scope).await.unwrap();
        assert_ne!(other.as_str().unwrap(), a);
    }

    #[tokio::test]
    async fn test_st012_resolve_nested_structures() {
        let ctx = ctx_with_env(&[("A", "1")]);
        let scope = LookupScope::execute(&ctx);
        let value = json!({"list": ["${env A}", 2], "map": {"k": "v-${env A}"}, "n": true});
        let v = resolver().resolve_value(&value, &scope).await.unwrap();
        assert_eq!(v, json!({"list": ["1", 2], "map": {"k": "v-1"}, "n": true}));
    }

    #[tokio::test]
    async fn test_st012_variable_error_attributed() {
        let ctx = RunContext::default();
        let scope = LookupScope::execute(&ctx);
        let mut vars = IndexMap::new();
        vars.insert("Good".to_string(), json!("plain"));
        vars.insert("Bad".to_string(), json!("${env MISSING}"));
        let err = resolver()
            .resolve_variables(&vars, &scope)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("variable 'Bad'"));
    }

    #[tokio::test]
    async fn test_st012_escaped_dollar_literal() {
        let ctx = RunContext::default();
        let scope = LookupScope::execute(&ctx);
        let v = resolver()
            .resolve_str(r"price \${env X}", &scope)
            .await
            .unwrap();
        assert_eq!(v, json!("price ${env X}"));
    }

    #[tokio::test]
    async fn test_st012_discovery_records_outputs() {
        let ctx = RunContext::new("ns", "dev", "");
        let scope = LookupScope::discovery(&ctx, "app");
        let mut vars = IndexMap::new();
        vars.insert("Vpc".to_string(), json!("${output vpc.VpcId}"));
        vars.insert("Db".to_string(), json!("host=${output db.Endpoint}"));
        vars.insert("Env".to_string(), json!("${env NOT_SET_YET}"));
        vars.insert("Ext".to_string(), json!("${cfn other-stack.Out}"));
        let deps = resolver().discover(&vars, &scope).await.unwrap();
        let deps: Vec<_> = deps.into_iter().collect();
        assert_eq!(deps, vec!["db", "vpc"]);
    }

    #[tokio::test]
    async fn test_st012_discovery_rejects_unknown_type() {
        let ctx = RunContext::default();
        let scope = LookupScope::discovery(&ctx, "app");
        let mut vars = IndexMap::new();
        vars.insert("X".to_string(), json!("${bogus q}"));
        let err = resolver().discover(&vars, &scope).await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_st012_project_paths() {
        let v = json!({"a": {"b": [10, {"c": "deep"}]}});
        assert_eq!(project(&v, "a.b.0"), Some(json!(10)));
        assert_eq!(project(&v, "a.b.1.c"), Some(json!("deep")));
        assert_eq!(project(&v, "a.x"), None);
        assert_eq!(project(&v, "a.b.9"), None);
    }
}
