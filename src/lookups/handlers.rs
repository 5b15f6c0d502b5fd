//! ST-013: Builtin lookup handlers.

use super::resolver::project;
use super::{LookupArgs, LookupHandler, LookupScope};
use crate::core::types::Value;
use crate::error::{LookupError, ProviderError};
use async_trait::async_trait;
use base64::Engine;
use rand::distr::Alphanumeric;
use rand::Rng;
use std::sync::Arc;

/// Every builtin, keyed by type name.
pub fn builtins() -> Vec<(&'static str, Arc<dyn LookupHandler>)> {
    fn entry<H: LookupHandler + 'static>(
        kind: &'static str,
        handler: H,
    ) -> (&'static str, Arc<dyn LookupHandler>) {
        (kind, Arc::new(handler))
    }
    vec![
        entry("env", EnvLookup),
        entry("var", VarLookup),
        entry("output", OutputLookup),
        entry("cfn", CfnLookup),
        entry("hook_data", HookDataLookup),
        entry("random.string", RandomStringLookup),
        entry("file", FileLookup),
    ]
}

/// `${env NAME}`: the run context's environment mapping.
pub struct EnvLookup;

#[async_trait]
impl LookupHandler for EnvLookup {
    async fn handle(
        &self,
        query: &str,
        _args: &LookupArgs,
        scope: &LookupScope<'_>,
    ) -> Result<Value, LookupError> {
        scope
            .ctx
            .env_var(query)
            .map(|v| Value::String(v.to_string()))
            .ok_or_else(|| LookupError::not_found("env", query))
    }
}

/// `${var NAME}`: a global variable. Results may themselves contain lookups.
pub struct VarLookup;

#[async_trait]
impl LookupHandler for VarLookup {
    async fn handle(
        &self,
        query: &str,
        _args: &LookupArgs,
        scope: &LookupScope<'_>,
    ) -> Result<Value, LookupError> {
        scope
            .ctx
            .variable(query)
            .cloned()
            .ok_or_else(|| LookupError::not_found("var", query))
    }

    fn expands_result(&self) -> bool {
        true
    }
}

fn split_output_query<'q>(lookup: &str, query: &'q str) -> Result<(&'q str, &'q str), LookupError> {
    match query.rsplit_once('.') {
        Some((stack, output)) if !stack.is_empty() && !output.is_empty() => Ok((stack, output)),
        _ => Err(LookupError::invalid(
            lookup,
            format!("expected 'stack.OutputName', got '{}'", query),
        )),
    }
}

/// Read an output of a fully-qualified stack: the run's cache first, then the
/// provider. Remote reads are cached for the rest of the run.
async fn read_output(
    lookup: &str,
    fqn: &str,
    output: &str,
    scope: &LookupScope<'_>,
) -> Result<Value, LookupError> {
    let query = format!("{}.{}", fqn, output);
    let outputs = match scope.ctx.outputs(fqn) {
        Some(cached) => cached,
        None => {
            let provider = scope
                .provider
                .ok_or_else(|| LookupError::failed(lookup, "no provider available"))?;
            let state = provider
                .describe(fqn)
                .await
                .map_err(|source| LookupError::Provider {
                    lookup: lookup.to_string(),
                    source,
                })?
                .ok_or_else(|| LookupError::Provider {
                    lookup: lookup.to_string(),
                    source: ProviderError::NotFound(fqn.to_string()),
                })?;
            if state.status.is_in_progress() || state.status.is_failed() {
                return Err(LookupError::failed(
                    lookup,
                    format!("stack '{}' is in {}", fqn, state.status),
                ));
            }
            scope.ctx.record_outputs(fqn, state.outputs.clone());
            state.outputs
        }
    };
    outputs
        .get(output)
        .map(|v| Value::String(v.clone()))
        .ok_or_else(|| LookupError::not_found(lookup, &query))
}

/// `${output stack.OutputName}`: an output of a stack in the same run.
pub struct OutputLookup;

#[async_trait]
impl LookupHandler for OutputLookup {
    async fn handle(
        &self,
        query: &str,
        _args: &LookupArgs,
        scope: &LookupScope<'_>,
    ) -> Result<Value, LookupError> {
        let (stack, output) = split_output_query("output", query)?;
        read_output("output", &scope.ctx.fqn(stack), output, scope).await
    }

    fn dependency(&self, query: &str) -> Option<String> {
        split_output_query("output", query)
            .ok()
            .map(|(stack, _)| stack.to_string())
    }
}

/// `${cfn fully-qualified-stack.OutputName}`: an output of a stack outside
/// the run, read from the provider.
pub struct CfnLookup;

#[async_trait]
impl LookupHandler for CfnLookup {
    async fn handle(
        &self,
        query: &str,
        _args: &LookupArgs,
        scope: &LookupScope<'_>,
    ) -> Result<Value, LookupError> {
        let (fqn, output) = split_output_query("cfn", query)?;
        read_output("cfn", fqn, output, scope).await
    }

    fn reads_remote(&self) -> bool {
        true
    }
}

/// `${hook_data key.path}`: data published by a hook.
pub struct HookDataLookup;

#[async_trait]
impl LookupHandler for HookDataLookup {
    async fn handle(
        &self,
        query: &str,
        _args: &LookupArgs,
        scope: &LookupScope<'_>,
    ) -> Result<Value, LookupError> {
        let (key, path) = match query.split_once('.') {
            Some((key, path)) => (key, Some(path)),
            None => (query, None),
        };
        let data = scope
            .ctx
            .hook_data(key)
            .ok_or_else(|| LookupError::not_found("hook_data", query))?;
        match path {
            None => Ok(data),
            Some(path) => {
                project(&data, path).ok_or_else(|| LookupError::not_found("hook_data", query))
            }
        }
    }
}

/// `${random.string LENGTH}`: alphanumeric noise.
pub struct RandomStringLookup;

fn random_string(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[async_trait]
impl LookupHandler for RandomStringLookup {
    async fn handle(
        &self,
        query: &str,
        _args: &LookupArgs,
        _scope: &LookupScope<'_>,
    ) -> Result<Value, LookupError> {
        let len: usize = query.trim().parse().map_err(|_| {
            LookupError::invalid("random.string", format!("length must be an integer, got '{}'", query))
        })?;
        Ok(Value::String(random_string(len)))
    }
}

/// `${file codec:path}`: file contents, relative paths from the config directory.
pub struct FileLookup;

#[async_trait]
impl LookupHandler for FileLookup {
    async fn handle(
        &self,
        query: &str,
        _args: &LookupArgs,
        scope: &LookupScope<'_>,
    ) -> Result<Value, LookupError> {
        let (codec, path) = query.split_once(':').ok_or_else(|| {
            LookupError::invalid("file", format!("expected 'codec:path', got '{}'", query))
        })?;
        let path = scope.ctx.base_dir().join(path);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LookupError::not_found("file", &path.display().to_string()));
            }
            Err(e) => {
                return Err(LookupError::failed(
                    "file",
                    format!("cannot read {}: {}", path.display(), e),
                ))
            }
        };

        match codec {
            "base64" => Ok(Value::String(
                base64::engine::general_purpose::STANDARD.encode(&bytes),
            )),
            "plain" | "json" | "yaml" => {
                let text = String::from_utf8(bytes).map_err(|_| {
                    LookupError::failed("file", format!("{} is not UTF-8", path.display()))
                })?;
                match codec {
                    "json" => serde_json::from_str(&text).map_err(|e| {
                        LookupError::failed("file", format!("invalid JSON in {}: {}", path.display(), e))
                    }),
                    "yaml" => serde_yaml_ng::from_str(&text).map_err(|e| {
                        LookupError::failed("file", format!("invalid YAML in {}: {}", path.display(), e))
                    }),
                    _ => Ok(Value::String(text)),
                }
            }
            other => Err(LookupError::invalid(
                "file",
                format!("unknown codec '{}'", other),
            )),
        }
    }
}
