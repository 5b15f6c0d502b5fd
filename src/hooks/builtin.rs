//! ST-031: Builtin hooks: `command` and `data`.

use super::{Hook, HookContext, HookFactory};
use crate::core::types::{value_to_string, Value};
use crate::error::HookError;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

pub fn builtins() -> Vec<(&'static str, HookFactory)> {
    vec![
        ("command", Arc::new(command) as HookFactory),
        ("data", Arc::new(data) as HookFactory),
    ]
}

fn command(args: &IndexMap<String, Value>) -> Result<Box<dyn Hook>, HookError> {
    Ok(Box::new(CommandHook::from_args(args)?))
}

fn data(args: &IndexMap<String, Value>) -> Result<Box<dyn Hook>, HookError> {
    Ok(Box::new(DataHook {
        data: args.clone(),
    }))
}

/// Output from running a shell command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs a shell script through `bash`, in every phase it is declared for.
///
/// Args: `command` (required), `env` (mapping of extra variables).
/// The script sees `STRATA_NAMESPACE`, `STRATA_ENVIRONMENT`, `STRATA_REGION`,
/// `STRATA_PHASE` and, for per-stack hooks, `STRATA_STACK`.
pub struct CommandHook {
    script: String,
    env: IndexMap<String, String>,
}

impl CommandHook {
    pub fn from_args(args: &IndexMap<String, Value>) -> Result<Self, HookError> {
        let script = match args.get("command") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            _ => return Err(HookError::failed("command", "missing 'command' argument")),
        };
        let env = match args.get("env") {
            None => IndexMap::new(),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| (k.clone(), value_to_string(v)))
                .collect(),
            Some(_) => return Err(HookError::failed("command", "'env' must be a mapping")),
        };
        Ok(Self { script, env })
    }

    async fn run(&self, cx: &HookContext<'_>) -> Result<Value, HookError> {
        let mut cmd = Command::new("bash");
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("STRATA_NAMESPACE", cx.ctx.namespace())
            .env("STRATA_ENVIRONMENT", cx.ctx.environment())
            .env("STRATA_REGION", cx.ctx.region())
            .env("STRATA_PHASE", cx.phase.to_string())
            .envs(&self.env)
            .kill_on_drop(true);
        if let Some(stack) = cx.stack {
            cmd.env("STRATA_STACK", stack);
        }

        let out = exec(cmd, &self.script)
            .await
            .map_err(|e| HookError::failed(cx.path, e))?;
        debug!(hook = %cx.path, exit_code = out.exit_code, "command finished");
        if !out.success() {
            return Err(HookError::failed(
                cx.path,
                format!("exit code {}: {}", out.exit_code, out.stderr.trim()),
            ));
        }

        let mut result = serde_json::Map::new();
        result.insert("stdout".into(), Value::String(out.stdout));
        result.insert("stderr".into(), Value::String(out.stderr));
        result.insert("exit_code".into(), Value::from(out.exit_code));
        Ok(Value::Object(result))
    }
}

/// Feed a script to a shell on stdin and collect its output.
async fn exec(mut cmd: Command, script: &str) -> Result<ExecOutput, String> {
    let mut child = cmd
        .spawn()
        .map_err(|e| format!("failed to spawn bash: {}", e))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(script.as_bytes())
            .await
            .map_err(|e| format!("stdin write error: {}", e))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| format!("wait error: {}", e))?;

    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

#[async_trait]
impl Hook for CommandHook {
    async fn pre_deploy(&self, cx: &HookContext<'_>) -> Result<Value, HookError> {
        self.run(cx).await
    }

    async fn post_deploy(&self, cx: &HookContext<'_>) -> Result<Value, HookError> {
        self.run(cx).await
    }

    async fn pre_destroy(&self, cx: &HookContext<'_>) -> Result<Value, HookError> {
        self.run(cx).await
    }

    async fn post_destroy(&self, cx: &HookContext<'_>) -> Result<Value, HookError> {
        self.run(cx).await
    }
}

/// Publishes its resolved arguments as a mapping.
pub struct DataHook {
    data: IndexMap<String, Value>,
}

impl DataHook {
    fn value(&self) -> Value {
        Value::Object(
            self.data
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

#[async_trait]
impl Hook for DataHook {
    async fn pre_deploy(&self, _cx: &HookContext<'_>) -> Result<Value, HookError> {
        Ok(self.value())
    }

    async fn post_deploy(&self, _cx: &HookContext<'_>) -> Result<Value, HookError> {
        Ok(self.value())
    }

    async fn pre_destroy(&self, _cx: &HookContext<'_>) -> Result<Value, HookError> {
        Ok(self.value())
    }

    async fn post_destroy(&self, _cx: &HookContext<'_>) -> Result<Value, HookError> {
        Ok(self.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::RunContext;
    use crate::core::types::LifecyclePhase;
    use crate::hooks::invoke;
    use serde_json::json;

    fn args(pairs: &[(&str, Value)]) -> IndexMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn cx<'a>(ctx: &'a RunContext, phase: LifecyclePhase) -> HookContext<'a> {
        HookContext {
            ctx,
            path: "command",
            phase,
            stack: Some("app"),
        }
    }

    #[tokio::test]
    async fn test_st031_command_echo() {
        let ctx = RunContext::new("acme", "dev", "eu-west-1");
        let hook = CommandHook::from_args(&args(&[("command", json!("echo hello"))])).unwrap();
        let out = invoke(&hook, &cx(&ctx, LifecyclePhase::PreDeploy))
            .await
            .unwrap();
        assert_eq!(out["stdout"].as_str().unwrap().trim(), "hello");
        assert_eq!(out["exit_code"], json!(0));
    }

    #[tokio::test]
    async fn test_st031_command_sees_context_env() {
        let ctx = RunContext::new("acme", "dev", "eu-west-1");
        let hook = CommandHook::from_args(&args(&[
            (
                "command",
                json!("echo $STRATA_NAMESPACE/$STRATA_ENVIRONMENT/$STRATA_STACK/$STRATA_PHASE/$EXTRA"),
            ),
            ("env", json!({"EXTRA": 7})),
        ]))
        .unwrap();
        let out = invoke(&hook, &cx(&ctx, LifecyclePhase::PostDeploy))
            .await
            .unwrap();
        assert_eq!(
            out["stdout"].as_str().unwrap().trim(),
            "acme/dev/app/post_deploy/7"
        );
    }

    #[tokio::test]
    async fn test_st031_command_failure() {
        let ctx = RunContext::default();
        let hook =
            CommandHook::from_args(&args(&[("command", json!("echo boom >&2; exit 3"))])).unwrap();
        let err = invoke(&hook, &cx(&ctx, LifecyclePhase::PreDestroy))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exit code 3"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn test_st031_command_requires_script() {
        assert!(CommandHook::from_args(&IndexMap::new()).is_err());
        assert!(CommandHook::from_args(&args(&[
            ("command", json!("true")),
            ("env", json!(["not", "a", "map"]))
        ]))
        .is_err());
    }

    #[tokio::test]
    async fn test_st031_data_hook_returns_args() {
        let ctx = RunContext::default();
        let hook = data(&args(&[("vpc", json!("vpc-1")), ("count", json!(2))])).unwrap();
        let out = invoke(hook.as_ref(), &cx(&ctx, LifecyclePhase::PostDestroy))
            .await
            .unwrap();
        assert_eq!(out, json!({"vpc": "vpc-1", "count": 2}));
    }
}
