//! ST-040: Stack template loading and rendering.
//!
//! Resolves `{{ var.NAME }}`, `{{ namespace }}`, `{{ environment }}`,
//! `{{ region }}`, `{{ stack.name }}` and `{{ stack.fqn }}` placeholders in a
//! template body. Variables are resolved first; non-scalar variables render
//! as compact JSON.

use super::context::RunContext;
use super::types::{is_scalar, value_to_string, StackDef, Value};
use crate::error::TemplateError;
use indexmap::IndexMap;
use std::path::Path;

/// Read a stack's template: the inline body, or the file relative to `base_dir`.
pub fn load_template(stack: &StackDef, base_dir: &Path) -> Result<String, TemplateError> {
    if let Some(body) = &stack.template_body {
        return Ok(body.clone());
    }
    let rel = stack
        .template_path
        .as_ref()
        .ok_or_else(|| TemplateError::Missing(stack.name.clone()))?;
    let path = base_dir.join(rel);
    std::fs::read_to_string(&path).map_err(|source| TemplateError::Io { path, source })
}

/// Resolve all template placeholders in a body.
pub fn render_template(
    template: &str,
    variables: &IndexMap<String, Value>,
    ctx: &RunContext,
    stack: &str,
) -> Result<String, TemplateError> {
    let mut result = template.to_string();
    let mut start = 0;

    while let Some(open) = result[start..].find("{{") {
        let open = start + open;
        let close = result[open..]
            .find("}}")
            .ok_or(TemplateError::Unclosed(open))?;
        let close = open + close + 2;
        let key = result[open + 2..close - 2].trim();

        let value = if let Some(name) = key.strip_prefix("var.") {
            variables
                .get(name)
                .map(render_value)
                .ok_or_else(|| TemplateError::UnknownVariable(key.to_string()))?
        } else {
            match key {
                "namespace" => ctx.namespace().to_string(),
                "environment" => ctx.environment().to_string(),
                "region" => ctx.region().to_string(),
                "stack.name" => stack.to_string(),
                "stack.fqn" => ctx.fqn(stack),
                _ => return Err(TemplateError::UnknownVariable(key.to_string())),
            }
        };

        result.replace_range(open..close, &value);
        start = open + value.len();
    }

    Ok(result)
}

fn render_value(value: &Value) -> String {
    if is_scalar(value) {
        value_to_string(value)
    } else {
        value.to_string()
    }
}

/// Provider parameters from resolved variables.
pub fn parameters_from(variables: &IndexMap<String, Value>) -> IndexMap<String, String> {
    variables
        .iter()
        .map(|(k, v)| (k.clone(), render_value(v)))
        .collect()
}
