//! ST-002: YAML parsing and validation.
//!
//! Parses strata.yaml and validates structural constraints:
//! - Stack names must be non-empty, unique and identifier-like
//! - Every enabled stack needs exactly one template source
//! - requires / required_by references must exist
//! - Hook paths must be non-empty

use super::types::{HookDecl, StrataConfig};
use crate::error::ConfigError;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

static STACK_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("Valid regex pattern"));

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse a strata.yaml file from disk. Template paths resolve against its directory.
pub fn parse_config_file(path: &Path) -> Result<StrataConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config = parse_config(&content)?;
    config.base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    Ok(config)
}

/// Parse a strata.yaml from a string.
pub fn parse_config(yaml: &str) -> Result<StrataConfig, ConfigError> {
    Ok(serde_yaml_ng::from_str(yaml)?)
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &StrataConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut push = |message: String| errors.push(ValidationError { message });

    if config.settings.concurrency == 0 {
        push("settings.concurrency must be at least 1".to_string());
    }

    let declared: HashSet<&str> = config.stacks.iter().map(|s| s.name.as_str()).collect();
    let mut seen = HashSet::new();

    for stack in &config.stacks {
        let name = &stack.name;
        if name.is_empty() {
            push("stack name must not be empty".to_string());
            continue;
        }
        if !STACK_NAME.is_match(name) {
            push(format!(
                "stack '{}' has an invalid name (letters, digits, '-' and '_' only)",
                name
            ));
        }
        if !seen.insert(name.as_str()) {
            push(format!("stack '{}' is declared more than once", name));
        }

        if stack.enabled {
            match (&stack.template_body, &stack.template_path) {
                (None, None) => push(format!("stack '{}' has no template", name)),
                (Some(_), Some(_)) => push(format!(
                    "stack '{}' sets both template_body and template_path",
                    name
                )),
                _ => {}
            }
        }

        for reference in stack.requires.iter().chain(&stack.required_by) {
            if reference == name {
                push(format!("stack '{}' depends on itself", name));
            } else if !declared.contains(reference.as_str()) {
                push(format!(
                    "stack '{}' references unknown stack '{}'",
                    name, reference
                ));
            }
        }

        for hook in stack.hooks.all() {
            check_hook(hook, Some(name), &mut push);
        }
    }

    for hook in config
        .pre_deploy
        .iter()
        .chain(&config.post_deploy)
        .chain(&config.pre_destroy)
        .chain(&config.post_destroy)
    {
        check_hook(hook, None, &mut push);
    }

    errors
}

fn check_hook(hook: &HookDecl, stack: Option<&str>, push: &mut impl FnMut(String)) {
    if hook.path.trim().is_empty() {
        match stack {
            Some(stack) => push(format!("stack '{}' declares a hook with an empty path", stack)),
            None => push("run-level hook with an empty path".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_st002_parse_valid() {
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
    args: { command: "echo hi" }
    data_key: greet
stacks:
  - name: vpc
    template_path: templates/vpc.yaml
    variables: { Cidr: "${var VpcCidr}" }
    tags: { team: core }
  - name: app
    template_body: "outputs: {}"
    requires: [vpc]
    hooks:
      post_deploy:
        - path: data
          required: false
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.namespace, "acme");
        assert_eq!(config.settings.concurrency, 2);
        assert_eq!(config.settings.max_retries, 5);
        assert_eq!(config.stacks.len(), 2);
        assert_eq!(config.stacks[0].variables["Cidr"], "${var VpcCidr}");
        assert!(config.stacks[0].enabled);
        assert!(!config.stacks[1].hooks.post_deploy[0].required);
        assert_eq!(config.pre_deploy[0].data_key.as_deref(), Some("greet"));
        assert!(validate_config(&config).is_empty());
    }

    #[test]
    fn test_st002_defaults() {
        let config = parse_config("stacks: []").unwrap();
        assert_eq!(config.environment, "default");
        assert_eq!(config.settings.concurrency, 4);
        assert_eq!(config.settings.max_lookup_depth, 10);
    }

    #[test]
    fn test_st002_parse_error() {
        assert!(matches!(
            parse_config("stacks: [unclosed"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_st002_file_sets_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.yaml");
        std::fs::write(&path, "namespace: x\n").unwrap();
        let config = parse_config_file(&path).unwrap();
        assert_eq!(config.base_dir, dir.path());

        let missing = dir.path().join("nope.yaml");
        assert!(matches!(
            parse_config_file(&missing),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_st002_validation_errors() {
        let yaml = r#"
settings: { concurrency: 0 }
pre_deploy:
  - path: ""
stacks:
  - name: a
    template_body: x
    requires: [ghost, a]
  - name: a
    template_body: x
  - name: "bad name"
    template_body: x
  - name: empty
  - name: both
    template_body: x
    template_path: y.yaml
  - name: dormant
    enabled: false
"#;
        let config = parse_config(yaml).unwrap();
        let errors: Vec<String> = validate_config(&config)
            .iter()
            .map(|e| e.to_string())
            .collect();
        let has = |needle: &str| errors.iter().any(|e| e.contains(needle));
        assert!(has("concurrency must be at least 1"));
        assert!(has("references unknown stack 'ghost'"));
        assert!(has("'a' depends on itself"));
        assert!(has("'a' is declared more than once"));
        assert!(has("'bad name' has an invalid name"));
        assert!(has("'empty' has no template"));
        assert!(has("'both' sets both"));
        assert!(has("run-level hook with an empty path"));
        assert!(!has("'dormant'"));
        assert_eq!(errors.len(), 8);
    }
}
