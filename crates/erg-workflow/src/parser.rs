use crate::error::ConfigError;
use crate::graph::WorkflowGraph;
use crate::schema::WorkflowConfig;
use serde_yml::Value;
use std::path::Path;

/// Load, parse and validate a workflow file.
pub fn load_workflow(path: &Path) -> Result<WorkflowGraph, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_workflow(&content)
}

/// Parse and validate a workflow from a YAML string.
pub fn parse_workflow(yaml: &str) -> Result<WorkflowGraph, ConfigError> {
    WorkflowGraph::new(parse_config(yaml)?)
}

/// Parse a workflow into its raw config without graph validation.
pub fn parse_config(yaml: &str) -> Result<WorkflowConfig, ConfigError> {
    let mut raw: Value =
        serde_yml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;

    normalize_hooks(&mut raw)?;
    expand_variables(&mut raw);

    serde_yml::from_value(raw).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Rewrite bare-string hooks into `{ run: ... }` mappings.
fn normalize_hooks(raw: &mut Value) -> Result<(), ConfigError> {
    let states = match raw.get_mut("states") {
        Some(Value::Mapping(m)) => m,
        _ => return Ok(()),
    };

    for (name, state) in states.iter_mut() {
        let state_name = name.as_str().unwrap_or("?").to_string();
        for key in ["before", "after"] {
            let hooks = match state.get_mut(key) {
                Some(Value::Sequence(seq)) => seq,
                Some(Value::Null) | None => continue,
                Some(_) => {
                    return Err(ConfigError::Invalid {
                        state: state_name,
                        detail: format!("`{key}` must be a list of hooks"),
                    })
                }
            };
            for hook in hooks.iter_mut() {
                if let Value::String(cmd) = hook {
                    let mut m = serde_yml::Mapping::new();
                    m.insert(Value::String("run".into()), Value::String(cmd.clone()));
                    *hook = Value::Mapping(m);
                }
            }
        }
    }
    Ok(())
}

/// Expand `${{ env.VAR_NAME }}` patterns in string values.
fn expand_variables(value: &mut Value) {
    match value {
        Value::String(s) => {
            if s.contains("${{") {
                *s = expand_env_vars(s);
            }
        }
        Value::Mapping(m) => {
            for (_, v) in m.iter_mut() {
                expand_variables(v);
            }
        }
        Value::Sequence(seq) => {
            for v in seq.iter_mut() {
                expand_variables(v);
            }
        }
        _ => {}
    }
}

/// Replace `${{ env.VAR_NAME }}` with the environment variable value.
/// Unknown expressions and unclosed braces are kept verbatim.
fn expand_env_vars(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(start) = rest.find("${{") {
        result.push_str(&rest[..start]);
        let after_start = &rest[start + 3..];
        let Some(end) = after_start.find("}}") else {
            result.push_str(&rest[start..]);
            rest = "";
            break;
        };
        match after_start[..end].trim().strip_prefix("env.") {
            Some(var) => result.push_str(&std::env::var(var.trim()).unwrap_or_default()),
            None => result.push_str(&rest[start..start + 3 + end + 2]),
        }
        rest = &after_start[end + 2..];
    }
    result.push_str(rest);
    result
}
