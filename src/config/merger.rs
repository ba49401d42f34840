// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration merging.
//!
//! Layers are deep-merged as value trees with precedence
//! CLI > local > workspace > global > defaults, then deserialized once.

use std::path::PathBuf;

use serde_json::{Map, Value};

use crate::error::ConfigError;

use super::types::{ConflictPolicy, OrchestratorConfig, ReclaimPolicy};

/// Options supplied on the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub repo_root: Option<PathBuf>,
    pub base_branch: Option<String>,
    pub max_active_workspaces: Option<usize>,
    pub reclaim_policy: Option<ReclaimPolicy>,
    pub conflict_policy: Option<ConflictPolicy>,
}

impl CliOptions {
    fn to_value(&self) -> Result<Value, ConfigError> {
        let mut root = Map::new();

        let mut repository = Map::new();
        if let Some(path) = &self.repo_root {
            repository.insert("root".to_string(), Value::String(path.display().to_string()));
        }
        if let Some(branch) = &self.base_branch {
            repository.insert("baseBranch".to_string(), Value::String(branch.clone()));
        }
        if !repository.is_empty() {
            root.insert("repository".to_string(), Value::Object(repository));
        }

        if let Some(max) = self.max_active_workspaces {
            root.insert(
                "limits".to_string(),
                serde_json::json!({ "maxActiveWorkspaces": max }),
            );
        }
        if let Some(policy) = self.reclaim_policy {
            root.insert(
                "monitor".to_string(),
                serde_json::json!({ "policy": serde_json::to_value(policy)? }),
            );
        }
        if let Some(policy) = self.conflict_policy {
            root.insert(
                "conflicts".to_string(),
                serde_json::json!({ "policy": serde_json::to_value(policy)? }),
            );
        }

        Ok(Value::Object(root))
    }
}

/// Deep-merge `overlay` into `base`. Mappings merge key by key; anything else replaces.
pub fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Merge all configuration layers into a validated config.
pub fn merge_config(
    global: Option<Value>,
    workspace: Option<Value>,
    local: Option<Value>,
    cli: &CliOptions,
) -> Result<OrchestratorConfig, ConfigError> {
    let mut merged = serde_json::to_value(OrchestratorConfig::default())?;

    for layer in [global, workspace, local].into_iter().flatten() {
        merge_values(&mut merged, layer);
    }
    merge_values(&mut merged, cli.to_value()?);

    let config: OrchestratorConfig = serde_json::from_value(merged)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_values_nested() {
        let mut base = json!({"a": {"b": 1, "c": 2}, "d": [1, 2]});
        merge_values(&mut base, json!({"a": {"c": 3}, "d": [9]}));
        assert_eq!(base, json!({"a": {"b": 1, "c": 3}, "d": [9]}));
    }

    #[test]
    fn test_merge_defaults_only() {
        let config = merge_config(None, None, None, &CliOptions::default()).unwrap();
        assert_eq!(config, OrchestratorConfig::default());
    }

    #[test]
    fn test_precedence() {
        let global = json!({"limits": {"maxActiveWorkspaces": 10, "maxAssignmentsPerAgent": 2}});
        let workspace = json!({"limits": {"maxActiveWorkspaces": 6}});
        let local = json!({"repository": {"baseBranch": "develop"}});
        let cli = CliOptions {
            base_branch: Some("trunk".to_string()),
            reclaim_policy: Some(ReclaimPolicy::AlertOnly),
            ..Default::default()
        };

        let config = merge_config(Some(global), Some(workspace), Some(local), &cli).unwrap();
        assert_eq!(config.limits.max_active_workspaces, 6);
        assert_eq!(config.limits.max_assignments_per_agent, 2);
        assert_eq!(config.repository.base_branch, "trunk"); // CLI wins
        assert_eq!(config.monitor.policy, ReclaimPolicy::AlertOnly);
    }

    #[test]
    fn test_merge_rejects_invalid_result() {
        let workspace = json!({"limits": {"maxActiveWorkspaces": 0}});
        let result = merge_config(None, Some(workspace), None, &CliOptions::default());
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
