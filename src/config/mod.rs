// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration module for Foreman.
//!
//! Handles loading, merging, and validation of configuration from multiple sources:
//! - Global config: ~/.foreman/config.yaml
//! - Workspace config: .foreman.yaml, .foreman.yml, .foreman.json, or .foreman/config.yaml
//! - Local config: .foreman.local.yaml (gitignored, for personal overrides)
//! - CLI options: command-line arguments
//!
//! Configuration is merged with precedence (CLI > local > workspace > global > defaults).

mod loader;
mod merger;
mod types;

pub use loader::{
    get_global_config_dir, get_global_config_path, init_config, load_config_file,
    load_global_config, load_local_config, load_workspace_config, save_config, CONFIG_FILES,
    GLOBAL_CONFIG_DIR, GLOBAL_CONFIG_FILE, LOCAL_CONFIG_FILE,
};

pub use merger::{merge_config, merge_values, CliOptions};

pub use types::{
    ConflictConfig, ConflictPolicy, EventsConfig, LimitsConfig, MonitorConfig, OrchestratorConfig,
    ReclaimPolicy, RepositoryConfig, SchedulerConfig, ScoringWeights, WorkspaceSettings,
};

use crate::error::ConfigError;
use std::path::Path;

/// Load and merge all configuration sources for a workspace.
///
/// A relative `repository.root` is resolved against `workspace_root`.
pub fn load_config(
    workspace_root: &Path,
    cli_options: CliOptions,
) -> Result<OrchestratorConfig, ConfigError> {
    let global = load_global_config()?;
    let workspace = load_workspace_config(workspace_root)?;
    let local = load_local_config(workspace_root)?;

    let mut config = merge_config(global, workspace, local, &cli_options)?;
    if config.repository.root.is_relative() {
        config.repository.root = workspace_root.join(&config.repository.root);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_config_with_workspace_config() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".foreman.yaml"),
            "limits:\n  maxActiveWorkspaces: 3\nconflicts:\n  policy: defer\n",
        )
        .unwrap();

        let config = load_config(temp.path(), CliOptions::default()).unwrap();
        assert_eq!(config.limits.max_active_workspaces, 3);
        assert_eq!(config.conflicts.policy, ConflictPolicy::Defer);
        assert!(config.repository.root.starts_with(temp.path()));
    }

    #[test]
    fn test_load_config_local_override() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(".foreman.yaml"), "repository:\n  baseBranch: develop\n").unwrap();
        std::fs::write(temp.path().join(LOCAL_CONFIG_FILE), "repository:\n  baseBranch: mine\n").unwrap();

        let config = load_config(temp.path(), CliOptions::default()).unwrap();
        assert_eq!(config.repository.base_branch, "mine");
    }

    #[test]
    fn test_load_config_cli_override() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(".foreman.yaml"), "limits:\n  maxActiveWorkspaces: 3\n").unwrap();

        let cli = CliOptions {
            max_active_workspaces: Some(12),
            ..Default::default()
        };
        let config = load_config(temp.path(), cli).unwrap();
        assert_eq!(config.limits.max_active_workspaces, 12); // CLI wins
    }
}
