// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration loading from files.
//!
//! Files are read into untyped JSON value trees so that partial files can be
//! layered by the merger before the final typed deserialization.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::ConfigError;

use super::types::OrchestratorConfig;

/// Config file names to search for (in order).
pub const CONFIG_FILES: &[&str] = &[
    ".foreman.yaml",
    ".foreman.yml",
    ".foreman.json",
    ".foreman/config.yaml",
];

/// Local config file name (for personal overrides, gitignored).
pub const LOCAL_CONFIG_FILE: &str = ".foreman.local.yaml";

/// Global config directory name.
pub const GLOBAL_CONFIG_DIR: &str = ".foreman";

/// Global config file name.
pub const GLOBAL_CONFIG_FILE: &str = "config.yaml";

/// Get the global config directory path.
pub fn get_global_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(GLOBAL_CONFIG_DIR))
}

/// Get the global config file path.
pub fn get_global_config_path() -> Option<PathBuf> {
    get_global_config_dir().map(|dir| dir.join(GLOBAL_CONFIG_FILE))
}

/// Load global configuration from ~/.foreman/config.yaml.
pub fn load_global_config() -> Result<Option<Value>, ConfigError> {
    let path = match get_global_config_path() {
        Some(p) => p,
        None => return Ok(None),
    };

    if !path.exists() {
        return Ok(None);
    }

    load_config_file(&path).map(Some)
}

/// Load workspace configuration, using the first file of [`CONFIG_FILES`] found.
pub fn load_workspace_config(workspace_root: &Path) -> Result<Option<Value>, ConfigError> {
    for filename in CONFIG_FILES {
        let path = workspace_root.join(filename);
        if path.exists() {
            return load_config_file(&path).map(Some);
        }
    }
    Ok(None)
}

/// Load local configuration from .foreman.local.yaml.
pub fn load_local_config(workspace_root: &Path) -> Result<Option<Value>, ConfigError> {
    let path = workspace_root.join(LOCAL_CONFIG_FILE);
    if !path.exists() {
        return Ok(None);
    }
    load_config_file(&path).map(Some)
}

/// Load a configuration file (JSON or YAML) as a value tree.
pub fn load_config_file(path: &Path) -> Result<Value, ConfigError> {
    let content = std::fs::read_to_string(path)?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");

    let value: Value = match extension.to_lowercase().as_str() {
        "json" => serde_json::from_str(&content)?,
        _ => serde_yaml::from_str(&content)?,
    };

    // An empty YAML document parses as null.
    if value.is_null() {
        return Ok(Value::Object(Default::default()));
    }
    if !value.is_object() {
        return Err(ConfigError::invalid(
            path.display().to_string(),
            "top level must be a mapping",
        ));
    }
    Ok(value)
}

/// Write a configuration as YAML.
pub fn save_config(path: &Path, config: &OrchestratorConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_yaml::to_string(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Initialize `.foreman.yaml` in the workspace root with defaults.
pub fn init_config(workspace_root: &Path) -> Result<PathBuf, ConfigError> {
    let path = workspace_root.join(CONFIG_FILES[0]);
    save_config(&path, &OrchestratorConfig::default())?;
    Ok(path)
}
