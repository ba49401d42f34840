// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Deterministic workspace naming.
//!
//! Branch and directory names derive from the unit key alone, so the same key
//! always maps to the same workspace and distinct keys never collide.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::config::RepositoryConfig;
use crate::types::WorkspaceRef;

/// Longest sanitized name, suffix included.
pub const MAX_NAME_LEN: usize = 48;

/// Marker file written into every provisioned workspace.
pub const MARKER_FILE: &str = ".foreman-workspace";

const SUFFIX_LEN: usize = 8;

fn is_separator(c: char) -> bool {
    matches!(c, '-' | '.' | '_')
}

fn key_digest(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    digest
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>()[..SUFFIX_LEN]
        .to_string()
}

fn truncate(name: &mut String, max: usize) {
    // Only ASCII remains after sanitizing, so byte truncation is safe.
    name.truncate(max);
    while name.ends_with(is_separator) {
        name.pop();
    }
}

/// Reduce a unit key to `[a-z0-9._-]`, at most [`MAX_NAME_LEN`] characters.
///
/// Any change to the key (case, replaced characters, collapsed separators,
/// truncation) appends an 8-hex-digit SHA-256 prefix of the raw key.
pub fn sanitize_key(key: &str) -> String {
    let mut name = String::with_capacity(key.len());
    for c in key.chars() {
        let c = c.to_ascii_lowercase();
        let c = if c.is_ascii_alphanumeric() || is_separator(c) {
            c
        } else {
            '-'
        };
        if is_separator(c) && (name.is_empty() || name.ends_with(is_separator)) {
            continue;
        }
        name.push(c);
    }
    while name.ends_with(is_separator) {
        name.pop();
    }

    if name == key && name.len() <= MAX_NAME_LEN {
        return name;
    }

    truncate(&mut name, MAX_NAME_LEN - SUFFIX_LEN - 1);
    if name.is_empty() {
        name.push_str("unit");
    }
    format!("{}-{}", name, key_digest(key))
}

/// Derives branch and directory names for units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceNaming {
    /// Directory workspaces are created in.
    parent_dir: PathBuf,
    dir_prefix: String,
    branch_prefix: String,
}

impl WorkspaceNaming {
    pub fn new(parent_dir: impl Into<PathBuf>, dir_prefix: impl Into<String>, branch_prefix: impl Into<String>) -> Self {
        Self {
            parent_dir: parent_dir.into(),
            dir_prefix: dir_prefix.into(),
            branch_prefix: branch_prefix.into(),
        }
    }

    /// Workspaces go in `workspaceDir` when set, otherwise next to the
    /// repository root.
    pub fn from_config(repo: &RepositoryConfig) -> Self {
        let parent_dir = match &repo.workspace_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => repo.root.join(dir),
            None => repo.root.parent().unwrap_or(&repo.root).to_path_buf(),
        };
        Self::new(parent_dir, &repo.workspace_prefix, &repo.branch_prefix)
    }

    pub fn parent_dir(&self) -> &Path {
        &self.parent_dir
    }

    pub fn branch_for(&self, key: &str) -> String {
        let name = sanitize_key(key);
        let prefix = self.branch_prefix.trim_matches('/');
        if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.parent_dir
            .join(format!("{}{}", self.dir_prefix, sanitize_key(key)))
    }

    pub fn derive(&self, key: &str) -> WorkspaceRef {
        WorkspaceRef {
            path: self.path_for(key),
            branch: self.branch_for(key),
        }
    }
}
