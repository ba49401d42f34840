// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Conflict risk detection.
//!
//! Units declare the paths (or glob patterns) they expect to modify. Two
//! units are at risk of conflicting when any of their declarations overlap:
//! equal paths, one path inside the other's directory, or a glob matching
//! the other side. Only the risk is reported; resolving overlapping edits is
//! left to the humans reviewing the branches.

use globset::Glob;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{UnitId, UnitOfWork};

/// A pair of units whose declared paths overlap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRisk {
    pub unit_id: UnitId,
    pub other: UnitId,
    /// Declarations of `unit_id` that overlap with `other`.
    pub paths: Vec<String>,
}

fn normalize(path: &str) -> &str {
    let path = path.trim();
    let path = path.strip_prefix("./").unwrap_or(path);
    path.trim_end_matches('/')
}

fn is_glob(path: &str) -> bool {
    path.contains(['*', '?', '[', '{'])
}

/// Literal directory prefix of a glob (`src/api/**/*.rs` -> `src/api`).
fn literal_prefix(pattern: &str) -> &str {
    let cut = pattern.find(['*', '?', '[', '{']).unwrap_or(pattern.len());
    match pattern[..cut].rfind('/') {
        Some(slash) => &pattern[..slash],
        None => "",
    }
}

fn is_within(path: &str, dir: &str) -> bool {
    dir.is_empty()
        || path == dir
        || (path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/')
}

fn glob_matches(pattern: &str, path: &str) -> bool {
    match Glob::new(pattern) {
        Ok(glob) => glob.compile_matcher().is_match(path),
        Err(e) => {
            debug!(pattern, error = %e, "Invalid touch pattern, comparing literally");
            pattern == path
        }
    }
}

/// Whether two declarations may touch the same files.
pub fn overlaps(a: &str, b: &str) -> bool {
    let (a, b) = (normalize(a), normalize(b));
    if a.is_empty() || b.is_empty() {
        return false;
    }
    match (is_glob(a), is_glob(b)) {
        (false, false) => is_within(a, b) || is_within(b, a),
        (true, false) => glob_matches(a, b) || is_within(literal_prefix(a), b),
        (false, true) => glob_matches(b, a) || is_within(literal_prefix(b), a),
        (true, true) => {
            let (pa, pb) = (literal_prefix(a), literal_prefix(b));
            a == b || is_within(pa, pb) || is_within(pb, pa)
        }
    }
}

/// Declarations in `a` that overlap any declaration in `b`.
pub fn shared_paths(a: &[String], b: &[String]) -> Vec<String> {
    a.iter()
        .filter(|pa| b.iter().any(|pb| overlaps(pa, pb)))
        .cloned()
        .collect()
}

/// Risks between `candidate` and units already in flight.
pub fn risks_for(candidate: &UnitOfWork, in_flight: &[UnitOfWork]) -> Vec<ConflictRisk> {
    in_flight
        .iter()
        .filter(|other| other.id != candidate.id)
        .filter_map(|other| {
            let paths = shared_paths(&candidate.touches, &other.touches);
            (!paths.is_empty()).then(|| ConflictRisk {
                unit_id: candidate.id.clone(),
                other: other.id.clone(),
                paths,
            })
        })
        .collect()
}

/// Every overlapping pair among `units`, each pair reported once.
pub fn detect(units: &[UnitOfWork]) -> Vec<ConflictRisk> {
    let mut risks = Vec::new();
    for (i, a) in units.iter().enumerate() {
        for b in &units[i + 1..] {
            let paths = shared_paths(&a.touches, &b.touches);
            if !paths.is_empty() {
                risks.push(ConflictRisk {
                    unit_id: a.id.clone(),
                    other: b.id.clone(),
                    paths,
                });
            }
        }
    }
    risks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(id: &str, touches: &[&str]) -> UnitOfWork {
        UnitOfWork::new(id, id).with_touches(touches.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_literal_overlap() {
        assert!(overlaps("src/api.rs", "./src/api.rs"));
        assert!(overlaps("src/api", "src/api/handlers.rs"));
        assert!(overlaps("src/api/", "src/api/handlers.rs"));
        assert!(!overlaps("src/api.rs", "src/api_v2.rs"));
        assert!(!overlaps("src/ap", "src/api/mod.rs"));
    }

    #[test]
    fn test_glob_overlap() {
        assert!(overlaps("src/**/*.rs", "src/db/pool.rs"));
        assert!(!overlaps("src/**/*.rs", "docs/readme.md"));
        assert!(overlaps("migrations/*.sql", "migrations"));
        assert!(overlaps("src/api/**", "src/**/*.rs"));
        assert!(!overlaps("web/*.ts", "server/*.rs"));
    }

    #[test]
    fn test_detect_pairs_once() {
        let units = vec![
            unit("a", &["src/db/**"]),
            unit("b", &["src/db/pool.rs"]),
            unit("c", &["docs/guide.md"]),
        ];
        let risks = detect(&units);
        assert_eq!(risks.len(), 1);
        assert_eq!(risks[0].unit_id, UnitId::from("a"));
        assert_eq!(risks[0].other, UnitId::from("b"));
        assert_eq!(risks[0].paths, vec!["src/db/**".to_string()]);
    }

    #[test]
    fn test_risks_for_candidate() {
        let candidate = unit("n", &["Cargo.toml", "src/lib.rs"]);
        let in_flight = vec![unit("x", &["Cargo.toml"]), unit("y", &["README.md"])];
        let risks = risks_for(&candidate, &in_flight);
        assert_eq!(risks.len(), 1);
        assert_eq!(risks[0].other, UnitId::from("x"));
        assert!(risks_for(&unit("z", &[]), &in_flight).is_empty());
    }
}
