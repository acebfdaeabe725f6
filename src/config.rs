// src/config.rs

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Depth cap applied when `quick_mode` is set.
pub const QUICK_MODE_MAX_DEPTH: usize = 3;

/// Which member of a duplicate group is kept.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Lowest path in lexical order.
    #[default]
    LexicalFirst,
    /// Earliest modification time; lexical order breaks ties.
    OldestModified,
}

/// Per-run policy supplied by the embedding application. Read-only to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub whitelist_paths: Vec<PathBuf>,
    pub enforce_whitelist: bool,
    pub blacklist_paths: Vec<PathBuf>,
    pub exclude_patterns: Vec<String>,
    pub max_scan_depth: usize,
    /// `None` disables the deadline.
    pub scan_timeout_secs: Option<u64>,
    pub min_file_age_hours: u64,
    pub quick_mode: bool,
    pub dry_run: bool,
    pub large_file_threshold_bytes: u64,
    pub old_file_age_days: u64,
    pub follow_symlinks: bool,
    pub validate_file_signatures: bool,
    pub backup_before_delete: bool,
    pub backup_dir: Option<PathBuf>,
    pub retention: RetentionPolicy,
    pub include_photo_optimizations: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig {
            whitelist_paths: Vec::new(),
            enforce_whitelist: true,
            blacklist_paths: [
                "/System/Library",
                "/Library",
                "/bin",
                "/sbin",
                "/usr/bin",
                "/usr/sbin",
            ]
            .iter()
            .map(PathBuf::from)
            .collect(),
            exclude_patterns: vec![
                "*.important".to_string(),
                "backup/*".to_string(),
                "*.backup".to_string(),
                "*.bak".to_string(),
            ],
            max_scan_depth: 10,
            scan_timeout_secs: Some(300),
            min_file_age_hours: 24,
            quick_mode: false,
            dry_run: false,
            large_file_threshold_bytes: 10 * 1024 * 1024,
            old_file_age_days: 90,
            follow_symlinks: false,
            validate_file_signatures: true,
            backup_before_delete: true,
            backup_dir: None,
            retention: RetentionPolicy::LexicalFirst,
            include_photo_optimizations: false,
        }
    }
}

impl PolicyConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, EngineError> {
        let policy: PolicyConfig = serde_json::from_str(raw).map_err(EngineError::Policy)?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, EngineError> {
        let raw = fs::read_to_string(path).map_err(|source| EngineError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Checks everything that would otherwise fail mid-run.
    pub fn validate(&self) -> Result<(), EngineError> {
        self.exclude_matcher().map(|_| ())
    }

    pub fn effective_max_depth(&self) -> usize {
        if self.quick_mode {
            self.max_scan_depth.min(QUICK_MODE_MAX_DEPTH)
        } else {
            self.max_scan_depth
        }
    }

    pub fn scan_timeout(&self) -> Option<Duration> {
        self.scan_timeout_secs.map(Duration::from_secs)
    }

    pub fn min_file_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.min_file_age_hours.min(i64::MAX as u64) as i64)
    }

    pub fn old_file_age(&self) -> chrono::Duration {
        chrono::Duration::days(self.old_file_age_days.min(i64::MAX as u64 / 86_400) as i64)
    }

    /// Compiles `exclude_patterns` for matching against paths relative to the
    /// scan root. `*` never crosses a separator. A pattern with a leading `/`
    /// is anchored at the scan root; any other pattern may match at any depth.
    pub fn exclude_matcher(&self) -> Result<GlobSet, EngineError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.exclude_patterns {
            let expanded = match pattern.strip_prefix('/') {
                Some(anchored) => anchored.to_string(),
                None if pattern.starts_with("**") => pattern.clone(),
                None => format!("**/{}", pattern),
            };
            let glob = GlobBuilder::new(&expanded)
                .literal_separator(true)
                .build()
                .map_err(|source| EngineError::ExcludePattern {
                    pattern: pattern.clone(),
                    source,
                })?;
            builder.add(glob);
        }
        builder
            .build()
            .map_err(|source| EngineError::ExcludePattern {
                pattern: self.exclude_patterns.join(", "),
                source,
            })
    }

    pub fn resolved_backup_dir(&self) -> Option<PathBuf> {
        self.backup_dir.clone().or_else(|| {
            dirs::data_local_dir().map(|dir| dir.join("reclaim-engine").join("backups"))
        })
    }
}

/// Resource caps for the worker pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // Parallelism
    pub max_workers: usize, // Default: num_cpus::get()
    pub queue_capacity: usize, // Default: 1024 descriptors in flight

    // I/O
    pub hash_buffer_bytes: usize, // Default: 64KB
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_workers: num_cpus::get(),
            queue_capacity: 1024,
            hash_buffer_bytes: 64 * 1024,
        }
    }
}

impl EngineConfig {
    pub fn workers(&self) -> usize {
        self.max_workers.max(1)
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.max(1)
    }

    pub fn hash_buffer_bytes(&self) -> usize {
        self.hash_buffer_bytes.max(4096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_defaults_fill_missing_fields() {
        let policy = PolicyConfig::from_json_str(r#"{ "dry_run": true, "max_scan_depth": 4 }"#)
            .expect("policy should parse");
        assert!(policy.dry_run);
        assert_eq!(policy.max_scan_depth, 4);
        assert_eq!(policy.min_file_age_hours, 24);
        assert_eq!(policy.retention, RetentionPolicy::LexicalFirst);
    }

    #[test]
    fn quick_mode_caps_depth() {
        let policy = PolicyConfig {
            quick_mode: true,
            ..PolicyConfig::default()
        };
        assert_eq!(policy.effective_max_depth(), QUICK_MODE_MAX_DEPTH);
    }

    #[test]
    fn exclude_patterns_match_names_and_subtrees() {
        let matcher = PolicyConfig::default()
            .exclude_matcher()
            .expect("default globs compile");
        assert!(matcher.is_match("notes.important"));
        assert!(matcher.is_match("data/notes.important"));
        assert!(matcher.is_match("backup/old.txt"));
        assert!(matcher.is_match("data/backup/old.txt"));
        assert!(matcher.is_match("data/db.bak"));
        assert!(!matcher.is_match("data/notes.txt"));
        // `*` stops at a separator, so only direct children of `backup` match.
        assert!(!matcher.is_match("backup/sub/deep.txt"));
    }

    #[test]
    fn leading_slash_anchors_at_scan_root() {
        let policy = PolicyConfig {
            exclude_patterns: vec!["/build/*".into()],
            ..PolicyConfig::default()
        };
        let matcher = policy.exclude_matcher().expect("glob compiles");
        assert!(matcher.is_match("build/out.o"));
        assert!(!matcher.is_match("src/build/out.o"));
    }

    #[test]
    fn malformed_glob_is_rejected() {
        let err = PolicyConfig::from_json_str(r#"{ "exclude_patterns": ["a[b"] }"#)
            .expect_err("unterminated class must fail");
        assert!(matches!(err, EngineError::ExcludePattern { .. }));
    }
}
