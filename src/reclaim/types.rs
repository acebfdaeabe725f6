use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, SkipEvent};
use crate::ops::RunStatus;

use super::photo_analyzer::PhotoEstimate;

pub const RULES_OVERRIDE_ENV: &str = "RECLAIM_RULES_OVERRIDE";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Cache,
    Temp,
    Log,
    Photo,
    Large,
    Old,
    Duplicate,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Cache,
        Category::Temp,
        Category::Log,
        Category::Photo,
        Category::Large,
        Category::Old,
        Category::Duplicate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Cache => "cache",
            Category::Temp => "temp",
            Category::Log => "log",
            Category::Photo => "photo",
            Category::Large => "large",
            Category::Old => "old",
            Category::Duplicate => "duplicate",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered set of tags; iteration follows [`Category::ALL`] order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct CategorySet(BTreeSet<Category>);

impl CategorySet {
    pub fn new() -> Self {
        CategorySet(BTreeSet::new())
    }

    pub fn insert(&mut self, category: Category) {
        self.0.insert(category);
    }

    pub fn contains(&self, category: Category) -> bool {
        self.0.contains(&category)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Category> + '_ {
        self.0.iter().copied()
    }

    pub fn merged(&self, other: &CategorySet) -> CategorySet {
        CategorySet(self.0.union(&other.0).copied().collect())
    }
}

impl FromIterator<Category> for CategorySet {
    fn from_iter<I: IntoIterator<Item = Category>>(iter: I) -> Self {
        CategorySet(iter.into_iter().collect())
    }
}

/// One regular file seen by the walk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileDescriptor {
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub categories: CategorySet,
}

impl FileDescriptor {
    pub fn new(path: PathBuf, size: u64, modified: DateTime<Utc>) -> Self {
        FileDescriptor {
            path,
            size,
            modified,
            categories: CategorySet::new(),
        }
    }

    pub fn with_categories(self, categories: CategorySet) -> Self {
        FileDescriptor { categories, ..self }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.modified)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DuplicateGroup {
    /// Hex SHA-256 of the content.
    pub content_hash: String,
    pub size: u64,
    /// Sorted by path.
    pub members: Vec<FileDescriptor>,
    pub retained: PathBuf,
    pub total_reclaimable: u64,
}

impl DuplicateGroup {
    pub fn redundant_members(&self) -> impl Iterator<Item = &FileDescriptor> {
        self.members.iter().filter(move |m| m.path != self.retained)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Delete,
    BackupThenDelete,
    Optimize,
}

/// Whether a byte figure comes from file sizes or from a heuristic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SavingsBasis {
    Measured,
    Estimated,
}

/// A proposed operation on one path. Not authorized until the safety gate
/// approves it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Action {
    pub target_path: PathBuf,
    pub kind: ActionKind,
    pub estimated_bytes_freed: u64,
    pub basis: SavingsBasis,
    pub origin_category: Category,
    pub categories: CategorySet,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CategoryReport {
    pub category: Category,
    pub count: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub root_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub total_files_seen: usize,
    pub total_bytes_seen: u64,
    /// One entry per [`Category::ALL`] member, in that order.
    pub categories: Vec<CategoryReport>,
    pub duplicate_groups: Vec<DuplicateGroup>,
    pub photo_estimates: Vec<PhotoEstimate>,
    /// Sorted by target path; at most one per path.
    pub candidate_actions: Vec<Action>,
    /// Sum of measured action bytes.
    pub actionable_bytes: u64,
    /// Sum of heuristic photo savings. Never folded into `actionable_bytes`.
    pub estimated_photo_savings: u64,
    pub hashed_files: usize,
    pub hashed_bytes: u64,
    pub skipped: Vec<SkipEvent>,
}

impl ScanResult {
    pub fn is_truncated(&self) -> bool {
        self.status == RunStatus::CompletedTruncated
    }

    pub fn category(&self, category: Category) -> Option<&CategoryReport> {
        self.categories.iter().find(|c| c.category == category)
    }

    pub fn action_for(&self, path: &Path) -> Option<&Action> {
        self.candidate_actions
            .iter()
            .find(|a| a.target_path == path)
    }
}

// -------- Category Rule Types & Helpers --------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlatformPatterns {
    #[serde(default)]
    pub cache: Vec<String>,
    #[serde(default)]
    pub temp: Vec<String>,
    #[serde(default)]
    pub log: Vec<String>,
}

/// Directory and extension tables that drive classification.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CategoryRules {
    #[serde(default)]
    pub platforms: BTreeMap<String, PlatformPatterns>,
    #[serde(default)]
    pub photo_extensions: Vec<String>,
}

impl CategoryRules {
    pub fn from_json_str(raw: &str) -> Result<Self, EngineError> {
        serde_json::from_str(raw).map_err(EngineError::Rules)
    }

    /// Embedded tables, or the file named by `RECLAIM_RULES_OVERRIDE`.
    pub fn load() -> Result<Self, EngineError> {
        if let Ok(path) = std::env::var(RULES_OVERRIDE_ENV) {
            let path = PathBuf::from(path);
            let raw = fs::read_to_string(&path)
                .map_err(|source| EngineError::ConfigRead { path, source })?;
            return Self::from_json_str(&raw);
        }
        Self::embedded()
    }

    /// The tables shipped with the crate.
    pub fn embedded() -> Result<Self, EngineError> {
        Self::from_json_str(include_str!("../../rules/category_rules.json"))
    }

    /// Patterns for `any` plus the running platform.
    pub fn active_patterns(&self) -> PlatformPatterns {
        let mut merged = PlatformPatterns::default();
        for key in ["any", current_platform()] {
            if let Some(table) = self.platforms.get(key) {
                merged.cache.extend(table.cache.iter().cloned());
                merged.temp.extend(table.temp.iter().cloned());
                merged.log.extend(table.log.iter().cloned());
            }
        }
        merged
    }
}

pub(crate) fn current_platform() -> &'static str {
    if cfg!(target_os = "macos") {
        "macos"
    } else if cfg!(target_os = "windows") {
        "windows"
    } else {
        "linux"
    }
}
