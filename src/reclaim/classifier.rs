use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use regex::{Regex, RegexSet};

use super::types::{Category, CategoryRules, CategorySet, FileDescriptor};
use crate::config::PolicyConfig;
use crate::error::EngineError;

/// Compiled category tables. Classification is purely descriptive: it never
/// decides whether anything may be removed.
#[derive(Debug, Clone)]
pub struct Classifier {
    cache: PatternTable,
    temp: PatternTable,
    log: PatternTable,
    photo_extensions: HashSet<String>,
}

impl Classifier {
    pub fn new(rules: &CategoryRules) -> Result<Self, EngineError> {
        let patterns = rules.active_patterns();
        Ok(Classifier {
            cache: PatternTable::compile(&patterns.cache)?,
            temp: PatternTable::compile(&patterns.temp)?,
            log: PatternTable::compile(&patterns.log)?,
            photo_extensions: rules
                .photo_extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect(),
        })
    }

    /// Directory tables only count matches reaching below `scan_root`, so a
    /// root that itself lives under `/tmp` or `.cache` does not tag every file.
    pub fn classify(
        &self,
        file: &FileDescriptor,
        scan_root: &Path,
        policy: &PolicyConfig,
        now: DateTime<Utc>,
    ) -> CategorySet {
        let mut tags = CategorySet::new();
        let normalized = normalize(&file.path);
        let relative_start = relative_start(&normalized, scan_root);

        if self.cache.matches_below(&normalized, relative_start) {
            tags.insert(Category::Cache);
        }
        if self.temp.matches_below(&normalized, relative_start) {
            tags.insert(Category::Temp);
        }
        if self.log.matches_below(&normalized, relative_start) {
            tags.insert(Category::Log);
        }

        if file.size > policy.large_file_threshold_bytes {
            tags.insert(Category::Large);
        }

        let age = file.age(now);
        if age > policy.old_file_age() && age > policy.min_file_age() {
            tags.insert(Category::Old);
        }

        if self.is_photo(&file.path) {
            tags.insert(Category::Photo);
        }

        tags
    }

    pub fn is_photo(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.photo_extensions.contains(&ext.to_lowercase()))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
struct PatternTable {
    set: RegexSet,
    each: Vec<Regex>,
}

impl PatternTable {
    fn compile(patterns: &[String]) -> Result<Self, EngineError> {
        let each = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| EngineError::CategoryPattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let set = RegexSet::new(patterns).map_err(|source| EngineError::CategoryPattern {
            pattern: patterns.join(" | "),
            source,
        })?;
        Ok(PatternTable { set, each })
    }

    /// True when some match ends past byte `relative_start` of `haystack`.
    fn matches_below(&self, haystack: &str, relative_start: usize) -> bool {
        self.set.matches(haystack).into_iter().any(|index| {
            let regex = &self.each[index];
            let mut start = 0;
            while start <= haystack.len() {
                let Some(found) = regex.find_at(haystack, start) else {
                    return false;
                };
                if found.end() > relative_start {
                    return true;
                }
                // Overlapping candidates: retry one character further on.
                start = found.start()
                    + haystack[found.start()..]
                        .chars()
                        .next()
                        .map_or(1, char::len_utf8);
            }
            false
        })
    }
}

/// Byte offset of the first character below `scan_root` in `normalized`.
fn relative_start(normalized: &str, scan_root: &Path) -> usize {
    let root = normalize(scan_root);
    let root = root.trim_end_matches('/');
    match normalized.strip_prefix(root) {
        Some(rest) if rest.starts_with('/') => root.len() + 1,
        _ => 0,
    }
}

/// Lowercase, forward-slash form the directory tables are written against.
fn normalize(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/").to_lowercase()
}
