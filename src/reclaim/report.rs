use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use super::duplicate_detector::DuplicateScanResult;
use super::photo_analyzer::{PhotoEstimate, PhotoScanResult};
use super::types::{
    Action, ActionKind, Category, CategoryReport, CategorySet, FileDescriptor, SavingsBasis,
    ScanResult,
};
use crate::config::PolicyConfig;
use crate::error::SkipEvent;
use crate::ops::RunStatus;

/// Everything the earlier stages produced for one run.
pub struct StageOutputs<'a> {
    pub root_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub files: &'a [FileDescriptor],
    pub walk_skipped: Vec<SkipEvent>,
    pub walk_truncated: bool,
    pub duplicates: DuplicateScanResult,
    pub photos: PhotoScanResult,
}

/// Folds stage outputs into one [`ScanResult`]. Pure: the same inputs give the
/// same result field for field.
pub struct ReportAggregator<'p> {
    policy: &'p PolicyConfig,
}

impl<'p> ReportAggregator<'p> {
    pub fn new(policy: &'p PolicyConfig) -> Self {
        ReportAggregator { policy }
    }

    pub fn aggregate(&self, outputs: StageOutputs<'_>) -> ScanResult {
        let StageOutputs {
            root_path,
            started_at,
            finished_at,
            files,
            walk_skipped,
            walk_truncated,
            mut duplicates,
            photos,
        } = outputs;

        for group in &mut duplicates.groups {
            for member in &mut group.members {
                member.categories.insert(Category::Duplicate);
            }
        }

        let categories = category_totals(files, &duplicates);
        let candidate_actions = self.derive_actions(files, &duplicates, &photos.estimates);

        let actionable_bytes = candidate_actions
            .iter()
            .filter(|a| a.basis == SavingsBasis::Measured)
            .map(|a| a.estimated_bytes_freed)
            .sum();
        let estimated_photo_savings = photos.estimates.iter().map(|e| e.estimated_savings).sum();

        let mut skipped = walk_skipped;
        skipped.extend(duplicates.skipped);
        skipped.sort();

        let truncated = walk_truncated || duplicates.truncated || photos.truncated;

        ScanResult {
            root_path,
            started_at,
            finished_at,
            status: if truncated {
                RunStatus::CompletedTruncated
            } else {
                RunStatus::Completed
            },
            total_files_seen: files.len(),
            total_bytes_seen: files.iter().map(|f| f.size).sum(),
            categories,
            duplicate_groups: duplicates.groups,
            photo_estimates: photos.estimates,
            candidate_actions,
            actionable_bytes,
            estimated_photo_savings,
            hashed_files: duplicates.hashed_files,
            hashed_bytes: duplicates.hashed_bytes,
            skipped,
        }
    }

    /// At most one action per path. Duplicate removal outranks cache/temp/log
    /// removal, which outranks large/old cleanup, which outranks photo
    /// optimization. Retained duplicate copies never get an action.
    fn derive_actions(
        &self,
        files: &[FileDescriptor],
        duplicates: &DuplicateScanResult,
        estimates: &[PhotoEstimate],
    ) -> Vec<Action> {
        let retained: HashSet<&PathBuf> = duplicates.groups.iter().map(|g| &g.retained).collect();
        let mut actions: BTreeMap<PathBuf, Action> = BTreeMap::new();

        for group in &duplicates.groups {
            for member in group.redundant_members() {
                actions.insert(
                    member.path.clone(),
                    Action {
                        target_path: member.path.clone(),
                        kind: ActionKind::Delete,
                        estimated_bytes_freed: member.size,
                        basis: SavingsBasis::Measured,
                        origin_category: Category::Duplicate,
                        categories: member.categories.clone(),
                        modified: member.modified,
                    },
                );
            }
        }

        let estimates: HashMap<&PathBuf, &PhotoEstimate> =
            estimates.iter().map(|e| (&e.path, e)).collect();

        for file in files {
            if retained.contains(&file.path) || actions.contains_key(&file.path) {
                continue;
            }
            if let Some(action) = self.action_for(file, estimates.get(&file.path).copied()) {
                actions.insert(file.path.clone(), action);
            }
        }

        actions.into_values().collect()
    }

    fn action_for(&self, file: &FileDescriptor, estimate: Option<&PhotoEstimate>) -> Option<Action> {
        let tags = &file.categories;
        let measured = |kind, origin| Action {
            target_path: file.path.clone(),
            kind,
            estimated_bytes_freed: file.size,
            basis: SavingsBasis::Measured,
            origin_category: origin,
            categories: tags.clone(),
            modified: file.modified,
        };

        if let Some(origin) = first_of(tags, &[Category::Cache, Category::Temp, Category::Log]) {
            return Some(measured(ActionKind::Delete, origin));
        }
        if let Some(origin) = first_of(tags, &[Category::Large, Category::Old]) {
            let kind = if self.policy.backup_before_delete {
                ActionKind::BackupThenDelete
            } else {
                ActionKind::Delete
            };
            return Some(measured(kind, origin));
        }
        match estimate {
            Some(estimate)
                if self.policy.include_photo_optimizations && tags.contains(Category::Photo) =>
            {
                Some(Action {
                    target_path: file.path.clone(),
                    kind: ActionKind::Optimize,
                    estimated_bytes_freed: estimate.estimated_savings,
                    basis: SavingsBasis::Estimated,
                    origin_category: Category::Photo,
                    categories: tags.clone(),
                    modified: file.modified,
                })
            }
            _ => None,
        }
    }
}

fn first_of(tags: &CategorySet, order: &[Category]) -> Option<Category> {
    order.iter().copied().find(|c| tags.contains(*c))
}

/// Duplicate totals count only redundant copies.
fn category_totals(files: &[FileDescriptor], duplicates: &DuplicateScanResult) -> Vec<CategoryReport> {
    Category::ALL
        .iter()
        .map(|&category| {
            let (count, bytes) = if category == Category::Duplicate {
                duplicates.groups.iter().fold((0, 0), |(count, bytes), group| {
                    (count + group.members.len() - 1, bytes + group.total_reclaimable)
                })
            } else {
                files
                    .iter()
                    .filter(|f| f.categories.contains(category))
                    .fold((0, 0), |(count, bytes), f| (count + 1, bytes + f.size))
            };
            CategoryReport {
                category,
                count,
                bytes,
            }
        })
        .collect()
}
