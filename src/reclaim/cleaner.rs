use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytesize::ByteSize;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::task;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::backup::BackupStore;
use super::safety::{ApprovedAction, GateReview};
use super::types::{Action, ActionKind};
use crate::config::{EngineConfig, PolicyConfig};
use crate::error::ApplyError;

/// Re-encodes a photo in place and returns the bytes saved.
pub trait PhotoOptimizer: Send + Sync {
    fn optimize(&self, path: &Path) -> Result<u64, String>;
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyState {
    Applied,
    SkippedUnsafe,
    Failed,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ApplyEntry {
    pub target_path: PathBuf,
    pub kind: ActionKind,
    pub state: ApplyState,
    pub reason: Option<String>,
    pub bytes_freed: u64,
    pub backup_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub run_id: Uuid,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Sorted by target path.
    pub entries: Vec<ApplyEntry>,
    pub bytes_freed: u64,
}

impl ApplyReport {
    pub fn count(&self, state: ApplyState) -> usize {
        self.entries.iter().filter(|e| e.state == state).count()
    }

    pub fn entry_for(&self, path: &Path) -> Option<&ApplyEntry> {
        self.entries.iter().find(|e| e.target_path == path)
    }
}

struct Outcome {
    bytes_freed: u64,
    backup_path: Option<PathBuf>,
}

#[derive(Clone)]
struct ApplyContext {
    dry_run: bool,
    backups: Option<BackupStore>,
    optimizer: Option<Arc<dyn PhotoOptimizer>>,
}

/// Carries out gate-approved actions. Rejected actions are only reported.
pub struct Cleaner {
    run_id: Uuid,
    workers: usize,
    ctx: ApplyContext,
}

impl Cleaner {
    pub fn new(policy: &PolicyConfig, engine: &EngineConfig) -> Self {
        let run_id = Uuid::new_v4();
        let backups = policy
            .resolved_backup_dir()
            .map(|base| BackupStore::new(&base, run_id, engine.hash_buffer_bytes()));
        Cleaner {
            run_id,
            workers: engine.workers(),
            ctx: ApplyContext {
                dry_run: policy.dry_run,
                backups,
                optimizer: None,
            },
        }
    }

    pub fn with_optimizer(mut self, optimizer: Arc<dyn PhotoOptimizer>) -> Self {
        self.ctx.optimizer = Some(optimizer);
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub async fn apply(&self, review: GateReview, token: &CancellationToken) -> ApplyReport {
        let started_at = Utc::now();
        let GateReview { approved, rejected } = review;

        let mut entries: Vec<ApplyEntry> = rejected
            .into_iter()
            .map(|r| ApplyEntry {
                target_path: r.action.target_path,
                kind: r.action.kind,
                state: ApplyState::SkippedUnsafe,
                reason: Some(r.reason.to_string()),
                bytes_freed: 0,
                backup_path: None,
            })
            .collect();

        let results: Vec<ApplyEntry> = stream::iter(approved)
            .map(|approved| {
                let ctx = self.ctx.clone();
                let token = token.clone();
                async move {
                    let action = approved.action().clone();
                    // Checked when the action is scheduled, not when it finishes.
                    if token.is_cancelled() {
                        return entry(&action, Err(ApplyError::Cancelled));
                    }
                    let outcome = task::spawn_blocking(move || execute(&approved, &ctx, &token))
                        .await
                        .map_err(ApplyError::from)
                        .and_then(|r| r);
                    entry(&action, outcome)
                }
            })
            .buffered(self.workers)
            .collect()
            .await;

        entries.extend(results);
        entries.sort_by(|a, b| a.target_path.cmp(&b.target_path));

        let bytes_freed = entries
            .iter()
            .filter(|e| e.state == ApplyState::Applied)
            .map(|e| e.bytes_freed)
            .sum();
        let report = ApplyReport {
            run_id: self.run_id,
            dry_run: self.ctx.dry_run,
            started_at,
            finished_at: Utc::now(),
            entries,
            bytes_freed,
        };
        log::info!(
            "Apply run {}{}: {} applied, {} skipped, {} failed, {} freed",
            report.run_id,
            if report.dry_run { " (dry run)" } else { "" },
            report.count(ApplyState::Applied),
            report.count(ApplyState::SkippedUnsafe),
            report.count(ApplyState::Failed),
            ByteSize(report.bytes_freed)
        );
        report
    }
}

fn entry(action: &Action, outcome: Result<Outcome, ApplyError>) -> ApplyEntry {
    match outcome {
        Ok(done) => ApplyEntry {
            target_path: action.target_path.clone(),
            kind: action.kind,
            state: ApplyState::Applied,
            reason: None,
            bytes_freed: done.bytes_freed,
            backup_path: done.backup_path,
        },
        Err(err) => {
            log::warn!(
                "Failed to apply {:?} to {}: {}",
                action.kind,
                action.target_path.display(),
                err
            );
            ApplyEntry {
                target_path: action.target_path.clone(),
                kind: action.kind,
                state: ApplyState::Failed,
                reason: Some(err.to_string()),
                bytes_freed: 0,
                backup_path: None,
            }
        }
    }
}

/// Dry runs walk the same checks and report the same bytes, but stop short of
/// every filesystem mutation.
fn execute(
    approved: &ApprovedAction,
    ctx: &ApplyContext,
    token: &CancellationToken,
) -> Result<Outcome, ApplyError> {
    let action = approved.action();
    let path = action.target_path.as_path();
    match fs::symlink_metadata(path) {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(ApplyError::Missing),
        Err(err) => return Err(ApplyError::Remove(err)),
    }

    match action.kind {
        ActionKind::Delete => {
            if !ctx.dry_run {
                fs::remove_file(path).map_err(ApplyError::Remove)?;
            }
            Ok(Outcome {
                bytes_freed: action.estimated_bytes_freed,
                backup_path: None,
            })
        }
        ActionKind::BackupThenDelete => {
            let store = ctx.backups.as_ref().ok_or(ApplyError::NoBackupLocation)?;
            let backup_path = if ctx.dry_run {
                store.location_for(path)
            } else {
                let copy = store.backup(path, token)?;
                fs::remove_file(path).map_err(ApplyError::Remove)?;
                copy
            };
            Ok(Outcome {
                bytes_freed: action.estimated_bytes_freed,
                backup_path: Some(backup_path),
            })
        }
        ActionKind::Optimize => {
            let optimizer = ctx.optimizer.as_ref().ok_or(ApplyError::NoOptimizer)?;
            let bytes_freed = if ctx.dry_run {
                action.estimated_bytes_freed
            } else {
                optimizer.optimize(path).map_err(ApplyError::Optimize)?
            };
            Ok(Outcome {
                bytes_freed,
                backup_path: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reclaim::safety::{approve_unchecked, RejectedAction, RejectionReason};
    use crate::reclaim::types::{Category, CategorySet, SavingsBasis};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn action(path: PathBuf, kind: ActionKind, bytes: u64) -> Action {
        Action {
            target_path: path,
            kind,
            estimated_bytes_freed: bytes,
            basis: SavingsBasis::Measured,
            origin_category: Category::Old,
            categories: [Category::Old].into_iter().collect::<CategorySet>(),
            modified: Utc::now(),
        }
    }

    fn policy(temp: &TempDir, dry_run: bool) -> PolicyConfig {
        PolicyConfig {
            dry_run,
            backup_dir: Some(temp.path().join("backups")),
            ..PolicyConfig::default()
        }
    }

    fn review(actions: Vec<Action>) -> GateReview {
        GateReview {
            approved: actions.into_iter().map(approve_unchecked).collect(),
            rejected: Vec::new(),
        }
    }

    fn file(temp: &TempDir, name: &str, body: &[u8]) -> PathBuf {
        let path = temp.path().join("data").join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn backup_then_delete_keeps_a_verified_copy() {
        let temp = TempDir::new().unwrap();
        let target = file(&temp, "old.iso", &[3u8; 5_000]);
        let cleaner = Cleaner::new(&policy(&temp, false), &EngineConfig::default());

        let report = cleaner
            .apply(
                review(vec![action(target.clone(), ActionKind::BackupThenDelete, 5_000)]),
                &CancellationToken::new(),
            )
            .await;

        let entry = report.entry_for(&target).unwrap();
        assert_eq!(entry.state, ApplyState::Applied);
        assert!(!target.exists());
        let copy = entry.backup_path.as_ref().unwrap();
        assert_eq!(fs::read(copy).unwrap(), vec![3u8; 5_000]);
        assert!(copy.starts_with(temp.path().join("backups").join(report.run_id.to_string())));
        assert_eq!(report.bytes_freed, 5_000);
    }

    #[tokio::test]
    async fn failed_backup_never_deletes() {
        let temp = TempDir::new().unwrap();
        let target = file(&temp, "keep.bin", b"precious");
        // A regular file where the backup directory should be.
        let blocker = temp.path().join("blocker");
        fs::write(&blocker, b"").unwrap();
        let policy = PolicyConfig {
            backup_dir: Some(blocker),
            ..PolicyConfig::default()
        };

        let report = Cleaner::new(&policy, &EngineConfig::default())
            .apply(
                review(vec![action(target.clone(), ActionKind::BackupThenDelete, 8)]),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(report.entries[0].state, ApplyState::Failed);
        assert!(report.entries[0]
            .reason
            .as_deref()
            .unwrap()
            .starts_with("backup copy failed"));
        assert_eq!(fs::read(&target).unwrap(), b"precious");
    }

    #[tokio::test]
    async fn dry_run_matches_live_accounting_without_mutation() {
        let temp = TempDir::new().unwrap();
        let a = file(&temp, "a.tmp", b"aaaa");
        let b = file(&temp, "b.iso", b"bbbbbbbb");
        let actions = vec![
            action(a.clone(), ActionKind::Delete, 4),
            action(b.clone(), ActionKind::BackupThenDelete, 8),
        ];

        let dry = Cleaner::new(&policy(&temp, true), &EngineConfig::default())
            .apply(review(actions.clone()), &CancellationToken::new())
            .await;
        assert!(a.exists() && b.exists());
        assert!(!temp.path().join("backups").exists());

        let live = Cleaner::new(&policy(&temp, false), &EngineConfig::default())
            .apply(review(actions), &CancellationToken::new())
            .await;
        assert!(!a.exists() && !b.exists());

        let summary = |r: &ApplyReport| -> Vec<(PathBuf, ApplyState, u64)> {
            r.entries
                .iter()
                .map(|e| (e.target_path.clone(), e.state, e.bytes_freed))
                .collect()
        };
        assert_eq!(summary(&dry), summary(&live));
        assert!(dry.dry_run && !live.dry_run);
    }

    #[tokio::test]
    async fn rejected_and_cancelled_actions_are_reported() {
        let temp = TempDir::new().unwrap();
        let a = file(&temp, "a.log", b"a");
        let b = file(&temp, "b.log", b"b");
        let mut gate_review = review(vec![action(a.clone(), ActionKind::Delete, 1)]);
        gate_review.rejected.push(RejectedAction {
            action: action(b.clone(), ActionKind::Delete, 1),
            reason: RejectionReason::OutsideWhitelist,
        });
        let token = CancellationToken::new();
        token.cancel();

        let report = Cleaner::new(&policy(&temp, false), &EngineConfig::default())
            .apply(gate_review, &token)
            .await;

        let first = report.entry_for(&a).unwrap();
        assert_eq!(first.state, ApplyState::Failed);
        assert_eq!(first.reason.as_deref(), Some("apply cancelled"));
        let second = report.entry_for(&b).unwrap();
        assert_eq!(second.state, ApplyState::SkippedUnsafe);
        assert_eq!(second.reason.as_deref(), Some("not under any whitelisted root"));
        assert!(a.exists() && b.exists());
    }

    struct Shrinker {
        calls: AtomicUsize,
    }

    impl PhotoOptimizer for Shrinker {
        fn optimize(&self, _path: &Path) -> Result<u64, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        }
    }

    #[tokio::test]
    async fn optimize_needs_a_collaborator() {
        let temp = TempDir::new().unwrap();
        let pic = file(&temp, "p.png", b"png");
        let mut optimize = action(pic.clone(), ActionKind::Optimize, 10);
        optimize.basis = SavingsBasis::Estimated;

        let bare = Cleaner::new(&policy(&temp, false), &EngineConfig::default())
            .apply(review(vec![optimize.clone()]), &CancellationToken::new())
            .await;
        assert_eq!(
            bare.entries[0].reason.as_deref(),
            Some("no photo optimizer configured")
        );

        let shrinker = Arc::new(Shrinker {
            calls: AtomicUsize::new(0),
        });
        let report = Cleaner::new(&policy(&temp, false), &EngineConfig::default())
            .with_optimizer(shrinker.clone())
            .apply(review(vec![optimize]), &CancellationToken::new())
            .await;
        assert_eq!(report.entries[0].state, ApplyState::Applied);
        assert_eq!(report.entries[0].bytes_freed, 42);
        assert_eq!(shrinker.calls.load(Ordering::SeqCst), 1);
    }
}
