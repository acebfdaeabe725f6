use super::*;
use crate::config::{EngineConfig, PolicyConfig};
use crate::error::EngineError;
use crate::ops::RunStatus;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// Small tables keep assertions independent of the per-platform lists.
const TEST_RULES: &str = r#"{
    "platforms": {
        "any": {
            "cache": ["/cache/"],
            "temp": ["\\.tmp$"],
            "log": ["\\.log$"]
        }
    },
    "photo_extensions": ["jpg", "png"]
}"#;

#[derive(Default)]
struct CountingHasher {
    seen: Mutex<Vec<PathBuf>>,
}

impl ContentHasher for CountingHasher {
    fn hash_file(&self, path: &Path, buffer_bytes: usize) -> io::Result<ContentDigest> {
        self.seen.lock().unwrap().push(path.to_path_buf());
        Sha256Hasher.hash_file(path, buffer_bytes)
    }
}

fn rules() -> CategoryRules {
    CategoryRules::from_json_str(TEST_RULES).unwrap()
}

fn write(root: &Path, relative: &str, body: &[u8]) -> PathBuf {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, body).unwrap();
    path
}

fn age_days(path: &Path, days: u64) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - Duration::from_secs(days * 86_400))
        .unwrap();
}

fn engine(policy: PolicyConfig) -> ReclaimEngine {
    ReclaimEngine::new(policy, EngineConfig::default(), &rules()).unwrap()
}

#[tokio::test]
async fn duplicate_scenario_groups_only_identical_content() {
    let temp = TempDir::new().unwrap();
    write(temp.path(), "a/1.txt", b"0123456789");
    write(temp.path(), "a/2.txt", b"0123456789");
    write(temp.path(), "b/3.txt", b"9876543210");
    write(temp.path(), "c/unique.txt", b"only one of this length");

    let hasher = Arc::new(CountingHasher::default());
    let engine = engine(PolicyConfig::default()).with_hasher(hasher.clone());
    let scan = engine
        .scan(temp.path(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(scan.status, RunStatus::Completed);
    assert_eq!(scan.total_files_seen, 4);
    assert_eq!(scan.duplicate_groups.len(), 1);
    let group = &scan.duplicate_groups[0];
    let names: Vec<_> = group
        .members
        .iter()
        .map(|m| m.path.strip_prefix(&scan.root_path).unwrap().to_path_buf())
        .collect();
    assert_eq!(names, vec![PathBuf::from("a/1.txt"), PathBuf::from("a/2.txt")]);
    assert_eq!(group.total_reclaimable, 10);

    let seen = hasher.seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|p| !p.ends_with("c/unique.txt")));
    assert_eq!(scan.hashed_files, 3);
    assert_eq!(scan.hashed_bytes, 30);

    let dup = scan.category(Category::Duplicate).unwrap();
    assert_eq!((dup.count, dup.bytes), (1, 10));
    let action = scan.action_for(&group.members[1].path).unwrap();
    assert_eq!(action.kind, ActionKind::Delete);
    assert!(scan.action_for(&group.retained).is_none());
}

#[tokio::test]
async fn rescanning_an_unchanged_tree_is_deterministic() {
    let temp = TempDir::new().unwrap();
    for i in 0..20 {
        let body = format!("content-{}", i % 4);
        let path = write(temp.path(), &format!("d{}/f{}.dat", i % 3, i), body.as_bytes());
        age_days(&path, 200);
    }
    write(temp.path(), "cache/blob.bin", b"cached");
    write(temp.path(), "logs/app.log", b"line");

    let engine = engine(PolicyConfig::default());
    let token = CancellationToken::new();
    let mut first = engine.scan(temp.path(), &token).await.unwrap();
    let mut second = engine.scan(temp.path(), &token).await.unwrap();

    let epoch = chrono::DateTime::<chrono::Utc>::from_timestamp(0, 0).unwrap();
    for scan in [&mut first, &mut second] {
        scan.started_at = epoch;
        scan.finished_at = epoch;
    }
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
    assert!(!first.duplicate_groups.is_empty());
}

#[tokio::test]
async fn shipped_rules_ignore_where_the_root_lives() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("tmp/project");
    write(&root, "src/main.rs", b"fn main() {}");
    write(&root, "target/cache/blob.bin", b"cached");

    let engine = ReclaimEngine::new(
        PolicyConfig::default(),
        EngineConfig::default(),
        &CategoryRules::embedded().unwrap(),
    )
    .unwrap();
    let scan = engine.scan(&root, &CancellationToken::new()).await.unwrap();

    assert_eq!(scan.total_files_seen, 2);
    assert!(scan.category(Category::Temp).map_or(true, |t| t.count == 0));
    let cache = scan.category(Category::Cache).unwrap();
    assert_eq!((cache.count, cache.bytes), (1, 6));
}

#[tokio::test]
async fn blacklisted_files_are_never_applied() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("tree");
    let big = vec![1u8; 4096];
    let mut protected = Vec::new();
    for name in ["protected/old.log", "protected/dup-a.bin", "protected/dup-b.bin"] {
        let path = write(&root, name, &big);
        age_days(&path, 365);
        protected.push(path);
    }
    let outside = write(&root, "open/dup-c.bin", &big);
    age_days(&outside, 365);

    let policy = PolicyConfig {
        blacklist_paths: vec![root.join("protected")],
        large_file_threshold_bytes: 1024,
        backup_before_delete: false,
        ..PolicyConfig::default()
    };
    let engine = engine(policy);
    let token = CancellationToken::new();
    let scan = engine.scan(&root, &token).await.unwrap();
    assert!(scan.candidate_actions.len() >= 3);

    let review = engine.review(&scan);
    assert!(review
        .rejected
        .iter()
        .all(|r| matches!(r.reason, RejectionReason::Blacklisted { .. })));
    let report = engine.apply(review, &token).await;

    for entry in &report.entries {
        if entry.target_path.starts_with(&scan.root_path.join("protected")) {
            assert_ne!(entry.state, ApplyState::Applied, "{:?}", entry);
        }
    }
    for path in &protected {
        assert!(path.exists(), "{} was removed", path.display());
    }
}

#[cfg(unix)]
#[tokio::test]
async fn followed_symlink_into_blacklisted_root_is_rejected() {
    let temp = TempDir::new().unwrap();
    let victim = write(temp.path(), "protected/cache/precious.bin", b"irreplaceable");
    age_days(&victim, 30);
    let root = temp.path().join("tree");
    fs::create_dir_all(&root).unwrap();
    std::os::unix::fs::symlink(temp.path().join("protected"), root.join("link")).unwrap();

    let engine = engine(PolicyConfig {
        follow_symlinks: true,
        blacklist_paths: vec![temp.path().join("protected")],
        ..PolicyConfig::default()
    });
    let token = CancellationToken::new();
    let scan = engine.scan(&root, &token).await.unwrap();
    let linked = scan.root_path.join("link/cache/precious.bin");
    assert!(scan.action_for(&linked).is_some());

    let review = engine.review(&scan);
    assert!(review.approved.is_empty());
    assert!(matches!(
        review.rejected[0].reason,
        RejectionReason::Blacklisted { .. }
    ));
    let report = engine.apply(review, &token).await;
    assert!(report.entries.iter().all(|e| e.state != ApplyState::Applied));
    assert!(victim.exists());
}

#[tokio::test]
async fn fresh_files_are_rejected_by_age() {
    let temp = TempDir::new().unwrap();
    write(temp.path(), "x/copy-1.bin", b"fresh bytes");
    write(temp.path(), "y/copy-2.bin", b"fresh bytes");

    let engine = engine(PolicyConfig::default());
    let scan = engine
        .scan(temp.path(), &CancellationToken::new())
        .await
        .unwrap();
    let review = engine.review(&scan);
    assert!(review.approved.is_empty());
    assert!(matches!(
        review.rejected[0].reason,
        RejectionReason::TooRecent { .. }
    ));
}

#[tokio::test]
async fn zero_timeout_truncates_without_failing() {
    let temp = TempDir::new().unwrap();
    for i in 0..50 {
        write(temp.path(), &format!("dir{}/file{}.txt", i % 5, i), b"data");
    }
    let engine = engine(PolicyConfig {
        scan_timeout_secs: Some(0),
        ..PolicyConfig::default()
    });

    let result = engine.scan(temp.path(), &CancellationToken::new()).await;
    assert_eq!(RunStatus::of(&result), RunStatus::CompletedTruncated);
    let scan = result.unwrap();
    assert!(scan.total_files_seen <= 50);
}

#[tokio::test]
async fn caller_cancellation_truncates_too() {
    let temp = TempDir::new().unwrap();
    write(temp.path(), "a.txt", b"a");
    let token = CancellationToken::new();
    token.cancel();

    let scan = engine(PolicyConfig::default())
        .scan(temp.path(), &token)
        .await
        .unwrap();
    assert!(scan.is_truncated());
}

#[tokio::test]
async fn invalid_root_fails_the_run() {
    let temp = TempDir::new().unwrap();
    let file = write(temp.path(), "plain.txt", b"x");
    let engine = engine(PolicyConfig::default());
    let token = CancellationToken::new();

    let missing = engine.scan(&temp.path().join("nope"), &token).await;
    assert!(matches!(missing, Err(EngineError::InvalidRoot { .. })));
    assert_eq!(RunStatus::of(&missing), RunStatus::Failed);

    let not_dir = engine.scan(&file, &token).await;
    assert!(matches!(not_dir, Err(EngineError::RootNotDirectory(_))));
}

#[tokio::test]
async fn quick_mode_caps_depth() {
    let temp = TempDir::new().unwrap();
    write(temp.path(), "one.txt", b"1");
    write(temp.path(), "a/b/three.txt", b"3");
    write(temp.path(), "a/b/c/d/five.txt", b"5");

    let scan = engine(PolicyConfig {
        quick_mode: true,
        ..PolicyConfig::default()
    })
    .scan(temp.path(), &CancellationToken::new())
    .await
    .unwrap();

    let names: Vec<_> = scan
        .candidate_actions
        .iter()
        .map(|a| a.target_path.clone())
        .collect();
    assert!(names.is_empty());
    assert_eq!(scan.total_files_seen, 2);
}

#[test]
fn invalid_exclude_glob_is_rejected_up_front() {
    let policy = PolicyConfig {
        exclude_patterns: vec!["[".into()],
        ..PolicyConfig::default()
    };
    assert!(matches!(
        ReclaimEngine::new(policy, EngineConfig::default(), &rules()),
        Err(EngineError::ExcludePattern { .. })
    ));
}
