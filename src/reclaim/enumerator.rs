// src/reclaim/enumerator.rs

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use globset::GlobSet;
#[cfg(feature = "parallel-scan")]
use rayon::prelude::*;
use walkdir::{DirEntry, WalkDir};

use super::types::FileDescriptor;
use crate::config::{EngineConfig, PolicyConfig};
use crate::error::{EngineError, SkipEvent};
use crate::ops::ScanDeadline;

/// Item produced by the walk.
#[derive(Debug, Clone)]
pub enum WalkItem {
    File(FileDescriptor),
    Skipped(SkipEvent),
}

/// Real identity of a directory, used to break symlink cycles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DirIdentity {
    #[cfg(unix)]
    Inode(u64, u64),
    #[cfg_attr(unix, allow(dead_code))]
    Canonical(PathBuf),
}

fn dir_identity(path: &Path) -> Option<DirIdentity> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        fs::metadata(path)
            .ok()
            .map(|md| DirIdentity::Inode(md.dev(), md.ino()))
    }
    #[cfg(not(unix))]
    {
        fs::canonicalize(path).ok().map(DirIdentity::Canonical)
    }
}

/// Walks one root under a policy. Cheap to clone; every [`spawn`](Self::spawn)
/// starts an independent walk.
#[derive(Debug, Clone)]
pub struct PathEnumerator {
    root: PathBuf,
    excludes: GlobSet,
    max_depth: usize,
    follow_symlinks: bool,
    workers: usize,
    queue_capacity: usize,
}

impl PathEnumerator {
    /// Fails only when the root itself is missing, unreadable or not a directory.
    pub fn new(
        root: &Path,
        policy: &PolicyConfig,
        engine: &EngineConfig,
    ) -> Result<Self, EngineError> {
        let metadata = fs::metadata(root).map_err(|source| EngineError::InvalidRoot {
            path: root.to_path_buf(),
            source,
        })?;
        if !metadata.is_dir() {
            return Err(EngineError::RootNotDirectory(root.to_path_buf()));
        }
        fs::read_dir(root).map_err(|source| EngineError::InvalidRoot {
            path: root.to_path_buf(),
            source,
        })?;
        let root = fs::canonicalize(root).map_err(|source| EngineError::InvalidRoot {
            path: root.to_path_buf(),
            source,
        })?;

        Ok(PathEnumerator {
            root,
            excludes: policy.exclude_matcher()?,
            max_depth: policy.effective_max_depth(),
            follow_symlinks: policy.follow_symlinks,
            workers: engine.workers(),
            queue_capacity: engine.queue_capacity(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Starts the walk off the calling thread. Items arrive through a bounded
    /// queue, so a slow consumer throttles the walkers.
    pub fn spawn(&self, deadline: ScanDeadline) -> Enumeration {
        let (tx, rx) = sync_channel(self.queue_capacity);
        let walk = Arc::new(WalkContext {
            root: self.root.clone(),
            excludes: self.excludes.clone(),
            max_depth: self.max_depth,
            follow_symlinks: self.follow_symlinks,
            deadline,
            visited_dirs: DashMap::new(),
        });
        let root = self.root.clone();
        let workers = self.workers;

        let handle = thread::Builder::new()
            .name("reclaim-enumerator".into())
            .spawn(move || walk.run(&root, workers, tx));
        if let Err(err) = &handle {
            log::warn!("Failed to start enumeration thread: {}", err);
        }

        Enumeration {
            receiver: rx,
            _worker: handle.ok(),
        }
    }
}

/// Lazy stream of walk results. Dropping it stops the walkers at their next send.
pub struct Enumeration {
    receiver: Receiver<WalkItem>,
    _worker: Option<thread::JoinHandle<()>>,
}

impl Iterator for Enumeration {
    type Item = WalkItem;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.recv().ok()
    }
}

impl Enumeration {
    pub fn collect_all(self) -> (Vec<FileDescriptor>, Vec<SkipEvent>) {
        let mut files = Vec::new();
        let mut skipped = Vec::new();
        for item in self {
            match item {
                WalkItem::File(file) => files.push(file),
                WalkItem::Skipped(event) => skipped.push(event),
            }
        }
        (files, skipped)
    }
}

struct WalkContext {
    root: PathBuf,
    excludes: GlobSet,
    max_depth: usize,
    follow_symlinks: bool,
    deadline: ScanDeadline,
    visited_dirs: DashMap<DirIdentity, ()>,
}

impl WalkContext {
    fn run(&self, root: &Path, workers: usize, tx: SyncSender<WalkItem>) {
        if let Some(identity) = dir_identity(root) {
            self.visited_dirs.insert(identity, ());
        }
        if self.max_depth == 0 || self.deadline.is_expired() {
            return;
        }

        let subdirs = match self.list_root(root, &tx) {
            Some(dirs) => dirs,
            None => return,
        };
        if self.max_depth < 2 || subdirs.is_empty() {
            return;
        }

        self.walk_subdirs(subdirs, workers, tx);
    }

    #[cfg(feature = "parallel-scan")]
    fn walk_subdirs(&self, subdirs: Vec<PathBuf>, workers: usize, tx: SyncSender<WalkItem>) {
        match rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("reclaim-walk-{}", i))
            .build()
        {
            Ok(pool) => pool.install(|| {
                subdirs.par_iter().for_each_with(tx, |tx, dir| {
                    if !self.deadline.is_expired() {
                        self.walk_subtree(dir, tx);
                    }
                });
            }),
            Err(err) => {
                log::warn!("Walk pool unavailable ({}), walking serially", err);
                for dir in &subdirs {
                    if !self.walk_subtree(dir, &tx) {
                        break;
                    }
                }
            }
        }
    }

    #[cfg(not(feature = "parallel-scan"))]
    fn walk_subdirs(&self, subdirs: Vec<PathBuf>, _workers: usize, tx: SyncSender<WalkItem>) {
        for dir in &subdirs {
            if !self.walk_subtree(dir, &tx) {
                break;
            }
        }
    }

    /// Emits the root's files and returns its admitted subdirectories, sorted.
    fn list_root(&self, root: &Path, tx: &SyncSender<WalkItem>) -> Option<Vec<PathBuf>> {
        let mut entries: Vec<PathBuf> = Vec::new();
        let reader = match fs::read_dir(root) {
            Ok(reader) => reader,
            Err(err) => {
                let _ = tx.send(WalkItem::Skipped(SkipEvent::path_error(root, err)));
                return Some(Vec::new());
            }
        };
        for entry in reader {
            match entry {
                Ok(entry) => entries.push(entry.path()),
                Err(err) => {
                    if tx
                        .send(WalkItem::Skipped(SkipEvent::path_error(root, err)))
                        .is_err()
                    {
                        return None;
                    }
                }
            }
        }
        entries.sort();

        let mut subdirs = Vec::new();
        for path in entries {
            if self.deadline.is_expired() {
                return None;
            }
            if self.is_excluded(&path) {
                continue;
            }
            let link_meta = match fs::symlink_metadata(&path) {
                Ok(md) => md,
                Err(err) => {
                    if tx
                        .send(WalkItem::Skipped(SkipEvent::path_error(&path, err)))
                        .is_err()
                    {
                        return None;
                    }
                    continue;
                }
            };
            let is_link = link_meta.file_type().is_symlink();
            if is_link && !self.follow_symlinks {
                continue;
            }
            let metadata = if is_link {
                match fs::metadata(&path) {
                    Ok(md) => md,
                    Err(err) => {
                        if tx
                            .send(WalkItem::Skipped(SkipEvent::path_error(&path, err)))
                            .is_err()
                        {
                            return None;
                        }
                        continue;
                    }
                }
            } else {
                link_meta
            };

            if metadata.is_dir() {
                if self.first_visit(&path) {
                    subdirs.push(path);
                }
            } else if metadata.is_file() && !is_link {
                let item = describe(&path, &metadata);
                if tx.send(item).is_err() {
                    return None;
                }
            }
        }
        Some(subdirs)
    }

    /// Walks one top-level subdirectory. Returns false once the run should stop.
    fn walk_subtree(&self, dir: &Path, tx: &SyncSender<WalkItem>) -> bool {
        // `dir` sits at depth 1 below the scan root.
        let walker = WalkDir::new(dir)
            .max_depth(self.max_depth - 1)
            .follow_links(self.follow_symlinks)
            .into_iter()
            .filter_entry(|entry| self.admit(entry));

        for result in walker {
            if self.deadline.is_expired() {
                return false;
            }
            let item = match result {
                Ok(entry) => {
                    if !entry.file_type().is_file() || entry.path_is_symlink() {
                        continue;
                    }
                    match entry.metadata() {
                        Ok(metadata) => describe(entry.path(), &metadata),
                        Err(err) => WalkItem::Skipped(SkipEvent::path_error(entry.path(), err)),
                    }
                }
                Err(err) => {
                    let path = err
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| dir.to_path_buf());
                    log::debug!("Skipping {}: {}", path.display(), err);
                    WalkItem::Skipped(SkipEvent::path_error(path, err))
                }
            };
            if tx.send(item).is_err() {
                return false;
            }
        }
        true
    }

    fn admit(&self, entry: &DirEntry) -> bool {
        if entry.depth() == 0 {
            return true;
        }
        if self.is_excluded(entry.path()) {
            return false;
        }
        if entry.file_type().is_dir() {
            return self.first_visit(entry.path());
        }
        true
    }

    /// Exclude globs see the path below the scan root, never its ancestors.
    fn is_excluded(&self, path: &Path) -> bool {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let excluded = self.excludes.is_match(relative);
        if excluded {
            log::debug!("Excluded {}", path.display());
        }
        excluded
    }

    fn first_visit(&self, dir: &Path) -> bool {
        match dir_identity(dir) {
            Some(identity) => self.visited_dirs.insert(identity, ()).is_none(),
            None => true,
        }
    }
}

fn describe(path: &Path, metadata: &fs::Metadata) -> WalkItem {
    match metadata.modified() {
        Ok(modified) => WalkItem::File(FileDescriptor::new(
            path.to_path_buf(),
            metadata.len(),
            DateTime::<Utc>::from(modified),
        )),
        Err(err) => WalkItem::Skipped(SkipEvent::path_error(
            path,
            format!("modification time unavailable: {}", err),
        )),
    }
}
