use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytesize::ByteSize;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task;

use super::types::{DuplicateGroup, FileDescriptor};
use crate::config::{EngineConfig, RetentionPolicy};
use crate::error::{EngineError, SkipEvent};
use crate::ops::ScanDeadline;

/// Digest of a file's full content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigest {
    pub hex: String,
    pub bytes_read: u64,
}

/// Streams a file into a collision-resistant digest. Implementations must read
/// in bounded chunks and never hold a whole file in memory.
pub trait ContentHasher: Send + Sync {
    fn hash_file(&self, path: &Path, buffer_bytes: usize) -> io::Result<ContentDigest>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Hasher;

impl ContentHasher for Sha256Hasher {
    fn hash_file(&self, path: &Path, buffer_bytes: usize) -> io::Result<ContentDigest> {
        let mut file = fs::File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; buffer_bytes];
        let mut bytes_read = 0u64;
        loop {
            let n = match file.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            hasher.update(&buffer[..n]);
            bytes_read += n as u64;
        }
        Ok(ContentDigest {
            hex: format!("{:x}", hasher.finalize()),
            bytes_read,
        })
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DuplicateScanResult {
    pub groups: Vec<DuplicateGroup>,
    pub hashed_files: usize,
    pub hashed_bytes: u64,
    pub skipped: Vec<SkipEvent>,
    pub truncated: bool,
}

/// Two-phase duplicate search: exact size buckets, then content hashes inside
/// buckets with at least two members.
pub struct DuplicateDetector {
    hasher: Arc<dyn ContentHasher>,
    workers: usize,
    buffer_bytes: usize,
    retention: RetentionPolicy,
}

impl DuplicateDetector {
    pub fn new(engine: &EngineConfig, retention: RetentionPolicy) -> Self {
        Self {
            hasher: Arc::new(Sha256Hasher),
            workers: engine.workers(),
            buffer_bytes: engine.hash_buffer_bytes(),
            retention,
        }
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn ContentHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    /// Groups indexes into `files` by exact size, dropping empty files and
    /// singleton buckets. Buckets come back largest size first.
    pub fn size_buckets(files: &[FileDescriptor]) -> Vec<(u64, Vec<usize>)> {
        let buckets: DashMap<u64, Vec<usize>> = DashMap::new();
        files
            .par_iter()
            .enumerate()
            .filter(|(_, file)| file.size > 0)
            .for_each(|(idx, file)| {
                buckets.entry(file.size).or_insert_with(Vec::new).push(idx);
            });

        let mut shared: Vec<(u64, Vec<usize>)> = buckets
            .into_iter()
            .filter(|(_, members)| members.len() > 1)
            .map(|(size, mut members)| {
                members.sort_by(|a, b| files[*a].path.cmp(&files[*b].path));
                (size, members)
            })
            .collect();
        shared.sort_by(|a, b| b.0.cmp(&a.0));
        shared
    }

    pub async fn find_duplicates(
        &self,
        files: Arc<Vec<FileDescriptor>>,
        deadline: &ScanDeadline,
    ) -> Result<DuplicateScanResult, EngineError> {
        let mut result = DuplicateScanResult::default();
        if files.len() < 2 {
            return Ok(result);
        }

        let bucket_input = files.clone();
        let buckets = task::spawn_blocking(move || {
            let buckets = Self::size_buckets(&bucket_input);
            fold_hard_links(&bucket_input, buckets)
        })
        .await?;
        let candidates: Vec<usize> = buckets
            .into_iter()
            .flat_map(|(_, members)| members)
            .collect();
        if candidates.is_empty() {
            return Ok(result);
        }
        log::debug!(
            "Hashing {} of {} files sharing a size ({})",
            candidates.len(),
            files.len(),
            ByteSize(candidates.iter().map(|idx| files[*idx].size).sum())
        );

        // Workers only hash; this loop alone owns the grouping map.
        let mut by_content: BTreeMap<(u64, String), Vec<usize>> = BTreeMap::new();
        let mut processed = 0usize;
        {
            let hasher = self.hasher.clone();
            let buffer_bytes = self.buffer_bytes;
            let mut hashed = stream::iter(candidates.iter().copied())
                .take_while(|_| futures::future::ready(!deadline.is_expired()))
                .map(|idx| {
                    let hasher = hasher.clone();
                    let path = files[idx].path.clone();
                    task::spawn_blocking(move || (idx, hasher.hash_file(&path, buffer_bytes)))
                })
                .buffer_unordered(self.workers);

            while let Some(joined) = hashed.next().await {
                let (idx, outcome) = joined?;
                processed += 1;
                let file = &files[idx];
                match outcome {
                    Ok(digest) if digest.bytes_read == file.size => {
                        result.hashed_files += 1;
                        result.hashed_bytes += digest.bytes_read;
                        by_content
                            .entry((file.size, digest.hex))
                            .or_insert_with(Vec::new)
                            .push(idx);
                    }
                    Ok(digest) => {
                        log::debug!(
                            "{} changed size while hashing ({} -> {})",
                            file.path.display(),
                            file.size,
                            digest.bytes_read
                        );
                        result.skipped.push(SkipEvent::hash_error(
                            &file.path,
                            format!(
                                "size changed during hashing: expected {} bytes, read {}",
                                file.size, digest.bytes_read
                            ),
                        ));
                    }
                    Err(err) => {
                        log::debug!(
                            "Unable to hash {} during duplicate detection: {}",
                            file.path.display(),
                            err
                        );
                        result.skipped.push(SkipEvent::hash_error(&file.path, err));
                    }
                }
            }
        }

        if processed < candidates.len() {
            result.truncated = true;
            log::info!(
                "Duplicate hashing stopped at deadline after {} of {} candidates",
                processed,
                candidates.len()
            );
        }

        for ((size, hash), members) in by_content {
            if members.len() < 2 {
                continue;
            }
            let members: Vec<FileDescriptor> =
                members.into_iter().map(|idx| files[idx].clone()).collect();
            result.groups.push(self.build_group(hash, size, members));
        }
        result
            .groups
            .sort_by(|a, b| a.members[0].path.cmp(&b.members[0].path));
        result.skipped.sort();

        Ok(result)
    }

    fn build_group(
        &self,
        content_hash: String,
        size: u64,
        mut members: Vec<FileDescriptor>,
    ) -> DuplicateGroup {
        members.sort_by(|a, b| a.path.cmp(&b.path));
        let retained = retained_member(&members, self.retention);
        let total_reclaimable = size * (members.len() as u64 - 1);
        DuplicateGroup {
            content_hash,
            size,
            members,
            retained,
            total_reclaimable,
        }
    }
}

/// Keeps the first path per (device, inode) in each bucket, then drops buckets
/// left with a single member. Members that cannot be stat'ed stay in so the
/// hashing stage records them.
#[cfg(unix)]
fn fold_hard_links(
    files: &[FileDescriptor],
    buckets: Vec<(u64, Vec<usize>)>,
) -> Vec<(u64, Vec<usize>)> {
    use std::collections::HashSet;
    use std::os::unix::fs::MetadataExt;

    buckets
        .into_iter()
        .filter_map(|(size, members)| {
            let mut inodes = HashSet::new();
            let kept: Vec<usize> = members
                .into_iter()
                .filter(|idx| {
                    let path = &files[*idx].path;
                    match fs::metadata(path) {
                        Ok(md) => {
                            let first = inodes.insert((md.dev(), md.ino()));
                            if !first {
                                log::debug!("{} is a hard link, not a copy", path.display());
                            }
                            first
                        }
                        Err(_) => true,
                    }
                })
                .collect();
            (kept.len() > 1).then_some((size, kept))
        })
        .collect()
}

#[cfg(not(unix))]
fn fold_hard_links(
    _files: &[FileDescriptor],
    buckets: Vec<(u64, Vec<usize>)>,
) -> Vec<(u64, Vec<usize>)> {
    buckets
}

/// `members` must be sorted by path and non-empty.
fn retained_member(members: &[FileDescriptor], retention: RetentionPolicy) -> PathBuf {
    let keep = match retention {
        RetentionPolicy::LexicalFirst => members.first(),
        RetentionPolicy::OldestModified => members
            .iter()
            .min_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path))),
    };
    keep.map(|m| m.path.clone()).unwrap_or_default()
}
