use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use chrono::Local;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::duplicate_detector::{ContentHasher, Sha256Hasher};
use crate::error::ApplyError;

/// Per-run backup area: `<base>/<run id>/<mirrored absolute source path>`.
#[derive(Debug, Clone)]
pub struct BackupStore {
    run_dir: PathBuf,
    buffer_bytes: usize,
}

impl BackupStore {
    pub fn new(base: &Path, run_id: Uuid, buffer_bytes: usize) -> Self {
        BackupStore {
            run_dir: base.join(run_id.to_string()),
            buffer_bytes: buffer_bytes.max(4096),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Where `source` lands, before collision handling.
    pub fn location_for(&self, source: &Path) -> PathBuf {
        let mut target = self.run_dir.clone();
        for component in source.components() {
            match component {
                Component::Prefix(prefix) => {
                    let drive: String = prefix
                        .as_os_str()
                        .to_string_lossy()
                        .chars()
                        .filter(|c| c.is_ascii_alphanumeric())
                        .collect();
                    target.push(drive);
                }
                Component::Normal(part) => target.push(part),
                Component::RootDir | Component::CurDir | Component::ParentDir => {}
            }
        }
        target
    }

    /// Copies `source` into the store and verifies the copy. The source is
    /// never touched; a partial copy is removed on failure.
    pub fn backup(&self, source: &Path, token: &CancellationToken) -> Result<PathBuf, ApplyError> {
        let target = unique_target(self.location_for(source));
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(ApplyError::BackupCopy)?;
        }

        let outcome = self
            .copy_hashed(source, &target, token)
            .and_then(|(len, digest)| self.verify(source, &target, len, &digest));
        if outcome.is_err() {
            if let Err(err) = fs::remove_file(&target) {
                if err.kind() != io::ErrorKind::NotFound {
                    log::warn!(
                        "Failed to remove partial backup {}: {}",
                        target.display(),
                        err
                    );
                }
            }
        }
        outcome.map(|_| target)
    }

    fn copy_hashed(
        &self,
        source: &Path,
        target: &Path,
        token: &CancellationToken,
    ) -> Result<(u64, String), ApplyError> {
        let mut reader = fs::File::open(source).map_err(ApplyError::BackupCopy)?;
        let mut writer = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(target)
            .map_err(ApplyError::BackupCopy)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; self.buffer_bytes];
        let mut copied = 0u64;
        loop {
            if token.is_cancelled() {
                return Err(ApplyError::Cancelled);
            }
            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(ApplyError::BackupCopy(err)),
            };
            writer
                .write_all(&buffer[..n])
                .map_err(ApplyError::BackupCopy)?;
            hasher.update(&buffer[..n]);
            copied += n as u64;
        }
        writer.sync_all().map_err(ApplyError::BackupCopy)?;
        Ok((copied, format!("{:x}", hasher.finalize())))
    }

    /// Length and digest of the copy must match what was read from the
    /// source, and the source must not have changed length meanwhile.
    fn verify(
        &self,
        source: &Path,
        target: &Path,
        copied: u64,
        source_digest: &str,
    ) -> Result<(), ApplyError> {
        let source_len = fs::metadata(source)
            .map_err(|e| ApplyError::BackupVerify(format!("cannot stat source: {}", e)))?
            .len();
        if source_len != copied {
            return Err(ApplyError::BackupVerify(format!(
                "source changed during copy ({} bytes copied, now {})",
                copied, source_len
            )));
        }
        let copy = Sha256Hasher
            .hash_file(target, self.buffer_bytes)
            .map_err(|e| ApplyError::BackupVerify(format!("cannot read copy: {}", e)))?;
        if copy.bytes_read != copied || copy.hex != source_digest {
            return Err(ApplyError::BackupVerify("copy does not match source".into()));
        }
        Ok(())
    }
}

fn unique_target(target: PathBuf) -> PathBuf {
    if !target.exists() {
        return target;
    }
    let parent = target.parent().map(Path::to_path_buf).unwrap_or_default();
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let (base, ext) = split_name_ext(&name);
    let ts = Local::now().format("%Y%m%d-%H%M%S").to_string();
    let mut counter = 1u32;
    loop {
        let candidate = if ext.is_empty() {
            format!("{} ({}-{})", base, ts, counter)
        } else {
            format!("{} ({}-{}).{}", base, ts, counter, ext)
        };
        let path = parent.join(candidate);
        if !path.exists() {
            return path;
        }
        counter += 1;
    }
}

fn split_name_ext(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx + 1..]),
        _ => (name, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn mirrors_absolute_path_under_run_dir() {
        let run = Uuid::new_v4();
        let store = BackupStore::new(Path::new("/backups"), run, 1024);
        assert_eq!(
            store.location_for(Path::new("/home/u/big.iso")),
            PathBuf::from(format!("/backups/{}/home/u/big.iso", run))
        );
    }

    #[test]
    fn backup_copies_and_keeps_source() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("data").join("report.pdf");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, vec![7u8; 10_000]).unwrap();

        let store = BackupStore::new(&temp.path().join("bk"), Uuid::new_v4(), 4096);
        let token = CancellationToken::new();
        let first = store.backup(&source, &token).unwrap();
        assert_eq!(fs::read(&first).unwrap(), fs::read(&source).unwrap());
        assert!(first.starts_with(store.run_dir()));

        let second = store.backup(&source, &token).unwrap();
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("-1).pdf"));
        assert!(source.exists());
    }

    #[test]
    fn cancelled_backup_leaves_no_partial_copy() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("f.bin");
        fs::write(&source, b"abc").unwrap();
        let store = BackupStore::new(&temp.path().join("bk"), Uuid::new_v4(), 4096);
        let token = CancellationToken::new();
        token.cancel();

        assert!(matches!(
            store.backup(&source, &token),
            Err(ApplyError::Cancelled)
        ));
        assert!(!store.location_for(&source).exists());
    }

    #[test]
    fn split_keeps_dotfiles_whole() {
        assert_eq!(split_name_ext("a.tar.gz"), ("a.tar", "gz"));
        assert_eq!(split_name_ext(".bashrc"), (".bashrc", ""));
    }
}
