use std::fs;
use std::path::Path;

/// Last gate rule: a per-path check supplied by the embedding application.
/// `Err` carries the reason shown in the gate review.
pub trait SignatureCheck: Send + Sync {
    fn validate(&self, path: &Path) -> Result<(), String>;
}

/// Default check: the target must still be a regular file (not a symlink)
/// and, on unix, be owned by the effective user.
#[derive(Debug, Default, Clone, Copy)]
pub struct OwnershipCheck;

impl SignatureCheck for OwnershipCheck {
    fn validate(&self, path: &Path) -> Result<(), String> {
        let metadata =
            fs::symlink_metadata(path).map_err(|e| format!("cannot stat target: {}", e))?;
        if metadata.file_type().is_symlink() {
            return Err("target is a symbolic link".into());
        }
        if !metadata.is_file() {
            return Err("target is no longer a regular file".into());
        }
        owner_matches(&metadata)
    }
}

#[cfg(unix)]
fn owner_matches(metadata: &fs::Metadata) -> Result<(), String> {
    use std::os::unix::fs::MetadataExt;

    let euid = unsafe { libc::geteuid() };
    if metadata.uid() != euid {
        return Err(format!(
            "owned by uid {} but running as uid {}",
            metadata.uid(),
            euid
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
fn owner_matches(metadata: &fs::Metadata) -> Result<(), String> {
    if metadata.permissions().readonly() {
        return Err("target is read-only".into());
    }
    Ok(())
}
