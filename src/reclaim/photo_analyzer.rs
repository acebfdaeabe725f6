use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::ImageFormat;
use serde::{Deserialize, Serialize};
use tokio::task;

use super::types::{Category, FileDescriptor, SavingsBasis};
use crate::config::PolicyConfig;
use crate::error::EngineError;
use crate::ops::ScanDeadline;

const SNIFF_BYTES: usize = 32;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PhotoFormat {
    Jpeg,
    Png,
    Gif,
    Bmp,
    Tiff,
    Webp,
    Heif,
    Raw,
    Unknown,
}

impl PhotoFormat {
    /// Share of the file typically recovered by lossless recompression or
    /// re-encoding into a modern container, in parts per thousand.
    pub fn savings_permille(self) -> u64 {
        match self {
            PhotoFormat::Bmp => 600,
            PhotoFormat::Tiff => 450,
            PhotoFormat::Png => 250,
            PhotoFormat::Jpeg => 150,
            PhotoFormat::Gif => 100,
            PhotoFormat::Webp | PhotoFormat::Heif => 50,
            // Camera originals are left alone.
            PhotoFormat::Raw | PhotoFormat::Unknown => 0,
        }
    }

    pub fn from_extension(path: &Path) -> PhotoFormat {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "jpg" | "jpeg" | "jpe" => PhotoFormat::Jpeg,
            "png" => PhotoFormat::Png,
            "gif" => PhotoFormat::Gif,
            "bmp" | "dib" => PhotoFormat::Bmp,
            "tif" | "tiff" => PhotoFormat::Tiff,
            "webp" => PhotoFormat::Webp,
            "heic" | "heif" | "avif" => PhotoFormat::Heif,
            "raw" | "cr2" | "cr3" | "nef" | "arw" | "dng" | "orf" | "rw2" => PhotoFormat::Raw,
            _ => PhotoFormat::Unknown,
        }
    }

    fn from_image_format(format: ImageFormat) -> Option<PhotoFormat> {
        match format {
            ImageFormat::Jpeg => Some(PhotoFormat::Jpeg),
            ImageFormat::Png => Some(PhotoFormat::Png),
            ImageFormat::Gif => Some(PhotoFormat::Gif),
            ImageFormat::Bmp => Some(PhotoFormat::Bmp),
            ImageFormat::WebP => Some(PhotoFormat::Webp),
            ImageFormat::Avif => Some(PhotoFormat::Heif),
            // TIFF magic also fronts most raw formats, so let the extension decide.
            _ => None,
        }
    }
}

/// Heuristic savings for one photo. Always `SavingsBasis::Estimated`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhotoEstimate {
    pub path: PathBuf,
    pub format: PhotoFormat,
    pub size: u64,
    pub savings_permille: u64,
    pub estimated_savings: u64,
    pub basis: SavingsBasis,
}

#[derive(Debug, Default, Clone)]
pub struct PhotoScanResult {
    /// Sorted by path; photos with no expected savings are omitted.
    pub estimates: Vec<PhotoEstimate>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct PhotoAnalyzer {
    sniff_headers: bool,
}

impl PhotoAnalyzer {
    pub fn new(policy: &PolicyConfig) -> Self {
        PhotoAnalyzer {
            sniff_headers: !policy.quick_mode,
        }
    }

    pub fn estimate(&self, file: &FileDescriptor) -> Option<PhotoEstimate> {
        let format = if self.sniff_headers {
            sniff(&file.path).unwrap_or_else(|| PhotoFormat::from_extension(&file.path))
        } else {
            PhotoFormat::from_extension(&file.path)
        };
        let permille = format.savings_permille();
        // permille <= 1000, so the quotient always fits back into u64.
        let estimated_savings = (u128::from(file.size) * u128::from(permille) / 1000) as u64;
        if estimated_savings == 0 {
            return None;
        }
        Some(PhotoEstimate {
            path: file.path.clone(),
            format,
            size: file.size,
            savings_permille: permille,
            estimated_savings,
            basis: SavingsBasis::Estimated,
        })
    }

    pub async fn analyze(
        &self,
        files: Arc<Vec<FileDescriptor>>,
        deadline: &ScanDeadline,
    ) -> Result<PhotoScanResult, EngineError> {
        let analyzer = *self;
        let deadline = deadline.clone();
        let result = task::spawn_blocking(move || {
            let mut result = PhotoScanResult::default();
            for file in files.iter().filter(|f| f.categories.contains(Category::Photo)) {
                if deadline.is_expired() {
                    result.truncated = true;
                    break;
                }
                if let Some(estimate) = analyzer.estimate(file) {
                    result.estimates.push(estimate);
                }
            }
            result.estimates.sort_by(|a, b| a.path.cmp(&b.path));
            result
        })
        .await?;
        Ok(result)
    }
}

fn sniff(path: &Path) -> Option<PhotoFormat> {
    let mut header = [0u8; SNIFF_BYTES];
    let read = fs::File::open(path).and_then(|mut f| f.read(&mut header));
    match read {
        Ok(n) if n > 0 => image::guess_format(&header[..n])
            .ok()
            .and_then(PhotoFormat::from_image_format),
        Ok(_) => None,
        Err(err) => {
            log::debug!("Header sniff failed for {}: {}", path.display(), err);
            None
        }
    }
}
