use std::path::Path;
use std::sync::Arc;

use bytesize::ByteSize;
use chrono::Utc;
use rayon::prelude::*;
use tokio::task;
use tokio_util::sync::CancellationToken;

use super::classifier::Classifier;
use super::cleaner::{ApplyReport, Cleaner, PhotoOptimizer};
use super::duplicate_detector::{ContentHasher, DuplicateDetector};
use super::enumerator::PathEnumerator;
use super::photo_analyzer::PhotoAnalyzer;
use super::report::{ReportAggregator, StageOutputs};
use super::safety::{GateReview, SafetyGate, SignatureCheck};
use super::types::{CategoryRules, ScanResult};
use crate::config::{EngineConfig, PolicyConfig};
use crate::error::EngineError;
use crate::ops::{OperationMetrics, ScanDeadline};

/// Runs the scan pipeline and the gated apply stage for one policy.
///
/// Collaborators default to SHA-256 hashing, the ownership check, and no
/// photo optimizer.
pub struct ReclaimEngine {
    policy: PolicyConfig,
    engine: EngineConfig,
    classifier: Classifier,
    hasher: Option<Arc<dyn ContentHasher>>,
    validator: Option<Arc<dyn SignatureCheck>>,
    optimizer: Option<Arc<dyn PhotoOptimizer>>,
}

impl ReclaimEngine {
    pub fn new(
        policy: PolicyConfig,
        engine: EngineConfig,
        rules: &CategoryRules,
    ) -> Result<Self, EngineError> {
        policy.validate()?;
        Ok(ReclaimEngine {
            classifier: Classifier::new(rules)?,
            policy,
            engine,
            hasher: None,
            validator: None,
            optimizer: None,
        })
    }

    /// Uses the embedded category tables (or the env override).
    pub fn with_default_rules(policy: PolicyConfig, engine: EngineConfig) -> Result<Self, EngineError> {
        Self::new(policy, engine, &CategoryRules::load()?)
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn ContentHasher>) -> Self {
        self.hasher = Some(hasher);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn SignatureCheck>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_optimizer(mut self, optimizer: Arc<dyn PhotoOptimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// Enumerate, classify, then deduplicate and estimate photos side by side.
    /// Only an invalid root fails the run; timeouts and cancellation through
    /// `token` yield a truncated result.
    pub async fn scan(&self, root: &Path, token: &CancellationToken) -> Result<ScanResult, EngineError> {
        let started_at = Utc::now();
        let mut metrics = OperationMetrics::new(format!("scan {}", root.display()));

        let enumerator = PathEnumerator::new(root, &self.policy, &self.engine)?;
        let root_path = enumerator.root().to_path_buf();
        let deadline = ScanDeadline::new(self.policy.scan_timeout(), token);

        let walk = enumerator.spawn(deadline.clone());
        let (files, walk_skipped) = task::spawn_blocking(move || walk.collect_all()).await?;
        let walk_truncated = deadline.was_hit();
        metrics.checkpoint("enumerate");

        let classifier = self.classifier.clone();
        let policy = self.policy.clone();
        let now = Utc::now();
        let classify_root = root_path.clone();
        let files = task::spawn_blocking(move || {
            let mut files: Vec<_> = files
                .into_par_iter()
                .map(|file| {
                    let tags = classifier.classify(&file, &classify_root, &policy, now);
                    file.with_categories(tags)
                })
                .collect();
            files.sort_by(|a, b| a.path.cmp(&b.path));
            files
        })
        .await?;
        let files = Arc::new(files);
        metrics.checkpoint("classify");

        let mut detector = DuplicateDetector::new(&self.engine, self.policy.retention);
        if let Some(hasher) = &self.hasher {
            detector = detector.with_hasher(hasher.clone());
        }
        let photos = PhotoAnalyzer::new(&self.policy);
        let (duplicates, photos) = tokio::join!(
            detector.find_duplicates(files.clone(), &deadline),
            photos.analyze(files.clone(), &deadline)
        );
        let (duplicates, photos) = (duplicates?, photos?);
        metrics.checkpoint("analyze");

        let result = ReportAggregator::new(&self.policy).aggregate(StageOutputs {
            root_path,
            started_at,
            finished_at: Utc::now(),
            files: &files,
            walk_skipped,
            walk_truncated,
            duplicates,
            photos,
        });
        metrics.checkpoint("aggregate");

        log::info!(
            "Scanned {} files ({}) under {}: {} duplicate groups, {} candidate actions, {} reclaimable, {} skipped{}",
            result.total_files_seen,
            ByteSize(result.total_bytes_seen),
            result.root_path.display(),
            result.duplicate_groups.len(),
            result.candidate_actions.len(),
            ByteSize(result.actionable_bytes),
            result.skipped.len(),
            if result.is_truncated() { " (truncated)" } else { "" }
        );
        metrics.complete().log_summary();

        Ok(result)
    }

    pub fn review(&self, scan: &ScanResult) -> GateReview {
        let mut gate = SafetyGate::new(&self.policy);
        if let Some(validator) = &self.validator {
            gate = gate.with_validator(validator.clone());
        }
        gate.review(&scan.candidate_actions, Utc::now())
    }

    pub async fn apply(&self, review: GateReview, token: &CancellationToken) -> ApplyReport {
        let mut cleaner = Cleaner::new(&self.policy, &self.engine);
        if let Some(optimizer) = &self.optimizer {
            cleaner = cleaner.with_optimizer(optimizer.clone());
        }
        cleaner.apply(review, token).await
    }
}
