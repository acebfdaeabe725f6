mod backup;
mod classifier;
mod cleaner;
pub mod duplicate_detector;
mod engine;
mod enumerator;
pub mod photo_analyzer;
mod report;
mod safety;
pub mod types;

#[cfg(test)]
mod tests;

pub use backup::BackupStore;
pub use classifier::Classifier;
pub use cleaner::{ApplyEntry, ApplyReport, ApplyState, Cleaner, PhotoOptimizer};
pub use duplicate_detector::{
    ContentDigest, ContentHasher, DuplicateDetector, DuplicateScanResult, Sha256Hasher,
};
pub use engine::ReclaimEngine;
pub use enumerator::{Enumeration, PathEnumerator, WalkItem};
pub use photo_analyzer::{PhotoAnalyzer, PhotoEstimate, PhotoFormat, PhotoScanResult};
pub use report::{ReportAggregator, StageOutputs};
pub use safety::{
    ApprovedAction, GateReview, OwnershipCheck, RejectedAction, RejectionReason, SafetyGate,
    SignatureCheck,
};
pub use types::{
    Action, ActionKind, Category, CategoryReport, CategoryRules, CategorySet, DuplicateGroup,
    FileDescriptor, SavingsBasis, ScanResult,
};
